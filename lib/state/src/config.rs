// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! State service configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};

/// Configuration for the state aggregation service.
#[derive(Clone, Debug)]
pub struct StateServiceConfig {
    /// gRPC listen address.
    pub listen_address: SocketAddr,
    /// Seed window duration; must match the trackers' rotation frequency or
    /// peers will disagree on seeds.
    pub seed_window: Duration,
    /// How long a seed outlives its window before the sweep removes it.
    pub seed_eviction_ttl: Duration,
    /// Eviction sweep interval.
    pub eviction_tick: Duration,
}

impl Default for StateServiceConfig {
    fn default() -> Self {
        Self {
            listen_address: ([0, 0, 0, 0], 50051).into(),
            seed_window: Duration::from_secs(300),
            seed_eviction_ttl: Duration::from_secs(900),
            eviction_tick: Duration::from_secs(60),
        }
    }
}

impl StateServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.seed_window.as_millis() == 0 {
            bail!("seed window must be at least 1ms");
        }
        if self.seed_eviction_ttl < self.seed_window {
            bail!("seed eviction TTL must be at least one seed window");
        }
        if self.eviction_tick.as_millis() == 0 {
            bail!("eviction tick must be at least 1ms");
        }
        Ok(())
    }
}
