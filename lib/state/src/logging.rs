// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide logging init.
//!
//! Filters come from the `FAIR_LOG` environment variable (standard
//! `tracing_subscriber::EnvFilter` syntax, default `info`). Set
//! `FAIR_LOG_JSONL=1` for line-delimited JSON output. Safe to call from
//! multiple entry points; only the first call installs the subscriber.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "FAIR_LOG";

/// ENV used to switch to JSONL output.
const JSONL_ENV: &str = "FAIR_LOG_JSONL";

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

        let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if jsonl {
            builder.json().init();
        } else {
            builder.init();
        }
    });
}
