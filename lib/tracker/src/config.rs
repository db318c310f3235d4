// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracker configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;

/// Default decay rate per millisecond, ≈ ln 2 / 30 000: an untouched bucket
/// loses half its probability every 30 seconds.
pub const DEFAULT_LAMBDA: f64 = 2.31e-5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("m (columns per row) must be at least 1")]
    ZeroColumns,
    #[error("l (rows) must be at least 1")]
    ZeroRows,
    #[error("pi must be in (0, 1], got {0}")]
    IncrementOutOfRange(f64),
    #[error("pd must be in (0, 1], got {0}")]
    DecrementOutOfRange(f64),
    #[error("lambda must be non-negative, got {0}")]
    NegativeLambda(f64),
    #[error("rotation frequency must be at least 1ms")]
    ZeroRotationFrequency,
    #[error("{0}")]
    Builder(String),
}

/// Combines the per-row bucket probabilities into the final throttling
/// probability.
///
/// The default takes the minimum: a client is only throttled when every row
/// agrees it is bad, which suppresses false positives from single-row hash
/// collisions.
#[derive(Clone)]
pub enum FinalProbability {
    Min,
    Custom(Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>),
}

impl FinalProbability {
    pub fn combine(&self, probabilities: &[f64]) -> f64 {
        match self {
            Self::Min => probabilities.iter().copied().fold(1.0, f64::min),
            Self::Custom(combine) => combine(probabilities),
        }
    }
}

impl Default for FinalProbability {
    fn default() -> Self {
        Self::Min
    }
}

impl fmt::Debug for FinalProbability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Min => write!(f, "Min"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Parameters of the counting structure and its rotation.
#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct FairnessTrackerConfig {
    /// Columns per row.
    #[builder(default = "1024")]
    pub m: u32,

    /// Independent hash rows.
    #[builder(default = "3")]
    pub l: u32,

    /// Probability added to each bucket per reported failure.
    #[builder(default = "0.01")]
    pub pi: f64,

    /// Probability subtracted from each bucket per reported success.
    #[builder(default = "0.005")]
    pub pd: f64,

    /// Exponential decay rate per millisecond of inactivity.
    #[builder(default = "DEFAULT_LAMBDA")]
    pub lambda: f64,

    /// Rotation interval; also the seed window duration.
    #[builder(default = "Duration::from_secs(300)")]
    pub rotation_frequency: Duration,

    /// Attach per-row probabilities and the final probability to every
    /// register result. Useful for debugging, slightly more allocation.
    #[builder(default = "false")]
    pub include_stats: bool,

    #[builder(default)]
    pub final_probability: FinalProbability,

    /// Address of the state service (`host:port`). `None` runs local-only.
    #[builder(setter(into, strip_option), default)]
    pub state_service_address: Option<String>,
}

impl Default for FairnessTrackerConfig {
    fn default() -> Self {
        Self {
            m: 1024,
            l: 3,
            pi: 0.01,
            pd: 0.005,
            lambda: DEFAULT_LAMBDA,
            rotation_frequency: Duration::from_secs(300),
            include_stats: false,
            final_probability: FinalProbability::default(),
            state_service_address: None,
        }
    }
}

impl FairnessTrackerConfig {
    pub fn builder() -> FairnessTrackerConfigBuilder {
        FairnessTrackerConfigBuilder::default()
    }

    /// Size the structure for an expected number of concurrently active
    /// client flows: columns at twice the estimate (rounded up to a power of
    /// two) keep the per-row collision rate low while the default three rows
    /// drive the combined false-positive rate toward its cube.
    pub fn tuned(expected_client_flows: u64) -> Self {
        let m = (expected_client_flows.max(1).saturating_mul(2))
            .next_power_of_two()
            .min(1 << 20) as u32;
        Self {
            m,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.m == 0 {
            return Err(ConfigError::ZeroColumns);
        }
        if self.l == 0 {
            return Err(ConfigError::ZeroRows);
        }
        if self.pi <= 0.0 || self.pi > 1.0 {
            return Err(ConfigError::IncrementOutOfRange(self.pi));
        }
        if self.pd <= 0.0 || self.pd > 1.0 {
            return Err(ConfigError::DecrementOutOfRange(self.pd));
        }
        if self.lambda < 0.0 {
            return Err(ConfigError::NegativeLambda(self.lambda));
        }
        if self.rotation_frequency.as_millis() == 0 {
            return Err(ConfigError::ZeroRotationFrequency);
        }
        Ok(())
    }
}

impl FairnessTrackerConfigBuilder {
    pub fn build(self) -> Result<FairnessTrackerConfig, ConfigError> {
        let config = self
            .build_internal()
            .map_err(|e| ConfigError::Builder(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
