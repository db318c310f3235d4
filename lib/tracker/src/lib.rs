// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Probabilistic per-client fairness tracker.
//!
//! Each tracker instance hashes a client identifier into one bucket per row
//! of an L×M counting structure and maintains a throttling probability per
//! bucket: failures push it up, successes pull it down, and inactivity
//! decays it exponentially. Taking the minimum across L independent rows
//! drives the false-positive rate from single-row collisions toward `p^L`.
//!
//! Two structures are live at any time: *main* answers queries, *secondary*
//! (the next time window) is pre-warmed by dual writes so a rotation never
//! hands misbehaving clients a fresh start. When a state service address is
//! configured, every bucket mutation is streamed out as a delta and the
//! fleet-wide aggregate is blended back in by blind overwrite.
//!
//! ```rust,ignore
//! use fairshare_tracker::{FairnessTracker, FairnessTrackerConfig, Outcome};
//!
//! let tracker = FairnessTracker::new(FairnessTrackerConfig::default())?;
//! let decision = tracker.register_request(b"client-1");
//! if !decision.should_throttle {
//!     // ... serve the request ...
//!     tracker.report_outcome(b"client-1", Outcome::Success);
//! }
//! ```

pub use anyhow::{Error, Result};

pub mod clock;
pub mod config;
pub mod service;
pub mod structure;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, FairnessTrackerConfig, FinalProbability};
pub use service::{RegisterRequest, RegisterResponse, ReportRequest, Service, ServiceError};
pub use structure::{CountingStructure, Outcome, RegisterResult, ResultStats, Sketch};
pub use tracker::FairnessTracker;
