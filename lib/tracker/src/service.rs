// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport-agnostic facade over the tracker.
//!
//! Frontends (HTTP today) talk to this layer in DTOs so they stay pure
//! transport: decode, call, encode, map [`ServiceError`] to a status code.

use serde::{Deserialize, Serialize};

use crate::structure::{Outcome, ResultStats};
use crate::tracker::FairnessTracker;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid outcome: must be 'success' or 'failure'")]
    InvalidOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub should_throttle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ResultStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub client_id: String,
    pub outcome: String,
}

pub struct Service {
    tracker: FairnessTracker,
}

impl Service {
    pub fn new(tracker: FairnessTracker) -> Self {
        Self { tracker }
    }

    pub fn register(&self, request: RegisterRequest) -> RegisterResponse {
        let result = self.tracker.register_request(request.client_id.as_bytes());
        RegisterResponse {
            should_throttle: result.should_throttle,
            stats: result.stats,
        }
    }

    pub fn report(&self, request: ReportRequest) -> Result<(), ServiceError> {
        let outcome: Outcome = request
            .outcome
            .parse()
            .map_err(|_| ServiceError::InvalidOutcome)?;
        self.tracker.report_outcome(request.client_id.as_bytes(), outcome);
        Ok(())
    }

    pub fn close(&self) {
        self.tracker.close();
    }
}
