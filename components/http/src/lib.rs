// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Router and handlers for the fairshare HTTP frontend.
//!
//! The interesting work happens in the tracker library; this layer is pure
//! transport: decode the DTO, call the service facade, map errors to status
//! codes with a JSON error body.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use fairshare_tracker::{
    RegisterRequest, RegisterResponse, ReportRequest, Service, ServiceError,
};

type ErrorBody = (StatusCode, Json<Value>);

fn error_body(status: StatusCode, message: impl Into<String>) -> ErrorBody {
    (status, Json(json!({ "error": message.into() })))
}

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/report", post(report))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(service)
}

async fn register(
    State(service): State<Arc<Service>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ErrorBody> {
    if request.client_id.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "client_id is required"));
    }
    Ok(Json(service.register(request)))
}

async fn report(
    State(service): State<Arc<Service>>,
    Json(request): Json<ReportRequest>,
) -> Result<StatusCode, ErrorBody> {
    if request.client_id.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "client_id is required"));
    }
    match service.report(request) {
        Ok(()) => Ok(StatusCode::OK),
        Err(error @ ServiceError::InvalidOutcome) => {
            Err(error_body(StatusCode::BAD_REQUEST, error.to_string()))
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz() -> &'static str {
    "ready"
}
