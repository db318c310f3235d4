// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP frontend binary for the fairness tracker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use fairshare_http::router;
use fairshare_state::logging;
use fairshare_tracker::{FairnessTracker, FairnessTrackerConfig, Service};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host for the HTTP service
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port number for the HTTP service
    #[arg(short, long, default_value = "8080", env = "PORT")]
    port: u16,

    /// Rotation window in seconds
    #[arg(long, default_value = "300", env = "FAIR_ROTATION_FREQUENCY_SECS")]
    rotation_frequency_secs: u64,

    /// Address of the state service (host:port); omit for local-only mode
    #[arg(long, env = "FAIR_STATE_SERVICE_ADDRESS")]
    state_service_address: Option<String>,

    /// Attach per-row probabilities to every register response
    #[arg(long, default_value = "false")]
    include_stats: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut builder = FairnessTrackerConfig::builder()
        .rotation_frequency(Duration::from_secs(args.rotation_frequency_secs))
        .include_stats(args.include_stats);
    if let Some(addr) = &args.state_service_address {
        builder = builder.state_service_address(addr.clone());
    }
    let config = builder.build()?;

    let tracker = FairnessTracker::new(config)?;
    let service = Arc::new(Service::new(tracker));
    let app = router(service.clone());

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!(%addr, "starting fairshare HTTP frontend");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    service.close();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
}
