// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! State service binary: aggregation store + broadcast hub + sync stream
//! endpoint, all parked on one cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use fairshare_state::{logging, service, Hub, InMemoryStore, StateServiceConfig, Store};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// gRPC listen address
    #[arg(long, default_value = "0.0.0.0:50051")]
    listen_address: SocketAddr,

    /// Seed window duration in seconds; must match the trackers' rotation
    /// frequency
    #[arg(long, default_value = "300")]
    seed_window_secs: u64,

    /// How long a seed outlives its window before eviction, in seconds
    #[arg(long, default_value = "900")]
    seed_eviction_ttl_secs: u64,

    /// Eviction sweep interval in seconds
    #[arg(long, default_value = "60")]
    eviction_tick_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let config = StateServiceConfig {
        listen_address: args.listen_address,
        seed_window: Duration::from_secs(args.seed_window_secs),
        seed_eviction_ttl: Duration::from_secs(args.seed_eviction_ttl_secs),
        eviction_tick: Duration::from_secs(args.eviction_tick_secs),
    };
    config.validate()?;

    let store = Arc::new(InMemoryStore::new(
        config.seed_window,
        config.seed_eviction_ttl,
        config.eviction_tick,
    ));
    let hub = Hub::new();
    let cancel = CancellationToken::new();

    let eviction_store = store.clone();
    let eviction_cancel = cancel.child_token();
    tokio::spawn(async move { eviction_store.run_eviction(eviction_cancel).await });

    let hub_loop = hub.clone();
    let hub_cancel = cancel.child_token();
    tokio::spawn(async move { hub_loop.run(hub_cancel).await });

    let shared_store: Arc<dyn Store> = store;
    let server = tokio::spawn(service::serve(
        config.listen_address,
        shared_store,
        hub,
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down state service");
    cancel.cancel();
    server.await??;
    Ok(())
}
