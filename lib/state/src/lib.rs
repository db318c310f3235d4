// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared-state fabric for the fairshare tracker.
//!
//! A fleet of tracker instances shares no database; instead every instance
//! streams the deltas it observes to a central state service over one
//! bidirectional gRPC stream. The service folds deltas into an aggregation
//! store keyed by time window (*seed*) and fans the aggregated bucket
//! updates back out to every connected instance, so the fleet converges on
//! the same throttling probabilities.
//!
//! The pieces:
//! - [`store`]: the `seed → row → col → bucket` aggregation store with
//!   additive, clamped merges and periodic seed eviction.
//! - [`hub`]: the broadcast hub that owns every connected stream's outbound
//!   queue and serializes membership changes with fan-out.
//! - [`service`]: the tonic `StateSync` implementation wiring streams to the
//!   store and hub.
//! - [`client`]: the library-side stream client with a bounded outbound
//!   queue and reconnect-with-backoff.

pub use anyhow::{Error, Result};
pub use tokio_util::sync::CancellationToken;

pub mod client;
pub mod config;
pub mod hub;
pub mod logging;
pub mod proto;
pub mod service;
pub mod store;

pub use client::StateClient;
pub use config::StateServiceConfig;
pub use hub::Hub;
pub use service::SyncService;
pub use store::{InMemoryStore, Store};
