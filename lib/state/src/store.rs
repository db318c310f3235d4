// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Seed-keyed aggregation store.
//!
//! Deltas from many tracker instances are additive evidence about the same
//! client population, so the store folds them with `clamp(prob + delta, 0, 1)`
//! rather than last-writer-wins; a max-wins timestamp keeps
//! `last_update_time_ms` monotone per bucket regardless of arrival order.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::proto::Bucket;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Backend contract for the state service.
///
/// Implementations must keep every stored probability inside `[0, 1]` and
/// `last_update_time_ms` non-decreasing per `(seed, row, col)`.
pub trait Store: Send + Sync {
    /// Apply a signed delta to one bucket and return a copy of its new state.
    fn apply_delta(
        &self,
        seed: u64,
        row_id: u64,
        col_id: u64,
        delta_prob: f64,
        timestamp_ms: u64,
    ) -> Result<Bucket>;

    /// Snapshot every bucket stored under `seed`; empty if the seed is absent.
    fn get_seed(&self, seed: u64) -> Result<Vec<Bucket>>;

    /// Remove all state for seeds strictly less than `seed`. Idempotent.
    fn evict_before(&self, seed: u64) -> Result<()>;
}

type SeedMap = HashMap<u64, HashMap<u64, HashMap<u64, Bucket>>>;

/// In-memory [`Store`] behind a single reader-preferring lock.
pub struct InMemoryStore {
    buckets: RwLock<SeedMap>,
    window: Duration,
    eviction_ttl: Duration,
    eviction_tick: Duration,
}

impl InMemoryStore {
    pub fn new(window: Duration, eviction_ttl: Duration, eviction_tick: Duration) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            window,
            eviction_ttl,
            eviction_tick,
        }
    }

    /// Periodically evict seeds older than the TTL until cancelled.
    ///
    /// The cutoff is expressed in seed units: `(now - ttl) / window`, the same
    /// derivation every tracker uses for its own seeds.
    pub async fn run_eviction(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.eviction_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval() fires immediately; consume the first tick so the sweep
        // runs one tick after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("eviction sweep shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let cutoff_ms = now_ms().saturating_sub(self.eviction_ttl.as_millis() as u64);
                    let cutoff_seed = cutoff_ms / self.window.as_millis().max(1) as u64;
                    let evicted = self.evict_before_counting(cutoff_seed);
                    if evicted > 0 {
                        info!(cutoff_seed, evicted, "evicted expired seeds");
                    }
                }
            }
        }
    }

    fn evict_before_counting(&self, seed: u64) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|&stored_seed, _| stored_seed >= seed);
        before - buckets.len()
    }
}

impl Store for InMemoryStore {
    fn apply_delta(
        &self,
        seed: u64,
        row_id: u64,
        col_id: u64,
        delta_prob: f64,
        timestamp_ms: u64,
    ) -> Result<Bucket> {
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .entry(seed)
            .or_default()
            .entry(row_id)
            .or_default()
            .entry(col_id)
            .or_insert_with(|| Bucket {
                row_id,
                col_id,
                prob: 0.0,
                last_update_time_ms: 0,
            });

        // Clamp after addition so readers never observe a value outside [0, 1].
        bucket.prob = (bucket.prob + delta_prob).clamp(0.0, 1.0);
        bucket.last_update_time_ms = bucket.last_update_time_ms.max(timestamp_ms);

        Ok(bucket.clone())
    }

    fn get_seed(&self, seed: u64) -> Result<Vec<Bucket>> {
        let buckets = self.buckets.read();
        let Some(rows) = buckets.get(&seed) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .flat_map(|cols| cols.values().cloned())
            .collect())
    }

    fn evict_before(&self, seed: u64) -> Result<()> {
        self.evict_before_counting(seed);
        Ok(())
    }
}
