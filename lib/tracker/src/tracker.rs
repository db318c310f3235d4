// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The fairness tracker: two counting structures under a rotation lock.
//!
//! *Main* (the current time window) answers queries; *secondary* (the next
//! window) receives every write too, so promotion hands over a structure that
//! already reflects recent traffic. A rotation task promotes secondary to
//! main once per window and drops the old main; its buckets live on in the
//! state service until evicted.
//!
//! The rotation lock guards which structures are current, not their
//! contents: mutators share it, rotation takes it exclusively for the swap.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fairshare_state::client::{ConnectHook, StateClient, UpdateCallback};
use fairshare_state::proto::{BucketDelta, SyncResponse};

use crate::clock::{seed_at, Clock, SystemClock};
use crate::config::FairnessTrackerConfig;
use crate::structure::{CountingStructure, Outcome, RegisterResult, Sketch};

struct StructurePair {
    main: Arc<dyn Sketch>,
    secondary: Arc<dyn Sketch>,
}

struct TrackerInner {
    config: FairnessTrackerConfig,
    clock: Arc<dyn Clock>,
    structures: RwLock<StructurePair>,
    state_client: Option<Arc<StateClient>>,
}

impl TrackerInner {
    /// Blend an aggregated update into whichever live structure owns the
    /// seed; anything else is stale and dropped. Tolerates duplicates and
    /// out-of-order arrivals by construction (blind overwrite).
    fn apply_sync_response(&self, response: SyncResponse) {
        let pair = self.structures.read();
        let target = if pair.main.seed() == response.seed {
            &pair.main
        } else if pair.secondary.seed() == response.seed {
            &pair.secondary
        } else {
            debug!(seed = response.seed, "discarding update for retired seed");
            return;
        };

        for bucket in response.buckets {
            target.apply_update(
                bucket.row_id,
                bucket.col_id,
                bucket.prob,
                bucket.last_update_time_ms,
            );
        }
    }

    /// Ask the service for the authoritative state of both live seeds.
    fn request_live_state(&self) {
        let Some(client) = &self.state_client else {
            return;
        };
        let pair = self.structures.read();
        client.request_full_state(pair.main.seed());
        client.request_full_state(pair.secondary.seed());
    }
}

pub struct FairnessTracker {
    inner: Arc<TrackerInner>,
    cancel: CancellationToken,
}

impl FairnessTracker {
    /// Create a tracker on the system clock. Must be called within a tokio
    /// runtime; rotation (and the state client, when configured) run as
    /// background tasks until [`close`](Self::close) or drop.
    pub fn new(config: FairnessTrackerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a tracker on an explicit clock; used by tests and simulations.
    pub fn with_clock(config: FairnessTrackerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let state_client = config
            .state_service_address
            .as_ref()
            .map(|addr| Arc::new(StateClient::new(addr.clone())));

        let current_seed = seed_at(clock.now_ms(), config.rotation_frequency);
        let main = build_structure(&config, current_seed, &clock, state_client.as_ref());
        let secondary = build_structure(&config, current_seed + 1, &clock, state_client.as_ref());

        let inner = Arc::new(TrackerInner {
            config,
            clock,
            structures: RwLock::new(StructurePair { main, secondary }),
            state_client,
        });

        if let Some(client) = &inner.state_client {
            let update_inner = inner.clone();
            let on_update: UpdateCallback =
                Arc::new(move |response| update_inner.apply_sync_response(response));
            // Cold start and every reconnect resync both live seeds.
            let connect_inner = inner.clone();
            let on_connect: ConnectHook = Arc::new(move || connect_inner.request_live_state());
            client.start(cancel.child_token(), on_update, on_connect);
        }

        let rotation_inner = inner.clone();
        let rotation_cancel = cancel.child_token();
        tokio::spawn(async move { rotation_loop(rotation_inner, rotation_cancel).await });

        Ok(Self { inner, cancel })
    }

    /// Record an incoming request and decide whether to throttle it.
    pub fn register_request(&self, client_id: &[u8]) -> RegisterResult {
        let pair = self.inner.structures.read();
        let result = pair.main.register_request(client_id);
        // Keep the next window warm; its answer is discarded.
        pair.secondary.register_request(client_id);
        result
    }

    /// Feed back how the request from `client_id` went.
    pub fn report_outcome(&self, client_id: &[u8], outcome: Outcome) {
        let pair = self.inner.structures.read();
        pair.main.report_outcome(client_id, outcome);
        pair.secondary.report_outcome(client_id, outcome);
    }

    /// Stop rotation and the state client. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    fn seeds(&self) -> (u64, u64) {
        let pair = self.inner.structures.read();
        (pair.main.seed(), pair.secondary.seed())
    }
}

impl Drop for FairnessTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn build_structure(
    config: &FairnessTrackerConfig,
    seed: u64,
    clock: &Arc<dyn Clock>,
    client: Option<&Arc<StateClient>>,
) -> Arc<dyn Sketch> {
    let structure = Arc::new(CountingStructure::new(config, seed, clock.clone()));
    if let Some(client) = client {
        let client = client.clone();
        structure.set_delta_sink(Arc::new(move |row_id, col_id, delta_prob, ts| {
            client.send_delta_update(
                seed,
                vec![BucketDelta {
                    row_id,
                    col_id,
                    delta_prob,
                    last_update_time_ms: ts,
                }],
            );
        }));
    }
    structure
}

async fn rotation_loop(inner: Arc<TrackerInner>, cancel: CancellationToken) {
    let period = inner.config.rotation_frequency;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                // We just entered window k, so the next secondary covers k+1.
                // A stalled or skewed clock must never produce a seed the pair
                // already holds.
                let target = seed_at(inner.clock.now_ms(), period) + 1;
                let floor = inner.structures.read().secondary.seed() + 1;
                let seed = target.max(floor);

                let fresh = build_structure(
                    &inner.config,
                    seed,
                    &inner.clock,
                    inner.state_client.as_ref(),
                );
                if let Some(client) = &inner.state_client {
                    client.request_full_state(seed);
                }

                let mut pair = inner.structures.write();
                pair.main = pair.secondary.clone();
                pair.secondary = fresh;
                drop(pair);
                debug!(seed, "rotated counting structures");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::FinalProbability;
    use std::time::Duration;

    fn local_config(window: Duration) -> FairnessTrackerConfig {
        FairnessTrackerConfig {
            m: 64,
            l: 3,
            pi: 0.1,
            pd: 0.05,
            lambda: 0.0,
            rotation_frequency: window,
            include_stats: true,
            final_probability: FinalProbability::Min,
            state_service_address: None,
        }
    }

    fn final_probability(result: &RegisterResult) -> f64 {
        result.stats.as_ref().expect("stats enabled").final_probability
    }

    #[tokio::test]
    async fn startup_seeds_are_consecutive() {
        let clock = Arc::new(ManualClock::new(1_000));
        let tracker =
            FairnessTracker::with_clock(local_config(Duration::from_millis(100)), clock).unwrap();

        let (main, secondary) = tracker.seeds();
        assert_eq!(main, 10);
        assert_eq!(secondary, 11);
        tracker.close();
    }

    #[tokio::test]
    async fn rotation_never_duplicates_a_seed() {
        let tracker = FairnessTracker::new(local_config(Duration::from_millis(50))).unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let (main, secondary) = tracker.seeds();
            assert!(
                secondary > main,
                "secondary {secondary} must stay ahead of main {main}"
            );
        }
        tracker.close();
    }

    #[tokio::test]
    async fn rotation_preserves_warmth() {
        let tracker = FairnessTracker::new(local_config(Duration::from_millis(200))).unwrap();
        let (main_before, _) = tracker.seeds();

        for _ in 0..20 {
            tracker.report_outcome(b"w", Outcome::Failure);
        }

        // Poll for the promotion instead of sleeping past it, so the assert
        // runs right after the first rotation rather than near the second.
        let mut rotated = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if tracker.seeds().0 > main_before {
                rotated = true;
                break;
            }
        }
        assert!(rotated, "rotation did not happen");

        let result = tracker.register_request(b"w");
        assert!(
            final_probability(&result) >= 0.5,
            "pre-warmed secondary lost the failure history: {}",
            final_probability(&result)
        );
        tracker.close();
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let mut config = local_config(Duration::from_millis(100));
        config.l = 0;
        assert!(FairnessTracker::new(config).is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let tracker = FairnessTracker::new(local_config(Duration::from_secs(60))).unwrap();
        tracker.register_request(b"a");
        tracker.report_outcome(b"a", Outcome::Success);
        tracker.close();
        tracker.close();
    }
}
