// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The L×M counting structure.
//!
//! A client identifier hashes to exactly one column in each of L rows; the
//! bucket behind each `(row, col)` holds a throttling probability and the
//! time it was last touched. Probabilities decay exponentially on access, so
//! idle clients drain toward zero without any per-client bookkeeping.
//!
//! Every mutation (decay included) is reported to an optional delta sink as
//! `(row, col, signed_delta, timestamp_ms)`; the tracker wires the sink to
//! the state client so the fleet aggregate stays current.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::clock::Clock;
use crate::config::{FairnessTrackerConfig, FinalProbability};

const SEED_MIX: u64 = 0x9e37_79b9_7f4a_7c15;
const ROW_MIX: u64 = 0xd6e8_feb8_6659_fd93;

/// Result of a request the client reported back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

impl FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            _ => Err(anyhow::anyhow!(
                "invalid outcome: '{s}'. Valid options are: 'success', 'failure'"
            )),
        }
    }
}

/// Debug stats attached to a register result when `include_stats` is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultStats {
    pub final_probability: f64,
    pub bucket_probabilities: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct RegisterResult {
    pub should_throttle: bool,
    pub stats: Option<ResultStats>,
}

/// Capability set the tracker consumes the counting structure through.
pub trait Sketch: Send + Sync {
    fn register_request(&self, client_id: &[u8]) -> RegisterResult;
    fn report_outcome(&self, client_id: &[u8], outcome: Outcome);
    /// The seed (time window) this structure was built for.
    fn seed(&self) -> u64;
    /// Blind overwrite from the fleet-wide aggregate. Does not emit deltas.
    fn apply_update(&self, row_id: u64, col_id: u64, prob: f64, last_update_time_ms: u64);
}

/// Receives `(row, col, delta, timestamp_ms)` for every local bucket mutation.
pub type DeltaSink = Arc<dyn Fn(u64, u64, f64, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    prob: f64,
    last_update_ms: u64,
}

pub struct CountingStructure {
    seed: u64,
    m: u64,
    pi: f64,
    pd: f64,
    lambda: f64,
    include_stats: bool,
    final_probability: FinalProbability,
    rows: Vec<Vec<Mutex<Bucket>>>,
    clock: Arc<dyn Clock>,
    delta_sink: RwLock<Option<DeltaSink>>,
}

impl CountingStructure {
    pub fn new(config: &FairnessTrackerConfig, seed: u64, clock: Arc<dyn Clock>) -> Self {
        let rows = (0..config.l)
            .map(|_| (0..config.m).map(|_| Mutex::new(Bucket::default())).collect())
            .collect();
        Self {
            seed,
            m: config.m as u64,
            pi: config.pi,
            pd: config.pd,
            lambda: config.lambda,
            include_stats: config.include_stats,
            final_probability: config.final_probability.clone(),
            rows,
            clock,
            delta_sink: RwLock::new(None),
        }
    }

    pub fn set_delta_sink(&self, sink: DeltaSink) {
        *self.delta_sink.write() = Some(sink);
    }

    /// Column for `client_id` in `row`. The seed and row index both perturb
    /// the hash, so rows pick independent columns and different windows
    /// shuffle the mapping, while identical `(seed, row, id)` tuples agree
    /// across processes.
    fn column_for(&self, row: u64, client_id: &[u8]) -> u64 {
        let salt = self
            .seed
            .wrapping_mul(SEED_MIX)
            .wrapping_add(row.wrapping_mul(ROW_MIX));
        xxh3_64_with_seed(client_id, salt) % self.m
    }

    fn emit(&self, row: u64, col: u64, delta: f64, timestamp_ms: u64) {
        if let Some(sink) = self.delta_sink.read().as_ref() {
            sink(row, col, delta, timestamp_ms);
        }
    }

    /// Decay the locked bucket to `now_ms` and stamp it. Emits the decay
    /// delta when the value actually moved.
    fn decay_locked(&self, row: u64, col: u64, bucket: &mut Bucket, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(bucket.last_update_ms);
        if self.lambda > 0.0 && elapsed_ms > 0 && bucket.prob > 0.0 {
            let decayed = bucket.prob * (-self.lambda * elapsed_ms as f64).exp();
            let delta = decayed - bucket.prob;
            bucket.prob = decayed;
            if delta != 0.0 {
                self.emit(row, col, delta, now_ms);
            }
        }
        bucket.last_update_ms = now_ms;
    }
}

impl Sketch for CountingStructure {
    fn register_request(&self, client_id: &[u8]) -> RegisterResult {
        let now_ms = self.clock.now_ms();
        let mut probabilities = Vec::with_capacity(self.rows.len());
        for (row, columns) in self.rows.iter().enumerate() {
            let row = row as u64;
            let col = self.column_for(row, client_id);
            let mut bucket = columns[col as usize].lock();
            self.decay_locked(row, col, &mut bucket, now_ms);
            probabilities.push(bucket.prob);
        }

        let final_probability = self.final_probability.combine(&probabilities);
        let should_throttle = rand::thread_rng().gen::<f64>() < final_probability;
        let stats = self.include_stats.then(|| ResultStats {
            final_probability,
            bucket_probabilities: probabilities,
        });

        RegisterResult {
            should_throttle,
            stats,
        }
    }

    fn report_outcome(&self, client_id: &[u8], outcome: Outcome) {
        let now_ms = self.clock.now_ms();
        let adjustment = match outcome {
            Outcome::Failure => self.pi,
            Outcome::Success => -self.pd,
        };

        for (row, columns) in self.rows.iter().enumerate() {
            let row = row as u64;
            let col = self.column_for(row, client_id);
            let mut bucket = columns[col as usize].lock();
            self.decay_locked(row, col, &mut bucket, now_ms);
            let previous = bucket.prob;
            bucket.prob = (previous + adjustment).clamp(0.0, 1.0);
            let applied = bucket.prob - previous;
            if applied != 0.0 {
                self.emit(row, col, applied, now_ms);
            }
        }
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    fn apply_update(&self, row_id: u64, col_id: u64, prob: f64, last_update_time_ms: u64) {
        let Some(columns) = self.rows.get(row_id as usize) else {
            debug!(row_id, "discarding update for out-of-range row");
            return;
        };
        let Some(cell) = columns.get(col_id as usize) else {
            debug!(row_id, col_id, "discarding update for out-of-range column");
            return;
        };

        // The service aggregate is authoritative; the local bucket is a cache
        // of it. Merging deltas here would double-count our own reports.
        let mut bucket = cell.lock();
        bucket.prob = prob.clamp(0.0, 1.0);
        bucket.last_update_ms = last_update_time_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex as SyncMutex;

    fn config(l: u32, m: u32, pi: f64, pd: f64, lambda: f64) -> FairnessTrackerConfig {
        FairnessTrackerConfig {
            l,
            m,
            pi,
            pd,
            lambda,
            include_stats: true,
            ..FairnessTrackerConfig::default()
        }
    }

    fn final_probability(result: &RegisterResult) -> f64 {
        result.stats.as_ref().expect("stats enabled").final_probability
    }

    #[test]
    fn repeated_failures_drive_throttling() {
        let clock = Arc::new(ManualClock::new(1_000));
        let structure = CountingStructure::new(&config(3, 64, 0.1, 0.05, 0.0), 1, clock);

        for _ in 0..10 {
            structure.report_outcome(b"x", Outcome::Failure);
        }

        let bad = structure.register_request(b"x");
        assert!(final_probability(&bad) >= 0.99);
        assert!(bad.should_throttle, "probability 1.0 must always throttle");

        // A client never reported on stays clean; rand() < 0.0 is never true.
        let clean = structure.register_request(b"y");
        assert_eq!(final_probability(&clean), 0.0);
        assert!(!clean.should_throttle);
    }

    #[test]
    fn successes_pull_probability_back_down() {
        let clock = Arc::new(ManualClock::new(1_000));
        let structure = CountingStructure::new(&config(2, 32, 0.1, 0.05, 0.0), 1, clock);

        structure.report_outcome(b"x", Outcome::Failure);
        structure.report_outcome(b"x", Outcome::Failure);
        structure.report_outcome(b"x", Outcome::Success);

        let result = structure.register_request(b"x");
        assert!((final_probability(&result) - 0.15).abs() < 1e-9);
    }

    #[test]
    fn probability_is_clamped_at_both_ends() {
        let clock = Arc::new(ManualClock::new(1_000));
        let structure = CountingStructure::new(&config(1, 8, 0.3, 0.4, 0.0), 1, clock);

        // Success on a fresh bucket must not go negative.
        structure.report_outcome(b"x", Outcome::Success);
        assert_eq!(final_probability(&structure.register_request(b"x")), 0.0);

        for _ in 0..10 {
            structure.report_outcome(b"x", Outcome::Failure);
        }
        assert_eq!(final_probability(&structure.register_request(b"x")), 1.0);
    }

    #[test]
    fn decay_recovers_reputation() {
        // Half-life of one second: lambda = ln 2 / 1000.
        let lambda = 2.0_f64.ln() / 1_000.0;
        let clock = Arc::new(ManualClock::new(1_000));
        let structure =
            CountingStructure::new(&config(3, 64, 0.1, 0.05, lambda), 1, clock.clone());

        for _ in 0..10 {
            structure.report_outcome(b"x", Outcome::Failure);
        }
        assert!(final_probability(&structure.register_request(b"x")) > 0.9);

        clock.advance(5_000);
        let recovered = structure.register_request(b"x");
        assert!(
            final_probability(&recovered) < 0.05,
            "five half-lives must shrink 1.0 below 0.05, got {}",
            final_probability(&recovered)
        );
    }

    #[test]
    fn identical_seed_row_id_tuples_hash_identically() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let cfg = config(4, 128, 0.1, 0.05, 0.0);
        let a = CountingStructure::new(&cfg, 42, clock.clone());
        let b = CountingStructure::new(&cfg, 42, clock.clone());
        let other_seed = CountingStructure::new(&cfg, 43, clock);

        let ids: Vec<Vec<u8>> = (0..64).map(|i| format!("client-{i}").into_bytes()).collect();

        let mut seed_changes_some_column = false;
        for id in &ids {
            for row in 0..4 {
                assert_eq!(a.column_for(row, id), b.column_for(row, id));
                if a.column_for(row, id) != other_seed.column_for(row, id) {
                    seed_changes_some_column = true;
                }
            }
        }
        assert!(
            seed_changes_some_column,
            "a different seed must remap at least one of 256 placements"
        );
    }

    #[test]
    fn mutations_reach_the_delta_sink() {
        let clock = Arc::new(ManualClock::new(1_000));
        let structure = CountingStructure::new(&config(2, 16, 0.1, 0.05, 0.0), 1, clock.clone());

        let seen: Arc<SyncMutex<Vec<(u64, u64, f64, u64)>>> =
            Arc::new(SyncMutex::new(Vec::new()));
        let sink_seen = seen.clone();
        structure.set_delta_sink(Arc::new(move |row, col, delta, ts| {
            sink_seen.lock().push((row, col, delta, ts));
        }));

        structure.report_outcome(b"x", Outcome::Failure);
        {
            let deltas = seen.lock();
            assert_eq!(deltas.len(), 2, "one delta per row");
            for (_, _, delta, ts) in deltas.iter() {
                assert!((delta - 0.1).abs() < 1e-9);
                assert_eq!(*ts, 1_000);
            }
        }

        // A clamped no-op mutation emits nothing.
        seen.lock().clear();
        structure.report_outcome(b"fresh", Outcome::Success);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn decay_emits_the_negative_delta() {
        let lambda = 2.0_f64.ln() / 1_000.0;
        let clock = Arc::new(ManualClock::new(1_000));
        let structure = CountingStructure::new(&config(1, 8, 0.5, 0.05, lambda), 1, clock.clone());

        structure.report_outcome(b"x", Outcome::Failure);

        let seen: Arc<SyncMutex<Vec<f64>>> = Arc::new(SyncMutex::new(Vec::new()));
        let sink_seen = seen.clone();
        structure.set_delta_sink(Arc::new(move |_, _, delta, _| {
            sink_seen.lock().push(delta);
        }));

        clock.advance(1_000);
        structure.register_request(b"x");

        let deltas = seen.lock();
        assert_eq!(deltas.len(), 1);
        // One half-life on 0.5 sheds 0.25.
        assert!((deltas[0] + 0.25).abs() < 1e-3, "got {}", deltas[0]);
    }

    #[test]
    fn apply_update_overwrites_without_emitting() {
        let clock = Arc::new(ManualClock::new(1_000));
        let structure = CountingStructure::new(&config(1, 8, 0.1, 0.05, 0.0), 1, clock);

        let seen: Arc<SyncMutex<usize>> = Arc::new(SyncMutex::new(0));
        let sink_seen = seen.clone();
        structure.set_delta_sink(Arc::new(move |_, _, _, _| {
            *sink_seen.lock() += 1;
        }));

        let col = structure.column_for(0, b"x");
        structure.apply_update(0, col, 0.7, 2_000);
        assert_eq!(*seen.lock(), 0, "blind overwrite must not echo a delta");
        assert!((final_probability(&structure.register_request(b"x")) - 0.7).abs() < 1e-9);

        // Out-of-range coordinates from a confused peer are discarded.
        structure.apply_update(9, 0, 0.9, 2_000);
        structure.apply_update(0, 99, 0.9, 2_000);
    }
}
