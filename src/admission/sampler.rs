//! Rolling congestion sampler.
//!
//! Tracks which parcels are in flight and the latencies of parcels that
//! completed within a fixed recent window. The snapshot is what the
//! congestion detector and overload policy evaluate.

use crate::ParcelId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Point-in-time view of sorter load.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CongestionSnapshot {
    /// Parcels entered but not yet completed.
    pub in_flight: usize,
    /// Mean entry→completion latency over the window (ms).
    pub avg_latency_ms: f64,
    /// Worst entry→completion latency over the window (ms).
    pub max_latency_ms: u64,
    /// Completions inside the window.
    pub sample_count: usize,
    /// Failed completions inside the window.
    pub failure_count: usize,
    /// Width of the sampling window.
    pub sample_window: Duration,
}

/// Source of congestion snapshots, fed with parcel entry and completion.
pub trait CongestionSampler: Send + Sync {
    /// A parcel entered the sorter.
    fn record_entry(&self, parcel_id: ParcelId, at: Instant);
    /// A parcel finished, successfully or not.
    fn record_completion(&self, parcel_id: ParcelId, at: Instant, success: bool);
    /// Current load snapshot.
    fn snapshot(&self) -> CongestionSnapshot;
}

struct Completion {
    at: Instant,
    latency_ms: u64,
    success: bool,
}

#[derive(Default)]
struct SamplerState {
    entries: HashMap<ParcelId, Instant>,
    completions: VecDeque<Completion>,
}

/// [`CongestionSampler`] over a sliding time window.
pub struct RollingCongestionSampler {
    window: Duration,
    state: Mutex<SamplerState>,
}

impl RollingCongestionSampler {
    /// Create a sampler keeping completions for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(SamplerState::default()),
        }
    }

    /// Snapshot as seen at `now`.
    pub fn snapshot_at(&self, now: Instant) -> CongestionSnapshot {
        let mut state = self.state.lock();
        let window = self.window;
        while let Some(front) = state.completions.front() {
            if now.saturating_duration_since(front.at) > window {
                state.completions.pop_front();
            } else {
                break;
            }
        }

        let sample_count = state.completions.len();
        let (sum, max, failures) = state.completions.iter().fold(
            (0u64, 0u64, 0usize),
            |(sum, max, failures), c| {
                (
                    sum.saturating_add(c.latency_ms),
                    max.max(c.latency_ms),
                    failures + usize::from(!c.success),
                )
            },
        );
        let avg_latency_ms = if sample_count == 0 {
            0.0
        } else {
            sum as f64 / sample_count as f64
        };

        CongestionSnapshot {
            in_flight: state.entries.len(),
            avg_latency_ms,
            max_latency_ms: max,
            sample_count,
            failure_count: failures,
            sample_window: window,
        }
    }
}

impl CongestionSampler for RollingCongestionSampler {
    fn record_entry(&self, parcel_id: ParcelId, at: Instant) {
        self.state.lock().entries.insert(parcel_id, at);
    }

    fn record_completion(&self, parcel_id: ParcelId, at: Instant, success: bool) {
        let mut state = self.state.lock();
        // Completions for parcels never entered carry no latency.
        let Some(entered) = state.entries.remove(&parcel_id) else {
            return;
        };
        let latency_ms = at.saturating_duration_since(entered).as_millis() as u64;
        state.completions.push_back(Completion {
            at,
            latency_ms,
            success,
        });
    }

    fn snapshot(&self) -> CongestionSnapshot {
        self.snapshot_at(Instant::now())
    }
}
