//! Congestion detection and overload policy.
//!
//! Both are pure functions of the value they are given. The thresholds come
//! from [`AdmissionConfig`].

use super::sampler::CongestionSnapshot;
use super::{CongestionLevel, OverloadContext, OverloadDecision, OverloadReason};
use crate::config::AdmissionConfig;
use std::time::Duration;

/// Maps a congestion snapshot to a level.
pub trait CongestionDetector: Send + Sync {
    /// Classify `snapshot`.
    fn detect_level(&self, snapshot: &CongestionSnapshot) -> CongestionLevel;
}

/// Maps an overload context to a decision.
pub trait OverloadPolicy: Send + Sync {
    /// Decide whether `context` must be forced to the exception chute.
    fn evaluate(&self, context: &OverloadContext) -> OverloadDecision;
}

/// Threshold-based [`CongestionDetector`].
#[derive(Debug, Clone)]
pub struct ThresholdCongestionDetector {
    warning_in_flight: usize,
    severe_in_flight: usize,
    critical_in_flight: usize,
    warning_latency_ms: f64,
    critical_latency_ms: u64,
}

impl ThresholdCongestionDetector {
    /// Build from configured thresholds.
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self {
            warning_in_flight: config.warning_in_flight,
            severe_in_flight: config.severe_in_flight,
            critical_in_flight: config.critical_in_flight,
            warning_latency_ms: config.warning_latency_ms as f64,
            critical_latency_ms: config.critical_latency_ms,
        }
    }
}

impl CongestionDetector for ThresholdCongestionDetector {
    fn detect_level(&self, snapshot: &CongestionSnapshot) -> CongestionLevel {
        let by_count = if snapshot.in_flight >= self.critical_in_flight {
            CongestionLevel::Critical
        } else if snapshot.in_flight >= self.severe_in_flight {
            CongestionLevel::Severe
        } else if snapshot.in_flight >= self.warning_in_flight {
            CongestionLevel::Warning
        } else {
            CongestionLevel::Normal
        };

        let by_latency = if snapshot.max_latency_ms >= self.critical_latency_ms {
            CongestionLevel::Critical
        } else if snapshot.avg_latency_ms >= self.warning_latency_ms {
            CongestionLevel::Warning
        } else {
            CongestionLevel::Normal
        };

        by_count.max(by_latency)
    }
}

/// Default [`OverloadPolicy`].
///
/// - `Critical` congestion forces the exception chute.
/// - A remaining budget under `min_remaining_ttl` forces the exception chute.
/// - `Severe` congestion marks the parcel as overflow.
#[derive(Debug, Clone)]
pub struct DefaultOverloadPolicy {
    min_remaining_ttl: Duration,
}

impl DefaultOverloadPolicy {
    /// Build from configured thresholds.
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self {
            min_remaining_ttl: Duration::from_millis(config.min_remaining_ttl_ms),
        }
    }
}

impl OverloadPolicy for DefaultOverloadPolicy {
    fn evaluate(&self, context: &OverloadContext) -> OverloadDecision {
        if context.congestion == CongestionLevel::Critical {
            return OverloadDecision::force(OverloadReason::CriticalCongestion);
        }
        if context.remaining_ttl < self.min_remaining_ttl {
            return OverloadDecision::force(OverloadReason::InsufficientTtl);
        }
        if context.congestion == CongestionLevel::Severe {
            return OverloadDecision::overflow(OverloadReason::SevereCongestion);
        }
        OverloadDecision::admit()
    }
}
