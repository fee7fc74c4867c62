//! # Admission Control
//!
//! ## Responsibility
//! Decide, at two points of a parcel's life, whether normal routing must be
//! overridden and the parcel forced to the exception chute:
//! - on entry, before any routing decision;
//! - after a path has been generated, to check that the path's required
//!   transit time fits the parcel's remaining time budget.
//!
//! ## Guarantees
//! - Context and decision are plain values built fresh per call
//! - The sampler, detector and policy are optional; any of them may be
//!   absent and admission still works with what remains
//! - A disabled controller admits everything
//!
//! ## NOT Responsible For
//! - Acting on the decision (that belongs to `orchestrator`)

pub mod policy;
pub mod sampler;

use crate::config::AdmissionConfig;
use crate::path::SwitchingPath;
use crate::{metrics, ParcelId};
use policy::{CongestionDetector, DefaultOverloadPolicy, OverloadPolicy, ThresholdCongestionDetector};
use sampler::{CongestionSampler, CongestionSnapshot, RollingCongestionSampler};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Congestion severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CongestionLevel {
    /// Normal operation.
    Normal,
    /// Load is elevated.
    Warning,
    /// Load is high; parcels are flagged as overflow.
    Severe,
    /// Load is unsafe; parcels are forced to the exception chute.
    Critical,
}

/// Where in the parcel's life the decision is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DecisionPoint {
    /// Before any routing decision.
    Entry,
    /// After a switching path was generated.
    PathPlanned,
}

/// Why a parcel was forced or flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OverloadReason {
    /// Congestion reached the critical level.
    CriticalCongestion,
    /// Congestion reached the severe level.
    SevereCongestion,
    /// Too little of the parcel's time budget remains.
    InsufficientTtl,
    /// The generated path needs more time than the parcel has left.
    PathExceedsBudget,
}

impl OverloadReason {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CriticalCongestion => "critical_congestion",
            Self::SevereCongestion => "severe_congestion",
            Self::InsufficientTtl => "insufficient_ttl",
            Self::PathExceedsBudget => "path_exceeds_budget",
        }
    }
}

/// Input to an [`OverloadPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverloadContext {
    /// Parcel being decided on.
    pub parcel_id: ParcelId,
    /// Decision point.
    pub position: DecisionPoint,
    /// Estimated remaining time budget.
    pub remaining_ttl: Duration,
    /// Time the generated path needs, at [`DecisionPoint::PathPlanned`].
    pub required_ttl: Option<Duration>,
    /// Current congestion level.
    pub congestion: CongestionLevel,
    /// Parcels currently in flight.
    pub in_flight: usize,
}

/// Output of an [`OverloadPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverloadDecision {
    /// Route the parcel to the exception chute.
    pub force_exception: bool,
    /// Keep routing but flag the parcel for observability.
    pub mark_overflow: bool,
    /// Why, when either flag is set.
    pub reason: Option<OverloadReason>,
}

impl OverloadDecision {
    /// Neither forced nor flagged.
    pub fn admit() -> Self {
        Self {
            force_exception: false,
            mark_overflow: false,
            reason: None,
        }
    }

    /// Forced to the exception chute.
    pub fn force(reason: OverloadReason) -> Self {
        Self {
            force_exception: true,
            mark_overflow: false,
            reason: Some(reason),
        }
    }

    /// Flagged as overflow only.
    pub fn overflow(reason: OverloadReason) -> Self {
        Self {
            force_exception: false,
            mark_overflow: true,
            reason: Some(reason),
        }
    }

    fn label(&self) -> &'static str {
        if self.force_exception {
            "force_exception"
        } else if self.mark_overflow {
            "overflow"
        } else {
            "admit"
        }
    }
}

/// Admission control as wired into the orchestration loop.
pub struct AdmissionController {
    enabled: bool,
    ttl_budget: Duration,
    sampler: Option<Arc<dyn CongestionSampler>>,
    detector: Option<Arc<dyn CongestionDetector>>,
    policy: Option<Arc<dyn OverloadPolicy>>,
}

impl AdmissionController {
    /// A controller with no sampler, detector or policy. Admits everything
    /// except paths that exceed the budget.
    pub fn new(ttl_budget: Duration) -> Self {
        Self {
            enabled: true,
            ttl_budget,
            sampler: None,
            detector: None,
            policy: None,
        }
    }

    /// A controller that admits everything and samples nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::MAX)
        }
    }

    /// Wire the rolling sampler, threshold detector and default policy
    /// from configuration.
    pub fn from_config(config: &AdmissionConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self::new(Duration::from_millis(config.parcel_ttl_budget_ms))
            .with_sampler(Arc::new(RollingCongestionSampler::new(Duration::from_secs(
                config.sample_window_s,
            ))))
            .with_detector(Arc::new(ThresholdCongestionDetector::from_config(config)))
            .with_policy(Arc::new(DefaultOverloadPolicy::from_config(config)))
    }

    /// Attach a congestion sampler.
    pub fn with_sampler(mut self, sampler: Arc<dyn CongestionSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Attach a congestion detector.
    pub fn with_detector(mut self, detector: Arc<dyn CongestionDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Attach an overload policy.
    pub fn with_policy(mut self, policy: Arc<dyn OverloadPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Record that a parcel entered.
    pub fn record_entry(&self, parcel_id: ParcelId, at: Instant) {
        if let Some(sampler) = &self.sampler {
            sampler.record_entry(parcel_id, at);
        }
    }

    /// Record that a parcel finished.
    pub fn record_completion(&self, parcel_id: ParcelId, at: Instant, success: bool) {
        if let Some(sampler) = &self.sampler {
            sampler.record_completion(parcel_id, at, success);
        }
    }

    /// Current snapshot, or an empty one when no sampler is attached.
    pub fn snapshot(&self) -> CongestionSnapshot {
        self.sampler
            .as_ref()
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// Time left for a parcel created at `created_at`.
    pub fn remaining_budget(&self, created_at: Instant, now: Instant) -> Duration {
        self.ttl_budget
            .saturating_sub(now.saturating_duration_since(created_at))
    }

    /// Entry-time check.
    pub fn evaluate_entry(&self, parcel_id: ParcelId, created_at: Instant, now: Instant) -> OverloadDecision {
        if !self.enabled {
            return OverloadDecision::admit();
        }
        let context = self.context(parcel_id, DecisionPoint::Entry, created_at, now, None);
        self.decide(&context)
    }

    /// Post-generation check of `path` against the remaining budget.
    pub fn evaluate_path(
        &self,
        parcel_id: ParcelId,
        created_at: Instant,
        path: &SwitchingPath,
        now: Instant,
    ) -> OverloadDecision {
        if !self.enabled {
            return OverloadDecision::admit();
        }
        let required = path.total_ttl();
        let context = self.context(parcel_id, DecisionPoint::PathPlanned, created_at, now, Some(required));
        if required > context.remaining_ttl {
            let decision = OverloadDecision::force(OverloadReason::PathExceedsBudget);
            self.log_decision(&context, &decision);
            return decision;
        }
        self.decide(&context)
    }

    fn context(
        &self,
        parcel_id: ParcelId,
        position: DecisionPoint,
        created_at: Instant,
        now: Instant,
        required_ttl: Option<Duration>,
    ) -> OverloadContext {
        let snapshot = self.snapshot();
        let congestion = self
            .detector
            .as_ref()
            .map_or(CongestionLevel::Normal, |d| d.detect_level(&snapshot));
        OverloadContext {
            parcel_id,
            position,
            remaining_ttl: self.remaining_budget(created_at, now),
            required_ttl,
            congestion,
            in_flight: snapshot.in_flight,
        }
    }

    fn decide(&self, context: &OverloadContext) -> OverloadDecision {
        let decision = self
            .policy
            .as_ref()
            .map_or_else(OverloadDecision::admit, |p| p.evaluate(context));
        self.log_decision(context, &decision);
        decision
    }

    fn log_decision(&self, context: &OverloadContext, decision: &OverloadDecision) {
        metrics::inc_admission_decision(decision.label());
        let reason = decision.reason.map_or("none", OverloadReason::as_str);
        if decision.force_exception {
            info!(
                target: "sorter::admission",
                parcel_id = %context.parcel_id,
                position = ?context.position,
                congestion = ?context.congestion,
                remaining_ms = context.remaining_ttl.as_millis() as u64,
                required_ms = context.required_ttl.map(|d| d.as_millis() as u64),
                reason = reason,
                "admission forced exception chute"
            );
        } else if decision.mark_overflow {
            info!(
                target: "sorter::admission",
                parcel_id = %context.parcel_id,
                congestion = ?context.congestion,
                reason = reason,
                "parcel flagged as overflow"
            );
        } else {
            debug!(target: "sorter::admission", parcel_id = %context.parcel_id, position = ?context.position, "admitted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{DiverterDirection, PathSegment};
    use crate::{ChuteId, DiverterId};

    fn path_with_ttl(ms: u64) -> SwitchingPath {
        SwitchingPath::new(
            ChuteId(4),
            vec![PathSegment {
                diverter_id: DiverterId(1),
                direction: DiverterDirection::Left,
                sequence: 1,
                ttl: Duration::from_millis(ms),
            }],
            ChuteId(999),
        )
        .unwrap()
    }

    struct AlwaysForce;

    impl OverloadPolicy for AlwaysForce {
        fn evaluate(&self, _context: &OverloadContext) -> OverloadDecision {
            OverloadDecision::force(OverloadReason::CriticalCongestion)
        }
    }

    #[test]
    fn test_disabled_controller_admits_everything() {
        let controller = AdmissionController::disabled();
        let now = Instant::now();
        assert_eq!(
            controller.evaluate_entry(ParcelId(1), now, now),
            OverloadDecision::admit()
        );
        assert_eq!(
            controller.evaluate_path(ParcelId(1), now, &path_with_ttl(u64::MAX / 4), now),
            OverloadDecision::admit()
        );
    }

    #[test]
    fn test_absent_policy_admits_on_entry() {
        let controller = AdmissionController::new(Duration::from_secs(10));
        let now = Instant::now();
        assert_eq!(
            controller.evaluate_entry(ParcelId(1), now, now),
            OverloadDecision::admit()
        );
    }

    #[test]
    fn test_path_exceeding_budget_is_forced_without_policy() {
        let controller = AdmissionController::new(Duration::from_millis(1000));
        let created = Instant::now();
        let now = created + Duration::from_millis(600);
        let decision = controller.evaluate_path(ParcelId(1), created, &path_with_ttl(500), now);
        assert!(decision.force_exception);
        assert_eq!(decision.reason, Some(OverloadReason::PathExceedsBudget));

        let decision = controller.evaluate_path(ParcelId(1), created, &path_with_ttl(300), now);
        assert!(!decision.force_exception);
    }

    #[test]
    fn test_attached_policy_drives_entry_decision() {
        let controller =
            AdmissionController::new(Duration::from_secs(10)).with_policy(Arc::new(AlwaysForce));
        let now = Instant::now();
        assert!(controller.evaluate_entry(ParcelId(1), now, now).force_exception);
    }

    #[test]
    fn test_remaining_budget_saturates_at_zero() {
        let controller = AdmissionController::new(Duration::from_millis(100));
        let created = Instant::now();
        assert_eq!(
            controller.remaining_budget(created, created + Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_from_config_detects_critical_in_flight() {
        let config = AdmissionConfig {
            warning_in_flight: 1,
            severe_in_flight: 2,
            critical_in_flight: 3,
            ..AdmissionConfig::default()
        };
        let controller = AdmissionController::from_config(&config);
        let now = Instant::now();
        for id in 0..3 {
            controller.record_entry(ParcelId(id), now);
        }
        let decision = controller.evaluate_entry(ParcelId(9), now, now);
        assert!(decision.force_exception);
        assert_eq!(decision.reason, Some(OverloadReason::CriticalCongestion));

        controller.record_completion(ParcelId(0), now, true);
        let decision = controller.evaluate_entry(ParcelId(9), now, now);
        assert!(!decision.force_exception);
        assert!(decision.mark_overflow);
    }

    #[test]
    fn test_from_config_disabled_skips_sampling() {
        let config = AdmissionConfig {
            enabled: false,
            ..AdmissionConfig::default()
        };
        let controller = AdmissionController::from_config(&config);
        controller.record_entry(ParcelId(1), Instant::now());
        assert_eq!(controller.snapshot().in_flight, 0);
    }
}
