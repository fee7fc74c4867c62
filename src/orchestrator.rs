//! # Orchestration Loop
//!
//! ## Responsibility
//! Drive every detected parcel from detection to exactly one terminal
//! [`ParcelOutcome`]:
//!
//! 1. create the parcel record (duplicate triggers jump to step 4 with the
//!    exception chute)
//! 2. ask the run state whether parcels may be created
//! 3. entry admission check, then chute resolution by sorting mode
//! 4. path generation, retried once against the exception chute
//! 5. node-health validation of the path
//! 6. post-generation admission re-check against the time budget
//! 7. path execution and result interpretation
//! 8. retirement of this detection's record and any pending assignment it owns
//!
//! ## Guarantees
//! - Step 8 runs on every exit path, including errors and panics
//! - A fault in one parcel never affects another: each parcel runs in its
//!   own task and faults are caught at the task boundary
//! - The routing configuration is read once per parcel, at its start
//! - Absent optional collaborators (failure handler, node health, run
//!   state, trace sink) disable their step instead of failing it
//!
//! ## NOT Responsible For
//! - Computing physical routes (see: `path`)
//! - Transport to the upstream service (see: `upstream`)

use crate::admission::{AdmissionController, OverloadDecision, OverloadReason};
use crate::config::{ConfigHandle, RoutingConfigProvider, SortingMode};
use crate::correlator::UpstreamRouteCorrelator;
use crate::detection::{DetectionEvent, DetectionSource};
use crate::health::NodeHealthChecker;
use crate::path::{PathFailureHandler, PathPipeline, PathSegment, SwitchingPath};
use crate::registry::ParcelRegistry;
use crate::run_state::RunStateValidator;
use crate::selector::SortingModeSelector;
use crate::trace::{ParcelStage, TraceRecord, TraceSink};
use crate::upstream::{ChuteAssignment, SharedUpstream};
use crate::{metrics, ChuteId, ParcelId, SorterError};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

const SOURCE: &str = "orchestrator";

/// Why a parcel was sent to the exception chute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExceptionReason {
    /// Admission control forced it under load.
    Overload,
    /// The path needs more time than the parcel has left.
    TtlBudgetExceeded,
    /// The generated path touched an unhealthy diverter.
    NodeDegraded,
    /// No upstream reply within the deadline.
    UpstreamTimeout,
    /// The upstream service could not be notified.
    UpstreamUnavailable,
    /// The upstream exchange was torn down before it resolved.
    UpstreamAbandoned,
    /// The detection was a duplicate sensor trigger.
    DuplicateTrigger,
    /// The resolved chute was absent or non-positive.
    InvalidChute,
    /// Round-robin mode had an empty chute list.
    NoChutesConfigured,
    /// No path could be generated to the resolved chute.
    PathUnavailable,
    /// The exception chute was the resolved chute.
    Requested,
}

impl ExceptionReason {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overload => "overload",
            Self::TtlBudgetExceeded => "ttl_budget_exceeded",
            Self::NodeDegraded => "node_degraded",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamAbandoned => "upstream_abandoned",
            Self::DuplicateTrigger => "duplicate_trigger",
            Self::InvalidChute => "invalid_chute",
            Self::NoChutesConfigured => "no_chutes_configured",
            Self::PathUnavailable => "path_unavailable",
            Self::Requested => "requested",
        }
    }

    fn from_overload(reason: Option<OverloadReason>) -> Self {
        match reason {
            Some(OverloadReason::PathExceedsBudget | OverloadReason::InsufficientTtl) => {
                Self::TtlBudgetExceeded
            }
            _ => Self::Overload,
        }
    }
}

/// Terminal outcome of one parcel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParcelOutcome {
    /// Reached the resolved chute.
    Delivered {
        /// Chute reached.
        chute: ChuteId,
    },
    /// Reached the exception chute.
    ExceptionDiverted {
        /// Chute reached.
        chute: ChuteId,
        /// Why it was diverted.
        reason: ExceptionReason,
    },
    /// The path was executed but did not deliver.
    ExecutionFailed {
        /// Chute the path targeted.
        target: ChuteId,
        /// Failure reported by the executor.
        reason: String,
        /// Segment that failed, when known.
        failed_segment: Option<PathSegment>,
    },
    /// No path could be generated, not even to the exception chute.
    HardFailure {
        /// Chute first attempted.
        target_attempted: ChuteId,
        /// Exception chute attempted.
        exception_attempted: ChuteId,
    },
    /// The run state refused the parcel.
    Discarded {
        /// Refusal reason.
        reason: String,
    },
    /// An unexpected fault was caught at the loop boundary.
    Faulted {
        /// Fault description.
        reason: String,
    },
}

impl ParcelOutcome {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::ExceptionDiverted { .. } => "exception_diverted",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::HardFailure { .. } => "hard_failure",
            Self::Discarded { .. } => "discarded",
            Self::Faulted { .. } => "faulted",
        }
    }

    /// Chute the parcel physically reached, if it reached one on purpose.
    pub fn final_chute(&self) -> Option<ChuteId> {
        match self {
            Self::Delivered { chute } | Self::ExceptionDiverted { chute, .. } => Some(*chute),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Detected,
    Duplicate,
}

struct Inner {
    registry: Arc<ParcelRegistry>,
    correlator: UpstreamRouteCorrelator,
    selector: SortingModeSelector,
    routing: Arc<dyn RoutingConfigProvider>,
    upstream: SharedUpstream,
    pipeline: Arc<dyn PathPipeline>,
    admission: AdmissionController,
    failure_handler: Option<Arc<dyn PathFailureHandler>>,
    node_health: Option<Arc<dyn NodeHealthChecker>>,
    run_state: Option<Arc<dyn RunStateValidator>>,
    trace: Option<Arc<dyn TraceSink>>,
}

/// Builder for [`SortingOrchestrator`].
pub struct OrchestratorBuilder {
    routing: Arc<dyn RoutingConfigProvider>,
    upstream: SharedUpstream,
    pipeline: Arc<dyn PathPipeline>,
    registry: Option<Arc<ParcelRegistry>>,
    admission: Option<AdmissionController>,
    failure_handler: Option<Arc<dyn PathFailureHandler>>,
    node_health: Option<Arc<dyn NodeHealthChecker>>,
    check_node_health: bool,
    run_state: Option<Arc<dyn RunStateValidator>>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl OrchestratorBuilder {
    /// Start from the three required collaborators. Admission stays
    /// disabled until [`OrchestratorBuilder::admission`] is called.
    pub fn new(
        routing: Arc<dyn RoutingConfigProvider>,
        upstream: SharedUpstream,
        pipeline: Arc<dyn PathPipeline>,
    ) -> Self {
        Self {
            routing,
            upstream,
            pipeline,
            registry: None,
            admission: None,
            failure_handler: None,
            node_health: None,
            check_node_health: true,
            run_state: None,
            trace: None,
        }
    }

    /// Start from a live configuration.
    ///
    /// Routing is re-read from `config` for every parcel. Admission and the
    /// node-health switch are taken from its contents now and do not follow
    /// later reloads; rebuild the orchestrator to change them.
    pub fn from_config(
        config: &ConfigHandle,
        upstream: SharedUpstream,
        pipeline: Arc<dyn PathPipeline>,
    ) -> Self {
        let current = config.current();
        let mut builder = Self::new(Arc::new(config.clone()), upstream, pipeline)
            .admission(AdmissionController::from_config(&current.admission));
        builder.check_node_health = current.health.check_node_health;
        builder
    }

    /// Share an existing registry.
    pub fn registry(mut self, registry: Arc<ParcelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `admission` at both decision points.
    pub fn admission(mut self, admission: AdmissionController) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Report execution failures to `handler`.
    pub fn failure_handler(mut self, handler: Arc<dyn PathFailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    /// Validate generated paths with `checker`.
    pub fn node_health(mut self, checker: Arc<dyn NodeHealthChecker>) -> Self {
        self.node_health = Some(checker);
        self
    }

    /// Gate parcel creation on `validator`.
    pub fn run_state(mut self, validator: Arc<dyn RunStateValidator>) -> Self {
        self.run_state = Some(validator);
        self
    }

    /// Emit stage traces to `sink`.
    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Assemble the orchestrator.
    pub fn build(self) -> SortingOrchestrator {
        let registry = self.registry.unwrap_or_default();
        let correlator = UpstreamRouteCorrelator::new(registry.clone(), self.upstream.clone());
        let selector = SortingModeSelector::new(registry.clone(), correlator.clone());
        let check_node_health = self.check_node_health;
        SortingOrchestrator {
            inner: Arc::new(Inner {
                registry,
                correlator,
                selector,
                routing: self.routing,
                upstream: self.upstream,
                pipeline: self.pipeline,
                admission: self.admission.unwrap_or_else(AdmissionController::disabled),
                failure_handler: self.failure_handler,
                node_health: self.node_health.filter(|_| check_node_health),
                run_state: self.run_state,
                trace: self.trace,
            }),
        }
    }
}

/// The parcel routing orchestration engine.
///
/// Cloning is cheap; clones share every collaborator and the registry.
#[derive(Clone)]
pub struct SortingOrchestrator {
    inner: Arc<Inner>,
}

/// Exception-chute override carried through path planning.
struct Plan {
    target: ChuteId,
    exception_chute: ChuteId,
    reason: Option<ExceptionReason>,
}

impl Plan {
    fn divert(&mut self, reason: ExceptionReason) {
        self.target = self.exception_chute;
        self.reason = Some(reason);
    }
}

impl SortingOrchestrator {
    /// Registry shared by every parcel.
    pub fn registry(&self) -> &Arc<ParcelRegistry> {
        &self.inner.registry
    }

    /// Correlator that accepts upstream replies.
    pub fn correlator(&self) -> &UpstreamRouteCorrelator {
        &self.inner.correlator
    }

    /// Admission controller in use.
    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Process a normal detection to its terminal outcome.
    pub async fn handle_detected(&self, parcel_id: ParcelId) -> ParcelOutcome {
        self.process(parcel_id, Trigger::Detected).await
    }

    /// Process a duplicate sensor trigger. Always ends at the exception chute
    /// unless no path to it exists.
    pub async fn handle_duplicate_trigger(&self, parcel_id: ParcelId) -> ParcelOutcome {
        self.process(parcel_id, Trigger::Duplicate).await
    }

    /// Accept an upstream assignment.
    pub fn handle_assignment(&self, assignment: ChuteAssignment) {
        self.inner
            .correlator
            .on_reply_received(assignment.parcel_id, assignment.chute_id);
    }

    async fn process(&self, parcel_id: ParcelId, trigger: Trigger) -> ParcelOutcome {
        let started = Instant::now();
        metrics::parcel_started();
        let span = info_span!(
            "parcel",
            parcel_id = %parcel_id,
            trigger = ?trigger,
            outcome = tracing::field::Empty,
        );

        // Each detection owns one lifecycle; a colliding id gets its own.
        let created_at = Instant::now();
        let lifecycle = span.in_scope(|| self.inner.registry.create(parcel_id, created_at).lifecycle);
        self.trace(parcel_id, ParcelStage::Created, format!("{trigger:?}"));

        let routed = AssertUnwindSafe(self.route(parcel_id, trigger, created_at))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        let outcome = match routed {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => self.fault(parcel_id, e.to_string()),
            Err(panic) => self.fault(parcel_id, panic_message(panic.as_ref())),
        };

        self.inner.registry.retire(parcel_id, lifecycle);
        span.record("outcome", outcome.label());
        metrics::parcel_finished();
        metrics::observe_parcel_duration(started.elapsed());
        metrics::inc_parcel(outcome.label());
        if let ParcelOutcome::ExceptionDiverted { reason, .. } = &outcome {
            metrics::inc_exception(reason.as_str());
        }
        outcome
    }

    async fn route(
        &self,
        parcel_id: ParcelId,
        trigger: Trigger,
        created_at: Instant,
    ) -> Result<ParcelOutcome, SorterError> {
        let inner = &self.inner;
        let routing = inner.routing.routing();

        let mut plan = Plan {
            target: routing.exception_chute_id,
            exception_chute: routing.exception_chute_id,
            reason: None,
        };

        if trigger == Trigger::Duplicate {
            inner
                .correlator
                .notify_best_effort(parcel_id, routing.chute_assignment_timeout);
            inner.registry.mark_route_bound(parcel_id, Instant::now());
            inner.admission.record_entry(parcel_id, created_at);
            plan.divert(ExceptionReason::DuplicateTrigger);
            info!(
                target: "sorter::orchestrator",
                parcel_id = %parcel_id,
                exception_chute_id = %plan.exception_chute,
                "duplicate trigger routed to exception chute"
            );
        } else {
            if let Some(run_state) = &inner.run_state {
                let verdict = run_state.validate_parcel_creation();
                if !verdict.allowed {
                    let reason = verdict.reason.unwrap_or_else(|| "creation refused".to_string());
                    warn!(target: "sorter::orchestrator", parcel_id = %parcel_id, reason = %reason, "parcel discarded");
                    self.trace(parcel_id, ParcelStage::Discarded, reason.clone());
                    return Ok(ParcelOutcome::Discarded { reason });
                }
            }

            inner.admission.record_entry(parcel_id, created_at);
            let decision = inner.admission.evaluate_entry(parcel_id, created_at, Instant::now());
            self.trace_admission(parcel_id, &decision);
            if decision.force_exception {
                if routing.mode == SortingMode::Formal {
                    inner
                        .correlator
                        .notify_best_effort(parcel_id, routing.chute_assignment_timeout);
                }
                inner.registry.mark_route_bound(parcel_id, Instant::now());
                plan.divert(ExceptionReason::from_overload(decision.reason));
            } else {
                let selection = inner.selector.select(parcel_id, &routing).await;
                if routing.mode != SortingMode::Formal {
                    inner.registry.mark_route_bound(parcel_id, Instant::now());
                }
                plan.target = selection.chute_id;
                plan.reason = selection.fallback;
            }
        }
        self.trace(parcel_id, ParcelStage::ChuteResolved, format!("chute {}", plan.target));

        // Path generation, one retry against the exception chute.
        let path = match inner.pipeline.generate_path(plan.target).await {
            Some(path) => path,
            None => {
                let attempted = plan.target;
                if attempted != plan.exception_chute {
                    warn!(
                        target: "sorter::orchestrator",
                        parcel_id = %parcel_id,
                        chute_id = %attempted,
                        exception_chute_id = %plan.exception_chute,
                        "no path to resolved chute, retrying against exception chute"
                    );
                    plan.divert(ExceptionReason::PathUnavailable);
                }
                match self.exception_path(&plan).await {
                    Some(path) => path,
                    None => return Ok(self.hard_failure(parcel_id, attempted, plan.exception_chute)),
                }
            }
        };
        self.trace(parcel_id, ParcelStage::PathGenerated, format!("{} segments", path.segments().len()));

        let attempted = path.target_chute_id();
        let path = match self.check_health(parcel_id, path, &mut plan).await {
            Some(path) => path,
            None => return Ok(self.hard_failure(parcel_id, attempted, plan.exception_chute)),
        };

        let path = if path.target_chute_id() == plan.exception_chute {
            path
        } else {
            let decision = inner
                .admission
                .evaluate_path(parcel_id, created_at, &path, Instant::now());
            if decision.force_exception {
                self.trace_admission(parcel_id, &decision);
                let attempted = path.target_chute_id();
                plan.divert(ExceptionReason::from_overload(decision.reason));
                self.trace(parcel_id, ParcelStage::Rerouted, plan_reason(&plan));
                match self.exception_path(&plan).await {
                    Some(path) => path,
                    None => return Ok(self.hard_failure(parcel_id, attempted, plan.exception_chute)),
                }
            } else {
                path
            }
        };

        self.execute(parcel_id, &path, plan).await
    }

    async fn exception_path(&self, plan: &Plan) -> Option<SwitchingPath> {
        self.inner.pipeline.generate_path(plan.exception_chute).await
    }

    async fn check_health(
        &self,
        parcel_id: ParcelId,
        path: SwitchingPath,
        plan: &mut Plan,
    ) -> Option<SwitchingPath> {
        let Some(checker) = &self.inner.node_health else {
            return Some(path);
        };
        let health = checker.validate_path(&path);
        if health.healthy {
            return Some(path);
        }
        let unhealthy: Vec<i64> = health.unhealthy_node_ids.iter().map(|d| d.0).collect();
        if path.target_chute_id() == plan.exception_chute {
            warn!(
                target: "sorter::orchestrator",
                parcel_id = %parcel_id,
                unhealthy = ?unhealthy,
                "exception path crosses unhealthy diverters, no alternative"
            );
            return Some(path);
        }
        warn!(
            target: "sorter::orchestrator",
            parcel_id = %parcel_id,
            chute_id = %path.target_chute_id(),
            unhealthy = ?unhealthy,
            "path crosses unhealthy diverters, rerouting to exception chute"
        );
        plan.divert(ExceptionReason::NodeDegraded);
        self.trace(parcel_id, ParcelStage::Rerouted, plan_reason(plan));
        self.exception_path(plan).await
    }

    async fn execute(
        &self,
        parcel_id: ParcelId,
        path: &SwitchingPath,
        plan: Plan,
    ) -> Result<ParcelOutcome, SorterError> {
        let inner = &self.inner;
        let result = inner.pipeline.execute(path).await?;

        if result.success {
            inner.admission.record_completion(parcel_id, Instant::now(), true);
            let chute = result.actual_chute_id;
            let outcome = match plan.reason {
                Some(reason) => ParcelOutcome::ExceptionDiverted { chute, reason },
                None if chute == plan.exception_chute => ParcelOutcome::ExceptionDiverted {
                    chute,
                    reason: ExceptionReason::Requested,
                },
                None => ParcelOutcome::Delivered { chute },
            };
            debug!(target: "sorter::orchestrator", parcel_id = %parcel_id, chute_id = %chute, outcome = outcome.label(), "parcel sorted");
            self.trace(parcel_id, ParcelStage::Delivered, format!("chute {chute}"));
            return Ok(outcome);
        }

        inner.admission.record_completion(parcel_id, Instant::now(), false);
        let reason = result
            .failure_reason
            .unwrap_or_else(|| "unspecified execution failure".to_string());
        warn!(
            target: "sorter::orchestrator",
            parcel_id = %parcel_id,
            chute_id = %path.target_chute_id(),
            actual_chute_id = %result.actual_chute_id,
            reason = %reason,
            "path execution failed"
        );
        if let Some(handler) = &inner.failure_handler {
            handler
                .handle_failure(parcel_id, path, &reason, result.failed_segment.as_ref())
                .await;
        }
        self.trace(parcel_id, ParcelStage::ExecutionFailed, reason.clone());
        Ok(ParcelOutcome::ExecutionFailed {
            target: path.target_chute_id(),
            reason,
            failed_segment: result.failed_segment,
        })
    }

    fn hard_failure(&self, parcel_id: ParcelId, target: ChuteId, exception_chute: ChuteId) -> ParcelOutcome {
        error!(
            target: "sorter::orchestrator",
            parcel_id = %parcel_id,
            target_chute_id = %target,
            exception_chute_id = %exception_chute,
            "no path to target or exception chute, parcel is a hard failure"
        );
        self.inner
            .admission
            .record_completion(parcel_id, Instant::now(), false);
        self.trace(
            parcel_id,
            ParcelStage::HardFailure,
            format!("target {target}, exception {exception_chute}"),
        );
        ParcelOutcome::HardFailure {
            target_attempted: target,
            exception_attempted: exception_chute,
        }
    }

    fn fault(&self, parcel_id: ParcelId, reason: String) -> ParcelOutcome {
        error!(
            target: "sorter::orchestrator",
            parcel_id = %parcel_id,
            error = %reason,
            "unexpected fault while routing parcel"
        );
        self.inner
            .admission
            .record_completion(parcel_id, Instant::now(), false);
        self.trace(parcel_id, ParcelStage::Faulted, reason.clone());
        ParcelOutcome::Faulted { reason }
    }

    fn trace(&self, parcel_id: ParcelId, stage: ParcelStage, details: impl Into<String>) {
        if let Some(sink) = &self.inner.trace {
            sink.write(TraceRecord::now(parcel_id, stage, SOURCE, details));
        }
    }

    fn trace_admission(&self, parcel_id: ParcelId, decision: &OverloadDecision) {
        if decision.force_exception || decision.mark_overflow {
            let reason = decision.reason.map_or("none", OverloadReason::as_str);
            self.trace(parcel_id, ParcelStage::AdmissionDecided, reason);
        }
    }

    /// Subscribe to `detections` and the upstream client and run until
    /// `shutdown` flips or the detection source closes.
    pub async fn serve(&self, detections: &dyn DetectionSource, shutdown: watch::Receiver<bool>) {
        let assignments = self.inner.upstream.subscribe();
        self.run(detections.subscribe(), assignments, shutdown).await;
    }

    /// Run the event loop.
    ///
    /// Each detection is processed in its own task. Assignments are handed
    /// to the correlator as they arrive. On shutdown both subscriptions are
    /// dropped and the loop waits for in-flight parcels to finish.
    pub async fn run(
        &self,
        mut detections: broadcast::Receiver<DetectionEvent>,
        mut assignments: broadcast::Receiver<ChuteAssignment>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut parcels: JoinSet<ParcelOutcome> = JoinSet::new();
        let mut assignments_open = true;
        info!(target: "sorter::orchestrator", "orchestration loop started");

        loop {
            tokio::select! {
                event = detections.recv() => match event {
                    Ok(DetectionEvent::ParcelDetected { parcel_id, sensor_id, detected_at }) => {
                        debug!(target: "sorter::orchestrator", parcel_id = %parcel_id, sensor_id, detected_at = %detected_at, "parcel detected");
                        let this = self.clone();
                        parcels.spawn(async move { this.handle_detected(parcel_id).await });
                    }
                    Ok(DetectionEvent::DuplicateTriggerDetected { parcel_id, sensor_id, time_since_last_ms, reason }) => {
                        warn!(
                            target: "sorter::orchestrator",
                            parcel_id = %parcel_id,
                            sensor_id,
                            time_since_last_ms,
                            reason = %reason,
                            "duplicate trigger detected"
                        );
                        let this = self.clone();
                        parcels.spawn(async move { this.handle_duplicate_trigger(parcel_id).await });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        error!(target: "sorter::orchestrator", skipped, "detection events lost, loop lagging behind source");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(target: "sorter::orchestrator", "detection source closed");
                        break;
                    }
                },
                assignment = assignments.recv(), if assignments_open => match assignment {
                    Ok(assignment) => self.handle_assignment(assignment),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "sorter::upstream", skipped, "upstream assignments lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(target: "sorter::upstream", "upstream assignment stream closed");
                        assignments_open = false;
                    }
                },
                Some(joined) = parcels.join_next(), if !parcels.is_empty() => {
                    if let Err(e) = joined {
                        error!(target: "sorter::orchestrator", error = %e, "parcel task aborted");
                    }
                }
                _ = shutdown.changed() => {
                    info!(target: "sorter::orchestrator", "shutdown signal received");
                    break;
                }
            }
        }

        drop(detections);
        drop(assignments);
        let in_flight = parcels.len();
        if in_flight > 0 {
            info!(target: "sorter::orchestrator", in_flight, "waiting for in-flight parcels");
        }
        while parcels.join_next().await.is_some() {}
        info!(target: "sorter::orchestrator", "orchestration loop stopped");
    }
}

fn plan_reason(plan: &Plan) -> &'static str {
    plan.reason.map_or("none", ExceptionReason::as_str)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::path::{DiverterDirection, PathExecutionResult, TablePathPipeline};
    use crate::upstream::LoopbackUpstreamClient;
    use crate::DiverterId;
    use async_trait::async_trait;
    use std::time::Duration;

    fn routing(mode: SortingMode) -> Arc<RoutingConfig> {
        Arc::new(RoutingConfig {
            mode,
            exception_chute_id: ChuteId(999),
            fixed_chute_id: Some(ChuteId(7)),
            available_chute_ids: vec![ChuteId(1)],
            chute_assignment_timeout: Duration::from_millis(50),
        })
    }

    fn table() -> Arc<TablePathPipeline> {
        let hop = |d| vec![(DiverterId(d), DiverterDirection::Left, Duration::from_millis(200))];
        Arc::new(
            TablePathPipeline::new(ChuteId(999))
                .with_route(ChuteId(1), hop(1))
                .with_route(ChuteId(7), hop(7))
                .with_route(ChuteId(999), hop(9)),
        )
    }

    struct PanickingPipeline;

    #[async_trait]
    impl PathPipeline for PanickingPipeline {
        async fn generate_path(&self, _chute_id: ChuteId) -> Option<SwitchingPath> {
            panic!("topology table corrupted");
        }

        async fn execute(&self, _path: &SwitchingPath) -> Result<PathExecutionResult, SorterError> {
            Err(SorterError::PathExecution("unreachable".to_string()))
        }
    }

    struct FaultingExecutor(Arc<TablePathPipeline>);

    #[async_trait]
    impl PathPipeline for FaultingExecutor {
        async fn generate_path(&self, chute_id: ChuteId) -> Option<SwitchingPath> {
            self.0.generate_path(chute_id).await
        }

        async fn execute(&self, _path: &SwitchingPath) -> Result<PathExecutionResult, SorterError> {
            Err(SorterError::PathExecution("plc offline".to_string()))
        }
    }

    #[test]
    fn test_ttl_related_overload_reasons_map_to_budget_exceeded() {
        assert_eq!(
            ExceptionReason::from_overload(Some(OverloadReason::PathExceedsBudget)),
            ExceptionReason::TtlBudgetExceeded
        );
        assert_eq!(
            ExceptionReason::from_overload(Some(OverloadReason::CriticalCongestion)),
            ExceptionReason::Overload
        );
        assert_eq!(ExceptionReason::from_overload(None), ExceptionReason::Overload);
    }

    #[test]
    fn test_outcome_final_chute() {
        assert_eq!(ParcelOutcome::Delivered { chute: ChuteId(3) }.final_chute(), Some(ChuteId(3)));
        let hard = ParcelOutcome::HardFailure {
            target_attempted: ChuteId(3),
            exception_attempted: ChuteId(999),
        };
        assert_eq!(hard.final_chute(), None);
        assert_eq!(hard.label(), "hard_failure");
    }

    #[tokio::test]
    async fn test_fixed_chute_delivers() {
        let orchestrator = OrchestratorBuilder::new(
            routing(SortingMode::FixedChute),
            Arc::new(LoopbackUpstreamClient::silent()),
            table(),
        )
        .build();
        let outcome = orchestrator.handle_detected(ParcelId(1)).await;
        assert_eq!(outcome, ParcelOutcome::Delivered { chute: ChuteId(7) });
        assert!(orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_panic_in_pipeline_is_contained() {
        let orchestrator = OrchestratorBuilder::new(
            routing(SortingMode::FixedChute),
            Arc::new(LoopbackUpstreamClient::silent()),
            Arc::new(PanickingPipeline),
        )
        .build();
        let outcome = orchestrator.handle_detected(ParcelId(5)).await;
        match outcome {
            ParcelOutcome::Faulted { reason } => assert!(reason.contains("topology table corrupted")),
            other => panic!("expected fault, got {other:?}"),
        }
        assert!(!orchestrator.registry().exists(ParcelId(5)));

        // The next parcel is unaffected by the previous fault.
        let outcome = orchestrator.handle_detected(ParcelId(6)).await;
        assert_eq!(outcome.label(), "faulted");
    }

    #[tokio::test]
    async fn test_executor_error_is_fault_and_sampler_records_failure() {
        let orchestrator = OrchestratorBuilder::new(
            routing(SortingMode::RoundRobin),
            Arc::new(LoopbackUpstreamClient::silent()),
            Arc::new(FaultingExecutor(table())),
        )
        .admission(AdmissionController::from_config(&crate::config::AdmissionConfig::default()))
        .build();
        let outcome = orchestrator.handle_detected(ParcelId(8)).await;
        assert!(matches!(outcome, ParcelOutcome::Faulted { .. }));
        let snapshot = orchestrator.admission().snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.failure_count, 1);
        assert!(orchestrator.registry().is_empty());
    }
}
