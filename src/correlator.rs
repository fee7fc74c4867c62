//! # Upstream Route Correlator
//!
//! ## Responsibility
//! Turn "which chute does parcel N go to?" into a bounded request/reply
//! exchange with the upstream decision service.
//!
//! Per parcel: `Idle → RequestSent → {ReplyReceived | TimedOut} → Retired`.
//!
//! ## Guarantees
//! - Nothing is sent upstream for a parcel without a local record
//! - Replies for unknown parcels are discarded; no record is ever created here
//! - Reply and deadline race on the registry's pending map; exactly one wins
//! - A late reply never changes an already-resolved route
//!
//! ## NOT Responsible For
//! - Substituting the exception chute for invalid replies (see: `selector`)
//! - Listening on the upstream client's event stream (see: `orchestrator`)

use crate::registry::{ParcelRegistry, PendingOutcome, PendingRegistration, ReplyResolution};
use crate::upstream::SharedUpstream;
use crate::{metrics, ChuteId, ParcelId};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

/// How an upstream route request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RouteOutcome {
    /// A reply arrived in time.
    Assigned,
    /// No reply within the deadline, including when the notification
    /// itself outlived it.
    TimedOut,
    /// The notify call failed.
    Unavailable,
    /// No parcel record existed; nothing was sent.
    NoRecord,
    /// The exchange was torn down before it resolved.
    Abandoned,
}

impl RouteOutcome {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::TimedOut => "timeout",
            Self::Unavailable => "unavailable",
            Self::NoRecord => "rejected",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Chute produced by [`UpstreamRouteCorrelator::request_route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteResolution {
    /// Assigned chute, or the exception chute on any fallback.
    pub chute_id: ChuteId,
    /// How the exchange ended.
    pub outcome: RouteOutcome,
}

/// Correlates upstream notifications with their replies.
#[derive(Clone)]
pub struct UpstreamRouteCorrelator {
    registry: Arc<ParcelRegistry>,
    upstream: SharedUpstream,
}

impl UpstreamRouteCorrelator {
    /// Correlator over `registry`, talking to `upstream`.
    pub fn new(registry: Arc<ParcelRegistry>, upstream: SharedUpstream) -> Self {
        Self { registry, upstream }
    }

    /// Ask upstream for a chute and wait up to `timeout` for the answer.
    ///
    /// One deadline, fixed when the request is registered, bounds both the
    /// notification and the wait for the reply. Falls back to
    /// `exception_chute` when the parcel has no record, when notification
    /// fails, and when the deadline passes.
    pub async fn request_route(
        &self,
        parcel_id: ParcelId,
        timeout: Duration,
        exception_chute: ChuteId,
    ) -> RouteResolution {
        let deadline = tokio::time::Instant::now() + timeout;
        let resolution = match self.registry.register_pending(parcel_id, Instant::now()) {
            PendingRegistration::NoRecord => {
                ParcelRegistry::report_invariant_violation(parcel_id, "route request");
                fallback(exception_chute, RouteOutcome::NoRecord)
            }
            PendingRegistration::Joined { generation, rx } => {
                debug!(
                    target: "sorter::upstream",
                    parcel_id = %parcel_id,
                    "joining outstanding route request"
                );
                let wait = Wait {
                    parcel_id,
                    generation,
                    deadline,
                    timeout,
                    exception_chute,
                };
                self.await_reply(&wait, rx).await
            }
            PendingRegistration::New { generation, rx } => {
                let wait = Wait {
                    parcel_id,
                    generation,
                    deadline,
                    timeout,
                    exception_chute,
                };
                let notified =
                    tokio::time::timeout_at(deadline, self.upstream.notify_detected(parcel_id)).await;
                match notified {
                    Ok(Ok(())) => self.await_reply(&wait, rx).await,
                    Ok(Err(e)) => {
                        self.registry.cancel_pending(parcel_id, generation);
                        warn!(
                            target: "sorter::upstream",
                            parcel_id = %parcel_id,
                            exception_chute_id = %exception_chute,
                            error = %e,
                            "upstream notify failed, routing to exception chute"
                        );
                        fallback(exception_chute, RouteOutcome::Unavailable)
                    }
                    Err(_elapsed) => self.on_deadline(&wait, rx),
                }
            }
        };
        metrics::inc_upstream_request(resolution.outcome.as_str());
        resolution
    }

    async fn await_reply(&self, wait: &Wait, mut rx: broadcast::Receiver<PendingOutcome>) -> RouteResolution {
        let received = tokio::time::timeout_at(wait.deadline, rx.recv()).await;
        match received {
            Ok(Ok(outcome)) => resolved(wait, outcome),
            Ok(Err(RecvError::Closed | RecvError::Lagged(_))) => {
                debug!(
                    target: "sorter::upstream",
                    parcel_id = %wait.parcel_id,
                    "route request torn down before a reply"
                );
                fallback(wait.exception_chute, RouteOutcome::Abandoned)
            }
            Err(_elapsed) => self.on_deadline(wait, rx),
        }
    }

    fn on_deadline(&self, wait: &Wait, mut rx: broadcast::Receiver<PendingOutcome>) -> RouteResolution {
        if self.registry.expire_pending(wait.parcel_id, wait.generation) {
            warn!(
                target: "sorter::upstream",
                parcel_id = %wait.parcel_id,
                timeout_ms = wait.timeout.as_millis() as u64,
                exception_chute_id = %wait.exception_chute,
                "upstream assignment timed out, routing to exception chute"
            );
            return fallback(wait.exception_chute, RouteOutcome::TimedOut);
        }
        // Someone else resolved the entry first; the outcome may be queued.
        match rx.try_recv() {
            Ok(outcome) => resolved(wait, outcome),
            Err(TryRecvError::Empty | TryRecvError::Closed | TryRecvError::Lagged(_)) => {
                fallback(wait.exception_chute, RouteOutcome::Abandoned)
            }
        }
    }

    /// Notify upstream without waiting for a reply.
    ///
    /// Used when the route is already decided locally. The record check
    /// happens before this returns; the notification itself runs on its own
    /// task, bounded by `timeout`, and failures are logged and ignored.
    pub fn notify_best_effort(&self, parcel_id: ParcelId, timeout: Duration) {
        if !self.registry.mark_request_sent(parcel_id, Instant::now()) {
            ParcelRegistry::report_invariant_violation(parcel_id, "best-effort notify");
            return;
        }
        let upstream = self.upstream.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, upstream.notify_detected(parcel_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(
                    target: "sorter::upstream",
                    parcel_id = %parcel_id,
                    error = %e,
                    "best-effort upstream notify failed"
                ),
                Err(_elapsed) => debug!(
                    target: "sorter::upstream",
                    parcel_id = %parcel_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "best-effort upstream notify timed out"
                ),
            }
        });
    }

    /// Accept an assignment delivered by the upstream client.
    pub fn on_reply_received(&self, parcel_id: ParcelId, chute_id: ChuteId) -> ReplyResolution {
        let resolution = self.registry.resolve_pending(parcel_id, chute_id, Instant::now());
        match resolution {
            ReplyResolution::Resolved => {
                debug!(target: "sorter::upstream", parcel_id = %parcel_id, chute_id = %chute_id, "route bound");
            }
            ReplyResolution::NoPending => {
                debug!(
                    target: "sorter::upstream",
                    parcel_id = %parcel_id,
                    chute_id = %chute_id,
                    "reply with no outstanding request ignored"
                );
            }
            ReplyResolution::NoRecord => {
                ParcelRegistry::report_invariant_violation(parcel_id, "upstream reply");
            }
        }
        resolution
    }
}

/// One caller's view of a pending exchange.
struct Wait {
    parcel_id: ParcelId,
    generation: u64,
    deadline: tokio::time::Instant,
    timeout: Duration,
    exception_chute: ChuteId,
}

fn resolved(wait: &Wait, outcome: PendingOutcome) -> RouteResolution {
    match outcome {
        PendingOutcome::Assigned(chute_id) => RouteResolution {
            chute_id,
            outcome: RouteOutcome::Assigned,
        },
        PendingOutcome::Expired => fallback(wait.exception_chute, RouteOutcome::TimedOut),
    }
}

fn fallback(exception_chute: ChuteId, outcome: RouteOutcome) -> RouteResolution {
    RouteResolution {
        chute_id: exception_chute,
        outcome,
    }
}
