//! # Sorting Mode Selector
//!
//! ## Responsibility
//! Resolve the target chute for one parcel according to the sorting mode in
//! that parcel's routing snapshot:
//! - `Formal` asks upstream through the correlator
//! - `FixedChute` returns the configured chute and never contacts upstream
//! - `RoundRobin` takes the chute under the shared cursor and advances it
//!
//! ## Guarantees
//! - The result is always a routable chute; anything absent or non-positive
//!   becomes the exception chute, whatever the mode
//! - Every fallback carries the reason it happened
//!
//! ## NOT Responsible For
//! - Admission control or duplicate triggers (see: `orchestrator`)

use crate::config::{RoutingConfig, SortingMode};
use crate::correlator::{RouteOutcome, UpstreamRouteCorrelator};
use crate::orchestrator::ExceptionReason;
use crate::registry::ParcelRegistry;
use crate::{ChuteId, ParcelId};
use std::sync::Arc;
use tracing::{error, warn};

/// A resolved chute and, when it is a fallback, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChuteSelection {
    /// Chute to route to.
    pub chute_id: ChuteId,
    /// Set when `chute_id` is the exception chute because of a fallback.
    pub fallback: Option<ExceptionReason>,
}

impl ChuteSelection {
    fn resolved(chute_id: ChuteId) -> Self {
        Self {
            chute_id,
            fallback: None,
        }
    }

    fn exception(routing: &RoutingConfig, reason: ExceptionReason) -> Self {
        Self {
            chute_id: routing.exception_chute_id,
            fallback: Some(reason),
        }
    }
}

/// Chooses how the target chute is resolved.
#[derive(Clone)]
pub struct SortingModeSelector {
    registry: Arc<ParcelRegistry>,
    correlator: UpstreamRouteCorrelator,
}

impl SortingModeSelector {
    /// Selector sharing `registry`'s round-robin cursor.
    pub fn new(registry: Arc<ParcelRegistry>, correlator: UpstreamRouteCorrelator) -> Self {
        Self {
            registry,
            correlator,
        }
    }

    /// Resolve the chute for `parcel_id` under `routing`.
    pub async fn select(&self, parcel_id: ParcelId, routing: &RoutingConfig) -> ChuteSelection {
        let candidate = match routing.mode {
            SortingMode::Formal => {
                let resolution = self
                    .correlator
                    .request_route(parcel_id, routing.chute_assignment_timeout, routing.exception_chute_id)
                    .await;
                match resolution.outcome {
                    RouteOutcome::Assigned => Some(resolution.chute_id),
                    RouteOutcome::TimedOut => {
                        return ChuteSelection::exception(routing, ExceptionReason::UpstreamTimeout)
                    }
                    RouteOutcome::Unavailable | RouteOutcome::NoRecord => {
                        return ChuteSelection::exception(routing, ExceptionReason::UpstreamUnavailable)
                    }
                    RouteOutcome::Abandoned => {
                        return ChuteSelection::exception(routing, ExceptionReason::UpstreamAbandoned)
                    }
                }
            }
            SortingMode::FixedChute => routing.fixed_chute_id,
            SortingMode::RoundRobin => match self.registry.next_round_robin(&routing.available_chute_ids) {
                Some(chute) => Some(chute),
                None => {
                    error!(
                        target: "sorter::orchestrator",
                        parcel_id = %parcel_id,
                        exception_chute_id = %routing.exception_chute_id,
                        "round-robin mode has no available chutes configured"
                    );
                    return ChuteSelection::exception(routing, ExceptionReason::NoChutesConfigured);
                }
            },
        };

        match candidate {
            Some(chute) if chute.is_valid() => ChuteSelection::resolved(chute),
            other => {
                warn!(
                    target: "sorter::orchestrator",
                    parcel_id = %parcel_id,
                    mode = ?routing.mode,
                    chute_id = ?other.map(|c| c.0),
                    exception_chute_id = %routing.exception_chute_id,
                    "resolved chute is not routable, using exception chute"
                );
                ChuteSelection::exception(routing, ExceptionReason::InvalidChute)
            }
        }
    }
}
