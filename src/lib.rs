//! # parcel-sort-orchestrator
//!
//! Parcel routing orchestration engine for a wheel-diverter sorter, over Tokio.
//!
//! ## Architecture
//!
//! Every physically detected parcel flows through one per-parcel task:
//! ```text
//! Detection ─► ParcelRegistry.create ─► Admission(entry) ─► ModeSelector / Correlator
//!           ─► PathPipeline.generate ─► NodeHealth ─► Admission(path) ─► PathPipeline.execute
//!           ─► ParcelRegistry.retire ─► ParcelOutcome
//! ```
//!
//! The registry, the pending upstream assignments and the round-robin cursor
//! are the only shared mutable state and live behind a single mutex.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod admission;
pub mod config;
pub mod correlator;
pub mod detection;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod path;
pub mod registry;
pub mod run_state;
pub mod selector;
pub mod trace;
pub mod upstream;

// Re-exports for convenience
pub use config::{ConfigHandle, RoutingConfig, RoutingConfigProvider, SorterConfig, SortingMode};
pub use orchestrator::{ExceptionReason, OrchestratorBuilder, ParcelOutcome, SortingOrchestrator};
pub use path::{PathPipeline, SwitchingPath};
pub use registry::ParcelRegistry;
pub use upstream::UpstreamClient;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`SorterError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), SorterError> {
    let env = std::env::var("LOG_FORMAT").ok();
    init_tracing_with(&config::resolve_log_format(env.as_deref(), &LogFormat::Pretty))
}

/// Initialise the global tracing subscriber with an explicit format.
///
/// Used when the format comes from `[observability] log_format`; see
/// [`config::resolve_log_format`] for how `LOG_FORMAT` overrides it.
///
/// # Errors
///
/// Returns [`SorterError::Other`] if the global subscriber has already
/// been set.
pub fn init_tracing_with(format: &LogFormat) -> Result<(), SorterError> {
    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| SorterError::Other(format!("tracing init failed: {e}")))
}

/// Top-level sorter errors.
///
/// Collaborators (upstream client, path pipeline) surface unexpected faults
/// through this type; the orchestration loop never lets one escape a parcel.
#[derive(Error, Debug)]
pub enum SorterError {
    /// An event channel closed unexpectedly, indicating source shutdown.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// The upstream decision-service transport failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// The path executor faulted (not a reported delivery failure).
    #[error("path execution fault: {0}")]
    PathExecution(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Stable, source-assigned parcel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParcelId(pub i64);

impl fmt::Display for ParcelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical exit bin identifier.
///
/// Ids are signed because upstream services and misconfigured tables can
/// hand back zero or negative values; see [`ChuteId::is_valid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChuteId(pub i64);

impl ChuteId {
    /// A chute id is routable only when strictly positive.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ChuteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one wheel diverter (a topology node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiverterId(pub i64);

impl fmt::Display for DiverterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chute_id_validity_rejects_zero_and_negative() {
        assert!(ChuteId(1).is_valid());
        assert!(!ChuteId(0).is_valid());
        assert!(!ChuteId(-3).is_valid());
    }

    #[test]
    fn test_ids_display_as_raw_numbers() {
        assert_eq!(ParcelId(42).to_string(), "42");
        assert_eq!(ChuteId(7).to_string(), "7");
        assert_eq!(DiverterId(3).to_string(), "3");
    }

    #[test]
    fn test_path_execution_error_display_includes_message() {
        let err = SorterError::PathExecution("plc offline".to_string());
        assert_eq!(err.to_string(), "path execution fault: plc offline");
    }

    #[test]
    fn test_upstream_error_display_includes_message() {
        let err = SorterError::Upstream("socket reset".to_string());
        assert!(err.to_string().contains("socket reset"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order.
        let _ = init_tracing();
        let result = init_tracing_with(&LogFormat::Json);
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
