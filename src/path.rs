//! Switching paths and the path pipeline abstraction
//!
//! A [`SwitchingPath`] is an ordered list of diverter directives plus the
//! timing budget needed to deliver a parcel to one chute. Path generation
//! and execution are external concerns behind [`PathPipeline`]; the
//! orchestrator only interprets their results.
//!
//! [`TablePathPipeline`] is a table-driven implementation used by the demo
//! binary and the tests.

use crate::{ChuteId, DiverterId, ParcelId, SorterError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Direction a wheel diverter must take for a parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiverterDirection {
    /// Let the parcel pass straight through.
    Straight,
    /// Divert to the left exit.
    Left,
    /// Divert to the right exit.
    Right,
}

/// One diverter directive inside a switching path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Diverter this segment drives.
    pub diverter_id: DiverterId,
    /// Direction the diverter must take.
    pub direction: DiverterDirection,
    /// Position in the path, contiguous from 1.
    pub sequence: u32,
    /// Maximum time allowed to traverse this segment.
    pub ttl: Duration,
}

/// Errors raised when constructing an invalid path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// The path has no segments.
    #[error("switching path has no segments")]
    Empty,
    /// Segment sequence numbers are not contiguous from 1.
    #[error("segment at index {index} has sequence {found}, expected {expected}")]
    NonContiguous {
        /// Index of the offending segment.
        index: usize,
        /// Sequence number found.
        found: u32,
        /// Sequence number expected.
        expected: u32,
    },
}

/// A physical route to one chute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchingPath {
    target_chute_id: ChuteId,
    segments: Vec<PathSegment>,
    fallback_chute_id: ChuteId,
    generated_at: DateTime<Utc>,
}

impl SwitchingPath {
    /// Build a path, checking that sequence numbers run 1, 2, 3, ...
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if `segments` is empty or non-contiguous.
    pub fn new(
        target_chute_id: ChuteId,
        segments: Vec<PathSegment>,
        fallback_chute_id: ChuteId,
    ) -> Result<Self, PathError> {
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        for (index, segment) in segments.iter().enumerate() {
            let expected = index as u32 + 1;
            if segment.sequence != expected {
                return Err(PathError::NonContiguous {
                    index,
                    found: segment.sequence,
                    expected,
                });
            }
        }
        Ok(Self {
            target_chute_id,
            segments,
            fallback_chute_id,
            generated_at: Utc::now(),
        })
    }

    /// Chute this path delivers to.
    pub fn target_chute_id(&self) -> ChuteId {
        self.target_chute_id
    }

    /// Ordered diverter directives.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Chute the hardware falls back to if the path cannot be completed.
    pub fn fallback_chute_id(&self) -> ChuteId {
        self.fallback_chute_id
    }

    /// When the path was generated.
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Minimum time budget required to deliver the parcel along this path.
    pub fn total_ttl(&self) -> Duration {
        self.segments.iter().map(|s| s.ttl).sum()
    }
}

/// Result of executing a path on hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExecutionResult {
    /// Whether the parcel reached the target.
    pub success: bool,
    /// Chute the parcel physically ended up in, when known.
    pub actual_chute_id: ChuteId,
    /// Why execution failed, when it did.
    pub failure_reason: Option<String>,
    /// Segment that failed, when known.
    pub failed_segment: Option<PathSegment>,
}

impl PathExecutionResult {
    /// Successful delivery to `chute`.
    pub fn delivered(chute: ChuteId) -> Self {
        Self {
            success: true,
            actual_chute_id: chute,
            failure_reason: None,
            failed_segment: None,
        }
    }

    /// Failed delivery.
    pub fn failed(
        actual_chute_id: ChuteId,
        reason: impl Into<String>,
        failed_segment: Option<PathSegment>,
    ) -> Self {
        Self {
            success: false,
            actual_chute_id,
            failure_reason: Some(reason.into()),
            failed_segment,
        }
    }
}

/// Path generation and execution.
///
/// Both calls may block on I/O; the orchestrator awaits them per parcel and
/// never holds a lock across them.
#[async_trait]
pub trait PathPipeline: Send + Sync {
    /// Generate a switching path to `chute_id`, or `None` if unreachable.
    async fn generate_path(&self, chute_id: ChuteId) -> Option<SwitchingPath>;

    /// Execute `path` on hardware.
    ///
    /// A reported failure is `Ok` with `success == false`. `Err` means the
    /// executor itself faulted.
    async fn execute(&self, path: &SwitchingPath) -> Result<PathExecutionResult, SorterError>;
}

/// Receives path execution failures for operator diagnosis.
#[async_trait]
pub trait PathFailureHandler: Send + Sync {
    /// Handle a failed execution of `path` for `parcel_id`.
    async fn handle_failure(
        &self,
        parcel_id: ParcelId,
        path: &SwitchingPath,
        reason: &str,
        failed_segment: Option<&PathSegment>,
    );
}

/// Failure handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFailureHandler;

#[async_trait]
impl PathFailureHandler for LoggingFailureHandler {
    async fn handle_failure(
        &self,
        parcel_id: ParcelId,
        path: &SwitchingPath,
        reason: &str,
        failed_segment: Option<&PathSegment>,
    ) {
        error!(
            target: "sorter::path",
            parcel_id = %parcel_id,
            target_chute_id = %path.target_chute_id(),
            fallback_chute_id = %path.fallback_chute_id(),
            failed_diverter = ?failed_segment.map(|s| s.diverter_id.0),
            reason = reason,
            "path execution failed"
        );
    }
}

// ============================================================================
// Table-driven pipeline
// ============================================================================

/// Path pipeline backed by a static chute → directives table.
///
/// Sequence numbers are assigned at generation time. Diverters registered
/// as faulty make execution fail at their segment.
pub struct TablePathPipeline {
    routes: HashMap<ChuteId, Vec<(DiverterId, DiverterDirection, Duration)>>,
    fallback_chute_id: ChuteId,
    faulty: DashSet<DiverterId>,
    execute_delay: Duration,
}

impl TablePathPipeline {
    /// Create an empty table whose paths fall back to `fallback_chute_id`.
    pub fn new(fallback_chute_id: ChuteId) -> Self {
        Self {
            routes: HashMap::new(),
            fallback_chute_id,
            faulty: DashSet::new(),
            execute_delay: Duration::ZERO,
        }
    }

    /// Register the directives that reach `chute_id`.
    pub fn with_route(
        mut self,
        chute_id: ChuteId,
        directives: Vec<(DiverterId, DiverterDirection, Duration)>,
    ) -> Self {
        self.routes.insert(chute_id, directives);
        self
    }

    /// Simulated hardware time per execution.
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = delay;
        self
    }

    /// Mark a diverter as faulty so paths through it fail.
    pub fn mark_faulty(&self, diverter_id: DiverterId) {
        self.faulty.insert(diverter_id);
    }

    /// Clear a faulty mark.
    pub fn clear_faulty(&self, diverter_id: DiverterId) {
        self.faulty.remove(&diverter_id);
    }
}

#[async_trait]
impl PathPipeline for TablePathPipeline {
    async fn generate_path(&self, chute_id: ChuteId) -> Option<SwitchingPath> {
        let directives = self.routes.get(&chute_id)?;
        let segments = directives
            .iter()
            .enumerate()
            .map(|(i, (diverter_id, direction, ttl))| PathSegment {
                diverter_id: *diverter_id,
                direction: *direction,
                sequence: i as u32 + 1,
                ttl: *ttl,
            })
            .collect();
        match SwitchingPath::new(chute_id, segments, self.fallback_chute_id) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(target: "sorter::path", chute_id = %chute_id, error = %e, "invalid route table entry");
                None
            }
        }
    }

    async fn execute(&self, path: &SwitchingPath) -> Result<PathExecutionResult, SorterError> {
        if !self.execute_delay.is_zero() {
            tokio::time::sleep(self.execute_delay).await;
        }
        let failed = path
            .segments()
            .iter()
            .find(|s| self.faulty.contains(&s.diverter_id));
        Ok(match failed {
            Some(segment) => PathExecutionResult::failed(
                path.fallback_chute_id(),
                format!("diverter {} did not acknowledge", segment.diverter_id),
                Some(segment.clone()),
            ),
            None => PathExecutionResult::delivered(path.target_chute_id()),
        })
    }
}
