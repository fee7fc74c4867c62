//! Per-parcel stage traces.
//!
//! Trace records are fire-and-forget: a sink must never block or fail the
//! orchestration. They are separate from diagnostic logging so that a
//! deployment can ship them to a parcel-audit store.

use crate::ParcelId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Stage a parcel reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParcelStage {
    /// Record created.
    Created,
    /// Admission forced the exception chute or flagged overflow.
    AdmissionDecided,
    /// Target chute resolved.
    ChuteResolved,
    /// Switching path generated.
    PathGenerated,
    /// A path was replaced by one to the exception chute.
    Rerouted,
    /// Path executed successfully.
    Delivered,
    /// Path execution reported a failure.
    ExecutionFailed,
    /// No path could be generated at all.
    HardFailure,
    /// Run state refused the parcel.
    Discarded,
    /// An unexpected fault was caught at the loop boundary.
    Faulted,
}

/// One stage transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRecord {
    /// Parcel concerned.
    pub parcel_id: ParcelId,
    /// Stage reached.
    pub stage: ParcelStage,
    /// Component that emitted the record.
    pub source: &'static str,
    /// When the stage was reached.
    pub occurred_at: DateTime<Utc>,
    /// Free-form detail.
    pub details: String,
}

impl TraceRecord {
    /// Record stamped now.
    pub fn now(
        parcel_id: ParcelId,
        stage: ParcelStage,
        source: &'static str,
        details: impl Into<String>,
    ) -> Self {
        Self {
            parcel_id,
            stage,
            source,
            occurred_at: Utc::now(),
            details: details.into(),
        }
    }
}

/// Receiver of [`TraceRecord`]s.
pub trait TraceSink: Send + Sync {
    /// Accept one record. Must not block.
    fn write(&self, record: TraceRecord);
}

/// Emits each record as an `info` event on target `sorter::trace`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTraceSink;

impl TraceSink for TracingTraceSink {
    fn write(&self, record: TraceRecord) {
        tracing::info!(
            target: "sorter::trace",
            parcel_id = %record.parcel_id,
            stage = ?record.stage,
            source = record.source,
            occurred_at = %record.occurred_at,
            details = %record.details,
            "parcel stage"
        );
    }
}

/// Keeps every record in memory. Intended for tests and the demo.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemoryTraceSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }

    /// Stages written for one parcel, in order.
    pub fn stages_for(&self, parcel_id: ParcelId) -> Vec<ParcelStage> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.parcel_id == parcel_id)
            .map(|r| r.stage)
            .collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn write(&self, record: TraceRecord) {
        self.records.lock().push(record);
    }
}
