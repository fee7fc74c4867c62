//! Prometheus metrics for the sorter.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** the orchestration
//! loop starts. The helper functions (`inc_parcel`, `inc_exception`, …) are
//! no-ops if `init_metrics` was never called, so sorting is always safe to
//! run and observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `sorter_parcels_total` | Counter | `outcome` |
//! | `sorter_exception_diversions_total` | Counter | `reason` |
//! | `sorter_upstream_requests_total` | Counter | `result` |
//! | `sorter_admission_decisions_total` | Counter | `decision` |
//! | `sorter_parcel_duration_seconds` | Histogram | |
//! | `sorter_parcels_in_flight` | Gauge | |

use crate::SorterError;
use prometheus::{
    core::Collector, CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the sorter, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Terminal parcel outcomes.
    pub parcels_total: CounterVec,
    /// Exception-chute diversions by reason.
    pub exception_diversions: CounterVec,
    /// Upstream route requests by result.
    pub upstream_requests: CounterVec,
    /// Admission decisions by kind.
    pub admission_decisions: CounterVec,
    /// Detection-to-outcome duration.
    pub parcel_duration: Histogram,
    /// Parcels currently being processed.
    pub parcels_in_flight: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn registered<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: Result<C, prometheus::Error>,
) -> Result<C, SorterError> {
    let collector = collector.map_err(|e| SorterError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| SorterError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build(prefix: &str) -> Result<Metrics, SorterError> {
    let registry = Registry::new();
    let name = |suffix: &str| format!("{prefix}_{suffix}");

    let parcels_total = registered(
        &registry,
        CounterVec::new(
            Opts::new(name("parcels_total"), "Parcels by terminal outcome"),
            &["outcome"],
        ),
    )?;
    let exception_diversions = registered(
        &registry,
        CounterVec::new(
            Opts::new(
                name("exception_diversions_total"),
                "Parcels routed to the exception chute, by reason",
            ),
            &["reason"],
        ),
    )?;
    let upstream_requests = registered(
        &registry,
        CounterVec::new(
            Opts::new(name("upstream_requests_total"), "Upstream route requests by result"),
            &["result"],
        ),
    )?;
    let admission_decisions = registered(
        &registry,
        CounterVec::new(
            Opts::new(name("admission_decisions_total"), "Admission control decisions"),
            &["decision"],
        ),
    )?;
    let parcel_duration = registered(
        &registry,
        Histogram::with_opts(HistogramOpts::new(
            name("parcel_duration_seconds"),
            "Time from detection to terminal outcome",
        )),
    )?;
    let parcels_in_flight = registered(
        &registry,
        IntGauge::new(name("parcels_in_flight"), "Parcels currently being processed"),
    )?;

    Ok(Metrics {
        registry,
        parcels_total,
        exception_diversions,
        upstream_requests,
        admission_decisions,
        parcel_duration,
        parcels_in_flight,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`SorterError::Other`] if metric construction or registry
/// registration fails.
pub fn init_metrics() -> Result<(), SorterError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(build("sorter")?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn inc_labelled(select: impl Fn(&Metrics) -> &CounterVec, label: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = select(m).get_metric_with_label_values(&[label]) {
            c.inc();
        }
    }
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one terminal parcel outcome (`delivered`, `exception_diverted`, …).
pub fn inc_parcel(outcome: &str) {
    inc_labelled(|m| &m.parcels_total, outcome);
}

/// Count one exception-chute diversion.
pub fn inc_exception(reason: &str) {
    inc_labelled(|m| &m.exception_diversions, reason);
}

/// Count one upstream route request result.
pub fn inc_upstream_request(result: &str) {
    inc_labelled(|m| &m.upstream_requests, result);
}

/// Count one admission decision (`admit`, `overflow`, `force_exception`).
pub fn inc_admission_decision(decision: &str) {
    inc_labelled(|m| &m.admission_decisions, decision);
}

/// Record how long a parcel took from detection to its outcome.
pub fn observe_parcel_duration(d: Duration) {
    if let Some(m) = metrics() {
        m.parcel_duration.observe(d.as_secs_f64());
    }
}

/// A parcel entered processing.
pub fn parcel_started() {
    if let Some(m) = metrics() {
        m.parcels_in_flight.inc();
    }
}

/// A parcel left processing.
pub fn parcel_finished() {
    if let Some(m) = metrics() {
        m.parcels_in_flight.dec();
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of the sorter counters.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Parcel counts keyed by outcome.
    pub parcels_total: HashMap<String, u64>,
    /// Exception diversions keyed by reason.
    pub exception_diversions: HashMap<String, u64>,
    /// Upstream requests keyed by result.
    pub upstream_requests: HashMap<String, u64>,
    /// Admission decisions keyed by decision.
    pub admission_decisions: HashMap<String, u64>,
    /// Parcels in flight right now.
    pub parcels_in_flight: i64,
}

fn counters_by_label(vec: &CounterVec, label: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == label)
                .map_or("unknown", |l| l.get_value());
            out.insert(key.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    out
}

fn summarize(m: &Metrics) -> MetricsSummary {
    MetricsSummary {
        parcels_total: counters_by_label(&m.parcels_total, "outcome"),
        exception_diversions: counters_by_label(&m.exception_diversions, "reason"),
        upstream_requests: counters_by_label(&m.upstream_requests, "result"),
        admission_decisions: counters_by_label(&m.admission_decisions, "decision"),
        parcels_in_flight: m.parcels_in_flight.get(),
    }
}

/// Return a structured summary of current metric values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    metrics().map(summarize).unwrap_or_default()
}
