//! # Stage: Declarative Sorter Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload the TOML configuration of a sorter:
//! sorting mode, exception chute, chute lists, the upstream assignment
//! timeout, and the admission thresholds.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `SorterConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Hot-reloadable: file changes are validated before they reach [`ConfigHandle`].
//!   Only `[routing]` follows a reload; `[admission]` and `[health]` are read
//!   once, when an orchestrator is built from the handle
//! - Per-parcel consistency: each parcel takes one [`RoutingConfig`] snapshot
//!   at its start and uses it throughout
//!
//! ## NOT Responsible For
//! - Persisting configuration (read-only)
//! - Deciding a chute (that belongs to `selector`)

pub mod loader;
pub mod validation;
pub mod watcher;

use crate::ChuteId;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ── Default value functions ──────────────────────────────────────────────

/// Default upstream chute assignment timeout: 5000ms.
fn default_assignment_timeout_ms() -> u64 {
    5000
}

/// Default end-to-end time budget for one parcel: 15 s.
fn default_parcel_ttl_budget_ms() -> u64 {
    15_000
}

/// Default congestion sampling window: 60 s.
fn default_sample_window_s() -> u64 {
    60
}

fn default_warning_in_flight() -> usize {
    50
}

fn default_severe_in_flight() -> usize {
    100
}

fn default_critical_in_flight() -> usize {
    200
}

fn default_warning_latency_ms() -> u64 {
    3000
}

fn default_critical_latency_ms() -> u64 {
    8000
}

fn default_min_remaining_ttl_ms() -> u64 {
    500
}

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one sorter instance.
///
/// # Example
///
/// ```toml
/// [sorter]
/// name = "line-1"
///
/// [routing]
/// sorting_mode = "round_robin"
/// exception_chute_id = 999
/// available_chute_ids = [1, 2, 3]
///
/// [admission]
///
/// [health]
///
/// [observability]
/// log_format = "pretty"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SorterConfig {
    /// Sorter identity.
    pub sorter: SorterSection,
    /// Chute resolution settings.
    pub routing: RoutingSection,
    /// Congestion and overload settings.
    pub admission: AdmissionConfig,
    /// Node-health validation settings.
    pub health: HealthConfig,
    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Sorter identity metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SorterSection {
    /// Human-readable sorter name (e.g. "line-1").
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
}

// ── Routing ──────────────────────────────────────────────────────────────

/// How the target chute for a parcel is resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortingMode {
    /// Ask the upstream decision service.
    Formal,
    /// Always use the configured fixed chute.
    FixedChute,
    /// Rotate through the configured chute list.
    RoundRobin,
}

/// Chute resolution settings as written in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingSection {
    /// Active sorting mode.
    pub sorting_mode: SortingMode,
    /// Safe fallback chute. Must be positive.
    pub exception_chute_id: i64,
    /// Chute used in `fixed_chute` mode.
    pub fixed_chute_id: Option<i64>,
    /// Chutes rotated through in `round_robin` mode.
    #[serde(default)]
    pub available_chute_ids: Vec<i64>,
    /// How long to wait for an upstream assignment.
    #[serde(default = "default_assignment_timeout_ms")]
    pub chute_assignment_timeout_ms: u64,
}

impl RoutingSection {
    /// Typed snapshot used by the orchestrator.
    pub fn snapshot(&self) -> RoutingConfig {
        RoutingConfig {
            mode: self.sorting_mode,
            exception_chute_id: ChuteId(self.exception_chute_id),
            fixed_chute_id: self.fixed_chute_id.map(ChuteId),
            available_chute_ids: self.available_chute_ids.iter().copied().map(ChuteId).collect(),
            chute_assignment_timeout: Duration::from_millis(self.chute_assignment_timeout_ms),
        }
    }
}

/// Routing settings as seen by one parcel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Active sorting mode.
    pub mode: SortingMode,
    /// Safe fallback chute.
    pub exception_chute_id: ChuteId,
    /// Chute used in fixed mode.
    pub fixed_chute_id: Option<ChuteId>,
    /// Chutes rotated through in round-robin mode.
    pub available_chute_ids: Vec<ChuteId>,
    /// Upstream assignment deadline.
    pub chute_assignment_timeout: Duration,
}

/// Source of the routing settings current at a parcel's start.
pub trait RoutingConfigProvider: Send + Sync {
    /// Snapshot of the current routing settings.
    fn routing(&self) -> RoutingConfig;
}

impl RoutingConfigProvider for RoutingConfig {
    fn routing(&self) -> RoutingConfig {
        self.clone()
    }
}

// ── Admission ────────────────────────────────────────────────────────────

/// Congestion detection and overload policy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AdmissionConfig {
    /// Whether admission control runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Time from detection until the parcel passes the last usable exit.
    #[serde(default = "default_parcel_ttl_budget_ms")]
    pub parcel_ttl_budget_ms: u64,
    /// Rolling window over which completion latencies are sampled.
    #[serde(default = "default_sample_window_s")]
    pub sample_window_s: u64,
    /// In-flight count at which congestion is `Warning`.
    #[serde(default = "default_warning_in_flight")]
    pub warning_in_flight: usize,
    /// In-flight count at which congestion is `Severe`.
    #[serde(default = "default_severe_in_flight")]
    pub severe_in_flight: usize,
    /// In-flight count at which congestion is `Critical`.
    #[serde(default = "default_critical_in_flight")]
    pub critical_in_flight: usize,
    /// Average latency at which congestion is at least `Warning`.
    #[serde(default = "default_warning_latency_ms")]
    pub warning_latency_ms: u64,
    /// Maximum latency at which congestion is `Critical`.
    #[serde(default = "default_critical_latency_ms")]
    pub critical_latency_ms: u64,
    /// Remaining budget below which a parcel is forced to the exception chute.
    #[serde(default = "default_min_remaining_ttl_ms")]
    pub min_remaining_ttl_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parcel_ttl_budget_ms: default_parcel_ttl_budget_ms(),
            sample_window_s: default_sample_window_s(),
            warning_in_flight: default_warning_in_flight(),
            severe_in_flight: default_severe_in_flight(),
            critical_in_flight: default_critical_in_flight(),
            warning_latency_ms: default_warning_latency_ms(),
            critical_latency_ms: default_critical_latency_ms(),
            min_remaining_ttl_ms: default_min_remaining_ttl_ms(),
        }
    }
}

// ── Health ───────────────────────────────────────────────────────────────

/// Node-health validation settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HealthConfig {
    /// Validate generated paths against diverter health.
    #[serde(default = "default_true")]
    pub check_node_health: bool,
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration: logging and metrics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,
    /// Whether the Prometheus registry is initialised.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable log output.
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

/// Pick the log format: a recognised `LOG_FORMAT` value wins over the
/// configured one.
pub fn resolve_log_format(env: Option<&str>, configured: &LogFormat) -> LogFormat {
    match env.map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
        _ => configured.clone(),
    }
}

/// Export the JSON Schema for `SorterConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(SorterConfig);
    serde_json::to_string_pretty(&schema)
}

// ── Live handle ──────────────────────────────────────────────────────────

/// Shared, hot-swappable view of the current [`SorterConfig`].
///
/// Cloning is cheap; all clones observe the same configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<SorterConfig>>,
}

impl ConfigHandle {
    /// Wrap an already-validated configuration.
    pub fn new(config: SorterConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the whole current configuration.
    pub fn current(&self) -> SorterConfig {
        self.inner.read().clone()
    }

    /// Replace the configuration. Parcels already in progress keep theirs.
    ///
    /// Routing changes reach the next parcel; admission and health settings
    /// of orchestrators already built are left as they were.
    pub fn apply(&self, config: SorterConfig) {
        *self.inner.write() = config;
    }

    /// Apply every config broadcast by a [`watcher::ConfigWatcher`].
    pub fn follow(&self, mut rx: broadcast::Receiver<SorterConfig>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(config) => {
                        info!(
                            sorter = %config.sorter.name,
                            mode = ?config.routing.sorting_mode,
                            "applying reloaded sorter config"
                        );
                        handle.apply(config);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "config reloads skipped; waiting for the next one");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl RoutingConfigProvider for ConfigHandle {
    fn routing(&self) -> RoutingConfig {
        self.inner.read().routing.snapshot()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL_TOML: &str = r#"
[sorter]
name = "line-1"

[routing]
sorting_mode = "round_robin"
exception_chute_id = 999
available_chute_ids = [1, 2, 3]

[admission]

[health]

[observability]
log_format = "pretty"
"#;

    #[test]
    fn test_default_assignment_timeout_ms_returns_5000() {
        assert_eq!(default_assignment_timeout_ms(), 5000);
    }

    #[test]
    fn test_default_sample_window_s_returns_60() {
        assert_eq!(default_sample_window_s(), 60);
    }

    #[test]
    fn test_sorting_mode_serializes_to_snake_case() {
        let json = serde_json::to_string(&SortingMode::FixedChute).expect("test: serialization");
        assert_eq!(json, "\"fixed_chute\"");
    }

    #[test]
    fn test_sorting_mode_deserializes_from_snake_case() {
        let mode: SortingMode =
            serde_json::from_str("\"round_robin\"").expect("test: deserialization");
        assert_eq!(mode, SortingMode::RoundRobin);
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }

    #[test]
    fn test_minimal_toml_parses_with_defaults() {
        let config: SorterConfig = toml::from_str(MINIMAL_TOML).expect("test: minimal TOML parses");
        assert_eq!(config.sorter.name, "line-1");
        assert_eq!(config.routing.chute_assignment_timeout_ms, 5000);
        assert!(config.admission.enabled);
        assert_eq!(config.admission, AdmissionConfig::default());
        assert!(config.health.check_node_health);
        assert!(config.observability.metrics_enabled);
    }

    #[test]
    fn test_log_format_env_overrides_configured_value() {
        assert_eq!(resolve_log_format(None, &LogFormat::Json), LogFormat::Json);
        assert_eq!(resolve_log_format(Some("pretty"), &LogFormat::Json), LogFormat::Pretty);
        assert_eq!(resolve_log_format(Some(" JSON "), &LogFormat::Pretty), LogFormat::Json);
        // Unrecognised values leave the configured format alone.
        assert_eq!(resolve_log_format(Some("xml"), &LogFormat::Json), LogFormat::Json);
    }

    #[test]
    fn test_routing_snapshot_is_typed() {
        let config: SorterConfig = toml::from_str(MINIMAL_TOML).expect("test: minimal TOML parses");
        let routing = config.routing.snapshot();
        assert_eq!(routing.mode, SortingMode::RoundRobin);
        assert_eq!(routing.exception_chute_id, ChuteId(999));
        assert_eq!(
            routing.available_chute_ids,
            vec![ChuteId(1), ChuteId(2), ChuteId(3)]
        );
        assert_eq!(routing.chute_assignment_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_config_handle_apply_changes_next_snapshot_only() {
        let config: SorterConfig = toml::from_str(MINIMAL_TOML).expect("test: minimal TOML parses");
        let handle = ConfigHandle::new(config.clone());
        let before = handle.routing();

        let mut changed = config;
        changed.routing.sorting_mode = SortingMode::FixedChute;
        changed.routing.fixed_chute_id = Some(7);
        handle.apply(changed);

        assert_eq!(before.mode, SortingMode::RoundRobin);
        let after = handle.routing();
        assert_eq!(after.mode, SortingMode::FixedChute);
        assert_eq!(after.fixed_chute_id, Some(ChuteId(7)));
    }

    #[tokio::test]
    async fn test_config_handle_follow_applies_broadcast() {
        let config: SorterConfig = toml::from_str(MINIMAL_TOML).expect("test: minimal TOML parses");
        let handle = ConfigHandle::new(config.clone());
        let (tx, rx) = broadcast::channel(4);
        let task = handle.follow(rx);

        let mut changed = config;
        changed.routing.exception_chute_id = 500;
        tx.send(changed).expect("test: send");
        drop(tx);
        task.await.expect("test: follow task");

        assert_eq!(handle.routing().exception_chute_id, ChuteId(500));
    }
}
