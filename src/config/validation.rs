//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`SorterConfig`] that cannot
//! be expressed through the type system alone (positive chute ids, ordered
//! thresholds, mode-specific requirements).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//! - An empty round-robin list is accepted with a warning; the selector
//!   falls back to the exception chute at runtime
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{SorterConfig, SortingMode};
use tracing::warn;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "routing.exception_chute_id").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Validate all semantic constraints on a [`SorterConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &SorterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let routing = &config.routing;

    // ── Sorter name non-empty ────────────────────────────────────────
    if config.sorter.name.trim().is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "sorter.name".into(),
            value: String::new(),
            reason: "sorter name must not be empty".into(),
        });
    }

    // ── Exception chute ──────────────────────────────────────────────
    if routing.exception_chute_id <= 0 {
        errors.push(ConfigError::InvalidField {
            field: "routing.exception_chute_id".into(),
            value: routing.exception_chute_id.to_string(),
            reason: "must be a positive chute id".into(),
        });
    }

    // ── Fixed chute ──────────────────────────────────────────────────
    match routing.fixed_chute_id {
        Some(id) if id <= 0 => errors.push(ConfigError::InvalidField {
            field: "routing.fixed_chute_id".into(),
            value: id.to_string(),
            reason: "must be a positive chute id".into(),
        }),
        None if routing.sorting_mode == SortingMode::FixedChute => {
            errors.push(ConfigError::InvalidField {
                field: "routing.fixed_chute_id".into(),
                value: "none".into(),
                reason: "required when sorting_mode = \"fixed_chute\"".into(),
            })
        }
        _ => {}
    }

    // ── Available chutes ─────────────────────────────────────────────
    for (i, id) in routing.available_chute_ids.iter().enumerate() {
        if *id <= 0 {
            errors.push(ConfigError::InvalidField {
                field: format!("routing.available_chute_ids[{i}]"),
                value: id.to_string(),
                reason: "must be a positive chute id".into(),
            });
        }
    }

    if routing.sorting_mode == SortingMode::RoundRobin && routing.available_chute_ids.is_empty() {
        warn!(
            field = "routing.available_chute_ids",
            "round_robin mode with no chutes; every parcel will go to the exception chute"
        );
    }

    // ── Assignment timeout ───────────────────────────────────────────
    if routing.chute_assignment_timeout_ms == 0 {
        errors.push(ConfigError::InvalidField {
            field: "routing.chute_assignment_timeout_ms".into(),
            value: "0".into(),
            reason: "timeout must be at least 1ms".into(),
        });
    }

    // ── Admission thresholds ─────────────────────────────────────────
    let admission = &config.admission;
    if admission.sample_window_s == 0 {
        errors.push(ConfigError::InvalidField {
            field: "admission.sample_window_s".into(),
            value: "0".into(),
            reason: "sample window must be at least 1s".into(),
        });
    }

    if admission.parcel_ttl_budget_ms == 0 {
        errors.push(ConfigError::InvalidField {
            field: "admission.parcel_ttl_budget_ms".into(),
            value: "0".into(),
            reason: "parcel time budget must be at least 1ms".into(),
        });
    }

    if admission.warning_in_flight > admission.severe_in_flight {
        errors.push(ConfigError::InvalidField {
            field: "admission.warning_in_flight".into(),
            value: admission.warning_in_flight.to_string(),
            reason: "must be \u{2264} severe_in_flight".into(),
        });
    }

    if admission.severe_in_flight > admission.critical_in_flight {
        errors.push(ConfigError::InvalidField {
            field: "admission.severe_in_flight".into(),
            value: admission.severe_in_flight.to_string(),
            reason: "must be \u{2264} critical_in_flight".into(),
        });
    }

    if admission.warning_latency_ms > admission.critical_latency_ms {
        errors.push(ConfigError::InvalidField {
            field: "admission.warning_latency_ms".into(),
            value: admission.warning_latency_ms.to_string(),
            reason: "must be \u{2264} critical_latency_ms".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    /// Helper to build a valid config that can be mutated for negative tests.
    fn valid_config() -> SorterConfig {
        SorterConfig {
            sorter: SorterSection {
                name: "line-1".into(),
                description: None,
            },
            routing: RoutingSection {
                sorting_mode: SortingMode::Formal,
                exception_chute_id: 999,
                fixed_chute_id: None,
                available_chute_ids: vec![1, 2, 3],
                chute_assignment_timeout_ms: 5000,
            },
            admission: AdmissionConfig::default(),
            health: HealthConfig {
                check_node_health: true,
            },
            observability: ObservabilityConfig {
                log_format: LogFormat::Pretty,
                metrics_enabled: true,
            },
        }
    }

    fn fields(errors: &[ConfigError]) -> Vec<String> {
        errors
            .iter()
            .filter_map(|e| match e {
                ConfigError::InvalidField { field, .. } => Some(field.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_validate_valid_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_empty_sorter_name_fails() {
        let mut config = valid_config();
        config.sorter.name = "  ".into();
        let errors = validate(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["sorter.name"]);
    }

    #[test]
    fn test_validate_zero_exception_chute_fails() {
        let mut config = valid_config();
        config.routing.exception_chute_id = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["routing.exception_chute_id"]);
    }

    #[test]
    fn test_validate_fixed_mode_without_fixed_chute_fails() {
        let mut config = valid_config();
        config.routing.sorting_mode = SortingMode::FixedChute;
        let errors = validate(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["routing.fixed_chute_id"]);
    }

    #[test]
    fn test_validate_negative_fixed_chute_fails_in_any_mode() {
        let mut config = valid_config();
        config.routing.fixed_chute_id = Some(-1);
        let errors = validate(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["routing.fixed_chute_id"]);
    }

    #[test]
    fn test_validate_non_positive_available_chute_fails() {
        let mut config = valid_config();
        config.routing.available_chute_ids = vec![1, 0, 3];
        let errors = validate(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["routing.available_chute_ids[1]"]);
    }

    #[test]
    fn test_validate_round_robin_empty_list_passes_with_warning() {
        let mut config = valid_config();
        config.routing.sorting_mode = SortingMode::RoundRobin;
        config.routing.available_chute_ids.clear();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_timeout_fails() {
        let mut config = valid_config();
        config.routing.chute_assignment_timeout_ms = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["routing.chute_assignment_timeout_ms"]);
    }

    #[test]
    fn test_validate_zero_sample_window_fails() {
        let mut config = valid_config();
        config.admission.sample_window_s = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["admission.sample_window_s"]);
    }

    #[test]
    fn test_validate_unordered_in_flight_thresholds_fail() {
        let mut config = valid_config();
        config.admission.warning_in_flight = 300;
        config.admission.severe_in_flight = 250;
        let errors = validate(&config).unwrap_err();
        assert_eq!(
            fields(&errors),
            vec!["admission.warning_in_flight", "admission.severe_in_flight"]
        );
    }

    #[test]
    fn test_validate_unordered_latency_thresholds_fail() {
        let mut config = valid_config();
        config.admission.warning_latency_ms = 9000;
        let errors = validate(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["admission.warning_latency_ms"]);
    }

    #[test]
    fn test_validate_collects_multiple_errors() {
        let mut config = valid_config();
        config.routing.exception_chute_id = -5;
        config.routing.chute_assignment_timeout_ms = 0;
        config.admission.parcel_ttl_budget_ms = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_config_error_invalid_field_display() {
        let err = ConfigError::InvalidField {
            field: "routing.exception_chute_id".into(),
            value: "0".into(),
            reason: "must be a positive chute id".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("routing.exception_chute_id"));
        assert!(msg.contains("positive"));
    }

    #[test]
    fn test_config_error_io_display() {
        let err = ConfigError::Io {
            file: "sorter.toml".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("sorter.toml"));
    }
}
