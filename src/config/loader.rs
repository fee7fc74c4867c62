//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`SorterConfig`], and run
//! validation before returning. This is the entry point for loading
//! sorter configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Hot-reloading on file changes (that belongs to `watcher`)
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::SorterConfig;

/// Load a [`SorterConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(SorterConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Example
///
/// ```rust,ignore
/// use parcel_sort_orchestrator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("sorter.toml"))?;
/// println!("Loaded sorter: {}", config.sorter.name);
/// ```
pub fn load_from_file(path: &Path) -> Result<SorterConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`SorterConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
pub fn load_from_str(content: &str, source_name: &str) -> Result<SorterConfig, ConfigError> {
    let config: SorterConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::MINIMAL_TOML;
    use crate::config::SortingMode;
    use std::io::Write;

    const FORMAL_TOML: &str = r#"
[sorter]
name = "line-2"
description = "north hall"

[routing]
sorting_mode = "formal"
exception_chute_id = 999
chute_assignment_timeout_ms = 250

[admission]
enabled = false

[health]
check_node_health = false

[observability]
log_format = "json"
metrics_enabled = false
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(FORMAL_TOML, "test").expect("test: valid config");
        assert_eq!(config.sorter.name, "line-2");
        assert_eq!(config.routing.sorting_mode, SortingMode::Formal);
        assert_eq!(config.routing.chute_assignment_timeout_ms, 250);
        assert!(!config.admission.enabled);
        assert!(!config.health.check_node_health);
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let err = load_from_str("not valid toml [[[", "bad.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_validation_failure_returns_validation_error() {
        let toml_str = MINIMAL_TOML.replace("exception_chute_id = 999", "exception_chute_id = 0");
        let err = load_from_str(&toml_str, "zero-exception.toml").unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("routing.exception_chute_id")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_str_unknown_mode_returns_parse_error() {
        let toml_str = MINIMAL_TOML.replace("\"round_robin\"", "\"random\"");
        let err = load_from_str(&toml_str, "mode.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_source_name_appears_in_error() {
        let err = load_from_str("invalid [[[", "my-source.toml").unwrap_err();
        assert!(err.to_string().contains("my-source.toml"));
    }

    #[test]
    fn test_load_from_file_valid_toml_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("sorter.toml");
        let mut f = std::fs::File::create(&path).expect("test: create file");
        f.write_all(MINIMAL_TOML.as_bytes()).expect("test: write");
        drop(f);

        let config = load_from_file(&path).expect("test: load from file");
        assert_eq!(config.sorter.name, "line-1");
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let err = load_from_file(Path::new("/nonexistent/path/sorter.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
