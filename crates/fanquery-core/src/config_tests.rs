//! Tests for `config` module

use std::io::Write;
use std::time::Duration;

use serial_test::serial;
use tempfile::NamedTempFile;

use super::config::*;

#[test]
fn test_defaults() {
    let config = FanqueryConfig::default();
    assert_eq!(config.cache.gc_time(), Duration::ZERO);
    assert_eq!(config.cache.stale_time(), Duration::ZERO);
    assert_eq!(
        config.cache.slow_fetch_threshold(),
        Some(Duration::from_secs(1))
    );
    assert_eq!(config.batch.max_queries, None);
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, LogFormat::Compact);
    assert!(config.validate().is_ok());
}

#[test]
fn test_slow_fetch_threshold_zero_disables() {
    let cache = CacheConfig {
        slow_fetch_threshold_ms: 0,
        ..CacheConfig::default()
    };
    assert_eq!(cache.slow_fetch_threshold(), None);
}

#[test]
fn test_from_toml_str_partial_overrides() {
    let config = FanqueryConfig::from_toml_str(
        r#"
        [cache]
        gc_time_ms = 300000

        [logging]
        format = "json"
        "#,
    )
    .unwrap();

    assert_eq!(config.cache.gc_time(), Duration::from_secs(300));
    assert_eq!(config.cache.stale_time_ms, 0);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_from_toml_str_rejects_zero_max_queries() {
    let err = FanqueryConfig::from_toml_str("[batch]\nmax_queries = 0\n").unwrap_err();
    assert_eq!(
        err,
        ConfigError::Invalid {
            field: "batch.max_queries",
            reason: "must be at least 1".to_string(),
        }
    );
}

#[test]
fn test_from_toml_str_rejects_empty_level() {
    let err = FanqueryConfig::from_toml_str("[logging]\nlevel = \"  \"\n").unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            field: "logging.level",
            ..
        }
    ));
}

#[test]
fn test_from_toml_str_bad_type_is_load_error() {
    let err = FanqueryConfig::from_toml_str("[cache]\ngc_time_ms = \"soon\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Load(_)));
}

#[test]
fn test_to_toml_round_trips() {
    let mut config = FanqueryConfig::default();
    config.cache.stale_time_ms = 250;
    config.logging.format = LogFormat::Pretty;

    let rendered = config.to_toml().unwrap();
    assert!(rendered.contains("stale_time_ms = 250"));
    assert_eq!(FanqueryConfig::from_toml_str(&rendered).unwrap(), config);
}

#[test]
#[serial]
fn test_from_file_missing_is_error() {
    let err = FanqueryConfig::from_file("/nonexistent/fanquery.toml").unwrap_err();
    assert!(err.to_string().contains("config file not found"));
}

#[test]
#[serial]
fn test_from_file_reads_toml() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[batch]\nmax_queries = 8").unwrap();

    let config = FanqueryConfig::from_file(file.path()).unwrap();
    assert_eq!(config.batch.max_queries, Some(8));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[cache]\ngc_time_ms = 10").unwrap();

    std::env::set_var("FANQUERY_CACHE__GC_TIME_MS", "20");
    let config = FanqueryConfig::from_file(file.path());
    std::env::remove_var("FANQUERY_CACHE__GC_TIME_MS");

    assert_eq!(config.unwrap().cache.gc_time_ms, 20);
}
