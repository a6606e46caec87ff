// Configuration loading tests

use std::fs;
use std::path::PathBuf;
use telemetry_pipeline::config::{load_config, load_config_with_env, ConfigLoader};
use tempfile::TempDir;

const SAMPLE: &str = r#"
store:
  backend: sqlite
  path: ${TELEMETRY_CFG_TEST_STORE:-/tmp/telemetry-test.db}
  max_records: 500

http:
  timeout_seconds: 10

ingestion:
  app_secret: ${TELEMETRY_CFG_TEST_SECRET}
  install_id: 3f1a6f7e-0000-4000-8000-000000000001

channels:
  - destination: analytics
    base_url: https://in.example.com
    batch:
      max_count: 20
      flush_interval_ms: 500
    retry:
      base_delay_ms: 2000
      max_retries: 3
  - destination: crashes
    base_url: https://in.example.com
    enabled: false

one_collector:
  base_url: https://alt.example
  categories: [crash]

event_filter:
  blocked_categories: [debug]

logging:
  level: debug
  format: json
"#;

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("pipeline.yaml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_default_config() {
    let config_path = PathBuf::from("config/default.yaml");

    if config_path.exists() {
        let result = load_config(&config_path);
        assert!(result.is_ok(), "Failed to load default config: {:?}", result.err());

        let config = result.unwrap();
        assert_eq!(config.store.backend, "sqlite");
        assert_eq!(config.channels.len(), 2);
        assert!(config.channel("analytics").is_some());
        assert_eq!(config.logging.level, "info");
    }
}

#[test]
fn test_load_full_config() {
    std::env::set_var("TELEMETRY_CFG_TEST_SECRET", "secret-from-env");
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, SAMPLE);

    let config = load_config(&path).unwrap();

    assert_eq!(config.store.path, "/tmp/telemetry-test.db");
    assert_eq!(config.store.max_records, 500);
    assert_eq!(config.http.timeout_seconds, 10);
    assert_eq!(config.http.compression_threshold_bytes, 1400);
    assert_eq!(config.ingestion.app_secret.as_deref(), Some("secret-from-env"));

    let analytics = config.channel("analytics").unwrap();
    assert!(analytics.enabled);
    assert_eq!(analytics.batch.max_count, 20);
    assert_eq!(analytics.batch.max_bytes, 1024 * 1024);
    assert_eq!(analytics.retry.base_delay_ms, 2000);
    assert_eq!(analytics.retry.max_delay_ms, 20 * 60 * 1000);

    assert!(!config.channel("crashes").unwrap().enabled);
    assert_eq!(config.one_collector.unwrap().categories, vec!["crash"]);
    assert_eq!(config.event_filter.blocked_categories, vec!["debug"]);
    assert_eq!(config.logging.format, "json");

    std::env::remove_var("TELEMETRY_CFG_TEST_SECRET");
}

#[test]
fn test_env_overrides() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, SAMPLE);

    std::env::set_var("TELEMETRY_ONE_COLLECTOR_URL", "https://alt2.example");
    let config = load_config_with_env(&path).unwrap();
    std::env::remove_var("TELEMETRY_ONE_COLLECTOR_URL");

    assert_eq!(config.one_collector.unwrap().base_url, "https://alt2.example");
}

#[test]
fn test_invalid_configs_are_rejected() {
    let missing_channels = "store:\n  backend: memory\n";
    assert!(ConfigLoader::parse(missing_channels).is_err());

    let bad_backend = r#"
store:
  backend: postgres
channels:
  - destination: analytics
    base_url: https://in.example.com
"#;
    let error = ConfigLoader::parse(bad_backend).unwrap_err();
    assert!(error.to_string().contains("Unknown store backend"));

    let bad_retry = r#"
channels:
  - destination: analytics
    base_url: https://in.example.com
    retry:
      base_delay_ms: 5000
      max_delay_ms: 1000
"#;
    assert!(ConfigLoader::parse(bad_retry).is_err());

    let zero_interval = r#"
channels:
  - destination: analytics
    base_url: https://in.example.com
    batch:
      flush_interval_ms: 0
"#;
    let error = ConfigLoader::parse(zero_interval).unwrap_err();
    assert!(error.to_string().contains("flush_interval_ms"));
}

#[test]
fn test_missing_file() {
    let result = load_config("/nonexistent/pipeline.yaml");
    assert!(result.is_err());
}
