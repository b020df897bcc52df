use std::io::Write;
use std::path::PathBuf;

use sluice_core::config::{AppConfig, MetadataBackendKind};
use sluice_core::error::SluiceError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[pipeline]
name = "haiku-retraining"
workspace = "/tmp/sluice-test"
event_capacity = 2048

[monitor]
poll_interval_ms = 250
max_retries = 3
initial_backoff_ms = 100
max_backoff_ms = 5000

[metadata]
name = "metadata_store"
backend = "sqlite"
path = "metadata_store/metadata.db"

[log]
level = 3
log_dir = "logs/events"

[export]
dir = "ipfsjson"

[[resources]]
name = "haiku_data_store"
path = "haiku"
include = '\.txt$'
max_old = 5

[[resources]]
name = "model_registry"
path = "model_registry"
monitoring = false
trigger_threshold = 0

[[resources]]
name = "plots_store"
path = "/data/plots"
monitoring = false
trigger_threshold = 0
delete_evicted = true
predecessors = ["metadata_store"]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.pipeline.name, "haiku-retraining");
    assert_eq!(config.pipeline.event_capacity, 2048);
    assert_eq!(config.monitor.poll_interval_ms, 250);
    assert_eq!(config.monitor.max_retries, 3);
    assert_eq!(config.metadata.backend, MetadataBackendKind::Sqlite);
    assert_eq!(
        config.resolve(&config.metadata.path),
        PathBuf::from("/tmp/sluice-test/metadata_store/metadata.db")
    );
    assert_eq!(
        config.log_dir(),
        Some(PathBuf::from("/tmp/sluice-test/logs/events"))
    );
    assert_eq!(config.export.as_ref().expect("export present").dir, "ipfsjson");

    assert_eq!(config.resources.len(), 3);
    let haiku = &config.resources[0];
    assert!(haiku.monitoring);
    assert_eq!(haiku.include.as_deref(), Some(r"\.txt$"));
    assert_eq!(haiku.max_old, Some(5));

    let registry = &config.resources[1];
    assert!(!registry.monitoring);
    assert_eq!(registry.trigger_threshold, 0);

    let plots = &config.resources[2];
    assert!(plots.delete_evicted);
    assert_eq!(plots.predecessors, vec!["metadata_store"]);
    assert_eq!(config.resolve(&plots.path), PathBuf::from("/data/plots"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("SLUICE_TEST_WORKSPACE", "/srv/expanded");

    let toml_content = r#"
[pipeline]
workspace = "${SLUICE_TEST_WORKSPACE}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.workspace_dir(), PathBuf::from("/srv/expanded"));

    std::env::remove_var("SLUICE_TEST_WORKSPACE");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[pipeline]
name = "minimal"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.pipeline.workspace, "./sluice-workspace");
    assert_eq!(config.pipeline.event_capacity, 1024);
    assert_eq!(config.monitor.poll_interval_ms, 500);
    assert_eq!(config.monitor.initial_backoff_ms, 200);
    assert_eq!(config.monitor.max_backoff_ms, 10_000);
    assert_eq!(config.metadata.name, "metadata_store");
    assert_eq!(config.metadata.path, "metadata/metadata.db");
    assert!(config.log.is_none());
    assert!(config.export.is_none());
    assert!(config.resources.is_empty());
}

#[test]
fn test_log_section_defaults_to_enabled_level_two() {
    let toml_content = r#"
[pipeline]
workspace = "/tmp/sluice-log"

[log]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 2);
    assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/sluice-log/logs")));
}

#[test]
fn test_invalid_log_level_rejected() {
    let toml_content = r#"
[log]
level = 7
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(SluiceError::Config(msg)) if msg.contains("log.level")
    ));
}

#[test]
fn test_unknown_backend_rejected() {
    let toml_content = r#"
[metadata]
backend = "postgres"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(SluiceError::Config(_))
    ));
}

#[test]
fn test_missing_file_reported() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let missing = dir.path().join("nope.toml");
    assert!(matches!(
        AppConfig::load(&missing),
        Err(SluiceError::ConfigNotFound(path)) if path.ends_with("nope.toml")
    ));
}
