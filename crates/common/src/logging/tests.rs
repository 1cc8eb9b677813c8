//! Unit tests for the logging subsystem.

use tracing::{info, subscriber};
use tracing_subscriber::fmt::format::FmtSpan;

use super::*;

#[test]
fn test_logger_config_builder_pattern() {
    let config = LoggerConfig::new("test-service".to_string())
        .with_json_logging(true)
        .with_filter("tumbler_client=debug")
        .with_fmt_span(FmtSpan::NONE);

    assert_eq!(config.service_name, "test-service");
    assert_eq!(config.filter.as_deref(), Some("tumbler_client=debug"));
    assert!(config.stdout_config.json_format);
    assert_eq!(config.stdout_config.fmt_span, FmtSpan::NONE);
    assert!(config.file_logging_config.is_none());
}

#[test]
fn test_file_logging_config_defaults() {
    let config = FileLoggingConfig::new("/tmp/logs".into(), "tumbler".to_string());
    assert_eq!(config.rotation, Rotation::DAILY);
    assert!(!config.json_format);

    let config = config
        .with_rotation(Rotation::HOURLY)
        .with_json_format(true);
    assert_eq!(config.rotation, Rotation::HOURLY);
    assert!(config.json_format);
}

#[test]
fn test_format_service_name() {
    assert_eq!(format_service_name("tumbler", None), "tumbler");
    assert_eq!(format_service_name("tumbler", Some("dev")), "tumbler%dev");
}

#[test]
fn test_scoped_subscriber_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoggerConfig::new("test-service".to_string()).with_file_logging(
        FileLoggingConfig::new(dir.path().to_path_buf(), "tumbler".to_string())
            .with_rotation(Rotation::NEVER),
    );

    let sub = build_subscriber(&config).unwrap();
    subscriber::with_default(sub, || {
        info!(cycle = 42, "hello from the test");
    });

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);

    let contents = std::fs::read_to_string(&entries[0]).unwrap();
    assert!(contents.contains("hello from the test"));
    assert!(contents.contains("cycle=42"));
}
