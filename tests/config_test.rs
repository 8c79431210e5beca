//! Configuration loading: TOML files and environment overrides

use std::io::Write;

use cadence::config::Config;
use cadence::coordination::FailurePolicy;
use serial_test::serial;
use tempfile::NamedTempFile;

const ENV_KEYS: &[&str] = &[
    "CADENCE_INSTANCE_ID",
    "CADENCE_LEASE_TTL_SECS",
    "CADENCE_FAILURE_POLICY",
    "CADENCE_RATE_LIMIT_GLOBAL_CAP",
    "CADENCE_POLL_ACTIVE_SECS",
    "CADENCE_PUBLISH_MAX_ATTEMPTS",
    "CADENCE_REDIS_URL",
    "REDIS_URL",
    "CADENCE_DATABASE_URL",
    "DATABASE_URL",
    "CADENCE_LOG_FORMAT",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_env_overrides_defaults() {
    clear_env();
    std::env::set_var("CADENCE_LEASE_TTL_SECS", "45");
    std::env::set_var("CADENCE_FAILURE_POLICY", "fail-open");
    std::env::set_var("CADENCE_RATE_LIMIT_GLOBAL_CAP", "150");
    std::env::set_var("DATABASE_URL", "postgresql://db.internal/cadence");

    let config = Config::from_env().unwrap();
    clear_env();

    assert_eq!(config.coordination.lease_ttl_secs, 45);
    assert_eq!(config.coordination.failure_policy, FailurePolicy::FailOpen);
    assert_eq!(config.rate_limit.global_cap, 150);
    assert_eq!(config.database.postgres_url, "postgresql://db.internal/cadence");
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_unparsable_env_keeps_default() {
    clear_env();
    std::env::set_var("CADENCE_LEASE_TTL_SECS", "thirty");
    std::env::set_var("CADENCE_FAILURE_POLICY", "sometimes");

    let config = Config::from_env().unwrap();
    clear_env();

    let defaults = Config::default();
    assert_eq!(config.coordination.lease_ttl_secs, defaults.coordination.lease_ttl_secs);
    assert_eq!(config.coordination.failure_policy, FailurePolicy::FailClosed);
}

#[test]
#[serial]
fn test_empty_redis_url_disables_queue() {
    clear_env();
    std::env::set_var("REDIS_URL", "");

    let config = Config::from_env().unwrap();
    clear_env();

    assert!(!config.redis.is_enabled());
}

#[test]
#[serial]
fn test_file_then_env() {
    clear_env();
    let file = write_config(
        r#"
[coordination]
instance_id = "node-a"
lease_ttl_secs = 60

[polling]
active_interval_secs = 90

[publish]
max_attempts = 5

[logging]
format = "json"
"#,
    );

    std::env::set_var("CADENCE_PUBLISH_MAX_ATTEMPTS", "4");
    let config = Config::load(Some(file.path())).unwrap();
    clear_env();

    assert_eq!(config.coordination.instance_id, "node-a");
    assert_eq!(config.coordination.lease_ttl_secs, 60);
    assert_eq!(config.polling.active_interval_secs, 90);
    // Environment wins over the file
    assert_eq!(config.publish.max_attempts, 4);
    assert_eq!(config.logging.format, "json");
    // Sections missing from the file keep defaults
    assert_eq!(config.rate_limit.global_cap, Config::default().rate_limit.global_cap);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    clear_env();
    let file = write_config(
        r#"
[server]
bind_address = "not-an-address"
"#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.publish.max_attempts = 0;
    let err = config.validate().unwrap_err();
    assert!(format!("{err:#}").contains("[publish]"));
}

#[test]
fn test_missing_file_reports_path() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/cadence.toml")).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/cadence.toml"));
}
