//! Configuration resolution tests
//!
//! Uses serial_test: tests that manipulate AQUASCAN_* environment variables
//! are marked #[serial] so they never run in parallel.

use aquascan_common::config::{load_toml_config, ClientConfig, ENV_API_URL, ENV_LOG_LEVEL};
use aquascan_common::Error;
use serial_test::serial;
use std::env;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

fn clear_env() {
    env::remove_var(ENV_API_URL);
    env::remove_var(ENV_LOG_LEVEL);
}

#[test]
#[serial]
fn test_missing_explicit_file_uses_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let config = ClientConfig::resolve(None, Some(&missing)).unwrap();
    assert_eq!(config, ClientConfig::default());
}

#[test]
#[serial]
fn test_toml_values_applied() {
    clear_env();
    let file = write_config(
        r#"
        api_url = "http://detector.lab:8080"
        request_timeout_secs = 12
        cache_ttl_secs = 60
        page_size = 25
        "#,
    );

    let config = ClientConfig::resolve(None, Some(file.path())).unwrap();
    assert_eq!(config.api_url, "http://detector.lab:8080");
    assert_eq!(config.request_timeout_secs, 12);
    assert_eq!(config.cache_ttl_secs, 60);
    assert_eq!(config.page_size, 25);
    assert_eq!(config.poll_interval_ms, 3000);
}

#[test]
#[serial]
fn test_env_overrides_toml() {
    clear_env();
    let file = write_config(
        r#"
        api_url = "http://from-toml:5000"

        [logging]
        level = "warn"
        "#,
    );
    env::set_var(ENV_API_URL, "http://from-env:5000");
    env::set_var(ENV_LOG_LEVEL, "trace");

    let config = ClientConfig::resolve(None, Some(file.path())).unwrap();
    clear_env();

    assert_eq!(config.api_url, "http://from-env:5000");
    assert_eq!(config.log_level, "trace");
}

#[test]
#[serial]
fn test_cli_overrides_env() {
    clear_env();
    env::set_var(ENV_API_URL, "http://from-env:5000");
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("config.toml");

    let config = ClientConfig::resolve(Some("https://from-cli"), Some(&missing)).unwrap();
    clear_env();

    assert_eq!(config.api_url, "https://from-cli");
}

#[test]
#[serial]
fn test_malformed_toml_is_config_error() {
    clear_env();
    let file = write_config("api_url = [not toml");

    let result = ClientConfig::resolve(None, Some(file.path()));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_invalid_url_rejected_after_resolution() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("config.toml");

    let result = ClientConfig::resolve(Some("ftp://nope"), Some(&missing));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_load_toml_config_unknown_keys_ignored() {
    let file = write_config(
        r#"
        poll_interval_ms = 500
        theme = "dark"
        "#,
    );
    let toml_config = load_toml_config(file.path()).unwrap();
    assert_eq!(toml_config.poll_interval_ms, Some(500));
    assert!(toml_config.api_url.is_none());
}
