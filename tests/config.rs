//! Configuration and input-validation robustness tests.
//!
//! These exercise the public API with the kinds of malformed input a
//! daemon meets in the field: missing files, broken YAML, out-of-range
//! values, and hostile IP strings.

use ghostwarden::config::{ClusterConfig, Config};
use ghostwarden::decision::validate_ipv4_or_cidr;
use ghostwarden::sinks::cluster::url_encode;
use ghostwarden::WardenError;
use std::io::Write;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const MINIMAL: &str = r#"
cluster:
  url: "https://pve.internal:8006/api2/json"
  token_id: "root@pam!warden"
  token_secret: "secret"
"#;

#[test]
fn test_load_minimal_config() {
    let file = write_config(MINIMAL);
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.sync_interval_seconds, 60);
    assert_eq!(config.cluster.ipset_name, "ghostwarden");
    assert!(config.lapi.is_none());
    assert!(config.local.is_none());
}

#[test]
fn test_load_missing_file_is_configuration_error() {
    let result = Config::load("/nonexistent/path/ghostwarden.yaml");
    assert!(matches!(result, Err(WardenError::Configuration(_))));
}

#[test]
fn test_load_malformed_yaml_is_configuration_error() {
    let file = write_config("{{{{not valid yaml");
    assert!(matches!(
        Config::load(file.path()),
        Err(WardenError::Configuration(_))
    ));
}

#[test]
fn test_load_rejects_interval_below_floor() {
    let file = write_config(&format!("{}\nsync_interval_seconds: 3\n", MINIMAL));
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn test_load_rejects_missing_cluster_section() {
    let file = write_config("sync_interval_seconds: 60\n");
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn test_load_rejects_lapi_without_key() {
    let file = write_config(&format!(
        "{}\nlapi:\n  url: \"https://lapi.internal:8080\"\n  api_key: \"\"\n",
        MINIMAL
    ));
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn test_unknown_fields_are_tolerated() {
    // Forward compatibility: an operator running a newer config against an
    // older daemon should not be locked out.
    let file = write_config(&format!("{}\nfuture_feature: true\n", MINIMAL));
    assert!(Config::load(file.path()).is_ok());
}

#[test]
fn test_validate_is_pure() {
    let config = Config {
        cluster: ClusterConfig {
            url: "https://pve.internal:8006/api2/json".to_string(),
            token_id: "root@pam!warden".to_string(),
            token_secret: "secret".to_string(),
            ..ClusterConfig::default()
        },
        ..Config::default()
    };
    assert!(config.validate().is_ok());
    assert!(config.validate().is_ok());
}

#[test]
fn test_ip_validation_edge_cases() {
    assert!(validate_ipv4_or_cidr("0.0.0.0").is_ok());
    assert!(validate_ipv4_or_cidr("255.255.255.255").is_ok());
    assert!(validate_ipv4_or_cidr("0.0.0.0/0").is_ok());
    assert!(validate_ipv4_or_cidr("203.0.113.0/32").is_ok());

    assert!(validate_ipv4_or_cidr("256.0.0.0").is_err());
    assert!(validate_ipv4_or_cidr("1.2.3").is_err());
    assert!(validate_ipv4_or_cidr("1.2.3.4.5").is_err());
    assert!(validate_ipv4_or_cidr(" 1.2.3.4").is_err());
    assert!(validate_ipv4_or_cidr("１２３.０.０.１").is_err());
    assert!(validate_ipv4_or_cidr("1.2.3.4\u{200B}").is_err());
}

#[test]
fn test_url_encode_covers_path_hostile_characters() {
    assert_eq!(url_encode("10.0.0.0/8"), "10.0.0.0%2F8");
    assert_eq!(url_encode("a b:c/d"), "a%20b%3Ac%2Fd");
    assert_eq!(url_encode("plain"), "plain");
}
