//! Configuration management for GhostWarden.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::decision::validate_ipv4_or_cidr;
use crate::error::WardenError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between reconciliation syncs
    pub sync_interval_seconds: u64,

    /// Emit the metrics summary log line every N syncs
    pub summary_interval_ticks: u64,

    /// Log level (debug, info, warn, error)
    pub log_level: String,

    /// IPs exempt from enforcement. Matching is exact string equality;
    /// a /24 entry does NOT cover the addresses inside it.
    pub whitelist: Vec<String>,

    /// CrowdSec Local API source; absent disables the adapter
    pub lapi: Option<LapiConfig>,

    /// Wazuh SIEM source; absent disables the adapter
    pub siem: Option<SiemConfig>,

    /// Proxmox cluster firewall sink (required)
    pub cluster: ClusterConfig,

    /// Host-local nftables sink; absent disables the plane
    pub local: Option<LocalConfig>,

    /// Prometheus exposition endpoint
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_interval_seconds: 60,
            summary_interval_ticks: 10,
            log_level: "info".to_string(),
            whitelist: Vec::new(),
            lapi: None,
            siem: None,
            cluster: ClusterConfig::default(),
            local: None,
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LapiConfig {
    /// Base URL, e.g. https://lapi.internal:8080
    pub url: String,
    pub api_key: String,
    /// Stable machine identity for heartbeat; generated (UUID v4) when unset
    pub machine_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SiemConfig {
    /// Base URL, e.g. https://wazuh.internal:55000
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// API base URL, e.g. https://pve.internal:8006/api2/json
    pub url: String,
    /// Token identity, e.g. root@pam!ghostwarden
    pub token_id: String,
    pub token_secret: String,
    /// Managed IPSet name
    pub ipset_name: String,
    /// Disable only for self-signed cluster certificates
    pub verify_tls: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token_id: String::new(),
            token_secret: String::new(),
            ipset_name: "ghostwarden".to_string(),
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub table: String,
    pub chain: String,
    pub set: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            table: "ghostwarden".to_string(),
            chain: "input".to_string(),
            set: "banned".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Bound on 127.0.0.1 only
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9184,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WardenError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            WardenError::Configuration(format!(
                "failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| WardenError::Configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Example configuration with comments
    pub fn example() -> &'static str {
        include_str!("../templates/config.yaml")
    }

    /// Startup validation. Any failure here is fatal; a daemon with a half
    /// valid config must not begin enforcing.
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.sync_interval_seconds < 10 {
            return Err(WardenError::Configuration(
                "sync_interval_seconds must be at least 10".to_string(),
            ));
        }

        if self.summary_interval_ticks == 0 {
            return Err(WardenError::Configuration(
                "summary_interval_ticks must be at least 1".to_string(),
            ));
        }

        if self.cluster.url.is_empty() {
            return Err(WardenError::Configuration(
                "cluster.url must be set".to_string(),
            ));
        }
        if self.cluster.token_id.is_empty() || self.cluster.token_secret.is_empty() {
            return Err(WardenError::Configuration(
                "cluster.token_id and cluster.token_secret must be set".to_string(),
            ));
        }
        if self.cluster.ipset_name.is_empty() {
            return Err(WardenError::Configuration(
                "cluster.ipset_name must be set".to_string(),
            ));
        }

        if let Some(lapi) = &self.lapi {
            if lapi.url.is_empty() {
                return Err(WardenError::Configuration(
                    "lapi.url must be set when the LAPI source is configured".to_string(),
                ));
            }
            if lapi.api_key.is_empty() {
                return Err(WardenError::Configuration(
                    "lapi.api_key must be set when the LAPI source is configured".to_string(),
                ));
            }
        }

        if let Some(siem) = &self.siem {
            if siem.url.is_empty() {
                return Err(WardenError::Configuration(
                    "siem.url must be set when the SIEM source is configured".to_string(),
                ));
            }
            if siem.username.is_empty() || siem.password.is_empty() {
                return Err(WardenError::Configuration(
                    "siem.username and siem.password must be set".to_string(),
                ));
            }
        }

        if let Some(local) = &self.local {
            for (field, value) in [
                ("local.table", &local.table),
                ("local.chain", &local.chain),
                ("local.set", &local.set),
            ] {
                if !is_safe_nft_name(value) {
                    return Err(WardenError::Configuration(format!(
                        "{} must be a non-empty name of [A-Za-z0-9_-], got {:?}",
                        field, value
                    )));
                }
            }
        }

        for entry in &self.whitelist {
            validate_ipv4_or_cidr(entry).map_err(|_| {
                WardenError::Configuration(format!(
                    "whitelist entry is not an IPv4 address or CIDR: {:?}",
                    entry
                ))
            })?;
        }

        Ok(())
    }

    /// Whitelist as a lookup set; built once at startup.
    pub fn whitelist_set(&self) -> HashSet<String> {
        self.whitelist.iter().cloned().collect()
    }
}

/// Names interpolated into nft command lines must never carry shell or nft
/// syntax.
fn is_safe_nft_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
