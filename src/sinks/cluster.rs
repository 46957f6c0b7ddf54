//! Proxmox cluster firewall IPSet sink.
//!
//! Membership is asserted over the cluster HTTPS API with an API token.
//! The managed set is created lazily the first time a read finds it
//! missing. Mutations are idempotent from the caller's point of view:
//! adding a present entry (HTTP 422) and deleting an absent one (HTTP 404)
//! both coalesce to success.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::decision::validate_ipv4_or_cidr;
use crate::error::WardenError;
use crate::sinks::BulkSummary;
use crate::transport::{ApiRequest, ApiTransport};

const SET_COMMENT: &str = "Managed by GhostWarden - do not edit by hand";

/// One IPSet entry as the cluster API returns it. `nomatch` arrives as a
/// 0/1 flag on some releases and as a bool on others.
#[derive(Debug, Clone, Deserialize)]
pub struct IpSetEntry {
    pub cidr: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub nomatch: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

#[derive(Debug, Deserialize)]
struct DataEnvelope {
    #[serde(default)]
    data: Option<Vec<IpSetEntry>>,
}

pub struct ClusterSink {
    transport: Arc<dyn ApiTransport>,
    base_url: String,
    auth_header: String,
}

impl ClusterSink {
    pub fn new(transport: Arc<dyn ApiTransport>, config: &ClusterConfig) -> Self {
        Self {
            transport,
            base_url: config.url.trim_end_matches('/').to_string(),
            auth_header: format!(
                "PVEAPIToken={}={}",
                config.token_id, config.token_secret
            ),
        }
    }

    fn request(&self, request: ApiRequest) -> ApiRequest {
        request.header("Authorization", &self.auth_header)
    }

    /// Startup connectivity probe against the version endpoint.
    pub async fn version(&self) -> Result<(), WardenError> {
        let response = self
            .transport
            .execute(self.request(ApiRequest::get(format!("{}/version", self.base_url))))
            .await?;

        match response.status {
            status if (200..300).contains(&status) => Ok(()),
            401 => Err(WardenError::AuthFailed(
                "cluster API rejected the token".to_string(),
            )),
            status => Err(WardenError::Api {
                status,
                message: "cluster version probe failed".to_string(),
            }),
        }
    }

    /// Current membership of the named set. A missing set is created on the
    /// spot and reported as empty.
    pub async fn get_set(&self, name: &str) -> Result<Vec<IpSetEntry>, WardenError> {
        let url = format!("{}/cluster/firewall/ipset/{}", self.base_url, name);
        let response = self.transport.execute(self.request(ApiRequest::get(url))).await?;

        match response.status {
            status if (200..300).contains(&status) => {
                let envelope: DataEnvelope = serde_json::from_str(&response.body)
                    .map_err(|e| WardenError::Parse(format!("ipset {} membership: {}", name, e)))?;
                Ok(envelope.data.unwrap_or_default())
            }
            404 => {
                info!("Cluster IPSet {} not found, creating it", name);
                self.create_set(name).await?;
                Ok(Vec::new())
            }
            401 => Err(WardenError::AuthFailed(
                "cluster API rejected the token".to_string(),
            )),
            status => Err(WardenError::Api {
                status,
                message: format!("reading ipset {}", name),
            }),
        }
    }

    async fn create_set(&self, name: &str) -> Result<(), WardenError> {
        let request = ApiRequest::post(format!("{}/cluster/firewall/ipset", self.base_url)).form(
            vec![
                ("name".to_string(), name.to_string()),
                ("comment".to_string(), SET_COMMENT.to_string()),
            ],
        );
        let response = self.transport.execute(self.request(request)).await?;

        if response.is_success() {
            return Ok(());
        }
        // Concurrent creation by another node loses the race harmlessly.
        if response.body.to_ascii_lowercase().contains("already exists") {
            debug!("Cluster IPSet {} already existed", name);
            return Ok(());
        }
        if response.status == 401 {
            return Err(WardenError::AuthFailed(
                "cluster API rejected the token".to_string(),
            ));
        }
        Err(WardenError::Api {
            status: response.status,
            message: format!("creating ipset {}", name),
        })
    }

    /// Add one entry. HTTP 422 means the entry is already present and is
    /// treated as success.
    pub async fn add(&self, name: &str, ip: &str, comment: Option<&str>) -> Result<(), WardenError> {
        validate_ipv4_or_cidr(ip)?;

        let mut fields = vec![("cidr".to_string(), ip.to_string())];
        if let Some(comment) = comment {
            fields.push(("comment".to_string(), comment.to_string()));
        }

        let request =
            ApiRequest::post(format!("{}/cluster/firewall/ipset/{}", self.base_url, name))
                .form(fields);
        let response = self.transport.execute(self.request(request)).await?;

        match response.status {
            status if (200..300).contains(&status) => Ok(()),
            422 => {
                debug!("{} already in cluster set {}", ip, name);
                Ok(())
            }
            401 => Err(WardenError::AuthFailed(
                "cluster API rejected the token".to_string(),
            )),
            status => Err(WardenError::Api {
                status,
                message: format!("adding {} to ipset {}", ip, name),
            }),
        }
    }

    /// Remove one entry. HTTP 404 means it was never there and is treated
    /// as success.
    pub async fn remove(&self, name: &str, ip: &str) -> Result<(), WardenError> {
        validate_ipv4_or_cidr(ip)?;

        let url = format!(
            "{}/cluster/firewall/ipset/{}/{}",
            self.base_url,
            name,
            url_encode(ip)
        );
        let response = self
            .transport
            .execute(self.request(ApiRequest::delete(url)))
            .await?;

        match response.status {
            status if (200..300).contains(&status) => Ok(()),
            404 => {
                debug!("{} was not in cluster set {}", ip, name);
                Ok(())
            }
            401 => Err(WardenError::AuthFailed(
                "cluster API rejected the token".to_string(),
            )),
            status => Err(WardenError::Api {
                status,
                message: format!("removing {} from ipset {}", ip, name),
            }),
        }
    }

    /// Apply removals then additions as one grouped operation. The order
    /// prefers a temporarily smaller set over a temporarily larger one. A
    /// single failing IP is logged and counted but never aborts the batch;
    /// an auth failure does, since every remaining call would fail the same
    /// way.
    pub async fn bulk_update(
        &self,
        name: &str,
        adds: &[String],
        removes: &[String],
    ) -> Result<BulkSummary, WardenError> {
        let mut summary = BulkSummary::default();
        let comment = format!(
            "ghostwarden {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
        );

        for ip in removes {
            match self.remove(name, ip).await {
                Ok(()) => summary.removed += 1,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!("Failed to remove {} from cluster set {}: {}", ip, name, e);
                    summary.failed += 1;
                }
            }
        }

        for ip in adds {
            match self.add(name, ip, Some(&comment)).await {
                Ok(()) => summary.added += 1,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!("Failed to add {} to cluster set {}: {}", ip, name, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Cluster set {}: {} added, {} removed",
            name, summary.added, summary.removed
        );
        Ok(summary)
    }
}

/// Minimal percent-encoder for IPSet path segments: covers CIDR slashes,
/// colons, and spaces; everything else passes through.
pub fn url_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '/' => encoded.push_str("%2F"),
            ':' => encoded.push_str("%3A"),
            ' ' => encoded.push_str("%20"),
            other => encoded.push(other),
        }
    }
    encoded
}
