//! CrowdSec Local API source adapter.
//!
//! Polls the decisions delta stream. The first poll of a process lifetime
//! asks for the full current corpus (`startup=true`); later polls receive
//! only what changed. A best-effort heartbeat tells the LAPI this bouncer
//! is alive.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LapiConfig;
use crate::decision::{parse_upstream_ttl, validate_ipv4_or_cidr, Decision, DecisionKind, Origin};
use crate::error::WardenError;
use crate::sources::DecisionDelta;
use crate::transport::{ApiRequest, ApiTransport};

/// One raw decision as the LAPI serializes it. Fields the stream may omit
/// are optional; a missing `value` drops the entry during normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDecision {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(rename = "type", default)]
    pub decision_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub simulated: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// One poll of the delta stream. The LAPI serializes absent lists as JSON
/// null, hence the intermediate options.
#[derive(Debug, Default)]
pub struct DecisionStream {
    pub new: Vec<RawDecision>,
    pub deleted: Vec<RawDecision>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    #[serde(default)]
    new: Option<Vec<RawDecision>>,
    #[serde(default)]
    deleted: Option<Vec<RawDecision>>,
}

pub struct LapiSource {
    transport: Arc<dyn ApiTransport>,
    base_url: String,
    api_key: String,
    machine_id: String,
}

impl LapiSource {
    pub fn new(transport: Arc<dyn ApiTransport>, config: &LapiConfig) -> Self {
        let machine_id = config
            .machine_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            transport,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            machine_id,
        }
    }

    /// Stable identity used to authenticate heartbeats; generated once per
    /// process when not configured.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// One round trip against the delta stream. `startup` requests the full
    /// current decision corpus instead of a delta.
    pub async fn get_decisions(&self, startup: bool) -> Result<DecisionStream, WardenError> {
        let url = if startup {
            format!("{}/v1/decisions/stream?startup=true", self.base_url)
        } else {
            format!("{}/v1/decisions/stream", self.base_url)
        };

        let response = self
            .transport
            .execute(ApiRequest::get(url).header("X-Api-Key", &self.api_key))
            .await?;

        match response.status {
            status if (200..300).contains(&status) => {
                let raw: RawStream = serde_json::from_str(&response.body)
                    .map_err(|e| WardenError::Parse(format!("LAPI decision stream: {}", e)))?;
                Ok(DecisionStream {
                    new: raw.new.unwrap_or_default(),
                    deleted: raw.deleted.unwrap_or_default(),
                })
            }
            401 => Err(WardenError::AuthFailed(
                "LAPI rejected the API key".to_string(),
            )),
            status => Err(WardenError::Api {
                status,
                message: truncate_body(&response.body),
            }),
        }
    }

    /// Best-effort liveness signal. Failures are logged and swallowed; a
    /// missed heartbeat must never stall reconciliation.
    pub async fn heartbeat(&self) {
        let request = ApiRequest::post(format!("{}/v1/heartbeat", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(serde_json::json!({ "machine_id": self.machine_id }));

        match self.transport.execute(request).await {
            Ok(response) if response.is_success() => {
                debug!("LAPI heartbeat acknowledged");
            }
            Ok(response) => {
                warn!("LAPI heartbeat returned HTTP {}", response.status);
            }
            Err(e) => {
                warn!("LAPI heartbeat failed: {}", e);
            }
        }
    }
}

/// Reduce a raw stream to enforceable decisions. Only `ban` decisions with
/// `Ip` scope (case-sensitive, as the LAPI emits them) and a structurally
/// valid IPv4 value survive; simulated decisions are decoded but never
/// enforced.
pub fn normalize(stream: &DecisionStream) -> DecisionDelta {
    DecisionDelta {
        additions: stream.new.iter().filter_map(to_decision).collect(),
        removals: stream.deleted.iter().filter_map(to_decision).collect(),
    }
}

fn to_decision(raw: &RawDecision) -> Option<Decision> {
    if raw.decision_type.as_deref() != Some("ban") || raw.scope.as_deref() != Some("Ip") {
        return None;
    }
    if raw.simulated == Some(true) {
        debug!(
            "Skipping simulated decision for {}",
            raw.value.as_deref().unwrap_or("<no value>")
        );
        return None;
    }

    let ip = raw.value.clone()?;
    if validate_ipv4_or_cidr(&ip).is_err() {
        debug!("Skipping non-IPv4 decision value {:?}", ip);
        return None;
    }

    Some(Decision {
        ip,
        kind: DecisionKind::Ban,
        origin: Origin::Lapi,
        scenario: raw.scenario.clone().unwrap_or_default(),
        ttl: raw.duration.as_deref().and_then(parse_upstream_ttl),
    })
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedTransport;
    use std::time::Duration;

    fn source(transport: ScriptedTransport) -> LapiSource {
        LapiSource::new(
            Arc::new(transport),
            &LapiConfig {
                url: "https://lapi.test:8080/".to_string(),
                api_key: "test-key".to_string(),
                machine_id: None,
            },
        )
    }

    fn ban(value: &str) -> RawDecision {
        RawDecision {
            id: Some(1),
            origin: Some("crowdsec".to_string()),
            decision_type: Some("ban".to_string()),
            scope: Some("Ip".to_string()),
            value: Some(value.to_string()),
            duration: Some("4h".to_string()),
            scenario: Some("crowdsecurity/ssh-bf".to_string()),
            simulated: Some(false),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_machine_id_generated_when_unset() {
        let transport = ScriptedTransport::new(vec![]);
        let source = source(transport);
        // UUID v4 text layout: five hyphen-separated hex groups.
        assert_eq!(source.machine_id().split('-').count(), 5);
    }

    #[test]
    fn test_machine_id_from_config_is_kept() {
        let source = LapiSource::new(
            Arc::new(ScriptedTransport::new(vec![])),
            &LapiConfig {
                url: "https://lapi.test".to_string(),
                api_key: "k".to_string(),
                machine_id: Some("configured-id".to_string()),
            },
        );
        assert_eq!(source.machine_id(), "configured-id");
    }

    #[test]
    fn test_normalize_keeps_only_ipv4_ip_bans() {
        let stream = DecisionStream {
            new: vec![
                ban("203.0.113.5"),
                RawDecision {
                    decision_type: Some("captcha".to_string()),
                    ..ban("198.51.100.1")
                },
                RawDecision {
                    scope: Some("Range".to_string()),
                    ..ban("198.51.100.0/24")
                },
                RawDecision {
                    scope: Some("ip".to_string()), // wrong case
                    ..ban("198.51.100.2")
                },
                RawDecision {
                    value: None,
                    ..ban("ignored")
                },
                ban("::1"),
            ],
            deleted: vec![ban("192.0.2.9")],
        };

        let delta = normalize(&stream);
        assert_eq!(delta.additions.len(), 1);
        assert_eq!(delta.additions[0].ip, "203.0.113.5");
        assert_eq!(delta.additions[0].kind, DecisionKind::Ban);
        assert_eq!(delta.additions[0].origin, Origin::Lapi);
        assert_eq!(delta.additions[0].ttl, Some(Duration::from_secs(4 * 3600)));
        assert_eq!(delta.removals.len(), 1);
        assert_eq!(delta.removals[0].ip, "192.0.2.9");
    }

    #[test]
    fn test_normalize_drops_simulated_decisions() {
        let stream = DecisionStream {
            new: vec![RawDecision {
                simulated: Some(true),
                ..ban("203.0.113.5")
            }],
            deleted: vec![],
        };
        assert!(normalize(&stream).additions.is_empty());
    }

    #[tokio::test]
    async fn test_get_decisions_parses_stream() {
        let body = r#"{
            "new": [{"id": 7, "origin": "crowdsec", "type": "ban", "scope": "Ip",
                     "value": "203.0.113.5", "duration": "4h",
                     "scenario": "crowdsecurity/ssh-bf", "simulated": false}],
            "deleted": null
        }"#;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(200, body)]);
        let source = source(transport);

        let stream = source.get_decisions(true).await.unwrap();
        assert_eq!(stream.new.len(), 1);
        assert!(stream.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_get_decisions_sets_startup_flag_and_key() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::ok(200, r#"{"new": [], "deleted": []}"#),
            ScriptedTransport::ok(200, r#"{"new": [], "deleted": []}"#),
        ]);
        let transport = Arc::new(transport);
        let source = LapiSource::new(
            transport.clone(),
            &LapiConfig {
                url: "https://lapi.test".to_string(),
                api_key: "test-key".to_string(),
                machine_id: None,
            },
        );

        source.get_decisions(true).await.unwrap();
        source.get_decisions(false).await.unwrap();

        let requests = transport.requests();
        assert!(requests[0].url.ends_with("/v1/decisions/stream?startup=true"));
        assert!(requests[1].url.ends_with("/v1/decisions/stream"));
        assert!(requests
            .iter()
            .all(|r| r.headers.contains(&("X-Api-Key".to_string(), "test-key".to_string()))));
    }

    #[tokio::test]
    async fn test_get_decisions_maps_statuses() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::ok(401, ""),
            ScriptedTransport::ok(404, "not here"),
            ScriptedTransport::ok(200, "not json"),
        ]);
        let source = source(transport);

        assert!(matches!(
            source.get_decisions(false).await,
            Err(WardenError::AuthFailed(_))
        ));
        assert!(matches!(
            source.get_decisions(false).await,
            Err(WardenError::Api { status: 404, .. })
        ));
        assert!(matches!(
            source.get_decisions(false).await,
            Err(WardenError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_swallows_failures() {
        let transport = ScriptedTransport::new(vec![
            Err(WardenError::Network("connection refused".to_string())),
            ScriptedTransport::ok(500, ""),
            ScriptedTransport::ok(200, ""),
        ]);
        let source = source(transport);

        // None of these may panic or propagate.
        source.heartbeat().await;
        source.heartbeat().await;
        source.heartbeat().await;
    }
}
