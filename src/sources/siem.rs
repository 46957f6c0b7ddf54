//! Wazuh SIEM source adapter.
//!
//! Alerts are fetched behind a short-lived bearer token. The token
//! lifecycle is an explicit state machine: `Unauthenticated` until the
//! first call, `Authenticating` while the basic-auth exchange is in
//! flight, then `Authenticated` until expiry. A 401 on an alerts call
//! clears the token and earns exactly one retry; expiry is anticipated
//! five minutes early so a sync never starts with a token about to die.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::config::SiemConfig;
use crate::decision::{validate_ipv4_or_cidr, Decision, DecisionKind, Origin};
use crate::error::WardenError;
use crate::transport::{ApiRequest, ApiTransport};

/// Stated token lifetime of the SIEM API.
const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
/// Re-authenticate this long before the stated expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
enum TokenState {
    Unauthenticated,
    Authenticating,
    Authenticated { token: String, expires_at: Instant },
}

/// One alert as the SIEM returns it; only the fields the mapping needs.
#[derive(Debug, Clone, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub rule: AlertRule,
    #[serde(default)]
    pub data: Option<AlertData>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertRule {
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertData {
    #[serde(default)]
    pub srcip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthEnvelope {
    data: AuthData,
}

#[derive(Debug, Deserialize)]
struct AuthData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct AlertsEnvelope {
    #[serde(default)]
    data: AlertsData,
}

#[derive(Debug, Default, Deserialize)]
struct AlertsData {
    #[serde(default)]
    affected_items: Vec<Alert>,
}

pub struct SiemSource {
    transport: Arc<dyn ApiTransport>,
    base_url: String,
    username: String,
    password: String,
    state: TokenState,
}

impl SiemSource {
    pub fn new(transport: Arc<dyn ApiTransport>, config: &SiemConfig) -> Self {
        Self {
            transport,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            state: TokenState::Unauthenticated,
        }
    }

    /// Basic-auth exchange for a fresh bearer token.
    pub async fn authenticate(&mut self) -> Result<(), WardenError> {
        self.state = TokenState::Authenticating;

        let request = ApiRequest::post(format!("{}/security/user/authenticate", self.base_url))
            .basic_auth(&self.username, &self.password);

        let response = match self.transport.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                self.state = TokenState::Unauthenticated;
                return Err(e);
            }
        };

        if response.status == 401 {
            self.state = TokenState::Unauthenticated;
            return Err(WardenError::AuthFailed(
                "SIEM rejected the configured credentials".to_string(),
            ));
        }
        if !response.is_success() {
            self.state = TokenState::Unauthenticated;
            return Err(WardenError::Api {
                status: response.status,
                message: "SIEM authenticate endpoint failed".to_string(),
            });
        }

        let envelope: AuthEnvelope = serde_json::from_str(&response.body).map_err(|e| {
            self.state = TokenState::Unauthenticated;
            WardenError::Parse(format!("SIEM authenticate response: {}", e))
        })?;

        self.state = TokenState::Authenticated {
            token: envelope.data.token,
            expires_at: Instant::now() + TOKEN_LIFETIME,
        };
        debug!("SIEM token refreshed");
        Ok(())
    }

    /// Hand out a token valid for at least the refresh margin,
    /// re-authenticating when needed.
    async fn ensure_token(&mut self) -> Result<String, WardenError> {
        if let TokenState::Authenticated { token, expires_at } = &self.state {
            if Instant::now() + REFRESH_MARGIN < *expires_at {
                return Ok(token.clone());
            }
        }

        self.authenticate().await?;
        match &self.state {
            TokenState::Authenticated { token, .. } => Ok(token.clone()),
            _ => Err(WardenError::AuthFailed(
                "SIEM authentication did not yield a token".to_string(),
            )),
        }
    }

    /// Query recent alerts. A 401 mid-flight means the token died early;
    /// the adapter re-authenticates once and retries once.
    pub async fn get_alerts(
        &mut self,
        since: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Alert>, WardenError> {
        let token = self.ensure_token().await?;
        let response = self.fetch_alerts(&token, since, limit).await?;

        let response = if response.status == 401 {
            self.state = TokenState::Unauthenticated;
            let token = self.ensure_token().await?;
            self.fetch_alerts(&token, since, limit).await?
        } else {
            response
        };

        if response.status == 401 {
            return Err(WardenError::AuthFailed(
                "SIEM rejected a freshly issued token".to_string(),
            ));
        }
        if !response.is_success() {
            return Err(WardenError::Api {
                status: response.status,
                message: "SIEM alerts query failed".to_string(),
            });
        }

        let envelope: AlertsEnvelope = serde_json::from_str(&response.body)
            .map_err(|e| WardenError::Parse(format!("SIEM alerts response: {}", e)))?;
        Ok(envelope.data.affected_items)
    }

    async fn fetch_alerts(
        &self,
        token: &str,
        since: Option<&str>,
        limit: u32,
    ) -> Result<crate::transport::ApiResponse, WardenError> {
        let mut url = format!("{}/alerts?pretty=true&limit={}", self.base_url, limit);
        if let Some(ts) = since {
            url.push_str(&format!("&timestamp>={}", ts));
        }

        self.transport
            .execute(ApiRequest::get(url).header("Authorization", &format!("Bearer {}", token)))
            .await
    }

    #[cfg(test)]
    fn force_token(&mut self, token: &str, expires_at: Instant) {
        self.state = TokenState::Authenticated {
            token: token.to_string(),
            expires_at,
        };
    }
}

/// Map an alert severity level onto an action.
pub fn level_to_kind(level: u32) -> DecisionKind {
    match level {
        0..=5 => DecisionKind::Monitor,
        6..=10 => DecisionKind::Allow,
        _ => DecisionKind::Ban,
    }
}

/// Project alerts onto normalized decisions. Alerts without a structurally
/// valid IPv4 source address are dropped; the action kind is derived purely
/// from the rule level.
pub fn to_actions(alerts: &[Alert]) -> Vec<Decision> {
    alerts
        .iter()
        .filter_map(|alert| {
            let srcip = alert.data.as_ref()?.srcip.clone()?;
            if validate_ipv4_or_cidr(&srcip).is_err() {
                debug!("Skipping alert with non-IPv4 srcip {:?}", srcip);
                return None;
            }
            Some(Decision {
                ip: srcip,
                kind: level_to_kind(alert.rule.level),
                origin: Origin::Siem,
                scenario: alert.rule.description.clone().unwrap_or_default(),
                ttl: None,
            })
        })
        .collect()
}
