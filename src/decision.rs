//! Normalized ban/allow decisions shared by sources and sinks.
//!
//! Every upstream (CrowdSec LAPI, Wazuh SIEM) is reduced to the same flat
//! record before it reaches the reconciler. Sinks never see provider-specific
//! shapes.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;

use crate::error::WardenError;

/// What an upstream wants done with an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    /// Block the address on every enforcement plane.
    Ban,
    /// Lift any block we may hold for the address.
    Allow,
    /// Log-only; never projected onto a firewall.
    Monitor,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Ban => "ban",
            DecisionKind::Allow => "allow",
            DecisionKind::Monitor => "monitor",
        }
    }
}

/// Which adapter produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Lapi,
    Siem,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Lapi => "lapi",
            Origin::Siem => "siem",
        }
    }
}

/// One normalized unit of upstream truth.
#[derive(Debug, Clone)]
pub struct Decision {
    /// IPv4 address or IPv4 CIDR literal.
    pub ip: String,
    pub kind: DecisionKind,
    pub origin: Origin,
    /// Scenario name or rule description, free-form.
    pub scenario: String,
    /// Remaining validity advertised by the upstream; `None` means the
    /// decision stands until the upstream deletes it.
    pub ttl: Option<Duration>,
}

/// Structural IPv4 check: a dotted-quad address, optionally with a /0-32
/// prefix. Anything else (IPv6, hostnames, injection attempts) is rejected
/// before it can reach a firewall command or API call.
pub fn validate_ipv4_or_cidr(value: &str) -> Result<(), WardenError> {
    let ok = if value.contains('/') {
        value.parse::<Ipv4Net>().is_ok()
    } else {
        value.parse::<Ipv4Addr>().is_ok()
    };

    if ok {
        Ok(())
    } else {
        Err(WardenError::InvalidInput(format!(
            "not an IPv4 address or CIDR: {}",
            value
        )))
    }
}

/// Parse an upstream TTL like `4h`, `30m`, `3h59m57.3s` into a duration.
///
/// CrowdSec emits Go-style durations, including fractional seconds and
/// negative values for already-expired decisions. Unknown or negative input
/// yields `None`; the decision is then treated as open-ended metadata only.
pub fn parse_upstream_ttl(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('-') {
        return None;
    }

    let mut total_secs = 0.0f64;
    let mut num = String::new();
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }

        let unit_secs = match c {
            'h' => 3600.0,
            's' => 1.0,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    0.001
                } else {
                    60.0
                }
            }
            _ => return None,
        };

        let n: f64 = num.parse().ok()?;
        total_secs += n * unit_secs;
        num.clear();
    }

    // Trailing digits without a unit make the whole value suspect, and so
    // is anything past ~30k years.
    if !num.is_empty() || !total_secs.is_finite() || total_secs > 1e12 {
        return None;
    }

    Some(Duration::from_secs_f64(total_secs))
}
