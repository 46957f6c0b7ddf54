//! # GhostWarden - ban-decision reconciler
//!
//! A resident daemon that ingests IP-reputation decisions from a CrowdSec
//! Local API and a Wazuh SIEM, normalizes them into one ban/allow stream,
//! and projects that stream onto two independent enforcement planes: a
//! Proxmox cluster firewall IPSet and a host-local nftables set.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      GhostWarden                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  Sources                                                 │
//! │    ├── LapiSource   CrowdSec decision delta stream       │
//! │    └── SiemSource   Wazuh alerts (bearer-token lifecycle)│
//! ├──────────────────────────────────────────────────────────┤
//! │  Reconciler                                              │
//! │    └── sync tick: fan-in → whitelist → partition → sinks │
//! ├──────────────────────────────────────────────────────────┤
//! │  Sinks                                                   │
//! │    ├── ClusterSink  Proxmox /cluster/firewall/ipset      │
//! │    └── LocalSink    nftables named set + drop rule       │
//! ├──────────────────────────────────────────────────────────┤
//! │  Metrics (prometheus) · /metrics endpoint · log summary  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each sync collects deltas from the configured sources, drops whitelisted
//! addresses before any sink is touched, applies removals before additions
//! on the cluster plane, and tolerates the outage of any single upstream or
//! plane: the failure is logged, counted, and retried next sync.
//!
//! ## Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`cmd`] - Subprocess execution abstraction for the `nft` binary
//! - [`config`] - Configuration parsing and startup validation
//! - [`decision`] - Normalized decision model and IPv4 validation
//! - [`error`] - Error taxonomy
//! - [`metrics`] - Counters, gauges, histogram, Prometheus exposition
//! - [`reconciler`] - The sync loop
//! - [`signal`] - Graceful shutdown signal handling
//! - [`sinks`] - Enforcement planes (cluster IPSet, local nftables)
//! - [`sources`] - Decision sources (LAPI, SIEM)
//! - [`transport`] - HTTP request/response abstraction

pub mod cli;
pub mod cmd;
pub mod config;
pub mod decision;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod signal;
pub mod sinks;
pub mod sources;
pub mod transport;

pub use config::Config;
pub use error::WardenError;
pub use reconciler::Reconciler;
