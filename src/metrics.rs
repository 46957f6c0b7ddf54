//! Metrics bookkeeping and Prometheus exposition.
//!
//! One [`MetricsRecorder`] lives for the whole process. The reconciler is
//! the only writer in normal operation; every observed event maps to exactly
//! one counter increment at the site where the event is seen. A small HTTP
//! server exposes the text format on localhost, and a one-line summary is
//! logged every N syncs for operators who only have the journal.

use anyhow::Result;
use axum::{routing::get, Router};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::info;

/// Which part of the pipeline an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Lapi,
    Siem,
    Cluster,
    Local,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Lapi => "lapi",
            Component::Siem => "siem",
            Component::Cluster => "cluster",
            Component::Local => "local",
        }
    }
}

pub struct MetricsRecorder {
    registry: Registry,

    bans_total: IntCounter,
    unbans_total: IntCounter,
    lapi_decisions_total: IntCounter,
    siem_alerts_total: IntCounter,
    cluster_api_calls_total: IntCounter,
    local_ops_total: IntCounter,
    errors_total: IntCounterVec,

    currently_banned: IntGauge,
    last_sync_duration_seconds: Gauge,
    last_sync_timestamp: IntGauge,

    sync_duration: Histogram,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let bans_total = IntCounter::new(
            "ghostwarden_bans_total",
            "Ban actions accepted from upstream decision sources",
        )?;
        registry.register(Box::new(bans_total.clone()))?;

        let unbans_total = IntCounter::new(
            "ghostwarden_unbans_total",
            "Unban actions accepted from upstream decision sources",
        )?;
        registry.register(Box::new(unbans_total.clone()))?;

        let lapi_decisions_total = IntCounter::new(
            "ghostwarden_lapi_decisions_total",
            "Raw decisions received from the LAPI delta stream",
        )?;
        registry.register(Box::new(lapi_decisions_total.clone()))?;

        let siem_alerts_total = IntCounter::new(
            "ghostwarden_siem_alerts_total",
            "SIEM alert actions considered",
        )?;
        registry.register(Box::new(siem_alerts_total.clone()))?;

        let cluster_api_calls_total = IntCounter::new(
            "ghostwarden_cluster_api_calls_total",
            "Bulk updates issued to the cluster firewall API",
        )?;
        registry.register(Box::new(cluster_api_calls_total.clone()))?;

        let local_ops_total = IntCounter::new(
            "ghostwarden_local_ops_total",
            "Element operations issued to the local nftables set",
        )?;
        registry.register(Box::new(local_ops_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("ghostwarden_errors_total", "Errors by component"),
            &["component"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let currently_banned = IntGauge::new(
            "ghostwarden_currently_banned",
            "Entries currently present in the local enforcement set",
        )?;
        registry.register(Box::new(currently_banned.clone()))?;

        let last_sync_duration_seconds = Gauge::new(
            "ghostwarden_last_sync_duration_seconds",
            "Duration of the most recent sync",
        )?;
        registry.register(Box::new(last_sync_duration_seconds.clone()))?;

        let last_sync_timestamp = IntGauge::new(
            "ghostwarden_last_sync_timestamp",
            "Unix timestamp of the most recent completed sync",
        )?;
        registry.register(Box::new(last_sync_timestamp.clone()))?;

        let sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ghostwarden_sync_duration_seconds",
                "Sync duration distribution",
            )
            .buckets(vec![1.0, 5.0, 10.0]),
        )?;
        registry.register(Box::new(sync_duration.clone()))?;

        Ok(Self {
            registry,
            bans_total,
            unbans_total,
            lapi_decisions_total,
            siem_alerts_total,
            cluster_api_calls_total,
            local_ops_total,
            errors_total,
            currently_banned,
            last_sync_duration_seconds,
            last_sync_timestamp,
            sync_duration,
        })
    }

    pub fn record_ban(&self) {
        self.bans_total.inc();
    }

    pub fn record_unban(&self) {
        self.unbans_total.inc();
    }

    pub fn record_lapi_decision(&self) {
        self.lapi_decisions_total.inc();
    }

    pub fn record_siem_alert(&self) {
        self.siem_alerts_total.inc();
    }

    pub fn record_cluster_api_call(&self) {
        self.cluster_api_calls_total.inc();
    }

    pub fn record_local_op(&self) {
        self.local_ops_total.inc();
    }

    pub fn record_error(&self, component: Component) {
        self.errors_total
            .with_label_values(&[component.as_str()])
            .inc();
    }

    pub fn update_currently_banned(&self, count: u64) {
        self.currently_banned.set(count as i64);
    }

    /// Record one completed sync: histogram observation plus the two
    /// freshness gauges.
    pub fn record_sync_duration(&self, seconds: f64) {
        self.sync_duration.observe(seconds);
        self.last_sync_duration_seconds.set(seconds);
        self.last_sync_timestamp.set(chrono::Utc::now().timestamp());
    }

    pub fn bans_total(&self) -> u64 {
        self.bans_total.get()
    }

    pub fn unbans_total(&self) -> u64 {
        self.unbans_total.get()
    }

    pub fn lapi_decisions_total(&self) -> u64 {
        self.lapi_decisions_total.get()
    }

    pub fn siem_alerts_total(&self) -> u64 {
        self.siem_alerts_total.get()
    }

    pub fn cluster_api_calls_total(&self) -> u64 {
        self.cluster_api_calls_total.get()
    }

    pub fn local_ops_total(&self) -> u64 {
        self.local_ops_total.get()
    }

    pub fn errors_total(&self, component: Component) -> u64 {
        self.errors_total
            .with_label_values(&[component.as_str()])
            .get()
    }

    pub fn currently_banned(&self) -> u64 {
        self.currently_banned.get().max(0) as u64
    }

    pub fn sync_count(&self) -> u64 {
        self.sync_duration.get_sample_count()
    }

    /// One-line operator summary, logged every N syncs.
    pub fn log_summary(&self) {
        info!(
            bans = self.bans_total(),
            unbans = self.unbans_total(),
            lapi_decisions = self.lapi_decisions_total(),
            siem_alerts = self.siem_alerts_total(),
            cluster_calls = self.cluster_api_calls_total(),
            local_ops = self.local_ops_total(),
            lapi_errors = self.errors_total(Component::Lapi),
            siem_errors = self.errors_total(Component::Siem),
            cluster_errors = self.errors_total(Component::Cluster),
            local_errors = self.errors_total(Component::Local),
            currently_banned = self.currently_banned(),
            "sync summary"
        );
    }

    /// Render every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// HTTP server exposing `/metrics` on localhost.
pub struct MetricsServer {
    recorder: Arc<MetricsRecorder>,
    addr: std::net::SocketAddr,
}

impl MetricsServer {
    pub fn new(recorder: Arc<MetricsRecorder>, port: u16) -> Self {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        Self { recorder, addr }
    }

    pub async fn serve(self) -> Result<()> {
        let recorder = self.recorder.clone();

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let recorder = recorder.clone();
                async move {
                    match recorder.render() {
                        Ok(text) => text,
                        Err(e) => format!("# error rendering metrics: {}\n", e),
                    }
                }
            }),
        );

        info!("Metrics exposition listening on http://{}/metrics", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
