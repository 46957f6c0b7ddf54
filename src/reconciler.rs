//! The reconciliation engine.
//!
//! One cooperative loop drives everything: every second it checks whether a
//! sync is due, and a due sync runs one tick. A tick fans in deltas from the
//! configured sources, gates them through the whitelist, partitions them
//! into bans and unbans, and projects the result onto the cluster and local
//! enforcement planes. The planes fail independently: a dead upstream or a
//! dead sink costs one tick of its own lane, never the process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::WardenError;
use crate::metrics::{Component, MetricsRecorder};
use crate::signal::ShutdownToken;
use crate::sinks::{ClusterSink, LocalSink};
use crate::sources::{lapi, siem, LapiSource, SiemSource};
use crate::decision::DecisionKind;

/// Transient per-sync state; created at tick start, consumed by the sinks,
/// discarded at tick end.
struct SyncTick {
    started_at: Instant,
    to_ban: Vec<String>,
    to_unban: Vec<String>,
    adapter_errors: Vec<(Component, String)>,
}

impl SyncTick {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            to_ban: Vec::new(),
            to_unban: Vec::new(),
            adapter_errors: Vec::new(),
        }
    }

    /// Stage a ban, deduplicating across sources. True when newly staged.
    fn stage_ban(&mut self, ip: &str) -> bool {
        if self.to_ban.iter().any(|staged| staged == ip) {
            return false;
        }
        self.to_ban.push(ip.to_string());
        true
    }

    fn stage_unban(&mut self, ip: &str) -> bool {
        if self.to_unban.iter().any(|staged| staged == ip) {
            return false;
        }
        self.to_unban.push(ip.to_string());
        true
    }

    fn record_adapter_error(&mut self, component: Component, message: String) {
        self.adapter_errors.push((component, message));
    }
}

pub struct Reconciler {
    sync_interval: Duration,
    summary_interval_ticks: u64,
    whitelist: HashSet<String>,
    ipset_name: String,

    metrics: Arc<MetricsRecorder>,
    lapi: Option<LapiSource>,
    siem: Option<SiemSource>,
    cluster: ClusterSink,
    local: Option<LocalSink>,

    shutdown: ShutdownToken,
    first_poll: bool,
    tick_count: u64,
}

impl Reconciler {
    pub fn new(
        config: &Config,
        metrics: Arc<MetricsRecorder>,
        lapi: Option<LapiSource>,
        siem: Option<SiemSource>,
        cluster: ClusterSink,
        local: Option<LocalSink>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            sync_interval: Duration::from_secs(config.sync_interval_seconds),
            summary_interval_ticks: config.summary_interval_ticks.max(1),
            whitelist: config.whitelist_set(),
            ipset_name: config.cluster.ipset_name.clone(),
            metrics,
            lapi,
            siem,
            cluster,
            local,
            shutdown,
            first_poll: true,
            tick_count: 0,
        }
    }

    /// Wire every component from configuration with production transports.
    pub fn from_config(
        config: &Config,
        metrics: Arc<MetricsRecorder>,
        shutdown: ShutdownToken,
    ) -> Result<Self, WardenError> {
        use crate::cmd::RealCommandExecutor;
        use crate::transport::ReqwestTransport;

        let cluster = ClusterSink::new(
            Arc::new(ReqwestTransport::new(config.cluster.verify_tls)?),
            &config.cluster,
        );

        let lapi = match &config.lapi {
            Some(lapi_config) => Some(LapiSource::new(
                Arc::new(ReqwestTransport::new(true)?),
                lapi_config,
            )),
            None => None,
        };

        let siem = match &config.siem {
            Some(siem_config) => Some(SiemSource::new(
                Arc::new(ReqwestTransport::new(true)?),
                siem_config,
            )),
            None => None,
        };

        let local = match &config.local {
            Some(local_config) => Some(LocalSink::new(
                Arc::new(RealCommandExecutor::new()),
                local_config,
            )?),
            None => None,
        };

        Ok(Self::new(config, metrics, lapi, siem, cluster, local, shutdown))
    }

    /// Startup probes. The cluster plane must answer; a cluster we cannot
    /// reach at boot is a deployment problem, not an outage to ride out.
    /// Source-side probes are best-effort.
    pub async fn test_connections(&mut self) -> Result<(), WardenError> {
        self.cluster.version().await?;
        info!("Cluster firewall API reachable");

        // First membership read; creates the managed set lazily when the
        // cluster has never seen it.
        match self.cluster.get_set(&self.ipset_name).await {
            Ok(entries) => info!(
                "Cluster IPSet {} holds {} entries",
                self.ipset_name,
                entries.len()
            ),
            Err(e) => warn!("Could not read cluster IPSet {}: {}", self.ipset_name, e),
        }

        if let Some(lapi) = &self.lapi {
            lapi.heartbeat().await;
        }

        if let Some(siem) = self.siem.as_mut() {
            if let Err(e) = siem.authenticate().await {
                warn!("SIEM authentication failed at startup: {}", e);
            }
        }

        Ok(())
    }

    /// Main loop. Checks the shutdown token and the sync deadline once per
    /// second; stop requests take effect at the next quantum.
    pub async fn run(&mut self) -> Result<(), WardenError> {
        self.test_connections().await?;
        info!(
            "Reconciler started (sync every {}s)",
            self.sync_interval.as_secs()
        );

        let mut last_sync: Option<Instant> = None;

        while !self.shutdown.is_cancelled() {
            let due = last_sync
                .map(|at| at.elapsed() >= self.sync_interval)
                .unwrap_or(true);

            if due {
                self.tick().await;
                last_sync = Some(Instant::now());
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        info!("Reconciler stopped");
        Ok(())
    }

    /// One reconciliation pass: fan in, gate, partition, project, account.
    pub async fn tick(&mut self) {
        let mut tick = SyncTick::new();

        self.collect_lapi(&mut tick).await;
        self.collect_siem(&mut tick).await;

        self.project_cluster(&tick).await;
        self.project_local(&tick);
        self.refresh_currently_banned();

        if !tick.adapter_errors.is_empty() {
            debug!(
                "Sync finished with {} adapter error(s)",
                tick.adapter_errors.len()
            );
        }

        self.metrics
            .record_sync_duration(tick.started_at.elapsed().as_secs_f64());

        self.tick_count += 1;
        if self.tick_count % self.summary_interval_ticks == 0 {
            self.metrics.log_summary();
        }
    }

    fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.contains(ip)
    }

    async fn collect_lapi(&mut self, tick: &mut SyncTick) {
        let startup = self.first_poll;
        let result = match self.lapi.as_ref() {
            Some(lapi) => lapi.get_decisions(startup).await,
            None => return,
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("LAPI poll failed: {}", e);
                self.metrics.record_error(Component::Lapi);
                tick.record_adapter_error(Component::Lapi, e.to_string());
                return;
            }
        };

        // Replay of the full corpus is only needed once per process life.
        self.first_poll = false;

        for _ in 0..stream.new.len() + stream.deleted.len() {
            self.metrics.record_lapi_decision();
        }

        let delta = lapi::normalize(&stream);

        for decision in &delta.additions {
            if self.is_whitelisted(&decision.ip) {
                info!("Whitelist protects {} from LAPI ban", decision.ip);
                continue;
            }
            if tick.stage_ban(&decision.ip) {
                debug!(
                    "LAPI ban {} ({}, ttl {:?})",
                    decision.ip, decision.scenario, decision.ttl
                );
                self.metrics.record_ban();
            }
        }

        for decision in &delta.removals {
            // Whitelisted entries were never enforced; nothing to lift.
            if self.is_whitelisted(&decision.ip) {
                continue;
            }
            if tick.stage_unban(&decision.ip) {
                debug!("LAPI unban {}", decision.ip);
                self.metrics.record_unban();
            }
        }
    }

    async fn collect_siem(&mut self, tick: &mut SyncTick) {
        let result = match self.siem.as_mut() {
            Some(siem) => siem.get_alerts(None, 100).await,
            None => return,
        };

        let alerts = match result {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!("SIEM poll failed: {}", e);
                self.metrics.record_error(Component::Siem);
                tick.record_adapter_error(Component::Siem, e.to_string());
                return;
            }
        };

        for action in siem::to_actions(&alerts) {
            self.metrics.record_siem_alert();

            match action.kind {
                DecisionKind::Ban => {
                    if self.is_whitelisted(&action.ip) {
                        info!("Whitelist protects {} from SIEM ban", action.ip);
                        continue;
                    }
                    if tick.stage_ban(&action.ip) {
                        debug!("SIEM ban {} ({})", action.ip, action.scenario);
                        self.metrics.record_ban();
                    }
                }
                DecisionKind::Allow => {
                    if self.is_whitelisted(&action.ip) {
                        continue;
                    }
                    if tick.stage_unban(&action.ip) {
                        debug!("SIEM allow {} ({})", action.ip, action.scenario);
                        self.metrics.record_unban();
                    }
                }
                DecisionKind::Monitor => {
                    debug!("SIEM monitor-only alert for {} ({})", action.ip, action.scenario);
                }
            }
        }
    }

    async fn project_cluster(&self, tick: &SyncTick) {
        if tick.to_ban.is_empty() && tick.to_unban.is_empty() {
            return;
        }

        self.metrics.record_cluster_api_call();

        match self
            .cluster
            .bulk_update(&self.ipset_name, &tick.to_ban, &tick.to_unban)
            .await
        {
            Ok(summary) => {
                for _ in 0..summary.failed {
                    self.metrics.record_error(Component::Cluster);
                }
            }
            Err(e) => {
                warn!("Cluster plane update failed: {}", e);
                self.metrics.record_error(Component::Cluster);
            }
        }
    }

    fn project_local(&self, tick: &SyncTick) {
        let Some(local) = &self.local else {
            return;
        };

        for ip in &tick.to_ban {
            self.metrics.record_local_op();
            if let Err(e) = local.add(ip) {
                warn!("Local plane add {} failed: {}", ip, e);
                self.metrics.record_error(Component::Local);
            }
        }

        for ip in &tick.to_unban {
            self.metrics.record_local_op();
            if let Err(e) = local.remove(ip) {
                warn!("Local plane remove {} failed: {}", ip, e);
                self.metrics.record_error(Component::Local);
            }
        }
    }

    /// The gauge tracks the local set when that plane exists; without it the
    /// gauge keeps its last value (enumerating the cluster set every sync
    /// costs too much on large clusters).
    fn refresh_currently_banned(&self) {
        let Some(local) = &self.local else {
            return;
        };

        match local.list() {
            Ok(members) => self.metrics.update_currently_banned(members.len() as u64),
            Err(e) => {
                warn!("Failed to enumerate local set: {}", e);
                self.metrics.record_error(Component::Local);
            }
        }
    }
}
