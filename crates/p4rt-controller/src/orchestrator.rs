//! Multi-switch lifecycle: bring-up, polling and shutdown.
//!
//! The [`Orchestrator`] owns every session it brings up. Each switch is
//! brought up in its own task (connect, mastership, pipeline, initial
//! rules); a failing switch is reported and closed while the others carry
//! on. The polling loop drains congestion signals from every live
//! subscription on a fixed interval until cancelled, and shutdown closes
//! every session even when some closes fail.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::clone_session::CloneSession;
use crate::error::{ControllerError, Result};
use crate::installer::{AclEntry, EcnThreshold, ForwardingEntry, PipelineNames, RuleInstaller};
use crate::monitor::{CongestionSignal, MonitorExit, NotificationMonitor, Subscription};
use crate::rule::TableRule;
use crate::session::{SessionOptions, SwitchSession, SwitchTarget};
use crate::transport::{CounterEntry, PipelineConfig, SwitchConnector, Update};
use crate::{audit_log, error_log, info_log, warn_log};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "Orchestrator";

/// Everything one switch receives at bring-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchPlan {
    #[serde(flatten)]
    pub target: SwitchTarget,
    #[serde(default)]
    pub forwarding: Vec<ForwardingEntry>,
    #[serde(default)]
    pub acl: Vec<AclEntry>,
    #[serde(default)]
    pub clone_sessions: Vec<CloneSession>,
    /// Overrides the threshold given to [`Orchestrator::bring_up`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecn_threshold: Option<u64>,
}

impl SwitchPlan {
    pub fn new(target: SwitchTarget) -> Self {
        Self {
            target,
            forwarding: Vec::new(),
            acl: Vec::new(),
            clone_sessions: Vec::new(),
            ecn_threshold: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub session: SessionOptions,
    pub poll_interval: Duration,
    /// Congestion signals buffered per switch between ticks
    pub queue_depth: usize,
    pub names: PipelineNames,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            poll_interval: Duration::from_secs(1),
            queue_depth: 64,
            names: PipelineNames::default(),
        }
    }
}

/// Bring-up result of one switch.
#[derive(Debug)]
pub struct SwitchOutcome {
    pub switch: String,
    /// Updates written during bring-up, or the error that aborted it.
    pub result: Result<Vec<Update>>,
}

/// Bring-up results in plan order.
#[derive(Debug, Default)]
pub struct BringUpReport {
    pub outcomes: Vec<SwitchOutcome>,
}

impl BringUpReport {
    pub fn live(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.switch.as_str())
            .collect()
    }

    pub fn failures(&self) -> Vec<(&str, &ControllerError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.switch.as_str(), e)))
            .collect()
    }

    /// True when the first planned switch could not be reached at all.
    pub fn first_switch_unreachable(&self) -> bool {
        matches!(
            self.outcomes.first().map(|o| &o.result),
            Some(Err(ControllerError::Connection { .. }))
        )
    }

    pub fn installed(&self) -> impl Iterator<Item = (&str, &Update)> {
        self.outcomes.iter().flat_map(|o| {
            o.result
                .iter()
                .flatten()
                .map(move |update| (o.switch.as_str(), update))
        })
    }
}

/// What one polling tick collected.
#[derive(Debug, Default)]
pub struct TickReport {
    pub signals: Vec<CongestionSignal>,
    /// Subscriptions that stopped since the previous tick
    pub stopped: Vec<(String, MonitorExit)>,
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub closed: Vec<String>,
    pub monitors: Vec<(String, MonitorExit)>,
    pub errors: Vec<ControllerError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Receives what the polling loop observes.
pub trait TickReporter: Send {
    fn congestion(&mut self, signal: &CongestionSignal);

    fn counter(&mut self, _switch: &str, _entry: &Result<CounterEntry>) {}

    fn monitor_stopped(&mut self, _switch: &str, _exit: &MonitorExit) {}
}

enum Pending {
    Spawned(JoinHandle<Result<(SwitchSession, Vec<Update>)>>),
    Rejected(ControllerError),
}

struct LiveSwitch {
    session: Arc<SwitchSession>,
    subscription: Option<Subscription>,
}

pub struct Orchestrator {
    connector: Arc<dyn SwitchConnector>,
    pipeline: Arc<PipelineConfig>,
    installer: Arc<RuleInstaller>,
    settings: OrchestratorSettings,
    monitor: NotificationMonitor,
    cancel: CancellationToken,
    live: Vec<LiveSwitch>,
    counter_watch: Option<(String, u64)>,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn SwitchConnector>,
        pipeline: PipelineConfig,
        settings: OrchestratorSettings,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            connector,
            pipeline: Arc::new(pipeline),
            installer: Arc::new(RuleInstaller::new(settings.names.clone())),
            monitor: NotificationMonitor::new(settings.queue_depth, cancel.clone()),
            settings,
            cancel,
            live: Vec::new(),
            counter_watch: None,
        }
    }

    /// Reads `counter[index]` on every switch each tick.
    pub fn watch_counter(&mut self, counter: impl Into<String>, index: u64) {
        self.counter_watch = Some((counter.into(), index));
    }

    /// Cancelling this token stops the polling loop and all subscriptions.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn installer(&self) -> &RuleInstaller {
        &self.installer
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<SwitchSession>> {
        self.live.iter().map(|l| &l.session)
    }

    pub fn session(&self, name: &str) -> Option<&Arc<SwitchSession>> {
        self.sessions().find(|s| s.name() == name)
    }

    /// Brings up every planned switch concurrently.
    ///
    /// Switches without their own threshold get `default_threshold`; with
    /// neither, the ECN rule is left alone.
    pub async fn bring_up(
        &mut self,
        plans: Vec<SwitchPlan>,
        default_threshold: Option<EcnThreshold>,
    ) -> BringUpReport {
        let mut names: HashSet<String> = self.sessions().map(|s| s.name().to_string()).collect();
        let mut device_ids: HashSet<u64> = self.sessions().map(|s| s.device_id()).collect();

        let mut tasks = Vec::with_capacity(plans.len());
        for plan in plans {
            let name = plan.target.name.clone();
            if !names.insert(name.clone()) || !device_ids.insert(plan.target.device_id) {
                let err = ControllerError::InvalidConfig(format!(
                    "switch {} (device {}) duplicates another switch",
                    name, plan.target.device_id
                ));
                tasks.push((name, Pending::Rejected(err)));
                continue;
            }

            let connector = Arc::clone(&self.connector);
            let pipeline = Arc::clone(&self.pipeline);
            let installer = Arc::clone(&self.installer);
            let options = self.settings.session.clone();
            let handle = tokio::spawn(async move {
                bring_up_switch(connector, pipeline, installer, options, plan, default_threshold)
                    .await
            });
            tasks.push((name, Pending::Spawned(handle)));
        }

        let mut report = BringUpReport::default();
        for (switch, pending) in tasks {
            let result = match pending {
                Pending::Rejected(err) => Err(err),
                Pending::Spawned(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(ControllerError::InvalidConfig(format!(
                        "bring-up task for {} failed: {}",
                        switch, e
                    ))),
                },
            };

            let result = match result {
                Ok((session, updates)) => match self.monitor.subscribe(&session).await {
                    Ok(subscription) => {
                        self.live.push(LiveSwitch {
                            session: Arc::new(session),
                            subscription: Some(subscription),
                        });
                        Ok(updates)
                    }
                    Err(e) => {
                        close_quietly(&session).await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match &result {
                Ok(updates) => {
                    info_log!(SOURCE, switch = %switch, updates = updates.len(), "Switch is up");
                }
                Err(e) => {
                    // Unreachable switches are left out; the rest keep running.
                    let unreachable = e.is_bring_up_error();
                    error_log!(SOURCE, switch = %switch, error = %e, unreachable, "Bring-up failed");
                    audit_log!(AuditRecord::new(AuditCategory::Lifecycle, SOURCE, "bring_up")
                        .with_object_id(switch.clone())
                        .with_object_type("switch")
                        .with_error(e.to_string()));
                }
            }
            report.outcomes.push(SwitchOutcome { switch, result });
        }

        audit_log!(AuditRecord::new(AuditCategory::Lifecycle, SOURCE, "bring_up_complete")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "live": report.live(),
                "failed": report.failures().len(),
            })));
        report
    }

    /// Drains every live subscription without waiting.
    pub async fn poll_once(&mut self) -> TickReport {
        let mut report = TickReport::default();
        for live in &mut self.live {
            let finished = match &live.subscription {
                Some(sub) => sub.is_finished(),
                None => continue,
            };
            if let Some(sub) = live.subscription.as_mut() {
                report.signals.extend(sub.try_drain());
            }
            if finished {
                if let Some(sub) = live.subscription.take() {
                    let exit = sub.join().await;
                    warn_log!(SOURCE, switch = %live.session.name(), exit = %exit, "Monitoring stopped");
                    report
                        .stopped
                        .push((live.session.name().to_string(), exit));
                }
            }
        }
        report
    }

    /// Polls every interval until the cancel token fires.
    pub async fn run(&mut self, reporter: &mut dyn TickReporter) {
        let cancel = self.cancel.clone();
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info_log!(SOURCE, interval_ms = self.settings.poll_interval.as_millis() as u64, "Monitoring network congestion");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let tick = self.poll_once().await;
            for signal in &tick.signals {
                warn_log!(SOURCE, switch = %signal.switch, device_id = signal.device_id, "Congestion detected");
                reporter.congestion(signal);
            }
            for (switch, exit) in &tick.stopped {
                reporter.monitor_stopped(switch, exit);
            }
            if let Some((counter, index)) = self.counter_watch.clone() {
                for (switch, entry) in self.read_counters(&counter, index).await {
                    reporter.counter(&switch, &entry);
                }
            }
        }
        info_log!(SOURCE, "Polling loop stopped");
    }

    /// Reads back installed entries from every live switch.
    pub async fn dump_tables(&self, table: Option<&str>) -> Vec<(String, Result<Vec<TableRule>>)> {
        let mut tables = Vec::with_capacity(self.live.len());
        for live in &self.live {
            let entries = live.session.read_table_entries(table).await;
            tables.push((live.session.name().to_string(), entries));
        }
        tables
    }

    pub async fn read_counters(
        &self,
        counter: &str,
        index: u64,
    ) -> Vec<(String, Result<CounterEntry>)> {
        let mut counters = Vec::with_capacity(self.live.len());
        for live in &self.live {
            let entry = live.session.read_counter(counter, index).await;
            counters.push((live.session.name().to_string(), entry));
        }
        counters
    }

    /// Stops monitoring and closes every session, collecting all errors.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        self.cancel.cancel();
        let mut report = ShutdownReport::default();

        for live in self.live.drain(..) {
            let name = live.session.name().to_string();
            if let Some(sub) = live.subscription {
                report.monitors.push((name.clone(), sub.stop().await));
            }
            match live.session.close().await {
                Ok(()) => report.closed.push(name.clone()),
                Err(e) => {
                    error_log!(SOURCE, switch = %name, error = %e, "Close failed, continuing shutdown");
                    report.errors.push(e);
                }
            }
            self.installer.forget(&name).await;
        }

        let record = AuditRecord::new(AuditCategory::Lifecycle, SOURCE, "shutdown").with_details(
            serde_json::json!({
                "closed": report.closed,
                "errors": report.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }),
        );
        if report.is_clean() {
            audit_log!(record.with_outcome(AuditOutcome::Success));
        } else {
            audit_log!(record.with_error(format!("{} session(s) failed to close", report.errors.len())));
        }
        report
    }
}

async fn close_quietly(session: &SwitchSession) {
    if let Err(e) = session.close().await {
        warn_log!(SOURCE, switch = %session.name(), error = %e, "Close after failed bring-up");
    }
}

async fn bring_up_switch(
    connector: Arc<dyn SwitchConnector>,
    pipeline: Arc<PipelineConfig>,
    installer: Arc<RuleInstaller>,
    options: SessionOptions,
    plan: SwitchPlan,
    default_threshold: Option<EcnThreshold>,
) -> Result<(SwitchSession, Vec<Update>)> {
    let session = SwitchSession::connect(connector.as_ref(), plan.target.clone(), options).await?;

    match install_plan(&session, &pipeline, &installer, &plan, default_threshold).await {
        Ok(updates) => Ok((session, updates)),
        Err(e) => {
            close_quietly(&session).await;
            Err(e)
        }
    }
}

async fn install_plan(
    session: &SwitchSession,
    pipeline: &PipelineConfig,
    installer: &RuleInstaller,
    plan: &SwitchPlan,
    default_threshold: Option<EcnThreshold>,
) -> Result<Vec<Update>> {
    session.become_master().await?;
    session.push_pipeline_config(pipeline).await?;

    let threshold = match plan.ecn_threshold {
        Some(value) => Some(EcnThreshold::new(value, installer.names().ecn_bitwidth)?),
        None => default_threshold,
    };

    let mut updates = installer
        .apply_forwarding_table(session, &plan.forwarding)
        .await?;
    if !plan.acl.is_empty() {
        updates.extend(installer.apply_acl_rules(session, &plan.acl).await?);
    }
    if let Some(threshold) = threshold {
        updates.extend(installer.apply_ecn_threshold(session, threshold).await?);
    }
    for clone in &plan.clone_sessions {
        updates.extend(
            installer
                .install_clone_session(session, clone.clone())
                .await?,
        );
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone_session::{DEFAULT_CLONE_SESSION_ID, DEFAULT_MONITOR_PORT};
    use crate::monitor::EcnCode;
    use crate::sim::{SimulatedFabric, SwitchOp};
    use crate::transport::ElectionId;
    use pretty_assertions::assert_eq;

    fn plans(count: u64) -> Vec<SwitchPlan> {
        (0..count)
            .map(|i| {
                let mut plan = SwitchPlan::new(SwitchTarget::new(
                    format!("s{}", i + 1),
                    format!("127.0.0.1:{}", 50051 + i),
                    i,
                ));
                plan.clone_sessions.push(
                    CloneSession::monitoring(DEFAULT_CLONE_SESSION_ID, DEFAULT_MONITOR_PORT)
                        .unwrap(),
                );
                plan
            })
            .collect()
    }

    async fn orchestrator(plans: &[SwitchPlan]) -> (SimulatedFabric, Orchestrator) {
        let fabric =
            SimulatedFabric::for_targets(plans.iter().map(|p| &p.target)).await;
        let orchestrator = Orchestrator::new(
            Arc::new(fabric.clone()),
            PipelineConfig::new("p4info", b"{}".to_vec()),
            OrchestratorSettings {
                poll_interval: Duration::from_millis(20),
                ..OrchestratorSettings::default()
            },
        );
        (fabric, orchestrator)
    }

    #[derive(Default)]
    struct Collect(Vec<CongestionSignal>);

    impl TickReporter for Collect {
        fn congestion(&mut self, signal: &CongestionSignal) {
            self.0.push(signal.clone());
        }
    }

    // ===== 1. Bring-up Tests =====

    #[tokio::test]
    async fn test_bring_up_order_per_switch() {
        let plans = plans(1);
        let (fabric, mut orch) = orchestrator(&plans).await;
        let report = orch
            .bring_up(plans, Some(EcnThreshold::new(10, 19).unwrap()))
            .await;
        assert_eq!(report.live(), vec!["s1"]);
        assert_eq!(report.installed().count(), 2);

        let ops = fabric.switch("s1").await.unwrap().ops().await;
        assert_eq!(ops[0], SwitchOp::Arbitrate(ElectionId::new(0, 1)));
        assert_eq!(ops[1], SwitchOp::SetPipeline);
        assert!(ops[2..]
            .iter()
            .all(|op| matches!(op, SwitchOp::Write { .. })));
    }

    #[tokio::test]
    async fn test_partial_bring_up() {
        let plans = plans(3);
        let (fabric, mut orch) = orchestrator(&plans).await;
        fabric
            .switch("s2")
            .await
            .unwrap()
            .set_rival(ElectionId::new(5, 0))
            .await;

        let report = orch.bring_up(plans, None).await;
        assert_eq!(report.live(), vec!["s1", "s3"]);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "s2");
        assert!(matches!(failures[0].1, ControllerError::Arbitration { .. }));
        assert!(!report.first_switch_unreachable());

        let s2 = fabric.switch("s2").await.unwrap();
        assert!(!s2
            .ops()
            .await
            .iter()
            .any(|op| matches!(op, SwitchOp::Write { .. })));
        assert!(!s2.is_connected().await);
        assert!(orch.session("s2").is_none());
    }

    #[tokio::test]
    async fn test_first_switch_unreachable() {
        let plans = plans(2);
        let (fabric, mut orch) = orchestrator(&plans).await;
        fabric
            .switch("s1")
            .await
            .unwrap()
            .refuse_connections(true)
            .await;
        let report = orch.bring_up(plans, None).await;
        assert!(report.first_switch_unreachable());
        assert_eq!(report.live(), vec!["s2"]);
    }

    #[tokio::test]
    async fn test_duplicate_device_id_rejected() {
        let mut plans = plans(2);
        plans[1].target.device_id = 0;
        let (_fabric, mut orch) = orchestrator(&plans).await;
        let report = orch.bring_up(plans, None).await;
        assert_eq!(report.live(), vec!["s1"]);
        assert!(matches!(
            report.failures()[0].1,
            ControllerError::InvalidConfig(_)
        ));
    }

    // ===== 2. Polling Tests =====

    #[tokio::test]
    async fn test_run_reports_until_cancelled() {
        let plans = plans(2);
        let (fabric, mut orch) = orchestrator(&plans).await;
        orch.bring_up(plans, None).await;
        let cancel = orch.cancel_token();

        let s1 = fabric.switch("s1").await.unwrap();
        let injector = tokio::spawn(async move {
            s1.inject_ecn(EcnCode::CongestionExperienced).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let mut collect = Collect::default();
        tokio::time::timeout(Duration::from_secs(2), orch.run(&mut collect))
            .await
            .unwrap();
        injector.await.unwrap();
        assert_eq!(collect.0.len(), 1);
        assert_eq!(collect.0[0].switch, "s1");
    }

    #[tokio::test]
    async fn test_terminal_stream_reported_once() {
        let plans = plans(1);
        let (fabric, mut orch) = orchestrator(&plans).await;
        orch.bring_up(plans, None).await;
        fabric
            .switch("s1")
            .await
            .unwrap()
            .end_stream(crate::transport::TransportError::unavailable("gone"))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tick = orch.poll_once().await;
        assert_eq!(tick.stopped.len(), 1);
        assert!(matches!(tick.stopped[0].1, MonitorExit::Terminal(_)));
        assert!(orch.poll_once().await.stopped.is_empty());
    }

    // ===== 3. Shutdown Tests =====

    #[tokio::test]
    async fn test_shutdown_continues_past_close_failure() {
        let plans = plans(3);
        let (fabric, mut orch) = orchestrator(&plans).await;
        orch.bring_up(plans, None).await;
        fabric
            .switch("s2")
            .await
            .unwrap()
            .fail_close("transport reset")
            .await;
        let sessions: Vec<_> = orch.sessions().cloned().collect();

        let report = orch.shutdown().await;
        assert_eq!(report.closed, vec!["s1", "s3"]);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], ControllerError::Close { ref switch, .. } if switch == "s2"));
        assert!(sessions.iter().all(|s| s.is_closed()));
        for name in ["s1", "s2", "s3"] {
            assert!(!fabric.switch(name).await.unwrap().is_connected().await);
        }
        assert!(orch.shutdown().await.is_clean());
    }

    #[tokio::test]
    async fn test_dump_tables_and_counters() {
        let mut plans = plans(1);
        plans[0].forwarding.push(ForwardingEntry::new(
            "10.0.1.1/32".parse().unwrap(),
            "08:00:00:00:01:01".parse().unwrap(),
            2,
        ));
        let (fabric, mut orch) = orchestrator(&plans).await;
        orch.bring_up(plans, Some(EcnThreshold::new(7, 19).unwrap()))
            .await;
        fabric
            .switch("s1")
            .await
            .unwrap()
            .set_counter("MyIngress.ingressCounter", 0, 3, 300)
            .await;

        let tables = orch.dump_tables(None).await;
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].1.as_ref().unwrap().len(), 2);

        let counters = orch.read_counters("MyIngress.ingressCounter", 0).await;
        assert_eq!(counters[0].1.as_ref().unwrap().packets, 3);
    }
}
