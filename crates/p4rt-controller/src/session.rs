//! One controller session per switch.
//!
//! A [`SwitchSession`] owns the channel to a single switch. It tracks
//! mastership, serializes writes, turns transport failures into
//! [`ControllerError`]s and hands out the inbound notification stream once.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::clone_session::CloneSession;
use crate::error::{ControllerError, EntryFailure, Result};
use crate::rule::TableRule;
use crate::transport::{
    ArbitrationStatus, CounterEntry, ElectionId, Entity, PipelineConfig, RpcCode, StreamEvent,
    StreamItem, SwitchChannel, SwitchConnector, TransportError, Update, UpdateKind,
};
use crate::{audit_log, debug_log, info_log, warn_log};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const SOURCE: &str = "SwitchSession";

/// Identity of a remote switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchTarget {
    pub name: String,
    /// RPC endpoint, `host:port`
    pub address: String,
    pub device_id: u64,
    /// Every request is appended here when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_path: Option<PathBuf>,
}

impl SwitchTarget {
    pub fn new(name: impl Into<String>, address: impl Into<String>, device_id: u64) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            device_id,
            dump_path: None,
        }
    }

    pub fn with_dump_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = Some(path.into());
        self
    }
}

/// Per-session settings fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub election_id: ElectionId,
    /// Bound on every individual RPC
    pub rpc_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            election_id: ElectionId::new(0, 1),
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

/// Appends one timestamped line per request to a text file.
#[derive(Debug)]
struct RequestDump {
    path: PathBuf,
}

impl RequestDump {
    fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn_log!(SOURCE, path = %parent.display(), error = %e, "Cannot create dump directory");
            }
        }
        Self {
            path: path.to_path_buf(),
        }
    }

    fn record(&self, request: &str) {
        let line = format!("[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), request);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(e) = result {
            warn_log!(SOURCE, path = %self.path.display(), error = %e, "Request dump failed");
        }
    }
}

/// Inbound notifications of one session.
///
/// Arbitration events that report lost mastership clear the session's
/// mastership flag as they pass through.
#[derive(Debug)]
pub struct EventStream {
    switch: String,
    rx: mpsc::Receiver<StreamItem>,
    is_master: Arc<AtomicBool>,
}

impl EventStream {
    pub fn switch(&self) -> &str {
        &self.switch
    }

    /// Waits for the next item; `None` once the switch side has hung up.
    pub async fn next(&mut self) -> Option<StreamItem> {
        let item = self.rx.recv().await?;
        if let Ok(StreamEvent::Arbitration {
            is_primary,
            election_id,
        }) = &item
        {
            if !is_primary && self.is_master.swap(false, Ordering::SeqCst) {
                warn_log!(SOURCE, switch = %self.switch, primary = %election_id, "Mastership lost");
                audit_log!(AuditRecord::new(AuditCategory::Arbitration, SOURCE, "mastership_lost")
                    .with_outcome(AuditOutcome::Denied)
                    .with_object_id(self.switch.clone())
                    .with_object_type("switch")
                    .with_details(serde_json::json!({ "primary": election_id.to_string() })));
            }
        }
        Some(item)
    }
}

/// A live session with one switch.
pub struct SwitchSession {
    target: SwitchTarget,
    options: SessionOptions,
    channel: Box<dyn SwitchChannel>,
    is_master: Arc<AtomicBool>,
    stream_taken: AtomicBool,
    closed: AtomicBool,
    write_lock: Mutex<()>,
    dump: Option<RequestDump>,
}

impl std::fmt::Debug for SwitchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchSession")
            .field("target", &self.target)
            .field("is_master", &self.is_master())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SwitchSession {
    /// Opens the channel to `target`.
    pub async fn connect(
        connector: &dyn SwitchConnector,
        target: SwitchTarget,
        options: SessionOptions,
    ) -> Result<Self> {
        let connection_error = |reason: String| ControllerError::Connection {
            switch: target.name.clone(),
            address: target.address.clone(),
            reason,
        };

        let channel = match tokio::time::timeout(options.rpc_timeout, connector.connect(&target)).await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(connection_error(e.to_string())),
            Err(_) => return Err(connection_error(TransportError::deadline_exceeded().to_string())),
        };

        let dump = target.dump_path.as_deref().map(RequestDump::open);
        info_log!(SOURCE, switch = %target.name, address = %target.address, device_id = target.device_id, "Connected");
        audit_log!(AuditRecord::new(AuditCategory::Session, SOURCE, "connect")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(target.name.clone())
            .with_object_type("switch")
            .with_details(serde_json::json!({
                "address": target.address,
                "device_id": target.device_id,
            })));

        Ok(Self {
            target,
            options,
            channel,
            is_master: Arc::new(AtomicBool::new(false)),
            stream_taken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            dump,
        })
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn target(&self) -> &SwitchTarget {
        &self.target
    }

    pub fn device_id(&self) -> u64 {
        self.target.device_id
    }

    pub fn election_id(&self) -> ElectionId {
        self.options.election_id
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn dump(&self, request: impl FnOnce() -> String) {
        if let Some(dump) = &self.dump {
            dump.record(&request());
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ControllerError::SessionClosed(self.target.name.clone()));
        }
        Ok(())
    }

    fn ensure_master(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.is_master() {
            return Err(ControllerError::Arbitration {
                switch: self.target.name.clone(),
                reason: "mastership has not been acquired".to_string(),
            });
        }
        Ok(())
    }

    async fn call<T, F>(&self, fut: F) -> std::result::Result<T, TransportError>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        tokio::time::timeout(self.options.rpc_timeout, fut)
            .await
            .unwrap_or_else(|_| Err(TransportError::deadline_exceeded()))
    }

    /// Sends the arbitration update and requires primary status.
    pub async fn become_master(&self) -> Result<()> {
        self.ensure_open()?;
        let election_id = self.options.election_id;
        self.dump(|| {
            format!(
                "MasterArbitrationUpdate device_id={} election_id={}",
                self.target.device_id, election_id
            )
        });

        let reason = match self
            .call(self.channel.arbitrate(self.target.device_id, election_id))
            .await
        {
            Ok(ArbitrationStatus::Primary) => {
                self.is_master.store(true, Ordering::SeqCst);
                info_log!(SOURCE, switch = %self.target.name, election_id = %election_id, "Mastership acquired");
                audit_log!(AuditRecord::new(AuditCategory::Arbitration, SOURCE, "become_master")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(self.target.name.clone())
                    .with_object_type("switch"));
                return Ok(());
            }
            Ok(ArbitrationStatus::Backup { current }) => {
                format!("election id {} outranks ours ({})", current, election_id)
            }
            Err(e) => e.to_string(),
        };

        self.is_master.store(false, Ordering::SeqCst);
        audit_log!(AuditRecord::new(AuditCategory::Arbitration, SOURCE, "become_master")
            .with_object_id(self.target.name.clone())
            .with_object_type("switch")
            .with_error(reason.clone()));
        Err(ControllerError::Arbitration {
            switch: self.target.name.clone(),
            reason,
        })
    }

    /// Installs the forwarding pipeline. Pushing the same pipeline again is harmless.
    pub async fn push_pipeline_config(&self, config: &PipelineConfig) -> Result<()> {
        self.ensure_master()?;
        let config_error = |reason: String| ControllerError::Config {
            switch: self.target.name.clone(),
            reason,
        };
        if config.is_empty() {
            return Err(config_error("empty pipeline artifacts".to_string()));
        }

        self.dump(|| {
            format!(
                "SetForwardingPipelineConfig device_id={} p4info_bytes={} device_config_bytes={}",
                self.target.device_id,
                config.p4info.len(),
                config.device_config.len()
            )
        });

        let result = self
            .call(
                self.channel
                    .set_pipeline(self.target.device_id, self.options.election_id, config),
            )
            .await;

        let record = AuditRecord::new(AuditCategory::PipelineConfig, SOURCE, "set_pipeline")
            .with_object_id(self.target.name.clone())
            .with_object_type("switch");
        match result {
            Ok(()) => {
                info_log!(SOURCE, switch = %self.target.name, "Pipeline config installed");
                audit_log!(record.with_outcome(AuditOutcome::Success));
                Ok(())
            }
            Err(e) => {
                audit_log!(record.with_error(e.to_string()));
                Err(config_error(e.to_string()))
            }
        }
    }

    pub async fn write_entry(&self, kind: UpdateKind, rule: TableRule) -> Result<()> {
        self.write_entries(vec![Update {
            kind,
            entity: Entity::Table(rule),
        }])
        .await
    }

    pub async fn write_clone_session(&self, kind: UpdateKind, session: CloneSession) -> Result<()> {
        self.write_entries(vec![Update {
            kind,
            entity: Entity::CloneSession(session),
        }])
        .await
    }

    /// Submits a batch and reports every rejected entry.
    ///
    /// Writes on one session are serialized and acknowledged in submission
    /// order. A timeout fails every entry of the batch.
    pub async fn write_entries(&self, updates: Vec<Update>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.ensure_master() {
            audit_log!(AuditRecord::new(AuditCategory::TableWrite, SOURCE, "write")
                .with_outcome(AuditOutcome::Denied)
                .with_object_id(self.target.name.clone())
                .with_object_type("switch")
                .with_details(serde_json::json!({ "updates": updates.len() })));
            return Err(e);
        }

        let _guard = self.write_lock.lock().await;
        for update in &updates {
            self.dump(|| format!("Write device_id={} {}", self.target.device_id, update));
        }

        let total = updates.len();
        let statuses = self
            .call(
                self.channel
                    .write(self.target.device_id, self.options.election_id, &updates),
            )
            .await;

        let failures: Vec<EntryFailure> = match statuses {
            Ok(statuses) => updates
                .iter()
                .enumerate()
                .filter_map(|(index, update)| {
                    let reason = match statuses.get(index) {
                        Some(Ok(())) => return None,
                        Some(Err(e)) => e.to_string(),
                        None => "no status returned".to_string(),
                    };
                    Some(EntryFailure::new(index, update.entity.describe_key(), reason))
                })
                .collect(),
            Err(e) if e.code == RpcCode::PermissionDenied => {
                self.is_master.store(false, Ordering::SeqCst);
                return Err(ControllerError::Arbitration {
                    switch: self.target.name.clone(),
                    reason: e.to_string(),
                });
            }
            Err(e) => updates
                .iter()
                .enumerate()
                .map(|(index, update)| {
                    EntryFailure::new(index, update.entity.describe_key(), e.to_string())
                })
                .collect(),
        };

        for (index, update) in updates.iter().enumerate() {
            let category = match update.entity {
                Entity::Table(_) => AuditCategory::TableWrite,
                Entity::CloneSession(_) => AuditCategory::CloneSession,
            };
            let record = AuditRecord::new(category, SOURCE, update.kind.to_string().to_lowercase())
                .with_object_id(update.entity.describe_key())
                .with_details(serde_json::json!({ "switch": self.target.name }));
            match failures.iter().find(|f| f.index == index) {
                Some(failure) => {
                    audit_log!(record.with_error(failure.reason.clone()));
                }
                None => {
                    audit_log!(record.with_outcome(AuditOutcome::Success));
                }
            }
        }

        if failures.is_empty() {
            debug_log!(SOURCE, switch = %self.target.name, count = total, "Write acknowledged");
            Ok(())
        } else {
            Err(ControllerError::Write {
                switch: self.target.name.clone(),
                total,
                failures,
            })
        }
    }

    /// Reads back installed entries of `table`, or of every table.
    pub async fn read_table_entries(&self, table: Option<&str>) -> Result<Vec<TableRule>> {
        self.ensure_open()?;
        self.dump(|| {
            format!(
                "Read device_id={} table={}",
                self.target.device_id,
                table.unwrap_or("*")
            )
        });
        self.call(self.channel.read_table(self.target.device_id, table))
            .await
            .map_err(|e| ControllerError::Read {
                switch: self.target.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Reads one counter cell.
    pub async fn read_counter(&self, counter: &str, index: u64) -> Result<CounterEntry> {
        self.ensure_open()?;
        let read_error = |reason: String| ControllerError::Read {
            switch: self.target.name.clone(),
            reason,
        };
        self.dump(|| {
            format!(
                "Read device_id={} counter={} index={}",
                self.target.device_id, counter, index
            )
        });
        let entries = self
            .call(
                self.channel
                    .read_counter(self.target.device_id, counter, Some(index)),
            )
            .await
            .map_err(|e| read_error(e.to_string()))?;
        entries
            .into_iter()
            .find(|entry| entry.index == index)
            .ok_or_else(|| read_error(format!("counter {} has no cell {}", counter, index)))
    }

    /// Takes the inbound stream. It cannot be taken twice.
    pub async fn receive_stream(&self) -> Result<EventStream> {
        self.ensure_open()?;
        let terminal = |reason: String| ControllerError::StreamTerminal {
            switch: self.target.name.clone(),
            reason,
        };
        if self.stream_taken.swap(true, Ordering::SeqCst) {
            return Err(terminal("stream already taken".to_string()));
        }
        let rx = self
            .call(self.channel.open_stream())
            .await
            .map_err(|e| terminal(e.to_string()))?;
        Ok(EventStream {
            switch: self.target.name.clone(),
            rx,
            is_master: Arc::clone(&self.is_master),
        })
    }

    /// Releases the channel. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.is_master.store(false, Ordering::SeqCst);
        self.dump(|| format!("Close device_id={}", self.target.device_id));

        let record = AuditRecord::new(AuditCategory::Session, SOURCE, "close")
            .with_object_id(self.target.name.clone())
            .with_object_type("switch");
        match self.call(self.channel.close()).await {
            Ok(()) => {
                info_log!(SOURCE, switch = %self.target.name, "Session closed");
                audit_log!(record.with_outcome(AuditOutcome::Success));
                Ok(())
            }
            Err(e) => {
                audit_log!(record.with_error(e.to_string()));
                Err(ControllerError::Close {
                    switch: self.target.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedFabric, SimulatedSwitch, SwitchOp};
    use p4rt_types::FieldValue;
    use pretty_assertions::assert_eq;

    fn target(name: &str, device_id: u64) -> SwitchTarget {
        SwitchTarget::new(name, format!("127.0.0.1:{}", 50051 + device_id), device_id)
    }

    fn ecn_rule(threshold: u64) -> TableRule {
        TableRule::default_action("MyEgress.check_ecn")
            .action("MyEgress.mark_ecn")
            .param("ecn_threshold", FieldValue::new(threshold, 19).unwrap())
            .build()
            .unwrap()
    }

    fn pipeline() -> PipelineConfig {
        PipelineConfig::new("pkg_info {}", b"{}".to_vec())
    }

    async fn connected(name: &str) -> (SimulatedSwitch, SwitchSession) {
        let fabric = SimulatedFabric::new();
        let switch = fabric.add(target(name, 0)).await;
        let session = SwitchSession::connect(&fabric, target(name, 0), SessionOptions::default())
            .await
            .unwrap();
        (switch, session)
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let fabric = SimulatedFabric::new();
        let err = SwitchSession::connect(&fabric, target("s9", 9), SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Connection { ref switch, .. } if switch == "s9"));
    }

    #[tokio::test]
    async fn test_write_before_master_is_rejected() {
        let (switch, session) = connected("s1").await;
        let err = session
            .write_entry(UpdateKind::Modify, ecn_rule(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Arbitration { .. }));
        assert!(switch.ops().await.is_empty());
    }

    #[tokio::test]
    async fn test_become_master_outranked() {
        let (switch, session) = connected("s1").await;
        switch.set_rival(ElectionId::new(0, 10)).await;
        let err = session.become_master().await.unwrap_err();
        assert!(matches!(err, ControllerError::Arbitration { .. }));
        assert!(!session.is_master());
    }

    #[tokio::test]
    async fn test_pipeline_requires_master_and_content() {
        let (_switch, session) = connected("s1").await;
        assert!(matches!(
            session.push_pipeline_config(&pipeline()).await,
            Err(ControllerError::Arbitration { .. })
        ));

        session.become_master().await.unwrap();
        assert!(matches!(
            session
                .push_pipeline_config(&PipelineConfig::new("", Vec::new()))
                .await,
            Err(ControllerError::Config { .. })
        ));
        session.push_pipeline_config(&pipeline()).await.unwrap();
        session.push_pipeline_config(&pipeline()).await.unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_rejected() {
        let (switch, session) = connected("s1").await;
        switch.reject_pipeline("schema mismatch").await;
        session.become_master().await.unwrap();
        let err = session.push_pipeline_config(&pipeline()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Config { ref reason, .. } if reason.contains("schema mismatch")));
    }

    #[tokio::test]
    async fn test_batch_reports_each_failure() {
        let (switch, session) = connected("s1").await;
        session.become_master().await.unwrap();
        session.push_pipeline_config(&pipeline()).await.unwrap();

        let rule = |prefix: &str| {
            TableRule::builder("MyIngress.ipv4_lpm")
                .lpm("hdr.ipv4.dstAddr", prefix.parse().unwrap())
                .action("MyIngress.ipv4_forward")
                .param("port", FieldValue::new(1, 9).unwrap())
                .build()
                .unwrap()
        };
        session
            .write_entry(UpdateKind::Insert, rule("10.0.1.1/32"))
            .await
            .unwrap();

        let err = session
            .write_entries(vec![
                Update::insert(Entity::Table(rule("10.0.1.1/32"))),
                Update::insert(Entity::Table(rule("10.0.2.0/24"))),
                Update::modify(Entity::Table(rule("10.0.3.0/24"))),
            ])
            .await
            .unwrap_err();

        let failures = err.entry_failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].index, 0);
        assert!(failures[0].reason.starts_with("ALREADY_EXISTS"));
        assert_eq!(failures[1].index, 2);
        assert!(failures[1].reason.starts_with("NOT_FOUND"));
        assert_eq!(switch.table_entries("MyIngress.ipv4_lpm").await.len(), 2);
    }

    #[tokio::test]
    async fn test_mastership_loss_blocks_writes() {
        let (switch, session) = connected("s1").await;
        session.become_master().await.unwrap();
        session.push_pipeline_config(&pipeline()).await.unwrap();
        let mut stream = session.receive_stream().await.unwrap();

        switch.set_rival(ElectionId::new(1, 0)).await;
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, StreamEvent::Arbitration { is_primary: false, .. }));
        assert!(!session.is_master());

        let err = session
            .write_entry(UpdateKind::Modify, ecn_rule(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Arbitration { .. }));
    }

    #[tokio::test]
    async fn test_stream_single_use() {
        let (_switch, session) = connected("s1").await;
        let _stream = session.receive_stream().await.unwrap();
        assert!(matches!(
            session.receive_stream().await,
            Err(ControllerError::StreamTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (switch, session) = connected("s1").await;
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(
            switch
                .ops()
                .await
                .iter()
                .filter(|op| matches!(op, SwitchOp::Close))
                .count(),
            1
        );
        assert!(matches!(
            session.become_master().await,
            Err(ControllerError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_a_write_error() {
        let fabric = SimulatedFabric::new();
        let switch = fabric.add(target("s1", 0)).await;
        let options = SessionOptions {
            rpc_timeout: Duration::from_millis(50),
            ..SessionOptions::default()
        };
        let session = SwitchSession::connect(&fabric, target("s1", 0), options)
            .await
            .unwrap();
        session.become_master().await.unwrap();
        session.push_pipeline_config(&pipeline()).await.unwrap();

        switch.set_write_delay(Duration::from_millis(500)).await;
        let err = session
            .write_entry(UpdateKind::Modify, ecn_rule(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Write { .. }));
        assert!(err.entry_failures()[0].reason.starts_with("DEADLINE_EXCEEDED"));
    }

    #[tokio::test]
    async fn test_read_counter() {
        let (switch, session) = connected("s1").await;
        switch.set_counter("MyIngress.ingressCounter", 1, 12, 1200).await;
        let entry = session
            .read_counter("MyIngress.ingressCounter", 1)
            .await
            .unwrap();
        assert_eq!(entry.packets, 12);
        assert_eq!(entry.bytes, 1200);
        assert!(matches!(
            session.read_counter("MyIngress.ingressCounter", 2).await,
            Err(ControllerError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_dump() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("logs").join("s1-p4runtime-requests.txt");
        let fabric = SimulatedFabric::new();
        fabric.add(target("s1", 0)).await;
        let session = SwitchSession::connect(
            &fabric,
            target("s1", 0).with_dump_path(&dump),
            SessionOptions::default(),
        )
        .await
        .unwrap();
        session.become_master().await.unwrap();
        session.push_pipeline_config(&pipeline()).await.unwrap();

        let contents = std::fs::read_to_string(&dump).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("MasterArbitrationUpdate device_id=0"));
        assert!(lines[1].contains("SetForwardingPipelineConfig"));
    }

    #[tokio::test]
    async fn test_switch_side_denial_clears_mastership() {
        let (switch, session) = connected("s1").await;
        session.become_master().await.unwrap();
        session.push_pipeline_config(&pipeline()).await.unwrap();

        // Preempted without this session draining its stream.
        switch.set_rival(ElectionId::new(0, 9)).await;
        let err = session
            .write_entry(UpdateKind::Modify, ecn_rule(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Arbitration { ref reason, .. } if reason.starts_with("PERMISSION_DENIED")));
        assert!(!session.is_master());
        assert_eq!(RpcCode::from_raw(7), RpcCode::PermissionDenied);
    }
}
