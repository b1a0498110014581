//! In-process simulated switches.
//!
//! [`SimulatedFabric`] implements [`SwitchConnector`] over a set of
//! [`SimulatedSwitch`]es that keep their tables, clone sessions and counters
//! in memory and enforce the switch-side rules a real target applies:
//! election-id arbitration, primary-only writes, insert/modify/delete
//! existence checks and single default entries per table. Faults and stream
//! events are injected through the switch handle.

use crate::clone_session::CloneSession;
use crate::monitor::{EcnCode, ECN_OFFSET};
use crate::rule::TableRule;
use crate::session::SwitchTarget;
use crate::transport::{
    ArbitrationStatus, CounterEntry, ElectionId, Entity, PipelineConfig, RpcCode, StreamEvent,
    StreamItem, SwitchChannel, SwitchConnector, TransportError, Update, UpdateKind, UpdateStatus,
};
use async_trait::async_trait;
use p4rt_types::{FieldValue, Ipv4Address, MacAddress};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const STREAM_DEPTH: usize = 64;

/// Request observed by a simulated switch, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOp {
    Arbitrate(ElectionId),
    SetPipeline,
    Write { kind: UpdateKind, entity: String },
    ReadTable(Option<String>),
    ReadCounter(String),
    Close,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connect: bool,
    close_error: Option<String>,
    pipeline_error: Option<String>,
    entry_errors: HashMap<String, TransportError>,
    write_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct SwitchState {
    primary: Option<ElectionId>,
    rival: Option<ElectionId>,
    pipeline: Option<PipelineConfig>,
    entries: BTreeMap<String, Vec<TableRule>>,
    defaults: BTreeMap<String, TableRule>,
    clone_sessions: BTreeMap<u32, CloneSession>,
    counters: BTreeMap<(String, u64), (u64, u64)>,
    stream_tx: Option<mpsc::Sender<StreamItem>>,
    stream_rx: Option<mpsc::Receiver<StreamItem>>,
    connected: bool,
    faults: Faults,
    ops: Vec<SwitchOp>,
}

impl SwitchState {
    fn apply(&mut self, update: &Update) -> UpdateStatus {
        if let Some(err) = self.faults.entry_errors.get(&update.entity.describe_key()) {
            return Err(err.clone());
        }
        match &update.entity {
            Entity::Table(rule) if rule.is_default() => self.apply_default(update.kind, rule),
            Entity::Table(rule) => self.apply_entry(update.kind, rule),
            Entity::CloneSession(session) => self.apply_clone_session(update.kind, session),
        }
    }

    fn apply_default(&mut self, kind: UpdateKind, rule: &TableRule) -> UpdateStatus {
        match kind {
            UpdateKind::Insert => Err(TransportError::new(
                RpcCode::InvalidArgument,
                "default entry only accepts MODIFY",
            )),
            UpdateKind::Modify => {
                self.defaults.insert(rule.table().to_string(), rule.clone());
                Ok(())
            }
            UpdateKind::Delete => {
                self.defaults.remove(rule.table());
                Ok(())
            }
        }
    }

    fn apply_entry(&mut self, kind: UpdateKind, rule: &TableRule) -> UpdateStatus {
        let entries = self.entries.entry(rule.table().to_string()).or_default();
        let key = rule.key();
        let position = entries.iter().position(|e| e.key() == key);
        match (kind, position) {
            (UpdateKind::Insert, Some(_)) => Err(TransportError::new(
                RpcCode::AlreadyExists,
                "entry already exists",
            )),
            (UpdateKind::Insert, None) => {
                entries.push(rule.clone());
                Ok(())
            }
            (UpdateKind::Modify, Some(i)) => {
                entries[i] = rule.clone();
                Ok(())
            }
            (UpdateKind::Delete, Some(i)) => {
                entries.remove(i);
                Ok(())
            }
            (_, None) => Err(TransportError::new(RpcCode::NotFound, "no such entry")),
        }
    }

    fn apply_clone_session(&mut self, kind: UpdateKind, session: &CloneSession) -> UpdateStatus {
        let exists = self.clone_sessions.contains_key(&session.session_id());
        match (kind, exists) {
            (UpdateKind::Insert, true) => Err(TransportError::new(
                RpcCode::AlreadyExists,
                "clone session already exists",
            )),
            (UpdateKind::Insert, false) | (UpdateKind::Modify, true) => {
                self.clone_sessions
                    .insert(session.session_id(), session.clone());
                Ok(())
            }
            (UpdateKind::Delete, true) => {
                self.clone_sessions.remove(&session.session_id());
                Ok(())
            }
            (_, false) => Err(TransportError::new(
                RpcCode::NotFound,
                "no such clone session",
            )),
        }
    }

    fn check_primary(&self, election_id: ElectionId) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::unavailable("channel closed"));
        }
        if self.primary != Some(election_id) {
            return Err(TransportError::new(
                RpcCode::PermissionDenied,
                format!("election id {} is not primary", election_id),
            ));
        }
        Ok(())
    }
}

/// Handle to one simulated switch. Clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedSwitch {
    target: SwitchTarget,
    state: Arc<Mutex<SwitchState>>,
}

impl SimulatedSwitch {
    pub fn new(target: SwitchTarget) -> Self {
        Self {
            target,
            state: Arc::new(Mutex::new(SwitchState::default())),
        }
    }

    pub fn target(&self) -> &SwitchTarget {
        &self.target
    }

    pub async fn ops(&self) -> Vec<SwitchOp> {
        self.state.lock().await.ops.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn primary(&self) -> Option<ElectionId> {
        self.state.lock().await.primary
    }

    pub async fn pipeline(&self) -> Option<PipelineConfig> {
        self.state.lock().await.pipeline.clone()
    }

    pub async fn table_entries(&self, table: &str) -> Vec<TableRule> {
        self.state
            .lock()
            .await
            .entries
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn default_entry(&self, table: &str) -> Option<TableRule> {
        self.state.lock().await.defaults.get(table).cloned()
    }

    pub async fn clone_session(&self, id: u32) -> Option<CloneSession> {
        self.state.lock().await.clone_sessions.get(&id).cloned()
    }

    /// Highest-ranked installed entry of `table` matching `fields`.
    ///
    /// Entries rank by priority, then by key specificity, so the longest
    /// prefix wins on LPM tables whatever the installation order.
    pub async fn lookup(&self, table: &str, fields: &[(&str, FieldValue)]) -> Option<TableRule> {
        let state = self.state.lock().await;
        state
            .entries
            .get(table)?
            .iter()
            .filter(|rule| rule.accepts(fields))
            .max_by_key(|rule| (rule.priority().unwrap_or(0), rule.specificity()))
            .cloned()
    }

    pub async fn lookup_ipv4(
        &self,
        table: &str,
        field: &str,
        address: Ipv4Address,
    ) -> Option<TableRule> {
        self.lookup(table, &[(field, FieldValue::from_ipv4(address))])
            .await
    }

    pub async fn set_counter(&self, counter: &str, index: u64, packets: u64, bytes: u64) {
        self.state
            .lock()
            .await
            .counters
            .insert((counter.to_string(), index), (packets, bytes));
    }

    /// Another controller claims mastership with `election_id`.
    ///
    /// If it outranks the current primary, the primary is demoted and told so
    /// on its stream.
    pub async fn set_rival(&self, election_id: ElectionId) {
        let tx = {
            let mut state = self.state.lock().await;
            state.rival = Some(election_id);
            match state.primary {
                Some(current) if election_id > current => {
                    state.primary = None;
                    state.stream_tx.clone()
                }
                _ => None,
            }
        };
        if let Some(tx) = tx {
            let _ = tx
                .send(Ok(StreamEvent::Arbitration {
                    is_primary: false,
                    election_id,
                }))
                .await;
        }
    }

    pub async fn refuse_connections(&self, refuse: bool) {
        self.state.lock().await.faults.refuse_connect = refuse;
    }

    pub async fn fail_close(&self, reason: &str) {
        self.state.lock().await.faults.close_error = Some(reason.to_string());
    }

    pub async fn reject_pipeline(&self, reason: &str) {
        self.state.lock().await.faults.pipeline_error = Some(reason.to_string());
    }

    /// Fails every update whose entity key equals `entity`.
    pub async fn reject_entity(&self, entity: &str, error: TransportError) {
        self.state
            .lock()
            .await
            .faults
            .entry_errors
            .insert(entity.to_string(), error);
    }

    pub async fn set_write_delay(&self, delay: Duration) {
        self.state.lock().await.faults.write_delay = Some(delay);
    }

    async fn push(&self, item: StreamItem) -> bool {
        let tx = self.state.lock().await.stream_tx.clone();
        match tx {
            Some(tx) => tx.send(item).await.is_ok(),
            None => false,
        }
    }

    /// Returns false if no stream is attached.
    pub async fn inject_packet_in(&self, payload: Vec<u8>) -> bool {
        self.push(Ok(StreamEvent::PacketIn { payload })).await
    }

    /// Sends a 20-byte cloned frame carrying `code` after the Ethernet header.
    pub async fn inject_ecn(&self, code: EcnCode) -> bool {
        self.inject_packet_in(cloned_frame(code)).await
    }

    pub async fn inject_digest(&self, digest_id: u32, list_id: u64) -> bool {
        self.push(Ok(StreamEvent::Digest { digest_id, list_id }))
            .await
    }

    pub async fn inject_stream_error(&self, error: TransportError) -> bool {
        self.push(Err(error)).await
    }

    /// Sends a terminal error and hangs up the stream.
    pub async fn end_stream(&self, error: TransportError) -> bool {
        let sent = self.push(Ok(StreamEvent::TerminalError(error))).await;
        self.state.lock().await.stream_tx = None;
        sent
    }
}

/// Frame the dataplane clones to the controller: Ethernet header, code byte, padding.
pub fn cloned_frame(code: EcnCode) -> Vec<u8> {
    let dst = MacAddress::new([0x08, 0x00, 0x00, 0x00, 0x02, 0x22]);
    let src = MacAddress::new([0x08, 0x00, 0x00, 0x00, 0x01, 0x11]);
    let mut frame = Vec::with_capacity(20);
    frame.extend_from_slice(dst.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    debug_assert_eq!(frame.len(), ECN_OFFSET);
    frame.push(code.as_u8());
    frame.resize(20, 0);
    frame
}

struct SimChannel {
    switch: SimulatedSwitch,
}

#[async_trait]
impl SwitchChannel for SimChannel {
    async fn arbitrate(
        &self,
        _device_id: u64,
        election_id: ElectionId,
    ) -> Result<ArbitrationStatus, TransportError> {
        let mut state = self.switch.state.lock().await;
        if !state.connected {
            return Err(TransportError::unavailable("channel closed"));
        }
        state.ops.push(SwitchOp::Arbitrate(election_id));
        match state.rival {
            Some(rival) if rival > election_id => Ok(ArbitrationStatus::Backup { current: rival }),
            _ => {
                state.primary = Some(election_id);
                Ok(ArbitrationStatus::Primary)
            }
        }
    }

    async fn set_pipeline(
        &self,
        _device_id: u64,
        election_id: ElectionId,
        config: &PipelineConfig,
    ) -> Result<(), TransportError> {
        let mut state = self.switch.state.lock().await;
        state.ops.push(SwitchOp::SetPipeline);
        state.check_primary(election_id)?;
        if let Some(reason) = &state.faults.pipeline_error {
            return Err(TransportError::new(RpcCode::InvalidArgument, reason.clone()));
        }
        state.pipeline = Some(config.clone());
        Ok(())
    }

    async fn write(
        &self,
        _device_id: u64,
        election_id: ElectionId,
        updates: &[Update],
    ) -> Result<Vec<UpdateStatus>, TransportError> {
        let delay = self.switch.state.lock().await.faults.write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.switch.state.lock().await;
        for update in updates {
            state.ops.push(SwitchOp::Write {
                kind: update.kind,
                entity: update.entity.describe_key(),
            });
        }
        state.check_primary(election_id)?;
        if state.pipeline.is_none() {
            return Err(TransportError::new(
                RpcCode::FailedPrecondition,
                "no forwarding pipeline installed",
            ));
        }
        Ok(updates.iter().map(|update| state.apply(update)).collect())
    }

    async fn read_table(
        &self,
        _device_id: u64,
        table: Option<&str>,
    ) -> Result<Vec<TableRule>, TransportError> {
        let mut state = self.switch.state.lock().await;
        state.ops.push(SwitchOp::ReadTable(table.map(str::to_string)));
        let wanted = |name: &str| table.map_or(true, |t| t == name);
        let mut rules: Vec<TableRule> = state
            .entries
            .iter()
            .filter(|(name, _)| wanted(name))
            .flat_map(|(_, rules)| rules.iter().cloned())
            .collect();
        rules.extend(
            state
                .defaults
                .iter()
                .filter(|(name, _)| wanted(name))
                .map(|(_, rule)| rule.clone()),
        );
        Ok(rules)
    }

    async fn read_counter(
        &self,
        _device_id: u64,
        counter: &str,
        index: Option<u64>,
    ) -> Result<Vec<CounterEntry>, TransportError> {
        let mut state = self.switch.state.lock().await;
        state.ops.push(SwitchOp::ReadCounter(counter.to_string()));
        if !state.counters.keys().any(|(name, _)| name == counter) {
            return Err(TransportError::new(
                RpcCode::NotFound,
                format!("unknown counter {}", counter),
            ));
        }
        Ok(state
            .counters
            .iter()
            .filter(|((name, i), _)| name == counter && index.map_or(true, |want| *i == want))
            .map(|((name, i), (packets, bytes))| CounterEntry {
                counter: name.clone(),
                index: *i,
                packets: *packets,
                bytes: *bytes,
            })
            .collect())
    }

    async fn open_stream(&self) -> Result<mpsc::Receiver<StreamItem>, TransportError> {
        self.switch
            .state
            .lock()
            .await
            .stream_rx
            .take()
            .ok_or_else(|| TransportError::new(RpcCode::FailedPrecondition, "stream already open"))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.switch.state.lock().await;
        state.ops.push(SwitchOp::Close);
        state.connected = false;
        state.primary = None;
        state.stream_tx = None;
        state.stream_rx = None;
        match &state.faults.close_error {
            Some(reason) => Err(TransportError::new(RpcCode::Internal, reason.clone())),
            None => Ok(()),
        }
    }
}

/// A set of simulated switches reachable by name.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFabric {
    switches: Arc<Mutex<BTreeMap<String, SimulatedSwitch>>>,
}

impl SimulatedFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// One switch per target.
    pub async fn for_targets<'a>(targets: impl IntoIterator<Item = &'a SwitchTarget>) -> Self {
        let fabric = Self::new();
        for target in targets {
            fabric.add(target.clone()).await;
        }
        fabric
    }

    pub async fn add(&self, target: SwitchTarget) -> SimulatedSwitch {
        let switch = SimulatedSwitch::new(target);
        self.switches
            .lock()
            .await
            .insert(switch.target.name.clone(), switch.clone());
        switch
    }

    pub async fn switch(&self, name: &str) -> Option<SimulatedSwitch> {
        self.switches.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl SwitchConnector for SimulatedFabric {
    async fn connect(&self, target: &SwitchTarget) -> Result<Box<dyn SwitchChannel>, TransportError> {
        let switch = self.switch(&target.name).await.ok_or_else(|| {
            TransportError::unavailable(format!("no switch listening on {}", target.address))
        })?;
        {
            let mut state = switch.state.lock().await;
            if state.faults.refuse_connect {
                return Err(TransportError::unavailable("connection refused"));
            }
            let (tx, rx) = mpsc::channel(STREAM_DEPTH);
            state.connected = true;
            state.stream_tx = Some(tx);
            state.stream_rx = Some(rx);
        }
        Ok(Box::new(SimChannel { switch }))
    }
}
