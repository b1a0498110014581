//! The RPC seam between sessions and switches.
//!
//! A [`SwitchConnector`] opens one [`SwitchChannel`] per switch. Everything
//! above this module speaks in typed rules and clone sessions; wire encoding
//! and name-to-id resolution belong to the channel implementation.

use crate::clone_session::CloneSession;
use crate::error::{ControllerError, Result};
use crate::rule::TableRule;
use crate::session::SwitchTarget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

/// Canonical RPC status codes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl RpcCode {
    /// Creates an RpcCode from a raw status value.
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => RpcCode::Ok,
            1 => RpcCode::Cancelled,
            3 => RpcCode::InvalidArgument,
            4 => RpcCode::DeadlineExceeded,
            5 => RpcCode::NotFound,
            6 => RpcCode::AlreadyExists,
            7 => RpcCode::PermissionDenied,
            8 => RpcCode::ResourceExhausted,
            9 => RpcCode::FailedPrecondition,
            10 => RpcCode::Aborted,
            11 => RpcCode::OutOfRange,
            12 => RpcCode::Unimplemented,
            13 => RpcCode::Internal,
            14 => RpcCode::Unavailable,
            15 => RpcCode::DataLoss,
            16 => RpcCode::Unauthenticated,
            _ => RpcCode::Unknown,
        }
    }

    pub fn as_raw(&self) -> i32 {
        *self as i32
    }

    pub fn is_ok(&self) -> bool {
        *self == RpcCode::Ok
    }

    /// Returns true if the same call may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcCode::Unavailable
                | RpcCode::DeadlineExceeded
                | RpcCode::Aborted
                | RpcCode::ResourceExhausted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcCode::Ok => "OK",
            RpcCode::Cancelled => "CANCELLED",
            RpcCode::Unknown => "UNKNOWN",
            RpcCode::InvalidArgument => "INVALID_ARGUMENT",
            RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcCode::NotFound => "NOT_FOUND",
            RpcCode::AlreadyExists => "ALREADY_EXISTS",
            RpcCode::PermissionDenied => "PERMISSION_DENIED",
            RpcCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            RpcCode::FailedPrecondition => "FAILED_PRECONDITION",
            RpcCode::Aborted => "ABORTED",
            RpcCode::OutOfRange => "OUT_OF_RANGE",
            RpcCode::Unimplemented => "UNIMPLEMENTED",
            RpcCode::Internal => "INTERNAL",
            RpcCode::Unavailable => "UNAVAILABLE",
            RpcCode::DataLoss => "DATA_LOSS",
            RpcCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed RPC, or one failed update inside a write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: RpcCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(RpcCode::DeadlineExceeded, "call timed out")
    }
}

/// Election identifier used for mastership; the higher value wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ElectionId {
    pub high: u64,
    pub low: u64,
}

impl ElectionId {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    pub fn as_u128(&self) -> u128 {
        (u128::from(self.high) << 64) | u128::from(self.low)
    }
}

impl From<u64> for ElectionId {
    fn from(low: u64) -> Self {
        Self { high: 0, low }
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u128())
    }
}

/// Outcome of an arbitration update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationStatus {
    Primary,
    /// Another controller holds mastership with `current`.
    Backup { current: ElectionId },
}

/// The forwarding pipeline pushed to a switch at bring-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Protocol-metadata descriptor, kept opaque.
    pub p4info: String,
    /// Dataplane program image.
    pub device_config: Vec<u8>,
}

impl PipelineConfig {
    pub fn new(p4info: impl Into<String>, device_config: Vec<u8>) -> Self {
        Self {
            p4info: p4info.into(),
            device_config,
        }
    }

    /// Reads both pipeline artifacts from disk.
    pub fn load(p4info_path: &Path, device_config_path: &Path) -> Result<Self> {
        let p4info = std::fs::read_to_string(p4info_path)?;
        if p4info.trim().is_empty() {
            return Err(ControllerError::InvalidConfig(format!(
                "{}: p4info file is empty",
                p4info_path.display()
            )));
        }
        let device_config = std::fs::read(device_config_path)?;
        if device_config.is_empty() {
            return Err(ControllerError::InvalidConfig(format!(
                "{}: device config file is empty",
                device_config_path.display()
            )));
        }
        Ok(Self {
            p4info,
            device_config,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.p4info.trim().is_empty() || self.device_config.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Insert,
    Modify,
    Delete,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::Insert => write!(f, "INSERT"),
            UpdateKind::Modify => write!(f, "MODIFY"),
            UpdateKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Anything a write can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Table(TableRule),
    CloneSession(CloneSession),
}

impl Entity {
    pub fn describe_key(&self) -> String {
        match self {
            Entity::Table(rule) => rule.describe_key(),
            Entity::CloneSession(session) => session.describe_key(),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Table(rule) => write!(f, "{}", rule),
            Entity::CloneSession(session) => write!(f, "{}", session),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub kind: UpdateKind,
    pub entity: Entity,
}

impl Update {
    pub fn insert(entity: Entity) -> Self {
        Self {
            kind: UpdateKind::Insert,
            entity,
        }
    }

    pub fn modify(entity: Entity) -> Self {
        Self {
            kind: UpdateKind::Modify,
            entity,
        }
    }

    pub fn delete(entity: Entity) -> Self {
        Self {
            kind: UpdateKind::Delete,
            entity,
        }
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.entity)
    }
}

/// Per-update result of a write, in submission order.
pub type UpdateStatus = std::result::Result<(), TransportError>;

/// One cell of an indirect counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterEntry {
    pub counter: String,
    pub index: u64,
    pub packets: u64,
    pub bytes: u64,
}

impl fmt::Display for CounterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]: {} packets ({} bytes)",
            self.counter, self.index, self.packets, self.bytes
        )
    }
}

/// A message pushed by the switch on the notification stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Arbitration {
        is_primary: bool,
        election_id: ElectionId,
    },
    PacketIn {
        payload: Vec<u8>,
    },
    Digest {
        digest_id: u32,
        list_id: u64,
    },
    /// The switch is ending the stream.
    TerminalError(TransportError),
}

/// A stream read: an event, or a transient read failure.
pub type StreamItem = std::result::Result<StreamEvent, TransportError>;

/// Opens channels to switches.
#[async_trait]
pub trait SwitchConnector: Send + Sync {
    async fn connect(
        &self,
        target: &SwitchTarget,
    ) -> std::result::Result<Box<dyn SwitchChannel>, TransportError>;
}

/// One established channel to one switch.
#[async_trait]
pub trait SwitchChannel: Send + Sync {
    async fn arbitrate(
        &self,
        device_id: u64,
        election_id: ElectionId,
    ) -> std::result::Result<ArbitrationStatus, TransportError>;

    async fn set_pipeline(
        &self,
        device_id: u64,
        election_id: ElectionId,
        config: &PipelineConfig,
    ) -> std::result::Result<(), TransportError>;

    /// Returns one status per update, in submission order.
    async fn write(
        &self,
        device_id: u64,
        election_id: ElectionId,
        updates: &[Update],
    ) -> std::result::Result<Vec<UpdateStatus>, TransportError>;

    /// Reads installed entries of one table, or of every table.
    async fn read_table(
        &self,
        device_id: u64,
        table: Option<&str>,
    ) -> std::result::Result<Vec<TableRule>, TransportError>;

    /// Reads one counter cell, or every cell when `index` is `None`.
    async fn read_counter(
        &self,
        device_id: u64,
        counter: &str,
        index: Option<u64>,
    ) -> std::result::Result<Vec<CounterEntry>, TransportError>;

    /// Hands over the inbound stream. Can only be taken once.
    async fn open_stream(&self) -> std::result::Result<mpsc::Receiver<StreamItem>, TransportError>;

    async fn close(&self) -> std::result::Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rpc_code_from_raw() {
        assert_eq!(RpcCode::from_raw(0), RpcCode::Ok);
        assert_eq!(RpcCode::from_raw(6), RpcCode::AlreadyExists);
        assert_eq!(RpcCode::from_raw(2), RpcCode::Unknown);
        assert_eq!(RpcCode::from_raw(99), RpcCode::Unknown);
        assert_eq!(RpcCode::AlreadyExists.as_raw(), 6);
        assert!(RpcCode::Ok.is_ok());
    }

    #[test]
    fn test_rpc_code_retryable() {
        assert!(RpcCode::Unavailable.is_retryable());
        assert!(RpcCode::DeadlineExceeded.is_retryable());
        assert!(!RpcCode::InvalidArgument.is_retryable());
        assert!(!RpcCode::PermissionDenied.is_retryable());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new(RpcCode::NotFound, "no such entry");
        assert_eq!(err.to_string(), "NOT_FOUND: no such entry");
    }

    #[test]
    fn test_election_id_ordering() {
        assert!(ElectionId::new(0, 2) > ElectionId::from(1));
        assert!(ElectionId::new(1, 0) > ElectionId::new(0, u64::MAX));
        assert_eq!(ElectionId::new(1, 1).as_u128(), (1u128 << 64) + 1);
        assert_eq!(ElectionId::from(7).to_string(), "7");
    }

    #[test]
    fn test_pipeline_config_load() {
        let dir = tempfile::tempdir().unwrap();
        let p4info = dir.path().join("ecn.p4.p4info.txt");
        let json = dir.path().join("ecn.json");
        std::fs::write(&p4info, "pkg_info {}\n").unwrap();
        std::fs::write(&json, b"{\"program\": \"ecn.p4\"}").unwrap();

        let config = PipelineConfig::load(&p4info, &json).unwrap();
        assert_eq!(config.p4info, "pkg_info {}\n");
        assert!(!config.is_empty());

        std::fs::write(&json, b"").unwrap();
        assert!(matches!(
            PipelineConfig::load(&p4info, &json),
            Err(ControllerError::InvalidConfig(_))
        ));

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            PipelineConfig::load(&p4info, &missing),
            Err(ControllerError::Io(_))
        ));
    }
}
