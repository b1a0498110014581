//! Error types for the controller.
//!
//! Every failure a caller can observe maps onto one [`ControllerError`]
//! variant. Bring-up failures (connection, arbitration, pipeline) abort only
//! the affected switch; write failures carry the index and identity of each
//! rejected entry; stream and decode failures are consumed by the monitor.

use std::fmt;
use thiserror::Error;

/// One rejected entry of a (possibly batched) write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    /// Position of the entry in the submitted batch
    pub index: usize,
    /// Human-readable identity of the entity (table + key, or clone session id)
    pub entity: String,
    /// Reason reported by the switch or by the transport
    pub reason: String,
}

impl EntryFailure {
    pub fn new(index: usize, entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            index,
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.index, self.entity, self.reason)
    }
}

fn format_failures(failures: &[EntryFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Malformed packet-in payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload too short: {len} bytes, need at least {required}")]
    Truncated { len: usize, required: usize },

    #[error("congestion code byte {0:#04x} outside 0-3")]
    UnknownCode(u8),
}

/// Errors that can occur while driving switches.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The transport to the switch could not be established
    #[error("switch {switch} ({address}) unreachable: {reason}")]
    Connection {
        switch: String,
        address: String,
        reason: String,
    },

    /// Mastership is not held (never acquired, lost, or a higher election id won)
    #[error("switch {switch}: mastership not held: {reason}")]
    Arbitration { switch: String, reason: String },

    /// Forwarding pipeline push rejected
    #[error("switch {switch}: pipeline config rejected: {reason}")]
    Config { switch: String, reason: String },

    /// One or more entries of a write were rejected
    #[error(
        "switch {switch}: {} of {total} write(s) rejected: {}",
        .failures.len(),
        format_failures(.failures)
    )]
    Write {
        switch: String,
        total: usize,
        failures: Vec<EntryFailure>,
    },

    /// Transient stream read failure; the reader keeps going
    #[error("switch {switch}: transient stream error: {reason}")]
    Stream { switch: String, reason: String },

    /// The notification stream ended with an unrecoverable error
    #[error("switch {switch}: stream terminated: {reason}")]
    StreamTerminal { switch: String, reason: String },

    /// Table or counter read-back failed
    #[error("switch {switch}: read failed: {reason}")]
    Read { switch: String, reason: String },

    /// Releasing the channel failed; the session is still considered closed
    #[error("switch {switch}: close failed: {reason}")]
    Close { switch: String, reason: String },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid rule for table {table}: {reason}")]
    InvalidRule { table: String, reason: String },

    #[error("invalid clone session {id}: {reason}")]
    InvalidCloneSession { id: u32, reason: String },

    #[error(
        "ambiguous ACL: entries {first} and {second} overlap with equal priority {priority} and equal mask specificity"
    )]
    AmbiguousAcl {
        first: usize,
        second: usize,
        priority: i32,
    },

    #[error("invalid ECN threshold {input:?}: {reason}")]
    InvalidThreshold { input: String, reason: String },

    #[error("configuration error: {0}")]
    InvalidConfig(String),

    #[error("switch {0}: session closed")]
    SessionClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    pub fn invalid_rule(table: impl Into<String>, reason: impl Into<String>) -> Self {
        ControllerError::InvalidRule {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors the monitor swallows and retries past.
    pub fn is_transient(&self) -> bool {
        matches!(self, ControllerError::Stream { .. } | ControllerError::Decode(_))
    }

    /// Returns true for errors that abort a single switch's bring-up.
    pub fn is_bring_up_error(&self) -> bool {
        matches!(
            self,
            ControllerError::Connection { .. }
                | ControllerError::Arbitration { .. }
                | ControllerError::Config { .. }
        )
    }

    /// Returns the per-entry failures of a write error.
    pub fn entry_failures(&self) -> &[EntryFailure] {
        match self {
            ControllerError::Write { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
