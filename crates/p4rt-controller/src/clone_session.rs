//! Packet-replication (clone) sessions.

use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Session id the ECN program clones congested packets into.
pub const DEFAULT_CLONE_SESSION_ID: u32 = 100;

/// Port that delivers cloned packets back to the controller.
pub const DEFAULT_MONITOR_PORT: u32 = 252;

/// One copy of a cloned packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replica {
    pub egress_port: u32,
    pub instance: u32,
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {} instance {}", self.egress_port, self.instance)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawCloneSession {
    session_id: u32,
    replicas: Vec<Replica>,
    #[serde(default)]
    class_of_service: u32,
    #[serde(default)]
    packet_length_bytes: i32,
}

/// A clone session with at least one replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCloneSession")]
pub struct CloneSession {
    session_id: u32,
    replicas: Vec<Replica>,
    class_of_service: u32,
    packet_length_bytes: i32,
}

impl CloneSession {
    pub fn new(session_id: u32, replicas: Vec<Replica>) -> Result<Self> {
        Self::with_options(session_id, replicas, 0, 0)
    }

    /// Builds a session; `packet_length_bytes` of 0 clones whole packets.
    pub fn with_options(
        session_id: u32,
        replicas: Vec<Replica>,
        class_of_service: u32,
        packet_length_bytes: i32,
    ) -> Result<Self> {
        let invalid = |reason: &str| ControllerError::InvalidCloneSession {
            id: session_id,
            reason: reason.to_string(),
        };

        if session_id == 0 {
            return Err(invalid("session id 0 is reserved"));
        }
        if replicas.is_empty() {
            return Err(invalid("at least one replica is required"));
        }
        let mut seen = HashSet::new();
        if !replicas.iter().all(|r| seen.insert((r.egress_port, r.instance))) {
            return Err(invalid("duplicate replica"));
        }
        if packet_length_bytes < 0 {
            return Err(invalid("truncation length cannot be negative"));
        }

        Ok(Self {
            session_id,
            replicas,
            class_of_service,
            packet_length_bytes,
        })
    }

    /// Single replica to `port`, instance 1.
    pub fn monitoring(session_id: u32, port: u32) -> Result<Self> {
        Self::new(
            session_id,
            vec![Replica {
                egress_port: port,
                instance: 1,
            }],
        )
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn class_of_service(&self) -> u32 {
        self.class_of_service
    }

    pub fn packet_length_bytes(&self) -> i32 {
        self.packet_length_bytes
    }

    pub fn describe_key(&self) -> String {
        format!("clone_session[{}]", self.session_id)
    }
}

impl TryFrom<RawCloneSession> for CloneSession {
    type Error = ControllerError;

    fn try_from(raw: RawCloneSession) -> Result<Self> {
        Self::with_options(
            raw.session_id,
            raw.replicas,
            raw.class_of_service,
            raw.packet_length_bytes,
        )
    }
}

impl fmt::Display for CloneSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> ", self.describe_key())?;
        for (i, r) in self.replicas.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}
