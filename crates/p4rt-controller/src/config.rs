//! Controller configuration.
//!
//! Loaded from YAML. Every field has a default, and the default switch list
//! is the three-switch triangle: s1, s2 and s3 on consecutive local ports,
//! each with its routes and the monitoring clone session.

use crate::clone_session::{CloneSession, DEFAULT_CLONE_SESSION_ID, DEFAULT_MONITOR_PORT};
use crate::error::{ControllerError, Result};
use crate::info_log;
use crate::installer::{EcnThreshold, ForwardingEntry, PipelineNames, RuleInstaller};
use crate::orchestrator::{OrchestratorSettings, SwitchPlan};
use crate::session::{SessionOptions, SwitchTarget};
use crate::transport::ElectionId;
use p4rt_types::{FieldValue, Ipv4Address, Ipv4Prefix, MacAddress};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Monitoring tick
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on each individual RPC
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_election_id")]
    pub election_id: ElectionId,

    /// Congestion signals buffered per switch between ticks
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default)]
    pub names: PipelineNames,

    #[serde(default = "default_switches")]
    pub switches: Vec<SwitchPlan>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_election_id() -> ElectionId {
    ElectionId::new(0, 1)
}

fn default_queue_depth() -> usize {
    64
}

fn route(a: u8, b: u8, c: u8, d: u8, len: u8, mac: [u8; 6], port: u32) -> ForwardingEntry {
    ForwardingEntry::new(
        Ipv4Prefix::truncated(Ipv4Address::new(a, b, c, d), len),
        MacAddress::new(mac),
        port,
    )
}

fn triangle_switch(index: u64, forwarding: Vec<ForwardingEntry>) -> SwitchPlan {
    let name = format!("s{}", index + 1);
    let target = SwitchTarget::new(&name, format!("127.0.0.1:{}", 50051 + index), index)
        .with_dump_path(format!("logs/{}-p4runtime-requests.txt", name));
    let mut plan = SwitchPlan::new(target);
    plan.forwarding = forwarding;
    plan.clone_sessions = CloneSession::monitoring(DEFAULT_CLONE_SESSION_ID, DEFAULT_MONITOR_PORT)
        .into_iter()
        .collect();
    plan
}

fn default_switches() -> Vec<SwitchPlan> {
    vec![
        triangle_switch(
            0,
            vec![
                route(10, 0, 1, 1, 32, [0x08, 0, 0, 0, 0x01, 0x01], 2),
                route(10, 0, 1, 11, 32, [0x08, 0, 0, 0, 0x01, 0x11], 1),
                route(10, 0, 2, 0, 24, [0x08, 0, 0, 0, 0x02, 0x00], 3),
                route(10, 0, 3, 0, 24, [0x08, 0, 0, 0, 0x03, 0x00], 4),
            ],
        ),
        triangle_switch(
            1,
            vec![
                route(10, 0, 2, 2, 32, [0x08, 0, 0, 0, 0x02, 0x02], 2),
                route(10, 0, 2, 22, 32, [0x08, 0, 0, 0, 0x02, 0x22], 1),
                route(10, 0, 1, 0, 24, [0x08, 0, 0, 0, 0x01, 0x00], 3),
                route(10, 0, 3, 0, 24, [0x08, 0, 0, 0, 0x03, 0x00], 4),
            ],
        ),
        triangle_switch(
            2,
            vec![
                route(10, 0, 3, 3, 32, [0x08, 0, 0, 0, 0x03, 0x03], 1),
                route(10, 0, 1, 0, 24, [0x08, 0, 0, 0, 0x01, 0x00], 2),
                route(10, 0, 2, 0, 24, [0x08, 0, 0, 0, 0x02, 0x00], 3),
            ],
        ),
    ]
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            election_id: default_election_id(),
            queue_depth: default_queue_depth(),
            names: PipelineNames::default(),
            switches: default_switches(),
        }
    }
}

impl ControllerConfig {
    /// Loads and validates a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ControllerError::InvalidConfig(format!(
                "failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match Self::load(path) {
            Err(ControllerError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info_log!("ControllerConfig", path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            election_id: self.election_id,
            rpc_timeout: self.rpc_timeout(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            session: self.session_options(),
            poll_interval: self.poll_interval(),
            queue_depth: self.queue_depth,
            names: self.names.clone(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ControllerError::InvalidConfig(msg));

        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be > 0".to_string());
        }
        if self.rpc_timeout_ms == 0 {
            return invalid("rpc_timeout_ms must be > 0".to_string());
        }
        if self.queue_depth == 0 {
            return invalid("queue_depth must be > 0".to_string());
        }
        for (name, width) in [
            ("port_bitwidth", self.names.port_bitwidth),
            ("ecn_bitwidth", self.names.ecn_bitwidth),
        ] {
            if width == 0 || width > p4rt_types::MAX_BITWIDTH {
                return invalid(format!("{} must be 1-64, got {}", name, width));
            }
        }
        if self.switches.is_empty() {
            return invalid("at least one switch is required".to_string());
        }

        let mut names = HashSet::new();
        let mut device_ids = HashSet::new();
        for plan in &self.switches {
            let target = &plan.target;
            if target.name.is_empty() {
                return invalid("switch name cannot be empty".to_string());
            }
            if !names.insert(target.name.as_str()) {
                return invalid(format!("duplicate switch name {}", target.name));
            }
            if !device_ids.insert(target.device_id) {
                return invalid(format!("duplicate device id {}", target.device_id));
            }
            let port_ok = target
                .address
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !port_ok {
                return invalid(format!(
                    "switch {}: address {:?} is not host:port",
                    target.name, target.address
                ));
            }
            for entry in &plan.forwarding {
                if FieldValue::new(u64::from(entry.port), self.names.port_bitwidth).is_err() {
                    return invalid(format!(
                        "switch {}: port {} does not fit in {} bits",
                        target.name, entry.port, self.names.port_bitwidth
                    ));
                }
            }
            if let Some(threshold) = plan.ecn_threshold {
                EcnThreshold::new(threshold, self.names.ecn_bitwidth)?;
            }
        }

        let installer = RuleInstaller::new(self.names.clone());
        for plan in &self.switches {
            installer.acl_rules(&plan.acl)?;
        }
        Ok(())
    }
}
