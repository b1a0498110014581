//! ECN Triangle Monitor Controller
//!
//! A P4Runtime control plane for a small fabric of programmable switches.
//! It connects to every switch, wins arbitration, pushes the compiled
//! pipeline, installs forwarding, ACL, ECN-threshold and clone-session
//! entries, and then watches the packet-in streams for cloned packets
//! carrying the Congestion Experienced code point.
//!
//! # Architecture
//!
//! ```text
//! [ControllerConfig] ──> [Orchestrator] ──> [RuleInstaller] ──> [SwitchSession] ──> switch
//!                             │                                       │
//!                             └──< [NotificationMonitor] <── packet-in stream
//! ```
//!
//! # Key Components
//!
//! - [`session::SwitchSession`]: one control connection and its mastership state
//! - [`installer::RuleInstaller`]: table entries and clone sessions, with idempotent re-apply
//! - [`monitor::NotificationMonitor`]: per-switch stream readers emitting [`CongestionSignal`]s
//! - [`orchestrator::Orchestrator`]: bring-up, the monitoring tick and shutdown
//! - [`transport`]: the RPC seam; [`sim`] provides an in-process switch behind it
//!
//! The `ecn-monitor` binary runs against [`sim::SimulatedFabric`]. Reaching
//! real switches needs a gRPC-backed [`transport::SwitchConnector`], which
//! this crate does not ship.

pub mod audit;
pub mod clone_session;
pub mod config;
pub mod error;
pub mod installer;
pub mod monitor;
pub mod orchestrator;
pub mod rule;
pub mod session;
pub mod sim;
pub mod transport;

pub use clone_session::{CloneSession, Replica, DEFAULT_CLONE_SESSION_ID, DEFAULT_MONITOR_PORT};
pub use config::ControllerConfig;
pub use error::{ControllerError, DecodeError, EntryFailure, Result};
pub use installer::{AclEntry, AclMatch, EcnThreshold, ForwardingEntry, PipelineNames, RuleInstaller};
pub use monitor::{CongestionSignal, EcnCode, MonitorExit, NotificationMonitor, Subscription};
pub use orchestrator::{
    BringUpReport, Orchestrator, OrchestratorSettings, ShutdownReport, SwitchPlan, TickReport,
    TickReporter,
};
pub use rule::{FieldMatch, Specificity, TableRule, TableRuleBuilder};
pub use session::{SessionOptions, SwitchSession, SwitchTarget};
pub use sim::{SimulatedFabric, SimulatedSwitch};
pub use transport::{
    CounterEntry, ElectionId, Entity, PipelineConfig, RpcCode, StreamEvent, SwitchChannel,
    SwitchConnector, TransportError, Update, UpdateKind,
};
