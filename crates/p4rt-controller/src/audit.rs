//! Structured logging and audit records.
//!
//! Diagnostics go through `tracing`. The `*_log!` macros tag every event with
//! the component that emitted it. State-changing operations on a switch
//! (mastership, pipeline push, writes, clone sessions, shutdown) additionally
//! emit an [`AuditRecord`] under the `audit` target, serialized to JSON so the
//! record survives both pretty and JSON output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of switch state an audited action touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Channel setup and teardown
    Session,
    /// Mastership acquisition and loss
    Arbitration,
    /// Forwarding pipeline push
    PipelineConfig,
    /// Table entry insert/modify/delete
    TableWrite,
    /// Packet-replication session writes
    CloneSession,
    /// Controller start, partial bring-up and shutdown
    Lifecycle,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::Session => write!(f, "SESSION"),
            AuditCategory::Arbitration => write!(f, "ARBITRATION"),
            AuditCategory::PipelineConfig => write!(f, "PIPELINE_CONFIG"),
            AuditCategory::TableWrite => write!(f, "TABLE_WRITE"),
            AuditCategory::CloneSession => write!(f, "CLONE_SESSION"),
            AuditCategory::Lifecycle => write!(f, "LIFECYCLE"),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
    /// Refused because mastership was not held
    Denied,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
            AuditOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// One audited action against a switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component that performed the action
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,
    /// Switch name, table key or clone session id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// e.g. "switch", "table_entry", "clone_session"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Creates a record stamped now; the outcome starts as `InProgress`.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the error message and marks the outcome as `Failure`.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Debug-level event tagged with its source component.
///
/// ```ignore
/// debug_log!("SwitchSession", switch = %name, "message");
/// ```
#[macro_export]
macro_rules! debug_log {
    ($source:expr, $($arg:tt)*) => {
        tracing::debug!(
            source = $source,
            $($arg)*
        )
    };
}

#[macro_export]
macro_rules! info_log {
    ($source:expr, $($arg:tt)*) => {
        tracing::info!(
            source = $source,
            $($arg)*
        )
    };
}

#[macro_export]
macro_rules! warn_log {
    ($source:expr, $($arg:tt)*) => {
        tracing::warn!(
            source = $source,
            $($arg)*
        )
    };
}

#[macro_export]
macro_rules! error_log {
    ($source:expr, $($arg:tt)*) => {
        tracing::error!(
            source = $source,
            $($arg)*
        )
    };
}

/// Emits an [`AuditRecord`] under the `audit` target.
///
/// Success is logged at info, in-progress at debug, failures and denials at
/// warn.
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::InProgress => {
                tracing::debug!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure | $crate::audit::AuditOutcome::Denied => {
                tracing::warn!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides `log_level` when set. With `json` the output is one
/// JSON object per line, otherwise a human-readable format. Calling this
/// more than once leaves the first subscriber in place.
pub fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!("logging already initialized: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_audit_record_creation() {
        let record = AuditRecord::new(AuditCategory::TableWrite, "RuleInstaller", "insert")
            .with_outcome(AuditOutcome::Success)
            .with_object_id("MyIngress.ipv4_lpm[hdr.ipv4.dstAddr=0x0a000101/32]")
            .with_object_type("table_entry");

        assert_eq!(record.category, AuditCategory::TableWrite);
        assert_eq!(record.source, "RuleInstaller");
        assert_eq!(record.action, "insert");
        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.object_type, Some("table_entry".to_string()));
    }

    #[test]
    fn test_audit_record_with_error() {
        let record = AuditRecord::new(AuditCategory::Arbitration, "SwitchSession", "become_master")
            .with_error("election id 5 outranks 1");

        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error, Some("election id 5 outranks 1".to_string()));
    }

    #[test]
    fn test_audit_record_json_serialization() {
        let record = AuditRecord::new(AuditCategory::CloneSession, "RuleInstaller", "insert")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "session_id": 100,
                "replicas": 1
            }));

        let json = record.to_json();
        assert!(json.contains("CLONE_SESSION"));
        assert!(json.contains("RuleInstaller"));
        assert!(json.contains("\"session_id\":100"));
        assert!(!json.contains("object_id"));
    }

    #[test]
    fn test_display() {
        assert_eq!(AuditCategory::PipelineConfig.to_string(), "PIPELINE_CONFIG");
        assert_eq!(AuditCategory::Lifecycle.to_string(), "LIFECYCLE");
        assert_eq!(AuditOutcome::Denied.to_string(), "denied");
        assert_eq!(AuditOutcome::InProgress.to_string(), "in_progress");
    }
}
