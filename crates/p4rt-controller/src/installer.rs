//! Rule installation.
//!
//! [`RuleInstaller`] turns forwarding routes, ACL entries, the ECN threshold
//! and clone sessions into writes on a [`SwitchSession`]. It remembers what
//! it issued per switch: re-applying an identical rule is skipped and a
//! changed action on an existing key becomes a MODIFY. Write failures are
//! returned to the caller as-is and never retried.

use crate::clone_session::{CloneSession, Replica};
use crate::error::{ControllerError, Result};
use crate::rule::{ActionParam, RuleKey, Specificity, TableRule};
use crate::session::SwitchSession;
use crate::transport::{Entity, Update, UpdateKind};
use crate::{debug_log, info_log};
use p4rt_types::{FieldValue, Ipv4Address, Ipv4Prefix, MacAddress};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tokio::sync::Mutex;

const SOURCE: &str = "RuleInstaller";

/// Names of the pipeline objects the installer writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineNames {
    pub lpm_table: String,
    pub lpm_field: String,
    pub forward_action: String,
    pub dst_mac_param: String,
    pub port_param: String,
    pub port_bitwidth: u32,
    pub ecn_table: String,
    pub ecn_action: String,
    pub ecn_param: String,
    pub ecn_bitwidth: u32,
    pub acl_table: String,
}

impl Default for PipelineNames {
    fn default() -> Self {
        Self {
            lpm_table: "MyIngress.ipv4_lpm".to_string(),
            lpm_field: "hdr.ipv4.dstAddr".to_string(),
            forward_action: "MyIngress.ipv4_forward".to_string(),
            dst_mac_param: "dstAddr".to_string(),
            port_param: "port".to_string(),
            port_bitwidth: 9,
            ecn_table: "MyEgress.check_ecn".to_string(),
            ecn_action: "MyEgress.mark_ecn".to_string(),
            ecn_param: "ecn_threshold".to_string(),
            ecn_bitwidth: 19,
            acl_table: "MyIngress.acl".to_string(),
        }
    }
}

/// One route: destination prefix, next-hop MAC and egress port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingEntry {
    pub prefix: Ipv4Prefix,
    pub next_hop: MacAddress,
    pub port: u32,
}

impl ForwardingEntry {
    pub fn new(prefix: Ipv4Prefix, next_hop: MacAddress, port: u32) -> Self {
        Self {
            prefix,
            next_hop,
            port,
        }
    }
}

/// Ternary match on one ACL key field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclMatch {
    pub field: String,
    pub value: FieldValue,
    pub mask: FieldValue,
}

impl AclMatch {
    pub fn new(field: impl Into<String>, value: FieldValue, mask: FieldValue) -> Self {
        Self {
            field: field.into(),
            value,
            mask,
        }
    }

    /// Exact IPv4 address, all 32 bits compared.
    pub fn ipv4_host(field: impl Into<String>, address: Ipv4Address) -> Self {
        Self::new(
            field,
            FieldValue::from_ipv4(address),
            FieldValue::from_ipv4(Ipv4Address::from_u32(u32::MAX)),
        )
    }

    /// Exact L4 port, all 16 bits compared.
    pub fn l4_port(field: impl Into<String>, port: u16) -> Self {
        Self::new(field, FieldValue::from_u16(port), FieldValue::from_u16(u16::MAX))
    }
}

/// One ACL rule with its explicit priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub matches: Vec<AclMatch>,
    pub action: String,
    #[serde(default)]
    pub params: Vec<ActionParam>,
    pub priority: i32,
}

/// Queue-depth threshold above which the dataplane marks ECN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EcnThreshold(u64);

impl EcnThreshold {
    /// Range-checks `value` against a parameter of `bitwidth` bits.
    pub fn new(value: u64, bitwidth: u32) -> Result<Self> {
        FieldValue::new(value, bitwidth).map_err(|e| ControllerError::InvalidThreshold {
            input: value.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(value))
    }

    /// Parses an unsigned decimal integer; anything else is rejected.
    pub fn parse(input: &str, bitwidth: u32) -> Result<Self> {
        let threshold: EcnThreshold = input.parse()?;
        Self::new(threshold.0, bitwidth).map_err(|e| match e {
            ControllerError::InvalidThreshold { reason, .. } => ControllerError::InvalidThreshold {
                input: input.to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl FromStr for EcnThreshold {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ControllerError::InvalidThreshold {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty input"));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("expected an unsigned decimal integer"));
        }
        trimmed
            .parse::<u64>()
            .map(EcnThreshold)
            .map_err(|_| invalid("value too large"))
    }
}

impl fmt::Display for EcnThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct SwitchCache {
    rules: HashMap<RuleKey, TableRule>,
    clone_sessions: BTreeMap<u32, CloneSession>,
}

/// Builds and writes rules, remembering what each switch was given.
#[derive(Debug, Default)]
pub struct RuleInstaller {
    names: PipelineNames,
    cache: Mutex<HashMap<String, SwitchCache>>,
}

impl RuleInstaller {
    pub fn new(names: PipelineNames) -> Self {
        Self {
            names,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn names(&self) -> &PipelineNames {
        &self.names
    }

    /// Builds the LPM rule for one route.
    pub fn forwarding_rule(&self, entry: &ForwardingEntry) -> Result<TableRule> {
        let port = FieldValue::new(u64::from(entry.port), self.names.port_bitwidth)
            .map_err(|e| ControllerError::invalid_rule(&self.names.lpm_table, e.to_string()))?;
        TableRule::builder(&self.names.lpm_table)
            .lpm(&self.names.lpm_field, entry.prefix)
            .action(&self.names.forward_action)
            .param(&self.names.dst_mac_param, FieldValue::from_mac(entry.next_hop))
            .param(&self.names.port_param, port)
            .build()
    }

    /// Builds the default rule carrying `threshold`.
    pub fn ecn_rule(&self, threshold: EcnThreshold) -> Result<TableRule> {
        let value = FieldValue::new(threshold.value(), self.names.ecn_bitwidth).map_err(|e| {
            ControllerError::InvalidThreshold {
                input: threshold.to_string(),
                reason: e.to_string(),
            }
        })?;
        TableRule::default_action(&self.names.ecn_table)
            .action(&self.names.ecn_action)
            .param(&self.names.ecn_param, value)
            .build()
    }

    /// Builds ACL rules with effective priorities.
    ///
    /// Entries are ranked by explicit priority, then by specificity (fully
    /// masked keys first, then compared bits), and
    /// renumbered densely from 1 so the switch's priority order alone
    /// reproduces the tie-break. Overlapping entries that tie on both are
    /// rejected.
    pub fn acl_rules(&self, entries: &[AclEntry]) -> Result<Vec<TableRule>> {
        let rules = entries
            .iter()
            .map(|entry| {
                let mut builder = TableRule::builder(&self.names.acl_table)
                    .action(&entry.action)
                    .priority(entry.priority);
                for m in &entry.matches {
                    builder = builder.ternary(&m.field, m.value, m.mask);
                }
                for p in &entry.params {
                    builder = builder.param(&p.name, p.value);
                }
                builder.build()
            })
            .collect::<Result<Vec<_>>>()?;

        for (i, a) in rules.iter().enumerate() {
            for (j, b) in rules.iter().enumerate().skip(i + 1) {
                if a.priority() == b.priority()
                    && a.specificity() == b.specificity()
                    && a.overlaps(b)
                {
                    return Err(ControllerError::AmbiguousAcl {
                        first: i,
                        second: j,
                        priority: entries[i].priority,
                    });
                }
            }
        }

        let mut ranks: Vec<(i32, Specificity)> = rules
            .iter()
            .map(|r| (r.priority().unwrap_or(0), r.specificity()))
            .collect();
        ranks.sort_unstable();
        ranks.dedup();

        rules
            .iter()
            .map(|rule| {
                let rank = (rule.priority().unwrap_or(0), rule.specificity());
                let effective = ranks.binary_search(&rank).unwrap_or(0) + 1;
                let effective = i32::try_from(effective).map_err(|_| {
                    ControllerError::invalid_rule(rule.table(), "too many ACL entries")
                })?;
                rule.with_priority(effective)
            })
            .collect()
    }

    /// Installs one LPM rule per route.
    ///
    /// Routes already installed unchanged are skipped; the switch picks the
    /// longest matching prefix regardless of write order.
    pub async fn apply_forwarding_table(
        &self,
        session: &SwitchSession,
        entries: &[ForwardingEntry],
    ) -> Result<Vec<Update>> {
        let rules = entries
            .iter()
            .map(|entry| self.forwarding_rule(entry))
            .collect::<Result<Vec<_>>>()?;
        let mut seen = HashSet::new();
        for entry in entries {
            if !seen.insert(entry.prefix) {
                return Err(ControllerError::invalid_rule(
                    &self.names.lpm_table,
                    format!("duplicate route for {}", entry.prefix),
                ));
            }
        }
        self.sync_rules(session, &self.names.lpm_table, rules, false)
            .await
    }

    /// Replaces the ACL table contents with `entries`.
    ///
    /// Installed ACL rules no longer wanted are deleted first.
    pub async fn apply_acl_rules(
        &self,
        session: &SwitchSession,
        entries: &[AclEntry],
    ) -> Result<Vec<Update>> {
        let rules = self.acl_rules(entries)?;
        self.sync_rules(session, &self.names.acl_table, rules, true)
            .await
    }

    /// Writes the ECN default rule. Always a MODIFY: the default entry exists
    /// on every table, so the last value written is the only one active.
    pub async fn apply_ecn_threshold(
        &self,
        session: &SwitchSession,
        threshold: EcnThreshold,
    ) -> Result<Option<Update>> {
        let rule = self.ecn_rule(threshold)?;
        let key = rule.key();
        if self.cached_rule(session.name(), &key).await.as_ref() == Some(&rule) {
            debug_log!(SOURCE, switch = %session.name(), threshold = %threshold, "ECN threshold unchanged");
            return Ok(None);
        }

        let update = Update::modify(Entity::Table(rule.clone()));
        session.write_entries(vec![update.clone()]).await?;
        self.cache
            .lock()
            .await
            .entry(session.name().to_string())
            .or_default()
            .rules
            .insert(key, rule);
        info_log!(SOURCE, switch = %session.name(), threshold = %threshold, "ECN threshold set");
        Ok(Some(update))
    }

    /// Creates or updates a clone session towards the monitoring port.
    pub async fn apply_clone_session(
        &self,
        session: &SwitchSession,
        id: u32,
        replicas: Vec<Replica>,
    ) -> Result<Option<Update>> {
        let clone = CloneSession::new(id, replicas)?;
        self.install_clone_session(session, clone).await
    }

    pub async fn install_clone_session(
        &self,
        session: &SwitchSession,
        clone: CloneSession,
    ) -> Result<Option<Update>> {
        let id = clone.session_id();
        let kind = {
            let cache = self.cache.lock().await;
            match cache
                .get(session.name())
                .and_then(|c| c.clone_sessions.get(&id))
            {
                Some(existing) if *existing == clone => {
                    debug_log!(SOURCE, switch = %session.name(), session_id = id, "Clone session unchanged");
                    return Ok(None);
                }
                Some(_) => UpdateKind::Modify,
                None => UpdateKind::Insert,
            }
        };

        let update = Update {
            kind,
            entity: Entity::CloneSession(clone.clone()),
        };
        session.write_entries(vec![update.clone()]).await?;
        self.cache
            .lock()
            .await
            .entry(session.name().to_string())
            .or_default()
            .clone_sessions
            .insert(id, clone);
        info_log!(SOURCE, switch = %session.name(), session_id = id, "Clone session installed");
        Ok(Some(update))
    }

    /// Drops everything remembered for `switch`.
    pub async fn forget(&self, switch: &str) {
        self.cache.lock().await.remove(switch);
    }

    async fn remember(&self, switch: &str, updates: &[Update], failed: &HashSet<usize>) {
        let mut cache = self.cache.lock().await;
        let rules = &mut cache.entry(switch.to_string()).or_default().rules;
        for (index, update) in updates.iter().enumerate() {
            if failed.contains(&index) {
                continue;
            }
            if let Entity::Table(rule) = &update.entity {
                match update.kind {
                    UpdateKind::Delete => {
                        rules.remove(&rule.key());
                    }
                    UpdateKind::Insert | UpdateKind::Modify => {
                        rules.insert(rule.key(), rule.clone());
                    }
                }
            }
        }
    }

    async fn cached_rule(&self, switch: &str, key: &RuleKey) -> Option<TableRule> {
        self.cache
            .lock()
            .await
            .get(switch)
            .and_then(|c| c.rules.get(key).cloned())
    }

    async fn sync_rules(
        &self,
        session: &SwitchSession,
        table: &str,
        desired: Vec<TableRule>,
        prune: bool,
    ) -> Result<Vec<Update>> {
        let updates = {
            let cache = self.cache.lock().await;
            let installed = cache.get(session.name()).map(|c| &c.rules);
            let wanted: HashSet<RuleKey> = desired.iter().map(TableRule::key).collect();

            let mut updates = Vec::new();
            if prune {
                if let Some(installed) = installed {
                    let mut stale: Vec<&TableRule> = installed
                        .values()
                        .filter(|r| r.table() == table && !wanted.contains(&r.key()))
                        .collect();
                    stale.sort_by_key(|r| r.describe_key());
                    updates.extend(stale.into_iter().map(|r| Update::delete(Entity::Table(r.clone()))));
                }
            }
            for rule in desired {
                match installed.and_then(|i| i.get(&rule.key())) {
                    Some(existing) if *existing == rule => {}
                    Some(_) => updates.push(Update::modify(Entity::Table(rule))),
                    None => updates.push(Update::insert(Entity::Table(rule))),
                }
            }
            updates
        };

        if updates.is_empty() {
            debug_log!(SOURCE, switch = %session.name(), table, "Table already up to date");
            return Ok(updates);
        }

        if let Err(e) = session.write_entries(updates.clone()).await {
            let failed: HashSet<usize> = e.entry_failures().iter().map(|f| f.index).collect();
            if !failed.is_empty() {
                self.remember(session.name(), &updates, &failed).await;
            }
            return Err(e);
        }
        self.remember(session.name(), &updates, &HashSet::new())
            .await;
        for update in &updates {
            info_log!(SOURCE, switch = %session.name(), "{}", update);
        }
        Ok(updates)
    }
}
