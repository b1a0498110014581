//! Table rules: typed match keys, actions and parameters.
//!
//! A [`TableRule`] is a write request for one entry of a P4 table. Match
//! fields are a closed set of variants (exact, longest-prefix, ternary) and
//! every rule is validated when it is built, so malformed keys are rejected
//! before anything reaches a switch.

use crate::error::{ControllerError, Result};
use p4rt_types::{FieldValue, Ipv4Prefix};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// How specific a rule's key is.
///
/// A rule whose fields are all fully masked outranks any rule with a
/// partial mask; after that, more compared bits rank higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Specificity {
    pub full_masks: bool,
    pub bits: u32,
}

/// Match value for one key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldMatch {
    /// Every bit must match.
    Exact { value: FieldValue },
    /// The top `prefix_len` bits must match.
    Lpm { value: FieldValue, prefix_len: u32 },
    /// Bits set in `mask` must match.
    Ternary { value: FieldValue, mask: FieldValue },
}

impl FieldMatch {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Exact { .. } => "exact",
            Self::Lpm { .. } => "lpm",
            Self::Ternary { .. } => "ternary",
        }
    }

    pub fn value(&self) -> FieldValue {
        match self {
            Self::Exact { value } | Self::Lpm { value, .. } | Self::Ternary { value, .. } => *value,
        }
    }

    /// The bits this match actually compares.
    pub fn effective_mask(&self) -> FieldValue {
        match self {
            Self::Exact { value } => {
                FieldValue::all_ones(value.bitwidth()).unwrap_or(*value)
            }
            Self::Lpm { value, prefix_len } => {
                FieldValue::prefix_mask(*prefix_len, value.bitwidth()).unwrap_or(*value)
            }
            Self::Ternary { mask, .. } => *mask,
        }
    }

    /// Number of compared bits.
    pub fn specificity(&self) -> u32 {
        self.effective_mask().count_ones()
    }

    /// Returns true if every bit of the field is compared.
    pub fn is_full_mask(&self) -> bool {
        self.effective_mask().is_all_ones()
    }

    /// Returns true if `candidate` satisfies this match.
    pub fn accepts(&self, candidate: FieldValue) -> bool {
        let mask = self.effective_mask();
        candidate.masked(&mask).value() == self.value().masked(&mask).value()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Exact { .. } => Ok(()),
            Self::Lpm { value, prefix_len } => {
                let mask = FieldValue::prefix_mask(*prefix_len, value.bitwidth())
                    .map_err(|e| format!("prefix length {}: {}", prefix_len, e))?;
                if !value.is_covered_by(&mask) {
                    return Err(format!("{}/{} has host bits set", value, prefix_len));
                }
                Ok(())
            }
            Self::Ternary { value, mask } => {
                if value.bitwidth() != mask.bitwidth() {
                    return Err(format!(
                        "mask width {} differs from value width {}",
                        mask.bitwidth(),
                        value.bitwidth()
                    ));
                }
                if mask.is_zero() {
                    return Err("all-zero ternary mask; omit the field instead".to_string());
                }
                if !value.is_covered_by(mask) {
                    return Err(format!("value {} has bits outside mask {}", value, mask));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for FieldMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact { value } => write!(f, "{}", value),
            Self::Lpm { value, prefix_len } => write!(f, "{}/{}", value, prefix_len),
            Self::Ternary { value, mask } => write!(f, "{} &&& {}", value, mask),
        }
    }
}

/// A named key field with its match value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchField {
    pub name: String,
    pub matcher: FieldMatch,
}

/// A named action parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionParam {
    pub name: String,
    pub value: FieldValue,
}

impl ActionParam {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Identity of a table entry on the switch: table, key and priority.
///
/// Two rules with the same key address the same entry; they may differ only
/// in action and parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub table: String,
    pub matches: Vec<MatchField>,
    pub priority: Option<i32>,
    pub is_default: bool,
}

/// A declarative write request for one table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRule {
    table: String,
    matches: Vec<MatchField>,
    action: String,
    params: Vec<ActionParam>,
    priority: Option<i32>,
    is_default: bool,
}

impl TableRule {
    /// Starts a keyed entry for `table`.
    pub fn builder(table: impl Into<String>) -> TableRuleBuilder {
        TableRuleBuilder::new(table.into(), false)
    }

    /// Starts the default (miss) action of `table`.
    pub fn default_action(table: impl Into<String>) -> TableRuleBuilder {
        TableRuleBuilder::new(table.into(), true)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn matches(&self) -> &[MatchField] {
        &self.matches
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn params(&self) -> &[ActionParam] {
        &self.params
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            table: self.table.clone(),
            matches: self.matches.clone(),
            priority: self.priority,
            is_default: self.is_default,
        }
    }

    /// Returns a copy with a different priority, revalidated.
    pub fn with_priority(&self, priority: i32) -> Result<TableRule> {
        let mut rule = self.clone();
        rule.priority = Some(priority);
        rule.validate()?;
        Ok(rule)
    }

    /// Returns true if both rules would apply the same action with the same parameters.
    pub fn same_action(&self, other: &TableRule) -> bool {
        self.action == other.action && self.params == other.params
    }

    /// Tie-break rank among rules of equal priority.
    pub fn specificity(&self) -> Specificity {
        Specificity {
            full_masks: self.matches.iter().all(|m| m.matcher.is_full_mask()),
            bits: self.matches.iter().map(|m| m.matcher.specificity()).sum(),
        }
    }

    /// Returns true if some packet could match both rules.
    ///
    /// A field present in only one rule is a wildcard for the other.
    pub fn overlaps(&self, other: &TableRule) -> bool {
        if self.table != other.table {
            return false;
        }
        self.matches.iter().all(|mine| {
            match other.matches.iter().find(|theirs| theirs.name == mine.name) {
                None => true,
                Some(theirs) => {
                    let common = mine
                        .matcher
                        .effective_mask()
                        .masked(&theirs.matcher.effective_mask());
                    mine.matcher.value().masked(&common).value()
                        == theirs.matcher.value().masked(&common).value()
                }
            }
        })
    }

    /// Returns true if a packet carrying `fields` would hit this rule.
    pub fn accepts(&self, fields: &[(&str, FieldValue)]) -> bool {
        !self.is_default
            && self.matches.iter().all(|m| {
                fields
                    .iter()
                    .find(|(name, _)| *name == m.name)
                    .is_some_and(|(_, value)| m.matcher.accepts(*value))
            })
    }

    /// Short identity used in logs and per-entry error reports.
    pub fn describe_key(&self) -> String {
        if self.is_default {
            return format!("{}[default]", self.table);
        }
        let fields = self
            .matches
            .iter()
            .map(|m| format!("{}={}", m.name, m.matcher))
            .collect::<Vec<_>>()
            .join(",");
        match self.priority {
            Some(p) => format!("{}[{}@{}]", self.table, fields, p),
            None => format!("{}[{}]", self.table, fields),
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ControllerError::invalid_rule(&self.table, reason);

        if self.table.is_empty() {
            return Err(invalid("table name is empty".to_string()));
        }
        if self.action.is_empty() {
            return Err(invalid("action name is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for m in &self.matches {
            if !seen.insert(m.name.as_str()) {
                return Err(invalid(format!("duplicate match field {}", m.name)));
            }
            m.matcher
                .validate()
                .map_err(|e| invalid(format!("field {}: {}", m.name, e)))?;
        }

        let mut seen = HashSet::new();
        for p in &self.params {
            if !seen.insert(p.name.as_str()) {
                return Err(invalid(format!("duplicate action parameter {}", p.name)));
            }
        }

        let has_ternary = self
            .matches
            .iter()
            .any(|m| matches!(m.matcher, FieldMatch::Ternary { .. }));

        if self.is_default {
            if !self.matches.is_empty() {
                return Err(invalid("default action cannot carry match fields".to_string()));
            }
            if self.priority.is_some() {
                return Err(invalid("default action cannot carry a priority".to_string()));
            }
            return Ok(());
        }

        if self.matches.is_empty() {
            return Err(invalid("keyed entry needs at least one match field".to_string()));
        }
        match (has_ternary, self.priority) {
            (true, None) => Err(invalid("ternary match requires a priority".to_string())),
            (true, Some(p)) if p <= 0 => Err(invalid(format!("priority {} must be positive", p))),
            (false, Some(_)) => Err(invalid(
                "priority is only meaningful for ternary tables".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for TableRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}(", self.describe_key(), self.action)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", p.name, p.value)?;
        }
        write!(f, ")")
    }
}

/// Builder that validates a [`TableRule`] on [`build`](TableRuleBuilder::build).
#[derive(Debug, Clone)]
pub struct TableRuleBuilder {
    rule: TableRule,
}

impl TableRuleBuilder {
    fn new(table: String, is_default: bool) -> Self {
        Self {
            rule: TableRule {
                table,
                matches: Vec::new(),
                action: String::new(),
                params: Vec::new(),
                priority: None,
                is_default,
            },
        }
    }

    pub fn field(mut self, name: impl Into<String>, matcher: FieldMatch) -> Self {
        self.rule.matches.push(MatchField {
            name: name.into(),
            matcher,
        });
        self
    }

    pub fn exact(self, name: impl Into<String>, value: FieldValue) -> Self {
        self.field(name, FieldMatch::Exact { value })
    }

    pub fn lpm(self, name: impl Into<String>, prefix: Ipv4Prefix) -> Self {
        self.field(
            name,
            FieldMatch::Lpm {
                value: FieldValue::from_ipv4(prefix.network()),
                prefix_len: u32::from(prefix.prefix_len()),
            },
        )
    }

    pub fn ternary(self, name: impl Into<String>, value: FieldValue, mask: FieldValue) -> Self {
        self.field(name, FieldMatch::Ternary { value, mask })
    }

    pub fn action(mut self, name: impl Into<String>) -> Self {
        self.rule.action = name.into();
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.rule.params.push(ActionParam::new(name, value));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.rule.priority = Some(priority);
        self
    }

    pub fn build(self) -> Result<TableRule> {
        self.rule.validate()?;
        Ok(self.rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p4rt_types::Ipv4Address;
    use pretty_assertions::assert_eq;

    fn lpm_rule(prefix: &str, port: u64) -> TableRule {
        TableRule::builder("MyIngress.ipv4_lpm")
            .lpm("hdr.ipv4.dstAddr", prefix.parse().unwrap())
            .action("MyIngress.ipv4_forward")
            .param("port", FieldValue::new(port, 9).unwrap())
            .build()
            .unwrap()
    }

    fn acl_rule(field: &str, value: FieldValue, mask: FieldValue, priority: i32) -> TableRule {
        TableRule::builder("MyIngress.acl")
            .ternary(field, value, mask)
            .action("MyIngress.drop")
            .priority(priority)
            .build()
            .unwrap()
    }

    #[test]
    fn test_lpm_rule_display() {
        let rule = lpm_rule("10.0.2.0/24", 3);
        assert_eq!(
            rule.to_string(),
            "MyIngress.ipv4_lpm[hdr.ipv4.dstAddr=0x0a000200/24] -> MyIngress.ipv4_forward(port=0x0003)"
        );
        assert_eq!(
            rule.specificity(),
            Specificity {
                full_masks: false,
                bits: 24
            }
        );
    }

    #[test]
    fn test_default_action_rules() {
        let rule = TableRule::default_action("MyEgress.check_ecn")
            .action("MyEgress.mark_ecn")
            .param("ecn_threshold", FieldValue::new(10, 19).unwrap())
            .build()
            .unwrap();
        assert!(rule.is_default());
        assert_eq!(rule.describe_key(), "MyEgress.check_ecn[default]");

        let with_key = TableRule::default_action("MyEgress.check_ecn")
            .exact("meta.x", FieldValue::new(1, 8).unwrap())
            .action("MyEgress.mark_ecn")
            .build();
        assert!(matches!(with_key, Err(ControllerError::InvalidRule { .. })));
    }

    #[test]
    fn test_validation_failures() {
        let host_bits = TableRule::builder("t")
            .field(
                "f",
                FieldMatch::Lpm {
                    value: FieldValue::from_ipv4(Ipv4Address::new(10, 0, 0, 1)),
                    prefix_len: 24,
                },
            )
            .action("a")
            .build();
        assert!(host_bits.is_err());

        let no_priority = TableRule::builder("t")
            .ternary(
                "f",
                FieldValue::new(80, 16).unwrap(),
                FieldValue::all_ones(16).unwrap(),
            )
            .action("a")
            .build();
        assert!(no_priority.is_err());

        let zero_mask = TableRule::builder("t")
            .ternary("f", FieldValue::new(0, 16).unwrap(), FieldValue::new(0, 16).unwrap())
            .action("a")
            .priority(1)
            .build();
        assert!(zero_mask.is_err());

        let duplicate = TableRule::builder("t")
            .exact("f", FieldValue::new(1, 8).unwrap())
            .exact("f", FieldValue::new(2, 8).unwrap())
            .action("a")
            .build();
        assert!(duplicate.is_err());

        let no_action = TableRule::builder("t")
            .exact("f", FieldValue::new(1, 8).unwrap())
            .build();
        assert!(no_action.is_err());

        let exact_with_priority = TableRule::builder("t")
            .exact("f", FieldValue::new(1, 8).unwrap())
            .action("a")
            .priority(3)
            .build();
        assert!(exact_with_priority.is_err());
    }

    #[test]
    fn test_overlap_on_different_fields() {
        let udp = acl_rule(
            "hdr.udp.dstPort",
            FieldValue::new(80, 16).unwrap(),
            FieldValue::all_ones(16).unwrap(),
            1,
        );
        let dst = acl_rule(
            "hdr.ipv4.dstAddr",
            FieldValue::from_ipv4(Ipv4Address::new(10, 0, 1, 4)),
            FieldValue::all_ones(32).unwrap(),
            1,
        );
        assert!(udp.overlaps(&dst));
        assert_eq!(udp.specificity().bits, 16);
        assert_eq!(dst.specificity().bits, 32);
        assert!(udp.specificity().full_masks);
        assert!(udp.specificity() < dst.specificity());
    }

    #[test]
    fn test_full_mask_outranks_wider_partial_mask() {
        let port = acl_rule(
            "hdr.udp.dstPort",
            FieldValue::new(80, 16).unwrap(),
            FieldValue::all_ones(16).unwrap(),
            5,
        );
        let net = acl_rule(
            "hdr.ipv4.dstAddr",
            FieldValue::from_ipv4(Ipv4Address::new(10, 0, 1, 0)),
            FieldValue::prefix_mask(24, 32).unwrap(),
            5,
        );
        assert!(port.specificity().bits < net.specificity().bits);
        assert!(port.specificity() > net.specificity());
    }

    #[test]
    fn test_overlap_on_same_field() {
        let mask = FieldValue::prefix_mask(24, 32).unwrap();
        let net = acl_rule(
            "hdr.ipv4.dstAddr",
            FieldValue::from_ipv4(Ipv4Address::new(10, 0, 1, 0)),
            mask,
            1,
        );
        let inside = acl_rule(
            "hdr.ipv4.dstAddr",
            FieldValue::from_ipv4(Ipv4Address::new(10, 0, 1, 4)),
            FieldValue::all_ones(32).unwrap(),
            1,
        );
        let outside = acl_rule(
            "hdr.ipv4.dstAddr",
            FieldValue::from_ipv4(Ipv4Address::new(10, 0, 2, 4)),
            FieldValue::all_ones(32).unwrap(),
            1,
        );
        assert!(net.overlaps(&inside));
        assert!(!net.overlaps(&outside));
        assert!(!inside.overlaps(&outside));
    }

    #[test]
    fn test_accepts() {
        let rule = lpm_rule("10.0.0.0/24", 1);
        let hit = FieldValue::from_ipv4(Ipv4Address::new(10, 0, 0, 5));
        let miss = FieldValue::from_ipv4(Ipv4Address::new(10, 0, 1, 5));
        assert!(rule.accepts(&[("hdr.ipv4.dstAddr", hit)]));
        assert!(!rule.accepts(&[("hdr.ipv4.dstAddr", miss)]));
        assert!(!rule.accepts(&[("hdr.udp.dstPort", hit)]));
    }

    #[test]
    fn test_key_ignores_action() {
        let a = lpm_rule("10.0.3.0/24", 4);
        let b = lpm_rule("10.0.3.0/24", 2);
        assert_eq!(a.key(), b.key());
        assert!(!a.same_action(&b));
    }

    #[test]
    fn test_with_priority_revalidates() {
        let rule = acl_rule(
            "hdr.udp.dstPort",
            FieldValue::new(80, 16).unwrap(),
            FieldValue::all_ones(16).unwrap(),
            1,
        );
        assert_eq!(rule.with_priority(7).unwrap().priority(), Some(7));
        assert!(rule.with_priority(0).is_err());
    }
}
