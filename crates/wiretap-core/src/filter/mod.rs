//! Transaction filtering
//!
//! Runs after the correlator has built a complete transaction and before the
//! publisher sees it. Protocol allow/deny lists are checked first, then the
//! field rules in order; the first matching rule decides. Anything not
//! matched is kept.

pub mod condition;

pub use condition::{Condition, ConditionOp, FieldPath, FieldValue, Patterns};

use crate::config::FilterSettings;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// What a matching rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Drop,
    Keep,
}

/// A field rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    /// Optional label used in debug logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub action: RuleAction,

    pub when: Condition,
}

impl FilterRule {
    pub fn drop(when: Condition) -> Self {
        Self {
            name: None,
            action: RuleAction::Drop,
            when,
        }
    }

    pub fn keep(when: Condition) -> Self {
        Self {
            name: None,
            action: RuleAction::Keep,
            when,
        }
    }

    /// Check that the rule's condition is well formed
    pub fn validate(&self) -> Result<(), String> {
        self.when.compile(&mut Patterns::default())
    }
}

/// Filter decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Keep,
    Drop,
}

/// Compiled filter
#[derive(Debug, Default)]
pub struct FilterEngine {
    include: HashSet<String>,
    exclude: HashSet<String>,
    rules: Vec<FilterRule>,
    patterns: Patterns,
}

impl FilterEngine {
    pub fn new(settings: &FilterSettings) -> Result<Self, String> {
        let mut patterns = Patterns::default();
        for rule in &settings.rules {
            rule.when.compile(&mut patterns)?;
        }

        Ok(Self {
            include: settings
                .include_protocols
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            exclude: settings
                .drop_protocols
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            rules: settings.rules.clone(),
            patterns,
        })
    }

    /// A filter that keeps everything
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, tx: &Transaction) -> FilterVerdict {
        let protocol = tx.protocol.to_lowercase();
        if !self.include.is_empty() && !self.include.contains(&protocol) {
            return FilterVerdict::Drop;
        }
        if self.exclude.contains(&protocol) {
            return FilterVerdict::Drop;
        }
        if self.rules.is_empty() {
            return FilterVerdict::Keep;
        }

        let doc = tx.to_document();
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.when.evaluate(&doc, &self.patterns) {
                debug!(
                    rule = rule.name.as_deref().unwrap_or(""),
                    index = idx,
                    action = ?rule.action,
                    tx = %tx.id,
                    "Filter rule matched"
                );
                return match rule.action {
                    RuleAction::Drop => FilterVerdict::Drop,
                    RuleAction::Keep => FilterVerdict::Keep,
                };
            }
        }

        FilterVerdict::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageKind};
    use crate::packet::{Direction, Transport};
    use crate::transaction::FlowInfo;
    use std::net::SocketAddr;

    fn tx(protocol: &str, path: &str) -> Transaction {
        let flow = FlowInfo {
            flow_id: 1,
            transport: Transport::Tcp,
            client: "10.0.0.1:40000".parse::<SocketAddr>().unwrap().into(),
            server: "10.0.0.2:80".parse::<SocketAddr>().unwrap().into(),
        };
        let mut req = Message::new(protocol, MessageKind::Request, Direction::ToServer, 10);
        req.set("path", path);
        let resp = Message::new(protocol, MessageKind::Response, Direction::ToClient, 20);
        Transaction::from_pair(&flow, req, resp)
    }

    #[test]
    fn test_default_keeps_everything() {
        let engine = FilterEngine::allow_all();
        assert_eq!(engine.evaluate(&tx("http", "/")), FilterVerdict::Keep);
        assert_eq!(engine.evaluate(&tx("dns", "")), FilterVerdict::Keep);
    }

    #[test]
    fn test_drop_protocol_leaves_others() {
        let engine = FilterEngine::new(&FilterSettings {
            drop_protocols: vec!["DNS".into()],
            ..Default::default()
        })
        .unwrap();

        let verdicts: Vec<_> = ["dns", "http", "dns", "thrift", "tls"]
            .iter()
            .map(|p| engine.evaluate(&tx(p, "/")))
            .collect();
        assert_eq!(
            verdicts,
            vec![
                FilterVerdict::Drop,
                FilterVerdict::Keep,
                FilterVerdict::Drop,
                FilterVerdict::Keep,
                FilterVerdict::Keep
            ]
        );
    }

    #[test]
    fn test_include_list() {
        let engine = FilterEngine::new(&FilterSettings {
            include_protocols: vec!["http".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(engine.evaluate(&tx("http", "/")), FilterVerdict::Keep);
        assert_eq!(engine.evaluate(&tx("thrift", "/")), FilterVerdict::Drop);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let settings = FilterSettings {
            rules: vec![
                FilterRule::keep(Condition::equals("request.path", "/health/deep")),
                FilterRule::drop(Condition::simple(
                    "request.path",
                    ConditionOp::StartsWith,
                    "/health",
                )),
            ],
            ..Default::default()
        };
        let engine = FilterEngine::new(&settings).unwrap();
        assert_eq!(engine.evaluate(&tx("http", "/health/deep")), FilterVerdict::Keep);
        assert_eq!(engine.evaluate(&tx("http", "/healthz")), FilterVerdict::Drop);
        assert_eq!(engine.evaluate(&tx("http", "/api")), FilterVerdict::Keep);
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let settings = FilterSettings {
            rules: vec![FilterRule::drop(Condition::simple(
                "request.path",
                ConditionOp::Matches,
                "[",
            ))],
            ..Default::default()
        };
        assert!(FilterEngine::new(&settings).is_err());
        assert!(settings.rules[0].validate().is_err());
    }
}
