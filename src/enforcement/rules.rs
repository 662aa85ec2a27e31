use std::collections::BTreeMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::filter::hostname_from_url_filter;

/// Enforcement errors
#[derive(Error, Debug)]
pub enum EnforcementError {
    #[error("Rule id {0} is not unique")]
    DuplicateRuleId(u32),

    #[error("Rule backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for enforcement operations
pub type EnforcementResult<T> = Result<T, EnforcementError>;

/// Where a redirect rule sends the navigation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectTarget {
    pub extension_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    Redirect { redirect: RedirectTarget },
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub url_filter: String,
    pub resource_types: Vec<ResourceType>,
}

/// Declarative redirect rule, shaped like a browser dynamic network rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementRule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

impl EnforcementRule {
    /// Hostname this rule's filter targets
    pub fn hostname(&self) -> Option<&str> {
        hostname_from_url_filter(&self.condition.url_filter)
    }
}

/// Platform rule API.
///
/// `update_rules` removes first and then adds, and rejects an add whose id
/// is still in use, like the browser API it stands in for.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    async fn list_rules(&self) -> EnforcementResult<Vec<EnforcementRule>>;

    async fn update_rules(&self, remove_ids: &[u32], add_rules: Vec<EnforcementRule>) -> EnforcementResult<()>;

    fn name(&self) -> &'static str;
}

/// Apply a remove-then-add update to an id keyed rule map
pub(crate) fn apply_update(
    rules: &mut BTreeMap<u32, EnforcementRule>,
    remove_ids: &[u32],
    add_rules: Vec<EnforcementRule>,
) -> EnforcementResult<()> {
    let mut next = rules.clone();
    for id in remove_ids {
        next.remove(id);
    }
    for rule in add_rules {
        if next.contains_key(&rule.id) {
            return Err(EnforcementError::DuplicateRuleId(rule.id));
        }
        next.insert(rule.id, rule);
    }
    *rules = next;
    Ok(())
}

/// In-process rule set
#[derive(Default)]
pub struct MemoryRuleBackend {
    rules: RwLock<BTreeMap<u32, EnforcementRule>>,
}

impl MemoryRuleBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleBackend for MemoryRuleBackend {
    async fn list_rules(&self) -> EnforcementResult<Vec<EnforcementRule>> {
        Ok(self.rules.read().await.values().cloned().collect())
    }

    async fn update_rules(&self, remove_ids: &[u32], add_rules: Vec<EnforcementRule>) -> EnforcementResult<()> {
        let mut rules = self.rules.write().await;
        apply_update(&mut rules, remove_ids, add_rules)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: u32, host: &str) -> EnforcementRule {
        EnforcementRule {
            id,
            priority: 1,
            action: RuleAction::Block,
            condition: RuleCondition {
                url_filter: format!("||{}^", host),
                resource_types: vec![ResourceType::MainFrame],
            },
        }
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_atomically() {
        let backend = MemoryRuleBackend::new();
        backend.update_rules(&[], vec![rule(1, "a.example")]).await.unwrap();

        let err = backend
            .update_rules(&[], vec![rule(2, "b.example"), rule(1, "c.example")])
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::DuplicateRuleId(1)));

        let rules = backend.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].hostname(), Some("a.example"));
    }

    #[test]
    fn serializes_like_a_dynamic_rule() {
        let mut r = rule(5, "ads.example");
        r.action = RuleAction::Redirect {
            redirect: RedirectTarget {
                extension_path: "/blocked.html".to_string(),
            },
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["action"]["type"], "redirect");
        assert_eq!(json["action"]["redirect"]["extensionPath"], "/blocked.html");
        assert_eq!(json["condition"]["urlFilter"], "||ads.example^");
        assert_eq!(json["condition"]["resourceTypes"][0], "main_frame");
    }
}
