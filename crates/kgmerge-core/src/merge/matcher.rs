//! Pairwise matching of extracted entity records.

use std::sync::Arc;

use crate::config::{EngineConfig, MatchRule, RuleKind};
use crate::types::{normalize, EntityRecord};

/// Confidence of the name-equality fallback used when a type has no rules.
pub const FALLBACK_NAME_CONFIDENCE: f64 = 0.70;

/// Result of comparing two records.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
    pub is_match: bool,
    /// Confidence of the rule that fired; carried for diagnostics only.
    pub confidence: f64,
    pub reason: String,
}

impl MatchDecision {
    fn matched(confidence: f64, reason: String) -> Self {
        Self {
            is_match: true,
            confidence,
            reason,
        }
    }

    fn no_match(reason: &str) -> Self {
        Self {
            is_match: false,
            confidence: 0.0,
            reason: reason.to_string(),
        }
    }
}

/// Evaluates the configured rules for a pair of records.
#[derive(Debug, Clone)]
pub struct Matcher {
    config: Arc<EngineConfig>,
}

impl Matcher {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Decide whether `a` and `b` denote the same entity.
    ///
    /// Rules are tried in priority order and the first that fires wins. The
    /// decision is symmetric in its arguments.
    pub fn matches(&self, a: &EntityRecord, b: &EntityRecord) -> MatchDecision {
        if a.entity_type != b.entity_type {
            return MatchDecision::no_match("different_types");
        }

        let rules = self.config.rules_for(&a.entity_type);
        if rules.is_empty() {
            return fallback_name_match(a, b);
        }

        for rule in rules {
            let decision = match rule.kind {
                RuleKind::Exact => exact(rule, a, b),
                RuleKind::Search => {
                    if let Err(e) = self.config.check_rule_field(&a.entity_type, rule) {
                        tracing::debug!("{}", e);
                        continue;
                    }
                    search(rule, a, b)
                }
            };
            if let Some(decision) = decision {
                return decision;
            }
        }

        MatchDecision::no_match("no_match")
    }
}

fn scalar(record: &EntityRecord, field: &str) -> Option<String> {
    record
        .field(field)
        .and_then(|v| v.as_text())
        .map(|v| normalize(&v))
        .filter(|v| !v.is_empty())
}

fn list(record: &EntityRecord, field: &str) -> Vec<String> {
    record
        .field(field)
        .and_then(|v| v.as_list().map(|items| items.iter().map(|s| normalize(s)).collect()))
        .unwrap_or_default()
}

fn exact(rule: &MatchRule, a: &EntityRecord, b: &EntityRecord) -> Option<MatchDecision> {
    let left = scalar(a, &rule.source_field)?;
    let right = scalar(b, &rule.source_field)?;
    (left == right).then(|| MatchDecision::matched(rule.confidence, format!("exact_{}", rule.source_field)))
}

fn search(rule: &MatchRule, a: &EntityRecord, b: &EntityRecord) -> Option<MatchDecision> {
    let value_a = scalar(a, &rule.source_field);
    let value_b = scalar(b, &rule.source_field);
    let list_a = list(a, &rule.storage_field);
    let list_b = list(b, &rule.storage_field);

    let a_in_b = value_a.as_ref().is_some_and(|v| list_b.contains(v));
    let b_in_a = value_b.as_ref().is_some_and(|v| list_a.contains(v));
    if a_in_b || b_in_a {
        return Some(MatchDecision::matched(
            rule.confidence,
            format!("search_{}_in_{}", rule.source_field, rule.storage_field),
        ));
    }

    let overlap = list_a
        .iter()
        .any(|v| !v.is_empty() && list_b.contains(v));
    overlap.then(|| MatchDecision::matched(rule.confidence, format!("overlap_{}", rule.storage_field)))
}

fn fallback_name_match(a: &EntityRecord, b: &EntityRecord) -> MatchDecision {
    match (scalar(a, "name"), scalar(b, "name")) {
        (Some(left), Some(right)) if left == right => {
            MatchDecision::matched(FALLBACK_NAME_CONFIDENCE, "basic_name_match".to_string())
        }
        _ => MatchDecision::no_match("no_match"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntitySchema;

    fn person_config() -> Arc<EngineConfig> {
        Arc::new(
            EngineConfig::builder()
                .schema(
                    "Person",
                    EntitySchema::new()
                        .with_field("name", "STRING")
                        .with_field("emails", "STRING[]"),
                )
                .rule("Person", MatchRule::exact("name", 0.95, 1))
                .rule("Person", MatchRule::search("email", "emails", 0.9, 2))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_exact_is_case_insensitive() {
        let matcher = Matcher::new(person_config());
        let a = EntityRecord::new(0, "Person", "Ada Lovelace");
        let b = EntityRecord::new(1, "Person", "  ada lovelace ");
        let decision = matcher.matches(&a, &b);
        assert!(decision.is_match);
        assert_eq!(decision.confidence, 0.95);
        assert_eq!(decision.reason, "exact_name");
    }

    #[test]
    fn test_search_scalar_in_list_both_directions() {
        let matcher = Matcher::new(person_config());
        let a = EntityRecord::new(0, "Person", "J. Smith").with_attribute("email", "J@x.com");
        let b = EntityRecord::new(1, "Person", "John Smith").with_attribute("emails", vec!["j@x.com"]);
        let ab = matcher.matches(&a, &b);
        let ba = matcher.matches(&b, &a);
        assert!(ab.is_match);
        assert_eq!(ab, ba);
        assert_eq!(ab.reason, "search_email_in_emails");
    }

    #[test]
    fn test_search_list_overlap() {
        let matcher = Matcher::new(person_config());
        let a = EntityRecord::new(0, "Person", "J. Smith").with_attribute("emails", vec!["j@x.com"]);
        let b = EntityRecord::new(1, "Person", "John Smith").with_attribute("emails", vec!["other@x.com", "J@X.COM"]);
        let decision = matcher.matches(&a, &b);
        assert!(decision.is_match);
        assert_eq!(decision.reason, "overlap_emails");
    }

    #[test]
    fn test_different_types_never_match() {
        let matcher = Matcher::new(person_config());
        let a = EntityRecord::new(0, "Person", "Apollo");
        let b = EntityRecord::new(1, "Project", "Apollo");
        assert!(!matcher.matches(&a, &b).is_match);
    }

    #[test]
    fn test_search_rule_skipped_without_schema_field() {
        let config = Arc::new(
            EngineConfig::builder()
                .schema("Organization", EntitySchema::new().with_field("name", "STRING"))
                .rule("Organization", MatchRule::search("domain", "domains", 0.9, 1))
                .build()
                .unwrap(),
        );
        let matcher = Matcher::new(config);
        let a = EntityRecord::new(0, "Organization", "Acme").with_attribute("domains", vec!["acme.com"]);
        let b = EntityRecord::new(1, "Organization", "Acme Corp").with_attribute("domains", vec!["acme.com"]);
        assert!(!matcher.matches(&a, &b).is_match);
    }

    #[test]
    fn test_fallback_name_match() {
        let matcher = Matcher::new(Arc::new(EngineConfig::default()));
        let a = EntityRecord::new(0, "Topic", "Rust");
        let b = EntityRecord::new(1, "Topic", "rust ");
        let decision = matcher.matches(&a, &b);
        assert!(decision.is_match);
        assert_eq!(decision.confidence, FALLBACK_NAME_CONFIDENCE);

        let c = EntityRecord::new(2, "Topic", "Go");
        assert!(!matcher.matches(&a, &c).is_match);
    }
}
