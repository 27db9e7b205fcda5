//! Intent classification contract and the rule-table implementation.
//!
//! The taxonomy is closed: every classifier must return exactly one label.
//! Implementations may be rule-based (the `RuleClassifier` shipped here) or
//! delegate to an external text-understanding capability, but the safety
//! override is evaluated at the routing seam before any classifier runs, so
//! identifier+keyword combinations can never be misrouted by a fuzzy model.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;

/// Closed intent taxonomy used to route queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    Admin,
    SalesQuery,
    Clinical,
    PerformanceMetrics,
    Task,
    Summary,
    Feedback,
    GeneralChat,
    SafetyCheck,
    Unknown,
}

impl IntentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentLabel::Admin => "admin",
            IntentLabel::SalesQuery => "sales_query",
            IntentLabel::Clinical => "clinical",
            IntentLabel::PerformanceMetrics => "performance_metrics",
            IntentLabel::Task => "task",
            IntentLabel::Summary => "summary",
            IntentLabel::Feedback => "feedback",
            IntentLabel::GeneralChat => "general_chat",
            IntentLabel::SafetyCheck => "safety_check",
            IntentLabel::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for IntentLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A total function from query text to one label.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> IntentLabel;
}

/// Short-circuit rule for safety-critical queries.
///
/// Fires when the text contains a structured identifier matching `id_pattern`
/// AND at least one term from the safety-check vocabulary.
pub struct OverrideRule {
    id_pattern: Regex,
    safety_terms: Vec<String>,
}

impl OverrideRule {
    pub fn new(id_pattern: &str, safety_terms: Vec<String>) -> Result<Self> {
        let id_pattern = Regex::new(id_pattern)
            .with_context(|| format!("invalid override id pattern: {id_pattern}"))?;
        Ok(Self {
            id_pattern,
            safety_terms: safety_terms.iter().map(|t| t.to_lowercase()).collect(),
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        if !self.id_pattern.is_match(text) {
            return false;
        }
        let lower = text.to_lowercase();
        self.safety_terms.iter().any(|term| lower.contains(term))
    }
}

/// Classify with the safety override evaluated first.
///
/// This is the only entry point the pipeline uses, so the override holds for
/// any `IntentClassifier` implementation plugged in behind it.
pub fn classify_with_override(
    override_rule: &OverrideRule,
    classifier: &dyn IntentClassifier,
    text: &str,
) -> IntentLabel {
    if override_rule.matches(text) {
        tracing::info!(text_len = text.len(), "safety override fired");
        return IntentLabel::SafetyCheck;
    }
    classifier.classify(text)
}

/// Keyword-table classifier. The table is configuration, so classifier
/// variants are data rather than code forks.
pub struct RuleClassifier {
    rules: Vec<(Vec<String>, IntentLabel)>,
}

impl RuleClassifier {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let keywords = rule
                    .keywords
                    .iter()
                    .map(|k| k.to_lowercase())
                    .collect::<Vec<_>>();
                (keywords, rule.label)
            })
            .collect();
        Self { rules }
    }
}

impl IntentClassifier for RuleClassifier {
    fn classify(&self, text: &str) -> IntentLabel {
        let lower = text.to_lowercase();
        for (keywords, label) in &self.rules {
            if keywords.iter().any(|k| lower.contains(k.as_str())) {
                tracing::debug!(label = %label, "rule classifier matched");
                return *label;
            }
        }
        IntentLabel::Unknown
    }
}
