//! Pipeline configuration.
//!
//! Every keyword table in the pipeline (elliptical particles, anchor rules,
//! classifier rules, low-confidence phrases) is configuration rather than
//! code: the defaults below cover an office-assistant deployment, but the
//! literal sets are deployment-specific and meant to be replaced wholesale.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::intent::IntentLabel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub session: SessionConfig,
    pub enhancer: EnhancerConfig,
    pub classifier: ClassifierConfig,
    pub retrieval: RetrievalConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Turns kept per session; the oldest is evicted on overflow.
    pub max_history: usize,
    pub session_timeout_hours: i64,
    /// Minimum seconds between opportunistic expiry sweeps.
    pub cleanup_interval_secs: u64,
    /// Turns rendered into the generation context block.
    pub context_turns: usize,
    /// Per-turn response truncation inside the context block.
    pub context_response_chars: usize,
}

/// One entry of the anchor lookup table: if the previous user message
/// contains `anchor` and the current elliptical query contains `cue`,
/// the query is rewritten to `rewrite`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorRule {
    pub anchor: String,
    pub cue: String,
    pub rewrite: String,
    /// Rule-specific confirmation shown to the user; falls back to the
    /// generic "did you mean" template when absent.
    #[serde(default)]
    pub confirmation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancerConfig {
    /// Queries at or below this many characters (trimmed) are incomplete.
    pub max_incomplete_chars: usize,
    /// Elliptical trailing particles ("for", "about", ...).
    pub incomplete_particles: Vec<String>,
    /// Phrases referencing an unstated antecedent ("for the", "about that").
    pub topic_shift_phrases: Vec<String>,
    /// Markers of a follow-up question ("more", "why", "compared to").
    pub follow_up_markers: Vec<String>,
    pub anchors: Vec<AnchorRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keywords: Vec<String>,
    pub label: IntentLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Ordered keyword rules; first match wins.
    pub rules: Vec<KeywordRule>,
    /// Structured identifier pattern for the safety override.
    pub override_id_pattern: String,
    /// Safety-check vocabulary for the override.
    pub safety_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Passages requested from the primary knowledge store.
    pub top_k: usize,
    /// Answers shorter than this fail the quality gate.
    pub min_answer_chars: usize,
    /// Answers containing any of these phrases fail the quality gate.
    pub low_confidence_phrases: Vec<String>,
    /// Token-set Jaccard similarity above which a line is a duplicate.
    pub dedup_threshold: f64,
    /// Lines shorter than this are dropped before deduplication.
    pub min_line_chars: usize,
    /// Cap on deduplicated lines kept from fallback results.
    pub max_lines: usize,
    /// Cap on cited sources appended to a fallback answer.
    pub max_sources: usize,
    /// Timeout applied to each external call (store, search, generation).
    pub call_timeout_secs: u64,
    /// Labels for which fallback search is disabled entirely.
    pub no_fallback_labels: Vec<IntentLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Reports kept per user; the oldest is evicted on overflow.
    pub max_reports: usize,
    /// Responses at or above this length are parsed into a report.
    pub min_report_chars: usize,
    /// Responses containing any of these are parsed regardless of length.
    pub trigger_keywords: Vec<String>,
    pub max_key_findings: usize,
    pub max_actionable_items: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history: 5,
            session_timeout_hours: 24,
            cleanup_interval_secs: 3600,
            context_turns: 3,
            context_response_chars: 200,
        }
    }
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            max_incomplete_chars: 3,
            incomplete_particles: strings(&[
                "for", "and", "about", "then", "what about", "how about", "as for",
            ]),
            topic_shift_phrases: strings(&[
                "for the", "for that", "about the", "about that", "what about", "how about",
            ]),
            follow_up_markers: strings(&[
                "more",
                "why",
                "how",
                "detail",
                "compared to",
                "difference",
                "other",
                "another",
                "example",
                "reason",
                "improve",
                "instead",
            ]),
            anchors: vec![
                AnchorRule {
                    anchor: "Fujifilm".into(),
                    cue: "printer".into(),
                    rewrite: "Fujifilm printer flagship model".into(),
                    confirmation: Some(
                        "Answering for the Fujifilm printer lineup.".into(),
                    ),
                },
                AnchorRule {
                    anchor: "Canon".into(),
                    cue: "printer".into(),
                    rewrite: "Canon printer flagship model".into(),
                    confirmation: Some("Answering for the Canon printer lineup.".into()),
                },
                AnchorRule {
                    anchor: "Kyocera".into(),
                    cue: "copier".into(),
                    rewrite: "Kyocera copier flagship model".into(),
                    confirmation: None,
                },
            ],
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            // Feedback first: short acknowledgments must not be routed to
            // retrieval even when they mention a domain term.
            rules: vec![
                KeywordRule {
                    keywords: strings(&[
                        "thanks",
                        "thank you",
                        "great",
                        "awesome",
                        "helpful",
                        "well done",
                    ]),
                    label: IntentLabel::Feedback,
                },
                KeywordRule {
                    keywords: strings(&[
                        "summarize",
                        "summary",
                        "in short",
                        "briefly",
                        "key points",
                        "tl;dr",
                    ]),
                    label: IntentLabel::Summary,
                },
                KeywordRule {
                    keywords: strings(&["hello", "hi there", "good morning", "how are you"]),
                    label: IntentLabel::GeneralChat,
                },
                KeywordRule {
                    keywords: strings(&[
                        "sales",
                        "revenue target",
                        "quota",
                        "achievement rate",
                        "pipeline",
                        "deals closed",
                    ]),
                    label: IntentLabel::SalesQuery,
                },
                KeywordRule {
                    keywords: strings(&[
                        "expense",
                        "paid leave",
                        "benefits",
                        "attendance",
                        "regulation",
                        "reimbursement",
                        "contact person",
                    ]),
                    label: IntentLabel::Admin,
                },
                KeywordRule {
                    keywords: strings(&[
                        "treatment",
                        "outcome",
                        "case count",
                        "mortality",
                        "complication",
                        "clinical",
                        "research paper",
                    ]),
                    label: IntentLabel::Clinical,
                },
                KeywordRule {
                    keywords: strings(&[
                        "kpi",
                        "productivity",
                        "error rate",
                        "utilization",
                        "wait time",
                        "throughput",
                    ]),
                    label: IntentLabel::PerformanceMetrics,
                },
                KeywordRule {
                    keywords: strings(&["minutes", "save this", "schedule a", "draft an", "send an email"]),
                    label: IntentLabel::Task,
                },
            ],
            override_id_pattern: r"[A-Z]\d{4}-\d{4}".into(),
            safety_terms: strings(&[
                "check",
                "verify",
                "interaction",
                "dosage",
                "contraindication",
                "safe",
                "medication",
                "prescription",
            ]),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_answer_chars: 50,
            low_confidence_phrases: strings(&[
                "not found",
                "no information",
                "no relevant",
                "database not initialized",
                "could not generate",
                "i don't know",
            ]),
            dedup_threshold: 0.8,
            min_line_chars: 20,
            max_lines: 15,
            max_sources: 3,
            call_timeout_secs: 20,
            // Performance metrics are local and time-sensitive; safety checks
            // must never be answered from the open web.
            no_fallback_labels: vec![IntentLabel::PerformanceMetrics, IntentLabel::SafetyCheck],
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            max_reports: 5,
            min_report_chars: 400,
            trigger_keywords: strings(&["analysis report", "## ", "ranking", "breakdown"]),
            max_key_findings: 5,
            max_actionable_items: 10,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            enhancer: EnhancerConfig::default(),
            classifier: ClassifierConfig::default(),
            retrieval: RetrievalConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.session.max_history == 0 {
            return Err("session.max_history must be > 0".into());
        }
        if self.session.session_timeout_hours <= 0 {
            return Err("session.session_timeout_hours must be > 0".into());
        }
        if self.session.context_turns == 0 {
            return Err("session.context_turns must be > 0".into());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.dedup_threshold) {
            return Err("retrieval.dedup_threshold must be in [0.0, 1.0]".into());
        }
        if self.retrieval.max_lines == 0 {
            return Err("retrieval.max_lines must be > 0".into());
        }
        if self.retrieval.call_timeout_secs == 0 {
            return Err("retrieval.call_timeout_secs must be > 0".into());
        }
        if self.report.max_reports == 0 {
            return Err("report.max_reports must be > 0".into());
        }
        if regex::Regex::new(&self.classifier.override_id_pattern).is_err() {
            return Err("classifier.override_id_pattern is not a valid regex".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, validating after parse.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_threshold_is_rejected() {
        let mut config = PipelineConfig::default();
        config.retrieval.dedup_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_override_pattern_is_rejected() {
        let mut config = PipelineConfig::default();
        config.classifier.override_id_pattern = "[unclosed".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session.max_history, config.session.max_history);
        assert_eq!(back.classifier.rules.len(), config.classifier.rules.len());
    }
}
