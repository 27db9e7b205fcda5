//! Structured reports: parsing long-form answers into queryable records and
//! answering later "rank N" / "top K" / section follow-ups against them.
//!
//! Reports live in a per-user bounded map (max `report.max_reports`, oldest
//! evicted by creation order) independent of the session history length.

pub mod parser;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use crate::config::ReportConfig;

pub const NO_REPORTS_MESSAGE: &str =
    "There are no stored reports yet. Ask for an analysis first, then I can answer follow-ups about it.";
pub const NOT_IN_REPORT_MESSAGE: &str =
    "I could not find that in your latest report. Try asking about a rank, a figure, or a section title.";

/// Which extraction template produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    General,
    Financial,
    Clinical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericMention {
    pub value: String,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    pub title: String,
    pub content: String,
    pub bullet_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedItem {
    pub rank: u32,
    pub title: String,
    pub description: String,
    pub numeric_mentions: Vec<NumericMention>,
}

/// Ranked item from the financial template, with its named impact figure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialItem {
    pub rank: u32,
    pub title: String,
    pub impact: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NumericData {
    pub financial: Vec<NumericMention>,
    pub percentages: Vec<NumericMention>,
    pub counts: Vec<NumericMention>,
    pub outcomes: Vec<NumericMention>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredReport {
    /// Monotonic per store; later reports always compare greater.
    pub report_id: u64,
    pub report_type: ReportType,
    pub created_at: DateTime<Utc>,
    pub sections: Vec<ReportSection>,
    pub ranked_items: Vec<RankedItem>,
    pub financial_breakdown: Vec<FinancialItem>,
    pub numeric_data: NumericData,
    pub key_findings: Vec<String>,
    pub actionable_items: Vec<String>,
}

static RANK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rank\s*(\d+)|(\d+)\s*(?:st|nd|rd|th)\b").expect("rank regex is valid")
});
static TOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)top\s*(\d+)").expect("top regex is valid"));

const CURRENCY_WORDS: &[&str] = &["amount", "cost", "price", "revenue", "yen", "dollar", "financial", "impact"];
const PERCENT_WORDS: &[&str] = &["percent", "percentage", "%", "rate", "ratio"];

const SECTION_STOPWORDS: &[&str] = &[
    "what", "which", "was", "were", "the", "did", "does", "about", "section", "report", "tell",
    "show",
];

pub struct ReportStore {
    reports: DashMap<String, VecDeque<StructuredReport>>,
    next_id: AtomicU64,
    config: ReportConfig,
}

impl ReportStore {
    pub fn new(config: ReportConfig) -> Self {
        Self {
            reports: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// True when a response is long or report-like enough to capture.
    pub fn should_capture(&self, response: &str) -> bool {
        if response.chars().count() >= self.config.min_report_chars {
            return true;
        }
        let lower = response.to_lowercase();
        self.config
            .trigger_keywords
            .iter()
            .any(|k| lower.contains(&k.to_lowercase()))
    }

    /// Parse and store a response for later structured lookups.
    pub fn capture(&self, user_id: &str, response: &str) -> u64 {
        let report_type = ReportType::detect(response);
        let report = parser::parse(response, report_type, &self.config);
        self.store(user_id, report)
    }

    /// Insert a report, assigning its ID. Evicts the oldest when the per-user
    /// cap is exceeded.
    pub fn store(&self, user_id: &str, mut report: StructuredReport) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        report.report_id = id;

        let mut entry = self.reports.entry(user_id.to_string()).or_default();
        entry.push_back(report);
        while entry.len() > self.config.max_reports {
            entry.pop_front();
        }
        tracing::debug!(user_id, report_id = id, stored = entry.len(), "report stored");
        id
    }

    pub fn has_reports(&self, user_id: &str) -> bool {
        self.reports
            .get(user_id)
            .map(|r| !r.is_empty())
            .unwrap_or(false)
    }

    /// The most recently created report for a user, by `report_id` ordering.
    pub fn latest(&self, user_id: &str) -> Option<StructuredReport> {
        self.reports
            .get(user_id)
            .and_then(|r| r.iter().max_by_key(|rep| rep.report_id).cloned())
    }

    #[cfg(test)]
    pub(crate) fn report_ids(&self, user_id: &str) -> Vec<u64> {
        self.reports
            .get(user_id)
            .map(|r| r.iter().map(|rep| rep.report_id).collect())
            .unwrap_or_default()
    }

    /// Resolve the latest report and answer a structured follow-up against
    /// it. Total: misses degrade to fixed messages.
    pub fn query_latest(&self, user_id: &str, question: &str) -> String {
        match self.latest(user_id) {
            Some(report) => {
                query(&report, question).unwrap_or_else(|| NOT_IN_REPORT_MESSAGE.to_string())
            }
            None => NO_REPORTS_MESSAGE.to_string(),
        }
    }
}

/// Answer a structured question against one report, or `None` when nothing
/// matches. Lookup order: ordinal → top-K → numeric buckets → section titles.
pub fn query(report: &StructuredReport, question: &str) -> Option<String> {
    let lower = question.to_lowercase();

    if let Some(rank) = requested_rank(question) {
        // The financial template's ranked bucket wins when present.
        if let Some(item) = report.financial_breakdown.iter().find(|i| i.rank == rank) {
            return Some(format!(
                "Rank {} is \"{}\" (financial impact: {}). {}",
                item.rank, item.title, item.impact, item.detail
            ));
        }
        let item = report.ranked_items.iter().find(|i| i.rank == rank)?;
        return Some(format!(
            "Rank {} is \"{}\". {}",
            item.rank, item.title, item.description
        ));
    }

    if let Some(k) = requested_top(question) {
        if report.ranked_items.is_empty() {
            return None;
        }
        let lines: Vec<String> = report
            .ranked_items
            .iter()
            .take(k)
            .map(|i| format!("{}. {}", i.rank, i.title))
            .collect();
        return Some(format!("Top {} items:\n{}", k.min(lines.len()), lines.join("\n")));
    }

    if CURRENCY_WORDS.iter().any(|w| lower.contains(w)) && !report.numeric_data.financial.is_empty()
    {
        let rendered: Vec<String> = report
            .numeric_data
            .financial
            .iter()
            .take(3)
            .map(|m| format!("{} {}", m.value, m.unit))
            .collect();
        return Some(format!("Financial figures: {}", rendered.join(", ")));
    }
    if PERCENT_WORDS.iter().any(|w| lower.contains(w))
        && !report.numeric_data.percentages.is_empty()
    {
        let rendered: Vec<String> = report
            .numeric_data
            .percentages
            .iter()
            .take(3)
            .map(|m| format!("{}{}", m.value, m.unit))
            .collect();
        return Some(format!("Percentage figures: {}", rendered.join(", ")));
    }

    // Keyword overlap against section titles; first match wins.
    let question_tokens: Vec<String> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2 && !SECTION_STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect();
    for section in &report.sections {
        let title_lower = section.title.to_lowercase();
        if question_tokens.iter().any(|t| title_lower.contains(t)) {
            let content: String = section.content.chars().take(300).collect();
            return Some(format!("[{}]\n{}", section.title, content));
        }
    }

    None
}

/// One-line digest of a report, for "summarize" follow-ups.
pub fn summary(report: &StructuredReport) -> String {
    let mut parts = Vec::new();
    if !report.ranked_items.is_empty() {
        let top: Vec<&str> = report
            .ranked_items
            .iter()
            .take(3)
            .map(|i| i.title.as_str())
            .collect();
        parts.push(format!("top items: {}", top.join(", ")));
    }
    if !report.key_findings.is_empty() {
        parts.push(format!("{} key findings", report.key_findings.len()));
    }
    if !report.actionable_items.is_empty() {
        parts.push(format!("{} recommended actions", report.actionable_items.len()));
    }
    if parts.is_empty() {
        "The latest report has no extractable highlights.".to_string()
    } else {
        format!("The latest report covers {}.", parts.join("; "))
    }
}

/// True when a question targets structured report data (an ordinal, top-K,
/// or numeric-lookup ask) rather than fresh retrieval.
pub fn is_structured_question(question: &str) -> bool {
    if requested_rank(question).is_some() || requested_top(question).is_some() {
        return true;
    }
    let lower = question.to_lowercase();
    CURRENCY_WORDS
        .iter()
        .chain(PERCENT_WORDS.iter())
        .any(|w| lower.contains(w))
}

fn requested_rank(question: &str) -> Option<u32> {
    let caps = RANK_RE.captures(question)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

fn requested_top(question: &str) -> Option<usize> {
    let caps = TOP_RE.captures(question)?;
    caps.get(1).and_then(|m| m.as_str().parse().ok())
}
