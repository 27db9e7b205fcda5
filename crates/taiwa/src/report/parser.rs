//! Pattern-based extraction of structured reports from generated text.
//!
//! Parsing is best-effort by contract: a malformed section is skipped, never
//! fatal, and `parse` always returns a report even for text that yields
//! nothing. The regex set mirrors the report conventions the generation
//! prompts produce: numbered `**bold**` ranked items, `##` sections with
//! bullet sub-lists, and numeric mentions with unit suffixes.

use regex::Regex;
use std::sync::LazyLock;

use super::{
    FinancialItem, NumericData, NumericMention, RankedItem, ReportSection, ReportType,
    StructuredReport,
};
use crate::config::ReportConfig;

static RANKED_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\d+)\.\s*\*\*(.+?)\*\*").expect("ranked header regex is valid")
});
static SECTION_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^##\s*(.+)$").expect("section header regex is valid"));
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*•]\s+(.+)$").expect("bullet regex is valid"));
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*[%％]").expect("percent regex is valid"));
static CURRENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[$¥€£]\s*(\d[\d,]*(?:\.\d+)?)|(\d[\d,]*(?:\.\d+)?)\s*(円|万円|yen|dollars)")
        .expect("currency regex is valid")
});
static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d[\d,]*)\s*(people|cases|patients|items|units|件|人|例|症例)")
        .expect("count regex is valid")
});
static OUTCOME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(success rate|complication rate|survival rate|accuracy|retention)\s*[:：]?\s*(\d+(?:\.\d+)?)\s*[%％]")
        .expect("outcome regex is valid")
});
static FINANCIAL_IMPACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)financial impact\s*[:：]?\s*\**\s*([$¥€£]?\s*\d[\d,]*(?:\.\d+)?\s*(?:円|万円|yen|dollars)?)")
        .expect("financial impact regex is valid")
});

const IMPORTANCE_VOCAB: &[&str] = &[
    "important", "critical", "key", "priority", "urgent", "notable", "concern", "significant",
];
const ACTION_VOCAB: &[&str] = &[
    "recommend", "propose", "should", "consider", "implement", "introduce", "improve", "adopt",
];

/// Parse response text into a structured report. Never fails; unparseable
/// parts simply yield empty buckets.
pub fn parse(text: &str, report_type: ReportType, config: &ReportConfig) -> StructuredReport {
    let ranked_items = extract_ranked_items(text);
    let financial_breakdown = match report_type {
        ReportType::Financial => extract_financial_breakdown(&ranked_items),
        _ => Vec::new(),
    };

    StructuredReport {
        report_id: 0, // assigned on store
        report_type,
        created_at: chrono::Utc::now(),
        sections: extract_sections(text),
        ranked_items,
        financial_breakdown,
        numeric_data: extract_numeric_data(text),
        key_findings: extract_sentences(text, IMPORTANCE_VOCAB, config.max_key_findings),
        actionable_items: extract_sentences(text, ACTION_VOCAB, config.max_actionable_items),
    }
}

/// Ranked items: a numbered `**title**` header, description running until the
/// next item or the first blank line.
fn extract_ranked_items(text: &str) -> Vec<RankedItem> {
    let headers: Vec<_> = RANKED_HEADER_RE.captures_iter(text).collect();
    let mut items = Vec::with_capacity(headers.len());

    for (i, caps) in headers.iter().enumerate() {
        let rank: u32 = match caps[1].parse() {
            Ok(r) => r,
            Err(_) => continue,
        };
        let title = caps[2].trim().to_string();

        let desc_start = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let desc_end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let raw = &text[desc_start..desc_end];
        let description = raw
            .split("\n\n")
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        let numeric_mentions = numeric_mentions_in(&description);
        items.push(RankedItem {
            rank,
            title,
            description,
            numeric_mentions,
        });
    }
    items
}

/// `##`-delimited sections with their bullet sub-lists.
fn extract_sections(text: &str) -> Vec<ReportSection> {
    let headers: Vec<_> = SECTION_HEADER_RE.captures_iter(text).collect();
    let mut sections = Vec::with_capacity(headers.len());

    for (i, caps) in headers.iter().enumerate() {
        let title = caps[1].trim().to_string();
        if title.is_empty() {
            continue;
        }
        let start = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let content = text[start..end].trim().to_string();
        let bullet_points = BULLET_RE
            .captures_iter(&content)
            .map(|c| c[1].trim().to_string())
            .collect();

        sections.push(ReportSection {
            title,
            content,
            bullet_points,
        });
    }
    sections
}

fn numeric_mentions_in(text: &str) -> Vec<NumericMention> {
    let mut mentions = Vec::new();
    for caps in CURRENCY_RE.captures_iter(text) {
        if let Some(symbol_amount) = caps.get(1) {
            mentions.push(NumericMention {
                value: symbol_amount.as_str().to_string(),
                unit: "currency".to_string(),
            });
        } else if let (Some(amount), Some(unit)) = (caps.get(2), caps.get(3)) {
            mentions.push(NumericMention {
                value: amount.as_str().to_string(),
                unit: unit.as_str().to_string(),
            });
        }
    }
    for caps in PERCENT_RE.captures_iter(text) {
        mentions.push(NumericMention {
            value: caps[1].to_string(),
            unit: "%".to_string(),
        });
    }
    mentions
}

/// Numeric mentions bucketed by unit family.
fn extract_numeric_data(text: &str) -> NumericData {
    let mut data = NumericData::default();

    for caps in CURRENCY_RE.captures_iter(text) {
        let (value, unit) = if let Some(symbol_amount) = caps.get(1) {
            (symbol_amount.as_str().to_string(), "currency".to_string())
        } else {
            match (caps.get(2), caps.get(3)) {
                (Some(amount), Some(unit)) => {
                    (amount.as_str().to_string(), unit.as_str().to_string())
                }
                _ => continue,
            }
        };
        data.financial.push(NumericMention { value, unit });
    }

    for caps in PERCENT_RE.captures_iter(text) {
        data.percentages.push(NumericMention {
            value: caps[1].to_string(),
            unit: "%".to_string(),
        });
    }

    for caps in COUNT_RE.captures_iter(text) {
        data.counts.push(NumericMention {
            value: caps[1].to_string(),
            unit: caps[2].to_string(),
        });
    }

    for caps in OUTCOME_RE.captures_iter(text) {
        data.outcomes.push(NumericMention {
            value: caps[2].to_string(),
            unit: caps[1].to_lowercase(),
        });
    }

    data
}

/// Sentences carrying any of the vocabulary terms, capped.
fn extract_sentences(text: &str, vocab: &[&str], cap: usize) -> Vec<String> {
    let mut found = Vec::new();
    for sentence in text.split(['.', '。', '\n']) {
        let sentence = sentence.trim().trim_start_matches(['-', '*', '•']).trim();
        if sentence.chars().count() <= 10 {
            continue;
        }
        let lower = sentence.to_lowercase();
        if vocab.iter().any(|v| lower.contains(v)) {
            found.push(sentence.to_string());
            if found.len() >= cap {
                break;
            }
        }
    }
    found
}

/// Ranked items that carry a named financial-impact figure. Impact lines
/// outside ranked entries are ignored; the ordinal lookup contract only
/// covers ranked entries.
fn extract_financial_breakdown(ranked_items: &[RankedItem]) -> Vec<FinancialItem> {
    let mut breakdown = Vec::new();
    for item in ranked_items {
        if let Some(caps) = FINANCIAL_IMPACT_RE.captures(&item.description) {
            breakdown.push(FinancialItem {
                rank: item.rank,
                title: item.title.clone(),
                impact: caps[1].trim().to_string(),
                detail: item.description.clone(),
            });
        }
    }
    breakdown
}

impl ReportType {
    /// Infer the report template from the text itself.
    pub fn detect(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("financial impact") {
            ReportType::Financial
        } else if lower.contains("clinical") || lower.contains("treatment outcome") {
            ReportType::Clinical
        } else {
            ReportType::General
        }
    }
}
