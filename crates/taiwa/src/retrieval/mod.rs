//! Retrieval orchestration: primary knowledge store with fallback web search.
//!
//! Per query the state machine is
//! `START → PRIMARY_LOOKUP → (ACCEPT | FALLBACK_LOOKUP) → (ACCEPT | EXHAUSTED)`.
//! A primary answer is rejected by the quality gate when it is too short or
//! carries a low-confidence phrase; rejection triggers at most one fallback
//! search. Every external call is bounded by a timeout; a timeout follows the
//! same path as a failed call. The orchestrator never returns an error to the
//! caller — exhaustion degrades to canned text.

pub mod providers;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::config::RetrievalConfig;
use crate::intent::IntentLabel;
use crate::types::{Answer, Passage, RetrievalPhase, SearchHit, SearchResults};

pub const EXHAUSTED_MESSAGE: &str =
    "I could not find an answer to that. Try rephrasing the question or adding more detail.";
pub const LOCAL_MISS_MESSAGE: &str =
    "That data was not found in the local records. Please check the spelling and try again.";

/// Embedding-similarity-backed document retrieval. External capability.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>>;
}

/// External web search capability used when the primary answer is low-confidence.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchResults>;
}

/// Opaque prompt-in/text-out generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Internal failure taxonomy. Recovered locally; never crosses the pipeline
/// boundary as an error.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("primary knowledge store unavailable: {0}")]
    PrimaryUnavailable(String),
    #[error("primary answer failed the confidence gate")]
    LowConfidence,
    #[error("fallback search unavailable: {0}")]
    FallbackUnavailable(String),
    #[error("external call timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

pub struct RetrievalOrchestrator {
    store: Arc<dyn KnowledgeStore>,
    search: Arc<dyn SearchProvider>,
    generator: Arc<dyn TextGenerator>,
    config: RetrievalConfig,
}

impl RetrievalOrchestrator {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        search: Arc<dyn SearchProvider>,
        generator: Arc<dyn TextGenerator>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            search,
            generator,
            config,
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.call_timeout_secs)
    }

    /// Resolve a query end to end. Total over all failure modes.
    pub async fn answer(&self, query: &str, label: IntentLabel, context: &str) -> Answer {
        match self.primary_lookup(query, context).await {
            Ok(text) => {
                tracing::debug!(phase = "primary", "answer accepted");
                Answer {
                    text,
                    phase: RetrievalPhase::Primary,
                    sources: Vec::new(),
                }
            }
            Err(err) => {
                tracing::info!(error = %err, label = %label, "primary lookup rejected");
                if self.config.no_fallback_labels.contains(&label) {
                    // Local, time-sensitive data: a miss means the record is
                    // absent, not that the web should be consulted.
                    return Answer::exhausted(LOCAL_MISS_MESSAGE);
                }
                self.fallback_lookup(query).await
            }
        }
    }

    async fn primary_lookup(&self, query: &str, context: &str) -> Result<String, RetrievalError> {
        let passages = timeout(
            self.call_timeout(),
            self.store.search(query, self.config.top_k),
        )
        .await
        .map_err(|_| RetrievalError::Timeout(self.call_timeout()))?
        .map_err(|e| RetrievalError::PrimaryUnavailable(e.to_string()))?;

        if passages.is_empty() {
            return Err(RetrievalError::LowConfidence);
        }

        let prompt = build_synthesis_prompt(query, context, &passages);
        let text = timeout(self.call_timeout(), self.generator.generate(&prompt))
            .await
            .map_err(|_| RetrievalError::Timeout(self.call_timeout()))?
            .map_err(|e| RetrievalError::GenerationFailed(e.to_string()))?;

        if self.is_low_confidence(&text) {
            return Err(RetrievalError::LowConfidence);
        }
        Ok(text)
    }

    async fn fallback_lookup(&self, query: &str) -> Answer {
        let results = match timeout(self.call_timeout(), self.search.search(query)).await {
            Ok(Ok(results)) => results,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "fallback search unavailable");
                return Answer::exhausted(EXHAUSTED_MESSAGE);
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.config.call_timeout_secs, "fallback search timed out");
                return Answer::exhausted(EXHAUSTED_MESSAGE);
            }
        };

        if results.is_empty() {
            return Answer::exhausted(EXHAUSTED_MESSAGE);
        }

        let candidate_lines: Vec<String> = results
            .organic
            .iter()
            .map(|hit| format!("{}: {}", hit.title, hit.snippet))
            .collect();
        let kept = dedup_lines(
            &candidate_lines,
            self.config.min_line_chars,
            self.config.dedup_threshold,
            self.config.max_lines,
        );
        let sources: Vec<SearchHit> = results
            .organic
            .iter()
            .take(self.config.max_sources)
            .cloned()
            .collect();

        Answer {
            text: format_fallback_answer(&kept, &sources),
            phase: RetrievalPhase::Fallback,
            sources,
        }
    }

    /// Quality gate: too short, or carries a declared low-confidence phrase.
    pub fn is_low_confidence(&self, answer: &str) -> bool {
        if answer.trim().chars().count() < self.config.min_answer_chars {
            return true;
        }
        let lower = answer.to_lowercase();
        self.config
            .low_confidence_phrases
            .iter()
            .any(|phrase| lower.contains(&phrase.to_lowercase()))
    }
}

fn build_synthesis_prompt(query: &str, context: &str, passages: &[Passage]) -> String {
    let reference: String = passages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut prompt = String::new();
    if !context.is_empty() {
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }
    prompt.push_str(
        "Answer the question using only the reference passages below. \
         If they do not contain the answer, say that no information was found.\n\n",
    );
    prompt.push_str("# Reference passages\n");
    prompt.push_str(&reference);
    prompt.push_str("\n\n# Question\n");
    prompt.push_str(query);
    prompt
}

fn token_set(line: &str) -> HashSet<String> {
    line.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Drop short lines, then drop any line whose token-set Jaccard similarity
/// against an already-kept line exceeds `threshold`. Keeps at most `max_lines`.
pub fn dedup_lines(
    lines: &[String],
    min_line_chars: usize,
    threshold: f64,
    max_lines: usize,
) -> Vec<String> {
    let mut kept: Vec<(String, HashSet<String>)> = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.chars().count() < min_line_chars {
            continue;
        }
        let tokens = token_set(trimmed);
        if kept.iter().any(|(_, k)| jaccard(&tokens, k) > threshold) {
            continue;
        }
        kept.push((trimmed.to_string(), tokens));
        if kept.len() >= max_lines {
            break;
        }
    }
    kept.into_iter().map(|(line, _)| line).collect()
}

fn format_fallback_answer(lines: &[String], sources: &[SearchHit]) -> String {
    let mut out = String::from("## Web search results\n\n");
    out.push_str(&lines.join("\n"));
    if !sources.is_empty() {
        out.push_str("\n\nSources:\n");
        for (i, hit) in sources.iter().enumerate() {
            out.push_str(&format!("{}. {} — {}\n", i + 1, hit.title, hit.link));
        }
    }
    out.push_str("\nNote: web results may be out of date; verify against official guidance.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedStore(Vec<Passage>);
    #[async_trait]
    impl KnowledgeStore for FixedStore {
        async fn search(&self, _query: &str, _k: usize) -> Result<Vec<Passage>> {
            Ok(self.0.clone())
        }
    }

    struct FixedGenerator(String);
    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct CountingSearch {
        calls: AtomicUsize,
        results: SearchResults,
    }
    impl CountingSearch {
        fn with_hits() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                results: SearchResults {
                    organic: vec![SearchHit {
                        title: "Flagship printers compared".into(),
                        snippet: "The current flagship model in the lineup is the X-9000 series."
                            .into(),
                        link: "https://example.com/printers".into(),
                    }],
                },
            }
        }
        fn empty() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                results: SearchResults::default(),
            }
        }
    }
    #[async_trait]
    impl SearchProvider for CountingSearch {
        async fn search(&self, _query: &str) -> Result<SearchResults> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }
    }

    fn orchestrator(
        store: FixedStore,
        search: Arc<CountingSearch>,
        generator: FixedGenerator,
    ) -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(
            Arc::new(store),
            search,
            Arc::new(generator),
            RetrievalConfig::default(),
        )
    }

    const GOOD_ANSWER: &str =
        "The expense policy allows up to 5,000 per month with receipts attached and manager approval.";

    #[tokio::test]
    async fn confident_primary_answer_skips_fallback() {
        let search = Arc::new(CountingSearch::with_hits());
        let orch = orchestrator(
            FixedStore(vec![Passage::new("expense policy text")]),
            search.clone(),
            FixedGenerator(GOOD_ANSWER.into()),
        );

        let answer = orch.answer("expense policy?", IntentLabel::Admin, "").await;
        assert_eq!(answer.phase, RetrievalPhase::Primary);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn short_primary_answer_triggers_exactly_one_fallback() {
        let search = Arc::new(CountingSearch::with_hits());
        // 9-char answer, well under the 50-char minimum.
        let orch = orchestrator(
            FixedStore(vec![Passage::new("passage")]),
            search.clone(),
            FixedGenerator("No info..".into()),
        );

        let answer = orch.answer("flagship printer?", IntentLabel::Unknown, "").await;
        assert_eq!(answer.phase, RetrievalPhase::Fallback);
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
        assert!(answer.text.contains("Sources:"));
        assert!(answer.text.contains("https://example.com/printers"));
    }

    #[tokio::test]
    async fn low_confidence_phrase_triggers_fallback() {
        let search = Arc::new(CountingSearch::with_hits());
        let long_but_useless = format!("{} no information available here.", "x".repeat(60));
        let orch = orchestrator(
            FixedStore(vec![Passage::new("passage")]),
            search.clone(),
            FixedGenerator(long_but_useless),
        );

        let answer = orch.answer("anything", IntentLabel::Unknown, "").await;
        assert_eq!(answer.phase, RetrievalPhase::Fallback);
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_fallback_results_exhaust() {
        let search = Arc::new(CountingSearch::empty());
        let orch = orchestrator(
            FixedStore(Vec::new()),
            search.clone(),
            FixedGenerator(GOOD_ANSWER.into()),
        );

        let answer = orch.answer("anything", IntentLabel::Unknown, "").await;
        assert_eq!(answer.phase, RetrievalPhase::Exhausted);
        assert_eq!(answer.text, EXHAUSTED_MESSAGE);
    }

    #[tokio::test]
    async fn bypass_label_never_searches_the_web() {
        let search = Arc::new(CountingSearch::with_hits());
        let orch = orchestrator(
            FixedStore(Vec::new()),
            search.clone(),
            FixedGenerator(GOOD_ANSWER.into()),
        );

        let answer = orch
            .answer("error rate for intake desk", IntentLabel::PerformanceMetrics, "")
            .await;
        assert_eq!(answer.phase, RetrievalPhase::Exhausted);
        assert_eq!(answer.text, LOCAL_MISS_MESSAGE);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_store_falls_back() {
        struct BrokenStore;
        #[async_trait]
        impl KnowledgeStore for BrokenStore {
            async fn search(&self, _q: &str, _k: usize) -> Result<Vec<Passage>> {
                anyhow::bail!("index offline")
            }
        }
        let search = Arc::new(CountingSearch::with_hits());
        let orch = RetrievalOrchestrator::new(
            Arc::new(BrokenStore),
            search.clone(),
            Arc::new(FixedGenerator(GOOD_ANSWER.into())),
            RetrievalConfig::default(),
        );

        let answer = orch.answer("anything", IntentLabel::Unknown, "").await;
        assert_eq!(answer.phase, RetrievalPhase::Fallback);
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dedup_output_has_no_near_duplicate_pair() {
        let lines = vec![
            "The flagship model is the X-9000 with duplex scanning".to_string(),
            "The flagship model is the X-9000 with duplex scanning!".to_string(),
            "Pricing starts at 120,000 for the entry configuration".to_string(),
            "short".to_string(),
        ];
        let kept = dedup_lines(&lines, 20, 0.8, 15);
        assert_eq!(kept.len(), 2);
        for i in 0..kept.len() {
            for j in (i + 1)..kept.len() {
                let sim = jaccard(&token_set(&kept[i]), &token_set(&kept[j]));
                assert!(sim <= 0.8, "kept near-duplicates: {} / {}", kept[i], kept[j]);
            }
        }
    }

    #[test]
    fn dedup_caps_total_lines() {
        let lines: Vec<String> = (0..40)
            .map(|i| format!("entirely unique line number {i} with plenty of characters"))
            .collect();
        let kept = dedup_lines(&lines, 20, 0.8, 15);
        assert_eq!(kept.len(), 15);
    }

    #[test]
    fn quality_gate_checks_length_and_phrases() {
        let orch = orchestrator(
            FixedStore(Vec::new()),
            Arc::new(CountingSearch::empty()),
            FixedGenerator(String::new()),
        );
        assert!(orch.is_low_confidence("No information available."));
        assert!(orch.is_low_confidence(&format!("{} database not initialized", "y".repeat(80))));
        assert!(!orch.is_low_confidence(GOOD_ANSWER));
    }
}
