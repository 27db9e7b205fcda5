//! End-to-end message handling.
//!
//! The controller wires the session store, query enhancer, intent classifier,
//! retrieval orchestrator, and report store into one total entry point:
//! `handle_message` always returns a user-facing string, whatever fails
//! underneath. Processing order per message: trim → repair elliptical
//! follow-ups from context → classify (safety override first) → route →
//! record the turn → capture report-like answers.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::enhance::QueryEnhancer;
use crate::intent::{classify_with_override, IntentClassifier, IntentLabel, OverrideRule, RuleClassifier};
use crate::report::{self, ReportStore};
use crate::retrieval::{KnowledgeStore, RetrievalOrchestrator, SearchProvider, TextGenerator};
use crate::session::SessionStore;

pub const EMPTY_MESSAGE: &str = "I didn't catch that. What would you like to ask?";
pub const CHAT_FALLBACK: &str = "Hello! Ask me about sales, admin, or clinical topics.";
pub const FEEDBACK_REPLY: &str = "Glad that helped. Anything else you would like to look into?";
pub const SAFETY_ESCALATION: &str = "This requires a safety double-check. Routing to verification: a pharmacist will confirm before anything is dispensed.";

pub struct PipelineController {
    sessions: SessionStore,
    enhancer: QueryEnhancer,
    classifier: Box<dyn IntentClassifier>,
    override_rule: OverrideRule,
    orchestrator: RetrievalOrchestrator,
    reports: ReportStore,
    generator: Arc<dyn TextGenerator>,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
}

impl PipelineController {
    /// Build a controller over the three external capabilities. Fails only
    /// on invalid configuration (bad override pattern).
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn KnowledgeStore>,
        search: Arc<dyn SearchProvider>,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self> {
        let override_rule = OverrideRule::new(
            &config.classifier.override_id_pattern,
            config.classifier.safety_terms.clone(),
        )?;
        let classifier: Box<dyn IntentClassifier> =
            Box::new(RuleClassifier::from_config(&config.classifier));

        Ok(Self {
            sessions: SessionStore::new(config.session.clone()),
            enhancer: QueryEnhancer::new(config.enhancer.clone()),
            classifier,
            override_rule,
            orchestrator: RetrievalOrchestrator::new(
                store,
                search,
                generator.clone(),
                config.retrieval.clone(),
            ),
            reports: ReportStore::new(config.report.clone()),
            generator,
            cleanup_interval: Duration::from_secs(config.session.cleanup_interval_secs),
            last_cleanup: Mutex::new(Instant::now()),
        })
    }

    /// Swap in a different classifier implementation. The safety override
    /// still applies on top of whatever is installed here.
    pub fn with_classifier(mut self, classifier: Box<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn reports(&self) -> &ReportStore {
        &self.reports
    }

    /// Handle one user message. Total: every failure mode degrades to a
    /// canned reply, and the turn is always recorded.
    pub async fn handle_message(&self, user_id: &str, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return EMPTY_MESSAGE.to_string();
        }
        self.maybe_cleanup();

        let has_recent = self.sessions.has_recent_conversation(user_id);

        // Repair elliptical follow-ups ("what about the printer?") from the
        // previous turn before classification sees them.
        let (query, enhanced) = if has_recent && self.enhancer.is_incomplete_query(text) {
            self.enhancer.enhance(&self.sessions, user_id, text)
        } else {
            (text.to_string(), false)
        };
        let confirmation = if enhanced {
            Some(self.enhancer.generate_confirmation(text, &query))
        } else {
            None
        };

        let label = classify_with_override(&self.override_rule, self.classifier.as_ref(), &query);
        tracing::info!(user_id, label = %label, enhanced, "message classified");

        let answer = self.route(user_id, &query, label, has_recent).await;

        let response = match confirmation {
            Some(note) => format!("{note}\n\n{answer}"),
            None => answer,
        };

        self.sessions.add_turn(user_id, text, &response, Some(label));
        response
    }

    async fn route(
        &self,
        user_id: &str,
        query: &str,
        label: IntentLabel,
        has_recent: bool,
    ) -> String {
        // Structured follow-ups against a stored report short-circuit
        // retrieval entirely.
        if self.reports.has_reports(user_id) && report::is_structured_question(query) {
            return self.reports.query_latest(user_id, query);
        }

        match label {
            IntentLabel::SafetyCheck => SAFETY_ESCALATION.to_string(),
            IntentLabel::Summary => match self.reports.latest(user_id) {
                Some(latest) => report::summary(&latest),
                None => report::NO_REPORTS_MESSAGE.to_string(),
            },
            IntentLabel::Feedback => FEEDBACK_REPLY.to_string(),
            IntentLabel::GeneralChat => self.direct_chat(user_id, query).await,
            _ => {
                let context = if has_recent && self.enhancer.is_follow_up_question(query) {
                    self.sessions.get_context(user_id)
                } else {
                    String::new()
                };
                let answer = self.orchestrator.answer(query, label, &context).await;
                if self.reports.should_capture(&answer.text) {
                    let report_id = self.reports.capture(user_id, &answer.text);
                    tracing::debug!(user_id, report_id, "answer captured as report");
                }
                answer.text
            }
        }
    }

    /// Small talk goes straight to generation with conversational context;
    /// a provider failure degrades to a fixed greeting.
    async fn direct_chat(&self, user_id: &str, query: &str) -> String {
        let context = self.sessions.get_context(user_id);
        let prompt = if context.is_empty() {
            format!("Reply briefly and politely to the user.\n\nUser: {query}")
        } else {
            format!("{context}\n\nReply briefly and politely to the user.\n\nUser: {query}")
        };
        match self.generator.generate(&prompt).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "chat generation failed");
                CHAT_FALLBACK.to_string()
            }
        }
    }

    /// Opportunistic expiry sweep, at most once per interval. Runs inline on
    /// the message path; the sweep itself is a cheap retain.
    fn maybe_cleanup(&self) {
        let mut last = self.last_cleanup.lock();
        if last.elapsed() >= self.cleanup_interval {
            *last = Instant::now();
            drop(last);
            self.sessions.cleanup_expired();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{EXHAUSTED_MESSAGE, LOCAL_MISS_MESSAGE};
    use crate::types::{Passage, SearchHit, SearchResults};
    use async_trait::async_trait;
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
    #[async_trait]
    impl SearchProvider for CountingSearch {
        async fn search(&self, _query: &str) -> Result<SearchResults> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }
    }

    const GOOD_ANSWER: &str =
        "The expense policy allows up to 5,000 per month with receipts attached and manager approval.";

    fn controller_with(generated: &str, hits: SearchResults) -> (PipelineController, Arc<CountingSearch>) {
        let search = Arc::new(CountingSearch {
            calls: AtomicUsize::new(0),
            results: hits,
        });
        let controller = PipelineController::new(
            PipelineConfig::default(),
            Arc::new(FixedStore(vec![Passage::new("policy text")])),
            search.clone(),
            Arc::new(FixedGenerator(generated.to_string())),
        )
        .unwrap();
        (controller, search)
    }

    fn one_hit() -> SearchResults {
        SearchResults {
            organic: vec![SearchHit {
                title: "Flagship printers compared".into(),
                snippet: "The current flagship model in the lineup is the X-9000 series.".into(),
                link: "https://example.com/printers".into(),
            }],
        }
    }

    #[tokio::test]
    async fn retrieval_answer_is_recorded_as_a_turn() {
        let (controller, search) = controller_with(GOOD_ANSWER, one_hit());
        let reply = controller.handle_message("u1", "what is the expense policy?").await;
        assert_eq!(reply, GOOD_ANSWER);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
        assert!(controller.sessions().has_recent_conversation("u1"));
        assert_eq!(
            controller.sessions().get_last_category("u1"),
            Some(IntentLabel::Admin)
        );
    }

    #[tokio::test]
    async fn empty_message_is_rejected_without_a_turn() {
        let (controller, _) = controller_with(GOOD_ANSWER, one_hit());
        assert_eq!(controller.handle_message("u1", "   ").await, EMPTY_MESSAGE);
        assert!(!controller.sessions().has_recent_conversation("u1"));
    }

    #[tokio::test]
    async fn incomplete_follow_up_is_enhanced_with_confirmation() {
        let (controller, _) = controller_with(GOOD_ANSWER, one_hit());
        controller
            .handle_message("u1", "Tell me about the Fujifilm lineup")
            .await;
        let reply = controller.handle_message("u1", "what about the printer?").await;
        assert!(reply.starts_with("Answering for the Fujifilm printer lineup."));
        assert!(reply.contains(GOOD_ANSWER));
    }

    #[tokio::test]
    async fn incomplete_query_without_history_passes_through() {
        let (controller, _) = controller_with(GOOD_ANSWER, one_hit());
        let reply = controller.handle_message("u1", "what about the printer?").await;
        assert!(!reply.contains("Answering for"));
        assert_eq!(reply, GOOD_ANSWER);
    }

    #[tokio::test]
    async fn safety_override_escalates_before_routing() {
        let (controller, search) = controller_with(GOOD_ANSWER, one_hit());
        let reply = controller
            .handle_message("u1", "Please verify the dosage for patient A2024-0113")
            .await;
        assert_eq!(reply, SAFETY_ESCALATION);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            controller.sessions().get_last_category("u1"),
            Some(IntentLabel::SafetyCheck)
        );
    }

    #[tokio::test]
    async fn feedback_gets_canned_reply_without_retrieval() {
        let (controller, search) = controller_with(GOOD_ANSWER, one_hit());
        let reply = controller.handle_message("u1", "thanks, that was helpful!").await;
        assert_eq!(reply, FEEDBACK_REPLY);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn long_answers_become_queryable_reports() {
        let report_text = format!(
            "## Top Products\n1. **Gadget** leads with 800 units\n2. **Widget** costs 50000円\n{}",
            "Detailed analysis follows. ".repeat(20)
        );
        let (controller, _) = controller_with(&report_text, one_hit());
        controller.handle_message("u1", "analyze monthly sales").await;
        assert!(controller.reports().has_reports("u1"));

        let reply = controller.handle_message("u1", "what was rank 2?").await;
        assert!(reply.contains("Widget"));
    }

    #[tokio::test]
    async fn numeric_follow_up_reads_the_stored_report() {
        let report_text = format!(
            "## Top Products\n1. **Gadget** leads with 800 units\n2. **Widget** costs 50000円\n{}",
            "Detailed analysis follows. ".repeat(20)
        );
        let (controller, search) = controller_with(&report_text, one_hit());
        controller.handle_message("u1", "analyze monthly sales").await;

        let reply = controller.handle_message("u1", "what was the cost figure?").await;
        assert!(reply.contains("50000"));
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rank_question_without_reports_goes_to_retrieval() {
        let (controller, _) = controller_with(GOOD_ANSWER, one_hit());
        let reply = controller.handle_message("u1", "what was rank 2?").await;
        assert_eq!(reply, GOOD_ANSWER);
    }

    #[tokio::test]
    async fn summary_without_reports_degrades() {
        let (controller, _) = controller_with(GOOD_ANSWER, one_hit());
        let reply = controller.handle_message("u1", "give me a summary").await;
        assert_eq!(reply, report::NO_REPORTS_MESSAGE);
    }

    #[tokio::test]
    async fn metrics_miss_stays_local() {
        struct EmptyStore;
        #[async_trait]
        impl KnowledgeStore for EmptyStore {
            async fn search(&self, _q: &str, _k: usize) -> Result<Vec<Passage>> {
                Ok(Vec::new())
            }
        }
        let search = Arc::new(CountingSearch {
            calls: AtomicUsize::new(0),
            results: one_hit(),
        });
        let controller = PipelineController::new(
            PipelineConfig::default(),
            Arc::new(EmptyStore),
            search.clone(),
            Arc::new(FixedGenerator(GOOD_ANSWER.to_string())),
        )
        .unwrap();

        let reply = controller
            .handle_message("u1", "what is the error rate this month?")
            .await;
        assert_eq!(reply, LOCAL_MISS_MESSAGE);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_query_with_empty_everything_exhausts() {
        struct EmptyStore;
        #[async_trait]
        impl KnowledgeStore for EmptyStore {
            async fn search(&self, _q: &str, _k: usize) -> Result<Vec<Passage>> {
                Ok(Vec::new())
            }
        }
        let search = Arc::new(CountingSearch {
            calls: AtomicUsize::new(0),
            results: SearchResults::default(),
        });
        let controller = PipelineController::new(
            PipelineConfig::default(),
            Arc::new(EmptyStore),
            search.clone(),
            Arc::new(FixedGenerator(String::new())),
        )
        .unwrap();

        let reply = controller.handle_message("u1", "zebra quantum lunch").await;
        assert_eq!(reply, EXHAUSTED_MESSAGE);
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }
}
