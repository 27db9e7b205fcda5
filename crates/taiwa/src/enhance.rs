//! Context-based repair of elliptical follow-up queries.
//!
//! Deterministic, table-driven rewriting: an incomplete query ("for the
//! printer") is matched against a finite anchor table — anchor keyword in the
//! previous user message, cue in the current fragment — and replaced by the
//! rule's composed query. No free-form rewriting happens here, so the
//! behavior is bounded and directly testable against the table.

use crate::config::{AnchorRule, EnhancerConfig};
use crate::session::SessionStore;

pub struct QueryEnhancer {
    config: EnhancerConfig,
}

impl QueryEnhancer {
    pub fn new(config: EnhancerConfig) -> Self {
        Self { config }
    }

    /// True when the query cannot stand alone: too short, ends in an
    /// elliptical particle, or references an unstated antecedent.
    pub fn is_incomplete_query(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.chars().count() <= self.config.max_incomplete_chars {
            return true;
        }
        let lower = trimmed.to_lowercase();
        for particle in &self.config.incomplete_particles {
            let particle = particle.to_lowercase();
            if lower == particle || lower.ends_with(&format!(" {particle}")) {
                return true;
            }
        }
        self.config
            .topic_shift_phrases
            .iter()
            .any(|phrase| lower.contains(&phrase.to_lowercase()))
    }

    /// True when the query carries a follow-up marker ("more", "why", ...).
    /// The controller uses this to decide whether to include conversation
    /// context in the generation prompt.
    pub fn is_follow_up_question(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.config
            .follow_up_markers
            .iter()
            .any(|marker| lower.contains(&marker.to_lowercase()))
    }

    /// Rewrite `current_query` using the previous turn's user message.
    /// Returns `(query, false)` unchanged when the query already stands
    /// alone, there is no history, or no anchor rule matches both sides.
    /// A complete query is never rewritten, even when it contains a cue.
    pub fn enhance(
        &self,
        sessions: &SessionStore,
        user_id: &str,
        current_query: &str,
    ) -> (String, bool) {
        if !self.is_incomplete_query(current_query) {
            return (current_query.to_string(), false);
        }
        let previous = match sessions.last_user_message(user_id) {
            Some(message) => message.to_lowercase(),
            None => return (current_query.to_string(), false),
        };
        let current = current_query.to_lowercase();

        for rule in &self.config.anchors {
            if previous.contains(&rule.anchor.to_lowercase())
                && current.contains(&rule.cue.to_lowercase())
            {
                tracing::info!(
                    anchor = %rule.anchor,
                    cue = %rule.cue,
                    "elliptical query resolved from context"
                );
                return (rule.rewrite.clone(), true);
            }
        }
        (current_query.to_string(), false)
    }

    /// Human-facing disambiguation line for an enhanced query. Uses the
    /// matched rule's confirmation when it has one, else a generic template.
    pub fn generate_confirmation(&self, _original: &str, enhanced: &str) -> String {
        if let Some(rule) = self.matched_rule(enhanced) {
            if let Some(confirmation) = &rule.confirmation {
                return confirmation.clone();
            }
        }
        format!("Did you mean \"{enhanced}\"?")
    }

    fn matched_rule(&self, enhanced: &str) -> Option<&AnchorRule> {
        self.config.anchors.iter().find(|r| r.rewrite == enhanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn enhancer() -> QueryEnhancer {
        let mut config = EnhancerConfig::default();
        config.anchors.push(AnchorRule {
            anchor: "Brand A".into(),
            cue: "printer".into(),
            rewrite: "Brand A printer flagship model".into(),
            confirmation: None,
        });
        QueryEnhancer::new(config)
    }

    fn sessions() -> SessionStore {
        SessionStore::new(SessionConfig::default())
    }

    #[test]
    fn short_and_elliptical_queries_are_incomplete() {
        let e = enhancer();
        assert!(e.is_incomplete_query("ok"));
        assert!(e.is_incomplete_query("  so "));
        assert!(e.is_incomplete_query("what about"));
        assert!(e.is_incomplete_query("and for the printer"));
        assert!(!e.is_incomplete_query("what is the flagship camera of Brand A?"));
    }

    #[test]
    fn follow_up_markers_are_detected() {
        let e = enhancer();
        assert!(e.is_follow_up_question("tell me more"));
        assert!(e.is_follow_up_question("why did that happen"));
        assert!(e.is_follow_up_question("how does it compare to last year"));
        assert!(!e.is_follow_up_question("list the branch offices"));
    }

    #[test]
    fn anchor_table_resolves_elliptical_follow_up() {
        let e = enhancer();
        let store = sessions();
        store.add_turn(
            "u1",
            "What is the flagship camera of Brand A?",
            "The flagship is ...",
            None,
        );

        let (enhanced, was_enhanced) = e.enhance(&store, "u1", "for the printer");
        assert!(was_enhanced);
        assert_eq!(enhanced, "Brand A printer flagship model");
    }

    #[test]
    fn complete_queries_pass_through_unchanged() {
        let e = enhancer();
        let store = sessions();
        store.add_turn("u1", "What is the flagship camera of Brand A?", "...", None);

        let query = "what were last month's sales figures?";
        assert!(!e.is_incomplete_query(query));
        let (out, was_enhanced) = e.enhance(&store, "u1", query);
        assert_eq!(out, query);
        assert!(!was_enhanced);
    }

    #[test]
    fn cue_bearing_complete_query_is_not_rewritten() {
        let e = enhancer();
        let store = sessions();
        store.add_turn("u1", "Tell me about the Brand A lineup", "...", None);

        // Contains the "printer" cue and the history carries the anchor, but
        // the query stands alone and must survive untouched.
        let query = "what is the cheapest printer that ships with duplex scanning?";
        assert!(!e.is_incomplete_query(query));
        let (out, was_enhanced) = e.enhance(&store, "u1", query);
        assert_eq!(out, query);
        assert!(!was_enhanced);
    }

    #[test]
    fn no_history_means_no_enhancement() {
        let e = enhancer();
        let store = sessions();
        let (out, was_enhanced) = e.enhance(&store, "u1", "for the printer");
        assert_eq!(out, "for the printer");
        assert!(!was_enhanced);
    }

    #[test]
    fn confirmation_prefers_rule_specific_text() {
        let e = enhancer();
        assert_eq!(
            e.generate_confirmation("for the printer", "Fujifilm printer flagship model"),
            "Answering for the Fujifilm printer lineup."
        );
        assert_eq!(
            e.generate_confirmation("for the printer", "Brand A printer flagship model"),
            "Did you mean \"Brand A printer flagship model\"?"
        );
    }
}
