//! Per-user conversation state.
//!
//! Sessions live in a sharded concurrent map keyed by user ID: mutations for
//! one user serialize through the shard entry, while distinct users never
//! contend. Expiry is lazy — an expired session is reset on its next write and
//! removed only by an explicit cleanup sweep. Absence is never an error; reads
//! over missing state return empty values.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::intent::IntentLabel;

/// One user message + system response pair. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub timestamp: DateTime<Utc>,
    pub user_message: String,
    pub response: String,
    pub category: Option<IntentLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub history: VecDeque<Turn>,
    pub last_activity: DateTime<Utc>,
    pub session_start: DateTime<Utc>,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            history: VecDeque::new(),
            last_activity: now,
            session_start: now,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_activity > timeout
    }
}

pub struct SessionStore {
    sessions: DashMap<String, Session>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::hours(self.config.session_timeout_hours)
    }

    /// Append a turn, creating the session if needed. An expired session is
    /// reset (history cleared, session_start refreshed) before the append.
    /// Evicts the oldest turn when the history cap is exceeded.
    pub fn add_turn(
        &self,
        user_id: &str,
        user_message: &str,
        response: &str,
        category: Option<IntentLabel>,
    ) {
        let now = Utc::now();
        let timeout = self.timeout();
        let mut entry = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(now));

        if entry.is_expired(now, timeout) {
            tracing::debug!(user_id, "session expired; resetting history");
            entry.history.clear();
            entry.session_start = now;
        }

        entry.history.push_back(Turn {
            timestamp: now,
            user_message: user_message.to_string(),
            response: response.to_string(),
            category,
        });
        entry.last_activity = now;

        while entry.history.len() > self.config.max_history {
            entry.history.pop_front();
        }
    }

    /// True iff the session exists, is not expired, and has at least one turn.
    pub fn has_recent_conversation(&self, user_id: &str) -> bool {
        let now = Utc::now();
        match self.sessions.get(user_id) {
            Some(session) => {
                !session.is_expired(now, self.timeout()) && !session.history.is_empty()
            }
            None => false,
        }
    }

    /// Render the last few turns into a context block for generation prompts.
    /// Empty string when there is no recent conversation.
    pub fn get_context(&self, user_id: &str) -> String {
        let now = Utc::now();
        let session = match self.sessions.get(user_id) {
            Some(s) => s,
            None => return String::new(),
        };
        if session.is_expired(now, self.timeout()) || session.history.is_empty() {
            return String::new();
        }

        let mut parts = vec!["# Previous conversation".to_string()];
        let skip = session
            .history
            .len()
            .saturating_sub(self.config.context_turns);
        for (i, turn) in session.history.iter().skip(skip).enumerate() {
            let truncated =
                turn.response.chars().count() > self.config.context_response_chars;
            let response: String = turn
                .response
                .chars()
                .take(self.config.context_response_chars)
                .collect();
            parts.push(format!("## Turn {}", i + 1));
            parts.push(format!("**User**: {}", turn.user_message));
            parts.push(format!(
                "**Assistant**: {}{}",
                response,
                if truncated { "..." } else { "" }
            ));
            parts.push(format!(
                "**Category**: {}",
                turn.category.map(|c| c.as_str()).unwrap_or("unknown")
            ));
            parts.push(String::new());
        }
        parts.join("\n")
    }

    pub fn get_last_category(&self, user_id: &str) -> Option<IntentLabel> {
        self.sessions
            .get(user_id)
            .and_then(|s| s.history.back().and_then(|t| t.category))
    }

    /// The previous user message, if the conversation is still live.
    /// Consumed by the query enhancer when resolving elliptical follow-ups.
    pub fn last_user_message(&self, user_id: &str) -> Option<String> {
        let now = Utc::now();
        let session = self.sessions.get(user_id)?;
        if session.is_expired(now, self.timeout()) {
            return None;
        }
        session.history.back().map(|t| t.user_message.clone())
    }

    /// Remove sessions whose last activity is older than the timeout.
    /// Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let timeout = self.timeout();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now, timeout));
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::info!(removed, "expired sessions cleaned up");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Test hook: backdate a session's last activity.
    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, user_id: &str, when: DateTime<Utc>) {
        if let Some(mut session) = self.sessions.get_mut(user_id) {
            session.last_activity = when;
        }
    }
}
