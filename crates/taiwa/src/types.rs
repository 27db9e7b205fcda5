use serde::{Deserialize, Serialize};

/// A passage returned by the primary knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub source: Option<String>,
    pub score: f32,
}

impl Passage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: None,
            score: 0.0,
        }
    }
}

/// One organic result from the fallback search provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

/// Structured result set from the fallback search provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub organic: Vec<SearchHit>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.organic.is_empty()
    }
}

/// Which stage of the retrieval state machine produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalPhase {
    /// Synthesized from primary-store passages and accepted by the quality gate.
    Primary,
    /// Built from fallback web search results.
    Fallback,
    /// Both stages failed; the text is a canned degradation message.
    Exhausted,
}

/// A resolved answer plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub phase: RetrievalPhase,
    /// Up to `max_sources` citations when the answer came from fallback search.
    pub sources: Vec<SearchHit>,
}

impl Answer {
    pub fn exhausted(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            phase: RetrievalPhase::Exhausted,
            sources: Vec::new(),
        }
    }
}
