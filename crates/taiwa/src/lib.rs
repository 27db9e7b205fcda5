pub mod config;
pub mod enhance;
pub mod intent;
pub mod pipeline;
pub mod report;
pub mod retrieval;
pub mod session;
pub mod types;

// Re-export primary types for convenience
pub use config::PipelineConfig;
pub use enhance::QueryEnhancer;
pub use intent::{classify_with_override, IntentClassifier, IntentLabel, OverrideRule, RuleClassifier};
pub use pipeline::PipelineController;
pub use report::{ReportStore, StructuredReport};
pub use retrieval::{
    KnowledgeStore, RetrievalOrchestrator, SearchProvider, TextGenerator,
};
pub use retrieval::providers::{OpenAiGenerator, SerperSearch};
pub use session::SessionStore;
pub use types::{Answer, Passage, RetrievalPhase, SearchHit, SearchResults};

// Re-export common types
pub use anyhow::{Error, Result};
