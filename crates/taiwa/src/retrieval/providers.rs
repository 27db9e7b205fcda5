//! HTTP-backed implementations of the external capabilities.
//!
//! `SerperSearch` talks to a Serper-style JSON search API; `OpenAiGenerator`
//! talks to any OpenAI-compatible chat-completions endpoint. Both share the
//! same client construction: explicit connect and request timeouts so a dead
//! endpoint fails the call instead of hanging the request.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{SearchProvider, TextGenerator};
use crate::types::SearchResults;

fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to build HTTP client")
}

/// Parse a response body as JSON, returning a clear error if the server
/// returned HTML (typical when a gateway or login page intercepts the call).
async fn parse_json_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("failed to read response body from {endpoint}"))?;
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(200).collect();
        return Err(anyhow!(
            "endpoint {} returned HTML instead of JSON (HTTP {}): {}",
            endpoint,
            status,
            preview
        ));
    }
    serde_json::from_str::<T>(&body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        anyhow!(
            "failed to parse JSON from {} (HTTP {}): {}. Body: {}",
            endpoint,
            status,
            e,
            preview
        )
    })
}

/// Serper-style web search provider.
pub struct SerperSearch {
    client: Client,
    api_key: String,
    endpoint: String,
    max_results: usize,
}

impl SerperSearch {
    pub fn new(api_key: String, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            api_key,
            endpoint: "https://google.serper.dev/search".to_string(),
            max_results: 5,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SearchProvider for SerperSearch {
    async fn search(&self, query: &str) -> Result<SearchResults> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&json!({ "q": query, "num": self.max_results }))
            .send()
            .await
            .context("search request failed")?;

        let results: SearchResults = parse_json_response(response, &self.endpoint).await?;
        tracing::debug!(hits = results.organic.len(), "web search completed");
        Ok(results)
    }
}

/// OpenAI-compatible chat-completions text generator.
pub struct OpenAiGenerator {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl OpenAiGenerator {
    pub fn new(api_key: String, model: String, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            api_key,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model,
            max_tokens: 1024,
        })
    }

    /// Point at a self-hosted OpenAI-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_tokens,
            "temperature": 0.3,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("generation request failed")?;

        let parsed: ChatResponse = parse_json_response(response, &self.endpoint).await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("generation response contained no choices"))?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organic_results_deserialize() {
        let raw = r#"{
            "organic": [
                {"title": "Flagship printers", "snippet": "The X-9000 leads the lineup.", "link": "https://example.com/a"},
                {"title": "Pricing guide", "snippet": "Entry models start low.", "link": "https://example.com/b"}
            ]
        }"#;
        let results: SearchResults = serde_json::from_str(raw).unwrap();
        assert_eq!(results.organic.len(), 2);
        assert_eq!(results.organic[0].title, "Flagship printers");
    }

    #[test]
    fn missing_organic_field_is_empty_not_error() {
        let results: SearchResults = serde_json::from_str(r#"{"searchParameters": {}}"#).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn chat_response_extracts_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":" the answer "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, " the answer ");
    }
}
