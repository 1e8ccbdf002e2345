//! Summaries and the spam heuristic, via an OpenAI-compatible
//! `/chat/completions` endpoint.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http::HttpClient;

/// Marker the model is told to answer with when a message looks like spam.
pub const SPAM_SENTINEL: &str = "This is probably spam - dropping it";

pub const SYSTEM_INSTRUCTION: &str = "You summarize emails. Max three sentences response length. \
Only return the summarization. If the email is most likely spam, unsolicited advertising or \
phishing, answer with exactly: This is probably spam - dropping it";

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Returns the model's free-text verdict on `body`: a summary or the sentinel.
    async fn classify(&self, api_key: &str, body: &str) -> Result<String>;
}

pub fn is_spam(text: &str) -> bool {
    text.contains(SPAM_SENTINEL)
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct OpenAiClassifier {
    http: Arc<HttpClient>,
    base_url: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(http: Arc<HttpClient>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

fn user_prompt(body: &str) -> String {
    format!("Summarize this email:\n\n{}", body)
}

fn build_request<'a>(model: &'a str, prompt: &'a str) -> ChatCompletionRequest<'a> {
    ChatCompletionRequest {
        model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: SYSTEM_INSTRUCTION,
            },
            ChatMessage {
                role: "user",
                content: prompt,
            },
        ],
    }
}

fn extract_content(raw: &[u8]) -> Result<String> {
    let response: ChatCompletionResponse = serde_json::from_slice(raw)?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| anyhow!("completion response carried no content"))
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, api_key: &str, body: &str) -> Result<String> {
        let prompt = user_prompt(body);
        let request = build_request(&self.model, &prompt);

        let reply = self.http.post_json(&self.endpoint(), Some(api_key), &request).await?;
        if !reply.is_success() {
            return Err(anyhow!(
                "completion API returned status {}: {}",
                reply.status,
                reply.text()
            ));
        }
        extract_content(&reply.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_detection() {
        assert!(is_spam(SPAM_SENTINEL));
        assert!(is_spam("Summary:\n\nThis is probably spam - dropping it."));
        assert!(!is_spam("A colleague shares the quarterly report."));
        assert!(!is_spam("this is probably spam - dropping it"));
    }

    #[test]
    fn test_request_shape() {
        let prompt = user_prompt("Hello there");
        let request = build_request("gpt-4", &prompt);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "gpt-4");
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], SYSTEM_INSTRUCTION);
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "Summarize this email:\n\nHello there");
    }

    #[test]
    fn test_system_instruction_names_the_sentinel() {
        assert!(SYSTEM_INSTRUCTION.contains(SPAM_SENTINEL));
    }

    #[test]
    fn test_extract_content_trims() {
        let raw = br#"{"choices":[{"message":{"role":"assistant","content":"  A short summary.\n"}}]}"#;
        assert_eq!(extract_content(raw).unwrap(), "A short summary.");
    }

    #[test]
    fn test_extract_content_rejects_empty_responses() {
        assert!(extract_content(br#"{"choices":[]}"#).is_err());
        assert!(extract_content(br#"{"choices":[{"message":{"content":null}}]}"#).is_err());
        assert!(extract_content(br#"{"choices":[{"message":{"content":"   "}}]}"#).is_err());
        assert!(extract_content(b"not json").is_err());
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        crate::http::install_crypto_provider();
        let http = Arc::new(HttpClient::new(std::time::Duration::from_secs(1)).unwrap());
        let classifier = OpenAiClassifier::new(http, "https://api.openai.com/v1/", "gpt-4");
        assert_eq!(classifier.endpoint(), "https://api.openai.com/v1/chat/completions");
    }
}
