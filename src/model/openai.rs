use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{HistoryItem, ModelError, ModelProvider, ModelReply};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Dollar prices per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    /// Replies are priced from token usage when the endpoint does not
    /// report a cost itself.
    pub pricing: Option<Pricing>,
    /// Refuse requests whose estimated size exceeds this many tokens.
    pub max_input_tokens: Option<u64>,
    pub request_timeout_secs: u64,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            base_url: DEFAULT_BASE_URL.into(),
            temperature: 0.0,
            max_output_tokens: None,
            pricing: None,
            max_input_tokens: None,
            request_timeout_secs: 600,
        }
    }
}

/// Any endpoint speaking the `/chat/completions` protocol.
pub struct OpenAiCompatibleModel {
    client: Client,
    api_key: Option<String>,
    settings: OpenAiSettings,
}

impl OpenAiCompatibleModel {
    pub fn new(client: Client, api_key: Option<String>, settings: OpenAiSettings) -> Self {
        Self { client, api_key, settings }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, history: &[HistoryItem]) -> Value {
        let mut body = serde_json::json!({
            "model": self.settings.model,
            "messages": history,
            "temperature": self.settings.temperature,
        });
        if let Some(max) = self.settings.max_output_tokens {
            body["max_tokens"] = Value::from(max);
        }
        body
    }
}

/// Rough token count: four characters per token.
pub fn estimate_tokens(history: &[HistoryItem]) -> u64 {
    history
        .iter()
        .map(|item| item.content.chars().count() as u64 / 4 + 4)
        .sum()
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn send(&self, history: &[HistoryItem]) -> Result<ModelReply, ModelError> {
        if let Some(limit) = self.settings.max_input_tokens {
            let estimate = estimate_tokens(history);
            if estimate > limit {
                return Err(ModelError::ContextWindowExceeded(format!(
                    "estimated {estimate} input tokens exceeds limit of {limit}"
                )));
            }
        }

        let mut req = self
            .client
            .post(self.endpoint())
            .timeout(Duration::from_secs(self.settings.request_timeout_secs))
            .json(&self.request_body(history));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = resp.text().await.map_err(classify_transport)?;
        let completion = decode_completion(&body)?;
        let usage = completion.usage.unwrap_or_default();
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::Fatal("completion has no message content".into()))?;

        let cost = usage.cost.or_else(|| {
            self.settings
                .pricing
                .map(|p| p.cost(usage.prompt_tokens, usage.completion_tokens))
        });

        tracing::debug!(
            model = %self.settings.model,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            cost = ?cost,
            "model reply received"
        );

        Ok(ModelReply {
            text,
            cost,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    /// Some gateways report the dollar cost directly.
    #[serde(default)]
    cost: Option<f64>,
}

/// A 200 with an undecodable body is not retried.
fn decode_completion(body: &str) -> Result<ChatCompletion, ModelError> {
    serde_json::from_str(body).map_err(|e| ModelError::Fatal(format!("failed to decode completion: {e}")))
}

fn classify_transport(err: reqwest::Error) -> ModelError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ModelError::Transient(err.to_string())
    } else {
        ModelError::Fatal(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> ModelError {
    let message = format!("{status}: {body}");
    let lowered = body.to_ascii_lowercase();
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return ModelError::Transient(message);
    }
    if lowered.contains("context_length_exceeded")
        || lowered.contains("maximum context length")
        || lowered.contains("context window")
    {
        return ModelError::ContextWindowExceeded(message);
    }
    ModelError::Fatal(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(settings: OpenAiSettings) -> OpenAiCompatibleModel {
        OpenAiCompatibleModel::new(Client::new(), None, settings)
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(matches!(
            classify_status(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"code":"context_length_exceeded"}}"#
            ),
            ModelError::ContextWindowExceeded(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            ModelError::Fatal(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "no such model"),
            ModelError::Fatal(_)
        ));
    }

    #[test]
    fn pricing_is_per_million_tokens() {
        let p = Pricing { input_per_million: 2.0, output_per_million: 8.0 };
        assert!((p.cost(1_000_000, 500_000) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn request_body_carries_messages() {
        let m = model(OpenAiSettings {
            model: "gpt-test".into(),
            max_output_tokens: Some(256),
            ..OpenAiSettings::default()
        });
        let body = m.request_body(&[HistoryItem::system("sys"), HistoryItem::user("go")]);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(m.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[tokio::test]
    async fn oversized_history_fails_before_sending() {
        let m = model(OpenAiSettings {
            model: "gpt-test".into(),
            base_url: "http://127.0.0.1:9".into(),
            max_input_tokens: Some(10),
            ..OpenAiSettings::default()
        });
        let err = m.send(&[HistoryItem::user("x".repeat(400))]).await.unwrap_err();
        assert!(matches!(err, ModelError::ContextWindowExceeded(_)));
    }

    #[test]
    fn malformed_completion_is_fatal() {
        for body in ["<html>bad gateway</html>", r#"{"choices": 3}"#, ""] {
            let err = decode_completion(body).unwrap_err();
            assert!(matches!(err, ModelError::Fatal(ref m) if m.contains("failed to decode")), "{body}");
        }
    }

    #[test]
    fn completion_with_gateway_cost_decodes() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"submit"}}],
                     "usage":{"prompt_tokens":12,"completion_tokens":3,"cost":0.0021}}"#;
        let c = decode_completion(raw).unwrap();
        let usage = c.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.cost, Some(0.0021));
    }
}
