pub mod openai;
pub mod replay;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ledger::Amount;

pub use openai::OpenAiCompatibleModel;
pub use replay::ReplayModel;
pub use retry::{RetryPolicy, call_with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub role: Role,
    pub content: String,
}

impl HistoryItem {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    /// Dollar cost of this call as reported by the provider. `None` when
    /// the provider does not report one.
    pub cost: Option<f64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// Rate limits, timeouts, 5xx. Retried under the episode's policy.
    #[error("transient model error: {0}")]
    Transient(String),

    #[error("fatal model error: {0}")]
    Fatal(String),

    #[error("context window exceeded: {0}")]
    ContextWindowExceeded(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

/// The language model behind the agent.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Identifier recorded in trajectories.
    fn name(&self) -> &str;

    async fn send(&self, history: &[HistoryItem]) -> Result<ModelReply, ModelError>;
}

/// Per-episode usage counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub tokens_sent: u64,
    pub tokens_received: u64,
    pub api_calls: u64,
    pub total_cost: Amount,
}

impl ModelStats {
    pub fn record(&mut self, reply: &ModelReply, cost: Amount) {
        self.tokens_sent += reply.input_tokens;
        self.tokens_received += reply.output_tokens;
        self.api_calls += 1;
        self.total_cost += cost;
    }
}
