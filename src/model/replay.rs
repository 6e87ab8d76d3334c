use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{HistoryItem, ModelError, ModelProvider, ModelReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayErrorKind {
    Transient,
    Fatal,
    ContextWindow,
}

/// One scripted model turn: either a reply or an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayTurn {
    pub text: String,
    pub cost: Option<f64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<ReplayErrorKind>,
    /// Wait before answering, to simulate a slow provider.
    pub delay_ms: u64,
}

impl ReplayTurn {
    pub fn reply(text: impl Into<String>, cost: f64) -> Self {
        Self {
            text: text.into(),
            cost: Some(cost),
            ..Self::default()
        }
    }

    pub fn error(kind: ReplayErrorKind) -> Self {
        Self {
            error: Some(kind),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReplayFile {
    #[serde(default = "default_name")]
    name: String,
    turns: Vec<ReplayTurn>,
}

fn default_name() -> String {
    "replay".into()
}

/// Plays back a fixed script of replies. Used for dry runs and tests;
/// running out of turns is a fatal error.
pub struct ReplayModel {
    name: String,
    turns: Mutex<VecDeque<ReplayTurn>>,
    seen: Mutex<Vec<Vec<HistoryItem>>>,
}

impl ReplayModel {
    pub fn new(name: impl Into<String>, turns: Vec<ReplayTurn>) -> Self {
        Self {
            name: name.into(),
            turns: Mutex::new(turns.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Load a script from YAML (JSON is valid YAML).
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay script {}", path.display()))?;
        let file: ReplayFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse replay script {}", path.display()))?;
        Ok(Self::new(file.name, file.turns))
    }

    /// Histories received so far, one per call.
    pub fn requests(&self) -> Vec<Vec<HistoryItem>> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl ModelProvider for ReplayModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, history: &[HistoryItem]) -> Result<ModelReply, ModelError> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(history.to_vec());
        let turn = self
            .turns
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .ok_or_else(|| ModelError::Fatal("replay script exhausted".into()))?;

        if turn.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(turn.delay_ms)).await;
        }

        match turn.error {
            Some(ReplayErrorKind::Transient) => Err(ModelError::Transient("scripted transient error".into())),
            Some(ReplayErrorKind::Fatal) => Err(ModelError::Fatal("scripted fatal error".into())),
            Some(ReplayErrorKind::ContextWindow) => {
                Err(ModelError::ContextWindowExceeded("scripted context overflow".into()))
            }
            None => Ok(ModelReply {
                text: turn.text,
                cost: turn.cost,
                input_tokens: turn.input_tokens,
                output_tokens: turn.output_tokens,
            }),
        }
    }
}
