use chrono::{DateTime, Utc};
use serde::Serialize;

/// Live progress notification, broadcast while an episode runs.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeEvent {
    pub episode_id: String,
    pub timestamp: DateTime<Utc>,
    pub step: Option<u32>,
    pub event_type: EpisodeEventType,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeEventType {
    EpisodeStarted,
    ModelCalled,
    StepCompleted,
    EpisodeFinished,
}
