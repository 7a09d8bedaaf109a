use serde::{Deserialize, Serialize};

use crate::artifacts::GeneratedArtifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Queued,
    Executing,
    Finalizing,
    Completed,
    Failed,
    Interrupted,
    Disconnected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Interrupted | Self::Disconnected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Snapshot of a running generation. A new value replaces the previous one on
/// every relevant event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub correlation_id: String,
    pub current_node_id: Option<String>,
    pub step: u32,
    pub max_steps: u32,
    pub queue_position: Option<u32>,
    pub message: String,
}

impl ProgressState {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            current_node_id: None,
            step: 0,
            max_steps: 0,
            queue_position: None,
            message: "waiting for engine".to_string(),
        }
    }

    /// Step progress of the current node in `0.0..=1.0`, when known.
    pub fn fraction(&self) -> Option<f64> {
        if self.max_steps == 0 {
            return None;
        }
        Some((f64::from(self.step) / f64::from(self.max_steps)).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed { artifacts: Vec<GeneratedArtifact> },
    Failed { node_id: Option<String>, message: String },
    Interrupted,
    Disconnected { message: String },
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Completed { .. } => SessionState::Completed,
            Self::Failed { .. } => SessionState::Failed,
            Self::Interrupted => SessionState::Interrupted,
            Self::Disconnected { .. } => SessionState::Disconnected,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
