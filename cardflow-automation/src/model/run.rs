//! In-flight automation runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of an automation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    /// Waiting for the execution worker.
    Executing,
    /// Waiting for the evaluation worker.
    Evaluating,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing => f.write_str("executing"),
            Self::Evaluating => f.write_str("evaluating"),
        }
    }
}

/// Record correlating a worker to the card it is working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRun {
    pub card_id: String,
    pub board_id: String,
    pub state_id: String,
    pub swimlane_id: String,
    pub execution_worker_id: String,
    #[serde(default)]
    pub evaluation_worker_id: Option<String>,
    #[serde(default)]
    pub configured_evaluation_worker_id: Option<String>,
    pub phase: RunPhase,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

impl AutomationRun {
    /// Worker whose completion the run is currently waiting for.
    pub fn awaited_worker(&self) -> &str {
        match self.phase {
            RunPhase::Executing => &self.execution_worker_id,
            RunPhase::Evaluating => self
                .evaluation_worker_id
                .as_deref()
                .unwrap_or(&self.execution_worker_id),
        }
    }

    /// Whether a completion from `worker_id` belongs to this run's current phase.
    pub fn awaits(&self, worker_id: &str, phase: RunPhase) -> bool {
        self.phase == phase
            && match phase {
                RunPhase::Executing => self.execution_worker_id == worker_id,
                RunPhase::Evaluating => self.evaluation_worker_id.as_deref() == Some(worker_id),
            }
    }

    /// Routing entry for the awaited worker.
    pub fn route(&self) -> RunRoute {
        RunRoute {
            card_id: self.card_id.clone(),
            board_id: self.board_id.clone(),
            phase: self.phase,
        }
    }
}

/// Where a worker's completion event should be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRoute {
    pub card_id: String,
    pub board_id: String,
    pub phase: RunPhase,
}
