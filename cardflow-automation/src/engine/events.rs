//! Observer notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a card's automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AutomationEventKind {
    /// Execution worker spawned.
    Started { worker_id: String, attempt: u32 },
    /// Evaluation worker spawned.
    Evaluating { worker_id: String },
    /// Evaluation passed; `moved_to` is the next state, if any.
    Succeeded { moved_to: Option<String> },
    /// Execution or evaluation failed.
    Failed { reason: String },
    /// Retries exhausted.
    Stuck { attempts: u32, max_retries: u32 },
}

/// Event sent to engine subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationEvent {
    pub card_id: String,
    pub board_id: String,
    pub kind: AutomationEventKind,
    pub timestamp: DateTime<Utc>,
}

impl AutomationEvent {
    pub fn new(card_id: impl Into<String>, board_id: impl Into<String>, kind: AutomationEventKind) -> Self {
        Self {
            card_id: card_id.into(),
            board_id: board_id.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}
