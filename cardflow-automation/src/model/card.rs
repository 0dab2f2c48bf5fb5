//! Cards, their append-only history and the status derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Card priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Kind of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryAction {
    Created,
    Edited,
    Moved,
    AutomationStarted,
    AutomationSucceeded,
    AutomationFailed,
    AutomationStuck,
    RetriesCleared,
}

impl HistoryAction {
    /// Whether this entry decides the derived status when scanning backwards.
    pub const fn is_lifecycle(self) -> bool {
        !matches!(self, Self::Created | Self::Edited)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Edited => "edited",
            Self::Moved => "moved",
            Self::AutomationStarted => "automation-started",
            Self::AutomationSucceeded => "automation-succeeded",
            Self::AutomationFailed => "automation-failed",
            Self::AutomationStuck => "automation-stuck",
            Self::RetriesCleared => "retries-cleared",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of card history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction, detail: impl Into<String>) -> Self {
        Self {
            action,
            timestamp: Utc::now(),
            detail: detail.into(),
            worker_id: None,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Status derived from the tail of a card's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    /// No automation in flight and retries not exhausted.
    Idle,
    /// An automation run was started and has not concluded.
    Automating,
    /// Retries exhausted; needs a move or a retry clear.
    Stuck,
}

/// Derive the status from history by scanning back to the first lifecycle entry.
pub fn derive_status(history: &[HistoryEntry]) -> CardStatus {
    let decisive = history
        .iter()
        .rev()
        .map(|entry| entry.action)
        .find(|action| action.is_lifecycle());

    match decisive {
        Some(HistoryAction::AutomationStuck) => CardStatus::Stuck,
        Some(HistoryAction::AutomationStarted) => CardStatus::Automating,
        _ => CardStatus::Idle,
    }
}

/// A unit of work moving through board states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    /// Card ID (immutable)
    pub id: String,

    /// Owning board (immutable)
    pub board_id: String,

    pub title: String,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub priority: Priority,

    /// Label IDs
    #[serde(default)]
    pub labels: BTreeSet<String>,

    /// Current state
    pub state_id: String,

    /// Current swimlane
    pub swimlane_id: String,

    /// Append-only history
    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    /// Automation attempts spent in the current state
    #[serde(default)]
    pub automation_attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// Create a card with a fresh ID and a `created` history entry.
    pub fn new(
        board_id: impl Into<String>,
        title: impl Into<String>,
        state_id: impl Into<String>,
        swimlane_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut card = Self {
            id: uuid::Uuid::new_v4().to_string(),
            board_id: board_id.into(),
            title: title.into(),
            body: String::new(),
            priority: Priority::default(),
            labels: BTreeSet::new(),
            state_id: state_id.into(),
            swimlane_id: swimlane_id.into(),
            history: Vec::new(),
            automation_attempts: 0,
            created_at: now,
            updated_at: now,
        };
        card.record(HistoryEntry::new(HistoryAction::Created, "Card created"));
        card
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a history entry and bump `updated_at`.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.updated_at = entry.timestamp;
        self.history.push(entry);
    }

    pub fn status(&self) -> CardStatus {
        derive_status(&self.history)
    }

    pub fn is_stuck(&self) -> bool {
        self.status() == CardStatus::Stuck
    }

    pub fn is_automating(&self) -> bool {
        self.status() == CardStatus::Automating
    }

    /// Most recent history entry.
    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Actions in history order, for assertions and display.
    pub fn actions(&self) -> Vec<HistoryAction> {
        self.history.iter().map(|entry| entry.action).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use super::HistoryAction::*;

    fn history(actions: &[HistoryAction]) -> Vec<HistoryEntry> {
        actions
            .iter()
            .map(|action| HistoryEntry::new(*action, ""))
            .collect()
    }

    #[test_case(&[] => CardStatus::Idle ; "empty history")]
    #[test_case(&[Created] => CardStatus::Idle ; "only created")]
    #[test_case(&[Created, AutomationStarted] => CardStatus::Automating ; "started")]
    #[test_case(&[AutomationStarted, Edited] => CardStatus::Automating ; "edit does not decide")]
    #[test_case(&[AutomationStarted, AutomationFailed] => CardStatus::Idle ; "failed concludes run")]
    #[test_case(&[AutomationStarted, AutomationSucceeded] => CardStatus::Idle ; "succeeded concludes run")]
    #[test_case(&[AutomationStarted, AutomationFailed, AutomationStuck] => CardStatus::Stuck ; "stuck")]
    #[test_case(&[AutomationStuck, Edited, Created] => CardStatus::Stuck ; "stuck survives edits")]
    #[test_case(&[AutomationStuck, Moved] => CardStatus::Idle ; "move clears stuck")]
    #[test_case(&[AutomationStarted, Moved] => CardStatus::Idle ; "move clears automating")]
    #[test_case(&[AutomationStuck, RetriesCleared] => CardStatus::Idle ; "retry clear clears stuck")]
    #[test_case(&[AutomationStuck, RetriesCleared, AutomationStarted] => CardStatus::Automating ; "retry after clear")]
    fn test_derive_status(actions: &[HistoryAction]) -> CardStatus {
        derive_status(&history(actions))
    }

    #[test]
    fn test_new_card_records_creation() {
        let card = Card::new("b1", "Write docs", "todo", "lane");
        assert_eq!(card.actions(), vec![Created]);
        assert_eq!(card.automation_attempts, 0);
        assert_eq!(card.status(), CardStatus::Idle);
        assert!(!card.id.is_empty());
    }

    #[test]
    fn test_record_updates_timestamp() {
        let mut card = Card::new("b1", "Write docs", "todo", "lane");
        let entry = HistoryEntry::new(AutomationStarted, "attempt 1").with_worker("w-1");
        let at = entry.timestamp;
        card.record(entry);

        assert_eq!(card.updated_at, at);
        assert!(card.is_automating());
        assert_eq!(card.last_entry().and_then(|e| e.worker_id.as_deref()), Some("w-1"));
    }

    #[test]
    fn test_history_action_wire_names() {
        let json = serde_json::to_value(AutomationSucceeded).unwrap();
        assert_eq!(json, serde_json::json!("automation-succeeded"));
        assert_eq!(RetriesCleared.to_string(), "retries-cleared");

        let parsed: HistoryAction = serde_json::from_value(serde_json::json!("automation-stuck")).unwrap();
        assert_eq!(parsed, AutomationStuck);
    }
}
