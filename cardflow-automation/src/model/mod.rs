//! Persisted documents: boards, cards and automation runs.
//!
//! All of them are stored as JSON lists and only changed through the
//! mutation queue:
//!
//! | Key | Contents |
//! |-----|----------|
//! | `boards` | every [`Board`] |
//! | `cards:{board_id}` | the [`Card`]s of one board |
//! | `automation-runs` | every in-flight [`AutomationRun`] |

pub mod board;
pub mod card;
pub mod run;

pub use board::{Board, BoardConfig, BoardState, Label, Swimlane};
pub use card::{derive_status, Card, CardStatus, HistoryAction, HistoryEntry, Priority};
pub use run::{AutomationRun, RunPhase, RunRoute};

use cardflow_common::config::AutomationConfig;

/// Storage key conventions.
#[derive(Debug, Clone)]
pub struct StorageKeys {
    runs: String,
    boards: String,
    cards_prefix: String,
}

impl StorageKeys {
    pub fn from_config(config: &AutomationConfig) -> Self {
        Self {
            runs: config.runs_key.clone(),
            boards: config.boards_key.clone(),
            cards_prefix: config.cards_key_prefix.clone(),
        }
    }

    /// Fixed key of the automation run list.
    pub fn runs(&self) -> &str {
        &self.runs
    }

    /// Key of the board list.
    pub fn boards(&self) -> &str {
        &self.boards
    }

    /// Per-board key of the card list.
    pub fn cards(&self, board_id: &str) -> String {
        format!("{}:{}", self.cards_prefix, board_id)
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::from_config(&AutomationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keys() {
        let keys = StorageKeys::default();
        assert_eq!(keys.runs(), "automation-runs");
        assert_eq!(keys.boards(), "boards");
        assert_eq!(keys.cards("b1"), "cards:b1");
    }
}
