//! Host-side board and card operations.
//!
//! Every change goes through the mutation queue, so UI moves, retry clears and
//! the automation engine can update the same card list concurrently without
//! losing each other's writes.

use crate::engine::{AutomationEngine, TriggerOutcome};
use crate::error::{AutomationError, Result};
use crate::model::{Board, Card, HistoryAction, HistoryEntry, Priority, StorageKeys};
use crate::queue::MutationQueue;
use crate::store::KvStore;
use cardflow_common::config::AutomationConfig;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Apply `apply` to one card of a stored card list and return the result.
pub(crate) async fn update_card<F>(
    queue: &MutationQueue,
    store: &dyn KvStore,
    key: &str,
    card_id: &str,
    apply: F,
) -> Result<Card>
where
    F: FnOnce(&mut Card) -> Result<()>,
{
    let mut updated = None;
    queue
        .mutate(store, key, |mut cards: Vec<Card>| {
            let card = cards
                .iter_mut()
                .find(|c| c.id == card_id)
                .ok_or_else(|| AutomationError::not_found("Card", card_id))?;
            apply(card)?;
            updated = Some(card.clone());
            Ok::<_, AutomationError>(cards)
        })
        .await?;

    updated.ok_or_else(|| AutomationError::not_found("Card", card_id))
}

/// Fields of a card edit. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct CardEdit {
    pub title: Option<String>,
    pub body: Option<String>,
    pub priority: Option<Priority>,
    pub labels: Option<BTreeSet<String>>,
}

impl CardEdit {
    fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.priority.is_none() && self.labels.is_none()
    }
}

/// Board and card operations for hosts.
pub struct BoardService {
    store: Arc<dyn KvStore>,
    queue: Arc<MutationQueue>,
    engine: Arc<AutomationEngine>,
    keys: StorageKeys,
    default_max_retries: u32,
}

impl BoardService {
    pub fn new(
        store: Arc<dyn KvStore>,
        queue: Arc<MutationQueue>,
        engine: Arc<AutomationEngine>,
        config: &AutomationConfig,
    ) -> Self {
        Self {
            store,
            queue,
            engine,
            keys: StorageKeys::from_config(config),
            default_max_retries: config.default_max_retries,
        }
    }

    pub fn engine(&self) -> &Arc<AutomationEngine> {
        &self.engine
    }

    // ========================================================================
    // Boards
    // ========================================================================

    /// Create a board with the configured default retry budget.
    pub async fn create_board(&self, name: impl Into<String>) -> Result<Board> {
        let mut board = Board::new(uuid::Uuid::new_v4().to_string(), name);
        board.config.max_retries = self.default_max_retries;
        self.save_board(board).await
    }

    /// Insert or replace a board document.
    pub async fn save_board(&self, board: Board) -> Result<Board> {
        validate_board(&board)?;
        let saved = board.clone();
        self.queue
            .mutate(self.store.as_ref(), self.keys.boards(), |mut boards: Vec<Board>| {
                match boards.iter_mut().find(|b| b.id == board.id) {
                    Some(existing) => *existing = board,
                    None => boards.push(board),
                }
                Ok::<_, AutomationError>(boards)
            })
            .await?;

        tracing::debug!(board_id = %saved.id, "Board saved");
        Ok(saved)
    }

    /// Change a stored board in place.
    pub async fn update_board<F>(&self, board_id: &str, apply: F) -> Result<Board>
    where
        F: FnOnce(&mut Board),
    {
        let mut updated = None;
        self.queue
            .mutate(self.store.as_ref(), self.keys.boards(), |mut boards: Vec<Board>| {
                let board = boards
                    .iter_mut()
                    .find(|b| b.id == board_id)
                    .ok_or_else(|| AutomationError::not_found("Board", board_id))?;
                apply(board);
                validate_board(board)?;
                updated = Some(board.clone());
                Ok::<_, AutomationError>(boards)
            })
            .await?;

        updated.ok_or_else(|| AutomationError::not_found("Board", board_id))
    }

    pub async fn get_board(&self, board_id: &str) -> Result<Board> {
        self.list_boards()
            .await?
            .into_iter()
            .find(|b| b.id == board_id)
            .ok_or_else(|| AutomationError::not_found("Board", board_id))
    }

    pub async fn list_boards(&self) -> Result<Vec<Board>> {
        Ok(self.queue.snapshot(self.store.as_ref(), self.keys.boards()).await?)
    }

    /// Delete a board, its cards and their runs.
    pub async fn delete_board(&self, board_id: &str) -> Result<()> {
        self.queue
            .mutate(self.store.as_ref(), self.keys.boards(), |mut boards: Vec<Board>| {
                let before = boards.len();
                boards.retain(|b| b.id != board_id);
                if boards.len() == before {
                    return Err(AutomationError::not_found("Board", board_id));
                }
                Ok::<_, AutomationError>(boards)
            })
            .await?;

        let mut removed = Vec::new();
        self.queue
            .mutate(self.store.as_ref(), &self.keys.cards(board_id), |cards: Vec<Card>| {
                removed = cards;
                Ok::<_, AutomationError>(Vec::new())
            })
            .await?;
        for card in &removed {
            self.engine.cancel_run(&card.id).await?;
        }

        tracing::info!(board_id = %board_id, cards = removed.len(), "Board deleted");
        Ok(())
    }

    // ========================================================================
    // Cards
    // ========================================================================

    /// Create a card in the board's first state and swimlane.
    ///
    /// Creation never triggers automation; moving the card does.
    pub async fn create_card(
        &self,
        board_id: &str,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Card> {
        let board = self.get_board(board_id).await?;
        let state = board
            .first_state()
            .ok_or_else(|| AutomationError::InvalidInput(format!("Board {board_id} has no states")))?;
        let swimlane = board
            .first_swimlane()
            .ok_or_else(|| AutomationError::InvalidInput(format!("Board {board_id} has no swimlanes")))?;

        let title = title.into();
        if title.trim().is_empty() {
            return Err(AutomationError::InvalidInput("Card title is empty".into()));
        }

        let card = Card::new(&board.id, title, &state.id, &swimlane.id).with_body(body);
        let created = card.clone();
        self.queue
            .mutate(self.store.as_ref(), &self.keys.cards(board_id), |mut cards: Vec<Card>| {
                cards.push(card);
                Ok::<_, AutomationError>(cards)
            })
            .await?;

        tracing::debug!(board_id = %board_id, card_id = %created.id, "Card created");
        Ok(created)
    }

    pub async fn get_card(&self, board_id: &str, card_id: &str) -> Result<Card> {
        self.list_cards(board_id)
            .await?
            .into_iter()
            .find(|c| c.id == card_id)
            .ok_or_else(|| AutomationError::not_found("Card", card_id))
    }

    pub async fn list_cards(&self, board_id: &str) -> Result<Vec<Card>> {
        Ok(self
            .queue
            .snapshot(self.store.as_ref(), &self.keys.cards(board_id))
            .await?)
    }

    /// Edit card content and record an `edited` entry.
    pub async fn edit_card(&self, board_id: &str, card_id: &str, edit: CardEdit) -> Result<Card> {
        if edit.is_empty() {
            return self.get_card(board_id, card_id).await;
        }
        if edit.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(AutomationError::InvalidInput("Card title is empty".into()));
        }

        update_card(
            &self.queue,
            self.store.as_ref(),
            &self.keys.cards(board_id),
            card_id,
            |card| {
                let mut changed = Vec::new();
                if let Some(title) = edit.title {
                    card.title = title;
                    changed.push("title");
                }
                if let Some(body) = edit.body {
                    card.body = body;
                    changed.push("body");
                }
                if let Some(priority) = edit.priority {
                    card.priority = priority;
                    changed.push("priority");
                }
                if let Some(labels) = edit.labels {
                    card.labels = labels;
                    changed.push("labels");
                }
                card.record(HistoryEntry::new(
                    HistoryAction::Edited,
                    format!("Edited {}", changed.join(", ")),
                ));
                Ok(())
            },
        )
        .await
    }

    /// Delete a card and drop its run.
    pub async fn delete_card(&self, board_id: &str, card_id: &str) -> Result<()> {
        self.queue
            .mutate(self.store.as_ref(), &self.keys.cards(board_id), |mut cards: Vec<Card>| {
                let before = cards.len();
                cards.retain(|c| c.id != card_id);
                if cards.len() == before {
                    return Err(AutomationError::not_found("Card", card_id));
                }
                Ok::<_, AutomationError>(cards)
            })
            .await?;

        if self.engine.cancel_run(card_id).await?.is_some() {
            tracing::info!(card_id = %card_id, "Dropped run of deleted card");
        }
        Ok(())
    }

    /// Move a card and trigger automation when the destination is automatic.
    ///
    /// Changing state resets `automationAttempts`. `to_swimlane` keeps the
    /// current swimlane when `None`.
    pub async fn move_card(
        &self,
        board_id: &str,
        card_id: &str,
        to_state: &str,
        to_swimlane: Option<&str>,
    ) -> Result<(Card, TriggerOutcome)> {
        let board = self.get_board(board_id).await?;
        let target = board
            .state(to_state)
            .ok_or_else(|| AutomationError::not_found("State", to_state))?;
        if let Some(lane) = to_swimlane {
            board
                .swimlane(lane)
                .ok_or_else(|| AutomationError::not_found("Swimlane", lane))?;
        }

        let card = update_card(
            &self.queue,
            self.store.as_ref(),
            &self.keys.cards(board_id),
            card_id,
            |card| {
                let from = board
                    .state(&card.state_id)
                    .map_or(card.state_id.clone(), |s| s.name.clone());
                if card.state_id != target.id {
                    card.automation_attempts = 0;
                }
                card.state_id = target.id.clone();
                if let Some(lane) = to_swimlane {
                    card.swimlane_id = lane.to_string();
                }
                card.record(HistoryEntry::new(
                    HistoryAction::Moved,
                    format!("From {} to {}", from, target.name),
                ));
                Ok(())
            },
        )
        .await?;

        tracing::info!(card_id = %card.id, state_id = %card.state_id, "Card moved");
        let outcome = self.engine.trigger(&card, &board).await?;
        Ok((card, outcome))
    }

    /// Reset the retry budget, clearing `stuck`, and re-trigger if the state is automatic.
    pub async fn clear_retries(&self, board_id: &str, card_id: &str) -> Result<(Card, TriggerOutcome)> {
        let board = self.get_board(board_id).await?;
        let card = update_card(
            &self.queue,
            self.store.as_ref(),
            &self.keys.cards(board_id),
            card_id,
            |card| {
                card.automation_attempts = 0;
                card.record(HistoryEntry::new(HistoryAction::RetriesCleared, "Retries cleared"));
                Ok(())
            },
        )
        .await?;

        tracing::info!(card_id = %card.id, "Retries cleared");
        let outcome = self.engine.trigger(&card, &board).await?;
        Ok((card, outcome))
    }
}

fn validate_board(board: &Board) -> Result<()> {
    if board.id.trim().is_empty() {
        return Err(AutomationError::InvalidInput("Board id is empty".into()));
    }

    let mut seen = BTreeSet::new();
    for state in &board.states {
        if !seen.insert(state.id.as_str()) {
            return Err(AutomationError::InvalidInput(format!(
                "Duplicate state id: {}",
                state.id
            )));
        }
    }

    let mut seen = BTreeSet::new();
    for lane in &board.swimlanes {
        if !seen.insert(lane.id.as_str()) {
            return Err(AutomationError::InvalidInput(format!(
                "Duplicate swimlane id: {}",
                lane.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoardState, Swimlane};
    use crate::store::MemoryStore;
    use crate::worker::MockWorkerService;

    fn service(store: &MemoryStore) -> BoardService {
        let store: Arc<dyn KvStore> = Arc::new(store.clone());
        let queue = Arc::new(MutationQueue::new());
        let config = AutomationConfig::default();
        let engine = Arc::new(AutomationEngine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::new(MockWorkerService::new()),
            &config,
        ));
        BoardService::new(store, queue, engine, &config)
    }

    #[tokio::test]
    async fn test_update_board_validates_and_reports_missing() {
        let store = MemoryStore::new("test");
        let boards = service(&store);
        boards
            .save_board(Board::new("b1", "Board").with_state(BoardState::new("todo", "Todo", 0)))
            .await
            .unwrap();

        let renamed = boards.update_board("b1", |b| b.name = "Renamed".into()).await.unwrap();
        assert_eq!(renamed.name, "Renamed");

        let err = boards
            .update_board("b1", |b| b.states.push(BoardState::new("todo", "Again", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AutomationError::InvalidInput(_)));
        assert_eq!(boards.get_board("b1").await.unwrap().states.len(), 1);

        let err = boards.update_board("missing", |_| {}).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_card_writes_nothing_on_error() {
        let store = MemoryStore::new("test");
        let queue = MutationQueue::new();
        let card = Card::new("b1", "Title", "todo", "main");
        store
            .write("cards:b1", serde_json::to_value(vec![card.clone()]).unwrap())
            .await
            .unwrap();

        let err = update_card(&queue, &store, "cards:b1", &card.id, |c| {
            c.automation_attempts = 5;
            Err(AutomationError::InvalidInput("rejected".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AutomationError::InvalidInput(_)));

        let err = update_card(&queue, &store, "cards:b1", "missing", |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let updated = update_card(&queue, &store, "cards:b1", &card.id, |c| {
            c.automation_attempts += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(updated.automation_attempts, 1);
    }

    #[test]
    fn test_validate_board_rejects_duplicates() {
        let board = Board::new("b1", "Board")
            .with_state(BoardState::new("todo", "Todo", 0))
            .with_state(BoardState::new("todo", "Again", 1));
        assert!(validate_board(&board).is_err());

        let board = Board::new("b1", "Board")
            .with_swimlane(Swimlane::new("l", "Lane", 0))
            .with_swimlane(Swimlane::new("l", "Lane", 1));
        assert!(validate_board(&board).is_err());

        assert!(validate_board(&Board::new(" ", "Blank")).is_err());
        assert!(validate_board(&Board::new("b1", "Board")).is_ok());
    }

    #[test]
    fn test_card_edit_is_empty() {
        assert!(CardEdit::default().is_empty());
        let edit = CardEdit {
            priority: Some(Priority::High),
            ..CardEdit::default()
        };
        assert!(!edit.is_empty());
    }
}
