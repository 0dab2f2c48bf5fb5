//! Board definition: pipeline states, swimlanes, labels and automation settings.

use serde::{Deserialize, Serialize};

/// A named pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardState {
    /// State ID
    pub id: String,

    /// Display name
    pub name: String,

    /// Position in the pipeline (ascending)
    #[serde(default)]
    pub order: i32,

    /// Cards entering this state are handed to an execution worker
    #[serde(default)]
    pub is_automatic: bool,

    /// Instructions given to the execution worker
    #[serde(default)]
    pub execution_prompt: String,

    /// Instructions given to the evaluation worker (falls back to the execution prompt)
    #[serde(default)]
    pub evaluation_prompt: String,

    /// Maximum number of cards the state should hold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<u32>,
}

impl BoardState {
    /// Create a manual state.
    pub fn new(id: impl Into<String>, name: impl Into<String>, order: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order,
            is_automatic: false,
            execution_prompt: String::new(),
            evaluation_prompt: String::new(),
            wip_limit: None,
        }
    }

    /// Mark the state automatic with the given execution prompt.
    pub fn automatic(mut self, execution_prompt: impl Into<String>) -> Self {
        self.is_automatic = true;
        self.execution_prompt = execution_prompt.into();
        self
    }

    /// Set the evaluation prompt.
    pub fn with_evaluation_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.evaluation_prompt = prompt.into();
        self
    }

    /// Evaluation instructions, or the execution prompt when none are set.
    pub fn effective_evaluation_prompt(&self) -> &str {
        if self.evaluation_prompt.trim().is_empty() {
            &self.execution_prompt
        } else {
            &self.evaluation_prompt
        }
    }
}

/// A horizontal grouping of cards with the workers responsible for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swimlane {
    /// Swimlane ID
    pub id: String,

    /// Display name
    pub name: String,

    /// Position on the board (ascending)
    #[serde(default)]
    pub order: i32,

    /// Worker spawned for execution
    #[serde(default)]
    pub manager_worker_id: Option<String>,

    /// Worker spawned for evaluation (defaults to the manager)
    #[serde(default)]
    pub evaluation_worker_id: Option<String>,
}

impl Swimlane {
    pub fn new(id: impl Into<String>, name: impl Into<String>, order: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order,
            manager_worker_id: None,
            evaluation_worker_id: None,
        }
    }

    pub fn with_manager(mut self, worker_id: impl Into<String>) -> Self {
        self.manager_worker_id = Some(worker_id.into());
        self
    }

    pub fn with_evaluator(mut self, worker_id: impl Into<String>) -> Self {
        self.evaluation_worker_id = Some(worker_id.into());
        self
    }

    /// Manager worker, ignoring blank values.
    pub fn manager(&self) -> Option<&str> {
        self.manager_worker_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }

    /// Worker that evaluates execution results.
    pub fn evaluator(&self) -> Option<&str> {
        self.evaluation_worker_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.manager())
    }
}

/// Card label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Board-wide automation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardConfig {
    /// Attempts allowed per state before a card is stuck
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Record card changes in git history
    #[serde(default)]
    pub git_history: bool,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            git_history: false,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// A board document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    /// Board ID
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Pipeline states
    #[serde(default)]
    pub states: Vec<BoardState>,

    /// Swimlanes
    #[serde(default)]
    pub swimlanes: Vec<Swimlane>,

    /// Labels
    #[serde(default)]
    pub labels: Vec<Label>,

    /// Automation settings
    #[serde(default)]
    pub config: BoardConfig,
}

impl Board {
    /// Create an empty board.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            states: Vec::new(),
            swimlanes: Vec::new(),
            labels: Vec::new(),
            config: BoardConfig::default(),
        }
    }

    pub fn with_state(mut self, state: BoardState) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_swimlane(mut self, swimlane: Swimlane) -> Self {
        self.swimlanes.push(swimlane);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn state(&self, id: &str) -> Option<&BoardState> {
        self.states.iter().find(|s| s.id == id)
    }

    pub fn swimlane(&self, id: &str) -> Option<&Swimlane> {
        self.swimlanes.iter().find(|s| s.id == id)
    }

    /// States sorted by `order`; equal orders keep their stored sequence.
    pub fn ordered_states(&self) -> Vec<&BoardState> {
        let mut states: Vec<&BoardState> = self.states.iter().collect();
        states.sort_by_key(|s| s.order);
        states
    }

    /// First state of the pipeline.
    pub fn first_state(&self) -> Option<&BoardState> {
        self.ordered_states().into_iter().next()
    }

    /// State following `state_id` in pipeline order, if any.
    pub fn next_state(&self, state_id: &str) -> Option<&BoardState> {
        let ordered = self.ordered_states();
        let position = ordered.iter().position(|s| s.id == state_id)?;
        ordered.get(position + 1).copied()
    }

    /// First swimlane by order.
    pub fn first_swimlane(&self) -> Option<&Swimlane> {
        self.swimlanes.iter().min_by_key(|s| s.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> Board {
        Board::new("b1", "Board")
            .with_state(BoardState::new("done", "Done", 30))
            .with_state(BoardState::new("todo", "Todo", 10))
            .with_state(BoardState::new("review", "Review", 20).automatic("Review the change"))
    }

    #[test]
    fn test_next_state_follows_order() {
        let board = board();
        assert_eq!(board.next_state("todo").map(|s| s.id.as_str()), Some("review"));
        assert_eq!(board.next_state("review").map(|s| s.id.as_str()), Some("done"));
        assert!(board.next_state("done").is_none());
        assert!(board.next_state("missing").is_none());
        assert_eq!(board.first_state().map(|s| s.id.as_str()), Some("todo"));
    }

    #[test]
    fn test_evaluation_prompt_fallback() {
        let state = BoardState::new("s", "S", 0).automatic("Do the work");
        assert_eq!(state.effective_evaluation_prompt(), "Do the work");

        let state = state.with_evaluation_prompt("Check the work");
        assert_eq!(state.effective_evaluation_prompt(), "Check the work");
    }

    #[test]
    fn test_swimlane_workers() {
        let lane = Swimlane::new("l", "Lane", 0);
        assert!(lane.manager().is_none());
        assert!(lane.evaluator().is_none());

        let lane = lane.with_manager("builder");
        assert_eq!(lane.evaluator(), Some("builder"));

        let lane = lane.with_evaluator("reviewer");
        assert_eq!(lane.manager(), Some("builder"));
        assert_eq!(lane.evaluator(), Some("reviewer"));

        let blank = Swimlane::new("l", "Lane", 0).with_manager("  ");
        assert!(blank.manager().is_none());
    }

    #[test]
    fn test_deserialize_camel_case() {
        let board: Board = serde_json::from_value(serde_json::json!({
            "id": "b1",
            "states": [{"id": "s1", "name": "Build", "order": 1, "isAutomatic": true,
                        "executionPrompt": "build it", "wipLimit": 2}],
            "swimlanes": [{"id": "l1", "name": "Main", "managerWorkerId": "w"}],
            "config": {"maxRetries": 5, "gitHistory": true}
        }))
        .unwrap();

        assert!(board.states[0].is_automatic);
        assert_eq!(board.states[0].wip_limit, Some(2));
        assert_eq!(board.swimlanes[0].manager(), Some("w"));
        assert_eq!(board.config.max_retries, 5);
        assert!(board.config.git_history);
    }
}
