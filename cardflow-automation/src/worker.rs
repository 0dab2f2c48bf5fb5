//! Worker service interface.
//!
//! Workers are external asynchronous agents. The engine spawns them with a
//! prompt, learns about their progress from a status-change feed, and reads
//! the result of a finished worker through [`WorkerService::completed_worker`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// Error Types
// ============================================================================

/// Worker service errors.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The service refused to spawn a worker.
    #[error("Spawn failed: {0}")]
    Spawn(String),

    /// The service is not reachable.
    #[error("Worker service unavailable: {0}")]
    Unavailable(String),

    /// Looking up a worker's result failed.
    #[error("Lookup failed: {0}")]
    Lookup(String),
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

// ============================================================================
// Status Feed
// ============================================================================

/// Lifecycle status reported by the worker service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Spawning,
    Running,
    Sleeping,
    Error,
    Terminated,
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Error,
}

/// One entry of the status-change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusChange {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub previous: WorkerStatus,
}

impl WorkerStatusChange {
    pub fn new(worker_id: impl Into<String>, previous: WorkerStatus, status: WorkerStatus) -> Self {
        Self {
            worker_id: worker_id.into(),
            status,
            previous,
        }
    }

    /// Completion carried by this transition, if any.
    ///
    /// Only `running → sleeping` (success) and `running → error` (error) count.
    pub fn completion(&self) -> Option<Completion> {
        match (self.previous, self.status) {
            (WorkerStatus::Running, WorkerStatus::Sleeping) => Some(Completion::Success),
            (WorkerStatus::Running, WorkerStatus::Error) => Some(Completion::Error),
            _ => None,
        }
    }
}

// ============================================================================
// Requests and Reports
// ============================================================================

/// Role a spawned worker plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Execution,
    Evaluation,
}

/// Spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub role: WorkerRole,
    /// Configured worker (agent) to run
    pub agent_id: String,
    pub prompt: String,
    pub card_id: String,
    pub board_id: String,
}

/// Result of a finished worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

// ============================================================================
// Service Trait
// ============================================================================

/// External worker service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerService: Send + Sync {
    /// Spawn a worker and return its ID.
    async fn spawn(&self, request: SpawnRequest) -> WorkerResult<String>;

    /// Result of a finished worker, `None` when the service has no record.
    async fn completed_worker(&self, worker_id: &str) -> WorkerResult<Option<WorkerReport>>;

    /// Subscribe to status changes.
    fn subscribe(&self) -> broadcast::Receiver<WorkerStatusChange>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use super::WorkerStatus::*;

    #[test_case(Running, Sleeping => Some(Completion::Success) ; "running to sleeping")]
    #[test_case(Running, Error => Some(Completion::Error) ; "running to error")]
    #[test_case(Spawning, Running => None ; "started")]
    #[test_case(Spawning, Error => None ; "failed before running")]
    #[test_case(Sleeping, Running => None ; "woken")]
    #[test_case(Running, Terminated => None ; "terminated")]
    fn test_completion(previous: WorkerStatus, status: WorkerStatus) -> Option<Completion> {
        WorkerStatusChange::new("w", previous, status).completion()
    }

    #[test]
    fn test_report_defaults() {
        let report: WorkerReport = serde_json::from_value(serde_json::json!({"summary": "ok"})).unwrap();
        assert_eq!(report.summary, "ok");
        assert!(report.files_modified.is_empty());
    }
}
