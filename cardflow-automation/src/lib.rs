//! Cardflow Automation - moves cards through automatic board states.
//!
//! This crate provides:
//! - A key-value store interface with memory and JSON file backends
//! - A per-(store, key) mutation queue for atomic read-modify-write
//! - The board, card and automation run data model
//! - The worker service interface
//! - The automation engine (execute, evaluate, retry, stuck)
//! - A board service for host-side board and card operations
//!
//! # Example
//!
//! ```no_run
//! use cardflow_automation::{open_store, AutomationEngine, BoardService, MutationQueue, WorkerService};
//! use cardflow_common::Config;
//! use std::sync::Arc;
//!
//! async fn run(workers: Arc<dyn WorkerService>) -> anyhow::Result<()> {
//!     let config = Config::load_with_env()?;
//!     let store = open_store(&config.storage).await?;
//!     let queue = Arc::new(MutationQueue::new());
//!
//!     let engine = Arc::new(AutomationEngine::new(
//!         Arc::clone(&store),
//!         Arc::clone(&queue),
//!         workers,
//!         &config.automation,
//!     ));
//!     engine.start().await?;
//!
//!     let boards = BoardService::new(store, queue, Arc::clone(&engine), &config.automation);
//!     let board = boards.create_board("Roadmap").await?;
//!     println!("created {}", board.id);
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod board;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod worker;

pub use board::{BoardService, CardEdit};
pub use engine::{AutomationEngine, AutomationEvent, AutomationEventKind, SkipReason, TriggerOutcome, Verdict};
pub use error::{AutomationError, Result};
pub use model::{
    AutomationRun, Board, BoardConfig, BoardState, Card, CardStatus, HistoryAction, HistoryEntry, Priority,
    RunPhase, StorageKeys, Swimlane,
};
pub use queue::MutationQueue;
pub use store::{open_store, JsonFileStore, KvStore, MemoryStore, StoreError, StoreId};
pub use worker::{
    Completion, SpawnRequest, WorkerError, WorkerReport, WorkerRole, WorkerService, WorkerStatus, WorkerStatusChange,
};
