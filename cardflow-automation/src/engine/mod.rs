//! Automation engine.
//!
//! Drives cards in automatic states through a two-phase run:
//!
//! ```text
//! trigger ──spawn──▶ executing ──success──▶ evaluating ──PASS──▶ next state (chain)
//!                        │                      │
//!                        └──error──▶ failed ◀───┴──FAIL──▶ retry while attempts < max
//!                                      │
//!                                      └──attempts >= max──▶ stuck
//! ```
//!
//! The engine owns one subscription to the worker status feed. Each
//! completion is handled on its own task; follow-up triggers (retries and
//! chaining into the next automatic state) are drained from a work queue on
//! that task instead of recursing. Every change to runs and cards goes
//! through the [`MutationQueue`] and re-reads the stored value inside the
//! updater.
//!
//! # Concurrency
//!
//! Work on one card is serialized by a per-card lock: a trigger holds it from
//! the run check until the attempt is recorded, and a completion handler holds
//! it while it runs. Spawning a worker and registering its route happen under
//! a shared spawn gate. A completion whose worker is not routed yet takes the
//! gate exclusively, which waits out every spawn in progress, and looks again.

pub mod events;
pub mod prompt;
pub mod registry;

pub use events::{AutomationEvent, AutomationEventKind};
pub use prompt::{build_evaluation_prompt, build_execution_prompt, Verdict};
pub use registry::RunRegistry;

use crate::board::update_card;
use crate::error::{AutomationError, Result};
use crate::model::{
    AutomationRun, Board, BoardState, Card, HistoryAction, HistoryEntry, RunPhase, RunRoute,
    StorageKeys,
};
use crate::queue::MutationQueue;
use crate::store::KvStore;
use crate::worker::{Completion, SpawnRequest, WorkerReport, WorkerRole, WorkerService, WorkerStatusChange};
use cardflow_common::config::AutomationConfig;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

/// Why a trigger did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The engine is not listening for completions.
    EngineStopped,
    /// The card's state is not on the board.
    UnknownState,
    /// The card's state is not automatic.
    ManualState,
    /// The card's swimlane is not on the board.
    UnknownSwimlane,
    /// The swimlane has no manager worker.
    NoManager,
    /// `automationAttempts` reached the board's `maxRetries`.
    RetriesExhausted,
    /// The card already has a run.
    AlreadyRunning,
}

/// Result of [`AutomationEngine::trigger`].
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// An execution worker was spawned and the run recorded.
    Started(AutomationRun),
    /// A precondition did not hold.
    Skipped(SkipReason),
    /// The worker service refused the spawn. No attempt was counted.
    SpawnFailed(String),
}

impl TriggerOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

/// Unit of work drained by a completion task.
enum Step {
    Completion(WorkerStatusChange, Completion),
    Trigger { card: Card, board: Board },
}

struct Listener {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Card automation engine with a start/stop lifecycle.
pub struct AutomationEngine {
    core: Arc<EngineCore>,
    listener: Mutex<Option<Listener>>,
}

impl AutomationEngine {
    /// Create a stopped engine.
    pub fn new(
        store: Arc<dyn KvStore>,
        queue: Arc<MutationQueue>,
        workers: Arc<dyn WorkerService>,
        config: &AutomationConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let keys = StorageKeys::from_config(config);
        let runs = RunRegistry::new(Arc::clone(&store), Arc::clone(&queue), keys.runs());

        Self {
            core: Arc::new(EngineCore {
                store,
                queue,
                workers,
                keys,
                runs,
                events,
                running: AtomicBool::new(false),
                card_locks: CardLocks::default(),
                spawn_gate: RwLock::new(()),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Restore run routing from storage and start listening for completions.
    ///
    /// Calling `start` on a running engine does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            tracing::debug!("Automation engine already started");
            return Ok(());
        }

        let restored = self.core.runs.load().await?;

        // Subscribe before returning so no completion after `start` is missed
        let mut feed = self.core.workers.subscribe();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let core = Arc::clone(&self.core);
        core.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Automation engine shutting down");
                        break;
                    }
                    received = feed.recv() => {
                        match received {
                            Ok(change) => {
                                let Some(completion) = change.completion() else {
                                    continue;
                                };
                                let core = Arc::clone(&core);
                                tokio::spawn(async move {
                                    core.drain(Step::Completion(change, completion)).await;
                                });
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped = skipped, "Worker status feed lagged, completions were dropped");
                            }
                            Err(RecvError::Closed) => {
                                tracing::warn!("Worker status feed closed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        *listener = Some(Listener { shutdown_tx, handle });
        tracing::info!(restored_runs = restored, "Automation engine started");
        Ok(())
    }

    /// Dispose the subscription.
    ///
    /// Completions already being handled finish normally, including the retry
    /// or chained trigger they produce.
    pub async fn stop(&self) {
        self.core.running.store(false, Ordering::SeqCst);

        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };
        let _ = listener.shutdown_tx.send(()).await;
        if let Err(e) = listener.handle.await {
            tracing::warn!(error = %e, "Automation listener ended abnormally");
        }
        tracing::info!("Automation engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Subscribe to automation events.
    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.core.events.subscribe()
    }

    /// Start automation for a card in its current state.
    ///
    /// Unmet preconditions are not errors: they return [`TriggerOutcome::Skipped`].
    pub async fn trigger(&self, card: &Card, board: &Board) -> Result<TriggerOutcome> {
        if !self.is_running() {
            return Ok(skipped(card, SkipReason::EngineStopped));
        }
        self.core.trigger(card, board).await
    }

    /// Every in-flight run.
    pub async fn active_runs(&self) -> Result<Vec<AutomationRun>> {
        self.core.runs.all().await
    }

    /// The in-flight run of a card.
    pub async fn run_for_card(&self, card_id: &str) -> Result<Option<AutomationRun>> {
        self.core.runs.for_card(card_id).await
    }

    /// Drop the in-flight run of a card. Its worker's completion is then ignored.
    pub async fn cancel_run(&self, card_id: &str) -> Result<Option<AutomationRun>> {
        self.core.runs.discard_for_card(card_id).await
    }
}

struct EngineCore {
    store: Arc<dyn KvStore>,
    queue: Arc<MutationQueue>,
    workers: Arc<dyn WorkerService>,
    keys: StorageKeys,
    runs: RunRegistry,
    events: broadcast::Sender<AutomationEvent>,
    running: AtomicBool,
    card_locks: CardLocks,
    spawn_gate: RwLock<()>,
}

/// Per-card async locks, reclaimed once nobody holds or waits on them.
#[derive(Default)]
struct CardLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

struct CardGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    card_id: String,
    _held: OwnedMutexGuard<()>,
}

impl CardLocks {
    async fn lock(&self, card_id: &str) -> CardGuard<'_> {
        let lock = Arc::clone(self.locks.entry(card_id.to_string()).or_default().value());
        CardGuard {
            locks: &self.locks,
            card_id: card_id.to_string(),
            _held: lock.lock_owned().await,
        }
    }
}

impl Drop for CardGuard<'_> {
    fn drop(&mut self) {
        // Map + this guard are the only owners left.
        self.locks
            .remove_if(&self.card_id, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

impl EngineCore {
    /// Run `first` and every follow-up it produces.
    async fn drain(&self, first: Step) {
        let mut pending = VecDeque::from([first]);

        while let Some(step) = pending.pop_front() {
            match step {
                Step::Completion(change, completion) => {
                    match self.handle_completion(&change, completion).await {
                        Ok(Some(next)) => pending.push_back(next),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(
                                worker_id = %change.worker_id,
                                error = %e,
                                "Failed to handle worker completion"
                            );
                        }
                    }
                }
                Step::Trigger { card, board } => {
                    if let Err(e) = self.trigger(&card, &board).await {
                        tracing::error!(card_id = %card.id, error = %e, "Automation trigger failed");
                    }
                }
            }
        }
    }

    /// Trigger without the stopped check. Follow-ups drained from a completion
    /// come here directly so in-flight work finishes after `stop`.
    async fn trigger(&self, card: &Card, board: &Board) -> Result<TriggerOutcome> {
        let Some(state) = board.state(&card.state_id) else {
            return Ok(skipped(card, SkipReason::UnknownState));
        };
        if !state.is_automatic {
            return Ok(skipped(card, SkipReason::ManualState));
        }
        let Some(swimlane) = board.swimlane(&card.swimlane_id) else {
            return Ok(skipped(card, SkipReason::UnknownSwimlane));
        };
        let Some(manager) = swimlane.manager() else {
            return Ok(skipped(card, SkipReason::NoManager));
        };
        if card.automation_attempts >= board.config.max_retries {
            return Ok(skipped(card, SkipReason::RetriesExhausted));
        }

        let _locked = self.card_locks.lock(&card.id).await;
        if self.runs.for_card(&card.id).await?.is_some() {
            return Ok(skipped(card, SkipReason::AlreadyRunning));
        }

        let gate = self.spawn_gate.read().await;

        let request = SpawnRequest {
            role: WorkerRole::Execution,
            agent_id: manager.to_string(),
            prompt: build_execution_prompt(state, card),
            card_id: card.id.clone(),
            board_id: board.id.clone(),
        };
        let worker_id = match self.workers.spawn(request).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    card_id = %card.id,
                    state_id = %state.id,
                    error = %e,
                    "Failed to spawn execution worker"
                );
                return Ok(TriggerOutcome::SpawnFailed(e.to_string()));
            }
        };

        let run = AutomationRun {
            card_id: card.id.clone(),
            board_id: board.id.clone(),
            state_id: state.id.clone(),
            swimlane_id: swimlane.id.clone(),
            execution_worker_id: worker_id.clone(),
            evaluation_worker_id: None,
            configured_evaluation_worker_id: swimlane.evaluator().map(str::to_string),
            phase: RunPhase::Executing,
            attempt: card.automation_attempts + 1,
            started_at: Utc::now(),
        };
        match self.runs.insert(run.clone()).await {
            Ok(()) => {}
            Err(AutomationError::RunAlreadyActive { .. }) => {
                tracing::warn!(
                    card_id = %card.id,
                    worker_id = %worker_id,
                    "Card gained a run while spawning, new worker is left unrouted"
                );
                return Ok(skipped(card, SkipReason::AlreadyRunning));
            }
            Err(e) => return Err(e),
        }
        drop(gate);

        let recorded = update_card(
            &self.queue,
            self.store.as_ref(),
            &self.keys.cards(&board.id),
            &card.id,
            |stored| {
                stored.automation_attempts += 1;
                stored.record(
                    HistoryEntry::new(
                        HistoryAction::AutomationStarted,
                        format!("Attempt {} in {}", stored.automation_attempts, state.name),
                    )
                    .with_worker(&worker_id),
                );
                Ok(())
            },
        )
        .await;
        if let Err(e) = recorded {
            self.runs.discard_for_card(&card.id).await?;
            return Err(e);
        }

        tracing::info!(
            card_id = %card.id,
            state_id = %state.id,
            worker_id = %worker_id,
            attempt = run.attempt,
            "Automation started"
        );
        self.emit(
            &run.card_id,
            &run.board_id,
            AutomationEventKind::Started {
                worker_id,
                attempt: run.attempt,
            },
        );
        Ok(TriggerOutcome::Started(run))
    }

    async fn handle_completion(
        &self,
        change: &WorkerStatusChange,
        completion: Completion,
    ) -> Result<Option<Step>> {
        let route = match self.runs.lookup(&change.worker_id) {
            Some(route) => route,
            None => {
                // A spawn in progress may not have registered this worker yet
                drop(self.spawn_gate.write().await);
                let Some(route) = self.runs.lookup(&change.worker_id) else {
                    tracing::debug!(worker_id = %change.worker_id, "Ignoring completion of unknown worker");
                    return Ok(None);
                };
                route
            }
        };

        let _locked = self.card_locks.lock(&route.card_id).await;
        match route.phase {
            RunPhase::Executing => self.execution_completed(&change.worker_id, &route, completion).await,
            RunPhase::Evaluating => self.evaluation_completed(&change.worker_id, &route, completion).await,
        }
    }

    async fn execution_completed(
        &self,
        worker_id: &str,
        route: &RunRoute,
        completion: Completion,
    ) -> Result<Option<Step>> {
        if completion == Completion::Error {
            let Some(run) = self.runs.take(worker_id, RunPhase::Executing).await? else {
                return Ok(None);
            };
            let Some(board) = self.load_board(&run.board_id).await? else {
                return Ok(None);
            };
            self.record_failure(&run, &board, "Execution worker reported an error", worker_id)
                .await?;
            return Ok(None);
        }

        let Some(run) = self.runs.awaiting(worker_id, RunPhase::Executing).await? else {
            return Ok(None);
        };
        let Some(board) = self.load_board(&route.board_id).await? else {
            self.runs.take(worker_id, RunPhase::Executing).await?;
            return Ok(None);
        };
        let Some(card) = self.load_card(&board.id, &route.card_id).await? else {
            tracing::warn!(card_id = %route.card_id, "Card of finished run no longer exists");
            self.runs.take(worker_id, RunPhase::Executing).await?;
            return Ok(None);
        };

        let report = self.report(worker_id).await;
        let state = board
            .state(&run.state_id)
            .cloned()
            .unwrap_or_else(|| BoardState::new(run.state_id.clone(), run.state_id.clone(), 0));
        let evaluator = run
            .configured_evaluation_worker_id
            .clone()
            .or_else(|| board.swimlane(&run.swimlane_id).and_then(|s| s.evaluator()).map(str::to_string));

        let gate = self.spawn_gate.read().await;
        let spawned = match evaluator {
            Some(agent_id) => {
                self.workers
                    .spawn(SpawnRequest {
                        role: WorkerRole::Evaluation,
                        agent_id,
                        prompt: build_evaluation_prompt(&state, &card, &report),
                        card_id: card.id.clone(),
                        board_id: board.id.clone(),
                    })
                    .await
                    .map_err(|e| e.to_string())
            }
            None => Err("no evaluation worker configured".to_string()),
        };

        match spawned {
            Ok(evaluation_worker_id) => {
                let begun = self.runs.begin_evaluation(worker_id, &evaluation_worker_id).await?;
                drop(gate);
                if begun.is_none() {
                    tracing::warn!(card_id = %card.id, "Run ended before evaluation started");
                    return Ok(None);
                }
                tracing::info!(
                    card_id = %card.id,
                    worker_id = %evaluation_worker_id,
                    "Evaluation started"
                );
                self.emit(
                    &card.id,
                    &board.id,
                    AutomationEventKind::Evaluating {
                        worker_id: evaluation_worker_id,
                    },
                );
            }
            Err(reason) => {
                drop(gate);
                tracing::error!(card_id = %card.id, error = %reason, "Failed to spawn evaluation worker");
                let Some(run) = self.runs.take(worker_id, RunPhase::Executing).await? else {
                    return Ok(None);
                };
                self.record_failure(
                    &run,
                    &board,
                    &format!("Failed to spawn evaluation worker: {reason}"),
                    worker_id,
                )
                .await?;
            }
        }
        Ok(None)
    }

    async fn evaluation_completed(
        &self,
        worker_id: &str,
        route: &RunRoute,
        completion: Completion,
    ) -> Result<Option<Step>> {
        let Some(run) = self.runs.take(worker_id, RunPhase::Evaluating).await? else {
            return Ok(None);
        };
        let Some(board) = self.load_board(&route.board_id).await? else {
            return Ok(None);
        };

        let verdict = match completion {
            Completion::Error => Verdict::Fail("Evaluation worker reported an error".to_string()),
            Completion::Success => Verdict::parse(&self.report(worker_id).await.summary),
        };

        match verdict {
            Verdict::Pass => self.record_pass(&run, &board, worker_id).await,
            Verdict::Fail(reason) => {
                let Some((card, stuck)) = self.record_failure(&run, &board, &reason, worker_id).await? else {
                    return Ok(None);
                };
                if stuck {
                    return Ok(None);
                }
                Ok(Some(Step::Trigger { card, board }))
            }
        }
    }

    async fn record_pass(&self, run: &AutomationRun, board: &Board, worker_id: &str) -> Result<Option<Step>> {
        let mut moved_to = None;
        let updated = update_card(
            &self.queue,
            self.store.as_ref(),
            &self.keys.cards(&board.id),
            &run.card_id,
            |card| {
                card.record(
                    HistoryEntry::new(HistoryAction::AutomationSucceeded, "Evaluation passed")
                        .with_worker(worker_id),
                );

                if let Some(next) = board.next_state(&card.state_id) {
                    let from = board
                        .state(&card.state_id)
                        .map_or(card.state_id.as_str(), |s| s.name.as_str())
                        .to_string();
                    card.state_id = next.id.clone();
                    card.automation_attempts = 0;
                    card.record(HistoryEntry::new(
                        HistoryAction::Moved,
                        format!("From {} to {}", from, next.name),
                    ));
                    moved_to = Some(next.clone());
                }
                Ok(())
            },
        )
        .await;

        let card = match updated {
            Ok(card) => card,
            Err(e) if e.is_not_found() => {
                tracing::warn!(card_id = %run.card_id, "Card of finished run no longer exists");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            card_id = %card.id,
            moved_to = moved_to.as_ref().map(|s| s.id.as_str()),
            "Automation succeeded"
        );
        self.emit(
            &card.id,
            &board.id,
            AutomationEventKind::Succeeded {
                moved_to: moved_to.as_ref().map(|s| s.id.clone()),
            },
        );

        match moved_to {
            Some(next) if next.is_automatic => Ok(Some(Step::Trigger {
                card,
                board: board.clone(),
            })),
            _ => Ok(None),
        }
    }

    /// Append `automation-failed` and, when attempts are used up, `automation-stuck`.
    ///
    /// Returns the updated card and whether it is now stuck.
    async fn record_failure(
        &self,
        run: &AutomationRun,
        board: &Board,
        reason: &str,
        worker_id: &str,
    ) -> Result<Option<(Card, bool)>> {
        let max_retries = board.config.max_retries;
        let mut stuck = false;

        let updated = update_card(
            &self.queue,
            self.store.as_ref(),
            &self.keys.cards(&board.id),
            &run.card_id,
            |card| {
                card.record(
                    HistoryEntry::new(HistoryAction::AutomationFailed, reason).with_worker(worker_id),
                );
                if card.automation_attempts >= max_retries {
                    card.record(HistoryEntry::new(
                        HistoryAction::AutomationStuck,
                        format!(
                            "Exceeded max retries ({}/{})",
                            card.automation_attempts, max_retries
                        ),
                    ));
                    stuck = true;
                }
                Ok(())
            },
        )
        .await;

        let card = match updated {
            Ok(card) => card,
            Err(e) if e.is_not_found() => {
                tracing::warn!(card_id = %run.card_id, "Card of failed run no longer exists");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        tracing::warn!(
            card_id = %card.id,
            attempts = card.automation_attempts,
            max_retries = max_retries,
            reason = %reason,
            "Automation failed"
        );
        self.emit(
            &card.id,
            &board.id,
            AutomationEventKind::Failed {
                reason: reason.to_string(),
            },
        );

        if stuck {
            tracing::warn!(card_id = %card.id, "Card is stuck");
            self.emit(
                &card.id,
                &board.id,
                AutomationEventKind::Stuck {
                    attempts: card.automation_attempts,
                    max_retries,
                },
            );
        }
        Ok(Some((card, stuck)))
    }

    async fn report(&self, worker_id: &str) -> WorkerReport {
        match self.workers.completed_worker(worker_id).await {
            Ok(Some(report)) => report,
            Ok(None) => {
                tracing::warn!(worker_id = %worker_id, "No result recorded for finished worker");
                WorkerReport::default()
            }
            Err(e) => {
                tracing::warn!(worker_id = %worker_id, error = %e, "Failed to look up worker result");
                WorkerReport::default()
            }
        }
    }

    async fn load_board(&self, board_id: &str) -> Result<Option<Board>> {
        let boards: Vec<Board> = self.queue.snapshot(self.store.as_ref(), self.keys.boards()).await?;
        let board = boards.into_iter().find(|b| b.id == board_id);
        if board.is_none() {
            tracing::warn!(board_id = %board_id, "Board of finished run no longer exists");
        }
        Ok(board)
    }

    async fn load_card(&self, board_id: &str, card_id: &str) -> Result<Option<Card>> {
        let cards: Vec<Card> = self
            .queue
            .snapshot(self.store.as_ref(), &self.keys.cards(board_id))
            .await?;
        Ok(cards.into_iter().find(|c| c.id == card_id))
    }

    fn emit(&self, card_id: &str, board_id: &str, kind: AutomationEventKind) {
        // No subscribers is fine
        let _ = self.events.send(AutomationEvent::new(card_id, board_id, kind));
    }
}

fn skipped(card: &Card, reason: SkipReason) -> TriggerOutcome {
    tracing::debug!(card_id = %card.id, reason = ?reason, "Automation not triggered");
    TriggerOutcome::Skipped(reason)
}
