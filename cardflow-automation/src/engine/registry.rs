//! Persisted automation runs and the worker-id routing map.
//!
//! Runs live as one JSON list under the runs key and are only changed through
//! the mutation queue. The routing map is an in-memory index from the worker
//! a run is waiting on to its card; it is rebuilt from the persisted list by
//! [`RunRegistry::load`].

use crate::error::{AutomationError, Result};
use crate::model::{AutomationRun, RunPhase, RunRoute};
use crate::queue::MutationQueue;
use crate::store::KvStore;
use dashmap::DashMap;
use std::sync::Arc;

pub struct RunRegistry {
    store: Arc<dyn KvStore>,
    queue: Arc<MutationQueue>,
    key: String,
    routes: DashMap<String, RunRoute>,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn KvStore>, queue: Arc<MutationQueue>, key: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            key: key.into(),
            routes: DashMap::new(),
        }
    }

    /// Rebuild the routing map from persisted runs. Returns the number of runs.
    pub async fn load(&self) -> Result<usize> {
        let runs = self.all().await?;
        self.routes.clear();
        for run in &runs {
            self.routes.insert(run.awaited_worker().to_string(), run.route());
        }
        Ok(runs.len())
    }

    /// Record a new run. A card has at most one run.
    ///
    /// The route is visible before the run is written, so a completion that
    /// arrives during the write is not mistaken for an unknown worker. It is
    /// withdrawn again if the write fails.
    pub async fn insert(&self, run: AutomationRun) -> Result<()> {
        let worker_id = run.awaited_worker().to_string();
        self.routes.insert(worker_id.clone(), run.route());

        let persisted = self
            .queue
            .mutate(self.store.as_ref(), &self.key, |mut runs: Vec<AutomationRun>| {
                if runs.iter().any(|r| r.card_id == run.card_id) {
                    return Err(AutomationError::RunAlreadyActive {
                        card_id: run.card_id.clone(),
                    });
                }
                runs.push(run);
                Ok::<_, AutomationError>(runs)
            })
            .await;

        if let Err(e) = persisted {
            self.routes.remove(&worker_id);
            return Err(e);
        }
        Ok(())
    }

    /// Route for a worker's completion, if the worker belongs to a run.
    pub fn lookup(&self, worker_id: &str) -> Option<RunRoute> {
        self.routes.get(worker_id).map(|route| route.value().clone())
    }

    /// Remove and return the run waiting on `worker_id` in `phase`.
    ///
    /// Returns `None` when no such run exists, e.g. a repeated completion.
    pub async fn take(&self, worker_id: &str, phase: RunPhase) -> Result<Option<AutomationRun>> {
        let mut taken = None;
        self.queue
            .mutate(self.store.as_ref(), &self.key, |mut runs: Vec<AutomationRun>| {
                if let Some(index) = runs.iter().position(|r| r.awaits(worker_id, phase)) {
                    taken = Some(runs.remove(index));
                }
                Ok::<_, AutomationError>(runs)
            })
            .await?;

        self.routes.remove(worker_id);
        Ok(taken)
    }

    /// Move the run waiting on `execution_worker_id` into the evaluating phase.
    ///
    /// Like [`insert`](Self::insert), the evaluation route is registered
    /// before the write and withdrawn if the run is gone or the write fails.
    pub async fn begin_evaluation(
        &self,
        execution_worker_id: &str,
        evaluation_worker_id: &str,
    ) -> Result<Option<AutomationRun>> {
        if let Some(route) = self.lookup(execution_worker_id) {
            self.routes.insert(
                evaluation_worker_id.to_string(),
                RunRoute {
                    phase: RunPhase::Evaluating,
                    ..route
                },
            );
        }

        let mut updated = None;
        let persisted = self
            .queue
            .mutate(self.store.as_ref(), &self.key, |mut runs: Vec<AutomationRun>| {
                if let Some(run) = runs
                    .iter_mut()
                    .find(|r| r.awaits(execution_worker_id, RunPhase::Executing))
                {
                    run.phase = RunPhase::Evaluating;
                    run.evaluation_worker_id = Some(evaluation_worker_id.to_string());
                    updated = Some(run.clone());
                }
                Ok::<_, AutomationError>(runs)
            })
            .await;

        if let Err(e) = persisted {
            self.routes.remove(evaluation_worker_id);
            return Err(e);
        }

        self.routes.remove(execution_worker_id);
        match &updated {
            Some(run) => {
                self.routes.insert(evaluation_worker_id.to_string(), run.route());
            }
            None => {
                self.routes.remove(evaluation_worker_id);
            }
        }
        Ok(updated)
    }

    /// Drop the run of a card, whatever phase it is in.
    pub async fn discard_for_card(&self, card_id: &str) -> Result<Option<AutomationRun>> {
        let mut discarded = None;
        self.queue
            .mutate(self.store.as_ref(), &self.key, |mut runs: Vec<AutomationRun>| {
                if let Some(index) = runs.iter().position(|r| r.card_id == card_id) {
                    discarded = Some(runs.remove(index));
                }
                Ok::<_, AutomationError>(runs)
            })
            .await?;

        if let Some(run) = &discarded {
            self.routes.remove(run.awaited_worker());
        }
        Ok(discarded)
    }

    /// The run waiting on `worker_id` in `phase`, read without the slot.
    pub async fn awaiting(&self, worker_id: &str, phase: RunPhase) -> Result<Option<AutomationRun>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|r| r.awaits(worker_id, phase)))
    }

    /// The run of a card, read without the slot.
    pub async fn for_card(&self, card_id: &str) -> Result<Option<AutomationRun>> {
        Ok(self.all().await?.into_iter().find(|r| r.card_id == card_id))
    }

    /// Every persisted run.
    pub async fn all(&self) -> Result<Vec<AutomationRun>> {
        Ok(self.queue.snapshot(self.store.as_ref(), &self.key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn registry(store: &MemoryStore) -> RunRegistry {
        RunRegistry::new(Arc::new(store.clone()), Arc::new(MutationQueue::new()), "automation-runs")
    }

    fn run(card_id: &str, worker_id: &str) -> AutomationRun {
        AutomationRun {
            card_id: card_id.into(),
            board_id: "b1".into(),
            state_id: "review".into(),
            swimlane_id: "lane".into(),
            execution_worker_id: worker_id.into(),
            evaluation_worker_id: None,
            configured_evaluation_worker_id: Some("reviewer".into()),
            phase: RunPhase::Executing,
            attempt: 1,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_one_run_per_card() {
        let store = MemoryStore::new("test");
        let runs = registry(&store);

        runs.insert(run("c1", "w1")).await.unwrap();
        let err = runs.insert(run("c1", "w2")).await.unwrap_err();
        assert!(matches!(err, AutomationError::RunAlreadyActive { .. }));

        assert_eq!(runs.all().await.unwrap().len(), 1);
        assert!(runs.lookup("w2").is_none());
        assert_eq!(runs.lookup("w1").map(|r| r.card_id), Some("c1".to_string()));
    }

    #[tokio::test]
    async fn test_phase_transition_reroutes() {
        let store = MemoryStore::new("test");
        let runs = registry(&store);
        runs.insert(run("c1", "exec")).await.unwrap();

        let updated = runs.begin_evaluation("exec", "eval").await.unwrap().unwrap();
        assert_eq!(updated.phase, RunPhase::Evaluating);
        assert!(runs.lookup("exec").is_none());
        assert_eq!(runs.lookup("eval").map(|r| r.phase), Some(RunPhase::Evaluating));

        // Wrong phase is not consumed
        assert!(runs.take("eval", RunPhase::Executing).await.unwrap().is_none());

        let taken = runs.take("eval", RunPhase::Evaluating).await.unwrap();
        assert_eq!(taken.map(|r| r.card_id), Some("c1".to_string()));
        assert!(runs.take("eval", RunPhase::Evaluating).await.unwrap().is_none());
        assert!(runs.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_rebuilds_routes() {
        let store = MemoryStore::new("test");
        {
            let runs = registry(&store);
            runs.insert(run("c1", "w1")).await.unwrap();
            runs.insert(run("c2", "w2")).await.unwrap();
            runs.begin_evaluation("w2", "e2").await.unwrap();
        }

        let restored = registry(&store);
        assert!(restored.lookup("w1").is_none());
        assert_eq!(restored.load().await.unwrap(), 2);
        assert_eq!(restored.lookup("w1").map(|r| r.phase), Some(RunPhase::Executing));
        assert_eq!(restored.lookup("e2").map(|r| r.card_id), Some("c2".to_string()));
        assert!(restored.lookup("w2").is_none());
    }

    #[tokio::test]
    async fn test_route_visible_while_insert_is_written() {
        let store = MemoryStore::new("test");
        let runs = registry(&store);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (held_tx, held_rx) = tokio::sync::oneshot::channel::<()>();

        // Hold the runs slot so the insert cannot be written yet
        let holder = {
            let queue = Arc::clone(&runs.queue);
            let store = store.clone();
            tokio::spawn(async move {
                queue
                    .mutate_async(&store, "automation-runs", move |items: Vec<AutomationRun>| async move {
                        let _ = held_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, AutomationError>(items)
                    })
                    .await
            })
        };
        held_rx.await.unwrap();

        let insert = runs.insert(run("c1", "w1"));
        tokio::pin!(insert);
        assert!(futures::poll!(insert.as_mut()).is_pending());
        assert_eq!(runs.lookup("w1").map(|r| r.card_id), Some("c1".to_string()));

        release_tx.send(()).unwrap();
        insert.await.unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(runs.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_insert_withdraws_route() {
        let store = MemoryStore::new("test");
        let runs = registry(&store);
        runs.insert(run("c1", "w1")).await.unwrap();

        assert!(runs.insert(run("c1", "w2")).await.is_err());
        assert!(runs.lookup("w2").is_none());
        assert!(runs.lookup("w1").is_some());

        // Evaluation of a run that no longer exists leaves no route behind
        assert!(runs.begin_evaluation("missing", "e1").await.unwrap().is_none());
        assert!(runs.lookup("e1").is_none());
    }

    #[tokio::test]
    async fn test_discard_for_card() {
        let store = MemoryStore::new("test");
        let runs = registry(&store);
        runs.insert(run("c1", "w1")).await.unwrap();

        assert!(runs.discard_for_card("c1").await.unwrap().is_some());
        assert!(runs.discard_for_card("c1").await.unwrap().is_none());
        assert!(runs.lookup("w1").is_none());
        assert!(runs.for_card("c1").await.unwrap().is_none());
    }
}
