//! MetaOrchestrator (§4.9). Coordinates multiple TaskOrchestrators toward a
//! larger objective: task queue draining under a concurrency and budget cap,
//! in one of three strategies. Grounded on the teacher's
//! `scheduler::accounts::AccountPool` for the in-memory registry shape
//! (`RwLock<HashMap<...>>`, `Arc` handle for sharing across tasks).

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::{MetaOrchestratorRecord, MetaStatus, Strategy};
use crate::storage::Storage;

pub struct MetaOrchestratorStore {
    records: RwLock<std::collections::HashMap<String, MetaOrchestratorRecord>>,
    /// Durable mirror (§6.3). `None` in unit tests that only exercise the
    /// in-memory dispatch logic; production wiring always supplies one via
    /// `with_storage`.
    storage: Option<Arc<Storage>>,
}

pub type SharedMetaOrchestratorStore = Arc<MetaOrchestratorStore>;

impl MetaOrchestratorStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(std::collections::HashMap::new()),
            storage: None,
        }
    }

    pub fn with_storage(storage: Arc<Storage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new()
        }
    }

    async fn persist(&self, record: &MetaOrchestratorRecord) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.upsert_meta_orchestrator(record).await {
                warn!(meta_id = %record.id, err = %e, "failed to persist meta orchestrator");
            }
        }
    }

    pub async fn create(
        &self,
        organization_id: &str,
        project_id: &str,
        strategy: Strategy,
        task_queue: Vec<String>,
        max_concurrent: u32,
        budget_usd: Option<f64>,
    ) -> MetaOrchestratorRecord {
        let record = MetaOrchestratorRecord {
            id: crate::domain::new_id("meta"),
            organization_id: organization_id.to_string(),
            project_id: project_id.to_string(),
            status: MetaStatus::Idle,
            strategy,
            task_queue,
            active_orchestrators: HashSet::new(),
            finished_task_ids: HashSet::new(),
            max_concurrent,
            budget_usd,
            spent_usd: 0.0,
            tasks_completed: 0,
            tasks_failed: 0,
            total_rework_cycles: 0,
        };
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        self.persist(&record).await;
        record
    }

    pub async fn get(&self, id: &str) -> Option<MetaOrchestratorRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Pop the next task id eligible to start, respecting `max_concurrent`
    /// and strategy ordering. `Sequential` drains `task_queue` in order one
    /// at a time; `Parallel` allows up to `max_concurrent` simultaneously in
    /// queue order; `Priority` is identical to `Parallel` here — the caller
    /// is expected to have pre-sorted `task_queue` by priority before
    /// construction, since ordering is a router/ingestion concern, not a
    /// meta-orchestrator one.
    ///
    /// `per_task_budget_estimate` is checked against `spent_usd` *before*
    /// dequeuing (§4.9): if `spent_usd + estimate > budget_usd`, the
    /// orchestrator is paused and no task is returned, even though the
    /// actual spend has not yet exceeded the cap.
    pub async fn next_eligible_task(
        &self,
        id: &str,
        per_task_budget_estimate: f64,
    ) -> Result<Option<String>> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("meta orchestrator not found: {id}"))?;

        if record.status == MetaStatus::Paused || record.status == MetaStatus::Complete {
            return Ok(None);
        }

        if let Some(budget) = record.budget_usd {
            if record.spent_usd + per_task_budget_estimate > budget {
                warn!(meta_id = %id, spent = record.spent_usd, budget, "budget exceeded, pausing dispatch");
                record.status = MetaStatus::Paused;
                let paused = record.clone();
                drop(records);
                self.persist(&paused).await;
                return Ok(None);
            }
        }

        let concurrency_cap = match record.strategy {
            Strategy::Sequential => 1,
            Strategy::Parallel | Strategy::Priority => record.max_concurrent,
        };
        if record.active_orchestrators.len() as u32 >= concurrency_cap {
            return Ok(None);
        }

        let next = record
            .task_queue
            .iter()
            .find(|t| !record.active_orchestrators.contains(*t))
            .cloned();

        if let Some(task_id) = &next {
            record.active_orchestrators.insert(task_id.clone());
            record.status = MetaStatus::Running;
            debug!(meta_id = %id, task_id, "dispatched task under meta orchestrator");
        }
        let dispatched = record.clone();
        drop(records);
        if next.is_some() {
            self.persist(&dispatched).await;
        }
        Ok(next)
    }

    /// Record a completed (or failed) orchestrator, updating aggregates.
    /// `rework_cycles`/`cost_usd` are rolled up from the finished
    /// `TaskOrchestratorRecord`.
    pub async fn record_completion(
        &self,
        id: &str,
        task_id: &str,
        succeeded: bool,
        rework_cycles: u64,
        cost_usd: f64,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("meta orchestrator not found: {id}"))?;

        if !record.active_orchestrators.remove(task_id) {
            bail!("task {task_id} was not active under meta orchestrator {id}");
        }
        record.finished_task_ids.insert(task_id.to_string());
        record.spent_usd += cost_usd;
        record.total_rework_cycles += rework_cycles;
        if succeeded {
            record.tasks_completed += 1;
        } else {
            record.tasks_failed += 1;
        }

        let drained = record
            .task_queue
            .iter()
            .all(|t| record.finished_task_ids.contains(t));
        if drained && record.active_orchestrators.is_empty() {
            record.status = MetaStatus::Complete;
        }
        let updated = record.clone();
        drop(records);
        self.persist(&updated).await;
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("meta orchestrator not found: {id}"))?;
        if record.status == MetaStatus::Complete {
            bail!("cannot pause a completed meta orchestrator");
        }
        record.status = MetaStatus::Paused;
        let updated = record.clone();
        drop(records);
        self.persist(&updated).await;
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("meta orchestrator not found: {id}"))?;
        if record.status != MetaStatus::Paused {
            bail!("meta orchestrator {id} is not paused");
        }
        record.status = MetaStatus::Idle;
        let updated = record.clone();
        drop(records);
        self.persist(&updated).await;
        Ok(())
    }

    /// Append task ids to the back of the queue (§6.2 `queue_tasks`).
    /// Ids already present (active or still queued) are skipped.
    pub async fn queue_tasks(&self, id: &str, task_ids: Vec<String>) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("meta orchestrator not found: {id}"))?;
        for task_id in task_ids {
            if !record.task_queue.contains(&task_id) {
                record.task_queue.push(task_id);
            }
        }
        let updated = record.clone();
        drop(records);
        self.persist(&updated).await;
        Ok(())
    }

    /// Change strategy and concurrency cap (§6.2 `set_strategy`). Does not
    /// disturb orchestrators already dispatched under the old strategy.
    pub async fn set_strategy(&self, id: &str, strategy: Strategy, max_concurrent: u32) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("meta orchestrator not found: {id}"))?;
        record.strategy = strategy;
        record.max_concurrent = max_concurrent;
        let updated = record.clone();
        drop(records);
        self.persist(&updated).await;
        Ok(())
    }

    /// Update the budget cap (§6.2 `set_budget`). `alert_threshold` is not
    /// persisted on the record (no alerting channel exists yet in this
    /// crate) but is accepted so the API shape matches the spec's call.
    pub async fn set_budget(&self, id: &str, budget_usd: Option<f64>, _alert_threshold: Option<f64>) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("meta orchestrator not found: {id}"))?;
        record.budget_usd = budget_usd;
        let updated = record.clone();
        drop(records);
        self.persist(&updated).await;
        Ok(())
    }
}

impl Default for MetaOrchestratorStore {
    fn default() -> Self {
        Self::new()
    }
}
