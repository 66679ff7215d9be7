//! State Synchronizer (§4.13). Mirrors agent/task state maintained in memory
//! out to durable storage on a best-effort basis, and sweeps for records left
//! stale by a crash on startup. Grounded on the original `state_sync.py`'s
//! "unset vs explicit null" field semantics (modeled here as `Option<Option<T>>`
//! rather than a Python sentinel object) and on the teacher's
//! `storage::Storage::recover_stale_sessions` sweep shape.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::domain::AgentStatus;

/// A field is `None` (not present, i.e. "leave unchanged") or
/// `Some(None)`/`Some(Some(v))` (present, explicitly clearing or setting).
/// This mirrors the original's `_UNSET` sentinel without a boxed `dyn Any`.
#[derive(Default)]
pub struct AgentStateUpdate {
    pub status: Option<AgentStatus>,
    pub last_heartbeat: Option<Option<DateTime<Utc>>>,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<f64>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    pub current_activity: Option<Option<String>>,
}

/// Storage-agnostic persistence surface the synchronizer writes through.
/// Production wiring implements this over `crate::storage::Storage`; tests
/// use an in-memory fake.
#[async_trait::async_trait]
pub trait AgentStateSink: Send + Sync {
    async fn upsert_agent_state(
        &self,
        organization_id: &str,
        agent_id: &str,
        update: &AgentStateUpdate,
    ) -> Result<()>;

    /// Returns ids of agents whose stored status is non-terminal but whose
    /// heartbeat predates `cutoff` — candidates for the startup sweep.
    async fn find_stale_agents(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    async fn mark_agent_failed(&self, agent_id: &str, error_message: &str) -> Result<()>;
}

pub struct StateSynchronizer {
    sink: Arc<dyn AgentStateSink>,
}

impl StateSynchronizer {
    pub fn new(sink: Arc<dyn AgentStateSink>) -> Self {
        Self { sink }
    }

    /// Mirror an in-memory agent state change to durable storage.
    ///
    /// Best-effort: a write failure is logged and swallowed rather than
    /// propagated, since this path must never block or fail agent execution
    /// in progress — the in-memory state remains authoritative until the
    /// next successful sync.
    pub async fn sync_agent_state(
        &self,
        organization_id: &str,
        agent_id: &str,
        update: AgentStateUpdate,
    ) {
        if let Err(e) = self
            .sink
            .upsert_agent_state(organization_id, agent_id, &update)
            .await
        {
            warn!(agent_id = %agent_id, err = %e, "agent state sync failed");
        }
    }

    /// Startup sweep: any agent whose durable status is still non-terminal
    /// but whose heartbeat is older than `stale_after` was orphaned by a
    /// crash of the process that owned it. Mark it failed so dependent
    /// orchestrators can react instead of waiting forever.
    pub async fn sweep_orphaned(&self, stale_after: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - stale_after;
        let stale_ids = self.sink.find_stale_agents(cutoff).await?;
        let mut recovered = 0u64;
        for agent_id in stale_ids {
            if let Err(e) = self
                .sink
                .mark_agent_failed(&agent_id, "worker_crashed")
                .await
            {
                warn!(agent_id = %agent_id, err = %e, "failed to mark orphaned agent as failed");
                continue;
            }
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeSink {
        upserts: Mutex<Vec<(String, String)>>,
        stale: Vec<String>,
        failed: Mutex<Vec<String>>,
        fail_upsert: bool,
    }

    #[async_trait::async_trait]
    impl AgentStateSink for FakeSink {
        async fn upsert_agent_state(
            &self,
            organization_id: &str,
            agent_id: &str,
            _update: &AgentStateUpdate,
        ) -> Result<()> {
            if self.fail_upsert {
                anyhow::bail!("db unavailable");
            }
            self.upserts
                .lock()
                .unwrap()
                .push((organization_id.to_string(), agent_id.to_string()));
            Ok(())
        }

        async fn find_stale_agents(&self, _cutoff: DateTime<Utc>) -> Result<Vec<String>> {
            Ok(self.stale.clone())
        }

        async fn mark_agent_failed(&self, agent_id: &str, _error_message: &str) -> Result<()> {
            self.failed.lock().unwrap().push(agent_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn sync_failure_is_swallowed_not_propagated() {
        let sink = Arc::new(FakeSink {
            upserts: Mutex::new(vec![]),
            stale: vec![],
            failed: Mutex::new(vec![]),
            fail_upsert: true,
        });
        let sync = StateSynchronizer::new(sink);
        // Must not panic or return an error to the caller.
        sync.sync_agent_state("org-1", "agent-1", AgentStateUpdate::default())
            .await;
    }

    #[tokio::test]
    async fn sweep_marks_all_stale_agents_failed() {
        let sink = Arc::new(FakeSink {
            upserts: Mutex::new(vec![]),
            stale: vec!["agent-1".to_string(), "agent-2".to_string()],
            failed: Mutex::new(vec![]),
            fail_upsert: false,
        });
        let sync = StateSynchronizer::new(sink.clone());
        let recovered = sync.sweep_orphaned(chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(recovered, 2);
        assert_eq!(sink.failed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn successful_sync_records_upsert() {
        let sink = Arc::new(FakeSink {
            upserts: Mutex::new(vec![]),
            stale: vec![],
            failed: Mutex::new(vec![]),
            fail_upsert: false,
        });
        let sync = StateSynchronizer::new(sink.clone());
        sync.sync_agent_state(
            "org-1",
            "agent-1",
            AgentStateUpdate {
                status: Some(AgentStatus::Working),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(sink.upserts.lock().unwrap().len(), 1);
    }
}
