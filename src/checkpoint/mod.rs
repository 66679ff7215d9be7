//! Checkpoint Store (§4.7). Captures and restores agent session state so a
//! crashed or restarted worker can resume a running agent. Grounded on the
//! teacher's `tasks::checkpoint::CheckpointManager` for the save/load/GC
//! shape, and pinned to exact formats recovered from the original
//! `checkpoints.py` (checkpoint id derivation, diff truncation marker,
//! `git status --porcelain` parsing).

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::AgentCheckpoint;
use crate::storage::Storage;

const MAX_DIFF_BYTES: usize = 100_000;
const DEFAULT_KEEP_COUNT: usize = 5;

fn checkpoint_id(agent_id: &str, timestamp: &str) -> String {
    let combined = format!("{agent_id}:{timestamp}");
    let digest = Sha256::digest(combined.as_bytes());
    format!("checkpoint_{}", hex::encode(&digest)[..12].to_string())
}

/// Conversation/session facts the caller supplies; the store persists them
/// without understanding their contents (the agent runtime adapter owns
/// that).
pub struct CheckpointInput {
    pub agent_id: String,
    pub session_id: String,
    pub conversation_history: Vec<serde_json::Value>,
    pub pending_tool_calls: Vec<serde_json::Value>,
    pub current_step: Option<String>,
    pub pending_approval_id: Option<String>,
    /// Path to the agent's workspace on disk, if one exists.
    pub worktree_path: Option<std::path::PathBuf>,
}

pub struct RestoreResult {
    pub checkpoint: AgentCheckpoint,
    pub worktree_path: Option<std::path::PathBuf>,
    pub session_id: String,
    pub pending_approval_id: Option<String>,
    pub has_uncommitted_changes: bool,
}

/// Durable-store-backed checkpoint manager for one agent (§4.7, §5: "so a
/// crashed or restarted worker can continue a running agent"). `storage` is
/// the single source of truth — there is no in-memory shadow copy to drift
/// out of sync with it or to lose on restart.
pub struct CheckpointStore {
    storage: Arc<Storage>,
    keep_count: usize,
}

impl CheckpointStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            keep_count: DEFAULT_KEEP_COUNT,
        }
    }

    pub fn with_keep_count(storage: Arc<Storage>, keep_count: usize) -> Self {
        Self { storage, keep_count }
    }

    /// Create a checkpoint from the given input, capturing workspace diff
    /// state if a worktree path is present, persist it, and garbage-collect
    /// anything beyond `keep_count` for this agent (§4.7 steps 1-6).
    pub async fn checkpoint(&self, input: CheckpointInput) -> Result<AgentCheckpoint> {
        let timestamp = Utc::now().to_rfc3339();
        let id = checkpoint_id(&input.agent_id, &timestamp);

        let (uncommitted_changes, files_modified) = match &input.worktree_path {
            Some(path) if path.exists() => get_git_state(path).await?,
            _ => (String::new(), Vec::new()),
        };

        let record = AgentCheckpoint {
            id: id.clone(),
            agent_id: input.agent_id.clone(),
            session_id: input.session_id,
            conversation_history: input.conversation_history,
            pending_tool_calls: input.pending_tool_calls,
            files_modified,
            uncommitted_changes,
            current_step: input.current_step,
            completed_steps: Vec::new(),
            pending_approval_id: input.pending_approval_id,
            created_at: Utc::now(),
            latest: true,
        };

        self.storage.insert_checkpoint(&record).await?;
        self.storage
            .gc_checkpoints(&input.agent_id, self.keep_count as i64)
            .await?;

        debug!(checkpoint_id = %id, agent_id = %record.agent_id, "checkpoint created");
        Ok(record)
    }

    pub async fn get_latest(&self, agent_id: &str) -> Option<AgentCheckpoint> {
        self.storage.get_latest_checkpoint(agent_id).await.ok().flatten()
    }

    pub async fn list(&self, agent_id: &str, limit: usize) -> Vec<AgentCheckpoint> {
        self.storage
            .list_checkpoints(agent_id, limit as i64)
            .await
            .unwrap_or_default()
    }

    /// Delete old checkpoints, keeping the most recent `keep_count`.
    pub async fn cleanup_old(&self, agent_id: &str) -> usize {
        self.storage
            .gc_checkpoints(agent_id, self.keep_count as i64)
            .await
            .unwrap_or(0) as usize
    }

    /// Run `cleanup_old` for every agent with at least one checkpoint.
    /// Driven periodically by the control plane's checkpoint GC task.
    pub async fn sweep(&self) -> usize {
        let agent_ids = self.storage.distinct_checkpoint_agent_ids().await.unwrap_or_default();
        let mut total = 0;
        for agent_id in agent_ids {
            total += self.cleanup_old(&agent_id).await;
        }
        total
    }

    /// Prepare restoration data from a checkpoint. Does not itself recreate
    /// the agent — the orchestrator is responsible for that.
    ///
    /// `expected_worktree_path` is the workspace path the owning agent
    /// record points at, if any; it is downgraded to `None` here if the
    /// path no longer exists on disk; the caller must then recreate it
    /// before resuming.
    pub async fn restore(
        &self,
        checkpoint: AgentCheckpoint,
        expected_worktree_path: Option<&Path>,
    ) -> Result<RestoreResult> {
        if checkpoint.session_id.is_empty() {
            bail!("checkpoint has no session id - cannot resume");
        }

        let worktree_path = expected_worktree_path.and_then(resolve_worktree_path);
        let has_uncommitted_changes = !checkpoint.uncommitted_changes.is_empty();

        Ok(RestoreResult {
            session_id: checkpoint.session_id.clone(),
            pending_approval_id: checkpoint.pending_approval_id.clone(),
            has_uncommitted_changes,
            checkpoint,
            worktree_path,
        })
    }
}

/// Validate that `worktree_path` still exists on disk for a restore; if not,
/// the caller should treat the workspace as gone (`None`) rather than erroring.
pub fn resolve_worktree_path(worktree_path: &Path) -> Option<std::path::PathBuf> {
    if worktree_path.exists() {
        Some(worktree_path.to_path_buf())
    } else {
        warn!(path = %worktree_path.display(), "worktree no longer exists");
        None
    }
}

async fn get_git_state(worktree_path: &Path) -> Result<(String, Vec<String>)> {
    let status = tokio::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(worktree_path)
        .output()
        .await
        .context("failed to run git status")?;

    let status_text = String::from_utf8_lossy(&status.stdout);
    let files_modified: Vec<String> = status_text
        .lines()
        .filter(|l| !l.is_empty())
        .map(|line| line.get(3..).unwrap_or("").trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let diff = tokio::process::Command::new("git")
        .args(["diff", "HEAD"])
        .current_dir(worktree_path)
        .output()
        .await
        .context("failed to run git diff")?;

    let mut uncommitted_changes = String::from_utf8_lossy(&diff.stdout).into_owned();
    if uncommitted_changes.len() > MAX_DIFF_BYTES {
        let total = uncommitted_changes.len();
        uncommitted_changes.truncate(MAX_DIFF_BYTES);
        uncommitted_changes.push_str(&format!("\n... [truncated, {total} bytes total]"));
    }

    Ok((uncommitted_changes, files_modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn input(agent_id: &str) -> CheckpointInput {
        CheckpointInput {
            agent_id: agent_id.to_string(),
            session_id: "sess-1".to_string(),
            conversation_history: vec![],
            pending_tool_calls: vec![],
            current_step: None,
            pending_approval_id: None,
            worktree_path: None,
        }
    }

    async fn store() -> (CheckpointStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        (CheckpointStore::new(storage), dir)
    }

    #[tokio::test]
    async fn checkpoint_then_get_latest_roundtrips() {
        let (store, _dir) = store().await;
        let created = store.checkpoint(input("agent-1")).await.unwrap();
        let latest = store.get_latest("agent-1").await.unwrap();
        assert_eq!(latest.id, created.id);
    }

    #[tokio::test]
    async fn only_one_checkpoint_marked_latest() {
        let (store, _dir) = store().await;
        store.checkpoint(input("agent-1")).await.unwrap();
        store.checkpoint(input("agent-1")).await.unwrap();
        let all = store.list("agent-1", 10).await;
        assert_eq!(all.iter().filter(|c| c.latest).count(), 1);
    }

    #[tokio::test]
    async fn cleanup_keeps_only_keep_count() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let store = CheckpointStore::with_keep_count(storage, 2);
        for _ in 0..5 {
            store.checkpoint(input("agent-1")).await.unwrap();
        }
        let all = store.list("agent-1", 100).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn restore_rejects_empty_session_id() {
        let (store, _dir) = store().await;
        let mut ck = store.checkpoint(input("agent-1")).await.unwrap();
        ck.session_id = String::new();
        assert!(store.restore(ck, None).await.is_err());
    }

    #[test]
    fn checkpoint_id_is_deterministic_for_same_inputs() {
        let a = checkpoint_id("agent-1", "2026-01-01T00:00:00Z");
        let b = checkpoint_id("agent-1", "2026-01-01T00:00:00Z");
        assert_eq!(a, b);
        assert!(a.starts_with("checkpoint_"));
        assert_eq!(a.len(), "checkpoint_".len() + 12);
    }

    #[test]
    fn checkpoint_id_differs_by_timestamp() {
        let a = checkpoint_id("agent-1", "t1");
        let b = checkpoint_id("agent-1", "t2");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn checkpoint_survives_a_fresh_store_against_the_same_database() {
        // Simulates a worker restart: a brand new CheckpointStore, with no
        // in-memory state of its own, must still see the checkpoint through
        // the shared durable store (§4.7, §5 crash recovery).
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let created = CheckpointStore::new(storage.clone())
            .checkpoint(input("agent-1"))
            .await
            .unwrap();

        let restarted = CheckpointStore::new(storage);
        let latest = restarted.get_latest("agent-1").await.unwrap();
        assert_eq!(latest.id, created.id);
    }
}
