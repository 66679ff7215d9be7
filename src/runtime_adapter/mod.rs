//! Agent Runtime Adapter (§4.5). Opaque contract between the control plane
//! and whatever concretely runs an agent (a CLI subprocess, an SDK session,
//! a container). Grounded directly on the teacher's `session::runner::Runner`
//! trait — same `async_trait` shape, generalized from a single `send` turn
//! to the fuller spawn/execute/checkpoint-resume lifecycle this contract
//! needs.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::AgentCheckpoint;

/// Where an agent turn landed.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub completed: bool,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub summary: String,
    /// Set when the turn ended because the agent needs a risky action
    /// approved before continuing.
    pub pending_approval: Option<String>,
}

/// Common interface every concrete agent backend implements. The control
/// plane holds this as `Arc<dyn AgentRuntimeAdapter>` and never inspects
/// what's on the other side of it.
#[async_trait]
pub trait AgentRuntimeAdapter: Send + Sync {
    /// Start a fresh agent process/session bound to `workspace_path`, given
    /// the task instructions as the first turn's content.
    async fn spawn(&self, agent_id: &str, workspace_path: &str, instructions: &str) -> anyhow::Result<()>;

    /// Drive the agent one turn forward and report what happened.
    async fn execute(&self, agent_id: &str) -> anyhow::Result<TurnOutcome>;

    /// Send a message into a running agent (e.g. review feedback, an
    /// approval decision, an inter-agent message delivery).
    async fn send(&self, agent_id: &str, content: &str) -> anyhow::Result<()>;

    /// Stop the agent, releasing any process/session resources. Idempotent.
    async fn stop(&self, agent_id: &str) -> anyhow::Result<()>;

    /// Recreate a session from a checkpoint after a crash or restart.
    async fn resume_from_checkpoint(&self, agent_id: &str, checkpoint: &AgentCheckpoint) -> anyhow::Result<()>;

    /// Raw conversation history for checkpointing; opaque JSON values the
    /// checkpoint store persists without interpreting.
    async fn get_conversation_history(&self, agent_id: &str) -> anyhow::Result<Vec<Value>>;
}


#[cfg(test)]
mod tests {
    use super::test_stub::StubAdapter;
    use super::*;

    fn outcome() -> TurnOutcome {
        TurnOutcome {
            completed: true,
            tokens_used: 100,
            cost_usd: 0.01,
            summary: "done".to_string(),
            pending_approval: None,
        }
    }

    #[tokio::test]
    async fn execute_before_spawn_errors() {
        let adapter = StubAdapter::new(vec![outcome()]);
        assert!(adapter.execute("agent-1").await.is_err());
    }

    #[tokio::test]
    async fn spawn_then_execute_returns_configured_outcome() {
        let adapter = StubAdapter::new(vec![outcome()]);
        adapter.spawn("agent-1", "/tmp/ws", "do the thing").await.unwrap();
        let result = adapter.execute("agent-1").await.unwrap();
        assert!(result.completed);
        assert_eq!(result.tokens_used, 100);
    }

    #[tokio::test]
    async fn resume_from_checkpoint_restores_history() {
        let adapter = StubAdapter::new(vec![outcome()]);
        let checkpoint = AgentCheckpoint {
            id: "checkpoint_abc".to_string(),
            agent_id: "agent-1".to_string(),
            session_id: "sess-1".to_string(),
            conversation_history: vec![serde_json::json!({"role": "assistant", "content": "hi"})],
            pending_tool_calls: vec![],
            files_modified: vec![],
            uncommitted_changes: String::new(),
            current_step: None,
            completed_steps: vec![],
            pending_approval_id: None,
            created_at: chrono::Utc::now(),
            latest: true,
        };
        adapter.resume_from_checkpoint("agent-1", &checkpoint).await.unwrap();
        let history = adapter.get_conversation_history("agent-1").await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
