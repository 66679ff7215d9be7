//! Shared entity types for the control plane (§3).
//!
//! Every entity carries an `organization_id`; no query or mutation may
//! cross that boundary. IDs are opaque, entity-prefixed UUIDv4 strings.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate an entity id with a readable prefix, e.g. `runner_3f9c2a01`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", &Uuid::new_v4().simple().to_string()[..12])
}

// ─── Runner ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Offline,
    Online,
    Busy,
    Draining,
}

impl RunnerStatus {
    /// Legal direct transitions: offline <-> online <-> busy <-> draining.
    /// `draining` is terminal except for explicit operator action back to offline.
    pub fn can_transition_to(&self, next: &RunnerStatus) -> bool {
        use RunnerStatus::*;
        matches!(
            (self, next),
            (Offline, Online)
                | (Online, Offline)
                | (Online, Busy)
                | (Busy, Online)
                | (Online, Draining)
                | (Busy, Draining)
                | (Draining, Offline)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    pub organization_id: String,
    pub display_name: String,
    pub hostname: String,
    pub capabilities: HashSet<String>,
    pub max_concurrent_agents: u32,
    pub current_agent_count: u32,
    pub status: RunnerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub client_version: String,
    pub is_sandbox_runner: bool,
    pub bound_sandbox_id: Option<String>,
}

impl Runner {
    pub fn available_slots(&self) -> u32 {
        self.max_concurrent_agents
            .saturating_sub(self.current_agent_count)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.last_heartbeat {
            Some(hb) => now - hb > stale_after,
            None => false,
        }
    }
}

/// Warm-workspace record. Unique per (runner_id, project_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerProject {
    pub runner_id: String,
    pub project_id: String,
    pub workspace_path: String,
    pub workspace_branch: String,
    pub last_used_at: DateTime<Utc>,
}

// ─── Task (external, immutable to the core) ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub title: String,
    pub priority: i32,
    pub complexity: String,
    pub required_capabilities: HashSet<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

// ─── TaskOrchestrator ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Implement,
    Gates,
    Review,
    Rework,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Pending,
    Running,
    WaitingReview,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Lint,
    Typecheck,
    Test,
    Security,
    HumanReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub kind: GateKind,
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: std::collections::HashMap<String, f64>,
    pub duration_ms: u64,
    pub output: String,
}

/// Terminal failure cause recorded on a `failed` TaskOrchestrator (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    ReworkLimit,
    RunnerUnavailable,
    GateTimeout,
    AgentError,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOrchestratorRecord {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub task_id: String,
    pub phase: TaskPhase,
    pub status: OrchestratorStatus,
    pub gate_config: Vec<GateKind>,
    pub rework_count: u32,
    pub max_rework_attempts: u32,
    pub current_worker_id: Option<String>,
    pub gate_results: Vec<GateResult>,
    pub review_feedback: Option<String>,
    pub human_reviewer_id: Option<String>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_cause: Option<FailureCause>,
}

// ─── Agent ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Working,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub task_id: String,
    pub runner_id: Option<String>,
    pub orchestrator_id: Option<String>,
    pub status: AgentStatus,
    pub progress_percent: u8,
    pub current_activity: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub workspace_path: Option<String>,
    pub standalone: bool,
}

impl Agent {
    /// A standalone agent may be promoted to managed (bound to a
    /// TaskOrchestrator) only while it is still standalone, unmanaged, and
    /// not already in a terminal status (§9 open question, resolved: a
    /// completed/failed/terminated agent has nothing left to manage).
    pub fn is_promotion_eligible(&self) -> bool {
        self.standalone && self.orchestrator_id.is_none() && !self.status.is_terminal()
    }
}

// ─── AgentCheckpoint ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub id: String,
    pub agent_id: String,
    pub session_id: String,
    pub conversation_history: Vec<serde_json::Value>,
    pub pending_tool_calls: Vec<serde_json::Value>,
    pub files_modified: Vec<String>,
    pub uncommitted_changes: String,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub pending_approval_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub latest: bool,
}

// ─── MetaOrchestrator ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaStatus {
    Idle,
    Running,
    Paused,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Sequential,
    Parallel,
    Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaOrchestratorRecord {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub status: MetaStatus,
    pub strategy: Strategy,
    pub task_queue: Vec<String>,
    pub active_orchestrators: HashSet<String>,
    /// Task ids that have reached a terminal `record_completion` call
    /// (succeeded or failed) — distinct from "not active," which is also
    /// true of a task still waiting in `task_queue` and never dispatched.
    pub finished_task_ids: HashSet<String>,
    pub max_concurrent: u32,
    pub budget_usd: Option<f64>,
    pub spent_usd: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_rework_cycles: u64,
}

// ─── InterAgentMessage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterAgentMessage {
    pub id: String,
    pub organization_id: String,
    pub from_agent: String,
    /// `None` means broadcast to all agents of the organization.
    pub to_agent: Option<String>,
    pub message_type: String,
    pub subject: String,
    pub content: String,
    pub response_to_id: Option<String>,
    pub requires_response: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
}

// ─── Approval ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub agent_id: String,
    pub action_description: String,
    pub proposed_command: Option<String>,
    pub proposed_diff: Option<String>,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ─── RunnerScore (ephemeral router output) ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub affinity: f64,
    pub capability: f64,
    pub load: f64,
    pub health: f64,
    pub preference: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerScore {
    pub runner_id: String,
    pub total_score: f64,
    pub components: ScoreComponents,
    pub available_slots: u32,
    pub has_warm_workspace: bool,
    pub missing_capabilities: Vec<String>,
}

// ─── Rollout mode ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutMode {
    Off,
    Shadow,
    Enforced,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(standalone: bool, orchestrator_id: Option<&str>, status: AgentStatus) -> Agent {
        Agent {
            id: "agent-1".to_string(),
            organization_id: "org-1".to_string(),
            project_id: "proj-1".to_string(),
            task_id: "task-1".to_string(),
            runner_id: None,
            orchestrator_id: orchestrator_id.map(str::to_string),
            status,
            progress_percent: 0,
            current_activity: None,
            last_heartbeat: Utc::now(),
            tokens_used: 0,
            cost_usd: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            error_count: 0,
            workspace_path: None,
            standalone,
        }
    }

    #[test]
    fn runner_status_allows_the_documented_transitions() {
        use RunnerStatus::*;
        assert!(Offline.can_transition_to(&Online));
        assert!(Online.can_transition_to(&Busy));
        assert!(Busy.can_transition_to(&Online));
        assert!(Online.can_transition_to(&Draining));
        assert!(Busy.can_transition_to(&Draining));
        assert!(Draining.can_transition_to(&Offline));
    }

    #[test]
    fn runner_status_rejects_skipping_straight_to_draining() {
        assert!(!RunnerStatus::Offline.can_transition_to(&RunnerStatus::Draining));
    }

    #[test]
    fn runner_status_rejects_leaving_draining_to_anything_but_offline() {
        assert!(!RunnerStatus::Draining.can_transition_to(&RunnerStatus::Online));
        assert!(!RunnerStatus::Draining.can_transition_to(&RunnerStatus::Busy));
    }

    #[test]
    fn available_slots_never_underflows() {
        let runner = Runner {
            id: "r1".to_string(),
            organization_id: "org-1".to_string(),
            display_name: "r1".to_string(),
            hostname: "h".to_string(),
            capabilities: HashSet::new(),
            max_concurrent_agents: 2,
            current_agent_count: 5,
            status: RunnerStatus::Online,
            last_heartbeat: None,
            client_version: String::new(),
            is_sandbox_runner: false,
            bound_sandbox_id: None,
        };
        assert_eq!(runner.available_slots(), 0);
    }

    #[test]
    fn standalone_unmanaged_non_terminal_agent_is_promotion_eligible() {
        let a = agent(true, None, AgentStatus::Working);
        assert!(a.is_promotion_eligible());
    }

    #[test]
    fn already_managed_agent_is_not_promotion_eligible() {
        let a = agent(true, Some("orch-1"), AgentStatus::Working);
        assert!(!a.is_promotion_eligible());
    }

    #[test]
    fn terminal_standalone_agent_is_not_promotion_eligible() {
        let a = agent(true, None, AgentStatus::Completed);
        assert!(!a.is_promotion_eligible());
    }

    #[test]
    fn non_standalone_agent_is_not_promotion_eligible() {
        let a = agent(false, None, AgentStatus::Working);
        assert!(!a.is_promotion_eligible());
    }

    #[test]
    fn agent_status_terminal_set_is_exactly_completed_failed_terminated() {
        assert!(AgentStatus::Completed.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
        assert!(AgentStatus::Terminated.is_terminal());
        assert!(!AgentStatus::Working.is_terminal());
        assert!(!AgentStatus::Paused.is_terminal());
        assert!(!AgentStatus::Initializing.is_terminal());
    }
}
