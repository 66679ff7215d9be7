//! Durable persistence (§6.3). SQLite via `sqlx`, WAL journal mode, one table
//! per §3 entity. Grounded on the teacher's `storage::Storage` — same
//! connect-with-options/migrate/query-timeout shape — generalized from the
//! teacher's session/message/account tables to the Sibyl schema, and on
//! `odgrim-abathur-swarm`'s `adapters::sqlite::migrations` for the embedded,
//! version-tracked migration runner (the teacher applies its migrations with
//! a plain split-on-`;` loop and no version table, which doesn't fit a schema
//! that will grow new migrations over time).

pub mod event_log;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, QueryBuilder, Sqlite, SqlitePool};
use std::{collections::HashSet, path::Path, str::FromStr};

use crate::domain::{
    Agent, AgentCheckpoint, AgentStatus, Approval, ApprovalStatus, FailureCause, GateKind,
    GateResult, InterAgentMessage, MetaOrchestratorRecord, MetaStatus, OrchestratorStatus, Runner,
    RunnerProject, RunnerStatus, Strategy, TaskOrchestratorRecord, TaskPhase,
};
use crate::state_sync::{AgentStateSink, AgentStateUpdate};

/// Default timeout for individual SQLite queries. Prevents a hung query from
/// blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

struct Migration {
    version: i64,
    sql: &'static str,
}

fn embedded_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        sql: include_str!("migrations/001_sibyl_schema.sql"),
    }]
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("sibyl.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — `Arc`-backed internally).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        let current: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
            .fetch_one(pool)
            .await?;

        for migration in embedded_migrations() {
            if migration.version <= current.0 {
                continue;
            }
            sqlx::raw_sql(migration.sql)
                .execute(pool)
                .await
                .with_context(|| format!("applying migration {}", migration.version))?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(migration.version)
                .bind(Utc::now().to_rfc3339())
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    // ─── Runners ────────────────────────────────────────────────────────────

    pub async fn upsert_runner(&self, runner: &Runner) -> Result<()> {
        sqlx::query(
            "INSERT INTO runners
                (id, organization_id, display_name, hostname, capabilities,
                 max_concurrent_agents, current_agent_count, status, last_heartbeat,
                 client_version, is_sandbox_runner, bound_sandbox_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                hostname = excluded.hostname,
                capabilities = excluded.capabilities,
                max_concurrent_agents = excluded.max_concurrent_agents,
                current_agent_count = excluded.current_agent_count,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                client_version = excluded.client_version,
                is_sandbox_runner = excluded.is_sandbox_runner,
                bound_sandbox_id = excluded.bound_sandbox_id",
        )
        .bind(&runner.id)
        .bind(&runner.organization_id)
        .bind(&runner.display_name)
        .bind(&runner.hostname)
        .bind(serde_json::to_string(&runner.capabilities)?)
        .bind(runner.max_concurrent_agents)
        .bind(runner.current_agent_count)
        .bind(runner_status_str(runner.status))
        .bind(runner.last_heartbeat.map(|t| t.to_rfc3339()))
        .bind(&runner.client_version)
        .bind(runner.is_sandbox_runner)
        .bind(&runner.bound_sandbox_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_runner(&self, id: &str) -> Result<Option<Runner>> {
        let row: Option<RunnerRow> = sqlx::query_as("SELECT * FROM runners WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn list_runners_for_org(&self, organization_id: &str) -> Result<Vec<Runner>> {
        let rows: Vec<RunnerRow> =
            sqlx::query_as("SELECT * FROM runners WHERE organization_id = ?")
                .bind(organization_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn upsert_runner_project(&self, project: &RunnerProject) -> Result<()> {
        sqlx::query(
            "INSERT INTO runner_projects (runner_id, project_id, workspace_path, workspace_branch, last_used_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(runner_id, project_id) DO UPDATE SET
                workspace_path = excluded.workspace_path,
                workspace_branch = excluded.workspace_branch,
                last_used_at = excluded.last_used_at",
        )
        .bind(&project.runner_id)
        .bind(&project.project_id)
        .bind(&project.workspace_path)
        .bind(&project.workspace_branch)
        .bind(project.last_used_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── TaskOrchestrators ──────────────────────────────────────────────────

    pub async fn upsert_task_orchestrator(&self, record: &TaskOrchestratorRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_orchestrators
                (id, organization_id, project_id, task_id, phase, status, gate_config,
                 rework_count, max_rework_attempts, current_worker_id, gate_results,
                 review_feedback, human_reviewer_id, tokens_used, cost_usd, started_at,
                 completed_at, error_message, failure_cause)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                phase = excluded.phase,
                status = excluded.status,
                gate_config = excluded.gate_config,
                rework_count = excluded.rework_count,
                current_worker_id = excluded.current_worker_id,
                gate_results = excluded.gate_results,
                review_feedback = excluded.review_feedback,
                human_reviewer_id = excluded.human_reviewer_id,
                tokens_used = excluded.tokens_used,
                cost_usd = excluded.cost_usd,
                completed_at = excluded.completed_at,
                error_message = excluded.error_message,
                failure_cause = excluded.failure_cause",
        )
        .bind(&record.id)
        .bind(&record.organization_id)
        .bind(&record.project_id)
        .bind(&record.task_id)
        .bind(task_phase_str(record.phase))
        .bind(orchestrator_status_str(record.status))
        .bind(serde_json::to_string(&record.gate_config)?)
        .bind(record.rework_count)
        .bind(record.max_rework_attempts)
        .bind(&record.current_worker_id)
        .bind(serde_json::to_string(&record.gate_results)?)
        .bind(&record.review_feedback)
        .bind(&record.human_reviewer_id)
        .bind(record.tokens_used as i64)
        .bind(record.cost_usd)
        .bind(record.started_at.to_rfc3339())
        .bind(record.completed_at.map(|t| t.to_rfc3339()))
        .bind(&record.error_message)
        .bind(record.failure_cause.map(failure_cause_str))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task_orchestrator(&self, id: &str) -> Result<Option<TaskOrchestratorRecord>> {
        let row: Option<TaskOrchestratorRow> =
            sqlx::query_as("SELECT * FROM task_orchestrators WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    // ─── MetaOrchestrators ──────────────────────────────────────────────────

    pub async fn upsert_meta_orchestrator(&self, record: &MetaOrchestratorRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta_orchestrators
                (id, organization_id, project_id, status, strategy, task_queue,
                 active_orchestrators, finished_task_ids, max_concurrent, budget_usd, spent_usd,
                 tasks_completed, tasks_failed, total_rework_cycles, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                strategy = excluded.strategy,
                task_queue = excluded.task_queue,
                active_orchestrators = excluded.active_orchestrators,
                finished_task_ids = excluded.finished_task_ids,
                max_concurrent = excluded.max_concurrent,
                budget_usd = excluded.budget_usd,
                spent_usd = excluded.spent_usd,
                tasks_completed = excluded.tasks_completed,
                tasks_failed = excluded.tasks_failed,
                total_rework_cycles = excluded.total_rework_cycles",
        )
        .bind(&record.id)
        .bind(&record.organization_id)
        .bind(&record.project_id)
        .bind(meta_status_str(record.status))
        .bind(strategy_str(record.strategy))
        .bind(serde_json::to_string(&record.task_queue)?)
        .bind(serde_json::to_string(&record.active_orchestrators)?)
        .bind(serde_json::to_string(&record.finished_task_ids)?)
        .bind(record.max_concurrent)
        .bind(record.budget_usd)
        .bind(record.spent_usd)
        .bind(record.tasks_completed as i64)
        .bind(record.tasks_failed as i64)
        .bind(record.total_rework_cycles as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Inter-agent messages ───────────────────────────────────────────────

    pub async fn insert_message(&self, msg: &InterAgentMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO inter_agent_messages
                (id, organization_id, from_agent, to_agent, message_type, subject, content,
                 response_to_id, requires_response, priority, created_at, read_at, responded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.id)
        .bind(&msg.organization_id)
        .bind(&msg.from_agent)
        .bind(&msg.to_agent)
        .bind(&msg.message_type)
        .bind(&msg.subject)
        .bind(&msg.content)
        .bind(&msg.response_to_id)
        .bind(msg.requires_response)
        .bind(msg.priority)
        .bind(msg.created_at.to_rfc3339())
        .bind(msg.read_at.map(|t| t.to_rfc3339()))
        .bind(msg.responded_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_message_read(&self, message_id: &str, read_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE inter_agent_messages SET read_at = ? WHERE id = ?")
            .bind(read_at.to_rfc3339())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_message_responded(&self, message_id: &str, responded_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE inter_agent_messages SET responded_at = ? WHERE id = ?")
            .bind(responded_at.to_rfc3339())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Approvals ──────────────────────────────────────────────────────────

    pub async fn upsert_approval(&self, approval: &Approval) -> Result<()> {
        sqlx::query(
            "INSERT INTO approvals
                (id, agent_id, action_description, proposed_command, proposed_diff,
                 status, decided_by, decided_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                decided_by = excluded.decided_by,
                decided_at = excluded.decided_at",
        )
        .bind(&approval.id)
        .bind(&approval.agent_id)
        .bind(&approval.action_description)
        .bind(&approval.proposed_command)
        .bind(&approval.proposed_diff)
        .bind(approval_status_str(approval.status))
        .bind(&approval.decided_by)
        .bind(approval.decided_at.map(|t| t.to_rfc3339()))
        .bind(approval.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Agents ─────────────────────────────────────────────────────────────

    pub async fn create_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents
                (id, organization_id, project_id, task_id, runner_id, orchestrator_id,
                 status, progress_percent, current_activity, last_heartbeat, tokens_used,
                 cost_usd, started_at, completed_at, error_count, workspace_path, standalone,
                 error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&agent.id)
        .bind(&agent.organization_id)
        .bind(&agent.project_id)
        .bind(&agent.task_id)
        .bind(&agent.runner_id)
        .bind(&agent.orchestrator_id)
        .bind(agent_status_str(agent.status))
        .bind(agent.progress_percent as i64)
        .bind(&agent.current_activity)
        .bind(agent.last_heartbeat.to_rfc3339())
        .bind(agent.tokens_used as i64)
        .bind(agent.cost_usd)
        .bind(agent.started_at.to_rfc3339())
        .bind(agent.completed_at.map(|t| t.to_rfc3339()))
        .bind(agent.error_count)
        .bind(&agent.workspace_path)
        .bind(agent.standalone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Bind a standalone agent to a TaskOrchestrator (§6.2 `promote`).
    /// Rejected unless `Agent::is_promotion_eligible` holds for the current
    /// row — checked here rather than in the caller so the check and the
    /// write happen against the same read.
    pub async fn promote_agent(&self, agent_id: &str, orchestrator_id: &str) -> Result<Agent> {
        let agent = self
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("agent not found: {agent_id}"))?;
        if !agent.is_promotion_eligible() {
            bail!("agent {agent_id} is not eligible for promotion");
        }
        sqlx::query("UPDATE agents SET orchestrator_id = ?, standalone = 0 WHERE id = ?")
            .bind(orchestrator_id)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        self.get_agent(agent_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("agent vanished during promotion: {agent_id}"))
    }

    /// Agents for an organization that have not reached a terminal status
    /// (§6.2 `list_active`).
    pub async fn list_active_agents_for_org(&self, organization_id: &str) -> Result<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT * FROM agents
             WHERE organization_id = ?
               AND status NOT IN ('completed','failed','terminated')",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Release a managed agent back to standalone (§6.2 `demote`).
    pub async fn demote_agent(&self, agent_id: &str) -> Result<Agent> {
        sqlx::query("UPDATE agents SET orchestrator_id = NULL, standalone = 1 WHERE id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        self.get_agent(agent_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("agent not found: {agent_id}"))
    }

    // ─── Checkpoints ────────────────────────────────────────────────────────

    /// Persist a checkpoint (§4.7 step 4) and clear the `latest` flag on
    /// every other checkpoint for the same agent (step 5), so the two
    /// writes observe a consistent "at most one latest" view.
    pub async fn insert_checkpoint(&self, checkpoint: &AgentCheckpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if checkpoint.latest {
            sqlx::query("UPDATE agent_checkpoints SET latest = 0 WHERE agent_id = ?")
                .bind(&checkpoint.agent_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO agent_checkpoints
                (id, agent_id, session_id, conversation_history, pending_tool_calls,
                 files_modified, uncommitted_changes, current_step, completed_steps,
                 pending_approval_id, created_at, latest)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.agent_id)
        .bind(&checkpoint.session_id)
        .bind(serde_json::to_string(&checkpoint.conversation_history)?)
        .bind(serde_json::to_string(&checkpoint.pending_tool_calls)?)
        .bind(serde_json::to_string(&checkpoint.files_modified)?)
        .bind(&checkpoint.uncommitted_changes)
        .bind(&checkpoint.current_step)
        .bind(serde_json::to_string(&checkpoint.completed_steps)?)
        .bind(&checkpoint.pending_approval_id)
        .bind(checkpoint.created_at.to_rfc3339())
        .bind(checkpoint.latest)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_latest_checkpoint(&self, agent_id: &str) -> Result<Option<AgentCheckpoint>> {
        let row: Option<AgentCheckpointRow> = sqlx::query_as(
            "SELECT * FROM agent_checkpoints WHERE agent_id = ? AND latest = 1
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn list_checkpoints(&self, agent_id: &str, limit: i64) -> Result<Vec<AgentCheckpoint>> {
        let rows: Vec<AgentCheckpointRow> = sqlx::query_as(
            "SELECT * FROM agent_checkpoints WHERE agent_id = ?
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Delete the oldest checkpoints for `agent_id` beyond `keep_count`
    /// (§4.7 step 6 / the periodic checkpoint GC timer in §9).
    pub async fn gc_checkpoints(&self, agent_id: &str, keep_count: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM agent_checkpoints WHERE agent_id = ? AND id NOT IN (
                SELECT id FROM agent_checkpoints WHERE agent_id = ?
                ORDER BY created_at DESC LIMIT ?
             )",
        )
        .bind(agent_id)
        .bind(agent_id)
        .bind(keep_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn distinct_checkpoint_agent_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT agent_id FROM agent_checkpoints")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    /// Delete terminal task orchestrator / agent rows older than `days` days.
    /// Pass `0` to skip pruning.
    pub async fn prune_old_records(&self, days: u32) -> Result<u64> {
        if days == 0 {
            return Ok(0);
        }
        with_timeout(async {
            let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
            let agents = sqlx::query(
                "DELETE FROM agents WHERE status IN ('completed','failed','terminated') AND completed_at < ?",
            )
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
            let orchestrators = sqlx::query(
                "DELETE FROM task_orchestrators WHERE status IN ('complete','failed','cancelled') AND completed_at < ?",
            )
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(agents + orchestrators)
        })
        .await
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AgentStateSink for Storage {
    async fn upsert_agent_state(
        &self,
        _organization_id: &str,
        agent_id: &str,
        update: &AgentStateUpdate,
    ) -> Result<()> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE agents SET ");
        let mut first = true;
        macro_rules! set_field {
            ($col:expr, $value:expr) => {{
                if !first {
                    builder.push(", ");
                }
                first = false;
                builder.push($col);
                builder.push(" = ");
                builder.push_bind($value);
            }};
        }

        if let Some(status) = update.status {
            set_field!("status", agent_status_str(status));
        }
        if let Some(hb) = update.last_heartbeat {
            set_field!("last_heartbeat", hb.map(|t| t.to_rfc3339()));
        }
        if let Some(tokens) = update.tokens_used {
            set_field!("tokens_used", tokens as i64);
        }
        if let Some(cost) = update.cost_usd {
            set_field!("cost_usd", cost);
        }
        if let Some(started) = update.started_at {
            set_field!("started_at", started.map(|t| t.to_rfc3339()));
        }
        if let Some(completed) = update.completed_at {
            set_field!("completed_at", completed.map(|t| t.to_rfc3339()));
        }
        if let Some(err) = &update.error_message {
            set_field!("error_message", err.clone());
        }
        if let Some(activity) = &update.current_activity {
            set_field!("current_activity", activity.clone());
        }

        if first {
            // Nothing to update.
            return Ok(());
        }

        builder.push(" WHERE id = ");
        builder.push_bind(agent_id.to_string());
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn find_stale_agents(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM agents
             WHERE status NOT IN ('completed','failed','terminated')
               AND last_heartbeat < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn mark_agent_failed(&self, agent_id: &str, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET status = 'failed', error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ─── Row <-> domain mapping ─────────────────────────────────────────────────
//
// sqlx's derive can't target the domain types directly (they use typed enums
// and `HashSet`/`Vec` fields SQLite has no native representation for), so
// every table gets a plain string/blob row type plus a fallible conversion.

#[derive(sqlx::FromRow)]
struct RunnerRow {
    id: String,
    organization_id: String,
    display_name: String,
    hostname: String,
    capabilities: String,
    max_concurrent_agents: i64,
    current_agent_count: i64,
    status: String,
    last_heartbeat: Option<String>,
    client_version: String,
    is_sandbox_runner: bool,
    bound_sandbox_id: Option<String>,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = anyhow::Error;
    fn try_from(row: RunnerRow) -> Result<Self> {
        Ok(Runner {
            id: row.id,
            organization_id: row.organization_id,
            display_name: row.display_name,
            hostname: row.hostname,
            capabilities: serde_json::from_str::<HashSet<String>>(&row.capabilities)?,
            max_concurrent_agents: row.max_concurrent_agents as u32,
            current_agent_count: row.current_agent_count as u32,
            status: parse_runner_status(&row.status)?,
            last_heartbeat: row.last_heartbeat.map(|s| parse_rfc3339(&s)).transpose()?,
            client_version: row.client_version,
            is_sandbox_runner: row.is_sandbox_runner,
            bound_sandbox_id: row.bound_sandbox_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskOrchestratorRow {
    id: String,
    organization_id: String,
    project_id: String,
    task_id: String,
    phase: String,
    status: String,
    gate_config: String,
    rework_count: i64,
    max_rework_attempts: i64,
    current_worker_id: Option<String>,
    gate_results: String,
    review_feedback: Option<String>,
    human_reviewer_id: Option<String>,
    tokens_used: i64,
    cost_usd: f64,
    started_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
    failure_cause: Option<String>,
}

impl TryFrom<TaskOrchestratorRow> for TaskOrchestratorRecord {
    type Error = anyhow::Error;
    fn try_from(row: TaskOrchestratorRow) -> Result<Self> {
        Ok(TaskOrchestratorRecord {
            id: row.id,
            organization_id: row.organization_id,
            project_id: row.project_id,
            task_id: row.task_id,
            phase: parse_task_phase(&row.phase)?,
            status: parse_orchestrator_status(&row.status)?,
            gate_config: serde_json::from_str::<Vec<GateKind>>(&row.gate_config)?,
            rework_count: row.rework_count as u32,
            max_rework_attempts: row.max_rework_attempts as u32,
            current_worker_id: row.current_worker_id,
            gate_results: serde_json::from_str::<Vec<GateResult>>(&row.gate_results)?,
            review_feedback: row.review_feedback,
            human_reviewer_id: row.human_reviewer_id,
            tokens_used: row.tokens_used as u64,
            cost_usd: row.cost_usd,
            started_at: parse_rfc3339(&row.started_at)?,
            completed_at: row.completed_at.map(|s| parse_rfc3339(&s)).transpose()?,
            error_message: row.error_message,
            failure_cause: row.failure_cause.map(|s| parse_failure_cause(&s)).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    organization_id: String,
    project_id: String,
    task_id: String,
    runner_id: Option<String>,
    orchestrator_id: Option<String>,
    status: String,
    progress_percent: i64,
    current_activity: Option<String>,
    last_heartbeat: String,
    tokens_used: i64,
    cost_usd: f64,
    started_at: String,
    completed_at: Option<String>,
    error_count: i64,
    workspace_path: Option<String>,
    standalone: bool,
    #[allow(dead_code)]
    error_message: Option<String>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = anyhow::Error;
    fn try_from(row: AgentRow) -> Result<Self> {
        Ok(Agent {
            id: row.id,
            organization_id: row.organization_id,
            project_id: row.project_id,
            task_id: row.task_id,
            runner_id: row.runner_id,
            orchestrator_id: row.orchestrator_id,
            status: parse_agent_status(&row.status)?,
            progress_percent: row.progress_percent as u8,
            current_activity: row.current_activity,
            last_heartbeat: parse_rfc3339(&row.last_heartbeat)?,
            tokens_used: row.tokens_used as u64,
            cost_usd: row.cost_usd,
            started_at: parse_rfc3339(&row.started_at)?,
            completed_at: row.completed_at.map(|s| parse_rfc3339(&s)).transpose()?,
            error_count: row.error_count as u32,
            workspace_path: row.workspace_path,
            standalone: row.standalone,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentCheckpointRow {
    id: String,
    agent_id: String,
    session_id: String,
    conversation_history: String,
    pending_tool_calls: String,
    files_modified: String,
    uncommitted_changes: String,
    current_step: Option<String>,
    completed_steps: String,
    pending_approval_id: Option<String>,
    created_at: String,
    latest: bool,
}

impl TryFrom<AgentCheckpointRow> for AgentCheckpoint {
    type Error = anyhow::Error;
    fn try_from(row: AgentCheckpointRow) -> Result<Self> {
        Ok(AgentCheckpoint {
            id: row.id,
            agent_id: row.agent_id,
            session_id: row.session_id,
            conversation_history: serde_json::from_str(&row.conversation_history)?,
            pending_tool_calls: serde_json::from_str(&row.pending_tool_calls)?,
            files_modified: serde_json::from_str(&row.files_modified)?,
            uncommitted_changes: row.uncommitted_changes,
            current_step: row.current_step,
            completed_steps: serde_json::from_str(&row.completed_steps)?,
            pending_approval_id: row.pending_approval_id,
            created_at: parse_rfc3339(&row.created_at)?,
            latest: row.latest,
        })
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn runner_status_str(s: RunnerStatus) -> &'static str {
    match s {
        RunnerStatus::Offline => "offline",
        RunnerStatus::Online => "online",
        RunnerStatus::Busy => "busy",
        RunnerStatus::Draining => "draining",
    }
}

fn parse_runner_status(s: &str) -> Result<RunnerStatus> {
    Ok(match s {
        "offline" => RunnerStatus::Offline,
        "online" => RunnerStatus::Online,
        "busy" => RunnerStatus::Busy,
        "draining" => RunnerStatus::Draining,
        other => anyhow::bail!("unknown runner status in storage: {other}"),
    })
}

fn task_phase_str(p: TaskPhase) -> &'static str {
    match p {
        TaskPhase::Implement => "implement",
        TaskPhase::Gates => "gates",
        TaskPhase::Review => "review",
        TaskPhase::Rework => "rework",
        TaskPhase::Complete => "complete",
        TaskPhase::Failed => "failed",
        TaskPhase::Cancelled => "cancelled",
    }
}

fn parse_task_phase(s: &str) -> Result<TaskPhase> {
    Ok(match s {
        "implement" => TaskPhase::Implement,
        "gates" => TaskPhase::Gates,
        "review" => TaskPhase::Review,
        "rework" => TaskPhase::Rework,
        "complete" => TaskPhase::Complete,
        "failed" => TaskPhase::Failed,
        "cancelled" => TaskPhase::Cancelled,
        other => anyhow::bail!("unknown task phase in storage: {other}"),
    })
}

fn orchestrator_status_str(s: OrchestratorStatus) -> &'static str {
    match s {
        OrchestratorStatus::Pending => "pending",
        OrchestratorStatus::Running => "running",
        OrchestratorStatus::WaitingReview => "waiting_review",
        OrchestratorStatus::Complete => "complete",
        OrchestratorStatus::Failed => "failed",
        OrchestratorStatus::Cancelled => "cancelled",
    }
}

fn parse_orchestrator_status(s: &str) -> Result<OrchestratorStatus> {
    Ok(match s {
        "pending" => OrchestratorStatus::Pending,
        "running" => OrchestratorStatus::Running,
        "waiting_review" => OrchestratorStatus::WaitingReview,
        "complete" => OrchestratorStatus::Complete,
        "failed" => OrchestratorStatus::Failed,
        "cancelled" => OrchestratorStatus::Cancelled,
        other => anyhow::bail!("unknown orchestrator status in storage: {other}"),
    })
}

fn failure_cause_str(c: FailureCause) -> &'static str {
    match c {
        FailureCause::ReworkLimit => "rework_limit",
        FailureCause::RunnerUnavailable => "runner_unavailable",
        FailureCause::GateTimeout => "gate_timeout",
        FailureCause::AgentError => "agent_error",
        FailureCause::Cancelled => "cancelled",
    }
}

fn parse_failure_cause(s: &str) -> Result<FailureCause> {
    Ok(match s {
        "rework_limit" => FailureCause::ReworkLimit,
        "runner_unavailable" => FailureCause::RunnerUnavailable,
        "gate_timeout" => FailureCause::GateTimeout,
        "agent_error" => FailureCause::AgentError,
        "cancelled" => FailureCause::Cancelled,
        other => anyhow::bail!("unknown failure cause in storage: {other}"),
    })
}

fn agent_status_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Initializing => "initializing",
        AgentStatus::Working => "working",
        AgentStatus::Paused => "paused",
        AgentStatus::Completed => "completed",
        AgentStatus::Failed => "failed",
        AgentStatus::Terminated => "terminated",
    }
}

fn parse_agent_status(s: &str) -> Result<AgentStatus> {
    Ok(match s {
        "initializing" => AgentStatus::Initializing,
        "working" => AgentStatus::Working,
        "paused" => AgentStatus::Paused,
        "completed" => AgentStatus::Completed,
        "failed" => AgentStatus::Failed,
        "terminated" => AgentStatus::Terminated,
        other => anyhow::bail!("unknown agent status in storage: {other}"),
    })
}

fn meta_status_str(s: MetaStatus) -> &'static str {
    match s {
        MetaStatus::Idle => "idle",
        MetaStatus::Running => "running",
        MetaStatus::Paused => "paused",
        MetaStatus::Complete => "complete",
    }
}

fn strategy_str(s: Strategy) -> &'static str {
    match s {
        Strategy::Sequential => "sequential",
        Strategy::Parallel => "parallel",
        Strategy::Priority => "priority",
    }
}

fn approval_status_str(s: ApprovalStatus) -> &'static str {
    match s {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Denied => "denied",
        ApprovalStatus::Expired => "expired",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::new_id;
    use tempfile::TempDir;

    fn sample_agent(id: &str) -> Agent {
        Agent {
            id: id.to_string(),
            organization_id: "org-1".to_string(),
            project_id: "proj-1".to_string(),
            task_id: "task-1".to_string(),
            runner_id: None,
            orchestrator_id: None,
            status: AgentStatus::Working,
            progress_percent: 10,
            current_activity: Some("writing tests".to_string()),
            last_heartbeat: Utc::now(),
            tokens_used: 100,
            cost_usd: 0.05,
            started_at: Utc::now(),
            completed_at: None,
            error_count: 0,
            workspace_path: Some("/tmp/ws".to_string()),
            standalone: false,
        }
    }

    #[tokio::test]
    async fn create_and_get_agent_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let agent = sample_agent(&new_id("agent"));
        storage.create_agent(&agent).await.unwrap();

        let fetched = storage.get_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, agent.id);
        assert_eq!(fetched.status, AgentStatus::Working);
        assert_eq!(fetched.tokens_used, 100);
    }

    #[tokio::test]
    async fn upsert_agent_state_updates_only_provided_fields() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let agent = sample_agent(&new_id("agent"));
        storage.create_agent(&agent).await.unwrap();

        storage
            .upsert_agent_state(
                "org-1",
                &agent.id,
                &AgentStateUpdate {
                    status: Some(AgentStatus::Completed),
                    tokens_used: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let fetched = storage.get_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Completed);
        assert_eq!(fetched.tokens_used, 500);
        // current_activity was not touched by the partial update.
        assert_eq!(fetched.current_activity.as_deref(), Some("writing tests"));
    }

    #[tokio::test]
    async fn find_stale_agents_excludes_terminal_and_fresh() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();

        let mut stale = sample_agent(&new_id("agent"));
        stale.last_heartbeat = Utc::now() - chrono::Duration::minutes(10);
        storage.create_agent(&stale).await.unwrap();

        let mut fresh = sample_agent(&new_id("agent"));
        fresh.last_heartbeat = Utc::now();
        storage.create_agent(&fresh).await.unwrap();

        let mut done = sample_agent(&new_id("agent"));
        done.status = AgentStatus::Completed;
        done.last_heartbeat = Utc::now() - chrono::Duration::minutes(30);
        storage.create_agent(&done).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let stale_ids = storage.find_stale_agents(cutoff).await.unwrap();
        assert_eq!(stale_ids, vec![stale.id]);
    }

    #[tokio::test]
    async fn mark_agent_failed_sets_terminal_status() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let agent = sample_agent(&new_id("agent"));
        storage.create_agent(&agent).await.unwrap();

        storage
            .mark_agent_failed(&agent.id, "worker_crashed")
            .await
            .unwrap();

        let fetched = storage.get_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Failed);
    }
}
