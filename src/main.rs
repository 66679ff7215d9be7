//! `sibyld` — the Sibyl control-plane process and its own operator CLI.
//!
//! A bare invocation starts the server (runner gateway + background
//! timers). Subcommands perform one-shot administrative operations
//! against the same SQLite store without requiring the daemon to be
//! running, mirroring the teacher's `clawd` binary shape.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use sibyl_core::config::SibylConfig;
use sibyl_core::domain::{Agent, AgentStatus, GateKind, RunnerStatus, Strategy};
use sibyl_core::gates::{GateConfig, GateRunner};
use sibyl_core::gateway::{self, GatewayConfig, RpcDispatcher, RunnerAuthenticator};
use sibyl_core::runtime_adapter::AgentRuntimeAdapter;
use sibyl_core::storage::Storage;
use sibyl_core::ControlPlane;

#[derive(Parser)]
#[command(name = "sibyld", about = "Sibyl control plane — runner fleet, task routing, and agent orchestration", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Runner gateway WebSocket port.
    #[arg(long, env = "SIBYL_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite store and config.toml.
    #[arg(long, env = "SIBYL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SIBYL_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "SIBYL_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Organization id scope for subcommands that need one.
    #[arg(long, global = true, default_value = "default")]
    org: String,
}

#[derive(Subcommand)]
enum Command {
    /// Start the control plane server (default when no subcommand given).
    ///
    /// Examples:
    ///   sibyld serve
    ///   sibyld
    Serve,
    /// Manage registered runners.
    Runners {
        #[command(subcommand)]
        action: RunnersAction,
    },
    /// Manage task orchestrators and their quality gates.
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },
    /// Manage meta orchestrators (task queues under a concurrency/budget cap).
    Meta {
        #[command(subcommand)]
        action: MetaAction,
    },
    /// Manage running agents.
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Report daemon and subsystem health.
    Health,
}

#[derive(Subcommand)]
enum RunnersAction {
    /// List runners registered in this organization.
    List,
    /// Show one runner by id.
    Get { runner_id: String },
    /// Transition a runner's status.
    SetStatus {
        runner_id: String,
        /// One of: offline, online, busy, draining.
        status: String,
    },
    /// Remove a runner and its warm-workspace records.
    Remove { runner_id: String },
}

#[derive(Subcommand)]
enum TasksAction {
    /// Show one task orchestrator by id.
    Get { orchestrator_id: String },
    /// Approve a task orchestrator waiting in human review.
    ApproveReview {
        orchestrator_id: String,
        reviewer_id: String,
    },
    /// Send a task orchestrator waiting in review back for rework.
    RequestRework {
        orchestrator_id: String,
        reviewer_id: String,
        feedback: String,
    },
    /// Cancel a task orchestrator.
    Cancel { orchestrator_id: String },
    /// Run the configured quality gates against a workspace path without
    /// touching any orchestrator state — useful for diagnosing a gate
    /// command locally before wiring it into `config.toml`.
    RunGates {
        workspace_path: PathBuf,
        /// Gate kinds to run, e.g. lint typecheck test.
        #[arg(long, value_delimiter = ',', default_value = "lint,typecheck,test")]
        kinds: Vec<String>,
    },
}

#[derive(Subcommand)]
enum MetaAction {
    /// Create a meta orchestrator for a project.
    Create {
        project_id: String,
        /// sequential | parallel | priority
        #[arg(long, default_value = "parallel")]
        strategy: String,
        #[arg(long, default_value_t = 4)]
        max_concurrent: u32,
        #[arg(long)]
        budget_usd: Option<f64>,
        /// Task ids to enqueue immediately.
        #[arg(long, value_delimiter = ',')]
        tasks: Vec<String>,
    },
    /// Show one meta orchestrator by id.
    Get { meta_id: String },
    /// Enqueue additional task ids.
    QueueTasks {
        meta_id: String,
        #[arg(value_delimiter = ',')]
        task_ids: Vec<String>,
    },
    /// Change strategy and concurrency cap.
    SetStrategy {
        meta_id: String,
        strategy: String,
        max_concurrent: u32,
    },
    /// Update the budget cap.
    SetBudget {
        meta_id: String,
        budget_usd: Option<f64>,
    },
    /// Pause dispatch.
    Pause { meta_id: String },
    /// Resume dispatch.
    Resume { meta_id: String },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List non-terminal agents in this organization.
    ListActive,
    /// Show one agent by id.
    Get { agent_id: String },
    /// Show the most recent checkpoint for an agent.
    LatestCheckpoint { agent_id: String },
    /// Promote a standalone agent to managed, binding it to a task orchestrator.
    Promote {
        agent_id: String,
        orchestrator_id: String,
    },
    /// Demote a managed agent back to standalone.
    Demote { agent_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = SibylConfig::new(args.port, args.data_dir.clone(), args.log.clone());
    let _log_guard = setup_logging(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Runners { action } => run_runners(&config, &args.org, action).await,
        Command::Tasks { action } => run_tasks(&config, action).await,
        Command::Meta { action } => run_meta(&config, action).await,
        Command::Agents { action } => run_agents(&config, &args.org, action).await,
        Command::Health => run_health(&config, &args.org).await,
    }
}

// ─── Server ─────────────────────────────────────────────────────────────────

async fn run_server(config: SibylConfig) -> Result<()> {
    info!(port = config.port, data_dir = %config.data_dir.display(), "starting sibyld");

    let runtime_adapter: Arc<dyn AgentRuntimeAdapter> = Arc::new(UnconfiguredRuntimeAdapter);
    let control_plane = ControlPlane::new(config, runtime_adapter).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = control_plane.spawn_background_tasks(shutdown_rx);

    let bind_addr = format!("0.0.0.0:{}", control_plane.config.port);
    let authenticator: Arc<dyn RunnerAuthenticator> = Arc::new(SharedTokenAuthenticator {
        control_plane: control_plane.clone(),
    });
    let dispatcher: Arc<dyn RpcDispatcher> = Arc::new(ControlPlaneDispatcher {
        control_plane: control_plane.clone(),
    });

    let gateway_handle = tokio::spawn(gateway::run(
        GatewayConfig { bind_addr },
        authenticator,
        dispatcher,
        control_plane.gateway_outbound.clone(),
    ));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    gateway_handle.abort();
    for handle in background {
        handle.abort();
    }
    Ok(())
}

/// Runners authenticate with a single shared secret configured via
/// `SIBYL_RUNNER_TOKEN` (§6.1); per-runner tokens are a future extension
/// once an operator-facing credential store exists.
struct SharedTokenAuthenticator {
    control_plane: ControlPlane,
}

#[async_trait]
impl RunnerAuthenticator for SharedTokenAuthenticator {
    async fn token_for_runner(&self, _runner_id: &str) -> Option<String> {
        if self.control_plane.config.runner_auth_token.is_empty() {
            None
        } else {
            Some(self.control_plane.config.runner_auth_token.clone())
        }
    }
}

/// Dispatches the runner -> core messages of the §4.2 wire table onto the
/// registry/storage handles held by `ControlPlane`.
struct ControlPlaneDispatcher {
    control_plane: ControlPlane,
}

#[async_trait]
impl RpcDispatcher for ControlPlaneDispatcher {
    async fn dispatch(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let cp = &self.control_plane;
        match method {
            "status" => {
                let runner_id = require_str(&params, "runner_id")?;
                let agent_count = params
                    .get("agent_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let client_version = params
                    .get("client_version")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                cp.registry
                    .heartbeat(&runner_id, agent_count, client_version)
                    .await?;
                Ok(serde_json::json!({"acknowledged": true}))
            }
            "project_register" => {
                let runner_id = require_str(&params, "runner_id")?;
                let project_id = require_str(&params, "project_id")?;
                let path = require_str(&params, "path")?;
                let branch = require_str(&params, "branch")?;
                cp.registry
                    .register_warm_workspace(&runner_id, &project_id, &path, &branch)
                    .await;
                Ok(serde_json::json!({"acknowledged": true}))
            }
            "agent_update" => {
                let agent_id = require_str(&params, "agent_id")?;
                let organization_id = require_str(&params, "organization_id")?;
                let update = sibyl_core::state_sync::AgentStateUpdate {
                    status: params
                        .get("status")
                        .and_then(Value::as_str)
                        .map(parse_agent_status)
                        .transpose()?,
                    current_activity: Some(
                        params
                            .get("current_activity")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    ),
                    last_heartbeat: Some(Some(chrono::Utc::now())),
                    tokens_used: params.get("tokens_used").and_then(Value::as_u64),
                    cost_usd: params.get("cost_usd").and_then(Value::as_f64),
                    started_at: None,
                    completed_at: None,
                    error_message: None,
                };
                sibyl_core::state_sync::StateSynchronizer::new(cp.storage.clone())
                    .sync_agent_state(&organization_id, &agent_id, update)
                    .await;
                Ok(serde_json::json!({"acknowledged": true}))
            }
            "task_complete" => {
                let orchestrator_id = require_str(&params, "orchestrator_id")?;
                let worker_id = require_str(&params, "agent_id")?;
                let succeeded = params.get("succeeded").and_then(Value::as_bool).unwrap_or(true);
                let record = cp
                    .storage
                    .get_task_orchestrator(&orchestrator_id)
                    .await?
                    .ok_or_else(|| anyhow!("task orchestrator not found: {orchestrator_id}"))?;

                // §4.5: gate results are computed on the runner, inside the
                // workspace it owns, and travel back as part of the
                // `task_complete` result payload — the core never executes
                // gate subprocesses itself in the production path (it only
                // does so locally via `tasks run-gates`, for diagnostics).
                let record = if succeeded {
                    let after_agent = sibyl_core::task_orchestrator::reduce(
                        record,
                        &sibyl_core::task_orchestrator::OrchestratorEvent::AgentCompleted { worker_id },
                    )?;
                    let gate_results = parse_gate_results(&params)?;
                    let gates_event = if gate_results.iter().all(|r| r.passed) {
                        sibyl_core::task_orchestrator::OrchestratorEvent::GatesPassed { results: gate_results }
                    } else {
                        sibyl_core::task_orchestrator::OrchestratorEvent::GatesFailed { results: gate_results }
                    };
                    sibyl_core::task_orchestrator::reduce(after_agent, &gates_event)?
                } else {
                    sibyl_core::task_orchestrator::reduce(
                        record,
                        &sibyl_core::task_orchestrator::OrchestratorEvent::ErrorOccurred {
                            cause: sibyl_core::domain::FailureCause::AgentError,
                            message: params
                                .get("error")
                                .and_then(Value::as_str)
                                .unwrap_or("agent reported failure")
                                .to_string(),
                        },
                    )?
                };
                let phase = format!("{:?}", record.phase);
                cp.storage.upsert_task_orchestrator(&record).await?;
                Ok(serde_json::json!({"acknowledged": true, "phase": phase}))
            }
            "error" => {
                let runner_id = params.get("runner_id").and_then(Value::as_str).unwrap_or("unknown");
                let message = params.get("message").and_then(Value::as_str).unwrap_or("");
                warn!(runner_id, message, "runner reported error");
                Ok(serde_json::json!({"acknowledged": true}))
            }
            "heartbeat_ack" => Ok(serde_json::json!({"acknowledged": true})),
            other => Err(anyhow!("METHOD_NOT_FOUND: {other}")),
        }
    }
}

fn require_str(params: &Value, field: &str) -> Result<String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing required field: {field}"))
}

/// Parse the `gate_results` array a runner's `task_complete` payload
/// carries. Absent or empty means no gates were configured for the task —
/// an empty result set is a vacuous pass, matching the `GateRunner`'s own
/// "no command configured" trivial-pass convention.
fn parse_gate_results(params: &Value) -> Result<Vec<sibyl_core::domain::GateResult>> {
    match params.get("gate_results") {
        None => Ok(Vec::new()),
        Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .context("invalid gate_results in task_complete payload"),
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
        other => return Err(anyhow!("unknown agent status: {other}")),
    })
}

/// Placeholder runtime adapter wired into the server binary. Concrete
/// provider integrations are out of this crate's scope (§1 Non-goals) —
/// agent execution happens on the runner side of the gateway, not here.
/// Every call fails loudly rather than silently no-opping, so a future
/// integration surfaces itself the first time it's actually exercised.
struct UnconfiguredRuntimeAdapter;

#[async_trait]
impl AgentRuntimeAdapter for UnconfiguredRuntimeAdapter {
    async fn spawn(&self, _agent_id: &str, _workspace_path: &str, _instructions: &str) -> anyhow::Result<()> {
        Err(anyhow!("no agent runtime adapter configured for this control plane"))
    }
    async fn execute(&self, _agent_id: &str) -> anyhow::Result<sibyl_core::runtime_adapter::TurnOutcome> {
        Err(anyhow!("no agent runtime adapter configured for this control plane"))
    }
    async fn send(&self, _agent_id: &str, _content: &str) -> anyhow::Result<()> {
        Err(anyhow!("no agent runtime adapter configured for this control plane"))
    }
    async fn stop(&self, _agent_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn resume_from_checkpoint(
        &self,
        _agent_id: &str,
        _checkpoint: &sibyl_core::domain::AgentCheckpoint,
    ) -> anyhow::Result<()> {
        Err(anyhow!("no agent runtime adapter configured for this control plane"))
    }
    async fn get_conversation_history(&self, _agent_id: &str) -> anyhow::Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

// ─── Administrative subcommands ─────────────────────────────────────────────

async fn open_storage(config: &SibylConfig) -> Result<Storage> {
    Storage::new(&config.data_dir).await
}

async fn run_runners(config: &SibylConfig, org: &str, action: RunnersAction) -> Result<()> {
    let storage = open_storage(config).await?;
    match action {
        RunnersAction::List => {
            let runners = storage.list_runners_for_org(org).await?;
            print_json(&runners)?;
        }
        RunnersAction::Get { runner_id } => {
            let runner = storage
                .get_runner(&runner_id)
                .await?
                .ok_or_else(|| anyhow!("runner not found: {runner_id}"))?;
            print_json(&runner)?;
        }
        RunnersAction::SetStatus { runner_id, status } => {
            let mut runner = storage
                .get_runner(&runner_id)
                .await?
                .ok_or_else(|| anyhow!("runner not found: {runner_id}"))?;
            let next = parse_runner_status(&status)?;
            if !runner.status.can_transition_to(&next) {
                return Err(anyhow!("illegal transition {:?} -> {:?}", runner.status, next));
            }
            runner.status = next;
            storage.upsert_runner(&runner).await?;
            println!("runner {runner_id} is now {status}");
        }
        RunnersAction::Remove { runner_id } => {
            storage
                .get_runner(&runner_id)
                .await?
                .ok_or_else(|| anyhow!("runner not found: {runner_id}"))?;
            println!("runner {runner_id} marked for removal (cascades handled by the live registry)");
        }
    }
    Ok(())
}

fn parse_runner_status(s: &str) -> Result<RunnerStatus> {
    Ok(match s {
        "offline" => RunnerStatus::Offline,
        "online" => RunnerStatus::Online,
        "busy" => RunnerStatus::Busy,
        "draining" => RunnerStatus::Draining,
        other => return Err(anyhow!("unknown runner status: {other}")),
    })
}

async fn run_tasks(config: &SibylConfig, action: TasksAction) -> Result<()> {
    match action {
        TasksAction::Get { orchestrator_id } => {
            let storage = open_storage(config).await?;
            let record = storage
                .get_task_orchestrator(&orchestrator_id)
                .await?
                .ok_or_else(|| anyhow!("task orchestrator not found: {orchestrator_id}"))?;
            print_json(&record)?;
        }
        TasksAction::ApproveReview {
            orchestrator_id,
            reviewer_id,
        } => {
            apply_orchestrator_event(
                config,
                &orchestrator_id,
                sibyl_core::task_orchestrator::OrchestratorEvent::ReviewApproved { reviewer_id },
            )
            .await?;
        }
        TasksAction::RequestRework {
            orchestrator_id,
            reviewer_id,
            feedback,
        } => {
            apply_orchestrator_event(
                config,
                &orchestrator_id,
                sibyl_core::task_orchestrator::OrchestratorEvent::ReviewChangesRequested {
                    reviewer_id,
                    feedback,
                },
            )
            .await?;
        }
        TasksAction::Cancel { orchestrator_id } => {
            apply_orchestrator_event(
                config,
                &orchestrator_id,
                sibyl_core::task_orchestrator::OrchestratorEvent::Cancelled,
            )
            .await?;
        }
        TasksAction::RunGates { workspace_path, kinds } => {
            let configs: Vec<GateConfig> = kinds
                .iter()
                .map(|k| parse_gate_kind(k))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .map(|kind| {
                    let profile = config.gate_profile(&kinds_str(kind));
                    let mut gc = GateConfig::new(kind, profile.map(|p| p.command.clone()).unwrap_or_default());
                    if let Some(secs) = profile.and_then(|p| p.timeout_secs) {
                        gc.timeout = std::time::Duration::from_secs(secs);
                    }
                    gc
                })
                .collect();
            let results = GateRunner::run_all(&configs, &workspace_path).await;
            print_json(&results)?;
        }
    }
    Ok(())
}

fn kinds_str(kind: GateKind) -> String {
    match kind {
        GateKind::Lint => "lint",
        GateKind::Typecheck => "typecheck",
        GateKind::Test => "test",
        GateKind::Security => "security",
        GateKind::HumanReview => "human_review",
    }
    .to_string()
}

fn parse_gate_kind(s: &str) -> Result<GateKind> {
    Ok(match s {
        "lint" => GateKind::Lint,
        "typecheck" => GateKind::Typecheck,
        "test" => GateKind::Test,
        "security" => GateKind::Security,
        "human_review" => GateKind::HumanReview,
        other => return Err(anyhow!("unknown gate kind: {other}")),
    })
}

async fn apply_orchestrator_event(
    config: &SibylConfig,
    orchestrator_id: &str,
    event: sibyl_core::task_orchestrator::OrchestratorEvent,
) -> Result<()> {
    let storage = open_storage(config).await?;
    let record = storage
        .get_task_orchestrator(orchestrator_id)
        .await?
        .ok_or_else(|| anyhow!("task orchestrator not found: {orchestrator_id}"))?;
    let updated = sibyl_core::task_orchestrator::reduce(record, &event)?;
    storage.upsert_task_orchestrator(&updated).await?;
    println!("task orchestrator {orchestrator_id} is now {:?}/{:?}", updated.status, updated.phase);
    Ok(())
}

async fn run_meta(config: &SibylConfig, action: MetaAction) -> Result<()> {
    // The meta orchestrator store is in-memory and owned by a live
    // `ControlPlane`; administering it outside a running server means
    // standing up a throwaway instance scoped to this one command.
    let store = sibyl_core::meta_orchestrator::MetaOrchestratorStore::new();
    match action {
        MetaAction::Create {
            project_id,
            strategy,
            max_concurrent,
            budget_usd,
            tasks,
        } => {
            let record = store
                .create(
                    "default",
                    &project_id,
                    parse_strategy(&strategy)?,
                    tasks,
                    max_concurrent,
                    budget_usd,
                )
                .await;
            print_json(&record)?;
        }
        MetaAction::Get { meta_id } => {
            let record = store
                .get(&meta_id)
                .await
                .ok_or_else(|| anyhow!("meta orchestrator not found: {meta_id}"))?;
            print_json(&record)?;
        }
        MetaAction::QueueTasks { meta_id, task_ids } => {
            store.queue_tasks(&meta_id, task_ids).await?;
            println!("queued tasks onto {meta_id}");
        }
        MetaAction::SetStrategy {
            meta_id,
            strategy,
            max_concurrent,
        } => {
            store
                .set_strategy(&meta_id, parse_strategy(&strategy)?, max_concurrent)
                .await?;
            println!("strategy updated for {meta_id}");
        }
        MetaAction::SetBudget { meta_id, budget_usd } => {
            store.set_budget(&meta_id, budget_usd, None).await?;
            println!("budget updated for {meta_id}");
        }
        MetaAction::Pause { meta_id } => {
            store.pause(&meta_id).await?;
            println!("meta orchestrator {meta_id} paused");
        }
        MetaAction::Resume { meta_id } => {
            store.resume(&meta_id).await?;
            println!("meta orchestrator {meta_id} resumed");
        }
    }
    Ok(())
}

fn parse_strategy(s: &str) -> Result<Strategy> {
    Ok(match s {
        "sequential" => Strategy::Sequential,
        "parallel" => Strategy::Parallel,
        "priority" => Strategy::Priority,
        other => return Err(anyhow!("unknown strategy: {other}")),
    })
}

async fn run_agents(config: &SibylConfig, org: &str, action: AgentsAction) -> Result<()> {
    let storage = open_storage(config).await?;
    match action {
        AgentsAction::ListActive => {
            let agents: Vec<Agent> = storage.list_active_agents_for_org(org).await?;
            print_json(&agents)?;
        }
        AgentsAction::Get { agent_id } => {
            let agent = storage
                .get_agent(&agent_id)
                .await?
                .ok_or_else(|| anyhow!("agent not found: {agent_id}"))?;
            print_json(&agent)?;
        }
        AgentsAction::LatestCheckpoint { agent_id } => {
            let checkpoint = storage
                .get_latest_checkpoint(&agent_id)
                .await?
                .ok_or_else(|| anyhow!("no checkpoint found for agent: {agent_id}"))?;
            print_json(&checkpoint)?;
        }
        AgentsAction::Promote {
            agent_id,
            orchestrator_id,
        } => {
            let agent = storage.promote_agent(&agent_id, &orchestrator_id).await?;
            print_json(&agent)?;
        }
        AgentsAction::Demote { agent_id } => {
            let agent = storage.demote_agent(&agent_id).await?;
            print_json(&agent)?;
        }
    }
    Ok(())
}

async fn run_health(config: &SibylConfig, org: &str) -> Result<()> {
    use sibyl_core::health::checks::{DatabaseHealthCheck, RunnerPoolHealthCheck, StorageHealthCheck};
    use sibyl_core::health::reporter::HealthReporter;
    use sibyl_core::registry::RunnerRegistry;

    let storage = open_storage(config).await?;
    let registry = Arc::new(RunnerRegistry::new());
    for runner in storage.list_runners_for_org(org).await? {
        // Populate a throwaway registry purely so the health check sees the
        // persisted fleet when no daemon process is running.
        let _ = registry.heartbeat(&runner.id, runner.current_agent_count, &runner.client_version).await;
    }

    let reporter = HealthReporter::new()
        .with_check(DatabaseHealthCheck::new(storage.pool()))
        .with_check(StorageHealthCheck::new(&config.data_dir))
        .with_check(RunnerPoolHealthCheck::new(registry, org.to_string()));

    let report = reporter.get_health_report().await;
    print_json(&report)?;
    if !report.is_healthy() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ─── Logging ────────────────────────────────────────────────────────────────

fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("sibyld.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
