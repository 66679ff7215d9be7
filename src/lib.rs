pub mod approval;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod gates;
pub mod gateway;
pub mod health;
pub mod message_bus;
pub mod meta_orchestrator;
pub mod observability;
pub mod registry;
pub mod retry;
pub mod rollout;
pub mod router;
pub mod runtime_adapter;
pub mod state_sync;
pub mod storage;
pub mod task_orchestrator;
pub mod worktree;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use approval::{ApprovalQueue, SharedApprovalQueue};
use checkpoint::CheckpointStore;
use config::SibylConfig;
use dispatch::TaskDispatcher;
use gateway::{OutboundRegistry, SharedOutboundRegistry};
use message_bus::{MessageBus, SharedMessageBus};
use meta_orchestrator::{MetaOrchestratorStore, SharedMetaOrchestratorStore};
use registry::{RunnerRegistry, SharedRunnerRegistry};
use runtime_adapter::AgentRuntimeAdapter;
use state_sync::AgentStateSink;
use storage::Storage;
use worktree::{SharedWorktreeManager, WorktreeManager};

/// Wiring for one running control plane instance: every component the
/// gateway's `RpcDispatcher` and the background timer tasks need a handle
/// to. Analogous to the teacher's `AppContext`, generalized from a
/// single-tenant daemon to the multi-tenant Sibyl control plane (§1, §5).
#[derive(Clone)]
pub struct ControlPlane {
    pub config: Arc<SibylConfig>,
    pub storage: Arc<Storage>,
    pub registry: SharedRunnerRegistry,
    pub message_bus: SharedMessageBus,
    pub approvals: SharedApprovalQueue,
    pub checkpoints: Arc<CheckpointStore>,
    pub meta_orchestrators: SharedMetaOrchestratorStore,
    pub worktrees: SharedWorktreeManager,
    pub runtime_adapter: Arc<dyn AgentRuntimeAdapter>,
    /// Per-runner outbound push channels for the gateway's core -> runner
    /// wire methods (§4.2) — shared between `gateway::run` and `dispatch`.
    pub gateway_outbound: SharedOutboundRegistry,
    pub dispatcher: Arc<TaskDispatcher>,
    pub started_at: std::time::Instant,
}

impl ControlPlane {
    pub async fn new(config: SibylConfig, runtime_adapter: Arc<dyn AgentRuntimeAdapter>) -> anyhow::Result<Self> {
        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let worktrees = Arc::new(WorktreeManager::new(&config.data_dir));
        let registry = Arc::new(RunnerRegistry::new());
        let gateway_outbound = Arc::new(OutboundRegistry::new());
        let dispatcher = Arc::new(TaskDispatcher::new(registry.clone(), gateway_outbound.clone()));
        let checkpoints = Arc::new(CheckpointStore::new(storage.clone()));
        let message_bus = Arc::new(MessageBus::with_storage(storage.clone()));
        let approvals = Arc::new(ApprovalQueue::with_storage(storage.clone()));
        let meta_orchestrators = Arc::new(MetaOrchestratorStore::with_storage(storage.clone()));

        Ok(Self {
            config: Arc::new(config),
            storage,
            registry,
            message_bus,
            approvals,
            checkpoints,
            meta_orchestrators,
            worktrees,
            runtime_adapter,
            gateway_outbound,
            dispatcher,
            started_at: std::time::Instant::now(),
        })
    }

    /// Spawn the three background timer tasks named in §5: the stale-agent
    /// reaper, the checkpoint garbage collector, and the orphaned-job
    /// sweep. Each stops cleanly when `shutdown` fires, mirroring the
    /// teacher's `ipc::mod` request-loop shutdown handling.
    pub fn spawn_background_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.spawn_stale_agent_reaper(shutdown.clone()),
            self.spawn_checkpoint_gc(shutdown.clone()),
            self.spawn_orphaned_job_sweep(shutdown),
        ]
    }

    fn spawn_stale_agent_reaper(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let storage = self.storage.clone();
        let stale_seconds = self.config.heartbeat_stale_seconds;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(5);
                        let _ = stale_seconds; // threshold for routing eligibility, not reaping
                        match storage.find_stale_agents(cutoff).await {
                            Ok(ids) => {
                                for id in ids {
                                    if let Err(e) = storage.mark_agent_failed(&id, "worker_crashed").await {
                                        warn!(agent_id = %id, err = %e, "failed to reap stale agent");
                                    } else {
                                        info!(agent_id = %id, "reaped stale agent");
                                    }
                                }
                            }
                            Err(e) => warn!(err = %e, "stale-agent scan failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("stale-agent reaper shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    fn spawn_checkpoint_gc(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let checkpoints = self.checkpoints.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        checkpoints.sweep().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("checkpoint gc shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    fn spawn_orphaned_job_sweep(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let storage = self.storage.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // An orphaned agent is one whose runner no longer exists
                        // in the registry (the runner connection dropped without
                        // a clean drain) but whose agent row is still non-terminal.
                        let cutoff = chrono::Utc::now();
                        match storage.find_stale_agents(cutoff).await {
                            Ok(ids) => {
                                for id in ids {
                                    if let Some(agent) = storage.get_agent(&id).await.ok().flatten() {
                                        if let Some(runner_id) = &agent.runner_id {
                                            if registry.get(runner_id).await.is_none() {
                                                let _ = storage
                                                    .mark_agent_failed(&id, "orphaned: owning runner no longer registered")
                                                    .await;
                                            }
                                        }
                                    }
                                }
                            }
                            Err(e) => warn!(err = %e, "orphaned-job sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("orphaned-job sweep shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }
}
