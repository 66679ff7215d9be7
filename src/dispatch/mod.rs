//! Task dispatch coordinator — the glue named in §2's dataflow diagram
//! between `TaskRouter.score`, `Gateway.send(runner, task_assign)`, and the
//! `RunnerRegistry` slot accounting, kept as its own thin component so
//! neither the router (pure scoring) nor the gateway (pure transport) has
//! to know about the other. Grounded on the teacher's `scheduler::dispatch`
//! pattern of "score candidates, reserve a slot, hand off to the transport,
//! roll back the reservation on transport failure".

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::domain::Task;
use crate::gateway::SharedOutboundRegistry;
use crate::registry::SharedRunnerRegistry;
use crate::router::{self, RoutingResult};

pub struct TaskDispatcher {
    registry: SharedRunnerRegistry,
    outbound: SharedOutboundRegistry,
}

/// Outcome of `assign`: either a runner took the task, or routing/transport
/// failed for a reason the caller (a TaskOrchestrator driver) can use to
/// decide whether to retry on a different runner or surface `runner_unavailable`.
pub enum AssignOutcome {
    Assigned { runner_id: String },
    NoEligibleRunner { reason: String },
}

impl TaskDispatcher {
    pub fn new(registry: SharedRunnerRegistry, outbound: SharedOutboundRegistry) -> Self {
        Self { registry, outbound }
    }

    /// Score every available runner for `task`, reserve a slot on the
    /// winner, and push `task_assign` over its gateway connection. If the
    /// winning runner's connection has since dropped (or the slot was
    /// claimed by someone else between scoring and reservation), the slot
    /// is released and the *next*-ranked eligible runner is tried — the
    /// routing decision is never stale for more than one candidate's worth
    /// of race.
    pub async fn assign(
        &self,
        task: &Task,
        project_prompt: serde_json::Value,
        preferred_runner_id: Option<&str>,
    ) -> Result<AssignOutcome> {
        let candidates = self.registry.list_available(&task.organization_id, &[]).await;
        let warm = self.registry.list_warm_for_project(&task.project_id).await;
        let warm_ids: Vec<String> = warm.keys().cloned().collect();

        let RoutingResult {
            selected,
            scores,
            failure_reason,
        } = router::route(task, &candidates, &warm_ids, preferred_runner_id, Utc::now());

        let Some(winner) = selected else {
            let reason = failure_reason.unwrap_or_else(|| "no eligible runner".to_string());
            warn!(task_id = %task.id, reason = %reason, "routing failed — no eligible runner");
            return Ok(AssignOutcome::NoEligibleRunner { reason });
        };

        // Try the winner first, then fall through the ranked list on a
        // transport/slot race (§5 backpressure: a saturated or disconnected
        // runner must not block the next-best candidate). Collected eagerly
        // into owned strings so the retry loop doesn't hold a borrow across
        // the mutation of `last_tried`.
        let mut order: Vec<String> = vec![winner];
        for s in &scores {
            if s.total_score >= 0.0 && !order.contains(&s.runner_id) {
                order.push(s.runner_id.clone());
            }
        }

        let mut last_tried = order[0].clone();
        for candidate in &order {
            if !self.registry.acquire_slot(candidate).await.unwrap_or(false) {
                continue;
            }
            let push = self
                .outbound
                .task_assign(
                    candidate,
                    json!({
                        "task_id": task.id,
                        "project_id": task.project_id,
                        "prompt": project_prompt,
                        "required_capabilities": task.required_capabilities,
                    }),
                )
                .await;
            match push {
                Ok(()) => {
                    info!(task_id = %task.id, runner_id = %candidate, "task assigned");
                    return Ok(AssignOutcome::Assigned {
                        runner_id: candidate.clone(),
                    });
                }
                Err(e) => {
                    warn!(task_id = %task.id, runner_id = %candidate, err = %e, "task_assign push failed — releasing slot, trying next candidate");
                    let _ = self.registry.release_slot(candidate).await;
                    last_tried = candidate.clone();
                }
            }
        }

        Err(anyhow!(
            "runner_unavailable: all eligible runners for task {} failed transport (last tried: {last_tried})",
            task.id
        ))
    }

    /// Push `agent_cancel` to the runner currently hosting `agent_id` and
    /// release its reserved slot (§5 cancellation propagation).
    pub async fn cancel(&self, runner_id: &str, agent_id: &str, reason: &str) -> Result<()> {
        self.outbound.agent_cancel(runner_id, agent_id, reason).await?;
        self.registry.release_slot(runner_id).await?;
        Ok(())
    }

    /// Push `agent_resume` with a checkpoint reference, reacquiring a slot
    /// on the target runner first (§4.7 `restore`).
    pub async fn resume(&self, runner_id: &str, agent_id: &str, checkpoint_ref: &str) -> Result<()> {
        if !self.registry.acquire_slot(runner_id).await? {
            return Err(anyhow!("runner {runner_id} has no free slot to resume agent {agent_id}"));
        }
        if let Err(e) = self.outbound.agent_resume(runner_id, agent_id, checkpoint_ref).await {
            let _ = self.registry.release_slot(runner_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Push `shutdown` for a graceful drain (§4.2).
    pub async fn drain(&self, runner_id: &str) -> Result<()> {
        self.outbound.shutdown(runner_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunnerStatus;
    use crate::gateway::OutboundRegistry;
    use crate::registry::RunnerRegistry;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn task(org: &str, project: &str, caps: &[&str]) -> Task {
        Task {
            id: "task-1".to_string(),
            organization_id: org.to_string(),
            project_id: project.to_string(),
            title: "t".to_string(),
            priority: 0,
            complexity: "medium".to_string(),
            required_capabilities: caps.iter().map(|s| s.to_string()).collect(),
            status: "pending".to_string(),
            created_at: Utc::now(),
        }
    }

    async fn connected_runner(registry: &RunnerRegistry, outbound: &OutboundRegistry, caps: &[&str]) -> (String, mpsc::UnboundedReceiver<Message>) {
        let id = registry
            .register("org-1", "worker", "host", caps.iter().map(|s| s.to_string()).collect(), 2)
            .await
            .unwrap();
        registry.update_status(&id, RunnerStatus::Online).await.unwrap();
        registry.heartbeat(&id, 0, "1.0.0").await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        outbound.register(&id, tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn assign_pushes_task_assign_and_reserves_a_slot() {
        let registry = Arc::new(RunnerRegistry::new());
        let outbound = Arc::new(OutboundRegistry::new());
        let (runner_id, mut rx) = connected_runner(&registry, &outbound, &["docker"]).await;

        let dispatcher = TaskDispatcher::new(registry.clone(), outbound.clone());
        let outcome = dispatcher
            .assign(&task("org-1", "proj-1", &["docker"]), json!({"instructions": "do it"}), None)
            .await
            .unwrap();

        match outcome {
            AssignOutcome::Assigned { runner_id: chosen } => assert_eq!(chosen, runner_id),
            AssignOutcome::NoEligibleRunner { reason } => panic!("expected assignment, got: {reason}"),
        }

        let runner = registry.get(&runner_id).await.unwrap();
        assert_eq!(runner.current_agent_count, 1);

        let Message::Text(text) = rx.recv().await.unwrap() else { panic!() };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["method"], "task_assign");
        assert_eq!(parsed["params"]["task_id"], "task-1");
    }

    #[tokio::test]
    async fn assign_reports_no_eligible_runner_on_missing_capability() {
        let registry = Arc::new(RunnerRegistry::new());
        let outbound = Arc::new(OutboundRegistry::new());
        let (_id, _rx) = connected_runner(&registry, &outbound, &["docker"]).await;

        let dispatcher = TaskDispatcher::new(registry.clone(), outbound.clone());
        let outcome = dispatcher
            .assign(&task("org-1", "proj-1", &["gpu"]), json!({}), None)
            .await
            .unwrap();

        match outcome {
            AssignOutcome::NoEligibleRunner { reason } => assert!(reason.contains("gpu")),
            AssignOutcome::Assigned { .. } => panic!("should not have assigned"),
        }
    }

    #[tokio::test]
    async fn assign_falls_through_to_next_candidate_when_winner_is_disconnected() {
        let registry = Arc::new(RunnerRegistry::new());
        let outbound = Arc::new(OutboundRegistry::new());

        // Warm workspace winner A is registered but never actually connects
        // over the gateway (simulates a dropped connection the registry
        // hasn't been told about yet).
        let a_id = registry
            .register("org-1", "a", "host-a", ["docker".to_string()].into_iter().collect(), 2)
            .await
            .unwrap();
        registry.update_status(&a_id, RunnerStatus::Online).await.unwrap();
        registry.heartbeat(&a_id, 0, "1.0.0").await.unwrap();
        registry.register_warm_workspace(&a_id, "proj-1", "/tmp/a", "main").await;

        let (b_id, mut b_rx) = connected_runner(&registry, &outbound, &["docker"]).await;

        let dispatcher = TaskDispatcher::new(registry.clone(), outbound.clone());
        let outcome = dispatcher
            .assign(&task("org-1", "proj-1", &["docker"]), json!({}), None)
            .await
            .unwrap();

        match outcome {
            AssignOutcome::Assigned { runner_id } => assert_eq!(runner_id, b_id),
            AssignOutcome::NoEligibleRunner { reason } => panic!("expected fallthrough assignment, got: {reason}"),
        }
        // A's slot must not be left reserved after the failed push.
        let a = registry.get(&a_id).await.unwrap();
        assert_eq!(a.current_agent_count, 0);
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn cancel_releases_slot_and_pushes_agent_cancel() {
        let registry = Arc::new(RunnerRegistry::new());
        let outbound = Arc::new(OutboundRegistry::new());
        let (runner_id, mut rx) = connected_runner(&registry, &outbound, &["docker"]).await;
        registry.acquire_slot(&runner_id).await.unwrap();

        let dispatcher = TaskDispatcher::new(registry.clone(), outbound.clone());
        dispatcher.cancel(&runner_id, "agent-1", "operator cancel").await.unwrap();

        let runner = registry.get(&runner_id).await.unwrap();
        assert_eq!(runner.current_agent_count, 0);
        let Message::Text(text) = rx.recv().await.unwrap() else { panic!() };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["method"], "agent_cancel");
    }
}
