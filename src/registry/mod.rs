//! Runner Registry (§4.1). Authoritative record of each runner's identity,
//! capabilities, slot count, load, and heartbeat. Grounded on the teacher's
//! `scheduler::accounts::AccountPool` (least-loaded selection) and
//! `agents::lifecycle::AgentRegistry` (heartbeat/status bookkeeping).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::RwLock;

use crate::domain::{Runner, RunnerProject, RunnerStatus};

pub struct RunnerRegistry {
    runners: RwLock<HashMap<String, Runner>>,
    /// (runner_id, project_id) -> RunnerProject
    warm_workspaces: RwLock<HashMap<(String, String), RunnerProject>>,
}

pub type SharedRunnerRegistry = Arc<RunnerRegistry>;

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            runners: RwLock::new(HashMap::new()),
            warm_workspaces: RwLock::new(HashMap::new()),
        }
    }

    /// Registering a runner twice with the same (organization, name, hostname)
    /// yields the same runner id (idempotent registration).
    pub async fn register(
        &self,
        organization_id: &str,
        display_name: &str,
        hostname: &str,
        capabilities: HashSet<String>,
        max_concurrent_agents: u32,
    ) -> Result<String> {
        let mut runners = self.runners.write().await;

        if let Some(existing) = runners.values().find(|r| {
            r.organization_id == organization_id
                && r.display_name == display_name
                && r.hostname == hostname
        }) {
            return Ok(existing.id.clone());
        }

        let id = crate::domain::new_id("runner");
        runners.insert(
            id.clone(),
            Runner {
                id: id.clone(),
                organization_id: organization_id.to_string(),
                display_name: display_name.to_string(),
                hostname: hostname.to_string(),
                capabilities,
                max_concurrent_agents,
                current_agent_count: 0,
                status: RunnerStatus::Offline,
                last_heartbeat: None,
                client_version: String::new(),
                is_sandbox_runner: false,
                bound_sandbox_id: None,
            },
        );
        Ok(id)
    }

    pub async fn get(&self, runner_id: &str) -> Option<Runner> {
        self.runners.read().await.get(runner_id).cloned()
    }

    pub async fn update_status(&self, runner_id: &str, status: RunnerStatus) -> Result<()> {
        let mut runners = self.runners.write().await;
        let runner = runners
            .get_mut(runner_id)
            .ok_or_else(|| anyhow::anyhow!("runner not found: {runner_id}"))?;
        if !runner.status.can_transition_to(&status) {
            bail!(
                "illegal runner status transition: {:?} -> {:?}",
                runner.status,
                status
            );
        }
        runner.status = status;
        Ok(())
    }

    /// Refresh heartbeat and agent count atomically. A runner whose
    /// heartbeat is stale (> 60s by default, checked by the router) is
    /// "unhealthy" but not marked offline here — only a connection-close
    /// event or operator action changes `status`.
    pub async fn heartbeat(&self, runner_id: &str, current_agent_count: u32, client_version: &str) -> Result<()> {
        let mut runners = self.runners.write().await;
        let runner = runners
            .get_mut(runner_id)
            .ok_or_else(|| anyhow::anyhow!("runner not found: {runner_id}"))?;
        runner.last_heartbeat = Some(Utc::now());
        runner.current_agent_count = current_agent_count;
        runner.client_version = client_version.to_string();
        Ok(())
    }

    /// Atomically succeeds iff `current_agent_count < max_concurrent_agents`.
    pub async fn acquire_slot(&self, runner_id: &str) -> Result<bool> {
        let mut runners = self.runners.write().await;
        let runner = runners
            .get_mut(runner_id)
            .ok_or_else(|| anyhow::anyhow!("runner not found: {runner_id}"))?;
        if runner.current_agent_count >= runner.max_concurrent_agents {
            return Ok(false);
        }
        runner.current_agent_count += 1;
        Ok(true)
    }

    /// Decrements the slot count; never below zero.
    pub async fn release_slot(&self, runner_id: &str) -> Result<()> {
        let mut runners = self.runners.write().await;
        if let Some(runner) = runners.get_mut(runner_id) {
            runner.current_agent_count = runner.current_agent_count.saturating_sub(1);
        }
        Ok(())
    }

    pub async fn register_warm_workspace(
        &self,
        runner_id: &str,
        project_id: &str,
        path: &str,
        branch: &str,
    ) {
        let mut map = self.warm_workspaces.write().await;
        map.insert(
            (runner_id.to_string(), project_id.to_string()),
            RunnerProject {
                runner_id: runner_id.to_string(),
                project_id: project_id.to_string(),
                workspace_path: path.to_string(),
                workspace_branch: branch.to_string(),
                last_used_at: Utc::now(),
            },
        );
    }

    pub async fn list_warm_for_project(&self, project_id: &str) -> HashMap<String, RunnerProject> {
        self.warm_workspaces
            .read()
            .await
            .values()
            .filter(|rp| rp.project_id == project_id)
            .map(|rp| (rp.runner_id.clone(), rp.clone()))
            .collect()
    }

    /// Runners in status `online | busy`, excluding the given set.
    pub async fn list_available(&self, organization_id: &str, exclude: &[String]) -> Vec<Runner> {
        self.runners
            .read()
            .await
            .values()
            .filter(|r| {
                r.organization_id == organization_id
                    && matches!(r.status, RunnerStatus::Online | RunnerStatus::Busy)
                    && !exclude.contains(&r.id)
            })
            .cloned()
            .collect()
    }

    /// Remove a runner and its warm-workspace records (cascade per §3).
    pub async fn remove(&self, runner_id: &str) {
        self.runners.write().await.remove(runner_id);
        self.warm_workspaces
            .write()
            .await
            .retain(|(rid, _), _| rid != runner_id);
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent_by_org_name_hostname() {
        let reg = RunnerRegistry::new();
        let id1 = reg
            .register("org-1", "worker-a", "host-a", HashSet::new(), 4)
            .await
            .unwrap();
        let id2 = reg
            .register("org-1", "worker-a", "host-a", HashSet::new(), 4)
            .await
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn acquire_slot_respects_cap() {
        let reg = RunnerRegistry::new();
        let id = reg
            .register("org-1", "worker-a", "host-a", HashSet::new(), 1)
            .await
            .unwrap();
        assert!(reg.acquire_slot(&id).await.unwrap());
        assert!(!reg.acquire_slot(&id).await.unwrap());
        reg.release_slot(&id).await.unwrap();
        assert!(reg.acquire_slot(&id).await.unwrap());
    }

    #[tokio::test]
    async fn release_slot_never_goes_below_zero() {
        let reg = RunnerRegistry::new();
        let id = reg
            .register("org-1", "worker-a", "host-a", HashSet::new(), 1)
            .await
            .unwrap();
        reg.release_slot(&id).await.unwrap();
        let runner = reg.get(&id).await.unwrap();
        assert_eq!(runner.current_agent_count, 0);
    }

    #[tokio::test]
    async fn illegal_status_transition_rejected() {
        let reg = RunnerRegistry::new();
        let id = reg
            .register("org-1", "worker-a", "host-a", HashSet::new(), 1)
            .await
            .unwrap();
        // offline -> draining is not a legal direct transition.
        assert!(reg
            .update_status(&id, RunnerStatus::Draining)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn removing_runner_cascades_warm_workspaces() {
        let reg = RunnerRegistry::new();
        let id = reg
            .register("org-1", "worker-a", "host-a", HashSet::new(), 1)
            .await
            .unwrap();
        reg.register_warm_workspace(&id, "proj-1", "/tmp/x", "main")
            .await;
        reg.remove(&id).await;
        assert!(reg.list_warm_for_project("proj-1").await.is_empty());
    }
}
