//! Approval Queue (§4.10). Human-in-the-loop gate for risky agent actions:
//! submit, grant, deny, and wait-for-decision with a bounded timeout.
//! Grounded directly on the teacher's `policy::approval::ApprovalRouter` —
//! same broadcast-notify-then-recheck shape, generalized from tool-call
//! gating to the §3 `Approval` entity and a 24h default expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::domain::{Approval, ApprovalStatus};
use crate::storage::Storage;

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

pub struct ApprovalQueue {
    approvals: Mutex<HashMap<String, Approval>>,
    /// Broadcasts the id of every approval whose status just changed.
    tx: broadcast::Sender<String>,
    /// Durable mirror (§6.3). `None` in unit tests that only exercise the
    /// broadcast/decision logic; production wiring always supplies one via
    /// `with_storage`.
    storage: Option<Arc<Storage>>,
}

pub type SharedApprovalQueue = Arc<ApprovalQueue>;

impl ApprovalQueue {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            approvals: Mutex::new(HashMap::new()),
            tx,
            storage: None,
        }
    }

    pub fn with_storage(storage: Arc<Storage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new()
        }
    }

    /// Submit a new approval request. Rejected if `agent_id` already has a
    /// pending approval (§5: "at most one pending approval per agent").
    pub async fn submit(
        &self,
        agent_id: &str,
        action_description: &str,
        proposed_command: Option<String>,
        proposed_diff: Option<String>,
    ) -> Result<Approval> {
        let mut approvals = self.approvals.lock().await;
        if approvals
            .values()
            .any(|a| a.agent_id == agent_id && a.status == ApprovalStatus::Pending)
        {
            return Err(anyhow!(
                "agent {agent_id} already has a pending approval"
            ));
        }

        let approval = Approval {
            id: crate::domain::new_id("approval"),
            agent_id: agent_id.to_string(),
            action_description: action_description.to_string(),
            proposed_command,
            proposed_diff,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            created_at: Utc::now(),
        };
        approvals.insert(approval.id.clone(), approval.clone());
        drop(approvals);
        self.persist(&approval).await;
        Ok(approval)
    }

    async fn persist(&self, approval: &Approval) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.upsert_approval(approval).await {
                warn!(approval_id = %approval.id, err = %e, "failed to persist approval");
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Approval> {
        self.approvals.lock().await.get(id).cloned()
    }

    pub async fn grant(&self, id: &str, decided_by: &str) -> Result<()> {
        self.decide(id, decided_by, ApprovalStatus::Approved).await
    }

    pub async fn deny(&self, id: &str, decided_by: &str) -> Result<()> {
        self.decide(id, decided_by, ApprovalStatus::Denied).await
    }

    async fn decide(&self, id: &str, decided_by: &str, status: ApprovalStatus) -> Result<()> {
        let mut approvals = self.approvals.lock().await;
        let approval = approvals
            .get_mut(id)
            .ok_or_else(|| anyhow!("approval not found: {id}"))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(anyhow!(
                "approval {id} already decided ({:?})",
                approval.status
            ));
        }
        approval.status = status;
        approval.decided_by = Some(decided_by.to_string());
        approval.decided_at = Some(Utc::now());
        let decided = approval.clone();
        drop(approvals);
        self.persist(&decided).await;
        let _ = self.tx.send(id.to_string());
        Ok(())
    }

    /// Block the calling agent's progress until a decision arrives or
    /// `timeout` elapses. A timed-out approval is recorded as `Expired` so
    /// the orchestrator can treat it identically to an explicit denial.
    pub async fn wait_for_decision(&self, id: &str, timeout: Duration) -> Result<ApprovalStatus> {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let approvals = self.approvals.lock().await;
                let approval = approvals
                    .get(id)
                    .ok_or_else(|| anyhow!("approval not found: {id}"))?;
                if approval.status != ApprovalStatus::Pending {
                    return Ok(approval.status);
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let expired = {
                    let mut approvals = self.approvals.lock().await;
                    match approvals.get_mut(id) {
                        Some(approval) => {
                            if approval.status == ApprovalStatus::Pending {
                                approval.status = ApprovalStatus::Expired;
                                approval.decided_at = Some(Utc::now());
                            }
                            Some(approval.clone())
                        }
                        None => None,
                    }
                };
                return match expired {
                    Some(approval) => {
                        let status = approval.status;
                        self.persist(&approval).await;
                        Ok(status)
                    }
                    None => Ok(ApprovalStatus::Expired),
                };
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(changed_id)) if changed_id == id => {
                    // loop around to re-check status
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => {
                    let expired = {
                        let mut approvals = self.approvals.lock().await;
                        match approvals.get_mut(id) {
                            Some(approval) => {
                                if approval.status == ApprovalStatus::Pending {
                                    approval.status = ApprovalStatus::Expired;
                                    approval.decided_at = Some(Utc::now());
                                }
                                Some(approval.clone())
                            }
                            None => None,
                        }
                    };
                    return match expired {
                        Some(approval) => {
                            let status = approval.status;
                            self.persist(&approval).await;
                            Ok(status)
                        }
                        None => Ok(ApprovalStatus::Expired),
                    };
                }
            }
        }
    }

    pub async fn list_pending(&self, agent_id: &str) -> Vec<Approval> {
        self.approvals
            .lock()
            .await
            .values()
            .filter(|a| a.agent_id == agent_id && a.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grant_transitions_to_approved() {
        let queue = ApprovalQueue::new();
        let approval = queue.submit("agent-1", "apply patch", None, None).await.unwrap();
        queue.grant(&approval.id, "human-1").await.unwrap();
        let fetched = queue.get(&approval.id).await.unwrap();
        assert_eq!(fetched.status, ApprovalStatus::Approved);
        assert_eq!(fetched.decided_by.as_deref(), Some("human-1"));
    }

    #[tokio::test]
    async fn deny_then_grant_is_rejected() {
        let queue = ApprovalQueue::new();
        let approval = queue.submit("agent-1", "apply patch", None, None).await.unwrap();
        queue.deny(&approval.id, "human-1").await.unwrap();
        assert!(queue.grant(&approval.id, "human-1").await.is_err());
    }

    #[tokio::test]
    async fn wait_for_decision_resolves_on_grant() {
        let queue = Arc::new(ApprovalQueue::new());
        let approval = queue.submit("agent-1", "apply patch", None, None).await.unwrap();
        let queue2 = Arc::clone(&queue);
        let id = approval.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue2.grant(&id, "human-1").await.unwrap();
        });
        let status = queue
            .wait_for_decision(&approval.id, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn wait_for_decision_expires_on_timeout() {
        let queue = ApprovalQueue::new();
        let approval = queue.submit("agent-1", "apply patch", None, None).await.unwrap();
        let status = queue
            .wait_for_decision(&approval.id, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn list_pending_excludes_decided() {
        let queue = ApprovalQueue::new();
        let a = queue.submit("agent-1", "a", None, None).await.unwrap();
        queue.grant(&a.id, "human-1").await.unwrap();
        let b = queue.submit("agent-1", "b", None, None).await.unwrap();
        let pending = queue.list_pending("agent-1").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[tokio::test]
    async fn second_pending_submission_for_same_agent_is_rejected() {
        let queue = ApprovalQueue::new();
        queue.submit("agent-1", "a", None, None).await.unwrap();
        assert!(queue.submit("agent-1", "b", None, None).await.is_err());
    }
}
