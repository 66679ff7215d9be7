//! TaskOrchestrator (§4.8). Per-task finite-state machine driving
//! implement -> gates -> (review) -> (rework|complete|fail), with a bounded
//! rework counter ("Ralph Loop" safety). Grounded directly on the teacher's
//! `tasks::reducer::reduce` — a pure `(state, event) -> Result<state>`
//! function over validated transitions.

use anyhow::{anyhow, Result};
use chrono::Utc;

use crate::domain::{FailureCause, GateKind, GateResult, OrchestratorStatus, TaskOrchestratorRecord, TaskPhase};

/// Events that drive the orchestrator's phase machine.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// The currently assigned agent terminated (successfully or not).
    AgentCompleted { worker_id: String },
    GatesPassed { results: Vec<GateResult> },
    GatesFailed { results: Vec<GateResult> },
    ReviewApproved { reviewer_id: String },
    ReviewChangesRequested { reviewer_id: String, feedback: String },
    /// An unrecoverable error occurred at any phase.
    ErrorOccurred { cause: FailureCause, message: String },
    Cancelled,
}

/// Apply one event to the orchestrator record, returning the new record or
/// an error if the transition is invalid for the current phase.
pub fn reduce(mut rec: TaskOrchestratorRecord, event: &OrchestratorEvent) -> Result<TaskOrchestratorRecord> {
    match event {
        OrchestratorEvent::AgentCompleted { worker_id } => match rec.phase {
            TaskPhase::Implement => {
                if rec.current_worker_id.as_deref() != Some(worker_id.as_str()) {
                    return Err(anyhow!(
                        "AgentCompleted from unexpected worker {worker_id} (current: {:?})",
                        rec.current_worker_id
                    ));
                }
                rec.current_worker_id = None;
                rec.phase = TaskPhase::Gates;
                rec.status = OrchestratorStatus::Running;
            }
            _ => return Err(anyhow!("invalid transition: AgentCompleted from {:?}", rec.phase)),
        },

        OrchestratorEvent::GatesPassed { results } => match rec.phase {
            TaskPhase::Gates => {
                rec.gate_results = results.clone();
                let has_human_review = rec
                    .gate_config
                    .iter()
                    .any(|g| matches!(g, GateKind::HumanReview));
                if has_human_review {
                    rec.phase = TaskPhase::Review;
                    rec.status = OrchestratorStatus::WaitingReview;
                } else {
                    rec.phase = TaskPhase::Complete;
                    rec.status = OrchestratorStatus::Complete;
                    rec.completed_at = Some(Utc::now());
                }
            }
            _ => return Err(anyhow!("invalid transition: GatesPassed from {:?}", rec.phase)),
        },

        OrchestratorEvent::GatesFailed { results } => match rec.phase {
            TaskPhase::Gates => {
                rec.gate_results = results.clone();
                // Ralph Loop safety: bump rework_count every time a gate
                // failure sends the task back to implement. Once the count
                // reaches the cap, further failures are terminal.
                if rec.rework_count >= rec.max_rework_attempts {
                    rec.phase = TaskPhase::Failed;
                    rec.status = OrchestratorStatus::Failed;
                    rec.failure_cause = Some(FailureCause::ReworkLimit);
                    rec.completed_at = Some(Utc::now());
                } else {
                    rec.rework_count += 1;
                    rec.phase = TaskPhase::Rework;
                    rec.status = OrchestratorStatus::Running;
                }
            }
            _ => return Err(anyhow!("invalid transition: GatesFailed from {:?}", rec.phase)),
        },

        OrchestratorEvent::ReviewApproved { .. } => match rec.phase {
            TaskPhase::Review => {
                rec.phase = TaskPhase::Complete;
                rec.status = OrchestratorStatus::Complete;
                rec.completed_at = Some(Utc::now());
            }
            _ => return Err(anyhow!("invalid transition: ReviewApproved from {:?}", rec.phase)),
        },

        OrchestratorEvent::ReviewChangesRequested { reviewer_id, feedback } => match rec.phase {
            TaskPhase::Review => {
                // An agent cannot review its own work: the reviewer must not
                // be the worker that most recently held current_worker_id
                // before entering gates. We only have that worker's id if
                // still present in gate_results metadata; the invariant is
                // enforced by the caller passing a distinct reviewer_id, so
                // here we just guard against an empty id.
                if reviewer_id.is_empty() {
                    return Err(anyhow!("ReviewChangesRequested requires a reviewer_id"));
                }
                if rec.rework_count >= rec.max_rework_attempts {
                    rec.phase = TaskPhase::Failed;
                    rec.status = OrchestratorStatus::Failed;
                    rec.failure_cause = Some(FailureCause::ReworkLimit);
                    rec.completed_at = Some(Utc::now());
                } else {
                    rec.rework_count += 1;
                    rec.review_feedback = Some(feedback.clone());
                    rec.human_reviewer_id = Some(reviewer_id.clone());
                    rec.phase = TaskPhase::Rework;
                    rec.status = OrchestratorStatus::Running;
                }
            }
            _ => {
                return Err(anyhow!(
                    "invalid transition: ReviewChangesRequested from {:?}",
                    rec.phase
                ))
            }
        },

        OrchestratorEvent::ErrorOccurred { cause, message } => {
            if matches!(rec.phase, TaskPhase::Complete | TaskPhase::Failed | TaskPhase::Cancelled) {
                return Err(anyhow!(
                    "invalid transition: ErrorOccurred from terminal phase {:?}",
                    rec.phase
                ));
            }
            rec.phase = TaskPhase::Failed;
            rec.status = OrchestratorStatus::Failed;
            rec.failure_cause = Some(*cause);
            rec.error_message = Some(message.clone());
            rec.completed_at = Some(Utc::now());
        }

        OrchestratorEvent::Cancelled => {
            if matches!(rec.phase, TaskPhase::Complete | TaskPhase::Failed | TaskPhase::Cancelled) {
                return Err(anyhow!(
                    "invalid transition: Cancelled from terminal phase {:?}",
                    rec.phase
                ));
            }
            rec.current_worker_id = None;
            rec.phase = TaskPhase::Cancelled;
            rec.status = OrchestratorStatus::Cancelled;
            rec.failure_cause = Some(FailureCause::Cancelled);
            rec.completed_at = Some(Utc::now());
        }
    }

    Ok(rec)
}

/// Begin a new implement phase (entering the loop fresh, or re-entering
/// after a rework transition). Enforces the single-active-agent invariant:
/// a new worker cannot be assigned while one is already current.
pub fn assign_worker(mut rec: TaskOrchestratorRecord, worker_id: String) -> Result<TaskOrchestratorRecord> {
    if rec.current_worker_id.is_some() {
        return Err(anyhow!(
            "cannot assign worker {worker_id}: {:?} is already active",
            rec.current_worker_id
        ));
    }
    if !matches!(rec.phase, TaskPhase::Implement | TaskPhase::Rework) {
        return Err(anyhow!("cannot assign worker while in phase {:?}", rec.phase));
    }
    rec.phase = TaskPhase::Implement;
    rec.status = OrchestratorStatus::Running;
    rec.current_worker_id = Some(worker_id);
    Ok(rec)
}

pub fn new_record(
    organization_id: &str,
    project_id: &str,
    task_id: &str,
    gate_config: Vec<GateKind>,
    max_rework_attempts: u32,
) -> TaskOrchestratorRecord {
    TaskOrchestratorRecord {
        id: crate::domain::new_id("orch"),
        organization_id: organization_id.to_string(),
        project_id: project_id.to_string(),
        task_id: task_id.to_string(),
        phase: TaskPhase::Implement,
        status: OrchestratorStatus::Pending,
        gate_config,
        rework_count: 0,
        max_rework_attempts,
        current_worker_id: None,
        gate_results: Vec::new(),
        review_feedback: None,
        human_reviewer_id: None,
        tokens_used: 0,
        cost_usd: 0.0,
        started_at: Utc::now(),
        completed_at: None,
        error_message: None,
        failure_cause: None,
    }
}
