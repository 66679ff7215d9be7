//! Task Router (§4.3). Pure scoring function over the registry for a given
//! task; deterministic and explainable. No internal state — every input the
//! formula needs is passed in.

use chrono::{DateTime, Utc};

use crate::domain::{Runner, RunnerScore, ScoreComponents, Task};

const AFFINITY_SCORE: f64 = 50.0;
const CAPABILITY_SCORE: f64 = 30.0;
const CAPABILITY_REJECT: f64 = -100.0;
const MAX_LOAD_SCORE: f64 = 20.0;
const LOAD_REJECT: f64 = -50.0;
const HEALTH_PENALTY: f64 = -100.0;
const PREFERENCE_SCORE: f64 = 25.0;
const HEARTBEAT_STALE_SECONDS: i64 = 60;

pub struct RoutingResult {
    pub selected: Option<String>,
    pub scores: Vec<RunnerScore>,
    /// Populated only when `selected` is `None`.
    pub failure_reason: Option<String>,
}

/// Score every candidate runner for `task` and select the best eligible one.
///
/// `warm_project_runners` lists the runner ids that already have a warm
/// workspace for `task.project_id`. `preferred_runner_id` is an optional
/// caller-supplied hint (e.g. "keep using the runner from the last rework
/// cycle").
pub fn route(
    task: &Task,
    candidates: &[Runner],
    warm_project_runners: &[String],
    preferred_runner_id: Option<&str>,
    now: DateTime<Utc>,
) -> RoutingResult {
    if candidates.is_empty() {
        return RoutingResult {
            selected: None,
            scores: vec![],
            failure_reason: Some(
                "No runners available. All runners are offline or excluded.".to_string(),
            ),
        };
    }

    let mut scores: Vec<RunnerScore> = candidates
        .iter()
        .map(|r| score_runner(task, r, warm_project_runners, preferred_runner_id, now))
        .collect();

    // Determinism & tie-breaking: higher score first; ties broken by lower
    // current load, then lexicographic runner id.
    scores.sort_by(|a, b| {
        b.total_score
            .partial_cmp(&a.total_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let load_a = candidates
                    .iter()
                    .find(|r| r.id == a.runner_id)
                    .map(|r| r.current_agent_count)
                    .unwrap_or(u32::MAX);
                let load_b = candidates
                    .iter()
                    .find(|r| r.id == b.runner_id)
                    .map(|r| r.current_agent_count)
                    .unwrap_or(u32::MAX);
                load_a.cmp(&load_b)
            })
            .then_with(|| a.runner_id.cmp(&b.runner_id))
    });

    let selected = scores
        .iter()
        .find(|s| s.total_score >= 0.0)
        .map(|s| s.runner_id.clone());

    let failure_reason = if selected.is_none() {
        Some(rejection_summary(candidates, &scores))
    } else {
        None
    };

    RoutingResult {
        selected,
        scores,
        failure_reason,
    }
}

fn score_runner(
    task: &Task,
    runner: &Runner,
    warm_project_runners: &[String],
    preferred_runner_id: Option<&str>,
    now: DateTime<Utc>,
) -> RunnerScore {
    let has_warm_workspace = warm_project_runners.iter().any(|id| id == &runner.id);
    let affinity = if has_warm_workspace { AFFINITY_SCORE } else { 0.0 };

    let missing_capabilities: Vec<String> = task
        .required_capabilities
        .iter()
        .filter(|c| !runner.capabilities.contains(*c))
        .cloned()
        .collect();
    let capability = if missing_capabilities.is_empty() {
        CAPABILITY_SCORE
    } else {
        CAPABILITY_REJECT
    };

    let available_slots = runner.available_slots();
    let load = if available_slots == 0 {
        LOAD_REJECT
    } else {
        MAX_LOAD_SCORE * (available_slots as f64 / runner.max_concurrent_agents.max(1) as f64)
    };

    let stale = runner.is_stale(now, chrono::Duration::seconds(HEARTBEAT_STALE_SECONDS));
    let health = if stale { HEALTH_PENALTY } else { 0.0 };

    let preference = if preferred_runner_id == Some(runner.id.as_str()) {
        PREFERENCE_SCORE
    } else {
        0.0
    };

    let total_score = affinity + capability + load + health + preference;

    RunnerScore {
        runner_id: runner.id.clone(),
        total_score,
        components: ScoreComponents {
            affinity,
            capability,
            load,
            health,
            preference,
        },
        available_slots,
        has_warm_workspace,
        missing_capabilities,
    }
}

/// Build the "why nothing was selected" explanation, one clause per rejected
/// runner, joined by `"; "`.
fn rejection_summary(candidates: &[Runner], scores: &[RunnerScore]) -> String {
    let mut reasons = Vec::new();
    for score in scores {
        let runner = match candidates.iter().find(|r| r.id == score.runner_id) {
            Some(r) => r,
            None => continue,
        };
        if !score.missing_capabilities.is_empty() {
            reasons.push(format!(
                "{}: missing {{{}}}",
                runner.display_name,
                score.missing_capabilities.join(", ")
            ));
        } else if score.components.health < 0.0 {
            reasons.push(format!("{}: unhealthy (stale heartbeat)", runner.display_name));
        } else if score.available_slots == 0 {
            reasons.push(format!("{}: at capacity", runner.display_name));
        }
    }
    if reasons.is_empty() {
        "No runners available. All runners are offline or excluded.".to_string()
    } else {
        reasons.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn runner(id: &str, caps: &[&str], slots: (u32, u32), heartbeat: Option<DateTime<Utc>>) -> Runner {
        Runner {
            id: id.to_string(),
            organization_id: "org-1".to_string(),
            display_name: id.to_string(),
            hostname: format!("{id}.local"),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            max_concurrent_agents: slots.1,
            current_agent_count: slots.1 - slots.0,
            status: crate::domain::RunnerStatus::Online,
            last_heartbeat: heartbeat,
            client_version: "1.0.0".to_string(),
            is_sandbox_runner: false,
            bound_sandbox_id: None,
        }
    }

    fn task(caps: &[&str]) -> Task {
        Task {
            id: "task-1".to_string(),
            organization_id: "org-1".to_string(),
            project_id: "proj-1".to_string(),
            title: "t".to_string(),
            priority: 0,
            complexity: "medium".to_string(),
            required_capabilities: caps.iter().map(|s| s.to_string()).collect(),
            status: "pending".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn routing_with_warm_workspace_scores_exactly_100_and_50() {
        let now = Utc::now();
        let a = runner("A", &["docker"], (2, 2), Some(now));
        let b = runner("B", &["docker"], (2, 2), Some(now));
        let t = task(&["docker"]);

        let result = route(&t, &[a, b], &["A".to_string()], None, now);
        assert_eq!(result.selected.as_deref(), Some("A"));
        let a_score = result.scores.iter().find(|s| s.runner_id == "A").unwrap();
        let b_score = result.scores.iter().find(|s| s.runner_id == "B").unwrap();
        assert_eq!(a_score.total_score, 100.0);
        assert_eq!(b_score.total_score, 50.0);
    }

    #[test]
    fn health_penalty_drops_a_to_zero_b_wins() {
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(120);
        let a = runner("A", &["docker"], (2, 2), Some(stale));
        let b = runner("B", &["docker"], (2, 2), Some(now));
        let t = task(&["docker"]);

        let result = route(&t, &[a, b], &["A".to_string()], None, now);
        assert_eq!(result.selected.as_deref(), Some("B"));
        let a_score = result.scores.iter().find(|s| s.runner_id == "A").unwrap();
        assert_eq!(a_score.total_score, 0.0);
    }

    #[test]
    fn capability_rejection_reports_missing_gpu() {
        let now = Utc::now();
        let a = runner("A", &["docker"], (2, 2), Some(now));
        let t = task(&["gpu"]);

        let result = route(&t, &[a], &[], None, now);
        assert!(result.selected.is_none());
        assert_eq!(result.failure_reason.as_deref(), Some("A: missing {gpu}"));
    }

    #[test]
    fn empty_candidate_set_fails_with_no_runners_reason() {
        let t = task(&["docker"]);
        let result = route(&t, &[], &[], None, Utc::now());
        assert!(result.selected.is_none());
        assert_eq!(
            result.failure_reason.as_deref(),
            Some("No runners available. All runners are offline or excluded.")
        );
    }

    #[test]
    fn unset_heartbeat_is_not_penalized() {
        let now = Utc::now();
        let a = runner("A", &["docker"], (2, 2), None);
        let t = task(&["docker"]);
        let result = route(&t, &[a], &[], None, now);
        let a_score = &result.scores[0];
        assert_eq!(a_score.components.health, 0.0);
    }

    #[test]
    fn at_capacity_runner_never_selected_and_is_negative() {
        let now = Utc::now();
        let a = runner("A", &["docker"], (0, 2), Some(now));
        let t = task(&["docker"]);
        let result = route(&t, &[a], &[], None, now);
        assert!(result.selected.is_none());
        assert!(result.scores[0].total_score < 0.0);
    }

    #[test]
    fn preference_bonus_breaks_near_tie() {
        let now = Utc::now();
        let a = runner("A", &["docker"], (2, 2), Some(now));
        let b = runner("B", &["docker"], (2, 2), Some(now));
        let t = task(&["docker"]);
        let result = route(&t, &[a, b], &[], Some("B"), now);
        assert_eq!(result.selected.as_deref(), Some("B"));
    }
}
