//! Quality Gate Runner (§4.6). Executes configured gate checks (lint,
//! typecheck, test, security, human review) against a workspace and reports
//! structured pass/fail results back to the TaskOrchestrator. Grounded on
//! the teacher's `ci::runner::CiRun` (step execution / broadcast-as-you-go
//! shape) and `code_review::tool_runner::ToolRunner` (timeout + output
//! truncation). Adds SIGTERM-then-SIGKILL escalation on timeout, since gate
//! commands may be long-running build/test invocations rather than the
//! short-lived lint tools the teacher wraps.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::{GateKind, GateResult};

const MAX_OUTPUT_BYTES: usize = 64 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
/// Grace period after SIGTERM before escalating to SIGKILL.
const SIGTERM_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub kind: GateKind,
    /// Shell command, e.g. `["cargo", "clippy", "--", "-D", "warnings"]`.
    pub command: Vec<String>,
    pub timeout: Duration,
    pub required: bool,
}

impl GateConfig {
    pub fn new(kind: GateKind, command: Vec<String>) -> Self {
        Self {
            kind,
            command,
            timeout: DEFAULT_TIMEOUT,
            required: true,
        }
    }
}

pub struct GateRunner;

impl GateRunner {
    /// Run every gate in `configs` against `workspace_path` sequentially,
    /// short-circuiting after the first required gate fails (remaining
    /// required gates are skipped — their absence from the returned vec
    /// tells the orchestrator they never ran).
    pub async fn run_all(configs: &[GateConfig], workspace_path: &Path) -> Vec<GateResult> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            if config.kind == GateKind::HumanReview {
                // Human review has no command to execute; the orchestrator
                // transitions to the review phase instead of running this gate.
                continue;
            }
            let result = Self::run_one(config, workspace_path).await;
            let failed_required = !result.passed && config.required;
            results.push(result);
            if failed_required {
                break;
            }
        }
        results
    }

    pub async fn run_one(config: &GateConfig, workspace_path: &Path) -> GateResult {
        debug!(kind = ?config.kind, "running gate");
        let start = Instant::now();

        // No command configured (ecosystem default didn't apply and the
        // project didn't override it): this is a trivial pass, not a
        // failure — the orchestrator should not block on a gate nobody set up.
        let Some((binary, args)) = config.command.split_first() else {
            return GateResult {
                kind: config.kind,
                passed: true,
                errors: vec![],
                warnings: vec![],
                metrics: Default::default(),
                duration_ms: 0,
                output: "no command configured for this gate".to_string(),
            };
        };

        let mut child = match Command::new(binary)
            .args(args)
            .current_dir(workspace_path)
            // On unix we drive the SIGTERM-then-SIGKILL escalation ourselves
            // on timeout below; kill_on_drop's immediate SIGKILL would race
            // ahead of that grace period the moment this future is dropped.
            // Non-unix platforms have no `terminate_gracefully`, so they keep
            // the immediate-kill fallback.
            .kill_on_drop(cfg!(not(unix)))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return GateResult {
                    kind: config.kind,
                    passed: false,
                    errors: vec![format!("spawn error: {e}")],
                    warnings: vec![],
                    metrics: Default::default(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    output: String::new(),
                };
            }
        };
        let pid = child.id();

        let output = match tokio::time::timeout(config.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return GateResult {
                    kind: config.kind,
                    passed: false,
                    errors: vec![format!("gate execution failed: {e}")],
                    warnings: vec![],
                    metrics: Default::default(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    output: String::new(),
                };
            }
            Err(_) => {
                warn!(kind = ?config.kind, timeout_s = config.timeout.as_secs(), "gate timed out, escalating to kill");
                if let Some(pid) = pid {
                    #[cfg(unix)]
                    terminate_gracefully(pid).await;
                    #[cfg(not(unix))]
                    let _ = pid;
                }
                return GateResult {
                    kind: config.kind,
                    passed: false,
                    errors: vec![format!(
                        "gate timed out after {}s",
                        config.timeout.as_secs()
                    )],
                    warnings: vec![],
                    metrics: Default::default(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    output: String::new(),
                };
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = truncate(&output.stdout);
        let stderr = truncate(&output.stderr);
        let passed = output.status.success();

        GateResult {
            kind: config.kind,
            passed,
            errors: if passed { vec![] } else { vec![stderr.clone()] },
            warnings: vec![],
            metrics: Default::default(),
            duration_ms,
            output: if stdout.is_empty() { stderr } else { stdout },
        }
    }
}

fn truncate(bytes: &[u8]) -> String {
    if bytes.len() > MAX_OUTPUT_BYTES {
        String::from_utf8_lossy(&bytes[..MAX_OUTPUT_BYTES]).into_owned()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Send SIGTERM to a running process, wait `SIGTERM_GRACE` for it to exit,
/// then SIGKILL. Takes a bare pid rather than a `Child` handle since the
/// caller has typically already moved the `Child` into a `wait_with_output`
/// future by the time a timeout is known to have elapsed. Unix-only; on
/// other platforms `kill_on_drop` alone provides the hard kill.
#[cfg(unix)]
pub async fn terminate_gracefully(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    tokio::time::sleep(SIGTERM_GRACE).await;
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn passing_command_reports_success() {
        let dir = TempDir::new().unwrap();
        let config = GateConfig::new(
            GateKind::Lint,
            vec!["true".to_string()],
        );
        let result = GateRunner::run_one(&config, dir.path()).await;
        assert!(result.passed);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn failing_command_reports_failure_with_stderr() {
        let dir = TempDir::new().unwrap();
        let config = GateConfig::new(GateKind::Lint, vec!["false".to_string()]);
        let result = GateRunner::run_one(&config, dir.path()).await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn timeout_is_reported_as_failure() {
        let dir = TempDir::new().unwrap();
        let mut config = GateConfig::new(
            GateKind::Test,
            vec!["sleep".to_string(), "5".to_string()],
        );
        config.timeout = Duration::from_millis(50);
        let result = GateRunner::run_one(&config, dir.path()).await;
        assert!(!result.passed);
        assert!(result.errors[0].contains("timed out"));
    }

    #[tokio::test]
    async fn run_all_stops_after_first_required_failure() {
        let dir = TempDir::new().unwrap();
        let configs = vec![
            GateConfig::new(GateKind::Lint, vec!["false".to_string()]),
            GateConfig::new(GateKind::Test, vec!["true".to_string()]),
        ];
        let results = GateRunner::run_all(&configs, dir.path()).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
    }

    #[tokio::test]
    async fn gate_with_no_command_trivially_passes() {
        let dir = TempDir::new().unwrap();
        let config = GateConfig::new(GateKind::Security, vec![]);
        let result = GateRunner::run_one(&config, dir.path()).await;
        assert!(result.passed);
        assert!(result.errors.is_empty());
        assert!(result.output.contains("no command configured"));
    }

    #[tokio::test]
    async fn human_review_gate_is_skipped_not_executed() {
        let dir = TempDir::new().unwrap();
        let configs = vec![GateConfig::new(GateKind::HumanReview, vec![])];
        let results = GateRunner::run_all(&configs, dir.path()).await;
        assert!(results.is_empty());
    }
}
