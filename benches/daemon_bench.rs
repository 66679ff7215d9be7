//! Criterion benchmarks for hot paths in the sibyld control plane.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - Task routing (§4.3) — scoring a runner fleet for a single task
//!   - Gateway wire-message parsing (§4.2) — JSON (de)serialization
//!   - Inter-agent message bus ordering (§4.10) — priority/created_at sort

use std::collections::HashSet;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::Value;
use sibyl_core::domain::{Runner, RunnerStatus, Task};
use sibyl_core::router;

fn make_runner(id: &str, caps: &[&str], max_slots: u32, current: u32, stale: bool) -> Runner {
    Runner {
        id: id.to_string(),
        organization_id: "org-1".to_string(),
        display_name: id.to_string(),
        hostname: format!("{id}.local"),
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
        max_concurrent_agents: max_slots,
        current_agent_count: current,
        status: RunnerStatus::Online,
        last_heartbeat: Some(if stale {
            Utc::now() - chrono::Duration::seconds(120)
        } else {
            Utc::now()
        }),
        client_version: "1.0.0".to_string(),
        is_sandbox_runner: false,
        bound_sandbox_id: None,
    }
}

fn make_task(caps: &[&str]) -> Task {
    Task {
        id: "task-1".to_string(),
        organization_id: "org-1".to_string(),
        project_id: "proj-1".to_string(),
        title: "Fix the thing".to_string(),
        priority: 5,
        complexity: "medium".to_string(),
        required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
        status: "queued".to_string(),
        created_at: Utc::now(),
    }
}

fn bench_router(c: &mut Criterion) {
    let task = make_task(&["docker"]);
    let small_fleet: Vec<Runner> = vec![
        make_runner("runner-a", &["docker"], 2, 0, false),
        make_runner("runner-b", &["docker"], 2, 1, false),
    ];
    let warm = vec!["runner-a".to_string()];

    c.bench_function("route_small_fleet", |b| {
        b.iter(|| {
            let result = router::route(
                black_box(&task),
                black_box(&small_fleet),
                black_box(&warm),
                None,
                Utc::now(),
            );
            black_box(result.selected);
        });
    });

    let large_fleet: Vec<Runner> = (0..200)
        .map(|i| {
            make_runner(
                &format!("runner-{i:04}"),
                if i % 5 == 0 { &["gpu"] } else { &["docker"] },
                4,
                (i % 4) as u32,
                i % 37 == 0,
            )
        })
        .collect();

    c.bench_function("route_200_runner_fleet", |b| {
        b.iter(|| {
            let result = router::route(
                black_box(&task),
                black_box(&large_fleet),
                black_box(&warm),
                None,
                Utc::now(),
            );
            black_box(result.scores.len());
        });
    });
}

// ─── Gateway wire messages ───────────────────────────────────────────────────
//
// Every runner↔core message (§4.2) is a tagged JSON envelope parsed off the
// WebSocket stream; this is on the hot path for every heartbeat and agent
// update.

static AGENT_UPDATE_MSG: &str = r#"{
    "type": "agent_update",
    "agent_id": "agent-01HXYZ1234567890ABCDEFGHIJ",
    "status": "working",
    "progress_percent": 42,
    "current_activity": "Running cargo test",
    "tokens_used": 18234,
    "cost_usd": 0.41
}"#;

static TASK_ASSIGN_MSG: &str = r#"{
    "type": "task_assign",
    "task_id": "task-01HXYZ1234567890ABCDEFGHIJ",
    "project_id": "proj-1",
    "prompt": "Implement the new feature and add tests for edge cases.",
    "required_capabilities": ["docker", "rust"],
    "config": {"max_rework_attempts": 3}
}"#;

fn bench_wire_parse(c: &mut Criterion) {
    c.bench_function("parse_agent_update", |b| {
        b.iter(|| {
            let v: Value = serde_json::from_str(black_box(AGENT_UPDATE_MSG)).unwrap();
            black_box(v);
        });
    });

    c.bench_function("parse_task_assign", |b| {
        b.iter(|| {
            let v: Value = serde_json::from_str(black_box(TASK_ASSIGN_MSG)).unwrap();
            black_box(v);
        });
    });

    c.bench_function("serialize_status_response", |b| {
        let resp = serde_json::json!({
            "type": "status",
            "status": "busy",
            "agent_count": 3
        });
        b.iter(|| {
            let s = serde_json::to_string(black_box(&resp)).unwrap();
            black_box(s);
        });
    });
}

// ─── Message bus priority ordering ──────────────────────────────────────────
//
// `fetch` (§4.10) returns unread messages ordered by priority desc then
// created_at asc; this sort runs on every poll from every agent.

#[derive(Clone)]
struct BenchMessage {
    priority: i32,
    created_at: i64,
}

fn bench_message_ordering(c: &mut Criterion) {
    let messages: Vec<BenchMessage> = (0..500)
        .map(|i| BenchMessage {
            priority: (i % 5) as i32,
            created_at: i as i64,
        })
        .collect();

    c.bench_function("sort_500_messages_by_priority", |b| {
        b.iter_with_setup(
            || messages.clone(),
            |mut msgs| {
                msgs.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then_with(|| a.created_at.cmp(&b.created_at))
                });
                black_box(msgs);
            },
        );
    });
}

// ─── Capability set comparison ───────────────────────────────────────────────
//
// Every routing decision computes `required_capabilities ⊆ runner.capabilities`
// (§4.3); bench the underlying HashSet operation directly at a larger scale
// than a single runner to catch regressions in capability-tag growth.

fn bench_capability_subset(c: &mut Criterion) {
    let runner_caps: HashSet<String> = (0..20).map(|i| format!("cap-{i}")).collect();
    let required: HashSet<String> = ["cap-3", "cap-7", "cap-11"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    c.bench_function("capability_subset_check", |b| {
        b.iter(|| {
            let missing: Vec<&String> = black_box(&required)
                .iter()
                .filter(|c| !black_box(&runner_caps).contains(*c))
                .collect();
            black_box(missing.is_empty());
        });
    });
}

criterion_group!(
    benches,
    bench_router,
    bench_wire_parse,
    bench_message_ordering,
    bench_capability_subset
);
criterion_main!(benches);
