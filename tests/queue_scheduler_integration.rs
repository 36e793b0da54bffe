//! Cross-component scenarios for the task queue and scheduler:
//! repo inheritance with cloud fallback, dependency ordering across
//! agents, and sweep-reclaim with generation fencing.

mod common;

use agentcom::domain::models::protocol::ServerMessage;
use agentcom::domain::models::routing::{CostTier, TargetType};
use agentcom::domain::models::task::{ComplexityTier, TaskStatus};
use agentcom::services::SubmitTask;
use common::{connect_agent, harness, HarnessConfig};

/// S1: repo registry has one active entry, endpoint registry is empty.
/// A standard-tier task inherits the repo and falls back to the cloud.
#[tokio::test]
async fn happy_path_with_fallback() {
    let h = harness(HarnessConfig::default()).await;
    h.repos.add("https://r/a").await.unwrap();
    let mut rx = connect_agent(&h, "agent-1", &[]).await;

    let (task, warnings) = h
        .queue
        .submit(SubmitTask {
            description: "short fix".to_string(),
            complexity_tier: Some(ComplexityTier::Standard),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(warnings.is_empty());
    assert_eq!(task.repo.as_deref(), Some("https://r/a"));

    assert_eq!(h.scheduler.attempt_assignments().await.unwrap(), 1);

    let task = h.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_to.as_deref(), Some("agent-1"));

    let decision = task.routing_decision.as_ref().unwrap();
    assert!(decision.fallback_used);
    assert_eq!(decision.fallback_from_tier, Some(ComplexityTier::Standard));
    assert_eq!(decision.fallback_reason.as_deref(), Some("no_healthy_ollama_endpoints"));
    assert_eq!(decision.target_type, Some(TargetType::Claude));
    assert_eq!(decision.estimated_cost_tier, Some(CostTier::Api));

    // The agent received the push with the decision attached.
    match rx.recv().await.unwrap() {
        ServerMessage::TaskAssign { task_id, routing_decision, .. } => {
            assert_eq!(task_id, task.id);
            assert_eq!(
                routing_decision.unwrap().target_type,
                Some(TargetType::Claude)
            );
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

/// S2: three chained tasks; with two idle agents the chain still runs
/// strictly sequentially.
#[tokio::test]
async fn dependency_ordering_is_strict() {
    let h = harness(HarnessConfig::default()).await;
    let _rx1 = connect_agent(&h, "agent-1", &[]).await;
    let _rx2 = connect_agent(&h, "agent-2", &[]).await;

    let (t1, _) = h
        .queue
        .submit(SubmitTask { description: "one".to_string(), ..Default::default() })
        .await
        .unwrap();
    let (t2, _) = h
        .queue
        .submit(SubmitTask {
            description: "two".to_string(),
            depends_on: vec![t1.id],
            ..Default::default()
        })
        .await
        .unwrap();
    let (t3, _) = h
        .queue
        .submit(SubmitTask {
            description: "three".to_string(),
            depends_on: vec![t2.id],
            ..Default::default()
        })
        .await
        .unwrap();

    // Only the chain root is schedulable.
    assert_eq!(h.scheduler.attempt_assignments().await.unwrap(), 1);
    let one = h.queue.get(t1.id).await.unwrap().unwrap();
    assert_eq!(one.status, TaskStatus::Assigned);
    assert_eq!(h.queue.get(t2.id).await.unwrap().unwrap().status, TaskStatus::Queued);
    assert_eq!(h.queue.get(t3.id).await.unwrap().unwrap().status, TaskStatus::Queued);

    // Repeated passes with an idle second agent never start #2 early.
    assert_eq!(h.scheduler.attempt_assignments().await.unwrap(), 0);

    let agent = one.assigned_to.clone().unwrap();
    h.agents.on_accepted(&agent, t1.id).await.unwrap();
    h.agents.on_complete(&agent, t1.id, one.generation, None).await.unwrap();

    assert_eq!(h.scheduler.attempt_assignments().await.unwrap(), 1);
    let two = h.queue.get(t2.id).await.unwrap().unwrap();
    assert_eq!(two.status, TaskStatus::Assigned);
    assert_eq!(h.queue.get(t3.id).await.unwrap().unwrap().status, TaskStatus::Queued);

    let agent = two.assigned_to.clone().unwrap();
    h.agents.on_accepted(&agent, t2.id).await.unwrap();
    h.agents.on_complete(&agent, t2.id, two.generation, None).await.unwrap();

    assert_eq!(h.scheduler.attempt_assignments().await.unwrap(), 1);
    assert_eq!(
        h.queue.get(t3.id).await.unwrap().unwrap().status,
        TaskStatus::Assigned
    );
}

/// S3: an agent goes silent, the sweep reclaims its task, and the late
/// completion with the old generation is dropped. The reassigned copy
/// completes normally.
#[tokio::test]
async fn stuck_sweep_and_generation_fencing() {
    let config = HarnessConfig {
        scheduler: agentcom::domain::models::config::SchedulerConfig {
            stuck_threshold_ms: 0,
            fallback_wait_ms: 0,
            task_ttl_ms: 3_600_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness(config).await;
    let _rx1 = connect_agent(&h, "silent", &[]).await;

    let (task, _) = h
        .queue
        .submit(SubmitTask { description: "t".to_string(), ..Default::default() })
        .await
        .unwrap();
    h.scheduler.attempt_assignments().await.unwrap();

    let held = h.queue.get(task.id).await.unwrap().unwrap();
    let stale_generation = held.generation;
    assert_eq!(held.assigned_to.as_deref(), Some("silent"));

    // The agent accepted, then fell silent. The sweep reclaims.
    h.agents.on_accepted("silent", task.id).await.unwrap();
    h.scheduler.sweep().await.unwrap();

    let reclaimed = h.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Queued);
    assert_eq!(reclaimed.generation, stale_generation + 1);

    // Reassign to a fresh agent.
    let _rx2 = connect_agent(&h, "fresh", &[]).await;
    h.scheduler.attempt_assignments().await.unwrap();
    let reassigned = h.queue.get(task.id).await.unwrap().unwrap();
    let live_generation = reassigned.generation;
    assert!(reassigned.status.is_held_by_agent());

    // The original agent finally answers with its stale generation.
    let dropped = h
        .queue
        .complete(task.id, stale_generation, Some(serde_json::json!({"late": true})))
        .await
        .unwrap();
    assert!(dropped.is_none());
    assert!(h.queue.get(task.id).await.unwrap().unwrap().status.is_held_by_agent());

    // The live holder completes normally.
    let holder = reassigned.assigned_to.clone().unwrap();
    h.agents.on_accepted(&holder, task.id).await.unwrap();
    h.agents
        .on_complete(&holder, task.id, live_generation, Some(serde_json::json!({"ok": true})))
        .await
        .unwrap();

    let done = h.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
}

/// Rejection with reason busy requeues immediately with no retry penalty
/// and the task lands on another agent on the next pass.
#[tokio::test]
async fn busy_rejection_moves_to_another_agent() {
    let h = harness(HarnessConfig::default()).await;
    let _rx1 = connect_agent(&h, "a-busy", &[]).await;

    let (task, _) = h
        .queue
        .submit(SubmitTask { description: "t".to_string(), ..Default::default() })
        .await
        .unwrap();
    h.scheduler.attempt_assignments().await.unwrap();
    let first_holder = h.queue.get(task.id).await.unwrap().unwrap().assigned_to.unwrap();

    h.agents.on_rejected(&first_holder, task.id, "busy").await.unwrap();
    let requeued = h.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.retry_count, 0);

    let _rx2 = connect_agent(&h, "a-free", &[]).await;
    h.scheduler.attempt_assignments().await.unwrap();
    // Either agent may win, but the task must be held again.
    assert!(h.queue.get(task.id).await.unwrap().unwrap().status.is_held_by_agent());
}

/// Round-trip through the durable store preserves tasks exactly.
#[tokio::test]
async fn durable_round_trip() {
    let h = harness(HarnessConfig::default()).await;
    h.repos.add("https://r/a").await.unwrap();

    let (task, _) = h
        .queue
        .submit(SubmitTask {
            description: "round trip".to_string(),
            branch: Some("main".to_string()),
            success_criteria: vec!["works".to_string()],
            required_capabilities: vec!["rust".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

    let fetched = h.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(fetched, task);
}
