//! Hub FSM cycle scenarios: the watchdog forcing a stuck state home,
//! healing entry with cooldown, and pause/resume behavior.

mod common;

use std::sync::Arc;

use agentcom::domain::models::config::HubConfig;
use agentcom::domain::models::hub::HubState;
use agentcom::services::event_bus::EventPayload;
use agentcom::services::hub_fsm::{CycleRunner, NoopCycle};
use agentcom::services::SubmitGoal;
use common::{harness, HarnessConfig};

struct NeverCompletes;

#[async_trait::async_trait]
impl CycleRunner for NeverCompletes {
    async fn run(&self) {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}

/// S6: force the FSM into a cycle state that never signals completion.
/// The watchdog fires, the FSM lands back in resting, and both the
/// telemetry event and the forced transition are recorded.
#[tokio::test]
async fn watchdog_forces_stuck_state_home() {
    let config = HarnessConfig {
        hub: HubConfig {
            idle_before_improving_ms: 0,
            watchdog_ms: 0,
            ..HubConfig::default()
        },
        // The improvement cycle never completes, so improving is a
        // deterministic stuck state to force.
        hooks: agentcom::services::CycleHooks {
            improvement: Arc::new(NeverCompletes),
            contemplation: Arc::new(NoopCycle),
            healing: Arc::new(NoopCycle),
        },
        ..Default::default()
    };
    let h = harness(config).await;

    let mut events = h.bus.subscribe();

    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.current_state().await, HubState::Improving);

    // Watchdog of zero: the very next tick forces resting.
    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.current_state().await, HubState::Resting);

    let mut saw_timeout = false;
    let mut saw_alert = false;
    while let Ok(event) = events.try_recv() {
        match event.payload {
            EventPayload::WatchdogTimeout { state } => {
                assert_eq!(state, HubState::Improving);
                saw_timeout = true;
            }
            EventPayload::AlertRaised { rule, critical, .. } if rule == "hub_watchdog" => {
                assert!(critical);
                saw_alert = true;
            }
            _ => {}
        }
    }
    assert!(saw_timeout);
    assert!(saw_alert);

    let history = h.hub.history().await;
    let forced = history.iter().find(|t| t.reason == "watchdog_timeout").unwrap();
    assert_eq!(forced.from, HubState::Improving);
    assert_eq!(forced.to, HubState::Resting);
}

/// A full autonomous loop: goals arrive while resting, the hub enters
/// executing and counts the cycle, then returns to resting when drained.
#[tokio::test]
async fn executing_cycle_counts() {
    let h = harness(HarnessConfig::default()).await;

    let goal = h
        .backlog
        .submit(SubmitGoal {
            title: "g".to_string(),
            description: "d".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.current_state().await, HubState::Executing);
    assert_eq!(h.hub.status().await.cycle_count, 1);

    // Remove the goal; with nothing pending or active the hub rests again.
    h.backlog.delete(goal.id).await.unwrap();
    h.hub.tick().await.unwrap();
    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.current_state().await, HubState::Resting);

    // A second goal starts cycle 2.
    h.backlog
        .submit(SubmitGoal {
            title: "g2".to_string(),
            description: "d".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.status().await.cycle_count, 2);
}

/// Pause halts transitions without losing responsiveness; resume picks
/// the cycle back up.
#[tokio::test]
async fn pause_and_resume() {
    let h = harness(HarnessConfig::default()).await;
    h.backlog
        .submit(SubmitGoal {
            title: "g".to_string(),
            description: "d".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    h.hub.pause().await;
    for _ in 0..3 {
        h.hub.tick().await.unwrap();
    }
    assert_eq!(h.hub.current_state().await, HubState::Resting);
    assert!(h.hub.status().await.paused);

    h.hub.resume().await;
    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.current_state().await, HubState::Executing);
}

/// Budget exhaustion is an input to the predicates, never an exception:
/// executing exits cleanly and stays out until the window rolls.
#[tokio::test]
async fn budget_exhaustion_rests() {
    let h = harness(HarnessConfig::default()).await;
    h.backlog
        .submit(SubmitGoal {
            title: "g".to_string(),
            description: "d".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.current_state().await, HubState::Executing);

    // Burn the whole default window.
    h.budget.record(u64::MAX / 2);
    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.current_state().await, HubState::Resting);

    // Still resting on later ticks while exhausted, despite pending goals.
    h.hub.tick().await.unwrap();
    assert_eq!(h.hub.current_state().await, HubState::Resting);
}
