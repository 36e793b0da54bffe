//! Hub finite state machine.
//!
//! The singleton controller sequencing the autonomous cycle. Every tick
//! it gathers a [`SystemSnapshot`], asks the pure predicate table for a
//! decision, and applies it. A watchdog forces any overstaying state back
//! to resting; healing entries are guarded by a cooldown and a rolling
//! attempt window.
//!
//! The improvement, contemplation, and healing bodies are injected as
//! [`CycleRunner`]s: stateless collaborators the FSM runs as detached
//! tasks while it keeps ticking.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::errors::DomainResult;
use crate::domain::models::config::HubConfig;
use crate::domain::models::{HubHistory, HubState, HubTransition};
use crate::services::budget::BudgetLedger;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::goal_backlog::GoalBacklog;
use crate::services::goal_orchestrator::GoalOrchestrator;
use crate::services::health::HealthAggregator;
use crate::services::hub_predicates::{self, Decision, SystemSnapshot};

/// Body of an auxiliary hub cycle (improve / contemplate / heal).
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run(&self);
}

/// A cycle that completes immediately. Placeholder for hubs that have no
/// improvement or contemplation pipeline configured.
pub struct NoopCycle;

#[async_trait]
impl CycleRunner for NoopCycle {
    async fn run(&self) {}
}

/// Default healing remediation: reclaim stuck tasks, re-probe endpoints
/// so recovered ones regain their healthy mark, and raise an alert trail.
pub struct HealingActions {
    pub scheduler: Arc<crate::services::scheduler::Scheduler>,
    pub endpoints: Arc<crate::services::endpoint_registry::EndpointRegistry>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl CycleRunner for HealingActions {
    async fn run(&self) {
        tracing::warn!("Healing cycle started");
        if let Err(err) = self.scheduler.sweep().await {
            tracing::error!(error = %err, "Healing: sweep failed");
        }
        if let Err(err) = self.endpoints.probe_all().await {
            tracing::error!(error = %err, "Healing: endpoint re-probe failed");
        }
        self.bus.publish(EventPayload::AlertRaised {
            rule: "healing_run".to_string(),
            message: "healing cycle executed remediation".to_string(),
            critical: false,
        });
    }
}

/// The three injected cycle bodies.
pub struct CycleHooks {
    pub improvement: Arc<dyn CycleRunner>,
    pub contemplation: Arc<dyn CycleRunner>,
    pub healing: Arc<dyn CycleRunner>,
}

impl Default for CycleHooks {
    fn default() -> Self {
        Self {
            improvement: Arc::new(NoopCycle),
            contemplation: Arc::new(NoopCycle),
            healing: Arc::new(NoopCycle),
        }
    }
}

struct Inner {
    current: HubState,
    entered_at: DateTime<Utc>,
    paused: bool,
    cycle_count: u64,
    history: HubHistory,
    /// Set when the running auxiliary cycle finishes.
    cycle_done: Option<Arc<AtomicBool>>,
    healing_attempts: VecDeque<DateTime<Utc>>,
    last_healing_exit: Option<DateTime<Utc>>,
}

/// Point-in-time view for the HTTP surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HubStatus {
    pub state: HubState,
    pub paused: bool,
    pub cycle_count: u64,
    pub entered_at: DateTime<Utc>,
    pub transition_count: u64,
}

pub struct HubFsm {
    backlog: Arc<GoalBacklog>,
    orchestrator: Arc<GoalOrchestrator>,
    budget: Arc<BudgetLedger>,
    health: Arc<HealthAggregator>,
    bus: Arc<EventBus>,
    hooks: CycleHooks,
    config: HubConfig,
    inner: Mutex<Inner>,
}

impl HubFsm {
    pub fn new(
        backlog: Arc<GoalBacklog>,
        orchestrator: Arc<GoalOrchestrator>,
        budget: Arc<BudgetLedger>,
        health: Arc<HealthAggregator>,
        bus: Arc<EventBus>,
        hooks: CycleHooks,
        config: HubConfig,
    ) -> Self {
        Self {
            backlog,
            orchestrator,
            budget,
            health,
            bus,
            hooks,
            config,
            inner: Mutex::new(Inner {
                current: HubState::Resting,
                entered_at: Utc::now(),
                paused: false,
                cycle_count: 0,
                history: HubHistory::new(),
                cycle_done: None,
                healing_attempts: VecDeque::new(),
                last_healing_exit: None,
            }),
        }
    }

    /// One tick of the cycle. No-op while paused.
    pub async fn tick(&self) -> DomainResult<()> {
        {
            let inner = self.inner.lock().await;
            if inner.paused {
                return Ok(());
            }
        }

        // Watchdog first: a stuck state is forced home regardless of
        // anything the predicates would say.
        if self.fire_watchdog_if_due().await {
            return Ok(());
        }

        let snapshot = self.gather_snapshot().await?;
        let current = self.inner.lock().await.current;
        let decision = hub_predicates::evaluate(current, &snapshot);

        match decision {
            Decision::Stay => {
                if current == HubState::Executing {
                    self.orchestrator.tick().await?;
                }
            }
            Decision::Transition { to, reason } => {
                self.apply_transition(to, &reason).await;
            }
        }
        Ok(())
    }

    async fn gather_snapshot(&self) -> DomainResult<SystemSnapshot> {
        let stats = self.backlog.stats().await?;
        let health = self.health.check().await?;

        let inner = self.inner.lock().await;
        let idle_threshold = Duration::milliseconds(
            i64::try_from(self.config.idle_before_improving_ms).unwrap_or(i64::MAX),
        );
        let idle_long_enough =
            inner.current == HubState::Resting && Utc::now() - inner.entered_at >= idle_threshold;

        Ok(SystemSnapshot {
            pending_goals: stats.submitted,
            active_goals: stats.active,
            budget_exhausted: self.budget.is_exhausted(),
            critical_health: health.has_critical(),
            healing_allowed: self.healing_allowed(&inner),
            idle_long_enough,
            cycle_complete: inner
                .cycle_done
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst)),
        })
    }

    fn healing_allowed(&self, inner: &Inner) -> bool {
        let cooldown = Duration::milliseconds(
            i64::try_from(self.config.healing_cooldown_ms).unwrap_or(i64::MAX),
        );
        if inner
            .last_healing_exit
            .is_some_and(|exit| Utc::now() - exit < cooldown)
        {
            return false;
        }

        let window = Duration::milliseconds(
            i64::try_from(self.config.healing_window_ms).unwrap_or(i64::MAX),
        );
        let cutoff = Utc::now() - window;
        let recent = inner.healing_attempts.iter().filter(|&&t| t > cutoff).count();
        recent < self.config.healing_max_attempts as usize
    }

    async fn apply_transition(&self, to: HubState, reason: &str) {
        let mut inner = self.inner.lock().await;
        let from = inner.current;
        if from == to {
            return;
        }

        if from == HubState::Healing {
            inner.last_healing_exit = Some(Utc::now());
        }

        inner.current = to;
        inner.entered_at = Utc::now();
        inner.history.record(from, to, reason);
        inner.cycle_done = None;

        match to {
            HubState::Executing => inner.cycle_count += 1,
            HubState::Improving => {
                inner.cycle_done = Some(self.spawn_cycle(Arc::clone(&self.hooks.improvement)));
            }
            HubState::Contemplating => {
                inner.cycle_done = Some(self.spawn_cycle(Arc::clone(&self.hooks.contemplation)));
            }
            HubState::Healing => {
                inner.healing_attempts.push_back(Utc::now());
                while inner.healing_attempts.len() > 32 {
                    inner.healing_attempts.pop_front();
                }
                inner.cycle_done = Some(self.spawn_cycle(Arc::clone(&self.hooks.healing)));
            }
            HubState::Resting => {}
        }
        drop(inner);

        tracing::info!(from = from.as_str(), to = to.as_str(), reason, "Hub transitioned");
        self.bus.publish(EventPayload::HubStateChanged {
            from,
            to,
            reason: reason.to_string(),
        });
    }

    fn spawn_cycle(&self, runner: Arc<dyn CycleRunner>) -> Arc<AtomicBool> {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        tokio::spawn(async move {
            runner.run().await;
            flag.store(true, Ordering::SeqCst);
        });
        done
    }

    /// Force a return to resting when a state overstays the watchdog.
    async fn fire_watchdog_if_due(&self) -> bool {
        let due = {
            let inner = self.inner.lock().await;
            let watchdog =
                Duration::milliseconds(i64::try_from(self.config.watchdog_ms).unwrap_or(i64::MAX));
            inner.current != HubState::Resting && Utc::now() - inner.entered_at >= watchdog
        };
        if !due {
            return false;
        }

        let state = self.inner.lock().await.current;
        tracing::warn!(state = state.as_str(), "Hub watchdog fired; forcing resting");
        self.bus.publish(EventPayload::WatchdogTimeout { state });
        self.bus.publish(EventPayload::AlertRaised {
            rule: "hub_watchdog".to_string(),
            message: format!("hub state {} exceeded the watchdog timeout", state.as_str()),
            critical: true,
        });
        self.apply_transition(HubState::Resting, "watchdog_timeout").await;
        true
    }

    /// Admin pause: the FSM stays responsive but makes no transitions.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = true;
        tracing::info!("Hub paused");
    }

    pub async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = false;
        // The pause may have lasted a long time; do not let the watchdog
        // fire spuriously on the first tick back.
        inner.entered_at = Utc::now();
        tracing::info!("Hub resumed");
    }

    pub async fn status(&self) -> HubStatus {
        let inner = self.inner.lock().await;
        HubStatus {
            state: inner.current,
            paused: inner.paused,
            cycle_count: inner.cycle_count,
            entered_at: inner.entered_at,
            transition_count: inner.history.total_transitions(),
        }
    }

    pub async fn history(&self) -> Vec<HubTransition> {
        self.inner.lock().await.history.entries()
    }

    pub async fn current_state(&self) -> HubState {
        self.inner.lock().await.current
    }

    /// Run the tick loop until the process shuts down.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = std::time::Duration::from_millis(self.config.tick_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick().await {
                    tracing::error!(error = %err, "Hub tick failed");
                }
            }
        })
    }
}
