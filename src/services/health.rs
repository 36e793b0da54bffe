//! Health aggregation and alerting.
//!
//! Periodically evaluates alert rules over queue, agent, and endpoint
//! state. Critical issues feed the hub FSM's healing predicate and bypass
//! cooldowns; warnings respect a per-rule cooldown so a flapping rule
//! does not spam the alerts topic.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::errors::DomainResult;
use crate::domain::models::endpoint::EndpointHealth;
use crate::services::endpoint_registry::EndpointRegistry;
use crate::services::event_bus::{EventBus, EventPayload, HubEvent};
use crate::services::presence::Presence;
use crate::services::task_queue::TaskQueue;

/// Consecutive backlog growth samples before the backlog rule fires.
const BACKLOG_GROWTH_CHECKS: usize = 3;
/// Failure-rate threshold.
const FAILURE_RATE_THRESHOLD: f64 = 0.5;
/// Minimum outcomes in the window before the failure rate is meaningful.
const FAILURE_RATE_MIN_SAMPLES: usize = 4;
/// Error-count threshold for the last hour.
const ERRORS_PER_HOUR_THRESHOLD: usize = 10;
/// Stuck threshold mirrored from the scheduler default.
const STUCK_THRESHOLD_SECS: i64 = 300;
/// Window for failure-rate and error-count rules.
const OUTCOME_WINDOW_SECS: i64 = 3600;
/// Default cooldown between repeated warning alerts per rule.
const WARNING_COOLDOWN_SECS: i64 = 600;

/// One triggered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthIssue {
    pub rule: String,
    pub message: String,
}

/// The aggregate health picture handed to the hub FSM.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub critical: Vec<HealthIssue>,
    pub warnings: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn has_critical(&self) -> bool {
        !self.critical.is_empty()
    }
}

#[derive(Default)]
struct HealthState {
    backlog_samples: VecDeque<u64>,
    completions: VecDeque<DateTime<Utc>>,
    failures: VecDeque<DateTime<Utc>>,
    last_alert_at: HashMap<String, DateTime<Utc>>,
    last_report: Option<(DateTime<Utc>, HealthReport)>,
}

pub struct HealthAggregator {
    queue: Arc<TaskQueue>,
    presence: Arc<Presence>,
    endpoints: Arc<EndpointRegistry>,
    bus: Arc<EventBus>,
    /// Minimum gap between full rule evaluations.
    check_interval: Duration,
    state: Mutex<HealthState>,
}

impl HealthAggregator {
    pub fn new(
        queue: Arc<TaskQueue>,
        presence: Arc<Presence>,
        endpoints: Arc<EndpointRegistry>,
        bus: Arc<EventBus>,
        check_interval: Duration,
    ) -> Self {
        Self {
            queue,
            presence,
            endpoints,
            bus,
            check_interval,
            state: Mutex::new(HealthState::default()),
        }
    }

    /// Feed task outcome events into the failure-rate window. The caller
    /// owns the subscription loop; tests call this directly.
    pub async fn observe(&self, event: &HubEvent) {
        let mut state = self.state.lock().await;
        match &event.payload {
            EventPayload::TaskCompleted { .. } => state.completions.push_back(Utc::now()),
            EventPayload::TaskFailed { .. } | EventPayload::TaskDeadLettered { .. } => {
                state.failures.push_back(Utc::now());
            }
            _ => {}
        }
        let cutoff = Utc::now() - Duration::seconds(OUTCOME_WINDOW_SECS);
        while state.completions.front().is_some_and(|&t| t < cutoff) {
            state.completions.pop_front();
        }
        while state.failures.front().is_some_and(|&t| t < cutoff) {
            state.failures.pop_front();
        }
    }

    /// Evaluate the rules, emit due alerts, and return the report.
    ///
    /// Evaluations are rate-limited to the configured interval; calls in
    /// between return the cached report.
    pub async fn check(&self) -> DomainResult<HealthReport> {
        {
            let state = self.state.lock().await;
            if let Some((at, report)) = &state.last_report {
                if Utc::now() - *at < self.check_interval {
                    return Ok(report.clone());
                }
            }
        }

        let mut report = HealthReport::default();

        // Stuck tasks: the sweep should have caught these already.
        let stuck = self.queue.stuck_tasks(Duration::seconds(STUCK_THRESHOLD_SECS)).await?;
        if !stuck.is_empty() {
            report.critical.push(HealthIssue {
                rule: "stuck_tasks".to_string(),
                message: format!("{} tasks held longer than the stuck threshold", stuck.len()),
            });
        }

        // All endpoints unhealthy (only meaningful when some are registered).
        let endpoints = self.endpoints.list().await?;
        if !endpoints.is_empty()
            && endpoints.iter().all(|e| e.health == EndpointHealth::Unhealthy)
        {
            report.critical.push(HealthIssue {
                rule: "all_endpoints_unhealthy".to_string(),
                message: format!("all {} registered endpoints are unhealthy", endpoints.len()),
            });
        }

        let counts = self.queue.count_by_status().await?;
        let queued = counts
            .get(&crate::domain::models::TaskStatus::Queued)
            .copied()
            .unwrap_or(0);

        // No agents online while work is waiting.
        if queued > 0 && self.presence.online_count().await == 0 {
            report.warnings.push(HealthIssue {
                rule: "no_agents_online".to_string(),
                message: format!("{queued} tasks queued with no agents connected"),
            });
        }

        {
            let mut state = self.state.lock().await;

            // Backlog growing over consecutive checks.
            state.backlog_samples.push_back(queued);
            while state.backlog_samples.len() > BACKLOG_GROWTH_CHECKS + 1 {
                state.backlog_samples.pop_front();
            }
            if state.backlog_samples.len() > BACKLOG_GROWTH_CHECKS
                && state.backlog_samples.iter().zip(state.backlog_samples.iter().skip(1)).all(|(a, b)| b > a)
            {
                report.warnings.push(HealthIssue {
                    rule: "backlog_growing".to_string(),
                    message: format!(
                        "queue backlog grew {BACKLOG_GROWTH_CHECKS} consecutive checks (now {queued})"
                    ),
                });
            }

            // Failure rate over the outcome window.
            let failures = state.failures.len();
            let total = failures + state.completions.len();
            if total >= FAILURE_RATE_MIN_SAMPLES {
                #[allow(clippy::cast_precision_loss)]
                let rate = failures as f64 / total as f64;
                if rate > FAILURE_RATE_THRESHOLD {
                    report.warnings.push(HealthIssue {
                        rule: "failure_rate".to_string(),
                        message: format!("failure rate {:.0}% over the last hour", rate * 100.0),
                    });
                }
            }

            // Raw error volume.
            if failures > ERRORS_PER_HOUR_THRESHOLD {
                report.warnings.push(HealthIssue {
                    rule: "error_volume".to_string(),
                    message: format!("{failures} task errors in the last hour"),
                });
            }

            // Emit alerts: criticals bypass cooldowns, warnings respect them.
            let now = Utc::now();
            for issue in &report.critical {
                state.last_alert_at.insert(issue.rule.clone(), now);
                self.bus.publish(EventPayload::AlertRaised {
                    rule: issue.rule.clone(),
                    message: issue.message.clone(),
                    critical: true,
                });
            }
            for issue in &report.warnings {
                let due = state
                    .last_alert_at
                    .get(&issue.rule)
                    .is_none_or(|&last| now - last >= Duration::seconds(WARNING_COOLDOWN_SECS));
                if due {
                    state.last_alert_at.insert(issue.rule.clone(), now);
                    self.bus.publish(EventPayload::AlertRaised {
                        rule: issue.rule.clone(),
                        message: issue.message.clone(),
                        critical: false,
                    });
                }
            }

            state.last_report = Some((now, report.clone()));
        }

        Ok(report)
    }
}
