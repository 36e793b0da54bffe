//! Token budget ledger.
//!
//! Every LLM dispatch is gated on [`BudgetLedger::check`]. Spend is
//! tracked in a rolling window; when the cap is hit the orchestrator
//! leaves its goal in place and the hub FSM sees `budget_exhausted` on the
//! next tick.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

use crate::domain::models::config::BudgetConfig;

/// Gate result for an LLM dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Ok,
    Exhausted,
}

#[derive(Debug)]
struct Window {
    started_at: DateTime<Utc>,
    spent: u64,
}

/// Windowed token ledger. Interior mutability keeps the call sites simple;
/// the lock is held for nanoseconds.
pub struct BudgetLedger {
    max_tokens: u64,
    window: Duration,
    state: Mutex<Window>,
}

impl BudgetLedger {
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            max_tokens: config.max_tokens_per_window,
            window: Duration::milliseconds(i64::try_from(config.window_ms).unwrap_or(i64::MAX)),
            state: Mutex::new(Window { started_at: Utc::now(), spent: 0 }),
        }
    }

    /// Whether another LLM call may be dispatched.
    pub fn check(&self) -> BudgetCheck {
        if self.max_tokens == 0 {
            // A zero cap disables the gate entirely.
            return BudgetCheck::Ok;
        }
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.roll(&mut state);
        if state.spent >= self.max_tokens {
            BudgetCheck::Exhausted
        } else {
            BudgetCheck::Ok
        }
    }

    /// Record tokens consumed by a finished LLM call.
    pub fn record(&self, tokens: u64) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.roll(&mut state);
        state.spent = state.spent.saturating_add(tokens);
    }

    /// Tokens spent in the current window.
    pub fn spent(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.roll(&mut state);
        state.spent
    }

    pub fn is_exhausted(&self) -> bool {
        self.check() == BudgetCheck::Exhausted
    }

    fn roll(&self, state: &mut Window) {
        if Utc::now() - state.started_at >= self.window {
            state.started_at = Utc::now();
            state.spent = 0;
        }
    }
}
