// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connect-attempt circuit breaker.
//!
//! The breaker only counts dial failures; protocol violations on an
//! established connection do not feed it. State is a pure function of
//! the failure counter and the last-failure timestamp, so callers pass
//! the current wall clock in and the struct itself never reads time.

use std::time::Duration;

/// Delay before the first retry.
const BASE_BACKOFF_MS: u64 = 10;
/// Ceiling for the exponential backoff schedule.
const MAX_BACKOFF_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Attempts flow.
    Closed,
    /// Cooldown has elapsed; one probe attempt is allowed.
    HalfOpen,
    /// Fail fast, no attempts.
    Open,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    fails: u64,
    last_failed_ms: i64,
    max_fails: u64,
    reset_after_ms: i64,
}

impl CircuitBreaker {
    /// A closed breaker. `max_fails` and `reset_after_ms` must both be
    /// positive; the config layer validates this before construction.
    pub fn new(max_fails: u64, reset_after_ms: i64) -> Self {
        Self::with_state(BreakerState::Closed, max_fails, reset_after_ms)
    }

    /// A breaker seeded into a specific state.
    pub fn with_state(state: BreakerState, max_fails: u64, reset_after_ms: i64) -> Self {
        let (fails, last_failed_ms) = match state {
            BreakerState::Closed => (0, 0),
            BreakerState::HalfOpen => (u64::MAX, 0),
            BreakerState::Open => (u64::MAX, i64::MAX),
        };
        Self {
            fails,
            last_failed_ms,
            max_fails,
            reset_after_ms,
        }
    }

    pub fn state(&self, now_ms: i64) -> BreakerState {
        if self.fails <= self.max_fails {
            BreakerState::Closed
        } else if now_ms.saturating_sub(self.last_failed_ms) > self.reset_after_ms {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    pub fn report_success(&mut self) {
        self.fails = 0;
        self.last_failed_ms = 0;
    }

    pub fn report_failure(&mut self, now_ms: i64) {
        self.fails = self.fails.saturating_add(1);
        self.last_failed_ms = now_ms;
    }

    pub fn has_failures(&self) -> bool {
        self.fails > 0 && self.last_failed_ms > 0
    }

    /// Pre-connect delay: `min(3 s, 10 ms * 2^(fails - 1))`, or `None`
    /// when no failure has been recorded since the last success.
    pub fn backoff(&self) -> Option<Duration> {
        if !self.has_failures() {
            return None;
        }
        let exp = (self.fails - 1).min(31) as u32;
        let ms = BASE_BACKOFF_MS.saturating_mul(1u64 << exp).min(MAX_BACKOFF_MS);
        Some(Duration::from_millis(ms))
    }
}
