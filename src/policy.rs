//! Restart decision for an exited child.
//!
//! Pure and deterministic: every input, including `now`, is passed in.

use std::time::{Duration, Instant};

use crate::config::{Backoff, RestartPolicySpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartImmediately,
    RestartAfter(Duration),
    GiveUp,
}

/// Everything the decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct RestartInput {
    pub restart_count: u32,
    pub last_exit_time: Instant,
    pub shutdown_requested: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    spec: RestartPolicySpec,
    ceiling: Duration,
}

impl RestartPolicy {
    pub fn new(spec: RestartPolicySpec, ceiling: Duration) -> Self {
        Self { spec, ceiling }
    }

    pub fn decide(&self, input: RestartInput, now: Instant) -> RestartDecision {
        if input.shutdown_requested {
            return RestartDecision::GiveUp;
        }
        if input.restart_count >= self.spec.max_restarts {
            return RestartDecision::GiveUp;
        }
        let delay = self.delay_for(input.restart_count);
        let elapsed = now.saturating_duration_since(input.last_exit_time);
        if elapsed >= delay {
            RestartDecision::RestartImmediately
        } else {
            RestartDecision::RestartAfter(delay - elapsed)
        }
    }

    /// Delay before restart number `restart_count + 1`.
    pub fn delay_for(&self, restart_count: u32) -> Duration {
        let cooldown = self.spec.cooldown();
        match self.spec.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Linear => cooldown.saturating_mul(restart_count),
            Backoff::Exponential if restart_count == 0 => Duration::ZERO,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(restart_count - 1).unwrap_or(u32::MAX);
                cooldown.saturating_mul(factor).min(self.ceiling)
            }
        }
    }
}
