//! Retry classification and exponential backoff
//!
//! [`RetryPolicy::decide`] is a pure function of the failure kind and the attempt number for a
//! given policy instance: jitter is drawn from a generator seeded by the policy seed and the
//! attempt, so the same inputs always produce the same [`RetryDecision`]. The attempt counter
//! itself lives in the connection state machine.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::options::RetryOptions;

/// Upper bound on jitter that keeps backoff non-decreasing across attempts
pub const MAX_JITTER: f64 = 1.0 / 3.0;

/// Failure classification consumed by [`RetryPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network timeout while connecting or sending
    NetworkTimeout,
    /// Connection reset, refused or closed
    TransportReset,
    /// Service side 5xx that is not throttling
    ServiceUnavailable,
    /// Service busy; may carry the service's retry-after hint
    Throttled {
        /// Delay requested by the service
        retry_after: Option<Duration>,
    },
    /// Authentication or authorization rejected
    Unauthorized,
    /// Malformed request, protocol violation or unsupported operation
    Malformed,
    /// Local configuration problem
    Configuration,
    /// Local deadline exceeded
    Timeout,
    /// Cancelled locally
    Cancelled,
    /// Operation on a closed connection
    Closed,
}

impl FailureKind {
    /// Whether failures of this kind are worth retrying at all
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::NetworkTimeout
                | FailureKind::TransportReset
                | FailureKind::ServiceUnavailable
                | FailureKind::Throttled { .. }
        )
    }
}

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// How long to wait before the next attempt
    pub retry_after: Duration,
    /// No further attempts should be made
    pub terminal: bool,
}

impl RetryDecision {
    fn retry(retry_after: Duration) -> Self {
        Self {
            retry_after,
            terminal: false,
        }
    }

    fn terminal() -> Self {
        Self {
            retry_after: Duration::ZERO,
            terminal: true,
        }
    }
}

/// Exponential backoff with jitter, bounded by a maximum cumulative retry duration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_ms: f64,
    cap_ms: f64,
    max_total_ms: f64,
    jitter: f64,
    seed: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryOptions::default())
    }
}

impl RetryPolicy {
    /// Build a policy from options. Jitter is clamped to `[0, MAX_JITTER]`.
    pub fn new(options: &RetryOptions) -> Self {
        let base_ms = options.base_delay_ms.max(1) as f64;
        Self {
            base_ms,
            cap_ms: (options.max_delay_ms as f64).max(base_ms),
            max_total_ms: options.max_retry_duration_ms as f64,
            jitter: options.jitter.clamp(0.0, MAX_JITTER),
            seed: options.seed,
        }
    }

    /// Decide whether attempt number `attempt` (zero based) should be retried and after how long
    pub fn decide(&self, kind: &FailureKind, attempt: u32) -> RetryDecision {
        if !kind.is_transient() || self.budget_exhausted(attempt) {
            return RetryDecision::terminal();
        }

        match kind {
            FailureKind::Throttled {
                retry_after: Some(delay),
            } => RetryDecision::retry(*delay),
            _ => RetryDecision::retry(self.backoff(attempt)),
        }
    }

    fn exponential_ms(&self, attempt: u32) -> f64 {
        self.base_ms * 2f64.powi(attempt.min(64) as i32)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let mut rng = StdRng::seed_from_u64(
            self.seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let spread: f64 = rng.gen_range(-1.0..=1.0);
        let jittered = self.exponential_ms(attempt) * (1.0 + spread * self.jitter);
        Duration::from_millis(jittered.min(self.cap_ms) as u64)
    }

    fn budget_exhausted(&self, attempt: u32) -> bool {
        let mut total = 0.0;
        for n in 0..=attempt {
            total += self.exponential_ms(n).min(self.cap_ms);
            if total > self.max_total_ms {
                return true;
            }
        }
        false
    }
}
