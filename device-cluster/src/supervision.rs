//! Failure budgets and the faults surfaced once a budget runs out.
//!
//! Entity actors and peer sessions both recover locally from failures, but
//! only a bounded number of times inside a sliding window. When that budget is
//! exhausted the component stops trying and reports a structured fault to its
//! supervising layer instead of spinning in a crash loop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use actix::prelude::*;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::entity::{EntityId, TenantId};
use crate::node::PeerAddress;

/// Outcome of recording a failure against a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    /// Still inside the budget; carries failures counted in the window
    Retry(usize),
    /// Budget exhausted; carries failures counted in the window
    Exhausted(usize),
}

/// Sliding-window failure counter
#[derive(Debug, Clone)]
pub struct FailureBudget {
    policy: RetryPolicy,
    failures: VecDeque<Instant>,
}

impl FailureBudget {
    /// Create an empty budget for `policy`
    pub fn new(policy: RetryPolicy) -> Self {
        FailureBudget {
            policy,
            failures: VecDeque::with_capacity(policy.max_failures + 1),
        }
    }

    /// Record a failure now
    pub fn record_failure(&mut self) -> BudgetVerdict {
        self.record_failure_at(Instant::now())
    }

    /// Record a failure observed at `now`
    pub fn record_failure_at(&mut self, now: Instant) -> BudgetVerdict {
        self.evict_expired(now);
        self.failures.push_back(now);
        let count = self.failures.len();
        if count > self.policy.max_failures {
            BudgetVerdict::Exhausted(count)
        } else {
            BudgetVerdict::Retry(count)
        }
    }

    /// Failures still inside the window at `now`
    pub fn failures_in_window(&mut self, now: Instant) -> usize {
        self.evict_expired(now);
        self.failures.len()
    }

    /// Forget every recorded failure
    pub fn reset(&mut self) {
        self.failures.clear();
    }

    /// Window length
    pub fn window(&self) -> Duration {
        self.policy.window
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) >= self.policy.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// An entity actor exceeded its failure budget, or hit a fatal error, and stopped
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct ActorFault {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Entity whose actor stopped
    pub entity_id: EntityId,
    /// Failures counted in the window when the actor stopped
    pub failures: usize,
    /// Last error seen
    pub error: String,
}

/// Reconnecting to a peer failed too often; the manager gave up on it
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct SessionFault {
    /// Peer the manager stopped retrying
    pub address: PeerAddress,
    /// Session id of the abandoned session
    pub session_id: Uuid,
    /// Failures counted in the window
    pub failures: usize,
    /// Retry window
    pub window: Duration,
    /// Last error seen
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_failures: 3,
            window: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_budget_exhausts_after_max_failures() {
        let mut budget = FailureBudget::new(policy());
        let start = Instant::now();

        assert_eq!(budget.record_failure_at(start), BudgetVerdict::Retry(1));
        assert_eq!(
            budget.record_failure_at(start + Duration::from_secs(1)),
            BudgetVerdict::Retry(2)
        );
        assert_eq!(
            budget.record_failure_at(start + Duration::from_secs(2)),
            BudgetVerdict::Retry(3)
        );
        assert_eq!(
            budget.record_failure_at(start + Duration::from_secs(3)),
            BudgetVerdict::Exhausted(4)
        );
    }

    #[test]
    fn test_old_failures_leave_the_window() {
        let mut budget = FailureBudget::new(policy());
        let start = Instant::now();

        for i in 0..3 {
            budget.record_failure_at(start + Duration::from_secs(i));
        }
        // the first two have aged out a minute later
        let later = start + Duration::from_secs(61);
        assert_eq!(budget.record_failure_at(later), BudgetVerdict::Retry(2));
        assert_eq!(budget.failures_in_window(later + Duration::from_secs(60)), 0);
    }

    #[test]
    fn test_reset() {
        let mut budget = FailureBudget::new(policy());
        let now = Instant::now();
        budget.record_failure_at(now);
        budget.reset();
        assert_eq!(budget.failures_in_window(now), 0);
        assert_eq!(budget.window(), Duration::from_secs(60));
    }
}
