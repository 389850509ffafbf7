use std::time::Duration;

use tokio::time::Instant;

/// Splits a dispatch's time budget across the hops of the tree.
///
/// Every hop keeps `hop_overhead` for itself (connect, relay and reply
/// transit) and hands the rest to its children, so a node `d` hops below the
/// origin of a dispatch with budget `T` is reached with at most
/// `T - d * hop_overhead` left. The overhead is an estimate supplied by
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGovernor {
    hop_overhead: Duration,
}

impl TimeoutGovernor {
    pub fn new(hop_overhead: Duration) -> Self {
        Self { hop_overhead }
    }

    pub fn hop_overhead(&self) -> Duration {
        self.hop_overhead
    }

    /// Budget to hand to a child when this hop must be done by `deadline`.
    /// `None` means the child would start with nothing left and must not be
    /// contacted.
    pub fn child_budget(&self, deadline: Instant, now: Instant) -> Option<Duration> {
        let remaining = deadline.checked_duration_since(now)?;
        non_zero(remaining.checked_sub(self.hop_overhead)?)
    }

    /// Budget a node `depth` hops below the origin starts with.
    pub fn budget_at_depth(&self, total: Duration, depth: u32) -> Option<Duration> {
        let spent = self.hop_overhead.checked_mul(depth)?;
        non_zero(total.checked_sub(spent)?)
    }
}

/// Longest budget a deadline is built from. `Duration::MAX` and other
/// "no limit" budgets are cut to this instead of overflowing the clock.
pub const MAX_BUDGET: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The absolute deadline `budget` after `now`.
pub fn deadline_after(now: Instant, budget: Duration) -> Instant {
    now + budget.min(MAX_BUDGET)
}

fn non_zero(budget: Duration) -> Option<Duration> {
    if budget.is_zero() {
        None
    } else {
        Some(budget)
    }
}
