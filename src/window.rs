use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// Failure timestamps, oldest first.
///
/// Stale entries are only dropped by [`FailureWindow::prune`], so reading the
/// window never changes it.
#[derive(Debug, Default)]
pub(crate) struct FailureWindow {
    failures: VecDeque<Instant>,
}

impl FailureWindow {
    pub(crate) fn push(&mut self, at: Instant) {
        // clocks are monotonic, but keep the ordering even if one isn't.
        let at = self.failures.back().map_or(at, |&last| at.max(last));
        self.failures.push_back(at);
    }

    /// Drops every failure older than `now - window`.
    pub(crate) fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) <= window {
                break;
            }
            self.failures.pop_front();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.failures.len()
    }

    pub(crate) fn clear(&mut self) {
        self.failures.clear();
    }

    pub(crate) fn to_vec(&self) -> Vec<Instant> {
        self.failures.iter().copied().collect()
    }
}
