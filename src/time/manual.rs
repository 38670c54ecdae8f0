use super::{Cancel, Clock, Scheduler, Task};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::time::{Duration, Instant};

/// A clock and scheduler that only move when told to.
///
/// Clones share the same timeline, so one `ManualTime` can be handed to a
/// breaker as both its [`Clock`] and its [`Scheduler`] and then advanced from
/// a test.
#[derive(Clone)]
pub struct ManualTime(Arc<Mutex<Timeline>>);

struct Timeline {
    origin: Instant,
    elapsed: Duration,
    next_id: u64,
    pending: Vec<Pending>,
}

struct Pending {
    id: u64,
    due: Duration,
    task: Task,
}

struct Handle {
    id: u64,
    timeline: Weak<Mutex<Timeline>>,
}

// === impl ManualTime ===

impl ManualTime {
    pub fn new() -> Self {
        ManualTime(Arc::new(Mutex::new(Timeline {
            origin: Instant::now(),
            elapsed: Duration::ZERO,
            next_id: 0,
            pending: Vec::new(),
        })))
    }

    /// Moves time forward by `by`, running every task that comes due along the
    /// way in deadline order.
    ///
    /// While a task runs, [`Clock::now`] reports that task's deadline.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().elapsed + by;
        loop {
            let task = {
                let mut timeline = self.lock();
                let next = timeline
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, pending)| pending.due <= target)
                    .min_by_key(|(_, pending)| (pending.due, pending.id))
                    .map(|(i, _)| i);
                match next {
                    Some(i) => {
                        let pending = timeline.pending.remove(i);
                        timeline.elapsed = timeline.elapsed.max(pending.due);
                        pending.task
                    }
                    None => {
                        timeline.elapsed = target;
                        return;
                    }
                }
            };
            // run outside the lock; tasks may schedule or cancel.
            task();
        }
    }

    /// How far time has been advanced since this `ManualTime` was created.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// The number of scheduled tasks that have neither run nor been canceled.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, Timeline> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timeline = self.lock();
        f.debug_struct("ManualTime")
            .field("elapsed", &timeline.elapsed)
            .field("pending", &timeline.pending.len())
            .finish()
    }
}

impl Clock for ManualTime {
    fn now(&self) -> Instant {
        let timeline = self.lock();
        timeline.origin + timeline.elapsed
    }
}

impl Scheduler for ManualTime {
    fn schedule(&self, delay: Duration, task: Task) -> Box<dyn Cancel> {
        let mut timeline = self.lock();
        let id = timeline.next_id;
        timeline.next_id += 1;
        let due = timeline.elapsed + delay;
        timeline.pending.push(Pending { id, due, task });
        Box::new(Handle {
            id,
            timeline: Arc::downgrade(&self.0),
        })
    }
}

// === impl Handle ===

impl Cancel for Handle {
    fn cancel(self: Box<Self>) {
        if let Some(timeline) = self.timeline.upgrade() {
            timeline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .retain(|pending| pending.id != self.id);
        }
    }
}
