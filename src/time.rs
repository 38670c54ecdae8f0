//! Time sources and timers used by a circuit breaker.
//!
//! The breaker never reads the system clock or spawns timers directly. It
//! goes through a [`Clock`] and a [`Scheduler`], which default to Tokio's
//! ([`TokioClock`], [`TokioScheduler`]) and can be swapped for
//! [`ManualTime`] to drive time by hand.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tokio::{
    runtime,
    task::JoinHandle,
    time::{self, Duration, Instant},
};

mod manual;
pub use manual::ManualTime;

/// A source of the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Deferred work handed to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a [`Task`] once a delay has elapsed.
pub trait Scheduler: Send + Sync + 'static {
    /// Schedules `task` to run after `delay`, returning a handle that can
    /// cancel it before it runs.
    fn schedule(&self, delay: Duration, task: Task) -> Box<dyn Cancel>;
}

/// A handle to a task scheduled by a [`Scheduler`].
///
/// Dropping the handle does not cancel the task.
pub trait Cancel: Send {
    fn cancel(self: Box<Self>);
}

/// Reads Tokio's clock, so `tokio::time::pause` and `advance` apply to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

/// Spawns a Tokio task per scheduled timer.
///
/// Outside of a Tokio runtime, the timer runs on a dedicated thread instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[derive(Debug)]
struct ThreadTimer {
    canceled: Arc<AtomicBool>,
}

// === impl TokioClock ===

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// === impl TokioScheduler ===

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Box<dyn Cancel> {
        if let Ok(rt) = runtime::Handle::try_current() {
            return Box::new(rt.spawn(async move {
                time::sleep(delay).await;
                task();
            }));
        }

        tracing::trace!(?delay, "no tokio runtime; scheduling timer on a thread");
        let canceled = Arc::new(AtomicBool::new(false));
        let flag = canceled.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if !flag.load(Ordering::Acquire) {
                task();
            }
        });
        Box::new(ThreadTimer { canceled })
    }
}

impl Cancel for ThreadTimer {
    fn cancel(self: Box<Self>) {
        self.canceled.store(true, Ordering::Release);
    }
}

impl Cancel for JoinHandle<()> {
    fn cancel(self: Box<Self>) {
        self.abort();
    }
}

// === impl Arc ===

impl<C: Clock> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

impl<S: Scheduler> Scheduler for Arc<S> {
    fn schedule(&self, delay: Duration, task: Task) -> Box<dyn Cancel> {
        (**self).schedule(delay, task)
    }
}
