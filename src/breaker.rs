use crate::{
    error::{CircuitOpenError, Error},
    time::{Cancel, Clock, Scheduler, TokioClock, TokioScheduler},
    window::FailureWindow,
    Config, State,
};
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::time::Instant;

/// The shared state machine behind a circuit breaker.
///
/// A `Breaker` is a handle: clones observe and drive the same state, and the
/// recovery timer is canceled once the last clone is dropped. Calls are
/// admitted with [`Breaker::try_acquire`] and their outcome reported through
/// the returned [`Permit`], so the outcome of an asynchronous operation can be
/// recorded when it completes.
pub struct Breaker<C = TokioClock, S = TokioScheduler>(Arc<Shared<C, S>>);

/// Wraps a synchronous operation in a [`Breaker`].
#[derive(Debug)]
pub struct CircuitBreaker<F, C = TokioClock, S = TokioScheduler> {
    operation: F,
    breaker: Breaker<C, S>,
}

/// Admission to call the protected operation once.
///
/// Report the outcome with [`Permit::record_success`] or
/// [`Permit::record_failure`]. A permit dropped without doing either records
/// nothing; if it was the half-open probe, another probe may be admitted.
#[must_use = "a permit should be used to record the outcome of the call"]
pub struct Permit<C = TokioClock, S = TokioScheduler> {
    breaker: Breaker<C, S>,
    admitted: Option<Admitted>,
}

/// A read-only snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    /// Failures recorded while closed, oldest first, as of the last call.
    ///
    /// Taking a snapshot does not prune the window, so this may include
    /// failures that have since aged out.
    pub recent_failures: Vec<Instant>,
}

struct Shared<C, S> {
    config: Config,
    clock: C,
    scheduler: S,
    inner: Mutex<Inner>,
}

struct Inner {
    state: State,
    failures: FailureWindow,
    recovery: Option<Box<dyn Cancel>>,
    /// Bumped on every trip; a recovery timer from an earlier trip is stale.
    trips: u64,
    probing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admitted {
    Closed,
    Probe,
}

// === impl Breaker ===

impl Breaker {
    /// Returns a new `Breaker` using Tokio's clock and timers.
    pub fn new(config: Config) -> Self {
        Self::with_time(config, TokioClock, TokioScheduler)
    }
}

impl<C, S> Breaker<C, S>
where
    C: Clock,
    S: Scheduler,
{
    /// Returns a new `Breaker` that reads time from `clock` and schedules its
    /// recovery timers on `scheduler`.
    pub fn with_time(config: Config, clock: C, scheduler: S) -> Self {
        let breaker = Breaker(Arc::new(Shared {
            config,
            clock,
            scheduler,
            inner: Mutex::new(Inner {
                state: config.initial_state(),
                failures: FailureWindow::default(),
                recovery: None,
                trips: 0,
                probing: false,
            }),
        }));

        if config.initial_state() == State::Open {
            let mut inner = breaker.lock();
            breaker.trip(&mut inner);
        }

        breaker
    }

    /// Asks the breaker to admit one call.
    ///
    /// Failures that have aged out of the window are pruned first. Closed
    /// breakers admit every call; half-open breakers admit a single probe at a
    /// time; open breakers admit nothing.
    pub fn try_acquire(&self) -> Result<Permit<C, S>, CircuitOpenError> {
        let now = self.0.clock.now();
        let mut inner = self.lock();
        inner.failures.prune(now, self.0.config.error_window());

        let admitted = match inner.state {
            State::Closed => Admitted::Closed,
            State::HalfOpen if !inner.probing => {
                inner.probing = true;
                Admitted::Probe
            }
            state => {
                tracing::trace!(%state, probing = inner.probing, "rejecting call");
                return Err(self.open_error());
            }
        };

        Ok(Permit {
            breaker: self.clone(),
            admitted: Some(admitted),
        })
    }

    /// Runs `f` if the breaker admits it, recording the outcome of the
    /// returned future.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(rsp) => {
                permit.record_success();
                Ok(rsp)
            }
            Err(e) => {
                permit.record_failure();
                Err(Error::Operation(e))
            }
        }
    }

    fn record(&self, admitted: Admitted, success: bool) {
        let now = self.0.clock.now();
        let mut inner = self.lock();
        match (admitted, inner.state) {
            (Admitted::Probe, State::HalfOpen) => {
                inner.probing = false;
                if success {
                    tracing::debug!("probe succeeded; closing breaker");
                    inner.state = State::Closed;
                    inner.failures.clear();
                } else {
                    tracing::debug!("probe failed; re-opening breaker");
                    self.trip(&mut inner);
                }
            }
            (Admitted::Closed, State::Closed) if !success => {
                let window = self.0.config.error_window();
                let threshold = self.0.config.error_threshold();
                inner.failures.prune(now, window);
                inner.failures.push(now);
                let failures = inner.failures.len();
                if failures >= threshold as usize {
                    tracing::debug!(
                        failures,
                        threshold,
                        ?window,
                        "error threshold reached; tripping breaker"
                    );
                    self.trip(&mut inner);
                } else {
                    tracing::trace!(failures, threshold, "recorded failure");
                }
            }
            (Admitted::Closed, State::Closed) => {}
            (admitted, state) => {
                tracing::trace!(
                    ?admitted,
                    %state,
                    success,
                    "ignoring outcome of a call admitted in another state"
                );
            }
        }
    }

    /// Opens the breaker and schedules its recovery, replacing any recovery
    /// timer that is still pending.
    fn trip(&self, inner: &mut Inner) {
        // schedule first: if scheduling unwinds, the breaker is left as it was.
        let trip = inner.trips.wrapping_add(1);
        let shared = Arc::downgrade(&self.0);
        let recovery = self.0.scheduler.schedule(
            self.0.config.error_window(),
            Box::new(move || Self::recover(shared, trip)),
        );

        if let Some(pending) = inner.recovery.replace(recovery) {
            pending.cancel();
        }
        inner.trips = trip;
        inner.state = State::Open;
        inner.probing = false;
    }

    fn recover(shared: Weak<Shared<C, S>>, trip: u64) {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let breaker = Breaker(shared);
        let mut inner = breaker.lock();
        if inner.state != State::Open || inner.trips != trip {
            tracing::trace!(trip, "ignoring stale recovery timer");
            return;
        }
        inner.recovery = None;
        inner.state = State::HalfOpen;
        tracing::debug!(
            window = ?breaker.0.config.error_window(),
            "recovery timer elapsed; breaker is half-open"
        );
    }
}

impl<C, S> Breaker<C, S> {
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Returns the current state and failure history without pruning it.
    pub fn status(&self) -> Status {
        let inner = self.lock();
        Status {
            state: inner.state,
            recent_failures: inner.failures.to_vec(),
        }
    }

    fn open_error(&self) -> CircuitOpenError {
        let config = &self.0.config;
        CircuitOpenError::new(config.error_threshold(), config.error_window())
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == State::HalfOpen && inner.probing {
            tracing::trace!("probe abandoned without an outcome");
            inner.probing = false;
        }
    }

    // every critical section leaves `Inner` consistent, so a poisoned lock is
    // still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.0.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, S> Clone for Breaker<C, S> {
    fn clone(&self) -> Self {
        Breaker(self.0.clone())
    }
}

impl<C, S> fmt::Debug for Breaker<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Breaker");
        dbg.field("config", &self.0.config);
        match self.0.inner.try_lock() {
            Ok(inner) => dbg
                .field("state", &inner.state)
                .field("failures", &inner.failures.len())
                .field("probing", &inner.probing),
            Err(_) => dbg.field("state", &format_args!("<locked>")),
        };
        dbg.finish()
    }
}

// === impl Shared ===

impl<C, S> Drop for Shared<C, S> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = inner.recovery.take() {
            pending.cancel();
        }
    }
}

// === impl Permit ===

impl<C, S> Permit<C, S>
where
    C: Clock,
    S: Scheduler,
{
    pub fn record_success(mut self) {
        self.finish(true);
    }

    pub fn record_failure(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        if let Some(admitted) = self.admitted.take() {
            self.breaker.record(admitted, success);
        }
    }
}

impl<C, S> Permit<C, S> {
    pub fn is_probe(&self) -> bool {
        self.admitted == Some(Admitted::Probe)
    }
}

impl<C, S> Drop for Permit<C, S> {
    fn drop(&mut self) {
        if let Some(Admitted::Probe) = self.admitted.take() {
            self.breaker.release_probe();
        }
    }
}

impl<C, S> fmt::Debug for Permit<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("admitted", &self.admitted)
            .finish()
    }
}

// === impl CircuitBreaker ===

impl<F> CircuitBreaker<F> {
    pub fn new(operation: F, config: Config) -> Self {
        CircuitBreaker {
            operation,
            breaker: Breaker::new(config),
        }
    }
}

impl<F, C, S> CircuitBreaker<F, C, S>
where
    C: Clock,
    S: Scheduler,
{
    pub fn with_time(operation: F, config: Config, clock: C, scheduler: S) -> Self {
        CircuitBreaker {
            operation,
            breaker: Breaker::with_time(config, clock, scheduler),
        }
    }

    /// Invokes the protected operation, unless the breaker rejects the call.
    ///
    /// The operation's error is returned as [`Error::Operation`] and counted
    /// against the breaker. Rejections return [`Error::Open`] without invoking
    /// the operation.
    pub fn fire<T, E>(&mut self) -> Result<T, Error<E>>
    where
        F: FnMut() -> Result<T, E>,
    {
        let permit = self.breaker.try_acquire()?;
        match (self.operation)() {
            Ok(rsp) => {
                permit.record_success();
                Ok(rsp)
            }
            Err(e) => {
                permit.record_failure();
                Err(Error::Operation(e))
            }
        }
    }
}

impl<F, C, S> CircuitBreaker<F, C, S> {
    pub fn state(&self) -> State {
        self.breaker.state()
    }

    pub fn status(&self) -> Status {
        self.breaker.status()
    }

    pub fn config(&self) -> &Config {
        self.breaker.config()
    }

    pub fn breaker(&self) -> &Breaker<C, S> {
        &self.breaker
    }
}
