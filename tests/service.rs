use std::{
    future::{poll_fn, Future},
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::time::{self, Duration};
use tower_service::Service;
use window_breaker::{
    time::{Cancel, Scheduler, Task, TokioClock, TokioScheduler},
    Breaker, CircuitBreakerService, Config, Error, State,
};

const WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("backend failed")]
struct BackendError;

#[derive(Debug, Clone, Copy)]
enum Req {
    Ok,
    Fail,
    Hang,
}

/// Answers each request the way it asks to be answered.
#[derive(Clone, Default)]
struct Backend {
    calls: Arc<AtomicUsize>,
}

impl Service<Req> for Backend {
    type Response = &'static str;
    type Error = BackendError;
    type Future = Pin<Box<dyn Future<Output = Result<&'static str, BackendError>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match req {
            Req::Ok => Box::pin(async { Ok("ok") }),
            Req::Fail => Box::pin(async { Err(BackendError) }),
            Req::Hang => Box::pin(std::future::pending()),
        }
    }
}

async fn ready<S: Service<Req>>(svc: &mut S) {
    poll_fn(|cx| svc.poll_ready(cx))
        .await
        .unwrap_or_else(|_| panic!("service failed to become ready"));
}

async fn send<S: Service<Req>>(svc: &mut S, req: Req) -> Result<S::Response, S::Error> {
    ready(svc).await;
    svc.call(req).await
}

/// Counts the timers a [`TokioScheduler`] runs and cancels.
#[derive(Clone, Default)]
struct Counting {
    ran: Arc<AtomicUsize>,
    canceled: Arc<AtomicUsize>,
}

struct CountingHandle {
    inner: Box<dyn Cancel>,
    canceled: Arc<AtomicUsize>,
}

impl Scheduler for Counting {
    fn schedule(&self, delay: Duration, task: Task) -> Box<dyn Cancel> {
        let ran = self.ran.clone();
        let inner = TokioScheduler.schedule(
            delay,
            Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                task();
            }),
        );
        Box::new(CountingHandle {
            inner,
            canceled: self.canceled.clone(),
        })
    }
}

impl Cancel for CountingHandle {
    fn cancel(self: Box<Self>) {
        self.canceled.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel();
    }
}

fn service(config: Config) -> (CircuitBreakerService<Backend>, Arc<AtomicUsize>) {
    let backend = Backend::default();
    let calls = backend.calls.clone();
    (
        CircuitBreakerService::new(Breaker::new(config), backend),
        calls,
    )
}

#[tokio::test(start_paused = true)]
async fn trips_rejects_and_recovers() {
    let (mut svc, calls) = service(Config::new(4, WINDOW));

    for _ in 0..4 {
        let err = send(&mut svc, Req::Fail).await.unwrap_err();
        assert_eq!(err.into_operation(), Some(BackendError));
    }
    assert_eq!(svc.breaker().state(), State::Open);

    let err = send(&mut svc, Req::Ok).await.unwrap_err();
    assert!(err.is_open());
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    time::sleep(WINDOW - Duration::from_millis(1)).await;
    assert_eq!(svc.breaker().state(), State::Open);

    time::sleep(Duration::from_millis(2)).await;
    assert_eq!(svc.breaker().state(), State::HalfOpen);

    assert_eq!(send(&mut svc, Req::Ok).await.unwrap(), "ok");
    assert_eq!(svc.breaker().state(), State::Closed);
    assert!(svc.breaker().status().recent_failures.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens() {
    let (mut svc, calls) = service(Config::new(4, WINDOW).with_initial_state(State::Open));

    time::sleep(WINDOW + Duration::from_millis(1)).await;
    assert_eq!(svc.breaker().state(), State::HalfOpen);

    assert!(send(&mut svc, Req::Fail).await.unwrap_err().is_operation());
    assert_eq!(svc.breaker().state(), State::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    time::sleep(WINDOW + Duration::from_millis(1)).await;
    assert_eq!(svc.breaker().state(), State::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn pending_probe_blocks_other_calls() {
    let (mut svc, calls) = service(Config::new(4, WINDOW).with_initial_state(State::HalfOpen));

    ready(&mut svc).await;
    let probe = svc.call(Req::Hang);

    let err = send(&mut svc, Req::Ok).await.unwrap_err();
    assert!(err.is_open());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // canceling the probe lets another one through.
    drop(probe);
    assert_eq!(send(&mut svc, Req::Ok).await.unwrap(), "ok");
    assert_eq!(svc.breaker().state(), State::Closed);
}

#[tokio::test(start_paused = true)]
async fn shared_breaker_trips_every_service() {
    let breaker = Breaker::new(Config::new(2, WINDOW));
    let mut a = CircuitBreakerService::new(breaker.clone(), Backend::default());
    let mut b = CircuitBreakerService::new(breaker.clone(), Backend::default());

    let _ = send(&mut a, Req::Fail).await;
    let _ = send(&mut b, Req::Fail).await;
    assert_eq!(breaker.state(), State::Open);

    assert!(send(&mut a, Req::Ok).await.unwrap_err().is_open());
    assert!(send(&mut b, Req::Ok).await.unwrap_err().is_open());
}

#[tokio::test(start_paused = true)]
async fn breaker_call_records_async_outcomes() {
    let breaker = Breaker::new(Config::new(2, WINDOW));

    let res: Result<(), Error<BackendError>> = breaker
        .call(|| async {
            time::sleep(Duration::from_millis(10)).await;
            Err(BackendError)
        })
        .await;
    assert!(res.unwrap_err().is_operation());

    let res = breaker.call(|| async { Ok::<_, BackendError>(1) }).await;
    assert_eq!(res.unwrap(), 1);
    assert_eq!(breaker.state(), State::Closed);

    let _ = breaker.call(|| async { Err::<(), _>(BackendError) }).await;
    assert_eq!(breaker.state(), State::Open);

    let rejected = breaker.call(|| async { Ok::<_, BackendError>(2) }).await;
    assert!(rejected.unwrap_err().is_open());
}

#[tokio::test(start_paused = true)]
async fn dropping_breaker_cancels_tokio_timer() {
    let timers = Counting::default();
    let breaker = Breaker::with_time(
        Config::new(1, WINDOW).with_initial_state(State::Open),
        TokioClock,
        timers.clone(),
    );
    assert_eq!(breaker.state(), State::Open);
    drop(breaker);
    assert_eq!(timers.canceled.load(Ordering::SeqCst), 1);

    time::sleep(WINDOW * 2).await;
    assert_eq!(timers.ran.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn recovery_timer_runs_once_per_trip() {
    let timers = Counting::default();
    let breaker = Breaker::with_time(Config::new(1, WINDOW), TokioClock, timers.clone());

    let _ = breaker.call(|| async { Err::<(), _>(BackendError) }).await;
    time::sleep(WINDOW + Duration::from_millis(1)).await;
    assert_eq!(breaker.state(), State::HalfOpen);
    assert_eq!(timers.ran.load(Ordering::SeqCst), 1);
    assert_eq!(timers.canceled.load(Ordering::SeqCst), 0);
}
