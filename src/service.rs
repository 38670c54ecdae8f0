use crate::{
    breaker::{Breaker, Permit},
    error::{CircuitOpenError, Error},
    time::{Clock, Scheduler, TokioClock, TokioScheduler},
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tower_service::Service;

/// A [`Service`] that guards an inner service with a [`Breaker`].
///
/// Readiness is always delegated to the inner service. Calls the breaker
/// rejects resolve immediately to [`Error::Open`] without reaching the inner
/// service; admitted calls are counted against the breaker when their
/// response future completes.
#[derive(Debug)]
pub struct CircuitBreakerService<Svc, C = TokioClock, S = TokioScheduler> {
    inner: Svc,
    breaker: Breaker<C, S>,
}

pin_project_lite::pin_project! {
    #[derive(Debug)]
    pub struct ResponseFuture<F, C, S> {
        #[pin]
        kind: Kind<F, C, S>,
    }
}

pin_project_lite::pin_project! {
    #[project = KindProj]
    #[derive(Debug)]
    pub(crate) enum Kind<F, C, S> {
        Called {
            #[pin]
            future: F,
            permit: Option<Permit<C, S>>,
        },
        Rejected {
            error: CircuitOpenError,
        },
    }
}

// === impl CircuitBreakerService ===

impl<Svc, C, S> CircuitBreakerService<Svc, C, S> {
    /// Wraps `inner` with `breaker`. The breaker may be shared with other
    /// services or callers through clones.
    pub fn new(breaker: Breaker<C, S>, inner: Svc) -> Self {
        CircuitBreakerService { inner, breaker }
    }

    pub fn breaker(&self) -> &Breaker<C, S> {
        &self.breaker
    }

    pub fn get_ref(&self) -> &Svc {
        &self.inner
    }

    pub fn into_inner(self) -> Svc {
        self.inner
    }
}

impl<Svc, C, S> Clone for CircuitBreakerService<Svc, C, S>
where
    Svc: Clone,
{
    fn clone(&self) -> Self {
        CircuitBreakerService {
            inner: self.inner.clone(),
            breaker: self.breaker.clone(),
        }
    }
}

impl<Svc, Req, C, S> Service<Req> for CircuitBreakerService<Svc, C, S>
where
    Svc: Service<Req>,
    C: Clock,
    S: Scheduler,
{
    type Response = Svc::Response;
    type Error = Error<Svc::Error>;
    type Future = ResponseFuture<Svc::Future, C, S>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Error::Operation)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let kind = match self.breaker.try_acquire() {
            Ok(permit) => Kind::Called {
                future: self.inner.call(req),
                permit: Some(permit),
            },
            Err(error) => Kind::Rejected { error },
        };
        ResponseFuture { kind }
    }
}

// === impl ResponseFuture ===

impl<F, C, S, T, E> Future for ResponseFuture<F, C, S>
where
    F: Future<Output = Result<T, E>>,
    C: Clock,
    S: Scheduler,
{
    type Output = Result<T, Error<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().kind.project() {
            KindProj::Called { future, permit } => match future.poll(cx) {
                Poll::Ready(Ok(rsp)) => {
                    if let Some(permit) = permit.take() {
                        permit.record_success();
                    }
                    Poll::Ready(Ok(rsp))
                }
                Poll::Ready(Err(err)) => {
                    if let Some(permit) = permit.take() {
                        permit.record_failure();
                    }
                    Poll::Ready(Err(Error::Operation(err)))
                }
                Poll::Pending => Poll::Pending,
            },
            KindProj::Rejected { error } => Poll::Ready(Err(Error::Open(*error))),
        }
    }
}
