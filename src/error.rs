use tokio::time::Duration;

/// Returned instead of calling the protected operation while the breaker is
/// open, or while a half-open probe is still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is open ({threshold} failures within {window:?})")]
pub struct CircuitOpenError {
    threshold: u32,
    window: Duration,
}

/// Errors returned by a circuit breaker around an operation failing with `E`.
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// The breaker rejected the call; the operation was not invoked.
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    /// The operation ran and failed with this error.
    #[error(transparent)]
    Operation(E),
}

// === impl CircuitOpenError ===

impl CircuitOpenError {
    pub(crate) fn new(threshold: u32, window: Duration) -> Self {
        CircuitOpenError { threshold, window }
    }

    /// The configured failure threshold of the breaker that rejected the call.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// The configured error window of the breaker that rejected the call.
    pub fn window(&self) -> Duration {
        self.window
    }
}

// === impl Error ===

impl<E> Error<E> {
    /// Returns `true` if the call was rejected by the breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, Error::Open(_))
    }

    /// Returns `true` if the operation itself failed.
    pub fn is_operation(&self) -> bool {
        matches!(self, Error::Operation(_))
    }

    /// Returns the operation's error, if this is not a rejection.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Error::Operation(e) => Some(e),
            Error::Open(_) => None,
        }
    }
}
