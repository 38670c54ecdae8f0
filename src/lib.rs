//! A circuit breaker that counts failures over a sliding time window.
//!
//! The breaker starts [`State::Closed`] and lets calls through. Once
//! [`Config::error_threshold`] failures land within [`Config::error_window`],
//! it trips to [`State::Open`] and rejects every call with a
//! [`CircuitOpenError`] without touching the protected operation. After one
//! more window elapses a recovery timer moves it to [`State::HalfOpen`], where
//! a single probe call decides whether it closes again or re-opens.
//!
//! ```
//! use std::time::Duration;
//! use window_breaker::{time::ManualTime, CircuitBreaker, Config, State};
//!
//! let time = ManualTime::new();
//! let config = Config::new(2, Duration::from_secs(1));
//! let mut breaker = CircuitBreaker::with_time(
//!     || Err::<(), _>("unavailable"),
//!     config,
//!     time.clone(),
//!     time.clone(),
//! );
//!
//! assert!(breaker.fire().is_err());
//! assert!(breaker.fire().is_err());
//! assert_eq!(breaker.state(), State::Open);
//! assert!(breaker.fire().unwrap_err().is_open());
//!
//! time.advance(Duration::from_secs(1));
//! assert_eq!(breaker.state(), State::HalfOpen);
//! ```
pub mod breaker;
pub mod error;
pub mod service;
pub mod time;
mod window;

pub use self::{
    breaker::{Breaker, CircuitBreaker, Permit, Status},
    error::{CircuitOpenError, Error},
    service::CircuitBreakerService,
};
use std::fmt;
use tokio::time::Duration;

/// The operating mode of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the recovery timer fires.
    Open,
    /// A single probe call is admitted to decide whether to close again.
    HalfOpen,
}

/// Configures a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    error_threshold: u32,
    error_window: Duration,
    initial_state: State,
}

// === impl State ===

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        })
    }
}

// === impl Config ===

impl Config {
    pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;
    pub const DEFAULT_ERROR_WINDOW: Duration = Duration::from_millis(3000);

    /// Returns a new `Config` that trips after `error_threshold` failures
    /// within `error_window`, and stays open for `error_window` once tripped.
    ///
    /// # Panics
    ///
    /// If `error_threshold` is 0.
    pub fn new(error_threshold: u32, error_window: Duration) -> Self {
        assert!(
            error_threshold >= 1,
            "error threshold ({error_threshold}) must be at least 1"
        );
        Config {
            error_threshold,
            error_window,
            initial_state: State::Closed,
        }
    }

    /// Sets the state a new breaker starts in.
    ///
    /// Starting in [`State::Open`] schedules the recovery timer as soon as
    /// the breaker is constructed.
    pub fn with_initial_state(self, initial_state: State) -> Self {
        Config {
            initial_state,
            ..self
        }
    }

    pub fn error_threshold(&self) -> u32 {
        self.error_threshold
    }

    /// The sliding window failures are counted over, which is also how long
    /// the breaker stays open once tripped.
    pub fn error_window(&self) -> Duration {
        self.error_window
    }

    pub fn initial_state(&self) -> State {
        self.initial_state
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(Self::DEFAULT_ERROR_THRESHOLD, Self::DEFAULT_ERROR_WINDOW)
    }
}
