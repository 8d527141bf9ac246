//! Per-target circuit breaker.
//!
//! ```text
//! CLOSED --[threshold failures]--> OPEN --[cooldown elapsed, Allow()]--> HALF_OPEN
//!   ^                               ^                                        |
//!   |                               +----------------[failure]---------------+
//!   +----------------------------------[success]-----------------------------+
//! ```
//!
//! The breaker has no trial limiter of its own while half-open: the scheduler
//! already runs at most one poll iteration per target.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_COOLDOWN_SECONDS};

/// Roughly 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects before allowing a trial
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD as u32,
            cooldown: Duration::from_secs(DEFAULT_OPEN_COOLDOWN_SECONDS as u64),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Zero thresholds or cooldowns fall back to the defaults.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let defaults = CircuitBreakerConfig::default();
        let config = CircuitBreakerConfig {
            failure_threshold: if config.failure_threshold == 0 {
                defaults.failure_threshold
            } else {
                config.failure_threshold
            },
            cooldown: if config.cooldown.is_zero() {
                defaults.cooldown
            } else {
                config.cooldown
            },
        };

        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                open_until: None,
            }),
        }
    }

    /// Whether a poll may contact the network now.
    ///
    /// An open circuit whose cooldown has passed moves to half-open and lets the call through.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .open_until
                    .map_or(true, |until| Instant::now() > until);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                }
                expired
            }
        }
    }

    pub fn success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.open_until = None;
        }
    }

    pub fn failure(&self) {
        let mut inner = self.inner.lock();
        // counted in every state, including open
        inner.failures = inner.failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.open_until = Some(self.reopen_deadline());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.open_until = Some(self.reopen_deadline());
            }
            CircuitState::Open => {}
        }
    }

    /// End of a cooldown starting now, saturating at a far-future instant
    fn reopen_deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.config.cooldown)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }
}
