// Circuit breaker guarding the remote vision API
//
// While open, extraction calls fail fast as per-item remote errors instead of
// queueing more requests against an endpoint that is already failing.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests are rejected without reaching the remote API
    Open,
    /// Trial requests are let through to test recovery
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: usize,
    /// Time spent open before letting trial requests through
    pub cooldown: Duration,
    /// Consecutive trial successes needed to close again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Rejection returned while the circuit is open
#[derive(Debug, Clone, thiserror::Error)]
#[error("{name} circuit open; retry in {retry_in_secs}s")]
pub struct CircuitOpen {
    pub name: &'static str,
    pub retry_in_secs: u64,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    inner: Arc<RwLock<BreakerInner>>,
    config: CircuitBreakerConfig,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    trips: u64,
    rejected: u64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            inner: Arc::new(RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                trips: 0,
                rejected: 0,
            })),
            config,
        }
    }

    /// Admit or reject a call
    pub fn check(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.cooldown);

                if elapsed >= self.config.cooldown {
                    info!("{} circuit half-open, sending trial requests", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    Ok(())
                } else {
                    inner.rejected += 1;
                    Err(CircuitOpen {
                        name: self.name,
                        retry_in_secs: (self.config.cooldown - elapsed).as_secs().max(1),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                info!("{} circuit closed, remote API recovered", self.name);
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    /// Record a failure; returns true when this failure tripped the breaker
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.write();
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trips += 1;
            warn!(
                "{} circuit opened after {} consecutive failures (cooldown {:?})",
                self.name, inner.consecutive_failures, self.config.cooldown
            );
        }
        trip
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: inner.trips,
            rejected: inner.rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub trips: u64,
    pub rejected: u64,
}
