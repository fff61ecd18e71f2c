use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,   // Calls pass through
    Open,     // Failure threshold reached, calls fail fast
    HalfOpen, // Probing whether the venue recovered
}

/// Fails brokerage calls fast after repeated infrastructure failures.
///
/// Only errors the caller classifies as failures count towards the threshold, so a
/// venue that answers with a definitive rejection keeps the circuit closed.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: usize,
    success_threshold: usize,
    reset_after: Duration,
    name: String,
}

struct BreakerState {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open: {0}")]
    Open(String),

    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    /// `failure_threshold` consecutive failures open the circuit; after `reset_after`
    /// calls are let through again and `success_threshold` successes close it.
    pub fn new(
        name: impl Into<String>,
        failure_threshold: usize,
        success_threshold: usize,
        reset_after: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            reset_after,
            name: name.into(),
        }
    }

    pub async fn call<F, T, E>(
        &self,
        f: F,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().await.map_err(CircuitBreakerError::Open)?;

        match f.await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.on_failure().await;
                } else {
                    self.on_success().await;
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    async fn admit(&self) -> Result<(), String> {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Open {
            return Ok(());
        }
        let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or(self.reset_after);
        if elapsed >= self.reset_after {
            info!("CircuitBreaker [{}]: Open -> HalfOpen", self.name);
            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            Ok(())
        } else {
            Err(format!(
                "{} retry in {:?}",
                self.name,
                self.reset_after.saturating_sub(elapsed)
            ))
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.success_threshold {
                    info!(
                        "CircuitBreaker [{}]: HalfOpen -> Closed ({} successes)",
                        self.name, state.success_count
                    );
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;
        match state.state {
            CircuitState::Closed if state.failure_count >= self.failure_threshold => {
                error!(
                    "CircuitBreaker [{}]: Closed -> Open ({} failures)",
                    self.name, state.failure_count
                );
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                error!("CircuitBreaker [{}]: HalfOpen -> Open (probe failed)", self.name);
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }
}
