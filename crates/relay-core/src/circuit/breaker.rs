//! Circuit breaker over a downstream call.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::state::BreakerState;
use crate::domain::{CircuitEvent, CircuitState, FlowError};
use crate::impls::NoopEventSink;
use crate::ports::{Clock, EventSink, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time spent Open before a trial call is let through.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
}

/// What a caller was granted by `acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

/// One breaker per protected call site. Share it as `Arc<CircuitBreaker>`.
///
/// The state mutex is held only while deciding/recording; the protected call
/// itself runs unlocked.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            state: Mutex::new(BreakerState::new()),
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let st = self.lock();
        CircuitSnapshot {
            state: st.state,
            failure_count: st.failure_count,
            threshold: self.config.failure_threshold,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Fails fast with `CircuitOpen` without calling `op` while the circuit is
    /// Open, or while another caller's HalfOpen trial is in flight.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, FlowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        let permit = self.acquire()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: permit == Permit::Trial,
        };

        let result = op().await;

        guard.armed = false;
        self.record(permit, result.is_ok());
        result
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<Permit, FlowError> {
        let mut st = self.lock();
        let current = st.state;
        if current.admits_calls() {
            return Ok(Permit::Normal);
        }
        match current {
            CircuitState::Open if st.reset_elapsed(self.clock.now(), self.config.reset_timeout) => {
                st.begin_trial();
                drop(st);
                info!(breaker = %self.name, "circuit half-open, allowing trial call");
                self.transition(CircuitState::Open, CircuitState::HalfOpen);
                Ok(Permit::Trial)
            }
            _ => {
                drop(st);
                debug!(breaker = %self.name, "circuit open, failing fast");
                self.sink.emit(
                    CircuitEvent::Rejected {
                        breaker: self.name.clone(),
                    }
                    .into(),
                );
                Err(FlowError::CircuitOpen(self.name.clone()))
            }
        }
    }

    fn record(&self, permit: Permit, success: bool) {
        let now = self.clock.now();
        let mut st = self.lock();
        let before = st.state;

        match (permit, success) {
            (Permit::Trial, true) => st.close(),
            (Permit::Trial, false) => st.open(now),
            (Permit::Normal, true) => {
                if st.state == CircuitState::Closed {
                    st.failure_count = 0;
                }
            }
            (Permit::Normal, false) => {
                // Another call may have opened the circuit meanwhile.
                if st.state == CircuitState::Closed {
                    st.failure_count += 1;
                    if st.failure_count >= self.config.failure_threshold {
                        st.open(now);
                    }
                }
            }
        }

        let after = st.state;
        let failures = st.failure_count;
        drop(st);

        if before != after {
            match after {
                CircuitState::Open => {
                    warn!(breaker = %self.name, failures, "circuit opened")
                }
                _ => info!(breaker = %self.name, ?after, "circuit transition"),
            }
            self.transition(before, after);
        }
    }

    /// A trial whose future was dropped before finishing.
    fn abandon_trial(&self) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen {
            st.abandon_trial();
            drop(st);
            debug!(breaker = %self.name, "trial call abandoned");
            self.transition(CircuitState::HalfOpen, CircuitState::Open);
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        self.sink.emit(
            CircuitEvent::Transition {
                breaker: self.name.clone(),
                from,
                to,
            }
            .into(),
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Releases the HalfOpen gate if a trial call is cancelled mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::RecordingEventSink;
    use crate::ports::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset: Duration) -> (Arc<CircuitBreaker>, Arc<ManualClock>, Arc<RecordingEventSink>) {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingEventSink::new());
        let cb = CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: reset,
            },
        )
        .with_clock(clock.clone())
        .with_sink(sink.clone());
        (Arc::new(cb), clock, sink)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), FlowError> {
        cb.call(|| async { Err(FlowError::transient("down")) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), FlowError> {
        cb.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let (cb, _clock, _sink) = breaker(3, Duration::from_secs(10));

        for _ in 0..2 {
            let _ = fail(&cb).await;
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let (cb, _clock, _sink) = breaker(2, Duration::from_secs(10));

        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling() {
        let (cb, clock, _sink) = breaker(1, Duration::from_secs(10));
        let _ = fail(&cb).await;

        let calls = AtomicU32::new(0);
        for _ in 0..5 {
            let err = cb
                .call(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .await
                .unwrap_err();
            assert_eq!(err, FlowError::CircuitOpen("downstream".into()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(9));
        assert!(succeed(&cb).await.is_err());
    }

    #[tokio::test]
    async fn trial_success_closes_circuit() {
        let (cb, clock, sink) = breaker(1, Duration::from_secs(10));
        let _ = fail(&cb).await;

        clock.advance(Duration::from_secs(10));
        succeed(&cb).await.unwrap();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);

        let transitions: Vec<(CircuitState, CircuitState)> = sink
            .circuit_events()
            .into_iter()
            .filter_map(|e| match e {
                CircuitEvent::Transition { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn trial_failure_reopens_and_restarts_timer() {
        let (cb, clock, _sink) = breaker(1, Duration::from_secs(10));
        let _ = fail(&cb).await;

        clock.advance(Duration::from_secs(10));
        assert!(matches!(fail(&cb).await, Err(FlowError::Handler { .. })));
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(5));
        assert!(matches!(succeed(&cb).await, Err(FlowError::CircuitOpen(_))));

        clock.advance(Duration::from_secs(5));
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn exactly_one_trial_under_concurrency() {
        let (cb, clock, _sink) = breaker(1, Duration::from_secs(1));
        let _ = fail(&cb).await;
        clock.advance(Duration::from_secs(1));

        let trials = Arc::new(AtomicU32::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        // the trial blocks until released so the others race against it
        let trial = tokio::spawn({
            let cb = Arc::clone(&cb);
            let trials = Arc::clone(&trials);
            let release = Arc::clone(&release);
            async move {
                cb.call(|| async move {
                    trials.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok::<_, FlowError>(())
                })
                .await
            }
        });

        while cb.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let mut others = Vec::new();
        for _ in 0..8 {
            let cb = Arc::clone(&cb);
            let trials = Arc::clone(&trials);
            others.push(tokio::spawn(async move {
                cb.call(|| async move {
                    trials.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FlowError>(())
                })
                .await
            }));
        }
        for h in others {
            assert!(matches!(h.await.unwrap(), Err(FlowError::CircuitOpen(_))));
        }

        release.notify_one();
        trial.await.unwrap().unwrap();

        assert_eq!(trials.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropped_trial_reopens_gate() {
        let (cb, clock, _sink) = breaker(1, Duration::from_secs(1));
        let _ = fail(&cb).await;
        clock.advance(Duration::from_secs(1));

        let trial = tokio::spawn({
            let cb = Arc::clone(&cb);
            async move {
                cb.call(|| std::future::pending::<Result<(), FlowError>>())
                    .await
            }
        });
        while cb.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }
        trial.abort();
        let _ = trial.await;

        assert_eq!(cb.state(), CircuitState::Open);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
