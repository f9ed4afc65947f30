//! Per-name circuit breaker with generation-based request accounting.
//!
//! Admission and completion accounting are both guarded by a single mutex
//! that is never held across the caller's future. Each admission captures
//! the breaker's current `(state, generation)` pair; a completion is only
//! applied to the live counts if the generation still matches, which is
//! what makes interval rollovers and state transitions race-free without
//! cancelable per-attempt bookkeeping.

mod registry;

pub use registry::{BreakerSnapshot, Manager};

use crate::clock::{Clock, MonotonicClock};
use crate::error::CoreError;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Breaker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Rolling counters reset on every generation bump.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_success_time_millis: Option<u64>,
    pub last_failure_time_millis: Option<u64>,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self, now: u64) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_success_time_millis = Some(now);
    }

    fn on_failure(&mut self, now: u64) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_failure_time_millis = Some(now);
    }

    /// Fraction of requests in this generation that failed.
    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.requests as f64
        }
    }
}

/// Default trip predicate: at least 5 requests and a failure rate at or above 60%.
pub fn default_ready_to_trip(counts: &Counts) -> bool {
    counts.requests >= 5 && counts.failure_rate() >= 0.6
}

/// Observer invoked whenever a breaker transitions between states.
pub type StateChangeCallback = Arc<dyn Fn(&str, State, State) + Send + Sync>;

/// Breaker configuration. Cloning is cheap — callbacks are reference-counted.
#[derive(Clone)]
pub struct BreakerConfig {
    /// Concurrent probes admitted while half-open.
    pub max_requests: u32,
    /// Closed-state window after which counts reset to a fresh generation.
    /// `Duration::ZERO` disables periodic reset.
    pub interval: Duration,
    /// Open-state duration before the next admission attempt may probe.
    pub timeout: Duration,
    /// Failure predicate evaluated in the closed state after each failure.
    pub ready_to_trip: Arc<dyn Fn(&Counts) -> bool + Send + Sync>,
    /// Optional state-change observer.
    pub on_state_change: Option<StateChangeCallback>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            ready_to_trip: Arc::new(default_ready_to_trip),
            on_state_change: None,
        }
    }
}

impl fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

struct Inner {
    state: State,
    generation: u64,
    counts: Counts,
    expiry_millis: u64,
}

/// Error returned by `execute`/`execute_with_timeout`: either the breaker
/// rejected the call outright, or the wrapped operation itself failed.
#[derive(Debug)]
pub enum ExecError<E> {
    Rejected(CoreError),
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ExecError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "{e}"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ExecError<E> {}

impl<E> ExecError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let expiry_millis = closed_expiry(now, config.interval);
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry_millis,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        current_state(&mut inner, &self.config, &self.name, now).0
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().unwrap().counts
    }

    /// Force the breaker closed and bump the generation, discarding counts.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Closed {
            notify(&self.config, &self.name, inner.state, State::Closed);
        }
        inner.state = State::Closed;
        to_new_generation(&mut inner, &self.config, now);
    }

    fn before_request(&self) -> Result<u64, CoreError> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        let (state, generation) = current_state(&mut inner, &self.config, &self.name, now);
        match state {
            State::Open => Err(CoreError::BreakerOpen { name: self.name.clone() }),
            State::HalfOpen if inner.counts.requests >= self.config.max_requests => {
                Err(CoreError::BreakerOpen { name: self.name.clone() })
            }
            _ => {
                inner.counts.on_request();
                Ok(generation)
            }
        }
    }

    fn after_request(&self, generation: u64, success: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        let (state, current_generation) = current_state(&mut inner, &self.config, &self.name, now);
        if generation != current_generation {
            return;
        }
        if success {
            on_success(&mut inner, &self.config, &self.name, state, now);
        } else {
            on_failure(&mut inner, &self.config, &self.name, state, now);
        }
    }

    /// Records an outcome the caller observed out-of-band (e.g. a load
    /// balancer instrumenting a call it placed itself, outside `execute`).
    /// Unlike `execute`, this never rejects — it always applies the
    /// outcome to the breaker's current generation, which is how passive
    /// instrumentation feeds the same state machine as gated calls.
    pub fn observe(&self, success: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        let (state, _generation) = current_state(&mut inner, &self.config, &self.name, now);
        inner.counts.on_request();
        if success {
            on_success(&mut inner, &self.config, &self.name, state, now);
        } else {
            on_failure(&mut inner, &self.config, &self.name, state, now);
        }
    }

    /// Invoke `f` exactly when the breaker admits. A panic inside `f` is
    /// caught, counted as a failure, and re-raised to the caller.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, ExecError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_request().map_err(ExecError::Rejected)?;
        match std::panic::AssertUnwindSafe(f()).catch_unwind().await {
            Ok(Ok(value)) => {
                self.after_request(generation, true);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.after_request(generation, false);
                Err(ExecError::Inner(err))
            }
            Err(panic) => {
                self.after_request(generation, false);
                std::panic::resume_unwind(panic);
            }
        }
    }

    /// Same admission rules as `execute`, but `f` runs in a detached task
    /// raced against `deadline`. The breaker does not cancel `f` on timeout;
    /// cancellation is the caller's responsibility.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        deadline: Duration,
        f: F,
    ) -> Result<T, ExecError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let generation = self.before_request().map_err(ExecError::Rejected)?;
        let handle = tokio::spawn(async move { std::panic::AssertUnwindSafe(f()).catch_unwind().await });
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(Ok(value))) => {
                self.after_request(generation, true);
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                self.after_request(generation, false);
                Err(ExecError::Inner(err))
            }
            Ok(Err(join_err)) => {
                self.after_request(generation, false);
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                unreachable!("task cannot be cancelled before it is awaited here")
            }
            Err(_elapsed) => {
                self.after_request(generation, false);
                Err(ExecError::Rejected(CoreError::BreakerTimeout {
                    name: self.name.clone(),
                    elapsed: deadline,
                }))
            }
        }
    }
}

fn closed_expiry(now: u64, interval: Duration) -> u64 {
    if interval.is_zero() {
        0
    } else {
        now + interval.as_millis() as u64
    }
}

/// Applies time-based transitions (closed-window rollover, open->half-open
/// promotion) and returns the resulting `(state, generation)`.
fn current_state(inner: &mut Inner, config: &BreakerConfig, name: &str, now: u64) -> (State, u64) {
    match inner.state {
        State::Closed => {
            if inner.expiry_millis != 0 && inner.expiry_millis <= now {
                to_new_generation(inner, config, now);
            }
        }
        State::Open => {
            if inner.expiry_millis <= now {
                set_state(inner, config, name, State::HalfOpen, now);
            }
        }
        State::HalfOpen => {}
    }
    (inner.state, inner.generation)
}

fn on_success(inner: &mut Inner, config: &BreakerConfig, name: &str, state: State, now: u64) {
    match state {
        State::Closed => inner.counts.on_success(now),
        State::HalfOpen => {
            inner.counts.on_success(now);
            if inner.counts.consecutive_successes >= config.max_requests {
                set_state(inner, config, name, State::Closed, now);
            }
        }
        State::Open => {}
    }
}

fn on_failure(inner: &mut Inner, config: &BreakerConfig, name: &str, state: State, now: u64) {
    match state {
        State::Closed => {
            inner.counts.on_failure(now);
            if (config.ready_to_trip)(&inner.counts) {
                set_state(inner, config, name, State::Open, now);
            }
        }
        State::HalfOpen => set_state(inner, config, name, State::Open, now),
        State::Open => {}
    }
}

fn set_state(inner: &mut Inner, config: &BreakerConfig, name: &str, new_state: State, now: u64) {
    if inner.state == new_state {
        return;
    }
    let old_state = inner.state;
    inner.state = new_state;
    to_new_generation(inner, config, now);
    notify(config, name, old_state, new_state);
}

fn to_new_generation(inner: &mut Inner, config: &BreakerConfig, now: u64) {
    inner.generation += 1;
    inner.counts = Counts::default();
    inner.expiry_millis = match inner.state {
        State::Closed => closed_expiry(now, config.interval),
        State::Open => now + config.timeout.as_millis() as u64,
        State::HalfOpen => 0,
    };
}

fn notify(config: &BreakerConfig, name: &str, from: State, to: State) {
    tracing::info!(event = "breaker_transition", breaker = name, from = %from, to = %to);
    if let Some(cb) = &config.on_state_change {
        cb(name, from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct ManualClock {
        millis: AtomicU64,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.millis.load(Ordering::SeqCst)
        }
    }

    fn breaker_with_clock(config: BreakerConfig) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let breaker = Arc::new(CircuitBreaker::with_clock("test", config, clock.clone()));
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Err::<(), &str>("boom") }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Ok::<(), &str>(()) }).await;
    }

    #[tokio::test]
    async fn trips_open_on_default_predicate() {
        let (breaker, _clock) = breaker_with_clock(BreakerConfig::default());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), State::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn open_rejects_without_calling_fn() {
        let (breaker, _clock) = breaker_with_clock(BreakerConfig::default());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), State::Open);
        let result = breaker.execute(|| async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(ExecError::Rejected(CoreError::BreakerOpen { .. }))));
    }

    #[tokio::test]
    async fn scenario_half_open_then_closed() {
        let config = BreakerConfig {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(100),
            ready_to_trip: Arc::new(|c: &Counts| c.requests >= 3 && c.failure_rate() >= 0.5),
            on_state_change: None,
        };
        let (breaker, clock) = breaker_with_clock(config);
        fail(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), State::Open);

        clock.advance(Duration::from_millis(120));
        assert_eq!(breaker.state(), State::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let config = BreakerConfig { max_requests: 1, timeout: Duration::from_millis(50), ..BreakerConfig::default() };
        let (breaker, clock) = breaker_with_clock(config);
        for _ in 0..5 {
            fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(60));
        assert_eq!(breaker.state(), State::HalfOpen);

        let gen = breaker.before_request().expect("first probe admitted");
        let rejected = breaker.before_request();
        assert!(rejected.is_err());
        breaker.after_request(gen, true);
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn reset_forces_closed_and_bumps_generation() {
        let (breaker, _clock) = breaker_with_clock(BreakerConfig::default());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), State::Open);
        breaker.reset();
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts().requests, 0);
    }

    #[tokio::test]
    async fn stale_generation_completion_is_ignored() {
        let (breaker, _clock) = breaker_with_clock(BreakerConfig::default());
        let generation = breaker.before_request().unwrap();
        breaker.reset();
        breaker.after_request(generation, false);
        assert_eq!(breaker.counts().total_failures, 0);
    }

    #[tokio::test]
    async fn panic_inside_execute_is_counted_and_repropagated() {
        let (breaker, _clock) = breaker_with_clock(BreakerConfig::default());
        let result = std::panic::AssertUnwindSafe(breaker.execute(|| async {
            panic!("boom");
            #[allow(unreachable_code)]
            Ok::<(), &str>(())
        }))
        .catch_unwind()
        .await;
        assert!(result.is_err());
        assert_eq!(breaker.counts().total_failures, 1);
    }

    #[tokio::test]
    async fn execute_with_timeout_counts_as_failure_and_does_not_abort_task() {
        use std::sync::atomic::AtomicBool;
        let (breaker, _clock) = breaker_with_clock(BreakerConfig::default());
        let completed = Arc::new(AtomicBool::new(false));
        let completed_clone = completed.clone();
        let result = breaker
            .execute_with_timeout(Duration::from_millis(20), move || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                completed_clone.store(true, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        assert!(matches!(result, Err(ExecError::Rejected(CoreError::BreakerTimeout { .. }))));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(completed.load(Ordering::SeqCst), "detached task must not be cancelled by the breaker");
    }
}
