//! Waiter - Poll a remote resource until its lifecycle state settles
//!
//! Every mutating call against a backend returns before the resource is
//! actually usable. The waiter repeatedly fetches the resource's lifecycle
//! state and compares it against the pending and target sets of a
//! [`WaitSpec`]:
//!
//! - a target state ends the wait successfully, on first observation;
//! - a pending state sleeps for the poll interval and tries again, until the
//!   deadline passes;
//! - anything else is an unexpected (terminal failure) state.
//!
//! Transient fetch errors are retried according to the wait's
//! [`RetryPolicy`]; permanent ones abort immediately. A
//! [`CancellationToken`] interrupts an in-progress sleep or fetch.
//!
//! # Example
//!
//! ```ignore
//! let spec = WaitSpec::builder()
//!     .pending(["PROVISIONING", "STARTING"])
//!     .target(["RUNNING"])
//!     .timeout(Duration::from_secs(20 * 60))
//!     .build()?;
//!
//! let report = spec
//!     .wait(&handle, &cancel, || client.get_instance_state(&handle))
//!     .await?;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::resource::{LifecycleState, ResourceHandle};
use crate::retry::{ExponentialBackoff, RetryPolicy, jittered};

/// Default overall timeout for a wait (20 minutes)
pub const DEFAULT_TIMEOUT_SECS: u64 = 1200;

/// Longest timeout a wait accepts (one week)
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Default delay between polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by a single state fetch
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network blip, throttling, 5xx: worth retrying
    #[error("transient fetch failure: {0}")]
    Transient(#[source] BoxError),

    /// Anything retrying cannot fix (authorization, malformed request, ...)
    #[error("fetch failed: {0}")]
    Permanent(#[source] BoxError),

    /// The backend does not know the resource
    #[error("resource not found")]
    NotFound,
}

impl FetchError {
    pub fn transient(error: impl Into<BoxError>) -> Self {
        Self::Transient(error.into())
    }

    pub fn permanent(error: impl Into<BoxError>) -> Self {
        Self::Permanent(error.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Terminal failures of a wait
#[derive(Debug, Error)]
pub enum WaitError {
    /// The deadline passed while the resource was still pending
    #[error("timed out after {elapsed:?} waiting for {handle} (last state: {last_state})")]
    TimedOut {
        handle: ResourceHandle,
        last_state: LifecycleState,
        elapsed: Duration,
        fetches: u32,
    },

    /// The resource reported a state that is neither pending nor target
    #[error("{handle} reached unexpected state {state}")]
    UnexpectedState {
        handle: ResourceHandle,
        state: LifecycleState,
    },

    /// Transient fetch errors kept coming until the retry policy gave up
    #[error("gave up fetching state of {handle} after {attempts} attempts: {source}")]
    RetriesExhausted {
        handle: ResourceHandle,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    /// A non-retryable fetch error
    #[error("failed to fetch state of {handle}: {source}")]
    Fetch {
        handle: ResourceHandle,
        #[source]
        source: FetchError,
    },

    /// The wait was cancelled from outside
    #[error("wait for {handle} was cancelled")]
    Cancelled { handle: ResourceHandle },
}

impl WaitError {
    /// Whether the remote operation itself is known to have failed
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedState { .. } | Self::RetriesExhausted { .. }
        )
    }

    pub fn handle(&self) -> &ResourceHandle {
        match self {
            Self::TimedOut { handle, .. }
            | Self::UnexpectedState { handle, .. }
            | Self::RetriesExhausted { handle, .. }
            | Self::Fetch { handle, .. }
            | Self::Cancelled { handle } => handle,
        }
    }
}

pub type WaitResult<T> = Result<T, WaitError>;

/// Rejected wait configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WaitSpecError {
    #[error("pending and target state sets are both empty")]
    NoStates,

    #[error("target state set is empty")]
    NoTargetStates,

    #[error("state {0} is listed as both pending and target")]
    OverlappingState(LifecycleState),

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("timeout {0:?} exceeds the maximum of {max}s", max = MAX_TIMEOUT_SECS)]
    TimeoutTooLarge(Duration),

    #[error("invalid poll schedule: {0}")]
    InvalidSchedule(String),
}

/// Successful end of a wait
#[derive(Debug, Clone, PartialEq)]
pub struct WaitReport {
    /// The target state that was observed
    pub state: LifecycleState,
    /// Number of fetch calls, retries included
    pub fetches: u32,
    pub elapsed: Duration,
}

/// Delay between polls of a pending resource.
///
/// Constant by default; with a multiplier above 1.0 the interval grows per
/// poll up to `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Jitter fraction applied to each delay
    pub jitter: f64,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::constant(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS))
    }
}

impl PollSchedule {
    pub fn constant(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay after the given poll (1-based)
    pub fn delay(&self, poll: u32) -> Duration {
        let exponent = poll.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.multiplier.powi(exponent);
        let base = Duration::from_secs_f64(secs.min(self.max_interval.as_secs_f64()));
        jittered(base, self.jitter)
    }

    pub(crate) fn validate(&self) -> Result<(), WaitSpecError> {
        if self.interval.is_zero() {
            return Err(WaitSpecError::ZeroPollInterval);
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(WaitSpecError::InvalidSchedule(format!(
                "multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(WaitSpecError::InvalidSchedule(format!(
                "jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.max_interval < self.interval {
            return Err(WaitSpecError::InvalidSchedule(format!(
                "max interval {:?} is shorter than interval {:?}",
                self.max_interval, self.interval
            )));
        }
        Ok(())
    }
}

type FailurePredicate = Arc<dyn Fn(&LifecycleState) -> bool + Send + Sync>;

/// What to wait for and for how long
#[derive(Clone)]
pub struct WaitSpec {
    pending: HashSet<LifecycleState>,
    target: HashSet<LifecycleState>,
    failure: Option<FailurePredicate>,
    not_found_state: Option<LifecycleState>,
    timeout: Duration,
    poll: PollSchedule,
    retry: Arc<dyn RetryPolicy>,
}

impl fmt::Debug for WaitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pending: Vec<_> = self.pending.iter().collect();
        pending.sort();
        let mut target: Vec<_> = self.target.iter().collect();
        target.sort();
        f.debug_struct("WaitSpec")
            .field("pending", &pending)
            .field("target", &target)
            .field("failure", &self.failure.is_some())
            .field("not_found_state", &self.not_found_state)
            .field("timeout", &self.timeout)
            .field("poll", &self.poll)
            .field("retry", &self.retry)
            .finish()
    }
}

impl WaitSpec {
    pub fn builder() -> WaitSpecBuilder {
        WaitSpecBuilder::default()
    }

    pub fn is_pending(&self, state: &LifecycleState) -> bool {
        self.pending.contains(state)
    }

    pub fn is_target(&self, state: &LifecycleState) -> bool {
        self.target.contains(state)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_schedule(&self) -> &PollSchedule {
        &self.poll
    }

    /// Wait for `handle` using `fetch` to look up its state.
    pub async fn wait<F, Fut>(
        &self,
        handle: &ResourceHandle,
        cancel: &CancellationToken,
        fetch: F,
    ) -> WaitResult<WaitReport>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<LifecycleState, FetchError>>,
    {
        wait_for_state(self, handle, cancel, fetch).await
    }

    fn is_failure(&self, state: &LifecycleState) -> bool {
        self.failure.as_ref().is_some_and(|f| f(state))
    }
}

/// Builder for [`WaitSpec`]
pub struct WaitSpecBuilder {
    pending: HashSet<LifecycleState>,
    target: HashSet<LifecycleState>,
    failure: Option<FailurePredicate>,
    not_found_state: Option<LifecycleState>,
    timeout: Duration,
    poll: PollSchedule,
    retry: Arc<dyn RetryPolicy>,
}

impl Default for WaitSpecBuilder {
    fn default() -> Self {
        Self {
            pending: HashSet::new(),
            target: HashSet::new(),
            failure: None,
            not_found_state: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            poll: PollSchedule::default(),
            retry: Arc::new(ExponentialBackoff::default()),
        }
    }
}

impl WaitSpecBuilder {
    pub fn pending<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<LifecycleState>,
    {
        self.pending.extend(states.into_iter().map(Into::into));
        self
    }

    pub fn target<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<LifecycleState>,
    {
        self.target.extend(states.into_iter().map(Into::into));
        self
    }

    /// Treat states matching `predicate` as terminal failures, even when they
    /// are also listed as pending or target.
    pub fn failed_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&LifecycleState) -> bool + Send + Sync + 'static,
    {
        self.failure = Some(Arc::new(predicate));
        self
    }

    /// Report a not-found fetch as `state` instead of failing (deletes).
    pub fn not_found_as(mut self, state: impl Into<LifecycleState>) -> Self {
        self.not_found_state = Some(state.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval = interval;
        if self.poll.max_interval < interval || self.poll.multiplier == 1.0 {
            self.poll.max_interval = interval;
        }
        self
    }

    pub fn poll_schedule(mut self, schedule: PollSchedule) -> Self {
        self.poll = schedule;
        self
    }

    pub fn poll_jitter(mut self, jitter: f64) -> Self {
        self.poll.jitter = jitter;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = policy;
        self
    }

    /// Validate and build the spec.
    ///
    /// Besides [`WaitSpecError::NoStates`] (both sets empty), this is
    /// stricter than "some state set is non-empty" and also rejects:
    ///
    /// - [`WaitSpecError::NoTargetStates`]: pending states only, which can
    ///   never succeed;
    /// - [`WaitSpecError::OverlappingState`]: a state that is both pending and
    ///   target;
    /// - [`WaitSpecError::TimeoutTooLarge`]: a timeout above
    ///   [`MAX_TIMEOUT_SECS`];
    /// - a zero or malformed poll schedule.
    ///
    /// A spec with target states and no pending states is valid.
    pub fn build(self) -> Result<WaitSpec, WaitSpecError> {
        if self.pending.is_empty() && self.target.is_empty() {
            return Err(WaitSpecError::NoStates);
        }
        if self.target.is_empty() {
            return Err(WaitSpecError::NoTargetStates);
        }
        if let Some(state) = self.pending.intersection(&self.target).min() {
            return Err(WaitSpecError::OverlappingState(state.clone()));
        }
        if self.timeout > Duration::from_secs(MAX_TIMEOUT_SECS) {
            return Err(WaitSpecError::TimeoutTooLarge(self.timeout));
        }
        self.poll.validate()?;

        Ok(WaitSpec {
            pending: self.pending,
            target: self.target,
            failure: self.failure,
            not_found_state: self.not_found_state,
            timeout: self.timeout,
            poll: self.poll,
            retry: self.retry,
        })
    }
}

/// Poll `fetch` until the state of `handle` satisfies `spec`.
///
/// Returns as soon as a target state is observed. The deadline is measured
/// on the clock, not in fetches, and is not consulted while transient errors
/// are being retried.
pub async fn wait_for_state<F, Fut>(
    spec: &WaitSpec,
    handle: &ResourceHandle,
    cancel: &CancellationToken,
    fetch: F,
) -> WaitResult<WaitReport>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<LifecycleState, FetchError>>,
{
    let mut poller = Poller {
        spec,
        handle,
        cancel,
        fetch,
        fetches: 0,
    };
    poller.run().await
}

struct Poller<'a, F> {
    spec: &'a WaitSpec,
    handle: &'a ResourceHandle,
    cancel: &'a CancellationToken,
    fetch: F,
    fetches: u32,
}

impl<F, Fut> Poller<'_, F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<LifecycleState, FetchError>>,
{
    async fn run(&mut self) -> WaitResult<WaitReport> {
        let start = Instant::now();
        // A deadline beyond the clock's range never passes.
        let deadline = start.checked_add(self.spec.timeout);
        let mut polls = 0u32;

        loop {
            let state = self.fetch_with_retry().await?;
            polls += 1;

            if self.spec.is_failure(&state) {
                return Err(WaitError::UnexpectedState {
                    handle: self.handle.clone(),
                    state,
                });
            }
            if self.spec.is_target(&state) {
                trace!("{} reached {} after {} fetches", self.handle, state, self.fetches);
                return Ok(WaitReport {
                    state,
                    fetches: self.fetches,
                    elapsed: start.elapsed(),
                });
            }
            if !self.spec.is_pending(&state) {
                return Err(WaitError::UnexpectedState {
                    handle: self.handle.clone(),
                    state,
                });
            }

            let now = Instant::now();
            let mut delay = self.spec.poll.delay(polls);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Err(WaitError::TimedOut {
                        handle: self.handle.clone(),
                        last_state: state,
                        elapsed: now - start,
                        fetches: self.fetches,
                    });
                }
                // Never sleep past the deadline: the last poll lands on it.
                delay = delay.min(deadline - now);
            }
            debug!("{} is {}, polling again in {:?}", self.handle, state, delay);
            self.sleep(delay).await?;
        }
    }

    async fn fetch_with_retry(&mut self) -> WaitResult<LifecycleState> {
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            self.fetches += 1;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                result = (self.fetch)() => result,
            };

            let error = match result {
                Ok(state) => return Ok(state),
                Err(FetchError::NotFound) => match &self.spec.not_found_state {
                    Some(state) => return Ok(state.clone()),
                    None => FetchError::NotFound,
                },
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(WaitError::Fetch {
                    handle: self.handle.clone(),
                    source: error,
                });
            }

            failures += 1;
            match self.spec.retry.next_delay(failures, &error) {
                Some(delay) => {
                    debug!(
                        "fetching state of {} failed ({}), retry {} in {:?}",
                        self.handle, error, failures, delay
                    );
                    self.sleep(delay).await?;
                }
                None => {
                    return Err(WaitError::RetriesExhausted {
                        handle: self.handle.clone(),
                        attempts: failures,
                        source: error,
                    });
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> WaitResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn cancelled(&self) -> WaitError {
        WaitError::Cancelled {
            handle: self.handle.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NoRetry;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted fetch stub recording when it was called
    struct Script {
        responses: Mutex<VecDeque<Result<LifecycleState, FetchError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Script {
        fn new(responses: Vec<Result<&str, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(LifecycleState::from))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn fetch(&self) -> impl Future<Output = Result<LifecycleState, FetchError>> + '_ {
            self.calls.lock().unwrap().push(Instant::now());
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("fetch called more often than scripted");
            async move { next }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    fn handle() -> ResourceHandle {
        ResourceHandle::new("sim-instance-1")
    }

    fn instance_spec(timeout: Duration, interval: Duration) -> WaitSpec {
        WaitSpec::builder()
            .pending(["PROVISIONING"])
            .target(["RUNNING"])
            .timeout(timeout)
            .poll_interval(interval)
            .retry_policy(Arc::new(
                ExponentialBackoff::with_max_attempts(5)
                    .with_delays(Duration::from_millis(100), Duration::from_secs(2))
                    .with_jitter(0.0),
            ))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn first_target_state_returns_without_sleeping() {
        let spec = instance_spec(Duration::from_secs(60), Duration::from_secs(10));
        let script = Script::new(vec![Ok("RUNNING")]);
        let start = Instant::now();

        let report = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap();

        assert_eq!(report.state, "RUNNING");
        assert_eq!(report.fetches, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(script.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_then_running_within_two_intervals() {
        let interval = Duration::from_secs(5);
        let spec = instance_spec(interval * 2, interval);
        let script = Script::new(vec![Ok("PROVISIONING"), Ok("PROVISIONING"), Ok("RUNNING")]);

        let report = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap();

        assert_eq!(report.state, "RUNNING");
        assert_eq!(report.fetches, 3);
        assert_eq!(script.gaps(), vec![interval, interval]);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_pending_until_timeout() {
        let interval = Duration::from_secs(1);
        let timeout = Duration::from_millis(3500);
        let spec = instance_spec(timeout, interval);
        let fetches = std::sync::atomic::AtomicU32::new(0);
        let start = Instant::now();

        let err = spec
            .wait(&handle(), &CancellationToken::new(), || {
                fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Ok(LifecycleState::from("PROVISIONING")) }
            })
            .await
            .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "{:?}", elapsed);
        assert!(elapsed < timeout + interval, "{:?}", elapsed);
        match err {
            WaitError::TimedOut {
                last_state,
                fetches: reported,
                ..
            } => {
                assert_eq!(last_state, "PROVISIONING");
                assert_eq!(reported, fetches.load(std::sync::atomic::Ordering::SeqCst));
            }
            other => panic!("Expected TimedOut, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_state_fails_after_one_fetch() {
        let spec = instance_spec(Duration::from_secs(60), Duration::from_secs(1));
        let script = Script::new(vec![Ok("FAILED")]);

        let err = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap_err();

        assert!(err.is_failed());
        match err {
            WaitError::UnexpectedState { state, handle: h } => {
                assert_eq!(state, "FAILED");
                assert_eq!(h, handle());
            }
            other => panic!("Expected UnexpectedState, got {:?}", other),
        }
        assert_eq!(script.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_with_backoff() {
        let spec = instance_spec(Duration::from_secs(60), Duration::from_secs(10));
        let script = Script::new(vec![
            Err(FetchError::transient("throttled")),
            Err(FetchError::transient("throttled")),
            Err(FetchError::transient("connection reset")),
            Ok("RUNNING"),
        ]);

        let report = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap();

        assert_eq!(report.fetches, 4);
        assert_eq!(
            script.gaps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_error() {
        let spec = WaitSpec::builder()
            .pending(["PROVISIONING"])
            .target(["RUNNING"])
            .poll_interval(Duration::from_secs(1))
            .retry_policy(Arc::new(NoRetry))
            .build()
            .unwrap();
        let script = Script::new(vec![Err(FetchError::transient("service unavailable"))]);

        let err = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap_err();

        assert!(err.is_failed());
        match err {
            WaitError::RetriesExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 1);
                assert!(source.to_string().contains("service unavailable"));
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_continue_past_deadline() {
        let spec = instance_spec(Duration::from_millis(150), Duration::from_millis(100));
        let script = Script::new(vec![
            Ok("PROVISIONING"),
            Err(FetchError::transient("throttled")),
            Err(FetchError::transient("throttled")),
            Ok("RUNNING"),
        ]);

        let report = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap();

        assert_eq!(report.state, "RUNNING");
        assert!(report.elapsed > Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_aborts_after_one_fetch() {
        let spec = instance_spec(Duration::from_secs(60), Duration::from_secs(1));
        let script = Script::new(vec![Err(FetchError::permanent("not authorized"))]);

        let err = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap_err();

        assert!(!err.is_failed());
        assert!(matches!(
            err,
            WaitError::Fetch {
                source: FetchError::Permanent(_),
                ..
            }
        ));
        assert_eq!(script.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_permanent_unless_mapped() {
        let spec = instance_spec(Duration::from_secs(60), Duration::from_secs(1));
        let script = Script::new(vec![Err(FetchError::NotFound)]);
        let err = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WaitError::Fetch {
                source: FetchError::NotFound,
                ..
            }
        ));

        let spec = WaitSpec::builder()
            .pending(["DELETING"])
            .target(["DELETED"])
            .not_found_as("DELETED")
            .poll_interval(Duration::from_secs(1))
            .build()
            .unwrap();
        let script = Script::new(vec![Ok("DELETING"), Err(FetchError::NotFound)]);
        let report = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap();
        assert_eq!(report.state, "DELETED");
        assert_eq!(report.fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_predicate_wins_over_pending() {
        let spec = WaitSpec::builder()
            .pending(["PROVISIONING", "UPDATING"])
            .target(["ACTIVE"])
            .failed_when(|state| state.as_str().ends_with("FAILED") || state == "UPDATING")
            .poll_interval(Duration::from_secs(1))
            .build()
            .unwrap();
        let script = Script::new(vec![Ok("PROVISIONING"), Ok("UPDATING")]);

        let err = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap_err();

        match err {
            WaitError::UnexpectedState { state, .. } => assert_eq!(state, "UPDATING"),
            other => panic!("Expected UnexpectedState, got {:?}", other),
        }
        assert_eq!(script.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let interval = Duration::from_secs(10);
        let spec = instance_spec(Duration::from_secs(600), interval);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            canceller.cancel();
        });
        let start = Instant::now();

        let err = spec
            .wait(&handle(), &cancel, || async {
                Ok(LifecycleState::from("PROVISIONING"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled { .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(15), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(15) + interval, "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_hanging_fetch() {
        let spec = instance_spec(Duration::from_secs(600), Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        let err = spec
            .wait(&handle(), &cancel, || {
                std::future::pending::<Result<LifecycleState, FetchError>>()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn already_cancelled_never_fetches() {
        let spec = instance_spec(Duration::from_secs(60), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let script = Script::new(vec![]);

        let err = spec
            .wait(&handle(), &cancel, || script.fetch())
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled { .. }));
        assert_eq!(script.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn growing_poll_schedule_is_capped() {
        let spec = WaitSpec::builder()
            .pending(["PROVISIONING"])
            .target(["RUNNING"])
            .timeout(Duration::from_secs(600))
            .poll_schedule(PollSchedule {
                interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(3),
                multiplier: 2.0,
                jitter: 0.0,
            })
            .build()
            .unwrap();
        let script = Script::new(vec![
            Ok("PROVISIONING"),
            Ok("PROVISIONING"),
            Ok("PROVISIONING"),
            Ok("PROVISIONING"),
            Ok("RUNNING"),
        ]);

        spec.wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap();

        assert_eq!(
            script.gaps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_polls_stay_in_band_and_stop_at_deadline() {
        let interval = Duration::from_secs(1);
        let timeout = Duration::from_millis(4500);
        let spec = WaitSpec::builder()
            .pending(["PROVISIONING"])
            .target(["RUNNING"])
            .timeout(timeout)
            .poll_interval(interval)
            .poll_jitter(0.2)
            .retry_policy(Arc::new(NoRetry))
            .build()
            .unwrap();
        let calls = Mutex::new(Vec::new());
        let start = Instant::now();

        let err = spec
            .wait(&handle(), &CancellationToken::new(), || {
                calls.lock().unwrap().push(Instant::now());
                async { Ok(LifecycleState::from("PROVISIONING")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::TimedOut { .. }), "{:?}", err);

        // The timer wheel rounds sleeps up to the next millisecond
        let resolution = Duration::from_millis(1);
        let calls = calls.into_inner().unwrap();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        let (last, full) = gaps.split_last().unwrap();
        assert!(full.len() >= 2, "{:?}", gaps);
        for gap in full {
            assert!(*gap + resolution >= interval.mul_f64(0.8), "{:?}", gaps);
            assert!(*gap < interval.mul_f64(1.2) + resolution, "{:?}", gaps);
        }
        assert!(*last < interval.mul_f64(1.2) + resolution, "{:?}", gaps);

        let final_fetch = *calls.last().unwrap() - start;
        assert!(final_fetch >= timeout, "{:?}", final_fetch);
        assert!(final_fetch <= timeout + resolution, "{:?}", final_fetch);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_beyond_clock_range_never_expires() {
        let mut spec = instance_spec(Duration::from_secs(60), Duration::from_secs(10));
        spec.timeout = Duration::MAX;
        let script = Script::new(vec![Ok("PROVISIONING"), Ok("PROVISIONING"), Ok("RUNNING")]);

        let report = spec
            .wait(&handle(), &CancellationToken::new(), || script.fetch())
            .await
            .unwrap();

        assert_eq!(report.state, "RUNNING");
        assert_eq!(script.gaps(), vec![Duration::from_secs(10); 2]);
    }

    #[test]
    fn builder_rejects_timeout_above_maximum() {
        let max = Duration::from_secs(MAX_TIMEOUT_SECS);
        let spec = WaitSpec::builder().target(["RUNNING"]).timeout(max).build();
        assert!(spec.is_ok());

        let err = WaitSpec::builder()
            .target(["RUNNING"])
            .timeout(Duration::from_secs(u64::MAX))
            .build()
            .unwrap_err();
        assert_eq!(err, WaitSpecError::TimeoutTooLarge(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn builder_rejects_empty_state_sets() {
        let err = WaitSpec::builder().build().unwrap_err();
        assert_eq!(err, WaitSpecError::NoStates);

        let err = WaitSpec::builder().pending(["PROVISIONING"]).build().unwrap_err();
        assert_eq!(err, WaitSpecError::NoTargetStates);
    }

    #[test]
    fn builder_rejects_zero_poll_interval() {
        let err = WaitSpec::builder()
            .target(["RUNNING"])
            .poll_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, WaitSpecError::ZeroPollInterval);
    }

    #[test]
    fn builder_rejects_overlap_and_bad_schedule() {
        let err = WaitSpec::builder()
            .pending(["RUNNING"])
            .target(["RUNNING"])
            .build()
            .unwrap_err();
        assert_eq!(err, WaitSpecError::OverlappingState("RUNNING".into()));

        let err = WaitSpec::builder()
            .target(["RUNNING"])
            .poll_jitter(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, WaitSpecError::InvalidSchedule(_)));
    }

    #[test]
    fn target_only_spec_is_valid() {
        let spec = WaitSpec::builder().target(["AVAILABLE"]).build().unwrap();
        assert!(spec.is_target(&"AVAILABLE".into()));
        assert!(!spec.is_pending(&"AVAILABLE".into()));
        assert_eq!(spec.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn wait_error_messages() {
        let err = WaitError::UnexpectedState {
            handle: handle(),
            state: "FAILED".into(),
        };
        assert_eq!(err.to_string(), "sim-instance-1 reached unexpected state FAILED");

        let err = WaitError::Cancelled { handle: handle() };
        assert_eq!(err.handle(), &handle());
        assert_eq!(err.to_string(), "wait for sim-instance-1 was cancelled");
    }
}
