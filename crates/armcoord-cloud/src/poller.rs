//! Convergence polling for eventually-consistent resources
//!
//! A mutating call returns before the backend has finished applying it. The
//! poller repeatedly probes the resource until it reports a target state,
//! reports something unexpected, the probe fails, the deadline passes, or the
//! owning operation is cancelled.
//!
//! ```text
//! NotStarted ──► Polling ──► Converged
//!                  │  ▲  ├─► Failed (unexpected state)
//!                  └──┘  ├─► TimedOut
//!                pending ├─► Cancelled
//!                        └─► ProbeErrored
//! ```

use crate::backoff::{Backoff, PollConfig};
use crate::error::CloudError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sentinel state for "the resource does not exist"
pub const NOT_FOUND: &str = "NotFound";

/// Furthest deadline a timeout is clamped to
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Absolute deadline `timeout` from now; overflowing timeouts become [`FAR_FUTURE`]
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn wake_at(from: Instant, delay: Duration, deadline: Instant) -> Instant {
    from.checked_add(delay).map_or(deadline, |at| at.min(deadline))
}

/// One probe result: the fetched value (if any) and its state
#[derive(Debug, Clone)]
pub struct Observation<T> {
    pub value: Option<T>,
    pub state: String,
}

impl<T> Observation<T> {
    pub fn new(value: T, state: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            state: state.into(),
        }
    }

    pub fn state_only(state: impl Into<String>) -> Self {
        Self {
            value: None,
            state: state.into(),
        }
    }
}

/// Why a probe could not produce an observation
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The resource does not exist; an observation of [`NOT_FOUND`] when the
    /// wait lists that sentinel, a hard failure otherwise
    #[error("resource not found")]
    NotFound,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<CloudError> for ProbeError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::ResourceNotFound(_) => ProbeError::NotFound,
            other => ProbeError::Failed(other.into()),
        }
    }
}

pub type ProbeResult<T> = std::result::Result<Observation<T>, ProbeError>;

/// Successful wait
#[derive(Debug, Clone)]
pub struct Converged<T> {
    /// Value from the final probe (`None` for a [`NOT_FOUND`] target)
    pub value: Option<T>,
    pub state: String,
    pub probes: u32,
}

/// Terminal condition of a failed wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorKind {
    Timeout,
    UnexpectedState,
    ProbeError,
    Cancelled,
    InvalidSpec,
}

fn describe(state: &Option<String>) -> &str {
    state.as_deref().unwrap_or("none observed")
}

/// Failed wait, naming the resource and the last state seen
#[derive(Error, Debug)]
pub enum PollError {
    #[error(
        "timed out after {elapsed:?} waiting for {resource} to reach {} (last state: {})",
        .target.join("/"),
        describe(.last_state)
    )]
    Timeout {
        resource: String,
        target: Vec<String>,
        last_state: Option<String>,
        elapsed: Duration,
    },

    #[error(
        "{resource} reported unexpected state {state:?} (expected one of {})",
        .expected.join("/")
    )]
    UnexpectedState {
        resource: String,
        state: String,
        expected: Vec<String>,
    },

    #[error("probing {resource} failed (last state: {}): {source}", describe(.last_state))]
    Probe {
        resource: String,
        last_state: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("waiting for {resource} was cancelled (last state: {})", describe(.last_state))]
    Cancelled {
        resource: String,
        last_state: Option<String>,
    },

    #[error("invalid wait for {resource}: {reason}")]
    InvalidSpec { resource: String, reason: String },
}

impl PollError {
    pub fn kind(&self) -> PollErrorKind {
        match self {
            PollError::Timeout { .. } => PollErrorKind::Timeout,
            PollError::UnexpectedState { .. } => PollErrorKind::UnexpectedState,
            PollError::Probe { .. } => PollErrorKind::ProbeError,
            PollError::Cancelled { .. } => PollErrorKind::Cancelled,
            PollError::InvalidSpec { .. } => PollErrorKind::InvalidSpec,
        }
    }

    pub fn resource(&self) -> &str {
        match self {
            PollError::Timeout { resource, .. }
            | PollError::UnexpectedState { resource, .. }
            | PollError::Probe { resource, .. }
            | PollError::Cancelled { resource, .. }
            | PollError::InvalidSpec { resource, .. } => resource,
        }
    }

    pub fn last_state(&self) -> Option<&str> {
        match self {
            PollError::Timeout { last_state, .. }
            | PollError::Probe { last_state, .. }
            | PollError::Cancelled { last_state, .. } => last_state.as_deref(),
            PollError::UnexpectedState { state, .. } => Some(state),
            PollError::InvalidSpec { .. } => None,
        }
    }
}

/// Description of one convergence wait
#[derive(Debug, Clone)]
pub struct PollSpec {
    resource: String,
    pending: Vec<String>,
    target: Vec<String>,
    initial_delay: Duration,
    poll_interval: Duration,
    max_poll_interval: Duration,
    backoff_multiplier: f64,
    continuous_target_occurrence: u32,
    deadline: Instant,
    cancel: Option<CancellationToken>,
}

impl PollSpec {
    /// Wait for `resource` to move from `pending` to `target` within `timeout`,
    /// using [`PollConfig::default`] timing
    pub fn new(resource: impl Into<String>, pending: &[&str], target: &[&str], timeout: Duration) -> Self {
        let mut spec = Self {
            resource: resource.into(),
            pending: pending.iter().map(|s| s.to_string()).collect(),
            target: target.iter().map(|s| s.to_string()).collect(),
            initial_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
            max_poll_interval: Duration::ZERO,
            backoff_multiplier: 1.0,
            continuous_target_occurrence: 1,
            deadline: deadline_after(timeout),
            cancel: None,
        };
        spec.apply_config(&PollConfig::default());
        spec
    }

    fn apply_config(&mut self, config: &PollConfig) {
        self.initial_delay = config.initial_delay();
        self.poll_interval = config.poll_interval();
        self.max_poll_interval = config.max_poll_interval();
        self.backoff_multiplier = config.backoff_multiplier;
        self.continuous_target_occurrence = config.continuous_target_occurrence;
    }

    pub fn with_config(mut self, config: &PollConfig) -> Self {
        self.apply_config(config);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn validate(&self) -> Result<(), PollError> {
        let reason = if self.target.is_empty() {
            Some("no target states".to_string())
        } else if let Some(state) = self.pending.iter().find(|s| self.target.contains(s)) {
            Some(format!("state {state:?} is both pending and target"))
        } else if self.continuous_target_occurrence == 0 {
            Some("continuous target occurrence must be at least 1".to_string())
        } else if self.poll_interval.is_zero() {
            Some("poll interval must be positive".to_string())
        } else if self.max_poll_interval < self.poll_interval {
            Some(format!(
                "max poll interval {:?} is below poll interval {:?}",
                self.max_poll_interval, self.poll_interval
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(PollError::InvalidSpec {
                resource: self.resource.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn accepts_not_found(&self) -> bool {
        self.target.iter().chain(&self.pending).any(|s| s == NOT_FOUND)
    }

    fn expected(&self) -> Vec<String> {
        self.pending.iter().chain(&self.target).cloned().collect()
    }

    fn timed_out(&self, last_state: Option<String>, started: Instant) -> PollError {
        tracing::warn!(
            resource = %self.resource,
            last_state = describe(&last_state),
            "Timed out waiting for convergence"
        );
        PollError::Timeout {
            resource: self.resource.clone(),
            target: self.target.clone(),
            last_state,
            elapsed: started.elapsed(),
        }
    }

    fn cancelled(&self, last_state: Option<String>) -> PollError {
        tracing::warn!(resource = %self.resource, "Convergence wait cancelled");
        PollError::Cancelled {
            resource: self.resource.clone(),
            last_state,
        }
    }

    /// Drive this wait to a terminal state
    pub async fn wait<T, F, Fut>(self, probe: F) -> Result<Converged<T>, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProbeResult<T>>,
    {
        wait_for(self, probe).await
    }
}

/// Probe until `spec` reaches a terminal state
///
/// Probe errors fail fast; only pending observations are retried. The
/// consecutive-target counter resets on every pending observation, and the
/// interval only grows while pending.
pub async fn wait_for<T, F, Fut>(spec: PollSpec, mut probe: F) -> Result<Converged<T>, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeResult<T>>,
{
    spec.validate()?;

    let started = Instant::now();
    let cancel = spec.cancel.clone().unwrap_or_else(CancellationToken::new);
    let mut last_state: Option<String> = None;

    if started >= spec.deadline {
        return Err(spec.timed_out(last_state, started));
    }

    if !spec.initial_delay.is_zero() {
        tracing::debug!(resource = %spec.resource, delay = ?spec.initial_delay, "Delaying first probe");
        let wake = wake_at(started, spec.initial_delay, spec.deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(spec.cancelled(last_state)),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }

    let mut backoff = Backoff::new(
        spec.poll_interval,
        spec.max_poll_interval,
        spec.backoff_multiplier,
    );
    let mut consecutive = 0u32;
    let mut probes = 0u32;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(spec.cancelled(last_state)),
            result = probe() => result,
        };
        probes += 1;

        let observation = match result {
            Ok(observation) => observation,
            Err(ProbeError::NotFound) if spec.accepts_not_found() => {
                Observation::state_only(NOT_FOUND)
            }
            Err(ProbeError::NotFound) => {
                return Err(PollError::Probe {
                    source: anyhow::anyhow!("{} no longer exists", spec.resource),
                    resource: spec.resource,
                    last_state,
                });
            }
            Err(ProbeError::Failed(source)) => {
                tracing::warn!(resource = %spec.resource, error = %source, "Probe failed");
                return Err(PollError::Probe {
                    resource: spec.resource,
                    last_state,
                    source,
                });
            }
        };

        let state = observation.state;
        last_state = Some(state.clone());

        let wait = if spec.target.contains(&state) {
            consecutive += 1;
            if consecutive >= spec.continuous_target_occurrence {
                tracing::debug!(resource = %spec.resource, state = %state, probes, "Converged");
                return Ok(Converged {
                    value: observation.value,
                    state,
                    probes,
                });
            }
            backoff.current()
        } else if spec.pending.contains(&state) {
            consecutive = 0;
            backoff.next_interval()
        } else {
            tracing::warn!(resource = %spec.resource, state = %state, "Unexpected state");
            return Err(PollError::UnexpectedState {
                expected: spec.expected(),
                resource: spec.resource,
                state,
            });
        };

        let now = Instant::now();
        if now >= spec.deadline {
            return Err(spec.timed_out(last_state, started));
        }

        tracing::debug!(
            resource = %spec.resource,
            state = %state,
            attempt = probes,
            next = ?wait,
            "Still converging"
        );

        let wake = wake_at(now, wait, spec.deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(spec.cancelled(last_state)),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::{Ready, ready};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const PENDING: &[&str] = &["Updating"];
    const TARGET: &[&str] = &["Succeeded"];

    /// Probe replaying `states`, repeating the last one when exhausted
    fn scripted(
        states: &'static [&'static str],
    ) -> (Arc<AtomicU32>, impl FnMut() -> Ready<ProbeResult<u32>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let probe = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let state = states
                .get(n as usize)
                .or(states.last())
                .copied()
                .unwrap_or("Succeeded");
            ready(Ok(Observation::new(n + 1, state)))
        };
        (calls, probe)
    }

    fn spec(timeout: Duration) -> PollSpec {
        PollSpec::new("vnet-1", PENDING, TARGET, timeout)
            .with_poll_interval(Duration::from_millis(50))
            .with_max_poll_interval(Duration::from_millis(400))
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_pending_observations() {
        let (calls, probe) = scripted(&["Updating", "Updating", "Succeeded"]);

        let converged = spec(Duration::from_secs(60)).wait(probe).await.unwrap();

        assert_eq!(converged.probes, 3);
        assert_eq!(converged.state, "Succeeded");
        assert_eq!(converged.value, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_requires_consecutive_targets() {
        let (calls, probe) = scripted(&["Succeeded", "Updating", "Succeeded", "Succeeded"]);

        let converged = spec(Duration::from_secs(60))
            .with_continuous_target_occurrence(2)
            .wait(probe)
            .await
            .unwrap();

        assert_eq!(converged.probes, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_pending_times_out_at_deadline() {
        let (_calls, probe) = scripted(&["Updating"]);
        let started = Instant::now();

        let err = spec(Duration::from_millis(200)).wait(probe).await.unwrap_err();

        let elapsed = started.elapsed();
        assert_eq!(err.kind(), PollErrorKind::Timeout);
        assert_eq!(err.last_state(), Some("Updating"));
        assert_eq!(err.resource(), "vnet-1");
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(260), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_state_fails_fast() {
        let (calls, probe) = scripted(&["Updating", "Failed"]);
        let started = Instant::now();

        let err = spec(Duration::from_secs(3600)).wait(probe).await.unwrap_err();

        assert_eq!(err.kind(), PollErrorKind::UnexpectedState);
        assert_eq!(err.last_state(), Some("Failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(err.to_string().contains("Failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let probe = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            ready(if n == 0 {
                Ok(Observation::new((), "Updating"))
            } else {
                Err(ProbeError::Failed(anyhow::anyhow!("503 Service Unavailable")))
            })
        };

        let err = spec(Duration::from_secs(60)).wait(probe).await.unwrap_err();

        assert_eq!(err.kind(), PollErrorKind::ProbeError);
        assert_eq!(err.last_state(), Some("Updating"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_an_observation_when_targeted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let probe = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            ready(if n < 2 {
                Ok(Observation::new((), "Deleting"))
            } else {
                Err(ProbeError::NotFound)
            })
        };

        let converged = PollSpec::new("nic-1", &["Deleting"], &[NOT_FOUND], Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(10))
            .wait(probe)
            .await
            .unwrap();

        assert_eq!(converged.state, NOT_FOUND);
        assert!(converged.value.is_none());
        assert_eq!(converged.probes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_without_sentinel_is_a_probe_error() {
        let probe = || ready(Err::<Observation<()>, _>(ProbeError::NotFound));

        let err = spec(Duration::from_secs(60)).wait(probe).await.unwrap_err();

        assert_eq!(err.kind(), PollErrorKind::ProbeError);
        assert_eq!(err.last_state(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let (calls, probe) = scripted(&["Updating"]);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = spec(Duration::from_secs(3600))
            .with_poll_interval(Duration::from_secs(30))
            .with_max_poll_interval(Duration::from_secs(30))
            .with_cancellation(cancel)
            .wait(probe)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), PollErrorKind::Cancelled);
        assert_eq!(err.last_state(), Some("Updating"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fails_without_probing() {
        let (calls, probe) = scripted(&["Succeeded"]);

        let err = spec(Duration::from_secs(60))
            .with_deadline(Instant::now() - Duration::from_millis(1))
            .wait(probe)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), PollErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_precedes_first_probe() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let started = Instant::now();
        let probe = move || {
            record.lock().unwrap().push(started.elapsed());
            ready(Ok(Observation::new((), "Succeeded")))
        };

        spec(Duration::from_secs(60))
            .with_initial_delay(Duration::from_secs(5))
            .wait(probe)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0] >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_intervals_grow_and_stay_capped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let probe = move || {
            record.lock().unwrap().push(Instant::now());
            ready(Ok(Observation::new((), "Updating")))
        };

        let max = Duration::from_millis(300);
        let err = PollSpec::new("rt-1", PENDING, TARGET, Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(20))
            .with_max_poll_interval(max)
            .with_backoff_multiplier(1.5)
            .wait(probe)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PollErrorKind::Timeout);

        let seen = seen.lock().unwrap();
        let gaps: Vec<Duration> = seen.windows(2).map(|w| w[1] - w[0]).collect();
        // the final gap is cut short by the deadline
        let full = &gaps[..gaps.len() - 1];
        assert!(full.len() > 5);
        for pair in full.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        // timer wheel resolution is one millisecond
        let tick = Duration::from_millis(1);
        assert!(gaps.iter().all(|gap| *gap <= max + tick));
        assert!(*full.last().unwrap() >= max);
    }

    #[tokio::test]
    async fn test_overlapping_states_are_rejected() {
        let (calls, probe) = scripted(&["Succeeded"]);

        let err = PollSpec::new("nsg-1", &["Updating", "Succeeded"], TARGET, Duration::from_secs(5))
            .wait(probe)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), PollErrorKind::InvalidSpec);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_interval_below_poll_interval_is_rejected() {
        for max in [Duration::ZERO, Duration::from_millis(20)] {
            let (calls, probe) = scripted(&["Updating"]);

            let err = PollSpec::new("vnet-1", PENDING, TARGET, Duration::from_secs(1))
                .with_poll_interval(Duration::from_millis(50))
                .with_max_poll_interval(max)
                .wait(probe)
                .await
                .unwrap_err();

            assert_eq!(err.kind(), PollErrorKind::InvalidSpec);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeouts_and_intervals_do_not_overflow() {
        let (calls, probe) = scripted(&["Updating", "Succeeded"]);

        let spec = PollSpec::new("vnet-1", PENDING, TARGET, Duration::MAX)
            .with_poll_interval(Duration::from_millis(50))
            .with_max_poll_interval(Duration::MAX);
        assert!(spec.deadline() > Instant::now() + Duration::from_secs(86400 * 365));

        let converged = spec.wait(probe).await.unwrap();
        assert_eq!(converged.probes, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(deadline_after(Duration::from_secs(u64::MAX)) > Instant::now());
    }

    #[test]
    fn test_cloud_not_found_maps_to_probe_not_found() {
        let err: ProbeError = CloudError::ResourceNotFound("nic-1".into()).into();
        assert!(matches!(err, ProbeError::NotFound));

        let err: ProbeError = CloudError::ApiError("boom".into()).into();
        assert!(matches!(err, ProbeError::Failed(_)));
    }
}
