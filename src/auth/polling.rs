//! Bounded, cancellable polling shared by both link protocols.
//!
//! A [`PollingLoop`] owns exactly one [`Probe`] and calls it once
//! immediately, then once per interval, until the probe reports
//! [`ProbeOutcome::Done`], the attempt budget runs out, or the loop is
//! cancelled through its [`PollHandle`]. Whatever happens, the loop resolves
//! to exactly one [`LoopEnd`].

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::error::AuthError;

/// Interval and attempt budget for one flow.
///
/// `interval * max_attempts` is the nominal ceiling on how long a loop runs.
/// Server-requested slow-downs stretch the interval but are themselves
/// bounded: `max_attempts` slow-downs in a row end the loop with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    interval: Duration,
    max_attempts: u32,
}

impl PollConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 150;

    pub fn new(interval: Duration, max_attempts: u32) -> Result<Self, AuthError> {
        if max_attempts == 0 {
            return Err(AuthError::Configuration(
                "poll max_attempts must be greater than zero".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(AuthError::Configuration(
                "poll interval must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            interval,
            max_attempts,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout_ceiling(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Context handed to each probe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTick {
    /// 1-based index of the attempt about to run.
    pub attempt: u32,
    /// Interval the loop is currently using.
    pub interval: Duration,
}

/// What a single probe call reports back to the loop.
#[derive(Debug)]
pub enum ProbeOutcome<T> {
    /// Nothing terminal yet; consumes one attempt.
    Continue,
    /// Server asked us to back off; the new interval applies from the next
    /// tick on and the call does not consume an attempt. A run of
    /// `max_attempts` consecutive slow-downs times the loop out.
    SlowDown { interval: Duration },
    Done(T),
}

/// The single terminal outcome of a loop.
#[derive(Debug)]
pub enum LoopEnd<T> {
    Done(T),
    Timeout { attempts: u32 },
    Cancelled,
}

/// One poll step. The loop owns the probe, so any state the probe mutates is
/// only ever touched by one task.
#[async_trait]
pub trait Probe: Send + 'static {
    type Output: Send + 'static;

    async fn probe(&mut self, tick: PollTick) -> ProbeOutcome<Self::Output>;
}

/// Adapter turning an async closure into a [`Probe`].
pub struct FnProbe<F>(F);

/// Wrap `f` so it can drive a [`PollingLoop`].
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use pairlink::auth::polling::{probe_fn, LoopEnd, PollConfig, PollingLoop, ProbeOutcome};
///
/// # async fn run() {
/// let config = PollConfig::new(Duration::from_millis(10), 3).unwrap();
/// let task = PollingLoop::start(config, probe_fn(|tick| async move {
///     if tick.attempt == 2 { ProbeOutcome::Done(tick.attempt) } else { ProbeOutcome::Continue }
/// }));
/// assert!(matches!(task.finished().await, LoopEnd::Done(2)));
/// # }
/// ```
pub fn probe_fn<F, Fut, T>(f: F) -> FnProbe<F>
where
    F: FnMut(PollTick) -> Fut + Send + 'static,
    Fut: Future<Output = ProbeOutcome<T>> + Send + 'static,
    T: Send + 'static,
{
    FnProbe(f)
}

#[async_trait]
impl<F, Fut, T> Probe for FnProbe<F>
where
    F: FnMut(PollTick) -> Fut + Send + 'static,
    Fut: Future<Output = ProbeOutcome<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn probe(&mut self, tick: PollTick) -> ProbeOutcome<T> {
        (self.0)(tick).await
    }
}

const CANCEL_REQUESTED: u8 = 0b01;
const FINISHED: u8 = 0b10;

/// Cloneable stop switch for a running loop.
#[derive(Debug, Clone)]
pub struct PollHandle {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl PollHandle {
    /// Stop the loop. No new probe is scheduled after this returns and an
    /// in-flight probe result is discarded.
    ///
    /// Returns `true` only for the call that actually stopped a running loop;
    /// repeated calls, or calls after the loop ended, are no-ops. When this
    /// returns `true` the loop's outcome is [`LoopEnd::Cancelled`], even if
    /// its last probe completed at the same moment.
    pub fn cancel(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        if self.state.fetch_or(CANCEL_REQUESTED, Ordering::SeqCst) != 0 {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::SeqCst) & FINISHED != 0
    }

    /// Mark the loop finished, keeping `end` unless a cancel got in first.
    fn settle<T>(&self, end: LoopEnd<T>) -> LoopEnd<T> {
        if self.state.fetch_or(FINISHED, Ordering::SeqCst) & CANCEL_REQUESTED != 0 {
            return LoopEnd::Cancelled;
        }
        end
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A started loop: its stop switch plus the pending terminal outcome.
#[derive(Debug)]
pub struct PollTask<T> {
    handle: PollHandle,
    end_rx: oneshot::Receiver<LoopEnd<T>>,
}

impl<T> PollTask<T> {
    pub fn handle(&self) -> PollHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Wait for the loop's single terminal outcome.
    pub async fn finished(self) -> LoopEnd<T> {
        self.end_rx.await.unwrap_or(LoopEnd::Cancelled)
    }
}

/// Generic bounded-retry scheduler.
pub struct PollingLoop;

impl PollingLoop {
    /// Spawn a loop on the current tokio runtime.
    pub fn start<P: Probe>(config: PollConfig, probe: P) -> PollTask<P::Output> {
        Self::start_with_token(config, probe, CancellationToken::new())
    }

    /// Spawn a loop that also stops when `token` (or any parent) is cancelled.
    pub fn start_with_token<P: Probe>(
        config: PollConfig,
        probe: P,
        token: CancellationToken,
    ) -> PollTask<P::Output> {
        let handle = PollHandle {
            token,
            state: Arc::new(AtomicU8::new(0)),
        };
        let (end_tx, end_rx) = oneshot::channel();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let end = run(config, probe, task_handle.token().clone()).await;
            let _ = end_tx.send(task_handle.settle(end));
        });
        PollTask { handle, end_rx }
    }
}

async fn run<P: Probe>(
    config: PollConfig,
    mut probe: P,
    token: CancellationToken,
) -> LoopEnd<P::Output> {
    let mut interval = config.interval;
    let mut attempts = 0u32;
    let mut slow_downs = 0u32;

    loop {
        let tick = PollTick {
            attempt: attempts + 1,
            interval,
        };
        tracing::debug!(attempt = tick.attempt, interval_ms = interval.as_millis() as u64, "poll tick");

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return LoopEnd::Cancelled,
            outcome = probe.probe(tick) => outcome,
        };
        // A cancel racing with a completed probe still wins.
        if token.is_cancelled() {
            return LoopEnd::Cancelled;
        }

        match outcome {
            ProbeOutcome::Done(value) => return LoopEnd::Done(value),
            ProbeOutcome::Continue => {
                attempts += 1;
                slow_downs = 0;
            }
            ProbeOutcome::SlowDown { interval: next } => {
                slow_downs += 1;
                tracing::debug!(
                    previous_ms = interval.as_millis() as u64,
                    next_ms = next.as_millis() as u64,
                    "poll interval increased"
                );
                interval = next;
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return LoopEnd::Cancelled,
            _ = tokio::time::sleep(interval) => {}
        }

        if attempts >= config.max_attempts {
            tracing::debug!(attempts, "poll budget exhausted");
            return LoopEnd::Timeout { attempts };
        }
        if slow_downs >= config.max_attempts {
            tracing::debug!(attempts, slow_downs, "server kept asking to slow down");
            return LoopEnd::Timeout {
                attempts: attempts + slow_downs,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::OnceLock;
    use tokio::time::Instant;

    fn config(interval_ms: u64, max_attempts: u32) -> PollConfig {
        PollConfig::new(Duration::from_millis(interval_ms), max_attempts).unwrap()
    }

    #[test]
    fn config_rejects_zero_attempts_and_zero_interval() {
        assert!(matches!(
            PollConfig::new(Duration::from_secs(1), 0),
            Err(AuthError::Configuration(_))
        ));
        assert!(matches!(
            PollConfig::new(Duration::ZERO, 5),
            Err(AuthError::Configuration(_))
        ));
    }

    #[test]
    fn default_config_is_five_minutes() {
        let config = PollConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(2));
        assert_eq!(config.max_attempts(), 150);
        assert_eq!(config.timeout_ceiling(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn first_probe_runs_immediately() {
        let started = Instant::now();
        let task = PollingLoop::start(
            config(1_000, 5),
            probe_fn(move |_| async move { ProbeOutcome::Done(Instant::now()) }),
        );
        match task.finished().await {
            LoopEnd::Done(at) => assert_eq!(at, started),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_times_out_once_without_extra_probe() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();
        let task = PollingLoop::start(
            config(10, 3),
            probe_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { ProbeOutcome::<()>::Continue }
            }),
        );

        let end = task.finished().await;
        let elapsed = started.elapsed();

        assert!(matches!(end, LoopEnd::Timeout { attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(30), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(40), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_down_stretches_interval_without_consuming_attempts() {
        let ticks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = ticks.clone();
        let task = PollingLoop::start(
            config(10, 2),
            probe_fn(move |tick: PollTick| {
                seen.lock().unwrap().push((tick.attempt, tick.interval, Instant::now()));
                async move {
                    if tick.interval == Duration::from_millis(10) {
                        ProbeOutcome::<()>::SlowDown {
                            interval: Duration::from_millis(50),
                        }
                    } else {
                        ProbeOutcome::Continue
                    }
                }
            }),
        );

        let end = task.finished().await;
        assert!(matches!(end, LoopEnd::Timeout { attempts: 2 }));

        let ticks = ticks.lock().unwrap();
        // one slow_down plus the full budget of two counted attempts
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].0, 1);
        assert_eq!(ticks[1].0, 1);
        assert_eq!(ticks[1].1, Duration::from_millis(50));
        assert_eq!(ticks[1].2 - ticks[0].2, Duration::from_millis(50));
        assert_eq!(ticks[2].0, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn endless_slow_down_times_out_after_max_attempts_in_a_row() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();
        let task = PollingLoop::start(
            config(10, 3),
            probe_fn(move |tick: PollTick| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    ProbeOutcome::<()>::SlowDown {
                        interval: tick.interval + Duration::from_millis(10),
                    }
                }
            }),
        );

        let end = task.finished().await;

        assert!(matches!(end, LoopEnd::Timeout { attempts: 3 }), "{end:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 20 + 30 + 40ms of stretched sleeps
        assert_eq!(started.elapsed(), Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn counted_attempt_resets_the_slow_down_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let task = PollingLoop::start(
            config(10, 3),
            probe_fn(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 | 1 | 3 | 4 => ProbeOutcome::SlowDown {
                            interval: Duration::from_millis(10),
                        },
                        5 => ProbeOutcome::Done("approved"),
                        _ => ProbeOutcome::Continue,
                    }
                }
            }),
        );

        assert!(matches!(task.finished().await, LoopEnd::Done("approved")));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_that_reports_success_always_ends_cancelled() {
        let handle_slot: Arc<OnceLock<PollHandle>> = Arc::new(OnceLock::new());
        let cancelled_by_probe = Arc::new(AtomicBool::new(false));
        let (slot, flag) = (handle_slot.clone(), cancelled_by_probe.clone());
        let task = PollingLoop::start(
            config(10, 5),
            probe_fn(move |tick: PollTick| {
                let (slot, flag) = (slot.clone(), flag.clone());
                async move {
                    if tick.attempt == 1 {
                        return ProbeOutcome::Continue;
                    }
                    // cancel lands right as this probe completes
                    if let Some(handle) = slot.get() {
                        flag.store(handle.cancel(), Ordering::SeqCst);
                    }
                    ProbeOutcome::Done("late")
                }
            }),
        );
        let _ = handle_slot.set(task.handle());

        let end = task.finished().await;

        assert!(cancelled_by_probe.load(Ordering::SeqCst));
        assert!(matches!(end, LoopEnd::Cancelled), "{end:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_yields_single_cancelled_outcome() {
        let task = PollingLoop::start(
            config(10, 100),
            probe_fn(|_| async { ProbeOutcome::<()>::Continue }),
        );
        let handle = task.handle();
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!task.cancel());
        assert!(matches!(task.finished().await, LoopEnd::Cancelled));
        assert!(handle.is_finished());
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_completion_is_a_no_op() {
        let task = PollingLoop::start(
            config(10, 3),
            probe_fn(|_| async { ProbeOutcome::Done("linked") }),
        );
        let handle = task.handle();
        assert!(matches!(task.finished().await, LoopEnd::Done("linked")));
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_probe_result_is_discarded_after_cancel() {
        let applied = Arc::new(AtomicBool::new(false));
        let flag = applied.clone();
        let task = PollingLoop::start(
            config(10, 10),
            probe_fn(move |_| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    flag.store(true, Ordering::SeqCst);
                    ProbeOutcome::Done("late")
                }
            }),
        );
        let handle = task.handle();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        assert!(matches!(task.finished().await, LoopEnd::Cancelled));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!applied.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn parent_token_cancellation_stops_loop() {
        let parent = CancellationToken::new();
        let task = PollingLoop::start_with_token(
            config(10, 100),
            probe_fn(|_| async { ProbeOutcome::<()>::Continue }),
            parent.child_token(),
        );
        parent.cancel();
        assert!(matches!(task.finished().await, LoopEnd::Cancelled));
    }
}
