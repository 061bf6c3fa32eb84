//! Delivery worker: poll → extract → build → enqueue, forever.
//!
//! ```text
//! Idle → Fetching → Extracting → Building → Draining → Idle
//!   └──────────────── any ─────────────────────→ Stopped
//! ```
//!
//! Events leave the worker one at a time, [`PACING_DELAY_SECS`] apart, in
//! rotations that cover every device of the latest snapshot once.
//! Polling either runs on its own timer, concurrently with emission (a fresh
//! snapshot refreshes the events still owed in the current rotation), or, with
//! no poll interval, waits until the rotation has drained.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::OutboundQueue;
use super::source::FeedSource;
use crate::acquisition::{extract_placemarks, FetchError, ParseError};
use crate::config::defaults::PACING_DELAY_SECS;
use crate::config::{FailurePolicy, Settings};
use crate::cot::{build_events, BuildError, CotMessage, EventTemplate};
use crate::types::WorkerState;

/// Wall clock used to stamp events.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

// ============================================================================
// Errors
// ============================================================================

/// Why one poll cycle produced no events.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Malformed feed document: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Feed contained no placemarks")]
    EmptyFeed,
}

/// Why the worker stopped without being asked to.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Delivery worker terminated: {0}")]
    Terminated(#[source] CycleError),

    #[error("Delivery worker gave up after {attempts} consecutive failed cycles: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: CycleError,
    },

    #[error("Outbound queue closed; the transport is no longer draining it")]
    QueueClosed,
}

// ============================================================================
// Policy & Report
// ============================================================================

/// Timing and failure handling for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Gap between successive pushes.
    pub pacing: Duration,
    /// Fixed poll timer. `None` polls again once the previous batch has drained.
    pub poll_interval: Option<Duration>,
    pub on_failure: FailurePolicy,
    pub max_consecutive_failures: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Stop after this many successful cycles have been queued.
    pub max_cycles: Option<u64>,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl DeliveryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        let d = &settings.delivery;
        let poll = settings.feed.poll_interval_secs;
        Self {
            pacing: Duration::from_secs(PACING_DELAY_SECS),
            poll_interval: (poll > 0).then(|| Duration::from_secs(poll)),
            on_failure: d.on_failure,
            max_consecutive_failures: d.max_consecutive_failures,
            backoff_initial: Duration::from_secs(d.backoff_initial_secs),
            backoff_max: Duration::from_secs(d.backoff_max_secs),
            max_cycles: d.max_cycles,
        }
    }

    /// Delay before retrying after the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.backoff_initial
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

/// How a worker that returned `Ok` came to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    CycleLimit,
}

/// Counters returned when the worker stops cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Successful poll cycles.
    pub cycles: u64,
    pub events_queued: u64,
    /// Unsent events displaced by a fresher snapshot.
    pub superseded: u64,
    pub failed_cycles: u64,
    pub stop_reason: StopReason,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: u64,
    events_queued: u64,
    superseded: u64,
    failed_cycles: u64,
}

impl Counters {
    fn finish(&self, stop_reason: StopReason) -> WorkerReport {
        WorkerReport {
            cycles: self.cycles,
            events_queued: self.events_queued,
            superseded: self.superseded,
            failed_cycles: self.failed_cycles,
            stop_reason,
        }
    }
}

enum Wake {
    Cancelled,
    Emit,
    PollDue,
    Polled(Result<Vec<CotMessage>, CycleError>),
}

/// A poll cycle running alongside emission.
type CycleFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<CotMessage>, CycleError>> + Send + 'a>>;

async fn finish_cycle(
    cycle: &mut Option<CycleFuture<'_>>,
) -> Result<Vec<CotMessage>, CycleError> {
    match cycle {
        Some(cycle) => cycle.as_mut().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Rotation
// ============================================================================

/// Events still owed in the current pass over the feed's devices.
///
/// Every uid of the latest snapshot is pushed once per rotation. A snapshot
/// arriving mid-rotation refreshes the unsent events; devices already pushed
/// in this rotation wait for the next one.
#[derive(Debug, Default)]
struct Rotation {
    pending: VecDeque<CotMessage>,
    sent: HashSet<String>,
}

impl Rotation {
    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn take_next(&mut self) -> Option<CotMessage> {
        let message = self.pending.pop_front()?;
        if self.pending.is_empty() {
            self.sent.clear();
        } else {
            self.sent.insert(message.uid.clone());
        }
        Some(message)
    }

    /// Swap in a fresh snapshot; returns how many unsent events it displaced.
    fn refresh(&mut self, batch: Vec<CotMessage>) -> usize {
        let displaced = self.pending.len();
        let sent = &self.sent;
        self.pending = batch
            .into_iter()
            .filter(|message| !sent.contains(&message.uid))
            .collect();
        if self.pending.is_empty() {
            self.sent.clear();
        }
        displaced
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct DeliveryWorker<S: FeedSource> {
    source: S,
    template: EventTemplate,
    policy: DeliveryPolicy,
    queue: OutboundQueue,
    clock: Clock,
    state: watch::Sender<WorkerState>,
    cancel: CancellationToken,
}

impl<S: FeedSource> DeliveryWorker<S> {
    /// Fails fast when the template cannot produce events.
    pub fn new(
        source: S,
        template: EventTemplate,
        policy: DeliveryPolicy,
        queue: OutboundQueue,
        cancel: CancellationToken,
    ) -> Result<Self, BuildError> {
        template.validate()?;
        let (state, _) = watch::channel(WorkerState::Idle);
        Ok(Self {
            source,
            template,
            policy,
            queue,
            clock: Arc::new(Utc::now),
            state,
            cancel,
        })
    }

    /// Replace the wall clock used for event timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Worker state");
        }
    }

    /// Run until cancelled, the cycle limit is met, or a failure stops the loop.
    pub async fn run(self) -> Result<WorkerReport, WorkerError> {
        let result = self.drive().await;
        self.set_state(WorkerState::Stopped);
        match &result {
            Ok(report) => info!(
                reason = ?report.stop_reason,
                cycles = report.cycles,
                events_queued = report.events_queued,
                superseded = report.superseded,
                failed_cycles = report.failed_cycles,
                "Delivery worker stopped"
            ),
            Err(e) => error!(error = %e, "Delivery worker stopped"),
        }
        result
    }

    async fn drive(&self) -> Result<WorkerReport, WorkerError> {
        let cancel = self.cancel.clone();
        let mut counters = Counters::default();
        let mut rotation = Rotation::default();
        let mut failures = 0u32;
        let mut next_poll = Instant::now();
        let mut next_emit = Instant::now();
        let mut in_flight: Option<CycleFuture<'_>> = None;
        let mut poll_started = Instant::now();

        info!(
            source = self.source.source_name(),
            poll_interval_secs = self.policy.poll_interval.map(|d| d.as_secs()),
            pacing_secs = self.policy.pacing.as_secs(),
            on_failure = ?self.policy.on_failure,
            "Delivery worker started"
        );

        loop {
            let limit_reached = self
                .policy
                .max_cycles
                .is_some_and(|max| counters.cycles >= max);
            if limit_reached && rotation.is_empty() && in_flight.is_none() {
                return Ok(counters.finish(StopReason::CycleLimit));
            }
            let may_poll = in_flight.is_none()
                && !limit_reached
                && (self.policy.poll_interval.is_some() || rotation.is_empty());

            if in_flight.is_none() {
                self.set_state(if rotation.is_empty() {
                    WorkerState::Idle
                } else {
                    WorkerState::Draining
                });
            }

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = sleep_until(next_emit), if !rotation.is_empty() => Wake::Emit,
                outcome = finish_cycle(&mut in_flight), if in_flight.is_some() => Wake::Polled(outcome),
                _ = sleep_until(next_poll), if may_poll => Wake::PollDue,
            };

            match wake {
                Wake::Cancelled => return Ok(counters.finish(StopReason::Cancelled)),

                Wake::Emit => {
                    let Some(message) = rotation.take_next() else {
                        continue;
                    };
                    let pushed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = self.queue.push(message.payload) => Some(result),
                    };
                    match pushed {
                        None => return Ok(counters.finish(StopReason::Cancelled)),
                        Some(Err(_)) => return Err(WorkerError::QueueClosed),
                        Some(Ok(())) => {}
                    }
                    counters.events_queued += 1;
                    info!(uid = %message.uid, remaining = rotation.len(), "Queued CoT event");

                    next_emit = Instant::now() + self.policy.pacing;
                    if rotation.is_empty() && self.policy.poll_interval.is_none() {
                        next_poll = next_emit;
                    }
                }

                Wake::PollDue => {
                    poll_started = Instant::now();
                    let cycle: CycleFuture<'_> = Box::pin(self.poll_cycle());
                    in_flight = Some(cycle);
                }

                Wake::Polled(outcome) => {
                    in_flight = None;
                    let idle_wait = self.policy.poll_interval.unwrap_or(self.policy.pacing);
                    match outcome {
                        Ok(batch) => {
                            failures = 0;
                            counters.cycles += 1;
                            info!(
                                cycle = counters.cycles,
                                events = batch.len(),
                                "Poll cycle complete"
                            );
                            let empty = batch.is_empty();
                            let replaced = rotation.refresh(batch);
                            if replaced > 0 {
                                debug!(replaced, "Fresh snapshot replaces unsent events");
                                counters.superseded += replaced as u64;
                            }
                            next_poll = match self.policy.poll_interval {
                                Some(interval) => poll_started + interval,
                                None if empty => Instant::now() + idle_wait,
                                // set when the rotation drains
                                None => next_poll,
                            };
                        }

                        Err(CycleError::EmptyFeed)
                            if self.policy.on_failure == FailurePolicy::Retry =>
                        {
                            warn!("Feed returned no placemarks; skipping cycle");
                            next_poll = match self.policy.poll_interval {
                                Some(interval) => poll_started + interval,
                                None => Instant::now() + idle_wait,
                            };
                        }

                        Err(e) => match self.policy.on_failure {
                            FailurePolicy::Terminate => return Err(WorkerError::Terminated(e)),
                            FailurePolicy::Retry => {
                                failures += 1;
                                counters.failed_cycles += 1;
                                if failures >= self.policy.max_consecutive_failures {
                                    return Err(WorkerError::RetriesExhausted {
                                        attempts: failures,
                                        last: e,
                                    });
                                }
                                let delay = self.policy.backoff(failures);
                                warn!(
                                    error = %e,
                                    attempt = failures,
                                    max = self.policy.max_consecutive_failures,
                                    retry_in_secs = delay.as_secs(),
                                    "Poll cycle failed"
                                );
                                next_poll = Instant::now() + delay;
                            }
                        },
                    }
                }
            }
        }
    }

    /// Fetching → Extracting → Building for one snapshot of the feed.
    async fn poll_cycle(&self) -> Result<Vec<CotMessage>, CycleError> {
        self.set_state(WorkerState::Fetching);
        let document = self.source.fetch().await?;

        self.set_state(WorkerState::Extracting);
        let records = extract_placemarks(&document)?;
        if records.is_empty() {
            return Err(CycleError::EmptyFeed);
        }

        self.set_state(WorkerState::Building);
        let clock = Arc::clone(&self.clock);
        Ok(build_events(&records, &self.template, move || clock())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::outbound_queue;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn kml(names: &[&str]) -> Vec<u8> {
        let placemarks: String = names
            .iter()
            .map(|n| {
                format!(
                    "<Placemark><name>{n}</name><Point><coordinates>20.0,10.0,0</coordinates></Point></Placemark>"
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><kml xmlns="http://www.opengis.net/kml/2.2"><Document><Folder>{placemarks}</Folder></Document></kml>"#
        )
        .into_bytes()
    }

    /// Replays scripted responses; repeats the last one when exhausted.
    struct Scripted {
        responses: Mutex<VecDeque<Result<Vec<u8>, u16>>>,
        last: Mutex<Option<Result<Vec<u8>, u16>>>,
        fetches: Arc<Mutex<Vec<Duration>>>,
        origin: Instant,
        delay: Duration,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Vec<u8>, u16>>) -> (Self, Arc<Mutex<Vec<Duration>>>) {
            let fetches = Arc::new(Mutex::new(Vec::new()));
            let source = Self {
                responses: Mutex::new(responses.into()),
                last: Mutex::new(None),
                fetches: Arc::clone(&fetches),
                origin: Instant::now(),
                delay: Duration::ZERO,
            };
            (source, fetches)
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl FeedSource for Scripted {
        async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
            self.fetches.lock().unwrap().push(self.origin.elapsed());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.responses.lock().unwrap().pop_front();
            let response = match next {
                Some(r) => {
                    *self.last.lock().unwrap() = Some(r.clone());
                    r
                }
                None => self.last.lock().unwrap().clone().unwrap_or(Err(500)),
            };
            response.map_err(|status| FetchError::HttpStatus {
                url: "scripted".to_string(),
                status,
            })
        }

        fn source_name(&self) -> &str {
            "scripted"
        }
    }

    fn template() -> EventTemplate {
        EventTemplate {
            event_type: "a-f-G-U-C".to_string(),
            stale_secs: 300,
            uid_prefix: "Garmin".to_string(),
        }
    }

    fn policy() -> DeliveryPolicy {
        DeliveryPolicy {
            pacing: Duration::from_secs(120),
            poll_interval: None,
            on_failure: FailurePolicy::Retry,
            max_consecutive_failures: 3,
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            max_cycles: None,
        }
    }

    fn fixed_clock() -> Clock {
        Arc::new(|| Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    /// Drains the queue, recording the offset of every receipt.
    fn collect(
        mut rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    ) -> tokio::task::JoinHandle<Vec<(Duration, String)>> {
        let origin = Instant::now();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(payload) = rx.recv().await {
                let doc = String::from_utf8(payload).unwrap();
                let uid = doc
                    .split("uid=\"")
                    .nth(1)
                    .and_then(|rest| rest.split('"').next())
                    .unwrap_or_default()
                    .to_string();
                seen.push((origin.elapsed(), uid));
            }
            seen
        })
    }

    fn secs(pushes: &[(Duration, String)]) -> Vec<u64> {
        pushes.iter().map(|(at, _)| at.as_secs()).collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(5));
        assert_eq!(p.backoff(2), Duration::from_secs(10));
        assert_eq!(p.backoff(4), Duration::from_secs(40));
        assert_eq!(p.backoff(7), Duration::from_secs(300));
        assert_eq!(p.backoff(200), Duration::from_secs(300));
    }

    #[test]
    fn policy_from_default_settings() {
        let p = DeliveryPolicy::default();
        assert_eq!(p.pacing, Duration::from_secs(120));
        assert_eq!(p.poll_interval, Some(Duration::from_secs(300)));
        assert_eq!(p.on_failure, FailurePolicy::Retry);
        assert_eq!(p.max_cycles, None);
    }

    #[test]
    fn empty_event_type_is_rejected_up_front() {
        let (source, _) = Scripted::new(vec![]);
        let (queue, _rx) = outbound_queue(4);
        let mut t = template();
        t.event_type.clear();
        let result = DeliveryWorker::new(source, t, policy(), queue, CancellationToken::new());
        assert!(matches!(result, Err(BuildError::MissingEventType)));
    }

    #[tokio::test(start_paused = true)]
    async fn coupled_cadence_polls_after_batch_drains() {
        let (source, fetches) = Scripted::new(vec![Ok(kml(&["Alpha", "Beta"]))]);
        let (queue, rx) = outbound_queue(8);
        let consumer = collect(rx);

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy {
                max_cycles: Some(2),
                ..policy()
            },
            queue,
            CancellationToken::new(),
        )
        .unwrap()
        .with_clock(fixed_clock());

        let report = worker.run().await.unwrap();
        let pushes = consumer.await.unwrap();

        assert_eq!(report.stop_reason, StopReason::CycleLimit);
        assert_eq!(report.cycles, 2);
        assert_eq!(report.events_queued, 4);
        assert_eq!(secs(&pushes), vec![0, 120, 240, 360]);
        let fetch_secs: Vec<u64> = fetches.lock().unwrap().iter().map(|d| d.as_secs()).collect();
        assert_eq!(fetch_secs, vec![0, 240]);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_snapshot_replaces_unsent_events() {
        let (source, fetches) = Scripted::new(vec![
            Ok(kml(&["A1", "A2", "A3"])),
            Ok(kml(&["B1", "B2"])),
        ]);
        let (queue, rx) = outbound_queue(8);
        let consumer = collect(rx);

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy {
                poll_interval: Some(Duration::from_secs(150)),
                max_cycles: Some(2),
                ..policy()
            },
            queue,
            CancellationToken::new(),
        )
        .unwrap();

        let report = worker.run().await.unwrap();
        let pushes = consumer.await.unwrap();

        let uids: Vec<&str> = pushes.iter().map(|(_, uid)| uid.as_str()).collect();
        assert_eq!(uids, vec!["Garmin-A1", "Garmin-A2", "Garmin-B1", "Garmin-B2"]);
        assert_eq!(secs(&pushes), vec![0, 120, 240, 360]);
        assert_eq!(report.superseded, 1);
        assert_eq!(fetches.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_device_is_sent_once_per_rotation() {
        let devices = ["P1", "P2", "P3", "P4", "P5"];
        let (source, fetches) = Scripted::new(vec![Ok(kml(&devices))]);
        let (queue, rx) = outbound_queue(8);
        let consumer = collect(rx);
        let cancel = CancellationToken::new();

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy::default(),
            queue,
            cancel.clone(),
        )
        .unwrap();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_secs(2950)).await;
        cancel.cancel();

        let report = handle.await.unwrap().unwrap();
        let pushes = consumer.await.unwrap();

        let uids: Vec<&str> = pushes.iter().map(|(_, uid)| uid.as_str()).collect();
        let rotation: Vec<String> = devices.iter().map(|d| format!("Garmin-{d}")).collect();
        let expected: Vec<&str> = rotation
            .iter()
            .map(String::as_str)
            .cycle()
            .take(25)
            .collect();
        assert_eq!(uids, expected);
        assert_eq!(secs(&pushes), (0..25).map(|i| i * 120).collect::<Vec<u64>>());

        let fetch_secs: Vec<u64> = fetches.lock().unwrap().iter().map(|d| d.as_secs()).collect();
        assert_eq!(fetch_secs, (0..10).map(|i| i * 300).collect::<Vec<u64>>());
        assert_eq!(report.cycles, 10);
        assert_eq!(report.superseded, 10, "P4 and P5 refreshed once per rotation");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_does_not_hold_back_due_events() {
        let (source, fetches) = Scripted::new(vec![Ok(kml(&["A", "B", "C"]))]);
        let source = source.with_delay(Duration::from_secs(100));
        let (queue, rx) = outbound_queue(8);
        let consumer = collect(rx);

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy {
                poll_interval: Some(Duration::from_secs(150)),
                max_cycles: Some(2),
                ..policy()
            },
            queue,
            CancellationToken::new(),
        )
        .unwrap();

        let report = worker.run().await.unwrap();
        let pushes = consumer.await.unwrap();

        // second fetch runs from 150 to 250; B is due at 220
        let uids: Vec<&str> = pushes.iter().map(|(_, uid)| uid.as_str()).collect();
        assert_eq!(uids, vec!["Garmin-A", "Garmin-B", "Garmin-C"]);
        assert_eq!(secs(&pushes), vec![100, 220, 340]);
        let fetch_secs: Vec<u64> = fetches.lock().unwrap().iter().map(|d| d.as_secs()).collect();
        assert_eq!(fetch_secs, vec![0, 150]);
        assert_eq!(report.cycles, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_policy_stops_on_empty_feed() {
        let (source, _) = Scripted::new(vec![Ok(kml(&[]))]);
        let (queue, _rx) = outbound_queue(8);

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy {
                on_failure: FailurePolicy::Terminate,
                ..policy()
            },
            queue,
            CancellationToken::new(),
        )
        .unwrap();
        let state = worker.subscribe();

        let result = worker.run().await;
        assert!(matches!(
            result,
            Err(WorkerError::Terminated(CycleError::EmptyFeed))
        ));
        assert_eq!(*state.borrow(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_policy_stops_on_fetch_failure() {
        let (source, fetches) = Scripted::new(vec![Err(503)]);
        let (queue, _rx) = outbound_queue(8);

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy {
                on_failure: FailurePolicy::Terminate,
                ..policy()
            },
            queue,
            CancellationToken::new(),
        )
        .unwrap();

        match worker.run().await {
            Err(WorkerError::Terminated(CycleError::Fetch(e))) => assert_eq!(e.status(), Some(503)),
            other => panic!("expected fetch termination, got {other:?}"),
        }
        assert_eq!(fetches.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_backs_off_then_recovers() {
        let (source, fetches) = Scripted::new(vec![Err(503), Err(502), Ok(kml(&["Alpha"]))]);
        let (queue, rx) = outbound_queue(8);
        let consumer = collect(rx);

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy {
                max_cycles: Some(1),
                ..policy()
            },
            queue,
            CancellationToken::new(),
        )
        .unwrap();

        let report = worker.run().await.unwrap();
        let pushes = consumer.await.unwrap();

        let fetch_secs: Vec<u64> = fetches.lock().unwrap().iter().map(|d| d.as_secs()).collect();
        assert_eq!(fetch_secs, vec![0, 5, 15]);
        assert_eq!(secs(&pushes), vec![15]);
        assert_eq!(report.failed_cycles, 2);
        assert_eq!(report.cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_gives_up_after_limit() {
        let (source, fetches) = Scripted::new(vec![Err(500)]);
        let (queue, _rx) = outbound_queue(8);

        let worker = DeliveryWorker::new(source, template(), policy(), queue, CancellationToken::new())
            .unwrap();

        match worker.run().await {
            Err(WorkerError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected retries exhausted, got {other:?}"),
        }
        assert_eq!(fetches.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_feed_is_skipped_under_retry() {
        let (source, fetches) = Scripted::new(vec![Ok(kml(&[])), Ok(kml(&["Alpha"]))]);
        let (queue, rx) = outbound_queue(8);
        let consumer = collect(rx);

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy {
                max_cycles: Some(1),
                ..policy()
            },
            queue,
            CancellationToken::new(),
        )
        .unwrap();

        let report = worker.run().await.unwrap();
        let pushes = consumer.await.unwrap();

        assert_eq!(report.failed_cycles, 0);
        assert_eq!(fetches.lock().unwrap().len(), 2);
        assert_eq!(secs(&pushes), vec![120]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_pacing_stops_cleanly() {
        let (source, _) = Scripted::new(vec![Ok(kml(&["Alpha", "Beta"]))]);
        let (queue, rx) = outbound_queue(8);
        let consumer = collect(rx);
        let cancel = CancellationToken::new();

        let worker =
            DeliveryWorker::new(source, template(), policy(), queue, cancel.clone()).unwrap();
        let state = worker.subscribe();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(report.events_queued, 1);
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert_eq!(consumer.await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_is_fatal() {
        let (source, _) = Scripted::new(vec![Ok(kml(&["Alpha"]))]);
        let (queue, rx) = outbound_queue(8);
        drop(rx);

        let worker = DeliveryWorker::new(source, template(), policy(), queue, CancellationToken::new())
            .unwrap();
        assert!(matches!(worker.run().await, Err(WorkerError::QueueClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_document_counts_as_failure() {
        let (source, _) = Scripted::new(vec![Ok(b"<kml><Document>".to_vec())]);
        let (queue, _rx) = outbound_queue(8);

        let worker = DeliveryWorker::new(
            source,
            template(),
            DeliveryPolicy {
                on_failure: FailurePolicy::Terminate,
                ..policy()
            },
            queue,
            CancellationToken::new(),
        )
        .unwrap();
        assert!(matches!(
            worker.run().await,
            Err(WorkerError::Terminated(CycleError::Parse(_)))
        ));
    }
}
