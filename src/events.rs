//! In-process event bus: a typed event union over a broadcast channel.
//!
//! Every state change in the engine is published here as an [`Event`] with a
//! monotonic per-bus `sequence`. Subscribers are pull-based streams, so a
//! slow or misbehaving consumer can never stall run execution; one that
//! falls more than the bus capacity behind loses oldest events and receives
//! a `worker:error` event with `subscriber_backpressure` context in-band.
//!
//! The bus is process-local by design. Remote consumers subscribe over SSE.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::types::{LogLevel, Progress};

// ═══════════════════════════════════════════════════════════════════════════
// Event union
// ═══════════════════════════════════════════════════════════════════════════

/// Everything that can happen to a run, tagged for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    /// A run row was inserted; emitted before any worker observes it.
    #[serde(rename = "run:trigger")]
    RunTrigger { payload: Value },

    /// A worker claimed the run and the attempt began.
    #[serde(rename = "run:start")]
    RunStart,

    /// Job code reported progress.
    #[serde(rename = "run:progress")]
    RunProgress { progress: Progress },

    /// The run completed; `durationMs` covers the final attempt.
    #[serde(rename = "run:complete", rename_all = "camelCase")]
    RunComplete { output: Value, duration_ms: i64 },

    /// The run failed, optionally at a named step.
    #[serde(rename = "run:fail", rename_all = "camelCase")]
    RunFail {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed_step_name: Option<String>,
    },

    /// The run was cancelled, either directly while pending or
    /// cooperatively while running.
    #[serde(rename = "run:cancel")]
    RunCancel,

    /// An operator reset a failed or cancelled run to pending.
    #[serde(rename = "run:retry")]
    RunRetry,

    /// A step's user function is about to execute (never emitted on replay).
    #[serde(rename = "step:start")]
    StepStart { step: String },

    /// A step completed and its output was memoized.
    #[serde(rename = "step:complete", rename_all = "camelCase")]
    StepComplete {
        step: String,
        output: Value,
        duration_ms: i64,
    },

    /// A step's user function failed.
    #[serde(rename = "step:fail")]
    StepFail { step: String, error: String },

    /// Job code wrote a structured log line.
    #[serde(rename = "log:write")]
    LogWrite {
        level: LogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Non-fatal worker fault (heartbeat write failed, subscriber lagged,
    /// claim retries exhausted).
    #[serde(rename = "worker:error")]
    WorkerError { context: String, error: String },
}

impl EventKind {
    /// Whether this event ends a run's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::RunComplete { .. } | EventKind::RunFail { .. } | EventKind::RunCancel
        )
    }
}

/// A published event: common envelope plus the tagged kind.
///
/// `run_id` and `job_name` are present on every variant except
/// `worker:error`, which may describe a fault not tied to any run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Monotonic per-bus counter; process-local.
    pub sequence: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: EventKind,
}

// ═══════════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════════

/// Subscription filter applied at the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event published on this bus.
    All,
    /// Events for a single run.
    Run(String),
    /// Events for every run of one job.
    Job(String),
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Run(id) => event.run_id.as_deref() == Some(id.as_str()),
            EventFilter::Job(name) => event.job_name.as_deref() == Some(name.as_str()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Event bus
// ═══════════════════════════════════════════════════════════════════════════

/// Process-wide pub/sub handle. Cheap to clone; all clones share one channel
/// and one sequence counter.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event for a run. Delivery is best-effort: with no
    /// subscribers the event is dropped silently.
    pub fn emit(&self, run_id: &str, job_name: &str, kind: EventKind) {
        self.publish(Some(run_id.to_string()), Some(job_name.to_string()), kind);
    }

    /// Publish a `worker:error` event, optionally tied to a run.
    pub fn worker_error(&self, run_id: Option<&str>, context: &str, error: impl ToString) {
        tracing::warn!(context, run_id, "worker error: {}", error.to_string());
        self.publish(
            run_id.map(str::to_string),
            None,
            EventKind::WorkerError {
                context: context.to_string(),
                error: error.to_string(),
            },
        );
    }

    fn publish(&self, run_id: Option<String>, job_name: Option<String>, kind: EventKind) {
        let event = Event {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            run_id,
            job_name,
            timestamp: Utc::now(),
            kind,
        };
        let _ = self.tx.send(event);
    }

    /// Open a filtered subscription. The stream yields events published
    /// after this call, in `sequence` order, until dropped.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        EventStream {
            rx: BroadcastStream::new(self.tx.subscribe()),
            filter,
            bus: self.clone(),
            until_terminal: false,
            done: false,
        }
    }

    /// Open a per-run subscription that ends after yielding the run's
    /// terminal event (`run:complete`, `run:fail`, or `run:cancel`).
    pub fn subscribe_run(&self, run_id: &str) -> EventStream {
        EventStream {
            rx: BroadcastStream::new(self.tx.subscribe()),
            filter: EventFilter::Run(run_id.to_string()),
            bus: self.clone(),
            until_terminal: true,
            done: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Event stream
// ═══════════════════════════════════════════════════════════════════════════

/// A filtered, ordered view of the bus.
///
/// When the underlying channel overflows for this subscriber the stream
/// yields a `worker:error` event with `subscriber_backpressure` context (and
/// republishes it on the bus) instead of failing.
pub struct EventStream {
    rx: BroadcastStream<Event>,
    filter: EventFilter,
    bus: EventBus,
    until_terminal: bool,
    done: bool,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            match Pin::new(&mut self.rx).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if !self.filter.matches(&event) {
                        continue;
                    }
                    if self.until_terminal && event.kind.is_terminal() {
                        self.done = true;
                    }
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    let run_id = match &self.filter {
                        EventFilter::Run(id) => Some(id.clone()),
                        _ => None,
                    };
                    self.bus.worker_error(
                        run_id.as_deref(),
                        "subscriber_backpressure",
                        format!("subscriber dropped {skipped} events"),
                    );
                    // Surface the gap to this subscriber directly; the
                    // republished copy reaches everyone else.
                    return Poll::Ready(Some(Event {
                        sequence: self.bus.sequence.load(Ordering::SeqCst),
                        run_id,
                        job_name: None,
                        timestamp: Utc::now(),
                        kind: EventKind::WorkerError {
                            context: "subscriber_backpressure".to_string(),
                            error: format!("subscriber dropped {skipped} events"),
                        },
                    }));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
