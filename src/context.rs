//! Per-attempt step context: the API surface presented to job code.
//!
//! A context is built by the executor for exactly one attempt. It carries
//! the run's identity, the memoized step cache loaded from storage, and the
//! cooperative cancel flag. Job code interacts with the engine only through
//! this type: `run` for checkpointed work, `progress` for status, and the
//! `log_*` methods for structured logging.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::RunError;
use crate::events::{EventBus, EventKind};
use crate::storage::{NewStep, Storage, StorageError};
use crate::types::{LogEntry, LogLevel, Progress, Step, StepStatus};

/// Handle job code uses to run memoized steps and report progress.
///
/// Cheap to clone; clones share the attempt's bookkeeping.
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    run_id: String,
    job_name: String,
    storage: Arc<dyn Storage>,
    bus: EventBus,
    cancelled: Arc<AtomicBool>,
    book: Mutex<StepBook>,
}

/// Attempt-local bookkeeping. `cache` mirrors the steps table (including
/// failed rows, which are invisible to memoization but occupy an index);
/// `seen` tracks names used during this attempt to catch duplicates.
struct StepBook {
    cache: HashMap<String, Step>,
    seen: HashSet<String>,
    current_step: Option<String>,
}

impl StepContext {
    pub(crate) fn new(
        run_id: String,
        job_name: String,
        prior_steps: Vec<Step>,
        storage: Arc<dyn Storage>,
        bus: EventBus,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let cache = prior_steps
            .into_iter()
            .map(|step| (step.name.clone(), step))
            .collect();

        Self {
            inner: Arc::new(ContextInner {
                run_id,
                job_name,
                storage,
                bus,
                cancelled,
                book: Mutex::new(StepBook {
                    cache,
                    seen: HashSet::new(),
                    current_step: None,
                }),
            }),
        }
    }

    /// Id of the run this attempt belongs to.
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Name of the job being executed.
    pub fn job_name(&self) -> &str {
        &self.inner.job_name
    }

    /// Execute a named, memoized step.
    ///
    /// If a completed row exists for `name`, the stored output is returned
    /// without invoking `f` and without emitting events. Otherwise `f` runs,
    /// its output is persisted, and `step:start`/`step:complete` (or
    /// `step:fail`) events bracket the execution. A failure aborts the run.
    ///
    /// Once cancellation has been observed, every subsequent call returns
    /// the cancellation sentinel before touching `f`.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T, RunError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Err(RunError::Cancelled);
        }

        let index = {
            let mut book = self.inner.book.lock().unwrap();
            if !book.seen.insert(name.to_string()) {
                return Err(RunError::DuplicateStepName(name.to_string()));
            }
            if let Some(step) = book.cache.get(name) {
                if step.status == StepStatus::Completed {
                    // Replay path: no events, no user code.
                    let output = step.output.clone().unwrap_or(Value::Null);
                    return serde_json::from_value(output).map_err(|err| RunError::StepFailed {
                        step: name.to_string(),
                        message: format!("memoized output no longer deserializes: {err}"),
                    });
                }
            }
            book.cache.len() as i64
        };

        self.inner.bus.emit(
            &self.inner.run_id,
            &self.inner.job_name,
            EventKind::StepStart { step: name.to_string() },
        );
        self.set_current_step(Some(name));

        let started_at = Utc::now();
        let started = Instant::now();
        let outcome = f().await;
        self.set_current_step(None);

        match outcome {
            Ok(value) => {
                let output = serde_json::to_value(&value).map_err(|err| RunError::StepFailed {
                    step: name.to_string(),
                    message: format!("step output is not serializable: {err}"),
                })?;

                let step = self
                    .record_step(NewStep {
                        name: name.to_string(),
                        index,
                        status: StepStatus::Completed,
                        output: Some(output.clone()),
                        error: None,
                        started_at,
                    })
                    .await?;

                self.inner.book.lock().unwrap().cache.insert(name.to_string(), step);
                self.inner.bus.emit(
                    &self.inner.run_id,
                    &self.inner.job_name,
                    EventKind::StepComplete {
                        step: name.to_string(),
                        output,
                        duration_ms: started.elapsed().as_millis() as i64,
                    },
                );
                Ok(value)
            }
            Err(err) => {
                let message = format!("{err:#}");
                let step = self
                    .record_step(NewStep {
                        name: name.to_string(),
                        index,
                        status: StepStatus::Failed,
                        output: None,
                        error: Some(message.clone()),
                        started_at,
                    })
                    .await?;

                self.inner.book.lock().unwrap().cache.insert(name.to_string(), step);
                self.inner.bus.emit(
                    &self.inner.run_id,
                    &self.inner.job_name,
                    EventKind::StepFail {
                        step: name.to_string(),
                        error: message.clone(),
                    },
                );
                Err(RunError::StepFailed {
                    step: name.to_string(),
                    message,
                })
            }
        }
    }

    /// Report run progress. The write is best-effort: a storage fault is
    /// logged and swallowed, and never fails the enclosing step.
    pub async fn progress(&self, current: u64, total: Option<u64>, message: Option<&str>) {
        let progress = Progress {
            current,
            total,
            message: message.map(str::to_string),
        };

        if let Err(err) = self
            .inner
            .storage
            .update_progress(&self.inner.run_id, &progress)
            .await
        {
            tracing::warn!(run_id = %self.inner.run_id, "progress write failed: {err}");
        }
        self.inner.bus.emit(
            &self.inner.run_id,
            &self.inner.job_name,
            EventKind::RunProgress { progress },
        );
    }

    pub async fn log_info(&self, message: &str, data: Option<Value>) {
        self.log(LogLevel::Info, message, data).await;
    }

    pub async fn log_warn(&self, message: &str, data: Option<Value>) {
        self.log(LogLevel::Warn, message, data).await;
    }

    pub async fn log_error(&self, message: &str, data: Option<Value>) {
        self.log(LogLevel::Error, message, data).await;
    }

    /// Write a structured log row and publish `log:write`. Log writes never
    /// fail the enclosing step.
    pub async fn log(&self, level: LogLevel, message: &str, data: Option<Value>) {
        let step_name = self.inner.book.lock().unwrap().current_step.clone();
        let entry = LogEntry {
            id: Uuid::new_v4().to_string(),
            run_id: self.inner.run_id.clone(),
            step_name: step_name.clone(),
            level,
            message: message.to_string(),
            data: data.clone(),
            timestamp: Utc::now(),
        };

        if let Err(err) = self.inner.storage.write_log(&entry).await {
            tracing::warn!(run_id = %self.inner.run_id, "log write failed: {err}");
        }
        self.inner.bus.emit(
            &self.inner.run_id,
            &self.inner.job_name,
            EventKind::LogWrite {
                level,
                message: message.to_string(),
                step: step_name,
                data,
            },
        );
    }

    async fn record_step(&self, step: NewStep) -> Result<Step, RunError> {
        match self.inner.storage.upsert_step(&self.inner.run_id, step).await {
            Ok(step) => Ok(step),
            Err(StorageError::DuplicateStepName { name, .. }) => {
                Err(RunError::DuplicateStepName(name))
            }
            Err(err) => Err(RunError::Storage(err)),
        }
    }

    fn set_current_step(&self, name: Option<&str>) {
        self.inner.book.lock().unwrap().current_step = name.map(str::to_string);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::storage::{NewRun, SqliteStore};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    struct Harness {
        storage: Arc<dyn Storage>,
        bus: EventBus,
        run_id: String,
        cancelled: Arc<AtomicBool>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).await.unwrap();
        store.migrate().await.unwrap();
        let storage: Arc<dyn Storage> = Arc::new(store);

        let (run, _) = storage
            .create_run(NewRun {
                job_name: "sum".to_string(),
                payload: json!({}),
                idempotency_key: None,
                concurrency_key: None,
            })
            .await
            .unwrap();
        storage.claim_next_pending_run("w1").await.unwrap();

        Harness {
            storage,
            bus: EventBus::new(64),
            run_id: run.id,
            cancelled: Arc::new(AtomicBool::new(false)),
            _dir: dir,
        }
    }

    fn context(h: &Harness) -> StepContext {
        StepContext::new(
            h.run_id.clone(),
            "sum".to_string(),
            Vec::new(),
            h.storage.clone(),
            h.bus.clone(),
            h.cancelled.clone(),
        )
    }

    fn context_with_steps(h: &Harness, steps: Vec<Step>) -> StepContext {
        StepContext::new(
            h.run_id.clone(),
            "sum".to_string(),
            steps,
            h.storage.clone(),
            h.bus.clone(),
            h.cancelled.clone(),
        )
    }

    #[tokio::test]
    async fn steps_execute_once_and_memoize() {
        let h = harness().await;
        let ctx = context(&h);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let first: i64 = ctx
            .run("a", || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(first, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // New attempt with the stored cache: the closure must not run.
        let prior = h.storage.list_steps(&h.run_id).await.unwrap();
        let replay_ctx = context_with_steps(&h, prior);
        let c = calls.clone();
        let second: i64 = replay_ctx
            .run("a", || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(99)
            })
            .await
            .unwrap();
        assert_eq!(second, 7, "replay returns the memoized output");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_emits_no_events() {
        let h = harness().await;
        let ctx = context(&h);
        let _: i64 = ctx.run("a", || async { Ok(1) }).await.unwrap();

        let prior = h.storage.list_steps(&h.run_id).await.unwrap();
        let replay_ctx = context_with_steps(&h, prior);
        let mut stream = h.bus.subscribe(EventFilter::All);

        let _: i64 = replay_ctx.run("a", || async { Ok(1) }).await.unwrap();
        let _: i64 = replay_ctx.run("b", || async { Ok(2) }).await.unwrap();

        // First event after replay is step b starting, not anything for a.
        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, EventKind::StepStart { step: "b".into() });
    }

    #[tokio::test]
    async fn duplicate_step_name_within_attempt_is_rejected() {
        let h = harness().await;
        let ctx = context(&h);

        let _: i64 = ctx.run("a", || async { Ok(1) }).await.unwrap();
        let err = ctx.run::<i64, _, _>("a", || async { Ok(2) }).await.unwrap_err();
        assert!(matches!(err, RunError::DuplicateStepName(name) if name == "a"));
    }

    #[tokio::test]
    async fn failed_step_records_row_and_aborts() {
        let h = harness().await;
        let ctx = context(&h);

        let err = ctx
            .run::<i64, _, _>("a", || async { Err(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::StepFailed { ref step, .. } if step == "a"));

        let step = h.storage.get_step(&h.run_id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_user_code() {
        let h = harness().await;
        let ctx = context(&h);
        h.cancelled.store(true, Ordering::SeqCst);

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = ctx
            .run::<i64, _, _>("a", || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(h.storage.get_step(&h.run_id, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_and_logs_persist_and_publish() {
        let h = harness().await;
        let ctx = context(&h);
        let mut stream = h.bus.subscribe(EventFilter::All);

        ctx.progress(3, Some(10), Some("importing")).await;
        ctx.log_info("row imported", Some(json!({"row": 3}))).await;

        let run = h.storage.get_run(&h.run_id).await.unwrap();
        assert_eq!(
            run.progress,
            Some(Progress {
                current: 3,
                total: Some(10),
                message: Some("importing".to_string()),
            })
        );

        let logs = h.storage.list_logs(&h.run_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "row imported");
        assert!(logs[0].step_name.is_none());

        assert!(matches!(
            stream.next().await.unwrap().kind,
            EventKind::RunProgress { .. }
        ));
        assert!(matches!(
            stream.next().await.unwrap().kind,
            EventKind::LogWrite { .. }
        ));
    }

    #[tokio::test]
    async fn logs_inside_a_step_carry_the_step_name() {
        let h = harness().await;
        let ctx = context(&h);

        let inner = ctx.clone();
        let _: i64 = ctx
            .run("a", || async move {
                inner.log_info("inside", None).await;
                Ok(1)
            })
            .await
            .unwrap();

        let logs = h.storage.list_logs(&h.run_id).await.unwrap();
        assert_eq!(logs[0].step_name.as_deref(), Some("a"));
    }
}
