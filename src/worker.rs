//! Background worker: polls for claimable runs and drives them.
//!
//! One worker task per instance. Multiple instances (or processes) may poll
//! the same store; correctness rests entirely on the atomicity of
//! `claim_next_pending_run`. Each tick:
//!
//! 1. reap stale `running` runs back to `pending`,
//! 2. claim and execute runs until the queue is empty,
//! 3. sleep `polling_interval`.
//!
//! While a run executes, a separate heartbeat task stamps `heartbeat_at`
//! every `heartbeat_interval` and relays a durable cancel request into the
//! attempt's in-memory flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::events::{EventBus, EventKind};
use crate::executor::RunExecutor;
use crate::registry::JobRegistry;
use crate::storage::{Storage, StorageError};
use crate::types::Run;

const STORAGE_RETRY_ATTEMPTS: u32 = 5;
const STORAGE_RETRY_BASE: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════════════════
// Cancel registry
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory cancel flags for runs currently executing in this process.
///
/// `cancel` on the owning instance trips the flag immediately; peers go
/// through the durable `cancel_requested` column and reach the flag via the
/// heartbeat acknowledgment.
#[derive(Default)]
pub(crate) struct CancelRegistry {
    flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl CancelRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self, run_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags
            .lock()
            .unwrap()
            .insert(run_id.to_string(), flag.clone());
        flag
    }

    fn remove(&self, run_id: &str) {
        self.flags.lock().unwrap().remove(run_id);
    }

    /// Trip the flag for a run owned by this process. Returns whether the
    /// run was found here.
    pub(crate) fn request(&self, run_id: &str) -> bool {
        match self.flags.lock().unwrap().get(run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) struct Worker {
    storage: Arc<dyn Storage>,
    bus: EventBus,
    registry: Arc<JobRegistry>,
    config: Config,
    cancels: Arc<CancelRegistry>,
    shutdown: watch::Receiver<bool>,
    worker_id: String,
}

impl Worker {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        bus: EventBus,
        registry: Arc<JobRegistry>,
        config: Config,
        cancels: Arc<CancelRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let worker_id = format!("w_{}", &Uuid::new_v4().to_string()[..8]);
        Self {
            storage,
            bus,
            registry,
            config,
            cancels,
            shutdown,
            worker_id,
        }
    }

    /// The polling loop. Returns once shutdown is signalled and the current
    /// run (if any) has finished.
    pub(crate) async fn run(mut self) {
        tracing::info!(worker_id = %self.worker_id, "worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// One poll cycle: reap, then drain the queue.
    async fn tick(&self) {
        match with_backoff(|| self.storage.reap_stale_runs(self.config.stale_threshold)).await {
            Ok(reaped) => {
                for run_id in &reaped {
                    tracing::warn!(run_id = %run_id, "reset stale run to pending");
                }
            }
            Err(err) => {
                self.bus.worker_error(None, "reap", err);
                return;
            }
        }

        loop {
            if *self.shutdown.borrow() {
                return;
            }
            match with_backoff(|| self.storage.claim_next_pending_run(&self.worker_id)).await {
                Ok(Some(run)) => self.execute_claimed(run).await,
                Ok(None) => return,
                Err(err) => {
                    self.bus.worker_error(None, "claim", err);
                    return;
                }
            }
        }
    }

    async fn execute_claimed(&self, run: Run) {
        let Some(definition) = self.registry.get(&run.job_name) else {
            // The store can hold runs for jobs this process never
            // registered; surface that instead of letting them spin.
            let message = format!("job '{}' is not registered", run.job_name);
            match self.storage.fail_run(&run.id, &message).await {
                Ok(_) => self.bus.emit(
                    &run.id,
                    &run.job_name,
                    EventKind::RunFail {
                        error: message,
                        failed_step_name: None,
                    },
                ),
                Err(err) => self.bus.worker_error(Some(&run.id), "record_outcome", err),
            }
            return;
        };

        let cancel_flag = self.cancels.register(&run.id);
        if run.cancel_requested {
            // Cancel arrived before this attempt (e.g. against a stale one).
            cancel_flag.store(true, Ordering::SeqCst);
        }

        let heartbeat = spawn_heartbeat(
            self.storage.clone(),
            self.bus.clone(),
            run.id.clone(),
            self.config.heartbeat_interval,
            cancel_flag.clone(),
        );

        RunExecutor::new(self.storage.clone(), self.bus.clone())
            .execute(&run, definition, cancel_flag)
            .await;

        heartbeat.abort();
        self.cancels.remove(&run.id);
    }
}

/// Periodic liveness writes for one claimed run. Ends on its own when the
/// run leaves `running`; aborted by the worker as soon as the executor
/// returns.
fn spawn_heartbeat(
    storage: Arc<dyn Storage>,
    bus: EventBus,
    run_id: String,
    interval: Duration,
    cancel_flag: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The claim already stamped heartbeat_at; skip the immediate tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match storage.heartbeat(&run_id).await {
                Ok(ack) => {
                    if ack.cancel_requested {
                        cancel_flag.store(true, Ordering::SeqCst);
                    }
                }
                Err(StorageError::NotRunning(_)) => break,
                Err(err) => bus.worker_error(Some(&run_id), "heartbeat", err),
            }
        }
    })
}

/// Retry a storage operation with bounded exponential backoff. Transient
/// store faults should not kill a poll cycle; persistent ones surface to
/// the caller after the final attempt.
async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut delay = STORAGE_RETRY_BASE;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < STORAGE_RETRY_ATTEMPTS && is_transient(&err) => {
                tracing::warn!(attempt, "storage operation failed, retrying: {err}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_transient(err: &StorageError) -> bool {
    matches!(err, StorageError::Database(_))
}
