//! Instance facade: lifecycle, registration, and operator actions.
//!
//! A [`Durably`] instance owns its storage handle, event bus, job registry,
//! and worker task; nothing is process-global, so one process can host
//! several instances bound to different stores. Cloning an instance clones
//! a handle to the same engine.

use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Error;
use crate::events::{EventBus, EventFilter, EventKind, EventStream};
use crate::http;
use crate::registry::{JobDefinition, JobHandle, JobRegistry, TriggerOptions};
use crate::storage::{SqliteStore, Storage, StorageError};
use crate::types::{LogEntry, Run, RunFilter, RunListEntry, RunStatus, Step};
use crate::worker::{CancelRegistry, Worker};

/// A durable execution engine bound to one store.
#[derive(Clone)]
pub struct Durably {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    storage: Arc<dyn Storage>,
    bus: EventBus,
    registry: Arc<JobRegistry>,
    cancels: Arc<CancelRegistry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Durably {
    /// Open an instance over the SQLite store named in `config`.
    pub async fn open(config: Config) -> Result<Self, Error> {
        let storage = SqliteStore::open(&config.database_path).await?;
        Self::with_storage(config, Arc::new(storage))
    }

    /// Open an instance over an already-constructed store. This is the
    /// seam for alternative storage dialects.
    pub fn with_storage(config: Config, storage: Arc<dyn Storage>) -> Result<Self, Error> {
        config.validate().map_err(Error::Config)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                bus: EventBus::new(config.event_capacity),
                config,
                storage,
                registry: Arc::new(JobRegistry::new()),
                cancels: Arc::new(CancelRegistry::new()),
                shutdown_tx,
                shutdown_rx,
                worker: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Register a job. Idempotent per name; the returned handle triggers
    /// and inspects runs of that job.
    pub fn register(&self, definition: JobDefinition) -> JobHandle {
        let definition = self.inner.registry.register(definition);
        JobHandle::new(
            definition,
            self.inner.storage.clone(),
            self.inner.bus.clone(),
        )
    }

    /// Handle for an already-registered job.
    pub fn job(&self, name: &str) -> Option<JobHandle> {
        self.inner.registry.get(name).map(|definition| {
            JobHandle::new(
                definition,
                self.inner.storage.clone(),
                self.inner.bus.clone(),
            )
        })
    }

    /// Run schema migrations and start the background worker. Safe to call
    /// more than once; a live worker is left alone.
    pub async fn init(&self) -> Result<(), Error> {
        self.inner.storage.migrate().await?;

        let mut worker = self.inner.worker.lock().await;
        if worker.is_none() {
            // Allow init after a previous stop.
            let _ = self.inner.shutdown_tx.send(false);
            let task = Worker::new(
                self.inner.storage.clone(),
                self.inner.bus.clone(),
                self.inner.registry.clone(),
                self.inner.config.clone(),
                self.inner.cancels.clone(),
                self.inner.shutdown_rx.clone(),
            );
            *worker = Some(tokio::spawn(task.run()));
        }
        Ok(())
    }

    /// Signal the worker to finish its current run and exit, then wait for
    /// it. Idempotent, and safe to call concurrently with in-flight
    /// triggers: pending runs stay queued for the next process.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Operator actions
    // ═══════════════════════════════════════════════════════════════════

    /// Trigger a run by job name (the HTTP path into [`JobHandle::trigger`]).
    pub async fn trigger(
        &self,
        job_name: &str,
        input: Value,
        options: TriggerOptions,
    ) -> Result<Run, Error> {
        let handle = self
            .job(job_name)
            .ok_or_else(|| Error::UnknownJob(job_name.to_string()))?;
        handle.trigger(input, options).await
    }

    /// Cancel a run: a `pending` run transitions directly, a `running` run
    /// gets a cooperative cancel request that its worker observes between
    /// steps. In-flight step code is never interrupted.
    pub async fn cancel(&self, run_id: &str) -> Result<(), Error> {
        let run = self.inner.storage.get_run(run_id).await?;
        match run.status {
            RunStatus::Pending => {
                self.inner
                    .storage
                    .cancel_run(run_id)
                    .await
                    .map_err(|err| Error::from_storage(err, "cancel"))?;
                self.inner.bus.emit(run_id, &run.job_name, EventKind::RunCancel);
                Ok(())
            }
            RunStatus::Running => {
                match self.inner.storage.request_cancel(run_id).await {
                    Ok(()) => {
                        // Owning worker in this process reacts immediately;
                        // a peer process reacts at its next heartbeat.
                        self.inner.cancels.request(run_id);
                        tracing::info!(run_id, "cancellation requested");
                        Ok(())
                    }
                    Err(StorageError::NotRunning(_)) => {
                        let current = self.inner.storage.get_run(run_id).await?;
                        Err(Error::InvalidTransition {
                            run_id: run_id.to_string(),
                            action: "cancel",
                            status: current.status,
                        })
                    }
                    Err(err) => Err(err.into()),
                }
            }
            status => Err(Error::InvalidTransition {
                run_id: run_id.to_string(),
                action: "cancel",
                status,
            }),
        }
    }

    /// Reset a `failed` or `cancelled` run to `pending`. Step rows survive,
    /// so the next attempt replays completed steps from cache.
    pub async fn retry(&self, run_id: &str) -> Result<(), Error> {
        let run = self
            .inner
            .storage
            .reset_run_to_pending(run_id)
            .await
            .map_err(|err| Error::from_storage(err, "retry"))?;
        tracing::info!(run_id, job = %run.job_name, "run reset for retry");
        self.inner.bus.emit(run_id, &run.job_name, EventKind::RunRetry);
        Ok(())
    }

    /// Delete a terminal run and its steps and logs.
    pub async fn delete_run(&self, run_id: &str) -> Result<(), Error> {
        self.inner
            .storage
            .delete_run(run_id)
            .await
            .map_err(|err| Error::from_storage(err, "delete"))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, Error> {
        Ok(self.inner.storage.get_run(run_id).await?)
    }

    pub async fn get_runs(&self, filter: RunFilter) -> Result<Vec<RunListEntry>, Error> {
        Ok(self.inner.storage.list_runs(&filter).await?)
    }

    /// A run's recorded steps, ordered by index.
    pub async fn get_steps(&self, run_id: &str) -> Result<Vec<Step>, Error> {
        self.inner.storage.get_run(run_id).await?;
        Ok(self.inner.storage.list_steps(run_id).await?)
    }

    /// A run's log rows in emission order.
    pub async fn get_logs(&self, run_id: &str) -> Result<Vec<LogEntry>, Error> {
        self.inner.storage.get_run(run_id).await?;
        Ok(self.inner.storage.list_logs(run_id).await?)
    }

    /// Subscribe to one run's events; the stream ends after its terminal
    /// event.
    pub fn subscribe(&self, run_id: &str) -> EventStream {
        self.inner.bus.subscribe_run(run_id)
    }

    /// Subscribe to the bus with an arbitrary filter.
    pub fn events(&self, filter: EventFilter) -> EventStream {
        self.inner.bus.subscribe(filter)
    }

    // ═══════════════════════════════════════════════════════════════════
    // HTTP surface
    // ═══════════════════════════════════════════════════════════════════

    /// The REST + SSE router for this instance, nested under the
    /// configured base path.
    pub fn router(&self) -> axum::Router {
        http::router(self.clone())
    }

    /// Serve the router until `stop()` is called, then drain gracefully.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        let mut shutdown = self.inner.shutdown_rx.clone();
        tracing::info!(addr = ?listener.local_addr().ok(), "http surface listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stopped| *stopped).await;
            })
            .await
            .map_err(|err| Error::Config(format!("server error: {err}")))
    }
}
