//! Run executor: drives one claimed run end-to-end.
//!
//! The executor owns error classification. Job code only ever sees
//! [`RunError`]; this module decides which terminal state each variant maps
//! to and which events announce it. The one deliberate gap: when storage
//! itself fails while recording an outcome, the run is left `running` so
//! the reaper returns it to the queue instead of losing the attempt.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use crate::context::StepContext;
use crate::error::RunError;
use crate::events::{EventBus, EventKind};
use crate::registry::JobDefinition;
use crate::storage::Storage;
use crate::types::Run;

pub(crate) struct RunExecutor {
    storage: Arc<dyn Storage>,
    bus: EventBus,
}

impl RunExecutor {
    pub(crate) fn new(storage: Arc<dyn Storage>, bus: EventBus) -> Self {
        Self { storage, bus }
    }

    /// Execute one attempt of a claimed run. Never panics outward; every
    /// outcome is recorded in storage and announced on the bus.
    pub(crate) async fn execute(
        &self,
        run: &Run,
        definition: Arc<JobDefinition>,
        cancel_flag: Arc<AtomicBool>,
    ) {
        let started = Instant::now();
        tracing::info!(run_id = %run.id, job = %run.job_name, "run started");
        self.bus.emit(&run.id, &run.job_name, EventKind::RunStart);

        if let Err(message) = definition.validate_input(&run.payload) {
            self.finish_failed(run, format!("invalid input: {message}"), None)
                .await;
            return;
        }

        // The step cache: completed rows replay, failed rows re-execute.
        let prior_steps = match self.storage.list_steps(&run.id).await {
            Ok(steps) => steps,
            Err(err) => {
                // Leave the run running; the reaper re-queues it.
                self.bus.worker_error(Some(&run.id), "load_steps", err);
                return;
            }
        };

        let ctx = StepContext::new(
            run.id.clone(),
            run.job_name.clone(),
            prior_steps,
            self.storage.clone(),
            self.bus.clone(),
            cancel_flag,
        );

        match definition.invoke(ctx, run.payload.clone()).await {
            Ok(output) => {
                if let Err(message) = definition.validate_output(&output) {
                    self.finish_failed(run, format!("invalid output: {message}"), None)
                        .await;
                    return;
                }
                match self.storage.complete_run(&run.id, &output).await {
                    Ok(_) => {
                        let duration_ms = started.elapsed().as_millis() as i64;
                        tracing::info!(run_id = %run.id, job = %run.job_name, duration_ms, "run completed");
                        self.bus.emit(
                            &run.id,
                            &run.job_name,
                            EventKind::RunComplete {
                                output,
                                duration_ms,
                            },
                        );
                    }
                    Err(err) => self.bus.worker_error(Some(&run.id), "record_outcome", err),
                }
            }
            Err(RunError::Cancelled) => match self.storage.cancel_run(&run.id).await {
                Ok(_) => {
                    tracing::info!(run_id = %run.id, job = %run.job_name, "run cancelled");
                    self.bus.emit(&run.id, &run.job_name, EventKind::RunCancel);
                }
                Err(err) => self.bus.worker_error(Some(&run.id), "record_outcome", err),
            },
            Err(RunError::Storage(err)) => {
                // Recording state failed mid-run; the attempt is abandoned
                // and the run stays running until the reaper resets it.
                self.bus.worker_error(Some(&run.id), "storage", err);
            }
            Err(err @ RunError::StepFailed { .. }) => {
                let failed_step = match &err {
                    RunError::StepFailed { step, .. } => Some(step.clone()),
                    _ => None,
                };
                self.finish_failed(run, err.to_string(), failed_step).await;
            }
            Err(err @ RunError::DuplicateStepName(_)) => {
                let failed_step = match &err {
                    RunError::DuplicateStepName(name) => Some(name.clone()),
                    _ => None,
                };
                self.finish_failed(run, err.to_string(), failed_step).await;
            }
            Err(RunError::Job(message)) => self.finish_failed(run, message, None).await,
        }
    }

    async fn finish_failed(&self, run: &Run, error: String, failed_step: Option<String>) {
        match self.storage.fail_run(&run.id, &error).await {
            Ok(_) => {
                tracing::warn!(run_id = %run.id, job = %run.job_name, error, "run failed");
                self.bus.emit(
                    &run.id,
                    &run.job_name,
                    EventKind::RunFail {
                        error,
                        failed_step_name: failed_step,
                    },
                );
            }
            Err(err) => self.bus.worker_error(Some(&run.id), "record_outcome", err),
        }
    }
}
