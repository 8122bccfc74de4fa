//! Job registry: name -> definition map plus the per-job trigger API.
//!
//! A [`JobDefinition`] couples a job name with its opaque input/output
//! validators and the async `run_fn` that drives a [`StepContext`]. The
//! registry is process-local and read-mostly: `register` is serialized by a
//! mutex and idempotent per name, so the worker can resolve definitions
//! without coordination.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::StepContext;
use crate::error::{Error, RunError};
use crate::events::{EventBus, EventKind};
use crate::storage::{NewRun, Storage};
use crate::types::{Run, RunFilter, RunListEntry, RunStatus};

/// Opaque payload validator. The engine never interprets schemas; it only
/// asks "is this value acceptable" and records the refusal message.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

type JobFuture = Pin<Box<dyn Future<Output = Result<Value, RunError>> + Send>>;
type RunFn = Arc<dyn Fn(StepContext, Value) -> JobFuture + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════
// Job definition
// ═══════════════════════════════════════════════════════════════════════════

/// A registered job: what to call it, how to validate its payloads, and the
/// step program to execute.
#[derive(Clone)]
pub struct JobDefinition {
    name: String,
    input_validator: Option<Validator>,
    output_validator: Option<Validator>,
    run_fn: RunFn,
}

impl JobDefinition {
    /// Define a job from an async step program.
    pub fn new<F, Fut>(name: impl Into<String>, run_fn: F) -> Self
    where
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RunError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            input_validator: None,
            output_validator: None,
            run_fn: Arc::new(move |ctx, input| Box::pin(run_fn(ctx, input))),
        }
    }

    /// Attach an input validator; rejected payloads fail the run before any
    /// step executes and surface as 400s on `trigger`.
    pub fn with_input_validator(
        mut self,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.input_validator = Some(Arc::new(validator));
        self
    }

    /// Attach an output validator; a rejected output fails the run.
    pub fn with_output_validator(
        mut self,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.output_validator = Some(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn validate_input(&self, input: &Value) -> Result<(), String> {
        match &self.input_validator {
            Some(validator) => validator(input),
            None => Ok(()),
        }
    }

    pub(crate) fn validate_output(&self, output: &Value) -> Result<(), String> {
        match &self.output_validator {
            Some(validator) => validator(output),
            None => Ok(()),
        }
    }

    pub(crate) fn invoke(&self, ctx: StepContext, payload: Value) -> JobFuture {
        (self.run_fn)(ctx, payload)
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("has_input_validator", &self.input_validator.is_some())
            .field("has_output_validator", &self.output_validator.is_some())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

/// Process-local map from job name to definition.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Arc<JobDefinition>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Idempotent per name: a second registration
    /// under an existing name returns the first definition unchanged.
    pub fn register(&self, definition: JobDefinition) -> Arc<JobDefinition> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.entry(definition.name.clone())
            .or_insert_with(|| Arc::new(definition))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Job handle
// ═══════════════════════════════════════════════════════════════════════════

/// Options for a single trigger call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOptions {
    /// Dedup key: a second trigger with the same key for the same job
    /// returns the existing run instead of inserting.
    pub idempotency_key: Option<String>,

    /// Serialization key: at most one `running` run per key at a time.
    pub concurrency_key: Option<String>,
}

/// Outcome of a `batch_trigger` call: the runs that were inserted plus
/// per-input failures for the rest.
#[derive(Debug)]
pub struct BatchTriggerResult {
    pub runs: Vec<Run>,
    pub failures: Vec<BatchTriggerFailure>,
}

#[derive(Debug)]
pub struct BatchTriggerFailure {
    /// Position of the failed input in the submitted batch.
    pub index: usize,
    pub error: String,
}

/// Per-job API bound to one engine instance.
#[derive(Clone)]
pub struct JobHandle {
    definition: Arc<JobDefinition>,
    storage: Arc<dyn Storage>,
    bus: EventBus,
}

impl JobHandle {
    pub(crate) fn new(
        definition: Arc<JobDefinition>,
        storage: Arc<dyn Storage>,
        bus: EventBus,
    ) -> Self {
        Self {
            definition,
            storage,
            bus,
        }
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Validate the input and insert a `pending` run. Emits `run:trigger`
    /// only when a row was actually inserted; an idempotency hit returns
    /// the existing run silently.
    pub async fn trigger(&self, input: Value, options: TriggerOptions) -> Result<Run, Error> {
        self.definition
            .validate_input(&input)
            .map_err(Error::InvalidInput)?;

        let (run, created) = self
            .storage
            .create_run(NewRun {
                job_name: self.definition.name().to_string(),
                payload: input,
                idempotency_key: options.idempotency_key,
                concurrency_key: options.concurrency_key,
            })
            .await?;

        if created {
            tracing::info!(run_id = %run.id, job = %run.job_name, "run triggered");
            self.bus.emit(
                &run.id,
                &run.job_name,
                EventKind::RunTrigger {
                    payload: run.payload.clone(),
                },
            );
        }
        Ok(run)
    }

    /// Trigger and block until the run reaches a terminal state, resolving
    /// with its output. A timeout abandons the wait without cancelling the
    /// run.
    pub async fn trigger_and_wait(
        &self,
        input: Value,
        options: TriggerOptions,
        wait_timeout: Option<Duration>,
    ) -> Result<(String, Value), Error> {
        let run = self.trigger(input, options).await?;
        let run_id = run.id.clone();

        let outcome = self.wait_for_outcome(&run_id);
        let output = match wait_timeout {
            Some(limit) => tokio::time::timeout(limit, outcome)
                .await
                .map_err(|_| Error::WaitTimeout(run_id.clone()))??,
            None => outcome.await?,
        };
        Ok((run_id, output))
    }

    async fn wait_for_outcome(&self, run_id: &str) -> Result<Value, Error> {
        // Subscribe before inspecting stored state so a terminal transition
        // between the two cannot be missed.
        let mut stream = self.bus.subscribe_run(run_id);

        if let Some(outcome) = self.stored_outcome(run_id).await? {
            return outcome;
        }

        while let Some(event) = stream.next().await {
            match event.kind {
                EventKind::RunComplete { output, .. } => return Ok(output),
                EventKind::RunFail {
                    error,
                    failed_step_name,
                } => {
                    return Err(Error::RunFailed {
                        run_id: run_id.to_string(),
                        error,
                        failed_step: failed_step_name,
                    });
                }
                EventKind::RunCancel => return Err(Error::RunCancelled(run_id.to_string())),
                _ => {}
            }
        }

        // The stream ended without a terminal event (instance shut down or
        // the subscriber lagged past it); the store has the truth.
        match self.stored_outcome(run_id).await? {
            Some(outcome) => outcome,
            None => Err(Error::WaitTimeout(run_id.to_string())),
        }
    }

    async fn stored_outcome(&self, run_id: &str) -> Result<Option<Result<Value, Error>>, Error> {
        let run = self.storage.get_run(run_id).await?;
        Ok(match run.status {
            RunStatus::Completed => Some(Ok(run.output.unwrap_or(Value::Null))),
            RunStatus::Failed => Some(Err(Error::RunFailed {
                run_id: run_id.to_string(),
                error: run.error.unwrap_or_else(|| "run failed".to_string()),
                failed_step: None,
            })),
            RunStatus::Cancelled => Some(Err(Error::RunCancelled(run_id.to_string()))),
            RunStatus::Pending | RunStatus::Running => None,
        })
    }

    /// Validate every input up front, then insert one run per input.
    /// Inserts are best-effort: a storage failure on one input is reported
    /// in `failures` and does not abort the rest.
    pub async fn batch_trigger(&self, inputs: Vec<Value>) -> Result<BatchTriggerResult, Error> {
        for (index, input) in inputs.iter().enumerate() {
            self.definition
                .validate_input(input)
                .map_err(|msg| Error::InvalidInput(format!("input {index}: {msg}")))?;
        }

        let mut result = BatchTriggerResult {
            runs: Vec::with_capacity(inputs.len()),
            failures: Vec::new(),
        };
        for (index, input) in inputs.into_iter().enumerate() {
            match self.trigger(input, TriggerOptions::default()).await {
                Ok(run) => result.runs.push(run),
                Err(err) => result.failures.push(BatchTriggerFailure {
                    index,
                    error: err.to_string(),
                }),
            }
        }
        Ok(result)
    }

    /// Fetch a run, scoped to this job.
    pub async fn get_run(&self, run_id: &str) -> Result<Run, Error> {
        let run = self.storage.get_run(run_id).await?;
        if run.job_name != self.definition.name() {
            return Err(Error::RunNotFound(run_id.to_string()));
        }
        Ok(run)
    }

    /// List runs of this job; the filter's `job_name` is overridden.
    pub async fn get_runs(&self, filter: RunFilter) -> Result<Vec<RunListEntry>, Error> {
        let filter = RunFilter {
            job_name: Some(self.definition.name().to_string()),
            ..filter
        };
        Ok(self.storage.list_runs(&filter).await?)
    }
}
