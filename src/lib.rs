//! Durably - a durable execution engine.
//!
//! Executes user-defined jobs as ordered sequences of idempotent, memoized
//! steps over a single relational store. Each step's result is persisted as
//! it completes, so an interrupted run resumes from the last checkpoint
//! instead of restarting. Built for workflows too long for one synchronous
//! request and too small for a distributed queue: CSV imports, data syncs,
//! API fan-outs, multi-stage batch processing.
//!
//! ## Architecture
//!
//! ```text
//! trigger ──> runs table (pending) ──> worker claims ──> executor
//!                                                           │
//!                 step cache (steps table) <── StepContext ─┤
//!                                                           │
//!                 event bus ──> in-process subscribers + SSE
//! ```
//!
//! - One worker task per instance; multiple processes coordinate purely
//!   through atomic claims on the shared store.
//! - Completed steps replay from cache on retry; failed steps re-execute.
//! - Cancellation is cooperative: observed between steps, never by
//!   interrupting user code.
//! - Liveness is heartbeat-based: a crashed attempt is reaped back to
//!   `pending` and resumed by the next claim.
//!
//! ## Example
//!
//! ```no_run
//! use durably::{Config, Durably, JobDefinition, TriggerOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), durably::Error> {
//!     let durably = Durably::open(Config::from_env()).await?;
//!
//!     let sum = durably.register(JobDefinition::new("sum", |ctx, _input| async move {
//!         let a: i64 = ctx.run("a", || async { Ok(1) }).await?;
//!         let b: i64 = ctx.run("b", || async { Ok(2) }).await?;
//!         Ok(json!({ "total": a + b }))
//!     }));
//!
//!     durably.init().await?;
//!     let (run_id, output) = sum
//!         .trigger_and_wait(json!({}), TriggerOptions::default(), None)
//!         .await?;
//!     println!("{run_id}: {output}");
//!
//!     durably.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod instance;
pub mod registry;
pub mod storage;
pub mod types;

mod executor;
mod http;
mod worker;

// Re-export key types at crate root
pub use config::Config;
pub use context::StepContext;
pub use error::{Error, RunError};
pub use events::{Event, EventBus, EventFilter, EventKind, EventStream};
pub use instance::Durably;
pub use registry::{
    BatchTriggerFailure, BatchTriggerResult, JobDefinition, JobHandle, JobRegistry,
    TriggerOptions, Validator,
};
pub use storage::{HeartbeatAck, NewRun, NewStep, SqliteStore, Storage, StorageError};
pub use types::{
    LogEntry, LogLevel, Progress, Run, RunFilter, RunListEntry, RunStatus, Step, StepStatus,
};
