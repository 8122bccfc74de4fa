//! HTTP surface: REST routes over the facade plus SSE event streaming.
//!
//! ## Endpoints
//!
//! - `POST   /trigger`         - trigger a run `{jobName, input, ...}`
//! - `GET    /run?runId=`      - fetch one run
//! - `DELETE /run?runId=`      - delete a terminal run
//! - `GET    /runs?...`        - list runs with step counts
//! - `GET    /steps?runId=`    - a run's steps in index order
//! - `GET    /logs?runId=`     - a run's log rows
//! - `POST   /retry?runId=`    - reset a failed/cancelled run
//! - `POST   /cancel?runId=`   - cancel a run
//! - `GET    /subscribe?runId=`        - SSE, one run, ends at terminal
//! - `GET    /runs/subscribe?jobName=` - SSE, one job or everything
//! - `GET    /healthz`         - liveness
//!
//! Non-SSE responses are JSON; errors are `{"error": ...}` with 4xx for
//! caller mistakes and 5xx reserved for storage faults. SSE frames carry
//! the event union as `data: <json>` with a 15s comment ping.

use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::events::EventFilter;
use crate::instance::Durably;
use crate::registry::TriggerOptions;
use crate::types::{LogEntry, Run, RunFilter, RunListEntry, RunStatus, Step};

/// Build the router for an instance, nested under its configured base path.
pub(crate) fn router(durably: Durably) -> Router {
    let base_path = durably.config().base_path.clone();

    let routes = Router::new()
        .route("/trigger", post(trigger_handler))
        .route("/run", get(get_run_handler).delete(delete_run_handler))
        .route("/runs", get(list_runs_handler))
        .route("/steps", get(list_steps_handler))
        .route("/logs", get(list_logs_handler))
        .route("/retry", post(retry_handler))
        .route("/cancel", post(cancel_handler))
        .route("/subscribe", get(subscribe_run_handler))
        .route("/runs/subscribe", get(subscribe_runs_handler))
        .route("/healthz", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(durably);

    match base_path.as_str() {
        "" | "/" => routes,
        base => Router::new().nest(base, routes),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Request / error types
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    job_name: String,
    #[serde(default)]
    input: Value,
    idempotency_key: Option<String>,
    concurrency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunQuery {
    run_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunsQuery {
    job_name: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JobQuery {
    job_name: Option<String>,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::UnknownJob(_) | Error::RunNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::InvalidTransition { .. }
            | Error::RunFailed { .. }
            | Error::RunCancelled(_) => StatusCode::CONFLICT,
            Error::WaitTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Config(_) | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// REST handlers
// ═══════════════════════════════════════════════════════════════════════════

async fn trigger_handler(
    State(durably): State<Durably>,
    Json(body): Json<TriggerRequest>,
) -> Result<Json<Value>, ApiError> {
    let run = durably
        .trigger(
            &body.job_name,
            body.input,
            TriggerOptions {
                idempotency_key: body.idempotency_key,
                concurrency_key: body.concurrency_key,
            },
        )
        .await?;
    Ok(Json(json!({ "runId": run.id })))
}

async fn get_run_handler(
    State(durably): State<Durably>,
    Query(query): Query<RunQuery>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(durably.get_run(&query.run_id).await?))
}

async fn list_runs_handler(
    State(durably): State<Durably>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<RunListEntry>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            RunStatus::parse(s).ok_or_else(|| Error::InvalidInput(format!("unknown status '{s}'")))
        })
        .transpose()?;

    let runs = durably
        .get_runs(RunFilter {
            job_name: query.job_name,
            status,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(runs))
}

async fn list_steps_handler(
    State(durably): State<Durably>,
    Query(query): Query<RunQuery>,
) -> Result<Json<Vec<Step>>, ApiError> {
    Ok(Json(durably.get_steps(&query.run_id).await?))
}

async fn list_logs_handler(
    State(durably): State<Durably>,
    Query(query): Query<RunQuery>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    Ok(Json(durably.get_logs(&query.run_id).await?))
}

async fn retry_handler(
    State(durably): State<Durably>,
    Query(query): Query<RunQuery>,
) -> Result<Json<Value>, ApiError> {
    durably.retry(&query.run_id).await?;
    Ok(Json(json!({})))
}

async fn cancel_handler(
    State(durably): State<Durably>,
    Query(query): Query<RunQuery>,
) -> Result<Json<Value>, ApiError> {
    durably.cancel(&query.run_id).await?;
    Ok(Json(json!({})))
}

async fn delete_run_handler(
    State(durably): State<Durably>,
    Query(query): Query<RunQuery>,
) -> Result<Json<Value>, ApiError> {
    durably.delete_run(&query.run_id).await?;
    Ok(Json(json!({})))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

// ═══════════════════════════════════════════════════════════════════════════
// SSE handlers
// ═══════════════════════════════════════════════════════════════════════════

type SseStream = BoxStream<'static, Result<SseEvent, axum::Error>>;

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("ping")
}

/// Per-run stream: subscribe first, then check stored state so a terminal
/// transition between the two cannot leave the client hanging. For a run
/// that is already terminal the stream closes immediately.
async fn subscribe_run_handler(
    State(durably): State<Durably>,
    Query(query): Query<RunQuery>,
) -> Result<Sse<SseStream>, ApiError> {
    let events = durably.subscribe(&query.run_id);
    let run = durably.get_run(&query.run_id).await?;

    let stream: SseStream = if run.status.is_terminal() {
        futures::stream::empty().boxed()
    } else {
        events
            .map(|event| SseEvent::default().json_data(&event))
            .boxed()
    };

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

/// Job-level (or global) stream; runs until the client disconnects.
async fn subscribe_runs_handler(
    State(durably): State<Durably>,
    Query(query): Query<JobQuery>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, axum::Error>>> {
    let filter = match query.job_name {
        Some(job_name) => EventFilter::Job(job_name),
        None => EventFilter::All,
    };

    let stream = durably
        .events(filter)
        .map(|event| SseEvent::default().json_data(&event));

    Sse::new(stream).keep_alive(keep_alive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::JobDefinition;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    async fn instance() -> (Durably, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            database_path: dir.path().join("test.db"),
            ..Config::default()
        };
        let durably = Durably::open(config).await.unwrap();
        durably.register(JobDefinition::new("sum", |_ctx, _input| async {
            Ok(json!(null))
        }));
        durably.init().await.unwrap();
        (durably, dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let (durably, _dir) = instance().await;
        let response = durably
            .router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));
        durably.stop().await;
    }

    #[tokio::test]
    async fn unknown_job_is_a_404_with_error_body() {
        let (durably, _dir) = instance().await;

        let request = Request::post("/trigger")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"jobName":"nope","input":{}}"#))
            .unwrap();
        let response = durably.router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));
        durably.stop().await;
    }

    #[tokio::test]
    async fn missing_run_is_a_404() {
        let (durably, _dir) = instance().await;

        let response = durably
            .router()
            .oneshot(
                Request::get("/run?runId=does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        durably.stop().await;
    }

    #[tokio::test]
    async fn bad_status_filter_is_a_400() {
        let (durably, _dir) = instance().await;

        let response = durably
            .router()
            .oneshot(
                Request::get("/runs?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        durably.stop().await;
    }

    #[tokio::test]
    async fn base_path_nests_all_routes() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            database_path: dir.path().join("test.db"),
            base_path: "/durably".to_string(),
            ..Config::default()
        };
        let durably = Durably::open(config).await.unwrap();
        durably.init().await.unwrap();

        let router = durably.router();
        let nested = router
            .clone()
            .oneshot(Request::get("/durably/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(nested.status(), StatusCode::OK);

        let bare = router
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(bare.status(), StatusCode::NOT_FOUND);
        durably.stop().await;
    }
}
