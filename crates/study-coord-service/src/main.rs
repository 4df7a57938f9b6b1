use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use study_coord_api::{
    EvaluatorClient, HttpEvaluatorClient, SchemaStatus, StudyCoordApi,
};
use study_coord_core::{
    Assignment, CoordError, DraftRecord, EvaluationItemStatus, EvaluationRun,
    ParticipantContext, ReconcileOutcome, RunHandle, RunReport, SessionToken, StudyConfig,
};

const CONTRACT_VERSION: &str = "study-coord.v1";
const SIGNATURE_HEADER: &str = "x-shared-signature";

#[derive(Clone)]
struct ServiceState {
    api: StudyCoordApi,
    evaluator: Arc<dyn EvaluatorClient + Send + Sync>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    bad_request_total: AtomicU64,
    unauthorized_total: AtomicU64,
    conflict_total: AtomicU64,
    upstream_failure_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    degraded_assign_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    bad_request_total: u64,
    unauthorized_total: u64,
    conflict_total: u64,
    upstream_failure_total: u64,
    storage_unavailable_total: u64,
    internal_error_total: u64,
    degraded_assign_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    schema: SchemaStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct IssueSessionRequest {
    participant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenRequest {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LinkCallRequest {
    token: String,
    participant_id: String,
    call_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AssignRequest {
    #[serde(default)]
    participant_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TouchDraftRequest {
    participant_id: String,
    step: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SubmitDraftRequest {
    participant_id: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct SweepRequest {
    #[serde(default)]
    cutoff_minutes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubmitBatchRequest {
    call_ids: Vec<String>,
    #[serde(default)]
    metric_id: Option<String>,
    #[serde(default)]
    retry_errored: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct PollRunRequest {
    run_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ResultCallbackRequest {
    call_id: String,
    #[serde(default)]
    metric_id: Option<String>,
    status: EvaluationItemStatus,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RunsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Parser)]
#[command(name = "study-coord-service")]
#[command(about = "HTTP coordination service for remote voice studies")]
struct Args {
    #[arg(long, default_value = "./study_coord.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, default_value = "local-dev-secret")]
    webhook_secret: String,
    #[arg(long, default_value_t = study_coord_core::DEFAULT_TOKEN_TTL_HOURS)]
    token_ttl_hours: i64,
    #[arg(long, default_value_t = study_coord_core::DEFAULT_SWEEP_CUTOFF_MINUTES)]
    sweep_cutoff_minutes: i64,
    #[arg(long, default_value = "http://127.0.0.1:4100")]
    evaluator_url: String,
    #[arg(long)]
    evaluator_api_key: Option<String>,
    #[arg(long, default_value_t = 5000)]
    evaluator_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            contract_version: CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

fn failure(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> ServiceFailure {
    ServiceFailure { status, code, message: message.into(), details }
}

fn map_coord_error(err: &CoordError) -> ServiceFailure {
    let message = err.to_string();
    match err {
        CoordError::BadRequest(_) => {
            failure(StatusCode::BAD_REQUEST, "bad_request", message, None)
        }
        CoordError::Unauthorized(_) => {
            failure(StatusCode::UNAUTHORIZED, "unauthorized", message, None)
        }
        CoordError::Conflict(_) => failure(StatusCode::CONFLICT, "conflict", message, None),
        CoordError::Upstream(_) => {
            failure(StatusCode::BAD_GATEWAY, "upstream_failure", message, None)
        }
        CoordError::Storage(_) => {
            failure(StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable", message, None)
        }
    }
}

impl ServiceState {
    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn signature<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok())
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(StudyCoordApi) -> Result<T, CoordError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("operation_timeout", true);
                failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "operation_timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let mapped = map_coord_error(&err);
                self.telemetry.record_failure(mapped.code, false);
                Err(mapped)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "bad_request" => &self.bad_request_total,
            "unauthorized" => &self.unauthorized_total,
            "conflict" => &self.conflict_total,
            "upstream_failure" => &self.upstream_failure_total,
            "storage_unavailable" | "operation_timeout" => &self.storage_unavailable_total,
            _ => &self.internal_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            bad_request_total: self.bad_request_total.load(Ordering::Relaxed),
            unauthorized_total: self.unauthorized_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            upstream_failure_total: self.upstream_failure_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            degraded_assign_total: self.degraded_assign_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope { contract_version: CONTRACT_VERSION, data })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/sessions/issue", post(sessions_issue))
        .route("/v1/sessions/validate", post(sessions_validate))
        .route("/v1/sessions/link-call", post(sessions_link_call))
        .route("/v1/sessions/complete", post(sessions_complete))
        .route("/v1/conditions/assign", post(conditions_assign))
        .route("/v1/webhooks/call-status", post(webhooks_call_status))
        .route("/v1/drafts/touch", post(drafts_touch))
        .route("/v1/drafts/submit", post(drafts_submit))
        .route("/v1/drafts/sweep-abandoned", post(drafts_sweep))
        .route("/v1/evaluations/submit-batch", post(evaluations_submit_batch))
        .route("/v1/evaluations/runs/poll", post(evaluations_poll))
        .route("/v1/evaluations/runs", get(evaluations_runs))
        .route("/v1/evaluations/results", post(evaluations_results))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = StudyConfig::new(args.webhook_secret);
    config.token_ttl_hours = args.token_ttl_hours;
    config.sweep_cutoff_minutes = args.sweep_cutoff_minutes;
    let api = StudyCoordApi::new(args.db, config)?;
    let evaluator = HttpEvaluatorClient::new(
        &args.evaluator_url,
        args.evaluator_timeout_ms,
        args.evaluator_api_key,
    )?;
    let state = ServiceState {
        api,
        evaluator: Arc::new(evaluator),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let schema = state.run_blocking("schema_status", |api| api.schema_status()).await?;
    if schema.current_version == Some(schema.target_version) {
        return Ok(envelope(ReadinessResponse { status: "ready", schema }));
    }
    state.telemetry.record_failure("storage_unavailable", false);
    Err(failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not current; POST /v1/db/migrate before serving traffic",
        Some(json!({
            "current_version": schema.current_version,
            "target_version": schema.target_version,
        })),
    ))
}

async fn db_migrate(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceFailure> {
    let status = state
        .run_blocking("migrate", |api| {
            api.migrate()?;
            api.schema_status()
        })
        .await?;
    Ok(envelope(status))
}

async fn sessions_issue(
    State(state): State<ServiceState>,
    payload: Result<Json<IssueSessionRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SessionToken>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let token = state
        .run_blocking("issue_session", move |api| api.issue_session(&request.participant_id))
        .await?;
    Ok(envelope(token))
}

async fn sessions_validate(
    State(state): State<ServiceState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ParticipantContext>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let context = state
        .run_blocking("validate_session", move |api| api.validate_session(&request.token))
        .await?;
    Ok(envelope(context))
}

async fn sessions_link_call(
    State(state): State<ServiceState>,
    payload: Result<Json<LinkCallRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let call_id = request.call_id.clone();
    state
        .run_blocking("link_call", move |api| {
            api.link_call(&request.token, &request.participant_id, &request.call_id)
        })
        .await?;
    Ok(envelope(json!({ "linked": true, "call_id": call_id })))
}

async fn sessions_complete(
    State(state): State<ServiceState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    state
        .run_blocking("complete_session", move |api| api.complete_session(&request.token))
        .await?;
    Ok(envelope(json!({ "completed": true })))
}

async fn conditions_assign(
    State(state): State<ServiceState>,
    payload: Result<Json<AssignRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Assignment>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let assignment = state
        .run_blocking("assign_condition", move |api| {
            api.assign_condition(request.participant_id.as_deref())
        })
        .await?;
    if assignment.degraded {
        state.telemetry.degraded_assign_total.fetch_add(1, Ordering::Relaxed);
    }
    Ok(envelope(assignment))
}

async fn webhooks_call_status(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ReconcileOutcome>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let signature = state.signature(&headers).map(str::to_string);
    let outcome = state
        .run_blocking("reconcile_call_event", move |api| {
            api.reconcile_call_event(signature.as_deref(), &body)
        })
        .await?;
    Ok(envelope(outcome))
}

async fn drafts_touch(
    State(state): State<ServiceState>,
    payload: Result<Json<TouchDraftRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Option<DraftRecord>>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let draft = state
        .run_blocking("touch_draft", move |api| {
            api.touch_draft(&request.participant_id, &request.step)?;
            api.get_draft(&request.participant_id)
        })
        .await?;
    Ok(envelope(draft))
}

async fn drafts_submit(
    State(state): State<ServiceState>,
    payload: Result<Json<SubmitDraftRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Option<DraftRecord>>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let draft = state
        .run_blocking("submit_draft", move |api| {
            api.submit_draft(&request.participant_id, &request.payload)?;
            api.get_draft(&request.participant_id)
        })
        .await?;
    Ok(envelope(draft))
}

async fn drafts_sweep(
    State(state): State<ServiceState>,
    payload: Result<Json<SweepRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let updated = state
        .run_blocking("sweep_abandoned", move |api| api.sweep_abandoned(request.cutoff_minutes))
        .await?;
    Ok(envelope(json!({ "updated_count": updated })))
}

async fn evaluations_submit_batch(
    State(state): State<ServiceState>,
    payload: Result<Json<SubmitBatchRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RunHandle>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let client = Arc::clone(&state.evaluator);
    let handle = state
        .run_blocking("submit_batch", move |api| {
            api.submit_batch(
                client.as_ref(),
                &request.call_ids,
                request.metric_id.as_deref(),
                request.retry_errored,
            )
        })
        .await?;
    Ok(envelope(handle))
}

async fn evaluations_poll(
    State(state): State<ServiceState>,
    payload: Result<Json<PollRunRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RunReport>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let client = Arc::clone(&state.evaluator);
    let report = state
        .run_blocking("poll_run", move |api| api.poll_run(client.as_ref(), &request.run_id))
        .await?;
    Ok(envelope(report))
}

async fn evaluations_runs(
    State(state): State<ServiceState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<ServiceEnvelope<Vec<EvaluationRun>>>, ServiceFailure> {
    let limit = query.limit.unwrap_or(50);
    let runs = state.run_blocking("list_runs", move |api| api.list_runs(limit)).await?;
    Ok(envelope(runs))
}

/// Push-style write-back from the evaluator, guarded by the same shared
/// secret as the call-status webhook.
async fn evaluations_results(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<ResultCallbackRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<study_coord_core::AppliedResult>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let signature = state.signature(&headers).map(str::to_string);
    let applied = state
        .run_blocking("apply_result", move |api| {
            if signature.as_deref() != Some(api.config().webhook_secret.as_str()) {
                return Err(CoordError::Unauthorized(
                    "missing or mismatched webhook signature".to_string(),
                ));
            }
            api.apply_result(
                &request.call_id,
                request.metric_id.as_deref(),
                request.status,
                &request.result,
            )
        })
        .await?;
    Ok(envelope(applied))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "test-webhook-secret";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("study-coord-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected failure: {err:?}"),
        }
    }

    fn test_api(db_path: PathBuf) -> StudyCoordApi {
        must(StudyCoordApi::new(db_path, StudyConfig::new(TEST_SECRET)))
    }

    fn test_state(api: StudyCoordApi) -> ServiceState {
        let evaluator = must(HttpEvaluatorClient::new("http://127.0.0.1:1", 200, None));
        ServiceState {
            api,
            evaluator: Arc::new(evaluator),
            operation_timeout: Duration::from_millis(2500),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn migrated_router(db_path: PathBuf) -> Router {
        let api = test_api(db_path);
        must(api.migrate());
        app(test_state(api))
    }

    fn get_request(uri: &str) -> Request<axum::body::Body> {
        must(Request::builder().uri(uri).method("GET").body(axum::body::Body::empty()))
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<axum::body::Body> {
        must(
            Request::builder()
                .uri(uri)
                .method("POST")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
        )
    }

    fn post_json_signed(
        uri: &str,
        body: &serde_json::Value,
        signature: &str,
    ) -> Request<axum::body::Body> {
        must(
            Request::builder()
                .uri(uri)
                .method("POST")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, signature)
                .body(axum::body::Body::from(body.to_string())),
        )
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = must(to_bytes(response.into_body(), 1024 * 1024).await);
        let body = must(String::from_utf8(bytes.to_vec()));
        must(serde_json::from_str(&body))
    }

    fn error_code(value: &serde_json::Value) -> Option<&str> {
        value.get("error").and_then(|error| error.get("code")).and_then(serde_json::Value::as_str)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok_with_telemetry() {
        let router = app(test_state(test_api(unique_temp_db_path())));

        let response = must(router.oneshot(get_request("/v1/health")).await);
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("contract_version").and_then(serde_json::Value::as_str),
            Some(CONTRACT_VERSION)
        );
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("telemetry"))
                .and_then(|telemetry| telemetry.get("requests_total"))
                .and_then(serde_json::Value::as_u64),
            Some(0)
        );
    }

    #[tokio::test]
    async fn ready_flips_after_migration() {
        let db_path = unique_temp_db_path();
        let api = test_api(db_path.clone());
        let router = app(test_state(api));

        let before = must(router.clone().oneshot(get_request("/v1/ready")).await);
        assert_eq!(before.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = response_json(before).await;
        assert_eq!(error_code(&value), Some("schema_unavailable"));

        let migrate = must(router.clone().oneshot(post_json("/v1/db/migrate", &json!({}))).await);
        assert_eq!(migrate.status(), StatusCode::OK);

        let after = must(router.oneshot(get_request("/v1/ready")).await);
        assert_eq!(after.status(), StatusCode::OK);
        let value = response_json(after).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("status"))
                .and_then(serde_json::Value::as_str),
            Some("ready")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn session_flow_round_trips_over_http() {
        let db_path = unique_temp_db_path();
        let router = migrated_router(db_path.clone());

        let issued = must(
            router
                .clone()
                .oneshot(post_json("/v1/sessions/issue", &json!({"participant_id": "p_http_1"})))
                .await,
        );
        assert_eq!(issued.status(), StatusCode::OK);
        let issued = response_json(issued).await;
        let token = issued
            .get("data")
            .and_then(|data| data.get("token"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.token in response: {issued}"))
            .to_string();

        let validated = must(
            router
                .clone()
                .oneshot(post_json("/v1/sessions/validate", &json!({"token": token})))
                .await,
        );
        assert_eq!(validated.status(), StatusCode::OK);

        let linked = must(
            router
                .clone()
                .oneshot(post_json(
                    "/v1/sessions/link-call",
                    &json!({
                        "token": token,
                        "participant_id": "p_http_1",
                        "call_id": "call-http-0001",
                    }),
                ))
                .await,
        );
        assert_eq!(linked.status(), StatusCode::OK);

        // Single-use linking: the second call id is refused.
        let relinked = must(
            router
                .clone()
                .oneshot(post_json(
                    "/v1/sessions/link-call",
                    &json!({
                        "token": token,
                        "participant_id": "p_http_1",
                        "call_id": "call-http-0002",
                    }),
                ))
                .await,
        );
        assert_eq!(relinked.status(), StatusCode::CONFLICT);

        let completed = must(
            router
                .clone()
                .oneshot(post_json("/v1/sessions/complete", &json!({"token": token})))
                .await,
        );
        assert_eq!(completed.status(), StatusCode::OK);

        let revalidated = must(
            router.oneshot(post_json("/v1/sessions/validate", &json!({"token": token}))).await,
        );
        assert_eq!(revalidated.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn synthetic_assignment_returns_fallback_condition() {
        let db_path = unique_temp_db_path();
        let router = migrated_router(db_path.clone());

        let response = must(
            router.oneshot(post_json("/v1/conditions/assign", &json!({}))).await,
        );
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("condition"))
                .and_then(serde_json::Value::as_str),
            Some("informal")
        );
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("degraded"))
                .and_then(serde_json::Value::as_bool),
            Some(false)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn webhook_rejects_bad_signature_and_accepts_redelivery() {
        let db_path = unique_temp_db_path();
        let router = migrated_router(db_path.clone());
        let body = json!({"callId": "call-hook-0001", "participantId": "p_hook_1"});

        let unsigned =
            must(router.clone().oneshot(post_json("/v1/webhooks/call-status", &body)).await);
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);
        let value = response_json(unsigned).await;
        assert_eq!(error_code(&value), Some("unauthorized"));

        let first = must(
            router
                .clone()
                .oneshot(post_json_signed("/v1/webhooks/call-status", &body, TEST_SECRET))
                .await,
        );
        assert_eq!(first.status(), StatusCode::OK);
        let first = response_json(first).await;
        assert_eq!(
            first
                .get("data")
                .and_then(|data| data.get("inserted"))
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let redelivered = must(
            router
                .oneshot(post_json_signed("/v1/webhooks/call-status", &body, TEST_SECRET))
                .await,
        );
        assert_eq!(redelivered.status(), StatusCode::OK);
        let redelivered = response_json(redelivered).await;
        assert_eq!(
            redelivered
                .get("data")
                .and_then(|data| data.get("inserted"))
                .and_then(serde_json::Value::as_bool),
            Some(false)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn draft_submit_without_pending_draft_is_a_conflict() {
        let db_path = unique_temp_db_path();
        let router = migrated_router(db_path.clone());

        let response = must(
            router
                .oneshot(post_json(
                    "/v1/drafts/submit",
                    &json!({"participant_id": "p_draft_1", "payload": {"q1": "agree"}}),
                ))
                .await,
        );
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("conflict"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn empty_batch_submission_is_a_bad_request() {
        let db_path = unique_temp_db_path();
        let router = migrated_router(db_path.clone());

        let response = must(
            router
                .oneshot(post_json("/v1/evaluations/submit-batch", &json!({"call_ids": []})))
                .await,
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("bad_request"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn result_callback_requires_signature_and_applies_idempotently() {
        let db_path = unique_temp_db_path();
        let router = migrated_router(db_path.clone());
        let body = json!({
            "call_id": "call-res-0001",
            "status": "completed",
            "result": {"score": 4},
        });

        let unsigned =
            must(router.clone().oneshot(post_json("/v1/evaluations/results", &body)).await);
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

        let first = must(
            router
                .clone()
                .oneshot(post_json_signed("/v1/evaluations/results", &body, TEST_SECRET))
                .await,
        );
        assert_eq!(first.status(), StatusCode::OK);
        let first = response_json(first).await;
        assert_eq!(
            first
                .get("data")
                .and_then(|data| data.get("changed"))
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let second = must(
            router.oneshot(post_json_signed("/v1/evaluations/results", &body, TEST_SECRET)).await,
        );
        assert_eq!(second.status(), StatusCode::OK);
        let second = response_json(second).await;
        assert_eq!(
            second
                .get("data")
                .and_then(|data| data.get("changed"))
                .and_then(serde_json::Value::as_bool),
            Some(false)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn invalid_json_payload_returns_machine_readable_error() {
        let db_path = unique_temp_db_path();
        let router = migrated_router(db_path.clone());

        let request = must(
            Request::builder()
                .uri("/v1/sessions/issue")
                .method("POST")
                .header("content-type", "application/json")
                .body(axum::body::Body::from("{".to_string())),
        );
        let response = must(router.oneshot(request).await);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("invalid_json"));
        assert_eq!(
            value.get("contract_version").and_then(serde_json::Value::as_str),
            Some(CONTRACT_VERSION)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn run_listing_is_empty_on_a_fresh_database() {
        let db_path = unique_temp_db_path();
        let router = migrated_router(db_path.clone());

        let response = must(router.oneshot(get_request("/v1/evaluations/runs?limit=5")).await);
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.get("data"), Some(&json!([])));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn blocking_operation_times_out_with_storage_status() {
        let mut state = test_state(test_api(unique_temp_db_path()));
        state.operation_timeout = Duration::from_millis(1);

        let result = state
            .run_blocking("slow_operation", |_api| {
                std::thread::sleep(Duration::from_millis(25));
                Ok::<_, CoordError>(())
            })
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(err.code, "operation_timeout");
                assert!(err.details.is_some());
            }
        }
        assert_eq!(state.telemetry.snapshot().timeout_total, 1);
    }

    #[tokio::test]
    async fn telemetry_tracks_success_and_failure_counts() {
        let state = test_state(test_api(unique_temp_db_path()));

        let success =
            state.run_blocking("fast_operation", |_api| Ok::<_, CoordError>(1_u32)).await;
        assert!(success.is_ok());

        let failed = state
            .run_blocking("failing_operation", |_api| {
                Err::<u32, _>(CoordError::Conflict("already terminal".to_string()))
            })
            .await;
        assert!(failed.is_err());

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success_total, 1);
        assert_eq!(snapshot.requests_failure_total, 1);
        assert_eq!(snapshot.conflict_total, 1);
    }
}
