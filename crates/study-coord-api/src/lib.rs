//! Stable embedded command surface for the study coordination engine.
//!
//! Host binaries (the HTTP service and the researcher CLI) drive every
//! operation through [`StudyCoordApi`]. The facade opens a fresh store per
//! operation — request handlers are stateless by design and the sqlite
//! database is the only coordination point — and threads the runtime
//! configuration through each call instead of keeping ambient state.

mod evaluator;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use study_coord_core::{
    validate_call_id, validate_metric_id, AppliedResult, Assignment, CallStatusEvent, Condition,
    CoordError,
    DraftRecord, EvaluationItemStatus, EvaluationRun, ParticipantContext, ReconcileOutcome,
    RunHandle, RunItem, RunReport, RunStatus, SessionToken, StudyConfig, MAX_BATCH_SIZE,
};
use study_coord_store_sqlite::SqliteStudyStore;
use ulid::Ulid;
use uuid::Uuid;

pub use evaluator::{EvaluatorClient, EvaluatorItem, HttpEvaluatorClient};

/// Study event kind appended when assignment falls back to the default.
pub const EVENT_ASSIGN_DEGRADED: &str = "assign_degraded";
/// Study event kind appended when a webhook delivery fails signature checks.
pub const EVENT_WEBHOOK_REJECTED: &str = "webhook_rejected";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaStatus {
    pub current_version: Option<i64>,
    pub target_version: i64,
}

#[derive(Debug, Clone)]
pub struct StudyCoordApi {
    db_path: PathBuf,
    config: StudyConfig,
}

impl StudyCoordApi {
    /// # Errors
    /// Returns [`CoordError::BadRequest`] when the configuration fails
    /// validation.
    pub fn new(db_path: impl Into<PathBuf>, config: StudyConfig) -> Result<Self, CoordError> {
        config.validate()?;
        Ok(Self { db_path: db_path.into(), config })
    }

    #[must_use]
    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStudyStore, CoordError> {
        SqliteStudyStore::open(&self.db_path)
    }

    /// Applies the schema and seeds the configured warm-up sequence.
    pub fn migrate(&self) -> Result<(), CoordError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.seed_offset_sequence(&self.config.offset_sequence)?;
        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus, CoordError> {
        let store = self.open_store()?;
        Ok(SchemaStatus {
            current_version: store.schema_version()?,
            target_version: SqliteStudyStore::target_schema_version(),
        })
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn issue_session(&self, participant_id: &str) -> Result<SessionToken, CoordError> {
        let mut store = self.open_store()?;
        store.issue_session(participant_id, self.config.token_ttl_hours)
    }

    /// Fail-closed: a token that does not even parse is treated the same as
    /// an unknown one.
    pub fn validate_session(&self, token: &str) -> Result<ParticipantContext, CoordError> {
        let token = parse_token(token)?;
        self.open_store()?.validate_session(token)
    }

    pub fn link_call(
        &self,
        token: &str,
        participant_id: &str,
        call_id: &str,
    ) -> Result<(), CoordError> {
        let token = parse_token(token)?;
        let mut store = self.open_store()?;
        store.link_call(token, participant_id, call_id)
    }

    pub fn complete_session(&self, token: &str) -> Result<(), CoordError> {
        let token = parse_token(token)?;
        let mut store = self.open_store()?;
        store.complete_session(token)
    }

    // ------------------------------------------------------------------
    // Condition assignment
    // ------------------------------------------------------------------

    /// Balanced assignment with the availability fallback: when the store is
    /// unreachable the participant still gets the fixed default condition,
    /// the response is flagged `degraded`, and a durable study event records
    /// the incident so researchers can quantify the skew.
    pub fn assign_condition(&self, participant_id: Option<&str>) -> Result<Assignment, CoordError> {
        let attempt = self
            .open_store()
            .and_then(|mut store| store.assign_condition(participant_id));
        match attempt {
            Ok(assignment) => Ok(assignment),
            Err(err) => {
                self.log_event_best_effort(EVENT_ASSIGN_DEGRADED, &err.to_string());
                Ok(Assignment {
                    condition: Condition::Informal,
                    formal_count: 0,
                    informal_count: 0,
                    offset_remaining: 0,
                    used_offset: false,
                    degraded: true,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Call-status webhook reconciliation
    // ------------------------------------------------------------------

    /// Verifies the shared-secret signature before touching anything, then
    /// performs the idempotent call-record insert. Redelivered events
    /// succeed with `inserted = false`.
    pub fn reconcile_call_event(
        &self,
        signature: Option<&str>,
        body: &Value,
    ) -> Result<ReconcileOutcome, CoordError> {
        if signature != Some(self.config.webhook_secret.as_str()) {
            self.log_event_best_effort(EVENT_WEBHOOK_REJECTED, "bad or missing signature");
            return Err(CoordError::Unauthorized(
                "missing or mismatched webhook signature".to_string(),
            ));
        }

        let event = CallStatusEvent::from_value(body)?;
        let mut store = self.open_store()?;
        let inserted = store.record_call(&event.call_id, &event.participant_id)?;
        Ok(ReconcileOutcome {
            call_id: event.call_id,
            participant_id: event.participant_id,
            inserted,
        })
    }

    // ------------------------------------------------------------------
    // Draft lifecycle
    // ------------------------------------------------------------------

    pub fn touch_draft(&self, participant_id: &str, step: &str) -> Result<(), CoordError> {
        let mut store = self.open_store()?;
        store.touch_draft(participant_id, step)
    }

    pub fn submit_draft(&self, participant_id: &str, payload: &Value) -> Result<(), CoordError> {
        let mut store = self.open_store()?;
        store.submit_draft(participant_id, payload)
    }

    pub fn get_draft(&self, participant_id: &str) -> Result<Option<DraftRecord>, CoordError> {
        self.open_store()?.get_draft(participant_id)
    }

    /// Sweeps stale pending drafts to abandoned; `cutoff_minutes` defaults
    /// to the configured cutoff. Returns the number of rows changed.
    pub fn sweep_abandoned(&self, cutoff_minutes: Option<i64>) -> Result<usize, CoordError> {
        let cutoff = cutoff_minutes.unwrap_or(self.config.sweep_cutoff_minutes);
        let mut store = self.open_store()?;
        store.sweep_abandoned(cutoff)
    }

    // ------------------------------------------------------------------
    // Evaluation job tracking
    // ------------------------------------------------------------------

    /// Submits a capped batch to the evaluator. Call ids with a terminal
    /// result for the metric are filtered out up front (errored items only
    /// when `retry_errored` is set). Bookkeeping always appends: a run row
    /// is written whether the upstream submission succeeded or failed, and
    /// every submitted call id is stamped so none is silently dropped.
    pub fn submit_batch(
        &self,
        client: &dyn EvaluatorClient,
        call_ids: &[String],
        metric_id: Option<&str>,
        retry_errored: bool,
    ) -> Result<RunHandle, CoordError> {
        if call_ids.is_empty() {
            return Err(CoordError::BadRequest(
                "batch MUST contain at least one call id".to_string(),
            ));
        }
        if call_ids.len() > MAX_BATCH_SIZE {
            return Err(CoordError::BadRequest(format!(
                "batch MUST contain at most {MAX_BATCH_SIZE} call ids"
            )));
        }
        for call_id in call_ids {
            validate_call_id(call_id)?;
        }
        let metric_id = metric_id.unwrap_or(study_coord_core::DEFAULT_METRIC_ID);
        validate_metric_id(metric_id)?;

        let mut store = self.open_store()?;
        let eligible = store.filter_submittable(call_ids, metric_id, retry_errored)?;
        if eligible.is_empty() {
            return Err(CoordError::Conflict(format!(
                "every call in the batch already has a terminal {metric_id} result"
            )));
        }

        let run_id = Ulid::new().to_string();
        match client.submit_batch(&eligible, metric_id) {
            Ok(workflow_id) => {
                store.record_run(
                    &run_id,
                    Some(&workflow_id),
                    metric_id,
                    &eligible,
                    RunStatus::Pending,
                    EvaluationItemStatus::Submitted,
                )?;
                Ok(RunHandle { run_id, workflow_id, call_ids: eligible })
            }
            Err(err) => {
                // The failed attempt still lands in run history and every
                // item stays visible as a retryable error.
                store.record_run(
                    &run_id,
                    None,
                    metric_id,
                    &eligible,
                    RunStatus::Failed,
                    EvaluationItemStatus::Error,
                )?;
                Err(err)
            }
        }
    }

    /// Fetches whatever the workflow has produced and reconciles it. Each
    /// item is applied in isolation; one bad item marks that call as a
    /// retryable error and the rest of the batch continues.
    pub fn poll_run(
        &self,
        client: &dyn EvaluatorClient,
        run_id: &str,
    ) -> Result<RunReport, CoordError> {
        let mut store = self.open_store()?;
        let run = store
            .get_run(run_id)?
            .ok_or_else(|| CoordError::BadRequest(format!("unknown run id: {run_id}")))?;
        let workflow_id = run.external_workflow_id.clone().ok_or_else(|| {
            CoordError::Conflict(format!("run {run_id} was never accepted upstream"))
        })?;

        let items = client.fetch_results(&workflow_id)?;
        for item in items {
            if !run.call_ids.contains(&item.call_id) {
                continue;
            }
            let applied =
                store.apply_result(&item.call_id, &run.metric_id, item.status, &item.result);
            if let Err(err) = applied {
                self.log_event_best_effort(
                    "result_apply_failed",
                    &format!("{}: {err}", item.call_id),
                );
                let _ = store.apply_result(
                    &item.call_id,
                    &run.metric_id,
                    EvaluationItemStatus::Error,
                    &Value::Null,
                );
            }
        }

        let items = store.run_item_statuses(&run)?;
        let status = run_status_from_items(&items);
        store.update_run_status(run_id, status)?;
        Ok(RunReport { run_id: run_id.to_string(), status, items })
    }

    /// Direct idempotent write-back, used by the evaluator's result
    /// callback.
    pub fn apply_result(
        &self,
        call_id: &str,
        metric_id: Option<&str>,
        status: EvaluationItemStatus,
        result: &Value,
    ) -> Result<AppliedResult, CoordError> {
        let metric_id = metric_id.unwrap_or(study_coord_core::DEFAULT_METRIC_ID);
        let mut store = self.open_store()?;
        store.apply_result(call_id, metric_id, status, result)
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<EvaluationRun>, CoordError> {
        self.open_store()?.list_runs(limit)
    }

    fn log_event_best_effort(&self, kind: &str, detail: &str) {
        if let Ok(mut store) = self.open_store() {
            let _ = store.append_study_event(kind, detail);
        }
    }
}

fn parse_token(token: &str) -> Result<Uuid, CoordError> {
    Uuid::parse_str(token.trim())
        .map_err(|_| CoordError::Unauthorized("malformed session token".to_string()))
}

fn run_status_from_items(items: &[RunItem]) -> RunStatus {
    if items
        .iter()
        .any(|item| item.status == EvaluationItemStatus::Submitted)
    {
        return RunStatus::Pending;
    }
    let errored = items
        .iter()
        .filter(|item| item.status == EvaluationItemStatus::Error)
        .count();
    if errored == 0 {
        RunStatus::Completed
    } else if errored == items.len() {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn must<T>(result: Result<T, CoordError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_api(dir: &TempDir) -> StudyCoordApi {
        let mut config = StudyConfig::new("secret-1");
        config.offset_sequence = Vec::new();
        let api = must(StudyCoordApi::new(dir.path().join("study.sqlite3"), config));
        must(api.migrate());
        api
    }

    fn tempdir() -> TempDir {
        match TempDir::new() {
            Ok(dir) => dir,
            Err(err) => panic!("tempdir failed: {err}"),
        }
    }

    struct MockEvaluator {
        submissions: RefCell<Vec<(Vec<String>, String)>>,
        submit_response: Result<String, CoordError>,
        fetch_responses: RefCell<VecDeque<Result<Vec<EvaluatorItem>, CoordError>>>,
    }

    impl MockEvaluator {
        fn accepting(workflow_id: &str) -> Self {
            Self {
                submissions: RefCell::new(Vec::new()),
                submit_response: Ok(workflow_id.to_string()),
                fetch_responses: RefCell::new(VecDeque::new()),
            }
        }

        fn failing() -> Self {
            Self {
                submissions: RefCell::new(Vec::new()),
                submit_response: Err(CoordError::Upstream("evaluator offline".to_string())),
                fetch_responses: RefCell::new(VecDeque::new()),
            }
        }

        fn queue_fetch(&self, items: Vec<EvaluatorItem>) {
            self.fetch_responses.borrow_mut().push_back(Ok(items));
        }
    }

    impl EvaluatorClient for MockEvaluator {
        fn submit_batch(
            &self,
            call_ids: &[String],
            metric_id: &str,
        ) -> Result<String, CoordError> {
            self.submissions
                .borrow_mut()
                .push((call_ids.to_vec(), metric_id.to_string()));
            self.submit_response.clone()
        }

        fn fetch_results(&self, _workflow_id: &str) -> Result<Vec<EvaluatorItem>, CoordError> {
            self.fetch_responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn item(call_id: &str, status: EvaluationItemStatus, result: Value) -> EvaluatorItem {
        EvaluatorItem { call_id: call_id.to_string(), status, result }
    }

    #[test]
    fn submit_batch_filters_terminal_calls_and_records_run() {
        let dir = tempdir();
        let api = fixture_api(&dir);
        must(api.apply_result(
            "call-done-0001",
            None,
            EvaluationItemStatus::Completed,
            &json!({"score": 5}),
        ));

        let evaluator = MockEvaluator::accepting("wf-1");
        let batch: Vec<String> = vec!["call-new-0001".into(), "call-done-0001".into()];
        let handle = must(api.submit_batch(&evaluator, &batch, None, false));

        assert_eq!(handle.workflow_id, "wf-1");
        assert_eq!(handle.call_ids, vec!["call-new-0001".to_string()]);
        assert_eq!(
            evaluator.submissions.borrow().as_slice(),
            &[(
                vec!["call-new-0001".to_string()],
                "conversation_quality".to_string()
            )]
        );

        let runs = must(api.list_runs(10));
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Pending);
        assert_eq!(runs[0].run_id, handle.run_id);
    }

    #[test]
    fn submit_batch_rejects_oversized_empty_and_fully_terminal_batches() {
        let dir = tempdir();
        let api = fixture_api(&dir);
        let evaluator = MockEvaluator::accepting("wf-1");

        assert!(matches!(
            api.submit_batch(&evaluator, &[], None, false),
            Err(CoordError::BadRequest(_))
        ));

        let oversized: Vec<String> = (0..=MAX_BATCH_SIZE)
            .map(|n| format!("call-over-{n:04}"))
            .collect();
        assert!(matches!(
            api.submit_batch(&evaluator, &oversized, None, false),
            Err(CoordError::BadRequest(_))
        ));

        let batch: Vec<String> = vec!["call-new-0009".into()];
        assert!(matches!(
            api.submit_batch(&evaluator, &batch, Some("bad metric"), false),
            Err(CoordError::BadRequest(_))
        ));

        must(api.apply_result(
            "call-done-0002",
            None,
            EvaluationItemStatus::NoRecording,
            &json!({}),
        ));
        let terminal: Vec<String> = vec!["call-done-0002".into()];
        assert!(matches!(
            api.submit_batch(&evaluator, &terminal, None, false),
            Err(CoordError::Conflict(_))
        ));
        assert!(evaluator.submissions.borrow().is_empty());
    }

    #[test]
    fn failed_upstream_submission_records_failed_run_with_retryable_items() {
        let dir = tempdir();
        let api = fixture_api(&dir);
        let batch: Vec<String> = vec!["call-fff-0001".into()];

        let offline = MockEvaluator::failing();
        let err = api.submit_batch(&offline, &batch, None, false);
        assert!(matches!(err, Err(CoordError::Upstream(_))), "got {err:?}");

        let runs = must(api.list_runs(10));
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].external_workflow_id, None);

        // Without the retry flag the errored item is now terminal.
        let online = MockEvaluator::accepting("wf-2");
        assert!(matches!(
            api.submit_batch(&online, &batch, None, false),
            Err(CoordError::Conflict(_))
        ));

        // Explicit retry resubmits it.
        let handle = must(api.submit_batch(&online, &batch, None, true));
        assert_eq!(handle.call_ids, batch);
    }

    #[test]
    fn poll_run_applies_items_in_isolation_and_tracks_status() {
        let dir = tempdir();
        let api = fixture_api(&dir);
        let evaluator = MockEvaluator::accepting("wf-3");
        let batch: Vec<String> = vec!["call-ggg-0001".into(), "call-hhh-0001".into()];
        let handle = must(api.submit_batch(&evaluator, &batch, None, false));

        // Nothing back yet: the run stays pending.
        evaluator.queue_fetch(Vec::new());
        let report = must(api.poll_run(&evaluator, &handle.run_id));
        assert_eq!(report.status, RunStatus::Pending);

        // Partial delivery with one error and one foreign call id.
        evaluator.queue_fetch(vec![
            item("call-ggg-0001", EvaluationItemStatus::Completed, json!({"score": 4})),
            item("call-hhh-0001", EvaluationItemStatus::Error, json!({"reason": "timeout"})),
            item("call-foreign-1", EvaluationItemStatus::Completed, json!({})),
        ]);
        let report = must(api.poll_run(&evaluator, &handle.run_id));
        assert_eq!(report.status, RunStatus::Partial);
        assert!(must(api.list_runs(1))[0].status == RunStatus::Partial);

        // The retried item eventually completes.
        evaluator.queue_fetch(vec![item(
            "call-hhh-0001",
            EvaluationItemStatus::Completed,
            json!({"score": 2}),
        )]);
        let report = must(api.poll_run(&evaluator, &handle.run_id));
        assert_eq!(report.status, RunStatus::Completed);

        assert!(matches!(
            api.poll_run(&evaluator, "missing-run"),
            Err(CoordError::BadRequest(_))
        ));
    }

    #[test]
    fn reconcile_verifies_signature_then_inserts_once() {
        let dir = tempdir();
        let api = fixture_api(&dir);
        let body = json!({
            "callId": "call-web-0001",
            "participantId": "5f8a9b2c3d4e5f6a7b8c9d0e"
        });

        let err = api.reconcile_call_event(Some("wrong"), &body);
        assert!(matches!(err, Err(CoordError::Unauthorized(_))), "got {err:?}");
        let err = api.reconcile_call_event(None, &body);
        assert!(matches!(err, Err(CoordError::Unauthorized(_))), "got {err:?}");

        let first = must(api.reconcile_call_event(Some("secret-1"), &body));
        assert!(first.inserted);
        let second = must(api.reconcile_call_event(Some("secret-1"), &body));
        assert!(!second.inserted);

        assert!(matches!(
            api.reconcile_call_event(Some("secret-1"), &json!({"callId": "call-web-0002"})),
            Err(CoordError::BadRequest(_))
        ));
    }

    #[test]
    fn assignment_survives_store_loss_in_degraded_mode() {
        let config = StudyConfig::new("secret-1");
        let api = must(StudyCoordApi::new(
            "/nonexistent/study-coord/degraded.sqlite3",
            config,
        ));

        let assignment = must(api.assign_condition(Some("5f8a9b2c3d4e5f6a7b8c9d0e")));
        assert!(assignment.degraded);
        assert_eq!(assignment.condition, Condition::Informal);
    }

    #[test]
    fn session_flow_through_the_facade() {
        let dir = tempdir();
        let api = fixture_api(&dir);
        let issued = must(api.issue_session("5f8a9b2c3d4e5f6a7b8c9d0e"));

        let context = must(api.validate_session(&issued.token.to_string()));
        assert_eq!(context.participant_id, "5f8a9b2c3d4e5f6a7b8c9d0e");

        assert!(matches!(
            api.validate_session("not-a-uuid"),
            Err(CoordError::Unauthorized(_))
        ));

        must(api.link_call(
            &issued.token.to_string(),
            "5f8a9b2c3d4e5f6a7b8c9d0e",
            "call-lll-0001",
        ));
        assert!(matches!(
            api.link_call(
                &issued.token.to_string(),
                "5f8a9b2c3d4e5f6a7b8c9d0e",
                "call-lll-0002",
            ),
            Err(CoordError::Conflict(_))
        ));
        must(api.complete_session(&issued.token.to_string()));
        assert!(matches!(
            api.validate_session(&issued.token.to_string()),
            Err(CoordError::Unauthorized(_))
        ));
    }

    #[test]
    fn sweep_uses_configured_default_cutoff() {
        let dir = tempdir();
        let api = fixture_api(&dir);
        must(api.touch_draft("5f8a9b2c3d4e5f6a7b8c9d0e", "intro"));
        assert_eq!(must(api.sweep_abandoned(None)), 0);
        assert_eq!(must(api.sweep_abandoned(Some(1))), 0);
    }
}
