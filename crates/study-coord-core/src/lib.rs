//! Domain types and contracts for the study coordination engine.
//!
//! Everything here is storage-free: identifier shapes, the condition and
//! status vocabularies, the error taxonomy shared by every crate, webhook
//! envelope parsing, and UTC timestamp helpers. The sqlite store and the
//! service/cli surfaces build on these types.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use uuid::Uuid;

/// Maximum number of call ids accepted by a single evaluation batch.
pub const MAX_BATCH_SIZE: usize = 25;

/// Default metric evaluated when a batch does not name one.
pub const DEFAULT_METRIC_ID: &str = "conversation_quality";

/// Default session token lifetime.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

/// Default idle cutoff after which pending drafts are swept to abandoned.
pub const DEFAULT_SWEEP_CUTOFF_MINUTES: i64 = 90;

/// Exact length of a real (externally recruited) participant identifier.
pub const REAL_PARTICIPANT_ID_LEN: usize = 24;

const MAX_PARTICIPANT_ID_LEN: usize = 64;
const MIN_CALL_ID_LEN: usize = 8;
const MAX_CALL_ID_LEN: usize = 64;
const MAX_METRIC_ID_LEN: usize = 64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoordError {
    /// Malformed or out-of-range input. Callers must not retry.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Signature, secret, or token failure. Fail-closed, never retried.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Resource already in a terminal or exclusive state. Re-check before
    /// retrying.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Third-party platform failure. Retryable; surfaced per item in batch
    /// results.
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// Store unavailable. Transport-level retries are safe under the
    /// idempotency contracts.
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Formal,
    Informal,
}

impl Condition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Formal => "formal",
            Self::Informal => "informal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "formal" => Some(Self::Formal),
            "informal" => Some(Self::Informal),
            _ => None,
        }
    }

    /// Parses a comma-separated warm-up sequence such as
    /// `formal,informal,formal`.
    ///
    /// # Errors
    /// Returns [`CoordError::BadRequest`] when any entry is not a known
    /// condition name.
    pub fn parse_sequence(raw: &str) -> Result<Vec<Self>, CoordError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        trimmed
            .split(',')
            .map(|entry| {
                let entry = entry.trim();
                Self::parse(entry).ok_or_else(|| {
                    CoordError::BadRequest(format!("unknown condition in sequence: {entry}"))
                })
            })
            .collect()
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Submitted,
    Abandoned,
}

impl SubmissionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "submitted" => Some(Self::Submitted),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Submitted and abandoned rows never revert to pending.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationItemStatus {
    /// In flight at the external evaluator.
    Submitted,
    /// Terminal success.
    Completed,
    /// Retryable on demand via an explicit retry flag.
    Error,
    /// Terminal: the call has no audio to evaluate, never retried.
    NoRecording,
}

impl EvaluationItemStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::NoRecording => "no_recording",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "submitted" => Some(Self::Submitted),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "no_recording" => Some(Self::NoRecording),
            _ => None,
        }
    }

    /// Terminal statuses exclude the call from future batch submissions for
    /// the same metric. `error` is terminal unless a retry is requested.
    #[must_use]
    pub fn is_terminal(self, retry_errored: bool) -> bool {
        match self {
            Self::Completed | Self::NoRecording => true,
            Self::Error => !retry_errored,
            Self::Submitted => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Durable session credential binding a participant to one study run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionToken {
    pub token: Uuid,
    pub participant_id: String,
    pub created_at: String,
    pub expires_at: String,
    pub consumed: bool,
    pub linked_call_id: Option<String>,
    pub completed: bool,
}

/// Result of a successful token validation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParticipantContext {
    pub token: Uuid,
    pub participant_id: String,
    pub expires_at: String,
    pub linked_call_id: Option<String>,
}

/// Outcome of a condition assignment, including the counter state observed
/// in the same atomic unit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Assignment {
    pub condition: Condition,
    pub formal_count: i64,
    pub informal_count: i64,
    pub offset_remaining: i64,
    pub used_offset: bool,
    /// True when the store was unreachable and the fixed fallback condition
    /// was returned instead of a balanced assignment.
    pub degraded: bool,
}

/// Outcome of reconciling one inbound call-status event.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileOutcome {
    pub call_id: String,
    pub participant_id: String,
    /// False when the call id had already been recorded (redelivery).
    pub inserted: bool,
}

/// Per-participant questionnaire progress row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DraftRecord {
    pub participant_id: String,
    pub last_step: String,
    pub submission_status: SubmissionStatus,
    pub payload_json: Option<Value>,
    pub submitted_at: Option<String>,
    pub updated_at: String,
}

/// One durable evaluation submission attempt.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvaluationRun {
    pub run_id: String,
    pub external_workflow_id: Option<String>,
    pub metric_id: String,
    pub call_ids: Vec<String>,
    pub status: RunStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Per-call evaluator output written back onto the response record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResultRecord {
    pub call_id: String,
    pub metric_id: String,
    pub status: EvaluationItemStatus,
    pub result_json: Option<Value>,
    pub last_fetched_at: String,
}

/// Handle returned to the researcher after a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunHandle {
    pub run_id: String,
    pub workflow_id: String,
    pub call_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunItem {
    pub call_id: String,
    pub status: EvaluationItemStatus,
}

/// Snapshot of a run after reconciling available results.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub items: Vec<RunItem>,
}

/// Outcome of one idempotent result write-back.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppliedResult {
    pub call_id: String,
    pub metric_id: String,
    pub status: EvaluationItemStatus,
    /// False when the stored result was already identical and only the
    /// fetch timestamp was refreshed.
    pub changed: bool,
}

/// Inbound call-status event after envelope extraction.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CallStatusEvent {
    pub call_id: String,
    pub participant_id: String,
}

impl CallStatusEvent {
    /// Extracts the call and participant identifiers from a webhook body.
    ///
    /// Accepts either the flat shape `{"callId": ..., "participantId": ...}`
    /// or the platform's status-update envelope where the call id lives at
    /// `message.call.id` and the participant id inside the call metadata.
    ///
    /// # Errors
    /// Returns [`CoordError::BadRequest`] when neither shape yields both
    /// identifiers or when an identifier fails shape validation.
    pub fn from_value(body: &Value) -> Result<Self, CoordError> {
        let (call_id, participant_id) = extract_flat(body)
            .or_else(|| extract_enveloped(body))
            .ok_or_else(|| {
                CoordError::BadRequest(
                    "event body carries no callId/participantId pair".to_string(),
                )
            })?;

        validate_call_id(&call_id)?;
        validate_participant_id(&participant_id)?;

        Ok(Self { call_id, participant_id })
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
}

fn extract_flat(body: &Value) -> Option<(String, String)> {
    let call_id = string_field(body, &["callId", "call_id"])?;
    let participant_id = string_field(body, &["participantId", "participant_id"])?;
    Some((call_id, participant_id))
}

fn extract_enveloped(body: &Value) -> Option<(String, String)> {
    let call = body.get("message")?.get("call")?;
    let call_id = string_field(call, &["id"])?;
    let participant_id = call
        .get("metadata")
        .and_then(|metadata| string_field(metadata, &["participantId", "participant_id"]))?;
    Some((call_id, participant_id))
}

fn is_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

/// Validates the general participant identifier shape: 1..=64 characters of
/// `[A-Za-z0-9_-]`.
///
/// # Errors
/// Returns [`CoordError::BadRequest`] on empty, oversized, or
/// foreign-character input.
pub fn validate_participant_id(value: &str) -> Result<(), CoordError> {
    if value.is_empty() {
        return Err(CoordError::BadRequest(
            "participant id MUST NOT be empty".to_string(),
        ));
    }
    if value.len() > MAX_PARTICIPANT_ID_LEN {
        return Err(CoordError::BadRequest(format!(
            "participant id MUST be at most {MAX_PARTICIPANT_ID_LEN} characters"
        )));
    }
    if !value.chars().all(is_id_char) {
        return Err(CoordError::BadRequest(
            "participant id MUST contain only [A-Za-z0-9_-]".to_string(),
        ));
    }
    Ok(())
}

/// Validates the platform call identifier shape: 8..=64 characters of
/// `[A-Za-z0-9_-]`.
///
/// # Errors
/// Returns [`CoordError::BadRequest`] on out-of-range or
/// foreign-character input.
pub fn validate_call_id(value: &str) -> Result<(), CoordError> {
    if value.len() < MIN_CALL_ID_LEN || value.len() > MAX_CALL_ID_LEN {
        return Err(CoordError::BadRequest(format!(
            "call id MUST be {MIN_CALL_ID_LEN}..={MAX_CALL_ID_LEN} characters"
        )));
    }
    if !value.chars().all(is_id_char) {
        return Err(CoordError::BadRequest(
            "call id MUST contain only [A-Za-z0-9_-]".to_string(),
        ));
    }
    Ok(())
}

/// Validates the evaluation metric identifier shape: 1..=64 characters of
/// `[A-Za-z0-9_-]`. Metric ids key the per-call result rows, so they get
/// the same shape discipline as the other identifiers.
///
/// # Errors
/// Returns [`CoordError::BadRequest`] on empty, oversized, or
/// foreign-character input.
pub fn validate_metric_id(value: &str) -> Result<(), CoordError> {
    if value.is_empty() || value.len() > MAX_METRIC_ID_LEN {
        return Err(CoordError::BadRequest(format!(
            "metric id MUST be 1..={MAX_METRIC_ID_LEN} characters"
        )));
    }
    if !value.chars().all(is_id_char) {
        return Err(CoordError::BadRequest(
            "metric id MUST contain only [A-Za-z0-9_-]".to_string(),
        ));
    }
    Ok(())
}

/// A real participant carries the recruitment platform's fixed-length
/// identifier; anything else is a synthetic/test participant.
#[must_use]
pub fn is_real_participant_id(value: &str) -> bool {
    value.len() == REAL_PARTICIPANT_ID_LEN && value.chars().all(|ch| ch.is_ascii_alphanumeric())
}

/// Runtime configuration shared by the api facade, cli, and service.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StudyConfig {
    pub token_ttl_hours: i64,
    pub sweep_cutoff_minutes: i64,
    /// Shared secret expected in the `x-shared-signature` webhook header.
    pub webhook_secret: String,
    /// Pre-seeded warm-up assignments consumed before count balancing.
    pub offset_sequence: Vec<Condition>,
}

impl StudyConfig {
    #[must_use]
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            token_ttl_hours: DEFAULT_TOKEN_TTL_HOURS,
            sweep_cutoff_minutes: DEFAULT_SWEEP_CUTOFF_MINUTES,
            webhook_secret: webhook_secret.into(),
            offset_sequence: Vec::new(),
        }
    }

    /// # Errors
    /// Returns [`CoordError::BadRequest`] when a bound is non-positive or
    /// the secret is blank.
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.token_ttl_hours <= 0 {
            return Err(CoordError::BadRequest(
                "token_ttl_hours MUST be >= 1".to_string(),
            ));
        }
        if self.sweep_cutoff_minutes <= 0 {
            return Err(CoordError::BadRequest(
                "sweep_cutoff_minutes MUST be >= 1".to_string(),
            ));
        }
        if self.webhook_secret.trim().is_empty() {
            return Err(CoordError::BadRequest(
                "webhook secret MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses an RFC3339 timestamp, requiring the UTC offset.
///
/// # Errors
/// Returns [`CoordError::BadRequest`] on malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CoordError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CoordError::BadRequest(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CoordError::BadRequest(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 in UTC.
///
/// # Errors
/// Returns [`CoordError::BadRequest`] when the value cannot be formatted.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoordError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CoordError::BadRequest(format!("failed to format timestamp: {err}")))
}

/// Current UTC time truncated to whole seconds, so stored RFC3339 text
/// compares lexicographically in SQL.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}
