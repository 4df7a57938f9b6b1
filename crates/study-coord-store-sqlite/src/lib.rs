#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite persistence for the study coordination engine.
//!
//! All cross-request coordination happens through this store; request
//! handlers are stateless. The three operations that need a serializable
//! check-and-set unit (condition assignment, token→call linking, call-id
//! uniqueness) run inside immediate transactions or rely on primary-key
//! `INSERT OR IGNORE`. Everything else is a keyed, idempotent upsert.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use study_coord_core::{
    format_rfc3339, is_real_participant_id, now_utc, validate_call_id, validate_metric_id,
    validate_participant_id, AppliedResult, Assignment, Condition, CoordError, DraftRecord,
    EvaluationItemStatus, EvaluationResultRecord, EvaluationRun, ParticipantContext, RunItem,
    RunStatus, SessionToken, SubmissionStatus,
};
use time::Duration;
use uuid::Uuid;

const STUDY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_STUDY_V1: &str = r"
CREATE TABLE IF NOT EXISTS session_tokens (
  token TEXT PRIMARY KEY,
  participant_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  consumed INTEGER NOT NULL DEFAULT 0 CHECK (consumed IN (0, 1)),
  linked_call_id TEXT,
  completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_session_tokens_participant
  ON session_tokens(participant_id, completed, expires_at);

CREATE TRIGGER IF NOT EXISTS trg_session_tokens_no_delete
BEFORE DELETE ON session_tokens
BEGIN
  SELECT RAISE(FAIL, 'session_tokens is an append-only audit trail');
END;

CREATE TABLE IF NOT EXISTS condition_counters (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  formal_count INTEGER NOT NULL DEFAULT 0 CHECK (formal_count >= 0),
  informal_count INTEGER NOT NULL DEFAULT 0 CHECK (informal_count >= 0),
  offset_cursor INTEGER NOT NULL DEFAULT 0 CHECK (offset_cursor >= 0)
);

CREATE TABLE IF NOT EXISTS condition_offsets (
  slot INTEGER PRIMARY KEY CHECK (slot >= 0),
  condition TEXT NOT NULL CHECK (condition IN ('formal', 'informal'))
);

CREATE TABLE IF NOT EXISTS call_records (
  call_id TEXT PRIMARY KEY,
  participant_id TEXT NOT NULL,
  linked_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_call_records_participant
  ON call_records(participant_id, linked_at);

CREATE TABLE IF NOT EXISTS draft_records (
  participant_id TEXT PRIMARY KEY,
  last_step TEXT NOT NULL,
  submission_status TEXT NOT NULL DEFAULT 'pending'
    CHECK (submission_status IN ('pending', 'submitted', 'abandoned')),
  payload_json TEXT,
  submitted_at TEXT,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_draft_records_status_updated
  ON draft_records(submission_status, updated_at);

CREATE TABLE IF NOT EXISTS evaluation_runs (
  run_id TEXT PRIMARY KEY,
  external_workflow_id TEXT,
  metric_id TEXT NOT NULL,
  call_ids_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'partial', 'failed')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evaluation_results (
  call_id TEXT NOT NULL,
  metric_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('submitted', 'completed', 'error', 'no_recording')),
  result_json TEXT,
  last_fetched_at TEXT NOT NULL,
  PRIMARY KEY (call_id, metric_id)
);

CREATE TABLE IF NOT EXISTS study_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL,
  detail TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_study_events_no_update
BEFORE UPDATE ON study_events
BEGIN
  SELECT RAISE(FAIL, 'study_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_study_events_no_delete
BEFORE DELETE ON study_events
BEGIN
  SELECT RAISE(FAIL, 'study_events is append-only');
END;
";

fn db_err(err: rusqlite::Error) -> CoordError {
    CoordError::Storage(err.to_string())
}

fn bump(formal: i64, informal: i64, condition: Condition) -> (i64, i64) {
    match condition {
        Condition::Formal => (formal + 1, informal),
        Condition::Informal => (formal, informal + 1),
    }
}

pub struct SqliteStudyStore {
    conn: Connection,
}

impl SqliteStudyStore {
    pub fn open(path: &Path) -> Result<Self, CoordError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err)?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn migrate(&self) -> Result<(), CoordError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(db_err)?;

        self.conn.execute_batch(SCHEMA_STUDY_V1).map_err(db_err)?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STUDY_MIGRATION_VERSION, now],
            )
            .map_err(db_err)?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO condition_counters(id, formal_count, informal_count, offset_cursor)
                 VALUES (1, 0, 0, 0)",
                [],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>, CoordError> {
        let table: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if table.is_none() {
            return Ok(None);
        }
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .map_err(db_err)
    }

    #[must_use]
    pub fn target_schema_version() -> i64 {
        STUDY_MIGRATION_VERSION
    }

    /// Seeds the warm-up offset sequence. Idempotent by slot index, so
    /// repeated seeding with the same sequence is a no-op.
    pub fn seed_offset_sequence(&mut self, sequence: &[Condition]) -> Result<usize, CoordError> {
        let tx = self.conn.transaction().map_err(db_err)?;
        let mut inserted = 0;
        for (slot, condition) in sequence.iter().enumerate() {
            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO condition_offsets(slot, condition) VALUES (?1, ?2)",
                    params![i64::try_from(slot).unwrap_or(i64::MAX), condition.as_str()],
                )
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(inserted)
    }

    // ------------------------------------------------------------------
    // Session coordination
    // ------------------------------------------------------------------

    /// Issues a fresh session token. Fails with [`CoordError::Conflict`]
    /// when the participant already has a token carrying an active call,
    /// which rate-limits each participant to one concurrent call.
    pub fn issue_session(
        &mut self,
        participant_id: &str,
        ttl_hours: i64,
    ) -> Result<SessionToken, CoordError> {
        validate_participant_id(participant_id)?;
        let now = now_utc();
        let created_at = format_rfc3339(now)?;
        let expires_at = format_rfc3339(now + Duration::hours(ttl_hours))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let active: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM session_tokens
                 WHERE participant_id = ?1
                   AND linked_call_id IS NOT NULL
                   AND completed = 0
                   AND expires_at > ?2",
                params![participant_id, created_at],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if active > 0 {
            return Err(CoordError::Conflict(format!(
                "participant {participant_id} already has a call in progress"
            )));
        }

        let token = Uuid::new_v4();
        tx.execute(
            "INSERT INTO session_tokens(token, participant_id, created_at, expires_at, consumed, linked_call_id, completed)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, 0)",
            params![token.to_string(), participant_id, created_at, expires_at],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        Ok(SessionToken {
            token,
            participant_id: participant_id.to_string(),
            created_at,
            expires_at,
            consumed: false,
            linked_call_id: None,
            completed: false,
        })
    }

    pub fn get_session(&self, token: Uuid) -> Result<Option<SessionToken>, CoordError> {
        self.conn
            .query_row(
                "SELECT token, participant_id, created_at, expires_at, consumed, linked_call_id, completed
                 FROM session_tokens WHERE token = ?1",
                params![token.to_string()],
                parse_token_row,
            )
            .optional()
            .map_err(db_err)
    }

    /// Fail-closed validation: absent, expired, and completed sessions are
    /// all rejected as unauthorized. Re-validation of a live session always
    /// succeeds; only call-linking is single-use.
    pub fn validate_session(&self, token: Uuid) -> Result<ParticipantContext, CoordError> {
        let now = format_rfc3339(now_utc())?;
        let record = self
            .get_session(token)?
            .ok_or_else(|| CoordError::Unauthorized("unknown session token".to_string()))?;

        if record.completed {
            return Err(CoordError::Unauthorized(
                "session already completed".to_string(),
            ));
        }
        if record.expires_at <= now {
            return Err(CoordError::Unauthorized("session token expired".to_string()));
        }

        Ok(ParticipantContext {
            token: record.token,
            participant_id: record.participant_id,
            expires_at: record.expires_at,
            linked_call_id: record.linked_call_id,
        })
    }

    /// Atomically links a call to the session. The check-then-set is a
    /// single conditional UPDATE so two concurrent requests can never both
    /// attach a call id to the same token, and the embedded NOT EXISTS
    /// guard keeps a participant holding several live tokens down to one
    /// call in progress at a time.
    pub fn link_call(
        &mut self,
        token: Uuid,
        participant_id: &str,
        call_id: &str,
    ) -> Result<(), CoordError> {
        validate_participant_id(participant_id)?;
        validate_call_id(call_id)?;
        let now = format_rfc3339(now_utc())?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let changed = tx
            .execute(
                "UPDATE session_tokens
                 SET linked_call_id = ?1, consumed = 1
                 WHERE token = ?2
                   AND participant_id = ?3
                   AND linked_call_id IS NULL
                   AND completed = 0
                   AND expires_at > ?4
                   AND NOT EXISTS (
                     SELECT 1 FROM session_tokens other
                     WHERE other.participant_id = ?3
                       AND other.token <> ?2
                       AND other.linked_call_id IS NOT NULL
                       AND other.completed = 0
                       AND other.expires_at > ?4
                   )",
                params![call_id, token.to_string(), participant_id, now],
            )
            .map_err(db_err)?;

        if changed == 1 {
            tx.commit().map_err(db_err)?;
            return Ok(());
        }

        // Diagnostic re-read inside the same transaction to report why the
        // conditional update matched nothing.
        let row: Option<(String, Option<String>, bool, String)> = tx
            .query_row(
                "SELECT participant_id, linked_call_id, completed, expires_at
                 FROM session_tokens WHERE token = ?1",
                params![token.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(db_err)?;

        match row {
            None => Err(CoordError::Unauthorized("unknown session token".to_string())),
            Some((owner, _, _, _)) if owner != participant_id => Err(CoordError::Unauthorized(
                "session token does not belong to this participant".to_string(),
            )),
            Some((_, _, true, _)) => Err(CoordError::Unauthorized(
                "session already completed".to_string(),
            )),
            Some((_, Some(_), _, _)) => Err(CoordError::Conflict(
                "session already linked to a call".to_string(),
            )),
            Some((_, None, false, expires_at)) if expires_at <= now => {
                Err(CoordError::Unauthorized("session token expired".to_string()))
            }
            Some(_) => {
                // The token itself is live and unlinked, so the blocked
                // update means another of this participant's tokens is
                // carrying an active call.
                let other_active: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM session_tokens
                         WHERE participant_id = ?1
                           AND token <> ?2
                           AND linked_call_id IS NOT NULL
                           AND completed = 0
                           AND expires_at > ?3",
                        params![participant_id, token.to_string(), now],
                        |row| row.get(0),
                    )
                    .map_err(db_err)?;
                if other_active > 0 {
                    Err(CoordError::Conflict(format!(
                        "participant {participant_id} already has a call in progress"
                    )))
                } else {
                    Err(CoordError::Storage(
                        "link update matched no rows for a live session".to_string(),
                    ))
                }
            }
        }
    }

    /// One-way completion flag. Idempotent: completing an already completed
    /// session is a no-op.
    pub fn complete_session(&mut self, token: Uuid) -> Result<(), CoordError> {
        let changed = self
            .conn
            .execute(
                "UPDATE session_tokens SET completed = 1 WHERE token = ?1",
                params![token.to_string()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(CoordError::Unauthorized("unknown session token".to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Condition balancing
    // ------------------------------------------------------------------

    /// Assigns a condition inside one immediate transaction: the counter
    /// state observed, the offset cursor advance, and the count increment
    /// all commit together or not at all.
    pub fn assign_condition(
        &mut self,
        participant_id: Option<&str>,
    ) -> Result<Assignment, CoordError> {
        let real = participant_id.is_some_and(is_real_participant_id);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let (formal, informal, cursor): (i64, i64, i64) = tx
            .query_row(
                "SELECT formal_count, informal_count, offset_cursor FROM condition_counters WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(db_err)?;
        let total_offsets: i64 = tx
            .query_row("SELECT COUNT(*) FROM condition_offsets", [], |row| row.get(0))
            .map_err(db_err)?;
        let remaining = total_offsets - cursor;

        let assignment = if !real {
            // Synthetic traffic must never influence real-participant
            // balance: fixed condition, no counter or cursor movement.
            Assignment {
                condition: Condition::Informal,
                formal_count: formal,
                informal_count: informal,
                offset_remaining: remaining,
                used_offset: false,
                degraded: false,
            }
        } else if remaining > 0 {
            let raw: String = tx
                .query_row(
                    "SELECT condition FROM condition_offsets WHERE slot = ?1",
                    params![cursor],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            let condition = Condition::parse(&raw).ok_or_else(|| {
                CoordError::Storage(format!("corrupt offset slot {cursor}: {raw}"))
            })?;
            // Warm-up slots advance the cursor only. Keeping them out of
            // the balance counters means the drift bound holds for every
            // post-warm-up prefix no matter how skewed the seed was.
            tx.execute(
                "UPDATE condition_counters SET offset_cursor = ?1 WHERE id = 1",
                params![cursor + 1],
            )
            .map_err(db_err)?;
            Assignment {
                condition,
                formal_count: formal,
                informal_count: informal,
                offset_remaining: remaining - 1,
                used_offset: true,
                degraded: false,
            }
        } else {
            let condition = if formal <= informal {
                Condition::Formal
            } else {
                Condition::Informal
            };
            let (formal, informal) = bump(formal, informal, condition);
            tx.execute(
                "UPDATE condition_counters SET formal_count = ?1, informal_count = ?2 WHERE id = 1",
                params![formal, informal],
            )
            .map_err(db_err)?;
            Assignment {
                condition,
                formal_count: formal,
                informal_count: informal,
                offset_remaining: 0,
                used_offset: false,
                degraded: false,
            }
        };

        tx.commit().map_err(db_err)?;
        Ok(assignment)
    }

    /// Counter state for observability: (formal, informal, offset cursor).
    pub fn counter_snapshot(&self) -> Result<(i64, i64, i64), CoordError> {
        self.conn
            .query_row(
                "SELECT formal_count, informal_count, offset_cursor FROM condition_counters WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(db_err)
    }

    // ------------------------------------------------------------------
    // Call linkage reconciliation
    // ------------------------------------------------------------------

    /// Idempotent call-record insert keyed on the platform call id.
    /// Returns false when the call had already been recorded, which is a
    /// success for at-least-once webhook delivery.
    pub fn record_call(&mut self, call_id: &str, participant_id: &str) -> Result<bool, CoordError> {
        validate_call_id(call_id)?;
        validate_participant_id(participant_id)?;
        let linked_at = format_rfc3339(now_utc())?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO call_records(call_id, participant_id, linked_at)
                 VALUES (?1, ?2, ?3)",
                params![call_id, participant_id, linked_at],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    pub fn get_call_record(
        &self,
        call_id: &str,
    ) -> Result<Option<(String, String)>, CoordError> {
        self.conn
            .query_row(
                "SELECT participant_id, linked_at FROM call_records WHERE call_id = ?1",
                params![call_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)
    }

    // ------------------------------------------------------------------
    // Draft lifecycle
    // ------------------------------------------------------------------

    /// Keyed upsert of the participant's progress row. Creates the row as
    /// pending; existing rows only move their step and timestamp, the
    /// status column is never touched here so terminal states stick.
    pub fn touch_draft(&mut self, participant_id: &str, step: &str) -> Result<(), CoordError> {
        validate_participant_id(participant_id)?;
        if step.trim().is_empty() {
            return Err(CoordError::BadRequest("step MUST NOT be empty".to_string()));
        }
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO draft_records(participant_id, last_step, submission_status, updated_at)
                 VALUES (?1, ?2, 'pending', ?3)
                 ON CONFLICT(participant_id) DO UPDATE SET
                   last_step = excluded.last_step,
                   updated_at = excluded.updated_at",
                params![participant_id, step, now],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Transitions pending→submitted and writes the questionnaire payload
    /// in the same guarded UPDATE. Zero matched rows means there was no
    /// pending draft to submit.
    pub fn submit_draft(
        &mut self,
        participant_id: &str,
        payload: &Value,
    ) -> Result<(), CoordError> {
        validate_participant_id(participant_id)?;
        let payload_text = serde_json::to_string(payload)
            .map_err(|err| CoordError::BadRequest(format!("unserializable payload: {err}")))?;
        let now = format_rfc3339(now_utc())?;
        let changed = self
            .conn
            .execute(
                "UPDATE draft_records
                 SET submission_status = 'submitted', payload_json = ?1, submitted_at = ?2, updated_at = ?2
                 WHERE participant_id = ?3 AND submission_status = 'pending'",
                params![payload_text, now, participant_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(CoordError::Conflict(format!(
                "no pending draft for participant {participant_id}"
            )));
        }
        Ok(())
    }

    pub fn get_draft(&self, participant_id: &str) -> Result<Option<DraftRecord>, CoordError> {
        let row: Option<(String, String, String, Option<String>, Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT participant_id, last_step, submission_status, payload_json, submitted_at, updated_at
                 FROM draft_records WHERE participant_id = ?1",
                params![participant_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        row.map(|(participant_id, last_step, status, payload, submitted_at, updated_at)| {
            let submission_status = SubmissionStatus::parse(&status)
                .ok_or_else(|| CoordError::Storage(format!("corrupt draft status: {status}")))?;
            let payload_json = payload
                .map(|text| {
                    serde_json::from_str(&text).map_err(|err| {
                        CoordError::Storage(format!("corrupt draft payload: {err}"))
                    })
                })
                .transpose()?;
            Ok(DraftRecord {
                participant_id,
                last_step,
                submission_status,
                payload_json,
                submitted_at,
                updated_at,
            })
        })
        .transpose()
    }

    /// Batch transition of stale pending drafts to abandoned. Safe to run
    /// concurrently with itself: terminal rows are never matched, so a
    /// rerun with the same cutoff changes nothing.
    pub fn sweep_abandoned(&mut self, cutoff_minutes: i64) -> Result<usize, CoordError> {
        if cutoff_minutes <= 0 {
            return Err(CoordError::BadRequest(
                "cutoff_minutes MUST be >= 1".to_string(),
            ));
        }
        let now = now_utc();
        let cutoff = format_rfc3339(now - Duration::minutes(cutoff_minutes))?;
        let stamped = format_rfc3339(now)?;
        self.conn
            .execute(
                "UPDATE draft_records
                 SET submission_status = 'abandoned', updated_at = ?1
                 WHERE submission_status = 'pending' AND updated_at < ?2",
                params![stamped, cutoff],
            )
            .map_err(db_err)
    }

    // ------------------------------------------------------------------
    // Evaluation runs and results
    // ------------------------------------------------------------------

    /// Drops call ids whose result for this metric is already terminal.
    /// Duplicates inside the input collapse to the first occurrence.
    pub fn filter_submittable(
        &self,
        call_ids: &[String],
        metric_id: &str,
        retry_errored: bool,
    ) -> Result<Vec<String>, CoordError> {
        let mut eligible = Vec::new();
        for call_id in call_ids {
            if eligible.contains(call_id) {
                continue;
            }
            let status = self.result_status(call_id, metric_id)?;
            let terminal = status.is_some_and(|status| status.is_terminal(retry_errored));
            if !terminal {
                eligible.push(call_id.clone());
            }
        }
        Ok(eligible)
    }

    pub fn result_status(
        &self,
        call_id: &str,
        metric_id: &str,
    ) -> Result<Option<EvaluationItemStatus>, CoordError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM evaluation_results WHERE call_id = ?1 AND metric_id = ?2",
                params![call_id, metric_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.map(|status| {
            EvaluationItemStatus::parse(&status)
                .ok_or_else(|| CoordError::Storage(format!("corrupt result status: {status}")))
        })
        .transpose()
    }

    /// Appends one run row and stamps every batched call with the given
    /// item status in a single transaction. Run bookkeeping is append-only;
    /// later submissions add rows instead of rewriting history.
    pub fn record_run(
        &mut self,
        run_id: &str,
        external_workflow_id: Option<&str>,
        metric_id: &str,
        call_ids: &[String],
        run_status: RunStatus,
        item_status: EvaluationItemStatus,
    ) -> Result<(), CoordError> {
        let call_ids_json = serde_json::to_string(call_ids)
            .map_err(|err| CoordError::Storage(format!("unserializable call id set: {err}")))?;
        let now = format_rfc3339(now_utc())?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute(
            "INSERT INTO evaluation_runs(run_id, external_workflow_id, metric_id, call_ids_json, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![run_id, external_workflow_id, metric_id, call_ids_json, run_status.as_str(), now],
        )
        .map_err(db_err)?;
        for call_id in call_ids {
            tx.execute(
                "INSERT INTO evaluation_results(call_id, metric_id, status, result_json, last_fetched_at)
                 VALUES (?1, ?2, ?3, NULL, ?4)
                 ON CONFLICT(call_id, metric_id) DO UPDATE SET
                   status = excluded.status,
                   result_json = excluded.result_json,
                   last_fetched_at = excluded.last_fetched_at",
                params![call_id, metric_id, item_status.as_str(), now],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<EvaluationRun>, CoordError> {
        let row: Option<(String, Option<String>, String, String, String, String, String)> = self
            .conn
            .query_row(
                "SELECT run_id, external_workflow_id, metric_id, call_ids_json, status, created_at, updated_at
                 FROM evaluation_runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        row.map(parse_run_row).transpose()
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<EvaluationRun>, CoordError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, external_workflow_id, metric_id, call_ids_json, status, created_at, updated_at
                 FROM evaluation_runs ORDER BY created_at DESC, run_id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })
            .map_err(db_err)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(parse_run_row(row.map_err(db_err)?)?);
        }
        Ok(runs)
    }

    pub fn update_run_status(&mut self, run_id: &str, status: RunStatus) -> Result<(), CoordError> {
        let now = format_rfc3339(now_utc())?;
        let changed = self
            .conn
            .execute(
                "UPDATE evaluation_runs SET status = ?1, updated_at = ?2 WHERE run_id = ?3",
                params![status.as_str(), now, run_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(CoordError::BadRequest(format!("unknown run id: {run_id}")));
        }
        Ok(())
    }

    /// Idempotent write-back of evaluator output. Reapplying an identical
    /// result only refreshes the fetch timestamp.
    pub fn apply_result(
        &mut self,
        call_id: &str,
        metric_id: &str,
        status: EvaluationItemStatus,
        result_json: &Value,
    ) -> Result<AppliedResult, CoordError> {
        validate_call_id(call_id)?;
        validate_metric_id(metric_id)?;
        let now = format_rfc3339(now_utc())?;
        let result_text = serde_json::to_string(result_json)
            .map_err(|err| CoordError::BadRequest(format!("unserializable result: {err}")))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let existing: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, result_json FROM evaluation_results
                 WHERE call_id = ?1 AND metric_id = ?2",
                params![call_id, metric_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        let identical = match &existing {
            Some((stored_status, stored_json)) => {
                let stored_value: Option<Value> = stored_json
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()
                    .map_err(|err| CoordError::Storage(format!("corrupt stored result: {err}")))?;
                stored_status == status.as_str() && stored_value.as_ref() == Some(result_json)
            }
            None => false,
        };

        if identical {
            tx.execute(
                "UPDATE evaluation_results SET last_fetched_at = ?1
                 WHERE call_id = ?2 AND metric_id = ?3",
                params![now, call_id, metric_id],
            )
            .map_err(db_err)?;
        } else {
            tx.execute(
                "INSERT INTO evaluation_results(call_id, metric_id, status, result_json, last_fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(call_id, metric_id) DO UPDATE SET
                   status = excluded.status,
                   result_json = excluded.result_json,
                   last_fetched_at = excluded.last_fetched_at",
                params![call_id, metric_id, status.as_str(), result_text, now],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;

        Ok(AppliedResult {
            call_id: call_id.to_string(),
            metric_id: metric_id.to_string(),
            status,
            changed: !identical,
        })
    }

    pub fn get_result(
        &self,
        call_id: &str,
        metric_id: &str,
    ) -> Result<Option<EvaluationResultRecord>, CoordError> {
        let row: Option<(String, Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT status, result_json, last_fetched_at FROM evaluation_results
                 WHERE call_id = ?1 AND metric_id = ?2",
                params![call_id, metric_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err)?;

        row.map(|(status, result_json, last_fetched_at)| {
            let status = EvaluationItemStatus::parse(&status)
                .ok_or_else(|| CoordError::Storage(format!("corrupt result status: {status}")))?;
            let result_json = result_json
                .map(|text| {
                    serde_json::from_str(&text)
                        .map_err(|err| CoordError::Storage(format!("corrupt result: {err}")))
                })
                .transpose()?;
            Ok(EvaluationResultRecord {
                call_id: call_id.to_string(),
                metric_id: metric_id.to_string(),
                status,
                result_json,
                last_fetched_at,
            })
        })
        .transpose()
    }

    /// Current per-call statuses for every call id in the run.
    pub fn run_item_statuses(&self, run: &EvaluationRun) -> Result<Vec<RunItem>, CoordError> {
        let mut items = Vec::with_capacity(run.call_ids.len());
        for call_id in &run.call_ids {
            let status = self
                .result_status(call_id, &run.metric_id)?
                .unwrap_or(EvaluationItemStatus::Submitted);
            items.push(RunItem { call_id: call_id.clone(), status });
        }
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Degraded-mode event log
    // ------------------------------------------------------------------

    pub fn append_study_event(&mut self, kind: &str, detail: &str) -> Result<(), CoordError> {
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO study_events(kind, detail, created_at) VALUES (?1, ?2, ?3)",
                params![kind, detail, now],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn count_study_events(&self, kind: &str) -> Result<i64, CoordError> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM study_events WHERE kind = ?1",
                params![kind],
                |row| row.get(0),
            )
            .map_err(db_err)
    }
}

fn parse_token_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionToken> {
    let raw_token: String = row.get(0)?;
    let token = Uuid::parse_str(&raw_token).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })?;
    Ok(SessionToken {
        token,
        participant_id: row.get(1)?,
        created_at: row.get(2)?,
        expires_at: row.get(3)?,
        consumed: row.get(4)?,
        linked_call_id: row.get(5)?,
        completed: row.get(6)?,
    })
}

#[allow(clippy::type_complexity)]
fn parse_run_row(
    row: (String, Option<String>, String, String, String, String, String),
) -> Result<EvaluationRun, CoordError> {
    let (run_id, external_workflow_id, metric_id, call_ids_json, status, created_at, updated_at) =
        row;
    let call_ids: Vec<String> = serde_json::from_str(&call_ids_json)
        .map_err(|err| CoordError::Storage(format!("corrupt run call id set: {err}")))?;
    let status = RunStatus::parse(&status)
        .ok_or_else(|| CoordError::Storage(format!("corrupt run status: {status}")))?;
    Ok(EvaluationRun {
        run_id,
        external_workflow_id,
        metric_id,
        call_ids,
        status,
        created_at,
        updated_at,
    })
}
