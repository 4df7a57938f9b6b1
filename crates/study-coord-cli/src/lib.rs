//! Researcher-facing command surface for the study coordination engine.
//!
//! Embed through [`run_cli`] for full parsed execution or [`execute`] to run
//! a parsed [`Cli`] and receive the JSON result directly (used by the
//! integration tests).

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use study_coord_api::{HttpEvaluatorClient, StudyCoordApi};
use study_coord_core::{Condition, EvaluationItemStatus, StudyConfig};

#[derive(Debug, Parser)]
#[command(name = "studyctl")]
#[command(about = "Study coordination researcher CLI")]
pub struct Cli {
    #[arg(long, default_value = "./study_coord.sqlite3")]
    db: PathBuf,

    /// Shared webhook secret; only needed when this database is also served
    /// over HTTP, local-only workflows can keep the default.
    #[arg(long, default_value = "local-dev-secret")]
    webhook_secret: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Sessions {
        #[command(subcommand)]
        command: SessionCommand,
    },
    Assign(AssignArgs),
    Drafts {
        #[command(subcommand)]
        command: DraftCommand,
    },
    Eval {
        #[command(subcommand)]
        command: EvalCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Apply the schema and exit.
    Migrate,
    /// Seed the warm-up offset sequence, e.g. `--sequence formal,informal`.
    SeedOffsets {
        #[arg(long)]
        sequence: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    Issue {
        #[arg(long)]
        participant_id: String,
    },
    Validate {
        #[arg(long)]
        token: String,
    },
    LinkCall {
        #[arg(long)]
        token: String,
        #[arg(long)]
        participant_id: String,
        #[arg(long)]
        call_id: String,
    },
    Complete {
        #[arg(long)]
        token: String,
    },
}

#[derive(Debug, Args)]
pub struct AssignArgs {
    /// Omit for synthetic traffic; synthetic participants never move the
    /// counters.
    #[arg(long)]
    participant_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum DraftCommand {
    Touch {
        #[arg(long)]
        participant_id: String,
        #[arg(long)]
        step: String,
    },
    Submit {
        #[arg(long)]
        participant_id: String,
        #[arg(long, default_value = "{}")]
        payload_json: String,
    },
    Sweep {
        #[arg(long)]
        cutoff_minutes: Option<i64>,
    },
}

#[derive(Debug, Args)]
pub struct EvaluatorArgs {
    #[arg(long, default_value = "http://127.0.0.1:4100")]
    evaluator_url: String,
    #[arg(long)]
    evaluator_api_key: Option<String>,
    #[arg(long, default_value_t = 5000)]
    evaluator_timeout_ms: u64,
}

#[derive(Debug, Subcommand)]
pub enum EvalCommand {
    Submit {
        /// Comma-separated call ids, capped at the batch limit.
        #[arg(long)]
        call_ids: String,
        #[arg(long)]
        metric_id: Option<String>,
        /// Resubmit calls whose previous evaluation errored.
        #[arg(long)]
        retry_errored: bool,
        #[command(flatten)]
        evaluator: EvaluatorArgs,
    },
    Poll {
        #[arg(long)]
        run_id: String,
        #[command(flatten)]
        evaluator: EvaluatorArgs,
    },
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    ApplyResult {
        #[arg(long)]
        call_id: String,
        #[arg(long)]
        metric_id: Option<String>,
        #[arg(long)]
        status: String,
        #[arg(long, default_value = "{}")]
        result_json: String,
    },
}

/// Parses argv, executes, and prints the JSON result.
///
/// # Errors
/// Returns an error for invalid input or any failed operation.
pub fn run_cli() -> Result<()> {
    let value = execute(Cli::parse())?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Executes a parsed command and returns its JSON result.
///
/// # Errors
/// Returns an error for invalid input or any failed operation.
pub fn execute(cli: Cli) -> Result<Value> {
    let Cli { db, webhook_secret, command } = cli;
    let api = build_api(&db, &webhook_secret, Vec::new())?;
    match command {
        Command::Db { command } => match command {
            DbCommand::Migrate => {
                api.migrate()?;
                Ok(serde_json::to_value(api.schema_status()?)?)
            }
            DbCommand::SeedOffsets { sequence } => {
                let sequence = Condition::parse_sequence(&sequence)?;
                let seeded = build_api(&db, &webhook_secret, sequence.clone())?;
                seeded.migrate()?;
                Ok(json!({ "seeded_slots": sequence.len() }))
            }
        },
        Command::Sessions { command } => match command {
            SessionCommand::Issue { participant_id } => {
                Ok(serde_json::to_value(api.issue_session(&participant_id)?)?)
            }
            SessionCommand::Validate { token } => {
                Ok(serde_json::to_value(api.validate_session(&token)?)?)
            }
            SessionCommand::LinkCall { token, participant_id, call_id } => {
                api.link_call(&token, &participant_id, &call_id)?;
                Ok(json!({ "linked": true, "call_id": call_id }))
            }
            SessionCommand::Complete { token } => {
                api.complete_session(&token)?;
                Ok(json!({ "completed": true }))
            }
        },
        Command::Assign(args) => Ok(serde_json::to_value(
            api.assign_condition(args.participant_id.as_deref())?,
        )?),
        Command::Drafts { command } => match command {
            DraftCommand::Touch { participant_id, step } => {
                api.touch_draft(&participant_id, &step)?;
                Ok(serde_json::to_value(api.get_draft(&participant_id)?)?)
            }
            DraftCommand::Submit { participant_id, payload_json } => {
                let payload: Value = serde_json::from_str(&payload_json)
                    .map_err(|err| anyhow!("invalid payload JSON: {err}"))?;
                api.submit_draft(&participant_id, &payload)?;
                Ok(serde_json::to_value(api.get_draft(&participant_id)?)?)
            }
            DraftCommand::Sweep { cutoff_minutes } => {
                let updated = api.sweep_abandoned(cutoff_minutes)?;
                Ok(json!({ "updated_count": updated }))
            }
        },
        Command::Eval { command } => match command {
            EvalCommand::Submit { call_ids, metric_id, retry_errored, evaluator } => {
                let call_ids: Vec<String> = call_ids
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect();
                let client = build_evaluator(&evaluator)?;
                let handle =
                    api.submit_batch(&client, &call_ids, metric_id.as_deref(), retry_errored)?;
                Ok(serde_json::to_value(handle)?)
            }
            EvalCommand::Poll { run_id, evaluator } => {
                let client = build_evaluator(&evaluator)?;
                Ok(serde_json::to_value(api.poll_run(&client, &run_id)?)?)
            }
            EvalCommand::Runs { limit } => Ok(serde_json::to_value(api.list_runs(limit)?)?),
            EvalCommand::ApplyResult { call_id, metric_id, status, result_json } => {
                let status = EvaluationItemStatus::parse(&status)
                    .ok_or_else(|| anyhow!("unknown result status: {status}"))?;
                let result: Value = serde_json::from_str(&result_json)
                    .map_err(|err| anyhow!("invalid result JSON: {err}"))?;
                Ok(serde_json::to_value(api.apply_result(
                    &call_id,
                    metric_id.as_deref(),
                    status,
                    &result,
                )?)?)
            }
        },
    }
}

fn build_api(
    db: &std::path::Path,
    webhook_secret: &str,
    offset_sequence: Vec<Condition>,
) -> Result<StudyCoordApi> {
    let mut config = StudyConfig::new(webhook_secret);
    config.offset_sequence = offset_sequence;
    Ok(StudyCoordApi::new(db.to_path_buf(), config)?)
}

fn build_evaluator(args: &EvaluatorArgs) -> Result<HttpEvaluatorClient> {
    Ok(HttpEvaluatorClient::new(
        &args.evaluator_url,
        args.evaluator_timeout_ms,
        args.evaluator_api_key.clone(),
    )?)
}
