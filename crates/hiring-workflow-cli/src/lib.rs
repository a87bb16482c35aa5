//! Embeddable command surface for the hiring workflow.
//!
//! Host programs drive the workflow through:
//! - [`run_cli`] for full parsed CLI execution, including logging setup.
//! - [`run_workflow_with_db`] for a parsed [`Command`] against a DB path.
//! - [`run_workflow`] for a parsed [`Command`] against an open
//!   [`SqliteWorkflowStore`].
//!
//! Every successful command prints one JSON document carrying a
//! `contract_version`. Failures surface as [`anyhow::Error`]; use
//! [`render_error`] for the `error[<code>]: <message>` line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hiring_workflow_core::{
    now_utc, parse_interview_date, parse_interview_time, parse_rfc3339_utc, ActorId, AgencyId,
    Application, ApplicationId, ApplicationStatus, ApplicationWorkflow, Caller, CandidateId,
    Interview, InterviewCompletion, InterviewId, InterviewInput, InterviewOutcome,
    InterviewUpdate, LedgerViolation, PermissionGate, PositionId, Posting, PostingId, Role,
    StoreError, WorkflowError, WorkflowStore,
};
use hiring_workflow_store_sqlite::{OutboxNotification, SqliteWorkflowStore};
use serde::Serialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hw")]
#[command(about = "Hiring workflow CLI")]
pub struct Cli {
    #[arg(long, global = true, default_value = "./hiring_workflow.sqlite3")]
    db: PathBuf,

    /// Role used for permission checks.
    #[arg(long, global = true)]
    role: Option<String>,

    /// Actor recorded as `updated_by` in history entries.
    #[arg(long, global = true)]
    actor: Option<String>,

    /// Role table JSON; the built-in agency table is used when omitted.
    #[arg(long, global = true)]
    permissions: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Posting {
        #[command(subcommand)]
        command: PostingCommand,
    },
    Application {
        #[command(subcommand)]
        command: Box<ApplicationCommand>,
    },
    Interview {
        #[command(subcommand)]
        command: InterviewCommand,
    },
    Notifications {
        #[command(subcommand)]
        command: NotificationsCommand,
    },
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PostingCommand {
    Upsert(PostingUpsertArgs),
    Show(PostingShowArgs),
}

#[derive(Debug, Args)]
pub struct PostingUpsertArgs {
    #[arg(long)]
    posting_id: String,
    #[arg(long)]
    agency_id: String,
    #[arg(long)]
    title: String,
    #[arg(long = "position-id")]
    position_ids: Vec<String>,
    #[arg(long)]
    inactive: bool,
}

#[derive(Debug, Args)]
pub struct PostingShowArgs {
    #[arg(long)]
    posting_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ApplicationCommand {
    Apply(ApplyArgs),
    Show(ApplicationIdArgs),
    UpdateStatus(UpdateStatusArgs),
    ScheduleInterview(ScheduleInterviewArgs),
    RescheduleInterview(RescheduleInterviewArgs),
    CompleteInterview(CompleteInterviewArgs),
    Withdraw(WithdrawArgs),
    Reject(RejectArgs),
    BulkReject(BulkRejectArgs),
    Correct(CorrectArgs),
    Analytics(CandidateArgs),
    AppliedPositions(AppliedPositionsArgs),
    List(ListArgs),
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    #[arg(long)]
    candidate_id: String,
    #[arg(long)]
    posting_id: String,
    #[arg(long)]
    position_id: String,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
pub struct ApplicationIdArgs {
    #[arg(long)]
    application_id: String,
}

#[derive(Debug, Args)]
pub struct UpdateStatusArgs {
    #[arg(long)]
    application_id: String,
    #[arg(long, value_parser = parse_status_arg)]
    status: ApplicationStatus,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
pub struct ScheduleInterviewArgs {
    #[arg(long)]
    application_id: String,
    /// Interview date as YYYY-MM-DD.
    #[arg(long)]
    date: String,
    /// Start time as HH:MM (UTC).
    #[arg(long)]
    time: String,
    #[arg(long)]
    duration_minutes: Option<u32>,
    #[arg(long)]
    location: String,
    #[arg(long)]
    contact_person: Option<String>,
    #[arg(long = "required-document")]
    required_documents: Vec<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct RescheduleInterviewArgs {
    #[arg(long)]
    application_id: String,
    #[arg(long)]
    interview_id: String,
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    time: Option<String>,
    #[arg(long)]
    duration_minutes: Option<u32>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    contact_person: Option<String>,
    #[arg(long = "required-document")]
    required_documents: Vec<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct CompleteInterviewArgs {
    #[arg(long)]
    application_id: String,
    #[arg(long)]
    result: OutcomeArg,
    #[arg(long)]
    feedback: Option<String>,
    #[arg(long)]
    score: Option<u8>,
    #[arg(long)]
    recommendation: Option<String>,
    /// Appended to the interview notes.
    #[arg(long)]
    notes: Option<String>,
    /// Recorded on the application history entry.
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
pub struct WithdrawArgs {
    #[arg(long)]
    candidate_id: String,
    #[arg(long)]
    posting_id: String,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
pub struct RejectArgs {
    #[arg(long)]
    application_id: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
pub struct BulkRejectArgs {
    #[arg(long)]
    posting_id: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
pub struct CorrectArgs {
    #[arg(long)]
    application_id: String,
    #[arg(long, value_parser = parse_status_arg)]
    status: ApplicationStatus,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
pub struct CandidateArgs {
    #[arg(long)]
    candidate_id: String,
}

#[derive(Debug, Args)]
pub struct AppliedPositionsArgs {
    #[arg(long)]
    candidate_id: String,
    #[arg(long = "position-id")]
    position_ids: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    posting_id: String,
    #[arg(long, value_parser = parse_status_arg)]
    status: Option<ApplicationStatus>,
}

#[derive(Debug, Subcommand)]
pub enum InterviewCommand {
    Show(InterviewShowArgs),
}

#[derive(Debug, Args)]
pub struct InterviewShowArgs {
    #[arg(long)]
    application_id: String,
    /// RFC3339 UTC instant used for the unattended check; defaults to now.
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum NotificationsCommand {
    List(NotificationsListArgs),
}

#[derive(Debug, Args)]
pub struct NotificationsListArgs {
    #[arg(long)]
    application_id: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    Audit(ApplicationIdArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    Passed,
    Failed,
}

/// Caller identity and role table a command runs with.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub caller: Caller,
    pub permissions: PermissionGate,
}

impl WorkflowContext {
    #[must_use]
    pub fn new(caller: Caller, permissions: PermissionGate) -> Self {
        Self {
            caller,
            permissions,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the permission table cannot be loaded, store
/// open/migrate fails, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose);

    let permissions = load_permissions(cli.permissions.as_deref())?;
    let caller = Caller {
        role: cli.role.map(Role::new),
        actor: cli.actor.map(ActorId::new),
    };
    run_workflow_with_db(
        &cli.db,
        &WorkflowContext::new(caller, permissions),
        cli.command,
    )
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_workflow_with_db(
    db_path: &Path,
    context: &WorkflowContext,
    command: Command,
) -> Result<()> {
    let store = SqliteWorkflowStore::open(db_path)?;
    store.migrate()?;
    run_workflow(command, context, &store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns the [`WorkflowError`] of a refused operation, or an error when
/// arguments cannot be parsed or persistence fails.
pub fn run_workflow(
    command: Command,
    context: &WorkflowContext,
    store: &SqliteWorkflowStore,
) -> Result<()> {
    match command {
        Command::Posting { command } => run_posting(command, store),
        Command::Application { command } => run_application(*command, context, store),
        Command::Interview { command } => run_interview(command, context, store),
        Command::Notifications { command } => run_notifications(command, store),
        Command::Ledger { command } => run_ledger(command, store),
    }
}

fn run_posting(command: PostingCommand, store: &SqliteWorkflowStore) -> Result<()> {
    match command {
        PostingCommand::Upsert(args) => {
            let posting = Posting {
                posting_id: PostingId::new(args.posting_id),
                agency_id: AgencyId::new(args.agency_id),
                title: args.title,
                active: !args.inactive,
                position_ids: args.position_ids.into_iter().map(PositionId::new).collect(),
            };
            store.upsert_posting(&posting)?;
            emit("posting.v1", &PostingPayload { posting: &posting })
        }
        PostingCommand::Show(args) => {
            let posting_id = PostingId::new(args.posting_id);
            let posting = store
                .get_posting(&posting_id)?
                .ok_or_else(|| WorkflowError::NotFound {
                    entity: "posting",
                    id: posting_id.to_string(),
                })?;
            emit("posting.v1", &PostingPayload { posting: &posting })
        }
    }
}

fn run_application(
    command: ApplicationCommand,
    context: &WorkflowContext,
    store: &SqliteWorkflowStore,
) -> Result<()> {
    let workflow = ApplicationWorkflow::new(store, store, store, &context.permissions);
    let caller = &context.caller;

    match command {
        ApplicationCommand::Apply(args) => {
            let application = workflow.apply(
                CandidateId::new(args.candidate_id),
                &PostingId::new(args.posting_id),
                PositionId::new(args.position_id),
                args.note,
                caller,
            )?;
            emit_application(&application)
        }
        ApplicationCommand::Show(args) => {
            let application = workflow.get_by_id(ApplicationId::parse(&args.application_id)?)?;
            emit_application(&application)
        }
        ApplicationCommand::UpdateStatus(args) => {
            let application = workflow.update_status(
                ApplicationId::parse(&args.application_id)?,
                args.status,
                args.note,
                caller,
            )?;
            emit_application(&application)
        }
        ApplicationCommand::ScheduleInterview(args) => {
            let input = InterviewInput {
                date: parse_interview_date(&args.date)?,
                start_time: parse_interview_time(&args.time)?,
                duration_minutes: args.duration_minutes,
                location: args.location,
                contact_person: args.contact_person,
                required_documents: args.required_documents,
                notes: args.notes,
            };
            let transition = workflow.schedule_interview(
                ApplicationId::parse(&args.application_id)?,
                input,
                caller,
            )?;
            emit("interview_transition.v1", &transition)
        }
        ApplicationCommand::RescheduleInterview(args) => {
            let update = InterviewUpdate {
                date: args.date.as_deref().map(parse_interview_date).transpose()?,
                start_time: args.time.as_deref().map(parse_interview_time).transpose()?,
                duration_minutes: args.duration_minutes,
                location: args.location,
                contact_person: args.contact_person,
                required_documents: (!args.required_documents.is_empty())
                    .then_some(args.required_documents),
                notes: args.notes,
            };
            let transition = workflow.reschedule_interview(
                ApplicationId::parse(&args.application_id)?,
                InterviewId::parse(&args.interview_id)?,
                update,
                caller,
            )?;
            emit("interview_transition.v1", &transition)
        }
        ApplicationCommand::CompleteInterview(args) => {
            let outcome = match args.result {
                OutcomeArg::Passed => InterviewOutcome::Passed,
                OutcomeArg::Failed => InterviewOutcome::Failed,
            };
            let completion = InterviewCompletion {
                feedback: args.feedback,
                score: args.score,
                recommendation: args.recommendation,
                notes: args.notes,
            };
            let transition = workflow.complete_interview(
                ApplicationId::parse(&args.application_id)?,
                outcome,
                completion,
                args.note,
                caller,
            )?;
            emit("interview_transition.v1", &transition)
        }
        ApplicationCommand::Withdraw(args) => {
            let application = workflow.withdraw(
                &CandidateId::new(args.candidate_id),
                &PostingId::new(args.posting_id),
                args.note,
                caller,
            )?;
            emit_application(&application)
        }
        ApplicationCommand::Reject(args) => {
            let application = workflow.reject_application(
                ApplicationId::parse(&args.application_id)?,
                &args.reason,
                caller,
            )?;
            emit_application(&application)
        }
        ApplicationCommand::BulkReject(args) => {
            let posting_id = PostingId::new(args.posting_id);
            let outcome = workflow.bulk_reject_for_posting(&posting_id, &args.reason, caller)?;
            emit(
                "bulk_reject.v1",
                &BulkRejectPayload {
                    posting_id: &posting_id,
                    outcome: &outcome,
                },
            )
        }
        ApplicationCommand::Correct(args) => {
            let application = workflow.make_correction(
                ApplicationId::parse(&args.application_id)?,
                args.status,
                &args.reason,
                caller,
            )?;
            emit_application(&application)
        }
        ApplicationCommand::Analytics(args) => {
            let analytics = workflow.analytics(&CandidateId::new(args.candidate_id))?;
            emit("analytics.v1", &analytics)
        }
        ApplicationCommand::AppliedPositions(args) => {
            let candidate_id = CandidateId::new(args.candidate_id);
            let requested: Vec<PositionId> =
                args.position_ids.into_iter().map(PositionId::new).collect();
            let position_ids = workflow.applied_position_ids(&candidate_id, &requested)?;
            emit(
                "applied_positions.v1",
                &AppliedPositionsPayload {
                    candidate_id: &candidate_id,
                    position_ids: &position_ids,
                },
            )
        }
        ApplicationCommand::List(args) => {
            let posting_id = PostingId::new(args.posting_id);
            let applications = workflow.list_for_posting(&posting_id, args.status)?;
            emit(
                "application_list.v1",
                &ApplicationListPayload {
                    posting_id: &posting_id,
                    status: args.status,
                    applications: &applications,
                },
            )
        }
    }
}

fn run_interview(
    command: InterviewCommand,
    context: &WorkflowContext,
    store: &SqliteWorkflowStore,
) -> Result<()> {
    let workflow = ApplicationWorkflow::new(store, store, store, &context.permissions);
    match command {
        InterviewCommand::Show(args) => {
            let application_id = ApplicationId::parse(&args.application_id)?;
            let as_of = match args.as_of.as_deref() {
                Some(raw) => parse_rfc3339_utc(raw)?,
                None => now_utc(),
            };
            let interview = workflow.latest_interview(application_id)?;
            let unattended = interview
                .as_ref()
                .map(|interview| interview.is_unattended(as_of));
            emit(
                "interview.v1",
                &InterviewPayload {
                    application_id,
                    as_of,
                    unattended,
                    interview: interview.as_ref(),
                },
            )
        }
    }
}

fn run_notifications(command: NotificationsCommand, store: &SqliteWorkflowStore) -> Result<()> {
    match command {
        NotificationsCommand::List(args) => {
            let application_id = args
                .application_id
                .as_deref()
                .map(ApplicationId::parse)
                .transpose()?;
            let notifications = store.list_notifications(application_id, args.limit)?;
            emit(
                "notifications.v1",
                &NotificationsPayload {
                    notifications: &notifications,
                },
            )
        }
    }
}

fn run_ledger(command: LedgerCommand, store: &SqliteWorkflowStore) -> Result<()> {
    match command {
        LedgerCommand::Audit(args) => {
            let application_id = ApplicationId::parse(&args.application_id)?;
            let application = store
                .get_application(application_id)
                .map_err(WorkflowError::from)?
                .ok_or_else(|| WorkflowError::NotFound {
                    entity: "application",
                    id: application_id.to_string(),
                })?;
            let violations = application.audit();
            emit(
                "ledger_audit.v1",
                &LedgerAuditPayload {
                    application_id,
                    status: application.status,
                    entries: application.history.len(),
                    corrected_entries: application
                        .history
                        .entries()
                        .iter()
                        .filter(|entry| entry.corrected)
                        .count(),
                    consistent: violations.is_empty(),
                    violations: &violations,
                },
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct Versioned<'a, T: Serialize> {
    contract_version: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Debug, Serialize)]
struct PostingPayload<'a> {
    posting: &'a Posting,
}

#[derive(Debug, Serialize)]
struct ApplicationPayload<'a> {
    application: &'a Application,
}

#[derive(Debug, Serialize)]
struct BulkRejectPayload<'a> {
    posting_id: &'a PostingId,
    #[serde(flatten)]
    outcome: &'a hiring_workflow_core::BulkRejectOutcome,
}

#[derive(Debug, Serialize)]
struct AppliedPositionsPayload<'a> {
    candidate_id: &'a CandidateId,
    position_ids: &'a [PositionId],
}

#[derive(Debug, Serialize)]
struct ApplicationListPayload<'a> {
    posting_id: &'a PostingId,
    status: Option<ApplicationStatus>,
    applications: &'a [Application],
}

#[derive(Debug, Serialize)]
struct InterviewPayload<'a> {
    application_id: ApplicationId,
    #[serde(with = "time::serde::rfc3339")]
    as_of: time::OffsetDateTime,
    unattended: Option<bool>,
    interview: Option<&'a Interview>,
}

#[derive(Debug, Serialize)]
struct NotificationsPayload<'a> {
    notifications: &'a [OutboxNotification],
}

#[derive(Debug, Serialize)]
struct LedgerAuditPayload<'a> {
    application_id: ApplicationId,
    status: ApplicationStatus,
    entries: usize,
    corrected_entries: usize,
    consistent: bool,
    violations: &'a [LedgerViolation],
}

fn emit<T: Serialize>(contract_version: &str, body: &T) -> Result<()> {
    let payload = Versioned {
        contract_version,
        body,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn emit_application(application: &Application) -> Result<()> {
    emit("application.v1", &ApplicationPayload { application })
}

fn parse_status_arg(raw: &str) -> std::result::Result<ApplicationStatus, String> {
    ApplicationStatus::parse(raw).ok_or_else(|| {
        let known: Vec<&str> = ApplicationStatus::ALL
            .iter()
            .map(|status| status.as_str())
            .collect();
        format!("unknown status {raw}; expected one of {}", known.join(", "))
    })
}

/// Loads the role table from `path`, or the built-in table when absent.
///
/// # Errors
/// Returns [`WorkflowError::Configuration`] when the file cannot be read or
/// does not hold a valid role table.
pub fn load_permissions(path: Option<&Path>) -> Result<PermissionGate> {
    let Some(path) = path else {
        return Ok(PermissionGate::default_agency());
    };

    let body = std::fs::read_to_string(path).map_err(|err| {
        WorkflowError::Configuration(format!(
            "failed to read permissions file {}: {err}",
            path.display()
        ))
    })?;
    let value: serde_json::Value = serde_json::from_str(&body).map_err(|err| {
        WorkflowError::Configuration(format!(
            "permissions file {} is not valid JSON: {err}",
            path.display()
        ))
    })?;
    let gate = PermissionGate::from_json(&value)
        .with_context(|| format!("failed to load permissions from {}", path.display()))?;

    tracing::debug!(
        path = %path.display(),
        roles = gate.config().roles.len(),
        "loaded permission table"
    );
    Ok(gate)
}

/// Stable code for an error returned by the command surface.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(workflow) = cause.downcast_ref::<WorkflowError>() {
            return workflow.code();
        }
        if let Some(store) = cause.downcast_ref::<StoreError>() {
            return WorkflowError::Store(store.clone()).code();
        }
    }
    "internal_error"
}

/// Formats an error as `error[<code>]: <message>`.
#[must_use]
pub fn render_error(err: &anyhow::Error) -> String {
    let message = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<WorkflowError>())
        .map_or_else(|| format!("{err:#}"), ToString::to_string);
    format!("error[{}]: {message}", error_code(err))
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // A host may already have installed a subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).without_time())
        .try_init();
}
