#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use hiring_workflow_core::{
    format_interview_date, format_interview_time, format_rfc3339, now_utc, parse_interview_date,
    parse_interview_time, parse_rfc3339_utc, ActorId, AgencyId, Application, ApplicationFilter,
    ApplicationId, ApplicationStatus, CandidateId, HistoryEntry, HistoryLedger, Interview,
    InterviewBrief, InterviewId, InterviewResult, InterviewStatus, NotificationDispatcher,
    NotificationError, NotificationKind, PositionId, Posting, PostingId, PostingRepository,
    StoreError, TransitionEvent, WorkflowStore,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const WORKFLOW_MIGRATION_VERSION: i64 = 1;

const SCHEMA_WORKFLOW_V1: &str = r"
CREATE TABLE IF NOT EXISTS job_postings (
  posting_id TEXT PRIMARY KEY,
  agency_id TEXT NOT NULL,
  title TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_positions (
  posting_id TEXT NOT NULL REFERENCES job_postings(posting_id) ON DELETE CASCADE,
  position_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  PRIMARY KEY (posting_id, position_id)
);

CREATE TABLE IF NOT EXISTS applications (
  application_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  application_id TEXT NOT NULL UNIQUE,
  candidate_id TEXT NOT NULL,
  posting_id TEXT NOT NULL REFERENCES job_postings(posting_id),
  position_id TEXT NOT NULL,
  agency_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (
    status IN (
      'applied',
      'shortlisted',
      'interview_scheduled',
      'interview_rescheduled',
      'interview_passed',
      'interview_failed',
      'withdrawn'
    )
  ),
  history_json TEXT NOT NULL,
  withdrawn_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  CHECK ((status = 'withdrawn') = (withdrawn_at IS NOT NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_applications_open_triple
  ON applications(candidate_id, posting_id, position_id)
  WHERE status != 'withdrawn';
CREATE INDEX IF NOT EXISTS idx_applications_posting_status_seq
  ON applications(posting_id, status, application_seq);
CREATE INDEX IF NOT EXISTS idx_applications_candidate_seq
  ON applications(candidate_id, application_seq);

CREATE TABLE IF NOT EXISTS interviews (
  interview_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  interview_id TEXT NOT NULL UNIQUE,
  application_id TEXT NOT NULL REFERENCES applications(application_id),
  posting_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('scheduled', 'completed', 'cancelled')),
  result TEXT CHECK (result IN ('pass', 'fail', 'rejected') OR result IS NULL),
  interview_date TEXT NOT NULL,
  start_time TEXT NOT NULL,
  duration_minutes INTEGER NOT NULL CHECK (duration_minutes BETWEEN 1 AND 1440),
  location TEXT NOT NULL,
  contact_person TEXT,
  required_documents_json TEXT NOT NULL DEFAULT '[]',
  notes TEXT,
  feedback TEXT,
  score INTEGER CHECK (score BETWEEN 0 AND 10 OR score IS NULL),
  recommendation TEXT,
  rejection_reason TEXT,
  scheduled_by TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  rescheduled_at TEXT,
  completed_at TEXT,
  cancelled_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_interviews_application_seq
  ON interviews(application_id, interview_seq);

CREATE TABLE IF NOT EXISTS notification_outbox (
  notification_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL CHECK (
    kind IN (
      'shortlisted',
      'interview_scheduled',
      'interview_rescheduled',
      'interview_passed',
      'interview_failed',
      'withdrawn',
      'rejected'
    )
  ),
  application_id TEXT NOT NULL,
  candidate_id TEXT NOT NULL,
  posting_id TEXT NOT NULL,
  agency_id TEXT NOT NULL,
  interview_json TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_notification_outbox_no_update
BEFORE UPDATE ON notification_outbox
BEGIN
  SELECT RAISE(FAIL, 'notification_outbox is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_notification_outbox_no_delete
BEFORE DELETE ON notification_outbox
BEGIN
  SELECT RAISE(FAIL, 'notification_outbox is append-only');
END;
";

const APPLICATION_COLUMNS: &str = "application_id, candidate_id, posting_id, position_id, agency_id,
     status, history_json, withdrawn_at, created_at, updated_at, revision";

const INTERVIEW_COLUMNS: &str = "interview_id, application_id, posting_id, status, result,
     interview_date, start_time, duration_minutes, location, contact_person,
     required_documents_json, notes, feedback, score, recommendation, rejection_reason,
     scheduled_by, created_at, updated_at, rescheduled_at, completed_at, cancelled_at";

/// A row of the notification outbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxNotification {
    pub notification_seq: i64,
    #[serde(flatten)]
    pub event: TransitionEvent,
    pub recorded_at: String,
}

pub struct SqliteWorkflowStore {
    conn: Connection,
}

impl SqliteWorkflowStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_WORKFLOW_V1)
            .context("failed to apply workflow schema")?;

        ensure_table_has_columns(
            &self.conn,
            "applications",
            &["application_id", "status", "history_json", "revision"],
        )?;

        let now = sql_timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![WORKFLOW_MIGRATION_VERSION, now],
            )
            .context("failed to register workflow schema migration")?;

        tracing::debug!(version = WORKFLOW_MIGRATION_VERSION, "workflow schema ready");
        Ok(())
    }

    pub fn upsert_posting(&self, posting: &Posting) -> Result<()> {
        posting.validate()?;

        let now = sql_timestamp(now_utc())?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start posting transaction")?;

        tx.execute(
            "INSERT INTO job_postings(posting_id, agency_id, title, active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(posting_id) DO UPDATE SET
               agency_id = excluded.agency_id,
               title = excluded.title,
               active = excluded.active,
               updated_at = excluded.updated_at",
            params![
                posting.posting_id.as_str(),
                posting.agency_id.as_str(),
                posting.title,
                bool_to_sql(posting.active),
                now,
            ],
        )
        .context("failed to upsert job posting")?;

        tx.execute(
            "DELETE FROM job_positions WHERE posting_id = ?1",
            params![posting.posting_id.as_str()],
        )
        .context("failed to clear job positions")?;

        for (ordinal, position_id) in posting.position_ids.iter().enumerate() {
            let ordinal = i64::try_from(ordinal).context("too many positions")?;
            tx.execute(
                "INSERT OR IGNORE INTO job_positions(posting_id, position_id, ordinal)
                 VALUES (?1, ?2, ?3)",
                params![posting.posting_id.as_str(), position_id.as_str(), ordinal],
            )
            .context("failed to insert job position")?;
        }

        tx.commit().context("failed to commit posting transaction")?;
        Ok(())
    }

    pub fn get_posting(&self, posting_id: &PostingId) -> Result<Option<Posting>> {
        let header = self
            .conn
            .query_row(
                "SELECT agency_id, title, active FROM job_postings WHERE posting_id = ?1",
                params![posting_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to load job posting")?;

        let Some((agency_id, title, active)) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT position_id FROM job_positions WHERE posting_id = ?1 ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map(params![posting_id.as_str()], |row| {
            row.get::<_, String>(0).map(PositionId::new)
        })?;

        Ok(Some(Posting {
            posting_id: posting_id.clone(),
            agency_id: AgencyId::new(agency_id),
            title,
            active: active != 0,
            position_ids: collect_rows(rows)?,
        }))
    }

    pub fn list_notifications(
        &self,
        application_id: Option<ApplicationId>,
        limit: Option<usize>,
    ) -> Result<Vec<OutboxNotification>> {
        let mut query = "SELECT
                notification_seq, kind, application_id, candidate_id, posting_id,
                agency_id, interview_json, recorded_at
             FROM notification_outbox
             WHERE (?1 IS NULL OR application_id = ?1)
             ORDER BY notification_seq ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![application_id.map(|id| id.to_string())],
            parse_notification_row,
        )?;
        collect_rows(rows)
    }

    fn select_applications(&self, filter: &ApplicationFilter) -> Result<Vec<Application>> {
        let query = format!(
            "SELECT {APPLICATION_COLUMNS}
             FROM applications
             WHERE (?1 IS NULL OR candidate_id = ?1)
               AND (?2 IS NULL OR posting_id = ?2)
               AND (?3 IS NULL OR position_id = ?3)
               AND (?4 IS NULL OR status = ?4)
             ORDER BY application_seq ASC"
        );

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![
                filter.candidate_id.as_ref().map(CandidateId::as_str),
                filter.posting_id.as_ref().map(PostingId::as_str),
                filter.position_id.as_ref().map(PositionId::as_str),
                filter.status.map(ApplicationStatus::as_str),
            ],
            parse_application_row,
        )?;
        collect_rows(rows)
    }

    fn select_application(&self, id: ApplicationId) -> Result<Option<Application>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {APPLICATION_COLUMNS} FROM applications WHERE application_id = ?1"
                ),
                params![id.to_string()],
                parse_application_row,
            )
            .optional()
            .context("failed to load application")
    }

    fn select_interview(&self, id: InterviewId) -> Result<Option<Interview>> {
        self.conn
            .query_row(
                &format!("SELECT {INTERVIEW_COLUMNS} FROM interviews WHERE interview_id = ?1"),
                params![id.to_string()],
                parse_interview_row,
            )
            .optional()
            .context("failed to load interview")
    }

    fn select_latest_interview(&self, application_id: ApplicationId) -> Result<Option<Interview>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {INTERVIEW_COLUMNS}
                     FROM interviews
                     WHERE application_id = ?1
                     ORDER BY interview_seq DESC
                     LIMIT 1"
                ),
                params![application_id.to_string()],
                parse_interview_row,
            )
            .optional()
            .context("failed to load latest interview")
    }

    fn record_notification(&self, event: &TransitionEvent) -> Result<()> {
        let interview_json = event
            .interview
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize interview brief")?;
        let now = sql_timestamp(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO notification_outbox(
                    kind, application_id, candidate_id, posting_id, agency_id,
                    interview_json, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.kind.as_str(),
                    event.application_id.to_string(),
                    event.candidate_id.as_str(),
                    event.posting_id.as_str(),
                    event.agency_id.as_str(),
                    interview_json,
                    now,
                ],
            )
            .context("failed to append notification")?;
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl WorkflowStore for SqliteWorkflowStore {
    fn get_application(&self, id: ApplicationId) -> Result<Option<Application>, StoreError> {
        self.select_application(id).map_err(into_store_error)
    }

    fn find_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, StoreError> {
        self.select_applications(filter).map_err(into_store_error)
    }

    fn save_application(&self, application: &Application) -> Result<Application, StoreError> {
        write_application(&self.conn, application).map_err(into_store_error)
    }

    fn get_interview(&self, id: InterviewId) -> Result<Option<Interview>, StoreError> {
        self.select_interview(id).map_err(into_store_error)
    }

    fn find_latest_interview(
        &self,
        application_id: ApplicationId,
    ) -> Result<Option<Interview>, StoreError> {
        self.select_latest_interview(application_id)
            .map_err(into_store_error)
    }

    fn save_interview(&self, interview: &Interview) -> Result<Interview, StoreError> {
        write_interview(&self.conn, interview).map_err(into_store_error)?;
        Ok(interview.clone())
    }

    fn save_transition(
        &self,
        application: &Application,
        interviews: &[Interview],
    ) -> Result<Application, StoreError> {
        let commit = || -> Result<Application> {
            let tx = self
                .conn
                .unchecked_transaction()
                .context("failed to start transition transaction")?;
            let saved = write_application(&tx, application)?;
            for interview in interviews {
                write_interview(&tx, interview)?;
            }
            tx.commit().context("failed to commit transition transaction")?;
            Ok(saved)
        };
        commit().map_err(into_store_error)
    }
}

impl PostingRepository for SqliteWorkflowStore {
    fn find_active_posting(&self, posting_id: &PostingId) -> Result<Option<Posting>, StoreError> {
        self.get_posting(posting_id)
            .map(|posting| posting.filter(|posting| posting.active))
            .map_err(into_store_error)
    }
}

/// Outbox dispatcher: every event becomes a `notification_outbox` row for a
/// downstream sender to pick up.
impl NotificationDispatcher for SqliteWorkflowStore {
    fn notify(&self, event: &TransitionEvent) -> Result<(), NotificationError> {
        self.record_notification(event)
            .map_err(|err| NotificationError::Delivery(format!("{err:#}")))
    }
}

// Revision 0 inserts at 1. Otherwise the update only lands when the stored
// revision still matches.
fn write_application(conn: &Connection, application: &Application) -> Result<Application> {
    let history_json =
        serde_json::to_string(&application.history).context("failed to serialize history")?;
    let withdrawn_at = application.withdrawn_at.map(sql_timestamp).transpose()?;
    let created_at = sql_timestamp(application.created_at)?;
    let updated_at = sql_timestamp(application.updated_at)?;

    let mut saved = application.clone();
    if application.revision == 0 {
        conn.execute(
            "INSERT INTO applications(
                application_id, candidate_id, posting_id, position_id, agency_id,
                status, history_json, withdrawn_at, created_at, updated_at, revision
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)",
            params![
                application.application_id.to_string(),
                application.candidate_id.as_str(),
                application.posting_id.as_str(),
                application.position_id.as_str(),
                application.agency_id.as_str(),
                application.status.as_str(),
                history_json,
                withdrawn_at,
                created_at,
                updated_at,
            ],
        )
        .map_err(|err| classify_write_error(err, application))?;
        saved.revision = 1;
        return Ok(saved);
    }

    let expected = i64::try_from(application.revision).context("revision out of range")?;
    let changed = conn
        .execute(
            "UPDATE applications SET
                status = ?2,
                history_json = ?3,
                withdrawn_at = ?4,
                updated_at = ?5,
                revision = revision + 1
             WHERE application_id = ?1 AND revision = ?6",
            params![
                application.application_id.to_string(),
                application.status.as_str(),
                history_json,
                withdrawn_at,
                updated_at,
                expected,
            ],
        )
        .map_err(|err| classify_write_error(err, application))?;

    if changed == 0 {
        return Err(StoreError::RevisionConflict {
            application_id: application.application_id,
            expected: application.revision,
        }
        .into());
    }

    saved.revision = application.revision + 1;
    Ok(saved)
}

fn write_interview(conn: &Connection, interview: &Interview) -> Result<()> {
    conn.execute(
        "INSERT INTO interviews(
            interview_id, application_id, posting_id, status, result,
            interview_date, start_time, duration_minutes, location, contact_person,
            required_documents_json, notes, feedback, score, recommendation, rejection_reason,
            scheduled_by, created_at, updated_at, rescheduled_at, completed_at, cancelled_at
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15, ?16,
            ?17, ?18, ?19, ?20, ?21, ?22
         )
         ON CONFLICT(interview_id) DO UPDATE SET
           status = excluded.status,
           result = excluded.result,
           interview_date = excluded.interview_date,
           start_time = excluded.start_time,
           duration_minutes = excluded.duration_minutes,
           location = excluded.location,
           contact_person = excluded.contact_person,
           required_documents_json = excluded.required_documents_json,
           notes = excluded.notes,
           feedback = excluded.feedback,
           score = excluded.score,
           recommendation = excluded.recommendation,
           rejection_reason = excluded.rejection_reason,
           updated_at = excluded.updated_at,
           rescheduled_at = excluded.rescheduled_at,
           completed_at = excluded.completed_at,
           cancelled_at = excluded.cancelled_at",
        params![
            interview.interview_id.to_string(),
            interview.application_id.to_string(),
            interview.posting_id.as_str(),
            interview.status.as_str(),
            interview.result.map(InterviewResult::as_str),
            format_interview_date(interview.date).map_err(|err| anyhow!(err.to_string()))?,
            format_interview_time(interview.start_time).map_err(|err| anyhow!(err.to_string()))?,
            i64::from(interview.duration_minutes),
            interview.location,
            interview.contact_person,
            serde_json::to_string(&interview.required_documents)
                .context("failed to serialize required_documents")?,
            interview.notes,
            interview.feedback,
            interview.score.map(i64::from),
            interview.recommendation,
            interview.rejection_reason,
            interview.scheduled_by.as_ref().map(ActorId::as_str),
            sql_timestamp(interview.created_at)?,
            sql_timestamp(interview.updated_at)?,
            interview.rescheduled_at.map(sql_timestamp).transpose()?,
            interview.completed_at.map(sql_timestamp).transpose()?,
            interview.cancelled_at.map(sql_timestamp).transpose()?,
        ],
    )
    .context("failed to write interview")?;
    Ok(())
}

fn classify_write_error(err: rusqlite::Error, application: &Application) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            if message.contains("applications.application_id") {
                return StoreError::RevisionConflict {
                    application_id: application.application_id,
                    expected: application.revision,
                }
                .into();
            }
            if message.contains("applications.candidate_id") {
                return StoreError::DuplicateApplication {
                    candidate_id: application.candidate_id.clone(),
                    posting_id: application.posting_id.clone(),
                    position_id: application.position_id.clone(),
                }
                .into();
            }
        }
    }
    anyhow::Error::new(err).context("failed to write application")
}

fn into_store_error(err: anyhow::Error) -> StoreError {
    match err.downcast::<StoreError>() {
        Ok(store_error) => store_error,
        Err(err) => StoreError::Backend(format!("{err:#}")),
    }
}

fn parse_application_row(row: &Row<'_>) -> rusqlite::Result<Application> {
    let application_id_raw: String = row.get(0)?;
    let status_raw: String = row.get(5)?;
    let history_raw: String = row.get(6)?;
    let withdrawn_at_raw: Option<String> = row.get(7)?;
    let revision_raw: i64 = row.get(10)?;

    let application_id = ApplicationId::parse(&application_id_raw)
        .map_err(|err| invalid_column(0, Type::Text, err.to_string()))?;
    let status = ApplicationStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(5, Type::Text, format!("invalid status: {status_raw}")))?;
    let entries: Vec<HistoryEntry> = serde_json::from_str(&history_raw)
        .map_err(|err| invalid_column(6, Type::Text, format!("invalid history_json: {err}")))?;
    let history = HistoryLedger::from_entries(entries)
        .map_err(|err| invalid_column(6, Type::Text, err.to_string()))?;
    let revision = u64::try_from(revision_raw).map_err(|_| {
        invalid_column(10, Type::Integer, format!("invalid revision: {revision_raw}"))
    })?;

    Ok(Application {
        application_id,
        candidate_id: CandidateId::new(row.get::<_, String>(1)?),
        posting_id: PostingId::new(row.get::<_, String>(2)?),
        position_id: PositionId::new(row.get::<_, String>(3)?),
        agency_id: AgencyId::new(row.get::<_, String>(4)?),
        status,
        history,
        withdrawn_at: parse_optional_timestamp(7, withdrawn_at_raw)?,
        created_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
        revision,
    })
}

fn parse_interview_row(row: &Row<'_>) -> rusqlite::Result<Interview> {
    let interview_id_raw: String = row.get(0)?;
    let application_id_raw: String = row.get(1)?;
    let status_raw: String = row.get(3)?;
    let result_raw: Option<String> = row.get(4)?;
    let date_raw: String = row.get(5)?;
    let start_time_raw: String = row.get(6)?;
    let duration_raw: i64 = row.get(7)?;
    let documents_raw: String = row.get(10)?;
    let score_raw: Option<i64> = row.get(13)?;

    let interview_id = InterviewId::parse(&interview_id_raw)
        .map_err(|err| invalid_column(0, Type::Text, err.to_string()))?;
    let application_id = ApplicationId::parse(&application_id_raw)
        .map_err(|err| invalid_column(1, Type::Text, err.to_string()))?;
    let status = InterviewStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(3, Type::Text, format!("invalid interview status: {status_raw}"))
    })?;
    let result = result_raw
        .as_deref()
        .map(|raw| {
            InterviewResult::parse(raw).ok_or_else(|| {
                invalid_column(4, Type::Text, format!("invalid interview result: {raw}"))
            })
        })
        .transpose()?;
    let date = parse_interview_date(&date_raw)
        .map_err(|err| invalid_column(5, Type::Text, err.to_string()))?;
    let start_time = parse_interview_time(&start_time_raw)
        .map_err(|err| invalid_column(6, Type::Text, err.to_string()))?;
    let duration_minutes = u32::try_from(duration_raw).map_err(|_| {
        invalid_column(7, Type::Integer, format!("invalid duration: {duration_raw}"))
    })?;
    let required_documents: Vec<String> = serde_json::from_str(&documents_raw).map_err(|err| {
        invalid_column(10, Type::Text, format!("invalid required_documents_json: {err}"))
    })?;
    let score = score_raw
        .map(|raw| {
            u8::try_from(raw)
                .map_err(|_| invalid_column(13, Type::Integer, format!("invalid score: {raw}")))
        })
        .transpose()?;

    Ok(Interview {
        interview_id,
        application_id,
        posting_id: PostingId::new(row.get::<_, String>(2)?),
        status,
        result,
        date,
        start_time,
        duration_minutes,
        location: row.get(8)?,
        contact_person: row.get(9)?,
        required_documents,
        notes: row.get(11)?,
        feedback: row.get(12)?,
        score,
        recommendation: row.get(14)?,
        rejection_reason: row.get(15)?,
        scheduled_by: row.get::<_, Option<String>>(16)?.map(ActorId::new),
        created_at: parse_timestamp(17, &row.get::<_, String>(17)?)?,
        updated_at: parse_timestamp(18, &row.get::<_, String>(18)?)?,
        rescheduled_at: parse_optional_timestamp(19, row.get(19)?)?,
        completed_at: parse_optional_timestamp(20, row.get(20)?)?,
        cancelled_at: parse_optional_timestamp(21, row.get(21)?)?,
    })
}

fn parse_notification_row(row: &Row<'_>) -> rusqlite::Result<OutboxNotification> {
    let kind_raw: String = row.get(1)?;
    let application_id_raw: String = row.get(2)?;
    let interview_raw: Option<String> = row.get(6)?;

    let kind = NotificationKind::parse(&kind_raw)
        .ok_or_else(|| invalid_column(1, Type::Text, format!("invalid kind: {kind_raw}")))?;
    let application_id = ApplicationId::parse(&application_id_raw)
        .map_err(|err| invalid_column(2, Type::Text, err.to_string()))?;
    let interview = interview_raw
        .as_deref()
        .map(serde_json::from_str::<InterviewBrief>)
        .transpose()
        .map_err(|err| invalid_column(6, Type::Text, format!("invalid interview_json: {err}")))?;

    Ok(OutboxNotification {
        notification_seq: row.get(0)?,
        event: TransitionEvent {
            kind,
            application_id,
            candidate_id: CandidateId::new(row.get::<_, String>(3)?),
            posting_id: PostingId::new(row.get::<_, String>(4)?),
            agency_id: AgencyId::new(row.get::<_, String>(5)?),
            interview,
        },
        recorded_at: row.get(7)?,
    })
}

fn sql_timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_optional_timestamp(
    index: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.as_deref()
        .map(|value| parse_timestamp(index, value))
        .transpose()
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "workflow schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use hiring_workflow_core::{
        ApplicationWorkflow, Caller, InterviewCompletion, InterviewInput, InterviewOutcome,
        InterviewUpdate, PermissionGate, Role, WorkflowError,
    };
    use proptest::prelude::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_ok<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteWorkflowStore {
        let store = must(SqliteWorkflowStore::open(Path::new(":memory:")));
        must(store.migrate());
        must(store.upsert_posting(&Posting {
            posting_id: PostingId::new("post-1"),
            agency_id: AgencyId::new("agency-1"),
            title: "Night shift picker".to_string(),
            active: true,
            position_ids: vec![PositionId::new("pos-1"), PositionId::new("pos-2")],
        }));
        store
    }

    fn admin() -> Caller {
        Caller::new(Role::new("agency_admin")).with_actor(ActorId::new("ops-1"))
    }

    fn candidate() -> Caller {
        Caller::new(Role::new("candidate"))
    }

    fn interview_input() -> InterviewInput {
        InterviewInput {
            date: must_ok(parse_interview_date("2026-03-02")),
            start_time: must_ok(parse_interview_time("10:00")),
            duration_minutes: None,
            location: "Depot 3".to_string(),
            contact_person: Some("Dana".to_string()),
            required_documents: vec!["id card".to_string()],
            notes: None,
        }
    }

    fn table_exists(conn: &Connection, table_name: &str) -> bool {
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
                params![table_name],
                |_| Ok(()),
            )
            .optional();
        match found {
            Ok(value) => value.is_some(),
            Err(err) => panic!("failed to query sqlite_master: {err}"),
        }
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        for table in [
            "schema_migrations",
            "job_postings",
            "job_positions",
            "applications",
            "interviews",
            "notification_outbox",
        ] {
            assert!(table_exists(store.connection(), table), "missing {table}");
        }

        must(ensure_table_has_columns(
            store.connection(),
            "interviews",
            &[
                "interview_id",
                "application_id",
                "status",
                "result",
                "interview_date",
                "start_time",
                "rescheduled_at",
                "completed_at",
                "cancelled_at",
            ],
        ));

        let trigger_count = match store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='trigger'
               AND name IN ('trg_notification_outbox_no_update', 'trg_notification_outbox_no_delete')",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query trigger contract: {err}"),
        };
        assert_eq!(trigger_count, 2);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let store = fixture_store();
        let gate = PermissionGate::default_agency();
        let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
        let application = must_ok(workflow.apply(
            CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            PositionId::new("pos-1"),
            None,
            &candidate(),
        ));

        must(store.migrate());
        let reloaded = must_ok(store.get_application(application.application_id));
        assert_eq!(reloaded, Some(application));

        let versions = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn posting_upsert_replaces_positions_and_hides_inactive() {
        let store = fixture_store();
        must(store.upsert_posting(&Posting {
            posting_id: PostingId::new("post-1"),
            agency_id: AgencyId::new("agency-1"),
            title: "Night shift picker".to_string(),
            active: false,
            position_ids: vec![PositionId::new("pos-3")],
        }));

        let stored = must(store.get_posting(&PostingId::new("post-1")));
        let Some(stored) = stored else {
            panic!("posting must exist");
        };
        assert_eq!(stored.position_ids, vec![PositionId::new("pos-3")]);
        assert!(!stored.active);
        assert_eq!(
            must_ok(store.find_active_posting(&PostingId::new("post-1"))),
            None
        );
        assert_eq!(must(store.get_posting(&PostingId::new("post-404"))), None);
    }

    #[test]
    fn interview_flow_persists_and_reloads() {
        let store = fixture_store();
        let gate = PermissionGate::default_agency();
        let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
        let application = must_ok(workflow.apply(
            CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            PositionId::new("pos-2"),
            Some("referred by Sam".to_string()),
            &candidate(),
        ));
        let scheduled = must_ok(workflow.schedule_interview(
            application.application_id,
            interview_input(),
            &admin(),
        ));
        must_ok(workflow.reschedule_interview(
            application.application_id,
            scheduled.interview.interview_id,
            InterviewUpdate {
                start_time: Some(must_ok(parse_interview_time("15:30"))),
                notes: Some("moved to afternoon".to_string()),
                ..InterviewUpdate::default()
            },
            &admin(),
        ));
        let completed = must_ok(workflow.complete_interview(
            application.application_id,
            InterviewOutcome::Failed,
            InterviewCompletion {
                feedback: Some("no forklift licence".to_string()),
                score: Some(3),
                ..InterviewCompletion::default()
            },
            None,
            &admin(),
        ));

        let reloaded = must_ok(store.get_application(application.application_id));
        assert_eq!(reloaded.as_ref(), Some(&completed.application));
        let Some(reloaded) = reloaded else {
            panic!("application must exist");
        };
        assert_eq!(reloaded.status, ApplicationStatus::InterviewFailed);
        assert_eq!(reloaded.history.len(), 4);
        assert_eq!(reloaded.revision, 4);
        assert!(reloaded.audit().is_empty());

        let interview = must_ok(store.find_latest_interview(application.application_id));
        assert_eq!(interview.as_ref(), Some(&completed.interview));
        let Some(interview) = interview else {
            panic!("interview must exist");
        };
        assert_eq!(interview.status, InterviewStatus::Completed);
        assert_eq!(interview.start_time, must_ok(parse_interview_time("15:30")));
        assert_eq!(interview.required_documents, vec!["id card".to_string()]);

        let kinds: Vec<NotificationKind> = must(store.list_notifications(None, None))
            .into_iter()
            .map(|row| row.event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::InterviewScheduled,
                NotificationKind::InterviewRescheduled,
                NotificationKind::InterviewFailed,
            ]
        );
    }

    #[test]
    fn save_interview_upserts_by_id() {
        let store = fixture_store();
        let gate = PermissionGate::default_agency();
        let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
        let application = must_ok(workflow.apply(
            CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            PositionId::new("pos-1"),
            None,
            &candidate(),
        ));

        let scheduled_at = time::macros::datetime!(2026-02-20 09:00 UTC);
        let mut interview = must_ok(Interview::schedule(
            application.posting_id.clone(),
            application.application_id,
            interview_input(),
            scheduled_at,
            Some(ActorId::new("ops-1")),
        ));
        let saved = must_ok(store.save_interview(&interview));
        assert_eq!(saved, interview);
        assert_eq!(
            must_ok(store.get_interview(interview.interview_id)),
            Some(interview.clone())
        );

        must_ok(interview.reschedule(
            InterviewUpdate {
                location: Some("Depot 7".to_string()),
                ..InterviewUpdate::default()
            },
            time::macros::datetime!(2026-02-21 08:30 UTC),
        ));
        must_ok(store.save_interview(&interview));

        let reloaded = must_ok(store.find_latest_interview(application.application_id));
        assert_eq!(reloaded, Some(interview.clone()));
        let rows: i64 = must_ok(store.connection().query_row(
            "SELECT COUNT(*) FROM interviews WHERE application_id = ?1",
            params![application.application_id.to_string()],
            |row| row.get(0),
        ));
        assert_eq!(rows, 1);
    }

    #[test]
    fn stale_revision_is_rejected_and_transition_is_atomic() {
        let store = fixture_store();
        let gate = PermissionGate::default_agency();
        let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
        let application = must_ok(workflow.apply(
            CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            PositionId::new("pos-1"),
            None,
            &candidate(),
        ));
        let stale = application.clone();
        must_ok(store.save_application(&application));

        let interview = must_ok(Interview::schedule(
            stale.posting_id.clone(),
            stale.application_id,
            interview_input(),
            now_utc(),
            None,
        ));
        let conflict = store.save_transition(&stale, std::slice::from_ref(&interview));
        assert_eq!(
            conflict,
            Err(StoreError::RevisionConflict {
                application_id: stale.application_id,
                expected: 1,
            })
        );
        assert_eq!(must_ok(store.get_interview(interview.interview_id)), None);

        let as_workflow_error = WorkflowError::from(StoreError::RevisionConflict {
            application_id: stale.application_id,
            expected: 1,
        });
        assert_eq!(as_workflow_error.code(), "revision_conflict");
    }

    #[test]
    fn partial_unique_index_allows_reapply_after_withdrawal() {
        let store = fixture_store();
        let gate = PermissionGate::default_agency();
        let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
        let first = must_ok(workflow.apply(
            CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            PositionId::new("pos-1"),
            None,
            &candidate(),
        ));

        let mut twin = first.clone();
        twin.application_id = ApplicationId::new();
        twin.revision = 0;
        assert!(matches!(
            store.save_application(&twin),
            Err(StoreError::DuplicateApplication { .. })
        ));

        must_ok(workflow.withdraw(
            &CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            None,
            &candidate(),
        ));
        let second = must_ok(workflow.apply(
            CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            PositionId::new("pos-1"),
            None,
            &candidate(),
        ));
        assert_ne!(first.application_id, second.application_id);

        let all = must_ok(store.find_applications(&ApplicationFilter {
            candidate_id: Some(CandidateId::new("cand-1")),
            ..ApplicationFilter::default()
        }));
        let statuses: Vec<ApplicationStatus> = all.iter().map(|item| item.status).collect();
        assert_eq!(
            statuses,
            vec![ApplicationStatus::Withdrawn, ApplicationStatus::Applied]
        );
    }

    #[test]
    fn outbox_is_append_only() {
        let store = fixture_store();
        let gate = PermissionGate::default_agency();
        let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
        let application = must_ok(workflow.apply(
            CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            PositionId::new("pos-1"),
            None,
            &candidate(),
        ));
        must_ok(workflow.reject_application(application.application_id, "no permit", &admin()));

        let rows = must(store.list_notifications(Some(application.application_id), Some(10)));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event.kind, NotificationKind::Rejected);
        assert_eq!(rows[0].event.agency_id, AgencyId::new("agency-1"));

        let update_result = store.connection().execute(
            "UPDATE notification_outbox SET kind = 'withdrawn' WHERE notification_seq = ?1",
            params![rows[0].notification_seq],
        );
        assert!(update_result.is_err());
        let delete_result = store
            .connection()
            .execute("DELETE FROM notification_outbox", []);
        assert!(delete_result.is_err());
    }

    #[test]
    fn corrupt_history_is_reported_clearly() {
        let store = fixture_store();
        let gate = PermissionGate::default_agency();
        let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
        let application = must_ok(workflow.apply(
            CandidateId::new("cand-1"),
            &PostingId::new("post-1"),
            PositionId::new("pos-1"),
            None,
            &candidate(),
        ));
        if let Err(err) = store.connection().execute(
            "UPDATE applications SET history_json = '[]' WHERE application_id = ?1",
            params![application.application_id.to_string()],
        ) {
            panic!("failed to corrupt fixture: {err}");
        }

        let err = match store.get_application(application.application_id) {
            Ok(value) => panic!("expected corrupt history error, got {value:?}"),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(err.to_string().contains("history"));
    }

    #[test]
    fn sqlite_busy_timeout_allows_write_after_lock_release() {
        let db_path =
            std::env::temp_dir().join(format!("hiring-workflow-lock-{}.sqlite3", Ulid::new()));

        let setup_store = must(SqliteWorkflowStore::open(&db_path));
        must(setup_store.migrate());
        must(setup_store.upsert_posting(&Posting {
            posting_id: PostingId::new("post-1"),
            agency_id: AgencyId::new("agency-1"),
            title: "Picker".to_string(),
            active: true,
            position_ids: vec![PositionId::new("pos-1")],
        }));
        drop(setup_store);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let write_path = db_path.clone();
        let write_handle = std::thread::spawn(move || {
            let store = match SqliteWorkflowStore::open(&write_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open write store: {err}"),
            };
            let gate = PermissionGate::default_agency();
            let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
            workflow
                .apply(
                    CandidateId::new("cand-1"),
                    &PostingId::new("post-1"),
                    PositionId::new("pos-1"),
                    None,
                    &Caller::new(Role::new("candidate")),
                )
                .map(|application| application.application_id)
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let write_result = match write_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("write thread join failed: {err:?}"),
        };
        assert!(
            write_result.is_ok(),
            "apply should succeed after lock release: {:?}",
            write_result.err()
        );

        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #[test]
        fn prop_mixed_candidates_keep_one_open_application(
            steps in prop::collection::vec((0u8..3, 0u8..3), 1..30)
        ) {
            let store = fixture_store();
            let gate = PermissionGate::default_agency();
            let workflow = ApplicationWorkflow::new(&store, &store, &store, &gate);
            let posting = PostingId::new("post-1");

            for (candidate_code, op) in steps {
                let candidate_id = CandidateId::new(format!("cand-{candidate_code}"));
                let _ = match op {
                    0 => workflow
                        .apply(candidate_id, &posting, PositionId::new("pos-1"), None, &candidate())
                        .map(|_| ()),
                    1 => workflow
                        .withdraw(&candidate_id, &posting, None, &candidate())
                        .map(|_| ()),
                    _ => workflow
                        .bulk_reject_for_posting(&posting, "batch close", &admin())
                        .map(|_| ()),
                };
            }

            let applications = must_ok(store.find_applications(&ApplicationFilter::default()));
            for code in 0u8..3 {
                let candidate_id = CandidateId::new(format!("cand-{code}"));
                let open = applications
                    .iter()
                    .filter(|item| item.candidate_id == candidate_id && item.is_open())
                    .count();
                prop_assert!(open <= 1);
            }
            for application in &applications {
                prop_assert!(application.audit().is_empty());
                prop_assert!(application.revision >= 1);
            }
        }
    }
}
