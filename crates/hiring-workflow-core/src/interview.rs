use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time};

use crate::{
    format_rfc3339, ActorId, ApplicationId, ApplicationStatus, InterviewId, PostingId,
    WorkflowError,
};

pub const DEFAULT_INTERVIEW_DURATION_MINUTES: u32 = 60;
pub const MAX_INTERVIEW_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_INTERVIEW_SCORE: u8 = 10;
pub const UNATTENDED_GRACE_MINUTES: i64 = 30;

time::serde::format_description!(interview_date, Date, "[year]-[month]-[day]");
time::serde::format_description!(interview_time, Time, "[hour]:[minute]");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterviewStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl InterviewStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

impl Display for InterviewStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterviewResult {
    Pass,
    Fail,
    Rejected,
}

impl InterviewResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Result a completed interview hands back to the application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterviewOutcome {
    Passed,
    Failed,
}

impl InterviewOutcome {
    #[must_use]
    pub fn result(self) -> InterviewResult {
        match self {
            Self::Passed => InterviewResult::Pass,
            Self::Failed => InterviewResult::Fail,
        }
    }

    #[must_use]
    pub fn application_status(self) -> ApplicationStatus {
        match self {
            Self::Passed => ApplicationStatus::InterviewPassed,
            Self::Failed => ApplicationStatus::InterviewFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterviewInput {
    #[serde(with = "interview_date")]
    pub date: Date,
    #[serde(with = "interview_time")]
    pub start_time: Time,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    pub location: String,
    #[serde(default)]
    pub contact_person: Option<String>,
    #[serde(default)]
    pub required_documents: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl InterviewInput {
    /// Validates scheduling fields.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when the location is blank or the
    /// duration is out of range.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        crate::ensure_non_empty("location", &self.location)?;
        if let Some(minutes) = self.duration_minutes {
            validate_duration(minutes)?;
        }
        Ok(())
    }
}

/// Fields a reschedule may overwrite. `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterviewUpdate {
    #[serde(default, with = "interview_date::option")]
    pub date: Option<Date>,
    #[serde(default, with = "interview_time::option")]
    pub start_time: Option<Time>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub contact_person: Option<String>,
    #[serde(default)]
    pub required_documents: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl InterviewUpdate {
    /// Validates the supplied fields only.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when a supplied location is blank
    /// or a supplied duration is out of range.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if let Some(location) = &self.location {
            crate::ensure_non_empty("location", location)?;
        }
        if let Some(minutes) = self.duration_minutes {
            validate_duration(minutes)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterviewCompletion {
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub score: Option<u8>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl InterviewCompletion {
    /// Validates completion details.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when the score exceeds
    /// [`MAX_INTERVIEW_SCORE`].
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if let Some(score) = self.score {
            if score > MAX_INTERVIEW_SCORE {
                return Err(WorkflowError::Validation(format!(
                    "score MUST be in [0, {MAX_INTERVIEW_SCORE}], got {score}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterviewCancellation {
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Scheduling details handed to notification dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterviewBrief {
    pub interview_id: InterviewId,
    #[serde(with = "interview_date")]
    pub date: Date,
    #[serde(with = "interview_time")]
    pub start_time: Time,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interview {
    pub interview_id: InterviewId,
    pub application_id: ApplicationId,
    pub posting_id: PostingId,
    pub status: InterviewStatus,
    pub result: Option<InterviewResult>,
    #[serde(with = "interview_date")]
    pub date: Date,
    #[serde(with = "interview_time")]
    pub start_time: Time,
    pub duration_minutes: u32,
    pub location: String,
    pub contact_person: Option<String>,
    pub required_documents: Vec<String>,
    pub notes: Option<String>,
    pub feedback: Option<String>,
    pub score: Option<u8>,
    pub recommendation: Option<String>,
    pub rejection_reason: Option<String>,
    pub scheduled_by: Option<ActorId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub rescheduled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
}

impl Interview {
    /// Creates an interview in `scheduled`.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when `input` is invalid.
    pub fn schedule(
        posting_id: PostingId,
        application_id: ApplicationId,
        input: InterviewInput,
        at: OffsetDateTime,
        by: Option<ActorId>,
    ) -> Result<Self, WorkflowError> {
        input.validate()?;

        Ok(Self {
            interview_id: InterviewId::new(),
            application_id,
            posting_id,
            status: InterviewStatus::Scheduled,
            result: None,
            date: input.date,
            start_time: input.start_time,
            duration_minutes: input
                .duration_minutes
                .unwrap_or(DEFAULT_INTERVIEW_DURATION_MINUTES),
            location: input.location.trim().to_string(),
            contact_person: input.contact_person,
            required_documents: input.required_documents,
            notes: input.notes.filter(|notes| !notes.trim().is_empty()),
            feedback: None,
            score: None,
            recommendation: None,
            rejection_reason: None,
            scheduled_by: by,
            created_at: at,
            updated_at: at,
            rescheduled_at: None,
            completed_at: None,
            cancelled_at: None,
        })
    }

    /// Overwrites the supplied fields and appends a timestamped note.
    ///
    /// # Errors
    /// Returns [`WorkflowError::InvalidInterviewTransition`] unless the
    /// interview is `scheduled`, or a validation error for bad fields.
    pub fn reschedule(
        &mut self,
        update: InterviewUpdate,
        at: OffsetDateTime,
    ) -> Result<(), WorkflowError> {
        self.ensure_scheduled("reschedule")?;
        update.validate()?;

        if let Some(date) = update.date {
            self.date = date;
        }
        if let Some(start_time) = update.start_time {
            self.start_time = start_time;
        }
        if let Some(minutes) = update.duration_minutes {
            self.duration_minutes = minutes;
        }
        if let Some(location) = update.location {
            self.location = location.trim().to_string();
        }
        if let Some(contact_person) = update.contact_person {
            self.contact_person = Some(contact_person);
        }
        if let Some(required_documents) = update.required_documents {
            self.required_documents = required_documents;
        }

        let note = match update.notes.as_deref().map(str::trim) {
            Some(notes) if !notes.is_empty() => format!("rescheduled: {notes}"),
            _ => "rescheduled".to_string(),
        };
        self.append_note(&note, at)?;
        self.rescheduled_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    /// Marks the interview completed with `outcome`.
    ///
    /// # Errors
    /// Returns [`WorkflowError::InvalidInterviewTransition`] unless the
    /// interview is `scheduled`, or a validation error for an out-of-range
    /// score.
    pub fn complete(
        &mut self,
        outcome: InterviewOutcome,
        completion: InterviewCompletion,
        at: OffsetDateTime,
    ) -> Result<(), WorkflowError> {
        self.ensure_scheduled("complete")?;
        completion.validate()?;

        if let Some(notes) = completion.notes.as_deref() {
            self.append_note(notes, at)?;
        }
        self.status = InterviewStatus::Completed;
        self.result = Some(outcome.result());
        self.feedback = completion.feedback;
        self.score = completion.score;
        self.recommendation = completion.recommendation;
        self.completed_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    /// Cancels a non-terminal interview and records it as rejected.
    ///
    /// # Errors
    /// Returns [`WorkflowError::InvalidInterviewTransition`] when the
    /// interview is already completed or cancelled.
    pub fn cancel(
        &mut self,
        cancellation: InterviewCancellation,
        at: OffsetDateTime,
    ) -> Result<(), WorkflowError> {
        self.ensure_scheduled("cancel")?;

        if let Some(notes) = cancellation.notes.as_deref() {
            self.append_note(notes, at)?;
        }
        self.status = InterviewStatus::Cancelled;
        self.result = Some(InterviewResult::Rejected);
        self.rejection_reason = cancellation.rejection_reason;
        self.cancelled_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    #[must_use]
    pub fn brief(&self) -> InterviewBrief {
        InterviewBrief {
            interview_id: self.interview_id,
            date: self.date,
            start_time: self.start_time,
            location: self.location.clone(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == InterviewStatus::Scheduled
    }

    #[must_use]
    pub fn starts_at(&self) -> OffsetDateTime {
        PrimitiveDateTime::new(self.date, self.start_time).assume_utc()
    }

    /// True when the interview is still `scheduled` and its slot plus the
    /// grace period has elapsed at `as_of`.
    #[must_use]
    pub fn is_unattended(&self, as_of: OffsetDateTime) -> bool {
        if self.status != InterviewStatus::Scheduled {
            return false;
        }

        let deadline = self.starts_at()
            + Duration::minutes(i64::from(self.duration_minutes))
            + Duration::minutes(UNATTENDED_GRACE_MINUTES);
        as_of > deadline
    }

    fn ensure_scheduled(&self, operation: &'static str) -> Result<(), WorkflowError> {
        if self.status.is_terminal() {
            return Err(WorkflowError::InvalidInterviewTransition {
                interview_id: self.interview_id,
                status: self.status,
                operation,
            });
        }
        Ok(())
    }

    // Notes are never overwritten; each addition is stamped and concatenated.
    fn append_note(&mut self, note: &str, at: OffsetDateTime) -> Result<(), WorkflowError> {
        let note = note.trim();
        if note.is_empty() {
            return Ok(());
        }

        let stamped = format!("[{}] {note}", format_rfc3339(at)?);
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{stamped}"),
            _ => stamped,
        });
        Ok(())
    }
}

fn validate_duration(minutes: u32) -> Result<(), WorkflowError> {
    if minutes == 0 || minutes > MAX_INTERVIEW_DURATION_MINUTES {
        return Err(WorkflowError::Validation(format!(
            "duration_minutes MUST be in [1, {MAX_INTERVIEW_DURATION_MINUTES}], got {minutes}"
        )));
    }
    Ok(())
}

/// Parses an interview date in `YYYY-MM-DD` form.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when parsing fails.
pub fn parse_interview_date(value: &str) -> Result<Date, WorkflowError> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|err| WorkflowError::Validation(format!("invalid interview date {value}: {err}")))
}

/// Parses an interview start time in `HH:MM` form.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when parsing fails.
pub fn parse_interview_time(value: &str) -> Result<Time, WorkflowError> {
    Time::parse(value, format_description!("[hour]:[minute]"))
        .map_err(|err| WorkflowError::Validation(format!("invalid interview time {value}: {err}")))
}

/// Formats an interview date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when formatting fails.
pub fn format_interview_date(value: Date) -> Result<String, WorkflowError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| WorkflowError::Validation(format!("failed to format date: {err}")))
}

/// Formats an interview start time as `HH:MM`.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when formatting fails.
pub fn format_interview_time(value: Time) -> Result<String, WorkflowError> {
    value
        .format(format_description!("[hour]:[minute]"))
        .map_err(|err| WorkflowError::Validation(format!("failed to format time: {err}")))
}
