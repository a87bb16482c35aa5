//! Application workflow engine for agency hiring pipelines.
//!
//! A candidate's [`Application`] moves through a fixed pipeline
//! (`applied → shortlisted → interview_scheduled/rescheduled →
//! interview_passed/failed`, or `withdrawn`). Every mutation is gated by the
//! [`PermissionGate`], validated against the adjacency table in
//! [`ApplicationStatus::can_transition_to`], recorded in the append-only
//! [`HistoryLedger`], and followed by a best-effort notification.
//!
//! Entry points:
//! - [`ApplicationWorkflow`] for every mutating and read operation.
//! - [`WorkflowStore`], [`PostingRepository`] and [`NotificationDispatcher`]
//!   for the collaborators the engine is wired to.
//! - [`InMemoryWorkflowStore`] as a reference store for embedding and tests.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod application;
mod engine;
mod interview;
mod memory;
mod permission;
mod ports;

pub use application::{
    Application, ApplicationStatus, HistoryEntry, HistoryLedger, LedgerViolation, Posting,
    CORRECTION_NOTE_PREFIX, REJECTION_NOTE_PREFIX,
};
pub use engine::{
    ApplicationWorkflow, BulkRejectFailure, BulkRejectOutcome, Caller, CandidateAnalytics,
    InterviewTransition,
};
pub use interview::{
    format_interview_date, format_interview_time, parse_interview_date, parse_interview_time,
    Interview, InterviewBrief, InterviewCancellation, InterviewCompletion, InterviewInput,
    InterviewOutcome, InterviewResult, InterviewStatus, InterviewUpdate,
    DEFAULT_INTERVIEW_DURATION_MINUTES, MAX_INTERVIEW_DURATION_MINUTES, MAX_INTERVIEW_SCORE,
    UNATTENDED_GRACE_MINUTES,
};
pub use memory::InMemoryWorkflowStore;
pub use permission::{Action, PermissionConfig, PermissionGate};
pub use ports::{
    ApplicationFilter, NotificationDispatcher, NotificationError, NotificationKind,
    PostingRepository, TracingNotificationDispatcher, TransitionEvent, WorkflowStore,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("revision conflict on application {application_id}: expected revision {expected}")]
    RevisionConflict {
        application_id: ApplicationId,
        expected: u64,
    },
    #[error(
        "an open application already exists for candidate {candidate_id}, posting {posting_id}, position {position_id}"
    )]
    DuplicateApplication {
        candidate_id: CandidateId,
        posting_id: PostingId,
        position_id: PositionId,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: ApplicationStatus,
        to: ApplicationStatus,
    },
    #[error("application {application_id} is in terminal status {status}; {operation} is not allowed")]
    TerminalState {
        application_id: ApplicationId,
        status: ApplicationStatus,
        operation: &'static str,
    },
    #[error("cannot {operation} interview {interview_id} in status {status}")]
    InvalidInterviewTransition {
        interview_id: InterviewId,
        status: InterviewStatus,
        operation: &'static str,
    },
    #[error("permission denied: role {role} may not perform {action}")]
    PermissionDenied { role: String, action: Action },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Stable machine-readable code for the error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::TerminalState { .. } => "terminal_state",
            Self::InvalidInterviewTransition { .. } => "invalid_interview_transition",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Validation(_) => "validation_error",
            Self::Configuration(_) => "configuration_error",
            Self::Store(StoreError::RevisionConflict { .. }) => "revision_conflict",
            Self::Store(StoreError::DuplicateApplication { .. }) => "duplicate_application",
            Self::Store(StoreError::Backend(_)) => "store_error",
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ApplicationId(pub Ulid);

impl ApplicationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses an application id from its ULID text form.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, WorkflowError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| {
                WorkflowError::Validation(format!("invalid application id {raw}: {err}"))
            })
    }
}

impl Default for ApplicationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ApplicationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InterviewId(pub Ulid);

impl InterviewId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses an interview id from its ULID text form.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, WorkflowError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| WorkflowError::Validation(format!("invalid interview id {raw}: {err}")))
    }
}

impl Default for InterviewId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for InterviewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Identifiers owned by other systems. The engine never interprets them.
macro_rules! opaque_id {
    ($($name:ident),+ $(,)?) => {
        $(
            #[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
            #[serde(transparent)]
            pub struct $name(pub String);

            impl $name {
                #[must_use]
                pub fn new(value: impl Into<String>) -> Self {
                    Self(value.into())
                }

                #[must_use]
                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl Display for $name {
                fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                    f.write_str(&self.0)
                }
            }
        )+
    };
}

opaque_id!(CandidateId, PostingId, PositionId, AgencyId, ActorId, Role);

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, WorkflowError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| WorkflowError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(WorkflowError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, WorkflowError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            WorkflowError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub(crate) fn ensure_non_empty(field: &str, value: &str) -> Result<(), WorkflowError> {
    if value.trim().is_empty() {
        return Err(WorkflowError::Validation(format!(
            "{field} MUST be provided and cannot be empty"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let not_found = WorkflowError::not_found("application", "01J0SQQP7M70P6Y3R4T8D8G8M2");
        assert_eq!(not_found.code(), "not_found");
        assert_eq!(
            not_found.to_string(),
            "application not found: 01J0SQQP7M70P6Y3R4T8D8G8M2"
        );

        let invalid = WorkflowError::InvalidTransition {
            from: ApplicationStatus::Shortlisted,
            to: ApplicationStatus::InterviewPassed,
        };
        assert_eq!(invalid.code(), "invalid_transition");
        assert_eq!(
            invalid.to_string(),
            "invalid transition: shortlisted -> interview_passed"
        );

        let denied = WorkflowError::PermissionDenied {
            role: "candidate".to_string(),
            action: Action::BulkReject,
        };
        assert_eq!(denied.code(), "permission_denied");
        assert!(denied.to_string().contains("candidate"));
        assert!(denied.to_string().contains("bulk_reject"));

        let conflict = WorkflowError::from(StoreError::Backend("disk full".to_string()));
        assert_eq!(conflict.code(), "store_error");
    }

    #[test]
    fn application_id_parse_rejects_garbage() {
        assert!(ApplicationId::parse("not-a-ulid").is_err());
        let id = ApplicationId::new();
        assert_eq!(ApplicationId::parse(&id.to_string()), Ok(id));
    }

    #[test]
    fn opaque_ids_serialize_transparently() {
        let value = serde_json::to_value(CandidateId::new("cand-1"));
        assert_eq!(value.ok(), Some(serde_json::json!("cand-1")));
    }

    #[test]
    fn parse_rfc3339_utc_rejects_offsets() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }
}
