use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{
    AgencyId, Application, ApplicationId, ApplicationStatus, CandidateId, Interview,
    InterviewBrief, InterviewId, PositionId, Posting, PostingId, StoreError,
};

/// Conjunctive application query. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationFilter {
    pub candidate_id: Option<CandidateId>,
    pub posting_id: Option<PostingId>,
    pub position_id: Option<PositionId>,
    pub status: Option<ApplicationStatus>,
}

impl ApplicationFilter {
    #[must_use]
    pub fn matches(&self, application: &Application) -> bool {
        if matches!(&self.candidate_id, Some(id) if *id != application.candidate_id) {
            return false;
        }
        if matches!(&self.posting_id, Some(id) if *id != application.posting_id) {
            return false;
        }
        if matches!(&self.position_id, Some(id) if *id != application.position_id) {
            return false;
        }
        !matches!(self.status, Some(status) if status != application.status)
    }
}

/// Durable state behind the engine.
///
/// Saving an application is conditional on its `revision`: `0` inserts a new
/// record at revision 1, anything else must match the stored revision and is
/// incremented on write. A mismatch is a [`StoreError::RevisionConflict`].
/// Listing methods return records in creation order.
pub trait WorkflowStore {
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn get_application(&self, id: ApplicationId) -> Result<Option<Application>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn find_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, StoreError>;

    /// Persists status and the full history atomically.
    ///
    /// # Errors
    /// Returns [`StoreError::RevisionConflict`] on a stale revision and
    /// [`StoreError::DuplicateApplication`] when a second open application
    /// would exist for the same candidate, posting and position.
    fn save_application(&self, application: &Application) -> Result<Application, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn get_interview(&self, id: InterviewId) -> Result<Option<Interview>, StoreError>;

    /// Most recently created interview for the application.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn find_latest_interview(
        &self,
        application_id: ApplicationId,
    ) -> Result<Option<Interview>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn save_interview(&self, interview: &Interview) -> Result<Interview, StoreError>;

    /// Writes the interviews, in order, and the application as one unit.
    /// Nothing is written when any part fails.
    ///
    /// # Errors
    /// Same as [`WorkflowStore::save_application`].
    fn save_transition(
        &self,
        application: &Application,
        interviews: &[Interview],
    ) -> Result<Application, StoreError>;
}

pub trait PostingRepository {
    /// Returns the posting only when it exists and is active.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn find_active_posting(&self, posting_id: &PostingId) -> Result<Option<Posting>, StoreError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Shortlisted,
    InterviewScheduled,
    InterviewRescheduled,
    InterviewPassed,
    InterviewFailed,
    Withdrawn,
    Rejected,
}

impl NotificationKind {
    pub const ALL: [Self; 7] = [
        Self::Shortlisted,
        Self::InterviewScheduled,
        Self::InterviewRescheduled,
        Self::InterviewPassed,
        Self::InterviewFailed,
        Self::Withdrawn,
        Self::Rejected,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shortlisted => "shortlisted",
            Self::InterviewScheduled => "interview_scheduled",
            Self::InterviewRescheduled => "interview_rescheduled",
            Self::InterviewPassed => "interview_passed",
            Self::InterviewFailed => "interview_failed",
            Self::Withdrawn => "withdrawn",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl Display for NotificationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionEvent {
    pub kind: NotificationKind,
    pub application_id: ApplicationId,
    pub candidate_id: CandidateId,
    pub posting_id: PostingId,
    pub agency_id: AgencyId,
    pub interview: Option<InterviewBrief>,
}

impl TransitionEvent {
    #[must_use]
    pub fn new(
        kind: NotificationKind,
        application: &Application,
        interview: Option<&Interview>,
    ) -> Self {
        Self {
            kind,
            application_id: application.application_id,
            candidate_id: application.candidate_id.clone(),
            posting_id: application.posting_id.clone(),
            agency_id: application.agency_id.clone(),
            interview: interview.map(Interview::brief),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Receives committed transitions. Failures are logged by the engine and
/// never reach the caller of the triggering operation.
pub trait NotificationDispatcher {
    /// # Errors
    /// Returns [`NotificationError`] when delivery fails.
    fn notify(&self, event: &TransitionEvent) -> Result<(), NotificationError>;
}

/// Dispatcher that only emits a tracing event per notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationDispatcher;

impl NotificationDispatcher for TracingNotificationDispatcher {
    fn notify(&self, event: &TransitionEvent) -> Result<(), NotificationError> {
        tracing::info!(
            kind = %event.kind,
            application_id = %event.application_id,
            candidate_id = %event.candidate_id,
            agency_id = %event.agency_id,
            interview_id = ?event.interview.as_ref().map(|brief| brief.interview_id.to_string()),
            "notification"
        );
        Ok(())
    }
}
