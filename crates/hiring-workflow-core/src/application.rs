use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    ActorId, AgencyId, ApplicationId, CandidateId, PositionId, PostingId, WorkflowError,
};

/// Prefix stamped on every correction note in the ledger.
pub const CORRECTION_NOTE_PREFIX: &str = "CORRECTION: ";
/// Prefix stamped on the note of a staff rejection.
pub const REJECTION_NOTE_PREFIX: &str = "REJECTED: ";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Applied,
    Shortlisted,
    InterviewScheduled,
    InterviewRescheduled,
    InterviewPassed,
    InterviewFailed,
    Withdrawn,
}

impl ApplicationStatus {
    pub const ALL: [Self; 7] = [
        Self::Applied,
        Self::Shortlisted,
        Self::InterviewScheduled,
        Self::InterviewRescheduled,
        Self::InterviewPassed,
        Self::InterviewFailed,
        Self::Withdrawn,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Shortlisted => "shortlisted",
            Self::InterviewScheduled => "interview_scheduled",
            Self::InterviewRescheduled => "interview_rescheduled",
            Self::InterviewPassed => "interview_passed",
            Self::InterviewFailed => "interview_failed",
            Self::Withdrawn => "withdrawn",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "applied" => Some(Self::Applied),
            "shortlisted" => Some(Self::Shortlisted),
            "interview_scheduled" => Some(Self::InterviewScheduled),
            "interview_rescheduled" => Some(Self::InterviewRescheduled),
            "interview_passed" => Some(Self::InterviewPassed),
            "interview_failed" => Some(Self::InterviewFailed),
            "withdrawn" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    /// Statuses reachable from `self` through a normal transition.
    #[must_use]
    pub fn allowed_next(self) -> &'static [Self] {
        match self {
            Self::Applied => &[Self::Shortlisted, Self::InterviewScheduled, Self::Withdrawn],
            Self::Shortlisted => &[Self::InterviewScheduled, Self::Withdrawn],
            Self::InterviewScheduled => &[
                Self::InterviewRescheduled,
                Self::InterviewPassed,
                Self::InterviewFailed,
                Self::Withdrawn,
            ],
            Self::InterviewRescheduled => &[
                Self::InterviewScheduled,
                Self::InterviewPassed,
                Self::InterviewFailed,
                Self::Withdrawn,
            ],
            Self::InterviewPassed | Self::InterviewFailed | Self::Withdrawn => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_next().contains(&next)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Withdrawal stays available after a pass/fail outcome; only an already
    /// withdrawn application cannot be withdrawn again.
    #[must_use]
    pub fn can_withdraw(self) -> bool {
        self != Self::Withdrawn
    }
}

impl Display for ApplicationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub prev_status: Option<ApplicationStatus>,
    pub next_status: ApplicationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub updated_by: Option<ActorId>,
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub corrected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerViolation {
    pub index: usize,
    pub code: String,
    pub message: String,
}

/// Append-only sequence of status changes embedded in an application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct HistoryLedger(Vec<HistoryEntry>);

impl HistoryLedger {
    #[must_use]
    pub fn open(at: OffsetDateTime, by: Option<ActorId>, note: Option<String>) -> Self {
        Self(vec![HistoryEntry {
            prev_status: None,
            next_status: ApplicationStatus::Applied,
            updated_at: at,
            updated_by: by,
            note,
            corrected: false,
        }])
    }

    /// Rebuilds a ledger from persisted entries.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when `entries` is empty.
    pub fn from_entries(entries: Vec<HistoryEntry>) -> Result<Self, WorkflowError> {
        if entries.is_empty() {
            return Err(WorkflowError::Validation(
                "history MUST contain at least the applied entry".to_string(),
            ));
        }
        Ok(Self(entries))
    }

    pub fn append(&mut self, entry: HistoryEntry) {
        self.0.push(entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.0
    }

    #[must_use]
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.0.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks the ledger against the workflow invariants.
    ///
    /// Every entry must chain from the previous one, the first entry must
    /// open in `applied` from nothing, and each uncorrected pair must be a
    /// legal transition (withdrawal is legal from every non-withdrawn status).
    #[must_use]
    pub fn audit(&self, current: ApplicationStatus) -> Vec<LedgerViolation> {
        let mut violations = Vec::new();

        let Some(first) = self.0.first() else {
            violations.push(LedgerViolation {
                index: 0,
                code: "empty_history".to_string(),
                message: "history is empty".to_string(),
            });
            return violations;
        };

        if first.prev_status.is_some() || first.next_status != ApplicationStatus::Applied {
            violations.push(LedgerViolation {
                index: 0,
                code: "invalid_opening_entry".to_string(),
                message: "first entry MUST move from nothing to applied".to_string(),
            });
        }

        for (index, pair) in self.0.windows(2).enumerate() {
            let (prev, entry) = (&pair[0], &pair[1]);
            let position = index + 1;

            if entry.prev_status != Some(prev.next_status) {
                violations.push(LedgerViolation {
                    index: position,
                    code: "broken_chain".to_string(),
                    message: format!(
                        "entry starts from {} but previous entry ended in {}",
                        entry
                            .prev_status
                            .map_or("nothing", ApplicationStatus::as_str),
                        prev.next_status
                    ),
                });
            }

            if entry.corrected {
                continue;
            }

            let Some(from) = entry.prev_status else {
                continue;
            };
            let legal = from.can_transition_to(entry.next_status)
                || (entry.next_status == ApplicationStatus::Withdrawn && from.can_withdraw());
            if !legal {
                violations.push(LedgerViolation {
                    index: position,
                    code: "illegal_transition".to_string(),
                    message: format!(
                        "uncorrected transition {from} -> {} is not allowed",
                        entry.next_status
                    ),
                });
            }
        }

        if let Some(last) = self.0.last() {
            if last.next_status != current {
                violations.push(LedgerViolation {
                    index: self.0.len() - 1,
                    code: "status_mismatch".to_string(),
                    message: format!(
                        "status is {current} but last history entry ends in {}",
                        last.next_status
                    ),
                });
            }
        }

        violations
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Application {
    pub application_id: ApplicationId,
    pub candidate_id: CandidateId,
    pub posting_id: PostingId,
    pub position_id: PositionId,
    pub agency_id: AgencyId,
    pub status: ApplicationStatus,
    pub history: HistoryLedger,
    #[serde(with = "time::serde::rfc3339::option")]
    pub withdrawn_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub revision: u64,
}

impl Application {
    /// Opens a new, not yet persisted application in `applied`.
    #[must_use]
    pub fn open(
        candidate_id: CandidateId,
        posting: &Posting,
        position_id: PositionId,
        at: OffsetDateTime,
        by: Option<ActorId>,
        note: Option<String>,
    ) -> Self {
        Self {
            application_id: ApplicationId::new(),
            candidate_id,
            posting_id: posting.posting_id.clone(),
            position_id,
            agency_id: posting.agency_id.clone(),
            status: ApplicationStatus::Applied,
            history: HistoryLedger::open(at, by, note),
            withdrawn_at: None,
            created_at: at,
            updated_at: at,
            revision: 0,
        }
    }

    /// Moves to `next` and appends the matching ledger entry. Status,
    /// history and `withdrawn_at` change together or not at all.
    pub(crate) fn record_transition(
        &mut self,
        next: ApplicationStatus,
        at: OffsetDateTime,
        by: Option<ActorId>,
        note: Option<String>,
    ) {
        self.apply_entry(next, at, by, note, false);
    }

    pub(crate) fn record_correction(
        &mut self,
        next: ApplicationStatus,
        at: OffsetDateTime,
        by: Option<ActorId>,
        reason: &str,
    ) {
        let note = format!("{CORRECTION_NOTE_PREFIX}{}", reason.trim());
        self.apply_entry(next, at, by, Some(note), true);
    }

    fn apply_entry(
        &mut self,
        next: ApplicationStatus,
        at: OffsetDateTime,
        by: Option<ActorId>,
        note: Option<String>,
        corrected: bool,
    ) {
        self.history.append(HistoryEntry {
            prev_status: Some(self.status),
            next_status: next,
            updated_at: at,
            updated_by: by,
            note,
            corrected,
        });
        self.status = next;
        self.withdrawn_at = if next == ApplicationStatus::Withdrawn {
            Some(at)
        } else {
            None
        };
        self.updated_at = at;
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status != ApplicationStatus::Withdrawn
    }

    #[must_use]
    pub fn audit(&self) -> Vec<LedgerViolation> {
        let mut violations = self.history.audit(self.status);
        let withdrawn = self.status == ApplicationStatus::Withdrawn;
        if withdrawn != self.withdrawn_at.is_some() {
            violations.push(LedgerViolation {
                index: self.history.len().saturating_sub(1),
                code: "withdrawn_at_mismatch".to_string(),
                message: format!(
                    "withdrawn_at MUST be set exactly when status is withdrawn (status={})",
                    self.status
                ),
            });
        }
        violations
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Posting {
    pub posting_id: PostingId,
    pub agency_id: AgencyId,
    pub title: String,
    pub active: bool,
    pub position_ids: Vec<PositionId>,
}

impl Posting {
    #[must_use]
    pub fn has_position(&self, position_id: &PositionId) -> bool {
        self.position_ids.contains(position_id)
    }

    /// Validates posting fields before they are stored.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when an id or the title is empty.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        crate::ensure_non_empty("posting_id", self.posting_id.as_str())?;
        crate::ensure_non_empty("agency_id", self.agency_id.as_str())?;
        crate::ensure_non_empty("title", &self.title)?;
        for position_id in &self.position_ids {
            crate::ensure_non_empty("position_id", position_id.as_str())?;
        }
        Ok(())
    }
}
