use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    ensure_non_empty, now_utc, Action, ActorId, Application, ApplicationFilter, ApplicationId,
    ApplicationStatus, CandidateId, Interview, InterviewCancellation, InterviewCompletion,
    InterviewId, InterviewInput, InterviewOutcome, InterviewUpdate, NotificationDispatcher,
    NotificationKind, PermissionGate, PositionId, PostingId, PostingRepository, Role,
    TransitionEvent, WorkflowError, WorkflowStore, REJECTION_NOTE_PREFIX,
};

/// Who is invoking an operation. A missing role is always denied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub role: Option<Role>,
    pub actor: Option<ActorId>,
}

impl Caller {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role: Some(role),
            actor: None,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Application and interview as committed by an interview operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterviewTransition {
    pub application: Application,
    pub interview: Interview,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkRejectFailure {
    pub application_id: ApplicationId,
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkRejectOutcome {
    pub rejected: usize,
    pub rejected_ids: Vec<ApplicationId>,
    pub failures: Vec<BulkRejectFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateAnalytics {
    pub candidate_id: CandidateId,
    pub total: usize,
    pub by_status: BTreeMap<ApplicationStatus, usize>,
}

/// Owns the application state machine.
///
/// Every mutating operation runs the same pipeline: permission check, input
/// validation, load, terminal and adjacency checks against the freshly loaded
/// record, mutation, one revision-checked store write, then a best-effort
/// notification. Any failure before the write leaves the store untouched.
pub struct ApplicationWorkflow<'a> {
    store: &'a dyn WorkflowStore,
    postings: &'a dyn PostingRepository,
    notifier: &'a dyn NotificationDispatcher,
    permissions: &'a PermissionGate,
    clock: fn() -> OffsetDateTime,
}

impl<'a> ApplicationWorkflow<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn WorkflowStore,
        postings: &'a dyn PostingRepository,
        notifier: &'a dyn NotificationDispatcher,
        permissions: &'a PermissionGate,
    ) -> Self {
        Self {
            store,
            postings,
            notifier,
            permissions,
            clock: now_utc,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    /// Opens a new application in `applied`.
    ///
    /// # Errors
    /// - [`WorkflowError::PermissionDenied`] without the `apply` action.
    /// - [`WorkflowError::NotFound`] when the posting is missing or inactive,
    ///   or the position is not part of it.
    /// - [`WorkflowError::Validation`] when an open application already exists
    ///   for the same candidate, posting and position.
    pub fn apply(
        &self,
        candidate_id: CandidateId,
        posting_id: &PostingId,
        position_id: PositionId,
        note: Option<String>,
        caller: &Caller,
    ) -> Result<Application, WorkflowError> {
        self.authorize(caller, Action::Apply)?;
        ensure_non_empty("candidate_id", candidate_id.as_str())?;

        let posting = self
            .postings
            .find_active_posting(posting_id)?
            .ok_or_else(|| WorkflowError::not_found("posting", posting_id))?;
        if !posting.has_position(&position_id) {
            return Err(WorkflowError::not_found("position", &position_id));
        }

        let existing = self.store.find_applications(&ApplicationFilter {
            candidate_id: Some(candidate_id.clone()),
            posting_id: Some(posting.posting_id.clone()),
            position_id: Some(position_id.clone()),
            status: None,
        })?;
        if let Some(open) = existing.iter().find(|application| application.is_open()) {
            return Err(WorkflowError::Validation(format!(
                "candidate {candidate_id} already has open application {} for posting {posting_id}, position {position_id}",
                open.application_id
            )));
        }

        let application = Application::open(
            candidate_id,
            &posting,
            position_id,
            (self.clock)(),
            caller.actor.clone(),
            clean_note(note),
        );
        let saved = self.store.save_application(&application)?;
        tracing::info!(
            application_id = %saved.application_id,
            candidate_id = %saved.candidate_id,
            posting_id = %saved.posting_id,
            to = %saved.status,
            operation = "apply",
            "application opened"
        );
        Ok(saved)
    }

    /// Generic transition along the adjacency table.
    ///
    /// A move into `withdrawn` also cancels the active interview. Only a move
    /// into `shortlisted` notifies.
    ///
    /// # Errors
    /// - [`WorkflowError::InvalidTransition`] for an unreachable `next`
    ///   (including `applied`).
    /// - [`WorkflowError::TerminalState`] when the application is terminal.
    /// - [`WorkflowError::PermissionDenied`] without the action `next` maps to.
    ///   For `applied`, which no action reaches, a role without any grant is
    ///   denied `correct` before the application is looked up.
    pub fn update_status(
        &self,
        application_id: ApplicationId,
        next: ApplicationStatus,
        note: Option<String>,
        caller: &Caller,
    ) -> Result<Application, WorkflowError> {
        let Some(action) = Action::for_target(next) else {
            let granted = caller
                .role
                .as_ref()
                .is_some_and(|role| !self.permissions.actions_for(role).is_empty());
            if !granted {
                self.authorize(caller, Action::Correct)?;
            }
            let application = self.load(application_id)?;
            return Err(WorkflowError::InvalidTransition {
                from: application.status,
                to: next,
            });
        };
        self.authorize(caller, action)?;

        let mut application = self.load(application_id)?;
        ensure_not_terminal(&application, "update_status")?;
        ensure_transition(&application, next)?;

        let at = (self.clock)();
        let interview = if next == ApplicationStatus::Withdrawn {
            self.cancel_active_interview(&application, InterviewCancellation::default(), at)?
        } else {
            None
        };

        let from = application.status;
        application.record_transition(next, at, caller.actor.clone(), clean_note(note));
        let saved = self
            .store
            .save_transition(&application, interview.as_slice())?;
        log_transition(&saved, from, "update_status");

        if next == ApplicationStatus::Shortlisted {
            self.dispatch(&TransitionEvent::new(
                NotificationKind::Shortlisted,
                &saved,
                None,
            ));
        }
        Ok(saved)
    }

    /// Creates an interview and moves the application to
    /// `interview_scheduled`. Legal from `applied`, `shortlisted` and
    /// `interview_rescheduled`. An earlier interview that is still
    /// `scheduled` is cancelled in the same write, so at most one interview
    /// per application is active.
    ///
    /// # Errors
    /// - [`WorkflowError::Validation`] for invalid interview fields.
    /// - [`WorkflowError::TerminalState`] or
    ///   [`WorkflowError::InvalidTransition`] when the current status does not
    ///   allow scheduling.
    pub fn schedule_interview(
        &self,
        application_id: ApplicationId,
        input: InterviewInput,
        caller: &Caller,
    ) -> Result<InterviewTransition, WorkflowError> {
        self.authorize(caller, Action::ScheduleInterview)?;
        input.validate()?;

        let mut application = self.load(application_id)?;
        ensure_not_terminal(&application, "schedule_interview")?;
        ensure_transition(&application, ApplicationStatus::InterviewScheduled)?;

        let at = (self.clock)();
        let interview = Interview::schedule(
            application.posting_id.clone(),
            application.application_id,
            input,
            at,
            caller.actor.clone(),
        )?;
        let superseded = self.cancel_active_interview(
            &application,
            InterviewCancellation {
                rejection_reason: None,
                notes: Some(format!("superseded by interview {}", interview.interview_id)),
            },
            at,
        )?;
        let mut interviews: Vec<Interview> = superseded.into_iter().collect();
        interviews.push(interview.clone());

        let from = application.status;
        application.record_transition(
            ApplicationStatus::InterviewScheduled,
            at,
            caller.actor.clone(),
            None,
        );
        let saved = self.store.save_transition(&application, &interviews)?;
        log_transition(&saved, from, "schedule_interview");

        self.dispatch(&TransitionEvent::new(
            NotificationKind::InterviewScheduled,
            &saved,
            Some(&interview),
        ));
        Ok(InterviewTransition {
            application: saved,
            interview,
        })
    }

    /// Changes the supplied interview fields and moves the application to
    /// `interview_rescheduled`. Rescheduling again while already rescheduled
    /// updates the interview without adding a ledger entry.
    ///
    /// # Errors
    /// - [`WorkflowError::NotFound`] when the interview does not exist or
    ///   belongs to another application.
    /// - [`WorkflowError::InvalidInterviewTransition`] when the interview is
    ///   no longer `scheduled`.
    pub fn reschedule_interview(
        &self,
        application_id: ApplicationId,
        interview_id: InterviewId,
        update: InterviewUpdate,
        caller: &Caller,
    ) -> Result<InterviewTransition, WorkflowError> {
        self.authorize(caller, Action::RescheduleInterview)?;
        update.validate()?;

        let mut application = self.load(application_id)?;
        ensure_not_terminal(&application, "reschedule_interview")?;
        if !matches!(
            application.status,
            ApplicationStatus::InterviewScheduled | ApplicationStatus::InterviewRescheduled
        ) {
            return Err(WorkflowError::InvalidTransition {
                from: application.status,
                to: ApplicationStatus::InterviewRescheduled,
            });
        }

        let mut interview = self
            .store
            .get_interview(interview_id)?
            .filter(|interview| interview.application_id == application_id)
            .ok_or_else(|| WorkflowError::not_found("interview", interview_id))?;

        let at = (self.clock)();
        interview.reschedule(update, at)?;

        let from = application.status;
        if from == ApplicationStatus::InterviewRescheduled {
            application.updated_at = at;
        } else {
            application.record_transition(
                ApplicationStatus::InterviewRescheduled,
                at,
                caller.actor.clone(),
                None,
            );
        }
        let saved = self
            .store
            .save_transition(&application, std::slice::from_ref(&interview))?;
        log_transition(&saved, from, "reschedule_interview");

        self.dispatch(&TransitionEvent::new(
            NotificationKind::InterviewRescheduled,
            &saved,
            Some(&interview),
        ));
        Ok(InterviewTransition {
            application: saved,
            interview,
        })
    }

    /// Completes the latest interview and moves the application to
    /// `interview_passed` or `interview_failed`.
    ///
    /// # Errors
    /// - [`WorkflowError::Validation`] for a score above 10.
    /// - [`WorkflowError::NotFound`] when no interview exists.
    /// - [`WorkflowError::InvalidInterviewTransition`] when the latest
    ///   interview is already completed or cancelled.
    pub fn complete_interview(
        &self,
        application_id: ApplicationId,
        outcome: InterviewOutcome,
        completion: InterviewCompletion,
        note: Option<String>,
        caller: &Caller,
    ) -> Result<InterviewTransition, WorkflowError> {
        self.authorize(caller, Action::CompleteInterview)?;
        completion.validate()?;

        let next = outcome.application_status();
        let mut application = self.load(application_id)?;
        ensure_not_terminal(&application, "complete_interview")?;
        ensure_transition(&application, next)?;

        let mut interview = self
            .store
            .find_latest_interview(application_id)?
            .ok_or_else(|| WorkflowError::not_found("interview for application", application_id))?;

        let at = (self.clock)();
        interview.complete(outcome, completion, at)?;

        let from = application.status;
        application.record_transition(next, at, caller.actor.clone(), clean_note(note));
        let saved = self
            .store
            .save_transition(&application, std::slice::from_ref(&interview))?;
        log_transition(&saved, from, "complete_interview");

        let kind = match outcome {
            InterviewOutcome::Passed => NotificationKind::InterviewPassed,
            InterviewOutcome::Failed => NotificationKind::InterviewFailed,
        };
        self.dispatch(&TransitionEvent::new(kind, &saved, Some(&interview)));
        Ok(InterviewTransition {
            application: saved,
            interview,
        })
    }

    /// Withdraws the candidate's latest open application for the posting.
    ///
    /// Idempotent: when every matching application is already withdrawn the
    /// most recent one is returned unchanged and nothing is written.
    ///
    /// # Errors
    /// [`WorkflowError::NotFound`] when the candidate never applied to the
    /// posting.
    pub fn withdraw(
        &self,
        candidate_id: &CandidateId,
        posting_id: &PostingId,
        note: Option<String>,
        caller: &Caller,
    ) -> Result<Application, WorkflowError> {
        self.authorize(caller, Action::Withdraw)?;

        let applications = self.store.find_applications(&ApplicationFilter {
            candidate_id: Some(candidate_id.clone()),
            posting_id: Some(posting_id.clone()),
            ..ApplicationFilter::default()
        })?;

        let Some(mut application) = applications
            .iter()
            .rev()
            .find(|application| application.is_open())
            .cloned()
        else {
            return applications.last().cloned().ok_or_else(|| {
                WorkflowError::not_found(
                    "application",
                    format!("candidate {candidate_id} posting {posting_id}"),
                )
            });
        };

        let at = (self.clock)();
        let interview = self.cancel_active_interview(
            &application,
            InterviewCancellation {
                rejection_reason: None,
                notes: Some("application withdrawn".to_string()),
            },
            at,
        )?;

        let from = application.status;
        application.record_transition(
            ApplicationStatus::Withdrawn,
            at,
            caller.actor.clone(),
            clean_note(note),
        );
        let saved = self
            .store
            .save_transition(&application, interview.as_slice())?;
        log_transition(&saved, from, "withdraw");

        self.dispatch(&TransitionEvent::new(
            NotificationKind::Withdrawn,
            &saved,
            interview.as_ref(),
        ));
        Ok(saved)
    }

    /// Staff rejection: moves a non-terminal application to `withdrawn` with a
    /// `REJECTED:` note and cancels its active interview.
    ///
    /// # Errors
    /// - [`WorkflowError::Validation`] for an empty reason.
    /// - [`WorkflowError::TerminalState`] when the application is terminal.
    pub fn reject_application(
        &self,
        application_id: ApplicationId,
        reason: &str,
        caller: &Caller,
    ) -> Result<Application, WorkflowError> {
        self.authorize(caller, Action::Reject)?;
        self.reject_authorized(application_id, reason, caller)
    }

    /// Rejects every application of the posting that is still `applied`.
    /// Each rejection commits on its own; failures are collected, not raised.
    ///
    /// # Errors
    /// - [`WorkflowError::PermissionDenied`] without `bulk_reject`.
    /// - [`WorkflowError::Validation`] for an empty reason.
    /// - [`WorkflowError::Store`] when the candidate list cannot be read.
    pub fn bulk_reject_for_posting(
        &self,
        posting_id: &PostingId,
        reason: &str,
        caller: &Caller,
    ) -> Result<BulkRejectOutcome, WorkflowError> {
        self.authorize(caller, Action::BulkReject)?;
        ensure_non_empty("reason", reason)?;

        let targets = self.store.find_applications(&ApplicationFilter {
            posting_id: Some(posting_id.clone()),
            status: Some(ApplicationStatus::Applied),
            ..ApplicationFilter::default()
        })?;

        let mut outcome = BulkRejectOutcome::default();
        for target in targets {
            match self.reject_authorized(target.application_id, reason, caller) {
                Ok(rejected) => {
                    outcome.rejected += 1;
                    outcome.rejected_ids.push(rejected.application_id);
                }
                Err(err) => {
                    tracing::warn!(
                        application_id = %target.application_id,
                        posting_id = %posting_id,
                        code = err.code(),
                        error = %err,
                        "bulk reject skipped application"
                    );
                    outcome.failures.push(BulkRejectFailure {
                        application_id: target.application_id,
                        code: err.code().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            posting_id = %posting_id,
            rejected = outcome.rejected,
            failed = outcome.failures.len(),
            "bulk reject finished"
        );
        Ok(outcome)
    }

    /// Administrative override that sets `status` directly, bypassing the
    /// adjacency table. The ledger entry is flagged `corrected` and its note
    /// carries the `CORRECTION:` prefix. Does not touch interviews and does
    /// not notify.
    ///
    /// # Errors
    /// - [`WorkflowError::Validation`] for an empty reason or a correction to
    ///   the current status.
    /// - [`WorkflowError::Store`] with a duplicate error when reopening would
    ///   create a second open application for the same triple.
    pub fn make_correction(
        &self,
        application_id: ApplicationId,
        corrected: ApplicationStatus,
        reason: &str,
        caller: &Caller,
    ) -> Result<Application, WorkflowError> {
        self.authorize(caller, Action::Correct)?;
        ensure_non_empty("reason", reason)?;

        let mut application = self.load(application_id)?;
        if application.status == corrected {
            return Err(WorkflowError::Validation(format!(
                "application {application_id} is already {corrected}"
            )));
        }

        let from = application.status;
        application.record_correction(corrected, (self.clock)(), caller.actor.clone(), reason);
        let saved = self.store.save_application(&application)?;
        log_transition(&saved, from, "make_correction");
        Ok(saved)
    }

    /// # Errors
    /// [`WorkflowError::NotFound`] when the application does not exist.
    pub fn get_by_id(&self, application_id: ApplicationId) -> Result<Application, WorkflowError> {
        self.load(application_id)
    }

    /// # Errors
    /// [`WorkflowError::NotFound`] when the application does not exist.
    pub fn latest_interview(
        &self,
        application_id: ApplicationId,
    ) -> Result<Option<Interview>, WorkflowError> {
        self.load(application_id)?;
        Ok(self.store.find_latest_interview(application_id)?)
    }

    /// Counts the candidate's applications per status, zero-filled.
    ///
    /// # Errors
    /// [`WorkflowError::Store`] when the store cannot be read.
    pub fn analytics(
        &self,
        candidate_id: &CandidateId,
    ) -> Result<CandidateAnalytics, WorkflowError> {
        let applications = self.store.find_applications(&ApplicationFilter {
            candidate_id: Some(candidate_id.clone()),
            ..ApplicationFilter::default()
        })?;

        let mut by_status: BTreeMap<ApplicationStatus, usize> = ApplicationStatus::ALL
            .into_iter()
            .map(|status| (status, 0))
            .collect();
        for application in &applications {
            *by_status.entry(application.status).or_insert(0) += 1;
        }

        Ok(CandidateAnalytics {
            candidate_id: candidate_id.clone(),
            total: applications.len(),
            by_status,
        })
    }

    /// Returns the subset of `position_ids` the candidate holds an open
    /// application for, in input order without repeats.
    ///
    /// # Errors
    /// [`WorkflowError::Store`] when the store cannot be read.
    pub fn applied_position_ids(
        &self,
        candidate_id: &CandidateId,
        position_ids: &[PositionId],
    ) -> Result<Vec<PositionId>, WorkflowError> {
        let open: Vec<PositionId> = self
            .store
            .find_applications(&ApplicationFilter {
                candidate_id: Some(candidate_id.clone()),
                ..ApplicationFilter::default()
            })?
            .into_iter()
            .filter(Application::is_open)
            .map(|application| application.position_id)
            .collect();

        let mut applied: Vec<PositionId> = Vec::new();
        for position_id in position_ids {
            if open.contains(position_id) && !applied.contains(position_id) {
                applied.push(position_id.clone());
            }
        }
        Ok(applied)
    }

    /// # Errors
    /// [`WorkflowError::Store`] when the store cannot be read.
    pub fn list_for_posting(
        &self,
        posting_id: &PostingId,
        status: Option<ApplicationStatus>,
    ) -> Result<Vec<Application>, WorkflowError> {
        Ok(self.store.find_applications(&ApplicationFilter {
            posting_id: Some(posting_id.clone()),
            status,
            ..ApplicationFilter::default()
        })?)
    }

    fn reject_authorized(
        &self,
        application_id: ApplicationId,
        reason: &str,
        caller: &Caller,
    ) -> Result<Application, WorkflowError> {
        ensure_non_empty("reason", reason)?;
        let reason = reason.trim();

        let mut application = self.load(application_id)?;
        ensure_not_terminal(&application, "reject")?;

        let at = (self.clock)();
        let interview = self.cancel_active_interview(
            &application,
            InterviewCancellation {
                rejection_reason: Some(reason.to_string()),
                notes: None,
            },
            at,
        )?;

        let from = application.status;
        application.record_transition(
            ApplicationStatus::Withdrawn,
            at,
            caller.actor.clone(),
            Some(format!("{REJECTION_NOTE_PREFIX}{reason}")),
        );
        let saved = self
            .store
            .save_transition(&application, interview.as_slice())?;
        log_transition(&saved, from, "reject");

        self.dispatch(&TransitionEvent::new(
            NotificationKind::Rejected,
            &saved,
            interview.as_ref(),
        ));
        Ok(saved)
    }

    fn cancel_active_interview(
        &self,
        application: &Application,
        cancellation: InterviewCancellation,
        at: OffsetDateTime,
    ) -> Result<Option<Interview>, WorkflowError> {
        let Some(mut interview) = self
            .store
            .find_latest_interview(application.application_id)?
            .filter(Interview::is_active)
        else {
            return Ok(None);
        };
        interview.cancel(cancellation, at)?;
        Ok(Some(interview))
    }

    fn authorize(&self, caller: &Caller, action: Action) -> Result<(), WorkflowError> {
        self.permissions.authorize(caller.role.as_ref(), action)
    }

    fn load(&self, application_id: ApplicationId) -> Result<Application, WorkflowError> {
        self.store
            .get_application(application_id)?
            .ok_or_else(|| WorkflowError::not_found("application", application_id))
    }

    // Runs after commit. Errors and panics stay inside this boundary.
    fn dispatch(&self, event: &TransitionEvent) {
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| self.notifier.notify(event)));
        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                application_id = %event.application_id,
                kind = %event.kind,
                error = %err,
                "notification failed; transition kept"
            ),
            Err(_) => tracing::warn!(
                application_id = %event.application_id,
                kind = %event.kind,
                "notification dispatcher panicked; transition kept"
            ),
        }
    }
}

fn ensure_not_terminal(
    application: &Application,
    operation: &'static str,
) -> Result<(), WorkflowError> {
    if application.status.is_terminal() {
        return Err(WorkflowError::TerminalState {
            application_id: application.application_id,
            status: application.status,
            operation,
        });
    }
    Ok(())
}

fn ensure_transition(
    application: &Application,
    next: ApplicationStatus,
) -> Result<(), WorkflowError> {
    if !application.status.can_transition_to(next) {
        return Err(WorkflowError::InvalidTransition {
            from: application.status,
            to: next,
        });
    }
    Ok(())
}

fn clean_note(note: Option<String>) -> Option<String> {
    note.map(|note| note.trim().to_string())
        .filter(|note| !note.is_empty())
}

fn log_transition(application: &Application, from: ApplicationStatus, operation: &'static str) {
    tracing::info!(
        application_id = %application.application_id,
        from = %from,
        to = %application.status,
        revision = application.revision,
        operation,
        "transition committed"
    );
}
