use std::sync::{Mutex, MutexGuard};

use crate::{
    Application, ApplicationFilter, ApplicationId, Interview, InterviewId, Posting, PostingId,
    PostingRepository, StoreError, WorkflowError, WorkflowStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    postings: Vec<Posting>,
    applications: Vec<Application>,
    interviews: Vec<Interview>,
}

impl MemoryState {
    // Checks revision and uniqueness without writing. Returns the slot to
    // overwrite (None = append) and the record as it will be stored.
    fn stage_application(
        &self,
        application: &Application,
    ) -> Result<(Option<usize>, Application), StoreError> {
        if application.is_open() {
            let duplicate = self.applications.iter().any(|existing| {
                existing.application_id != application.application_id
                    && existing.is_open()
                    && existing.candidate_id == application.candidate_id
                    && existing.posting_id == application.posting_id
                    && existing.position_id == application.position_id
            });
            if duplicate {
                return Err(StoreError::DuplicateApplication {
                    candidate_id: application.candidate_id.clone(),
                    posting_id: application.posting_id.clone(),
                    position_id: application.position_id.clone(),
                });
            }
        }

        let conflict = || StoreError::RevisionConflict {
            application_id: application.application_id,
            expected: application.revision,
        };
        let slot = self
            .applications
            .iter()
            .position(|existing| existing.application_id == application.application_id);

        let mut stored = application.clone();
        match (slot, application.revision) {
            (None, 0) => {
                stored.revision = 1;
                Ok((None, stored))
            }
            (Some(index), revision) if revision > 0 => {
                if self.applications[index].revision != revision {
                    return Err(conflict());
                }
                stored.revision = revision + 1;
                Ok((Some(index), stored))
            }
            _ => Err(conflict()),
        }
    }

    fn commit_application(&mut self, slot: Option<usize>, stored: Application) {
        match slot {
            Some(index) => self.applications[index] = stored,
            None => self.applications.push(stored),
        }
    }

    fn put_interview(&mut self, interview: &Interview) {
        match self
            .interviews
            .iter_mut()
            .find(|existing| existing.interview_id == interview.interview_id)
        {
            Some(existing) => *existing = interview.clone(),
            None => self.interviews.push(interview.clone()),
        }
    }
}

/// Process-local store backing both collaborator traits.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    state: Mutex<MemoryState>,
}

impl InMemoryWorkflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a posting.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] for an invalid posting and
    /// [`WorkflowError::Store`] when the state lock is poisoned.
    pub fn upsert_posting(&self, posting: Posting) -> Result<(), WorkflowError> {
        posting.validate()?;
        let mut state = self.lock()?;
        match state
            .postings
            .iter_mut()
            .find(|existing| existing.posting_id == posting.posting_id)
        {
            Some(existing) => *existing = posting,
            None => state.postings.push(posting),
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`StoreError::Backend`] when the state lock is poisoned.
    pub fn get_posting(&self, posting_id: &PostingId) -> Result<Option<Posting>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .postings
            .iter()
            .find(|posting| posting.posting_id == *posting_id)
            .cloned())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    fn get_application(&self, id: ApplicationId) -> Result<Option<Application>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .applications
            .iter()
            .find(|application| application.application_id == id)
            .cloned())
    }

    fn find_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .applications
            .iter()
            .filter(|application| filter.matches(application))
            .cloned()
            .collect())
    }

    fn save_application(&self, application: &Application) -> Result<Application, StoreError> {
        let mut state = self.lock()?;
        let (slot, stored) = state.stage_application(application)?;
        state.commit_application(slot, stored.clone());
        Ok(stored)
    }

    fn get_interview(&self, id: InterviewId) -> Result<Option<Interview>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .interviews
            .iter()
            .find(|interview| interview.interview_id == id)
            .cloned())
    }

    fn find_latest_interview(
        &self,
        application_id: ApplicationId,
    ) -> Result<Option<Interview>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .interviews
            .iter()
            .rev()
            .find(|interview| interview.application_id == application_id)
            .cloned())
    }

    fn save_interview(&self, interview: &Interview) -> Result<Interview, StoreError> {
        let mut state = self.lock()?;
        state.put_interview(interview);
        Ok(interview.clone())
    }

    fn save_transition(
        &self,
        application: &Application,
        interviews: &[Interview],
    ) -> Result<Application, StoreError> {
        let mut state = self.lock()?;
        let (slot, stored) = state.stage_application(application)?;
        for interview in interviews {
            state.put_interview(interview);
        }
        state.commit_application(slot, stored.clone());
        Ok(stored)
    }
}

impl PostingRepository for InMemoryWorkflowStore {
    fn find_active_posting(&self, posting_id: &PostingId) -> Result<Option<Posting>, StoreError> {
        Ok(self.get_posting(posting_id)?.filter(|posting| posting.active))
    }
}
