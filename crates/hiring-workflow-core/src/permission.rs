use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ApplicationStatus, Role, WorkflowError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Apply,
    Shortlist,
    ScheduleInterview,
    RescheduleInterview,
    CompleteInterview,
    Withdraw,
    Reject,
    BulkReject,
    Correct,
}

impl Action {
    pub const ALL: [Self; 9] = [
        Self::Apply,
        Self::Shortlist,
        Self::ScheduleInterview,
        Self::RescheduleInterview,
        Self::CompleteInterview,
        Self::Withdraw,
        Self::Reject,
        Self::BulkReject,
        Self::Correct,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Shortlist => "shortlist",
            Self::ScheduleInterview => "schedule_interview",
            Self::RescheduleInterview => "reschedule_interview",
            Self::CompleteInterview => "complete_interview",
            Self::Withdraw => "withdraw",
            Self::Reject => "reject",
            Self::BulkReject => "bulk_reject",
            Self::Correct => "correct",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == value)
    }

    /// Action a generic status update into `target` requires. `applied` is
    /// never a transition target.
    #[must_use]
    pub fn for_target(target: ApplicationStatus) -> Option<Self> {
        match target {
            ApplicationStatus::Applied => None,
            ApplicationStatus::Shortlisted => Some(Self::Shortlist),
            ApplicationStatus::InterviewScheduled => Some(Self::ScheduleInterview),
            ApplicationStatus::InterviewRescheduled => Some(Self::RescheduleInterview),
            ApplicationStatus::InterviewPassed | ApplicationStatus::InterviewFailed => {
                Some(Self::CompleteInterview)
            }
            ApplicationStatus::Withdrawn => Some(Self::Withdraw),
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PermissionConfig {
    pub permissions_version: u32,
    pub roles: BTreeMap<String, BTreeSet<Action>>,
}

impl PermissionConfig {
    /// Validates the role table.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Configuration`] when the version is zero or a
    /// role name is blank.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.permissions_version == 0 {
            return Err(WorkflowError::Configuration(
                "permissions_version MUST be >= 1".to_string(),
            ));
        }

        for role in self.roles.keys() {
            if role.trim().is_empty() || role.trim() != role {
                return Err(WorkflowError::Configuration(format!(
                    "role names MUST be non-empty without surrounding whitespace: {role:?}"
                )));
            }
        }

        Ok(())
    }
}

/// Role → action lookup. Anything not explicitly granted is denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGate {
    config: PermissionConfig,
}

impl PermissionGate {
    /// Builds a gate from a validated role table.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Configuration`] when `config` is invalid.
    pub fn new(config: PermissionConfig) -> Result<Self, WorkflowError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Decodes and validates a role table from JSON.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Configuration`] when decoding fails or the
    /// decoded table is invalid.
    pub fn from_json(value: &Value) -> Result<Self, WorkflowError> {
        let config: PermissionConfig = serde_json::from_value(value.clone()).map_err(|err| {
            WorkflowError::Configuration(format!("invalid permissions JSON payload: {err}"))
        })?;
        Self::new(config)
    }

    /// Built-in table for a staffing agency deployment.
    #[must_use]
    pub fn default_agency() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            "candidate".to_string(),
            BTreeSet::from([Action::Apply, Action::Withdraw]),
        );
        roles.insert(
            "recruiter".to_string(),
            BTreeSet::from([
                Action::Shortlist,
                Action::ScheduleInterview,
                Action::RescheduleInterview,
                Action::CompleteInterview,
                Action::Withdraw,
                Action::Reject,
            ]),
        );
        roles.insert(
            "agency_admin".to_string(),
            Action::ALL.into_iter().collect(),
        );

        Self {
            config: PermissionConfig {
                permissions_version: 1,
                roles,
            },
        }
    }

    #[must_use]
    pub fn config(&self) -> &PermissionConfig {
        &self.config
    }

    #[must_use]
    pub fn is_allowed(&self, role: Option<&Role>, action: Action) -> bool {
        role.and_then(|role| self.config.roles.get(role.as_str()))
            .is_some_and(|actions| actions.contains(&action))
    }

    /// Fails closed unless `role` is granted `action`.
    ///
    /// # Errors
    /// Returns [`WorkflowError::PermissionDenied`] naming the role and action.
    pub fn authorize(&self, role: Option<&Role>, action: Action) -> Result<(), WorkflowError> {
        if self.is_allowed(role, action) {
            return Ok(());
        }

        let role = role.map_or_else(|| "<none>".to_string(), ToString::to_string);
        tracing::debug!(%role, %action, "permission denied");
        Err(WorkflowError::PermissionDenied { role, action })
    }

    #[must_use]
    pub fn actions_for(&self, role: &Role) -> Vec<Action> {
        self.config
            .roles
            .get(role.as_str())
            .map(|actions| actions.iter().copied().collect())
            .unwrap_or_default()
    }
}
