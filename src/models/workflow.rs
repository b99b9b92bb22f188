//! Workflow definitions, instances, tasks and their audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::variables::Variables;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "definition_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefinitionStatus {
    Draft,
    Published,
}

/// How the assignee of a step is chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ApproverRule {
    /// A fixed user
    User { user_id: i64 },
    /// The user id stored in an integer instance variable
    Variable { key: String },
    /// Any one of several users may take the task
    AnyOf { user_ids: Vec<i64> },
    /// The user who started the instance
    Initiator,
    /// Delegated to the participant registered for the business type
    Participant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StepSpec {
    pub name: String,
    pub approver: ApproverRule,
}

/// Approval template for a business type; immutable once published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkflowDefinition {
    pub id: i64,
    pub name: String,
    pub business_type: String,
    pub version: i32,
    pub status: DefinitionStatus,
    /// Whether this is the definition new instances of the business type start from
    pub is_current: bool,
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub row_version: i64,
}

impl WorkflowDefinition {
    pub fn step(&self, index: i32) -> Option<&StepSpec> {
        usize::try_from(index).ok().and_then(|i| self.steps.get(i))
    }

    pub fn ensure_draft(&self) -> AppResult<()> {
        if self.status != DefinitionStatus::Draft {
            return Err(AppError::InvalidState(format!(
                "Workflow definition {} is published and cannot change",
                self.id
            )));
        }
        Ok(())
    }
}

/// Validate a step graph before it is stored
pub fn validate_steps(steps: &[StepSpec]) -> AppResult<()> {
    if steps.is_empty() {
        return Err(AppError::Validation("A workflow needs at least one step".to_string()));
    }
    for (index, step) in steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(AppError::Validation(format!("Step {} has no name", index)));
        }
        match &step.approver {
            ApproverRule::AnyOf { user_ids } if user_ids.is_empty() => {
                return Err(AppError::Validation(format!(
                    "Step '{}' has an empty candidate list",
                    step.name
                )));
            }
            ApproverRule::Variable { key } if key.trim().is_empty() => {
                return Err(AppError::Validation(format!(
                    "Step '{}' names no approver variable",
                    step.name
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "instance_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Terminated,
}

impl InstanceStatus {
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Running, Suspended) | (Suspended, Running) | (Running, Completed) | (Running, Terminated) | (Suspended, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Terminated => "TERMINATED",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final verdict of a completed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "workflow_outcome", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowOutcome {
    Approved,
    Rejected,
}

/// One run of a definition bound to a business entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkflowInstance {
    pub id: i64,
    pub definition_id: i64,
    pub business_type: String,
    pub business_id: i64,
    pub initiator_id: i64,
    pub status: InstanceStatus,
    pub outcome: Option<WorkflowOutcome>,
    pub variables: Variables,
    pub current_step_index: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl WorkflowInstance {
    pub fn transition(&mut self, next: InstanceStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "Workflow instance {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Task actions are only accepted while running
    pub fn ensure_accepts_task_actions(&self) -> AppResult<()> {
        match self.status {
            InstanceStatus::Running => Ok(()),
            InstanceStatus::Suspended => Err(AppError::InstanceSuspended(format!(
                "Workflow instance {} is suspended",
                self.id
            ))),
            status => Err(AppError::InvalidState(format!(
                "Workflow instance {} is {}",
                self.id, status
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "task_result", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResult {
    Approve,
    Reject,
    /// Set by the engine when an instance is terminated
    Cancelled,
}

/// One human decision point within an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkflowTask {
    pub id: i64,
    pub instance_id: i64,
    pub step_index: i32,
    pub name: String,
    /// `None` while the task is offered to candidates
    pub assignee_id: Option<i64>,
    pub candidate_ids: Vec<i64>,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl WorkflowTask {
    /// Whether `user_id` may act on this task
    pub fn is_actionable_by(&self, user_id: i64) -> bool {
        match self.assignee_id {
            Some(assignee) => assignee == user_id,
            None => self.candidate_ids.contains(&user_id),
        }
    }

    pub fn ensure_pending(&self) -> AppResult<()> {
        if self.status != TaskStatus::Pending {
            return Err(AppError::TaskAlreadyResolved(format!(
                "Task {} was already resolved",
                self.id
            )));
        }
        Ok(())
    }

    /// Users who should be told about this task
    pub fn recipients(&self) -> Vec<i64> {
        match self.assignee_id {
            Some(assignee) => vec![assignee],
            None => self.candidate_ids.clone(),
        }
    }
}

/// Who a new task goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub assignee_id: Option<i64>,
    pub candidate_ids: Vec<i64>,
}

impl Assignment {
    pub fn user(user_id: i64) -> Self {
        Self {
            assignee_id: Some(user_id),
            candidate_ids: Vec::new(),
        }
    }

    /// A single candidate is assigned directly
    pub fn any_of(user_ids: Vec<i64>) -> AppResult<Self> {
        match user_ids.as_slice() {
            [] => Err(AppError::Validation("No candidate approvers available".to_string())),
            [only] => Ok(Self::user(*only)),
            _ => Ok(Self {
                assignee_id: None,
                candidate_ids: user_ids,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "history_action", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    Started,
    TaskCreated,
    TaskCompleted,
    TaskTransferred,
    TaskCancelled,
    Suspended,
    Resumed,
    Terminated,
    Completed,
}

/// Audit trail entry of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HistoryEntry {
    pub id: i64,
    pub instance_id: i64,
    pub task_id: Option<i64>,
    pub action: HistoryAction,
    pub actor_id: Option<i64>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub business_type: Option<String>,
    pub status: Option<InstanceStatus>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.business_type.as_deref().map_or(true, |t| instance.business_type == t)
            && self.status.map_or(true, |s| instance.status == s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct WorkflowStatistics {
    pub total_instances: i64,
    pub running_instances: i64,
    pub suspended_instances: i64,
    pub completed_instances: i64,
    pub terminated_instances: i64,
    pub total_tasks: i64,
    pub pending_tasks: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(assignee: Option<i64>, candidates: Vec<i64>) -> WorkflowTask {
        WorkflowTask {
            id: 1,
            instance_id: 2,
            step_index: 0,
            name: "review".to_string(),
            assignee_id: assignee,
            candidate_ids: candidates,
            status: TaskStatus::Pending,
            result: None,
            comment: None,
            created_at: Utc::now(),
            resolved_at: None,
            version: 0,
        }
    }

    #[test]
    fn test_instance_terminal_states_accept_nothing() {
        use InstanceStatus::*;
        for terminal in [Completed, Terminated] {
            assert!(terminal.is_terminal());
            for next in [Running, Suspended, Completed, Terminated] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Suspended.can_transition_to(Terminated));
        assert!(!Suspended.can_transition_to(Completed));
    }

    #[test]
    fn test_candidate_task_authorization() {
        let offered = task(None, vec![3, 4]);
        assert!(offered.is_actionable_by(4));
        assert!(!offered.is_actionable_by(5));

        let assigned = task(Some(3), vec![]);
        assert!(assigned.is_actionable_by(3));
        assert!(!assigned.is_actionable_by(4));
    }

    #[test]
    fn test_single_candidate_is_assigned_directly() {
        assert_eq!(Assignment::any_of(vec![9]).unwrap(), Assignment::user(9));
        assert!(Assignment::any_of(vec![]).is_err());
        assert_eq!(Assignment::any_of(vec![1, 2]).unwrap().assignee_id, None);
    }

    #[test]
    fn test_step_validation() {
        assert!(validate_steps(&[]).is_err());
        let steps = vec![StepSpec {
            name: "desk".to_string(),
            approver: ApproverRule::AnyOf { user_ids: vec![] },
        }];
        assert!(validate_steps(&steps).is_err());

        let steps = vec![
            StepSpec {
                name: "desk".to_string(),
                approver: ApproverRule::Participant,
            },
            StepSpec {
                name: "head".to_string(),
                approver: ApproverRule::User { user_id: 1 },
            },
        ];
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn test_approver_rule_serialization() {
        let rule: ApproverRule = serde_json::from_str(r#"{"rule":"any_of","user_ids":[1,2]}"#).unwrap();
        assert_eq!(rule, ApproverRule::AnyOf { user_ids: vec![1, 2] });
        let rule: ApproverRule = serde_json::from_str(r#"{"rule":"initiator"}"#).unwrap();
        assert_eq!(rule, ApproverRule::Initiator);
    }
}
