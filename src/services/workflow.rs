//! Generic approval workflow engine
//!
//! The engine owns definitions, instances and tasks. Every transition is computed
//! in memory, then written through one [`WorkflowStore::commit`] guarded by the row
//! versions it read. Business domains plug in through [`WorkflowParticipant`]; their
//! outcome callbacks run after the commit, and callback failures are logged only.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use utoipa::ToSchema;

use super::{
    clock::{Clock, IdGenerator},
    notifications::Notifier,
};
use crate::{
    error::{AppError, AppResult},
    models::{
        workflow::{
            validate_steps, ApproverRule, Assignment, DefinitionStatus, HistoryAction, HistoryEntry, InstanceFilter,
            InstanceStatus, StepSpec, TaskResult, TaskStatus, WorkflowDefinition, WorkflowInstance,
            WorkflowOutcome, WorkflowStatistics, WorkflowTask,
        },
        Page, PageRequest, Variables,
    },
    repository::{WorkflowChanges, WorkflowStore},
};

/// Final decision of an instance, handed to its business domain
#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub instance_id: i64,
    pub business_id: i64,
    pub outcome: WorkflowOutcome,
    pub resolver_id: i64,
    pub comment: Option<String>,
    pub variables: Variables,
}

/// A business domain taking part in approval workflows
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowParticipant: Send + Sync {
    /// Assignee for steps whose approver rule is [`ApproverRule::Participant`]
    async fn resolve_assignee(&self, instance: &WorkflowInstance, step: &StepSpec) -> AppResult<Assignment>;

    /// Called once per instance, after the completing commit
    async fn on_outcome(&self, event: &OutcomeEvent) -> AppResult<()>;
}

/// Participants keyed by business type, fixed at startup
#[derive(Clone, Default)]
pub struct ParticipantRegistry {
    participants: Arc<HashMap<String, Arc<dyn WorkflowParticipant>>>,
}

impl ParticipantRegistry {
    pub fn builder() -> ParticipantRegistryBuilder {
        ParticipantRegistryBuilder::default()
    }

    pub fn get(&self, business_type: &str) -> Option<&Arc<dyn WorkflowParticipant>> {
        self.participants.get(business_type)
    }

    pub fn business_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.participants.keys().cloned().collect();
        types.sort();
        types
    }
}

#[derive(Default)]
pub struct ParticipantRegistryBuilder {
    participants: HashMap<String, Arc<dyn WorkflowParticipant>>,
}

impl ParticipantRegistryBuilder {
    pub fn register(
        mut self,
        business_type: impl Into<String>,
        participant: Arc<dyn WorkflowParticipant>,
    ) -> AppResult<Self> {
        let business_type = business_type.into();
        if self.participants.contains_key(&business_type) {
            return Err(AppError::Conflict(format!(
                "A participant is already registered for business type '{}'",
                business_type
            )));
        }
        self.participants.insert(business_type, participant);
        Ok(self)
    }

    pub fn build(self) -> ParticipantRegistry {
        ParticipantRegistry {
            participants: Arc::new(self.participants),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDefinition {
    pub name: String,
    pub business_type: String,
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
    pub created_by: i64,
}

#[derive(Debug, Clone)]
pub struct StartWorkflow {
    pub definition_id: i64,
    pub business_type: String,
    pub business_id: i64,
    pub initiator_id: i64,
    pub variables: Variables,
    /// Id reserved by the caller, when the business record must reference the instance up front
    pub instance_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CompleteTask {
    pub task_id: i64,
    pub actor_id: i64,
    pub result: TaskResult,
    pub comment: Option<String>,
    pub variables: Variables,
}

/// What a task completion changed
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskCompletion {
    pub task: WorkflowTask,
    pub instance: WorkflowInstance,
    /// Task created for the next step, if any
    pub next_task: Option<WorkflowTask>,
    /// Set when this completion finished the instance
    pub outcome: Option<WorkflowOutcome>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    participants: ParticipantRegistry,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        participants: ParticipantRegistry,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            store,
            participants,
            notifier,
            clock,
            ids,
        }
    }

    pub fn participants(&self) -> &ParticipantRegistry {
        &self.participants
    }

    fn history(
        &self,
        instance_id: i64,
        task_id: Option<i64>,
        action: HistoryAction,
        actor_id: Option<i64>,
        detail: Option<String>,
    ) -> HistoryEntry {
        HistoryEntry {
            id: self.ids.next_id(),
            instance_id,
            task_id,
            action,
            actor_id,
            detail,
            at: self.clock.now(),
        }
    }

    async fn commit(&self, changes: WorkflowChanges, what: &str) -> AppResult<()> {
        if self.store.commit(changes).await? {
            Ok(())
        } else {
            Err(AppError::Conflict(format!("{} was modified concurrently", what)))
        }
    }

    // ---- Definitions ----

    async fn load_definition(&self, id: i64) -> AppResult<WorkflowDefinition> {
        self.store
            .get_definition(id)
            .await?
            .ok_or_else(|| AppError::DefinitionNotFound(format!("Workflow definition {} not found", id)))
    }

    pub async fn create_definition(&self, new: NewDefinition) -> AppResult<WorkflowDefinition> {
        if new.business_type.trim().is_empty() {
            return Err(AppError::Validation("Business type is required".to_string()));
        }
        validate_steps(&new.steps)?;

        let version = self.store.latest_version(&new.business_type).await? + 1;
        let definition = WorkflowDefinition {
            id: self.ids.next_id(),
            name: new.name,
            business_type: new.business_type,
            version,
            status: DefinitionStatus::Draft,
            is_current: false,
            description: new.description,
            steps: new.steps,
            created_by: new.created_by,
            created_at: self.clock.now(),
            published_at: None,
            row_version: 0,
        };

        let mut changes = WorkflowChanges::default();
        changes.new_definitions.push(definition.clone());
        self.commit(changes, "Workflow definition").await?;

        tracing::info!(
            definition_id = definition.id,
            business_type = %definition.business_type,
            version = definition.version,
            "Workflow definition created"
        );
        Ok(definition)
    }

    /// Replace the steps of a draft; published definitions are immutable
    pub async fn update_definition_steps(
        &self,
        id: i64,
        steps: Vec<StepSpec>,
        description: Option<String>,
    ) -> AppResult<WorkflowDefinition> {
        let mut definition = self.load_definition(id).await?;
        definition.ensure_draft()?;
        validate_steps(&steps)?;

        definition.steps = steps;
        if description.is_some() {
            definition.description = description;
        }

        let mut changes = WorkflowChanges::default();
        changes.update_definition(definition);
        let updated = changes.definitions[0].value.clone();
        self.commit(changes, "Workflow definition").await?;
        Ok(updated)
    }

    /// Publish a draft and make it the current definition of its business type
    pub async fn publish_definition(&self, id: i64) -> AppResult<WorkflowDefinition> {
        let mut definition = self.load_definition(id).await?;
        definition.ensure_draft()?;

        let mut changes = WorkflowChanges::default();
        if let Some(mut previous) = self.store.current_definition(&definition.business_type).await? {
            previous.is_current = false;
            changes.update_definition(previous);
        }

        definition.status = DefinitionStatus::Published;
        definition.is_current = true;
        definition.published_at = Some(self.clock.now());
        changes.update_definition(definition);

        let published = changes.definitions[changes.definitions.len() - 1].value.clone();
        self.commit(changes, "Workflow definition").await?;

        tracing::info!(
            definition_id = published.id,
            business_type = %published.business_type,
            version = published.version,
            "Workflow definition published"
        );
        Ok(published)
    }

    pub async fn get_definition(&self, id: i64) -> AppResult<WorkflowDefinition> {
        self.load_definition(id).await
    }

    pub async fn list_definitions(
        &self,
        business_type: Option<String>,
        status: Option<DefinitionStatus>,
    ) -> AppResult<Vec<WorkflowDefinition>> {
        self.store.list_definitions(business_type, status).await
    }

    /// The published definition new instances of `business_type` start from, if any
    pub async fn current_definition(&self, business_type: &str) -> AppResult<Option<WorkflowDefinition>> {
        self.store.current_definition(business_type).await
    }

    // ---- Instances ----

    async fn resolve_assignment(&self, instance: &WorkflowInstance, step: &StepSpec) -> AppResult<Assignment> {
        match &step.approver {
            ApproverRule::User { user_id } => Ok(Assignment::user(*user_id)),
            ApproverRule::Variable { key } => instance.variables.get_int(key).map(Assignment::user).ok_or_else(|| {
                AppError::Validation(format!("Variable '{}' does not hold an approver id", key))
            }),
            ApproverRule::AnyOf { user_ids } => Assignment::any_of(user_ids.clone()),
            ApproverRule::Initiator => Ok(Assignment::user(instance.initiator_id)),
            ApproverRule::Participant => {
                let participant = self.participants.get(&instance.business_type).ok_or_else(|| {
                    AppError::Validation(format!(
                        "No participant registered for business type '{}'",
                        instance.business_type
                    ))
                })?;
                participant.resolve_assignee(instance, step).await
            }
        }
    }

    fn new_task(&self, instance: &WorkflowInstance, step_index: i32, step: &StepSpec, assignment: Assignment) -> WorkflowTask {
        WorkflowTask {
            id: self.ids.next_id(),
            instance_id: instance.id,
            step_index,
            name: step.name.clone(),
            assignee_id: assignment.assignee_id,
            candidate_ids: assignment.candidate_ids,
            status: TaskStatus::Pending,
            result: None,
            comment: None,
            created_at: self.clock.now(),
            resolved_at: None,
            version: 0,
        }
    }

    async fn notify_task(&self, task: &WorkflowTask) {
        for recipient in task.recipients() {
            self.notifier.assigned(task.id, recipient).await;
        }
    }

    pub async fn start_workflow(&self, start: StartWorkflow) -> AppResult<WorkflowInstance> {
        let definition = self.load_definition(start.definition_id).await?;
        if definition.status != DefinitionStatus::Published {
            return Err(AppError::DefinitionNotFound(format!(
                "Workflow definition {} is not published",
                definition.id
            )));
        }
        if definition.business_type != start.business_type {
            return Err(AppError::Validation(format!(
                "Workflow definition {} is for '{}', not '{}'",
                definition.id, definition.business_type, start.business_type
            )));
        }
        let first_step = definition
            .step(0)
            .ok_or_else(|| AppError::Internal(format!("Workflow definition {} has no steps", definition.id)))?;

        let instance = WorkflowInstance {
            id: start.instance_id.unwrap_or_else(|| self.ids.next_id()),
            definition_id: definition.id,
            business_type: start.business_type,
            business_id: start.business_id,
            initiator_id: start.initiator_id,
            status: InstanceStatus::Running,
            outcome: None,
            variables: start.variables,
            current_step_index: 0,
            started_at: self.clock.now(),
            ended_at: None,
            version: 0,
        };

        let assignment = self.resolve_assignment(&instance, first_step).await?;
        let task = self.new_task(&instance, 0, first_step, assignment);

        let mut changes = WorkflowChanges::default();
        changes
            .record(self.history(instance.id, None, HistoryAction::Started, Some(instance.initiator_id), None))
            .record(self.history(instance.id, Some(task.id), HistoryAction::TaskCreated, None, Some(task.name.clone())));
        changes.new_instances.push(instance.clone());
        changes.new_tasks.push(task.clone());
        self.commit(changes, "Workflow instance").await?;

        tracing::info!(
            instance_id = instance.id,
            business_type = %instance.business_type,
            business_id = instance.business_id,
            task_id = task.id,
            "Workflow started"
        );
        self.notify_task(&task).await;
        Ok(instance)
    }

    async fn load_instance(&self, id: i64) -> AppResult<WorkflowInstance> {
        self.store
            .get_instance(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Workflow instance {} not found", id)))
    }

    async fn load_task(&self, id: i64) -> AppResult<WorkflowTask> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", id)))
    }

    /// A failed task commit means either someone resolved the task first or some other row moved
    async fn task_commit_failed(&self, task_id: i64) -> AppError {
        match self.store.get_task(task_id).await {
            Ok(Some(task)) if task.status != TaskStatus::Pending => {
                AppError::TaskAlreadyResolved(format!("Task {} was already resolved", task_id))
            }
            Ok(_) => AppError::Conflict(format!("Task {} was modified concurrently", task_id)),
            Err(e) => e,
        }
    }

    /// Resolve a pending task. Completion is at-most-once per task.
    pub async fn complete_task(&self, request: CompleteTask) -> AppResult<TaskCompletion> {
        if request.result == TaskResult::Cancelled {
            return Err(AppError::Validation("A task can only be approved or rejected".to_string()));
        }

        let mut task = self.load_task(request.task_id).await?;
        task.ensure_pending()?;
        if !task.is_actionable_by(request.actor_id) {
            tracing::debug!(task_id = task.id, actor_id = request.actor_id, "Task not assigned to actor");
            return Err(AppError::NotAuthorized(format!(
                "Task {} is not assigned to user {}",
                task.id, request.actor_id
            )));
        }
        let mut instance = self.load_instance(task.instance_id).await?;
        instance.ensure_accepts_task_actions()?;
        let definition = self.load_definition(instance.definition_id).await?;

        let now = self.clock.now();
        task.status = TaskStatus::Completed;
        task.result = Some(request.result);
        task.comment = request.comment.clone();
        task.resolved_at = Some(now);
        task.assignee_id = Some(request.actor_id);
        instance.variables.merge(request.variables);

        let mut changes = WorkflowChanges::default();
        changes.record(self.history(
            instance.id,
            Some(task.id),
            HistoryAction::TaskCompleted,
            Some(request.actor_id),
            Some(format!("{:?}", request.result).to_uppercase()),
        ));

        let mut next_task = None;
        let outcome = match request.result {
            TaskResult::Approve => {
                let next_index = instance.current_step_index + 1;
                match definition.step(next_index) {
                    Some(step) => {
                        instance.current_step_index = next_index;
                        let assignment = self.resolve_assignment(&instance, step).await?;
                        let created = self.new_task(&instance, next_index, step, assignment);
                        changes.record(self.history(
                            instance.id,
                            Some(created.id),
                            HistoryAction::TaskCreated,
                            None,
                            Some(created.name.clone()),
                        ));
                        changes.new_tasks.push(created.clone());
                        next_task = Some(created);
                        None
                    }
                    None => Some(WorkflowOutcome::Approved),
                }
            }
            _ => Some(WorkflowOutcome::Rejected),
        };

        if let Some(outcome) = outcome {
            instance.transition(InstanceStatus::Completed)?;
            instance.outcome = Some(outcome);
            instance.ended_at = Some(now);
            changes.record(self.history(
                instance.id,
                None,
                HistoryAction::Completed,
                Some(request.actor_id),
                Some(format!("{:?}", outcome).to_uppercase()),
            ));
        }

        changes.update_task(task).update_instance(instance);
        let task = changes.tasks[0].value.clone();
        let instance = changes.instances[0].value.clone();
        if !self.store.commit(changes).await? {
            return Err(self.task_commit_failed(task.id).await);
        }

        tracing::info!(
            task_id = task.id,
            instance_id = instance.id,
            actor_id = request.actor_id,
            result = ?request.result,
            outcome = ?outcome,
            "Task completed"
        );

        if let Some(next) = &next_task {
            self.notify_task(next).await;
        }
        if let Some(outcome) = outcome {
            self.dispatch_outcome(&instance, outcome, request.actor_id, request.comment)
                .await;
        }

        Ok(TaskCompletion {
            task,
            instance,
            next_task,
            outcome,
        })
    }

    async fn dispatch_outcome(
        &self,
        instance: &WorkflowInstance,
        outcome: WorkflowOutcome,
        resolver_id: i64,
        comment: Option<String>,
    ) {
        let Some(participant) = self.participants.get(&instance.business_type) else {
            tracing::debug!(instance_id = instance.id, business_type = %instance.business_type, "No participant for outcome");
            return;
        };
        let event = OutcomeEvent {
            instance_id: instance.id,
            business_id: instance.business_id,
            outcome,
            resolver_id,
            comment,
            variables: instance.variables.clone(),
        };
        if let Err(e) = participant.on_outcome(&event).await {
            tracing::error!(
                instance_id = instance.id,
                business_id = instance.business_id,
                ?outcome,
                error = %e,
                "Workflow outcome callback failed"
            );
        }
    }

    /// Hand a pending task to another user; the task stays pending
    pub async fn transfer_task(
        &self,
        task_id: i64,
        from_user_id: i64,
        to_user_id: i64,
        reason: Option<String>,
    ) -> AppResult<WorkflowTask> {
        let mut task = self.load_task(task_id).await?;
        task.ensure_pending()?;
        if !task.is_actionable_by(from_user_id) {
            return Err(AppError::NotAuthorized(format!(
                "Task {} is not assigned to user {}",
                task.id, from_user_id
            )));
        }
        if from_user_id == to_user_id {
            return Err(AppError::Validation("A task cannot be transferred to its own assignee".to_string()));
        }
        let instance = self.load_instance(task.instance_id).await?;
        instance.ensure_accepts_task_actions()?;

        task.assignee_id = Some(to_user_id);
        task.candidate_ids.clear();

        let detail = match &reason {
            Some(reason) => format!("{} -> {}: {}", from_user_id, to_user_id, reason),
            None => format!("{} -> {}", from_user_id, to_user_id),
        };
        let mut changes = WorkflowChanges::default();
        changes
            .record(self.history(instance.id, Some(task.id), HistoryAction::TaskTransferred, Some(from_user_id), Some(detail)))
            .update_task(task)
            // unchanged, but its version guards against a concurrent suspend or terminate
            .update_instance(instance);
        let task = changes.tasks[0].value.clone();
        let instance_id = task.instance_id;
        if !self.store.commit(changes).await? {
            self.load_instance(instance_id).await?.ensure_accepts_task_actions()?;
            return Err(self.task_commit_failed(task.id).await);
        }

        tracing::info!(task_id = task.id, from_user_id, to_user_id, "Task transferred");
        self.notifier.assigned(task.id, to_user_id).await;
        Ok(task)
    }

    async fn change_instance_status(
        &self,
        instance_id: i64,
        actor_id: i64,
        next: InstanceStatus,
        action: HistoryAction,
        reason: Option<String>,
    ) -> AppResult<WorkflowInstance> {
        let mut instance = self.load_instance(instance_id).await?;
        instance.transition(next)?;

        let mut changes = WorkflowChanges::default();
        changes
            .record(self.history(instance.id, None, action, Some(actor_id), reason))
            .update_instance(instance);
        let instance = changes.instances[0].value.clone();
        self.commit(changes, "Workflow instance").await?;

        tracing::info!(instance_id, actor_id, status = %instance.status, "Workflow status changed");
        Ok(instance)
    }

    pub async fn suspend_workflow(
        &self,
        instance_id: i64,
        actor_id: i64,
        reason: Option<String>,
    ) -> AppResult<WorkflowInstance> {
        self.change_instance_status(instance_id, actor_id, InstanceStatus::Suspended, HistoryAction::Suspended, reason)
            .await
    }

    pub async fn resume_workflow(&self, instance_id: i64, actor_id: i64) -> AppResult<WorkflowInstance> {
        self.change_instance_status(instance_id, actor_id, InstanceStatus::Running, HistoryAction::Resumed, None)
            .await
    }

    /// Force-stop an instance; pending tasks are cancelled and no outcome is reported
    pub async fn terminate_workflow(
        &self,
        instance_id: i64,
        actor_id: i64,
        reason: Option<String>,
    ) -> AppResult<WorkflowInstance> {
        let mut instance = self.load_instance(instance_id).await?;
        instance.transition(InstanceStatus::Terminated)?;
        let now = self.clock.now();
        instance.ended_at = Some(now);

        let mut changes = WorkflowChanges::default();
        for mut task in self.store.list_tasks_by_instance(instance_id).await? {
            if task.status != TaskStatus::Pending {
                continue;
            }
            task.status = TaskStatus::Completed;
            task.result = Some(TaskResult::Cancelled);
            task.resolved_at = Some(now);
            changes
                .record(self.history(instance_id, Some(task.id), HistoryAction::TaskCancelled, Some(actor_id), None))
                .update_task(task);
        }
        changes
            .record(self.history(instance_id, None, HistoryAction::Terminated, Some(actor_id), reason))
            .update_instance(instance);
        let instance = changes.instances[0].value.clone();
        self.commit(changes, "Workflow instance").await?;

        tracing::info!(instance_id, actor_id, "Workflow terminated");
        Ok(instance)
    }

    // ---- Queries ----

    pub async fn get_instance(&self, id: i64) -> AppResult<WorkflowInstance> {
        self.load_instance(id).await
    }

    pub async fn get_task(&self, id: i64) -> AppResult<WorkflowTask> {
        self.load_task(id).await
    }

    pub async fn list_instance_tasks(&self, instance_id: i64) -> AppResult<Vec<WorkflowTask>> {
        self.load_instance(instance_id).await?;
        self.store.list_tasks_by_instance(instance_id).await
    }

    /// The pending task of an instance, if it has one
    pub async fn pending_task(&self, instance_id: i64) -> AppResult<Option<WorkflowTask>> {
        Ok(self
            .store
            .list_tasks_by_instance(instance_id)
            .await?
            .into_iter()
            .find(|t| t.status == TaskStatus::Pending))
    }

    /// The outcome a completed instance reported, rebuilt from its deciding task
    pub async fn recorded_outcome(&self, instance_id: i64) -> AppResult<Option<OutcomeEvent>> {
        let instance = self.load_instance(instance_id).await?;
        let Some(outcome) = instance.outcome.filter(|_| instance.status == InstanceStatus::Completed) else {
            return Ok(None);
        };
        let decider = self
            .store
            .list_tasks_by_instance(instance_id)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed && t.result != Some(TaskResult::Cancelled))
            .max_by_key(|t| (t.step_index, t.resolved_at));

        Ok(Some(OutcomeEvent {
            instance_id,
            business_id: instance.business_id,
            outcome,
            resolver_id: decider
                .as_ref()
                .and_then(|t| t.assignee_id)
                .unwrap_or(instance.initiator_id),
            comment: decider.and_then(|t| t.comment),
            variables: instance.variables,
        }))
    }

    pub async fn list_user_tasks(&self, user_id: i64, page: PageRequest) -> AppResult<Page<WorkflowTask>> {
        let page = page.clamped();
        let (tasks, total) = self.store.list_open_tasks_for_user(user_id, page).await?;
        Ok(Page::new(tasks, total, page))
    }

    pub async fn list_instances(&self, filter: InstanceFilter, page: PageRequest) -> AppResult<Page<WorkflowInstance>> {
        let page = page.clamped();
        let (instances, total) = self.store.list_instances(filter, page).await?;
        Ok(Page::new(instances, total, page))
    }

    pub async fn get_history(&self, instance_id: i64) -> AppResult<Vec<HistoryEntry>> {
        self.load_instance(instance_id).await?;
        self.store.list_history(instance_id).await
    }

    pub async fn find_instance_by_business(
        &self,
        business_type: &str,
        business_id: i64,
    ) -> AppResult<Option<WorkflowInstance>> {
        self.store.find_instance_by_business(business_type, business_id).await
    }

    pub async fn statistics(&self) -> AppResult<WorkflowStatistics> {
        self.store.statistics().await
    }
}
