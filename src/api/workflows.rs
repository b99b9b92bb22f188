//! Workflow engine endpoints: definitions, instances and tasks

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::{
        workflow::{
            DefinitionStatus, HistoryEntry, InstanceFilter, InstanceStatus, StepSpec, TaskResult, WorkflowStatistics,
        },
        Page, PageRequest, Variables, WorkflowDefinition, WorkflowInstance, WorkflowTask,
    },
    services::workflow::{CompleteTask, NewDefinition, StartWorkflow, TaskCompletion},
    AppState,
};

use super::{retry_on_conflict, AuthenticatedUser};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateDefinitionRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 100))]
    pub business_type: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(length(min = 1))]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateStepsRequest {
    #[validate(length(min = 1))]
    pub steps: Vec<StepSpec>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DefinitionListQuery {
    pub business_type: Option<String>,
    pub status: Option<DefinitionStatus>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CurrentDefinitionQuery {
    pub business_type: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct StartWorkflowRequest {
    /// Published definition to run; the current one of `business_type` when omitted
    pub definition_id: Option<i64>,
    #[validate(length(min = 1, max = 100))]
    pub business_type: String,
    pub business_id: i64,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct InstanceListQuery {
    pub business_type: Option<String>,
    pub status: Option<InstanceStatus>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CompleteTaskRequest {
    /// APPROVE or REJECT
    pub result: TaskResult,
    #[validate(length(max = 1000))]
    pub comment: Option<String>,
    /// Merged into the instance variables
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct TransferTaskRequest {
    pub to_user_id: i64,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct InstanceActionRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

fn action_body(body: Option<Json<InstanceActionRequest>>) -> AppResult<InstanceActionRequest> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    Ok(request)
}

// ---- Definitions ----

/// Create a draft definition
#[utoipa::path(
    post,
    path = "/workflow/definitions",
    tag = "workflow",
    security(("bearer_auth" = [])),
    request_body = CreateDefinitionRequest,
    responses(
        (status = 201, description = "Draft created", body = WorkflowDefinition),
        (status = 400, description = "Invalid steps"),
        (status = 403, description = "Administrator rights required")
    )
)]
pub async fn create_definition(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<CreateDefinitionRequest>,
) -> AppResult<(StatusCode, Json<WorkflowDefinition>)> {
    request.validate()?;
    claims.require_admin()?;

    let definition = state
        .services
        .workflows
        .create_definition(NewDefinition {
            name: request.name,
            business_type: request.business_type,
            description: request.description,
            steps: request.steps,
            created_by: claims.user_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

/// Replace the steps of a draft
#[utoipa::path(
    put,
    path = "/workflow/definitions/{id}/steps",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Definition ID")),
    request_body = UpdateStepsRequest,
    responses(
        (status = 200, description = "Draft updated", body = WorkflowDefinition),
        (status = 422, description = "Definition is already published")
    )
)]
pub async fn update_steps(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    Json(request): Json<UpdateStepsRequest>,
) -> AppResult<Json<WorkflowDefinition>> {
    request.validate()?;
    claims.require_admin()?;

    let definition = state
        .services
        .workflows
        .update_definition_steps(id, request.steps, request.description)
        .await?;
    Ok(Json(definition))
}

/// Publish a draft as the current definition of its business type
#[utoipa::path(
    post,
    path = "/workflow/definitions/{id}/publish",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Definition ID")),
    responses(
        (status = 200, description = "Definition published", body = WorkflowDefinition),
        (status = 422, description = "Definition is already published")
    )
)]
pub async fn publish_definition(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<WorkflowDefinition>> {
    claims.require_admin()?;

    let retries = state.config.borrow.conflict_retries;
    let definition = retry_on_conflict(retries, || state.services.workflows.publish_definition(id)).await?;
    Ok(Json(definition))
}

#[utoipa::path(
    get,
    path = "/workflow/definitions/{id}",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Definition ID")),
    responses(
        (status = 200, description = "Definition", body = WorkflowDefinition),
        (status = 404, description = "Definition not found")
    )
)]
pub async fn get_definition(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<WorkflowDefinition>> {
    claims.require_archivist()?;
    Ok(Json(state.services.workflows.get_definition(id).await?))
}

#[utoipa::path(
    get,
    path = "/workflow/definitions",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(DefinitionListQuery),
    responses(
        (status = 200, description = "Definitions", body = Vec<WorkflowDefinition>)
    )
)]
pub async fn list_definitions(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(query): Query<DefinitionListQuery>,
) -> AppResult<Json<Vec<WorkflowDefinition>>> {
    claims.require_archivist()?;

    let definitions = state
        .services
        .workflows
        .list_definitions(query.business_type, query.status)
        .await?;
    Ok(Json(definitions))
}

/// The definition new instances of a business type start from
#[utoipa::path(
    get,
    path = "/workflow/definitions/current",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(CurrentDefinitionQuery),
    responses(
        (status = 200, description = "Current definition", body = WorkflowDefinition),
        (status = 404, description = "Nothing published for this business type")
    )
)]
pub async fn current_definition(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(query): Query<CurrentDefinitionQuery>,
) -> AppResult<Json<WorkflowDefinition>> {
    claims.require_archivist()?;

    state
        .services
        .workflows
        .current_definition(&query.business_type)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::DefinitionNotFound(format!("No published definition for '{}'", query.business_type))
        })
}

// ---- Instances ----

/// Start an instance for a business object
#[utoipa::path(
    post,
    path = "/workflow/instances",
    tag = "workflow",
    security(("bearer_auth" = [])),
    request_body = StartWorkflowRequest,
    responses(
        (status = 201, description = "Instance started", body = WorkflowInstance),
        (status = 404, description = "No published definition")
    )
)]
pub async fn start_workflow(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<StartWorkflowRequest>,
) -> AppResult<(StatusCode, Json<WorkflowInstance>)> {
    request.validate()?;
    claims.require_archivist()?;

    let engine = &state.services.workflows;
    let definition_id = match request.definition_id {
        Some(id) => id,
        None => {
            engine
                .current_definition(&request.business_type)
                .await?
                .ok_or_else(|| {
                    AppError::DefinitionNotFound(format!("No published definition for '{}'", request.business_type))
                })?
                .id
        }
    };

    let instance = engine
        .start_workflow(StartWorkflow {
            definition_id,
            business_type: request.business_type,
            business_id: request.business_id,
            initiator_id: claims.user_id,
            variables: request.variables,
            instance_id: None,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[utoipa::path(
    get,
    path = "/workflow/instances/{id}",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance", body = WorkflowInstance),
        (status = 404, description = "Instance not found")
    )
)]
pub async fn get_instance(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<WorkflowInstance>> {
    let instance = state.services.workflows.get_instance(id).await?;
    claims.require_self_or_archivist(instance.initiator_id)?;
    Ok(Json(instance))
}

#[utoipa::path(
    get,
    path = "/workflow/instances",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(InstanceListQuery),
    responses(
        (status = 200, description = "Instances, newest first", body = InstancePage)
    )
)]
pub async fn list_instances(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(query): Query<InstanceListQuery>,
) -> AppResult<Json<Page<WorkflowInstance>>> {
    claims.require_archivist()?;

    let defaults = PageRequest::default();
    let page = PageRequest::new(
        query.page.unwrap_or(defaults.page),
        query.per_page.unwrap_or(defaults.per_page),
    );
    let filter = InstanceFilter {
        business_type: query.business_type,
        status: query.status,
    };
    Ok(Json(state.services.workflows.list_instances(filter, page).await?))
}

#[utoipa::path(
    get,
    path = "/workflow/instances/{id}/tasks",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Tasks in step order", body = Vec<WorkflowTask>)
    )
)]
pub async fn instance_tasks(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<WorkflowTask>>> {
    claims.require_archivist()?;
    Ok(Json(state.services.workflows.list_instance_tasks(id).await?))
}

#[utoipa::path(
    get,
    path = "/workflow/instances/{id}/history",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "History, oldest first", body = Vec<HistoryEntry>)
    )
)]
pub async fn instance_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    let instance = state.services.workflows.get_instance(id).await?;
    claims.require_self_or_archivist(instance.initiator_id)?;
    Ok(Json(state.services.workflows.get_history(id).await?))
}

/// Pause a running instance; its tasks cannot be completed meanwhile
#[utoipa::path(
    post,
    path = "/workflow/instances/{id}/suspend",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Instance ID")),
    request_body = InstanceActionRequest,
    responses(
        (status = 200, description = "Instance suspended", body = WorkflowInstance),
        (status = 422, description = "Instance is not running")
    )
)]
pub async fn suspend(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    body: Option<Json<InstanceActionRequest>>,
) -> AppResult<Json<WorkflowInstance>> {
    claims.require_admin()?;
    let request = action_body(body)?;

    let retries = state.config.borrow.conflict_retries;
    let instance = retry_on_conflict(retries, || {
        state
            .services
            .workflows
            .suspend_workflow(id, claims.user_id, request.reason.clone())
    })
    .await?;
    Ok(Json(instance))
}

#[utoipa::path(
    post,
    path = "/workflow/instances/{id}/resume",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance resumed", body = WorkflowInstance),
        (status = 422, description = "Instance is not suspended")
    )
)]
pub async fn resume(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<WorkflowInstance>> {
    claims.require_admin()?;

    let retries = state.config.borrow.conflict_retries;
    let instance = retry_on_conflict(retries, || state.services.workflows.resume_workflow(id, claims.user_id)).await?;
    Ok(Json(instance))
}

/// Force-stop an instance without reporting an outcome
#[utoipa::path(
    post,
    path = "/workflow/instances/{id}/terminate",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Instance ID")),
    request_body = InstanceActionRequest,
    responses(
        (status = 200, description = "Instance terminated", body = WorkflowInstance),
        (status = 422, description = "Instance already ended")
    )
)]
pub async fn terminate(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    body: Option<Json<InstanceActionRequest>>,
) -> AppResult<Json<WorkflowInstance>> {
    claims.require_admin()?;
    let request = action_body(body)?;

    let retries = state.config.borrow.conflict_retries;
    let instance = retry_on_conflict(retries, || {
        state
            .services
            .workflows
            .terminate_workflow(id, claims.user_id, request.reason.clone())
    })
    .await?;
    Ok(Json(instance))
}

// ---- Tasks ----

/// Pending tasks the caller may act on
#[utoipa::path(
    get,
    path = "/workflow/tasks/mine",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(PageRequest),
    responses(
        (status = 200, description = "Open tasks, oldest first", body = TaskPage)
    )
)]
pub async fn my_tasks(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<Page<WorkflowTask>>> {
    Ok(Json(state.services.workflows.list_user_tasks(claims.user_id, page).await?))
}

#[utoipa::path(
    get,
    path = "/workflow/tasks/{id}",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task", body = WorkflowTask),
        (status = 404, description = "Task not found")
    )
)]
pub async fn get_task(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<WorkflowTask>> {
    let task = state.services.workflows.get_task(id).await?;
    if !task.is_actionable_by(claims.user_id) {
        claims.require_archivist()?;
    }
    Ok(Json(task))
}

/// Approve or reject a task
#[utoipa::path(
    post,
    path = "/workflow/tasks/{id}/complete",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Task ID")),
    request_body = CompleteTaskRequest,
    responses(
        (status = 200, description = "Task completed", body = TaskCompletion),
        (status = 403, description = "Caller is not the assignee"),
        (status = 409, description = "Task already resolved"),
        (status = 423, description = "Instance is suspended")
    )
)]
pub async fn complete_task(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    Json(request): Json<CompleteTaskRequest>,
) -> AppResult<Json<TaskCompletion>> {
    request.validate()?;

    let completion = state
        .services
        .workflows
        .complete_task(CompleteTask {
            task_id: id,
            actor_id: claims.user_id,
            result: request.result,
            comment: request.comment,
            variables: request.variables,
        })
        .await?;
    Ok(Json(completion))
}

/// Hand a pending task over to another user
#[utoipa::path(
    post,
    path = "/workflow/tasks/{id}/transfer",
    tag = "workflow",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Task ID")),
    request_body = TransferTaskRequest,
    responses(
        (status = 200, description = "Task transferred", body = WorkflowTask),
        (status = 403, description = "Caller is not the assignee")
    )
)]
pub async fn transfer_task(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    Json(request): Json<TransferTaskRequest>,
) -> AppResult<Json<WorkflowTask>> {
    request.validate()?;

    let task = state
        .services
        .workflows
        .transfer_task(id, claims.user_id, request.to_user_id, request.reason)
        .await?;
    Ok(Json(task))
}

#[utoipa::path(
    get,
    path = "/workflow/statistics",
    tag = "workflow",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Instance and task counts", body = WorkflowStatistics)
    )
)]
pub async fn statistics(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<WorkflowStatistics>> {
    claims.require_archivist()?;
    Ok(Json(state.services.workflows.statistics().await?))
}
