//! OpenAPI documentation

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{archives, borrows, health, workflows};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Archive Circulation API",
        version = "0.3.0",
        description = "Archive borrowing and approval workflow REST API"
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        health::readiness_check,
        // Borrows
        borrows::apply,
        borrows::list_borrows,
        borrows::get_borrow,
        borrows::review,
        borrows::batch_review,
        borrows::return_archive,
        borrows::extend,
        borrows::cancel,
        borrows::workflow_history,
        borrows::user_history,
        borrows::list_overdue,
        borrows::statistics,
        borrows::sweep,
        // Archives
        archives::availability,
        archives::place_hold,
        archives::release_hold,
        archives::set_requires_approval,
        // Workflow
        workflows::create_definition,
        workflows::update_steps,
        workflows::publish_definition,
        workflows::get_definition,
        workflows::list_definitions,
        workflows::current_definition,
        workflows::start_workflow,
        workflows::get_instance,
        workflows::list_instances,
        workflows::instance_tasks,
        workflows::instance_history,
        workflows::suspend,
        workflows::resume,
        workflows::terminate,
        workflows::my_tasks,
        workflows::get_task,
        workflows::complete_task,
        workflows::transfer_task,
        workflows::statistics,
    ),
    components(
        schemas(
            // Borrows
            borrows::ApplyBorrowRequest,
            borrows::ReviewRequest,
            borrows::BatchReviewRequest,
            borrows::ReturnRequest,
            borrows::ExtendRequest,
            borrows::CancelRequest,
            crate::models::borrow::BorrowRecord,
            crate::models::borrow::BorrowStatus,
            crate::models::borrow::ReviewDecision,
            crate::models::borrow::ReturnCondition,
            crate::models::borrow::BorrowStatistics,
            crate::models::borrow::SweepReport,
            crate::models::borrow::BatchFailure,
            crate::models::borrow::BatchReviewReport,
            crate::models::borrow::ArchiveAvailabilityStatus,
            crate::models::BorrowPage,
            // Archives
            archives::ApprovalRoutingRequest,
            // Workflow
            workflows::CreateDefinitionRequest,
            workflows::UpdateStepsRequest,
            workflows::StartWorkflowRequest,
            workflows::CompleteTaskRequest,
            workflows::TransferTaskRequest,
            workflows::InstanceActionRequest,
            crate::models::workflow::WorkflowDefinition,
            crate::models::workflow::DefinitionStatus,
            crate::models::workflow::StepSpec,
            crate::models::workflow::ApproverRule,
            crate::models::workflow::WorkflowInstance,
            crate::models::workflow::InstanceStatus,
            crate::models::workflow::WorkflowOutcome,
            crate::models::workflow::WorkflowTask,
            crate::models::workflow::TaskStatus,
            crate::models::workflow::TaskResult,
            crate::models::workflow::HistoryEntry,
            crate::models::workflow::HistoryAction,
            crate::models::workflow::WorkflowStatistics,
            crate::models::variables::Variable,
            crate::models::variables::Variables,
            crate::models::TaskPage,
            crate::models::InstancePage,
            crate::services::workflow::TaskCompletion,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
            crate::error::ErrorCode,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "borrows", description = "Borrow lifecycle"),
        (name = "archives", description = "Archive holds and approval routing"),
        (name = "workflow", description = "Approval workflow engine")
    )
)]
pub struct ApiDoc;

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new().merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
