//! API handlers for the circulation REST endpoints

pub mod archives;
pub mod borrows;
pub mod health;
pub mod openapi;
pub mod workflows;

use std::future::Future;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
    routing::{get, post, put},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    error::{AppError, AppResult},
    models::UserClaims,
    AppState,
};

/// Extractor for authenticated user from JWT token
pub struct AuthenticatedUser(pub UserClaims);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::Authentication("Missing authorization header".to_string()))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Authentication("Invalid authorization header format".to_string()))?;

        let claims = UserClaims::from_token(token, &state.config.auth.jwt_secret)
            .map_err(|e| AppError::Authentication(e.to_string()))?;

        Ok(AuthenticatedUser(claims))
    }
}

/// Run `op` again while it loses optimistic-concurrency races, at most `retries` more times
pub async fn retry_on_conflict<T, F, Fut>(retries: u32, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < retries => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "Retrying after version conflict");
            }
            result => return result,
        }
    }
}

/// Create the application router with all routes
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_v1 = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Borrows
        .route("/borrows", post(borrows::apply).get(borrows::list_borrows))
        .route("/borrows/overdue", get(borrows::list_overdue))
        .route("/borrows/statistics", get(borrows::statistics))
        .route("/borrows/sweep", post(borrows::sweep))
        .route("/borrows/batch-review", post(borrows::batch_review))
        .route("/borrows/:id", get(borrows::get_borrow))
        .route("/borrows/:id/review", post(borrows::review))
        .route("/borrows/:id/return", post(borrows::return_archive))
        .route("/borrows/:id/extend", post(borrows::extend))
        .route("/borrows/:id/cancel", post(borrows::cancel))
        .route("/borrows/:id/history", get(borrows::workflow_history))
        .route("/users/:id/borrows", get(borrows::user_history))
        // Archives
        .route("/archives/:id/availability", get(archives::availability))
        .route("/archives/:id/hold", post(archives::place_hold).delete(archives::release_hold))
        .route("/archives/:id/approval", put(archives::set_requires_approval))
        // Workflow definitions
        .route(
            "/workflow/definitions",
            post(workflows::create_definition).get(workflows::list_definitions),
        )
        .route("/workflow/definitions/current", get(workflows::current_definition))
        .route("/workflow/definitions/:id", get(workflows::get_definition))
        .route("/workflow/definitions/:id/steps", put(workflows::update_steps))
        .route("/workflow/definitions/:id/publish", post(workflows::publish_definition))
        // Workflow instances
        .route(
            "/workflow/instances",
            post(workflows::start_workflow).get(workflows::list_instances),
        )
        .route("/workflow/instances/:id", get(workflows::get_instance))
        .route("/workflow/instances/:id/tasks", get(workflows::instance_tasks))
        .route("/workflow/instances/:id/history", get(workflows::instance_history))
        .route("/workflow/instances/:id/suspend", post(workflows::suspend))
        .route("/workflow/instances/:id/resume", post(workflows::resume))
        .route("/workflow/instances/:id/terminate", post(workflows::terminate))
        // Workflow tasks
        .route("/workflow/tasks/mine", get(workflows::my_tasks))
        .route("/workflow/tasks/:id", get(workflows::get_task))
        .route("/workflow/tasks/:id/complete", post(workflows::complete_task))
        .route("/workflow/tasks/:id/transfer", post(workflows::transfer_task))
        .route("/workflow/statistics", get(workflows::statistics))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_v1)
        .merge(openapi::create_openapi_router())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
}
