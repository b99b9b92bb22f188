//! Borrow lifecycle endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    error::AppResult,
    models::{
        borrow::{
            BatchReviewReport, BorrowQuery, BorrowStatistics, BorrowStatus, ReturnCondition, ReviewDecision,
            SweepReport,
        },
        workflow::HistoryEntry,
        BorrowRecord, Page, PageRequest,
    },
    services::borrows::{ApplyBorrow, ExtendBorrow, ReturnBorrow, ReviewBorrow},
    AppState,
};

use super::{retry_on_conflict, AuthenticatedUser};

/// Borrow application request
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ApplyBorrowRequest {
    /// Archive unit to borrow
    pub archive_id: i64,
    /// Borrower; defaults to the caller, archivists may file on behalf of another user
    pub borrower_id: Option<i64>,
    #[validate(range(min = 1))]
    pub requested_days: i32,
    #[validate(length(max = 500))]
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ReviewRequest {
    pub decision: ReviewDecision,
    #[validate(length(max = 500))]
    pub remark: Option<String>,
    /// Loan length granted instead of the requested one
    #[validate(range(min = 1))]
    pub approved_days: Option<i32>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct BatchReviewRequest {
    #[validate(length(min = 1, max = 100))]
    pub borrow_ids: Vec<i64>,
    pub decision: ReviewDecision,
    #[validate(length(max = 500))]
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ReturnRequest {
    #[serde(default)]
    pub condition: ReturnCondition,
    #[validate(length(max = 1000))]
    pub damage_description: Option<String>,
    #[validate(length(max = 500))]
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ExtendRequest {
    #[validate(range(min = 1))]
    pub days: i32,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct CancelRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/// Borrow listing filter
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BorrowListQuery {
    pub borrower_id: Option<i64>,
    pub archive_id: Option<i64>,
    pub status: Option<BorrowStatus>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatisticsQuery {
    /// Applications filed at or after this instant
    pub from: Option<DateTime<Utc>>,
    /// Applications filed before this instant
    pub to: Option<DateTime<Utc>>,
}

/// File a borrow application
#[utoipa::path(
    post,
    path = "/borrows",
    tag = "borrows",
    security(("bearer_auth" = [])),
    request_body = ApplyBorrowRequest,
    responses(
        (status = 201, description = "Application filed", body = BorrowRecord),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Archive already has an active borrow")
    )
)]
pub async fn apply(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<ApplyBorrowRequest>,
) -> AppResult<(StatusCode, Json<BorrowRecord>)> {
    request.validate()?;
    let borrower_id = request.borrower_id.unwrap_or(claims.user_id);
    claims.require_self_or_archivist(borrower_id)?;

    let record = state
        .services
        .borrows
        .apply(ApplyBorrow {
            archive_id: request.archive_id,
            borrower_id,
            requested_days: request.requested_days,
            purpose: request.purpose,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// List borrow records; readers only see their own
#[utoipa::path(
    get,
    path = "/borrows",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(BorrowListQuery),
    responses(
        (status = 200, description = "Borrow records", body = BorrowPage)
    )
)]
pub async fn list_borrows(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(query): Query<BorrowListQuery>,
) -> AppResult<Json<Page<BorrowRecord>>> {
    let borrower_id = if claims.require_archivist().is_ok() {
        query.borrower_id
    } else {
        Some(claims.user_id)
    };
    let defaults = PageRequest::default();

    let page = state
        .services
        .borrows
        .query(BorrowQuery {
            borrower_id,
            archive_id: query.archive_id,
            status: query.status,
            page: PageRequest::new(
                query.page.unwrap_or(defaults.page),
                query.per_page.unwrap_or(defaults.per_page),
            ),
        })
        .await?;
    Ok(Json(page))
}

/// Get a borrow record
#[utoipa::path(
    get,
    path = "/borrows/{id}",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Borrow ID")),
    responses(
        (status = 200, description = "Borrow record", body = BorrowRecord),
        (status = 404, description = "Borrow not found")
    )
)]
pub async fn get_borrow(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<BorrowRecord>> {
    let record = state.services.borrows.get(id).await?;
    claims.require_self_or_archivist(record.borrower_id)?;
    Ok(Json(record))
}

/// Approve or reject a pending application
#[utoipa::path(
    post,
    path = "/borrows/{id}/review",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Borrow ID")),
    request_body = ReviewRequest,
    responses(
        (status = 200, description = "Application decided", body = BorrowRecord),
        (status = 403, description = "Caller may not decide this application"),
        (status = 409, description = "Task already resolved"),
        (status = 422, description = "Application is not pending")
    )
)]
pub async fn review(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    Json(request): Json<ReviewRequest>,
) -> AppResult<Json<BorrowRecord>> {
    request.validate()?;
    claims.require_archivist()?;

    let retries = state.config.borrow.conflict_retries;
    let record = retry_on_conflict(retries, || {
        state.services.borrows.review(ReviewBorrow {
            borrow_id: id,
            approver_id: claims.user_id,
            decision: request.decision,
            remark: request.remark.clone(),
            approved_days: request.approved_days,
        })
    })
    .await?;
    Ok(Json(record))
}

/// Review several applications at once
#[utoipa::path(
    post,
    path = "/borrows/batch-review",
    tag = "borrows",
    security(("bearer_auth" = [])),
    request_body = BatchReviewRequest,
    responses(
        (status = 200, description = "Per-application results", body = BatchReviewReport)
    )
)]
pub async fn batch_review(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<BatchReviewRequest>,
) -> AppResult<Json<BatchReviewReport>> {
    request.validate()?;
    claims.require_archivist()?;

    let report = state
        .services
        .borrows
        .batch_review(&request.borrow_ids, claims.user_id, request.decision, request.remark)
        .await;
    Ok(Json(report))
}

/// Register the return of a lent archive
#[utoipa::path(
    post,
    path = "/borrows/{id}/return",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Borrow ID")),
    request_body = ReturnRequest,
    responses(
        (status = 200, description = "Archive returned", body = BorrowRecord),
        (status = 400, description = "Damage description missing"),
        (status = 422, description = "Archive is not on loan")
    )
)]
pub async fn return_archive(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    Json(request): Json<ReturnRequest>,
) -> AppResult<Json<BorrowRecord>> {
    request.validate()?;
    claims.require_archivist()?;

    let retries = state.config.borrow.conflict_retries;
    let record = retry_on_conflict(retries, || {
        state.services.borrows.return_archive(ReturnBorrow {
            borrow_id: id,
            condition: request.condition,
            damage_description: request.damage_description.clone(),
            remark: request.remark.clone(),
        })
    })
    .await?;
    Ok(Json(record))
}

/// Push out the due date of a loan
#[utoipa::path(
    post,
    path = "/borrows/{id}/extend",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Borrow ID")),
    request_body = ExtendRequest,
    responses(
        (status = 200, description = "Loan extended", body = BorrowRecord),
        (status = 409, description = "Archive is on hold"),
        (status = 422, description = "Extension limit reached or archive not on loan")
    )
)]
pub async fn extend(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    Json(request): Json<ExtendRequest>,
) -> AppResult<Json<BorrowRecord>> {
    request.validate()?;
    let record = state.services.borrows.get(id).await?;
    claims.require_self_or_archivist(record.borrower_id)?;

    let retries = state.config.borrow.conflict_retries;
    let record = retry_on_conflict(retries, || {
        state.services.borrows.request_extension(ExtendBorrow {
            borrow_id: id,
            days: request.days,
            reason: request.reason.clone(),
        })
    })
    .await?;
    Ok(Json(record))
}

/// Withdraw a pending application
#[utoipa::path(
    post,
    path = "/borrows/{id}/cancel",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Borrow ID")),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Application cancelled", body = BorrowRecord),
        (status = 403, description = "Only the borrower may cancel"),
        (status = 422, description = "Application is no longer pending")
    )
)]
pub async fn cancel(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
    request: Option<Json<CancelRequest>>,
) -> AppResult<Json<BorrowRecord>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;

    let record = state.services.borrows.cancel(id, claims.user_id, request.reason).await?;
    Ok(Json(record))
}

/// Approval trail of a borrow
#[utoipa::path(
    get,
    path = "/borrows/{id}/history",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Borrow ID")),
    responses(
        (status = 200, description = "Workflow history, oldest first", body = Vec<HistoryEntry>),
        (status = 404, description = "Borrow not found")
    )
)]
pub async fn workflow_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    let record = state.services.borrows.get(id).await?;
    claims.require_self_or_archivist(record.borrower_id)?;

    let history = state.services.borrows.workflow_history(id).await?;
    Ok(Json(history))
}

/// All borrow records of a user
#[utoipa::path(
    get,
    path = "/users/{id}/borrows",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Borrow records, newest first", body = Vec<BorrowRecord>)
    )
)]
pub async fn user_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Vec<BorrowRecord>>> {
    claims.require_self_or_archivist(user_id)?;

    let records = state.services.borrows.user_history(user_id).await?;
    Ok(Json(records))
}

/// Loans past their due date
#[utoipa::path(
    get,
    path = "/borrows/overdue",
    tag = "borrows",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Overdue loans", body = Vec<BorrowRecord>)
    )
)]
pub async fn list_overdue(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<BorrowRecord>>> {
    claims.require_archivist()?;

    let now = state.services.clock.now();
    let records = state.services.borrows.list_overdue(now).await?;
    Ok(Json(records))
}

/// Lending statistics
#[utoipa::path(
    get,
    path = "/borrows/statistics",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(StatisticsQuery),
    responses(
        (status = 200, description = "Lending figures", body = BorrowStatistics)
    )
)]
pub async fn statistics(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(query): Query<StatisticsQuery>,
) -> AppResult<Json<BorrowStatistics>> {
    claims.require_archivist()?;

    let stats = state.services.borrows.statistics(query.from, query.to).await?;
    Ok(Json(stats))
}

/// Run one overdue sweep pass now
#[utoipa::path(
    post,
    path = "/borrows/sweep",
    tag = "borrows",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Sweep report", body = SweepReport)
    )
)]
pub async fn sweep(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<SweepReport>> {
    claims.require_admin()?;

    let (_keep_running, shutdown) = watch::channel(false);
    let now = state.services.clock.now();
    let report = state.services.sweeper.sweep_overdue(now, &shutdown).await?;
    Ok(Json(report))
}
