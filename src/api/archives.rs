//! Archive availability endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::{error::AppResult, models::borrow::ArchiveAvailabilityStatus, AppState};

use super::AuthenticatedUser;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApprovalRoutingRequest {
    /// Whether applications for the archive go through the approval workflow
    pub required: bool,
}

/// Lending situation of an archive unit
#[utoipa::path(
    get,
    path = "/archives/{id}/availability",
    tag = "archives",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Archive ID")),
    responses(
        (status = 200, description = "Availability", body = ArchiveAvailabilityStatus)
    )
)]
pub async fn availability(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Path(archive_id): Path<i64>,
) -> AppResult<Json<ArchiveAvailabilityStatus>> {
    let status = state.services.borrows.availability(archive_id).await?;
    Ok(Json(status))
}

/// Reserve an archive unit; blocks extensions of its current loan
#[utoipa::path(
    post,
    path = "/archives/{id}/hold",
    tag = "archives",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Archive ID")),
    responses(
        (status = 200, description = "Hold in place", body = ArchiveAvailabilityStatus),
        (status = 403, description = "Archivist rights required")
    )
)]
pub async fn place_hold(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(archive_id): Path<i64>,
) -> AppResult<Json<ArchiveAvailabilityStatus>> {
    claims.require_archivist()?;

    let status = state.services.borrows.place_hold(archive_id).await?;
    Ok(Json(status))
}

/// Lift a reservation hold
#[utoipa::path(
    delete,
    path = "/archives/{id}/hold",
    tag = "archives",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Archive ID")),
    responses(
        (status = 200, description = "Hold lifted", body = ArchiveAvailabilityStatus),
        (status = 403, description = "Archivist rights required")
    )
)]
pub async fn release_hold(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(archive_id): Path<i64>,
) -> AppResult<Json<ArchiveAvailabilityStatus>> {
    claims.require_archivist()?;

    let status = state.services.borrows.release_hold(archive_id).await?;
    Ok(Json(status))
}

/// Route applications for an archive through the approval workflow, or not
#[utoipa::path(
    put,
    path = "/archives/{id}/approval",
    tag = "archives",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Archive ID")),
    request_body = ApprovalRoutingRequest,
    responses(
        (status = 204, description = "Routing updated"),
        (status = 403, description = "Administrator rights required")
    )
)]
pub async fn set_requires_approval(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(archive_id): Path<i64>,
    Json(request): Json<ApprovalRoutingRequest>,
) -> AppResult<StatusCode> {
    claims.require_admin()?;

    state
        .services
        .borrows
        .set_requires_approval(archive_id, request.required)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
