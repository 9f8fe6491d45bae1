use crate::models::{AcceptingParty, CreateGroup, CreateMembership, Group, Membership};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct SetParentRequest {
    pub parent_group_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AcceptMembershipRequest {
    pub party: AcceptingParty,
}

#[tracing::instrument(skip(state, request))]
pub async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroup>,
) -> Result<(StatusCode, Json<Group>), AppError> {
    request.validate()?;
    Ok((StatusCode::CREATED, Json(state.db.create_group(request).await?)))
}

#[tracing::instrument(skip(state))]
pub async fn set_group_parent(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(request): Json<SetParentRequest>,
) -> Result<Json<Group>, AppError> {
    let group = state
        .db
        .set_group_parent(group_id, request.parent_group_id)
        .await?;
    Ok(Json(group))
}

#[tracing::instrument(skip(state, request))]
pub async fn add_membership(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(request): Json<CreateMembership>,
) -> Result<(StatusCode, Json<Membership>), AppError> {
    request.validate()?;
    let membership = state.db.add_membership(group_id, request).await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

#[tracing::instrument(skip(state))]
pub async fn accept_membership(
    State(state): State<AppState>,
    Path(membership_id): Path<Uuid>,
    Json(request): Json<AcceptMembershipRequest>,
) -> Result<Json<Membership>, AppError> {
    let membership = state
        .db
        .accept_membership(membership_id, request.party)
        .await?;
    Ok(Json(membership))
}
