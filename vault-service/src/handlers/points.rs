use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct PointsResponse {
    pub points: i64,
}

#[derive(Debug, Deserialize)]
pub struct OrganizationPointsParams {
    pub organization: String,
}

#[tracing::instrument(skip(state))]
pub async fn application_points(
    State(state): State<AppState>,
    Path(application_id): Path<Uuid>,
) -> Result<Json<PointsResponse>, AppError> {
    let points = state.points.points_by_application(application_id).await?;
    Ok(Json(PointsResponse { points }))
}

#[tracing::instrument(skip(state))]
pub async fn organization_points(
    State(state): State<AppState>,
    Query(params): Query<OrganizationPointsParams>,
) -> Result<Json<PointsResponse>, AppError> {
    let points = state
        .points
        .points_by_organization(&params.organization)
        .await?;
    Ok(Json(PointsResponse { points }))
}
