//! Applications, authorizations and the records hanging off them.

use crate::models::{
    Application, Authorization, AuthorizationLog, CreateApplication, CreateAuthorization,
    CreateDossier, CreateScopeRequest, Dossier, ScopeRequest, UpdateScopes,
};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

/// Creation response; the only time the secrets leave the service.
#[derive(Debug, Serialize)]
pub struct ApplicationCreated {
    #[serde(flatten)]
    pub application: Application,
    pub secret: Option<String>,
    pub test_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrganizationParams {
    pub organization: String,
}

#[derive(Debug, Deserialize)]
pub struct LogEventRequest {
    pub status: String,
    pub endpoint: Option<String>,
}

fn not_found(what: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} not found", what))
}

#[tracing::instrument(skip(state, request))]
pub async fn create_application(
    State(state): State<AppState>,
    Json(request): Json<CreateApplication>,
) -> Result<(StatusCode, Json<ApplicationCreated>), AppError> {
    request.validate()?;
    let application = state.db.create_application(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApplicationCreated {
            secret: application.secret.clone(),
            test_secret: application.test_secret.clone(),
            application,
        }),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn get_application(
    State(state): State<AppState>,
    Path(application_id): Path<Uuid>,
) -> Result<Json<Application>, AppError> {
    state
        .db
        .get_application(application_id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("Application"))
}

#[tracing::instrument(skip(state))]
pub async fn list_applications(
    State(state): State<AppState>,
    Query(params): Query<OrganizationParams>,
) -> Result<Json<Vec<Application>>, AppError> {
    let applications = state
        .db
        .list_applications_by_organization(&params.organization)
        .await?;
    Ok(Json(applications))
}

#[tracing::instrument(skip(state))]
pub async fn delete_application(
    State(state): State<AppState>,
    Path(application_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.db.delete_application(application_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Application"))
    }
}

#[tracing::instrument(skip(state, request))]
pub async fn create_authorization(
    State(state): State<AppState>,
    Json(request): Json<CreateAuthorization>,
) -> Result<(StatusCode, Json<Authorization>), AppError> {
    request.validate()?;
    let authorization = state.db.create_authorization(request).await?;
    Ok((StatusCode::CREATED, Json(authorization)))
}

#[tracing::instrument(skip(state))]
pub async fn get_authorization(
    State(state): State<AppState>,
    Path(authorization_id): Path<Uuid>,
) -> Result<Json<Authorization>, AppError> {
    state
        .db
        .get_authorization(authorization_id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("Authorization"))
}

#[tracing::instrument(skip(state))]
pub async fn list_authorizations(
    State(state): State<AppState>,
    Path(application_id): Path<Uuid>,
) -> Result<Json<Vec<Authorization>>, AppError> {
    Ok(Json(state.db.list_authorizations(application_id).await?))
}

#[tracing::instrument(skip(state, request))]
pub async fn update_scopes(
    State(state): State<AppState>,
    Path(authorization_id): Path<Uuid>,
    Json(request): Json<UpdateScopes>,
) -> Result<Json<Authorization>, AppError> {
    let authorization = state
        .db
        .update_authorization_scopes(authorization_id, &request)
        .await?;
    Ok(Json(authorization))
}

#[tracing::instrument(skip(state))]
pub async fn delete_authorization(
    State(state): State<AppState>,
    Path(authorization_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.db.delete_authorization(authorization_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state, request))]
pub async fn log_authorization_event(
    State(state): State<AppState>,
    Path(authorization_id): Path<Uuid>,
    Json(request): Json<LogEventRequest>,
) -> Result<(StatusCode, Json<AuthorizationLog>), AppError> {
    if request.status.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "status must not be empty"
        )));
    }
    let log = state
        .db
        .log_authorization_event(authorization_id, &request.status, request.endpoint)
        .await?;
    Ok((StatusCode::CREATED, Json(log)))
}

#[tracing::instrument(skip(state))]
pub async fn list_authorization_logs(
    State(state): State<AppState>,
    Path(authorization_id): Path<Uuid>,
) -> Result<Json<Vec<AuthorizationLog>>, AppError> {
    Ok(Json(state.db.list_authorization_logs(authorization_id).await?))
}

#[tracing::instrument(skip(state, request))]
pub async fn create_dossier(
    State(state): State<AppState>,
    Json(request): Json<CreateDossier>,
) -> Result<(StatusCode, Json<Dossier>), AppError> {
    request.validate()?;
    Ok((StatusCode::CREATED, Json(state.db.create_dossier(request).await?)))
}

#[tracing::instrument(skip(state))]
pub async fn list_dossiers(
    State(state): State<AppState>,
    Path(authorization_id): Path<Uuid>,
) -> Result<Json<Vec<Dossier>>, AppError> {
    Ok(Json(state.db.list_dossiers(authorization_id).await?))
}

#[tracing::instrument(skip(state, request))]
pub async fn create_scope_request(
    State(state): State<AppState>,
    Json(request): Json<CreateScopeRequest>,
) -> Result<(StatusCode, Json<ScopeRequest>), AppError> {
    request.validate()?;
    Ok((
        StatusCode::CREATED,
        Json(state.db.create_scope_request(request).await?),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn authorize_scope_request(
    State(state): State<AppState>,
    Path(scope_request_id): Path<Uuid>,
) -> Result<Json<Authorization>, AppError> {
    Ok(Json(state.db.authorize_scope_request(scope_request_id).await?))
}

#[tracing::instrument(skip(state))]
pub async fn deny_scope_request(
    State(state): State<AppState>,
    Path(scope_request_id): Path<Uuid>,
) -> Result<Json<ScopeRequest>, AppError> {
    Ok(Json(state.db.deny_scope_request(scope_request_id).await?))
}
