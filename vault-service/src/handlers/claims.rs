//! Claims, proofs and the grants claims are shared with.

use crate::models::{
    Claim, CreateClaim, CreateProof, CreatePurposeLimitation, GrantRef, Proof, PurposeLimitation,
    ResolvedPurposeLimitation,
};
use crate::startup::AppState;
use axum::{
    extract::{MatchedPath, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize)]
pub struct LinkResponse {
    /// False when the link was already in the requested state.
    pub changed: bool,
}

/// Resolve the grant a route is mounted under from its matched path.
fn grant_ref(matched: &str, id: Uuid) -> Result<GrantRef, AppError> {
    if matched.starts_with("/authorizations/") {
        Ok(GrantRef::Authorization(id))
    } else if matched.starts_with("/contracts/") {
        Ok(GrantRef::Contract(id))
    } else {
        Err(AppError::NotFound(anyhow::anyhow!(
            "No grant behind route '{}'",
            matched
        )))
    }
}

#[tracing::instrument(skip(state, request))]
pub async fn create_claim(
    State(state): State<AppState>,
    Json(request): Json<CreateClaim>,
) -> Result<(StatusCode, Json<Claim>), AppError> {
    request.validate()?;
    Ok((StatusCode::CREATED, Json(state.db.create_claim(request).await?)))
}

#[tracing::instrument(skip(state))]
pub async fn get_claim(
    State(state): State<AppState>,
    Path(claim_id): Path<Uuid>,
) -> Result<Json<Claim>, AppError> {
    state
        .db
        .get_claim(claim_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Claim not found")))
}

#[tracing::instrument(skip(state, request))]
pub async fn create_proof(
    State(state): State<AppState>,
    Json(request): Json<CreateProof>,
) -> Result<(StatusCode, Json<Proof>), AppError> {
    request.validate()?;
    Ok((StatusCode::CREATED, Json(state.db.create_proof(request).await?)))
}

#[tracing::instrument(skip(state))]
pub async fn add_proof(
    State(state): State<AppState>,
    Path((claim_id, proof_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<LinkResponse>, AppError> {
    let changed = state.db.add_proof(claim_id, proof_id).await?;
    Ok(Json(LinkResponse { changed }))
}

#[tracing::instrument(skip(state))]
pub async fn remove_proof(
    State(state): State<AppState>,
    Path((claim_id, proof_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<LinkResponse>, AppError> {
    let changed = state.db.remove_proof(claim_id, proof_id).await?;
    Ok(Json(LinkResponse { changed }))
}

#[tracing::instrument(skip(state))]
pub async fn add_claim(
    State(state): State<AppState>,
    matched: MatchedPath,
    Path((grant_id, claim_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<LinkResponse>, AppError> {
    let grant = grant_ref(matched.as_str(), grant_id)?;
    let changed = state.db.add_claim(grant, claim_id).await?;
    Ok(Json(LinkResponse { changed }))
}

#[tracing::instrument(skip(state))]
pub async fn remove_claim(
    State(state): State<AppState>,
    matched: MatchedPath,
    Path((grant_id, claim_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<LinkResponse>, AppError> {
    let grant = grant_ref(matched.as_str(), grant_id)?;
    let changed = state.db.remove_claim(grant, claim_id).await?;
    Ok(Json(LinkResponse { changed }))
}

fn resolved(limitation: PurposeLimitation) -> Result<Json<ResolvedPurposeLimitation>, AppError> {
    limitation
        .resolve()
        .map(Json)
        .map_err(|e| AppError::InternalError(e.into()))
}

#[tracing::instrument(skip(state, request))]
pub async fn attach_purpose_limitation(
    State(state): State<AppState>,
    matched: MatchedPath,
    Path(grant_id): Path<Uuid>,
    Json(request): Json<CreatePurposeLimitation>,
) -> Result<(StatusCode, Json<ResolvedPurposeLimitation>), AppError> {
    request.validate()?;
    let grant = grant_ref(matched.as_str(), grant_id)?;
    let limitation = state.db.attach_purpose_limitation(grant, request).await?;
    Ok((StatusCode::CREATED, resolved(limitation)?))
}

#[tracing::instrument(skip(state))]
pub async fn get_purpose_limitation(
    State(state): State<AppState>,
    matched: MatchedPath,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<ResolvedPurposeLimitation>, AppError> {
    let grant = grant_ref(matched.as_str(), grant_id)?;
    let limitation = state
        .db
        .get_purpose_limitation(grant)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Purpose limitation not found")))?;
    resolved(limitation)
}
