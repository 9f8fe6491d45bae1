use crate::models::{Contract, CreateContract, SigningState};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize)]
pub struct ContractResponse {
    #[serde(flatten)]
    pub contract: Contract,
    pub signing_state: SigningState,
}

impl From<Contract> for ContractResponse {
    fn from(contract: Contract) -> Self {
        Self {
            signing_state: contract.signing_state(),
            contract,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetSignedRequest {
    pub signed: bool,
}

#[tracing::instrument(skip(state, request))]
pub async fn create_contract(
    State(state): State<AppState>,
    Json(request): Json<CreateContract>,
) -> Result<(StatusCode, Json<ContractResponse>), AppError> {
    request.validate()?;
    let contract = state.db.create_contract(request).await?;
    Ok((StatusCode::CREATED, Json(contract.into())))
}

#[tracing::instrument(skip(state))]
pub async fn get_contract(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
) -> Result<Json<ContractResponse>, AppError> {
    state
        .db
        .get_contract(contract_id)
        .await?
        .map(|c| Json(c.into()))
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Contract not found")))
}

#[tracing::instrument(skip(state))]
pub async fn sign_contract(
    State(state): State<AppState>,
    Path((contract_id, signee_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ContractResponse>, AppError> {
    let contract = state.db.sign_contract(contract_id, signee_id).await?;
    Ok(Json(contract.into()))
}

#[tracing::instrument(skip(state, request))]
pub async fn set_contract_signed(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
    Json(request): Json<SetSignedRequest>,
) -> Result<Json<ContractResponse>, AppError> {
    let contract = state
        .db
        .set_contract_signed(contract_id, request.signed)
        .await?;
    Ok(Json(contract.into()))
}
