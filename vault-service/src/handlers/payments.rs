use crate::models::{PaymentRun, PaymentRunReport};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct StartPaymentRun {
    /// Billing period as `YYYY-MM`; the current month when absent.
    pub period: Option<String>,
}

/// Trigger one reconciliation pass. The body is optional.
#[tracing::instrument(skip(state, body))]
pub async fn start_payment_run(
    State(state): State<AppState>,
    body: Option<Json<StartPaymentRun>>,
) -> Result<(StatusCode, Json<PaymentRunReport>), AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let report = state
        .payments
        .process_payments(request.period.as_deref())
        .await?;
    Ok((StatusCode::OK, Json(report)))
}

#[tracing::instrument(skip(state))]
pub async fn get_payment_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<PaymentRun>, AppError> {
    let run = state
        .db
        .get_payment_run(run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment run not found")))?;
    Ok(Json(run))
}
