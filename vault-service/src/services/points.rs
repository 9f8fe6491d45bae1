//! Points aggregation over authorizations.

use crate::services::store::PointsLedger;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PointsService {
    ledger: Arc<dyn PointsLedger>,
}

impl PointsService {
    pub fn new(ledger: Arc<dyn PointsLedger>) -> Self {
        Self { ledger }
    }

    /// Total points granted to one application.
    #[instrument(skip(self), fields(application_id = %application_id))]
    pub async fn points_by_application(&self, application_id: Uuid) -> Result<i64, AppError> {
        if !self.ledger.application_exists(application_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!("Application id is invalid")));
        }
        let points = self.ledger.points_by_application(application_id).await?;
        info!(points, "Points by application");
        Ok(points)
    }

    /// Total points over every application the organization owns.
    #[instrument(skip(self))]
    pub async fn points_by_organization(&self, organization: &str) -> Result<i64, AppError> {
        if organization.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "organization must not be empty"
            )));
        }
        let points = self.ledger.points_by_organization(organization).await?;
        info!(points, "Points by organization");
        Ok(points)
    }
}
