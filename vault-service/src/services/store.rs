//! Storage seams used by the points and payment services.
//!
//! [`Database`](super::Database) implements all of them against Postgres.

use crate::models::{OrganizationBilling, OrganizationOutcome, PaymentRun, PaymentRunStatus};
use async_trait::async_trait;
use chrono::Duration;
use service_core::error::AppError;
use uuid::Uuid;

/// Read side of the points counters plus the billing reset.
#[async_trait]
pub trait PointsLedger: Send + Sync {
    async fn application_exists(&self, application_id: Uuid) -> Result<bool, AppError>;

    /// Sum of points over the application's authorizations; 0 when there are none.
    async fn points_by_application(&self, application_id: Uuid) -> Result<i64, AppError>;

    /// Sum of points over authorizations of every application the organization owns.
    async fn points_by_organization(&self, organization: &str) -> Result<i64, AppError>;

    /// Reset every authorization's points to its scope count, except those of
    /// applications owned by `excluded_organizations`. Returns rows touched.
    async fn reset_points(&self, excluded_organizations: &[String]) -> Result<u64, AppError>;
}

/// Bookkeeping for payment runs.
#[async_trait]
pub trait PaymentRunStore: Send + Sync {
    /// Start a run for `period_key`. Fails with `Conflict` while another run
    /// is in progress; runs older than `stale_after` are failed first.
    async fn begin_payment_run(
        &self,
        period_key: &str,
        stale_after: Duration,
    ) -> Result<PaymentRun, AppError>;

    async fn find_billing(
        &self,
        period_key: &str,
        organization: &str,
    ) -> Result<Option<OrganizationBilling>, AppError>;

    async fn record_billing(&self, billing: &OrganizationBilling) -> Result<(), AppError>;

    async fn record_run_result(
        &self,
        run_id: Uuid,
        outcome: &OrganizationOutcome,
    ) -> Result<(), AppError>;

    #[allow(clippy::too_many_arguments)]
    async fn complete_payment_run(
        &self,
        run_id: Uuid,
        status: PaymentRunStatus,
        processed: i32,
        succeeded: i32,
        failed: i32,
        points_reset: u64,
        error_message: Option<String>,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait VaultStore: PointsLedger + PaymentRunStore {
    async fn health_check(&self) -> Result<(), AppError>;
}
