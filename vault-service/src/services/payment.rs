//! Periodic payment reconciliation.
//!
//! One run charges every organization with a balance account for the points
//! its applications accumulated, invoices it, and then resets the points
//! counters. Runs are mutually exclusive and each organization is billed at
//! most once per period key.

use crate::models::{
    current_period_key, is_valid_period_key, Money, OrganizationBilling, OrganizationOutcome,
    OutcomeStatus, PaymentRun, PaymentRunReport, PaymentRunStatus,
};
use crate::services::collaborators::{
    BalanceService, InvoiceService, NewInvoice, Organization, OrganizationDirectory,
};
use crate::services::metrics::{
    record_error, record_organization_outcome, record_payment_run, record_points_billed,
};
use crate::services::store::VaultStore;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const PAYMENT_MEMO: &str = "Id-vault payment";
pub const INVOICE_NAME: &str = "id-vault monthly payment";

/// Prices applied to accumulated points.
#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    /// Amount debited from the balance per point.
    pub debit_per_point: Decimal,
    /// Invoice price per point.
    pub invoice_per_point: Decimal,
    pub currency: String,
    /// A run still `running` after this long is considered abandoned.
    pub stale_after: Duration,
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            debit_per_point: Decimal::ONE,
            invoice_per_point: Decimal::new(1, 2),
            currency: "EUR".to_string(),
            stale_after: Duration::minutes(120),
        }
    }
}

impl PaymentPolicy {
    pub fn debit_for(&self, points: i64) -> Money {
        Money::new(
            Decimal::from(points) * self.debit_per_point,
            self.currency.clone(),
        )
    }

    pub fn invoice_for(&self, points: i64) -> Money {
        Money::new(
            (Decimal::from(points) * self.invoice_per_point).round_dp(2),
            self.currency.clone(),
        )
    }
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn VaultStore>,
    directory: Arc<dyn OrganizationDirectory>,
    balance: Arc<dyn BalanceService>,
    invoices: Arc<dyn InvoiceService>,
    policy: PaymentPolicy,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn VaultStore>,
        directory: Arc<dyn OrganizationDirectory>,
        balance: Arc<dyn BalanceService>,
        invoices: Arc<dyn InvoiceService>,
        policy: PaymentPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            balance,
            invoices,
            policy,
        }
    }

    pub fn policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    /// Run one reconciliation pass for `period_key` (default: current UTC month).
    ///
    /// Fails without side effects when the period is malformed or another run
    /// is in progress, and marks the run failed when the organization list
    /// cannot be fetched. Per-organization failures are reported in the
    /// returned summary.
    #[instrument(skip(self))]
    pub async fn process_payments(
        &self,
        period_key: Option<&str>,
    ) -> Result<PaymentRunReport, AppError> {
        let period_key = match period_key {
            Some(key) if is_valid_period_key(key) => key.to_string(),
            Some(key) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Invalid period '{}', expected YYYY-MM",
                    key
                )));
            }
            None => current_period_key(Utc::now()),
        };

        let run = self
            .store
            .begin_payment_run(&period_key, self.policy.stale_after)
            .await
            .map_err(|e| {
                record_error(e.kind(), "begin_payment_run");
                e
            })?;

        info!(run_id = %run.run_id, period_key = %period_key, "Starting payment run");

        let organizations = match self.directory.list_organizations().await {
            Ok(organizations) => organizations,
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Failed to list organizations");
                record_error(e.kind(), "list_organizations");
                self.finish(&run, PaymentRunStatus::Failed, 0, 0, 0, 0, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let mut outcomes = Vec::with_capacity(organizations.len());
        let mut failed_organizations = Vec::new();

        for organization in &organizations {
            let outcome = self.bill_organization(&run, organization).await;

            record_organization_outcome(outcome.status.as_str());
            if outcome.status == OutcomeStatus::Failed {
                failed_organizations.push(organization.iri.clone());
            }
            if let Err(e) = self.store.record_run_result(run.run_id, &outcome).await {
                warn!(
                    run_id = %run.run_id,
                    organization = %outcome.organization,
                    error = %e,
                    "Failed to record payment run result"
                );
            }
            outcomes.push(outcome);
        }

        let mut report = PaymentRunReport {
            run_id: run.run_id,
            period_key,
            status: PaymentRunStatus::Running,
            organizations: outcomes,
            points_reset: 0,
            error: None,
        };

        let succeeded = report.succeeded() as i32;
        let failed = report.failed() as i32;
        report.status = PaymentRunStatus::settle(succeeded, failed);

        // Organizations that failed keep their points for the next run.
        match self.store.reset_points(&failed_organizations).await {
            Ok(rows) => report.points_reset = rows,
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Failed to reset points");
                record_error(e.kind(), "reset_points");
                report.status = PaymentRunStatus::Failed;
                report.error = Some(format!("Points reset failed: {}", e));
            }
        }

        self.finish(
            &run,
            report.status,
            organizations.len() as i32,
            succeeded,
            failed,
            report.points_reset,
            report.error.clone(),
        )
        .await;

        info!(
            run_id = %run.run_id,
            status = report.status.as_str(),
            processed = organizations.len(),
            succeeded,
            failed,
            points_reset = report.points_reset,
            "Payment run finished"
        );

        Ok(report)
    }

    /// Bill one organization; errors become a `failed` outcome.
    async fn bill_organization(
        &self,
        run: &PaymentRun,
        organization: &Organization,
    ) -> OrganizationOutcome {
        let url = self.directory.clean_url(&organization.id);

        match self.try_bill(run, organization, &url).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    run_id = %run.run_id,
                    organization = %url,
                    error = %e,
                    "Organization billing failed"
                );
                record_error(e.kind(), "bill_organization");
                OrganizationOutcome::failed(url, 0, e)
            }
        }
    }

    async fn try_bill(
        &self,
        run: &PaymentRun,
        organization: &Organization,
        url: &str,
    ) -> Result<OrganizationOutcome, AppError> {
        if let Some(billing) = self.store.find_billing(&run.period_key, url).await? {
            info!(organization = %url, period_key = %run.period_key, "Already billed for period");
            return Ok(OrganizationOutcome {
                invoice_id: billing.invoice_id,
                ..OrganizationOutcome::skipped(url, OutcomeStatus::AlreadyBilled, billing.points)
            });
        }

        if self.balance.get_account(url).await?.is_none() {
            return Ok(OrganizationOutcome::skipped(url, OutcomeStatus::NoAccount, 0));
        }

        // Applications reference their organization by IRI.
        let points = self.store.points_by_organization(&organization.iri).await?;
        if points <= 0 {
            return Ok(OrganizationOutcome::skipped(url, OutcomeStatus::NothingToBill, 0));
        }

        let debit = self.policy.debit_for(points);
        let price = self.policy.invoice_for(points);
        let idempotency_key = format!("{}:{}", run.period_key, url);

        self.balance
            .remove_credit(&debit, url, PAYMENT_MEMO, &idempotency_key)
            .await
            .map_err(|e| with_step(e, "debit"))?;

        let invoice = self
            .invoices
            .create_invoice(
                &NewInvoice {
                    name: INVOICE_NAME.to_string(),
                    price: price.amount.to_string(),
                    price_currency: price.currency.clone(),
                    customer: url.to_string(),
                },
                &idempotency_key,
            )
            .await
            .map_err(|e| with_step(e, "invoice"))?;

        self.store
            .record_billing(&OrganizationBilling {
                period_key: run.period_key.clone(),
                organization: url.to_string(),
                run_id: run.run_id,
                points,
                debit_amount: debit.amount,
                invoice_amount: price.amount,
                currency: debit.currency.clone(),
                invoice_id: Some(invoice.id.clone()),
                created_utc: Utc::now(),
            })
            .await?;

        record_points_billed(&debit.currency, points);
        info!(
            organization = %url,
            points,
            debit = %debit.amount,
            invoice_id = %invoice.id,
            "Organization billed"
        );

        Ok(OrganizationOutcome {
            organization: url.to_string(),
            status: OutcomeStatus::Billed,
            points,
            debited: Some(debit),
            invoiced: Some(price),
            invoice_id: Some(invoice.id),
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run: &PaymentRun,
        status: PaymentRunStatus,
        processed: i32,
        succeeded: i32,
        failed: i32,
        points_reset: u64,
        error_message: Option<String>,
    ) {
        record_payment_run(status.as_str());
        if let Err(e) = self
            .store
            .complete_payment_run(
                run.run_id,
                status,
                processed,
                succeeded,
                failed,
                points_reset,
                error_message,
            )
            .await
        {
            error!(run_id = %run.run_id, error = %e, "Failed to complete payment run");
        }
    }
}

/// Prefix a collaborator failure with the step it happened in.
fn with_step(err: AppError, step: &str) -> AppError {
    match err {
        AppError::ExternalService {
            service,
            message,
            retryable,
        } => AppError::ExternalService {
            service,
            message: format!("{} failed: {}", step, message),
            retryable,
        },
        other => other,
    }
}
