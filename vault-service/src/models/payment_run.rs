//! Payment run model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl PaymentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentRunStatus::Running => "running",
            PaymentRunStatus::Completed => "completed",
            PaymentRunStatus::CompletedWithErrors => "completed_with_errors",
            PaymentRunStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => PaymentRunStatus::Completed,
            "completed_with_errors" => PaymentRunStatus::CompletedWithErrors,
            "failed" => PaymentRunStatus::Failed,
            _ => PaymentRunStatus::Running,
        }
    }

    /// Final status from the per-organization tally.
    pub fn settle(succeeded: i32, failed: i32) -> Self {
        match (succeeded, failed) {
            (_, 0) => PaymentRunStatus::Completed,
            (0, _) => PaymentRunStatus::Failed,
            _ => PaymentRunStatus::CompletedWithErrors,
        }
    }
}

/// Outcome of one organization within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Billed,
    AlreadyBilled,
    NoAccount,
    NothingToBill,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Billed => "billed",
            OutcomeStatus::AlreadyBilled => "already_billed",
            OutcomeStatus::NoAccount => "no_account",
            OutcomeStatus::NothingToBill => "nothing_to_bill",
            OutcomeStatus::Failed => "failed",
        }
    }

    /// Whether the organization counts towards the run's billable set.
    pub fn is_billable(&self) -> bool {
        !matches!(self, OutcomeStatus::NoAccount | OutcomeStatus::NothingToBill)
    }
}

/// Payment run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentRun {
    pub run_id: Uuid,
    pub period_key: String,
    pub status: String,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub organizations_processed: i32,
    pub organizations_succeeded: i32,
    pub organizations_failed: i32,
    pub points_reset: i64,
    pub error_message: Option<String>,
}

impl PaymentRun {
    pub fn status(&self) -> PaymentRunStatus {
        PaymentRunStatus::from_string(&self.status)
    }
}

/// Payment run result per organization.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentRunResult {
    pub result_id: Uuid,
    pub run_id: Uuid,
    pub organization: String,
    pub status: String,
    pub points: i64,
    pub invoice_id: Option<String>,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Marker that an organization has been charged for a period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrganizationBilling {
    pub period_key: String,
    pub organization: String,
    pub run_id: Uuid,
    pub points: i64,
    pub debit_amount: Decimal,
    pub invoice_amount: Decimal,
    pub currency: String,
    pub invoice_id: Option<String>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: String,
}

impl Money {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }
}

/// What happened to one organization, as reported back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationOutcome {
    pub organization: String,
    pub status: OutcomeStatus,
    pub points: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debited: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoiced: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrganizationOutcome {
    pub fn skipped(organization: impl Into<String>, status: OutcomeStatus, points: i64) -> Self {
        Self {
            organization: organization.into(),
            status,
            points,
            debited: None,
            invoiced: None,
            invoice_id: None,
            error: None,
        }
    }

    pub fn failed(organization: impl Into<String>, points: i64, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::skipped(organization, OutcomeStatus::Failed, points)
        }
    }
}

/// Batch summary of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRunReport {
    pub run_id: Uuid,
    pub period_key: String,
    pub status: PaymentRunStatus,
    pub organizations: Vec<OrganizationOutcome>,
    pub points_reset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentRunReport {
    pub fn succeeded(&self) -> usize {
        self.organizations
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Billed | OutcomeStatus::AlreadyBilled))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.organizations
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .count()
    }

    pub fn outcome(&self, organization: &str) -> Option<&OrganizationOutcome> {
        self.organizations.iter().find(|o| o.organization == organization)
    }
}

/// Current UTC month as `YYYY-MM`.
pub fn current_period_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Checks a `YYYY-MM` period key.
pub fn is_valid_period_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    if bytes.len() != 7 || bytes[4] != b'-' {
        return false;
    }
    let digits = |s: &[u8]| s.iter().all(u8::is_ascii_digit);
    if !digits(&bytes[..4]) || !digits(&bytes[5..]) {
        return false;
    }
    matches!(key[5..].parse::<u32>(), Ok(1..=12))
}
