//! Configuration for vault-service.

use crate::services::PaymentPolicy;
use rust_decimal::Decimal;
use service_core::config::Config as CoreConfig;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub common: CoreConfig,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub directory_service: CollaboratorConfig,
    pub balance_service: CollaboratorConfig,
    pub invoice_service: CollaboratorConfig,
    pub collaborator_timeout: Duration,
    pub collaborator_max_retries: u32,
    pub payment: PaymentConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub debit_per_point: Decimal,
    pub invoice_per_point: Decimal,
    pub currency: String,
    pub stale_run_minutes: i64,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(name, default);
    raw.parse::<T>()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid {} '{}': {}", name, raw, e)))
}

impl VaultConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let common = CoreConfig::load()?;

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::ConfigError(anyhow::anyhow!("DATABASE_URL must be set")))?;

        let currency = var_or("PAYMENT_CURRENCY", "EUR").to_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PAYMENT_CURRENCY must be an ISO 4217 code, got '{}'",
                currency
            )));
        }

        let config = Self {
            common,
            service_name: var_or("SERVICE_NAME", "vault-service"),
            log_level: var_or("LOG_LEVEL", "info"),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: database_url,
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: parse_var("DATABASE_MIN_CONNECTIONS", "2")?,
            },
            directory_service: CollaboratorConfig {
                url: var_or("DIRECTORY_SERVICE_URL", "http://localhost:8081"),
            },
            balance_service: CollaboratorConfig {
                url: var_or("BALANCE_SERVICE_URL", "http://localhost:8082"),
            },
            invoice_service: CollaboratorConfig {
                url: var_or("INVOICE_SERVICE_URL", "http://localhost:8083"),
            },
            collaborator_timeout: Duration::from_secs(parse_var("COLLABORATOR_TIMEOUT_SECS", "10")?),
            collaborator_max_retries: parse_var("COLLABORATOR_MAX_RETRIES", "3")?,
            payment: PaymentConfig {
                debit_per_point: parse_var("PAYMENT_DEBIT_PER_POINT", "1.00")?,
                invoice_per_point: parse_var("PAYMENT_INVOICE_PER_POINT", "0.01")?,
                currency,
                stale_run_minutes: parse_var("PAYMENT_STALE_RUN_MINUTES", "120")?,
            },
        };

        if config.payment.debit_per_point.is_sign_negative()
            || config.payment.invoice_per_point.is_sign_negative()
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Payment rates must not be negative"
            )));
        }

        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_max_retries(self.collaborator_max_retries)
            .with_attempt_timeout(self.collaborator_timeout)
    }

    pub fn payment_policy(&self) -> PaymentPolicy {
        PaymentPolicy {
            debit_per_point: self.payment.debit_per_point,
            invoice_per_point: self.payment.invoice_per_point,
            currency: self.payment.currency.clone(),
            stale_after: chrono::Duration::minutes(self.payment.stale_run_minutes),
        }
    }
}
