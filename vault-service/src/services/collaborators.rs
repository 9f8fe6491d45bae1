//! Clients for the directory, balance and invoice services.
//!
//! Each collaborator is a trait so the payment run can be exercised against
//! in-memory doubles. The HTTP implementations share one `reqwest::Client`
//! with a request timeout, propagate trace context and retry transient
//! failures through [`retry_call`].

use crate::models::Money;
use crate::services::metrics::record_collaborator_call;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::WithTraceContext;
use service_core::retry::{retry_call, RetryConfig};
use std::time::{Duration, Instant};
use tracing::{info, instrument};

const DIRECTORY: &str = "directory";
const BALANCE: &str = "balance";
const INVOICE: &str = "invoice";

/// Upper bound on followed `hydra:next` links.
const MAX_DIRECTORY_PAGES: usize = 100;

/// An organization as listed by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    /// IRI the organization is referenced by on applications.
    #[serde(rename = "@id")]
    pub iri: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInvoice {
    pub name: String,
    /// Decimal amount in major units, e.g. `"0.12"`.
    pub price: String,
    pub price_currency: String,
    pub customer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
}

#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn list_organizations(&self) -> Result<Vec<Organization>, AppError>;

    /// Canonical URL of an organization, used as account and customer reference.
    fn clean_url(&self, organization_id: &str) -> String;
}

#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn get_account(&self, organization_url: &str) -> Result<Option<Account>, AppError>;

    /// Debit `amount`. Repeating a call with the same `idempotency_key` must not
    /// debit twice.
    async fn remove_credit(
        &self,
        amount: &Money,
        organization_url: &str,
        memo: &str,
        idempotency_key: &str,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// Repeating a call with the same `idempotency_key` returns the invoice created first.
    async fn create_invoice(
        &self,
        invoice: &NewInvoice,
        idempotency_key: &str,
    ) -> Result<Invoice, AppError>;
}

/// Classify a failed response: 5xx, 408 and 429 may succeed on retry.
async fn error_for_status(service: &'static str, response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", service, status, body);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(AppError::transient(service, message))
    } else {
        Err(AppError::permanent(service, message))
    }
}

fn send_error(service: &'static str) -> impl Fn(reqwest::Error) -> AppError {
    move |e| {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            AppError::transient(service, format!("request failed: {}", e))
        } else {
            AppError::permanent(service, format!("request failed: {}", e))
        }
    }
}

fn decode_error(service: &'static str) -> impl Fn(reqwest::Error) -> AppError {
    move |e| AppError::permanent(service, format!("unexpected response body: {}", e))
}

pub fn build_http_client(timeout: Duration) -> Result<Client, AppError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e)))
}

#[derive(Debug, Deserialize)]
struct HydraCollection<T> {
    #[serde(rename = "hydra:member", default = "Vec::new")]
    member: Vec<T>,
    #[serde(rename = "hydra:view", default)]
    view: Option<HydraView>,
}

#[derive(Debug, Deserialize)]
struct HydraView {
    #[serde(rename = "hydra:next", default)]
    next: Option<String>,
}

/// Resolve a `hydra:next` link against the service base.
fn next_page_url(base_url: &str, next: &str) -> String {
    if next.starts_with("http://") || next.starts_with("https://") {
        return next.to_string();
    }
    match reqwest::Url::parse(base_url).and_then(|base| base.join(next)) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{}{}", base_url.trim_end_matches('/'), next),
    }
}

pub struct HttpOrganizationDirectory {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl HttpOrganizationDirectory {
    pub fn new(client: Client, base_url: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<HydraCollection<Organization>, AppError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/ld+json")
            .with_trace_context()
            .send()
            .await
            .map_err(send_error(DIRECTORY))?;

        error_for_status(DIRECTORY, response)
            .await?
            .json::<HydraCollection<Organization>>()
            .await
            .map_err(decode_error(DIRECTORY))
    }
}

#[async_trait]
impl OrganizationDirectory for HttpOrganizationDirectory {
    #[instrument(skip(self))]
    async fn list_organizations(&self) -> Result<Vec<Organization>, AppError> {
        let started = Instant::now();
        let mut organizations = Vec::new();
        let mut next = Some(format!("{}/organizations", self.base_url));
        let mut pages = 0;

        while let Some(url) = next.take() {
            let page = retry_call(&self.retry, DIRECTORY, "list_organizations", || {
                self.fetch_page(&url)
            })
            .await?;

            organizations.extend(page.member);
            pages += 1;
            if pages >= MAX_DIRECTORY_PAGES {
                break;
            }
            next = page
                .view
                .and_then(|v| v.next)
                .map(|n| next_page_url(&self.base_url, &n))
                .filter(|n| *n != url);
        }

        record_collaborator_call(DIRECTORY, "list_organizations", started.elapsed().as_secs_f64());
        info!(count = organizations.len(), pages, "Organizations listed");

        Ok(organizations)
    }

    fn clean_url(&self, organization_id: &str) -> String {
        format!("{}/organizations/{}", self.base_url, organization_id)
    }
}

pub struct HttpBalanceService {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

#[derive(Debug, Serialize)]
struct NewPayment<'a> {
    resource: &'a str,
    amount: String,
    currency: &'a str,
    name: &'a str,
}

impl HttpBalanceService {
    pub fn new(client: Client, base_url: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }
}

#[async_trait]
impl BalanceService for HttpBalanceService {
    #[instrument(skip(self))]
    async fn get_account(&self, organization_url: &str) -> Result<Option<Account>, AppError> {
        let started = Instant::now();
        let url = format!("{}/accounts", self.base_url);

        let accounts = retry_call(&self.retry, BALANCE, "get_account", || async {
            let response = self
                .client
                .get(&url)
                .query(&[("resource", organization_url)])
                .header("Accept", "application/ld+json")
                .with_trace_context()
                .send()
                .await
                .map_err(send_error(BALANCE))?;

            error_for_status(BALANCE, response)
                .await?
                .json::<HydraCollection<Account>>()
                .await
                .map_err(decode_error(BALANCE))
        })
        .await?;

        record_collaborator_call(BALANCE, "get_account", started.elapsed().as_secs_f64());

        Ok(accounts.member.into_iter().next())
    }

    #[instrument(skip(self, amount), fields(debit = %amount.amount, currency = %amount.currency))]
    async fn remove_credit(
        &self,
        amount: &Money,
        organization_url: &str,
        memo: &str,
        idempotency_key: &str,
    ) -> Result<(), AppError> {
        let started = Instant::now();
        let url = format!("{}/payments", self.base_url);
        let payment = NewPayment {
            resource: organization_url,
            amount: amount.amount.round_dp(2).to_string(),
            currency: &amount.currency,
            name: memo,
        };

        retry_call(&self.retry, BALANCE, "remove_credit", || async {
            let response = self
                .client
                .post(&url)
                .header("Idempotency-Key", idempotency_key)
                .with_trace_context()
                .json(&payment)
                .send()
                .await
                .map_err(send_error(BALANCE))?;

            error_for_status(BALANCE, response).await.map(|_| ())
        })
        .await?;

        record_collaborator_call(BALANCE, "remove_credit", started.elapsed().as_secs_f64());
        info!(organization = %organization_url, "Credit removed");

        Ok(())
    }
}

pub struct HttpInvoiceService {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl HttpInvoiceService {
    pub fn new(client: Client, base_url: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }
}

#[async_trait]
impl InvoiceService for HttpInvoiceService {
    #[instrument(skip(self, invoice), fields(customer = %invoice.customer))]
    async fn create_invoice(
        &self,
        invoice: &NewInvoice,
        idempotency_key: &str,
    ) -> Result<Invoice, AppError> {
        let started = Instant::now();
        let url = format!("{}/invoices", self.base_url);

        let created = retry_call(&self.retry, INVOICE, "create_invoice", || async {
            let response = self
                .client
                .post(&url)
                .header("Accept", "application/json")
                .header("Idempotency-Key", idempotency_key)
                .with_trace_context()
                .json(invoice)
                .send()
                .await
                .map_err(send_error(INVOICE))?;

            error_for_status(INVOICE, response)
                .await?
                .json::<Invoice>()
                .await
                .map_err(decode_error(INVOICE))
        })
        .await?;

        record_collaborator_call(INVOICE, "create_invoice", started.elapsed().as_secs_f64());
        info!(invoice_id = %created.id, "Invoice created");

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organizations_decode_from_hydra_collection() {
        let body = serde_json::json!({
            "hydra:member": [
                { "id": "a1", "@id": "https://wrc.example.org/organizations/a1", "name": "Acme" },
                { "id": "b2", "@id": "https://wrc.example.org/organizations/b2" }
            ],
            "hydra:totalItems": 2
        });

        let page: HydraCollection<Organization> = serde_json::from_value(body).unwrap();
        assert_eq!(page.member.len(), 2);
        assert_eq!(page.member[0].iri, "https://wrc.example.org/organizations/a1");
        assert_eq!(page.member[1].name, None);
        assert!(page.view.is_none());
    }

    #[test]
    fn invoice_uses_camel_case_currency() {
        let invoice = NewInvoice {
            name: "id-vault monthly payment".to_string(),
            price: "0.12".to_string(),
            price_currency: "EUR".to_string(),
            customer: "https://wrc.example.org/organizations/a1".to_string(),
        };
        let json = serde_json::to_value(&invoice).unwrap();
        assert_eq!(json["priceCurrency"], "EUR");
        assert_eq!(json["price"], "0.12");
    }

    #[test]
    fn clean_url_strips_trailing_slash() {
        let directory = HttpOrganizationDirectory::new(
            Client::new(),
            "https://wrc.example.org/",
            RetryConfig::no_retry(),
        );
        assert_eq!(
            directory.clean_url("a1"),
            "https://wrc.example.org/organizations/a1"
        );
    }

    #[test]
    fn relative_next_links_resolve_against_base() {
        assert_eq!(
            next_page_url("https://wrc.example.org", "/organizations?page=2"),
            "https://wrc.example.org/organizations?page=2"
        );
        assert_eq!(
            next_page_url("https://wrc.example.org", "https://other.example.org/o?page=3"),
            "https://other.example.org/o?page=3"
        );
    }
}
