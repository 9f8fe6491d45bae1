//! Services module for vault-service.

pub mod collaborators;
pub mod database;
pub mod metrics;
pub mod payment;
pub mod points;
pub mod store;

pub use collaborators::{
    build_http_client, Account, BalanceService, HttpBalanceService, HttpInvoiceService,
    HttpOrganizationDirectory, Invoice, InvoiceService, NewInvoice, Organization,
    OrganizationDirectory,
};
pub use database::Database;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use payment::{PaymentPolicy, PaymentService, INVOICE_NAME, PAYMENT_MEMO};
pub use points::PointsService;
pub use store::{PaymentRunStore, PointsLedger, VaultStore};
