//! Application startup and lifecycle management.

use crate::config::VaultConfig;
use crate::handlers::{self, claims, contracts, grants, groups, payments, points};
use crate::services::{
    build_http_client, init_metrics, Database, HttpBalanceService, HttpInvoiceService,
    HttpOrganizationDirectory, PaymentService, PointsLedger, PointsService, VaultStore,
};
use axum::{
    middleware,
    routing::{get, patch, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub store: Arc<dyn VaultStore>,
    pub points: PointsService,
    pub payments: PaymentService,
}

impl AppState {
    /// Wire the domain services over one database and the configured collaborators.
    pub fn from_config(config: &VaultConfig, db: Arc<Database>) -> Result<Self, AppError> {
        let ledger: Arc<dyn PointsLedger> = db.clone();
        let store: Arc<dyn VaultStore> = db.clone();
        let payments = payment_service(config, store.clone())?;

        Ok(Self {
            db,
            store,
            points: PointsService::new(ledger),
            payments,
        })
    }
}

/// Payment reconciliation wired to the HTTP collaborators.
pub fn payment_service(
    config: &VaultConfig,
    store: Arc<dyn VaultStore>,
) -> Result<PaymentService, AppError> {
    let client = build_http_client(config.collaborator_timeout)?;
    let retry = config.retry_config();

    Ok(PaymentService::new(
        store,
        Arc::new(HttpOrganizationDirectory::new(
            client.clone(),
            config.directory_service.url.clone(),
            retry.clone(),
        )),
        Arc::new(HttpBalanceService::new(
            client.clone(),
            config.balance_service.url.clone(),
            retry.clone(),
        )),
        Arc::new(HttpInvoiceService::new(
            client,
            config.invoice_service.url.clone(),
            retry,
        )),
        config.payment_policy(),
    ))
}

/// HTTP routes with the shared middleware stack.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // Applications
        .route(
            "/applications",
            post(grants::create_application).get(grants::list_applications),
        )
        .route(
            "/applications/:id",
            get(grants::get_application).delete(grants::delete_application),
        )
        .route("/applications/:id/points", get(points::application_points))
        .route(
            "/applications/:id/authorizations",
            get(grants::list_authorizations),
        )
        .route("/organizations/points", get(points::organization_points))
        // Authorizations
        .route("/authorizations", post(grants::create_authorization))
        .route(
            "/authorizations/:id",
            get(grants::get_authorization).delete(grants::delete_authorization),
        )
        .route("/authorizations/:id/scopes", patch(grants::update_scopes))
        .route(
            "/authorizations/:id/logs",
            get(grants::list_authorization_logs).post(grants::log_authorization_event),
        )
        .route("/authorizations/:id/dossiers", get(grants::list_dossiers))
        .route(
            "/authorizations/:id/claims/:claim_id",
            put(claims::add_claim).delete(claims::remove_claim),
        )
        .route(
            "/authorizations/:id/purpose-limitation",
            put(claims::attach_purpose_limitation).get(claims::get_purpose_limitation),
        )
        .route("/dossiers", post(grants::create_dossier))
        .route("/scope-requests", post(grants::create_scope_request))
        .route(
            "/scope-requests/:id/authorize",
            post(grants::authorize_scope_request),
        )
        .route("/scope-requests/:id/deny", post(grants::deny_scope_request))
        // Contracts
        .route("/contracts", post(contracts::create_contract))
        .route("/contracts/:id", get(contracts::get_contract))
        .route(
            "/contracts/:id/signees/:signee_id/sign",
            post(contracts::sign_contract),
        )
        .route("/contracts/:id/signed", put(contracts::set_contract_signed))
        .route(
            "/contracts/:id/claims/:claim_id",
            put(claims::add_claim).delete(claims::remove_claim),
        )
        .route(
            "/contracts/:id/purpose-limitation",
            put(claims::attach_purpose_limitation).get(claims::get_purpose_limitation),
        )
        // Claims and proofs
        .route("/claims", post(claims::create_claim))
        .route("/claims/:id", get(claims::get_claim))
        .route("/proofs", post(claims::create_proof))
        .route(
            "/claims/:id/proofs/:proof_id",
            put(claims::add_proof).delete(claims::remove_proof),
        )
        // Groups
        .route("/groups", post(groups::create_group))
        .route("/groups/:id/parent", put(groups::set_group_parent))
        .route("/groups/:id/memberships", post(groups::add_membership))
        .route(
            "/memberships/:id/accept",
            post(groups::accept_membership),
        )
        // Payments
        .route("/payment-runs", post(payments::start_payment_run))
        .route("/payment-runs/:id", get(payments::get_payment_run))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: VaultConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: VaultConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: VaultConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = connect(&config, run_migrations).await?;
        let state = AppState::from_config(&config, Arc::new(db))?;

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "Vault service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "vault-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

/// Open the connection pool and optionally apply migrations.
pub async fn connect(config: &VaultConfig, run_migrations: bool) -> Result<Database, AppError> {
    let db = Database::new(
        &config.database.url,
        config.database.max_connections,
        config.database.min_connections,
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to connect to PostgreSQL");
        e
    })?;

    if run_migrations {
        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;
    }

    Ok(db)
}
