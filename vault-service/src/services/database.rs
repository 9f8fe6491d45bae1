//! Database service for vault-service.

use crate::models::{
    claim, AcceptingParty, Application, Authorization, AuthorizationLog, Claim, Contract,
    CreateApplication, CreateAuthorization, CreateClaim, CreateContract, CreateDossier,
    CreateGroup, CreateMembership, CreateProof, CreatePurposeLimitation, CreateScopeRequest,
    Dossier, GrantRef, Group, GroupTree, Membership, OrganizationBilling, OrganizationOutcome,
    PaymentRun, PaymentRunStatus, Proof, PurposeLimitation, ScopeRequest, Signee, UpdateScopes,
};
use crate::services::metrics::{record_grant_operation, DB_QUERY_DURATION};
use crate::services::store::{PaymentRunStore, PointsLedger, VaultStore};
use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const APPLICATION_COLUMNS: &str = "application_id, name, description, organization, contact, authorization_url, single_sign_on_url, webhook_url, notification_endpoint, gdpr_contact, technical_contact, privacy_contact, billing_contact, secret, test_secret, scopes, created_utc, updated_utc";
const AUTHORIZATION_COLUMNS: &str = "authorization_id, application_id, user_url, new_user, scopes, code, goal, points, starting_date, created_utc, updated_utc";
const CONTRACT_COLUMNS: &str =
    "contract_id, person, application_id, scopes, goal, signed, created_utc, updated_utc";
const SIGNEE_COLUMNS: &str = "signee_id, contract_id, name, email, phone, signed, created_utc";
const CLAIM_COLUMNS: &str = "claim_id, person, property, data, token, created_utc, updated_utc";
const PROOF_COLUMNS: &str = "proof_id, claim_id, application_id, proof_type, proof_purpose, verification_method, jws, created_utc";
const DOSSIER_COLUMNS: &str = "dossier_id, authorization_id, name, description, goal, expiry_date, sso, legal, scopes, created_utc, updated_utc";
const PAYMENT_RUN_COLUMNS: &str = "run_id, period_key, status, started_utc, completed_utc, organizations_processed, organizations_succeeded, organizations_failed, points_reset, error_message";

/// Wrap a sqlx error with context, keeping not-found and unique violations typed.
fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| match AppError::from(e) {
        AppError::DatabaseError(inner) => {
            AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, inner))
        }
        other => other,
    }
}

fn invalid_application() -> AppError {
    AppError::NotFound(anyhow::anyhow!("Application id is invalid"))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "vault-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), AppError> {
        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })
    }

    // =========================================================================
    // Application Operations
    // =========================================================================

    /// Register an application. Secrets are generated here, once.
    #[instrument(skip(self, input), fields(organization = %input.organization))]
    pub async fn create_application(
        &self,
        input: CreateApplication,
    ) -> Result<Application, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_application"])
            .start_timer();

        let mut app = Application::new(input);
        app.ensure_secrets(&mut rand::thread_rng());

        let app = sqlx::query_as::<_, Application>(&format!(
            r#"
            INSERT INTO applications (application_id, name, description, organization, contact, authorization_url, single_sign_on_url, webhook_url, notification_endpoint, gdpr_contact, technical_contact, privacy_contact, billing_contact, secret, test_secret, scopes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {}
            "#,
            APPLICATION_COLUMNS
        ))
        .bind(app.application_id)
        .bind(&app.name)
        .bind(&app.description)
        .bind(&app.organization)
        .bind(&app.contact)
        .bind(&app.authorization_url)
        .bind(&app.single_sign_on_url)
        .bind(&app.webhook_url)
        .bind(&app.notification_endpoint)
        .bind(&app.gdpr_contact)
        .bind(&app.technical_contact)
        .bind(&app.privacy_contact)
        .bind(&app.billing_contact)
        .bind(&app.secret)
        .bind(&app.test_secret)
        .bind(&app.scopes)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create application"))?;

        timer.observe_duration();
        record_grant_operation("application", "create");
        info!(application_id = %app.application_id, name = %app.name, "Application created");

        Ok(app)
    }

    #[instrument(skip(self), fields(application_id = %application_id))]
    pub async fn get_application(
        &self,
        application_id: Uuid,
    ) -> Result<Option<Application>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_application"])
            .start_timer();

        let app = sqlx::query_as::<_, Application>(&format!(
            "SELECT {} FROM applications WHERE application_id = $1",
            APPLICATION_COLUMNS
        ))
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get application"))?;

        timer.observe_duration();

        Ok(app)
    }

    #[instrument(skip(self))]
    pub async fn list_applications_by_organization(
        &self,
        organization: &str,
    ) -> Result<Vec<Application>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_applications_by_organization"])
            .start_timer();

        let apps = sqlx::query_as::<_, Application>(&format!(
            "SELECT {} FROM applications WHERE organization = $1 ORDER BY created_utc",
            APPLICATION_COLUMNS
        ))
        .bind(organization)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list applications"))?;

        timer.observe_duration();

        Ok(apps)
    }

    /// Delete an application with its authorizations, contracts and proofs.
    #[instrument(skip(self), fields(application_id = %application_id))]
    pub async fn delete_application(&self, application_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_application"])
            .start_timer();

        let mut tx = self.begin().await?;

        let authorizations = sqlx::query_as::<_, Authorization>(&format!(
            "SELECT {} FROM authorizations WHERE application_id = $1 FOR UPDATE",
            AUTHORIZATION_COLUMNS
        ))
        .bind(application_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("Failed to lock authorizations"))?;

        let dossiers = sqlx::query_as::<_, Dossier>(&format!(
            "SELECT {} FROM dossiers WHERE authorization_id IN (SELECT authorization_id FROM authorizations WHERE application_id = $1)",
            DOSSIER_COLUMNS
        ))
        .bind(application_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("Failed to load dossiers"))?;

        let now = Utc::now();
        for auth in &authorizations {
            auth.ensure_cancellable(&dossiers, now)?;
        }

        // claim_grants carries no foreign key to the grant tables.
        sqlx::query(
            r#"
            DELETE FROM claim_grants
            WHERE (grant_kind = 'authorization' AND grant_id IN (SELECT authorization_id FROM authorizations WHERE application_id = $1))
               OR (grant_kind = 'contract' AND grant_id IN (SELECT contract_id FROM contracts WHERE application_id = $1))
            "#,
        )
        .bind(application_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to unlink claims"))?;

        sqlx::query(
            r#"
            DELETE FROM purpose_limitations
            WHERE (grant_kind = 'authorization' AND grant_id IN (SELECT authorization_id FROM authorizations WHERE application_id = $1))
               OR (grant_kind = 'contract' AND grant_id IN (SELECT contract_id FROM contracts WHERE application_id = $1))
            "#,
        )
        .bind(application_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to delete purpose limitations"))?;

        let result = sqlx::query("DELETE FROM applications WHERE application_id = $1")
            .bind(application_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to delete application"))?;

        Self::commit(tx).await?;
        timer.observe_duration();

        let deleted = result.rows_affected() > 0;
        if deleted {
            record_grant_operation("application", "delete");
            info!(application_id = %application_id, "Application deleted");
        }
        Ok(deleted)
    }

    // =========================================================================
    // Authorization Operations
    // =========================================================================

    #[instrument(skip(self, input), fields(application_id = %input.application_id))]
    pub async fn create_authorization(
        &self,
        input: CreateAuthorization,
    ) -> Result<Authorization, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_authorization"])
            .start_timer();

        if !self.application_exists(input.application_id).await? {
            return Err(invalid_application());
        }

        let mut auth = Authorization::new(input);
        auth.prepare_for_persist(&mut rand::thread_rng());

        let auth = sqlx::query_as::<_, Authorization>(&format!(
            r#"
            INSERT INTO authorizations (authorization_id, application_id, user_url, new_user, scopes, code, goal, points, starting_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            AUTHORIZATION_COLUMNS
        ))
        .bind(auth.authorization_id)
        .bind(auth.application_id)
        .bind(&auth.user_url)
        .bind(auth.new_user)
        .bind(&auth.scopes)
        .bind(&auth.code)
        .bind(&auth.goal)
        .bind(auth.points)
        .bind(auth.starting_date)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create authorization"))?;

        timer.observe_duration();
        record_grant_operation("authorization", "create");
        info!(
            authorization_id = %auth.authorization_id,
            points = auth.points,
            "Authorization created"
        );

        Ok(auth)
    }

    /// Get an authorization with its linked claim ids.
    #[instrument(skip(self), fields(authorization_id = %authorization_id))]
    pub async fn get_authorization(
        &self,
        authorization_id: Uuid,
    ) -> Result<Option<Authorization>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_authorization"])
            .start_timer();

        let auth = sqlx::query_as::<_, Authorization>(&format!(
            "SELECT {} FROM authorizations WHERE authorization_id = $1",
            AUTHORIZATION_COLUMNS
        ))
        .bind(authorization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get authorization"))?;

        let auth = match auth {
            Some(mut auth) => {
                auth.claim_ids = self
                    .claim_ids_for(GrantRef::Authorization(authorization_id))
                    .await?
                    .into_iter()
                    .collect();
                Some(auth)
            }
            None => None,
        };

        timer.observe_duration();

        Ok(auth)
    }

    #[instrument(skip(self), fields(application_id = %application_id))]
    pub async fn list_authorizations(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<Authorization>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_authorizations"])
            .start_timer();

        let auths = sqlx::query_as::<_, Authorization>(&format!(
            "SELECT {} FROM authorizations WHERE application_id = $1 ORDER BY created_utc",
            AUTHORIZATION_COLUMNS
        ))
        .bind(application_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list authorizations"))?;

        timer.observe_duration();

        Ok(auths)
    }

    async fn lock_authorization(
        tx: &mut Transaction<'static, Postgres>,
        authorization_id: Uuid,
    ) -> Result<Authorization, AppError> {
        sqlx::query_as::<_, Authorization>(&format!(
            "SELECT {} FROM authorizations WHERE authorization_id = $1 FOR UPDATE",
            AUTHORIZATION_COLUMNS
        ))
        .bind(authorization_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("Failed to lock authorization"))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Authorization {} not found", authorization_id))
        })
    }

    async fn save_authorization(
        tx: &mut Transaction<'static, Postgres>,
        auth: &Authorization,
    ) -> Result<Authorization, AppError> {
        sqlx::query_as::<_, Authorization>(&format!(
            r#"
            UPDATE authorizations
            SET scopes = $2, code = $3, points = $4, updated_utc = NOW()
            WHERE authorization_id = $1
            RETURNING {}
            "#,
            AUTHORIZATION_COLUMNS
        ))
        .bind(auth.authorization_id)
        .bind(&auth.scopes)
        .bind(&auth.code)
        .bind(auth.points)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_error("Failed to update authorization"))
    }

    /// Add and remove scopes. Points are re-derived and never lowered.
    #[instrument(skip(self, input), fields(authorization_id = %authorization_id))]
    pub async fn update_authorization_scopes(
        &self,
        authorization_id: Uuid,
        input: &UpdateScopes,
    ) -> Result<Authorization, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_authorization_scopes"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut auth = Self::lock_authorization(&mut tx, authorization_id).await?;

        auth.remove_scopes(&input.remove);
        auth.add_scopes(&input.add);
        auth.prepare_for_persist(&mut rand::thread_rng());

        let auth = Self::save_authorization(&mut tx, &auth).await?;
        Self::commit(tx).await?;

        timer.observe_duration();
        record_grant_operation("authorization", "update_scopes");
        info!(
            authorization_id = %authorization_id,
            scopes = auth.scopes.len(),
            points = auth.points,
            "Authorization scopes updated"
        );

        Ok(auth)
    }

    /// Cancel an authorization unless a dossier still holds it.
    #[instrument(skip(self), fields(authorization_id = %authorization_id))]
    pub async fn delete_authorization(&self, authorization_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_authorization"])
            .start_timer();

        let mut tx = self.begin().await?;
        let auth = Self::lock_authorization(&mut tx, authorization_id).await?;

        let dossiers = sqlx::query_as::<_, Dossier>(&format!(
            "SELECT {} FROM dossiers WHERE authorization_id = $1",
            DOSSIER_COLUMNS
        ))
        .bind(authorization_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("Failed to load dossiers"))?;

        auth.ensure_cancellable(&dossiers, Utc::now())?;

        sqlx::query("DELETE FROM claim_grants WHERE grant_kind = 'authorization' AND grant_id = $1")
            .bind(authorization_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to unlink claims"))?;

        sqlx::query(
            "DELETE FROM purpose_limitations WHERE grant_kind = 'authorization' AND grant_id = $1",
        )
        .bind(authorization_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to delete purpose limitation"))?;

        sqlx::query("DELETE FROM authorizations WHERE authorization_id = $1")
            .bind(authorization_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to delete authorization"))?;

        Self::commit(tx).await?;
        timer.observe_duration();
        record_grant_operation("authorization", "delete");
        info!(authorization_id = %authorization_id, "Authorization cancelled");

        Ok(())
    }

    #[instrument(skip(self), fields(authorization_id = %authorization_id))]
    pub async fn log_authorization_event(
        &self,
        authorization_id: Uuid,
        status: &str,
        endpoint: Option<String>,
    ) -> Result<AuthorizationLog, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["log_authorization_event"])
            .start_timer();

        let log = AuthorizationLog::new(authorization_id, status, endpoint);
        let log = sqlx::query_as::<_, AuthorizationLog>(
            r#"
            INSERT INTO authorization_logs (log_id, authorization_id, status, endpoint)
            VALUES ($1, $2, $3, $4)
            RETURNING log_id, authorization_id, status, endpoint, created_utc
            "#,
        )
        .bind(log.log_id)
        .bind(log.authorization_id)
        .bind(&log.status)
        .bind(&log.endpoint)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to write authorization log"))?;

        timer.observe_duration();

        Ok(log)
    }

    #[instrument(skip(self), fields(authorization_id = %authorization_id))]
    pub async fn list_authorization_logs(
        &self,
        authorization_id: Uuid,
    ) -> Result<Vec<AuthorizationLog>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_authorization_logs"])
            .start_timer();

        let logs = sqlx::query_as::<_, AuthorizationLog>(
            r#"
            SELECT log_id, authorization_id, status, endpoint, created_utc
            FROM authorization_logs
            WHERE authorization_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(authorization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list authorization logs"))?;

        timer.observe_duration();

        Ok(logs)
    }

    // =========================================================================
    // Dossier and Scope Request Operations
    // =========================================================================

    #[instrument(skip(self, input))]
    pub async fn create_dossier(&self, input: CreateDossier) -> Result<Dossier, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_dossier"])
            .start_timer();

        let dossier = Dossier::new(input);
        let dossier = sqlx::query_as::<_, Dossier>(&format!(
            r#"
            INSERT INTO dossiers (dossier_id, authorization_id, name, description, goal, expiry_date, sso, legal, scopes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            DOSSIER_COLUMNS
        ))
        .bind(dossier.dossier_id)
        .bind(dossier.authorization_id)
        .bind(&dossier.name)
        .bind(&dossier.description)
        .bind(&dossier.goal)
        .bind(dossier.expiry_date)
        .bind(&dossier.sso)
        .bind(dossier.legal)
        .bind(&dossier.scopes)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create dossier"))?;

        timer.observe_duration();
        info!(dossier_id = %dossier.dossier_id, legal = dossier.legal, "Dossier created");

        Ok(dossier)
    }

    #[instrument(skip(self), fields(authorization_id = %authorization_id))]
    pub async fn list_dossiers(&self, authorization_id: Uuid) -> Result<Vec<Dossier>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_dossiers"])
            .start_timer();

        let dossiers = sqlx::query_as::<_, Dossier>(&format!(
            "SELECT {} FROM dossiers WHERE authorization_id = $1 ORDER BY created_utc",
            DOSSIER_COLUMNS
        ))
        .bind(authorization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list dossiers"))?;

        timer.observe_duration();

        Ok(dossiers)
    }

    #[instrument(skip(self, input), fields(authorization_id = %input.authorization_id))]
    pub async fn create_scope_request(
        &self,
        input: CreateScopeRequest,
    ) -> Result<ScopeRequest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_scope_request"])
            .start_timer();

        let request = ScopeRequest::new(input);
        let request = sqlx::query_as::<_, ScopeRequest>(
            r#"
            INSERT INTO scope_requests (scope_request_id, authorization_id, scopes)
            VALUES ($1, $2, $3)
            RETURNING scope_request_id, authorization_id, scopes, authorized, date_authorized, created_utc
            "#,
        )
        .bind(request.scope_request_id)
        .bind(request.authorization_id)
        .bind(&request.scopes)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create scope request"))?;

        timer.observe_duration();

        Ok(request)
    }

    async fn lock_scope_request(
        tx: &mut Transaction<'static, Postgres>,
        scope_request_id: Uuid,
    ) -> Result<ScopeRequest, AppError> {
        sqlx::query_as::<_, ScopeRequest>(
            r#"
            SELECT scope_request_id, authorization_id, scopes, authorized, date_authorized, created_utc
            FROM scope_requests
            WHERE scope_request_id = $1
            FOR UPDATE
            "#,
        )
        .bind(scope_request_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("Failed to lock scope request"))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Scope request {} not found", scope_request_id))
        })
    }

    async fn save_scope_request(
        tx: &mut Transaction<'static, Postgres>,
        request: &ScopeRequest,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE scope_requests SET authorized = $2, date_authorized = $3 WHERE scope_request_id = $1",
        )
        .bind(request.scope_request_id)
        .bind(request.authorized)
        .bind(request.date_authorized)
        .execute(&mut **tx)
        .await
        .map_err(db_error("Failed to update scope request"))?;
        Ok(())
    }

    /// Grant a scope request: its scopes are merged into the authorization.
    #[instrument(skip(self), fields(scope_request_id = %scope_request_id))]
    pub async fn authorize_scope_request(
        &self,
        scope_request_id: Uuid,
    ) -> Result<Authorization, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["authorize_scope_request"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut request = Self::lock_scope_request(&mut tx, scope_request_id).await?;
        let mut auth = Self::lock_authorization(&mut tx, request.authorization_id).await?;

        let added = request.authorize(&mut auth, Utc::now())?;
        auth.prepare_for_persist(&mut rand::thread_rng());

        let auth = Self::save_authorization(&mut tx, &auth).await?;
        Self::save_scope_request(&mut tx, &request).await?;
        Self::commit(tx).await?;

        timer.observe_duration();
        info!(
            scope_request_id = %scope_request_id,
            added,
            points = auth.points,
            "Scope request authorized"
        );

        Ok(auth)
    }

    #[instrument(skip(self), fields(scope_request_id = %scope_request_id))]
    pub async fn deny_scope_request(&self, scope_request_id: Uuid) -> Result<ScopeRequest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deny_scope_request"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut request = Self::lock_scope_request(&mut tx, scope_request_id).await?;
        request.deny()?;
        Self::save_scope_request(&mut tx, &request).await?;
        Self::commit(tx).await?;

        timer.observe_duration();

        Ok(request)
    }

    // =========================================================================
    // Contract Operations
    // =========================================================================

    /// Create a contract together with its signees.
    #[instrument(skip(self, input))]
    pub async fn create_contract(&self, input: CreateContract) -> Result<Contract, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_contract"])
            .start_timer();

        if let Some(application_id) = input.application_id {
            if !self.application_exists(application_id).await? {
                return Err(invalid_application());
            }
        }

        let contract = Contract::new(input);
        let mut tx = self.begin().await?;

        let mut stored = sqlx::query_as::<_, Contract>(&format!(
            r#"
            INSERT INTO contracts (contract_id, person, application_id, scopes, goal, signed)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            CONTRACT_COLUMNS
        ))
        .bind(contract.contract_id)
        .bind(&contract.person)
        .bind(contract.application_id)
        .bind(&contract.scopes)
        .bind(&contract.goal)
        .bind(contract.signed)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to create contract"))?;

        for signee in &contract.signees {
            let signee = sqlx::query_as::<_, Signee>(&format!(
                r#"
                INSERT INTO signees (signee_id, contract_id, name, email, phone, signed)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING {}
                "#,
                SIGNEE_COLUMNS
            ))
            .bind(signee.signee_id)
            .bind(signee.contract_id)
            .bind(&signee.name)
            .bind(&signee.email)
            .bind(&signee.phone)
            .bind(signee.signed)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("Failed to create signee"))?;
            stored.signees.push(signee);
        }

        Self::commit(tx).await?;
        timer.observe_duration();
        record_grant_operation("contract", "create");
        info!(
            contract_id = %stored.contract_id,
            signees = stored.signees.len(),
            "Contract created"
        );

        Ok(stored)
    }

    /// Get a contract with signees and linked claim ids.
    #[instrument(skip(self), fields(contract_id = %contract_id))]
    pub async fn get_contract(&self, contract_id: Uuid) -> Result<Option<Contract>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_contract"])
            .start_timer();

        let contract = sqlx::query_as::<_, Contract>(&format!(
            "SELECT {} FROM contracts WHERE contract_id = $1",
            CONTRACT_COLUMNS
        ))
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get contract"))?;

        let contract = match contract {
            Some(mut contract) => {
                contract.signees = sqlx::query_as::<_, Signee>(&format!(
                    "SELECT {} FROM signees WHERE contract_id = $1 ORDER BY created_utc, signee_id",
                    SIGNEE_COLUMNS
                ))
                .bind(contract_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to load signees"))?;
                contract.claim_ids = self
                    .claim_ids_for(GrantRef::Contract(contract_id))
                    .await?
                    .into_iter()
                    .collect();
                Some(contract)
            }
            None => None,
        };

        timer.observe_duration();

        Ok(contract)
    }

    async fn lock_contract(
        tx: &mut Transaction<'static, Postgres>,
        contract_id: Uuid,
    ) -> Result<Contract, AppError> {
        let mut contract = sqlx::query_as::<_, Contract>(&format!(
            "SELECT {} FROM contracts WHERE contract_id = $1 FOR UPDATE",
            CONTRACT_COLUMNS
        ))
        .bind(contract_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("Failed to lock contract"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Contract {} not found", contract_id)))?;

        contract.signees = sqlx::query_as::<_, Signee>(&format!(
            "SELECT {} FROM signees WHERE contract_id = $1 ORDER BY created_utc, signee_id FOR UPDATE",
            SIGNEE_COLUMNS
        ))
        .bind(contract_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error("Failed to lock signees"))?;

        Ok(contract)
    }

    /// Write the contract flag and every signee flag in the open transaction.
    async fn save_signing_state(
        tx: &mut Transaction<'static, Postgres>,
        contract: &Contract,
    ) -> Result<(), AppError> {
        for signee in &contract.signees {
            sqlx::query("UPDATE signees SET signed = $2 WHERE signee_id = $1")
                .bind(signee.signee_id)
                .bind(signee.signed)
                .execute(&mut **tx)
                .await
                .map_err(db_error("Failed to update signee"))?;
        }

        sqlx::query("UPDATE contracts SET signed = $2, updated_utc = NOW() WHERE contract_id = $1")
            .bind(contract.contract_id)
            .bind(contract.signed)
            .execute(&mut **tx)
            .await
            .map_err(db_error("Failed to update contract"))?;
        Ok(())
    }

    /// Record one signee's signature; returns the contract after the change.
    #[instrument(skip(self), fields(contract_id = %contract_id, signee_id = %signee_id))]
    pub async fn sign_contract(
        &self,
        contract_id: Uuid,
        signee_id: Uuid,
    ) -> Result<Contract, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sign_contract"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut contract = Self::lock_contract(&mut tx, contract_id).await?;
        let fully_signed = contract.sign_as(signee_id)?;
        Self::save_signing_state(&mut tx, &contract).await?;
        Self::commit(tx).await?;

        timer.observe_duration();
        record_grant_operation("contract", "sign");
        info!(contract_id = %contract_id, fully_signed, "Contract signed by signee");

        Ok(contract)
    }

    /// Administrative override of every signee's flag.
    #[instrument(skip(self), fields(contract_id = %contract_id))]
    pub async fn set_contract_signed(
        &self,
        contract_id: Uuid,
        signed: bool,
    ) -> Result<Contract, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_contract_signed"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut contract = Self::lock_contract(&mut tx, contract_id).await?;
        contract.set_signed(signed);
        Self::save_signing_state(&mut tx, &contract).await?;
        Self::commit(tx).await?;

        timer.observe_duration();
        record_grant_operation("contract", "set_signed");
        warn!(
            contract_id = %contract_id,
            signed,
            signees = contract.signees.len(),
            "Contract signing state overridden"
        );

        Ok(contract)
    }

    // =========================================================================
    // Claim and Proof Operations
    // =========================================================================

    #[instrument(skip(self, input), fields(property = %input.property))]
    pub async fn create_claim(&self, input: CreateClaim) -> Result<Claim, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_claim"])
            .start_timer();

        let claim = Claim::new(input);
        let claim = sqlx::query_as::<_, Claim>(&format!(
            r#"
            INSERT INTO claims (claim_id, person, property, data, token)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            CLAIM_COLUMNS
        ))
        .bind(claim.claim_id)
        .bind(&claim.person)
        .bind(&claim.property)
        .bind(Json(&claim.data))
        .bind(&claim.token)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create claim"))?;

        timer.observe_duration();
        record_grant_operation("claim", "create");

        Ok(claim)
    }

    /// Get a claim with its proof ids and grants.
    #[instrument(skip(self), fields(claim_id = %claim_id))]
    pub async fn get_claim(&self, claim_id: Uuid) -> Result<Option<Claim>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_claim"])
            .start_timer();

        let claim = sqlx::query_as::<_, Claim>(&format!(
            "SELECT {} FROM claims WHERE claim_id = $1",
            CLAIM_COLUMNS
        ))
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get claim"))?;

        let claim = match claim {
            Some(mut claim) => {
                claim.proof_ids = sqlx::query_scalar::<_, Uuid>(
                    "SELECT proof_id FROM proofs WHERE claim_id = $1",
                )
                .bind(claim_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to load proofs"))?
                .into_iter()
                .collect();

                let grants = sqlx::query_as::<_, (String, Uuid)>(
                    "SELECT grant_kind, grant_id FROM claim_grants WHERE claim_id = $1",
                )
                .bind(claim_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to load claim grants"))?;
                claim.grants = grants
                    .into_iter()
                    .filter_map(|(kind, id)| GrantRef::from_parts(&kind, id))
                    .collect();
                Some(claim)
            }
            None => None,
        };

        timer.observe_duration();

        Ok(claim)
    }

    async fn claim_ids_for(&self, grant: GrantRef) -> Result<Vec<Uuid>, AppError> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT claim_id FROM claim_grants WHERE grant_kind = $1 AND grant_id = $2",
        )
        .bind(grant.kind())
        .bind(grant.id())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load grant claims"))
    }

    async fn get_proof(&self, proof_id: Uuid) -> Result<Proof, AppError> {
        sqlx::query_as::<_, Proof>(&format!(
            "SELECT {} FROM proofs WHERE proof_id = $1",
            PROOF_COLUMNS
        ))
        .bind(proof_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get proof"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Proof {} not found", proof_id)))
    }

    async fn require_claim(&self, claim_id: Uuid) -> Result<Claim, AppError> {
        self.get_claim(claim_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Claim {} not found", claim_id)))
    }

    /// Store a proof and attach it to its claim.
    #[instrument(skip(self, input), fields(claim_id = %input.claim_id))]
    pub async fn create_proof(&self, input: CreateProof) -> Result<Proof, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_proof"])
            .start_timer();

        if !self.application_exists(input.application_id).await? {
            return Err(invalid_application());
        }
        let mut claim = self.require_claim(input.claim_id).await?;
        let mut proof = Proof::new(input);
        claim::add_proof(&mut claim, &mut proof);

        let proof = sqlx::query_as::<_, Proof>(&format!(
            r#"
            INSERT INTO proofs (proof_id, claim_id, application_id, proof_type, proof_purpose, verification_method, jws)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            PROOF_COLUMNS
        ))
        .bind(proof.proof_id)
        .bind(proof.claim_id)
        .bind(proof.application_id)
        .bind(&proof.proof_type)
        .bind(&proof.proof_purpose)
        .bind(&proof.verification_method)
        .bind(&proof.jws)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create proof"))?;

        timer.observe_duration();
        record_grant_operation("proof", "create");

        Ok(proof)
    }

    /// Point `proof_id` at `claim_id`. Returns false when it already was.
    #[instrument(skip(self), fields(claim_id = %claim_id, proof_id = %proof_id))]
    pub async fn add_proof(&self, claim_id: Uuid, proof_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_proof"])
            .start_timer();

        let mut claim = self.require_claim(claim_id).await?;
        let mut proof = self.get_proof(proof_id).await?;

        let changed = claim::add_proof(&mut claim, &mut proof);
        if changed {
            sqlx::query("UPDATE proofs SET claim_id = $2 WHERE proof_id = $1")
                .bind(proof.proof_id)
                .bind(proof.claim_id)
                .execute(&self.pool)
                .await
                .map_err(db_error("Failed to link proof"))?;
        }

        timer.observe_duration();

        Ok(changed)
    }

    /// Detach a proof, only while it still belongs to `claim_id`.
    #[instrument(skip(self), fields(claim_id = %claim_id, proof_id = %proof_id))]
    pub async fn remove_proof(&self, claim_id: Uuid, proof_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["remove_proof"])
            .start_timer();

        let mut claim = self.require_claim(claim_id).await?;
        let mut proof = self.get_proof(proof_id).await?;

        let changed = claim::remove_proof(&mut claim, &mut proof);
        // Guarded on the current owner so a concurrent reassignment is kept.
        let result = sqlx::query(
            "UPDATE proofs SET claim_id = NULL WHERE proof_id = $1 AND claim_id = $2",
        )
        .bind(proof_id)
        .bind(claim_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to unlink proof"))?;

        timer.observe_duration();

        Ok(changed && result.rows_affected() > 0)
    }

    async fn grant_exists(&self, grant: GrantRef) -> Result<bool, AppError> {
        let sql = match grant {
            GrantRef::Authorization(_) => {
                "SELECT EXISTS(SELECT 1 FROM authorizations WHERE authorization_id = $1)"
            }
            GrantRef::Contract(_) => {
                "SELECT EXISTS(SELECT 1 FROM contracts WHERE contract_id = $1)"
            }
        };
        sqlx::query_scalar::<_, bool>(sql)
            .bind(grant.id())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to look up grant"))
    }

    async fn require_grant(&self, grant: GrantRef) -> Result<(), AppError> {
        if self.grant_exists(grant).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(anyhow::anyhow!("{} not found", grant)))
        }
    }

    /// Share a claim with a grant. Returns false when it was already shared.
    #[instrument(skip(self), fields(grant = %grant, claim_id = %claim_id))]
    pub async fn add_claim(&self, grant: GrantRef, claim_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_claim"])
            .start_timer();

        self.require_grant(grant).await?;
        self.require_claim(claim_id).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO claim_grants (claim_id, grant_kind, grant_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(claim_id)
        .bind(grant.kind())
        .bind(grant.id())
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to link claim"))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(grant = %grant, claim_id = %claim_id))]
    pub async fn remove_claim(&self, grant: GrantRef, claim_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["remove_claim"])
            .start_timer();

        let result = sqlx::query(
            "DELETE FROM claim_grants WHERE claim_id = $1 AND grant_kind = $2 AND grant_id = $3",
        )
        .bind(claim_id)
        .bind(grant.kind())
        .bind(grant.id())
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to unlink claim"))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Purpose Limitation Operations
    // =========================================================================

    /// Attach a purpose limitation; a grant holds at most one.
    #[instrument(skip(self, input), fields(grant = %grant))]
    pub async fn attach_purpose_limitation(
        &self,
        grant: GrantRef,
        input: CreatePurposeLimitation,
    ) -> Result<PurposeLimitation, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["attach_purpose_limitation"])
            .start_timer();

        self.require_grant(grant).await?;

        let limitation = PurposeLimitation::new(grant, input);
        let limitation = sqlx::query_as::<_, PurposeLimitation>(
            r#"
            INSERT INTO purpose_limitations (purpose_limitation_id, grant_kind, grant_id, name, description, data, notice_period, expiry_period)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING purpose_limitation_id, grant_kind, grant_id, name, description, data, notice_period, expiry_period, created_utc, updated_utc
            "#,
        )
        .bind(limitation.purpose_limitation_id)
        .bind(&limitation.grant_kind)
        .bind(limitation.grant_id)
        .bind(&limitation.name)
        .bind(&limitation.description)
        .bind(Json(&limitation.data))
        .bind(&limitation.notice_period)
        .bind(&limitation.expiry_period)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to attach purpose limitation"))?;

        timer.observe_duration();

        Ok(limitation)
    }

    #[instrument(skip(self), fields(grant = %grant))]
    pub async fn get_purpose_limitation(
        &self,
        grant: GrantRef,
    ) -> Result<Option<PurposeLimitation>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_purpose_limitation"])
            .start_timer();

        let limitation = sqlx::query_as::<_, PurposeLimitation>(
            r#"
            SELECT purpose_limitation_id, grant_kind, grant_id, name, description, data, notice_period, expiry_period, created_utc, updated_utc
            FROM purpose_limitations
            WHERE grant_kind = $1 AND grant_id = $2
            "#,
        )
        .bind(grant.kind())
        .bind(grant.id())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get purpose limitation"))?;

        timer.observe_duration();

        Ok(limitation)
    }

    // =========================================================================
    // Group Operations
    // =========================================================================

    async fn load_group_tree(
        tx: &mut Transaction<'static, Postgres>,
        application_id: Uuid,
    ) -> Result<GroupTree, AppError> {
        let groups = sqlx::query_as::<_, Group>(
            r#"
            SELECT group_id, application_id, name, description, organization, parent_group_id, created_utc, updated_utc
            FROM groups
            WHERE application_id = $1
            FOR UPDATE
            "#,
        )
        .bind(application_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error("Failed to load groups"))?;

        Ok(GroupTree::from_groups(&groups))
    }

    #[instrument(skip(self, input), fields(application_id = %input.application_id))]
    pub async fn create_group(&self, input: CreateGroup) -> Result<Group, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_group"])
            .start_timer();

        if !self.application_exists(input.application_id).await? {
            return Err(invalid_application());
        }

        let group = Group::new(input);
        let mut tx = self.begin().await?;
        let mut tree = Self::load_group_tree(&mut tx, group.application_id).await?;
        tree.set_parent(group.group_id, group.parent_group_id)?;

        let group = sqlx::query_as::<_, Group>(
            r#"
            INSERT INTO groups (group_id, application_id, name, description, organization, parent_group_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING group_id, application_id, name, description, organization, parent_group_id, created_utc, updated_utc
            "#,
        )
        .bind(group.group_id)
        .bind(group.application_id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(&group.organization)
        .bind(group.parent_group_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to create group"))?;

        Self::commit(tx).await?;
        timer.observe_duration();

        Ok(group)
    }

    /// Move a group, refusing moves that would create a cycle.
    #[instrument(skip(self), fields(group_id = %group_id))]
    pub async fn set_group_parent(
        &self,
        group_id: Uuid,
        parent_group_id: Option<Uuid>,
    ) -> Result<Group, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_group_parent"])
            .start_timer();

        let application_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT application_id FROM groups WHERE group_id = $1",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get group"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Group {} not found", group_id)))?;

        let mut tx = self.begin().await?;
        let mut tree = Self::load_group_tree(&mut tx, application_id).await?;
        tree.set_parent(group_id, parent_group_id)?;

        let group = sqlx::query_as::<_, Group>(
            r#"
            UPDATE groups SET parent_group_id = $2, updated_utc = NOW()
            WHERE group_id = $1
            RETURNING group_id, application_id, name, description, organization, parent_group_id, created_utc, updated_utc
            "#,
        )
        .bind(group_id)
        .bind(parent_group_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to move group"))?;

        Self::commit(tx).await?;
        timer.observe_duration();

        Ok(group)
    }

    #[instrument(skip(self, input), fields(group_id = %group_id))]
    pub async fn add_membership(
        &self,
        group_id: Uuid,
        input: CreateMembership,
    ) -> Result<Membership, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_membership"])
            .start_timer();

        let membership = Membership::invite(group_id, input.user_url, Utc::now());
        let membership = sqlx::query_as::<_, Membership>(
            r#"
            INSERT INTO memberships (membership_id, group_id, user_url, date_invited)
            VALUES ($1, $2, $3, $4)
            RETURNING membership_id, group_id, user_url, date_invited, date_accepted_user, date_accepted_group, created_utc
            "#,
        )
        .bind(membership.membership_id)
        .bind(membership.group_id)
        .bind(&membership.user_url)
        .bind(membership.date_invited)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to add membership"))?;

        timer.observe_duration();

        Ok(membership)
    }

    #[instrument(skip(self), fields(membership_id = %membership_id))]
    pub async fn accept_membership(
        &self,
        membership_id: Uuid,
        party: AcceptingParty,
    ) -> Result<Membership, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["accept_membership"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut membership = sqlx::query_as::<_, Membership>(
            r#"
            SELECT membership_id, group_id, user_url, date_invited, date_accepted_user, date_accepted_group, created_utc
            FROM memberships WHERE membership_id = $1 FOR UPDATE
            "#,
        )
        .bind(membership_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to get membership"))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Membership {} not found", membership_id))
        })?;

        membership.accept(party, Utc::now());

        sqlx::query(
            "UPDATE memberships SET date_accepted_user = $2, date_accepted_group = $3 WHERE membership_id = $1",
        )
        .bind(membership_id)
        .bind(membership.date_accepted_user)
        .bind(membership.date_accepted_group)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to accept membership"))?;

        Self::commit(tx).await?;
        timer.observe_duration();
        info!(membership_id = %membership_id, active = membership.is_active(), "Membership accepted");

        Ok(membership)
    }

    // =========================================================================
    // Payment Run Queries
    // =========================================================================

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn get_payment_run(&self, run_id: Uuid) -> Result<Option<PaymentRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment_run"])
            .start_timer();

        let run = sqlx::query_as::<_, PaymentRun>(&format!(
            "SELECT {} FROM payment_runs WHERE run_id = $1",
            PAYMENT_RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get payment run"))?;

        timer.observe_duration();

        Ok(run)
    }
}

#[async_trait]
impl PointsLedger for Database {
    #[instrument(skip(self), fields(application_id = %application_id))]
    async fn application_exists(&self, application_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["application_exists"])
            .start_timer();

        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM applications WHERE application_id = $1)",
        )
        .bind(application_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to look up application"))?;

        timer.observe_duration();

        Ok(exists)
    }

    #[instrument(skip(self), fields(application_id = %application_id))]
    async fn points_by_application(&self, application_id: Uuid) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["points_by_application"])
            .start_timer();

        let points = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(points), 0)::BIGINT FROM authorizations WHERE application_id = $1",
        )
        .bind(application_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to sum points by application"))?;

        timer.observe_duration();

        Ok(points)
    }

    #[instrument(skip(self))]
    async fn points_by_organization(&self, organization: &str) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["points_by_organization"])
            .start_timer();

        let points = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(a.points), 0)::BIGINT
            FROM authorizations a
            JOIN applications app ON app.application_id = a.application_id
            WHERE app.organization = $1
            "#,
        )
        .bind(organization)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to sum points by organization"))?;

        timer.observe_duration();

        Ok(points)
    }

    #[instrument(skip(self, excluded_organizations), fields(excluded = excluded_organizations.len()))]
    async fn reset_points(&self, excluded_organizations: &[String]) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_points"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE authorizations a
            SET points = cardinality(a.scopes), updated_utc = NOW()
            FROM applications app
            WHERE app.application_id = a.application_id
              AND app.organization <> ALL($1)
            "#,
        )
        .bind(excluded_organizations)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to reset points"))?;

        timer.observe_duration();
        info!(rows = result.rows_affected(), "Authorization points reset");

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PaymentRunStore for Database {
    #[instrument(skip(self))]
    async fn begin_payment_run(
        &self,
        period_key: &str,
        stale_after: chrono::Duration,
    ) -> Result<PaymentRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["begin_payment_run"])
            .start_timer();

        let mut tx = self.begin().await?;

        let abandoned = sqlx::query(
            r#"
            UPDATE payment_runs
            SET status = 'failed', completed_utc = NOW(), error_message = 'Abandoned: run exceeded stale threshold'
            WHERE status = 'running' AND started_utc < $1
            "#,
        )
        .bind(Utc::now() - stale_after)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to expire stale payment runs"))?;

        if abandoned.rows_affected() > 0 {
            warn!(count = abandoned.rows_affected(), "Stale payment runs marked failed");
        }

        let result = sqlx::query_as::<_, PaymentRun>(&format!(
            r#"
            INSERT INTO payment_runs (run_id, period_key, status)
            VALUES ($1, $2, 'running')
            RETURNING {}
            "#,
            PAYMENT_RUN_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(period_key)
        .fetch_one(&mut *tx)
        .await;

        let run = match result {
            Ok(run) => run,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.ok();
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "A payment run is already in progress"
                )));
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to start payment run: {}",
                    e
                )));
            }
        };

        Self::commit(tx).await?;
        timer.observe_duration();
        info!(run_id = %run.run_id, period_key = %run.period_key, "Payment run started");

        Ok(run)
    }

    #[instrument(skip(self))]
    async fn find_billing(
        &self,
        period_key: &str,
        organization: &str,
    ) -> Result<Option<OrganizationBilling>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_billing"])
            .start_timer();

        let billing = sqlx::query_as::<_, OrganizationBilling>(
            r#"
            SELECT period_key, organization, run_id, points, debit_amount, invoice_amount, currency, invoice_id, created_utc
            FROM organization_billings
            WHERE period_key = $1 AND organization = $2
            "#,
        )
        .bind(period_key)
        .bind(organization)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to look up billing"))?;

        timer.observe_duration();

        Ok(billing)
    }

    #[instrument(skip(self, billing), fields(period_key = %billing.period_key, organization = %billing.organization))]
    async fn record_billing(&self, billing: &OrganizationBilling) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_billing"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO organization_billings (period_key, organization, run_id, points, debit_amount, invoice_amount, currency, invoice_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&billing.period_key)
        .bind(&billing.organization)
        .bind(billing.run_id)
        .bind(billing.points)
        .bind(billing.debit_amount)
        .bind(billing.invoice_amount)
        .bind(&billing.currency)
        .bind(&billing.invoice_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record billing"))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self, outcome), fields(run_id = %run_id, organization = %outcome.organization))]
    async fn record_run_result(
        &self,
        run_id: Uuid,
        outcome: &OrganizationOutcome,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_run_result"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO payment_run_results (result_id, run_id, organization, status, points, invoice_id, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(&outcome.organization)
        .bind(outcome.status.as_str())
        .bind(outcome.points)
        .bind(&outcome.invoice_id)
        .bind(&outcome.error)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record payment run result"))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn complete_payment_run(
        &self,
        run_id: Uuid,
        status: PaymentRunStatus,
        processed: i32,
        succeeded: i32,
        failed: i32,
        points_reset: u64,
        error_message: Option<String>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_payment_run"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE payment_runs
            SET status = $2, completed_utc = NOW(), organizations_processed = $3, organizations_succeeded = $4, organizations_failed = $5, points_reset = $6, error_message = $7
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(processed)
        .bind(succeeded)
        .bind(failed)
        .bind(i64::try_from(points_reset).unwrap_or(i64::MAX))
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to complete payment run"))?;

        timer.observe_duration();

        Ok(())
    }
}

#[async_trait]
impl VaultStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}
