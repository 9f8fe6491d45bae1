//! Authorization model: scope list, points derivation and the cancellation guard.

use super::claim::{Grant, GrantRef};
use super::dossier::Dossier;
use super::token::{generate_token, TOKEN_LEN};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use std::collections::BTreeSet;
use uuid::Uuid;
use validator::Validate;

/// Points owed for a grant: never below the number of granted scopes, never
/// lowered by this function.
pub fn compute_points(current: i32, scopes: &[String]) -> i32 {
    let scope_count = i32::try_from(scopes.len()).unwrap_or(i32::MAX);
    current.max(scope_count)
}

/// Append `extra` to `scopes`, skipping duplicates. Returns how many were added.
pub fn merge_scopes(scopes: &mut Vec<String>, extra: &[String]) -> usize {
    let before = scopes.len();
    for scope in extra {
        if !scopes.contains(scope) {
            scopes.push(scope.clone());
        }
    }
    scopes.len() - before
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Authorization {
    pub authorization_id: Uuid,
    pub application_id: Uuid,
    /// The person granting access.
    pub user_url: Option<String>,
    pub new_user: bool,
    pub scopes: Vec<String>,
    pub code: Option<String>,
    pub goal: String,
    pub points: i32,
    pub starting_date: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    #[serde(default)]
    pub claim_ids: BTreeSet<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Authorization {
    pub fn new(input: CreateAuthorization) -> Self {
        let now = Utc::now();
        let mut scopes = Vec::with_capacity(input.scopes.len());
        merge_scopes(&mut scopes, &input.scopes);

        Self {
            authorization_id: Uuid::new_v4(),
            application_id: input.application_id,
            user_url: input.user_url,
            new_user: false,
            scopes,
            code: None,
            goal: input.goal,
            points: 0,
            starting_date: input.starting_date,
            claim_ids: BTreeSet::new(),
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Must run before every insert or update.
    pub fn prepare_for_persist<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.code.as_deref().map_or(true, str::is_empty) {
            self.code = Some(generate_token(rng, TOKEN_LEN));
        }
        self.points = compute_points(self.points, &self.scopes);
        self.updated_utc = Utc::now();
    }

    pub fn add_scopes(&mut self, extra: &[String]) -> usize {
        let added = merge_scopes(&mut self.scopes, extra);
        self.points = compute_points(self.points, &self.scopes);
        added
    }

    /// Removing scopes leaves the points counter as it is.
    pub fn remove_scopes(&mut self, scopes: &[String]) -> usize {
        let before = self.scopes.len();
        self.scopes.retain(|s| !scopes.contains(s));
        before - self.scopes.len()
    }

    /// Billing reset: points go back to the scope count.
    pub fn reset_points(&mut self) {
        self.points = compute_points(0, &self.scopes);
    }

    pub fn ensure_cancellable(&self, dossiers: &[Dossier], now: DateTime<Utc>) -> Result<(), AppError> {
        match dossiers
            .iter()
            .filter(|d| d.authorization_id == Some(self.authorization_id))
            .find(|d| d.blocks_cancellation(now))
        {
            Some(dossier) => Err(AppError::Conflict(anyhow::anyhow!(
                "Authorization {} is held by dossier '{}'",
                self.authorization_id,
                dossier.name
            ))),
            None => Ok(()),
        }
    }
}

impl Grant for Authorization {
    fn grant_ref(&self) -> GrantRef {
        GrantRef::Authorization(self.authorization_id)
    }

    fn claim_ids(&self) -> &BTreeSet<Uuid> {
        &self.claim_ids
    }

    fn claim_ids_mut(&mut self) -> &mut BTreeSet<Uuid> {
        &mut self.claim_ids
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAuthorization {
    pub application_id: Uuid,
    #[validate(url)]
    pub user_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[validate(length(min = 1, max = 2550))]
    pub goal: String,
    pub starting_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateScopes {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Audit entry for calls made against an authorization.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthorizationLog {
    pub log_id: Uuid,
    pub authorization_id: Uuid,
    pub status: String,
    pub endpoint: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl AuthorizationLog {
    pub fn new(authorization_id: Uuid, status: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            log_id: Uuid::new_v4(),
            authorization_id,
            status: status.into(),
            endpoint,
            created_utc: Utc::now(),
        }
    }
}
