use super::authorization::Authorization;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// A pending ask for more scopes on an existing authorization.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScopeRequest {
    pub scope_request_id: Uuid,
    pub authorization_id: Uuid,
    pub scopes: Vec<String>,
    /// `None` while undecided.
    pub authorized: Option<bool>,
    pub date_authorized: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl ScopeRequest {
    pub fn new(input: CreateScopeRequest) -> Self {
        Self {
            scope_request_id: Uuid::new_v4(),
            authorization_id: input.authorization_id,
            scopes: input.scopes,
            authorized: None,
            date_authorized: None,
            created_utc: Utc::now(),
        }
    }

    /// A request is decided once; granted scopes are not taken back by a later denial.
    fn ensure_undecided(&self) -> Result<(), AppError> {
        match self.authorized {
            None => Ok(()),
            Some(granted) => Err(AppError::Conflict(anyhow::anyhow!(
                "Scope request {} was already {}",
                self.scope_request_id,
                if granted { "authorized" } else { "denied" }
            ))),
        }
    }

    /// Grant the requested scopes on `authorization`.
    pub fn authorize(&mut self, authorization: &mut Authorization, now: DateTime<Utc>) -> Result<usize, AppError> {
        self.ensure_undecided()?;
        if authorization.authorization_id != self.authorization_id {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Scope request {} does not belong to authorization {}",
                self.scope_request_id,
                authorization.authorization_id
            )));
        }
        let added = authorization.add_scopes(&self.scopes);
        authorization.updated_utc = now;
        self.authorized = Some(true);
        self.date_authorized = Some(now);
        Ok(added)
    }

    pub fn deny(&mut self) -> Result<(), AppError> {
        self.ensure_undecided()?;
        self.authorized = Some(false);
        self.date_authorized = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateScopeRequest {
    pub authorization_id: Uuid,
    #[validate(length(min = 1))]
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::authorization::CreateAuthorization;

    fn authorization() -> Authorization {
        let mut auth = Authorization::new(CreateAuthorization {
            application_id: Uuid::new_v4(),
            user_url: None,
            scopes: vec!["email".to_string()],
            goal: "Newsletter".to_string(),
            starting_date: None,
        });
        auth.prepare_for_persist(&mut rand::thread_rng());
        auth
    }

    #[test]
    fn authorize_merges_scopes_and_raises_points() {
        let mut auth = authorization();
        let mut request = ScopeRequest::new(CreateScopeRequest {
            authorization_id: auth.authorization_id,
            scopes: vec!["email".to_string(), "phone".to_string()],
        });

        let now = Utc::now();
        assert_eq!(request.authorize(&mut auth, now).unwrap(), 1);
        assert_eq!(auth.scopes, vec!["email".to_string(), "phone".to_string()]);
        assert_eq!(auth.points, 2);
        assert_eq!(request.authorized, Some(true));
        assert_eq!(request.date_authorized, Some(now));
    }

    #[test]
    fn wrong_authorization_is_rejected() {
        let mut auth = authorization();
        let mut request = ScopeRequest::new(CreateScopeRequest {
            authorization_id: Uuid::new_v4(),
            scopes: vec!["phone".to_string()],
        });

        assert!(request.authorize(&mut auth, Utc::now()).is_err());
        assert_eq!(auth.scopes.len(), 1);
        assert_eq!(request.authorized, None);
    }

    #[test]
    fn deny_leaves_authorization_untouched() {
        let mut request = ScopeRequest::new(CreateScopeRequest {
            authorization_id: Uuid::new_v4(),
            scopes: vec!["phone".to_string()],
        });
        request.deny().unwrap();
        assert_eq!(request.authorized, Some(false));
    }

    #[test]
    fn decisions_are_final() {
        let mut auth = authorization();
        let mut granted = ScopeRequest::new(CreateScopeRequest {
            authorization_id: auth.authorization_id,
            scopes: vec!["phone".to_string()],
        });
        granted.authorize(&mut auth, Utc::now()).unwrap();

        assert!(matches!(granted.deny(), Err(AppError::Conflict(_))));
        assert_eq!(granted.authorized, Some(true));
        assert!(matches!(
            granted.authorize(&mut auth, Utc::now()),
            Err(AppError::Conflict(_))
        ));

        let mut denied = ScopeRequest::new(CreateScopeRequest {
            authorization_id: auth.authorization_id,
            scopes: vec!["address".to_string()],
        });
        denied.deny().unwrap();
        assert!(matches!(
            denied.authorize(&mut auth, Utc::now()),
            Err(AppError::Conflict(_))
        ));
        assert_eq!(auth.scopes, vec!["email".to_string(), "phone".to_string()]);
        assert_eq!(denied.authorized, Some(false));
    }
}
