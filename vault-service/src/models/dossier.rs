use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// An external data set (legal basis, case file) that holds on to an
/// authorization and keeps it from being cancelled.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dossier {
    pub dossier_id: Uuid,
    pub authorization_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub goal: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub sso: Option<String>,
    pub legal: bool,
    pub scopes: Vec<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Dossier {
    pub fn new(input: CreateDossier) -> Self {
        let now = Utc::now();
        Self {
            dossier_id: Uuid::new_v4(),
            authorization_id: input.authorization_id,
            name: input.name,
            description: input.description,
            goal: input.goal,
            expiry_date: input.expiry_date,
            sso: input.sso,
            legal: input.legal,
            scopes: input.scopes,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Legal dossiers always block. Others block until they expire; a dossier
    /// without an expiry date never does.
    pub fn blocks_cancellation(&self, now: DateTime<Utc>) -> bool {
        self.legal || self.expiry_date.map_or(true, |expiry| expiry > now)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateDossier {
    pub authorization_id: Option<Uuid>,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 2550))]
    pub description: Option<String>,
    #[validate(length(max = 2550))]
    pub goal: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    #[validate(url)]
    pub sso: Option<String>,
    #[serde(default)]
    pub legal: bool,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn dossier(legal: bool, expiry_date: Option<DateTime<Utc>>) -> Dossier {
        Dossier::new(CreateDossier {
            authorization_id: None,
            name: "Mortgage application".to_string(),
            description: None,
            goal: None,
            expiry_date,
            sso: None,
            legal,
            scopes: vec!["income".to_string()],
        })
    }

    #[test]
    fn blocking_rules() {
        let now = Utc::now();
        assert!(dossier(false, Some(now + Duration::days(30))).blocks_cancellation(now));
        assert!(!dossier(false, Some(now - Duration::days(30))).blocks_cancellation(now));
        assert!(dossier(true, Some(now - Duration::days(30))).blocks_cancellation(now));
        assert!(dossier(false, None).blocks_cancellation(now));
    }
}
