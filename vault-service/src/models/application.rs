//! Application model.

use super::token::{generate_token, TOKEN_LEN};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

const TEST_SECRET_PREFIX: &str = "test_";

/// A relying party that requests scopes of a person's claims.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Application {
    pub application_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Owning organization (directory URL).
    pub organization: String,
    pub contact: String,
    pub authorization_url: Option<String>,
    pub single_sign_on_url: Option<String>,
    pub webhook_url: Option<String>,
    pub notification_endpoint: Option<String>,
    pub gdpr_contact: Option<String>,
    pub technical_contact: Option<String>,
    pub privacy_contact: Option<String>,
    pub billing_contact: Option<String>,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    #[serde(skip_serializing)]
    pub test_secret: Option<String>,
    pub scopes: Vec<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Application {
    pub fn new(input: CreateApplication) -> Self {
        let now = Utc::now();
        Self {
            application_id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            organization: input.organization,
            contact: input.contact,
            authorization_url: input.authorization_url,
            single_sign_on_url: input.single_sign_on_url,
            webhook_url: input.webhook_url,
            notification_endpoint: input.notification_endpoint,
            gdpr_contact: input.gdpr_contact,
            technical_contact: input.technical_contact,
            privacy_contact: input.privacy_contact,
            billing_contact: input.billing_contact,
            secret: None,
            test_secret: None,
            scopes: input.scopes,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Generate whichever secret is missing. Present secrets are left untouched.
    ///
    /// Returns true when anything was generated.
    pub fn ensure_secrets<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        let mut generated = false;

        if self.secret.as_deref().map_or(true, str::is_empty) {
            self.secret = Some(generate_token(rng, TOKEN_LEN));
            generated = true;
        }

        if self.test_secret.as_deref().map_or(true, str::is_empty) {
            self.test_secret = Some(format!(
                "{}{}",
                TEST_SECRET_PREFIX,
                generate_token(rng, TOKEN_LEN)
            ));
            generated = true;
        }

        generated
    }
}

/// Input for registering an application.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateApplication {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 255))]
    pub description: Option<String>,
    #[validate(url, length(max = 255))]
    pub organization: String,
    #[validate(url, length(max = 255))]
    pub contact: String,
    #[validate(url)]
    pub authorization_url: Option<String>,
    #[validate(url)]
    pub single_sign_on_url: Option<String>,
    #[validate(url)]
    pub webhook_url: Option<String>,
    #[validate(url)]
    pub notification_endpoint: Option<String>,
    #[validate(url)]
    pub gdpr_contact: Option<String>,
    #[validate(url)]
    pub technical_contact: Option<String>,
    #[validate(url)]
    pub privacy_contact: Option<String>,
    #[validate(url)]
    pub billing_contact: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_input() -> CreateApplication {
        CreateApplication {
            name: "Stage platform".to_string(),
            description: None,
            organization: "https://wrc.example.org/organizations/acme".to_string(),
            contact: "https://cc.example.org/people/jane".to_string(),
            authorization_url: Some("https://stage.example.org/auth".to_string()),
            single_sign_on_url: None,
            webhook_url: None,
            notification_endpoint: None,
            gdpr_contact: None,
            technical_contact: None,
            privacy_contact: None,
            billing_contact: None,
            scopes: vec!["schema.person.email".to_string()],
        }
    }

    #[test]
    fn secrets_are_present_after_creation() {
        let mut app = Application::new(sample_input());
        assert!(app.ensure_secrets(&mut rand::thread_rng()));

        let secret = app.secret.as_deref().unwrap();
        let test_secret = app.test_secret.as_deref().unwrap();
        assert_eq!(secret.len(), TOKEN_LEN);
        assert!(test_secret.starts_with("test_"));
        assert_ne!(secret, &test_secret[TEST_SECRET_PREFIX.len()..]);
    }

    #[test]
    fn existing_secrets_are_never_regenerated() {
        let mut app = Application::new(sample_input());
        app.ensure_secrets(&mut StdRng::seed_from_u64(1));
        let before = (app.secret.clone(), app.test_secret.clone());

        assert!(!app.ensure_secrets(&mut StdRng::seed_from_u64(2)));
        assert_eq!((app.secret, app.test_secret), before);
    }

    #[test]
    fn empty_secret_counts_as_missing() {
        let mut app = Application::new(sample_input());
        app.secret = Some(String::new());
        app.test_secret = Some("test_keep".to_string());

        assert!(app.ensure_secrets(&mut rand::thread_rng()));
        assert_eq!(app.secret.as_ref().map(String::len), Some(TOKEN_LEN));
        assert_eq!(app.test_secret.as_deref(), Some("test_keep"));
    }

    #[test]
    fn two_applications_get_distinct_secrets() {
        let mut a = Application::new(sample_input());
        let mut b = Application::new(sample_input());
        a.ensure_secrets(&mut rand::thread_rng());
        b.ensure_secrets(&mut rand::thread_rng());
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn organization_must_be_a_url() {
        let mut input = sample_input();
        input.organization = "acme".to_string();
        assert!(input.validate().is_err());
        assert!(sample_input().validate().is_ok());
    }
}
