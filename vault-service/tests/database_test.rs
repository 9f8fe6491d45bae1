//! PostgreSQL-backed tests. Run with `TEST_DATABASE_URL` set and `--ignored`.

mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use reqwest::Client;
use service_core::error::AppError;
use uuid::Uuid;
use vault_service::models::{
    AcceptingParty, CreateApplication, CreateAuthorization, CreateClaim, CreateContract,
    CreateDossier, CreateGroup, CreateMembership, CreateProof, CreatePurposeLimitation,
    CreateScopeRequest, CreateSignee, GrantRef, PaymentRunStatus, SigningState, UpdateScopes,
};
use vault_service::services::{PaymentRunStore, PointsLedger};

const ORG: &str = "https://directory.test/organizations/acme";

fn application_input(organization: &str) -> CreateApplication {
    CreateApplication {
        name: "Acme portal".to_string(),
        description: None,
        organization: organization.to_string(),
        contact: "https://contacts.test/acme".to_string(),
        authorization_url: None,
        single_sign_on_url: None,
        webhook_url: None,
        notification_endpoint: None,
        gdpr_contact: None,
        technical_contact: None,
        privacy_contact: None,
        billing_contact: None,
        scopes: vec!["email".to_string(), "name".to_string()],
    }
}

fn authorization_input(application_id: Uuid, scopes: &[&str]) -> CreateAuthorization {
    CreateAuthorization {
        application_id,
        user_url: Some("https://users.test/jane".to_string()),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        goal: "Account registration".to_string(),
        starting_date: None,
    }
}

fn signee(name: &str) -> CreateSignee {
    CreateSignee {
        name: name.to_string(),
        email: None,
        phone: None,
    }
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn application_secrets_are_generated_once() {
    let app = TestApp::spawn().await;

    let application = app.db.create_application(application_input(ORG)).await.unwrap();

    let secret = application.secret.clone().unwrap();
    let test_secret = application.test_secret.clone().unwrap();
    assert!(test_secret.starts_with("test_"));
    assert_ne!(secret, test_secret);

    let loaded = app
        .db
        .get_application(application.application_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.secret.as_deref(), Some(secret.as_str()));
    assert_eq!(
        app.db.list_applications_by_organization(ORG).await.unwrap().len(),
        1
    );

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn authorization_points_follow_scopes_and_never_drop() {
    let app = TestApp::spawn().await;
    let application = app.db.create_application(application_input(ORG)).await.unwrap();

    let auth = app
        .db
        .create_authorization(authorization_input(
            application.application_id,
            &["email", "name", "email"],
        ))
        .await
        .unwrap();
    assert_eq!(auth.scopes, vec!["email", "name"]);
    assert_eq!(auth.points, 2);
    assert!(auth.code.is_some());

    let widened = app
        .db
        .update_authorization_scopes(
            auth.authorization_id,
            &UpdateScopes {
                add: vec!["phone".to_string(), "address".to_string()],
                remove: vec![],
            },
        )
        .await
        .unwrap();
    assert_eq!(widened.points, 4);

    let narrowed = app
        .db
        .update_authorization_scopes(
            auth.authorization_id,
            &UpdateScopes {
                add: vec![],
                remove: vec!["phone".to_string(), "address".to_string(), "name".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(narrowed.scopes, vec!["email"]);
    assert_eq!(narrowed.points, 4);

    assert_eq!(
        app.db
            .points_by_application(application.application_id)
            .await
            .unwrap(),
        4
    );
    assert_eq!(app.db.points_by_organization(ORG).await.unwrap(), 4);

    // Reset brings points back to the scope count.
    assert_eq!(app.db.reset_points(&[]).await.unwrap(), 1);
    assert_eq!(
        app.db
            .points_by_application(application.application_id)
            .await
            .unwrap(),
        1
    );

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn authorization_for_unknown_application_is_rejected() {
    let app = TestApp::spawn().await;

    let err = app
        .db
        .create_authorization(authorization_input(Uuid::new_v4(), &["email"]))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)));
    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn legal_dossier_blocks_cancellation() {
    let app = TestApp::spawn().await;
    let application = app.db.create_application(application_input(ORG)).await.unwrap();
    let auth = app
        .db
        .create_authorization(authorization_input(application.application_id, &["email"]))
        .await
        .unwrap();

    app.db
        .create_dossier(CreateDossier {
            authorization_id: Some(auth.authorization_id),
            name: "Tax records".to_string(),
            description: None,
            goal: None,
            expiry_date: Some(Utc::now() - Duration::days(1)),
            sso: None,
            legal: true,
            scopes: vec!["email".to_string()],
        })
        .await
        .unwrap();

    let err = app
        .db
        .delete_authorization(auth.authorization_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(app
        .db
        .get_authorization(auth.authorization_id)
        .await
        .unwrap()
        .is_some());

    let err = app
        .db
        .delete_application(application.application_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(app
        .db
        .get_authorization(auth.authorization_id)
        .await
        .unwrap()
        .is_some());

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn authorizing_a_scope_request_merges_scopes() {
    let app = TestApp::spawn().await;
    let application = app.db.create_application(application_input(ORG)).await.unwrap();
    let auth = app
        .db
        .create_authorization(authorization_input(application.application_id, &["email"]))
        .await
        .unwrap();

    let request = app
        .db
        .create_scope_request(CreateScopeRequest {
            authorization_id: auth.authorization_id,
            scopes: vec!["email".to_string(), "phone".to_string()],
        })
        .await
        .unwrap();
    assert_eq!(request.authorized, None);

    let updated = app
        .db
        .authorize_scope_request(request.scope_request_id)
        .await
        .unwrap();
    assert_eq!(updated.scopes, vec!["email", "phone"]);
    assert_eq!(updated.points, 2);

    let other = app
        .db
        .create_scope_request(CreateScopeRequest {
            authorization_id: auth.authorization_id,
            scopes: vec!["address".to_string()],
        })
        .await
        .unwrap();
    let denied = app.db.deny_scope_request(other.scope_request_id).await.unwrap();
    assert_eq!(denied.authorized, Some(false));

    let err = app
        .db
        .deny_scope_request(request.scope_request_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = app
        .db
        .authorize_scope_request(other.scope_request_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let current = app.db.get_authorization(auth.authorization_id).await.unwrap().unwrap();
    assert_eq!(current.scopes, vec!["email", "phone"]);

    app.db
        .log_authorization_event(auth.authorization_id, "200", Some("/scopes".to_string()))
        .await
        .unwrap();
    assert_eq!(
        app.db
            .list_authorization_logs(auth.authorization_id)
            .await
            .unwrap()
            .len(),
        1
    );

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn contract_is_signed_once_every_signee_signed() {
    let app = TestApp::spawn().await;

    let contract = app
        .db
        .create_contract(CreateContract {
            person: None,
            application_id: None,
            scopes: vec!["email".to_string()],
            goal: "Employment".to_string(),
            signees: vec![signee("Jane"), signee("John")],
        })
        .await
        .unwrap();
    assert_eq!(contract.signing_state(), SigningState::Unsigned);
    assert!(!contract.signed);

    let first = contract.signees[0].signee_id;
    let second = contract.signees[1].signee_id;

    let partial = app.db.sign_contract(contract.contract_id, first).await.unwrap();
    assert_eq!(partial.signing_state(), SigningState::PartiallySigned);
    assert!(!partial.signed);

    let full = app.db.sign_contract(contract.contract_id, second).await.unwrap();
    assert_eq!(full.signing_state(), SigningState::Signed);
    assert!(full.signed);

    let revoked = app
        .db
        .set_contract_signed(contract.contract_id, false)
        .await
        .unwrap();
    assert!(!revoked.signed);
    assert!(revoked.signees.iter().all(|s| !s.signed));

    let err = app
        .db
        .sign_contract(contract.contract_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn claims_link_to_proofs_and_grants_on_both_sides() {
    let app = TestApp::spawn().await;
    let application = app.db.create_application(application_input(ORG)).await.unwrap();
    let auth = app
        .db
        .create_authorization(authorization_input(application.application_id, &["email"]))
        .await
        .unwrap();
    let claim = app
        .db
        .create_claim(CreateClaim {
            person: "https://users.test/jane".to_string(),
            property: "email".to_string(),
            data: serde_json::json!({ "email": "jane@example.com" }),
            token: None,
        })
        .await
        .unwrap();
    let proof = app
        .db
        .create_proof(CreateProof {
            claim_id: claim.claim_id,
            application_id: application.application_id,
            proof_type: "RsaSignature2018".to_string(),
            proof_purpose: "assertionMethod".to_string(),
            verification_method: "https://keys.test/1".to_string(),
            jws: "eyJhbGciOiJSUzI1NiJ9..sig".to_string(),
        })
        .await
        .unwrap();

    // Creating the proof for the claim already links it.
    assert!(!app.db.add_proof(claim.claim_id, proof.proof_id).await.unwrap());
    let grant = GrantRef::Authorization(auth.authorization_id);
    assert!(app.db.add_claim(grant, claim.claim_id).await.unwrap());
    assert!(!app.db.add_claim(grant, claim.claim_id).await.unwrap());

    let loaded = app.db.get_claim(claim.claim_id).await.unwrap().unwrap();
    assert!(loaded.proof_ids.contains(&proof.proof_id));
    assert!(loaded.grants.contains(&grant));
    let auth = app
        .db
        .get_authorization(auth.authorization_id)
        .await
        .unwrap()
        .unwrap();
    assert!(auth.claim_ids.contains(&claim.claim_id));

    assert!(app.db.remove_proof(claim.claim_id, proof.proof_id).await.unwrap());
    assert!(app.db.remove_claim(grant, claim.claim_id).await.unwrap());
    let loaded = app.db.get_claim(claim.claim_id).await.unwrap().unwrap();
    assert!(loaded.proof_ids.is_empty());
    assert!(loaded.grants.is_empty());

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn one_purpose_limitation_per_grant() {
    let app = TestApp::spawn().await;
    let application = app.db.create_application(application_input(ORG)).await.unwrap();
    let auth = app
        .db
        .create_authorization(authorization_input(application.application_id, &["email"]))
        .await
        .unwrap();
    let grant = GrantRef::Authorization(auth.authorization_id);
    let input = || CreatePurposeLimitation {
        name: "Retention".to_string(),
        description: None,
        data: serde_json::Value::Null,
        notice_period: Some("P1M".to_string()),
        expiry_period: Some("P1Y".to_string()),
    };

    let limitation = app.db.attach_purpose_limitation(grant, input()).await.unwrap();
    assert_eq!(limitation.grant(), Some(grant));

    let err = app
        .db
        .attach_purpose_limitation(grant, input())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn group_hierarchy_rejects_cycles_and_memberships_need_both_parties() {
    let app = TestApp::spawn().await;
    let application = app.db.create_application(application_input(ORG)).await.unwrap();
    let group = |name: &str, parent: Option<Uuid>| CreateGroup {
        application_id: application.application_id,
        name: name.to_string(),
        description: None,
        organization: None,
        parent_group_id: parent,
    };

    let root = app.db.create_group(group("root", None)).await.unwrap();
    let child = app
        .db
        .create_group(group("child", Some(root.group_id)))
        .await
        .unwrap();

    let err = app
        .db
        .set_group_parent(root.group_id, Some(child.group_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let membership = app
        .db
        .add_membership(
            child.group_id,
            CreateMembership {
                user_url: "https://users.test/jane".to_string(),
            },
        )
        .await
        .unwrap();
    let membership = app
        .db
        .accept_membership(membership.membership_id, AcceptingParty::User)
        .await
        .unwrap();
    assert!(!membership.is_active());
    let membership = app
        .db
        .accept_membership(membership.membership_id, AcceptingParty::Group)
        .await
        .unwrap();
    assert!(membership.is_active());

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn only_one_payment_run_at_a_time() {
    let app = TestApp::spawn().await;

    let run = app
        .db
        .begin_payment_run("2026-10", Duration::minutes(120))
        .await
        .unwrap();
    let err = app
        .db
        .begin_payment_run("2026-10", Duration::minutes(120))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    app.db
        .complete_payment_run(run.run_id, PaymentRunStatus::Completed, 0, 0, 0, 0, None)
        .await
        .unwrap();
    let stored = app.db.get_payment_run(run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), PaymentRunStatus::Completed);

    app.db
        .begin_payment_run("2026-11", Duration::minutes(120))
        .await
        .unwrap();

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (TEST_DATABASE_URL)"]
async fn http_points_endpoint_over_postgres() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let created: serde_json::Value = client
        .post(format!("{}/applications", app.http_address))
        .json(&serde_json::json!({
            "name": "Acme portal",
            "organization": ORG,
            "contact": "https://contacts.test/acme"
        }))
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Failed to parse JSON");
    assert!(created["test_secret"].as_str().unwrap().starts_with("test_"));
    let application_id = created["application_id"].as_str().unwrap().to_string();

    let response = client
        .post(format!("{}/authorizations", app.http_address))
        .json(&serde_json::json!({
            "application_id": application_id,
            "scopes": ["email", "name", "phone"],
            "goal": "Registration"
        }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let points: serde_json::Value = client
        .get(format!(
            "{}/applications/{}/points",
            app.http_address, application_id
        ))
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(points["points"], 3);

    let response = client
        .get(format!(
            "{}/applications/{}/points",
            app.http_address,
            Uuid::new_v4()
        ))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    app.cleanup().await;
}
