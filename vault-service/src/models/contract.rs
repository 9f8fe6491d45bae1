//! Signee-based contracts.
//!
//! Signing state is derived: a contract is signed once every signee has
//! signed. The stored flag only ever memoizes a fully signed contract, or
//! records an administrative override through [`Contract::set_signed`].

use super::claim::{Grant, GrantRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use std::collections::BTreeSet;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contract {
    pub contract_id: Uuid,
    pub person: Option<String>,
    pub application_id: Option<Uuid>,
    pub scopes: Vec<String>,
    pub goal: String,
    pub signed: bool,
    #[sqlx(skip)]
    #[serde(default)]
    pub signees: Vec<Signee>,
    #[sqlx(skip)]
    #[serde(default)]
    pub claim_ids: BTreeSet<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningState {
    Unsigned,
    PartiallySigned,
    Signed,
}

impl Contract {
    pub fn new(input: CreateContract) -> Self {
        let now = Utc::now();
        let contract_id = Uuid::new_v4();
        let signees = input
            .signees
            .into_iter()
            .map(|s| Signee::new(contract_id, s))
            .collect();

        Self {
            contract_id,
            person: input.person,
            application_id: input.application_id,
            scopes: input.scopes,
            goal: input.goal,
            signed: false,
            signees,
            claim_ids: BTreeSet::new(),
            created_utc: now,
            updated_utc: now,
        }
    }

    /// True iff every signee signed. No signees counts as signed.
    pub fn is_signed(&self) -> bool {
        self.signees.iter().all(|s| s.signed)
    }

    /// Read the signing state, memoizing a full signature on the contract.
    ///
    /// An incomplete set of signatures returns false and leaves the stored
    /// flag alone.
    pub fn refresh_signed(&mut self) -> bool {
        if !self.is_signed() {
            return false;
        }
        self.signed = true;
        true
    }

    pub fn signing_state(&self) -> SigningState {
        let signed = self.signees.iter().filter(|s| s.signed).count();
        if signed == self.signees.len() {
            SigningState::Signed
        } else if signed == 0 {
            SigningState::Unsigned
        } else {
            SigningState::PartiallySigned
        }
    }

    /// Administrative override: forces every signee to `signed`.
    pub fn set_signed(&mut self, signed: bool) {
        for signee in &mut self.signees {
            signee.signed = signed;
        }
        self.signed = signed;
        self.updated_utc = Utc::now();
    }

    /// Record one signee's signature. Returns whether the contract is now signed.
    pub fn sign_as(&mut self, signee_id: Uuid) -> Result<bool, AppError> {
        let signee = self
            .signees
            .iter_mut()
            .find(|s| s.signee_id == signee_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Signee {} is not part of contract {}",
                    signee_id,
                    self.contract_id
                ))
            })?;
        signee.signed = true;
        self.updated_utc = Utc::now();
        Ok(self.refresh_signed())
    }

    pub fn add_signee(&mut self, input: CreateSignee) -> &Signee {
        self.signees.push(Signee::new(self.contract_id, input));
        self.signed = false;
        &self.signees[self.signees.len() - 1]
    }
}

impl Grant for Contract {
    fn grant_ref(&self) -> GrantRef {
        GrantRef::Contract(self.contract_id)
    }

    fn claim_ids(&self) -> &BTreeSet<Uuid> {
        &self.claim_ids
    }

    fn claim_ids_mut(&mut self) -> &mut BTreeSet<Uuid> {
        &mut self.claim_ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Signee {
    pub signee_id: Uuid,
    pub contract_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub signed: bool,
    pub created_utc: DateTime<Utc>,
}

impl Signee {
    fn new(contract_id: Uuid, input: CreateSignee) -> Self {
        Self {
            signee_id: Uuid::new_v4(),
            contract_id,
            name: input.name,
            email: input.email,
            phone: input.phone,
            signed: false,
            created_utc: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateContract {
    #[validate(url)]
    pub person: Option<String>,
    pub application_id: Option<Uuid>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[validate(length(min = 1, max = 2550))]
    pub goal: String,
    #[serde(default)]
    #[validate(nested)]
    pub signees: Vec<CreateSignee>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateSignee {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}
