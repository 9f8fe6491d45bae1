//! Claims, proofs and their links to grants.
//!
//! Associations are kept as id sets rather than object references. The owning
//! side of a proof link is `Proof::claim_id`; `Claim::proof_ids` mirrors it.
//! Grant links are the `(grant, claim)` pairs stored on both ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

/// Reference to either kind of grant a claim can be shared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum GrantRef {
    Authorization(Uuid),
    Contract(Uuid),
}

impl GrantRef {
    pub fn kind(&self) -> &'static str {
        match self {
            GrantRef::Authorization(_) => "authorization",
            GrantRef::Contract(_) => "contract",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            GrantRef::Authorization(id) | GrantRef::Contract(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "authorization" => Some(GrantRef::Authorization(id)),
            "contract" => Some(GrantRef::Contract(id)),
            _ => None,
        }
    }
}

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A subject-property-value statement about a person.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Claim {
    pub claim_id: Uuid,
    /// Person the claim is about (URL).
    pub person: String,
    pub property: String,
    #[sqlx(json)]
    pub data: serde_json::Value,
    /// Legacy token carried over from older claim stores.
    pub token: Option<String>,
    #[sqlx(skip)]
    #[serde(default)]
    pub proof_ids: BTreeSet<Uuid>,
    #[sqlx(skip)]
    #[serde(default)]
    pub grants: BTreeSet<GrantRef>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Claim {
    pub fn new(input: CreateClaim) -> Self {
        let now = Utc::now();
        Self {
            claim_id: Uuid::new_v4(),
            person: input.person,
            property: input.property,
            data: input.data,
            token: input.token,
            proof_ids: BTreeSet::new(),
            grants: BTreeSet::new(),
            created_utc: now,
            updated_utc: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateClaim {
    #[validate(url, length(max = 255))]
    pub person: String,
    #[validate(length(min = 1, max = 255))]
    pub property: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[validate(length(max = 255))]
    pub token: Option<String>,
}

/// Evidence of a claim's validity, issued for one application.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Proof {
    pub proof_id: Uuid,
    pub claim_id: Option<Uuid>,
    pub application_id: Uuid,
    pub proof_type: String,
    pub proof_purpose: String,
    pub verification_method: String,
    /// Detached JWS over the claim.
    pub jws: String,
    pub created_utc: DateTime<Utc>,
}

impl Proof {
    pub fn new(input: CreateProof) -> Self {
        Self {
            proof_id: Uuid::new_v4(),
            claim_id: None,
            application_id: input.application_id,
            proof_type: input.proof_type,
            proof_purpose: input.proof_purpose,
            verification_method: input.verification_method,
            jws: input.jws,
            created_utc: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateProof {
    pub claim_id: Uuid,
    pub application_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub proof_type: String,
    #[validate(length(min = 1, max = 255))]
    pub proof_purpose: String,
    #[validate(length(min = 1, max = 255))]
    pub verification_method: String,
    #[validate(length(min = 1))]
    pub jws: String,
}

/// Anything a claim can be shared with.
pub trait Grant {
    fn grant_ref(&self) -> GrantRef;
    fn claim_ids(&self) -> &BTreeSet<Uuid>;
    fn claim_ids_mut(&mut self) -> &mut BTreeSet<Uuid>;
}

/// Attach `proof` to `claim`. Returns false when nothing changed.
pub fn add_proof(claim: &mut Claim, proof: &mut Proof) -> bool {
    let moved = proof.claim_id != Some(claim.claim_id);
    proof.claim_id = Some(claim.claim_id);
    let inserted = claim.proof_ids.insert(proof.proof_id);
    moved || inserted
}

/// Detach `proof` from `claim`.
///
/// The proof's back-reference is cleared only while it still points at this
/// claim, so a stale unlink after reassignment leaves the new owner intact.
pub fn remove_proof(claim: &mut Claim, proof: &mut Proof) -> bool {
    let removed = claim.proof_ids.remove(&proof.proof_id);
    let cleared = proof.claim_id == Some(claim.claim_id);
    if cleared {
        proof.claim_id = None;
    }
    removed || cleared
}

/// Share `claim` with `grant`, registering both sides of the link.
pub fn add_claim<G: Grant + ?Sized>(grant: &mut G, claim: &mut Claim) -> bool {
    let forward = grant.claim_ids_mut().insert(claim.claim_id);
    let inverse = claim.grants.insert(grant.grant_ref());
    forward || inverse
}

pub fn remove_claim<G: Grant + ?Sized>(grant: &mut G, claim: &mut Claim) -> bool {
    let forward = grant.claim_ids_mut().remove(&claim.claim_id);
    let inverse = claim.grants.remove(&grant.grant_ref());
    forward || inverse
}
