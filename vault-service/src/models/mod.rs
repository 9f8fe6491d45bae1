//! Domain models for vault-service.

pub mod application;
pub mod authorization;
pub mod claim;
pub mod contract;
pub mod dossier;
pub mod group;
pub mod payment_run;
pub mod purpose_limitation;
pub mod scope_request;
pub mod token;

pub use application::{Application, CreateApplication};
pub use authorization::{
    compute_points, Authorization, AuthorizationLog, CreateAuthorization, UpdateScopes,
};
pub use claim::{Claim, CreateClaim, CreateProof, Grant, GrantRef, Proof};
pub use contract::{Contract, CreateContract, CreateSignee, Signee, SigningState};
pub use dossier::{CreateDossier, Dossier};
pub use group::{AcceptingParty, CreateGroup, CreateMembership, Group, GroupTree, Membership};
pub use payment_run::{
    current_period_key, is_valid_period_key, Money, OrganizationBilling, OrganizationOutcome,
    OutcomeStatus, PaymentRun, PaymentRunReport, PaymentRunResult, PaymentRunStatus,
};
pub use purpose_limitation::{
    CalendarPeriod, CreatePurposeLimitation, PurposeLimitation, ResolvedPurposeLimitation,
};
pub use scope_request::{CreateScopeRequest, ScopeRequest};
