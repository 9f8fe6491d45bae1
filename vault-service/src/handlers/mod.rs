pub mod claims;
pub mod contracts;
pub mod grants;
pub mod groups;
pub mod health;
pub mod payments;
pub mod points;

pub use health::{health_check, metrics_handler, readiness_check};
