//! Principal Aggregate
//!
//! The aggregate root and its three owned child collections, plus the
//! store that persists the whole aggregate as one unit.

pub mod entity;
pub mod store;

// Re-export main types
pub use entity::{Principal, PrincipalClaim, PrincipalLogin, RoleMembership};
pub use store::PrincipalStore;
