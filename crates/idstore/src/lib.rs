//! Identity Store
//!
//! Persistence for an identity aggregate: a principal with role
//! memberships, claims, and external logins, plus standalone roles.
//!
//! ## Module Organization (Aggregate-based)
//!
//! Each aggregate contains:
//! - `entity` - Domain entities, mutated in memory by the caller
//! - `store` - Persistence orchestration over a `DbContext`
//!
//! `reconcile` holds the collection-diff engine the stores share. Writes
//! reconcile the in-memory aggregate against persisted state with minimal
//! insert/delete sets inside one transactional scope; reads always load a
//! fresh aggregate from the store.

pub mod principal;
pub mod reconcile;
pub mod role;

pub use principal::{Principal, PrincipalClaim, PrincipalLogin, PrincipalStore, RoleMembership};
pub use reconcile::{reconcile, Reconciliation};
pub use role::{Role, RoleStore};

/// Fresh opaque identifier for rows created without one.
pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_lowercase() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(a, a.to_lowercase());
        assert_eq!(a.len(), 36);
    }
}
