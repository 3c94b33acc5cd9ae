//! Principal Entity
//!
//! Aggregate root for an identity: scalar profile and security fields plus
//! three owned child collections (role memberships, claims, external
//! logins). Instances are built or loaded, mutated in memory, and handed to
//! the store, which persists the aggregate in one transactional write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Membership of a principal in a role, unique by the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMembership {
    #[serde(default)]
    pub principal_id: String,

    pub role_id: String,
}

/// A claim held by a principal.
///
/// Claims are compared by (type, value); the `id` is a generated storage
/// key, assigned on save when blank and used only to address the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalClaim {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub principal_id: String,

    pub claim_type: String,

    pub claim_value: String,
}

impl PrincipalClaim {
    pub fn new(claim_type: impl Into<String>, claim_value: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            principal_id: String::new(),
            claim_type: claim_type.into(),
            claim_value: claim_value.into(),
        }
    }
}

/// An external login linked to a principal, unique by (provider, key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalLogin {
    pub login_provider: String,

    pub provider_key: String,

    #[serde(default)]
    pub principal_id: String,
}

impl PrincipalLogin {
    pub fn new(login_provider: impl Into<String>, provider_key: impl Into<String>) -> Self {
        Self {
            login_provider: login_provider.into(),
            provider_key: provider_key.into(),
            principal_id: String::new(),
        }
    }
}

/// Principal aggregate root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Opaque identifier; generated on first save when blank.
    #[serde(default)]
    pub id: String,

    /// Unique sign-in name, stored lowercase.
    pub user_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default)]
    pub email_confirmed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,

    /// Changes whenever credentials change; invalidates outstanding tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_stamp: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,

    #[serde(default)]
    pub phone_number_confirmed: bool,

    #[serde(default)]
    pub two_factor_enabled: bool,

    /// End of the current lockout window, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockout_end_utc: Option<DateTime<Utc>>,

    #[serde(default)]
    pub lockout_enabled: bool,

    #[serde(default)]
    pub access_failed_count: i32,

    #[serde(default)]
    pub memberships: Vec<RoleMembership>,

    #[serde(default)]
    pub claims: Vec<PrincipalClaim>,

    #[serde(default)]
    pub logins: Vec<PrincipalLogin>,
}

impl Principal {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            user_name: user_name.into(),
            email: None,
            email_confirmed: false,
            password_hash: None,
            security_stamp: None,
            phone_number: None,
            phone_number_confirmed: false,
            two_factor_enabled: false,
            lockout_end_utc: None,
            lockout_enabled: false,
            access_failed_count: 0,
            memberships: vec![],
            claims: vec![],
            logins: vec![],
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn add_claim(&mut self, claim_type: impl Into<String>, claim_value: impl Into<String>) {
        self.claims.push(PrincipalClaim::new(claim_type, claim_value));
    }

    /// Drop every claim matching (type, value); ids are irrelevant here.
    pub fn remove_claim(&mut self, claim_type: &str, claim_value: &str) {
        self.claims
            .retain(|c| !(c.claim_type == claim_type && c.claim_value == claim_value));
    }

    pub fn add_login(&mut self, login_provider: impl Into<String>, provider_key: impl Into<String>) {
        self.logins
            .push(PrincipalLogin::new(login_provider, provider_key));
    }

    pub fn remove_login(&mut self, login_provider: &str, provider_key: &str) {
        self.logins
            .retain(|l| !(l.login_provider == login_provider && l.provider_key == provider_key));
    }

    pub fn grant_role(&mut self, role_id: impl Into<String>) {
        let role_id = role_id.into();
        if !self.has_role_id(&role_id) {
            self.memberships.push(RoleMembership {
                principal_id: self.id.clone(),
                role_id,
            });
        }
    }

    pub fn revoke_role(&mut self, role_id: &str) {
        self.memberships.retain(|m| m.role_id != role_id);
    }

    pub fn has_role_id(&self, role_id: &str) -> bool {
        self.memberships.iter().any(|m| m.role_id == role_id)
    }

    pub fn record_access_failure(&mut self) -> i32 {
        self.access_failed_count += 1;
        self.access_failed_count
    }

    pub fn reset_access_failures(&mut self) {
        self.access_failed_count = 0;
    }

    pub fn is_locked_out(&self, now: DateTime<Utc>) -> bool {
        self.lockout_enabled && self.lockout_end_utc.is_some_and(|end| end > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn grant_role_is_idempotent() {
        let mut principal = Principal::new("alice");
        principal.grant_role("r-admin");
        principal.grant_role("r-admin");
        assert_eq!(principal.memberships.len(), 1);

        principal.revoke_role("r-admin");
        assert!(!principal.has_role_id("r-admin"));
    }

    #[test]
    fn claims_are_removed_by_type_and_value() {
        let mut principal = Principal::new("alice");
        principal.add_claim("scope", "read");
        principal.add_claim("scope", "write");
        principal.remove_claim("scope", "read");

        assert_eq!(principal.claims.len(), 1);
        assert_eq!(principal.claims[0].claim_value, "write");
    }

    #[test]
    fn lockout_window_is_checked_against_now() {
        let mut principal = Principal::new("alice");
        principal.lockout_enabled = true;
        let now = Utc::now();

        assert!(!principal.is_locked_out(now));
        principal.lockout_end_utc = Some(now + Duration::minutes(5));
        assert!(principal.is_locked_out(now));
        assert!(!principal.is_locked_out(now + Duration::minutes(6)));
    }

    #[test]
    fn access_failures_count_up_and_reset() {
        let mut principal = Principal::new("alice");
        assert_eq!(principal.record_access_failure(), 1);
        assert_eq!(principal.record_access_failure(), 2);
        principal.reset_access_failures();
        assert_eq!(principal.access_failed_count, 0);
    }

    #[test]
    fn serializes_camel_case() {
        let principal = Principal::new("Alice").with_email("alice@example.com");
        let json = serde_json::to_value(&principal).unwrap();
        assert_eq!(json["userName"], "Alice");
        assert_eq!(json["email"], "alice@example.com");
        assert!(json.get("phoneNumber").is_none());
    }
}
