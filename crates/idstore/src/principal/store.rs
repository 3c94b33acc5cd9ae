//! Principal Store
//!
//! Persists the principal aggregate against a `DbContext`. A save is one
//! transactional scope: upsert the scalar row, then reconcile each child
//! collection with minimal delete/insert sets. The update-then-insert
//! sequence doubles as the existence check; whether the update matched
//! decides if prior child state is loaded at all.
//!
//! Reconciliation keys per collection:
//! - role memberships: `role_id` (the principal id is fixed per save)
//! - claims: `(claim_type, claim_value)`; rows are deleted by their
//!   generated `id`
//! - logins: `(login_provider, provider_key)`

use tracing::debug;

use idstore_context::{ConnectionScope, DbContext, Result, Row, Statement, StoreError};

use crate::principal::entity::{Principal, PrincipalClaim, PrincipalLogin, RoleMembership};
use crate::reconcile::reconcile;

const UPDATE_PRINCIPAL: &str = "UPDATE principals SET user_name = ?, email = ?, email_confirmed = ?, password_hash = ?, security_stamp = ?, phone_number = ?, phone_number_confirmed = ?, two_factor_enabled = ?, lockout_end_utc = ?, lockout_enabled = ?, access_failed_count = ? WHERE id = ?";

const INSERT_PRINCIPAL: &str = "INSERT INTO principals (id, user_name, email, email_confirmed, password_hash, security_stamp, phone_number, phone_number_confirmed, two_factor_enabled, lockout_end_utc, lockout_enabled, access_failed_count) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const DELETE_PRINCIPAL: &str = "DELETE FROM principals WHERE id = ?";

const SELECT_PRINCIPAL_BY_ID: &str = "SELECT id, user_name, email, email_confirmed, password_hash, security_stamp, phone_number, phone_number_confirmed, two_factor_enabled, lockout_end_utc, lockout_enabled, access_failed_count FROM principals WHERE id = ?";

const SELECT_ID_BY_NAME: &str = "SELECT id FROM principals WHERE user_name = ?";
const SELECT_ID_BY_EMAIL: &str = "SELECT id FROM principals WHERE email = ?";

const SELECT_MEMBERSHIPS: &str =
    "SELECT principal_id, role_id FROM principal_roles WHERE principal_id = ?";
const INSERT_MEMBERSHIP: &str =
    "INSERT INTO principal_roles (principal_id, role_id) VALUES (?, ?)";
const DELETE_MEMBERSHIP: &str =
    "DELETE FROM principal_roles WHERE principal_id = ? AND role_id = ?";

const SELECT_CLAIMS: &str =
    "SELECT id, principal_id, claim_type, claim_value FROM principal_claims WHERE principal_id = ?";
const INSERT_CLAIM: &str =
    "INSERT INTO principal_claims (id, principal_id, claim_type, claim_value) VALUES (?, ?, ?, ?)";
const DELETE_CLAIM_BY_ID: &str = "DELETE FROM principal_claims WHERE id = ?";
const DELETE_CLAIMS_BY_SHAPE: &str =
    "DELETE FROM principal_claims WHERE principal_id = ? AND claim_type = ? AND claim_value = ?";

const SELECT_LOGINS: &str =
    "SELECT login_provider, provider_key, principal_id FROM principal_logins WHERE principal_id = ?";
const INSERT_LOGIN: &str =
    "INSERT INTO principal_logins (login_provider, provider_key, principal_id) VALUES (?, ?, ?)";
const DELETE_LOGIN: &str =
    "DELETE FROM principal_logins WHERE principal_id = ? AND login_provider = ? AND provider_key = ?";
const SELECT_ID_BY_LOGIN: &str =
    "SELECT principal_id FROM principal_logins WHERE login_provider = ? AND provider_key = ?";

const SELECT_ROLE_NAME_BY_ID: &str = "SELECT name FROM roles WHERE id = ?";
const SELECT_ROLE_ID_BY_NAME: &str = "SELECT id FROM roles WHERE name = ?";
const SELECT_MEMBERSHIP: &str =
    "SELECT principal_id, role_id FROM principal_roles WHERE principal_id = ? AND role_id = ?";

/// Aggregate persistence for principals over one connection context.
pub struct PrincipalStore<'a> {
    context: &'a DbContext,
}

impl<'a> PrincipalStore<'a> {
    pub fn new(context: &'a DbContext) -> Self {
        Self { context }
    }

    /// Persist the aggregate in one transaction: upsert the scalar row,
    /// then reconcile each child collection. Generates the principal id
    /// and any blank claim ids first, and normalizes name/email to the
    /// canonical lowercase form.
    ///
    /// Any failure rolls the whole scope back, children included.
    pub fn save(&self, principal: &mut Principal) -> Result<()> {
        if principal.id.is_empty() {
            principal.id = crate::generate_id();
        }
        principal.user_name = principal.user_name.to_lowercase();
        if let Some(email) = principal.email.take() {
            principal.email = Some(email.to_lowercase());
        }
        stamp_children(principal)?;

        let scope = self.context.begin_transaction()?;

        let updated = scope.execute(&bind_profile(Statement::new(UPDATE_PRINCIPAL), principal)
            .bind(principal.id.as_str()))?;
        let existed = updated > 0;
        if !existed {
            scope.execute(&bind_profile(
                Statement::new(INSERT_PRINCIPAL).bind(principal.id.as_str()),
                principal,
            ))?;
        }

        self.reconcile_memberships(&scope, principal, existed)?;
        self.reconcile_claims(&scope, principal, existed)?;
        self.reconcile_logins(&scope, principal, existed)?;

        scope.commit()?;
        debug!(principal_id = %principal.id, existed, "principal saved");
        Ok(())
    }

    /// Delete the principal row by id. Child rows cascade at the schema
    /// level.
    pub fn delete(&self, id: &str) -> Result<()> {
        let scope = self.context.begin_transaction()?;
        let affected = scope.execute(&Statement::new(DELETE_PRINCIPAL).bind(id))?;
        scope.commit()?;
        debug!(principal_id = %id, affected, "principal deleted");
        Ok(())
    }

    /// Load the full aggregate by id in one batched read.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Principal>> {
        if id.trim().is_empty() {
            return Ok(None);
        }

        let scope = self.context.open()?;
        let batch = scope.query_batch(&[
            Statement::new(SELECT_PRINCIPAL_BY_ID).bind(id),
            Statement::new(SELECT_MEMBERSHIPS).bind(id),
            Statement::new(SELECT_CLAIMS).bind(id),
            Statement::new(SELECT_LOGINS).bind(id),
        ])?;
        scope.close()?;

        let [principal_rows, membership_rows, claim_rows, login_rows] =
            <[Vec<Row>; 4]>::try_from(batch).map_err(|_| {
                StoreError::backend("aggregate query returned the wrong number of result sets")
            })?;

        let Some(row) = principal_rows.first() else {
            return Ok(None);
        };
        let mut principal = parse_principal(row)?;
        principal.memberships = membership_rows
            .iter()
            .map(parse_membership)
            .collect::<Result<_>>()?;
        principal.claims = claim_rows.iter().map(parse_claim).collect::<Result<_>>()?;
        principal.logins = login_rows.iter().map(parse_login).collect::<Result<_>>()?;
        Ok(Some(principal))
    }

    /// Case-insensitive lookup by sign-in name.
    pub fn find_by_name(&self, user_name: &str) -> Result<Option<Principal>> {
        if user_name.trim().is_empty() {
            return Ok(None);
        }
        let id = self.probe_id(
            Statement::new(SELECT_ID_BY_NAME).bind(user_name.to_lowercase()),
            "id",
        )?;
        match id {
            Some(id) => self.find_by_id(&id),
            None => Ok(None),
        }
    }

    /// Case-insensitive lookup by email.
    pub fn find_by_email(&self, email: &str) -> Result<Option<Principal>> {
        if email.trim().is_empty() {
            return Ok(None);
        }
        let id = self.probe_id(
            Statement::new(SELECT_ID_BY_EMAIL).bind(email.to_lowercase()),
            "id",
        )?;
        match id {
            Some(id) => self.find_by_id(&id),
            None => Ok(None),
        }
    }

    /// Lookup through an external login's (provider, key) pair.
    pub fn find_by_login(&self, login_provider: &str, provider_key: &str) -> Result<Option<Principal>> {
        if login_provider.trim().is_empty() || provider_key.trim().is_empty() {
            return Ok(None);
        }
        let id = self.probe_id(
            Statement::new(SELECT_ID_BY_LOGIN)
                .bind(login_provider)
                .bind(provider_key),
            "principal_id",
        )?;
        match id {
            Some(id) => self.find_by_id(&id),
            None => Ok(None),
        }
    }

    /// Insert one claim row for the principal, returning the generated id.
    pub fn add_claim(
        &self,
        principal_id: &str,
        claim_type: &str,
        claim_value: &str,
    ) -> Result<String> {
        let id = crate::generate_id();
        let scope = self.context.open()?;
        scope.execute(
            &Statement::new(INSERT_CLAIM)
                .bind(id.as_str())
                .bind(principal_id)
                .bind(claim_type)
                .bind(claim_value),
        )?;
        scope.close()?;
        Ok(id)
    }

    /// Delete every claim row of the principal matching (type, value).
    pub fn remove_claims(
        &self,
        principal_id: &str,
        claim_type: &str,
        claim_value: &str,
    ) -> Result<u64> {
        let scope = self.context.open()?;
        let affected = scope.execute(
            &Statement::new(DELETE_CLAIMS_BY_SHAPE)
                .bind(principal_id)
                .bind(claim_type)
                .bind(claim_value),
        )?;
        scope.close()?;
        Ok(affected)
    }

    /// Delete claim rows by their storage ids, atomically.
    pub fn remove_claims_by_id(&self, ids: &[String]) -> Result<()> {
        let scope = self.context.begin_transaction()?;
        for id in ids {
            scope.execute(&Statement::new(DELETE_CLAIM_BY_ID).bind(id.as_str()))?;
        }
        scope.commit()
    }

    pub fn claims_of(&self, principal_id: &str) -> Result<Vec<PrincipalClaim>> {
        let scope = self.context.open()?;
        let rows = scope.query(&Statement::new(SELECT_CLAIMS).bind(principal_id))?;
        scope.close()?;
        rows.iter().map(parse_claim).collect()
    }

    pub fn add_login(
        &self,
        principal_id: &str,
        login_provider: &str,
        provider_key: &str,
    ) -> Result<()> {
        let scope = self.context.open()?;
        scope.execute(
            &Statement::new(INSERT_LOGIN)
                .bind(login_provider)
                .bind(provider_key)
                .bind(principal_id),
        )?;
        scope.close()
    }

    pub fn remove_login(
        &self,
        principal_id: &str,
        login_provider: &str,
        provider_key: &str,
    ) -> Result<u64> {
        let scope = self.context.open()?;
        let affected = scope.execute(
            &Statement::new(DELETE_LOGIN)
                .bind(principal_id)
                .bind(login_provider)
                .bind(provider_key),
        )?;
        scope.close()?;
        Ok(affected)
    }

    pub fn logins_of(&self, principal_id: &str) -> Result<Vec<PrincipalLogin>> {
        let scope = self.context.open()?;
        let rows = scope.query(&Statement::new(SELECT_LOGINS).bind(principal_id))?;
        scope.close()?;
        rows.iter().map(parse_login).collect()
    }

    pub fn add_to_role(&self, principal_id: &str, role_id: &str) -> Result<()> {
        let scope = self.context.open()?;
        scope.execute(
            &Statement::new(INSERT_MEMBERSHIP)
                .bind(principal_id)
                .bind(role_id),
        )?;
        scope.close()
    }

    pub fn remove_from_role(&self, principal_id: &str, role_id: &str) -> Result<u64> {
        let scope = self.context.open()?;
        let affected = scope.execute(
            &Statement::new(DELETE_MEMBERSHIP)
                .bind(principal_id)
                .bind(role_id),
        )?;
        scope.close()?;
        Ok(affected)
    }

    /// Names of every role the principal belongs to.
    pub fn role_names_of(&self, principal_id: &str) -> Result<Vec<String>> {
        let scope = self.context.open()?;
        let memberships = scope.query(&Statement::new(SELECT_MEMBERSHIPS).bind(principal_id))?;
        let mut names = Vec::with_capacity(memberships.len());
        for membership in &memberships {
            let role_id = membership.text("role_id")?;
            let rows = scope.query(&Statement::new(SELECT_ROLE_NAME_BY_ID).bind(role_id))?;
            if let Some(row) = rows.first() {
                names.push(row.text("name")?.to_string());
            }
        }
        scope.close()?;
        Ok(names)
    }

    /// Case-insensitive membership test by role name.
    pub fn is_in_role(&self, principal_id: &str, role_name: &str) -> Result<bool> {
        let scope = self.context.open()?;
        let roles = scope.query(
            &Statement::new(SELECT_ROLE_ID_BY_NAME).bind(role_name.to_lowercase()),
        )?;
        let member = match roles.first() {
            Some(role) => {
                let role_id = role.text("id")?;
                !scope
                    .query(
                        &Statement::new(SELECT_MEMBERSHIP)
                            .bind(principal_id)
                            .bind(role_id),
                    )?
                    .is_empty()
            }
            None => false,
        };
        scope.close()?;
        Ok(member)
    }

    fn probe_id(&self, statement: Statement, column: &str) -> Result<Option<String>> {
        let scope = self.context.open()?;
        let rows = scope.query(&statement)?;
        scope.close()?;
        match rows.first() {
            Some(row) => Ok(Some(row.text(column)?.to_string())),
            None => Ok(None),
        }
    }

    fn reconcile_memberships(
        &self,
        scope: &ConnectionScope<'_>,
        principal: &Principal,
        existed: bool,
    ) -> Result<()> {
        let prior = if existed {
            let rows = scope.query(&Statement::new(SELECT_MEMBERSHIPS).bind(principal.id.as_str()))?;
            Some(rows.iter().map(parse_membership).collect::<Result<Vec<_>>>()?)
        } else {
            None
        };

        let diff = reconcile(prior.as_deref(), &principal.memberships, |m| {
            m.role_id.as_str()
        });
        for membership in &diff.to_delete {
            scope.execute(
                &Statement::new(DELETE_MEMBERSHIP)
                    .bind(principal.id.as_str())
                    .bind(membership.role_id.as_str()),
            )?;
        }
        for membership in &diff.to_insert {
            scope.execute(
                &Statement::new(INSERT_MEMBERSHIP)
                    .bind(principal.id.as_str())
                    .bind(membership.role_id.as_str()),
            )?;
        }
        Ok(())
    }

    fn reconcile_claims(
        &self,
        scope: &ConnectionScope<'_>,
        principal: &Principal,
        existed: bool,
    ) -> Result<()> {
        let prior = if existed {
            let rows = scope.query(&Statement::new(SELECT_CLAIMS).bind(principal.id.as_str()))?;
            Some(rows.iter().map(parse_claim).collect::<Result<Vec<_>>>()?)
        } else {
            None
        };

        // Matched by (type, value); the persisted row keeps its own id.
        let diff = reconcile(prior.as_deref(), &principal.claims, |c| {
            (c.claim_type.as_str(), c.claim_value.as_str())
        });
        for claim in &diff.to_delete {
            scope.execute(&Statement::new(DELETE_CLAIM_BY_ID).bind(claim.id.as_str()))?;
        }
        for claim in &diff.to_insert {
            scope.execute(
                &Statement::new(INSERT_CLAIM)
                    .bind(claim.id.as_str())
                    .bind(principal.id.as_str())
                    .bind(claim.claim_type.as_str())
                    .bind(claim.claim_value.as_str()),
            )?;
        }
        Ok(())
    }

    fn reconcile_logins(
        &self,
        scope: &ConnectionScope<'_>,
        principal: &Principal,
        existed: bool,
    ) -> Result<()> {
        let prior = if existed {
            let rows = scope.query(&Statement::new(SELECT_LOGINS).bind(principal.id.as_str()))?;
            Some(rows.iter().map(parse_login).collect::<Result<Vec<_>>>()?)
        } else {
            None
        };

        let diff = reconcile(prior.as_deref(), &principal.logins, |l| {
            (l.login_provider.as_str(), l.provider_key.as_str())
        });
        for login in &diff.to_delete {
            scope.execute(
                &Statement::new(DELETE_LOGIN)
                    .bind(principal.id.as_str())
                    .bind(login.login_provider.as_str())
                    .bind(login.provider_key.as_str()),
            )?;
        }
        for login in &diff.to_insert {
            scope.execute(
                &Statement::new(INSERT_LOGIN)
                    .bind(login.login_provider.as_str())
                    .bind(login.provider_key.as_str())
                    .bind(principal.id.as_str()),
            )?;
        }
        Ok(())
    }
}

/// Stamp children with the aggregate id and generate blank claim ids.
/// A child naming a different owner is rejected before any statement runs.
fn stamp_children(principal: &mut Principal) -> Result<()> {
    let id = principal.id.clone();
    for membership in &mut principal.memberships {
        if membership.principal_id.is_empty() {
            membership.principal_id = id.clone();
        } else if membership.principal_id != id {
            return Err(StoreError::identity_mismatch(
                "role membership",
                &id,
                &membership.principal_id,
            ));
        }
    }
    for claim in &mut principal.claims {
        if claim.id.is_empty() {
            claim.id = crate::generate_id();
        }
        if claim.principal_id.is_empty() {
            claim.principal_id = id.clone();
        } else if claim.principal_id != id {
            return Err(StoreError::identity_mismatch(
                "claim",
                &id,
                &claim.principal_id,
            ));
        }
    }
    for login in &mut principal.logins {
        if login.principal_id.is_empty() {
            login.principal_id = id.clone();
        } else if login.principal_id != id {
            return Err(StoreError::identity_mismatch(
                "login",
                &id,
                &login.principal_id,
            ));
        }
    }
    Ok(())
}

fn bind_profile(statement: Statement, principal: &Principal) -> Statement {
    statement
        .bind(principal.user_name.as_str())
        .bind(principal.email.clone())
        .bind(principal.email_confirmed)
        .bind(principal.password_hash.clone())
        .bind(principal.security_stamp.clone())
        .bind(principal.phone_number.clone())
        .bind(principal.phone_number_confirmed)
        .bind(principal.two_factor_enabled)
        .bind(principal.lockout_end_utc)
        .bind(principal.lockout_enabled)
        .bind(principal.access_failed_count)
}

fn parse_principal(row: &Row) -> Result<Principal> {
    Ok(Principal {
        id: row.text("id")?.to_string(),
        user_name: row.text("user_name")?.to_string(),
        email: row.opt_text("email")?.map(str::to_string),
        email_confirmed: row.bool("email_confirmed")?,
        password_hash: row.opt_text("password_hash")?.map(str::to_string),
        security_stamp: row.opt_text("security_stamp")?.map(str::to_string),
        phone_number: row.opt_text("phone_number")?.map(str::to_string),
        phone_number_confirmed: row.bool("phone_number_confirmed")?,
        two_factor_enabled: row.bool("two_factor_enabled")?,
        lockout_end_utc: row.opt_timestamp("lockout_end_utc")?,
        lockout_enabled: row.bool("lockout_enabled")?,
        access_failed_count: row.int("access_failed_count")? as i32,
        memberships: vec![],
        claims: vec![],
        logins: vec![],
    })
}

fn parse_membership(row: &Row) -> Result<RoleMembership> {
    Ok(RoleMembership {
        principal_id: row.text("principal_id")?.to_string(),
        role_id: row.text("role_id")?.to_string(),
    })
}

fn parse_claim(row: &Row) -> Result<PrincipalClaim> {
    Ok(PrincipalClaim {
        id: row.text("id")?.to_string(),
        principal_id: row.text("principal_id")?.to_string(),
        claim_type: row.text("claim_type")?.to_string(),
        claim_value: row.text("claim_value")?.to_string(),
    })
}

fn parse_login(row: &Row) -> Result<PrincipalLogin> {
    Ok(PrincipalLogin {
        login_provider: row.text("login_provider")?.to_string(),
        provider_key: row.text("provider_key")?.to_string(),
        principal_id: row.text("principal_id")?.to_string(),
    })
}
