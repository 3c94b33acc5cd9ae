//! Role Store
//!
//! Upsert follows the same update-then-insert-if-missed sequence as the
//! principal store; names are normalized to lowercase before storage and
//! compare.

use tracing::debug;

use idstore_context::{DbContext, Result, Row, Statement};

use crate::role::entity::Role;

const UPDATE_ROLE: &str = "UPDATE roles SET name = ? WHERE id = ?";
const INSERT_ROLE: &str = "INSERT INTO roles (id, name) VALUES (?, ?)";
const DELETE_ROLE: &str = "DELETE FROM roles WHERE id = ?";
const SELECT_ROLE_BY_ID: &str = "SELECT id, name FROM roles WHERE id = ?";
const SELECT_ROLE_BY_NAME: &str = "SELECT id, name FROM roles WHERE name = ?";

pub struct RoleStore<'a> {
    context: &'a DbContext,
}

impl<'a> RoleStore<'a> {
    pub fn new(context: &'a DbContext) -> Self {
        Self { context }
    }

    /// Upsert the role, generating an id when blank.
    pub fn save(&self, role: &mut Role) -> Result<()> {
        if role.id.is_empty() {
            role.id = crate::generate_id();
        }
        role.name = role.name.to_lowercase();

        let scope = self.context.begin_transaction()?;
        let updated = scope.execute(
            &Statement::new(UPDATE_ROLE)
                .bind(role.name.as_str())
                .bind(role.id.as_str()),
        )?;
        if updated == 0 {
            scope.execute(
                &Statement::new(INSERT_ROLE)
                    .bind(role.id.as_str())
                    .bind(role.name.as_str()),
            )?;
        }
        scope.commit()?;
        debug!(role_id = %role.id, existed = updated > 0, "role saved");
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let scope = self.context.begin_transaction()?;
        let affected = scope.execute(&Statement::new(DELETE_ROLE).bind(id))?;
        scope.commit()?;
        debug!(role_id = %id, affected, "role deleted");
        Ok(())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Role>> {
        if id.trim().is_empty() {
            return Ok(None);
        }
        self.find_one(Statement::new(SELECT_ROLE_BY_ID).bind(id))
    }

    /// Case-insensitive lookup by name.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Role>> {
        if name.trim().is_empty() {
            return Ok(None);
        }
        self.find_one(Statement::new(SELECT_ROLE_BY_NAME).bind(name.to_lowercase()))
    }

    fn find_one(&self, statement: Statement) -> Result<Option<Role>> {
        let scope = self.context.open()?;
        let rows = scope.query(&statement)?;
        scope.close()?;
        match rows.first() {
            Some(row) => Ok(Some(parse_role(row)?)),
            None => Ok(None),
        }
    }
}

fn parse_role(row: &Row) -> Result<Role> {
    Ok(Role {
        id: row.text("id")?.to_string(),
        name: row.text("name")?.to_string(),
    })
}
