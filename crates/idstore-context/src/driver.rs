//! Store Driver Boundary
//!
//! The relational engine is an external collaborator; this module defines
//! the narrow capability the context layer needs from it: open a session,
//! execute a parameterized statement, query rows into typed records, and
//! drive transactions/savepoints. Production drivers adapt a real engine;
//! the testkit ships an in-memory one.

use std::borrow::Cow;

use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};

/// A single bind parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// A parameterized statement: SQL text with positional `?` binds.
#[derive(Debug, Clone)]
pub struct Statement {
    sql: Cow<'static, str>,
    params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<Cow<'static, str>>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

/// One result row: named columns in select order.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.columns.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    fn require(&self, column: &str) -> Result<&Value> {
        self.get(column).ok_or_else(|| {
            StoreError::backend(format!("result row is missing column '{column}'"))
        })
    }

    pub fn text(&self, column: &str) -> Result<&str> {
        match self.require(column)? {
            Value::Text(v) => Ok(v),
            other => Err(type_mismatch(column, "text", other)),
        }
    }

    pub fn opt_text(&self, column: &str) -> Result<Option<&str>> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v)),
            other => Err(type_mismatch(column, "text", other)),
        }
    }

    pub fn bool(&self, column: &str) -> Result<bool> {
        match self.require(column)? {
            Value::Bool(v) => Ok(*v),
            other => Err(type_mismatch(column, "bool", other)),
        }
    }

    pub fn int(&self, column: &str) -> Result<i64> {
        match self.require(column)? {
            Value::Int(v) => Ok(*v),
            other => Err(type_mismatch(column, "int", other)),
        }
    }

    pub fn opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Timestamp(v) => Ok(Some(*v)),
            other => Err(type_mismatch(column, "timestamp", other)),
        }
    }
}

impl<C: Into<String>> FromIterator<(C, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (C, Value)>>(iter: I) -> Self {
        Row {
            columns: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }
}

fn type_mismatch(column: &str, wanted: &str, got: &Value) -> StoreError {
    StoreError::backend(format!(
        "column '{column}' is not {wanted}: {got:?}"
    ))
}

/// Factory for physical connections.
pub trait Driver: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Session>>;
}

/// One open physical connection.
///
/// Implementations are not required to be thread-safe; the context layer
/// serializes all access. A session dropped without `close` must release
/// its resources as if closed.
pub trait Session: Send {
    /// Execute a statement, returning the number of affected rows.
    fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Run a query and materialize every result row.
    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    /// Run several queries as one round trip where the engine supports it.
    fn query_batch(&mut self, statements: &[Statement]) -> Result<Vec<Vec<Row>>> {
        statements.iter().map(|s| self.query(s)).collect()
    }

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn savepoint(&mut self, name: &str) -> Result<()>;

    /// Forget a savepoint after the nested scope committed. Engines without
    /// `RELEASE SAVEPOINT` treat this as bookkeeping only.
    fn release_savepoint(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}
