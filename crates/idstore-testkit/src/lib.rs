//! Idstore Testkit
//!
//! In-memory implementation of the `idstore-context` driver boundary for
//! tests:
//! - hash-map tables behind a tiny statement interpreter
//! - real transaction/savepoint semantics via a snapshot stack
//! - instrumentation: physical open/close and transaction counters plus a
//!   per-statement log, so tests can assert exactly which writes happened
//!
//! Sessions opened from one `MemoryDriver` share the committed state, which
//! lets tests verify what a second connection observes after commits,
//! rollbacks, or disposal.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use idstore_context::{Driver, Result, Row, Session, Statement, StoreError, Value};

mod interpret;

pub use interpret::StatementKind;
use interpret::Tables;

/// Counts of physical driver events since the driver was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub connects: usize,
    pub closes: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub savepoints: usize,
}

/// One interpreted statement, recorded in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementRecord {
    pub kind: StatementKind,
    pub table: String,
}

#[derive(Default)]
struct SharedState {
    committed: Tables,
    stats: DriverStats,
    log: Vec<StatementRecord>,
    fail_next: Option<(StatementKind, String)>,
}

/// In-memory driver; clone-cheap handle over shared state.
#[derive(Default)]
pub struct MemoryDriver {
    shared: Arc<Mutex<SharedState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DriverStats {
        self.shared.lock().stats
    }

    /// Every mutating/select statement interpreted so far, in order.
    pub fn statements(&self) -> Vec<StatementRecord> {
        self.shared.lock().log.clone()
    }

    pub fn clear_statements(&self) {
        self.shared.lock().log.clear();
    }

    /// Committed rows of a table (uncommitted transaction state is not
    /// visible here).
    pub fn rows(&self, table: &str) -> Vec<HashMap<String, Value>> {
        self.shared
            .lock()
            .committed
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Make the next statement of the given shape fail once, for testing
    /// rollback-on-failure paths.
    pub fn fail_next(&self, kind: StatementKind, table: &str) {
        self.shared.lock().fail_next = Some((kind, table.to_string()));
    }
}

impl Driver for MemoryDriver {
    fn connect(&self) -> Result<Box<dyn Session>> {
        let mut shared = self.shared.lock();
        shared.stats.connects += 1;
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            tx: None,
            closed: false,
        }))
    }
}

struct TxState {
    working: Tables,
    savepoints: Vec<(String, Tables)>,
}

struct MemorySession {
    shared: Arc<Mutex<SharedState>>,
    tx: Option<TxState>,
    closed: bool,
}

impl MemorySession {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::backend("session is closed"));
        }
        Ok(())
    }

    fn record(
        shared: &mut SharedState,
        kind: StatementKind,
        table: &str,
    ) -> Result<()> {
        if let Some((fail_kind, fail_table)) = &shared.fail_next {
            if *fail_kind == kind && fail_table == table {
                shared.fail_next = None;
                return Err(StoreError::backend(format!(
                    "injected failure on {kind:?} {table}"
                )));
            }
        }
        shared.log.push(StatementRecord {
            kind,
            table: table.to_string(),
        });
        Ok(())
    }

    fn require_tx(&mut self) -> Result<&mut TxState> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::backend("no transaction is active on this session"))
    }
}

impl Session for MemorySession {
    fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.check_open()?;
        let parsed = interpret::parse(statement.sql())?;
        let mut shared = self.shared.lock();
        Self::record(&mut shared, parsed.kind, &parsed.table)?;
        let tables = match self.tx.as_mut() {
            Some(tx) => &mut tx.working,
            None => &mut shared.committed,
        };
        interpret::execute(tables, &parsed, statement.params())
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.check_open()?;
        let parsed = interpret::parse(statement.sql())?;
        let mut shared = self.shared.lock();
        Self::record(&mut shared, parsed.kind, &parsed.table)?;
        let tables = match self.tx.as_ref() {
            Some(tx) => &tx.working,
            None => &shared.committed,
        };
        interpret::query(tables, &parsed, statement.params())
    }

    fn begin(&mut self) -> Result<()> {
        self.check_open()?;
        if self.tx.is_some() {
            return Err(StoreError::backend("transaction already active"));
        }
        let mut shared = self.shared.lock();
        shared.stats.begins += 1;
        self.tx = Some(TxState {
            working: shared.committed.clone(),
            savepoints: Vec::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::backend("commit without transaction"))?;
        let mut shared = self.shared.lock();
        shared.committed = tx.working;
        shared.stats.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        if self.tx.take().is_none() {
            return Err(StoreError::backend("rollback without transaction"));
        }
        self.shared.lock().stats.rollbacks += 1;
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> Result<()> {
        self.check_open()?;
        let tx = self.require_tx()?;
        let snapshot = tx.working.clone();
        tx.savepoints.push((name.to_string(), snapshot));
        self.shared.lock().stats.savepoints += 1;
        Ok(())
    }

    fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.check_open()?;
        let tx = self.require_tx()?;
        match tx.savepoints.iter().rposition(|(n, _)| n == name) {
            Some(idx) => {
                tx.savepoints.truncate(idx);
                Ok(())
            }
            None => Err(StoreError::backend(format!("unknown savepoint {name}"))),
        }
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.check_open()?;
        let tx = self.require_tx()?;
        match tx.savepoints.iter().rposition(|(n, _)| n == name) {
            Some(idx) => {
                tx.working = tx.savepoints[idx].1.clone();
                tx.savepoints.truncate(idx);
                Ok(())
            }
            None => Err(StoreError::backend(format!("unknown savepoint {name}"))),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Uncommitted work dies with the session.
        self.tx = None;
        self.shared.lock().stats.closes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_role(session: &mut Box<dyn Session>, id: &str, name: &str) {
        session
            .execute(
                &Statement::new("INSERT INTO roles (id, name) VALUES (?, ?)")
                    .bind(id)
                    .bind(name),
            )
            .unwrap();
    }

    fn role_ids(session: &mut Box<dyn Session>) -> Vec<String> {
        session
            .query(&Statement::new("SELECT id, name FROM roles"))
            .unwrap()
            .iter()
            .map(|row| row.text("id").unwrap().to_string())
            .collect()
    }

    #[test]
    fn autocommit_writes_are_visible_to_other_sessions() {
        let driver = MemoryDriver::new();
        let mut writer = driver.connect().unwrap();
        insert_role(&mut writer, "r-1", "admin");

        let mut reader = driver.connect().unwrap();
        assert_eq!(role_ids(&mut reader), vec!["r-1"]);
        assert_eq!(driver.stats().connects, 2);
    }

    #[test]
    fn rolled_back_transaction_leaves_no_trace() {
        let driver = MemoryDriver::new();
        let mut session = driver.connect().unwrap();

        session.begin().unwrap();
        insert_role(&mut session, "r-1", "admin");
        session.rollback().unwrap();

        assert!(driver.rows("roles").is_empty());
        assert_eq!(driver.stats().rollbacks, 1);
    }

    #[test]
    fn savepoint_rollback_keeps_earlier_writes() {
        let driver = MemoryDriver::new();
        let mut session = driver.connect().unwrap();

        session.begin().unwrap();
        insert_role(&mut session, "r-1", "admin");
        session.savepoint("save_point_1").unwrap();
        insert_role(&mut session, "r-2", "operator");
        session.rollback_to_savepoint("save_point_1").unwrap();
        session.commit().unwrap();

        assert_eq!(driver.rows("roles").len(), 1);
        assert_eq!(driver.rows("roles")[0]["id"], Value::Text("r-1".into()));
    }

    #[test]
    fn closed_session_discards_open_transaction() {
        let driver = MemoryDriver::new();
        let mut session = driver.connect().unwrap();

        session.begin().unwrap();
        insert_role(&mut session, "r-1", "admin");
        session.close().unwrap();

        assert!(driver.rows("roles").is_empty());
        assert_eq!(driver.stats().closes, 1);
    }

    #[test]
    fn injected_failure_fires_once() {
        let driver = MemoryDriver::new();
        let mut session = driver.connect().unwrap();

        driver.fail_next(StatementKind::Insert, "roles");
        let stmt = Statement::new("INSERT INTO roles (id, name) VALUES (?, ?)")
            .bind("r-1")
            .bind("admin");
        assert!(session.execute(&stmt).is_err());
        assert!(session.execute(&stmt).is_ok());
    }

    #[test]
    fn statement_log_records_shape_and_table() {
        let driver = MemoryDriver::new();
        let mut session = driver.connect().unwrap();
        insert_role(&mut session, "r-1", "admin");

        let log = driver.statements();
        assert_eq!(
            log,
            vec![StatementRecord {
                kind: StatementKind::Insert,
                table: "roles".to_string(),
            }]
        );
    }
}
