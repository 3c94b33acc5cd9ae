//! Connection Scope Manager
//!
//! `DbContext` multiplexes arbitrarily nested connection/transaction scopes
//! onto one physical connection. Opens are reference counted; transactions
//! nest through named savepoints, so only the outermost scope touches the
//! physical connection or the physical transaction.
//!
//! One context serves one logical unit of work. The internal mutex keeps
//! misuse from corrupting state, but the counters assume serialized access;
//! concurrent aggregates get independent contexts.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::{Driver, Row, Session, Statement};
use crate::error::{Result, StoreError};

struct ContextState {
    session: Option<Box<dyn Session>>,
    /// Outstanding `open` scopes. `-1` marks a disposed context.
    open_count: i32,
    /// Outstanding transactional scopes; depth 1 is the physical
    /// transaction, deeper levels are savepoints.
    tx_depth: u32,
}

impl ContextState {
    fn ensure_not_disposed(&self) -> Result<()> {
        if self.open_count < 0 {
            return Err(StoreError::Disposed);
        }
        Ok(())
    }
}

fn savepoint_name(depth: u32) -> String {
    format!("save_point_{depth}")
}

/// Reference-counted scope manager over one physical connection.
pub struct DbContext {
    driver: Arc<dyn Driver>,
    state: Mutex<ContextState>,
}

impl DbContext {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            state: Mutex::new(ContextState {
                session: None,
                open_count: 0,
                tx_depth: 0,
            }),
        }
    }

    /// Acquire a plain (non-transactional) connection scope.
    pub fn open(&self) -> Result<ConnectionScope<'_>> {
        let mut state = self.state.lock();
        self.open_locked(&mut state)?;
        Ok(ConnectionScope {
            context: self,
            transactional: false,
            released: false,
        })
    }

    /// Acquire a transactional scope. The first scope starts the physical
    /// transaction; nested scopes mark a savepoint named after the depth at
    /// which they were created.
    pub fn begin_transaction(&self) -> Result<ConnectionScope<'_>> {
        let mut state = self.state.lock();
        self.open_locked(&mut state)?;

        let depth = state.tx_depth;
        let started = match state.session.as_mut() {
            Some(session) if depth == 0 => session.begin(),
            Some(session) => session.savepoint(&savepoint_name(depth)),
            None => Err(StoreError::NoActiveConnection),
        };
        if let Err(err) = started {
            // Unwind the paired open so the counts stay balanced.
            if let Err(close_err) = Self::close_locked(&mut state, false) {
                warn!(error = %close_err, "failed to unwind open after begin failure");
            }
            return Err(err);
        }

        state.tx_depth += 1;
        debug!(depth = state.tx_depth, "transaction scope opened");
        Ok(ConnectionScope {
            context: self,
            transactional: true,
            released: false,
        })
    }

    /// Tear the context down: roll back any active transaction, close the
    /// physical connection, and poison the instance. Every later operation
    /// fails with `Disposed`. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.open_count < 0 {
            return;
        }
        // Backend errors are logged inside; dispose itself cannot fail.
        let _ = Self::close_locked(&mut state, true);
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().open_count < 0
    }

    /// Outstanding open scopes (diagnostic).
    pub fn open_count(&self) -> i32 {
        self.state.lock().open_count
    }

    /// Current transaction nesting depth (diagnostic).
    pub fn transaction_depth(&self) -> u32 {
        self.state.lock().tx_depth
    }

    fn open_locked(&self, state: &mut ContextState) -> Result<()> {
        state.ensure_not_disposed()?;
        if state.session.is_none() {
            state.session = Some(self.driver.connect()?);
            debug!("physical connection opened");
        }
        state.open_count += 1;
        Ok(())
    }

    fn close_locked(state: &mut ContextState, disposing: bool) -> Result<()> {
        state.ensure_not_disposed()?;
        if state.open_count == 0 && !disposing {
            return Err(StoreError::illegal_state("context already closed"));
        }

        let mut first_err: Option<StoreError> = None;
        if state.open_count == 1 || disposing {
            if state.tx_depth > 0 {
                if let Some(session) = state.session.as_mut() {
                    if let Err(err) = session.rollback() {
                        first_err.get_or_insert(err);
                    }
                }
                state.tx_depth = 0;
            }
            if let Some(mut session) = state.session.take() {
                if let Err(err) = session.close() {
                    first_err.get_or_insert(err);
                }
                debug!("physical connection closed");
            }
            if disposing {
                state.open_count = 0;
            }
        }
        state.open_count -= 1;

        match first_err {
            None => Ok(()),
            Some(err) if disposing => {
                warn!(error = %err, "backend error while disposing context");
                Ok(())
            }
            Some(err) => Err(err),
        }
    }

    fn commit_locked(state: &mut ContextState) -> Result<()> {
        state.ensure_not_disposed()?;
        if state.tx_depth == 0 {
            return Err(StoreError::NoActiveTransaction);
        }

        state.tx_depth -= 1;
        let result = match state.session.as_mut() {
            Some(session) if state.tx_depth == 0 => session.commit(),
            Some(session) => session.release_savepoint(&savepoint_name(state.tx_depth)),
            None => Err(StoreError::NoActiveConnection),
        };

        // A transactional scope always rides on exactly one open.
        let closed = Self::close_locked(state, false);
        result.and(closed)
    }

    fn rollback_locked(state: &mut ContextState) -> Result<()> {
        state.ensure_not_disposed()?;
        if state.tx_depth == 0 {
            return Err(StoreError::NoActiveTransaction);
        }

        state.tx_depth -= 1;
        let result = match state.session.as_mut() {
            Some(session) if state.tx_depth == 0 => session.rollback(),
            Some(session) => session.rollback_to_savepoint(&savepoint_name(state.tx_depth)),
            None => Err(StoreError::NoActiveConnection),
        };

        let closed = Self::close_locked(state, false);
        result.and(closed)
    }

    fn commit(&self) -> Result<()> {
        Self::commit_locked(&mut self.state.lock())
    }

    fn rollback(&self) -> Result<()> {
        Self::rollback_locked(&mut self.state.lock())
    }

    fn close(&self) -> Result<()> {
        Self::close_locked(&mut self.state.lock(), false)
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut dyn Session) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        state.ensure_not_disposed()?;
        let session = state
            .session
            .as_mut()
            .ok_or(StoreError::NoActiveConnection)?;
        f(session.as_mut())
    }
}

impl Drop for DbContext {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.open_count >= 0 {
            let _ = Self::close_locked(state, true);
        }
    }
}

/// A scoped acquisition of the context: either a plain open connection or
/// an active (possibly nested) transaction.
///
/// Exactly one release happens per scope: `commit`, `rollback`, `close`, or
/// the implicit release on drop (rollback for transactional scopes).
pub struct ConnectionScope<'a> {
    context: &'a DbContext,
    transactional: bool,
    released: bool,
}

impl ConnectionScope<'_> {
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Execute a statement on the shared session, returning affected rows.
    pub fn execute(&self, statement: &Statement) -> Result<u64> {
        self.context.with_session(|session| session.execute(statement))
    }

    pub fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.context.with_session(|session| session.query(statement))
    }

    pub fn query_batch(&self, statements: &[Statement]) -> Result<Vec<Vec<Row>>> {
        self.context
            .with_session(|session| session.query_batch(statements))
    }

    /// Release the scope, committing its transaction level. On a plain open
    /// scope this is the paired close.
    pub fn commit(mut self) -> Result<()> {
        self.released = true;
        if self.transactional {
            self.context.commit()
        } else {
            self.context.close()
        }
    }

    /// Release the scope, rolling back to its savepoint (or rolling back
    /// the physical transaction at the outermost level).
    pub fn rollback(mut self) -> Result<()> {
        self.released = true;
        if self.transactional {
            self.context.rollback()
        } else {
            self.context.close()
        }
    }

    /// Release without committing. Equivalent to `rollback` for
    /// transactional scopes and to the paired close otherwise.
    pub fn close(self) -> Result<()> {
        self.rollback()
    }
}

impl Drop for ConnectionScope<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let result = if self.transactional {
            self.context.rollback()
        } else {
            self.context.close()
        };
        match result {
            Ok(()) => {}
            // The context was disposed while the scope was outstanding;
            // dispose already rolled everything back.
            Err(StoreError::Disposed) => {}
            Err(err) => {
                warn!(error = %err, transactional = self.transactional,
                    "failed to release dropped connection scope");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        fn push(&self, event: impl Into<String>) {
            self.0.lock().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().clone()
        }

        fn count(&self, event: &str) -> usize {
            self.0.lock().iter().filter(|e| *e == event).count()
        }
    }

    #[derive(Default)]
    struct StubDriver {
        events: EventLog,
        fail_connect: std::sync::atomic::AtomicBool,
    }

    impl StubDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    impl Driver for StubDriver {
        fn connect(&self) -> Result<Box<dyn Session>> {
            if self.fail_connect.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::backend("connect refused"));
            }
            self.events.push("connect");
            Ok(Box::new(StubSession {
                events: self.events.clone(),
            }))
        }
    }

    struct StubSession {
        events: EventLog,
    }

    impl Session for StubSession {
        fn execute(&mut self, _statement: &Statement) -> Result<u64> {
            self.events.push("execute");
            Ok(1)
        }

        fn query(&mut self, _statement: &Statement) -> Result<Vec<Row>> {
            self.events.push("query");
            Ok(Vec::new())
        }

        fn begin(&mut self) -> Result<()> {
            self.events.push("begin");
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.events.push("commit");
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.events.push("rollback");
            Ok(())
        }

        fn savepoint(&mut self, name: &str) -> Result<()> {
            self.events.push(format!("savepoint {name}"));
            Ok(())
        }

        fn release_savepoint(&mut self, name: &str) -> Result<()> {
            self.events.push(format!("release {name}"));
            Ok(())
        }

        fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
            self.events.push(format!("rollback_to {name}"));
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.events.push("close");
            Ok(())
        }
    }

    #[test]
    fn nested_opens_share_one_physical_connection() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver.clone());

        let outer = context.open().unwrap();
        let inner = context.open().unwrap();
        assert_eq!(context.open_count(), 2);

        inner.commit().unwrap();
        assert_eq!(context.open_count(), 1);
        assert_eq!(driver.events.count("close"), 0);

        outer.commit().unwrap();
        assert_eq!(context.open_count(), 0);
        assert_eq!(driver.events.count("connect"), 1);
        assert_eq!(driver.events.count("close"), 1);
    }

    #[test]
    fn connection_reopens_after_full_close() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver.clone());

        context.open().unwrap().commit().unwrap();
        context.open().unwrap().commit().unwrap();

        assert_eq!(driver.events.count("connect"), 2);
        assert_eq!(driver.events.count("close"), 2);
    }

    #[test]
    fn failed_connect_leaves_context_reusable() {
        let driver = StubDriver::new();
        driver
            .fail_connect
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let context = DbContext::new(driver.clone());

        assert!(matches!(context.open(), Err(StoreError::Backend(_))));
        assert_eq!(context.open_count(), 0);

        driver
            .fail_connect
            .store(false, std::sync::atomic::Ordering::SeqCst);
        context.open().unwrap().commit().unwrap();
    }

    #[test]
    fn nested_transactions_commit_the_physical_transaction_once() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver.clone());

        let outer = context.begin_transaction().unwrap();
        let middle = context.begin_transaction().unwrap();
        let inner = context.begin_transaction().unwrap();
        assert_eq!(context.transaction_depth(), 3);

        inner.commit().unwrap();
        middle.commit().unwrap();
        assert_eq!(driver.events.count("commit"), 0);

        outer.commit().unwrap();
        assert_eq!(driver.events.count("begin"), 1);
        assert_eq!(driver.events.count("commit"), 1);
        assert_eq!(
            driver.events.count("savepoint save_point_1")
                + driver.events.count("savepoint save_point_2"),
            2
        );
    }

    #[test]
    fn inner_rollback_targets_its_savepoint() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver.clone());

        let outer = context.begin_transaction().unwrap();
        let inner = context.begin_transaction().unwrap();

        inner.rollback().unwrap();
        assert!(driver
            .events
            .events()
            .contains(&"rollback_to save_point_1".to_string()));

        outer.commit().unwrap();
        assert_eq!(driver.events.count("commit"), 1);
        assert_eq!(driver.events.count("rollback"), 0);
    }

    #[test]
    fn dropped_transactional_scope_rolls_back() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver.clone());

        {
            let _scope = context.begin_transaction().unwrap();
        }

        assert_eq!(driver.events.count("rollback"), 1);
        assert_eq!(context.transaction_depth(), 0);
        assert_eq!(context.open_count(), 0);
    }

    #[test]
    fn double_close_is_an_illegal_state() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver);

        context.open().unwrap().commit().unwrap();
        assert!(matches!(
            context.close(),
            Err(StoreError::IllegalState { .. })
        ));
    }

    #[test]
    fn commit_without_transaction_is_rejected() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver);

        assert!(matches!(
            context.commit(),
            Err(StoreError::NoActiveTransaction)
        ));

        // A plain open scope has no transaction level to commit either.
        let scope = context.open().unwrap();
        scope.commit().unwrap();
        assert!(matches!(
            context.commit(),
            Err(StoreError::NoActiveTransaction)
        ));
    }

    #[test]
    fn dispose_rolls_back_and_poisons_the_context() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver.clone());

        let scope = context.begin_transaction().unwrap();
        context.dispose();

        assert_eq!(driver.events.count("rollback"), 1);
        assert_eq!(driver.events.count("close"), 1);
        assert!(context.is_disposed());

        // The outstanding scope notices the teardown and stays quiet.
        drop(scope);

        assert!(matches!(context.open(), Err(StoreError::Disposed)));
        assert!(matches!(
            context.begin_transaction(),
            Err(StoreError::Disposed)
        ));
        context.dispose(); // idempotent
    }

    #[test]
    fn statements_require_an_open_scope() {
        let driver = StubDriver::new();
        let context = DbContext::new(driver);

        assert!(matches!(
            context.with_session(|_| Ok(())),
            Err(StoreError::NoActiveConnection)
        ));

        let scope = context.open().unwrap();
        scope
            .execute(&Statement::new("DELETE FROM roles WHERE id = ?").bind("r-1"))
            .unwrap();
        scope.close().unwrap();
    }
}
