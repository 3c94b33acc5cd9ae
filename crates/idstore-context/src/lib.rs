//! Connection Context
//!
//! Transactional access to a relational store over a single logical
//! connection:
//! - `driver` - the boundary traits the underlying engine implements
//!   (parameterized statements in, typed rows out)
//! - `context` - the reference-counted scope manager that nests
//!   transactions with savepoints
//! - `error` - the shared error taxonomy
//! - `logging` - tracing subscriber setup
//!
//! A `DbContext` owns one physical connection at a time and hands out
//! `ConnectionScope` values; only the outermost scope ever opens or closes
//! the connection or commits the physical transaction.

pub mod context;
pub mod driver;
pub mod error;
pub mod logging;

// Re-export main types
pub use context::{ConnectionScope, DbContext};
pub use driver::{Driver, Row, Session, Statement, Value};
pub use error::{Result, StoreError};
