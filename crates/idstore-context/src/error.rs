//! Store Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The context was disposed; the instance is terminally unusable.
    #[error("connection context is disposed")]
    Disposed,

    /// Protocol violation by the caller, e.g. closing an already-closed
    /// context. Indicates a bug in the calling code, never retried.
    #[error("illegal context state: {message}")]
    IllegalState { message: String },

    #[error("no active transaction is present")]
    NoActiveTransaction,

    #[error("no active connection is present")]
    NoActiveConnection,

    /// A child record names a different aggregate owner than the one being
    /// saved. Surfaced before any statement is issued.
    #[error("{child} record belongs to principal {found}, expected {expected}")]
    IdentityMismatch {
        child: &'static str,
        expected: String,
        found: String,
    },

    /// Failure reported by the underlying engine (connectivity, constraint
    /// violation, malformed result). Propagated unchanged after the
    /// enclosing scope has been rolled back.
    #[error("store backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub fn identity_mismatch(
        child: &'static str,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::IdentityMismatch {
            child,
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into().into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
