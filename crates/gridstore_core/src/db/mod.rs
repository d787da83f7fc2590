//! Store access layer: session lifecycle and transaction bridging.
//!
//! # Responsibility
//! - Own the singleton engine session and its recovery rules.
//! - Translate engine failure classes into the caller-facing taxonomy.
//!
//! # Invariants
//! - `SessionInvalid` always tears the session down before it is surfaced,
//!   so the next acquire opens fresh.
//! - No error is silently swallowed.

use crate::engine::EngineError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod bridge;
pub mod manager;

pub type StoreResult<T> = Result<T, StoreError>;

/// Caller-facing failure taxonomy.
///
/// `ConnectionTimeout`, `ConnectionBlocked` and `Aborted` are retryable;
/// `MissingIndex` is a call-site defect; `SessionInvalid` means the stale
/// session was already torn down and one retry will reopen.
#[derive(Debug)]
pub enum StoreError {
    /// Opening the store exceeded the configured timeout.
    ConnectionTimeout { timeout_ms: u64 },
    /// Another handle prevents the store from opening.
    ConnectionBlocked,
    /// The open failed for a reason other than timeout or blocking.
    ConnectionFailure(EngineError),
    /// A lookup was issued with an incomplete composite key, or the index
    /// itself is absent.
    MissingIndex(String),
    /// The transaction aborted, explicitly or through a constraint violation.
    Aborted(String),
    /// The session was judged stale mid-flight and has been closed.
    SessionInvalid,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionTimeout { timeout_ms } => {
                write!(f, "store open timed out after {timeout_ms}ms")
            }
            Self::ConnectionBlocked => write!(f, "store open blocked by another handle"),
            Self::ConnectionFailure(err) => write!(f, "store open failed: {err}"),
            Self::MissingIndex(message) => write!(f, "missing index key: {message}"),
            Self::Aborted(message) => write!(f, "transaction aborted: {message}"),
            Self::SessionInvalid => {
                write!(f, "session invalidated; it has been closed for reopen")
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ConnectionFailure(err) => Some(err),
            _ => None,
        }
    }
}
