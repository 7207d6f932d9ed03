//! Error taxonomy for the ledger core.
//!
//! Domain rejections (`InvalidOrder`, `InsufficientFunds`, `InsufficientPosition`,
//! `NotFound`, `AccountExists`) are permanent for a given request. `Conflict` and
//! `Timeout` are transient and may be retried by the original caller with the same
//! idempotency key.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the ledger, position book, journal and trade engine.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Insufficient position in {symbol}: requested {requested}, held {held}")]
    InsufficientPosition {
        symbol: String,
        requested: Decimal,
        held: Decimal,
    },

    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Storage contention, retry the request: {0}")]
    Conflict(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Corrupt stored value in {field}: {value}")]
    CorruptValue { field: &'static str, value: String },

    #[error("Storage error: {0}")]
    Storage(sqlx::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        LedgerError::InvalidOrder(message.into())
    }

    /// Whether the caller may retry the same request (with the same idempotency key).
    pub fn is_retriable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_) | LedgerError::Timeout(_))
    }
}

// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => LedgerError::Conflict("connection pool exhausted".to_string()),
            sqlx::Error::Database(db) => {
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => {
                        LedgerError::Conflict(db.message().to_string())
                    }
                    _ => LedgerError::Storage(err),
                }
            }
            _ => LedgerError::Storage(err),
        }
    }
}
