//! Account model: one simulated investor and their cash balance.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

const MAX_ACCOUNT_ID_LEN: usize = 64;

/// Stable account identifier (the presentation layer's `userId`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Validate a raw identifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(LedgerError::invalid("account id must not be empty"));
        }
        if id.len() > MAX_ACCOUNT_ID_LEN {
            return Err(LedgerError::invalid(format!(
                "account id longer than {} characters",
                MAX_ACCOUNT_ID_LEN
            )));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(LedgerError::invalid("account id must not contain whitespace"));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Simulated investor account. The balance is owned by the ledger and only
/// moves inside an engine atomic unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_validation() {
        assert_eq!(AccountId::parse("  user-1 ").unwrap().as_str(), "user-1");
        assert!(AccountId::parse("").is_err());
        assert!(AccountId::parse("two words").is_err());
        assert!(AccountId::parse(&"x".repeat(65)).is_err());
    }
}
