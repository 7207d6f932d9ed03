//! Account ledger: the authoritative cash balance per account.
//!
//! Every function takes the connection of an open atomic unit; none of them
//! commits.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;

use crate::db::{encode_decimal, encode_time, StoredAccount};
use crate::error::{LedgerError, Result};
use crate::models::{Account, AccountId};

pub struct Ledger;

impl Ledger {
    /// Insert a new account at zero balance.
    pub async fn create(conn: &mut SqliteConnection, id: &AccountId, now: DateTime<Utc>) -> Result<Account> {
        let inserted = sqlx::query(
            "INSERT INTO accounts (id, balance, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(encode_decimal(Decimal::ZERO))
        .bind(encode_time(now))
        .bind(encode_time(now))
        .execute(&mut *conn)
        .await;

        match inserted {
            Ok(_) => Ok(Account {
                id: id.clone(),
                balance: Decimal::ZERO,
                created_at: now,
                updated_at: now,
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(LedgerError::AccountExists(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the write lock on the account row before anything else is read.
    ///
    /// The touch is the first statement of the unit, so the store's write lock is
    /// held from here to commit and no other writer can slip between the funds
    /// check and the balance write.
    pub async fn lock(conn: &mut SqliteConnection, id: &AccountId, now: DateTime<Utc>) -> Result<()> {
        let touched = sqlx::query("UPDATE accounts SET updated_at = ? WHERE id = ?")
            .bind(encode_time(now))
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;

        if touched.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get(conn: &mut SqliteConnection, id: &AccountId) -> Result<Account> {
        sqlx::query_as::<_, StoredAccount>(
            "SELECT id, balance, created_at, updated_at FROM accounts WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LedgerError::NotFound(id.to_string()))?
        .try_into()
    }

    pub async fn get_balance(conn: &mut SqliteConnection, id: &AccountId) -> Result<Decimal> {
        Ok(Self::get(conn, id).await?.balance)
    }

    /// Apply `delta` to the balance unless the result would fall below `minimum`.
    /// Returns the new balance.
    pub async fn adjust_balance(
        conn: &mut SqliteConnection,
        id: &AccountId,
        delta: Decimal,
        minimum: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let balance = Self::get_balance(conn, id).await?;
        let updated = balance
            .checked_add(delta)
            .ok_or_else(|| LedgerError::invalid("balance arithmetic overflow"))?;

        if updated < minimum {
            return Err(LedgerError::InsufficientFunds {
                required: -delta,
                available: balance - minimum,
            });
        }

        sqlx::query("UPDATE accounts SET balance = ?, updated_at = ? WHERE id = ?")
            .bind(encode_decimal(updated))
            .bind(encode_time(now))
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;

        Ok(updated)
    }
}
