//! Durable store for the ledger.
//!
//! Holds the SQLite connection pool and the schema. Money and quantities are kept
//! as canonical decimal TEXT and timestamps as fixed-width RFC 3339 TEXT, so
//! ordering by `created_at` is chronological.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::models::{Account, AccountId, Position, TransactionKind, TransactionRecord};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Columns selected for a transaction row, in `StoredTransaction` order.
pub const TRANSACTION_COLUMNS: &str = "id, account_id, kind, symbol, quantity, price, amount, fee, \
     cash_impact, balance_after, realized_pnl, note, idempotency_key, created_at";

/// Stored account row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAccount {
    pub id: String,
    pub balance: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Stored position row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub account_id: String,
    pub symbol: String,
    pub quantity: String,
    pub avg_price: String,
    pub opened_at: String,
    pub updated_at: String,
}

/// Stored journal row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTransaction {
    pub id: String,
    pub account_id: String,
    pub kind: String,
    pub symbol: Option<String>,
    pub quantity: Option<String>,
    pub price: Option<String>,
    pub amount: String,
    pub fee: String,
    pub cash_impact: String,
    pub balance_after: String,
    pub realized_pnl: Option<String>,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        // Every connection to `:memory:` is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!(url = %database_url, "Ledger database ready");
        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                balance TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                account_id TEXT NOT NULL REFERENCES accounts(id),
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL REFERENCES accounts(id),
                kind TEXT NOT NULL,
                symbol TEXT,
                quantity TEXT,
                price TEXT,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL,
                cash_impact TEXT NOT NULL,
                balance_after TEXT NOT NULL,
                realized_pnl TEXT,
                note TEXT,
                idempotency_key TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (account_id, idempotency_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // The journal is append-only.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS transactions_no_update
            BEFORE UPDATE ON transactions
            BEGIN
                SELECT RAISE(ABORT, 'transactions are append-only');
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS transactions_no_delete
            BEFORE DELETE ON transactions
            BEGIN
                SELECT RAISE(ABORT, 'transactions are append-only');
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id, seq)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_symbol ON transactions(account_id, symbol)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Start an atomic unit.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Connect to a fresh database file under `dir`.
    #[cfg(test)]
    pub async fn temporary(dir: &tempfile::TempDir) -> Self {
        let path = dir.path().join("ledger.db");
        Database::new(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .expect("temporary database")
    }
}

// ==================== Codecs ====================

pub fn encode_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

pub fn decode_decimal(field: &'static str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|_| LedgerError::CorruptValue {
        field,
        value: raw.to_string(),
    })
}

fn decode_optional(field: &'static str, raw: Option<&str>) -> Result<Option<Decimal>> {
    raw.map(|r| decode_decimal(field, r)).transpose()
}

/// Current time at the precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn encode_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_time(field: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| LedgerError::CorruptValue {
            field,
            value: raw.to_string(),
        })
}

fn decode_account_id(raw: &str) -> Result<AccountId> {
    AccountId::parse(raw).map_err(|_| LedgerError::CorruptValue {
        field: "account_id",
        value: raw.to_string(),
    })
}

impl TryFrom<StoredAccount> for Account {
    type Error = LedgerError;

    fn try_from(row: StoredAccount) -> Result<Self> {
        Ok(Account {
            id: decode_account_id(&row.id)?,
            balance: decode_decimal("balance", &row.balance)?,
            created_at: decode_time("created_at", &row.created_at)?,
            updated_at: decode_time("updated_at", &row.updated_at)?,
        })
    }
}

impl TryFrom<StoredPosition> for Position {
    type Error = LedgerError;

    fn try_from(row: StoredPosition) -> Result<Self> {
        Ok(Position {
            account_id: decode_account_id(&row.account_id)?,
            symbol: row.symbol,
            quantity: decode_decimal("quantity", &row.quantity)?,
            avg_price: decode_decimal("avg_price", &row.avg_price)?,
            opened_at: decode_time("opened_at", &row.opened_at)?,
            updated_at: decode_time("updated_at", &row.updated_at)?,
        })
    }
}

impl TryFrom<StoredTransaction> for TransactionRecord {
    type Error = LedgerError;

    fn try_from(row: StoredTransaction) -> Result<Self> {
        let kind = TransactionKind::from_str(&row.kind).map_err(|_| LedgerError::CorruptValue {
            field: "kind",
            value: row.kind.clone(),
        })?;
        let id = Uuid::parse_str(&row.id).map_err(|_| LedgerError::CorruptValue {
            field: "id",
            value: row.id.clone(),
        })?;

        Ok(TransactionRecord {
            id,
            account_id: decode_account_id(&row.account_id)?,
            kind,
            symbol: row.symbol,
            quantity: decode_optional("quantity", row.quantity.as_deref())?,
            price: decode_optional("price", row.price.as_deref())?,
            amount: decode_decimal("amount", &row.amount)?,
            fee: decode_decimal("fee", &row.fee)?,
            cash_impact: decode_decimal("cash_impact", &row.cash_impact)?,
            balance_after: decode_decimal("balance_after", &row.balance_after)?,
            realized_pnl: decode_optional("realized_pnl", row.realized_pnl.as_deref())?,
            note: row.note,
            idempotency_key: row.idempotency_key,
            created_at: decode_time("created_at", &row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_time_encoding_sorts_chronologically() {
        let earlier = DateTime::parse_from_rfc3339("2024-05-18T10:15:32Z").unwrap().with_timezone(&Utc);
        let later = earlier + chrono::Duration::microseconds(1500);

        let (a, b) = (encode_time(earlier), encode_time(later));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(decode_time("t", &b).unwrap(), later);
    }

    #[test]
    fn test_decimal_encoding_is_canonical() {
        assert_eq!(encode_decimal(dec!(150.0000)), "150");
        assert_eq!(decode_decimal("x", "2752760").unwrap(), dec!(2752760));
        assert!(decode_decimal("x", "12,5").is_err());
    }

    #[tokio::test]
    async fn test_journal_rejects_updates_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::temporary(&dir).await;
        let now = encode_time(Utc::now());

        sqlx::query("INSERT INTO accounts (id, balance, created_at, updated_at) VALUES ('u1', '0', ?, ?)")
            .bind(&now)
            .bind(&now)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO transactions (id, account_id, kind, amount, fee, cash_impact, balance_after, created_at) \
             VALUES ('t1', 'u1', 'DEPOSIT', '5', '0', '5', '5', ?)",
        )
        .bind(&now)
        .execute(db.pool())
        .await
        .unwrap();

        assert!(sqlx::query("UPDATE transactions SET amount = '6'").execute(db.pool()).await.is_err());
        assert!(sqlx::query("DELETE FROM transactions").execute(db.pool()).await.is_err());
    }
}
