//! Transaction log: the append-only audit trail of an account.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::{encode_decimal, encode_time, StoredTransaction, TRANSACTION_COLUMNS};
use crate::error::{LedgerError, Result};
use crate::models::{AccountId, NewTransaction, TransactionKind, TransactionRecord};

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 500;

/// History selection. All filters are optional and combine with AND.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub symbol: Option<String>,
    pub kind: Option<TransactionKind>,
    /// Inclusive lower bound on `created_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl HistoryFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }

    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    fn push_conditions(&self, builder: &mut QueryBuilder<'_, Sqlite>, account_id: &AccountId) {
        builder.push(" WHERE account_id = ");
        builder.push_bind(account_id.as_str().to_string());
        if let Some(symbol) = &self.symbol {
            builder.push(" AND symbol = ");
            builder.push_bind(symbol.clone());
        }
        if let Some(kind) = self.kind {
            builder.push(" AND kind = ");
            builder.push_bind(kind.as_str());
        }
        if let Some(from) = self.from {
            builder.push(" AND created_at >= ");
            builder.push_bind(encode_time(from));
        }
        if let Some(to) = self.to {
            builder.push(" AND created_at < ");
            builder.push_bind(encode_time(to));
        }
    }
}

pub struct TransactionLog;

impl TransactionLog {
    /// Write one immutable record. Must be the last write of the atomic unit.
    pub async fn append(conn: &mut SqliteConnection, entry: NewTransaction, now: DateTime<Utc>) -> Result<TransactionRecord> {
        let record = entry.into_record(now);

        let inserted = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, account_id, kind, symbol, quantity, price, amount, fee,
                cash_impact, balance_after, realized_pnl, note, idempotency_key, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.account_id.as_str())
        .bind(record.kind.as_str())
        .bind(record.symbol.as_deref())
        .bind(record.quantity.map(encode_decimal))
        .bind(record.price.map(encode_decimal))
        .bind(encode_decimal(record.amount))
        .bind(encode_decimal(record.fee))
        .bind(encode_decimal(record.cash_impact))
        .bind(encode_decimal(record.balance_after))
        .bind(record.realized_pnl.map(encode_decimal))
        .bind(record.note.as_deref())
        .bind(record.idempotency_key.as_deref())
        .bind(encode_time(record.created_at))
        .execute(&mut *conn)
        .await;

        match inserted {
            Ok(_) => Ok(record),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(LedgerError::Conflict(
                format!("idempotency key already committed for {}", record.account_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_idempotency_key(
        conn: &mut SqliteConnection,
        account_id: &AccountId,
        key: &str,
    ) -> Result<Option<TransactionRecord>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE account_id = ? AND idempotency_key = ?",
            TRANSACTION_COLUMNS
        );
        sqlx::query_as::<_, StoredTransaction>(&sql)
            .bind(account_id.as_str())
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?
            .map(TransactionRecord::try_from)
            .transpose()
    }

    /// Every record of the account in commit order.
    pub async fn all(conn: &mut SqliteConnection, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE account_id = ? ORDER BY seq ASC",
            TRANSACTION_COLUMNS
        );
        sqlx::query_as::<_, StoredTransaction>(&sql)
            .bind(account_id.as_str())
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(TransactionRecord::try_from)
            .collect()
    }

    /// Fold every record of the account in commit order, streaming rows
    /// instead of loading the whole journal.
    pub async fn fold<T, F>(conn: &mut SqliteConnection, account_id: &AccountId, init: T, mut f: F) -> Result<T>
    where
        F: FnMut(T, &TransactionRecord) -> T,
    {
        let sql = format!(
            "SELECT {} FROM transactions WHERE account_id = ? ORDER BY seq ASC",
            TRANSACTION_COLUMNS
        );
        let mut rows = sqlx::query_as::<_, StoredTransaction>(&sql)
            .bind(account_id.as_str())
            .fetch(&mut *conn);

        let mut acc = init;
        while let Some(row) = rows.try_next().await? {
            acc = f(acc, &TransactionRecord::try_from(row)?);
        }
        Ok(acc)
    }

    /// One page of history, newest first.
    pub async fn list(
        conn: &mut SqliteConnection,
        account_id: &AccountId,
        filter: &HistoryFilter,
    ) -> Result<Vec<TransactionRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM transactions", TRANSACTION_COLUMNS));
        filter.push_conditions(&mut builder, account_id);
        builder.push(" ORDER BY seq DESC LIMIT ");
        builder.push_bind(i64::from(filter.effective_limit()));
        builder.push(" OFFSET ");
        builder.push_bind(i64::from(filter.effective_offset()));

        builder
            .build_query_as::<StoredTransaction>()
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(TransactionRecord::try_from)
            .collect()
    }

    /// Number of records matching the filter, ignoring limit and offset.
    pub async fn count(conn: &mut SqliteConnection, account_id: &AccountId, filter: &HistoryFilter) -> Result<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM transactions");
        filter.push_conditions(&mut builder, account_id);

        let total = builder.build_query_scalar::<i64>().fetch_one(&mut *conn).await?;
        Ok(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, Database};
    use crate::ledger::Ledger;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn deposit(id: &AccountId, amount: Decimal, balance_after: Decimal, key: Option<&str>) -> NewTransaction {
        NewTransaction {
            id: None,
            account_id: id.clone(),
            kind: TransactionKind::Deposit,
            symbol: None,
            quantity: None,
            price: None,
            amount,
            fee: Decimal::ZERO,
            cash_impact: amount,
            balance_after,
            realized_pnl: None,
            note: None,
            idempotency_key: key.map(str::to_string),
            created_at: None,
        }
    }

    fn buy(id: &AccountId, symbol: &str, balance_after: Decimal) -> NewTransaction {
        NewTransaction {
            kind: TransactionKind::Buy,
            symbol: Some(symbol.to_string()),
            quantity: Some(dec!(1)),
            price: Some(dec!(10)),
            amount: dec!(10),
            fee: dec!(0.01),
            cash_impact: dec!(-10.01),
            ..deposit(id, dec!(10), balance_after, None)
        }
    }

    async fn setup(dir: &tempfile::TempDir) -> (Database, AccountId) {
        let db = Database::temporary(dir).await;
        let id = AccountId::parse("u1").unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        Ledger::create(&mut conn, &id, db::now()).await.unwrap();
        (db, id)
    }

    #[tokio::test]
    async fn test_append_assigns_id_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = setup(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        let now = db::now();
        let first = TransactionLog::append(&mut conn, deposit(&id, dec!(100), dec!(100), None), now)
            .await
            .unwrap();
        let second = TransactionLog::append(&mut conn, deposit(&id, dec!(5), dec!(105), None), now)
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.created_at, now);

        let all = TransactionLog::all(&mut conn, &id).await.unwrap();
        assert_eq!(all, vec![first, second]);
    }

    #[tokio::test]
    async fn test_idempotency_key_lookup_and_uniqueness() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = setup(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        let stored = TransactionLog::append(&mut conn, deposit(&id, dec!(1), dec!(1), Some("k1")), db::now())
            .await
            .unwrap();
        let found = TransactionLog::find_by_idempotency_key(&mut conn, &id, "k1").await.unwrap();
        assert_eq!(found, Some(stored));
        assert!(TransactionLog::find_by_idempotency_key(&mut conn, &id, "k2").await.unwrap().is_none());

        let dup = TransactionLog::append(&mut conn, deposit(&id, dec!(1), dec!(2), Some("k1")), db::now())
            .await
            .unwrap_err();
        assert!(matches!(dup, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_filters_and_pages_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = setup(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        TransactionLog::append(&mut conn, deposit(&id, dec!(100), dec!(100), None), db::now()).await.unwrap();
        for (i, symbol) in ["VNM", "FPT", "VNM"].iter().enumerate() {
            let balance = dec!(100) - Decimal::from(i as u32 + 1) * dec!(10.01);
            TransactionLog::append(&mut conn, buy(&id, symbol, balance), db::now()).await.unwrap();
        }

        let everything = HistoryFilter::default();
        let page = TransactionLog::list(&mut conn, &id, &everything).await.unwrap();
        assert_eq!(page.len(), 4);
        assert_eq!(page[0].symbol.as_deref(), Some("VNM"));
        assert_eq!(page[3].kind, TransactionKind::Deposit);

        let vnm = HistoryFilter {
            symbol: Some("VNM".to_string()),
            ..Default::default()
        };
        assert_eq!(TransactionLog::count(&mut conn, &id, &vnm).await.unwrap(), 2);

        let deposits = HistoryFilter {
            kind: Some(TransactionKind::Deposit),
            ..Default::default()
        };
        assert_eq!(TransactionLog::list(&mut conn, &id, &deposits).await.unwrap().len(), 1);

        let second_page = HistoryFilter {
            limit: Some(2),
            offset: Some(2),
            ..Default::default()
        };
        let rows = TransactionLog::list(&mut conn, &id, &second_page).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].kind, TransactionKind::Deposit);
        assert_eq!(TransactionLog::count(&mut conn, &id, &second_page).await.unwrap(), 4);

        let future = HistoryFilter {
            from: Some(db::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(TransactionLog::list(&mut conn, &id, &future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fold_visits_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = setup(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        TransactionLog::append(&mut conn, deposit(&id, dec!(100), dec!(100), None), db::now())
            .await
            .unwrap();
        TransactionLog::append(&mut conn, buy(&id, "VNM", dec!(89.99)), db::now())
            .await
            .unwrap();

        let init = (Vec::new(), Decimal::ZERO);
        let (balances, impact) = TransactionLog::fold(&mut conn, &id, init, |(mut seen, sum), record| {
            seen.push(record.balance_after);
            (seen, sum + record.cash_impact)
        })
        .await
        .unwrap();
        assert_eq!(balances, vec![dec!(100), dec!(89.99)]);
        assert_eq!(impact, dec!(89.99));

        let other = AccountId::parse("nobody").unwrap();
        let count = TransactionLog::fold(&mut conn, &other, 0u32, |n, _| n + 1).await.unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_limit_is_clamped() {
        let filter = HistoryFilter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), MAX_HISTORY_LIMIT);
        assert_eq!(HistoryFilter::default().effective_limit(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(
            HistoryFilter {
                limit: Some(0),
                ..Default::default()
            }
            .effective_limit(),
            1
        );
    }
}
