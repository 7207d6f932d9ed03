//! Position book: per-symbol holdings at weighted-average cost.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;

use crate::db::{encode_decimal, encode_time, StoredPosition};
use crate::error::{LedgerError, Result};
use crate::models::{AccountId, Position};

/// Result of a sell against the book.
#[derive(Debug, Clone, PartialEq)]
pub struct SellFill {
    /// Average cost the sold units were carried at
    pub avg_price: Decimal,
    /// What is left of the position, `None` once it was closed and deleted
    pub remaining: Option<Position>,
}

pub struct PositionBook;

impl PositionBook {
    pub async fn get(conn: &mut SqliteConnection, account_id: &AccountId, symbol: &str) -> Result<Option<Position>> {
        sqlx::query_as::<_, StoredPosition>(
            r#"
            SELECT account_id, symbol, quantity, avg_price, opened_at, updated_at
            FROM positions WHERE account_id = ? AND symbol = ?
            "#,
        )
        .bind(account_id.as_str())
        .bind(symbol)
        .fetch_optional(&mut *conn)
        .await?
        .map(Position::try_from)
        .transpose()
    }

    /// All open positions, ordered by symbol.
    pub async fn list(conn: &mut SqliteConnection, account_id: &AccountId) -> Result<Vec<Position>> {
        sqlx::query_as::<_, StoredPosition>(
            r#"
            SELECT account_id, symbol, quantity, avg_price, opened_at, updated_at
            FROM positions WHERE account_id = ? ORDER BY symbol
            "#,
        )
        .bind(account_id.as_str())
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Position::try_from)
        .collect()
    }

    /// Open or average into a position.
    pub async fn apply_buy(
        conn: &mut SqliteConnection,
        account_id: &AccountId,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Position> {
        match Self::get(conn, account_id, symbol).await? {
            Some(mut position) => {
                position.add(quantity, price, now)?;
                Self::update(conn, &position).await?;
                Ok(position)
            }
            None => {
                let position = Position::open(account_id.clone(), symbol.to_string(), quantity, price, now);
                sqlx::query(
                    r#"
                    INSERT INTO positions (account_id, symbol, quantity, avg_price, opened_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(account_id.as_str())
                .bind(symbol)
                .bind(encode_decimal(position.quantity))
                .bind(encode_decimal(position.avg_price))
                .bind(encode_time(now))
                .bind(encode_time(now))
                .execute(&mut *conn)
                .await?;
                Ok(position)
            }
        }
    }

    /// Decrement a holding; no short selling. The row is deleted when it reaches zero.
    pub async fn apply_sell(
        conn: &mut SqliteConnection,
        account_id: &AccountId,
        symbol: &str,
        quantity: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SellFill> {
        let mut position = Self::get(conn, account_id, symbol)
            .await?
            .ok_or_else(|| LedgerError::InsufficientPosition {
                symbol: symbol.to_string(),
                requested: quantity,
                held: Decimal::ZERO,
            })?;

        let avg_price = position.reduce(quantity, now)?;

        if position.is_closed() {
            sqlx::query("DELETE FROM positions WHERE account_id = ? AND symbol = ?")
                .bind(account_id.as_str())
                .bind(symbol)
                .execute(&mut *conn)
                .await?;
            return Ok(SellFill { avg_price, remaining: None });
        }

        Self::update(conn, &position).await?;
        Ok(SellFill {
            avg_price,
            remaining: Some(position),
        })
    }

    async fn update(conn: &mut SqliteConnection, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET quantity = ?, avg_price = ?, updated_at = ?
            WHERE account_id = ? AND symbol = ?
            "#,
        )
        .bind(encode_decimal(position.quantity))
        .bind(encode_decimal(position.avg_price))
        .bind(encode_time(position.updated_at))
        .bind(position.account_id.as_str())
        .bind(&position.symbol)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, Database};
    use crate::ledger::Ledger;
    use rust_decimal_macros::dec;

    async fn setup(dir: &tempfile::TempDir) -> (Database, AccountId) {
        let db = Database::temporary(dir).await;
        let id = AccountId::parse("u1").unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        Ledger::create(&mut conn, &id, db::now()).await.unwrap();
        (db, id)
    }

    #[tokio::test]
    async fn test_buy_reweights_average_cost() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = setup(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        PositionBook::apply_buy(&mut conn, &id, "VNM", dec!(100), dec!(100), db::now()).await.unwrap();
        PositionBook::apply_buy(&mut conn, &id, "VNM", dec!(100), dec!(200), db::now()).await.unwrap();

        let stored = PositionBook::get(&mut conn, &id, "VNM").await.unwrap().unwrap();
        assert_eq!(stored.quantity, dec!(200));
        assert_eq!(stored.avg_price, dec!(150));
    }

    #[tokio::test]
    async fn test_sell_to_zero_deletes_row() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = setup(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        PositionBook::apply_buy(&mut conn, &id, "FPT", dec!(50), dec!(128500), db::now()).await.unwrap();
        let partial = PositionBook::apply_sell(&mut conn, &id, "FPT", dec!(20), db::now()).await.unwrap();
        assert_eq!(partial.avg_price, dec!(128500));
        assert_eq!(partial.remaining.unwrap().quantity, dec!(30));

        let closed = PositionBook::apply_sell(&mut conn, &id, "FPT", dec!(30), db::now()).await.unwrap();
        assert!(closed.remaining.is_none());
        assert!(PositionBook::get(&mut conn, &id, "FPT").await.unwrap().is_none());
        assert!(PositionBook::list(&mut conn, &id).await.unwrap().is_empty());

        // Re-entry starts from a fresh cost basis.
        let reopened = PositionBook::apply_buy(&mut conn, &id, "FPT", dec!(10), dec!(100000), db::now())
            .await
            .unwrap();
        assert_eq!(reopened.avg_price, dec!(100000));
    }

    #[tokio::test]
    async fn test_no_short_selling() {
        let dir = tempfile::tempdir().unwrap();
        let (db, id) = setup(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        let err = PositionBook::apply_sell(&mut conn, &id, "VCB", dec!(1), db::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientPosition { held, .. } if held.is_zero()));

        PositionBook::apply_buy(&mut conn, &id, "VCB", dec!(5), dec!(94200), db::now()).await.unwrap();
        let err = PositionBook::apply_sell(&mut conn, &id, "VCB", dec!(6), db::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientPosition { .. }));
        assert_eq!(
            PositionBook::get(&mut conn, &id, "VCB").await.unwrap().unwrap().quantity,
            dec!(5)
        );
    }
}
