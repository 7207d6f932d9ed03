//! Replay the transaction log and compare it with stored state.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::db::{self, Database};
use crate::error::Result;
use crate::models::{Account, AccountId, Position, TransactionKind, TransactionRecord};

use super::{Ledger, PositionBook, TransactionLog};

/// One disagreement between the journal and the stored balance or book.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "drift", rename_all = "camelCase")]
pub enum Drift {
    /// Sum of cash impacts differs from the ledger balance
    #[serde(rename_all = "camelCase")]
    Balance { expected: Decimal, actual: Decimal },

    /// A record's balance snapshot does not follow from the previous one
    #[serde(rename_all = "camelCase")]
    BalanceChain { id: Uuid, expected: Decimal, recorded: Decimal },

    #[serde(rename_all = "camelCase")]
    Position {
        symbol: String,
        expected_quantity: Decimal,
        actual_quantity: Decimal,
        expected_avg_price: Decimal,
        actual_avg_price: Decimal,
    },

    #[serde(rename_all = "camelCase")]
    MissingPosition { symbol: String, expected_quantity: Decimal },

    #[serde(rename_all = "camelCase")]
    UnexpectedPosition { symbol: String, actual_quantity: Decimal },

    /// A record cannot be replayed at all (e.g. a sell beyond the replayed holding)
    #[serde(rename_all = "camelCase")]
    Unreplayable { id: Uuid, reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub account_id: AccountId,
    pub balance: Decimal,
    pub journal_entries: usize,
    pub drifts: Vec<Drift>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.drifts.is_empty()
    }
}

pub struct Reconciler;

impl Reconciler {
    /// Check one account against its journal, reading a single snapshot.
    pub async fn reconcile(db: &Database, account_id: &str) -> Result<ReconcileReport> {
        let id = AccountId::parse(account_id)?;
        let mut tx = db.begin().await?;
        let account = Ledger::get(&mut tx, &id).await?;
        let positions = PositionBook::list(&mut tx, &id).await?;
        let journal = TransactionLog::all(&mut tx, &id).await?;
        tx.commit().await?;

        Ok(Self::replay(&account, &positions, &journal))
    }

    /// Rebuild balance and positions from `journal` (commit order) and diff
    /// them against the stored values.
    pub fn replay(account: &Account, positions: &[Position], journal: &[TransactionRecord]) -> ReconcileReport {
        let mut drifts = Vec::new();
        let mut running = Decimal::ZERO;
        let mut book: BTreeMap<String, Position> = BTreeMap::new();
        let now = db::now();

        for record in journal {
            running += record.cash_impact;
            if running != record.balance_after {
                drifts.push(Drift::BalanceChain {
                    id: record.id,
                    expected: running,
                    recorded: record.balance_after,
                });
            }

            if let Err(reason) = replay_trade(&mut book, account, record, now) {
                drifts.push(Drift::Unreplayable { id: record.id, reason });
            }
        }

        if running != account.balance {
            drifts.push(Drift::Balance {
                expected: running,
                actual: account.balance,
            });
        }

        for stored in positions {
            match book.remove(&stored.symbol) {
                Some(expected)
                    if expected.quantity != stored.quantity || expected.avg_price != stored.avg_price =>
                {
                    drifts.push(Drift::Position {
                        symbol: stored.symbol.clone(),
                        expected_quantity: expected.quantity,
                        actual_quantity: stored.quantity,
                        expected_avg_price: expected.avg_price,
                        actual_avg_price: stored.avg_price,
                    });
                }
                Some(_) => {}
                None => drifts.push(Drift::UnexpectedPosition {
                    symbol: stored.symbol.clone(),
                    actual_quantity: stored.quantity,
                }),
            }
        }
        for (symbol, expected) in book {
            drifts.push(Drift::MissingPosition {
                symbol,
                expected_quantity: expected.quantity,
            });
        }

        ReconcileReport {
            account_id: account.id.clone(),
            balance: account.balance,
            journal_entries: journal.len(),
            drifts,
        }
    }
}

fn replay_trade(
    book: &mut BTreeMap<String, Position>,
    account: &Account,
    record: &TransactionRecord,
    now: chrono::DateTime<chrono::Utc>,
) -> std::result::Result<(), String> {
    if !record.kind.is_trade() {
        return Ok(());
    }
    let (Some(symbol), Some(quantity), Some(price)) = (&record.symbol, record.quantity, record.price) else {
        return Err("trade record without symbol, quantity or price".to_string());
    };

    match record.kind {
        TransactionKind::Buy => match book.get_mut(symbol) {
            Some(position) => position.add(quantity, price, now).map_err(|e| e.to_string())?,
            None => {
                let opened = Position::open(account.id.clone(), symbol.clone(), quantity, price, now);
                book.insert(symbol.clone(), opened);
            }
        },
        _ => {
            let position = book
                .get_mut(symbol)
                .ok_or_else(|| format!("sell of {} with no replayed holding", symbol))?;
            position.reduce(quantity, now).map_err(|e| e.to_string())?;
            if position.is_closed() {
                book.remove(symbol);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::ledger::TradeEngine;
    use crate::models::{TradeRequest, TradeSide};
    use rust_decimal_macros::dec;

    async fn traded(dir: &tempfile::TempDir) -> TradeEngine {
        let db = Database::temporary(dir).await;
        let engine = TradeEngine::new(db, LedgerConfig::default()).unwrap();
        engine.open_account("u1", dec!(100000)).await.unwrap();

        for (side, symbol, quantity, price) in [
            (TradeSide::Buy, "VNM", dec!(3), dec!(101.37)),
            (TradeSide::Buy, "VNM", dec!(7), dec!(99.11)),
            (TradeSide::Buy, "FPT", dec!(5), dec!(250)),
            (TradeSide::Sell, "VNM", dec!(4), dec!(105)),
            (TradeSide::Sell, "FPT", dec!(5), dec!(240)),
        ] {
            engine
                .execute(&TradeRequest {
                    account_id: "u1".to_string(),
                    symbol: symbol.to_string(),
                    side,
                    quantity,
                    price,
                    idempotency_key: None,
                })
                .await
                .unwrap();
        }
        engine
    }

    #[tokio::test]
    async fn test_engine_output_reconciles() {
        let dir = tempfile::tempdir().unwrap();
        let engine = traded(&dir).await;

        let report = Reconciler::reconcile(engine.database(), "u1").await.unwrap();
        assert!(report.is_clean(), "{:?}", report.drifts);
        assert_eq!(report.journal_entries, 6);
    }

    #[tokio::test]
    async fn test_tampered_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = traded(&dir).await;
        let pool = engine.database().pool();

        sqlx::query("UPDATE accounts SET balance = '1' WHERE id = 'u1'")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("UPDATE positions SET quantity = '5' WHERE account_id = 'u1' AND symbol = 'VNM'")
            .execute(pool)
            .await
            .unwrap();

        let report = Reconciler::reconcile(engine.database(), "u1").await.unwrap();
        assert!(report
            .drifts
            .iter()
            .any(|d| matches!(d, Drift::Balance { actual, .. } if *actual == dec!(1))));
        assert!(report.drifts.iter().any(|d| matches!(
            d,
            Drift::Position { symbol, expected_quantity, .. } if symbol == "VNM" && *expected_quantity == dec!(6)
        )));
    }

    #[test]
    fn test_replay_flags_unexplained_positions() {
        let id = AccountId::parse("u1").unwrap();
        let now = db::now();
        let account = Account {
            id: id.clone(),
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };
        let orphan = Position::open(id, "HPG".to_string(), dec!(10), dec!(25), now);

        let report = Reconciler::replay(&account, &[orphan], &[]);
        assert_eq!(
            report.drifts,
            vec![Drift::UnexpectedPosition {
                symbol: "HPG".to_string(),
                actual_quantity: dec!(10),
            }]
        );
    }
}
