//! Account query service: read-only views over one consistent snapshot.
//!
//! Each call reads balance, positions and history inside a single read
//! transaction, so a view never shows a trade in one part and not the other.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use sqlx::{Sqlite, Transaction};

use crate::config::LedgerConfig;
use crate::db::Database;
use crate::error::{LedgerError, Result};
use crate::models::{normalize_symbol, AccountId, Position, TransactionKind, TransactionRecord};

use super::journal::HistoryFilter;
use super::{Ledger, PositionBook, TransactionLog};

/// Lifetime totals shown on the wallet screen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub total_deposited: Decimal,
    pub total_withdrawn: Decimal,
    pub total_rewards: Decimal,
    pub total_fees: Decimal,
    pub realized_pnl: Decimal,
    pub trade_count: u64,
}

impl WalletSummary {
    fn absorb(mut self, record: &TransactionRecord) -> Self {
        match record.kind {
            TransactionKind::Deposit => self.total_deposited += record.amount,
            TransactionKind::Withdraw => self.total_withdrawn += record.amount,
            TransactionKind::Reward => self.total_rewards += record.amount,
            TransactionKind::Buy | TransactionKind::Sell => self.trade_count += 1,
        }
        self.total_fees += record.fee;
        self.realized_pnl += record.realized_pnl.unwrap_or_default();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletView {
    pub account_id: AccountId,
    pub balance: Decimal,
    /// Most recent entries, newest first
    pub transactions: Vec<TransactionRecord>,
    pub portfolio: Vec<Position>,
    pub summary: WalletSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub items: Vec<TransactionRecord>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingValuation {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub mark_price: Decimal,
    /// No mark was supplied; the average cost stands in
    pub mark_is_fallback: bool,
    pub cost_basis: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    /// Share of total equity, in percent
    pub weight: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioValuation {
    pub account_id: AccountId,
    pub cash: Decimal,
    pub holdings_value: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_equity: Decimal,
    pub holdings: Vec<HoldingValuation>,
}

#[derive(Clone)]
pub struct AccountQuery {
    db: Database,
    config: Arc<LedgerConfig>,
}

impl AccountQuery {
    pub fn new(db: Database, config: LedgerConfig) -> Self {
        Self {
            db,
            config: Arc::new(config),
        }
    }

    pub async fn balance(&self, account_id: &str) -> Result<Decimal> {
        let id = AccountId::parse(account_id)?;
        let mut tx = self.snapshot().await?;
        let balance = Ledger::get_balance(&mut tx, &id).await?;
        tx.commit().await?;
        Ok(balance)
    }

    pub async fn positions(&self, account_id: &str) -> Result<Vec<Position>> {
        let id = AccountId::parse(account_id)?;
        let mut tx = self.snapshot().await?;
        Ledger::get(&mut tx, &id).await?;
        let positions = PositionBook::list(&mut tx, &id).await?;
        tx.commit().await?;
        Ok(positions)
    }

    pub async fn wallet(&self, account_id: &str) -> Result<WalletView> {
        let id = AccountId::parse(account_id)?;
        let mut tx = self.snapshot().await?;

        let account = Ledger::get(&mut tx, &id).await?;
        let portfolio = PositionBook::list(&mut tx, &id).await?;
        let transactions = TransactionLog::list(&mut tx, &id, &HistoryFilter::default()).await?;
        let summary = TransactionLog::fold(&mut tx, &id, WalletSummary::default(), WalletSummary::absorb).await?;
        tx.commit().await?;

        Ok(WalletView {
            account_id: account.id,
            balance: account.balance,
            transactions,
            portfolio,
            summary,
        })
    }

    pub async fn history(&self, account_id: &str, filter: &HistoryFilter) -> Result<HistoryPage> {
        let id = AccountId::parse(account_id)?;
        let mut filter = filter.clone();
        if let Some(symbol) = &filter.symbol {
            filter.symbol = Some(normalize_symbol(symbol)?);
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(LedgerError::invalid("history range starts after it ends"));
            }
        }

        let mut tx = self.snapshot().await?;
        Ledger::get(&mut tx, &id).await?;
        let items = TransactionLog::list(&mut tx, &id, &filter).await?;
        let total = TransactionLog::count(&mut tx, &id, &filter).await?;
        tx.commit().await?;

        Ok(HistoryPage {
            items,
            total,
            limit: filter.effective_limit(),
            offset: filter.effective_offset(),
        })
    }

    /// Value holdings at externally supplied marks. A symbol without a mark is
    /// carried at its average cost.
    pub async fn valuation(&self, account_id: &str, marks: &HashMap<String, Decimal>) -> Result<PortfolioValuation> {
        let id = AccountId::parse(account_id)?;
        let marks = normalize_marks(marks)?;

        let mut tx = self.snapshot().await?;
        let account = Ledger::get(&mut tx, &id).await?;
        let positions = PositionBook::list(&mut tx, &id).await?;
        tx.commit().await?;

        Ok(value_portfolio(&self.config, account.id, account.balance, &positions, &marks))
    }

    async fn snapshot(&self) -> Result<Transaction<'static, Sqlite>> {
        self.db.begin().await
    }
}

fn normalize_marks(marks: &HashMap<String, Decimal>) -> Result<HashMap<String, Decimal>> {
    marks
        .iter()
        .map(|(symbol, price)| {
            if *price <= Decimal::ZERO {
                return Err(LedgerError::invalid(format!("mark for {} must be positive", symbol)));
            }
            Ok((normalize_symbol(symbol)?, *price))
        })
        .collect()
}

fn percent(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    (part / whole * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

fn value_portfolio(
    config: &LedgerConfig,
    account_id: AccountId,
    cash: Decimal,
    positions: &[Position],
    marks: &HashMap<String, Decimal>,
) -> PortfolioValuation {
    let mut holdings: Vec<HoldingValuation> = positions
        .iter()
        .map(|position| {
            let mark = marks.get(&position.symbol).copied();
            let mark_price = mark.unwrap_or(position.avg_price);
            let cost_basis = config.round_cash(position.cost_basis());
            let market_value = config.round_cash(position.quantity * mark_price);
            let unrealized_pnl = market_value - cost_basis;

            HoldingValuation {
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                avg_price: position.avg_price,
                mark_price,
                mark_is_fallback: mark.is_none(),
                cost_basis,
                market_value,
                unrealized_pnl,
                unrealized_pnl_pct: percent(unrealized_pnl, cost_basis),
                weight: Decimal::ZERO,
            }
        })
        .collect();

    let holdings_value: Decimal = holdings.iter().map(|h| h.market_value).sum();
    let cost_basis: Decimal = holdings.iter().map(|h| h.cost_basis).sum();
    let total_equity = cash + holdings_value;

    for holding in &mut holdings {
        holding.weight = percent(holding.market_value, total_equity);
    }

    PortfolioValuation {
        account_id,
        cash,
        holdings_value,
        cost_basis,
        unrealized_pnl: holdings_value - cost_basis,
        total_equity,
        holdings,
    }
}
