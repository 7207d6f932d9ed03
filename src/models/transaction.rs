//! Transaction record: one immutable journal row per committed balance-affecting event.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AccountId;

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Kind of balance-affecting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Buy,
    Sell,
    Deposit,
    Withdraw,
    Reward,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Buy => "BUY",
            TransactionKind::Sell => "SELL",
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Withdraw => "WITHDRAW",
            TransactionKind::Reward => "REWARD",
        }
    }

    pub fn is_trade(&self) -> bool {
        matches!(self, TransactionKind::Buy | TransactionKind::Sell)
    }
}

impl From<TradeSide> for TransactionKind {
    fn from(side: TradeSide) -> Self {
        match side {
            TradeSide::Buy => TransactionKind::Buy,
            TradeSide::Sell => TransactionKind::Sell,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(TransactionKind::Buy),
            "SELL" => Ok(TransactionKind::Sell),
            "DEPOSIT" => Ok(TransactionKind::Deposit),
            "WITHDRAW" => Ok(TransactionKind::Withdraw),
            "REWARD" => Ok(TransactionKind::Reward),
            other => Err(format!("unknown transaction type '{}'", other)),
        }
    }
}

/// Committed journal entry. Never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: Uuid,

    pub account_id: AccountId,

    #[serde(rename = "type")]
    pub kind: TransactionKind,

    /// Traded symbol, absent for cash movements
    pub symbol: Option<String>,

    /// Units traded, absent for cash movements
    pub quantity: Option<Decimal>,

    /// Unit price, absent for cash movements
    pub price: Option<Decimal>,

    /// Gross amount: quantity x price for trades, the moved amount otherwise
    pub amount: Decimal,

    pub fee: Decimal,

    /// Signed effect on the cash balance
    pub cash_impact: Decimal,

    /// Balance snapshot after this entry was applied
    pub balance_after: Decimal,

    /// Net realized P&L, SELL only
    pub realized_pnl: Option<Decimal>,

    pub note: Option<String>,

    pub idempotency_key: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Journal entry before it is appended. The log assigns `id` and `created_at`
/// when they are not supplied.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: Option<Uuid>,
    pub account_id: AccountId,
    pub kind: TransactionKind,
    pub symbol: Option<String>,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub fee: Decimal,
    pub cash_impact: Decimal,
    pub balance_after: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewTransaction {
    pub fn into_record(self, fallback_time: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            account_id: self.account_id,
            kind: self.kind,
            symbol: self.symbol,
            quantity: self.quantity,
            price: self.price,
            amount: self.amount,
            fee: self.fee,
            cash_impact: self.cash_impact,
            balance_after: self.balance_after,
            realized_pnl: self.realized_pnl,
            note: self.note,
            idempotency_key: self.idempotency_key,
            created_at: self.created_at.unwrap_or(fallback_time),
        }
    }
}
