//! Data models for accounts, positions, transactions and requests.

mod account;
mod order;
mod position;
mod transaction;

pub use account::{Account, AccountId};
pub use order::{
    normalize_symbol, validate_cash_amount, CashKind, CashRequest, TradeQuote, TradeRequest,
    ValidatedCash, ValidatedTrade,
};
pub use position::Position;
pub use transaction::{NewTransaction, TradeSide, TransactionKind, TransactionRecord};
