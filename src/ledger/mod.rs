//! Ledger core: cash balances, positions, the journal and the engine that
//! writes all three together.

mod accounts;
mod engine;
pub mod journal;
mod locks;
mod positions;
mod query;
mod reconcile;

pub use accounts::Ledger;
pub use engine::{TradeEngine, TradeOutcome};
pub use journal::{HistoryFilter, TransactionLog};
pub use locks::AccountLocks;
pub use positions::{PositionBook, SellFill};
pub use query::{AccountQuery, HistoryPage, HoldingValuation, PortfolioValuation, WalletSummary, WalletView};
pub use reconcile::{Drift, ReconcileReport, Reconciler};
