//! Trade execution engine.
//!
//! Turns one validated request into a single atomic unit over the ledger, the
//! position book and the transaction log:
//!
//! ```text
//! validate -> quote -> [account guard -> BEGIN -> lock row -> replay check
//!          -> balance / position -> append record -> COMMIT]
//! ```
//!
//! Anything after BEGIN that fails drops the sqlx transaction, which rolls the
//! whole unit back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::db::{self, Database};
use crate::error::{LedgerError, Result};
use crate::models::{
    validate_cash_amount, Account, AccountId, CashRequest, NewTransaction, TradeQuote, TradeRequest,
    TradeSide, TransactionKind, TransactionRecord, ValidatedCash, ValidatedTrade,
};

use super::{AccountLocks, Ledger, PositionBook, TransactionLog};

/// Committed (or replayed) result of an engine operation.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub record: TransactionRecord,
    /// True when an earlier commit with the same idempotency key was returned
    pub replayed: bool,
}

/// The only writer of account state.
#[derive(Clone)]
pub struct TradeEngine {
    db: Database,
    config: Arc<LedgerConfig>,
    locks: AccountLocks,
}

impl TradeEngine {
    pub fn new(db: Database, config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            db,
            config: Arc::new(config),
            locks: AccountLocks::new(),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create an account, crediting `initial_deposit` as a DEPOSIT record in the
    /// same unit so the journal explains the opening balance.
    pub async fn open_account(&self, raw_id: &str, initial_deposit: Decimal) -> Result<Account> {
        let account_id = AccountId::parse(raw_id)?;
        if initial_deposit < Decimal::ZERO {
            return Err(LedgerError::invalid("initial balance must not be negative"));
        }
        if !initial_deposit.is_zero() {
            validate_cash_amount(initial_deposit, &self.config)?;
        }

        let result = self
            .bounded(self.open_account_unit(&account_id, initial_deposit.normalize()))
            .await;

        match &result {
            Ok(account) => info!(account = %account.id, balance = %account.balance, "Account opened"),
            Err(e) => log_failure("open_account", &account_id, e),
        }
        result
    }

    async fn open_account_unit(&self, account_id: &AccountId, initial_deposit: Decimal) -> Result<Account> {
        let _guard = self.locks.acquire(account_id).await;
        let now = db::now();
        let mut tx = self.db.begin().await?;

        let mut account = Ledger::create(&mut tx, account_id, now).await?;
        if !initial_deposit.is_zero() {
            account.balance = Ledger::adjust_balance(&mut tx, account_id, initial_deposit, Decimal::ZERO, now).await?;
            TransactionLog::append(
                &mut tx,
                cash_entry(account_id, TransactionKind::Deposit, initial_deposit, initial_deposit, account.balance)
                    .with_note("initial deposit"),
                now,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(account)
    }

    /// Execute one BUY or SELL.
    pub async fn execute(&self, request: &TradeRequest) -> Result<TradeOutcome> {
        let order = match request.validate(&self.config) {
            Ok(order) => order,
            Err(e) => {
                warn!(account = %request.account_id, symbol = %request.symbol, error = %e, "Order rejected");
                return Err(e);
            }
        };
        let quote = TradeQuote::compute(order.side, order.quantity, order.price, &self.config)?;

        let result = self.bounded(self.execute_unit(&order, &quote)).await;

        match &result {
            Ok(outcome) if outcome.replayed => {
                debug!(account = %order.account_id, id = %outcome.record.id, "Replayed committed trade")
            }
            Ok(outcome) => info!(
                account = %order.account_id,
                symbol = %order.symbol,
                side = %order.side,
                quantity = %order.quantity,
                price = %order.price,
                fee = %quote.fee,
                balance_after = %outcome.record.balance_after,
                "Trade committed"
            ),
            Err(e) => log_failure("trade", &order.account_id, e),
        }
        result
    }

    async fn execute_unit(&self, order: &ValidatedTrade, quote: &TradeQuote) -> Result<TradeOutcome> {
        let account_id = &order.account_id;
        let _guard = self.locks.acquire(account_id).await;
        let now = db::now();
        let mut tx = self.db.begin().await?;

        Ledger::lock(&mut tx, account_id, now).await?;

        if let Some(key) = &order.idempotency_key {
            if let Some(existing) = TransactionLog::find_by_idempotency_key(&mut tx, account_id, key).await? {
                ensure_same_trade(&existing, order)?;
                tx.rollback().await?;
                return Ok(TradeOutcome {
                    record: existing,
                    replayed: true,
                });
            }
        }

        let (balance_after, realized_pnl) = match order.side {
            TradeSide::Buy => {
                let balance =
                    Ledger::adjust_balance(&mut tx, account_id, quote.cash_impact, Decimal::ZERO, now).await?;
                PositionBook::apply_buy(&mut tx, account_id, &order.symbol, order.quantity, order.price, now).await?;
                (balance, None)
            }
            TradeSide::Sell => {
                let fill = PositionBook::apply_sell(&mut tx, account_id, &order.symbol, order.quantity, now).await?;
                let pnl = (order.price - fill.avg_price)
                    .checked_mul(order.quantity)
                    .and_then(|spread| spread.checked_sub(quote.fee))
                    .map(|pnl| self.config.round_cash(pnl))
                    .ok_or_else(|| LedgerError::invalid("realized pnl overflows"))?;
                let balance =
                    Ledger::adjust_balance(&mut tx, account_id, quote.cash_impact, Decimal::ZERO, now).await?;
                (balance, Some(pnl))
            }
        };

        let record = TransactionLog::append(
            &mut tx,
            NewTransaction {
                id: None,
                account_id: account_id.clone(),
                kind: order.side.into(),
                symbol: Some(order.symbol.clone()),
                quantity: Some(order.quantity),
                price: Some(order.price),
                amount: quote.gross,
                fee: quote.fee,
                cash_impact: quote.cash_impact,
                balance_after,
                realized_pnl,
                note: None,
                idempotency_key: order.idempotency_key.clone(),
                created_at: None,
            },
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(TradeOutcome {
            record,
            replayed: false,
        })
    }

    /// Deposit, withdraw or reward. Withdrawals honour the zero floor.
    pub async fn apply_cash(&self, request: &CashRequest) -> Result<TradeOutcome> {
        let cash = match request.validate(&self.config) {
            Ok(cash) => cash,
            Err(e) => {
                warn!(account = %request.account_id, error = %e, "Cash movement rejected");
                return Err(e);
            }
        };

        let result = self.bounded(self.cash_unit(&cash)).await;

        match &result {
            Ok(outcome) if outcome.replayed => {
                debug!(account = %cash.account_id, id = %outcome.record.id, "Replayed committed cash movement")
            }
            Ok(outcome) => info!(
                account = %cash.account_id,
                kind = %outcome.record.kind,
                amount = %cash.amount,
                balance_after = %outcome.record.balance_after,
                "Cash movement committed"
            ),
            Err(e) => log_failure("cash", &cash.account_id, e),
        }
        result
    }

    async fn cash_unit(&self, cash: &ValidatedCash) -> Result<TradeOutcome> {
        let account_id = &cash.account_id;
        let _guard = self.locks.acquire(account_id).await;
        let now = db::now();
        let mut tx = self.db.begin().await?;

        Ledger::lock(&mut tx, account_id, now).await?;

        if let Some(key) = &cash.idempotency_key {
            if let Some(existing) = TransactionLog::find_by_idempotency_key(&mut tx, account_id, key).await? {
                if existing.kind != TransactionKind::from(cash.kind) || existing.amount != cash.amount {
                    return Err(key_reused());
                }
                tx.rollback().await?;
                return Ok(TradeOutcome {
                    record: existing,
                    replayed: true,
                });
            }
        }

        let impact = cash.cash_impact();
        let balance_after = Ledger::adjust_balance(&mut tx, account_id, impact, Decimal::ZERO, now).await?;

        let mut entry = cash_entry(account_id, cash.kind.into(), cash.amount, impact, balance_after);
        entry.note = cash.note.clone();
        entry.idempotency_key = cash.idempotency_key.clone();
        let record = TransactionLog::append(&mut tx, entry, now).await?;

        tx.commit().await?;
        Ok(TradeOutcome {
            record,
            replayed: false,
        })
    }

    /// `execute` for callers that cannot tell whether a failed attempt committed.
    ///
    /// Assigns an idempotency key once when the request has none, then retries
    /// `Conflict` and `Timeout` with exponential backoff until the retry budget
    /// runs out.
    pub async fn execute_with_retry(&self, mut request: TradeRequest) -> Result<TradeOutcome> {
        request.idempotency_key.get_or_insert_with(|| Uuid::new_v4().to_string());
        let request = &request;
        self.with_retry(move || self.execute(request)).await
    }

    pub async fn apply_cash_with_retry(&self, mut request: CashRequest) -> Result<TradeOutcome> {
        request.idempotency_key.get_or_insert_with(|| Uuid::new_v4().to_string());
        let request = &request;
        self.with_retry(move || self.apply_cash(request)).await
    }

    async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(self.config.retry_budget))
            .build();

        backoff::future::retry(policy, || {
            let attempt = operation();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_retriable() {
                        warn!(error = %e, "Transient failure, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    /// Bound a unit (lock wait included) by the trade timeout. Dropping the
    /// future on expiry rolls back any open transaction.
    async fn bounded<T>(&self, unit: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.trade_timeout, unit)
            .await
            .map_err(|_| LedgerError::Timeout(self.config.trade_timeout_ms()))?
    }
}

fn cash_entry(
    account_id: &AccountId,
    kind: TransactionKind,
    amount: Decimal,
    cash_impact: Decimal,
    balance_after: Decimal,
) -> NewTransaction {
    NewTransaction {
        id: None,
        account_id: account_id.clone(),
        kind,
        symbol: None,
        quantity: None,
        price: None,
        amount,
        fee: Decimal::ZERO,
        cash_impact,
        balance_after,
        realized_pnl: None,
        note: None,
        idempotency_key: None,
        created_at: None,
    }
}

impl NewTransaction {
    fn with_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }
}

fn ensure_same_trade(existing: &TransactionRecord, order: &ValidatedTrade) -> Result<()> {
    let same = existing.kind == TransactionKind::from(order.side)
        && existing.symbol.as_deref() == Some(order.symbol.as_str())
        && existing.quantity == Some(order.quantity)
        && existing.price == Some(order.price);
    if same {
        Ok(())
    } else {
        Err(key_reused())
    }
}

fn key_reused() -> LedgerError {
    LedgerError::invalid("idempotency key was already used for a different request")
}

fn log_failure(operation: &str, account_id: &AccountId, err: &LedgerError) {
    match err {
        LedgerError::Storage(_) | LedgerError::CorruptValue { .. } => {
            error!(operation, account = %account_id, error = %err, "Atomic unit failed, rolled back")
        }
        _ => warn!(operation, account = %account_id, error = %err, "Request rejected"),
    }
}
