//! Inbound requests to the engine and their validation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::{LedgerConfig, QuantityMode, PRICE_SCALE};
use crate::error::{LedgerError, Result};

use super::{AccountId, TradeSide, TransactionKind};

const MAX_SYMBOL_LEN: usize = 12;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const MAX_NOTE_LEN: usize = 256;

/// A buy or sell request as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub account_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub idempotency_key: Option<String>,
}

/// A trade request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTrade {
    pub account_id: AccountId,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub idempotency_key: Option<String>,
}

impl TradeRequest {
    /// Reject malformed orders before any state is touched.
    pub fn validate(&self, config: &LedgerConfig) -> Result<ValidatedTrade> {
        let account_id = AccountId::parse(&self.account_id)?;
        let symbol = normalize_symbol(&self.symbol)?;

        if self.quantity <= Decimal::ZERO {
            return Err(LedgerError::invalid("quantity must be positive"));
        }
        match config.quantity_mode {
            QuantityMode::Whole if !self.quantity.fract().is_zero() => {
                return Err(LedgerError::invalid("fractional quantities are not allowed"));
            }
            QuantityMode::Fractional if self.quantity.normalize().scale() > config.quantity_scale => {
                return Err(LedgerError::invalid(format!(
                    "quantity has more than {} decimal places",
                    config.quantity_scale
                )));
            }
            _ => {}
        }

        if self.price <= Decimal::ZERO {
            return Err(LedgerError::invalid("price must be positive"));
        }
        if self.price.normalize().scale() > PRICE_SCALE {
            return Err(LedgerError::invalid(format!(
                "price has more than {} decimal places",
                PRICE_SCALE
            )));
        }

        Ok(ValidatedTrade {
            account_id,
            symbol,
            side: self.side,
            quantity: self.quantity.normalize(),
            price: self.price.normalize(),
            idempotency_key: validate_idempotency_key(self.idempotency_key.as_deref())?,
        })
    }
}

/// Cash figures of a trade, rounded to the currency's minor unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeQuote {
    /// quantity x price
    pub gross: Decimal,
    pub fee: Decimal,
    /// -(gross + fee) for BUY, +(gross - fee) for SELL
    pub cash_impact: Decimal,
}

impl TradeQuote {
    pub fn compute(side: TradeSide, quantity: Decimal, price: Decimal, config: &LedgerConfig) -> Result<Self> {
        let overflow = || LedgerError::invalid("order value overflows");

        let gross = quantity
            .checked_mul(price)
            .map(|g| config.round_cash(g))
            .ok_or_else(overflow)?;
        let fee = gross
            .checked_mul(config.fee_rate)
            .map(|f| config.round_cash(f))
            .ok_or_else(overflow)?;
        let cash_impact = match side {
            TradeSide::Buy => gross.checked_add(fee).map(|total| -total),
            TradeSide::Sell => gross.checked_sub(fee),
        }
        .ok_or_else(overflow)?;
        Ok(Self { gross, fee, cash_impact })
    }
}

/// Non-trade cash movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CashKind {
    Deposit,
    Withdraw,
    Reward,
}

impl From<CashKind> for TransactionKind {
    fn from(kind: CashKind) -> Self {
        match kind {
            CashKind::Deposit => TransactionKind::Deposit,
            CashKind::Withdraw => TransactionKind::Withdraw,
            CashKind::Reward => TransactionKind::Reward,
        }
    }
}

/// Deposit, withdrawal or reward request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashRequest {
    pub account_id: String,
    pub kind: CashKind,
    pub amount: Decimal,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCash {
    pub account_id: AccountId,
    pub kind: CashKind,
    pub amount: Decimal,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
}

impl ValidatedCash {
    pub fn cash_impact(&self) -> Decimal {
        match self.kind {
            CashKind::Withdraw => -self.amount,
            CashKind::Deposit | CashKind::Reward => self.amount,
        }
    }
}

impl CashRequest {
    pub fn validate(&self, config: &LedgerConfig) -> Result<ValidatedCash> {
        let account_id = AccountId::parse(&self.account_id)?;
        validate_cash_amount(self.amount, config)?;

        let note = match self.note.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(n) if n.chars().count() > MAX_NOTE_LEN => {
                return Err(LedgerError::invalid(format!(
                    "note longer than {} characters",
                    MAX_NOTE_LEN
                )));
            }
            Some(n) => Some(n.to_string()),
        };

        Ok(ValidatedCash {
            account_id,
            kind: self.kind,
            amount: self.amount.normalize(),
            note,
            idempotency_key: validate_idempotency_key(self.idempotency_key.as_deref())?,
        })
    }
}

/// Positive amount expressed in whole minor units.
pub fn validate_cash_amount(amount: Decimal, config: &LedgerConfig) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::invalid("amount must be positive"));
    }
    if amount.normalize().scale() > config.currency_scale {
        return Err(LedgerError::invalid(format!(
            "amount has more than {} decimal places",
            config.currency_scale
        )));
    }
    Ok(())
}

/// Trim and upper-case a ticker, rejecting anything that is not a plain symbol.
pub fn normalize_symbol(raw: &str) -> Result<String> {
    let symbol = raw.trim().to_ascii_uppercase();
    let mut chars = symbol.chars();

    let well_formed = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        }
        _ => false,
    };

    if !well_formed || symbol.len() > MAX_SYMBOL_LEN {
        return Err(LedgerError::invalid(format!("malformed symbol '{}'", raw)));
    }
    Ok(symbol)
}

fn validate_idempotency_key(key: Option<&str>) -> Result<Option<String>> {
    match key.map(str::trim) {
        None => Ok(None),
        Some("") => Err(LedgerError::invalid("idempotency key must not be empty")),
        Some(k) if k.len() > MAX_IDEMPOTENCY_KEY_LEN => Err(LedgerError::invalid(format!(
            "idempotency key longer than {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        ))),
        Some(k) => Ok(Some(k.to_string())),
    }
}
