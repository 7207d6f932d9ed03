//! Position model: an account's holding of one symbol at a weighted-average cost.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::config::AVG_COST_SCALE;
use crate::error::{LedgerError, Result};

use super::AccountId;

/// Open holding in one symbol. A position never exists at zero quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub account_id: AccountId,

    /// Normalized ticker symbol
    pub symbol: String,

    /// Units held, always positive while the position exists
    pub quantity: Decimal,

    /// Weighted-average purchase price per unit
    pub avg_price: Decimal,

    pub opened_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Open a position from its first buy.
    pub fn open(
        account_id: AccountId,
        symbol: String,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id,
            symbol,
            quantity,
            avg_price: price,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Add to position, reweighting the average cost.
    pub fn add(&mut self, quantity: Decimal, price: Decimal, now: DateTime<Utc>) -> Result<()> {
        let overflow = || LedgerError::invalid("order size overflows position arithmetic");

        let held_cost = self.avg_price.checked_mul(self.quantity).ok_or_else(overflow)?;
        let new_cost = price.checked_mul(quantity).ok_or_else(overflow)?;
        let total_cost = held_cost.checked_add(new_cost).ok_or_else(overflow)?;
        let new_quantity = self.quantity.checked_add(quantity).ok_or_else(overflow)?;

        self.avg_price = (total_cost / new_quantity)
            .round_dp_with_strategy(AVG_COST_SCALE, RoundingStrategy::MidpointAwayFromZero)
            .normalize();
        self.quantity = new_quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Reduce position size. Returns the average cost the units were carried at.
    pub fn reduce(&mut self, quantity: Decimal, now: DateTime<Utc>) -> Result<Decimal> {
        if quantity > self.quantity {
            return Err(LedgerError::InsufficientPosition {
                symbol: self.symbol.clone(),
                requested: quantity,
                held: self.quantity,
            });
        }

        self.quantity -= quantity;
        self.updated_at = now;
        Ok(self.avg_price)
    }

    /// A closed position must be deleted rather than kept at zero.
    pub fn is_closed(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Total cost carried (quantity x average cost).
    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.avg_price
    }
}
