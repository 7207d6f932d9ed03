//! Ledger configuration: fee schedule, rounding and order limits.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Decimal places kept on a position's average cost.
pub const AVG_COST_SCALE: u32 = 10;

/// Maximum decimal places accepted on a unit price.
pub const PRICE_SCALE: u32 = 8;

/// Whether positions may hold fractional shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantityMode {
    Whole,
    Fractional,
}

impl fmt::Display for QuantityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantityMode::Whole => write!(f, "whole"),
            QuantityMode::Fractional => write!(f, "fractional"),
        }
    }
}

impl FromStr for QuantityMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "whole" => Ok(QuantityMode::Whole),
            "fractional" => Ok(QuantityMode::Fractional),
            other => Err(format!("unknown quantity mode '{}', expected whole or fractional", other)),
        }
    }
}

/// Configuration for the trade engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Fee charged on gross trade value (0.0 to 1.0)
    pub fee_rate: Decimal,

    /// Decimal places of the currency's minor unit
    pub currency_scale: u32,

    /// Whole or fractional share quantities
    pub quantity_mode: QuantityMode,

    /// Decimal places accepted in fractional mode
    pub quantity_scale: u32,

    /// Upper bound on a single atomic unit, lock wait included
    pub trade_timeout: Duration,

    /// Total time a retrying caller keeps retrying transient failures
    pub retry_budget: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            fee_rate: dec!(0.001), // 0.1%
            currency_scale: 2,
            quantity_mode: QuantityMode::Whole,
            quantity_scale: 4,
            trade_timeout: Duration::from_secs(5),
            retry_budget: Duration::from_secs(15),
        }
    }
}

impl LedgerConfig {
    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            return Err(LedgerError::invalid(format!(
                "fee rate must be in [0, 1), got {}",
                self.fee_rate
            )));
        }
        if self.currency_scale > 8 {
            return Err(LedgerError::invalid("currency scale must be at most 8"));
        }
        if self.quantity_scale > 8 {
            return Err(LedgerError::invalid("quantity scale must be at most 8"));
        }
        if self.trade_timeout.is_zero() {
            return Err(LedgerError::invalid("trade timeout must be positive"));
        }
        Ok(())
    }

    /// Round a cash amount to the currency's minor unit.
    pub fn round_cash(&self, amount: Decimal) -> Decimal {
        amount
            .round_dp_with_strategy(self.currency_scale, RoundingStrategy::MidpointAwayFromZero)
            .normalize()
    }

    pub fn trade_timeout_ms(&self) -> u64 {
        self.trade_timeout.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fee_rate, dec!(0.001));
        assert_eq!(config.quantity_mode, QuantityMode::Whole);
    }

    #[test]
    fn test_fee_rate_bounds() {
        let mut config = LedgerConfig::default();
        config.fee_rate = dec!(1);
        assert!(config.validate().is_err());
        config.fee_rate = dec!(-0.01);
        assert!(config.validate().is_err());
        config.fee_rate = dec!(0.0015);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_round_cash_midpoint_away_from_zero() {
        let config = LedgerConfig::default();
        assert_eq!(config.round_cash(dec!(10.005)), dec!(10.01));
        assert_eq!(config.round_cash(dec!(10.004)), dec!(10));
        assert_eq!(config.round_cash(dec!(-10.005)), dec!(-10.01));
    }

    #[test]
    fn test_quantity_mode_parse() {
        assert_eq!("Whole".parse::<QuantityMode>().unwrap(), QuantityMode::Whole);
        assert_eq!("fractional".parse::<QuantityMode>().unwrap(), QuantityMode::Fractional);
        assert!("lots".parse::<QuantityMode>().is_err());
    }
}
