//! Configuration for the operation gate

use balance_ledger::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Currencies that may carry a `GATE_MINIMUM_BALANCE_<CODE>` override
const ENV_CURRENCIES: [Currency; 5] = [
    Currency::BRL,
    Currency::USD,
    Currency::EUR,
    Currency::GBP,
    Currency::JPY,
];

/// Gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Smallest positive amount a single operation may spend
    pub min_operation_size: Decimal,

    /// Minimum balance to operate, keyed by ISO currency code
    #[serde(default)]
    pub default_minimum_balance: BTreeMap<String, Decimal>,

    /// Open operations a user may hold at once
    pub max_concurrent_operations: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_operation_size: Decimal::ONE,
            default_minimum_balance: BTreeMap::new(),
            max_concurrent_operations: 5,
        }
    }
}

impl GateConfig {
    /// Configured minimum balance for a currency (zero when unset)
    pub fn default_minimum_for(&self, currency: Currency) -> Decimal {
        self.default_minimum_balance
            .get(currency.code())
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("GATE_MIN_OPERATION_SIZE") {
            config.min_operation_size = parse_decimal("GATE_MIN_OPERATION_SIZE", &size)?;
        }

        if let Ok(cap) = std::env::var("GATE_MAX_CONCURRENT_OPERATIONS") {
            config.max_concurrent_operations = cap.parse().map_err(|e| {
                crate::Error::Config(format!("GATE_MAX_CONCURRENT_OPERATIONS: {}", e))
            })?;
        }

        for currency in ENV_CURRENCIES {
            let key = format!("GATE_MINIMUM_BALANCE_{}", currency.code());
            if let Ok(value) = std::env::var(&key) {
                config
                    .default_minimum_balance
                    .insert(currency.code().to_string(), parse_decimal(&key, &value)?);
            }
        }

        Ok(config)
    }
}

fn parse_decimal(key: &str, value: &str) -> crate::Result<Decimal> {
    Decimal::from_str(value).map_err(|e| crate::Error::Config(format!("{}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_currency_minimum_is_zero() {
        let config = GateConfig::default();
        assert_eq!(config.default_minimum_for(Currency::BRL), Decimal::ZERO);
    }

    #[test]
    fn test_parse_toml() {
        let config: GateConfig = toml::from_str(
            r#"
            min_operation_size = "5.00"
            max_concurrent_operations = 3

            [default_minimum_balance]
            BRL = "50.00"
        "#,
        )
        .unwrap();

        assert_eq!(config.min_operation_size, Decimal::new(500, 2));
        assert_eq!(config.max_concurrent_operations, 3);
        assert_eq!(config.default_minimum_for(Currency::BRL), Decimal::new(5000, 2));
        assert_eq!(config.default_minimum_for(Currency::USD), Decimal::ZERO);
    }
}
