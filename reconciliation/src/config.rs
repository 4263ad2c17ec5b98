//! Configuration for the reconciliation engine

use serde::{Deserialize, Serialize};

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Gateway name payments are registered under
    pub provider: String,

    /// Largest amount difference still treated as equal (minor units)
    pub amount_tolerance_minor_units: i64,

    /// Gateway query client
    pub gateway: GatewayConfig,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            provider: "stripe".to_string(),
            amount_tolerance_minor_units: 1,
            gateway: GatewayConfig::default(),
        }
    }
}

/// Gateway query client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// API base URL
    pub base_url: String,

    /// Secret API key (bearer)
    pub api_key: String,

    /// Records per page
    pub page_size: u32,

    /// Per-request timeout (milliseconds)
    pub request_timeout_ms: u64,

    /// Attempts per page before giving up
    pub max_retries: u32,

    /// First retry delay (milliseconds)
    pub initial_backoff_ms: u64,

    /// Retry delay cap (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.stripe.com/v1".to_string(),
            api_key: String::new(),
            page_size: 100,
            request_timeout_ms: 30_000,
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl ReconciliationConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `RECON_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(provider) = std::env::var("RECON_PROVIDER") {
            self.provider = provider;
        }

        if let Ok(url) = std::env::var("RECON_GATEWAY_URL") {
            self.gateway.base_url = url;
        }

        if let Ok(key) = std::env::var("RECON_GATEWAY_API_KEY") {
            self.gateway.api_key = key;
        }

        if let Ok(retries) = std::env::var("RECON_GATEWAY_MAX_RETRIES") {
            self.gateway.max_retries = retries
                .parse()
                .map_err(|e| crate::Error::Config(format!("RECON_GATEWAY_MAX_RETRIES: {}", e)))?;
        }

        if let Ok(tolerance) = std::env::var("RECON_AMOUNT_TOLERANCE") {
            self.amount_tolerance_minor_units = tolerance
                .parse()
                .map_err(|e| crate::Error::Config(format!("RECON_AMOUNT_TOLERANCE: {}", e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tolerance_is_one_minor_unit() {
        assert_eq!(ReconciliationConfig::default().amount_tolerance_minor_units, 1);
    }

    #[test]
    fn test_parse_toml() {
        let config: ReconciliationConfig = toml::from_str(
            r#"
            provider = "stripe"
            amount_tolerance_minor_units = 2

            [gateway]
            base_url = "http://localhost:12111/v1"
            api_key = "sk_test"
            page_size = 10
            request_timeout_ms = 1000
            max_retries = 2
            initial_backoff_ms = 10
            max_backoff_ms = 100
        "#,
        )
        .unwrap();

        assert_eq!(config.amount_tolerance_minor_units, 2);
        assert_eq!(config.gateway.page_size, 10);
        assert_eq!(config.gateway.api_key, "sk_test");
    }
}
