//! Configuration for the webhook processor

use serde::{Deserialize, Serialize};

/// Webhook processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Age after which an event stuck in `processing` is reported as stale (seconds)
    pub processing_timeout_secs: u64,

    /// Largest accepted payload (bytes)
    pub max_payload_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            processing_timeout_secs: 300,
            max_payload_bytes: 256 * 1024,
        }
    }
}

impl WebhookConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("WEBHOOK_PROCESSING_TIMEOUT_SECS") {
            config.processing_timeout_secs = timeout.parse().map_err(|e| {
                crate::Error::Config(format!("WEBHOOK_PROCESSING_TIMEOUT_SECS: {}", e))
            })?;
        }

        if let Ok(max) = std::env::var("WEBHOOK_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = max
                .parse()
                .map_err(|e| crate::Error::Config(format!("WEBHOOK_MAX_PAYLOAD_BYTES: {}", e)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let config: WebhookConfig = toml::from_str(
            r#"
            processing_timeout_secs = 60
            max_payload_bytes = 1024
        "#,
        )
        .unwrap();
        assert_eq!(config.processing_timeout_secs, 60);
        assert_eq!(config.max_payload_bytes, 1024);
    }
}
