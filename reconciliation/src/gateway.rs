//! Gateway query client
//!
//! The engine only sees the [`GatewayClient`] trait; [`HttpGatewayClient`]
//! is the production implementation over the gateway's REST API.

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use balance_ledger::GatewayTransaction;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Closed-open time window `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Inclusive start
    pub from: DateTime<Utc>,
    /// Exclusive end
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    /// Validated window; `from` must be strictly before `to`
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from >= to {
            return Err(Error::InvalidWindow(format!(
                "from ({}) must be before to ({})",
                from.to_rfc3339(),
                to.to_rfc3339()
            )));
        }
        Ok(Self { from, to })
    }

    /// Whether `at` falls inside the window
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

/// One page of gateway records
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records on this page
    pub data: Vec<GatewayTransaction>,
    /// More pages follow
    pub has_more: bool,
    /// Cursor for the next page
    pub next_cursor: Option<String>,
}

/// Source of gateway-side transaction records
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Fetch one page of records created inside `window`, starting after `cursor`
    async fn list_transactions(&self, window: &TimeWindow, cursor: Option<&str>) -> Result<Page>;
}

/// Follow the cursor until the gateway reports no more pages
pub async fn fetch_all(client: &dyn GatewayClient, window: &TimeWindow) -> Result<Vec<GatewayTransaction>> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;

    loop {
        let page = client.list_transactions(window, cursor.as_deref()).await?;
        pages += 1;
        records.extend(page.data);

        match (page.has_more, page.next_cursor) {
            (true, Some(next)) => cursor = Some(next),
            (true, None) => {
                return Err(Error::Gateway(
                    "gateway reported more pages without a cursor".to_string(),
                ))
            }
            (false, _) => break,
        }
    }

    debug!(pages, records = records.len(), "Fetched gateway records");
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<WireTransaction>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    created: i64,
    #[serde(default)]
    fee: i64,
}

impl WireTransaction {
    fn into_transaction(self) -> Result<GatewayTransaction> {
        let created_at = Utc
            .timestamp_opt(self.created, 0)
            .single()
            .ok_or_else(|| Error::Gateway(format!("invalid created timestamp {}", self.created)))?;

        Ok(GatewayTransaction {
            id: self.id,
            amount: self.amount,
            currency: self.currency,
            status: self.status,
            created_at,
            fee: self.fee,
        })
    }
}

/// REST client with bearer auth, cursor pagination and retry
#[derive(Debug, Clone)]
pub struct HttpGatewayClient {
    config: GatewayConfig,
    http_client: Client,
}

impl HttpGatewayClient {
    /// Build the client
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Delay before retry number `attempt` (0-based), with ±10% jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64 * 2f64.powi(attempt as i32);
        let capped = base.min(self.config.max_backoff_ms as f64);
        let jitter = (rand::random::<f64>() - 0.5) * capped * 0.2;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    async fn fetch_page(&self, window: &TimeWindow, cursor: Option<&str>) -> Result<Page> {
        let url = format!("{}/payment_intents", self.config.base_url.trim_end_matches('/'));

        let mut query = vec![
            ("created[gte]", window.from.timestamp().to_string()),
            ("created[lt]", window.to.timestamp().to_string()),
            ("limit", self.config.page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("starting_after", cursor.to_string()));
        }

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Error::GatewayUnavailable(format!("gateway returned {}", status)));
        }
        if !status.is_success() {
            return Err(Error::Gateway(format!("gateway returned {}", status)));
        }

        let body: ListResponse = response
            .json()
            .await
            .map_err(|e| Error::Gateway(format!("malformed list response: {}", e)))?;

        let data = body
            .data
            .into_iter()
            .map(WireTransaction::into_transaction)
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = data.last().map(|t| t.id.clone());

        Ok(Page {
            data,
            has_more: body.has_more,
            next_cursor,
        })
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn list_transactions(&self, window: &TimeWindow, cursor: Option<&str>) -> Result<Page> {
        let mut attempt = 0u32;

        loop {
            match self.fetch_page(window, cursor).await {
                Ok(page) => {
                    if attempt > 0 {
                        info!(attempt, "Gateway page fetched after retry");
                    }
                    return Ok(page);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        ?delay,
                        error = %e,
                        "Gateway request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
