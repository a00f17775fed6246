use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::ExchangeApi;
use crate::models::{Candle, Order, OrderStatus, OrderUpdate, Side};

const BINANCE_API_BASE: &str = "https://api.binance.com";
const RATE_LIMIT_RPM: u32 = 1200;
const MAX_RETRIES: u32 = 3;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

type HmacSha256 = Hmac<Sha256>;

/// Signed Binance spot REST client with rate limiting and retry
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    status: OrderStatus,
    #[serde(default)]
    price: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    cummulative_quote_qty: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<BalanceEntry>,
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    asset: String,
    free: String,
}

impl BinanceClient {
    pub fn new(api_key: String, api_secret: String) -> Result<Self> {
        Self::with_base_url(api_key, api_secret, BINANCE_API_BASE.to_string())
    }

    /// Point the client at a different host (testnet, mock server)
    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());

        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// HMAC-SHA256 signature over the query string, hex-encoded
    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn signed_url(&self, path: &str, query: &str) -> String {
        let query = format!("{}&timestamp={}", query, Utc::now().timestamp_millis());
        let signature = self.sign(&query);
        format!("{}{path}?{query}&signature={signature}", self.base_url)
    }

    /// Rate-limited request with retry on 429 and 5xx
    async fn make_request(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let req = request
                .try_clone()
                .context("Request body not cloneable for retry")?;

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            "Binance returned {}, backing off for {}s (attempt {}/{})",
                            status,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    anyhow::bail!("Binance API error ({}): {}", status, error_text);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_secs = 2u64.pow(attempt);
                    tracing::warn!(
                        "Network error: {}, retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => anyhow::bail!("Network error after {} retries: {}", MAX_RETRIES, e),
            }
        }

        anyhow::bail!("Failed after {} retries", MAX_RETRIES)
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<Order> {
        let client_order_id = uuid::Uuid::new_v4().simple().to_string();
        let query = format!(
            "symbol={symbol}&side={}&type=LIMIT&timeInForce=GTC&quantity={quantity}&price={price}&newClientOrderId={client_order_id}",
            side.as_str()
        );
        let url = self.signed_url("/api/v3/order", &query);

        tracing::info!(
            "Placing {} order: {} {} @ {}",
            side.as_str(),
            quantity,
            symbol,
            price
        );

        let request = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key);
        let response = self.make_request(request).await?;

        let body: OrderResponse = response
            .json()
            .await
            .context("Failed to parse order response")?;

        Ok(Order {
            id: body.order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            status: body.status,
            timestamp: Utc::now(),
        })
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderUpdate> {
        let query = format!("symbol={symbol}&orderId={order_id}");
        let url = self.signed_url("/api/v3/order", &query);

        let request = self.client.get(&url).header("X-MBX-APIKEY", &self.api_key);
        let response = self.make_request(request).await?;

        let body: OrderResponse = response
            .json()
            .await
            .context("Failed to parse order status")?;

        let filled_quantity: f64 = body.executed_qty.parse().unwrap_or(0.0);
        let quote_qty: f64 = body.cummulative_quote_qty.parse().unwrap_or(0.0);
        // Average fill price when anything executed, limit price otherwise
        let filled_price = if filled_quantity > 0.0 && quote_qty > 0.0 {
            quote_qty / filled_quantity
        } else {
            body.price.parse().unwrap_or(0.0)
        };

        Ok(OrderUpdate {
            order_id: body.order_id.to_string(),
            status: body.status,
            filled_price,
            filled_quantity,
        })
    }

    async fn get_available_balance(&self, asset: &str) -> Result<f64> {
        let url = self.signed_url("/api/v3/account", "");

        let request = self.client.get(&url).header("X-MBX-APIKEY", &self.api_key);
        let response = self.make_request(request).await?;

        let body: AccountResponse = response
            .json()
            .await
            .context("Failed to parse account info")?;

        let free = body
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free.parse::<f64>().unwrap_or(0.0))
            .unwrap_or(0.0);

        Ok(free)
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={symbol}&interval={interval}&limit={limit}",
            self.base_url
        );

        let request = self.client.get(&url);
        let response = self.make_request(request).await?;

        // Kline rows are positional arrays of mixed numbers and strings
        let rows: Vec<Vec<serde_json::Value>> =
            response.json().await.context("Failed to parse klines")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(parse_kline_row(&row)?);
        }

        tracing::debug!("Fetched {} candles for {}", candles.len(), symbol);
        Ok(candles)
    }
}

fn parse_kline_row(row: &[serde_json::Value]) -> Result<Candle> {
    if row.len() < 9 {
        anyhow::bail!("kline row too short: {} fields", row.len());
    }

    let num = |i: usize| -> Result<f64> {
        row[i]
            .as_str()
            .context("kline field not a string")?
            .parse::<f64>()
            .with_context(|| format!("kline field {i} not numeric"))
    };

    let open_time = row[0].as_i64().context("kline open time")?;
    let open = num(1)?;
    let high = num(2)?;
    let low = num(3)?;
    let close = num(4)?;
    let volume = num(5)?;
    let quote_volume = num(7)?;
    let trades = row[8].as_u64().unwrap_or(0) as u32;

    let vwap = if volume > 0.0 {
        quote_volume / volume
    } else {
        close
    };

    Ok(Candle {
        timestamp: Utc
            .timestamp_millis_opt(open_time)
            .single()
            .unwrap_or_else(Utc::now),
        open,
        high,
        low,
        close,
        volume,
        trades,
        vwap,
    })
}
