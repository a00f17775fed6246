pub mod binance;
pub mod fear_greed;
pub mod mock;
pub mod openrouter;

pub use binance::BinanceClient;
pub use fear_greed::FearGreedClient;
pub use mock::MockExchange;
pub use openrouter::{AiAdvisor, AiVerdict};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Candle, Order, OrderUpdate, Side};

/// Exchange operations the trading engine depends on
///
/// The live implementation is `BinanceClient`; `MockExchange` stands in for
/// tests and dry runs.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Submit a limit order, returning the accepted order with its exchange id
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<Order>;

    /// Current status of a previously placed order
    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderUpdate>;

    /// Free balance of one asset
    async fn get_available_balance(&self, asset: &str) -> Result<f64>;

    /// Historical candles, oldest first
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;
}
