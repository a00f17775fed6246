use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::ExchangeApi;
use crate::models::{Candle, Order, OrderStatus, OrderUpdate, Side};

/// In-memory exchange for tests and dry runs
///
/// Orders fill immediately at their limit price unless a status script is
/// queued for the symbol, in which case `get_order` pops scripted statuses
/// one per call.
pub struct MockExchange {
    next_id: AtomicU64,
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    balances: HashMap<String, f64>,
    orders: HashMap<String, Order>,
    status_scripts: HashMap<String, VecDeque<OrderStatus>>,
    klines: Vec<Candle>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(MockState::default()),
        }
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        let mut state = self.inner.lock().expect("mock state lock poisoned");
        state.balances.insert(asset.to_string(), amount);
    }

    /// Queue statuses that `get_order` will report for `order_id`, in order.
    /// After the script drains, the last status repeats.
    pub fn script_order_statuses(&self, order_id: &str, statuses: &[OrderStatus]) {
        let mut state = self.inner.lock().expect("mock state lock poisoned");
        state
            .status_scripts
            .insert(order_id.to_string(), statuses.iter().copied().collect());
    }

    pub fn set_klines(&self, candles: Vec<Candle>) {
        let mut state = self.inner.lock().expect("mock state lock poisoned");
        state.klines = candles;
    }

    pub fn placed_orders(&self) -> Vec<Order> {
        let state = self.inner.lock().expect("mock state lock poisoned");
        let mut orders: Vec<Order> = state.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id.parse::<u64>().unwrap_or(0));
        orders
    }

    /// The id `place_order` will assign next (for scripting before placement)
    pub fn peek_next_order_id(&self) -> String {
        self.next_id.load(Ordering::SeqCst).to_string()
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<Order> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let order = Order {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            status: OrderStatus::New,
            timestamp: Utc::now(),
        };

        let mut state = self.inner.lock().expect("mock state lock poisoned");
        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<OrderUpdate> {
        let mut state = self.inner.lock().expect("mock state lock poisoned");

        let status = match state.status_scripts.get_mut(order_id) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap(),
            Some(script) => *script.front().unwrap_or(&OrderStatus::Filled),
            None => OrderStatus::Filled,
        };

        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown order id {order_id}"))?;

        let filled = matches!(
            status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled
        );

        Ok(OrderUpdate {
            order_id: order_id.to_string(),
            status,
            filled_price: if filled { order.price } else { 0.0 },
            filled_quantity: if status == OrderStatus::Filled {
                order.quantity
            } else if status == OrderStatus::PartiallyFilled {
                order.quantity / 2.0
            } else {
                0.0
            },
        })
    }

    async fn get_available_balance(&self, asset: &str) -> Result<f64> {
        let state = self.inner.lock().expect("mock state lock poisoned");
        Ok(state.balances.get(asset).copied().unwrap_or(0.0))
    }

    async fn get_klines(&self, _symbol: &str, _interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let state = self.inner.lock().expect("mock state lock poisoned");
        let candles = &state.klines;
        let start = candles.len().saturating_sub(limit as usize);
        Ok(candles[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_orders_fill_at_limit_price_by_default() {
        let exchange = MockExchange::new();
        let order = exchange
            .place_order("TRUMPUSDC", Side::Buy, 0.25, 40.0)
            .await
            .unwrap();

        let update = exchange.get_order("TRUMPUSDC", &order.id).await.unwrap();
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.filled_price, 40.0);
        assert_eq!(update.filled_quantity, 0.25);
    }

    #[tokio::test]
    async fn test_status_script_plays_in_order() {
        let exchange = MockExchange::new();
        let id = exchange.peek_next_order_id();
        exchange.script_order_statuses(
            &id,
            &[
                OrderStatus::New,
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled,
            ],
        );

        let order = exchange
            .place_order("TRUMPUSDC", Side::Sell, 0.2, 42.0)
            .await
            .unwrap();
        assert_eq!(order.id, id);

        let first = exchange.get_order("TRUMPUSDC", &id).await.unwrap();
        assert_eq!(first.status, OrderStatus::New);
        assert_eq!(first.filled_quantity, 0.0);

        let second = exchange.get_order("TRUMPUSDC", &id).await.unwrap();
        assert_eq!(second.status, OrderStatus::PartiallyFilled);
        assert_eq!(second.filled_quantity, 0.1);

        let third = exchange.get_order("TRUMPUSDC", &id).await.unwrap();
        assert_eq!(third.status, OrderStatus::Filled);

        // Script exhausted: final status repeats
        let again = exchange.get_order("TRUMPUSDC", &id).await.unwrap();
        assert_eq!(again.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_balances_and_klines() {
        let exchange = MockExchange::new();
        exchange.set_balance("USDC", 100.0);
        assert_eq!(exchange.get_available_balance("USDC").await.unwrap(), 100.0);
        assert_eq!(exchange.get_available_balance("BTC").await.unwrap(), 0.0);

        exchange.set_klines(vec![Candle::flat(Utc::now(), 40.0)]);
        let klines = exchange.get_klines("TRUMPUSDC", "5m", 10).await.unwrap();
        assert_eq!(klines.len(), 1);
    }
}
