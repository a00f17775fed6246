pub mod candles;
pub mod order_book;
pub mod stream;

pub use candles::CandleAggregator;
pub use order_book::{LiquidityMetrics, OrderBook};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::api::ExchangeApi;
use crate::models::{MarketEvent, MarketSnapshot};

/// Trades kept for buy/sell-ratio and large-order counters
const TRADE_WINDOW: usize = 1000;
/// Quote value above which a trade counts as a large order
const LARGE_ORDER_QUOTE_VALUE: f64 = 1000.0;
/// Book levels summed into the snapshot depth figures
const SNAPSHOT_DEPTH_LEVELS: usize = 10;
const SNAPSHOT_ATTEMPTS: u32 = 3;
const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_millis(200);
const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct TradeRecord {
    quote_value: f64,
    is_buyer_maker: bool,
}

/// All mutable market state for one instrument, guarded by a single lock
///
/// Only the consumer task writes here; snapshot reads take the read side.
#[derive(Debug)]
pub struct MarketState {
    pub order_book: OrderBook,
    pub candles: CandleAggregator,
    last_price: Option<f64>,
    volume_24h: f64,
    recent_trades: VecDeque<TradeRecord>,
}

impl MarketState {
    fn new(candle_limit: usize, candle_interval: Duration) -> Self {
        Self {
            order_book: OrderBook::new(),
            candles: CandleAggregator::new(candle_limit, candle_interval),
            last_price: None,
            volume_24h: 0.0,
            recent_trades: VecDeque::with_capacity(TRADE_WINDOW),
        }
    }

    /// Fold one feed event into the book/candle state
    pub fn apply_event(&mut self, event: MarketEvent) {
        match event {
            MarketEvent::Trade {
                price,
                quantity,
                is_buyer_maker,
                timestamp,
            } => {
                self.last_price = Some(price);
                self.candles.apply_trade(price, quantity, timestamp);
                self.recent_trades.push_back(TradeRecord {
                    quote_value: price * quantity,
                    is_buyer_maker,
                });
                while self.recent_trades.len() > TRADE_WINDOW {
                    self.recent_trades.pop_front();
                }
            }
            MarketEvent::Depth { updates } => {
                for level in updates {
                    self.order_book.update(level.side, level.price, level.quantity);
                }
            }
            MarketEvent::Ticker {
                last_price,
                volume_24h,
            } => {
                if last_price > 0.0 {
                    self.last_price = Some(last_price);
                }
                self.volume_24h = volume_24h;
            }
        }
    }

    /// Maker-side buys over sells in the recent trade window; 1.0 when flat
    fn buy_sell_ratio(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 1.0;
        }
        let buys = self
            .recent_trades
            .iter()
            .filter(|t| t.is_buyer_maker)
            .count();
        let sells = self.recent_trades.len() - buys;
        if sells == 0 {
            return 1.0;
        }
        buys as f64 / sells as f64
    }

    fn large_orders(&self) -> usize {
        self.recent_trades
            .iter()
            .filter(|t| t.quote_value > LARGE_ORDER_QUOTE_VALUE)
            .count()
    }

    /// Compose a snapshot, or None while price/volume are still missing
    fn build_snapshot(&self) -> Option<MarketSnapshot> {
        let price = self.last_price.filter(|p| *p > 0.0)?;
        if self.volume_24h <= 0.0 {
            return None;
        }

        let bid_volume: f64 = self
            .order_book
            .top_bids(SNAPSHOT_DEPTH_LEVELS)
            .iter()
            .map(|(_, q)| q)
            .sum();
        let ask_volume: f64 = self
            .order_book
            .top_asks(SNAPSHOT_DEPTH_LEVELS)
            .iter()
            .map(|(_, q)| q)
            .sum();

        Some(MarketSnapshot {
            price,
            volume: self.volume_24h,
            timestamp: Utc::now(),
            bid_volume,
            ask_volume,
            order_book_imbalance: self.order_book.imbalance(),
            ma_signal: self.candles.ma_signal(),
            rsi: self.candles.rsi(),
            macd_signal: self.candles.macd_signal(),
            buy_sell_ratio: self.buy_sell_ratio(),
            large_orders: self.large_orders(),
            recent_candles: self.candles.recent(20),
        })
    }
}

/// Owns the order book and candle history for one trading pair
///
/// Stream tasks push typed events onto a channel; a single consumer task
/// drains it into `MarketState`, so every mutation has one writer. A
/// periodic task seals candles at wall-clock interval boundaries.
pub struct MarketDataService {
    symbol: String,
    candle_interval: Duration,
    state: Arc<RwLock<MarketState>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    stream_health: watch::Sender<bool>,
}

impl MarketDataService {
    pub fn new(symbol: impl Into<String>, candle_interval: Duration, candle_limit: usize) -> Self {
        let (stream_health, _) = watch::channel(true);
        Self {
            symbol: symbol.into(),
            candle_interval,
            state: Arc::new(RwLock::new(MarketState::new(candle_limit, candle_interval))),
            tasks: std::sync::Mutex::new(Vec::new()),
            stream_health,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Backfill candle history and spawn the stream, consumer and sealer tasks
    pub async fn start(&self, api: Arc<dyn ExchangeApi>) -> Result<()> {
        let interval_label = interval_to_kline_label(self.candle_interval);
        let history = api
            .get_klines(&self.symbol, &interval_label, 288)
            .await
            .context("failed to backfill candle history")?;
        {
            let mut state = self.state.write().await;
            state.candles.backfill(history);
            if let Some(price) = state.candles.last_price() {
                state.last_price = Some(price);
            }
        }

        let (tx, mut rx) = mpsc::channel::<MarketEvent>(EVENT_CHANNEL_CAPACITY);

        // Single consumer: the only writer of MarketState
        let consumer_state = self.state.clone();
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                consumer_state.write().await.apply_event(event);
            }
            tracing::info!("Market event channel drained, consumer exiting");
        });

        let symbol = self.symbol.clone();
        let health = self.stream_health.clone();
        let streamer = tokio::spawn(async move {
            if let Err(e) = stream::run_market_stream(&symbol, tx).await {
                tracing::error!("Market stream terminated: {e:#}");
                // Snapshots would keep serving the last seen price forever,
                // so consumers must be able to see the feed is gone
                let _ = health.send(false);
            }
        });

        let sealer_state = self.state.clone();
        let interval = self.candle_interval;
        let sealer = tokio::spawn(async move {
            let mut ticker = interval_at(next_interval_boundary(interval), interval);
            loop {
                ticker.tick().await;
                let boundary = current_interval_start(interval);
                let mut state = sealer_state.write().await;
                if let Some(candle) = state.candles.seal(boundary) {
                    tracing::debug!(
                        close = candle.close,
                        volume = candle.volume,
                        trades = candle.trades,
                        "Sealed candle"
                    );
                }
            }
        });

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.extend([consumer, streamer, sealer]);

        tracing::info!(symbol = %self.symbol, "Market data collection started");
        Ok(())
    }

    /// Cancel all stream and periodic tasks
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::info!(symbol = %self.symbol, "Market data collection stopped");
    }

    /// Compose a consistent snapshot, retrying briefly while price/volume
    /// are not yet available
    pub async fn snapshot(&self) -> Result<MarketSnapshot> {
        for attempt in 1..=SNAPSHOT_ATTEMPTS {
            if let Some(snapshot) = self.state.read().await.build_snapshot() {
                return Ok(snapshot);
            }
            if attempt < SNAPSHOT_ATTEMPTS {
                tokio::time::sleep(SNAPSHOT_RETRY_DELAY).await;
            }
        }
        anyhow::bail!(
            "market snapshot for {} incomplete after {} attempts (no price/volume yet)",
            self.symbol,
            SNAPSHOT_ATTEMPTS
        )
    }

    /// False once the live stream has exhausted its reconnect attempts
    pub fn is_stream_alive(&self) -> bool {
        *self.stream_health.borrow()
    }

    #[cfg(test)]
    pub fn mark_stream_failed(&self) {
        let _ = self.stream_health.send(false);
    }

    /// Apply an event directly, bypassing the channel (tests and replays)
    pub async fn apply_event(&self, event: MarketEvent) {
        self.state.write().await.apply_event(event);
    }

    /// Seal the open candle at the given boundary (tests and replays)
    pub async fn seal_candle(&self, boundary: chrono::DateTime<Utc>) {
        self.state.write().await.candles.seal(boundary);
    }
}

/// When the next interval boundary occurs on the wall clock
fn next_interval_boundary(interval: Duration) -> Instant {
    let secs = interval.as_secs() as i64;
    let now = Utc::now().timestamp();
    let until = secs - now.rem_euclid(secs);
    Instant::now() + Duration::from_secs(until as u64)
}

/// Wall-clock start of the interval containing now
fn current_interval_start(interval: Duration) -> chrono::DateTime<Utc> {
    let secs = interval.as_secs() as i64;
    let now = Utc::now().timestamp();
    Utc.timestamp_opt(now - now.rem_euclid(secs), 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn interval_to_kline_label(interval: Duration) -> String {
    let mins = (interval.as_secs() / 60).max(1);
    format!("{mins}m")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DepthLevel, Side};
    use tokio_test::assert_ok;

    fn trade(price: f64, quantity: f64, is_buyer_maker: bool) -> MarketEvent {
        MarketEvent::Trade {
            price,
            quantity,
            is_buyer_maker,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_requires_price_and_volume() {
        let service = MarketDataService::new("TRUMPUSDC", Duration::from_secs(300), 100);
        let result = service.snapshot().await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("incomplete"));
    }

    #[tokio::test]
    async fn test_snapshot_after_ticker_and_trades() {
        let service = MarketDataService::new("TRUMPUSDC", Duration::from_secs(300), 100);

        service
            .apply_event(MarketEvent::Ticker {
                last_price: 40.0,
                volume_24h: 50_000.0,
            })
            .await;
        service.apply_event(trade(40.1, 0.5, true)).await;
        service
            .apply_event(MarketEvent::Depth {
                updates: vec![
                    DepthLevel {
                        side: Side::Buy,
                        price: 39.9,
                        quantity: 3.0,
                    },
                    DepthLevel {
                        side: Side::Sell,
                        price: 40.2,
                        quantity: 1.0,
                    },
                ],
            })
            .await;

        let snapshot = tokio_test::assert_ok!(service.snapshot().await);
        assert_eq!(snapshot.price, 40.1);
        assert_eq!(snapshot.volume, 50_000.0);
        assert_eq!(snapshot.bid_volume, 3.0);
        assert_eq!(snapshot.ask_volume, 1.0);
        assert!(snapshot.order_book_imbalance > 0.0);
        assert_eq!(snapshot.rsi, 50.0); // no sealed candles yet
    }

    #[tokio::test]
    async fn test_buy_sell_ratio_and_large_orders() {
        let service = MarketDataService::new("TRUMPUSDC", Duration::from_secs(300), 100);
        service
            .apply_event(MarketEvent::Ticker {
                last_price: 40.0,
                volume_24h: 50_000.0,
            })
            .await;

        // Three maker buys, one sell; one trade above the large-order value
        service.apply_event(trade(40.0, 0.5, true)).await;
        service.apply_event(trade(40.0, 0.5, true)).await;
        service.apply_event(trade(40.0, 30.0, true)).await; // 1200 quote
        service.apply_event(trade(40.0, 0.5, false)).await;

        let snapshot = service.snapshot().await.unwrap();
        assert_eq!(snapshot.buy_sell_ratio, 3.0);
        assert_eq!(snapshot.large_orders, 1);
    }

    #[tokio::test]
    async fn test_sealing_feeds_recent_candles() {
        let service = MarketDataService::new("TRUMPUSDC", Duration::from_secs(300), 100);
        service
            .apply_event(MarketEvent::Ticker {
                last_price: 40.0,
                volume_24h: 50_000.0,
            })
            .await;
        service.apply_event(trade(40.5, 1.0, true)).await;
        service.seal_candle(Utc::now()).await;

        let snapshot = service.snapshot().await.unwrap();
        assert_eq!(snapshot.recent_candles.len(), 1);
        assert_eq!(snapshot.recent_candles[0].close, 40.5);
    }

    #[test]
    fn test_stream_failure_is_observable() {
        let service = MarketDataService::new("TRUMPUSDC", Duration::from_secs(300), 100);
        assert!(service.is_stream_alive());
        service.mark_stream_failed();
        assert!(!service.is_stream_alive());
    }

    #[test]
    fn test_kline_label() {
        assert_eq!(interval_to_kline_label(Duration::from_secs(300)), "5m");
        assert_eq!(interval_to_kline_label(Duration::from_secs(60)), "1m");
    }
}
