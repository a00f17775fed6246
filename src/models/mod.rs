use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// OHLCV candlestick for one fixed interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: u32,
    pub vwap: f64,
}

impl Candle {
    /// Start a candle from a single trade
    pub fn from_trade(timestamp: DateTime<Utc>, price: f64, quantity: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: quantity,
            trades: 1,
            vwap: price,
        }
    }

    /// Flat zero-volume candle seeded from the last traded price
    pub fn flat(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            trades: 0,
            vwap: price,
        }
    }
}

/// Exchange order status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Statuses that mean the order died without filling
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// A submitted exchange order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// Status update for a submitted order, as delivered by the exchange
///
/// `filled_price` and `filled_quantity` are zero until something executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_price: f64,
    pub filled_quantity: f64,
}

/// Currently held inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeStatus {
    Open,
    Closed,
}

/// One buy/sell round trip in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub buy_order: Order,
    pub sell_order: Option<Order>,
    pub profit_loss: Option<f64>,
    pub status: TradeStatus,
    pub timestamp: DateTime<Utc>,
}

/// Per-source confidence breakdown for a fused signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub technical: f64,
    pub sentiment: f64,
    pub correlation: f64,
}

/// A fused trading decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub action: Side,
    pub confidence: f64,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
    pub reasons: SignalBreakdown,
}

/// One depth-event price level
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DepthLevel {
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

/// Raw event from the market data feed
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Trade {
        price: f64,
        quantity: f64,
        is_buyer_maker: bool,
        timestamp: DateTime<Utc>,
    },
    Depth {
        updates: Vec<DepthLevel>,
    },
    Ticker {
        last_price: f64,
        volume_24h: f64,
    },
}

/// Point-in-time read view of the market
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub bid_volume: f64,
    pub ask_volume: f64,
    pub order_book_imbalance: f64,
    pub ma_signal: i8,
    pub rsi: f64,
    pub macd_signal: i8,
    pub buy_sell_ratio: f64,
    pub large_orders: usize,
    pub recent_candles: Vec<Candle>,
}
