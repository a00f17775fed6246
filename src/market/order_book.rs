use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::models::Side;

/// Cancellations above this count mark a price level as suspicious
const CANCEL_THRESHOLD: u32 = 5;
/// Cancellation counters are cleared every minute (approximates a sliding window)
const CANCEL_WINDOW_SECS: i64 = 60;

/// Map key giving f64 prices a total order
///
/// Prices come off the wire as finite decimals; NaN never enters the book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookPrice(pub f64);

impl Eq for BookPrice {}

impl PartialOrd for BookPrice {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BookPrice {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Spread, quote-currency depth and cancellation pressure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidityMetrics {
    pub spread: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub cancel_rate: f64,
}

/// Current bid/ask depth for one instrument
///
/// Sides are sorted maps so best bid/ask and top-N queries avoid full scans.
/// All reads degrade to 0/false on an empty book; nothing here blocks or fails.
#[derive(Debug, Clone)]
pub struct OrderBook {
    bids: BTreeMap<BookPrice, f64>,
    asks: BTreeMap<BookPrice, f64>,
    cancel_counts: BTreeMap<BookPrice, u32>,
    cancel_window_start: DateTime<Utc>,
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            cancel_counts: BTreeMap::new(),
            cancel_window_start: Utc::now(),
        }
    }

    /// Replace the quantity at `price`; zero removes the level and counts
    /// a cancellation against it
    pub fn update(&mut self, side: Side, price: f64, quantity: f64) {
        self.maybe_reset_cancel_window(Utc::now());

        let key = BookPrice(price);
        let book = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };

        if quantity > 0.0 {
            book.insert(key, quantity);
        } else if book.remove(&key).is_some() {
            *self.cancel_counts.entry(key).or_insert(0) += 1;
        }
    }

    fn maybe_reset_cancel_window(&mut self, now: DateTime<Utc>) {
        if (now - self.cancel_window_start).num_seconds() >= CANCEL_WINDOW_SECS {
            self.cancel_counts.clear();
            self.cancel_window_start = now;
        }
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter().next_back().map(|(p, q)| (p.0, *q))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(p, q)| (p.0, *q))
    }

    /// Top `n` bids, best (highest) first
    pub fn top_bids(&self, n: usize) -> Vec<(f64, f64)> {
        self.bids.iter().rev().take(n).map(|(p, q)| (p.0, *q)).collect()
    }

    /// Top `n` asks, best (lowest) first
    pub fn top_asks(&self, n: usize) -> Vec<(f64, f64)> {
        self.asks.iter().take(n).map(|(p, q)| (p.0, *q)).collect()
    }

    /// Total quantity on the bid side
    pub fn bid_volume(&self) -> f64 {
        self.bids.values().sum()
    }

    /// Total quantity on the ask side
    pub fn ask_volume(&self) -> f64 {
        self.asks.values().sum()
    }

    /// Normalized bid/ask pressure in [-1, 1]; 0 when the book is empty
    pub fn imbalance(&self) -> f64 {
        let bid = self.bid_volume();
        let ask = self.ask_volume();
        let total = bid + ask;
        if total == 0.0 {
            return 0.0;
        }
        (bid - ask) / total
    }

    pub fn liquidity_metrics(&self) -> LiquidityMetrics {
        let spread = match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => ask - bid,
            _ => 0.0,
        };

        let bid_depth = self.bids.iter().map(|(p, q)| p.0 * q).sum();
        let ask_depth = self.asks.iter().map(|(p, q)| p.0 * q).sum();

        let cancel_rate = if self.cancel_counts.is_empty() {
            0.0
        } else {
            let hot = self
                .cancel_counts
                .values()
                .filter(|&&c| c > CANCEL_THRESHOLD)
                .count();
            hot as f64 / self.cancel_counts.len() as f64
        };

        LiquidityMetrics {
            spread,
            bid_depth,
            ask_depth,
            cancel_rate,
        }
    }

    /// Heuristic flag: more than 90% of tracked levels churned past the
    /// cancellation threshold in the current window
    pub fn detect_spoofing(&self) -> bool {
        let total_levels = self.bids.len() + self.asks.len();
        if total_levels == 0 {
            return false;
        }
        let high_cancel = self
            .cancel_counts
            .values()
            .filter(|&&c| c > CANCEL_THRESHOLD)
            .count();
        high_cancel as f64 / total_levels as f64 > 0.9
    }

    #[cfg(test)]
    fn force_cancel_window_start(&mut self, start: DateTime<Utc>) {
        self.cancel_window_start = start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_empty_book_degrades_to_zero() {
        let book = OrderBook::new();
        assert_eq!(book.imbalance(), 0.0);
        assert_eq!(book.bid_volume(), 0.0);
        assert_eq!(book.ask_volume(), 0.0);
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
        assert!(!book.detect_spoofing());

        let metrics = book.liquidity_metrics();
        assert_eq!(metrics.spread, 0.0);
        assert_eq!(metrics.cancel_rate, 0.0);
    }

    #[test]
    fn test_best_bid_ask_sorted() {
        let mut book = OrderBook::new();
        book.update(Side::Buy, 39.8, 1.0);
        book.update(Side::Buy, 39.9, 2.0);
        book.update(Side::Buy, 39.7, 3.0);
        book.update(Side::Sell, 40.2, 1.0);
        book.update(Side::Sell, 40.1, 2.0);
        book.update(Side::Sell, 40.3, 3.0);

        assert_eq!(book.best_bid(), Some((39.9, 2.0)));
        assert_eq!(book.best_ask(), Some((40.1, 2.0)));

        let bids = book.top_bids(2);
        assert_eq!(bids, vec![(39.9, 2.0), (39.8, 1.0)]);
        let asks = book.top_asks(2);
        assert_eq!(asks, vec![(40.1, 2.0), (40.2, 1.0)]);
    }

    #[test]
    fn test_update_replaces_quantity() {
        let mut book = OrderBook::new();
        book.update(Side::Buy, 39.9, 1.0);
        book.update(Side::Buy, 39.9, 5.0);
        assert_eq!(book.bid_volume(), 5.0);
    }

    #[test]
    fn test_zero_quantity_removes_level() {
        let mut book = OrderBook::new();
        book.update(Side::Sell, 40.1, 1.0);
        book.update(Side::Sell, 40.1, 0.0);
        assert!(book.best_ask().is_none());
        assert_eq!(book.ask_volume(), 0.0);
    }

    #[test]
    fn test_imbalance_bounds() {
        let mut book = OrderBook::new();
        book.update(Side::Buy, 39.9, 10.0);
        assert_eq!(book.imbalance(), 1.0);

        book.update(Side::Sell, 40.1, 10.0);
        assert_eq!(book.imbalance(), 0.0);

        book.update(Side::Buy, 39.9, 0.0);
        assert_eq!(book.imbalance(), -1.0);

        // Any mix stays inside [-1, 1]
        book.update(Side::Buy, 39.8, 3.5);
        book.update(Side::Sell, 40.2, 0.1);
        let imbalance = book.imbalance();
        assert!((-1.0..=1.0).contains(&imbalance));
    }

    #[test]
    fn test_spread_and_depth() {
        let mut book = OrderBook::new();
        book.update(Side::Buy, 39.9, 2.0);
        book.update(Side::Sell, 40.1, 3.0);

        let metrics = book.liquidity_metrics();
        assert!((metrics.spread - 0.2).abs() < 1e-9);
        assert!((metrics.bid_depth - 39.9 * 2.0).abs() < 1e-9);
        assert!((metrics.ask_depth - 40.1 * 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cancel_rate_counts_hot_levels() {
        let mut book = OrderBook::new();
        // Churn one price past the threshold, another below it
        for _ in 0..6 {
            book.update(Side::Buy, 39.9, 1.0);
            book.update(Side::Buy, 39.9, 0.0);
        }
        book.update(Side::Buy, 39.8, 1.0);
        book.update(Side::Buy, 39.8, 0.0);

        let metrics = book.liquidity_metrics();
        assert!((metrics.cancel_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_spoofing_flag() {
        let mut book = OrderBook::new();
        for _ in 0..6 {
            book.update(Side::Buy, 39.9, 1.0);
            book.update(Side::Buy, 39.9, 0.0);
        }
        // One remaining tracked level, churned past the threshold
        book.update(Side::Buy, 39.9, 1.0);
        assert!(book.detect_spoofing());

        // A quiet book with many calm levels is not flagged
        let mut calm = OrderBook::new();
        for i in 0..10 {
            calm.update(Side::Buy, 39.0 + i as f64 * 0.1, 1.0);
        }
        assert!(!calm.detect_spoofing());
    }

    #[test]
    fn test_cancel_window_resets() {
        let mut book = OrderBook::new();
        for _ in 0..6 {
            book.update(Side::Buy, 39.9, 1.0);
            book.update(Side::Buy, 39.9, 0.0);
        }
        book.force_cancel_window_start(Utc::now() - Duration::seconds(CANCEL_WINDOW_SECS + 1));

        // Next update clears the stale counters
        book.update(Side::Buy, 39.9, 1.0);
        assert_eq!(book.liquidity_metrics().cancel_rate, 0.0);
        assert!(!book.detect_spoofing());
    }
}
