use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;

use crate::indicators::{calculate_macd, calculate_rsi, calculate_sma, MacdOutput};
use crate::models::Candle;

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;

/// Builds fixed-interval OHLCV candles from a trade stream and keeps the
/// derived indicators current
///
/// Sealed candles live in a bounded ring; the open candle mutates with each
/// trade. When the trade stream stalls, sealing still produces flat candles
/// seeded from the last price so downstream consumers never see gaps.
#[derive(Debug)]
pub struct CandleAggregator {
    candles: VecDeque<Candle>,
    limit: usize,
    interval: std::time::Duration,
    current: Option<Candle>,
    last_price: Option<f64>,

    // Rolling close buffers feeding the indicators
    rsi_closes: VecDeque<f64>,
    macd_closes: VecDeque<f64>,
    ma5: Option<f64>,
    ma20: Option<f64>,
}

impl CandleAggregator {
    pub fn new(limit: usize, interval: std::time::Duration) -> Self {
        Self {
            candles: VecDeque::with_capacity(limit),
            limit,
            interval,
            current: None,
            last_price: None,
            rsi_closes: VecDeque::with_capacity(RSI_PERIOD),
            macd_closes: VecDeque::with_capacity(MACD_SLOW),
            ma5: None,
            ma20: None,
        }
    }

    /// Seed history with exchange klines before live updates begin, so
    /// indicators are meaningful immediately
    pub fn backfill(&mut self, history: Vec<Candle>) {
        for candle in history {
            self.last_price = Some(candle.close);
            self.push_sealed(candle);
        }
        self.recompute_indicators();
        tracing::info!(candles = self.candles.len(), "Backfilled candle history");
    }

    /// Fold one trade into the open candle
    pub fn apply_trade(&mut self, price: f64, quantity: f64, timestamp: DateTime<Utc>) {
        self.last_price = Some(price);

        match &mut self.current {
            Some(candle) => {
                candle.high = candle.high.max(price);
                candle.low = candle.low.min(price);
                candle.close = price;
                candle.trades += 1;
                // Running VWAP: weight price by traded volume within the candle
                let prev_volume = candle.volume;
                candle.volume += quantity;
                if candle.volume > 0.0 {
                    candle.vwap = (candle.vwap * prev_volume + price * quantity) / candle.volume;
                } else {
                    candle.vwap = price;
                }
            }
            None => {
                // Candle timestamps are interval starts, not trade times
                let start = self.interval_start(timestamp);
                self.current = Some(Candle::from_trade(start, price, quantity));
            }
        }
    }

    /// Start of the interval containing `timestamp`
    fn interval_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.interval.as_secs() as i64;
        if secs <= 0 {
            return timestamp;
        }
        let t = timestamp.timestamp();
        Utc.timestamp_opt(t - t.rem_euclid(secs), 0)
            .single()
            .unwrap_or(timestamp)
    }

    /// Seal the open candle into history at an interval boundary and start
    /// a fresh one seeded from the last price
    ///
    /// `boundary` is the start of the new interval; a gap candle produced
    /// here is stamped one interval earlier, at the start of the span it
    /// summarizes. Returns the sealed candle, or None when no price has
    /// ever been seen.
    pub fn seal(&mut self, boundary: DateTime<Utc>) -> Option<Candle> {
        let sealed = match self.current.take() {
            Some(candle) => candle,
            None => {
                let start = boundary - chrono::Duration::seconds(self.interval.as_secs() as i64);
                Candle::flat(start, self.last_price?)
            }
        };

        self.push_sealed(sealed.clone());
        self.recompute_indicators();

        // Next interval opens flat at the last traded price
        if let Some(price) = self.last_price {
            self.current = Some(Candle::flat(boundary, price));
        }

        Some(sealed)
    }

    fn push_sealed(&mut self, candle: Candle) {
        self.push_close(candle.close);
        self.candles.push_back(candle);
        while self.candles.len() > self.limit {
            self.candles.pop_front();
        }
    }

    fn push_close(&mut self, close: f64) {
        self.rsi_closes.push_back(close);
        while self.rsi_closes.len() > RSI_PERIOD {
            self.rsi_closes.pop_front();
        }
        self.macd_closes.push_back(close);
        while self.macd_closes.len() > MACD_SLOW {
            self.macd_closes.pop_front();
        }
    }

    fn recompute_indicators(&mut self) {
        let closes: Vec<f64> = self.candles.iter().map(|c| c.close).collect();
        self.ma5 = calculate_sma(&closes, 5);
        self.ma20 = calculate_sma(&closes, 20);
    }

    pub fn ma5(&self) -> Option<f64> {
        self.ma5
    }

    pub fn ma20(&self) -> Option<f64> {
        self.ma20
    }

    /// RSI over the rolling close buffer; neutral 50 until the buffer fills
    pub fn rsi(&self) -> f64 {
        let values: Vec<f64> = self.rsi_closes.iter().copied().collect();
        calculate_rsi(&values, RSI_PERIOD).unwrap_or(50.0)
    }

    pub fn macd(&self) -> MacdOutput {
        let values: Vec<f64> = self.macd_closes.iter().copied().collect();
        calculate_macd(&values, MACD_FAST, MACD_SLOW, MACD_SIGNAL)
    }

    /// -1 bearish, 0 neutral, +1 bullish from the MA5/MA20 cross
    pub fn ma_signal(&self) -> i8 {
        match (self.ma5, self.ma20) {
            (Some(fast), Some(slow)) if fast > slow => 1,
            (Some(fast), Some(slow)) if fast < slow => -1,
            _ => 0,
        }
    }

    /// -1 bearish, 0 neutral, +1 bullish from the MACD histogram
    pub fn macd_signal(&self) -> i8 {
        let histogram = self.macd().histogram;
        if histogram > 0.0 {
            1
        } else if histogram < 0.0 {
            -1
        } else {
            0
        }
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// The `n` most recent sealed candles, oldest first
    pub fn recent(&self, n: usize) -> Vec<Candle> {
        let skip = self.candles.len().saturating_sub(n);
        self.candles.iter().skip(skip).cloned().collect()
    }

    /// Abnormal volume: last candle above 5x the trailing 30-candle average
    pub fn detect_abnormal_volume(&self) -> bool {
        if self.candles.len() < 30 {
            return false;
        }
        let recent: Vec<&Candle> = self.candles.iter().rev().take(30).collect();
        let avg_volume: f64 = recent.iter().map(|c| c.volume).sum::<f64>() / 30.0;
        recent[0].volume > avg_volume * 5.0
    }

    /// Divergence: price and volume trending in opposite directions across
    /// the last five candles
    pub fn detect_price_volume_divergence(&self) -> bool {
        if self.candles.len() < 5 {
            return false;
        }
        let window: Vec<&Candle> = self.candles.iter().rev().take(5).collect();
        let price_trend = window[0].close - window[4].close;
        let volume_trend = window[0].volume - window[4].volume;
        (price_trend > 0.0 && volume_trend < 0.0) || (price_trend < 0.0 && volume_trend > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn five_minute(limit: usize) -> CandleAggregator {
        CandleAggregator::new(limit, std::time::Duration::from_secs(300))
    }

    fn seal_with_trades(agg: &mut CandleAggregator, prices: &[f64], boundary: DateTime<Utc>) {
        for &price in prices {
            agg.apply_trade(price, 1.0, boundary);
        }
        agg.seal(boundary);
    }

    #[test]
    fn test_trade_updates_open_candle() {
        let mut agg = five_minute(100);
        let now = Utc::now();

        agg.apply_trade(40.0, 1.0, now);
        agg.apply_trade(42.0, 2.0, now);
        agg.apply_trade(39.0, 1.0, now);
        agg.apply_trade(41.0, 1.0, now);

        let sealed = agg.seal(now).unwrap();
        assert_eq!(sealed.open, 40.0);
        assert_eq!(sealed.high, 42.0);
        assert_eq!(sealed.low, 39.0);
        assert_eq!(sealed.close, 41.0);
        assert_eq!(sealed.volume, 5.0);
        assert_eq!(sealed.trades, 4);
    }

    #[test]
    fn test_ohlc_invariant_holds() {
        let mut agg = five_minute(100);
        let now = Utc::now();
        for (i, prices) in [[40.0, 45.0, 38.0], [39.0, 36.0, 41.0], [41.0, 41.0, 41.0]]
            .iter()
            .enumerate()
        {
            let boundary = now + Duration::minutes(5 * i as i64);
            seal_with_trades(&mut agg, prices, boundary);
        }

        for candle in agg.recent(10) {
            assert!(candle.low <= candle.open.min(candle.close));
            assert!(candle.high >= candle.open.max(candle.close));
            assert!(candle.volume >= 0.0);
        }
    }

    #[test]
    fn test_vwap_weights_by_volume() {
        let mut agg = five_minute(100);
        let now = Utc::now();
        agg.apply_trade(40.0, 3.0, now);
        agg.apply_trade(44.0, 1.0, now);

        let sealed = agg.seal(now).unwrap();
        // (40*3 + 44*1) / 4 = 41
        assert!((sealed.vwap - 41.0).abs() < 1e-9);
    }

    #[test]
    fn test_seal_without_trades_produces_flat_candle() {
        let mut agg = five_minute(100);
        let now = Utc::now();
        agg.apply_trade(40.0, 1.0, now);
        agg.seal(now);

        // Stream stalls for two whole intervals
        let sealed = agg.seal(now + Duration::minutes(5)).unwrap();
        assert_eq!(sealed.volume, 0.0);
        assert_eq!(sealed.open, 40.0);
        assert_eq!(sealed.close, 40.0);

        let sealed = agg.seal(now + Duration::minutes(10)).unwrap();
        assert_eq!(sealed.volume, 0.0);
        assert_eq!(agg.len(), 3);
    }

    #[test]
    fn test_trade_candle_stamped_at_interval_start() {
        let mut agg = five_minute(100);
        // An aligned 5m boundary on the Unix clock
        let base = Utc.timestamp_opt(1_700_000_100, 0).unwrap();

        agg.apply_trade(40.0, 1.0, base + Duration::seconds(37));
        let sealed = agg.seal(base + Duration::seconds(300)).unwrap();
        assert_eq!(sealed.timestamp, base);
    }

    #[test]
    fn test_gap_candle_stamped_at_covered_interval() {
        let mut agg = five_minute(100);
        let base = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        agg.backfill(vec![Candle::flat(base - Duration::seconds(300), 40.0)]);

        // No trades seen since backfill: sealing covers [base, base+300)
        let gap = agg.seal(base + Duration::seconds(300)).unwrap();
        assert_eq!(gap.volume, 0.0);
        assert_eq!(gap.timestamp, base);
    }

    #[test]
    fn test_seal_with_no_history_returns_none() {
        let mut agg = five_minute(100);
        assert!(agg.seal(Utc::now()).is_none());
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let mut agg = five_minute(3);
        let now = Utc::now();
        for i in 0..5 {
            seal_with_trades(
                &mut agg,
                &[40.0 + i as f64],
                now + Duration::minutes(5 * i as i64),
            );
        }
        assert_eq!(agg.len(), 3);
        let recent = agg.recent(3);
        assert_eq!(recent[0].close, 42.0);
        assert_eq!(recent[2].close, 44.0);
    }

    #[test]
    fn test_ma_signals_need_history() {
        let mut agg = five_minute(100);
        assert_eq!(agg.ma_signal(), 0);

        let now = Utc::now();
        for i in 0..20 {
            seal_with_trades(
                &mut agg,
                &[40.0 + i as f64],
                now + Duration::minutes(5 * i as i64),
            );
        }

        assert!(agg.ma5().is_some());
        assert!(agg.ma20().is_some());
        // Rising closes put the fast average on top
        assert_eq!(agg.ma_signal(), 1);
    }

    #[test]
    fn test_rsi_neutral_until_buffer_full() {
        let mut agg = five_minute(100);
        let now = Utc::now();
        for i in 0..5 {
            seal_with_trades(
                &mut agg,
                &[40.0 + i as f64],
                now + Duration::minutes(5 * i as i64),
            );
        }
        assert_eq!(agg.rsi(), 50.0);

        for i in 5..20 {
            seal_with_trades(
                &mut agg,
                &[40.0 + i as f64],
                now + Duration::minutes(5 * i as i64),
            );
        }
        // All gains pins RSI at 100
        assert_eq!(agg.rsi(), 100.0);
    }

    #[test]
    fn test_backfill_seeds_indicators() {
        let mut agg = five_minute(100);
        let now = Utc::now();
        let history: Vec<Candle> = (0..30)
            .map(|i| {
                let mut c = Candle::flat(now + Duration::minutes(5 * i), 40.0 + i as f64);
                c.volume = 100.0;
                c
            })
            .collect();

        agg.backfill(history);

        assert_eq!(agg.len(), 30);
        assert!(agg.ma5().is_some());
        assert!(agg.ma20().is_some());
        assert_ne!(agg.rsi(), 50.0);
        assert_eq!(agg.last_price(), Some(69.0));
    }

    #[test]
    fn test_abnormal_volume_detection() {
        let mut agg = five_minute(100);
        let now = Utc::now();
        for i in 0..29 {
            let mut c = Candle::flat(now + Duration::minutes(5 * i), 40.0);
            c.volume = 100.0;
            agg.push_sealed(c);
        }
        assert!(!agg.detect_abnormal_volume());

        let mut spike = Candle::flat(now + Duration::minutes(150), 40.0);
        spike.volume = 10_000.0;
        agg.push_sealed(spike);
        assert!(agg.detect_abnormal_volume());
    }

    #[test]
    fn test_price_volume_divergence() {
        let mut agg = five_minute(100);
        let now = Utc::now();
        // Price rising while volume falls
        for i in 0..5 {
            let mut c = Candle::flat(now + Duration::minutes(5 * i), 40.0 + i as f64);
            c.volume = 100.0 - i as f64 * 10.0;
            agg.push_sealed(c);
        }
        assert!(agg.detect_price_volume_divergence());
    }
}
