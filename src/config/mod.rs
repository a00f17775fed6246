use std::time::Duration;

/// Tunable engine parameters
///
/// Defaults mirror a small-account setup: tight position caps, 0.1% fee per
/// leg, 5-minute candles. Weights are expected to sum to 1.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum fused confidence required to emit a signal
    pub min_confidence: f64,
    pub technical_weight: f64,
    pub sentiment_weight: f64,
    pub correlation_weight: f64,
    /// Fraction of available balance risked per trade
    pub risk_per_trade: f64,
    /// Maximum position value in quote currency
    pub max_position_size: f64,
    /// Exchange fee per leg (0.001 = 0.1%)
    pub fee_rate: f64,
    /// Lot-size step the instrument accepts
    pub lot_step: f64,
    /// Smallest order quantity the exchange accepts
    pub min_quantity: f64,
    /// Smallest order value (price x quantity) the exchange accepts
    pub min_notional: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// How often the decision cycle runs
    pub decision_interval: Duration,
    /// Candle sealing interval
    pub candle_interval: Duration,
    /// Sealed candles kept in memory
    pub candle_limit: usize,
    pub quote_asset: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            technical_weight: 0.4,
            sentiment_weight: 0.3,
            correlation_weight: 0.3,
            risk_per_trade: 0.1,
            max_position_size: 10.0,
            fee_rate: 0.001,
            lot_step: 0.001,
            min_quantity: 0.001,
            min_notional: 5.0,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.05,
            decision_interval: Duration::from_secs(1),
            candle_interval: Duration::from_secs(300),
            candle_limit: 1000,
            quote_asset: "USDC".to_string(),
        }
    }
}

impl EngineConfig {
    /// Apply environment overrides on top of the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_f64("MIN_CONFIDENCE") {
            config.min_confidence = v;
        }
        if let Some(v) = env_f64("RISK_PER_TRADE") {
            config.risk_per_trade = v;
        }
        if let Some(v) = env_f64("MAX_POSITION_SIZE") {
            config.max_position_size = v;
        }
        if let Some(v) = env_f64("DECISION_INTERVAL_SECS") {
            config.decision_interval = Duration::from_secs(v as u64);
        }
        if let Ok(v) = std::env::var("QUOTE_ASSET") {
            config.quote_asset = v;
        }

        config
    }

    /// Weight sanity check, logged once at startup
    pub fn weights_sum(&self) -> f64 {
        self.technical_weight + self.sentiment_weight + self.correlation_weight
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse::<f64>().ok())
}
