pub mod state;

pub use state::{StateManager, TradeError, TradingState, TradingSummary};

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use crate::api::{AiAdvisor, ExchangeApi};
use crate::config::EngineConfig;
use crate::correlation::{CorrelationAnalyzer, CorrelationSummary};
use crate::market::MarketDataService;
use crate::models::{MarketSnapshot, Side, SignalBreakdown, TradingSignal};
use crate::sentiment::{SentimentAnalyzer, SentimentSummary};

/// Fuses market, sentiment and correlation inputs into orders
///
/// One decision cycle per tick: while an order is working the cycle only
/// polls its status; otherwise it scores the market and, above the
/// confidence threshold, places the next leg of the buy/sell cycle.
pub struct TradingEngine {
    symbol: String,
    config: EngineConfig,
    market: Arc<MarketDataService>,
    sentiment: Arc<SentimentAnalyzer>,
    correlation: Arc<CorrelationAnalyzer>,
    state_manager: Arc<StateManager>,
    api: Arc<dyn ExchangeApi>,
    advisor: Option<AiAdvisor>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        config: EngineConfig,
        market: Arc<MarketDataService>,
        sentiment: Arc<SentimentAnalyzer>,
        correlation: Arc<CorrelationAnalyzer>,
        state_manager: Arc<StateManager>,
        api: Arc<dyn ExchangeApi>,
        advisor: Option<AiAdvisor>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            config,
            market,
            sentiment,
            correlation,
            state_manager,
            api,
            advisor,
        }
    }

    /// Run decision cycles until the task is cancelled or market data stops
    pub async fn run(&self) {
        tracing::info!(symbol = %self.symbol, "Trading engine started");
        let mut ticker = tokio::time::interval(self.config.decision_interval);
        loop {
            ticker.tick().await;
            if !self.market.is_stream_alive() {
                tracing::error!("Market stream is dead, stopping trading engine");
                return;
            }
            if let Err(e) = self.decision_cycle().await {
                tracing::error!("Decision cycle failed: {e:#}");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }

    /// One pass: poll a working order, or score the market and maybe trade
    pub async fn decision_cycle(&self) -> Result<()> {
        match self.state_manager.state().await {
            TradingState::Buying | TradingState::Selling => {
                self.poll_active_order().await;
                return Ok(());
            }
            TradingState::ReadyToBuy | TradingState::ReadyToSell => {}
        }

        let snapshot = match self.market.snapshot().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("No market snapshot this cycle: {e:#}");
                return Ok(());
            }
        };
        let sentiment = self.sentiment.analyze().await;
        let correlation = self.correlation.analyze().await;

        let Some(signal) = self.generate_signal(&snapshot, sentiment, correlation).await else {
            return Ok(());
        };

        tracing::info!(
            "Signal: {} {:.4} @ {:.4}, confidence {:.2} (tech {:.2}, sent {:.2}, corr {:.2})",
            signal.action.as_str(),
            signal.quantity,
            signal.price,
            signal.confidence,
            signal.reasons.technical,
            signal.reasons.sentiment,
            signal.reasons.correlation
        );

        self.consult_advisor(&snapshot).await;
        self.execute_signal(signal).await
    }

    /// Check the working order with the exchange and feed the result back
    async fn poll_active_order(&self) {
        let Some(order) = self.state_manager.active_order().await else {
            return;
        };
        match self.api.get_order(&self.symbol, &order.id).await {
            Ok(update) => self.state_manager.handle_order_update(&update).await,
            Err(e) => tracing::warn!("Order status poll failed for {}: {e:#}", order.id),
        }
    }

    /// Weighted fusion of the three component scores
    ///
    /// Direction comes from the machine state (buy when flat, sell when
    /// holding); the fusion only decides whether conviction is high enough.
    async fn generate_signal(
        &self,
        snapshot: &MarketSnapshot,
        sentiment: SentimentSummary,
        correlation: CorrelationSummary,
    ) -> Option<TradingSignal> {
        let reasons = SignalBreakdown {
            technical: technical_score(snapshot),
            sentiment: sentiment_score(sentiment),
            correlation: correlation_score(correlation),
        };

        let confidence = reasons.technical * self.config.technical_weight
            + reasons.sentiment * self.config.sentiment_weight
            + reasons.correlation * self.config.correlation_weight;

        if confidence < self.config.min_confidence {
            tracing::debug!(
                "Confidence {:.2} below threshold {}, holding",
                confidence,
                self.config.min_confidence
            );
            return None;
        }

        let action = match self.state_manager.state().await {
            TradingState::ReadyToBuy => Side::Buy,
            TradingState::ReadyToSell => Side::Sell,
            _ => return None,
        };

        let quantity = match action {
            Side::Buy => self.position_size(snapshot.price).await,
            Side::Sell => self
                .state_manager
                .position()
                .await
                .map(|p| p.quantity)
                .unwrap_or(0.0),
        };
        if quantity <= 0.0 {
            return None;
        }

        Some(TradingSignal {
            action,
            confidence,
            price: snapshot.price,
            quantity,
            timestamp: Utc::now(),
            reasons,
        })
    }

    /// Risk-based sizing: a fraction of the balance, capped by the maximum
    /// position value
    async fn position_size(&self, price: f64) -> f64 {
        let balance = match self
            .api
            .get_available_balance(&self.config.quote_asset)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Balance check failed: {e:#}");
                return 0.0;
            }
        };

        let risk_amount = balance * self.config.risk_per_trade;
        let quantity = risk_amount / price;
        let max_quantity = self.config.max_position_size / price;
        quantity.min(max_quantity)
    }

    async fn execute_signal(&self, mut signal: TradingSignal) -> Result<()> {
        match signal.action {
            Side::Buy => {
                let available = self
                    .api
                    .get_available_balance(&self.config.quote_asset)
                    .await?;
                let required = signal.price * signal.quantity;

                if available < required {
                    // Retry with half the balance if that still clears the
                    // exchange minimum order value
                    let adjusted_value = available * 0.5;
                    if adjusted_value >= self.config.min_notional {
                        signal.quantity = adjusted_value / signal.price;
                        tracing::info!(
                            "Downsizing buy to {} (balance {:.2} < required {:.2})",
                            signal.quantity,
                            available,
                            required
                        );
                    } else {
                        tracing::warn!(
                            "Balance {:.2} too low for minimum order value {:.2}, skipping buy",
                            available,
                            self.config.min_notional
                        );
                        return Ok(());
                    }
                }

                let stop_loss = signal.price * (1.0 - self.config.stop_loss_pct);
                let take_profit = signal.price * (1.0 + self.config.take_profit_pct);
                tracing::info!(
                    "Buy targets: stop loss {:.4}, take profit {:.4}",
                    stop_loss,
                    take_profit
                );

                match self
                    .state_manager
                    .place_buy_order(signal.price, signal.quantity)
                    .await
                {
                    Ok(order) => {
                        tracing::info!("Buy order {} placed", order.id);
                    }
                    Err(e) => match e.downcast_ref::<TradeError>() {
                        Some(TradeError::InsufficientBalance { .. })
                        | Some(TradeError::BelowMinimumQuantity { .. }) => {
                            tracing::warn!("Buy not placed: {e}");
                        }
                        _ => return Err(e),
                    },
                }
            }
            Side::Sell => {
                match self
                    .state_manager
                    .place_sell_order(signal.price, signal.quantity)
                    .await
                {
                    Ok(order) => {
                        tracing::info!("Sell order {} placed", order.id);
                    }
                    Err(e) => match e.downcast_ref::<TradeError>() {
                        Some(TradeError::BelowMinimumQuantity { .. })
                        | Some(TradeError::NoPosition) => {
                            tracing::warn!("Sell not placed: {e}");
                        }
                        _ => return Err(e),
                    },
                }
            }
        }
        Ok(())
    }

    /// Ask the model for a second opinion and log it; verdicts never gate
    /// or alter the order flow
    async fn consult_advisor(&self, snapshot: &MarketSnapshot) {
        let Some(advisor) = &self.advisor else {
            return;
        };

        let state = self.state_manager.state().await;
        let summary = serde_json::json!({
            "price": snapshot.price,
            "volume_24h": snapshot.volume,
            "order_book_imbalance": snapshot.order_book_imbalance,
            "rsi": snapshot.rsi,
            "ma_signal": snapshot.ma_signal,
            "macd_signal": snapshot.macd_signal,
            "buy_sell_ratio": snapshot.buy_sell_ratio,
        })
        .to_string();

        match advisor.consult(&self.symbol, state.as_str(), &summary).await {
            Ok(verdict) => tracing::info!(
                action = %verdict.action,
                base_price = verdict.base_price,
                confidence = verdict.confidence,
                "AI advisory: {}",
                verdict.reasoning
            ),
            Err(e) => tracing::warn!("AI consultation skipped: {e:#}"),
        }
    }

    pub async fn trading_summary(&self) -> TradingSummary {
        self.state_manager.trading_summary().await
    }
}

/// Fraction of four technical checks that look bullish
fn technical_score(snapshot: &MarketSnapshot) -> f64 {
    let checks = [
        snapshot.ma_signal > 0,
        (30.0..=70.0).contains(&snapshot.rsi),
        snapshot.macd_signal > 0,
        snapshot.order_book_imbalance > 0.0,
    ];
    checks.iter().filter(|&&c| c).count() as f64 / checks.len() as f64
}

/// Confidence from combined mood: |avg(score, fear/greed)|
fn sentiment_score(sentiment: SentimentSummary) -> f64 {
    ((sentiment.score + sentiment.fear_greed) / 2.0).abs()
}

/// Stronger coupling to the reference market raises conviction
fn correlation_score(correlation: CorrelationSummary) -> f64 {
    correlation.coefficient.abs().min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockExchange;
    use crate::models::Candle;

    fn snapshot(ma: i8, rsi: f64, macd: i8, imbalance: f64) -> MarketSnapshot {
        MarketSnapshot {
            price: 40.0,
            volume: 50_000.0,
            timestamp: Utc::now(),
            bid_volume: 10.0,
            ask_volume: 8.0,
            order_book_imbalance: imbalance,
            ma_signal: ma,
            rsi,
            macd_signal: macd,
            buy_sell_ratio: 1.2,
            large_orders: 0,
            recent_candles: vec![],
        }
    }

    #[test]
    fn test_technical_score_counts_bullish_checks() {
        assert_eq!(technical_score(&snapshot(1, 50.0, 1, 0.2)), 1.0);
        assert_eq!(technical_score(&snapshot(1, 50.0, -1, 0.2)), 0.75);
        assert_eq!(technical_score(&snapshot(-1, 90.0, -1, -0.2)), 0.0);
        // RSI pinned at the edge of the band still counts
        assert_eq!(technical_score(&snapshot(-1, 70.0, -1, -0.2)), 0.25);
    }

    #[test]
    fn test_sentiment_score_is_magnitude() {
        let bullish = SentimentSummary {
            score: 0.6,
            fear_greed: 0.8,
        };
        assert!((sentiment_score(bullish) - 0.7).abs() < 1e-9);

        // Strong fear also yields conviction, direction comes from state
        let fearful = SentimentSummary {
            score: -0.9,
            fear_greed: 0.1,
        };
        assert!((sentiment_score(fearful) - 0.4).abs() < 1e-9);

        assert_eq!(sentiment_score(SentimentSummary::neutral()), 0.25);
    }

    #[test]
    fn test_correlation_score_uses_magnitude() {
        assert_eq!(
            correlation_score(CorrelationSummary { coefficient: -0.8 }),
            0.8
        );
        assert_eq!(
            correlation_score(CorrelationSummary { coefficient: 0.0 }),
            0.0
        );
    }

    fn engine_with_balance(balance: f64, min_confidence: f64) -> (TradingEngine, Arc<MockExchange>) {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_balance("USDC", balance);
        // Correlation needs kline history to produce a score
        let candles: Vec<Candle> = (0..50)
            .map(|i| Candle::flat(Utc::now(), 40.0 + i as f64 * 0.1))
            .collect();
        exchange.set_klines(candles);

        let mut config = EngineConfig::default();
        config.min_confidence = min_confidence;

        let api: Arc<dyn ExchangeApi> = exchange.clone();
        let market = Arc::new(MarketDataService::new(
            "TRUMPUSDC",
            config.candle_interval,
            config.candle_limit,
        ));
        let sentiment = Arc::new(SentimentAnalyzer::new(
            crate::api::FearGreedClient::with_base_url("http://127.0.0.1:1".to_string()).unwrap(),
        ));
        let correlation = Arc::new(CorrelationAnalyzer::new(api.clone(), "TRUMPUSDC"));
        let state_manager = Arc::new(StateManager::new("TRUMPUSDC", api.clone(), &config));

        let engine = TradingEngine::new(
            "TRUMPUSDC",
            config,
            market,
            sentiment,
            correlation,
            state_manager,
            api,
            None,
        );
        (engine, exchange)
    }

    #[tokio::test]
    async fn test_signal_fusion_against_threshold() {
        // technical 1.0, sentiment (0.2 + 0.8)/2 = 0.5, correlation 0.8
        // fused: 1.0*0.4 + 0.5*0.3 + 0.8*0.3 = 0.79
        let (engine, _) = engine_with_balance(100.0, 0.7);
        let sentiment = SentimentSummary {
            score: 0.2,
            fear_greed: 0.8,
        };
        let correlation = CorrelationSummary { coefficient: 0.8 };

        let signal = engine
            .generate_signal(&snapshot(1, 50.0, 1, 0.2), sentiment, correlation)
            .await
            .unwrap();
        assert_eq!(signal.action, Side::Buy);
        assert!((signal.confidence - 0.79).abs() < 1e-9);

        // Raise the bar above the fused score: no signal
        let (strict, _) = engine_with_balance(100.0, 0.8);
        assert!(strict
            .generate_signal(&snapshot(1, 50.0, 1, 0.2), sentiment, correlation)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_position_size_respects_cap() {
        let (engine, _) = engine_with_balance(1000.0, 0.7);
        // 10% risk would be 100 USDC, but max position value is 10 USDC
        let quantity = engine.position_size(40.0).await;
        assert!((quantity - 0.25).abs() < 1e-9);

        let (small, _) = engine_with_balance(50.0, 0.7);
        // 10% of 50 = 5 USDC, under the cap
        let quantity = small.position_size(40.0).await;
        assert!((quantity - 0.125).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_decision_cycle_places_buy_when_confident() {
        let (engine, exchange) = engine_with_balance(1000.0, 0.5);

        engine
            .market
            .apply_event(crate::models::MarketEvent::Ticker {
                last_price: 40.0,
                volume_24h: 50_000.0,
            })
            .await;
        engine
            .market
            .apply_event(crate::models::MarketEvent::Depth {
                updates: vec![crate::models::DepthLevel {
                    side: Side::Buy,
                    price: 39.9,
                    quantity: 5.0,
                }],
            })
            .await;

        engine.decision_cycle().await.unwrap();

        let placed = exchange.placed_orders();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Buy);
        assert_eq!(engine.state_manager.state().await, TradingState::Buying);

        // Next cycle polls the (instantly filled) order
        engine.decision_cycle().await.unwrap();
        assert_eq!(
            engine.state_manager.state().await,
            TradingState::ReadyToSell
        );
    }

    #[tokio::test]
    async fn test_run_exits_when_stream_dies() {
        let (engine, _) = engine_with_balance(100.0, 0.7);
        engine.market.mark_stream_failed();

        tokio::time::timeout(std::time::Duration::from_secs(1), engine.run())
            .await
            .expect("engine should stop once market data is dead");
    }

    #[tokio::test]
    async fn test_buy_downsized_when_balance_is_short() {
        let (engine, exchange) = engine_with_balance(8.0, 0.5);

        let signal = TradingSignal {
            action: Side::Buy,
            confidence: 0.9,
            price: 40.0,
            quantity: 0.25, // requires 10 USDC, only 8 available
            timestamp: Utc::now(),
            reasons: SignalBreakdown {
                technical: 1.0,
                sentiment: 0.5,
                correlation: 1.0,
            },
        };
        engine.execute_signal(signal).await.unwrap();

        // Half the balance is 4 USDC, below the 5 USDC minimum: no order
        assert!(exchange.placed_orders().is_empty());

        let (engine, exchange) = engine_with_balance(16.0, 0.5);
        let signal = TradingSignal {
            action: Side::Buy,
            confidence: 0.9,
            price: 40.0,
            quantity: 0.5, // requires 20 USDC, only 16 available
            timestamp: Utc::now(),
            reasons: SignalBreakdown {
                technical: 1.0,
                sentiment: 0.5,
                correlation: 1.0,
            },
        };
        engine.execute_signal(signal).await.unwrap();

        // Half of 16 is 8 USDC, above the minimum: buy 8/40 = 0.2
        let placed = exchange.placed_orders();
        assert_eq!(placed.len(), 1);
        assert!((placed[0].quantity - 0.2).abs() < 1e-9);
    }
}
