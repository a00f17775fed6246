use pairtrader::api::{
    AiAdvisor, BinanceClient, ExchangeApi, FearGreedClient, MockExchange,
};
use pairtrader::config::EngineConfig;
use pairtrader::correlation::CorrelationAnalyzer;
use pairtrader::engine::{StateManager, TradingEngine};
use pairtrader::market::MarketDataService;
use pairtrader::sentiment::SentimentAnalyzer;
use clap::Parser;
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant};

const SUMMARY_INTERVAL_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "pairtrader", about = "Single-pair spot trading bot")]
struct Args {
    /// Trading pair to run
    #[arg(long, default_value = "TRUMPUSDC")]
    symbol: String,

    /// Trade against an in-memory exchange instead of Binance
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> pairtrader::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let config = EngineConfig::from_env();

    tracing::info!("🚀 PairTrader starting for {}", args.symbol);

    let weights_sum = config.weights_sum();
    if (weights_sum - 1.0).abs() > 1e-6 {
        tracing::warn!("Signal weights sum to {weights_sum:.3}, expected 1.0");
    }

    let api = create_exchange(args.dry_run, &config)?;

    // Market data pipeline: stream, consumer and candle sealer tasks
    let market = Arc::new(MarketDataService::new(
        args.symbol.clone(),
        config.candle_interval,
        config.candle_limit,
    ));
    market.start(api.clone()).await?;

    let sentiment = Arc::new(SentimentAnalyzer::new(FearGreedClient::new()?));
    let correlation = Arc::new(CorrelationAnalyzer::new(api.clone(), args.symbol.clone()));
    let state_manager = Arc::new(StateManager::new(args.symbol.clone(), api.clone(), &config));
    let advisor = create_advisor();

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbol: {}", args.symbol);
    tracing::info!("  Quote asset: {}", config.quote_asset);
    tracing::info!("  Min confidence: {}", config.min_confidence);
    tracing::info!("  Risk per trade: {}%", config.risk_per_trade * 100.0);
    tracing::info!("  Max position: {} {}", config.max_position_size, config.quote_asset);
    tracing::info!("  Mode: {}", if args.dry_run { "dry run" } else { "live" });

    let engine = Arc::new(TradingEngine::new(
        args.symbol.clone(),
        config,
        market.clone(),
        sentiment,
        correlation,
        state_manager,
        api,
        advisor,
    ));

    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.run().await;
        })
    };

    let summary_task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            summary_loop(engine).await;
        })
    };

    tracing::info!("✅ All loops spawned, press Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = engine_task => {
            tracing::error!("Trading engine exited: {:?}", result);
        }
        result = summary_task => {
            tracing::error!("Summary loop exited: {:?}", result);
        }
    }

    market.stop();
    log_summary(&engine).await;
    tracing::info!("👋 PairTrader stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pairtrader=info".into()),
        )
        .init();
}

fn create_exchange(dry_run: bool, config: &EngineConfig) -> pairtrader::Result<Arc<dyn ExchangeApi>> {
    if dry_run {
        tracing::info!("Dry run: using in-memory exchange");
        let mock = MockExchange::new();
        mock.set_balance(&config.quote_asset, 100.0);
        return Ok(Arc::new(mock));
    }

    let api_key = std::env::var("BINANCE_TRADE_API_KEY")
        .map_err(|_| "BINANCE_TRADE_API_KEY not found in environment")?;
    let api_secret = std::env::var("BINANCE_TRADE_API_SECRET")
        .map_err(|_| "BINANCE_TRADE_API_SECRET not found in environment")?;

    Ok(Arc::new(BinanceClient::new(api_key, api_secret)?))
}

fn create_advisor() -> Option<AiAdvisor> {
    match std::env::var("OPENROUTER_API_KEY") {
        Ok(key) => match AiAdvisor::new(key) {
            Ok(advisor) => Some(advisor),
            Err(e) => {
                tracing::warn!("Failed to build AI advisor: {e:#}");
                None
            }
        },
        Err(_) => {
            tracing::warn!("OPENROUTER_API_KEY not set, AI consultation disabled");
            None
        }
    }
}

/// Periodic trading summary on the same cadence as candle sealing
async fn summary_loop(engine: Arc<TradingEngine>) {
    let mut ticker = interval_at(
        Instant::now() + Duration::from_secs(SUMMARY_INTERVAL_SECS),
        Duration::from_secs(SUMMARY_INTERVAL_SECS),
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        log_summary(&engine).await;
    }
}

async fn log_summary(engine: &TradingEngine) {
    let summary = engine.trading_summary().await;

    tracing::info!("\n📊 Trading Summary:");
    tracing::info!("  State: {}", summary.state);
    tracing::info!(
        "  Trades: {} total, {} closed, {} winning",
        summary.total_trades,
        summary.closed_trades,
        summary.winning_trades
    );
    tracing::info!("  Realized P&L: {:.4}", summary.total_profit_loss);

    if let Some(position) = summary.position {
        tracing::info!(
            "  Position: {} {} @ {:.4}",
            position.quantity,
            position.symbol,
            position.entry_price
        );
    }
}
