use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::models::{DepthLevel, MarketEvent, Side};

const STREAM_BASE: &str = "wss://stream.binance.com:9443/stream";
const MAX_RECONNECT_ATTEMPTS: u32 = 8;
const BACKOFF_BASE_SECS: u64 = 2;

/// Envelope used by the combined-stream endpoint
#[derive(Debug, Deserialize)]
struct CombinedMessage {
    stream: String,
    data: serde_json::Value,
}

/// Trade event fields, Binance wire names
#[derive(Debug, Deserialize)]
struct TradeMessage {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Depth diff event: arrays of [price, quantity] strings per side
#[derive(Debug, Deserialize)]
struct DepthMessage {
    #[serde(rename = "b", default)]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a", default)]
    asks: Vec<[String; 2]>,
}

/// Rolling 24h ticker event
#[derive(Debug, Deserialize)]
struct TickerMessage {
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "v")]
    volume_24h: String,
}

/// Consume the combined trade/depth/ticker stream for one symbol, pushing
/// typed events onto the channel
///
/// Reconnects with exponential backoff; after the retry cap the error is
/// fatal and propagates to the caller. Returns cleanly when the receiving
/// side of the channel goes away.
pub async fn run_market_stream(symbol: &str, tx: mpsc::Sender<MarketEvent>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!(
        "{STREAM_BASE}?streams={lower}@trade/{lower}@depth@100ms/{lower}@ticker"
    );

    let mut attempts: u32 = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                tracing::info!(%symbol, "Market stream connected");
                attempts = 0;

                let (_, mut read) = ws.split();
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if let Some(event) = parse_stream_message(&text) {
                                if tx.send(event).await.is_err() {
                                    tracing::info!("Event channel closed, stopping market stream");
                                    return Ok(());
                                }
                            }
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(frame)) => {
                            tracing::warn!(?frame, "Market stream closed by server");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!("Market stream read error: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Market stream connect failed: {e}");
            }
        }

        attempts += 1;
        if attempts > MAX_RECONNECT_ATTEMPTS {
            anyhow::bail!(
                "market stream for {symbol} gave up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts"
            );
        }

        let backoff = BACKOFF_BASE_SECS.pow(attempts.min(6));
        tracing::warn!(
            attempts,
            backoff_secs = backoff,
            "Reconnecting market stream"
        );
        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
    }
}

/// Parse one combined-stream frame into a MarketEvent
///
/// Unknown streams and malformed frames are dropped with a log line; the
/// feed must keep flowing regardless of any single bad message.
fn parse_stream_message(text: &str) -> Option<MarketEvent> {
    let envelope: CombinedMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Unparseable stream frame: {e}");
            return None;
        }
    };

    let kind = envelope.stream.rsplit('@').next()?;
    let result = match kind {
        "trade" => parse_trade(envelope.data),
        "ticker" => parse_ticker(envelope.data),
        _ if envelope.stream.contains("@depth") => parse_depth(envelope.data),
        _ => return None,
    };

    match result {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(stream = %envelope.stream, "Dropped malformed event: {e}");
            None
        }
    }
}

fn parse_trade(data: serde_json::Value) -> Result<MarketEvent> {
    let msg: TradeMessage = serde_json::from_value(data).context("trade fields")?;
    Ok(MarketEvent::Trade {
        price: msg.price.parse().context("trade price")?,
        quantity: msg.quantity.parse().context("trade quantity")?,
        is_buyer_maker: msg.is_buyer_maker,
        timestamp: Utc
            .timestamp_millis_opt(msg.trade_time)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn parse_depth(data: serde_json::Value) -> Result<MarketEvent> {
    let msg: DepthMessage = serde_json::from_value(data).context("depth fields")?;
    let mut updates = Vec::with_capacity(msg.bids.len() + msg.asks.len());

    for [price, quantity] in msg.bids {
        updates.push(DepthLevel {
            side: Side::Buy,
            price: price.parse().context("bid price")?,
            quantity: quantity.parse().context("bid quantity")?,
        });
    }
    for [price, quantity] in msg.asks {
        updates.push(DepthLevel {
            side: Side::Sell,
            price: price.parse().context("ask price")?,
            quantity: quantity.parse().context("ask quantity")?,
        });
    }

    Ok(MarketEvent::Depth { updates })
}

fn parse_ticker(data: serde_json::Value) -> Result<MarketEvent> {
    let msg: TickerMessage = serde_json::from_value(data).context("ticker fields")?;
    Ok(MarketEvent::Ticker {
        last_price: msg.last_price.parse().context("ticker price")?,
        volume_24h: msg.volume_24h.parse().context("ticker volume")?,
    })
}
