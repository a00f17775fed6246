use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::api::ExchangeApi;

/// Refresh the correlation estimate at most this often
const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// Reference pair the traded symbol is correlated against
const REFERENCE_SYMBOL: &str = "BTCUSDT";
const KLINE_INTERVAL: &str = "5m";
/// 24 hours of 5-minute candles
const KLINE_LIMIT: u32 = 288;

/// How strongly the pair tracks the reference market
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationSummary {
    /// Pearson coefficient in [-1, 1]
    pub coefficient: f64,
}

impl CorrelationSummary {
    pub fn neutral() -> Self {
        Self { coefficient: 0.0 }
    }

    pub fn strength(&self) -> &'static str {
        let magnitude = self.coefficient.abs();
        if magnitude >= 0.7 {
            "strong"
        } else if magnitude >= 0.4 {
            "moderate"
        } else {
            "weak"
        }
    }
}

/// Estimates correlation between the traded pair and the broad market
///
/// Failures never propagate: a stale or neutral summary is always returned.
pub struct CorrelationAnalyzer {
    api: Arc<dyn ExchangeApi>,
    symbol: String,
    cache: RwLock<Option<(Instant, CorrelationSummary)>>,
}

impl CorrelationAnalyzer {
    pub fn new(api: Arc<dyn ExchangeApi>, symbol: impl Into<String>) -> Self {
        Self {
            api,
            symbol: symbol.into(),
            cache: RwLock::new(None),
        }
    }

    /// Current correlation against the reference pair, cached within the TTL
    pub async fn analyze(&self) -> CorrelationSummary {
        if let Some((fetched_at, summary)) = *self.cache.read().await {
            if fetched_at.elapsed() < CACHE_TTL {
                return summary;
            }
        }

        match self.compute().await {
            Ok(summary) => {
                *self.cache.write().await = Some((Instant::now(), summary));
                tracing::debug!(
                    coefficient = summary.coefficient,
                    strength = summary.strength(),
                    "Correlation refreshed"
                );
                summary
            }
            Err(e) => {
                tracing::warn!("Correlation fetch failed, using fallback: {e:#}");
                self.cache
                    .read()
                    .await
                    .map(|(_, summary)| summary)
                    .unwrap_or_else(CorrelationSummary::neutral)
            }
        }
    }

    async fn compute(&self) -> anyhow::Result<CorrelationSummary> {
        let own = self
            .api
            .get_klines(&self.symbol, KLINE_INTERVAL, KLINE_LIMIT)
            .await?;
        let reference = self
            .api
            .get_klines(REFERENCE_SYMBOL, KLINE_INTERVAL, KLINE_LIMIT)
            .await?;

        // Align from the tail; feeds can return slightly different lengths
        let len = own.len().min(reference.len());
        if len < 10 {
            anyhow::bail!("not enough candles to correlate ({len})");
        }

        let own_closes: Vec<f64> = own[own.len() - len..].iter().map(|c| c.close).collect();
        let ref_closes: Vec<f64> = reference[reference.len() - len..]
            .iter()
            .map(|c| c.close)
            .collect();

        let coefficient = pearson(&own_closes, &ref_closes).unwrap_or(0.0);
        Ok(CorrelationSummary { coefficient })
    }
}

/// Pearson correlation coefficient; None for mismatched or degenerate series
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }

    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}
