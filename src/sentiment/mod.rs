use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::api::FearGreedClient;

/// Refresh market sentiment at most this often
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Aggregated market mood
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentimentSummary {
    /// Directional score in [-1, 1]; 0 is neutral
    pub score: f64,
    /// Fear & Greed index normalized to [0, 1]
    pub fear_greed: f64,
}

impl SentimentSummary {
    pub fn neutral() -> Self {
        Self {
            score: 0.0,
            fear_greed: 0.5,
        }
    }
}

/// Fetches and caches market sentiment
///
/// Failures never propagate: a stale or neutral summary is always returned,
/// so a sentiment outage cannot stall the decision cycle.
pub struct SentimentAnalyzer {
    client: FearGreedClient,
    cache: RwLock<Option<(Instant, SentimentSummary)>>,
}

impl SentimentAnalyzer {
    pub fn new(client: FearGreedClient) -> Self {
        Self {
            client,
            cache: RwLock::new(None),
        }
    }

    /// Current sentiment, served from cache within the TTL
    pub async fn analyze(&self) -> SentimentSummary {
        if let Some((fetched_at, summary)) = *self.cache.read().await {
            if fetched_at.elapsed() < CACHE_TTL {
                return summary;
            }
        }

        match self.client.get_index().await {
            Ok(index) => {
                let summary = summary_from_index(index);
                *self.cache.write().await = Some((Instant::now(), summary));
                tracing::debug!(
                    score = summary.score,
                    fear_greed = summary.fear_greed,
                    "Sentiment refreshed"
                );
                summary
            }
            Err(e) => {
                tracing::warn!("Sentiment fetch failed, using fallback: {e:#}");
                // Prefer the stale value over neutral if we have one
                self.cache
                    .read()
                    .await
                    .map(|(_, summary)| summary)
                    .unwrap_or_else(SentimentSummary::neutral)
            }
        }
    }

    #[cfg(test)]
    async fn prime_cache(&self, summary: SentimentSummary, age: Duration) {
        *self.cache.write().await = Some((Instant::now() - age, summary));
    }
}

/// Map the 0-100 index onto the summary: 50 is neutral, extremes are ±1
fn summary_from_index(index: f64) -> SentimentSummary {
    let fear_greed = (index / 100.0).clamp(0.0, 1.0);
    SentimentSummary {
        score: ((index - 50.0) / 50.0).clamp(-1.0, 1.0),
        fear_greed,
    }
}
