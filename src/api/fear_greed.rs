use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;

const FEAR_GREED_API_BASE: &str = "https://api.alternative.me";

/// Client for the alternative.me crypto Fear & Greed index
#[derive(Clone)]
pub struct FearGreedClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct FearGreedResponse {
    data: Vec<FearGreedEntry>,
}

#[derive(Debug, Deserialize)]
struct FearGreedEntry {
    value: String,
    value_classification: String,
}

impl FearGreedClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(FEAR_GREED_API_BASE.to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, base_url })
    }

    /// Current index value on the 0-100 scale (0 = extreme fear)
    pub async fn get_index(&self) -> Result<f64> {
        let url = format!("{}/fng/", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Fear & Greed request failed")?
            .error_for_status()
            .context("Fear & Greed returned error status")?;

        let body: FearGreedResponse = response
            .json()
            .await
            .context("Failed to parse Fear & Greed response")?;

        let entry = body
            .data
            .first()
            .context("Fear & Greed response contained no data")?;

        let value: f64 = entry
            .value
            .parse()
            .context("Fear & Greed value not numeric")?;

        tracing::debug!(
            "Fear & Greed index: {} ({})",
            value,
            entry.value_classification
        );

        Ok(value.clamp(0.0, 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_index_parses_value() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/fng/")
            .with_status(200)
            .with_body(r#"{"name":"Fear and Greed Index","data":[{"value":"62","value_classification":"Greed","timestamp":"1700000000"}]}"#)
            .create_async()
            .await;

        let client = FearGreedClient::with_base_url(server.url()).unwrap();
        let value = client.get_index().await.unwrap();
        assert_eq!(value, 62.0);
    }

    #[tokio::test]
    async fn test_get_index_empty_data_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/fng/")
            .with_status(200)
            .with_body(r#"{"name":"Fear and Greed Index","data":[]}"#)
            .create_async()
            .await;

        let client = FearGreedClient::with_base_url(server.url()).unwrap();
        assert!(client.get_index().await.is_err());
    }
}
