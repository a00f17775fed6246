use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "deepseek/deepseek-chat";
const MAX_RETRIES: u32 = 3;

/// Advisory price suggestion from the language model
///
/// Purely informational: the engine logs verdicts but never trades on them.
#[derive(Debug, Clone, Deserialize)]
pub struct AiVerdict {
    pub action: String,
    pub base_price: f64,
    pub confidence: f64,
    pub reasoning: String,
}

/// OpenRouter chat-completions client asking for a second opinion on trades
#[derive(Clone)]
pub struct AiAdvisor {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl AiAdvisor {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, OPENROUTER_API_BASE.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let model =
            std::env::var("OPENROUTER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }

    /// Ask the model for a buy/sell price suggestion given a market summary
    pub async fn consult(&self, symbol: &str, state: &str, market_summary: &str) -> Result<AiVerdict> {
        let prompt = format!(
            "Analyze the following market data for {symbol} and suggest optimal buy/sell prices.\n\
             Current state: {state}\n\n\
             Market Data:\n{market_summary}\n\n\
             Consider price trends, order book imbalance, technical indicators and \
             trading fees (0.1% per trade).\n\
             Respond with ONLY a JSON object:\n\
             {{\"action\": \"buy\" or \"sell\", \"base_price\": number, \
             \"confidence\": 0.0 to 1.0, \"reasoning\": \"brief explanation\"}}"
        );

        let payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let url = format!("{}/chat/completions", self.base_url);

        for attempt in 1..=MAX_RETRIES {
            let response = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: ChatResponse = resp
                        .json()
                        .await
                        .context("Failed to parse chat response")?;
                    let content = &body
                        .choices
                        .first()
                        .context("Chat response contained no choices")?
                        .message
                        .content;
                    return parse_verdict(content);
                }
                Ok(resp) => {
                    let status = resp.status();
                    tracing::warn!(
                        "AI consultation returned {} (attempt {}/{})",
                        status,
                        attempt,
                        MAX_RETRIES
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "AI consultation failed: {} (attempt {}/{})",
                        e,
                        attempt,
                        MAX_RETRIES
                    );
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(std::time::Duration::from_secs(2u64.pow(attempt))).await;
            }
        }

        anyhow::bail!("AI consultation failed after {} attempts", MAX_RETRIES)
    }
}

/// Extract the verdict JSON, tolerating markdown code fences around it
fn parse_verdict(content: &str) -> Result<AiVerdict> {
    let stripped = if let Some(rest) = content.split("```json").nth(1) {
        rest.split("```").next().unwrap_or(rest)
    } else if let Some(rest) = content.split("```").nth(1) {
        rest
    } else {
        content
    };

    let mut verdict: AiVerdict =
        serde_json::from_str(stripped.trim()).context("AI verdict is not valid JSON")?;
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_plain_json() {
        let verdict = parse_verdict(
            r#"{"action":"buy","base_price":39.8,"confidence":0.75,"reasoning":"dip"}"#,
        )
        .unwrap();
        assert_eq!(verdict.action, "buy");
        assert_eq!(verdict.base_price, 39.8);
        assert_eq!(verdict.confidence, 0.75);
    }

    #[test]
    fn test_parse_verdict_strips_code_fence() {
        let content = "Here you go:\n```json\n{\"action\":\"sell\",\"base_price\":42.0,\"confidence\":1.4,\"reasoning\":\"overbought\"}\n```";
        let verdict = parse_verdict(content).unwrap();
        assert_eq!(verdict.action, "sell");
        // Out-of-range confidence is clamped
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn test_parse_verdict_rejects_garbage() {
        assert!(parse_verdict("I think you should buy low and sell high").is_err());
    }

    #[tokio::test]
    async fn test_consult_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"{\"action\":\"buy\",\"base_price\":39.9,\"confidence\":0.8,\"reasoning\":\"support held\"}"}}]}"#,
            )
            .create_async()
            .await;

        let advisor = AiAdvisor::with_base_url("test-key".to_string(), server.url()).unwrap();
        let verdict = advisor
            .consult("TRUMPUSDC", "READY_TO_BUY", "{}")
            .await
            .unwrap();

        assert_eq!(verdict.action, "buy");
        assert_eq!(verdict.base_price, 39.9);
    }
}
