use std::time::Duration;
use tracing::instrument;
use wattbench_core::{GenerationConfig, Result, WattBenchError};

use crate::lmstudio::parse_completion;
use crate::ollama::{map_reqwest_error, truncate_chars};
use crate::openai::{ChatCompletion, ChatRequest, UsageOptions};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(base: &str, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| WattBenchError::Http(e.to_string()))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    #[instrument(skip(self, generation), fields(base = %self.base))]
    pub async fn chat(&self, model: &str, generation: &GenerationConfig) -> Result<ChatCompletion> {
        let mut request = ChatRequest::from_config(model, generation);
        request.usage = Some(UsageOptions { include: true });
        let timeout = generation.request_timeout();

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(WattBenchError::Backend(format!(
                "OpenRouter returned {} - {}",
                status,
                truncate_chars(&body, 500)
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        parse_completion(&body)
    }
}
