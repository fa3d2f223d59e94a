use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;
use wattbench_core::{Result, WattBenchError};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    host: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub eval_duration: Option<u64>,
    #[serde(default)]
    pub load_duration: Option<u64>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub prompt_eval_duration: Option<u64>,
}

impl GenerateResponse {
    /// Decode throughput reported by Ollama. Zero when no eval time was reported.
    pub fn tokens_per_second(&self) -> f64 {
        let eval_count = self.eval_count.unwrap_or(0) as f64;
        let eval_ns = self.eval_duration.unwrap_or(0) as f64;
        if eval_ns > 0.0 {
            eval_count / (eval_ns / 1_000_000_000.0)
        } else {
            0.0
        }
    }
}

pub(crate) fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> WattBenchError {
    if e.is_timeout() {
        WattBenchError::Timeout(timeout.as_secs())
    } else {
        WattBenchError::Http(e.to_string())
    }
}

impl OllamaClient {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Liveness check against the server root.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn ping(&self) -> Result<()> {
        let timeout = Duration::from_millis(1500);
        self.client
            .get(&self.host)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn list_models(&self) -> Result<Vec<OllamaModel>> {
        let url = format!("{}/api/tags", self.host);
        let timeout = Duration::from_secs(5);
        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        if !resp.status().is_success() {
            return Err(WattBenchError::Backend(format!(
                "Failed to list models: {}",
                resp.status()
            )));
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| WattBenchError::Http(e.to_string()))?;
        tracing::debug!(count = tags.models.len(), "Fetched models from Ollama");
        Ok(tags.models)
    }

    #[instrument(skip(self, prompt, params), fields(host = %self.host))]
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerateParams,
        timeout: Duration,
    ) -> Result<GenerateResponse> {
        let url = format!("{}/api/generate", self.host);

        let options = if params.temperature.is_some()
            || params.top_p.is_some()
            || params.max_tokens.is_some()
        {
            Some(GenerateOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                num_predict: params.max_tokens,
            })
        } else {
            None
        };

        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            options,
        };

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(WattBenchError::Backend(format!(
                "Generate failed: {} - {}",
                status, body
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        serde_json::from_str(&body).map_err(|e| {
            WattBenchError::Backend(format!(
                "Failed to parse response: {} - Body: {}",
                e,
                truncate_chars(&body, 500)
            ))
        })
    }
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
