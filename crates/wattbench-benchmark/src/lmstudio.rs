use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use wattbench_core::{GenerationConfig, Result, WattBenchError};

use crate::ollama::{map_reqwest_error, truncate_chars};
use crate::openai::{ChatCompletion, ChatRequest};
use crate::process::{find_on_path, run_command};

const READY_POLLS: u32 = 60;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LmStudioClient {
    base: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<RestModel>,
}

#[derive(Debug, Deserialize)]
struct RestModel {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LsEntry {
    id: Option<String>,
    name: Option<String>,
    model: Option<String>,
}

impl LmStudioClient {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn rest_base(&self) -> String {
        format!("{}/api/v0", self.base)
    }

    fn openai_base(&self) -> String {
        format!("{}/v1", self.base)
    }

    /// One quick look at the REST models endpoint.
    pub async fn ping(&self) -> bool {
        self.client
            .get(format!("{}/models", self.rest_base()))
            .timeout(Duration::from_millis(1500))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Polls the REST models endpoint until it answers.
    #[instrument(skip(self), fields(base = %self.base))]
    pub async fn wait_until_ready(&self) -> Result<()> {
        for _ in 0..READY_POLLS {
            if self.ping().await {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(WattBenchError::Backend(format!(
            "LM Studio server didn't come up at {}",
            self.base
        )))
    }

    /// LLM ids from the REST API, falling back to `lms ls` when it lists none.
    #[instrument(skip(self, lms), fields(base = %self.base))]
    pub async fn list_models(&self, lms: &LmsCli) -> Result<Vec<String>> {
        let url = format!("{}/models", self.rest_base());
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

        let models: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| WattBenchError::Http(e.to_string()))?;

        let ids: Vec<String> = models
            .data
            .into_iter()
            .filter(|m| m.kind.as_deref() == Some("llm"))
            .filter_map(|m| m.id)
            .collect();

        if !ids.is_empty() {
            return Ok(ids);
        }

        debug!("REST listed no LLMs, asking lms");
        lms.list_llms().await
    }

    /// Chat via the REST API (which reports throughput stats), falling back
    /// to the OpenAI-compatible endpoint.
    #[instrument(skip(self, generation), fields(base = %self.base))]
    pub async fn chat(&self, model: &str, generation: &GenerationConfig) -> Result<ChatCompletion> {
        let request = ChatRequest::from_config(model, generation);
        let timeout = generation.request_timeout();

        let rest = self
            .client
            .post(format!("{}/chat/completions", self.rest_base()))
            .json(&request)
            .timeout(timeout)
            .send()
            .await;

        match rest {
            Ok(resp) if resp.status().is_success() => {
                let body = resp
                    .text()
                    .await
                    .map_err(|e| map_reqwest_error(e, timeout))?;
                return parse_completion(&body);
            }
            Ok(resp) => debug!(status = %resp.status(), "REST chat unavailable, using /v1"),
            Err(e) => debug!("REST chat failed ({}), using /v1", e),
        }

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.openai_base()))
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(WattBenchError::Backend(format!(
                "Chat failed: {} - {}",
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

pub(crate) fn parse_completion(body: &str) -> Result<ChatCompletion> {
    let mut completion: ChatCompletion = serde_json::from_str(body).map_err(|e| {
        WattBenchError::Backend(format!(
            "Failed to parse response: {} - Body: {}",
            e,
            truncate_chars(body, 500)
        ))
    })?;
    completion.raw_body = body.to_string();
    Ok(completion)
}

/// Wrapper around LM Studio's `lms` command line.
#[derive(Debug, Clone)]
pub struct LmsCli {
    program: PathBuf,
}

impl LmsCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn is_installed(&self) -> bool {
        find_on_path(&self.program).is_some()
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Starts the local API server. A non-zero exit is tolerated because
    /// `lms` reports an already running server that way.
    pub async fn start_server(&self) -> Result<()> {
        let out = run_command(&self.program, ["server", "start"], Duration::from_secs(60)).await?;
        if !out.status.success() {
            debug!(
                "lms server start exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }

    pub async fn unload_all(&self) {
        match run_command(&self.program, ["unload", "--all"], Duration::from_secs(120)).await {
            Ok(out) if !out.status.success() => debug!("lms unload --all exited with {}", out.status),
            Ok(_) => {}
            Err(e) => warn!("lms unload --all failed: {}", e),
        }
    }

    /// Loads a model with the given GPU offload setting; returns the load time.
    #[instrument(skip(self))]
    pub async fn load(&self, model: &str, gpu: &str) -> Result<Duration> {
        let start = Instant::now();
        let out = run_command(
            &self.program,
            ["load", model, "--gpu", gpu, "-y"],
            Duration::from_secs(900),
        )
        .await?;
        if !out.status.success() {
            return Err(WattBenchError::Tool(format!(
                "lms load {} failed: {}",
                model,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        let elapsed = start.elapsed();
        info!("Loaded {} in {:.2}s", model, elapsed.as_secs_f64());
        Ok(elapsed)
    }

    pub async fn list_llms(&self) -> Result<Vec<String>> {
        let out = run_command(
            &self.program,
            ["ls", "--llm", "--json"],
            Duration::from_secs(30),
        )
        .await?;
        if !out.status.success() {
            return Err(WattBenchError::Tool(format!("lms ls exited with {}", out.status)));
        }
        parse_ls_json(&String::from_utf8_lossy(&out.stdout))
    }
}

fn parse_ls_json(stdout: &str) -> Result<Vec<String>> {
    let entries: Vec<Option<LsEntry>> = serde_json::from_str(stdout)?;
    Ok(entries
        .into_iter()
        .flatten()
        .filter_map(|e| e.id.or(e.name).or(e.model))
        .collect())
}
