use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::stats::PowerStatistics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    LmStudio,
    Ollama,
    OpenRouter,
}

impl Backend {
    pub fn label(&self) -> &'static str {
        match self {
            Backend::LmStudio => "LM Studio",
            Backend::Ollama => "Ollama",
            Backend::OpenRouter => "OpenRouter",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Backend::LmStudio => "lmstudio",
            Backend::Ollama => "ollama",
            Backend::OpenRouter => "openrouter",
        }
    }
}

/// What one record was measured for: a model, or a concurrency level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKey {
    Model(String),
    Concurrency(u32),
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKey::Model(id) => write!(f, "{}", id),
            UnitKey::Concurrency(level) => write!(f, "concurrency {}", level),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    /// Billed cost in USD, reported by OpenRouter.
    #[serde(default)]
    pub cost: Option<f64>,
}

/// Only the maxima observed over the sampling window are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHighWater {
    pub process_rss_hwm_bytes: u64,
    pub system_used_hwm_bytes: u64,
}

/// One request issued inside a concurrency level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub tokens_per_second: Option<f64>,
    pub generation_time_seconds: Option<f64>,
    pub eval_count: Option<u64>,
    pub eval_duration_ns: Option<u64>,
    pub error: Option<String>,
}

impl RequestOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFiles {
    pub html: Option<String>,
    pub raw_text: Option<String>,
    pub powermetrics_log: Option<String>,
    pub raw_json: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptSettings {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<i32>,
    #[serde(default)]
    pub gpu_setting: Option<String>,
    pub text: String,
}

/// Persisted once per benchmarked unit and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRunRecord {
    #[serde(flatten)]
    pub key: UnitKey,
    pub backend: Backend,
    pub timestamp_ms: u64,
    pub load_time_seconds: Option<f64>,
    pub generation_time_seconds: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub usage: TokenUsage,
    #[serde(default)]
    pub backend_stats: Option<serde_json::Value>,
    #[serde(default)]
    pub model_info: Option<serde_json::Value>,
    #[serde(default)]
    pub runtime: Option<serde_json::Value>,
    pub power: PowerStatistics,
    pub memory: Option<MemoryHighWater>,
    #[serde(default)]
    pub requests: Vec<RequestOutcome>,
    pub files: RunFiles,
    pub prompt: PromptSettings,
    pub error: Option<String>,
}

impl BenchmarkRunRecord {
    pub fn new(key: UnitKey, backend: Backend, prompt: PromptSettings) -> Self {
        Self {
            key,
            backend,
            timestamp_ms: unix_ms_now(),
            load_time_seconds: None,
            generation_time_seconds: None,
            tokens_per_second: None,
            usage: TokenUsage::default(),
            backend_stats: None,
            model_info: None,
            runtime: None,
            power: PowerStatistics::unavailable(),
            memory: None,
            requests: Vec::new(),
            files: RunFiles::default(),
            prompt,
            error: None,
        }
    }

    /// Prefer the backend's own throughput figure, fall back to
    /// completion tokens over wall-clock generation time.
    pub fn pick_tokens_per_second(&self) -> Option<f64> {
        if let Some(stats) = self.backend_stats.as_ref().and_then(|v| v.as_object()) {
            for key in ["tokens_per_second", "token_per_second", "tok_per_sec", "tps"] {
                if let Some(v) = stats.get(key).and_then(|v| v.as_f64()) {
                    return Some(v);
                }
            }
        }
        derived_tokens_per_second(self.usage.completion_tokens, self.generation_time_seconds)
    }
}

pub fn derived_tokens_per_second(
    completion_tokens: Option<u64>,
    generation_time_seconds: Option<f64>,
) -> Option<f64> {
    match (completion_tokens, generation_time_seconds) {
        (Some(tokens), Some(secs)) if tokens > 0 && secs > 0.0 => Some(tokens as f64 / secs),
        _ => None,
    }
}

pub fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
