use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Prompt used by the LM Studio and OpenRouter sweeps.
pub const DEFAULT_HTML_PROMPT: &str = r#"Create a fully functional Kanban board in a single HTML file using vanilla JavaScript (no frameworks like react).

Requirements:
- Columns: Backlog, In Progress, Review, Done.
- Cards must be:
  - draggable across columns,
  - editable in place,
  - persisted in localStorage (state survives reloads) - please use your own namespace,
  - deletable with a confirmation prompt.
- Each column provides an "Add card" action.
- Style with Tailwind via CDN.
- Add subtle CSS transitions and trigger a confetti animation when a card moves to "Done".
- Thoroughly comment the code.
- dont use window.alert or window.prompt to add/edit/delete cards
- if there are no cards yet, create some dummy cards
- modern and vibrant design

As answer return the plain HTML of the working application (script and styles included)
"#;

/// Prompt used by the Ollama concurrency sweep.
pub const DEFAULT_STORY_PROMPT: &str = "write a short story about the city of Cologne in Germany\n";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful front-end engineer.";

/// Sampler selectors, most specific first.
pub const DEFAULT_SAMPLER_CANDIDATES: &[&str] = &[
    "cpu_power,gpu_power,ane_power",
    "cpu_power,gpu_power",
    "cpu_energy,gpu_energy",
    "cpu_power",
    "gpu_power",
    "all",
];

/// Selector used when the probe found nothing usable.
pub const FALLBACK_SAMPLER: &str = "all";

/// Session configuration. Built once at startup and passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    pub output_root: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            telemetry: TelemetryConfig::default(),
            endpoints: EndpointConfig::default(),
            output_root: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// `-1` asks LM Studio / OpenRouter for an unbounded completion.
    #[serde(default)]
    pub max_tokens: Option<i32>,
    pub request_timeout_secs: u64,
}

impl GenerationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_HTML_PROMPT.to_string(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: Some(0.2),
            top_p: Some(0.95),
            max_tokens: Some(-1),
            request_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Path or name of the `powermetrics` binary.
    pub tool: PathBuf,
    pub interval_ms: u64,
    pub candidates: Vec<String>,
    pub probe_samples: u32,
    pub probe_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub rss_interval_ms: u64,
}

impl TelemetryConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn rss_interval(&self) -> Duration {
        Duration::from_millis(self.rss_interval_ms)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool: PathBuf::from("powermetrics"),
            interval_ms: 1000,
            candidates: DEFAULT_SAMPLER_CANDIDATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            probe_samples: 3,
            probe_interval_ms: 500,
            stop_grace_ms: 3000,
            rss_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub lmstudio_base: String,
    pub ollama_base: String,
    pub openrouter_base: String,
    #[serde(skip)]
    pub openrouter_api_key: Option<String>,
}

impl EndpointConfig {
    /// Reads `LMSTUDIO_API_BASE`, `OLLAMA_API_BASE` and `OPENROUTER_API_KEY`,
    /// keeping the defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lmstudio_base: std::env::var("LMSTUDIO_API_BASE").unwrap_or(defaults.lmstudio_base),
            ollama_base: std::env::var("OLLAMA_API_BASE").unwrap_or(defaults.ollama_base),
            openrouter_base: defaults.openrouter_base,
            openrouter_api_key: std::env::var("OPENROUTER_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            lmstudio_base: "http://127.0.0.1:1234".to_string(),
            ollama_base: "http://127.0.0.1:11434".to_string(),
            openrouter_base: "https://openrouter.ai/api/v1".to_string(),
            openrouter_api_key: None,
        }
    }
}
