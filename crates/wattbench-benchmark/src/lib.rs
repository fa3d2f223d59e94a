pub mod cloud;
pub mod concurrent;
pub mod extract;
pub mod layout;
pub mod lmstudio;
pub mod memory;
pub mod ollama;
pub mod openai;
pub mod openrouter;
pub mod probe;
pub mod process;
pub mod report;
pub mod runner;
pub mod sampler;
pub mod window;

pub use cloud::{read_models_file, CloudSweepRunner, DEFAULT_CLOUD_CONCURRENCY};
pub use concurrent::{
    summary_table, ConcurrencySweepRunner, LevelSummary, DEFAULT_LEVELS, DEFAULT_OLLAMA_MODEL,
};
pub use extract::extract_html;
pub use layout::{safe_file_stem, settings_hash, OutputLayout};
pub use lmstudio::{LmStudioClient, LmsCli};
pub use memory::{ProcessMatcher, RssPoller};
pub use ollama::{GenerateParams, GenerateResponse, OllamaClient, OllamaModel};
pub use openrouter::OpenRouterClient;
pub use probe::{ProbeOutcome, SamplerProbe};
pub use process::find_on_path;
pub use report::{generate_report, load_records, ReportWriter};
pub use runner::{ModelSweepRunner, SweepOutcome, DEFAULT_GPU_SETTING};
pub use sampler::{SamplerController, SamplerState, StartOutcome, StopOutcome};
pub use window::{TelemetrySession, TelemetryWindow, WindowReadings};
