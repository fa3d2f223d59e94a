pub mod config;
pub mod error;
pub mod record;
pub mod stats;
pub mod telemetry;

pub use config::{
    BenchConfig, EndpointConfig, GenerationConfig, TelemetryConfig, DEFAULT_HTML_PROMPT,
    DEFAULT_SAMPLER_CANDIDATES, DEFAULT_STORY_PROMPT, DEFAULT_SYSTEM_PROMPT, FALLBACK_SAMPLER,
};
pub use error::{Result, WattBenchError};
pub use record::{
    derived_tokens_per_second, unix_ms_now, Backend, BenchmarkRunRecord, MemoryHighWater,
    PromptSettings, RequestOutcome, RunFiles, TokenUsage, UnitKey,
};
pub use stats::{ChannelStatistics, PowerStatistics};
pub use telemetry::{
    parse_log_file, parse_log_text, strip_ansi, Channel, ChannelSeries, PowerSample,
    TelemetryParser,
};
