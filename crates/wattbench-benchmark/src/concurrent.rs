//! Ollama concurrency sweep: one model, increasing numbers of parallel
//! requests, one telemetry window per level.

use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use wattbench_core::{
    Backend, BenchConfig, BenchmarkRunRecord, PowerStatistics, RequestOutcome, Result, UnitKey,
    WattBenchError,
};

use crate::layout::{settings_fingerprint, OutputLayout};
use crate::memory::ProcessMatcher;
use crate::ollama::{GenerateParams, OllamaClient};
use crate::report::{write_atomic, ReportWriter};
use crate::runner::{path_string, prompt_settings, SweepOutcome};
use crate::window::TelemetrySession;

pub const DEFAULT_OLLAMA_MODEL: &str = "qwen3-coder:latest";
pub const DEFAULT_LEVELS: &[u32] = &[1, 2, 3, 4, 5, 6, 7, 8];

/// One row of `summary_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct LevelSummary {
    pub concurrency: u32,
    pub total_time_seconds: f64,
    pub avg_tps: f64,
    pub total_tokens: u64,
    pub ram_hwm_bytes: u64,
    pub power: PowerStatistics,
    pub runs: Vec<RequestOutcome>,
}

impl LevelSummary {
    /// `None` when no request of the level succeeded.
    pub fn from_record(record: &BenchmarkRunRecord) -> Option<Self> {
        let UnitKey::Concurrency(concurrency) = record.key else {
            return None;
        };
        if record.error.is_some() {
            return None;
        }
        Some(Self {
            concurrency,
            total_time_seconds: record.generation_time_seconds.unwrap_or_default(),
            avg_tps: record.tokens_per_second.unwrap_or_default(),
            total_tokens: record.usage.completion_tokens.unwrap_or_default(),
            ram_hwm_bytes: record.memory.map(|m| m.process_rss_hwm_bytes).unwrap_or_default(),
            power: record.power.clone(),
            runs: record.requests.clone(),
        })
    }
}

/// Fixed-width table matching the console summary of earlier runs.
pub fn summary_table(levels: &[LevelSummary]) -> String {
    fn watts(v: Option<f64>) -> String {
        v.map(|w| format!("{:.2}", w))
            .unwrap_or_else(|| "N/A".to_string())
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<13} | {:<10} | {:<15} | {:<15} | {:<15}",
        "Concurrency", "Avg TPS", "CPU Power (W)", "GPU Power (W)", "RAM HWM (GB)"
    );
    let _ = writeln!(out, "{}", "-".repeat(75));
    for level in levels {
        let _ = writeln!(
            out,
            "{:<13} | {:<10.2} | {:<15} | {:<15} | {:<15.2}",
            level.concurrency,
            level.avg_tps,
            watts(level.power.cpu_watts.avg),
            watts(level.power.gpu_watts.avg),
            level.ram_hwm_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
        );
    }
    out
}

pub struct ConcurrencySweepRunner<'a> {
    config: &'a BenchConfig,
    client: OllamaClient,
    telemetry: TelemetrySession,
    model: String,
    levels: Vec<u32>,
}

impl<'a> ConcurrencySweepRunner<'a> {
    pub fn new(config: &'a BenchConfig, model: impl Into<String>, levels: Vec<u32>) -> Self {
        Self {
            config,
            client: OllamaClient::new(&config.endpoints.ollama_base),
            telemetry: TelemetrySession::new(config.telemetry.clone()),
            model: model.into(),
            levels,
        }
    }

    pub fn layout(&self) -> OutputLayout {
        let levels: String = self.levels.iter().map(|l| l.to_string()).collect();
        let settings =
            settings_fingerprint(&self.config.generation, &format!("{}{}", self.model, levels));
        OutputLayout::for_settings(&self.config.output_root, Backend::Ollama, &settings)
    }

    /// Fails when the server is not reachable.
    pub async fn prepare(&self) -> Result<()> {
        if self.levels.is_empty() || self.levels.contains(&0) {
            return Err(WattBenchError::Config(
                "concurrency levels must be positive".to_string(),
            ));
        }
        self.client.ping().await.map_err(|e| {
            WattBenchError::Backend(format!(
                "Ollama server not found at {} ({}). Please ensure Ollama is running.",
                self.client.host(),
                e
            ))
        })
    }

    pub async fn run(&self) -> Result<(SweepOutcome, Vec<LevelSummary>)> {
        let layout = self.layout();
        layout.create()?;
        info!(model = %self.model, "Writing results to {}", layout.dir().display());

        if let Some(samplers) = self.telemetry.selected_samplers().await {
            info!("Using powermetrics samplers: {}", samplers);
        }

        let writer = ReportWriter::new(
            layout.dir(),
            format!("Ollama Concurrency Bench Report ({})", self.model),
            Some(self.config.generation.prompt.clone()),
        );

        let mut records = Vec::with_capacity(self.levels.len());
        let mut summaries = Vec::new();
        for &level in &self.levels {
            info!("--- Testing with {} parallel requests ---", level);
            let record = self.run_level(&layout, level).await;

            match LevelSummary::from_record(&record) {
                Some(summary) => {
                    info!(
                        avg_tps = summary.avg_tps,
                        total_time = summary.total_time_seconds,
                        "Level {} done",
                        level
                    );
                    summaries.push(summary);
                }
                None => error!("All requests failed for concurrency {}", level),
            }

            if let Err(e) = layout.write_record(&record) {
                error!("Failed to save record for level {}: {}", level, e);
            }
            writer.regenerate().await;
            records.push(record);
        }

        write_atomic(
            &layout.summary_path(),
            &serde_json::to_string_pretty(&summaries)?,
        )?;
        info!("Summary saved to {}", layout.summary_path().display());

        Ok((
            SweepOutcome {
                out_dir: layout.dir().to_path_buf(),
                records,
                skipped: Vec::new(),
                report: Some(writer.report_path()),
            },
            summaries,
        ))
    }

    async fn run_level(&self, layout: &OutputLayout, level: u32) -> BenchmarkRunRecord {
        let key = UnitKey::Concurrency(level);
        let generation = &self.config.generation;
        let mut record =
            BenchmarkRunRecord::new(key.clone(), Backend::Ollama, prompt_settings(generation, None));
        record.model_info = Some(serde_json::json!({ "model": self.model }));
        record.files.raw_json = Some(path_string(&layout.record_path(&key)));

        let params = GenerateParams {
            temperature: generation.temperature,
            top_p: generation.top_p,
            max_tokens: generation.max_tokens,
        };
        let prompt: Arc<str> = Arc::from(generation.prompt.as_str());
        let timeout = generation.request_timeout();

        let window = self
            .telemetry
            .open(&layout.power_log_path(&key), ProcessMatcher::ollama())
            .await;
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for _ in 0..level {
            let client = self.client.clone();
            let model = self.model.clone();
            let prompt = prompt.clone();
            let params = params.clone();
            tasks.spawn(async move {
                let t0 = Instant::now();
                match client.generate(&model, &prompt, &params, timeout).await {
                    Ok(resp) => RequestOutcome {
                        tokens_per_second: Some(resp.tokens_per_second()),
                        generation_time_seconds: Some(t0.elapsed().as_secs_f64()),
                        eval_count: resp.eval_count,
                        eval_duration_ns: resp.eval_duration,
                        error: None,
                    },
                    Err(e) => RequestOutcome::failed(e.to_string()),
                }
            });
        }

        let mut requests = Vec::with_capacity(level as usize);
        while let Some(joined) = tasks.join_next().await {
            requests.push(joined.unwrap_or_else(|e| RequestOutcome::failed(e.to_string())));
        }

        let total_time = started.elapsed().as_secs_f64();
        let readings = window.close().await;
        record.power = readings.power;
        record.memory = Some(readings.memory);
        record.files.powermetrics_log = readings.log_path.as_deref().map(path_string);
        record.generation_time_seconds = Some(total_time);

        let successes: Vec<&RequestOutcome> = requests.iter().filter(|r| r.is_success()).collect();
        if successes.is_empty() {
            for (i, r) in requests.iter().enumerate() {
                warn!("Request {} error: {}", i + 1, r.error.as_deref().unwrap_or("-"));
            }
            record.error = Some(format!(
                "all {} requests failed: {}",
                requests.len(),
                requests
                    .first()
                    .and_then(|r| r.error.as_deref())
                    .unwrap_or("unknown error")
            ));
        } else {
            let total_tokens: u64 = successes.iter().filter_map(|r| r.eval_count).sum();
            let avg_tps = successes
                .iter()
                .map(|r| r.tokens_per_second.unwrap_or_default())
                .sum::<f64>()
                / successes.len() as f64;
            record.usage.completion_tokens = Some(total_tokens);
            record.usage.total_tokens = Some(total_tokens);
            record.tokens_per_second = Some(avg_tps);
        }

        record.requests = requests;
        record
    }
}
