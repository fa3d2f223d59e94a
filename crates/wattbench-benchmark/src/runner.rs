//! LM Studio model sweep: every local LLM, one at a time, with power and
//! memory telemetry around its single generation.

use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use wattbench_core::{
    Backend, BenchConfig, BenchmarkRunRecord, GenerationConfig, PromptSettings, Result, UnitKey,
    WattBenchError,
};

use crate::extract::extract_html;
use crate::layout::{settings_fingerprint, OutputLayout};
use crate::lmstudio::{LmStudioClient, LmsCli};
use crate::memory::ProcessMatcher;
use crate::report::ReportWriter;
use crate::window::TelemetrySession;

pub const DEFAULT_GPU_SETTING: &str = "max";

/// What a finished sweep left behind.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub out_dir: PathBuf,
    pub records: Vec<BenchmarkRunRecord>,
    /// Units skipped because a record already existed.
    pub skipped: Vec<String>,
    pub report: Option<PathBuf>,
}

impl SweepOutcome {
    pub fn failures(&self) -> usize {
        self.records.iter().filter(|r| r.error.is_some()).count()
    }
}

pub(crate) fn prompt_settings(generation: &GenerationConfig, gpu: Option<&str>) -> PromptSettings {
    PromptSettings {
        temperature: generation.temperature,
        top_p: generation.top_p,
        max_tokens: generation.max_tokens,
        gpu_setting: gpu.map(str::to_string),
        text: generation.prompt.clone(),
    }
}

pub(crate) fn path_string(path: &Path) -> String {
    path.display().to_string()
}

pub struct ModelSweepRunner<'a> {
    config: &'a BenchConfig,
    client: LmStudioClient,
    lms: LmsCli,
    telemetry: TelemetrySession,
    gpu_setting: String,
}

impl<'a> ModelSweepRunner<'a> {
    pub fn new(config: &'a BenchConfig, lms: LmsCli, gpu_setting: impl Into<String>) -> Self {
        Self {
            config,
            client: LmStudioClient::new(&config.endpoints.lmstudio_base),
            lms,
            telemetry: TelemetrySession::new(config.telemetry.clone()),
            gpu_setting: gpu_setting.into(),
        }
    }

    pub fn layout(&self) -> OutputLayout {
        let settings = settings_fingerprint(&self.config.generation, &self.gpu_setting);
        OutputLayout::for_settings(&self.config.output_root, Backend::LmStudio, &settings)
    }

    /// Starts the server, waits for it and lists the models to run.
    /// Any failure here is fatal for the sweep.
    pub async fn prepare(&self) -> Result<Vec<String>> {
        if !self.lms.is_installed() {
            return Err(WattBenchError::Config(format!(
                "{} not found on PATH; install LM Studio's CLI first",
                self.lms.program().display()
            )));
        }
        self.lms.start_server().await?;
        self.client.wait_until_ready().await?;

        let models = self.client.list_models(&self.lms).await?;
        if models.is_empty() {
            return Err(WattBenchError::Backend(
                "No local LLMs found. Download models in LM Studio first.".to_string(),
            ));
        }
        Ok(models)
    }

    pub async fn run(&self, models: &[String]) -> Result<SweepOutcome> {
        let layout = self.layout();
        layout.create()?;
        info!("Writing results to {}", layout.dir().display());

        match self.telemetry.selected_samplers().await {
            Some(samplers) => info!("Using powermetrics samplers: {}", samplers),
            None if self.telemetry.tool_available() => {
                warn!("Falling back to powermetrics default samplers; stats may be limited")
            }
            None => {}
        }

        let writer = ReportWriter::new(
            layout.dir(),
            "LM Studio Bench Report",
            Some(self.config.generation.prompt.clone()),
        );

        let mut records = Vec::with_capacity(models.len());
        for (i, model) in models.iter().enumerate() {
            info!("=== Benchmarking {} ({}/{}) ===", model, i + 1, models.len());
            let record = self.run_model(&layout, model).await;
            match layout.write_record(&record) {
                Ok(path) => info!("Saved {}", path.display()),
                Err(e) => error!("Failed to save record for {}: {}", model, e),
            }
            writer.regenerate().await;
            records.push(record);
        }

        Ok(SweepOutcome {
            out_dir: layout.dir().to_path_buf(),
            records,
            skipped: Vec::new(),
            report: Some(writer.report_path()),
        })
    }

    async fn run_model(&self, layout: &OutputLayout, model: &str) -> BenchmarkRunRecord {
        let key = UnitKey::Model(model.to_string());
        let mut record = BenchmarkRunRecord::new(
            key.clone(),
            Backend::LmStudio,
            prompt_settings(&self.config.generation, Some(&self.gpu_setting)),
        );
        record.files.raw_json = Some(path_string(&layout.record_path(&key)));

        self.lms.unload_all().await;
        match self.lms.load(model, &self.gpu_setting).await {
            Ok(elapsed) => record.load_time_seconds = Some(elapsed.as_secs_f64()),
            Err(e) => {
                warn!("Skipping generation for {}: {}", model, e);
                record.error = Some(format!("load_failed: {}", e));
                return record;
            }
        }

        let log_path = layout.power_log_path(&key);
        let window = self.telemetry.open(&log_path, ProcessMatcher::lmstudio()).await;

        let started = Instant::now();
        let result = self.client.chat(model, &self.config.generation).await;
        let elapsed = started.elapsed().as_secs_f64();

        let readings = window.close().await;
        record.power = readings.power;
        record.memory = Some(readings.memory);
        record.files.powermetrics_log = readings.log_path.as_deref().map(path_string);

        match result {
            Ok(completion) => {
                record.generation_time_seconds = Some(elapsed);
                record.usage = completion.token_usage();
                record.backend_stats = completion.stats.clone();
                record.model_info = completion.model_info.clone();
                record.runtime = completion.runtime.clone();
                record.tokens_per_second = record.pick_tokens_per_second();

                let text = completion.text().unwrap_or_default();
                let html_path = layout.html_path(&key);
                match std::fs::write(&html_path, extract_html(text)) {
                    Ok(()) => record.files.html = Some(path_string(&html_path)),
                    Err(e) => warn!("Could not write {}: {}", html_path.display(), e),
                }
                info!(
                    tokens_per_second = ?record.tokens_per_second,
                    "Generated in {:.2}s",
                    elapsed
                );
            }
            Err(e) => {
                warn!("Generation failed for {}: {}", model, e);
                record.error = Some(format!("generation_failed: {}", e));
            }
        }

        record
    }
}
