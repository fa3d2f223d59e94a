//! OpenRouter sweep. Models run concurrently; there is nothing local to
//! sample, so records carry no power or memory readings.

use futures::stream::{self, StreamExt};
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};
use wattbench_core::{
    derived_tokens_per_second, Backend, BenchConfig, BenchmarkRunRecord, Result, UnitKey,
    WattBenchError,
};

use crate::extract::extract_html;
use crate::layout::{settings_fingerprint, OutputLayout};
use crate::openrouter::OpenRouterClient;
use crate::report::ReportWriter;
use crate::runner::{path_string, prompt_settings, SweepOutcome};

pub const DEFAULT_CLOUD_CONCURRENCY: usize = 8;

/// One model id per line; blank lines are ignored.
pub fn read_models_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        WattBenchError::Config(format!("Models file not found at '{}': {}", path.display(), e))
    })?;
    Ok(parse_model_list(&text))
}

fn parse_model_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct CloudSweepRunner<'a> {
    config: &'a BenchConfig,
    client: OpenRouterClient,
    concurrency: usize,
}

impl<'a> CloudSweepRunner<'a> {
    /// Fails without an API key.
    pub fn new(config: &'a BenchConfig, concurrency: usize) -> Result<Self> {
        let key = config
            .endpoints
            .openrouter_api_key
            .as_deref()
            .ok_or_else(|| {
                WattBenchError::Config("OPENROUTER_API_KEY environment variable not set".into())
            })?;
        Ok(Self {
            config,
            client: OpenRouterClient::new(&config.endpoints.openrouter_base, key)?,
            concurrency: concurrency.max(1),
        })
    }

    pub fn layout(&self) -> OutputLayout {
        let settings = settings_fingerprint(&self.config.generation, "");
        OutputLayout::for_settings(&self.config.output_root, Backend::OpenRouter, &settings)
    }

    pub async fn run(&self, models: &[String]) -> Result<SweepOutcome> {
        let layout = self.layout();
        layout.create()?;

        let writer = ReportWriter::new(
            layout.dir(),
            "OpenRouter Bench Report",
            Some(self.config.generation.prompt.clone()),
        );
        writer.regenerate().await;
        info!("Report is at {}", writer.report_path().display());

        let results: Vec<std::result::Result<BenchmarkRunRecord, String>> = stream::iter(models)
            .map(|model| self.run_model(&layout, &writer, model))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        for result in results {
            match result {
                Ok(record) => records.push(record),
                Err(model) => skipped.push(model),
            }
        }

        let report = writer.regenerate().await;
        Ok(SweepOutcome {
            out_dir: layout.dir().to_path_buf(),
            records,
            skipped,
            report,
        })
    }

    /// `Err(model)` when a record already exists and the model was skipped.
    async fn run_model(
        &self,
        layout: &OutputLayout,
        writer: &ReportWriter,
        model: &str,
    ) -> std::result::Result<BenchmarkRunRecord, String> {
        let key = UnitKey::Model(model.to_string());
        if layout.has_record(&key) {
            info!("Skipping {} as results already exist", model);
            return Err(model.to_string());
        }

        let generation = &self.config.generation;
        let mut record = BenchmarkRunRecord::new(
            key.clone(),
            Backend::OpenRouter,
            prompt_settings(generation, None),
        );
        record.files.raw_json = Some(path_string(&layout.record_path(&key)));

        let started = Instant::now();
        match self.client.chat(model, generation).await {
            Ok(completion) => {
                let elapsed = started.elapsed().as_secs_f64();
                record.generation_time_seconds = Some(elapsed);
                record.usage = completion.token_usage();
                record.model_info = completion.model_info.clone();
                record.tokens_per_second =
                    derived_tokens_per_second(record.usage.completion_tokens, Some(elapsed));

                let text = completion.text_or_body().to_string();
                let raw_path = layout.raw_text_path(&key);
                match std::fs::write(&raw_path, &text) {
                    Ok(()) => record.files.raw_text = Some(path_string(&raw_path)),
                    Err(e) => warn!("Could not write {}: {}", raw_path.display(), e),
                }
                let html_path = layout.html_path(&key);
                match std::fs::write(&html_path, extract_html(&text)) {
                    Ok(()) => record.files.html = Some(path_string(&html_path)),
                    Err(e) => warn!("Could not write {}: {}", html_path.display(), e),
                }
                info!(cost = ?record.usage.cost, "{} done in {:.2}s", model, elapsed);
            }
            Err(e) => {
                warn!("Generation failed for {}: {}", model, e);
                record.error = Some(format!("generation_failed: {}", e));
            }
        }

        if let Err(e) = layout.write_record(&record) {
            error!("Failed to save record for {}: {}", model, e);
        }
        writer.regenerate().await;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_list_ignores_blanks() {
        let models = parse_model_list("openai/gpt-4o\n\n  anthropic/claude-sonnet-4  \n\t\n");
        assert_eq!(models, vec!["openai/gpt-4o", "anthropic/claude-sonnet-4"]);
    }

    #[test]
    fn test_response_without_content_keeps_body() {
        let body = r#"{"choices":[],"error":{"message":"Rate limit exceeded","code":429}}"#;
        let completion = crate::lmstudio::parse_completion(body).unwrap();
        assert_eq!(completion.text_or_body(), body);
        assert!(extract_html(completion.text_or_body()).contains("Rate limit exceeded"));

        let body = r#"{"choices":[{"message":{"content":"<html>ok</html>"}}]}"#;
        let completion = crate::lmstudio::parse_completion(body).unwrap();
        assert_eq!(completion.text_or_body(), "<html>ok</html>");
    }

    #[test]
    fn test_missing_models_file_is_config_error() {
        let err = read_models_file(Path::new("/no/such/models.txt")).unwrap_err();
        assert!(matches!(err, WattBenchError::Config(_)));
    }

    #[test]
    fn test_api_key_required() {
        let config = BenchConfig::default();
        assert!(matches!(
            CloudSweepRunner::new(&config, 4),
            Err(WattBenchError::Config(_))
        ));
    }

    #[test]
    fn test_layout_uses_openrouter_prefix() {
        let mut config = BenchConfig::default();
        config.endpoints.openrouter_api_key = Some("sk-test".into());
        let runner = CloudSweepRunner::new(&config, 0).unwrap();
        assert_eq!(runner.concurrency, 1);
        assert!(runner
            .layout()
            .dir()
            .to_string_lossy()
            .contains("openrouter-bench-"));
    }
}
