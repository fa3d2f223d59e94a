use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use wattbench_benchmark::{
    find_on_path, generate_report, read_models_file, summary_table, CloudSweepRunner,
    ConcurrencySweepRunner, LmStudioClient, LmsCli, ModelSweepRunner, OllamaClient, SamplerProbe,
    SweepOutcome, DEFAULT_CLOUD_CONCURRENCY, DEFAULT_GPU_SETTING, DEFAULT_LEVELS,
    DEFAULT_OLLAMA_MODEL,
};
use wattbench_core::{
    parse_log_text, BenchConfig, Channel, EndpointConfig, GenerationConfig, PowerStatistics,
    TelemetryConfig, DEFAULT_HTML_PROMPT, DEFAULT_SAMPLER_CANDIDATES, DEFAULT_STORY_PROMPT,
};

#[derive(Parser)]
#[command(name = "wattbench")]
#[command(about = "WattBench - LLM inference throughput and power benchmarking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by the sweeps. Unset values keep each sweep's defaults.
#[derive(Args, Clone, Debug, Default)]
struct CommonArgs {
    /// Read the prompt from a file
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    /// -1 asks for an unbounded completion
    #[arg(long, allow_negative_numbers = true)]
    max_tokens: Option<i32>,

    /// Per-request timeout
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// powermetrics sampling interval
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Skip power sampling entirely
    #[arg(long)]
    no_telemetry: bool,

    /// Path to the powermetrics binary
    #[arg(long)]
    powermetrics: Option<PathBuf>,

    /// Root directory for run folders
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find a working powermetrics sampler set and print a short reading
    Probe {
        /// Number of samples (-n)
        #[arg(long, default_value = "10")]
        samples: u32,

        /// Interval between samples in ms (-i)
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Save the raw powermetrics output here
        #[arg(long)]
        log: Option<PathBuf>,

        #[arg(long, default_value = "powermetrics")]
        powermetrics: PathBuf,
    },

    /// Benchmark every local LM Studio model
    Lmstudio {
        #[command(flatten)]
        common: CommonArgs,

        /// GPU offload passed to `lms load --gpu`
        #[arg(long, default_value = DEFAULT_GPU_SETTING)]
        gpu: String,

        #[arg(long, default_value = "lms")]
        lms: PathBuf,
    },

    /// Sweep parallel request counts against one Ollama model
    Ollama {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(short, long, default_value = DEFAULT_OLLAMA_MODEL)]
        model: String,

        /// Comma separated, e.g. 1,2,4,8
        #[arg(long, value_delimiter = ',')]
        levels: Vec<u32>,
    },

    /// Benchmark cloud models through OpenRouter
    Openrouter {
        #[command(flatten)]
        common: CommonArgs,

        /// One model id per line
        #[arg(long, default_value = "openrouter_models.txt")]
        models_file: PathBuf,

        /// Models benchmarked at the same time
        #[arg(long, default_value_t = DEFAULT_CLOUD_CONCURRENCY)]
        concurrency: usize,
    },

    /// Build an HTML report from a folder of result files
    Report {
        dir: PathBuf,

        /// Output file (default: <dir>/index.html)
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long, default_value = "LM Studio Bench Report")]
        title: String,

        /// File with the prompt text to embed
        #[arg(long)]
        prompt_file: Option<PathBuf>,
    },

    /// Show backend and tool availability
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Probe {
            samples,
            interval_ms,
            log,
            powermetrics,
        } => cmd_probe(&powermetrics, samples, interval_ms, log.as_deref()).await?,
        Commands::Lmstudio { common, gpu, lms } => cmd_lmstudio(&common, gpu, lms).await?,
        Commands::Ollama {
            common,
            model,
            levels,
        } => cmd_ollama(&common, model, levels).await?,
        Commands::Openrouter {
            common,
            models_file,
            concurrency,
        } => cmd_openrouter(&common, &models_file, concurrency).await?,
        Commands::Report {
            dir,
            out,
            title,
            prompt_file,
        } => cmd_report(&dir, out, &title, prompt_file.as_deref())?,
        Commands::Status => cmd_status().await?,
    }

    Ok(())
}

/// Folds CLI flags over a sweep's generation defaults and the environment.
fn build_config(common: &CommonArgs, defaults: GenerationConfig) -> Result<BenchConfig> {
    let mut generation = defaults;
    if let Some(path) = &common.prompt_file {
        generation.prompt = std::fs::read_to_string(path)
            .with_context(|| format!("reading prompt file {}", path.display()))?;
    }
    if common.temperature.is_some() {
        generation.temperature = common.temperature;
    }
    if common.top_p.is_some() {
        generation.top_p = common.top_p;
    }
    if common.max_tokens.is_some() {
        generation.max_tokens = common.max_tokens;
    }
    if let Some(secs) = common.timeout_secs {
        generation.request_timeout_secs = secs;
    }

    let mut telemetry = TelemetryConfig {
        enabled: !common.no_telemetry,
        ..TelemetryConfig::default()
    };
    if let Some(ms) = common.interval_ms {
        telemetry.interval_ms = ms;
    }
    if let Some(tool) = &common.powermetrics {
        telemetry.tool = tool.clone();
    }

    let mut config = BenchConfig {
        generation,
        telemetry,
        endpoints: EndpointConfig::from_env(),
        ..BenchConfig::default()
    };
    if let Some(dir) = &common.out_dir {
        config.output_root = dir.clone();
    }
    Ok(config)
}

fn print_outcome(outcome: &SweepOutcome) {
    println!();
    println!(
        "All done. {} units, {} failed, {} skipped.",
        outcome.records.len(),
        outcome.failures(),
        outcome.skipped.len()
    );
    println!("  Output: {}", outcome.out_dir.display());
    if let Some(report) = &outcome.report {
        println!("  Report: {}", report.display());
    }
    println!();
}

async fn cmd_probe(tool: &Path, samples: u32, interval_ms: u64, log: Option<&Path>) -> Result<()> {
    if find_on_path(tool).is_none() {
        bail!("'{}' not found on PATH (macOS only).", tool.display());
    }

    let candidates: Vec<String> = DEFAULT_SAMPLER_CANDIDATES
        .iter()
        .map(|s| s.to_string())
        .collect();
    let Some(outcome) = SamplerProbe::new(tool, &candidates, samples, interval_ms)
        .detect()
        .await
    else {
        bail!("No powermetrics sampler set produced output. Try running with sudo.");
    };

    if let Some(path) = log {
        std::fs::write(path, &outcome.output)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Saved raw log to {}", path.display());
    }

    let series = parse_log_text(&outcome.output);
    let stats = PowerStatistics::from_series(&series, Some(outcome.samplers.clone()));

    println!();
    println!("Using samplers: {}", outcome.samplers);
    println!("{:-<40}", "");
    for channel in Channel::ALL {
        let s = stats.channel(channel);
        match (s.min, s.avg, s.max) {
            (Some(min), Some(avg), Some(max)) => println!(
                "  {:<4} min {:>7.2} W  avg {:>7.2} W  max {:>7.2} W  ({} samples)",
                channel.label(),
                min,
                avg,
                max,
                s.samples
            ),
            _ => println!("  {:<4} n/a", channel.label()),
        }
    }
    if series.is_empty() {
        println!();
        println!("No power lines were recognized. Run with --log and share the log");
        println!("so the parser can be adapted to this macOS version.");
    }
    println!();
    Ok(())
}

async fn cmd_lmstudio(common: &CommonArgs, gpu: String, lms: PathBuf) -> Result<()> {
    let config = build_config(common, GenerationConfig::default())?;

    let runner = ModelSweepRunner::new(&config, LmsCli::new(lms), gpu);
    let models = runner.prepare().await?;
    println!("Found {} models: {:?}", models.len(), models);

    let outcome = runner.run(&models).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_ollama(common: &CommonArgs, model: String, levels: Vec<u32>) -> Result<()> {
    let defaults = GenerationConfig {
        prompt: DEFAULT_STORY_PROMPT.to_string(),
        system_prompt: None,
        temperature: None,
        top_p: None,
        max_tokens: None,
        ..GenerationConfig::default()
    };
    let config = build_config(common, defaults)?;
    let levels = if levels.is_empty() {
        DEFAULT_LEVELS.to_vec()
    } else {
        levels
    };

    let runner = ConcurrencySweepRunner::new(&config, model.clone(), levels);
    runner.prepare().await?;
    println!("Starting concurrent benchmark for model: {}", model);

    let (outcome, summaries) = runner.run().await?;
    println!();
    println!("--- Benchmark Summary ---");
    print!("{}", summary_table(&summaries));
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_openrouter(common: &CommonArgs, models_file: &Path, concurrency: usize) -> Result<()> {
    let defaults = GenerationConfig {
        prompt: DEFAULT_HTML_PROMPT.to_string(),
        temperature: Some(0.6),
        request_timeout_secs: 300,
        ..GenerationConfig::default()
    };
    let mut config = build_config(common, defaults)?;
    config.telemetry.enabled = false;

    let models = read_models_file(models_file)?;
    if models.is_empty() {
        bail!("No models found in '{}'.", models_file.display());
    }
    let runner = CloudSweepRunner::new(&config, concurrency)?;
    println!("Benchmarking {} models: {:?}", models.len(), models);

    let outcome = runner.run(&models).await?;
    print_outcome(&outcome);
    Ok(())
}

fn cmd_report(dir: &Path, out: Option<PathBuf>, title: &str, prompt_file: Option<&Path>) -> Result<()> {
    if !dir.is_dir() {
        bail!("'{}' is not a directory", dir.display());
    }
    let out = out.unwrap_or_else(|| dir.join("index.html"));
    let prompt = match prompt_file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("Ignoring prompt file {}: {}", path.display(), e);
                None
            }
        },
        None => None,
    };

    let count = generate_report(dir, &out, title, prompt.as_deref())?;
    println!("Wrote report with {} records: {}", count, out.display());
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let endpoints = EndpointConfig::from_env();

    println!("System Status:");
    println!("{:-<40}", "");

    let ollama = OllamaClient::new(&endpoints.ollama_base);
    match ollama.list_models().await {
        Ok(models) => {
            println!(
                "  Ollama ({}): connected ({} models available)",
                endpoints.ollama_base,
                models.len()
            );
            let pulled = models.iter().any(|m| m.name == DEFAULT_OLLAMA_MODEL);
            println!(
                "    {}: {}",
                DEFAULT_OLLAMA_MODEL,
                if pulled { "pulled" } else { "not pulled" }
            );
        }
        Err(e) => println!("  Ollama ({}): disconnected ({})", endpoints.ollama_base, e),
    }

    let lmstudio = LmStudioClient::new(&endpoints.lmstudio_base);
    let state = if lmstudio.ping().await {
        "connected"
    } else {
        "not reachable"
    };
    println!("  LM Studio ({}): {}", endpoints.lmstudio_base, state);

    let lms = LmsCli::new("lms");
    println!(
        "  lms CLI: {}",
        if lms.is_installed() { "installed" } else { "missing" }
    );

    let tool = TelemetryConfig::default().tool;
    match find_on_path(&tool) {
        Some(path) => println!("  powermetrics: {}", path.display()),
        None => println!("  powermetrics: missing (power stats unavailable)"),
    }

    println!(
        "  OPENROUTER_API_KEY: {}",
        if endpoints.openrouter_api_key.is_some() {
            "set"
        } else {
            "not set"
        }
    );

    Ok(())
}
