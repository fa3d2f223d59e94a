//! End-to-end sweeps against in-process mock backends. No powermetrics is
//! available here, so every record must come out with null power stats and
//! populated timing and usage.

use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use wattbench_benchmark::{load_records, CloudSweepRunner, ConcurrencySweepRunner};
use wattbench_core::{BenchConfig, TelemetryConfig, UnitKey};

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn config(out: &Path) -> BenchConfig {
    let mut config = BenchConfig {
        output_root: out.to_path_buf(),
        telemetry: TelemetryConfig {
            tool: "/no/such/powermetrics".into(),
            rss_interval_ms: 50,
            ..TelemetryConfig::default()
        },
        ..BenchConfig::default()
    };
    config.generation.prompt = "write a short story".into();
    config.generation.request_timeout_secs = 10;
    config
}

fn mock_ollama(fail_generate: bool) -> Router {
    Router::new()
        .route("/", get(|| async { "Ollama is running" }))
        .route(
            "/api/generate",
            post(move |Json(body): Json<Value>| async move {
                if fail_generate {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"error": "model not found"})),
                    );
                }
                assert_eq!(body["stream"], false);
                (
                    StatusCode::OK,
                    Json(json!({
                        "model": body["model"],
                        "response": "Once upon a time in Cologne...",
                        "done": true,
                        "eval_count": 120,
                        "eval_duration": 2_000_000_000u64,
                        "load_duration": 5_000_000u64,
                        "prompt_eval_count": 12
                    })),
                )
            }),
        )
}

#[tokio::test]
async fn test_concurrency_sweep_degrades_without_powermetrics() {
    let base = serve(mock_ollama(false)).await;
    let out = tempfile::tempdir().unwrap();
    let mut config = config(out.path());
    config.endpoints.ollama_base = base;

    let runner = ConcurrencySweepRunner::new(&config, "qwen3-coder:latest", vec![1, 3]);
    runner.prepare().await.unwrap();
    let (outcome, summaries) = runner.run().await.unwrap();

    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.failures(), 0);
    assert_eq!(summaries.len(), 2);

    let level3 = &outcome.records[1];
    assert_eq!(level3.key, UnitKey::Concurrency(3));
    assert_eq!(level3.requests.len(), 3);
    assert_eq!(level3.tokens_per_second, Some(60.0));
    assert_eq!(level3.usage.total_tokens, Some(360));
    assert!(level3.generation_time_seconds.unwrap() > 0.0);
    assert!(level3.memory.is_some());
    assert!(level3.files.powermetrics_log.is_none());

    // Power keys are present, values are null.
    let on_disk: Value = serde_json::from_str(
        &std::fs::read_to_string(outcome.out_dir.join("concurrency_3.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(on_disk["concurrency"], 3);
    for channel in ["cpu_watts", "gpu_watts", "ane_watts"] {
        assert!(on_disk["power"][channel]["avg"].is_null(), "{}", channel);
        assert_eq!(on_disk["power"][channel]["samples"], 0);
    }

    let summary: Value = serde_json::from_str(
        &std::fs::read_to_string(outcome.out_dir.join("summary_report.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(summary.as_array().unwrap().len(), 2);
    assert_eq!(summary[0]["avg_tps"], 60.0);

    assert!(outcome.out_dir.join("index.html").exists());
    assert_eq!(load_records(&outcome.out_dir).unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_level_is_recorded_with_error() {
    let base = serve(mock_ollama(true)).await;
    let out = tempfile::tempdir().unwrap();
    let mut config = config(out.path());
    config.endpoints.ollama_base = base;

    let runner = ConcurrencySweepRunner::new(&config, "missing:latest", vec![2]);
    let (outcome, summaries) = runner.run().await.unwrap();

    assert!(summaries.is_empty());
    let record = &outcome.records[0];
    let error = record.error.as_deref().unwrap();
    assert!(error.starts_with("all 2 requests failed"), "{}", error);
    assert!(record.requests.iter().all(|r| r.error.is_some()));
    assert!(outcome.out_dir.join("concurrency_2.json").exists());
}

#[tokio::test]
async fn test_unreachable_ollama_is_fatal() {
    let out = tempfile::tempdir().unwrap();
    let mut config = config(out.path());
    config.endpoints.ollama_base = "http://127.0.0.1:9".into();

    let runner = ConcurrencySweepRunner::new(&config, "m", vec![1]);
    assert!(runner.prepare().await.is_err());
}

#[tokio::test]
async fn test_cloud_sweep_skips_finished_models() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let app = Router::new().route(
        "/api/v1/chat/completions",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(
                    headers.get("authorization").unwrap().to_str().unwrap(),
                    "Bearer sk-test"
                );
                assert_eq!(body["usage"]["include"], true);
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content":
                        "<think>plan</think>```html\n<html><body>board</body></html>\n```"}}],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 50, "total_tokens": 60, "cost": 0.0012}
                }))
            }
        }),
    );
    let base = serve(app).await;

    let out = tempfile::tempdir().unwrap();
    let mut config = config(out.path());
    config.telemetry.enabled = false;
    config.endpoints.openrouter_base = format!("{}/api/v1", base);
    config.endpoints.openrouter_api_key = Some("sk-test".into());

    let models = vec!["openai/gpt-4o".to_string(), "qwen/qwen3-coder".to_string()];
    let runner = CloudSweepRunner::new(&config, 2).unwrap();

    let first = runner.run(&models).await.unwrap();
    assert_eq!(first.records.len(), 2);
    assert!(first.skipped.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let record = first
        .records
        .iter()
        .find(|r| r.key == UnitKey::Model("openai/gpt-4o".into()))
        .unwrap();
    assert_eq!(record.usage.cost, Some(0.0012));
    assert!(record.tokens_per_second.unwrap() > 0.0);
    assert!(!record.power.cpu_watts.is_available());
    assert!(record.memory.is_none());

    let html = std::fs::read_to_string(first.out_dir.join("openai_gpt-4o.html")).unwrap();
    assert_eq!(html, "<html><body>board</body></html>");
    assert!(first.out_dir.join("openai_gpt-4o.txt").exists());

    let second = runner.run(&models).await.unwrap();
    assert!(second.records.is_empty());
    assert_eq!(second.skipped.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let report = std::fs::read_to_string(first.out_dir.join("index.html")).unwrap();
    assert!(report.contains("Generated from 2 result files."));
}

#[cfg(unix)]
mod lmstudio {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use wattbench_benchmark::{LmsCli, ModelSweepRunner};

    /// `lms` stand-in that accepts every subcommand.
    fn fake_lms(dir: &Path) -> PathBuf {
        let path = dir.join("lms");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_model_sweep_end_to_end() {
        let app = Router::new()
            .route(
                "/api/v0/models",
                get(|| async {
                    Json(json!({"data": [
                        {"id": "qwen3-8b", "type": "llm"},
                        {"id": "nomic-embed", "type": "embeddings"}
                    ]}))
                }),
            )
            .route(
                "/api/v0/chat/completions",
                post(|| async {
                    Json(json!({
                        "choices": [{"message": {"content": "plain answer"}}],
                        "usage": {"prompt_tokens": 5, "completion_tokens": 40, "total_tokens": 45},
                        "stats": {"tokens_per_second": 51.5, "time_to_first_token": 0.12},
                        "model_info": {"arch": "qwen3", "quant": "Q4_K_M"},
                        "runtime": {"name": "llama.cpp-mac-arm64"}
                    }))
                }),
            );
        let base = serve(app).await;

        let tools = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut config = config(out.path());
        config.endpoints.lmstudio_base = base;

        let runner = ModelSweepRunner::new(&config, LmsCli::new(fake_lms(tools.path())), "max");
        let models = runner.prepare().await.unwrap();
        assert_eq!(models, vec!["qwen3-8b"]);

        let outcome = runner.run(&models).await.unwrap();
        let record = &outcome.records[0];
        assert!(record.error.is_none(), "{:?}", record.error);
        assert!(record.load_time_seconds.is_some());
        assert_eq!(record.tokens_per_second, Some(51.5));
        assert_eq!(record.usage.completion_tokens, Some(40));
        assert_eq!(record.prompt.gpu_setting.as_deref(), Some("max"));
        assert!(record.power.samplers.is_none());
        assert!(record.power.gpu_watts.avg.is_none());

        let html = std::fs::read_to_string(outcome.out_dir.join("qwen3-8b.html")).unwrap();
        assert!(html.contains("plain answer"));
        assert!(outcome.out_dir.join("index.html").exists());
    }
}
