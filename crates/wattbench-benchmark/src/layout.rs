//! Where a sweep writes its artifacts.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use wattbench_core::{Backend, BenchmarkRunRecord, GenerationConfig, Result, UnitKey};

pub const REPORT_FILE: &str = "index.html";
pub const SUMMARY_FILE: &str = "summary_report.json";

const MAX_STEM_CHARS: usize = 200;

static UNSAFE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("valid regex"));

/// Replaces each run of characters outside `[A-Za-z0-9_.-]` with `_` and
/// caps the result at 200 characters.
pub fn safe_file_stem(id: &str) -> String {
    let replaced = UNSAFE_RUN.replace_all(id, "_");
    replaced.chars().take(MAX_STEM_CHARS).collect()
}

/// First 10 hex characters of the SHA-256 of `settings`.
pub fn settings_hash(settings: &str) -> String {
    let digest = Sha256::digest(settings.as_bytes());
    let mut hex = String::with_capacity(10);
    for byte in digest.iter().take(5) {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// Settings that change the output of a run; runs sharing them share a
/// directory so reruns can skip finished units.
pub fn settings_fingerprint(generation: &GenerationConfig, extra: &str) -> String {
    fn opt<T: std::fmt::Display>(v: Option<T>) -> String {
        v.map(|v| v.to_string()).unwrap_or_default()
    }
    format!(
        "{}{}{}{}{}",
        generation.prompt,
        opt(generation.max_tokens),
        opt(generation.temperature),
        opt(generation.top_p),
        extra
    )
}

#[derive(Debug, Clone)]
pub struct OutputLayout {
    dir: PathBuf,
}

impl OutputLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<root>/<backend>-bench-<hash10>`
    pub fn for_settings(root: &Path, backend: Backend, settings: &str) -> Self {
        Self::new(root.join(format!(
            "{}-bench-{}",
            backend.slug(),
            settings_hash(settings)
        )))
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(key: &UnitKey) -> String {
        match key {
            UnitKey::Model(id) => safe_file_stem(id),
            UnitKey::Concurrency(level) => format!("concurrency_{}", level),
        }
    }

    pub fn record_path(&self, key: &UnitKey) -> PathBuf {
        self.dir.join(format!("{}.json", Self::stem(key)))
    }

    pub fn html_path(&self, key: &UnitKey) -> PathBuf {
        self.dir.join(format!("{}.html", Self::stem(key)))
    }

    pub fn raw_text_path(&self, key: &UnitKey) -> PathBuf {
        self.dir.join(format!("{}.txt", Self::stem(key)))
    }

    pub fn power_log_path(&self, key: &UnitKey) -> PathBuf {
        self.dir
            .join(format!("{}_powermetrics.log", Self::stem(key)))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(SUMMARY_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    pub fn has_record(&self, key: &UnitKey) -> bool {
        self.record_path(key).exists()
    }

    /// Writes the record as pretty JSON and returns its path.
    pub fn write_record(&self, record: &BenchmarkRunRecord) -> Result<PathBuf> {
        let path = self.record_path(&record.key);
        std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattbench_core::PromptSettings;

    #[test]
    fn test_safe_stem_collapses_runs() {
        assert_eq!(safe_file_stem("qwen/qwen3-coder:free"), "qwen_qwen3-coder_free");
        assert_eq!(safe_file_stem("a  //  b"), "a_b");
        assert_eq!(safe_file_stem("gemma-3.1_it"), "gemma-3.1_it");
        assert_eq!(safe_file_stem(&"x".repeat(250)).len(), 200);
    }

    #[test]
    fn test_settings_hash_is_stable_prefix() {
        // sha256("abc") = ba7816bf8f01cfea...
        assert_eq!(settings_hash("abc"), "ba7816bf8f");
        assert_ne!(settings_hash("abc"), settings_hash("abd"));
    }

    #[test]
    fn test_layout_paths() {
        let layout = OutputLayout::for_settings(Path::new("reports"), Backend::Ollama, "abc");
        assert_eq!(layout.dir(), Path::new("reports/ollama-bench-ba7816bf8f"));

        let level = UnitKey::Concurrency(3);
        assert!(layout
            .power_log_path(&level)
            .ends_with("concurrency_3_powermetrics.log"));

        let model = UnitKey::Model("openai/gpt-4o".into());
        assert!(layout.record_path(&model).ends_with("openai_gpt-4o.json"));
        assert!(layout.power_log_path(&model).ends_with("openai_gpt-4o_powermetrics.log"));
    }

    #[test]
    fn test_fingerprint_changes_with_sampling() {
        let mut generation = GenerationConfig::default();
        let a = settings_fingerprint(&generation, "");
        generation.temperature = Some(0.7);
        assert_ne!(a, settings_fingerprint(&generation, ""));
    }

    #[test]
    fn test_write_record_round_trips_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path().join("run"));
        layout.create().unwrap();

        let record = BenchmarkRunRecord::new(
            UnitKey::Model("m/x".into()),
            Backend::OpenRouter,
            PromptSettings::default(),
        );
        let path = layout.write_record(&record).unwrap();
        assert!(layout.has_record(&record.key));

        let back: BenchmarkRunRecord =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, record);
    }
}
