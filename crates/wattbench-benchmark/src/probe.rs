//! Finds a `powermetrics --samplers` selector that works on this machine.

use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::process::run_command;

/// Slack on top of `samples * interval` before a trial run is abandoned.
const PROBE_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// The selector that produced output.
    pub samplers: String,
    /// Everything the trial run wrote to stdout.
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct SamplerProbe<'a> {
    tool: &'a Path,
    candidates: &'a [String],
    samples: u32,
    interval_ms: u64,
}

impl<'a> SamplerProbe<'a> {
    pub fn new(tool: &'a Path, candidates: &'a [String], samples: u32, interval_ms: u64) -> Self {
        Self {
            tool,
            candidates,
            samples,
            interval_ms,
        }
    }

    fn trial_timeout(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_mul(self.samples as u64)) + PROBE_SLACK
    }

    /// Tries each candidate in order. The first one that exits cleanly with
    /// non-blank stdout wins; `None` when none does.
    #[instrument(skip(self), fields(tool = %self.tool.display(), samples = self.samples, interval_ms = self.interval_ms))]
    pub async fn detect(&self) -> Option<ProbeOutcome> {
        let samples = self.samples.to_string();
        let interval = self.interval_ms.to_string();
        let mut last_error: Option<String> = None;

        for candidate in self.candidates {
            let args = [
                "--samplers",
                candidate.as_str(),
                "-n",
                samples.as_str(),
                "-i",
                interval.as_str(),
            ];
            debug!(samplers = %candidate, "Trying sampler selector");

            match run_command(self.tool, args, self.trial_timeout()).await {
                Ok(out) if out.status.success() => {
                    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
                    if !stdout.trim().is_empty() {
                        info!(samplers = %candidate, "Using powermetrics samplers");
                        return Some(ProbeOutcome {
                            samplers: candidate.clone(),
                            output: stdout,
                        });
                    }
                    last_error = Some(format!("{}: no output", candidate));
                }
                Ok(out) => {
                    last_error = Some(format!(
                        "{}: exited with {}: {}",
                        candidate,
                        out.status,
                        String::from_utf8_lossy(&out.stderr).trim()
                    ));
                }
                Err(wattbench_core::WattBenchError::Io(e))
                    if e.kind() == std::io::ErrorKind::NotFound =>
                {
                    warn!("{} not found, power metrics unavailable", self.tool.display());
                    return None;
                }
                Err(e) => last_error = Some(format!("{}: {}", candidate, e)),
            }
        }

        if let Some(err) = last_error {
            warn!("powermetrics detection failed: {}", err);
        }
        None
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Fake tool: accepts only `cpu_power,gpu_power`; prints nothing for
    /// `cpu_energy,gpu_energy`; rejects everything else.
    fn fake_tool(dir: &Path) -> PathBuf {
        let path = dir.join("powermetrics");
        let script = r#"#!/bin/sh
case "$2" in
  "cpu_power,gpu_power") echo "CPU Power: 1200 mW"; echo "GPU Power: 40 mW" ;;
  "cpu_energy,gpu_energy") exit 0 ;;
  *) echo "unrecognized sampler: $2" >&2; exit 64 ;;
esac
"#;
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn candidates(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_first_working_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path());
        let list = candidates(&["cpu_power,gpu_power,ane_power", "cpu_power,gpu_power", "all"]);
        let outcome = SamplerProbe::new(&tool, &list, 1, 10).detect().await.unwrap();
        assert_eq!(outcome.samplers, "cpu_power,gpu_power");
        assert!(outcome.output.contains("CPU Power"));
    }

    #[tokio::test]
    async fn test_blank_output_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path());
        let list = candidates(&["cpu_energy,gpu_energy", "cpu_power,gpu_power"]);
        let outcome = SamplerProbe::new(&tool, &list, 1, 10).detect().await.unwrap();
        assert_eq!(outcome.samplers, "cpu_power,gpu_power");
    }

    #[tokio::test]
    async fn test_no_candidate_works() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path());
        let list = candidates(&["gpu_power", "cpu_energy,gpu_energy"]);
        assert!(SamplerProbe::new(&tool, &list, 1, 10).detect().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_tool_degrades() {
        let list = candidates(&["all"]);
        let tool = PathBuf::from("/no/such/powermetrics");
        assert!(SamplerProbe::new(&tool, &list, 1, 10).detect().await.is_none());
    }
}
