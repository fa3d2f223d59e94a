//! Telemetry around one benchmarked unit: power sampler plus RSS poller,
//! opened before the first request and closed after the last one settles.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use wattbench_core::{parse_log_file, MemoryHighWater, PowerStatistics, TelemetryConfig};

use crate::memory::{ProcessMatcher, RssPoller};
use crate::probe::{ProbeOutcome, SamplerProbe};
use crate::process::find_on_path;
use crate::sampler::{SamplerController, SamplerState, StartOutcome, StopOutcome};

/// Per-session telemetry state. The sampler probe runs at most once and its
/// answer is reused for every unit.
pub struct TelemetrySession {
    config: TelemetryConfig,
    /// Resolved once; `None` when telemetry is off or the tool is missing.
    tool: Option<PathBuf>,
    probe: OnceCell<Option<ProbeOutcome>>,
}

impl TelemetrySession {
    pub fn new(config: TelemetryConfig) -> Self {
        let tool = if config.enabled {
            find_on_path(&config.tool)
        } else {
            None
        };
        Self {
            config,
            tool,
            probe: OnceCell::new(),
        }
    }

    pub fn tool_available(&self) -> bool {
        self.tool.is_some()
    }

    /// Selector chosen by the probe, `None` when telemetry is off or the
    /// probe found nothing.
    pub async fn selected_samplers(&self) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        self.probe
            .get_or_init(|| async {
                let Some(tool) = &self.tool else {
                    warn!(
                        "{} not found; power stats will be empty",
                        self.config.tool.display()
                    );
                    return None;
                };
                SamplerProbe::new(
                    tool,
                    &self.config.candidates,
                    self.config.probe_samples,
                    self.config.probe_interval_ms,
                )
                .detect()
                .await
            })
            .await
            .as_ref()
            .map(|outcome| outcome.samplers.clone())
    }

    /// Starts the sampler (when enabled and installed), then the RSS poller.
    pub async fn open(&self, log_path: &Path, matcher: ProcessMatcher) -> TelemetryWindow {
        let samplers = self.selected_samplers().await;

        let sampler = if let Some(tool) = &self.tool {
            let mut sampler = SamplerController::new(
                tool,
                samplers.clone(),
                self.config.interval_ms,
                self.config.stop_grace(),
            );
            match sampler.start(log_path) {
                StartOutcome::Started { .. } => Some(sampler),
                StartOutcome::SpawnFailed(e) => {
                    warn!("Continuing without power telemetry: {}", e);
                    None
                }
                StartOutcome::InvalidState(state) => {
                    warn!(state = ?state, "Sampler refused to start");
                    None
                }
            }
        } else {
            debug!("Power telemetry unavailable for this window");
            None
        };

        let rss = RssPoller::spawn(matcher, self.config.rss_interval());

        TelemetryWindow {
            sampler,
            rss: Some(rss),
            samplers,
            log_path: log_path.to_path_buf(),
            join_wait: self.config.stop_grace(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowReadings {
    pub power: PowerStatistics,
    pub memory: MemoryHighWater,
    /// Set only when a sampler actually wrote this log.
    pub log_path: Option<PathBuf>,
}

/// Dropping an open window still kills the sampler and cancels the poller,
/// but only `close` yields readings.
pub struct TelemetryWindow {
    sampler: Option<SamplerController>,
    rss: Option<RssPoller>,
    samplers: Option<String>,
    log_path: PathBuf,
    join_wait: Duration,
}

impl TelemetryWindow {
    pub fn is_sampling(&self) -> bool {
        self.sampler
            .as_ref()
            .is_some_and(|s| s.state() == SamplerState::Running)
    }

    /// Stops the RSS poller, then the sampler, then parses the closed log.
    pub async fn close(mut self) -> WindowReadings {
        let memory = match self.rss.take() {
            Some(rss) => rss.stop(self.join_wait).await,
            None => MemoryHighWater::default(),
        };

        let Some(mut sampler) = self.sampler.take() else {
            return WindowReadings {
                power: PowerStatistics::unavailable(),
                memory,
                log_path: None,
            };
        };

        match sampler.stop().await {
            StopOutcome::Killed => warn!("Sampler had to be killed; log may be truncated"),
            outcome => debug!(outcome = ?outcome, "Sampler stopped"),
        }

        let series = parse_log_file(&self.log_path);
        let power = PowerStatistics::from_series(&series, self.samplers.take());
        if series.is_empty() {
            warn!(
                "No power readings in {} (powermetrics usually needs sudo)",
                self.log_path.display()
            );
        } else {
            info!(
                cpu = ?power.cpu_watts.avg,
                gpu = ?power.gpu_watts.avg,
                ane = ?power.ane_watts.avg,
                "Average power (W)"
            );
        }

        WindowReadings {
            power,
            memory,
            log_path: Some(self.log_path.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled() -> TelemetryConfig {
        TelemetryConfig {
            enabled: false,
            rss_interval_ms: 50,
            ..TelemetryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_window_has_no_power() {
        let dir = tempfile::tempdir().unwrap();
        let session = TelemetrySession::new(disabled());
        assert_eq!(session.selected_samplers().await, None);

        let log = dir.path().join("m_powermetrics.log");
        let window = session.open(&log, ProcessMatcher::ollama()).await;
        assert!(!window.is_sampling());
        let readings = window.close().await;

        assert_eq!(readings.power, PowerStatistics::unavailable());
        assert!(readings.log_path.is_none());
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn test_missing_tool_degrades_to_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let session = TelemetrySession::new(TelemetryConfig {
            tool: PathBuf::from("/no/such/powermetrics"),
            rss_interval_ms: 50,
            ..TelemetryConfig::default()
        });
        assert!(!session.tool_available());

        for unit in ["a", "b"] {
            let log = dir.path().join(format!("{}_powermetrics.log", unit));
            let window = session.open(&log, ProcessMatcher::ollama()).await;
            assert!(window.sampler.is_none());
            let readings = window.close().await;
            assert!(!readings.power.cpu_watts.is_available());
            assert!(readings.power.samplers.is_none());
            assert!(readings.log_path.is_none());
            // No spawn attempt, so the log file is never created.
            assert!(!log.exists());
        }
        assert_eq!(session.probe.get(), Some(&None));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Fake tool that appends one line per invocation to `calls` and
        /// prints a short powermetrics-like report.
        fn fake_tool(dir: &Path) -> PathBuf {
            let path = dir.join("powermetrics");
            let calls = dir.join("calls");
            let script = format!(
                r#"#!/bin/sh
echo "$*" >> "{}"
echo "CPU Power: 1500 mW"
echo "GPU Power: 2.5 W"
echo "ANE Power: 0 mW"
case "$*" in
  *-n*) exit 0 ;;
esac
echo "CPU Power: 2500 mW"
exec sleep 30
"#,
                calls.display()
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn session(tool: PathBuf) -> TelemetrySession {
            TelemetrySession::new(TelemetryConfig {
                tool,
                interval_ms: 100,
                probe_samples: 1,
                probe_interval_ms: 10,
                rss_interval_ms: 50,
                ..TelemetryConfig::default()
            })
        }

        #[tokio::test]
        async fn test_probe_runs_once_per_session() {
            let dir = tempfile::tempdir().unwrap();
            let session = session(fake_tool(dir.path()));

            let first = session.selected_samplers().await;
            let second = session.selected_samplers().await;
            assert_eq!(first.as_deref(), Some("cpu_power,gpu_power,ane_power"));
            assert_eq!(first, second);

            let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
            assert_eq!(calls.lines().count(), 1);
        }

        #[tokio::test]
        async fn test_window_reduces_logged_power() {
            let dir = tempfile::tempdir().unwrap();
            let session = session(fake_tool(dir.path()));
            let log = dir.path().join("unit_powermetrics.log");

            let window = session.open(&log, ProcessMatcher::ollama()).await;
            assert!(window.is_sampling());
            tokio::time::sleep(Duration::from_millis(300)).await;
            let readings = window.close().await;

            assert_eq!(readings.log_path.as_deref(), Some(log.as_path()));
            assert_eq!(
                readings.power.samplers.as_deref(),
                Some("cpu_power,gpu_power,ane_power")
            );
            let cpu = &readings.power.cpu_watts;
            assert_eq!(cpu.samples, 2);
            assert_eq!(cpu.min, Some(1.5));
            assert_eq!(cpu.max, Some(2.5));
            assert_eq!(cpu.avg, Some(2.0));
            assert_eq!(readings.power.gpu_watts.avg, Some(2.5));
            assert_eq!(readings.power.ane_watts.samples, 1);
            assert_eq!(readings.power.ane_watts.avg, Some(0.0));
        }

        #[tokio::test]
        async fn test_dropped_window_kills_sampler() {
            let dir = tempfile::tempdir().unwrap();
            let session = session(fake_tool(dir.path()));
            let log = dir.path().join("dropped_powermetrics.log");

            let window = session.open(&log, ProcessMatcher::ollama()).await;
            let pid = window
                .sampler
                .as_ref()
                .and_then(|s| s.pid())
                .unwrap();
            assert!(crate::sampler::tests::is_alive(pid));

            drop(window);
            assert!(crate::sampler::tests::wait_until_gone(pid).await);
        }
    }
}
