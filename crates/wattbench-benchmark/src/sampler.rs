//! Lifecycle of the background `powermetrics` process for one benchmarked unit.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use wattbench_core::FALLBACK_SAMPLER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: Option<u32> },
    SpawnFailed(String),
    InvalidState(SamplerState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period (or had already exited).
    Terminated,
    /// Ignored the graceful signal and was killed.
    Killed,
    NotRunning,
}

pub struct SamplerController {
    tool: PathBuf,
    samplers: Option<String>,
    interval_ms: u64,
    grace: Duration,
    state: SamplerState,
    child: Option<Child>,
    log_path: Option<PathBuf>,
    signals_sent: u32,
}

impl SamplerController {
    pub fn new(
        tool: impl Into<PathBuf>,
        samplers: Option<String>,
        interval_ms: u64,
        grace: Duration,
    ) -> Self {
        Self {
            tool: tool.into(),
            samplers,
            interval_ms,
            grace,
            state: SamplerState::Idle,
            child: None,
            log_path: None,
            signals_sent: 0,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Pid of the live child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Termination signals delivered so far.
    pub fn signals_sent(&self) -> u32 {
        self.signals_sent
    }

    pub fn samplers(&self) -> &str {
        self.samplers.as_deref().unwrap_or(FALLBACK_SAMPLER)
    }

    /// Spawns the sampler with stdout and stderr both going to `log_path`.
    /// Never fails the caller: a spawn error leaves the controller stopped.
    pub fn start(&mut self, log_path: &Path) -> StartOutcome {
        if self.state != SamplerState::Idle {
            warn!(state = ?self.state, "Sampler start ignored");
            return StartOutcome::InvalidState(self.state);
        }
        warn_if_unprivileged();

        match self.spawn(log_path) {
            Ok(child) => {
                let pid = child.id();
                info!(samplers = %self.samplers(), pid = ?pid, log = %log_path.display(), "Power sampler started");
                self.child = Some(child);
                self.log_path = Some(log_path.to_path_buf());
                self.state = SamplerState::Running;
                StartOutcome::Started { pid }
            }
            Err(e) => {
                warn!("Could not start {}: {}", self.tool.display(), e);
                self.state = SamplerState::Stopped;
                StartOutcome::SpawnFailed(e.to_string())
            }
        }
    }

    fn spawn(&self, log_path: &Path) -> std::io::Result<Child> {
        let stdout = File::create(log_path)?;
        let stderr = stdout.try_clone()?;
        let interval = self.interval_ms.to_string();

        Command::new(&self.tool)
            .args(["--samplers", self.samplers(), "-i", interval.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
    }

    /// Graceful signal, bounded wait, then a forced kill. Safe to call any
    /// number of times; only the first call on a running sampler signals it.
    pub async fn stop(&mut self) -> StopOutcome {
        match self.state {
            SamplerState::Running | SamplerState::Stopping => {}
            SamplerState::Idle | SamplerState::Stopped => return StopOutcome::NotRunning,
        }
        self.state = SamplerState::Stopping;

        let Some(mut child) = self.child.take() else {
            self.state = SamplerState::Stopped;
            return StopOutcome::NotRunning;
        };

        let outcome = self.terminate(&mut child).await;
        self.state = SamplerState::Stopped;
        debug!(outcome = ?outcome, "Power sampler stopped");
        outcome
    }

    async fn terminate(&mut self, child: &mut Child) -> StopOutcome {
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Sampler had already exited with {}", status);
            return StopOutcome::Terminated;
        }

        self.signals_sent += 1;
        if let Err(e) = send_terminate(child) {
            warn!("Graceful stop of sampler failed: {}", e);
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(_)) => StopOutcome::Terminated,
            Ok(Err(e)) => {
                warn!("Waiting for sampler failed: {}", e);
                self.force_kill(child).await
            }
            Err(_) => {
                warn!(
                    "Sampler still running after {}ms, killing",
                    self.grace.as_millis()
                );
                self.force_kill(child).await
            }
        }
    }

    async fn force_kill(&mut self, child: &mut Child) -> StopOutcome {
        self.signals_sent += 1;
        if let Err(e) = child.kill().await {
            warn!("Killing sampler failed: {}", e);
        }
        StopOutcome::Killed
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(target_os = "macos")]
fn warn_if_unprivileged() {
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        warn!("powermetrics likely needs sudo; power stats may be empty");
    }
}

#[cfg(not(target_os = "macos"))]
fn warn_if_unprivileged() {}
