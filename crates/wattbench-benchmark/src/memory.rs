//! Resident-memory high-water mark of the backend's processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wattbench_core::MemoryHighWater;

/// Selects backend processes by lowercase substring of name or command line.
#[derive(Debug, Clone, Default)]
pub struct ProcessMatcher {
    name_patterns: Vec<String>,
    cmdline_patterns: Vec<String>,
}

impl ProcessMatcher {
    pub fn new<N, C>(names: N, cmdlines: C) -> Self
    where
        N: IntoIterator,
        N::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            name_patterns: names.into_iter().map(|p| p.into().to_lowercase()).collect(),
            cmdline_patterns: cmdlines.into_iter().map(|p| p.into().to_lowercase()).collect(),
        }
    }

    pub fn ollama() -> Self {
        Self::new(["ollama"], Vec::<String>::new())
    }

    pub fn lmstudio() -> Self {
        Self::new(["lm studio"], ["lmstudio", "lms "])
    }

    pub fn matches(&self, name: &str, cmdline: &str) -> bool {
        let name = name.to_lowercase();
        let cmdline = cmdline.to_lowercase();
        self.name_patterns.iter().any(|p| name.contains(p.as_str()))
            || self.cmdline_patterns.iter().any(|p| cmdline.contains(p.as_str()))
    }
}

#[derive(Debug, Default)]
struct HighWaterCells {
    process_rss: AtomicU64,
    system_used: AtomicU64,
}

impl HighWaterCells {
    fn record(&self, process_rss: u64, system_used: u64) {
        self.process_rss.fetch_max(process_rss, Ordering::Relaxed);
        self.system_used.fetch_max(system_used, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MemoryHighWater {
        MemoryHighWater {
            process_rss_hwm_bytes: self.process_rss.load(Ordering::Relaxed),
            system_used_hwm_bytes: self.system_used.load(Ordering::Relaxed),
        }
    }
}

fn sample(system: &mut System, matcher: &ProcessMatcher) -> (u64, u64) {
    system.refresh_memory();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing()
            .with_memory()
            .with_cmd(UpdateKind::OnlyIfNotSet),
    );

    let rss = system
        .processes()
        .values()
        .filter(|p| {
            let name = p.name().to_string_lossy();
            let cmdline = p
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            matcher.matches(&name, &cmdline)
        })
        .map(|p| p.memory())
        .sum();

    let used = system
        .total_memory()
        .saturating_sub(system.available_memory());
    (rss, used)
}

/// Polls memory at a fixed interval until stopped, keeping only maxima.
pub struct RssPoller {
    cancel: CancellationToken,
    cells: Arc<HighWaterCells>,
    handle: Option<JoinHandle<()>>,
}

impl RssPoller {
    pub fn spawn(matcher: ProcessMatcher, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let cells = Arc::new(HighWaterCells::default());

        let handle = tokio::spawn(poll_loop(matcher, interval, cancel.clone(), cells.clone()));

        Self {
            cancel,
            cells,
            handle: Some(handle),
        }
    }

    /// Signals the poller and waits at most `wait` for it to finish. The
    /// maxima seen so far are returned either way.
    pub async fn stop(mut self, wait: Duration) -> MemoryHighWater {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(wait, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("RSS poller task failed: {}", e),
                Err(_) => warn!("RSS poller did not stop within {}ms", wait.as_millis()),
            }
        }
        let hwm = self.cells.snapshot();
        debug!(
            rss = hwm.process_rss_hwm_bytes,
            system = hwm.system_used_hwm_bytes,
            "RSS poller stopped"
        );
        hwm
    }
}

impl Drop for RssPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    matcher: ProcessMatcher,
    interval: Duration,
    cancel: CancellationToken,
    cells: Arc<HighWaterCells>,
) {
    let mut system = System::new();
    loop {
        let m = matcher.clone();
        let polled = tokio::task::spawn_blocking(move || {
            let reading = sample(&mut system, &m);
            (system, reading)
        })
        .await;

        match polled {
            Ok((sys, (rss, used))) => {
                system = sys;
                cells.record(rss, used);
            }
            Err(e) => {
                warn!("RSS sample failed: {}", e);
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
