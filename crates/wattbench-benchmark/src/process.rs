use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use wattbench_core::{Result, WattBenchError};

/// Resolves `tool` the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn find_on_path(tool: &Path) -> Option<PathBuf> {
    if tool.components().count() > 1 {
        return tool.is_file().then(|| tool.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Runs a command to completion with captured output. A non-zero exit is
/// returned as `Ok`; callers decide what failure means.
pub async fn run_command<I, S>(program: &Path, args: I, timeout: Duration) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(WattBenchError::Tool(format!(
            "{} timed out after {}ms",
            program.display(),
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tool_not_found() {
        assert!(find_on_path(Path::new("definitely-not-a-real-tool-xyz")).is_none());
        assert!(find_on_path(Path::new("/no/such/dir/powermetrics")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_is_found_on_path() {
        assert!(find_on_path(Path::new("sh")).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_times_out() {
        let err = run_command(Path::new("sleep"), ["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, WattBenchError::Tool(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let out = run_command(Path::new("echo"), ["CPU Power: 1 W"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "CPU Power: 1 W");
    }
}
