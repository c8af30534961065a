use anyhow::{anyhow, bail, Result};
use async_process::Command;
use async_std::future::timeout;
use std::io::ErrorKind;
use std::time::Duration;

/// Longest a diagnostic tool may run before it is killed.
pub(crate) const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a tool and return its stdout. A missing binary is reported as
/// "not installed" so callers can surface it verbatim. A tool that hangs
/// is killed after `TOOL_TIMEOUT`.
pub(crate) async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    run_tool_within(program, args, TOOL_TIMEOUT).await
}

pub(crate) async fn run_tool_within(
    program: &str,
    args: &[&str],
    limit: Duration,
) -> Result<String> {
    let running = Command::new(program).args(args).kill_on_drop(true).output();
    let output = timeout(limit, running)
        .await
        .map_err(|_| anyhow!("{} did not answer within {:?}", program, limit))?
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => anyhow!("{} is not installed", program),
            _ => anyhow!("{} could not be started: {}", program, e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} exited with {}: {}", program, output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[async_std::test]
    async fn hanging_tool_is_cut_off() {
        let err = run_tool_within("sleep", &["30"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "sleep did not answer within 100ms");
    }

    #[async_std::test]
    async fn missing_tool_is_not_installed() {
        let err = run_tool("steward-no-such-tool", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "steward-no-such-tool is not installed");
    }
}
