//! The execution domain: one scratch directory plus one killable process.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tempfile::TempDir;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// How many times unloading polls for the process to be reaped.
pub const UNLOAD_ATTEMPTS: u32 = 10;

const FIRST_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// What happened while tearing a domain down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadReport {
    /// The domain process is known to be gone.
    pub reaped: bool,
    /// Polls spent waiting for it. Zero if it had already been waited on.
    pub attempts: u32,
    /// The scratch directory was removed.
    pub directory_removed: bool,
}

/// A throwaway, uniquely named directory hosting exactly one run.
///
/// Dropping the domain kills the process and removes the directory even if
/// [`unload`](Self::unload) is never reached, e.g. when the owning future is
/// cancelled.
#[derive(Debug)]
pub(crate) struct ExecutionDomain {
    dir: Option<TempDir>,
    child: Option<Child>,
    exited: bool,
}

impl ExecutionDomain {
    pub(crate) fn create(tag: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("csrepl-domain-{tag}-"))
            .tempdir()?;
        Ok(Self {
            dir: Some(dir),
            child: None,
            exited: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.as_ref().map_or_else(|| Path::new(""), TempDir::path)
    }

    /// Start the domain process with piped output and no stdin.
    pub(crate) fn spawn(&mut self, mut command: Command) -> io::Result<(ChildStdout, ChildStderr)> {
        let mut child = command
            .current_dir(self.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr was not piped"))?;
        self.child = Some(child);
        Ok((stdout, stderr))
    }

    /// Wait for the process to exit. Cancel-safe.
    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| io::Error::other("domain process was never started"))?;
        let status = child.wait().await?;
        self.exited = true;
        Ok(status)
    }

    /// Send a kill signal without waiting.
    pub(crate) fn kill(&mut self) {
        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.start_kill()
        {
            tracing::debug!(error = %e, "Kill signal not delivered");
        }
    }

    /// Kill, reap, remove the directory.
    pub(crate) async fn unload(mut self) -> UnloadReport {
        let mut report = UnloadReport {
            reaped: true,
            attempts: 0,
            directory_removed: false,
        };

        if let Some(mut child) = self.child.take()
            && !self.exited
        {
            report.reaped = false;
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Kill signal not delivered");
            }

            let mut backoff = FIRST_BACKOFF;
            for attempt in 1..=UNLOAD_ATTEMPTS {
                report.attempts = attempt;
                match child.try_wait() {
                    Ok(Some(_)) => {
                        report.reaped = true;
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to poll domain process");
                        break;
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }

            if !report.reaped {
                tracing::warn!(attempts = report.attempts, "Domain process was not reaped");
            }
        }

        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => report.directory_removed = true,
                Err(e) => {
                    tracing::warn!(dir = %path.display(), error = %e, "Failed to remove domain directory");
                }
            }
        }

        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unload_removes_directory() {
        let domain = ExecutionDomain::create("t").unwrap();
        let path = domain.path().to_path_buf();
        assert!(path.is_dir());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("csrepl-domain-t-"));

        let report = domain.unload().await;
        assert!(report.reaped);
        assert!(report.directory_removed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_directory() {
        let domain = ExecutionDomain::create("t").unwrap();
        let path = domain.path().to_path_buf();
        drop(domain);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unload_kills_a_running_process() {
        let mut domain = ExecutionDomain::create("t").unwrap();
        let mut command = Command::new("sh");
        command.arg("-c").arg("while :; do :; done");
        let _pipes = domain.spawn(command).unwrap();

        let report = domain.unload().await;
        assert!(report.reaped);
        assert!(report.attempts >= 1);
        assert!(report.attempts <= UNLOAD_ATTEMPTS);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waited_process_needs_no_polling() {
        let mut domain = ExecutionDomain::create("t").unwrap();
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 0");
        let _pipes = domain.spawn(command).unwrap();
        assert!(domain.wait().await.unwrap().success());

        let report = domain.unload().await;
        assert_eq!(report.attempts, 0);
        assert!(report.reaped);
    }
}
