//! External helper processes
//!
//! The container backend shells out for decryption and the launcher starts
//! the decrypted executable directly. Both go through [`HelperRunner`] so the
//! orchestration logic can be exercised without spawning real processes.

use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured result of a helper run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`Error::Helper`]
    pub fn into_result(self, program: &str) -> Result<ProcessOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Helper {
                program: program.to_string(),
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

#[async_trait]
pub trait HelperRunner: Send + Sync {
    /// Run a program to completion, capturing its output
    ///
    /// Cancelling kills the process and returns [`Error::Cancelled`].
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput>;

    /// Start a program without waiting for it
    fn spawn_detached(&self, program: &Path, args: &[String]) -> Result<()>;
}

/// Runs helpers with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioHelperRunner;

#[async_trait]
impl HelperRunner for TokioHelperRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        debug!("Running {} {:?}", program, args);
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to start '{}': {}", program, e)))?;

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            output = child.wait_with_output() => output?,
        };

        let result = ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            "{} finished with code {:?}\nSTDOUT:\n{}\nSTDERR:\n{}",
            program, result.code, result.stdout, result.stderr
        );
        Ok(result)
    }

    fn spawn_detached(&self, program: &Path, args: &[String]) -> Result<()> {
        debug!("Starting {}", program.display());
        let mut command = std::process::Command::new(program);
        command.args(args);
        if let Some(dir) = program.parent() {
            command.current_dir(dir);
        }
        command
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to start '{}': {}", program.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result() {
        let ok = ProcessOutput {
            code: Some(0),
            ..Default::default()
        };
        assert!(ok.into_result("helper").is_ok());

        let failed = ProcessOutput {
            code: Some(5),
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        match failed.into_result("helper") {
            Err(Error::Helper { program, code, stderr, .. }) => {
                assert_eq!(program, "helper");
                assert_eq!(code, Some(5));
                assert_eq!(stderr, "err");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_output() {
        let output = TokioHelperRunner
            .run(
                "sh",
                &["-c".to_string(), "echo hello; echo oops >&2; exit 3".to_string()],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = TokioHelperRunner
            .run("sleep", &["10".to_string()], &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = TokioHelperRunner
            .run("/nonexistent/helper", &[], &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Other(_))));
    }
}
