//! Thin wrapper over `tokio::process` used by every external collaborator.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("`{program}` not found")]
    NotFound { program: String },

    #[error("`{program}` timed out after {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("`{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// One external process invocation.
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    stdin: Option<Zeroizing<String>>,
    timeout: Option<Duration>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` on stdin. Used for passwords so they never appear in argv.
    pub fn stdin(mut self, input: &str) -> Self {
        self.stdin = Some(Zeroizing::new(input.to_owned()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run to completion and return the output regardless of exit status.
    pub async fn output(self) -> Result<ToolOutput, ToolError> {
        debug!(program = %self.program, args = ?self.args, "spawning");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        if let Some(input) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let write = async {
                    pipe.write_all(input.as_bytes()).await?;
                    pipe.write_all(b"\n").await?;
                    pipe.shutdown().await
                };
                write.await.map_err(|source| ToolError::Io {
                    program: self.program.clone(),
                    source,
                })?;
            }
        }

        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(after) => match tokio::time::timeout(after, wait).await {
                Ok(res) => res,
                Err(_) => {
                    return Err(ToolError::TimedOut {
                        program: self.program.clone(),
                        after,
                    })
                }
            },
            None => wait.await,
        }
        .map_err(|source| ToolError::Io {
            program: self.program.clone(),
            source,
        })?;

        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    /// Run to completion; a non-zero exit becomes `ToolError::Failed`.
    pub async fn run(self) -> Result<ToolOutput, ToolError> {
        let program = self.program.clone();
        let out = self.output().await?;
        if out.status.success() {
            Ok(out)
        } else {
            Err(ToolError::Failed {
                program,
                status: out.status,
                stderr: out.stderr,
            })
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> ToolError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::NotFound {
                program: self.program.clone(),
            }
        } else {
            ToolError::Io {
                program: self.program.clone(),
                source: e,
            }
        }
    }
}
