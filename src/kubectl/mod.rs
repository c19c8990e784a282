//! Gateway to the cluster's control plane.
//!
//! Everything the session engine knows about the cluster goes through the
//! [`Kubectl`] trait, which the real CLI wrapper and the test fake both
//! implement.

mod cli;
#[cfg(test)]
pub(crate) mod fake;

pub use cli::{KubectlCli, Options};
pub(crate) use cli::spawn_stream;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum KubectlError {
    #[error("{program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program}: {}", .stderr.trim_end())]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program}: cancelled")]
    Cancelled { program: String },
}

impl KubectlError {
    /// Diagnostic text the command wrote before failing, if any.
    pub fn stderr(&self) -> &str {
        match self {
            KubectlError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }

    /// Exit code of the failed command, when it ran to completion.
    pub fn code(&self) -> Option<i32> {
        match self {
            KubectlError::Failed { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.stderr().starts_with("Error from server (NotFound)")
    }
}

/// Callback receiving each line of a streaming command's stdout.
pub type LineFn = Box<dyn FnMut(&str) + Send>;

/// Handle to a long-running streaming invocation.
///
/// Dropping the handle kills the underlying process; cancelling more than
/// once is harmless.
pub struct LineStream {
    cancel: CancellationToken,
    done: Option<oneshot::Receiver<Result<(), KubectlError>>>,
}

impl LineStream {
    pub(crate) fn new(
        cancel: CancellationToken,
        done: oneshot::Receiver<Result<(), KubectlError>>,
    ) -> Self {
        Self {
            cancel,
            done: Some(done),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the invocation to end. Cancel safe; once it has reported,
    /// later calls return `Ok(())`.
    pub async fn wait(&mut self) -> Result<(), KubectlError> {
        let Some(rx) = self.done.as_mut() else {
            return Ok(());
        };
        let res = rx.await.unwrap_or(Ok(()));
        self.done = None;
        res
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait Kubectl: Send + Sync {
    /// Run a command, discarding its stdout.
    async fn run(&self, args: &[&str]) -> Result<(), KubectlError>;

    /// Run a command with `input` piped to its stdin.
    async fn run_with_input(&self, input: &[u8], args: &[&str]) -> Result<(), KubectlError>;

    /// Run a command and return its stdout.
    async fn capture_string(&self, args: &[&str]) -> Result<String, KubectlError>;

    /// Run a command and return its stdout split into lines.
    async fn capture_lines(&self, args: &[&str]) -> Result<Vec<String>, KubectlError> {
        let s = self.capture_string(args).await?;
        Ok(s.lines().map(str::to_string).collect())
    }

    /// Start a long-running command whose stdout lines go to `on_line`.
    fn stream_lines(&self, args: &[&str], on_line: LineFn) -> LineStream;

    /// Run a command in the foreground, handing it the terminal.
    async fn replace_process(&self, args: &[&str]) -> Result<(), KubectlError>;
}
