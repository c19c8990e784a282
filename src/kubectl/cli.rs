use super::{Kubectl, KubectlError, LineFn, LineStream};
use crate::output::Output;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Global options prepended to every invocation.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub kubeconfig: Option<String>,
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub verbosity: u8,
}

/// The `kubectl` binary driven as a subprocess.
pub struct KubectlCli {
    path: String,
    opt: Options,
    output: Output,
}

impl KubectlCli {
    pub fn new(path: impl Into<String>, opt: Options, output: Output) -> Self {
        Self {
            path: path.into(),
            opt,
            output,
        }
    }

    fn program(&self) -> String {
        std::path::Path::new(&self.path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("kubectl")
            .to_string()
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.opt.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.clone());
        }
        if let Some(context) = &self.opt.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        if let Some(namespace) = &self.opt.namespace {
            args.push("--namespace".to_string());
            args.push(namespace.clone());
        }
        if self.opt.verbosity > 0 {
            args.push("-v".to_string());
            args.push(self.opt.verbosity.to_string());
        }
        args
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.args(self.global_args()).args(args).kill_on_drop(true);
        let mut line = vec![self.path.clone()];
        line.extend(self.global_args());
        line.extend(args.iter().map(|a| a.to_string()));
        self.output.debug(line.join(" "));
        cmd
    }

    async fn collect(&self, args: &[&str], input: Option<&[u8]>) -> Result<String, KubectlError> {
        let program = self.program();
        let mut cmd = self.command(args);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| KubectlError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Feed stdin from its own task so a chatty child cannot deadlock us.
        if let (Some(mut stdin), Some(data)) = (child.stdin.take(), input) {
            let data = data.to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&data).await;
            });
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(|source| KubectlError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !out.status.success() {
            debug!(args = ?args, code = ?out.status.code(), "failed");
            return Err(KubectlError::Failed {
                program,
                code: out.status.code(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        debug!(args = ?args, "completed");

        Ok(String::from_utf8_lossy(&out.stdout).replace("\r\n", "\n"))
    }
}

async fn pump(stdout: Option<ChildStdout>, on_line: &mut LineFn) {
    let Some(stdout) = stdout else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        on_line(&line);
    }
}

async fn stream_child(
    mut cmd: Command,
    program: String,
    cancel: CancellationToken,
    mut on_line: LineFn,
) -> Result<(), KubectlError> {
    let mut child = cmd.spawn().map_err(|source| KubectlError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    tokio::select! {
        () = cancel.cancelled() => {
            let _ = child.kill().await;
            stderr_task.abort();
            return Err(KubectlError::Cancelled { program });
        }
        () = pump(stdout, &mut on_line) => {}
    }

    let status = tokio::select! {
        () = cancel.cancelled() => {
            let _ = child.kill().await;
            stderr_task.abort();
            return Err(KubectlError::Cancelled { program });
        }
        status = child.wait() => status.map_err(|source| KubectlError::Spawn {
            program: program.clone(),
            source,
        })?,
    };
    let stderr = stderr_task.await.unwrap_or_default();

    if status.success() {
        Ok(())
    } else {
        Err(KubectlError::Failed {
            program,
            code: status.code(),
            stderr,
        })
    }
}

/// Run `cmd` in the background, feeding its stdout lines to `on_line`.
/// `program` labels errors.
pub(crate) fn spawn_stream(mut cmd: Command, program: String, on_line: LineFn) -> LineStream {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let cancel = CancellationToken::new();
    let (tx, rx) = oneshot::channel();
    let token = cancel.clone();
    tokio::spawn(async move {
        let res = stream_child(cmd, program, token, on_line).await;
        if let Err(e) = &res {
            debug!(error = %e, "stream ended");
        }
        let _ = tx.send(res);
    });

    LineStream::new(cancel, rx)
}

#[async_trait]
impl Kubectl for KubectlCli {
    async fn run(&self, args: &[&str]) -> Result<(), KubectlError> {
        let stdout = self.collect(args, None).await?;
        for line in stdout.lines() {
            self.output.verbose(format!("[{}] {}", self.program(), line));
        }
        Ok(())
    }

    async fn run_with_input(&self, input: &[u8], args: &[&str]) -> Result<(), KubectlError> {
        let stdout = self.collect(args, Some(input)).await?;
        for line in stdout.lines() {
            self.output.verbose(format!("[{}] {}", self.program(), line));
        }
        Ok(())
    }

    async fn capture_string(&self, args: &[&str]) -> Result<String, KubectlError> {
        self.collect(args, None).await
    }

    fn stream_lines(&self, args: &[&str], on_line: LineFn) -> LineStream {
        spawn_stream(self.command(args), self.program(), on_line)
    }

    async fn replace_process(&self, args: &[&str]) -> Result<(), KubectlError> {
        let program = self.program();
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|source| KubectlError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Ctrl+C reaches the child too; keep waiting so it can exit on its own terms.
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = tokio::signal::ctrl_c() => continue,
            }
        }
        .map_err(|source| KubectlError::Spawn {
            program: program.clone(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(KubectlError::Failed {
                program,
                code: status.code(),
                stderr: String::new(),
            })
        }
    }
}
