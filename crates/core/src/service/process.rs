use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr};
use tokio_util::sync::CancellationToken;

use super::worker::{EmbeddedWorker, WorkerError, WorkerParams, WorkerRun};
use crate::config::HostCfg;

const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// Runs the agent backend as a child process. The storage directory, host and
/// port reach it as `FAMILIAR_DATA_DIR`, `FAMILIAR_HOST` and `FAMILIAR_PORT`
/// on top of the snapshot environment.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    stop_grace: Duration,
}

impl ProcessWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>, stop_grace: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            stop_grace,
        }
    }

    /// Build from `worker_command`. An empty command yields a worker whose
    /// every launch fails, so the error surfaces as a lifecycle `Error`.
    pub fn from_cfg(cfg: &HostCfg) -> Self {
        let mut argv = cfg.worker_argv().into_iter();
        let program = argv.next().unwrap_or_default();
        Self::new(program, argv.collect(), Duration::from_secs(cfg.worker_stop_grace_secs))
    }
}

impl EmbeddedWorker for ProcessWorker {
    fn name(&self) -> &str {
        &self.program
    }

    fn launch(&self, params: WorkerParams, cancel: CancellationToken) -> Result<WorkerRun, WorkerError> {
        if self.program.is_empty() {
            return Err(WorkerError::Spawn("no worker command configured".into()));
        }

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&params.env)
            .env("FAMILIAR_DATA_DIR", &params.storage_dir)
            .env("FAMILIAR_HOST", &params.host)
            .env("FAMILIAR_PORT", params.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {e}", self.program)))?;

        tracing::info!(
            program = %self.program,
            pid = child.id(),
            storage_dir = %params.storage_dir.display(),
            "worker process spawned"
        );

        let stop_grace = self.stop_grace;
        Ok(Box::pin(async move {
            let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
            let mut last_line: Option<String> = None;

            let status = loop {
                tokio::select! {
                    status = child.wait() => {
                        break status.map_err(|e| WorkerError::Crashed(format!("wait failed: {e}")))?;
                    }
                    _ = cancel.cancelled() => {
                        interrupt(&mut child, stop_grace).await;
                        return Ok(());
                    }
                    line = next_line(&mut stderr) => match line {
                        Some(line) if !line.trim().is_empty() => {
                            tracing::debug!(target: "familiar::worker", "{line}");
                            last_line = Some(line);
                        }
                        Some(_) => {}
                        None => stderr = None,
                    },
                }
            };

            // Lines still buffered in the pipe when the process exited.
            if let Some(mut lines) = stderr {
                let drain = async {
                    while let Ok(Some(line)) = lines.next_line().await {
                        if !line.trim().is_empty() {
                            last_line = Some(line);
                        }
                    }
                };
                let _ = tokio::time::timeout(STDERR_DRAIN, drain).await;
            }

            exit_result(status, last_line)
        }))
    }
}

/// Next stderr line, or pending forever once stderr is closed.
async fn next_line(lines: &mut Option<Lines<BufReader<ChildStderr>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

fn exit_result(status: ExitStatus, last_line: Option<String>) -> Result<(), WorkerError> {
    if status.success() {
        return Ok(());
    }
    let message = match last_line {
        Some(line) => format!("worker exited with {status}: {}", line.trim()),
        None => format!("worker exited with {status}"),
    };
    Err(WorkerError::Crashed(message))
}

/// Ask the worker to stop with SIGINT and wait up to `grace`; kill it if it
/// is still running after that.
async fn interrupt(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe { libc::kill(pid as i32, libc::SIGINT) };
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(%status, "worker exited after interrupt"),
        Ok(Err(e)) => tracing::warn!(error = %e, "wait after interrupt failed"),
        Err(_) => {
            let _ = child.start_kill();
            tracing::warn!(grace_secs = grace.as_secs(), "worker ignored interrupt, killed");
        }
    }
}
