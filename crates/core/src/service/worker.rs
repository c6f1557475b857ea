use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Why the embedded worker could not start or stopped on its own.
/// `Display` is the bare message so it can be published as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// The execution context could not be created. Nothing is running.
    #[error("{0}")]
    Spawn(String),
    /// The worker ended abnormally after a successful launch.
    #[error("{0}")]
    Crashed(String),
}

/// Everything the worker needs to boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerParams {
    pub env: HashMap<String, String>,
    pub storage_dir: PathBuf,
    pub host: String,
    pub port: u16,
}

/// Resolves when the worker ends. `Ok(())` is a clean exit.
pub type WorkerRun = Pin<Box<dyn Future<Output = Result<(), WorkerError>> + Send + 'static>>;

/// A locally hosted backend the supervisor can launch.
pub trait EmbeddedWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Launch the worker on its own execution context. An `Err` here is a
    /// spawn failure; the returned future is the worker's lifetime. `cancel`
    /// is the only stop request the worker will receive.
    fn launch(&self, params: WorkerParams, cancel: CancellationToken) -> Result<WorkerRun, WorkerError>;
}

type WorkerBody = dyn Fn(WorkerParams, CancellationToken) -> Result<(), String> + Send + Sync;

/// Runs a blocking worker body on a dedicated named OS thread, so its server
/// loop never shares a thread with the async runtime.
pub struct ThreadWorker {
    name: String,
    body: Arc<WorkerBody>,
}

impl ThreadWorker {
    pub const THREAD_NAME: &'static str = "familiar-worker";

    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(WorkerParams, CancellationToken) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }
}

impl EmbeddedWorker for ThreadWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, params: WorkerParams, cancel: CancellationToken) -> Result<WorkerRun, WorkerError> {
        let (done_tx, done_rx) = oneshot::channel();
        let body = Arc::clone(&self.body);
        std::thread::Builder::new()
            .name(Self::THREAD_NAME.into())
            .spawn(move || {
                let _ = done_tx.send(body(params, cancel));
            })
            .map_err(|e| WorkerError::Spawn(format!("failed to spawn worker thread: {e}")))?;

        Ok(Box::pin(async move {
            match done_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(WorkerError::Crashed(message)),
                // Sender dropped without a result: the body panicked.
                Err(_) => Err(WorkerError::Crashed("embedded worker panicked".into())),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> WorkerParams {
        WorkerParams {
            env: HashMap::new(),
            storage_dir: PathBuf::from("/tmp/familiar-test"),
            host: "127.0.0.1".into(),
            port: 5000,
        }
    }

    #[tokio::test]
    async fn thread_worker_runs_on_named_thread() {
        let worker = ThreadWorker::new("named", |_, _| {
            match std::thread::current().name() {
                Some(ThreadWorker::THREAD_NAME) => Ok(()),
                other => Err(format!("wrong thread: {other:?}")),
            }
        });
        let run = worker.launch(params(), CancellationToken::new()).unwrap();
        assert_eq!(run.await, Ok(()));
    }

    #[tokio::test]
    async fn thread_worker_error_is_crash() {
        let worker = ThreadWorker::new("failing", |_, _| Err("Python crashed".into()));
        let run = worker.launch(params(), CancellationToken::new()).unwrap();
        assert_eq!(run.await, Err(WorkerError::Crashed("Python crashed".into())));
    }

    #[tokio::test]
    async fn thread_worker_panic_is_crash() {
        let worker = ThreadWorker::new("panicking", |_, _| panic!("worker blew up"));
        let run = worker.launch(params(), CancellationToken::new()).unwrap();
        assert!(matches!(run.await, Err(WorkerError::Crashed(_))));
    }

    #[tokio::test]
    async fn thread_worker_observes_cancellation() {
        let worker = ThreadWorker::new("blocking", |_, cancel| {
            while !cancel.is_cancelled() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Ok(())
        });
        let cancel = CancellationToken::new();
        let run = worker.launch(params(), cancel.clone()).unwrap();
        cancel.cancel();
        assert_eq!(run.await, Ok(()));
    }

    #[test]
    fn error_display_is_bare_message() {
        assert_eq!(WorkerError::Spawn("bind failed".into()).to_string(), "bind failed");
        assert_eq!(WorkerError::Crashed("oom".into()).to_string(), "oom");
    }
}
