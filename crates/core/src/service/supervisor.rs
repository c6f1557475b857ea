use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::state::{StateHandle, StatePublisher};
use super::worker::{EmbeddedWorker, WorkerError, WorkerParams};
use crate::boot::{self, BootstrapPlan, ReadinessPolicy, ReadinessWatcher};
use crate::config::{ConfigurationSnapshot, HostCfg};
use crate::types::{Connection, LifecycleState};

/// What a `start` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A run was already `Starting` or `Running`; nothing happened.
    AlreadyActive,
    /// Remote backend adopted; state is `Running`.
    Adopted,
    /// Embedded worker launched; readiness is being watched.
    Launched,
    /// Config or spawn failure, or the host is shutting down; state is `Error`.
    Failed,
}

#[derive(Debug)]
struct ActiveRun {
    id: Uuid,
    cancel: CancellationToken,
}

/// Owns the lifecycle state machine and the at-most-one embedded worker.
/// The only writer of the published [`LifecycleState`].
pub struct Supervisor {
    cfg: Arc<HostCfg>,
    worker: Arc<dyn EmbeddedWorker>,
    publisher: Arc<StatePublisher>,
    root: CancellationToken,
    run: Mutex<Option<ActiveRun>>,
}

impl Supervisor {
    pub fn new(cfg: Arc<HostCfg>, worker: Arc<dyn EmbeddedWorker>, root: CancellationToken) -> Self {
        Self {
            cfg,
            worker,
            publisher: Arc::new(StatePublisher::new()),
            root,
            run: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> StateHandle {
        self.publisher.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        self.publisher.current()
    }

    /// Begin a run from `snapshot`. No-op while `Starting` or `Running`.
    ///
    /// Remote plans are adopted synchronously. Embedded plans launch the
    /// worker and return immediately; readiness is published later from a
    /// background task.
    pub fn start(&self, snapshot: ConfigurationSnapshot) -> StartOutcome {
        // Held for the whole call so start and stop are totally ordered.
        let mut active = self.lock_run();
        let run_id = Uuid::new_v4();
        if !self.publisher.begin_run(run_id) {
            tracing::debug!(state = %self.publisher.current(), "start ignored, run already active");
            return StartOutcome::AlreadyActive;
        }
        let since = Instant::now();
        let requested_at = SystemTime::now();
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
        }
        if self.root.is_cancelled() {
            tracing::warn!(%run_id, "start refused, host service is shutting down");
            self.publisher.publish_error(run_id, "host service is shutting down");
            return StartOutcome::Failed;
        }

        let plan = boot::resolve(snapshot);
        tracing::info!(%run_id, mode = %plan.mode(), "start requested");
        if let Err(e) = plan.validate() {
            tracing::error!(%run_id, error = %e, "unusable configuration");
            self.publisher.publish_error(run_id, e.to_string());
            return StartOutcome::Failed;
        }

        match plan {
            BootstrapPlan::Remote { address, credential } => {
                let connection = Connection::remote(address, credential);
                tracing::info!(%run_id, base_url = %connection.base_url, "remote backend adopted");
                self.publisher.publish_running(run_id, 0, connection);
                let cancel = self.root.child_token();
                if let Ok(runtime) = Handle::try_current() {
                    runtime.spawn(release_on_cancel(Arc::clone(&self.publisher), run_id, cancel.clone()));
                }
                *active = Some(ActiveRun { id: run_id, cancel });
                StartOutcome::Adopted
            }
            BootstrapPlan::Embedded { env, storage_dir } => {
                let params = WorkerParams {
                    env,
                    storage_dir,
                    host: self.cfg.embedded_host.clone(),
                    port: self.cfg.embedded_port,
                };
                match self.launch_embedded(run_id, since, requested_at, params) {
                    Some(cancel) => {
                        *active = Some(ActiveRun { id: run_id, cancel });
                        StartOutcome::Launched
                    }
                    None => StartOutcome::Failed,
                }
            }
        }
    }

    /// Spawn the worker and its supervising task. Returns the run's
    /// cancellation token, or `None` after publishing a spawn failure.
    fn launch_embedded(
        &self,
        run_id: Uuid,
        since: Instant,
        requested_at: SystemTime,
        params: WorkerParams,
    ) -> Option<CancellationToken> {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(%run_id, error = %e, "no async runtime for worker");
                self.publisher.publish_error(run_id, format!("no async runtime available: {e}"));
                return None;
            }
        };

        let cancel = self.root.child_token();
        let watcher = ReadinessWatcher::new(
            &params.storage_dir,
            &self.cfg.handshake_file,
            ReadinessPolicy::from(self.cfg.as_ref()),
        )
        .fresh_since(requested_at);
        let (host, port) = (params.host.clone(), params.port);

        let run = match self.worker.launch(params, cancel.clone()) {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(%run_id, worker = self.worker.name(), error = %e, "worker spawn failed");
                self.publisher.publish_error(run_id, e.to_string());
                return None;
            }
        };
        tracing::info!(
            %run_id,
            worker = self.worker.name(),
            port,
            artifact = %watcher.artifact_path().display(),
            "embedded worker launched"
        );

        let worker_task = runtime.spawn(run);
        let span = tracing::info_span!("familiar_run", %run_id);
        runtime.spawn(
            supervise(
                Arc::clone(&self.publisher),
                RunContext {
                    id: run_id,
                    since,
                    host,
                    port,
                    cancel: cancel.clone(),
                },
                watcher,
                worker_task,
            )
            .instrument(span),
        );
        Some(cancel)
    }

    /// Publish `Stopped` and ask the current worker to end. Idempotent.
    /// Cancellation is best-effort for the worker and immediate for the watcher.
    pub fn stop(&self) {
        let mut active = self.lock_run();
        let changed = self.publisher.publish_stopped();
        if let Some(run) = active.take() {
            tracing::info!(run_id = %run.id, "cancelling run");
            run.cancel.cancel();
        }
        if changed {
            tracing::info!("supervisor stopped");
        }
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        // The guarded value is a plain handle; a poisoned lock still holds a usable one.
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct RunContext {
    id: Uuid,
    since: Instant,
    host: String,
    port: u16,
    cancel: CancellationToken,
}

/// Watch one embedded run: readiness first, then the worker's lifetime.
/// A worker exit always wins over a readiness result or a cancellation that
/// arrives with it.
async fn supervise(
    publisher: Arc<StatePublisher>,
    run: RunContext,
    watcher: ReadinessWatcher,
    mut worker_task: JoinHandle<Result<(), WorkerError>>,
) {
    let ready = tokio::select! {
        biased;
        exit = &mut worker_task => {
            on_worker_exit(&publisher, &run, exit);
            return;
        }
        ready = watcher.await_ready(run.since, &run.cancel) => ready,
    };

    match ready {
        Some(ready) => {
            tracing::info!(
                elapsed_ms = ready.elapsed.as_millis() as u64,
                handshake = ready.from_artifact(),
                "embedded worker ready"
            );
            let connection = Connection::embedded(&run.host, run.port, ready.credential);
            publisher.publish_running(run.id, run.port, connection);

            tokio::select! {
                biased;
                exit = &mut worker_task => {
                    on_worker_exit(&publisher, &run, exit);
                    return;
                }
                _ = run.cancel.cancelled() => {}
            }
        }
        None => tracing::debug!("readiness wait cancelled"),
    }

    // Cancelled. A plain stop has already published Stopped; this covers the
    // root token going away underneath the run.
    if publisher.publish_run_stopped(run.id) {
        tracing::info!("run cancelled by host shutdown");
    }
    let exit = worker_task.await;
    on_worker_exit(&publisher, &run, exit);
}

/// A remote run has no worker to watch; it only needs to notice the root
/// token going away.
async fn release_on_cancel(publisher: Arc<StatePublisher>, run_id: Uuid, cancel: CancellationToken) {
    cancel.cancelled().await;
    if publisher.publish_run_stopped(run_id) {
        tracing::info!(%run_id, "remote backend released on host shutdown");
    }
}

fn on_worker_exit(
    publisher: &StatePublisher,
    run: &RunContext,
    exit: Result<Result<(), WorkerError>, JoinError>,
) {
    if run.cancel.is_cancelled() {
        publisher.publish_run_stopped(run.id);
        tracing::info!("embedded worker ended after stop");
        return;
    }
    let message = match exit {
        Ok(Ok(())) => "embedded worker exited unexpectedly".to_owned(),
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => "embedded worker panicked".to_owned(),
        Err(e) => format!("embedded worker aborted: {e}"),
    };
    if publisher.publish_error(run.id, message.as_str()) {
        tracing::error!(error = %message, "embedded worker terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::worker::WorkerRun;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Worker that never writes the artifact and runs until cancelled.
    struct IdleWorker {
        launches: AtomicUsize,
    }

    impl EmbeddedWorker for IdleWorker {
        fn name(&self) -> &str {
            "idle"
        }

        fn launch(&self, _params: WorkerParams, cancel: CancellationToken) -> Result<WorkerRun, WorkerError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(async move {
                cancel.cancelled().await;
                Ok(())
            }))
        }
    }

    fn supervisor() -> (Supervisor, Arc<IdleWorker>) {
        supervisor_with_root(CancellationToken::new())
    }

    fn supervisor_with_root(root: CancellationToken) -> (Supervisor, Arc<IdleWorker>) {
        let worker = Arc::new(IdleWorker {
            launches: AtomicUsize::new(0),
        });
        let sup = Supervisor::new(Arc::new(HostCfg::default()), worker.clone(), root);
        (sup, worker)
    }

    fn embedded(dir: &std::path::Path) -> ConfigurationSnapshot {
        ConfigurationSnapshot::embedded(dir, HashMap::new())
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_start_launches_once() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, worker) = supervisor();

        assert_eq!(sup.start(embedded(dir.path())), StartOutcome::Launched);
        for _ in 0..5 {
            assert_eq!(sup.start(embedded(dir.path())), StartOutcome::AlreadyActive);
        }
        assert_eq!(sup.state(), LifecycleState::Starting);
        assert_eq!(worker.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn config_error_publishes_error_without_launch() {
        let (sup, worker) = supervisor();
        assert_eq!(sup.start(ConfigurationSnapshot::remote("", "abc")), StartOutcome::Failed);
        assert_eq!(sup.state(), LifecycleState::error("remote mode requires a server address"));
        assert_eq!(worker.launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn embedded_start_outside_runtime_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, worker) = supervisor();
        assert_eq!(sup.start(embedded(dir.path())), StartOutcome::Failed);
        assert!(matches!(sup.state(), LifecycleState::Error { .. }));
        assert_eq!(worker.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_worker_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _worker) = supervisor();
        let mut handle = sup.subscribe();
        sup.start(embedded(dir.path()));

        sup.stop();
        sup.stop();
        assert_eq!(sup.state(), LifecycleState::Stopped);

        // Nothing later overrides Stopped, even once the warm-up would have elapsed.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(handle.changed().await.map(|s| s.state), Some(LifecycleState::Stopped));
        assert_eq!(sup.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_error_begins_new_run() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, worker) = supervisor();
        sup.start(ConfigurationSnapshot::remote("", ""));
        assert!(matches!(sup.state(), LifecycleState::Error { .. }));

        assert_eq!(sup.start(embedded(dir.path())), StartOutcome::Launched);
        assert_eq!(sup.state(), LifecycleState::Starting);
        assert_eq!(worker.launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_after_root_cancelled_is_refused() {
        let root = CancellationToken::new();
        let (sup, worker) = supervisor_with_root(root.clone());
        root.cancel();

        assert_eq!(
            sup.start(ConfigurationSnapshot::remote("https://h:5000", "abc")),
            StartOutcome::Failed
        );
        assert_eq!(sup.state(), LifecycleState::error("host service is shutting down"));
        assert_eq!(worker.launches.load(Ordering::SeqCst), 0);
    }
}
