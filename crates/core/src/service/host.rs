use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::state::StateHandle;
use super::supervisor::{StartOutcome, Supervisor};
use super::worker::EmbeddedWorker;
use crate::config::{ConfigurationSnapshot, HostCfg};
use crate::types::LifecycleState;

/// Keeps the host process alive while the service instance exists.
/// How that is achieved is a platform detail.
pub trait KeepAlive: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Keep-alive for hosts that are not suspended by their environment.
#[derive(Debug, Default)]
pub struct LogKeepAlive;

impl KeepAlive for LogKeepAlive {
    fn acquire(&self) {
        tracing::debug!("keep-alive acquired");
    }

    fn release(&self) {
        tracing::debug!("keep-alive released");
    }
}

/// One service instance of the host process: created once, started any
/// number of times, destroyed once. The keep-alive is held for exactly the
/// instance's lifetime, independent of start/stop cycles.
pub struct HostService {
    supervisor: Supervisor,
    keep_alive: Box<dyn KeepAlive>,
    root: CancellationToken,
    destroyed: bool,
}

impl HostService {
    pub fn create(
        cfg: Arc<HostCfg>,
        worker: Arc<dyn EmbeddedWorker>,
        keep_alive: Box<dyn KeepAlive>,
        root: CancellationToken,
    ) -> Self {
        keep_alive.acquire();
        tracing::info!(worker = worker.name(), "host service created");
        Self {
            supervisor: Supervisor::new(cfg, worker, root.clone()),
            keep_alive,
            root,
            destroyed: false,
        }
    }

    /// Start (or keep) the backend. Safe to call repeatedly.
    pub fn start_command(&self, snapshot: ConfigurationSnapshot) -> StartOutcome {
        self.supervisor.start(snapshot)
    }

    /// Stop the current run but keep the instance (and keep-alive) around.
    pub fn stop_command(&self) {
        self.supervisor.stop();
    }

    pub fn state(&self) -> StateHandle {
        self.supervisor.subscribe()
    }

    pub fn current(&self) -> LifecycleState {
        self.supervisor.state()
    }

    /// Tear the instance down. Also runs on drop.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.supervisor.stop();
        self.root.cancel();
        self.keep_alive.release();
        tracing::info!("host service destroyed");
    }
}

impl Drop for HostService {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::service::worker::ThreadWorker;

    #[derive(Default)]
    struct CountingKeepAlive {
        acquired: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl KeepAlive for CountingKeepAlive {
        fn acquire(&self) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service(keep_alive: CountingKeepAlive) -> HostService {
        let worker = Arc::new(ThreadWorker::new("noop", |_, cancel| {
            while !cancel.is_cancelled() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Ok(())
        }));
        HostService::create(
            Arc::new(HostCfg::default()),
            worker,
            Box::new(keep_alive),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn keep_alive_held_across_start_stop_cycles() {
        let keep_alive = CountingKeepAlive::default();
        let (acquired, released) = (keep_alive.acquired.clone(), keep_alive.released.clone());
        let svc = service(keep_alive);

        for _ in 0..3 {
            svc.start_command(ConfigurationSnapshot::remote("https://h:5000", "abc"));
            svc.stop_command();
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 0);

        svc.destroy();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_releases_once_and_publishes_stopped() {
        let keep_alive = CountingKeepAlive::default();
        let released = keep_alive.released.clone();
        let svc = service(keep_alive);
        let handle = svc.state();

        svc.start_command(ConfigurationSnapshot::remote("https://h:5000", "abc"));
        assert!(handle.current().is_running());
        drop(svc);

        assert_eq!(handle.current(), LifecycleState::Stopped);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_cancels_embedded_worker() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(CountingKeepAlive::default());
        let root = svc.root.clone();
        let outcome = svc.start_command(ConfigurationSnapshot::embedded(
            dir.path(),
            std::collections::HashMap::new(),
        ));
        assert_eq!(outcome, StartOutcome::Launched);

        svc.destroy();
        assert!(root.is_cancelled());
    }
}
