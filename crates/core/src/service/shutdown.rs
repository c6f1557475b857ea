use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Root cancellation for a host process. Cancelled on SIGTERM or SIGINT
/// (Ctrl+C on non-unix); every run token is a child of it.
#[derive(Debug, Clone)]
pub struct ShutdownGuard {
    token: CancellationToken,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Install the process signal handlers and spawn the task that turns the
    /// first signal into cancellation. Handlers are in place when this returns.
    /// The task ends on its own once the token is cancelled some other way.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        let signals = Signals::register();
        tokio::spawn(async move {
            tokio::select! {
                name = signals.recv() => {
                    tracing::info!(signal = name, "shutdown signal received, destroying host service");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
struct Signals {
    terminate: Option<signal::unix::Signal>,
    interrupt: Option<signal::unix::Signal>,
}

#[cfg(unix)]
impl Signals {
    fn register() -> Self {
        use signal::unix::SignalKind;
        Self {
            terminate: listen(SignalKind::terminate(), "SIGTERM"),
            interrupt: listen(SignalKind::interrupt(), "SIGINT"),
        }
    }

    async fn recv(mut self) -> &'static str {
        tokio::select! {
            Some(()) = next(&mut self.terminate) => "SIGTERM",
            Some(()) = next(&mut self.interrupt) => "SIGINT",
            else => std::future::pending::<&'static str>().await,
        }
    }
}

#[cfg(unix)]
fn listen(kind: signal::unix::SignalKind, name: &str) -> Option<signal::unix::Signal> {
    match signal::unix::signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(signal = name, error = %e, "failed to register signal handler");
            None
        }
    }
}

#[cfg(unix)]
async fn next(stream: &mut Option<signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> Self {
        Self
    }

    async fn recv(self) -> &'static str {
        match signal::ctrl_c().await {
            Ok(()) => "Ctrl+C",
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                std::future::pending().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn token_cancels_children() {
        let guard = ShutdownGuard::new();
        let child = guard.token().child_token();
        assert!(!child.is_cancelled());
        guard.token().cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn listener_exits_when_cancelled_elsewhere() {
        let guard = ShutdownGuard::new();
        let listener = guard.spawn_signal_listener();
        guard.token().cancel();
        tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .expect("listener ends after cancellation")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigint_cancels_root_token() {
        let guard = ShutdownGuard::new();
        let listener = guard.spawn_signal_listener();
        // The handler is installed, so this reaches tokio instead of killing the test.
        unsafe { libc::raise(libc::SIGINT) };
        tokio::time::timeout(Duration::from_secs(5), guard.token().cancelled())
            .await
            .expect("SIGINT cancels the root token");
        listener.await.unwrap();
    }
}
