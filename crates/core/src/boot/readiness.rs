use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::HostCfg;

/// Floor for the poll interval; a zero interval would never suspend.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// File timestamps come from a coarse kernel clock and can trail the
/// wall clock read at the start request.
const ARTIFACT_MTIME_SLACK: Duration = Duration::from_secs(1);

/// Timing for readiness detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// `Running` is never published earlier than this after the start request.
    pub min_warmup: Duration,
    pub poll_interval: Duration,
    /// Give up on the handshake artifact after this long.
    pub max_wait: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::from(&HostCfg::default())
    }
}

impl From<&HostCfg> for ReadinessPolicy {
    fn from(cfg: &HostCfg) -> Self {
        Self {
            min_warmup: cfg.warmup(),
            poll_interval: cfg.poll_interval(),
            max_wait: cfg.max_wait(),
        }
    }
}

/// Outcome of a completed readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Trimmed artifact contents. Empty when the artifact never appeared.
    pub credential: String,
    /// Time since the start request, warm-up included.
    pub elapsed: Duration,
}

impl Readiness {
    pub fn from_artifact(&self) -> bool {
        !self.credential.is_empty()
    }
}

/// Polls for the handshake artifact the embedded worker writes once its
/// server accepts connections. Owns nothing but the artifact path and timing.
#[derive(Debug, Clone)]
pub struct ReadinessWatcher {
    artifact: PathBuf,
    policy: ReadinessPolicy,
    not_before: Option<SystemTime>,
}

impl ReadinessWatcher {
    pub fn new(storage_dir: &Path, handshake_file: &str, policy: ReadinessPolicy) -> Self {
        Self {
            artifact: storage_dir.join(handshake_file),
            policy,
            not_before: None,
        }
    }

    /// Only accept an artifact written at or after `started`. Anything older
    /// was left in the storage directory by an earlier run.
    pub fn fresh_since(mut self, started: SystemTime) -> Self {
        self.not_before = Some(started.checked_sub(ARTIFACT_MTIME_SLACK).unwrap_or(started));
        self
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact
    }

    /// Wait for readiness, measured from `since` (the start request).
    ///
    /// Polls every `poll_interval` until the artifact holds a token or
    /// `max_wait` passes, then holds until `min_warmup` has elapsed. A
    /// missing artifact is not an error: the credential comes back empty.
    /// Returns `None` if `cancel` fires; the token is checked on every poll.
    pub async fn await_ready(&self, since: Instant, cancel: &CancellationToken) -> Option<Readiness> {
        let deadline = since + self.policy.max_wait;
        let poll_interval = self.policy.poll_interval.max(MIN_POLL_INTERVAL);
        let credential = loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(token) = self.read_artifact().await {
                tracing::debug!(
                    path = %self.artifact.display(),
                    elapsed_ms = since.elapsed().as_millis() as u64,
                    "handshake artifact found"
                );
                break token;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    path = %self.artifact.display(),
                    max_wait_ms = self.policy.max_wait.as_millis() as u64,
                    "handshake artifact not written; falling back to warm-up timer"
                );
                break String::new();
            }

            let next_poll = (now + poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(next_poll) => {}
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep_until(since + self.policy.min_warmup) => {}
        }

        Some(Readiness {
            credential,
            elapsed: since.elapsed(),
        })
    }

    /// A token is present only once the file exists with non-blank contents
    /// and is fresh for this run; an empty file is a write still in progress.
    async fn read_artifact(&self) -> Option<String> {
        if let Some(not_before) = self.not_before {
            match tokio::fs::metadata(&self.artifact).await.and_then(|m| m.modified()) {
                Ok(modified) if modified < not_before => {
                    tracing::trace!(path = %self.artifact.display(), "ignoring handshake artifact from an earlier run");
                    return None;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
                Err(e) if e.kind() == io::ErrorKind::Unsupported => {}
                Err(e) => {
                    tracing::debug!(path = %self.artifact.display(), error = %e, "handshake stat failed");
                    return None;
                }
            }
        }
        match tokio::fs::read_to_string(&self.artifact).await {
            Ok(raw) => {
                let token = raw.trim();
                (!token.is_empty()).then(|| token.to_owned())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::debug!(path = %self.artifact.display(), error = %e, "handshake read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher(dir: &Path) -> ReadinessWatcher {
        ReadinessWatcher::new(dir, ".dashboard_key", ReadinessPolicy::default())
    }

    fn backdate(path: &Path, by: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn artifact_present_is_trimmed_and_warmup_held() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".dashboard_key"), "tok123\n").unwrap();

        let since = Instant::now();
        let ready = watcher(dir.path())
            .await_ready(since, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ready.credential, "tok123");
        assert!(ready.from_artifact());
        assert!(ready.elapsed >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_artifact_times_out_with_empty_credential() {
        let dir = tempfile::tempdir().unwrap();

        let since = Instant::now();
        let ready = watcher(dir.path())
            .await_ready(since, &CancellationToken::new())
            .await
            .unwrap();
        assert!(ready.credential.is_empty());
        assert!(!ready.from_artifact());
        assert!(ready.elapsed >= Duration::from_secs(10));
        assert!(ready.elapsed <= Duration::from_millis(10_500));
    }

    #[tokio::test(start_paused = true)]
    async fn late_artifact_stops_polling_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".dashboard_key");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4200)).await;
            std::fs::write(path, "  late-token  ").unwrap();
        });

        let since = Instant::now();
        let ready = watcher(dir.path())
            .await_ready(since, &CancellationToken::new())
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(ready.credential, "late-token");
        // Found on the first poll after 4.2s, well before the 10s limit.
        assert!(ready.elapsed >= Duration::from_millis(4200));
        assert!(ready.elapsed <= Duration::from_millis(4700));
    }

    #[tokio::test(start_paused = true)]
    async fn blank_artifact_is_not_a_credential() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".dashboard_key"), "\n  \n").unwrap();

        let ready = watcher(dir.path())
            .await_ready(Instant::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(ready.credential.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_exits_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            canceller.cancel();
        });

        let since = Instant::now();
        let out = watcher(dir.path()).await_ready(since, &cancel).await;
        assert!(out.is_none());
        assert!(since.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_warmup_exits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".dashboard_key"), "tok").unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            canceller.cancel();
        });

        let out = watcher(dir.path()).await_ready(Instant::now(), &cancel).await;
        assert!(out.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn artifact_from_earlier_run_is_ignored_until_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".dashboard_key");
        std::fs::write(&path, "previous-run-key").unwrap();
        backdate(&path, Duration::from_secs(60));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            std::fs::write(path, "new-run-key\n").unwrap();
        });

        let ready = watcher(dir.path())
            .fresh_since(SystemTime::now())
            .await_ready(Instant::now(), &CancellationToken::new())
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(ready.credential, "new-run-key");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_artifact_alone_falls_back_to_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".dashboard_key");
        std::fs::write(&path, "previous-run-key").unwrap();
        backdate(&path, Duration::from_secs(60));

        let ready = watcher(dir.path())
            .fresh_since(SystemTime::now())
            .await_ready(Instant::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(ready.credential.is_empty());
        assert!(ready.elapsed >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_still_suspends() {
        let dir = tempfile::tempdir().unwrap();
        let policy = ReadinessPolicy {
            min_warmup: Duration::ZERO,
            poll_interval: Duration::ZERO,
            max_wait: Duration::from_millis(100),
        };
        let watcher = ReadinessWatcher::new(dir.path(), ".dashboard_key", policy);

        let since = Instant::now();
        let ready = watcher.await_ready(since, &CancellationToken::new()).await.unwrap();
        assert!(ready.credential.is_empty());
        assert!(ready.elapsed >= Duration::from_millis(100));
    }
}
