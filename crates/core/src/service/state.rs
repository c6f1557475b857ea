use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::types::{Connection, LifecycleState, StatusSnapshot};

/// Write side of the lifecycle slot. Held only by the supervisor; every
/// change replaces the whole [`StatusSnapshot`] under the channel lock, so
/// readers never observe a half-applied transition.
#[derive(Debug)]
pub struct StatePublisher {
    status: watch::Sender<StatusSnapshot>,
    connection: watch::Sender<Option<Connection>>,
}

impl StatePublisher {
    pub fn new() -> Self {
        let (status, _) = watch::channel(StatusSnapshot::default());
        let (connection, _) = watch::channel(None);
        Self { status, connection }
    }

    pub fn subscribe(&self) -> StateHandle {
        StateHandle {
            status: self.status.subscribe(),
            connection: self.connection.subscribe(),
        }
    }

    pub fn current(&self) -> LifecycleState {
        self.status.borrow().state.clone()
    }

    /// `→ Starting` for a new run unless one is already in flight.
    /// Clears the previous run's connection. Returns false on a no-op.
    pub(crate) fn begin_run(&self, run_id: Uuid) -> bool {
        self.status.send_if_modified(|snap| {
            if snap.state.is_active() {
                return false;
            }
            self.connection.send_replace(None);
            *snap = StatusSnapshot {
                state: LifecycleState::Starting,
                since: Utc::now(),
                run_id: Some(run_id),
            };
            true
        })
    }

    /// `→ Running` for `run_id`, publishing its connection first.
    /// Rejected unless the run is still the current, active one.
    pub(crate) fn publish_running(&self, run_id: Uuid, port: u16, connection: Connection) -> bool {
        self.status.send_if_modified(|snap| {
            if snap.run_id != Some(run_id) || snap.state != LifecycleState::Starting {
                return false;
            }
            self.connection.send_replace(Some(connection));
            snap.state = LifecycleState::Running { port };
            snap.since = Utc::now();
            true
        })
    }

    /// `→ Error` for `run_id` while it is `Starting` or `Running`.
    pub(crate) fn publish_error(&self, run_id: Uuid, message: impl Into<String>) -> bool {
        let message = message.into();
        self.status.send_if_modified(|snap| {
            if snap.run_id != Some(run_id) || !snap.state.is_active() {
                return false;
            }
            snap.state = LifecycleState::Error { message };
            snap.since = Utc::now();
            true
        })
    }

    /// `→ Stopped` for `run_id` while it is `Starting` or `Running`. Used when
    /// the host's root token ends the run without an explicit stop.
    pub(crate) fn publish_run_stopped(&self, run_id: Uuid) -> bool {
        self.status.send_if_modified(|snap| {
            if snap.run_id != Some(run_id) || !snap.state.is_active() {
                return false;
            }
            snap.state = LifecycleState::Stopped;
            snap.since = Utc::now();
            true
        })
    }

    /// `→ Stopped` from any state. Idempotent; returns false if already stopped.
    pub(crate) fn publish_stopped(&self) -> bool {
        self.status.send_if_modified(|snap| {
            if snap.state == LifecycleState::Stopped {
                return false;
            }
            snap.state = LifecycleState::Stopped;
            snap.since = Utc::now();
            true
        })
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the lifecycle slot. Cheap to clone; never blocks the writer.
#[derive(Debug, Clone)]
pub struct StateHandle {
    status: watch::Receiver<StatusSnapshot>,
    connection: watch::Receiver<Option<Connection>>,
}

impl StateHandle {
    pub fn current(&self) -> LifecycleState {
        self.status.borrow().state.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Endpoint of the last successful start. `None` until `Running` and
    /// after a new start begins.
    pub fn connection(&self) -> Option<Connection> {
        self.connection.borrow().clone()
    }

    /// Wait for the next published change. `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<StatusSnapshot> {
        self.status.changed().await.ok()?;
        Some(self.status.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `pred` (checked against the current value first).
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&LifecycleState) -> bool,
    ) -> Option<LifecycleState> {
        let snap = self.status.wait_for(|s| pred(&s.state)).await.ok()?;
        Some(snap.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_run_is_idempotent_while_active() {
        let p = StatePublisher::new();
        let first = Uuid::new_v4();
        assert!(p.begin_run(first));
        assert!(!p.begin_run(Uuid::new_v4()));
        assert_eq!(p.subscribe().snapshot().run_id, Some(first));

        assert!(p.publish_running(first, 5000, Connection::embedded("127.0.0.1", 5000, "t")));
        assert!(!p.begin_run(Uuid::new_v4()));
    }

    #[test]
    fn stale_run_cannot_publish() {
        let p = StatePublisher::new();
        let old = Uuid::new_v4();
        p.begin_run(old);
        p.publish_error(old, "boom");

        let new = Uuid::new_v4();
        assert!(p.begin_run(new));
        assert!(!p.publish_error(old, "late crash"));
        assert!(!p.publish_running(old, 5000, Connection::embedded("127.0.0.1", 5000, "")));
        assert_eq!(p.current(), LifecycleState::Starting);
    }

    #[test]
    fn error_blocks_later_running() {
        let p = StatePublisher::new();
        let run = Uuid::new_v4();
        p.begin_run(run);
        assert!(p.publish_error(run, "crashed"));
        assert!(!p.publish_running(run, 5000, Connection::embedded("127.0.0.1", 5000, "")));
        assert_eq!(p.current(), LifecycleState::error("crashed"));
        assert!(p.subscribe().connection().is_none());
    }

    #[test]
    fn stopped_from_any_state_and_idempotent() {
        let p = StatePublisher::new();
        assert!(p.publish_stopped());
        assert!(!p.publish_stopped());
        assert_eq!(p.current(), LifecycleState::Stopped);

        let run = Uuid::new_v4();
        assert!(p.begin_run(run));
        assert!(p.publish_stopped());
        assert!(!p.publish_running(run, 1, Connection::embedded("127.0.0.1", 1, "")));
        assert_eq!(p.current(), LifecycleState::Stopped);
    }

    #[test]
    fn run_stopped_only_applies_to_current_active_run() {
        let p = StatePublisher::new();
        let old = Uuid::new_v4();
        p.begin_run(old);
        p.publish_error(old, "crashed");
        assert!(!p.publish_run_stopped(old));
        assert_eq!(p.current(), LifecycleState::error("crashed"));

        let new = Uuid::new_v4();
        p.begin_run(new);
        assert!(!p.publish_run_stopped(old));
        assert!(p.publish_running(new, 5000, Connection::embedded("127.0.0.1", 5000, "")));
        assert!(p.publish_run_stopped(new));
        assert!(!p.publish_run_stopped(new));
        assert_eq!(p.current(), LifecycleState::Stopped);
    }

    #[test]
    fn connection_cleared_on_new_run() {
        let p = StatePublisher::new();
        let handle = p.subscribe();
        let run = Uuid::new_v4();
        p.begin_run(run);
        p.publish_running(run, 0, Connection::remote("https://h:5000", "abc"));
        assert_eq!(handle.connection().map(|c| c.credential), Some("abc".to_owned()));

        p.publish_error(run, "gone");
        assert!(handle.connection().is_some());
        p.begin_run(Uuid::new_v4());
        assert!(handle.connection().is_none());
    }

    #[tokio::test]
    async fn readers_observe_changes() {
        let p = StatePublisher::new();
        let mut handle = p.subscribe();
        let run = Uuid::new_v4();

        p.begin_run(run);
        let snap = handle.changed().await.unwrap();
        assert_eq!(snap.state, LifecycleState::Starting);

        let mut waiter = handle.clone();
        let wait = tokio::spawn(async move { waiter.wait_for(LifecycleState::is_running).await });
        p.publish_running(run, 5000, Connection::embedded("127.0.0.1", 5000, ""));
        assert_eq!(wait.await.unwrap(), Some(LifecycleState::Running { port: 5000 }));
    }

    #[tokio::test]
    async fn changed_ends_when_publisher_dropped() {
        let p = StatePublisher::new();
        let mut handle = p.subscribe();
        drop(p);
        assert!(handle.changed().await.is_none());
    }
}
