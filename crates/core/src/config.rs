use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Host tunables. Loaded from the `familiar_config` table at startup.
/// First boot writes defaults; subsequent boots read existing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCfg {
    // readiness
    pub warmup_ms: u64,
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,

    // embedded worker
    pub embedded_host: String,
    pub embedded_port: u16,
    pub handshake_file: String,
    pub worker_command: String,

    // agent api client
    pub client_connect_timeout_secs: u64,
    pub client_request_timeout_secs: u64,

    // shutdown
    pub worker_stop_grace_secs: u64,
}

impl Default for HostCfg {
    fn default() -> Self {
        Self {
            warmup_ms: 3000,
            poll_interval_ms: 500,
            max_wait_ms: 10_000,
            embedded_host: "127.0.0.1".into(),
            embedded_port: 5000,
            handshake_file: ".dashboard_key".into(),
            worker_command: "python3 -m familiar.dashboard".into(),
            client_connect_timeout_secs: 5,
            client_request_timeout_secs: 120,
            worker_stop_grace_secs: 5,
        }
    }
}

impl HostCfg {
    /// Load config from `familiar_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM familiar_config")
            .fetch_all(pool)
            .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Write all default values into `familiar_config` table.
    async fn seed(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        for (key, value, desc) in &self.to_entries() {
            sqlx::query(
                "INSERT INTO familiar_config (key, value, description) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        let cfg = Self {
            warmup_ms: get_or(m, "warmup_ms", d.warmup_ms),
            poll_interval_ms: get_or(m, "poll_interval_ms", d.poll_interval_ms),
            max_wait_ms: get_or(m, "max_wait_ms", d.max_wait_ms),
            embedded_host: get_or(m, "embedded_host", d.embedded_host),
            embedded_port: get_or(m, "embedded_port", d.embedded_port),
            handshake_file: get_or(m, "handshake_file", d.handshake_file),
            worker_command: get_or(m, "worker_command", d.worker_command),
            client_connect_timeout_secs: get_or(m, "client_connect_timeout_secs", d.client_connect_timeout_secs),
            client_request_timeout_secs: get_or(m, "client_request_timeout_secs", d.client_request_timeout_secs),
            worker_stop_grace_secs: get_or(m, "worker_stop_grace_secs", d.worker_stop_grace_secs),
        };
        cfg.sanitized()
    }

    /// A zero poll interval would spin the readiness watcher, and a max wait
    /// shorter than one poll would never poll at all.
    fn sanitized(mut self) -> Self {
        if self.poll_interval_ms == 0 {
            let default = Self::default().poll_interval_ms;
            tracing::warn!(default, "poll_interval_ms = 0 is not usable, using default");
            self.poll_interval_ms = default;
        }
        if self.max_wait_ms < self.poll_interval_ms {
            tracing::warn!(
                max_wait_ms = self.max_wait_ms,
                poll_interval_ms = self.poll_interval_ms,
                "max_wait_ms below poll_interval_ms, raising it"
            );
            self.max_wait_ms = self.poll_interval_ms;
        }
        self
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("warmup_ms", self.warmup_ms.to_string(), "Minimum delay before publishing running"),
            ("poll_interval_ms", self.poll_interval_ms.to_string(), "Handshake poll interval ms"),
            ("max_wait_ms", self.max_wait_ms.to_string(), "Handshake maximum wait ms"),
            ("embedded_host", self.embedded_host.clone(), "Embedded worker bind host"),
            ("embedded_port", self.embedded_port.to_string(), "Embedded worker port"),
            ("handshake_file", self.handshake_file.clone(), "Handshake file name under storage dir"),
            ("worker_command", self.worker_command.clone(), "Embedded worker command line"),
            ("client_connect_timeout_secs", self.client_connect_timeout_secs.to_string(), "API connect timeout seconds"),
            ("client_request_timeout_secs", self.client_request_timeout_secs.to_string(), "API request timeout seconds"),
            ("worker_stop_grace_secs", self.worker_stop_grace_secs.to_string(), "Wait after interrupt before kill"),
        ]
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Worker command line split on whitespace. Empty entries are dropped.
    pub fn worker_argv(&self) -> Vec<String> {
        self.worker_command.split_whitespace().map(str::to_owned).collect()
    }
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Resolved boot inputs, read once per start attempt. Validated upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationSnapshot {
    /// Raw connection mode (`local`, `embedded`, `remote`, ...).
    pub connection_mode: String,
    pub server_url: String,
    pub remote_api_key: String,
    /// Environment handed to the embedded worker.
    pub env: HashMap<String, String>,
    /// Private storage directory owned by the embedded worker.
    pub storage_dir: PathBuf,
}

impl ConfigurationSnapshot {
    pub fn remote(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            connection_mode: "remote".into(),
            server_url: server_url.into(),
            remote_api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn embedded(storage_dir: impl Into<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            connection_mode: "local".into(),
            env,
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let cfg = HostCfg::default();
        assert_eq!(cfg.warmup(), Duration::from_secs(3));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.max_wait(), Duration::from_secs(10));
        assert_eq!(cfg.embedded_port, 5000);
    }

    #[test]
    fn from_map_overrides_and_falls_back() {
        let mut m = HashMap::new();
        m.insert("warmup_ms".to_owned(), "1500".to_owned());
        m.insert("embedded_port".to_owned(), "not-a-port".to_owned());
        m.insert("handshake_file".to_owned(), "token.txt".to_owned());
        let cfg = HostCfg::from_map(&m);
        assert_eq!(cfg.warmup_ms, 1500);
        assert_eq!(cfg.embedded_port, 5000);
        assert_eq!(cfg.handshake_file, "token.txt");
        assert_eq!(cfg.max_wait_ms, 10_000);
    }

    #[test]
    fn unusable_poll_timings_are_corrected() {
        let mut m = HashMap::new();
        m.insert("poll_interval_ms".to_owned(), "0".to_owned());
        let cfg = HostCfg::from_map(&m);
        assert_eq!(cfg.poll_interval_ms, 500);
        assert_eq!(cfg.max_wait_ms, 10_000);

        m.insert("poll_interval_ms".to_owned(), "2000".to_owned());
        m.insert("max_wait_ms".to_owned(), "300".to_owned());
        let cfg = HostCfg::from_map(&m);
        assert_eq!(cfg.poll_interval_ms, 2000);
        assert_eq!(cfg.max_wait_ms, 2000);
        assert!(cfg.max_wait() >= cfg.poll_interval());
    }

    #[test]
    fn worker_argv_splits_command() {
        let cfg = HostCfg {
            worker_command: "  python3  -m familiar.dashboard ".into(),
            ..HostCfg::default()
        };
        assert_eq!(cfg.worker_argv(), vec!["python3", "-m", "familiar.dashboard"]);
    }

    #[tokio::test]
    async fn load_seeds_defaults_then_reads_back() {
        // One connection: every sqlite in-memory connection is its own database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("../../migrations").run(&pool).await.unwrap();

        let first = HostCfg::load(&pool).await.unwrap();
        assert_eq!(first.poll_interval_ms, 500);

        sqlx::query("UPDATE familiar_config SET value = '250' WHERE key = 'poll_interval_ms'")
            .execute(&pool)
            .await
            .unwrap();
        let second = HostCfg::load(&pool).await.unwrap();
        assert_eq!(second.poll_interval_ms, 250);
        assert_eq!(second.warmup_ms, 3000);
    }
}
