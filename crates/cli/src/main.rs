mod commands;
mod repl;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use familiar_core::config::HostCfg;
use familiar_core::service::{HostService, LogKeepAlive, ProcessWorker, ShutdownGuard};
use familiar_core::settings::Settings;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let storage_dir = storage_dir()?;
    std::fs::create_dir_all(&storage_dir)?;

    // Tracing: write to file when RUST_LOG is set (the REPL owns stderr)
    if std::env::var("RUST_LOG").is_ok() {
        let file = std::fs::File::create(storage_dir.join("familiar.log"))?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().json().with_target(true).with_writer(file))
            .init();
    }

    let mut startup_notice: Option<String> = None;
    let pool = match std::env::var("DATABASE_URL") {
        Ok(url) => connect_db(&url, &mut startup_notice).await,
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, running in ephemeral mode");
            None
        }
    };

    let cfg = match &pool {
        Some(pool) => HostCfg::load(pool).await?,
        None => HostCfg::default(),
    };
    let cfg = Arc::new(cfg);
    let settings = load_settings(pool.as_ref()).await?;
    let snapshot = settings.snapshot(&storage_dir);

    let shutdown = ShutdownGuard::new();
    shutdown.spawn_signal_listener();

    let worker = Arc::new(ProcessWorker::from_cfg(&cfg));
    let service = HostService::create(
        Arc::clone(&cfg),
        worker,
        Box::new(LogKeepAlive),
        shutdown.token(),
    );
    service.start_command(snapshot.clone());

    let result = repl::run(&service, snapshot, cfg, pool, shutdown.token(), startup_notice).await;
    service.destroy();
    result
}

/// `FAMILIAR_HOME`, else `<platform data dir>/familiar`.
fn storage_dir() -> anyhow::Result<PathBuf> {
    if let Some(home) = std::env::var_os("FAMILIAR_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    dirs::data_dir()
        .map(|d| d.join("familiar"))
        .ok_or_else(|| anyhow::anyhow!("no data directory; set FAMILIAR_HOME"))
}

/// Connect and migrate, or fall back to ephemeral mode with a notice.
async fn connect_db(url: &str, startup_notice: &mut Option<String>) -> Option<SqlitePool> {
    let mut fallback = |reason: String| {
        *startup_notice = Some(format!(
            "note: {reason}, running in ephemeral mode. Settings will not persist this session."
        ));
    };
    let options = match SqliteConnectOptions::from_str(url) {
        Ok(options) => options.create_if_missing(true),
        Err(e) => {
            tracing::warn!(error = %e, "invalid DATABASE_URL, falling back to ephemeral mode");
            fallback("DATABASE_URL is not a valid SQLite url".into());
            return None;
        }
    };
    match tokio::time::timeout(
        Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
        SqlitePoolOptions::new().max_connections(4).connect_with(options),
    )
    .await
    {
        Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
            Ok(()) => {
                tracing::info!("database connected and migrations applied");
                Some(pool)
            }
            Err(e) => {
                tracing::warn!(error = %e, "database migration failed, falling back to ephemeral mode");
                fallback("database migration failed".into());
                None
            }
        },
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to connect DATABASE_URL, falling back to ephemeral mode");
            fallback("could not open DATABASE_URL".into());
            None
        }
        Err(_) => {
            tracing::warn!(
                timeout_secs = DB_CONNECT_TIMEOUT_SECS,
                "database connect timed out, falling back to ephemeral mode"
            );
            fallback(format!("database connect timed out ({DB_CONNECT_TIMEOUT_SECS}s)"));
            None
        }
    }
}

/// Stored settings; on first boot they are captured from the environment.
async fn load_settings(pool: Option<&SqlitePool>) -> anyhow::Result<Settings> {
    let Some(pool) = pool else {
        return Ok(Settings::from_env());
    };
    let stored = Settings::load(pool).await?;
    if stored.setup_complete {
        return Ok(stored);
    }
    let settings = Settings::from_env();
    settings.save(pool).await?;
    Ok(settings)
}
