use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::ConfigurationSnapshot;
use crate::types::ConnectionMode;

/// What a start attempt will do, decided from the snapshot alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPlan {
    /// Connect to an external server; nothing is started locally.
    Remote { address: String, credential: String },
    /// Launch the embedded worker with this environment and storage directory.
    Embedded {
        env: HashMap<String, String>,
        storage_dir: PathBuf,
    },
}

/// A plan that cannot be executed. Surfaced as `Error` before any work starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("remote mode requires a server address")]
    EmptyServerAddress,
    #[error("server address must start with http:// or https://: {0}")]
    InvalidServerAddress(String),
    #[error("embedded mode requires a storage directory")]
    EmptyStorageDir,
}

/// Classify a snapshot. Pure and total: unknown mode values resolve to
/// `Embedded` (see [`ConnectionMode::parse`]).
pub fn resolve(snapshot: ConfigurationSnapshot) -> BootstrapPlan {
    match ConnectionMode::parse(&snapshot.connection_mode) {
        ConnectionMode::Remote => BootstrapPlan::Remote {
            address: snapshot.server_url.trim().to_owned(),
            credential: snapshot.remote_api_key,
        },
        ConnectionMode::Embedded => BootstrapPlan::Embedded {
            env: snapshot.env,
            storage_dir: snapshot.storage_dir,
        },
    }
}

impl BootstrapPlan {
    pub fn mode(&self) -> ConnectionMode {
        match self {
            Self::Remote { .. } => ConnectionMode::Remote,
            Self::Embedded { .. } => ConnectionMode::Embedded,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Remote { address, .. } => {
                if address.is_empty() {
                    Err(ConfigError::EmptyServerAddress)
                } else if !(address.starts_with("http://") || address.starts_with("https://")) {
                    Err(ConfigError::InvalidServerAddress(address.clone()))
                } else {
                    Ok(())
                }
            }
            Self::Embedded { storage_dir, .. } => {
                if storage_dir.as_os_str().is_empty() {
                    Err(ConfigError::EmptyStorageDir)
                } else {
                    Ok(())
                }
            }
        }
    }
}
