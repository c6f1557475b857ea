use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::ConfigurationSnapshot;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_PERSONA: &str = "hospitality";

/// User-facing settings captured by setup. Stored as key/value rows in
/// `familiar_settings`; the worker sees them only through [`Settings::env_vars`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub api_provider: Option<String>,
    pub api_key: Option<String>,
    pub ollama_url: Option<String>,
    pub agent_name: Option<String>,
    pub model_name: Option<String>,
    /// `local` or `remote`.
    pub connection_mode: String,
    pub server_url: String,
    pub remote_api_key: String,
    pub persona: Option<String>,
    pub owner_pin: Option<String>,
    pub briefing_enabled: Option<bool>,
    pub setup_complete: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_provider: None,
            api_key: None,
            ollama_url: None,
            agent_name: None,
            model_name: None,
            connection_mode: "local".into(),
            server_url: DEFAULT_SERVER_URL.into(),
            remote_api_key: String::new(),
            persona: Some(DEFAULT_PERSONA.into()),
            owner_pin: None,
            briefing_enabled: None,
            setup_complete: false,
        }
    }
}

impl Settings {
    pub async fn load(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM familiar_settings")
            .fetch_all(pool)
            .await?;
        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Upsert every set field, delete the rows of unset ones and mark setup
    /// complete, all in one transaction.
    pub async fn save(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut saved = self.clone();
        saved.setup_complete = true;
        for key in saved.unset_keys() {
            sqlx::query("DELETE FROM familiar_settings WHERE key = ?1")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        for (key, value) in saved.to_entries() {
            sqlx::query(
                "INSERT INTO familiar_settings (key, value) VALUES (?1, ?2) \
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::info!(mode = %saved.connection_mode, "settings saved");
        Ok(())
    }

    /// Forget everything; the next boot captures settings from the environment again.
    pub async fn clear(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let removed = sqlx::query("DELETE FROM familiar_settings").execute(pool).await?;
        tracing::info!(rows = removed.rows_affected(), "settings cleared");
        Ok(())
    }

    /// Ephemeral mode: read `FAMILIAR_*` variables from the process environment.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix("FAMILIAR_")
                    .map(|key| (key.to_ascii_lowercase(), v))
            })
            .collect();
        Self::from_map(&vars)
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        let text = |key: &str| m.get(key).cloned();
        Self {
            api_provider: text("api_provider"),
            api_key: text("api_key"),
            ollama_url: text("ollama_url"),
            agent_name: text("agent_name"),
            model_name: text("model_name"),
            connection_mode: text("connection_mode").unwrap_or(d.connection_mode),
            server_url: text("server_url").unwrap_or(d.server_url),
            remote_api_key: text("remote_api_key").unwrap_or(d.remote_api_key),
            persona: text("persona").or(d.persona),
            owner_pin: text("owner_pin"),
            briefing_enabled: m.get("briefing_enabled").map(|v| v == "true"),
            setup_complete: m.get("setup_complete").is_some_and(|v| v == "true"),
        }
    }

    fn optional_fields(&self) -> [(&'static str, &Option<String>); 7] {
        [
            ("api_provider", &self.api_provider),
            ("api_key", &self.api_key),
            ("ollama_url", &self.ollama_url),
            ("agent_name", &self.agent_name),
            ("model_name", &self.model_name),
            ("persona", &self.persona),
            ("owner_pin", &self.owner_pin),
        ]
    }

    fn unset_keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self
            .optional_fields()
            .into_iter()
            .filter_map(|(k, v)| v.is_none().then_some(k))
            .collect();
        if self.briefing_enabled.is_none() {
            keys.push("briefing_enabled");
        }
        keys
    }

    fn to_entries(&self) -> Vec<(&'static str, String)> {
        let mut entries: Vec<(&'static str, String)> = self
            .optional_fields()
            .into_iter()
            .filter_map(|(k, v)| v.clone().map(|v| (k, v)))
            .collect();
        entries.push(("connection_mode", self.connection_mode.clone()));
        entries.push(("server_url", self.server_url.clone()));
        entries.push(("remote_api_key", self.remote_api_key.clone()));
        if let Some(enabled) = self.briefing_enabled {
            entries.push(("briefing_enabled", enabled.to_string()));
        }
        entries.push(("setup_complete", self.setup_complete.to_string()));
        entries
    }

    /// Environment for the embedded worker. The API key lands under the
    /// provider's own variable and is dropped for providers without one.
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(provider) = &self.api_provider {
            env.insert("FAMILIAR_LLM_PROVIDER".into(), provider.clone());
        }
        if let Some(key) = &self.api_key {
            let var = match self.api_provider.as_deref() {
                Some("anthropic") => Some("ANTHROPIC_API_KEY"),
                Some("openai") => Some("OPENAI_API_KEY"),
                Some("gemini") => Some("GEMINI_API_KEY"),
                _ => None,
            };
            if let Some(var) = var {
                env.insert(var.into(), key.clone());
            }
        }
        let passthrough = [
            ("OLLAMA_URL", &self.ollama_url),
            ("FAMILIAR_AGENT_NAME", &self.agent_name),
            ("FAMILIAR_MODEL", &self.model_name),
            ("FAMILIAR_PERSONA", &self.persona),
        ];
        for (var, value) in passthrough {
            if let Some(v) = value {
                env.insert(var.into(), v.clone());
            }
        }
        if let Some(pin) = self.owner_pin.as_deref().filter(|p| !p.trim().is_empty()) {
            env.insert("FAMILIAR_OWNER_PIN_RAW".into(), pin.to_owned());
        }
        if let Some(enabled) = self.briefing_enabled {
            env.insert("FAMILIAR_BRIEFING_ENABLED".into(), enabled.to_string());
        }
        env
    }

    pub fn snapshot(&self, storage_dir: impl Into<PathBuf>) -> ConfigurationSnapshot {
        ConfigurationSnapshot {
            connection_mode: self.connection_mode.clone(),
            server_url: self.server_url.clone(),
            remote_api_key: self.remote_api_key.clone(),
            env: self.env_vars(),
            storage_dir: storage_dir.into(),
        }
    }
}
