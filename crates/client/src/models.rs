use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Treat an explicit `null` like a missing field.
fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Keep a string as is and render any other JSON value as its text.
fn lenient_text<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

// ── Chat ──

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub message: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatResponse {
    pub response: String,
    #[serde(deserialize_with = "nullable")]
    pub tool_calls: Vec<ToolCall>,
}

/// A skill invocation the agent made while answering.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolCall {
    pub skill: String,
    #[serde(deserialize_with = "nullable")]
    pub args: HashMap<String, Value>,
    #[serde(deserialize_with = "lenient_text")]
    pub result: Option<String>,
    pub category: Option<String>,
}

// ── Connect / services ──

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    pub name: String,
    pub display_name: String,
    pub category: String,
    pub connected: bool,
    pub detail: Option<String>,
    pub connect_command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectStatus {
    pub services: Vec<ServiceInfo>,
    pub categories: Vec<String>,
    pub active_provider: String,
}

// ── Tools ──

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub category: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolsResponse {
    pub tools: Vec<ToolInfo>,
}

// ── Skills ──

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SkillDetail {
    pub name: String,
    pub enabled: bool,
}

impl Default for SkillDetail {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SkillsResponse {
    pub skills: Vec<SkillDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SkillToggleResult {
    pub enabled: bool,
}

// ── Config ──

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_name: String,
    pub provider: String,
    pub memory_enabled: bool,
    pub skills_enabled: bool,
    pub scheduler_enabled: bool,
}
