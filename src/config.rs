use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{TowerError, TowerResult};

const CONFIG_FILE: &str = "towerpick.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Name the handler is registered under with the host.
    #[serde(default = "default_name")]
    pub name: String,
    /// Key inside the custom parameter block that carries the priority table.
    #[serde(default = "default_param_key")]
    pub param_key: String,
    /// Template image probed when no label is found, relative to the host resource dir.
    #[serde(default = "default_fallback_template")]
    pub fallback_template: String,
    #[serde(default)]
    pub missing_table: MissingTablePolicy,
    /// Label searched when `missing_table = "placeholder"`.
    #[serde(default = "default_placeholder_label")]
    pub placeholder_label: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            param_key: default_param_key(),
            fallback_template: default_fallback_template(),
            missing_table: MissingTablePolicy::default(),
            placeholder_label: default_placeholder_label(),
        }
    }
}

/// What to do when the custom parameter block carries no priority table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTablePolicy {
    /// Fail the invocation with a configuration error.
    #[default]
    Reject,
    /// Search the placeholder label as a one-element table at priority 0.
    Placeholder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory holding the framework's agent-server libraries. Searched
    /// before the executable dir, the working dir and the system loader path.
    #[serde(default)]
    pub library_dir: Option<PathBuf>,
    /// User path handed to the toolkit (framework logs and debug output).
    #[serde(default = "default_user_path")]
    pub user_path: String,
    /// Used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            library_dir: None,
            user_path: default_user_path(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_name() -> String {
    "auto_tower".into()
}

fn default_param_key() -> String {
    "work".into()
}

fn default_fallback_template() -> String {
    "recommend_card.png".into()
}

fn default_placeholder_label() -> String {
    "default_value".into()
}

fn default_user_path() -> String {
    "./".into()
}

fn default_log_filter() -> String {
    "info".into()
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("TOWERPICK_CONFIG") {
        return Some(PathBuf::from(explicit));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join(CONFIG_FILE);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    dirs::config_dir()
        .map(|d| d.join("towerpick").join(CONFIG_FILE))
        .filter(|p| p.exists())
}

/// Load the config file, or fall back to built-in defaults when none exists.
///
/// An explicit `TOWERPICK_CONFIG` path that cannot be read is an error.
/// Called before logging is initialized, so the chosen source is returned
/// for the caller to log.
pub fn load_config() -> TowerResult<(AppConfig, Option<PathBuf>)> {
    let Some(path) = resolve_config_path() else {
        return Ok((AppConfig::default(), None));
    };
    let content = std::fs::read_to_string(&path).map_err(|e| {
        TowerError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    let config = parse_config(&content)?;
    Ok((config, Some(path)))
}

pub fn parse_config(content: &str) -> TowerResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    if config.recognition.name.trim().is_empty() {
        return Err(TowerError::Config("recognition.name must not be empty".into()));
    }
    if config.recognition.param_key.is_empty() {
        return Err(TowerError::Config("recognition.param_key must not be empty".into()));
    }
    if config.recognition.fallback_template.trim().is_empty() {
        return Err(TowerError::Config(
            "recognition.fallback_template must not be empty".into(),
        ));
    }
    Ok(config)
}
