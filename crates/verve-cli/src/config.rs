//! Config file handling and setting resolution.
//!
//! Resolution order for every setting: CLI flag, `VERVE_*` environment
//! variable, config file, built-in default.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use verve_db::config::DbConfig;

/// On-disk config file shape (`~/.config/verve/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub events: EventsSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsSection {
    /// Postgres notification channel bridging events between replicas.
    /// Empty disables the bridge.
    #[serde(default)]
    pub channel: String,
}

/// Path to the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("verve")
        .join("config.toml")
}

/// Write the config file, creating parent directories.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = toml::to_string_pretty(config).context("failed to serialize config")?;
    fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Read the config file if present.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let body =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let config =
        toml::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(config))
}

/// Fully resolved runtime configuration. The events channel lives on
/// [`DbConfig`]: the bridge is a Postgres concern.
#[derive(Debug, Clone)]
pub struct VerveConfig {
    pub db_config: DbConfig,
    pub github_token: Option<String>,
}

impl VerveConfig {
    /// Resolve settings from CLI override, environment, config file, and
    /// defaults, in that order.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config()?.unwrap_or_default();

        // Environment (including VERVE_EVENTS_CHANNEL) first, then the
        // config file fills whatever is still unset.
        let mut db_config = DbConfig::from_env();
        if let Some(url) = cli_db_url {
            db_config.database_url = url.to_owned();
        } else if std::env::var("VERVE_DATABASE_URL").is_err() && !file.database.url.is_empty() {
            db_config.database_url = file.database.url.clone();
        }
        if db_config.notify_channel.is_none() && !file.events.channel.is_empty() {
            db_config.notify_channel = Some(file.events.channel.clone());
        }

        let github_token = std::env::var("GITHUB_TOKEN")
            .ok()
            .or_else(|| (!file.github.token.is_empty()).then(|| file.github.token.clone()));

        Ok(Self {
            db_config,
            github_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_roundtrip() {
        let config = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://localhost:5432/verve".into(),
            },
            github: GithubSection {
                token: "ghp_abc".into(),
            },
            events: EventsSection {
                channel: "verve_events".into(),
            },
        };
        let body = toml::to_string_pretty(&config).unwrap();
        let back: ConfigFile = toml::from_str(&body).unwrap();
        assert_eq!(back.database.url, config.database.url);
        assert_eq!(back.github.token, config.github.token);
        assert_eq!(back.events.channel, config.events.channel);
    }

    #[test]
    fn missing_sections_default() {
        let back: ConfigFile = toml::from_str("[database]\nurl = \"x\"\n").unwrap();
        assert_eq!(back.database.url, "x");
        assert!(back.github.token.is_empty());
        assert!(back.events.channel.is_empty());
    }
}
