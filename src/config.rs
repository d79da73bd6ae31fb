//! Bot configuration
//!
//! Load order: built-in defaults, then a JSON file (explicit path or
//! `<config dir>/telenotes/config.json` when present), then environment.

use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::providers::github::DEFAULT_API_BASE as GITHUB_API_BASE;
use crate::transport::telegram::DEFAULT_API_BASE as TELEGRAM_API_BASE;

pub const ENV_BOT_TOKEN: &str = "TELENOTES_BOT_TOKEN";
/// Accepted for compatibility with older deployments
pub const ENV_BOT_TOKEN_LEGACY: &str = "BOT_TOKEN";
pub const ENV_DATABASE: &str = "TELENOTES_DB";
pub const ENV_LOG_LEVEL: &str = "TELENOTES_LOG";
pub const ENV_GITHUB_API: &str = "TELENOTES_GITHUB_API";
pub const ENV_POLL_TIMEOUT: &str = "TELENOTES_POLL_TIMEOUT";

const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("Telegram bot token is not configured (set {} or telegram_token)", ENV_BOT_TOKEN)]
    MissingToken,
}

/// On-disk shape. Every field is optional and only overrides what it sets.
#[derive(Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    telegram_token: Option<String>,
    database_path: Option<PathBuf>,
    github_api_base: Option<String>,
    telegram_api_base: Option<String>,
    poll_timeout_secs: Option<u64>,
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram_token: Option<SecretString>,
    pub database_path: PathBuf,
    pub github_api_base: String,
    pub telegram_api_base: String,
    /// Long-poll wait passed to getUpdates
    pub poll_timeout_secs: u64,
    /// `tracing` level: error, warn, info, debug or trace
    pub log_level: String,
}

/// Get the path to the default config file
pub fn default_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("telenotes").join("config.json")
}

pub fn default_database_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    data_dir.join("telenotes").join("telenotes.db")
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            database_path: default_database_path(),
            github_api_base: GITHUB_API_BASE.to_string(),
            telegram_api_base: TELEGRAM_API_BASE.to_string(),
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl BotConfig {
    /// Load from disk and the process environment
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(explicit, &default_config_path(), |key| std::env::var(key).ok())
    }

    /// Load with an injectable default path and environment lookup.
    /// An explicit path must exist; the default path is optional.
    pub fn load_with(
        explicit: Option<&Path>,
        default_path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        match explicit {
            Some(path) => config.apply_file(path)?,
            None if default_path.exists() => config.apply_file(default_path)?,
            None => {}
        }
        config.apply_env(env)?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(token) = file.telegram_token.filter(|t| !t.trim().is_empty()) {
            self.telegram_token = Some(SecretString::from(token));
        }
        if let Some(db) = file.database_path {
            self.database_path = db;
        }
        if let Some(base) = file.github_api_base {
            self.github_api_base = base;
        }
        if let Some(base) = file.telegram_api_base {
            self.telegram_api_base = base;
        }
        if let Some(timeout) = file.poll_timeout_secs {
            self.poll_timeout_secs = timeout;
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        tracing::debug!("Loaded config from {:?}", path);
        Ok(())
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let set = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = set(ENV_BOT_TOKEN).or_else(|| set(ENV_BOT_TOKEN_LEGACY)) {
            self.telegram_token = Some(SecretString::from(token.trim().to_string()));
        }
        if let Some(db) = set(ENV_DATABASE) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(level) = set(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(base) = set(ENV_GITHUB_API) {
            self.github_api_base = base;
        }
        if let Some(raw) = set(ENV_POLL_TIMEOUT) {
            self.poll_timeout_secs = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_POLL_TIMEOUT.to_string(),
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    /// Bot token, required to serve
    pub fn require_token(&self) -> Result<&SecretString, ConfigError> {
        self.telegram_token.as_ref().ok_or(ConfigError::MissingToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file_or_env() {
        let dir = tempfile::tempdir().unwrap();
        let config = BotConfig::load_with(None, &dir.path().join("absent.json"), env(&[])).unwrap();
        assert!(config.telegram_token.is_none());
        assert_eq!(config.github_api_base, "https://api.github.com");
        assert_eq!(config.poll_timeout_secs, 30);
        assert!(matches!(config.require_token(), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_file_then_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"telegram_token":"file-token","database_path":"/srv/notes.db","log_level":"debug"}"#,
        )
        .unwrap();

        let config = BotConfig::load_with(Some(path.as_path()), Path::new("/nonexistent"), env(&[])).unwrap();
        assert_eq!(config.require_token().unwrap().expose_secret(), "file-token");
        assert_eq!(config.database_path, PathBuf::from("/srv/notes.db"));
        assert_eq!(config.log_level, "debug");

        let config = BotConfig::load_with(
            Some(path.as_path()),
            Path::new("/nonexistent"),
            env(&[(ENV_BOT_TOKEN_LEGACY, "legacy"), (ENV_DATABASE, "/tmp/x.db")]),
        )
        .unwrap();
        assert_eq!(config.require_token().unwrap().expose_secret(), "legacy");
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));

        let config = BotConfig::load_with(
            Some(path.as_path()),
            Path::new("/nonexistent"),
            env(&[(ENV_BOT_TOKEN_LEGACY, "legacy"), (ENV_BOT_TOKEN, "primary")]),
        )
        .unwrap();
        assert_eq!(config.require_token().unwrap().expose_secret(), "primary");
    }

    #[test]
    fn test_default_path_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"poll_timeout_secs": 5}"#).unwrap();
        let config = BotConfig::load_with(None, &path, env(&[])).unwrap();
        assert_eq!(config.poll_timeout_secs, 5);
    }

    #[test]
    fn test_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            BotConfig::load_with(Some(missing.as_path()), &missing, env(&[])),
            Err(ConfigError::Io { .. })
        ));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(
            BotConfig::load_with(Some(broken.as_path()), &missing, env(&[])),
            Err(ConfigError::Parse { .. })
        ));

        assert!(matches!(
            BotConfig::load_with(None, &missing, env(&[(ENV_POLL_TIMEOUT, "soon")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
