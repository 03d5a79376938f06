//! Installation configuration.
//!
//! Every store takes its directory from a `Config` value rather than a
//! process-wide constant, so tests can point a whole installation at a
//! temporary directory.
//!
//! The default directory is `~/.roomy-cli`; `ROOMY_CONFIG_DIR` overrides it.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Duration;

/// Application name used for the config directory path
const APP_DIR_NAME: &str = ".roomy-cli";

/// Default keyserver that hands out derived passphrases
const DEFAULT_KEYSERVER_URL: &str = "https://jazz.keyserver.roomy.chat";

/// Pending OAuth authorizations are honored for one hour.
const DEFAULT_STATE_TTL_SECS: i64 = 60 * 60;

/// Lock markers older than this are considered abandoned.
const DEFAULT_LOCK_STALE_SECS: i64 = 45;

const CONFIG_DIR_ENV: &str = "ROOMY_CONFIG_DIR";
const KEYSERVER_URL_ENV: &str = "ROOMY_KEYSERVER_URL";
const USE_KEYCHAIN_ENV: &str = "ROOMY_USE_KEYCHAIN";

#[derive(Debug, Clone)]
pub struct Config {
    pub config_dir: PathBuf,
    pub keyserver_url: String,
    /// Store secrets in the platform keychain, falling back to `.credentials`
    pub use_keychain: bool,
    pub state_ttl: Duration,
    pub lock_stale_after: Duration,
}

impl Config {
    /// Configuration rooted at `config_dir` with every other setting at its default.
    /// The keychain is disabled so the installation is fully self-contained.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            keyserver_url: DEFAULT_KEYSERVER_URL.to_string(),
            use_keychain: false,
            state_ttl: Duration::seconds(DEFAULT_STATE_TTL_SECS),
            lock_stale_after: Duration::seconds(DEFAULT_LOCK_STALE_SECS),
        }
    }

    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        let config_dir = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => Self::default_config_dir()?,
        };

        let mut config = Self::with_dir(config_dir);
        config.use_keychain = true;

        if let Ok(url) = std::env::var(KEYSERVER_URL_ENV) {
            if !url.trim().is_empty() {
                config.keyserver_url = url.trim().trim_end_matches('/').to_string();
            }
        }

        if let Ok(value) = std::env::var(USE_KEYCHAIN_ENV) {
            config.use_keychain = parse_flag(&value).unwrap_or(true);
        }

        Ok(config)
    }

    fn default_config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(APP_DIR_NAME))
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.config_dir.join(file_name)
    }

    pub fn dir(&self) -> &Path {
        &self.config_dir
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_dir_defaults() {
        let config = Config::with_dir("/tmp/roomy-test");
        assert_eq!(config.config_dir, PathBuf::from("/tmp/roomy-test"));
        assert_eq!(config.state_ttl, Duration::hours(1));
        assert_eq!(config.lock_stale_after, Duration::seconds(45));
        assert!(!config.use_keychain);
    }

    #[test]
    fn test_path_joins_config_dir() {
        let config = Config::with_dir("/tmp/roomy-test");
        assert_eq!(
            config.path("oauth-states.json"),
            PathBuf::from("/tmp/roomy-test/oauth-states.json")
        );
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("false"), Some(false));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag("maybe"), None);
    }
}
