//! Runtime configuration (§9): the handful of knobs a deployment needs
//! to override — lock timeout, cursor/session timeouts, and the data
//! file path — loaded from an optional JSON file with environment
//! variables taking precedence, then defaults from [`crate::limits`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits::{CURSOR_TIMEOUT, LOCK_TIMEOUT, SESSION_TIMEOUT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_path: PathBuf,
    pub lock_timeout_secs: u64,
    pub cursor_timeout_secs: u64,
    pub session_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("monolite.db"),
            lock_timeout_secs: LOCK_TIMEOUT.as_secs(),
            cursor_timeout_secs: CURSOR_TIMEOUT.as_secs(),
            session_timeout_secs: SESSION_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Loads from `path` if it exists (JSON), then overlays `MONOLITE_*`
    /// environment variables, then falls back to defaults for anything
    /// unset.
    #[must_use]
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = path
            .filter(|p| p.exists())
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self::apply_env(&mut config);
        config
    }

    fn apply_env(config: &mut Self) {
        if let Ok(path) = std::env::var("MONOLITE_DATA_PATH") {
            config.data_path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("MONOLITE_LOCK_TIMEOUT_SECS").and_then(|v| v.parse().map_err(|_| std::env::VarError::NotPresent)) {
            config.lock_timeout_secs = secs;
        }
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    #[must_use]
    pub fn cursor_timeout(&self) -> Duration {
        Duration::from_secs(self.cursor_timeout_secs)
    }

    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_resource_limits() {
        let config = Config::default();
        assert_eq!(config.lock_timeout(), LOCK_TIMEOUT);
        assert_eq!(config.cursor_timeout(), CURSOR_TIMEOUT);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/monolite.json")));
        assert_eq!(config.data_path, PathBuf::from("monolite.db"));
    }
}
