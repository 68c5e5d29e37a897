//! Configuration loading for runloom.
//!
//! The data directory holds `config.toml` and `runloom.db`. It is
//! `RUNLOOM_DATA_DIR` when set, otherwise `~/.runloom`.

use std::path::{Path, PathBuf};

use runloom_types::config::GlobalConfig;

/// Invalid or incomplete configuration for a component that needs it.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("provider.base_url is not set; configure it or use a dry run")]
    MissingBaseUrl,

    #[error("environment variable {0} holding the provider token is not set")]
    MissingToken(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "RUNLOOM_DATA_DIR";

/// Resolve the data directory from the environment or the home directory.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".runloom"),
        None => PathBuf::from(".runloom"),
    }
}

/// Load `{data_dir}/config.toml`.
///
/// A missing file yields [`GlobalConfig::default()`]. An unreadable or
/// malformed file is logged and also yields the default.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml, using defaults");
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            GlobalConfig::default()
        }
    }
}
