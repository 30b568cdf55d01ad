//! Engine configuration loader.
//!
//! Reads `flowkeel.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing,
//! malformed, or describes a configuration the engine cannot run with.

use std::path::Path;

use flowkeel_types::config::EngineConfig;

use crate::sqlite::pool::default_database_url;

pub const CONFIG_FILE: &str = "flowkeel.toml";

/// Load engine configuration from `{data_dir}/flowkeel.toml`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    let config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            return EngineConfig::default();
        }
    };

    if let Err(reason) = config.validate() {
        tracing::warn!(path = %config_path.display(), reason = %reason, "invalid config, using defaults");
        return EngineConfig::default();
    }
    config
}

/// The configured database URL, or the `FLOWKEEL_DATA_DIR` / home default.
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}
