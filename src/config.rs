use crate::error::AppError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "LBW_CONFIG";

/// Static configuration, read from TOML
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub storage_path: String,
    /// Prefix of client-generated record ids
    pub temp_id_prefix: String,
    pub backend: BackendConfig,
    pub sync: SyncConfig,
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub visual_table: String,
    pub visual_key: String,
    pub attachment_table: String,
    pub attachment_key: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiveConfig {
    /// Quiet window after a user mutation
    pub cooldown_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/lbw-inspect.db".to_string(),
            storage_path: "./photos".to_string(),
            temp_id_prefix: "temp_lbw_".to_string(),
            backend: BackendConfig::default(),
            sync: SyncConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            access_token: None,
            visual_table: "LPS_Services_LBW".to_string(),
            visual_key: "LBWID".to_string(),
            attachment_table: "LPS_Services_LBW_Attach".to_string(),
            attachment_key: "AttachID".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_retries: 5,
            backoff_base_secs: 60,
            backoff_max_secs: 300,
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { cooldown_ms: 2500 }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl LiveConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, AppError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, AppError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(AppError::Filesystem(e)),
        }
    }

    /// Explicit path first, then `LBW_CONFIG`, then `./lbw-inspect.toml`
    pub fn discover(explicit: Option<&str>) -> Result<Self, AppError> {
        let path = explicit
            .map(|p| p.to_string())
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| "./lbw-inspect.toml".to_string());
        Self::load(Path::new(&path))
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.temp_id_prefix.trim().is_empty() {
            return Err(AppError::Config("temp_id_prefix must not be empty".to_string()));
        }
        if self.sync.backoff_max_secs < self.sync.backoff_base_secs {
            return Err(AppError::Config(
                "sync.backoff_max_secs must be >= sync.backoff_base_secs".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            storage_path = "/data/photos"

            [sync]
            max_retries = 8

            [live]
            cooldown_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.storage_path, "/data/photos");
        assert_eq!(config.sync.max_retries, 8);
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.live.cooldown(), Duration::from_millis(1000));
        assert_eq!(config.temp_id_prefix, "temp_lbw_");
        assert_eq!(config.backend.visual_key, "LBWID");
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let result = AppConfig::from_toml_str(
            r#"
            [sync]
            backoff_base_secs = 10
            backoff_max_secs = 5
            "#,
        );
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = AppConfig::load(Path::new("/nonexistent/lbw-inspect.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }
}
