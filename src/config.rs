use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::error::ConfigError;
use crate::upload::local::MAX_LINK_EXPIRY;
use crate::upload::UploadConfig;

pub const ENV_UPLOAD_TIMEOUT_SECS: &str = "BOUNTY_CAPTURE_UPLOAD_TIMEOUT_SECS";
pub const ENV_STORAGE_ROOT: &str = "BOUNTY_CAPTURE_STORAGE_ROOT";
pub const ENV_LOG_LEVEL: &str = "BOUNTY_CAPTURE_LOG_LEVEL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub upload: UploadConfig,
    pub pip: PipConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Floating mirror window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for PipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 320,
            height: 240,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to the platform data directory.
    pub root: Option<PathBuf>,
    pub signing_secret: String,
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            signing_secret: "change-me".to_string(),
            public_base_url: None,
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("root", &self.root)
            .field("signing_secret", &"***REDACTED***")
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `env_logger` filter, e.g. `info` or `bounty_capture=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// `{config_dir}/bounty-capture/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bounty-capture").join("config.toml"))
    }

    /// Reads `path`, falling back to defaults when the file does not exist,
    /// then applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            debug!("Loading config from {}", path.display());
            let raw = std::fs::read_to_string(path)?;
            Self::from_toml(&raw)?
        } else {
            debug!("No config at {}; using defaults", path.display());
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => {
                warn!("No platform config directory; using defaults");
                let mut config = Self::default();
                config.apply_overrides(|key| std::env::var(key).ok())?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies overrides read through `lookup`, normally the process
    /// environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_UPLOAD_TIMEOUT_SECS) {
            self.upload.timeout_secs = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be a whole number, got {:?}", ENV_UPLOAD_TIMEOUT_SECS, raw))
            })?;
        }
        if let Some(root) = lookup(ENV_STORAGE_ROOT) {
            self.storage.root = Some(PathBuf::from(root));
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.preferred_mime_types.is_empty() && capture.fallback_mime_type.is_empty() {
            return Err(ConfigError::Invalid("capture needs at least one MIME type".into()));
        }
        if capture.fragment_interval_ms == 0 {
            return Err(ConfigError::Invalid("capture.fragment_interval_ms must be positive".into()));
        }
        if capture.finalize_timeout_ms == 0 {
            return Err(ConfigError::Invalid("capture.finalize_timeout_ms must be positive".into()));
        }
        if self.upload.timeout_secs == 0 {
            return Err(ConfigError::Invalid("upload.timeout_secs must be positive".into()));
        }
        let expiry = self.upload.signed_url_expiry_secs;
        if expiry == 0 || expiry > MAX_LINK_EXPIRY.as_secs() {
            return Err(ConfigError::Invalid(format!(
                "upload.signed_url_expiry_secs must be between 1 and {}, got {}",
                MAX_LINK_EXPIRY.as_secs(),
                expiry
            )));
        }
        if self.pip.enabled && (self.pip.width == 0 || self.pip.height == 0) {
            return Err(ConfigError::Invalid(format!(
                "pip size must be non-zero, got {}x{}",
                self.pip.width, self.pip.height
            )));
        }
        if self.storage.signing_secret.is_empty() {
            return Err(ConfigError::Invalid("storage.signing_secret must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [upload]
            timeout_secs = 30

            [pip]
            width = 400
            "#,
        )
        .unwrap();
        assert_eq!(config.upload.timeout_secs, 30);
        assert_eq!(config.pip.width, 400);
        assert_eq!(config.pip.height, 240);
        assert_eq!(config.capture.fragment_interval_ms, 1000);
        assert_eq!(config.logging.format, LogFormat::Text);
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.pip.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn file_on_disk_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[logging]\nformat = \"json\"\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(matches!(
            AppConfig::from_toml("[upload\ntimeout_secs = 1"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn environment_overrides_apply() {
        let env: HashMap<&str, &str> = [
            (ENV_UPLOAD_TIMEOUT_SECS, "15"),
            (ENV_STORAGE_ROOT, "/tmp/recordings"),
            (ENV_LOG_LEVEL, "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.upload.timeout_secs, 15);
        assert_eq!(config.storage.root, Some(PathBuf::from("/tmp/recordings")));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn bad_timeout_override_is_invalid() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_UPLOAD_TIMEOUT_SECS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn validation_rejects_zero_values() {
        let mut config = AppConfig::default();
        config.upload.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.signed_url_expiry_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.upload.signed_url_expiry_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pip.height = 0;
        assert!(config.validate().is_err());
        config.pip.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let rendered = format!("{:?}", StorageConfig::default());
        assert!(!rendered.contains("change-me"));
        assert!(rendered.contains("REDACTED"));
    }
}
