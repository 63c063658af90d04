//! Layered configuration.
//!
//! Values are merged from built-in defaults, an optional TOML file,
//! `CROSSPOINT_*` environment variables and command-line overrides, in that
//! order. The resulting [`AppConfig`] is handed to each component at
//! construction time.

use std::path::Path;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "crosspoint.toml";

/// Largest binary frame the device firmware accepts.
pub const MAX_CHUNK_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub discovery: DiscoveryConfig,
    pub conversion: ConversionConfig,
    pub verbose: bool,
    pub json_logs: bool,
}

/// Static device address and upload transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    /// WebSocket upload port.
    pub port: u16,
    /// Port of the device's HTTP file API.
    pub http_port: u16,
    pub upload_path: String,
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub reply_timeout_secs: u64,
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Wait per probe round, in milliseconds.
    pub timeout_ms: u64,
    pub attempts: u32,
    pub ports: Vec<u16>,
    pub probe: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub enabled: bool,
    pub jpeg_quality: u8,
    pub light_novel_mode: bool,
    pub screen_width: u32,
    pub screen_height: u32,
    pub split_overlap_percent: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            discovery: DiscoveryConfig::default(),
            conversion: ConversionConfig::default(),
            verbose: false,
            json_logs: false,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            port: 81,
            http_port: 80,
            upload_path: "/".to_string(),
            chunk_size: MAX_CHUNK_SIZE,
            connect_timeout_secs: 10,
            reply_timeout_secs: 60,
            send_timeout_secs: 30,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 1000,
            attempts: 3,
            ports: vec![8134, 54982, 48123, 39001, 44044, 59678],
            probe: "hello".to_string(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jpeg_quality: 85,
            light_novel_mode: false,
            screen_width: 480,
            screen_height: 800,
            split_overlap_percent: 15,
        }
    }
}

impl AppConfig {
    /// Load configuration from all layers.
    ///
    /// `config_file` defaults to [`DEFAULT_CONFIG_FILE`]; a missing file is
    /// not an error. `overrides` is any serializable struct shaped like
    /// `AppConfig` whose unset fields are skipped during serialization.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("CROSSPOINT_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Self::from_figment(figment)
    }

    /// Extract and validate a config from a prepared figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment
            .extract()
            .context("Failed to load configuration")?;
        config.validate()
    }

    /// Normalize values and reject settings the device cannot work with.
    pub fn validate(mut self) -> Result<Self> {
        if self.device.chunk_size == 0 {
            bail!("device.chunk_size must be greater than 0");
        }
        if self.device.chunk_size > MAX_CHUNK_SIZE {
            warn!(
                requested = self.device.chunk_size,
                max = MAX_CHUNK_SIZE,
                "chunk_size capped to device limit"
            );
            self.device.chunk_size = MAX_CHUNK_SIZE;
        }

        self.device.upload_path = normalize_upload_path(&self.device.upload_path);

        self.conversion.jpeg_quality = self.conversion.jpeg_quality.clamp(1, 95);

        if self.conversion.screen_width == 0 || self.conversion.screen_height == 0 {
            bail!("conversion.screen_width and conversion.screen_height must be greater than 0");
        }
        if self.conversion.split_overlap_percent >= 100 {
            bail!("conversion.split_overlap_percent must be below 100");
        }

        Ok(self)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

/// Leading slash, no trailing slash except for the root.
pub fn normalize_upload_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(toml: &str) -> Result<AppConfig> {
        AppConfig::from_figment(
            Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::string(toml)),
        )
    }

    #[test]
    fn test_defaults() {
        let config = load("").unwrap();
        assert_eq!(config.device.host, "192.168.4.1");
        assert_eq!(config.device.port, 81);
        assert_eq!(config.device.upload_path, "/");
        assert_eq!(config.device.chunk_size, 2048);
        assert!(!config.conversion.enabled);
        assert_eq!(config.conversion.jpeg_quality, 85);
        assert_eq!(config.conversion.screen_width, 480);
        assert_eq!(config.conversion.screen_height, 800);
        assert_eq!(config.conversion.split_overlap_percent, 15);
    }

    #[test]
    fn test_toml_layer_overrides_defaults() {
        let config = load(
            r#"
            [device]
            host = "10.0.0.7"
            upload_path = "books/"

            [conversion]
            enabled = true
            light_novel_mode = true
            "#,
        )
        .unwrap();

        assert_eq!(config.device.host, "10.0.0.7");
        assert_eq!(config.device.upload_path, "/books");
        assert_eq!(config.device.port, 81);
        assert!(config.conversion.enabled);
        assert!(config.conversion.light_novel_mode);
    }

    #[test]
    fn test_chunk_size_capped() {
        let config = load("[device]\nchunk_size = 65536").unwrap();
        assert_eq!(config.device.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(load("[device]\nchunk_size = 0").is_err());
    }

    #[test]
    fn test_quality_clamped() {
        let config = load("[conversion]\njpeg_quality = 100").unwrap();
        assert_eq!(config.conversion.jpeg_quality, 95);

        let config = load("[conversion]\njpeg_quality = 0").unwrap();
        assert_eq!(config.conversion.jpeg_quality, 1);
    }

    #[test]
    fn test_overlap_must_be_below_100() {
        assert!(load("[conversion]\nsplit_overlap_percent = 100").is_err());
    }

    #[test]
    fn test_normalize_upload_path() {
        assert_eq!(normalize_upload_path("/"), "/");
        assert_eq!(normalize_upload_path(""), "/");
        assert_eq!(normalize_upload_path("books"), "/books");
        assert_eq!(normalize_upload_path("/books/"), "/books");
        assert_eq!(normalize_upload_path("/a/b//"), "/a/b");
    }

    #[test]
    fn test_serialized_overrides_win() {
        #[derive(Serialize)]
        struct Overrides {
            device: DeviceOverrides,
        }
        #[derive(Serialize)]
        struct DeviceOverrides {
            #[serde(skip_serializing_if = "Option::is_none")]
            host: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            port: Option<u16>,
        }

        let overrides = Overrides {
            device: DeviceOverrides {
                host: Some("127.0.0.1".to_string()),
                port: None,
            },
        };

        let config = AppConfig::from_figment(
            Figment::from(Serialized::defaults(AppConfig::default()))
                .merge(Toml::string("[device]\nhost = \"10.0.0.7\"\nport = 8081"))
                .merge(Serialized::defaults(&overrides)),
        )
        .unwrap();

        assert_eq!(config.device.host, "127.0.0.1");
        assert_eq!(config.device.port, 8081);
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = AppConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed = load(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
