// Configuration Management for Book Feed
// JSON file + environment overrides, passed explicitly to the pipeline

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::{clamp_scale, Precision};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

/// Streaming session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub ws_url: String,
    pub symbol: String,

    // Subscription parameters (fixed per deployment)
    pub frequency: String,
    pub depth: String,

    // Session timing
    pub heartbeat_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api-pub.bitfinex.com/ws/2".to_string(),
            symbol: "tBTCUSD".to_string(),
            frequency: "F0".to_string(),
            depth: "25".to_string(),
            heartbeat_interval_ms: 30_000,
            settle_delay_ms: 500,
            connect_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
        }
    }
}

impl FeedConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Initial view parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub precision: Precision,
    pub scale: f64,
    /// Rows considered when computing the depth-bar maximum
    pub display_rows: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            precision: Precision::default(),
            scale: 1.0,
            display_rows: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_logs: false,
            metrics_interval_secs: 10,
        }
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub ws_url: String,
    pub symbol: String,
    pub precision: Precision,
    pub settle_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    feed: FeedConfig,
    display: DisplayConfig,
    monitoring: MonitoringConfig,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self::default();

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Build from already-constructed sections (tests, embedding)
    pub fn from_parts(feed: FeedConfig, display: DisplayConfig, monitoring: MonitoringConfig) -> Self {
        Self { feed, display, monitoring }
    }

    /// Load configuration from JSON file. A missing file keeps defaults.
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        self.load_from_str(&content)?;

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Apply a JSON document with optional "feed", "display", "monitoring" sections
    pub fn load_from_str(&mut self, content: &str) -> Result<(), ConfigError> {
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(content)?;

        if let Some(feed) = config_data.get("feed") {
            self.feed = serde_json::from_value(feed.clone())?;
        }
        if let Some(display) = config_data.get("display") {
            self.display = serde_json::from_value(display.clone())?;
        }
        if let Some(monitoring) = config_data.get("monitoring") {
            self.monitoring = serde_json::from_value(monitoring.clone())?;
        }

        Ok(())
    }

    pub fn load_from_env(&mut self) {
        if let Ok(url) = std::env::var("BOOK_FEED_WS_URL") {
            self.feed.ws_url = url;
        }
        if let Ok(symbol) = std::env::var("BOOK_FEED_SYMBOL") {
            self.feed.symbol = symbol;
        }
        if let Ok(precision) = std::env::var("BOOK_FEED_PRECISION") {
            match precision.trim().parse::<i64>() {
                Ok(level) => self.display.precision = Precision::clamped(level),
                Err(_) => warn!(value = %precision, "Ignoring non-numeric BOOK_FEED_PRECISION"),
            }
        }
        if let Ok(level) = std::env::var("BOOK_FEED_LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
    }

    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut config_map = HashMap::new();
        config_map.insert("feed", serde_json::to_value(&self.feed)?);
        config_map.insert("display", serde_json::to_value(&self.display)?);
        config_map.insert("monitoring", serde_json::to_value(&self.monitoring)?);

        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Check values that would make the session unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !(self.feed.ws_url.starts_with("ws://") || self.feed.ws_url.starts_with("wss://")) {
            errors.push(format!("ws_url must be a ws:// or wss:// URL, got '{}'", self.feed.ws_url));
        }
        if self.feed.symbol.trim().is_empty() {
            errors.push("symbol must not be empty".to_string());
        }
        if self.feed.heartbeat_interval_ms == 0 {
            errors.push("heartbeat_interval_ms must be non-zero".to_string());
        }
        if self.feed.settle_delay_ms == 0 {
            errors.push("settle_delay_ms must be non-zero".to_string());
        }
        if self.feed.connect_timeout_ms == 0 {
            errors.push("connect_timeout_ms must be non-zero".to_string());
        }
        if self.display.display_rows == 0 {
            errors.push("display_rows must be non-zero".to_string());
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Err(ConfigError::Validation(errors.join("; ")));
        }

        Ok(())
    }

    pub fn get_summary(&self) -> ConfigSummary {
        ConfigSummary {
            ws_url: self.feed.ws_url.clone(),
            symbol: self.feed.symbol.clone(),
            precision: self.display.precision,
            settle_delay_ms: self.feed.settle_delay_ms,
            heartbeat_interval_ms: self.feed.heartbeat_interval_ms,
            log_level: self.monitoring.log_level.clone(),
        }
    }

    pub fn feed(&self) -> &FeedConfig {
        &self.feed
    }

    pub fn display(&self) -> DisplayConfig {
        DisplayConfig {
            scale: clamp_scale(self.display.scale),
            ..self.display.clone()
        }
    }

    pub fn monitoring(&self) -> &MonitoringConfig {
        &self.monitoring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let feed = FeedConfig::default();
        assert_eq!(feed.ws_url, "wss://api-pub.bitfinex.com/ws/2");
        assert_eq!(feed.frequency, "F0");
        assert_eq!(feed.depth, "25");
        assert_eq!(feed.heartbeat_interval(), Duration::from_secs(30));

        let display = DisplayConfig::default();
        assert_eq!(display.precision.level(), 0);
        assert_eq!(display.scale, 1.0);
        assert_eq!(display.display_rows, 10);
    }

    #[test]
    fn test_validation_rejects_zero_display_rows() {
        let display = DisplayConfig {
            display_rows: 0,
            ..DisplayConfig::default()
        };
        let manager = ConfigManager::from_parts(FeedConfig::default(), display, MonitoringConfig::default());

        match manager.validate() {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("display_rows")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_default_config_validates() {
        let manager = ConfigManager::default();
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_url_and_zero_delay() {
        let feed = FeedConfig {
            ws_url: "http://example.com".to_string(),
            settle_delay_ms: 0,
            ..FeedConfig::default()
        };
        let manager = ConfigManager::from_parts(feed, DisplayConfig::default(), MonitoringConfig::default());
        match manager.validate() {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("ws_url"));
                assert!(msg.contains("settle_delay_ms"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_partial_sections() {
        let mut manager = ConfigManager::default();
        manager
            .load_from_str(r#"{"feed":{"symbol":"tETHUSD","settle_delay_ms":250},"display":{"precision":9,"scale":7.0}}"#)
            .unwrap();

        assert_eq!(manager.feed().symbol, "tETHUSD");
        assert_eq!(manager.feed().settle_delay_ms, 250);
        // Unspecified fields fall back to defaults
        assert_eq!(manager.feed().depth, "25");
        // Out-of-range values are clamped, never rejected
        assert_eq!(manager.display().precision.level(), 4);
        assert_eq!(manager.display().scale, 2.0);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut manager = ConfigManager::default();
        assert!(matches!(manager.load_from_str("{not json"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("book_feed_cfg_{}", std::process::id()));
        let path = dir.join("config.json");
        let path_str = path.to_string_lossy().to_string();

        let mut manager = ConfigManager::default();
        manager.load_from_str(r#"{"feed":{"symbol":"tLTCUSD"}}"#).unwrap();
        manager.save_to_file(&path_str).unwrap();

        let mut reloaded = ConfigManager::default();
        reloaded.load_from_file(&path_str).unwrap();
        assert_eq!(reloaded.feed().symbol, "tLTCUSD");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_config_summary() {
        let manager = ConfigManager::default();
        let summary = manager.get_summary();
        assert_eq!(summary.symbol, "tBTCUSD");
        assert_eq!(summary.settle_delay_ms, 500);
    }
}
