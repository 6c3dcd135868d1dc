//! Hub configuration.
//!
//! Loaded from a TOML file and/or overridden by command-line flags in
//! `main.rs`. Every field has a default, so an empty file (or no file at
//! all) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Relay payload traffic (text and binary) through the hub for peers
    /// that cannot establish a direct connection.
    pub ws_fallback: bool,
    /// Opaque ICE/TURN configuration pushed to clients in `ws-config`.
    pub rtc_config: serde_json::Value,
    /// Request header naming the real client address when the hub sits
    /// behind a reverse proxy (e.g. `x-forwarded-for`). `None` trusts the
    /// socket address.
    pub proxy_header: Option<String>,
    /// Join-family attempts admitted per rate window.
    pub rate_limit_attempts: usize,
    /// Rate window length in seconds.
    pub rate_limit_window_secs: u64,
    /// Keep-alive ping period in milliseconds. A peer is disconnected after
    /// two silent periods.
    pub keepalive_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ws_fallback: false,
            rtc_config: default_rtc_config(),
            proxy_header: None,
            rate_limit_attempts: 10,
            rate_limit_window_secs: 10,
            keepalive_ms: 2000,
        }
    }
}

fn default_rtc_config() -> serde_json::Value {
    json!({
        "sdpSemantics": "unified-plan",
        "iceServers": [{ "urls": "stun:stun.l.google.com:19302" }]
    })
}

impl HubConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: HubConfig = toml::from_str(&text)?;
        config.validate();
        Ok(config)
    }

    /// Clamp values that would make the hub unusable.
    pub fn validate(&mut self) {
        if self.keepalive_ms < 100 {
            self.keepalive_ms = 100;
        }
        if self.rate_limit_attempts == 0 {
            self.rate_limit_attempts = 1;
        }
        if self.rate_limit_window_secs == 0 {
            self.rate_limit_window_secs = 1;
        }
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: HubConfig = toml::from_str("").unwrap();
        assert!(!config.ws_fallback);
        assert_eq!(config.rate_limit_attempts, 10);
        assert_eq!(config.keepalive_ms, 2000);
        assert!(config.rtc_config.get("iceServers").is_some());
    }

    #[test]
    fn rtc_config_stays_opaque() {
        let config: HubConfig = toml::from_str(
            r#"
            ws_fallback = true

            [rtc_config]
            iceServers = [{ urls = "turn:turn.example.com", username = "u" }]
            "#,
        )
        .unwrap();
        assert!(config.ws_fallback);
        assert_eq!(
            config.rtc_config["iceServers"][0]["urls"],
            "turn:turn.example.com"
        );
    }

    #[test]
    fn validate_clamps_zeroes() {
        let mut config = HubConfig {
            keepalive_ms: 0,
            rate_limit_attempts: 0,
            rate_limit_window_secs: 0,
            ..HubConfig::default()
        };
        config.validate();
        assert_eq!(config.keepalive_ms, 100);
        assert_eq!(config.rate_limit_attempts, 1);
        assert_eq!(config.rate_limit_window_secs, 1);
    }
}
