//! Client configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vhub_core::{ConnectOptions, DEFAULT_PORT};

/// Top-level configuration for the command-line client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Control port, used when none is given on the command line.
    pub port: u16,
    /// Dial attempts before giving up.
    pub connect_attempts: u32,
    /// Per-attempt connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Pause between failed attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Quiet period before the device is pinged, in milliseconds.
    pub liveness_interval_ms: u64,
    /// How long to wait for the ping reply, in milliseconds.
    pub probe_timeout_ms: u64,
    /// How long to wait for the initial state dump, in milliseconds.
    pub prelude_timeout_ms: u64,
    /// How long to wait for each command's acknowledgement, in milliseconds.
    pub command_timeout_ms: u64,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        let options = ConnectOptions::default();
        Self {
            port: DEFAULT_PORT,
            connect_attempts: options.connect_attempts,
            connect_timeout_ms: millis(options.connect_timeout),
            retry_delay_ms: millis(options.retry_delay),
            liveness_interval_ms: millis(options.liveness_interval),
            probe_timeout_ms: millis(options.probe_timeout),
            prelude_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ── Loading ──────────────────────────────────────────────────────

impl CliConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

impl NetworkConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_attempts: self.connect_attempts,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            liveness_interval: Duration::from_millis(self.liveness_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn prelude_timeout(&self) -> Duration {
        Duration::from_millis(self.prelude_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = CliConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("[network]"));
        assert!(text.contains("liveness_interval_ms = 15000"));
        assert!(text.contains("level = \"info\""));
    }

    #[test]
    fn defaults_match_connect_options() {
        let cfg = CliConfig::default();
        assert_eq!(cfg.network.port, 9990);
        assert_eq!(cfg.network.connect_options(), ConnectOptions::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = CliConfig::parse("[network]\nport = 9991\nconnect_attempts = 2\n").unwrap();
        assert_eq!(cfg.network.port, 9991);
        assert_eq!(cfg.network.connect_options().connect_attempts, 2);
        assert_eq!(cfg.network.probe_timeout_ms, 5000);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn invalid_file_is_an_error() {
        assert!(CliConfig::parse("[network]\nport = \"high\"\n").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = CliConfig::load(Path::new("/nonexistent/vhub.toml"));
        assert_eq!(cfg.network.port, DEFAULT_PORT);
    }
}
