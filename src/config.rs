use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub relay: RelayConfig,
    pub carrier: CarrierConfig,
    pub credentials: CredentialsConfig,
    pub indicator: IndicatorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Liveness ping interval
    pub keep_alive_secs: u64,
    /// Upper bound on the initial connect handshake
    pub connect_timeout_secs: u64,
    /// Pause between automatic reconnect attempts after a drop
    pub reconnect_delay_ms: u64,
    /// Outbound publishes held in memory while offline
    pub offline_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Minimum gap between two consecutive carrier sends
    pub pacing_ms: u64,
    /// Envelopes waiting for the relay worker
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierDriver {
    /// Log segments instead of sending them
    Log,
    /// POST segments to an HTTP SMS API
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    pub driver: CarrierDriver,
    pub max_part_len: usize,
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    /// When unset, the indicator is only logged
    pub marker_path: Option<PathBuf>,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config in {}", path.display()))
    }

    /// [`load`](Self::load), or the built-in defaults when the file is
    /// missing or broken. Logging is not up yet, so the reason goes to stderr.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            eprintln!("sms-relay: {:#}; running with default settings", e);
            Self::default()
        })
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl RelayConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1000,
            offline_buffer: 100,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pacing_ms: 5000,
            queue_capacity: 256,
        }
    }
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            driver: CarrierDriver::Log,
            max_part_len: 160,
            url: None,
            token: None,
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("credentials.toml"),
        }
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            marker_path: None,
            title: "SMS Relay".to_string(),
            text: "SMS relay is running".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
