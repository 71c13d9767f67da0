// src/config.rs

//! Manages tunnel configuration: loading, validation, and duration
//! resolution.

use crate::core::timeouts::TimeoutConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use url::Url;

/// Which end of the tunnel this process runs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accepts local TCP clients and forwards them through one outbound
    /// WebSocket.
    Listener,
    /// Accepts WebSockets and originates TCP connections to the configured
    /// target.
    Server,
}

/// The four operation deadlines, in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeoutsSection {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_linger_delay_ms")]
    pub linger_delay_ms: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            linger_delay_ms: default_linger_delay_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}
fn default_linger_delay_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the validated tunnel configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Local bind: `tcp://host:port` in listener mode, `ws://host:port` in
    /// server mode.
    pub listen_on: String,
    /// Upstream: `ws://` or `wss://` in listener mode, `tcp://host:port` in
    /// server mode.
    pub tunnel_to: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Destination file for trace/warn records; empty or absent logs to
    /// stdout.
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Listener => {
                require_scheme("listen_on", &self.listen_on, &["tcp"])?;
                require_scheme("tunnel_to", &self.tunnel_to, &["ws", "wss"])?;
            }
            Mode::Server => {
                require_scheme("listen_on", &self.listen_on, &["ws"])?;
                require_scheme("tunnel_to", &self.tunnel_to, &["tcp"])?;
            }
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("connect_timeout_ms", t.connect_timeout_ms),
            ("send_timeout_ms", t.send_timeout_ms),
            ("idle_timeout_ms", t.idle_timeout_ms),
            ("linger_delay_ms", t.linger_delay_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("timeouts.{name} cannot be 0"));
            }
        }
        Ok(())
    }

    /// Resolves the millisecond fields into the engine's duration set.
    pub fn timeout_config(&self) -> TimeoutConfig {
        let t = &self.timeouts;
        TimeoutConfig {
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            send_timeout: Duration::from_millis(t.send_timeout_ms),
            idle_timeout: Duration::from_millis(t.idle_timeout_ms),
            linger_delay: Duration::from_millis(t.linger_delay_ms),
        }
    }
}

/// Extracts the `host:port` authority from a configured URI.
pub fn bind_addr(name: &str, uri: &str) -> Result<String> {
    let url = Url::parse(uri).with_context(|| format!("invalid {name} URI '{uri}'"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("{name} URI '{uri}' has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("{name} URI '{uri}' has no explicit port"))?;
    Ok(format!("{host}:{port}"))
}

fn require_scheme(name: &str, uri: &str, allowed: &[&str]) -> Result<()> {
    if uri.trim().is_empty() {
        return Err(anyhow!("{name} cannot be empty"));
    }
    let url = Url::parse(uri).with_context(|| format!("invalid {name} URI '{uri}'"))?;
    if !allowed.contains(&url.scheme()) {
        return Err(anyhow!(
            "{name} URI '{uri}' must use one of the schemes: {}",
            allowed.join(", ")
        ));
    }
    if url.host_str().is_none() {
        return Err(anyhow!("{name} URI '{uri}' has no host"));
    }
    if url.port_or_known_default().is_none() {
        return Err(anyhow!("{name} URI '{uri}' has no explicit port"));
    }
    Ok(())
}
