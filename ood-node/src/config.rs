//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ood_core::protocol::{Role, DEFAULT_SERVICE_ID};
use ood_core::{event, RaceConfig};
use serde::Deserialize;

use crate::session::ServiceOptions;
use crate::transport::LanConfig;

/// Node configuration. File: ~/.config/openoverdrive/config.toml or /etc/openoverdrive/config.toml.
/// Env overrides: OOD_ROLE, OOD_NAME, OOD_DISCOVERY_PORT, OOD_TRANSPORT_PORT, OOD_COUNTDOWN,
/// OOD_TARGET_LAPS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Host advertises and accepts; client joins the first host found.
    #[serde(default = "default_role")]
    pub role: Role,
    /// Display name sent in Join and adverts.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Discovery UDP port (default 45688).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Peer transport TCP port (default 45689).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_countdown")]
    pub countdown_seconds: u8,
    #[serde(default = "default_target_laps")]
    pub target_laps: u8,
    #[serde(default = "default_time_sync_interval_ms")]
    pub time_sync_interval_ms: u64,
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
}

fn default_role() -> Role {
    Role::Host
}
fn default_service_id() -> String {
    DEFAULT_SERVICE_ID.to_string()
}
fn default_discovery_port() -> u16 {
    45688
}
fn default_transport_port() -> u16 {
    45689
}
fn default_countdown() -> u8 {
    event::DEFAULT_COUNTDOWN_SECONDS
}
fn default_target_laps() -> u8 {
    event::DEFAULT_TARGET_LAPS
}
fn default_time_sync_interval_ms() -> u64 {
    1000
}
fn default_telemetry_interval_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            name: None,
            service_id: default_service_id(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            countdown_seconds: default_countdown(),
            target_laps: default_target_laps(),
            time_sync_interval_ms: default_time_sync_interval_ms(),
            telemetry_interval_ms: default_telemetry_interval_ms(),
        }
    }
}

impl Config {
    pub fn lan(&self) -> LanConfig {
        LanConfig {
            service_id: self.service_id.clone(),
            discovery_port: self.discovery_port,
            transport_port: self.transport_port,
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            race: RaceConfig {
                telemetry_interval_ms: self.telemetry_interval_ms as i64,
                ..RaceConfig::default()
            },
            time_sync_interval: Duration::from_millis(self.time_sync_interval_ms.max(1)),
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("OOD_ROLE") {
            match s.to_ascii_lowercase().as_str() {
                "host" => self.role = Role::Host,
                "client" => self.role = Role::Client,
                _ => {}
            }
        }
        if let Some(s) = var("OOD_NAME") {
            let s = s.trim();
            if !s.is_empty() {
                self.name = Some(s.to_string());
            }
        }
        if let Some(p) = var("OOD_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = var("OOD_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
            self.transport_port = p;
        }
        if let Some(n) = var("OOD_COUNTDOWN").and_then(|s| s.parse().ok()) {
            self.countdown_seconds = n;
        }
        if let Some(n) = var("OOD_TARGET_LAPS").and_then(|s| s.parse().ok()) {
            self.target_laps = n;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/openoverdrive/config.toml"));
    }
    out.push(PathBuf::from("/etc/openoverdrive/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    read_file(&path)
}

fn read_file(path: &Path) -> Option<Config> {
    let s = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config file");
            None
        }
    }
}
