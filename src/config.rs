use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub pacing: PacingConfig,
    pub estimation: EstimationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub control_port: u16,
    pub probe_port: u16,
    pub socket_tick_ms: u64,      // UDP receive timeout, also control read timeout
    pub expiration_ms: u64,       // inbox wait tick of the listener and sender roles
    pub connect_timeout_ms: u64,
    pub max_connections: i32,
    pub wait_limit_secs: Option<u64>, // None = wait while the local acceptor lives
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub bursts_per_second: u64,
    pub settle_ms: u64, // pause before and after each probe stream
    pub warmup_rate_kbps: u64,
    pub warmup_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    pub initial_rate_kbps: u64,
    pub growth_factor: u64,
    pub probe_secs: u64,
    pub alpha: f64, // relative tolerance between requested and observed rate
    pub beta: f64,  // overdrive factor for the sigma search
    pub step_kbps: u64,
    pub cbr_kbps: u64,
    pub sync_lead_ms: u64,
    pub max_sigma_probe_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            control_port: 5000,
            probe_port: 6000,
            socket_tick_ms: 3000,
            expiration_ms: 5000,
            connect_timeout_ms: 3000,
            max_connections: 50,
            wait_limit_secs: None,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            bursts_per_second: 30,
            settle_ms: 1000,
            warmup_rate_kbps: 600,
            warmup_secs: 1,
        }
    }
}

impl Default for EstimationConfig {
    fn default() -> Self {
        EstimationConfig {
            initial_rate_kbps: 1000,
            growth_factor: 10,
            probe_secs: 2,
            alpha: 0.05,
            beta: 1.5,
            step_kbps: 100,
            cbr_kbps: 1000,
            sync_lead_ms: 1000,
            max_sigma_probe_secs: 64,
        }
    }
}

impl Config {
    /// Loads a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }
}

impl NetworkConfig {
    pub fn socket_tick(&self) -> Duration {
        Duration::from_millis(self.socket_tick_ms)
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn wait_limit(&self) -> Option<Duration> {
        self.wait_limit_secs.map(Duration::from_secs)
    }
}

impl PacingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl EstimationConfig {
    pub fn sync_lead(&self) -> Duration {
        Duration::from_millis(self.sync_lead_ms)
    }

    /// Longest stream any phase sends, in seconds.
    pub fn longest_probe_secs(&self) -> u64 {
        self.probe_secs.max(self.max_sigma_probe_secs)
    }
}
