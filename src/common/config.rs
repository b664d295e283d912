//! # Configuration Utilities
//!
//! Configuration structures shared by the broker and tank binaries. A single
//! TOML file may carry a `[broker]` and a `[tank]` section; every field is
//! optional and falls back to the documented default.
//!
//! ```toml
//! [broker]
//! address = "127.0.0.1:4711"
//! lease_duration_ms = 10000
//!
//! [tank]
//! broker_address = "127.0.0.1:4711"
//! token_dwell_ms = 2000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Arguments
/// - `path`: Path to the TOML configuration file
///
/// # Returns
/// - `Ok(T)`: Successfully loaded and parsed configuration
/// - `Err`: File I/O or parsing error
///
/// # Example
/// ```ignore
/// let config: RingConfig = load_config("config/ring.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let config: T = toml::from_str(&content).with_context(|| format!("parsing {}", path))?;
    Ok(config)
}

/// Top-level file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub broker: BrokerConfig,
    pub tank: TankConfig,
}

impl RingConfig {
    /// Load from `path`, or use defaults when no file is given.
    pub fn from_optional_file(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => load_config(path),
            None => Ok(Self::default()),
        }
    }
}

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the broker listens on (e.g., "127.0.0.1:4711")
    pub address: SocketAddr,
    /// Lease granted to tanks in every RegisterResponse
    pub lease_duration_ms: u64,
    /// Inactivity after which a tank is evicted (roughly twice the lease)
    pub liveness_threshold_ms: u64,
    /// Period of the liveness sweep
    pub sweep_interval_ms: u64,
    /// Maximum number of messages handled concurrently
    pub worker_pool_size: usize,
    /// How long in-flight workers may run after Shutdown before being aborted
    pub shutdown_grace_ms: u64,
    /// Wrap the transport in the key-exchange + AEAD layer
    pub secure: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 4711)),
            lease_duration_ms: 10_000,
            liveness_threshold_ms: 20_000,
            sweep_interval_ms: 1_000,
            worker_pool_size: 8,
            shutdown_grace_ms: 5_000,
            secure: false,
        }
    }
}

impl BrokerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_millis(self.liveness_threshold_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Tank settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TankConfig {
    /// Where to send RegisterRequest / DeregisterRequest / broker handoffs
    pub broker_address: SocketAddr,
    /// Local bind address; port 0 lets the OS choose
    pub bind_address: SocketAddr,
    /// Simulation tick period
    pub tick_interval_ms: u64,
    /// How long the token stays before moving right
    pub token_dwell_ms: u64,
    /// Retry period for RegisterRequest until the first response arrives
    pub register_retry_ms: u64,
    /// Cap on locally created fish
    pub max_fishies: usize,
    pub secure: bool,
}

impl Default for TankConfig {
    fn default() -> Self {
        Self {
            broker_address: SocketAddr::from(([127, 0, 0, 1], 4711)),
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            tick_interval_ms: 10,
            token_dwell_ms: 2_000,
            register_retry_ms: 1_000,
            max_fishies: 5,
            secure: false,
        }
    }
}

impl TankConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn token_dwell(&self) -> Duration {
        Duration::from_millis(self.token_dwell_ms)
    }

    pub fn register_retry(&self) -> Duration {
        Duration::from_millis(self.register_retry_ms)
    }
}
