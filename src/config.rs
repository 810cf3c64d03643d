//! Engine configuration, read from TOML.
//!
//! ```toml
//! workers = 8
//! mode = "tcp"
//!
//! [tcp]
//! address = "10.0.0.5:7070"
//! connect_retries = 20
//! retry_delay_ms = 250
//! max_frame_bytes = 268435456
//! ```
//!
//! Every key is optional. Command-line flags override file values.

use std::fs;
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{PdcrError, Result};

/// Which backend runs a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Shared memory, one thread per worker.
    #[default]
    Threads,
    /// Message passing between in-process ranks.
    Local,
    /// Message passing between processes over TCP.
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub address: String,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    pub max_frame_bytes: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7070".into(),
            connect_retries: 10,
            retry_delay_ms: 200,
            max_frame_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub mode: Mode,
    pub tcp: TcpConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            mode: Mode::default(),
            tcp: TcpConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| PdcrError::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| PdcrError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PdcrError::Config("workers must be at least 1".into()));
        }
        if self.tcp.max_frame_bytes == 0 {
            return Err(PdcrError::Config("tcp.max_frame_bytes must be positive".into()));
        }
        if self.tcp.address.trim().is_empty() {
            return Err(PdcrError::Config("tcp.address is empty".into()));
        }
        Ok(())
    }
}
