// CLASSIFICATION: COMMUNITY
// Filename: config.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-08-21

//! Core configuration.
//!
//! Every field has a default so a partial TOML file is enough. The host owns
//! loading; the core only consumes a validated [`CoreConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::address::AddressRule;
use crate::quota::QuotaLimits;

/// Environment variable naming the active configuration file.
pub const CONFIG_PATH_ENV: &str = "COMPUTER_CORE_CONFIG";

pub const DEFAULT_HTTP_WHITELIST: &[&str] = &["*"];
pub const DEFAULT_HTTP_BLACKLIST: &[&str] = &[
    "0.0.0.0/8",
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "::/128",
    "::1/128",
    "fd00::/8",
    "fe80::/10",
];

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Worker threads resuming computers. Zero selects the hardware default.
    pub computer_threads: usize,
    /// Execution time shared by all workers within one host tick.
    pub max_main_global_time_ms: u64,
    /// Execution time granted to one resume.
    pub max_main_computer_time_ms: u64,
    /// Consecutive soft faults before a computer is shut down.
    pub soft_fault_limit: u32,
    /// Time past the deadline before a stuck worker is abandoned.
    pub abort_grace_ms: u64,
    /// Monitor thread polling period.
    pub monitor_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            computer_threads: 0,
            max_main_global_time_ms: 10,
            max_main_computer_time_ms: 5,
            soft_fault_limit: 3,
            abort_grace_ms: 1500,
            monitor_interval_ms: 1,
        }
    }
}

impl ExecutionConfig {
    pub fn worker_count(&self) -> usize {
        if self.computer_threads > 0 {
            return self.computer_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn global_budget(&self) -> Duration {
        Duration::from_millis(self.max_main_global_time_ms)
    }

    pub fn computer_budget(&self) -> Duration {
        Duration::from_millis(self.max_main_computer_time_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesystemConfig {
    pub computer_space_limit: u64,
    pub floppy_space_limit: u64,
    pub maximum_files_open: u64,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            computer_space_limit: 1000 * 1000,
            floppy_space_limit: 125 * 1000,
            maximum_files_open: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub enabled: bool,
    pub websocket_enabled: bool,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    /// Ports a connection may target. Empty allows any port.
    pub allowed_ports: Vec<u16>,
    pub timeout_ms: u64,
    pub max_requests: u64,
    pub max_download: u64,
    pub max_upload: u64,
    pub max_websockets: u64,
    pub max_websocket_message: u64,
    /// Requests in flight across every computer. Zero disables the ceiling.
    pub global_max_requests: u64,
    pub io_threads: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            websocket_enabled: true,
            whitelist: DEFAULT_HTTP_WHITELIST.iter().map(|s| s.to_string()).collect(),
            blacklist: DEFAULT_HTTP_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            allowed_ports: Vec::new(),
            timeout_ms: 30_000,
            max_requests: 16,
            max_download: 16 * 1024 * 1024,
            max_upload: 4 * 1024 * 1024,
            max_websockets: 4,
            max_websocket_message: 128 * 1024,
            global_max_requests: 0,
            io_threads: 4,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Complete configuration consumed by [`crate::host::ComputerHost`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub execution: ExecutionConfig,
    pub filesystem: FilesystemConfig,
    pub http: HttpConfig,
}

impl CoreConfig {
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let cfg: CoreConfig = toml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&data)
    }

    /// Load the file named by [`CONFIG_PATH_ENV`], falling back to defaults.
    pub fn load_active() -> Self {
        let Ok(path) = std::env::var(CONFIG_PATH_ENV) else {
            return Self::default();
        };
        match Self::load(Path::new(&path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("using default core config: {e}");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let exec = &self.execution;
        if exec.max_main_global_time_ms == 0 || exec.max_main_computer_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "execution budgets must be non-zero".to_string(),
            ));
        }
        if exec.max_main_computer_time_ms > exec.max_main_global_time_ms {
            return Err(ConfigError::Invalid(format!(
                "execution.max_main_computer_time_ms ({}) exceeds max_main_global_time_ms ({})",
                exec.max_main_computer_time_ms, exec.max_main_global_time_ms
            )));
        }
        if exec.soft_fault_limit == 0 {
            return Err(ConfigError::Invalid(
                "execution.soft_fault_limit must be at least 1".to_string(),
            ));
        }
        if self.http.io_threads == 0 {
            return Err(ConfigError::Invalid(
                "http.io_threads must be at least 1".to_string(),
            ));
        }
        for (idx, rule) in self.http.whitelist.iter().enumerate() {
            AddressRule::parse(rule)
                .map_err(|e| ConfigError::Invalid(format!("http.whitelist[{idx}] is invalid: {e}")))?;
        }
        for (idx, rule) in self.http.blacklist.iter().enumerate() {
            AddressRule::parse(rule)
                .map_err(|e| ConfigError::Invalid(format!("http.blacklist[{idx}] is invalid: {e}")))?;
        }
        for (idx, port) in self.http.allowed_ports.iter().enumerate() {
            if *port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "http.allowed_ports[{idx}] must be 1..65535"
                )));
            }
        }
        Ok(())
    }

    /// Quota ceilings for a computer's own storage and network usage.
    pub fn computer_limits(&self) -> QuotaLimits {
        QuotaLimits {
            filesystem_bytes: self.filesystem.computer_space_limit,
            open_file_handles: self.filesystem.maximum_files_open,
            network_requests: self.http.max_requests,
            websocket_connections: self.http.max_websockets,
            websocket_message_bytes: self.http.max_websocket_message,
        }
    }

    pub fn floppy_limits(&self) -> QuotaLimits {
        QuotaLimits::storage_only(self.filesystem.floppy_space_limit)
    }
}
