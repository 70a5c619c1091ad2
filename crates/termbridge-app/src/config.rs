use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use termbridge_terminal::{ManagerConfig, SpawnSpec, ValidatorConfig};
use termbridge_types::{
    DEFAULT_COLS, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_RING_BUFFER_BYTES, DEFAULT_ROWS,
    DEFAULT_TERMINATE_GRACE_MS, DEFAULT_WORKER_POOL_SIZE, DEFAULT_WRITE_DEADLINE_SECS,
};
use thiserror::Error;

use crate::cli::Cli;

/// Config file looked up in the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "termbridge.toml";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7681";
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid deny rule \"{name}\": {source}")]
    InvalidRule { name: String, source: regex::Error },
}

/// Bridge configuration, loaded from TOML. Every field has a default, so an
/// empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub ring_buffer_bytes: usize,
    pub worker_pool_size: usize,
    pub terminate_grace_ms: u64,
    /// Input to a terminal that stops reading is abandoned after this long
    pub write_deadline_secs: u64,
    pub default_rows: u16,
    pub default_cols: u16,
    /// Command started for new sessions; `$SHELL` or /bin/sh when unset
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Directory for per-session event logs
    pub log_dir: Option<PathBuf>,
    pub validator: ValidatorConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7681)),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            ring_buffer_bytes: DEFAULT_RING_BUFFER_BYTES,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            terminate_grace_ms: DEFAULT_TERMINATE_GRACE_MS,
            write_deadline_secs: DEFAULT_WRITE_DEADLINE_SECS,
            default_rows: DEFAULT_ROWS,
            default_cols: DEFAULT_COLS,
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            log_dir: None,
            validator: ValidatorConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolve the effective config: file (explicit or default location),
    /// then command-line overrides, then validation.
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load_from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::load_from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bind) = cli.bind {
            self.bind_addr = bind;
        }
        if let Some(secs) = cli.idle_timeout {
            self.idle_timeout_secs = secs;
        }
        if let Some(bytes) = cli.buffer_bytes {
            self.ring_buffer_bytes = bytes;
        }
        if let Some(workers) = cli.workers {
            self.worker_pool_size = workers;
        }
        if let Some(dir) = &cli.log_dir {
            self.log_dir = Some(dir.clone());
        }
        if let Some(command) = &cli.command {
            self.command = Some(command.clone());
            self.args.clear();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_buffer_bytes == 0 {
            return Err(ConfigError::Zero("ring_buffer_bytes"));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Zero("worker_pool_size"));
        }
        if self.default_rows == 0 {
            return Err(ConfigError::Zero("default_rows"));
        }
        if self.default_cols == 0 {
            return Err(ConfigError::Zero("default_cols"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero("sweep_interval_secs"));
        }
        if self.write_deadline_secs == 0 {
            return Err(ConfigError::Zero("write_deadline_secs"));
        }
        for rule in &self.validator.deny {
            regex::bytes::Regex::new(&rule.pattern).map_err(|source| ConfigError::InvalidRule {
                name: rule.name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            idle_timeout: self.idle_timeout(),
            ring_buffer_bytes: self.ring_buffer_bytes,
            worker_pool_size: self.worker_pool_size,
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            write_deadline: Duration::from_secs(self.write_deadline_secs),
            default_size: (self.default_rows, self.default_cols),
            validator: self.validator.clone(),
            log_dir: self.log_dir.clone(),
        }
    }

    /// The command new sessions run
    pub fn spawn_spec(&self) -> SpawnSpec {
        let command = self.command.clone().unwrap_or_else(default_shell);
        let mut spec = SpawnSpec::new(command).args(self.args.iter().cloned());
        if let Some(dir) = &self.working_dir {
            spec = spec.working_dir(dir);
        }
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        spec
    }
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
