// termbridge - interactive terminal sessions bridged to WebSocket clients

pub mod cli;
pub mod config;
pub mod logging;
pub mod resolver;
pub mod web;

pub use cli::Cli;
pub use config::{BridgeConfig, ConfigError};
pub use resolver::{ConfiguredCommand, SpawnResolver};
pub use web::{WebServer, WebServerConfig};
