use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{CommandFactory, Parser};
use clap_complete::Shell;

/// CLI arguments for termbridge
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(about = "Bridge interactive terminal sessions to browser clients over WebSocket")]
#[command(version)]
pub struct Cli {
    /// Path to config file (default: termbridge.toml in the working directory)
    #[arg(long, value_name = "PATH", env = "TERMBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR", env = "TERMBRIDGE_BIND")]
    pub bind: Option<SocketAddr>,

    /// Seconds a detached session may sit idle before it is terminated
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Replay buffer capacity per session
    #[arg(long, value_name = "BYTES")]
    pub buffer_bytes: Option<usize>,

    /// Blocking workers for terminal writes
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Log filter, e.g. "debug" or "termbridge=debug,tower_http=info"
    #[arg(long, value_name = "FILTER", env = "TERMBRIDGE_LOG")]
    pub log_level: Option<String>,

    /// Write per-session event logs to this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Command to run in new sessions (replaces configured command and args)
    #[arg(long, value_name = "COMMAND")]
    pub command: Option<String>,

    /// Generate shell completions
    #[arg(long, value_enum)]
    pub generate: Option<Shell>,
}

impl Cli {
    /// Write completions for `shell` to `out`
    pub fn print_completions(shell: Shell, out: &mut dyn std::io::Write) {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(shell, &mut command, name, out);
    }
}
