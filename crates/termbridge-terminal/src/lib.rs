// Terminal session bridging
//
// Spawns commands on pseudo-terminals, pumps their bytes without blocking the
// async runtime, and keeps each session alive across client reconnects with a
// bounded replay buffer.

mod connection;
mod errors;
mod io_engine;
mod launcher;
mod logger;
mod manager;
mod output_buffer;
mod session;
mod translator;
mod validator;

// Re-export public API
pub use connection::{ClientConnection, ConnectionId, SessionEvent};
pub use errors::SessionError;
pub use io_engine::{CloseReason, IoEngine, IoError, Readiness, WorkerPool, DEFAULT_WRITE_DEADLINE};
pub use launcher::{spawn, Launched, MasterChannel, ProcessHandle, SpawnError, SpawnSpec};
pub use logger::SessionLogger;
pub use manager::{ManagerConfig, SessionManager, SweepReport};
pub use output_buffer::OutputBuffer;
pub use session::{AttachOutcome, InputReport, TerminalSession, TerminationReason};
pub use translator::{force_kill, SignalError, SignalTranslator};
pub use validator::{
    rule_names, DenyRule, InputStream, InputValidator, Rejection, Validated, ValidatorConfig,
    MAX_PENDING_CONTROL_BYTES, UNTERMINATED_RULE,
};
