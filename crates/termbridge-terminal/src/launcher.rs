/// Spawns target commands attached to a fresh pseudo-terminal
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::io_engine::Readiness;

const DEFAULT_TERM: &str = "xterm-256color";

/// What to run inside the terminal
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command line as a single string, for logs and listings
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },
    #[error("empty command")]
    EmptyCommand,
    #[error("working directory {} does not exist", .0.display())]
    MissingWorkingDir(PathBuf),
    #[error("failed to open pseudo-terminal: {0:#}")]
    OpenPty(anyhow::Error),
    #[error("failed to spawn `{command}`: {reason:#}")]
    Spawn {
        command: String,
        reason: anyhow::Error,
    },
    #[error("failed to attach to pseudo-terminal master: {0:#}")]
    Channel(anyhow::Error),
}

/// Owned handle to the spawned child.
///
/// The child is started by portable-pty with `setsid()`, so it leads a new
/// session and its pid doubles as its process group id.
pub struct ProcessHandle {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Process group of the spawned subtree
    pub fn process_group(&self) -> Option<i32> {
        self.pid
            .filter(|pid| *pid != 0 && *pid <= i32::MAX as u32)
            .map(|pid| pid as i32)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Kill only the direct child through portable-pty.
    ///
    /// Used where process-group signalling is unavailable.
    pub fn kill_child(&self) -> std::io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        killer.kill()
    }
}

/// Master side of the pseudo-terminal, split into its handles.
///
/// On unix the master is non-blocking and `readiness` waits on it.
pub struct MasterChannel {
    pub master: Box<dyn MasterPty + Send>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub readiness: Option<Readiness>,
}

/// Everything produced by a successful spawn
pub struct Launched {
    pub process: ProcessHandle,
    pub master: MasterChannel,
    /// Resolves with the exit code once the child has been reaped
    pub exit: oneshot::Receiver<Option<i32>>,
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Allocate a pseudo-terminal sized `rows x cols` and start `spec` on its
/// slave side.
///
/// Blocking (fork/exec); async callers should run it on a blocking thread.
/// On failure every partially created resource is dropped, which closes
/// both sides of the terminal.
pub fn spawn(spec: &SpawnSpec, rows: u16, cols: u16) -> Result<Launched, SpawnError> {
    if rows == 0 || cols == 0 {
        return Err(SpawnError::InvalidSize { rows, cols });
    }
    if spec.command.trim().is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    if let Some(dir) = &spec.working_dir {
        if !dir.is_dir() {
            return Err(SpawnError::MissingWorkingDir(dir.clone()));
        }
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(pty_size(rows, cols))
        .map_err(SpawnError::OpenPty)?;

    let mut cmd = CommandBuilder::new(&spec.command);
    cmd.args(&spec.args);
    if let Some(dir) = &spec.working_dir {
        cmd.cwd(dir);
    }
    if !spec.env.contains_key("TERM") {
        cmd.env("TERM", DEFAULT_TERM);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child: Box<dyn Child + Send + Sync> = pair
        .slave
        .spawn_command(cmd)
        .map_err(|reason| SpawnError::Spawn {
            command: spec.display(),
            reason,
        })?;
    // Only the child keeps the slave open, so its exit surfaces as EOF on
    // the master.
    drop(pair.slave);

    let master = pair.master;
    let channel = master
        .try_clone_reader()
        .and_then(|reader| master.take_writer().map(|writer| (reader, writer)));
    let (reader, writer) = match channel {
        Ok(parts) => parts,
        Err(e) => {
            let _ = child.kill();
            return Err(SpawnError::Channel(e));
        }
    };
    let readiness = match nonblocking(master.as_ref()) {
        Ok(readiness) => readiness,
        Err(e) => {
            let _ = child.kill();
            return Err(SpawnError::Channel(
                anyhow::Error::new(e).context("failed to make the master non-blocking"),
            ));
        }
    };

    let pid = child.process_id();
    let killer = child.clone_killer();
    let exited = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit_rx) = oneshot::channel();

    let exited_flag = Arc::clone(&exited);
    let command = spec.display();
    let waiter = std::thread::Builder::new()
        .name(format!("pty-wait-{}", pid.unwrap_or_default()))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    warn!(command = %command, error = %e, "failed to reap terminal child");
                    None
                }
            };
            exited_flag.store(true, Ordering::Release);
            debug!(command = %command, ?code, "terminal child exited");
            let _ = exit_tx.send(code);
        });
    if let Err(e) = waiter {
        let mut killer = killer;
        let _ = killer.kill();
        return Err(SpawnError::Spawn {
            command: spec.display(),
            reason: anyhow::Error::new(e).context("failed to start child monitor thread"),
        });
    }

    debug!(command = %spec.display(), ?pid, rows, cols, "spawned terminal process");

    Ok(Launched {
        process: ProcessHandle {
            pid,
            exited,
            killer: Mutex::new(killer),
        },
        master: MasterChannel {
            master,
            reader,
            writer,
            readiness,
        },
        exit: exit_rx,
    })
}

/// Switch the master to non-blocking mode. Every handle cloned from it
/// shares the open file description, so reader and writer follow.
#[cfg(unix)]
fn nonblocking(master: &(dyn MasterPty + Send)) -> std::io::Result<Option<Readiness>> {
    use std::os::fd::BorrowedFd;

    let Some(raw) = master.as_raw_fd() else {
        return Ok(None);
    };
    // SAFETY: `master` owns `raw` and outlives this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };

    // SAFETY: fcntl only reads and updates the descriptor's status flags.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }

    Readiness::new(fd).map(Some)
}

#[cfg(not(unix))]
fn nonblocking(_master: &(dyn MasterPty + Send)) -> std::io::Result<Option<Readiness>> {
    Ok(None)
}
