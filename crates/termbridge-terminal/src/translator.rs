/// Turns protocol-level signal and resize requests into OS operations
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{MasterPty, PtySize};
use termbridge_types::{SignalKind, EOT_BYTE};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::io_engine::{IoEngine, IoError};
use crate::launcher::ProcessHandle;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },
    #[error("failed to resize terminal: {0:#}")]
    Resize(anyhow::Error),
    #[error("no process group to signal")]
    NoProcessGroup,
    #[error("failed to send {signal} to process group {pgid}: {source}")]
    Kill {
        signal: &'static str,
        pgid: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to deliver end-of-transmission: {0}")]
    Eof(#[from] IoError),
}

/// Owns the PTY master for window-size changes and signal targeting
pub struct SignalTranslator {
    master: Mutex<Box<dyn MasterPty + Send>>,
    size: Mutex<(u16, u16)>,
    grace: Duration,
}

impl SignalTranslator {
    pub fn new(master: Box<dyn MasterPty + Send>, rows: u16, cols: u16, grace: Duration) -> Self {
        Self {
            master: Mutex::new(master),
            size: Mutex::new((rows, cols)),
            grace,
        }
    }

    /// Current (rows, cols)
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a new window size.
    ///
    /// The kernel delivers SIGWINCH to the foreground process group when
    /// the size actually changes. Repeating the current size is a no-op and
    /// returns `false`.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<bool, SignalError> {
        if rows == 0 || cols == 0 {
            return Err(SignalError::InvalidSize { rows, cols });
        }

        let mut size = self.size.lock().unwrap_or_else(|e| e.into_inner());
        if *size == (rows, cols) {
            return Ok(false);
        }

        self.master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(SignalError::Resize)?;
        *size = (rows, cols);
        debug!(rows, cols, "resized terminal");
        Ok(true)
    }

    /// Deliver `kind` to the session's process tree.
    pub async fn signal(
        &self,
        process: &Arc<ProcessHandle>,
        io: &IoEngine,
        kind: SignalKind,
    ) -> Result<(), SignalError> {
        match kind {
            SignalKind::Interrupt => self.interrupt(process, io).await,
            SignalKind::Terminate => self.terminate(process),
            SignalKind::Eof => {
                // Let the line discipline decide what EOF means.
                io.write(Bytes::from_static(&[EOT_BYTE])).await?;
                Ok(())
            }
        }
    }

    /// SIGTERM to the whole group, then SIGKILL once the grace period
    /// passes without the child exiting.
    pub fn terminate(&self, process: &Arc<ProcessHandle>) -> Result<(), SignalError> {
        if process.has_exited() {
            return Ok(());
        }
        self.send_to_group(process, Signal::Term)?;

        let process = Arc::clone(process);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !process.has_exited() {
                info!(pid = ?process.pid(), "process ignored SIGTERM, escalating to SIGKILL");
                if let Err(e) = force_kill(&process) {
                    warn!(pid = ?process.pid(), error = %e, "failed to escalate to SIGKILL");
                }
            }
        });
        Ok(())
    }

    /// Hang up the session's process group: SIGHUP now, SIGKILL once the
    /// grace period passes. Unlike [`terminate`](Self::terminate) this runs
    /// after the child exited, reclaiming background members that still
    /// hold the terminal open.
    pub fn hang_up(&self, process: &ProcessHandle) -> Result<(), SignalError> {
        #[cfg(unix)]
        {
            let pgid = process.process_group().ok_or(SignalError::NoProcessGroup)?;
            if !signal_group(pgid, Signal::Hup)? {
                return Ok(());
            }
            let grace = self.grace;
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        tokio::time::sleep(grace).await;
                        if let Err(e) = send_signal(pgid, Signal::Kill) {
                            warn!(pgid, error = %e, "failed to kill remaining process group");
                        }
                    });
                }
                Err(_) => send_signal(pgid, Signal::Kill)?,
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            force_kill(process)
        }
    }

    async fn interrupt(&self, process: &Arc<ProcessHandle>, io: &IoEngine) -> Result<(), SignalError> {
        #[cfg(unix)]
        {
            let _ = io;
            let foreground = self.foreground_group();
            match foreground {
                Some(pgid) => send_signal(pgid, Signal::Int),
                None => self.send_to_group(process, Signal::Int),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = process;
            io.write(Bytes::from_static(&[0x03])).await?;
            Ok(())
        }
    }

    /// Foreground process group of the terminal, if the platform exposes it
    fn foreground_group(&self) -> Option<i32> {
        #[cfg(unix)]
        {
            self.master
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .process_group_leader()
                .filter(|pgid| *pgid > 0)
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    fn send_to_group(&self, process: &ProcessHandle, signal: Signal) -> Result<(), SignalError> {
        #[cfg(unix)]
        {
            let pgid = process.process_group().ok_or(SignalError::NoProcessGroup)?;
            send_signal(pgid, signal)
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            process.kill_child().map_err(|source| SignalError::Kill {
                signal: "kill",
                pgid: process.process_group().unwrap_or_default(),
                source,
            })
        }
    }
}

/// SIGKILL the whole process group.
pub fn force_kill(process: &ProcessHandle) -> Result<(), SignalError> {
    if process.has_exited() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        let pgid = process.process_group().ok_or(SignalError::NoProcessGroup)?;
        send_signal(pgid, Signal::Kill)
    }
    #[cfg(not(unix))]
    {
        process.kill_child().map_err(|source| SignalError::Kill {
            signal: "kill",
            pgid: process.process_group().unwrap_or_default(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Hup,
    Int,
    Term,
    Kill,
}

impl Signal {
    fn name(self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

#[cfg(unix)]
fn send_signal(pgid: i32, signal: Signal) -> Result<(), SignalError> {
    signal_group(pgid, signal).map(|_| ())
}

/// Returns false when the group no longer exists
#[cfg(unix)]
fn signal_group(pgid: i32, signal: Signal) -> Result<bool, SignalError> {
    if pgid <= 0 {
        return Err(SignalError::NoProcessGroup);
    }
    // SAFETY: kill(2) with a negative pid signals the process group; no
    // memory is shared with the callee.
    let rc = unsafe { libc::kill(-pgid, signal.raw()) };
    if rc == 0 {
        debug!(pgid, signal = signal.name(), "signalled process group");
        return Ok(true);
    }
    let source = std::io::Error::last_os_error();
    if source.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(SignalError::Kill {
        signal: signal.name(),
        pgid,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_pty::native_pty_system;

    fn translator() -> SignalTranslator {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .unwrap();
        SignalTranslator::new(pair.master, 24, 80, Duration::from_millis(100))
    }

    #[test]
    fn test_resize_rejects_zero() {
        let translator = translator();
        assert!(matches!(
            translator.resize(0, 80),
            Err(SignalError::InvalidSize { rows: 0, cols: 80 })
        ));
        assert_eq!(translator.size(), (24, 80));
    }

    #[test]
    fn test_repeated_resize_is_noop() {
        let translator = translator();
        assert!(!translator.resize(24, 80).unwrap());
        assert!(translator.resize(40, 120).unwrap());
        assert!(!translator.resize(40, 120).unwrap());
        assert_eq!(translator.size(), (40, 120));
    }
}
