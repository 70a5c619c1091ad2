#![allow(dead_code)]

use std::time::Duration;

use termbridge_terminal::{ManagerConfig, SessionEvent, SessionManager, SpawnSpec};
use tokio::sync::mpsc::UnboundedReceiver;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Manager with short timers suitable for tests
pub fn test_manager() -> SessionManager {
    test_manager_with(ManagerConfig {
        idle_timeout: Duration::from_millis(200),
        terminate_grace: Duration::from_millis(300),
        ring_buffer_bytes: 16 * 1024,
        ..Default::default()
    })
}

pub fn test_manager_with(config: ManagerConfig) -> SessionManager {
    SessionManager::new(config).expect("Failed to create session manager")
}

pub fn sh(script: &str) -> SpawnSpec {
    SpawnSpec::new("/bin/sh").args(["-c", script])
}

/// Next event, failing the test after [`EVENT_TIMEOUT`]
pub async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for session event")
        .expect("Event channel closed")
}

/// Collected output and every non-output event seen on the way
#[derive(Debug, Default)]
pub struct Transcript {
    pub output: String,
    pub events: Vec<SessionEvent>,
}

impl Transcript {
    pub fn closed_exit_code(&self) -> Option<Option<i32>> {
        self.events.iter().find_map(|e| match e {
            SessionEvent::Closed { exit_code } => Some(*exit_code),
            _ => None,
        })
    }
}

/// Read events until the output contains `needle`
pub async fn read_until(events: &mut UnboundedReceiver<SessionEvent>, needle: &str) -> Transcript {
    let mut transcript = Transcript::default();
    while !transcript.output.contains(needle) {
        match next_event(events).await {
            SessionEvent::Output(bytes) => {
                transcript.output.push_str(&String::from_utf8_lossy(&bytes));
            }
            SessionEvent::Closed { exit_code } => {
                panic!(
                    "Session closed with {:?} before {:?} appeared; output so far: {:?}",
                    exit_code, needle, transcript.output
                );
            }
            other => transcript.events.push(other),
        }
    }
    transcript
}

/// Read events until the closed event
pub async fn read_until_closed(events: &mut UnboundedReceiver<SessionEvent>) -> Transcript {
    let mut transcript = Transcript::default();
    loop {
        match next_event(events).await {
            SessionEvent::Output(bytes) => {
                transcript.output.push_str(&String::from_utf8_lossy(&bytes));
            }
            closed @ SessionEvent::Closed { .. } => {
                transcript.events.push(closed);
                return transcript;
            }
            other => transcript.events.push(other),
        }
    }
}

/// Whether a process with `pid` still exists
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Like [`process_alive`], but a zombie nobody has reaped yet counts as gone
#[cfg(unix)]
pub fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map_or(false, |(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => process_alive(pid),
    }
}

/// Poll `check` until it holds or the timeout passes
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
