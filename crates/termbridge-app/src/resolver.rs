use anyhow::Result;
use async_trait::async_trait;
use termbridge_terminal::SpawnSpec;

/// Environment variable carrying the session key into spawned processes
pub const SESSION_KEY_ENV: &str = "TERMBRIDGE_SESSION_KEY";

/// Decides what to run for a session key.
///
/// The result is only used when no live session exists for the key.
#[async_trait]
pub trait SpawnResolver: Send + Sync {
    async fn resolve(&self, session_key: &str) -> Result<SpawnSpec>;
}

/// Runs the same configured command for every key
#[derive(Debug, Clone)]
pub struct ConfiguredCommand {
    spec: SpawnSpec,
}

impl ConfiguredCommand {
    pub fn new(spec: SpawnSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl SpawnResolver for ConfiguredCommand {
    async fn resolve(&self, session_key: &str) -> Result<SpawnSpec> {
        Ok(self.spec.clone().env(SESSION_KEY_ENV, session_key))
    }
}
