use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "termbridge=info,termbridge_terminal=info,tower_http=info";

/// Build the filter: explicit `level` wins, then `RUST_LOG`, then the default.
pub fn env_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("Invalid log filter: {}", level)),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())),
    }
}

/// Install the global fmt subscriber
pub fn init(level: Option<&str>) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level)?)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .context("Failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_filter() {
        let filter = env_filter(Some("termbridge=debug")).unwrap();
        assert!(filter.to_string().contains("termbridge=debug"));
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        assert!(env_filter(Some("termbridge=notalevel")).is_err());
    }
}
