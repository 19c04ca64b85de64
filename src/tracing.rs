use anyhow::anyhow;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Installs the global subscriber, logging to stderr so stdout stays free for
/// command output. `RUST_LOG` takes precedence over the configured
/// `log_level`.
pub fn init() -> anyhow::Result<()> {
    let level = crate::conf::global().log_level;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow!("Failed to init tracing: {error}"))?;
    Ok(())
}
