use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Installs a structured, env-filterable subscriber. Mirrors the teacher's
/// `tracing`/`tracing-subscriber` wiring; there is no access/error log file
/// or rotation here, since this node has no request traffic worth auditing
/// beyond what `tracing` already prints to stdout.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
