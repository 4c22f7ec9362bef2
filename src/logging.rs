use anyhow::Context as _;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Installs the stderr subscriber.
///
/// `RUST_LOG` directives are layered over an `info` default, so
/// `RUST_LOG=sitemirror::fetcher=debug` adds asset detail without silencing
/// the per-page lines.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .try_from_env()
        .or_else(|_| EnvFilter::try_new(LevelFilter::INFO.to_string()))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
