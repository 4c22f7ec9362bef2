use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    sitemirror::logging::init().context("init logging")?;

    let cli = sitemirror::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        sitemirror::cli::Command::Crawl(args) => {
            sitemirror::crawl::run(args).await.context("crawl")?;
        }
        sitemirror::cli::Command::Localize(args) => {
            sitemirror::localize::run(args).await.context("localize")?;
        }
    }

    Ok(())
}
