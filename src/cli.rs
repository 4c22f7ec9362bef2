use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Mirror an authenticated site, starting from a seed URL.
    ///
    /// The session cookie is read from `SITEMIRROR_COOKIE`.
    Crawl(CrawlArgs),
    /// Localize the external assets of already-saved HTML files.
    Localize(LocalizeArgs),
}

#[derive(Debug, Args)]
pub struct CrawlArgs {
    /// Seed URL (must be http/https).
    #[arg(long)]
    pub url: String,

    /// Output directory for the mirror.
    #[arg(long)]
    pub out: String,

    /// Only follow links whose path is under this prefix
    /// (default: the seed's directory).
    #[arg(long)]
    pub scope_prefix: Option<String>,

    /// Query key to drop when deduplicating URLs; repeatable
    /// (default: int, redirectUrl, %3Factive_tab_data%3Dfactor-advice).
    #[arg(long)]
    pub ignore_query_key: Vec<String>,

    /// Stop after this many pages.
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Maximum concurrent asset downloads within one page.
    #[arg(long, default_value_t = 4)]
    pub asset_concurrency: usize,

    /// Rewrite in-scope links to point at the mirrored pages.
    #[arg(long)]
    pub rewrite_links: bool,
}

#[derive(Debug, Args)]
pub struct LocalizeArgs {
    /// Directory of saved HTML files.
    #[arg(long)]
    pub input: String,

    /// Output directory for localized pages and their assets.
    #[arg(long)]
    pub out: String,

    /// Maximum concurrent asset downloads within one document.
    #[arg(long, default_value_t = 4)]
    pub asset_concurrency: usize,
}
