use std::fs::OpenOptions;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::canonical::{CanonicalUrl, canonicalize_absolute};
use crate::cli::CrawlArgs;
use crate::config::{AssetSelection, MirrorConfig, SessionConfig};
use crate::formats::{AssetFailureRecord, CrawlRecord};
use crate::frontier::Frontier;
use crate::mirror_path::PathMapper;
use crate::page::PageProcessor;
use crate::scope::CrawlScope;
use crate::session::{HttpSession, Session, TransportError};

pub const CRAWL_LOG_FILE: &str = "crawl.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum PageFetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("not html: {0}")]
    NotHtml(String),
    #[error("redirected out of scope to {0}")]
    OutOfScope(Url),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub pages_saved: usize,
    pub pages_failed: usize,
    pub assets_stored: usize,
    pub assets_reused: usize,
    pub asset_failures: usize,
    /// Stopped by cancellation or the page limit with work still queued.
    pub interrupted: bool,
}

/// Drives the breadth-first crawl: one page, with all of its assets, is
/// fetched, rewritten and saved before the next is dequeued.
pub struct MirrorPipeline<'s> {
    config: MirrorConfig,
    session: &'s dyn Session,
    seed: CanonicalUrl,
    scope: CrawlScope,
    processor: PageProcessor<'s>,
}

impl<'s> MirrorPipeline<'s> {
    pub fn new(config: MirrorConfig, session: &'s dyn Session) -> anyhow::Result<Self> {
        if config.seed.scheme() != "http" && config.seed.scheme() != "https" {
            anyhow::bail!("seed url must be http/https: {}", config.seed);
        }
        let seed = canonicalize_absolute(config.seed.as_str(), &config.ignore_query_keys)
            .context("canonicalize seed url")?;

        let default_prefix = seed_directory(seed.as_url());
        let prefix = config.scope_prefix.as_deref().unwrap_or(&default_prefix);
        let scope = CrawlScope::new(seed.as_url(), Some(prefix)).context("build crawl scope")?;
        if !scope.contains(seed.as_url()) {
            tracing::info!(
                seed = %seed,
                prefix = scope.path_prefix(),
                "seed url is outside the crawl scope; only its in-scope links are followed"
            );
        }

        let mapper = PathMapper::new(&config.out_dir).context("build path mapper")?;
        let processor = PageProcessor::new(session, mapper)
            .with_links(
                scope.clone(),
                config.ignore_query_keys.clone(),
                config.rewrite_links,
            )
            .with_asset_selection(AssetSelection::ResolveRelative)
            .with_asset_concurrency(config.asset_concurrency);

        Ok(Self {
            config,
            session,
            seed,
            scope,
            processor,
        })
    }

    pub fn seed(&self) -> &CanonicalUrl {
        &self.seed
    }

    pub async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<CrawlSummary> {
        std::fs::create_dir_all(&self.config.out_dir).with_context(|| {
            format!("create mirror dir: {}", self.config.out_dir.display())
        })?;
        let log_path = self.config.out_dir.join(CRAWL_LOG_FILE);
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open crawl log: {}", log_path.display()))?;
        let mut log = BufWriter::new(log_file);

        let mut frontier = Frontier::seeded(self.seed.clone());
        let mut summary = CrawlSummary::default();
        let mut processed = 0_usize;

        loop {
            if cancel.is_cancelled() {
                tracing::warn!(pending = frontier.pending(), "crawl cancelled");
                summary.interrupted = !frontier.is_empty();
                break;
            }
            if self.config.max_pages.is_some_and(|max| processed >= max) {
                tracing::info!(pending = frontier.pending(), "page limit reached");
                summary.interrupted = !frontier.is_empty();
                break;
            }
            let Some(url) = frontier.next_unvisited() else {
                break;
            };
            processed += 1;

            let record = self.crawl_one(&url, &mut frontier, &mut summary).await?;
            serde_json::to_writer(&mut log, &record).context("write crawl record json")?;
            log.write_all(b"\n").context("write crawl record newline")?;
            log.flush().context("flush crawl log")?;
        }

        tracing::info!(
            pages_saved = summary.pages_saved,
            pages_failed = summary.pages_failed,
            assets_stored = summary.assets_stored,
            assets_reused = summary.assets_reused,
            asset_failures = summary.asset_failures,
            visited = frontier.visited_count(),
            "crawl finished"
        );
        Ok(summary)
    }

    async fn crawl_one(
        &self,
        url: &CanonicalUrl,
        frontier: &mut Frontier,
        summary: &mut CrawlSummary,
    ) -> anyhow::Result<CrawlRecord> {
        let mut record = CrawlRecord {
            url: url.to_string(),
            status: None,
            retrieved_at: chrono::Utc::now().to_rfc3339(),
            saved_path: None,
            assets_stored: 0,
            assets_reused: 0,
            asset_failures: Vec::new(),
            links: Vec::new(),
            error: None,
        };

        let (body, content_type) = match self.fetch_page(url, &mut record).await {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(%url, err = %err, "page fetch failed");
                summary.pages_failed += 1;
                record.error = Some(err.to_string());
                return Ok(record);
            }
        };

        let processed = self
            .processor
            .process(url, &body, content_type.as_deref())
            .await;
        let report = match processed {
            Ok(report) => report,
            Err(err) if err.is_fatal() => {
                return Err(anyhow::Error::new(err).context(format!("mirror page: {url}")));
            }
            Err(err) => {
                tracing::warn!(%url, err = %err, "page skipped");
                summary.pages_failed += 1;
                record.error = Some(err.to_string());
                return Ok(record);
            }
        };

        summary.pages_saved += 1;
        summary.assets_stored += report.assets_stored;
        summary.assets_reused += report.assets_reused;
        summary.asset_failures += report.asset_failures.len();

        let mut queued = 0_usize;
        for link in &report.outbound_links {
            if frontier.push(link.clone()) {
                queued += 1;
            }
        }
        tracing::debug!(%url, found = report.outbound_links.len(), queued, "links processed");

        record.saved_path = report
            .saved_path
            .as_ref()
            .map(|path| path.to_string_lossy().to_string());
        record.assets_stored = report.assets_stored;
        record.assets_reused = report.assets_reused;
        record.asset_failures = AssetFailureRecord::from_failures(&report.asset_failures);
        record.links = report
            .outbound_links
            .iter()
            .map(ToString::to_string)
            .collect();
        Ok(record)
    }

    async fn fetch_page(
        &self,
        url: &CanonicalUrl,
        record: &mut CrawlRecord,
    ) -> Result<(Vec<u8>, Option<String>), PageFetchError> {
        let response = self.session.get(url.as_url()).await?;
        record.status = Some(response.status);

        if !response.is_success() {
            return Err(PageFetchError::Status(response.status));
        }
        // An in-scope page bouncing out of scope usually means the session
        // expired and we landed on a login form. A seed outside the scope is
        // still mirrored so its in-scope links can be followed.
        if self.scope.contains(url.as_url()) && !self.scope.contains(&response.final_url) {
            return Err(PageFetchError::OutOfScope(response.final_url));
        }
        if !response.is_html() {
            return Err(PageFetchError::NotHtml(
                response.content_type.unwrap_or_default(),
            ));
        }

        Ok((response.body, response.content_type))
    }
}

fn seed_directory(seed: &Url) -> String {
    let path = seed.path();
    match path.rfind('/') {
        Some(index) => path[..=index].to_owned(),
        None => "/".to_owned(),
    }
}

pub async fn run(args: CrawlArgs) -> anyhow::Result<()> {
    let seed = Url::parse(&args.url).context("parse --url")?;
    if seed.scheme() != "http" && seed.scheme() != "https" {
        anyhow::bail!("--url must be http/https: {seed}");
    }

    let session_config = SessionConfig::authenticated_from_env().context("load session config")?;
    let session = HttpSession::new(&session_config, Some(&seed)).context("build session")?;

    let mut config = MirrorConfig::new(seed, PathBuf::from(&args.out));
    config.scope_prefix = args.scope_prefix;
    if !args.ignore_query_key.is_empty() {
        config.ignore_query_keys = crate::canonical::IgnoreKeys::new(args.ignore_query_key);
    }
    config.max_pages = args.max_pages;
    config.asset_concurrency = args.asset_concurrency.max(1);
    config.rewrite_links = args.rewrite_links;

    let pipeline = MirrorPipeline::new(config, &session).context("build mirror pipeline")?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current page");
            interrupt.cancel();
        }
    });

    tracing::info!(seed = %pipeline.seed(), "starting crawl");
    pipeline.run(&cancel).await?;
    Ok(())
}
