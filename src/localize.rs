use std::fs::OpenOptions;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use walkdir::WalkDir;

use crate::cli::LocalizeArgs;
use crate::config::{AssetSelection, SessionConfig};
use crate::document::HtmlDocument;
use crate::formats::{AssetFailureRecord, LocalizeRecord};
use crate::mirror_path::PathMapper;
use crate::page::{PageProcessor, persist};
use crate::session::{HttpSession, Session};

pub const LOCALIZE_LOG_FILE: &str = "localize.jsonl";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocalizeSummary {
    pub documents_saved: usize,
    pub documents_failed: usize,
    pub assets_stored: usize,
    pub assets_reused: usize,
    pub asset_failures: usize,
}

/// Re-localizes already-saved HTML files.
///
/// Every `*.html` or `*.htm` file under `input_dir` is written to the same
/// relative location under `out_dir`, with its absolute asset references
/// downloaded into `out_dir/<host>/...` and rewritten to relative paths.
pub async fn localize_tree(
    session: &dyn Session,
    input_dir: &Path,
    out_dir: &Path,
    asset_concurrency: usize,
) -> anyhow::Result<LocalizeSummary> {
    let input_dir = std::path::absolute(input_dir)
        .with_context(|| format!("resolve input dir: {}", input_dir.display()))?;
    if !input_dir.is_dir() {
        anyhow::bail!("input directory does not exist: {}", input_dir.display());
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create output dir: {}", out_dir.display()))?;

    let mapper = PathMapper::new(out_dir).context("build path mapper")?;
    let out_root = mapper.root().to_path_buf();
    let processor = PageProcessor::new(session, mapper)
        .with_asset_selection(AssetSelection::AbsoluteOnly)
        .with_asset_concurrency(asset_concurrency);

    let log_path = out_root.join(LOCALIZE_LOG_FILE);
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open localize log: {}", log_path.display()))?;
    let mut log = BufWriter::new(log_file);

    let mut summary = LocalizeSummary::default();
    for html_path in list_html_files_sorted(&input_dir, &out_root)? {
        let relative = html_path
            .strip_prefix(&input_dir)
            .with_context(|| format!("relativize {}", html_path.display()))?;
        let out_path = out_root.join(relative);
        let record = localize_file(&processor, &html_path, &out_path, &mut summary).await?;

        serde_json::to_writer(&mut log, &record).context("write localize record json")?;
        log.write_all(b"\n").context("write localize record newline")?;
    }
    log.flush().context("flush localize log")?;

    tracing::info!(
        saved = summary.documents_saved,
        failed = summary.documents_failed,
        assets_stored = summary.assets_stored,
        assets_reused = summary.assets_reused,
        asset_failures = summary.asset_failures,
        "localization finished"
    );
    Ok(summary)
}

async fn localize_file(
    processor: &PageProcessor<'_>,
    html_path: &Path,
    out_path: &Path,
    summary: &mut LocalizeSummary,
) -> anyhow::Result<LocalizeRecord> {
    let mut record = LocalizeRecord {
        input_path: html_path.to_string_lossy().to_string(),
        saved_path: None,
        assets_stored: 0,
        assets_reused: 0,
        asset_failures: Vec::new(),
        error: None,
    };

    let html = tokio::fs::read(html_path)
        .await
        .with_context(|| format!("read html: {}", html_path.display()))?;
    let mut doc = match HtmlDocument::from_bytes(&html, None) {
        Ok(doc) => doc,
        Err(err) => {
            tracing::warn!(path = %html_path.display(), err = %err, "document skipped");
            summary.documents_failed += 1;
            record.error = Some(err.to_string());
            return Ok(record);
        }
    };

    if let Some(parent) = out_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }

    let report = processor
        .process_document(None, &mut doc, out_path)
        .await
        .with_context(|| format!("localize {}", html_path.display()))?;
    persist(&doc, out_path)
        .await
        .with_context(|| format!("save localized document: {}", out_path.display()))?;
    tracing::info!(
        input = %html_path.display(),
        path = %out_path.display(),
        stored = report.assets_stored,
        reused = report.assets_reused,
        failed = report.asset_failures.len(),
        "saved offline copy"
    );

    summary.documents_saved += 1;
    summary.assets_stored += report.assets_stored;
    summary.assets_reused += report.assets_reused;
    summary.asset_failures += report.asset_failures.len();

    record.saved_path = Some(out_path.to_string_lossy().to_string());
    record.assets_stored = report.assets_stored;
    record.assets_reused = report.assets_reused;
    record.asset_failures = AssetFailureRecord::from_failures(&report.asset_failures);
    Ok(record)
}

/// `*.html` and `*.htm` files under `dir` in name order, skipping `exclude`
/// (the output tree may live inside the input tree). Symlinks are not
/// followed.
fn list_html_files_sorted(dir: &Path, exclude: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.path() != exclude);
    for entry in walker {
        let entry = entry.with_context(|| format!("walk input dir: {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let extension = entry.path().extension().and_then(|ext| ext.to_str());
        if extension.is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext == "htm") {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

pub async fn run(args: LocalizeArgs) -> anyhow::Result<()> {
    let session_config = SessionConfig::from_env().context("load session config")?;
    // Assets referenced from saved pages are fetched without the session
    // cookie; it belongs to the crawled site, not to third-party hosts.
    let session = HttpSession::new(&session_config, None).context("build session")?;

    localize_tree(
        &session,
        Path::new(&args.input),
        Path::new(&args.out),
        args.asset_concurrency,
    )
    .await?;
    Ok(())
}
