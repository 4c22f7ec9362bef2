use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use futures_util::StreamExt as _;
use futures_util::stream;
use url::Url;

use crate::canonical::{CanonicalUrl, IgnoreKeys, canonicalize, canonicalize_absolute};
use crate::config::AssetSelection;
use crate::document::{DocumentError, HtmlDocument, MarkupDocument, Reference, ReferenceId};
use crate::fetcher::{AssetError, AssetFetcher, FetchOutcome};
use crate::mirror_path::{MapError, PathMapper, ResourceKind, relative_reference, write_atomic};
use crate::scope::CrawlScope;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("parse page: {0}")]
    Parse(#[from] DocumentError),
    #[error("map page path: {0}")]
    InvalidPath(MapError),
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PageError {
    /// Only filesystem failures stop the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Filesystem { .. })
    }
}

impl From<MapError> for PageError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::CreateDir { path, source } => Self::Filesystem { path, source },
            other => Self::InvalidPath(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocalizeError {
    #[error(transparent)]
    Fetch(#[from] AssetError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("no relative path from {} to {}", document.display(), target.display())]
    Unrelatable { document: PathBuf, target: PathBuf },
}

impl LocalizeError {
    fn into_fatal(self) -> Result<Self, PageError> {
        match self {
            Self::Fetch(AssetError::Filesystem { path, source })
            | Self::Map(MapError::CreateDir { path, source }) => {
                Err(PageError::Filesystem { path, source })
            }
            other => Ok(other),
        }
    }
}

/// An asset reference left pointing at its remote URL.
#[derive(Debug)]
pub struct AssetFailure {
    pub url: Url,
    pub error: LocalizeError,
}

#[derive(Debug, Default)]
pub struct PageReport {
    pub saved_path: Option<PathBuf>,
    /// In-scope canonical links, in document order, without repeats.
    pub outbound_links: Vec<CanonicalUrl>,
    pub assets_stored: usize,
    pub assets_reused: usize,
    pub asset_failures: Vec<AssetFailure>,
}

struct AssetJob {
    url: CanonicalUrl,
    ids: Vec<ReferenceId>,
}

struct LinkRules {
    scope: CrawlScope,
    ignore: IgnoreKeys,
    rewrite: bool,
}

/// Localizes the assets of one document, collects its outbound links and
/// persists the rewritten markup.
pub struct PageProcessor<'s> {
    mapper: PathMapper,
    fetcher: AssetFetcher<'s>,
    selection: AssetSelection,
    asset_concurrency: usize,
    links: Option<LinkRules>,
}

impl<'s> PageProcessor<'s> {
    pub fn new(session: &'s dyn Session, mapper: PathMapper) -> Self {
        Self {
            mapper,
            fetcher: AssetFetcher::new(session),
            selection: AssetSelection::AbsoluteOnly,
            asset_concurrency: 1,
            links: None,
        }
    }

    /// Enables link extraction: anchors in `scope` become outbound links.
    pub fn with_links(mut self, scope: CrawlScope, ignore: IgnoreKeys, rewrite: bool) -> Self {
        self.links = Some(LinkRules {
            scope,
            ignore,
            rewrite,
        });
        self
    }

    pub fn with_asset_selection(mut self, selection: AssetSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_asset_concurrency(mut self, concurrency: usize) -> Self {
        self.asset_concurrency = concurrency.max(1);
        self
    }

    /// Processes a fetched page and saves it at its Page-kind local path.
    ///
    /// `body` is decoded with the charset from `content_type` or the markup
    /// itself, and saved back in that charset.
    pub async fn process(
        &self,
        page_url: &CanonicalUrl,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<PageReport, PageError> {
        let mut doc = HtmlDocument::from_bytes(body, content_type)?;
        let saved_path = self
            .mapper
            .map_to_local_path(page_url, ResourceKind::Page)
            .await?;

        let mut report = self
            .process_document(Some(page_url), &mut doc, &saved_path)
            .await?;
        persist(&doc, &saved_path).await?;
        tracing::info!(
            url = %page_url,
            path = %saved_path.display(),
            stored = report.assets_stored,
            reused = report.assets_reused,
            failed = report.asset_failures.len(),
            "saved page"
        );
        report.saved_path = Some(saved_path);
        Ok(report)
    }

    /// Rewrites `doc` as if it were saved at `doc_path`, without saving it.
    ///
    /// `page_url` is the document's remote location, when known; relative
    /// references and links can only be resolved with it.
    pub async fn process_document<D>(
        &self,
        page_url: Option<&CanonicalUrl>,
        doc: &mut D,
        doc_path: &Path,
    ) -> Result<PageReport, PageError>
    where
        D: MarkupDocument + ?Sized,
    {
        let references = doc.references();
        let mut report = PageReport::default();

        self.localize_assets(page_url, &references, doc, doc_path, &mut report)
            .await?;
        if let Some(page_url) = page_url {
            self.collect_links(page_url, &references, doc, doc_path, &mut report);
        }

        Ok(report)
    }

    async fn localize_assets<D>(
        &self,
        page_url: Option<&CanonicalUrl>,
        references: &[Reference],
        doc: &mut D,
        doc_path: &Path,
        report: &mut PageReport,
    ) -> Result<(), PageError>
    where
        D: MarkupDocument + ?Sized,
    {
        let mut jobs: Vec<AssetJob> = Vec::new();
        let mut job_index: HashMap<CanonicalUrl, usize> = HashMap::new();
        for reference in references.iter().filter(|r| r.kind.is_asset()) {
            let Some(url) = self.asset_url(page_url, &reference.value) else {
                continue;
            };
            match job_index.get(&url) {
                Some(&index) => jobs[index].ids.push(reference.id),
                None => {
                    job_index.insert(url.clone(), jobs.len());
                    jobs.push(AssetJob {
                        url,
                        ids: vec![reference.id],
                    });
                }
            }
        }

        let results = stream::iter(&jobs)
            .map(|job| self.localize_asset(&job.url, doc_path))
            .buffered(self.asset_concurrency)
            .collect::<Vec<_>>()
            .await;

        for (job, result) in jobs.iter().zip(results) {
            match result {
                Ok((outcome, reference)) => {
                    match outcome {
                        FetchOutcome::Stored => report.assets_stored += 1,
                        FetchOutcome::AlreadyPresent => report.assets_reused += 1,
                    }
                    for id in &job.ids {
                        doc.rewrite(*id, reference.clone());
                    }
                }
                Err(err) => {
                    let err = err.into_fatal()?;
                    tracing::warn!(url = %job.url, err = %err, "asset not localized");
                    report.asset_failures.push(AssetFailure {
                        url: job.url.as_url().clone(),
                        error: err,
                    });
                }
            }
        }

        Ok(())
    }

    async fn localize_asset(
        &self,
        url: &CanonicalUrl,
        doc_path: &Path,
    ) -> Result<(FetchOutcome, String), LocalizeError> {
        let local_path = self
            .mapper
            .map_to_local_path(url, ResourceKind::Asset)
            .await?;
        let outcome = self.fetcher.fetch(url.as_url(), &local_path).await?;
        let reference =
            relative_reference(doc_path, &local_path).ok_or_else(|| LocalizeError::Unrelatable {
                document: doc_path.to_path_buf(),
                target: local_path.clone(),
            })?;
        Ok((outcome, reference))
    }

    fn asset_url(&self, page_url: Option<&CanonicalUrl>, value: &str) -> Option<CanonicalUrl> {
        let value = value.trim();
        if value.is_empty() || value.starts_with('#') {
            return None;
        }
        let no_keys = IgnoreKeys::default();
        let lowered = value.to_ascii_lowercase();
        let absolute = lowered.starts_with("http://") || lowered.starts_with("https://");
        let protocol_relative = value.starts_with("//");

        let resolved = match (page_url, self.selection) {
            (Some(page_url), AssetSelection::ResolveRelative) => {
                canonicalize(value, page_url.as_url(), &no_keys)
            }
            (Some(page_url), AssetSelection::AbsoluteOnly) if absolute || protocol_relative => {
                canonicalize(value, page_url.as_url(), &no_keys)
            }
            (None, _) if absolute => canonicalize_absolute(value, &no_keys),
            (None, _) if protocol_relative => {
                canonicalize_absolute(&format!("https:{value}"), &no_keys)
            }
            _ => return None,
        };

        match resolved {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::debug!(reference = value, ?err, "skipping asset reference");
                None
            }
        }
    }

    fn collect_links<D>(
        &self,
        page_url: &CanonicalUrl,
        references: &[Reference],
        doc: &mut D,
        doc_path: &Path,
        report: &mut PageReport,
    ) where
        D: MarkupDocument + ?Sized,
    {
        let Some(rules) = self.links.as_ref() else {
            return;
        };

        let mut seen: HashSet<CanonicalUrl> = HashSet::new();
        for reference in references.iter().filter(|r| !r.kind.is_asset()) {
            let link = match canonicalize(&reference.value, page_url.as_url(), &rules.ignore) {
                Ok(link) => link,
                Err(err) => {
                    tracing::debug!(reference = %reference.value, ?err, "dropping link");
                    continue;
                }
            };
            if !rules.scope.contains(link.as_url()) {
                continue;
            }

            if rules.rewrite
                && let Some(local) = self.local_link(page_url, &reference.value, &link, doc_path)
            {
                doc.rewrite(reference.id, local);
            }

            if seen.insert(link.clone()) {
                report.outbound_links.push(link);
            }
        }
    }

    fn local_link(
        &self,
        page_url: &CanonicalUrl,
        value: &str,
        link: &CanonicalUrl,
        doc_path: &Path,
    ) -> Option<String> {
        let target = self.mapper.local_path(link, ResourceKind::Page).ok()?;
        let mut local = relative_reference(doc_path, &target)?;
        if let Some(fragment) = page_url
            .as_url()
            .join(value.trim())
            .ok()
            .and_then(|url| url.fragment().map(str::to_owned))
        {
            local.push('#');
            local.push_str(&fragment);
        }
        Some(local)
    }
}

/// Serializes `doc` and writes it to `path`, replacing any previous copy.
pub async fn persist<D>(doc: &D, path: &Path) -> Result<(), PageError>
where
    D: MarkupDocument + ?Sized,
{
    let bytes = doc.to_bytes()?;
    write_atomic(path, &bytes)
        .await
        .map_err(|source| PageError::Filesystem {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::document::ReferenceKind;
    use crate::session::{SessionResponse, TransportError};

    #[derive(Default)]
    struct FakeSession {
        failing: HashSet<String>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn get(&self, url: &Url) -> Result<SessionResponse, TransportError> {
            self.requests.lock().unwrap().push(url.to_string());
            let status = if self.failing.contains(url.as_str()) {
                503
            } else {
                200
            };
            Ok(SessionResponse {
                status,
                final_url: url.clone(),
                content_type: None,
                body: format!("body of {url}").into_bytes(),
            })
        }
    }

    /// Document stand-in exposing a fixed reference list.
    struct FakeDocument {
        references: Vec<Reference>,
        rewrites: HashMap<ReferenceId, String>,
    }

    impl FakeDocument {
        fn new(items: &[(ReferenceKind, &str)]) -> Self {
            let references = items
                .iter()
                .enumerate()
                .map(|(i, (kind, value))| Reference {
                    id: ReferenceId(i),
                    kind: *kind,
                    value: (*value).to_owned(),
                })
                .collect();
            Self {
                references,
                rewrites: HashMap::new(),
            }
        }
    }

    impl MarkupDocument for FakeDocument {
        fn references(&self) -> Vec<Reference> {
            self.references.clone()
        }

        fn rewrite(&mut self, id: ReferenceId, value: String) {
            self.rewrites.insert(id, value);
        }

        fn serialize(&self) -> Result<String, DocumentError> {
            Ok(self
                .references
                .iter()
                .map(|r| self.rewrites.get(&r.id).unwrap_or(&r.value).clone())
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }

    fn page_url() -> CanonicalUrl {
        canonicalize_absolute("https://example.com/my/home", &IgnoreKeys::default()).unwrap()
    }

    fn scope() -> CrawlScope {
        CrawlScope::new(page_url().as_url(), Some("/my")).unwrap()
    }

    #[tokio::test]
    async fn failed_asset_keeps_remote_url_and_page_is_saved() {
        let temp = tempfile::TempDir::new().unwrap();
        let session = FakeSession {
            failing: HashSet::from(["https://cdn.example.com/js/broken.js".to_owned()]),
            ..FakeSession::default()
        };
        let processor = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap());

        let html = r#"<!doctype html><html><head>
<link rel="stylesheet" href="https://cdn.example.com/css/site.css">
<script src="https://cdn.example.com/js/broken.js"></script>
</head><body><img src="https://cdn.example.com/x/logo.png"></body></html>"#;
        let report = processor.process(&page_url(), html.as_bytes(), None).await.unwrap();

        let saved_path = report.saved_path.clone().unwrap();
        assert_eq!(saved_path, temp.path().join("example.com/my/home.html"));
        let saved = std::fs::read_to_string(&saved_path).unwrap();
        assert!(saved.contains(r#"href="../../cdn.example.com/css/site.css""#));
        assert!(saved.contains(r#"src="../../cdn.example.com/x/logo.png""#));
        assert!(saved.contains(r#"src="https://cdn.example.com/js/broken.js""#));

        assert_eq!(report.assets_stored, 2);
        assert_eq!(report.asset_failures.len(), 1);
        assert_eq!(
            report.asset_failures[0].url.as_str(),
            "https://cdn.example.com/js/broken.js"
        );
        assert!(temp.path().join("cdn.example.com/x/logo.png").is_file());
    }

    #[tokio::test]
    async fn repeated_asset_is_fetched_once_and_every_reference_rewritten() {
        let temp = tempfile::TempDir::new().unwrap();
        let session = FakeSession::default();
        let processor = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap())
            .with_asset_concurrency(4);
        let doc_path = temp.path().join("example.com/my/home.html");
        let mut doc = FakeDocument::new(&[
            (ReferenceKind::Image, "https://cdn.example.com/x/logo.png"),
            (ReferenceKind::Image, "https://cdn.example.com/x/logo.png#frag"),
            (ReferenceKind::Image, "data:image/png;base64,AAAA"),
        ]);

        let report = processor
            .process_document(Some(&page_url()), &mut doc, &doc_path)
            .await
            .unwrap();

        assert_eq!(session.requests.lock().unwrap().len(), 1);
        assert_eq!(report.assets_stored, 1);
        let out = doc.serialize().unwrap();
        assert_eq!(
            out,
            "../../cdn.example.com/x/logo.png\n../../cdn.example.com/x/logo.png\ndata:image/png;base64,AAAA"
        );
    }

    #[tokio::test]
    async fn asset_file_blocking_a_directory_fails_only_that_reference() {
        let temp = tempfile::TempDir::new().unwrap();
        let session = FakeSession::default();
        let processor = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap());
        let doc_path = temp.path().join("example.com/my/home.html");
        let mut doc = FakeDocument::new(&[
            (ReferenceKind::Image, "https://cdn.test/avatar/1"),
            (ReferenceKind::Image, "https://cdn.test/avatar/1/large.png"),
        ]);

        let report = processor
            .process_document(Some(&page_url()), &mut doc, &doc_path)
            .await
            .unwrap();

        assert_eq!(report.assets_stored, 1);
        assert_eq!(report.asset_failures.len(), 1);
        assert!(matches!(
            report.asset_failures[0].error,
            LocalizeError::Map(MapError::PathConflict(_))
        ));
        assert_eq!(
            doc.serialize().unwrap(),
            "../../cdn.test/avatar/1\nhttps://cdn.test/avatar/1/large.png"
        );
    }

    #[tokio::test]
    async fn asset_directory_at_a_file_path_is_not_referenced() {
        let temp = tempfile::TempDir::new().unwrap();
        let session = FakeSession::default();
        let processor = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap());
        let doc_path = temp.path().join("example.com/my/home.html");
        let mut doc = FakeDocument::new(&[
            (ReferenceKind::Image, "https://cdn.test/avatar/1/large.png"),
            (ReferenceKind::Image, "https://cdn.test/avatar/1"),
        ]);

        let report = processor
            .process_document(Some(&page_url()), &mut doc, &doc_path)
            .await
            .unwrap();

        assert_eq!(report.assets_stored, 1);
        assert_eq!(report.assets_reused, 0);
        assert!(matches!(
            report.asset_failures[0].error,
            LocalizeError::Fetch(AssetError::NotAFile(_))
        ));
        assert_eq!(
            doc.serialize().unwrap(),
            "../../cdn.test/avatar/1/large.png\nhttps://cdn.test/avatar/1"
        );
        assert_eq!(session.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn relative_assets_follow_selection() {
        let temp = tempfile::TempDir::new().unwrap();
        let session = FakeSession::default();
        let doc_path = temp.path().join("example.com/my/home.html");

        let absolute_only = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap());
        let mut doc = FakeDocument::new(&[(ReferenceKind::Script, "/js/app.js")]);
        let report = absolute_only
            .process_document(Some(&page_url()), &mut doc, &doc_path)
            .await
            .unwrap();
        assert_eq!(report.assets_stored, 0);
        assert_eq!(doc.serialize().unwrap(), "/js/app.js");

        let resolving = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap())
            .with_asset_selection(AssetSelection::ResolveRelative);
        let mut doc = FakeDocument::new(&[(ReferenceKind::Script, "/js/app.js")]);
        let report = resolving
            .process_document(Some(&page_url()), &mut doc, &doc_path)
            .await
            .unwrap();
        assert_eq!(report.assets_stored, 1);
        assert_eq!(doc.serialize().unwrap(), "../js/app.js");
    }

    #[tokio::test]
    async fn links_are_canonicalized_and_scope_filtered() {
        let temp = tempfile::TempDir::new().unwrap();
        let session = FakeSession::default();
        let processor = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap())
            .with_links(scope(), IgnoreKeys::new(["int"]), false);
        let doc_path = temp.path().join("example.com/my/home.html");
        let mut doc = FakeDocument::new(&[
            (ReferenceKind::Anchor, "https://example.com/my/next?int=9"),
            (ReferenceKind::Anchor, "next#section"),
            (ReferenceKind::Anchor, "/other/page"),
            (ReferenceKind::Anchor, "mailto:someone@example.com"),
            (ReferenceKind::Anchor, "https://elsewhere.test/my/page"),
            (ReferenceKind::Anchor, "/my/list?b=2&a=1"),
        ]);

        let report = processor
            .process_document(Some(&page_url()), &mut doc, &doc_path)
            .await
            .unwrap();

        let links = report
            .outbound_links
            .iter()
            .map(|u| u.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            links,
            vec![
                "https://example.com/my/next",
                "https://example.com/my/list?a=1&b=2",
            ]
        );
        assert!(session.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn link_rewriting_points_at_mirrored_pages() {
        let temp = tempfile::TempDir::new().unwrap();
        let session = FakeSession::default();
        let processor = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap())
            .with_links(scope(), IgnoreKeys::new(["int"]), true);
        let doc_path = temp.path().join("example.com/my/home.html");
        let mut doc = FakeDocument::new(&[
            (ReferenceKind::Anchor, "next?int=9#top"),
            (ReferenceKind::Anchor, "/other/page"),
        ]);

        processor
            .process_document(Some(&page_url()), &mut doc, &doc_path)
            .await
            .unwrap();

        assert_eq!(doc.serialize().unwrap(), "next.html#top\n/other/page");
    }

    #[tokio::test]
    async fn unparseable_page_is_a_non_fatal_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let session = FakeSession::default();
        let processor = PageProcessor::new(&session, PathMapper::new(temp.path()).unwrap());

        let err = processor.process(&page_url(), b"", None).await.unwrap_err();
        assert!(matches!(err, PageError::Parse(DocumentError::NotHtml)));
        assert!(!err.is_fatal());
        assert!(!temp.path().join("example.com").exists());
    }
}
