use std::path::{Path, PathBuf};

use sha2::Digest as _;
use url::Url;

use crate::canonical::CanonicalUrl;

const DEFAULT_LEAF: &str = "index";
const MAX_QUERY_SUFFIX_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Page,
    Asset,
}

/// Only `CreateDir` is a disk failure; the others disqualify one URL.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("url must have host: {0}")]
    MissingHost(String),
    #[error("url path must not contain '..': {0}")]
    ParentSegment(String),
    #[error("{} is a file where the mirror needs a directory", .0.display())]
    PathConflict(PathBuf),
    #[error("create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Maps canonical remote URLs onto the local mirror tree.
///
/// Pages land at `<root>/<host>/<dirs>/<leaf>[.<query>].html`, assets at
/// `<root>/<host>/<dirs>/<leaf>`. The mapping is a pure function of the URL,
/// so an existing file at the mapped path doubles as a download cache.
#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
}

impl PathMapper {
    /// `root` is made absolute so relative references can be computed
    /// between any two mapped paths.
    pub fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = std::path::absolute(root.as_ref()).map_err(|err| {
            anyhow::anyhow!("resolve mirror root {}: {err}", root.as_ref().display())
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Computes the local path without touching the filesystem.
    pub fn local_path(&self, url: &CanonicalUrl, kind: ResourceKind) -> Result<PathBuf, MapError> {
        let url = url.as_url();
        let (mut path, leaf) = self.directory_and_leaf(url)?;
        let file_name = match kind {
            ResourceKind::Asset => leaf.unwrap_or(DEFAULT_LEAF).to_owned(),
            ResourceKind::Page => page_file_name(leaf, url.query()),
        };
        path.push(file_name);
        Ok(path)
    }

    /// Computes the local path and creates its parent directories.
    pub async fn map_to_local_path(
        &self,
        url: &CanonicalUrl,
        kind: ResourceKind,
    ) -> Result<PathBuf, MapError> {
        let path = self.local_path(url, kind)?;
        if let Some(parent) = path.parent()
            && let Err(source) = tokio::fs::create_dir_all(parent).await
        {
            if let Some(file) = self.file_in_the_way(parent).await {
                return Err(MapError::PathConflict(file));
            }
            return Err(MapError::CreateDir {
                path: parent.to_path_buf(),
                source,
            });
        }
        Ok(path)
    }

    /// First non-directory among `dir` and its ancestors inside the root.
    async fn file_in_the_way(&self, dir: &Path) -> Option<PathBuf> {
        for ancestor in dir.ancestors() {
            if !ancestor.starts_with(&self.root) || ancestor == self.root {
                break;
            }
            if let Ok(metadata) = tokio::fs::metadata(ancestor).await
                && !metadata.is_dir()
            {
                return Some(ancestor.to_path_buf());
            }
        }
        None
    }

    fn directory_and_leaf<'u>(&self, url: &'u Url) -> Result<(PathBuf, Option<&'u str>), MapError> {
        let host = url
            .host_str()
            .ok_or_else(|| MapError::MissingHost(url.to_string()))?;
        let host_segment = match url.port() {
            Some(port) => format!("{host}_{port}"),
            None => host.to_owned(),
        };

        let raw_path = url.path();
        let mut segments = Vec::new();
        for segment in raw_path.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                return Err(MapError::ParentSegment(url.to_string()));
            }
            segments.push(segment);
        }

        // A trailing slash names a directory; its page is the default leaf.
        let leaf = if raw_path.ends_with('/') {
            None
        } else {
            segments.pop()
        };

        let mut dir = self.root.join(host_segment);
        for segment in segments {
            dir.push(segment);
        }
        Ok((dir, leaf))
    }
}

fn page_file_name(leaf: Option<&str>, query: Option<&str>) -> String {
    let leaf = leaf.unwrap_or(DEFAULT_LEAF);
    let (stem, extension) = if let Some(stem) = leaf.strip_suffix(".html") {
        (stem, "html")
    } else if let Some(stem) = leaf.strip_suffix(".htm") {
        (stem, "htm")
    } else {
        (leaf, "html")
    };

    match query.filter(|query| !query.is_empty()) {
        Some(query) => format!("{stem}.{}.{extension}", query_suffix(query)),
        None => format!("{stem}.{extension}"),
    }
}

fn query_suffix(query: &str) -> String {
    let suffix = query.replace('/', "_");
    if suffix.len() <= MAX_QUERY_SUFFIX_LEN {
        return suffix;
    }
    let digest = sha2::Sha256::digest(query.as_bytes());
    format!("q-{}", &hex::encode(digest)[..16])
}

/// Reference from the document at `document` to the file at `target`,
/// relative to the document's own directory and percent-encoded for use in
/// an attribute value. Both paths must be absolute.
pub fn relative_reference(document: &Path, target: &Path) -> Option<String> {
    let document = Url::from_file_path(document).ok()?;
    let target = Url::from_file_path(target).ok()?;
    document.make_relative(&target)
}

/// Writes `bytes` to a sibling temp file and renames it over `path`, so a
/// reader never observes a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    if let Err(err) = tokio::fs::write(&tmp_path, bytes).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    tokio::fs::rename(&tmp_path, path).await
}
