use std::path::Path;

use url::Url;

use crate::mirror_path::write_atomic;
use crate::session::{Session, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Downloaded and written.
    Stored,
    /// A file already existed at the local path; no request was made.
    AlreadyPresent,
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("GET {url}: unexpected status {status}")]
    Status { url: String, status: u16 },
    #[error("{} already exists and is not a file", .0.display())]
    NotAFile(std::path::PathBuf),
    #[error("write asset {}: {source}", path.display())]
    Filesystem {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AssetError {
    /// Filesystem failures end the run; network failures only cost one
    /// reference.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Filesystem { .. })
    }
}

/// Downloads single resources into the mirror.
///
/// Never retries. An existing file at the target path is taken as already
/// localized.
pub struct AssetFetcher<'s> {
    session: &'s dyn Session,
}

impl<'s> AssetFetcher<'s> {
    pub fn new(session: &'s dyn Session) -> Self {
        Self { session }
    }

    pub async fn fetch(&self, url: &Url, local_path: &Path) -> Result<FetchOutcome, AssetError> {
        match tokio::fs::metadata(local_path).await {
            Ok(metadata) if metadata.is_file() => {
                tracing::debug!(%url, path = %local_path.display(), "asset already present");
                return Ok(FetchOutcome::AlreadyPresent);
            }
            // Another URL's files live under this path.
            Ok(_) => return Err(AssetError::NotAFile(local_path.to_path_buf())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(AssetError::Filesystem {
                    path: local_path.to_path_buf(),
                    source,
                });
            }
        }

        let response = self.session.get(url).await?;
        if !response.is_success() {
            return Err(AssetError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }

        write_atomic(local_path, &response.body)
            .await
            .map_err(|source| AssetError::Filesystem {
                path: local_path.to_path_buf(),
                source,
            })?;
        tracing::debug!(
            %url,
            path = %local_path.display(),
            bytes = response.body.len(),
            "asset stored"
        );
        Ok(FetchOutcome::Stored)
    }
}
