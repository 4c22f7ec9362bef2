use url::{Origin, Url};

/// Decides whether a discovered link is eligible for crawling.
///
/// A link is in scope when it shares the seed's origin and its path sits
/// under `path_prefix` (segment-wise: `/my` admits `/my` and `/my/next` but
/// not `/mystery`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlScope {
    origin: Origin,
    /// Prefix without its trailing slash; empty admits every path.
    path_prefix: String,
}

impl CrawlScope {
    pub fn new(seed: &Url, path_prefix: Option<&str>) -> anyhow::Result<Self> {
        if seed.host_str().is_none() {
            anyhow::bail!("seed url must have host: {seed}");
        }
        let path_prefix = path_prefix
            .unwrap_or_default()
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(String::new(), |mut prefix, segment| {
                prefix.push('/');
                prefix.push_str(segment);
                prefix
            });

        Ok(Self {
            origin: seed.origin(),
            path_prefix,
        })
    }

    pub fn path_prefix(&self) -> &str {
        if self.path_prefix.is_empty() {
            "/"
        } else {
            &self.path_prefix
        }
    }

    pub fn contains(&self, url: &Url) -> bool {
        if url.origin() != self.origin {
            return false;
        }
        match url.path().strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}
