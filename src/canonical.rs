//! URL canonicalization.
//!
//! A [`CanonicalUrl`] is the dedup key for everything the mirror touches: the
//! frontier's queue and visited set, and the input to the path mapper.

use std::collections::BTreeSet;
use std::fmt;

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum CanonicalizeError {
    #[error("parse url {input:?}: {source}")]
    Parse {
        input: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported url scheme {scheme:?}: {url}")]
    UnsupportedScheme { scheme: String, url: String },
    #[error("url must have host: {0}")]
    MissingHost(String),
}

/// Query keys dropped from the canonical form.
///
/// Keys are opaque strings. A query pair is dropped when either its raw
/// (still percent-encoded) key or its decoded key is in the set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreKeys(BTreeSet<String>);

impl IgnoreKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }
}

/// Normalized, fragment-free, filtered-query http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalUrl(Url);

impl CanonicalUrl {
    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

/// Resolves `input` against `base` and reduces it to its canonical form.
///
/// Relative and protocol-relative inputs are joined onto `base`. The fragment
/// is removed, ignored query keys are dropped and the remaining pairs are
/// re-serialized sorted by key, then value.
pub fn canonicalize(
    input: &str,
    base: &Url,
    ignore: &IgnoreKeys,
) -> Result<CanonicalUrl, CanonicalizeError> {
    let trimmed = input.trim();
    let mut url = base
        .join(trimmed)
        .map_err(|source| CanonicalizeError::Parse {
            input: trimmed.to_owned(),
            source,
        })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CanonicalizeError::UnsupportedScheme {
            scheme: url.scheme().to_owned(),
            url: url.to_string(),
        });
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(CanonicalizeError::MissingHost(url.to_string()));
    }

    url.set_fragment(None);
    let query = url.query().map(|query| filtered_query(query, ignore));
    match query {
        Some(query) if !query.is_empty() => url.set_query(Some(&query)),
        _ => url.set_query(None),
    }

    Ok(CanonicalUrl(url))
}

/// Parses an absolute URL with no base.
pub fn canonicalize_absolute(
    input: &str,
    ignore: &IgnoreKeys,
) -> Result<CanonicalUrl, CanonicalizeError> {
    let url = Url::parse(input.trim()).map_err(|source| CanonicalizeError::Parse {
        input: input.trim().to_owned(),
        source,
    })?;
    canonicalize(url.as_str(), &url, ignore)
}

fn filtered_query(query: &str, ignore: &IgnoreKeys) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for segment in query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let raw_key = segment.split('=').next().unwrap_or_default();
        if ignore.contains(raw_key) {
            continue;
        }
        let Some((key, value)) = url::form_urlencoded::parse(segment.as_bytes()).next() else {
            continue;
        };
        if ignore.contains(&key) {
            continue;
        }
        pairs.push((key.into_owned(), value.into_owned()));
    }
    pairs.sort();

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}
