use std::path::PathBuf;

use anyhow::Context as _;
use url::Url;

use crate::canonical::IgnoreKeys;

pub const COOKIE_ENV: &str = "SITEMIRROR_COOKIE";
pub const USER_AGENT_ENV: &str = "SITEMIRROR_USER_AGENT";
pub const TIMEOUT_ENV: &str = "SITEMIRROR_TIMEOUT_SECS";

pub const DEFAULT_USER_AGENT: &str = "sitemirror/0.1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Query keys that never distinguish pages on the site the mirror was first
/// built for.
pub const DEFAULT_IGNORE_QUERY_KEYS: &[&str] =
    &["int", "redirectUrl", "%3Factive_tab_data%3Dfactor-advice"];

/// Settings for the authenticated session, sourced from the environment.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `Cookie` header value captured from an interactive login.
    pub cookie: Option<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SessionConfig::from_env`], but fails when no cookie is set.
    pub fn authenticated_from_env() -> anyhow::Result<Self> {
        let config = Self::from_env()?;
        if config.cookie.is_none() {
            anyhow::bail!(
                "environment variable {COOKIE_ENV} must be set to an authenticated session cookie"
            );
        }
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let cookie = lookup(COOKIE_ENV)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty());
        let user_agent = lookup(USER_AGENT_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned());
        let timeout_secs = match lookup(TIMEOUT_ENV) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("parse {TIMEOUT_ENV}={raw:?}"))?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            cookie,
            user_agent,
            timeout_secs: timeout_secs.max(1),
        })
    }
}

/// How asset references are selected for localization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSelection {
    /// Only absolute or protocol-relative http(s) references.
    AbsoluteOnly,
    /// Every http(s) reference, resolving relative ones against the page URL.
    ResolveRelative,
}

/// Resolved settings for one crawl.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub seed: Url,
    pub out_dir: PathBuf,
    pub scope_prefix: Option<String>,
    pub ignore_query_keys: IgnoreKeys,
    pub max_pages: Option<usize>,
    pub asset_concurrency: usize,
    pub rewrite_links: bool,
}

impl MirrorConfig {
    pub fn new(seed: Url, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            seed,
            out_dir: out_dir.into(),
            scope_prefix: None,
            ignore_query_keys: IgnoreKeys::new(DEFAULT_IGNORE_QUERY_KEYS.iter().copied()),
            max_pages: None,
            asset_concurrency: 4,
            rewrite_links: false,
        }
    }
}
