use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use url::Url;

use crate::config::SessionConfig;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("GET {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SessionResponse {
    pub status: u16,
    /// URL after redirects.
    pub final_url: Url,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl SessionResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_html(&self) -> bool {
        match self.content_type.as_deref() {
            Some(content_type) => {
                let content_type = content_type.to_ascii_lowercase();
                content_type.starts_with("text/html")
                    || content_type.starts_with("application/xhtml+xml")
            }
            None => true,
        }
    }
}

/// An already-authenticated session able to issue GET requests.
///
/// Shared read-only across every page and asset fetch of a run.
#[async_trait]
pub trait Session: Send + Sync {
    async fn get(&self, url: &Url) -> Result<SessionResponse, TransportError>;
}

#[async_trait]
impl<S: Session + ?Sized> Session for Arc<S> {
    async fn get(&self, url: &Url) -> Result<SessionResponse, TransportError> {
        (**self).get(url).await
    }
}

/// reqwest-backed session carrying the cookies of an interactive login.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpSession {
    /// Builds a client whose cookie jar is seeded with `config.cookie` for
    /// `cookie_origin`. Without an origin the cookie is not used.
    pub fn new(config: &SessionConfig, cookie_origin: Option<&Url>) -> anyhow::Result<Self> {
        let jar = reqwest::cookie::Jar::default();
        if let (Some(cookie), Some(origin)) = (config.cookie.as_deref(), cookie_origin) {
            for pair in cookie.split(';') {
                let pair = pair.trim();
                if !pair.is_empty() {
                    jar.add_cookie_str(pair, origin);
                }
            }
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_provider(Arc::new(jar))
            .build()
            .context("build session http client")?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn get(&self, url: &Url) -> Result<SessionResponse, TransportError> {
        let to_error = |source| TransportError::Http {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(to_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(to_error)?.to_vec();

        Ok(SessionResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}
