use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::StatusCode;
use robotstxt::DefaultMatcher;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::extract::LISTING_ROW_CLASS;
use crate::render::{RenderSession, Renderer};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not start renderer session: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Navigation {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: StatusCode },
    #[error("render payload could not be decoded: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("renderer reported failure for {url}")]
    Rejected { url: String },
    #[error("no `.{class}` element became visible")]
    NotReady { class: String },
    #[error("timed out after {0:?} waiting for listings")]
    Timeout(Duration),
    #[error("renderer session error: {0}")]
    Session(String),
    #[error("invalid request target: {0}")]
    InvalidTarget(String),
    #[error("robots.txt disallows {0}")]
    RobotsDisallowed(String),
    #[error("gave up on page {page} after {attempts} attempts: {last}")]
    Exhausted {
        page: u32,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt with a fresh session may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::InvalidTarget(_)
            | FetchError::RobotsDisallowed(_)
            | FetchError::Exhausted { .. } => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub base_url: Url,
    pub app_id: u32,
    pub query: String,
    pub render_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

/// `<base>search?appid=<id>&q=<query>#p<page>_default_desc`
pub fn request_target(base: &Url, app_id: u32, query: &str, page: u32) -> Result<Url, FetchError> {
    let mut url = base
        .join("search")
        .map_err(|e| FetchError::InvalidTarget(format!("{base}: {e}")))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("appid", &app_id.to_string())
        .append_pair("q", query);
    url.set_fragment(Some(&format!("p{page}_default_desc")));
    Ok(url)
}

/// Where the controller gets rendered markup from.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, page: u32) -> Result<String, FetchError>;
}

// -------------------------
// Fetcher (fresh session per attempt)
// -------------------------

pub struct Fetcher<R> {
    renderer: R,
    settings: FetchSettings,
}

impl<R: Renderer> Fetcher<R> {
    pub fn new(renderer: R, settings: FetchSettings) -> Self {
        Self { renderer, settings }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    async fn attempt(&self, target: &Url) -> Result<String, FetchError> {
        let mut session = self.renderer.open().await?;
        let outcome = self.drive(&mut session, target).await;
        if let Err(e) = session.close().await {
            warn!(error = %e, "renderer session did not close cleanly");
        }
        outcome
    }

    async fn drive(&self, session: &mut R::Session, target: &Url) -> Result<String, FetchError> {
        session.load(target).await?;
        let wait = self.settings.render_timeout;
        timeout(wait, session.wait_until_ready(LISTING_ROW_CLASS, wait))
            .await
            .map_err(|_| FetchError::Timeout(wait))??;
        session.markup()
    }
}

#[async_trait]
impl<R: Renderer> PageSource for Fetcher<R> {
    async fn fetch(&self, page: u32) -> Result<String, FetchError> {
        let s = &self.settings;
        let target = request_target(&s.base_url, s.app_id, &s.query, page)?;
        let max_attempts = s.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(page, attempt, max_attempts, url = %target, "attempting to scrape page");

            match self.attempt(&target).await {
                Ok(markup) => {
                    debug!(page, len = markup.len(), "page rendered");
                    return Ok(markup);
                }
                Err(e) if !e.is_retryable() => {
                    error!(page, error = %e, "page cannot be fetched");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    error!(page, attempt, error = %e, "max attempts reached");
                    return Err(FetchError::Exhausted {
                        page,
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(page, attempt, max_attempts, error = %e, "unable to load page, trying again");
                    backoff(s.retry_backoff).await;
                }
            }
        }
    }
}

async fn backoff(base: Duration) {
    if base.is_zero() {
        return;
    }
    let base_ms = base.as_millis() as u64;
    let jitter = rng().random_range(0..=base_ms);
    sleep(Duration::from_millis(base_ms + jitter)).await;
}

// -------------------------
// robots.txt preflight
// -------------------------

/// Checks `target` against its host's robots.txt. An unreachable robots.txt
/// allows everything.
pub async fn check_robots(target: &Url, user_agent: &str) -> Result<(), FetchError> {
    let host = target
        .host_str()
        .ok_or_else(|| FetchError::InvalidTarget(format!("{target} has no host")))?;
    let robots_url = format!("{}://{}/robots.txt", target.scheme(), host);
    let robots_txt = match reqwest::get(&robots_url).await {
        Ok(rsp) if rsp.status().is_success() => rsp.text().await.unwrap_or_default(),
        Ok(rsp) => {
            debug!(status = %rsp.status(), "no robots.txt, assuming allowed");
            String::new()
        }
        Err(e) => {
            warn!(error = %e, "robots.txt unreachable, assuming allowed");
            String::new()
        }
    };

    if robots_allow(&robots_txt, user_agent, target) {
        Ok(())
    } else {
        Err(FetchError::RobotsDisallowed(target.to_string()))
    }
}

fn robots_allow(robots_txt: &str, user_agent: &str, target: &Url) -> bool {
    let mut matcher = DefaultMatcher::default();
    matcher.one_agent_allowed_by_robots(robots_txt, user_agent, target.as_str())
}
