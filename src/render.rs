//! Page-renderer capability.
//!
//! A [`Renderer`] hands out single-use [`RenderSession`]s. The fetcher opens
//! one per attempt, loads the request target, waits for the listing rows to be
//! ready and reads the rendered markup before closing it again.
//!
//! [`HttpRenderer`] renders the market's client-side paging (`#p<N>_<col>_<dir>`)
//! by asking the market's own render endpoint for the same slice of results.

use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, REFERER};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::fetch::FetchError;

#[async_trait]
pub trait Renderer: Send + Sync {
    type Session: RenderSession;

    async fn open(&self) -> Result<Self::Session, FetchError>;
}

#[async_trait]
pub trait RenderSession: Send {
    async fn load(&mut self, target: &Url) -> Result<(), FetchError>;

    /// Resolves once an element with `row_class` is visible, or the loaded
    /// page is known to hold no results at all.
    async fn wait_until_ready(&mut self, row_class: &str, timeout: Duration)
    -> Result<(), FetchError>;

    fn markup(&self) -> Result<String, FetchError>;

    async fn close(self) -> Result<(), FetchError>;
}

// -------------------------
// HTTP renderer
// -------------------------

#[derive(Debug, Clone)]
pub struct HttpRenderer {
    page_size: u32,
    request_timeout: Duration,
}

impl HttpRenderer {
    pub fn new(page_size: u32, request_timeout: Duration) -> Self {
        Self {
            page_size: page_size.max(1),
            request_timeout,
        }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    type Session = HttpSession;

    async fn open(&self) -> Result<HttpSession, FetchError> {
        // new client per session
        let client = reqwest::Client::builder()
            .user_agent(random_desktop_ua())
            .redirect(reqwest::redirect::Policy::limited(8))
            .timeout(self.request_timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(HttpSession {
            client,
            page_size: self.page_size,
            page: None,
        })
    }
}

pub struct HttpSession {
    client: reqwest::Client,
    page_size: u32,
    page: Option<RenderedPage>,
}

#[derive(Debug)]
struct RenderedPage {
    html: String,
    past_last_result: bool,
}

#[derive(Debug, Deserialize)]
struct RenderPayload {
    success: bool,
    #[serde(default)]
    total_count: Option<u64>,
    #[serde(default)]
    results_html: Option<String>,
}

/// The slice of results a `#p<N>_<col>_<dir>` fragment points at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Paging {
    page: u32,
    sort_column: String,
    sort_dir: String,
}

impl Paging {
    fn from_fragment(fragment: Option<&str>) -> Option<Self> {
        let Some(fragment) = fragment else {
            return Some(Self {
                page: 1,
                sort_column: "default".into(),
                sort_dir: "desc".into(),
            });
        };
        let mut parts = fragment.strip_prefix('p')?.splitn(3, '_');
        let page = parts.next()?.parse::<u32>().ok().filter(|p| *p >= 1)?;
        let sort_column = parts.next().unwrap_or("default").to_string();
        let sort_dir = parts.next().unwrap_or("desc").to_string();
        Some(Self {
            page,
            sort_column,
            sort_dir,
        })
    }

    fn start(&self, page_size: u32) -> u64 {
        u64::from(self.page - 1) * u64::from(page_size)
    }
}

fn render_endpoint(target: &Url, page_size: u32) -> Result<(Url, u64), FetchError> {
    let invalid = |why: &str| FetchError::InvalidTarget(format!("{target}: {why}"));
    let paging = Paging::from_fragment(target.fragment()).ok_or_else(|| invalid("bad paging fragment"))?;

    let mut query = None;
    let mut app_id = None;
    for (k, v) in target.query_pairs() {
        match k.as_ref() {
            "q" => query = Some(v.into_owned()),
            "appid" => app_id = Some(v.into_owned()),
            _ => {}
        }
    }
    let app_id = app_id.ok_or_else(|| invalid("no appid"))?;
    let query = query.unwrap_or_default();

    let mut endpoint = target.join("search/render/").map_err(|e| invalid(&e.to_string()))?;
    let start = paging.start(page_size);
    endpoint
        .query_pairs_mut()
        .clear()
        .append_pair("query", &query)
        .append_pair("start", &start.to_string())
        .append_pair("count", &page_size.to_string())
        .append_pair("search_descriptions", "0")
        .append_pair("sort_column", &paging.sort_column)
        .append_pair("sort_dir", &paging.sort_dir)
        .append_pair("appid", &app_id);
    endpoint.set_fragment(None);
    Ok((endpoint, start))
}

fn decode_payload(url: &str, body: &str, start: u64) -> Result<RenderedPage, FetchError> {
    let payload: RenderPayload = serde_json::from_str(body)?;
    if !payload.success {
        return Err(FetchError::Rejected { url: url.to_string() });
    }
    Ok(RenderedPage {
        html: payload.results_html.unwrap_or_default(),
        // Without a count the end of the results cannot be told apart from a
        // page that has not rendered yet.
        past_last_result: payload.total_count.is_some_and(|total| start >= total),
    })
}

fn has_class(html: &str, class: &str) -> Result<bool, FetchError> {
    let selector = Selector::parse(&format!(".{class}"))
        .map_err(|e| FetchError::Session(format!("bad row class {class:?}: {e}")))?;
    let doc = Html::parse_fragment(html);
    Ok(doc.select(&selector).next().is_some())
}

#[async_trait]
impl RenderSession for HttpSession {
    async fn load(&mut self, target: &Url) -> Result<(), FetchError> {
        let (endpoint, start) = render_endpoint(target, self.page_size)?;
        let mut referer = target.clone();
        referer.set_fragment(None);

        let rsp = self
            .client
            .get(endpoint.as_str())
            .header(ACCEPT, "application/json, text/javascript, */*; q=0.01")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(REFERER, referer.as_str())
            .send()
            .await
            .map_err(|source| FetchError::Navigation {
                url: endpoint.to_string(),
                source,
            })?;

        let status = rsp.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: endpoint.to_string(),
                status,
            });
        }
        let body = rsp.text().await.map_err(|source| FetchError::Navigation {
            url: endpoint.to_string(),
            source,
        })?;
        debug!(url = %endpoint, status = %status, len = body.len(), "render payload received");

        self.page = Some(decode_payload(endpoint.as_str(), &body, start)?);
        Ok(())
    }

    async fn wait_until_ready(
        &mut self,
        row_class: &str,
        _timeout: Duration,
    ) -> Result<(), FetchError> {
        // The render endpoint answers with finished markup, so one look is enough.
        let page = self
            .page
            .as_ref()
            .ok_or_else(|| FetchError::Session("nothing loaded".into()))?;
        if page.past_last_result || has_class(&page.html, row_class)? {
            Ok(())
        } else {
            Err(FetchError::NotReady {
                class: row_class.to_string(),
            })
        }
    }

    fn markup(&self) -> Result<String, FetchError> {
        self.page
            .as_ref()
            .map(|p| p.html.clone())
            .ok_or_else(|| FetchError::Session("nothing loaded".into()))
    }

    async fn close(self) -> Result<(), FetchError> {
        debug!("renderer session closed");
        Ok(())
    }
}

// -------------------------
// Misc helpers
// -------------------------

fn random_desktop_ua() -> String {
    const UAS: &[&str] = &[
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    ];
    let i = rng().random_range(0..UAS.len());
    UAS[i].to_string()
}
