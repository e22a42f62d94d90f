use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use knife_market::controller::{Controller, ControllerSettings, RunExit};
use knife_market::extract::ListingSelectors;
use knife_market::fetch::{FetchError, FetchSettings, Fetcher, PageSource};
use knife_market::render::{RenderSession, Renderer};
use knife_market::store::{ListingStore, SqliteStore};

// -------------------------
// Fixtures
// -------------------------

fn row(title: &str, price: &str, qty: &str) -> String {
    format!(
        r#"<a class="market_listing_row_link" href="https://example.test/l">
             <div class="market_listing_row">
               <span class="market_listing_num_listings_qty" data-qty="{qty}">{qty}</span>
               <span class="normal_price">Starting at:
                 <span class="normal_price" data-price="0">{price}</span></span>
               <span class="market_listing_item_name">{title}</span>
             </div>
           </a>"#
    )
}

fn page(rows: &[String]) -> String {
    format!("<div id=\"searchResultsRows\">{}</div>", rows.concat())
}

fn empty_page() -> String {
    r#"<div class="market_listing_table_message">There were no items matching your search.</div>"#
        .to_string()
}

fn quick_settings() -> ControllerSettings {
    ControllerSettings {
        start_page: 1,
        max_pages: None,
        page_delay: Duration::ZERO,
    }
}

fn fetch_settings(max_attempts: u32) -> FetchSettings {
    FetchSettings {
        base_url: Url::parse("https://steamcommunity.com/market/").unwrap(),
        app_id: 730,
        query: "knife".into(),
        render_timeout: Duration::from_millis(50),
        max_attempts,
        retry_backoff: Duration::ZERO,
    }
}

fn controller<P: PageSource>(
    source: P,
    settings: ControllerSettings,
    cancel: CancellationToken,
) -> Controller<P, SqliteStore> {
    Controller::new(
        source,
        SqliteStore::open_in_memory().unwrap(),
        ListingSelectors::new().unwrap(),
        settings,
        cancel,
    )
}

/// Serves canned markup per page; unknown pages fail like a dead renderer.
#[derive(Default)]
struct StubSource {
    pages: HashMap<u32, String>,
    calls: Mutex<Vec<u32>>,
    cancel_on: Option<(u32, CancellationToken)>,
}

impl StubSource {
    fn with(pages: impl IntoIterator<Item = (u32, String)>) -> Self {
        Self {
            pages: pages.into_iter().collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for StubSource {
    async fn fetch(&self, page: u32) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(page);
        if let Some((at, token)) = &self.cancel_on {
            if *at == page {
                token.cancel();
            }
        }
        self.pages.get(&page).cloned().ok_or(FetchError::Exhausted {
            page,
            attempts: 3,
            last: Box::new(FetchError::Timeout(Duration::from_secs(30))),
        })
    }
}

// -------------------------
// Controller
// -------------------------

#[tokio::test]
async fn stops_normally_on_first_empty_page() {
    let source = StubSource::with([
        (
            1,
            page(&[
                row("★ StatTrak™ Bowie Knife | Doppler (Factory New)", "$450.00", "12"),
                row("★ Karambit", "$610.12", "40"),
            ]),
        ),
        (2, page(&[row("★ Flip Knife | Fade (Minimal Wear)", "$301.00", "7")])),
        (3, empty_page()),
    ]);
    let mut ctl = controller(source, quick_settings(), CancellationToken::new());

    let report = ctl.run().await.unwrap();

    assert_eq!(report.exit, RunExit::Exhausted);
    assert!(!report.exit.is_failure());
    assert_eq!(report.pages, 2);
    assert_eq!(report.totals.accepted, 3);
    assert_eq!(report.total_rows, 3);
    assert_eq!(ctl.store().total().unwrap(), 3);
    assert_eq!(ctl.source().calls(), vec![1, 2, 3]);
}

#[tokio::test]
async fn visits_pages_in_order_until_exhausted() {
    let source = StubSource::with([
        (1, page(&[row("★ Karambit", "$610.12", "40")])),
        (2, page(&[row("★ Gut Knife", "$90.00", "100")])),
        (3, empty_page()),
    ]);
    let mut ctl = controller(source, quick_settings(), CancellationToken::new());
    ctl.run().await.unwrap();
    assert_eq!(ctl.source().calls(), vec![1, 2, 3]);

    let source = StubSource::with([(5, empty_page())]);
    let mut later = controller(
        source,
        ControllerSettings {
            start_page: 5,
            ..quick_settings()
        },
        CancellationToken::new(),
    );
    let report = later.run().await.unwrap();
    assert_eq!(later.source().calls(), vec![5]);
    assert_eq!(report.pages, 0);
    assert_eq!(report.exit, RunExit::Exhausted);
}

#[tokio::test]
async fn duplicates_and_malformed_are_counted_not_stored() {
    let knife = row("★ Bowie Knife | Doppler (Factory New)", "$450.00", "12");
    let source = StubSource::with([
        (1, page(&[knife.clone(), row("★ Bowie Knife | Doppler", "$1.00", "1")])),
        (
            2,
            page(&[
                row("★ Bowie Knife | Doppler (Factory New)", "$470.00", "9"),
                row("★ Bowie Knife | Doppler (Factory New)", "Sold out", "0"),
            ]),
        ),
        (3, empty_page()),
    ]);
    let mut ctl = controller(source, quick_settings(), CancellationToken::new());

    let report = ctl.run().await.unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.totals.accepted, 1);
    assert_eq!(report.totals.duplicates, 1);
    assert_eq!(report.totals.malformed, 2);
    assert_eq!(report.total_rows, 1);
}

#[tokio::test]
async fn row_missing_sub_nodes_does_not_abort_page() {
    let broken = r#"<a class="market_listing_row_link"><span class="market_listing_item_name">★ Navaja Knife</span></a>"#;
    let source = StubSource::with([
        (1, page(&[broken.to_string(), row("★ Ursus Knife", "$120.00", "30")])),
        (2, empty_page()),
    ]);
    let mut ctl = controller(source, quick_settings(), CancellationToken::new());

    let report = ctl.run().await.unwrap();

    assert_eq!(report.totals.faulty_nodes, 1);
    assert_eq!(report.totals.accepted, 1);
    assert_eq!(report.exit, RunExit::Exhausted);
}

#[tokio::test]
async fn fetch_failure_halts_with_nothing_persisted() {
    let source = StubSource::default();
    let mut ctl = controller(source, quick_settings(), CancellationToken::new());

    let report = ctl.run().await.unwrap();

    assert_eq!(report.exit, RunExit::FetchFailed);
    assert!(report.exit.is_failure());
    assert_eq!(report.pages, 0);
    assert_eq!(report.total_rows, 0);
}

#[tokio::test]
async fn page_cap_stops_early() {
    let source = StubSource::with([
        (1, page(&[row("★ Karambit", "$610.12", "40")])),
        (2, page(&[row("★ Gut Knife", "$90.00", "100")])),
    ]);
    let mut ctl = controller(
        source,
        ControllerSettings {
            max_pages: Some(1),
            ..quick_settings()
        },
        CancellationToken::new(),
    );

    let report = ctl.run().await.unwrap();

    assert_eq!(report.exit, RunExit::PageCap);
    assert_eq!(report.pages, 1);
    assert_eq!(ctl.source().calls(), vec![1]);
}

#[tokio::test]
async fn cancelled_before_start_fetches_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut ctl = controller(StubSource::default(), quick_settings(), cancel);

    let report = ctl.run().await.unwrap();

    assert_eq!(report.exit, RunExit::Cancelled);
    assert_eq!(report.pages, 0);
}

#[tokio::test]
async fn cancellation_cuts_the_page_delay_short() {
    let cancel = CancellationToken::new();
    let source = StubSource {
        cancel_on: Some((1, cancel.clone())),
        ..StubSource::with([
            (1, page(&[row("★ Karambit", "$610.12", "40")])),
            (2, page(&[row("★ Gut Knife", "$90.00", "100")])),
        ])
    };
    let mut ctl = controller(
        source,
        ControllerSettings {
            page_delay: Duration::from_secs(3600),
            ..quick_settings()
        },
        cancel,
    );

    let report = tokio::time::timeout(Duration::from_secs(5), ctl.run())
        .await
        .expect("delay was not interrupted")
        .unwrap();

    assert_eq!(report.exit, RunExit::Cancelled);
    assert_eq!(report.pages, 1);
    assert_eq!(report.total_rows, 1);
}

#[tokio::test]
async fn stub_source_records_calls() {
    let source = StubSource::with([(1, empty_page())]);
    source.fetch(1).await.unwrap();
    assert!(source.fetch(2).await.is_err());
    assert_eq!(source.calls(), vec![1, 2]);
}

// -------------------------
// Fetcher with stub renderers
// -------------------------

#[derive(Clone, Copy)]
enum Script {
    /// Fail this many attempts with a retryable error, then render `markup`.
    FailThenRender(u32),
    /// Never become ready.
    Hang,
    /// Fail with a non-retryable error.
    Fatal,
}

struct StubRenderer {
    script: Script,
    markup: String,
    opened: AtomicU32,
    closed: std::sync::Arc<AtomicU32>,
}

impl StubRenderer {
    fn new(script: Script, markup: String) -> Self {
        Self {
            script,
            markup,
            opened: AtomicU32::new(0),
            closed: std::sync::Arc::new(AtomicU32::new(0)),
        }
    }
}

struct StubSession {
    script: Script,
    attempt: u32,
    markup: String,
    loaded: Option<Url>,
    closed: std::sync::Arc<AtomicU32>,
}

#[async_trait]
impl Renderer for StubRenderer {
    type Session = StubSession;

    async fn open(&self) -> Result<StubSession, FetchError> {
        let attempt = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StubSession {
            script: self.script,
            attempt,
            markup: self.markup.clone(),
            loaded: None,
            closed: self.closed.clone(),
        })
    }
}

#[async_trait]
impl RenderSession for StubSession {
    async fn load(&mut self, target: &Url) -> Result<(), FetchError> {
        match self.script {
            Script::Fatal => Err(FetchError::InvalidTarget(target.to_string())),
            Script::FailThenRender(n) if self.attempt <= n => {
                Err(FetchError::Session("renderer crashed".into()))
            }
            _ => {
                self.loaded = Some(target.clone());
                Ok(())
            }
        }
    }

    async fn wait_until_ready(&mut self, _row_class: &str, _timeout: Duration) -> Result<(), FetchError> {
        if let Script::Hang = self.script {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }

    fn markup(&self) -> Result<String, FetchError> {
        Ok(self.markup.clone())
    }

    async fn close(self) -> Result<(), FetchError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn retries_with_fresh_sessions_until_rendered() {
    let markup = page(&[row("★ Karambit", "$610.12", "40")]);
    let fetcher = Fetcher::new(StubRenderer::new(Script::FailThenRender(2), markup.clone()), fetch_settings(3));

    let got = fetcher.fetch(1).await.unwrap();

    assert_eq!(got, markup);
    let renderer = fetcher_renderer(&fetcher);
    assert_eq!(renderer.0, 3);
    assert_eq!(renderer.1, 3, "every session is closed");
}

#[tokio::test]
async fn three_failed_attempts_exhaust_the_page() {
    let fetcher = Fetcher::new(StubRenderer::new(Script::FailThenRender(u32::MAX), String::new()), fetch_settings(3));

    let err = fetcher.fetch(1).await.unwrap_err();

    assert!(matches!(err, FetchError::Exhausted { page: 1, attempts: 3, .. }));
    assert!(!err.is_retryable());
    assert_eq!(fetcher_renderer(&fetcher), (3, 3));
}

#[tokio::test]
async fn render_wait_is_bounded() {
    let fetcher = Fetcher::new(StubRenderer::new(Script::Hang, String::new()), fetch_settings(2));

    let err = tokio::time::timeout(Duration::from_secs(5), fetcher.fetch(4))
        .await
        .expect("wait was not bounded")
        .unwrap_err();

    match err {
        FetchError::Exhausted { page, attempts, last } => {
            assert_eq!((page, attempts), (4, 2));
            assert!(matches!(*last, FetchError::Timeout(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fetcher_renderer(&fetcher), (2, 2));
}

#[tokio::test]
async fn fatal_error_does_not_spend_attempts() {
    let fetcher = Fetcher::new(StubRenderer::new(Script::Fatal, String::new()), fetch_settings(3));

    let err = fetcher.fetch(1).await.unwrap_err();

    assert!(matches!(err, FetchError::InvalidTarget(_)));
    assert_eq!(fetcher_renderer(&fetcher), (1, 1));
}

#[tokio::test]
async fn failing_fetcher_stops_controller_with_zero_rows() {
    let fetcher = Fetcher::new(StubRenderer::new(Script::FailThenRender(u32::MAX), String::new()), fetch_settings(3));
    let mut ctl = controller(fetcher, quick_settings(), CancellationToken::new());

    let report = ctl.run().await.unwrap();

    assert_eq!(report.exit, RunExit::FetchFailed);
    assert_eq!(report.pages, 0);
    assert_eq!(report.total_rows, 0);
}

#[tokio::test]
async fn fatal_fetch_error_stops_controller_after_one_attempt() {
    let fetcher = Fetcher::new(StubRenderer::new(Script::Fatal, String::new()), fetch_settings(3));
    let mut ctl = controller(fetcher, quick_settings(), CancellationToken::new());

    let report = ctl.run().await.unwrap();

    assert_eq!(report.exit, RunExit::FetchFailed);
    assert_eq!(report.pages, 0);
    assert_eq!(fetcher_renderer(ctl.source()), (1, 1));
}

/// (sessions opened, sessions closed)
fn fetcher_renderer(fetcher: &Fetcher<StubRenderer>) -> (u32, u32) {
    let r = fetcher.renderer();
    (r.opened.load(Ordering::SeqCst), r.closed.load(Ordering::SeqCst))
}
