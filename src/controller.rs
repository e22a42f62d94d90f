//! Page loop: fetch, extract, persist, delay, repeat.
//!
//! The loop stops when a page has no listing rows (normal exit), when a page
//! cannot be fetched (failure exit), at the optional page cap, or when the
//! cancellation token fires between pages. Retrying is the fetcher's job only.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::extract::{ListingSelectors, PageExtract};
use crate::fetch::{FetchError, PageSource};
use crate::record::ListingRecord;
use crate::store::{InsertOutcome, ListingStore, StoreError};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub start_page: u32,
    pub max_pages: Option<u32>,
    pub page_delay: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_pages: None,
            page_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// A page came back without listings.
    Exhausted,
    PageCap,
    Cancelled,
    FetchFailed,
}

impl RunExit {
    pub fn is_failure(self) -> bool {
        matches!(self, RunExit::FetchFailed)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageTally {
    pub listings: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub faulty_nodes: usize,
}

impl PageTally {
    fn absorb(&mut self, page: &PageTally) {
        self.listings += page.listings;
        self.accepted += page.accepted;
        self.duplicates += page.duplicates;
        self.malformed += page.malformed;
        self.faulty_nodes += page.faulty_nodes;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub pages: u32,
    pub totals: PageTally,
    /// Rows in the store after the run, including earlier runs.
    pub total_rows: u64,
    pub exit: RunExit,
}

enum State {
    Fetching,
    Extracting(String),
    Persisting(PageExtract),
    Delaying,
    Stopped(RunExit),
}

pub struct Controller<P, S> {
    source: P,
    store: S,
    selectors: ListingSelectors,
    settings: ControllerSettings,
    cancel: CancellationToken,
}

impl<P: PageSource, S: ListingStore> Controller<P, S> {
    pub fn new(
        source: P,
        store: S,
        selectors: ListingSelectors,
        settings: ControllerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            selectors,
            settings,
            cancel,
        }
    }

    pub fn source(&self) -> &P {
        &self.source
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Drives the page loop to completion. Only a store failure is an `Err`;
    /// fetch failures end the run with [`RunExit::FetchFailed`].
    pub async fn run(&mut self) -> Result<RunReport, StoreError> {
        let mut page = self.settings.start_page.max(1);
        let mut pages_done = 0u32;
        let mut totals = PageTally::default();
        let mut state = State::Fetching;

        let exit = loop {
            state = match state {
                State::Fetching => {
                    if self.cancel.is_cancelled() {
                        State::Stopped(RunExit::Cancelled)
                    } else {
                        match self.source.fetch(page).await {
                            Ok(markup) => State::Extracting(markup),
                            Err(e) => {
                                error!(page, error = %e, "{}, quitting", failure_reason(&e));
                                State::Stopped(RunExit::FetchFailed)
                            }
                        }
                    }
                }
                State::Extracting(markup) => {
                    let extract = self.selectors.extract(&markup);
                    if extract.is_empty() {
                        info!(page, "no listings on page, every page has been scraped");
                        State::Stopped(RunExit::Exhausted)
                    } else {
                        State::Persisting(extract)
                    }
                }
                State::Persisting(extract) => {
                    let tally = self.persist(page, extract)?;
                    report_page(page, &tally);
                    totals.absorb(&tally);
                    pages_done += 1;

                    if self.settings.max_pages.is_some_and(|cap| pages_done >= cap) {
                        info!(pages = pages_done, "page cap reached");
                        State::Stopped(RunExit::PageCap)
                    } else {
                        State::Delaying
                    }
                }
                State::Delaying => {
                    let delay = self.settings.page_delay;
                    info!("waiting {} seconds before next request", delay.as_secs());
                    page += 1;
                    tokio::select! {
                        _ = sleep(delay) => State::Fetching,
                        _ = self.cancel.cancelled() => State::Stopped(RunExit::Cancelled),
                    }
                }
                State::Stopped(exit) => break exit,
            };
        };

        if exit == RunExit::Cancelled {
            warn!(page, "cancelled between pages");
        }

        let total_rows = self.store.total()?;
        info!(
            pages = pages_done,
            accepted = totals.accepted,
            duplicates = totals.duplicates,
            malformed = totals.malformed,
            ?exit,
            "web scraping completed"
        );
        info!(total_rows, "{total_rows} knives are now in the store");

        Ok(RunReport {
            pages: pages_done,
            totals,
            total_rows,
            exit,
        })
    }

    fn persist(&mut self, page: u32, extract: PageExtract) -> Result<PageTally, StoreError> {
        let mut tally = PageTally {
            listings: extract.listings.len(),
            faulty_nodes: extract.faults.len(),
            ..PageTally::default()
        };

        for listing in &extract.listings {
            let record = match ListingRecord::from_listing(listing) {
                Ok(record) => record,
                Err(e) => {
                    debug!(page, error = %e, "dropping listing");
                    tally.malformed += 1;
                    continue;
                }
            };
            match self.store.insert(&record)? {
                InsertOutcome::Accepted => tally.accepted += 1,
                InsertOutcome::Duplicate => tally.duplicates += 1,
            }
        }
        Ok(tally)
    }
}

fn failure_reason(e: &FetchError) -> &'static str {
    match e {
        FetchError::Exhausted { .. } => "max attempts reached",
        FetchError::RobotsDisallowed(_) => "robots.txt disallows the page",
        _ if e.is_retryable() => "page could not be fetched",
        _ => "page cannot be fetched and will not be retried",
    }
}

fn report_page(page: u32, t: &PageTally) {
    match t.accepted {
        0 => info!(page, duplicates = t.duplicates, malformed = t.malformed, "no knives scraped on page {page} have been added"),
        1 => info!(page, duplicates = t.duplicates, malformed = t.malformed, "1 knife scraped on page {page} has been added"),
        n => info!(page, duplicates = t.duplicates, malformed = t.malformed, "{n} knives scraped on page {page} have been added"),
    }
    if t.duplicates > 0 {
        info!(page, "{} duplicate(s) found and not added", t.duplicates);
    }
    if t.malformed > 0 || t.faulty_nodes > 0 {
        warn!(page, malformed = t.malformed, faulty_nodes = t.faulty_nodes, "listings skipped");
    }
}
