use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::controller::ControllerSettings;
use crate::fetch::FetchSettings;

/// Scrapes knife listings from the community market into a SQLite database.
#[derive(Debug, Clone, Parser)]
#[command(name = "knife_market", version, about)]
pub struct Config {
    /// SQLite database file; created on first run, reused afterwards.
    #[arg(long, env = "KNIFE_DB", default_value = "knives.db")]
    pub db: PathBuf,

    /// Market root the search URL is built from.
    #[arg(long, env = "KNIFE_BASE_URL", default_value = "https://steamcommunity.com/market/")]
    pub base_url: Url,

    #[arg(long, env = "KNIFE_APP_ID", default_value_t = 730)]
    pub app_id: u32,

    #[arg(long, env = "KNIFE_QUERY", default_value = "knife")]
    pub query: String,

    #[arg(long, env = "KNIFE_START_PAGE", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub start_page: u32,

    /// Stop after this many pages even if more remain.
    #[arg(long, env = "KNIFE_MAX_PAGES", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_pages: Option<u32>,

    /// Listings per rendered page.
    #[arg(long, env = "KNIFE_PAGE_SIZE", default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub page_size: u32,

    /// Upper bound on waiting for the listing rows to render.
    #[arg(long, env = "KNIFE_RENDER_TIMEOUT_SECS", default_value_t = 30)]
    pub render_timeout_secs: u64,

    /// Attempts per page before giving up on the whole run.
    #[arg(long, env = "KNIFE_MAX_ATTEMPTS", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Pause between pages, to stay clear of rate limiting.
    #[arg(long, env = "KNIFE_PAGE_DELAY_SECS", default_value_t = 30)]
    pub page_delay_secs: u64,

    /// Base pause between failed attempts; up to the same amount of jitter is added.
    #[arg(long, env = "KNIFE_RETRY_BACKOFF_MS", default_value_t = 600)]
    pub retry_backoff_ms: u64,

    /// Skip the robots.txt check.
    #[arg(long, env = "KNIFE_IGNORE_ROBOTS")]
    pub ignore_robots: bool,
}

impl Config {
    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            base_url: with_trailing_slash(&self.base_url),
            app_id: self.app_id,
            query: self.query.clone(),
            render_timeout: Duration::from_secs(self.render_timeout_secs),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            start_page: self.start_page,
            max_pages: self.max_pages,
            page_delay: Duration::from_secs(self.page_delay_secs),
        }
    }
}

// `join` drops the last path segment unless the base ends in '/'.
fn with_trailing_slash(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
