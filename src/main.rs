use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use knife_market::config::Config;
use knife_market::controller::{Controller, RunReport};
use knife_market::extract::ListingSelectors;
use knife_market::fetch::{Fetcher, check_robots, request_target};
use knife_market::render::HttpRenderer;
use knife_market::store::SqliteStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::parse();

    match run(config).await {
        Ok(report) if report.exit.is_failure() => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: Config) -> Result<RunReport> {
    let fetch = config.fetch_settings();

    if config.ignore_robots {
        info!("robots.txt check skipped");
    } else {
        let first = request_target(&fetch.base_url, fetch.app_id, &fetch.query, config.start_page)?;
        check_robots(&first, "Mozilla").await?;
    }

    let store = SqliteStore::open(&config.db)
        .with_context(|| format!("opening {}", config.db.display()))?;
    info!(db = %config.db.display(), "store ready");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received, stopping after the current page");
                cancel.cancel();
            }
        });
    }

    let renderer = HttpRenderer::new(config.page_size, fetch.render_timeout);
    let mut controller = Controller::new(
        Fetcher::new(renderer, fetch),
        store,
        ListingSelectors::new()?,
        config.controller_settings(),
        cancel,
    );

    let outcome = controller.run().await;
    if let Err(e) = controller.into_store().close() {
        warn!(error = %e, "store did not close cleanly");
    }
    outcome.context("store failure during scrape")
}
