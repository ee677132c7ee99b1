use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};

use super::config::CrawlConfig;
use super::crawl::Crawler;
use super::download::HttpDownloader;
use super::error::Result;
use super::ledger::CompletionSet;
use super::types::{Cli, CrawlEvent, CrawlSummary};
use super::webdriver::{WebDriverSession, ensure_webdriver_ready};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct ProgressTally {
    discovered: usize,
    partial: bool,
    saved: usize,
    skipped: usize,
    failed: Vec<String>,
    done: bool,
}

impl ProgressTally {
    fn handle(&mut self, event: CrawlEvent) {
        match event {
            CrawlEvent::Discovered { total, partial } => {
                self.discovered = total;
                self.partial = partial;
                info!("{total} PhotoIDs found.");
            }
            CrawlEvent::Skipped { .. } => self.skipped += 1,
            CrawlEvent::Saved { id } => {
                self.saved += 1;
                info!(
                    "[{}/{}] saved {id}",
                    self.saved + self.skipped + self.failed.len(),
                    self.discovered
                );
            }
            CrawlEvent::Failed { id, reason } => {
                self.failed.push(format!("{id}: {reason}"));
            }
            CrawlEvent::Status(message) => info!("{message}"),
            CrawlEvent::Finished => self.done = true,
        }
    }
}

async fn report_progress(mut rx: UnboundedReceiver<CrawlEvent>) -> ProgressTally {
    let mut tally = ProgressTally::default();
    while let Some(event) = rx.recv().await {
        tally.handle(event);
    }
    tally
}

/// One complete harvest: ledger, browser session, crawl, summary.
pub async fn run(cli: Cli) -> Result<CrawlSummary> {
    let config = CrawlConfig::try_from(cli)?;
    tokio::fs::create_dir_all(&config.output_dir).await?;
    let done = CompletionSet::load(&config.output_dir, config.strict_ledger)?;
    for id in done.incomplete() {
        warn!(%id, "only one of .json/.jpg present");
    }

    let (endpoint, _driver_process) = ensure_webdriver_ready(&config.webdriver).await?;
    let session = WebDriverSession::create(
        &endpoint,
        &config.webdriver,
        &config.user_agent,
        config.nav_timeout,
    )
    .await?;
    let fetcher = HttpDownloader::new(&config.user_agent, config.max_redirects, DOWNLOAD_TIMEOUT)?;

    let (tx, rx) = mpsc::unbounded_channel::<CrawlEvent>();
    let reporter = tokio::spawn(report_progress(rx));
    let _ = tx.send(CrawlEvent::Status(format!(
        "{} items already harvested in {}",
        done.len(),
        config.output_dir.display()
    )));
    let output_dir = config.output_dir.clone();

    let mut crawler = Crawler::new(session, fetcher, config, done).with_events(tx);
    let result = crawler.run().await;
    let (session, _) = crawler.into_parts();
    session.close().await;

    let tally = match reporter.await {
        Ok(tally) => tally,
        Err(err) => {
            warn!("progress reporter join error: {err}");
            ProgressTally::default()
        }
    };
    for failure in &tally.failed {
        warn!("not harvested: {failure}");
    }
    eprintln!(
        "finished crawl: discovered={}{} saved={} skipped={} failed={} complete={} output={}",
        tally.discovered,
        if tally.partial { " (partial)" } else { "" },
        tally.saved,
        tally.skipped,
        tally.failed.len(),
        tally.done,
        output_dir.display()
    );

    result
}
