use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use super::config::CrawlConfig;
use super::diagnostics::Diagnostics;
use super::discover::discover_listing;
use super::download::ImageFetcher;
use super::error::{CrawlError, Result};
use super::extract::RecordExtractor;
use super::ledger::CompletionSet;
use super::navigate::{DirectNavigator, ItemNavigator, SequentialNavigator};
use super::types::{
    CrawlEvent, CrawlSummary, ItemId, ItemReference, PersistedRecord, Record, StopReason,
    TraversalArg,
};
use super::webdriver::PageDriver;

const RETRY_BACKOFF: Duration = Duration::from_millis(1500);

/// Drives one browser session through the album, one item at a time.
///
/// The completion set goes in at construction and comes back out through
/// [`Crawler::into_parts`]; nothing is kept between runs except the files.
pub struct Crawler<D: PageDriver, F: ImageFetcher> {
    driver: D,
    fetcher: F,
    config: CrawlConfig,
    done: CompletionSet,
    extractor: RecordExtractor,
    diagnostics: Diagnostics,
    events: Option<UnboundedSender<CrawlEvent>>,
    summary: CrawlSummary,
}

impl<D: PageDriver, F: ImageFetcher> Crawler<D, F> {
    pub fn new(driver: D, fetcher: F, config: CrawlConfig, done: CompletionSet) -> Self {
        let diagnostics = Diagnostics::new(config.diagnostics.then(|| config.diagnostics_dir()));
        let extractor = RecordExtractor::new(config.selectors.clone(), diagnostics.clone());
        Self {
            driver,
            fetcher,
            config,
            done,
            extractor,
            diagnostics,
            events: None,
            summary: CrawlSummary::default(),
        }
    }

    pub fn with_events(mut self, tx: UnboundedSender<CrawlEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn into_parts(self) -> (D, CompletionSet) {
        (self.driver, self.done)
    }

    pub async fn run(&mut self) -> Result<CrawlSummary> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let discovery = discover_listing(&self.driver, &self.config, &self.diagnostics).await?;
        self.summary.discovered = discovery.items.len();
        self.summary.partial_discovery = discovery.partial;
        self.emit(CrawlEvent::Discovered {
            total: discovery.items.len(),
            partial: discovery.partial,
        });

        let stop = match self.config.traversal {
            TraversalArg::Direct => self.run_direct(&discovery.items).await?,
            TraversalArg::Sequential => self.run_sequential(&discovery.items).await?,
        };
        self.summary.stop = Some(stop);
        info!(
            saved = self.summary.saved,
            skipped = self.summary.skipped,
            failed = self.summary.failed,
            "crawl stopped: {}",
            stop.label()
        );
        self.emit(CrawlEvent::Finished);
        Ok(self.summary.clone())
    }

    async fn run_direct(&mut self, items: &[ItemReference]) -> Result<StopReason> {
        let navigator = DirectNavigator::new(self.config.selectors.clone(), self.config.nav_timeout);
        for item in items {
            info!("Trying to load \"{}\"", item.id);
            if self.done.contains(item.id.as_str()) {
                self.skip(&item.id);
                continue;
            }

            let driver = &self.driver;
            let extractor = &self.extractor;
            let mut navigations = 0;
            let record = retry_transient(self.config.retries, item.id.as_str(), async || {
                navigations += 1;
                navigator.goto_item(driver, item).await?;
                extractor.extract(driver, &item.id).await
            })
            .await;
            self.summary.navigations += navigations;

            match record {
                Ok(record) => self.persist_or_fail(record).await?,
                Err(err) => self.fail(&item.id, err)?,
            }
            tokio::time::sleep(self.config.item_delay).await;
        }
        Ok(StopReason::ListingExhausted)
    }

    async fn run_sequential(&mut self, items: &[ItemReference]) -> Result<StopReason> {
        let Some(first) = items.first() else {
            return Ok(StopReason::ListingExhausted);
        };
        if items.iter().all(|item| self.done.contains(item.id.as_str())) {
            for item in items {
                self.skip(&item.id);
            }
            return Ok(StopReason::ListingExhausted);
        }

        let navigator = SequentialNavigator::new(
            self.config.selectors.clone(),
            self.config.nav_timeout,
            self.config.step_delay,
        );
        let driver = &self.driver;
        let mut navigations = 0;
        let entered = retry_transient(self.config.retries, first.id.as_str(), async || {
            navigations += 1;
            navigator.goto_item(driver, first).await
        })
        .await;
        self.summary.navigations += navigations;
        entered?;

        let mut seen = HashSet::<ItemId>::new();
        for _ in 0..self.config.max_items {
            let id = navigator.current_item(&self.driver).await?;
            if !seen.insert(id.clone()) {
                warn!(%id, "item visited twice in this run");
            }

            if self.done.contains(id.as_str()) {
                self.skip(&id);
            } else {
                let driver = &self.driver;
                let extractor = &self.extractor;
                let record = retry_transient(self.config.retries, id.as_str(), async || {
                    extractor.extract(driver, &id).await
                })
                .await;
                match record {
                    Ok(record) => self.persist_or_fail(record).await?,
                    Err(err) => self.fail(&id, err)?,
                }
                tokio::time::sleep(self.config.item_delay).await;
            }

            match self.step_from(&navigator, &id).await {
                Ok(()) => {}
                Err(CrawlError::EndOfSequence) => return Ok(StopReason::EndOfSequence),
                Err(err) => return Err(err),
            }
        }

        warn!(cap = self.config.max_items, "iteration cap reached");
        Ok(StopReason::IterationCap)
    }

    /// Advances past `from`. A transient failure is only retried while the
    /// view still shows `from`; if the step landed anyway it counts as done.
    async fn step_from(&mut self, navigator: &SequentialNavigator, from: &ItemId) -> Result<()> {
        let mut attempt = 0;
        loop {
            self.summary.navigations += 1;
            let err = match navigator.advance(&self.driver).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.config.retries => err,
                Err(err) => return Err(err),
            };
            match navigator.current_item(&self.driver).await {
                Ok(current) if &current != from => {
                    warn!(%from, to = %current, "advance reported {err} but the view moved on");
                    return Ok(());
                }
                _ => {}
            }
            attempt += 1;
            warn!(%from, attempt, "advance failed, retrying: {err}");
            tokio::time::sleep(RETRY_BACKOFF * attempt as u32).await;
        }
    }

    async fn persist_or_fail(&mut self, record: Record) -> Result<()> {
        match self.persist(&record).await {
            Ok(()) => {
                info!(id = %record.id, "saved");
                self.done.insert(record.id.clone());
                self.summary.saved += 1;
                self.emit(CrawlEvent::Saved { id: record.id });
                Ok(())
            }
            Err(err) => self.fail(&record.id, err),
        }
    }

    async fn persist(&self, record: &Record) -> Result<()> {
        let (image_path, json_path) = self.artifact_paths(&record.id);
        retry_transient(self.config.retries, record.id.as_str(), async || {
            self.fetcher.fetch(&record.image_url, &image_path).await
        })
        .await?;
        let json = serde_json::to_string_pretty(&PersistedRecord::from(record))?;
        tokio::fs::write(&json_path, json).await?;
        Ok(())
    }

    fn artifact_paths(&self, id: &ItemId) -> (PathBuf, PathBuf) {
        let dir = &self.config.output_dir;
        (dir.join(format!("{id}.jpg")), dir.join(format!("{id}.json")))
    }

    fn skip(&mut self, id: &ItemId) {
        info!("PhotoID has already loaded before {id}.");
        self.summary.skipped += 1;
        self.emit(CrawlEvent::Skipped { id: id.clone() });
    }

    /// Structural failures abort the run; anything else is logged and the
    /// item stays out of the ledger so the next run picks it up.
    fn fail(&mut self, id: &ItemId, err: CrawlError) -> Result<()> {
        if err.is_fatal() {
            error!(%id, "aborting crawl: {err}");
            return Err(err);
        }
        warn!(%id, "item failed: {err}");
        self.summary.failed += 1;
        self.emit(CrawlEvent::Failed {
            id: id.clone(),
            reason: err.to_string(),
        });
        Ok(())
    }

    fn emit(&self, event: CrawlEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

async fn retry_transient<T>(
    retries: usize,
    what: &str,
    mut op: impl AsyncFnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(what, attempt, "transient failure, retrying: {err}");
                tokio::time::sleep(RETRY_BACKOFF * attempt as u32).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_up_to_the_budget() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(2, "x", async || {
            calls += 1;
            Err(CrawlError::Timeout {
                what: "marker".to_string(),
                after_ms: 10,
            })
        })
        .await;
        assert!(matches!(result, Err(CrawlError::Timeout { .. })));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(5, "x", async || {
            calls += 1;
            Err(CrawlError::Extraction("no image".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_a_timeout() {
        let mut calls = 0;
        let result = retry_transient(2, "x", async || {
            calls += 1;
            if calls == 1 {
                Err(CrawlError::WebDriver("connection reset".to_string()))
            } else {
                Ok(calls)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
