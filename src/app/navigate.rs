use std::time::Duration;

use scraper::Html;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use super::config::Selectors;
use super::error::{CrawlError, Result};
use super::types::{ItemId, ItemReference};
use super::webdriver::PageDriver;

const URL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Brings an item's detail view on screen.
#[allow(async_fn_in_trait)]
pub trait ItemNavigator {
    async fn goto_item<D: PageDriver>(&self, driver: &D, item: &ItemReference) -> Result<()>;
}

/// Waits for both detail-view markers and a quiet network, all bounded by
/// `timeout`.
pub async fn await_detail_view<D: PageDriver>(
    driver: &D,
    selectors: &Selectors,
    timeout: Duration,
) -> Result<()> {
    tokio::try_join!(
        driver.wait_for_selector(&selectors.detail_container, timeout),
        driver.wait_for_selector(&selectors.detail_content, timeout),
        driver.wait_for_network_idle(timeout),
    )?;
    Ok(())
}

/// Loads each item's detail address directly. Safe to retry.
#[derive(Debug, Clone)]
pub struct DirectNavigator {
    selectors: Selectors,
    timeout: Duration,
}

impl DirectNavigator {
    pub fn new(selectors: Selectors, timeout: Duration) -> Self {
        Self { selectors, timeout }
    }
}

impl ItemNavigator for DirectNavigator {
    async fn goto_item<D: PageDriver>(&self, driver: &D, item: &ItemReference) -> Result<()> {
        let Some(url) = item.detail_url.as_deref() else {
            return Err(CrawlError::Extraction(format!(
                "item {} has no detail address; --traversal sequential can still reach it",
                item.id
            )));
        };
        info!("Loading photo page \"{url}\".");
        driver.goto(url).await?;
        await_detail_view(driver, &self.selectors, self.timeout).await
    }
}

/// Enters the album at one item and follows "Next" links from there.
///
/// [`SequentialNavigator::advance`] is not idempotent: after a failure the
/// caller must re-read the current item before stepping again.
#[derive(Debug, Clone)]
pub struct SequentialNavigator {
    selectors: Selectors,
    timeout: Duration,
    step_delay: Duration,
}

impl SequentialNavigator {
    pub fn new(selectors: Selectors, timeout: Duration, step_delay: Duration) -> Self {
        Self {
            selectors,
            timeout,
            step_delay,
        }
    }

    pub async fn advance<D: PageDriver>(&self, driver: &D) -> Result<()> {
        let anchors = driver.outer_html(&self.selectors.stage_links).await?;
        let labels = anchors.iter().map(|html| anchor_label(html)).collect::<Vec<_>>();
        let index = select_next_link(&labels).ok_or(CrawlError::EndOfSequence)?;

        let previous_url = driver.current_url().await?;
        if !driver.click(&self.selectors.stage_links, index).await? {
            return Err(CrawlError::WebDriver(
                "\"Next\" link vanished before it could be clicked".to_string(),
            ));
        }
        wait_for_url_change(driver, &previous_url, self.timeout).await?;
        await_detail_view(driver, &self.selectors, self.timeout).await?;
        tokio::time::sleep(self.step_delay).await;
        Ok(())
    }

    /// Identity of the item currently shown, from the `fbid` query parameter.
    pub async fn current_item<D: PageDriver>(&self, driver: &D) -> Result<ItemId> {
        let current = driver.current_url().await?;
        item_id_from_url(&current).ok_or_else(|| {
            CrawlError::Extraction(format!("no fbid query parameter in {current}"))
        })
    }
}

impl ItemNavigator for SequentialNavigator {
    async fn goto_item<D: PageDriver>(&self, driver: &D, item: &ItemReference) -> Result<()> {
        match item.detail_url.as_deref() {
            Some(url) => driver.goto(url).await?,
            None => {
                debug!(id = %item.id, "no detail address, clicking first thumbnail");
                if !driver.click(&self.selectors.first_item, 0).await? {
                    return Err(CrawlError::MissingElement {
                        selector: self.selectors.first_item.clone(),
                    });
                }
            }
        }
        await_detail_view(driver, &self.selectors, self.timeout).await
    }
}

/// Index of the first label containing "Next".
pub fn select_next_link<S: AsRef<str>>(labels: &[S]) -> Option<usize> {
    labels.iter().position(|label| label.as_ref().contains("Next"))
}

fn anchor_label(outer_html: &str) -> String {
    Html::parse_fragment(outer_html)
        .root_element()
        .text()
        .collect::<String>()
}

pub fn item_id_from_url(raw: &str) -> Option<ItemId> {
    let url = Url::parse(raw).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "fbid")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(ItemId::new)
}

async fn wait_for_url_change<D: PageDriver>(
    driver: &D,
    previous: &str,
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    loop {
        if driver.current_url().await? != previous {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(CrawlError::Timeout {
                what: "detail view to change".to_string(),
                after_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(URL_POLL_INTERVAL).await;
    }
}
