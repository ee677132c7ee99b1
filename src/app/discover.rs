use std::collections::HashSet;
use std::time::Duration;

use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use super::config::{CrawlConfig, Selectors};
use super::diagnostics::Diagnostics;
use super::error::{CrawlError, Result};
use super::types::{ItemId, ItemReference};
use super::webdriver::PageDriver;

const AFTER_LOAD_MORE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub items: Vec<ItemReference>,
    /// The listing never stopped growing within the poll budget.
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stabilization {
    pub count: usize,
    pub waits: usize,
    pub stable: bool,
}

pub async fn discover_listing<D: PageDriver>(
    driver: &D,
    config: &CrawlConfig,
    diagnostics: &Diagnostics,
) -> Result<Discovery> {
    let s = &config.selectors;
    driver.goto(config.album_url.as_str()).await?;
    if let Err(err) = driver.wait_for_selector(&s.first_item, config.nav_timeout).await {
        diagnostics.dump_page(driver, "listing").await;
        return Err(err);
    }
    diagnostics.screenshot(driver, "listing").await;

    trigger_load_more(driver, s, diagnostics).await?;
    tokio::time::sleep(AFTER_LOAD_MORE).await;

    let settled = poll_until_stable(
        driver,
        &s.listing_item,
        &s.last_listing_item,
        config.listing_settle,
        config.max_listing_polls,
    )
    .await?;
    diagnostics.screenshot(driver, "last_scroll").await;
    if !settled.stable {
        warn!(
            count = settled.count,
            polls = settled.waits,
            "listing still growing after poll budget, continuing with partial discovery"
        );
    }

    let base = Url::parse(&driver.current_url().await?).unwrap_or_else(|_| config.album_url.clone());
    let fragments = driver.outer_html(&s.listing_item_with_meta).await?;
    info!("{} a[data-store] found.", fragments.len());
    let items = harvest_items(&fragments, &base);
    info!("{} item ids found.", items.len());
    for (i, item) in items.iter().take(5).enumerate() {
        info!(
            "{i}: {}    {}",
            item.id,
            item.detail_url.as_deref().unwrap_or("-")
        );
    }

    Ok(Discovery {
        items,
        partial: !settled.stable,
    })
}

async fn trigger_load_more<D: PageDriver>(
    driver: &D,
    s: &Selectors,
    diagnostics: &Diagnostics,
) -> Result<()> {
    let before = driver.count(&s.listing_item).await?;
    if !driver.click(&s.load_more, 0).await? {
        diagnostics.dump_page(driver, "load_more").await;
        return Err(CrawlError::MissingElement {
            selector: s.load_more.clone(),
        });
    }
    info!("{before} thumbnails before clicking see more photos.");
    Ok(())
}

/// Scrolls the last item into view and recounts until two consecutive
/// counts agree, or `max_polls` settle periods have passed.
pub async fn poll_until_stable<D: PageDriver>(
    driver: &D,
    item_selector: &str,
    last_item_selector: &str,
    settle: Duration,
    max_polls: usize,
) -> Result<Stabilization> {
    let mut before = driver.count(item_selector).await?;
    for waits in 1..=max_polls.max(1) {
        if !driver.scroll_into_view(last_item_selector).await? {
            warn!(selector = last_item_selector, "no last item to scroll to");
        }
        tokio::time::sleep(settle).await;
        let after = driver.count(item_selector).await?;
        info!("Before = {before} After = {after}.");
        if after == before {
            return Ok(Stabilization {
                count: after,
                waits,
                stable: true,
            });
        }
        before = after;
    }

    Ok(Stabilization {
        count: before,
        waits: max_polls.max(1),
        stable: false,
    })
}

/// Turns listing anchors into item references, skipping any without
/// usable `data-store` metadata. First occurrence of an id wins.
pub fn harvest_items(fragments: &[String], base: &Url) -> Vec<ItemReference> {
    let anchor = Selector::parse("a").expect("static selector");
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for fragment in fragments {
        let doc = Html::parse_fragment(fragment);
        let Some(el) = doc.select(&anchor).next() else {
            warn!("listing entry without anchor skipped");
            continue;
        };
        let Some(raw) = el.value().attr("data-store") else {
            warn!("listing entry without data-store skipped");
            continue;
        };
        let id = match serde_json::from_str::<Value>(raw) {
            Ok(meta) => match meta.get("id") {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    warn!(data_store = raw, "listing metadata has no id, skipped");
                    continue;
                }
            },
            Err(err) => {
                warn!(data_store = raw, "unparsable listing metadata skipped: {err}");
                continue;
            }
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        let detail_url = el
            .value()
            .attr("href")
            .map(str::trim)
            .filter(|href| !href.is_empty())
            .and_then(|href| base.join(href).ok())
            .map(|u| u.to_string());
        items.push(ItemReference {
            id: ItemId::new(id),
            detail_url,
        });
    }

    items
}
