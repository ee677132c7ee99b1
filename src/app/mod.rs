mod config;
mod crawl;
mod diagnostics;
mod discover;
mod download;
mod error;
mod extract;
mod ledger;
mod navigate;
mod runtime;
mod types;
mod webdriver;

pub use config::{CrawlConfig, Selectors, WebDriverConfig};
pub use crawl::Crawler;
pub use diagnostics::Diagnostics;
pub use discover::{Discovery, Stabilization, discover_listing, harvest_items, poll_until_stable};
pub use download::{HttpDownloader, ImageFetcher};
pub use error::{CrawlError, Result};
pub use extract::{RecordExtractor, TextAndHashtags, classify_message, image_source};
pub use ledger::CompletionSet;
pub use navigate::{
    DirectNavigator, ItemNavigator, SequentialNavigator, await_detail_view, item_id_from_url,
    select_next_link,
};
pub use runtime::run;
pub use types::{
    BrowserArg, Cli, CrawlEvent, CrawlSummary, ItemId, ItemReference, MOBILE_USER_AGENT,
    PersistedRecord, Record, StopReason, TraversalArg,
};
pub use webdriver::{DriverProcess, PageDriver, WebDriverSession, ensure_webdriver_ready};
