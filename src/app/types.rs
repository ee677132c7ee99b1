use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};

pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 13_2_3 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0.3 Mobile/15E148 Safari/604.1";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "album-harvest",
    version,
    about = "Resumable photo album harvester: captions, hashtags and images as JSON + JPG"
)]
pub struct Cli {
    /// Album listing address.
    #[arg(value_name = "URL")]
    pub url: String,

    #[arg(short, long, value_name = "DIR", default_value = "./output")]
    pub output: PathBuf,

    #[arg(long, value_enum, default_value_t = TraversalArg::Direct)]
    pub traversal: TraversalArg,

    #[arg(long, value_name = "URL", default_value = "http://localhost:4444")]
    pub webdriver_url: String,

    #[arg(long, value_enum, default_value_t = BrowserArg::Chrome)]
    pub webdriver_browser: BrowserArg,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub webdriver_headless: bool,

    #[arg(long, default_value_t = false)]
    pub no_webdriver_autostart: bool,

    #[arg(long, value_name = "PATH")]
    pub webdriver_binary: Option<String>,

    #[arg(long, value_name = "MS", default_value_t = 12000)]
    pub webdriver_start_timeout_ms: u64,

    #[arg(long, value_name = "MS", default_value_t = 10_000)]
    pub nav_timeout_ms: u64,

    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub listing_settle_ms: u64,

    #[arg(long, value_name = "N", default_value_t = 200)]
    pub max_listing_polls: usize,

    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub item_delay_ms: u64,

    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub step_delay_ms: u64,

    #[arg(long, value_name = "N", default_value_t = 10_000)]
    pub max_items: usize,

    #[arg(long, value_name = "N", default_value_t = 2)]
    pub retries: usize,

    #[arg(long, value_name = "N", default_value_t = 8)]
    pub max_redirects: usize,

    #[arg(long, value_name = "UA", default_value = MOBILE_USER_AGENT)]
    pub user_agent: String,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub mobile_emulation: bool,

    #[arg(long, default_value_t = false)]
    pub strict_ledger: bool,

    #[arg(long, default_value_t = false)]
    pub diagnostics: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum BrowserArg {
    Chrome,
    Firefox,
    Edge,
    Safari,
}

/// How the crawler moves between detail views.
#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum TraversalArg {
    /// Load every item's detail address directly.
    Direct,
    /// Enter at the first item and follow "Next" links.
    Sequential,
}

/// Stable identifier of a photo item, taken from the listing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ItemId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReference {
    pub id: ItemId,
    /// Absent when the item can only be reached by stepping.
    pub detail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: ItemId,
    pub text: String,
    pub hashtags: Vec<String>,
    pub image_url: String,
}

/// On-disk shape of `<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedRecord {
    pub text: String,
    #[serde(rename = "hashTags")]
    pub hashtags: Vec<String>,
}

impl From<&Record> for PersistedRecord {
    fn from(record: &Record) -> Self {
        Self {
            text: record.text.clone(),
            hashtags: record.hashtags.clone(),
        }
    }
}

#[derive(Debug)]
pub enum CrawlEvent {
    Discovered { total: usize, partial: bool },
    Skipped { id: ItemId },
    Saved { id: ItemId },
    Failed { id: ItemId, reason: String },
    Status(String),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ListingExhausted,
    EndOfSequence,
    IterationCap,
}

impl StopReason {
    pub fn label(self) -> &'static str {
        match self {
            StopReason::ListingExhausted => "listing exhausted",
            StopReason::EndOfSequence => "end of sequence",
            StopReason::IterationCap => "iteration cap reached",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub discovered: usize,
    pub partial_discovery: bool,
    pub navigations: usize,
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stop: Option<StopReason>,
}
