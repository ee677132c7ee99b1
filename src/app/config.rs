use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use super::error::{CrawlError, Result};
use super::types::{BrowserArg, Cli, TraversalArg};

/// CSS selectors describing the album markup.
#[derive(Debug, Clone)]
pub struct Selectors {
    pub first_item: String,
    pub listing_item: String,
    pub listing_item_with_meta: String,
    pub last_listing_item: String,
    pub load_more: String,
    pub detail_container: String,
    pub detail_content: String,
    pub stage_image: String,
    pub stage_links: String,
    pub message: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            first_item: "div#root #thumbnail_area > a".to_string(),
            listing_item: "div#thumbnail_area > a".to_string(),
            listing_item_with_meta: "div#thumbnail_area > a[data-store]".to_string(),
            last_listing_item: "div#thumbnail_area > a[data-store]:last-child".to_string(),
            load_more: "#m_more_item > a".to_string(),
            detail_container:
                r#"div[data-sigil="story-popup-metadata story-div feed-ufi-metadata"]"#
                    .to_string(),
            detail_content: "div#MPhotoContent".to_string(),
            stage_image: r#"div[data-sigil~="photo-stage"] img"#.to_string(),
            stage_links: r#"div[data-sigil~="photo-stage"] > div > a"#.to_string(),
            message: "div.msg > div".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub endpoint: String,
    pub browser: BrowserArg,
    pub headless: bool,
    pub autostart: bool,
    pub binary: Option<String>,
    pub start_timeout: Duration,
    pub mobile_emulation: bool,
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub album_url: Url,
    pub output_dir: PathBuf,
    pub traversal: TraversalArg,
    pub webdriver: WebDriverConfig,
    pub nav_timeout: Duration,
    pub listing_settle: Duration,
    pub max_listing_polls: usize,
    pub item_delay: Duration,
    pub step_delay: Duration,
    pub max_items: usize,
    pub retries: usize,
    pub max_redirects: usize,
    pub user_agent: String,
    pub strict_ledger: bool,
    pub diagnostics: bool,
    pub selectors: Selectors,
}

impl CrawlConfig {
    /// Defaults for a given album, matching the CLI defaults.
    pub fn for_album(album_url: Url, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            album_url,
            output_dir: output_dir.into(),
            traversal: TraversalArg::Direct,
            webdriver: WebDriverConfig {
                endpoint: "http://localhost:4444".to_string(),
                browser: BrowserArg::Chrome,
                headless: true,
                autostart: true,
                binary: None,
                start_timeout: Duration::from_millis(12_000),
                mobile_emulation: true,
            },
            nav_timeout: Duration::from_millis(10_000),
            listing_settle: Duration::from_millis(5000),
            max_listing_polls: 200,
            item_delay: Duration::from_millis(500),
            step_delay: Duration::from_millis(1000),
            max_items: 10_000,
            retries: 2,
            max_redirects: 8,
            user_agent: super::types::MOBILE_USER_AGENT.to_string(),
            strict_ledger: false,
            diagnostics: false,
            selectors: Selectors::default(),
        }
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.output_dir.join("diagnostics")
    }
}

impl TryFrom<Cli> for CrawlConfig {
    type Error = CrawlError;

    fn try_from(cli: Cli) -> Result<Self> {
        let album_url = Url::parse(&cli.url)
            .map_err(|e| CrawlError::Config(format!("invalid album url {}: {e}", cli.url)))?;
        if !matches!(album_url.scheme(), "http" | "https") {
            return Err(CrawlError::Config(format!(
                "album url must be http/https, got {}",
                album_url.scheme()
            )));
        }
        Url::parse(&cli.webdriver_url).map_err(|e| {
            CrawlError::Config(format!("invalid webdriver url {}: {e}", cli.webdriver_url))
        })?;
        if cli.nav_timeout_ms == 0 {
            return Err(CrawlError::Config("--nav-timeout-ms must be > 0".to_string()));
        }
        if cli.max_listing_polls == 0 || cli.max_items == 0 {
            return Err(CrawlError::Config(
                "--max-listing-polls and --max-items must be > 0".to_string(),
            ));
        }

        let mut config = CrawlConfig::for_album(album_url, cli.output);
        config.traversal = cli.traversal;
        config.webdriver = WebDriverConfig {
            endpoint: cli.webdriver_url,
            browser: cli.webdriver_browser,
            headless: cli.webdriver_headless,
            autostart: !cli.no_webdriver_autostart,
            binary: cli.webdriver_binary,
            start_timeout: Duration::from_millis(cli.webdriver_start_timeout_ms.max(200)),
            mobile_emulation: cli.mobile_emulation,
        };
        config.nav_timeout = Duration::from_millis(cli.nav_timeout_ms);
        config.listing_settle = Duration::from_millis(cli.listing_settle_ms);
        config.max_listing_polls = cli.max_listing_polls;
        config.item_delay = Duration::from_millis(cli.item_delay_ms);
        config.step_delay = Duration::from_millis(cli.step_delay_ms);
        config.max_items = cli.max_items;
        config.retries = cli.retries;
        config.max_redirects = cli.max_redirects;
        config.user_agent = cli.user_agent;
        config.strict_ledger = cli.strict_ledger;
        config.diagnostics = cli.diagnostics;
        Ok(config)
    }
}
