use std::cell::{Cell, RefCell};
use std::path::Path;
use std::time::Duration;

use album_harvest::app::{
    CompletionSet, CrawlConfig, CrawlError, Crawler, ImageFetcher, PageDriver, PersistedRecord,
    Result, Selectors, StopReason, TraversalArg,
};
use tempfile::tempdir;
use url::Url;

const ALBUM: &str = "https://m.example.com/media/set/?set=a.533865628109963&type=3";

#[derive(Clone)]
struct Photo {
    id: &'static str,
    caption: Option<&'static str>,
    image: Option<&'static str>,
    linked: bool,
}

fn photo(id: &'static str, caption: &'static str) -> Photo {
    Photo {
        id,
        caption: Some(caption),
        image: Some("https://cdn.example.com/full.jpg"),
        linked: true,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum View {
    Blank,
    Listing,
    Detail(usize),
}

/// In-memory album: a listing page plus one detail view per photo.
struct FakeAlbum {
    photos: Vec<Photo>,
    selectors: Selectors,
    view: Cell<View>,
    loaded_more: Cell<bool>,
    has_load_more: bool,
    empty_listing: bool,
    page_dumps: Cell<usize>,
    detail_loads: Cell<usize>,
    next_clicks: Cell<usize>,
    visited: RefCell<Vec<String>>,
}

impl FakeAlbum {
    fn new(photos: Vec<Photo>) -> Self {
        Self {
            photos,
            selectors: Selectors::default(),
            view: Cell::new(View::Blank),
            loaded_more: Cell::new(false),
            has_load_more: true,
            empty_listing: false,
            page_dumps: Cell::new(0),
            detail_loads: Cell::new(0),
            next_clicks: Cell::new(0),
            visited: RefCell::new(Vec::new()),
        }
    }

    fn detail_url(&self, index: usize) -> String {
        format!("https://m.example.com/photo.php?fbid={}&set=a.1", self.photos[index].id)
    }

    fn show_detail(&self, index: usize) {
        self.view.set(View::Detail(index));
        self.visited.borrow_mut().push(self.photos[index].id.to_string());
    }

    fn navigations(&self) -> usize {
        self.detail_loads.get() + self.next_clicks.get()
    }
}

impl PageDriver for FakeAlbum {
    async fn goto(&self, url: &str) -> Result<()> {
        if url == ALBUM {
            self.view.set(View::Listing);
            return Ok(());
        }
        let id = Url::parse(url)
            .ok()
            .and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == "fbid")
                    .map(|(_, v)| v.to_string())
            })
            .unwrap_or_default();
        let index = self
            .photos
            .iter()
            .position(|p| p.id == id)
            .expect("navigated to unknown photo");
        self.detail_loads.set(self.detail_loads.get() + 1);
        self.show_detail(index);
        Ok(())
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        let s = &self.selectors;
        Ok(match self.view.get() {
            View::Listing if selector == s.first_item || selector == s.listing_item => {
                if self.empty_listing {
                    0
                } else if self.loaded_more.get() {
                    self.photos.len()
                } else {
                    self.photos.len().min(2)
                }
            }
            View::Detail(_) if selector == s.detail_container || selector == s.detail_content => 1,
            _ => 0,
        })
    }

    async fn outer_html(&self, selector: &str) -> Result<Vec<String>> {
        let s = &self.selectors;
        Ok(match self.view.get() {
            View::Listing if selector == s.listing_item_with_meta => (0..self.photos.len())
                .map(|i| {
                    let photo = &self.photos[i];
                    if photo.linked {
                        format!(
                            r#"<a href="/photo.php?fbid={id}&amp;set=a.1" data-store='{{"id":{id}}}'></a>"#,
                            id = photo.id
                        )
                    } else {
                        format!(r#"<a data-store='{{"id":{}}}'></a>"#, photo.id)
                    }
                })
                .collect(),
            View::Detail(i) if selector == s.stage_image => self.photos[i]
                .image
                .map(|src| vec![format!(r#"<img src="{src}?id={}">"#, self.photos[i].id)])
                .unwrap_or_default(),
            View::Detail(i) if selector == s.message => self.photos[i]
                .caption
                .map(|c| vec![format!("<div>{c}</div>")])
                .unwrap_or_default(),
            View::Detail(i) if selector == s.stage_links => {
                let mut links = vec![r#"<a href="/prev">Prev</a>"#.to_string()];
                if i + 1 < self.photos.len() {
                    links.push(format!(r#"<a href="{}">Next</a>"#, self.detail_url(i + 1)));
                }
                links.push(r#"<a href="/more">More</a>"#.to_string());
                links
            }
            _ => Vec::new(),
        })
    }

    async fn scroll_into_view(&self, _selector: &str) -> Result<bool> {
        Ok(self.view.get() == View::Listing)
    }

    async fn click(&self, selector: &str, index: usize) -> Result<bool> {
        let s = &self.selectors;
        match self.view.get() {
            View::Listing if selector == s.load_more => {
                if !self.has_load_more {
                    return Ok(false);
                }
                self.loaded_more.set(true);
                Ok(true)
            }
            View::Listing if selector == s.first_item => {
                self.show_detail(0);
                Ok(true)
            }
            View::Detail(i) if selector == s.stage_links && index == 1 => {
                if i + 1 >= self.photos.len() {
                    return Ok(false);
                }
                self.next_clicks.set(self.next_clicks.get() + 1);
                self.show_detail(i + 1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_url(&self) -> Result<String> {
        Ok(match self.view.get() {
            View::Detail(i) => self.detail_url(i),
            _ => ALBUM.to_string(),
        })
    }

    async fn page_source(&self) -> Result<String> {
        self.page_dumps.set(self.page_dumps.get() + 1);
        Ok("<html><body>fake</body></html>".to_string())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Writes a tiny placeholder instead of downloading.
#[derive(Default)]
struct FakeFetcher {
    fetched: RefCell<Vec<String>>,
    reject: Option<&'static str>,
}

impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, target: &Path) -> Result<u64> {
        self.fetched.borrow_mut().push(url.to_string());
        if let Some(bad) = self.reject {
            if url.contains(bad) {
                return Err(CrawlError::Download {
                    url: url.to_string(),
                    status: "Forbidden".to_string(),
                });
            }
        }
        tokio::fs::write(target, b"jpg").await?;
        Ok(3)
    }
}

fn config(dir: &Path, traversal: TraversalArg) -> CrawlConfig {
    let mut config = CrawlConfig::for_album(Url::parse(ALBUM).unwrap(), dir);
    config.traversal = traversal;
    config.nav_timeout = Duration::from_millis(200);
    config.listing_settle = Duration::from_millis(1);
    config.item_delay = Duration::ZERO;
    config.step_delay = Duration::ZERO;
    config.retries = 0;
    config
}

fn album() -> Vec<Photo> {
    vec![
        photo("101", r##"Hello <a href="/hashtag/tag1">#tag1</a><br>world"##),
        photo("102", r##"<span>Sunset</span> <a>#sea</a><a>#sea</a>"##),
        photo("103", "Just text"),
    ]
}

async fn run_once(
    dir: &Path,
    traversal: TraversalArg,
    photos: Vec<Photo>,
) -> (Result<album_harvest::app::CrawlSummary>, FakeAlbum) {
    let done = CompletionSet::load(dir, false).unwrap();
    let mut crawler = Crawler::new(
        FakeAlbum::new(photos),
        FakeFetcher::default(),
        config(dir, traversal),
        done,
    );
    let summary = crawler.run().await;
    let (driver, _) = crawler.into_parts();
    (summary, driver)
}

#[tokio::test]
async fn second_run_navigates_nowhere() {
    let dir = tempdir().unwrap();

    let (first, driver) = run_once(dir.path(), TraversalArg::Direct, album()).await;
    let first = first.unwrap();
    assert_eq!(first.discovered, 3);
    assert_eq!(first.saved, 3);
    assert_eq!(driver.navigations(), 3);
    assert_eq!(first.stop, Some(StopReason::ListingExhausted));
    for id in ["101", "102", "103"] {
        assert!(dir.path().join(format!("{id}.jpg")).exists());
        assert!(dir.path().join(format!("{id}.json")).exists());
    }

    let (second, driver) = run_once(dir.path(), TraversalArg::Direct, album()).await;
    let second = second.unwrap();
    assert_eq!(driver.navigations(), 0);
    assert_eq!(second.navigations, 0);
    assert_eq!(second.saved, 0);
    assert_eq!(second.skipped, 3);
}

#[tokio::test]
async fn record_json_holds_text_and_hashtags() {
    let dir = tempdir().unwrap();
    let (summary, _) = run_once(dir.path(), TraversalArg::Direct, album()).await;
    summary.unwrap();

    let raw = std::fs::read_to_string(dir.path().join("101.json")).unwrap();
    assert!(raw.contains("\n  \"text\""), "pretty-printed: {raw}");
    let record: PersistedRecord = serde_json::from_str(&raw).unwrap();
    assert_eq!(record.text, "Hello\nworld");
    assert_eq!(record.hashtags, ["#tag1"]);

    let second: PersistedRecord =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("102.json")).unwrap())
            .unwrap();
    assert_eq!(second.text, "Sunset");
    assert_eq!(second.hashtags, ["#sea", "#sea"]);
}

#[tokio::test]
async fn missing_image_skips_item_and_next_run_retries_it() {
    let dir = tempdir().unwrap();
    let mut photos = album();
    photos[1].image = None;

    let (summary, _) = run_once(dir.path(), TraversalArg::Direct, photos).await;
    let summary = summary.unwrap();
    assert_eq!(summary.saved, 2);
    assert_eq!(summary.failed, 1);
    assert!(!dir.path().join("102.json").exists());
    assert!(!dir.path().join("102.jpg").exists());

    let (retry, driver) = run_once(dir.path(), TraversalArg::Direct, album()).await;
    let retry = retry.unwrap();
    assert_eq!(retry.saved, 1);
    assert_eq!(retry.skipped, 2);
    assert_eq!(*driver.visited.borrow(), ["102"]);
}

#[tokio::test]
async fn rejected_download_leaves_item_unmarked() {
    let dir = tempdir().unwrap();
    let done = CompletionSet::load(dir.path(), false).unwrap();
    let mut photos = album();
    photos[2].image = Some("https://cdn.example.com/blocked.jpg");
    let fetcher = FakeFetcher {
        reject: Some("blocked"),
        ..FakeFetcher::default()
    };
    let mut crawler = Crawler::new(
        FakeAlbum::new(photos),
        fetcher,
        config(dir.path(), TraversalArg::Direct),
        done,
    );
    let summary = crawler.run().await.unwrap();
    let (_, ledger) = crawler.into_parts();

    assert_eq!(summary.saved, 2);
    assert_eq!(summary.failed, 1);
    assert!(!ledger.contains("103"));
    assert!(!dir.path().join("103.json").exists());
}

#[tokio::test]
async fn sequential_walk_follows_next_until_the_end() {
    let dir = tempdir().unwrap();
    let (summary, driver) = run_once(dir.path(), TraversalArg::Sequential, album()).await;
    let summary = summary.unwrap();

    assert_eq!(summary.stop, Some(StopReason::EndOfSequence));
    assert_eq!(summary.saved, 3);
    assert_eq!(driver.detail_loads.get(), 1);
    assert_eq!(driver.next_clicks.get(), 2);
    assert_eq!(*driver.visited.borrow(), ["101", "102", "103"]);
}

#[tokio::test]
async fn sequential_walk_skips_completed_items_without_extracting() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("102.json"), "{}").unwrap();
    std::fs::write(dir.path().join("102.jpg"), "jpg").unwrap();

    let (summary, _) = run_once(dir.path(), TraversalArg::Sequential, album()).await;
    let summary = summary.unwrap();
    assert_eq!(summary.saved, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(std::fs::read_to_string(dir.path().join("102.json")).unwrap(), "{}");
}

#[tokio::test]
async fn sequential_walk_stops_at_the_iteration_cap() {
    let dir = tempdir().unwrap();
    let done = CompletionSet::load(dir.path(), false).unwrap();
    let mut config = config(dir.path(), TraversalArg::Sequential);
    config.max_items = 2;
    let mut crawler = Crawler::new(FakeAlbum::new(album()), FakeFetcher::default(), config, done);

    let summary = crawler.run().await.unwrap();
    assert_eq!(summary.stop, Some(StopReason::IterationCap));
    assert_eq!(summary.saved, 2);
}

#[tokio::test]
async fn missing_load_more_is_fatal() {
    let dir = tempdir().unwrap();
    let mut driver = FakeAlbum::new(album());
    driver.has_load_more = false;
    let mut crawler = Crawler::new(
        driver,
        FakeFetcher::default(),
        config(dir.path(), TraversalArg::Direct),
        CompletionSet::default(),
    );

    let err = crawler.run().await.unwrap_err();
    assert!(matches!(err, CrawlError::MissingElement { ref selector } if selector == "#m_more_item > a"));
    let (driver, _) = crawler.into_parts();
    assert_eq!(driver.page_dumps.get(), 1);
    assert_eq!(driver.navigations(), 0);
}

#[tokio::test]
async fn listing_that_never_renders_aborts_before_any_navigation() {
    let dir = tempdir().unwrap();
    let mut driver = FakeAlbum::new(album());
    driver.empty_listing = true;
    let mut config = config(dir.path(), TraversalArg::Direct);
    config.diagnostics = true;
    let diagnostics_dir = config.diagnostics_dir();
    let mut crawler = Crawler::new(driver, FakeFetcher::default(), config, CompletionSet::default());

    let err = crawler.run().await.unwrap_err();
    assert!(matches!(err, CrawlError::Timeout { .. }), "{err}");
    let (driver, _) = crawler.into_parts();
    assert_eq!(driver.navigations(), 0);
    assert_eq!(driver.page_dumps.get(), 1);
    let dumps = std::fs::read_dir(&diagnostics_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with("-listing.html"))
        .count();
    assert_eq!(dumps, 1);
}

#[tokio::test]
async fn lone_image_from_an_interrupted_run_is_harvested_again() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("102.jpg"), "half").unwrap();

    let (summary, driver) = run_once(dir.path(), TraversalArg::Direct, album()).await;
    let summary = summary.unwrap();
    assert_eq!(summary.saved, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(*driver.visited.borrow(), ["101", "102", "103"]);
    assert!(dir.path().join("102.json").exists());
    assert_eq!(std::fs::read_to_string(dir.path().join("102.jpg")).unwrap(), "jpg");
}

#[tokio::test]
async fn item_without_address_is_skipped_in_direct_mode() {
    let dir = tempdir().unwrap();
    let mut photos = album();
    photos[1].linked = false;

    let (summary, driver) = run_once(dir.path(), TraversalArg::Direct, photos).await;
    let summary = summary.unwrap();
    assert_eq!(summary.saved, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stop, Some(StopReason::ListingExhausted));
    assert_eq!(*driver.visited.borrow(), ["101", "103"]);
    assert!(!dir.path().join("102.json").exists());
}

#[tokio::test]
async fn missing_caption_container_aborts_the_run() {
    let dir = tempdir().unwrap();
    let mut photos = album();
    photos[0].caption = None;

    let (summary, driver) = run_once(dir.path(), TraversalArg::Direct, photos).await;
    assert!(matches!(summary, Err(CrawlError::MissingElement { .. })));
    assert_eq!(*driver.visited.borrow(), ["101"]);
    assert!(!dir.path().join("101.json").exists());
}
