use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, warn};

use super::webdriver::{PageDriver, truncate_for_log};

/// Page dumps and screenshots for post-mortem inspection.
///
/// Markup is always logged at `debug`; files are only written when a
/// directory was configured. Nothing here ever fails the crawl.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    dir: Option<PathBuf>,
}

impl Diagnostics {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub async fn dump_page<D: PageDriver>(&self, driver: &D, label: &str) {
        let html = match driver.page_source().await {
            Ok(html) => html,
            Err(err) => {
                warn!(label, "page source unavailable: {err}");
                return;
            }
        };
        debug!(label, html = %truncate_for_log(&html, 20_000), "page markup");
        if let Some(dir) = &self.dir {
            let name = format!("{}-{label}.html", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
            self.write(dir.join(name), html.into_bytes()).await;
        }
    }

    pub async fn screenshot<D: PageDriver>(&self, driver: &D, name: &str) {
        let Some(dir) = &self.dir else {
            return;
        };
        match driver.screenshot().await {
            Ok(png) => self.write(dir.join(format!("{name}.png")), png).await,
            Err(err) => debug!(name, "screenshot failed: {err}"),
        }
    }

    async fn write(&self, path: PathBuf, bytes: Vec<u8>) {
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!("diagnostics dir {} not writable: {err}", parent.display());
                return;
            }
        }
        if let Err(err) = tokio::fs::write(&path, bytes).await {
            warn!("failed to write {}: {err}", path.display());
        }
    }
}
