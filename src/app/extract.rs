use std::time::Duration;

use scraper::{ElementRef, Html, Node, Selector};
use tracing::{error, info, warn};
use url::Url;

use super::config::Selectors;
use super::diagnostics::Diagnostics;
use super::error::{CrawlError, Result};
use super::types::{ItemId, Record};
use super::webdriver::PageDriver;

const MESSAGE_ATTEMPTS: usize = 3;
const MESSAGE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextAndHashtags {
    pub text: String,
    pub hashtags: Vec<String>,
    pub unknown_node_names: Vec<String>,
}

/// Splits a caption container's child nodes into caption text and hashtags.
///
/// Anchors become hashtags (not part of the text). Spans and bare text are
/// trimmed and concatenated without separator; `<br>` contributes a newline
/// and nothing else. `<wbr>` and nested `<div>`s are ignored. Any other
/// node kind is collected in `unknown_node_names`.
pub fn classify_message(container_html: &str) -> TextAndHashtags {
    let doc = Html::parse_fragment(container_html);
    let mut out = TextAndHashtags::default();
    let Some(container) = doc.root_element().children().find_map(ElementRef::wrap) else {
        return out;
    };

    let mut tokens = Vec::<String>::new();
    for child in container.children() {
        match child.value() {
            Node::Text(text) => tokens.push(text.trim().to_string()),
            Node::Element(el) => {
                let content = || {
                    ElementRef::wrap(child)
                        .map(|e| e.text().collect::<String>())
                        .unwrap_or_default()
                };
                match el.name() {
                    "a" => out.hashtags.push(content()),
                    "span" => tokens.push(content().trim().to_string()),
                    "br" => tokens.push("\n".to_string()),
                    "wbr" | "div" => {}
                    other => out.unknown_node_names.push(other.to_ascii_uppercase()),
                }
            }
            Node::Comment(_) => out.unknown_node_names.push("#comment".to_string()),
            _ => out.unknown_node_names.push("#other".to_string()),
        }
    }

    out.text = tokens.concat().trim().to_string();
    out
}

/// First `src` of the photo-stage image fragments, resolved against `page_url`.
pub fn image_source(fragments: &[String], page_url: Option<&Url>) -> Option<String> {
    let img = Selector::parse("img").expect("static selector");
    let src = fragments.iter().find_map(|fragment| {
        Html::parse_fragment(fragment)
            .select(&img)
            .next()
            .and_then(|el| el.value().attr("src"))
            .map(|s| s.trim().to_string())
    })?;
    if src.is_empty() {
        return None;
    }
    match (Url::parse(&src), page_url) {
        (Ok(_), _) | (Err(_), None) => Some(src),
        (Err(_), Some(base)) => base.join(&src).ok().map(|u| u.to_string()),
    }
}

pub struct RecordExtractor {
    selectors: Selectors,
    diagnostics: Diagnostics,
}

impl RecordExtractor {
    pub fn new(selectors: Selectors, diagnostics: Diagnostics) -> Self {
        Self {
            selectors,
            diagnostics,
        }
    }

    /// Reads the loaded detail view. A missing caption container is fatal;
    /// a missing image is an `Extraction` error the caller may skip past.
    pub async fn extract<D: PageDriver>(&self, driver: &D, id: &ItemId) -> Result<Record> {
        let (image_url, message) =
            tokio::join!(self.resolve_image(driver, id), self.text_and_hashtags(driver, id));
        let message = message?;
        let image_url = image_url?;
        info!(%id, image = %image_url, hashtags = ?message.hashtags, "extracted record");

        Ok(Record {
            id: id.clone(),
            text: message.text,
            hashtags: message.hashtags,
            image_url,
        })
    }

    async fn resolve_image<D: PageDriver>(&self, driver: &D, id: &ItemId) -> Result<String> {
        let fragments = driver.outer_html(&self.selectors.stage_image).await?;
        let page_url = driver
            .current_url()
            .await
            .ok()
            .and_then(|u| Url::parse(&u).ok());
        match image_source(&fragments, page_url.as_ref()) {
            Some(url) => Ok(url),
            None => {
                error!(%id, selector = %self.selectors.stage_image, "image url is empty, markup changed?");
                self.diagnostics
                    .dump_page(driver, &format!("{id}-image"))
                    .await;
                Err(CrawlError::Extraction(format!("no image source for item {id}")))
            }
        }
    }

    async fn text_and_hashtags<D: PageDriver>(
        &self,
        driver: &D,
        id: &ItemId,
    ) -> Result<TextAndHashtags> {
        for attempt in 1..=MESSAGE_ATTEMPTS {
            let found = driver.outer_html(&self.selectors.message).await?;
            if let Some(html) = found.first() {
                let parsed = classify_message(html);
                if !parsed.unknown_node_names.is_empty() {
                    warn!(%id, unknown = ?parsed.unknown_node_names, "Unknown nodeName");
                }
                return Ok(parsed);
            }
            if attempt < MESSAGE_ATTEMPTS {
                tokio::time::sleep(MESSAGE_RETRY_DELAY).await;
            }
        }

        error!(%id, selector = %self.selectors.message, "caption container not found");
        self.diagnostics
            .dump_page(driver, &format!("{id}-message"))
            .await;
        Err(CrawlError::MissingElement {
            selector: self.selectors.message.clone(),
        })
    }
}
