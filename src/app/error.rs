use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("webdriver: {0}")]
    WebDriver(String),

    #[error("timed out after {after_ms}ms waiting for {what}")]
    Timeout { what: String, after_ms: u64 },

    #[error("required element not found: {selector}")]
    MissingElement { selector: String },

    #[error("no \"Next\" link on the current detail view")]
    EndOfSequence,

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("download of {url} rejected: {status}")]
    Download { url: String, status: String },

    #[error("max redirects ({0}) exceeded")]
    TooManyRedirects(usize),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl CrawlError {
    /// Failures worth another attempt after a short pause.
    pub fn is_transient(&self) -> bool {
        match self {
            CrawlError::Timeout { .. } | CrawlError::WebDriver(_) => true,
            CrawlError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    /// The page structure no longer matches what the crawler expects.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlError::MissingElement { .. } | CrawlError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;
