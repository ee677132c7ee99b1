use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use super::error::{CrawlError, Result};

/// Stores the bytes behind a URL at a local path.
#[allow(async_fn_in_trait)]
pub trait ImageFetcher {
    /// Returns the number of bytes written.
    async fn fetch(&self, url: &str, target: &Path) -> Result<u64>;
}

/// Plain HTTP(S) download with manual redirect handling.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    max_redirects: usize,
}

impl HttpDownloader {
    pub fn new(user_agent: &str, max_redirects: usize, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            max_redirects,
        })
    }
}

impl ImageFetcher for HttpDownloader {
    async fn fetch(&self, url: &str, target: &Path) -> Result<u64> {
        let mut current = Url::parse(url)?;
        for _ in 0..=self.max_redirects {
            let mut response = self.client.get(current.clone()).send().await?;
            let status = response.status();
            if status.as_u16() >= 400 {
                return Err(CrawlError::Download {
                    url: current.to_string(),
                    status: status
                        .canonical_reason()
                        .unwrap_or(status.as_str())
                        .to_string(),
                });
            }

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if let Some(location) = location {
                    info!("redirect to {location}");
                    current = current.join(&location)?;
                    continue;
                }
            }

            let partial = partial_path(target);
            let written = match write_body(&mut response, &partial).await {
                Ok(written) => written,
                Err(err) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err);
                }
            };
            tokio::fs::rename(&partial, target).await?;
            debug!(bytes = written, target = %target.display(), "download complete");
            return Ok(written);
        }

        Err(CrawlError::TooManyRedirects(self.max_redirects))
    }
}

async fn write_body(response: &mut reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}
