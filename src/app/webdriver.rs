//! Browser capability over the W3C WebDriver HTTP protocol.
//!
//! The crawler only needs a handful of page operations, collected in
//! [`PageDriver`]. [`WebDriverSession`] implements them against a running
//! chromedriver/geckodriver endpoint; tests substitute scripted drivers.

use std::fs::{self, File};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::Method;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::config::WebDriverConfig;
use super::error::{CrawlError, Result};
use super::types::BrowserArg;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts negotiated with the driver, reported back when it gives up.
#[derive(Debug, Clone, Copy)]
struct DriverTimeouts {
    page_load: Duration,
    script: Duration,
}

impl DriverTimeouts {
    fn after_ms(&self, error: &str) -> u64 {
        let limit = if error == "script timeout" {
            self.script
        } else {
            self.page_load
        };
        limit.as_millis() as u64
    }
}

/// Page operations the pipeline consumes from a browser session.
#[allow(async_fn_in_trait)]
pub trait PageDriver {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn count(&self, selector: &str) -> Result<usize>;

    /// `outerHTML` of every element matching `selector`, in document order.
    async fn outer_html(&self, selector: &str) -> Result<Vec<String>>;

    /// Scrolls the first match into view. `false` when nothing matches.
    async fn scroll_into_view(&self, selector: &str) -> Result<bool>;

    /// Clicks the `index`-th match. `false` when there is no such element.
    async fn click(&self, selector: &str, index: usize) -> Result<bool>;

    async fn current_url(&self) -> Result<String>;

    async fn page_source(&self) -> Result<String>;

    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<()>;

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.count(selector).await? > 0 {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(CrawlError::Timeout {
                    what: selector.to_string(),
                    after_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

pub struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    session_id: String,
    timeouts: DriverTimeouts,
}

impl WebDriverSession {
    pub async fn create(
        endpoint: &str,
        config: &WebDriverConfig,
        user_agent: &str,
        page_load_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(page_load_timeout + Duration::from_secs(30))
            .build()
            .map_err(|e| CrawlError::WebDriver(format!("webdriver client build failed: {e}")))?;
        let base = endpoint.trim_end_matches('/').to_string();
        let caps = webdriver_capabilities(config, user_agent);
        let timeouts = DriverTimeouts {
            page_load: page_load_timeout,
            script: SCRIPT_TIMEOUT,
        };

        let value = send_command(
            &client,
            timeouts,
            Method::POST,
            &format!("{base}/session"),
            Some(caps),
        )
        .await?;
        let session_id = value
            .pointer("/sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                CrawlError::WebDriver(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&value.to_string(), 220)
                ))
            })?;
        info!(session = %session_id, endpoint = %base, "webdriver session created");

        let session = Self {
            client,
            base,
            session_id,
            timeouts,
        };
        session
            .command(
                Method::POST,
                "timeouts",
                Some(json!({
                    "pageLoad": timeouts.page_load.as_millis() as u64,
                    "script": timeouts.script.as_millis() as u64,
                })),
            )
            .await?;
        Ok(session)
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = if path.is_empty() {
            format!("{}/session/{}", self.base, self.session_id)
        } else {
            format!("{}/session/{}/{}", self.base, self.session_id, path)
        };
        send_command(&self.client, self.timeouts, method, &url, body).await
    }

    pub async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    pub async fn close(self) {
        if let Err(err) = self.command(Method::DELETE, "", None).await {
            debug!("delete session failed: {err}");
        }
    }
}

impl PageDriver for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<()> {
        debug!(%url, "navigate");
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        let value = self
            .execute(
                "return document.querySelectorAll(arguments[0]).length;",
                vec![json!(selector)],
            )
            .await?;
        Ok(value.as_u64().unwrap_or_default() as usize)
    }

    async fn outer_html(&self, selector: &str) -> Result<Vec<String>> {
        let value = self
            .execute(
                "return Array.from(document.querySelectorAll(arguments[0])).map(el => el.outerHTML);",
                vec![json!(selector)],
            )
            .await?;
        Ok(value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|x| x.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default())
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<bool> {
        let script = r#"
            const el = document.querySelector(arguments[0]);
            if (!el) return false;
            el.scrollIntoView();
            return true;
        "#;
        let value = self.execute(script, vec![json!(selector)]).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn click(&self, selector: &str, index: usize) -> Result<bool> {
        let script = r#"
            const el = document.querySelectorAll(arguments[0])[arguments[1]];
            if (!el) return false;
            el.click();
            return true;
        "#;
        let value = self
            .execute(script, vec![json!(selector), json!(index)])
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn current_url(&self) -> Result<String> {
        let value = self.command(Method::GET, "url", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn page_source(&self) -> Result<String> {
        let value = self.command(Method::GET, "source", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let value = self.command(Method::GET, "screenshot", None).await?;
        let encoded = value.as_str().unwrap_or_default();
        STANDARD
            .decode(encoded)
            .map_err(|e| CrawlError::WebDriver(format!("screenshot decode failed: {e}")))
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<()> {
        let script = r#"
            return {
                ready: document.readyState,
                resources: performance.getEntriesByType("resource").length
            };
        "#;
        let started = Instant::now();
        let mut last_resources = None;
        let mut quiet_since = Instant::now();
        loop {
            let probe = self.execute(script, Vec::new()).await?;
            let complete = probe.pointer("/ready").and_then(|v| v.as_str()) == Some("complete");
            let resources = probe.pointer("/resources").and_then(|v| v.as_u64());
            if !complete || resources != last_resources {
                last_resources = resources;
                quiet_since = Instant::now();
            } else if quiet_since.elapsed() >= NETWORK_IDLE_WINDOW {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(CrawlError::Timeout {
                    what: "network idle".to_string(),
                    after_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Sends one WebDriver command and unwraps the `value` member of the reply.
async fn send_command(
    client: &reqwest::Client,
    timeouts: DriverTimeouts,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let res = request
        .send()
        .await
        .map_err(|e| CrawlError::WebDriver(format!("request to {url} failed: {e}")))?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| CrawlError::WebDriver(format!("response read failed for {url}: {e}")))?;
    let value: Value = serde_json::from_str(&body).unwrap_or_default();

    if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
        let message = value
            .pointer("/value/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown webdriver error");
        if err == "timeout" || err == "script timeout" {
            return Err(CrawlError::Timeout {
                what: format!("{url}: {}", truncate_for_log(message, 160)),
                after_ms: timeouts.after_ms(err),
            });
        }
        return Err(CrawlError::WebDriver(format!("{err}: {message}")));
    }
    if !status.is_success() {
        return Err(CrawlError::WebDriver(format!(
            "HTTP {} from {url}: {}",
            status.as_u16(),
            truncate_for_log(&body, 240)
        )));
    }

    Ok(value.get("value").cloned().unwrap_or(Value::Null))
}

fn webdriver_capabilities(config: &WebDriverConfig, user_agent: &str) -> Value {
    match config.browser {
        BrowserArg::Firefox => {
            let mut args = Vec::<String>::new();
            if config.headless {
                args.push("-headless".to_string());
            }
            let mut prefs = json!({
                "browser.cache.disk.enable": false,
                "browser.cache.memory.enable": false,
                "network.http.use-cache": false
            });
            if config.mobile_emulation {
                prefs["general.useragent.override"] = json!(user_agent);
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "moz:firefoxOptions": { "args": args, "prefs": prefs }
                    }
                }
            })
        }
        BrowserArg::Safari => json!({
            "capabilities": {
                "alwaysMatch": { "browserName": "safari" }
            }
        }),
        BrowserArg::Edge => {
            let mut edge_options = json!({ "args": chromium_args(config.headless) });
            if config.mobile_emulation {
                edge_options["mobileEmulation"] = mobile_emulation(user_agent);
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "MicrosoftEdge",
                        "acceptInsecureCerts": true,
                        "ms:edgeOptions": edge_options
                    }
                }
            })
        }
        BrowserArg::Chrome => {
            let mut args = chromium_args(config.headless);
            let profile_dir = std::env::temp_dir().join(format!(
                "album-harvest-chrome-profile-{}-{}",
                std::process::id(),
                Utc::now().timestamp_millis()
            ));
            let _ = fs::create_dir_all(&profile_dir);
            args.push(format!("--user-data-dir={}", profile_dir.display()));
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            let mut chrome_options = json!({ "args": args });
            if config.mobile_emulation {
                chrome_options["mobileEmulation"] = mobile_emulation(user_agent);
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "goog:chromeOptions": chrome_options
                    }
                }
            })
        }
    }
}

fn chromium_args(headless: bool) -> Vec<String> {
    let mut args = Vec::<String>::new();
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("--disable-gpu".to_string());
    args.push("--disable-dev-shm-usage".to_string());
    args.push("--no-first-run".to_string());
    args.push("--no-default-browser-check".to_string());
    args.push("--disable-crash-reporter".to_string());
    args
}

// Tablet-sized metrics: the phone layout nags about the native app.
fn mobile_emulation(user_agent: &str) -> Value {
    json!({
        "deviceMetrics": { "width": 600, "height": 960, "pixelRatio": 2.0, "touch": true },
        "userAgent": user_agent
    })
}

pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

/// A driver binary started by us; killed on drop.
#[derive(Default)]
pub struct DriverProcess(Option<Child>);

impl Drop for DriverProcess {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.0 {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Returns a reachable endpoint, starting a local driver when allowed.
pub async fn ensure_webdriver_ready(config: &WebDriverConfig) -> Result<(String, DriverProcess)> {
    let requested = normalize_local_webdriver_endpoint(&config.endpoint);
    if webdriver_reachable(&requested) {
        info!(endpoint = %requested, "webdriver endpoint reachable");
        return Ok((requested, DriverProcess::default()));
    }
    if !config.autostart {
        return Err(CrawlError::WebDriver(format!(
            "endpoint {requested} unreachable and --no-webdriver-autostart is set"
        )));
    }

    let port = find_free_local_port()?;
    let endpoint = format!("http://127.0.0.1:{port}");
    let child = start_webdriver(config, &endpoint, port).await?;
    info!(%endpoint, "webdriver autostarted");
    Ok((endpoint, DriverProcess(Some(child))))
}

fn webdriver_reachable(endpoint: &str) -> bool {
    let Ok(parsed) = Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

async fn start_webdriver(config: &WebDriverConfig, endpoint: &str, port: u16) -> Result<Child> {
    let driver_binary = config
        .binary
        .clone()
        .unwrap_or_else(|| default_driver_binary(config.browser).to_string());
    let log_path = webdriver_log_path(port);

    let mut cmd = Command::new(&driver_binary);
    configure_webdriver_command(&mut cmd, &driver_binary, config.browser, port);
    let log_file = File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;
    let log_file_err = log_file.try_clone()?;
    cmd.stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .stdin(Stdio::null());

    let mut child = cmd
        .spawn()
        .map_err(|e| CrawlError::WebDriver(format!("failed to spawn {driver_binary}: {e}")))?;
    let steps = (config.start_timeout.as_millis() / 200).max(1);
    for _ in 0..steps {
        if webdriver_reachable(endpoint) {
            return Ok(child);
        }
        if let Ok(Some(status)) = child.try_wait() {
            let mut message = format!(
                "{driver_binary} exited early with status {status} (log: {})",
                log_path.display()
            );
            if let Some(tail) = read_log_tail(&log_path, 30) {
                message = format!("{message}; tail: {tail}");
            }
            return Err(CrawlError::WebDriver(message));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = child.kill();
    let _ = child.wait();
    warn!(driver = %driver_binary, "webdriver did not become ready");
    let mut message = format!(
        "{driver_binary} did not become ready in time (log: {})",
        log_path.display()
    );
    if let Some(tail) = read_log_tail(&log_path, 30) {
        message = format!("{message}; tail: {tail}");
    }
    Err(CrawlError::WebDriver(message))
}

fn default_driver_binary(browser: BrowserArg) -> &'static str {
    match browser {
        BrowserArg::Chrome => "chromedriver",
        BrowserArg::Firefox => "geckodriver",
        BrowserArg::Edge => "msedgedriver",
        BrowserArg::Safari => "safaridriver",
    }
}

fn configure_webdriver_command(cmd: &mut Command, bin: &str, browser: BrowserArg, port: u16) {
    let lower = bin.to_ascii_lowercase();
    if matches!(browser, BrowserArg::Safari)
        || lower.contains("safaridriver")
        || lower.contains("geckodriver")
    {
        cmd.arg("--port").arg(port.to_string());
        return;
    }
    cmd.arg(format!("--port={port}"));
    if lower.contains("chromedriver") {
        cmd.arg("--log-level=SEVERE");
    }
}

fn normalize_local_webdriver_endpoint(endpoint: &str) -> String {
    let Ok(url) = Url::parse(endpoint) else {
        return endpoint.to_string();
    };
    let Some(host) = url.host_str() else {
        return endpoint.to_string();
    };
    if host != "localhost" && host != "127.0.0.1" {
        return endpoint.trim_end_matches('/').to_string();
    }
    let scheme = url.scheme();
    let port = url.port_or_known_default().unwrap_or(4444);
    format!("{scheme}://127.0.0.1:{port}")
}

fn webdriver_log_path(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("album-harvest-webdriver-{port}.log"))
}

fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let tail = text
        .lines()
        .rev()
        .take(lines.max(1))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ");
    if tail.is_empty() { None } else { Some(tail) }
}

fn find_free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
