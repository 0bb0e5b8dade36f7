use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser as ChromiumBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams, ResourceType, SetBlockedUrLsParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use headless_chrome::{Browser as ChromeBrowser, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::Value;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{EnginePreference, ScrapeConfig};
use crate::error::ScrapeError;
use crate::fetch::origin_of;
use crate::normalize::{self, MAX_IMAGES};
use crate::types::ProductDraft;
use crate::waterfall;

/// Hosts whose product pages are client-side rendered and yield nothing to a
/// static fetch. Rendering is only ever attempted for these.
const RENDER_HOSTS: &[&str] = &[
    "zalando.",
    "asos.",
    "shein.",
    "aliexpress.",
    "mediamarkt.",
    "otto.de",
    "nike.",
];

const RENDER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Subresource patterns aborted during rendering. Product image URLs are
/// harvested from the DOM and sniffed JSON, never downloaded.
const BLOCKED_RESOURCE_PATTERNS: &[&str] = &[
    "*.jpg*", "*.jpeg*", "*.png*", "*.gif*", "*.webp*", "*.avif*", "*.svg*", "*.ico*",
    "*.woff*", "*.woff2*", "*.ttf*", "*.otf*", "*.mp4*", "*.webm*", "*.m3u8*",
];

const MEDIA_JSON_KEYS: &[&str] = &[
    "image", "images", "media", "gallery", "variants", "pictures", "thumbnails",
];

// Hard stop for one engine attempt; generous enough for the per-step
// timeouts below to play out.
const RENDER_BUDGET: Duration = Duration::from_secs(150);
const ORIGIN_NAV_TIMEOUT: Duration = Duration::from_secs(45);
const TARGET_NAV_TIMEOUT: Duration = Duration::from_secs(60);
const CDP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MARKER_WAIT: Duration = Duration::from_secs(15);
const CHALLENGE_WAIT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const SCROLL_PASSES: usize = 6;
const SNIFFED_IMAGE_CAP: usize = 40;

const CONSENT_CLICK_JS: &str = r#"(() => {
  const candidates = [
    '#onetrust-accept-btn-handler',
    'button[data-testid="uc-accept-all-button"]',
    '#sp-cc-accept',
    'button[id*="accept"]',
    'button[class*="accept"]',
    'button[class*="consent"]',
    '[aria-label*="accept" i]'
  ];
  for (const sel of candidates) {
    const el = document.querySelector(sel);
    if (el) { el.click(); return sel; }
  }
  return null;
})()"#;

const MARKER_PRESENT_JS: &str = r#"!!document.querySelector('[itemprop="price"], [class*="price"], [data-test*="price"], picture source, img[src*=".jpg"], img[src*=".webp"]')"#;

const CHALLENGE_CLEAR_JS: &str = r#"!/just a moment|attention required|access denied|are you a robot|pardon our interruption/i.test(document.title)"#;

const DOM_HARVEST_JS: &str = r#"(() => {
  const images = Array.from(document.images)
    .map((img) => img.currentSrc || img.src)
    .filter(Boolean);
  const og = document.querySelector('meta[property="og:image"]');
  if (og && og.content) images.unshift(og.content);
  const titleEl = document.querySelector('h1');
  const priceEl = document.querySelector('[itemprop="price"], .price, [class*="price"]');
  return JSON.stringify({
    title: titleEl ? titleEl.textContent.trim() : null,
    price: priceEl ? (priceEl.getAttribute('content') || priceEl.textContent.trim()) : null,
    images: images.slice(0, 40)
  });
})()"#;

/// True when the host is on the client-side-rendering allow-list.
pub fn host_requires_rendering(url: &Url) -> bool {
    url.host_str()
        .map(|h| {
            let host = h.to_lowercase();
            RENDER_HOSTS.iter().any(|r| host.contains(r))
        })
        .unwrap_or(false)
}

/// What one rendered-page attempt produced, before re-extraction.
struct RenderCapture {
    html: String,
    harvest: DomHarvest,
    observations: NetworkObservations,
}

/// Fields read straight out of the live DOM at the end of the render, as a
/// supplement to re-parsing the serialized HTML.
#[derive(Debug, Default, Deserialize)]
struct DomHarvest {
    title: Option<String>,
    price: Option<String>,
    #[serde(default)]
    images: Vec<String>,
}

/// Network-level findings gathered while the page loaded.
#[derive(Debug, Default, Clone)]
pub struct NetworkObservations {
    pub image_urls: Vec<String>,
    pub saw_forbidden: bool,
}

/// Result of a successful render escalation.
#[derive(Debug, Clone)]
pub struct RenderedExtraction {
    pub draft: ProductDraft,
    pub engine: &'static str,
    pub saw_forbidden: bool,
}

/// One live browser page. The driving sequence is written once against this
/// interface; engines only provide the primitives.
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<()>;
    /// Evaluates a JS expression. Expressions here return primitives or
    /// JSON-stringified payloads, never live object handles.
    async fn evaluate(&mut self, expression: &str) -> Result<Value>;
    async fn content(&mut self) -> Result<String>;
    fn observed(&self) -> NetworkObservations;
    async fn close(&mut self) -> Result<()>;
}

/// A browser automation backend able to open interception-enabled sessions.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn launch(&self) -> Result<Box<dyn BrowserSession>>;
}

/// Ordered list of engine backends; the first to produce a usable
/// title/price/image wins, remaining engines are not attempted.
pub struct HeadlessRenderer {
    engines: Vec<Box<dyn RenderEngine>>,
}

impl HeadlessRenderer {
    pub fn from_config(config: &ScrapeConfig) -> Self {
        let chromium: Box<dyn RenderEngine> =
            Box::new(ChromiumEngine::new(config.render_proxy.clone()));
        let chrome: Box<dyn RenderEngine> =
            Box::new(ChromeEngine::new(config.render_proxy.clone()));
        let engines = match config.render_engine {
            EnginePreference::Chromium => vec![chromium, chrome],
            EnginePreference::Chrome => vec![chrome, chromium],
        };
        Self { engines }
    }

    /// Renders the page and re-runs extraction over the final DOM. Returns
    /// None when every engine fails or yields nothing usable; the caller
    /// treats that as "no improvement", not an error.
    pub async fn render_and_extract(&self, url: &Url) -> Option<RenderedExtraction> {
        for engine in &self.engines {
            info!("Rendering {} with {} engine", url, engine.name());
            match tokio::time::timeout(RENDER_BUDGET, attempt(engine.as_ref(), url)).await {
                Ok(Ok(capture)) => {
                    let extraction = extraction_from_capture(capture, url, engine.name());
                    let usable = extraction.draft.title.is_some()
                        || extraction.draft.price_raw.is_some()
                        || !extraction.draft.images.is_empty();
                    if usable {
                        return Some(extraction);
                    }
                    debug!("{} engine rendered {} but found no fields", engine.name(), url);
                }
                Ok(Err(e)) => warn!("{} engine failed for {}: {}", engine.name(), url, e),
                Err(_) => warn!("{} engine exceeded render budget for {}", engine.name(), url),
            }
        }
        None
    }
}

async fn attempt(engine: &dyn RenderEngine, url: &Url) -> Result<RenderCapture, ScrapeError> {
    let mut session = engine
        .launch()
        .await
        .map_err(|e| ScrapeError::RenderFailed(e.to_string()))?;
    let result = drive(session.as_mut(), url).await;
    if let Err(e) = session.close().await {
        debug!("Session close failed: {}", e);
    }
    result.map_err(|e| ScrapeError::RenderFailed(e.to_string()))
}

/// The rendering sequence: origin first to warm the session, consent
/// dismissal, target navigation, marker/challenge waits, lazy-load scrolling,
/// then a DOM harvest plus the serialized page.
async fn drive(session: &mut dyn BrowserSession, url: &Url) -> Result<RenderCapture> {
    let origin = origin_of(url);
    match tokio::time::timeout(ORIGIN_NAV_TIMEOUT, session.goto(&origin)).await {
        Ok(Err(e)) => debug!("Origin warm-up navigation failed: {}", e),
        Err(_) => debug!("Origin warm-up timed out after {:?}", ORIGIN_NAV_TIMEOUT),
        Ok(Ok(())) => {}
    }
    let _ = session.evaluate(CONSENT_CLICK_JS).await;

    tokio::time::timeout(TARGET_NAV_TIMEOUT, session.goto(url.as_str()))
        .await
        .map_err(|_| anyhow!("target navigation timed out after {:?}", TARGET_NAV_TIMEOUT))??;
    let _ = session.evaluate(CONSENT_CLICK_JS).await;

    if !wait_for(session, MARKER_PRESENT_JS, MARKER_WAIT).await {
        debug!("No price/image marker appeared within {:?}", MARKER_WAIT);
    }
    if !wait_for(session, CHALLENGE_CLEAR_JS, CHALLENGE_WAIT).await {
        debug!("Challenge title still present after {:?}", CHALLENGE_WAIT);
    }

    for pass in 1..=SCROLL_PASSES {
        let scroll = format!(
            "window.scrollTo(0, document.body.scrollHeight * {} / {});",
            pass, SCROLL_PASSES
        );
        let _ = session.evaluate(&scroll).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    let _ = session.evaluate("window.scrollTo(0, 0);").await;

    let harvest = match session.evaluate(DOM_HARVEST_JS).await {
        Ok(value) => value
            .as_str()
            .and_then(|raw| serde_json::from_str::<DomHarvest>(raw).ok())
            .unwrap_or_default(),
        Err(e) => {
            debug!("DOM harvest evaluation failed: {}", e);
            DomHarvest::default()
        }
    };

    let html = session.content().await?;
    let observations = session.observed();

    Ok(RenderCapture {
        html,
        harvest,
        observations,
    })
}

/// Polls a boolean JS predicate until it holds or the budget runs out.
async fn wait_for(session: &mut dyn BrowserSession, predicate: &str, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Ok(value) = session.evaluate(predicate).await {
            if value.as_bool() == Some(true) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn extraction_from_capture(
    capture: RenderCapture,
    url: &Url,
    engine: &'static str,
) -> RenderedExtraction {
    let outcome = waterfall::extract(&capture.html, url);
    let mut draft = outcome.draft;

    draft.fill_from(ProductDraft {
        title: capture
            .harvest
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        price_raw: capture
            .harvest
            .price
            .filter(|p| p.chars().any(|c| c.is_ascii_digit())),
        ..Default::default()
    });

    // Image candidates from all three channels are unioned, not first-wins:
    // the rendered DOM, the live-DOM harvest, and sniffed network payloads.
    let candidates = draft
        .images
        .drain(..)
        .chain(capture.harvest.images)
        .chain(capture.observations.image_urls)
        .collect::<Vec<_>>();
    draft.images = normalize::collect_images(candidates, url, MAX_IMAGES);

    RenderedExtraction {
        draft,
        engine,
        saw_forbidden: capture.observations.saw_forbidden,
    }
}

fn looks_like_image_url(url: &str) -> bool {
    normalize::has_image_extension(url)
}

/// Pulls plausible image URLs out of a sniffed JSON payload. Recurses the
/// whole value but only trusts extension-less URLs under media-like keys.
fn sniff_json_for_images(value: &Value, out: &mut Vec<String>) {
    walk_json(value, false, 0, out);
}

fn walk_json(value: &Value, under_media_key: bool, depth: usize, out: &mut Vec<String>) {
    if depth > 8 || out.len() >= SNIFFED_IMAGE_CAP {
        return;
    }
    match value {
        Value::String(s) => {
            if s.starts_with("http") && (looks_like_image_url(s) || under_media_key) {
                out.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_json(item, under_media_key, depth + 1, out);
            }
        }
        Value::Object(map) => {
            for (key, nested) in map {
                let media = under_media_key || is_media_key(key);
                walk_json(nested, media, depth + 1, out);
            }
        }
        _ => {}
    }
}

fn is_media_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    MEDIA_JSON_KEYS.iter().any(|k| lower.contains(k))
}

fn push_observed_image(observations: &Arc<Mutex<NetworkObservations>>, url: String) {
    if let Ok(mut obs) = observations.lock() {
        if obs.image_urls.len() < SNIFFED_IMAGE_CAP {
            obs.image_urls.push(url);
        }
    }
}

/// Engine A: chromiumoxide over CDP, with subresource blocking and
/// response-body sniffing.
pub struct ChromiumEngine {
    proxy: Option<String>,
}

impl ChromiumEngine {
    pub fn new(proxy: Option<String>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1366, 900)
            .request_timeout(CDP_REQUEST_TIMEOUT)
            .arg(format!("--user-agent={}", RENDER_USER_AGENT))
            .arg("--lang=en-US")
            .arg("--disable-blink-features=AutomationControlled");
        if let Some(proxy) = &self.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("browser config: {}", e))?;

        let (browser, mut handler) = ChromiumBrowser::launch(config).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await?;
        page.execute(EnableParams::default()).await?;
        page.execute(SetBlockedUrLsParams {
            urls: BLOCKED_RESOURCE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        })
        .await?;

        let observations = Arc::new(Mutex::new(NetworkObservations::default()));
        let mut events = page.event_listener::<EventResponseReceived>().await?;
        let sniffer_page = page.clone();
        let sniffer_observations = observations.clone();
        let sniffer_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                record_response(event.as_ref(), &sniffer_page, &sniffer_observations).await;
            }
        });

        Ok(Box::new(ChromiumSession {
            browser,
            page,
            observations,
            handler_task,
            sniffer_task,
        }))
    }
}

async fn record_response(
    event: &EventResponseReceived,
    page: &Page,
    observations: &Arc<Mutex<NetworkObservations>>,
) {
    if event.response.status == 403 {
        if let Ok(mut obs) = observations.lock() {
            obs.saw_forbidden = true;
        }
    }

    let url = event.response.url.clone();
    if looks_like_image_url(&url) {
        push_observed_image(observations, url);
        return;
    }

    let json_like = event.response.mime_type.to_lowercase().contains("json");
    let xhr_like = matches!(event.r#type, ResourceType::Xhr | ResourceType::Fetch);
    if !(json_like && xhr_like) {
        return;
    }

    let Ok(body) = page
        .execute(GetResponseBodyParams::new(event.request_id.clone()))
        .await
    else {
        return;
    };
    if body.base64_encoded {
        return;
    }
    let Ok(payload) = serde_json::from_str::<Value>(&body.body) else {
        return;
    };

    let mut found = Vec::new();
    sniff_json_for_images(&payload, &mut found);
    if let Ok(mut obs) = observations.lock() {
        for url in found {
            if obs.image_urls.len() >= SNIFFED_IMAGE_CAP {
                break;
            }
            obs.image_urls.push(url);
        }
    }
}

struct ChromiumSession {
    browser: ChromiumBrowser,
    page: Page,
    observations: Arc<Mutex<NetworkObservations>>,
    handler_task: JoinHandle<()>,
    sniffer_task: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn evaluate(&mut self, expression: &str) -> Result<Value> {
        let result = self.page.evaluate(expression).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    fn observed(&self) -> NetworkObservations {
        self.observations
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    async fn close(&mut self) -> Result<()> {
        self.sniffer_task.abort();
        if let Err(e) = self.browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        self.handler_task.abort();
        Ok(())
    }
}

/// Engine B: headless_chrome, a synchronous CDP client driven from blocking
/// tasks. Sniffs response URLs and statuses only; body inspection stays an
/// engine A capability.
pub struct ChromeEngine {
    proxy: Option<String>,
}

impl ChromeEngine {
    pub fn new(proxy: Option<String>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl RenderEngine for ChromeEngine {
    fn name(&self) -> &'static str {
        "chrome"
    }

    async fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        let proxy = self.proxy.clone();
        type ChromeParts = (ChromeBrowser, Arc<Tab>, Arc<Mutex<NetworkObservations>>);
        let (browser, tab, observations) =
            tokio::task::spawn_blocking(move || -> Result<ChromeParts> {
                let ua_arg = format!("--user-agent={}", RENDER_USER_AGENT);
                let mut builder = LaunchOptions::default_builder();
                builder
                    .headless(true)
                    .sandbox(false)
                    .window_size(Some((1366, 900)))
                    .idle_browser_timeout(Duration::from_secs(90))
                    .args(vec![
                        OsStr::new(&ua_arg),
                        OsStr::new("--lang=en-US"),
                        OsStr::new("--disable-blink-features=AutomationControlled"),
                    ]);
                if let Some(proxy) = proxy.as_deref() {
                    builder.proxy_server(Some(proxy));
                }
                let options = builder
                    .build()
                    .map_err(|e| anyhow!("launch options: {}", e))?;

                let browser = ChromeBrowser::new(options)?;
                let tab = browser.new_tab()?;
                tab.set_default_timeout(CDP_REQUEST_TIMEOUT);

                let observations = Arc::new(Mutex::new(NetworkObservations::default()));
                let sniffer_observations = observations.clone();
                let _ = tab.register_response_handling(
                    "image-sniffer",
                    Box::new(move |params, _fetch_body| {
                        if (params.response.status as i64) == 403 {
                            if let Ok(mut obs) = sniffer_observations.lock() {
                                obs.saw_forbidden = true;
                            }
                        }
                        if looks_like_image_url(&params.response.url) {
                            push_observed_image(
                                &sniffer_observations,
                                params.response.url.clone(),
                            );
                        }
                    }),
                );

                Ok((browser, tab, observations))
            })
            .await
            .map_err(|e| anyhow!("launch task failed: {}", e))??;

        Ok(Box::new(ChromeSession {
            browser: Some(browser),
            tab,
            observations,
        }))
    }
}

struct ChromeSession {
    browser: Option<ChromeBrowser>,
    tab: Arc<Tab>,
    observations: Arc<Mutex<NetworkObservations>>,
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        let tab = self.tab.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow!("navigation task failed: {}", e))?
    }

    async fn evaluate(&mut self, expression: &str) -> Result<Value> {
        let tab = self.tab.clone();
        let expression = expression.to_string();
        tokio::task::spawn_blocking(move || -> Result<Value> {
            let object = tab.evaluate(&expression, false)?;
            Ok(object.value.unwrap_or(Value::Null))
        })
        .await
        .map_err(|e| anyhow!("evaluate task failed: {}", e))?
    }

    async fn content(&mut self) -> Result<String> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || tab.get_content())
            .await
            .map_err(|e| anyhow!("content task failed: {}", e))?
    }

    fn observed(&self) -> NetworkObservations {
        self.observations
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(browser) = self.browser.take() {
            tokio::task::spawn_blocking(move || drop(browser))
                .await
                .ok();
        }
        Ok(())
    }
}
