use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ScrapeConfig;
use crate::error::ScrapeError;
use crate::fetch::{FetchOutcome, StaticFetcher};
use crate::generative::GenerativeExtractor;
use crate::normalize::{self, MAX_IMAGES};
use crate::render::{self, HeadlessRenderer, RenderedExtraction};
use crate::types::{confidence, ExtractResult, ProductDraft, ScrapeOptions, Source};
use crate::waterfall::{self, fill_and_track};

/// Pipeline stages of one scrape call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Fetching,
    Extracting,
    EscalatingHeadless,
    EscalatingAi,
    Normalizing,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Validating => "validating",
            Stage::Fetching => "fetching",
            Stage::Extracting => "extracting",
            Stage::EscalatingHeadless => "escalating(headless)",
            Stage::EscalatingAi => "escalating(ai)",
            Stage::Normalizing => "normalizing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Which escalation tier follows the static waterfall. At most one tier runs
/// per call; headless rendering outranks the model when both would apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    None,
    Headless,
    Generative,
}

/// Pure transition decision, kept separate from the I/O so the policy is
/// testable on its own.
pub fn decide_escalation(
    draft_complete: bool,
    score: f64,
    price_missing: bool,
    render_available: bool,
    ai_available: bool,
    threshold: f64,
) -> Escalation {
    if !draft_complete && render_available {
        return Escalation::Headless;
    }
    if ai_available && (score < threshold || price_missing) {
        return Escalation::Generative;
    }
    Escalation::None
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_html(
        &self,
        url: &Url,
        options: &ScrapeOptions,
    ) -> Result<FetchOutcome, ScrapeError>;

    /// Plain best-effort GET, used only to obtain HTML for the model after
    /// the primary fetch was blocked.
    async fn fetch_html_basic(&self, url: &Url) -> Option<String>;
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render_and_extract(&self, url: &Url) -> Option<RenderedExtraction>;
}

#[async_trait]
pub trait DraftExtractor: Send + Sync {
    async fn extract(&self, html: &str, url: &Url) -> ProductDraft;
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch_html(
        &self,
        url: &Url,
        options: &ScrapeOptions,
    ) -> Result<FetchOutcome, ScrapeError> {
        StaticFetcher::fetch_html(self, url, options).await
    }

    async fn fetch_html_basic(&self, url: &Url) -> Option<String> {
        self.fetch_basic(url).await
    }
}

#[async_trait]
impl PageRenderer for HeadlessRenderer {
    async fn render_and_extract(&self, url: &Url) -> Option<RenderedExtraction> {
        HeadlessRenderer::render_and_extract(self, url).await
    }
}

#[async_trait]
impl DraftExtractor for GenerativeExtractor {
    async fn extract(&self, html: &str, url: &Url) -> ProductDraft {
        GenerativeExtractor::extract(self, html, url).await
    }
}

/// The product scrape pipeline: validate, fetch, extract, escalate at most
/// once, normalize.
pub struct Scraper {
    config: ScrapeConfig,
    fetcher: Arc<dyn PageFetcher>,
    renderer: Option<Arc<dyn PageRenderer>>,
    generative: Option<Arc<dyn DraftExtractor>>,
}

impl Scraper {
    pub fn new(config: ScrapeConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(Policy::limited(10))
            .build()
            .expect("Failed to create HTTP client");

        let fetcher: Arc<dyn PageFetcher> = Arc::new(StaticFetcher::new(client.clone()));
        let renderer: Option<Arc<dyn PageRenderer>> = config
            .render_enabled
            .then(|| Arc::new(HeadlessRenderer::from_config(&config)) as Arc<dyn PageRenderer>);
        let generative: Option<Arc<dyn DraftExtractor>> =
            GenerativeExtractor::from_config(client, &config)
                .map(|g| Arc::new(g) as Arc<dyn DraftExtractor>);

        Self {
            config,
            fetcher,
            renderer,
            generative,
        }
    }

    /// Constructor with injectable stages.
    pub fn with_stages(
        config: ScrapeConfig,
        fetcher: Arc<dyn PageFetcher>,
        renderer: Option<Arc<dyn PageRenderer>>,
        generative: Option<Arc<dyn DraftExtractor>>,
    ) -> Self {
        Self {
            config,
            fetcher,
            renderer,
            generative,
        }
    }

    /// Runs one scrape. Only an invalid URL or an unescalatable block fail;
    /// every other degradation is absorbed into the result.
    pub async fn scrape(
        &self,
        raw_url: &str,
        options: ScrapeOptions,
    ) -> Result<ExtractResult, ScrapeError> {
        let mut stage = Stage::Validating;
        let url = validate_url(raw_url)?;
        info!("Scraping product URL: {}", url);

        advance(&mut stage, Stage::Fetching, &url);
        let ai_available = self.ai_available(&options);

        let fetched = match self.fetcher.fetch_html(&url, &options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if ai_available && e.is_escalatable_block() {
                    advance(&mut stage, Stage::EscalatingAi, &url);
                    let result = self.blocked_escalation(&url, &e, &options, &mut stage).await;
                    advance(&mut stage, Stage::Done, &url);
                    return Ok(result);
                }
                advance(&mut stage, Stage::Failed, &url);
                warn!("Fetch failed for {} without an escalation path: {}", url, e);
                return Err(e);
            }
        };

        advance(&mut stage, Stage::Extracting, &url);
        let outcome = waterfall::extract(&fetched.html, &url);
        let mut draft = outcome.draft;
        let mut source = outcome.source;
        let mut notes = Vec::new();
        if fetched.was_challenged {
            notes.push("fetch:cookie-retry".to_string());
        }

        let pre_score = draft_confidence(&draft);
        let price_missing = draft
            .price_raw
            .as_deref()
            .and_then(normalize::parse_price)
            .is_none();

        let escalation = decide_escalation(
            draft.is_complete(),
            pre_score,
            price_missing,
            self.render_available(&url),
            ai_available,
            self.config.confidence_threshold,
        );

        match escalation {
            Escalation::Headless => {
                advance(&mut stage, Stage::EscalatingHeadless, &url);
                // Renderer presence is part of render_available.
                if let Some(renderer) = &self.renderer {
                    match renderer.render_and_extract(&url).await {
                        Some(rendered) => {
                            notes.push(format!("headless:{}", rendered.engine));
                            if rendered.saw_forbidden {
                                notes.push("headless:403-observed".to_string());
                            }
                            if fill_and_track(&mut draft, rendered.draft) {
                                source = Source::Rendered;
                            }
                        }
                        None => notes.push("headless:no-improvement".to_string()),
                    }
                }
            }
            Escalation::Generative => {
                advance(&mut stage, Stage::EscalatingAi, &url);
                if let Some(generative) = &self.generative {
                    let model_draft = generative.extract(&fetched.html, &url).await;
                    notes.push("ai:fallback".to_string());
                    if fill_and_track(&mut draft, model_draft) {
                        source = Source::Generative;
                    }
                }
            }
            Escalation::None => {}
        }

        advance(&mut stage, Stage::Normalizing, &url);
        let result = finalize(&url, draft, source, notes, pre_score, &options);
        advance(&mut stage, Stage::Done, &url);
        Ok(result)
    }

    /// The fetch-was-blocked path: best-effort secondary fetch, model
    /// extraction, and a result that records the blocking status.
    async fn blocked_escalation(
        &self,
        url: &Url,
        error: &ScrapeError,
        options: &ScrapeOptions,
        stage: &mut Stage,
    ) -> ExtractResult {
        let mut notes = vec![blocked_note(error)];

        let draft = match self.fetcher.fetch_html_basic(url).await {
            Some(html) => match &self.generative {
                Some(generative) => {
                    notes.push("ai:fallback".to_string());
                    generative.extract(&html, url).await
                }
                None => ProductDraft::default(),
            },
            None => {
                debug!("No HTML could be obtained for the model after block");
                ProductDraft::default()
            }
        };

        let source = if draft.title.is_some()
            || draft.price_raw.is_some()
            || !draft.images.is_empty()
        {
            Source::Generative
        } else {
            Source::Dom
        };

        advance(stage, Stage::Normalizing, url);
        finalize(url, draft, source, notes, 0.0, options)
    }

    fn ai_available(&self, options: &ScrapeOptions) -> bool {
        // The per-call flag can only switch the fallback off; it cannot
        // enable a fallback the operator has not configured.
        self.generative.is_some() && options.ai_enabled != Some(false)
    }

    fn render_available(&self, url: &Url) -> bool {
        self.config.render_enabled
            && self.renderer.is_some()
            && render::host_requires_rendering(url)
    }
}

fn advance(stage: &mut Stage, next: Stage, url: &Url) {
    debug!("Stage {} -> {} for {}", stage, next, url);
    *stage = next;
}

fn validate_url(raw: &str) -> Result<Url, ScrapeError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| ScrapeError::InvalidUrl(format!("'{}': {}", trimmed, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ScrapeError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(ScrapeError::InvalidUrl("missing host".to_string()));
    }
    Ok(url)
}

fn blocked_note(error: &ScrapeError) -> String {
    match error {
        ScrapeError::FetchBlocked {
            status: Some(code),
        } => format!("blocked:{}", code),
        _ => "blocked:unknown".to_string(),
    }
}

fn draft_confidence(draft: &ProductDraft) -> f64 {
    confidence(
        draft.title.as_deref(),
        draft.price_raw.as_deref().and_then(normalize::parse_price),
        draft.images.len(),
    )
}

/// Normalization stage: canonical price, currency resolution, image
/// re-validation, and the final confidence as the max of pre- and
/// post-escalation scores.
fn finalize(
    url: &Url,
    draft: ProductDraft,
    source: Source,
    notes: Vec<String>,
    pre_score: f64,
    options: &ScrapeOptions,
) -> ExtractResult {
    let price_raw = draft
        .price_raw
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    let price = price_raw.as_deref().and_then(normalize::parse_price);

    let currency = draft
        .currency
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .or_else(|| {
            price_raw
                .as_deref()
                .and_then(normalize::detect_currency)
                .map(str::to_string)
        })
        .or_else(|| {
            options
                .currency_hint
                .as_deref()
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
        });

    let images = normalize::collect_images(draft.images, url, MAX_IMAGES);

    let title = draft
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let post_score = confidence(title.as_deref(), price, images.len());

    ExtractResult {
        url: url.to_string(),
        title,
        price_raw,
        price,
        currency,
        brand: draft.brand.map(|b| b.trim().to_string()).filter(|b| !b.is_empty()),
        description: draft
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
        images,
        source,
        confidence: pre_score.max(post_score),
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const JSONLD_PAGE: &str = r#"<html><head>
        <script type="application/ld+json">
        {"@type": "Product", "name": "Test Shirt",
         "image": "https://cdn.example.com/images/shirt.jpg",
         "offers": {"price": "29.95", "priceCurrency": "EUR"}}
        </script></head><body></body></html>"#;

    enum FetchScript {
        Ok { html: &'static str, challenged: bool },
        Blocked(Option<u16>),
    }

    struct FakeFetcher {
        script: FetchScript,
        basic_html: Option<&'static str>,
        fetch_calls: AtomicUsize,
        basic_calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn ok(html: &'static str) -> Self {
            Self {
                script: FetchScript::Ok {
                    html,
                    challenged: false,
                },
                basic_html: None,
                fetch_calls: AtomicUsize::new(0),
                basic_calls: AtomicUsize::new(0),
            }
        }

        fn blocked(status: Option<u16>, basic_html: Option<&'static str>) -> Self {
            Self {
                script: FetchScript::Blocked(status),
                basic_html,
                fetch_calls: AtomicUsize::new(0),
                basic_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch_html(
            &self,
            _url: &Url,
            _options: &ScrapeOptions,
        ) -> Result<FetchOutcome, ScrapeError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                FetchScript::Ok { html, challenged } => Ok(FetchOutcome {
                    html: html.to_string(),
                    status: 200,
                    was_challenged: *challenged,
                }),
                FetchScript::Blocked(status) => {
                    Err(ScrapeError::FetchBlocked { status: *status })
                }
            }
        }

        async fn fetch_html_basic(&self, _url: &Url) -> Option<String> {
            self.basic_calls.fetch_add(1, Ordering::SeqCst);
            self.basic_html.map(str::to_string)
        }
    }

    struct FakeRenderer {
        extraction: Option<RenderedExtraction>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageRenderer for FakeRenderer {
        async fn render_and_extract(&self, _url: &Url) -> Option<RenderedExtraction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.extraction.clone()
        }
    }

    struct FakeGenerative {
        draft: ProductDraft,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DraftExtractor for FakeGenerative {
        async fn extract(&self, _html: &str, _url: &Url) -> ProductDraft {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.draft.clone()
        }
    }

    fn test_config() -> ScrapeConfig {
        let mut config = ScrapeConfig::default();
        config.render_enabled = true;
        config.ai_enabled = true;
        config
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_any_fetch() {
        let fetcher = Arc::new(FakeFetcher::ok(JSONLD_PAGE));
        let scraper =
            Scraper::with_stages(test_config(), fetcher.clone(), None, None);

        let err = scraper
            .scrape("not a url", ScrapeOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ScrapeError::InvalidUrl(_)));
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 0);

        let err = scraper
            .scrape("ftp://example.com/x", ScrapeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_complete_static_result_does_not_escalate() {
        let fetcher = Arc::new(FakeFetcher::ok(JSONLD_PAGE));
        let renderer = Arc::new(FakeRenderer {
            extraction: None,
            calls: AtomicUsize::new(0),
        });
        let generative = Arc::new(FakeGenerative {
            draft: ProductDraft::default(),
            calls: AtomicUsize::new(0),
        });
        let scraper = Scraper::with_stages(
            test_config(),
            fetcher,
            Some(renderer.clone()),
            Some(generative.clone()),
        );

        let result = scraper
            .scrape("https://www.zalando.de/p/1", ScrapeOptions::default())
            .await
            .unwrap();

        assert_eq!(result.title.as_deref(), Some("Test Shirt"));
        assert_eq!(result.price, Some(29.95));
        assert_eq!(result.currency.as_deref(), Some("EUR"));
        assert_eq!(result.images, vec!["https://cdn.example.com/images/shirt.jpg"]);
        assert_eq!(result.source, Source::Structured);
        assert_eq!(result.confidence, 1.0);
        // Complete results escalate nowhere, even on an allow-listed host.
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(generative.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blocked_without_ai_fails() {
        let fetcher = Arc::new(FakeFetcher::blocked(Some(403), None));
        let scraper = Scraper::with_stages(test_config(), fetcher, None, None);

        let err = scraper
            .scrape("https://shop.example.com/p/1", ScrapeOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ScrapeError::FetchBlocked { status: Some(403) }
        ));
    }

    #[tokio::test]
    async fn test_blocked_with_ai_yields_generative_result() {
        let fetcher = Arc::new(FakeFetcher::blocked(
            Some(403),
            Some("<html>refetched</html>"),
        ));
        let generative = Arc::new(FakeGenerative {
            draft: ProductDraft {
                title: Some("Rescued Product".to_string()),
                price_raw: Some("12.50".to_string()),
                images: vec!["https://cdn.example.com/media/r.jpg".to_string()],
                ..Default::default()
            },
            calls: AtomicUsize::new(0),
        });
        let scraper = Scraper::with_stages(
            test_config(),
            fetcher.clone(),
            None,
            Some(generative.clone()),
        );

        let result = scraper
            .scrape("https://shop.example.com/p/1", ScrapeOptions::default())
            .await
            .unwrap();

        assert_eq!(result.source, Source::Generative);
        assert_eq!(result.title.as_deref(), Some("Rescued Product"));
        assert_eq!(result.price, Some(12.5));
        assert!(result.notes.iter().any(|n| n == "blocked:403"));
        assert_eq!(fetcher.basic_calls.load(Ordering::SeqCst), 1);
        assert_eq!(generative.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocked_with_empty_model_reply_is_dom_sourced() {
        let fetcher =
            Arc::new(FakeFetcher::blocked(None, Some("<html>challenge</html>")));
        let generative = Arc::new(FakeGenerative {
            draft: ProductDraft::default(),
            calls: AtomicUsize::new(0),
        });
        let scraper =
            Scraper::with_stages(test_config(), fetcher, None, Some(generative));

        let result = scraper
            .scrape("https://shop.example.com/p/1", ScrapeOptions::default())
            .await
            .unwrap();

        assert_eq!(result.source, Source::Dom);
        assert!(result.title.is_none());
        assert_eq!(result.confidence, 0.0);
        assert!(result.notes.iter().any(|n| n == "blocked:unknown"));
    }

    #[tokio::test]
    async fn test_unescalatable_status_fails_even_with_ai() {
        let fetcher = Arc::new(FakeFetcher::blocked(Some(404), Some("<html></html>")));
        let generative = Arc::new(FakeGenerative {
            draft: ProductDraft::default(),
            calls: AtomicUsize::new(0),
        });
        let scraper = Scraper::with_stages(
            test_config(),
            fetcher,
            None,
            Some(generative.clone()),
        );

        let err = scraper
            .scrape("https://shop.example.com/p/1", ScrapeOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ScrapeError::FetchBlocked { status: Some(404) }
        ));
        assert_eq!(generative.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_incomplete_draft_on_allow_listed_host_renders() {
        // Static page with price and image but no title.
        let page = r#"<html><head>
            <meta property="og:image" content="https://cdn.example.com/media/p.jpg">
            </head><body><span class="price">49.99</span></body></html>"#;
        let fetcher = Arc::new(FakeFetcher::ok(page));
        let renderer = Arc::new(FakeRenderer {
            extraction: Some(RenderedExtraction {
                draft: ProductDraft {
                    title: Some("Rendered Title".to_string()),
                    ..Default::default()
                },
                engine: "chromium",
                saw_forbidden: true,
            }),
            calls: AtomicUsize::new(0),
        });
        let generative = Arc::new(FakeGenerative {
            draft: ProductDraft::default(),
            calls: AtomicUsize::new(0),
        });
        let scraper = Scraper::with_stages(
            test_config(),
            fetcher,
            Some(renderer.clone()),
            Some(generative.clone()),
        );

        let result = scraper
            .scrape("https://www.zalando.de/p/1", ScrapeOptions::default())
            .await
            .unwrap();

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.title.as_deref(), Some("Rendered Title"));
        assert_eq!(result.price, Some(49.99));
        assert_eq!(result.source, Source::Rendered);
        assert_eq!(result.confidence, 1.0);
        assert!(result.notes.iter().any(|n| n == "headless:chromium"));
        assert!(result.notes.iter().any(|n| n == "headless:403-observed"));
        // One tier only: the model is never consulted after a render.
        assert_eq!(generative.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_render_does_not_cascade_to_ai() {
        let page = r#"<html><body><p>nothing here</p></body></html>"#;
        let fetcher = Arc::new(FakeFetcher::ok(page));
        let renderer = Arc::new(FakeRenderer {
            extraction: None,
            calls: AtomicUsize::new(0),
        });
        let generative = Arc::new(FakeGenerative {
            draft: ProductDraft {
                title: Some("Should Not Appear".to_string()),
                ..Default::default()
            },
            calls: AtomicUsize::new(0),
        });
        let scraper = Scraper::with_stages(
            test_config(),
            fetcher,
            Some(renderer.clone()),
            Some(generative.clone()),
        );

        let result = scraper
            .scrape("https://www.zalando.de/p/1", ScrapeOptions::default())
            .await
            .unwrap();

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(generative.calls.load(Ordering::SeqCst), 0);
        assert!(result.notes.iter().any(|n| n == "headless:no-improvement"));
        assert!(result.title.is_none());
    }

    #[tokio::test]
    async fn test_low_confidence_off_allow_list_goes_generative() {
        let page = r#"<html><body><h1>Lonely Title Only</h1></body></html>"#;
        let fetcher = Arc::new(FakeFetcher::ok(page));
        let generative = Arc::new(FakeGenerative {
            draft: ProductDraft {
                price_raw: Some("7.99".to_string()),
                images: vec!["https://cdn.example.com/media/g.jpg".to_string()],
                ..Default::default()
            },
            calls: AtomicUsize::new(0),
        });
        let scraper = Scraper::with_stages(
            test_config(),
            fetcher,
            None,
            Some(generative.clone()),
        );

        let result = scraper
            .scrape("https://shop.example.com/p/1", ScrapeOptions::default())
            .await
            .unwrap();

        assert_eq!(generative.calls.load(Ordering::SeqCst), 1);
        // Static title survives the fill-gaps merge.
        assert_eq!(result.title.as_deref(), Some("Lonely Title Only"));
        assert_eq!(result.price, Some(7.99));
        assert_eq!(result.source, Source::Generative);
        assert!(result.notes.iter().any(|n| n == "ai:fallback"));
    }

    #[tokio::test]
    async fn test_per_call_flag_disables_ai() {
        let page = r#"<html><body><h1>Lonely Title Only</h1></body></html>"#;
        let fetcher = Arc::new(FakeFetcher::ok(page));
        let generative = Arc::new(FakeGenerative {
            draft: ProductDraft::default(),
            calls: AtomicUsize::new(0),
        });
        let scraper = Scraper::with_stages(
            test_config(),
            fetcher,
            None,
            Some(generative.clone()),
        );

        let options = ScrapeOptions {
            ai_enabled: Some(false),
            ..Default::default()
        };
        let result = scraper
            .scrape("https://shop.example.com/p/1", options)
            .await
            .unwrap();

        assert_eq!(generative.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.source, Source::Dom);
    }

    #[tokio::test]
    async fn test_cookie_retry_is_noted() {
        let fetcher = Arc::new(FakeFetcher {
            script: FetchScript::Ok {
                html: JSONLD_PAGE,
                challenged: true,
            },
            basic_html: None,
            fetch_calls: AtomicUsize::new(0),
            basic_calls: AtomicUsize::new(0),
        });
        let scraper = Scraper::with_stages(test_config(), fetcher, None, None);

        let result = scraper
            .scrape("https://shop.example.com/p/1", ScrapeOptions::default())
            .await
            .unwrap();

        assert!(result.notes.iter().any(|n| n == "fetch:cookie-retry"));
    }

    #[test]
    fn test_escalation_decision_table() {
        // Headless outranks the model when both would fire.
        assert_eq!(
            decide_escalation(false, 0.1, true, true, true, 0.55),
            Escalation::Headless
        );
        assert_eq!(
            decide_escalation(false, 0.1, true, false, true, 0.55),
            Escalation::Generative
        );
        // Complete and confident: no escalation.
        assert_eq!(
            decide_escalation(true, 1.0, false, true, true, 0.55),
            Escalation::None
        );
        // Complete but below threshold still goes to the model.
        assert_eq!(
            decide_escalation(true, 0.5, false, true, true, 0.55),
            Escalation::Generative
        );
        // Price missing alone triggers the model even above threshold.
        assert_eq!(
            decide_escalation(true, 0.6, true, false, true, 0.55),
            Escalation::Generative
        );
        // Nothing available: degrade quietly.
        assert_eq!(
            decide_escalation(false, 0.0, true, false, false, 0.55),
            Escalation::None
        );
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://shop.example.com/p/1").is_ok());
        assert!(validate_url("  http://shop.example.com  ").is_ok());
        assert!(validate_url("example.com/p/1").is_err());
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("").is_err());
    }
}
