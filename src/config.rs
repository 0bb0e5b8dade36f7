use std::env;
use tracing::info;

/// Engine order preference for headless rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePreference {
    Chromium,
    Chrome,
}

/// Process-level configuration, read from the environment exactly once per
/// snapshot and passed explicitly through the pipeline. Nothing re-reads the
/// environment at depth, so a scrape call sees one consistent view.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub render_enabled: bool,
    pub render_engine: EnginePreference,
    pub render_proxy: Option<String>,
    pub ai_enabled: bool,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub confidence_threshold: f64,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            render_enabled: false,
            render_engine: EnginePreference::Chromium,
            render_proxy: None,
            ai_enabled: false,
            ai_api_key: None,
            ai_model: "gemini-2.0-flash".to_string(),
            confidence_threshold: 0.55,
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        let render_enabled = flag_from_env("SCRAPE_RENDER_ENABLED");
        let render_engine = match env::var("SCRAPE_RENDER_ENGINE").ok().as_deref() {
            Some("chrome") => EnginePreference::Chrome,
            _ => EnginePreference::Chromium,
        };
        let render_proxy = env::var("SCRAPE_RENDER_PROXY").ok().filter(|v| !v.is_empty());

        let ai_api_key = env::var("GENAI_API_KEY").ok().filter(|v| !v.is_empty());
        let ai_enabled = flag_from_env("SCRAPE_AI_ENABLED") && ai_api_key.is_some();
        let ai_model =
            env::var("GENAI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string());

        let confidence_threshold = env::var("SCRAPE_CONFIDENCE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| (0.0..=1.0).contains(v))
            .unwrap_or(0.55);

        let config = Self {
            render_enabled,
            render_engine,
            render_proxy,
            ai_enabled,
            ai_api_key,
            ai_model,
            confidence_threshold,
        };

        info!(
            "Scrape config: render_enabled={}, engine={:?}, ai_enabled={}, confidence_threshold={}",
            config.render_enabled, config.render_engine, config.ai_enabled, config.confidence_threshold
        );

        config
    }
}

fn flag_from_env(name: &str) -> bool {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}
