use std::env;
use std::time::Instant;
use tracing::info;

use product_scrape::telemetry::{self, TelemetrySink, TracingSink};
use product_scrape::{ScrapeConfig, ScrapeOptions, Scraper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let url = env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: product-scrape <product-url>"))?;

    let config = ScrapeConfig::from_env();
    info!("Starting product scrape");
    info!("Headless rendering enabled: {}", config.render_enabled);
    info!("AI fallback enabled: {}", config.ai_enabled);

    let scraper = Scraper::new(config);
    let started = Instant::now();
    let outcome = scraper.scrape(&url, ScrapeOptions::default()).await;
    TracingSink.record(&telemetry::telemetry_for(&url, started.elapsed(), &outcome));

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
