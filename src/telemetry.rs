use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ScrapeError;
use crate::types::{ExtractResult, Source};

/// One per-call telemetry record, assembled by the caller after `scrape`
/// returns. Persistence belongs to the embedding service; this crate only
/// defines the record and a logging sink.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeTelemetry {
    pub id: String,
    pub url: String,
    pub outcome: &'static str,
    pub elapsed_ms: u64,
    pub source: Option<Source>,
    pub confidence: Option<f64>,
    pub blocked_status: Option<u16>,
    pub finished_at: DateTime<Utc>,
}

/// Fire-and-forget sink. Implementations must never fail the scrape.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, telemetry: &ScrapeTelemetry);
}

/// Default sink that emits the record as one structured log line.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, telemetry: &ScrapeTelemetry) {
        match serde_json::to_string(telemetry) {
            Ok(line) => info!("Scrape telemetry: {}", line),
            Err(e) => warn!("Failed to serialize telemetry record: {}", e),
        }
    }
}

/// Builds the record for one finished call.
pub fn telemetry_for(
    url: &str,
    elapsed: Duration,
    outcome: &Result<ExtractResult, ScrapeError>,
) -> ScrapeTelemetry {
    let (label, source, confidence, blocked_status) = match outcome {
        Ok(result) => ("ok", Some(result.source), Some(result.confidence), None),
        Err(ScrapeError::InvalidUrl(_)) => ("invalid-url", None, None, None),
        Err(ScrapeError::FetchBlocked { status }) => ("blocked", None, None, *status),
        Err(_) => ("error", None, None, None),
    };

    ScrapeTelemetry {
        id: Uuid::new_v4().to_string(),
        url: url.to_string(),
        outcome: label,
        elapsed_ms: elapsed.as_millis() as u64,
        source,
        confidence,
        blocked_status,
        finished_at: Utc::now(),
    }
}
