use thiserror::Error;

/// Failure taxonomy for one scrape call.
///
/// Only `InvalidUrl` and an unescalatable `FetchBlocked` ever reach the
/// caller. `RenderFailed` and `GenerativeUnavailable` are recovered inside
/// the pipeline: a failed escalation means "no improvement", not an abort.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("fetch blocked (status {})", status_label(.status))]
    FetchBlocked { status: Option<u16> },

    #[error("render failed: {0}")]
    RenderFailed(String),

    #[error("generative fallback unavailable: {0}")]
    GenerativeUnavailable(String),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}

impl ScrapeError {
    /// Blocked statuses the AI fallback may still rescue: hard anti-bot
    /// rejections and timeouts, but not e.g. a plain 404.
    pub fn is_escalatable_block(&self) -> bool {
        match self {
            ScrapeError::FetchBlocked { status } => {
                matches!(status, Some(403) | Some(429) | Some(503) | None)
            }
            _ => false,
        }
    }
}
