use anyhow::anyhow;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use rand::Rng;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ScrapeError;
use crate::types::ScrapeOptions;

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const ACCESS_DENIED_MARKERS: &[&str] = &[
    "access denied",
    "access to this page has been denied",
    "captcha",
    "are you a robot",
    "unusual traffic",
    "pardon our interruption",
    "request blocked",
    "automated access",
    "bot detected",
    "verify you are human",
];

const WAF_SERVERS: &[&str] = &["cloudflare", "akamaighost", "awselb", "incapsula", "imperva"];

const INTERSTITIAL_MARKERS: &[&str] = &[
    "just a moment",
    "attention required",
    "checking your browser",
    "cf-browser-verification",
    "challenge-platform",
    "ddos protection",
    "px-captcha",
    "_incapsula_",
];

// Challenge pages are small; markers sit well within this prefix.
const MARKER_SCAN_CHARS: usize = 20_000;

/// Result of one successful static fetch. `was_challenged` is set when the
/// page only came through after the cookie-primed retry.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub html: String,
    pub status: u16,
    pub was_challenged: bool,
}

/// Direct-HTTP fetcher with a browser-like header set and a single
/// session-priming retry against the origin when a request is classified as
/// blocked.
pub struct StaticFetcher {
    client: Client,
}

impl StaticFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches the page HTML. The whole attempt, including the priming
    /// request and the retry, is bounded by `options.timeout_ms`; running
    /// out of time surfaces as a block with unknown status so the caller can
    /// still escalate.
    pub async fn fetch_html(
        &self,
        url: &Url,
        options: &ScrapeOptions,
    ) -> Result<FetchOutcome, ScrapeError> {
        let budget = Duration::from_millis(options.timeout_ms);
        match tokio::time::timeout(budget, self.fetch_inner(url, options, budget)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Fetch timed out after {}ms: {}", options.timeout_ms, url);
                Err(ScrapeError::FetchBlocked { status: None })
            }
        }
    }

    async fn fetch_inner(
        &self,
        url: &Url,
        options: &ScrapeOptions,
        budget: Duration,
    ) -> Result<FetchOutcome, ScrapeError> {
        let user_agent = random_user_agent();
        let accept_language = accept_language_for(options.locale.as_deref());
        let origin = origin_of(url);

        info!("Fetching URL: {}", url);

        let (status, server, body) = self
            .send_page_request(url, &origin, user_agent, &accept_language, None, budget)
            .await?;

        if !is_blocked(status, server.as_deref(), &body) {
            return Ok(FetchOutcome {
                html: body,
                status,
                was_challenged: false,
            });
        }

        warn!(
            "Fetch blocked for {} (status {}), priming session from origin",
            url, status
        );

        let Some(cookie) = self
            .prime_session_cookie(&origin, user_agent, &accept_language, budget)
            .await
        else {
            return Err(ScrapeError::FetchBlocked {
                status: Some(status),
            });
        };

        let (retry_status, retry_server, retry_body) = self
            .send_page_request(
                url,
                &origin,
                user_agent,
                &accept_language,
                Some(&cookie),
                budget,
            )
            .await?;

        if is_blocked(retry_status, retry_server.as_deref(), &retry_body) {
            return Err(ScrapeError::FetchBlocked {
                status: Some(retry_status),
            });
        }

        info!("Cookie-primed retry succeeded for {}", url);
        Ok(FetchOutcome {
            html: retry_body,
            status: retry_status,
            was_challenged: true,
        })
    }

    async fn send_page_request(
        &self,
        url: &Url,
        origin: &str,
        user_agent: &str,
        accept_language: &str,
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<(u16, Option<String>, String), ScrapeError> {
        let mut request = self
            .client
            .get(url.as_str())
            .timeout(timeout)
            .header("User-Agent", user_agent)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", accept_language)
            .header("Referer", origin)
            .header("DNT", "1")
            .header("Connection", "keep-alive")
            .header("Upgrade-Insecure-Requests", "1");
        if let Some(cookie) = cookie {
            request = request.header("Cookie", cookie);
        }

        let response = request.send().await.map_err(|e| {
            warn!("Request failed for {}: {}", url, e);
            ScrapeError::FetchBlocked { status: None }
        })?;

        let status = response.status().as_u16();
        let server = response
            .headers()
            .get("server")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_lowercase());
        let body = response.text().await.map_err(|e| {
            warn!("Failed to read response body for {}: {}", url, e);
            ScrapeError::FetchBlocked { status: None }
        })?;

        Ok((status, server, body))
    }

    /// Best-effort refetch for the blocked escalation path, purely to obtain
    /// HTML for the model after the primary fetch already failed. Plain GET
    /// with exponential backoff; 5xx and transport errors retry, everything
    /// else is returned as-is.
    pub async fn fetch_basic(&self, url: &Url) -> Option<String> {
        let client = self.client.clone();
        let target = url.to_string();
        let result: Result<String, anyhow::Error> = retry(
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(500))
                .with_multiplier(2.0)
                .with_max_interval(Duration::from_secs(2))
                .with_max_elapsed_time(Some(Duration::from_secs(4)))
                .build(),
            || async {
                let response = client
                    .get(&target)
                    .header("User-Agent", random_user_agent())
                    .header(
                        "Accept",
                        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        backoff::Error::transient(anyhow!("secondary fetch failed: {}", e))
                    })?;
                if response.status().is_server_error() {
                    return Err(backoff::Error::transient(anyhow!(
                        "secondary fetch got {}",
                        response.status()
                    )));
                }
                response.text().await.map_err(|e| {
                    backoff::Error::transient(anyhow!("secondary fetch body read failed: {}", e))
                })
            },
        )
        .await;

        match result {
            Ok(html) => Some(html),
            Err(e) => {
                warn!("Secondary fetch gave up for {}: {}", url, e);
                None
            }
        }
    }

    /// GETs the origin root and folds its `Set-Cookie` headers into one
    /// `Cookie` header value.
    async fn prime_session_cookie(
        &self,
        origin: &str,
        user_agent: &str,
        accept_language: &str,
        timeout: Duration,
    ) -> Option<String> {
        let response = self
            .client
            .get(origin)
            .timeout(timeout)
            .header("User-Agent", user_agent)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", accept_language)
            .send()
            .await
            .ok()?;

        let cookie = fold_cookies(
            response
                .headers()
                .get_all(reqwest::header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        match &cookie {
            Some(c) => debug!("Primed session cookie from {}: {} bytes", origin, c.len()),
            None => debug!("Origin {} set no cookies", origin),
        }
        cookie
    }
}

fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
}

fn accept_language_for(locale: Option<&str>) -> String {
    match locale {
        Some(locale) if !locale.trim().is_empty() => {
            let primary = locale.split(['-', '_']).next().unwrap_or(locale);
            format!("{},{};q=0.8,en;q=0.5", locale, primary)
        }
        _ => "en-US,en;q=0.5".to_string(),
    }
}

/// Origin root of a URL, used as Referer, as the cookie-priming target, and
/// as the friction-reducing first stop of a headless render.
pub(crate) fn origin_of(url: &Url) -> String {
    let mut origin = format!("{}://", url.scheme());
    if let Some(host) = url.host_str() {
        origin.push_str(host);
    }
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{}", port));
    }
    origin.push('/');
    origin
}

/// Block classification: non-success status, an access-denied marker, or a
/// WAF-identified server paired with an interstitial-challenge marker.
fn is_blocked(status: u16, server: Option<&str>, body: &str) -> bool {
    if !(200..300).contains(&status) {
        return true;
    }

    let prefix = marker_prefix(body).to_lowercase();
    if ACCESS_DENIED_MARKERS.iter().any(|m| prefix.contains(m)) {
        return true;
    }

    let waf = server
        .map(|s| WAF_SERVERS.iter().any(|w| s.contains(w)))
        .unwrap_or(false);
    waf && INTERSTITIAL_MARKERS.iter().any(|m| prefix.contains(m))
}

fn marker_prefix(body: &str) -> &str {
    if body.len() <= MARKER_SCAN_CHARS {
        return body;
    }
    let mut end = MARKER_SCAN_CHARS;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

fn fold_cookies<'a, I>(values: I) -> Option<String>
where
    I: Iterator<Item = &'a str>,
{
    let pairs: Vec<String> = values
        .filter_map(|v| v.split(';').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s.contains('='))
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response_is_not_blocked() {
        assert!(!is_blocked(200, None, "<html><h1>Product</h1></html>"));
        assert!(!is_blocked(204, Some("cloudflare"), ""));
    }

    #[test]
    fn test_non_success_status_is_blocked() {
        assert!(is_blocked(403, None, "<html>Forbidden</html>"));
        assert!(is_blocked(429, None, ""));
        assert!(is_blocked(503, None, ""));
        assert!(is_blocked(301, None, ""));
    }

    #[test]
    fn test_access_denied_marker_blocks_despite_200() {
        assert!(is_blocked(200, None, "<html><body>Access Denied</body></html>"));
        assert!(is_blocked(200, None, "Please verify you are human to continue"));
    }

    #[test]
    fn test_interstitial_needs_waf_server() {
        let body = "<title>Just a moment...</title>";
        assert!(is_blocked(200, Some("cloudflare"), body));
        // The same body without a WAF server header is a legitimate page.
        assert!(!is_blocked(200, None, body));
        assert!(!is_blocked(200, Some("nginx"), body));
    }

    #[test]
    fn test_waf_server_alone_is_not_blocked() {
        assert!(!is_blocked(200, Some("cloudflare"), "<html>ordinary page</html>"));
    }

    #[test]
    fn test_origin_of() {
        let url = Url::parse("https://shop.example.com/products/1?ref=home").unwrap();
        assert_eq!(origin_of(&url), "https://shop.example.com/");

        let url = Url::parse("http://localhost:8080/p/2").unwrap();
        assert_eq!(origin_of(&url), "http://localhost:8080/");
    }

    #[test]
    fn test_accept_language() {
        assert_eq!(accept_language_for(None), "en-US,en;q=0.5");
        assert_eq!(accept_language_for(Some("de-DE")), "de-DE,de;q=0.8,en;q=0.5");
        assert_eq!(accept_language_for(Some("nl")), "nl,nl;q=0.8,en;q=0.5");
    }

    #[test]
    fn test_fold_cookies() {
        let cookie = fold_cookies(
            vec![
                "session=abc123; Path=/; HttpOnly",
                "region=eu; Secure",
                "malformed",
            ]
            .into_iter(),
        );
        assert_eq!(cookie.as_deref(), Some("session=abc123; region=eu"));

        assert_eq!(fold_cookies(Vec::<&str>::new().into_iter()), None);
    }

    #[test]
    fn test_marker_prefix_respects_char_boundaries() {
        let body = "é".repeat(MARKER_SCAN_CHARS);
        let prefix = marker_prefix(&body);
        assert!(prefix.len() <= MARKER_SCAN_CHARS);
        assert!(!prefix.is_empty());
    }

    #[test]
    fn test_user_agent_pool() {
        let ua = random_user_agent();
        assert!(ua.starts_with("Mozilla/5.0"));
    }
}
