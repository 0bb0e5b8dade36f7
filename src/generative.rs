use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ScrapeConfig;
use crate::error::ScrapeError;
use crate::types::ProductDraft;

const GENAI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// HTML beyond this is cut before being sent to the model.
const MAX_HTML_CHARS: usize = 120_000;

/// The model is asked for at most this many image URLs.
pub const MAX_AI_IMAGES: usize = 10;

// Models habitually leave a trailing comma before a closing brace/bracket.
static TRAILING_COMMAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").unwrap());

/// Last-resort extractor backed by a generative model. Always yields a
/// draft; transport and parse failures degrade to an empty one.
pub struct GenerativeExtractor {
    client: Client,
    api_key: String,
    model: String,
}

impl GenerativeExtractor {
    /// None when the fallback is disabled or no API key is configured.
    pub fn from_config(client: Client, config: &ScrapeConfig) -> Option<Self> {
        if !config.ai_enabled {
            return None;
        }
        let api_key = config.ai_api_key.clone()?;
        Some(Self {
            client,
            api_key,
            model: config.ai_model.clone(),
        })
    }

    /// Asks the model for title/price/currency/brand/images from an HTML
    /// excerpt.
    /// Never fails outward: anything going wrong returns an empty draft.
    pub async fn extract(&self, html: &str, url: &Url) -> ProductDraft {
        match self.request_extraction(html, url).await {
            Ok(draft) => {
                info!(
                    "Model extraction for {}: title={} price={} images={}",
                    url,
                    draft.title.is_some(),
                    draft.price_raw.is_some(),
                    draft.images.len()
                );
                draft
            }
            Err(e) => {
                warn!("Model extraction failed for {}: {}", url, e);
                ProductDraft::default()
            }
        }
    }

    async fn request_extraction(
        &self,
        html: &str,
        url: &Url,
    ) -> Result<ProductDraft, ScrapeError> {
        let excerpt = bounded_excerpt(html, MAX_HTML_CHARS);
        let endpoint = format!(
            "{}/{}:generateContent?key={}",
            GENAI_ENDPOINT, self.model, self.api_key
        );

        let response = self
            .client
            .post(&endpoint)
            .json(&request_body(&extraction_prompt(url, excerpt)))
            .send()
            .await
            .map_err(|e| ScrapeError::GenerativeUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::GenerativeUnavailable(format!(
                "model endpoint returned {}",
                status
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ScrapeError::GenerativeUnavailable(e.to_string()))?;
        let text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                ScrapeError::GenerativeUnavailable("response carried no text part".to_string())
            })?;

        Ok(parse_model_reply(text))
    }
}

fn extraction_prompt(url: &Url, excerpt: &str) -> String {
    format!(
        "You extract product data from e-commerce HTML.\n\
         Return JSON with exactly these fields: title, price, currency, brand, images.\n\
         - title: the product name, or null.\n\
         - price: the current price as a plain decimal string, or null.\n\
         - currency: the ISO 4217 code if identifiable, or null.\n\
         - brand: the product's brand or manufacturer name, or null.\n\
         - images: up to {} absolute product image URLs. Exclude logos, banners, \
         placeholders, icons, and videos.\n\
         Page URL: {}\n\
         HTML:\n{}",
        MAX_AI_IMAGES, url, excerpt
    )
}

fn request_body(prompt: &str) -> Value {
    json!({
        "contents": [{"parts": [{"text": prompt}]}],
        "generationConfig": {
            "temperature": 0.1,
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "OBJECT",
                "properties": {
                    "title": {"type": "STRING", "nullable": true},
                    "price": {"type": "STRING", "nullable": true},
                    "currency": {"type": "STRING", "nullable": true},
                    "brand": {"type": "STRING", "nullable": true},
                    "images": {"type": "ARRAY", "items": {"type": "STRING"}}
                }
            }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct ModelReply {
    title: Option<String>,
    /// Accepts both `"29.95"` and `29.95`; schema notwithstanding, models
    /// sometimes return numbers.
    price: Option<Value>,
    currency: Option<String>,
    brand: Option<String>,
    #[serde(default)]
    images: Vec<String>,
}

/// Parses the model's reply into a draft. Missing keys and malformed JSON
/// both degrade to an empty draft.
fn parse_model_reply(text: &str) -> ProductDraft {
    let stripped = strip_code_fences(text);
    let repaired = TRAILING_COMMAS.replace_all(stripped, "$1");

    let reply: ModelReply = match serde_json::from_str(&repaired) {
        Ok(reply) => reply,
        Err(e) => {
            debug!("Model reply did not parse as JSON: {}", e);
            return ProductDraft::default();
        }
    };

    ProductDraft {
        title: reply
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        price_raw: reply.price.and_then(price_to_raw),
        currency: reply
            .currency
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty()),
        brand: reply
            .brand
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty()),
        images: reply
            .images
            .into_iter()
            .filter(|u| u.starts_with("http"))
            .take(MAX_AI_IMAGES)
            .collect(),
        ..Default::default()
    }
}

fn price_to_raw(value: Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim().to_string();
            (trimmed.chars().any(|c| c.is_ascii_digit())).then_some(trimmed)
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line ("```json" or bare "```") and the closing fence.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.trim_end().trim_end_matches("```").trim()
}

/// Byte-bounded prefix that never splits a UTF-8 character.
fn bounded_excerpt(html: &str, max: usize) -> &str {
    if html.len() <= max {
        return html;
    }
    let mut end = max;
    while !html.is_char_boundary(end) {
        end -= 1;
    }
    &html[..end]
}
