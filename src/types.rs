use serde::{Deserialize, Serialize};

/// Final output contract of one scrape call. Field names serialize in
/// camelCase to match the service boundary this core is consumed by.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResult {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price_raw: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub images: Vec<String>,
    pub source: Source,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Which strategy tier ultimately supplied the result's key fields.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Structured,
    Dom,
    Rendered,
    Generative,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ScrapeOptions {
    pub locale: Option<String>,
    pub currency_hint: Option<String>,
    pub timeout_ms: u64,
    /// Per-call override for the AI fallback. `None` defers to the
    /// operator-level flag; `Some(false)` disables it for this call.
    pub ai_enabled: Option<bool>,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            locale: None,
            currency_hint: None,
            timeout_ms: 60_000,
            ai_enabled: None,
        }
    }
}

/// Partial product record produced by each extraction strategy. Strategies
/// run in priority order and later strategies only fill gaps.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProductDraft {
    pub title: Option<String>,
    pub price_raw: Option<String>,
    pub currency: Option<String>,
    pub brand: Option<String>,
    pub description: Option<String>,
    pub images: Vec<String>,
}

impl ProductDraft {
    /// First-writer-wins merge: fields already populated are never
    /// overwritten, only gaps are filled. An empty image list counts as a
    /// gap; a non-empty one is kept as-is.
    pub fn fill_from(&mut self, other: ProductDraft) {
        if self.title.is_none() {
            self.title = other.title;
        }
        if self.price_raw.is_none() {
            self.price_raw = other.price_raw;
        }
        if self.currency.is_none() {
            self.currency = other.currency;
        }
        if self.brand.is_none() {
            self.brand = other.brand;
        }
        if self.description.is_none() {
            self.description = other.description;
        }
        if self.images.is_empty() {
            self.images = other.images;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.price_raw.is_none()
            && self.currency.is_none()
            && self.brand.is_none()
            && self.description.is_none()
            && self.images.is_empty()
    }

    /// True once every field the confidence score cares about is covered.
    pub fn is_complete(&self) -> bool {
        self.title.is_some() && self.price_raw.is_some() && !self.images.is_empty()
    }
}

/// Extraction completeness score in [0, 1]. Title and price carry most of
/// the weight: they are what a consumer needs and are usually unambiguous,
/// while images are abundant but noisy.
pub fn confidence(title: Option<&str>, price: Option<f64>, image_count: usize) -> f64 {
    let mut score: f64 = 0.0;

    if title.map(|t| t.trim().len() > 3).unwrap_or(false) {
        score += 0.5;
    }
    if price.map(|p| p > 0.0).unwrap_or(false) {
        score += 0.4;
    }
    if image_count > 0 {
        score += 0.1;
    }

    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_full() {
        let score = confidence(Some("Blue Running Shoe"), Some(79.99), 4);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_confidence_partial() {
        assert_eq!(confidence(Some("Blue Running Shoe"), None, 0), 0.5);
        assert_eq!(confidence(None, Some(12.5), 0), 0.4);
        assert_eq!(confidence(None, None, 3), 0.1);
        assert_eq!(confidence(None, None, 0), 0.0);
    }

    #[test]
    fn test_confidence_short_title_does_not_count() {
        // Titles of three characters or fewer are too ambiguous to score.
        assert_eq!(confidence(Some("TV"), None, 0), 0.0);
        assert_eq!(confidence(Some("   "), Some(0.0), 0), 0.0);
    }

    #[test]
    fn test_confidence_zero_price_does_not_count() {
        assert_eq!(confidence(None, Some(0.0), 0), 0.0);
    }

    #[test]
    fn test_confidence_in_unit_range() {
        for (t, p, i) in [
            (None, None, 0usize),
            (Some("A very long product title"), Some(9999.0), 20),
            (Some("x"), Some(-5.0), 1),
        ] {
            let s = confidence(t, p, i);
            assert!((0.0..=1.0).contains(&s), "score {} out of range", s);
        }
    }

    #[test]
    fn test_fill_from_keeps_existing_fields() {
        let mut first = ProductDraft {
            title: Some("Desk Lamp".to_string()),
            images: vec!["https://cdn.example.com/a.jpg".to_string()],
            ..Default::default()
        };
        let second = ProductDraft {
            title: Some("Other Name".to_string()),
            price_raw: Some("24.99".to_string()),
            images: vec!["https://cdn.example.com/b.jpg".to_string()],
            ..Default::default()
        };

        first.fill_from(second);

        assert_eq!(first.title.as_deref(), Some("Desk Lamp"));
        assert_eq!(first.price_raw.as_deref(), Some("24.99"));
        assert_eq!(first.images, vec!["https://cdn.example.com/a.jpg"]);
    }

    #[test]
    fn test_fill_from_fills_empty_images() {
        let mut first = ProductDraft::default();
        let second = ProductDraft {
            images: vec!["https://cdn.example.com/b.jpg".to_string()],
            ..Default::default()
        };

        first.fill_from(second);
        assert_eq!(first.images.len(), 1);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ExtractResult {
            url: "https://shop.example.com/p/1".to_string(),
            title: Some("Desk Lamp".to_string()),
            price_raw: Some("24.99".to_string()),
            price: Some(24.99),
            currency: Some("EUR".to_string()),
            brand: None,
            description: None,
            images: vec![],
            source: Source::Structured,
            confidence: 0.9,
            notes: vec![],
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["priceRaw"], "24.99");
        assert_eq!(json["source"], "structured");
    }
}
