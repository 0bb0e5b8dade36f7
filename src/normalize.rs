use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

/// Hard cap on the image list of a result.
pub const MAX_IMAGES: usize = 20;

// No-cents notation: "1.299,-" / "1299.-".
static PRICE_NO_CENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d[\d.,]*)[,.]-").unwrap());

// Numeric price substring. May start with a separator (".99") but always
// ends on a digit.
static PRICE_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9.,]*[0-9]").unwrap());

/// Canonicalizes a raw price string into `"<integer>.<fraction>"` form.
///
/// The decimal separator is whichever of `,`/`.` occurs last in the numeric
/// substring; everything before it contributes integer digits. That position
/// rule handles both `1.299,95` and `1,299.95` without knowing the locale.
/// Idempotent: an already-canonical string maps to itself.
pub fn normalize_price(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    if let Some(caps) = PRICE_NO_CENTS.captures(&compact) {
        let int_digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
        if !int_digits.is_empty() {
            return Some(format!("{}.00", int_digits));
        }
    }

    let matched = PRICE_NUMERIC.find(&compact)?.as_str();

    let canonical = match matched.rfind(|c| c == ',' || c == '.') {
        None => format!("{}.00", matched),
        Some(sep) => {
            let int_digits: String = matched[..sep]
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            let frac: String = matched[sep + 1..]
                .chars()
                .filter(|c| c.is_ascii_digit())
                .take(2)
                .collect();
            let int_part = if int_digits.is_empty() { "0" } else { &int_digits };
            if frac.is_empty() {
                format!("{}.00", int_part)
            } else {
                format!("{}.{}", int_part, frac)
            }
        }
    };

    Some(canonical)
}

/// Numeric value of a raw price string, via [`normalize_price`].
pub fn parse_price(raw: &str) -> Option<f64> {
    normalize_price(raw).and_then(|s| s.parse::<f64>().ok())
}

/// Maps a currency symbol or code found in a raw price string to its ISO
/// code. Multi-character dollar prefixes are checked before the bare `$`.
pub fn detect_currency(raw: &str) -> Option<&'static str> {
    let upper = raw.to_uppercase();

    if raw.contains("A$") || raw.contains("AU$") || upper.contains("AUD") {
        Some("AUD")
    } else if raw.contains("C$") || raw.contains("CA$") || upper.contains("CAD") {
        Some("CAD")
    } else if raw.contains('€') || upper.contains("EUR") {
        Some("EUR")
    } else if raw.contains('£') || upper.contains("GBP") {
        Some("GBP")
    } else if raw.contains('₹') || upper.contains("INR") {
        Some("INR")
    } else if raw.contains('¥') || upper.contains("JPY") {
        Some("JPY")
    } else if raw.contains("zł") || upper.contains("PLN") {
        Some("PLN")
    } else if raw.contains("kr") || upper.contains("SEK") {
        Some("SEK")
    } else if raw.contains('$') || upper.contains("USD") {
        Some("USD")
    } else {
        None
    }
}

const TRACKER_HOSTS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "facebook.com/tr",
    "facebook.net",
    "hotjar.com",
    "criteo.com",
    "scorecardresearch.com",
    "quantserve.com",
    "adservice.",
    "pixel.",
];

const BANNED_NAME_PATTERNS: &[&str] = &[
    "icon",
    "logo",
    "banner",
    "placeholder",
    "sprite",
    "avatar",
    "badge",
    "advert",
    "tracking",
    "pixel",
    "favicon",
    "spinner",
    "loader",
    "spacer",
    "blank.",
    "dummy",
    "payment",
    "visa",
    "mastercard",
    "paypal",
    "klarna",
];

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".avif", ".jfif"];

const MEDIA_CDN_HINTS: &[&str] = &[
    "cloudinary",
    "imgix",
    "akamaized",
    "cloudfront",
    "shopify",
    "scene7",
    "ztat.net",
    "media-amazon",
    "alicdn",
    "/media/",
    "/images/",
    "/image/",
    "/photos/",
    "=image",
];

/// Extension-only check, used when deciding whether an anchor href is worth
/// treating as a gallery image candidate at all.
pub fn has_image_extension(url: &str) -> bool {
    let lower = url.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.contains(ext))
}

/// Validity rule for product image URLs: data-URIs, tracker endpoints, and
/// non-product asset names are rejected; the rest must look like an image by
/// extension or come from a known media CDN path shape.
pub fn is_valid_image_url(url: &str) -> bool {
    let lower = url.to_lowercase();

    if lower.starts_with("data:") {
        return false;
    }
    if TRACKER_HOSTS.iter().any(|t| lower.contains(t)) {
        return false;
    }
    if BANNED_NAME_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }

    IMAGE_EXTENSIONS.iter().any(|ext| lower.contains(ext))
        || MEDIA_CDN_HINTS.iter().any(|h| lower.contains(h))
}

/// Resolves one raw image reference against the page URL and strips the
/// query and fragment, so CDN resize parameters cannot create false
/// distinct entries. Returns None for empty refs and unjoinable garbage.
pub fn resolve_image_url(candidate: &str, base: &Url) -> Option<String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut resolved = base.join(trimmed).ok()?;
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    resolved.set_query(None);
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

/// Resolves, validates, deduplicates, and caps a candidate image list.
/// First-seen order is preserved.
pub fn collect_images<I>(candidates: I, base: &Url, cap: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for candidate in candidates {
        if out.len() >= cap {
            break;
        }
        let Some(resolved) = resolve_image_url(&candidate, base) else {
            continue;
        };
        if !is_valid_image_url(&resolved) {
            continue;
        }
        if seen.insert(resolved.clone()) {
            out.push(resolved);
        }
    }

    out
}
