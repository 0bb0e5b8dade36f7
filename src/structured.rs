use regex::Regex;
use scraper::{Html, Selector};
use select::document::Document;
use select::predicate::{Attr as SelAttr, Class as SelClass, Name as SelName, Predicate};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::debug;

use crate::types::ProductDraft;

/// Depth bound for the JSON tree walks. serde_json values are acyclic, the
/// bound just keeps adversarial nesting from blowing the stack.
const MAX_SEARCH_DEPTH: usize = 24;

/// How child nodes are visited when the current node does not match.
pub(crate) enum Descend<'a> {
    /// Only follow these object keys (linking containers).
    Keys(&'a [&'a str]),
    /// Follow every object value.
    All,
}

/// Depth-first search over a JSON value for the first object node the
/// predicate accepts. Arrays are always traversed element-wise; object
/// traversal follows the descend mode.
pub(crate) fn find_node<'v>(
    value: &'v Value,
    matches: &dyn Fn(&Map<String, Value>) -> bool,
    descend: &Descend,
) -> Option<&'v Value> {
    find_node_bounded(value, matches, descend, 0)
}

fn find_node_bounded<'v>(
    value: &'v Value,
    matches: &dyn Fn(&Map<String, Value>) -> bool,
    descend: &Descend,
    depth: usize,
) -> Option<&'v Value> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }

    match value {
        Value::Object(map) => {
            if matches(map) {
                return Some(value);
            }
            match descend {
                Descend::Keys(keys) => {
                    for key in *keys {
                        if let Some(child) = map.get(*key) {
                            if let Some(found) =
                                find_node_bounded(child, matches, descend, depth + 1)
                            {
                                return Some(found);
                            }
                        }
                    }
                }
                Descend::All => {
                    for child in map.values() {
                        if let Some(found) = find_node_bounded(child, matches, descend, depth + 1)
                        {
                            return Some(found);
                        }
                    }
                }
            }
            None
        }
        Value::Array(items) => items
            .iter()
            .find_map(|item| find_node_bounded(item, matches, descend, depth + 1)),
        _ => None,
    }
}

// ---------- JSON-LD ----------

/// Linking containers JSON-LD commonly wraps a Product node in.
const JSONLD_DESCEND_KEYS: &[&str] = &[
    "@graph",
    "itemListElement",
    "mainEntity",
    "mainEntityOfPage",
    "item",
    "offers",
    "brand",
    "isVariantOf",
    "hasVariant",
];

fn is_product_node(map: &Map<String, Value>) -> bool {
    match map.get("@type") {
        Some(Value::String(t)) => t == "Product",
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some("Product")),
        _ => false,
    }
}

/// Scans `<script type="application/ld+json">` blocks for the first node
/// whose `@type` includes `Product`. Malformed JSON in one block does not
/// stop the scan of the others.
pub fn jsonld_product(document: &Html) -> Option<ProductDraft> {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;

    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        if raw.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(raw.trim()) {
            Ok(v) => v,
            Err(e) => {
                debug!("Skipping malformed JSON-LD block: {}", e);
                continue;
            }
        };

        if let Some(node) = find_node(&value, &is_product_node, &Descend::Keys(JSONLD_DESCEND_KEYS))
        {
            if let Some(map) = node.as_object() {
                let draft = product_node_to_draft(map);
                if !draft.is_empty() {
                    return Some(draft);
                }
            }
        }
    }
    None
}

fn product_node_to_draft(map: &Map<String, Value>) -> ProductDraft {
    let mut draft = ProductDraft {
        title: string_field(map, &["name", "title"]),
        description: string_field(map, &["description"]),
        brand: map.get("brand").and_then(brand_name),
        ..Default::default()
    };

    if let Some(price) = map.get("price").and_then(price_value_to_raw) {
        draft.price_raw = Some(price);
    }
    if let Some(currency) = string_field(map, &["priceCurrency"]) {
        draft.currency = Some(currency);
    }

    if let Some(offers) = map.get("offers") {
        let offer = first_object(offers);
        if let Some(offer) = offer {
            if draft.price_raw.is_none() {
                draft.price_raw = offer
                    .get("price")
                    .or_else(|| offer.get("lowPrice"))
                    .and_then(price_value_to_raw);
            }
            if draft.currency.is_none() {
                draft.currency = string_field(offer, &["priceCurrency"]);
            }
        }
    }

    if let Some(image) = map.get("image") {
        draft.images = candidate_image_strings(image);
    }

    draft
}

fn first_object(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        Value::Array(items) => items.iter().find_map(|v| v.as_object()),
        _ => None,
    }
}

fn brand_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Object(map) => string_field(map, &["name"]),
        Value::Array(items) => items.iter().find_map(brand_name),
        _ => None,
    }
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extracts a raw price string from the many shapes embedded JSON uses:
/// plain string, number, nested price object, or the first element of a
/// price array.
pub(crate) fn price_value_to_raw(value: &Value) -> Option<String> {
    price_value_bounded(value, 0)
}

fn price_value_bounded(value: &Value, depth: usize) -> Option<String> {
    if depth > 4 {
        return None;
    }
    match value {
        Value::String(s) if s.chars().any(|c| c.is_ascii_digit()) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => ["price", "value", "amount", "current", "sales"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| price_value_bounded(v, depth + 1))),
        Value::Array(items) => items
            .iter()
            .find_map(|v| price_value_bounded(v, depth + 1)),
        _ => None,
    }
}

/// Unrolls the shapes a raw image reference takes in embedded JSON: a bare
/// string, an array of references, or an object carrying one of
/// `url` / `src` / `contentUrl` / `@id`.
pub(crate) fn candidate_image_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(candidate_image_strings).collect(),
        Value::Object(map) => ["url", "src", "contentUrl", "@id"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

// ---------- Framework-embedded state ----------

const FRAMEWORK_CONTAINERS: &[&str] = &[
    "script#__NEXT_DATA__",
    "script#__NUXT_DATA__",
    r#"script[type="application/json"][id]"#,
];

fn plausible_product_map(map: &Map<String, Value>) -> bool {
    let name_ok = map
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| {
            let t = s.trim();
            t.len() > 3 && t.len() < 300
        })
        .unwrap_or(false);
    if !name_ok {
        return false;
    }

    let has_image = ["image", "images", "media", "gallery"]
        .iter()
        .any(|k| map.contains_key(*k));
    let has_price = ["price", "prices", "offers", "pricing"]
        .iter()
        .any(|k| map.contains_key(*k));

    has_image || has_price
}

/// Scans framework state containers (`__NEXT_DATA__` and friends) for an
/// object that looks like a product: a plausible `name` co-occurring with an
/// image-like or price-like field.
pub fn framework_product(document: &Html) -> Option<ProductDraft> {
    for container in FRAMEWORK_CONTAINERS {
        let Ok(selector) = Selector::parse(container) else {
            continue;
        };
        for script in document.select(&selector) {
            let raw = script.text().collect::<String>();
            if raw.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(raw.trim()) {
                Ok(v) => v,
                Err(_) => continue,
            };

            if let Some(node) = find_node(&value, &plausible_product_map, &Descend::All) {
                if let Some(map) = node.as_object() {
                    let draft = state_object_to_draft(map);
                    if !draft.is_empty() {
                        return Some(draft);
                    }
                }
            }
        }
    }
    None
}

/// Maps a loosely shaped state object (framework or hydration) to a draft.
fn state_object_to_draft(map: &Map<String, Value>) -> ProductDraft {
    let mut draft = ProductDraft {
        title: string_field(map, &["name", "title", "displayName"]),
        description: string_field(map, &["description"]),
        brand: map.get("brand").and_then(brand_name),
        ..Default::default()
    };

    draft.price_raw = ["price", "prices", "pricing", "offers"]
        .iter()
        .find_map(|k| map.get(*k).and_then(price_value_to_raw));
    draft.currency = string_field(map, &["currency", "currencyCode", "priceCurrency"]);

    for key in ["image", "images", "media", "gallery"] {
        if let Some(value) = map.get(key) {
            let candidates = candidate_image_strings(value);
            if !candidates.is_empty() {
                draft.images = candidates;
                break;
            }
        }
    }

    draft
}

// ---------- Hydration state ----------

static STATE_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:window\.)?__(?:PRELOADED|INITIAL)_STATE__\s*=\s*").unwrap()
});

const HYDRATION_PATHS: &[&[&str]] = &[&["product"], &["pageData", "product"], &["data", "product"]];

/// Extracts the balanced `{...}` object literal starting at the first `{`
/// in `input`, honoring string literals and escapes.
fn balanced_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => in_string = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&input[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn value_at_path<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Hydration-state extractor: captures `__PRELOADED_STATE__` /
/// `__INITIAL_STATE__` assignments from inline scripts, descends the known
/// product paths, then falls back to generic `application/json` scripts and
/// finally to heuristic DOM text scraping.
pub fn hydration_product(document: &Html, html: &str) -> Option<ProductDraft> {
    if let Some(draft) = hydration_state_draft(document) {
        return Some(draft);
    }
    if let Some(draft) = json_script_draft(document) {
        return Some(draft);
    }
    heuristic_dom_draft(html)
}

fn hydration_state_draft(document: &Html) -> Option<ProductDraft> {
    let selector = Selector::parse("script:not([src])").ok()?;

    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        let Some(found) = STATE_ASSIGNMENT.find(&raw) else {
            continue;
        };
        let Some(object) = balanced_object(&raw[found.end()..]) else {
            continue;
        };
        let state: Value = match serde_json::from_str(object) {
            Ok(v) => v,
            Err(e) => {
                debug!("Hydration state did not parse as JSON: {}", e);
                continue;
            }
        };

        for path in HYDRATION_PATHS {
            if let Some(product) = value_at_path(&state, path).and_then(|v| v.as_object()) {
                let draft = state_object_to_draft(product);
                if !draft.is_empty() {
                    return Some(draft);
                }
            }
        }
    }
    None
}

fn json_script_draft(document: &Html) -> Option<ProductDraft> {
    let selector = Selector::parse(r#"script[type="application/json"]"#).ok()?;

    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        // Cheap precheck before paying for a parse.
        if !(raw.contains("price") && raw.contains("image")) {
            continue;
        }
        let value: Value = match serde_json::from_str(raw.trim()) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if let Some(node) = find_node(&value, &plausible_product_map, &Descend::All) {
            if let Some(map) = node.as_object() {
                let draft = state_object_to_draft(map);
                if !draft.is_empty() {
                    return Some(draft);
                }
            }
        }
    }
    None
}

/// Last resort inside this extractor: visible DOM text via price/brand
/// attribute patterns.
fn heuristic_dom_draft(html: &str) -> Option<ProductDraft> {
    let doc = Document::from(html);
    let mut draft = ProductDraft::default();

    draft.title = doc
        .find(SelName("h1"))
        .next()
        .map(|n| n.text().trim().to_string())
        .filter(|t| !t.is_empty());

    draft.price_raw = doc
        .find(SelAttr("itemprop", "price"))
        .next()
        .and_then(|n| {
            n.attr("content")
                .map(|c| c.to_string())
                .or_else(|| Some(n.text().trim().to_string()))
        })
        .or_else(|| {
            doc.find(SelClass("price").or(SelClass("product-price")))
                .next()
                .map(|n| n.text().trim().to_string())
        })
        .filter(|p| p.chars().any(|c| c.is_ascii_digit()));

    draft.brand = doc
        .find(SelAttr("itemprop", "brand"))
        .next()
        .map(|n| n.text().trim().to_string())
        .filter(|b| !b.is_empty());

    if draft.is_empty() {
        None
    } else {
        Some(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str) -> Html {
        Html::parse_document(html)
    }

    #[test]
    fn test_jsonld_basic_product() {
        let html = r#"<html><head>
            <script type="application/ld+json">
            {"@context":"https://schema.org","@type":"Product","name":"Test Shirt",
             "image":"https://cdn.example.com/shirt.jpg",
             "offers":{"@type":"Offer","price":"29.95","priceCurrency":"EUR"}}
            </script></head><body></body></html>"#;

        let draft = jsonld_product(&parse(html)).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Test Shirt"));
        assert_eq!(draft.price_raw.as_deref(), Some("29.95"));
        assert_eq!(draft.currency.as_deref(), Some("EUR"));
        assert_eq!(draft.images, vec!["https://cdn.example.com/shirt.jpg"]);
    }

    #[test]
    fn test_jsonld_product_inside_graph() {
        let html = r#"<script type="application/ld+json">
            {"@context":"https://schema.org","@graph":[
              {"@type":"WebSite","name":"Shop"},
              {"@type":"Product","name":"Graph Lamp","offers":{"price":12.5}}
            ]}
            </script>"#;

        let draft = jsonld_product(&parse(html)).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Graph Lamp"));
        assert_eq!(draft.price_raw.as_deref(), Some("12.5"));
    }

    #[test]
    fn test_jsonld_type_array() {
        let html = r#"<script type="application/ld+json">
            {"@type":["Thing","Product"],"name":"Array Typed Chair","price":"89"}
            </script>"#;

        let draft = jsonld_product(&parse(html)).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Array Typed Chair"));
    }

    #[test]
    fn test_jsonld_skips_malformed_blocks() {
        let html = r#"
            <script type="application/ld+json">{not valid json</script>
            <script type="application/ld+json">
            {"@type":"Product","name":"Second Block Wins","price":"5.00"}
            </script>"#;

        let draft = jsonld_product(&parse(html)).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Second Block Wins"));
    }

    #[test]
    fn test_jsonld_offers_array_and_brand_object() {
        let html = r#"<script type="application/ld+json">
            {"@type":"Product","name":"Branded Jacket",
             "brand":{"@type":"Brand","name":"Northwind"},
             "image":[{"@type":"ImageObject","url":"https://cdn.example.com/1.jpg"},
                      "https://cdn.example.com/2.jpg"],
             "offers":[{"price":"119.00","priceCurrency":"USD"}]}
            </script>"#;

        let draft = jsonld_product(&parse(html)).unwrap();
        assert_eq!(draft.brand.as_deref(), Some("Northwind"));
        assert_eq!(draft.price_raw.as_deref(), Some("119.00"));
        assert_eq!(draft.currency.as_deref(), Some("USD"));
        assert_eq!(
            draft.images,
            vec!["https://cdn.example.com/1.jpg", "https://cdn.example.com/2.jpg"]
        );
    }

    #[test]
    fn test_jsonld_none_without_product_node() {
        let html = r#"<script type="application/ld+json">
            {"@type":"BreadcrumbList","itemListElement":[]}
            </script>"#;
        assert!(jsonld_product(&parse(html)).is_none());
    }

    #[test]
    fn test_framework_next_data() {
        let html = r#"<script id="__NEXT_DATA__" type="application/json">
            {"props":{"pageProps":{"product":{
                "name":"Next Sneaker","price":{"value":64.99,"currency":"EUR"},
                "images":["https://cdn.example.com/sneaker.jpg"]}}}}
            </script>"#;

        let draft = framework_product(&parse(html)).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Next Sneaker"));
        assert_eq!(draft.price_raw.as_deref(), Some("64.99"));
        assert_eq!(draft.images, vec!["https://cdn.example.com/sneaker.jpg"]);
    }

    #[test]
    fn test_framework_requires_cooccurrence() {
        // A name without any price or image field is not a product node.
        let html = r#"<script id="__NEXT_DATA__" type="application/json">
            {"props":{"user":{"name":"Jamie Example"}}}
            </script>"#;
        assert!(framework_product(&parse(html)).is_none());
    }

    #[test]
    fn test_hydration_initial_state() {
        let html = r#"<script>
            window.__INITIAL_STATE__ = {"product":{"name":"Hydrated Kettle",
              "price":"39,99","images":["https://cdn.example.com/kettle.jpg"]}};
            </script>"#;

        let draft = hydration_product(&parse(html), html).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Hydrated Kettle"));
        assert_eq!(draft.price_raw.as_deref(), Some("39,99"));
    }

    #[test]
    fn test_hydration_page_data_path() {
        let html = r#"<script>
            __PRELOADED_STATE__ = {"pageData":{"product":{"name":"Preloaded Desk",
              "price":249,"image":"https://cdn.example.com/desk.jpg"}}};
            </script>"#;

        let draft = hydration_product(&parse(html), html).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Preloaded Desk"));
        assert_eq!(draft.price_raw.as_deref(), Some("249"));
    }

    #[test]
    fn test_hydration_falls_back_to_json_scripts() {
        let html = r#"<script type="application/json">
            {"entries":[{"name":"Json Script Chair","price":"59.95",
              "image":"https://cdn.example.com/chair.jpg"}]}
            </script>"#;

        let draft = hydration_product(&parse(html), html).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Json Script Chair"));
    }

    #[test]
    fn test_hydration_dom_heuristic_last_resort() {
        let html = r#"<html><body>
            <h1>Fallback Floor Lamp</h1>
            <span class="price">€ 89,95</span>
            </body></html>"#;

        let draft = hydration_product(&parse(html), html).unwrap();
        assert_eq!(draft.title.as_deref(), Some("Fallback Floor Lamp"));
        assert_eq!(draft.price_raw.as_deref(), Some("€ 89,95"));
    }

    #[test]
    fn test_hydration_none_on_empty_page() {
        let html = "<html><body><p>nothing here</p></body></html>";
        assert!(hydration_product(&parse(html), html).is_none());
    }

    #[test]
    fn test_balanced_object_honors_strings() {
        let input = r#"= {"a":"}","b":{"c":1}}; rest"#;
        assert_eq!(balanced_object(input), Some(r#"{"a":"}","b":{"c":1}}"#));
    }

    #[test]
    fn test_find_node_depth_bound() {
        let mut value = serde_json::json!({"name":"Too Deep","price":"1.00"});
        for _ in 0..40 {
            value = serde_json::json!({ "wrap": value });
        }
        assert!(find_node(&value, &plausible_product_map, &Descend::All).is_none());
    }

    #[test]
    fn test_candidate_image_shapes() {
        let value = serde_json::json!([
            "https://cdn.example.com/a.jpg",
            {"url": "https://cdn.example.com/b.jpg"},
            {"contentUrl": "https://cdn.example.com/c.jpg"},
            42
        ]);
        assert_eq!(
            candidate_image_strings(&value),
            vec![
                "https://cdn.example.com/a.jpg",
                "https://cdn.example.com/b.jpg",
                "https://cdn.example.com/c.jpg"
            ]
        );
    }

    #[test]
    fn test_price_value_shapes() {
        assert_eq!(
            price_value_to_raw(&serde_json::json!("29.95")).as_deref(),
            Some("29.95")
        );
        assert_eq!(
            price_value_to_raw(&serde_json::json!(29.95)).as_deref(),
            Some("29.95")
        );
        assert_eq!(
            price_value_to_raw(&serde_json::json!({"current": {"value": "12,50"}})).as_deref(),
            Some("12,50")
        );
        assert_eq!(price_value_to_raw(&serde_json::json!("none")), None);
    }
}
