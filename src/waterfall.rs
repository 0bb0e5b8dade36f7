use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

use crate::normalize::{self, MAX_IMAGES};
use crate::selectors::selectors_for;
use crate::structured;
use crate::types::{ProductDraft, Source};

/// Merged result of the static extraction pass over one HTML document,
/// together with which tier supplied the key fields.
#[derive(Debug, Clone)]
pub struct WaterfallOutcome {
    pub draft: ProductDraft,
    pub source: Source,
}

/// Runs the full static waterfall: per-host selector lists first, then a
/// broad image scan, then the structured-data extractors to fill whatever
/// the DOM pass left open. Attribution is `structured` only when one of the
/// structured extractors actually closed a title/price/image gap.
pub fn extract(html: &str, url: &Url) -> WaterfallOutcome {
    let document = Html::parse_document(html);
    let profile = selectors_for(url.as_str());

    let mut draft = ProductDraft {
        title: select_first_value(&document, profile.title),
        price_raw: select_first_value(&document, profile.price),
        ..Default::default()
    };

    let mut collector = ImageCollector::new(url);
    for candidate in select_image_candidates(&document, profile.image) {
        collector.push(&candidate);
    }
    broad_image_scan(&document, &mut collector);
    draft.images = collector.into_images();

    debug!(
        "Selector pass: title={} price={} images={}",
        draft.title.is_some(),
        draft.price_raw.is_some(),
        draft.images.len()
    );

    let mut structured_filled = false;
    if let Some(jsonld) = structured::jsonld_product(&document) {
        structured_filled |= fill_and_track(&mut draft, jsonld);
    }
    if !draft.is_complete() {
        if let Some(framework) = structured::framework_product(&document) {
            structured_filled |= fill_and_track(&mut draft, framework);
        }
    }
    if !draft.is_complete() {
        if let Some(hydration) = structured::hydration_product(&document, html) {
            structured_filled |= fill_and_track(&mut draft, hydration);
        }
    }

    // Structured tiers may hand back relative or unvetted image refs; run
    // them through the same resolution and validity gate as DOM candidates.
    draft.images = normalize::collect_images(std::mem::take(&mut draft.images), url, MAX_IMAGES);

    let source = if structured_filled {
        Source::Structured
    } else {
        Source::Dom
    };

    WaterfallOutcome { draft, source }
}

/// Merges `other` into `draft` and reports whether a title, price, or image
/// gap was closed. Description and brand fills do not flip attribution.
pub(crate) fn fill_and_track(draft: &mut ProductDraft, other: ProductDraft) -> bool {
    let had_title = draft.title.is_some();
    let had_price = draft.price_raw.is_some();
    let had_images = !draft.images.is_empty();

    draft.fill_from(other);

    (!had_title && draft.title.is_some())
        || (!had_price && draft.price_raw.is_some())
        || (!had_images && !draft.images.is_empty())
}

/// First selector in the list yielding non-empty content wins the field.
fn select_first_value(document: &Html, selectors: &[&str]) -> Option<String> {
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        for element in document.select(&selector) {
            if let Some(value) = element_value(element) {
                return Some(value);
            }
        }
    }
    None
}

/// Image variant of the selector pass: the first selector matching anything
/// contributes all of its matches, later selectors are not merged in.
fn select_image_candidates(document: &Html, selectors: &[&str]) -> Vec<String> {
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        let values: Vec<String> = document
            .select(&selector)
            .filter_map(element_value)
            .collect();
        if !values.is_empty() {
            return values;
        }
    }
    Vec::new()
}

/// How a matched element's value is read depends on the element kind.
fn element_value(element: ElementRef) -> Option<String> {
    match element.value().name() {
        "meta" => attr_non_empty(element, "content"),
        "img" => attr_non_empty(element, "src")
            .or_else(|| attr_non_empty(element, "data-src"))
            .or_else(|| attr_non_empty(element, "data-lazy-src")),
        "source" => attr_non_empty(element, "srcset")
            .and_then(|srcset| srcset_urls(&srcset).into_iter().next()),
        _ => attr_non_empty(element, "content").or_else(|| {
            let text = element_text(element);
            (!text.is_empty()).then_some(text)
        }),
    }
}

fn attr_non_empty(element: ElementRef, name: &str) -> Option<String> {
    element
        .value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn element_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn srcset_urls(srcset: &str) -> Vec<String> {
    srcset
        .split(',')
        .filter_map(|entry| entry.trim().split_whitespace().next())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sweeps every image-bearing construct on the page: `<img>` attributes and
/// srcsets, `<picture><source>` entries, anchors that link straight to image
/// files, and `<noscript>` fallback markup. Stops as soon as the collector
/// hits its cap.
fn broad_image_scan(document: &Html, collector: &mut ImageCollector) {
    if let Ok(selector) = Selector::parse("img") {
        for element in document.select(&selector) {
            if collector.is_full() {
                return;
            }
            for attr in ["src", "data-src", "data-lazy-src"] {
                if let Some(value) = attr_non_empty(element, attr) {
                    collector.push(&value);
                }
            }
            if let Some(srcset) = attr_non_empty(element, "srcset") {
                for candidate in srcset_urls(&srcset) {
                    collector.push(&candidate);
                }
            }
        }
    }

    if let Ok(selector) = Selector::parse("picture source") {
        for element in document.select(&selector) {
            if collector.is_full() {
                return;
            }
            if let Some(srcset) = attr_non_empty(element, "srcset") {
                for candidate in srcset_urls(&srcset) {
                    collector.push(&candidate);
                }
            }
        }
    }

    if let Ok(selector) = Selector::parse("a[href]") {
        for element in document.select(&selector) {
            if collector.is_full() {
                return;
            }
            if let Some(href) = element.value().attr("href") {
                if normalize::has_image_extension(href) {
                    collector.push(href);
                }
            }
        }
    }

    let Ok(noscript) = Selector::parse("noscript") else {
        return;
    };
    let Ok(img) = Selector::parse("img") else {
        return;
    };
    for element in document.select(&noscript) {
        if collector.is_full() {
            return;
        }
        // With scripting enabled html5ever keeps noscript content as raw
        // text; re-parse it as a fragment to reach the fallback <img> tags.
        let inner: String = element.text().collect();
        if inner.contains("<img") {
            let fragment = Html::parse_fragment(&inner);
            for image in fragment.select(&img) {
                for attr in ["src", "data-src"] {
                    if let Some(value) = attr_non_empty(image, attr) {
                        collector.push(&value);
                    }
                }
            }
        }
        // Some parser configurations produce real child elements instead.
        for image in element.select(&img) {
            for attr in ["src", "data-src"] {
                if let Some(value) = attr_non_empty(image, attr) {
                    collector.push(&value);
                }
            }
        }
    }
}

/// Incremental image gathering with the same resolve/validate/dedupe rules
/// as `normalize::collect_images`, shaped for early exit mid-scan.
struct ImageCollector<'a> {
    base: &'a Url,
    seen: HashSet<String>,
    images: Vec<String>,
}

impl<'a> ImageCollector<'a> {
    fn new(base: &'a Url) -> Self {
        Self {
            base,
            seen: HashSet::new(),
            images: Vec::new(),
        }
    }

    fn push(&mut self, candidate: &str) {
        if self.is_full() {
            return;
        }
        let Some(resolved) = normalize::resolve_image_url(candidate, self.base) else {
            return;
        };
        if !normalize::is_valid_image_url(&resolved) {
            return;
        }
        if self.seen.insert(resolved.clone()) {
            self.images.push(resolved);
        }
    }

    fn is_full(&self) -> bool {
        self.images.len() >= MAX_IMAGES
    }

    fn into_images(self) -> Vec<String> {
        self.images
    }
}
