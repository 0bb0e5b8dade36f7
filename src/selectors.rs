use url::Url;

/// Ordered candidate selectors per field. Selectors are tried in declared
/// priority order during the static waterfall; the first one yielding
/// non-empty content wins its field, lists are never merged.
#[derive(Debug)]
pub struct SelectorProfile {
    pub title: &'static [&'static str],
    pub price: &'static [&'static str],
    pub image: &'static [&'static str],
}

pub static GENERIC: SelectorProfile = SelectorProfile {
    title: &["h1", r#"meta[property="og:title"]"#, "title"],
    price: &[
        r#"[itemprop="price"]"#,
        ".price",
        ".product-price",
        r#"[class*="price"]"#,
    ],
    image: &[
        r#"meta[property="og:image"]"#,
        r#"img[itemprop="image"]"#,
    ],
};

static AMAZON: SelectorProfile = SelectorProfile {
    title: &["#productTitle", "#title span"],
    price: &[
        ".a-price .a-offscreen",
        "#priceblock_ourprice",
        "#priceblock_dealprice",
        "#corePrice_feature_div .a-price .a-offscreen",
    ],
    image: &["#landingImage", "#imgTagWrapperId img", "#main-image-container img"],
};

static EBAY: SelectorProfile = SelectorProfile {
    title: &["h1.x-item-title__mainTitle span", ".x-item-title__mainTitle"],
    price: &[".x-price-primary span", "#prcIsum"],
    image: &[".ux-image-carousel-item img", "#icImg"],
};

static ETSY: SelectorProfile = SelectorProfile {
    title: &["h1[data-buy-box-listing-title]"],
    price: &[
        r#"[data-buy-box-region="price"] p.wt-text-title-larger"#,
        "p.wt-text-title-03",
    ],
    image: &["img[data-carousel-first-image]", ".image-carousel-container img"],
};

static WALMART: SelectorProfile = SelectorProfile {
    title: &[r#"h1[itemprop="name"]"#],
    price: &[r#"span[itemprop="price"]"#, r#"span[data-automation-id="product-price"]"#],
    image: &[r#"img[data-testid="hero-image"]"#, ".prod-hero-image img"],
};

static TARGET: SelectorProfile = SelectorProfile {
    title: &[r#"h1[data-test="product-title"]"#],
    price: &[r#"span[data-test="product-price"]"#],
    image: &[r#"[data-test="image-gallery-item-0"] img"#, "picture img"],
};

static BOL: SelectorProfile = SelectorProfile {
    title: &[r#"h1[data-test="title"]"#, r#"span[data-test="title"]"#],
    price: &["span.promo-price", r#"[data-test="price"]"#],
    image: &[".image-slot img", r#"img[data-test="product-image"]"#],
};

static COOLBLUE: SelectorProfile = SelectorProfile {
    title: &["h1.js-product-name", "h1"],
    price: &["strong.sales-price__current", ".sales-price__current"],
    image: &[".product-image img", "img.js-product-image"],
};

static WEHKAMP: SelectorProfile = SelectorProfile {
    title: &[r#"h1[data-hook="product-title"]"#, "h1"],
    price: &[r#"[data-hook="price"]"#, ".price"],
    image: &[r#"img[data-hook="product-image"]"#],
};

static MEDIAMARKT: SelectorProfile = SelectorProfile {
    title: &[r#"h1[data-test="product-title"]"#, "h1"],
    price: &[r#"[data-test="branded-price-whole-value"]"#, ".price-big"],
    image: &[r#"img[data-test="product-image"]"#, "picture img"],
};

static ZALANDO: SelectorProfile = SelectorProfile {
    title: &["h1"],
    price: &[r#"span[class*="price"]"#, r#"p[class*="price"]"#],
    image: &[r#"meta[property="og:image"]"#, r#"img[src*="ztat.net"]"#],
};

static ASOS: SelectorProfile = SelectorProfile {
    title: &["h1"],
    price: &[r#"[data-testid="current-price"]"#, "span.current-price"],
    image: &["img.gallery-image", ".fullImageContainer img"],
};

static HM: SelectorProfile = SelectorProfile {
    title: &["h1.product-item-headline", "h1"],
    price: &[".price-value", "span.price"],
    image: &[".product-detail-main-image-container img", "figure.pdp-image img"],
};

static SHEIN: SelectorProfile = SelectorProfile {
    title: &["h1.product-intro__head-name", ".product-intro__head-name"],
    price: &[".product-intro__head-mainprice .from", ".original-price"],
    image: &[".product-intro__main-image img", ".crop-image-container img"],
};

static ALIEXPRESS: SelectorProfile = SelectorProfile {
    title: &[r#"h1[data-pl="product-title"]"#, ".product-title-text"],
    price: &[".product-price-value", r#"[class*="Price_"]"#],
    image: &[".magnifier-image", r#"img[class*="magnifier"]"#],
};

static OTTO: SelectorProfile = SelectorProfile {
    title: &["h1.pdp_short-info__main-name", "h1"],
    price: &[".pdp_price__retail-price", ".pdp_price span"],
    image: &[".pdp_image img", "img.pdp_main-image"],
};

/// Hostname-substring keyed catalog, evaluated top to bottom; first match
/// wins. The generic profile is the guaranteed terminal for everything else,
/// so lookups are total.
static CATALOG: &[(&str, &SelectorProfile)] = &[
    ("amazon", &AMAZON),
    ("ebay", &EBAY),
    ("etsy", &ETSY),
    ("walmart", &WALMART),
    ("target", &TARGET),
    ("bol.com", &BOL),
    ("coolblue", &COOLBLUE),
    ("wehkamp", &WEHKAMP),
    ("mediamarkt", &MEDIAMARKT),
    ("zalando", &ZALANDO),
    ("asos", &ASOS),
    ("hm.com", &HM),
    ("shein", &SHEIN),
    ("aliexpress", &ALIEXPRESS),
    ("otto.de", &OTTO),
];

/// Resolves the selector profile for a URL by case-insensitive hostname
/// substring match. Never fails: unparsable input and unknown hosts both get
/// the generic profile.
pub fn selectors_for(url: &str) -> &'static SelectorProfile {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_else(|| url.to_lowercase());

    for (matcher, profile) in CATALOG {
        if host.contains(matcher) {
            return profile;
        }
    }
    &GENERIC
}
