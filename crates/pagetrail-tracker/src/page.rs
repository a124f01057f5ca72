//! Ambient page state the payload builder reads from

use reqwest::Url;

/// Read-only view of the page a tracker is embedded in.
pub trait PageEnvironment: Send + Sync {
    /// Full current location, e.g. `https://example.com/docs?tab=2`
    fn href(&self) -> String;

    /// `document.referrer`, empty when there is none
    fn referrer(&self) -> String;

    /// Viewport width in pixels
    fn viewport_width(&self) -> u32;

    fn title(&self) -> String;
}

/// Parse a location, accepting bare paths like `/docs?x=1` as well.
fn parse_location(href: &str) -> Option<Url> {
    Url::parse(href).ok().or_else(|| {
        Url::parse("http://localhost")
            .ok()
            .and_then(|base| base.join(href).ok())
    })
}

/// Logical page path for a location.
///
/// The query string is only kept when `include_query` is set. Unparseable
/// locations report `/`.
pub fn current_path(href: &str, include_query: bool) -> String {
    let Some(url) = parse_location(href) else {
        return "/".to_string();
    };

    match url.query() {
        Some(query) if include_query && !query.is_empty() => format!("{}?{}", url.path(), query),
        _ => url.path().to_string(),
    }
}

/// Collapse same-host referrers to "direct" (empty).
///
/// Cross-origin and unparseable referrers are passed through unchanged.
pub fn normalize_referrer(referrer: &str, href: &str) -> String {
    let referrer = referrer.trim();
    if referrer.is_empty() {
        return String::new();
    }

    let same_host = match (Url::parse(referrer), parse_location(href)) {
        (Ok(from), Some(here)) => from.host_str().is_some() && from.host_str() == here.host_str(),
        _ => false,
    };

    if same_host {
        String::new()
    } else {
        referrer.to_string()
    }
}

/// Campaign parameters from the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtmParams {
    pub source: String,
    pub medium: String,
    pub campaign: String,
}

impl UtmParams {
    pub fn from_href(href: &str) -> Self {
        let mut params = Self::default();
        let Some(url) = parse_location(href) else {
            return params;
        };

        for (key, value) in url.query_pairs() {
            let slot = match key.as_ref() {
                "utm_source" => &mut params.source,
                "utm_medium" => &mut params.medium,
                "utm_campaign" => &mut params.campaign,
                _ => continue,
            };
            // first occurrence wins, like URLSearchParams.get
            if slot.is_empty() {
                *slot = value.into_owned();
            }
        }
        params
    }
}
