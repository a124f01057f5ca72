//! Telemetry payloads and how they are assembled

use serde::Serialize;
use serde_json::{Map, Value};

use crate::page::{current_path, normalize_referrer, PageEnvironment, UtmParams};

/// One outbound telemetry record. Built fresh per send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryPayload {
    pub site_key: String,
    /// Empty for page views and leaves, the event name otherwise
    pub name: String,
    pub path: String,
    pub title: String,
    /// Caller data, always as text
    pub properties: String,
    pub referrer: String,
    pub screen_width: u32,
    /// Seconds on page; only leave payloads carry a non-zero value
    pub duration: u64,
    pub utm_source: String,
    pub utm_medium: String,
    pub utm_campaign: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    PageView,
    Leave,
    Event,
}

/// Collector route a payload is posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Collect,
    Event,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Collect => "/api/collect",
            Endpoint::Event => "/api/event",
        }
    }
}

#[derive(Serialize)]
struct CollectBody<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    title: &'a str,
    referrer: &'a str,
    screen_width: u32,
    #[serde(skip_serializing_if = "is_zero")]
    duration: u64,
    utm_source: &'a str,
    utm_medium: &'a str,
    utm_campaign: &'a str,
}

#[derive(Serialize)]
struct EventBody<'a> {
    name: &'a str,
    path: &'a str,
    properties: &'a str,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl TelemetryPayload {
    pub fn kind(&self) -> PayloadKind {
        match (self.name.is_empty(), self.duration) {
            (false, _) => PayloadKind::Event,
            (true, 0) => PayloadKind::PageView,
            (true, _) => PayloadKind::Leave,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self.kind() {
            PayloadKind::Event => Endpoint::Event,
            PayloadKind::PageView | PayloadKind::Leave => Endpoint::Collect,
        }
    }

    /// JSON body for the payload's endpoint.
    pub fn body(&self) -> Option<String> {
        let body = match self.endpoint() {
            Endpoint::Collect => serde_json::to_string(&CollectBody {
                path: &self.path,
                title: &self.title,
                referrer: &self.referrer,
                screen_width: self.screen_width,
                duration: self.duration,
                utm_source: &self.utm_source,
                utm_medium: &self.utm_medium,
                utm_campaign: &self.utm_campaign,
            }),
            Endpoint::Event => serde_json::to_string(&EventBody {
                name: &self.name,
                path: &self.path,
                properties: &self.properties,
            }),
        };

        match body {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::debug!(error = %e, "dropping unserializable payload");
                None
            }
        }
    }
}

/// Text form of caller-supplied properties.
///
/// Strings pass through untouched, `null`/absent becomes empty text, anything
/// else is serialized as JSON.
pub fn properties_text(properties: Option<&Value>) -> String {
    match properties {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Serialize typed properties, or give up quietly.
pub fn serialize_properties<T: Serialize + ?Sized>(properties: &T) -> Value {
    match serde_json::to_value(properties) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "omitting unserializable properties");
            Value::Null
        }
    }
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields.get(key)?.as_str().map(str::to_string)
}

fn count_field(fields: &Map<String, Value>, key: &str) -> Option<u64> {
    let value = fields.get(key)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n.round() as u64)
    })
}

/// Builds payloads from the page a tracker is attached to.
pub struct PayloadBuilder<'a> {
    site_key: &'a str,
    include_query: bool,
    page: &'a dyn PageEnvironment,
}

impl<'a> PayloadBuilder<'a> {
    pub fn new(site_key: &'a str, include_query: bool, page: &'a dyn PageEnvironment) -> Self {
        Self {
            site_key,
            include_query,
            page,
        }
    }

    /// Build a payload, letting `overrides` replace ambient values.
    ///
    /// Only fields that are present and of the right type count; anything
    /// else (including a non-object `overrides`) falls back to the default.
    pub fn build(&self, overrides: Option<&Value>) -> TelemetryPayload {
        let empty = Map::new();
        let fields = overrides.and_then(Value::as_object).unwrap_or(&empty);

        let href = self.page.href();
        let utm = UtmParams::from_href(&href);

        let name = string_field(fields, "name").unwrap_or_default();
        // a named event never carries a duration
        let duration = if name.is_empty() {
            count_field(fields, "duration").unwrap_or(0)
        } else {
            0
        };

        TelemetryPayload {
            site_key: self.site_key.to_string(),
            path: string_field(fields, "path")
                .unwrap_or_else(|| current_path(&href, self.include_query)),
            title: string_field(fields, "title").unwrap_or_else(|| self.page.title()),
            properties: properties_text(fields.get("properties")),
            referrer: string_field(fields, "referrer")
                .unwrap_or_else(|| normalize_referrer(&self.page.referrer(), &href)),
            screen_width: count_field(fields, "screen_width")
                .and_then(|width| u32::try_from(width).ok())
                .unwrap_or_else(|| self.page.viewport_width()),
            duration,
            utm_source: string_field(fields, "utm_source").unwrap_or(utm.source),
            utm_medium: string_field(fields, "utm_medium").unwrap_or(utm.medium),
            utm_campaign: string_field(fields, "utm_campaign").unwrap_or(utm.campaign),
            name,
        }
    }

    /// Leave payload for the current page.
    pub fn leave(&self, duration: u64) -> TelemetryPayload {
        TelemetryPayload {
            title: String::new(),
            duration,
            ..self.build(None)
        }
    }
}

/// Typed way to put together the override object `track` accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInput {
    fields: Map<String, Value>,
}

impl TrackInput {
    pub fn page_view() -> Self {
        Self::default()
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self::default().field("name", Value::String(name.into()))
    }

    pub fn path(self, path: impl Into<String>) -> Self {
        self.field("path", Value::String(path.into()))
    }

    pub fn referrer(self, referrer: impl Into<String>) -> Self {
        self.field("referrer", Value::String(referrer.into()))
    }

    pub fn screen_width(self, width: u32) -> Self {
        self.field("screen_width", Value::from(width))
    }

    pub fn properties<T: Serialize + ?Sized>(self, properties: &T) -> Self {
        self.field("properties", serialize_properties(properties))
    }

    /// Add a single key to structured properties.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let slot = self
            .fields
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(properties) = slot {
            properties.insert(key.into(), value.into());
        }
        self
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}
