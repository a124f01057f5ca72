//! The `track` entry point host pages call, and tracker bootstrap

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{load_tracker_config, ScriptTag, TrackerConfig};
use crate::error::TrackerError;
use crate::host::{HostPage, ReadyState};
use crate::navigation::{HistoryNavigation, NavigationSource};
use crate::payload::TelemetryPayload;
use crate::tracker::Tracker;
use crate::transport::{DeliveryChannel, Transport};

/// Global namespace the API is exposed under.
pub const GLOBAL_NAMESPACE: &str = "pagetrail";

/// What host-page code gets to call.
pub struct PublicApi {
    tracker: Arc<Tracker>,
}

impl PublicApi {
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// `track()` is a page view, `track(Some("signup"), ..)` a custom event.
    pub fn track(&self, name: Option<&str>, properties: Option<Value>) -> TelemetryPayload {
        let mut fields = Map::new();
        if let Some(name) = name {
            fields.insert("name".to_string(), Value::String(name.to_string()));
        }
        if let Some(properties) = properties {
            fields.insert("properties".to_string(), properties);
        }
        self.tracker.track(Some(&Value::Object(fields)))
    }

    /// Object form: `track({ name, properties, path, .. })`.
    ///
    /// A bare string is taken as the event name; anything else that isn't an
    /// object is a plain page view.
    pub fn track_input(&self, input: &Value) -> TelemetryPayload {
        match input {
            Value::String(name) => self.track(Some(name), None),
            other => self.tracker.track(Some(other)),
        }
    }

    pub fn shutdown(&self) {
        self.tracker.close();
    }
}

/// Pluggable pieces of a tracker. Defaults are the real ones.
#[derive(Default)]
pub struct InstallOptions {
    pub clock: Option<Arc<dyn Clock>>,
    pub transport: Option<Arc<dyn Transport>>,
    pub navigation: Option<Arc<dyn NavigationSource>>,
}

/// Install the tracker on a page from the script tag that loaded it.
///
/// Returns `None` (after a single warning) when there is no site key, and
/// `None` quietly when tracking is switched off. A page carries at most one
/// tracker: installing again hands back the one already exposed.
///
/// The page owns the tracker, not the other way round. Dropping the last
/// [`HostPage`] handle (or calling [`HostPage::discard`]) releases it.
pub fn install(page: &HostPage, tag: &ScriptTag) -> Option<Arc<PublicApi>> {
    match load_tracker_config(tag) {
        Ok(config) => install_with(page, &config, InstallOptions::default()),
        Err(e) => {
            tracing::warn!("pagetrail: {}; tracking disabled", e);
            None
        }
    }
}

pub fn install_with(
    page: &HostPage,
    config: &TrackerConfig,
    options: InstallOptions,
) -> Option<Arc<PublicApi>> {
    if !config.enabled {
        tracing::debug!("tracking disabled by configuration");
        return None;
    }

    if let Some(existing) = page.global(GLOBAL_NAMESPACE) {
        tracing::debug!("tracker already installed on this page");
        return Some(existing);
    }

    let resolved = match config.resolve() {
        Ok(resolved) => resolved,
        Err(TrackerError::MissingSiteKey) => {
            tracing::warn!("pagetrail: missing data-site-key attribute; tracking disabled");
            return None;
        }
        Err(e) => {
            tracing::warn!("pagetrail: {}; tracking disabled", e);
            return None;
        }
    };

    let channel = match options.transport {
        Some(transport) => DeliveryChannel::new(&resolved, transport),
        None => DeliveryChannel::detect(&resolved),
    };
    tracing::debug!(transport = channel.transport_name(), api_url = %resolved.api_url, "tracker configured");

    let clock = options.clock.unwrap_or_else(|| Arc::new(SystemClock));
    let navigation = options.navigation;

    // everything below may end up stored on the page, so only weak handles
    let weak_page = page.downgrade();
    let tracker = Arc::new(Tracker::new(
        resolved,
        Arc::new(weak_page.clone()),
        clock,
        channel,
    ));
    let api = Arc::new(PublicApi::new(tracker.clone()));
    page.expose(GLOBAL_NAMESPACE, api.clone());

    let start = move || {
        tracker.track_page_view();
        let navigation = match navigation {
            Some(navigation) => navigation,
            None => match weak_page.upgrade() {
                Some(page) => Arc::new(HistoryNavigation::new(page)),
                None => return,
            },
        };
        tracker.observe(&*navigation);
    };
    if page.ready_state() == ReadyState::Complete {
        start();
    } else {
        page.on_load(start);
    }

    Some(api)
}
