//! Scripted host-page sessions
//!
//! A replay script describes a page, the script tag that embeds the tracker
//! and a list of steps (virtual navigation, lifecycle events, elapsed time,
//! explicit `track` calls). Steps run against a real `HostPage` with history
//! interception installed, so the tracker sees exactly what it would see in a
//! browser.

use anyhow::{bail, Context, Result};
use pagetrail_tracker::config::{
    load_tracker_config, API_URL_ATTR, INCLUDE_QUERY_ATTR, SITE_KEY_ATTR,
};
use pagetrail_tracker::transport::SentRequest;
use pagetrail_tracker::{
    install_with, Clock, HostPage, InstallOptions, ManualClock, ReadyState, RecordingTransport,
    ScriptTag, SystemClock, Transport,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct ReplayScript {
    pub page: PageSection,
    pub script: ScriptSection,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct PageSection {
    pub url: String,
    #[serde(default)]
    pub referrer: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    /// Start with the document already loaded (default: true)
    #[serde(default = "default_loaded")]
    pub loaded: bool,
}

fn default_width() -> u32 {
    1280
}

fn default_loaded() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ScriptSection {
    pub src: String,
    pub site_key: Option<String>,
    pub api_url: Option<String>,
    #[serde(default)]
    pub include_query: bool,
}

impl ScriptSection {
    fn tag(&self) -> ScriptTag {
        let mut tag = ScriptTag::new(&self.src);
        if let Some(site_key) = &self.site_key {
            tag = tag.with_attribute(SITE_KEY_ATTR, site_key);
        }
        if let Some(api_url) = &self.api_url {
            tag = tag.with_attribute(API_URL_ATTR, api_url);
        }
        if self.include_query {
            tag = tag.with_attribute(INCLUDE_QUERY_ATTR, "true");
        }
        tag
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Step {
    Push { url: String },
    Replace { url: String },
    Back,
    Forward,
    /// Let time pass on the page
    Advance { seconds: f64 },
    Track {
        name: Option<String>,
        properties: Option<serde_json::Value>,
    },
    Title { title: String },
    Hide,
    Show,
    Unload,
    Load,
}

pub fn load_script(path: &Path) -> Result<ReplayScript> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read replay script: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse replay script: {}", path.display()))
}

/// Play a script. In dry-run mode nothing leaves the process and the
/// requests the tracker made are returned instead.
pub fn run(script: &ReplayScript, dry_run: bool) -> Result<Vec<SentRequest>> {
    let ready = if script.page.loaded {
        ReadyState::Complete
    } else {
        ReadyState::Loading
    };
    let page = HostPage::new(&script.page.url)
        .with_referrer(&script.page.referrer)
        .with_title(&script.page.title)
        .with_viewport_width(script.page.width)
        .with_ready_state(ready);

    let config = load_tracker_config(&script.script.tag())?;
    let clock = Arc::new(ManualClock::new(SystemClock.now_ms()));
    let recorder = RecordingTransport::new();
    let options = InstallOptions {
        clock: Some(clock.clone()),
        transport: dry_run.then(|| Arc::new(recorder.clone()) as Arc<dyn Transport>),
        navigation: None,
    };

    let Some(api) = install_with(&page, &config, options) else {
        bail!("tracker not installed: missing site key or tracking disabled");
    };

    for step in &script.steps {
        tracing::debug!(?step, "replay step");
        match step {
            Step::Push { url } => page.push_state(url),
            Step::Replace { url } => page.replace_state(url),
            Step::Back => {
                page.back();
            }
            Step::Forward => {
                page.forward();
            }
            Step::Advance { seconds } => {
                let Ok(by) = Duration::try_from_secs_f64(seconds.max(0.0)) else {
                    bail!("invalid advance of {} seconds", seconds);
                };
                clock.advance(by);
            }
            Step::Track { name, properties } => {
                api.track(name.as_deref(), properties.clone());
            }
            Step::Title { title } => page.set_title(title),
            Step::Hide => page.hide(),
            Step::Show => page.show(),
            Step::Unload => page.unload(),
            Step::Load => page.finish_loading(),
        }
    }

    api.shutdown();
    page.discard();
    Ok(recorder.take())
}
