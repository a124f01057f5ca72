//! Tracker configuration loading and validation
//!
//! The script tag embedding the tracker is the primary source of
//! configuration. Config files and environment variables are layered around
//! it so operators can opt out or switch on debug output without touching the
//! host page.

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrackerError;

pub const SITE_KEY_ATTR: &str = "data-site-key";
pub const API_URL_ATTR: &str = "data-api-url";
pub const INCLUDE_QUERY_ATTR: &str = "data-include-query";

/// The `<script>` element that loaded the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptTag {
    pub src: String,
    pub attributes: BTreeMap<String, String>,
}

impl ScriptTag {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// How payloads leave the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Beacon when available, keep-alive request otherwise.
    #[default]
    Auto,
    Beacon,
    #[serde(rename = "keepalive")]
    KeepAlive,
}

/// Tracker configuration before validation
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// Opaque per-site identifier (`data-site-key`)
    #[serde(default)]
    pub site_key: Option<String>,

    /// Collector base url (`data-api-url`, or the script's directory)
    #[serde(default)]
    pub api_url: Option<String>,

    /// Keep the query string in reported paths (default: false)
    #[serde(default)]
    pub include_query: bool,

    /// Whether tracking is enabled (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Debug mode - print payloads instead of sending (default: false)
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub transport: TransportPreference,

    /// Report at most one leave payload per page view
    #[serde(default)]
    pub dedupe_leave: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            site_key: None,
            api_url: None,
            include_query: false,
            enabled: true,
            debug: false,
            transport: TransportPreference::Auto,
            dedupe_leave: false,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Validated configuration a tracker runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub site_key: String,
    pub api_url: String,
    pub include_query: bool,
    pub debug: bool,
    pub transport: TransportPreference,
    pub dedupe_leave: bool,
}

impl TrackerConfig {
    /// Read the tracker attributes off a script tag.
    ///
    /// An absent `data-api-url` falls back to the directory the script was
    /// served from.
    pub fn from_script_tag(tag: &ScriptTag) -> Result<Self, TrackerError> {
        let site_key = tag
            .attribute(SITE_KEY_ATTR)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        let api_url = match tag
            .attribute(API_URL_ATTR)
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => script_directory(&tag.src)?,
        };

        let include_query = tag
            .attribute(INCLUDE_QUERY_ATTR)
            .map(parse_flag)
            .unwrap_or(false);

        Ok(Self {
            site_key,
            api_url: Some(api_url),
            include_query,
            ..Self::default()
        })
    }

    /// Validate into the configuration a tracker can run with.
    pub fn resolve(&self) -> Result<ResolvedConfig, TrackerError> {
        let site_key = self
            .site_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(TrackerError::MissingSiteKey)?
            .to_string();

        let api_url = self
            .api_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
            .ok_or_else(|| TrackerError::InvalidApiUrl(String::new()))?;
        Url::parse(api_url).map_err(|_| TrackerError::InvalidApiUrl(api_url.to_string()))?;

        Ok(ResolvedConfig {
            site_key,
            api_url: api_url.to_string(),
            include_query: self.include_query,
            debug: self.debug,
            transport: self.transport,
            dedupe_leave: self.dedupe_leave,
        })
    }
}

/// Directory containing the script, without a trailing slash.
///
/// `https://cdn.example.com/js/pagetrail.js?v=3` becomes
/// `https://cdn.example.com/js`.
pub fn script_directory(src: &str) -> Result<String, TrackerError> {
    let invalid = |reason: &str| TrackerError::InvalidScriptSource {
        src: src.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(src).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("not an http(s) url"));
    }

    let path = url.path();
    let dir = &path[..path.rfind('/').unwrap_or(0)];
    Ok(format!("{}{}", url.origin().ascii_serialization(), dir))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "true" | "1" | "yes"
    )
}

/// Where config files are looked up.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub user: Option<PathBuf>,
    pub project: Option<PathBuf>,
}

impl ConfigSources {
    /// `~/.pagetrail/config.toml` and `.pagetrail/config.toml`
    pub fn discover() -> Self {
        Self {
            user: dirs::home_dir().map(|home| home.join(".pagetrail/config.toml")),
            project: Some(PathBuf::from(".pagetrail/config.toml")),
        }
    }
}

/// Load tracker configuration with precedence:
/// 1. Environment variables (highest priority)
/// 2. Script tag attributes
/// 3. Project config (.pagetrail/config.toml)
/// 4. User config (~/.pagetrail/config.toml)
/// 5. Default (enabled=true)
///
/// The site key only ever comes from the script tag.
pub fn load_tracker_config(tag: &ScriptTag) -> Result<TrackerConfig, TrackerError> {
    load_tracker_config_with(tag, &ConfigSources::discover())
}

pub fn load_tracker_config_with(
    tag: &ScriptTag,
    sources: &ConfigSources,
) -> Result<TrackerConfig, TrackerError> {
    let mut config = TrackerConfig::default();

    for path in [&sources.user, &sources.project].into_iter().flatten() {
        if !path.exists() {
            continue;
        }
        match load_config_from_file(path) {
            Ok(mut cfg) => {
                if cfg.site_key.take().is_some() {
                    tracing::warn!(path = %path.display(), "site_key in config files is ignored");
                }
                merge_config(&mut config, cfg);
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring tracker config"),
        }
    }

    let from_tag = TrackerConfig::from_script_tag(tag)?;
    let include_query = tag
        .attribute(INCLUDE_QUERY_ATTR)
        .map(|_| from_tag.include_query);
    merge_config(&mut config, from_tag);
    if let Some(include_query) = include_query {
        config.include_query = include_query;
    }
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load tracker config from a TOML file
pub fn load_config_from_file(path: &Path) -> Result<TrackerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;

    #[derive(Deserialize)]
    struct FullConfig {
        #[serde(default)]
        tracker: Option<TrackerConfig>,
    }

    let full_config: FullConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;

    Ok(full_config.tracker.unwrap_or_default())
}

/// Merge new config into existing config
fn merge_config(base: &mut TrackerConfig, new: TrackerConfig) {
    // Booleans can't tell "unset" from "default", so only the non-default
    // value of each one is allowed to win.
    if !new.enabled {
        base.enabled = false;
    }
    if new.debug {
        base.debug = true;
    }
    if new.include_query {
        base.include_query = true;
    }
    if new.dedupe_leave {
        base.dedupe_leave = true;
    }
    if new.transport != TransportPreference::Auto {
        base.transport = new.transport;
    }
    if new.site_key.is_some() {
        base.site_key = new.site_key;
    }
    if new.api_url.is_some() {
        base.api_url = new.api_url;
    }
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut TrackerConfig) {
    // PAGETRAIL_DISABLED=1 disables tracking
    if env::var("PAGETRAIL_DISABLED").is_ok() {
        config.enabled = false;
        return;
    }

    // DO_NOT_TRACK=1 (universal opt-out)
    if env::var("DO_NOT_TRACK").is_ok() {
        config.enabled = false;
        return;
    }

    if env::var("PAGETRAIL_DEBUG").is_ok() {
        config.debug = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn tag() -> ScriptTag {
        ScriptTag::new("https://cdn.example.com/js/pagetrail.js").with_attribute(SITE_KEY_ATTR, "abc")
    }

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert!(config.enabled);
        assert!(!config.debug);
        assert!(!config.include_query);
        assert!(config.site_key.is_none());
        assert_eq!(config.transport, TransportPreference::Auto);
    }

    #[test]
    fn test_api_url_defaults_to_script_directory() {
        let config = TrackerConfig::from_script_tag(&tag()).unwrap();
        assert_eq!(config.api_url.as_deref(), Some("https://cdn.example.com/js"));
    }

    #[test]
    fn test_script_directory_variants() {
        assert_eq!(
            script_directory("https://cdn.example.com/pagetrail.js").unwrap(),
            "https://cdn.example.com"
        );
        assert_eq!(
            script_directory("http://localhost:8080/static/t.js?v=2#x").unwrap(),
            "http://localhost:8080/static"
        );
        assert!(script_directory("pagetrail.js").is_err());
        assert!(script_directory("file:///tmp/pagetrail.js").is_err());
    }

    #[test]
    fn test_explicit_api_url_wins() {
        let tag = tag().with_attribute(API_URL_ATTR, "https://stats.example.org/");
        let config = TrackerConfig::from_script_tag(&tag).unwrap();
        assert_eq!(config.api_url.as_deref(), Some("https://stats.example.org"));
    }

    #[test]
    fn test_include_query_flag() {
        for (value, expected) in [("true", true), ("", true), ("false", false), ("no", false)] {
            let tag = tag().with_attribute(INCLUDE_QUERY_ATTR, value);
            let config = TrackerConfig::from_script_tag(&tag).unwrap();
            assert_eq!(config.include_query, expected, "value {:?}", value);
        }
        assert!(!TrackerConfig::from_script_tag(&tag()).unwrap().include_query);
    }

    #[test]
    fn test_missing_site_key_fails_resolution() {
        let tag = ScriptTag::new("https://cdn.example.com/pagetrail.js");
        let config = TrackerConfig::from_script_tag(&tag).unwrap();
        assert!(matches!(config.resolve(), Err(TrackerError::MissingSiteKey)));

        let blank = tag.with_attribute(SITE_KEY_ATTR, "   ");
        let config = TrackerConfig::from_script_tag(&blank).unwrap();
        assert!(matches!(config.resolve(), Err(TrackerError::MissingSiteKey)));
    }

    #[test]
    fn test_resolve_rejects_relative_api_url() {
        let tag = tag().with_attribute(API_URL_ATTR, "/stats");
        let config = TrackerConfig::from_script_tag(&tag).unwrap();
        assert!(matches!(config.resolve(), Err(TrackerError::InvalidApiUrl(_))));
    }

    #[test]
    fn test_config_merge() {
        let mut base = TrackerConfig {
            site_key: Some("base".to_string()),
            ..TrackerConfig::default()
        };

        let override_config = TrackerConfig {
            site_key: Some("override".to_string()),
            enabled: false,
            debug: true,
            transport: TransportPreference::KeepAlive,
            ..TrackerConfig::default()
        };

        merge_config(&mut base, override_config);

        assert!(!base.enabled);
        assert!(base.debug);
        assert_eq!(base.site_key.as_deref(), Some("override"));
        assert_eq!(base.transport, TransportPreference::KeepAlive);
    }

    #[test]
    fn test_load_config_from_file_with_tracker_section() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("config.toml");

        fs::write(
            &config_file,
            r#"
[tracker]
enabled = false
debug = true
transport = "keepalive"
"#,
        )
        .unwrap();

        let config = load_config_from_file(&config_file).unwrap();
        assert!(!config.enabled);
        assert!(config.debug);
        assert_eq!(config.transport, TransportPreference::KeepAlive);
    }

    #[test]
    fn test_load_config_from_file_without_tracker_section() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("config.toml");
        fs::write(&config_file, "[other]\nkey = 1\n").unwrap();

        let config = load_config_from_file(&config_file).unwrap();
        assert!(config.enabled);
        assert!(!config.debug);
    }

    #[test]
    #[serial]
    fn test_script_tag_overrides_project_file() {
        let temp_dir = TempDir::new().unwrap();
        let project = temp_dir.path().join("config.toml");
        fs::write(
            &project,
            r#"
[tracker]
site_key = "from-file"
api_url = "https://file.example.com"
dedupe_leave = true
"#,
        )
        .unwrap();

        let sources = ConfigSources {
            user: None,
            project: Some(project),
        };
        let config = load_tracker_config_with(&tag(), &sources).unwrap();
        assert_eq!(config.site_key.as_deref(), Some("abc"));
        assert_eq!(config.api_url.as_deref(), Some("https://cdn.example.com/js"));
        assert!(config.dedupe_leave);
    }

    #[test]
    #[serial]
    fn test_site_key_is_never_read_from_files() {
        let temp_dir = TempDir::new().unwrap();
        let user = temp_dir.path().join("user.toml");
        fs::write(&user, "[tracker]\nsite_key = \"from-file\"\ndebug = true\n").unwrap();

        let sources = ConfigSources {
            user: Some(user),
            project: None,
        };
        let tag = ScriptTag::new("https://cdn.example.com/js/pagetrail.js");
        let config = load_tracker_config_with(&tag, &sources).unwrap();

        assert!(config.site_key.is_none());
        assert!(config.debug);
        assert!(matches!(config.resolve(), Err(TrackerError::MissingSiteKey)));
    }

    #[test]
    #[serial]
    fn test_script_tag_include_query_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let project = temp_dir.path().join("config.toml");
        fs::write(&project, "[tracker]\ninclude_query = true\n").unwrap();
        let sources = ConfigSources {
            user: None,
            project: Some(project),
        };

        let config = load_tracker_config_with(&tag(), &sources).unwrap();
        assert!(config.include_query);

        let tag = tag().with_attribute(INCLUDE_QUERY_ATTR, "false");
        let config = load_tracker_config_with(&tag, &sources).unwrap();
        assert!(!config.include_query);
    }

    #[test]
    #[serial]
    fn test_broken_config_file_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let project = temp_dir.path().join("config.toml");
        fs::write(&project, "[tracker\nnot toml").unwrap();

        let sources = ConfigSources {
            user: None,
            project: Some(project),
        };
        let config = load_tracker_config_with(&tag(), &sources).unwrap();
        assert_eq!(config.site_key.as_deref(), Some("abc"));
    }

    #[test]
    #[serial]
    fn test_env_var_disables_tracking() {
        let original = env::var("PAGETRAIL_DISABLED").ok();

        env::set_var("PAGETRAIL_DISABLED", "1");
        let mut config = TrackerConfig::default();
        apply_env_overrides(&mut config);
        assert!(!config.enabled);

        env::remove_var("PAGETRAIL_DISABLED");
        if let Some(val) = original {
            env::set_var("PAGETRAIL_DISABLED", val);
        }
    }

    #[test]
    #[serial]
    fn test_do_not_track_disables_tracking() {
        let original = env::var("DO_NOT_TRACK").ok();

        env::set_var("DO_NOT_TRACK", "1");
        let mut config = TrackerConfig::default();
        apply_env_overrides(&mut config);
        assert!(!config.enabled);

        env::remove_var("DO_NOT_TRACK");
        if let Some(val) = original {
            env::set_var("DO_NOT_TRACK", val);
        }
    }

    #[test]
    #[serial]
    fn test_debug_mode_from_env() {
        let original = env::var("PAGETRAIL_DEBUG").ok();

        env::set_var("PAGETRAIL_DEBUG", "1");
        let mut config = TrackerConfig::default();
        apply_env_overrides(&mut config);
        assert!(config.debug);

        env::remove_var("PAGETRAIL_DEBUG");
        if let Some(val) = original {
            env::set_var("PAGETRAIL_DEBUG", val);
        }
    }
}
