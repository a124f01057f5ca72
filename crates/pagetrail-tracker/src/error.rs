//! Tracker error types

use thiserror::Error;

/// Errors surfaced while setting a tracker up.
///
/// Nothing in this enum ever reaches host-page code through `track`; these
/// only show up while resolving configuration, before any hooks exist.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("script tag has no data-site-key attribute")]
    MissingSiteKey,

    #[error("invalid script source '{src}': {reason}")]
    InvalidScriptSource { src: String, reason: String },

    #[error("invalid api url '{0}'")]
    InvalidApiUrl(String),

    #[error("failed to load tracker config: {0}")]
    Config(#[from] anyhow::Error),
}
