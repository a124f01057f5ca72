//! # pagetrail tracker
//!
//! Embeddable page-view and event tracker. It watches a host page for
//! navigation (including virtual SPA navigation through the history API),
//! measures time on page, and relays page views, custom events and leave
//! durations to a pagetrail collector.
//!
//! ## Guarantees
//!
//! - **Never breaks the host**: no operation reachable from host code fails;
//!   every problem degrades to "no telemetry for this event"
//! - **Never waits on the network**: payloads are built synchronously and
//!   handed off without awaiting delivery
//! - **No retries, no queue**: the collector tolerates loss, duplicates and
//!   reordering
//! - **Nothing outlives the page**: session state belongs to one tracker
//!
//! ## Embedding
//!
//! ```no_run
//! use pagetrail_tracker::{install, HostPage, ReadyState, ScriptTag};
//!
//! let page = HostPage::new("https://example.com/").with_ready_state(ReadyState::Complete);
//! let tag = ScriptTag::new("https://stats.example.com/js/pagetrail.js")
//!     .with_attribute("data-site-key", "abc");
//!
//! if let Some(api) = install(&page, &tag) {
//!     api.track(Some("signup"), Some(serde_json::json!({ "plan": "pro" })));
//! }
//! ```
//!
//! ## Opt-Out
//!
//! ```bash
//! export PAGETRAIL_DISABLED=1
//! # or the universal
//! export DO_NOT_TRACK=1
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod host;
pub mod navigation;
pub mod page;
pub mod payload;
pub mod tracker;
pub mod transport;

pub use api::{install, install_with, InstallOptions, PublicApi, GLOBAL_NAMESPACE};
pub use clock::{Clock, ManualClock, SessionClock, SystemClock};
pub use config::{ScriptTag, TrackerConfig, TransportPreference};
pub use error::TrackerError;
pub use host::{HostPage, ReadyState, WeakHostPage};
pub use navigation::{HistoryNavigation, InMemoryNavigation, NavigationSource, PageSignal};
pub use page::PageEnvironment;
pub use payload::{PayloadBuilder, TelemetryPayload, TrackInput};
pub use tracker::Tracker;
pub use transport::{DeliveryChannel, RecordingTransport, Transport};

/// Re-export common types
pub type Result<T> = anyhow::Result<T>;
