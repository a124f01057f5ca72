//! The tracker instance: session state plus the track/leave logic

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{Clock, SessionClock};
use crate::config::ResolvedConfig;
use crate::navigation::{NavigationSource, PageSignal};
use crate::page::{current_path, PageEnvironment};
use crate::payload::{PayloadBuilder, TelemetryPayload};
use crate::transport::DeliveryChannel;

/// Where the current logical page view is.
///
/// `track` runs synchronously, so "tracking" is never observed from outside:
/// a page view goes straight from `Installed` back to `Installed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, no page view sent yet
    Idle,
    Installed,
    /// A leave payload went out; the next navigation starts over
    Leaving,
}

#[derive(Debug)]
struct SessionState {
    last_path: Option<String>,
    clock: SessionClock,
    phase: Phase,
}

/// One tracker per page load.
pub struct Tracker {
    config: ResolvedConfig,
    page: Arc<dyn PageEnvironment>,
    clock: Arc<dyn Clock>,
    channel: DeliveryChannel,
    state: Mutex<SessionState>,
}

impl Tracker {
    pub fn new(
        config: ResolvedConfig,
        page: Arc<dyn PageEnvironment>,
        clock: Arc<dyn Clock>,
        channel: DeliveryChannel,
    ) -> Self {
        Self {
            config,
            page,
            clock,
            channel,
            state: Mutex::new(SessionState {
                last_path: None,
                clock: SessionClock::default(),
                phase: Phase::Idle,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn builder(&self) -> PayloadBuilder<'_> {
        PayloadBuilder::new(&self.config.site_key, self.config.include_query, &*self.page)
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Path of the last page view sent.
    pub fn last_path(&self) -> Option<String> {
        self.state().last_path.clone()
    }

    pub fn page_start(&self) -> Option<i64> {
        self.state().clock.page_start()
    }

    /// Send a page view or a named event.
    ///
    /// Nothing sent through here is deduplicated. Payloads without a duration
    /// restart the page clock; page views also become the new `last_path`.
    pub fn track(&self, overrides: Option<&Value>) -> TelemetryPayload {
        let payload = self.builder().build(overrides);
        {
            let mut state = self.state();
            if payload.duration == 0 {
                state.clock.reset(self.clock.now_ms());
                if payload.name.is_empty() {
                    state.last_path = Some(payload.path.clone());
                    state.phase = Phase::Installed;
                }
            }
        }
        self.channel.deliver(&payload);
        payload
    }

    /// Implicit page view, skipped when the path hasn't changed.
    pub fn track_page_view(&self) -> Option<TelemetryPayload> {
        let path = current_path(&self.page.href(), self.config.include_query);
        if self.state().last_path.as_deref() == Some(path.as_str()) {
            tracing::debug!(path = %path, "page view suppressed, path unchanged");
            return None;
        }
        Some(self.track(None))
    }

    /// Report time spent on the current page.
    pub fn track_leave(&self) -> Option<TelemetryPayload> {
        let now = self.clock.now_ms();
        let duration = {
            let mut state = self.state();
            if self.config.dedupe_leave && state.phase == Phase::Leaving {
                tracing::debug!("leave already reported for this page view");
                return None;
            }
            let Some(duration) = state.clock.leave_duration(now) else {
                tracing::debug!("leave duration out of range, not reported");
                return None;
            };
            state.phase = Phase::Leaving;
            duration
        };

        let payload = self.builder().leave(duration);
        self.channel.deliver(&payload);
        Some(payload)
    }

    pub fn handle_signal(&self, signal: PageSignal) {
        match signal {
            PageSignal::Navigate(_) => {
                self.track_page_view();
            }
            PageSignal::Hidden | PageSignal::Unload => {
                self.track_leave();
            }
        }
    }

    /// Subscribe to a navigation source. Returns `false` if the source was
    /// already installed.
    pub fn observe(self: &Arc<Self>, source: &dyn NavigationSource) -> bool {
        let tracker = Arc::downgrade(self);
        source.subscribe(Arc::new(move |signal: PageSignal| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.handle_signal(signal);
            }
        }))
    }

    /// Stop delivery, letting in-flight payloads finish.
    pub fn close(&self) {
        self.channel.close();
    }
}
