//! Navigation and lifecycle observation
//!
//! A [`NavigationSource`] turns whatever the host uses to change pages into a
//! stream of [`PageSignal`]s. [`HistoryNavigation`] intercepts the history API
//! of a [`HostPage`]; [`InMemoryNavigation`] lets a test driver emit signals
//! directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::host::{HistoryHook, HostPage, LifecycleEvent, ListenerId};

/// Which history entry point moved the location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    Push,
    Replace,
    /// back/forward
    Pop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSignal {
    Navigate(NavigationKind),
    Hidden,
    Unload,
}

pub type SignalHandler = Arc<dyn Fn(PageSignal) + Send + Sync>;

pub trait NavigationSource: Send + Sync {
    /// Start delivering signals to `handler`.
    ///
    /// Returns `false` without touching anything when the source is already
    /// installed.
    fn subscribe(&self, handler: SignalHandler) -> bool;
}

struct Installed {
    hook: HistoryHook,
    active: Arc<AtomicBool>,
    previous: Option<HistoryHook>,
    popstate: ListenerId,
    lifecycle: ListenerId,
}

/// Intercepts `pushState`/`replaceState` on a host page and listens for
/// back/forward and lifecycle events.
pub struct HistoryNavigation {
    page: HostPage,
    installed: Mutex<Option<Installed>>,
}

impl HistoryNavigation {
    pub fn new(page: HostPage) -> Self {
        Self {
            page,
            installed: Mutex::new(None),
        }
    }

    fn installed(&self) -> MutexGuard<'_, Option<Installed>> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_installed(&self) -> bool {
        self.installed().is_some()
    }

    /// Put back the entry points that were there before `subscribe`.
    ///
    /// If someone patched history after us, their hook stays and ours turns
    /// into a plain pass-through. Returns `false` when nothing was installed.
    pub fn restore(&self) -> bool {
        let Some(installed) = self.installed().take() else {
            return false;
        };
        installed.active.store(false, Ordering::SeqCst);
        if !self
            .page
            .replace_history_hook_if(&installed.hook, installed.previous)
        {
            tracing::debug!("history hook was replaced after install, leaving it in place");
        }
        self.page.remove_popstate_listener(installed.popstate);
        self.page.remove_lifecycle_listener(installed.lifecycle);
        tracing::debug!("history interception removed");
        true
    }
}

impl NavigationSource for HistoryNavigation {
    fn subscribe(&self, handler: SignalHandler) -> bool {
        let mut installed = self.installed();
        if installed.is_some() {
            tracing::debug!("history interception already installed");
            return false;
        }

        // Whatever was patched in before us keeps running, and runs first.
        let previous = self.page.set_history_hook(None);
        let chained = previous.clone();
        let on_history = handler.clone();
        let active = Arc::new(AtomicBool::new(true));
        let enabled = active.clone();
        let hook: HistoryHook = Arc::new(move |kind: NavigationKind| {
            if let Some(previous) = &chained {
                previous(kind);
            }
            if enabled.load(Ordering::SeqCst) {
                on_history(PageSignal::Navigate(kind));
            }
        });
        self.page.set_history_hook(Some(hook.clone()));

        let on_pop = handler.clone();
        let popstate = self
            .page
            .add_popstate_listener(Arc::new(move || on_pop(PageSignal::Navigate(NavigationKind::Pop))));

        let lifecycle = self.page.add_lifecycle_listener(Arc::new(move |event: LifecycleEvent| {
            handler(match event {
                LifecycleEvent::Hidden => PageSignal::Hidden,
                LifecycleEvent::Unload => PageSignal::Unload,
            })
        }));

        *installed = Some(Installed {
            hook,
            active,
            previous,
            popstate,
            lifecycle,
        });
        true
    }
}

/// Navigation source driven by hand.
#[derive(Default)]
pub struct InMemoryNavigation {
    handler: Mutex<Option<SignalHandler>>,
}

impl InMemoryNavigation {
    pub fn new() -> Self {
        Self::default()
    }

    fn handler(&self) -> Option<SignalHandler> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.handler().is_some()
    }

    /// Deliver a signal to the subscriber, if there is one.
    pub fn emit(&self, signal: PageSignal) {
        if let Some(handler) = self.handler() {
            handler(signal);
        }
    }

    pub fn navigate(&self) {
        self.emit(PageSignal::Navigate(NavigationKind::Push));
    }
}

impl NavigationSource for InMemoryNavigation {
    fn subscribe(&self, handler: SignalHandler) -> bool {
        let mut slot = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(handler);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (SignalHandler, Arc<Mutex<Vec<PageSignal>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |signal: PageSignal| sink.lock().unwrap().push(signal)), seen)
    }

    #[test]
    fn test_history_signals() {
        let page = HostPage::new("https://example.com/");
        let navigation = HistoryNavigation::new(page.clone());
        let (handler, seen) = recorder();
        assert!(navigation.subscribe(handler));

        page.push_state("/a");
        page.replace_state("/b");
        page.back();
        page.hide();
        page.unload();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                PageSignal::Navigate(NavigationKind::Push),
                PageSignal::Navigate(NavigationKind::Replace),
                PageSignal::Navigate(NavigationKind::Pop),
                PageSignal::Hidden,
                PageSignal::Unload,
            ]
        );
    }

    #[test]
    fn test_second_install_does_not_double_patch() {
        let page = HostPage::new("https://example.com/");
        let navigation = HistoryNavigation::new(page.clone());
        let (first, seen) = recorder();
        let (second, _) = recorder();

        assert!(navigation.subscribe(first.clone()));
        assert!(!navigation.subscribe(second));
        assert!(!navigation.subscribe(first));

        page.push_state("/a");
        page.back();
        page.hide();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_existing_hook_runs_first() {
        let page = HostPage::new("https://example.com/");
        let order = Arc::new(Mutex::new(Vec::new()));
        let router = order.clone();
        page.set_history_hook(Some(Arc::new(move |_: NavigationKind| router.lock().unwrap().push("router"))));

        let navigation = HistoryNavigation::new(page.clone());
        let tracker = order.clone();
        navigation.subscribe(Arc::new(move |_: PageSignal| tracker.lock().unwrap().push("tracker")));

        page.push_state("/a");
        assert_eq!(*order.lock().unwrap(), vec!["router", "tracker"]);

        assert!(navigation.restore());
        page.push_state("/b");
        assert_eq!(*order.lock().unwrap(), vec!["router", "tracker", "router"]);
    }

    #[test]
    fn test_restore_then_reinstall() {
        let page = HostPage::new("https://example.com/");
        let navigation = HistoryNavigation::new(page.clone());
        let (handler, seen) = recorder();

        assert!(!navigation.restore());
        assert!(navigation.subscribe(handler.clone()));
        assert!(navigation.restore());
        assert!(!navigation.is_installed());

        page.push_state("/a");
        page.hide();
        assert!(seen.lock().unwrap().is_empty());

        assert!(navigation.subscribe(handler));
        page.push_state("/b");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_restore_keeps_hooks_installed_later() {
        let page = HostPage::new("https://example.com/");
        let navigation = HistoryNavigation::new(page.clone());
        let (handler, seen) = recorder();
        assert!(navigation.subscribe(handler));

        // a router patching history after the tracker, chaining to it
        let order = Arc::new(Mutex::new(Vec::new()));
        let inner = page.set_history_hook(None);
        let router = order.clone();
        page.set_history_hook(Some(Arc::new(move |kind: NavigationKind| {
            if let Some(inner) = &inner {
                inner(kind);
            }
            router.lock().unwrap().push("router");
        })));

        page.push_state("/a");
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(navigation.restore());
        page.push_state("/b");
        assert_eq!(*order.lock().unwrap(), vec!["router", "router"]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_in_memory_source() {
        let navigation = InMemoryNavigation::new();
        navigation.navigate();

        let (handler, seen) = recorder();
        assert!(navigation.subscribe(handler.clone()));
        assert!(!navigation.subscribe(handler));
        navigation.navigate();
        navigation.emit(PageSignal::Unload);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                PageSignal::Navigate(NavigationKind::Push),
                PageSignal::Unload
            ]
        );
    }
}
