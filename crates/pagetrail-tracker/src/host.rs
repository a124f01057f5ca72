//! In-process model of the page hosting the tracker
//!
//! `HostPage` holds the state a browser document exposes to an embedded
//! script: location and history stack, referrer, viewport, title, ready
//! state and visibility. Embedders drive it (a headless driver, the replay
//! CLI, tests) and the tracker observes it through the capability traits in
//! [`crate::page`] and [`crate::navigation`].
//!
//! Listeners are always invoked with the page lock released, so they are free
//! to read the page back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use reqwest::Url;

use crate::api::PublicApi;
use crate::navigation::NavigationKind;
use crate::page::PageEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Hidden,
    Unload,
}

/// Replacement for the history mutation entry points (push/replace).
pub type HistoryHook = Arc<dyn Fn(NavigationKind) + Send + Sync>;
pub type PopStateListener = Arc<dyn Fn() + Send + Sync>;
pub type LifecycleListener = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;
type LoadListener = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct HostState {
    entries: Vec<String>,
    index: usize,
    referrer: String,
    title: String,
    viewport_width: u32,
    ready_state: ReadyState,
    visibility: Visibility,
    history_hook: Option<HistoryHook>,
    popstate: Vec<(ListenerId, PopStateListener)>,
    lifecycle: Vec<(ListenerId, LifecycleListener)>,
    on_load: Vec<LoadListener>,
    globals: HashMap<String, Arc<PublicApi>>,
    next_listener: u64,
}

impl HostState {
    fn href(&self) -> &str {
        &self.entries[self.index]
    }

    fn resolve(&self, url: &str) -> String {
        Url::parse(self.href())
            .and_then(|base| base.join(url))
            .map(String::from)
            .unwrap_or_else(|_| url.to_string())
    }

    fn listener_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        ListenerId(self.next_listener)
    }
}

/// Shared handle to a host page.
#[derive(Clone)]
pub struct HostPage {
    inner: Arc<Mutex<HostState>>,
}

impl HostPage {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HostState {
                entries: vec![href.into()],
                index: 0,
                referrer: String::new(),
                title: String::new(),
                viewport_width: 0,
                ready_state: ReadyState::Loading,
                visibility: Visibility::Visible,
                history_hook: None,
                popstate: Vec::new(),
                lifecycle: Vec::new(),
                on_load: Vec::new(),
                globals: HashMap::new(),
                next_listener: 0,
            })),
        }
    }

    pub fn with_referrer(self, referrer: impl Into<String>) -> Self {
        self.lock().referrer = referrer.into();
        self
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.set_title(title);
        self
    }

    pub fn with_viewport_width(self, width: u32) -> Self {
        self.set_viewport_width(width);
        self
    }

    pub fn with_ready_state(self, state: ReadyState) -> Self {
        self.lock().ready_state = state;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.lock().title = title.into();
    }

    pub fn set_viewport_width(&self, width: u32) {
        self.lock().viewport_width = width;
    }

    /// Change the location without notifying anyone.
    pub fn set_href(&self, href: &str) {
        let mut state = self.lock();
        let href = state.resolve(href);
        let index = state.index;
        state.entries[index] = href;
    }

    pub fn ready_state(&self) -> ReadyState {
        self.lock().ready_state
    }

    pub fn visibility(&self) -> Visibility {
        self.lock().visibility
    }

    pub fn history_len(&self) -> usize {
        self.lock().entries.len()
    }

    // history

    /// `history.pushState`: the location changes first, then the installed
    /// hook (if any) sees the change.
    pub fn push_state(&self, url: &str) {
        let hook = {
            let mut state = self.lock();
            let href = state.resolve(url);
            let keep = state.index + 1;
            state.entries.truncate(keep);
            state.entries.push(href);
            state.index += 1;
            state.history_hook.clone()
        };
        if let Some(hook) = hook {
            hook(NavigationKind::Push);
        }
    }

    /// `history.replaceState`
    pub fn replace_state(&self, url: &str) {
        let hook = {
            let mut state = self.lock();
            let href = state.resolve(url);
            let index = state.index;
            state.entries[index] = href;
            state.history_hook.clone()
        };
        if let Some(hook) = hook {
            hook(NavigationKind::Replace);
        }
    }

    /// Move one entry back; fires `popstate` when there was somewhere to go.
    pub fn back(&self) -> bool {
        self.traverse(-1)
    }

    pub fn forward(&self) -> bool {
        self.traverse(1)
    }

    fn traverse(&self, delta: isize) -> bool {
        let listeners = {
            let mut state = self.lock();
            let Some(target) = state.index.checked_add_signed(delta) else {
                return false;
            };
            if target >= state.entries.len() {
                return false;
            }
            state.index = target;
            state
                .popstate
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect::<Vec<_>>()
        };
        for listener in listeners {
            listener();
        }
        true
    }

    /// Swap the history hook, returning the one it replaces.
    pub fn set_history_hook(&self, hook: Option<HistoryHook>) -> Option<HistoryHook> {
        std::mem::replace(&mut self.lock().history_hook, hook)
    }

    /// Swap the history hook only while `expected` is still the installed
    /// one. Returns `false` and leaves the page alone otherwise.
    pub fn replace_history_hook_if(&self, expected: &HistoryHook, hook: Option<HistoryHook>) -> bool {
        let mut state = self.lock();
        let current = matches!(&state.history_hook, Some(installed) if Arc::ptr_eq(installed, expected));
        if !current {
            drop(state);
            drop(hook);
            return false;
        }
        let replaced = std::mem::replace(&mut state.history_hook, hook);
        drop(state);
        drop(replaced);
        true
    }

    pub fn add_popstate_listener(&self, listener: PopStateListener) -> ListenerId {
        let mut state = self.lock();
        let id = state.listener_id();
        state.popstate.push((id, listener));
        id
    }

    pub fn remove_popstate_listener(&self, id: ListenerId) {
        self.lock().popstate.retain(|(existing, _)| *existing != id);
    }

    // lifecycle

    pub fn add_lifecycle_listener(&self, listener: LifecycleListener) -> ListenerId {
        let mut state = self.lock();
        let id = state.listener_id();
        state.lifecycle.push((id, listener));
        id
    }

    pub fn remove_lifecycle_listener(&self, id: ListenerId) {
        self.lock().lifecycle.retain(|(existing, _)| *existing != id);
    }

    /// Tab goes to the background. Only a visible page fires the event.
    pub fn hide(&self) {
        let was_visible = {
            let mut state = self.lock();
            std::mem::replace(&mut state.visibility, Visibility::Hidden) == Visibility::Visible
        };
        if was_visible {
            self.dispatch_lifecycle(LifecycleEvent::Hidden);
        }
    }

    pub fn show(&self) {
        self.lock().visibility = Visibility::Visible;
    }

    /// `beforeunload`
    pub fn unload(&self) {
        self.dispatch_lifecycle(LifecycleEvent::Unload);
    }

    fn dispatch_lifecycle(&self, event: LifecycleEvent) {
        let listeners = self
            .lock()
            .lifecycle
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(event);
        }
    }

    /// Run `listener` once the document has finished loading, or right away
    /// if it already has.
    pub fn on_load(&self, listener: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        if state.ready_state == ReadyState::Complete {
            drop(state);
            listener();
        } else {
            state.on_load.push(Box::new(listener));
        }
    }

    /// Mark the document complete and fire the load listeners.
    pub fn finish_loading(&self) {
        let listeners = {
            let mut state = self.lock();
            if state.ready_state == ReadyState::Complete {
                return;
            }
            state.ready_state = ReadyState::Complete;
            std::mem::take(&mut state.on_load)
        };
        for listener in listeners {
            listener();
        }
    }

    // global namespace

    pub fn expose(&self, namespace: &str, api: Arc<PublicApi>) {
        self.lock().globals.insert(namespace.to_string(), api);
    }

    pub fn global(&self, namespace: &str) -> Option<Arc<PublicApi>> {
        self.lock().globals.get(namespace).cloned()
    }

    /// A handle that doesn't keep the page alive.
    pub fn downgrade(&self) -> WeakHostPage {
        WeakHostPage {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Discard the document: globals, hooks and listeners go away with it.
    pub fn discard(&self) {
        let (globals, hook, popstate, lifecycle, on_load) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.globals),
                state.history_hook.take(),
                std::mem::take(&mut state.popstate),
                std::mem::take(&mut state.lifecycle),
                std::mem::take(&mut state.on_load),
            )
        };
        // dropped outside the lock, they may hold the page themselves
        drop((globals, hook, popstate, lifecycle, on_load));
    }
}

impl PageEnvironment for HostPage {
    fn href(&self) -> String {
        self.lock().href().to_string()
    }

    fn referrer(&self) -> String {
        self.lock().referrer.clone()
    }

    fn viewport_width(&self) -> u32 {
        self.lock().viewport_width
    }

    fn title(&self) -> String {
        self.lock().title.clone()
    }
}

/// Non-owning handle to a [`HostPage`].
///
/// Whatever the page itself keeps alive (the exposed API and the tracker
/// behind it) reads the page through this, so dropping the last `HostPage`
/// frees everything. A dropped page reads as blank.
#[derive(Clone)]
pub struct WeakHostPage {
    inner: Weak<Mutex<HostState>>,
}

impl WeakHostPage {
    pub fn upgrade(&self) -> Option<HostPage> {
        self.inner.upgrade().map(|inner| HostPage { inner })
    }
}

impl PageEnvironment for WeakHostPage {
    fn href(&self) -> String {
        self.upgrade().map(|page| page.href()).unwrap_or_default()
    }

    fn referrer(&self) -> String {
        self.upgrade().map(|page| page.referrer()).unwrap_or_default()
    }

    fn viewport_width(&self) -> u32 {
        self.upgrade().map(|page| page.viewport_width()).unwrap_or(0)
    }

    fn title(&self) -> String {
        self.upgrade().map(|page| page.title()).unwrap_or_default()
    }
}
