// Headless browser host.
//
// Stands in for the browser around the extension: owns tabs and their
// documents, reports navigation and icon clicks to the background router,
// and carries out the router's injection and popup requests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use scoutai_core::protocol::{ContextAddr, TabId};
use scoutai_core::settings::SettingsStore;

use crate::background::{BrowserEvent, BrowserShell};
use crate::bus::MessageBus;
use crate::content::{
    spawn_content_script, wait_for_state, ContentHandle, ContentOptions, Document, DraftExtractor,
    HeadlessDocument, LifecycleState,
};
use crate::popup::ActiveTab;

const EVENT_CAPACITY: usize = 64;

struct Tab {
    document: Arc<HeadlessDocument>,
    script: Option<ContentHandle>,
}

struct BrowserInner {
    bus: MessageBus,
    settings: SettingsStore,
    extractor: Arc<dyn DraftExtractor>,
    options: ContentOptions,
    tabs: Mutex<BTreeMap<TabId, Tab>>,
    active: Mutex<Option<TabId>>,
    next_tab: AtomicU32,
    popups_opened: AtomicUsize,
    events: mpsc::Sender<BrowserEvent>,
}

/// Cloneable handle to the headless browser.
#[derive(Clone)]
pub struct HeadlessBrowser {
    inner: Arc<BrowserInner>,
}

impl HeadlessBrowser {
    /// Create a browser. The receiver carries its events to the background
    /// router.
    pub fn new(
        bus: MessageBus,
        settings: SettingsStore,
        extractor: Arc<dyn DraftExtractor>,
        options: ContentOptions,
    ) -> (Self, mpsc::Receiver<BrowserEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let browser = HeadlessBrowser {
            inner: Arc::new(BrowserInner {
                bus,
                settings,
                extractor,
                options,
                tabs: Mutex::new(BTreeMap::new()),
                active: Mutex::new(None),
                next_tab: AtomicU32::new(1),
                popups_opened: AtomicUsize::new(0),
                events,
            }),
        };
        (browser, rx)
    }

    fn tabs(&self) -> MutexGuard<'_, BTreeMap<TabId, Tab>> {
        self.inner.tabs.lock().expect("tab table poisoned")
    }

    async fn emit(&self, event: BrowserEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("Background router is gone, dropping browser event");
        }
    }

    /// Tell the background the extension has started.
    pub async fn activate(&self) {
        self.emit(BrowserEvent::Activated).await;
    }

    /// Open a new tab on a loaded page at `url` and make it active.
    pub async fn open_tab(&self, url: &str) -> TabId {
        self.open_document(Arc::new(HeadlessDocument::loaded(url))).await
    }

    /// Open a new tab showing `document` and make it active.
    pub async fn open_document(&self, document: Arc<HeadlessDocument>) -> TabId {
        let tab = self.inner.next_tab.fetch_add(1, Ordering::Relaxed);
        let url = document.url();
        self.tabs().insert(
            tab,
            Tab {
                document,
                script: None,
            },
        );
        *self.inner.active.lock().expect("active tab poisoned") = Some(tab);
        info!(tab, %url, "Opened tab");
        self.emit(BrowserEvent::NavigationCompleted { tab, url }).await;
        tab
    }

    /// Full page load: the old document and its content script go away.
    pub async fn navigate(&self, tab: TabId, url: &str) -> Result<()> {
        let old = {
            let mut tabs = self.tabs();
            let entry = tabs.get_mut(&tab).ok_or_else(|| anyhow!("no tab {tab}"))?;
            entry.document = Arc::new(HeadlessDocument::loaded(url));
            entry.script.take()
        };
        self.inner.bus.unregister(ContextAddr::Tab(tab));
        if let Some(script) = old {
            script.join().await;
        }
        self.emit(BrowserEvent::NavigationCompleted {
            tab,
            url: url.to_string(),
        })
        .await;
        Ok(())
    }

    /// Client-side navigation: the URL changes, the page does not reload.
    pub fn push_url(&self, tab: TabId, url: &str) -> Result<()> {
        self.document(tab)
            .ok_or_else(|| anyhow!("no tab {tab}"))?
            .set_url(url);
        Ok(())
    }

    pub async fn close_tab(&self, tab: TabId) {
        let removed = self.tabs().remove(&tab);
        {
            let mut active = self.inner.active.lock().expect("active tab poisoned");
            if *active == Some(tab) {
                *active = None;
            }
        }
        self.emit(BrowserEvent::TabRemoved { tab }).await;
        // The router may already have stopped.
        self.inner.bus.unregister(ContextAddr::Tab(tab));
        if let Some(script) = removed.and_then(|t| t.script) {
            script.join().await;
        }
        info!(tab, "Closed tab");
    }

    pub async fn click_icon(&self, tab: TabId) {
        let url = self.tab_url(tab);
        self.emit(BrowserEvent::IconClicked { tab, url }).await;
    }

    pub fn document(&self, tab: TabId) -> Option<Arc<HeadlessDocument>> {
        self.tabs().get(&tab).map(|t| Arc::clone(&t.document))
    }

    pub fn active_tab(&self) -> Option<ActiveTab> {
        let id = (*self.inner.active.lock().expect("active tab poisoned"))?;
        Some(ActiveTab {
            id,
            url: self.tab_url(id),
        })
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs().keys().copied().collect()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn popups_opened(&self) -> usize {
        self.inner.popups_opened.load(Ordering::Relaxed)
    }

    /// Lifecycle state of the tab's content script, if one is injected.
    pub fn content_state(&self, tab: TabId) -> Option<LifecycleState> {
        self.tabs().get(&tab)?.script.as_ref().map(|s| s.state())
    }

    /// Wait until the tab's content script reaches a state matching
    /// `predicate`. `None` if no script is injected.
    pub async fn wait_for_content(
        &self,
        tab: TabId,
        predicate: impl Fn(LifecycleState) -> bool,
    ) -> Option<LifecycleState> {
        let mut state = self.tabs().get(&tab)?.script.as_ref()?.subscribe();
        Some(wait_for_state(&mut state, predicate).await)
    }

    /// Wait until a content script has been injected into `tab`.
    pub async fn wait_for_injection(&self, tab: TabId) {
        while !self.is_injected(tab) {
            tokio::task::yield_now().await;
        }
    }

    fn is_injected(&self, tab: TabId) -> bool {
        self.inner.bus.is_registered(ContextAddr::Tab(tab))
            && self.tabs().get(&tab).is_some_and(|t| t.script.is_some())
    }

    /// Close every tab and wait for their content scripts to stop.
    pub async fn shutdown(&self) {
        for tab in self.tab_ids() {
            self.close_tab(tab).await;
        }
    }
}

#[async_trait]
impl BrowserShell for HeadlessBrowser {
    async fn inject_content_script(&self, tab: TabId) -> Result<()> {
        let document = self.document(tab).ok_or_else(|| anyhow!("no tab {tab}"))?;
        let handle = spawn_content_script(
            tab,
            self.inner.bus.clone(),
            document,
            Arc::clone(&self.inner.extractor),
            self.inner.settings.clone(),
            self.inner.options.clone(),
        );
        let previous = {
            let mut tabs = self.tabs();
            match tabs.get_mut(&tab) {
                Some(entry) => entry.script.replace(handle),
                None => {
                    handle.abort();
                    return Err(anyhow!("tab {tab} closed during injection"));
                }
            }
        };
        if let Some(previous) = previous {
            debug!(tab, "Replaced content script");
            previous.join().await;
        }
        Ok(())
    }

    async fn open_popup(&self) -> Result<()> {
        self.inner.popups_opened.fetch_add(1, Ordering::Relaxed);
        info!("Popup opened");
        Ok(())
    }

    fn tab_url(&self, tab: TabId) -> Option<String> {
        self.document(tab).map(|d| d.url())
    }
}
