// Content script: the per-tab context that owns the overlay.

pub mod dom;
pub mod extractor;
pub mod lifecycle;
pub mod navigation;
pub mod overlay;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use scoutai_core::protocol::TabId;
use scoutai_core::settings::SettingsStore;

use crate::bus::MessageBus;
pub use dom::{Document, HeadlessDocument, ReadyState};
pub use extractor::{DataIslandExtractor, DraftExtractor};
pub use lifecycle::{ContentOptions, ContentScript, LifecycleState, TabSession};

/// A running content script.
pub struct ContentHandle {
    tab_id: TabId,
    state: watch::Receiver<LifecycleState>,
    task: JoinHandle<()>,
}

impl ContentHandle {
    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    pub async fn wait_for(&mut self, predicate: impl Fn(LifecycleState) -> bool) -> LifecycleState {
        wait_for_state(&mut self.state, predicate).await
    }

    /// Wait for the script to exit after its endpoint closed.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Wait until the lifecycle state satisfies `predicate`. Returns the
/// matching state, or the last one seen if the script has stopped.
pub async fn wait_for_state(
    state: &mut watch::Receiver<LifecycleState>,
    predicate: impl Fn(LifecycleState) -> bool,
) -> LifecycleState {
    loop {
        let current = *state.borrow_and_update();
        if predicate(current) {
            return current;
        }
        if state.changed().await.is_err() {
            return *state.borrow();
        }
    }
}

/// Inject a content script into the page behind `document` and start it.
pub fn spawn_content_script(
    tab_id: TabId,
    bus: MessageBus,
    document: Arc<dyn Document>,
    extractor: Arc<dyn DraftExtractor>,
    settings: SettingsStore,
    options: ContentOptions,
) -> ContentHandle {
    let (mut script, inbox) =
        ContentScript::new(tab_id, bus, document, extractor, settings, options);
    // Observers must never see the pre-activation state.
    script.activate();
    let state = script.state_watch();
    let task = tokio::spawn(lifecycle::run(script, inbox));
    ContentHandle { tab_id, state, task }
}
