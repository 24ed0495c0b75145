// The content script's view of the host page.
//
// `Document` is the narrow seam between the lifecycle code and a page: read
// the URL, wait for the DOM, create and remove elements, set inline styles,
// attach click listeners, and hand a panel view to whatever draws it.
// `HeadlessDocument` is the in-memory page used by the headless browser host
// and by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::overlay::PanelView;

/// Handle to one element. Never reused within a document, so a handle held
/// by a torn-down instance cannot address a node created by its successor.
pub type NodeId = u64;

pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

/// Events a document pushes to the content script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomEvent {
    Click(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomError {
    #[error("node {0} is not attached to the document")]
    Detached(NodeId),
}

/// Description of an element to append.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSpec {
    pub tag: String,
    pub id: String,
    /// `None` appends to the document body.
    pub parent: Option<NodeId>,
    pub styles: Vec<(String, String)>,
    pub text: Option<String>,
}

impl ElementSpec {
    pub fn new(tag: &str, id: &str) -> Self {
        ElementSpec {
            tag: tag.to_string(),
            id: id.to_string(),
            parent: None,
            styles: Vec::new(),
            text: None,
        }
    }

    pub fn child_of(mut self, parent: NodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn style(mut self, property: &str, value: &str) -> Self {
        self.styles.push((property.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }
}

#[async_trait]
pub trait Document: Send + Sync {
    fn url(&self) -> String;

    fn ready_state(&self) -> ReadyState;

    /// Resolves once the document has left `Loading`.
    async fn content_loaded(&self);

    /// Every attached element carrying `id`, in creation order.
    fn elements_by_id(&self, id: &str) -> Vec<NodeId>;

    fn append_element(&self, spec: ElementSpec) -> Result<NodeId, DomError>;

    /// Remove `node` and its subtree, dropping their listeners. Returns
    /// `false` if the node was already gone.
    fn remove_node(&self, node: NodeId) -> bool;

    fn set_style(&self, node: NodeId, property: &str, value: &str) -> Result<(), DomError>;

    fn add_click_listener(
        &self,
        node: NodeId,
        events: mpsc::UnboundedSender<DomEvent>,
    ) -> Result<ListenerId, DomError>;

    fn remove_listener(&self, listener: ListenerId) -> bool;

    /// Draw `view` into the element `node`.
    fn render_panel(&self, node: NodeId, view: &PanelView) -> Result<(), DomError>;

    /// Text of an embedded data block (`<script type="application/json">`)
    /// with the given id.
    fn data_island(&self, id: &str) -> Option<String>;
}

// ---------------------------------------------------------------------------
// HeadlessDocument
// ---------------------------------------------------------------------------

/// The headless page keeps only what the overlay reads back: ids, tree
/// structure and styles.
#[derive(Debug, Clone)]
struct Node {
    id: String,
    parent: Option<NodeId>,
    styles: BTreeMap<String, String>,
}

struct Listener {
    node: NodeId,
    events: mpsc::UnboundedSender<DomEvent>,
}

#[derive(Default)]
struct Page {
    url: String,
    nodes: BTreeMap<NodeId, Node>,
    listeners: BTreeMap<ListenerId, Listener>,
    panels: HashMap<NodeId, PanelView>,
    islands: HashMap<String, String>,
    next_node: NodeId,
    next_listener: ListenerId,
}

impl Page {
    fn attached(&self, node: NodeId) -> Result<&Node, DomError> {
        self.nodes.get(&node).ok_or(DomError::Detached(node))
    }

    fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            let parent = out[i];
            out.extend(
                self.nodes
                    .iter()
                    .filter(|(_, n)| n.parent == Some(parent))
                    .map(|(id, _)| *id),
            );
            i += 1;
        }
        out
    }
}

/// In-memory page. URL changes, load completion and clicks are driven by
/// the owner (the headless browser or a test).
pub struct HeadlessDocument {
    page: Mutex<Page>,
    ready: watch::Sender<ReadyState>,
}

impl HeadlessDocument {
    pub fn new(url: impl Into<String>, ready_state: ReadyState) -> Self {
        let (ready, _) = watch::channel(ready_state);
        HeadlessDocument {
            page: Mutex::new(Page {
                url: url.into(),
                next_node: 1,
                next_listener: 1,
                ..Page::default()
            }),
            ready,
        }
    }

    /// A fully loaded page at `url`.
    pub fn loaded(url: impl Into<String>) -> Self {
        Self::new(url, ReadyState::Complete)
    }

    fn page(&self) -> MutexGuard<'_, Page> {
        self.page.lock().expect("document mutex poisoned")
    }

    /// Client-side navigation: the URL changes, the document stays.
    pub fn set_url(&self, url: impl Into<String>) {
        self.page().url = url.into();
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        self.ready.send_replace(state);
    }

    pub fn set_data_island(&self, id: &str, text: impl Into<String>) {
        self.page().islands.insert(id.to_string(), text.into());
    }

    pub fn remove_data_island(&self, id: &str) {
        self.page().islands.remove(id);
    }

    /// Click the first element with `id`. Returns how many listeners fired.
    pub fn click_id(&self, id: &str) -> usize {
        match self.elements_by_id(id).first() {
            Some(node) => self.click(*node),
            None => 0,
        }
    }

    pub fn click(&self, node: NodeId) -> usize {
        let page = self.page();
        page.listeners
            .values()
            .filter(|l| l.node == node)
            .filter(|l| l.events.send(DomEvent::Click(node)).is_ok())
            .count()
    }

    pub fn count_id(&self, id: &str) -> usize {
        self.elements_by_id(id).len()
    }

    /// Inline style of the first element with `id`.
    pub fn style_of(&self, id: &str, property: &str) -> Option<String> {
        let node = *self.elements_by_id(id).first()?;
        self.page().nodes.get(&node)?.styles.get(property).cloned()
    }

    /// Last view rendered into the first element with `id`.
    pub fn panel(&self, id: &str) -> Option<PanelView> {
        let node = *self.elements_by_id(id).first()?;
        self.page().panels.get(&node).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.page().nodes.len()
    }

    pub fn listener_count(&self) -> usize {
        self.page().listeners.len()
    }
}

#[async_trait]
impl Document for HeadlessDocument {
    fn url(&self) -> String {
        self.page().url.clone()
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready.borrow()
    }

    async fn content_loaded(&self) {
        let mut rx = self.ready.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != ReadyState::Loading {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn elements_by_id(&self, id: &str) -> Vec<NodeId> {
        self.page()
            .nodes
            .iter()
            .filter(|(_, n)| n.id == id)
            .map(|(node, _)| *node)
            .collect()
    }

    fn append_element(&self, spec: ElementSpec) -> Result<NodeId, DomError> {
        let mut page = self.page();
        if let Some(parent) = spec.parent {
            page.attached(parent)?;
        }
        let node = page.next_node;
        page.next_node += 1;
        page.nodes.insert(
            node,
            Node {
                id: spec.id,
                parent: spec.parent,
                styles: spec.styles.into_iter().collect(),
            },
        );
        Ok(node)
    }

    fn remove_node(&self, node: NodeId) -> bool {
        let mut page = self.page();
        if !page.nodes.contains_key(&node) {
            return false;
        }
        for removed in page.subtree(node) {
            page.nodes.remove(&removed);
            page.panels.remove(&removed);
            page.listeners.retain(|_, l| l.node != removed);
        }
        true
    }

    fn set_style(&self, node: NodeId, property: &str, value: &str) -> Result<(), DomError> {
        let mut page = self.page();
        let entry = page.nodes.get_mut(&node).ok_or(DomError::Detached(node))?;
        entry.styles.insert(property.to_string(), value.to_string());
        Ok(())
    }

    fn add_click_listener(
        &self,
        node: NodeId,
        events: mpsc::UnboundedSender<DomEvent>,
    ) -> Result<ListenerId, DomError> {
        let mut page = self.page();
        page.attached(node)?;
        let id = page.next_listener;
        page.next_listener += 1;
        page.listeners.insert(id, Listener { node, events });
        Ok(id)
    }

    fn remove_listener(&self, listener: ListenerId) -> bool {
        self.page().listeners.remove(&listener).is_some()
    }

    fn render_panel(&self, node: NodeId, view: &PanelView) -> Result<(), DomError> {
        let mut page = self.page();
        page.attached(node)?;
        page.panels.insert(node, view.clone());
        Ok(())
    }

    fn data_island(&self, id: &str) -> Option<String> {
        self.page().islands.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const URL: &str = "https://fantasy.espn.com/football/draft";

    #[test]
    fn removing_a_node_removes_its_subtree_and_listeners() {
        let doc = HeadlessDocument::loaded(URL);
        let host = doc.append_element(ElementSpec::new("div", "host")).unwrap();
        let child = doc
            .append_element(ElementSpec::new("div", "child").child_of(host))
            .unwrap();
        let other = doc.append_element(ElementSpec::new("button", "other")).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        doc.add_click_listener(child, tx.clone()).unwrap();
        doc.add_click_listener(other, tx).unwrap();

        assert!(doc.remove_node(host));
        assert_eq!(doc.count_id("host"), 0);
        assert_eq!(doc.count_id("child"), 0);
        assert_eq!(doc.count_id("other"), 1);
        assert_eq!(doc.listener_count(), 1);
        assert!(!doc.remove_node(host));
    }

    #[test]
    fn node_handles_are_never_reused() {
        let doc = HeadlessDocument::loaded(URL);
        let first = doc.append_element(ElementSpec::new("div", "x")).unwrap();
        doc.remove_node(first);
        let second = doc.append_element(ElementSpec::new("div", "x")).unwrap();
        assert_ne!(first, second);
        // The stale handle no longer addresses anything.
        assert!(!doc.remove_node(first));
        assert_eq!(doc.count_id("x"), 1);
    }

    #[test]
    fn operations_on_detached_nodes_fail() {
        let doc = HeadlessDocument::loaded(URL);
        assert_eq!(doc.set_style(42, "width", "1px"), Err(DomError::Detached(42)));
        assert!(doc
            .append_element(ElementSpec::new("div", "a").child_of(42))
            .is_err());
    }

    #[test]
    fn click_reaches_listeners_of_that_node_only() {
        let doc = HeadlessDocument::loaded(URL);
        let a = doc.append_element(ElementSpec::new("button", "a")).unwrap();
        let b = doc.append_element(ElementSpec::new("button", "b")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        doc.add_click_listener(a, tx.clone()).unwrap();
        let lb = doc.add_click_listener(b, tx).unwrap();

        assert_eq!(doc.click_id("a"), 1);
        assert_eq!(rx.try_recv().unwrap(), DomEvent::Click(a));
        assert!(doc.remove_listener(lb));
        assert_eq!(doc.click_id("b"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn styles_are_applied_and_overwritten() {
        let doc = HeadlessDocument::loaded(URL);
        let node = doc
            .append_element(ElementSpec::new("div", "panel").style("transform", "translateX(100%)"))
            .unwrap();
        doc.set_style(node, "transform", "translateX(0)").unwrap();
        assert_eq!(doc.style_of("panel", "transform").as_deref(), Some("translateX(0)"));
    }

    #[tokio::test]
    async fn content_loaded_waits_for_the_dom() {
        let doc = Arc::new(HeadlessDocument::new(URL, ReadyState::Loading));
        let waiter = {
            let doc = Arc::clone(&doc);
            tokio::spawn(async move { doc.content_loaded().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        doc.set_ready_state(ReadyState::Interactive);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn content_loaded_resolves_immediately_when_loaded() {
        let doc = HeadlessDocument::loaded(URL);
        tokio::time::timeout(Duration::from_millis(100), doc.content_loaded())
            .await
            .unwrap();
    }
}
