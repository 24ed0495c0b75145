// Overlay mount controller: creates, shows, hides and removes the sidebar.
//
// The controller holds exactly one handle to the nodes it created. Mounting
// first removes any host or toggle left in the page by an earlier instance,
// so a page never carries two sidebars.

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use scoutai_core::draft::{DraftSnapshot, Position, Recommendation};

use super::dom::{Document, DomError, DomEvent, ElementSpec, ListenerId, NodeId};

pub const HOST_ID: &str = "scoutai-sidebar";
pub const MOUNT_ID: &str = "scoutai-sidebar-root";
pub const TOGGLE_ID: &str = "scoutai-toggle";
pub const CLOSE_ID: &str = "scoutai-close";
pub const REFRESH_ID: &str = "scoutai-refresh";

pub const PANEL_WIDTH: &str = "384px";
const HIDDEN_TRANSFORM: &str = "translateX(100%)";
const SHOWN_TRANSFORM: &str = "translateX(0)";

// ---------------------------------------------------------------------------
// Panel view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RankedRecommendation {
    /// 1-based, in the order the scoring service returned them.
    pub rank: usize,
    pub recommendation: Recommendation,
}

/// Everything the sidebar widgets draw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelView {
    /// `Round R, Pick P` once a snapshot has been taken.
    pub status_line: Option<String>,
    pub loading: bool,
    pub error: Option<String>,
    pub recommendations: Vec<RankedRecommendation>,
    pub roster_counts: Vec<(Position, usize)>,
    pub last_updated: Option<String>,
}

impl PanelView {
    pub fn build(
        draft: Option<&DraftSnapshot>,
        recommendations: &[Recommendation],
        loading: bool,
        error: Option<&str>,
        last_updated: Option<DateTime<Local>>,
    ) -> Self {
        PanelView {
            status_line: draft
                .map(|d| format!("Round {}, Pick {}", d.current_round, d.current_pick)),
            loading,
            error: error.map(str::to_string),
            recommendations: recommendations
                .iter()
                .enumerate()
                .map(|(i, r)| RankedRecommendation {
                    rank: i + 1,
                    recommendation: r.clone(),
                })
                .collect(),
            roster_counts: draft.map(|d| d.user_roster.counts()).unwrap_or_default(),
            last_updated: last_updated.map(|t| t.format("%H:%M:%S").to_string()),
        }
    }

    /// Plain-text rendering for terminals and logs.
    pub fn to_text(&self) -> String {
        let mut out = String::from("ScoutAI\n");
        if let Some(status) = &self.status_line {
            out.push_str(&format!("{status}\n"));
        }
        if self.loading {
            out.push_str("Loading recommendations...\n");
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("Error: {error}\n"));
        }
        for ranked in &self.recommendations {
            let r = &ranked.recommendation;
            out.push_str(&format!(
                "  #{} {} ({}, {}) {:.1} pts, {:.0}% confidence\n",
                ranked.rank,
                r.player.name,
                r.player.position.as_str(),
                r.player.team,
                r.predicted_points,
                r.confidence_score * 100.0
            ));
        }
        if !self.roster_counts.is_empty() {
            let counts: Vec<String> = self
                .roster_counts
                .iter()
                .map(|(p, n)| format!("{} {n}", p.as_str()))
                .collect();
            out.push_str(&format!("Roster: {}\n", counts.join(" | ")));
        }
        if let Some(at) = &self.last_updated {
            out.push_str(&format!("Last updated {at}\n"));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Mount controller
// ---------------------------------------------------------------------------

/// Which overlay control a click landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayControl {
    Toggle,
    Close,
    Refresh,
}

struct OverlayHandle {
    host: NodeId,
    mount: NodeId,
    toggle: NodeId,
    close: NodeId,
    refresh: NodeId,
    listeners: Vec<ListenerId>,
}

pub struct OverlayMountController {
    document: Arc<dyn Document>,
    handle: Option<OverlayHandle>,
}

impl OverlayMountController {
    pub fn new(document: Arc<dyn Document>) -> Self {
        OverlayMountController {
            document,
            handle: None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.handle.is_some()
    }

    /// Create the host (hidden), its mount point and controls, and the toggle
    /// button. Clicks on the controls are sent to `events`.
    ///
    /// On failure nothing created by this call is left in the page.
    pub fn mount(&mut self, events: &mpsc::UnboundedSender<DomEvent>) -> Result<(), DomError> {
        self.unmount();
        self.remove_stale();

        let mut created = Vec::new();
        let mut listeners = Vec::new();
        match self.build(events, &mut created, &mut listeners) {
            Ok(handle) => {
                debug!(host = handle.host, "Overlay mounted");
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                for listener in listeners {
                    self.document.remove_listener(listener);
                }
                // Children go with their parents; removing them again is a no-op.
                for node in created.into_iter().rev() {
                    self.document.remove_node(node);
                }
                Err(e)
            }
        }
    }

    fn build(
        &self,
        events: &mpsc::UnboundedSender<DomEvent>,
        created: &mut Vec<NodeId>,
        listeners: &mut Vec<ListenerId>,
    ) -> Result<OverlayHandle, DomError> {
        let doc = &self.document;

        let host = doc.append_element(
            ElementSpec::new("div", HOST_ID)
                .style("position", "fixed")
                .style("top", "0")
                .style("right", "0")
                .style("width", PANEL_WIDTH)
                .style("height", "100vh")
                .style("z-index", "2147483647")
                .style("transform", HIDDEN_TRANSFORM)
                .style("transition", "transform 0.3s ease-in-out"),
        )?;
        created.push(host);

        let close = doc.append_element(
            ElementSpec::new("button", CLOSE_ID)
                .child_of(host)
                .text("Close"),
        )?;
        created.push(close);

        let refresh = doc.append_element(
            ElementSpec::new("button", REFRESH_ID)
                .child_of(host)
                .text("Refresh"),
        )?;
        created.push(refresh);

        let mount = doc.append_element(
            ElementSpec::new("div", MOUNT_ID)
                .child_of(host)
                .style("height", "100%"),
        )?;
        created.push(mount);

        let toggle = doc.append_element(
            ElementSpec::new("button", TOGGLE_ID)
                .style("position", "fixed")
                .style("top", "50%")
                .style("right", "0")
                .style("z-index", "2147483646")
                .text("ScoutAI"),
        )?;
        created.push(toggle);

        for node in [toggle, close, refresh] {
            listeners.push(doc.add_click_listener(node, events.clone())?);
        }

        Ok(OverlayHandle {
            host,
            mount,
            toggle,
            close,
            refresh,
            listeners: listeners.clone(),
        })
    }

    /// Remove hosts and toggles this controller does not own.
    fn remove_stale(&self) {
        for id in [HOST_ID, TOGGLE_ID] {
            for node in self.document.elements_by_id(id) {
                warn!(id, node, "Removing stale overlay element");
                self.document.remove_node(node);
            }
        }
    }

    pub fn set_visible(&self, visible: bool) -> Result<(), DomError> {
        let Some(handle) = &self.handle else {
            return Ok(());
        };
        let transform = if visible { SHOWN_TRANSFORM } else { HIDDEN_TRANSFORM };
        self.document.set_style(handle.host, "transform", transform)
    }

    pub fn render(&self, view: &PanelView) -> Result<(), DomError> {
        match &self.handle {
            Some(handle) => self.document.render_panel(handle.mount, view),
            None => Ok(()),
        }
    }

    /// Map a click to the control it hit. Clicks on nodes this controller
    /// does not own (an earlier mount's) map to `None`.
    pub fn control_for(&self, node: NodeId) -> Option<OverlayControl> {
        let handle = self.handle.as_ref()?;
        if node == handle.toggle {
            Some(OverlayControl::Toggle)
        } else if node == handle.close {
            Some(OverlayControl::Close)
        } else if node == handle.refresh {
            Some(OverlayControl::Refresh)
        } else {
            None
        }
    }

    /// Remove everything this controller created. Returns `false` if nothing
    /// was mounted.
    pub fn unmount(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        for listener in &handle.listeners {
            self.document.remove_listener(*listener);
        }
        self.document.remove_node(handle.toggle);
        self.document.remove_node(handle.host);
        debug!(host = handle.host, "Overlay unmounted");
        true
    }
}

impl Drop for OverlayMountController {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::dom::HeadlessDocument;
    use scoutai_core::draft::{Player, RiskLevel, Roster};

    const URL: &str = "https://fantasy.espn.com/football/draft";

    fn setup() -> (
        Arc<HeadlessDocument>,
        OverlayMountController,
        mpsc::UnboundedSender<DomEvent>,
        mpsc::UnboundedReceiver<DomEvent>,
    ) {
        let doc = Arc::new(HeadlessDocument::loaded(URL));
        let controller = OverlayMountController::new(doc.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        (doc, controller, tx, rx)
    }

    fn recommendation(name: &str) -> Recommendation {
        Recommendation {
            player: Player {
                name: name.into(),
                position: Position::WR,
                team: "CIN".into(),
                adp: None,
                projected_points: None,
                bye_week: None,
            },
            confidence_score: 0.75,
            predicted_points: 250.0,
            boom_probability: 0.2,
            value_over_replacement: 40.0,
            explanation: "Target share".into(),
            risk_level: RiskLevel::Medium,
        }
    }

    #[test]
    fn mount_creates_hidden_host_and_toggle() {
        let (doc, mut overlay, tx, _rx) = setup();
        overlay.mount(&tx).unwrap();

        assert!(overlay.is_mounted());
        assert_eq!(doc.count_id(HOST_ID), 1);
        assert_eq!(doc.count_id(MOUNT_ID), 1);
        assert_eq!(doc.count_id(TOGGLE_ID), 1);
        assert_eq!(doc.style_of(HOST_ID, "width").as_deref(), Some("384px"));
        assert_eq!(
            doc.style_of(HOST_ID, "transform").as_deref(),
            Some("translateX(100%)")
        );
        assert_eq!(doc.listener_count(), 3);
    }

    #[test]
    fn visibility_is_a_transform() {
        let (doc, mut overlay, tx, _rx) = setup();
        overlay.mount(&tx).unwrap();
        overlay.set_visible(true).unwrap();
        assert_eq!(doc.style_of(HOST_ID, "transform").as_deref(), Some("translateX(0)"));
        overlay.set_visible(false).unwrap();
        assert_eq!(
            doc.style_of(HOST_ID, "transform").as_deref(),
            Some("translateX(100%)")
        );
    }

    #[test]
    fn remount_never_duplicates_the_host() {
        let (doc, mut overlay, tx, _rx) = setup();
        overlay.mount(&tx).unwrap();
        overlay.mount(&tx).unwrap();
        assert_eq!(doc.count_id(HOST_ID), 1);
        assert_eq!(doc.count_id(TOGGLE_ID), 1);
        assert_eq!(doc.listener_count(), 3);
    }

    #[test]
    fn mount_removes_a_host_left_by_another_instance() {
        let (doc, mut first, tx, _rx) = setup();
        first.mount(&tx).unwrap();
        // A re-injected instance starts while the old one still holds nodes.
        let mut second = OverlayMountController::new(doc.clone());
        second.mount(&tx).unwrap();
        assert_eq!(doc.count_id(HOST_ID), 1);
        assert_eq!(doc.count_id(TOGGLE_ID), 1);

        // The old instance's teardown cannot touch the new nodes.
        first.unmount();
        assert_eq!(doc.count_id(HOST_ID), 1);
        assert!(second.is_mounted());
    }

    #[test]
    fn unmount_removes_nodes_and_listeners() {
        let (doc, mut overlay, tx, _rx) = setup();
        overlay.mount(&tx).unwrap();
        assert!(overlay.unmount());
        assert_eq!(doc.node_count(), 0);
        assert_eq!(doc.listener_count(), 0);
        assert!(!overlay.unmount());
    }

    #[test]
    fn clicks_map_to_controls() {
        let (doc, mut overlay, tx, mut rx) = setup();
        overlay.mount(&tx).unwrap();

        doc.click_id(TOGGLE_ID);
        doc.click_id(CLOSE_ID);
        doc.click_id(REFRESH_ID);
        let controls: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|DomEvent::Click(node)| overlay.control_for(node))
            .collect();
        assert_eq!(
            controls,
            vec![
                Some(OverlayControl::Toggle),
                Some(OverlayControl::Close),
                Some(OverlayControl::Refresh)
            ]
        );
        assert_eq!(overlay.control_for(9999), None);
    }

    #[test]
    fn render_reaches_the_mount_point() {
        let (doc, mut overlay, tx, _rx) = setup();
        overlay.mount(&tx).unwrap();
        let view = PanelView {
            loading: true,
            ..PanelView::default()
        };
        overlay.render(&view).unwrap();
        assert_eq!(doc.panel(MOUNT_ID), Some(view));
    }

    #[test]
    fn panel_view_ranks_in_returned_order() {
        let snapshot = DraftSnapshot {
            current_pick: 5,
            current_round: 1,
            user_roster: Roster {
                RB: vec!["Bijan Robinson".into()],
                ..Roster::default()
            },
            available_players: vec![],
            platform: None,
        };
        let recs = vec![recommendation("A"), recommendation("B"), recommendation("C")];
        let view = PanelView::build(Some(&snapshot), &recs, false, None, None);

        assert_eq!(view.status_line.as_deref(), Some("Round 1, Pick 5"));
        let ranks: Vec<_> = view
            .recommendations
            .iter()
            .map(|r| (r.rank, r.recommendation.player.name.as_str()))
            .collect();
        assert_eq!(ranks, vec![(1, "A"), (2, "B"), (3, "C")]);
        assert!(view.roster_counts.contains(&(Position::RB, 1)));

        let text = view.to_text();
        assert!(text.contains("Round 1, Pick 5"));
        assert!(text.contains("#1 A (WR, CIN)"));
        assert!(text.contains("RB 1"));
    }

    #[test]
    fn panel_text_shows_error_banner() {
        let view = PanelView::build(None, &[], false, Some("API request failed: 503"), None);
        assert!(view.to_text().contains("Error: API request failed: 503"));
    }
}
