// Popup controller: the short-lived status view behind the toolbar icon.
//
// The popup only talks to the content script of the active tab. It holds
// nothing beyond what it displays and may be closed at any point, including
// while a send is still in flight.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use scoutai_core::platform::{is_draft_page, Platform};
use scoutai_core::protocol::{reply_error, ContextAddr, Message, TabId};
use scoutai_core::ScoutError;

use crate::bus::MessageBus;

pub const DRAFT_DETECTED: &str = "Draft page detected! Click the toggle button to open ScoutAI.";
pub const PLATFORM_DETECTED: &str =
    "Fantasy platform detected. Navigate to a draft page to use ScoutAI.";
pub const UNSUPPORTED_SITE: &str = "Navigate to ESPN or Yahoo Fantasy to use ScoutAI.";
pub const NO_TAB_ACCESS: &str = "Unable to access current tab";
pub const TOGGLE_FAILED: &str = "Error: Could not communicate with page. Please refresh the page.";
pub const REFRESHING: &str = "Refreshing recommendations...";
pub const REFRESH_FAILED: &str = "Error: Could not refresh recommendations.";
pub const NOT_A_DRAFT_PAGE: &str = "Please navigate to a draft page first.";

/// How long a transient status stays before reverting.
pub const STATUS_REVERT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupStatus {
    pub kind: StatusKind,
    pub text: String,
}

impl PopupStatus {
    fn new(kind: StatusKind, text: &str) -> Self {
        PopupStatus {
            kind,
            text: text.to_string(),
        }
    }
}

/// The tab that was active when the popup opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTab {
    pub id: TabId,
    /// `None` when the browser does not expose the URL (privileged pages).
    pub url: Option<String>,
}

/// How the active tab's URL was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    DraftPage,
    Platform,
    Unsupported,
    Unknown,
}

impl PageKind {
    pub fn classify(url: Option<&str>) -> Self {
        match url {
            None => PageKind::Unknown,
            Some(url) => {
                let supported = Platform::detect(url).is_supported();
                match (supported, is_draft_page(url)) {
                    (true, true) => PageKind::DraftPage,
                    (true, false) => PageKind::Platform,
                    _ => PageKind::Unsupported,
                }
            }
        }
    }

    fn initial_status(&self) -> PopupStatus {
        match self {
            PageKind::DraftPage => PopupStatus::new(StatusKind::Success, DRAFT_DETECTED),
            PageKind::Platform => PopupStatus::new(StatusKind::Info, PLATFORM_DETECTED),
            PageKind::Unsupported => PopupStatus::new(StatusKind::Info, UNSUPPORTED_SITE),
            PageKind::Unknown => PopupStatus::new(StatusKind::Error, NO_TAB_ACCESS),
        }
    }
}

pub struct PopupController {
    bus: MessageBus,
    tab: Option<TabId>,
    page: PageKind,
    status: PopupStatus,
    revert_at: Option<Instant>,
    closed: bool,
}

impl PopupController {
    /// Open the popup over `active_tab` and classify its page.
    pub fn open(bus: MessageBus, active_tab: Option<ActiveTab>) -> Self {
        let page = PageKind::classify(active_tab.as_ref().and_then(|t| t.url.as_deref()));
        debug!(?page, "Popup opened");
        PopupController {
            bus,
            tab: active_tab.map(|t| t.id),
            status: page.initial_status(),
            page,
            revert_at: None,
            closed: false,
        }
    }

    pub fn page(&self) -> PageKind {
        self.page
    }

    pub fn status(&self) -> &PopupStatus {
        &self.status
    }

    pub fn toggle_enabled(&self) -> bool {
        self.page == PageKind::DraftPage
    }

    pub fn toggle_label(&self) -> &'static str {
        if self.toggle_enabled() {
            "Toggle ScoutAI Sidebar"
        } else {
            "Not Available"
        }
    }

    /// Whether the popup closed itself (after a successful toggle).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn draft_tab(&self) -> Option<TabId> {
        match self.page {
            PageKind::DraftPage => self.tab,
            _ => None,
        }
    }

    async fn send_to_tab(&self, tab: TabId, message: Message) -> Result<(), ScoutError> {
        let reply = self
            .bus
            .send(ContextAddr::Popup, ContextAddr::Tab(tab), message)
            .await?;
        match reply.as_ref().and_then(reply_error) {
            Some(message) => Err(ScoutError::Remote {
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Ask the content script to show or hide the overlay. Success closes
    /// the popup. Does nothing off a draft page.
    pub async fn toggle(&mut self) {
        let Some(tab) = self.draft_tab() else {
            return;
        };
        match self.send_to_tab(tab, Message::ToggleSidebar).await {
            Ok(()) => {
                debug!(tab, "Toggled overlay, closing popup");
                self.closed = true;
            }
            Err(e) => {
                warn!(tab, "Toggle failed: {e}");
                self.set_status(PopupStatus::new(StatusKind::Error, TOGGLE_FAILED));
            }
        }
    }

    /// Ask the content script to refresh its recommendations.
    pub async fn refresh(&mut self) {
        let Some(tab) = self.draft_tab() else {
            self.set_status(PopupStatus::new(StatusKind::Error, NOT_A_DRAFT_PAGE));
            return;
        };
        match self.send_to_tab(tab, Message::RefreshRecommendations).await {
            Ok(()) => {
                self.status = PopupStatus::new(StatusKind::Info, REFRESHING);
                self.revert_at = Some(Instant::now() + STATUS_REVERT_DELAY);
            }
            Err(e) => {
                warn!(tab, "Refresh failed: {e}");
                self.set_status(PopupStatus::new(StatusKind::Error, REFRESH_FAILED));
            }
        }
    }

    fn set_status(&mut self, status: PopupStatus) {
        self.status = status;
        self.revert_at = None;
    }

    /// When a transient status is due to revert, if one is showing.
    pub fn revert_deadline(&self) -> Option<Instant> {
        self.revert_at
    }

    /// Revert a transient status if it is due at `now`.
    pub fn tick(&mut self, now: Instant) {
        if self.revert_at.is_some_and(|at| at <= now) {
            self.revert_at = None;
            self.status = PopupStatus::new(StatusKind::Success, DRAFT_DETECTED);
        }
    }

    /// Wait out a pending status revert.
    pub async fn settle(&mut self) {
        if let Some(at) = self.revert_at {
            sleep_until(at).await;
            self.tick(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DRAFT: &str = "https://fantasy.espn.com/football/draft?leagueId=1";

    fn bus() -> MessageBus {
        MessageBus::new(Duration::from_millis(500))
    }

    fn tab(url: Option<&str>) -> Option<ActiveTab> {
        Some(ActiveTab {
            id: 1,
            url: url.map(str::to_string),
        })
    }

    /// Answer every request on tab 1 with `reply`.
    fn answer_with(bus: &MessageBus, reply: serde_json::Value) {
        let mut endpoint = bus.register(ContextAddr::Tab(1));
        tokio::spawn(async move {
            while let Some(delivery) = endpoint.recv().await {
                if let Some(incoming) = delivery.open() {
                    incoming.reply(reply.clone());
                }
            }
        });
    }

    #[test]
    fn classification_drives_initial_status() {
        let cases = [
            (Some(DRAFT), StatusKind::Success, DRAFT_DETECTED, true),
            (
                Some("https://fantasy.espn.com/football/team"),
                StatusKind::Info,
                PLATFORM_DETECTED,
                false,
            ),
            (Some("https://example.com/draft"), StatusKind::Info, UNSUPPORTED_SITE, false),
            (None, StatusKind::Error, NO_TAB_ACCESS, false),
        ];
        for (url, kind, text, toggle) in cases {
            let popup = PopupController::open(bus(), tab(url));
            assert_eq!(popup.status(), &PopupStatus::new(kind, text), "url {url:?}");
            assert_eq!(popup.toggle_enabled(), toggle);
        }
        assert_eq!(PopupController::open(bus(), None).page(), PageKind::Unknown);
    }

    #[tokio::test]
    async fn successful_toggle_closes_popup() {
        let bus = bus();
        answer_with(&bus, json!({"ok": true, "visible": true}));
        let mut popup = PopupController::open(bus, tab(Some(DRAFT)));
        popup.toggle().await;
        assert!(popup.is_closed());
    }

    #[tokio::test]
    async fn toggle_without_content_script_shows_error() {
        let mut popup = PopupController::open(bus(), tab(Some(DRAFT)));
        popup.toggle().await;
        assert!(!popup.is_closed());
        assert_eq!(popup.status(), &PopupStatus::new(StatusKind::Error, TOGGLE_FAILED));
    }

    #[tokio::test]
    async fn toggle_error_reply_shows_error() {
        let bus = bus();
        answer_with(&bus, json!({"error": "Overlay is not mounted yet"}));
        let mut popup = PopupController::open(bus, tab(Some(DRAFT)));
        popup.toggle().await;
        assert!(!popup.is_closed());
        assert_eq!(popup.status().text, TOGGLE_FAILED);
    }

    #[tokio::test]
    async fn toggle_off_draft_page_does_nothing() {
        let mut popup = PopupController::open(bus(), tab(Some("https://example.com/")));
        popup.toggle().await;
        assert!(!popup.is_closed());
        assert_eq!(popup.status().text, UNSUPPORTED_SITE);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_status_reverts_after_two_seconds() {
        let bus = bus();
        answer_with(&bus, json!({"ok": true}));
        let mut popup = PopupController::open(bus, tab(Some(DRAFT)));
        popup.refresh().await;
        assert_eq!(popup.status(), &PopupStatus::new(StatusKind::Info, REFRESHING));

        popup.tick(Instant::now() + Duration::from_millis(1999));
        assert_eq!(popup.status().text, REFRESHING);

        popup.settle().await;
        assert_eq!(popup.status(), &PopupStatus::new(StatusKind::Success, DRAFT_DETECTED));
        assert!(popup.revert_deadline().is_none());
    }

    #[tokio::test]
    async fn refresh_failure_and_wrong_page() {
        let mut popup = PopupController::open(bus(), tab(Some(DRAFT)));
        popup.refresh().await;
        assert_eq!(popup.status(), &PopupStatus::new(StatusKind::Error, REFRESH_FAILED));

        let mut popup = PopupController::open(bus(), tab(Some("https://fantasy.espn.com/")));
        popup.refresh().await;
        assert_eq!(popup.status(), &PopupStatus::new(StatusKind::Error, NOT_A_DRAFT_PAGE));
    }
}
