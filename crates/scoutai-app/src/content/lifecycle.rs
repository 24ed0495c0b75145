// Content script lifecycle: one instance per tab.
//
// States: Inactive -> Ready -> Mounted{visible} -> TornDown. Leaving the
// draft page (or disabling the extension) tears the overlay down; the URL
// watcher keeps polling in every state so returning to a draft page re-enters
// Ready. The instance ends when its bus endpoint closes.
//
// All state changes happen on the `run` task. Spawned work (recommendation
// fetches) reports back over a channel and carries the session generation it
// was started under; results from an older generation are discarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use scoutai_core::config::Config;
use scoutai_core::draft::{DraftRequest, DraftResponse, DraftSnapshot, Recommendation};
use scoutai_core::platform::{is_draft_page, Platform};
use scoutai_core::protocol::{
    ack_reply, error_reply, into_result, ApiRequestPayload, ContextAddr, Message, MessageType,
    TabId,
};
use scoutai_core::settings::{Settings, SettingsStore};
use scoutai_core::ScoutError;

use super::dom::{Document, DomEvent, ReadyState};
use super::extractor::DraftExtractor;
use super::navigation::NavigationWatcher;
use super::overlay::{OverlayControl, OverlayMountController, PanelView};
use crate::bus::{Dispatcher, Endpoint, Incoming, MessageBus};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not a supported draft page, or the extension is disabled.
    Inactive,
    /// Draft page detected; waiting for the DOM before mounting.
    Ready,
    Mounted { visible: bool },
    /// Was active, then left the draft page or was disabled.
    TornDown,
}

impl LifecycleState {
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Mounted { .. })
    }

    pub fn is_mounted(&self) -> bool {
        matches!(self, LifecycleState::Mounted { .. })
    }
}

/// Per-tab state that exists only while the machine is active.
#[derive(Debug, Clone)]
pub struct TabSession {
    pub platform: Platform,
    pub is_draft_page: bool,
    pub overlay_mounted: bool,
    pub overlay_visible: bool,
    pub last_known_url: String,
    pub draft: Option<DraftSnapshot>,
    pub recommendations: Vec<Recommendation>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Local>>,
}

impl TabSession {
    fn new(url: &str) -> Self {
        TabSession {
            platform: Platform::detect(url),
            is_draft_page: is_draft_page(url),
            overlay_mounted: false,
            overlay_visible: false,
            last_known_url: url.to_string(),
            draft: None,
            recommendations: Vec::new(),
            loading: false,
            error: None,
            last_updated: None,
        }
    }

    fn view(&self) -> PanelView {
        PanelView::build(
            self.draft.as_ref(),
            &self.recommendations,
            self.loading,
            self.error.as_deref(),
            self.last_updated,
        )
    }
}

/// Timing and endpoint options for content scripts.
#[derive(Debug, Clone)]
pub struct ContentOptions {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub recommendations_path: String,
    /// Wait for a relayed `API_REQUEST`; covers the gateway's own timeout.
    pub api_timeout: Duration,
}

impl ContentOptions {
    pub fn from_config(config: &Config) -> Self {
        ContentOptions {
            poll_interval: config.poll_interval(),
            settle_delay: config.settle_delay(),
            recommendations_path: config.gateway.recommendations_path.clone(),
            api_timeout: config.api_request_timeout(),
        }
    }
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct FetchOutcome {
    generation: u64,
    seq: u64,
    snapshot: DraftSnapshot,
    result: Result<DraftResponse, ScoutError>,
}

/// Receivers the `run` loop selects over.
pub struct ContentInbox {
    endpoint: Endpoint,
    events_rx: mpsc::UnboundedReceiver<DomEvent>,
    fetch_rx: mpsc::Receiver<FetchOutcome>,
}

pub struct ContentScript {
    tab_id: TabId,
    bus: MessageBus,
    document: Arc<dyn Document>,
    extractor: Arc<dyn DraftExtractor>,
    settings: SettingsStore,
    options: ContentOptions,

    state: LifecycleState,
    state_tx: watch::Sender<LifecycleState>,
    session: Option<TabSession>,
    overlay: OverlayMountController,
    watcher: NavigationWatcher,

    /// Bumped on every session start and teardown.
    generation: u64,
    /// Sequence of the most recent fetch; only its result is applied.
    fetch_seq: u64,
    activated: bool,
    waiting_for_dom: bool,
    auto_refresh_at: Option<Instant>,

    events_tx: mpsc::UnboundedSender<DomEvent>,
    fetch_tx: mpsc::Sender<FetchOutcome>,
}

impl ContentScript {
    /// Create the instance for `tab_id` and announce it on the bus.
    pub fn new(
        tab_id: TabId,
        bus: MessageBus,
        document: Arc<dyn Document>,
        extractor: Arc<dyn DraftExtractor>,
        settings: SettingsStore,
        options: ContentOptions,
    ) -> (Self, ContentInbox) {
        let endpoint = bus.register(ContextAddr::Tab(tab_id));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::channel(16);
        let (state_tx, _) = watch::channel(LifecycleState::Inactive);
        let watcher = NavigationWatcher::new(
            document.url(),
            options.poll_interval,
            options.settle_delay,
        );

        let script = ContentScript {
            tab_id,
            bus,
            overlay: OverlayMountController::new(Arc::clone(&document)),
            document,
            extractor,
            settings,
            options,
            state: LifecycleState::Inactive,
            state_tx,
            session: None,
            watcher,
            generation: 0,
            fetch_seq: 0,
            activated: false,
            waiting_for_dom: false,
            auto_refresh_at: None,
            events_tx,
            fetch_tx,
        };
        let inbox = ContentInbox {
            endpoint,
            events_rx,
            fetch_rx,
        };
        (script, inbox)
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn session(&self) -> Option<&TabSession> {
        self.session.as_ref()
    }

    /// Observe state changes from outside the `run` task.
    pub fn state_watch(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    fn set_state(&mut self, state: LifecycleState) {
        if self.state != state {
            debug!(tab = self.tab_id, from = ?self.state, to = ?state, "Lifecycle transition");
        }
        self.state = state;
        if let Some(session) = &mut self.session {
            session.overlay_mounted = state.is_mounted();
            session.overlay_visible = state == LifecycleState::Mounted { visible: true };
        }
        self.state_tx.send_replace(state);
    }

    fn current_settings(&self) -> Settings {
        self.settings.get().unwrap_or_else(|e| {
            warn!(tab = self.tab_id, "Failed to read settings, using defaults: {e:#}");
            Settings::default()
        })
    }

    /// Whether the overlay may exist on `url` right now.
    fn qualifies(&self, url: &str) -> bool {
        let platform = Platform::detect(url);
        platform.is_supported() && is_draft_page(url) && self.current_settings().enabled
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// First evaluation after injection. Later calls do nothing.
    pub fn activate(&mut self) {
        if std::mem::replace(&mut self.activated, true) {
            return;
        }
        let url = self.document.url();
        if self.qualifies(&url) {
            info!(tab = self.tab_id, %url, "Draft page detected");
            self.enter_ready(&url);
        } else {
            info!(tab = self.tab_id, %url, "Not an active draft page");
            self.set_state(LifecycleState::Inactive);
        }
    }

    /// Start a fresh session. Any existing overlay and session are discarded
    /// first.
    fn enter_ready(&mut self, url: &str) {
        if self.state.is_active() {
            self.teardown();
        }
        self.generation += 1;
        self.session = Some(TabSession::new(url));
        self.set_state(LifecycleState::Ready);

        if self.document.ready_state() == ReadyState::Loading {
            debug!(tab = self.tab_id, "Waiting for DOM before mounting");
            self.waiting_for_dom = true;
        } else {
            self.on_dom_ready();
        }
    }

    fn on_dom_ready(&mut self) {
        self.waiting_for_dom = false;
        if self.state != LifecycleState::Ready {
            return;
        }
        if let Err(e) = self.overlay.mount(&self.events_tx) {
            warn!(tab = self.tab_id, "Failed to mount overlay: {e}");
            return;
        }
        info!(tab = self.tab_id, "Overlay mounted");
        self.set_state(LifecycleState::Mounted { visible: false });
        self.schedule_auto_refresh();
        self.start_refresh();
    }

    /// Remove the overlay, stop timers and discard the session.
    fn teardown(&mut self) {
        if self.overlay.unmount() {
            info!(tab = self.tab_id, "Overlay removed");
        }
        self.watcher.cancel_settle();
        self.auto_refresh_at = None;
        self.waiting_for_dom = false;
        self.session = None;
        self.generation += 1;
        self.set_state(LifecycleState::TornDown);
    }

    fn sample_url(&mut self) {
        let url = self.document.url();
        self.watcher.observe(&url, Instant::now());
    }

    /// The URL has stopped changing: decide whether the overlay belongs here.
    fn on_settled(&mut self) {
        if !self.watcher.take_settled(Instant::now()) {
            return;
        }
        let url = self.document.url();
        if self.qualifies(&url) {
            info!(tab = self.tab_id, %url, "Navigated to draft page");
            self.enter_ready(&url);
        } else if self.state.is_active() {
            info!(tab = self.tab_id, %url, "Left draft page");
            self.teardown();
        }
    }

    fn set_visible(&mut self, visible: bool) -> Result<bool, String> {
        if !self.state.is_mounted() {
            return Err(self.not_mounted_reason());
        }
        self.overlay
            .set_visible(visible)
            .map_err(|e| format!("Failed to update overlay: {e}"))?;
        self.set_state(LifecycleState::Mounted { visible });
        Ok(visible)
    }

    fn toggle(&mut self) -> Result<bool, String> {
        match self.state {
            LifecycleState::Mounted { visible } => self.set_visible(!visible),
            _ => Err(self.not_mounted_reason()),
        }
    }

    fn not_mounted_reason(&self) -> String {
        match self.state {
            LifecycleState::Inactive | LifecycleState::TornDown => {
                "ScoutAI is not active on this page".to_string()
            }
            _ => "Overlay is not mounted yet".to_string(),
        }
    }

    fn shutdown(&mut self) {
        if self.state.is_active() {
            self.teardown();
        }
        info!(tab = self.tab_id, "Content script stopped");
    }

    // -----------------------------------------------------------------------
    // Rendering and data
    // -----------------------------------------------------------------------

    fn render(&self) {
        let Some(session) = &self.session else {
            return;
        };
        if let Err(e) = self.overlay.render(&session.view()) {
            warn!(tab = self.tab_id, "Failed to render overlay: {e}");
        }
    }

    fn schedule_auto_refresh(&mut self) {
        self.auto_refresh_at = None;
        if !self.state.is_mounted() {
            return;
        }
        let settings = self.current_settings();
        if settings.auto_refresh && settings.refresh_interval_seconds > 0 {
            let period = Duration::from_secs(u64::from(settings.refresh_interval_seconds));
            self.auto_refresh_at = Some(Instant::now() + period);
        }
    }

    fn on_auto_refresh(&mut self) {
        debug!(tab = self.tab_id, "Auto-refresh");
        self.start_refresh();
        self.schedule_auto_refresh();
    }

    /// Extract the draft and ask the scoring service for recommendations.
    /// Previous recommendations stay visible until the result arrives.
    fn start_refresh(&mut self) {
        if self.session.is_none() {
            return;
        }
        let snapshot = self.extractor.extract(self.document.as_ref());
        let settings = self.current_settings();
        let Some(session) = &mut self.session else {
            return;
        };

        let Some(snapshot) = snapshot else {
            // Supersedes any fetch still in flight.
            self.fetch_seq += 1;
            session.loading = false;
            session.error = Some(ScoutError::NoDraftDetected.to_string());
            self.render();
            return;
        };

        session.loading = true;
        self.fetch_seq += 1;
        let seq = self.fetch_seq;
        let generation = self.generation;
        self.render();

        let url = format!(
            "{}{}",
            settings.api_url.trim_end_matches('/'),
            self.options.recommendations_path
        );
        let bus = self.bus.clone();
        let from = ContextAddr::Tab(self.tab_id);
        let timeout = self.options.api_timeout;
        let fetch_tx = self.fetch_tx.clone();
        debug!(tab = self.tab_id, generation, seq, %url, "Requesting recommendations");
        tokio::spawn(async move {
            let result = request_recommendations(&bus, from, url, timeout, &snapshot).await;
            let _ = fetch_tx
                .send(FetchOutcome {
                    generation,
                    seq,
                    snapshot,
                    result,
                })
                .await;
        });
    }

    fn apply_fetch(&mut self, outcome: FetchOutcome) {
        if outcome.generation != self.generation || outcome.seq != self.fetch_seq {
            debug!(
                tab = self.tab_id,
                generation = outcome.generation,
                seq = outcome.seq,
                "Discarding stale recommendations"
            );
            return;
        }
        let Some(session) = &mut self.session else {
            return;
        };
        session.loading = false;
        match outcome.result {
            Ok(response) => {
                if response.recommendations.iter().any(|r| !r.is_well_formed()) {
                    warn!(tab = self.tab_id, "Scoring service returned out-of-range probabilities");
                }
                info!(
                    tab = self.tab_id,
                    count = response.recommendations.len(),
                    "Recommendations updated"
                );
                session.draft = Some(outcome.snapshot);
                session.recommendations = response.recommendations;
                session.error = None;
                session.last_updated = Some(Local::now());
            }
            Err(e) => {
                warn!(tab = self.tab_id, "Failed to fetch recommendations: {e}");
                session.error = Some(e.to_string());
            }
        }
        self.render();
    }

    // -----------------------------------------------------------------------
    // Message and DOM event handlers
    // -----------------------------------------------------------------------

    fn on_toggle(&mut self, incoming: Incoming) {
        let reply = match self.toggle() {
            Ok(visible) => ack_reply(visible_field(visible)),
            Err(reason) => error_reply(reason),
        };
        incoming.reply(reply);
    }

    fn on_refresh(&mut self, incoming: Incoming) {
        if !self.state.is_mounted() {
            incoming.reply(error_reply(self.not_mounted_reason()));
            return;
        }
        self.start_refresh();
        incoming.reply(ack_reply(Map::new()));
    }

    fn on_extract(&mut self, incoming: Incoming) {
        let reply = match self.extractor.extract(self.document.as_ref()) {
            Some(snapshot) => serde_json::to_value(&snapshot)
                .unwrap_or_else(|e| error_reply(format!("Failed to encode draft state: {e}"))),
            None => error_reply(ScoutError::NoDraftDetected),
        };
        incoming.reply(reply);
    }

    fn on_settings_updated(&mut self, incoming: Incoming) {
        let Message::SettingsUpdated(change) = incoming.message() else {
            return;
        };
        let changed = change.changed.clone();
        debug!(tab = self.tab_id, ?changed, "Settings updated");

        if changed.iter().any(|f| f == "enabled") {
            let url = self.document.url();
            let qualifies = self.qualifies(&url);
            if !qualifies && self.state.is_active() {
                info!(tab = self.tab_id, "Disabled, removing overlay");
                self.teardown();
            } else if qualifies && !self.state.is_active() {
                info!(tab = self.tab_id, "Enabled on draft page");
                self.enter_ready(&url);
            }
        }
        if changed
            .iter()
            .any(|f| f == "autoRefresh" || f == "refreshIntervalSeconds")
        {
            self.schedule_auto_refresh();
        }
    }

    fn on_dom_event(&mut self, event: DomEvent) {
        let DomEvent::Click(node) = event;
        let Some(control) = self.overlay.control_for(node) else {
            return;
        };
        let result = match control {
            OverlayControl::Toggle => self.toggle().map(|_| ()),
            OverlayControl::Close => self.set_visible(false).map(|_| ()),
            OverlayControl::Refresh => {
                self.start_refresh();
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(tab = self.tab_id, ?control, "Overlay control failed: {e}");
        }
    }
}

fn visible_field(visible: bool) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("visible".into(), Value::Bool(visible));
    extra
}

/// `POST {url}` with the draft as body, relayed through the background.
async fn request_recommendations(
    bus: &MessageBus,
    from: ContextAddr,
    url: String,
    timeout: Duration,
    snapshot: &DraftSnapshot,
) -> Result<DraftResponse, ScoutError> {
    let body = serde_json::to_value(DraftRequest::from(snapshot)).map_err(|e| {
        ScoutError::MalformedEnvelope {
            message: format!("failed to encode draft request: {e}"),
        }
    })?;
    let reply = bus
        .send_with_timeout(
            from,
            ContextAddr::Background,
            Message::ApiRequest(ApiRequestPayload::post_json(url, body)),
            timeout,
        )
        .await?
        .unwrap_or(Value::Null);
    let body = into_result(reply)?;
    serde_json::from_value(body).map_err(|e| ScoutError::Http {
        status: None,
        message: format!("Unexpected response from scoring service: {e}"),
    })
}

fn content_dispatcher(tab_id: TabId) -> Dispatcher<ContentScript> {
    Dispatcher::new(ContextAddr::Tab(tab_id))
        .on_type("toggle", MessageType::ToggleSidebar, |cs: &mut ContentScript, inc| {
            cs.on_toggle(inc)
        })
        .on_type("refresh", MessageType::RefreshRecommendations, |cs: &mut ContentScript, inc| {
            cs.on_refresh(inc)
        })
        .on_type("extract", MessageType::ExtractDraftState, |cs: &mut ContentScript, inc| {
            cs.on_extract(inc)
        })
        .on_type("settings", MessageType::SettingsUpdated, |cs: &mut ContentScript, inc| {
            cs.on_settings_updated(inc)
        })
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Drive one content script until its endpoint closes (tab removed or
/// script replaced). Everything the instance created is removed on exit.
pub async fn run(mut script: ContentScript, inbox: ContentInbox) {
    let ContentInbox {
        mut endpoint,
        mut events_rx,
        mut fetch_rx,
    } = inbox;
    let mut dispatcher = content_dispatcher(script.tab_id);
    let document = Arc::clone(&script.document);

    info!(tab = script.tab_id, url = %document.url(), "Content script started");
    script.activate();

    let mut poll = tokio::time::interval(script.watcher.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    poll.tick().await;

    loop {
        let settle_at = script.watcher.settle_deadline();
        let refresh_at = script.auto_refresh_at;
        let waiting_for_dom = script.waiting_for_dom;

        tokio::select! {
            delivery = endpoint.recv() => {
                match delivery {
                    Some(delivery) => {
                        dispatcher.dispatch(&mut script, delivery);
                    }
                    None => {
                        debug!(tab = script.tab_id, "Endpoint closed");
                        break;
                    }
                }
            }

            Some(event) = events_rx.recv() => script.on_dom_event(event),

            Some(outcome) = fetch_rx.recv() => script.apply_fetch(outcome),

            _ = poll.tick() => script.sample_url(),

            _ = sleep_until_opt(settle_at), if settle_at.is_some() => script.on_settled(),

            _ = sleep_until_opt(refresh_at), if refresh_at.is_some() => script.on_auto_refresh(),

            _ = document.content_loaded(), if waiting_for_dom => script.on_dom_ready(),
        }
    }

    script.shutdown();
}
