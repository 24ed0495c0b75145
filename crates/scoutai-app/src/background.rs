// Background router: the one long-lived context.
//
// It owns the network (API_REQUEST relays), forwards draft-state queries to
// the sending tab, injects content scripts on supported pages, and fans
// settings changes out to every content script.
//
// Handlers never block the loop: anything that awaits another context or the
// network runs on its own task and answers through its responder.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use scoutai_core::platform::Platform;
use scoutai_core::protocol::{error_reply, reply_error, ContextAddr, Message, MessageType, TabId};
use scoutai_core::settings::{Settings, SettingsChange, SettingsStore};
use scoutai_core::ScoutError;
use scoutai_gateway::ApiGateway;

use crate::bus::{BroadcastReport, Dispatcher, Incoming, MessageBus};

/// How much sooner a forwarded request gives up than its original sender.
const FORWARD_MARGIN: Duration = Duration::from_millis(250);

/// Timeout for a request forwarded on behalf of a sender that waits
/// `reply_timeout`. Our own error must reach the sender before its timer does.
fn forward_timeout(reply_timeout: Duration) -> Duration {
    reply_timeout - FORWARD_MARGIN.min(reply_timeout / 4)
}

fn log_send_failure(tab: TabId, what: &str, e: &ScoutError) {
    if e.is_transient() {
        debug!(tab, "{what}: {e}");
    } else {
        warn!(tab, "{what}: {e}");
    }
}

/// Browser notifications delivered to the router.
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserEvent {
    /// Extension installed or browser started.
    Activated,
    /// A tab finished loading `url`.
    NavigationCompleted { tab: TabId, url: String },
    /// The toolbar icon was clicked while `tab` was active.
    IconClicked { tab: TabId, url: Option<String> },
    TabRemoved { tab: TabId },
}

/// What the router needs from the browser.
#[async_trait]
pub trait BrowserShell: Send + Sync {
    async fn inject_content_script(&self, tab: TabId) -> Result<()>;
    async fn open_popup(&self) -> Result<()>;
    /// Current URL of `tab`, if it exists.
    fn tab_url(&self, tab: TabId) -> Option<String>;
}

pub struct BackgroundRouter {
    bus: MessageBus,
    settings: SettingsStore,
    gateway: Arc<dyn ApiGateway>,
    shell: Arc<dyn BrowserShell>,
    defaults: Settings,
}

impl BackgroundRouter {
    pub fn new(
        bus: MessageBus,
        settings: SettingsStore,
        gateway: Arc<dyn ApiGateway>,
        shell: Arc<dyn BrowserShell>,
        defaults: Settings,
    ) -> Self {
        BackgroundRouter {
            bus,
            settings,
            gateway,
            shell,
            defaults,
        }
    }

    fn initialize_settings(&self) {
        match self.settings.initialize_defaults(self.defaults.clone()) {
            Ok(true) => info!("Default settings written"),
            Ok(false) => {}
            Err(e) => error!("Failed to initialize settings: {e:#}"),
        }
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Forward GET_DRAFT_STATE to the sending tab as EXTRACT_DRAFT_STATE and
    /// relay its answer unchanged.
    fn on_get_draft_state(&mut self, incoming: Incoming) {
        let Some(tab) = incoming.from.tab_id() else {
            incoming.reply(error_reply("GET_DRAFT_STATE must come from a tab"));
            return;
        };
        let bus = self.bus.clone();
        let timeout = forward_timeout(bus.reply_timeout());
        tokio::spawn(async move {
            let reply = match bus
                .send_with_timeout(
                    ContextAddr::Background,
                    ContextAddr::Tab(tab),
                    Message::ExtractDraftState,
                    timeout,
                )
                .await
            {
                Ok(reply) => reply.unwrap_or(Value::Null),
                Err(e) => {
                    log_send_failure(tab, "Draft state extraction failed", &e);
                    error_reply(e)
                }
            };
            incoming.reply(reply);
        });
    }

    /// Perform the caller's HTTP request and reply with the decoded body or
    /// `{"error": ...}`.
    fn on_api_request(&mut self, incoming: Incoming) {
        let Message::ApiRequest(request) = incoming.message().clone() else {
            incoming.reply(error_reply("API_REQUEST without payload"));
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        let from = incoming.from;
        tokio::spawn(async move {
            let reply = match gateway.request(&request).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(%from, url = %request.url, "API request failed: {e}");
                    error_reply(e)
                }
            };
            incoming.reply(reply);
        });
    }

    // -----------------------------------------------------------------------
    // Browser events
    // -----------------------------------------------------------------------

    fn on_browser_event(&mut self, event: BrowserEvent) {
        match event {
            BrowserEvent::Activated => self.initialize_settings(),
            BrowserEvent::NavigationCompleted { tab, url } => self.on_navigation_completed(tab, url),
            BrowserEvent::IconClicked { tab, url } => self.on_icon_clicked(tab, url),
            BrowserEvent::TabRemoved { tab } => {
                debug!(tab, "Tab removed");
                self.bus.unregister(ContextAddr::Tab(tab));
            }
        }
    }

    fn on_navigation_completed(&mut self, tab: TabId, url: String) {
        if !Platform::detect(&url).is_supported() {
            return;
        }
        if self.bus.is_registered(ContextAddr::Tab(tab)) {
            debug!(tab, "Content script already present");
            return;
        }
        let shell = Arc::clone(&self.shell);
        tokio::spawn(async move {
            match shell.inject_content_script(tab).await {
                Ok(()) => info!(tab, %url, "Injected content script"),
                Err(e) => warn!(tab, %url, "Failed to inject content script: {e:#}"),
            }
        });
    }

    /// On a supported page with a live content script the icon toggles the
    /// overlay; anywhere else it opens the popup.
    fn on_icon_clicked(&mut self, tab: TabId, url: Option<String>) {
        let supported = url
            .as_deref()
            .is_some_and(|u| Platform::detect(u).is_supported());
        let bus = self.bus.clone();
        let shell = Arc::clone(&self.shell);
        tokio::spawn(async move {
            if supported && bus.is_registered(ContextAddr::Tab(tab)) {
                match bus
                    .send(ContextAddr::Background, ContextAddr::Tab(tab), Message::ToggleSidebar)
                    .await
                {
                    Ok(Some(reply)) if reply_error(&reply).is_some() => {
                        debug!(tab, "Overlay not available: {}", reply_error(&reply).unwrap_or_default());
                    }
                    Ok(_) => return,
                    Err(e) => log_send_failure(tab, "Toggle from icon failed", &e),
                }
            }
            if let Err(e) = shell.open_popup().await {
                warn!("Failed to open popup: {e:#}");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Settings fan-out
    // -----------------------------------------------------------------------

    /// Send SETTINGS_UPDATED to every content script on a supported page.
    pub async fn broadcast_settings(&self, change: SettingsChange) -> BroadcastReport {
        let shell = Arc::clone(&self.shell);
        let report = self
            .bus
            .broadcast(
                ContextAddr::Background,
                |addr| match addr {
                    ContextAddr::Tab(tab) => shell
                        .tab_url(tab)
                        .is_some_and(|url| Platform::detect(&url).is_supported()),
                    _ => false,
                },
                Message::SettingsUpdated(change),
            )
            .await;
        for (addr, e) in &report.failed {
            if let Some(tab) = addr.tab_id() {
                log_send_failure(tab, "Settings update not delivered", e);
            }
        }
        debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Settings broadcast"
        );
        report
    }

    async fn on_settings_change(
        &mut self,
        change: Result<SettingsChange, broadcast::error::RecvError>,
    ) -> bool {
        match change {
            Ok(change) => {
                self.broadcast_settings(change).await;
                true
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Settings notifications lagged, re-broadcasting current record");
                match self.settings.get() {
                    Ok(settings) => {
                        self.broadcast_settings(SettingsChange::everything(settings)).await;
                    }
                    Err(e) => error!("Failed to read settings: {e:#}"),
                }
                true
            }
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }
}

fn router_dispatcher() -> Dispatcher<BackgroundRouter> {
    Dispatcher::new(ContextAddr::Background)
        .on_type("get-draft-state", MessageType::GetDraftState, |r: &mut BackgroundRouter, inc| {
            r.on_get_draft_state(inc)
        })
        .on_type("api-request", MessageType::ApiRequest, |r: &mut BackgroundRouter, inc| {
            r.on_api_request(inc)
        })
}

/// Run the router until the browser event channel closes.
pub async fn run(mut router: BackgroundRouter, mut events: mpsc::Receiver<BrowserEvent>) {
    let mut endpoint = router.bus.register(ContextAddr::Background);
    let mut changes = router.settings.subscribe();
    let mut changes_open = true;
    let mut dispatcher = router_dispatcher();

    info!("Background router started");
    router.initialize_settings();

    loop {
        tokio::select! {
            delivery = endpoint.recv() => {
                match delivery {
                    Some(delivery) => {
                        dispatcher.dispatch(&mut router, delivery);
                    }
                    None => {
                        info!("Background endpoint replaced, shutting down");
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Some(event) => router.on_browser_event(event),
                    None => {
                        info!("Browser event channel closed, shutting down");
                        break;
                    }
                }
            }

            change = changes.recv(), if changes_open => {
                changes_open = router.on_settings_change(change).await;
            }
        }
    }
}
