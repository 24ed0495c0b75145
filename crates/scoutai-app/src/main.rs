// ScoutAI headless host.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Open the settings store
// 4. Build the bus, gateway, browser host and background router
// 5. Open one tab per URL argument and drive it through the popup
// 6. Print each tab's overlay panel
// 7. Shut down on completion or Ctrl+C

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{error, info, warn};

use scoutai_app::background::{self, BackgroundRouter};
use scoutai_app::browser::HeadlessBrowser;
use scoutai_app::bus::MessageBus;
use scoutai_app::content::extractor::DRAFT_ISLAND_ID;
use scoutai_app::content::overlay::{PanelView, MOUNT_ID};
use scoutai_app::content::{ContentOptions, DataIslandExtractor, HeadlessDocument, LifecycleState};
use scoutai_app::popup::PopupController;
use scoutai_core::config::{self, Config};
use scoutai_core::db::SettingsDb;
use scoutai_core::platform::{is_supported_draft_page, Platform};
use scoutai_core::settings::SettingsStore;
use scoutai_gateway::HttpGateway;

struct Args {
    draft_state: Option<PathBuf>,
    urls: Vec<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut draft_state = None;
    let mut urls = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--draft-state" => {
                let path = args.next().context("--draft-state needs a file argument")?;
                draft_state = Some(PathBuf::from(path));
            }
            _ => urls.push(arg),
        }
    }
    if urls.is_empty() {
        bail!("usage: scoutai [--draft-state FILE] <url>...");
    }
    Ok(Args { draft_state, urls })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("ScoutAI starting up");

    let args = parse_args()?;
    let draft_json = match &args.draft_state {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        None => None,
    };

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: reply timeout {:?}, poll {:?}, settle {:?}",
        config.reply_timeout(),
        config.poll_interval(),
        config.settle_delay()
    );

    // 3. Open the settings store
    let db_path = config.settings_db_path();
    let db = SettingsDb::open(&db_path.to_string_lossy()).context("failed to open settings store")?;
    info!("Settings store opened at {}", db_path.display());
    let settings = SettingsStore::new(Arc::new(db));

    // 4. Wire the contexts together
    let bus = MessageBus::new(config.reply_timeout());
    let gateway =
        HttpGateway::new(config.gateway_timeout()).context("failed to build HTTP client")?;
    let (browser, events) = HeadlessBrowser::new(
        bus.clone(),
        settings.clone(),
        Arc::new(DataIslandExtractor::default()),
        ContentOptions::from_config(&config),
    );
    let router = BackgroundRouter::new(
        bus.clone(),
        settings.clone(),
        Arc::new(gateway),
        Arc::new(browser.clone()),
        config.default_settings(),
    );
    let router_handle = tokio::spawn(background::run(router, events));
    browser.activate().await;

    // 5-6. Drive each tab, or stop early on Ctrl+C
    tokio::select! {
        result = drive(&browser, &config, &args.urls, draft_json.as_deref()) => {
            if let Err(e) = result {
                error!("Run failed: {e:#}");
                eprintln!("error: {e:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
        }
    }

    // 7. Cleanup
    let _ = tokio::time::timeout(Duration::from_secs(5), browser.shutdown()).await;
    router_handle.abort();

    info!("ScoutAI shut down cleanly");
    Ok(())
}

async fn drive(
    browser: &HeadlessBrowser,
    config: &Config,
    urls: &[String],
    draft_json: Option<&str>,
) -> anyhow::Result<()> {
    let wait = config.api_request_timeout();

    for url in urls {
        let document = Arc::new(HeadlessDocument::loaded(url.as_str()));
        if let Some(json) = draft_json {
            document.set_data_island(DRAFT_ISLAND_ID, json);
        }
        let tab = browser.open_document(Arc::clone(&document)).await;
        println!("[tab {tab}] {url}");

        if Platform::detect(url).is_supported() {
            tokio::time::timeout(wait, browser.wait_for_injection(tab))
                .await
                .context("content script was not injected")?;
        }

        let mut popup = PopupController::open(browser.bus().clone(), browser.active_tab());
        println!("  popup: {}", popup.status().text);

        if !is_supported_draft_page(url) {
            continue;
        }
        let mounted = tokio::time::timeout(
            wait,
            browser.wait_for_content(tab, |s| s.is_mounted() || s == LifecycleState::Inactive),
        )
        .await
        .ok()
        .flatten();
        if mounted.map_or(true, |s| !s.is_mounted()) {
            warn!(tab, "Overlay did not mount");
            println!("  overlay: not mounted");
            continue;
        }

        popup.toggle().await;
        if !popup.is_closed() {
            println!("  popup: {}", popup.status().text);
        }

        match tokio::time::timeout(wait, settled_panel(&document)).await {
            Ok(panel) => {
                for line in panel.to_text().lines() {
                    println!("  {line}");
                }
            }
            Err(_) => println!("  overlay: no recommendations within {wait:?}"),
        }
    }
    Ok(())
}

/// The overlay panel once it is no longer loading.
async fn settled_panel(document: &HeadlessDocument) -> PanelView {
    loop {
        if let Some(panel) = document.panel(MOUNT_ID) {
            if !panel.loading {
                return panel;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Initialize tracing to log to a file, keeping stdout for the panels.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("scoutai.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("scoutai=info,scoutai_app=info,scoutai_core=info,scoutai_gateway=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
