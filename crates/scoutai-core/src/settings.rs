// Process-wide settings and the store every context reads them through.
//
// The store is the single owner of the persisted record. Contexts call
// `get()` when they need a value and do not keep a copy past the handler
// that asked; changes are observed through `subscribe()`. Writes are
// last-writer-wins per record.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_REFRESH_INTERVAL_SECONDS: u32 = 30;

/// Capacity of the change-notification channel. Slow subscribers that fall
/// further behind than this see `RecvError::Lagged` and should re-read.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Wire names of the settings fields.
pub const FIELDS: [&str; 4] = ["enabled", "apiUrl", "autoRefresh", "refreshIntervalSeconds"];

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    pub api_url: String,
    pub auto_refresh: bool,
    /// Older records stored this under `refreshInterval`.
    #[serde(alias = "refreshInterval")]
    pub refresh_interval_seconds: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            enabled: true,
            api_url: DEFAULT_API_URL.to_string(),
            auto_refresh: true,
            refresh_interval_seconds: DEFAULT_REFRESH_INTERVAL_SECONDS,
        }
    }
}

impl Settings {
    /// Defaults with a different API base URL.
    pub fn with_api_url(api_url: impl Into<String>) -> Self {
        Settings {
            api_url: api_url.into(),
            ..Settings::default()
        }
    }

    /// Wire names of the fields that differ between `self` and `other`.
    pub fn changed_fields(&self, other: &Settings) -> Vec<String> {
        let mut changed = Vec::new();
        if self.enabled != other.enabled {
            changed.push("enabled".to_string());
        }
        if self.api_url != other.api_url {
            changed.push("apiUrl".to_string());
        }
        if self.auto_refresh != other.auto_refresh {
            changed.push("autoRefresh".to_string());
        }
        if self.refresh_interval_seconds != other.refresh_interval_seconds {
            changed.push("refreshIntervalSeconds".to_string());
        }
        changed
    }
}

/// A committed write: the new record and which fields it changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsChange {
    pub settings: Settings,
    pub changed: Vec<String>,
}

impl SettingsChange {
    /// A change that reports every field, for first writes and resyncs.
    pub fn everything(settings: Settings) -> Self {
        SettingsChange {
            settings,
            changed: FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Where the settings record lives.
pub trait SettingsBackend: Send + Sync {
    /// `None` if nothing has been stored yet.
    fn load(&self) -> Result<Option<Settings>>;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Non-persistent backend for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryBackend {
    record: Mutex<Option<Settings>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Settings>> {
        Ok(self.record.lock().expect("settings mutex poisoned").clone())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        *self.record.lock().expect("settings mutex poisoned") = Some(settings.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Cloneable handle to the shared settings record.
#[derive(Clone)]
pub struct SettingsStore {
    backend: Arc<dyn SettingsBackend>,
    changes: broadcast::Sender<SettingsChange>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn SettingsBackend>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        SettingsStore { backend, changes }
    }

    /// An in-memory store, empty until `initialize_defaults` or `set`.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Write `defaults` if no record exists yet. Returns `true` if it wrote.
    /// Subsequent calls are no-ops, whatever `defaults` holds.
    pub fn initialize_defaults(&self, defaults: Settings) -> Result<bool> {
        if self.backend.load()?.is_some() {
            debug!("Settings already initialized");
            return Ok(false);
        }
        self.backend.save(&defaults)?;
        info!("Settings initialized to defaults (apiUrl={})", defaults.api_url);
        let _ = self.changes.send(SettingsChange::everything(defaults));
        Ok(true)
    }

    /// Current settings; defaults if nothing has been stored.
    pub fn get(&self) -> Result<Settings> {
        Ok(self.backend.load()?.unwrap_or_default())
    }

    /// Whether a record has been stored.
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.backend.load()?.is_some())
    }

    /// Replace the record. Subscribers are notified if any field changed.
    /// Returns the changed field names.
    pub fn set(&self, settings: Settings) -> Result<Vec<String>> {
        let previous = self.get()?;
        self.backend.save(&settings)?;
        let changed = previous.changed_fields(&settings);
        if !changed.is_empty() {
            info!("Settings changed: {}", changed.join(", "));
            self.notify(settings, changed.clone());
        }
        Ok(changed)
    }

    /// Read-modify-write. Not transactional: a concurrent `set` between the
    /// read and the write is overwritten.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<Vec<String>> {
        let mut settings = self.get()?;
        f(&mut settings);
        self.set(settings)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }

    fn notify(&self, settings: Settings, changed: Vec<String>) {
        // No subscribers is fine.
        let _ = self.changes.send(SettingsChange { settings, changed });
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
