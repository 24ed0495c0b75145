// SQLite persistence for the settings record.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::{Map, Value};

use crate::settings::{Settings, SettingsBackend};

/// SQLite-backed key-value storage for [`Settings`]. Each settings field is
/// one row whose value is stored as JSON text.
pub struct SettingsDb {
    conn: Mutex<Connection>,
}

impl SettingsDb {
    /// Open (or create) a SQLite database at `path` and ensure the table
    /// exists. Pass `":memory:"` for an ephemeral database (useful for tests).
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create settings directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open settings database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .context("failed to create settings schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

impl SettingsBackend for SettingsDb {
    fn load(&self) -> Result<Option<Settings>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .context("failed to prepare settings query")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("failed to query settings")?;

        let mut record = Map::new();
        for row in rows {
            let (key, text) = row.context("failed to read settings row")?;
            let value: Value = serde_json::from_str(&text)
                .with_context(|| format!("setting {key} is not valid JSON"))?;
            record.insert(key, value);
        }

        if record.is_empty() {
            return Ok(None);
        }

        // Missing fields (records written by older versions) take defaults.
        let settings = serde_json::from_value(Value::Object(record))
            .context("failed to decode stored settings")?;
        Ok(Some(settings))
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let Value::Object(fields) =
            serde_json::to_value(settings).context("failed to serialize settings")?
        else {
            anyhow::bail!("settings did not serialize to an object");
        };

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin settings write")?;
        // Drop keys from older layouts so they cannot shadow the new ones.
        tx.execute("DELETE FROM settings", [])
            .context("failed to clear previous settings")?;
        for (key, value) in &fields {
            tx.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value.to_string()],
            )
            .with_context(|| format!("failed to write setting {key}"))?;
        }
        tx.commit().context("failed to commit settings write")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsStore;
    use std::sync::Arc;

    fn test_db() -> SettingsDb {
        SettingsDb::open(":memory:").expect("in-memory db should open")
    }

    /// Raw JSON value stored under `key`.
    fn stored(db: &SettingsDb, key: &str) -> Option<Value> {
        let conn = db.conn();
        let mut stmt = conn
            .prepare("SELECT value FROM settings WHERE key = ?1")
            .unwrap();
        let mut rows = stmt.query(params![key]).unwrap();
        let row = rows.next().unwrap()?;
        let text: String = row.get(0).unwrap();
        Some(serde_json::from_str(&text).unwrap())
    }

    #[test]
    fn empty_database_has_no_record() {
        let db = test_db();
        assert!(db.load().unwrap().is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let db = test_db();
        let settings = Settings {
            enabled: false,
            api_url: "http://scoring.local:8080".into(),
            auto_refresh: false,
            refresh_interval_seconds: 90,
        };
        db.save(&settings).unwrap();
        assert_eq!(db.load().unwrap(), Some(settings));
    }

    #[test]
    fn fields_are_stored_as_separate_keys() {
        let db = test_db();
        db.save(&Settings::default()).unwrap();
        assert_eq!(
            stored(&db, "apiUrl"),
            Some(Value::String("http://localhost:8000".into()))
        );
        assert_eq!(
            stored(&db, "refreshIntervalSeconds"),
            Some(Value::from(30))
        );
        assert!(stored(&db, "missing").is_none());
    }

    #[test]
    fn save_overwrites_previous_values() {
        let db = test_db();
        db.save(&Settings::default()).unwrap();
        db.save(&Settings::with_api_url("http://b")).unwrap();
        assert_eq!(db.load().unwrap().unwrap().api_url, "http://b");
    }

    #[test]
    fn legacy_rows_are_completed_with_defaults() {
        let db = test_db();
        {
            let conn = db.conn();
            conn.execute(
                "INSERT INTO settings (key, value) VALUES ('refreshInterval', '15')",
                [],
            )
            .unwrap();
        }
        let settings = db.load().unwrap().unwrap();
        assert_eq!(settings.refresh_interval_seconds, 15);
        assert!(settings.enabled);

        // Rewriting replaces the legacy key instead of duplicating it.
        db.save(&settings).unwrap();
        assert!(stored(&db, "refreshInterval").is_none());
        assert_eq!(db.load().unwrap().unwrap().refresh_interval_seconds, 15);
    }

    #[test]
    fn settings_survive_reopen() {
        let dir = std::env::temp_dir().join("scoutai_settings_reopen_test");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("settings.db");
        let path_str = path.to_str().unwrap();

        {
            let store = SettingsStore::new(Arc::new(SettingsDb::open(path_str).unwrap()));
            assert!(store.initialize_defaults(Settings::default()).unwrap());
            store.update(|s| s.auto_refresh = false).unwrap();
        }

        let store = SettingsStore::new(Arc::new(SettingsDb::open(path_str).unwrap()));
        assert!(!store.initialize_defaults(Settings::default()).unwrap());
        assert!(!store.get().unwrap().auto_refresh);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
