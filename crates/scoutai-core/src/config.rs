// Configuration loading and parsing (config/scoutai.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::settings::Settings;

pub const CONFIG_FILE: &str = "scoutai.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub router: RouterConfig,
    pub navigation: NavigationConfig,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Upper bound on waiting for a reply to a request-shaped message.
    pub reply_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavigationConfig {
    /// How often the content script samples the page URL.
    pub poll_interval_ms: u64,
    /// How long to wait after a URL change before re-evaluating the page.
    /// Client-side routers change the URL before the new view renders.
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub request_timeout_secs: u64,
    /// Path appended to `Settings::api_url` for scoring requests.
    pub recommendations_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite file for the settings record. Empty selects the per-user data
    /// directory.
    #[serde(default)]
    pub settings_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    pub api_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            router: RouterConfig {
                reply_timeout_ms: 5000,
            },
            navigation: NavigationConfig {
                poll_interval_ms: 1000,
                settle_delay_ms: 1000,
            },
            gateway: GatewayConfig {
                request_timeout_secs: 30,
                recommendations_path: "/recommendations".into(),
            },
            storage: StorageConfig {
                settings_db: String::new(),
            },
            defaults: DefaultsConfig {
                api_url: crate::settings::DEFAULT_API_URL.into(),
            },
        }
    }
}

impl Config {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.router.reply_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.navigation.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.navigation.settle_delay_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.request_timeout_secs)
    }

    /// How long a context waits for an `API_REQUEST` relayed through the
    /// background: the gateway's own bound plus the routing bound.
    pub fn api_request_timeout(&self) -> Duration {
        self.reply_timeout() + self.gateway_timeout()
    }

    /// Settings written on first activation.
    pub fn default_settings(&self) -> Settings {
        Settings::with_api_url(self.defaults.api_url.clone())
    }

    /// Resolve the settings database path. An empty `storage.settings_db`
    /// falls back to the platform data directory, then the working directory.
    pub fn settings_db_path(&self) -> PathBuf {
        if !self.storage.settings_db.is_empty() {
            return PathBuf::from(&self.storage.settings_db);
        }
        directories::ProjectDirs::from("com", "ScoutAI", "scoutai")
            .map(|dirs| dirs.data_dir().join("settings.db"))
            .unwrap_or_else(|| PathBuf::from("scoutai-settings.db"))
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/scoutai.toml` relative to `base_dir`.
///
/// This is the lower-level loading primitive that does not auto-copy defaults.
/// `load_config()` also seeds the file from `defaults/` first.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    validate(&config)?;

    Ok(config)
}

/// Seed `config/scoutai.toml` from `defaults/scoutai.toml` when it is missing.
///
/// Returns the path written, or `None` when the user's file already exists.
/// An existing file is never touched, even if it races with another process.
pub fn ensure_config_file(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let target = base_dir.join("config").join(CONFIG_FILE);
    if target.exists() {
        return Ok(None);
    }
    let source = base_dir.join("defaults").join(CONFIG_FILE);
    let defaults = std::fs::read(&source).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!(
            "no {} and no readable {} ({e}); run from the project root",
            target.display(),
            source.display()
        ),
    })?;

    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to create {}: {e}", dir.display()),
        })?;
    }
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => {
            return Err(ConfigError::DefaultsCopyError {
                message: format!("failed to create {}: {e}", target.display()),
            })
        }
    };
    std::io::Write::write_all(&mut file, &defaults).map_err(|e| {
        ConfigError::DefaultsCopyError {
            message: format!("failed to write {}: {e}", target.display()),
        }
    })?;
    Ok(Some(target))
}

/// Convenience wrapper: loads config relative to the current working directory.
/// Seeds the config file from `defaults/` before loading.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_file(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let positive: &[(&str, u64)] = &[
        ("router.reply_timeout_ms", config.router.reply_timeout_ms),
        ("navigation.poll_interval_ms", config.navigation.poll_interval_ms),
        ("gateway.request_timeout_secs", config.gateway.request_timeout_secs),
    ];
    for (name, val) in positive {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    if !config.gateway.recommendations_path.starts_with('/') {
        return Err(ConfigError::ValidationError {
            field: "gateway.recommendations_path".into(),
            message: format!(
                "must start with '/', got {:?}",
                config.gateway.recommendations_path
            ),
        });
    }

    match Url::parse(&config.defaults.api_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => {
            return Err(ConfigError::ValidationError {
                field: "defaults.api_url".into(),
                message: format!(
                    "must be an absolute http(s) URL, got {:?}",
                    config.defaults.api_url
                ),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Helper: returns the workspace root holding `defaults/`
    /// (works whether `cargo test` runs from the crate or the workspace).
    fn project_root() -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        if cwd.join("defaults").exists() {
            cwd
        } else if cwd.join("../../defaults").exists() {
            cwd.join("../..")
        } else {
            panic!("Cannot locate defaults/ directory from CWD {:?}", cwd);
        }
    }

    /// Helper: fresh temp dir with `config/scoutai.toml` containing `body`.
    fn temp_config(name: &str, body: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("config").join(CONFIG_FILE), body).unwrap();
        tmp
    }

    fn defaults_text() -> String {
        fs::read_to_string(project_root().join("defaults").join(CONFIG_FILE)).unwrap()
    }

    #[test]
    fn default_file_matches_builtin_defaults() {
        let tmp = temp_config("scoutai_config_defaults", &defaults_text());
        let config = load_config_from(&tmp).expect("defaults should load");
        let builtin = Config::default();

        assert_eq!(config.router.reply_timeout_ms, builtin.router.reply_timeout_ms);
        assert_eq!(config.navigation.poll_interval_ms, 1000);
        assert_eq!(config.navigation.settle_delay_ms, 1000);
        assert_eq!(config.gateway.request_timeout_secs, 30);
        assert_eq!(config.gateway.recommendations_path, "/recommendations");
        assert_eq!(config.defaults.api_url, "http://localhost:8000");
        assert!(config.storage.settings_db.is_empty());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn durations_are_derived_from_fields() {
        let config = Config::default();
        assert_eq!(config.reply_timeout(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.gateway_timeout(), Duration::from_secs(30));
        assert_eq!(config.api_request_timeout(), Duration::from_secs(35));
    }

    #[test]
    fn default_settings_use_configured_api_url() {
        let mut config = Config::default();
        config.defaults.api_url = "http://127.0.0.1:9999".into();
        let settings = config.default_settings();
        assert_eq!(settings.api_url, "http://127.0.0.1:9999");
        assert!(settings.enabled);
        assert_eq!(settings.refresh_interval_seconds, 30);
    }

    #[test]
    fn explicit_settings_db_path_wins() {
        let mut config = Config::default();
        config.storage.settings_db = "data/settings.db".into();
        assert_eq!(config.settings_db_path(), PathBuf::from("data/settings.db"));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let body = defaults_text().replace("poll_interval_ms = 1000", "poll_interval_ms = 0");
        let tmp = temp_config("scoutai_config_zero_poll", &body);
        match load_config_from(&tmp).unwrap_err() {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "navigation.poll_interval_ms")
            }
            other => panic!("unexpected error {other:?}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn zero_settle_delay_is_allowed() {
        let body = defaults_text().replace("settle_delay_ms = 1000", "settle_delay_ms = 0");
        let tmp = temp_config("scoutai_config_zero_settle", &body);
        let config = load_config_from(&tmp).expect("zero settle delay is valid");
        assert_eq!(config.settle_delay(), Duration::ZERO);
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_relative_api_url() {
        let body = defaults_text().replace("http://localhost:8000", "localhost:8000/api");
        let tmp = temp_config("scoutai_config_bad_url", &body);
        match load_config_from(&tmp).unwrap_err() {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "defaults.api_url"),
            other => panic!("unexpected error {other:?}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_recommendations_path_without_slash() {
        let body = defaults_text().replace(
            "recommendations_path = \"/recommendations\"",
            "recommendations_path = \"recommendations\"",
        );
        let tmp = temp_config("scoutai_config_bad_path", &body);
        assert!(matches!(
            load_config_from(&tmp).unwrap_err(),
            ConfigError::ValidationError { .. }
        ));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn file_not_found_for_missing_config() {
        let tmp = std::env::temp_dir().join("scoutai_config_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        assert!(matches!(
            load_config_from(&tmp).unwrap_err(),
            ConfigError::FileNotFound { .. }
        ));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn parse_error_for_invalid_toml() {
        let tmp = temp_config("scoutai_config_invalid", "[router\nreply_timeout_ms = ");
        assert!(matches!(
            load_config_from(&tmp).unwrap_err(),
            ConfigError::ParseError { .. }
        ));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_config_is_seeded_from_defaults() {
        let tmp = std::env::temp_dir().join("scoutai_ensure_copies");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("defaults")).unwrap();
        fs::write(tmp.join("defaults").join(CONFIG_FILE), defaults_text()).unwrap();
        fs::write(tmp.join("defaults/notes.txt"), "unrelated").unwrap();

        let copied = ensure_config_file(&tmp).unwrap();
        assert_eq!(copied, Some(tmp.join("config").join(CONFIG_FILE)));
        assert!(!tmp.join("config/notes.txt").exists());
        assert!(load_config_from(&tmp).is_ok());
        assert_eq!(ensure_config_file(&tmp).unwrap(), None);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn existing_config_is_left_alone() {
        let tmp = std::env::temp_dir().join("scoutai_ensure_skips");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("defaults")).unwrap();
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("defaults").join(CONFIG_FILE), defaults_text()).unwrap();
        fs::write(tmp.join("config").join(CONFIG_FILE), "# user edited").unwrap();

        assert_eq!(ensure_config_file(&tmp).unwrap(), None);
        assert_eq!(
            fs::read_to_string(tmp.join("config").join(CONFIG_FILE)).unwrap(),
            "# user edited"
        );

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_defaults_is_an_error() {
        let tmp = std::env::temp_dir().join("scoutai_ensure_none");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        assert!(matches!(
            ensure_config_file(&tmp).unwrap_err(),
            ConfigError::DefaultsCopyError { .. }
        ));
        let _ = fs::remove_dir_all(&tmp);
    }
}
