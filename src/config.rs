//! Runtime configuration for the offline subsystem.
//!
//! Values come from three layers, later ones winning: built-in defaults, an
//! optional JSON file, and a handful of `PHARMACY_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const ENV_SERVER_URL: &str = "PHARMACY_SERVER_URL";
const ENV_DATA_DIR: &str = "PHARMACY_DATA_DIR";
const ENV_CACHE_VERSION: &str = "PHARMACY_CACHE_VERSION";
const ENV_LOG: &str = "PHARMACY_LOG";

const APP_DIR_NAME: &str = "pharmacy-offline";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub server_url: String,
    pub data_dir: PathBuf,
    pub database_file: String,
    pub cache_version: String,
    pub precache_manifest: Vec<String>,
    pub offline_page: String,
    pub api_path_marker: String,
    pub health_path: String,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    pub log_filter: String,
    pub max_log_files: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".to_string(),
            data_dir: default_data_dir(),
            database_file: "pharmacy.db".to_string(),
            cache_version: "pharmacy-cache-v3".to_string(),
            precache_manifest: [
                "/",
                "/static/animations.css",
                "/static/animations.js",
                "/static/offline-db.js",
                "/static/offline-manager.js",
                "/static/manifest.json",
                "/static/offline.html",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            offline_page: "/static/offline.html".to_string(),
            api_path_marker: "/api/".to_string(),
            health_path: "/".to_string(),
            probe_interval_secs: 15,
            probe_timeout_secs: 5,
            request_timeout_secs: 30,
            reconnect_delay_ms: 1_000,
            log_filter: "info,pharmacy_offline=debug".to_string(),
            max_log_files: 10,
        }
    }
}

impl OfflineConfig {
    /// Build the effective configuration.
    ///
    /// A missing file is not an error (defaults apply); a file that exists but
    /// cannot be parsed is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.to_path_buf(),
                    source,
                })?;
                info!(path = %p.display(), "Loaded offline config file");
                serde_json::from_str::<OfflineConfig>(&raw).map_err(|source| {
                    ConfigError::Parse {
                        path: p.to_path_buf(),
                        source,
                    }
                })?
            }
            Some(p) => {
                debug!(path = %p.display(), "Config file not found, using defaults");
                OfflineConfig::default()
            }
            None => OfflineConfig::default(),
        };

        config.apply_env_overrides();
        config.server_url = normalize_server_url(&config.server_url);
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = env_non_empty(ENV_SERVER_URL) {
            self.server_url = url;
        }
        if let Some(dir) = env_non_empty(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(version) = env_non_empty(ENV_CACHE_VERSION) {
            self.cache_version = version;
        }
        if let Some(filter) = env_non_empty(ENV_LOG) {
            self.log_filter = filter;
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Join a site-relative path onto the server URL. Absolute http(s) URLs
    /// are returned unchanged.
    pub fn resolve_url(&self, path: &str) -> String {
        resolve_against(&self.server_url, path)
    }
}

/// Normalise the server URL:
/// - ensure a scheme is present (http for localhost, https otherwise)
/// - strip trailing slashes
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

pub(crate) fn resolve_against(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Platform data directory, following the same lookup order as the log
/// location of the desktop POS.
fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
