use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::oauth::{OAuthProvider, ProviderConfig};
use crate::types::error::MinerError;

pub const CONFIG_ENV: &str = "MAILMINER_CONFIG";

/// Miner configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinerConfig {
    #[serde(default)]
    pub imap: ImapSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub fetch_service: FetchServiceSettings,

    #[serde(default)]
    pub oauth: OAuthSettings,
}

/// Fetch engine and connection pool tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    /// Ceiling on simultaneously open sessions per mailbox
    pub max_connections: usize,

    pub connect_timeout_ms: u64,

    /// Time allowed for the greeting and authentication exchange
    pub greeting_timeout_ms: u64,

    /// Messages per work unit
    pub fetch_chunk_size: u32,

    /// Published messages between two progress events
    pub progress_batch_size: u64,

    /// Minimum delay between two work unit starts
    pub task_spacing_ms: u64,

    /// Window during which a second token refresh is not attempted
    pub refresh_cooldown_secs: u64,

    /// Fetch full messages rather than headers only
    pub fetch_body: bool,

    /// Folders never mined
    pub excluded_folders: Vec<String>,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_ms: 10_000,
            greeting_timeout_ms: 10_000,
            fetch_chunk_size: 10_000,
            progress_batch_size: 50,
            task_spacing_ms: 200,
            refresh_cooldown_secs: 60,
            fetch_body: true,
            excluded_folders: default_excluded_folders(),
        }
    }
}

fn default_excluded_folders() -> Vec<String> {
    [
        "[Gmail]",
        "[Gmail]/All Mail",
        "[Gmail]/Important",
        "[Gmail]/Starred",
        "[Gmail]/Trash",
        "[Gmail]/Spam",
        "[Gmail]/Drafts",
        "Trash",
        "Junk",
        "Spam",
        "Drafts",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ImapSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    pub fn task_spacing(&self) -> Duration {
        Duration::from_millis(self.task_spacing_ms)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.refresh_cooldown_secs)
    }

    pub fn is_excluded(&self, folder: &str) -> bool {
        self.excluded_folders
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(folder))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("mailminer").join("tasks.db"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchServiceSettings {
    /// Remote fetch service; the fetcher runs in-process when unset
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub google: Option<OAuthClientSettings>,
    pub microsoft: Option<OAuthClientSettings>,
}

/// Client registration for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClientSettings {
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Defaults to the provider's public token endpoint
    pub token_url: Option<String>,
}

impl OAuthSettings {
    pub fn provider_config(&self, provider: OAuthProvider) -> Option<ProviderConfig> {
        let settings = match provider {
            OAuthProvider::Google => self.google.as_ref(),
            OAuthProvider::Microsoft => self.microsoft.as_ref(),
        }?;
        Some(ProviderConfig {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            token_url: settings
                .token_url
                .clone()
                .unwrap_or_else(|| provider.default_token_url().to_string()),
        })
    }
}

impl MinerConfig {
    /// Load from `explicit`, `$MAILMINER_CONFIG`, or the default path, in
    /// that order. No file means defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, MinerError> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_path(Path::new(&path));
        }
        for path in default_config_paths() {
            if path.exists() {
                info!("Found config at: {:?}", path);
                return Self::from_path(&path);
            }
        }
        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> Result<Self, MinerError> {
        info!("Loading configuration from: {:?}", path);

        let content = fs::read_to_string(path).map_err(|e| {
            MinerError::config(format!("Failed to read config: {}", e), &[])
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, MinerError> {
        let config: MinerConfig = toml::from_str(content)
            .map_err(|e| MinerError::config(format!("Failed to parse config: {}", e), &[]))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MinerError> {
        if self.imap.max_connections == 0 {
            return Err(MinerError::config(
                "imap.max_connections must be at least 1",
                &["max_connections"],
            ));
        }
        if self.imap.fetch_chunk_size == 0 {
            return Err(MinerError::config(
                "imap.fetch_chunk_size must be at least 1",
                &["fetch_chunk_size"],
            ));
        }
        if self.imap.progress_batch_size == 0 {
            return Err(MinerError::config(
                "imap.progress_batch_size must be at least 1",
                &["progress_batch_size"],
            ));
        }
        if let Some(base_url) = &self.fetch_service.base_url {
            url::Url::parse(base_url).map_err(|e| {
                MinerError::config(
                    format!("fetch_service.base_url is invalid: {}", e),
                    &["base_url"],
                )
            })?;
        }
        Ok(())
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mailminer").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("mailminer").join("config.toml"));
    }

    paths
}
