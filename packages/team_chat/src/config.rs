use anyhow::{Context, Result};
use message_stream::{Author, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    base_url = "https://chat.example.com"
//
//   env var:         TEAM_CHAT_SERVER__BASE_URL=https://chat.example.com
//                    (double underscore = nesting)
//
//   (single underscore stays within field names: TEAM_CHAT_AUTH__SESSION_COOKIE)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub stream: StreamFileConfig,
}

/// Server endpoints (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Push endpoint. Derived from `base_url` when unset.
    #[serde(default)]
    pub push_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            push_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Credentials (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// Sent verbatim as the `Cookie` header on every request and on the
    /// push connection upgrade.
    #[serde(default)]
    pub session_cookie: Option<String>,
    /// Our own user id, used to recognise echoes of our sends before the
    /// first one is confirmed.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Stream synchronization knobs (lives under `[stream]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    #[serde(default = "default_resubscribe_initial_ms")]
    pub resubscribe_initial_ms: u64,
    #[serde(default = "default_resubscribe_max_ms")]
    pub resubscribe_max_ms: u64,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            resubscribe_initial_ms: default_resubscribe_initial_ms(),
            resubscribe_max_ms: default_resubscribe_max_ms(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_resubscribe_initial_ms() -> u64 {
    500
}
fn default_resubscribe_max_ms() -> u64 {
    30_000
}
fn default_inbox_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → config.toml → TEAM_CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TEAM_CHAT_SERVER__BASE_URL=…`  →  `server.base_url = …`
///   `TEAM_CHAT_STREAM__INBOX_CAPACITY=64`  →  `stream.inbox_capacity = 64`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("TEAM_CHAT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Resolved endpoints and credentials (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Base URL without a trailing slash
    pub base_url: String,
    pub push_url: String,
    pub request_timeout: Duration,
    pub session_cookie: Option<String>,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig, auth: &AuthFileConfig) -> Self {
        let base_url = fc.base_url.trim_end_matches('/').to_string();
        let push_url = fc
            .push_url
            .clone()
            .unwrap_or_else(|| derive_push_url(&base_url));
        Self {
            base_url,
            push_url,
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
            session_cookie: auth.session_cookie.clone().filter(|c| !c.is_empty()),
        }
    }
}

/// `http://host` → `ws://host/api/push`, `https://host` → `wss://host/api/push`.
fn derive_push_url(base_url: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{ws_base}/api/push")
}

/// Stream synchronization settings (runtime view).
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub resubscribe_initial: Duration,
    pub resubscribe_max: Duration,
    pub inbox_capacity: usize,
    pub local_user_id: Option<String>,
}

impl StreamConfig {
    pub fn from_file(fc: &StreamFileConfig, auth: &AuthFileConfig) -> Self {
        let initial = Duration::from_millis(fc.resubscribe_initial_ms);
        Self {
            resubscribe_initial: initial,
            // Cap is never below the first delay
            resubscribe_max: Duration::from_millis(fc.resubscribe_max_ms).max(initial),
            inbox_capacity: fc.inbox_capacity.max(1),
            local_user_id: auth.user_id.clone().filter(|id| !id.is_empty()),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            resubscribe_initial: self.resubscribe_initial,
            resubscribe_max: self.resubscribe_max,
            inbox_capacity: self.inbox_capacity,
            local_author: self.local_user_id.as_ref().map(|id| Author {
                id: id.clone(),
                name: id.clone(),
                email: None,
            }),
            ..Default::default()
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --config-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct TeamChatConfig {
    pub config_dir: PathBuf,
}

impl TeamChatConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".team-chat"),
        };

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

        info!("Config directory: {}", config_dir.display());

        Ok(Self { config_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Load the layered file config for this directory.
    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.config_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_toml_path()))
    }
}
