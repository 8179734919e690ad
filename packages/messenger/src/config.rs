use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [websocket]
//                    ping_interval_secs = 15
//
//   env var:         MESSENGER_WEBSOCKET__PING_INTERVAL_SECS=15
//
// Double underscore nests into a section; single underscores stay part of the
// field name.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub database: DatabaseFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
}

/// Listener settings (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database settings (`[database]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseFileConfig {
    /// Full sqlx URL. Defaults to `messenger.db` inside the data directory.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Live connection tunables (`[websocket]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Must exceed `ping_interval_secs` so a healthy peer's pong arrives in time.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
            write_timeout_secs: default_write_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

/// Message limits (`[messages]`). Also served to clients by `GET /config`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesConfig {
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: i64,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            max_attachments: default_max_attachments(),
            page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

/// S3-compatible object storage for attachments (`[uploads]`).
///
/// Credentials usually come from the environment:
/// `MESSENGER_UPLOADS__ACCESS_KEY`, `MESSENGER_UPLOADS__SECRET_KEY`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadsConfig {
    /// Base URL of the storage API, e.g. `https://s3.eu-central-1.amazonaws.com`
    #[serde(default = "default_uploads_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_uploads_region")]
    pub region: String,
    #[serde(default = "default_uploads_bucket")]
    pub bucket: String,
    /// `{endpoint}/{bucket}/{key}` instead of `{bucket}.{endpoint host}/{key}`
    #[serde(default = "default_true")]
    pub path_style: bool,
    #[serde(default)]
    pub access_key: String,
    /// Never rendered by `messenger config`
    #[serde(default, skip_serializing)]
    pub secret_key: String,
    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,
    /// Confirmed objects larger than this are rejected
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: i64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_uploads_endpoint(),
            region: default_uploads_region(),
            bucket: default_uploads_bucket(),
            path_style: true,
            access_key: String::new(),
            secret_key: String::new(),
            presign_ttl_secs: default_presign_ttl_secs(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8082
}
fn default_max_connections() -> u32 {
    5
}
fn default_send_queue_capacity() -> usize {
    chat_hub::DEFAULT_SEND_QUEUE_CAPACITY
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_max_attachments() -> usize {
    10
}
fn default_page_size() -> i64 {
    50
}
fn default_max_page_size() -> i64 {
    200
}
fn default_uploads_endpoint() -> String {
    "http://127.0.0.1:9000".to_string()
}
fn default_uploads_region() -> String {
    "us-east-1".to_string()
}
fn default_uploads_bucket() -> String {
    "messenger".to_string()
}
fn default_true() -> bool {
    true
}
fn default_presign_ttl_secs() -> u64 {
    15 * 60
}
fn default_max_upload_bytes() -> i64 {
    50 * 1024 * 1024
}

/// Build a figment that layers: defaults → config.toml → MESSENGER_* env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("MESSENGER_").split("__"))
}

// =============================================================================
// Runtime views
// =============================================================================

/// Live connection settings with durations resolved.
#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    pub send_queue_capacity: usize,
    pub read_timeout: Duration,
    pub pump: chat_hub::WritePumpConfig,
}

impl WebSocketConfig {
    pub fn from_file(fc: &WebSocketFileConfig) -> Self {
        Self {
            send_queue_capacity: fc.send_queue_capacity.max(1),
            read_timeout: Duration::from_secs(fc.read_timeout_secs.max(1)),
            pump: chat_hub::WritePumpConfig {
                write_timeout: Duration::from_secs(fc.write_timeout_secs.max(1)),
                ping_interval: Duration::from_secs(fc.ping_interval_secs.max(1)),
            },
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::from_file(&WebSocketFileConfig::default())
    }
}

// =============================================================================
// Directory layout (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct MessengerConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl MessengerConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".messenger"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("messenger.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    /// The configured database URL, or the default file in the data directory.
    pub fn db_url(&self, database: &DatabaseFileConfig) -> String {
        database
            .url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}?mode=rwc", self.db_path.display()))
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
