use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Which backend a blob store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Fs,
    S3,
    Memory,
}

impl Default for StoreType {
    fn default() -> Self {
        StoreType::Fs
    }
}

/// Settings shared by both named blob stores.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(rename = "type", default)]
    pub store_type: StoreType,
    /// Root directory for the `fs` backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Bucket for the `s3` backend.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override for S3-compatible object stores.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Key prefix inside the bucket.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// The proxy store carries the dimension policy on top of the store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyStoreConfig {
    #[serde(flatten)]
    pub store: StoreConfig,
    #[serde(default = "default_max_dim")]
    pub max_image_width: u32,
    #[serde(default = "default_max_dim")]
    pub max_image_height: u32,
    #[serde(default = "default_max_custom_dim")]
    pub max_custom_image_width: u32,
    #[serde(default = "default_max_custom_dim")]
    pub max_custom_image_height: u32,
}

impl Default for ProxyStoreConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            max_image_width: default_max_dim(),
            max_image_height: default_max_dim(),
            max_custom_image_width: default_max_custom_dim(),
            max_custom_image_height: default_max_custom_dim(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadLimits {
    /// Rate limit window in milliseconds.
    #[serde(default = "default_limit_duration")]
    pub duration: u64,
    /// Uploads allowed per window per account.
    #[serde(default = "default_limit_max")]
    pub max: u32,
    /// Minimum normalized reputation required to upload.
    #[serde(default = "default_reputation")]
    pub reputation: f64,
    /// Account trusted to co-sign OAuth tokens.
    #[serde(default)]
    pub app_account: Option<String>,
    /// WIF posting key of the broadcaster; its public key validates tokens.
    #[serde(default)]
    pub app_posting_wif: Option<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            duration: default_limit_duration(),
            max: default_limit_max(),
            reputation: default_reputation(),
            app_account: None,
            app_posting_wif: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistConfig {
    /// Refresh interval in milliseconds.
    #[serde(default = "default_blacklist_ttl")]
    pub cache_ttl: u64,
    #[serde(default)]
    pub images_url: Option<String>,
    #[serde(default)]
    pub accounts_url: Option<String>,
    /// Local seed files, each a JSON list of entries.
    #[serde(default)]
    pub images_seed: Option<PathBuf>,
    #[serde(default)]
    pub accounts_seed: Option<PathBuf>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_blacklist_ttl(),
            images_url: None,
            accounts_url: None,
            images_seed: None,
            accounts_seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accepted for compatibility; the process is single-instance.
    #[serde(default)]
    pub num_workers: u32,
    /// Public base URL of this service, no trailing slash.
    #[serde(default = "default_service_url")]
    pub service_url: String,
    #[serde(default = "default_rpc_nodes")]
    pub rpc_node: Vec<String>,
    /// Upper bound for uploads and for stored proxy originals, in bytes.
    #[serde(default = "default_max_image_size")]
    pub max_image_size: u64,
    #[serde(default = "default_avatar_url")]
    pub default_avatar: String,
    #[serde(default = "default_cover_url")]
    pub default_cover: String,
    /// Rate limiter KV; the in-process limiter is used when unset.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub cloudflare_token: Option<String>,
    #[serde(default)]
    pub cloudflare_zone: Option<String>,
    #[serde(default)]
    pub upload_store: StoreConfig,
    #[serde(default)]
    pub proxy_store: ProxyStoreConfig,
    #[serde(default)]
    pub upload_limits: UploadLimits,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

impl Default for Config {
    fn default() -> Self {
        // Round-trip through serde so field defaults apply uniformly.
        serde_json::from_value(serde_json::json!({})).expect("empty config deserializes")
    }
}

fn default_port() -> u16 {
    8800
}
fn default_service_url() -> String {
    "http://localhost:8800".into()
}
fn default_rpc_nodes() -> Vec<String> {
    vec!["https://api.hive.blog".into(), "https://api.deathwing.me".into()]
}
fn default_max_image_size() -> u64 {
    30_000_000
}
fn default_max_dim() -> u32 {
    1280
}
fn default_max_custom_dim() -> u32 {
    8000
}
fn default_limit_duration() -> u64 {
    3_600_000
}
fn default_limit_max() -> u32 {
    20
}
fn default_reputation() -> f64 {
    10.0
}
fn default_blacklist_ttl() -> u64 {
    300_000
}
fn default_avatar_url() -> String {
    "https://images.hive.blog/u/null/avatar".into()
}
fn default_cover_url() -> String {
    "https://images.hive.blog/u/null/cover".into()
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("service_url cannot be empty")]
    EmptyServiceUrl,
    #[error("max_image_size must be > 0")]
    InvalidMaxImageSize,
    #[error("at least one rpc_node is required")]
    NoRpcNodes,
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

impl Config {
    /// Layer an optional TOML file under `IMAGEHOSTER_*` environment
    /// variables, e.g. `IMAGEHOSTER_PROXY_STORE__TYPE=s3`.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var("IMAGEHOSTER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        let cfg: Config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("IMAGEHOSTER").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_url.trim().is_empty() {
            return Err(ConfigError::EmptyServiceUrl);
        }
        if self.max_image_size == 0 {
            return Err(ConfigError::InvalidMaxImageSize);
        }
        if self.rpc_node.is_empty() {
            return Err(ConfigError::NoRpcNodes);
        }
        Ok(())
    }

    /// `service_url` without any trailing slash.
    pub fn base_url(&self) -> &str {
        self.service_url.trim_end_matches('/')
    }
}
