//! Configuration structures and loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main control-plane configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// REST API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// Key-value store configuration
    #[serde(default)]
    pub kv: KvConfiguration,

    /// Defaults for docker endpoint clients
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Image registries the reconciler may query
    #[serde(default)]
    pub registries: Vec<RegistryConfiguration>,

    /// Rolling-update and tag-reconciliation configuration
    #[serde(default)]
    pub update: UpdateConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            api: ApiConfiguration::default(),
            kv: KvConfiguration::default(),
            docker: DockerConfiguration::default(),
            registries: Vec::new(),
            update: UpdateConfiguration::default(),
        }
    }
}

/// REST API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8761
}

/// Key-value store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KvConfiguration {
    /// Backend: "redis" or "memory"
    #[serde(default = "default_kv_backend")]
    pub backend: String,

    /// Backend URL (redis only)
    #[serde(default = "default_kv_url")]
    pub url: String,

    /// Prefix under which all control-plane keys live
    #[serde(default = "default_kv_prefix")]
    pub prefix: String,
}

impl Default for KvConfiguration {
    fn default() -> Self {
        Self {
            backend: default_kv_backend(),
            url: default_kv_url(),
            prefix: default_kv_prefix(),
        }
    }
}

fn default_kv_backend() -> String {
    "memory".into()
}

fn default_kv_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_kv_prefix() -> String {
    "flotilla".into()
}

/// Defaults for docker endpoint clients; individual clusters may override
/// the timeout and cache TTL in their own configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Ceiling for slow (mutating) daemon calls, in seconds
    #[serde(default = "default_docker_timeout")]
    pub docker_timeout_s: u64,

    /// TTL of the cached endpoint info, in seconds
    #[serde(default = "default_cache_after_write")]
    pub cache_after_write_s: u64,

    /// Interval of the full container reconciliation sweep, in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_s: u64,

    /// Delay before re-subscribing a dropped daemon event stream, in seconds
    #[serde(default = "default_event_retry")]
    pub event_retry_s: u64,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            docker_timeout_s: default_docker_timeout(),
            cache_after_write_s: default_cache_after_write(),
            reconcile_interval_s: default_reconcile_interval(),
            event_retry_s: default_event_retry(),
        }
    }
}

fn default_docker_timeout() -> u64 {
    60
}

fn default_cache_after_write() -> u64 {
    30
}

fn default_reconcile_interval() -> u64 {
    120
}

fn default_event_retry() -> u64 {
    5
}

/// An image registry the tag reconciler may query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfiguration {
    /// Registry base URL, e.g. "https://registry-1.docker.io"
    pub url: String,

    /// Optional basic-auth credentials
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Rolling-update and tag-reconciliation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfiguration {
    /// Tag reconciler interval, in seconds
    #[serde(default = "default_update_interval")]
    pub interval_s: u64,

    /// Tags the version comparator treats as newer than any version
    #[serde(default = "default_latest_aliases")]
    pub latest_aliases: Vec<String>,

    /// Known version suffixes in ascending order, e.g. ["rc", "GA"]
    #[serde(default)]
    pub suffixes: Vec<String>,

    /// Whether a bare version outranks any suffixed one
    #[serde(default = "default_true")]
    pub empty_suffix_last: bool,

    /// Images the reconciler watches
    #[serde(default)]
    pub images: Vec<WatchedImage>,
}

impl Default for UpdateConfiguration {
    fn default() -> Self {
        Self {
            interval_s: default_update_interval(),
            latest_aliases: default_latest_aliases(),
            suffixes: Vec::new(),
            empty_suffix_last: true,
            images: Vec::new(),
        }
    }
}

fn default_update_interval() -> u64 {
    300
}

fn default_latest_aliases() -> Vec<String> {
    vec!["latest".into()]
}

fn default_true() -> bool {
    true
}

/// One image pattern watched by the tag reconciler
#[derive(Debug, Clone, Deserialize)]
pub struct WatchedImage {
    /// Repository to poll for tags, e.g. "library/nginx"
    pub repository: String,

    /// Registry URL; must match one of `[registries]`. Empty means the
    /// first configured registry.
    #[serde(default)]
    pub registry: Option<String>,

    /// Cluster whose containers are updated
    pub cluster: String,

    /// Glob matched against running containers' image references
    #[serde(default = "default_image_pattern")]
    pub pattern: String,

    /// Update strategy job type to emit
    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default = "default_true")]
    pub health_check_enabled: bool,

    #[serde(default)]
    pub rollback_enabled: bool,

    /// Grace period before a stop escalates to kill, in seconds
    #[serde(default = "default_time_before_kill")]
    pub time_before_kill_s: u64,
}

fn default_image_pattern() -> String {
    "*".into()
}

fn default_strategy() -> String {
    "job.updateContainers.stopThenStartEach".into()
}

fn default_time_before_kill() -> u64 {
    10
}
