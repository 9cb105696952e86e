//! Configuration management for sync clients and servers.
//!
//! Both configs can be built in code or read from `POCKET_*` environment
//! variables. [`SyncConfig::load`] and [`ServerConfig::load`] read a
//! `.env` file first when one exists.

use pocket_engine::{CollectionName, NodeId};
use std::env;
use std::time::Duration;

/// Default number of changes per pull page.
pub const DEFAULT_PULL_LIMIT: usize = 100;

/// Largest pull page a server will serve.
pub const MAX_PULL_LIMIT: usize = 1000;

/// Client-side sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// This replica's node ID
    pub node_id: NodeId,
    /// Collections to request during the handshake
    pub collections: Vec<CollectionName>,
    /// How long to wait for a reply to any request
    pub request_timeout: Duration,
    /// Keepalive interval; `None` disables pings
    pub ping_interval: Option<Duration>,
    /// Consecutive unanswered pings before the session errors out
    pub max_missed_pongs: u32,
    /// Changes requested per pull page
    pub pull_page_size: usize,
    /// Changes sent per push message
    pub push_batch_size: usize,
    /// Failed deliveries before an optimistic update is rolled back
    pub max_push_attempts: u32,
    /// Token sent with the handshake
    pub auth_token: Option<String>,
}

impl SyncConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            collections: Vec::new(),
            request_timeout: Duration::from_secs(10),
            ping_interval: Some(Duration::from_secs(30)),
            max_missed_pongs: 3,
            pull_page_size: DEFAULT_PULL_LIMIT,
            push_batch_size: 100,
            max_push_attempts: 5,
            auth_token: None,
        }
    }

    pub fn with_collections<I, C>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CollectionName>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// Load `.env` if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = lookup("POCKET_NODE_ID").ok_or(ConfigError::Missing("POCKET_NODE_ID"))?;
        let mut config = Self::new(node_id);

        if let Some(collections) = lookup("POCKET_COLLECTIONS") {
            config.collections = split_list(&collections);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "POCKET_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "POCKET_PING_INTERVAL_MS")? {
            config.ping_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(n) = parse_var(&lookup, "POCKET_MAX_MISSED_PONGS")? {
            config.max_missed_pongs = n;
        }
        if let Some(n) = parse_var(&lookup, "POCKET_PULL_PAGE_SIZE")? {
            config.pull_page_size = n;
        }
        if let Some(n) = parse_var(&lookup, "POCKET_PUSH_BATCH_SIZE")? {
            config.push_batch_size = n;
        }
        if let Some(n) = parse_var(&lookup, "POCKET_MAX_PUSH_ATTEMPTS")? {
            config.max_push_attempts = n;
        }
        config.auth_token = lookup("POCKET_AUTH_TOKEN");

        Ok(config)
    }
}

impl Default for SyncConfig {
    /// Fresh replica with a random node ID.
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Node ID the server reports in handshake acks
    pub server_node_id: NodeId,
    /// Collections served; empty serves any requested collection
    pub available_collections: Vec<CollectionName>,
    /// Token clients must present; `None` allows anonymous sessions
    pub auth_token: Option<String>,
    /// Largest push batch accepted before `QUOTA_EXCEEDED`
    pub max_push_batch: usize,
    /// Sessions idle longer than this get `SESSION_EXPIRED`
    pub session_idle_timeout: Duration,
    pub pull_default_limit: usize,
    pub pull_max_limit: usize,
}

impl ServerConfig {
    pub fn new(server_node_id: impl Into<NodeId>) -> Self {
        Self {
            server_node_id: server_node_id.into(),
            available_collections: Vec::new(),
            auth_token: None,
            max_push_batch: 1000,
            session_idle_timeout: Duration::from_secs(300),
            pull_default_limit: DEFAULT_PULL_LIMIT,
            pull_max_limit: MAX_PULL_LIMIT,
        }
    }

    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = lookup("POCKET_SERVER_NODE_ID").unwrap_or_else(|| "server".to_string());
        let mut config = Self::new(node_id);

        if let Some(collections) = lookup("POCKET_SERVER_COLLECTIONS") {
            config.available_collections = split_list(&collections);
        }
        config.auth_token = lookup("POCKET_SERVER_AUTH_TOKEN");
        if let Some(n) = parse_var(&lookup, "POCKET_SERVER_MAX_PUSH_BATCH")? {
            config.max_push_batch = n;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "POCKET_SERVER_SESSION_IDLE_SECS")? {
            config.session_idle_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Clamp a requested pull limit into the served range.
    pub fn pull_limit(&self, requested: Option<usize>) -> usize {
        requested
            .map(|l| l.clamp(1, self.pull_max_limit))
            .unwrap_or(self.pull_default_limit)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::Invalid { key, value }),
        },
        None => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid {key} value: {value:?}")]
    Invalid { key: &'static str, value: String },
}
