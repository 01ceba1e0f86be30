//! Agent configuration

use std::time::Duration;

use serde::Deserialize;

/// Environment variable holding the path of the optional YAML config file
pub const CONFIG_PATH_ENV: &str = "NODE_AGENT_CONFIG";

/// What to do with terminal-size events that arrive before the exec session has started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarlyResize {
    /// Hold early events and apply them in order once the session is running
    Defer,
    /// Discard events received before the session is running
    Drop,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Docker socket path
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,

    /// Number of docker clients kept in the pool
    #[serde(default = "default_docker_client_pool_size")]
    pub docker_client_pool_size: usize,

    /// Container index refresh interval in seconds
    #[serde(default = "default_container_refresh_interval")]
    pub container_refresh_interval: u64,

    /// Streaming connection idle timeout in seconds (0 disables it)
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout: u64,

    /// Time allowed for a SPDY client to open all of its streams, in seconds
    #[serde(default = "default_stream_creation_timeout")]
    pub stream_creation_timeout: u64,

    /// Remote command protocols accepted on the SPDY path, most preferred first
    #[serde(default = "default_supported_protocols")]
    pub supported_protocols: Vec<String>,

    /// Lifetime of a prepared request token in seconds
    #[serde(default = "default_request_cache_ttl")]
    pub request_cache_ttl: u64,

    /// Maximum number of prepared requests held at once
    #[serde(default = "default_request_cache_max_in_flight")]
    pub request_cache_max_in_flight: usize,

    /// Length of generated request tokens
    #[serde(default = "default_request_cache_token_len")]
    pub request_cache_token_len: usize,

    /// How many times an exec is inspected before giving up on its completion
    #[serde(default = "default_exec_poll_attempts")]
    pub exec_poll_attempts: u32,

    /// Interval between exec inspections in milliseconds
    #[serde(default = "default_exec_poll_interval")]
    pub exec_poll_interval: u64,

    /// Handling of resize events received before the exec session starts
    #[serde(default = "default_early_resize")]
    pub early_resize: EarlyResize,

    /// Whether requests must carry a valid access token
    #[serde(default = "default_access_token_enabled")]
    pub access_token_enabled: bool,

    /// AES-128 key used to decrypt access tokens (16 bytes)
    #[serde(default = "default_access_token_key")]
    pub access_token_key: String,

    /// User name an access token must identify
    #[serde(default = "default_access_token_user")]
    pub access_token_user: String,

    /// Read limit for messages on the legacy ssh websocket
    #[serde(default = "default_legacy_max_message_size")]
    pub legacy_max_message_size: usize,

    /// Log output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8085
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_docker_client_pool_size() -> usize {
    10
}

fn default_container_refresh_interval() -> u64 {
    15
}

fn default_stream_idle_timeout() -> u64 {
    15 * 60
}

fn default_stream_creation_timeout() -> u64 {
    15
}

fn default_supported_protocols() -> Vec<String> {
    crate::service::remotecommand::SUPPORTED_STREAMING_PROTOCOLS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_request_cache_ttl() -> u64 {
    60
}

fn default_request_cache_max_in_flight() -> usize {
    1000
}

fn default_request_cache_token_len() -> usize {
    8
}

fn default_exec_poll_attempts() -> u32 {
    5
}

fn default_exec_poll_interval() -> u64 {
    2000
}

fn default_early_resize() -> EarlyResize {
    EarlyResize::Defer
}

fn default_access_token_enabled() -> bool {
    true
}

fn default_access_token_key() -> String {
    "doc-opserver8085".to_string()
}

fn default_access_token_user() -> String {
    "dockin-opagent".to_string()
}

fn default_legacy_max_message_size() -> usize {
    512
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from the optional YAML file, then environment variables
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config/agent.yaml".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Yaml).required(false))
            .build()?;
        let mut config: Config = settings.try_deserialize()?;

        // Override with environment variables
        if let Ok(val) = std::env::var("NODE_AGENT_HTTP_HOST") {
            config.http_host = val;
        }
        if let Ok(val) = std::env::var("NODE_AGENT_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http_port = port;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_DOCKER_SOCKET") {
            config.docker_socket = val;
        }
        if let Ok(val) = std::env::var("NODE_AGENT_DOCKER_CLIENT_POOL_SIZE") {
            if let Ok(size) = val.parse() {
                config.docker_client_pool_size = size;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_CONTAINER_REFRESH_INTERVAL") {
            if let Ok(secs) = val.parse() {
                config.container_refresh_interval = secs;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_STREAM_IDLE_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                config.stream_idle_timeout = secs;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_STREAM_CREATION_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                config.stream_creation_timeout = secs;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_SUPPORTED_PROTOCOLS") {
            // Comma-separated, most preferred first
            config.supported_protocols = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("NODE_AGENT_REQUEST_CACHE_TTL") {
            if let Ok(secs) = val.parse() {
                config.request_cache_ttl = secs;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_REQUEST_CACHE_MAX_IN_FLIGHT") {
            if let Ok(max) = val.parse() {
                config.request_cache_max_in_flight = max;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_EXEC_POLL_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.exec_poll_attempts = attempts;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_EXEC_POLL_INTERVAL") {
            if let Ok(ms) = val.parse() {
                config.exec_poll_interval = ms;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_EARLY_RESIZE") {
            match val.to_lowercase().as_str() {
                "defer" => config.early_resize = EarlyResize::Defer,
                "drop" => config.early_resize = EarlyResize::Drop,
                _ => {}
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_ACCESS_TOKEN_ENABLED") {
            if let Ok(enabled) = val.parse() {
                config.access_token_enabled = enabled;
            }
        }
        if let Ok(val) = std::env::var("NODE_AGENT_ACCESS_TOKEN_KEY") {
            config.access_token_key = val;
        }
        if let Ok(val) = std::env::var("NODE_AGENT_ACCESS_TOKEN_USER") {
            config.access_token_user = val;
        }
        if let Ok(val) = std::env::var("NODE_AGENT_LOG_FORMAT") {
            config.log_format = val;
        }

        Ok(config)
    }

    /// Idle timeout for streaming connections, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.stream_idle_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_creation_timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.request_cache_ttl)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.exec_poll_interval)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.container_refresh_interval.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            docker_socket: default_docker_socket(),
            docker_client_pool_size: default_docker_client_pool_size(),
            container_refresh_interval: default_container_refresh_interval(),
            stream_idle_timeout: default_stream_idle_timeout(),
            stream_creation_timeout: default_stream_creation_timeout(),
            supported_protocols: default_supported_protocols(),
            request_cache_ttl: default_request_cache_ttl(),
            request_cache_max_in_flight: default_request_cache_max_in_flight(),
            request_cache_token_len: default_request_cache_token_len(),
            exec_poll_attempts: default_exec_poll_attempts(),
            exec_poll_interval: default_exec_poll_interval(),
            early_resize: default_early_resize(),
            access_token_enabled: default_access_token_enabled(),
            access_token_key: default_access_token_key(),
            access_token_user: default_access_token_user(),
            legacy_max_message_size: default_legacy_max_message_size(),
            log_format: default_log_format(),
        }
    }
}
