//! Proxy configuration
//!
//! Loaded from the YAML file named by `SENTINEL_CONFIG`; every field has a
//! default so an empty file (or no file at all) is a valid configuration.
//! `LISTEN` overrides the listen address either way.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::http::response::{Response, StatusCode};
use crate::proxy::forwarder::ForwarderSettings;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub balancer: BalancerConfig,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Worker threads, each running its own event loop
    pub workers: usize,
    /// How often workers close expired idle backend connections
    pub purge_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            purge_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub max_queued_waiters: usize,
    pub max_attempts: usize,
    pub queue_timeout_ms: u64,
    pub error_threshold: u32,
    pub error_window_secs: u64,
    pub cooldown_secs: u64,
    /// Cookie carrying the routing token as its suffix
    pub session_cookie: String,
    pub rewrite_host_header: bool,
    pub no_backend_response: FixedResponseConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_queued_waiters: 64,
            max_attempts: 3,
            queue_timeout_ms: 10_000,
            error_threshold: 3,
            error_window_secs: 10,
            cooldown_secs: 60,
            session_cookie: "JSESSIONID".to_string(),
            rewrite_host_header: false,
            no_backend_response: FixedResponseConfig::default(),
        }
    }
}

impl BalancerConfig {
    pub fn forwarder_settings(&self) -> ForwarderSettings {
        ForwarderSettings {
            max_attempts: self.max_attempts,
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            no_backend_response: self.no_backend_response.to_response(),
            rewrite_host: self.rewrite_host_header,
        }
    }
}

/// Response sent when no backend could take a request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FixedResponseConfig {
    pub status: u16,
    pub body: String,
}

impl Default for FixedResponseConfig {
    fn default() -> Self {
        Self {
            status: 503,
            body: "503 Service Unavailable\r\n\r\nNo backend servers are available.".to_string(),
        }
    }
}

impl FixedResponseConfig {
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        Response::plain(status, self.body.as_bytes().to_vec())
    }
}

/// Configuration for a single backend server
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend URL, e.g. "http://localhost:3000"
    pub url: String,
    /// Optional backend name for logging
    #[serde(default)]
    pub name: Option<String>,
    /// Routing token matched against the session cookie suffix
    #[serde(default)]
    pub route: String,
    #[serde(default = "default_max_connections")]
    pub max_connections_per_thread: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Backend speaks a multiplexed protocol
    #[serde(default)]
    pub http2: bool,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
}

fn default_max_connections() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_max_concurrent_streams() -> usize {
    100
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            route: String::new(),
            max_connections_per_thread: default_max_connections(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            http2: false,
            max_concurrent_streams: default_max_concurrent_streams(),
        }
    }
}

impl Config {
    /// Loads the configuration file named by `SENTINEL_CONFIG`, if any, and
    /// applies the `LISTEN` override.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("SENTINEL_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path))?;
                Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path))?
            }
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            config.server.listen_addr = listen_addr;
        }

        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw).context("Failed to parse YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.server.workers > 0, "server.workers must be at least 1");
        anyhow::ensure!(
            self.balancer.max_attempts > 0,
            "balancer.max_attempts must be at least 1"
        );
        for backend in &self.backends {
            anyhow::ensure!(
                backend.max_connections_per_thread > 0,
                "backend {} needs at least one connection per thread",
                backend.url
            );
        }
        Ok(())
    }
}
