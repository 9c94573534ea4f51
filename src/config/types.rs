// Configuration types module
// Defines all configuration-related data structures

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

/// Listening address, pool size and application reference
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub workers: usize,
    /// Application reference, `module:object`
    pub app: Option<String>,
    /// Listen backlog of each worker socket
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5000,
            workers: 4,
            app: None,
            backlog: 2048,
        }
    }
}

/// Supervision, health checking and restart policy
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds workers get to drain before being killed
    pub graceful_timeout: u64,
    /// Seconds without a heartbeat before a worker is killed (0 disables)
    pub worker_timeout: u64,
    pub heartbeat_interval_ms: u64,
    pub restart_backoff_ms: u64,
    pub restart_backoff_max_ms: u64,
    /// Crashes of one slot within `crash_loop_window` that abort the pool
    pub crash_loop_limit: u32,
    pub crash_loop_window: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: 30,
            worker_timeout: 30,
            heartbeat_interval_ms: 1000,
            restart_backoff_ms: 100,
            restart_backoff_max_ms: 10_000,
            crash_loop_limit: 5,
            crash_loop_window: 60,
        }
    }
}

/// Per-worker connection handling
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Idle keep-alive timeout in seconds, 0 disables keep-alive
    pub keep_alive_timeout: u64,
    /// Upper bound for the whole lifetime of a connection, in seconds
    pub connection_timeout: u64,
    pub max_connections: Option<u64>,
    pub max_body_size: u64,
    /// Requests a worker serves before it is recycled (0 disables)
    pub max_requests: u64,
    pub max_requests_jitter: u64,
    pub backlog_drain_ms: u64,
    pub server_name: String,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout: 5,
            connection_timeout: 120,
            max_connections: Some(1000),
            max_body_size: 10_485_760, // 10MB
            max_requests: 0,
            max_requests_jitter: 0,
            backlog_drain_ms: 100,
            server_name: concat!("prefork/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub access_log: bool,
    /// Access log format (combined, common, json, or custom pattern)
    pub access_log_format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            access_log: true,
            access_log_format: "combined".to_string(),
        }
    }
}
