//! Client configuration from environment variables.

use std::time::Duration;

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts before the channel is marked failed
    /// (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay_ms: 1000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay before reconnect attempt `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

/// Top-level configuration for the sync client.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Path of the firehose channel, joined onto the endpoint.
    pub firehose_path: String,
    /// Base path for conversation channels; the conversation id is appended.
    pub conversation_path: String,
    /// Base URL for mutation requests.
    pub api_base_url: String,
    /// Timeout applied to every mutation request.
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// How many push change ids the counter store remembers for de-duplication.
    pub dedup_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            firehose_path: "/ws/firehose".to_string(),
            conversation_path: "/ws/conversations".to_string(),
            api_base_url: "http://localhost:8080".to_string(),
            request_timeout: Duration::from_millis(10_000),
            reconnect: ReconnectConfig::default(),
            dedup_capacity: 4096,
        }
    }
}

impl SyncConfig {
    /// Build configuration from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `CHATSYNC_FIREHOSE_PATH` (default: "/ws/firehose")
    /// - `CHATSYNC_CONVERSATION_PATH` (default: "/ws/conversations")
    /// - `CHATSYNC_API_BASE_URL` (default: "http://localhost:8080")
    /// - `CHATSYNC_REQUEST_TIMEOUT_MS` (default: 10000)
    /// - `CHATSYNC_RECONNECT_MAX_ATTEMPTS` (default: 8)
    /// - `CHATSYNC_RECONNECT_BASE_MS` (default: 1000)
    /// - `CHATSYNC_RECONNECT_MAX_DELAY_MS` (default: 300000)
    /// - `CHATSYNC_DEDUP_CAPACITY` (default: 4096)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let reconnect = ReconnectConfig {
            max_attempts: number("CHATSYNC_RECONNECT_MAX_ATTEMPTS")
                .map(|v| v as u32)
                .unwrap_or(defaults.reconnect.max_attempts),
            initial_delay_ms: number("CHATSYNC_RECONNECT_BASE_MS")
                .unwrap_or(defaults.reconnect.initial_delay_ms),
            max_delay_ms: number("CHATSYNC_RECONNECT_MAX_DELAY_MS")
                .unwrap_or(defaults.reconnect.max_delay_ms),
            backoff_multiplier: defaults.reconnect.backoff_multiplier,
        };

        Self {
            firehose_path: lookup("CHATSYNC_FIREHOSE_PATH").unwrap_or(defaults.firehose_path),
            conversation_path: lookup("CHATSYNC_CONVERSATION_PATH")
                .unwrap_or(defaults.conversation_path),
            api_base_url: lookup("CHATSYNC_API_BASE_URL").unwrap_or(defaults.api_base_url),
            request_timeout: number("CHATSYNC_REQUEST_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            reconnect,
            dedup_capacity: number("CHATSYNC_DEDUP_CAPACITY")
                .map(|v| v as usize)
                .unwrap_or(defaults.dedup_capacity),
        }
    }
}
