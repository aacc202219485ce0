use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub queues: Vec<QueueSettings>,
}

/// Configuration settings for the server.
///
/// Defines the host and port the websocket server will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the broker.
///
/// Retry and prefetch values here are defaults; a queue declaration may
/// override the retry limit and depth bound.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub default_retry_limit: u32,
    pub default_prefetch: u32,
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats: u32,
    pub max_queue_depth: Option<usize>,
}

impl BrokerSettings {
    /// Time after which a silent consumer session is considered dead.
    pub fn session_timeout_ms(&self) -> i64 {
        let interval_ms = self.heartbeat_interval_secs.saturating_mul(1000);
        i64::try_from(interval_ms.saturating_mul(u64::from(self.missed_heartbeats)))
            .unwrap_or(i64::MAX)
    }
}

/// Where and how the durable message log is kept.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// A queue declared when the server starts.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueSettings {
    pub name: String,
    pub durable: Option<bool>,
    pub retry_limit: Option<u32>,
    pub max_depth: Option<usize>,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub queues: Option<Vec<QueueSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub default_retry_limit: Option<u32>,
    pub default_prefetch: Option<u32>,
    pub heartbeat_interval_secs: Option<u64>,
    pub missed_heartbeats: Option<u32>,
    pub max_queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_retry_limit: 3,
            default_prefetch: 1,
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            max_queue_depth: None,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: "popqueue_db".to_string(),
            retry_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            queues: Vec::new(),
        }
    }
}
