mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, LoggingSettings, QueueSettings, ServerSettings, Settings, StorageSettings,
};


/// Loads the configuration from `config/default` and `POPQUEUE_SERVER__PORT`-style
/// environment variables, then merges it over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("POPQUEUE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let broker = partial.broker;
    let storage = partial.storage;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        broker: BrokerSettings {
            default_retry_limit: broker
                .as_ref()
                .and_then(|b| b.default_retry_limit)
                .unwrap_or(default.broker.default_retry_limit),
            default_prefetch: broker
                .as_ref()
                .and_then(|b| b.default_prefetch)
                .unwrap_or(default.broker.default_prefetch),
            heartbeat_interval_secs: broker
                .as_ref()
                .and_then(|b| b.heartbeat_interval_secs)
                .unwrap_or(default.broker.heartbeat_interval_secs),
            missed_heartbeats: broker
                .as_ref()
                .and_then(|b| b.missed_heartbeats)
                .unwrap_or(default.broker.missed_heartbeats),
            max_queue_depth: broker
                .as_ref()
                .and_then(|b| b.max_queue_depth)
                .or(default.broker.max_queue_depth),
        },
        storage: StorageSettings {
            path: storage
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.storage.path),
            retry_attempts: storage
                .as_ref()
                .and_then(|s| s.retry_attempts)
                .unwrap_or(default.storage.retry_attempts),
            retry_backoff_ms: storage
                .as_ref()
                .and_then(|s| s.retry_backoff_ms)
                .unwrap_or(default.storage.retry_backoff_ms),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
        queues: partial.queues.unwrap_or(default.queues),
    }
}
