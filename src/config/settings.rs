use serde::Deserialize;

use crate::broker::queue::BackpressurePolicy;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the broker engine and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// `outbound_buffer` bounds the number of frames waiting for the socket
/// writer of a single connection.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub outbound_buffer: usize,
}

/// Configuration settings for the broker engine.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_messages_per_topic: usize,
    pub max_queue_size: usize,
    pub backpressure_policy: BackpressurePolicy,
    pub heartbeat_interval_ms: u64,
    /// Topics created when the server starts.
    pub topics: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub outbound_buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_messages_per_topic: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub backpressure_policy: Option<BackpressurePolicy>,
    pub heartbeat_interval_ms: Option<u64>,
    pub topics: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                outbound_buffer: 256,
            },
            broker: BrokerSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_messages_per_topic: 100,
            max_queue_size: 1000,
            backpressure_policy: BackpressurePolicy::DropOldest,
            heartbeat_interval_ms: 30_000,
            topics: Vec::new(),
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server;
        let broker = self.broker;
        let log = self.log;

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
                outbound_buffer: server
                    .as_ref()
                    .and_then(|s| s.outbound_buffer)
                    .unwrap_or(default.server.outbound_buffer),
            },
            broker: BrokerSettings {
                max_messages_per_topic: broker
                    .as_ref()
                    .and_then(|b| b.max_messages_per_topic)
                    .unwrap_or(default.broker.max_messages_per_topic),
                max_queue_size: broker
                    .as_ref()
                    .and_then(|b| b.max_queue_size)
                    .unwrap_or(default.broker.max_queue_size),
                backpressure_policy: broker
                    .as_ref()
                    .and_then(|b| b.backpressure_policy)
                    .unwrap_or(default.broker.backpressure_policy),
                heartbeat_interval_ms: broker
                    .as_ref()
                    .and_then(|b| b.heartbeat_interval_ms)
                    .unwrap_or(default.broker.heartbeat_interval_ms),
                topics: broker
                    .and_then(|b| b.topics)
                    .unwrap_or(default.broker.topics),
            },
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}
