//! CLI for FanBus
//!
//! Subcommands:
//! - `server`: run the WebSocket server
//! - `client`: subscribe to a topic, publish one message and print what arrives
//!   (useful for smoke tests)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fanbus::broker::Broker;
use fanbus::config::{Settings, load_config};
use fanbus::transport::connection::ConnectionManager;
use fanbus::transport::websocket::start_websocket_server;
use fanbus::utils::logging;
use tracing::{error, info};

/// How long shutdown waits for sockets to flush their close frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "fanbus")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Subscribe to a topic, publish once and print every frame received
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Topic to subscribe to
        #[arg(long, default_value = "chat")]
        topic: String,
        /// Identity to subscribe as
        #[arg(long, default_value = "fanbus-cli")]
        client_id: String,
        /// Number of recent messages to replay on subscribe
        #[arg(long, default_value_t = 0)]
        last_n: usize,
        /// Text published once after subscribing
        #[arg(long, default_value = "Hello from fanbus")]
        text: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            let Some(config) = load_settings() else {
                std::process::exit(1);
            };
            if let Err(e) = run_server(config).await {
                error!("Server failed: {}", e);
            }
        }
        Command::Client {
            url,
            topic,
            client_id,
            last_n,
            text,
        } => {
            logging::init("info");
            if let Err(e) = run_client(&url, &topic, &client_id, last_n, &text).await {
                error!("Client failed: {}", e);
            }
        }
    }
}

/// Loads settings and installs logging at the configured level. If loading
/// fails, logging falls back to `info` so the failure is still reported.
fn load_settings() -> Option<Settings> {
    match load_config() {
        Ok(config) => {
            logging::init(&config.log.level);
            Some(config)
        }
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            None
        }
    }
}

async fn run_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Arc::new(Broker::new(config.broker.clone()));
    for topic in &config.broker.topics {
        broker.create_topic(topic);
    }

    let manager = ConnectionManager::start(broker);

    tokio::select! {
        res = start_websocket_server(addr, manager.clone(), config.server.clone()) => {
            match res {
                Ok(()) => error!("WebSocket server exited unexpectedly."),
                Err(e) => error!("WebSocket server failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    manager.shutdown();
    manager.wait_for_connection_tasks(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn run_client(
    url: &str,
    topic: &str,
    client_id: &str,
    last_n: usize,
    text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url).await?;

    let subscribe = json!({
        "type": "subscribe",
        "topic": topic,
        "client_id": client_id,
        "last_n": last_n,
    });
    ws_stream
        .send(WsMessage::Text(subscribe.to_string().into()))
        .await?;

    let publish = json!({
        "type": "publish",
        "topic": topic,
        "client_id": client_id,
        "message": { "id": uuid::Uuid::new_v4().to_string(), "payload": { "text": text } },
    });
    ws_stream
        .send(WsMessage::Text(publish.to_string().into()))
        .await?;

    while let Some(msg) = ws_stream.next().await {
        match msg? {
            WsMessage::Text(text) => println!("{text}"),
            WsMessage::Close(frame) => {
                info!("Server closed the connection: {:?}", frame);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
