use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::client::{CLOSE_NORMAL, Connection, WsConnection};
use crate::config::ServerSettings;
use crate::transport::connection::ConnectionManager;

/// Binds `addr` and serves WebSocket connections until accepting fails.
pub async fn start_websocket_server(
    addr: String,
    manager: Arc<ConnectionManager>,
    settings: ServerSettings,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    serve(listener, manager, settings.outbound_buffer).await;
    Ok(())
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, manager: Arc<ConnectionManager>, outbound_buffer: usize) {
    while let Ok((stream, peer)) = listener.accept().await {
        debug!(%peer, "tcp connection accepted");
        let task = tokio::spawn(handle_connection(stream, manager.clone(), outbound_buffer));
        manager.track_task(task);
    }
    warn!("accept loop stopped");
}

async fn handle_connection(stream: TcpStream, manager: Arc<ConnectionManager>, outbound_buffer: usize) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {}", e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Bounded so a slow reader shows up as "not ready" to the broker
    let (tx, mut rx) = mpsc::channel::<WsMessage>(outbound_buffer.max(1));
    let connection = Arc::new(WsConnection::new(tx));
    let connection_id = manager.open(connection.clone());

    // broker -> client
    let writer = {
        let connection = connection.clone();
        let connection_id = connection_id.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            let closed = connection.closed();
            tokio::pin!(closed);
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = ws_sender.send(msg).await {
                                debug!(%connection_id, "failed to send frame: {}", e);
                                break;
                            }
                            // room again for anything queued while the channel was full
                            if connection.take_backlogged() {
                                manager.flush_connection(&connection_id);
                            }
                        }
                        None => break,
                    },
                    _ = &mut closed => {
                        let frame = connection.take_close_frame();
                        let _ = ws_sender.send(WsMessage::Close(frame)).await;
                        break;
                    }
                }
            }
            let _ = ws_sender.close().await;
            debug!(%connection_id, "send loop closed");
        })
    };

    // client -> broker
    let closed = connection.closed();
    tokio::pin!(closed);
    loop {
        tokio::select! {
            _ = &mut closed => break,
            frame = ws_receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    manager.handle_message(&connection_id, text.as_str());
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%connection_id, "read error: {}", e);
                    break;
                }
            }
        }
    }

    connection.close(CLOSE_NORMAL, "connection closed");
    manager.close_connection(&connection_id);
    let _ = writer.await;
    info!(%connection_id, "disconnected");
}
