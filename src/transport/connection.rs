//! Connection manager
//!
//! Drives the per-connection protocol: every inbound text frame is parsed,
//! checked structurally, handed to the broker and answered with exactly one
//! `ack` or `error` (or `pong`). Events for subscribers flow through the
//! broker independently of these replies.
//!
//! Each connection has two identities. The server-generated `ConnectionId`
//! keys the connection record; the client-declared identity is bound by the
//! first frame that carries a `client_id` and is used for every pub/sub
//! operation afterwards. Later frames cannot rebind it, and an identity
//! bound to one live connection cannot be bound by another.
//!
//! The manager also owns the heartbeat task, tracks the per-socket tasks and
//! performs graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::broker::engine::ShutdownReport;
use crate::broker::message::now_millis;
use crate::broker::topic::ClientId;
use crate::client::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, ConnectionHandle, ConnectionId, ConnectionState,
};
use crate::transport::heartbeat::HeartbeatScheduler;
use crate::transport::message::{AckStatus, ClientMessage, Request, ServerMessage};
use crate::utils::error::{BrokerError, Result};

#[derive(Debug)]
struct ConnectionRecord {
    handle: ConnectionHandle,
    client_id: Option<ClientId>,
    last_seen: i64,
}

/// Read-only view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: Option<ClientId>,
    pub state: ConnectionState,
    pub topics: Vec<String>,
    pub last_seen: i64,
}

#[derive(Debug)]
pub struct ConnectionManager {
    broker: Arc<Broker>,
    connections: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
    heartbeat: Mutex<Option<HeartbeatScheduler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    /// A manager without a heartbeat task.
    pub fn new(broker: Arc<Broker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            connections: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// A manager with its heartbeat running at the broker's configured
    /// interval. Must be called within a tokio runtime.
    pub fn start(broker: Arc<Broker>) -> Arc<Self> {
        let interval = Duration::from_millis(broker.settings().heartbeat_interval_ms);
        let manager = Self::new(broker);
        manager.start_heartbeat(interval);
        manager
    }

    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::downgrade(self);
        let scheduler = HeartbeatScheduler::start(interval, move || match manager.upgrade() {
            Some(manager) => {
                manager.heartbeat();
                true
            }
            None => false,
        });
        if let Some(previous) = self.heartbeat_slot().replace(scheduler) {
            previous.stop();
        }
        debug!(interval_ms = interval.as_millis() as u64, "heartbeat started");
    }

    pub fn stop_heartbeat(&self) {
        if let Some(scheduler) = self.heartbeat_slot().take() {
            scheduler.stop();
            debug!("heartbeat stopped");
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionRecord>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn heartbeat_slot(&self) -> MutexGuard<'_, Option<HeartbeatScheduler>> {
        self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new connection, moves it to `Open` and greets it. After
    /// shutdown the connection is closed straight away instead.
    pub fn open(&self, handle: ConnectionHandle) -> ConnectionId {
        let connection_id = handle.id().clone();
        if self.shut_down.load(Ordering::Acquire) {
            handle.close(CLOSE_GOING_AWAY, "server shutting down");
            return connection_id;
        }
        handle.set_state(ConnectionState::Open);
        self.connections().insert(
            connection_id.clone(),
            ConnectionRecord {
                handle: handle.clone(),
                client_id: None,
                last_seen: now_millis(),
            },
        );

        send_reply(
            &handle,
            &ServerMessage::info("connected", Some(connection_id.to_string())),
        );
        info!(%connection_id, "connection opened");
        connection_id
    }

    /// Processes one inbound text frame and returns the reply that was sent.
    /// Frames for unknown connections, or connections that are not `Open`,
    /// are ignored.
    pub fn handle_message(&self, connection_id: &ConnectionId, text: &str) -> Option<ServerMessage> {
        let handle = {
            let connections = self.connections();
            let record = connections.get(connection_id)?;
            if record.handle.state() != ConnectionState::Open {
                return None;
            }
            record.handle.clone()
        };

        let mut request_id = None;
        let outcome = ClientMessage::parse(text).and_then(|frame| {
            request_id = frame.request_id.clone();
            let bound = self.bind_identity(connection_id, frame.client_id.as_deref())?;
            let request = frame.into_request(bound.as_deref())?;
            self.dispatch(connection_id, &handle, request, request_id.clone())
        });

        let reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                match &err {
                    BrokerError::Internal(detail) => {
                        error!(%connection_id, %detail, "request failed")
                    }
                    other => debug!(%connection_id, error = %other, "request rejected"),
                }
                ServerMessage::error(request_id, &err)
            }
        };

        send_reply(&handle, &reply);
        Some(reply)
    }

    /// Binds `declared` if the connection has no client identity yet and
    /// returns whatever identity is bound afterwards. Fails if another live
    /// connection already holds `declared`.
    fn bind_identity(
        &self,
        connection_id: &ConnectionId,
        declared: Option<&str>,
    ) -> Result<Option<ClientId>> {
        let mut connections = self.connections();
        let unbound = connections
            .get(connection_id)
            .is_some_and(|record| record.client_id.is_none());

        if let Some(declared) = declared.filter(|id| unbound && !id.is_empty()) {
            let taken = connections.iter().any(|(id, record)| {
                id != connection_id && record.client_id.as_deref() == Some(declared)
            });
            if taken {
                return Err(BrokerError::IdentityInUse(declared.to_string()));
            }
            if let Some(record) = connections.get_mut(connection_id) {
                record.client_id = Some(declared.to_string());
                debug!(%connection_id, client_id = declared, "client identity bound");
            }
        }

        Ok(connections
            .get(connection_id)
            .and_then(|record| record.client_id.clone()))
    }

    fn dispatch(
        &self,
        connection_id: &ConnectionId,
        handle: &ConnectionHandle,
        request: Request,
        request_id: Option<Value>,
    ) -> Result<ServerMessage> {
        match request {
            Request::Subscribe {
                topic,
                client_id,
                last_n,
            } => {
                self.broker
                    .subscribe(&topic, &client_id, handle.clone(), last_n)?;
                Ok(ServerMessage::ack(
                    request_id,
                    &topic,
                    AckStatus::Subscribed,
                    None,
                ))
            }
            Request::Unsubscribe { topic, client_id } => {
                if !self.broker.unsubscribe(&topic, &client_id)? {
                    return Err(BrokerError::NotSubscribed { topic, client_id });
                }
                Ok(ServerMessage::ack(
                    request_id,
                    &topic,
                    AckStatus::Unsubscribed,
                    None,
                ))
            }
            Request::Publish { topic, message, .. } => {
                let report = self.broker.publish(&topic, message)?;
                Ok(ServerMessage::ack(
                    request_id,
                    &topic,
                    AckStatus::Published,
                    Some(report.subscribers),
                ))
            }
            Request::Ping => {
                self.with_record(connection_id, |record| record.last_seen = now_millis());
                Ok(ServerMessage::pong(request_id))
            }
        }
    }

    fn with_record(&self, connection_id: &ConnectionId, f: impl FnOnce(&mut ConnectionRecord)) {
        if let Some(record) = self.connections().get_mut(connection_id) {
            f(record);
        }
    }

    /// Builds the public view. Subscriptions are read from the broker, which
    /// also drops them on topic deletion or slow-consumer eviction.
    fn describe(&self, record: &ConnectionRecord) -> ConnectionInfo {
        let topics = record
            .client_id
            .as_deref()
            .map(|client_id| self.broker.client_topics(client_id))
            .unwrap_or_default();
        ConnectionInfo {
            connection_id: record.handle.id().clone(),
            client_id: record.client_id.clone(),
            state: record.handle.state(),
            topics,
            last_seen: record.last_seen,
        }
    }

    /// Tears the connection down: its client identity loses every
    /// subscription and its queue. Safe to call more than once.
    pub fn close_connection(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        let record = self.connections().remove(connection_id)?;
        record.handle.close(CLOSE_NORMAL, "connection closed");
        let info = self.describe(&record);

        if let Some(client_id) = &record.client_id {
            self.broker.disconnect_client(client_id);
        }
        record.handle.set_state(ConnectionState::Closed);
        info!(%connection_id, client_id = ?record.client_id, "connection closed");
        Some(info)
    }

    pub fn connection_info(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        let (handle, client_id, last_seen) = {
            let connections = self.connections();
            let record = connections.get(connection_id)?;
            (record.handle.clone(), record.client_id.clone(), record.last_seen)
        };
        Some(self.describe(&ConnectionRecord {
            handle,
            client_id,
            last_seen,
        }))
    }

    /// Delivers whatever the connection's client has queued. Called by the
    /// socket writer once it has room again.
    pub fn flush_connection(&self, connection_id: &ConnectionId) -> usize {
        let client_id = self
            .connections()
            .get(connection_id)
            .and_then(|record| record.client_id.clone());
        match client_id {
            Some(client_id) => self.broker.flush_client(&client_id),
            None => 0,
        }
    }

    /// Keeps the task serving one socket so shutdown can wait for it.
    pub fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Waits for every tracked socket task to finish, for at most `limit`.
    /// Returns false on timeout.
    pub async fn wait_for_connection_tasks(&self, limit: Duration) -> bool {
        let tasks = std::mem::take(&mut *self.tasks());
        let count = tasks.len();
        let finished = timeout(limit, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await
        .is_ok();

        if finished {
            debug!(tasks = count, "connection tasks finished");
        } else {
            warn!(tasks = count, "connection tasks still running after {:?}", limit);
        }
        finished
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Sends a heartbeat to every open connection and retries queued
    /// deliveries. Returns the number of connections reached.
    pub fn heartbeat(&self) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .connections()
            .values()
            .filter(|record| record.handle.state() == ConnectionState::Open)
            .map(|record| record.handle.clone())
            .collect();

        let frame = match ServerMessage::info("heartbeat", None).to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "failed to encode heartbeat");
                return 0;
            }
        };
        let reached = handles.iter().filter(|handle| handle.send(&frame)).count();

        let flushed = self.broker.flush_pending();
        debug!(connections = handles.len(), reached, flushed, "heartbeat");
        reached
    }

    /// Stops the heartbeat, closes every connection and empties the broker.
    pub fn shutdown(&self) -> ShutdownReport {
        self.shut_down.store(true, Ordering::Release);
        self.stop_heartbeat();

        let records: Vec<ConnectionRecord> =
            self.connections().drain().map(|(_, record)| record).collect();
        for record in &records {
            record.handle.close(CLOSE_GOING_AWAY, "server shutting down");
            if let Some(client_id) = &record.client_id {
                self.broker.disconnect_client(client_id);
            }
            record.handle.set_state(ConnectionState::Closed);
        }

        let report = self.broker.shutdown();
        info!(
            connections = records.len(),
            topics = report.topics,
            clients = report.clients,
            "broker shut down"
        );
        report
    }
}

fn send_reply(handle: &ConnectionHandle, reply: &ServerMessage) {
    match reply.to_frame() {
        Ok(frame) => {
            if !handle.send(&frame) {
                warn!(connection_id = %handle.id(), "reply dropped, connection not ready");
            }
        }
        Err(err) => error!(error = %err, "failed to encode reply"),
    }
}
