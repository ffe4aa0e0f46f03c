//! Registry of live agent connections and the request/response pairing
//! that lets many concurrent HTTP workers share one socket per agent.
//!
//! Each connection has exactly one reader (the read loop) and a mutex
//! serializing writers. Callers correlate replies by `request_id`: a
//! one-shot slot is registered before the frame is written and removed on
//! every exit path, so a late reply finds no slot and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use stowaway_proto::ReplyEnvelope;

pub type WsSink = SplitSink<WebSocket, Message>;
pub type WsStream = SplitStream<WebSocket>;

type PendingMap = HashMap<String, oneshot::Sender<Option<String>>>;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request_id required")]
    MissingRequestId,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    TimedOut,
    #[error("encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("write to agent failed: {0}")]
    Write(axum::Error),
}

/// A single agent WebSocket with request/response pairing.
pub struct AgentConn {
    agent_id: String,
    writer: AsyncMutex<WsSink>,
    /// `None` marks a closing connection; new requests fail fast.
    pending: Mutex<Option<PendingMap>>,
    done: watch::Sender<bool>,
}

impl AgentConn {
    fn new(agent_id: String, writer: WsSink) -> Arc<Self> {
        Arc::new(Self {
            agent_id,
            writer: AsyncMutex::new(writer),
            pending: Mutex::new(Some(HashMap::new())),
            done: watch::channel(false).0,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingMap>> {
        // A panic while holding this lock poisons it; the map is still
        // consistent for teardown, so recover the guard.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn closed_rx(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Sends `payload` and waits for the reply carrying `request_id`.
    ///
    /// Returns the raw reply frame, or an error when the socket dies, the
    /// timeout elapses, or the connection was already closing. Dropping
    /// the returned future (caller cancellation) also unregisters the
    /// slot, so a late reply cannot leak into a future request.
    pub async fn request(
        &self,
        request_id: &str,
        payload: &impl Serialize,
        timeout: Duration,
    ) -> Result<String, RequestError> {
        if request_id.is_empty() {
            return Err(RequestError::MissingRequestId);
        }
        let frame = serde_json::to_string(payload)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            match pending.as_mut() {
                None => return Err(RequestError::ConnectionClosed),
                Some(map) => {
                    map.insert(request_id.to_string(), reply_tx);
                }
            }
        }
        let _slot = SlotGuard {
            conn: self,
            request_id,
        };

        {
            let mut writer = self.writer.lock().await;
            writer
                .send(Message::Text(frame))
                .await
                .map_err(RequestError::Write)?;
        }

        let mut done = self.done.subscribe();
        tokio::select! {
            reply = reply_rx => match reply {
                Ok(Some(raw)) => Ok(raw),
                // A `None` marker or a dropped sender both mean teardown.
                Ok(None) | Err(_) => Err(RequestError::ConnectionClosed),
            },
            _ = tokio::time::sleep(timeout) => Err(RequestError::TimedOut),
            _ = done.changed() => Err(RequestError::ConnectionClosed),
        }
    }

    /// One raw frame write under the write mutex (auth handshake).
    pub(crate) async fn send_frame(&self, payload: &impl Serialize) -> Result<(), RequestError> {
        let frame = serde_json::to_string(payload)?;
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(frame))
            .await
            .map_err(RequestError::Write)
    }

    async fn ping(&self) -> Result<(), axum::Error> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Ping(Vec::new())).await
    }

    /// Routes one inbound frame to its waiter. Frames with no registered
    /// `request_id` are dropped.
    fn deliver(&self, raw: String) {
        let request_id = match serde_json::from_str::<ReplyEnvelope>(&raw) {
            Ok(envelope) => envelope.request_id,
            Err(_) => return,
        };
        let slot = {
            let mut pending = self.lock_pending();
            pending.as_mut().and_then(|map| map.remove(&request_id))
        };
        match slot {
            Some(reply_tx) => {
                let _ = reply_tx.send(Some(raw));
            }
            None => debug!(
                agent_id = %self.agent_id,
                request_id = %request_id,
                "dropping reply with no waiter"
            ),
        }
    }

    /// Idempotent teardown: wakes every waiter with the closed marker and
    /// raises the done signal. The socket itself is shut down by the read
    /// loop's exit path, which the done signal unblocks.
    pub(crate) fn close(&self) {
        let slots = self.lock_pending().take();
        if let Some(map) = slots {
            for (_, reply_tx) in map {
                let _ = reply_tx.send(None);
            }
        }
        self.done.send_replace(true);
    }

    async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

/// Unregisters a pending slot on every exit path of `request`.
struct SlotGuard<'a> {
    conn: &'a AgentConn,
    request_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(map) = self.conn.lock_pending().as_mut() {
            map.remove(self.request_id);
        }
    }
}

/// Live agent connections keyed by agent id.
#[derive(Clone, Default)]
pub struct Hub {
    agents: Arc<RwLock<HashMap<String, Arc<AgentConn>>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `agent_id`, evicting and closing any
    /// prior connection for the same id. Waiters on the old connection
    /// are woken with "connection closed" before this returns.
    pub async fn register(&self, agent_id: &str, writer: WsSink) -> Arc<AgentConn> {
        let conn = AgentConn::new(agent_id.to_string(), writer);
        let old = {
            let mut agents = self.agents.write().await;
            agents.insert(agent_id.to_string(), conn.clone())
        };
        if let Some(old) = old {
            info!(agent_id = %agent_id, "evicting previous connection");
            old.close();
        }
        conn
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentConn>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn connected(&self, agent_id: &str) -> bool {
        self.get(agent_id).await.is_some()
    }

    /// Removes and closes whatever connection is registered (idempotent).
    /// Used when the agent record is deleted: removal must disconnect.
    pub async fn remove(&self, agent_id: &str) {
        let removed = self.agents.write().await.remove(agent_id);
        if let Some(conn) = removed {
            conn.close();
        }
    }

    /// Removes `conn` only if it is still the registered connection for
    /// its id, so the teardown of an evicted connection cannot drop its
    /// replacement from the registry.
    pub async fn remove_conn(&self, conn: &Arc<AgentConn>) {
        let mut agents = self.agents.write().await;
        if let Some(current) = agents.get(conn.agent_id()) {
            if Arc::ptr_eq(current, conn) {
                agents.remove(conn.agent_id());
            }
        }
    }
}

/// The sole reader of an agent socket. Exits on read error, EOF, or the
/// connection's done signal (eviction), then tears the connection down
/// and wakes every waiter.
pub async fn run_read_loop(hub: &Hub, conn: &Arc<AgentConn>, receiver: &mut WsStream) {
    let mut done = conn.closed_rx();
    loop {
        tokio::select! {
            next = receiver.next() => match next {
                Some(Ok(Message::Text(text))) => conn.deliver(text),
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        conn.deliver(text);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pong replies to our heartbeat; axum answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(agent_id = %conn.agent_id(), "agent read error: {err}");
                    break;
                }
            },
            _ = done.changed() => break,
        }
    }
    hub.remove_conn(conn).await;
    conn.close();
    conn.shutdown_writer().await;
}

/// Periodic ping under the write mutex; a failed write closes the
/// connection so half-open sockets cannot hold a registry slot forever.
pub fn spawn_heartbeat(conn: Arc<AgentConn>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut done = conn.closed_rx();
        let mut ticks = tokio::time::interval(period);
        // The first tick fires immediately; the socket was just opened.
        ticks.tick().await;
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if conn.ping().await.is_err() {
                        debug!(agent_id = %conn.agent_id(), "heartbeat write failed");
                        conn.close();
                        break;
                    }
                }
                _ = done.changed() => break,
            }
        }
    })
}
