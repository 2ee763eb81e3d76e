//! The push channel: one live WebSocket session per signed-in user.
//!
//! The session owns connection state, the single-active-room membership and
//! reconnection. It decodes [`ServerEvent`] frames and rebroadcasts them as
//! [`SessionEvent`]s; it never interprets them. Outbound frames fail fast
//! with [`ClientError::NotConnected`] while the link is down, they are never
//! queued for later.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use shared::domain::{RoomId, UserId};
use shared::protocol::{ClientRequest, RoomSummary, SendMessageRequest, ServerEvent};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What the session reports upward.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Server(ServerEvent),
    Error(String),
}

/// Where outbound frames go. The production sink hands them to the WebSocket
/// task; tests substitute a recorder.
#[async_trait]
pub trait EmitSink: Send + Sync {
    async fn emit(&self, request: ClientRequest) -> Result<(), ClientError>;
}

/// Exponential backoff tuning for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Default)]
struct WsSink {
    tx: StdMutex<Option<mpsc::UnboundedSender<ClientRequest>>>,
}

impl WsSink {
    fn install(&self, tx: mpsc::UnboundedSender<ClientRequest>) {
        *self.slot() = Some(tx);
    }

    fn clear(&self) {
        *self.slot() = None;
    }

    fn slot(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ClientRequest>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EmitSink for WsSink {
    async fn emit(&self, request: ClientRequest) -> Result<(), ClientError> {
        let tx = self.slot().clone();
        match tx {
            Some(tx) => tx.send(request).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }
}

struct Waiter {
    predicate: Box<dyn Fn(&RoomSummary) -> bool + Send + Sync>,
    notify: oneshot::Sender<RoomSummary>,
}

#[derive(Default)]
struct WaiterRegistry {
    next_id: AtomicU64,
    waiters: StdMutex<HashMap<u64, Waiter>>,
}

impl WaiterRegistry {
    fn register(
        &self,
        predicate: Box<dyn Fn(&RoomSummary) -> bool + Send + Sync>,
    ) -> (u64, oneshot::Receiver<RoomSummary>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id,
            Waiter {
                predicate,
                notify: tx,
            },
        );
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn notify(&self, room: &RoomSummary) {
        let mut waiters = self.lock();
        let matched: Vec<u64> = waiters
            .iter()
            .filter(|(_, waiter)| (waiter.predicate)(room))
            .map(|(id, _)| *id)
            .collect();
        for id in matched {
            if let Some(waiter) = waiters.remove(&id) {
                let _ = waiter.notify.send(room.clone());
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A one-shot subscription for a room matching a predicate. Dropping it
/// unsubscribes; there is no way to leak a watcher.
pub struct RoomCreatedSubscription {
    id: u64,
    registry: Arc<WaiterRegistry>,
    rx: Option<oneshot::Receiver<RoomSummary>>,
}

impl RoomCreatedSubscription {
    /// Waits for a matching room announcement. `None` when the session shuts
    /// down first.
    pub async fn resolved(mut self) -> Option<RoomSummary> {
        match self.rx.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

impl Drop for RoomCreatedSubscription {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

struct Link {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
    rx: mpsc::UnboundedReceiver<ClientRequest>,
}

pub struct PushSession {
    ws_url: Option<String>,
    reconnect: ReconnectPolicy,
    sink: Arc<dyn EmitSink>,
    ws_sink: Option<Arc<WsSink>>,
    connected: AtomicBool,
    closing: AtomicBool,
    active_room: Mutex<Option<RoomId>>,
    waiters: Arc<WaiterRegistry>,
    events: broadcast::Sender<SessionEvent>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl PushSession {
    /// A session that will dial `base_url`'s WebSocket endpoint.
    pub fn new(
        base_url: &str,
        user_id: &UserId,
        reconnect: ReconnectPolicy,
    ) -> Result<Arc<Self>> {
        let ws_url = push_endpoint(base_url, user_id)?;
        let ws_sink = Arc::new(WsSink::default());
        let sink: Arc<dyn EmitSink> = ws_sink.clone();
        Ok(Arc::new(Self {
            ws_url: Some(ws_url),
            reconnect,
            sink,
            ws_sink: Some(ws_sink),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            active_room: Mutex::new(None),
            waiters: Arc::new(WaiterRegistry::default()),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            runner: Mutex::new(None),
        }))
    }

    /// A session driven over an externally managed link. `connect` only flips
    /// the connection flag; frames go straight to `sink`.
    pub fn with_sink(sink: Arc<dyn EmitSink>) -> Arc<Self> {
        Arc::new(Self {
            ws_url: None,
            reconnect: ReconnectPolicy::default(),
            sink,
            ws_sink: None,
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            active_room: Mutex::new(None),
            waiters: Arc::new(WaiterRegistry::default()),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            runner: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn active_room(&self) -> Option<RoomId> {
        self.active_room.lock().await.clone()
    }

    /// Opens the link. Idempotent: a second call while the session is live
    /// does nothing. The first failure is surfaced; once the initial connect
    /// succeeds, later drops are retried in the background with backoff.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ClientError::Closed.into());
        }
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return Ok(());
        }
        let Some(ws_url) = self.ws_url.clone() else {
            if !self.connected.swap(true, Ordering::SeqCst) {
                let _ = self.events.send(SessionEvent::Connected);
            }
            return Ok(());
        };
        let (stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect push channel: {ws_url}"))?;
        let link = self.open_link(stream);
        *runner = Some(tokio::spawn(Arc::clone(self).run(link)));
        Ok(())
    }

    /// Declares interest in a room. The server keeps at most one membership
    /// per session, so an active room is left first; rejoining the active
    /// room emits nothing at all.
    pub async fn join_room(&self, room_id: &RoomId) -> Result<(), ClientError> {
        let mut active = self.active_room.lock().await;
        if active.as_ref() == Some(room_id) {
            return Ok(());
        }
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if let Some(previous) = active.take() {
            self.sink
                .emit(ClientRequest::LeaveRoom { room_id: previous })
                .await?;
        }
        self.sink
            .emit(ClientRequest::JoinRoom {
                room_id: room_id.clone(),
            })
            .await?;
        *active = Some(room_id.clone());
        Ok(())
    }

    /// Drops interest in `room_id` if it is the active room. A disconnected
    /// session already lost its membership server side, so this never fails
    /// on a down link.
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<(), ClientError> {
        let mut active = self.active_room.lock().await;
        if active.as_ref() != Some(room_id) {
            return Ok(());
        }
        *active = None;
        if self.is_connected() {
            self.sink
                .emit(ClientRequest::LeaveRoom {
                    room_id: room_id.clone(),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn send_message(&self, request: SendMessageRequest) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.sink.emit(ClientRequest::SendMessage(request)).await
    }

    /// Watches for a `room_created` announcement matching `predicate`.
    pub fn subscribe_room_created<F>(&self, predicate: F) -> RoomCreatedSubscription
    where
        F: Fn(&RoomSummary) -> bool + Send + Sync + 'static,
    {
        let (id, rx) = self.waiters.register(Box::new(predicate));
        RoomCreatedSubscription {
            id,
            registry: Arc::clone(&self.waiters),
            rx: Some(rx),
        }
    }

    /// Tears the session down. Leaves the active room on a best-effort basis,
    /// stops the background task and drops every pending room watcher.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let active = self.active_room.lock().await.take();
        if let Some(room_id) = active {
            if self.is_connected() {
                if let Err(err) = self.sink.emit(ClientRequest::LeaveRoom { room_id }).await {
                    debug!(error = %err, "push: leave on close failed");
                }
            }
        }
        if let Some(runner) = self.runner.lock().await.take() {
            runner.abort();
        }
        if let Some(ws_sink) = &self.ws_sink {
            ws_sink.clear();
        }
        self.waiters.clear();
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Disconnected);
        }
    }

    fn open_link(&self, stream: WsStream) -> Link {
        let (writer, reader) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(ws_sink) = &self.ws_sink {
            ws_sink.install(tx);
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Connected);
        Link { writer, reader, rx }
    }

    async fn drop_link(&self) {
        if let Some(ws_sink) = &self.ws_sink {
            ws_sink.clear();
        }
        self.active_room.lock().await.take();
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Disconnected);
        }
    }

    async fn run(self: Arc<Self>, mut link: Link) {
        let Some(ws_url) = self.ws_url.clone() else {
            return;
        };
        loop {
            self.pump(&mut link).await;
            self.drop_link().await;
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            let mut attempt: u32 = 0;
            let stream = loop {
                attempt += 1;
                let delay = self.reconnect.delay_for(attempt);
                info!(attempt, delay_ms = delay.as_millis() as u64, "push: reconnecting");
                tokio::time::sleep(delay).await;
                if self.closing.load(Ordering::SeqCst) {
                    return;
                }
                match connect_async(&ws_url).await {
                    Ok((stream, _)) => break stream,
                    Err(err) => warn!(error = %err, attempt, "push: reconnect attempt failed"),
                }
            };
            link = self.open_link(stream);
        }
    }

    async fn pump(&self, link: &mut Link) {
        loop {
            tokio::select! {
                frame = link.reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "push: receive failed");
                        break;
                    }
                },
                outgoing = link.rx.recv() => {
                    let Some(request) = outgoing else { break };
                    let text = match serde_json::to_string(&request) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "push: failed to encode frame");
                            continue;
                        }
                    };
                    if let Err(err) = link.writer.send(Message::Text(text)).await {
                        warn!(error = %err, "push: send failed");
                        break;
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => {
                if let ServerEvent::RoomCreated { room } = &event {
                    self.waiters.notify(room);
                }
                let _ = self.events.send(SessionEvent::Server(event));
            }
            Err(err) => {
                let _ = self
                    .events
                    .send(SessionEvent::Error(format!("invalid server event: {err}")));
            }
        }
    }
}

/// Derives the WebSocket endpoint from the REST base url, keeping the scheme
/// pair aligned (http -> ws, https -> wss).
fn push_endpoint(base_url: &str, user_id: &UserId) -> Result<String> {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else if base_url.starts_with("http://") {
        base_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("base url must start with http:// or https://"));
    };
    let mut url = Url::parse(&format!("{}/ws", ws_base.trim_end_matches('/')))?;
    url.query_pairs_mut()
        .append_pair("user_id", user_id.as_str());
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
