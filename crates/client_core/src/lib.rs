use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use shared::domain::{BookingId, CompanyId, NotificationId, RoomId, ShipmentId, UserRole};
use shared::protocol::{
    BookingSummary, CompanySummary, ConversationCreated, MessagePayload, NotificationPayload,
    NotificationQuery, RoomSummary, SendMessageRequest, ServerEvent, ShipmentSummary,
};

pub mod conversations;
pub mod error;
pub mod merge;
pub mod notifications;
pub mod rest;
pub mod transport;
pub mod types;

pub use error::ClientError;
pub use rest::{Freshness, RestClient};
pub use transport::{EmitSink, PushSession, ReconnectPolicy, SessionEvent};
pub use types::{ChatMessage, ClientEvent, Delivery, PendingIntent, SessionIdentity};

use conversations::RoomFeeds;
use notifications::NotificationFeed;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_PAGE_LIMIT: u32 = 50;
/// One bulk page scanned when resolving a counterpart to an existing room;
/// the backend has no lookup-by-participants endpoint.
const ROOM_LOOKUP_LIMIT: u32 = 100;
const ROOM_LIST_POLL_INTERVAL: Duration = Duration::from_secs(30);
const OPEN_ROOM_POLL_INTERVAL: Duration = Duration::from_secs(10);
const UNREAD_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Poll cadence and page sizing. The defaults match the production backend's
/// rate limits; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub page_limit: u32,
    pub room_lookup_limit: u32,
    pub room_list_poll: Duration,
    pub open_room_poll: Duration,
    pub unread_poll: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            room_lookup_limit: ROOM_LOOKUP_LIMIT,
            room_list_poll: ROOM_LIST_POLL_INTERVAL,
            open_room_poll: OPEN_ROOM_POLL_INTERVAL,
            unread_poll: UNREAD_POLL_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Default)]
struct SyncState {
    rooms: Vec<RoomSummary>,
    feeds: RoomFeeds,
    open_room: Option<RoomId>,
    intent: Option<PendingIntent>,
    intent_task: Option<JoinHandle<()>>,
}

struct NotificationState {
    feed: NotificationFeed,
    query: NotificationQuery,
}

impl Default for NotificationState {
    fn default() -> Self {
        Self {
            feed: NotificationFeed::default(),
            query: NotificationQuery::default(),
        }
    }
}

/// The synchronization coordinator: one per signed-in user.
///
/// Owns the REST client and the push session, folds both sources into local
/// feeds and rebroadcasts every state change as a [`ClientEvent`]. All reads
/// are served from local state; the network is only touched by refreshes,
/// polls and mutations.
pub struct MessagingClient {
    rest: RestClient,
    session: Arc<PushSession>,
    identity: SessionIdentity,
    config: ClientConfig,
    inner: Mutex<SyncState>,
    notifications: Mutex<NotificationState>,
    events: broadcast::Sender<ClientEvent>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingClient {
    pub fn new(
        base_url: &str,
        identity: SessionIdentity,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let session = PushSession::new(base_url, &identity.user_id, config.reconnect.clone())?;
        Ok(Self::with_session(base_url, identity, config, session))
    }

    /// Builds a client over an existing session, whatever drives it.
    pub fn with_session(
        base_url: &str,
        identity: SessionIdentity,
        config: ClientConfig,
        session: Arc<PushSession>,
    ) -> Arc<Self> {
        let rest = RestClient::new(base_url, identity.user_id.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            rest,
            session,
            identity,
            config,
            inner: Mutex::new(SyncState::default()),
            notifications: Mutex::new(NotificationState::default()),
            events,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Brings the client up: opens the push channel and starts the event pump
    /// and the poll backstops. Initial feeds arrive asynchronously and are
    /// announced through events.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.guard()?;
        let session_events = self.session.subscribe();
        self.session.connect().await?;
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            tasks.push(tokio::spawn(
                Arc::clone(self).pump_session(session_events),
            ));
            self.spawn_polls(&mut tasks);
        }
        info!(user_id = %self.identity.user_id, "sync: client connected");
        Ok(())
    }

    /// The current room list, most recently active first.
    pub async fn rooms(&self) -> Vec<RoomSummary> {
        self.inner.lock().await.rooms.clone()
    }

    /// The merged feed of a room: snapshot and live messages reconciled.
    pub async fn messages(&self, room_id: &RoomId) -> Vec<ChatMessage> {
        self.inner.lock().await.feeds.merged(room_id)
    }

    /// Placeholders of the pending conversation that has no room yet.
    pub async fn outbox(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.feeds.outbox().to_vec()
    }

    pub async fn current_room(&self) -> Option<RoomId> {
        self.inner.lock().await.open_room.clone()
    }

    pub async fn pending_intent(&self) -> Option<PendingIntent> {
        self.inner.lock().await.intent.clone()
    }

    pub async fn notification_feed(&self) -> NotificationFeed {
        self.notifications.lock().await.feed.clone()
    }

    pub async fn unread_notifications(&self) -> u64 {
        self.notifications.lock().await.feed.unread()
    }

    /// Opens a room: joins it on the push channel, pulls a fresh snapshot and
    /// acknowledges the counterpart's unread messages. The read receipt goes
    /// over REST in the background; its failure is logged, never surfaced.
    pub async fn open_room(self: &Arc<Self>, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        self.guard()?;
        {
            let mut inner = self.inner.lock().await;
            inner.open_room = Some(room_id.clone());
        }
        if self.session.is_connected() {
            if let Err(err) = self.session.join_room(room_id).await {
                warn!(error = %err, room_id = %room_id, "sync: join failed, continuing with rest only");
            }
        }
        let mut merged = self.refresh_messages(room_id).await?;
        let needs_ack = {
            let mut inner = self.inner.lock().await;
            let needs = inner
                .feeds
                .has_unread_from_counterpart(room_id, &self.identity.user_id);
            if needs {
                inner
                    .feeds
                    .mark_counterpart_read(room_id, &self.identity.user_id);
            }
            needs
        };
        if needs_ack {
            for message in &mut merged {
                if message.sender_id != self.identity.user_id {
                    message.read = true;
                }
            }
            let client = Arc::clone(self);
            let ack_room = room_id.clone();
            tokio::spawn(async move {
                match client.rest.mark_room_read(&ack_room).await {
                    Ok(()) => client.rest.invalidate_messages(&ack_room).await,
                    Err(err) => {
                        warn!(error = %err, room_id = %ack_room, "sync: mark room read failed")
                    }
                }
            });
            let _ = self.events.send(ClientEvent::ConversationUpdated {
                room_id: Some(room_id.clone()),
            });
        }
        Ok(merged)
    }

    /// Closes the current room, leaving it on the push channel.
    pub async fn close_room(&self) {
        let open_room = { self.inner.lock().await.open_room.take() };
        if let Some(room_id) = open_room {
            if let Err(err) = self.session.leave_room(&room_id).await {
                debug!(error = %err, room_id = %room_id, "sync: leave failed");
            }
        }
    }

    /// Starts a conversation against a counterpart. An existing room is
    /// looked up first; when none exists the intent stays pending until the
    /// server announces a matching room. Returns the room when it already
    /// exists.
    pub async fn start_conversation(
        self: &Arc<Self>,
        intent: PendingIntent,
    ) -> Result<Option<RoomSummary>> {
        self.guard()?;
        self.close_room().await;
        let subscription = self.session.subscribe_room_created({
            let intent = intent.clone();
            move |room| intent.matches(room)
        });
        let client = Arc::clone(self);
        let waiter = tokio::spawn(async move {
            if let Some(room) = subscription.resolved().await {
                client.adopt_resolved_room(room).await;
            }
        });
        {
            let mut inner = self.inner.lock().await;
            inner.intent = Some(intent.clone());
            if let Some(previous) = inner.intent_task.replace(waiter) {
                previous.abort();
            }
        }
        let discovered = self
            .rest
            .find_room(&intent, self.config.room_lookup_limit)
            .await?;
        if let Some(room) = discovered {
            {
                let mut inner = self.inner.lock().await;
                inner.intent = None;
                if let Some(task) = inner.intent_task.take() {
                    task.abort();
                }
                if !inner
                    .rooms
                    .iter()
                    .any(|existing| existing.room_id == room.room_id)
                {
                    inner.rooms.insert(0, room.clone());
                }
            }
            let _ = self.events.send(ClientEvent::RoomsUpdated);
            let _ = self.events.send(ClientEvent::RoomResolved { room: room.clone() });
            self.open_room(&room.room_id).await?;
            return Ok(Some(room));
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { room_id: None });
        Ok(None)
    }

    /// Sends `body` into the current conversation.
    ///
    /// Connected, the frame goes over the push channel and an optimistic
    /// placeholder appears immediately. Disconnected, the send falls back to
    /// the REST create-room-and-send call and state is only updated from the
    /// server's response; this path never shows a placeholder.
    pub async fn send(&self, body: &str) -> Result<()> {
        self.guard()?;
        let (open_room, intent) = {
            let inner = self.inner.lock().await;
            (inner.open_room.clone(), inner.intent.clone())
        };
        if self.session.is_connected() {
            self.send_over_push(open_room, intent, body).await
        } else {
            self.send_over_rest(open_room, intent, body).await
        }
    }

    /// Re-fetches the room list and applies it. Also resolves the pending
    /// intent when the fetched page turns out to contain a matching room.
    pub async fn refresh_rooms(&self) -> Result<Vec<RoomSummary>> {
        let page = self
            .rest
            .list_rooms(self.config.page_limit, Freshness::Refresh)
            .await?;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(page.items);
        }
        let discovered = {
            let mut inner = self.inner.lock().await;
            inner.rooms = page.items.clone();
            match &inner.intent {
                Some(intent) => page.items.iter().find(|room| intent.matches(room)).cloned(),
                None => None,
            }
        };
        let _ = self.events.send(ClientEvent::RoomsUpdated);
        if let Some(room) = discovered {
            {
                let mut inner = self.inner.lock().await;
                if let Some(task) = inner.intent_task.take() {
                    task.abort();
                }
            }
            self.adopt_resolved_room(room).await;
        }
        Ok(page.items)
    }

    /// Re-fetches one room's snapshot page and returns the merged feed.
    pub async fn refresh_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        let page = self
            .rest
            .list_messages(room_id, self.config.page_limit, Freshness::Refresh)
            .await?;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let merged = {
            let mut inner = self.inner.lock().await;
            inner.feeds.apply_snapshot(room_id, page.items);
            inner.feeds.merged(room_id)
        };
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            room_id: Some(room_id.clone()),
        });
        Ok(merged)
    }

    /// Re-fetches the notification page for `query` and makes it the visible
    /// feed.
    pub async fn refresh_notifications(
        &self,
        query: NotificationQuery,
    ) -> Result<Vec<NotificationPayload>> {
        let page = self
            .rest
            .list_notifications(&query, Freshness::Refresh)
            .await?;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(page.items);
        }
        let unread = {
            let mut notifications = self.notifications.lock().await;
            notifications.query = query;
            notifications.feed.replace_items(page.items.clone());
            notifications.feed.unread()
        };
        let _ = self
            .events
            .send(ClientEvent::NotificationsUpdated { unread });
        Ok(page.items)
    }

    pub async fn refresh_unread(&self) -> Result<u64> {
        let unread = self.rest.unread_count().await?;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(unread);
        }
        self.notifications.lock().await.feed.set_unread(unread);
        let _ = self
            .events
            .send(ClientEvent::NotificationsUpdated { unread });
        Ok(unread)
    }

    /// Marks one notification read: the feed and badge flip immediately, the
    /// REST call follows. On failure the optimistic change is rolled back by
    /// re-fetching the server's state, and the error is surfaced.
    pub async fn mark_notification_read(&self, notification_id: &NotificationId) -> Result<()> {
        self.guard()?;
        let (changed, unread) = {
            let mut notifications = self.notifications.lock().await;
            let changed = notifications.feed.mark_read(notification_id);
            (changed, notifications.feed.unread())
        };
        if changed {
            let _ = self
                .events
                .send(ClientEvent::NotificationsUpdated { unread });
        }
        match self.rest.mark_notification_read(notification_id).await {
            Ok(()) => {
                self.rest.invalidate_notifications().await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, notification_id = %notification_id, "notify: mark read failed, restoring server state");
                self.restore_notifications().await;
                Err(err)
            }
        }
    }

    /// Marks every notification read. Same optimistic-then-rollback contract
    /// as [`Self::mark_notification_read`].
    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        self.guard()?;
        {
            let mut notifications = self.notifications.lock().await;
            notifications.feed.mark_all_read();
        }
        let _ = self
            .events
            .send(ClientEvent::NotificationsUpdated { unread: 0 });
        match self.rest.mark_all_notifications_read().await {
            Ok(()) => {
                self.rest.invalidate_notifications().await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "notify: mark all read failed, restoring server state");
                self.restore_notifications().await;
                Err(err)
            }
        }
    }

    pub async fn delete_notification(&self, notification_id: &NotificationId) -> Result<()> {
        self.guard()?;
        let (changed, unread) = {
            let mut notifications = self.notifications.lock().await;
            let changed = notifications.feed.apply_deleted(notification_id);
            (changed, notifications.feed.unread())
        };
        if changed {
            let _ = self
                .events
                .send(ClientEvent::NotificationsUpdated { unread });
        }
        match self.rest.delete_notification(notification_id).await {
            Ok(()) => {
                self.rest.invalidate_notifications().await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, notification_id = %notification_id, "notify: delete failed, restoring server state");
                self.restore_notifications().await;
                Err(err)
            }
        }
    }

    pub async fn delete_read_notifications(&self) -> Result<()> {
        self.guard()?;
        let (removed, unread) = {
            let mut notifications = self.notifications.lock().await;
            let removed = notifications.feed.remove_read();
            (removed, notifications.feed.unread())
        };
        if removed > 0 {
            let _ = self
                .events
                .send(ClientEvent::NotificationsUpdated { unread });
        }
        match self.rest.delete_read_notifications().await {
            Ok(()) => {
                self.rest.invalidate_notifications().await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "notify: clear read failed, restoring server state");
                self.restore_notifications().await;
                Err(err)
            }
        }
    }

    /// Booking details behind a notification's click-through.
    pub async fn booking(&self, booking_id: &BookingId) -> Result<BookingSummary> {
        self.rest.booking(booking_id).await
    }

    pub async fn shipment(&self, shipment_id: &ShipmentId) -> Result<ShipmentSummary> {
        self.rest.shipment(shipment_id).await
    }

    /// Company profile, used to label rooms on the customer side.
    pub async fn company(&self, company_id: &CompanyId) -> Result<CompanySummary> {
        self.rest.company(company_id).await
    }

    /// Tears the client down: leaves the open room, stops the session, aborts
    /// every background task. In-flight fetches that complete after this
    /// point are discarded.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (open_room, intent_task) = {
            let mut inner = self.inner.lock().await;
            (inner.open_room.take(), inner.intent_task.take())
        };
        if let Some(task) = intent_task {
            task.abort();
        }
        if let Some(room_id) = open_room {
            if let Err(err) = self.session.leave_room(&room_id).await {
                debug!(error = %err, room_id = %room_id, "sync: leave on close failed");
            }
        }
        self.session.close().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let _ = self.events.send(ClientEvent::Disconnected);
        info!(user_id = %self.identity.user_id, "sync: client closed");
    }

    fn guard(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    async fn send_over_push(
        &self,
        open_room: Option<RoomId>,
        intent: Option<PendingIntent>,
        body: &str,
    ) -> Result<()> {
        if let Some(room_id) = open_room {
            self.session
                .send_message(SendMessageRequest {
                    room_id: Some(room_id.clone()),
                    body: body.to_string(),
                    customer_id: None,
                    company_id: None,
                    booking_id: None,
                })
                .await
                .context("failed to send message")?;
            let placeholder =
                ChatMessage::placeholder(self.identity.user_id.clone(), body, Utc::now());
            {
                let mut inner = self.inner.lock().await;
                inner.feeds.push_placeholder(Some(&room_id), placeholder);
            }
            let _ = self.events.send(ClientEvent::ConversationUpdated {
                room_id: Some(room_id),
            });
            return Ok(());
        }
        let Some(intent) = intent.filter(|intent| intent.is_sendable(&self.identity)) else {
            return Err(ClientError::MissingConversationTarget.into());
        };
        self.session
            .send_message(self.create_and_send_request(&intent, body))
            .await
            .context("failed to send message")?;
        let placeholder = ChatMessage::placeholder(self.identity.user_id.clone(), body, Utc::now());
        {
            let mut inner = self.inner.lock().await;
            inner.feeds.push_placeholder(None, placeholder);
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { room_id: None });
        Ok(())
    }

    async fn send_over_rest(
        &self,
        open_room: Option<RoomId>,
        intent: Option<PendingIntent>,
        body: &str,
    ) -> Result<()> {
        let request = match open_room {
            Some(room_id) => SendMessageRequest {
                room_id: Some(room_id),
                body: body.to_string(),
                customer_id: None,
                company_id: None,
                booking_id: None,
            },
            None => {
                let Some(intent) = intent.filter(|intent| intent.is_sendable(&self.identity))
                else {
                    return Err(ClientError::MissingConversationTarget.into());
                };
                self.create_and_send_request(&intent, body)
            }
        };
        let created = self
            .rest
            .create_conversation_message(&request)
            .await
            .context("failed to send message")?;
        self.adopt_sent_conversation(created).await;
        Ok(())
    }

    /// Builds the create-and-send request, filling the caller's side of the
    /// (customer, company) pair from the session identity.
    fn create_and_send_request(&self, intent: &PendingIntent, body: &str) -> SendMessageRequest {
        let customer_id = match self.identity.role {
            UserRole::Customer => Some(self.identity.user_id.clone()),
            UserRole::Company => intent.customer_id.clone(),
        };
        let company_id = match self.identity.role {
            UserRole::Company => self.identity.company_id.clone(),
            UserRole::Customer => intent.company_id.clone(),
        };
        SendMessageRequest {
            room_id: None,
            body: body.to_string(),
            customer_id,
            company_id,
            booking_id: intent.booking_id.clone(),
        }
    }

    async fn adopt_sent_conversation(&self, created: ConversationCreated) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.rest.invalidate_rooms().await;
        self.rest.invalidate_messages(&created.room.room_id).await;
        let room_id = created.room.room_id.clone();
        let resolved = {
            let mut inner = self.inner.lock().await;
            if !inner.rooms.iter().any(|room| room.room_id == room_id) {
                inner.rooms.insert(0, created.room.clone());
            }
            let matched = inner
                .intent
                .as_ref()
                .is_some_and(|intent| intent.matches(&created.room));
            if matched {
                inner.intent = None;
                if let Some(task) = inner.intent_task.take() {
                    task.abort();
                }
                inner.open_room = Some(room_id.clone());
            }
            inner.feeds.push_live(created.message.clone());
            matched
        };
        let _ = self.events.send(ClientEvent::RoomsUpdated);
        if resolved {
            let _ = self.events.send(ClientEvent::RoomResolved {
                room: created.room.clone(),
            });
        }
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            room_id: Some(room_id),
        });
    }

    /// Converts a pending conversation into a real room: clears the intent,
    /// adopts outbox placeholders, joins and snapshots the room.
    async fn adopt_resolved_room(&self, room: RoomSummary) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.inner.lock().await;
            inner.intent = None;
            if !inner
                .rooms
                .iter()
                .any(|existing| existing.room_id == room.room_id)
            {
                inner.rooms.insert(0, room.clone());
            }
            inner.feeds.adopt_outbox(&room.room_id);
            inner.open_room = Some(room.room_id.clone());
        }
        if self.session.is_connected() {
            if let Err(err) = self.session.join_room(&room.room_id).await {
                warn!(error = %err, room_id = %room.room_id, "sync: join of resolved room failed");
            }
        }
        let _ = self.events.send(ClientEvent::RoomsUpdated);
        let _ = self
            .events
            .send(ClientEvent::RoomResolved { room: room.clone() });
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            room_id: Some(room.room_id.clone()),
        });
        if let Err(err) = self.refresh_messages(&room.room_id).await {
            warn!(error = %err, room_id = %room.room_id, "sync: snapshot of resolved room failed");
        }
    }

    async fn restore_notifications(&self) {
        let query = { self.notifications.lock().await.query.clone() };
        match self.rest.list_notifications(&query, Freshness::Refresh).await {
            Ok(page) => {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                self.notifications
                    .lock()
                    .await
                    .feed
                    .replace_items(page.items);
            }
            Err(err) => warn!(error = %err, "notify: rollback refetch failed"),
        }
        match self.rest.unread_count().await {
            Ok(unread) => {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                self.notifications.lock().await.feed.set_unread(unread);
            }
            Err(err) => warn!(error = %err, "notify: rollback unread refetch failed"),
        }
        let unread = self.notifications.lock().await.feed.unread();
        let _ = self
            .events
            .send(ClientEvent::NotificationsUpdated { unread });
    }

    async fn pump_session(self: Arc<Self>, mut rx: broadcast::Receiver<SessionEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.apply_session_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "sync: push event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn apply_session_event(&self, event: SessionEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            SessionEvent::Connected => {
                let _ = self.events.send(ClientEvent::Connected);
                self.resync_after_connect().await;
            }
            SessionEvent::Disconnected => {
                let _ = self.events.send(ClientEvent::Disconnected);
            }
            SessionEvent::Error(message) => {
                let _ = self.events.send(ClientEvent::Error(message));
            }
            SessionEvent::Server(event) => self.apply_server_event(event).await,
        }
    }

    /// Room membership does not survive a reconnect, and anything may have
    /// happened while the link was down: re-join and re-fetch everything.
    async fn resync_after_connect(&self) {
        let open_room = { self.inner.lock().await.open_room.clone() };
        if let Some(room_id) = &open_room {
            if let Err(err) = self.session.join_room(room_id).await {
                warn!(error = %err, room_id = %room_id, "sync: rejoin after connect failed");
            }
        }
        if let Err(err) = self.refresh_rooms().await {
            warn!(error = %err, "sync: room refresh after connect failed");
        }
        if let Some(room_id) = open_room {
            if let Err(err) = self.refresh_messages(&room_id).await {
                warn!(error = %err, room_id = %room_id, "sync: message refresh after connect failed");
            }
        }
        let query = { self.notifications.lock().await.query.clone() };
        if let Err(err) = self.refresh_notifications(query).await {
            warn!(error = %err, "sync: notification refresh after connect failed");
        }
        if let Err(err) = self.refresh_unread().await {
            warn!(error = %err, "sync: unread refresh after connect failed");
        }
    }

    async fn apply_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::RoomCreated { room } => {
                self.rest.invalidate_rooms().await;
                {
                    let mut inner = self.inner.lock().await;
                    if !inner
                        .rooms
                        .iter()
                        .any(|existing| existing.room_id == room.room_id)
                    {
                        inner.rooms.insert(0, room);
                    }
                }
                let _ = self.events.send(ClientEvent::RoomsUpdated);
            }
            ServerEvent::MessageReceived { message } => self.apply_message(message).await,
            ServerEvent::NotificationCreated { notification } => {
                self.rest.invalidate_notifications().await;
                let unread = {
                    let mut notifications = self.notifications.lock().await;
                    notifications.feed.apply_created(notification);
                    notifications.feed.unread()
                };
                let _ = self
                    .events
                    .send(ClientEvent::NotificationsUpdated { unread });
            }
            ServerEvent::NotificationUpdated { notification } => {
                self.rest.invalidate_notifications().await;
                let unread = {
                    let mut notifications = self.notifications.lock().await;
                    notifications.feed.apply_updated(notification);
                    notifications.feed.unread()
                };
                let _ = self
                    .events
                    .send(ClientEvent::NotificationsUpdated { unread });
            }
            ServerEvent::NotificationDeleted { notification_id } => {
                self.rest.invalidate_notifications().await;
                let unread = {
                    let mut notifications = self.notifications.lock().await;
                    notifications.feed.apply_deleted(&notification_id);
                    notifications.feed.unread()
                };
                let _ = self
                    .events
                    .send(ClientEvent::NotificationsUpdated { unread });
            }
            ServerEvent::UnreadCountChanged { unread } => {
                self.notifications.lock().await.feed.set_unread(unread);
                let _ = self
                    .events
                    .send(ClientEvent::NotificationsUpdated { unread });
            }
            ServerEvent::Error(error) => {
                let _ = self.events.send(ClientEvent::Error(error.message));
            }
        }
    }

    async fn apply_message(&self, message: MessagePayload) {
        self.rest.invalidate_messages(&message.room_id).await;
        // the room list orders by last activity, so it is stale now too
        self.rest.invalidate_rooms().await;
        let room_id = message.room_id.clone();
        {
            let mut inner = self.inner.lock().await;
            inner.feeds.push_live(message);
        }
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            room_id: Some(room_id),
        });
    }

    fn spawn_polls(self: &Arc<Self>, tasks: &mut Vec<JoinHandle<()>>) {
        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.config.room_list_poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = client.refresh_rooms().await {
                    debug!(error = %err, "sync: room list poll failed");
                }
            }
        }));
        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.config.open_room_poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.closed.load(Ordering::SeqCst) {
                    break;
                }
                let open_room = { client.inner.lock().await.open_room.clone() };
                if let Some(room_id) = open_room {
                    if let Err(err) = client.refresh_messages(&room_id).await {
                        debug!(error = %err, room_id = %room_id, "sync: open room poll failed");
                    }
                }
            }
        }));
        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.config.unread_poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = client.refresh_unread().await {
                    debug!(error = %err, "sync: unread poll failed");
                }
            }
        }));
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
