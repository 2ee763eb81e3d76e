//! REST access to the marketplace backend, with a keyed snapshot cache.
//!
//! Every page fetched is cached under its full parameter set and reused until
//! something invalidates it: a push event touching the resource, a poll tick
//! (polls always bypass the cache) or a local mutation. Reads choose between
//! the cache and the network with [`Freshness`].

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use shared::domain::{BookingId, CompanyId, NotificationId, NotificationKind, RoomId, ShipmentId, UserId};
use shared::error::{ApiError, ApiException};
use shared::protocol::{
    BookingSummary, CompanySummary, ConversationCreated, MessagePayload, NotificationPayload,
    NotificationQuery, Page, RoomSummary, SendMessageRequest, ShipmentSummary, UnreadCount,
};

use crate::types::PendingIntent;

/// Whether a read may be served from the snapshot cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Cached,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NotificationCacheKey {
    page: u32,
    limit: u32,
    unread_only: bool,
    kind: Option<NotificationKind>,
}

impl From<&NotificationQuery> for NotificationCacheKey {
    fn from(query: &NotificationQuery) -> Self {
        Self {
            page: query.page,
            limit: query.limit,
            unread_only: query.unread_only,
            kind: query.kind.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct SnapshotCache {
    rooms: HashMap<u32, Page<RoomSummary>>,
    messages: HashMap<(RoomId, u32), Page<MessagePayload>>,
    notifications: HashMap<NotificationCacheKey, Page<NotificationPayload>>,
}

#[derive(Serialize)]
struct ScopedQuery<'a> {
    user_id: &'a str,
}

#[derive(Serialize)]
struct ListQuery<'a> {
    user_id: &'a str,
    limit: u32,
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    user_id: UserId,
    cache: Mutex<SnapshotCache>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, user_id: UserId) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            user_id,
            cache: Mutex::new(SnapshotCache::default()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Lists the caller's conversation rooms, most recently active first.
    pub async fn list_rooms(&self, limit: u32, freshness: Freshness) -> Result<Page<RoomSummary>> {
        if freshness == Freshness::Cached {
            if let Some(page) = self.cache.lock().await.rooms.get(&limit) {
                return Ok(page.clone());
            }
        }
        let response = self
            .http
            .get(format!("{}/conversations", self.base_url))
            .query(&ListQuery {
                user_id: self.user_id.as_str(),
                limit,
            })
            .send()
            .await?;
        let page: Page<RoomSummary> = decode(response).await?;
        self.cache.lock().await.rooms.insert(limit, page.clone());
        Ok(page)
    }

    /// Fetches the newest page of a room's messages. A room the backend no
    /// longer knows comes back as an empty page, not an error; stale room
    /// references survive in cached room lists.
    pub async fn list_messages(
        &self,
        room_id: &RoomId,
        limit: u32,
        freshness: Freshness,
    ) -> Result<Page<MessagePayload>> {
        let key = (room_id.clone(), limit);
        if freshness == Freshness::Cached {
            if let Some(page) = self.cache.lock().await.messages.get(&key) {
                return Ok(page.clone());
            }
        }
        let response = self
            .http
            .get(format!("{}/conversations/{}/messages", self.base_url, room_id))
            .query(&ListQuery {
                user_id: self.user_id.as_str(),
                limit,
            })
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(room_id = %room_id, "rest: unknown room, serving empty message page");
            let page = Page::empty();
            self.cache.lock().await.messages.insert(key, page.clone());
            return Ok(page);
        }
        let page: Page<MessagePayload> = decode(response).await?;
        self.cache.lock().await.messages.insert(key, page.clone());
        Ok(page)
    }

    /// Looks for an existing room matching `intent` by scanning one bulk room
    /// page of up to `scan_limit` entries and filtering locally. The backend
    /// has no lookup-by-participants endpoint.
    pub async fn find_room(
        &self,
        intent: &PendingIntent,
        scan_limit: u32,
    ) -> Result<Option<RoomSummary>> {
        let page = self.list_rooms(scan_limit, Freshness::Refresh).await?;
        Ok(page.items.into_iter().find(|room| intent.matches(room)))
    }

    /// The REST create-room-and-send fallback used while the push channel is
    /// down. The server creates the room if needed and returns both halves.
    pub async fn create_conversation_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<ConversationCreated> {
        let response = self
            .http
            .post(format!("{}/conversations/messages", self.base_url))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    /// Marks every counterpart message in the room as read.
    pub async fn mark_room_read(&self, room_id: &RoomId) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/conversations/{}/read", self.base_url, room_id))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        check(response).await.map(drop)
    }

    pub async fn list_notifications(
        &self,
        query: &NotificationQuery,
        freshness: Freshness,
    ) -> Result<Page<NotificationPayload>> {
        let key = NotificationCacheKey::from(query);
        if freshness == Freshness::Cached {
            if let Some(page) = self.cache.lock().await.notifications.get(&key) {
                return Ok(page.clone());
            }
        }
        let response = self
            .http
            .get(format!("{}/notifications", self.base_url))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .query(query)
            .send()
            .await?;
        let page: Page<NotificationPayload> = decode(response).await?;
        self.cache.lock().await.notifications.insert(key, page.clone());
        Ok(page)
    }

    pub async fn unread_count(&self) -> Result<u64> {
        let response = self
            .http
            .get(format!("{}/notifications/unread_count", self.base_url))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        let count: UnreadCount = decode(response).await?;
        Ok(count.unread)
    }

    pub async fn mark_notification_read(&self, notification_id: &NotificationId) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "{}/notifications/{}/read",
                self.base_url, notification_id
            ))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        check(response).await.map(drop)
    }

    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/notifications/read_all", self.base_url))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        check(response).await.map(drop)
    }

    pub async fn delete_notification(&self, notification_id: &NotificationId) -> Result<()> {
        let response = self
            .http
            .delete(format!(
                "{}/notifications/{}",
                self.base_url, notification_id
            ))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        check(response).await.map(drop)
    }

    pub async fn delete_read_notifications(&self) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/notifications/read", self.base_url))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        check(response).await.map(drop)
    }

    /// Booking details for notification click-through.
    pub async fn booking(&self, booking_id: &BookingId) -> Result<BookingSummary> {
        let response = self
            .http
            .get(format!("{}/bookings/{}", self.base_url, booking_id))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        decode(response).await
    }

    /// Shipment details for notification click-through.
    pub async fn shipment(&self, shipment_id: &ShipmentId) -> Result<ShipmentSummary> {
        let response = self
            .http
            .get(format!("{}/shipments/{}", self.base_url, shipment_id))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        decode(response).await
    }

    /// Company profile for room display names.
    pub async fn company(&self, company_id: &CompanyId) -> Result<CompanySummary> {
        let response = self
            .http
            .get(format!("{}/companies/{}", self.base_url, company_id))
            .query(&ScopedQuery {
                user_id: self.user_id.as_str(),
            })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn invalidate_rooms(&self) {
        self.cache.lock().await.rooms.clear();
    }

    pub async fn invalidate_messages(&self, room_id: &RoomId) {
        self.cache
            .lock()
            .await
            .messages
            .retain(|(cached_room, _), _| cached_room != room_id);
    }

    pub async fn invalidate_notifications(&self) {
        self.cache.lock().await.notifications.clear();
    }
}

/// Checks the status and surfaces the backend's error envelope when there is
/// one.
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
        return Err(ApiException::from(api_error).into());
    }
    Err(anyhow!("request failed with status {status}"))
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let response = check(response).await?;
    Ok(response.json().await?)
}
