use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        BookingId, BookingStatus, CompanyId, MessageId, NotificationId, NotificationKind, RoomId,
        ShipmentId, ShipmentStatus, UserId,
    },
    error::ApiError,
};

/// Frames emitted by the client over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    SendMessage(SendMessageRequest),
}

/// Outbound send. With `room_id` the server appends to an existing room;
/// without it the identity fields let the server materialize the room first
/// (create-and-send).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<CompanyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
}

/// Events pushed by the server. Message delivery shares the channel with the
/// notification stream and room lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomCreated {
        room: RoomSummary,
    },
    MessageReceived {
        message: MessagePayload,
    },
    NotificationCreated {
        notification: NotificationPayload,
    },
    NotificationUpdated {
        notification: NotificationPayload,
    },
    NotificationDeleted {
        notification_id: NotificationId,
    },
    UnreadCountChanged {
        unread: u64,
    },
    Error(ApiError),
}

/// A conversation thread scoped to a (customer, company, optional booking)
/// tuple. Rooms are created server side and never deleted by this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub customer_id: UserId,
    pub company_id: CompanyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_id: NotificationId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub read: bool,
    /// Free-form backend metadata; carries the related booking or shipment
    /// id when the notification navigates somewhere on click.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn related_booking(&self) -> Option<BookingId> {
        self.metadata
            .get("booking_id")
            .and_then(|value| value.as_str())
            .map(BookingId::new)
    }

    pub fn related_shipment(&self) -> Option<ShipmentId> {
        self.metadata
            .get("shipment_id")
            .and_then(|value| value.as_str())
            .map(ShipmentId::new)
    }
}

/// One page of a listing plus the pagination metadata every list endpoint
/// returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            has_more: false,
            total_pages: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnreadCount {
    pub unread: u64,
}

/// Response of the REST create-room-and-send fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationCreated {
    pub room: RoomSummary,
    pub message: MessagePayload,
}

/// Filter for the notification listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationQuery {
    pub page: u32,
    pub limit: u32,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NotificationKind>,
}

impl Default for NotificationQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            unread_only: false,
            kind: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingSummary {
    pub booking_id: BookingId,
    pub reference: String,
    pub origin: String,
    pub destination: String,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentSummary {
    pub shipment_id: ShipmentId,
    pub booking_id: BookingId,
    pub status: ShipmentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanySummary {
    pub company_id: CompanyId,
    pub name: String,
}
