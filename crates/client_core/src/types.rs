use chrono::{DateTime, Utc};
use shared::domain::{BookingId, CompanyId, MessageId, RoomId, UserId, UserRole};
use shared::protocol::{MessagePayload, RoomSummary};
use uuid::Uuid;

/// Delivery state of a displayed message.
///
/// Optimistic placeholders carry a locally generated id until the server echo
/// arrives, so callers can tell the two apart without sentinel values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Delivery {
    Pending { local_id: Uuid },
    Confirmed { message_id: MessageId },
}

impl Delivery {
    pub fn pending() -> Self {
        Self::Pending {
            local_id: Uuid::new_v4(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Confirmed { message_id } => Some(message_id),
            Self::Pending { .. } => None,
        }
    }
}

/// One item of a conversation feed as shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub delivery: Delivery,
    pub sender_id: UserId,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
    /// A server-confirmed message, straight off the wire or a snapshot page.
    pub fn confirmed(payload: MessagePayload) -> Self {
        Self {
            delivery: Delivery::Confirmed {
                message_id: payload.message_id,
            },
            sender_id: payload.sender_id,
            body: payload.body,
            read: payload.read,
            created_at: payload.created_at,
            updated_at: payload.updated_at,
        }
    }

    /// An optimistic placeholder for a message just handed to the push
    /// channel. Marked read: the sender never sees their own text as unread.
    pub fn placeholder(sender_id: UserId, body: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            delivery: Delivery::pending(),
            sender_id,
            body: body.into(),
            read: true,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Who is signed in on this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub role: UserRole,
    /// Set for company operators, `None` for customers.
    pub company_id: Option<CompanyId>,
}

impl SessionIdentity {
    pub fn customer(user_id: UserId) -> Self {
        Self {
            user_id,
            role: UserRole::Customer,
            company_id: None,
        }
    }

    pub fn company(user_id: UserId, company_id: CompanyId) -> Self {
        Self {
            user_id,
            role: UserRole::Company,
            company_id: Some(company_id),
        }
    }
}

/// A conversation that does not have a room yet: the counterpart and booking
/// context captured when the caller opened it. The intent is destroyed as soon
/// as a matching room is discovered, via push event or snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingIntent {
    pub customer_id: Option<UserId>,
    pub company_id: Option<CompanyId>,
    pub booking_id: Option<BookingId>,
}

impl PendingIntent {
    /// True when `room` matches every field the intent pinned down. An empty
    /// intent matches nothing.
    pub fn matches(&self, room: &RoomSummary) -> bool {
        if self.customer_id.is_none() && self.company_id.is_none() && self.booking_id.is_none() {
            return false;
        }
        if let Some(customer_id) = &self.customer_id {
            if &room.customer_id != customer_id {
                return false;
            }
        }
        if let Some(company_id) = &self.company_id {
            if &room.company_id != company_id {
                return false;
            }
        }
        if let Some(booking_id) = &self.booking_id {
            if room.booking_id.as_ref() != Some(booking_id) {
                return false;
            }
        }
        true
    }

    /// Whether the intent names a counterpart for `identity`, i.e. whether a
    /// create-and-send request built from it would be routable.
    pub fn is_sendable(&self, identity: &SessionIdentity) -> bool {
        match identity.role {
            UserRole::Customer => self.company_id.is_some(),
            UserRole::Company => self.customer_id.is_some(),
        }
    }
}

/// State changes surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// The room list changed: refreshed, or a room was added.
    RoomsUpdated,
    /// A conversation feed changed. `room_id` is `None` for the pending
    /// conversation that has no room yet.
    ConversationUpdated { room_id: Option<RoomId> },
    /// A pending conversation resolved to a real room.
    RoomResolved { room: RoomSummary },
    /// The notification feed or its unread badge changed.
    NotificationsUpdated { unread: u64 },
    Error(String),
}
