//! Event bus envelope types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A logical pub/sub channel, scoped by role or entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    /// Receives everything.
    Admin,
    /// `order.*` events.
    Orders,
    /// `route.*` and `job.*` events.
    Routes,
    /// Prediction job and draft-ready events.
    Predictions,
    /// One driver's route and assignment events.
    Driver(Uuid),
    /// One customer's own order events.
    Customer(Uuid),
}

impl Room {
    pub fn as_wire(&self) -> String {
        match self {
            Room::Admin => "admin".to_string(),
            Room::Orders => "orders".to_string(),
            Room::Routes => "routes".to_string(),
            Room::Predictions => "predictions".to_string(),
            Room::Driver(id) => format!("driver:{}", id),
            Room::Customer(id) => format!("customer:{}", id),
        }
    }

    pub fn parse(s: &str) -> Option<Room> {
        match s {
            "admin" => Some(Room::Admin),
            "orders" => Some(Room::Orders),
            "routes" => Some(Room::Routes),
            "predictions" => Some(Room::Predictions),
            _ => {
                if let Some(id) = s.strip_prefix("driver:") {
                    return Uuid::parse_str(id).ok().map(Room::Driver);
                }
                if let Some(id) = s.strip_prefix("customer:") {
                    return Uuid::parse_str(id).ok().map(Room::Customer);
                }
                None
            }
        }
    }
}

impl Serialize for Room {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_wire())
    }
}

impl<'de> Deserialize<'de> for Room {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Room::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown room '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "order.updated")]
    OrderUpdated,
    #[serde(rename = "order.assigned")]
    OrderAssigned,
    #[serde(rename = "route.created")]
    RouteCreated,
    #[serde(rename = "route.updated")]
    RouteUpdated,
    #[serde(rename = "route.progress")]
    RouteProgress,
    #[serde(rename = "driver.location")]
    DriverLocation,
    #[serde(rename = "job.progress")]
    JobProgress,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "notification")]
    Notification,
}

/// The wire envelope: `{event_id, room, seq, kind, occurred_at, payload}`.
///
/// `seq` is assigned per room by the broker; `event_id` is stable across
/// redelivery so consumers can dedupe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: Uuid,
    pub room: Room,
    pub seq: u64,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// An event as produced by the state machine, before the broker assigns
/// per-room sequence numbers.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_id: Uuid,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventDraft {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

// ==========================================================================
// Client identity and messages
// ==========================================================================

/// Who a connecting client is, after the external surface authenticated it.
/// The broker derives joinable rooms from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Admin,
    Office,
    Driver(Uuid),
    Customer(Uuid),
}

impl ClientRole {
    /// The rooms this role may join.
    pub fn rooms(&self) -> Vec<Room> {
        match self {
            ClientRole::Admin => vec![Room::Admin, Room::Orders, Room::Routes, Room::Predictions],
            ClientRole::Office => vec![Room::Orders, Room::Routes, Room::Predictions],
            ClientRole::Driver(id) => vec![Room::Driver(*id)],
            ClientRole::Customer(id) => vec![Room::Customer(*id)],
        }
    }
}

/// Messages the broker pushes to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Joined {
        rooms: Vec<Room>,
        /// Oldest replayable sequence per room at join time.
        replay_floor: std::collections::HashMap<String, u64>,
    },
    Event(Event),
    #[serde(rename_all = "camelCase")]
    Heartbeat { server_time: DateTime<Utc> },
    /// The client's `last_seq` precedes the replay window; it must re-fetch
    /// authoritative state before resuming.
    #[serde(rename_all = "camelCase")]
    ReplayGap { room: Room },
    /// The connection exceeded its outbound queue and will be closed.
    #[serde(rename_all = "camelCase")]
    SlowConsumer,
}

/// Control messages a client sends after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    Resubscribe { rooms: Vec<Room> },
    #[serde(rename_all = "camelCase")]
    Ack { room: Room, seq: u64 },
}

// ==========================================================================
// Consumer-side dedupe
// ==========================================================================

/// Bounded window of recently seen event ids. Delivery is at-least-once, so
/// consumers run every event through this before applying it.
#[derive(Debug)]
pub struct DedupeWindow {
    seen: std::collections::HashSet<Uuid>,
    order: std::collections::VecDeque<Uuid>,
    capacity: usize,
}

impl DedupeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: std::collections::HashSet::with_capacity(capacity),
            order: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true the first time an id is seen, false on duplicates.
    pub fn first_seen(&mut self, event_id: Uuid) -> bool {
        if !self.seen.insert(event_id) {
            return false;
        }
        self.order.push_back(event_id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}
