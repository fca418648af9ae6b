//! Real-time event bus
//!
//! Room-scoped pub/sub with per-room total order, a bounded replay window
//! for reconnecting clients, bounded per-connection outbound queues, and a
//! presence ring for driver positions. The broker is in-process: transports
//! (websocket or otherwise) sit outside the core and drive `connect` /
//! `disconnect` / `publish` through channels.

pub mod presence;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{ClientRole, Event, EventDraft, Room, ServerMessage};

use presence::Presence;

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Hard cap on live connections.
    pub max_connections: usize,
    /// Outbound events queued per connection before it is dropped.
    pub queue_capacity: usize,
    /// Replay retention per room: number of events.
    pub replay_events: usize,
    /// Replay retention per room: age.
    pub replay_age: Duration,
    /// Heartbeat interval.
    pub heartbeat: Duration,
    /// How long room membership survives a disconnect.
    pub disconnect_grace: Duration,
    /// Position samples retained per driver.
    pub presence_samples: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            queue_capacity: 256,
            replay_events: 1000,
            replay_age: Duration::from_secs(15 * 60),
            heartbeat: Duration::from_secs(20),
            disconnect_grace: Duration::from_secs(60),
            presence_samples: 32,
        }
    }
}

struct RoomState {
    /// Last assigned sequence number; the first event gets 1.
    last_seq: u64,
    /// Replay ring: events with their insertion instants.
    replay: VecDeque<(Event, Instant)>,
    members: HashSet<Uuid>,
}

impl RoomState {
    fn new() -> Self {
        Self { last_seq: 0, replay: VecDeque::new(), members: HashSet::new() }
    }

    /// Oldest replayable sequence, or `last_seq + 1` when the ring is empty.
    fn replay_floor(&self) -> u64 {
        self.replay.front().map(|(e, _)| e.seq).unwrap_or(self.last_seq + 1)
    }
}

struct ConnectionState {
    role: ClientRole,
    tx: mpsc::Sender<ServerMessage>,
    /// Set on disconnect; membership survives until the grace expires.
    disconnected_at: Option<Instant>,
    /// Last acked sequence per room, used to resume without a cursor.
    acked: HashMap<Room, u64>,
}

/// A live client connection as handed to the transport layer.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub rooms: Vec<Room>,
    /// Replayed and signalling messages to deliver before live streaming.
    pub backlog: Vec<ServerMessage>,
    pub rx: mpsc::Receiver<ServerMessage>,
}

struct BusInner {
    config: BusConfig,
    rooms: RwLock<HashMap<Room, RoomState>>,
    connections: RwLock<HashMap<Uuid, ConnectionState>>,
    presence: Presence,
}

/// The broker. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let presence = Presence::new(config.presence_samples);
        Self {
            inner: Arc::new(BusInner {
                config,
                rooms: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                presence,
            }),
        }
    }

    pub fn presence(&self) -> &Presence {
        &self.inner.presence
    }

    // ----------------------------------------------------------------------
    // Connection lifecycle
    // ----------------------------------------------------------------------

    /// Join a pre-authenticated client. `last_seq` carries the client's
    /// per-room cursors (wire room names); rooms outside the role's scope
    /// are ignored. Fails with `Conflict` at the connection cap.
    pub fn connect(&self, role: ClientRole, last_seq: &HashMap<String, u64>) -> CoreResult<Connection> {
        if self.inner.connections.read().len() >= self.inner.config.max_connections {
            return Err(CoreError::conflict("connection limit reached", vec![]));
        }
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity);
        let allowed = role.rooms();

        let mut backlog = Vec::new();
        let mut replay_floor = HashMap::new();
        {
            // Membership and replay under one write lock so no event slips
            // between the snapshot and live streaming.
            let mut rooms = self.inner.rooms.write();
            for room in &allowed {
                let state = rooms.entry(*room).or_insert_with(RoomState::new);
                state.members.insert(id);
                replay_floor.insert(room.as_wire(), state.replay_floor());

                if let Some(&cursor) = last_seq.get(&room.as_wire()) {
                    self.replay_into(state, *room, cursor, &mut backlog);
                }
            }
        }

        backlog.insert(0, ServerMessage::Joined { rooms: allowed.clone(), replay_floor });

        self.inner.connections.write().insert(
            id,
            ConnectionState { role, tx, disconnected_at: None, acked: HashMap::new() },
        );

        debug!("client connected: {} rooms, {} backlog messages", allowed.len(), backlog.len());
        Ok(Connection { id, rooms: allowed, backlog, rx })
    }

    fn replay_into(
        &self,
        state: &RoomState,
        room: Room,
        cursor: u64,
        backlog: &mut Vec<ServerMessage>,
    ) {
        if cursor >= state.last_seq {
            // Up to date (or the broker restarted and the cursor is from a
            // previous lifetime).
            if cursor > state.last_seq {
                backlog.push(ServerMessage::ReplayGap { room });
            }
            return;
        }
        if cursor + 1 < state.replay_floor() {
            backlog.push(ServerMessage::ReplayGap { room });
            return;
        }
        for (event, _) in state.replay.iter().filter(|(e, _)| e.seq > cursor) {
            backlog.push(ServerMessage::Event(event.clone()));
        }
    }

    /// Mark a connection disconnected. Membership is retained for the grace
    /// period so a quick reconnect can resume.
    pub fn disconnect(&self, conn_id: Uuid) {
        let mut connections = self.inner.connections.write();
        if let Some(state) = connections.get_mut(&conn_id) {
            state.disconnected_at = Some(Instant::now());
        }
    }

    /// Resume a recently disconnected connection without re-authentication.
    /// Fails with `Conflict` when the grace window has passed.
    pub fn resume(&self, conn_id: Uuid, last_seq: &HashMap<String, u64>) -> CoreResult<Connection> {
        let (role, within_grace, acked) = {
            let mut connections = self.inner.connections.write();
            let (role, within_grace) = match connections.get(&conn_id) {
                Some(state) => (
                    state.role,
                    state
                        .disconnected_at
                        .map_or(true, |at| at.elapsed() < self.inner.config.disconnect_grace),
                ),
                None => return Err(CoreError::conflict("unknown connection", vec![conn_id])),
            };
            let acked = connections.remove(&conn_id).map(|s| s.acked).unwrap_or_default();
            (role, within_grace, acked)
        };
        // Membership edits take the rooms lock; never while holding the
        // connections lock (publish acquires them the other way around).
        self.drop_membership(conn_id);
        if !within_grace {
            return Err(CoreError::conflict("reconnect grace expired", vec![conn_id]));
        }

        // Explicit cursors win; acked sequences fill the gaps for rooms the
        // client did not mention.
        let mut cursors = last_seq.clone();
        for (room, seq) in acked {
            cursors.entry(room.as_wire()).or_insert(seq);
        }
        self.connect(role, &cursors)
    }

    /// Record a client ack for a room cursor.
    pub fn ack(&self, conn_id: Uuid, room: Room, seq: u64) {
        if let Some(state) = self.inner.connections.write().get_mut(&conn_id) {
            let cursor = state.acked.entry(room).or_insert(0);
            *cursor = (*cursor).max(seq);
        }
    }

    /// Drop expired disconnected members; called from the heartbeat tick.
    pub fn sweep(&self) {
        let grace = self.inner.config.disconnect_grace;
        let expired: Vec<Uuid> = {
            let connections = self.inner.connections.read();
            connections
                .iter()
                .filter(|(_, s)| s.disconnected_at.map_or(false, |at| at.elapsed() >= grace))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            self.inner.connections.write().remove(&id);
            self.drop_membership(id);
        }
    }

    fn drop_membership(&self, conn_id: Uuid) {
        let mut rooms = self.inner.rooms.write();
        for state in rooms.values_mut() {
            state.members.remove(&conn_id);
        }
    }

    /// Number of live (not disconnect-pending) connections.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .values()
            .filter(|s| s.disconnected_at.is_none())
            .count()
    }

    // ----------------------------------------------------------------------
    // Publishing
    // ----------------------------------------------------------------------

    /// Publish one logical event into each room. The event id is stable
    /// across rooms; each room assigns its own sequence number. Returns the
    /// per-room sequence numbers.
    pub fn publish(&self, rooms: &[Room], draft: EventDraft) -> Vec<(Room, u64)> {
        let mut published = Vec::with_capacity(rooms.len());
        let mut sends: Vec<(Uuid, ServerMessage)> = Vec::new();

        {
            let mut room_map = self.inner.rooms.write();
            let now = Instant::now();
            for room in rooms {
                let state = room_map.entry(*room).or_insert_with(RoomState::new);
                state.last_seq += 1;
                let event = Event {
                    event_id: draft.event_id,
                    room: *room,
                    seq: state.last_seq,
                    kind: draft.kind,
                    occurred_at: draft.occurred_at,
                    payload: draft.payload.clone(),
                };

                state.replay.push_back((event.clone(), now));
                while state.replay.len() > self.inner.config.replay_events {
                    state.replay.pop_front();
                }
                while state
                    .replay
                    .front()
                    .map_or(false, |(_, at)| now.duration_since(*at) > self.inner.config.replay_age)
                {
                    state.replay.pop_front();
                }

                for member in &state.members {
                    sends.push((*member, ServerMessage::Event(event.clone())));
                }
                published.push((*room, state.last_seq));
            }
        }

        // Send with the room lock released.
        self.fan_out(sends);
        published
    }

    fn fan_out(&self, sends: Vec<(Uuid, ServerMessage)>) {
        let mut slow: Vec<Uuid> = Vec::new();
        {
            let connections = self.inner.connections.read();
            for (conn_id, message) in sends {
                let Some(state) = connections.get(&conn_id) else { continue };
                if state.disconnected_at.is_some() {
                    continue;
                }
                match state.tx.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("dropping slow consumer {}", conn_id);
                        slow.push(conn_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => slow.push(conn_id),
                }
            }
        }
        for conn_id in slow {
            // Best-effort close signal; the client reconnects and replays.
            if let Some(state) = self.inner.connections.write().remove(&conn_id) {
                let _ = state.tx.try_send(ServerMessage::SlowConsumer);
            }
            self.drop_membership(conn_id);
        }
    }

    /// Current sequence number of a room (0 when never written).
    pub fn room_seq(&self, room: Room) -> u64 {
        self.inner.rooms.read().get(&room).map_or(0, |s| s.last_seq)
    }

    // ----------------------------------------------------------------------
    // Heartbeat
    // ----------------------------------------------------------------------

    /// Spawn the heartbeat task: pings every live connection and sweeps
    /// expired memberships. Aborts with the returned handle.
    pub fn start_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(bus.inner.config.heartbeat);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                bus.sweep();
                let sends: Vec<(Uuid, ServerMessage)> = {
                    let connections = bus.inner.connections.read();
                    connections
                        .iter()
                        .filter(|(_, s)| s.disconnected_at.is_none())
                        .map(|(id, _)| {
                            (*id, ServerMessage::Heartbeat { server_time: Utc::now() })
                        })
                        .collect()
                };
                bus.fan_out(sends);
            }
        })
    }
}
