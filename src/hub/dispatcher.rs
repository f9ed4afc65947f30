//! The hub's single-writer state: connected clients, room membership, and
//! bounded history, all owned by one task and mutated only through the
//! command channel. This mirrors the control-plane worker pattern of
//! feeding a single owner task from an mpsc channel rather than sharing
//! the state behind a lock pool.

use super::message::{EventType, Message};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Identity the caller authenticated upstream of this crate. Role and
/// school are free-form tags used only for presence stats bucketing.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub role: String,
    pub school: Option<String>,
}

/// A live client registered with the dispatcher. `sender` feeds the
/// client's writer loop; dropping the last clone ends that loop.
pub(crate) struct ClientHandle {
    pub(crate) id: String,
    pub(crate) user: AuthenticatedUser,
    pub(crate) sender: mpsc::Sender<Message>,
    pub(crate) rooms: HashSet<String>,
    pub(crate) connected_at_millis: u64,
    pub(crate) last_activity: Arc<std::sync::atomic::AtomicU64>,
}

/// Snapshot returned by connection queries; does not expose the send channel.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub user_id: String,
    pub role: String,
    pub rooms: Vec<String>,
    pub connected_at_millis: u64,
}

/// A stored history entry: the message plus the room it was published to
/// (`None` for a hub-wide broadcast).
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message: Message,
    pub room: Option<String>,
    pub ingested_at_millis: u64,
}

/// Query filter for `GetHistory`. `limit` takes the most recent matches.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub user_id: Option<String>,
    pub event_type: Option<EventType>,
    pub room: Option<String>,
    pub since_millis: Option<u64>,
    pub limit: Option<usize>,
}

/// Point-in-time hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub messages_by_type: HashMap<String, u64>,
    pub room_member_counts: HashMap<String, u64>,
    pub start_time_millis: u64,
    pub last_activity_millis: u64,
    pub connections_by_role: HashMap<String, u64>,
    pub connections_by_school: HashMap<String, u64>,
}

/// Commands accepted by the dispatcher, one variant per operation named
/// in the hub's concurrency discipline.
pub(crate) enum Command {
    Register { client: ClientHandle },
    Unregister { client_id: String },
    JoinRoom { client_id: String, room: String },
    LeaveRoom { client_id: String, room: String },
    Broadcast { message: Message },
    RoomBroadcast { room: String, message: Message, exclude_client: Option<String> },
    DirectMessage { user_id: String, message: Message },
    ReapInactive { threshold_millis: u64 },
    GetConnections { reply: oneshot::Sender<Vec<ConnectionInfo>> },
    GetStats { reply: oneshot::Sender<HubStats> },
    GetRoomUsers { room: String, reply: oneshot::Sender<Vec<String>> },
    GetHistory { filter: HistoryFilter, reply: oneshot::Sender<Vec<StoredMessage>> },
}

pub(crate) struct Dispatcher {
    clients: HashMap<String, ClientHandle>,
    rooms: HashMap<String, HashSet<String>>,
    history: VecDeque<StoredMessage>,
    history_capacity: usize,
    client_buffer_size: usize,
    stats: HubStats,
    clock: Arc<dyn crate::clock::Clock>,
}

impl Dispatcher {
    pub(crate) fn new(history_capacity: usize, client_buffer_size: usize, clock: Arc<dyn crate::clock::Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            client_buffer_size,
            stats: HubStats { start_time_millis: now, last_activity_millis: now, ..Default::default() },
            clock,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        tracing::info!(event = "hub_dispatcher_stopped");
    }

    fn handle(&mut self, cmd: Command) {
        let now = self.clock.now_millis();
        self.stats.last_activity_millis = now;
        match cmd {
            Command::Register { client } => self.on_register(client, now),
            Command::Unregister { client_id } => self.on_unregister(&client_id, now),
            Command::JoinRoom { client_id, room } => self.on_join(&client_id, room),
            Command::LeaveRoom { client_id, room } => self.on_leave(&client_id, &room),
            Command::Broadcast { message } => self.on_broadcast(message, now),
            Command::RoomBroadcast { room, message, exclude_client } => {
                self.on_room_broadcast(room, message, exclude_client, now)
            }
            Command::DirectMessage { user_id, message } => self.on_direct(&user_id, message),
            Command::ReapInactive { threshold_millis } => self.on_reap(threshold_millis, now),
            Command::GetConnections { reply } => {
                let _ = reply.send(self.connections());
            }
            Command::GetStats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            Command::GetRoomUsers { room, reply } => {
                let users = self
                    .rooms
                    .get(&room)
                    .map(|ids| ids.iter().filter_map(|id| self.clients.get(id)).map(|c| c.user.id.clone()).collect())
                    .unwrap_or_default();
                let _ = reply.send(users);
            }
            Command::GetHistory { filter, reply } => {
                let _ = reply.send(self.query_history(&filter));
            }
        }
    }

    fn on_register(&mut self, client: ClientHandle, now: u64) {
        self.stats.total_connections += 1;
        self.stats.active_connections += 1;
        *self.stats.connections_by_role.entry(client.user.role.clone()).or_insert(0) += 1;
        if let Some(school) = &client.user.school {
            *self.stats.connections_by_school.entry(school.clone()).or_insert(0) += 1;
        }
        tracing::debug!(event = "hub_client_registered", client_id = %client.id, user_id = %client.user.id);
        self.clients.insert(client.id.clone(), client);
        let _ = now;
    }

    fn on_unregister(&mut self, client_id: &str, now: u64) {
        let Some(client) = self.clients.remove(client_id) else { return };
        self.stats.active_connections = self.stats.active_connections.saturating_sub(1);
        if let Some(count) = self.stats.connections_by_role.get_mut(&client.user.role) {
            *count = count.saturating_sub(1);
        }
        if let Some(school) = &client.user.school {
            if let Some(count) = self.stats.connections_by_school.get_mut(school) {
                *count = count.saturating_sub(1);
            }
        }
        for room in client.rooms.iter() {
            self.remove_from_room(room, client_id);
            let presence = Message::new(
                EventType::UserOffline,
                serde_json::json!({ "user_id": client.user.id, "room": room }),
                Some(client.user.id.clone()),
                Some(room.clone()),
            );
            self.dispatch_room(room, &presence, Some(client_id));
        }
        tracing::debug!(event = "hub_client_unregistered", client_id = %client_id);
        let _ = now;
    }

    fn on_join(&mut self, client_id: &str, room: String) {
        let Some(client) = self.clients.get_mut(client_id) else { return };
        if !client.rooms.insert(room.clone()) {
            return;
        }
        let user_id = client.user.id.clone();
        self.rooms.entry(room.clone()).or_default().insert(client_id.to_string());
        let presence = Message::new(
            EventType::UserOnline,
            serde_json::json!({ "user_id": user_id, "room": room }),
            Some(user_id),
            Some(room.clone()),
        );
        self.dispatch_room(&room, &presence, Some(client_id));
    }

    fn on_leave(&mut self, client_id: &str, room: &str) {
        let Some(client) = self.clients.get_mut(client_id) else { return };
        if !client.rooms.remove(room) {
            return;
        }
        let user_id = client.user.id.clone();
        self.remove_from_room(room, client_id);
        let presence = Message::new(
            EventType::UserOffline,
            serde_json::json!({ "user_id": user_id, "room": room }),
            Some(user_id),
            Some(room.to_string()),
        );
        self.dispatch_room(room, &presence, Some(client_id));
    }

    fn remove_from_room(&mut self, room: &str, client_id: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(client_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    fn on_broadcast(&mut self, message: Message, now: u64) {
        self.record_stats(&message);
        let recipients: Vec<String> = self.clients.keys().cloned().collect();
        for id in recipients {
            self.deliver(&id, &message);
        }
        self.push_history(StoredMessage { message, room: None, ingested_at_millis: now });
    }

    fn on_room_broadcast(&mut self, room: String, message: Message, exclude_client: Option<String>, now: u64) {
        self.record_stats(&message);
        self.dispatch_room(&room, &message, exclude_client.as_deref());
        self.push_history(StoredMessage { message, room: Some(room), ingested_at_millis: now });
    }

    fn on_direct(&mut self, user_id: &str, message: Message) {
        self.record_stats(&message);
        let target = self.clients.values().find(|c| c.user.id == user_id).map(|c| c.id.clone());
        if let Some(id) = target {
            self.deliver(&id, &message);
        }
    }

    fn on_reap(&mut self, threshold_millis: u64, now: u64) {
        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_sub(c.last_activity.load(std::sync::atomic::Ordering::Relaxed)) >= threshold_millis)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            tracing::info!(event = "hub_client_reaped", client_id = %id);
            self.on_unregister(&id, now);
        }
    }

    fn dispatch_room(&mut self, room: &str, message: &Message, exclude_client: Option<&str>) {
        let Some(members) = self.rooms.get(room).cloned() else { return };
        for id in members {
            if Some(id.as_str()) == exclude_client {
                continue;
            }
            self.deliver(&id, message);
        }
    }

    /// Non-blocking delivery. A full buffer means the client is slow and is
    /// evicted rather than allowed to back-pressure the whole hub; a closed
    /// channel means the client already disconnected.
    fn deliver(&mut self, client_id: &str, message: &Message) {
        let Some(client) = self.clients.get(client_id) else { return };
        match client.sender.try_send(message.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(event = "hub_slow_consumer_evicted", client_id = %client_id, buffer = self.client_buffer_size);
                let now = self.clock.now_millis();
                self.on_unregister(client_id, now);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let now = self.clock.now_millis();
                self.on_unregister(client_id, now);
            }
        }
    }

    fn record_stats(&mut self, message: &Message) {
        self.stats.total_messages += 1;
        *self.stats.messages_by_type.entry(message.event_type.to_string()).or_insert(0) += 1;
        self.stats.room_member_counts =
            self.rooms.iter().map(|(room, members)| (room.clone(), members.len() as u64)).collect();
    }

    fn push_history(&mut self, entry: StoredMessage) {
        self.history.push_back(entry);
        if self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }

    fn query_history(&self, filter: &HistoryFilter) -> Vec<StoredMessage> {
        let matches: Vec<StoredMessage> = self
            .history
            .iter()
            .filter(|entry| {
                filter.user_id.as_deref().map(|u| entry.message.user_id.as_deref() == Some(u)).unwrap_or(true)
                    && filter.event_type.as_ref().map(|t| &entry.message.event_type == t).unwrap_or(true)
                    && filter.room.as_deref().map(|r| entry.room.as_deref() == Some(r)).unwrap_or(true)
                    && filter.since_millis.map(|since| entry.ingested_at_millis >= since).unwrap_or(true)
            })
            .cloned()
            .collect();
        match filter.limit {
            Some(limit) if matches.len() > limit => matches[matches.len() - limit..].to_vec(),
            _ => matches,
        }
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.clients
            .values()
            .map(|c| ConnectionInfo {
                client_id: c.id.clone(),
                user_id: c.user.id.clone(),
                role: c.user.role.clone(),
                rooms: c.rooms.iter().cloned().collect(),
                connected_at_millis: c.connected_at_millis,
            })
            .collect()
    }
}
