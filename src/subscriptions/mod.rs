//! Reference-counted broadcast rooms
//!
//! A room exists only while at least one join is outstanding, so checking for
//! subscribers is a single map lookup and emitting to an empty room costs
//! nothing beyond that lookup.

pub mod room;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub use room::{RoomKey, POWER_FLOW_ROOM};

pub type ClientId = Uuid;

/// A serialized frame ready to be written to a client socket
pub type Frame = Arc<str>;

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    room: &'a str,
    data: &'a T,
}

#[derive(Debug, Default)]
struct Room {
    refs: usize,
    /// Joins held per client; sums to `refs`
    members: HashMap<ClientId, usize>,
}

#[derive(Debug, Default)]
struct Registry {
    rooms: HashMap<String, Room>,
    clients: HashMap<ClientId, mpsc::Sender<Frame>>,
}

impl Registry {
    fn release(&mut self, client: ClientId, room_key: &str, all: bool) -> usize {
        let Some(room) = self.rooms.get_mut(room_key) else {
            return 0;
        };

        if let Some(held) = room.members.get_mut(&client) {
            let released = if all { *held } else { 1 };
            *held -= released;
            room.refs = room.refs.saturating_sub(released);
            if *held == 0 {
                room.members.remove(&client);
            }
        }

        let remaining = room.refs;
        if remaining == 0 {
            self.rooms.remove(room_key);
        }
        remaining
    }
}

/// Outcome of an emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Registry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected client and the channel its frames are written to
    pub fn connect(&self, sender: mpsc::Sender<Frame>) -> ClientId {
        let id = Uuid::new_v4();
        self.inner.lock().clients.insert(id, sender);
        debug!(client = %id, "client connected");
        id
    }

    /// Increment the room's reference count, creating it on first join
    ///
    /// Returns the new count, or `None` if the client is not connected.
    pub fn join(&self, client: ClientId, room: &RoomKey) -> Option<usize> {
        let key = room.to_string();
        let mut inner = self.inner.lock();
        if !inner.clients.contains_key(&client) {
            warn!(client = %client, room = %key, "join from unknown client ignored");
            return None;
        }
        let entry = inner.rooms.entry(key.clone()).or_default();
        entry.refs += 1;
        *entry.members.entry(client).or_insert(0) += 1;
        let refs = entry.refs;
        debug!(client = %client, room = %key, refs, "joined room");
        Some(refs)
    }

    /// Decrement the room's reference count, deleting the room at zero
    ///
    /// Leaving a room the client never joined changes nothing.
    pub fn leave(&self, client: ClientId, room: &RoomKey) -> usize {
        let key = room.to_string();
        let remaining = self.inner.lock().release(client, &key, false);
        debug!(client = %client, room = %key, refs = remaining, "left room");
        remaining
    }

    /// Drop a client and every join it still holds
    ///
    /// Returns the number of rooms the client was a member of.
    pub fn disconnect(&self, client: ClientId) -> usize {
        let mut inner = self.inner.lock();
        inner.clients.remove(&client);

        let joined: Vec<String> = inner
            .rooms
            .iter()
            .filter(|(_, room)| room.members.contains_key(&client))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &joined {
            inner.release(client, key, true);
        }
        debug!(client = %client, rooms = joined.len(), "client disconnected");
        joined.len()
    }

    pub fn has_members(&self, room: &RoomKey) -> bool {
        self.inner.lock().rooms.contains_key(&room.to_string())
    }

    pub fn member_count(&self, room: &RoomKey) -> usize {
        self.inner
            .lock()
            .rooms
            .get(&room.to_string())
            .map(|r| r.refs)
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Deliver `payload` to every member of `room`
    ///
    /// Returns false without serializing anything when the room has no
    /// subscribers. A client whose buffer is full misses this frame.
    pub fn emit<T: Serialize>(&self, room: &RoomKey, event: &str, payload: &T) -> bool {
        self.emit_counted(room, event, payload).is_some()
    }

    pub fn emit_counted<T: Serialize>(
        &self,
        room: &RoomKey,
        event: &str,
        payload: &T,
    ) -> Option<Delivery> {
        let key = room.to_string();
        let inner = self.inner.lock();
        let target = inner.rooms.get(&key)?;

        let frame: Frame = match serde_json::to_string(&Envelope {
            event,
            room: &key,
            data: payload,
        }) {
            Ok(s) => s.into(),
            Err(e) => {
                warn!(room = %key, error = %e, "failed to serialize payload");
                return None;
            }
        };

        let mut delivery = Delivery::default();
        for client in target.members.keys() {
            match inner.clients.get(client).map(|tx| tx.try_send(frame.clone())) {
                Some(Ok(())) => delivery.delivered += 1,
                Some(Err(e)) => {
                    debug!(client = %client, room = %key, error = %e, "dropping frame for slow client");
                    delivery.dropped += 1;
                }
                None => delivery.dropped += 1,
            }
        }
        Some(delivery)
    }
}
