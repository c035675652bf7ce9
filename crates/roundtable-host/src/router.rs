use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use roundtable::model::now_ms;

/// Longest room id a client may request.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// A registered room.
#[derive(Debug, Clone)]
pub struct RoomEntry {
    /// Address guests should dial.
    pub addr: String,
    /// Connection holding the registration.
    pub conn_id: u64,
    pub registered_at_ms: u64,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("room id {0} is already in use")]
    Taken(String),
    #[error("rendezvous at capacity")]
    Capacity,
    #[error("invalid room id: {0}")]
    InvalidId(String),
}

/// In-memory map from room id to host address.
///
/// Uses `DashMap` so connection tasks register and look up rooms without a
/// global lock.
pub struct Router {
    rooms: DashMap<String, RoomEntry>,
    max_rooms: usize,
}

impl Router {
    pub fn new(max_rooms: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            max_rooms,
        }
    }

    /// Register a room for `conn_id`. Without a requested id one is generated.
    /// Returns the room id.
    pub fn register(
        &self,
        requested: Option<String>,
        addr: String,
        conn_id: u64,
    ) -> Result<String, RegisterError> {
        if self.rooms.len() >= self.max_rooms {
            return Err(RegisterError::Capacity);
        }
        let entry = RoomEntry {
            addr,
            conn_id,
            registered_at_ms: now_ms(),
        };
        match requested {
            Some(room_id) => {
                validate_room_id(&room_id)?;
                match self.rooms.entry(room_id.clone()) {
                    Entry::Occupied(_) => Err(RegisterError::Taken(room_id)),
                    Entry::Vacant(slot) => {
                        slot.insert(entry);
                        Ok(room_id)
                    }
                }
            }
            None => loop {
                let room_id = generate_room_id();
                if let Entry::Vacant(slot) = self.rooms.entry(room_id.clone()) {
                    slot.insert(entry);
                    break Ok(room_id);
                }
            },
        }
    }

    /// Host address for `room_id`.
    pub fn lookup(&self, room_id: &str) -> Option<String> {
        self.rooms.get(room_id).map(|r| r.value().addr.clone())
    }

    /// Remove `room_id` if it is still held by `conn_id`.
    pub fn unregister(&self, room_id: &str, conn_id: u64) -> bool {
        self.rooms
            .remove_if(room_id, |_, entry| entry.conn_id == conn_id)
            .is_some()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

fn validate_room_id(room_id: &str) -> Result<(), RegisterError> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RegisterError::InvalidId(room_id.to_string()))
    }
}

/// Short id derived from a v4 UUID, easy to read out loud.
fn generate_room_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}
