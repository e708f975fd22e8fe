use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// `register` was called twice for the same connection. A protocol
    /// violation on the caller's side.
    #[error("connection already registered")]
    AlreadyRegistered,
}

/// Authoritative "who is live, where" view. Purely in-memory; rebuilt
/// from nothing on restart. All mutation goes through one mutex so
/// concurrent join/leave on the same room cannot corrupt the sets.
///
/// Invariants: no room entry with an empty member set is retained, and
/// nothing survives `unregister` for that connection.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Maps>,
}

#[derive(Default)]
struct Maps {
    user_by_conn: HashMap<Uuid, i64>,
    rooms_by_conn: HashMap<Uuid, HashSet<String>>,
    conns_by_room: HashMap<String, HashSet<Uuid>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: Uuid, user_id: i64) -> Result<(), RegistryError> {
        let mut maps = self.lock();
        if maps.user_by_conn.contains_key(&conn_id) {
            return Err(RegistryError::AlreadyRegistered);
        }
        maps.user_by_conn.insert(conn_id, user_id);
        Ok(())
    }

    /// Idempotent: joining a room already joined is a no-op.
    pub fn join(&self, conn_id: Uuid, room: &str) {
        let mut maps = self.lock();
        maps.rooms_by_conn
            .entry(conn_id)
            .or_default()
            .insert(room.to_string());
        maps.conns_by_room
            .entry(room.to_string())
            .or_default()
            .insert(conn_id);
    }

    /// Idempotent. A room left empty is discarded.
    pub fn leave(&self, conn_id: Uuid, room: &str) {
        let mut maps = self.lock();
        maps.remove_membership(conn_id, room);
    }

    /// Removes the connection from every room it belonged to, then the
    /// connection itself. Safe to call more than once.
    pub fn unregister(&self, conn_id: Uuid) {
        let mut maps = self.lock();
        if let Some(rooms) = maps.rooms_by_conn.remove(&conn_id) {
            for room in rooms {
                if let Some(members) = maps.conns_by_room.get_mut(&room) {
                    members.remove(&conn_id);
                    if members.is_empty() {
                        maps.conns_by_room.remove(&room);
                    }
                }
            }
        }
        maps.user_by_conn.remove(&conn_id);
    }

    /// Empty set for an unknown room — never an error.
    pub fn members_of(&self, room: &str) -> HashSet<Uuid> {
        self.lock()
            .conns_by_room
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, conn_id: Uuid) -> HashSet<String> {
        self.lock()
            .rooms_by_conn
            .get(&conn_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_member(&self, conn_id: Uuid, room: &str) -> bool {
        self.lock()
            .conns_by_room
            .get(room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub fn user_of(&self, conn_id: Uuid) -> Option<i64> {
        self.lock().user_by_conn.get(&conn_id).copied()
    }

    /// Every live connection for a user (multiple devices allowed).
    pub fn connections_of(&self, user_id: i64) -> Vec<Uuid> {
        self.lock()
            .user_by_conn
            .iter()
            .filter(|(_, uid)| **uid == user_id)
            .map(|(conn, _)| *conn)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Maps> {
        // A poisoned registry mutex means a panic mid-mutation; the
        // maps themselves are still structurally valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Maps {
    fn remove_membership(&mut self, conn_id: Uuid, room: &str) {
        if let Some(rooms) = self.rooms_by_conn.get_mut(&conn_id) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.rooms_by_conn.remove(&conn_id);
            }
        }
        if let Some(members) = self.conns_by_room.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.conns_by_room.remove(room);
            }
        }
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.conns_by_room.len()
    }
}
