//! Live connection lookup for the arena server
//!
//! This module tracks every accepted connection and, once a player logs in,
//! which connection currently speaks for that player:
//! - Connection id allocation and registration on accept
//! - User binding on login, with a single active session per user
//! - Removal when a connection closes, without disturbing a newer session
//! - Targeted sends and broadcast to every logged-in player
//!
//! The two maps are guarded by independent locks. Sends never happen while a
//! lock is held; the target connections are collected first.

use crate::connection::{Connection, ConnectionId};
use log::{debug, info, warn};
use parking_lot::RwLock;
use shared::{encode_frame, encode_message, Message, MsgId, Uid};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Told about every logged-in connection that goes away.
///
/// Listeners are held weakly, so a listener that also owns the registry does
/// not keep it alive.
pub trait ReleaseListener: Send + Sync {
    /// Runs on a scheduler worker after `conn_id` has left both maps
    fn connection_released(&self, conn_id: ConnectionId, uid: Uid);
}

pub struct ConnectionRegistry {
    next_id: AtomicU64,
    by_conn: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    by_user: RwLock<HashMap<Uid, Arc<Connection>>>,
    listeners: RwLock<Vec<Weak<dyn ReleaseListener>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_conn: RwLock::new(HashMap::new()),
            by_user: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes `listener` to connection releases
    pub fn add_release_listener(&self, listener: Weak<dyn ReleaseListener>) {
        self.listeners.write().push(listener);
    }

    /// Hands out the next connection id; ids start at 1 and never repeat
    pub fn allocate_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add(&self, conn: Arc<Connection>) {
        debug!("Registering connection {}", conn.id());
        self.by_conn.write().insert(conn.id(), conn);
    }

    pub fn remove(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        self.by_conn.write().remove(&conn_id)
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        self.by_conn.read().get(&conn_id).cloned()
    }

    /// Binds `uid` to the connection, replacing any earlier session of that user.
    ///
    /// If the connection was already logged in as someone else, that older
    /// binding is dropped as well. A connection that is already closed is
    /// refused and false is returned, so no binding outlives its socket.
    pub fn bind_user(&self, uid: Uid, conn: &Arc<Connection>) -> bool {
        let mut by_user = self.by_user.write();
        // Checked under the user lock: a close that lands after this point
        // queues a release that will see the binding and remove it
        if conn.is_closed() {
            debug!("Refusing to bind user {} to closed connection {}", uid, conn.id());
            return false;
        }
        let previous_user = conn.bind_user(uid);

        if let Some(old_uid) = previous_user.filter(|old| *old != uid) {
            if by_user
                .get(&old_uid)
                .map_or(false, |bound| Arc::ptr_eq(bound, conn))
            {
                by_user.remove(&old_uid);
            }
        }
        if let Some(replaced) = by_user.insert(uid, Arc::clone(conn)) {
            if !Arc::ptr_eq(&replaced, conn) {
                info!(
                    "User {} moved from connection {} to {}",
                    uid,
                    replaced.id(),
                    conn.id()
                );
            }
        }
        true
    }

    pub fn unbind_user(&self, uid: Uid) -> Option<Arc<Connection>> {
        self.by_user.write().remove(&uid)
    }

    pub fn get_user(&self, uid: Uid) -> Option<Arc<Connection>> {
        self.by_user.read().get(&uid).cloned()
    }

    /// Removal run when a connection closes.
    ///
    /// The user binding is only dropped if it still points at this connection,
    /// so a newer session for the same user survives. Release listeners hear
    /// about every logged-in connection, whether or not it still held the
    /// binding.
    pub fn release(&self, conn_id: ConnectionId, uid: Option<Uid>) {
        self.by_conn.write().remove(&conn_id);

        if let Some(uid) = uid {
            {
                let mut by_user = self.by_user.write();
                if by_user.get(&uid).map_or(false, |bound| bound.id() == conn_id) {
                    by_user.remove(&uid);
                    info!("User {} went offline", uid);
                }
            }

            let listeners: Vec<Arc<dyn ReleaseListener>> = {
                let mut listeners = self.listeners.write();
                listeners.retain(|listener| listener.strong_count() > 0);
                listeners.iter().filter_map(Weak::upgrade).collect()
            };
            for listener in listeners {
                listener.connection_released(conn_id, uid);
            }
        }
        debug!("Connection {} released", conn_id);
    }

    /// Clears the heartbeat miss counter of a live connection
    pub fn reset_heartbeat(&self, conn_id: ConnectionId) -> bool {
        match self.get(conn_id) {
            Some(conn) => {
                conn.reset_heartbeat();
                true
            }
            None => false,
        }
    }

    /// Sends a raw payload to one connection. Returns false if it is gone.
    pub fn send_to(&self, conn_id: ConnectionId, msg_id: MsgId, payload: &[u8]) -> bool {
        let Some(conn) = self.get(conn_id) else {
            return false;
        };
        match encode_frame(msg_id.id(), payload) {
            Ok(frame) => {
                conn.send(frame);
                true
            }
            Err(e) => {
                warn!("Dropping message {:?} for connection {}: {}", msg_id, conn_id, e);
                false
            }
        }
    }

    /// Encodes and sends a typed record to one connection.
    pub fn send_message_to<M: Message>(&self, conn_id: ConnectionId, message: &M) -> bool {
        let Some(conn) = self.get(conn_id) else {
            return false;
        };
        match encode_message(message) {
            Ok(frame) => {
                conn.send(frame);
                true
            }
            Err(e) => {
                warn!("Dropping message {:?} for connection {}: {}", M::MSG_ID, conn_id, e);
                false
            }
        }
    }

    /// Sends to every user-bound connection and returns how many were reached.
    pub fn broadcast(&self, msg_id: MsgId, payload: &[u8]) -> usize {
        match encode_frame(msg_id.id(), payload) {
            Ok(frame) => self.broadcast_frame(frame),
            Err(e) => {
                warn!("Dropping broadcast {:?}: {}", msg_id, e);
                0
            }
        }
    }

    pub fn broadcast_message<M: Message>(&self, message: &M) -> usize {
        match encode_message(message) {
            Ok(frame) => self.broadcast_frame(frame),
            Err(e) => {
                warn!("Dropping broadcast {:?}: {}", M::MSG_ID, e);
                0
            }
        }
    }

    fn broadcast_frame(&self, frame: Vec<u8>) -> usize {
        let targets: Vec<Arc<Connection>> = self.by_user.read().values().cloned().collect();
        for conn in &targets {
            conn.send(frame.clone());
        }
        targets.len()
    }

    pub fn connection_count(&self) -> usize {
        self.by_conn.read().len()
    }

    pub fn online_count(&self) -> usize {
        self.by_user.read().len()
    }

    /// Closes every live connection, used on server shutdown
    pub fn close_all(&self) {
        let conns: Vec<Arc<Connection>> = self.by_conn.read().values().cloned().collect();
        info!("Closing {} connections", conns.len());
        for conn in conns {
            conn.close();
        }
    }
}
