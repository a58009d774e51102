//! Owner of every room and battle on the server.
//!
//! Rooms are created on first entry and live in one map, battles in another,
//! each behind its own lock. When both are needed the room map is always
//! locked first. The maps are never held while working across several rooms;
//! each room is locked on its own.
//!
//! A waiting room that loses its last player is retired and dropped, and a
//! room whose battle is over is replaced by a fresh one the next time a player
//! enters it, so room ids can be played again.

use crate::battle::Battle;
use crate::config::ServerConfig;
use crate::connection::ConnectionId;
use crate::connection_registry::{ConnectionRegistry, ReleaseListener};
use crate::room::{JoinRejection, Player, Room, RoomStatus};
use crate::store::AttributeStore;
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{encode_frame, MsgId, RoomId, Uid};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<Room>>>,
    battles: Mutex<HashMap<RoomId, Arc<Battle>>>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn AttributeStore>,
    runtime: Handle,
    room_capacity: usize,
    battle_tick: Duration,
}

impl RoomRegistry {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn AttributeStore>,
        runtime: Handle,
        config: &ServerConfig,
    ) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            battles: Mutex::new(HashMap::new()),
            registry,
            store,
            runtime,
            room_capacity: config.room_capacity,
            battle_tick: config.battle_tick,
        }
    }

    /// Subscribes to connection releases so disconnected players leave the
    /// rooms they were waiting in.
    pub fn watch_releases(self: &Arc<Self>) {
        let listener: Weak<RoomRegistry> = Arc::downgrade(self);
        self.registry.add_release_listener(listener);
    }

    /// Returns the room, creating it with the configured capacity if needed.
    ///
    /// A retired room, or one whose battle has finished, is swapped for an
    /// empty one and any old battle is forgotten.
    pub fn get_or_create(&self, room_id: RoomId) -> Arc<Room> {
        let mut rooms = self.rooms.lock();
        match rooms.get(&room_id) {
            Some(room) if room.is_retired() => debug!("Replacing retired room {}", room_id),
            Some(room) if self.battle_is_over(room) => {
                self.battles.lock().remove(&room_id);
                info!("Reopened room {} after its battle", room_id);
            }
            Some(room) => return Arc::clone(room),
            None => info!("Created room {}", room_id),
        }

        let room = Arc::new(Room::new(room_id, self.room_capacity));
        rooms.insert(room_id, Arc::clone(&room));
        room
    }

    /// Seats `player` in the room, creating or reopening it first.
    ///
    /// A room retired between lookup and join is replaced and the join tried
    /// again, so a player is never seated in a room on its way out.
    pub fn join(&self, room_id: RoomId, player: Player) -> Result<Arc<Room>, JoinRejection> {
        loop {
            let room = self.get_or_create(room_id);
            match room.add_player(player.clone()) {
                Ok(()) => return Ok(room),
                Err(JoinRejection::Retired) => continue,
                Err(rejection) => return Err(rejection),
            }
        }
    }

    fn battle_is_over(&self, room: &Room) -> bool {
        room.status() == RoomStatus::Fighting
            && self
                .battles
                .lock()
                .get(&room.id())
                .map_or(false, |battle| battle.is_finished())
    }

    pub fn get_room(&self, room_id: RoomId) -> Option<Arc<Room>> {
        self.rooms.lock().get(&room_id).cloned()
    }

    /// The room's battle, running or finished, until the room is reopened
    pub fn get_battle(&self, room_id: RoomId) -> Option<Arc<Battle>> {
        self.battles.lock().get(&room_id).cloned()
    }

    /// Starts the room's battle unless one already exists.
    ///
    /// Returns true only for the call that actually started it: the room's
    /// one-way move to `Fighting` picks the winner among concurrent callers.
    /// Stats are resolved and the battle announced before it is published,
    /// so no battle action can reach it while it still holds baseline stats.
    pub fn start_battle(&self, room_id: RoomId) -> bool {
        let Some(room) = self.get_room(room_id) else {
            warn!("Cannot start battle in missing room {}", room_id);
            return false;
        };
        if !room.begin_battle() {
            debug!("Battle for room {} already exists", room_id);
            return false;
        }

        let battle = Arc::new(Battle::new(
            room_id,
            room.players_snapshot(),
            Arc::clone(&self.registry),
            self.battle_tick,
        ));
        battle.resolve_stats(self.store.as_ref());
        battle.start(&self.runtime);
        self.battles.lock().insert(room_id, battle);
        true
    }

    /// Removes `uid` from every waiting room it joined from `conn_id`.
    ///
    /// Seats taken from a newer connection of the same user are left alone,
    /// as are rooms already fighting. Returns how many rooms were left.
    pub fn leave_waiting_rooms(&self, uid: Uid, conn_id: ConnectionId) -> usize {
        let snapshot: Vec<Arc<Room>> = self.rooms.lock().values().cloned().collect();
        let mut left = 0;

        for room in snapshot {
            if room.member_conn(uid) != Some(conn_id) || !room.remove_player(uid) {
                continue;
            }
            left += 1;
            if room.retire_if_empty() {
                self.drop_retired(&room);
            }
        }
        left
    }

    fn drop_retired(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.lock();
        if rooms.get(&room.id()).map_or(false, |current| Arc::ptr_eq(current, room)) {
            rooms.remove(&room.id());
            debug!("Dropped empty room {}", room.id());
        }
    }

    /// Sends a raw payload to every member of the room. Returns how many were reached.
    pub fn broadcast_room(&self, room_id: RoomId, msg_id: MsgId, payload: &[u8]) -> usize {
        let Some(room) = self.get_room(room_id) else {
            return 0;
        };
        let frame = match encode_frame(msg_id.id(), payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping room {} broadcast {:?}: {}", room_id, msg_id, e);
                return 0;
            }
        };

        room.players_snapshot()
            .iter()
            .filter_map(|player| self.registry.get(player.conn_id))
            .map(|conn| conn.send(frame.clone()))
            .count()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn battle_count(&self) -> usize {
        self.battles.lock().len()
    }

    /// Stops every battle still running, used on shutdown
    pub fn stop_all(&self) {
        let battles: Vec<Arc<Battle>> = self.battles.lock().values().cloned().collect();
        for battle in battles {
            battle.stop();
        }
    }
}

impl ReleaseListener for RoomRegistry {
    fn connection_released(&self, conn_id: ConnectionId, uid: Uid) {
        let left = self.leave_waiting_rooms(uid, conn_id);
        if left > 0 {
            info!("Player {} left {} waiting room(s) on disconnect", uid, left);
        }
    }
}
