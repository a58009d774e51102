//! Pre-battle lobby
//!
//! A room gathers players until it is full and every member has flagged
//! ready, at which point the room registry starts a battle for it. The room
//! then stays in `Fighting` and accepts no joins or leaves; once its battle is
//! over the registry hands out a fresh room under the same id.
//!
//! A waiting room whose last player leaves is retired: it refuses every later
//! join, and the registry replaces it the next time its id is entered.

use crate::connection::ConnectionId;
use log::{debug, info};
use parking_lot::Mutex;
use shared::{RoomId, Uid};
use std::collections::HashMap;

pub const BASE_HP: u32 = 100;
pub const BASE_MP: u32 = 50;

/// A seat in a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub uid: Uid,
    /// Connection the player joined from, used for room broadcasts
    pub conn_id: ConnectionId,
    /// Baseline stats, replaced by stored attributes when the battle starts
    pub hp: u32,
    pub mp: u32,
}

impl Player {
    pub fn new(uid: Uid, conn_id: ConnectionId) -> Self {
        Self {
            uid,
            conn_id,
            hp: BASE_HP,
            mp: BASE_MP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Waiting,
    Fighting,
}

/// Why a player could not join a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    Full,
    AlreadyMember,
    Fighting,
    /// Emptied and awaiting removal; retry with a fresh room
    Retired,
}

impl JoinRejection {
    /// Text sent back to the client in the enter-room ack
    pub fn reason(self) -> &'static str {
        match self {
            JoinRejection::Full => "room is full",
            JoinRejection::AlreadyMember => "already in room",
            JoinRejection::Fighting => "battle already started",
            JoinRejection::Retired => "room closed",
        }
    }
}

struct RoomState {
    status: RoomStatus,
    players: Vec<Player>,
    ready: HashMap<Uid, bool>,
    retired: bool,
}

/// Lobby aggregate. All state sits behind one lock.
pub struct Room {
    id: RoomId,
    capacity: usize,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(id: RoomId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            state: Mutex::new(RoomState {
                status: RoomStatus::Waiting,
                players: Vec::with_capacity(capacity),
                ready: HashMap::new(),
                retired: false,
            }),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn status(&self) -> RoomStatus {
        self.state.lock().status
    }

    /// Seats a player, not yet ready.
    ///
    /// Joining is refused once the battle has begun, for a uid that already
    /// holds a seat, and when every seat is taken. Rejections are normal
    /// outcomes reported to the client, not errors.
    pub fn add_player(&self, player: Player) -> Result<(), JoinRejection> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(JoinRejection::Retired);
        }
        if state.status == RoomStatus::Fighting {
            return Err(JoinRejection::Fighting);
        }
        if state.players.iter().any(|p| p.uid == player.uid) {
            return Err(JoinRejection::AlreadyMember);
        }
        if state.players.len() >= self.capacity {
            return Err(JoinRejection::Full);
        }

        info!("Player {} joined room {}", player.uid, self.id);
        state.ready.insert(player.uid, false);
        state.players.push(player);
        Ok(())
    }

    /// Takes a player out of a waiting room along with their ready flag.
    ///
    /// Returns false if the uid was not a member or the battle has already
    /// begun; fighters keep their seat until the battle is over.
    pub fn remove_player(&self, uid: Uid) -> bool {
        let mut state = self.state.lock();
        if state.status == RoomStatus::Fighting {
            return false;
        }
        let before = state.players.len();
        state.players.retain(|p| p.uid != uid);
        state.ready.remove(&uid);
        let removed = state.players.len() < before;
        if removed {
            info!("Player {} left room {}", uid, self.id);
        }
        removed
    }

    /// Updates a member's ready flag. Returns false for non-members.
    pub fn set_ready(&self, uid: Uid, ready: bool) -> bool {
        let mut state = self.state.lock();
        match state.ready.get_mut(&uid) {
            Some(flag) => {
                *flag = ready;
                debug!("Player {} in room {} ready={}", uid, self.id, ready);
                true
            }
            None => false,
        }
    }

    pub fn is_member(&self, uid: Uid) -> bool {
        self.state.lock().ready.contains_key(&uid)
    }

    /// Connection `uid` joined from, if seated
    pub fn member_conn(&self, uid: Uid) -> Option<ConnectionId> {
        self.state
            .lock()
            .players
            .iter()
            .find(|p| p.uid == uid)
            .map(|p| p.conn_id)
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().players.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().players.is_empty()
    }

    /// Retires the room if it is waiting with nobody in it.
    ///
    /// Returns true if the room is retired after the call.
    pub fn retire_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if !state.retired && state.status == RoomStatus::Waiting && state.players.is_empty() {
            state.retired = true;
            debug!("Room {} retired", self.id);
        }
        state.retired
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// True when every seat is taken and every member is ready.
    ///
    /// A partly filled room is never all-ready, even if everyone present has
    /// flagged ready.
    pub fn is_all_ready(&self) -> bool {
        let state = self.state.lock();
        state.players.len() >= self.capacity && state.ready.values().all(|ready| *ready)
    }

    /// Members in join order
    pub fn players_snapshot(&self) -> Vec<Player> {
        self.state.lock().players.clone()
    }

    /// Moves the room to `Fighting`, one way.
    ///
    /// Returns true only for the call that made the transition, which lets
    /// the registry use it to claim the right to start the battle.
    pub fn begin_battle(&self) -> bool {
        let mut state = self.state.lock();
        if state.retired || state.status == RoomStatus::Fighting {
            return false;
        }
        state.status = RoomStatus::Fighting;
        true
    }
}
