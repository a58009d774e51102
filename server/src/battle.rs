//! Live combat for one room
//!
//! A battle holds the hp/mp of every participant behind a single lock. Once
//! started it ticks at a fixed interval: each tick pushes a state snapshot to
//! the members and checks whether at most one player is still standing. The
//! finishing check and every stat change share the lock, so a battle ends
//! exactly once and a finished battle never ticks or changes again.

use crate::connection_registry::ConnectionRegistry;
use crate::error::HandlerError;
use crate::room::Player;
use crate::store::AttributeStore;
use crate::timer::{RepeatingTimer, TimerControl};
use crate::utils::{apply_signed, timestamp_ms};
use log::{debug, info};
use parking_lot::Mutex;
use shared::messages::{BattleEnd, BattleStart, BattleSync, CombatState};
use shared::{Message, RoomId, Uid};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

/// What a skill does when cast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skill {
    pub id: u32,
    /// Change applied to the target's hp
    pub target_hp: i32,
    /// Mana the caster must have and spend
    pub mp_cost: u32,
}

pub const STRIKE: Skill = Skill {
    id: 1,
    target_hp: -10,
    mp_cost: 0,
};
pub const HEAVY_STRIKE: Skill = Skill {
    id: 2,
    target_hp: -25,
    mp_cost: 20,
};
pub const HEAL: Skill = Skill {
    id: 3,
    target_hp: 15,
    mp_cost: 10,
};

/// Looks up a skill by the id clients send in a battle action.
///
/// Unknown ids yield `None`; the handler turns that into a failed dispatch.
pub fn skill(id: u32) -> Option<Skill> {
    [STRIKE, HEAVY_STRIKE, HEAL]
        .into_iter()
        .find(|skill| skill.id == id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Combatant {
    hp: u32,
    mp: u32,
}

struct BattleState {
    combatants: HashMap<Uid, Combatant>,
    started: bool,
    finished: bool,
    winner: Option<Uid>,
    ticks: u64,
}

/// Combat instance for one room.
///
/// Shared as `Arc<Battle>` between the room registry, the handlers and its
/// own tick timer, which only holds a weak reference.
pub struct Battle {
    room_id: RoomId,
    players: Vec<Player>,
    registry: Arc<ConnectionRegistry>,
    tick_interval: Duration,
    state: Mutex<BattleState>,
    timer: Mutex<Option<RepeatingTimer>>,
}

impl Battle {
    /// Creates a battle for `players` with their baseline stats.
    ///
    /// Nothing is sent and no timer runs until [`Battle::start`].
    pub fn new(
        room_id: RoomId,
        players: Vec<Player>,
        registry: Arc<ConnectionRegistry>,
        tick_interval: Duration,
    ) -> Self {
        let combatants = players
            .iter()
            .map(|p| (p.uid, Combatant { hp: p.hp, mp: p.mp }))
            .collect();

        Self {
            room_id,
            players,
            registry,
            tick_interval,
            state: Mutex::new(BattleState {
                combatants,
                started: false,
                finished: false,
                winner: None,
                ticks: 0,
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Uids the battle started with, in room join order
    pub fn member_uids(&self) -> Vec<Uid> {
        self.players.iter().map(|p| p.uid).collect()
    }

    /// Whether `uid` was seated when the battle began
    pub fn is_member(&self, uid: Uid) -> bool {
        self.players.iter().any(|p| p.uid == uid)
    }

    /// Replaces the baseline stats with stored attributes.
    ///
    /// Cached entries are used first and the durable layer fills the gaps;
    /// players the store cannot resolve keep 100/50. Meant to run before the
    /// battle is visible to handlers; once started it does nothing, so live
    /// hp and mp are never overwritten.
    pub fn resolve_stats(&self, store: &dyn AttributeStore) {
        let stored = store.batch_get(&self.member_uids());

        let mut state = self.state.lock();
        if state.started || state.finished {
            return;
        }
        for player in &self.players {
            if let Some(attr) = stored.get(&player.uid) {
                state.combatants.insert(
                    player.uid,
                    Combatant {
                        hp: attr.hp,
                        mp: attr.mp,
                    },
                );
            }
        }
    }

    /// Announces the battle to its members and arms the tick timer.
    ///
    /// Calling this again, or after the battle finished, does nothing.
    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        {
            let mut state = self.state.lock();
            if state.started || state.finished {
                return;
            }
            state.started = true;
        }

        let uids = self.member_uids();
        info!(
            "Battle started in room {} with players {:?}",
            self.room_id, uids
        );
        self.send_to_members(&BattleStart {
            roomid: self.room_id,
            players: uids,
        });

        let weak: Weak<Battle> = Arc::downgrade(self);
        let timer = RepeatingTimer::start(runtime, self.tick_interval, move || {
            match weak.upgrade() {
                Some(battle) => battle.tick(),
                None => TimerControl::Stop,
            }
        });
        *self.timer.lock() = Some(timer);
    }

    /// One battle step: push a state snapshot, then end the battle if at most
    /// one player is alive.
    pub fn tick(&self) -> TimerControl {
        let (sync, end) = {
            let mut state = self.state.lock();
            if state.finished {
                return TimerControl::Stop;
            }
            state.ticks += 1;

            let states = self
                .players
                .iter()
                .filter_map(|p| {
                    state.combatants.get(&p.uid).map(|c| CombatState {
                        uid: p.uid,
                        hp: c.hp,
                        mp: c.mp,
                    })
                })
                .collect::<Vec<_>>();
            let alive: Vec<Uid> = states.iter().filter(|s| s.hp > 0).map(|s| s.uid).collect();

            let sync = BattleSync {
                roomid: self.room_id,
                states,
                timestamp: timestamp_ms(),
            };

            let end = if alive.len() <= 1 {
                state.finished = true;
                state.winner = alive.first().copied();
                Some(BattleEnd {
                    roomid: self.room_id,
                    winner: state.winner,
                })
            } else {
                None
            };
            (sync, end)
        };

        self.send_to_members(&sync);

        match end {
            Some(end) => {
                info!(
                    "Battle in room {} finished, winner {:?}",
                    self.room_id, end.winner
                );
                self.send_to_members(&end);
                self.cancel_timer();
                TimerControl::Stop
            }
            None => TimerControl::Continue,
        }
    }

    /// Adds signed deltas to a player's hp and mp, clamping at zero.
    ///
    /// Returns false for unknown players or a finished battle.
    pub fn apply_delta(&self, uid: Uid, hp_delta: i32, mp_delta: i32) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        match state.combatants.get_mut(&uid) {
            Some(c) => {
                c.hp = apply_signed(c.hp, hp_delta);
                c.mp = apply_signed(c.mp, mp_delta);
                true
            }
            None => false,
        }
    }

    /// Resolves `skill` from `caster` onto `target` atomically.
    pub fn cast(&self, caster: Uid, target: Uid, skill: Skill) -> Result<(), HandlerError> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(HandlerError::BattleNotFound(self.room_id));
        }

        let caster_state = *state.combatants.get(&caster).ok_or(HandlerError::NotInBattle {
            uid: caster,
            room: self.room_id,
        })?;
        if !state.combatants.contains_key(&target) {
            return Err(HandlerError::UnknownTarget(target));
        }
        if caster_state.hp == 0 {
            return Err(HandlerError::Defeated(caster));
        }
        if caster_state.mp < skill.mp_cost {
            return Err(HandlerError::InsufficientMana {
                need: skill.mp_cost,
                have: caster_state.mp,
            });
        }

        if let Some(c) = state.combatants.get_mut(&caster) {
            c.mp -= skill.mp_cost;
        }
        if let Some(t) = state.combatants.get_mut(&target) {
            t.hp = apply_signed(t.hp, skill.target_hp);
        }
        debug!(
            "Room {}: {} cast skill {} on {}",
            self.room_id, caster, skill.id, target
        );
        Ok(())
    }

    /// Current hp, or 0 for non-participants
    pub fn hp(&self, uid: Uid) -> u32 {
        self.state.lock().combatants.get(&uid).map_or(0, |c| c.hp)
    }

    /// Current mp, or 0 for non-participants
    pub fn mp(&self, uid: Uid) -> u32 {
        self.state.lock().combatants.get(&uid).map_or(0, |c| c.mp)
    }

    /// Snapshot in player order
    pub fn states(&self) -> Vec<CombatState> {
        let state = self.state.lock();
        self.players
            .iter()
            .filter_map(|p| {
                state.combatants.get(&p.uid).map(|c| CombatState {
                    uid: p.uid,
                    hp: c.hp,
                    mp: c.mp,
                })
            })
            .collect()
    }

    /// Set once by the finishing tick or by [`Battle::stop`]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Sole survivor of a finished battle; `None` while running, on a draw
    /// or after an external stop
    pub fn winner(&self) -> Option<Uid> {
        self.state.lock().winner
    }

    /// Ticks that actually ran, for tests and logging
    pub fn tick_count(&self) -> u64 {
        self.state.lock().ticks
    }

    /// Aborts the battle without a winner. No-op once finished.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.winner = None;
        }

        info!("Battle in room {} stopped", self.room_id);
        self.cancel_timer();
        self.send_to_members(&BattleEnd {
            roomid: self.room_id,
            winner: None,
        });
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }

    fn send_to_members<M: Message>(&self, message: &M) {
        for player in &self.players {
            self.registry.send_message_to(player.conn_id, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{eventually, harness, read_frame};
    use crate::store::MemoryAttributeStore;
    use shared::messages::{decode_payload, PlayerAttr};
    use shared::MsgId;

    fn attr(uid: Uid, hp: u32, mp: u32) -> PlayerAttr {
        let mut attr = PlayerAttr::new_player(uid);
        attr.hp = hp;
        attr.mp = mp;
        attr
    }

    fn offline_battle(players: &[Uid]) -> Battle {
        let players = players
            .iter()
            .map(|uid| Player::new(*uid, 1000 + *uid as u64))
            .collect();
        Battle::new(
            1,
            players,
            Arc::new(ConnectionRegistry::new()),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_skill_table() {
        assert_eq!(skill(1), Some(STRIKE));
        assert_eq!(skill(2).unwrap().mp_cost, 20);
        assert_eq!(skill(3).unwrap().target_hp, 15);
        assert_eq!(skill(4), None);
    }

    #[test]
    fn test_apply_delta_clamps_at_zero() {
        let battle = offline_battle(&[1, 2]);
        assert!(battle.apply_delta(1, -500, -500));
        assert_eq!((battle.hp(1), battle.mp(1)), (0, 0));
        assert!(battle.apply_delta(2, 15, 0));
        assert_eq!(battle.hp(2), 115);
    }

    #[test]
    fn test_apply_delta_unknown_player() {
        let battle = offline_battle(&[1, 2]);
        assert!(!battle.apply_delta(99, -10, 0));
        assert_eq!(battle.hp(99), 0);
    }

    #[test]
    fn test_tick_ends_battle_once() {
        let battle = offline_battle(&[1, 2]);
        assert_eq!(battle.tick(), TimerControl::Continue);

        battle.apply_delta(1, -100, 0);
        assert_eq!(battle.tick(), TimerControl::Stop);
        assert!(battle.is_finished());
        assert_eq!(battle.winner(), Some(2));
        assert_eq!(battle.tick_count(), 2);

        assert_eq!(battle.tick(), TimerControl::Stop);
        assert_eq!(battle.tick_count(), 2);
        assert!(!battle.apply_delta(2, -10, 0));
        assert_eq!(battle.hp(2), 100);
    }

    #[test]
    fn test_everyone_down_means_no_winner() {
        let battle = offline_battle(&[1, 2]);
        battle.apply_delta(1, -100, 0);
        battle.apply_delta(2, -100, 0);
        assert_eq!(battle.tick(), TimerControl::Stop);
        assert_eq!(battle.winner(), None);
    }

    #[test]
    fn test_cast_rules() {
        let battle = offline_battle(&[1, 2]);

        battle.cast(1, 2, STRIKE).unwrap();
        assert_eq!(battle.hp(2), 90);

        battle.cast(1, 2, HEAVY_STRIKE).unwrap();
        assert_eq!(battle.hp(2), 65);
        assert_eq!(battle.mp(1), 30);

        battle.cast(2, 2, HEAL).unwrap();
        assert_eq!(battle.hp(2), 80);
        assert_eq!(battle.mp(2), 40);

        battle.apply_delta(1, 0, -25);
        assert!(matches!(
            battle.cast(1, 2, HEAVY_STRIKE),
            Err(HandlerError::InsufficientMana { need: 20, have: 5 })
        ));
        assert!(matches!(
            battle.cast(9, 2, STRIKE),
            Err(HandlerError::NotInBattle { uid: 9, .. })
        ));
        assert!(matches!(
            battle.cast(1, 9, STRIKE),
            Err(HandlerError::UnknownTarget(9))
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let battle = offline_battle(&[1, 2]);
        battle.stop();
        battle.stop();
        assert!(battle.is_finished());
        assert_eq!(battle.winner(), None);
        assert_eq!(battle.tick(), TimerControl::Stop);
        assert_eq!(battle.tick_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_resolves_stats_from_both_layers() {
        let store = MemoryAttributeStore::new();
        store.load_or_create(1).unwrap();
        store.update(1, "hp", 70).unwrap();
        store.insert_durable(attr(2, 40, 5));

        let battle = Arc::new(offline_battle(&[1, 2, 3]));
        battle.resolve_stats(&store);
        battle.start(&Handle::current());
        battle.stop();

        assert_eq!(battle.hp(1), 70);
        assert_eq!((battle.hp(2), battle.mp(2)), (40, 5));
        // Unknown to the store: baseline stats
        assert_eq!((battle.hp(3), battle.mp(3)), (100, 50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_keeps_damage_dealt_before_it() {
        let store = MemoryAttributeStore::new();
        store.insert_durable(attr(1, 40, 50));

        let battle = Arc::new(offline_battle(&[1, 2]));
        battle.resolve_stats(&store);
        battle.cast(2, 1, STRIKE).unwrap();
        battle.start(&Handle::current());
        // Too late to reload: live stats win
        battle.resolve_stats(&store);
        battle.stop();

        assert_eq!(battle.hp(1), 30);
        assert_eq!(battle.hp(2), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_running_battle_pushes_and_terminates() {
        let h = harness(Duration::from_secs(60), 2);
        let (a_conn, mut a_peer) = h.connect();
        let (b_conn, _b_peer) = h.connect();

        let store = MemoryAttributeStore::new();
        store.insert_durable(attr(1, 10, 50));
        store.insert_durable(attr(2, 10, 50));

        let battle = Arc::new(Battle::new(
            5,
            vec![Player::new(1, a_conn.id()), Player::new(2, b_conn.id())],
            Arc::clone(&h.registry),
            Duration::from_millis(20),
        ));
        battle.resolve_stats(&store);
        battle.start(&Handle::current());

        let start = read_frame(&mut a_peer).await;
        assert_eq!(start.msg_id, MsgId::BattleStart.id());
        let start: BattleStart = decode_payload(&start.payload).unwrap();
        assert_eq!(start.players, vec![1, 2]);

        let sync = read_frame(&mut a_peer).await;
        assert_eq!(sync.msg_id, MsgId::BattleSync.id());
        let sync: BattleSync = decode_payload(&sync.payload).unwrap();
        assert_eq!(sync.roomid, 5);
        assert_eq!(sync.states[0], CombatState { uid: 1, hp: 10, mp: 50 });

        battle.apply_delta(1, -10, 0);
        assert!(eventually(|| battle.is_finished()).await);
        assert_eq!(battle.winner(), Some(2));

        let ticks = battle.tick_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(battle.tick_count(), ticks);

        // Drain syncs until the end notice arrives
        loop {
            let frame = read_frame(&mut a_peer).await;
            if frame.msg_id == MsgId::BattleEnd.id() {
                let end: BattleEnd = decode_payload(&frame.payload).unwrap();
                assert_eq!(end.winner, Some(2));
                break;
            }
            assert_eq!(frame.msg_id, MsgId::BattleSync.id());
        }
    }
}
