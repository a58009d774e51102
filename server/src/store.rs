//! Player attribute and account storage
//!
//! The server only talks to storage through the [`AttributeStore`] and
//! [`AuthStore`] traits. The in-memory implementations here back the binary
//! and the tests; the attribute store keeps a cache layer in front of a
//! durable layer so the cache-then-durable lookup used by battles is real.

use crate::error::StoreError;
use log::{debug, info, warn};
use parking_lot::RwLock;
use shared::messages::PlayerAttr;
use shared::Uid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Experience needed to advance past `level`
pub fn exp_to_next_level(level: u32) -> u32 {
    100 * level
}

/// Outcome of an experience gain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpGain {
    pub new_level: u32,
    pub new_exp: u32,
    pub leveled_up: bool,
}

/// Applies `delta` experience to `attr`, levelling up as many times as it covers.
pub fn apply_exp(attr: &mut PlayerAttr, delta: u32) -> ExpGain {
    let mut exp = attr.exp.saturating_add(delta);
    let mut level = attr.level.max(1);
    let mut leveled_up = false;

    while exp >= exp_to_next_level(level) {
        exp -= exp_to_next_level(level);
        level += 1;
        leveled_up = true;
    }

    attr.level = level;
    attr.exp = exp;
    ExpGain {
        new_level: level,
        new_exp: exp,
        leveled_up,
    }
}

pub trait AttributeStore: Send + Sync {
    /// Loads the player's attributes, creating defaults for unknown players.
    fn load_or_create(&self, uid: Uid) -> Result<PlayerAttr, StoreError>;

    fn get(&self, uid: Uid) -> Result<Option<PlayerAttr>, StoreError>;

    /// Cache-only lookup; absent uids are simply missing from the result
    fn batch_get_cached(&self, uids: &[Uid]) -> Result<HashMap<Uid, PlayerAttr>, StoreError>;

    /// Durable lookup for uids the cache did not have
    fn batch_load_durable(&self, uids: &[Uid]) -> Result<HashMap<Uid, PlayerAttr>, StoreError>;

    /// Cache first, durable for the misses, merged.
    ///
    /// A failing layer contributes nothing instead of failing the lookup.
    fn batch_get(&self, uids: &[Uid]) -> HashMap<Uid, PlayerAttr> {
        let mut found = self.batch_get_cached(uids).unwrap_or_else(|e| {
            warn!("Cached attribute lookup failed: {}", e);
            HashMap::new()
        });

        let misses: Vec<Uid> = uids
            .iter()
            .copied()
            .filter(|uid| !found.contains_key(uid))
            .collect();
        if misses.is_empty() {
            return found;
        }

        match self.batch_load_durable(&misses) {
            Ok(loaded) => found.extend(loaded),
            Err(e) => warn!("Durable attribute lookup for {:?} failed: {}", misses, e),
        }
        found
    }

    fn apply_exp_gain(&self, uid: Uid, delta: u32) -> Result<ExpGain, StoreError>;

    /// Overwrites one numeric field (`level`, `exp`, `hp`, `mp` or `coin`).
    fn update(&self, uid: Uid, field: &str, value: u32) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginFailure {
    UnknownUser,
    WrongPassword,
    Unavailable(String),
}

impl LoginFailure {
    pub fn reason(&self) -> String {
        match self {
            LoginFailure::UnknownUser => "unknown user".to_string(),
            LoginFailure::WrongPassword => "wrong password".to_string(),
            LoginFailure::Unavailable(cause) => format!("auth unavailable: {}", cause),
        }
    }
}

pub trait AuthStore: Send + Sync {
    /// Creates an account and returns its uid.
    fn register(&self, name: &str, passwd: &str) -> Result<Uid, StoreError>;

    fn login(&self, uid: Uid, passwd: &str) -> Result<(), LoginFailure>;
}

/// Two-layer in-process attribute store.
///
/// Reads hit the cache first, fall through to the durable layer on a miss and
/// back-fill the cache. Writes go to both layers.
#[derive(Default)]
pub struct MemoryAttributeStore {
    cache: RwLock<HashMap<Uid, PlayerAttr>>,
    durable: RwLock<HashMap<Uid, PlayerAttr>>,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `attr` in the durable layer only, leaving the cache cold
    pub fn insert_durable(&self, attr: PlayerAttr) {
        self.durable.write().insert(attr.uid, attr);
    }

    /// Drops the cached copy of `uid`, simulating a cold cache
    pub fn evict_cache(&self, uid: Uid) {
        self.cache.write().remove(&uid);
    }

    pub fn is_cached(&self, uid: Uid) -> bool {
        self.cache.read().contains_key(&uid)
    }

    fn lookup(&self, uid: Uid) -> Option<PlayerAttr> {
        if let Some(attr) = self.cache.read().get(&uid) {
            return Some(attr.clone());
        }

        let attr = self.durable.read().get(&uid).cloned()?;
        debug!("Attribute cache miss for player {}, back-filling", uid);
        self.cache.write().insert(uid, attr.clone());
        Some(attr)
    }

    /// Read-modify-write of one record with both layers locked throughout,
    /// so concurrent changes to the same player never lose an update.
    fn modify<R, F>(&self, uid: Uid, change: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut PlayerAttr) -> Result<R, StoreError>,
    {
        // Cache before durable whenever both are held
        let mut cache = self.cache.write();
        let mut durable = self.durable.write();

        let mut attr = cache
            .get(&uid)
            .or_else(|| durable.get(&uid))
            .cloned()
            .ok_or(StoreError::NotFound(uid))?;
        let outcome = change(&mut attr)?;
        durable.insert(uid, attr.clone());
        cache.insert(uid, attr);
        Ok(outcome)
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn load_or_create(&self, uid: Uid) -> Result<PlayerAttr, StoreError> {
        if let Some(attr) = self.lookup(uid) {
            return Ok(attr);
        }

        let mut cache = self.cache.write();
        let mut durable = self.durable.write();
        // Another caller may have created it since the lookup
        if let Some(attr) = cache.get(&uid).or_else(|| durable.get(&uid)).cloned() {
            cache.insert(uid, attr.clone());
            return Ok(attr);
        }

        let attr = PlayerAttr::new_player(uid);
        info!("Created default attributes for player {}", uid);
        durable.insert(uid, attr.clone());
        cache.insert(uid, attr.clone());
        Ok(attr)
    }

    fn get(&self, uid: Uid) -> Result<Option<PlayerAttr>, StoreError> {
        Ok(self.lookup(uid))
    }

    fn batch_get_cached(&self, uids: &[Uid]) -> Result<HashMap<Uid, PlayerAttr>, StoreError> {
        let cache = self.cache.read();
        Ok(uids
            .iter()
            .filter_map(|uid| cache.get(uid).map(|attr| (*uid, attr.clone())))
            .collect())
    }

    fn batch_load_durable(&self, uids: &[Uid]) -> Result<HashMap<Uid, PlayerAttr>, StoreError> {
        let loaded: HashMap<Uid, PlayerAttr> = {
            let durable = self.durable.read();
            uids.iter()
                .filter_map(|uid| durable.get(uid).map(|attr| (*uid, attr.clone())))
                .collect()
        };

        let mut cache = self.cache.write();
        for (uid, attr) in &loaded {
            cache.insert(*uid, attr.clone());
        }
        Ok(loaded)
    }

    fn apply_exp_gain(&self, uid: Uid, delta: u32) -> Result<ExpGain, StoreError> {
        self.modify(uid, |attr| Ok(apply_exp(attr, delta)))
    }

    fn update(&self, uid: Uid, field: &str, value: u32) -> Result<(), StoreError> {
        let slot = |attr: &mut PlayerAttr| -> Result<(), StoreError> {
            match field {
                "level" => attr.level = value,
                "exp" => attr.exp = value,
                "hp" => attr.hp = value,
                "mp" => attr.mp = value,
                "coin" => attr.coin = value,
                other => return Err(StoreError::UnknownField(other.to_string())),
            }
            Ok(())
        };
        self.modify(uid, slot)
    }
}

struct Account {
    #[allow(dead_code)]
    name: String,
    passwd: String,
}

/// In-process account table handing out uids from 1 upwards
pub struct MemoryAuthStore {
    accounts: RwLock<HashMap<Uid, Account>>,
    next_uid: AtomicU32,
}

impl Default for MemoryAuthStore {
    fn default() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_uid: AtomicU32::new(1),
        }
    }
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an account with a fixed uid
    pub fn with_user(self, uid: Uid, name: &str, passwd: &str) -> Self {
        self.accounts.write().insert(
            uid,
            Account {
                name: name.to_string(),
                passwd: passwd.to_string(),
            },
        );
        self.next_uid.fetch_max(uid + 1, Ordering::SeqCst);
        self
    }
}

impl AuthStore for MemoryAuthStore {
    fn register(&self, name: &str, passwd: &str) -> Result<Uid, StoreError> {
        let uid = self.next_uid.fetch_add(1, Ordering::SeqCst);
        self.accounts.write().insert(
            uid,
            Account {
                name: name.to_string(),
                passwd: passwd.to_string(),
            },
        );
        info!("Registered account {} as uid {}", name, uid);
        Ok(uid)
    }

    fn login(&self, uid: Uid, passwd: &str) -> Result<(), LoginFailure> {
        match self.accounts.read().get(&uid) {
            None => Err(LoginFailure::UnknownUser),
            Some(account) if account.passwd != passwd => Err(LoginFailure::WrongPassword),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_defaults() {
        let store = MemoryAttributeStore::new();
        let attr = store.load_or_create(7).unwrap();
        assert_eq!(attr, PlayerAttr::new_player(7));
        assert!(store.is_cached(7));
        assert_eq!(store.get(7).unwrap(), Some(attr));
    }

    #[test]
    fn test_get_missing_player() {
        let store = MemoryAttributeStore::new();
        assert_eq!(store.get(99).unwrap(), None);
    }

    #[test]
    fn test_cold_cache_falls_through_and_backfills() {
        let store = MemoryAttributeStore::new();
        let mut attr = PlayerAttr::new_player(3);
        attr.hp = 40;
        store.insert_durable(attr);
        assert!(!store.is_cached(3));

        assert_eq!(store.get(3).unwrap().unwrap().hp, 40);
        assert!(store.is_cached(3));
    }

    #[test]
    fn test_batch_get_merges_layers() {
        let store = MemoryAttributeStore::new();
        store.load_or_create(1).unwrap();
        let mut cold = PlayerAttr::new_player(2);
        cold.mp = 5;
        store.insert_durable(cold);

        let found = store.batch_get(&[1, 2, 3]);
        assert_eq!(found.len(), 2);
        assert_eq!(found[&2].mp, 5);
        assert!(!found.contains_key(&3));
        assert!(store.is_cached(2));
    }

    #[test]
    fn test_exp_gain_without_level_up() {
        let store = MemoryAttributeStore::new();
        store.load_or_create(1).unwrap();

        let gain = store.apply_exp_gain(1, 40).unwrap();
        assert_eq!(
            gain,
            ExpGain {
                new_level: 1,
                new_exp: 40,
                leveled_up: false
            }
        );
    }

    #[test]
    fn test_exp_gain_loops_through_levels() {
        let store = MemoryAttributeStore::new();
        store.load_or_create(1).unwrap();

        // 100 for level 1, 200 for level 2, 50 left over at level 3
        let gain = store.apply_exp_gain(1, 350).unwrap();
        assert_eq!(gain.new_level, 3);
        assert_eq!(gain.new_exp, 50);
        assert!(gain.leveled_up);

        let attr = store.get(1).unwrap().unwrap();
        assert_eq!((attr.level, attr.exp), (3, 50));
    }

    #[test]
    fn test_concurrent_exp_gains_are_not_lost() {
        let store = std::sync::Arc::new(MemoryAttributeStore::new());
        store.load_or_create(1).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..5000 {
                        store.apply_exp_gain(1, 1).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let attr = store.get(1).unwrap().unwrap();
        let banked: u32 = (1..attr.level).map(exp_to_next_level).sum();
        assert_eq!(banked + attr.exp, 40_000);
        assert_eq!((attr.level, attr.exp), (28, 2200));
    }

    #[test]
    fn test_concurrent_creation_keeps_first_record() {
        let store = std::sync::Arc::new(MemoryAttributeStore::new());
        store.load_or_create(2).unwrap();
        store.apply_exp_gain(2, 30).unwrap();
        store.evict_cache(2);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.load_or_create(2).unwrap())
            })
            .collect();
        for thread in threads {
            assert_eq!(thread.join().unwrap().exp, 30);
        }
    }

    #[test]
    fn test_exp_gain_for_unknown_player() {
        let store = MemoryAttributeStore::new();
        assert_eq!(store.apply_exp_gain(5, 10), Err(StoreError::NotFound(5)));
    }

    #[test]
    fn test_update_field() {
        let store = MemoryAttributeStore::new();
        store.load_or_create(4).unwrap();
        store.update(4, "coin", 5).unwrap();
        assert_eq!(store.get(4).unwrap().unwrap().coin, 5);
        assert_eq!(
            store.update(4, "mana", 1),
            Err(StoreError::UnknownField("mana".to_string()))
        );
    }

    #[test]
    fn test_register_assigns_increasing_uids() {
        let auth = MemoryAuthStore::new();
        assert_eq!(auth.register("a", "x").unwrap(), 1);
        assert_eq!(auth.register("b", "y").unwrap(), 2);
        assert_eq!(auth.login(2, "y"), Ok(()));
    }

    #[test]
    fn test_login_failures() {
        let auth = MemoryAuthStore::new().with_user(7, "seven", "x");
        assert_eq!(auth.login(7, "x"), Ok(()));
        assert_eq!(auth.login(7, "nope"), Err(LoginFailure::WrongPassword));
        assert_eq!(auth.login(8, "x"), Err(LoginFailure::UnknownUser));
        assert_eq!(auth.register("next", "p").unwrap(), 8);
    }
}
