//! In-process [`RemoteStore`] backed by a locked hash map.
//!
//! Expiries are measured on [`tokio::time::Instant`], so a test that pauses
//! the runtime clock can fast-forward past a TTL with `tokio::time::advance`.
//! Expired entries are hidden on read. They are physically dropped by every
//! `scan`, by every [`PURGE_EVERY`]th write batch, and by
//! [`MemoryStore::purge_expired`], so the map does not grow with dead keys.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;
use tracing::warn;

use super::{BoxFuture, Command, Pipeline, RemoteStore, StoreError, StoreResult};

/// Write batches between two expiry purges.
pub const PURGE_EVERY: u64 = 128;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// An in-memory store with TTLs, sets, and glob enumeration.
///
/// # Examples
///
/// ```
/// use rcache::store::{MemoryStore, RemoteStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store.set("user:1:profile", b"{}".to_vec()).await.unwrap();
/// assert_eq!(store.get("user:1:profile").await.unwrap(), Some(b"{}".to_vec()));
/// assert!(store.supports_enumeration());
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Slot>>,
    enumeration: bool,
    offline: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store that supports key enumeration.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            enumeration: true,
            offline: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Creates a store that behaves like a pure KV backend without `SCAN`.
    pub fn without_enumeration() -> Self {
        Self {
            enumeration: false,
            ..Self::new()
        }
    }

    /// Simulates an outage: while offline every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Number of live entries, sets included.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.read("len").values().filter(|s| s.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a key, `None` if it is absent or has no expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.read("ttl")
            .get(key)
            .filter(|s| s.is_live(now))
            .and_then(|s| s.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Drops every expired slot, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        Self::purge(&mut self.write("purge_expired"), now)
    }

    fn purge(entries: &mut HashMap<String, Slot>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, slot| slot.is_live(now));
        before - entries.len()
    }

    /// Slots held, expired ones included.
    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.read("slot_count").len()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn read(&self, op: &'static str) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(op, store = "memory", lock_kind = "rwlock.read", "recovered from poisoned store lock");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self, op: &'static str) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(op, store = "memory", lock_kind = "rwlock.write", "recovered from poisoned store lock");
                poisoned.into_inner()
            }
        }
    }

    fn get_now(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_online()?;
        let now = Instant::now();
        match self.read("get").get(key) {
            Some(slot) if slot.is_live(now) => match &slot.value {
                Value::Bytes(bytes) => Ok(Some(bytes.clone())),
                Value::Set(_) => Err(StoreError::Protocol(format!(
                    "key {key} holds a set, not a value"
                ))),
            },
            _ => Ok(None),
        }
    }

    fn apply(entries: &mut HashMap<String, Slot>, command: Command, now: Instant) -> StoreResult<u64> {
        match command {
            Command::Set { key, value, ttl } => {
                entries.insert(
                    key,
                    Slot {
                        value: Value::Bytes(value),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
                Ok(0)
            }
            Command::Delete { keys } => {
                let mut removed = 0;
                for key in keys {
                    if entries.remove(&key).is_some_and(|slot| slot.is_live(now)) {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            Command::SetAdd { key, members } => {
                let slot = entries
                    .entry(key.clone())
                    .and_modify(|slot| {
                        if !slot.is_live(now) {
                            *slot = Slot {
                                value: Value::Set(BTreeSet::new()),
                                expires_at: None,
                            };
                        }
                    })
                    .or_insert_with(|| Slot {
                        value: Value::Set(BTreeSet::new()),
                        expires_at: None,
                    });
                match &mut slot.value {
                    Value::Set(set) => {
                        set.extend(members);
                        Ok(0)
                    }
                    Value::Bytes(_) => Err(StoreError::Protocol(format!(
                        "key {key} holds a value, not a set"
                    ))),
                }
            }
        }
    }

    fn exec_now(&self, commands: Vec<Command>) -> StoreResult<u64> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.write("exec");
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            Self::purge(&mut entries, now);
        }
        let mut total = 0;
        for command in commands {
            total += Self::apply(&mut entries, command, now)?;
        }
        Ok(total)
    }
}

impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_enumeration(&self) -> bool {
        self.enumeration
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        Box::pin(async move { self.get_now(key) })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.exec_now(vec![Command::Set {
                key: key.to_owned(),
                value,
                ttl: None,
            }])
            .map(|_| ())
        })
    }

    fn set_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.exec_now(vec![Command::Set {
                key: key.to_owned(),
                value,
                ttl: Some(ttl),
            }])
            .map(|_| ())
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move {
            self.exec_now(vec![Command::Delete {
                keys: keys.to_vec(),
            }])
        })
    }

    fn mget<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, StoreResult<Vec<Option<Vec<u8>>>>> {
        Box::pin(async move {
            self.check_online()?;
            let now = Instant::now();
            let entries = self.read("mget");
            Ok(keys
                .iter()
                .map(|key| match entries.get(key) {
                    Some(Slot {
                        value: Value::Bytes(bytes),
                        expires_at,
                    }) if expires_at.is_none_or(|at| now < at) => Some(bytes.clone()),
                    _ => None,
                })
                .collect())
        })
    }

    fn set_add<'a>(
        &'a self,
        key: &'a str,
        members: &'a [String],
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.exec_now(vec![Command::SetAdd {
                key: key.to_owned(),
                members: members.to_vec(),
            }])
            .map(|_| ())
        })
    }

    fn set_members<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move {
            self.check_online()?;
            let now = Instant::now();
            match self.read("set_members").get(key) {
                Some(slot) if slot.is_live(now) => match &slot.value {
                    Value::Set(set) => Ok(set.iter().cloned().collect()),
                    Value::Bytes(_) => Err(StoreError::Protocol(format!(
                        "key {key} holds a value, not a set"
                    ))),
                },
                _ => Ok(Vec::new()),
            }
        })
    }

    fn set_remove<'a>(
        &'a self,
        key: &'a str,
        members: &'a [String],
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.check_online()?;
            let mut entries = self.write("set_remove");
            let emptied = match entries.get_mut(key) {
                Some(Slot {
                    value: Value::Set(set),
                    ..
                }) => {
                    for member in members {
                        set.remove(member);
                    }
                    set.is_empty()
                }
                _ => false,
            };
            // Redis drops a set once its last member is removed.
            if emptied {
                entries.remove(key);
            }
            Ok(())
        })
    }

    fn exec(&self, pipeline: Pipeline) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { self.exec_now(pipeline.into_commands()).map(|_| ()) })
    }

    fn scan<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move {
            self.check_online()?;
            if !self.enumeration {
                return Err(StoreError::Unsupported("scan"));
            }
            let now = Instant::now();
            let mut entries = self.write("scan");
            Self::purge(&mut entries, now);
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|key| glob_match(pattern, key))
                .cloned()
                .collect();
            drop(entries);
            keys.sort();
            Ok(keys)
        })
    }

    fn flush_all(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.check_online()?;
            self.write("flush_all").clear();
            Ok(())
        })
    }
}

/// Matches `text` against a glob where `*` is any run of characters and `?`
/// is exactly one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Last `*` seen and the text position it currently absorbs up to.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── glob_match ────────────────────────────────────────────────────────────

    #[test]
    fn glob_prefix_star() {
        assert!(glob_match("user:42:*", "user:42:profile"));
        assert!(glob_match("user:42:*", "user:42:"));
        assert!(!glob_match("user:42:*", "user:421:profile"));
    }

    #[test]
    fn glob_inner_star_and_question_mark() {
        assert!(glob_match("analytics:*:7d", "analytics:u1:7d"));
        assert!(!glob_match("analytics:*:7d", "analytics:u1:30d"));
        assert!(glob_match("tag:?", "tag:a"));
        assert!(!glob_match("tag:?", "tag:ab"));
    }

    #[test]
    fn glob_exact() {
        assert!(glob_match("k", "k"));
        assert!(!glob_match("k", "kk"));
        assert!(glob_match("*", ""));
    }

    // ── store behavior ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn values_expire_on_the_tokio_clock() {
        let store = MemoryStore::new();
        store
            .set_with_expiry("k", b"v".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        assert!(store.ttl("k").is_some());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_drops_expired_slots() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            store
                .set_with_expiry(&format!("k{i}"), b"v".to_vec(), Duration::from_secs(1))
                .await
                .unwrap();
        }
        store.set("keep", b"v".to_vec()).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(store.scan("*").await.unwrap(), vec!["keep"]);
        assert_eq!(store.slot_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_periodically_drop_expired_slots() {
        let store = MemoryStore::without_enumeration();
        for i in 0..10 {
            store
                .set_with_expiry(&format!("old{i}"), b"v".to_vec(), Duration::from_secs(1))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        for i in 0..PURGE_EVERY {
            store.set(&format!("new{i}"), b"v".to_vec()).await.unwrap();
        }
        assert_eq!(store.slot_count(), PURGE_EVERY as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_reports_removed_slots() {
        let store = MemoryStore::new();
        store
            .set_with_expiry("a", b"v".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        store.set("b", b"v".to_vec()).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.slot_count(), 1);
    }

    #[tokio::test]
    async fn sets_accumulate_members() {
        let store = MemoryStore::new();
        store.set_add("tag:t", &["a".into(), "b".into()]).await.unwrap();
        store.set_add("tag:t", &["b".into(), "c".into()]).await.unwrap();
        assert_eq!(store.set_members("tag:t").await.unwrap(), vec!["a", "b", "c"]);

        store.set_remove("tag:t", &["a".into(), "b".into(), "c".into()]).await.unwrap();
        assert!(store.set_members("tag:t").await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn mget_is_positional() {
        let store = MemoryStore::new();
        store.set("a", b"1".to_vec()).await.unwrap();
        store.set("c", b"3".to_vec()).await.unwrap();
        let got = store
            .mget(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
    }

    #[tokio::test]
    async fn delete_counts_existing_keys() {
        let store = MemoryStore::new();
        store.set("a", Vec::new()).await.unwrap();
        let removed = store.delete(&["a".into(), "missing".into()]).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn scan_requires_enumeration() {
        let store = MemoryStore::without_enumeration();
        store.set("a", Vec::new()).await.unwrap();
        assert!(matches!(
            store.scan("*").await,
            Err(StoreError::Unsupported("scan"))
        ));
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        assert!(store.exec(Pipeline::new()).await.is_err());
        store.set_offline(false);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reading_a_set_as_a_value_is_a_protocol_error() {
        let store = MemoryStore::new();
        store.set_add("tag:t", &["k".into()]).await.unwrap();
        assert!(matches!(store.get("tag:t").await, Err(StoreError::Protocol(_))));
    }
}
