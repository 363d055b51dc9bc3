//! Cache core — typed get/set over a [`RemoteStore`], tags, batches and `wrap`.
//!
//! Every store call made here is fail-open: a transport, protocol or payload
//! error is logged and turned into a miss or a no-op. The only errors a caller
//! ever sees are the ones its own producer returns from [`Cache::wrap`].
//!
//! ```rust,no_run
//! use std::{convert::Infallible, sync::Arc};
//! use rcache::cache::{Cache, CacheConfig, SetOptions, Ttl, keys};
//! use rcache::store::MemoryStore;
//!
//! # async fn demo() {
//! let cache = Cache::new(Arc::new(MemoryStore::new()), CacheConfig::default());
//! let key = keys::build(keys::prefix::USER, "42", &["profile"]);
//!
//! let name: Result<String, Infallible> = cache
//!     .wrap(&key, SetOptions::new().ttl(Ttl::Medium).tag(keys::tags::user("42")), || async {
//!         Ok("Ada".to_string())
//!     })
//!     .await;
//!
//! cache.invalidate_by_tags(&[keys::tags::user("42")]).await;
//! # }
//! ```

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::store::{Pipeline, RemoteStore};

mod config;
mod flight;
pub mod keys;
mod stats;
mod ttl;

pub use config::{CacheConfig, ConfigError, TtlTiers};
pub use stats::{CacheStats, StatsSnapshot};
pub use ttl::Ttl;

use flight::{Flight, FlightLeader, FlightRegistry};

/// Options for a single write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// `None` stores the entry without expiry.
    pub ttl: Option<Ttl>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// One entry of a [`Cache::mset`] batch.
#[derive(Debug, Clone)]
pub struct MsetItem<T> {
    pub key: String,
    pub value: T,
    pub ttl: Option<Ttl>,
}

impl<T> MsetItem<T> {
    pub fn new(key: impl Into<String>, value: T, ttl: Option<Ttl>) -> Self {
        Self {
            key: key.into(),
            value,
            ttl,
        }
    }
}

/// Outcome of one [`Cache::sweep_tags`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tags_scanned: usize,
    pub members_pruned: usize,
    pub tags_removed: usize,
}

/// The cache service.
///
/// Holds only the store handle, its configuration, local stats and the
/// in-flight registry; the store owns all data. Construct one per process and
/// share it as `Arc<Cache>`.
pub struct Cache {
    store: Arc<dyn RemoteStore>,
    config: CacheConfig,
    stats: CacheStats,
    flights: FlightRegistry,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl Cache {
    pub fn new(store: Arc<dyn RemoteStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            stats: CacheStats::new(),
            flights: FlightRegistry::new(),
        }
    }

    /// Builds a shared cache and starts the periodic tag sweep when
    /// [`CacheConfig::tag_sweep_interval`] is set.
    ///
    /// # Arguments
    ///
    /// - `store`: backend every cache operation is issued against.
    /// - `config`: validated settings.
    ///
    /// # Returns
    ///
    /// The shared cache. The sweeper holds only a weak handle, so dropping
    /// the last `Arc` stops it.
    ///
    /// # Panics
    ///
    /// Spawning the sweeper needs a Tokio runtime, so call this from within
    /// one when a sweep interval is configured.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use rcache::cache::{Cache, CacheConfig};
    /// use rcache::store::MemoryStore;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let config = CacheConfig {
    ///     tag_sweep_interval_secs: Some(300),
    ///     ..Default::default()
    /// };
    /// let cache = Cache::start(Arc::new(MemoryStore::new()), config);
    /// # }
    /// ```
    pub fn start(store: Arc<dyn RemoteStore>, config: CacheConfig) -> Arc<Self> {
        let interval = config.tag_sweep_interval();
        let cache = Arc::new(Self::new(store, config));
        if let Some(interval) = interval {
            info!(cache = "core", interval_secs = interval.as_secs(), "starting tag sweeper");
            // Detached: the task exits on its own once the cache is dropped.
            drop(cache.spawn_tag_sweeper(interval));
        }
        cache
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Resolves an optional TTL against the configured tiers.
    pub fn resolve_ttl(&self, ttl: Option<Ttl>) -> Option<Duration> {
        ttl.map(|ttl| ttl.resolve(&self.config.ttl))
    }

    /// Reads and decodes `key`, counting a hit or a miss.
    ///
    /// Store failures and undecodable payloads are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let value = self.lookup(key).await;
        if value.is_some() {
            self.stats.record_hit();
            debug!(cache = "core", outcome = "hit", key);
        } else {
            self.stats.record_miss();
            debug!(cache = "core", outcome = "miss", key);
        }
        value
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.store.get(key).await {
            Ok(bytes) => bytes?,
            Err(error) => {
                warn!(cache = "core", op = "get", key, store = self.store.name(), %error, "store read failed; treating as miss");
                return None;
            }
        };
        decode("get", key, &bytes)
    }

    /// Encodes and writes `value`, registering `key` under each tag.
    ///
    /// The value write and the tag registrations travel in one pipeline.
    /// A zero TTL means the value is not written at all. Returns whether the
    /// write reached the store.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: SetOptions) -> bool {
        if !self.config.enabled {
            return false;
        }
        match encode("set", key, value) {
            Some(bytes) => self.write_encoded(key, bytes, options).await,
            None => false,
        }
    }

    async fn write_encoded(&self, key: &str, bytes: Vec<u8>, options: SetOptions) -> bool {
        let ttl = self.resolve_ttl(options.ttl);
        if ttl == Some(Duration::ZERO) {
            debug!(cache = "core", op = "set", key, "zero ttl; skipping write");
            return false;
        }

        let result = if options.tags.is_empty() {
            match ttl {
                Some(ttl) => self.store.set_with_expiry(key, bytes, ttl).await,
                None => self.store.set(key, bytes).await,
            }
        } else {
            let pipeline = options.tags.iter().fold(
                Pipeline::new().set(key, bytes, ttl),
                |pipeline, tag| pipeline.set_add(keys::tag_key(tag), vec![key.to_owned()]),
            );
            self.store.exec(pipeline).await
        };

        match result {
            Ok(()) => true,
            Err(error) => {
                warn!(cache = "core", op = "set", key, store = self.store.name(), %error, "store write failed; entry not cached");
                false
            }
        }
    }

    /// Deletes a batch of exact keys in one store call, returning how many
    /// existed.
    pub async fn delete_many(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        match self.store.delete(keys).await {
            Ok(removed) => removed,
            Err(error) => {
                warn!(cache = "core", op = "delete_many", count = keys.len(), %error, "store delete failed");
                0
            }
        }
    }

    /// Deletes one key. Returns `true` if it existed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(&[key.to_owned()]).await {
            Ok(removed) => removed > 0,
            Err(error) => {
                warn!(cache = "core", op = "delete", key, %error, "store delete failed");
                false
            }
        }
    }

    /// Deletes every key matching a glob, returning how many were removed.
    ///
    /// Best effort: against a store without enumeration this logs a warning
    /// and removes nothing. Use tags for correctness-critical invalidation.
    #[instrument(level = "debug", skip(self), fields(store = self.store.name()))]
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        if !self.store.supports_enumeration() {
            warn!(cache = "core", op = "delete_pattern", pattern, "store cannot enumerate keys; pattern delete skipped");
            return 0;
        }
        let keys = match self.store.scan(pattern).await {
            Ok(keys) => keys,
            Err(error) => {
                warn!(cache = "core", op = "delete_pattern", pattern, %error, "key scan failed");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }
        match self.store.delete(&keys).await {
            Ok(removed) => {
                debug!(cache = "core", op = "delete_pattern", pattern, removed);
                removed
            }
            Err(error) => {
                warn!(cache = "core", op = "delete_pattern", pattern, %error, "bulk delete failed");
                0
            }
        }
    }

    /// Deletes every key registered under each tag, then the tag set itself.
    ///
    /// Returns the number of member keys scheduled for deletion. Tags are
    /// processed one by one; a failure on one tag does not stop the others.
    #[instrument(level = "debug", skip(self), fields(store = self.store.name()))]
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let mut total = 0;
        for tag in tags {
            let tag_key = keys::tag_key(tag);
            let members = match self.store.set_members(&tag_key).await {
                Ok(members) => members,
                Err(error) => {
                    warn!(cache = "core", op = "invalidate_by_tags", tag, %error, "failed to read tag members");
                    continue;
                }
            };
            let count = members.len();
            let pipeline = Pipeline::new().delete(members).delete(vec![tag_key]);
            match self.store.exec(pipeline).await {
                Ok(()) => {
                    debug!(cache = "core", op = "invalidate_by_tags", tag, members = count);
                    total += count;
                }
                Err(error) => {
                    warn!(cache = "core", op = "invalidate_by_tags", tag, %error, "failed to delete tagged keys");
                }
            }
        }
        total
    }

    /// Cache-aside read-through.
    ///
    /// Returns the cached value on a hit. On a miss runs `producer`, caches an
    /// `Ok` result with `options`, and returns it. A producer error is returned
    /// unchanged and nothing is cached.
    ///
    /// With [`CacheConfig::single_flight`] concurrent misses on one key
    /// share the first caller's producer run: the leader hands its value to
    /// the waiting callers directly, so they never depend on the store write
    /// landing. If the leader's producer fails, the waiting callers run their
    /// own producers concurrently.
    ///
    /// Each call counts once in [`stats`](Self::stats): a hit when it was
    /// served from the store or from another caller's run, a miss when it ran
    /// the producer.
    pub async fn wrap<T, E, F, Fut>(&self, key: &str, options: SetOptions, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return producer().await;
        }
        if let Some(value) = self.lookup(key).await {
            self.stats.record_hit();
            debug!(cache = "core", outcome = "hit", key);
            return Ok(value);
        }
        if !self.config.single_flight {
            return self.produce(key, options, producer, None).await;
        }

        match self.flights.join(key) {
            Flight::Leader(leader) => self.produce(key, options, producer, Some(&leader)).await,
            Flight::Follower(receiver) => {
                let shared = flight::follow(receiver).await;
                if let Some(value) = shared.and_then(|bytes| decode("wrap", key, &bytes)) {
                    self.stats.record_hit();
                    debug!(cache = "core", outcome = "coalesced", key);
                    return Ok(value);
                }
                debug!(cache = "core", key, "flight leader produced nothing; running producer");
                self.produce(key, options, producer, None).await
            }
        }
    }

    /// Runs a miss: calls the producer, shares the value with any followers,
    /// then writes it.
    async fn produce<T, E, F, Fut>(
        &self,
        key: &str,
        options: SetOptions,
        producer: F,
        leader: Option<&FlightLeader<'_>>,
    ) -> Result<T, E>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.stats.record_miss();
        debug!(cache = "core", outcome = "miss", key);
        let value = producer().await?;
        if let Some(bytes) = encode("wrap", key, &value) {
            if let Some(leader) = leader {
                leader.publish(Arc::from(bytes.as_slice()));
            }
            self.write_encoded(key, bytes, options).await;
        }
        Ok(value)
    }

    /// Batch read. The result has one slot per key, in order.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        if !self.config.enabled || keys.is_empty() {
            return keys.iter().map(|_| None).collect();
        }
        let raw = match self.store.mget(keys).await {
            Ok(raw) if raw.len() == keys.len() => raw,
            Ok(raw) => {
                warn!(cache = "core", op = "mget", expected = keys.len(), got = raw.len(), "store returned a short batch");
                vec![None; keys.len()]
            }
            Err(error) => {
                warn!(cache = "core", op = "mget", count = keys.len(), %error, "batch read failed; treating as misses");
                vec![None; keys.len()]
            }
        };
        raw.into_iter()
            .zip(keys)
            .map(|(bytes, key)| {
                let value = bytes.and_then(|bytes| decode("mget", key, &bytes));
                if value.is_some() {
                    self.stats.record_hit();
                } else {
                    self.stats.record_miss();
                }
                value
            })
            .collect()
    }

    /// Batch write, grouped by resolved TTL into a single pipeline.
    pub async fn mset<T: Serialize>(&self, items: Vec<MsetItem<T>>) {
        if !self.config.enabled || items.is_empty() {
            return;
        }
        let mut groups: BTreeMap<Option<Duration>, Vec<(String, Vec<u8>)>> = BTreeMap::new();
        for item in items {
            let ttl = self.resolve_ttl(item.ttl);
            if ttl == Some(Duration::ZERO) {
                continue;
            }
            match serde_json::to_vec(&item.value) {
                Ok(bytes) => groups.entry(ttl).or_default().push((item.key, bytes)),
                Err(error) => {
                    warn!(cache = "core", op = "mset", key = %item.key, %error, "value not serializable; skipping");
                }
            }
        }

        let group_count = groups.len();
        let pipeline = groups
            .into_iter()
            .flat_map(|(ttl, entries)| entries.into_iter().map(move |(key, bytes)| (key, bytes, ttl)))
            .fold(Pipeline::new(), |pipeline, (key, bytes, ttl)| pipeline.set(key, bytes, ttl));
        if pipeline.is_empty() {
            return;
        }

        let count = pipeline.len();
        match self.store.exec(pipeline).await {
            Ok(()) => debug!(cache = "core", op = "mset", count, ttl_groups = group_count),
            Err(error) => warn!(cache = "core", op = "mset", count, %error, "batch write failed"),
        }
    }

    /// Removes everything from the store.
    pub async fn clear(&self) {
        match self.store.flush_all().await {
            Ok(()) => info!(cache = "core", op = "clear", store = self.store.name(), "cache flushed"),
            Err(error) => warn!(cache = "core", op = "clear", %error, "flush failed"),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Prunes tag members whose keys no longer exist and drops emptied tags.
    ///
    /// Tag sets carry no TTL, so members that expired naturally linger until
    /// swept. Needs key enumeration; against other stores this is a no-op.
    #[instrument(level = "debug", skip(self), fields(store = self.store.name()))]
    pub async fn sweep_tags(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.store.supports_enumeration() {
            warn!(cache = "core", op = "sweep_tags", "store cannot enumerate keys; tag sweep skipped");
            return report;
        }
        let tag_keys = match self.store.scan(&keys::all_tags()).await {
            Ok(tag_keys) => tag_keys,
            Err(error) => {
                warn!(cache = "core", op = "sweep_tags", %error, "tag scan failed");
                return report;
            }
        };

        for tag_key in tag_keys {
            report.tags_scanned += 1;
            let members = match self.store.set_members(&tag_key).await {
                Ok(members) => members,
                Err(error) => {
                    warn!(cache = "core", op = "sweep_tags", tag_key, %error, "failed to read tag members");
                    continue;
                }
            };
            let present = match self.store.mget(&members).await {
                Ok(present) if present.len() == members.len() => present,
                Ok(_) | Err(_) => continue,
            };
            let stale: Vec<String> = members
                .iter()
                .zip(&present)
                .filter(|(_, value)| value.is_none())
                .map(|(member, _)| member.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }

            let drop_tag = stale.len() == members.len();
            let result = if drop_tag {
                self.store.delete(std::slice::from_ref(&tag_key)).await.map(|_| ())
            } else {
                self.store.set_remove(&tag_key, &stale).await
            };
            match result {
                Ok(()) => {
                    report.members_pruned += stale.len();
                    report.tags_removed += usize::from(drop_tag);
                }
                Err(error) => warn!(cache = "core", op = "sweep_tags", tag_key, %error, "failed to prune tag"),
            }
        }

        if report.members_pruned > 0 {
            info!(
                cache = "core",
                op = "sweep_tags",
                scanned = report.tags_scanned,
                pruned = report.members_pruned,
                removed = report.tags_removed,
                "tag sweep finished"
            );
        }
        report
    }

    /// Runs [`sweep_tags`](Self::sweep_tags) every `interval` on the current
    /// runtime. The task ends once the last `Arc<Cache>` is dropped.
    pub fn spawn_tag_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    debug!(cache = "core", "cache dropped; tag sweeper exiting");
                    break;
                };
                cache.sweep_tags().await;
            }
        })
    }
}

fn encode<T: Serialize + ?Sized>(op: &'static str, key: &str, value: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            warn!(cache = "core", op, key, %error, "value not serializable; skipping write");
            None
        }
    }
}

fn decode<T: DeserializeOwned>(op: &'static str, key: &str, bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(cache = "core", op, key, %error, "undecodable cache payload; treating as miss");
            None
        }
    }
}
