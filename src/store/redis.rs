//! Redis-backed [`RemoteStore`], enabled with the `redis` feature.
//!
//! Every call clones a [`ConnectionManager`], which multiplexes one
//! connection and reconnects on its own after a drop. Pipelines go out with
//! `redis::pipe()` in a single round trip; enumeration walks `SCAN` cursors
//! rather than blocking the server with `KEYS`.

use std::time::Duration;

use redis::{Client, Cmd, RedisError, aio::ConnectionManager};
use tracing::{debug, info};

use super::{BoxFuture, Command, Pipeline, RemoteStore, StoreError, StoreResult};

/// Keys requested per `SCAN` step.
pub const SCAN_COUNT: usize = 500;

/// A [`RemoteStore`] over a Redis server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rcache::cache::{Cache, CacheConfig};
/// use rcache::store::RedisStore;
///
/// # async fn demo() -> Result<(), rcache::StoreError> {
/// let store = RedisStore::connect("redis://127.0.0.1:6379/0").await?;
/// let cache = Cache::start(Arc::new(store), CacheConfig::default());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Opens a managed connection to `url`.
    ///
    /// # Arguments
    ///
    /// - `url`: a `redis://` or `rediss://` connection string.
    ///
    /// # Errors
    ///
    /// [`StoreError::Protocol`] for a malformed URL, [`StoreError::Unavailable`]
    /// when the server cannot be reached.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(store_error)?;
        let conn = client.get_connection_manager().await.map_err(store_error)?;
        info!(store = "redis", "connected");
        Ok(Self { conn })
    }

    /// Wraps a connection manager built elsewhere.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn supports_enumeration(&self) -> bool {
        true
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        Box::pin(async move { query(redis::cmd("GET").arg(key), &mut self.conn()).await })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move { query(redis::cmd("SET").arg(key).arg(value), &mut self.conn()).await })
    }

    fn set_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let cmd = redis::cmd("PSETEX").arg(key).arg(expiry_millis(ttl)).arg(value).to_owned();
            query(&cmd, &mut self.conn()).await
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            query(redis::cmd("DEL").arg(keys), &mut self.conn()).await
        })
    }

    fn mget<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, StoreResult<Vec<Option<Vec<u8>>>>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            query(redis::cmd("MGET").arg(keys), &mut self.conn()).await
        })
    }

    fn set_add<'a>(&'a self, key: &'a str, members: &'a [String]) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            if members.is_empty() {
                return Ok(());
            }
            query(redis::cmd("SADD").arg(key).arg(members), &mut self.conn()).await
        })
    }

    fn set_members<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move { query(redis::cmd("SMEMBERS").arg(key), &mut self.conn()).await })
    }

    fn set_remove<'a>(&'a self, key: &'a str, members: &'a [String]) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            if members.is_empty() {
                return Ok(());
            }
            query(redis::cmd("SREM").arg(key).arg(members), &mut self.conn()).await
        })
    }

    fn exec(&self, pipeline: Pipeline) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            if pipeline.is_empty() {
                return Ok(());
            }
            let count = pipeline.len();
            let pipe = to_redis_pipeline(pipeline);
            let () = pipe.query_async(&mut self.conn()).await.map_err(store_error)?;
            debug!(store = "redis", commands = count, "pipeline executed");
            Ok(())
        })
    }

    fn scan<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let mut keys = Vec::new();
            let mut cursor = 0_u64;
            loop {
                let (next, batch): (u64, Vec<String>) =
                    query(&scan_step(cursor, pattern), &mut conn).await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            // SCAN may yield a key more than once.
            keys.sort_unstable();
            keys.dedup();
            Ok(keys)
        })
    }

    fn flush_all(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { query(&redis::cmd("FLUSHDB"), &mut self.conn()).await })
    }
}

async fn query<T: redis::FromRedisValue>(cmd: &Cmd, conn: &mut ConnectionManager) -> StoreResult<T> {
    cmd.query_async(conn).await.map_err(store_error)
}

fn scan_step(cursor: u64, pattern: &str) -> Cmd {
    redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(SCAN_COUNT)
        .to_owned()
}

/// `PSETEX` rejects zero, so sub-millisecond expiries round up.
fn expiry_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn to_redis_pipeline(pipeline: Pipeline) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    for command in pipeline.into_commands() {
        match command {
            Command::Set {
                key,
                value,
                ttl: Some(ttl),
            } => {
                pipe.cmd("PSETEX").arg(key).arg(expiry_millis(ttl)).arg(value).ignore();
            }
            Command::Set { key, value, ttl: None } => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            Command::Delete { keys } => {
                pipe.cmd("DEL").arg(keys).ignore();
            }
            Command::SetAdd { key, members } => {
                pipe.cmd("SADD").arg(key).arg(members).ignore();
            }
        }
    }
    pipe
}

fn store_error(error: RedisError) -> StoreError {
    if error.is_io_error() || error.is_connection_refusal() || error.is_connection_dropped() || error.is_timeout() {
        StoreError::Unavailable(error.to_string())
    } else {
        StoreError::Protocol(error.to_string())
    }
}
