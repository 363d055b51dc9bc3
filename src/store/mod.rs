//! Remote store boundary — the capability interface the cache is built on.
//!
//! The cache core never talks to a concrete backend. It holds an
//! `Arc<dyn RemoteStore>` and issues plain key/value, set-membership and
//! pipelined batch operations against it. Concurrency safety of the handle is
//! the store's responsibility; every method takes `&self`.
//!
//! [`MemoryStore`] is the in-process implementation used for tests and
//! single-node deployments. With the `redis` feature, `RedisStore` talks to a
//! Redis server.

use std::{future::Future, pin::Pin, time::Duration};

use thiserror::Error;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// A boxed, `Send` future borrowed for `'a`, the return type of every
/// [`RemoteStore`] method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by a store. The cache core converts every one of these
/// into a miss or a no-op.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),

    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// One command inside a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write a value, with an optional expiry.
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Delete any number of keys (plain values or sets).
    Delete { keys: Vec<String> },
    /// Add members to a set, creating it if needed.
    SetAdd { key: String, members: Vec<String> },
}

/// An ordered batch of commands sent to the store in one round trip.
///
/// Pipelines carry no transaction semantics; a store may apply a prefix of the
/// commands before failing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        self.commands.push(Command::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    #[must_use]
    pub fn delete(mut self, keys: Vec<String>) -> Self {
        if !keys.is_empty() {
            self.commands.push(Command::Delete { keys });
        }
        self
    }

    #[must_use]
    pub fn set_add(mut self, key: impl Into<String>, members: Vec<String>) -> Self {
        if !members.is_empty() {
            self.commands.push(Command::SetAdd {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// The capability interface of a remote key/value store.
///
/// Implementations guarantee single-call atomicity only. Nothing is assumed
/// about ordering between calls or across the commands of a [`Pipeline`].
///
/// # Contract
///
/// - Missing keys are `Ok(None)` / empty, never an error.
/// - [`scan`](Self::scan) may only be relied on when
///   [`supports_enumeration`](Self::supports_enumeration) returns `true`;
///   otherwise it returns [`StoreError::Unsupported`].
pub trait RemoteStore: Send + Sync {
    /// Short backend name for log fields, e.g. `"memory"` or `"redis"`.
    fn name(&self) -> &'static str;

    /// Whether [`scan`](Self::scan) can enumerate keys.
    fn supports_enumeration(&self) -> bool;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>>;

    /// Writes a value with no expiry.
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, StoreResult<()>>;

    fn set_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Deletes keys, returning how many existed.
    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, StoreResult<u64>>;

    /// Positional batch read: the result has one slot per requested key.
    fn mget<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, StoreResult<Vec<Option<Vec<u8>>>>>;

    fn set_add<'a>(
        &'a self,
        key: &'a str,
        members: &'a [String],
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn set_members<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>>;

    fn set_remove<'a>(
        &'a self,
        key: &'a str,
        members: &'a [String],
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Executes a pipeline in one round trip.
    fn exec(&self, pipeline: Pipeline) -> BoxFuture<'_, StoreResult<()>>;

    /// Enumerates keys matching a glob (`*` and `?` wildcards).
    fn scan<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>>;

    fn flush_all(&self) -> BoxFuture<'_, StoreResult<()>>;
}
