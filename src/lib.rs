//! # rcache
//!
//! A key/value cache layered on a remote store, with TTL tiers, tag-based
//! group invalidation, batch operations, cache-aside `wrap`, and request-cache
//! middleware in cache-aside and stale-while-revalidate flavours.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rcache::cache::{Cache, CacheConfig, Ttl};
//! use rcache::context::Context;
//! use rcache::invalidation::{EntityKind, Invalidator};
//! use rcache::middleware::{CacheMiddleware, Next, RequestCacheConfig, endpoint, from_middleware};
//! use rcache::store::MemoryStore;
//! use rcache::{Request, Response, StatusCode, http::Method};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::from_env()?;
//!     let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new()), config));
//!
//!     let stack = vec![
//!         from_middleware(Arc::new(CacheMiddleware::new(
//!             Arc::clone(&cache),
//!             RequestCacheConfig::default().ttl(Ttl::Short).tag("templates"),
//!         ))),
//!         endpoint(|_ctx: Context| async {
//!             Response::new(StatusCode::Ok).body(r#"[{"id":"t1"}]"#)
//!         }),
//!     ];
//!
//!     let request = Request::new(Method::Get, "/api/templates/featured");
//!     let response = Next::new(stack).run(Context::new(request)).await;
//!     println!("{:?}", response.headers().get("X-Cache"));
//!
//!     Invalidator::new(cache)
//!         .invalidate_on_update(EntityKind::Template, "t1", None)
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod invalidation;
pub mod middleware;
pub mod store;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{Cache, CacheConfig, SetOptions, Ttl};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use invalidation::{EntityKind, Invalidation, Invalidator};
pub use store::{MemoryStore, RemoteStore, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisStore;
