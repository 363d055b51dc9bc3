//! End-to-end cache scenarios through the public API.

use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rcache::{
    Cache, CacheConfig, Request, Response, SetOptions, StatusCode, StoreError, Ttl,
    cache::keys,
    context::Context,
    http::Method,
    invalidation::{EntityKind, Invalidator},
    middleware::{
        CacheMiddleware, MiddlewareHandler, Next, RequestCacheConfig, X_CACHE, endpoint,
        from_middleware,
    },
    store::{BoxFuture, MemoryStore, Pipeline, RemoteStore, StoreResult},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
}

fn ada() -> Profile {
    Profile {
        name: "Ada".to_string(),
    }
}

/// A store whose every call fails, as if the server were unreachable.
struct UnreachableStore;

fn refused<'a, T: Send + 'a>() -> BoxFuture<'a, StoreResult<T>> {
    Box::pin(async { Err(StoreError::Unavailable("connection refused".to_string())) })
}

impl RemoteStore for UnreachableStore {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    fn supports_enumeration(&self) -> bool {
        true
    }

    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        refused()
    }

    fn set<'a>(&'a self, _key: &'a str, _value: Vec<u8>) -> BoxFuture<'a, StoreResult<()>> {
        refused()
    }

    fn set_with_expiry<'a>(
        &'a self,
        _key: &'a str,
        _value: Vec<u8>,
        _ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<()>> {
        refused()
    }

    fn delete<'a>(&'a self, _keys: &'a [String]) -> BoxFuture<'a, StoreResult<u64>> {
        refused()
    }

    fn mget<'a>(&'a self, _keys: &'a [String]) -> BoxFuture<'a, StoreResult<Vec<Option<Vec<u8>>>>> {
        refused()
    }

    fn set_add<'a>(&'a self, _key: &'a str, _members: &'a [String]) -> BoxFuture<'a, StoreResult<()>> {
        refused()
    }

    fn set_members<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        refused()
    }

    fn set_remove<'a>(&'a self, _key: &'a str, _members: &'a [String]) -> BoxFuture<'a, StoreResult<()>> {
        refused()
    }

    fn exec(&self, _pipeline: Pipeline) -> BoxFuture<'_, StoreResult<()>> {
        refused()
    }

    fn scan<'a>(&'a self, _pattern: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        refused()
    }

    fn flush_all(&self) -> BoxFuture<'_, StoreResult<()>> {
        refused()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn memory_cache() -> Arc<Cache> {
    init_tracing();
    Arc::new(Cache::new(Arc::new(MemoryStore::new()), CacheConfig::default()))
}

#[tokio::test]
async fn profile_is_gone_after_user_tag_invalidation() {
    let cache = memory_cache();
    let key = keys::build(keys::prefix::USER, "42", &["profile"]);
    assert_eq!(key, "user:42:profile");

    assert!(
        cache
            .set(&key, &ada(), SetOptions::new().ttl(Ttl::Medium).tag("user:42"))
            .await
    );
    assert_eq!(cache.get::<Profile>(&key).await, Some(ada()));

    cache.invalidate_by_tags(&["user:42".to_string()]).await;
    assert_eq!(cache.get::<Profile>(&key).await, None);
}

#[tokio::test]
async fn invalidator_drops_profile_on_user_update() {
    let cache = memory_cache();
    cache
        .set("user:42:profile", &ada(), SetOptions::new().tag(keys::tags::user("42")))
        .await;

    let invalidator = Invalidator::new(Arc::clone(&cache));
    invalidator
        .invalidate_on_update(EntityKind::User, "42", None)
        .await;
    assert_eq!(cache.get::<Profile>("user:42:profile").await, None);
}

#[tokio::test]
async fn read_through_is_idempotent() {
    let cache = memory_cache();
    let calls = AtomicUsize::new(0);
    let produce = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(ada())
    };

    let first = cache.wrap("user:1:profile", SetOptions::new(), produce).await;
    let second = cache.wrap("user:1:profile", SetOptions::new(), produce).await;
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn one_second_ttl_expires() {
    let cache = memory_cache();
    cache
        .set("session:abc", &"token", SetOptions::new().ttl(Duration::from_secs(1)))
        .await;
    assert_eq!(cache.get::<String>("session:abc").await.as_deref(), Some("token"));

    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_eq!(cache.get::<String>("session:abc").await, None);
}

#[tokio::test]
async fn unreachable_store_fails_open() {
    init_tracing();
    let cache = Cache::new(Arc::new(UnreachableStore), CacheConfig::default());

    assert!(!cache.set("k", &ada(), SetOptions::new().tag("t")).await);
    assert_eq!(cache.get::<Profile>("k").await, None);
    assert_eq!(cache.mget::<Profile>(&["k".to_string()]).await, vec![None]);
    assert_eq!(cache.invalidate_by_tags(&["t".to_string()]).await, 0);
    assert_eq!(cache.delete_pattern("user:*").await, 0);
    assert_eq!(cache.sweep_tags().await.tags_scanned, 0);
    cache.clear().await;

    let value: Result<Profile, Infallible> =
        cache.wrap("k", SetOptions::new(), || async { Ok(ada()) }).await;
    assert_eq!(value.unwrap(), ada());
}

#[tokio::test]
async fn producer_errors_reach_the_caller() {
    let cache = Cache::new(Arc::new(UnreachableStore), CacheConfig::default());
    let result: Result<Profile, String> = cache
        .wrap("k", SetOptions::new(), || async { Err("query failed".to_string()) })
        .await;
    assert_eq!(result, Err("query failed".to_string()));
}

#[tokio::test]
async fn concurrent_cold_requests_both_run_the_handler() {
    let cache = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let handler_calls = Arc::clone(&calls);
    let stack: Vec<MiddlewareHandler> = vec![
        from_middleware(Arc::new(CacheMiddleware::new(
            Arc::clone(&cache),
            RequestCacheConfig::default().ttl(Ttl::Short),
        ))),
        endpoint(move |_ctx: Context| {
            let calls = Arc::clone(&handler_calls);
            let barrier = Arc::clone(&barrier);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Both requests are inside the handler at once.
                barrier.wait().await;
                Response::new(StatusCode::Ok).body(r#"[{"id":"t1"}]"#)
            }
        }),
    ];

    let run = |stack: Vec<MiddlewareHandler>| async move {
        Next::new(stack)
            .run(Context::new(Request::new(Method::Get, "/api/templates/featured")))
            .await
    };
    let (a, b) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(run(stack.clone()), run(stack.clone())) },
    )
    .await
    .expect("both requests should reach the handler");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(a.headers().get(X_CACHE), Some("MISS"));
    assert_eq!(b.headers().get(X_CACHE), Some("MISS"));

    let warm = run(stack).await;
    assert_eq!(warm.headers().get(X_CACHE), Some("HIT"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_wrap_misses_share_one_producer() {
    let cache = memory_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch = |cache: Arc<Cache>, calls: Arc<AtomicUsize>| async move {
        cache
            .wrap("template:featured", SetOptions::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, Infallible>(vec!["t1".to_string()])
            })
            .await
    };
    let (a, b) = tokio::join!(
        fetch(Arc::clone(&cache), Arc::clone(&calls)),
        fetch(Arc::clone(&cache), Arc::clone(&calls)),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_still_shares_one_producer() {
    init_tracing();
    let cache = Arc::new(Cache::new(Arc::new(UnreachableStore), CacheConfig::default()));
    let calls = Arc::new(AtomicUsize::new(0));
    let started = tokio::time::Instant::now();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tasks.spawn(async move {
            cache
                .wrap("user:42:dashboard", SetOptions::new().ttl(Ttl::Short), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, Infallible>(ada())
                })
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap(), ada());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(400));
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (9, 1));
}
