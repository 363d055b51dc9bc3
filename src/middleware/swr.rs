//! Stale-while-revalidate request cache.
//!
//! A record younger than `stale_time_ms` is served as a `HIT`. An older one
//! is still served, as `STALE`, while a detached task re-runs the rest of the
//! chain and overwrites it. The client never waits on that refresh.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Deserialize;
use tracing::{Instrument, debug, info_span, instrument, warn};

use super::{
    Middleware, Next, ResponseFuture,
    cache::{
        CachedResponse, RequestCacheConfig, RequestCacheKey, X_CACHE, X_CACHE_AGE, X_CACHE_KEY,
        derive_key, load, now_ms,
    },
};
use crate::{Request, Response, cache::Cache, context::Context};

const DEFAULT_STALE_TIME_MS: u64 = 60_000;

/// Request cache settings plus the freshness window.
///
/// ```
/// use rcache::middleware::SwrConfig;
///
/// let config: SwrConfig = serde_json::from_str(r#"{"ttl": 3600, "stale_time_ms": 100}"#).unwrap();
/// assert_eq!(config.stale_time_ms, 100);
/// assert!(config.cache.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SwrConfig {
    #[serde(flatten)]
    pub cache: RequestCacheConfig,
    /// Age in milliseconds past which a record is served stale and refreshed.
    pub stale_time_ms: u64,
}

impl Default for SwrConfig {
    fn default() -> Self {
        Self {
            cache: RequestCacheConfig::default(),
            stale_time_ms: DEFAULT_STALE_TIME_MS,
        }
    }
}

impl SwrConfig {
    pub fn new(cache: RequestCacheConfig) -> Self {
        Self {
            cache,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stale_time_ms(mut self, stale_time_ms: u64) -> Self {
        self.stale_time_ms = stale_time_ms;
        self
    }
}

type Revalidating = Arc<Mutex<HashSet<String>>>;

/// Stale-while-revalidate request cache.
///
/// At most one background refresh per key runs at a time; stale hits that
/// arrive while one is pending are served without starting another.
pub struct SwrCacheMiddleware {
    cache: Arc<Cache>,
    config: Arc<SwrConfig>,
    revalidating: Revalidating,
}

impl SwrCacheMiddleware {
    pub fn new(cache: Arc<Cache>, config: SwrConfig) -> Self {
        Self {
            cache,
            config: Arc::new(config),
            revalidating: Arc::default(),
        }
    }

    pub fn config(&self) -> &SwrConfig {
        &self.config
    }
}

impl Middleware for SwrCacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        let cache = Arc::clone(&self.cache);
        let config = Arc::clone(&self.config);
        let revalidating = Arc::clone(&self.revalidating);
        Box::pin(serve(cache, config, revalidating, ctx, next))
    }
}

#[instrument(skip_all, fields(method = %ctx.request().method(), path = %ctx.request().path()))]
async fn serve(
    cache: Arc<Cache>,
    config: Arc<SwrConfig>,
    revalidating: Revalidating,
    mut ctx: Context,
    next: Next,
) -> Response {
    if !config.cache.applies_to(ctx.request()) {
        return next.run(ctx).await;
    }

    let key = derive_key(ctx.request(), &config.cache);
    if let Some((record, mut response)) = load(&cache, &key).await {
        let age_ms = record.age_ms(now_ms());
        let outcome = if age_ms < config.stale_time_ms {
            "HIT"
        } else {
            if begin_revalidation(&revalidating, &key) {
                let request = ctx.request().clone();
                let span = info_span!("swr_revalidate", key = %key);
                tokio::spawn(
                    revalidate(cache, config, revalidating, key.clone(), request, next).instrument(span),
                );
            } else {
                debug!(cache = "swr", key, "revalidation already pending");
            }
            "STALE"
        };
        debug!(cache = "swr", outcome, key, age_ms);
        response.set_header(X_CACHE, outcome);
        response.set_header(X_CACHE_AGE, (age_ms / 1000).to_string());
        response.set_header(X_CACHE_KEY, key);
        return response;
    }

    ctx.extensions_mut().insert(RequestCacheKey(key.clone()));
    let mut response = next.run(ctx).await;
    if !response.status().is_success() {
        return response;
    }
    let record = CachedResponse::capture(&response, now_ms());
    if cache.set(&key, &record, config.cache.set_options()).await {
        debug!(cache = "swr", outcome = "MISS", key);
        response.set_header(X_CACHE, "MISS");
        response.set_header(X_CACHE_KEY, key);
    }
    response
}

async fn revalidate(
    cache: Arc<Cache>,
    config: Arc<SwrConfig>,
    revalidating: Revalidating,
    key: String,
    request: Request,
    next: Next,
) {
    let _pending = PendingRevalidation {
        revalidating,
        key: key.clone(),
    };

    let mut ctx = Context::new(request);
    ctx.extensions_mut().insert(RequestCacheKey(key.clone()));
    let response = next.run(ctx).await;
    if !response.status().is_success() {
        warn!(
            cache = "swr",
            key,
            status = response.status().as_u16(),
            "revalidation returned non-success; keeping stale entry"
        );
        return;
    }

    let record = CachedResponse::capture(&response, now_ms());
    if cache.set(&key, &record, config.cache.set_options()).await {
        debug!(cache = "swr", key, "revalidated");
    } else {
        warn!(cache = "swr", key, "revalidation write failed; keeping stale entry");
    }
}

fn lock_pending(revalidating: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match revalidating.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(cache = "swr", lock_kind = "mutex.lock", "recovered from poisoned revalidation set");
            poisoned.into_inner()
        }
    }
}

/// Marks `key` as revalidating; `false` if it already was.
fn begin_revalidation(revalidating: &Mutex<HashSet<String>>, key: &str) -> bool {
    lock_pending(revalidating).insert(key.to_owned())
}

struct PendingRevalidation {
    revalidating: Revalidating,
    key: String,
}

impl Drop for PendingRevalidation {
    fn drop(&mut self) {
        lock_pending(&self.revalidating).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        StatusCode,
        cache::CacheConfig,
        http::Method,
        middleware::{MiddlewareHandler, endpoint, from_middleware},
        store::MemoryStore,
    };

    fn stack(stale_time_ms: u64, calls: Arc<AtomicUsize>, fail_after: usize) -> Vec<MiddlewareHandler> {
        let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new()), CacheConfig::default()));
        let config = SwrConfig::default().stale_time_ms(stale_time_ms);
        vec![
            from_middleware(Arc::new(SwrCacheMiddleware::new(cache, config))),
            endpoint(move |_ctx: Context| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n > fail_after {
                        return Response::new(StatusCode::ServiceUnavailable);
                    }
                    Response::new(StatusCode::Ok).body(format!("v{n}"))
                }
            }),
        ]
    }

    async fn get(stack: &[MiddlewareHandler], target: &str) -> Response {
        Next::new(stack.to_vec())
            .run(Context::new(Request::new(Method::Get, target)))
            .await
    }

    async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {expected} handler calls, saw {}", calls.load(Ordering::SeqCst));
    }

    #[test]
    fn default_stale_time_is_one_minute() {
        assert_eq!(SwrConfig::default().stale_time_ms, 60_000);
        let config: SwrConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SwrConfig::default());
    }

    #[tokio::test]
    async fn miss_then_fresh_hit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stack = stack(60_000, Arc::clone(&calls), usize::MAX);

        let first = get(&stack, "/api/featured").await;
        assert_eq!(first.headers().get(X_CACHE), Some("MISS"));
        assert!(!first.headers().contains(X_CACHE_AGE));

        let second = get(&stack, "/api/featured").await;
        assert_eq!(second.headers().get(X_CACHE), Some("HIT"));
        assert_eq!(second.headers().get(X_CACHE_AGE), Some("0"));
        assert_eq!(second.text(), Some("v1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn young_record_is_fresh_without_revalidation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stack = stack(100, Arc::clone(&calls), usize::MAX);

        get(&stack, "/x").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = get(&stack, "/x").await;
        assert_eq!(response.headers().get(X_CACHE), Some("HIT"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn old_record_is_served_stale_and_refreshed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stack = stack(100, Arc::clone(&calls), usize::MAX);

        get(&stack, "/x").await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stale = get(&stack, "/x").await;
        assert_eq!(stale.headers().get(X_CACHE), Some("STALE"));
        assert_eq!(stale.text(), Some("v1"));

        wait_for_calls(&calls, 2).await;
        // Let the refreshed record land.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let fresh = get(&stack, "/x").await;
        assert_eq!(fresh.headers().get(X_CACHE), Some("HIT"));
        assert_eq!(fresh.text(), Some("v2"));
    }

    #[tokio::test]
    async fn failed_revalidation_keeps_stale_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stack = stack(100, Arc::clone(&calls), 1);

        get(&stack, "/x").await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(get(&stack, "/x").await.headers().get(X_CACHE), Some("STALE"));
        wait_for_calls(&calls, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let again = get(&stack, "/x").await;
        assert_eq!(again.headers().get(X_CACHE), Some("STALE"));
        assert_eq!(again.text(), Some("v1"));
    }

    #[test]
    fn revalidation_marker_is_exclusive_per_key() {
        let revalidating: Revalidating = Arc::default();
        assert!(begin_revalidation(&revalidating, "a"));
        assert!(!begin_revalidation(&revalidating, "a"));
        assert!(begin_revalidation(&revalidating, "b"));

        drop(PendingRevalidation {
            revalidating: Arc::clone(&revalidating),
            key: "a".to_string(),
        });
        assert!(begin_revalidation(&revalidating, "a"));
    }
}
