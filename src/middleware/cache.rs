//! Cache-aside request cache.
//!
//! Safe reads (GET, HEAD) are keyed by a digest of method, path, filtered
//! query and selected headers. A stored 2xx response is replayed on a hit;
//! on a miss the chain runs and a 2xx result is stored.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use super::{Middleware, Next, ResponseFuture};
use crate::{
    Request, Response, StatusCode,
    cache::{Cache, SetOptions, Ttl, keys},
    context::Context,
    http::Headers,
};

/// Cache outcome header: `HIT`, `MISS` or `STALE`.
pub const X_CACHE: &str = "X-Cache";
/// Derived cache key, for debugging.
pub const X_CACHE_KEY: &str = "X-Cache-Key";
/// Age in whole seconds of a record served by the SWR middleware.
pub const X_CACHE_AGE: &str = "X-Cache-Age";

// Never replayed from the cache.
const UNSTORED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "set-cookie",
];

/// Per-route request cache settings.
///
/// # Examples
///
/// ```
/// use rcache::middleware::RequestCacheConfig;
///
/// let config: RequestCacheConfig = serde_json::from_str(
///     r#"{"ttl": "SHORT", "tags": ["templates"], "vary_by": ["Authorization"], "exclude_params": ["_t"]}"#,
/// ).unwrap();
/// assert!(config.enabled);
/// assert_eq!(config.namespace, "http");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestCacheConfig {
    /// Lifetime of stored responses; `None` keeps them until invalidated.
    pub ttl: Option<Ttl>,
    /// Tags attached to every stored response.
    pub tags: Vec<String>,
    /// Request headers whose values become part of the key.
    pub vary_by: Vec<String>,
    /// Query parameters ignored when deriving the key.
    pub exclude_params: Vec<String>,
    pub enabled: bool,
    /// First key segment; keeps this middleware's keys apart from others.
    pub namespace: String,
}

impl Default for RequestCacheConfig {
    fn default() -> Self {
        Self {
            ttl: None,
            tags: Vec::new(),
            vary_by: Vec::new(),
            exclude_params: Vec::new(),
            enabled: true,
            namespace: keys::prefix::HTTP.to_string(),
        }
    }
}

impl RequestCacheConfig {
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
    pub fn vary_by(mut self, header: impl Into<String>) -> Self {
        self.vary_by.push(header.into());
        self
    }

    #[must_use]
    pub fn exclude_param(mut self, param: impl Into<String>) -> Self {
        self.exclude_params.push(param.into());
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub(crate) fn set_options(&self) -> SetOptions {
        SetOptions {
            ttl: self.ttl,
            tags: self.tags.clone(),
        }
    }

    /// Whether this request goes through the cache at all.
    pub(crate) fn applies_to(&self, request: &Request) -> bool {
        self.enabled && request.method().is_cacheable_read()
    }
}

/// The key a request cache derived for the current request, inserted into the
/// [`Context`] extensions before the rest of the chain runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCacheKey(pub String);

/// Derives the cache key for `request`.
///
/// The digest covers the method, the path, the query pairs minus excluded
/// names (sorted), and the values of the `vary_by` headers (names lowercased
/// and sorted). Parameter and header order therefore never change the key.
///
/// # Arguments
///
/// - `request`: the incoming request.
/// - `config`: supplies the namespace, the excluded query names and the
///   `vary_by` headers.
///
/// # Returns
///
/// `"<namespace>:<sha256 hex>"`.
///
/// # Examples
///
/// ```
/// use rcache::http::{Method, Request};
/// use rcache::middleware::{RequestCacheConfig, derive_key};
///
/// let config = RequestCacheConfig::default();
/// let a = derive_key(&Request::new(Method::Get, "/api/templates?page=2&sort=new"), &config);
/// let b = derive_key(&Request::new(Method::Get, "/api/templates?sort=new&page=2"), &config);
/// assert_eq!(a, b);
/// assert!(a.starts_with("http:"));
/// ```
pub fn derive_key(request: &Request, config: &RequestCacheConfig) -> String {
    let mut pairs: Vec<(String, String)> = request
        .query_pairs()
        .into_iter()
        .filter(|(name, _)| !config.exclude_params.iter().any(|ex| ex == name))
        .collect();
    pairs.sort();

    let mut vary: Vec<String> = config
        .vary_by
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();
    vary.sort();
    vary.dedup();

    let mut hasher = Sha256::new();
    hasher.update(request.method().as_str());
    hasher.update(b"\n");
    hasher.update(request.path());
    hasher.update(b"\n");
    for (name, value) in &pairs {
        hasher.update(name);
        hasher.update(b"=");
        hasher.update(value);
        hasher.update(b"&");
    }
    hasher.update(b"\n");
    for name in &vary {
        let values: Vec<&str> = request.headers().get_all(name).collect();
        hasher.update(name);
        hasher.update(b":");
        hasher.update(values.join(","));
        hasher.update(b"\n");
    }

    format!(
        "{}{}{}",
        config.namespace,
        keys::DELIMITER,
        hex::encode(hasher.finalize())
    )
}

/// A response as persisted in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(serialize_with = "encode_body", deserialize_with = "decode_body")]
    pub body: Vec<u8>,
    /// Write time in milliseconds since the Unix epoch.
    pub stored_at: u64,
}

impl CachedResponse {
    /// Snapshots `response`, leaving out hop-by-hop, cookie and cache headers.
    pub fn capture(response: &Response, stored_at: u64) -> Self {
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| is_storable_header(name))
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();
        Self {
            status: response.status().as_u16(),
            headers,
            body: response.content().to_vec(),
            stored_at,
        }
    }

    /// Rebuilds the response, or `None` if the stored status is not one this
    /// crate can represent.
    pub fn into_response(self) -> Option<Response> {
        let status = StatusCode::from_u16(self.status)?;
        let headers: Headers = self.headers.into_iter().collect();
        Some(Response::from_parts(status, headers, self.body))
    }

    /// Milliseconds elapsed between the write and `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.stored_at)
    }
}

fn is_storable_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !lower.starts_with("x-cache") && !UNSTORED_HEADERS.contains(&lower.as_str())
}

fn encode_body<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
}

fn decode_body<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Reads a record and turns it back into a response, treating an
/// unrepresentable record as a miss.
pub(crate) async fn load(cache: &Cache, key: &str) -> Option<(CachedResponse, Response)> {
    let record: CachedResponse = cache.get(key).await?;
    match record.clone().into_response() {
        Some(response) => Some((record, response)),
        None => {
            warn!(cache = "http", key, status = record.status, "stored status not representable; treating as miss");
            None
        }
    }
}

/// Cache-aside request cache.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rcache::cache::{Cache, CacheConfig, Ttl};
/// use rcache::middleware::{CacheMiddleware, RequestCacheConfig, from_middleware};
/// use rcache::store::MemoryStore;
///
/// let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new()), CacheConfig::default()));
/// let layer = from_middleware(Arc::new(CacheMiddleware::new(
///     cache,
///     RequestCacheConfig::default().ttl(Ttl::Short).vary_by("Authorization"),
/// )));
/// ```
pub struct CacheMiddleware {
    cache: Arc<Cache>,
    config: Arc<RequestCacheConfig>,
}

impl CacheMiddleware {
    pub fn new(cache: Arc<Cache>, config: RequestCacheConfig) -> Self {
        Self {
            cache,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RequestCacheConfig {
        &self.config
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        let cache = Arc::clone(&self.cache);
        let config = Arc::clone(&self.config);
        Box::pin(serve(cache, config, ctx, next))
    }
}

#[instrument(skip_all, fields(method = %ctx.request().method(), path = %ctx.request().path()))]
async fn serve(
    cache: Arc<Cache>,
    config: Arc<RequestCacheConfig>,
    mut ctx: Context,
    next: Next,
) -> Response {
    if !config.applies_to(ctx.request()) {
        return next.run(ctx).await;
    }

    let key = derive_key(ctx.request(), &config);
    if let Some((_, mut response)) = load(&cache, &key).await {
        debug!(cache = "http", outcome = "hit", key);
        response.set_header(X_CACHE, "HIT");
        response.set_header(X_CACHE_KEY, key);
        return response;
    }

    ctx.extensions_mut().insert(RequestCacheKey(key.clone()));
    let mut response = next.run(ctx).await;
    if !response.status().is_success() {
        debug!(cache = "http", outcome = "bypass", key, status = response.status().as_u16());
        return response;
    }

    let record = CachedResponse::capture(&response, now_ms());
    if cache.set(&key, &record, config.set_options()).await {
        debug!(cache = "http", outcome = "miss", key);
        response.set_header(X_CACHE, "MISS");
        response.set_header(X_CACHE_KEY, key);
    }
    response
}
