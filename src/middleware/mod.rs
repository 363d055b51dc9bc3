//! Middleware pipeline — composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, so the request cache can short-circuit
//! with a stored response or decorate the response of the layers below it.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`endpoint`] — adapt a [`Middleware`] or a plain
//!   async handler into a [`MiddlewareHandler`].
//! - [`CacheMiddleware`] — cache-aside request cache.
//! - [`SwrCacheMiddleware`] — stale-while-revalidate request cache.
//! - [`LoggerMiddleware`] — access log line including the cache outcome.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, context::Context};

mod cache;
mod swr;

pub use cache::{
    CacheMiddleware, CachedResponse, RequestCacheConfig, RequestCacheKey, X_CACHE, X_CACHE_AGE,
    X_CACHE_KEY, derive_key,
};
pub use swr::{SwrCacheMiddleware, SwrConfig};

/// A boxed response future, the return type of every middleware.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed on each call to [`run`](Self::run). It is also `Clone`:
/// the stale-while-revalidate middleware keeps a copy to replay the rest of the
/// chain in the background after the stale response has been returned.
#[derive(Clone)]
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> ResponseFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Arguments
///
/// - `middleware`: a reference-counted [`Middleware`] to wrap.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rcache::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Turns an async request handler into the terminal layer of a chain.
///
/// The handler never sees [`Next`]; it always produces the response itself.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use rcache::{Request, Response, StatusCode, context::Context, http::Method};
/// use rcache::middleware::{Next, endpoint};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let stack = vec![endpoint(|_ctx: Context| async { Response::new(StatusCode::Ok).body("hi") })];
/// let response = Next::new(stack)
///     .run(Context::new(Request::new(Method::Get, "/")))
///     .await;
/// assert_eq!(response.text(), Some("hi"));
/// # }
/// ```
pub fn endpoint<H, F>(handler: H) -> MiddlewareHandler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context, _next: Next| -> ResponseFuture { Box::pin(handler(ctx)) })
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    ///
    /// # Arguments
    ///
    /// - `middlewares`: the ordered handlers that make up the pipeline, as a
    ///   `Vec` or an already shared `Arc<[MiddlewareHandler]>`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use rcache::middleware::{MiddlewareHandler, Next};
    ///
    /// let next = Next::new(Vec::<MiddlewareHandler>::new());
    /// ```
    pub fn new(middlewares: impl Into<Arc<[MiddlewareHandler]>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// If the chain is exhausted without producing a response, a
    /// `500 Internal Server Error` is returned as a safe fallback.
    ///
    /// # Arguments
    ///
    /// - `ctx`: the per-request [`Context`] to pass to the next middleware.
    ///
    /// # Returns
    ///
    /// The [`Response`] produced by the next middleware or handler in the chain.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = Arc::clone(&self.middlewares[self.index]);
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(crate::StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may pass
/// through, short-circuit with their own [`Response`], or decorate the
/// response returned by `next`.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    ///
    /// # Arguments
    ///
    /// - `ctx`: the per-request [`Context`], carrying the request and the
    ///   extensions earlier layers attached.
    /// - `next`: cursor into the rest of the chain; call [`Next::run`] to
    ///   forward the request. Cache layers may keep a clone to replay it later.
    ///
    /// # Returns
    ///
    /// A [`Response`], either produced here or forwarded from downstream.
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture;
}

/// Logs method, path, status, cache outcome and duration for each request.
///
/// Place it outside the cache middleware to see `HIT`/`MISS`/`STALE` per request:
///
/// ```text
/// GET /api/templates - 200 cache=HIT (412µs)
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();
            let outcome = response.headers().get(X_CACHE).unwrap_or("-");

            tracing::info!(
                %method,
                %path,
                status,
                cache = outcome,
                "{} {} - {} cache={} ({:?})",
                method,
                path,
                status,
                outcome,
                duration
            );

            response
        })
    }
}
