//! The request coordination engine.
//!
//! For every derived-image key the [`Coordinator`] arbitrates between the
//! response cache, a keyed single-flight lock, the upstream fetch of the
//! parent, the processing throttler, deadline propagation and the error
//! placeholder. The [`Dispatcher`] feeds it through a bounded queue with
//! per-request deadlines and pre/post hooks.

mod dispatcher;
mod plugins;
mod resolver;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::config::{AppConfig, HeaderRule, PlaceholderSource};
use crate::coordination::{Acquired, SingleFlight, Throttler};
use crate::engine::ImageEngine;
use crate::monitoring;
use crate::object::{DerivedObject, TransformChain};
use crate::response::Response;
use crate::storage::{ListOptions, StorageDispatcher};

pub use dispatcher::Dispatcher;
pub use plugins::{HookRegistry, ProcessorHook};
pub use resolver::{ParentResolver, RootFetch};

/// TTL for successful engine results.
const SUCCESS_TTL: Duration = Duration::from_secs(2 * 60);
/// TTL for rendered placeholders.
const PLACEHOLDER_TTL: Duration = Duration::from_secs(10 * 60);
/// TTL for 404s on derived keys. Short, so late uploads become visible.
const NOT_FOUND_TTL: Duration = Duration::from_secs(30);
/// Cadence of the collapsed waiter's stale cache probes.
const CACHE_PROBE_INTERVAL: Duration = Duration::from_millis(10);
/// Deadline for fire-and-forget writebacks, independent of the client.
const WRITEBACK_TIMEOUT: Duration = Duration::from_secs(30);

const S3_LOCATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><LocationConstraint xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">EU</LocationConstraint>";

/// The request view the coordinator needs: method, headers, decoded query
/// pairs, and the buffered body for PUTs.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct RequestMeta {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
}

impl RequestMeta {
    /// Body-less request view.
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: Bytes::new(),
        }
    }

    fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn has_query(&self, name: &str) -> bool {
        self.query.iter().any(|(n, _)| n == name)
    }
}

/// Orchestrates cache, single-flight, parent fetch, throttle, engine and
/// writeback for one request at a time.
pub struct Coordinator {
    storage: Arc<StorageDispatcher>,
    engine: Arc<dyn ImageEngine>,
    resolver: ParentResolver,
    cache: ResponseCache,
    collapse: SingleFlight,
    throttler: Throttler,
    header_rules: Vec<HeaderRule>,
    placeholder: Option<PlaceholderSource>,
    lock_timeout: Duration,
}

impl Coordinator {
    /// Assemble a coordinator from configuration and its collaborators.
    pub fn new(
        config: &AppConfig,
        storage: Arc<StorageDispatcher>,
        engine: Arc<dyn ImageEngine>,
        placeholder: Option<PlaceholderSource>,
    ) -> Self {
        Self {
            resolver: ParentResolver::new(storage.clone()),
            storage,
            engine,
            cache: ResponseCache::new(config.server.cache_size),
            collapse: SingleFlight::new(),
            throttler: Throttler::new(config.server.throttle_limit),
            header_rules: config.headers.clone(),
            placeholder,
            lock_timeout: config.server.lock_timeout(),
        }
    }

    /// Handle one request against its derived object.
    ///
    /// Every failure mode comes back as a `Response` value; this method
    /// never fails.
    pub async fn process(
        &self,
        meta: &RequestMeta,
        obj: &DerivedObject,
        deadline: Instant,
    ) -> Response {
        match meta.method {
            Method::GET | Method::HEAD => {
                monitoring::request(if meta.method == Method::GET { "GET" } else { "HEAD" });
                if obj.key.is_empty() {
                    return self.handle_bucket_get(meta, obj).await;
                }
                let res = if obj.has_transforms() {
                    self.collapsed_get(obj, deadline).await
                } else {
                    self.handle_get(obj, deadline).await
                };
                self.update_headers(res)
            }
            Method::PUT => {
                monitoring::request("PUT");
                self.storage
                    .set(obj, &meta.headers, meta.body.clone())
                    .await
            }
            Method::DELETE => {
                monitoring::request("DELETE");
                self.storage.delete(obj).await
            }
            _ => {
                monitoring::request("OTHER");
                Response::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
        }
    }

    /// Bucket-level GET: the S3 location document or a listing.
    async fn handle_bucket_get(&self, meta: &RequestMeta, obj: &DerivedObject) -> Response {
        if meta.has_query("location") {
            return Response::text(StatusCode::OK, "application/xml", S3_LOCATION);
        }

        let opts = ListOptions {
            max_keys: meta
                .query_value("max-keys")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            delimiter: meta.query_value("delimiter").unwrap_or_default().to_string(),
            prefix: meta.query_value("prefix").unwrap_or_default().to_string(),
            marker: meta.query_value("marker").unwrap_or_default().to_string(),
        };
        self.storage.list(obj, &opts).await
    }

    /// Single-flight wrapper around [`Coordinator::handle_get`].
    ///
    /// The owner computes and broadcasts. A waiter races the broadcast
    /// against the request deadline, the lock timeout and periodic stale
    /// cache probes; on lock timeout (or an owner that released without
    /// publishing) it falls back to its own computation.
    async fn collapsed_get(&self, obj: &DerivedObject, deadline: Instant) -> Response {
        match self.collapse.acquire(&obj.key) {
            Acquired::Owner(owner) => {
                debug!(key = %obj.key, "lock acquired");
                let res = self.handle_get(obj, deadline).await;
                owner.publish(&res);
                res
            }
            Acquired::Waiter(mut ticket) => {
                monitoring::collapsed();
                debug!(key = %obj.key, "lock not acquired, following owner");

                enum Outcome {
                    Received(Response),
                    CacheHit(Response),
                    OwnerGone,
                    Cancelled,
                    LockTimeout,
                }

                let lock_deadline = Instant::now() + self.lock_timeout;
                let outcome = loop {
                    tokio::select! {
                        received = ticket.recv() => {
                            break match received {
                                Some(res) => Outcome::Received(res),
                                None => Outcome::OwnerGone,
                            };
                        }
                        _ = tokio::time::sleep_until(deadline) => break Outcome::Cancelled,
                        _ = tokio::time::sleep_until(lock_deadline) => break Outcome::LockTimeout,
                        _ = tokio::time::sleep(CACHE_PROBE_INTERVAL) => {
                            if let Some(res) = self.cache.get(&obj.key, true) {
                                break Outcome::CacheHit(res);
                            }
                        }
                    }
                };
                drop(ticket);

                match outcome {
                    Outcome::Received(res) | Outcome::CacheHit(res) => res,
                    Outcome::OwnerGone | Outcome::LockTimeout => {
                        debug!(key = %obj.key, "falling back to own computation");
                        self.handle_get(obj, deadline).await
                    }
                    Outcome::Cancelled => {
                        warn!(key = %obj.key, "context deadline while collapsed");
                        self.reply_with_error(
                            obj,
                            StatusCode::GATEWAY_TIMEOUT,
                            "context deadline exceeded",
                        )
                        .await
                    }
                }
            }
        }
    }

    /// Cache probe, then the root fetch policy, then an engine pass when
    /// a fresh derivation is required.
    async fn handle_get(&self, obj: &DerivedObject, deadline: Instant) -> Response {
        if let Some(res) = self.cache.get(&obj.key, false) {
            return res;
        }

        match self.resolver.fetch(obj, deadline).await {
            RootFetch::Direct(res) => res,
            RootFetch::Surfaced(res) => {
                if res.status() == StatusCode::NOT_FOUND && obj.has_transforms() {
                    self.cache.set(&obj.key, &res, NOT_FOUND_TTL);
                }
                res
            }
            RootFetch::Process { parent, chains } => {
                self.process_image(obj, parent, chains, deadline).await
            }
            RootFetch::Failed { status, error } => {
                self.reply_with_error(obj, status, &error).await
            }
            RootFetch::TimedOut => {
                self.reply_with_error(
                    obj,
                    StatusCode::GATEWAY_TIMEOUT,
                    "context deadline exceeded",
                )
                .await
            }
        }
    }

    /// One throttled engine pass, then cache insert and fire-and-forget
    /// storage writeback.
    async fn process_image(
        &self,
        obj: &DerivedObject,
        parent: Response,
        chains: Vec<TransformChain>,
        deadline: Instant,
    ) -> Response {
        let Some(_permit) = self.throttler.take(deadline).await else {
            warn!(key = %obj.key, "throttled");
            monitoring::throttled();
            return self
                .reply_with_error(obj, StatusCode::SERVICE_UNAVAILABLE, "throttled")
                .await;
        };

        info!(
            bucket = %obj.bucket,
            key = %obj.key,
            chains = chains.len(),
            "performing transforms"
        );

        match self.engine.process(obj, parent, &chains).await {
            Err(e) => {
                warn!(key = %obj.key, error = %e, "engine pass failed");
                self.reply_with_error(obj, StatusCode::BAD_REQUEST, &e.to_string())
                    .await
            }
            Ok(res) => {
                match res.try_copy() {
                    Ok(copy) => {
                        self.cache.set(&obj.key, &res, SUCCESS_TTL);
                        self.spawn_writeback(obj.clone(), copy);
                    }
                    Err(e) => {
                        warn!(key = %obj.key, error = %e, "result not copyable, skipping cache and writeback");
                    }
                }
                res
            }
        }
    }

    /// Persist a derived artifact in the background.
    ///
    /// The client response has already been committed; the writeback runs
    /// under its own bounded deadline so a client timeout cannot cancel
    /// it.
    fn spawn_writeback(&self, obj: DerivedObject, copy: Response) {
        let storage = self.storage.clone();
        tokio::spawn(async move {
            let headers = copy.headers().clone();
            let bytes = match copy.into_bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(key = %obj.key, error = %e, "writeback read failed");
                    return;
                }
            };
            match tokio::time::timeout(WRITEBACK_TIMEOUT, storage.set(&obj, &headers, bytes)).await
            {
                Ok(res) if !res.is_success() => {
                    warn!(key = %obj.key, status = %res.status(), "writeback rejected");
                }
                Ok(_) => debug!(key = %obj.key, "writeback complete"),
                Err(_) => warn!(key = %obj.key, "writeback timed out"),
            }
        });
    }

    /// Produce an error response, substituting a cached, transformed
    /// placeholder when one is configured.
    ///
    /// The placeholder runs under its own single-flight key derived from
    /// the transform chain hash, so identical failures across different
    /// originals share one render.
    pub async fn reply_with_error(
        &self,
        obj: &DerivedObject,
        status: StatusCode,
        error: &str,
    ) -> Response {
        if !obj.has_transforms() || obj.debug {
            return Response::error(status, error);
        }
        let Some(placeholder) = &self.placeholder else {
            return Response::error(status, error);
        };

        let key = format!("{}{:x}", placeholder.source, obj.transforms.hash64());
        if let Some(mut res) = self.cache.get(&key, true) {
            res.set_status(status);
            return res;
        }

        match self.collapse.acquire(&key) {
            Acquired::Owner(owner) => {
                info!(key = %obj.key, placeholder_key = %key, "rendering error placeholder");
                monitoring::placeholder_rendered();
                let parent = Response::buffer(
                    StatusCode::OK,
                    &placeholder.content_type,
                    placeholder.bytes.clone(),
                );
                let chains = vec![obj.transforms.clone()];
                match self.engine.process(obj, parent, &chains).await {
                    Ok(mut res) => {
                        res.set_status(status);
                        self.cache.set(&key, &res, PLACEHOLDER_TTL);
                        owner.publish(&res);
                        res
                    }
                    Err(e) => {
                        warn!(key = %obj.key, error = %e, "placeholder render failed");
                        owner.release();
                        Response::error(status, error)
                    }
                }
            }
            Acquired::Waiter(mut ticket) => {
                let lock_deadline = Instant::now() + self.lock_timeout;
                let received = loop {
                    tokio::select! {
                        received = ticket.recv() => break received,
                        _ = tokio::time::sleep_until(lock_deadline) => break None,
                        _ = tokio::time::sleep(CACHE_PROBE_INTERVAL) => {
                            if let Some(res) = self.cache.get(&key, true) {
                                break Some(res);
                            }
                        }
                    }
                };
                drop(ticket);
                match received {
                    Some(mut res) => {
                        res.set_status(status);
                        res
                    }
                    None => Response::error(status, error),
                }
            }
        }
    }

    /// Apply the configured header overrides for the response's status.
    fn update_headers(&self, mut res: Response) -> Response {
        let status = res.status().as_u16();
        for rule in &self.header_rules {
            if rule.status_codes.contains(&status) {
                for (name, value) in &rule.values {
                    res.set_header(name, value);
                }
                break;
            }
        }
        res
    }

    /// The cache, exposed for the dispatcher's diagnostics and tests.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }
}
