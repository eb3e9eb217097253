//! Shared fixtures: a scripted engine, instrumented storage and a
//! coordinator assembled over in-memory backends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::watch;

use refract::config::{
    AppConfig, BucketConfig, HeaderRule, PlaceholderSource, PresetConfig, ServerConfig,
    StorageConfig, TransformConfig, TransformKind,
};
use refract::engine::{EngineError, ImageEngine};
use refract::object::{DerivedObject, Transform, TransformChain};
use refract::processor::Coordinator;
use refract::response::Response;
use refract::storage::{
    ListedObject, MemoryBackend, ObjectBackend, StorageDispatcher, StorageError,
};

/// Bytes of the configured placeholder source.
pub const PLACEHOLDER_BYTES: &[u8] = b"placeholder-src";

/// Engine double: prefixes the input bytes with `processed:`, counts
/// calls and concurrency, records the chains it was handed, and can be
/// gated or scripted to fail transform passes.
pub struct MockEngine {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    chains_seen: Mutex<Vec<Vec<TransformChain>>>,
    gate: Option<watch::Receiver<bool>>,
    /// Only the first N calls wait on the gate.
    gated_calls: usize,
    /// Fail every pass whose input is not the placeholder source.
    fail_transforms: bool,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            chains_seen: Mutex::new(Vec::new()),
            gate: None,
            gated_calls: 0,
            fail_transforms: false,
        })
    }

    /// Engine whose first `n` calls block until the returned sender
    /// publishes `true`.
    pub fn gated(n: usize) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let engine = Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            chains_seen: Mutex::new(Vec::new()),
            gate: Some(rx),
            gated_calls: n,
            fail_transforms: false,
        });
        (engine, tx)
    }

    /// Engine that rejects every pass except placeholder renders.
    pub fn failing_transforms() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            chains_seen: Mutex::new(Vec::new()),
            gate: None,
            gated_calls: 0,
            fail_transforms: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn chains_seen(&self) -> Vec<Vec<TransformChain>> {
        self.chains_seen.lock().clone()
    }
}

#[async_trait]
impl ImageEngine for MockEngine {
    async fn process(
        &self,
        _obj: &DerivedObject,
        input: Response,
        chains: &[TransformChain],
    ) -> Result<Response, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.chains_seen.lock().push(chains.to_vec());

        if call < self.gated_calls {
            if let Some(gate) = &self.gate {
                let mut gate = gate.clone();
                while !*gate.borrow() {
                    if gate.changed().await.is_err() {
                        break;
                    }
                }
            }
        }

        let result = async {
            let bytes = input.into_bytes().await.map_err(|e| EngineError::Internal {
                message: e.to_string(),
            })?;
            if self.fail_transforms && bytes != Bytes::from_static(PLACEHOLDER_BYTES) {
                return Err(EngineError::Internal {
                    message: "scripted transform failure".to_string(),
                });
            }
            let body = [b"processed:".as_slice(), &bytes].concat();
            Ok(Response::buffer(
                StatusCode::OK,
                "image/jpeg",
                Bytes::from(body),
            ))
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Per-operation call counters for a wrapped backend.
#[derive(Default)]
pub struct StorageStats {
    pub gets: AtomicUsize,
    pub heads: AtomicUsize,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
}

/// Backend decorator: counts operations and optionally delays reads, for
/// deadline tests.
#[derive(Clone)]
pub struct InstrumentedBackend {
    inner: MemoryBackend,
    pub stats: Arc<StorageStats>,
    delay: Option<Duration>,
}

impl InstrumentedBackend {
    pub fn new(delay: Option<Duration>) -> Self {
        Self {
            inner: MemoryBackend::new(),
            stats: Arc::new(StorageStats::default()),
            delay,
        }
    }

    pub async fn seed(&self, key: &str, content_type: &str, bytes: &'static [u8]) {
        self.inner
            .insert(key, content_type, Bytes::from_static(bytes))
            .await;
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.contains(key).await
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ObjectBackend for InstrumentedBackend {
    async fn get(&self, key: &str) -> Result<Response, StorageError> {
        self.stats.gets.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> Result<Response, StorageError> {
        self.stats.heads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.inner.head(key).await
    }

    async fn put(
        &self,
        key: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, StorageError> {
        self.stats.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, headers, body).await
    }

    async fn delete(&self, key: &str) -> Result<Response, StorageError> {
        self.stats.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<ListedObject>, StorageError> {
        self.inner.scan(prefix).await
    }
}

/// Knobs for assembling a test gateway.
pub struct GatewayOptions {
    pub kind: TransformKind,
    pub check_parent: bool,
    pub throttle_limit: usize,
    pub with_placeholder: bool,
    pub storage_delay: Option<Duration>,
    pub headers: Vec<HeaderRule>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            kind: TransformKind::Query,
            check_parent: false,
            throttle_limit: 8,
            with_placeholder: true,
            storage_delay: None,
            headers: Vec::new(),
        }
    }
}

/// A coordinator over instrumented in-memory storage plus everything a
/// scenario needs to poke at.
pub struct Gateway {
    pub config: AppConfig,
    pub coordinator: Arc<Coordinator>,
    pub basic: InstrumentedBackend,
    pub transform: InstrumentedBackend,
}

pub fn build_gateway(engine: Arc<dyn ImageEngine>, opts: GatewayOptions) -> Gateway {
    let mut presets = HashMap::new();
    presets.insert(
        "small".to_string(),
        PresetConfig {
            operations: vec![Transform::Resize {
                width: Some(100),
                height: Some(100),
            }],
        },
    );
    let mut buckets = HashMap::new();
    buckets.insert(
        "demo".to_string(),
        BucketConfig {
            transform: Some(TransformConfig {
                kind: opts.kind,
                check_parent: opts.check_parent,
                presets,
            }),
            storage: StorageConfig::memory(),
        },
    );
    let config = AppConfig {
        server: ServerConfig {
            request_timeout: 5,
            throttle_limit: opts.throttle_limit,
            ..ServerConfig::default()
        },
        headers: opts.headers,
        buckets,
    };

    let basic = InstrumentedBackend::new(opts.storage_delay);
    let transform = InstrumentedBackend::new(None);
    let mut storage = StorageDispatcher::empty();
    storage.insert_bucket(
        "demo",
        Arc::new(basic.clone()),
        Arc::new(transform.clone()),
    );

    let placeholder = opts.with_placeholder.then(|| PlaceholderSource {
        source: "/etc/refract/placeholder.png".to_string(),
        content_type: "image/png".to_string(),
        bytes: Bytes::from_static(PLACEHOLDER_BYTES),
    });

    let coordinator = Arc::new(Coordinator::new(
        &config,
        Arc::new(storage),
        engine,
        placeholder,
    ));

    Gateway {
        config,
        coordinator,
        basic,
        transform,
    }
}

/// Poll `check` until it yields true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
