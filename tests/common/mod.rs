//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{BatchId, DataSource, FetchResult, MemorySource, PathSet, SpanId, Tracer};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Parse a path set from its JSON form.
pub fn ps(value: Value) -> PathSet {
    serde_json::from_value(value).unwrap()
}

/// A small news site graph.
pub fn news_graph() -> Value {
    json!({
        "appName": "Gazelle",
        "categories": { "bySlug": {
            "news": {
                "name": "News",
                "articles": {
                    "0": { "$type": "ref", "value": ["articles", "byId", 1] },
                    "1": { "$type": "ref", "value": ["articles", "byId", 2] },
                    "2": { "$type": "ref", "value": ["articles", "byId", 3] }
                }
            },
            "arts": {
                "name": "Arts",
                "articles": {
                    "0": { "$type": "ref", "value": ["articles", "byId", 4] }
                }
            }
        } },
        "articles": { "byId": {
            "1": { "title": "One", "slug": "one" },
            "2": { "title": "Two", "slug": "two" },
            "3": { "title": "Three", "slug": "three" },
            "4": { "title": "Four", "slug": "four" }
        } },
        "broken": { "$type": "error", "value": { "message": "boom" } }
    })
}

pub fn memory_source() -> Arc<MemorySource> {
    Arc::new(MemorySource::new(news_graph()).unwrap())
}

/// The path sets a category page requests.
pub fn category_page(slug: &str) -> Vec<PathSet> {
    vec![
        ps(json!(["categories", "bySlug", slug, "name"])),
        ps(json!(["categories", "bySlug", slug, "articles", { "length": 10 }, "title"])),
    ]
}

/// Every expanded path the source received, across all fetches.
pub fn fetched_paths(source: &MemorySource) -> Vec<graph_flow::Path> {
    source
        .requests()
        .iter()
        .flatten()
        .flat_map(|path_set| path_set.paths().collect::<Vec<_>>())
        .collect()
}

/// A source that holds every fetch until permits are added to its gate.
pub struct GatedSource {
    pub inner: Arc<MemorySource>,
    pub gate: Semaphore,
    started: AtomicUsize,
}

impl GatedSource {
    pub fn new(inner: Arc<MemorySource>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        })
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }

    /// Yield until `count` fetches have reached the source.
    pub async fn wait_started(&self, count: usize) {
        while self.started() < count {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl DataSource for GatedSource {
    async fn fetch(&self, path_sets: &[PathSet]) -> anyhow::Result<Value> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await?;
        self.inner.fetch(path_sets).await
    }
}

/// A source that never answers.
pub struct StalledSource;

#[async_trait]
impl DataSource for StalledSource {
    async fn fetch(&self, _path_sets: &[PathSet]) -> anyhow::Result<Value> {
        futures::future::pending().await
    }
}

/// Tracer counting the events the tests assert on.
#[derive(Default)]
pub struct CountingTracer {
    spans: AtomicU64,
    pub fetches: AtomicUsize,
    pub failures: AtomicUsize,
    pub joined_in_flight: AtomicUsize,
    pub discarded: AtomicUsize,
    pub broken_references: AtomicUsize,
}

impl Tracer for CountingTracer {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.spans.fetch_add(1, Ordering::Relaxed))
    }

    fn on_request_coalesced(&self, _span_id: SpanId, _batch: BatchId, in_flight: bool) {
        if in_flight {
            self.joined_in_flight.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_fetch_start(&self, _batch: BatchId, _paths: usize) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    fn on_fetch_end(&self, _batch: BatchId, result: FetchResult) {
        if matches!(result, FetchResult::Failed { .. }) {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_broken_reference(&self, _path: &graph_flow::Path) {
        self.broken_references.fetch_add(1, Ordering::Relaxed);
    }

    fn on_resolution_discarded(&self, _generation: u64, _current: u64) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards to a shared [`CountingTracer`] so tests keep a handle to it.
pub struct SharedTracer(pub Arc<CountingTracer>);

impl Tracer for SharedTracer {
    fn new_span_id(&self) -> SpanId {
        self.0.new_span_id()
    }

    fn on_request_coalesced(&self, span_id: SpanId, batch: BatchId, in_flight: bool) {
        self.0.on_request_coalesced(span_id, batch, in_flight)
    }

    fn on_fetch_start(&self, batch: BatchId, paths: usize) {
        self.0.on_fetch_start(batch, paths)
    }

    fn on_fetch_end(&self, batch: BatchId, result: FetchResult) {
        self.0.on_fetch_end(batch, result)
    }

    fn on_broken_reference(&self, path: &graph_flow::Path) {
        self.0.on_broken_reference(path)
    }

    fn on_resolution_discarded(&self, generation: u64, current: u64) {
        self.0.on_resolution_discarded(generation, current)
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::Relaxed)
}
