//! Request coalescing.
//!
//! A request is first diffed against the cache, then against the table of
//! pending requests. Paths already being fetched are awaited as a subscriber
//! of the batch that carries them; the residual joins the open batch, which
//! a spawned flush task hands to the data source after a few scheduler
//! yields. Every caller registered before the flush shares one fetch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::cache::{GraphCache, Lookup};
use crate::error::{ErrorKind, ErrorMarker, GraphError};
use crate::node::GraphNode;
use crate::path::{Key, Path, PathSet, Segment};
use crate::resolver::{materialize, Snapshot};
use crate::session::SessionConfig;
use crate::source::DataSource;
use crate::tracer::{BatchId, FetchResult, SpanId, Tracer};

type Outcome = Result<(), GraphError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    /// Still accepting paths.
    Collecting,
    /// Handed to the data source.
    InFlight,
}

struct PendingRequest {
    id: u64,
    paths: BTreeSet<Path>,
    subscribers: Vec<oneshot::Sender<Outcome>>,
    state: PendingState,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    requests: Slab<PendingRequest>,
    /// Which batch carries each pending path.
    in_flight: AHashMap<Path, usize>,
    /// The batch accepting new paths, if any.
    open: Option<usize>,
    next_id: u64,
}

impl PendingTable {
    fn get(&self, key: usize, id: u64) -> Option<&PendingRequest> {
        self.requests.get(key).filter(|request| request.id == id)
    }

    fn get_mut(&mut self, key: usize, id: u64) -> Option<&mut PendingRequest> {
        self.requests.get_mut(key).filter(|request| request.id == id)
    }

    fn open_batch(&mut self) -> (usize, bool) {
        if let Some(key) = self.open {
            return (key, false);
        }
        self.next_id += 1;
        let key = self.requests.insert(PendingRequest {
            id: self.next_id,
            paths: BTreeSet::new(),
            subscribers: Vec::new(),
            state: PendingState::Collecting,
        });
        self.open = Some(key);
        (key, true)
    }

    fn remove(&mut self, key: usize, id: u64) -> Option<PendingRequest> {
        self.get(key, id)?;
        let request = self.requests.remove(key);
        for path in &request.paths {
            if self.in_flight.get(path) == Some(&key) {
                self.in_flight.remove(path);
            }
        }
        if self.open == Some(key) {
            self.open = None;
        }
        Some(request)
    }
}

/// Deduplicates and batches cache misses into data source fetches.
#[derive(Clone)]
pub(crate) struct Coalescer {
    cache: Arc<RwLock<GraphCache>>,
    table: Arc<Mutex<PendingTable>>,
    source: Arc<dyn DataSource>,
    config: Arc<SessionConfig>,
    tracer: Arc<dyn Tracer>,
}

impl Coalescer {
    pub(crate) fn new(
        cache: Arc<RwLock<GraphCache>>,
        source: Arc<dyn DataSource>,
        config: Arc<SessionConfig>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            cache,
            table: Arc::new(Mutex::new(PendingTable::default())),
            source,
            config,
            tracer,
        }
    }

    /// Make every path of `path_set` available in the cache, fetching at most
    /// once per path across concurrent callers, then materialize it.
    ///
    /// Fails with [`GraphError::FetchFailed`] when a batch this request
    /// waited on failed, or when the cache holds a live fetch failure for one
    /// of its paths.
    pub(crate) async fn request(&self, path_set: &PathSet) -> Result<Snapshot, GraphError> {
        let span = self.tracer.new_span_id();
        self.tracer.on_request_start(span, path_set);

        for waiter in self.register(span, path_set) {
            match waiter.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(GraphError::fetch_failed(
                        "pending request dropped before its batch settled",
                    ))
                }
            }
        }

        let snapshot = materialize(&self.cache.read(), path_set, self.tracer.as_ref());
        if let Some(failed) = snapshot
            .errors
            .iter()
            .find(|failed| failed.error.kind == ErrorKind::FetchFailed)
        {
            return Err(failed.error.to_error(&failed.path));
        }
        Ok(snapshot)
    }

    /// Diff against cache and pending table, then subscribe to every batch
    /// carrying one of the misses. Both locks are held for the whole diff.
    fn register(&self, span: SpanId, path_set: &PathSet) -> Vec<oneshot::Receiver<Outcome>> {
        let mut guard = self.table.lock();
        let table = &mut *guard;

        let mut hits = 0;
        let mut misses = Vec::new();
        {
            let cache = self.cache.read();
            for path in path_set.paths() {
                match cache.get(&path) {
                    // Aliases of one entity share the rewritten path.
                    Ok(Lookup::Missing(missing)) => misses.push(missing.path),
                    // Broken references are reported by materialization;
                    // fetching cannot repair them.
                    Ok(Lookup::Found(_)) | Err(_) => hits += 1,
                }
            }
        }
        self.tracer.on_cache_check(span, hits, misses.len());

        let mut batches: Vec<usize> = Vec::new();
        let mut residual = Vec::new();
        for path in misses {
            match table.in_flight.get(&path) {
                Some(&key) => {
                    if !batches.contains(&key) {
                        batches.push(key);
                    }
                }
                None => residual.push(path),
            }
        }

        if !residual.is_empty() {
            let (key, opened) = table.open_batch();
            let request = &mut table.requests[key];
            for path in residual {
                table.in_flight.insert(path.clone(), key);
                request.paths.insert(path);
            }
            if !batches.contains(&key) {
                batches.push(key);
            }
            if opened {
                tokio::spawn(self.clone().flush(key, request.id));
            }
        }

        batches
            .into_iter()
            .map(|key| {
                let request = &mut table.requests[key];
                self.tracer.on_request_coalesced(
                    span,
                    BatchId(request.id),
                    request.state == PendingState::InFlight,
                );
                let (tx, rx) = oneshot::channel();
                request.subscribers.push(tx);
                rx
            })
            .collect()
    }

    /// Close the batch after `batch_ticks` yields, fetch it and settle it.
    async fn flush(self, key: usize, id: u64) {
        for _ in 0..self.config.batch_ticks {
            tokio::task::yield_now().await;
        }

        let paths: Vec<Path> = {
            let mut table = self.table.lock();
            if table.open == Some(key) {
                table.open = None;
            }
            match table.get_mut(key, id) {
                Some(request) => {
                    request.state = PendingState::InFlight;
                    request.paths.iter().cloned().collect()
                }
                // Torn down before the flush.
                None => return,
            }
        };

        let batch = BatchId(id);
        self.tracer.on_fetch_start(batch, paths.len());
        let path_sets = collapse(&paths);
        let fetched = match self.config.fetch_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.source.fetch(&path_sets)).await {
                    Ok(fetched) => fetched,
                    Err(_) => Err(anyhow::anyhow!("fetch timed out after {:?}", limit)),
                }
            }
            None => self.source.fetch(&path_sets).await,
        };
        let response =
            fetched.and_then(|value| GraphNode::from_json(value).map_err(anyhow::Error::from));

        let Some((outcome, subscribers, result)) = self.settle(key, id, response) else {
            tracing::debug!(batch = id, "batch settled after teardown, response dropped");
            return;
        };
        for subscriber in subscribers {
            // A dropped receiver only means that caller went away.
            let _ = subscriber.send(outcome.clone());
        }
        self.tracer.on_fetch_end(batch, result);
    }

    /// Write the fetch result into the cache and retire the batch.
    ///
    /// The cache write and the pending table update happen under both locks,
    /// so no request can observe the paths as neither cached nor pending.
    #[allow(clippy::type_complexity)]
    fn settle(
        &self,
        key: usize,
        id: u64,
        response: anyhow::Result<GraphNode>,
    ) -> Option<(Outcome, Vec<oneshot::Sender<Outcome>>, FetchResult)> {
        let mut table = self.table.lock();
        let request = table.remove(key, id)?;
        let mut cache = self.cache.write();

        let (outcome, result) = match response {
            Ok(tree) => {
                let written = cache.merge(tree);
                let mut unanswered = 0;
                for path in &request.paths {
                    if let Some(at) = missing_path(&cache, path) {
                        cache.set(&at, GraphNode::NotFound);
                        unanswered += 1;
                    }
                }
                if unanswered > 0 {
                    tracing::debug!(batch = id, unanswered, "unanswered paths cached as absent");
                }
                (Ok(()), FetchResult::Merged { written, unanswered })
            }
            Err(err) => {
                let message = format!("{:#}", err);
                tracing::warn!(batch = id, paths = request.paths.len(), error = %message, "fetch failed");
                let marker = ErrorMarker::new(ErrorKind::FetchFailed, message.clone());
                let expires = Some(Instant::now() + self.config.error_ttl);
                for path in &request.paths {
                    if let Some(at) = missing_path(&cache, path) {
                        cache.set(
                            &at,
                            GraphNode::Error {
                                marker: marker.clone(),
                                expires,
                            },
                        );
                    }
                }
                (
                    Err(GraphError::FetchFailed(Arc::new(err))),
                    FetchResult::Failed { message },
                )
            }
        };
        Some((outcome, request.subscribers, result))
    }

    /// Drop every pending request. Their subscribers observe `FetchFailed`;
    /// fetches already running are discarded when they complete.
    pub(crate) fn clear(&self) {
        let mut table = self.table.lock();
        let pending = table.requests.len();
        table.requests.clear();
        table.in_flight.clear();
        table.open = None;
        if pending > 0 {
            tracing::debug!(pending, "pending requests dropped");
        }
    }

    /// Number of batches not yet settled.
    pub(crate) fn pending(&self) -> usize {
        self.table.lock().requests.len()
    }
}

fn missing_path(cache: &GraphCache, path: &Path) -> Option<Path> {
    match cache.get(path) {
        Ok(Lookup::Missing(missing)) => Some(missing.path),
        _ => None,
    }
}

/// Group sorted literal paths sharing everything but their last key.
fn collapse(paths: &[Path]) -> Vec<PathSet> {
    let mut groups: BTreeMap<&[Key], Vec<Key>> = BTreeMap::new();
    for path in paths {
        if let Some((last, parent)) = path.keys().split_last() {
            groups.entry(parent).or_default().push(last.clone());
        }
    }
    groups
        .into_iter()
        .map(|(parent, mut last)| {
            let tail = if last.len() == 1 {
                Segment::Key(last.remove(0))
            } else {
                Segment::List(last)
            };
            parent
                .iter()
                .cloned()
                .map(Segment::Key)
                .chain(std::iter::once(tail))
                .collect()
        })
        .collect()
}
