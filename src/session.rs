//! Session: the cache, the pending request table and their configuration.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use crate::cache::{GraphCache, Lookup, DEFAULT_MAX_REFERENCE_HOPS};
use crate::coalescer::Coalescer;
use crate::controller::Controller;
use crate::error::GraphError;
use crate::node::GraphNode;
use crate::path::{Path, PathSet};
use crate::resolver::{Resolution, Resolver, Snapshot};
use crate::source::DataSource;
use crate::tracer::{NoopTracer, Tracer};

/// Tunables of a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Scheduler yields between opening a batch and fetching it. Every
    /// request registered in that window joins the batch.
    pub batch_ticks: usize,
    /// How long a failed fetch keeps its paths marked as failed.
    pub error_ttl: Duration,
    /// Bound on the references followed in one lookup.
    pub max_reference_hops: usize,
    /// Fetches running longer than this fail. `None` waits forever.
    pub fetch_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_ticks: 1,
            error_ttl: Duration::from_secs(5),
            max_reference_hops: DEFAULT_MAX_REFERENCE_HOPS,
            fetch_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Shared engine state.
///
/// A session is created once at application start and passed to every
/// controller. Cloning is cheap; all clones share one cache and one pending
/// table.
#[derive(Clone)]
pub struct Session {
    cache: Arc<RwLock<GraphCache>>,
    coalescer: Coalescer,
    resolver: Resolver,
    config: Arc<SessionConfig>,
    tracer: Arc<dyn Tracer>,
}

impl Session {
    /// Create a session with default settings.
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self::builder(source).build()
    }

    /// Create a builder for customizing the session.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let session = Session::builder(source)
    ///     .error_ttl(Duration::from_secs(10))
    ///     .tracer(LogTracer)
    ///     .build();
    /// ```
    pub fn builder(source: Arc<dyn DataSource>) -> SessionBuilder {
        SessionBuilder::new(source)
    }

    /// The configuration this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Request one path set, fetching what the cache lacks.
    pub async fn request(&self, path_set: &PathSet) -> Result<Snapshot, GraphError> {
        self.coalescer.request(path_set).await
    }

    /// Request several path sets in one batch and merge the results.
    pub async fn resolve(&self, path_sets: &[PathSet]) -> Resolution {
        self.resolver.resolve(path_sets).await
    }

    /// The resolver of this session.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Owned copy of the node at `path`, or `None` if it is not cached.
    pub fn get(&self, path: &Path) -> Result<Option<GraphNode>, GraphError> {
        Ok(match self.cache.read().get(path)? {
            Lookup::Found(node) => Some(node.clone()),
            Lookup::Missing(_) => None,
        })
    }

    /// Merge a JSON Graph document into the cache, e.g. server-rendered data.
    /// Returns the number of nodes written.
    pub fn merge_json(&self, document: Value) -> Result<usize, GraphError> {
        let tree = GraphNode::from_json(document)?;
        Ok(self.cache.write().merge(tree))
    }

    /// Drop the cached subtree at `prefix`; the next request refetches it.
    pub fn invalidate(&self, prefix: &Path) -> bool {
        let removed = self.cache.write().invalidate(prefix);
        self.tracer.on_invalidate(prefix, removed);
        removed
    }

    /// Create a controller whose path sets are derived from its parameters.
    pub fn controller<P, F>(&self, path_sets: F) -> Controller<P>
    where
        P: Send + 'static,
        F: Fn(&P) -> Vec<PathSet> + Send + Sync + 'static,
    {
        Controller::new(self.clone(), path_sets)
    }

    /// Create a controller requesting the same path sets on every mount.
    pub fn fixed_controller(&self, path_sets: Vec<PathSet>) -> Controller<()> {
        Controller::fixed(self.clone(), path_sets)
    }

    /// Clear the cache and drop every pending request.
    ///
    /// Requests waiting on a dropped batch fail with
    /// [`GraphError::FetchFailed`]; fetches still running are discarded.
    pub fn teardown(&self) {
        self.coalescer.clear();
        self.cache.write().invalidate(&Path::root());
        tracing::debug!("session torn down");
    }

    /// Number of batches that have not settled yet.
    pub fn pending_batches(&self) -> usize {
        self.coalescer.pending()
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        self.tracer.as_ref()
    }
}

/// Builder for [`Session`] with customizable settings.
pub struct SessionBuilder {
    source: Arc<dyn DataSource>,
    config: SessionConfig,
    tracer: Arc<dyn Tracer>,
}

impl SessionBuilder {
    /// Create a new builder with default settings.
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            config: SessionConfig::default(),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Set the number of scheduler yields a batch stays open.
    pub fn batch_ticks(mut self, ticks: usize) -> Self {
        self.config.batch_ticks = ticks;
        self
    }

    /// Set how long failed paths are answered from the cache.
    pub fn error_ttl(mut self, ttl: Duration) -> Self {
        self.config.error_ttl = ttl;
        self
    }

    /// Set the reference hop bound.
    pub fn max_reference_hops(mut self, hops: usize) -> Self {
        self.config.max_reference_hops = hops;
        self
    }

    /// Set or disable the fetch timeout.
    pub fn fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the tracer receiving engine events.
    pub fn tracer<T: Tracer>(mut self, tracer: T) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Build the session.
    pub fn build(self) -> Session {
        let cache = Arc::new(RwLock::new(GraphCache::new(self.config.max_reference_hops)));
        let config = Arc::new(self.config);
        let coalescer = Coalescer::new(
            cache.clone(),
            self.source,
            config.clone(),
            self.tracer.clone(),
        );
        let resolver = Resolver::new(cache.clone(), coalescer.clone(), self.tracer.clone());
        Session {
            cache,
            coalescer,
            resolver,
            config,
            tracer: self.tracer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use serde_json::json;

    fn source() -> Arc<MemorySource> {
        Arc::new(MemorySource::new(json!({ "appName": "Gazelle" })).unwrap())
    }

    #[test]
    fn test_builder_settings() {
        let session = Session::builder(source())
            .batch_ticks(3)
            .error_ttl(Duration::from_millis(250))
            .max_reference_hops(4)
            .fetch_timeout(None)
            .build();
        assert_eq!(
            session.config(),
            &SessionConfig {
                batch_ticks: 3,
                error_ttl: Duration::from_millis(250),
                max_reference_hops: 4,
                fetch_timeout: None,
            }
        );
    }

    #[test]
    fn test_merge_get_invalidate() {
        let session = Session::new(source());
        let written = session
            .merge_json(json!({ "appName": "Preloaded", "nav": { "$type": "ref", "value": ["menu"] } }))
            .unwrap();
        assert_eq!(written, 2);

        let app_name: Path = ["appName"].into_iter().collect();
        assert_eq!(
            session.get(&app_name).unwrap(),
            Some(GraphNode::Value(json!("Preloaded")))
        );
        assert_eq!(session.get(&["nav"].into_iter().collect()).unwrap(), None);

        assert!(session.invalidate(&app_name));
        assert_eq!(session.get(&app_name).unwrap(), None);
    }

    #[tokio::test]
    async fn test_teardown_clears_cache() {
        let session = Session::new(source());
        let path_set: PathSet = serde_json::from_value(json!(["appName"])).unwrap();
        session.request(&path_set).await.unwrap();
        assert!(session.get(&["appName"].into_iter().collect()).unwrap().is_some());

        session.teardown();
        assert_eq!(session.get(&["appName"].into_iter().collect()).unwrap(), None);
        assert_eq!(session.pending_batches(), 0);
    }
}
