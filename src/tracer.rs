//! Tracer trait for observing request coalescing and resolution.
//!
//! This module defines the [`Tracer`] trait and related types. The default
//! [`NoopTracer`] costs nothing; [`LogTracer`] forwards events to the
//! `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use graph_flow::{Session, Tracer, SpanId, BatchId};
//!
//! struct FetchCounter(AtomicUsize);
//!
//! impl Tracer for FetchCounter {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(1)
//!     }
//!
//!     fn on_fetch_start(&self, _batch: BatchId, _paths: usize) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let session = Session::builder(source).tracer(FetchCounter(AtomicUsize::new(0))).build();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::path::{Path, PathSet};

/// Unique identifier for one `request` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u64);

/// Identifier of a request batch, unique for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub u64);

/// How a fetch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// Response merged into the cache.
    Merged {
        /// Nodes written by the merge.
        written: usize,
        /// Requested paths the response left unanswered, now cached as absent.
        unanswered: usize,
    },
    /// The fetch failed; its paths carry error markers.
    Failed {
        /// Error description.
        message: String,
    },
}

/// Tracer trait for observing graph-flow execution.
///
/// All methods except [`Tracer::new_span_id`] have empty default
/// implementations, so only the events of interest need overriding.
///
/// Implementations must be `Send + Sync`: fetches run on spawned tasks.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID.
    fn new_span_id(&self) -> SpanId;

    /// Called when a request starts.
    #[inline]
    fn on_request_start(&self, _span_id: SpanId, _path_set: &PathSet) {}

    /// Called after the request was diffed against the cache.
    #[inline]
    fn on_cache_check(&self, _span_id: SpanId, _hits: usize, _misses: usize) {}

    /// Called when a request attaches to a batch, either the open one or one
    /// already in flight.
    #[inline]
    fn on_request_coalesced(&self, _span_id: SpanId, _batch: BatchId, _in_flight: bool) {}

    /// Called when a batch is handed to the data source.
    #[inline]
    fn on_fetch_start(&self, _batch: BatchId, _paths: usize) {}

    /// Called when a batch settles.
    #[inline]
    fn on_fetch_end(&self, _batch: BatchId, _result: FetchResult) {}

    /// Called when a subtree is invalidated.
    #[inline]
    fn on_invalidate(&self, _prefix: &Path, _removed: bool) {}

    /// Called when materialization meets a reference that cannot be followed.
    #[inline]
    fn on_broken_reference(&self, _path: &Path) {}

    /// Called when a controller drops a resolution superseded by a newer cycle.
    #[inline]
    fn on_resolution_discarded(&self, _generation: u64, _current: u64) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer of a [`Session`](crate::Session).
pub struct NoopTracer;

/// Global span counter shared by the built-in tracers.
static SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Tracer forwarding every event to the `tracing` crate at debug level.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn new_span_id(&self) -> SpanId {
        SpanId(SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    fn on_request_start(&self, span_id: SpanId, path_set: &PathSet) {
        tracing::debug!(span = span_id.0, %path_set, "request start");
    }

    fn on_cache_check(&self, span_id: SpanId, hits: usize, misses: usize) {
        tracing::debug!(span = span_id.0, hits, misses, "cache check");
    }

    fn on_request_coalesced(&self, span_id: SpanId, batch: BatchId, in_flight: bool) {
        tracing::debug!(span = span_id.0, batch = batch.0, in_flight, "request coalesced");
    }

    fn on_fetch_start(&self, batch: BatchId, paths: usize) {
        tracing::debug!(batch = batch.0, paths, "fetch start");
    }

    fn on_fetch_end(&self, batch: BatchId, result: FetchResult) {
        tracing::debug!(batch = batch.0, ?result, "fetch end");
    }

    fn on_invalidate(&self, prefix: &Path, removed: bool) {
        tracing::debug!(%prefix, removed, "invalidate");
    }

    fn on_broken_reference(&self, path: &Path) {
        tracing::debug!(%path, "broken reference");
    }

    fn on_resolution_discarded(&self, generation: u64, current: u64) {
        tracing::debug!(generation, current, "stale resolution discarded");
    }
}
