//! Path resolution and materialization.
//!
//! Materialization turns cached nodes into plain JSON shaped like the
//! requested path sets: references are dereferenced, error markers are kept
//! at their exact path, and absent values read as `null`.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::cache::GraphCache;
use crate::coalescer::Coalescer;
use crate::error::PathError;
use crate::node::GraphNode;
use crate::path::{Key, Path, PathSet, Segment};
use crate::tracer::Tracer;

/// One path set materialized from the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Materialized data; index keys are still object keys.
    pub tree: Map<String, Value>,
    /// Error markers met during materialization.
    pub errors: Vec<PathError>,
    /// Requested paths that were not cached.
    pub missing: Vec<Path>,
    /// Number of plain values materialized.
    pub values: usize,
    /// Requested paths whose object in `tree` was built from a cached branch,
    /// as opposed to a stored value.
    pub branches: BTreeSet<Path>,
}

/// Materialize `path_set` from `cache`.
pub(crate) fn materialize(cache: &GraphCache, path_set: &PathSet, tracer: &dyn Tracer) -> Snapshot {
    let mut snapshot = Snapshot::default();
    let mut tree = Map::new();
    fill(
        cache,
        tracer,
        &Path::root(),
        path_set.segments(),
        &mut tree,
        &mut snapshot,
    );
    snapshot.tree = tree;
    snapshot
}

fn fill(
    cache: &GraphCache,
    tracer: &dyn Tracer,
    at: &Path,
    segments: &[Segment],
    out: &mut Map<String, Value>,
    snapshot: &mut Snapshot,
) {
    let Some((segment, rest)) = segments.split_first() else {
        return;
    };
    for key in segment.keys() {
        let path = at.child(key.clone());
        let name = key.to_string();
        let node = match cache.resolve(&path) {
            Ok(Some((node, _))) => node,
            Ok(None) => {
                snapshot.missing.push(path);
                continue;
            }
            Err(err) => {
                tracing::warn!(%path, error = %err, "broken reference");
                tracer.on_broken_reference(&path);
                let marker = err.marker();
                out.insert(name, marker.to_json());
                snapshot.errors.push(PathError {
                    path,
                    error: marker,
                });
                continue;
            }
        };
        match node {
            // Ranges stop at the first index past the end of the collection.
            GraphNode::NotFound if segment.is_range() => break,
            GraphNode::NotFound => {
                out.insert(name, Value::Null);
            }
            GraphNode::Error { marker, .. } => {
                out.insert(name, marker.to_json());
                snapshot.errors.push(PathError {
                    path,
                    error: marker.clone(),
                });
            }
            GraphNode::Value(value) => {
                out.insert(name, value.clone());
                snapshot.values += 1;
            }
            GraphNode::Branch(_) if !rest.is_empty() => {
                snapshot.branches.insert(path.clone());
                let child = out
                    .entry(name)
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(child) = child {
                    fill(cache, tracer, &path, rest, child, snapshot);
                }
            }
            // Whole branches are never handed out.
            GraphNode::Branch(_) | GraphNode::Ref(_) => {}
        }
    }
}

/// The merged outcome of resolving several path sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Materialized data; branches keyed exactly `0..n` are arrays.
    pub data: Value,
    /// Every error marker met, in request order.
    pub errors: Vec<PathError>,
    /// Paths left uncached, e.g. invalidated while the fetch was running.
    pub missing: Vec<Path>,
    /// Number of plain values materialized.
    pub values: usize,
}

impl Resolution {
    fn absorb(&mut self, snapshot: Snapshot) {
        deep_merge(&mut self.data, Value::Object(snapshot.tree));
        self.errors.extend(snapshot.errors);
        self.missing.extend(snapshot.missing);
        self.values += snapshot.values;
    }

    /// Nothing exists at the requested paths.
    pub fn is_not_found(&self) -> bool {
        self.values == 0 && self.errors.is_empty()
    }

    /// Every requested path that produced something produced an error.
    pub fn is_failed(&self) -> bool {
        self.values == 0 && !self.errors.is_empty()
    }
}

/// Requests path sets through the coalescer and materializes them.
#[derive(Clone)]
pub struct Resolver {
    cache: Arc<RwLock<GraphCache>>,
    coalescer: Coalescer,
    tracer: Arc<dyn Tracer>,
}

impl Resolver {
    pub(crate) fn new(
        cache: Arc<RwLock<GraphCache>>,
        coalescer: Coalescer,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            cache,
            coalescer,
            tracer,
        }
    }

    /// Resolve every path set concurrently and merge the results.
    ///
    /// Failures are per path: a path set whose fetch failed materializes
    /// whatever the cache holds for it, failed paths included as error
    /// markers.
    pub async fn resolve(&self, path_sets: &[PathSet]) -> Resolution {
        let requests = path_sets.iter().map(|path_set| self.coalescer.request(path_set));
        let outcomes = join_all(requests).await;

        let mut resolution = Resolution {
            data: Value::Object(Map::new()),
            ..Resolution::default()
        };
        let mut branches = BTreeSet::from([Path::root()]);
        for (path_set, outcome) in path_sets.iter().zip(outcomes) {
            let mut snapshot = match outcome {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::debug!(%path_set, error = %err, "path set failed");
                    let mut snapshot = self.snapshot(path_set);
                    if snapshot.errors.is_empty() {
                        // The failure left nothing in the cache, e.g. after a
                        // teardown.
                        let error = err.marker();
                        for path in snapshot.missing.drain(..) {
                            snapshot.errors.push(PathError {
                                path,
                                error: error.clone(),
                            });
                        }
                    }
                    snapshot
                }
            };
            branches.append(&mut snapshot.branches);
            resolution.absorb(snapshot);
        }
        resolution.data = arrayify(std::mem::take(&mut resolution.data), &Path::root(), &branches);
        resolution
    }

    /// Materialize a path set from the cache without any I/O.
    pub fn snapshot(&self, path_set: &PathSet) -> Snapshot {
        materialize(&self.cache.read(), path_set, self.tracer.as_ref())
    }
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (name, value) in src {
                match dst.get_mut(&name) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dst.insert(name, value);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Turn objects built from branches and keyed exactly `0..n` into arrays,
/// recursively.
///
/// Only objects at paths listed in `branches` are touched; stored values are
/// handed out as they were cached.
fn arrayify(value: Value, at: &Path, branches: &BTreeSet<Path>) -> Value {
    let Value::Object(object) = value else {
        return value;
    };
    if !branches.contains(at) {
        return Value::Object(object);
    }
    let object: Map<String, Value> = object
        .into_iter()
        .map(|(name, child)| {
            let child = arrayify(child, &at.child(Key::name(name.as_str())), branches);
            (name, child)
        })
        .collect();
    let len = object.len();
    let dense = len > 0
        && object
            .keys()
            .all(|name| matches!(Key::name(name.as_str()).as_index(), Some(i) if i < len as u64));
    if !dense {
        return Value::Object(object);
    }
    let mut items: Vec<(u64, Value)> = object
        .into_iter()
        .filter_map(|(name, child)| Key::name(name).as_index().map(|i| (i, child)))
        .collect();
    items.sort_by_key(|(i, _)| *i);
    Value::Array(items.into_iter().map(|(_, child)| child).collect())
}
