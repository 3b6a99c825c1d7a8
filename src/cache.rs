//! In-memory partial mirror of the remote JSON graph.
//!
//! The cache is a branch-rooted tree of [`GraphNode`]s. It is only mutated by
//! [`GraphCache::merge`], [`GraphCache::set`] and [`GraphCache::invalidate`];
//! each of them completes synchronously, so interleaved fetches never observe
//! a half-written branch.
//!
//! References are lookup indirections: following one restarts the walk from
//! the root at the target path. Every reference followed during a single
//! lookup counts against the hop bound, which keeps cyclic or malformed
//! reference chains from looping.

use serde_json::Value;
use tokio::time::Instant;

use crate::error::GraphError;
use crate::node::GraphNode;
use crate::path::{Key, Path};

/// Default bound on the number of references followed in one lookup.
pub const DEFAULT_MAX_REFERENCE_HOPS: usize = 32;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<'a> {
    /// The path (or a terminal node on its way) resolved.
    Found(&'a GraphNode),
    /// Some prefix of the path is absent.
    Missing(Missing),
}

/// A path that could not be resolved from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Missing {
    /// The looked-up path, rewritten through every reference that was
    /// followed before the gap.
    pub path: Path,
    /// Number of leading keys of `path` that are present.
    pub present: usize,
}

impl Missing {
    fn at(mut path: Path, rest: &[Key]) -> Self {
        let present = path.len().saturating_sub(1);
        path.extend(rest);
        Self { path, present }
    }

    /// The shortest absent prefix of the rewritten path.
    pub fn first_absent(&self) -> Path {
        self.path.keys()[..self.present + 1].iter().cloned().collect()
    }
}

enum Walk<'a> {
    Found { node: &'a GraphNode, at: Path },
    /// A terminal node was reached before the last key.
    ShortCircuit { node: &'a GraphNode, at: Path },
    Missing(Missing),
}

/// Branch-rooted graph cache.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphCache {
    root: GraphNode,
    max_hops: usize,
}

impl Default for GraphCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REFERENCE_HOPS)
    }
}

impl GraphCache {
    /// Create an empty cache with the given reference hop bound.
    pub fn new(max_hops: usize) -> Self {
        Self {
            root: GraphNode::default(),
            max_hops,
        }
    }

    /// Build a cache from a JSON Graph document.
    pub fn from_json(value: Value, max_hops: usize) -> Result<Self, GraphError> {
        let mut cache = Self::new(max_hops);
        cache.merge(GraphNode::from_json(value)?);
        Ok(cache)
    }

    /// Render the whole cache as a JSON Graph document.
    pub fn to_json(&self) -> Value {
        self.root.to_json()
    }

    /// The configured reference hop bound.
    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        matches!(&self.root, GraphNode::Branch(branch) if branch.is_empty())
    }

    /// Look up a path.
    ///
    /// References are dereferenced, including a reference sitting at the end
    /// of the path. A terminal node reached before the end of the path is
    /// returned as is. Expired error markers read as missing.
    pub fn get(&self, path: &Path) -> Result<Lookup<'_>, GraphError> {
        Ok(match self.walk(path.keys(), &mut 0, Instant::now())? {
            Walk::Found { node, .. } | Walk::ShortCircuit { node, .. } => Lookup::Found(node),
            Walk::Missing(missing) => Lookup::Missing(missing),
        })
    }

    /// Like [`GraphCache::get`], also returning the absolute path of the node
    /// after references were followed. `None` when the path is missing.
    pub fn resolve(&self, path: &Path) -> Result<Option<(&GraphNode, Path)>, GraphError> {
        Ok(match self.walk(path.keys(), &mut 0, Instant::now())? {
            Walk::Found { node, at } | Walk::ShortCircuit { node, at } => Some((node, at)),
            Walk::Missing(_) => None,
        })
    }

    fn walk(&self, keys: &[Key], hops: &mut usize, now: Instant) -> Result<Walk<'_>, GraphError> {
        let mut node = &self.root;
        let mut at = Path::root();
        for (i, key) in keys.iter().enumerate() {
            let GraphNode::Branch(branch) = node else {
                return Ok(Walk::ShortCircuit { node, at });
            };
            at.push(key.clone());
            let Some(child) = branch.get(key) else {
                return Ok(Walk::Missing(Missing::at(at, &keys[i + 1..])));
            };
            match self.follow(child, at, hops, now)? {
                Walk::Missing(mut missing) => {
                    missing.path.extend(&keys[i + 1..]);
                    return Ok(Walk::Missing(missing));
                }
                Walk::Found { node: next, at: next_at }
                | Walk::ShortCircuit { node: next, at: next_at } => {
                    node = next;
                    at = next_at;
                }
            }
        }
        Ok(Walk::Found { node, at })
    }

    /// Dereference `node` (found at `at`) until it is not a reference.
    fn follow<'a>(
        &'a self,
        node: &'a GraphNode,
        at: Path,
        hops: &mut usize,
        now: Instant,
    ) -> Result<Walk<'a>, GraphError> {
        let (node, at) = match node {
            GraphNode::Ref(target) => {
                *hops += 1;
                if *hops > self.max_hops {
                    return Err(GraphError::BrokenReference {
                        path: at,
                        reason: format!("more than {} references followed", self.max_hops),
                    });
                }
                if target.is_empty() {
                    return Err(GraphError::BrokenReference {
                        path: at,
                        reason: "empty reference".into(),
                    });
                }
                match self.walk(target.keys(), hops, now)? {
                    Walk::Found { node, at } => (node, at),
                    Walk::ShortCircuit {
                        node: GraphNode::Value(_),
                        ..
                    } => {
                        return Err(GraphError::BrokenReference {
                            path: at,
                            reason: format!("reference to {} passes through a value", target),
                        });
                    }
                    // Absence and errors on the way to the target propagate.
                    Walk::ShortCircuit { node, at } => (node, at),
                    Walk::Missing(missing) => return Ok(Walk::Missing(missing)),
                }
            }
            node => (node, at),
        };
        if node.is_expired(now) {
            return Ok(Walk::Missing(Missing::at(at, &[])));
        }
        Ok(Walk::Found { node, at })
    }

    /// Deep-merge a fetched tree into the cache.
    ///
    /// Branches merge key by key and never drop siblings; every other node
    /// replaces what was there. Merging the same tree twice leaves the cache
    /// unchanged. Returns the number of nodes written.
    pub fn merge(&mut self, tree: GraphNode) -> usize {
        merge_node(&mut self.root, tree)
    }

    /// Write `node` at an absolute path, creating branches on the way.
    ///
    /// References are not followed: the path is expected to be already
    /// rewritten, as in [`Missing::path`]. Terminal nodes on the way are
    /// replaced by branches.
    pub fn set(&mut self, path: &Path, node: GraphNode) {
        if path.is_empty() && !matches!(node, GraphNode::Branch(_)) {
            return;
        }
        set_node(&mut self.root, path.keys(), node);
    }

    /// Remove the subtree at `prefix`. The empty path clears the cache.
    ///
    /// References are not followed; invalidating a path that holds a
    /// reference removes the reference, not its target. Returns true if
    /// something was removed.
    pub fn invalidate(&mut self, prefix: &Path) -> bool {
        let Some((last, parents)) = prefix.keys().split_last() else {
            let had_content = !self.is_empty();
            self.root = GraphNode::default();
            return had_content;
        };
        let mut current = &mut self.root;
        for key in parents {
            let GraphNode::Branch(branch) = current else {
                return false;
            };
            match branch.get_mut(key) {
                Some(child) => current = child,
                None => return false,
            }
        }
        match current {
            GraphNode::Branch(branch) => branch.remove(last).is_some(),
            _ => false,
        }
    }

    /// Copy every node along `path` into `into`.
    ///
    /// References are copied together with the nodes on the way to their
    /// targets, so the copy answers the same lookup. The first absent prefix
    /// is recorded as [`GraphNode::NotFound`].
    pub fn extract(&self, path: &Path, into: &mut GraphCache) -> Result<(), GraphError> {
        self.extract_keys(path.keys(), into, &mut 0)
    }

    fn extract_keys(
        &self,
        keys: &[Key],
        into: &mut GraphCache,
        hops: &mut usize,
    ) -> Result<(), GraphError> {
        let mut node = &self.root;
        let mut at = Path::root();
        for (i, key) in keys.iter().enumerate() {
            let GraphNode::Branch(branch) = node else {
                break;
            };
            at.push(key.clone());
            let Some(child) = branch.get(key) else {
                into.set(&at, GraphNode::NotFound);
                return Ok(());
            };
            if let GraphNode::Ref(target) = child {
                *hops += 1;
                if *hops > self.max_hops || target.is_empty() {
                    return Err(GraphError::BrokenReference {
                        path: at,
                        reason: format!("cannot follow reference to [{}]", target),
                    });
                }
                into.set(&at, child.clone());
                let mut rest = target.keys().to_vec();
                rest.extend_from_slice(&keys[i + 1..]);
                return self.extract_keys(&rest, into, hops);
            }
            if child.is_terminal() || i + 1 == keys.len() {
                into.set(&at, child.clone());
                return Ok(());
            }
            node = child;
        }
        Ok(())
    }
}

fn set_node(node: &mut GraphNode, keys: &[Key], value: GraphNode) {
    let Some((first, rest)) = keys.split_first() else {
        *node = value;
        return;
    };
    if !matches!(node, GraphNode::Branch(_)) {
        *node = GraphNode::default();
    }
    if let GraphNode::Branch(branch) = node {
        set_node(branch.entry(first.clone()).or_default(), rest, value);
    }
}

fn merge_node(dst: &mut GraphNode, src: GraphNode) -> usize {
    match (dst, src) {
        (GraphNode::Branch(dst), GraphNode::Branch(src)) => {
            let mut written = 0;
            for (key, child) in src {
                match dst.get_mut(&key) {
                    Some(existing) => written += merge_node(existing, child),
                    None => {
                        dst.insert(key, child);
                        written += 1;
                    }
                }
            }
            written
        }
        (dst, src) => {
            *dst = src;
            1
        }
    }
}
