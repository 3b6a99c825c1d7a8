//! Upstream data sources.
//!
//! The engine depends only on the request/response contract of
//! [`DataSource`]: a batch of path sets goes out, a JSON Graph document
//! covering the resolvable paths comes back, with `{"$type":"atom"}` for paths
//! the source knows to be absent and `{"$type":"error"}` sentinels for paths it
//! could not produce. Transport is up to the implementation.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::cache::{GraphCache, DEFAULT_MAX_REFERENCE_HOPS};
use crate::error::GraphError;
use crate::path::PathSet;

/// A remote (or simulated) JSON graph endpoint.
///
/// # Example
///
/// ```ignore
/// struct HttpSource { client: reqwest::Client, url: String }
///
/// #[async_trait::async_trait]
/// impl DataSource for HttpSource {
///     async fn fetch(&self, path_sets: &[PathSet]) -> anyhow::Result<serde_json::Value> {
///         let response = self.client.post(&self.url).json(path_sets).send().await?;
///         Ok(response.json().await?)
///     }
/// }
/// ```
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// Fetch a batch of path sets, answering with a JSON Graph document.
    ///
    /// Returning an error fails every path of the batch with
    /// [`GraphError::FetchFailed`].
    async fn fetch(&self, path_sets: &[PathSet]) -> anyhow::Result<Value>;
}

/// In-memory data source answering from a fixed JSON graph.
///
/// Every fetch is recorded, which makes this the source of choice for tests
/// and for rendering against fixture data.
pub struct MemorySource {
    graph: GraphCache,
    requests: Mutex<Vec<Vec<PathSet>>>,
    failures: Mutex<VecDeque<String>>,
}

impl MemorySource {
    /// Create a source serving the given JSON Graph document.
    pub fn new(graph: Value) -> Result<Self, GraphError> {
        Ok(Self {
            graph: GraphCache::from_json(graph, DEFAULT_MAX_REFERENCE_HOPS)?,
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Make the next fetch fail with `message`. Calls queue up.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.failures.lock().push_back(message.into());
    }

    /// Number of fetches served so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// The batches received so far, in arrival order.
    pub fn requests(&self) -> Vec<Vec<PathSet>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn fetch(&self, path_sets: &[PathSet]) -> anyhow::Result<Value> {
        self.requests.lock().push(path_sets.to_vec());
        if let Some(message) = self.failures.lock().pop_front() {
            anyhow::bail!(message);
        }
        let mut response = GraphCache::new(self.graph.max_hops());
        for path_set in path_sets {
            for path in path_set.paths() {
                self.graph.extract(&path, &mut response)?;
            }
        }
        Ok(response.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_source_answers_and_records() {
        let source = MemorySource::new(json!({
            "categories": { "bySlug": { "news": { "name": "News" } } }
        }))
        .unwrap();
        let request: PathSet =
            serde_json::from_value(json!(["categories", "bySlug", ["news", "sports"], "name"]))
                .unwrap();

        let response = source.fetch(std::slice::from_ref(&request)).await.unwrap();
        assert_eq!(
            response,
            json!({
                "categories": { "bySlug": {
                    "news": { "name": "News" },
                    "sports": { "$type": "atom" }
                } }
            })
        );
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(source.requests(), vec![vec![request]]);
    }

    #[tokio::test]
    async fn test_memory_source_injected_failure() {
        let source = MemorySource::new(json!({ "appName": "Gazelle" })).unwrap();
        source.fail_next("upstream unavailable");
        let request: PathSet = serde_json::from_value(json!(["appName"])).unwrap();

        let err = source.fetch(std::slice::from_ref(&request)).await.unwrap_err();
        assert_eq!(err.to_string(), "upstream unavailable");
        let ok = source.fetch(std::slice::from_ref(&request)).await.unwrap();
        assert_eq!(ok, json!({ "appName": "Gazelle" }));
        assert_eq!(source.fetch_count(), 2);
    }
}
