//! Graph nodes and the JSON Graph wire format.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::error::{ErrorKind, ErrorMarker, GraphError};
use crate::path::{Key, Path};

/// Children of a branch node.
pub type Branch = BTreeMap<Key, GraphNode>;

/// A node of the cached graph.
///
/// Clone is deep; the cache hands out owned copies only through
/// [`Session::get`](crate::Session::get).
#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    /// Mapping from key to child node.
    Branch(Branch),
    /// Link to a node elsewhere in the graph.
    ///
    /// The referring node does not own the target; it is looked up by path on
    /// every dereference.
    Ref(Path),
    /// Terminal value.
    Value(Value),
    /// Server-confirmed absence.
    NotFound,
    /// Error recorded at this path.
    Error {
        /// What went wrong.
        marker: ErrorMarker,
        /// When set, the marker reads as missing from this instant on.
        expires: Option<Instant>,
    },
}

impl Default for GraphNode {
    fn default() -> Self {
        GraphNode::Branch(Branch::new())
    }
}

impl GraphNode {
    /// An error node that never expires.
    pub fn error(marker: ErrorMarker) -> Self {
        GraphNode::Error {
            marker,
            expires: None,
        }
    }

    /// Returns true for nodes that end path traversal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GraphNode::Branch(_) | GraphNode::Ref(_))
    }

    /// Returns true if this is an error marker whose validity window has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self {
            GraphNode::Error {
                expires: Some(expires),
                ..
            } => *expires <= now,
            _ => false,
        }
    }

    /// Parse a JSON Graph document.
    ///
    /// | JSON                                      | node            |
    /// |-------------------------------------------|-----------------|
    /// | object without `$type`                    | `Branch`        |
    /// | `{"$type":"ref","value":[...]}`           | `Ref`           |
    /// | `{"$type":"atom"}`                        | `NotFound`      |
    /// | `{"$type":"atom","value":v}`              | `Value(v)`      |
    /// | `{"$type":"error","value":...}`           | `Error`         |
    /// | anything else                             | `Value`         |
    pub fn from_json(value: Value) -> Result<Self, GraphError> {
        let Value::Object(mut object) = value else {
            return Ok(GraphNode::Value(value));
        };
        let Some(kind) = object.remove("$type") else {
            let mut branch = Branch::new();
            for (name, child) in object {
                branch.insert(Key::name(name), GraphNode::from_json(child)?);
            }
            return Ok(GraphNode::Branch(branch));
        };
        let inner = object.remove("value");
        match kind.as_str() {
            Some("ref") => {
                let inner = inner
                    .ok_or_else(|| GraphError::Malformed("reference without value".into()))?;
                let path: Path = serde_json::from_value(inner)
                    .map_err(|e| GraphError::Malformed(format!("invalid reference path: {}", e)))?;
                Ok(GraphNode::Ref(path))
            }
            Some("atom") => Ok(match inner {
                None => GraphNode::NotFound,
                Some(value) => GraphNode::Value(value),
            }),
            Some("error") => Ok(GraphNode::error(upstream_marker(inner))),
            _ => Err(GraphError::Malformed(format!("unknown $type {}", kind))),
        }
    }

    /// Render this node in JSON Graph form.
    ///
    /// Expiry of error markers is not part of the wire format and is dropped.
    pub fn to_json(&self) -> Value {
        match self {
            GraphNode::Branch(branch) => Value::Object(
                branch
                    .iter()
                    .map(|(key, child)| (key.to_string(), child.to_json()))
                    .collect::<Map<_, _>>(),
            ),
            GraphNode::Ref(path) => json!({ "$type": "ref", "value": path }),
            GraphNode::Value(Value::Object(object)) => {
                json!({ "$type": "atom", "value": object })
            }
            GraphNode::Value(value) => value.clone(),
            GraphNode::NotFound => json!({ "$type": "atom" }),
            GraphNode::Error { marker, .. } => marker.to_json(),
        }
    }
}

/// Interpret the payload of an upstream error sentinel.
fn upstream_marker(inner: Option<Value>) -> ErrorMarker {
    match inner {
        Some(Value::Object(object)) => {
            if let Ok(marker) = serde_json::from_value::<ErrorMarker>(Value::Object(object.clone()))
            {
                return marker;
            }
            let message = object
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| Value::Object(object).to_string());
            ErrorMarker::new(ErrorKind::Upstream, message)
        }
        Some(Value::String(message)) => ErrorMarker::new(ErrorKind::Upstream, message),
        Some(other) => ErrorMarker::new(ErrorKind::Upstream, other.to_string()),
        None => ErrorMarker::new(ErrorKind::Upstream, "unspecified upstream error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_graph() {
        let node = GraphNode::from_json(json!({
            "articles": {
                "byId": { "7": { "title": "Hello", "tags": ["a", "b"] } }
            },
            "featured": { "$type": "ref", "value": ["articles", "byId", 7] },
            "gone": { "$type": "atom" },
            "meta": { "$type": "atom", "value": { "nested": true } },
            "broken": { "$type": "error", "value": { "message": "boom" } }
        }))
        .unwrap();

        let GraphNode::Branch(root) = node else {
            panic!("expected branch");
        };
        assert_eq!(
            root[&Key::name("featured")],
            GraphNode::Ref(["articles", "byId", "7"].into_iter().collect())
        );
        assert_eq!(root[&Key::name("gone")], GraphNode::NotFound);
        assert_eq!(
            root[&Key::name("meta")],
            GraphNode::Value(json!({ "nested": true }))
        );
        assert_eq!(
            root[&Key::name("broken")],
            GraphNode::error(ErrorMarker::new(ErrorKind::Upstream, "boom"))
        );

        let GraphNode::Branch(articles) = &root[&Key::name("articles")] else {
            panic!("expected branch");
        };
        let GraphNode::Branch(by_id) = &articles[&Key::name("byId")] else {
            panic!("expected branch");
        };
        assert!(by_id.contains_key(&Key::Index(7)));
    }

    #[test]
    fn test_json_round_trip_preserves_sentinels() {
        let doc = json!({
            "a": { "$type": "ref", "value": ["b", 1] },
            "b": { "1": "one", "2": { "$type": "atom" } },
            "c": { "$type": "atom", "value": { "x": 1 } }
        });
        let node = GraphNode::from_json(doc.clone()).unwrap();
        assert_eq!(node.to_json(), doc);
    }

    #[test]
    fn test_malformed_sentinels() {
        assert!(matches!(
            GraphNode::from_json(json!({ "$type": "ref" })),
            Err(GraphError::Malformed(_))
        ));
        assert!(matches!(
            GraphNode::from_json(json!({ "$type": "ref", "value": "a.b" })),
            Err(GraphError::Malformed(_))
        ));
        assert!(matches!(
            GraphNode::from_json(json!({ "$type": "mystery" })),
            Err(GraphError::Malformed(_))
        ));
    }

    #[test]
    fn test_error_expiry() {
        let now = Instant::now();
        let node = GraphNode::Error {
            marker: ErrorMarker::new(ErrorKind::FetchFailed, "timeout"),
            expires: Some(now + std::time::Duration::from_secs(1)),
        };
        assert!(!node.is_expired(now));
        assert!(node.is_expired(now + std::time::Duration::from_secs(1)));
        assert!(!GraphNode::NotFound.is_expired(now));
    }
}
