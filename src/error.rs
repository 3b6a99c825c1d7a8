//! Error types and error markers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::path::Path;

/// Errors surfaced by the cache, the coalescer and controllers.
///
/// A path that has not been fetched yet is not an error; it is reported
/// through [`Lookup::Missing`](crate::Lookup).
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// A reference chain could not be followed.
    ///
    /// Either the chain exceeded the configured hop bound, a reference was
    /// empty, or the target path runs through a plain value.
    #[error("broken reference at {path}: {reason}")]
    BrokenReference {
        /// Path at which the reference was encountered.
        path: Path,
        /// Why the chain could not be followed.
        reason: String,
    },

    /// The upstream fetch failed, timed out, or a recent failure is still cached.
    ///
    /// The error is shared by every subscriber of the failed batch.
    #[error("fetch failed: {0}")]
    FetchFailed(Arc<anyhow::Error>),

    /// The upstream answered with something that is not a JSON graph.
    #[error("malformed graph response: {0}")]
    Malformed(String),

    /// The controller has not been mounted.
    #[error("controller is not mounted")]
    NotMounted,
}

impl GraphError {
    pub(crate) fn fetch_failed(message: impl fmt::Display) -> Self {
        GraphError::FetchFailed(Arc::new(anyhow::anyhow!("{}", message)))
    }

    /// Build the marker stored in the cache or materialized for this error.
    pub fn marker(&self) -> ErrorMarker {
        let kind = match self {
            GraphError::BrokenReference { .. } => ErrorKind::BrokenReference,
            GraphError::FetchFailed(_) => ErrorKind::FetchFailed,
            GraphError::Malformed(_) | GraphError::NotMounted => ErrorKind::Upstream,
        };
        ErrorMarker::new(kind, self.to_string())
    }
}

/// Classification of an [`ErrorMarker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Transport failure; short-lived, retried after the marker expires.
    FetchFailed,
    /// A reference chain that does not terminate or points nowhere.
    BrokenReference,
    /// An error sentinel reported by the data source itself.
    Upstream,
}

/// An error recorded at an exact path, in the cache or in materialized data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMarker {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human readable description.
    pub message: String,
}

impl ErrorMarker {
    /// Create a new marker.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Convert this marker back into an error value.
    pub fn to_error(&self, path: &Path) -> GraphError {
        match self.kind {
            ErrorKind::FetchFailed => GraphError::fetch_failed(&self.message),
            ErrorKind::BrokenReference => GraphError::BrokenReference {
                path: path.clone(),
                reason: self.message.clone(),
            },
            ErrorKind::Upstream => GraphError::Malformed(self.message.clone()),
        }
    }

    /// JSON Graph sentinel form: `{"$type":"error","value":{...}}`.
    pub fn to_json(&self) -> Value {
        json!({ "$type": "error", "value": self })
    }
}

impl fmt::Display for ErrorMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// An error marker together with the path it was found at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathError {
    /// Requested path at which the error surfaced.
    pub path: Path,
    /// The recorded error.
    pub error: ErrorMarker,
}
