//! View state handed to subscribers of a controller.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{ErrorMarker, PathError};

/// Render state of one view.
///
/// `ready` is false only while the first cycle after mount (or after a
/// parameter change) is loading. A ready state without data means the
/// requested entity does not exist.
///
/// # Example
///
/// ```ignore
/// let mut updates = controller.subscribe();
/// controller.mount(params);
/// let state = updates.recv().await.unwrap();
/// match (&state.data, &state.error) {
///     (_, Some(error)) => render_error(error),
///     (Some(data), None) => render(data),
///     (None, None) => render_not_found(),
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    /// False while loading.
    pub ready: bool,
    /// Materialized data, shared read-only.
    pub data: Option<Arc<Value>>,
    /// Set when every requested path failed.
    pub error: Option<ErrorMarker>,
    /// Paths that failed while others succeeded.
    pub errors: Vec<PathError>,
    /// Cycle that produced this state.
    pub generation: u64,
}

impl ViewState {
    /// Create a loading state.
    pub fn loading(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    /// Create a ready state with data and the paths that failed.
    pub fn ready(generation: u64, data: Arc<Value>, errors: Vec<PathError>) -> Self {
        Self {
            ready: true,
            data: Some(data),
            error: None,
            errors,
            generation,
        }
    }

    /// Create a ready state for an entity that does not exist.
    pub fn not_found(generation: u64) -> Self {
        Self {
            ready: true,
            generation,
            ..Self::default()
        }
    }

    /// Create a failed state exposing the first error.
    pub fn errored(generation: u64, errors: Vec<PathError>) -> Self {
        Self {
            ready: true,
            data: None,
            error: errors.first().map(|failed| failed.error.clone()),
            errors,
            generation,
        }
    }

    /// Check if the view is still loading.
    pub fn is_loading(&self) -> bool {
        !self.ready
    }

    /// Check if the view settled without data or error.
    pub fn is_not_found(&self) -> bool {
        self.ready && self.data.is_none() && self.error.is_none()
    }

    /// Get the data if present.
    pub fn get(&self) -> Option<&Arc<Value>> {
        self.data.as_ref()
    }
}
