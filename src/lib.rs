#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod cache;
mod coalescer;
mod controller;
mod error;
mod loading;
mod node;
pub mod path;
mod resolver;
mod session;
mod source;
pub mod tracer;

pub use cache::{GraphCache, Lookup, Missing, DEFAULT_MAX_REFERENCE_HOPS};
pub use controller::{Controller, Phase};
pub use error::{ErrorKind, ErrorMarker, GraphError, PathError};
pub use loading::ViewState;
pub use node::{Branch, GraphNode};
pub use path::{Key, Path, PathSet, Range, Segment};
pub use resolver::{Resolution, Resolver, Snapshot};
pub use session::{Session, SessionBuilder, SessionConfig};
pub use source::{DataSource, MemorySource};
pub use tracer::{BatchId, FetchResult, LogTracer, NoopTracer, SpanId, Tracer};
