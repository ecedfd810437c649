//! Read-side graph index and the tool catalog.
//!
//! The index is an in-memory overlay over current entity versions: O(1) id
//! lookups, adjacency lists, and an inverted token index for search and
//! similarity. It is rebuilt from the gateway on cold start and updated
//! in-place by every successful write.
//!
//! The tool dispatcher exposes the fixed catalog of twelve graph
//! operations. Both the server API and a client's local replica run the
//! same dispatcher, so a tool call means the same thing everywhere.

pub mod index;
pub mod tokens;
pub mod tools;

pub use index::GraphIndex;
pub use tools::{NullSink, ToolContext, ToolDispatcher, ToolError, WriteSink};
