//! # disk-rtree: persistent disk-backed spatial indexing
//!
//! A balanced tree over n-dimensional axis-aligned bounding envelopes,
//! stored in a stable binary file format and queried without ever loading
//! the whole dataset into memory:
//!
//! - **Fixed-record storage**: one header plus identically sized node
//!   records, behind a [`NodeStore`] trait with file and in-memory backends
//! - **Pluggable splits**: classical linear and quadratic ("star") R-tree
//!   splitting, or Hilbert-curve leaf ordering with B-tree style midpoint
//!   splits
//! - **Lazy search**: pull-based cursors that prune by envelope and can be
//!   restarted; readers run concurrently, writers are exclusive
//! - **Shared ownership**: a [`TreeManager`] registry hands out one live
//!   [`Tree`] per storage location with reference-counted close semantics
//!
//! ## Quick start
//!
//! ```
//! use disk_rtree::{Envelope, SearchPredicate, TreeManager};
//!
//! # fn main() -> disk_rtree::IndexResult<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let manager = TreeManager::new();
//!
//! let tree = manager.get(dir.path(), "example")?;
//! tree.insert(&Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0])?, 1)?;
//! tree.insert(&Envelope::new(vec![20.0, 20.0], vec![30.0, 30.0])?, 2)?;
//!
//! let query = Envelope::new(vec![5.0, 5.0], vec![15.0, 15.0])?;
//! let hits: Vec<u64> = tree
//!     .search(&query, SearchPredicate::Intersects)?
//!     .collect::<disk_rtree::IndexResult<_>>()?;
//! assert_eq!(hits, vec![1]);
//!
//! manager.close(dir.path(), &tree, "example")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Known limitation
//!
//! Concurrent access to one storage location from multiple processes is
//! undefined behavior. The reader/writer locking is per process; nothing in
//! the file format coordinates across processes.

mod buffer;
mod constants;
mod crs;
mod cursor;
mod envelope;
mod errors;
mod file_store;
mod hilbert;
mod layout;
mod manager;
mod mapper;
mod memory_store;
mod split;
mod store;
mod tree;
mod types;

pub use constants::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_HILBERT_ORDER, DEFAULT_MAX_ELEMENTS, FORMAT_VERSION,
    HEADER_SIZE, MAGIC, MAX_DIMENSION, NIL_NODE,
};
pub use crs::{AxisOrder, CrsTag};
pub use cursor::{SearchCursor, SearchPredicate};
pub use envelope::Envelope;
pub use errors::{IndexError, IndexResult};
pub use file_store::FileNodeStore;
pub use hilbert::{center_index, hilbert_index, MAX_HILBERT_ORDER};
pub use manager::{TreeManager, MAPPER_FILE_NAME, TREE_FILE_NAME};
pub use mapper::{ElementMapper, FileElementMapper, NullElementMapper};
pub use memory_store::MemoryNodeStore;
pub use split::SplitPolicy;
pub use store::NodeStore;
pub use tree::{Tree, TreeOptions};
pub use types::{ElementId, IndexHeader, Node, NodeEntry, NodeId};
