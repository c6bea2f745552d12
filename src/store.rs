//! The node store capability interface.

use crate::errors::IndexResult;
use crate::types::{IndexHeader, Node, NodeId};

/// Fixed-record accessor for tree nodes and header metadata.
///
/// A store hands out node records by id and owns the allocation state (the
/// free list and the next-node watermark) carried in the header. All methods
/// take `&self`; implementations synchronize internally so a tree can share
/// one store between concurrent readers. Durability is only guaranteed after
/// [`flush`](NodeStore::flush) or [`close`](NodeStore::close).
///
/// Two backends exist: [`crate::FileNodeStore`] over a buffered
/// random-access file and [`crate::MemoryNodeStore`] over a byte array with
/// the identical record layout.
pub trait NodeStore: Send + Sync {
    /// Current header. Cheap; the header is held in memory while open.
    fn read_header(&self) -> IndexResult<IndexHeader>;

    /// Replaces the header. Persisted on the next flush.
    fn write_header(&self, header: &IndexHeader) -> IndexResult<()>;

    /// Reserves a node id, reusing the free list before growing the file.
    /// The caller is expected to write the record before referencing it.
    fn allocate_node(&self) -> IndexResult<NodeId>;

    /// Returns a node record to the free list.
    fn free_node(&self, node_id: NodeId) -> IndexResult<()>;

    /// Reads one node record.
    fn read_node(&self, node_id: NodeId) -> IndexResult<Node>;

    /// Writes one node record.
    fn write_node(&self, node_id: NodeId, node: &Node) -> IndexResult<()>;

    /// Writes all buffered state through to the backing storage.
    fn flush(&self) -> IndexResult<()>;

    /// Flushes and closes the store. Further calls fail with an argument
    /// error; closing twice is allowed.
    fn close(&self) -> IndexResult<()>;

    fn is_closed(&self) -> bool;
}
