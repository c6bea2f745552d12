//! LRU record buffer for the file-backed node store.
//!
//! Keeps recently used records decoded in memory so tree descent does not
//! re-read the same few upper-level nodes on every operation. Records are
//! buffered one at a time on access; nothing is preloaded. Dirty records are
//! written back when evicted or flushed.

use std::collections::{HashMap, VecDeque};

use crate::types::{Node, NodeId};

struct BufferedRecord {
    node: Node,
    dirty: bool,
}

pub(crate) struct RecordBuffer {
    records: HashMap<NodeId, BufferedRecord>,
    /// Least recently used at the front.
    order: VecDeque<NodeId>,
    capacity: usize,
}

impl RecordBuffer {
    /// Capacity is given in bytes and converted to whole records; at least
    /// one record is always kept.
    pub fn new(capacity_bytes: usize, record_size: usize) -> RecordBuffer {
        RecordBuffer {
            records: HashMap::new(),
            order: VecDeque::new(),
            capacity: (capacity_bytes / record_size).max(1),
        }
    }

    pub fn get(&mut self, node_id: NodeId) -> Option<&Node> {
        if !self.records.contains_key(&node_id) {
            return None;
        }
        self.touch(node_id);
        self.records.get(&node_id).map(|r| &r.node)
    }

    /// Buffers a record. The caller evicts first if [`RecordBuffer::is_full`].
    /// Writing over an already buffered record keeps the dirty bit sticky.
    pub fn put(&mut self, node_id: NodeId, node: Node, dirty: bool) {
        let dirty = dirty
            || self
                .records
                .get(&node_id)
                .map(|r| r.dirty)
                .unwrap_or(false);
        self.records.insert(node_id, BufferedRecord { node, dirty });
        self.touch(node_id);
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Removes the least recently used record, returning its dirty payload
    /// for write-back when needed.
    pub fn evict(&mut self) -> Option<(NodeId, Node, bool)> {
        while let Some(node_id) = self.order.pop_front() {
            if let Some(record) = self.records.remove(&node_id) {
                return Some((node_id, record.node, record.dirty));
            }
        }
        None
    }

    /// Drops a record without write-back (the node was freed).
    pub fn discard(&mut self, node_id: NodeId) {
        self.records.remove(&node_id);
        self.order.retain(|&id| id != node_id);
    }

    pub fn dirty_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .records
            .iter()
            .filter(|(_, r)| r.dirty)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.records.get(&node_id).map(|r| &r.node)
    }

    pub fn mark_clean(&mut self, node_id: NodeId) {
        if let Some(record) = self.records.get_mut(&node_id) {
            record.dirty = false;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn touch(&mut self, node_id: NodeId) {
        self.order.retain(|&id| id != node_id);
        self.order.push_back(node_id);
    }
}
