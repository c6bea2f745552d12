//! In-memory node store over a byte array.
//!
//! Same record layout as the file backend, backed by a growable `Vec<u8>`.
//! Useful for tests, scratch indexes, and embedding an index image inside
//! another file; `to_bytes`/`from_bytes` round-trip the whole store.

use parking_lot::RwLock;

use crate::constants::{HEADER_SIZE, NIL_NODE};
use crate::errors::{IndexError, IndexResult};
use crate::layout::{decode_header, encode_header, RecordLayout};
use crate::store::NodeStore;
use crate::tree::TreeOptions;
use crate::types::{IndexHeader, Node, NodeId};

pub struct MemoryNodeStore {
    state: RwLock<MemoryState>,
}

struct MemoryState {
    data: Vec<u8>,
    header: IndexHeader,
    layout: RecordLayout,
    closed: bool,
}

impl MemoryNodeStore {
    /// Creates an empty in-memory store.
    pub fn create(options: &TreeOptions) -> IndexResult<MemoryNodeStore> {
        options.validate()?;
        let header = IndexHeader::new(
            options.dimension,
            options.max_elements,
            options.split_policy,
            options.crs.encode(),
        );
        let mut data = vec![0u8; HEADER_SIZE];
        data.copy_from_slice(&encode_header(&header)?);
        let layout = RecordLayout::new(header.dimension, header.max_elements);
        Ok(MemoryNodeStore {
            state: RwLock::new(MemoryState {
                data,
                header,
                layout,
                closed: false,
            }),
        })
    }

    /// Adopts a previously serialized store image. The header is validated
    /// before any node is touched.
    pub fn from_bytes(data: Vec<u8>) -> IndexResult<MemoryNodeStore> {
        if data.len() < HEADER_SIZE {
            return Err(IndexError::format("byte array too short for an index header"));
        }
        let header = decode_header(&data[..HEADER_SIZE])?;
        let layout = RecordLayout::new(header.dimension, header.max_elements);
        Ok(MemoryNodeStore {
            state: RwLock::new(MemoryState {
                data,
                header,
                layout,
                closed: false,
            }),
        })
    }

    /// A self-contained image of the store, loadable with `from_bytes`.
    pub fn to_bytes(&self) -> IndexResult<Vec<u8>> {
        let state = self.state.read();
        let mut data = state.data.clone();
        data[..HEADER_SIZE].copy_from_slice(&encode_header(&state.header)?);
        Ok(data)
    }
}

impl MemoryState {
    fn ensure_open(&self) -> IndexResult<()> {
        if self.closed {
            Err(IndexError::argument("node store is closed"))
        } else {
            Ok(())
        }
    }

    fn ensure_known(&self, node_id: NodeId) -> IndexResult<()> {
        if node_id >= self.header.next_node {
            Err(IndexError::structural(format!(
                "node id {} beyond allocation watermark {}",
                node_id, self.header.next_node
            )))
        } else {
            Ok(())
        }
    }

    fn record_range(&mut self, node_id: NodeId) -> std::ops::Range<usize> {
        let start = self.layout.record_offset(node_id) as usize;
        let end = start + self.layout.record_size();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        start..end
    }
}

impl NodeStore for MemoryNodeStore {
    fn read_header(&self) -> IndexResult<IndexHeader> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.header.clone())
    }

    fn write_header(&self, header: &IndexHeader) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.header = header.clone();
        Ok(())
    }

    fn allocate_node(&self) -> IndexResult<NodeId> {
        let mut state = self.state.write();
        state.ensure_open()?;
        if state.header.free_head != NIL_NODE {
            let node_id = state.header.free_head;
            let range = state.record_range(node_id);
            let next = state.layout.decode_free(&state.data[range])?;
            state.header.free_head = next;
            return Ok(node_id);
        }
        let node_id = state.header.next_node;
        state.header.next_node += 1;
        Ok(node_id)
    }

    fn free_node(&self, node_id: NodeId) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.ensure_known(node_id)?;
        let next = state.header.free_head;
        let range = state.record_range(node_id);
        let layout = state.layout;
        layout.encode_free(next, &mut state.data[range]);
        state.header.free_head = node_id;
        Ok(())
    }

    fn read_node(&self, node_id: NodeId) -> IndexResult<Node> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.ensure_known(node_id)?;
        let range = state.record_range(node_id);
        state.layout.decode_node(&state.data[range])
    }

    fn write_node(&self, node_id: NodeId, node: &Node) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.ensure_known(node_id)?;
        for entry in node.entries() {
            if entry.envelope.dimension() != state.layout.dimension {
                return Err(IndexError::argument(format!(
                    "entry dimension {} does not match store dimension {}",
                    entry.envelope.dimension(),
                    state.layout.dimension
                )));
            }
        }
        let range = state.record_range(node_id);
        let layout = state.layout;
        layout.encode_node(node, &mut state.data[range])
    }

    fn flush(&self) -> IndexResult<()> {
        let state = self.state.read();
        state.ensure_open()
    }

    fn close(&self) -> IndexResult<()> {
        let mut state = self.state.write();
        state.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.read().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::types::NodeEntry;

    fn leaf(values: &[u64]) -> Node {
        Node::Leaf {
            entries: values
                .iter()
                .map(|&v| {
                    NodeEntry::new(Envelope::point(&[v as f64, v as f64]).unwrap(), v)
                })
                .collect(),
        }
    }

    #[test]
    fn test_node_roundtrip() {
        let store = MemoryNodeStore::create(&TreeOptions::default()).unwrap();
        let id = store.allocate_node().unwrap();
        let node = leaf(&[5, 6]);
        store.write_node(id, &node).unwrap();
        assert_eq!(store.read_node(id).unwrap(), node);
    }

    #[test]
    fn test_byte_image_roundtrip() {
        let store = MemoryNodeStore::create(&TreeOptions::default()).unwrap();
        let id = store.allocate_node().unwrap();
        store.write_node(id, &leaf(&[9])).unwrap();
        let mut header = store.read_header().unwrap();
        header.root = id;
        store.write_header(&header).unwrap();

        let image = store.to_bytes().unwrap();
        let reloaded = MemoryNodeStore::from_bytes(image).unwrap();
        assert_eq!(reloaded.read_header().unwrap().root, id);
        assert_eq!(reloaded.read_node(id).unwrap(), leaf(&[9]));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(MemoryNodeStore::from_bytes(vec![7u8; HEADER_SIZE]).is_err());
        assert!(MemoryNodeStore::from_bytes(vec![0u8; 3]).is_err());
    }

    #[test]
    fn test_free_list_reuse() {
        let store = MemoryNodeStore::create(&TreeOptions::default()).unwrap();
        let a = store.allocate_node().unwrap();
        let b = store.allocate_node().unwrap();
        store.write_node(a, &leaf(&[1])).unwrap();
        store.write_node(b, &leaf(&[2])).unwrap();
        store.free_node(b).unwrap();
        store.free_node(a).unwrap();
        // LIFO reuse through the chained free list.
        assert_eq!(store.allocate_node().unwrap(), a);
        assert_eq!(store.allocate_node().unwrap(), b);
        assert_eq!(store.allocate_node().unwrap(), 2);
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let store = MemoryNodeStore::create(&TreeOptions::default()).unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(store.read_header().is_err());
        assert!(store.allocate_node().is_err());
    }
}
