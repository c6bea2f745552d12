//! File-backed node store.
//!
//! Records live in a single random-access file and pass through a
//! configurable-size record buffer; dirty records are written back on
//! eviction and on flush. Reading never touches more than the one record
//! asked for.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::buffer::RecordBuffer;
use crate::constants::{HEADER_SIZE, NIL_NODE};
use crate::errors::{IndexError, IndexResult};
use crate::layout::{decode_header, encode_header, RecordLayout};
use crate::store::NodeStore;
use crate::tree::TreeOptions;
use crate::types::{IndexHeader, Node, NodeId};

pub struct FileNodeStore {
    state: RwLock<FileState>,
}

struct FileState {
    file: File,
    path: PathBuf,
    header: IndexHeader,
    header_dirty: bool,
    layout: RecordLayout,
    buffer: RecordBuffer,
    closed: bool,
}

impl FileNodeStore {
    /// Creates a new index file, truncating anything already at `path`.
    pub fn create(path: &Path, options: &TreeOptions) -> IndexResult<FileNodeStore> {
        options.validate()?;
        let header = IndexHeader::new(
            options.dimension,
            options.max_elements,
            options.split_policy,
            options.crs.encode(),
        );
        let bytes = encode_header(&header)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        log::debug!("created index file at {:?}", path);

        Ok(FileNodeStore {
            state: RwLock::new(FileState::new(
                file,
                path.to_path_buf(),
                header,
                options.buffer_capacity,
            )),
        })
    }

    /// Opens an existing index file. Only the header is read; the magic
    /// number and format version are validated before any node access.
    pub fn open(path: &Path, buffer_capacity: usize) -> IndexResult<FileNodeStore> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < HEADER_SIZE as u64 {
            return Err(IndexError::format(format!(
                "{:?} is too short to hold an index header",
                path
            )));
        }
        let mut bytes = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)?;
        let header = decode_header(&bytes)?;
        log::debug!("opened index file at {:?}", path);

        Ok(FileNodeStore {
            state: RwLock::new(FileState::new(
                file,
                path.to_path_buf(),
                header,
                buffer_capacity,
            )),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.state.read().path.clone()
    }
}

impl FileState {
    fn new(file: File, path: PathBuf, header: IndexHeader, buffer_capacity: usize) -> FileState {
        let layout = RecordLayout::new(header.dimension, header.max_elements);
        let buffer = RecordBuffer::new(buffer_capacity, layout.record_size());
        FileState {
            file,
            path,
            header,
            header_dirty: false,
            layout,
            buffer,
            closed: false,
        }
    }

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

    fn read_record(&mut self, node_id: NodeId) -> IndexResult<Vec<u8>> {
        let mut buf = vec![0u8; self.layout.record_size()];
        self.file
            .seek(SeekFrom::Start(self.layout.record_offset(node_id)))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_record(&mut self, node_id: NodeId, bytes: &[u8]) -> IndexResult<()> {
        self.file
            .seek(SeekFrom::Start(self.layout.record_offset(node_id)))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Evicts until the buffer has room, writing back dirty victims.
    fn make_room(&mut self) -> IndexResult<()> {
        while self.buffer.is_full() {
            match self.buffer.evict() {
                Some((victim, node, dirty)) => {
                    if dirty {
                        let mut bytes = vec![0u8; self.layout.record_size()];
                        self.layout.encode_node(&node, &mut bytes)?;
                        self.write_record(victim, &bytes)?;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    fn flush_all(&mut self) -> IndexResult<()> {
        for node_id in self.buffer.dirty_ids() {
            let encoded = match self.buffer.node(node_id) {
                Some(node) => {
                    let mut bytes = vec![0u8; self.layout.record_size()];
                    self.layout.encode_node(node, &mut bytes)?;
                    bytes
                }
                None => continue,
            };
            self.write_record(node_id, &encoded)?;
            self.buffer.mark_clean(node_id);
        }
        if self.header_dirty {
            let bytes = encode_header(&self.header)?;
            self.file.seek(SeekFrom::Start(0))?;
            self.file.write_all(&bytes)?;
            self.header_dirty = false;
        }
        self.file.sync_all()?;
        Ok(())
    }
}

impl NodeStore for FileNodeStore {
    fn read_header(&self) -> IndexResult<IndexHeader> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.header.clone())
    }

    fn write_header(&self, header: &IndexHeader) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.header = header.clone();
        state.header_dirty = true;
        Ok(())
    }

    fn allocate_node(&self) -> IndexResult<NodeId> {
        let mut state = self.state.write();
        state.ensure_open()?;
        if state.header.free_head != NIL_NODE {
            let node_id = state.header.free_head;
            let bytes = state.read_record(node_id)?;
            let next = state.layout.decode_free(&bytes)?;
            state.header.free_head = next;
            state.header_dirty = true;
            return Ok(node_id);
        }
        let node_id = state.header.next_node;
        state.header.next_node += 1;
        state.header_dirty = true;
        Ok(node_id)
    }

    fn free_node(&self, node_id: NodeId) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.ensure_known(node_id)?;
        state.buffer.discard(node_id);
        let mut bytes = vec![0u8; state.layout.record_size()];
        let next = state.header.free_head;
        state.layout.encode_free(next, &mut bytes);
        state.write_record(node_id, &bytes)?;
        state.header.free_head = node_id;
        state.header_dirty = true;
        Ok(())
    }

    fn read_node(&self, node_id: NodeId) -> IndexResult<Node> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.ensure_known(node_id)?;
        if let Some(node) = state.buffer.get(node_id) {
            return Ok(node.clone());
        }
        let bytes = state.read_record(node_id)?;
        let node = state.layout.decode_node(&bytes)?;
        state.make_room()?;
        state.buffer.put(node_id, node.clone(), false);
        Ok(node)
    }

    fn write_node(&self, node_id: NodeId, node: &Node) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.ensure_known(node_id)?;
        if node.len() > state.layout.max_elements {
            return Err(IndexError::argument(format!(
                "node holds {} entries, limit is {}",
                node.len(),
                state.layout.max_elements
            )));
        }
        for entry in node.entries() {
            if entry.envelope.dimension() != state.layout.dimension {
                return Err(IndexError::argument(format!(
                    "entry dimension {} does not match store dimension {}",
                    entry.envelope.dimension(),
                    state.layout.dimension
                )));
            }
        }
        state.make_room()?;
        state.buffer.put(node_id, node.clone(), true);
        Ok(())
    }

    fn flush(&self) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.flush_all()
    }

    fn close(&self) -> IndexResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.flush_all()?;
        state.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.read().closed
    }
}

impl Drop for FileNodeStore {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if !state.closed {
            let _ = state.flush_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::types::NodeEntry;
    use tempfile::tempdir;

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
    fn test_create_then_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");

        {
            let store = FileNodeStore::create(&path, &TreeOptions::default()).unwrap();
            store.close().unwrap();
        }
        let store = FileNodeStore::open(&path, 1 << 16).unwrap();
        let header = store.read_header().unwrap();
        assert_eq!(header.dimension, 2);
        assert_eq!(header.root, NIL_NODE);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.rtree");
        std::fs::write(&path, vec![0xAB; HEADER_SIZE]).unwrap();
        assert!(matches!(
            FileNodeStore::open(&path, 1 << 16),
            Err(IndexError::Format(_))
        ));
    }

    #[test]
    fn test_open_rejects_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.rtree");
        std::fs::write(&path, vec![0u8; 10]).unwrap();
        assert!(matches!(
            FileNodeStore::open(&path, 1 << 16),
            Err(IndexError::Format(_))
        ));
    }

    #[test]
    fn test_node_roundtrip_through_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let node = leaf(&[1, 2, 3]);

        {
            let store = FileNodeStore::create(&path, &TreeOptions::default()).unwrap();
            let id = store.allocate_node().unwrap();
            assert_eq!(id, 0);
            store.write_node(id, &node).unwrap();
            store.close().unwrap();
        }
        let store = FileNodeStore::open(&path, 1 << 16).unwrap();
        assert_eq!(store.read_node(0).unwrap(), node);
    }

    #[test]
    fn test_allocate_reuses_freed_nodes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let store = FileNodeStore::create(&path, &TreeOptions::default()).unwrap();

        let a = store.allocate_node().unwrap();
        let b = store.allocate_node().unwrap();
        store.write_node(a, &leaf(&[1])).unwrap();
        store.write_node(b, &leaf(&[2])).unwrap();

        store.free_node(a).unwrap();
        assert_eq!(store.allocate_node().unwrap(), a);
        // Free list exhausted, back to the watermark.
        assert_eq!(store.allocate_node().unwrap(), 2);
    }

    #[test]
    fn test_free_list_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");

        {
            let store = FileNodeStore::create(&path, &TreeOptions::default()).unwrap();
            for _ in 0..3 {
                let id = store.allocate_node().unwrap();
                store.write_node(id, &leaf(&[id])).unwrap();
            }
            store.free_node(1).unwrap();
            store.close().unwrap();
        }
        let store = FileNodeStore::open(&path, 1 << 16).unwrap();
        assert_eq!(store.allocate_node().unwrap(), 1);
        assert_eq!(store.allocate_node().unwrap(), 3);
    }

    #[test]
    fn test_read_freed_node_is_structural() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let store = FileNodeStore::create(&path, &TreeOptions::default()).unwrap();
        let id = store.allocate_node().unwrap();
        store.write_node(id, &leaf(&[1])).unwrap();
        store.free_node(id).unwrap();
        assert!(matches!(
            store.read_node(id),
            Err(IndexError::Structural(_))
        ));
    }

    #[test]
    fn test_read_unknown_node_is_structural() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let store = FileNodeStore::create(&path, &TreeOptions::default()).unwrap();
        assert!(matches!(
            store.read_node(42),
            Err(IndexError::Structural(_))
        ));
    }

    #[test]
    fn test_tiny_buffer_evicts_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        // Capacity of one record forces eviction on every other access.
        let options = TreeOptions {
            buffer_capacity: 1,
            ..TreeOptions::default()
        };
        let store = FileNodeStore::create(&path, &options).unwrap();

        let ids: Vec<NodeId> = (0..8).map(|_| store.allocate_node().unwrap()).collect();
        for &id in &ids {
            store.write_node(id, &leaf(&[id])).unwrap();
        }
        for &id in &ids {
            assert_eq!(store.read_node(id).unwrap(), leaf(&[id]));
        }
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let store = FileNodeStore::create(&path, &TreeOptions::default()).unwrap();
        store.close().unwrap();
        store.close().unwrap(); // idempotent

        assert!(store.is_closed());
        assert!(matches!(
            store.read_header(),
            Err(IndexError::Argument(_))
        ));
        assert!(store.allocate_node().is_err());
        assert!(store.read_node(0).is_err());
    }

    #[test]
    fn test_header_write_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");

        {
            let store = FileNodeStore::create(&path, &TreeOptions::default()).unwrap();
            let mut header = store.read_header().unwrap();
            header.root = 7;
            header.entry_count = 99;
            header.height = 2;
            store.write_header(&header).unwrap();
            store.close().unwrap();
        }
        let store = FileNodeStore::open(&path, 1 << 16).unwrap();
        let header = store.read_header().unwrap();
        assert_eq!(header.root, 7);
        assert_eq!(header.entry_count, 99);
        assert_eq!(header.height, 2);
    }
}
