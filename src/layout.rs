//! Binary layout of the header record and fixed-size node records.
//!
//! The file is one fixed 256-byte header followed by identically sized node
//! records addressed as `HEADER_SIZE + node_id * record_size`. Every record
//! reserves `max_elements` slots of `(2 * dimension doubles, u64 payload)`,
//! zero-filled when unused, so a node occupies the same space at any fill
//! factor. All integers and doubles are little-endian.
//!
//! Header layout:
//!
//! ```text
//! offset  0  magic            u32
//! offset  4  format version   u32
//! offset  8  dimension        u16
//! offset 10  max elements     u16
//! offset 12  split policy     u8
//! offset 13  hilbert order    u8
//! offset 14  reserved         u16
//! offset 16  root node id     u64
//! offset 24  free list head   u64
//! offset 32  next node id     u64
//! offset 40  entry count      u64
//! offset 48  tree height      u32
//! offset 52  crs length       u16
//! offset 54  crs bytes        (<= 202)
//! ```
//!
//! Record layout: `[tag u8][count u16]` then the slots. Tag 2 marks a freed
//! record; its first slot starts with the next free node id.

use crate::constants::{FORMAT_VERSION, HEADER_SIZE, MAGIC, TAG_BRANCH, TAG_FREE, TAG_LEAF};
use crate::envelope::Envelope;
use crate::errors::{IndexError, IndexResult};
use crate::split::SplitPolicy;
use crate::types::{IndexHeader, Node, NodeEntry, NodeId};

/// Bytes preceding the slots in a node record.
const RECORD_PREFIX: usize = 3;

/// Largest CRS tag that fits the fixed header.
pub(crate) const MAX_CRS_BYTES: usize = HEADER_SIZE - 54;

/// Slot and record geometry for one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordLayout {
    pub dimension: usize,
    pub max_elements: usize,
}

impl RecordLayout {
    pub fn new(dimension: usize, max_elements: usize) -> RecordLayout {
        RecordLayout {
            dimension,
            max_elements,
        }
    }

    pub fn slot_size(&self) -> usize {
        2 * self.dimension * 8 + 8
    }

    pub fn record_size(&self) -> usize {
        RECORD_PREFIX + self.max_elements * self.slot_size()
    }

    /// Byte offset of a node record within the file or backing array.
    pub fn record_offset(&self, node_id: NodeId) -> u64 {
        HEADER_SIZE as u64 + node_id * self.record_size() as u64
    }

    /// Encodes a node into `buf`, which must be exactly one record long.
    /// Unused slots stay zero-filled.
    pub fn encode_node(&self, node: &Node, buf: &mut [u8]) -> IndexResult<()> {
        debug_assert_eq!(buf.len(), self.record_size());
        let entries = node.entries();
        if entries.len() > self.max_elements {
            return Err(IndexError::argument(format!(
                "node holds {} entries, record fits {}",
                entries.len(),
                self.max_elements
            )));
        }
        buf.fill(0);
        buf[0] = if node.is_leaf() { TAG_LEAF } else { TAG_BRANCH };
        buf[1..3].copy_from_slice(&(entries.len() as u16).to_le_bytes());

        let mut at = RECORD_PREFIX;
        for entry in entries {
            for &lo in entry.envelope.min() {
                buf[at..at + 8].copy_from_slice(&lo.to_le_bytes());
                at += 8;
            }
            for &hi in entry.envelope.max() {
                buf[at..at + 8].copy_from_slice(&hi.to_le_bytes());
                at += 8;
            }
            buf[at..at + 8].copy_from_slice(&entry.value.to_le_bytes());
            at += 8;
        }
        Ok(())
    }

    /// Decodes a node record. A freed or unrecognized record is a structural
    /// error: live tree traversal must never reach one.
    pub fn decode_node(&self, buf: &[u8]) -> IndexResult<Node> {
        debug_assert_eq!(buf.len(), self.record_size());
        match buf[0] {
            TAG_LEAF | TAG_BRANCH => {}
            TAG_FREE => {
                return Err(IndexError::structural("reference to a freed node record"));
            }
            other => {
                return Err(IndexError::structural(format!(
                    "unrecognized node record tag {}",
                    other
                )));
            }
        }
        let count = u16::from_le_bytes(buf[1..3].try_into().unwrap()) as usize;
        if count > self.max_elements {
            return Err(IndexError::structural(format!(
                "node record claims {} entries, record fits {}",
                count, self.max_elements
            )));
        }

        let mut entries = Vec::with_capacity(count);
        let mut at = RECORD_PREFIX;
        for _ in 0..count {
            let mut min = Vec::with_capacity(self.dimension);
            let mut max = Vec::with_capacity(self.dimension);
            for _ in 0..self.dimension {
                min.push(f64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
                at += 8;
            }
            for _ in 0..self.dimension {
                max.push(f64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
                at += 8;
            }
            let value = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
            at += 8;
            entries.push(NodeEntry::new(Envelope::from_raw(min, max), value));
        }

        Ok(if buf[0] == TAG_LEAF {
            Node::Leaf { entries }
        } else {
            Node::Branch { entries }
        })
    }

    /// Encodes a free-list record pointing at the next free node.
    pub fn encode_free(&self, next_free: NodeId, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.record_size());
        buf.fill(0);
        buf[0] = TAG_FREE;
        buf[RECORD_PREFIX..RECORD_PREFIX + 8].copy_from_slice(&next_free.to_le_bytes());
    }

    /// Reads the next-free pointer out of a free-list record.
    pub fn decode_free(&self, buf: &[u8]) -> IndexResult<NodeId> {
        debug_assert_eq!(buf.len(), self.record_size());
        if buf[0] != TAG_FREE {
            return Err(IndexError::structural(
                "free list points at a record that is not free",
            ));
        }
        Ok(u64::from_le_bytes(
            buf[RECORD_PREFIX..RECORD_PREFIX + 8].try_into().unwrap(),
        ))
    }
}

/// Encodes the header into its fixed-size record.
pub(crate) fn encode_header(header: &IndexHeader) -> IndexResult<[u8; HEADER_SIZE]> {
    if header.crs.len() > MAX_CRS_BYTES {
        return Err(IndexError::argument(format!(
            "encoded CRS tag is {} bytes, header fits {}",
            header.crs.len(),
            MAX_CRS_BYTES
        )));
    }
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[8..10].copy_from_slice(&(header.dimension as u16).to_le_bytes());
    buf[10..12].copy_from_slice(&(header.max_elements as u16).to_le_bytes());
    buf[12] = header.split_policy.code();
    buf[13] = header.split_policy.hilbert_order();
    buf[16..24].copy_from_slice(&header.root.to_le_bytes());
    buf[24..32].copy_from_slice(&header.free_head.to_le_bytes());
    buf[32..40].copy_from_slice(&header.next_node.to_le_bytes());
    buf[40..48].copy_from_slice(&header.entry_count.to_le_bytes());
    buf[48..52].copy_from_slice(&header.height.to_le_bytes());
    buf[52..54].copy_from_slice(&(header.crs.len() as u16).to_le_bytes());
    buf[54..54 + header.crs.len()].copy_from_slice(&header.crs);
    Ok(buf)
}

/// Decodes and validates a header record. Magic and version are checked
/// before anything else so an alien or newer file is rejected up front.
pub(crate) fn decode_header(buf: &[u8]) -> IndexResult<IndexHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(IndexError::format(format!(
            "truncated header: {} bytes, expected {}",
            buf.len(),
            HEADER_SIZE
        )));
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(IndexError::format(format!(
            "bad magic number {:#010x}, not an index file",
            magic
        )));
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(IndexError::format(format!(
            "unsupported format version {} (supported: {})",
            version, FORMAT_VERSION
        )));
    }

    let dimension = u16::from_le_bytes(buf[8..10].try_into().unwrap()) as usize;
    let max_elements = u16::from_le_bytes(buf[10..12].try_into().unwrap()) as usize;
    if dimension == 0 || max_elements < 2 {
        return Err(IndexError::format("corrupt header geometry"));
    }
    let split_policy = SplitPolicy::from_code(buf[12], buf[13])?;
    let crs_len = u16::from_le_bytes(buf[52..54].try_into().unwrap()) as usize;
    if crs_len > MAX_CRS_BYTES {
        return Err(IndexError::format("corrupt header CRS length"));
    }

    Ok(IndexHeader {
        dimension,
        max_elements,
        split_policy,
        crs: buf[54..54 + crs_len].to_vec(),
        root: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        free_head: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        next_node: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        entry_count: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        height: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
    })
}
