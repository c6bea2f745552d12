//! The spatial tree: insert, search, and remove over a node store.
//!
//! All leaves sit at the same depth. Every branch entry records the exact
//! union of the envelopes beneath it, so a query can prune any subtree whose
//! recorded envelope misses the query envelope. Writers (insert/remove/close)
//! take the tree's write lock; search cursors hold the read lock for as long
//! as they live.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::{min_fill, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_ELEMENTS, MAX_DIMENSION, NIL_NODE};
use crate::crs::CrsTag;
use crate::cursor::{SearchCursor, SearchPredicate};
use crate::envelope::Envelope;
use crate::errors::{IndexError, IndexResult};
use crate::layout::MAX_CRS_BYTES;
use crate::mapper::ElementMapper;
use crate::split::{hilbert_position, split_entries, SplitContext, SplitPolicy};
use crate::store::NodeStore;
use crate::types::{ElementId, Node, NodeEntry, NodeId};

/// Parameters of a new tree.
#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub dimension: usize,
    pub max_elements: usize,
    pub split_policy: SplitPolicy,
    pub crs: CrsTag,
    /// Byte capacity of the file store's record buffer.
    pub buffer_capacity: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        TreeOptions {
            dimension: 2,
            max_elements: DEFAULT_MAX_ELEMENTS,
            split_policy: SplitPolicy::Quadratic,
            crs: CrsTag::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl TreeOptions {
    pub fn validate(&self) -> IndexResult<()> {
        if self.dimension == 0 || self.dimension > MAX_DIMENSION {
            return Err(IndexError::argument(format!(
                "dimension must be 1..={}, got {}",
                MAX_DIMENSION, self.dimension
            )));
        }
        if self.max_elements < 2 || self.max_elements > u16::MAX as usize {
            return Err(IndexError::argument(format!(
                "max_elements must be 2..={}, got {}",
                u16::MAX,
                self.max_elements
            )));
        }
        if let SplitPolicy::Hilbert(order) = self.split_policy {
            if order == 0 || self.dimension as u32 * order as u32 > 64 {
                return Err(IndexError::argument(format!(
                    "hilbert order {} with dimension {} does not fit a 64-bit rank",
                    order, self.dimension
                )));
            }
        }
        if self.crs.encode().len() > MAX_CRS_BYTES {
            return Err(IndexError::argument("encoded CRS tag too large for the header"));
        }
        Ok(())
    }
}

/// Lock-protected mutable state shared between a tree and its cursors.
pub(crate) struct TreeState {
    pub(crate) store: Box<dyn NodeStore>,
    pub(crate) closed: bool,
}

/// A persistent spatial tree over one node store.
///
/// `Tree` is cheap to clone; clones share the same underlying state, which
/// is how the [`crate::TreeManager`] hands one live instance to several
/// owners. Obtain trees through the manager unless you are wiring a store
/// and mapper together yourself.
#[derive(Clone)]
pub struct Tree {
    inner: Arc<TreeInner>,
}

struct TreeInner {
    dimension: usize,
    max_elements: usize,
    min_fill: usize,
    split_policy: SplitPolicy,
    crs: CrsTag,
    state: Arc<RwLock<TreeState>>,
    mapper: Arc<dyn ElementMapper>,
}

impl Tree {
    /// Wires an opened store and its element mapper into a tree. The store
    /// header supplies dimension, capacity, split policy and CRS.
    pub fn new(store: Box<dyn NodeStore>, mapper: Arc<dyn ElementMapper>) -> IndexResult<Tree> {
        let header = store.read_header()?;
        let crs = CrsTag::decode(&header.crs)?;
        Ok(Tree {
            inner: Arc::new(TreeInner {
                dimension: header.dimension,
                max_elements: header.max_elements,
                min_fill: min_fill(header.max_elements),
                split_policy: header.split_policy,
                crs,
                state: Arc::new(RwLock::new(TreeState {
                    store,
                    closed: false,
                })),
                mapper,
            }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    pub fn max_elements(&self) -> usize {
        self.inner.max_elements
    }

    pub fn split_policy(&self) -> SplitPolicy {
        self.inner.split_policy
    }

    pub fn crs(&self) -> &CrsTag {
        &self.inner.crs
    }

    /// The mapper this tree consults; shares its lifetime with the tree.
    pub fn mapper(&self) -> Arc<dyn ElementMapper> {
        Arc::clone(&self.inner.mapper)
    }

    /// Parameters equivalent to the ones this tree was created with.
    pub fn options(&self) -> TreeOptions {
        TreeOptions {
            dimension: self.inner.dimension,
            max_elements: self.inner.max_elements,
            split_policy: self.inner.split_policy,
            crs: self.inner.crs.clone(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    pub(crate) fn same_instance(&self, other: &Tree) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of element entries in the tree.
    pub fn len(&self) -> IndexResult<u64> {
        let state = self.inner.state.read();
        self.ensure_open(&state)?;
        Ok(state.store.read_header()?.entry_count)
    }

    pub fn is_empty(&self) -> IndexResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Height of the tree; 0 when empty, 1 when the root is a leaf.
    pub fn height(&self) -> IndexResult<u32> {
        let state = self.inner.state.read();
        self.ensure_open(&state)?;
        Ok(state.store.read_header()?.height)
    }

    pub fn is_open(&self) -> bool {
        !self.inner.state.read().closed
    }

    /// Inserts an element envelope. The id is opaque to the tree and is
    /// returned verbatim by matching searches; uniqueness is the caller's
    /// contract.
    pub fn insert(&self, envelope: &Envelope, element_id: ElementId) -> IndexResult<()> {
        self.check_dimension(envelope)?;
        let state = self.inner.state.write();
        self.ensure_open(&state)?;
        let store = state.store.as_ref();

        self.insert_entry(store, envelope, element_id)?;
        let mut header = store.read_header()?;
        header.entry_count += 1;
        store.write_header(&header)
    }

    /// Starts a pull-based search. The returned cursor yields matching
    /// element ids in unspecified order and holds the tree's read lock until
    /// dropped; see [`SearchCursor`].
    pub fn search(&self, query: &Envelope, predicate: SearchPredicate) -> IndexResult<SearchCursor> {
        self.check_dimension(query)?;
        let state = self.inner.state.read_arc();
        if state.closed {
            return Err(IndexError::closed());
        }
        let root = state.store.read_header()?.root;
        Ok(SearchCursor::new(state, query.clone(), predicate, root))
    }

    /// Removes the entry with `element_id` from a leaf overlapping
    /// `envelope`. Underfull nodes are condensed: the node is dropped and
    /// its remaining element entries reinserted from the root, keeping all
    /// leaves at equal depth. Returns whether an entry was removed.
    pub fn remove(&self, envelope: &Envelope, element_id: ElementId) -> IndexResult<bool> {
        self.check_dimension(envelope)?;
        let state = self.inner.state.write();
        self.ensure_open(&state)?;
        let store = state.store.as_ref();

        let header = store.read_header()?;
        if header.root == NIL_NODE {
            return Ok(false);
        }
        let mut path = Vec::new();
        let found = self.find_entry(store, header.root, envelope, element_id, &mut path)?;
        let (leaf_id, entry_idx) = match found {
            Some(hit) => hit,
            None => return Ok(false),
        };

        let mut leaf = store.read_node(leaf_id)?;
        let removed = leaf.entries_mut().remove(entry_idx);
        if let Some(known) = self.inner.mapper.envelope_of(element_id)? {
            if known != removed.envelope {
                log::warn!(
                    "mapper envelope for element {} disagrees with the stored entry",
                    element_id
                );
            }
        }
        store.write_node(leaf_id, &leaf)?;

        let orphans = self.condense(store, &path, leaf_id)?;
        self.shrink_root(store)?;

        let mut header = store.read_header()?;
        header.entry_count = header.entry_count.saturating_sub(1);
        store.write_header(&header)?;

        // Reinsertion keeps the count: the orphans were already part of the
        // tree. The mapper is the authority on their envelopes when it knows
        // them.
        for orphan in orphans {
            let envelope = match self.inner.mapper.envelope_of(orphan.value)? {
                Some(known) if known.dimension() == self.inner.dimension => known,
                _ => orphan.envelope,
            };
            self.insert_entry(store, &envelope, orphan.value)?;
        }
        Ok(true)
    }

    /// Writes buffered state through to storage.
    pub fn flush(&self) -> IndexResult<()> {
        let state = self.inner.state.read();
        self.ensure_open(&state)?;
        state.store.flush()
    }

    /// Flushes and closes the store and the element mapper. Idempotent;
    /// afterwards every operation fails with an argument error.
    pub fn close(&self) -> IndexResult<()> {
        let mut state = self.inner.state.write();
        if state.closed {
            return Ok(());
        }
        state.store.close()?;
        self.inner.mapper.close()?;
        state.closed = true;
        Ok(())
    }

    /// Walks the whole tree checking the structural invariants: exact
    /// envelope unions, equal leaf depth, node fill bounds, and the header
    /// entry count. Returns the first violation as a structural error.
    pub fn verify(&self) -> IndexResult<()> {
        let state = self.inner.state.read();
        self.ensure_open(&state)?;
        let store = state.store.as_ref();
        let header = store.read_header()?;

        if header.root == NIL_NODE {
            if header.entry_count != 0 || header.height != 0 {
                return Err(IndexError::structural(
                    "empty tree with non-zero entry count or height",
                ));
            }
            return Ok(());
        }

        let mut leaf_depth: Option<u32> = None;
        let counted = self.verify_node(store, header.root, None, 1, true, &mut leaf_depth)?;
        if counted != header.entry_count {
            return Err(IndexError::structural(format!(
                "header counts {} entries, tree holds {}",
                header.entry_count, counted
            )));
        }
        if let Some(depth) = leaf_depth {
            if depth != header.height {
                return Err(IndexError::structural(format!(
                    "leaf depth {} does not match header height {}",
                    depth, header.height
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Insertion internals (called with the write lock held)
    // ------------------------------------------------------------------

    /// Inserts one entry without touching the entry count, so condense can
    /// reinsert orphans through the same path.
    fn insert_entry(
        &self,
        store: &dyn NodeStore,
        envelope: &Envelope,
        element_id: u64,
    ) -> IndexResult<()> {
        let header = store.read_header()?;
        if header.root == NIL_NODE {
            let node_id = store.allocate_node()?;
            store.write_node(
                node_id,
                &Node::Leaf {
                    entries: vec![NodeEntry::new(envelope.clone(), element_id)],
                },
            )?;
            let mut header = store.read_header()?;
            header.root = node_id;
            header.height = 1;
            return store.write_header(&header);
        }

        let mut path = Vec::new();
        let leaf_id = self.choose_leaf(store, header.root, envelope, &mut path)?;
        let split = self.insert_into_leaf(store, leaf_id, NodeEntry::new(envelope.clone(), element_id))?;
        match split {
            Some((new_id, new_envelope)) => self.propagate_split(store, &path, new_id, new_envelope),
            None => self.update_path_envelopes(store, &path),
        }
    }

    /// Descends to the leaf needing the least enlargement for `envelope`,
    /// recording the branch index taken at every level. Ties prefer the
    /// smaller resulting area, then the emptier child.
    fn choose_leaf(
        &self,
        store: &dyn NodeStore,
        node_id: NodeId,
        envelope: &Envelope,
        path: &mut Vec<(NodeId, usize)>,
    ) -> IndexResult<NodeId> {
        let node = store.read_node(node_id)?;
        let entries = match &node {
            Node::Leaf { .. } => return Ok(node_id),
            Node::Branch { entries } => entries,
        };
        if entries.is_empty() {
            return Err(IndexError::structural(format!("branch node {} has no children", node_id)));
        }

        let mut best_idx = 0;
        let mut best_enlargement = f64::INFINITY;
        let mut best_area = f64::INFINITY;
        for (i, entry) in entries.iter().enumerate() {
            let enlargement = entry.envelope.enlargement(envelope);
            let area = entry.envelope.area();
            let better = if i == 0 {
                true
            } else if enlargement != best_enlargement {
                enlargement < best_enlargement
            } else if area != best_area {
                area < best_area
            } else {
                store.read_node(entry.value)?.len()
                    < store.read_node(entries[best_idx].value)?.len()
            };
            if better {
                best_idx = i;
                best_enlargement = enlargement;
                best_area = area;
            }
        }

        path.push((node_id, best_idx));
        self.choose_leaf(store, entries[best_idx].value, envelope, path)
    }

    /// Places the entry in the leaf; on overflow splits it and returns the
    /// new sibling with its envelope.
    fn insert_into_leaf(
        &self,
        store: &dyn NodeStore,
        leaf_id: NodeId,
        entry: NodeEntry,
    ) -> IndexResult<Option<(NodeId, Envelope)>> {
        let mut node = store.read_node(leaf_id)?;
        let entries = match &mut node {
            Node::Leaf { entries } => entries,
            Node::Branch { .. } => {
                return Err(IndexError::structural(format!(
                    "descent ended at branch node {}",
                    leaf_id
                )));
            }
        };

        let at = match self.inner.split_policy {
            SplitPolicy::Hilbert(order) => hilbert_position(entries, &entry.envelope, order as u32),
            _ => entries.len(),
        };
        entries.insert(at, entry);

        if entries.len() <= self.inner.max_elements {
            store.write_node(leaf_id, &node)?;
            return Ok(None);
        }

        let overflow = std::mem::take(entries);
        let (left, right) = self.run_split(overflow);
        let right_envelope = entries_envelope(&right, self.inner.dimension);
        let new_id = store.allocate_node()?;
        store.write_node(leaf_id, &Node::Leaf { entries: left })?;
        store.write_node(new_id, &Node::Leaf { entries: right })?;
        Ok(Some((new_id, right_envelope)))
    }

    /// Installs a new sibling next to the split child, splitting ancestors
    /// as needed; a split of the root grows the tree by one level.
    fn propagate_split(
        &self,
        store: &dyn NodeStore,
        path: &[(NodeId, usize)],
        mut new_id: NodeId,
        mut new_envelope: Envelope,
    ) -> IndexResult<()> {
        for (depth, &(parent_id, child_idx)) in path.iter().enumerate().rev() {
            let mut parent = store.read_node(parent_id)?;
            let entries = match &mut parent {
                Node::Branch { entries } => entries,
                Node::Leaf { .. } => {
                    return Err(IndexError::structural(format!(
                        "leaf node {} recorded as an ancestor",
                        parent_id
                    )));
                }
            };

            let child_node = store.read_node(entries[child_idx].value)?;
            entries[child_idx].envelope = child_node.envelope(self.inner.dimension);
            entries.insert(child_idx + 1, NodeEntry::new(new_envelope, new_id));

            if entries.len() <= self.inner.max_elements {
                store.write_node(parent_id, &parent)?;
                return self.update_path_envelopes(store, &path[..depth]);
            }

            let overflow = std::mem::take(entries);
            let (left, right) = self.run_split(overflow);
            new_envelope = entries_envelope(&right, self.inner.dimension);
            new_id = store.allocate_node()?;
            store.write_node(parent_id, &Node::Branch { entries: left })?;
            store.write_node(new_id, &Node::Branch { entries: right })?;
        }

        // The root itself split: grow a new root above the two halves.
        let header = store.read_header()?;
        let old_root = header.root;
        let old_envelope = store.read_node(old_root)?.envelope(self.inner.dimension);
        let new_root = store.allocate_node()?;
        store.write_node(
            new_root,
            &Node::Branch {
                entries: vec![
                    NodeEntry::new(old_envelope, old_root),
                    NodeEntry::new(new_envelope, new_id),
                ],
            },
        )?;
        let mut header = store.read_header()?;
        header.root = new_root;
        header.height += 1;
        store.write_header(&header)
    }

    fn run_split(&self, entries: Vec<NodeEntry>) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
        let ctx = SplitContext {
            min_fill: self.inner.min_fill,
            hilbert_order: self.inner.split_policy.hilbert_order() as u32,
        };
        split_entries(self.inner.split_policy, &ctx, entries)
    }

    /// Recomputes the recorded envelope of every child along the descent
    /// path, deepest first.
    fn update_path_envelopes(
        &self,
        store: &dyn NodeStore,
        path: &[(NodeId, usize)],
    ) -> IndexResult<()> {
        for &(parent_id, child_idx) in path.iter().rev() {
            let mut parent = store.read_node(parent_id)?;
            let entries = match &mut parent {
                Node::Branch { entries } => entries,
                Node::Leaf { .. } => {
                    return Err(IndexError::structural(format!(
                        "leaf node {} recorded as an ancestor",
                        parent_id
                    )));
                }
            };
            let child = store.read_node(entries[child_idx].value)?;
            entries[child_idx].envelope = child.envelope(self.inner.dimension);
            store.write_node(parent_id, &parent)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal internals (called with the write lock held)
    // ------------------------------------------------------------------

    /// Depth-first hunt for the leaf entry with `element_id` among subtrees
    /// overlapping `envelope`; leaves the descent path in `path`.
    fn find_entry(
        &self,
        store: &dyn NodeStore,
        node_id: NodeId,
        envelope: &Envelope,
        element_id: ElementId,
        path: &mut Vec<(NodeId, usize)>,
    ) -> IndexResult<Option<(NodeId, usize)>> {
        let node = store.read_node(node_id)?;
        match node {
            Node::Leaf { entries } => {
                Ok(entries
                    .iter()
                    .position(|e| e.value == element_id)
                    .map(|idx| (node_id, idx)))
            }
            Node::Branch { entries } => {
                for (i, entry) in entries.iter().enumerate() {
                    if !entry.envelope.intersects(envelope) {
                        continue;
                    }
                    path.push((node_id, i));
                    if let Some(hit) =
                        self.find_entry(store, entry.value, envelope, element_id, path)?
                    {
                        return Ok(Some(hit));
                    }
                    path.pop();
                }
                Ok(None)
            }
        }
    }

    /// Walks the path bottom-up after a removal. An underfull non-root node
    /// is cut out of its parent and its whole subtree freed; the element
    /// entries found beneath it are returned for reinsertion. Nodes that
    /// stay get their recorded envelope recomputed.
    fn condense(
        &self,
        store: &dyn NodeStore,
        path: &[(NodeId, usize)],
        leaf_id: NodeId,
    ) -> IndexResult<Vec<NodeEntry>> {
        let mut orphans = Vec::new();
        let mut child_id = leaf_id;
        for &(parent_id, child_idx) in path.iter().rev() {
            let mut parent = store.read_node(parent_id)?;
            let entries = match &mut parent {
                Node::Branch { entries } => entries,
                Node::Leaf { .. } => {
                    return Err(IndexError::structural(format!(
                        "leaf node {} recorded as an ancestor",
                        parent_id
                    )));
                }
            };
            let child = store.read_node(child_id)?;
            if child.len() < self.inner.min_fill {
                entries.remove(child_idx);
                self.collect_subtree(store, child_id, &mut orphans)?;
            } else {
                entries[child_idx].envelope = child.envelope(self.inner.dimension);
            }
            store.write_node(parent_id, &parent)?;
            child_id = parent_id;
        }
        Ok(orphans)
    }

    /// Gathers every element entry beneath `node_id` and frees the nodes.
    fn collect_subtree(
        &self,
        store: &dyn NodeStore,
        node_id: NodeId,
        orphans: &mut Vec<NodeEntry>,
    ) -> IndexResult<()> {
        let node = store.read_node(node_id)?;
        match node {
            Node::Leaf { entries } => orphans.extend(entries),
            Node::Branch { entries } => {
                for entry in &entries {
                    self.collect_subtree(store, entry.value, orphans)?;
                }
            }
        }
        store.free_node(node_id)
    }

    /// Collapses single-child root chains and resets an emptied tree.
    fn shrink_root(&self, store: &dyn NodeStore) -> IndexResult<()> {
        loop {
            let header = store.read_header()?;
            if header.root == NIL_NODE {
                return Ok(());
            }
            let node = store.read_node(header.root)?;
            let replacement = match &node {
                Node::Branch { entries } if entries.len() == 1 => {
                    Some((entries[0].value, header.height.saturating_sub(1)))
                }
                Node::Branch { entries } if entries.is_empty() => Some((NIL_NODE, 0)),
                Node::Leaf { entries } if entries.is_empty() => Some((NIL_NODE, 0)),
                _ => return Ok(()),
            };
            if let Some((new_root, new_height)) = replacement {
                let old_root = header.root;
                store.free_node(old_root)?;
                let mut header = store.read_header()?;
                header.root = new_root;
                header.height = new_height;
                store.write_header(&header)?;
                if new_root == NIL_NODE {
                    return Ok(());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    fn verify_node(
        &self,
        store: &dyn NodeStore,
        node_id: NodeId,
        recorded: Option<&Envelope>,
        depth: u32,
        is_root: bool,
        leaf_depth: &mut Option<u32>,
    ) -> IndexResult<u64> {
        let node = store.read_node(node_id)?;
        if !is_root && node.len() < self.inner.min_fill {
            return Err(IndexError::structural(format!(
                "node {} holds {} entries, below the minimum fill {}",
                node_id,
                node.len(),
                self.inner.min_fill
            )));
        }
        if node.len() > self.inner.max_elements {
            return Err(IndexError::structural(format!(
                "node {} holds {} entries, above the maximum {}",
                node_id,
                node.len(),
                self.inner.max_elements
            )));
        }
        if let Some(recorded) = recorded {
            let actual = node.envelope(self.inner.dimension);
            if actual != *recorded {
                return Err(IndexError::structural(format!(
                    "recorded envelope of node {} is not the exact union of its entries",
                    node_id
                )));
            }
        }
        match node {
            Node::Leaf { entries } => {
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(IndexError::structural(format!(
                            "leaf {} at depth {}, other leaves at {}",
                            node_id, depth, expected
                        )));
                    }
                    Some(_) => {}
                }
                Ok(entries.len() as u64)
            }
            Node::Branch { entries } => {
                let mut total = 0;
                for entry in &entries {
                    total += self.verify_node(
                        store,
                        entry.value,
                        Some(&entry.envelope),
                        depth + 1,
                        false,
                        leaf_depth,
                    )?;
                }
                Ok(total)
            }
        }
    }

    // ------------------------------------------------------------------

    fn check_dimension(&self, envelope: &Envelope) -> IndexResult<()> {
        if envelope.dimension() != self.inner.dimension {
            return Err(IndexError::argument(format!(
                "envelope dimension {} does not match tree dimension {}",
                envelope.dimension(),
                self.inner.dimension
            )));
        }
        Ok(())
    }

    fn ensure_open(&self, state: &TreeState) -> IndexResult<()> {
        if state.closed {
            Err(IndexError::closed())
        } else {
            Ok(())
        }
    }
}

fn entries_envelope(entries: &[NodeEntry], dimension: usize) -> Envelope {
    let mut bound = Envelope::empty(dimension);
    for entry in entries {
        bound.expand(&entry.envelope);
    }
    bound
}
