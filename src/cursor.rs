//! Lazy, restartable search cursors.

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;

use crate::constants::NIL_NODE;
use crate::envelope::Envelope;
use crate::errors::{IndexError, IndexResult};
use crate::tree::TreeState;
use crate::types::{ElementId, Node, NodeId};

/// Predicate a stored envelope must satisfy against the query envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPredicate {
    /// The stored envelope shares at least one point with the query.
    Intersects,
    /// The stored envelope lies entirely inside the query.
    Contains,
}

impl SearchPredicate {
    fn matches(&self, query: &Envelope, stored: &Envelope) -> bool {
        match self {
            SearchPredicate::Intersects => query.intersects(stored),
            SearchPredicate::Contains => query.contains(stored),
        }
    }
}

/// Pull-based traversal over the element ids matching a query.
///
/// The cursor descends the tree one node at a time as the consumer pulls,
/// pruning subtrees whose envelope cannot intersect the query. Order is
/// unspecified. Abandoning the cursor mid-way has no side effects, and
/// [`restart`](SearchCursor::restart) rewinds it to the first result.
///
/// The cursor counts as a reader of its tree: writers block until every
/// outstanding cursor is dropped. Do not hold one across a call to
/// `insert`, `remove`, or `close` on the same thread.
pub struct SearchCursor {
    state: ArcRwLockReadGuard<RawRwLock, TreeState>,
    query: Envelope,
    predicate: SearchPredicate,
    root: NodeId,
    /// Nodes still to visit, paired with the envelope their parent recorded
    /// for them (`None` for the root).
    stack: Vec<(NodeId, Option<Envelope>)>,
    /// Matches from the most recently visited leaf.
    pending: Vec<ElementId>,
    /// Set after an error; the cursor then stays exhausted.
    failed: bool,
}

impl SearchCursor {
    pub(crate) fn new(
        state: ArcRwLockReadGuard<RawRwLock, TreeState>,
        query: Envelope,
        predicate: SearchPredicate,
        root: NodeId,
    ) -> SearchCursor {
        let mut cursor = SearchCursor {
            state,
            query,
            predicate,
            root,
            stack: Vec::new(),
            pending: Vec::new(),
            failed: false,
        };
        cursor.restart();
        cursor
    }

    /// Rewinds the cursor so the sequence can be consumed again.
    pub fn restart(&mut self) {
        self.stack.clear();
        self.pending.clear();
        self.failed = false;
        if self.root != NIL_NODE {
            self.stack.push((self.root, None));
        }
    }

    /// Visits one node, queueing matches and child descents.
    fn visit(&mut self, node_id: NodeId, bound: Option<Envelope>) -> IndexResult<()> {
        let node = self.state.store.read_node(node_id)?;
        if let Some(bound) = &bound {
            for entry in node.entries() {
                if !bound.contains(&entry.envelope) {
                    return Err(IndexError::structural(format!(
                        "entry of node {} escapes the envelope recorded by its parent",
                        node_id
                    )));
                }
            }
        }
        match node {
            Node::Leaf { entries } => {
                for entry in entries {
                    if self.predicate.matches(&self.query, &entry.envelope) {
                        self.pending.push(entry.value);
                    }
                }
            }
            Node::Branch { entries } => {
                // Containment queries still descend on intersection: a
                // contained entry can sit in a partially overlapping child.
                for entry in entries {
                    if self.query.intersects(&entry.envelope) {
                        self.stack.push((entry.value, Some(entry.envelope)));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Iterator for SearchCursor {
    type Item = IndexResult<ElementId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(id) = self.pending.pop() {
                return Some(Ok(id));
            }
            let (node_id, bound) = self.stack.pop()?;
            if let Err(err) = self.visit(node_id, bound) {
                self.failed = true;
                return Some(Err(err));
            }
        }
    }
}
