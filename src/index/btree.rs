//! Concurrent, in-memory B+tree over `String` keys and values.
//!
//! Readers descend with latch coupling (`Tree::find`), never holding more
//! than two node latches at once. Writers descend optimistically under read
//! latches to find a *stable ancestor* — the deepest node that cannot split
//! under the pending insertion — then upgrade only that node's latch before
//! performing the locked insert (`Tree::upsert`). See `crate::index::latch`
//! for the bookkeeping that tracks the stable ancestor during descent.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::error::{BTreeError, Result};
use crate::index::latch::{Ancestor, LatchContext};

/// Shared, latched handle to a node. Splits always produce fresh `NodeRef`s;
/// the pre-split node's `Arc` is simply dropped, so any reader still holding
/// a clone of it keeps it alive for the remainder of their own traversal.
pub(crate) type NodeRef = Arc<RwLock<NodeData>>;

/// Configuration for a [`Tree`].
///
/// The only tunable is the per-node fanout bound. Mirrors the shape of the
/// other `*Config` structs in this crate's lineage: a plain data struct with
/// a `Default` impl, consumed by the constructor.
#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    pub max_keys: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self { max_keys: 128 }
    }
}

/// Snapshot of structural statistics, for tests and operators. Diagnostic
/// only: never consulted by `find`/`upsert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BTreeStats {
    pub height: usize,
    pub leaf_count: usize,
    pub internal_count: usize,
    pub key_count: usize,
}

#[derive(Debug)]
struct LeafNode {
    keys: Vec<String>,
    values: Vec<String>,
    next: Option<NodeRef>,
}

impl LeafNode {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
        }
    }

    /// First index `i` with `keys[i] >= key`.
    fn lower_bound(&self, key: &str) -> usize {
        self.keys.partition_point(|k| k.as_str() < key)
    }

    fn find(&self, key: &str) -> Option<String> {
        let i = self.lower_bound(key);
        if i < self.keys.len() && self.keys[i] == key {
            Some(self.values[i].clone())
        } else {
            None
        }
    }

    /// Inserts or overwrites. Returns `true` iff a new key was created.
    fn upsert(&mut self, key: String, value: String) -> bool {
        let i = self.lower_bound(&key);
        if i < self.keys.len() && self.keys[i] == key {
            self.values[i] = value;
            false
        } else {
            self.keys.insert(i, key);
            self.values.insert(i, value);
            true
        }
    }

    /// Splits an overflowed leaf (`|keys| == max_keys + 1`) into two fresh
    /// leaves built from copied slices, leaving `self` untouched. Returns
    /// `(left, right, split_key)` where `split_key = right.keys[0]`. `self`
    /// is never mutated: a reader that already holds a clone of the
    /// `NodeRef` wrapping it must keep seeing its original, complete
    /// contents until that reader's own traversal drops the clone.
    fn split(&self, old_next: Option<NodeRef>) -> (LeafNode, LeafNode, String) {
        let m = self.keys.len() / 2;
        let right_keys = self.keys[m..].to_vec();
        let right_values = self.values[m..].to_vec();
        let split_key = right_keys[0].clone();
        let right = LeafNode {
            keys: right_keys,
            values: right_values,
            next: old_next,
        };
        let left = LeafNode {
            keys: self.keys[..m].to_vec(),
            values: self.values[..m].to_vec(),
            next: None,
        };
        (left, right, split_key)
    }
}

#[derive(Debug)]
struct InternalNode {
    keys: Vec<String>,
    children: Vec<NodeRef>,
}

impl InternalNode {
    /// Smallest `i` such that `key < keys[i]`, or `keys.len()` if none.
    fn child_index(&self, key: &str) -> usize {
        self.keys.partition_point(|k| k.as_str() <= key)
    }

    /// Splits an overflowed internal node (`|keys| == max_keys + 1`) into two
    /// fresh nodes built from copied slices, leaving `self` untouched. The
    /// median key is promoted and removed from both halves.
    fn split(&self) -> (InternalNode, InternalNode, String) {
        let m = self.keys.len() / 2;
        let split_key = self.keys[m].clone();
        let right = InternalNode {
            keys: self.keys[m + 1..].to_vec(),
            children: self.children[m + 1..].to_vec(),
        };
        let left = InternalNode {
            keys: self.keys[..m].to_vec(),
            children: self.children[..m].to_vec(),
        };
        (left, right, split_key)
    }
}

#[derive(Debug)]
enum NodeKind {
    Leaf(LeafNode),
    Internal(InternalNode),
}

#[derive(Debug)]
pub(crate) struct NodeData {
    kind: NodeKind,
}

/// Outcome of a locked upsert applied at or below some node: either the
/// node absorbed the change, or it split and the caller (parent, or the
/// tree for a root split) must adopt the two halves.
enum UpsertOutcome {
    Absorbed {
        created: bool,
    },
    Split {
        left: NodeRef,
        right: NodeRef,
        split_key: String,
        created: bool,
    },
}

impl NodeData {
    pub(crate) fn new_leaf() -> Self {
        Self {
            kind: NodeKind::Leaf(LeafNode::new()),
        }
    }

    fn key_count(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf(l) => l.keys.len(),
            NodeKind::Internal(i) => i.keys.len(),
        }
    }

    fn is_stable(&self, max_keys: usize) -> bool {
        self.key_count() < max_keys
    }

    fn find(&self, key: &str) -> FindStep {
        match &self.kind {
            NodeKind::Leaf(l) => FindStep::Value(l.find(key)),
            NodeKind::Internal(i) => {
                let idx = i.child_index(key);
                FindStep::Descend(i.children[idx].clone())
            }
        }
    }
}

enum FindStep {
    Value(Option<String>),
    Descend(NodeRef),
}

/// Concurrent in-memory B+tree over `String` keys and values.
///
/// `find` and `upsert` never fail; the only documented contract violation
/// is an invalid `max_keys` at construction time (see [`BTreeError`]).
#[derive(Debug)]
pub struct Tree {
    root: RwLock<NodeRef>,
    max_keys: usize,
}

impl Tree {
    /// Fallible constructor. Returns [`BTreeError::InvalidMaxKeys`] if
    /// `config.max_keys < 2`.
    pub fn try_new(config: BTreeConfig) -> Result<Self> {
        if config.max_keys < 2 {
            return Err(BTreeError::InvalidMaxKeys(config.max_keys));
        }
        Ok(Self {
            root: RwLock::new(Arc::new(RwLock::new(NodeData::new_leaf()))),
            max_keys: config.max_keys,
        })
    }

    /// Constructs a tree whose root is an empty leaf. Panics if `max_keys <
    /// 2`; use [`Tree::try_new`] for a recoverable path.
    pub fn new(config: BTreeConfig) -> Self {
        Self::try_new(config).expect("invalid BTreeConfig")
    }

    /// Convenience constructor matching the literal `NewTree(MaxKeys)` shape.
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self::new(BTreeConfig { max_keys })
    }

    /// Concurrent-safe point lookup. Never fails.
    pub fn find(&self, key: &str) -> Option<String> {
        let root_guard = self.root.read();
        let root_ref = root_guard.clone();
        drop(root_guard);

        let guard = root_ref.read();
        Self::find_in(guard, key)
    }

    /// Recursive half of `find`. Takes the current node's already-acquired
    /// read guard and couples: the child's read latch is acquired before
    /// the parent's (`guard`) is dropped, so a concurrent writer can never
    /// observe this reader having released one latch without already
    /// holding the next.
    fn find_in(guard: RwLockReadGuard<'_, NodeData>, key: &str) -> Option<String> {
        match guard.find(key) {
            FindStep::Value(v) => v,
            FindStep::Descend(child_ref) => {
                let child_guard = child_ref.read();
                drop(guard);
                Self::find_in(child_guard, key)
            }
        }
    }

    /// Inserts a new pair or replaces the value for an existing key. Returns
    /// `true` iff a new key was created.
    pub fn upsert(&self, key: &str, value: &str) -> bool {
        let mut attempt = 0u32;
        loop {
            if let Some(created) = self.try_upsert(key, value) {
                return created;
            }
            attempt += 1;
            debug!(key, attempt, "stable ancestor stale, retrying upsert");
        }
    }

    /// One attempt at an optimistic upsert. Returns `Some(created)` on
    /// success, or `None` if revalidation found the chosen ancestor stale
    /// (caller retries with a fresh descent).
    fn try_upsert(&self, key: &str, value: &str) -> Option<bool> {
        let ancestor = self.find_stable_ancestor(key);

        match ancestor {
            Ancestor::Tree => {
                // The tree itself is the sentinel ancestor: no in-tree node
                // was stable. Acquiring RootLatch for write both grants the
                // right to install a new root and atomically re-fetches the
                // current root, so there is nothing further to revalidate.
                let mut root_guard = self.root.write();
                let root_ref = root_guard.clone();
                let outcome = Self::locked_upsert(&root_ref, key, value, self.max_keys);
                match outcome {
                    UpsertOutcome::Absorbed { created } => Some(created),
                    UpsertOutcome::Split {
                        left,
                        right,
                        split_key,
                        created,
                    } => {
                        trace!(split_key = %split_key, "root split, installing new root");
                        let new_root = InternalNode {
                            keys: vec![split_key],
                            children: vec![left, right],
                        };
                        *root_guard = Arc::new(RwLock::new(NodeData {
                            kind: NodeKind::Internal(new_root),
                        }));
                        Some(created)
                    }
                }
            }
            Ancestor::Node(node) => {
                let write_guard = node.write();
                if !self.revalidate(&node, key) {
                    return None;
                }
                let outcome = Self::locked_upsert_in(write_guard, &node, key, value, self.max_keys);
                match outcome {
                    UpsertOutcome::Absorbed { created } => Some(created),
                    UpsertOutcome::Split { .. } => {
                        // A stable ancestor (|keys| < max_keys) cannot
                        // overflow from absorbing exactly one new key/child,
                        // so the locked phase never reports a split here.
                        unreachable!("stable ancestor split unexpectedly")
                    }
                }
            }
        }
    }

    /// Read-latched descent that finds the deepest stable node on the path
    /// to `key`, coupling latches exactly like `find` (acquire the child's
    /// latch before releasing the parent's) except that it additionally
    /// records the deepest stable node seen so far.
    fn find_stable_ancestor(&self, key: &str) -> Ancestor {
        let root_guard = self.root.read();
        let root_ref = root_guard.clone();
        drop(root_guard);

        let mut ctx = LatchContext::new();
        let guard = root_ref.read();
        let stable = guard.is_stable(self.max_keys);
        ctx.add(&root_ref, stable);
        Self::find_stable_ancestor_in(guard, key, self.max_keys, &mut ctx);
        ctx.into_ancestor()
    }

    /// Recursive half of `find_stable_ancestor`. See `find_in` for the
    /// coupling discipline this mirrors.
    fn find_stable_ancestor_in(
        guard: RwLockReadGuard<'_, NodeData>,
        key: &str,
        max_keys: usize,
        ctx: &mut LatchContext,
    ) {
        match guard.find(key) {
            FindStep::Value(_) => {}
            FindStep::Descend(child_ref) => {
                let child_guard = child_ref.read();
                let stable = child_guard.is_stable(max_keys);
                ctx.add(&child_ref, stable);
                drop(guard);
                Self::find_stable_ancestor_in(child_guard, key, max_keys, ctx);
            }
        }
    }

    /// Re-descends under read latches to confirm `ancestor` still governs
    /// `key`. Stops as soon as the walk reaches a node `Arc`-identical to
    /// `ancestor`, without read-latching it (it is already held for write
    /// by the caller). Returns `false` if the walk reaches a leaf without
    /// ever encountering the ancestor, meaning a concurrent split displaced
    /// it off this key's path.
    fn revalidate(&self, ancestor: &NodeRef, key: &str) -> bool {
        let root_guard = self.root.read();
        let root_ref = root_guard.clone();
        drop(root_guard);

        if Arc::ptr_eq(&root_ref, ancestor) {
            return true;
        }
        let guard = root_ref.read();
        Self::revalidate_in(guard, ancestor, key)
    }

    /// Recursive half of `revalidate`. Couples latches like `find_in`; the
    /// `Arc::ptr_eq` check against `ancestor` happens before a node is
    /// read-latched, so the already-write-held ancestor is never also
    /// read-latched by this walk.
    fn revalidate_in(guard: RwLockReadGuard<'_, NodeData>, ancestor: &NodeRef, key: &str) -> bool {
        match guard.find(key) {
            FindStep::Value(_) => false,
            FindStep::Descend(child_ref) => {
                if Arc::ptr_eq(&child_ref, ancestor) {
                    return true;
                }
                let child_guard = child_ref.read();
                drop(guard);
                Self::revalidate_in(child_guard, ancestor, key)
            }
        }
    }

    /// Applies the locked upsert starting at `node_ref`, acquiring its write
    /// latch. Used for every node strictly below the stable ancestor during
    /// its own recursion.
    fn locked_upsert(node_ref: &NodeRef, key: &str, value: &str, max_keys: usize) -> UpsertOutcome {
        let guard = node_ref.write();
        Self::locked_upsert_in(guard, node_ref, key, value, max_keys)
    }

    /// Applies the locked upsert to an already-write-held node. Used both
    /// for the stable ancestor itself (whose write latch the caller already
    /// holds) and, via `locked_upsert`, for every descendant visited during
    /// the ancestor's own recursion.
    ///
    /// A leaf absorbs the change directly under `guard`. An internal node's
    /// write latch is dropped before descending into the chosen child's own
    /// recursive call — never held across it — and only re-acquired
    /// afterward if the child reports a split that needs patching in. This
    /// is what keeps the write path from ever holding a deeper node's write
    /// latch while blocked acquiring a shallower one (which a concurrent
    /// `revalidate` walk does in the other direction), the lock-order
    /// inversion that would otherwise deadlock two writers.
    fn locked_upsert_in(
        mut guard: RwLockWriteGuard<'_, NodeData>,
        node_ref: &NodeRef,
        key: &str,
        value: &str,
        max_keys: usize,
    ) -> UpsertOutcome {
        let child_ref = match &guard.kind {
            NodeKind::Leaf(_) => None,
            NodeKind::Internal(internal) => {
                let idx = internal.child_index(key);
                Some(internal.children[idx].clone())
            }
        };

        let child_ref = match child_ref {
            None => return Self::apply_leaf_upsert(&mut guard, key, value, max_keys),
            Some(child_ref) => child_ref,
        };

        drop(guard);

        let child_outcome = Self::locked_upsert(&child_ref, key, value, max_keys);

        match child_outcome {
            UpsertOutcome::Absorbed { created } => UpsertOutcome::Absorbed { created },
            UpsertOutcome::Split {
                left,
                right,
                split_key,
                created,
            } => {
                let mut guard = node_ref.write();
                Self::apply_internal_split(&mut guard, key, left, right, split_key, created, max_keys)
            }
        }
    }

    /// Applies an upsert directly to a write-held leaf, splitting it if it
    /// overflows.
    fn apply_leaf_upsert(guard: &mut NodeData, key: &str, value: &str, max_keys: usize) -> UpsertOutcome {
        let leaf = match &mut guard.kind {
            NodeKind::Leaf(leaf) => leaf,
            NodeKind::Internal(_) => unreachable!("apply_leaf_upsert called on an internal node"),
        };
        let created = leaf.upsert(key.to_string(), value.to_string());
        if leaf.keys.len() <= max_keys {
            UpsertOutcome::Absorbed { created }
        } else {
            let (mut left, right, split_key) = leaf.split(leaf.next.clone());
            trace!(split_key = %split_key, "leaf split");
            let right_ref: NodeRef = Arc::new(RwLock::new(NodeData {
                kind: NodeKind::Leaf(right),
            }));
            left.next = Some(right_ref.clone());
            let left_ref: NodeRef = Arc::new(RwLock::new(NodeData {
                kind: NodeKind::Leaf(left),
            }));
            UpsertOutcome::Split {
                left: left_ref,
                right: right_ref,
                split_key,
                created,
            }
        }
    }

    /// Patches a split child's two halves into a write-held internal node,
    /// splitting the internal node itself if that overflows it in turn.
    ///
    /// The child's position is recomputed from `key` rather than reused
    /// from before the recursive call: this node's write latch was released
    /// while the child was processed, so a concurrent insert into a sibling
    /// subtree may have shifted positions in `internal.keys` by the time
    /// this runs.
    fn apply_internal_split(
        guard: &mut NodeData,
        key: &str,
        left: NodeRef,
        right: NodeRef,
        split_key: String,
        created: bool,
        max_keys: usize,
    ) -> UpsertOutcome {
        let internal = match &mut guard.kind {
            NodeKind::Internal(internal) => internal,
            NodeKind::Leaf(_) => unreachable!("apply_internal_split called on a leaf"),
        };
        let idx = internal.child_index(key);
        internal.children[idx] = left;
        internal.keys.insert(idx, split_key);
        internal.children.insert(idx + 1, right);
        if internal.keys.len() <= max_keys {
            UpsertOutcome::Absorbed { created }
        } else {
            let (left, right, split_key) = internal.split();
            trace!(split_key = %split_key, "internal split");
            let left_ref: NodeRef = Arc::new(RwLock::new(NodeData {
                kind: NodeKind::Internal(left),
            }));
            let right_ref: NodeRef = Arc::new(RwLock::new(NodeData {
                kind: NodeKind::Internal(right),
            }));
            UpsertOutcome::Split {
                left: left_ref,
                right: right_ref,
                split_key,
                created,
            }
        }
    }

    /// Structural snapshot for tests and operators. Not part of the
    /// concurrency-critical path: takes a read latch on every node visited,
    /// one at a time, and does not represent a consistent point-in-time
    /// view under concurrent writers.
    pub fn stats(&self) -> BTreeStats {
        let root_guard = self.root.read();
        let root = root_guard.clone();
        drop(root_guard);

        let mut stats = BTreeStats::default();
        Self::collect_stats(&root, 1, &mut stats);
        stats
    }

    fn collect_stats(node_ref: &NodeRef, depth: usize, stats: &mut BTreeStats) {
        let guard = node_ref.read();
        match &guard.kind {
            NodeKind::Leaf(l) => {
                stats.leaf_count += 1;
                stats.key_count += l.keys.len();
                stats.height = stats.height.max(depth);
            }
            NodeKind::Internal(i) => {
                stats.internal_count += 1;
                stats.key_count += i.keys.len();
                let children: Vec<NodeRef> = i.children.clone();
                drop(guard);
                for child in &children {
                    Self::collect_stats(child, depth + 1, stats);
                }
            }
        }
    }
}
