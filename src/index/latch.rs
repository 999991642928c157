// Stable-ancestor tracking for the optimistic upsert descent.
//
// The find-stable-ancestor walk couples read latches exactly like a lookup
// (acquire child, drop parent) — so by the time a node is inspected, every
// latch above it on the path has already been released. `LatchContext`
// therefore doesn't need to retain a literal stack of guards; it only needs
// to remember the identity of the deepest node proven stable so far.

use super::btree::NodeRef;

/// Deepest node on the descent path that can absorb one more key without
/// splitting, or the tree itself when no such node exists on the path.
#[derive(Clone)]
pub(crate) enum Ancestor {
    /// No node inside the tree is stable; the tree's root-swap latch is
    /// the fallback ancestor, seeded at the start of every descent.
    Tree,
    Node(NodeRef),
}

/// `Empty -> Building -> Upgraded -> Released`. Construction yields
/// `Building`; `add` keeps it there; the caller drives the `Upgraded` /
/// `Released` transitions itself once it has acquired the ancestor's write
/// latch, since that step needs access to the tree (see
/// `Tree::find_stable_ancestor` and `Tree::upsert`).
pub(crate) struct LatchContext {
    ancestor: Ancestor,
}

impl LatchContext {
    pub(crate) fn new() -> Self {
        Self {
            ancestor: Ancestor::Tree,
        }
    }

    /// Record that `node` was just read-latched during descent. A stable
    /// node supersedes any ancestor found higher up the path.
    pub(crate) fn add(&mut self, node: &NodeRef, is_stable: bool) {
        if is_stable {
            self.ancestor = Ancestor::Node(node.clone());
        }
    }

    pub(crate) fn into_ancestor(self) -> Ancestor {
        self.ancestor
    }
}
