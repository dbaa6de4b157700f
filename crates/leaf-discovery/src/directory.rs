//! Current discovery snapshot.

use crate::node::NodeSet;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Holder of the current [`NodeSet`]
///
/// Readers get an `Arc` to an immutable snapshot; writers replace the whole
/// snapshot under a short write lock, so a reader never sees a half-updated
/// set.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    current: RwLock<Arc<NodeSet>>,
    generation: AtomicU64,
}

impl NodeDirectory {
    /// Empty directory (generation 0)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot
    #[must_use]
    pub fn current(&self) -> Arc<NodeSet> {
        Arc::clone(&self.current.read())
    }

    /// Replace the snapshot wholesale, returning the new generation
    pub fn replace(&self, nodes: NodeSet) -> u64 {
        let nodes = Arc::new(nodes);
        let mut guard = self.current.write();
        *guard = nodes;
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop every node
    pub fn clear(&self) -> u64 {
        self.replace(NodeSet::empty())
    }

    /// Number of replacements so far
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RelayNode;

    fn set(addresses: &[&str]) -> NodeSet {
        NodeSet::from_nodes(addresses.iter().map(|a| RelayNode::new(a, "").unwrap()))
    }

    #[test]
    fn test_replace_is_wholesale() {
        let directory = NodeDirectory::new();
        assert!(directory.current().is_empty());

        assert_eq!(directory.replace(set(&["a.example:1", "b.example:1"])), 1);
        let before = directory.current();

        assert_eq!(directory.replace(set(&["c.example:1"])), 2);
        let after = directory.current();

        // Old readers keep their snapshot, new readers see only the new set
        assert_eq!(before.len(), 2);
        assert_eq!(after.addresses(), vec!["c.example:1"]);
        assert!(!after.contains("a.example:1"));
    }

    #[test]
    fn test_clear() {
        let directory = NodeDirectory::new();
        directory.replace(set(&["a.example:1"]));
        directory.clear();
        assert!(directory.current().is_empty());
        assert_eq!(directory.generation(), 2);
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_sets() {
        let directory = Arc::new(NodeDirectory::new());
        let small = set(&["a.example:1"]);
        let large = set(&["b.example:1", "c.example:1", "d.example:1"]);

        let writer = {
            let directory = Arc::clone(&directory);
            let (small, large) = (small.clone(), large.clone());
            std::thread::spawn(move || {
                for i in 0..1000 {
                    directory.replace(if i % 2 == 0 { small.clone() } else { large.clone() });
                }
            })
        };

        for _ in 0..1000 {
            let snapshot = directory.current();
            assert!(snapshot.is_empty() || *snapshot == small || *snapshot == large);
        }
        writer.join().unwrap();
    }
}
