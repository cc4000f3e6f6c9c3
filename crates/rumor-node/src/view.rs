//! Insertion-ordered map with O(1) indexed removal, plus the peer
//! descriptor stored in it.
//!
//! Backing layout is a pair of parallel vectors and a key → index table.
//! Removal swaps the doomed slot with the tail and pops, so uniform random
//! selection is a single `value_at(rand_index)`. Order is insertion order
//! until a removal perturbs it.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Shared write half of a peer connection. The matching read half is owned
/// by that connection's reader task.
pub type PeerWriter = Arc<Mutex<OwnedWriteHalf>>;

pub struct IndexedMap<K, V> {
    positions: HashMap<K, usize>,
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K: Eq + Hash + Copy, V> IndexedMap<K, V> {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn has(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.positions.get(key).map(|&i| &self.values[i])
    }

    /// Insert a value. An existing key keeps its slot; the displaced value
    /// is returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&i) = self.positions.get(&key) {
            return Some(std::mem::replace(&mut self.values[i], value));
        }
        self.keys.push(key);
        self.values.push(value);
        self.positions.insert(key, self.keys.len() - 1);
        None
    }

    pub fn key_at(&self, i: usize) -> K {
        self.keys[i]
    }

    pub fn value_at(&self, i: usize) -> &V {
        &self.values[i]
    }

    /// Remove by key. O(1): the tail slot is swapped into the hole and its
    /// index entry fixed up.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let i = *self.positions.get(key)?;
        Some(self.remove_at(i).1)
    }

    /// Remove the entry at index `i`, returning it.
    pub fn remove_at(&mut self, i: usize) -> (K, V) {
        let last = self.keys.len() - 1;
        self.keys.swap(i, last);
        self.values.swap(i, last);
        let key = self.keys.pop().expect("remove_at on empty map");
        let value = self.values.pop().expect("keys/values out of sync");
        if i < self.keys.len() {
            self.positions.insert(self.keys[i], i);
        }
        self.positions.remove(&key);
        (key, value)
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.keys.clear();
        self.values.clear();
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }
}

impl<K: Eq + Hash + Copy, V> Default for IndexedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Peer descriptor
// ============================================================================

/// A known peer. Active-view entries hold the shared write half of a live
/// connection; passive-view entries hold none.
#[derive(Clone)]
pub struct Node {
    pub id: u64,
    pub addr: String,
    pub writer: Option<PeerWriter>,
}

impl Node {
    /// Descriptor bound to a live connection (active view).
    pub fn connected(id: u64, addr: String, writer: PeerWriter) -> Self {
        Self {
            id,
            addr,
            writer: Some(writer),
        }
    }

    /// Descriptor with no transport (passive view).
    pub fn detached(id: u64, addr: String) -> Self {
        Self {
            id,
            addr,
            writer: None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("connected", &self.writer.is_some())
            .finish()
    }
}

/// Serializable projection of a `Node` for `/api/list`.
#[derive(Clone, Debug, Serialize)]
pub struct NodeInfo {
    pub id: u64,
    pub addr: String,
}

impl From<&Node> for NodeInfo {
    fn from(nd: &Node) -> Self {
        Self {
            id: nd.id,
            addr: nd.addr.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ViewSnapshot {
    pub active_view: Vec<NodeInfo>,
    pub passive_view: Vec<NodeInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_preserved_without_removals() {
        let mut m = IndexedMap::new();
        for id in [7u64, 3, 9, 1] {
            m.insert(id, id * 10);
        }
        assert_eq!(m.values(), &[70, 30, 90, 10]);
        assert_eq!(m.keys(), &[7, 3, 9, 1]);
    }

    #[test]
    fn insert_existing_key_keeps_slot_and_returns_old() {
        let mut m = IndexedMap::new();
        m.insert(1u64, "a");
        m.insert(2, "b");
        assert_eq!(m.insert(1, "a2"), Some("a"));
        assert_eq!(m.len(), 2);
        assert_eq!(m.values(), &["a2", "b"]);
    }

    #[test]
    fn remove_swaps_tail_into_hole() {
        let mut m = IndexedMap::new();
        for id in [1u64, 2, 3, 4] {
            m.insert(id, id);
        }
        assert_eq!(m.remove(&1), Some(1));
        // The tail (4) now occupies slot 0 and is reachable by key.
        assert_eq!(m.values(), &[4, 2, 3]);
        assert_eq!(m.get(&4), Some(&4));
        assert_eq!(m.get(&1), None);
        assert!(!m.has(&1));
    }

    #[test]
    fn remove_last_entry() {
        let mut m = IndexedMap::new();
        m.insert(5u64, "x");
        assert_eq!(m.remove(&5), Some("x"));
        assert!(m.is_empty());
        assert_eq!(m.remove(&5), None);
    }

    #[test]
    fn add_remove_interleaving_round_trip() {
        let mut m = IndexedMap::new();
        for id in 0u64..10 {
            m.insert(id, id);
        }
        for id in [0u64, 2, 4, 6, 8] {
            assert_eq!(m.remove(&id), Some(id));
        }
        assert_eq!(m.len(), 5);
        // Every survivor is reachable by key and by index, and indices agree.
        for id in [1u64, 3, 5, 7, 9] {
            assert_eq!(m.get(&id), Some(&id));
        }
        for i in 0..m.len() {
            let k = m.key_at(i);
            assert_eq!(*m.value_at(i), k);
            assert_eq!(m.get(&k), Some(&k));
        }
    }

    #[test]
    fn clear_resets_everything() {
        let mut m = IndexedMap::new();
        m.insert(1u64, 1);
        m.insert(2, 2);
        m.clear();
        assert!(m.is_empty());
        assert!(!m.has(&1));
        m.insert(3, 3);
        assert_eq!(m.values(), &[3]);
    }
}
