//! Map representations and the read-side algorithms over them.
//!
//! A map is one of two shapes: a small flat map (two parallel arrays,
//! linear scan) or a hashed trie (16-way HAMT navigated by successive
//! 4-bit groups of the key hash). This module only ever reads these
//! structures; building and updating them is the runtime's job, and the
//! runtime guarantees the shape invariants (bitmap popcount matches child
//! count, dense nodes carry exactly 16 children, flat map arrays have
//! equal length). Nothing here re-checks them.

use crate::hashing::HashEngine;

/// Children per trie node, one per 4-bit hash group.
pub const TRIE_FANOUT: usize = 16;

/// Hash bits consumed per trie level.
pub const LEVEL_BITS: u32 = 4;

pub const LEVEL_MASK: u32 = 0xF;

/// Levels a 32-bit hash lasts for before a fresh one must be derived.
pub const REHASH_INTERVAL: u32 = 8;

pub enum MapRepr {
    Flat(FlatMap),
    Trie(HashTrie),
}

impl MapRepr {
    pub fn len(&self) -> usize {
        match self {
            MapRepr::Flat(map) => map.len(),
            MapRepr::Trie(trie) => trie.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key/value pair, in no particular order.
    pub fn pairs(&self) -> Vec<(u64, u64)> {
        match self {
            MapRepr::Flat(map) => map.pairs(),
            MapRepr::Trie(trie) => trie.pairs(),
        }
    }
}

/// The small-map representation: keys and values in two parallel arrays.
/// Lookup is a linear scan, so the allocator only picks this shape below a
/// size threshold it owns.
pub struct FlatMap {
    keys: Vec<u64>,
    values: Vec<u64>,
}

impl FlatMap {
    pub fn new(keys: Vec<u64>, values: Vec<u64>) -> Self {
        assert_eq!(keys.len(), values.len());
        FlatMap { keys, values }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn pairs(&self) -> Vec<(u64, u64)> {
        self.keys
            .iter()
            .copied()
            .zip(self.values.iter().copied())
            .collect()
    }

    /// Linear scan for `key`. Keys are unique so the direction doesn't
    /// change the answer; we go from the top down and keep it that way for
    /// predictability.
    pub fn scan(&self, key: u64) -> Option<u64> {
        let mut index = self.keys.len();
        while index > 0 {
            index -= 1;
            if self.keys[index] == key {
                return Some(self.values[index]);
            }
        }
        None
    }
}

/// Header word of a trie node. Sparse nodes store only the children that
/// exist, located by popcount over a 16-bit presence bitmap; a fully
/// populated node is written in its dense form, where the child index is
/// the storage slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeHeader {
    Sparse(u16),
    Dense,
}

/// An immutable key/value pair, two tagged words.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub key: u64,
    pub value: u64,
}

pub enum Child {
    Node(Box<Node>),
    Leaf(Leaf),
}

pub struct Node {
    pub header: NodeHeader,
    pub children: Vec<Child>,
}

impl Node {
    pub fn empty() -> Self {
        Node {
            header: NodeHeader::Sparse(0),
            children: Vec::new(),
        }
    }

    /// Storage slot for a 4-bit child index, or None when the child is
    /// absent. Popcount runs over the low bits of the 16-bit bitmap only.
    pub fn slot_for(&self, index: u32) -> Option<usize> {
        match self.header {
            NodeHeader::Dense => Some(index as usize),
            NodeHeader::Sparse(bitmap) => {
                let bit = 1u16 << index;
                if bitmap & bit == 0 {
                    None
                } else {
                    Some((bitmap & (bit - 1)).count_ones() as usize)
                }
            }
        }
    }
}

/// The hashed-trie representation. The root header (count plus root node)
/// is the two-word preamble every descent skips past.
pub struct HashTrie {
    count: usize,
    root: Node,
}

impl HashTrie {
    pub fn new(count: usize, root: Node) -> Self {
        HashTrie { count, root }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    pub fn set_count(&mut self, count: usize) {
        self.count = count;
    }

    /// Descend the trie for `key`, starting from `hash` (the caller has
    /// already derived the root-level hash, possibly at compile time).
    ///
    /// Each level consumes 4 bits. Once 8 levels have eaten the whole
    /// 32-bit hash, a fresh one is derived seeded by `depth >> 3`, which is
    /// what makes hash values path-dependent rather than fixed per key.
    pub fn lookup(&self, engine: &HashEngine, key: u64, hash: u32) -> Option<u64> {
        let mut node = &self.root;
        let mut hash = hash;
        let mut depth = 0u32;

        loop {
            let index = hash & LEVEL_MASK;
            hash >>= LEVEL_BITS;
            depth += 1;

            let slot = node.slot_for(index)?;

            match &node.children[slot] {
                Child::Leaf(leaf) => {
                    return if leaf.key == key {
                        Some(leaf.value)
                    } else {
                        None
                    };
                }
                Child::Node(inner) => {
                    node = inner;
                    if depth % REHASH_INTERVAL == 0 {
                        hash = engine.path_hash(depth, key);
                    }
                }
            }
        }
    }

    pub fn pairs(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::with_capacity(self.count);
        collect_pairs(&self.root, &mut out);
        out
    }
}

fn collect_pairs(node: &Node, out: &mut Vec<(u64, u64)>) {
    for child in &node.children {
        match child {
            Child::Leaf(leaf) => out.push((leaf.key, leaf.value)),
            Child::Node(inner) => collect_pairs(inner, out),
        }
    }
}
