//! The external runtime helpers the backend calls out to.
//!
//! Construction and destructive-looking updates are never inlined by the
//! backend: they are dominated by allocation and trie rebuilding, so the
//! lowered code marshals its operands and delegates here. [`RuntimeBridge`]
//! is the calling surface; [`NativeRuntime`] is the reference
//! implementation used by the VM (and by the tests), including
//! `make_map_hash`, the canonical whole-key hash that the backend's
//! expansion in `hashing.rs` must reproduce bit for bit.

use crate::hashing::{HCONST, HCONST_22, HashEngine, INTERNAL_HASH_SALT};
use crate::machine::{Fault, KeyDest, Machine, SCRATCH_REG};
use crate::maps::{
    Child, FlatMap, HashTrie, LEVEL_BITS, LEVEL_MASK, Leaf, MapRepr, Node, NodeHeader,
    REHASH_INTERVAL,
};

/// Unwind payload of the raise path. The lowered exact-update body variant
/// has no failure edge; on a missing key the runtime raises and the
/// nearest enclosing handler (outside this crate) catches this.
#[derive(Debug, Clone)]
pub struct Raised(pub Fault);

pub trait RuntimeBridge {
    /// Build a fresh map from scratch. Later duplicate keys win.
    fn construct_map(&self, ctx: &mut Machine, pairs: &[(u64, u64)]) -> u64;

    /// Insert-or-replace every update key. Always succeeds.
    fn update_map_assoc(&self, ctx: &mut Machine, base: u64, updates: &[(u64, u64)]) -> u64;

    /// Replace every update key, failing without building anything if any
    /// key is absent. Records the fault reason on the context.
    fn update_map_exact(
        &self,
        ctx: &mut Machine,
        base: u64,
        updates: &[(u64, u64)],
    ) -> Option<u64>;

    /// Type-polymorphic element lookup, the fallback for keys the backend
    /// could not prove immediate.
    fn get_map_element(&self, ctx: &Machine, map: u64, key: u64) -> Option<u64>;

    /// Same, with the root-level hash already in hand.
    fn get_map_element_hash(&self, ctx: &Machine, map: u64, key: u64, hash: u32) -> Option<u64>;

    /// Batched extraction fallback. Writes destinations as it goes and
    /// reports overall success; scratch destinations are not written.
    fn get_map_elements_batch(&self, ctx: &mut Machine, map: u64, entries: &[KeyDest]) -> bool;

    /// Non-local transfer out of generated code. Never returns.
    fn raise(&self, ctx: &mut Machine, reason: Fault) -> !;
}

/// Allocator policy knobs. The flat-vs-trie threshold is an empirical
/// tuning parameter, not an architectural constant.
#[derive(Debug, Copy, Clone)]
pub struct RuntimeConfig {
    /// Largest pair count stored as a flat map.
    pub flatmap_max: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig { flatmap_max: 32 }
    }
}

pub struct NativeRuntime {
    engine: HashEngine,
    config: RuntimeConfig,
}

impl NativeRuntime {
    pub fn new(engine: HashEngine) -> Self {
        Self::with_config(engine, RuntimeConfig::default())
    }

    pub fn with_config(engine: HashEngine, config: RuntimeConfig) -> Self {
        NativeRuntime { engine, config }
    }

    pub fn engine(&self) -> &HashEngine {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The canonical whole-key hash. `level` is zero for the root hash and
    /// `depth / 8` for the fresh hash derived at each rehash boundary.
    ///
    /// The backend expands this inline (`HashEngine::element_hash` and
    /// `HashEngine::path_hash`); any change here must be mirrored there or
    /// lookups will silently stop finding keys the builder placed.
    pub fn make_map_hash(&self, key: u64, level: u32) -> u32 {
        let mut hash = 0;
        if level != 0 {
            hash = self.engine.mix(level, 1, HCONST_22, hash);
        }
        hash ^= INTERNAL_HASH_SALT;
        self.engine
            .mix(key as u32, (key >> 32) as u32, HCONST, hash)
    }

    /// The 4-bit child index a key uses at a given trie depth, rehash
    /// boundaries included.
    fn hash_at(&self, key: u64, depth: u32) -> u32 {
        let base = self.make_map_hash(key, depth / REHASH_INTERVAL);
        base >> (LEVEL_BITS * (depth % REHASH_INTERVAL))
    }

    /// Pick a representation for a merged pair list and build it.
    fn build_repr(&self, pairs: &[(u64, u64)]) -> MapRepr {
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(pairs.len());
        for &(key, value) in pairs {
            match merged.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => merged.push((key, value)),
            }
        }

        if merged.len() <= self.config.flatmap_max {
            merged.sort_by_key(|&(key, _)| key);
            let (keys, values) = merged.into_iter().unzip();
            MapRepr::Flat(FlatMap::new(keys, values))
        } else {
            let mut trie = HashTrie::new(0, Node::empty());
            let mut count = 0;
            for (key, value) in merged {
                let hash = self.make_map_hash(key, 0);
                if self.insert(trie.root_mut(), 0, hash, key, value) {
                    count += 1;
                }
            }
            trie.set_count(count);
            MapRepr::Trie(trie)
        }
    }

    /// Insert into the node entered at `depth` levels of consumed hash.
    /// `hash` is the remaining bits for this key, low bits first. Returns
    /// whether the key was new.
    fn insert(&self, node: &mut Node, depth: u32, hash: u32, key: u64, value: u64) -> bool {
        let index = hash & LEVEL_MASK;
        let child_depth = depth + 1;
        let next_hash = if child_depth % REHASH_INTERVAL == 0 {
            self.make_map_hash(key, child_depth / REHASH_INTERVAL)
        } else {
            hash >> LEVEL_BITS
        };

        match node.header {
            NodeHeader::Dense => {
                self.insert_at(node, index as usize, child_depth, next_hash, key, value)
            }
            NodeHeader::Sparse(bitmap) => {
                let bit = 1u16 << index;
                let slot = (bitmap & (bit - 1)).count_ones() as usize;
                if bitmap & bit == 0 {
                    node.children.insert(slot, Child::Leaf(Leaf { key, value }));
                    let bitmap = bitmap | bit;
                    // A full node is always written in its dense form.
                    node.header = if bitmap == u16::MAX {
                        NodeHeader::Dense
                    } else {
                        NodeHeader::Sparse(bitmap)
                    };
                    true
                } else {
                    self.insert_at(node, slot, child_depth, next_hash, key, value)
                }
            }
        }
    }

    fn insert_at(
        &self,
        node: &mut Node,
        slot: usize,
        child_depth: u32,
        hash: u32,
        key: u64,
        value: u64,
    ) -> bool {
        let displaced = match &mut node.children[slot] {
            Child::Node(inner) => return self.insert(inner, child_depth, hash, key, value),
            Child::Leaf(leaf) if leaf.key == key => {
                leaf.value = value;
                return false;
            }
            Child::Leaf(leaf) => *leaf,
        };
        let joined = self.join_leaves(child_depth, displaced, Leaf { key, value });
        node.children[slot] = Child::Node(Box::new(joined));
        true
    }

    /// Build the subtree holding two distinct leaves, descending (and
    /// rehashing) until their paths diverge.
    fn join_leaves(&self, depth: u32, a: Leaf, b: Leaf) -> Node {
        let index_a = self.hash_at(a.key, depth) & LEVEL_MASK;
        let index_b = self.hash_at(b.key, depth) & LEVEL_MASK;

        if index_a == index_b {
            let child = self.join_leaves(depth + 1, a, b);
            Node {
                header: NodeHeader::Sparse(1u16 << index_a),
                children: vec![Child::Node(Box::new(child))],
            }
        } else {
            let bitmap = (1u16 << index_a) | (1u16 << index_b);
            let children = if index_a < index_b {
                vec![Child::Leaf(a), Child::Leaf(b)]
            } else {
                vec![Child::Leaf(b), Child::Leaf(a)]
            };
            Node {
                header: NodeHeader::Sparse(bitmap),
                children,
            }
        }
    }

    fn lookup_repr(&self, repr: &MapRepr, key: u64) -> Option<u64> {
        match repr {
            MapRepr::Flat(flat) => flat.scan(key),
            MapRepr::Trie(trie) => trie.lookup(&self.engine, key, self.make_map_hash(key, 0)),
        }
    }
}

impl RuntimeBridge for NativeRuntime {
    fn construct_map(&self, ctx: &mut Machine, pairs: &[(u64, u64)]) -> u64 {
        let repr = self.build_repr(pairs);
        ctx.heap.alloc_map(repr)
    }

    fn update_map_assoc(&self, ctx: &mut Machine, base: u64, updates: &[(u64, u64)]) -> u64 {
        let mut pairs = ctx.heap.map(base).pairs();
        pairs.extend_from_slice(updates);
        let repr = self.build_repr(&pairs);
        ctx.heap.alloc_map(repr)
    }

    fn update_map_exact(
        &self,
        ctx: &mut Machine,
        base: u64,
        updates: &[(u64, u64)],
    ) -> Option<u64> {
        for &(key, _) in updates {
            if self.lookup_repr(ctx.heap.map(base), key).is_none() {
                ctx.fault = Some(Fault::BadKey(key));
                return None;
            }
        }

        let mut pairs = ctx.heap.map(base).pairs();
        for &(key, value) in updates {
            for entry in pairs.iter_mut() {
                if entry.0 == key {
                    entry.1 = value;
                }
            }
        }
        let repr = self.build_repr(&pairs);
        Some(ctx.heap.alloc_map(repr))
    }

    fn get_map_element(&self, ctx: &Machine, map: u64, key: u64) -> Option<u64> {
        self.lookup_repr(ctx.heap.map(map), key)
    }

    fn get_map_element_hash(&self, ctx: &Machine, map: u64, key: u64, hash: u32) -> Option<u64> {
        match ctx.heap.map(map) {
            MapRepr::Flat(flat) => flat.scan(key),
            MapRepr::Trie(trie) => trie.lookup(&self.engine, key, hash),
        }
    }

    fn get_map_elements_batch(&self, ctx: &mut Machine, map: u64, entries: &[KeyDest]) -> bool {
        for entry in entries {
            let found = match ctx.heap.map(map) {
                MapRepr::Flat(flat) => flat.scan(entry.key),
                MapRepr::Trie(trie) => trie.lookup(&self.engine, entry.key, entry.hash),
            };
            match found {
                Some(value) => {
                    if entry.dst != SCRATCH_REG {
                        ctx.x[entry.dst.0] = value;
                    }
                }
                None => return false,
            }
        }
        true
    }

    fn raise(&self, ctx: &mut Machine, reason: Fault) -> ! {
        ctx.fault = Some(reason.clone());
        std::panic::panic_any(Raised(reason))
    }
}
