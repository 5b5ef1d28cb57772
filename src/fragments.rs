//! Shared map-operation fragments.
//!
//! Every lowering site that needs the bulky logic (representation
//! dispatch, hashing, trie descent, runtime marshalling) calls one of
//! these globally shared entries instead of duplicating it. Each entry has
//! a fixed contract: an ordered list of input slots, one output value, and
//! one boolean success signal, carried together in [`Outcome`]. Inputs are
//! consumed; callers must not assume anything about them after the call.
//!
//! Fragments hold no mutable state of their own (the engine choice is
//! fixed at startup), so any number of threads may run the same entry
//! concurrently; each invocation's working state lives on its own stack.

use crate::hashing::HashEngine;
use crate::machine::{Fault, Heap, Machine};
use crate::maps::MapRepr;
use crate::runtime::RuntimeBridge;

/// Result slot pair shared by every fragment: one value plus the success
/// signal the caller branches on. A miss is a normal outcome, not an
/// error; `value` is nil when `success` is false.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub value: u64,
}

impl Outcome {
    pub fn hit(value: u64) -> Self {
        Outcome {
            success: true,
            value,
        }
    }

    pub fn miss() -> Self {
        Outcome {
            success: false,
            value: crate::types::ValueKind::nil_value(),
        }
    }
}

impl From<Option<u64>> for Outcome {
    fn from(value: Option<u64>) -> Self {
        match value {
            Some(value) => Outcome::hit(value),
            None => Outcome::miss(),
        }
    }
}

/// The fragment library. Constructed once per session with the hash
/// engine selected at startup and shared by every lowering site.
pub struct Fragments {
    engine: HashEngine,
}

impl Fragments {
    pub fn new(engine: HashEngine) -> Self {
        Fragments { engine }
    }

    pub fn engine(&self) -> &HashEngine {
        &self.engine
    }

    /// get-element. Inputs: (map, key). Dispatches on the representation
    /// tag: flat maps are scanned, tries are hashed and descended.
    pub fn get_element(&self, heap: &Heap, map: u64, key: u64) -> Outcome {
        match heap.map(map) {
            MapRepr::Flat(flat) => flat.scan(key).into(),
            MapRepr::Trie(trie) => {
                let hash = self.engine.element_hash(key);
                trie.lookup(&self.engine, key, hash).into()
            }
        }
    }

    /// get-element with a precomputed root-level hash. Inputs:
    /// (map, key, hash). Flat maps don't care about the hash; tries skip
    /// re-deriving it.
    pub fn get_element_hash(&self, heap: &Heap, map: u64, key: u64, hash: u32) -> Outcome {
        match heap.map(map) {
            MapRepr::Flat(flat) => flat.scan(key).into(),
            MapRepr::Trie(trie) => trie.lookup(&self.engine, key, hash).into(),
        }
    }

    /// construct. Inputs: (key/value pairs). Construction is dominated by
    /// allocation, so this just marshals and delegates.
    pub fn new_map(
        &self,
        runtime: &dyn RuntimeBridge,
        ctx: &mut Machine,
        pairs: &[(u64, u64)],
    ) -> u64 {
        runtime.construct_map(ctx, pairs)
    }

    /// construct, literal-keys form: a shared key tuple plus one value per
    /// key. Inputs: (keys, values).
    pub fn new_map_lit(
        &self,
        runtime: &dyn RuntimeBridge,
        ctx: &mut Machine,
        keys: &[u64],
        values: &[u64],
    ) -> u64 {
        let pairs: Vec<(u64, u64)> = keys.iter().copied().zip(values.iter().copied()).collect();
        runtime.construct_map(ctx, &pairs)
    }

    /// update-associative: insert or replace, always succeeds. Inputs:
    /// (base map, update pairs).
    pub fn update_assoc(
        &self,
        runtime: &dyn RuntimeBridge,
        ctx: &mut Machine,
        base: u64,
        updates: &[(u64, u64)],
    ) -> u64 {
        runtime.update_map_assoc(ctx, base, updates)
    }

    /// update-exact, guard variant: fails over the success signal if any
    /// key is absent. Inputs: (base map, update pairs).
    pub fn update_exact_guard(
        &self,
        runtime: &dyn RuntimeBridge,
        ctx: &mut Machine,
        base: u64,
        updates: &[(u64, u64)],
    ) -> Outcome {
        runtime.update_map_exact(ctx, base, updates).into()
    }

    /// update-exact, body variant: there is no caller-supplied failure
    /// path, so a missing key raises through the runtime and this entry
    /// does not return.
    pub fn update_exact_body(
        &self,
        runtime: &dyn RuntimeBridge,
        ctx: &mut Machine,
        base: u64,
        updates: &[(u64, u64)],
    ) -> u64 {
        match runtime.update_map_exact(ctx, base, updates) {
            Some(map) => map,
            None => {
                let reason = ctx.fault.take().unwrap_or(Fault::BadMap(base));
                runtime.raise(ctx, reason)
            }
        }
    }
}
