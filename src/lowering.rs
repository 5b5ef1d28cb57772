//! Lowering of map bytecode operations.
//!
//! Each operation is compiled into one of three shapes: a fully inlined
//! fast path, a call to a shared fragment, or a call to a generic runtime
//! helper. The decisions are made here, once, from what the surrounding
//! compiler statically knows about the operands; the lowered form then
//! executes against a [`Machine`] without re-deciding anything.
//!
//! The rules of thumb, in order of what they buy:
//! - lookups with keys that are provably immediates go through the shared
//!   get-element fragment and branch on its success signal;
//! - anything with a key that might need dereferencing goes to the
//!   type-polymorphic helper;
//! - batched extraction is unrolled inline only when it is small and every
//!   key is a constant immediate, and even then only the flat-map shape is
//!   specialized (a hashed trie at run time falls through to the batch
//!   helper);
//! - construction and updates always delegate, since their cost is all
//!   allocation and trie rebuilding.

use crate::fragments::Fragments;
use crate::machine::{KeyDest, Machine, Reg, SCRATCH_REG};
use crate::maps::MapRepr;
use crate::runtime::RuntimeBridge;
use crate::types::ValueKind;

/// Policy knobs. `max_inline_fetch_args` caps the flattened scalar
/// argument count (three per extraction triple) below which a multi-key
/// extraction is unrolled inline. Tuned empirically; correctness does not
/// depend on the exact value.
#[derive(Debug, Copy, Clone)]
pub struct Tuning {
    pub max_inline_fetch_args: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            max_inline_fetch_args: 24,
        }
    }
}

/// Branch target supplied by the surrounding instruction stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(u64),
}

impl Operand {
    pub fn resolve(&self, machine: &Machine) -> u64 {
        match self {
            Operand::Reg(reg) => machine.get(*reg),
            Operand::Imm(value) => *value,
        }
    }
}

/// What the type pass proved about a register operand's contents.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyClass {
    /// Always a fixed-width immediate; safe to hash and compare without
    /// dereferencing.
    Immediate,
    /// Could be anything.
    Any,
}

#[derive(Debug, Copy, Clone)]
pub struct KeyOperand {
    pub op: Operand,
    pub class: KeyClass,
}

impl KeyOperand {
    pub fn imm(value: u64) -> Self {
        KeyOperand {
            op: Operand::Imm(value),
            class: KeyClass::Immediate,
        }
    }

    pub fn reg(reg: Reg, class: KeyClass) -> Self {
        KeyOperand {
            op: Operand::Reg(reg),
            class,
        }
    }

    /// Statically known to always be an immediate. Constants answer for
    /// themselves; registers answer from the type pass.
    fn statically_immediate(&self) -> bool {
        match self.op {
            Operand::Imm(value) => ValueKind::is_immediate(value),
            Operand::Reg(_) => self.class == KeyClass::Immediate,
        }
    }

    /// A constant immediate, the stricter bar the inline extraction path
    /// requires.
    fn constant_immediate(&self) -> Option<u64> {
        match self.op {
            Operand::Imm(value) if ValueKind::is_immediate(value) => Some(value),
            _ => None,
        }
    }
}

/// One extraction triple: key, destination register, and the root-level
/// key hash the loader precomputed (meaningful for constant keys; register
/// keys get their hash derived at run time).
#[derive(Debug, Copy, Clone)]
pub struct FetchEntry {
    pub key: KeyOperand,
    pub dst: Reg,
    pub hash: u32,
}

/// Map bytecode operations, as handed to the backend by the instruction
/// selector.
pub enum MapInstr {
    GetElement {
        fail: Label,
        src: Operand,
        key: KeyOperand,
        dst: Reg,
    },
    GetElementHash {
        fail: Label,
        src: Operand,
        key: KeyOperand,
        hash: u32,
        dst: Reg,
    },
    GetElements {
        fail: Label,
        src: Operand,
        entries: Vec<FetchEntry>,
    },
    NewMap {
        dst: Reg,
        /// Flattened key/value pairs.
        args: Vec<Operand>,
    },
    NewMapLit {
        dst: Reg,
        /// Shared literal key tuple.
        keys: Vec<u64>,
        values: Vec<Operand>,
    },
    UpdateAssoc {
        src: Operand,
        dst: Reg,
        args: Vec<Operand>,
    },
    UpdateExact {
        src: Operand,
        /// A guard has somewhere to go on failure; a body does not and
        /// raises instead.
        fail: Option<Label>,
        dst: Reg,
        args: Vec<Operand>,
    },
}

/// An inlined extraction element: constant key plus destination, with the
/// precomputed hash kept for the trie fallback.
#[derive(Debug, Copy, Clone)]
pub struct InlineFetch {
    pub key: u64,
    pub dst: Reg,
    pub hash: u32,
}

/// The executable result of lowering one map operation.
pub enum Lowered {
    GetViaFragment {
        fail: Label,
        src: Operand,
        key: Operand,
        dst: Reg,
    },
    GetViaHelper {
        fail: Label,
        src: Operand,
        key: Operand,
        dst: Reg,
    },
    GetHashViaFragment {
        fail: Label,
        src: Operand,
        key: Operand,
        hash: u32,
        dst: Reg,
    },
    GetHashViaHelper {
        fail: Label,
        src: Operand,
        key: Operand,
        hash: u32,
        dst: Reg,
    },
    FetchInline {
        fail: Label,
        src: Operand,
        entries: Vec<InlineFetch>,
    },
    FetchViaHelper {
        fail: Label,
        src: Operand,
        entries: Vec<FetchEntry>,
    },
    Construct {
        dst: Reg,
        args: Vec<Operand>,
    },
    ConstructLit {
        dst: Reg,
        keys: Vec<u64>,
        values: Vec<Operand>,
    },
    Assoc {
        src: Operand,
        dst: Reg,
        args: Vec<Operand>,
    },
    ExactGuard {
        fail: Label,
        src: Operand,
        dst: Reg,
        args: Vec<Operand>,
    },
    ExactBody {
        src: Operand,
        dst: Reg,
        args: Vec<Operand>,
    },
}

/// Where control goes after a lowered operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flow {
    Next,
    Jump(Label),
}

pub fn lower(instr: MapInstr, tuning: &Tuning) -> Lowered {
    match instr {
        MapInstr::GetElement {
            fail,
            src,
            key,
            dst,
        } => {
            if key.statically_immediate() {
                Lowered::GetViaFragment {
                    fail,
                    src,
                    key: key.op,
                    dst,
                }
            } else {
                Lowered::GetViaHelper {
                    fail,
                    src,
                    key: key.op,
                    dst,
                }
            }
        }
        MapInstr::GetElementHash {
            fail,
            src,
            key,
            hash,
            dst,
        } => {
            if key.statically_immediate() {
                Lowered::GetHashViaFragment {
                    fail,
                    src,
                    key: key.op,
                    hash,
                    dst,
                }
            } else {
                Lowered::GetHashViaHelper {
                    fail,
                    src,
                    key: key.op,
                    hash,
                    dst,
                }
            }
        }
        MapInstr::GetElements { fail, src, entries } => {
            // Inlining huge extractions buys little and the unrolled form
            // is large, so cut off after a handful of triples.
            let small_enough = entries.len() * 3 < tuning.max_inline_fetch_args;
            let inline_keys: Option<Vec<InlineFetch>> = entries
                .iter()
                .map(|entry| {
                    entry.key.constant_immediate().map(|key| InlineFetch {
                        key,
                        dst: entry.dst,
                        hash: entry.hash,
                    })
                })
                .collect();

            match inline_keys {
                Some(inline) if small_enough => Lowered::FetchInline {
                    fail,
                    src,
                    entries: inline,
                },
                _ => Lowered::FetchViaHelper { fail, src, entries },
            }
        }
        MapInstr::NewMap { dst, args } => Lowered::Construct { dst, args },
        MapInstr::NewMapLit { dst, keys, values } => Lowered::ConstructLit { dst, keys, values },
        MapInstr::UpdateAssoc { src, dst, args } => Lowered::Assoc { src, dst, args },
        MapInstr::UpdateExact {
            src,
            fail,
            dst,
            args,
        } => match fail {
            Some(fail) => Lowered::ExactGuard {
                fail,
                src,
                dst,
                args,
            },
            None => Lowered::ExactBody { src, dst, args },
        },
    }
}

impl Lowered {
    /// Execute the lowered operation against a machine.
    pub fn run(
        &self,
        machine: &mut Machine,
        fragments: &Fragments,
        runtime: &dyn RuntimeBridge,
    ) -> Flow {
        match self {
            Lowered::GetViaFragment {
                fail,
                src,
                key,
                dst,
            } => {
                let map = src.resolve(machine);
                let key = key.resolve(machine);
                let out = fragments.get_element(&machine.heap, map, key);
                store_found(machine, *dst, *fail, out.success, out.value)
            }
            Lowered::GetViaHelper {
                fail,
                src,
                key,
                dst,
            } => {
                let map = src.resolve(machine);
                let key = key.resolve(machine);
                match runtime.get_map_element(machine, map, key) {
                    Some(value) => store_found(machine, *dst, *fail, true, value),
                    None => Flow::Jump(*fail),
                }
            }
            Lowered::GetHashViaFragment {
                fail,
                src,
                key,
                hash,
                dst,
            } => {
                let map = src.resolve(machine);
                let key = key.resolve(machine);
                let out = fragments.get_element_hash(&machine.heap, map, key, *hash);
                store_found(machine, *dst, *fail, out.success, out.value)
            }
            Lowered::GetHashViaHelper {
                fail,
                src,
                key,
                hash,
                dst,
            } => {
                let map = src.resolve(machine);
                let key = key.resolve(machine);
                match runtime.get_map_element_hash(machine, map, key, *hash) {
                    Some(value) => store_found(machine, *dst, *fail, true, value),
                    None => Flow::Jump(*fail),
                }
            }
            Lowered::FetchInline { fail, src, entries } => {
                let map = src.resolve(machine);
                match machine.heap.map(map) {
                    MapRepr::Flat(flat) => {
                        // Reverse declaration order, one descending scan
                        // per triple, fail-fast on the first miss.
                        for entry in entries.iter().rev() {
                            match flat.scan(entry.key) {
                                Some(value) => {
                                    if entry.dst != SCRATCH_REG {
                                        machine.x[entry.dst.0] = value;
                                    }
                                }
                                None => return Flow::Jump(*fail),
                            }
                        }
                        Flow::Next
                    }
                    MapRepr::Trie(_) => {
                        // The inline form only specializes flat maps.
                        let marshalled: Vec<KeyDest> = entries
                            .iter()
                            .map(|entry| KeyDest {
                                key: entry.key,
                                dst: entry.dst,
                                hash: entry.hash,
                            })
                            .collect();
                        if runtime.get_map_elements_batch(machine, map, &marshalled) {
                            Flow::Next
                        } else {
                            Flow::Jump(*fail)
                        }
                    }
                }
            }
            Lowered::FetchViaHelper { fail, src, entries } => {
                let map = src.resolve(machine);
                let marshalled: Vec<KeyDest> = entries
                    .iter()
                    .map(|entry| {
                        let key = entry.key.op.resolve(machine);
                        let hash = match entry.key.op {
                            Operand::Imm(_) => entry.hash,
                            Operand::Reg(_) => fragments.engine().element_hash(key),
                        };
                        KeyDest {
                            key,
                            dst: entry.dst,
                            hash,
                        }
                    })
                    .collect();
                if runtime.get_map_elements_batch(machine, map, &marshalled) {
                    Flow::Next
                } else {
                    Flow::Jump(*fail)
                }
            }
            Lowered::Construct { dst, args } => {
                let pairs = collect_pairs(machine, args);
                let map = fragments.new_map(runtime, machine, &pairs);
                machine.set(*dst, map);
                Flow::Next
            }
            Lowered::ConstructLit { dst, keys, values } => {
                let values: Vec<u64> = values.iter().map(|v| v.resolve(machine)).collect();
                let map = fragments.new_map_lit(runtime, machine, keys, &values);
                machine.set(*dst, map);
                Flow::Next
            }
            Lowered::Assoc { src, dst, args } => {
                let base = src.resolve(machine);
                let updates = collect_pairs(machine, args);
                let map = fragments.update_assoc(runtime, machine, base, &updates);
                machine.set(*dst, map);
                Flow::Next
            }
            Lowered::ExactGuard {
                fail,
                src,
                dst,
                args,
            } => {
                let base = src.resolve(machine);
                let updates = collect_pairs(machine, args);
                let out = fragments.update_exact_guard(runtime, machine, base, &updates);
                if !out.success {
                    return Flow::Jump(*fail);
                }
                machine.set(*dst, out.value);
                Flow::Next
            }
            Lowered::ExactBody { src, dst, args } => {
                let base = src.resolve(machine);
                let updates = collect_pairs(machine, args);
                let map = fragments.update_exact_body(runtime, machine, base, &updates);
                machine.set(*dst, map);
                Flow::Next
            }
        }
    }
}

fn store_found(machine: &mut Machine, dst: Reg, fail: Label, success: bool, value: u64) -> Flow {
    if !success {
        return Flow::Jump(fail);
    }
    // Presence tests point the destination at the scratch slot and only
    // want the branch.
    if dst != SCRATCH_REG {
        machine.set(dst, value);
    }
    Flow::Next
}

fn collect_pairs(machine: &Machine, args: &[Operand]) -> Vec<(u64, u64)> {
    assert!(args.len() % 2 == 0);
    args.chunks(2)
        .map(|pair| (pair[0].resolve(machine), pair[1].resolve(machine)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::HashEngine;
    use crate::types::ValueKind;

    fn atom(id: u64) -> u64 {
        ValueKind::construct_atom(id)
    }

    fn entries(n: usize) -> Vec<FetchEntry> {
        (0..n)
            .map(|i| FetchEntry {
                key: KeyOperand::imm(atom(i as u64)),
                dst: Reg(i),
                hash: 0,
            })
            .collect()
    }

    #[test]
    fn immediate_key_uses_fragment() {
        let lowered = lower(
            MapInstr::GetElement {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                key: KeyOperand::imm(atom(1)),
                dst: Reg(2),
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::GetViaFragment { .. }));
    }

    #[test]
    fn typed_register_key_uses_fragment() {
        let lowered = lower(
            MapInstr::GetElement {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                key: KeyOperand::reg(Reg(1), KeyClass::Immediate),
                dst: Reg(2),
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::GetViaFragment { .. }));
    }

    #[test]
    fn untyped_key_uses_helper() {
        let lowered = lower(
            MapInstr::GetElement {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                key: KeyOperand::reg(Reg(1), KeyClass::Any),
                dst: Reg(2),
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::GetViaHelper { .. }));
    }

    #[test]
    fn map_pointer_constant_key_uses_helper() {
        // A constant that is not an immediate never takes the fragment.
        let lowered = lower(
            MapInstr::GetElement {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                key: KeyOperand {
                    op: Operand::Imm(ValueKind::Map.tag(3)),
                    class: KeyClass::Any,
                },
                dst: Reg(2),
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::GetViaHelper { .. }));
    }

    #[test]
    fn small_constant_extraction_inlines() {
        let lowered = lower(
            MapInstr::GetElements {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                entries: entries(7),
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::FetchInline { .. }));
    }

    #[test]
    fn extraction_at_cutoff_goes_generic() {
        // 8 triples is 24 scalar args, which is not below the cutoff.
        let lowered = lower(
            MapInstr::GetElements {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                entries: entries(8),
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::FetchViaHelper { .. }));
    }

    #[test]
    fn register_key_disables_inlining() {
        let mut list = entries(3);
        list[1].key = KeyOperand::reg(Reg(9), KeyClass::Immediate);
        let lowered = lower(
            MapInstr::GetElements {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                entries: list,
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::FetchViaHelper { .. }));
    }

    #[test]
    fn cutoff_is_tunable() {
        let tuning = Tuning {
            max_inline_fetch_args: 6,
        };
        let lowered = lower(
            MapInstr::GetElements {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                entries: entries(2),
            },
            &tuning,
        );
        assert!(matches!(lowered, Lowered::FetchViaHelper { .. }));

        let lowered = lower(
            MapInstr::GetElements {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                entries: entries(1),
            },
            &tuning,
        );
        assert!(matches!(lowered, Lowered::FetchInline { .. }));
    }

    #[test]
    fn updates_and_construction_always_delegate() {
        let lowered = lower(
            MapInstr::NewMap {
                dst: Reg(0),
                args: vec![],
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::Construct { .. }));

        let lowered = lower(
            MapInstr::UpdateAssoc {
                src: Operand::Reg(Reg(0)),
                dst: Reg(1),
                args: vec![],
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::Assoc { .. }));

        let lowered = lower(
            MapInstr::UpdateExact {
                src: Operand::Reg(Reg(0)),
                fail: Some(Label(3)),
                dst: Reg(1),
                args: vec![],
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::ExactGuard { .. }));

        let lowered = lower(
            MapInstr::UpdateExact {
                src: Operand::Reg(Reg(0)),
                fail: None,
                dst: Reg(1),
                args: vec![],
            },
            &Tuning::default(),
        );
        assert!(matches!(lowered, Lowered::ExactBody { .. }));
    }

    #[test]
    fn scratch_destination_suppresses_store() {
        let engine = HashEngine::portable();
        let fragments = Fragments::new(engine);
        let runtime = crate::runtime::NativeRuntime::new(engine);
        let mut machine = Machine::new();

        let map = runtime.construct_map(&mut machine, &[(atom(1), ValueKind::construct_int(5))]);
        machine.set(Reg(0), map);

        let lowered = lower(
            MapInstr::GetElement {
                fail: Label(1),
                src: Operand::Reg(Reg(0)),
                key: KeyOperand::imm(atom(1)),
                dst: SCRATCH_REG,
            },
            &Tuning::default(),
        );
        let flow = lowered.run(&mut machine, &fragments, &runtime);
        assert_eq!(flow, Flow::Next);
        assert_eq!(machine.get(SCRATCH_REG), ValueKind::nil_value());
    }

    #[test]
    fn miss_branches_to_fail_label() {
        let engine = HashEngine::portable();
        let fragments = Fragments::new(engine);
        let runtime = crate::runtime::NativeRuntime::new(engine);
        let mut machine = Machine::new();

        let map = runtime.construct_map(&mut machine, &[(atom(1), ValueKind::construct_int(5))]);
        machine.set(Reg(0), map);

        let lowered = lower(
            MapInstr::GetElement {
                fail: Label(77),
                src: Operand::Reg(Reg(0)),
                key: KeyOperand::imm(atom(99)),
                dst: Reg(2),
            },
            &Tuning::default(),
        );
        let flow = lowered.run(&mut machine, &fragments, &runtime);
        assert_eq!(flow, Flow::Jump(Label(77)));
    }
}
