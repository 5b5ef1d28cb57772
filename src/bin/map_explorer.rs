//! Simple CLI tool to explore map layouts and lowering decisions
//!
//! Usage:
//!   cargo run --bin map_explorer -- --keys 50
//!   cargo run --bin map_explorer -- --keys 50 --hash-trace 3
//!   cargo run --bin map_explorer -- --keys 5 --fetch 9

use std::error::Error;

use clap::Parser;

use marten::fragments::Fragments;
use marten::hashing::{EngineKind, HashEngine};
use marten::lowering::{
    FetchEntry, KeyOperand, Label, Lowered, MapInstr, Operand, Tuning, lower,
};
use marten::machine::{Machine, Reg};
use marten::maps::{Child, MapRepr, Node, NodeHeader};
use marten::runtime::{NativeRuntime, RuntimeBridge};
use marten::types::ValueKind;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Explore map representations and lowering decisions", long_about = None)]
#[command(name = "map_explorer")]
struct Args {
    /// Number of atom keys to build the map with
    #[clap(long, default_value = "8")]
    keys: u64,

    /// Force the portable hash engine even if the hardware has CRC32C
    #[clap(long, default_value = "false")]
    portable: bool,

    /// Print the hash schedule for this key across rehash boundaries
    #[clap(long)]
    hash_trace: Option<u64>,

    /// Show the lowering decision for a batched fetch of this many triples
    #[clap(long)]
    fetch: Option<usize>,

    /// Dump the trie node structure
    #[clap(long, default_value = "false")]
    shape: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let engine = if args.portable {
        HashEngine::portable()
    } else {
        HashEngine::select()
    };
    match engine.kind() {
        EngineKind::Crc32c => println!("hash engine: crc32c (accelerated)"),
        EngineKind::Portable => println!("hash engine: portable"),
    }

    let runtime = NativeRuntime::new(engine);
    let fragments = Fragments::new(engine);
    let mut machine = Machine::new();

    let pairs: Vec<(u64, u64)> = (0..args.keys)
        .map(|i| (ValueKind::construct_atom(i), ValueKind::construct_int(i as i64)))
        .collect();
    let map = runtime.construct_map(&mut machine, &pairs);

    match machine.heap.map(map) {
        MapRepr::Flat(flat) => {
            println!(
                "representation: flat map, {} keys (threshold {})",
                flat.len(),
                runtime.config().flatmap_max
            );
        }
        MapRepr::Trie(trie) => {
            println!(
                "representation: hashed trie, {} keys (threshold {})",
                trie.len(),
                runtime.config().flatmap_max
            );
            if args.shape {
                dump_node(trie.root(), 0);
            }
        }
    }

    if let Some(id) = args.hash_trace {
        let key = ValueKind::construct_atom(id);
        println!("hash schedule for atom({}):", id);
        println!("  level 0 (root): {:#010x}", engine.element_hash(key));
        for boundary in [8u32, 16, 24] {
            println!(
                "  level {} (depth {}): {:#010x}",
                boundary / 8,
                boundary,
                engine.path_hash(boundary, key)
            );
        }
    }

    if let Some(triples) = args.fetch {
        let entries: Vec<FetchEntry> = (0..triples)
            .map(|i| {
                let key = ValueKind::construct_atom(i as u64);
                FetchEntry {
                    key: KeyOperand::imm(key),
                    dst: Reg(i),
                    hash: engine.element_hash(key),
                }
            })
            .collect();
        let tuning = Tuning::default();
        let lowered = lower(
            MapInstr::GetElements {
                fail: Label(0),
                src: Operand::Imm(map),
                entries,
            },
            &tuning,
        );
        match &lowered {
            Lowered::FetchInline { .. } => println!(
                "fetch of {} triples: inlined ({} scalar args < cutoff {})",
                triples,
                triples * 3,
                tuning.max_inline_fetch_args
            ),
            Lowered::FetchViaHelper { .. } => println!(
                "fetch of {} triples: generic helper ({} scalar args, cutoff {})",
                triples,
                triples * 3,
                tuning.max_inline_fetch_args
            ),
            _ => unreachable!("get_elements lowers to a fetch form"),
        }
        let flow = lowered.run(&mut machine, &fragments, &runtime);
        println!("executed: {:?}", flow);
    }

    // A quick sanity lookup so the tool doubles as a smoke test.
    if args.keys > 0 {
        let probe = ValueKind::construct_atom(0);
        let out = fragments.get_element(&machine.heap, map, probe);
        println!(
            "lookup atom(0): success={} value={:#x}",
            out.success, out.value
        );
    }

    Ok(())
}

fn dump_node(node: &Node, depth: usize) {
    let indent = "  ".repeat(depth + 1);
    match node.header {
        NodeHeader::Dense => println!("{}dense node, 16 children", indent),
        NodeHeader::Sparse(bitmap) => println!(
            "{}sparse node, bitmap {:#06x}, {} children",
            indent,
            bitmap,
            bitmap.count_ones()
        ),
    }
    for child in &node.children {
        match child {
            Child::Node(inner) => dump_node(inner, depth + 1),
            Child::Leaf(leaf) => {
                println!("{}  leaf key={:#x} value={:#x}", indent, leaf.key, leaf.value)
            }
        }
    }
}
