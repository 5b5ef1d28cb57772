//! Map-operation backend for the Marten register VM.
//!
//! Compiles the map bytecode operations (element lookup, batched
//! extraction, associative and exact update, construction) into
//! executable lowered forms. The common cases (immediate keys, small flat
//! maps) are specialized; everything rare or allocation-heavy goes through
//! shared reentrant fragments or out to the runtime helpers.

pub mod fragments;
pub mod hashing;
pub mod lowering;
pub mod machine;
pub mod maps;
pub mod runtime;
pub mod types;
