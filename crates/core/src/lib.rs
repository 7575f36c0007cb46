//! Low-level primitives shared by the poke runtime and compiler.
//!
//! This crate holds pieces that are language-agnostic enough to not belong
//! in either `poke-runtime` (the PVM) or `poke-compiler` (the incremental
//! compiler): a generic arena with stable, copyable indices, and the bit
//! packing/unpacking helpers the tagged-value representation and the
//! code generator both need.

pub mod arena;
pub mod bits;

pub use arena::{Arena, ArenaId};
