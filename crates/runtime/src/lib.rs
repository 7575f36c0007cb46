//! poke-runtime: the Poke Virtual Machine (PVM).
//!
//! A tagged value model (`value`), a lexical environment of heap-allocated
//! frames (`env`), a pluggable bit-addressed IO space registry (`ios`), the
//! Poke type system (`types`), and the stack-machine executor that ties
//! them together (`exec`).

pub mod env;
pub mod exec;
pub mod ios;
pub mod types;
pub mod value;

pub use env::{EnvError, Environment, Frame};
pub use exec::{Endian, ExceptionKind, Instr, NegEncoding, OutputMode, Pvm, PvmProgram, RunOutcome};
pub use ios::{IoDevice, Iod, IosError, IosFlags, IosId, IosRegistry};
pub use types::{ArrayBoundKind, Completeness, PokeType, StructField};
pub use value::{ArrayBound, ArrayCell, Closure, FieldCell, MapInfo, PokeArray, PokeOffset, PokeStruct, PvmValue, ValueError};
