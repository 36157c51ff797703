//! Rill core: shared foundation for the Rill scripting runtime
//!
//! Key design principles:
//! - Value: what scripts talk about (nil, booleans, numbers, heap handles)
//! - Chunk: the immutable bytecode bundle produced by a compiler
//! - Instruction: packed 32-bit register-machine instruction
//!
//! The runtime crate consumes these types; a compiler produces them. Nothing
//! here executes code or owns heap objects.

pub mod chunk;
pub mod dump;
pub mod limits;
pub mod value;

// Re-export key types
pub use chunk::{Chunk, ChunkError, Constant, Instruction, OpCode, Proto, UpvalDesc};
pub use dump::{DumpError, dump_chunk, load_chunk};
pub use value::{
    ClosureRef, NativeRef, StrRef, TableRef, TaskRef, TypeName, UserdataRef, Value,
};
