//! Chunk loading
//!
//! Registers a validated chunk's prototypes with the heap (interning the
//! string constants, resolving nested-prototype references to handles)
//! and builds the entry closure. When the entry prototype declares an
//! upvalue, it is the globals upvalue: the closure's sole capture is bound
//! to the globals table, which is how top-level name access reaches it.

use crate::error::Status;
use crate::heap::{Closure, LoadedProto, ProtoId, Upvalue};
use crate::state::Vm;
use rill_core::chunk::{Chunk, ChunkError, Constant};
use rill_core::dump::DumpError;
use rill_core::Value;
use std::fmt;
use tracing::debug;

/// Error from loading a chunk into a runtime.
#[derive(Debug)]
pub enum LoadError {
    /// Structural validation failed.
    Malformed(ChunkError),
    /// The binary dump form was rejected.
    Dump(DumpError),
    /// The heap budget ran out while registering the chunk.
    OutOfMemory,
}

impl LoadError {
    pub fn status(&self) -> Status {
        match self {
            LoadError::Malformed(_) | LoadError::Dump(_) => Status::ChunkError,
            LoadError::OutOfMemory => Status::MemoryError,
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Malformed(e) => write!(f, "malformed chunk: {e}"),
            LoadError::Dump(e) => write!(f, "{e}"),
            LoadError::OutOfMemory => write!(f, "not enough memory to load chunk"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Malformed(e) => Some(e),
            LoadError::Dump(e) => Some(e),
            LoadError::OutOfMemory => None,
        }
    }
}

impl From<ChunkError> for LoadError {
    fn from(e: ChunkError) -> Self {
        LoadError::Malformed(e)
    }
}

impl From<DumpError> for LoadError {
    fn from(e: DumpError) -> Self {
        LoadError::Dump(e)
    }
}

impl Vm {
    /// Load a chunk and return its entry closure.
    pub fn load(&mut self, chunk: &Chunk) -> Result<Value, LoadError> {
        chunk.validate()?;
        let base = self.heap.proto_count() as u32;
        for proto in &chunk.protos {
            let mut constants = Vec::with_capacity(proto.constants.len());
            for c in &proto.constants {
                let v = match c {
                    Constant::Nil => Value::Nil,
                    Constant::Boolean(b) => Value::Boolean(*b),
                    Constant::Number(n) => Value::Number(*n),
                    Constant::Str(s) => {
                        Value::Str(self.heap.intern(s).map_err(|_| LoadError::OutOfMemory)?)
                    }
                };
                constants.push(v);
            }
            let subprotos = proto.protos.iter().map(|&i| ProtoId(base + i)).collect();
            self.heap.add_proto(LoadedProto {
                desc: proto.clone(),
                constants,
                subprotos,
                cache: None,
            });
        }
        let main_id = ProtoId(base + chunk.main);
        let mut upvalues = Vec::new();
        if !self.heap.proto(main_id).desc.upvalues.is_empty() {
            let globals = Value::Table(self.globals);
            let cell = self
                .heap
                .new_upvalue(Upvalue::Closed(globals))
                .map_err(|_| LoadError::OutOfMemory)?;
            upvalues.push(cell);
        }
        let closure = self
            .heap
            .new_closure(Closure {
                proto: main_id,
                upvalues,
            })
            .map_err(|_| LoadError::OutOfMemory)?;
        debug!(protos = chunk.protos.len(), "chunk loaded");
        Ok(Value::Closure(closure))
    }

    /// Load a chunk from its binary dump form.
    pub fn load_dump(&mut self, bytes: &[u8]) -> Result<Value, LoadError> {
        let chunk = rill_core::dump::load_chunk(bytes)?;
        self.load(&chunk)
    }
}
