//! Rill runtime: the execution engine
//!
//! Key design principles:
//! - Every cross-reference into a register stack is an index, so stack
//!   relocation is a plain resize
//! - Non-local control (errors, yields) is `Result` propagation of a
//!   signal type; recovery points and resume boundaries are the only
//!   interceptors
//! - The collector sits behind a narrow contract (allocate, reference
//!   barrier, step request); the engine never sees its internals
//!
//! The typical embedding: build a `Vm`, `install_base`, `load` a chunk,
//! then `pcall` the returned closure.

pub mod api;
pub mod call;
pub mod coroutine;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod heap;
pub mod hook;
pub mod load;
pub mod meta;
pub mod protect;
pub mod stack;
pub mod state;
pub mod table;

// Re-export key types and functions
pub use coroutine::{
    native_task_create, native_task_resume, native_task_status, native_task_wrap,
    native_task_yield, ResumeResult,
};
pub use error::{ErrorInfo, Signal, Status, VmError};
pub use frame::{CallFrame, Continuation, NativeFn};
pub use heap::{Closure, Heap, LoadedProto, NativeClosure, ProtoId, Upvalue, UpvalRef, Userdata};
pub use hook::{HookEvent, HookFn, HookState, MASK_CALL, MASK_COUNT, MASK_LINE, MASK_RETURN};
pub use load::LoadError;
pub use meta::{ArithOp, Metamethod};
pub use protect::{native_error, native_pcall};
pub use state::{fmt_number, str_to_number, PanicFn, Task, TaskStatus, Vm, VmOptions};
pub use table::{BadKey, Table, TableKey};

// The shared foundation, re-exported so embedders need one dependency.
pub use rill_core as core;
pub use rill_core::{Chunk, Constant, Instruction, OpCode, Proto, UpvalDesc, Value};
