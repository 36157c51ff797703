//! Shared helpers for the integration suites: hand-assembled chunks and a
//! ready-to-run VM.
#![allow(dead_code)]

use rill_core::chunk::{Chunk, Constant, Instruction, Proto, UpvalDesc};
use rill_runtime::{Value, Vm, VmError};

/// A prototype with the given shape and no debug info.
pub fn proto(params: u8, max_stack: u8, constants: Vec<Constant>, code: Vec<Instruction>) -> Proto {
    Proto {
        params,
        is_vararg: false,
        max_stack,
        code,
        constants,
        upvalues: Vec::new(),
        protos: Vec::new(),
        source: Some("test".to_string()),
        line_info: Vec::new(),
        line_defined: 0,
        last_line_defined: 0,
    }
}

/// Single-prototype chunk.
pub fn main_chunk(p: Proto) -> Chunk {
    Chunk {
        protos: vec![p],
        main: 0,
    }
}

/// Mark a prototype as the globals-capturing entry point.
pub fn with_env(mut p: Proto) -> Proto {
    p.upvalues.push(UpvalDesc {
        name: Some("_ENV".to_string()),
        in_stack: false,
        index: 0,
    });
    p
}

/// A VM with the engine natives installed.
pub fn vm_with_base() -> Vm {
    let mut vm = Vm::new();
    vm.install_base().expect("install base natives");
    vm
}

/// Load a chunk and run its entry closure under a protected call.
pub fn run(vm: &mut Vm, chunk: &Chunk, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let f = vm.load(chunk).expect("chunk loads");
    vm.pcall(f, args)
}

/// The message text of a caught error.
pub fn err_text(vm: &Vm, e: &VmError) -> String {
    vm.display_value(e.value)
}
