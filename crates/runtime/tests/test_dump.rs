//! End-to-end dump/load: a chunk survives the trip through its binary
//! form and a file on disk, and corrupted input is rejected with the
//! malformed-chunk status, never a panic.

mod common;

use common::{main_chunk, proto};
use rill_core::chunk::{Constant, Instruction as I, OpCode as Op};
use rill_core::dump::{dump_chunk, SIGNATURE};
use rill_runtime::{LoadError, Status, Value, Vm};
use std::io::{Read, Seek, Write};

fn forty_two() -> rill_core::Chunk {
    main_chunk(proto(
        0,
        2,
        vec![Constant::Number(40.0), Constant::Number(2.0)],
        vec![
            I::abx(Op::LoadK, 0, 0),
            I::abx(Op::LoadK, 1, 1),
            I::abc(Op::Add, 0, 0, 1),
            I::abc(Op::Return, 0, 2, 0),
        ],
    ))
}

#[test]
fn test_dump_load_run_through_file() {
    let chunk = forty_two();
    let bytes = dump_chunk(&chunk).expect("dump");

    let mut file = tempfile::tempfile().expect("tempfile");
    file.write_all(&bytes).expect("write");
    file.rewind().expect("rewind");
    let mut back = Vec::new();
    file.read_to_end(&mut back).expect("read");

    let mut vm = Vm::new();
    let f = vm.load_dump(&back).expect("load dump");
    assert_eq!(vm.pcall(f, &[]).expect("run"), vec![Value::Number(42.0)]);
}

#[test]
fn test_corrupted_dump_is_chunk_error() {
    let mut bytes = dump_chunk(&forty_two()).expect("dump");
    let mut vm = Vm::new();

    // Flip a byte in the body.
    let mid = bytes.len() - 4;
    bytes[mid] ^= 0xFF;
    match vm.load_dump(&bytes) {
        Err(e @ LoadError::Dump(_)) => assert_eq!(e.status(), Status::ChunkError),
        Err(e @ LoadError::Malformed(_)) => assert_eq!(e.status(), Status::ChunkError),
        other => panic!("corruption must be rejected, got {other:?}"),
    }

    // Wrong signature entirely.
    let err = vm.load_dump(b"#!/usr/bin/env rill").expect_err("not a dump");
    assert_eq!(err.status(), Status::ChunkError);

    // Truncated inside the header.
    let err = vm.load_dump(&SIGNATURE[..3]).expect_err("truncated");
    assert_eq!(err.status(), Status::ChunkError);
}
