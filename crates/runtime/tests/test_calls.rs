//! Call-protocol tests: argument adjustment, native calls, the call
//! overload, tail-call frame reuse, and the depth guards.

mod common;

use common::{err_text, main_chunk, proto, run, vm_with_base, with_env};
use rill_core::chunk::{rk_const, Constant, Instruction as I, OpCode as Op};
use rill_runtime::{Signal, Status, Value, Vm, VmOptions};

#[test]
fn test_missing_arguments_pad_with_nil() {
    let mut vm = Vm::new();
    // return second parameter
    let chunk = main_chunk(proto(2, 2, vec![], vec![I::abc(Op::Return, 1, 2, 0)]));
    let f = vm.load(&chunk).expect("load");
    assert_eq!(vm.pcall(f, &[Value::Number(7.0)]).expect("run"), vec![Value::Nil]);
    assert_eq!(
        vm.pcall(f, &[Value::Number(7.0), Value::Number(8.0)]).expect("run"),
        vec![Value::Number(8.0)]
    );
}

#[test]
fn test_extra_arguments_discarded_for_fixed_proto() {
    let mut vm = Vm::new();
    let chunk = main_chunk(proto(2, 2, vec![], vec![I::abc(Op::Return, 1, 2, 0)]));
    let f = vm.load(&chunk).expect("load");
    let out = vm
        .pcall(
            f,
            &[Value::Number(7.0), Value::Number(8.0), Value::Number(9.0)],
        )
        .expect("run");
    assert_eq!(out, vec![Value::Number(8.0)]);
}

fn sum_native(vm: &mut Vm) -> Result<usize, Signal> {
    let mut total = 0.0;
    for i in 0..vm.arg_count() {
        match vm.arg(i) {
            Value::Number(n) => total += n,
            other => return Err(vm.error_from_native(&format!(
                "bad argument #{} to 'sum' (number expected, got {})",
                i + 1,
                other.type_name()
            ))),
        }
    }
    vm.push(Value::Number(total))?;
    Ok(1)
}

#[test]
fn test_bytecode_calls_native() {
    let mut vm = Vm::new();
    // f(sum) -> sum(21, 21)
    let chunk = main_chunk(proto(
        1,
        4,
        vec![Constant::Number(21.0)],
        vec![
            I::abc(Op::Move, 1, 0, 0),
            I::abx(Op::LoadK, 2, 0),
            I::abx(Op::LoadK, 3, 0),
            I::abc(Op::Call, 1, 3, 2),
            I::abc(Op::Return, 1, 2, 0),
        ],
    ));
    let f = vm.load(&chunk).expect("load");
    let sum = vm.new_native("sum", sum_native).expect("native");
    assert_eq!(vm.pcall(f, &[sum]).expect("run"), vec![Value::Number(42.0)]);
}

#[test]
fn test_pcall_and_error_from_bytecode() {
    let mut vm = vm_with_base();
    // local ok, e = pcall(error, "x"); return ok, e
    let chunk = main_chunk(with_env(proto(
        0,
        3,
        vec![
            Constant::Str("pcall".into()),
            Constant::Str("error".into()),
            Constant::Str("x".into()),
        ],
        vec![
            I::abc(Op::GetTabUp, 0, 0, rk_const(0)),
            I::abc(Op::GetTabUp, 1, 0, rk_const(1)),
            I::abx(Op::LoadK, 2, 2),
            I::abc(Op::Call, 0, 3, 3),
            I::abc(Op::Return, 0, 3, 0),
        ],
    )));
    let out = run(&mut vm, &chunk, &[]).expect("run");
    assert_eq!(out[0], Value::Boolean(false));
    assert_eq!(vm.display_value(out[1]), "x");
}

fn call_counter(vm: &mut Vm) -> Result<usize, Signal> {
    // (self, n) -> n + 1
    match vm.arg(1) {
        Value::Number(n) => {
            vm.push(Value::Number(n + 1.0))?;
            Ok(1)
        }
        other => {
            let t = other.type_name();
            Err(vm.error_from_native(&format!("cannot count a {t} value")))
        }
    }
}

#[test]
fn test_call_overload_retries_once() {
    let mut vm = Vm::new();
    // t(5) where t's type defines a call overload
    let chunk = main_chunk(proto(
        1,
        3,
        vec![Constant::Number(5.0)],
        vec![
            I::abc(Op::Move, 1, 0, 0),
            I::abx(Op::LoadK, 2, 0),
            I::abc(Op::Call, 1, 2, 2),
            I::abc(Op::Return, 1, 2, 0),
        ],
    ));
    let f = vm.load(&chunk).expect("load");

    let handler = vm.new_native("call_counter", call_counter).expect("native");
    let t = vm.new_table().expect("table");
    let mt = vm.new_table().expect("table");
    let (Value::Table(tr), Value::Table(mtr)) = (t, mt) else {
        unreachable!("new_table returns tables");
    };
    let key = vm.new_string("__call").expect("string");
    vm.heap_mut().table_mut(mtr).set(key, handler).expect("set");
    vm.heap_mut().table_mut(tr).metatable = Some(mtr);

    assert_eq!(vm.pcall(f, &[t]).expect("run"), vec![Value::Number(6.0)]);

    // Without the overload it is a plain type error.
    let plain = vm.new_table().expect("table");
    let err = vm.pcall(f, &[plain]).expect_err("not callable");
    assert!(err_text(&vm, &err).contains("attempt to call a table value"));
}

/// loop(self, n): if n == 0 then return 0 else return self(self, n - 1)
fn recursion_chunk(tail: bool) -> rill_core::Chunk {
    let mut code = vec![
        I::abc(Op::Eq, 0, 1, rk_const(0)), // n == 0 ? skip-next : take jump
        I::asbx(Op::Jmp, 0, 2),            // -> 4 (recurse)
        I::abx(Op::LoadK, 2, 0),
        I::abc(Op::Return, 2, 2, 0),
        I::abc(Op::Move, 2, 0, 0),
        I::abc(Op::Move, 3, 0, 0),
        I::abc(Op::Sub, 4, 1, rk_const(1)),
    ];
    if tail {
        code.push(I::abc(Op::TailCall, 2, 3, 0));
        code.push(I::abc(Op::Return, 2, 0, 0));
    } else {
        code.push(I::abc(Op::Call, 2, 3, 2));
        code.push(I::abc(Op::Return, 2, 2, 0));
    }
    main_chunk(proto(
        2,
        5,
        vec![Constant::Number(0.0), Constant::Number(1.0)],
        code,
    ))
}

#[test]
fn test_tail_call_recursion_is_flat() {
    let mut vm = Vm::with_options(VmOptions {
        max_stack: 10_000,
        ..VmOptions::default()
    });
    let chunk = recursion_chunk(true);
    let f = vm.load(&chunk).expect("load");
    // Far past the depth where the non-tail variant below blows up.
    let out = vm
        .pcall(f, &[f, Value::Number(100_000.0)])
        .expect("tail recursion runs in bounded stack");
    assert_eq!(out, vec![Value::Number(0.0)]);
    assert_eq!(vm.frame_depth(), 0);
}

#[test]
fn test_non_tail_recursion_overflows_recoverably() {
    let mut vm = Vm::with_options(VmOptions {
        max_stack: 10_000,
        ..VmOptions::default()
    });
    let chunk = recursion_chunk(false);
    let f = vm.load(&chunk).expect("load");
    let top_before = vm.stack_top();
    let err = vm
        .pcall(f, &[f, Value::Number(1_000_000.0)])
        .expect_err("must overflow");
    assert_eq!(err.status, Status::RuntimeError);
    assert!(err_text(&vm, &err).contains("stack overflow"), "got: {}", err_text(&vm, &err));
    assert_eq!(vm.stack_top(), top_before, "outer stack depth unchanged");
    assert_eq!(vm.frame_depth(), 0);
}

fn reenter(vm: &mut Vm) -> Result<usize, Signal> {
    // Calls its argument with itself, recursing through native frames.
    let f = vm.arg(0);
    let results = vm.call_from_native(f, &[f])?;
    for v in &results {
        vm.push(*v)?;
    }
    Ok(results.len())
}

#[test]
fn test_native_depth_guard() {
    let mut vm = Vm::new();
    let f = vm.new_native("reenter", reenter).expect("native");
    let err = vm.pcall(f, &[f]).expect_err("must hit the depth guard");
    assert_eq!(err.status, Status::RuntimeError);
    assert!(err_text(&vm, &err).contains("depth"), "got: {}", err_text(&vm, &err));
}
