//! Coroutine tests: state transitions, transfer semantics, the resume
//! protocol errors, suspension across protected calls, and the
//! non-yieldable boundary.

mod common;

use common::{main_chunk, proto};
use rill_core::chunk::{rk_const, Constant, Instruction as I, OpCode as Op};
use rill_runtime::{
    native_task_yield, ResumeResult, Signal, Status, TaskStatus, Value, Vm,
};

fn vm_with_base() -> Vm {
    let mut vm = Vm::new();
    vm.install_base().expect("install base natives");
    vm
}

#[test]
fn test_yield_resume_roundtrip_preserves_locals() {
    let mut vm = Vm::new();
    // body(yield): local a = 10; local v = yield(100); return a + v
    let chunk = main_chunk(proto(
        1,
        4,
        vec![Constant::Number(10.0), Constant::Number(100.0)],
        vec![
            I::abx(Op::LoadK, 1, 0),
            I::abc(Op::Move, 2, 0, 0),
            I::abx(Op::LoadK, 3, 1),
            I::abc(Op::Call, 2, 2, 2),
            I::abc(Op::Add, 3, 1, 2),
            I::abc(Op::Return, 3, 2, 0),
        ],
    ));
    let body = vm.load(&chunk).expect("load");
    let yield_fn = vm.new_native("yield", native_task_yield).expect("native");

    let t = vm.create_task(body).expect("create");
    assert_eq!(vm.task_status(t), TaskStatus::Suspended);

    let r = vm.resume(t, &[yield_fn]);
    assert_eq!(r, ResumeResult::Yielded(vec![Value::Number(100.0)]));
    assert_eq!(vm.task_status(t), TaskStatus::Suspended);

    // Resumes at the next instruction with locals intact.
    let r = vm.resume(t, &[Value::Number(5.0)]);
    assert_eq!(r, ResumeResult::Done(vec![Value::Number(15.0)]));
    assert_eq!(vm.task_status(t), TaskStatus::Dead);
}

#[test]
fn test_resume_dead_task() {
    let mut vm = Vm::new();
    let f = vm.new_native("noop", |vm| {
        vm.push(Value::Nil)?;
        Ok(1)
    }).expect("native");
    let t = vm.create_task(f).expect("create");
    assert!(matches!(vm.resume(t, &[]), ResumeResult::Done(_)));

    let r = vm.resume(t, &[]);
    let ResumeResult::Error { status, value } = r else {
        panic!("expected a resume protocol error, got {r:?}");
    };
    assert_eq!(status, Status::RuntimeError);
    assert_eq!(vm.display_value(value), "cannot resume dead coroutine");
}

fn resume_self(vm: &mut Vm) -> Result<usize, Signal> {
    let Value::Task(me) = vm.arg(0) else {
        return Err(vm.error_from_native("expected own task handle"));
    };
    match vm.resume(me, &[]) {
        ResumeResult::Error { value, .. } => {
            vm.push(value)?;
            Ok(1)
        }
        other => Err(vm.error_from_native(&format!("self-resume succeeded: {other:?}"))),
    }
}

#[test]
fn test_resume_running_task_is_protocol_error() {
    let mut vm = Vm::new();
    let f = vm.new_native("resume_self", resume_self).expect("native");
    let t = vm.create_task(f).expect("create");
    let r = vm.resume(t, &[Value::Task(t)]);
    let ResumeResult::Done(vals) = r else {
        panic!("body should finish, got {r:?}");
    };
    assert_eq!(
        vm.display_value(vals[0]),
        "cannot resume non-suspended coroutine"
    );
}

fn yield_then_fail(vm: &mut Vm) -> Result<usize, Signal> {
    vm.push(Value::Number(42.0))?;
    Err(vm.yield_with(1, Some(fail_after_resume), 7))
}

fn fail_after_resume(vm: &mut Vm, status: Status, ctx: u64) -> Result<usize, Signal> {
    assert_eq!(status, Status::Yield);
    assert_eq!(ctx, 7, "context word survives the suspension");
    Err(vm.error_from_native("after resume"))
}

#[test]
fn test_yield_through_pcall_then_error_is_still_caught() {
    let mut vm = vm_with_base();
    // body(pcall, f): return pcall(f)
    let chunk = main_chunk(proto(
        2,
        4,
        vec![],
        vec![
            I::abc(Op::Move, 2, 0, 0),
            I::abc(Op::Move, 3, 1, 0),
            I::abc(Op::Call, 2, 2, 3),
            I::abc(Op::Return, 2, 3, 0),
        ],
    ));
    let body = vm.load(&chunk).expect("load");
    let pcall_fn = vm.get_global("pcall").expect("pcall installed");
    let f = vm.new_native("yield_then_fail", yield_then_fail).expect("native");

    let t = vm.create_task(body).expect("create");
    // The yield unwinds through the protected frame and out of the task.
    let r = vm.resume(t, &[pcall_fn, f]);
    assert_eq!(r, ResumeResult::Yielded(vec![Value::Number(42.0)]));

    // The continuation raises after resumption; the protected frame that
    // survived the suspension still catches it.
    let r = vm.resume(t, &[Value::Number(99.0)]);
    let ResumeResult::Done(vals) = r else {
        panic!("task should finish with pcall's result, got {r:?}");
    };
    assert_eq!(vals[0], Value::Boolean(false));
    assert!(
        vm.display_value(vals[1]).contains("after resume"),
        "got: {}",
        vm.display_value(vals[1])
    );
}

#[test]
fn test_yield_through_pcall_success_path() {
    let mut vm = vm_with_base();
    // body(pcall, yield): return pcall(yield, 42)
    let chunk = main_chunk(proto(
        2,
        5,
        vec![Constant::Number(42.0)],
        vec![
            I::abc(Op::Move, 2, 0, 0),
            I::abc(Op::Move, 3, 1, 0),
            I::abx(Op::LoadK, 4, 0),
            I::abc(Op::Call, 2, 3, 3),
            I::abc(Op::Return, 2, 3, 0),
        ],
    ));
    let body = vm.load(&chunk).expect("load");
    let pcall_fn = vm.get_global("pcall").expect("pcall installed");
    let yield_fn = vm.new_native("yield", native_task_yield).expect("native");

    let t = vm.create_task(body).expect("create");
    let r = vm.resume(t, &[pcall_fn, yield_fn]);
    assert_eq!(r, ResumeResult::Yielded(vec![Value::Number(42.0)]));

    // Resume value becomes the yield's result inside the pcall.
    let r = vm.resume(t, &[Value::Number(7.0)]);
    assert_eq!(
        r,
        ResumeResult::Done(vec![Value::Boolean(true), Value::Number(7.0)])
    );
}

fn body_outer(vm: &mut Vm) -> Result<usize, Signal> {
    let Value::Task(inner) = vm.arg(0) else {
        return Err(vm.error_from_native("expected inner task"));
    };
    // While this task runs, its resumer (the main task) is "normal".
    assert_eq!(vm.task_status(vm.main_task()), TaskStatus::Normal);
    match vm.resume(inner, &[Value::Number(5.0)]) {
        ResumeResult::Yielded(vals) | ResumeResult::Done(vals) => {
            let Value::Number(n) = vals[0] else {
                return Err(vm.error_from_native("inner task must yield a number"));
            };
            vm.push(Value::Number(n + 1.0))?;
            Ok(1)
        }
        ResumeResult::Error { status, value } => Err(Signal::error(status, value)),
    }
}

fn body_inner(vm: &mut Vm) -> Result<usize, Signal> {
    let Value::Number(n) = vm.arg(0) else {
        return Err(vm.error_from_native("expected a number"));
    };
    vm.push(Value::Number(n * 2.0))?;
    Err(vm.yield_with(1, None, 0))
}

#[test]
fn test_nested_resume() {
    let mut vm = Vm::new();
    let outer_fn = vm.new_native("outer", body_outer).expect("native");
    let inner_fn = vm.new_native("inner", body_inner).expect("native");
    let inner = vm.create_task(inner_fn).expect("create");
    let outer = vm.create_task(outer_fn).expect("create");

    let r = vm.resume(outer, &[Value::Task(inner)]);
    assert_eq!(r, ResumeResult::Done(vec![Value::Number(11.0)]));
    assert_eq!(vm.task_status(inner), TaskStatus::Suspended);
    assert_eq!(vm.task_status(outer), TaskStatus::Dead);
    assert_eq!(vm.task_status(vm.main_task()), TaskStatus::Running);
}

#[test]
fn test_empty_yield_roundtrip_is_a_noop() {
    let mut vm = Vm::new();
    let yield_fn = vm.new_native("yield", native_task_yield).expect("native");
    let t = vm.create_task(yield_fn).expect("create");
    assert_eq!(vm.resume(t, &[]), ResumeResult::Yielded(vec![]));
    assert_eq!(vm.task_status(t), TaskStatus::Suspended);
    assert_eq!(vm.resume(t, &[]), ResumeResult::Done(vec![]));
}

#[test]
fn test_yield_on_main_task_is_an_error() {
    let mut vm = vm_with_base();
    let task_table = vm.get_global("task").expect("task table");
    let Value::Table(tt) = task_table else {
        panic!("task is a table");
    };
    let key = vm.new_string("yield").expect("string");
    let yield_fn = vm.heap().table(tt).get(key);
    let err = vm.pcall(yield_fn, &[]).expect_err("main cannot yield");
    assert!(
        vm.display_value(err.value)
            .contains("attempt to yield from outside a coroutine"),
        "got: {}",
        vm.display_value(err.value)
    );
}

#[test]
fn test_yield_across_native_boundary_is_recoverable() {
    let mut vm = Vm::new();
    // body(t): return t + 1, where the add overload tries to yield.
    let chunk = main_chunk(proto(
        1,
        2,
        vec![Constant::Number(1.0)],
        vec![
            I::abc(Op::Add, 1, 0, rk_const(0)),
            I::abc(Op::Return, 1, 2, 0),
        ],
    ));
    let body = vm.load(&chunk).expect("load");
    let yield_fn = vm.new_native("yield", native_task_yield).expect("native");

    let t = vm.new_table().expect("table");
    let mt = vm.new_table().expect("table");
    let (Value::Table(tr), Value::Table(mtr)) = (t, mt) else {
        unreachable!("new_table returns tables");
    };
    let key = vm.new_string("__add").expect("string");
    vm.heap_mut().table_mut(mtr).set(key, yield_fn).expect("set");
    vm.heap_mut().table_mut(tr).metatable = Some(mtr);

    let task = vm.create_task(body).expect("create");
    let r = vm.resume(task, &[t]);
    let ResumeResult::Error { status, value } = r else {
        panic!("yield inside an overload must fail, got {r:?}");
    };
    assert_eq!(status, Status::RuntimeError);
    assert!(
        vm.display_value(value).contains("attempt to yield across a native boundary"),
        "got: {}",
        vm.display_value(value)
    );
    assert_eq!(vm.task_status(task), TaskStatus::Dead);
}

#[test]
fn test_wrap_propagates_values_and_errors() {
    let mut vm = vm_with_base();
    let task_table = vm.get_global("task").expect("task table");
    let Value::Table(tt) = task_table else {
        panic!("task is a table");
    };
    let wrap_key = vm.new_string("wrap").expect("string");
    let wrap_fn = vm.heap().table(tt).get(wrap_key);

    // Value path: a body that yields 42.
    let yielder = vm.new_native("yielder", |vm| {
        vm.push(Value::Number(42.0))?;
        Err(vm.yield_with(1, None, 0))
    }).expect("native");
    let out = vm.pcall(wrap_fn, &[yielder]).expect("wrap");
    let wrapper = out[0];
    let out = vm.pcall(wrapper, &[]).expect("first call resumes");
    assert_eq!(out, vec![Value::Number(42.0)]);

    // Error path: a body that raises.
    let failer = vm.new_native("failer", |vm| {
        let v = vm.new_string("inside")?;
        Err(Signal::error(Status::RuntimeError, v))
    }).expect("native");
    let out = vm.pcall(wrap_fn, &[failer]).expect("wrap");
    let wrapper = out[0];
    let err = vm.pcall(wrapper, &[]).expect_err("wrapped error propagates");
    assert_eq!(vm.display_value(err.value), "inside");
}
