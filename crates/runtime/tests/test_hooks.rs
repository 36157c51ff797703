//! Debug-hook tests: count and line scheduling, call/return events, error
//! propagation out of a hook, and the no-reentrancy guarantee.

mod common;

use common::{main_chunk, proto, run};
use rill_core::chunk::{Constant, Instruction as I, OpCode as Op};
use rill_runtime::{HookEvent, Signal, Status, Value, Vm, MASK_CALL, MASK_COUNT, MASK_LINE, MASK_RETURN};
use std::cell::{Cell, RefCell};

thread_local! {
    static COUNT_HITS: Cell<u32> = const { Cell::new(0) };
    static EVENTS: RefCell<Vec<HookEvent>> = const { RefCell::new(Vec::new()) };
}

/// A chunk that spins a numeric for loop for `2 * n + 4` instructions.
fn spin_chunk(n: f64) -> rill_core::Chunk {
    main_chunk(proto(
        0,
        4,
        vec![Constant::Number(1.0), Constant::Number(n)],
        vec![
            I::abx(Op::LoadK, 0, 0),
            I::abx(Op::LoadK, 1, 1),
            I::abx(Op::LoadK, 2, 0),
            I::asbx(Op::ForPrep, 0, 0),
            I::asbx(Op::ForLoop, 0, -1),
            I::abc(Op::Return, 0, 1, 0),
        ],
    ))
}

fn counting_hook(_vm: &mut Vm, ev: HookEvent) -> Result<(), Signal> {
    if ev == HookEvent::Count {
        COUNT_HITS.with(|c| c.set(c.get() + 1));
    }
    Ok(())
}

#[test]
fn test_count_hook_fires_periodically() {
    COUNT_HITS.with(|c| c.set(0));
    let mut vm = Vm::new();
    vm.set_hook(Some(counting_hook), MASK_COUNT, 10);
    let chunk = spin_chunk(100.0);
    run(&mut vm, &chunk, &[]).expect("run");
    let hits = COUNT_HITS.with(|c| c.get());
    // ~106 instructions at one event per 10.
    assert!((8..=12).contains(&hits), "got {hits} count events");
}

fn failing_hook(vm: &mut Vm, ev: HookEvent) -> Result<(), Signal> {
    if ev == HookEvent::Count {
        return Err(vm.error_from_native("interrupted"));
    }
    Ok(())
}

#[test]
fn test_hook_error_is_caught_by_protected_call() {
    let mut vm = Vm::new();
    vm.set_hook(Some(failing_hook), MASK_COUNT, 50);
    let chunk = spin_chunk(1_000_000.0);
    let err = run(&mut vm, &chunk, &[]).expect_err("hook interrupts the loop");
    assert_eq!(err.status, Status::RuntimeError);
    assert!(
        vm.display_value(err.value).contains("interrupted"),
        "got: {}",
        vm.display_value(err.value)
    );
}

fn recording_hook(_vm: &mut Vm, ev: HookEvent) -> Result<(), Signal> {
    EVENTS.with(|e| e.borrow_mut().push(ev));
    Ok(())
}

#[test]
fn test_line_hook_fires_on_line_change() {
    EVENTS.with(|e| e.borrow_mut().clear());
    let mut vm = Vm::new();
    vm.set_hook(Some(recording_hook), MASK_LINE, 0);
    let mut p = proto(
        0,
        2,
        vec![Constant::Number(1.0)],
        vec![
            I::abx(Op::LoadK, 0, 0), // line 1
            I::abx(Op::LoadK, 1, 0), // line 2
            I::abc(Op::Add, 0, 0, 1), // line 2
            I::abc(Op::Return, 0, 2, 0), // line 3
        ],
    );
    p.line_info = vec![1, 2, 2, 3];
    run(&mut vm, &main_chunk(p), &[]).expect("run");
    let lines: Vec<HookEvent> = EVENTS.with(|e| e.borrow().clone());
    assert_eq!(
        lines,
        vec![HookEvent::Line(1), HookEvent::Line(2), HookEvent::Line(3)]
    );
}

#[test]
fn test_call_and_return_events_pair_up() {
    EVENTS.with(|e| e.borrow_mut().clear());
    let mut vm = Vm::new();
    vm.set_hook(Some(recording_hook), MASK_CALL | MASK_RETURN, 0);
    // main(f) -> f()
    let chunk = main_chunk(proto(
        1,
        2,
        vec![],
        vec![
            I::abc(Op::Move, 1, 0, 0),
            I::abc(Op::Call, 1, 1, 1),
            I::abc(Op::Return, 0, 1, 0),
        ],
    ));
    let f = vm.load(&chunk).expect("load");
    let noop = vm.new_native("noop", |_vm| Ok(0)).expect("native");
    vm.pcall(f, &[noop]).expect("run");
    let events: Vec<HookEvent> = EVENTS.with(|e| e.borrow().clone());
    assert_eq!(
        events,
        vec![
            HookEvent::Call,   // main
            HookEvent::Call,   // noop
            HookEvent::Return, // noop
            HookEvent::Return, // main
        ]
    );
}

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
    static NESTED: Cell<Value> = const { Cell::new(Value::Nil) };
}

fn nosy_hook(vm: &mut Vm, ev: HookEvent) -> Result<(), Signal> {
    assert!(!IN_HOOK.with(|f| f.get()), "hook reentered while running");
    if ev == HookEvent::Count {
        IN_HOOK.with(|f| f.set(true));
        // Running script from inside a hook must not re-trigger hooks,
        // even though it executes plenty of hookable instructions.
        let f = NESTED.with(|c| c.get());
        let r = vm.call_from_native(f, &[]);
        IN_HOOK.with(|f| f.set(false));
        r?;
    }
    Ok(())
}

#[test]
fn test_hooks_do_not_reenter() {
    IN_HOOK.with(|f| f.set(false));
    let mut vm = Vm::new();
    let nested = vm.load(&spin_chunk(50.0)).expect("load nested");
    NESTED.with(|c| c.set(nested));
    vm.set_hook(Some(nosy_hook), MASK_COUNT | MASK_CALL | MASK_RETURN, 5);
    run(&mut vm, &spin_chunk(20.0), &[]).expect("run");
}
