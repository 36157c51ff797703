//! Runtime state: the `Vm`, its tasks, and their execution state
//!
//! `Vm` holds the shared runtime state (heap, registry, globals, per-type
//! overload tables, panic callback) and, inline, the execution state of the
//! *currently running* task: register stack, frame chain, open upvalues,
//! counters. Suspended tasks park their execution state in their heap slot;
//! a task switch is two `mem::swap`s. The hot interpreter path therefore
//! never borrows through a task slab, and no pointer into any stack exists
//! that a reallocation could invalidate, since every cross-reference is an index.

use crate::error::{Signal, Status};
use crate::frame::CallFrame;
use crate::heap::{Heap, UpvalRef};
use crate::hook::HookState;
use crate::meta::MetaNames;
use crate::table::Table;
use rill_core::limits::{BASE_STACK_SIZE, MAX_NATIVE_DEPTH, MAX_STACK};
use rill_core::value::TYPE_COUNT;
use rill_core::{StrRef, TableRef, TaskRef, Value};

/// Tuning knobs consumed at construction.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Ceiling on a task's register stack, in slots.
    pub max_stack: usize,
    /// Ceiling on nested native activations (native calls, overload
    /// fallbacks, nested resumes).
    pub max_native_depth: u32,
    /// Memory budget in ledger bytes; `None` means unbounded.
    pub memory_budget: Option<usize>,
    /// Allocations between collector step requests; 0 disables stepping.
    pub gc_step_period: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            max_stack: MAX_STACK,
            max_native_depth: MAX_NATIVE_DEPTH,
            memory_budget: None,
            gc_step_period: 256,
        }
    }
}

/// Installed on the shared state; runs just before the engine aborts on an
/// error that escaped every recovery point.
pub type PanicFn = fn(&mut Vm, Value);

/// Per-task execution state. Lives inline in the `Vm` while the task runs
/// and in the task's heap slot while it is parked.
#[derive(Debug)]
pub struct ExecState {
    /// Register stack. Length is the allocated size; every slot below it
    /// holds a valid value (nil-filled on growth).
    pub stack: Vec<Value>,
    /// First free slot.
    pub top: usize,
    /// The activation chain, innermost last.
    pub frames: Vec<CallFrame>,
    /// Open upvalue cells pointing into this stack, ascending by slot.
    pub open_upvalues: Vec<(usize, UpvalRef)>,
    /// Resume status: `Ok` (normal), `Yield` (suspended), or the error
    /// status that killed the task.
    pub status: Status,
    /// Has this task ever been resumed? Distinguishes a fresh task from a
    /// finished one when both sit at the base level.
    pub started: bool,
    /// Number of values the task yielded, parked on its stack top.
    pub yield_count: usize,
    /// Non-yieldable nesting: suspension attempts while nonzero are
    /// recoverable errors.
    pub nny: u32,
    /// Native recursion depth.
    pub depth: u32,
    pub hook: HookState,
    /// Cleared while a hook runs so hooks cannot re-enter themselves.
    pub allow_hook: bool,
}

impl ExecState {
    pub(crate) fn fresh() -> ExecState {
        ExecState {
            stack: vec![Value::Nil; BASE_STACK_SIZE],
            top: 0,
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            status: Status::Ok,
            started: false,
            yield_count: 0,
            // Parked tasks are non-yieldable; resume clears this when the
            // task actually starts running. The main task keeps it forever.
            nny: 1,
            depth: 0,
            hook: HookState::default(),
            allow_hook: true,
        }
    }

    /// Placeholder state for the slot of the task currently running.
    pub(crate) fn parked_placeholder() -> ExecState {
        ExecState {
            stack: Vec::new(),
            top: 0,
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            status: Status::Ok,
            started: true,
            yield_count: 0,
            nny: 0,
            depth: 0,
            hook: HookState::default(),
            allow_hook: true,
        }
    }
}

/// A task: an independently suspendable execution context. While parked its
/// execution state lives here; while running, in the `Vm`.
#[derive(Debug)]
pub struct Task {
    pub(crate) exec: ExecState,
}

/// Public task status, derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Never started, or yielded; resumable.
    Suspended,
    /// The task the runtime is currently executing.
    Running,
    /// Resumed another task and is waiting on it.
    Normal,
    /// Returned, errored, or otherwise never resumable again.
    Dead,
}

/// Registry slot holding the main task.
pub(crate) const REGISTRY_MAIN_TASK: f64 = 1.0;
/// Registry slot holding the globals table.
pub(crate) const REGISTRY_GLOBALS: f64 = 2.0;

pub struct Vm {
    /// Execution state of the running task.
    pub(crate) exec: ExecState,
    /// The running task.
    pub(crate) current: TaskRef,
    /// Tasks in the "normal" state: each resumed the next, outermost first.
    pub(crate) resume_chain: Vec<TaskRef>,

    pub(crate) heap: Heap,
    pub(crate) registry: TableRef,
    pub(crate) globals: TableRef,
    pub(crate) type_metatables: [Option<TableRef>; TYPE_COUNT],
    pub(crate) panic: Option<PanicFn>,
    pub(crate) options: VmOptions,
    pub(crate) meta_names: MetaNames,

    /// Preallocated error values, usable when allocating would be wrong.
    pub(crate) oom_message: Value,
    pub(crate) handler_error_message: Value,

    pub(crate) main: TaskRef,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Vm {
        let mut heap = Heap::new(options.memory_budget, options.gc_step_period);

        let oom = heap
            .intern("not enough memory")
            .expect("runtime bootstrap exceeds memory budget");
        let errerr = heap
            .intern("error in error handling")
            .expect("runtime bootstrap exceeds memory budget");
        let meta_names = MetaNames::intern(&mut heap)
            .expect("runtime bootstrap exceeds memory budget");

        let registry = heap
            .new_table(Table::new())
            .expect("runtime bootstrap exceeds memory budget");
        let globals = heap
            .new_table(Table::new())
            .expect("runtime bootstrap exceeds memory budget");
        let main = heap
            .new_task(Task {
                exec: ExecState::parked_placeholder(),
            })
            .expect("runtime bootstrap exceeds memory budget");

        {
            let t = heap.table_mut(registry);
            t.set(Value::Number(REGISTRY_MAIN_TASK), Value::Task(main))
                .expect("numeric registry key");
            t.set(Value::Number(REGISTRY_GLOBALS), Value::Table(globals))
                .expect("numeric registry key");
        }

        Vm {
            exec: ExecState::fresh(),
            current: main,
            resume_chain: Vec::new(),
            heap,
            registry,
            globals,
            type_metatables: [None; TYPE_COUNT],
            panic: None,
            options,
            meta_names,
            oom_message: Value::Str(oom),
            handler_error_message: Value::Str(errerr),
            main,
        }
    }

    /// The distinguished main task.
    pub fn main_task(&self) -> TaskRef {
        self.main
    }

    /// The task currently executing.
    pub fn running_task(&self) -> TaskRef {
        self.current
    }

    /// Derive a task's public status.
    pub fn task_status(&self, task: TaskRef) -> TaskStatus {
        if task == self.current {
            return TaskStatus::Running;
        }
        if self.resume_chain.contains(&task) {
            return TaskStatus::Normal;
        }
        let exec = &self.heap.task(task).exec;
        match exec.status {
            Status::Yield => TaskStatus::Suspended,
            Status::Ok => {
                if !exec.started {
                    TaskStatus::Suspended
                } else {
                    TaskStatus::Dead
                }
            }
            _ => TaskStatus::Dead,
        }
    }

    /// Current register-stack top of the running task. Host-level calls
    /// leave this where they found it.
    pub fn stack_top(&self) -> usize {
        self.exec.top
    }

    /// Activation-chain depth of the running task.
    pub fn frame_depth(&self) -> usize {
        self.exec.frames.len()
    }

    /// Shared heap access for hosts and natives.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn globals(&self) -> TableRef {
        self.globals
    }

    pub fn registry(&self) -> TableRef {
        self.registry
    }

    /// Install the callback that runs before the single abort path.
    pub fn at_panic(&mut self, f: Option<PanicFn>) -> Option<PanicFn> {
        std::mem::replace(&mut self.panic, f)
    }

    /// The metatable consulted for overloads on `v`: per-object for tables
    /// and full userdata, per-type for everything else.
    pub(crate) fn value_metatable(&self, v: Value) -> Option<TableRef> {
        match v {
            Value::Table(t) => self.heap.table(t).metatable,
            Value::Userdata(u) => self.heap.userdata(u).metatable,
            other => self.type_metatables[other.type_name().index()],
        }
    }

    /// Set the metatable used for all values of a primitive type.
    pub fn set_type_metatable(&mut self, ty: rill_core::TypeName, mt: Option<TableRef>) {
        self.type_metatables[ty.index()] = mt;
    }

    // ---- current-frame helpers for natives ----

    pub(crate) fn current_frame(&self) -> &CallFrame {
        self.exec.frames.last().expect("no active frame")
    }

    pub(crate) fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.exec.frames.last_mut().expect("no active frame")
    }

    /// Number of arguments the running native received.
    pub fn arg_count(&self) -> usize {
        self.exec.top - self.current_frame().base
    }

    /// Argument `i` (zero-based) of the running native; nil when absent.
    pub fn arg(&self, i: usize) -> Value {
        let base = self.current_frame().base;
        if base + i < self.exec.top {
            self.exec.stack[base + i]
        } else {
            Value::Nil
        }
    }

    /// Push a value on the register stack (native result convention).
    pub fn push(&mut self, v: Value) -> Result<(), Signal> {
        self.ensure_stack(1)?;
        let top = self.exec.top;
        self.exec.stack[top] = v;
        self.exec.top = top + 1;
        Ok(())
    }

    /// Intern a string and wrap it as a value.
    pub fn new_string(&mut self, s: &str) -> Result<Value, Signal> {
        match self.heap.intern(s) {
            Ok(r) => Ok(Value::Str(r)),
            Err(_) => Err(Signal::error(Status::MemoryError, self.oom_message)),
        }
    }

    /// Allocate an empty table value.
    pub fn new_table(&mut self) -> Result<Value, Signal> {
        match self.heap.new_table(Table::new()) {
            Ok(r) => Ok(Value::Table(r)),
            Err(_) => Err(Signal::error(Status::MemoryError, self.oom_message)),
        }
    }

    /// Render a value for messages and host display.
    pub fn display_value(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => fmt_number(n),
            Value::Str(s) => self.heap.str_content(s).to_string(),
            Value::Light(p) => format!("userdata: {p:#x}"),
            Value::Table(t) => format!("table: {:#010x}", t.0),
            Value::Closure(c) => format!("function: {:#010x}", c.0),
            Value::Native(n) => format!("function: builtin {:#010x}", n.0),
            Value::Userdata(u) => format!("userdata: {:#010x}", u.0),
            Value::Task(t) => format!("task: {:#010x}", t.0),
        }
    }

    /// Interned-string shortcut used throughout the engine.
    pub(crate) fn intern_value(&mut self, s: &str) -> Result<Value, Signal> {
        self.new_string(s)
    }

    pub(crate) fn str_of(&self, r: StrRef) -> &str {
        self.heap.str_content(r)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

/// Number formatting: integral values print without a fraction, everything
/// else uses the shortest round-trip form.
pub fn fmt_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// String-to-number coercion: decimal or `0x` hex, surrounding whitespace
/// allowed.
pub fn str_to_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let n = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()? as f64
    } else {
        body.parse::<f64>().ok()?
    };
    Some(if neg { -n } else { n })
}
