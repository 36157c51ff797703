//! Embedding surface
//!
//! Host-facing entry points: calling values (protected and not), globals
//! access, native registration, and the built-in engine natives (`pcall`,
//! `error`, `type`, and the `task` table). Everything here speaks
//! `VmError` to the host; the internal signal type never crosses this
//! boundary.
//!
//! `call` is the unprotected entry: an error that reaches it has, by
//! definition, escaped every recovery point, so the panic callback runs
//! and the process aborts. That is the engine's only abort path; use `pcall`
//! everywhere the host can tolerate failure.

use crate::coroutine;
use crate::error::{ErrorInfo, Signal, Status, VmError};
use crate::frame::NativeFn;
use crate::heap::NativeClosure;
use crate::protect;
use crate::state::Vm;
use rill_core::limits::MULTRET;
use rill_core::Value;
use tracing::error;

impl Vm {
    // ---- host calls ----

    /// Call `f` with `args`, protected: errors are caught and returned.
    pub fn pcall(&mut self, f: Value, args: &[Value]) -> Result<Vec<Value>, VmError> {
        let saved_top = self.exec.top;
        let func = self.push_call(f, args).map_err(signal_to_error)?;
        match self.protected_call(func, MULTRET, false) {
            Err(_) => {
                debug_assert!(false, "suspension escaped to the host boundary");
                Err(VmError {
                    status: Status::RuntimeError,
                    value: Value::Nil,
                })
            }
            Ok(Ok(())) => {
                let values = self.exec.stack[func..self.exec.top].to_vec();
                self.truncate_top(saved_top);
                Ok(values)
            }
            Ok(Err(e)) => {
                let value = self.exec.stack[func];
                self.truncate_top(saved_top);
                Err(VmError {
                    status: e.status,
                    value,
                })
            }
        }
    }

    /// Call `f` with `args`, unprotected. An error here has escaped every
    /// recovery point: the panic callback (if any) runs, then the process
    /// aborts.
    pub fn call(&mut self, f: Value, args: &[Value]) -> Vec<Value> {
        let saved_top = self.exec.top;
        let run = (|| -> Result<Vec<Value>, Signal> {
            let func = self.push_call(f, args)?;
            self.call_value(func, MULTRET, false)?;
            let values = self.exec.stack[func..self.exec.top].to_vec();
            self.truncate_top(saved_top);
            Ok(values)
        })();
        match run {
            Ok(values) => values,
            Err(Signal::Error(e)) => self.panic_and_abort(e),
            Err(Signal::Yield) => {
                let e = ErrorInfo {
                    status: Status::RuntimeError,
                    value: Value::Nil,
                };
                self.panic_and_abort(e)
            }
        }
    }

    fn push_call(&mut self, f: Value, args: &[Value]) -> Result<usize, Signal> {
        self.ensure_stack(args.len() + 1)?;
        let func = self.exec.top;
        self.exec.stack[func] = f;
        for (i, &a) in args.iter().enumerate() {
            self.exec.stack[func + 1 + i] = a;
        }
        self.exec.top = func + 1 + args.len();
        Ok(func)
    }

    fn panic_and_abort(&mut self, e: ErrorInfo) -> ! {
        error!(status = %e.status, message = %self.display_value(e.value), "unprotected error; aborting");
        if let Some(p) = self.panic {
            p(self, e.value);
        }
        std::process::abort();
    }

    // ---- globals ----

    pub fn set_global(&mut self, name: &str, v: Value) -> Result<(), VmError> {
        let key = self.new_string(name).map_err(signal_to_error)?;
        let globals = self.globals;
        self.raw_set(globals, key, v).map_err(signal_to_error)
    }

    pub fn get_global(&mut self, name: &str) -> Result<Value, VmError> {
        let key = self.new_string(name).map_err(signal_to_error)?;
        Ok(self.heap.table(self.globals).get(key))
    }

    // ---- natives ----

    /// Wrap a native function as a callable value.
    pub fn new_native(&mut self, name: &str, f: NativeFn) -> Result<Value, VmError> {
        self.new_native_with_upvalues(name, f, Vec::new())
            .map_err(signal_to_error)
    }

    pub(crate) fn new_native_with_upvalues(
        &mut self,
        name: &str,
        f: NativeFn,
        upvalues: Vec<Value>,
    ) -> Result<Value, Signal> {
        match self.heap.new_native(NativeClosure {
            func: f,
            upvalues,
            name: name.into(),
        }) {
            Ok(r) => Ok(Value::Native(r)),
            Err(_) => Err(Signal::error(Status::MemoryError, self.oom_message)),
        }
    }

    /// Register a native under a global name.
    pub fn register_native(&mut self, name: &str, f: NativeFn) -> Result<Value, VmError> {
        let v = self.new_native(name, f)?;
        self.set_global(name, v)?;
        Ok(v)
    }

    /// Upvalue `i` of the running native closure.
    pub fn native_upvalue(&self, i: usize) -> Value {
        match self.exec.stack[self.current_frame().func] {
            Value::Native(n) => self
                .heap
                .native(n)
                .upvalues
                .get(i)
                .copied()
                .unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    /// Raise a runtime error from a native, message enriched with the
    /// caller's source position.
    pub fn error_from_native(&mut self, msg: &str) -> Signal {
        self.rt_error(msg)
    }

    /// Call a value from inside a native. Errors and suspensions propagate
    /// as signals; the nested call is non-yieldable, like any plain call.
    pub fn call_from_native(&mut self, f: Value, args: &[Value]) -> Result<Vec<Value>, Signal> {
        let func = self.push_call(f, args)?;
        self.call_value(func, MULTRET, false)?;
        let values = self.exec.stack[func..self.exec.top].to_vec();
        self.truncate_top(func);
        Ok(values)
    }

    /// Suspend the running task from a native; see
    /// [`yield_with`](Vm::yield_with).
    pub fn yield_values(&mut self, nresults: usize) -> Signal {
        self.yield_with(nresults, None, 0)
    }

    /// Install the engine's built-in natives: `pcall`, `error`, `type`,
    /// and the `task` table (create/resume/yield/status/wrap).
    pub fn install_base(&mut self) -> Result<(), VmError> {
        self.register_native("pcall", protect::native_pcall)?;
        self.register_native("error", protect::native_error)?;
        self.register_native("type", native_type)?;

        let task_table = self.new_table().map_err(signal_to_error)?;
        let Value::Table(tt) = task_table else {
            unreachable!("new_table returns a table");
        };
        let entries: [(&str, NativeFn); 5] = [
            ("create", coroutine::native_task_create),
            ("resume", coroutine::native_task_resume),
            ("yield", coroutine::native_task_yield),
            ("status", coroutine::native_task_status),
            ("wrap", coroutine::native_task_wrap),
        ];
        for (name, f) in entries {
            let key = self.new_string(name).map_err(signal_to_error)?;
            let v = self.new_native(&format!("task.{name}"), f)?;
            self.raw_set(tt, key, v).map_err(signal_to_error)?;
        }
        self.set_global("task", task_table)?;
        Ok(())
    }
}

fn signal_to_error(sig: Signal) -> VmError {
    match sig {
        Signal::Error(e) => VmError {
            status: e.status,
            value: e.value,
        },
        Signal::Yield => VmError {
            status: Status::RuntimeError,
            value: Value::Nil,
        },
    }
}

/// `type(v)`: the argument's type name as a string.
fn native_type(vm: &mut Vm) -> Result<usize, Signal> {
    if vm.arg_count() == 0 {
        return Err(vm.rt_error("bad argument #1 to 'type' (value expected)"));
    }
    let name = vm.arg(0).type_name().as_str();
    let v = vm.intern_value(name)?;
    vm.push(v)?;
    Ok(1)
}
