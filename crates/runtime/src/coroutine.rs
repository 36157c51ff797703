//! Tasks (coroutines): suspend and resume whole activation chains
//!
//! A task owns its register stack and frame chain; the heap, interner, and
//! registry are shared. Resuming parks the resumer's execution state in its
//! heap slot, swaps the target's in, and re-enters at the saved point:
//! a fresh task starts through the call protocol, a yielded native finishes
//! through its continuation (or takes the resume arguments as its results),
//! a yielded bytecode frame re-enters the dispatch loop. Then the unroll
//! walks whatever frames the yield unwound through. Yielding is the mirror
//! transfer; the resumer's own recovery chain is never unwound.
//!
//! Errors the task does not catch mark it dead and surface to the resumer
//! as a (failure, error) result, never as a raise inside the resumer.

use crate::error::{ErrorInfo, Signal, Status};
use crate::frame::{Continuation, FLAG_PROTECTED, FLAG_YIELDED};
use crate::state::{ExecState, Task, TaskStatus, Vm};
use rill_core::limits::MULTRET;
use rill_core::{TaskRef, Value};
use tracing::{debug, trace};

/// What a resume produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeResult {
    /// The task yielded; these are the yielded values.
    Yielded(Vec<Value>),
    /// The task ran to completion; these are its return values.
    Done(Vec<Value>),
    /// The task died with an error, or the resume itself was invalid
    /// (dead/running target, depth exhausted); invalid resumes do not
    /// touch the target.
    Error { status: Status, value: Value },
}

impl Vm {
    /// Create a suspended task whose body is `entry` (any callable).
    pub fn create_task(&mut self, entry: Value) -> Result<TaskRef, Signal> {
        if !matches!(entry, Value::Closure(_) | Value::Native(_)) {
            return Err(self.type_error("start a task from", entry));
        }
        let mut exec = ExecState::fresh();
        exec.stack[0] = entry;
        exec.top = 1;
        exec.nny = 1; // not resumable state yet; resume clears it
        match self.heap.new_task(Task { exec }) {
            Ok(t) => {
                trace!(task = t.0, "task created");
                Ok(t)
            }
            Err(_) => Err(Signal::error(Status::MemoryError, self.oom_message)),
        }
    }

    /// Resume `task` with `args`, running it until it yields, returns, or
    /// dies. Protocol violations are reported without touching the target.
    pub fn resume(&mut self, task: TaskRef, args: &[Value]) -> ResumeResult {
        if let Some(err) = self.resume_protocol_error(task) {
            return err;
        }

        let caller_depth = self.exec.depth;
        self.switch_to(task);
        self.exec.depth = caller_depth + 1;
        self.exec.nny = 0;
        let fresh = !self.exec.started;
        self.exec.started = true;
        self.exec.status = Status::Ok;
        debug!(task = task.0, fresh, "resume");

        let mut outcome = self.resume_step(fresh, args);
        loop {
            match outcome {
                Ok(()) | Err(Signal::Yield) => break,
                Err(Signal::Error(e)) => {
                    if self.recover_in_unroll(e) {
                        outcome = self.unroll();
                    } else {
                        // No recovery point on this task: it dies, and the
                        // error becomes the resumer's result.
                        self.exec.status = e.status;
                        debug!(task = task.0, status = %e.status, "task died");
                        self.switch_back();
                        return ResumeResult::Error {
                            status: e.status,
                            value: e.value,
                        };
                    }
                }
            }
        }

        if matches!(outcome, Err(Signal::Yield)) {
            let n = self.exec.yield_count;
            let first = self.exec.top - n;
            let values = self.exec.stack[first..self.exec.top].to_vec();
            self.truncate_top(first);
            self.switch_back();
            trace!(task = task.0, n, "task yielded");
            ResumeResult::Yielded(values)
        } else {
            // Ran to completion: results were compacted to the stack base.
            let values = self.exec.stack[..self.exec.top].to_vec();
            self.truncate_top(0);
            self.shrink_stack();
            self.switch_back();
            trace!(task = task.0, n = values.len(), "task finished");
            ResumeResult::Done(values)
        }
    }

    fn resume_protocol_error(&mut self, task: TaskRef) -> Option<ResumeResult> {
        let complaint = match self.task_status(task) {
            TaskStatus::Running | TaskStatus::Normal => "cannot resume non-suspended coroutine",
            TaskStatus::Dead => "cannot resume dead coroutine",
            TaskStatus::Suspended => {
                if self.exec.depth + 1 >= self.options.max_native_depth {
                    "native call depth exceeded"
                } else {
                    return None;
                }
            }
        };
        // Plain message, no source position: the fault is the resume call,
        // not anything executing inside either task.
        let value = match self.intern_value(complaint) {
            Ok(v) => v,
            Err(Signal::Error(e)) => e.value,
            Err(Signal::Yield) => unreachable!("interning cannot yield"),
        };
        Some(ResumeResult::Error {
            status: Status::RuntimeError,
            value,
        })
    }

    /// First step of a resume: enter a fresh body, or finish the activation
    /// the yield stopped in, then unroll the rest.
    fn resume_step(&mut self, fresh: bool, args: &[Value]) -> Result<(), Signal> {
        self.ensure_stack(args.len())?;
        for &a in args {
            let top = self.exec.top;
            self.exec.stack[top] = a;
            self.exec.top = top + 1;
        }
        if fresh {
            if self.precall(0, MULTRET)? {
                // Native body already finished.
                Ok(())
            } else {
                self.execute()?;
                self.unroll()
            }
        } else {
            let fi = self.exec.frames.len() - 1;
            let frame = self.exec.frames[fi];
            debug_assert!(frame.flags & FLAG_YIELDED != 0);
            self.exec.frames[fi].func = frame.extra;
            self.exec.frames[fi].flags &= !FLAG_YIELDED;
            if frame.is_bytecode() {
                self.execute()?;
            } else {
                if let Some(k) = frame.continuation {
                    self.exec.frames[fi].continuation = None;
                    let n = k(self, Status::Yield, frame.ctx)?;
                    let first = self.exec.top - n;
                    self.poscall(first)?;
                } else {
                    // No continuation: the resume arguments become the
                    // yield's results and the native call simply finishes.
                    let first = self.exec.top - args.len();
                    self.poscall(first)?;
                }
                self.restore_caller_top(frame.nresults);
            }
            self.unroll()
        }
    }

    /// Finish every frame the last yield unwound through: bytecode frames
    /// re-enter the dispatch loop, native frames finish via their
    /// continuations.
    fn unroll(&mut self) -> Result<(), Signal> {
        while let Some(frame) = self.exec.frames.last().copied() {
            if frame.is_bytecode() {
                self.execute()?;
                continue;
            }
            let Some(k) = frame.continuation else {
                return Err(self.rt_error("cannot resume: native frame without continuation"));
            };
            let fi = self.exec.frames.len() - 1;
            if frame.flags & FLAG_PROTECTED != 0 {
                self.exec.frames[fi].flags &= !FLAG_PROTECTED;
                self.exec.allow_hook = frame.saved_allow_hook;
            }
            self.exec.frames[fi].continuation = None;
            let status = frame.resume_status;
            let n = k(self, status, frame.ctx)?;
            let first = self.exec.top - n;
            self.poscall(first)?;
            self.restore_caller_top(frame.nresults);
        }
        Ok(())
    }

    /// After finishing a native on the resume path, put the top back where
    /// the caller's dispatch expects it, the same restore the call
    /// instruction performs for fixed-result calls.
    fn restore_caller_top(&mut self, nresults: i32) {
        if nresults != MULTRET {
            if let Some(caller) = self.exec.frames.last() {
                if caller.is_bytecode() {
                    self.exec.top = caller.top;
                }
            }
        }
    }

    /// Error during a resume: find the innermost protected frame, restore
    /// its recovery state, and park the error value at its base. The
    /// protected frame's continuation then reports (failure, error) when
    /// the unroll reaches it.
    fn recover_in_unroll(&mut self, e: ErrorInfo) -> bool {
        let Some(fi) = self.exec.frames.iter().rposition(|f| f.is_protected()) else {
            return false;
        };
        let frame = self.exec.frames[fi];
        debug!(frame = fi, status = %e.status, "recovering at protected frame");
        self.exec.frames.truncate(fi + 1);
        let base = frame.extra;
        self.close_upvalues(base);
        self.truncate_top(base);
        self.exec.stack[base] = e.value;
        self.exec.top = base + 1;
        self.exec.allow_hook = frame.saved_allow_hook;
        self.exec.nny = 0;
        self.shrink_stack();
        let f = &mut self.exec.frames[fi];
        f.flags &= !FLAG_PROTECTED;
        f.resume_status = e.status;
        true
    }

    /// Suspend the running task, leaving the top `nresults` stack values
    /// for the resumer. A native that wants to continue afterward registers
    /// a continuation; without one, the next resume finishes its call with
    /// the resume arguments as results.
    pub fn yield_with(
        &mut self,
        nresults: usize,
        continuation: Option<Continuation>,
        ctx: u64,
    ) -> Signal {
        if self.exec.nny > 0 {
            return if self.current == self.main {
                self.rt_error("attempt to yield from outside a coroutine")
            } else {
                self.rt_error("attempt to yield across a native boundary")
            };
        }
        let fi = self.exec.frames.len() - 1;
        let top = self.exec.top;
        let frame = &mut self.exec.frames[fi];
        frame.flags |= FLAG_YIELDED;
        frame.extra = frame.func;
        // Point the frame just below the yielded values so nothing below
        // them is touched while the task is parked.
        frame.func = top - nresults - 1;
        frame.continuation = continuation;
        frame.ctx = ctx;
        self.exec.status = Status::Yield;
        self.exec.yield_count = nresults;
        trace!(n = nresults, "yield");
        Signal::Yield
    }

    // ---- task switching ----

    fn switch_to(&mut self, task: TaskRef) {
        let parked = std::mem::replace(&mut self.exec, ExecState::parked_placeholder());
        self.heap.task_mut(self.current).exec = parked;
        self.exec = std::mem::replace(
            &mut self.heap.task_mut(task).exec,
            ExecState::parked_placeholder(),
        );
        self.resume_chain.push(self.current);
        self.current = task;
    }

    fn switch_back(&mut self) {
        let prev = self
            .resume_chain
            .pop()
            .expect("resume boundary without a resumer");
        let parked = std::mem::replace(&mut self.exec, ExecState::parked_placeholder());
        self.heap.task_mut(self.current).exec = parked;
        self.exec = std::mem::replace(
            &mut self.heap.task_mut(prev).exec,
            ExecState::parked_placeholder(),
        );
        self.current = prev;
    }
}

// ---- engine natives ----

/// `task.create(f)`: new suspended task running `f`.
pub fn native_task_create(vm: &mut Vm) -> Result<usize, Signal> {
    let entry = vm.arg(0);
    let t = vm.create_task(entry)?;
    vm.push(Value::Task(t))?;
    Ok(1)
}

/// `task.resume(t, ...)`: returns `true, ...` on yield/return and
/// `false, error` on failure.
pub fn native_task_resume(vm: &mut Vm) -> Result<usize, Signal> {
    let Value::Task(t) = vm.arg(0) else {
        let v = vm.arg(0);
        return Err(vm.type_error("resume", v));
    };
    let args: Vec<Value> = (1..vm.arg_count()).map(|i| vm.arg(i)).collect();
    match vm.resume(t, &args) {
        ResumeResult::Yielded(vals) | ResumeResult::Done(vals) => {
            vm.push(Value::Boolean(true))?;
            for v in &vals {
                vm.push(*v)?;
            }
            Ok(1 + vals.len())
        }
        ResumeResult::Error { value, .. } => {
            vm.push(Value::Boolean(false))?;
            vm.push(value)?;
            Ok(2)
        }
    }
}

/// `task.yield(...)`: suspend the running task with the given values.
pub fn native_task_yield(vm: &mut Vm) -> Result<usize, Signal> {
    let n = vm.arg_count();
    Err(vm.yield_with(n, None, 0))
}

/// `task.status(t)`: "suspended" | "running" | "normal" | "dead".
pub fn native_task_status(vm: &mut Vm) -> Result<usize, Signal> {
    let Value::Task(t) = vm.arg(0) else {
        let v = vm.arg(0);
        return Err(vm.type_error("query the status of", v));
    };
    let s = match vm.task_status(t) {
        TaskStatus::Suspended => "suspended",
        TaskStatus::Running => "running",
        TaskStatus::Normal => "normal",
        TaskStatus::Dead => "dead",
    };
    let v = vm.intern_value(s)?;
    vm.push(v)?;
    Ok(1)
}

/// `task.wrap(f)`: like create, but returns a callable that resumes the
/// task and raises on failure instead of returning a flag.
pub fn native_task_wrap(vm: &mut Vm) -> Result<usize, Signal> {
    let entry = vm.arg(0);
    let t = vm.create_task(entry)?;
    let wrapper = vm.new_native_with_upvalues("wrapped task", wrap_resume, vec![Value::Task(t)])?;
    vm.push(wrapper)?;
    Ok(1)
}

fn wrap_resume(vm: &mut Vm) -> Result<usize, Signal> {
    let Value::Task(t) = vm.native_upvalue(0) else {
        return Err(vm.rt_error("wrapped task is gone"));
    };
    let args: Vec<Value> = (0..vm.arg_count()).map(|i| vm.arg(i)).collect();
    match vm.resume(t, &args) {
        ResumeResult::Yielded(vals) | ResumeResult::Done(vals) => {
            for v in &vals {
                vm.push(*v)?;
            }
            Ok(vals.len())
        }
        ResumeResult::Error { status, value } => Err(Signal::error(status, value)),
    }
}
