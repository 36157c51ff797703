//! Call protocol
//!
//! `precall` turns "callable at slot `func`, arguments above it" into either
//! a completed native call or a freshly pushed bytecode frame. It never
//! recurses natively into the dispatch loop; it reports "enter the loop"
//! to its caller instead, which is what keeps tail calls flat. `poscall`
//! is the single return path: results compact down to where the callable
//! sat, the count adjusts to what the caller asked for, and the frame pops.
//!
//! Native callables run immediately and are the engine's collection safe
//! point. A non-callable value gets one retry through its type's call
//! overload.

use crate::error::{Signal, Status};
use crate::frame::CallFrame;
use crate::hook::HookEvent;
use crate::meta::Metamethod;
use crate::state::Vm;
use rill_core::limits::{EXTRA_STACK, MIN_NATIVE_SLOTS, MULTRET};
use rill_core::Value;
use tracing::trace;

impl Vm {
    /// Start a call. `func` is the stack slot of the callable; the
    /// arguments are `[func + 1, top)`.
    ///
    /// Returns true when the callee was native and has already completed
    /// (results are in place); false when a bytecode frame was pushed and
    /// the caller must enter the dispatch loop.
    pub(crate) fn precall(&mut self, func: usize, nresults: i32) -> Result<bool, Signal> {
        match self.exec.stack[func] {
            Value::Native(n) => {
                // Native calls are a collection safe point.
                if self.heap.wants_step() {
                    self.heap.step();
                }
                self.ensure_stack(MIN_NATIVE_SLOTS)?;
                let frame =
                    CallFrame::native(func, self.exec.top + MIN_NATIVE_SLOTS, nresults);
                self.exec.frames.push(frame);
                self.call_hook_event(HookEvent::Call)?;
                trace!(func, name = %self.heap.native(n).name, "native call");
                let body = self.heap.native(n).func;
                let pushed = body(self)?;
                debug_assert!(pushed <= self.exec.top);
                let first_result = self.exec.top - pushed;
                self.poscall(first_result)?;
                Ok(true)
            }
            Value::Closure(c) => {
                let proto_id = self.heap.closure(c).proto;
                let p = &self.heap.proto(proto_id).desc;
                let params = p.params as usize;
                let max_stack = p.max_stack as usize;
                let is_vararg = p.is_vararg;
                self.ensure_stack(max_stack + params + EXTRA_STACK)?;

                let mut nargs = self.exec.top - func - 1;
                while nargs < params {
                    let top = self.exec.top;
                    self.exec.stack[top] = Value::Nil;
                    self.exec.top = top + 1;
                    nargs += 1;
                }
                let base = if is_vararg {
                    self.adjust_varargs(params, nargs)
                } else {
                    func + 1
                };
                let frame = CallFrame::bytecode(func, base, base + max_stack, nresults);
                self.exec.frames.push(frame);
                self.exec.top = base + max_stack;
                self.call_hook_event(HookEvent::Call)?;
                trace!(func, base, "bytecode call");
                Ok(false)
            }
            other => {
                // Not callable: retry once through the call overload.
                let handler = self.metamethod_of(other, Metamethod::Call);
                if !matches!(handler, Value::Closure(_) | Value::Native(_)) {
                    return Err(self.type_error("call", other));
                }
                self.ensure_stack(1)?;
                let top = self.exec.top;
                for i in (func..top).rev() {
                    self.exec.stack[i + 1] = self.exec.stack[i];
                }
                self.exec.top = top + 1;
                self.exec.stack[func] = handler;
                self.precall(func, nresults)
            }
        }
    }

    /// Relocate the fixed parameters above the supplied arguments so the
    /// extras stay reachable for the vararg instruction. Returns the new
    /// base. `nargs` counts the already nil-padded arguments.
    fn adjust_varargs(&mut self, params: usize, nargs: usize) -> usize {
        let base = self.exec.top;
        let fixed = base - nargs;
        for i in 0..params {
            let v = self.exec.stack[fixed + i];
            let top = self.exec.top;
            self.exec.stack[top] = v;
            self.exec.top = top + 1;
            self.exec.stack[fixed + i] = Value::Nil;
        }
        base
    }

    /// Finish the innermost call: run the return hook, compact the results
    /// (starting at `first_result`) down to the callable's slot, pad with
    /// nil up to the caller's expected count, and pop the frame.
    pub(crate) fn poscall(&mut self, first_result: usize) -> Result<(), Signal> {
        self.call_hook_event(HookEvent::Return)?;
        let frame = self.exec.frames.pop().expect("return without an active frame");
        let produced = self.exec.top - first_result;
        let wanted = frame.nresults;
        let n = if wanted == MULTRET {
            produced
        } else {
            wanted as usize
        };
        let dest = frame.func;
        for i in 0..n {
            self.exec.stack[dest + i] = if i < produced {
                self.exec.stack[first_result + i]
            } else {
                Value::Nil
            };
        }
        self.truncate_top(dest + n);
        trace!(dest, results = n, "return");
        Ok(())
    }

    /// Call a callable already sitting at `func` with its arguments above
    /// it, running nested bytecode to completion. The depth guard bounds
    /// native recursion; the over-limit zone past it is reserved for the
    /// error-handling path, and exhausting that too is the double fault.
    pub(crate) fn call_value(
        &mut self,
        func: usize,
        nresults: i32,
        allow_yield: bool,
    ) -> Result<(), Signal> {
        self.exec.depth += 1;
        let limit = self.options.max_native_depth;
        if self.exec.depth >= limit {
            if self.exec.depth < limit + (limit >> 3) {
                let e = self.rt_error("native call depth exceeded");
                self.exec.depth -= 1;
                return Err(e);
            }
            self.exec.depth -= 1;
            return Err(Signal::error(
                Status::HandlerError,
                self.handler_error_message,
            ));
        }
        if !allow_yield {
            self.exec.nny += 1;
        }

        let outcome = match self.precall(func, nresults) {
            Ok(true) => Ok(()),
            Ok(false) => self.execute(),
            Err(e) => Err(e),
        };

        // Counters are restored here only on the success path. An error
        // unwind restores them absolutely at the recovery point; a yield
        // unwind re-derives them at the next resume.
        if outcome.is_ok() {
            if !allow_yield {
                self.exec.nny -= 1;
            }
            self.exec.depth -= 1;
        }
        outcome
    }
}
