//! Stack manager
//!
//! The register stack is a `Vec<Value>` whose length is the allocated size;
//! `top` is the first free slot and every slot below the length holds a
//! valid value. Because frames, open upvalues, and saved positions all hold
//! *indices*, growth and shrink are plain `Vec` resizes; there is no
//! pointer fixup to get wrong.
//!
//! Growth doubles up to the configured ceiling. A request past the ceiling
//! first grows to an emergency size so the error-handling path has headroom,
//! then raises a recoverable "stack overflow". Asking for more while already
//! on the emergency allocation is the error-in-error-handling case.
//!
//! Open upvalues also live here: the cells that still point into a live
//! region of the stack, kept sorted so closing a range is a walk off the
//! tail.

use crate::error::{Signal, Status};
use crate::heap::{Upvalue, UpvalRef};
use crate::state::Vm;
use rill_core::limits::{ERROR_HEADROOM, EXTRA_STACK};
use rill_core::Value;
use tracing::trace;

impl Vm {
    /// Guarantee `n` free slots above the current top (plus the standing
    /// slack every frame gets).
    #[inline]
    pub(crate) fn ensure_stack(&mut self, n: usize) -> Result<(), Signal> {
        let needed = self.exec.top + n + EXTRA_STACK;
        if needed <= self.exec.stack.len() {
            return Ok(());
        }
        self.grow_stack(n)
    }

    fn grow_stack(&mut self, n: usize) -> Result<(), Signal> {
        let size = self.exec.stack.len();
        let max = self.options.max_stack;
        if size > max {
            // Already on the emergency allocation: this overflow happened
            // while handling the previous one.
            return Err(Signal::error(
                Status::HandlerError,
                self.handler_error_message,
            ));
        }
        let needed = self.exec.top + n + EXTRA_STACK;
        let mut newsize = (2 * size).min(max);
        if newsize < needed {
            newsize = needed;
        }
        if newsize > max {
            // Grant headroom past the ceiling so error handling can run,
            // then report the overflow as a recoverable error.
            self.exec.stack.resize(max + ERROR_HEADROOM, Value::Nil);
            trace!(max, "register stack overflow");
            return Err(self.rt_error("stack overflow"));
        }
        trace!(from = size, to = newsize, "register stack grow");
        self.exec.stack.resize(newsize, Value::Nil);
        Ok(())
    }

    /// Highest slot any live frame or the top may touch.
    fn stack_in_use(&self) -> usize {
        let mut used = self.exec.top;
        for f in &self.exec.frames {
            used = used.max(f.top);
        }
        used
    }

    /// Give back space when usage has dropped well below capacity. Called
    /// after recovery and when a task finishes; uses the same resize path
    /// as growth.
    pub(crate) fn shrink_stack(&mut self) {
        let max = self.options.max_stack;
        let inuse = self.stack_in_use();
        if inuse > max {
            return; // still unwinding an overflow; keep the emergency room
        }
        let goodsize = (inuse + inuse / 8 + 2 * EXTRA_STACK).min(max);
        if goodsize < self.exec.stack.len() {
            trace!(from = self.exec.stack.len(), to = goodsize, "register stack shrink");
            self.exec.stack.truncate(goodsize);
            self.exec.stack.shrink_to_fit();
        }
    }

    /// Drop the top back to `new_top`, nil-clearing the abandoned slots so
    /// the valid-below-length invariant holds.
    pub(crate) fn truncate_top(&mut self, new_top: usize) {
        for slot in &mut self.exec.stack[new_top..self.exec.top.max(new_top)] {
            *slot = Value::Nil;
        }
        self.exec.top = new_top;
    }

    // ---- upvalues ----

    /// The open upvalue cell for stack slot `index`, creating it if this is
    /// the first capture.
    pub(crate) fn find_upvalue(&mut self, index: usize) -> Result<UpvalRef, Signal> {
        match self
            .exec
            .open_upvalues
            .binary_search_by_key(&index, |&(i, _)| i)
        {
            Ok(pos) => Ok(self.exec.open_upvalues[pos].1),
            Err(pos) => {
                let cell = Upvalue::Open {
                    task: self.current,
                    index,
                };
                let r = match self.heap.new_upvalue(cell) {
                    Ok(r) => r,
                    Err(_) => {
                        return Err(Signal::error(Status::MemoryError, self.oom_message));
                    }
                };
                self.exec.open_upvalues.insert(pos, (index, r));
                Ok(r)
            }
        }
    }

    /// Close every upvalue at or above `from`: copy the stack value into
    /// the cell and drop it from the open list. Runs when an activation's
    /// region is vacated (return, tail call, recovery, jump out of a block).
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        while let Some(&(index, r)) = self.exec.open_upvalues.last() {
            if index < from {
                break;
            }
            self.exec.open_upvalues.pop();
            let v = self.exec.stack[index];
            *self.heap.upvalue_mut(r) = Upvalue::Closed(v);
            self.heap.on_reference_store(v);
        }
    }

    pub(crate) fn read_upvalue(&self, r: UpvalRef) -> Value {
        match self.heap.upvalue(r) {
            Upvalue::Closed(v) => v,
            Upvalue::Open { task, index } => {
                if task == self.current {
                    self.exec.stack[index]
                } else {
                    self.heap.task(task).exec.stack[index]
                }
            }
        }
    }

    pub(crate) fn write_upvalue(&mut self, r: UpvalRef, v: Value) {
        self.heap.on_reference_store(v);
        match self.heap.upvalue(r) {
            Upvalue::Closed(_) => *self.heap.upvalue_mut(r) = Upvalue::Closed(v),
            Upvalue::Open { task, index } => {
                if task == self.current {
                    self.exec.stack[index] = v;
                } else {
                    self.heap.task_mut(task).exec.stack[index] = v;
                }
            }
        }
    }
}
