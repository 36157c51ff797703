//! Protected calls and error propagation
//!
//! Raising is building an error signal; propagation is `Result` unwinding;
//! catching is a recovery snapshot taken when the protected call was
//! entered: frame depth, truncation target, counters, hook enablement.
//! On catch, the frame chain and stack truncate back to the snapshot, open
//! upvalues above it close, and the caught value lands where the caller
//! expects the (success, ...) / (failure, error) result. The chain is left
//! intact until that moment, which is what makes tracebacks possible.
//!
//! The `pcall` native is suspension-transparent: a yield below it unwinds
//! straight through (its frame keeps the protected flag and a continuation),
//! and the resume path re-arms recovery before unrolling. Errors raised
//! after resumption are still caught.

use crate::error::{ErrorInfo, Signal, Status};
use crate::frame::{CallFrame, FLAG_PROTECTED, FLAG_TAILCALL};
use crate::state::Vm;
use rill_core::limits::MULTRET;
use rill_core::Value;
use tracing::{debug, trace};

/// What a recovery point remembers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Recovery {
    pub frames: usize,
    /// Stack slot the discriminated result starts at; everything above is
    /// torn down on catch.
    pub base: usize,
    pub nny: u32,
    pub depth: u32,
    pub allow_hook: bool,
}

impl Vm {
    pub(crate) fn snapshot(&self, base: usize) -> Recovery {
        Recovery {
            frames: self.exec.frames.len(),
            base,
            nny: self.exec.nny,
            depth: self.exec.depth,
            allow_hook: self.exec.allow_hook,
        }
    }

    /// Catch: restore the snapshot and park the error value at its base.
    pub(crate) fn recover_to(&mut self, snap: Recovery, e: ErrorInfo) {
        debug!(status = %e.status, frames_dropped = self.exec.frames.len() - snap.frames, "recovering from error");
        self.exec.frames.truncate(snap.frames);
        self.close_upvalues(snap.base);
        self.truncate_top(snap.base);
        self.exec.stack[snap.base] = e.value;
        self.exec.top = snap.base + 1;
        self.exec.nny = snap.nny;
        self.exec.depth = snap.depth;
        self.exec.allow_hook = snap.allow_hook;
        self.shrink_stack();
    }

    /// Run the callable at `func` under a recovery point. Errors are caught
    /// here and reported as the inner `Err`; yields pass through untouched.
    pub(crate) fn protected_call(
        &mut self,
        func: usize,
        nresults: i32,
        allow_yield: bool,
    ) -> Result<Result<(), ErrorInfo>, Signal> {
        let snap = self.snapshot(func);
        match self.call_value(func, nresults, allow_yield) {
            Ok(()) => Ok(Ok(())),
            Err(Signal::Yield) => Err(Signal::Yield),
            Err(Signal::Error(e)) => {
                self.recover_to(snap, e);
                Ok(Err(e))
            }
        }
    }

    // ---- raising ----

    /// Raise an arbitrary value, as the `error` native does.
    pub(crate) fn raise_value(&mut self, v: Value) -> Signal {
        Signal::error(Status::RuntimeError, v)
    }

    /// Runtime error with source position from the innermost bytecode
    /// frame. Falls back to the bare message when no position is known, and
    /// to the preallocated out-of-memory signal when even the message
    /// cannot be built.
    pub(crate) fn rt_error(&mut self, msg: &str) -> Signal {
        let full = match self.current_position() {
            Some((src, line)) => format!("{src}:{line}: {msg}"),
            None => msg.to_string(),
        };
        trace!(message = %full, "runtime error raised");
        match self.intern_value(&full) {
            Ok(v) => Signal::error(Status::RuntimeError, v),
            Err(sig) => sig,
        }
    }

    pub(crate) fn type_error(&mut self, action: &str, v: Value) -> Signal {
        let t = v.type_name();
        self.rt_error(&format!("attempt to {action} a {t} value"))
    }

    pub(crate) fn order_error(&mut self, a: Value, b: Value) -> Signal {
        let (ta, tb) = (a.type_name(), b.type_name());
        if ta == tb {
            self.rt_error(&format!("attempt to compare two {ta} values"))
        } else {
            self.rt_error(&format!("attempt to compare {ta} with {tb}"))
        }
    }

    // ---- positions and tracebacks ----

    fn frame_position(&self, frame: &CallFrame) -> Option<(String, u32)> {
        if !frame.is_bytecode() {
            return None;
        }
        let Value::Closure(c) = self.exec.stack[frame.func] else {
            return None;
        };
        let p = &self.heap.proto(self.heap.closure(c).proto).desc;
        let line = *p.line_info.get(frame.pc.saturating_sub(1))?;
        Some((p.source.clone().unwrap_or_else(|| "?".to_string()), line))
    }

    pub(crate) fn current_position(&self) -> Option<(String, u32)> {
        self.exec
            .frames
            .iter()
            .rev()
            .find_map(|f| self.frame_position(f))
    }

    /// Human-readable walk of the preserved activation chain, innermost
    /// first. Valid any time; most useful from a hook or native while an
    /// error is still unwinding.
    pub fn traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for frame in self.exec.frames.iter().rev() {
            out.push_str("\n\t");
            match self.exec.stack[frame.func] {
                Value::Closure(_) => match self.frame_position(frame) {
                    Some((src, line)) => {
                        out.push_str(&format!("{src}:{line}: in function"));
                    }
                    None => out.push_str("?: in function"),
                },
                Value::Native(n) => {
                    out.push_str(&format!(
                        "[native]: in function '{}'",
                        self.heap.native(n).name
                    ));
                }
                _ => out.push_str("?: in ?"),
            }
            if frame.flags & FLAG_TAILCALL != 0 {
                out.push_str("\n\t(...tail calls...)");
            }
        }
        out
    }
}

// ---- engine natives ----

/// `pcall(f, ...)`: call `f` with the given arguments under a recovery
/// point. Returns `true, ...results` or `false, error`.
pub fn native_pcall(vm: &mut Vm) -> Result<usize, Signal> {
    if vm.arg_count() == 0 {
        return Err(vm.rt_error("bad argument #1 to 'pcall' (value expected)"));
    }
    let base = vm.current_frame().base;
    {
        let allow_hook = vm.exec.allow_hook;
        let f = vm.current_frame_mut();
        f.flags |= FLAG_PROTECTED;
        f.continuation = Some(pcall_continuation);
        f.extra = base;
        f.saved_allow_hook = allow_hook;
    }
    match vm.protected_call(base, MULTRET, true) {
        Err(sig) => Err(sig), // a yield passing through; the frame stays armed
        Ok(outcome) => {
            let f = vm.current_frame_mut();
            f.flags &= !FLAG_PROTECTED;
            f.continuation = None;
            match outcome {
                Ok(()) => {
                    vm.prepend_at(base, Value::Boolean(true))?;
                    Ok(vm.exec.top - base)
                }
                Err(_) => {
                    // recover_to parked the error value at `base`.
                    vm.prepend_at(base, Value::Boolean(false))?;
                    Ok(2)
                }
            }
        }
    }
}

/// Continuation for a `pcall` that a yield unwound through. The resume
/// path re-armed recovery; by the time this runs, either the callee
/// finished (results sit at the recovery base) or an error was recovered
/// (the error value sits there).
fn pcall_continuation(vm: &mut Vm, status: Status, _ctx: u64) -> Result<usize, Signal> {
    let base = vm.current_frame().extra;
    if status.is_error() {
        vm.prepend_at(base, Value::Boolean(false))?;
        Ok(2)
    } else {
        vm.prepend_at(base, Value::Boolean(true))?;
        Ok(vm.exec.top - base)
    }
}

/// `error(value [, level])`: raise `value`. String values get position
/// information for the given frame level (default 1, the caller of
/// `error`); level 0 raises the value untouched.
pub fn native_error(vm: &mut Vm) -> Result<usize, Signal> {
    let mut v = vm.arg(0);
    let level = match vm.arg(1) {
        Value::Nil => 1.0,
        Value::Number(n) => n,
        other => return Err(vm.type_error("use as a level", other)),
    };
    if level > 0.0 {
        if let Value::Str(s) = v {
            if let Some((src, line)) = vm.current_position() {
                let enriched = format!("{src}:{line}: {}", vm.str_of(s));
                v = vm.intern_value(&enriched)?;
            }
        }
    }
    Err(vm.raise_value(v))
}

impl Vm {
    /// Shift `[at, top)` up one slot and write `v` at `at`.
    pub(crate) fn prepend_at(&mut self, at: usize, v: Value) -> Result<(), Signal> {
        self.ensure_stack(1)?;
        let top = self.exec.top;
        for i in (at..top).rev() {
            self.exec.stack[i + 1] = self.exec.stack[i];
        }
        self.exec.stack[at] = v;
        self.exec.top = top + 1;
        Ok(())
    }
}
