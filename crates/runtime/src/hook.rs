//! Debug hooks
//!
//! An optional per-task callback fired on call, return, line-change, and
//! instruction-count events. While a hook runs, hooking is disabled, so a
//! hook that triggers hookable events cannot storm itself. Count hooks are
//! the supported building block for embedder-side watchdogs and timeouts;
//! the engine itself has none.

use crate::error::Signal;
use crate::heap::ProtoId;
use crate::state::Vm;

pub const MASK_CALL: u8 = 1 << 0;
pub const MASK_RETURN: u8 = 1 << 1;
pub const MASK_LINE: u8 = 1 << 2;
pub const MASK_COUNT: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    Line(u32),
    Count,
}

/// The hook callback. May raise; the error propagates from the hooked
/// instruction like any other runtime error.
pub type HookFn = fn(&mut Vm, HookEvent) -> Result<(), Signal>;

#[derive(Debug, Clone, Copy, Default)]
pub struct HookState {
    pub mask: u8,
    /// Instructions between count events.
    pub count: u32,
    pub(crate) counter: u32,
    pub func: Option<HookFn>,
    pub(crate) last_line: Option<u32>,
}

impl Vm {
    /// Install (or clear) the running task's hook.
    pub fn set_hook(&mut self, func: Option<HookFn>, mask: u8, count: u32) {
        self.exec.hook = HookState {
            mask: if func.is_some() { mask } else { 0 },
            count,
            counter: count,
            func,
            last_line: None,
        };
    }

    /// Fire one event if the mask selects it and hooking is enabled.
    pub(crate) fn call_hook_event(&mut self, ev: HookEvent) -> Result<(), Signal> {
        let wanted = match ev {
            HookEvent::Call => MASK_CALL,
            HookEvent::Return => MASK_RETURN,
            HookEvent::Line(_) => MASK_LINE,
            HookEvent::Count => MASK_COUNT,
        };
        if self.exec.hook.mask & wanted == 0 || !self.exec.allow_hook {
            return Ok(());
        }
        let Some(f) = self.exec.hook.func else {
            return Ok(());
        };
        self.exec.allow_hook = false;
        if let Some(frame) = self.exec.frames.last_mut() {
            frame.flags |= crate::frame::FLAG_HOOKED;
        }
        let saved_top = self.exec.top;
        let r = f(self, ev);
        if r.is_ok() {
            self.truncate_top(saved_top);
            self.exec.allow_hook = true;
            if let Some(frame) = self.exec.frames.last_mut() {
                frame.flags &= !crate::frame::FLAG_HOOKED;
            }
        }
        // On error the recovery point restores both top and enablement.
        r
    }

    /// Per-instruction events: the count event fires before the line event
    /// when both are due at the same instruction.
    pub(crate) fn instruction_hooks(&mut self, proto: ProtoId, pc: usize) -> Result<(), Signal> {
        if self.exec.hook.mask & MASK_COUNT != 0 && self.exec.hook.count > 0 {
            self.exec.hook.counter = self.exec.hook.counter.saturating_sub(1);
            if self.exec.hook.counter == 0 {
                self.exec.hook.counter = self.exec.hook.count;
                self.call_hook_event(HookEvent::Count)?;
            }
        }
        if self.exec.hook.mask & MASK_LINE != 0 {
            if let Some(&line) = self.heap.proto(proto).desc.line_info.get(pc) {
                if self.exec.hook.last_line != Some(line) {
                    self.exec.hook.last_line = Some(line);
                    self.call_hook_event(HookEvent::Line(line))?;
                }
            }
        }
        Ok(())
    }
}
