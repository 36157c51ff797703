//! The dispatch loop
//!
//! Interprets instructions against the current frame's register window.
//! The loop is iterative over the frame vector: calling a bytecode callee
//! pushes a frame and re-enters the outer loop, returning pops one, and a
//! tail call overwrites the current frame in place. The Rust call stack
//! never tracks script depth.
//!
//! Invariants the loop relies on:
//! - the chunk was validated (operands in range, compare/test paired with
//!   jumps, extended operands present);
//! - `frame.pc` is written back before anything that can call out, raise,
//!   or suspend, so the frame chain is always resumable and traceable;
//! - register accesses go through `base +` indices, never held pointers,
//!   so stack reallocation inside a fallback is harmless.

use crate::error::Signal;
use crate::heap::{Closure, Upvalue};
use crate::meta::ArithOp;
use crate::state::Vm;
use rill_core::chunk::{Instruction, OpCode};
use rill_core::limits::{FIELDS_PER_FLUSH, MULTRET};
use rill_core::Value;
use tracing::trace;

impl Vm {
    /// Run bytecode starting at the top frame, until a frame that was not
    /// entered from inside this loop returns. Expects the top frame to be
    /// a bytecode frame.
    pub(crate) fn execute(&mut self) -> Result<(), Signal> {
        debug_assert!(!self.exec.frames.is_empty(), "execute with no frame");

        'reentry: loop {
            let frame_idx = self.exec.frames.len() - 1;
            let frame = self.exec.frames[frame_idx];
            let base = frame.base;
            let closure_ref = match self.exec.stack[frame.func] {
                Value::Closure(c) => c,
                other => {
                    return Err(self.type_error("call", other));
                }
            };
            let proto_id = self.heap.closure(closure_ref).proto;
            let mut pc = frame.pc;

            macro_rules! reg {
                ($i:expr) => {
                    self.exec.stack[base + $i as usize]
                };
            }
            macro_rules! rk {
                ($arg:expr) => {{
                    let a = $arg;
                    if Instruction::is_const(a) {
                        self.heap.proto(proto_id).constants[Instruction::const_index(a)]
                    } else {
                        self.exec.stack[base + a as usize]
                    }
                }};
            }
            macro_rules! save_pc {
                () => {
                    self.exec.frames[frame_idx].pc = pc
                };
            }
            // Execute the jump that pairs with a matched compare/test.
            macro_rules! do_next_jump {
                () => {{
                    let ji = self.heap.proto(proto_id).desc.code[pc];
                    debug_assert_eq!(ji.opcode(), Some(OpCode::Jmp));
                    if ji.a() != 0 {
                        self.close_upvalues(base + ji.a() as usize - 1);
                    }
                    pc = (pc as i64 + 1 + ji.sbx() as i64) as usize;
                }};
            }
            macro_rules! arith_inst {
                ($op:ident, $i:expr) => {{
                    let vb = rk!($i.b());
                    let vc = rk!($i.c());
                    if let (Value::Number(x), Value::Number(y)) = (vb, vc) {
                        reg!($i.a()) = Value::Number(ArithOp::$op.apply(x, y));
                    } else {
                        save_pc!();
                        let v = self.arith(ArithOp::$op, vb, vc)?;
                        reg!($i.a()) = v;
                    }
                }};
            }

            loop {
                if self.exec.hook.mask != 0 {
                    save_pc!();
                    self.instruction_hooks(proto_id, pc)?;
                }

                let i = self.heap.proto(proto_id).desc.code[pc];
                pc += 1;

                let op = match i.opcode() {
                    Some(op) => op,
                    None => {
                        save_pc!();
                        return Err(self.rt_error("malformed instruction"));
                    }
                };

                match op {
                    OpCode::Move => {
                        reg!(i.a()) = reg!(i.b());
                    }
                    OpCode::LoadK => {
                        reg!(i.a()) = self.heap.proto(proto_id).constants[i.bx() as usize];
                    }
                    OpCode::LoadKx => {
                        let ax = self.heap.proto(proto_id).desc.code[pc].ax_arg();
                        pc += 1;
                        reg!(i.a()) = self.heap.proto(proto_id).constants[ax as usize];
                    }
                    OpCode::LoadBool => {
                        reg!(i.a()) = Value::Boolean(i.b() != 0);
                        if i.c() != 0 {
                            pc += 1;
                        }
                    }
                    OpCode::LoadNil => {
                        for r in i.a()..=i.a() + i.b() {
                            reg!(r) = Value::Nil;
                        }
                    }
                    OpCode::GetUpval => {
                        let cell = self.heap.closure(closure_ref).upvalues[i.b() as usize];
                        reg!(i.a()) = self.read_upvalue(cell);
                    }
                    OpCode::SetUpval => {
                        let cell = self.heap.closure(closure_ref).upvalues[i.b() as usize];
                        let v = reg!(i.a());
                        self.write_upvalue(cell, v);
                    }
                    OpCode::GetTabUp => {
                        let cell = self.heap.closure(closure_ref).upvalues[i.b() as usize];
                        let t = self.read_upvalue(cell);
                        let key = rk!(i.c());
                        save_pc!();
                        let v = self.index_get(t, key)?;
                        reg!(i.a()) = v;
                    }
                    OpCode::SetTabUp => {
                        let cell = self.heap.closure(closure_ref).upvalues[i.a() as usize];
                        let t = self.read_upvalue(cell);
                        let key = rk!(i.b());
                        let v = rk!(i.c());
                        save_pc!();
                        self.index_set(t, key, v)?;
                    }
                    OpCode::GetTable => {
                        let t = reg!(i.b());
                        let key = rk!(i.c());
                        save_pc!();
                        let v = self.index_get(t, key)?;
                        reg!(i.a()) = v;
                    }
                    OpCode::SetTable => {
                        let t = reg!(i.a());
                        let key = rk!(i.b());
                        let v = rk!(i.c());
                        save_pc!();
                        self.index_set(t, key, v)?;
                    }
                    OpCode::NewTable => {
                        save_pc!();
                        if self.heap.wants_step() {
                            self.heap.step();
                        }
                        let t = crate::table::Table::with_capacity(
                            i.b() as usize,
                            i.c() as usize,
                        );
                        let v = match self.heap.new_table(t) {
                            Ok(r) => Value::Table(r),
                            Err(_) => {
                                return Err(Signal::error(
                                    crate::error::Status::MemoryError,
                                    self.oom_message,
                                ));
                            }
                        };
                        reg!(i.a()) = v;
                    }
                    OpCode::SelfCall => {
                        let obj = reg!(i.b());
                        reg!(i.a() + 1) = obj;
                        let key = rk!(i.c());
                        save_pc!();
                        let v = self.index_get(obj, key)?;
                        reg!(i.a()) = v;
                    }
                    OpCode::Add => arith_inst!(Add, i),
                    OpCode::Sub => arith_inst!(Sub, i),
                    OpCode::Mul => arith_inst!(Mul, i),
                    OpCode::Div => arith_inst!(Div, i),
                    OpCode::Mod => arith_inst!(Mod, i),
                    OpCode::Pow => arith_inst!(Pow, i),
                    OpCode::Unm => {
                        let v = reg!(i.b());
                        if let Value::Number(x) = v {
                            reg!(i.a()) = Value::Number(-x);
                        } else {
                            save_pc!();
                            let r = self.arith(ArithOp::Unm, v, v)?;
                            reg!(i.a()) = r;
                        }
                    }
                    OpCode::Not => {
                        let v = reg!(i.b());
                        reg!(i.a()) = Value::Boolean(!v.is_truthy());
                    }
                    OpCode::Len => {
                        let v = reg!(i.b());
                        save_pc!();
                        let r = self.length_of(v)?;
                        reg!(i.a()) = r;
                    }
                    OpCode::Concat => {
                        let b = i.b() as usize;
                        let c = i.c() as usize;
                        save_pc!();
                        self.exec.top = base + c + 1;
                        self.concat_range(c - b + 1)?;
                        let v = self.exec.stack[base + b];
                        reg!(i.a()) = v;
                        self.exec.top = self.exec.frames[frame_idx].top;
                        if self.heap.wants_step() {
                            self.heap.step();
                        }
                    }
                    OpCode::Jmp => {
                        if i.a() != 0 {
                            self.close_upvalues(base + i.a() as usize - 1);
                        }
                        pc = (pc as i64 + i.sbx() as i64) as usize;
                    }
                    OpCode::Eq => {
                        let vb = rk!(i.b());
                        let vc = rk!(i.c());
                        save_pc!();
                        let eq = self.values_equal(vb, vc)?;
                        if eq != (i.a() != 0) {
                            pc += 1;
                        } else {
                            do_next_jump!();
                        }
                    }
                    OpCode::Lt => {
                        let vb = rk!(i.b());
                        let vc = rk!(i.c());
                        save_pc!();
                        let lt = self.less_than(vb, vc)?;
                        if lt != (i.a() != 0) {
                            pc += 1;
                        } else {
                            do_next_jump!();
                        }
                    }
                    OpCode::Le => {
                        let vb = rk!(i.b());
                        let vc = rk!(i.c());
                        save_pc!();
                        let le = self.less_equal(vb, vc)?;
                        if le != (i.a() != 0) {
                            pc += 1;
                        } else {
                            do_next_jump!();
                        }
                    }
                    OpCode::Test => {
                        if reg!(i.a()).is_truthy() != (i.c() != 0) {
                            pc += 1;
                        } else {
                            do_next_jump!();
                        }
                    }
                    OpCode::TestSet => {
                        let vb = reg!(i.b());
                        if vb.is_truthy() != (i.c() != 0) {
                            pc += 1;
                        } else {
                            reg!(i.a()) = vb;
                            do_next_jump!();
                        }
                    }
                    OpCode::Call => {
                        let func = base + i.a() as usize;
                        if i.b() != 0 {
                            self.exec.top = func + i.b() as usize;
                        }
                        let nresults = i.c() as i32 - 1;
                        save_pc!();
                        if self.precall(func, nresults)? {
                            // Native completed in place.
                            if nresults != MULTRET {
                                self.exec.top = self.exec.frames[frame_idx].top;
                            }
                        } else {
                            let callee = self
                                .exec
                                .frames
                                .last_mut()
                                .expect("callee frame just pushed");
                            callee.flags |= crate::frame::FLAG_REENTRY;
                            continue 'reentry;
                        }
                    }
                    OpCode::TailCall => {
                        let func = base + i.a() as usize;
                        if i.b() != 0 {
                            self.exec.top = func + i.b() as usize;
                        }
                        save_pc!();
                        if matches!(self.exec.stack[func], Value::Closure(_)) {
                            // Reuse this frame: close anything open on our
                            // window, then slide the callee down over it.
                            self.close_upvalues(base);
                            let pushed = self.precall(func, MULTRET)?;
                            debug_assert!(!pushed);
                            let callee = self.exec.frames.pop().expect("tail callee frame");
                            let nparams = {
                                let cl = match self.exec.stack[callee.func] {
                                    Value::Closure(c) => c,
                                    _ => unreachable!("tail callee is a closure"),
                                };
                                self.heap.proto(self.heap.closure(cl).proto).desc.params
                                    as usize
                            };
                            let ofunc = self.exec.frames[frame_idx].func;
                            // Covers the callable, the relocated fixed
                            // parameters, and any vararg region in between.
                            let limit = callee.base + nparams;
                            let shift = callee.func - ofunc;
                            for idx in callee.func..limit {
                                self.exec.stack[idx - shift] = self.exec.stack[idx];
                            }
                            let caller = &mut self.exec.frames[frame_idx];
                            caller.base = callee.base - shift;
                            caller.top = caller.base
                                + (callee.top - callee.base);
                            caller.pc = 0;
                            caller.flags |= crate::frame::FLAG_TAILCALL;
                            let new_top = caller.top;
                            self.exec.top = new_top;
                            trace!(depth = self.exec.frames.len(), "tail call");
                            continue 'reentry;
                        } else {
                            // Native (or overload) callee: run it here; the
                            // following return instruction forwards the
                            // results. A call-overload that resolves to a
                            // bytecode callee nests a frame instead of
                            // merging.
                            if self.precall(func, MULTRET)? {
                                // results and top already placed
                            } else {
                                let callee = self
                                    .exec
                                    .frames
                                    .last_mut()
                                    .expect("callee frame just pushed");
                                callee.flags |= crate::frame::FLAG_REENTRY;
                                continue 'reentry;
                            }
                        }
                    }
                    OpCode::Return => {
                        let a = i.a() as usize;
                        if i.b() != 0 {
                            self.exec.top = base + a + i.b() as usize - 1;
                        }
                        if !self.exec.open_upvalues.is_empty() {
                            self.close_upvalues(base);
                        }
                        save_pc!();
                        let returning = self.exec.frames[frame_idx];
                        self.poscall(base + a)?;
                        if returning.flags & crate::frame::FLAG_REENTRY == 0 {
                            // This frame was entered from outside the loop;
                            // its results stay on top for that caller.
                            return Ok(());
                        }
                        if returning.nresults != MULTRET {
                            self.exec.top = self
                                .exec
                                .frames
                                .last()
                                .expect("caller frame")
                                .top;
                        }
                        continue 'reentry;
                    }
                    OpCode::ForPrep => {
                        save_pc!();
                        let init = self.for_number(reg!(i.a()), "initial")?;
                        let limit = self.for_number(reg!(i.a() + 1), "limit")?;
                        let step = self.for_number(reg!(i.a() + 2), "step")?;
                        reg!(i.a()) = Value::Number(init - step);
                        reg!(i.a() + 1) = Value::Number(limit);
                        reg!(i.a() + 2) = Value::Number(step);
                        pc = (pc as i64 + i.sbx() as i64) as usize;
                    }
                    OpCode::ForLoop => {
                        let (idx, limit, step) =
                            match (reg!(i.a()), reg!(i.a() + 1), reg!(i.a() + 2)) {
                                (
                                    Value::Number(x),
                                    Value::Number(l),
                                    Value::Number(s),
                                ) => (x, l, s),
                                _ => {
                                    save_pc!();
                                    return Err(
                                        self.rt_error("'for' loop state corrupted")
                                    );
                                }
                            };
                        let next = idx + step;
                        let continues = if step > 0.0 { next <= limit } else { limit <= next };
                        if continues {
                            pc = (pc as i64 + i.sbx() as i64) as usize;
                            reg!(i.a()) = Value::Number(next);
                            reg!(i.a() + 3) = Value::Number(next);
                        }
                    }
                    OpCode::TForCall => {
                        let a = i.a() as usize;
                        let cb = base + a + 3;
                        self.exec.stack[cb + 2] = self.exec.stack[base + a + 2];
                        self.exec.stack[cb + 1] = self.exec.stack[base + a + 1];
                        self.exec.stack[cb] = self.exec.stack[base + a];
                        self.exec.top = cb + 3;
                        save_pc!();
                        self.call_value(cb, i.c() as i32, false)?;
                        self.exec.top = self.exec.frames[frame_idx].top;
                    }
                    OpCode::TForLoop => {
                        let v = reg!(i.a() + 1);
                        if !v.is_nil() {
                            reg!(i.a()) = v;
                            pc = (pc as i64 + i.sbx() as i64) as usize;
                        }
                    }
                    OpCode::SetList => {
                        let a = i.a() as usize;
                        let mut n = i.b() as usize;
                        let mut block = i.c() as u32;
                        if n == 0 {
                            n = self.exec.top - (base + a) - 1;
                        }
                        if block == 0 {
                            block = self.heap.proto(proto_id).desc.code[pc].ax_arg().max(1);
                            pc += 1;
                        }
                        let table = match reg!(a as u32) {
                            Value::Table(t) => t,
                            other => {
                                save_pc!();
                                return Err(self.type_error("set list items on", other));
                            }
                        };
                        save_pc!();
                        let last = (block - 1) as usize * FIELDS_PER_FLUSH as usize + n;
                        for j in 1..=n {
                            let v = self.exec.stack[base + a + j];
                            self.raw_set(
                                table,
                                Value::Number((last - n + j) as f64),
                                v,
                            )?;
                        }
                        self.exec.top = self.exec.frames[frame_idx].top;
                    }
                    OpCode::Closure => {
                        save_pc!();
                        let sub = self.heap.proto(proto_id).subprotos[i.bx() as usize];
                        let v = self.instantiate_closure(sub, closure_ref, base)?;
                        reg!(i.a()) = v;
                        if self.heap.wants_step() {
                            self.heap.step();
                        }
                    }
                    OpCode::Vararg => {
                        let frame = self.exec.frames[frame_idx];
                        let params =
                            self.heap.proto(proto_id).desc.params as usize;
                        let nvar = base - frame.func - 1 - params;
                        let a = i.a() as usize;
                        if i.b() != 0 {
                            let want = i.b() as usize - 1;
                            for j in 0..want {
                                self.exec.stack[base + a + j] = if j < nvar {
                                    self.exec.stack[base - nvar + j]
                                } else {
                                    Value::Nil
                                };
                            }
                        } else {
                            save_pc!();
                            self.ensure_stack(nvar)?;
                            for j in 0..nvar {
                                self.exec.stack[base + a + j] =
                                    self.exec.stack[base - nvar + j];
                            }
                            self.exec.top = base + a + nvar;
                        }
                    }
                    OpCode::ExtraArg => {
                        save_pc!();
                        return Err(self.rt_error("malformed instruction"));
                    }
                }
            }
        }
    }

    fn for_number(&mut self, v: Value, what: &str) -> Result<f64, Signal> {
        match self.coerce_number(v) {
            Some(n) => Ok(n),
            None => Err(self.rt_error(&format!("'for' {what} value must be a number"))),
        }
    }

    /// Build (or reuse) a closure over `sub`, resolving each upvalue to an
    /// open cell on this frame or to one captured by the enclosing closure.
    fn instantiate_closure(
        &mut self,
        sub: crate::heap::ProtoId,
        enclosing: rill_core::ClosureRef,
        base: usize,
    ) -> Result<Value, Signal> {
        // Cache probe: reuse the last closure when it would capture the
        // exact same cells.
        if let Some(cached) = self.heap.proto(sub).cache {
            if self.cache_matches(sub, cached, enclosing, base) {
                trace!(proto = sub.0, "closure cache hit");
                return Ok(Value::Closure(cached));
            }
        }

        let ndesc = self.heap.proto(sub).desc.upvalues.len();
        let mut cells = Vec::with_capacity(ndesc);
        for u in 0..ndesc {
            let desc = self.heap.proto(sub).desc.upvalues[u].clone();
            let cell = if desc.in_stack {
                self.find_upvalue(base + desc.index as usize)?
            } else {
                self.heap.closure(enclosing).upvalues[desc.index as usize]
            };
            cells.push(cell);
        }
        let r = match self.heap.new_closure(Closure {
            proto: sub,
            upvalues: cells,
        }) {
            Ok(r) => r,
            Err(_) => {
                return Err(Signal::error(
                    crate::error::Status::MemoryError,
                    self.oom_message,
                ));
            }
        };
        self.heap.proto_mut(sub).cache = Some(r);
        Ok(Value::Closure(r))
    }

    fn cache_matches(
        &self,
        sub: crate::heap::ProtoId,
        cached: rill_core::ClosureRef,
        enclosing: rill_core::ClosureRef,
        base: usize,
    ) -> bool {
        let descs = &self.heap.proto(sub).desc.upvalues;
        let cached_cells = &self.heap.closure(cached).upvalues;
        if cached_cells.len() != descs.len() {
            return false;
        }
        for (desc, &cell) in descs.iter().zip(cached_cells) {
            let matches = if desc.in_stack {
                matches!(
                    self.heap.upvalue(cell),
                    Upvalue::Open { task, index }
                        if task == self.current && index == base + desc.index as usize
                )
            } else {
                self.heap.closure(enclosing).upvalues[desc.index as usize] == cell
            };
            if !matches {
                return false;
            }
        }
        true
    }
}
