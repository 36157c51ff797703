//! Type-level overloads ("metamethods")
//!
//! Every fallible primitive operation (arithmetic, comparison, length,
//! concatenation, indexing, calling) tries the primitive form first and
//! only then consults the operand's overload table (or the second operand's
//! when the first has none). The fallback may call arbitrary script code,
//! so everything here re-enters the call machinery; those nested calls run
//! under the non-yieldable counter.

use crate::error::Signal;
use crate::heap::{Heap, OutOfMemory};
use crate::state::{str_to_number, Vm};
use rill_core::limits::MAX_INDEX_CHAIN;
use rill_core::{StrRef, Value};

/// Overload events, in table-key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metamethod {
    Index,
    NewIndex,
    Call,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Eq,
    Lt,
    Le,
    Concat,
}

pub const META_COUNT: usize = 15;

const META_NAMES: [&str; META_COUNT] = [
    "__index", "__newindex", "__call", "__add", "__sub", "__mul", "__div", "__mod", "__pow",
    "__unm", "__len", "__eq", "__lt", "__le", "__concat",
];

/// The overload-name strings, interned once at bootstrap so lookups never
/// allocate.
pub struct MetaNames([StrRef; META_COUNT]);

impl MetaNames {
    pub fn intern(heap: &mut Heap) -> Result<MetaNames, OutOfMemory> {
        let mut names = [StrRef(0); META_COUNT];
        for (slot, name) in names.iter_mut().zip(META_NAMES) {
            *slot = heap.intern(name)?;
        }
        Ok(MetaNames(names))
    }

    #[inline]
    pub fn get(&self, mm: Metamethod) -> StrRef {
        self.0[mm as usize]
    }
}

/// Binary arithmetic selector for the shared fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
}

impl ArithOp {
    fn metamethod(self) -> Metamethod {
        match self {
            ArithOp::Add => Metamethod::Add,
            ArithOp::Sub => Metamethod::Sub,
            ArithOp::Mul => Metamethod::Mul,
            ArithOp::Div => Metamethod::Div,
            ArithOp::Mod => Metamethod::Mod,
            ArithOp::Pow => Metamethod::Pow,
            ArithOp::Unm => Metamethod::Unm,
        }
    }

    pub(crate) fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            // Floored modulo, sign follows the divisor.
            ArithOp::Mod => x - (x / y).floor() * y,
            ArithOp::Pow => x.powf(y),
            ArithOp::Unm => -x,
        }
    }
}

impl Vm {
    /// The overload bound to `v` for `mm`, or nil.
    pub(crate) fn metamethod_of(&self, v: Value, mm: Metamethod) -> Value {
        match self.value_metatable(v) {
            Some(mt) => self
                .heap
                .table(mt)
                .get(Value::Str(self.meta_names.get(mm))),
            None => Value::Nil,
        }
    }

    /// Numeric view of a value, with the string coercion the arithmetic
    /// path allows.
    pub(crate) fn coerce_number(&self, v: Value) -> Option<f64> {
        match v {
            Value::Number(n) => Some(n),
            Value::Str(s) => str_to_number(self.str_of(s)),
            _ => None,
        }
    }

    /// Call a two-operand overload and hand back its single result.
    pub(crate) fn call_meta_binary(
        &mut self,
        handler: Value,
        a: Value,
        b: Value,
    ) -> Result<Value, Signal> {
        self.ensure_stack(3)?;
        let func = self.exec.top;
        self.exec.stack[func] = handler;
        self.exec.stack[func + 1] = a;
        self.exec.stack[func + 2] = b;
        self.exec.top = func + 3;
        self.call_value(func, 1, false)?;
        let result = self.exec.stack[func];
        self.truncate_top(func);
        Ok(result)
    }

    /// Arithmetic slow path: string coercion, then the overload of the
    /// first operand that has one.
    pub(crate) fn arith(&mut self, op: ArithOp, a: Value, b: Value) -> Result<Value, Signal> {
        if let (Some(x), Some(y)) = (self.coerce_number(a), self.coerce_number(b)) {
            return Ok(Value::Number(op.apply(x, y)));
        }
        let mm = op.metamethod();
        let mut handler = self.metamethod_of(a, mm);
        if handler.is_nil() {
            handler = self.metamethod_of(b, mm);
        }
        if handler.is_nil() {
            // Blame the operand that is not a number.
            let culprit = if self.coerce_number(a).is_none() { a } else { b };
            return Err(self.type_error("perform arithmetic on", culprit));
        }
        self.call_meta_binary(handler, a, b)
    }

    /// The length operator: raw for strings, overload-then-raw for tables,
    /// overload-or-error for everything else.
    pub(crate) fn length_of(&mut self, v: Value) -> Result<Value, Signal> {
        if let Value::Str(s) = v {
            return Ok(Value::Number(self.str_of(s).len() as f64));
        }
        let handler = self.metamethod_of(v, Metamethod::Len);
        if !handler.is_nil() {
            return self.call_meta_binary(handler, v, v);
        }
        match v {
            Value::Table(t) => Ok(Value::Number(self.heap.table(t).length() as f64)),
            other => Err(self.type_error("get length of", other)),
        }
    }

    /// Script-visible equality. The overload is consulted only when both
    /// operands are tables or both are userdata, they are not primitively
    /// equal, and they agree on the handler.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> Result<bool, Signal> {
        if a == b {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
        );
        if !comparable {
            return Ok(false);
        }
        let h1 = self.metamethod_of(a, Metamethod::Eq);
        if h1.is_nil() || h1 != self.metamethod_of(b, Metamethod::Eq) {
            return Ok(false);
        }
        let r = self.call_meta_binary(h1, a, b)?;
        Ok(r.is_truthy())
    }

    pub(crate) fn less_than(&mut self, a: Value, b: Value) -> Result<bool, Signal> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x < y),
            (Value::Str(x), Value::Str(y)) => Ok(self.str_of(x) < self.str_of(y)),
            _ => {
                let mut handler = self.metamethod_of(a, Metamethod::Lt);
                if handler.is_nil() {
                    handler = self.metamethod_of(b, Metamethod::Lt);
                }
                if handler.is_nil() {
                    return Err(self.order_error(a, b));
                }
                let r = self.call_meta_binary(handler, a, b)?;
                Ok(r.is_truthy())
            }
        }
    }

    pub(crate) fn less_equal(&mut self, a: Value, b: Value) -> Result<bool, Signal> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x <= y),
            (Value::Str(x), Value::Str(y)) => Ok(self.str_of(x) <= self.str_of(y)),
            _ => {
                let mut handler = self.metamethod_of(a, Metamethod::Le);
                if handler.is_nil() {
                    handler = self.metamethod_of(b, Metamethod::Le);
                }
                if !handler.is_nil() {
                    let r = self.call_meta_binary(handler, a, b)?;
                    return Ok(r.is_truthy());
                }
                // No less-equal overload: fall back to not (b < a).
                let mut lt = self.metamethod_of(b, Metamethod::Lt);
                if lt.is_nil() {
                    lt = self.metamethod_of(a, Metamethod::Lt);
                }
                if lt.is_nil() {
                    return Err(self.order_error(a, b));
                }
                let r = self.call_meta_binary(lt, b, a)?;
                Ok(!r.is_truthy())
            }
        }
    }

    /// Indexed read with the overload chain: raw hit wins, a function
    /// overload is called, a table overload redirects the lookup.
    pub(crate) fn index_get(&mut self, mut t: Value, key: Value) -> Result<Value, Signal> {
        for _ in 0..MAX_INDEX_CHAIN {
            let handler = if let Value::Table(tr) = t {
                let raw = self.heap.table(tr).get(key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let h = self.metamethod_of(t, Metamethod::Index);
                if h.is_nil() {
                    return Ok(Value::Nil);
                }
                h
            } else {
                let h = self.metamethod_of(t, Metamethod::Index);
                if h.is_nil() {
                    return Err(self.type_error("index", t));
                }
                h
            };
            if matches!(handler, Value::Closure(_) | Value::Native(_)) {
                return self.call_meta_binary(handler, t, key);
            }
            t = handler;
        }
        Err(self.rt_error("'__index' chain too long; possible loop"))
    }

    /// Indexed write with the overload chain, mirroring [`index_get`].
    ///
    /// [`index_get`]: Vm::index_get
    pub(crate) fn index_set(
        &mut self,
        mut t: Value,
        key: Value,
        value: Value,
    ) -> Result<(), Signal> {
        for _ in 0..MAX_INDEX_CHAIN {
            let handler = if let Value::Table(tr) = t {
                let has_raw = !self.heap.table(tr).get(key).is_nil();
                if has_raw {
                    return self.raw_set(tr, key, value);
                }
                let h = self.metamethod_of(t, Metamethod::NewIndex);
                if h.is_nil() {
                    return self.raw_set(tr, key, value);
                }
                h
            } else {
                let h = self.metamethod_of(t, Metamethod::NewIndex);
                if h.is_nil() {
                    return Err(self.type_error("index", t));
                }
                h
            };
            if matches!(handler, Value::Closure(_) | Value::Native(_)) {
                self.ensure_stack(4)?;
                let func = self.exec.top;
                self.exec.stack[func] = handler;
                self.exec.stack[func + 1] = t;
                self.exec.stack[func + 2] = key;
                self.exec.stack[func + 3] = value;
                self.exec.top = func + 4;
                self.call_value(func, 0, false)?;
                self.truncate_top(func);
                return Ok(());
            }
            t = handler;
        }
        Err(self.rt_error("'__newindex' chain too long; possible loop"))
    }

    /// Raw table write with key checking and the store barrier.
    pub(crate) fn raw_set(
        &mut self,
        t: rill_core::TableRef,
        key: Value,
        value: Value,
    ) -> Result<(), Signal> {
        self.heap.on_reference_store(key);
        self.heap.on_reference_store(value);
        match self.heap.table_mut(t).set(key, value) {
            Ok(()) => Ok(()),
            Err(crate::table::BadKey::Nil) => Err(self.rt_error("table index is nil")),
            Err(crate::table::BadKey::NaN) => Err(self.rt_error("table index is NaN")),
        }
    }

    /// Fold the stack range `[top - total, top)` into one value with
    /// concatenation, right to left, pairing primitives directly and
    /// deferring to the overload otherwise. Leaves the result where the
    /// range began.
    pub(crate) fn concat_range(&mut self, total: usize) -> Result<(), Signal> {
        debug_assert!(total >= 1);
        let mut remaining = total;
        while remaining > 1 {
            let top = self.exec.top;
            let a = self.exec.stack[top - 2];
            let b = self.exec.stack[top - 1];
            let joined = match (self.concat_text(a), self.concat_text(b)) {
                (Some(x), Some(y)) => {
                    let mut s = x;
                    s.push_str(&y);
                    self.new_string(&s)?
                }
                _ => {
                    let mut handler = self.metamethod_of(a, Metamethod::Concat);
                    if handler.is_nil() {
                        handler = self.metamethod_of(b, Metamethod::Concat);
                    }
                    if handler.is_nil() {
                        let culprit = if self.concat_text(a).is_none() { a } else { b };
                        return Err(self.type_error("concatenate", culprit));
                    }
                    self.call_meta_binary(handler, a, b)?
                }
            };
            self.exec.stack[top - 2] = joined;
            self.truncate_top(top - 1);
            remaining -= 1;
        }
        Ok(())
    }

    /// Text form a value contributes to concatenation, if it has one.
    fn concat_text(&self, v: Value) -> Option<String> {
        match v {
            Value::Str(s) => Some(self.str_of(s).to_string()),
            Value::Number(n) => Some(crate::state::fmt_number(n)),
            _ => None,
        }
    }
}
