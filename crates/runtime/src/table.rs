//! Tables: the language's only structured data type
//!
//! Hybrid layout: a dense array part for keys `1..=n` and a hash part for
//! everything else. Integral float keys normalize into the array part when
//! they fit, so `t[2]` and `t[2.0]` are the same slot. The "length" of a
//! table is a border: an `n` with `t[n]` non-nil and `t[n+1]` nil.
//!
//! Keys may be any value except nil and NaN. Storing nil erases.

use rill_core::{TableRef, Value};
use std::collections::HashMap;

/// Hashable normalization of a key value.
///
/// Floats are keyed by their bits with `-0.0` folded into `0.0`; NaN is
/// rejected before this type is built. Heap keys hash by handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKey {
    Number(u64),
    Boolean(bool),
    Str(rill_core::StrRef),
    Table(rill_core::TableRef),
    Closure(rill_core::ClosureRef),
    Native(rill_core::NativeRef),
    Userdata(rill_core::UserdataRef),
    Task(rill_core::TaskRef),
    Light(usize),
}

/// Why a value cannot be used as a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadKey {
    Nil,
    NaN,
}

impl TableKey {
    pub fn from_value(v: Value) -> Result<TableKey, BadKey> {
        match v {
            Value::Nil => Err(BadKey::Nil),
            Value::Number(n) if n.is_nan() => Err(BadKey::NaN),
            Value::Number(n) => {
                let n = if n == 0.0 { 0.0 } else { n };
                Ok(TableKey::Number(n.to_bits()))
            }
            Value::Boolean(b) => Ok(TableKey::Boolean(b)),
            Value::Str(s) => Ok(TableKey::Str(s)),
            Value::Table(t) => Ok(TableKey::Table(t)),
            Value::Closure(c) => Ok(TableKey::Closure(c)),
            Value::Native(n) => Ok(TableKey::Native(n)),
            Value::Userdata(u) => Ok(TableKey::Userdata(u)),
            Value::Task(t) => Ok(TableKey::Task(t)),
            Value::Light(p) => Ok(TableKey::Light(p)),
        }
    }
}

#[derive(Debug, Default)]
pub struct Table {
    array: Vec<Value>,
    hash: HashMap<TableKey, Value>,
    pub metatable: Option<TableRef>,
}

/// An integer index into the array part, if `v` is an integral number in
/// `1..=bound`.
#[inline]
fn array_index(v: Value, bound: usize) -> Option<usize> {
    match v {
        Value::Number(n) if n.fract() == 0.0 && n >= 1.0 && n <= bound as f64 => {
            Some(n as usize)
        }
        _ => None,
    }
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn with_capacity(narray: usize, nhash: usize) -> Table {
        Table {
            array: Vec::with_capacity(narray),
            hash: HashMap::with_capacity(nhash),
            metatable: None,
        }
    }

    /// Raw read, no overload involvement. Absent keys read as nil.
    pub fn get(&self, key: Value) -> Value {
        if let Some(i) = array_index(key, self.array.len()) {
            return self.array[i - 1];
        }
        match TableKey::from_value(key) {
            Ok(k) => self.hash.get(&k).copied().unwrap_or(Value::Nil),
            Err(_) => Value::Nil,
        }
    }

    /// Raw write, no overload involvement. Storing nil erases.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), BadKey> {
        // Append to the array part when the key is exactly the next slot;
        // pull any successors out of the hash so the border stays tight.
        if let Some(i) = array_index(key, self.array.len() + 1) {
            if i == self.array.len() + 1 {
                if value.is_nil() {
                    return Ok(()); // erasing an absent tail key
                }
                self.array.push(value);
                let mut next = self.array.len() + 1;
                while let Some(v) = self.hash.remove(&TableKey::Number((next as f64).to_bits()))
                {
                    self.array.push(v);
                    next += 1;
                }
                return Ok(());
            }
            if value.is_nil() && i == self.array.len() {
                // Erasing the last array slot shortens the border.
                self.array.pop();
                while matches!(self.array.last(), Some(Value::Nil)) {
                    self.array.pop();
                }
                return Ok(());
            }
            self.array[i - 1] = value;
            return Ok(());
        }
        let k = TableKey::from_value(key)?;
        if value.is_nil() {
            self.hash.remove(&k);
        } else {
            self.hash.insert(k, value);
        }
        Ok(())
    }

    /// A border of the table, per the length operator.
    pub fn length(&self) -> usize {
        let n = self.array.len();
        if n > 0 || self.hash.is_empty() {
            return n;
        }
        // Array part empty but the hash may hold 1, 2, ... from sparse writes.
        let mut i = 0usize;
        while !self
            .get(Value::Number((i + 1) as f64))
            .is_nil()
        {
            i += 1;
        }
        i
    }

    /// Entries in both parts; used for memory accounting, not semantics.
    pub fn entry_count(&self) -> usize {
        self.array.len() + self.hash.len()
    }
}
