//! The object heap: shared runtime state behind the collector contract
//!
//! One slab per object kind, addressed by the typed handles from
//! `rill-core`. The execution engine consumes three narrow entry points
//! (allocation, the reference-store barrier, and step requests) so the
//! collector's tracing algorithm stays replaceable without touching the
//! engine. What lives here today is the bookkeeping half of that contract:
//! a byte ledger with an optional budget (exceeding it requests a full
//! collection and retries once before reporting out-of-memory), barrier and
//! step counters, and the string interner.

use crate::frame::NativeFn;
use crate::state::Task;
use crate::table::Table;
use rill_core::chunk::Proto;
use rill_core::{ClosureRef, NativeRef, StrRef, TableRef, TaskRef, UserdataRef, Value};
use std::any::Any;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Handle to a loaded prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoId(pub u32);

/// Handle to an upvalue cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalRef(pub u32);

/// A captured variable: open while its owning activation is live (the cell
/// names a stack slot), closed afterward (the value moved into the cell).
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    Open { task: TaskRef, index: usize },
    Closed(Value),
}

/// A bytecode closure: prototype plus captured upvalue cells.
#[derive(Debug)]
pub struct Closure {
    pub proto: ProtoId,
    pub upvalues: Vec<UpvalRef>,
}

/// A native-function closure.
pub struct NativeClosure {
    pub func: NativeFn,
    pub upvalues: Vec<Value>,
    /// Diagnostic name shown in error messages and tracebacks.
    pub name: Box<str>,
}

impl std::fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeClosure({})", self.name)
    }
}

/// Full userdata: a host object owned by the heap, with an optional
/// metatable.
pub struct Userdata {
    pub data: Box<dyn Any>,
    pub metatable: Option<TableRef>,
}

/// A prototype registered with the runtime: the immutable description plus
/// the interned constant pool, resolved nested-prototype handles, and the
/// single-entry closure cache.
#[derive(Debug)]
pub struct LoadedProto {
    pub desc: Proto,
    /// Constant pool with strings interned; indexes match `desc.constants`.
    pub constants: Vec<Value>,
    /// Nested prototypes, resolved to heap handles; indexes match
    /// `desc.protos`.
    pub subprotos: Vec<ProtoId>,
    /// Last closure built from this prototype, reused when an identical
    /// capture set comes around again.
    pub cache: Option<ClosureRef>,
}

/// Allocation failed even after a full collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// Rough per-object ledger charges, in bytes. The ledger drives the budget
/// contract, not an exact accounting.
const CHARGE_TABLE: usize = 64;
const CHARGE_CLOSURE: usize = 48;
const CHARGE_UPVALUE: usize = 24;
const CHARGE_TASK: usize = 256;

pub struct Heap {
    strings: Vec<Box<str>>,
    interner: HashMap<Box<str>, StrRef>,
    tables: Vec<Table>,
    closures: Vec<Closure>,
    natives: Vec<NativeClosure>,
    userdata: Vec<Userdata>,
    tasks: Vec<Task>,
    upvalues: Vec<Upvalue>,
    protos: Vec<LoadedProto>,

    bytes: usize,
    budget: Option<usize>,

    // Collector-contract bookkeeping
    barrier_notifications: u64,
    step_debt: u32,
    step_period: u32,
    steps_taken: u64,
    full_collections: u64,
}

impl Heap {
    pub fn new(budget: Option<usize>, step_period: u32) -> Heap {
        Heap {
            strings: Vec::new(),
            interner: HashMap::new(),
            tables: Vec::new(),
            closures: Vec::new(),
            natives: Vec::new(),
            userdata: Vec::new(),
            tasks: Vec::new(),
            upvalues: Vec::new(),
            protos: Vec::new(),
            bytes: 0,
            budget,
            barrier_notifications: 0,
            step_debt: 0,
            step_period,
            steps_taken: 0,
            full_collections: 0,
        }
    }

    /// Charge the ledger. Over budget: request a full collection, then
    /// retry once before giving up.
    fn charge(&mut self, bytes: usize) -> Result<(), OutOfMemory> {
        if let Some(budget) = self.budget {
            if self.bytes + bytes > budget {
                self.full_collection();
                if self.bytes + bytes > budget {
                    debug!(requested = bytes, held = self.bytes, budget, "allocation over budget");
                    return Err(OutOfMemory);
                }
            }
        }
        self.bytes += bytes;
        self.step_debt = self.step_debt.saturating_add(1);
        Ok(())
    }

    /// Request a full collection cycle. Tracing/sweeping is the collector's
    /// business; the engine only observes the request.
    pub fn full_collection(&mut self) {
        self.full_collections += 1;
        debug!(n = self.full_collections, bytes = self.bytes, "full collection requested");
    }

    /// Has the allocation debt crossed the step period? Native calls check
    /// this; they are the engine's collection safe points.
    #[inline]
    pub fn wants_step(&self) -> bool {
        self.step_period != 0 && self.step_debt >= self.step_period
    }

    /// Run one collection step's worth of bookkeeping and reset the debt.
    pub fn step(&mut self) {
        self.steps_taken += 1;
        self.step_debt = 0;
        trace!(n = self.steps_taken, "collector step");
    }

    /// Barrier notification: a reference to `child` is being stored into an
    /// object the collector may already have scanned.
    #[inline]
    pub fn on_reference_store(&mut self, child: Value) {
        match child {
            Value::Nil | Value::Boolean(_) | Value::Number(_) | Value::Light(_) => {}
            _ => self.barrier_notifications += 1,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes
    }

    pub fn barrier_notifications(&self) -> u64 {
        self.barrier_notifications
    }

    pub fn full_collections(&self) -> u64 {
        self.full_collections
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps_taken
    }

    // ---- strings ----

    /// Intern a string, returning the canonical handle for its content.
    pub fn intern(&mut self, s: &str) -> Result<StrRef, OutOfMemory> {
        if let Some(&r) = self.interner.get(s) {
            return Ok(r);
        }
        self.charge(s.len() + 24)?;
        let r = StrRef(self.strings.len() as u32);
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.interner.insert(boxed, r);
        Ok(r)
    }

    #[inline]
    pub fn str_content(&self, r: StrRef) -> &str {
        &self.strings[r.0 as usize]
    }

    // ---- tables ----

    pub fn new_table(&mut self, t: Table) -> Result<TableRef, OutOfMemory> {
        self.charge(CHARGE_TABLE + 16 * t.entry_count())?;
        let r = TableRef(self.tables.len() as u32);
        self.tables.push(t);
        Ok(r)
    }

    #[inline]
    pub fn table(&self, r: TableRef) -> &Table {
        &self.tables[r.0 as usize]
    }

    #[inline]
    pub fn table_mut(&mut self, r: TableRef) -> &mut Table {
        &mut self.tables[r.0 as usize]
    }

    // ---- closures ----

    pub fn new_closure(&mut self, c: Closure) -> Result<ClosureRef, OutOfMemory> {
        self.charge(CHARGE_CLOSURE + 8 * c.upvalues.len())?;
        let r = ClosureRef(self.closures.len() as u32);
        self.closures.push(c);
        Ok(r)
    }

    #[inline]
    pub fn closure(&self, r: ClosureRef) -> &Closure {
        &self.closures[r.0 as usize]
    }

    pub fn new_native(&mut self, n: NativeClosure) -> Result<NativeRef, OutOfMemory> {
        self.charge(CHARGE_CLOSURE)?;
        let r = NativeRef(self.natives.len() as u32);
        self.natives.push(n);
        Ok(r)
    }

    #[inline]
    pub fn native(&self, r: NativeRef) -> &NativeClosure {
        &self.natives[r.0 as usize]
    }

    // ---- userdata ----

    pub fn new_userdata(&mut self, u: Userdata) -> Result<UserdataRef, OutOfMemory> {
        self.charge(CHARGE_TABLE)?;
        let r = UserdataRef(self.userdata.len() as u32);
        self.userdata.push(u);
        Ok(r)
    }

    #[inline]
    pub fn userdata(&self, r: UserdataRef) -> &Userdata {
        &self.userdata[r.0 as usize]
    }

    #[inline]
    pub fn userdata_mut(&mut self, r: UserdataRef) -> &mut Userdata {
        &mut self.userdata[r.0 as usize]
    }

    // ---- tasks ----

    pub fn new_task(&mut self, t: Task) -> Result<TaskRef, OutOfMemory> {
        self.charge(CHARGE_TASK)?;
        let r = TaskRef(self.tasks.len() as u32);
        self.tasks.push(t);
        Ok(r)
    }

    #[inline]
    pub fn task(&self, r: TaskRef) -> &Task {
        &self.tasks[r.0 as usize]
    }

    #[inline]
    pub fn task_mut(&mut self, r: TaskRef) -> &mut Task {
        &mut self.tasks[r.0 as usize]
    }

    // ---- upvalues ----

    pub fn new_upvalue(&mut self, u: Upvalue) -> Result<UpvalRef, OutOfMemory> {
        self.charge(CHARGE_UPVALUE)?;
        let r = UpvalRef(self.upvalues.len() as u32);
        self.upvalues.push(u);
        Ok(r)
    }

    #[inline]
    pub fn upvalue(&self, r: UpvalRef) -> Upvalue {
        self.upvalues[r.0 as usize]
    }

    #[inline]
    pub fn upvalue_mut(&mut self, r: UpvalRef) -> &mut Upvalue {
        &mut self.upvalues[r.0 as usize]
    }

    // ---- prototypes ----

    pub fn add_proto(&mut self, p: LoadedProto) -> ProtoId {
        let r = ProtoId(self.protos.len() as u32);
        self.protos.push(p);
        r
    }

    pub fn proto_count(&self) -> usize {
        self.protos.len()
    }

    #[inline]
    pub fn proto(&self, r: ProtoId) -> &LoadedProto {
        &self.protos[r.0 as usize]
    }

    #[inline]
    pub fn proto_mut(&mut self, r: ProtoId) -> &mut LoadedProto {
        &mut self.protos[r.0 as usize]
    }
}
