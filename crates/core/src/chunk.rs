//! Chunk: the immutable bytecode bundle a compiler hands to the runtime
//!
//! A chunk is a flat list of prototypes plus the index of the entry
//! prototype. Each prototype bundles packed 32-bit instructions, a constant
//! pool, upvalue descriptors, parameter/vararg metadata, the register-window
//! size, and line debug info. The runtime validates a chunk once on load and
//! never mutates it.
//!
//! ## Instruction encoding
//!
//! ```text
//! 31        23        14    6     0
//! ┌─────────┬─────────┬─────┬─────┐
//! │    B    │    C    │  A  │ op  │   iABC
//! ├─────────┴─────────┼─────┼─────┤
//! │        Bx         │  A  │ op  │   iABx / iAsBx
//! ├───────────────────┴─────┼─────┤
//! │           Ax            │ op  │   iAx
//! └─────────────────────────┴─────┘
//! ```
//!
//! B and C are 9 bits wide; their top bit selects between a register and a
//! constant-pool slot, so the dispatch loop tells the two apart with a single
//! mask. sBx is Bx biased by half its range (signed jump offsets).

use crate::limits::MAX_UPVALUES;
use serde::{Deserialize, Serialize};
use std::fmt;

const SIZE_OP: u32 = 6;
const SIZE_A: u32 = 8;
const SIZE_C: u32 = 9;
const SIZE_B: u32 = 9;
const SIZE_BX: u32 = SIZE_C + SIZE_B;
const SIZE_AX: u32 = SIZE_A + SIZE_BX;

const POS_A: u32 = SIZE_OP;
const POS_C: u32 = POS_A + SIZE_A;
const POS_B: u32 = POS_C + SIZE_C;

pub const MAX_ARG_A: u32 = (1 << SIZE_A) - 1;
pub const MAX_ARG_B: u32 = (1 << SIZE_B) - 1;
pub const MAX_ARG_C: u32 = (1 << SIZE_C) - 1;
pub const MAX_ARG_BX: u32 = (1 << SIZE_BX) - 1;
pub const MAX_ARG_AX: u32 = (1 << SIZE_AX) - 1;

/// Bias applied to Bx to store signed jump offsets.
pub const SBX_BIAS: i32 = (MAX_ARG_BX >> 1) as i32;

/// Top bit of a B/C operand: set means "constant-pool slot", clear means
/// "register".
pub const CONST_BIT: u32 = 1 << (SIZE_B - 1);

/// Build a B/C operand that names constant-pool slot `i`.
#[inline]
pub const fn rk_const(i: u32) -> u32 {
    i | CONST_BIT
}

/// Operation codes for the register machine.
///
/// Comparison (`Eq`/`Lt`/`Le`) and test (`Test`/`TestSet`) instructions are
/// always followed by a `Jmp`; the dispatch convention is "skip that jump
/// when the tested condition does not match the instruction's A polarity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    /// A B | R(A) := R(B)
    Move,
    /// A Bx | R(A) := K(Bx)
    LoadK,
    /// A | R(A) := K(extra arg); pairs with a following `ExtraArg`
    LoadKx,
    /// A B C | R(A) := bool(B); if C, skip next instruction
    LoadBool,
    /// A B | R(A) ... R(A+B) := nil
    LoadNil,
    /// A B | R(A) := U(B)
    GetUpval,
    /// A B C | R(A) := U(B)[RK(C)]
    GetTabUp,
    /// A B C | R(A) := R(B)[RK(C)]
    GetTable,
    /// A B C | U(A)[RK(B)] := RK(C)
    SetTabUp,
    /// A B | U(B) := R(A)
    SetUpval,
    /// A B C | R(A)[RK(B)] := RK(C)
    SetTable,
    /// A B C | R(A) := new table (size hints B, C)
    NewTable,
    /// A B C | R(A+1) := R(B); R(A) := R(B)[RK(C)] (method-call staging)
    SelfCall,
    /// A B C | R(A) := RK(B) + RK(C)
    Add,
    /// A B C | R(A) := RK(B) - RK(C)
    Sub,
    /// A B C | R(A) := RK(B) * RK(C)
    Mul,
    /// A B C | R(A) := RK(B) / RK(C)
    Div,
    /// A B C | R(A) := RK(B) % RK(C)
    Mod,
    /// A B C | R(A) := RK(B) ^ RK(C)
    Pow,
    /// A B | R(A) := -R(B)
    Unm,
    /// A B | R(A) := not R(B)
    Not,
    /// A B | R(A) := length of R(B)
    Len,
    /// A B C | R(A) := R(B) .. ... .. R(C)
    Concat,
    /// A sBx | pc += sBx; if A, close upvalues >= R(A-1)
    Jmp,
    /// A B C | if (RK(B) == RK(C)) != A then pc++ (skipping the paired Jmp)
    Eq,
    /// A B C | if (RK(B) < RK(C)) != A then pc++
    Lt,
    /// A B C | if (RK(B) <= RK(C)) != A then pc++
    Le,
    /// A C | if truth(R(A)) != C then pc++
    Test,
    /// A B C | if truth(R(B)) == C then R(A) := R(B) else pc++
    TestSet,
    /// A B C | call R(A) with B-1 args, C-1 results (0 = to top / all)
    Call,
    /// A B C | tail-call R(A) with B-1 args, reusing the caller's frame
    TailCall,
    /// A B | return R(A) ... R(A+B-2) (B = 0: to top)
    Return,
    /// A sBx | numeric-for step: R(A) += R(A+2); loop back while in range
    ForLoop,
    /// A sBx | numeric-for prep: R(A) -= R(A+2); pc += sBx
    ForPrep,
    /// A C | generic-for: call iterator R(A) for C results at R(A+3)
    TForCall,
    /// A sBx | generic-for step: if R(A+1) != nil, R(A) := R(A+1), loop back
    TForLoop,
    /// A B C | store block C of B list elements from R(A+1..) into R(A)
    SetList,
    /// A Bx | R(A) := closure over prototype Bx of the current prototype
    Closure,
    /// A B | copy B-1 varargs to R(A)... (B = 0: all, adjust top)
    Vararg,
    /// Ax | extended operand for the preceding LoadKx / SetList
    ExtraArg,
}

/// Number of opcodes; raw bytes at or past this are malformed.
pub const OP_COUNT: u8 = OpCode::ExtraArg as u8 + 1;

impl OpCode {
    #[inline]
    pub fn from_u8(raw: u8) -> Option<OpCode> {
        if raw < OP_COUNT {
            // Contiguous discriminants 0..OP_COUNT make this transmute total.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(raw) })
        } else {
            None
        }
    }
}

/// One packed instruction.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction(pub u32);

impl Instruction {
    #[inline]
    pub const fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Instruction {
        Instruction((op as u32) | (a << POS_A) | (c << POS_C) | (b << POS_B))
    }

    #[inline]
    pub const fn abx(op: OpCode, a: u32, bx: u32) -> Instruction {
        Instruction((op as u32) | (a << POS_A) | (bx << POS_C))
    }

    #[inline]
    pub const fn asbx(op: OpCode, a: u32, sbx: i32) -> Instruction {
        Instruction::abx(op, a, (sbx + SBX_BIAS) as u32)
    }

    #[inline]
    pub const fn ax(op: OpCode, ax: u32) -> Instruction {
        Instruction((op as u32) | (ax << POS_A))
    }

    /// Raw opcode byte; may be out of range in a malformed chunk.
    #[inline]
    pub fn raw_opcode(self) -> u8 {
        (self.0 & ((1 << SIZE_OP) - 1)) as u8
    }

    #[inline]
    pub fn opcode(self) -> Option<OpCode> {
        OpCode::from_u8(self.raw_opcode())
    }

    #[inline]
    pub fn a(self) -> u32 {
        (self.0 >> POS_A) & MAX_ARG_A
    }

    #[inline]
    pub fn b(self) -> u32 {
        (self.0 >> POS_B) & MAX_ARG_B
    }

    #[inline]
    pub fn c(self) -> u32 {
        (self.0 >> POS_C) & MAX_ARG_C
    }

    #[inline]
    pub fn bx(self) -> u32 {
        (self.0 >> POS_C) & MAX_ARG_BX
    }

    #[inline]
    pub fn sbx(self) -> i32 {
        self.bx() as i32 - SBX_BIAS
    }

    #[inline]
    pub fn ax_arg(self) -> u32 {
        (self.0 >> POS_A) & MAX_ARG_AX
    }

    /// Does this B/C operand name a constant-pool slot?
    #[inline]
    pub fn is_const(arg: u32) -> bool {
        arg & CONST_BIT != 0
    }

    /// Constant-pool index of a B/C operand (caller checked [`is_const`]).
    ///
    /// [`is_const`]: Instruction::is_const
    #[inline]
    pub fn const_index(arg: u32) -> usize {
        (arg & !CONST_BIT) as usize
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => write!(
                f,
                "{:?} a={} b={} c={} bx={}",
                op,
                self.a(),
                self.b(),
                self.c(),
                self.bx()
            ),
            None => write!(f, "BadOp({:#010x})", self.0),
        }
    }
}

/// A constant-pool entry. Strings are owned here and interned at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    Str(String),
}

/// Where a closure's upvalue comes from: a register of the enclosing
/// activation (still open on its stack) or an upvalue already captured by
/// the enclosing closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpvalDesc {
    /// Debug name, if the compiler kept one.
    pub name: Option<String>,
    /// True: `index` is a register of the enclosing frame.
    /// False: `index` is an upvalue of the enclosing closure.
    pub in_stack: bool,
    pub index: u8,
}

/// An immutable function prototype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Proto {
    /// Number of fixed parameters.
    pub params: u8,
    /// Accepts extra arguments via the vararg instruction.
    pub is_vararg: bool,
    /// Register-window size this prototype needs.
    pub max_stack: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub upvalues: Vec<UpvalDesc>,
    /// Chunk-global indices of nested prototypes (`Closure` Bx operands
    /// index into this list).
    pub protos: Vec<u32>,
    /// Source name for diagnostics.
    pub source: Option<String>,
    /// Line per instruction; empty when the compiler stripped debug info.
    pub line_info: Vec<u32>,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

/// A compiled chunk: flat prototype list plus the entry prototype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub protos: Vec<Proto>,
    pub main: u32,
}

/// Why a chunk failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkError {
    NoProtos,
    BadMainIndex(u32),
    EmptyCode { proto: usize },
    MissingFinalReturn { proto: usize },
    BadOpcode { proto: usize, pc: usize },
    BadRegister { proto: usize, pc: usize },
    BadConstant { proto: usize, pc: usize },
    BadUpvalue { proto: usize, pc: usize },
    BadJump { proto: usize, pc: usize },
    BadProtoIndex { proto: usize, pc: usize },
    MissingPair { proto: usize, pc: usize },
    StrayExtraArg { proto: usize, pc: usize },
    VarargInFixedProto { proto: usize, pc: usize },
    TooManyUpvalues { proto: usize },
    BadLineInfo { proto: usize },
    BadParamCount { proto: usize },
    BadMainUpvalues { proto: usize },
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::NoProtos => write!(f, "chunk has no prototypes"),
            ChunkError::BadMainIndex(i) => write!(f, "entry prototype index {i} out of range"),
            ChunkError::EmptyCode { proto } => write!(f, "prototype {proto}: empty code"),
            ChunkError::MissingFinalReturn { proto } => {
                write!(f, "prototype {proto}: code does not end in a return")
            }
            ChunkError::BadOpcode { proto, pc } => {
                write!(f, "prototype {proto}: invalid opcode at pc {pc}")
            }
            ChunkError::BadRegister { proto, pc } => {
                write!(f, "prototype {proto}: register out of window at pc {pc}")
            }
            ChunkError::BadConstant { proto, pc } => {
                write!(f, "prototype {proto}: constant index out of range at pc {pc}")
            }
            ChunkError::BadUpvalue { proto, pc } => {
                write!(f, "prototype {proto}: upvalue index out of range at pc {pc}")
            }
            ChunkError::BadJump { proto, pc } => {
                write!(f, "prototype {proto}: jump target out of range at pc {pc}")
            }
            ChunkError::BadProtoIndex { proto, pc } => {
                write!(f, "prototype {proto}: nested prototype index out of range at pc {pc}")
            }
            ChunkError::MissingPair { proto, pc } => {
                write!(f, "prototype {proto}: instruction at pc {pc} lacks its required pair")
            }
            ChunkError::StrayExtraArg { proto, pc } => {
                write!(f, "prototype {proto}: stray extended operand at pc {pc}")
            }
            ChunkError::VarargInFixedProto { proto, pc } => {
                write!(f, "prototype {proto}: vararg instruction in fixed prototype at pc {pc}")
            }
            ChunkError::TooManyUpvalues { proto } => {
                write!(f, "prototype {proto}: too many upvalues")
            }
            ChunkError::BadLineInfo { proto } => {
                write!(f, "prototype {proto}: line table does not match code")
            }
            ChunkError::BadParamCount { proto } => {
                write!(f, "prototype {proto}: parameter count exceeds register window")
            }
            ChunkError::BadMainUpvalues { proto } => {
                write!(f, "prototype {proto}: entry prototype may capture only the globals upvalue")
            }
        }
    }
}

impl std::error::Error for ChunkError {}

impl Chunk {
    /// Structural validation. The dispatch loop assumes a validated chunk:
    /// register and constant operands in range, comparison/test instructions
    /// paired with jumps, extended operands where required, and a final
    /// return in every prototype.
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.protos.is_empty() {
            return Err(ChunkError::NoProtos);
        }
        if self.main as usize >= self.protos.len() {
            return Err(ChunkError::BadMainIndex(self.main));
        }
        let main = &self.protos[self.main as usize];
        if main.upvalues.len() > 1 {
            return Err(ChunkError::BadMainUpvalues {
                proto: self.main as usize,
            });
        }
        for (i, p) in self.protos.iter().enumerate() {
            self.validate_proto(i, p)?;
        }
        Ok(())
    }

    fn validate_proto(&self, idx: usize, p: &Proto) -> Result<(), ChunkError> {
        if p.code.is_empty() {
            return Err(ChunkError::EmptyCode { proto: idx });
        }
        if p.upvalues.len() > MAX_UPVALUES {
            return Err(ChunkError::TooManyUpvalues { proto: idx });
        }
        if !p.line_info.is_empty() && p.line_info.len() != p.code.len() {
            return Err(ChunkError::BadLineInfo { proto: idx });
        }
        if p.params as u32 > p.max_stack as u32 {
            return Err(ChunkError::BadParamCount { proto: idx });
        }
        if p.code.last().expect("code checked non-empty").opcode() != Some(OpCode::Return) {
            return Err(ChunkError::MissingFinalReturn { proto: idx });
        }

        let len = p.code.len();
        let nregs = p.max_stack as u32;
        let reg = |r: u32, pc: usize| {
            if r < nregs {
                Ok(())
            } else {
                Err(ChunkError::BadRegister { proto: idx, pc })
            }
        };
        let rk = |arg: u32, pc: usize| {
            if Instruction::is_const(arg) {
                if Instruction::const_index(arg) < p.constants.len() {
                    Ok(())
                } else {
                    Err(ChunkError::BadConstant { proto: idx, pc })
                }
            } else {
                reg(arg, pc)
            }
        };
        let upval = |u: u32, pc: usize| {
            if (u as usize) < p.upvalues.len() {
                Ok(())
            } else {
                Err(ChunkError::BadUpvalue { proto: idx, pc })
            }
        };
        let jump = |pc: usize, sbx: i32| {
            let target = pc as i64 + 1 + sbx as i64;
            if target >= 0 && (target as usize) < len {
                Ok(())
            } else {
                Err(ChunkError::BadJump { proto: idx, pc })
            }
        };
        let next_is = |pc: usize, want: OpCode| {
            if pc + 1 < len && p.code[pc + 1].opcode() == Some(want) {
                Ok(())
            } else {
                Err(ChunkError::MissingPair { proto: idx, pc })
            }
        };

        for pc in 0..len {
            let i = p.code[pc];
            let op = i.opcode().ok_or(ChunkError::BadOpcode { proto: idx, pc })?;
            match op {
                OpCode::Move | OpCode::Unm | OpCode::Not | OpCode::Len => {
                    reg(i.a(), pc)?;
                    reg(i.b(), pc)?;
                }
                OpCode::LoadK => {
                    reg(i.a(), pc)?;
                    if i.bx() as usize >= p.constants.len() {
                        return Err(ChunkError::BadConstant { proto: idx, pc });
                    }
                }
                OpCode::LoadKx => {
                    reg(i.a(), pc)?;
                    next_is(pc, OpCode::ExtraArg)?;
                    if p.code[pc + 1].ax_arg() as usize >= p.constants.len() {
                        return Err(ChunkError::BadConstant { proto: idx, pc });
                    }
                }
                OpCode::LoadBool => {
                    reg(i.a(), pc)?;
                    if i.c() != 0 && pc + 1 >= len {
                        return Err(ChunkError::BadJump { proto: idx, pc });
                    }
                }
                OpCode::LoadNil => reg(i.a() + i.b(), pc)?,
                OpCode::GetUpval => {
                    reg(i.a(), pc)?;
                    upval(i.b(), pc)?;
                }
                OpCode::SetUpval => {
                    reg(i.a(), pc)?;
                    upval(i.b(), pc)?;
                }
                OpCode::GetTabUp => {
                    reg(i.a(), pc)?;
                    upval(i.b(), pc)?;
                    rk(i.c(), pc)?;
                }
                OpCode::SetTabUp => {
                    upval(i.a(), pc)?;
                    rk(i.b(), pc)?;
                    rk(i.c(), pc)?;
                }
                OpCode::GetTable => {
                    reg(i.a(), pc)?;
                    reg(i.b(), pc)?;
                    rk(i.c(), pc)?;
                }
                OpCode::SetTable => {
                    reg(i.a(), pc)?;
                    rk(i.b(), pc)?;
                    rk(i.c(), pc)?;
                }
                OpCode::NewTable => reg(i.a(), pc)?,
                OpCode::SelfCall => {
                    reg(i.a() + 1, pc)?;
                    reg(i.b(), pc)?;
                    rk(i.c(), pc)?;
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow => {
                    reg(i.a(), pc)?;
                    rk(i.b(), pc)?;
                    rk(i.c(), pc)?;
                }
                OpCode::Concat => {
                    reg(i.a(), pc)?;
                    reg(i.b(), pc)?;
                    reg(i.c(), pc)?;
                    if i.b() > i.c() {
                        return Err(ChunkError::BadRegister { proto: idx, pc });
                    }
                }
                OpCode::Jmp => {
                    jump(pc, i.sbx())?;
                    if i.a() > nregs {
                        return Err(ChunkError::BadRegister { proto: idx, pc });
                    }
                }
                OpCode::Eq | OpCode::Lt | OpCode::Le => {
                    rk(i.b(), pc)?;
                    rk(i.c(), pc)?;
                    next_is(pc, OpCode::Jmp)?;
                }
                OpCode::Test => {
                    reg(i.a(), pc)?;
                    next_is(pc, OpCode::Jmp)?;
                }
                OpCode::TestSet => {
                    reg(i.a(), pc)?;
                    reg(i.b(), pc)?;
                    next_is(pc, OpCode::Jmp)?;
                }
                OpCode::Call | OpCode::TailCall => {
                    reg(i.a(), pc)?;
                    if i.b() > 0 {
                        reg(i.a() + i.b() - 1, pc)?;
                    }
                    if i.c() > 1 {
                        reg(i.a() + i.c() - 2, pc)?;
                    }
                }
                OpCode::Return => {
                    if i.b() > 1 {
                        reg(i.a() + i.b() - 2, pc)?;
                    }
                }
                OpCode::ForLoop | OpCode::ForPrep => {
                    reg(i.a() + 3, pc)?;
                    jump(pc, i.sbx())?;
                }
                OpCode::TForCall => {
                    // Needs the three-slot call window above a+2 plus room
                    // for the requested results.
                    reg(i.a() + 5, pc)?;
                    reg(i.a() + 2 + i.c(), pc)?;
                    if i.c() == 0 {
                        return Err(ChunkError::BadRegister { proto: idx, pc });
                    }
                    next_is(pc, OpCode::TForLoop)?;
                }
                OpCode::TForLoop => {
                    reg(i.a() + 1, pc)?;
                    jump(pc, i.sbx())?;
                }
                OpCode::SetList => {
                    reg(i.a(), pc)?;
                    if i.c() == 0 {
                        next_is(pc, OpCode::ExtraArg)?;
                    }
                }
                OpCode::Closure => {
                    reg(i.a(), pc)?;
                    match p.protos.get(i.bx() as usize) {
                        Some(&global) if (global as usize) < self.protos.len() => {}
                        _ => return Err(ChunkError::BadProtoIndex { proto: idx, pc }),
                    }
                }
                OpCode::Vararg => {
                    reg(i.a(), pc)?;
                    if !p.is_vararg {
                        return Err(ChunkError::VarargInFixedProto { proto: idx, pc });
                    }
                    if i.b() > 1 {
                        reg(i.a() + i.b() - 2, pc)?;
                    }
                }
                OpCode::ExtraArg => {
                    let paired = pc > 0
                        && matches!(
                            p.code[pc - 1].opcode(),
                            Some(OpCode::LoadKx) | Some(OpCode::SetList)
                        );
                    if !paired {
                        return Err(ChunkError::StrayExtraArg { proto: idx, pc });
                    }
                }
            }
        }
        Ok(())
    }

    /// Line for an instruction of a prototype, when debug info is present.
    pub fn line_at(&self, proto: usize, pc: usize) -> Option<u32> {
        self.protos
            .get(proto)
            .and_then(|p| p.line_info.get(pc))
            .copied()
    }
}
