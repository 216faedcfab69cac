//! The narrow emission interface shared by all backends.
//!
//! The interpreter generator is written once against [`MacroAssembler`];
//! each backend (the portable ISA executed by the simulator, x86-64) only
//! lowers these operations. Registers are abstract and carry the fixed
//! roles the interpreter relies on.

use std::fmt;

/// Abstract integer registers.
///
/// `Method`, `Bcp`, `Locals`, `Cache`, `Thread`, `Sp` and `Fp` survive
/// runtime and native calls. Everything else is caller-saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    /// Integer top-of-stack cache and integer/object return value.
    Tos = 0,
    Method,
    Bcp,
    Locals,
    Cache,
    Thread,
    /// Caller's SP at the point of a call; read by entries to return.
    SenderSp,
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    Sp,
    Fp,
}

pub const NUM_REGS: usize = 15;

/// Return value register of calls.
pub const RET: Reg = Reg::Tos;

/// Argument registers for runtime and native calls, in order.
pub const ARGS: [Reg; 6] = [Reg::R0, Reg::R1, Reg::R2, Reg::R3, Reg::R4, Reg::R5];

impl Reg {
    pub const ALL: [Reg; NUM_REGS] = [
        Reg::Tos,
        Reg::Method,
        Reg::Bcp,
        Reg::Locals,
        Reg::Cache,
        Reg::Thread,
        Reg::SenderSp,
        Reg::R0,
        Reg::R1,
        Reg::R2,
        Reg::R3,
        Reg::R4,
        Reg::R5,
        Reg::Sp,
        Reg::Fp,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u8) -> Option<Reg> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Tos => "tos",
            Reg::Method => "method",
            Reg::Bcp => "bcp",
            Reg::Locals => "locals",
            Reg::Cache => "cache",
            Reg::Thread => "thread",
            Reg::SenderSp => "sender_sp",
            Reg::R0 => "r0",
            Reg::R1 => "r1",
            Reg::R2 => "r2",
            Reg::R3 => "r3",
            Reg::R4 => "r4",
            Reg::R5 => "r5",
            Reg::Sp => "sp",
            Reg::Fp => "fp",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Abstract float registers. `F0` caches a float/double top of stack and
/// carries float results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FReg {
    F0 = 0,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
}

pub const NUM_FREGS: usize = 8;
pub const FTOS: FReg = FReg::F0;
pub const FRET: FReg = FReg::F0;

impl FReg {
    pub const ALL: [FReg; NUM_FREGS] = [
        FReg::F0,
        FReg::F1,
        FReg::F2,
        FReg::F3,
        FReg::F4,
        FReg::F5,
        FReg::F6,
        FReg::F7,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u8) -> Option<FReg> {
        Self::ALL.get(index as usize).copied()
    }
}

impl fmt::Display for FReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.index())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Width {
    W8 = 0,
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> usize {
        1 << (self as usize)
    }

    pub fn from_bits(bits: u8) -> Option<Width> {
        match bits {
            0 => Some(Width::W8),
            1 => Some(Width::W16),
            2 => Some(Width::W32),
            3 => Some(Width::W64),
            _ => None,
        }
    }
}

/// How a narrow load fills the upper register bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Extend {
    Zero = 0,
    Sign,
}

/// Operand size of an integer operation. `Int` operates on the low 32 bits
/// and leaves the result sign-extended to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpSize {
    Int = 0,
    Long,
}

/// Integer operations. Shift counts are masked to the operand size;
/// `Div`/`Rem` follow Java semantics for `MIN / -1`. Division by zero is
/// checked by the caller before the operation is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

impl AluOp {
    pub const ALL: [AluOp; 11] = [
        AluOp::Add,
        AluOp::Sub,
        AluOp::Mul,
        AluOp::Div,
        AluOp::Rem,
        AluOp::And,
        AluOp::Or,
        AluOp::Xor,
        AluOp::Shl,
        AluOp::Shr,
        AluOp::Ushr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Mul => "mul",
            AluOp::Div => "div",
            AluOp::Rem => "rem",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Shl => "shl",
            AluOp::Shr => "shr",
            AluOp::Ushr => "ushr",
        }
    }
}

/// Branch conditions on 64-bit register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Below,
    BelowEq,
    Above,
    AboveEq,
}

impl Cond {
    pub const ALL: [Cond; 10] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Lt,
        Cond::Le,
        Cond::Gt,
        Cond::Ge,
        Cond::Below,
        Cond::BelowEq,
        Cond::Above,
        Cond::AboveEq,
    ];

    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ge => Cond::Lt,
            Cond::Below => Cond::AboveEq,
            Cond::BelowEq => Cond::Above,
            Cond::Above => Cond::BelowEq,
            Cond::AboveEq => Cond::Below,
        }
    }

    pub fn holds(self, lhs: u64, rhs: u64) -> bool {
        let (a, b) = (lhs as i64, rhs as i64);
        match self {
            Cond::Eq => lhs == rhs,
            Cond::Ne => lhs != rhs,
            Cond::Lt => a < b,
            Cond::Le => a <= b,
            Cond::Gt => a > b,
            Cond::Ge => a >= b,
            Cond::Below => lhs < rhs,
            Cond::BelowEq => lhs <= rhs,
            Cond::Above => lhs > rhs,
            Cond::AboveEq => lhs >= rhs,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Le => "le",
            Cond::Gt => "gt",
            Cond::Ge => "ge",
            Cond::Below => "b",
            Cond::BelowEq => "be",
            Cond::Above => "a",
            Cond::AboveEq => "ae",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Precision {
    Single = 0,
    Double,
}

impl Precision {
    pub fn width(self) -> Width {
        match self {
            Precision::Single => Width::W32,
            Precision::Double => Width::W64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FloatOp {
    Add = 0,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FloatUnary {
    Neg = 0,
    Abs,
    Sqrt,
}

/// Result of a float compare when either operand is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NanOrder {
    Less = 0,
    Greater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IntToFloat {
    I2F = 0,
    I2D,
    L2F,
    L2D,
}

/// Float to integer conversions with Java saturation (NaN becomes 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FloatToInt {
    F2I = 0,
    F2L,
    D2I,
    D2L,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FloatToFloat {
    F2D = 0,
    D2F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Membar {
    StoreStore = 0,
    LoadLoad,
    StoreLoad,
    Full,
}

/// Reasons generated code stops the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TrapCode {
    IllegalBytecode = 1,
    UnimplementedBytecode,
    ShouldNotReachHere,
    StackInvariant,
    NativeAsNonNative,
}

impl TrapCode {
    pub fn from_u16(code: u16) -> Option<TrapCode> {
        match code {
            1 => Some(TrapCode::IllegalBytecode),
            2 => Some(TrapCode::UnimplementedBytecode),
            3 => Some(TrapCode::ShouldNotReachHere),
            4 => Some(TrapCode::StackInvariant),
            5 => Some(TrapCode::NativeAsNonNative),
            _ => None,
        }
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrapCode::IllegalBytecode => "illegal bytecode",
            TrapCode::UnimplementedBytecode => "unimplemented bytecode",
            TrapCode::ShouldNotReachHere => "should not reach here",
            TrapCode::StackInvariant => "expression stack invariant violated",
            TrapCode::NativeAsNonNative => "native method entered as non-native",
        };
        f.write_str(s)
    }
}

/// `[base + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Reg,
    pub disp: i32,
}

impl Address {
    pub fn new(base: Reg, disp: i32) -> Self {
        Self { base, disp }
    }
}

/// `[base + (index << shift) + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indexed {
    pub base: Reg,
    pub index: Reg,
    pub shift: u8,
    pub disp: i32,
}

impl Indexed {
    pub fn new(base: Reg, index: Reg, shift: u8, disp: i32) -> Self {
        debug_assert!(shift <= 3);
        Self {
            base,
            index,
            shift,
            disp,
        }
    }
}

/// A position inside the codelet being emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub usize);

/// The emission interface.
///
/// Calls into generated code (`call_to`, `call_reg`) preserve every
/// register the callee does not write. `call_runtime*` and `call_native`
/// follow the host C convention: they clobber `Tos`, `SenderSp`, `R0..R5`
/// and all float registers, and keep the rest.
pub trait MacroAssembler: Sized {
    /// Start emitting code that will live at `base`.
    fn new(base: usize) -> Self;
    fn backend_name() -> &'static str;
    /// Absolute address of the next instruction.
    fn pc(&self) -> usize;
    fn finish(self) -> Result<Vec<u8>, String>;
    fn align(&mut self, alignment: usize);

    fn create_label(&mut self) -> Label;
    fn bind(&mut self, label: Label);

    fn mov(&mut self, dst: Reg, src: Reg);
    fn mov_imm(&mut self, dst: Reg, imm: i64);
    fn load(&mut self, dst: Reg, src: Address, width: Width, ext: Extend);
    fn store(&mut self, src: Reg, dst: Address, width: Width);
    fn load_indexed(&mut self, dst: Reg, src: Indexed, width: Width, ext: Extend);
    fn store_indexed(&mut self, src: Reg, dst: Indexed, width: Width);
    fn lea(&mut self, dst: Reg, src: Address);
    fn lea_indexed(&mut self, dst: Reg, src: Indexed);
    /// Load a big-endian bytecode operand (16 or 32 bits).
    fn load_be(&mut self, dst: Reg, src: Address, width: Width, ext: Extend);
    /// Truncate `src` to `width` and extend it back to 64 bits.
    fn extend(&mut self, dst: Reg, src: Reg, width: Width, ext: Extend);

    fn alu(&mut self, op: AluOp, size: OpSize, dst: Reg, lhs: Reg, rhs: Reg);
    fn alu_imm(&mut self, op: AluOp, size: OpSize, dst: Reg, lhs: Reg, imm: i32);
    fn neg(&mut self, size: OpSize, dst: Reg, src: Reg);

    fn fload(&mut self, dst: FReg, src: Address, precision: Precision);
    fn fstore(&mut self, src: FReg, dst: Address, precision: Precision);
    fn fload_indexed(&mut self, dst: FReg, src: Indexed, precision: Precision);
    fn fstore_indexed(&mut self, src: FReg, dst: Indexed, precision: Precision);
    fn fmov(&mut self, dst: FReg, src: FReg);
    /// Raw bits of a float register; singles are zero-extended.
    fn fmov_to_int(&mut self, dst: Reg, src: FReg, precision: Precision);
    fn fmov_from_int(&mut self, dst: FReg, src: Reg, precision: Precision);
    fn falu(&mut self, op: FloatOp, precision: Precision, dst: FReg, lhs: FReg, rhs: FReg);
    fn funary(&mut self, op: FloatUnary, precision: Precision, dst: FReg, src: FReg);
    /// `dst = -1 | 0 | 1` comparing `lhs` with `rhs`.
    fn fcmp(&mut self, dst: Reg, lhs: FReg, rhs: FReg, precision: Precision, nan: NanOrder);
    fn int_to_float(&mut self, conv: IntToFloat, dst: FReg, src: Reg);
    fn float_to_int(&mut self, conv: FloatToInt, dst: Reg, src: FReg);
    fn float_to_float(&mut self, conv: FloatToFloat, dst: FReg, src: FReg);

    fn jump(&mut self, label: Label);
    fn jump_to(&mut self, target: usize);
    fn jump_reg(&mut self, target: Reg);
    fn branch(&mut self, cond: Cond, lhs: Reg, rhs: Reg, label: Label);
    fn branch_imm(&mut self, cond: Cond, lhs: Reg, imm: i32, label: Label);
    fn call_to(&mut self, target: usize);
    fn call_reg(&mut self, target: Reg);
    fn ret(&mut self);
    fn push(&mut self, src: Reg);
    fn pop(&mut self, dst: Reg);

    /// `RET = entry(R0, R1, R2, R3)`.
    fn call_runtime(&mut self, entry: usize);
    /// `F0 = entry(F0, F1)`.
    fn call_runtime_float(&mut self, entry: usize);
    /// Call a native function with the full argument convention:
    /// `R0..R5`, `F0..F7`, then stack words at `[SP]` upwards.
    fn call_native(&mut self, target: Reg);

    fn membar(&mut self, kind: Membar);
    fn trap(&mut self, code: TrapCode);
    fn nop(&mut self);

    fn load_ptr(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.load(dst, Address::new(base, disp), Width::W64, Extend::Zero);
    }

    fn store_ptr(&mut self, src: Reg, base: Reg, disp: i32) {
        self.store(src, Address::new(base, disp), Width::W64);
    }

    fn add_imm(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.alu_imm(AluOp::Add, OpSize::Long, dst, src, imm);
    }

    /// Branch to an address outside the current codelet.
    fn branch_imm_to(&mut self, cond: Cond, lhs: Reg, imm: i32, target: usize) {
        let skip = self.create_label();
        self.branch_imm(cond.negate(), lhs, imm, skip);
        self.jump_to(target);
        self.bind(skip);
    }

    fn branch_to(&mut self, cond: Cond, lhs: Reg, rhs: Reg, target: usize) {
        let skip = self.create_label();
        self.branch(cond.negate(), lhs, rhs, skip);
        self.jump_to(target);
        self.bind(skip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_negate_is_involution() {
        for cond in Cond::ALL {
            assert_eq!(cond.negate().negate(), cond);
            for (a, b) in [(0u64, 0u64), (1, 2), (u64::MAX, 1), (5, 3)] {
                assert_ne!(cond.holds(a, b), cond.negate().holds(a, b));
            }
        }
    }

    #[test]
    fn test_register_roundtrip() {
        for reg in Reg::ALL {
            assert_eq!(Reg::from_index(reg as u8), Some(reg));
        }
        assert_eq!(Reg::from_index(NUM_REGS as u8), None);
    }
}
