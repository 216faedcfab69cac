//! The portable instruction set.
//!
//! A compact byte-coded register ISA whose operations are exactly the
//! [`MacroAssembler`] interface. Code emitted with [`PortableAssembler`]
//! lives in the interpreter's codelet queue like any native code and is
//! executed there by the [`Machine`](super::simulator::Machine).
//!
//! Control-transfer instructions end with a rel32 displacement relative to
//! the end of the instruction; runtime calls carry absolute 64-bit targets.

use std::fmt;

use super::codebuf::CodeBuffer;
use super::masm::*;

pub mod op {
    pub const NOP: u8 = 0x00;
    pub const MOV: u8 = 0x01;
    pub const MOV_IMM: u8 = 0x02;
    pub const LOAD: u8 = 0x03;
    pub const STORE: u8 = 0x04;
    pub const LOAD_IDX: u8 = 0x05;
    pub const STORE_IDX: u8 = 0x06;
    pub const LEA: u8 = 0x07;
    pub const LEA_IDX: u8 = 0x08;
    pub const LOAD_BE: u8 = 0x09;
    pub const EXTEND: u8 = 0x0a;
    pub const ALU: u8 = 0x10;
    pub const ALU_IMM: u8 = 0x11;
    pub const NEG: u8 = 0x12;
    pub const FLOAD: u8 = 0x20;
    pub const FSTORE: u8 = 0x21;
    pub const FLOAD_IDX: u8 = 0x22;
    pub const FSTORE_IDX: u8 = 0x23;
    pub const FMOV: u8 = 0x24;
    pub const FMOV_TO_INT: u8 = 0x25;
    pub const FMOV_FROM_INT: u8 = 0x26;
    pub const FALU: u8 = 0x27;
    pub const FUNARY: u8 = 0x28;
    pub const FCMP: u8 = 0x29;
    pub const I2F: u8 = 0x2a;
    pub const F2I: u8 = 0x2b;
    pub const F2F: u8 = 0x2c;
    pub const JUMP: u8 = 0x30;
    pub const JUMP_REG: u8 = 0x31;
    pub const BRANCH: u8 = 0x32;
    pub const BRANCH_IMM: u8 = 0x33;
    pub const CALL: u8 = 0x34;
    pub const CALL_REG: u8 = 0x35;
    pub const RET: u8 = 0x36;
    pub const PUSH: u8 = 0x37;
    pub const POP: u8 = 0x38;
    pub const CALL_RUNTIME: u8 = 0x39;
    pub const CALL_RUNTIME_FLOAT: u8 = 0x3a;
    pub const CALL_NATIVE: u8 = 0x3b;
    pub const MEMBAR: u8 = 0x3c;
    pub const TRAP: u8 = 0x3d;
}

/// Encoded length of the instruction starting with `opcode`.
pub fn insn_len(opcode: u8) -> Option<usize> {
    let len = match opcode {
        op::NOP | op::RET => 1,
        op::JUMP_REG | op::CALL_REG | op::PUSH | op::POP | op::CALL_NATIVE | op::MEMBAR => 2,
        op::MOV | op::FMOV | op::TRAP => 3,
        op::EXTEND
        | op::NEG
        | op::FMOV_TO_INT
        | op::FMOV_FROM_INT
        | op::I2F
        | op::F2I
        | op::F2F => 4,
        op::JUMP | op::CALL => 5,
        op::FUNARY => 5,
        op::ALU | op::FALU | op::FCMP => 6,
        op::LEA => 7,
        op::LOAD | op::STORE | op::LOAD_BE | op::FLOAD | op::FSTORE | op::BRANCH => 8,
        op::LEA_IDX | op::ALU_IMM | op::CALL_RUNTIME | op::CALL_RUNTIME_FLOAT => 9,
        op::MOV_IMM | op::LOAD_IDX | op::STORE_IDX | op::FLOAD_IDX | op::FSTORE_IDX => 10,
        op::BRANCH_IMM => 11,
        _ => return None,
    };
    Some(len)
}

/// One decoded instruction. Control-flow targets are absolute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Insn {
    Nop,
    Mov { dst: Reg, src: Reg },
    MovImm { dst: Reg, imm: i64 },
    Load { dst: Reg, src: Address, width: Width, ext: Extend },
    Store { src: Reg, dst: Address, width: Width },
    LoadIndexed { dst: Reg, src: Indexed, width: Width, ext: Extend },
    StoreIndexed { src: Reg, dst: Indexed, width: Width },
    Lea { dst: Reg, src: Address },
    LeaIndexed { dst: Reg, src: Indexed },
    LoadBe { dst: Reg, src: Address, width: Width, ext: Extend },
    Extend { dst: Reg, src: Reg, width: Width, ext: Extend },
    Alu { op: AluOp, size: OpSize, dst: Reg, lhs: Reg, rhs: Reg },
    AluImm { op: AluOp, size: OpSize, dst: Reg, lhs: Reg, imm: i32 },
    Neg { size: OpSize, dst: Reg, src: Reg },
    FLoad { dst: FReg, src: Address, precision: Precision },
    FStore { src: FReg, dst: Address, precision: Precision },
    FLoadIndexed { dst: FReg, src: Indexed, precision: Precision },
    FStoreIndexed { src: FReg, dst: Indexed, precision: Precision },
    FMov { dst: FReg, src: FReg },
    FMovToInt { dst: Reg, src: FReg, precision: Precision },
    FMovFromInt { dst: FReg, src: Reg, precision: Precision },
    FAlu { op: FloatOp, precision: Precision, dst: FReg, lhs: FReg, rhs: FReg },
    FUnary { op: FloatUnary, precision: Precision, dst: FReg, src: FReg },
    FCmp { dst: Reg, lhs: FReg, rhs: FReg, precision: Precision, nan: NanOrder },
    IntToFloat { conv: IntToFloat, dst: FReg, src: Reg },
    FloatToInt { conv: FloatToInt, dst: Reg, src: FReg },
    FloatToFloat { conv: FloatToFloat, dst: FReg, src: FReg },
    Jump { target: usize },
    JumpReg { target: Reg },
    Branch { cond: Cond, lhs: Reg, rhs: Reg, target: usize },
    BranchImm { cond: Cond, lhs: Reg, imm: i32, target: usize },
    Call { target: usize },
    CallReg { target: Reg },
    Ret,
    Push { src: Reg },
    Pop { dst: Reg },
    CallRuntime { entry: usize },
    CallRuntimeFloat { entry: usize },
    CallNative { target: Reg },
    Membar { kind: Membar },
    Trap { code: TrapCode },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode(u8),
    Truncated,
    BadOperand { opcode: u8, byte: u8 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownOpcode(op) => write!(f, "unknown opcode {:#04x}", op),
            DecodeError::Truncated => write!(f, "truncated instruction"),
            DecodeError::BadOperand { opcode, byte } => {
                write!(f, "bad operand {:#04x} for opcode {:#04x}", byte, opcode)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    opcode: u8,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let s = self
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or(DecodeError::Truncated)?;
        self.pos += 4;
        Ok(i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let s = self
            .bytes
            .get(self.pos..self.pos + 8)
            .ok_or(DecodeError::Truncated)?;
        self.pos += 8;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Ok(i64::from_le_bytes(b))
    }

    fn bad(&self, byte: u8) -> DecodeError {
        DecodeError::BadOperand {
            opcode: self.opcode,
            byte,
        }
    }

    fn reg(&mut self) -> Result<Reg, DecodeError> {
        let b = self.u8()?;
        Reg::from_index(b).ok_or_else(|| self.bad(b))
    }

    fn freg(&mut self) -> Result<FReg, DecodeError> {
        let b = self.u8()?;
        FReg::from_index(b).ok_or_else(|| self.bad(b))
    }

    fn width_ext(&mut self) -> Result<(Width, Extend), DecodeError> {
        let b = self.u8()?;
        let width = Width::from_bits(b & 0x3).ok_or_else(|| self.bad(b))?;
        let ext = if b & 0x10 != 0 { Extend::Sign } else { Extend::Zero };
        Ok((width, ext))
    }

    fn precision(&mut self) -> Result<Precision, DecodeError> {
        match self.u8()? {
            0 => Ok(Precision::Single),
            1 => Ok(Precision::Double),
            b => Err(self.bad(b)),
        }
    }

    fn size(&mut self) -> Result<OpSize, DecodeError> {
        match self.u8()? {
            0 => Ok(OpSize::Int),
            1 => Ok(OpSize::Long),
            b => Err(self.bad(b)),
        }
    }

    fn address(&mut self) -> Result<Address, DecodeError> {
        let base = self.reg()?;
        let disp = self.i32()?;
        Ok(Address::new(base, disp))
    }

    fn indexed(&mut self) -> Result<Indexed, DecodeError> {
        let base = self.reg()?;
        let index = self.reg()?;
        let shift = self.u8()?;
        if shift > 3 {
            return Err(self.bad(shift));
        }
        let disp = self.i32()?;
        Ok(Indexed::new(base, index, shift, disp))
    }

    fn indexed_with(&mut self) -> Result<(Indexed, u8), DecodeError> {
        let base = self.reg()?;
        let index = self.reg()?;
        let shift = self.u8()?;
        if shift > 3 {
            return Err(self.bad(shift));
        }
        let extra = self.u8()?;
        let disp = self.i32()?;
        Ok((Indexed::new(base, index, shift, disp), extra))
    }

    fn enum_u8<T: Copy>(&mut self, table: &[T]) -> Result<T, DecodeError> {
        let b = self.u8()?;
        table.get(b as usize).copied().ok_or_else(|| self.bad(b))
    }

    /// Absolute target of a trailing rel32.
    fn target(&mut self, pc: usize) -> Result<usize, DecodeError> {
        let rel = self.i32()?;
        Ok((pc as i64 + self.pos as i64 + rel as i64) as usize)
    }
}

const FLOAT_OPS: [FloatOp; 4] = [FloatOp::Add, FloatOp::Sub, FloatOp::Mul, FloatOp::Div];
const FLOAT_UNARY: [FloatUnary; 3] = [FloatUnary::Neg, FloatUnary::Abs, FloatUnary::Sqrt];
const NAN_ORDERS: [NanOrder; 2] = [NanOrder::Less, NanOrder::Greater];
const I2F_CONVS: [IntToFloat; 4] = [IntToFloat::I2F, IntToFloat::I2D, IntToFloat::L2F, IntToFloat::L2D];
const F2I_CONVS: [FloatToInt; 4] = [FloatToInt::F2I, FloatToInt::F2L, FloatToInt::D2I, FloatToInt::D2L];
const F2F_CONVS: [FloatToFloat; 2] = [FloatToFloat::F2D, FloatToFloat::D2F];
const MEMBARS: [Membar; 4] = [Membar::StoreStore, Membar::LoadLoad, Membar::StoreLoad, Membar::Full];

/// Decode one instruction. `bytes` starts at `pc` and must hold at least
/// the full instruction.
pub fn decode(bytes: &[u8], pc: usize) -> Result<(Insn, usize), DecodeError> {
    let opcode = *bytes.first().ok_or(DecodeError::Truncated)?;
    let mut r = Reader {
        bytes,
        pos: 1,
        opcode,
    };
    let insn = match opcode {
        op::NOP => Insn::Nop,
        op::MOV => Insn::Mov {
            dst: r.reg()?,
            src: r.reg()?,
        },
        op::MOV_IMM => Insn::MovImm {
            dst: r.reg()?,
            imm: r.i64()?,
        },
        op::LOAD => {
            let dst = r.reg()?;
            let (width, ext) = r.width_ext()?;
            Insn::Load {
                dst,
                src: r.address()?,
                width,
                ext,
            }
        }
        op::STORE => {
            let src = r.reg()?;
            let (width, _) = r.width_ext()?;
            Insn::Store {
                src,
                dst: r.address()?,
                width,
            }
        }
        op::LOAD_IDX => {
            let dst = r.reg()?;
            let (src, we) = r.indexed_with()?;
            let width = Width::from_bits(we & 3).ok_or_else(|| r.bad(we))?;
            let ext = if we & 0x10 != 0 { Extend::Sign } else { Extend::Zero };
            Insn::LoadIndexed { dst, src, width, ext }
        }
        op::STORE_IDX => {
            let src = r.reg()?;
            let (dst, we) = r.indexed_with()?;
            let width = Width::from_bits(we & 3).ok_or_else(|| r.bad(we))?;
            Insn::StoreIndexed { src, dst, width }
        }
        op::LEA => Insn::Lea {
            dst: r.reg()?,
            src: r.address()?,
        },
        op::LEA_IDX => Insn::LeaIndexed {
            dst: r.reg()?,
            src: r.indexed()?,
        },
        op::LOAD_BE => {
            let dst = r.reg()?;
            let (width, ext) = r.width_ext()?;
            Insn::LoadBe {
                dst,
                src: r.address()?,
                width,
                ext,
            }
        }
        op::EXTEND => {
            let dst = r.reg()?;
            let src = r.reg()?;
            let (width, ext) = r.width_ext()?;
            Insn::Extend { dst, src, width, ext }
        }
        op::ALU => Insn::Alu {
            op: r.enum_u8(&AluOp::ALL)?,
            size: r.size()?,
            dst: r.reg()?,
            lhs: r.reg()?,
            rhs: r.reg()?,
        },
        op::ALU_IMM => Insn::AluImm {
            op: r.enum_u8(&AluOp::ALL)?,
            size: r.size()?,
            dst: r.reg()?,
            lhs: r.reg()?,
            imm: r.i32()?,
        },
        op::NEG => Insn::Neg {
            size: r.size()?,
            dst: r.reg()?,
            src: r.reg()?,
        },
        op::FLOAD => {
            let dst = r.freg()?;
            let src = r.address()?;
            Insn::FLoad {
                dst,
                src,
                precision: r.precision()?,
            }
        }
        op::FSTORE => {
            let src = r.freg()?;
            let dst = r.address()?;
            Insn::FStore {
                src,
                dst,
                precision: r.precision()?,
            }
        }
        op::FLOAD_IDX => {
            let dst = r.freg()?;
            let (src, p) = r.indexed_with()?;
            let precision = if p == 0 { Precision::Single } else { Precision::Double };
            Insn::FLoadIndexed { dst, src, precision }
        }
        op::FSTORE_IDX => {
            let src = r.freg()?;
            let (dst, p) = r.indexed_with()?;
            let precision = if p == 0 { Precision::Single } else { Precision::Double };
            Insn::FStoreIndexed { src, dst, precision }
        }
        op::FMOV => Insn::FMov {
            dst: r.freg()?,
            src: r.freg()?,
        },
        op::FMOV_TO_INT => Insn::FMovToInt {
            dst: r.reg()?,
            src: r.freg()?,
            precision: r.precision()?,
        },
        op::FMOV_FROM_INT => Insn::FMovFromInt {
            dst: r.freg()?,
            src: r.reg()?,
            precision: r.precision()?,
        },
        op::FALU => Insn::FAlu {
            op: r.enum_u8(&FLOAT_OPS)?,
            precision: r.precision()?,
            dst: r.freg()?,
            lhs: r.freg()?,
            rhs: r.freg()?,
        },
        op::FUNARY => Insn::FUnary {
            op: r.enum_u8(&FLOAT_UNARY)?,
            precision: r.precision()?,
            dst: r.freg()?,
            src: r.freg()?,
        },
        op::FCMP => Insn::FCmp {
            dst: r.reg()?,
            lhs: r.freg()?,
            rhs: r.freg()?,
            precision: r.precision()?,
            nan: r.enum_u8(&NAN_ORDERS)?,
        },
        op::I2F => Insn::IntToFloat {
            conv: r.enum_u8(&I2F_CONVS)?,
            dst: r.freg()?,
            src: r.reg()?,
        },
        op::F2I => Insn::FloatToInt {
            conv: r.enum_u8(&F2I_CONVS)?,
            dst: r.reg()?,
            src: r.freg()?,
        },
        op::F2F => Insn::FloatToFloat {
            conv: r.enum_u8(&F2F_CONVS)?,
            dst: r.freg()?,
            src: r.freg()?,
        },
        op::JUMP => Insn::Jump {
            target: r.target(pc)?,
        },
        op::JUMP_REG => Insn::JumpReg { target: r.reg()? },
        op::BRANCH => {
            let cond = r.enum_u8(&Cond::ALL)?;
            let lhs = r.reg()?;
            let rhs = r.reg()?;
            Insn::Branch {
                cond,
                lhs,
                rhs,
                target: r.target(pc)?,
            }
        }
        op::BRANCH_IMM => {
            let cond = r.enum_u8(&Cond::ALL)?;
            let lhs = r.reg()?;
            let imm = r.i32()?;
            Insn::BranchImm {
                cond,
                lhs,
                imm,
                target: r.target(pc)?,
            }
        }
        op::CALL => Insn::Call {
            target: r.target(pc)?,
        },
        op::CALL_REG => Insn::CallReg { target: r.reg()? },
        op::RET => Insn::Ret,
        op::PUSH => Insn::Push { src: r.reg()? },
        op::POP => Insn::Pop { dst: r.reg()? },
        op::CALL_RUNTIME => Insn::CallRuntime {
            entry: r.i64()? as usize,
        },
        op::CALL_RUNTIME_FLOAT => Insn::CallRuntimeFloat {
            entry: r.i64()? as usize,
        },
        op::CALL_NATIVE => Insn::CallNative { target: r.reg()? },
        op::MEMBAR => Insn::Membar {
            kind: r.enum_u8(&MEMBARS)?,
        },
        op::TRAP => {
            let lo = r.u8()?;
            let hi = r.u8()?;
            let code = u16::from_le_bytes([lo, hi]);
            Insn::Trap {
                code: TrapCode::from_u16(code).ok_or(DecodeError::BadOperand { opcode, byte: lo })?,
            }
        }
        other => return Err(DecodeError::UnknownOpcode(other)),
    };
    Ok((insn, r.pos))
}

fn fmt_addr(a: &Address) -> String {
    if a.disp == 0 {
        format!("[{}]", a.base)
    } else if a.disp < 0 {
        format!("[{}-{:#x}]", a.base, -(a.disp as i64))
    } else {
        format!("[{}+{:#x}]", a.base, a.disp)
    }
}

fn fmt_idx(a: &Indexed) -> String {
    format!("[{}+{}<<{}{:+}]", a.base, a.index, a.shift, a.disp)
}

fn suffix(width: Width, ext: Extend) -> String {
    let s = match ext {
        Extend::Zero => "u",
        Extend::Sign => "s",
    };
    format!("{}{}", width.bytes() * 8, s)
}

fn prec(p: Precision) -> &'static str {
    match p {
        Precision::Single => "s",
        Precision::Double => "d",
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Nop => write!(f, "nop"),
            Insn::Mov { dst, src } => write!(f, "mov {}, {}", dst, src),
            Insn::MovImm { dst, imm } => write!(f, "mov {}, {:#x}", dst, imm),
            Insn::Load { dst, src, width, ext } => {
                write!(f, "ld{} {}, {}", suffix(*width, *ext), dst, fmt_addr(src))
            }
            Insn::Store { src, dst, width } => {
                write!(f, "st{} {}, {}", width.bytes() * 8, fmt_addr(dst), src)
            }
            Insn::LoadIndexed { dst, src, width, ext } => {
                write!(f, "ld{} {}, {}", suffix(*width, *ext), dst, fmt_idx(src))
            }
            Insn::StoreIndexed { src, dst, width } => {
                write!(f, "st{} {}, {}", width.bytes() * 8, fmt_idx(dst), src)
            }
            Insn::Lea { dst, src } => write!(f, "lea {}, {}", dst, fmt_addr(src)),
            Insn::LeaIndexed { dst, src } => write!(f, "lea {}, {}", dst, fmt_idx(src)),
            Insn::LoadBe { dst, src, width, ext } => {
                write!(f, "ldbe{} {}, {}", suffix(*width, *ext), dst, fmt_addr(src))
            }
            Insn::Extend { dst, src, width, ext } => {
                write!(f, "ext{} {}, {}", suffix(*width, *ext), dst, src)
            }
            Insn::Alu { op, size, dst, lhs, rhs } => {
                let w = if *size == OpSize::Int { "w" } else { "" };
                write!(f, "{}{} {}, {}, {}", op.name(), w, dst, lhs, rhs)
            }
            Insn::AluImm { op, size, dst, lhs, imm } => {
                let w = if *size == OpSize::Int { "w" } else { "" };
                write!(f, "{}{} {}, {}, {}", op.name(), w, dst, lhs, imm)
            }
            Insn::Neg { size, dst, src } => {
                let w = if *size == OpSize::Int { "w" } else { "" };
                write!(f, "neg{} {}, {}", w, dst, src)
            }
            Insn::FLoad { dst, src, precision } => {
                write!(f, "fld{} {}, {}", prec(*precision), dst, fmt_addr(src))
            }
            Insn::FStore { src, dst, precision } => {
                write!(f, "fst{} {}, {}", prec(*precision), fmt_addr(dst), src)
            }
            Insn::FLoadIndexed { dst, src, precision } => {
                write!(f, "fld{} {}, {}", prec(*precision), dst, fmt_idx(src))
            }
            Insn::FStoreIndexed { src, dst, precision } => {
                write!(f, "fst{} {}, {}", prec(*precision), fmt_idx(dst), src)
            }
            Insn::FMov { dst, src } => write!(f, "fmov {}, {}", dst, src),
            Insn::FMovToInt { dst, src, precision } => {
                write!(f, "fbits{} {}, {}", prec(*precision), dst, src)
            }
            Insn::FMovFromInt { dst, src, precision } => {
                write!(f, "fraw{} {}, {}", prec(*precision), dst, src)
            }
            Insn::FAlu {
                op,
                precision,
                dst,
                lhs,
                rhs,
            } => write!(f, "f{:?}{} {}, {}, {}", op, prec(*precision), dst, lhs, rhs),
            Insn::FUnary {
                op,
                precision,
                dst,
                src,
            } => write!(f, "f{:?}{} {}, {}", op, prec(*precision), dst, src),
            Insn::FCmp {
                dst,
                lhs,
                rhs,
                precision,
                nan,
            } => write!(f, "fcmp{}.{:?} {}, {}, {}", prec(*precision), nan, dst, lhs, rhs),
            Insn::IntToFloat { conv, dst, src } => write!(f, "{:?} {}, {}", conv, dst, src),
            Insn::FloatToInt { conv, dst, src } => write!(f, "{:?} {}, {}", conv, dst, src),
            Insn::FloatToFloat { conv, dst, src } => write!(f, "{:?} {}, {}", conv, dst, src),
            Insn::Jump { target } => write!(f, "jmp {:#x}", target),
            Insn::JumpReg { target } => write!(f, "jmp {}", target),
            Insn::Branch {
                cond,
                lhs,
                rhs,
                target,
            } => write!(f, "b{} {}, {}, {:#x}", cond.name(), lhs, rhs, target),
            Insn::BranchImm {
                cond,
                lhs,
                imm,
                target,
            } => write!(f, "b{} {}, {}, {:#x}", cond.name(), lhs, imm, target),
            Insn::Call { target } => write!(f, "call {:#x}", target),
            Insn::CallReg { target } => write!(f, "call {}", target),
            Insn::Ret => write!(f, "ret"),
            Insn::Push { src } => write!(f, "push {}", src),
            Insn::Pop { dst } => write!(f, "pop {}", dst),
            Insn::CallRuntime { entry } => write!(f, "callrt {:#x}", entry),
            Insn::CallRuntimeFloat { entry } => write!(f, "callrtf {:#x}", entry),
            Insn::CallNative { target } => write!(f, "callnative {}", target),
            Insn::Membar { kind } => write!(f, "membar {:?}", kind),
            Insn::Trap { code } => write!(f, "trap \"{}\"", code),
        }
    }
}

/// Disassemble `bytes` located at `base`, one line per instruction.
pub fn disassemble(bytes: &[u8], base: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let pc = base + pos;
        match decode(&bytes[pos..], pc) {
            Ok((insn, len)) => {
                out.push(format!("{:#014x}:  {}", pc, insn));
                pos += len;
            }
            Err(e) => {
                out.push(format!("{:#014x}:  <{}>", pc, e));
                break;
            }
        }
    }
    out
}

/// Emits the portable ISA.
pub struct PortableAssembler {
    buf: CodeBuffer,
    error: Option<String>,
}

impl PortableAssembler {
    fn op(&mut self, opcode: u8) {
        self.buf.emit_u8(opcode);
    }

    fn reg(&mut self, r: Reg) {
        self.buf.emit_u8(r as u8);
    }

    fn freg(&mut self, r: FReg) {
        self.buf.emit_u8(r as u8);
    }

    fn width_ext(&mut self, width: Width, ext: Extend) {
        let e = if ext == Extend::Sign { 0x10 } else { 0 };
        self.buf.emit_u8(width as u8 | e);
    }

    fn address(&mut self, a: Address) {
        self.reg(a.base);
        self.buf.emit_i32(a.disp);
    }

    fn indexed(&mut self, a: Indexed, extra: Option<u8>) {
        self.reg(a.base);
        self.reg(a.index);
        self.buf.emit_u8(a.shift);
        if let Some(extra) = extra {
            self.buf.emit_u8(extra);
        }
        self.buf.emit_i32(a.disp);
    }

    fn abs_target(&mut self, target: usize) {
        if let Err(e) = self.buf.emit_abs_rel32(target, 0) {
            self.error.get_or_insert(e);
        }
    }
}

impl MacroAssembler for PortableAssembler {
    fn new(base: usize) -> Self {
        Self {
            buf: CodeBuffer::new(base),
            error: None,
        }
    }

    fn backend_name() -> &'static str {
        "portable"
    }

    fn pc(&self) -> usize {
        self.buf.pc()
    }

    fn finish(self) -> Result<Vec<u8>, String> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.buf.finish()
    }

    fn align(&mut self, alignment: usize) {
        self.buf.align(alignment, op::NOP);
    }

    fn create_label(&mut self) -> Label {
        self.buf.create_label()
    }

    fn bind(&mut self, label: Label) {
        self.buf.bind_label(label);
    }

    fn mov(&mut self, dst: Reg, src: Reg) {
        if dst == src {
            return;
        }
        self.op(op::MOV);
        self.reg(dst);
        self.reg(src);
    }

    fn mov_imm(&mut self, dst: Reg, imm: i64) {
        self.op(op::MOV_IMM);
        self.reg(dst);
        self.buf.emit_u64(imm as u64);
    }

    fn load(&mut self, dst: Reg, src: Address, width: Width, ext: Extend) {
        self.op(op::LOAD);
        self.reg(dst);
        self.width_ext(width, ext);
        self.address(src);
    }

    fn store(&mut self, src: Reg, dst: Address, width: Width) {
        self.op(op::STORE);
        self.reg(src);
        self.width_ext(width, Extend::Zero);
        self.address(dst);
    }

    fn load_indexed(&mut self, dst: Reg, src: Indexed, width: Width, ext: Extend) {
        self.op(op::LOAD_IDX);
        self.reg(dst);
        let e = if ext == Extend::Sign { 0x10 } else { 0 };
        self.indexed(src, Some(width as u8 | e));
    }

    fn store_indexed(&mut self, src: Reg, dst: Indexed, width: Width) {
        self.op(op::STORE_IDX);
        self.reg(src);
        self.indexed(dst, Some(width as u8));
    }

    fn lea(&mut self, dst: Reg, src: Address) {
        self.op(op::LEA);
        self.reg(dst);
        self.address(src);
    }

    fn lea_indexed(&mut self, dst: Reg, src: Indexed) {
        self.op(op::LEA_IDX);
        self.reg(dst);
        self.indexed(src, None);
    }

    fn load_be(&mut self, dst: Reg, src: Address, width: Width, ext: Extend) {
        debug_assert!(matches!(width, Width::W16 | Width::W32));
        self.op(op::LOAD_BE);
        self.reg(dst);
        self.width_ext(width, ext);
        self.address(src);
    }

    fn extend(&mut self, dst: Reg, src: Reg, width: Width, ext: Extend) {
        self.op(op::EXTEND);
        self.reg(dst);
        self.reg(src);
        self.width_ext(width, ext);
    }

    fn alu(&mut self, aop: AluOp, size: OpSize, dst: Reg, lhs: Reg, rhs: Reg) {
        self.op(op::ALU);
        self.buf.emit_u8(aop as u8);
        self.buf.emit_u8(size as u8);
        self.reg(dst);
        self.reg(lhs);
        self.reg(rhs);
    }

    fn alu_imm(&mut self, aop: AluOp, size: OpSize, dst: Reg, lhs: Reg, imm: i32) {
        self.op(op::ALU_IMM);
        self.buf.emit_u8(aop as u8);
        self.buf.emit_u8(size as u8);
        self.reg(dst);
        self.reg(lhs);
        self.buf.emit_i32(imm);
    }

    fn neg(&mut self, size: OpSize, dst: Reg, src: Reg) {
        self.op(op::NEG);
        self.buf.emit_u8(size as u8);
        self.reg(dst);
        self.reg(src);
    }

    fn fload(&mut self, dst: FReg, src: Address, precision: Precision) {
        self.op(op::FLOAD);
        self.freg(dst);
        self.address(src);
        self.buf.emit_u8(precision as u8);
    }

    fn fstore(&mut self, src: FReg, dst: Address, precision: Precision) {
        self.op(op::FSTORE);
        self.freg(src);
        self.address(dst);
        self.buf.emit_u8(precision as u8);
    }

    fn fload_indexed(&mut self, dst: FReg, src: Indexed, precision: Precision) {
        self.op(op::FLOAD_IDX);
        self.freg(dst);
        self.indexed(src, Some(precision as u8));
    }

    fn fstore_indexed(&mut self, src: FReg, dst: Indexed, precision: Precision) {
        self.op(op::FSTORE_IDX);
        self.freg(src);
        self.indexed(dst, Some(precision as u8));
    }

    fn fmov(&mut self, dst: FReg, src: FReg) {
        if dst == src {
            return;
        }
        self.op(op::FMOV);
        self.freg(dst);
        self.freg(src);
    }

    fn fmov_to_int(&mut self, dst: Reg, src: FReg, precision: Precision) {
        self.op(op::FMOV_TO_INT);
        self.reg(dst);
        self.freg(src);
        self.buf.emit_u8(precision as u8);
    }

    fn fmov_from_int(&mut self, dst: FReg, src: Reg, precision: Precision) {
        self.op(op::FMOV_FROM_INT);
        self.freg(dst);
        self.reg(src);
        self.buf.emit_u8(precision as u8);
    }

    fn falu(&mut self, fop: FloatOp, precision: Precision, dst: FReg, lhs: FReg, rhs: FReg) {
        self.op(op::FALU);
        self.buf.emit_u8(fop as u8);
        self.buf.emit_u8(precision as u8);
        self.freg(dst);
        self.freg(lhs);
        self.freg(rhs);
    }

    fn funary(&mut self, fop: FloatUnary, precision: Precision, dst: FReg, src: FReg) {
        self.op(op::FUNARY);
        self.buf.emit_u8(fop as u8);
        self.buf.emit_u8(precision as u8);
        self.freg(dst);
        self.freg(src);
    }

    fn fcmp(&mut self, dst: Reg, lhs: FReg, rhs: FReg, precision: Precision, nan: NanOrder) {
        self.op(op::FCMP);
        self.reg(dst);
        self.freg(lhs);
        self.freg(rhs);
        self.buf.emit_u8(precision as u8);
        self.buf.emit_u8(nan as u8);
    }

    fn int_to_float(&mut self, conv: IntToFloat, dst: FReg, src: Reg) {
        self.op(op::I2F);
        self.buf.emit_u8(conv as u8);
        self.freg(dst);
        self.reg(src);
    }

    fn float_to_int(&mut self, conv: FloatToInt, dst: Reg, src: FReg) {
        self.op(op::F2I);
        self.buf.emit_u8(conv as u8);
        self.reg(dst);
        self.freg(src);
    }

    fn float_to_float(&mut self, conv: FloatToFloat, dst: FReg, src: FReg) {
        self.op(op::F2F);
        self.buf.emit_u8(conv as u8);
        self.freg(dst);
        self.freg(src);
    }

    fn jump(&mut self, label: Label) {
        self.op(op::JUMP);
        self.buf.emit_label_rel32(label, 0);
    }

    fn jump_to(&mut self, target: usize) {
        self.op(op::JUMP);
        self.abs_target(target);
    }

    fn jump_reg(&mut self, target: Reg) {
        self.op(op::JUMP_REG);
        self.reg(target);
    }

    fn branch(&mut self, cond: Cond, lhs: Reg, rhs: Reg, label: Label) {
        self.op(op::BRANCH);
        self.buf.emit_u8(cond as u8);
        self.reg(lhs);
        self.reg(rhs);
        self.buf.emit_label_rel32(label, 0);
    }

    fn branch_imm(&mut self, cond: Cond, lhs: Reg, imm: i32, label: Label) {
        self.op(op::BRANCH_IMM);
        self.buf.emit_u8(cond as u8);
        self.reg(lhs);
        self.buf.emit_i32(imm);
        self.buf.emit_label_rel32(label, 0);
    }

    fn call_to(&mut self, target: usize) {
        self.op(op::CALL);
        self.abs_target(target);
    }

    fn call_reg(&mut self, target: Reg) {
        self.op(op::CALL_REG);
        self.reg(target);
    }

    fn ret(&mut self) {
        self.op(op::RET);
    }

    fn push(&mut self, src: Reg) {
        self.op(op::PUSH);
        self.reg(src);
    }

    fn pop(&mut self, dst: Reg) {
        self.op(op::POP);
        self.reg(dst);
    }

    fn call_runtime(&mut self, entry: usize) {
        self.op(op::CALL_RUNTIME);
        self.buf.emit_u64(entry as u64);
    }

    fn call_runtime_float(&mut self, entry: usize) {
        self.op(op::CALL_RUNTIME_FLOAT);
        self.buf.emit_u64(entry as u64);
    }

    fn call_native(&mut self, target: Reg) {
        self.op(op::CALL_NATIVE);
        self.reg(target);
    }

    fn membar(&mut self, kind: Membar) {
        self.op(op::MEMBAR);
        self.buf.emit_u8(kind as u8);
    }

    fn trap(&mut self, code: TrapCode) {
        self.op(op::TRAP);
        self.buf.emit_u16(code as u16);
    }

    fn nop(&mut self) {
        self.op(op::NOP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(base: usize, f: impl FnOnce(&mut PortableAssembler)) -> Vec<u8> {
        let mut masm = PortableAssembler::new(base);
        f(&mut masm);
        masm.finish().unwrap()
    }

    fn decode_all(bytes: &[u8], base: usize) -> Vec<Insn> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (insn, len) = decode(&bytes[pos..], base + pos).unwrap();
            assert_eq!(insn_len(bytes[pos]), Some(len));
            out.push(insn);
            pos += len;
        }
        out
    }

    #[test]
    fn test_lengths_match_encoder() {
        let code = assemble(0x4000, |m| {
            let l = m.create_label();
            m.bind(l);
            m.mov(Reg::R0, Reg::R1);
            m.mov_imm(Reg::Tos, -5);
            m.load(Reg::R2, Address::new(Reg::Fp, -24), Width::W32, Extend::Sign);
            m.store_indexed(Reg::R1, Indexed::new(Reg::R2, Reg::R3, 2, 24), Width::W32);
            m.load_be(Reg::R1, Address::new(Reg::Bcp, 1), Width::W16, Extend::Zero);
            m.alu_imm(AluOp::Shl, OpSize::Long, Reg::R1, Reg::R1, 3);
            m.fcmp(Reg::Tos, FReg::F1, FReg::F0, Precision::Double, NanOrder::Greater);
            m.branch_imm(Cond::Ne, Reg::R0, 7, l);
            m.call_runtime(0xdead_beef);
            m.trap(TrapCode::ShouldNotReachHere);
        });
        let insns = decode_all(&code, 0x4000);
        assert_eq!(insns.len(), 10);
        assert_eq!(
            insns[2],
            Insn::Load {
                dst: Reg::R2,
                src: Address::new(Reg::Fp, -24),
                width: Width::W32,
                ext: Extend::Sign
            }
        );
        assert_eq!(
            insns[7],
            Insn::BranchImm {
                cond: Cond::Ne,
                lhs: Reg::R0,
                imm: 7,
                target: 0x4000
            }
        );
        assert_eq!(insns[8], Insn::CallRuntime { entry: 0xdead_beef });
    }

    #[test]
    fn test_absolute_jump_decodes_to_target() {
        let code = assemble(0x10_0000, |m| m.jump_to(0x10_0400));
        let (insn, _) = decode(&code, 0x10_0000).unwrap();
        assert_eq!(insn, Insn::Jump { target: 0x10_0400 });
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(decode(&[0xff], 0), Err(DecodeError::UnknownOpcode(0xff)));
        assert_eq!(decode(&[op::MOV_IMM, 0], 0), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_disassembly_lists_each_instruction() {
        let code = assemble(0x100, |m| {
            m.push(Reg::Fp);
            m.mov(Reg::Fp, Reg::Sp);
            m.ret();
        });
        let lines = disassemble(&code, 0x100);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("push fp"));
        assert!(lines[1].ends_with("mov fp, sp"));
        assert!(lines[2].ends_with("ret"));
    }
}
