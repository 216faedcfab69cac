//! x86-64 lowering of the macro-assembler interface.
//!
//! Abstract registers map onto the System V AMD64 registers so that the
//! argument registers line up with the C calling convention:
//!
//! | abstract | x86-64 |      | abstract | x86-64 |
//! |----------|--------|------|----------|--------|
//! | tos      | rax    |      | r0..r3   | rdi, rsi, rdx, rcx |
//! | method   | rbx    |      | r4, r5   | r8, r9 |
//! | bcp      | r13    |      | sp       | rsp    |
//! | locals   | r14    |      | fp       | rbp    |
//! | cache    | r12    |      | f0..f7   | xmm0..xmm7 |
//! | thread   | r15    |      | sender_sp| r10    |
//!
//! `r11` and `xmm15` are private scratch registers of this lowering.

use super::codebuf::CodeBuffer;
use super::masm::{
    self, Address, AluOp, Extend, FReg, FloatOp, FloatToFloat, FloatToInt, FloatUnary, Indexed,
    IntToFloat, Label, MacroAssembler, Membar, NanOrder, OpSize, Precision, TrapCode, Width,
};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

const SCRATCH: Gpr = Gpr::R11;
const XSCRATCH: u8 = 15;

impl Gpr {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

impl From<masm::Reg> for Gpr {
    fn from(r: masm::Reg) -> Gpr {
        use masm::Reg::*;
        match r {
            Tos => Gpr::Rax,
            Method => Gpr::Rbx,
            Bcp => Gpr::R13,
            Locals => Gpr::R14,
            Cache => Gpr::R12,
            Thread => Gpr::R15,
            SenderSp => Gpr::R10,
            R0 => Gpr::Rdi,
            R1 => Gpr::Rsi,
            R2 => Gpr::Rdx,
            R3 => Gpr::Rcx,
            R4 => Gpr::R8,
            R5 => Gpr::R9,
            Sp => Gpr::Rsp,
            Fp => Gpr::Rbp,
        }
    }
}

/// x86-64 condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    P = 0xA,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl From<masm::Cond> for Cc {
    fn from(c: masm::Cond) -> Cc {
        use masm::Cond::*;
        match c {
            Eq => Cc::E,
            Ne => Cc::Ne,
            Lt => Cc::L,
            Le => Cc::Le,
            Gt => Cc::G,
            Ge => Cc::Ge,
            Below => Cc::B,
            BelowEq => Cc::Be,
            Above => Cc::A,
            AboveEq => Cc::Ae,
        }
    }
}

/// A memory operand in x86 terms.
#[derive(Clone, Copy)]
struct Mem {
    base: Gpr,
    index: Option<(Gpr, u8)>,
    disp: i32,
}

impl From<Address> for Mem {
    fn from(a: Address) -> Mem {
        Mem {
            base: a.base.into(),
            index: None,
            disp: a.disp,
        }
    }
}

impl From<Indexed> for Mem {
    fn from(a: Indexed) -> Mem {
        Mem {
            base: a.base.into(),
            index: Some((a.index.into(), a.shift)),
            disp: a.disp,
        }
    }
}

/// x86-64 assembler implementing [`MacroAssembler`].
pub struct X86_64Assembler {
    buf: CodeBuffer,
    error: Option<String>,
}

impl X86_64Assembler {
    // ==================== Prefix and ModR/M helpers ====================

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    fn rex(&mut self, w: bool, reg: u8, index: u8, base: u8, force: bool) {
        let rex = 0x40
            | if w { 0x08 } else { 0 }
            | if reg >= 8 { 0x04 } else { 0 }
            | if index >= 8 { 0x02 } else { 0 }
            | if base >= 8 { 0x01 } else { 0 };
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
    }

    /// `[prefix] [REX] opcode modrm` with a register operand in r/m.
    fn op_rr(&mut self, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, rm: u8) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        self.rex(w, reg, 0, rm, false);
        self.buf.emit_bytes(opcode);
        self.buf.emit_u8(Self::modrm(0b11, reg, rm));
    }

    /// `[prefix] [REX] opcode modrm [sib] [disp]` with a memory operand.
    fn op_rm(&mut self, prefix: Option<u8>, w: bool, force_rex: bool, opcode: &[u8], reg: u8, mem: Mem) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        let index_num = mem.index.map(|(r, _)| r as u8).unwrap_or(0);
        self.rex(w, reg, index_num, mem.base as u8, force_rex);
        self.buf.emit_bytes(opcode);

        let base_code = mem.base.code();
        let mode = if mem.disp == 0 && base_code != 5 {
            0b00
        } else if (-128..=127).contains(&mem.disp) {
            0b01
        } else {
            0b10
        };
        match mem.index {
            Some((index, scale)) => {
                debug_assert!(index != Gpr::Rsp, "rsp cannot be an index");
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf
                    .emit_u8(((scale & 3) << 6) | (index.code() << 3) | base_code);
            }
            None if base_code == 4 => {
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(0x24);
            }
            None => self.buf.emit_u8(Self::modrm(mode, reg, base_code)),
        }
        match mode {
            0b01 => self.buf.emit_u8(mem.disp as u8),
            0b10 => self.buf.emit_i32(mem.disp),
            _ => {}
        }
    }

    fn note(&mut self, result: Result<(), String>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    // ==================== Instructions ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        self.op_rr(None, true, &[0x89], src as u8, dst as u8);
    }

    /// MOV r64, imm (shortest form)
    pub fn mov_ri(&mut self, dst: Gpr, imm: i64) {
        if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
            self.op_rr(None, true, &[0xC7], 0, dst as u8);
            self.buf.emit_i32(imm as i32);
        } else {
            self.rex(true, 0, 0, dst as u8, false);
            self.buf.emit_u8(0xB8 + dst.code());
            self.buf.emit_u64(imm as u64);
        }
    }

    /// MOVSXD r64, r32
    pub fn movsxd(&mut self, dst: Gpr, src: Gpr) {
        self.op_rr(None, true, &[0x63], dst as u8, src as u8);
    }

    /// MOV r32, r32 (zero-extends to 64-bit)
    pub fn mov_r32_r32(&mut self, dst: Gpr, src: Gpr) {
        self.op_rr(None, false, &[0x89], src as u8, dst as u8);
    }

    /// Two-operand ALU op `dst op= src` (ADD 01, OR 09, AND 21, SUB 29, XOR 31, CMP 39).
    fn alu_rr(&mut self, opcode: u8, w: bool, dst: Gpr, src: Gpr) {
        self.op_rr(None, w, &[opcode], src as u8, dst as u8);
    }

    /// Group-1 ALU op with imm32 (`/ext`).
    fn alu_ri(&mut self, ext: u8, w: bool, dst: Gpr, imm: i32) {
        self.op_rr(None, w, &[0x81], ext, dst as u8);
        self.buf.emit_i32(imm);
    }

    pub fn push_r(&mut self, reg: Gpr) {
        self.rex(false, 0, 0, reg as u8, false);
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop_r(&mut self, reg: Gpr) {
        self.rex(false, 0, 0, reg as u8, false);
        self.buf.emit_u8(0x58 + reg.code());
    }

    fn jcc_label(&mut self, cc: Cc, label: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cc as u8);
        self.buf.emit_label_rel32(label, 0);
    }

    fn jmp_label(&mut self, label: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_rel32(label, 0);
    }

    /// Store the scratch result into `dst`, sign-extending int results.
    fn writeback(&mut self, size: OpSize, dst: Gpr) {
        match size {
            OpSize::Int => self.movsxd(dst, SCRATCH),
            OpSize::Long => self.mov_rr(dst, SCRATCH),
        }
    }

    /// `r11 = r11 / r11-divisor` sequence shared by register and immediate
    /// forms. Expects the dividend in `lhs` and the divisor in r11.
    fn div_common(&mut self, op: AluOp, size: OpSize, dst: Gpr, lhs: Gpr) {
        let w = size == OpSize::Long;
        let div = self.buf.create_label();
        let done = self.buf.create_label();
        self.alu_ri(7, true, SCRATCH, -1);
        self.jcc_label(Cc::Ne, div);
        if op == AluOp::Div {
            self.mov_rr(SCRATCH, lhs);
            self.op_rr(None, w, &[0xF7], 3, SCRATCH as u8);
        } else {
            self.alu_rr(0x31, false, SCRATCH, SCRATCH);
        }
        self.jmp_label(done);

        self.buf.bind_label(div);
        self.push_r(Gpr::Rax);
        self.push_r(Gpr::Rdx);
        self.mov_rr(Gpr::Rax, lhs);
        if w {
            self.buf.emit_bytes(&[0x48, 0x99]); // CQO
        } else {
            self.buf.emit_u8(0x99); // CDQ
        }
        self.op_rr(None, w, &[0xF7], 7, SCRATCH as u8); // IDIV r11
        let result = if op == AluOp::Div { Gpr::Rax } else { Gpr::Rdx };
        self.mov_rr(SCRATCH, result);
        self.pop_r(Gpr::Rdx);
        self.pop_r(Gpr::Rax);
        self.buf.bind_label(done);
        self.writeback(size, dst);
    }

    fn shift_ext(op: AluOp) -> u8 {
        match op {
            AluOp::Shl => 4,
            AluOp::Ushr => 5,
            _ => 7,
        }
    }

    fn sse_prefix(precision: Precision) -> u8 {
        match precision {
            Precision::Single => 0xF3,
            Precision::Double => 0xF2,
        }
    }

    /// UCOMISS/UCOMISD
    fn ucomis(&mut self, precision: Precision, a: u8, b: u8) {
        let prefix = match precision {
            Precision::Single => None,
            Precision::Double => Some(0x66),
        };
        self.op_rr(prefix, false, &[0x0F, 0x2E], a, b);
    }

    /// MOVD/MOVQ r, xmm
    fn movq_r_xmm(&mut self, dst: Gpr, xmm: u8, precision: Precision) {
        self.op_rr(Some(0x66), precision == Precision::Double, &[0x0F, 0x7E], xmm, dst as u8);
    }

    /// MOVD/MOVQ xmm, r
    fn movq_xmm_r(&mut self, xmm: u8, src: Gpr, precision: Precision) {
        self.op_rr(Some(0x66), precision == Precision::Double, &[0x0F, 0x6E], xmm, src as u8);
    }

    /// MOVAPS xmm, xmm
    fn movaps(&mut self, dst: u8, src: u8) {
        self.op_rr(None, false, &[0x0F, 0x28], dst, src);
    }

    /// Realign rsp to 16 bytes around a C call and restore it afterwards.
    fn aligned_call(&mut self, entry: usize) {
        self.mov_rr(SCRATCH, Gpr::Rsp);
        self.op_rr(None, true, &[0x83], 4, Gpr::Rsp as u8); // AND rsp, -16
        self.buf.emit_u8(0xF0);
        self.push_r(SCRATCH);
        self.push_r(SCRATCH);
        self.mov_ri(Gpr::Rax, entry as i64);
        self.op_rr(None, false, &[0xFF], 2, Gpr::Rax as u8); // CALL rax
        self.pop_r(Gpr::Rsp);
    }

    pub fn code(&self) -> &[u8] {
        self.buf.code()
    }
}

impl MacroAssembler for X86_64Assembler {
    fn new(base: usize) -> Self {
        Self {
            buf: CodeBuffer::new(base),
            error: None,
        }
    }

    fn backend_name() -> &'static str {
        "x86-64"
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
        self.buf.align(alignment, 0x90);
    }

    fn create_label(&mut self) -> Label {
        self.buf.create_label()
    }

    fn bind(&mut self, label: Label) {
        self.buf.bind_label(label);
    }

    fn mov(&mut self, dst: masm::Reg, src: masm::Reg) {
        if dst != src {
            self.mov_rr(dst.into(), src.into());
        }
    }

    fn mov_imm(&mut self, dst: masm::Reg, imm: i64) {
        self.mov_ri(dst.into(), imm);
    }

    fn load(&mut self, dst: masm::Reg, src: Address, width: Width, ext: Extend) {
        let d = Gpr::from(dst) as u8;
        let m = Mem::from(src);
        match (width, ext) {
            (Width::W8, Extend::Zero) => self.op_rm(None, true, false, &[0x0F, 0xB6], d, m),
            (Width::W8, Extend::Sign) => self.op_rm(None, true, false, &[0x0F, 0xBE], d, m),
            (Width::W16, Extend::Zero) => self.op_rm(None, true, false, &[0x0F, 0xB7], d, m),
            (Width::W16, Extend::Sign) => self.op_rm(None, true, false, &[0x0F, 0xBF], d, m),
            (Width::W32, Extend::Zero) => self.op_rm(None, false, false, &[0x8B], d, m),
            (Width::W32, Extend::Sign) => self.op_rm(None, true, false, &[0x63], d, m),
            (Width::W64, _) => self.op_rm(None, true, false, &[0x8B], d, m),
        }
    }

    fn store(&mut self, src: masm::Reg, dst: Address, width: Width) {
        let s = Gpr::from(src) as u8;
        let m = Mem::from(dst);
        match width {
            Width::W8 => self.op_rm(None, false, true, &[0x88], s, m),
            Width::W16 => self.op_rm(Some(0x66), false, false, &[0x89], s, m),
            Width::W32 => self.op_rm(None, false, false, &[0x89], s, m),
            Width::W64 => self.op_rm(None, true, false, &[0x89], s, m),
        }
    }

    fn load_indexed(&mut self, dst: masm::Reg, src: Indexed, width: Width, ext: Extend) {
        let d = Gpr::from(dst) as u8;
        let m = Mem::from(src);
        match (width, ext) {
            (Width::W8, Extend::Zero) => self.op_rm(None, true, false, &[0x0F, 0xB6], d, m),
            (Width::W8, Extend::Sign) => self.op_rm(None, true, false, &[0x0F, 0xBE], d, m),
            (Width::W16, Extend::Zero) => self.op_rm(None, true, false, &[0x0F, 0xB7], d, m),
            (Width::W16, Extend::Sign) => self.op_rm(None, true, false, &[0x0F, 0xBF], d, m),
            (Width::W32, Extend::Zero) => self.op_rm(None, false, false, &[0x8B], d, m),
            (Width::W32, Extend::Sign) => self.op_rm(None, true, false, &[0x63], d, m),
            (Width::W64, _) => self.op_rm(None, true, false, &[0x8B], d, m),
        }
    }

    fn store_indexed(&mut self, src: masm::Reg, dst: Indexed, width: Width) {
        let s = Gpr::from(src) as u8;
        let m = Mem::from(dst);
        match width {
            Width::W8 => self.op_rm(None, false, true, &[0x88], s, m),
            Width::W16 => self.op_rm(Some(0x66), false, false, &[0x89], s, m),
            Width::W32 => self.op_rm(None, false, false, &[0x89], s, m),
            Width::W64 => self.op_rm(None, true, false, &[0x89], s, m),
        }
    }

    fn lea(&mut self, dst: masm::Reg, src: Address) {
        self.op_rm(None, true, false, &[0x8D], Gpr::from(dst) as u8, src.into());
    }

    fn lea_indexed(&mut self, dst: masm::Reg, src: Indexed) {
        self.op_rm(None, true, false, &[0x8D], Gpr::from(dst) as u8, src.into());
    }

    fn load_be(&mut self, dst: masm::Reg, src: Address, width: Width, ext: Extend) {
        let d = Gpr::from(dst);
        match width {
            Width::W16 => {
                self.op_rm(None, false, false, &[0x0F, 0xB7], d as u8, src.into());
                // ROL r16, 8
                self.op_rr(Some(0x66), false, &[0xC1], 0, d as u8);
                self.buf.emit_u8(8);
                let opcode = if ext == Extend::Sign { 0xBF } else { 0xB7 };
                self.op_rr(None, true, &[0x0F, opcode], d as u8, d as u8);
            }
            _ => {
                self.op_rm(None, false, false, &[0x8B], d as u8, src.into());
                // BSWAP r32
                self.rex(false, 0, 0, d as u8, false);
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0xC8 + d.code());
                if ext == Extend::Sign {
                    self.movsxd(d, d);
                }
            }
        }
    }

    fn extend(&mut self, dst: masm::Reg, src: masm::Reg, width: Width, ext: Extend) {
        let (d, s) = (Gpr::from(dst) as u8, Gpr::from(src) as u8);
        match (width, ext) {
            (Width::W8, Extend::Zero) => {
                self.rex(true, d, 0, s, true);
                self.buf.emit_bytes(&[0x0F, 0xB6]);
                self.buf.emit_u8(Self::modrm(0b11, d, s));
            }
            (Width::W8, Extend::Sign) => {
                self.rex(true, d, 0, s, true);
                self.buf.emit_bytes(&[0x0F, 0xBE]);
                self.buf.emit_u8(Self::modrm(0b11, d, s));
            }
            (Width::W16, Extend::Zero) => self.op_rr(None, true, &[0x0F, 0xB7], d, s),
            (Width::W16, Extend::Sign) => self.op_rr(None, true, &[0x0F, 0xBF], d, s),
            (Width::W32, Extend::Zero) => self.mov_r32_r32(dst.into(), src.into()),
            (Width::W32, Extend::Sign) => self.movsxd(dst.into(), src.into()),
            (Width::W64, _) => self.mov(dst, src),
        }
    }

    fn alu(&mut self, op: AluOp, size: OpSize, dst: masm::Reg, lhs: masm::Reg, rhs: masm::Reg) {
        let (d, l, r) = (Gpr::from(dst), Gpr::from(lhs), Gpr::from(rhs));
        let w = size == OpSize::Long;
        match op {
            AluOp::Div | AluOp::Rem => {
                self.mov_rr(SCRATCH, r);
                self.div_common(op, size, d, l);
                return;
            }
            AluOp::Shl | AluOp::Shr | AluOp::Ushr => {
                self.mov_rr(SCRATCH, l);
                if r != Gpr::Rcx {
                    self.push_r(Gpr::Rcx);
                    self.mov_rr(Gpr::Rcx, r);
                }
                self.op_rr(None, w, &[0xD3], Self::shift_ext(op), SCRATCH as u8);
                if r != Gpr::Rcx {
                    self.pop_r(Gpr::Rcx);
                }
            }
            AluOp::Mul => {
                self.mov_rr(SCRATCH, l);
                self.op_rr(None, w, &[0x0F, 0xAF], SCRATCH as u8, r as u8);
            }
            _ => {
                let opcode = match op {
                    AluOp::Add => 0x01,
                    AluOp::Sub => 0x29,
                    AluOp::And => 0x21,
                    AluOp::Or => 0x09,
                    _ => 0x31,
                };
                self.mov_rr(SCRATCH, l);
                self.alu_rr(opcode, w, SCRATCH, r);
            }
        }
        self.writeback(size, d);
    }

    fn alu_imm(&mut self, op: AluOp, size: OpSize, dst: masm::Reg, lhs: masm::Reg, imm: i32) {
        let (d, l) = (Gpr::from(dst), Gpr::from(lhs));
        let w = size == OpSize::Long;
        match op {
            AluOp::Div | AluOp::Rem => {
                self.mov_ri(SCRATCH, imm as i64);
                self.div_common(op, size, d, l);
                return;
            }
            AluOp::Shl | AluOp::Shr | AluOp::Ushr => {
                self.mov_rr(SCRATCH, l);
                self.op_rr(None, w, &[0xC1], Self::shift_ext(op), SCRATCH as u8);
                let mask = if w { 63 } else { 31 };
                self.buf.emit_u8((imm & mask) as u8);
            }
            AluOp::Mul => {
                self.op_rr(None, w, &[0x69], SCRATCH as u8, l as u8);
                self.buf.emit_i32(imm);
            }
            _ => {
                let ext = match op {
                    AluOp::Add => 0,
                    AluOp::Or => 1,
                    AluOp::And => 4,
                    AluOp::Sub => 5,
                    _ => 6,
                };
                self.mov_rr(SCRATCH, l);
                self.alu_ri(ext, w, SCRATCH, imm);
            }
        }
        self.writeback(size, d);
    }

    fn neg(&mut self, size: OpSize, dst: masm::Reg, src: masm::Reg) {
        self.mov_rr(SCRATCH, src.into());
        self.op_rr(None, size == OpSize::Long, &[0xF7], 3, SCRATCH as u8);
        self.writeback(size, dst.into());
    }

    fn fload(&mut self, dst: FReg, src: Address, precision: Precision) {
        self.op_rm(Some(Self::sse_prefix(precision)), false, false, &[0x0F, 0x10], dst as u8, src.into());
    }

    fn fstore(&mut self, src: FReg, dst: Address, precision: Precision) {
        self.op_rm(Some(Self::sse_prefix(precision)), false, false, &[0x0F, 0x11], src as u8, dst.into());
    }

    fn fload_indexed(&mut self, dst: FReg, src: Indexed, precision: Precision) {
        self.op_rm(Some(Self::sse_prefix(precision)), false, false, &[0x0F, 0x10], dst as u8, src.into());
    }

    fn fstore_indexed(&mut self, src: FReg, dst: Indexed, precision: Precision) {
        self.op_rm(Some(Self::sse_prefix(precision)), false, false, &[0x0F, 0x11], src as u8, dst.into());
    }

    fn fmov(&mut self, dst: FReg, src: FReg) {
        if dst != src {
            self.movaps(dst as u8, src as u8);
        }
    }

    fn fmov_to_int(&mut self, dst: masm::Reg, src: FReg, precision: Precision) {
        self.movq_r_xmm(dst.into(), src as u8, precision);
    }

    fn fmov_from_int(&mut self, dst: FReg, src: masm::Reg, precision: Precision) {
        self.movq_xmm_r(dst as u8, src.into(), precision);
    }

    fn falu(&mut self, op: FloatOp, precision: Precision, dst: FReg, lhs: FReg, rhs: FReg) {
        let opcode = match op {
            FloatOp::Add => 0x58,
            FloatOp::Mul => 0x59,
            FloatOp::Sub => 0x5C,
            FloatOp::Div => 0x5E,
        };
        self.movaps(XSCRATCH, lhs as u8);
        self.op_rr(Some(Self::sse_prefix(precision)), false, &[0x0F, opcode], XSCRATCH, rhs as u8);
        self.movaps(dst as u8, XSCRATCH);
    }

    fn funary(&mut self, op: FloatUnary, precision: Precision, dst: FReg, src: FReg) {
        match op {
            FloatUnary::Sqrt => {
                self.op_rr(Some(Self::sse_prefix(precision)), false, &[0x0F, 0x51], dst as u8, src as u8);
            }
            FloatUnary::Neg | FloatUnary::Abs => {
                let bit = if precision == Precision::Double { 63 } else { 31 };
                let ext = if op == FloatUnary::Neg { 7 } else { 6 }; // BTC / BTR
                self.movq_r_xmm(SCRATCH, src as u8, Precision::Double);
                self.op_rr(None, true, &[0x0F, 0xBA], ext, SCRATCH as u8);
                self.buf.emit_u8(bit);
                self.movq_xmm_r(dst as u8, SCRATCH, Precision::Double);
            }
        }
    }

    fn fcmp(&mut self, dst: masm::Reg, lhs: FReg, rhs: FReg, precision: Precision, nan: NanOrder) {
        let done = self.buf.create_label();
        self.ucomis(precision, lhs as u8, rhs as u8);
        let unordered = if nan == NanOrder::Less { -1 } else { 1 };
        self.mov_ri(SCRATCH, unordered);
        self.jcc_label(Cc::P, done);
        self.mov_ri(SCRATCH, -1);
        self.jcc_label(Cc::B, done);
        self.mov_ri(SCRATCH, 0);
        self.jcc_label(Cc::E, done);
        self.mov_ri(SCRATCH, 1);
        self.buf.bind_label(done);
        self.mov_rr(dst.into(), SCRATCH);
    }

    fn int_to_float(&mut self, conv: IntToFloat, dst: FReg, src: masm::Reg) {
        let (prefix, w) = match conv {
            IntToFloat::I2F => (0xF3, false),
            IntToFloat::I2D => (0xF2, false),
            IntToFloat::L2F => (0xF3, true),
            IntToFloat::L2D => (0xF2, true),
        };
        self.op_rr(Some(prefix), w, &[0x0F, 0x2A], dst as u8, Gpr::from(src) as u8);
    }

    fn float_to_int(&mut self, conv: FloatToInt, dst: masm::Reg, src: FReg) {
        let (precision, long) = match conv {
            FloatToInt::F2I => (Precision::Single, false),
            FloatToInt::F2L => (Precision::Single, true),
            FloatToInt::D2I => (Precision::Double, false),
            FloatToInt::D2L => (Precision::Double, true),
        };
        let done = self.buf.create_label();
        let nan = self.buf.create_label();
        // CVTTSS2SI / CVTTSD2SI
        self.op_rr(Some(Self::sse_prefix(precision)), long, &[0x0F, 0x2C], SCRATCH as u8, src as u8);
        if long {
            // Compare against 0x8000_0000_0000_0000 via rotate: rol 1 yields 1.
            self.op_rr(None, true, &[0xD1], 0, SCRATCH as u8);
            self.alu_ri(7, true, SCRATCH, 1);
            self.op_rr(None, true, &[0xD1], 1, SCRATCH as u8);
        } else {
            self.alu_ri(7, false, SCRATCH, i32::MIN);
        }
        self.jcc_label(Cc::Ne, done);
        self.ucomis(precision, src as u8, src as u8);
        self.jcc_label(Cc::P, nan);
        // xorps xmm15, xmm15
        self.op_rr(None, false, &[0x0F, 0x57], XSCRATCH, XSCRATCH);
        self.ucomis(precision, src as u8, XSCRATCH);
        self.jcc_label(Cc::B, done);
        if long {
            self.mov_ri(SCRATCH, i64::MAX);
        } else {
            self.mov_ri(SCRATCH, i32::MAX as i64);
        }
        self.jmp_label(done);
        self.buf.bind_label(nan);
        self.alu_rr(0x31, false, SCRATCH, SCRATCH);
        self.buf.bind_label(done);
        self.writeback(if long { OpSize::Long } else { OpSize::Int }, dst.into());
    }

    fn float_to_float(&mut self, conv: FloatToFloat, dst: FReg, src: FReg) {
        let prefix = match conv {
            FloatToFloat::F2D => 0xF3,
            FloatToFloat::D2F => 0xF2,
        };
        self.op_rr(Some(prefix), false, &[0x0F, 0x5A], dst as u8, src as u8);
    }

    fn jump(&mut self, label: Label) {
        self.jmp_label(label);
    }

    fn jump_to(&mut self, target: usize) {
        self.buf.emit_u8(0xE9);
        let r = self.buf.emit_abs_rel32(target, 0);
        self.note(r);
    }

    fn jump_reg(&mut self, target: masm::Reg) {
        self.op_rr(None, false, &[0xFF], 4, Gpr::from(target) as u8);
    }

    fn branch(&mut self, cond: masm::Cond, lhs: masm::Reg, rhs: masm::Reg, label: Label) {
        self.alu_rr(0x39, true, lhs.into(), rhs.into());
        self.jcc_label(cond.into(), label);
    }

    fn branch_imm(&mut self, cond: masm::Cond, lhs: masm::Reg, imm: i32, label: Label) {
        self.alu_ri(7, true, lhs.into(), imm);
        self.jcc_label(cond.into(), label);
    }

    fn call_to(&mut self, target: usize) {
        self.buf.emit_u8(0xE8);
        let r = self.buf.emit_abs_rel32(target, 0);
        self.note(r);
    }

    fn call_reg(&mut self, target: masm::Reg) {
        self.op_rr(None, false, &[0xFF], 2, Gpr::from(target) as u8);
    }

    fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    fn push(&mut self, src: masm::Reg) {
        self.push_r(src.into());
    }

    fn pop(&mut self, dst: masm::Reg) {
        self.pop_r(dst.into());
    }

    fn call_runtime(&mut self, entry: usize) {
        self.aligned_call(entry);
    }

    fn call_runtime_float(&mut self, entry: usize) {
        self.aligned_call(entry);
    }

    fn call_native(&mut self, target: masm::Reg) {
        self.call_reg(target);
    }

    fn membar(&mut self, kind: Membar) {
        if matches!(kind, Membar::StoreLoad | Membar::Full) {
            self.buf.emit_bytes(&[0x0F, 0xAE, 0xF0]); // MFENCE
        }
    }

    fn trap(&mut self, code: TrapCode) {
        self.op_rr(None, false, &[0xC7], 0, SCRATCH as u8);
        self.buf.emit_u32(code as u32);
        self.buf.emit_bytes(&[0x0F, 0x0B]); // UD2
    }

    fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::masm::Reg;

    fn asm(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut a = X86_64Assembler::new(0x1000);
        f(&mut a);
        a.finish().unwrap()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        assert_eq!(asm(|a| a.mov(Reg::Tos, Reg::Method)), [0x48, 0x89, 0xD8]);
        // MOV R9, R8 = 4D 89 C1
        assert_eq!(asm(|a| a.mov(Reg::R5, Reg::R4)), [0x4D, 0x89, 0xC1]);
    }

    #[test]
    fn test_mov_imm_forms() {
        assert_eq!(
            asm(|a| a.mov_imm(Reg::Thread, 42)),
            [0x49, 0xC7, 0xC7, 0x2A, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            asm(|a| a.mov_imm(Reg::Tos, 0x123456789ABCDEF0u64 as i64)),
            [0x48, 0xB8, 0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_memory_operands() {
        // MOV RAX, [RSP+8] = 48 8B 44 24 08
        assert_eq!(
            asm(|a| a.load_ptr(Reg::Tos, Reg::Sp, 8)),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        // MOV RDI, [R13+0] needs disp8 = 49 8B 7D 00
        assert_eq!(
            asm(|a| a.load_ptr(Reg::R0, Reg::Bcp, 0)),
            [0x49, 0x8B, 0x7D, 0x00]
        );
        // MOVZX RDI, BYTE [R13+1] = 49 0F B6 7D 01
        assert_eq!(
            asm(|a| a.load(Reg::R0, Address::new(Reg::Bcp, 1), Width::W8, Extend::Zero)),
            [0x49, 0x0F, 0xB6, 0x7D, 0x01]
        );
        // MOV [RBP-0x48], R13 = 4C 89 6D B8
        assert_eq!(
            asm(|a| a.store_ptr(Reg::Bcp, Reg::Fp, -0x48)),
            [0x4C, 0x89, 0x6D, 0xB8]
        );
        // MOV RDI, [R12 + RSI*8 + 0x10] = 49 8B 7C F4 10
        assert_eq!(
            asm(|a| a.load_indexed(
                Reg::R0,
                Indexed::new(Reg::Cache, Reg::R1, 3, 0x10),
                Width::W64,
                Extend::Zero
            )),
            [0x49, 0x8B, 0x7C, 0xF4, 0x10]
        );
    }

    #[test]
    fn test_push_pop_ret() {
        assert_eq!(
            asm(|a| {
                a.push(Reg::Method);
                a.push(Reg::Cache);
                a.pop(Reg::Cache);
                a.pop(Reg::Method);
                a.ret();
            }),
            [0x53, 0x41, 0x54, 0x41, 0x5C, 0x5B, 0xC3]
        );
    }

    #[test]
    fn test_branch_to_label() {
        let code = asm(|a| {
            let l = a.create_label();
            a.branch_imm(masm::Cond::Eq, Reg::Tos, 0, l);
            a.nop();
            a.bind(l);
        });
        // CMP RAX, 0 (48 81 F8 imm32) ; JE rel32 +1 ; NOP
        assert_eq!(&code[..3], &[0x48, 0x81, 0xF8]);
        assert_eq!(&code[7..9], &[0x0F, 0x84]);
        assert_eq!(&code[9..13], &1i32.to_le_bytes());
        assert_eq!(code[13], 0x90);
    }

    #[test]
    fn test_sse_scalar_ops() {
        // MOVSD XMM0, [RSP+8] = F2 0F 10 44 24 08
        assert_eq!(
            asm(|a| a.fload(FReg::F0, Address::new(Reg::Sp, 8), Precision::Double)),
            [0xF2, 0x0F, 0x10, 0x44, 0x24, 0x08]
        );
        // SQRTSD XMM0, XMM0 = F2 0F 51 C0
        assert_eq!(
            asm(|a| a.funary(FloatUnary::Sqrt, Precision::Double, FReg::F0, FReg::F0)),
            [0xF2, 0x0F, 0x51, 0xC0]
        );
    }
}
