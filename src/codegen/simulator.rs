//! Executes portable-ISA code where it lies in memory.
//!
//! The machine has no memory of its own: loads and stores go straight to
//! the addresses computed by the generated code (thread stacks, heap
//! objects, method metadata). Runtime entries and native functions are
//! real `extern "C"` functions called through their addresses, so the same
//! runtime serves any backend.

use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering, fence};

use super::masm::*;
use super::portable::{DecodeError, Insn, decode, insn_len};

/// Return address pushed by [`Machine::call`]; returning to it ends the run.
pub const HOST_RETURN: usize = 0x8;

/// Addresses below this are never valid for generated code.
const NULL_PAGE: usize = 4096;

/// Signature of every integer runtime entry called from generated code.
pub type RuntimeEntry = extern "C" fn(usize, usize, usize, usize) -> usize;

/// Signature of float runtime entries (`F0 = f(F0, F1)`).
pub type FloatRuntimeEntry = extern "C" fn(f64, f64) -> f64;

/// Register and stack arguments of a native call, as seen by the callee.
#[repr(C)]
#[derive(Debug)]
pub struct NativeArgs {
    pub ints: [u64; 6],
    pub floats: [u64; NUM_FREGS],
    /// First stack-passed argument word.
    pub stack: *const u64,
}

/// Signature of native method implementations. The result is returned as
/// raw bits and lands in both result registers.
pub type NativeFn = extern "C" fn(&NativeArgs) -> u64;

/// Where executable code may be fetched from.
pub trait CodeSpace {
    fn contains(&self, pc: usize) -> bool;
    /// Name of the codelet at `pc`, for diagnostics.
    fn describe(&self, pc: usize) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    Trap { code: TrapCode, pc: usize },
    Decode { error: DecodeError, pc: usize },
    BadPc(usize),
    NullAccess { addr: usize, pc: usize },
    DivideByZero { pc: usize },
}

impl std::fmt::Display for MachineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineError::Trap { code, pc } => write!(f, "trap at {:#x}: {}", pc, code),
            MachineError::Decode { error, pc } => write!(f, "cannot decode at {:#x}: {}", pc, error),
            MachineError::BadPc(pc) => write!(f, "pc {:#x} outside generated code", pc),
            MachineError::NullAccess { addr, pc } => {
                write!(f, "access to {:#x} at {:#x}", addr, pc)
            }
            MachineError::DivideByZero { pc } => write!(f, "unchecked division by zero at {:#x}", pc),
        }
    }
}

impl std::error::Error for MachineError {}

impl MachineError {
    pub fn pc(&self) -> usize {
        match self {
            MachineError::Trap { pc, .. }
            | MachineError::Decode { pc, .. }
            | MachineError::NullAccess { pc, .. }
            | MachineError::DivideByZero { pc } => *pc,
            MachineError::BadPc(pc) => *pc,
        }
    }
}

/// One hardware thread's worth of register state.
pub struct Machine {
    regs: [u64; NUM_REGS],
    fregs: [u64; NUM_FREGS],
    pc: usize,
    /// PC of the instruction being executed.
    current: usize,
    steps: u64,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            regs: [0; NUM_REGS],
            fregs: [0; NUM_FREGS],
            pc: 0,
            current: 0,
            steps: 0,
        }
    }

    pub fn reg(&self, r: Reg) -> u64 {
        self.regs[r.index()]
    }

    pub fn set_reg(&mut self, r: Reg, value: u64) {
        self.regs[r.index()] = value;
    }

    pub fn freg(&self, r: FReg) -> u64 {
        self.fregs[r.index()]
    }

    pub fn set_freg(&mut self, r: FReg, value: u64) {
        self.fregs[r.index()] = value;
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Call `entry` like a function: push [`HOST_RETURN`] and run until the
    /// callee returns to it.
    pub fn call(&mut self, entry: usize, code: &dyn CodeSpace) -> Result<(), MachineError> {
        self.current = entry;
        let sp = self.reg(Reg::Sp) as usize - 8;
        self.store(sp, Width::W64, HOST_RETURN as u64)?;
        self.set_reg(Reg::Sp, sp as u64);
        self.pc = entry;
        self.run(code)
    }

    pub fn run(&mut self, code: &dyn CodeSpace) -> Result<(), MachineError> {
        while self.pc != HOST_RETURN {
            let pc = self.pc;
            self.current = pc;
            if !code.contains(pc) {
                return Err(MachineError::BadPc(pc));
            }
            let opcode = unsafe { *(pc as *const u8) };
            let len = insn_len(opcode).ok_or(MachineError::Decode {
                error: DecodeError::UnknownOpcode(opcode),
                pc,
            })?;
            if !code.contains(pc + len - 1) {
                return Err(MachineError::BadPc(pc + len - 1));
            }
            let bytes = unsafe { std::slice::from_raw_parts(pc as *const u8, len) };
            let (insn, _) = decode(bytes, pc).map_err(|error| MachineError::Decode { error, pc })?;
            self.pc = pc + len;
            self.steps += 1;
            self.exec(insn)?;
        }
        Ok(())
    }

    fn check(&self, addr: usize) -> Result<(), MachineError> {
        if addr < NULL_PAGE {
            return Err(MachineError::NullAccess {
                addr,
                pc: self.current,
            });
        }
        Ok(())
    }

    fn load(&self, addr: usize, width: Width) -> Result<u64, MachineError> {
        self.check(addr)?;
        // SAFETY: generated code only addresses VM-owned memory.
        let v = unsafe {
            match width {
                Width::W8 => (*(addr as *const AtomicU8)).load(Ordering::Relaxed) as u64,
                Width::W16 if addr % 2 == 0 => {
                    (*(addr as *const AtomicU16)).load(Ordering::Relaxed) as u64
                }
                Width::W32 if addr % 4 == 0 => {
                    (*(addr as *const AtomicU32)).load(Ordering::Relaxed) as u64
                }
                Width::W64 if addr % 8 == 0 => {
                    (*(addr as *const AtomicU64)).load(Ordering::Relaxed)
                }
                Width::W16 => std::ptr::read_unaligned(addr as *const u16) as u64,
                Width::W32 => std::ptr::read_unaligned(addr as *const u32) as u64,
                Width::W64 => std::ptr::read_unaligned(addr as *const u64),
            }
        };
        Ok(v)
    }

    fn store(&self, addr: usize, width: Width, value: u64) -> Result<(), MachineError> {
        self.check(addr)?;
        // SAFETY: as for `load`.
        unsafe {
            match width {
                Width::W8 => (*(addr as *const AtomicU8)).store(value as u8, Ordering::Relaxed),
                Width::W16 if addr % 2 == 0 => {
                    (*(addr as *const AtomicU16)).store(value as u16, Ordering::Relaxed)
                }
                Width::W32 if addr % 4 == 0 => {
                    (*(addr as *const AtomicU32)).store(value as u32, Ordering::Relaxed)
                }
                Width::W64 if addr % 8 == 0 => {
                    (*(addr as *const AtomicU64)).store(value, Ordering::Relaxed)
                }
                Width::W16 => std::ptr::write_unaligned(addr as *mut u16, value as u16),
                Width::W32 => std::ptr::write_unaligned(addr as *mut u32, value as u32),
                Width::W64 => std::ptr::write_unaligned(addr as *mut u64, value),
            }
        }
        Ok(())
    }

    fn addr(&self, a: Address) -> usize {
        self.reg(a.base).wrapping_add(a.disp as i64 as u64) as usize
    }

    fn indexed(&self, a: Indexed) -> usize {
        self.reg(a.base)
            .wrapping_add(self.reg(a.index) << a.shift)
            .wrapping_add(a.disp as i64 as u64) as usize
    }

    fn push(&mut self, value: u64) -> Result<(), MachineError> {
        let sp = self.reg(Reg::Sp).wrapping_sub(8);
        self.store(sp as usize, Width::W64, value)?;
        self.set_reg(Reg::Sp, sp);
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, MachineError> {
        let sp = self.reg(Reg::Sp);
        let v = self.load(sp as usize, Width::W64)?;
        self.set_reg(Reg::Sp, sp + 8);
        Ok(v)
    }

    fn exec(&mut self, insn: Insn) -> Result<(), MachineError> {
        match insn {
            Insn::Nop => {}
            Insn::Mov { dst, src } => self.set_reg(dst, self.reg(src)),
            Insn::MovImm { dst, imm } => self.set_reg(dst, imm as u64),
            Insn::Load { dst, src, width, ext } => {
                let v = self.load(self.addr(src), width)?;
                self.set_reg(dst, extend(v, width, ext));
            }
            Insn::Store { src, dst, width } => self.store(self.addr(dst), width, self.reg(src))?,
            Insn::LoadIndexed { dst, src, width, ext } => {
                let v = self.load(self.indexed(src), width)?;
                self.set_reg(dst, extend(v, width, ext));
            }
            Insn::StoreIndexed { src, dst, width } => {
                self.store(self.indexed(dst), width, self.reg(src))?
            }
            Insn::Lea { dst, src } => self.set_reg(dst, self.addr(src) as u64),
            Insn::LeaIndexed { dst, src } => self.set_reg(dst, self.indexed(src) as u64),
            Insn::LoadBe { dst, src, width, ext } => {
                let base = self.addr(src);
                let mut v = 0u64;
                for i in 0..width.bytes() {
                    v = (v << 8) | self.load(base + i, Width::W8)?;
                }
                self.set_reg(dst, extend(v, width, ext));
            }
            Insn::Extend { dst, src, width, ext } => self.set_reg(dst, extend(self.reg(src), width, ext)),
            Insn::Alu { op, size, dst, lhs, rhs } => {
                let v = self.alu(op, size, self.reg(lhs), self.reg(rhs))?;
                self.set_reg(dst, v);
            }
            Insn::AluImm { op, size, dst, lhs, imm } => {
                let v = self.alu(op, size, self.reg(lhs), imm as i64 as u64)?;
                self.set_reg(dst, v);
            }
            Insn::Neg { size, dst, src } => {
                let v = match size {
                    OpSize::Int => (self.reg(src) as i32).wrapping_neg() as i64 as u64,
                    OpSize::Long => (self.reg(src) as i64).wrapping_neg() as u64,
                };
                self.set_reg(dst, v);
            }
            Insn::FLoad { dst, src, precision } => {
                let v = self.load(self.addr(src), precision.width())?;
                self.set_freg(dst, v);
            }
            Insn::FStore { src, dst, precision } => {
                self.store(self.addr(dst), precision.width(), self.freg(src))?
            }
            Insn::FLoadIndexed { dst, src, precision } => {
                let v = self.load(self.indexed(src), precision.width())?;
                self.set_freg(dst, v);
            }
            Insn::FStoreIndexed { src, dst, precision } => {
                self.store(self.indexed(dst), precision.width(), self.freg(src))?
            }
            Insn::FMov { dst, src } => self.set_freg(dst, self.freg(src)),
            Insn::FMovToInt { dst, src, precision } => {
                self.set_reg(dst, narrow_float(self.freg(src), precision))
            }
            Insn::FMovFromInt { dst, src, precision } => {
                self.set_freg(dst, narrow_float(self.reg(src), precision))
            }
            Insn::FAlu {
                op,
                precision,
                dst,
                lhs,
                rhs,
            } => {
                let (a, b) = (self.freg(lhs), self.freg(rhs));
                let v = match precision {
                    Precision::Single => {
                        let (x, y) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
                        let r = match op {
                            FloatOp::Add => x + y,
                            FloatOp::Sub => x - y,
                            FloatOp::Mul => x * y,
                            FloatOp::Div => x / y,
                        };
                        r.to_bits() as u64
                    }
                    Precision::Double => {
                        let (x, y) = (f64::from_bits(a), f64::from_bits(b));
                        let r = match op {
                            FloatOp::Add => x + y,
                            FloatOp::Sub => x - y,
                            FloatOp::Mul => x * y,
                            FloatOp::Div => x / y,
                        };
                        r.to_bits()
                    }
                };
                self.set_freg(dst, v);
            }
            Insn::FUnary {
                op,
                precision,
                dst,
                src,
            } => {
                let a = self.freg(src);
                let v = match precision {
                    Precision::Single => {
                        let x = a as u32;
                        (match op {
                            FloatUnary::Neg => x ^ 0x8000_0000,
                            FloatUnary::Abs => x & 0x7fff_ffff,
                            FloatUnary::Sqrt => f32::from_bits(x).sqrt().to_bits(),
                        }) as u64
                    }
                    Precision::Double => match op {
                        FloatUnary::Neg => a ^ (1 << 63),
                        FloatUnary::Abs => a & !(1 << 63),
                        FloatUnary::Sqrt => f64::from_bits(a).sqrt().to_bits(),
                    },
                };
                self.set_freg(dst, v);
            }
            Insn::FCmp {
                dst,
                lhs,
                rhs,
                precision,
                nan,
            } => {
                let (a, b) = (self.freg(lhs), self.freg(rhs));
                let ord = match precision {
                    Precision::Single => {
                        f32::from_bits(a as u32).partial_cmp(&f32::from_bits(b as u32))
                    }
                    Precision::Double => f64::from_bits(a).partial_cmp(&f64::from_bits(b)),
                };
                let v: i64 = match ord {
                    Some(std::cmp::Ordering::Less) => -1,
                    Some(std::cmp::Ordering::Equal) => 0,
                    Some(std::cmp::Ordering::Greater) => 1,
                    None => match nan {
                        NanOrder::Less => -1,
                        NanOrder::Greater => 1,
                    },
                };
                self.set_reg(dst, v as u64);
            }
            Insn::IntToFloat { conv, dst, src } => {
                let x = self.reg(src);
                let v = match conv {
                    IntToFloat::I2F => ((x as i32) as f32).to_bits() as u64,
                    IntToFloat::I2D => ((x as i32) as f64).to_bits(),
                    IntToFloat::L2F => ((x as i64) as f32).to_bits() as u64,
                    IntToFloat::L2D => ((x as i64) as f64).to_bits(),
                };
                self.set_freg(dst, v);
            }
            Insn::FloatToInt { conv, dst, src } => {
                let x = self.freg(src);
                // `as` saturates and maps NaN to zero, as Java requires.
                let v = match conv {
                    FloatToInt::F2I => (f32::from_bits(x as u32) as i32) as i64,
                    FloatToInt::F2L => f32::from_bits(x as u32) as i64,
                    FloatToInt::D2I => (f64::from_bits(x) as i32) as i64,
                    FloatToInt::D2L => f64::from_bits(x) as i64,
                };
                self.set_reg(dst, v as u64);
            }
            Insn::FloatToFloat { conv, dst, src } => {
                let x = self.freg(src);
                let v = match conv {
                    FloatToFloat::F2D => (f32::from_bits(x as u32) as f64).to_bits(),
                    FloatToFloat::D2F => (f64::from_bits(x) as f32).to_bits() as u64,
                };
                self.set_freg(dst, v);
            }
            Insn::Jump { target } => self.pc = target,
            Insn::JumpReg { target } => self.pc = self.reg(target) as usize,
            Insn::Branch {
                cond,
                lhs,
                rhs,
                target,
            } => {
                if cond.holds(self.reg(lhs), self.reg(rhs)) {
                    self.pc = target;
                }
            }
            Insn::BranchImm {
                cond,
                lhs,
                imm,
                target,
            } => {
                if cond.holds(self.reg(lhs), imm as i64 as u64) {
                    self.pc = target;
                }
            }
            Insn::Call { target } => {
                self.push(self.pc as u64)?;
                self.pc = target;
            }
            Insn::CallReg { target } => {
                let target = self.reg(target) as usize;
                self.push(self.pc as u64)?;
                self.pc = target;
            }
            Insn::Ret => self.pc = self.pop()? as usize,
            Insn::Push { src } => self.push(self.reg(src))?,
            Insn::Pop { dst } => {
                let v = self.pop()?;
                self.set_reg(dst, v);
            }
            Insn::CallRuntime { entry } => {
                self.check(entry)?;
                // SAFETY: runtime entries are emitted from `RuntimeEntry` items.
                let f: RuntimeEntry = unsafe { std::mem::transmute::<usize, RuntimeEntry>(entry) };
                let r = f(
                    self.reg(Reg::R0) as usize,
                    self.reg(Reg::R1) as usize,
                    self.reg(Reg::R2) as usize,
                    self.reg(Reg::R3) as usize,
                );
                self.set_reg(RET, r as u64);
            }
            Insn::CallRuntimeFloat { entry } => {
                self.check(entry)?;
                // SAFETY: as above, for `FloatRuntimeEntry` items.
                let f: FloatRuntimeEntry =
                    unsafe { std::mem::transmute::<usize, FloatRuntimeEntry>(entry) };
                let r = f(
                    f64::from_bits(self.freg(FReg::F0)),
                    f64::from_bits(self.freg(FReg::F1)),
                );
                self.set_freg(FRET, r.to_bits());
            }
            Insn::CallNative { target } => {
                let entry = self.reg(target) as usize;
                self.check(entry)?;
                let mut ints = [0u64; 6];
                for (slot, reg) in ints.iter_mut().zip(ARGS) {
                    *slot = self.reg(reg);
                }
                let args = NativeArgs {
                    ints,
                    floats: self.fregs,
                    stack: self.reg(Reg::Sp) as *const u64,
                };
                // SAFETY: native function addresses come from the native registry.
                let f: NativeFn = unsafe { std::mem::transmute::<usize, NativeFn>(entry) };
                let r = f(&args);
                self.set_reg(RET, r);
                self.set_freg(FRET, r);
            }
            Insn::Membar { kind } => match kind {
                Membar::StoreStore => fence(Ordering::Release),
                Membar::LoadLoad => fence(Ordering::Acquire),
                Membar::StoreLoad | Membar::Full => fence(Ordering::SeqCst),
            },
            Insn::Trap { code } => {
                return Err(MachineError::Trap {
                    code,
                    pc: self.current,
                });
            }
        }
        Ok(())
    }

    fn alu(&self, op: AluOp, size: OpSize, a: u64, b: u64) -> Result<u64, MachineError> {
        if matches!(op, AluOp::Div | AluOp::Rem) {
            let zero = match size {
                OpSize::Int => b as i32 == 0,
                OpSize::Long => b == 0,
            };
            if zero {
                return Err(MachineError::DivideByZero { pc: self.current });
            }
        }
        let v = match size {
            OpSize::Int => {
                let (x, y) = (a as i32, b as i32);
                let s = (y as u32) & 31;
                let r = match op {
                    AluOp::Add => x.wrapping_add(y),
                    AluOp::Sub => x.wrapping_sub(y),
                    AluOp::Mul => x.wrapping_mul(y),
                    AluOp::Div => x.wrapping_div(y),
                    AluOp::Rem => x.wrapping_rem(y),
                    AluOp::And => x & y,
                    AluOp::Or => x | y,
                    AluOp::Xor => x ^ y,
                    AluOp::Shl => x.wrapping_shl(s),
                    AluOp::Shr => x >> s,
                    AluOp::Ushr => ((x as u32) >> s) as i32,
                };
                r as i64 as u64
            }
            OpSize::Long => {
                let (x, y) = (a as i64, b as i64);
                let s = (y as u32) & 63;
                let r = match op {
                    AluOp::Add => x.wrapping_add(y),
                    AluOp::Sub => x.wrapping_sub(y),
                    AluOp::Mul => x.wrapping_mul(y),
                    AluOp::Div => x.wrapping_div(y),
                    AluOp::Rem => x.wrapping_rem(y),
                    AluOp::And => x & y,
                    AluOp::Or => x | y,
                    AluOp::Xor => x ^ y,
                    AluOp::Shl => x.wrapping_shl(s),
                    AluOp::Shr => x >> s,
                    AluOp::Ushr => ((x as u64) >> s) as i64,
                };
                r as u64
            }
        };
        Ok(v)
    }
}

fn extend(v: u64, width: Width, ext: Extend) -> u64 {
    match (width, ext) {
        (Width::W8, Extend::Zero) => v as u8 as u64,
        (Width::W8, Extend::Sign) => v as u8 as i8 as i64 as u64,
        (Width::W16, Extend::Zero) => v as u16 as u64,
        (Width::W16, Extend::Sign) => v as u16 as i16 as i64 as u64,
        (Width::W32, Extend::Zero) => v as u32 as u64,
        (Width::W32, Extend::Sign) => v as u32 as i32 as i64 as u64,
        (Width::W64, _) => v,
    }
}

fn narrow_float(bits: u64, precision: Precision) -> u64 {
    match precision {
        Precision::Single => bits & 0xffff_ffff,
        Precision::Double => bits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::memory::ExecutableMemory;
    use crate::codegen::portable::PortableAssembler;

    struct Region(usize, usize);

    impl CodeSpace for Region {
        fn contains(&self, pc: usize) -> bool {
            pc >= self.0 && pc < self.1
        }

        fn describe(&self, pc: usize) -> String {
            format!("test code +{:#x}", pc - self.0)
        }
    }

    fn run_code(f: impl FnOnce(&mut PortableAssembler), setup: impl FnOnce(&mut Machine)) -> Machine {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        let base = mem.base();
        let mut masm = PortableAssembler::new(base);
        f(&mut masm);
        let code = masm.finish().unwrap();
        mem.write(0, &code).unwrap();
        mem.make_executable().unwrap();

        let mut stack = vec![0u64; 256];
        let top = stack.as_mut_ptr() as usize + 256 * 8;
        let mut m = Machine::new();
        m.set_reg(Reg::Sp, top as u64);
        setup(&mut m);
        m.call(base, &Region(base, base + code.len())).unwrap();
        m
    }

    extern "C" fn add_runtime(a: usize, b: usize, _c: usize, _d: usize) -> usize {
        a + b
    }

    #[test]
    fn test_int_arithmetic_follows_java() {
        let m = run_code(
            |m| {
                m.alu(AluOp::Div, OpSize::Int, Reg::R2, Reg::R0, Reg::R1);
                m.alu(AluOp::Rem, OpSize::Int, Reg::R3, Reg::R0, Reg::R1);
                m.alu_imm(AluOp::Shl, OpSize::Int, Reg::R4, Reg::R1, 33);
                m.ret();
            },
            |m| {
                m.set_reg(Reg::R0, i32::MIN as i64 as u64);
                m.set_reg(Reg::R1, -1i64 as u64);
            },
        );
        assert_eq!(m.reg(Reg::R2) as i64, i32::MIN as i64);
        assert_eq!(m.reg(Reg::R3), 0);
        assert_eq!(m.reg(Reg::R4) as i64, -2);
    }

    #[test]
    fn test_loop_with_labels() {
        let m = run_code(
            |m| {
                let top = m.create_label();
                let done = m.create_label();
                m.mov_imm(Reg::Tos, 0);
                m.bind(top);
                m.branch_imm(Cond::Eq, Reg::R0, 0, done);
                m.alu(AluOp::Add, OpSize::Long, Reg::Tos, Reg::Tos, Reg::R0);
                m.add_imm(Reg::R0, Reg::R0, -1);
                m.jump(top);
                m.bind(done);
                m.ret();
            },
            |m| m.set_reg(Reg::R0, 10),
        );
        assert_eq!(m.reg(RET), 55);
    }

    #[test]
    fn test_runtime_call_and_stack() {
        let m = run_code(
            |m| {
                m.push(Reg::R1);
                m.call_runtime(add_runtime as RuntimeEntry as usize);
                m.pop(Reg::R2);
                m.ret();
            },
            |m| {
                m.set_reg(Reg::R0, 40);
                m.set_reg(Reg::R1, 2);
            },
        );
        assert_eq!(m.reg(RET), 42);
        assert_eq!(m.reg(Reg::R2), 2);
    }

    #[test]
    fn test_float_compare_and_conversion() {
        let m = run_code(
            |m| {
                m.fcmp(Reg::R0, FReg::F0, FReg::F1, Precision::Double, NanOrder::Less);
                m.float_to_int(FloatToInt::D2I, Reg::R1, FReg::F1);
                m.ret();
            },
            |m| {
                m.set_freg(FReg::F0, f64::NAN.to_bits());
                m.set_freg(FReg::F1, 1e20f64.to_bits());
            },
        );
        assert_eq!(m.reg(Reg::R0) as i64, -1);
        assert_eq!(m.reg(Reg::R1) as i64, i32::MAX as i64);
    }

    #[test]
    fn test_null_access_is_reported() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        let base = mem.base();
        let mut masm = PortableAssembler::new(base);
        masm.load_ptr(Reg::R0, Reg::R1, 8);
        masm.ret();
        let code = masm.finish().unwrap();
        mem.write(0, &code).unwrap();
        let mut stack = vec![0u64; 16];
        let mut m = Machine::new();
        m.set_reg(Reg::Sp, stack.as_mut_ptr() as u64 + 128);
        let err = m.call(base, &Region(base, base + code.len())).unwrap_err();
        assert_eq!(err, MachineError::NullAccess { addr: 8, pc: base });
    }
}
