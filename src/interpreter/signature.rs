//! Signature handlers: code that moves a native method's Java arguments
//! from its locals into the native calling convention.
//!
//! Handlers are shared by every method with the same fingerprint and are
//! generated on first use into a region of their own. Methods whose
//! signature does not fit a fingerprint use the slow handler, which does
//! the same work in the VM.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::codegen::masm::*;
use crate::codegen::memory::MemoryError;
use crate::vm::method::Method;
use crate::vm::oop::BasicType;

use super::codelet::{CodeletKind, CodeletQueue};
use super::frame;

/// Parameters a fingerprint can describe.
pub const MAX_FINGERPRINT_PARAMS: usize = 13;
const PARAM_SHIFT: u32 = 5;
const TYPE_BITS: u32 = 4;
const COUNT_SHIFT: u32 = 57;

/// Integer argument registers after the environment and receiver.
const INT_ARG_REGS: [Reg; 4] = [Reg::R2, Reg::R3, Reg::R4, Reg::R5];

/// Static flag, result type and parameter types packed into one word, or
/// `None` when the method has too many parameters.
pub fn fingerprint(is_static: bool, params: &[BasicType], result: BasicType) -> Option<u64> {
    if params.len() > MAX_FINGERPRINT_PARAMS {
        return None;
    }
    let mut fp = is_static as u64;
    fp |= ((result as u64) - 4) << 1;
    for (i, ty) in params.iter().enumerate() {
        fp |= ((*ty as u64) - 4) << (PARAM_SHIFT + TYPE_BITS * i as u32);
    }
    // the parameter count disambiguates trailing booleans (code 0)
    fp |= (params.len() as u64) << COUNT_SHIFT;
    Some(fp)
}

pub fn method_fingerprint(method: &Method) -> Option<u64> {
    let sig = method.signature();
    fingerprint(method.is_static(), &sig.params, sig.result)
}

/// Where one native argument comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSource {
    /// Handle to the receiver (local 0)
    Receiver,
    /// Handle to the holder's mirror in the frame
    Mirror,
    /// A parameter in local slot `slot`; two-slot values are read from
    /// `slot + 1`
    Local { slot: usize, ty: BasicType },
}

/// Where one native argument goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    /// Integer argument register `R{0}`
    Int(usize),
    Float(usize),
    /// Outgoing stack word
    Stack(usize),
}

/// Assign every argument after the environment pointer to a location.
pub fn assign(is_static: bool, params: &[BasicType]) -> Vec<(ArgSource, ArgLocation)> {
    let mut out = Vec::with_capacity(params.len() + 1);
    let first = if is_static { ArgSource::Mirror } else { ArgSource::Receiver };
    out.push((first, ArgLocation::Int(1)));
    let mut slot = if is_static { 0 } else { 1 };
    let mut ints = 0;
    let mut floats = 0;
    let mut stack = 0;
    for ty in params {
        let is_float = matches!(ty, BasicType::Float | BasicType::Double);
        let location = if is_float && floats < NUM_FREGS {
            floats += 1;
            ArgLocation::Float(floats - 1)
        } else if !is_float && ints < INT_ARG_REGS.len() {
            ints += 1;
            ArgLocation::Int(ints + 1)
        } else {
            stack += 1;
            ArgLocation::Stack(stack - 1)
        };
        out.push((ArgSource::Local { slot, ty: *ty }, location));
        slot += ty.slots();
    }
    out
}

fn local_address(source_slot: usize, ty: BasicType) -> Address {
    let slot = source_slot + if ty.slots() == 2 { 1 } else { 0 };
    Address::new(Reg::Locals, -(slot as i32) * 8)
}

fn int_reg(index: usize) -> Reg {
    match index {
        1 => Reg::R1,
        2 => Reg::R2,
        3 => Reg::R3,
        4 => Reg::R4,
        _ => Reg::R5,
    }
}

/// Load an integer-class argument into `dst`. Object arguments become
/// the address of their local, or 0 for null.
fn load_int_arg<M: MacroAssembler>(m: &mut M, dst: Reg, source: ArgSource) {
    match source {
        ArgSource::Receiver => m.mov(dst, Reg::Locals),
        ArgSource::Mirror => m.lea(dst, Address::new(Reg::Fp, frame::MIRROR)),
        ArgSource::Local { slot, ty } if ty.is_reference() => {
            let addr = local_address(slot, ty);
            let done = m.create_label();
            m.lea(dst, addr);
            m.load_ptr(Reg::R0, Reg::Locals, addr.disp);
            m.branch_imm(Cond::Ne, Reg::R0, 0, done);
            m.mov_imm(dst, 0);
            m.bind(done);
        }
        ArgSource::Local { slot, ty } => m.load(dst, local_address(slot, ty), Width::W64, Extend::Zero),
    }
}

/// Emit the handler for a fingerprinted signature. Called with the frame
/// registers of the native method; returns with the arguments in place.
pub fn generate_handler<M: MacroAssembler>(m: &mut M, is_static: bool, params: &[BasicType]) {
    for (source, location) in assign(is_static, params) {
        match location {
            ArgLocation::Int(i) => load_int_arg(m, int_reg(i), source),
            ArgLocation::Float(i) => {
                if let ArgSource::Local { slot, ty } = source {
                    let prec = if ty == BasicType::Float { Precision::Single } else { Precision::Double };
                    m.fload(FReg::ALL[i], local_address(slot, ty), prec);
                }
            }
            ArgLocation::Stack(k) => {
                // skip the return address of the handler call
                load_int_arg(m, Reg::R0, source);
                m.store_ptr(Reg::R0, Reg::Sp, 8 + 8 * k as i32);
            }
        }
    }
    m.ret();
}

fn decode(fp: u64) -> (bool, Vec<BasicType>) {
    let count = ((fp >> COUNT_SHIFT) & 0xf) as usize;
    let params = (0..count)
        .filter_map(|i| {
            let code = (fp >> (PARAM_SHIFT + TYPE_BITS * i as u32)) & 0xf;
            BasicType::from_u8(code as u8 + 4)
        })
        .collect();
    (fp & 1 != 0, params)
}

struct Library {
    queue: CodeletQueue,
    handlers: HashMap<u64, usize>,
}

pub struct SignatureHandlerLibrary {
    inner: Mutex<Library>,
    base: usize,
    capacity: usize,
}

impl SignatureHandlerLibrary {
    pub fn new(capacity: usize, fill: u8) -> Result<Self, MemoryError> {
        let queue = CodeletQueue::new(capacity, fill)?;
        let base = queue.base();
        let capacity = queue.capacity();
        Ok(Self {
            inner: Mutex::new(Library {
                queue,
                handlers: HashMap::new(),
            }),
            base,
            capacity,
        })
    }

    /// Handler for `method`, generating it on first use. Falls back to
    /// `slow_handler` when the signature has no fingerprint or the region
    /// is full.
    pub fn handler_for<M: MacroAssembler>(&self, method: &Method, slow_handler: usize) -> usize {
        let Some(fp) = method_fingerprint(method) else {
            return slow_handler;
        };
        let mut lib = self.inner.lock();
        if let Some(addr) = lib.handlers.get(&fp) {
            return *addr;
        }
        let (is_static, params) = decode(fp);
        let mut m = M::new(lib.queue.next_start());
        generate_handler(&mut m, is_static, &params);
        let code = match m.finish() {
            Ok(code) => code,
            Err(e) => {
                log::warn!("signature handler for {:#x}: {}", fp, e);
                return slow_handler;
            }
        };
        let name = format!("signature handler {:#x}", fp);
        match lib.queue.commit(CodeletKind::EntryStub, &name, &code) {
            Ok(addr) => {
                log::debug!("{} for {} at {:#x}", name, method.qualified_name(), addr);
                lib.handlers.insert(fp, addr);
                addr
            }
            Err(e) => {
                log::warn!("signature handler library: {}", e);
                slow_handler
            }
        }
    }

    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.base && pc < self.base + self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the handler containing `pc`.
    pub fn name_of(&self, pc: usize) -> Option<String> {
        let lib = self.inner.lock();
        lib.queue.stub_containing(pc).map(|c| c.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_roundtrips_and_distinguishes_arity() {
        let params = [BasicType::Int, BasicType::Double, BasicType::Object];
        let fp = fingerprint(true, &params, BasicType::Long).unwrap();
        let (is_static, decoded) = decode(fp);
        assert!(is_static);
        assert_eq!(decoded, params);

        let one = fingerprint(false, &[BasicType::Boolean], BasicType::Void).unwrap();
        let none = fingerprint(false, &[], BasicType::Void).unwrap();
        assert_ne!(one, none);
    }

    #[test]
    fn test_too_many_params_have_no_fingerprint() {
        let params = vec![BasicType::Int; MAX_FINGERPRINT_PARAMS + 1];
        assert!(fingerprint(true, &params, BasicType::Void).is_none());
    }

    #[test]
    fn test_assign_spills_to_stack() {
        let params = [
            BasicType::Int,
            BasicType::Long,
            BasicType::Float,
            BasicType::Object,
            BasicType::Int,
            BasicType::Int,
        ];
        let plan = assign(false, &params);
        assert_eq!(plan[0], (ArgSource::Receiver, ArgLocation::Int(1)));
        assert_eq!(plan[1].1, ArgLocation::Int(2));
        assert_eq!(plan[2], (ArgSource::Local { slot: 2, ty: BasicType::Long }, ArgLocation::Int(3)));
        assert_eq!(plan[3].1, ArgLocation::Float(0));
        assert_eq!(plan[4].1, ArgLocation::Int(4));
        assert_eq!(plan[5].1, ArgLocation::Int(5));
        assert_eq!(plan[6].1, ArgLocation::Stack(0));
    }

    #[test]
    fn test_static_methods_pass_the_mirror() {
        let plan = assign(true, &[BasicType::Double]);
        assert_eq!(plan[0].0, ArgSource::Mirror);
        assert_eq!(plan[1], (ArgSource::Local { slot: 0, ty: BasicType::Double }, ArgLocation::Float(0)));
    }
}
