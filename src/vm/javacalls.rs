//! Calls from the VM into Java code through the generated call stub.

use std::fmt;

use crate::codegen::masm::{FReg, Reg};
use crate::codegen::simulator::Machine;
use crate::error::{VmError, VmResult};
use crate::interpreter::stubs::StubId;

use super::bootstrap::names;
use super::method::Method;
use super::oop::{BasicType, Oop};
use super::thread::{JavaThread, ThreadState, popframe};

/// Gap left below the anchor of an outer activation for a nested call.
const NESTED_CALL_GAP: usize = 512;

/// A Java value passed to or returned from a call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JavaValue {
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(Oop),
}

impl JavaValue {
    /// The value as the interpreter holds it in a register.
    pub fn raw_bits(self) -> u64 {
        match self {
            JavaValue::Void => 0,
            JavaValue::Int(v) => v as i64 as u64,
            JavaValue::Long(v) => v as u64,
            JavaValue::Float(v) => v.to_bits() as u64,
            JavaValue::Double(v) => v.to_bits(),
            JavaValue::Object(o) => o.raw() as u64,
        }
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            JavaValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(self) -> Option<i64> {
        match self {
            JavaValue::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(self) -> Option<f64> {
        match self {
            JavaValue::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(self) -> Option<Oop> {
        match self {
            JavaValue::Object(o) => Some(o),
            _ => None,
        }
    }

    fn fits(self, ty: BasicType) -> bool {
        match (self, ty) {
            (JavaValue::Long(_), BasicType::Long)
            | (JavaValue::Float(_), BasicType::Float)
            | (JavaValue::Double(_), BasicType::Double) => true,
            (JavaValue::Int(_), t) => t.tos_state().is_int_like(),
            (JavaValue::Object(_), t) => t.is_reference(),
            _ => false,
        }
    }

    /// Read a result of type `ty` from the call stub's result registers.
    fn from_result(ty: BasicType, tos: u64, ftos: u64) -> JavaValue {
        match ty {
            BasicType::Void => JavaValue::Void,
            BasicType::Long => JavaValue::Long(tos as i64),
            BasicType::Float => JavaValue::Float(f32::from_bits(ftos as u32)),
            BasicType::Double => JavaValue::Double(f64::from_bits(ftos)),
            BasicType::Object | BasicType::Array => JavaValue::Object(Oop::from_raw(tos as usize)),
            _ => JavaValue::Int(tos as i32),
        }
    }
}

impl fmt::Display for JavaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JavaValue::Void => write!(f, "void"),
            JavaValue::Int(v) => write!(f, "{}", v),
            JavaValue::Long(v) => write!(f, "{}L", v),
            JavaValue::Float(v) => write!(f, "{:?}f", v),
            JavaValue::Double(v) => write!(f, "{:?}", v),
            JavaValue::Object(o) if o.is_null() => write!(f, "null"),
            JavaValue::Object(o) => write!(f, "{}@{:#x}", o.klass().name(), o.raw()),
        }
    }
}

pub struct JavaCalls;

impl JavaCalls {
    /// Call `method` with `args` (receiver first for instance methods) on
    /// `thread`. An exception that escapes the method is returned as
    /// [`VmError::UncaughtException`].
    pub fn call(thread: &JavaThread, method: &Method, args: &[JavaValue]) -> VmResult<JavaValue> {
        let words = argument_words(method, args)?;
        Self::call_with_words(thread, method, words, None)
    }

    /// Call from inside a runtime entry or native method, where the thread
    /// is stopped in an outer activation.
    pub fn call_in_vm(thread: &JavaThread, method: &Method, args: &[JavaValue]) -> VmResult<JavaValue> {
        Self::call(thread, method, args)
    }

    /// Enter the call stub with `entry` in place of the method's own entry.
    pub(crate) fn call_entry(thread: &JavaThread, method: &Method, entry: usize) -> VmResult<JavaValue> {
        Self::call_with_words(thread, method, Vec::new(), Some(entry))
    }

    fn call_with_words(
        thread: &JavaThread,
        method: &Method,
        mut words: Vec<u64>,
        first_entry: Option<usize>,
    ) -> VmResult<JavaValue> {
        let vm = thread.vm();
        let interpreter = vm.interpreter();
        if !interpreter.is_executable() {
            return Err(VmError::UnsupportedBackend(interpreter.backend().name()));
        }
        let mut entry = first_entry.unwrap_or_else(|| method.entry());
        if entry == 0 {
            return Err(VmError::Link(format!("{} has no entry", method.qualified_name())));
        }

        let sp = if thread.has_last_java_frame() {
            thread.last_java_sp() - NESTED_CALL_GAP
        } else {
            thread.stack_high()
        } & !15;
        if thread.in_guard_zone(sp - 8 * (words.len() + 16)) {
            return Err(VmError::Throw {
                class: names::STACK_OVERFLOW_ERROR,
                message: None,
            });
        }

        let previous = thread.state();
        thread.push_anchor();
        thread.set_state(ThreadState::InJava);
        log::trace!("thread {}: call {} with {} words", thread.id(), method.qualified_name(), words.len());

        let result = loop {
            let mut machine = Machine::new();
            machine.set_reg(Reg::Sp, sp as u64);
            machine.set_reg(Reg::R0, thread.addr() as u64);
            machine.set_reg(Reg::R1, method as *const Method as u64);
            machine.set_reg(Reg::R2, words.as_ptr() as u64);
            machine.set_reg(Reg::R3, words.len() as u64);
            machine.set_reg(Reg::R4, entry as u64);
            if let Err(error) = machine.call(interpreter.stub(StubId::CallStub), interpreter) {
                let codelet = interpreter.describe(error.pc());
                log::error!("thread {}: {} in {}", thread.id(), error, codelet);
                break Err(VmError::Trap { error, codelet });
            }
            // a popped frame called from here is called again
            if thread.popframe_condition() == popframe::FORCE_DEOPT_REEXECUTION {
                thread.set_popframe_condition(popframe::INACTIVE);
                if let Some(preserved) = thread.take_popframe_args() {
                    log::debug!("thread {}: reissuing call to {}", thread.id(), method.qualified_name());
                    words = preserved;
                }
                entry = method.entry();
                continue;
            }
            break Ok((machine.reg(Reg::Tos), machine.freg(FReg::F0)));
        };

        thread.set_state(previous);
        thread.pop_anchor();

        let (tos, ftos) = result?;
        if thread.has_pending_exception() {
            let exception = thread.clear_pending_exception();
            return Err(vm.uncaught(exception));
        }
        Ok(JavaValue::from_result(method.result_type(), tos, ftos))
    }
}

/// Lay out `args` as argument words, local 0 first. Two-slot values fill
/// both of their slots.
fn argument_words(method: &Method, args: &[JavaValue]) -> VmResult<Vec<u64>> {
    let sig = method.signature();
    let receiver = usize::from(!method.is_static());
    if args.len() != sig.params.len() + receiver {
        return Err(VmError::BadArguments(format!(
            "{} takes {} arguments, got {}",
            method.qualified_name(),
            sig.params.len() + receiver,
            args.len()
        )));
    }
    let mut words = Vec::with_capacity(method.size_of_parameters());
    if receiver == 1 {
        match args[0] {
            JavaValue::Object(o) if !o.is_null() => words.push(o.raw() as u64),
            JavaValue::Object(_) => {
                return Err(VmError::Throw {
                    class: names::NULL_POINTER_EXCEPTION,
                    message: Some(format!("null receiver for {}", method.qualified_name())),
                });
            }
            other => {
                return Err(VmError::BadArguments(format!("receiver must be an object, got {}", other)));
            }
        }
    }
    for (value, ty) in args[receiver..].iter().zip(&sig.params) {
        if !value.fits(*ty) {
            return Err(VmError::BadArguments(format!(
                "{} is not a {} argument of {}",
                value,
                ty.name(),
                method.qualified_name()
            )));
        }
        for _ in 0..ty.slots() {
            words.push(value.raw_bits());
        }
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_conversion() {
        assert_eq!(JavaValue::from_result(BasicType::Int, u64::MAX, 0), JavaValue::Int(-1));
        assert_eq!(JavaValue::from_result(BasicType::Boolean, 1, 0), JavaValue::Int(1));
        assert_eq!(
            JavaValue::from_result(BasicType::Float, 0, 1.5f32.to_bits() as u64),
            JavaValue::Float(1.5)
        );
        assert_eq!(
            JavaValue::from_result(BasicType::Double, 0, 2.5f64.to_bits()),
            JavaValue::Double(2.5)
        );
        assert_eq!(JavaValue::from_result(BasicType::Void, 7, 7), JavaValue::Void);
    }

    #[test]
    fn test_argument_fit() {
        assert!(JavaValue::Int(1).fits(BasicType::Char));
        assert!(!JavaValue::Int(1).fits(BasicType::Long));
        assert!(JavaValue::Object(Oop::NULL).fits(BasicType::Array));
        assert!(!JavaValue::Double(1.0).fits(BasicType::Float));
        assert_eq!(JavaValue::Int(-2).raw_bits(), (-2i64) as u64);
    }
}
