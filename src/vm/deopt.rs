//! Rebuilding interpreter frames from virtual frame descriptions.
//!
//! A compiled activation that can no longer run is described as a list of
//! [`VirtualFrame`]s. [`unpack_and_resume`] lays them out as real
//! interpreter frames inside a call stub activation and continues in the
//! youngest one, either re-executing its current bytecode or completing the
//! call it was making with a given result.

use std::sync::atomic::Ordering;

use crate::error::{VmError, VmResult};
use crate::interpreter::bytecodes as bc;
use crate::interpreter::frame::{self, MONITOR_BLOCK_BOTTOM, MONITOR_OBJ_OFFSET, MONITOR_SIZE};
use crate::interpreter::stubs::StubId;
use crate::interpreter::tos::TosState;

use super::javacalls::{JavaCalls, JavaValue};
use super::method::Method;
use super::oop::Oop;
use super::thread::JavaThread;

/// Bytecodes whose re-execution after unpacking continues at a different
/// handler: a `return_register_finalizer` re-executes as a plain return,
/// the object having been registered before the frame was captured.
pub const REEXECUTE_REDIRECTS: &[u8] = &[bc::RETURN_REGISTER_FINALIZER];

/// One interpreter activation to materialize.
#[derive(Debug, Clone)]
pub struct VirtualFrame {
    method: usize,
    pub bci: usize,
    /// Local values, local 0 first; missing locals are zero.
    pub locals: Vec<u64>,
    /// Expression stack, deepest first. For a caller frame this excludes
    /// the arguments of the call it is making.
    pub expressions: Vec<u64>,
    /// Objects locked by the frame, oldest first.
    pub monitors: Vec<Oop>,
}

impl VirtualFrame {
    pub fn new(method: &Method, bci: usize) -> VirtualFrame {
        VirtualFrame {
            method: method as *const Method as usize,
            bci,
            locals: Vec::new(),
            expressions: Vec::new(),
            monitors: Vec::new(),
        }
    }

    pub fn with_locals(mut self, locals: Vec<u64>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_expressions(mut self, expressions: Vec<u64>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn with_monitors(mut self, monitors: Vec<Oop>) -> Self {
        self.monitors = monitors;
        self
    }

    pub fn method(&self) -> &Method {
        // SAFETY: created from a method of a loaded class; classes are never unloaded.
        unsafe { &*(self.method as *const Method) }
    }

    /// Words the frame occupies below its locals, excluding expressions.
    fn fixed_words(&self) -> usize {
        2 + frame::FIXED_WORDS as usize + 2 * self.monitors.len()
    }
}

/// Frames to unpack, oldest first, and how the youngest continues.
#[derive(Debug, Clone)]
pub struct UnpackPlan {
    pub frames: Vec<VirtualFrame>,
    /// Re-execute the youngest frame's bytecode instead of completing its
    /// call with `result`.
    pub reexecute: bool,
    pub result: JavaValue,
}

impl UnpackPlan {
    pub fn new(frames: Vec<VirtualFrame>) -> UnpackPlan {
        UnpackPlan {
            frames,
            reexecute: true,
            result: JavaValue::Void,
        }
    }

    /// Complete the youngest frame's pending call with `result`.
    pub fn returning(mut self, result: JavaValue) -> Self {
        self.reexecute = false;
        self.result = result;
        self
    }

    fn validate(&self) -> VmResult<()> {
        let Some(youngest) = self.frames.len().checked_sub(1) else {
            return Err(VmError::BadArguments("nothing to unpack".into()));
        };
        for (i, vf) in self.frames.iter().enumerate() {
            let method = vf.method();
            let Some(&op) = method.code().get(vf.bci) else {
                return Err(VmError::BadArguments(format!(
                    "bci {} outside {}",
                    vf.bci,
                    method.qualified_name()
                )));
            };
            if vf.locals.len() > method.max_locals() {
                return Err(VmError::BadArguments(format!(
                    "{} locals for {} with max_locals {}",
                    vf.locals.len(),
                    method.qualified_name(),
                    method.max_locals()
                )));
            }
            let calling = i < youngest || !self.reexecute;
            if calling && !bc::is_invoke(bc::java_code(op)) {
                return Err(VmError::BadArguments(format!(
                    "{} at bci {} is not at a call",
                    method.qualified_name(),
                    vf.bci
                )));
            }
        }
        Ok(())
    }
}

/// Materialize `plan` on `thread` and run the youngest frame to
/// completion. Returns the result of the oldest frame's method.
pub fn unpack_and_resume(thread: &JavaThread, plan: UnpackPlan) -> VmResult<JavaValue> {
    plan.validate()?;
    let vm = thread.vm();
    // locks held by the compiled activation move to the interpreter frames
    for vf in &plan.frames {
        for obj in &vf.monitors {
            vm.sync().enter(thread, *obj);
        }
    }
    let oldest = plan.frames[0].method;
    // SAFETY: as for `VirtualFrame::method`.
    let oldest: &Method = unsafe { &*(oldest as *const Method) };
    log::debug!(
        "thread {}: unpacking {} frames, youngest {}",
        thread.id(),
        plan.frames.len(),
        plan.frames[plan.frames.len() - 1].method().qualified_name()
    );
    thread.set_deopt_plan(plan);
    JavaCalls::call_entry(thread, oldest, vm.interpreter().stub(StubId::DeoptUnpack))
}

fn write(addr: usize, value: u64) {
    // SAFETY: addresses lie in the unused part of the current thread stack,
    // below the unpack stub's stack pointer.
    unsafe { *(addr as *mut u64) = value }
}

/// Lay out the frames of the thread's pending plan below `sender_sp`, the
/// call stub's stack pointer before it called the unpack stub. Records the
/// youngest frame's fp, continuation and result in the thread and returns
/// its stack pointer.
pub fn unpack_frames(thread: &JavaThread, sp: usize, fp: usize, sender_sp: usize) -> usize {
    let vm = thread.vm();
    let interpreter = vm.interpreter();
    let fail = |message: &str| {
        vm.record_fatal(message);
        thread.deopt.fp.store(fp, Ordering::Release);
        thread
            .deopt
            .pc
            .store(interpreter.stub(StubId::IllegalBytecodeSequence), Ordering::Release);
        sp
    };
    let Some(plan) = thread.take_deopt_plan() else {
        return fail("deoptimization stub entered without frames to unpack");
    };

    let needed: usize = plan
        .frames
        .iter()
        .map(|vf| vf.method().max_locals() + vf.fixed_words() + vf.expressions.len())
        .sum();
    if sender_sp.saturating_sub(8 * needed) < thread.stack_overflow_limit() {
        return fail("unpacked frames do not fit on the stack");
    }

    let profile = vm.config().profile_interpreter;
    let mut top = sender_sp;
    let mut caller_fp = fp;
    let mut frame_sp = sp;
    let youngest = plan.frames.len() - 1;
    for (i, vf) in plan.frames.iter().enumerate() {
        let method = vf.method();
        let locals = top - 8;
        for n in 0..method.max_locals() {
            write(locals - 8 * n, vf.locals.get(n).copied().unwrap_or(0));
        }
        let return_address = if i == 0 {
            interpreter.stub(StubId::CallStubReturn)
        } else {
            let caller = &plan.frames[i - 1];
            let length = bc::length_at(caller.method().code(), caller.bci).unwrap_or(3);
            interpreter.deopt_entry(length, method.result_type().tos_state())
        };
        let ret_slot = locals - 8 * method.max_locals();
        write(ret_slot, return_address as u64);
        let this_fp = ret_slot - 8;
        write(this_fp, caller_fp as u64);

        let sender = if i == 0 { top } else { top - 8 * method.size_of_parameters() };
        let mdp = match method.method_data() {
            Some(data) if profile => data.cells_base,
            _ => 0,
        };
        let mbt = MONITOR_BLOCK_BOTTOM as i64 - 2 * vf.monitors.len() as i64;
        let slot = |offset: i32| (this_fp as isize + offset as isize) as usize;
        write(slot(frame::SENDER_SP), sender as u64);
        write(slot(frame::LAST_SP), 0);
        write(slot(frame::METHOD), method as *const Method as u64);
        write(slot(frame::MIRROR), method.holder().mirror().raw() as u64);
        write(slot(frame::MDP), mdp as u64);
        write(slot(frame::CACHE), method.cache as u64);
        write(slot(frame::LOCALS), ((locals as i64 - this_fp as i64) / 8) as u64);
        write(slot(frame::BCP), (method.code_base() + vf.bci) as u64);
        write(slot(frame::MONITOR_BLOCK_TOP), mbt as u64);
        for (k, obj) in vf.monitors.iter().enumerate() {
            let monitor = slot(frame::MONITOR_BLOCK_TOP - MONITOR_SIZE * (k as i32 + 1));
            write(monitor, 0);
            write(monitor + MONITOR_OBJ_OFFSET as usize, obj.raw() as u64);
        }

        let mut esp = (this_fp as i64 + 8 * mbt) as usize;
        for value in &vf.expressions {
            esp -= 8;
            write(esp, *value);
        }
        if i < youngest {
            write(slot(frame::LAST_SP), esp as u64);
        }
        top = esp;
        caller_fp = this_fp;
        frame_sp = esp;
    }

    let last = &plan.frames[youngest];
    let pc = if plan.reexecute {
        let op = last.method().code()[last.bci];
        if REEXECUTE_REDIRECTS.contains(&op) {
            interpreter.stub(StubId::DeoptReexecuteReturn)
        } else {
            interpreter.deopt_entry(0, TosState::Vtos)
        }
    } else {
        let length = bc::length_at(last.method().code(), last.bci).unwrap_or(3);
        let tos = match plan.result {
            JavaValue::Void => TosState::Vtos,
            JavaValue::Int(_) => TosState::Itos,
            JavaValue::Long(_) => TosState::Ltos,
            JavaValue::Float(_) => TosState::Ftos,
            JavaValue::Double(_) => TosState::Dtos,
            JavaValue::Object(_) => TosState::Atos,
        };
        interpreter.deopt_entry(length, tos)
    };
    thread.deopt.fp.store(caller_fp, Ordering::Release);
    thread.deopt.pc.store(pc, Ordering::Release);
    thread.deopt.result.store(plan.result.raw_bits(), Ordering::Release);
    log::trace!(
        "thread {}: unpacked, youngest fp {:#x} sp {:#x} continues at {}",
        thread.id(),
        caller_fp,
        frame_sp,
        interpreter.describe(pc)
    );
    frame_sp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpreterConfig;
    use crate::vm::Vm;
    use crate::vm::classfile::ClassBuilder;
    use crate::vm::method::access;

    #[test]
    fn test_plan_validation() {
        let vm = Vm::new(InterpreterConfig::default()).unwrap();
        let mut k = ClassBuilder::new("D");
        k.method("f", "()I", access::STATIC, |c| {
            c.iconst(1).op(bc::IRETURN);
        })
        .unwrap();
        let k = vm.define_class(k.build()).unwrap();
        let f = k.find_method("f", "()I").unwrap();

        assert!(UnpackPlan::new(Vec::new()).validate().is_err());
        assert!(UnpackPlan::new(vec![VirtualFrame::new(f, 0)]).validate().is_ok());
        assert!(UnpackPlan::new(vec![VirtualFrame::new(f, 9)]).validate().is_err());
        // completing a call needs the frame to be at an invoke
        let plan = UnpackPlan::new(vec![VirtualFrame::new(f, 0)]).returning(JavaValue::Int(3));
        assert!(plan.validate().is_err());
        let too_many = VirtualFrame::new(f, 0).with_locals(vec![1, 2]);
        assert!(UnpackPlan::new(vec![too_many]).validate().is_err());
    }

    #[test]
    fn test_unpack_without_plan_is_fatal() {
        let vm = Vm::new(InterpreterConfig::default()).unwrap();
        let thread = vm.main_thread().unwrap();
        let sp = thread.stack_high() - 64;
        assert_eq!(unpack_frames(&thread, sp, sp + 16, sp + 8), sp);
        assert_eq!(vm.take_fatal().len(), 1);
    }
}
