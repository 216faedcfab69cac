//! The call stub, native result handlers and method entries.
//!
//! A method entry is jumped to with the callee in `Method`, the caller's
//! stack pointer (pointing at the last argument) in `SenderSp` and the
//! return address on top of the stack.

use crate::codegen::masm::*;
use crate::vm::klass::offsets as klass_off;
use crate::vm::method::{access, offsets as method_off};
use crate::vm::oop::{BasicType, field_offset};
use crate::vm::thread::offsets as thread_off;
use crate::vm::thread::{StackGuardState, ThreadState};

use super::bytecodes as bc;
use super::frame;
use super::interp_masm::{InterpMasm, Preserve, UnlockMode};
use super::method_kind::MethodKind;
use super::runtime;
use super::stubs::StubId;
use super::tos::TosState;

/// Registers the call stub saves for its host caller.
const CALL_STUB_SAVED: [Reg; 5] = [Reg::Method, Reg::Bcp, Reg::Locals, Reg::Cache, Reg::Thread];

/// Offset of `Reference.referent`, the first instance field.
pub const REFERENT_OFFSET: i32 = field_offset(0);

/// Entry frame for calls from the VM.
///
/// In: `R0` thread, `R1` method, `R2` argument words (local 0 first),
/// `R3` argument count, `R4` the method's entry. Out: the result in
/// `Tos`/`F0`, or a pending exception. Returns the address calls made
/// from the stub return to.
pub fn call_stub<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) -> usize {
    m.push(Reg::Fp);
    m.mov(Reg::Fp, Reg::Sp);
    for reg in CALL_STUB_SAVED {
        m.push(reg);
    }
    m.mov(Reg::Thread, Reg::R0);

    let copy = m.create_label();
    let copied = m.create_label();
    m.mov_imm(Reg::R5, 0);
    m.bind(copy);
    m.branch(Cond::AboveEq, Reg::R5, Reg::R3, copied);
    m.load_indexed(Reg::Tos, Indexed::new(Reg::R2, Reg::R5, 3, 0), Width::W64, Extend::Zero);
    m.push(Reg::Tos);
    m.add_imm(Reg::R5, Reg::R5, 1);
    m.jump(copy);
    m.bind(copied);

    m.mov(Reg::Method, Reg::R1);
    m.mov(Reg::SenderSp, Reg::Sp);
    m.call_reg(Reg::R4);
    let return_pc = m.pc();
    leave_call_stub(m);
    return_pc
}

fn leave_call_stub<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.lea(Reg::Sp, Address::new(Reg::Fp, -(CALL_STUB_SAVED.len() as i32) * 8));
    for reg in CALL_STUB_SAVED.iter().rev() {
        m.pop(*reg);
    }
    m.pop(Reg::Fp);
    m.ret();
}

/// Continuation for an exception unwound into the call stub: the
/// exception in `Tos` becomes pending and the stub returns to the VM.
pub fn call_stub_catch<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.store_ptr(Reg::Tos, Reg::Thread, thread_off::PENDING_EXCEPTION);
    m.mov_imm(Reg::Tos, 0);
    leave_call_stub(m);
}

/// Convert a raw native result in `Tos` to its Java representation.
pub fn result_handler<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, ty: BasicType) {
    match ty {
        BasicType::Boolean => {
            let done = m.create_label();
            m.extend(Reg::Tos, Reg::Tos, Width::W8, Extend::Zero);
            m.branch_imm(Cond::Eq, Reg::Tos, 0, done);
            m.mov_imm(Reg::Tos, 1);
            m.bind(done);
        }
        BasicType::Byte => m.extend(Reg::Tos, Reg::Tos, Width::W8, Extend::Sign),
        BasicType::Char => m.extend(Reg::Tos, Reg::Tos, Width::W16, Extend::Zero),
        BasicType::Short => m.extend(Reg::Tos, Reg::Tos, Width::W16, Extend::Sign),
        BasicType::Int => m.extend(Reg::Tos, Reg::Tos, Width::W32, Extend::Sign),
        BasicType::Object | BasicType::Array => {
            // natives return handles
            let done = m.create_label();
            m.branch_imm(Cond::Eq, Reg::Tos, 0, done);
            m.load_ptr(Reg::Tos, Reg::Tos, 0);
            m.bind(done);
        }
        BasicType::Long | BasicType::Float | BasicType::Double | BasicType::Void => {}
    }
    m.ret();
}

/// Emit the entry for `kind`.
pub fn method_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, kind: MethodKind) {
    match kind {
        MethodKind::Zerolocals => normal_entry(m, false),
        MethodKind::ZerolocalsSynchronized => normal_entry(m, true),
        MethodKind::Native => native_entry(m, false),
        MethodKind::NativeSynchronized => native_entry(m, true),
        MethodKind::Empty => empty_entry(m),
        MethodKind::Accessor => accessor_entry(m),
        MethodKind::Abstract => abstract_entry(m),
        MethodKind::JavaLangRefReferenceGet => reference_get_entry(m),
        math => math_entry(m, math),
    }
}

/// Locals pointer from the parameter size; leaves the size in `R1`.
fn compute_locals<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.load(Reg::R1, Address::new(Reg::Method, method_off::SIZE_OF_PARAMETERS), Width::W16, Extend::Zero);
    m.lea_indexed(Reg::Locals, Indexed::new(Reg::SenderSp, Reg::R1, 3, -8));
}

/// Stack overflow before the frame exists: drop the return address and
/// throw in the caller.
fn stack_overflow_path<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, overflow: Label) {
    m.bind(overflow);
    m.pop(Reg::R1);
    m.mov(Reg::Sp, Reg::SenderSp);
    m.jump_stub(StubId::ThrowStackOverflow);
}

/// Push the fixed frame. `Locals` and `Method` are set, the return
/// address is on top of the stack.
fn build_frame<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.push(Reg::Fp);
    m.mov(Reg::Fp, Reg::Sp);
    m.push(Reg::SenderSp);
    m.mov_imm(Reg::R5, 0);
    m.push(Reg::R5);
    m.push(Reg::Method);
    m.load_ptr(Reg::R5, Reg::Method, method_off::HOLDER);
    m.load_ptr(Reg::R5, Reg::R5, klass_off::MIRROR);
    m.push(Reg::R5);
    if m.config().profile_interpreter {
        let none = m.create_label();
        m.load_ptr(Reg::R5, Reg::Method, method_off::METHOD_DATA);
        m.branch_imm(Cond::Eq, Reg::R5, 0, none);
        m.load_ptr(Reg::R5, Reg::R5, method_off::MDO_CELLS);
        m.bind(none);
    } else {
        m.mov_imm(Reg::R5, 0);
    }
    m.push(Reg::R5);
    m.load_ptr(Reg::Cache, Reg::Method, method_off::CACHE);
    m.push(Reg::Cache);
    m.alu(AluOp::Sub, OpSize::Long, Reg::R5, Reg::Locals, Reg::Fp);
    m.alu_imm(AluOp::Shr, OpSize::Long, Reg::R5, Reg::R5, 3);
    m.push(Reg::R5);
    m.load_ptr(Reg::Bcp, Reg::Method, method_off::CODE_BASE);
    m.push(Reg::Bcp);
    m.mov_imm(Reg::R5, frame::MONITOR_BLOCK_BOTTOM as i64);
    m.push(Reg::R5);
}

fn set_do_not_unlock<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, on: bool) {
    m.mov_imm(Reg::R5, on as i64);
    m.store(Reg::R5, Address::new(Reg::Thread, thread_off::DO_NOT_UNLOCK_IF_SYNCHRONIZED), Width::W8);
}

/// Counters, method lock and entry notification shared by Java and
/// native entries.
fn enter_method<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, synchronized: bool) {
    // an exception from the counter overflow must not unlock the
    // monitor that is not taken yet
    if synchronized {
        set_do_not_unlock(m, true);
    }
    m.invocation_counter();
    if synchronized {
        set_do_not_unlock(m, false);
        m.lock_method(None);
    }
    m.notify_method_entry();
}

fn normal_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, synchronized: bool) {
    let overflow = m.create_label();
    if m.config().verify_stack {
        let ok = m.create_label();
        m.load(Reg::R5, Address::new(Reg::Method, method_off::ACCESS_FLAGS), Width::W32, Extend::Zero);
        m.alu_imm(AluOp::And, OpSize::Long, Reg::R5, Reg::R5, access::NATIVE as i32);
        m.branch_imm(Cond::Eq, Reg::R5, 0, ok);
        m.trap(TrapCode::NativeAsNonNative);
        m.bind(ok);
    }
    compute_locals(m);
    m.load(Reg::R2, Address::new(Reg::Method, method_off::MAX_LOCALS), Width::W16, Extend::Zero);
    m.alu(AluOp::Sub, OpSize::Long, Reg::R2, Reg::R2, Reg::R1);

    let monitor_words = if synchronized { frame::MONITOR_SIZE / 8 } else { 0 };
    m.load(Reg::R3, Address::new(Reg::Method, method_off::MAX_STACK), Width::W16, Extend::Zero);
    m.alu(AluOp::Add, OpSize::Long, Reg::R3, Reg::R3, Reg::R2);
    m.add_imm(Reg::R3, Reg::R3, frame::OVERHEAD_WORDS + monitor_words);
    m.stack_limit_check(Reg::R3, overflow);

    // zero the non-parameter locals below the return address
    let zero = m.create_label();
    let zeroed = m.create_label();
    m.pop(Reg::R4);
    m.mov_imm(Reg::R5, 0);
    m.bind(zero);
    m.branch_imm(Cond::Le, Reg::R2, 0, zeroed);
    m.push(Reg::R5);
    m.add_imm(Reg::R2, Reg::R2, -1);
    m.jump(zero);
    m.bind(zeroed);
    m.push(Reg::R4);

    build_frame(m);
    enter_method(m, synchronized);
    m.dispatch_next(TosState::Vtos, 0);

    stack_overflow_path(m, overflow);
}

fn native_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, synchronized: bool) {
    let overflow = m.create_label();
    compute_locals(m);
    m.add_imm(Reg::R3, Reg::R1, frame::OVERHEAD_WORDS + frame::MONITOR_SIZE / 8 + 2);
    m.stack_limit_check(Reg::R3, overflow);
    build_frame(m);
    enter_method(m, synchronized);

    // lazily resolve the function and its signature handler
    let prepared = m.create_label();
    m.load_ptr(Reg::R5, Reg::Method, method_off::SIGNATURE_HANDLER);
    m.branch_imm(Cond::Ne, Reg::R5, 0, prepared);
    m.call_vm(runtime::prepare_native_call as *const () as usize, true);
    m.bind(prepared);

    m.set_last_java_frame();
    // outgoing stack arguments, 16-byte aligned
    m.load(Reg::R1, Address::new(Reg::Method, method_off::SIZE_OF_PARAMETERS), Width::W16, Extend::Zero);
    m.alu_imm(AluOp::Shl, OpSize::Long, Reg::R1, Reg::R1, 3);
    m.alu(AluOp::Sub, OpSize::Long, Reg::Sp, Reg::Sp, Reg::R1);
    m.alu_imm(AluOp::And, OpSize::Long, Reg::Sp, Reg::Sp, -16);
    m.set_thread_state(ThreadState::InNative);
    m.load_ptr(Reg::R5, Reg::Method, method_off::SIGNATURE_HANDLER);
    m.call_reg(Reg::R5);
    m.lea(Reg::R0, Address::new(Reg::Thread, thread_off::JNI_ENV));
    m.load_ptr(Reg::SenderSp, Reg::Method, method_off::NATIVE_FUNCTION);
    m.call_native(Reg::SenderSp);

    // back from native: keep both result registers on the stack
    m.push(Reg::Tos);
    m.fmov_to_int(Reg::R5, FRET, Precision::Double);
    m.push(Reg::R5);
    m.set_thread_state(ThreadState::InNativeTrans);
    m.membar(Membar::Full);
    let no_block = m.create_label();
    let block = m.create_label();
    let poll_word = m.ctx.poll_word;
    m.mov_imm(Reg::R5, poll_word as i64);
    m.load_ptr(Reg::R5, Reg::R5, 0);
    m.branch_imm(Cond::Ne, Reg::R5, 0, block);
    m.load(Reg::R5, Address::new(Reg::Thread, thread_off::SUSPEND_FLAGS), Width::W32, Extend::Zero);
    m.branch_imm(Cond::Eq, Reg::R5, 0, no_block);
    m.bind(block);
    m.call_vm_leaf(runtime::block_in_native_trans as *const () as usize);
    m.bind(no_block);
    m.set_thread_state(ThreadState::InJava);
    m.reset_last_java_frame();

    let guarded = m.create_label();
    m.load(Reg::R5, Address::new(Reg::Thread, thread_off::STACK_GUARD_STATE), Width::W32, Extend::Zero);
    m.branch_imm(Cond::Ne, Reg::R5, StackGuardState::YellowDisabled as i32, guarded);
    m.call_vm_leaf(runtime::reguard_yellow_pages as *const () as usize);
    m.bind(guarded);
    m.mov_imm(Reg::R5, 0);
    m.store_ptr(Reg::R5, Reg::Thread, thread_off::HANDLES_TOP);

    m.pop(Reg::R5);
    m.fmov_from_int(FRET, Reg::R5, Precision::Double);
    m.pop(Reg::Tos);
    m.restore_interpreter_state();
    m.empty_expression_stack();
    m.check_pending_exception();

    // convert the result while it is still a handle
    m.load(Reg::R4, Address::new(Reg::Method, method_off::RESULT_TYPE), Width::W8, Extend::Zero);
    let handlers = m.ctx.result_handlers;
    m.mov_imm(Reg::R5, handlers as i64);
    m.load_indexed(Reg::R5, Indexed::new(Reg::R5, Reg::R4, 3, 0), Width::W64, Extend::Zero);
    m.call_reg(Reg::R5);

    m.unlock_and_notify(Preserve::Both, UnlockMode::Throw, true);
    m.return_to_caller();

    stack_overflow_path(m, overflow);
}

/// Jump to the general entry of the same method.
fn jump_to_normal_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let cell = m.ctx.method_entries + MethodKind::Zerolocals.index() * 8;
    m.mov_imm(Reg::R5, cell as i64);
    m.load_ptr(Reg::R5, Reg::R5, 0);
    m.jump_reg(Reg::R5);
}

/// Fast entries fall back to the general entry while a safepoint is
/// pending or events must be posted.
fn fast_entry_guard<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, slow: Label) {
    let poll_word = m.ctx.poll_word;
    m.mov_imm(Reg::R5, poll_word as i64);
    m.load_ptr(Reg::R5, Reg::R5, 0);
    m.branch_imm(Cond::Ne, Reg::R5, 0, slow);
    if m.config().jvmti_support {
        m.load(Reg::R5, Address::new(Reg::Thread, thread_off::INTERP_ONLY_MODE), Width::W8, Extend::Zero);
        m.branch_imm(Cond::Ne, Reg::R5, 0, slow);
    }
}

/// Pop the return address, drop the arguments and return.
fn return_from_fast_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.pop(Reg::R5);
    m.mov(Reg::Sp, Reg::SenderSp);
    m.jump_reg(Reg::R5);
}

fn empty_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let slow = m.create_label();
    fast_entry_guard(m, slow);
    return_from_fast_entry(m);
    m.bind(slow);
    jump_to_normal_entry(m);
}

/// `aload_0; getfield; xreturn` without a frame, once the field is resolved.
fn accessor_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let slow = m.create_label();
    fast_entry_guard(m, slow);
    m.load_ptr(Reg::R1, Reg::SenderSp, 0);
    m.branch_imm(Cond::Eq, Reg::R1, 0, slow);
    m.load_ptr(Reg::R2, Reg::Method, method_off::CODE_BASE);
    m.load_be(Reg::R3, Address::new(Reg::R2, 2), Width::W16, Extend::Zero);
    m.alu_imm(
        AluOp::Mul,
        OpSize::Long,
        Reg::R3,
        Reg::R3,
        crate::vm::constants::CP_CACHE_ENTRY_SIZE as i32,
    );
    m.load_ptr(Reg::R2, Reg::Method, method_off::CACHE);
    m.alu(AluOp::Add, OpSize::Long, Reg::R2, Reg::R2, Reg::R3);
    m.load(Reg::R5, Address::new(Reg::R2, crate::vm::constants::BYTECODE_1_OFFSET), Width::W8, Extend::Zero);
    m.branch_imm(Cond::Ne, Reg::R5, bc::GETFIELD as i32, slow);

    m.load(Reg::R4, Address::new(Reg::R2, 4), Width::W32, Extend::Zero);
    m.load_ptr(Reg::R3, Reg::R2, 16);
    m.load_indexed(Reg::Tos, Indexed::new(Reg::R1, Reg::R3, 0, 0), Width::W64, Extend::Zero);
    let volatile_done = m.create_label();
    m.alu_imm(
        AluOp::And,
        OpSize::Long,
        Reg::R5,
        Reg::R4,
        crate::vm::constants::cache_flags::IS_VOLATILE as i32,
    );
    m.branch_imm(Cond::Eq, Reg::R5, 0, volatile_done);
    m.membar(Membar::LoadLoad);
    m.bind(volatile_done);
    m.alu_imm(
        AluOp::And,
        OpSize::Long,
        Reg::R4,
        Reg::R4,
        crate::vm::constants::cache_flags::TOS_MASK as i32,
    );
    let not_float = m.create_label();
    let not_double = m.create_label();
    m.branch_imm(Cond::Ne, Reg::R4, TosState::Ftos as i32, not_float);
    m.fmov_from_int(FTOS, Reg::Tos, Precision::Single);
    m.bind(not_float);
    m.branch_imm(Cond::Ne, Reg::R4, TosState::Dtos as i32, not_double);
    m.fmov_from_int(FTOS, Reg::Tos, Precision::Double);
    m.bind(not_double);
    return_from_fast_entry(m);

    m.bind(slow);
    jump_to_normal_entry(m);
}

/// `Reference.get` logs the referent while SATB marking is active so
/// that a concurrent marker sees it.
fn reference_get_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let slow = m.create_label();
    let done = m.create_label();
    fast_entry_guard(m, slow);
    m.load_ptr(Reg::R1, Reg::SenderSp, 0);
    m.branch_imm(Cond::Eq, Reg::R1, 0, slow);
    m.load_ptr(Reg::Tos, Reg::R1, REFERENT_OFFSET);
    m.branch_imm(Cond::Eq, Reg::Tos, 0, done);
    let marking = m.ctx.satb_marking;
    m.mov_imm(Reg::R5, marking as i64);
    m.load(Reg::R5, Address::new(Reg::R5, 0), Width::W8, Extend::Zero);
    m.branch_imm(Cond::Eq, Reg::R5, 0, done);
    m.push(Reg::SenderSp);
    m.push(Reg::Tos);
    m.mov(Reg::R1, Reg::Tos);
    m.call_vm_leaf(runtime::satb_enqueue as *const () as usize);
    m.pop(Reg::Tos);
    m.pop(Reg::SenderSp);
    m.bind(done);
    return_from_fast_entry(m);

    m.bind(slow);
    jump_to_normal_entry(m);
}

fn math_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, kind: MethodKind) {
    if kind == MethodKind::JavaLangMathPow {
        m.fload(FReg::F0, Address::new(Reg::SenderSp, 16), Precision::Double);
        m.fload(FReg::F1, Address::new(Reg::SenderSp, 0), Precision::Double);
    } else {
        m.fload(FReg::F0, Address::new(Reg::SenderSp, 0), Precision::Double);
    }
    match kind {
        MethodKind::JavaLangMathSqrt => m.funary(FloatUnary::Sqrt, Precision::Double, FReg::F0, FReg::F0),
        MethodKind::JavaLangMathAbs => m.funary(FloatUnary::Abs, Precision::Double, FReg::F0, FReg::F0),
        _ => {
            // SenderSp does not survive the runtime call
            m.push(Reg::SenderSp);
            m.call_runtime_float(runtime::math_function(kind));
            m.pop(Reg::SenderSp);
        }
    }
    return_from_fast_entry(m);
}

/// Calling an abstract method throws `AbstractMethodError` in the caller.
fn abstract_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.pop(Reg::Bcp);
    m.mov(Reg::Sp, Reg::SenderSp);
    m.mov(Reg::R1, Reg::Method);
    m.call_vm_leaf(runtime::create_abstract_method_error as *const () as usize);
    m.mov(Reg::Tos, RET);
    m.mov(Reg::R1, Reg::Bcp);
    m.unwind_to_caller();
}
