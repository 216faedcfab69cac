//! Points where execution re-enters an interpreter frame: after a call
//! returns, after deoptimization, at a safepoint poll or for an early
//! return, plus the exception and frame-removal stubs.

use crate::codegen::masm::*;
use crate::vm::thread::offsets as thread_off;
use crate::vm::thread::{earlyret, popframe};

use super::bytecodes as bc;
use super::dispatch::STATE_STRIDE;
use super::frame;
use super::interp_masm::{InterpMasm, Preserve, UnlockMode};
use super::runtime;
use super::stubs::StubId;
use super::tos::TosState;

/// Continuation after an invoke of `length` bytes returns a value in `state`.
pub fn return_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, length: usize, state: TosState) {
    m.load_ptr(Reg::Sp, Reg::Fp, frame::LAST_SP);
    m.mov_imm(Reg::R5, 0);
    m.store_ptr(Reg::R5, Reg::Fp, frame::LAST_SP);
    m.restore_interpreter_state();
    // the arguments are still on the expression stack
    m.get_cache_entry(Reg::R2, 1);
    m.load(Reg::R1, Address::new(Reg::R2, 4), Width::W32, Extend::Zero);
    m.alu_imm(AluOp::Shr, OpSize::Long, Reg::R1, Reg::R1, 8);
    m.alu_imm(AluOp::And, OpSize::Long, Reg::R1, Reg::R1, 0xff);
    m.lea_indexed(Reg::Sp, Indexed::new(Reg::Sp, Reg::R1, 3, 0));
    m.dispatch_next(state, length as i32);
}

/// Continuation of a frame rebuilt by deoptimization, `step` bytes past
/// the bcp it was unpacked at.
pub fn deopt_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, step: usize, state: TosState) {
    let no_last_sp = m.create_label();
    m.load_ptr(Reg::R5, Reg::Fp, frame::LAST_SP);
    m.branch_imm(Cond::Eq, Reg::R5, 0, no_last_sp);
    m.mov(Reg::Sp, Reg::R5);
    m.mov_imm(Reg::R5, 0);
    m.store_ptr(Reg::R5, Reg::Fp, frame::LAST_SP);
    m.bind(no_last_sp);
    m.restore_interpreter_state();
    m.check_pending_exception();
    m.dispatch_next(state, step as i32);
}

/// Return the value requested by an early return from the current frame.
pub fn earlyret_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, state: TosState) {
    m.empty_expression_stack();
    match state {
        TosState::Atos => m.load_ptr(Reg::Tos, Reg::Thread, thread_off::EARLYRET_OOP),
        TosState::Ftos => m.fload(FTOS, Address::new(Reg::Thread, thread_off::EARLYRET_VALUE), Precision::Single),
        TosState::Dtos => m.fload(FTOS, Address::new(Reg::Thread, thread_off::EARLYRET_VALUE), Precision::Double),
        TosState::Vtos => {}
        _ => m.load_ptr(Reg::Tos, Reg::Thread, thread_off::EARLYRET_VALUE),
    }
    m.mov_imm(Reg::R5, earlyret::INACTIVE as i64);
    m.store(Reg::R5, Address::new(Reg::Thread, thread_off::EARLYRET_STATE), Width::W32);
    m.mov_imm(Reg::R5, TosState::Vtos as i64);
    m.store(Reg::R5, Address::new(Reg::Thread, thread_off::EARLYRET_TOS), Width::W32);
    m.mov_imm(Reg::R5, 0);
    m.store_ptr(Reg::R5, Reg::Thread, thread_off::EARLYRET_VALUE);
    m.store_ptr(Reg::R5, Reg::Thread, thread_off::EARLYRET_OOP);
    m.unlock_and_notify(Preserve::State(state), UnlockMode::Silent, true);
    m.return_to_caller();
}

/// Safepoint table entry: spill the TOS value, poll, then dispatch the
/// same bytecode through the normal table.
pub fn safepoint_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, state: TosState) {
    m.push_tos(state);
    m.call_vm(runtime::at_safepoint as *const () as usize, true);
    m.load(Reg::R4, Address::new(Reg::Bcp, 0), Width::W8, Extend::Zero);
    let vtos_row = m.ctx.normal_base + TosState::Vtos.index() * STATE_STRIDE as usize;
    m.jump_through_table(vtos_row, Reg::R4);
}

/// Emit the shared stub `id`.
pub fn stub<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, id: StubId) {
    match id {
        StubId::ThrowException => throw_exception(m),
        StubId::RemoveActivation => {
            m.unlock_and_notify(Preserve::State(TosState::Atos), UnlockMode::Install, true);
            m.leave_frame();
            m.mov(Reg::R1, Reg::Bcp);
            m.unwind_to_caller();
        }
        StubId::RethrowException => {
            m.restore_interpreter_state();
            m.mov_imm(Reg::R5, 0);
            m.store_ptr(Reg::R5, Reg::Fp, frame::LAST_SP);
            m.jump_stub(StubId::ThrowException);
        }
        StubId::ForwardException => {
            m.load_ptr(Reg::Tos, Reg::Thread, thread_off::PENDING_EXCEPTION);
            m.mov_imm(Reg::R5, 0);
            m.store_ptr(Reg::R5, Reg::Thread, thread_off::PENDING_EXCEPTION);
            m.jump_stub(StubId::ThrowException);
        }
        StubId::ThrowNullPointer => throw_with(m, runtime::throw_null_pointer as *const () as usize),
        StubId::ThrowArrayIndexOutOfBounds => throw_with(m, runtime::throw_array_index_out_of_bounds as *const () as usize),
        StubId::ThrowArithmetic => throw_with(m, runtime::throw_arithmetic as *const () as usize),
        StubId::ThrowClassCast => throw_with(m, runtime::throw_class_cast as *const () as usize),
        StubId::ThrowNegativeArraySize => throw_with(m, runtime::throw_negative_array_size as *const () as usize),
        StubId::ThrowIllegalMonitorState => throw_with(m, runtime::throw_illegal_monitor_state as *const () as usize),
        StubId::ThrowStackOverflow => {
            m.mov(Reg::Bcp, Reg::R1);
            m.call_vm_leaf(runtime::create_stack_overflow_error as *const () as usize);
            m.mov(Reg::Tos, RET);
            m.mov(Reg::R1, Reg::Bcp);
            m.unwind_to_caller();
        }
        StubId::IllegalBytecodeSequence => m.trap(TrapCode::IllegalBytecode),
        StubId::UnimplementedBytecode => m.trap(TrapCode::UnimplementedBytecode),
        StubId::RemoveActivationPreservingArgs => pop_frame(m),
        StubId::DeoptReexecuteReturn => {
            m.restore_interpreter_state();
            let cell = m.ctx.normal_base
                + TosState::Vtos.index() * STATE_STRIDE as usize
                + bc::RETURN as usize * 8;
            m.mov_imm(Reg::R5, cell as i64);
            m.load_ptr(Reg::R5, Reg::R5, 0);
            m.jump_reg(Reg::R5);
        }
        StubId::DeoptUnpack => {
            m.mov(Reg::R1, Reg::Sp);
            m.mov(Reg::R2, Reg::Fp);
            m.mov(Reg::R3, Reg::SenderSp);
            m.call_vm_leaf(runtime::deopt_unpack_frames as *const () as usize);
            m.mov(Reg::Sp, RET);
            m.load_ptr(Reg::Fp, Reg::Thread, thread_off::DEOPT_FP);
            m.load_ptr(Reg::Tos, Reg::Thread, thread_off::DEOPT_RESULT);
            m.fload(FRET, Address::new(Reg::Thread, thread_off::DEOPT_RESULT), Precision::Double);
            m.load_ptr(Reg::R5, Reg::Thread, thread_off::DEOPT_PC);
            m.jump_reg(Reg::R5);
        }
        StubId::SlowSignatureHandler => {
            m.mov(Reg::R1, Reg::Method);
            m.mov(Reg::R2, Reg::Locals);
            m.lea(Reg::R3, Address::new(Reg::Sp, 8));
            m.call_vm_leaf(runtime::slow_signature_handler as *const () as usize);
            for (i, reg) in [Reg::R1, Reg::R2, Reg::R3, Reg::R4, Reg::R5].into_iter().enumerate() {
                m.load_ptr(reg, Reg::Thread, thread_off::NATIVE_SCRATCH_INTS + 8 * (i as i32 + 1));
            }
            for (i, freg) in FReg::ALL.into_iter().enumerate() {
                m.fload(
                    freg,
                    Address::new(Reg::Thread, thread_off::NATIVE_SCRATCH_FLOATS + 8 * i as i32),
                    Precision::Double,
                );
            }
            m.ret();
        }
        // generated by `entries`
        StubId::CallStub | StubId::CallStubReturn | StubId::CallStubCatch => m.trap(TrapCode::ShouldNotReachHere),
    }
}

/// Look up a handler for the exception in `Tos` in the current frame.
/// A handler starts with the exception pushed; otherwise the frame is
/// removed and the exception rethrown in the caller.
fn throw_exception<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let found = m.create_label();
    m.empty_expression_stack();
    m.mov(Reg::R1, Reg::Tos);
    m.call_vm(runtime::exception_handler_for_exception as *const () as usize, false);
    m.mov(Reg::R4, RET);
    m.load_ptr(Reg::Tos, Reg::Thread, thread_off::VM_RESULT);
    m.mov_imm(Reg::R5, 0);
    m.store_ptr(Reg::R5, Reg::Thread, thread_off::VM_RESULT);
    m.branch_imm(Cond::Eq, Reg::R4, 0, found);
    m.jump_reg(Reg::R4);
    m.bind(found);
    m.push(Reg::Tos);
    m.dispatch_next(TosState::Vtos, 0);
}

/// Create an exception in the VM; arguments stay in `R1..R3`.
fn throw_with<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, entry: usize) {
    m.empty_expression_stack();
    m.call_vm(entry, true);
    m.trap(TrapCode::ShouldNotReachHere);
}

/// Remove the current frame for a pop frame request. An interpreted
/// caller re-executes its invoke with the arguments still on its stack;
/// a call from the VM gets the arguments back and re-issues the call.
fn pop_frame<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let from_vm = m.create_label();
    m.load(Reg::R5, Address::new(Reg::Thread, thread_off::POPFRAME_CONDITION), Width::W32, Extend::Zero);
    m.alu_imm(AluOp::Or, OpSize::Long, Reg::R5, Reg::R5, popframe::PROCESSING as i32);
    m.store(Reg::R5, Address::new(Reg::Thread, thread_off::POPFRAME_CONDITION), Width::W32);
    m.empty_expression_stack();

    m.load_ptr(Reg::R4, Reg::Fp, frame::RETURN_ADDRESS);
    let cell = m.ctx.call_stub_return_cell;
    m.mov_imm(Reg::R5, cell as i64);
    m.load_ptr(Reg::R5, Reg::R5, 0);
    m.branch(Cond::Eq, Reg::R4, Reg::R5, from_vm);

    m.unlock_and_notify(Preserve::State(TosState::Vtos), UnlockMode::Silent, false);
    m.leave_frame();
    m.mov_imm(Reg::R5, popframe::INACTIVE as i64);
    m.store(Reg::R5, Address::new(Reg::Thread, thread_off::POPFRAME_CONDITION), Width::W32);
    m.restore_interpreter_state();
    m.mov_imm(Reg::R5, 0);
    m.store_ptr(Reg::R5, Reg::Fp, frame::LAST_SP);
    m.dispatch_next(TosState::Vtos, 0);

    m.bind(from_vm);
    m.unlock_and_notify(Preserve::State(TosState::Vtos), UnlockMode::Silent, false);
    m.mov(Reg::R1, Reg::Locals);
    m.load(
        Reg::R2,
        Address::new(Reg::Method, crate::vm::method::offsets::SIZE_OF_PARAMETERS),
        Width::W16,
        Extend::Zero,
    );
    m.call_vm_leaf(runtime::preserve_popframe_args as *const () as usize);
    m.mov_imm(Reg::R5, popframe::FORCE_DEOPT_REEXECUTION as i64);
    m.store(Reg::R5, Address::new(Reg::Thread, thread_off::POPFRAME_CONDITION), Width::W32);
    m.return_to_caller();
}
