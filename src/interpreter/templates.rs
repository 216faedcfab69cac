//! Bytecode template bodies.
//!
//! Each body starts with its input value in the TOS registers (per the
//! template's `tos_in`) and either leaves its result there for the generic
//! dispatch appended by the generator or dispatches by itself.

use crate::codegen::masm::*;
use crate::vm::constants::{TAGS_BASE_OFFSET, VALUES_BASE_OFFSET, cache_flags, tag};
use crate::vm::klass::offsets as klass_off;
use crate::vm::method::offsets as method_off;
use crate::vm::oop::{ARRAY_BASE_OFFSET, ARRAY_LENGTH_OFFSET, BasicType, KLASS_OFFSET};

use super::bytecodes as bc;
use super::frame;
use super::interp_masm::{InterpMasm, Preserve, UnlockMode};
use super::runtime;
use super::stubs::StubId;
use super::template_table::Gen;
use super::tos::TosState;

/// Emit the body of `body`.
pub fn generate<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, body: Gen) {
    match body {
        Gen::Nop => {}
        Gen::AconstNull => m.mov_imm(Reg::Tos, 0),
        Gen::Iconst(v) => m.mov_imm(Reg::Tos, v as i64),
        Gen::Lconst(v) => m.mov_imm(Reg::Tos, v),
        Gen::Fconst(v) => {
            m.mov_imm(Reg::R5, v.to_bits() as i64);
            m.fmov_from_int(FTOS, Reg::R5, Precision::Single);
        }
        Gen::Dconst(v) => {
            m.mov_imm(Reg::R5, v.to_bits() as i64);
            m.fmov_from_int(FTOS, Reg::R5, Precision::Double);
        }
        Gen::Bipush => m.load(Reg::Tos, Address::new(Reg::Bcp, 1), Width::W8, Extend::Sign),
        Gen::Sipush => m.load_be(Reg::Tos, Address::new(Reg::Bcp, 1), Width::W16, Extend::Sign),
        Gen::Ldc { wide } => ldc(m, wide),
        Gen::Ldc2W => {
            m.load_be(Reg::R1, Address::new(Reg::Bcp, 1), Width::W16, Extend::Zero);
            m.load_ptr(Reg::R2, Reg::Method, method_off::CONSTANTS);
            m.load_ptr(Reg::R2, Reg::R2, VALUES_BASE_OFFSET);
            m.load_indexed(Reg::Tos, Indexed::new(Reg::R2, Reg::R1, 3, 0), Width::W64, Extend::Zero);
            m.push_long(Reg::Tos);
        }
        Gen::Load { state, wide } => {
            m.load_local_index(Reg::R4, if wide { 2 } else { 1 }, wide);
            let addr = m.local_indexed(Reg::R4, extra_slot(state));
            load_local(m, state, addr);
        }
        Gen::LoadN { state, index } => {
            let addr = m.local(index + extra_slot(state) as usize);
            match state {
                TosState::Ftos | TosState::Dtos => m.fload(FTOS, addr, precision(state)),
                _ => m.load(Reg::Tos, addr, Width::W64, Extend::Zero),
            }
        }
        Gen::Store { state, wide } => {
            m.load_local_index(Reg::R4, if wide { 2 } else { 1 }, wide);
            let addr = m.local_indexed(Reg::R4, extra_slot(state));
            store_local(m, state, addr);
        }
        Gen::StoreN { state, index } => {
            let addr = m.local(index + extra_slot(state) as usize);
            match state {
                TosState::Ftos => {
                    m.fmov_to_int(Reg::R5, FTOS, Precision::Single);
                    m.store(Reg::R5, addr, Width::W64);
                }
                TosState::Dtos => m.fstore(FTOS, addr, Precision::Double),
                _ => m.store(Reg::Tos, addr, Width::W64),
            }
        }
        Gen::ArrayLoad(elem) => array_load(m, elem),
        Gen::ArrayStore(elem) => array_store(m, elem),
        Gen::Aastore => aastore(m),
        Gen::Pop => m.add_imm(Reg::Sp, Reg::Sp, 8),
        Gen::Pop2 => m.add_imm(Reg::Sp, Reg::Sp, 16),
        Gen::Dup => {
            m.load_ptr(Reg::R1, Reg::Sp, 0);
            m.push(Reg::R1);
        }
        Gen::DupX1 => {
            // ..., v2, v1 -> ..., v1, v2, v1
            m.load_ptr(Reg::R1, Reg::Sp, 0);
            m.load_ptr(Reg::R2, Reg::Sp, 8);
            m.store_ptr(Reg::R1, Reg::Sp, 8);
            m.store_ptr(Reg::R2, Reg::Sp, 0);
            m.push(Reg::R1);
        }
        Gen::DupX2 => {
            // ..., v3, v2, v1 -> ..., v1, v3, v2, v1
            m.load_ptr(Reg::R1, Reg::Sp, 0);
            m.load_ptr(Reg::R2, Reg::Sp, 8);
            m.load_ptr(Reg::R3, Reg::Sp, 16);
            m.store_ptr(Reg::R1, Reg::Sp, 16);
            m.store_ptr(Reg::R3, Reg::Sp, 8);
            m.store_ptr(Reg::R2, Reg::Sp, 0);
            m.push(Reg::R1);
        }
        Gen::Dup2 => {
            m.load_ptr(Reg::R1, Reg::Sp, 0);
            m.load_ptr(Reg::R2, Reg::Sp, 8);
            m.push(Reg::R2);
            m.push(Reg::R1);
        }
        Gen::Dup2X1 => {
            // ..., v3, v2, v1 -> ..., v2, v1, v3, v2, v1
            m.load_ptr(Reg::R1, Reg::Sp, 0);
            m.load_ptr(Reg::R2, Reg::Sp, 8);
            m.load_ptr(Reg::R3, Reg::Sp, 16);
            m.store_ptr(Reg::R2, Reg::Sp, 16);
            m.store_ptr(Reg::R1, Reg::Sp, 8);
            m.store_ptr(Reg::R3, Reg::Sp, 0);
            m.push(Reg::R2);
            m.push(Reg::R1);
        }
        Gen::Dup2X2 => {
            // ..., v4, v3, v2, v1 -> ..., v2, v1, v4, v3, v2, v1
            m.load_ptr(Reg::R1, Reg::Sp, 0);
            m.load_ptr(Reg::R2, Reg::Sp, 8);
            m.load_ptr(Reg::R3, Reg::Sp, 16);
            m.load_ptr(Reg::R4, Reg::Sp, 24);
            m.store_ptr(Reg::R2, Reg::Sp, 24);
            m.store_ptr(Reg::R1, Reg::Sp, 16);
            m.store_ptr(Reg::R4, Reg::Sp, 8);
            m.store_ptr(Reg::R3, Reg::Sp, 0);
            m.push(Reg::R2);
            m.push(Reg::R1);
        }
        Gen::Swap => {
            m.load_ptr(Reg::R1, Reg::Sp, 0);
            m.load_ptr(Reg::R2, Reg::Sp, 8);
            m.store_ptr(Reg::R1, Reg::Sp, 8);
            m.store_ptr(Reg::R2, Reg::Sp, 0);
        }
        Gen::Iop(op) => {
            m.pop(Reg::R1);
            if matches!(op, AluOp::Div | AluOp::Rem) {
                m.branch_imm_stub(Cond::Eq, Reg::Tos, 0, StubId::ThrowArithmetic);
            }
            m.alu(op, OpSize::Int, Reg::Tos, Reg::R1, Reg::Tos);
        }
        Gen::Lop(op) => {
            m.pop_long(Reg::R1);
            if matches!(op, AluOp::Div | AluOp::Rem) {
                m.branch_imm_stub(Cond::Eq, Reg::Tos, 0, StubId::ThrowArithmetic);
            }
            m.alu(op, OpSize::Long, Reg::Tos, Reg::R1, Reg::Tos);
        }
        Gen::Lshift(op) => {
            m.pop_long(Reg::R1);
            m.alu(op, OpSize::Long, Reg::Tos, Reg::R1, Reg::Tos);
        }
        Gen::Fop(op, prec) => {
            pop_float_operand(m, prec);
            m.falu(op, prec, FTOS, FReg::F1, FTOS);
        }
        Gen::Frem(prec) => {
            pop_float_operand(m, prec);
            if prec == Precision::Single {
                m.float_to_float(FloatToFloat::F2D, FReg::F1, FReg::F1);
                m.float_to_float(FloatToFloat::F2D, FTOS, FTOS);
            }
            m.fmov(FReg::F2, FTOS);
            m.fmov(FTOS, FReg::F1);
            m.fmov(FReg::F1, FReg::F2);
            m.call_runtime_float(runtime::fmod as *const () as usize);
            if prec == Precision::Single {
                m.float_to_float(FloatToFloat::D2F, FTOS, FTOS);
            }
        }
        Gen::Ineg => m.neg(OpSize::Int, Reg::Tos, Reg::Tos),
        Gen::Lneg => m.neg(OpSize::Long, Reg::Tos, Reg::Tos),
        Gen::Fneg(prec) => m.funary(FloatUnary::Neg, prec, FTOS, FTOS),
        Gen::Iinc { wide } => {
            if wide {
                m.load_be(Reg::R4, Address::new(Reg::Bcp, 2), Width::W16, Extend::Zero);
                m.load_be(Reg::R5, Address::new(Reg::Bcp, 4), Width::W16, Extend::Sign);
            } else {
                m.load(Reg::R4, Address::new(Reg::Bcp, 1), Width::W8, Extend::Zero);
                m.load(Reg::R5, Address::new(Reg::Bcp, 2), Width::W8, Extend::Sign);
            }
            let addr = m.local_indexed(Reg::R4, 0);
            m.load_indexed(Reg::R3, addr, Width::W64, Extend::Zero);
            m.alu(AluOp::Add, OpSize::Int, Reg::R3, Reg::R3, Reg::R5);
            m.store_indexed(Reg::R3, addr, Width::W64);
        }
        Gen::Convert(code) => convert(m, code),
        Gen::Lcmp => {
            let done = m.create_label();
            m.pop_long(Reg::R1);
            m.mov_imm(Reg::R5, -1);
            m.branch(Cond::Lt, Reg::R1, Reg::Tos, done);
            m.mov_imm(Reg::R5, 1);
            m.branch(Cond::Gt, Reg::R1, Reg::Tos, done);
            m.mov_imm(Reg::R5, 0);
            m.bind(done);
            m.mov(Reg::Tos, Reg::R5);
        }
        Gen::Fcmp(prec, nan) => {
            pop_float_operand(m, prec);
            m.fcmp(Reg::Tos, FReg::F1, FTOS, prec, nan);
        }
        Gen::IfZero(cond) => if_cmp(m, |m, skip| m.branch_imm(cond.negate(), Reg::Tos, 0, skip)),
        Gen::IfIcmp(cond) | Gen::IfAcmp(cond) => if_cmp(m, |m, skip| {
            m.pop(Reg::R1);
            m.branch(cond.negate(), Reg::R1, Reg::Tos, skip);
        }),
        Gen::IfNull(cond) => if_cmp(m, |m, skip| m.branch_imm(cond.negate(), Reg::Tos, 0, skip)),
        Gen::Goto { wide } => branch_taken(m, wide),
        Gen::Tableswitch => tableswitch(m),
        Gen::Lookupswitch => lookupswitch(m),
        Gen::Return(state) => {
            m.unlock_and_notify(Preserve::State(state), UnlockMode::Throw, true);
            m.return_to_caller();
        }
        Gen::ReturnRegisterFinalizer => {
            let skip = m.create_label();
            m.load_ptr(Reg::R1, Reg::Locals, 0);
            m.load_ptr(Reg::R2, Reg::R1, KLASS_OFFSET);
            m.load(Reg::R2, Address::new(Reg::R2, klass_off::HAS_FINALIZER), Width::W8, Extend::Zero);
            m.branch_imm(Cond::Eq, Reg::R2, 0, skip);
            m.call_vm(runtime::register_finalizer as *const () as usize, true);
            m.bind(skip);
            m.unlock_and_notify(Preserve::State(TosState::Vtos), UnlockMode::Throw, true);
            m.return_to_caller();
        }
        Gen::Field { is_static, is_put } => {
            if is_put {
                put_field(m, is_static);
            } else {
                get_field(m, is_static);
            }
        }
        Gen::Invoke(code) => invoke(m, code),
        Gen::New => {
            m.load_be(Reg::R1, Address::new(Reg::Bcp, 1), Width::W16, Extend::Zero);
            m.call_vm_oop(runtime::new_instance as *const () as usize);
        }
        Gen::Newarray => {
            negative_length_check(m);
            m.mov(Reg::R2, Reg::Tos);
            m.load(Reg::R1, Address::new(Reg::Bcp, 1), Width::W8, Extend::Zero);
            m.call_vm_oop(runtime::new_type_array as *const () as usize);
        }
        Gen::Anewarray => {
            negative_length_check(m);
            m.mov(Reg::R2, Reg::Tos);
            m.load_be(Reg::R1, Address::new(Reg::Bcp, 1), Width::W16, Extend::Zero);
            m.call_vm_oop(runtime::new_object_array as *const () as usize);
        }
        Gen::Multianewarray => {
            m.load_be(Reg::R1, Address::new(Reg::Bcp, 1), Width::W16, Extend::Zero);
            m.load(Reg::R2, Address::new(Reg::Bcp, 3), Width::W8, Extend::Zero);
            m.mov(Reg::R3, Reg::Sp);
            m.call_vm_oop(runtime::multianewarray as *const () as usize);
            m.load(Reg::R2, Address::new(Reg::Bcp, 3), Width::W8, Extend::Zero);
            m.lea_indexed(Reg::Sp, Indexed::new(Reg::Sp, Reg::R2, 3, 0));
        }
        Gen::Arraylength => {
            m.null_check(Reg::Tos);
            m.load(Reg::Tos, Address::new(Reg::Tos, ARRAY_LENGTH_OFFSET), Width::W32, Extend::Zero);
        }
        Gen::Athrow => {
            m.null_check(Reg::Tos);
            m.jump_stub(StubId::ThrowException);
        }
        Gen::Checkcast => checkcast(m),
        Gen::Instanceof => instanceof(m),
        Gen::Monitorenter => monitorenter(m),
        Gen::Monitorexit => monitorexit(m),
        Gen::Wide => {
            m.load(Reg::R4, Address::new(Reg::Bcp, 1), Width::W8, Extend::Zero);
            let wide_base = m.ctx.wide_base;
            m.jump_through_table(wide_base, Reg::R4);
        }
        Gen::Unimplemented => m.jump_stub(StubId::UnimplementedBytecode),
    }
}

/// Two-slot values live in the higher-numbered local of their pair.
fn extra_slot(state: TosState) -> i32 {
    if state.slots() == 2 { 1 } else { 0 }
}

fn precision(state: TosState) -> Precision {
    state.precision().unwrap_or(Precision::Double)
}

fn load_local<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, state: TosState, addr: Indexed) {
    match state {
        TosState::Ftos | TosState::Dtos => m.fload_indexed(FTOS, addr, precision(state)),
        _ => m.load_indexed(Reg::Tos, addr, Width::W64, Extend::Zero),
    }
}

fn store_local<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, state: TosState, addr: Indexed) {
    match state {
        TosState::Ftos => {
            m.fmov_to_int(Reg::R5, FTOS, Precision::Single);
            m.store_indexed(Reg::R5, addr, Width::W64);
        }
        TosState::Dtos => m.fstore_indexed(FTOS, addr, Precision::Double),
        _ => m.store_indexed(Reg::Tos, addr, Width::W64),
    }
}

/// Pop the left operand of a float operation into `F1`.
fn pop_float_operand<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, prec: Precision) {
    m.fload(FReg::F1, Address::new(Reg::Sp, 0), prec);
    let slots = if prec == Precision::Double { 16 } else { 8 };
    m.add_imm(Reg::Sp, Reg::Sp, slots);
}

fn ldc<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, wide: bool) {
    let push_value = m.create_label();
    let is_class = m.create_label();
    if wide {
        m.load_be(Reg::R1, Address::new(Reg::Bcp, 1), Width::W16, Extend::Zero);
    } else {
        m.load(Reg::R1, Address::new(Reg::Bcp, 1), Width::W8, Extend::Zero);
    }
    m.load_ptr(Reg::R2, Reg::Method, method_off::CONSTANTS);
    m.load_ptr(Reg::R3, Reg::R2, TAGS_BASE_OFFSET);
    m.load_indexed(Reg::R3, Indexed::new(Reg::R3, Reg::R1, 0, 0), Width::W8, Extend::Zero);
    m.load_ptr(Reg::R2, Reg::R2, VALUES_BASE_OFFSET);
    m.load_indexed(Reg::Tos, Indexed::new(Reg::R2, Reg::R1, 3, 0), Width::W64, Extend::Zero);
    m.branch_imm(Cond::Eq, Reg::R3, tag::INTEGER as i32, push_value);
    m.branch_imm(Cond::Eq, Reg::R3, tag::FLOAT as i32, push_value);
    m.branch_imm(Cond::Eq, Reg::R3, tag::STRING as i32, push_value);
    m.branch_imm(Cond::Eq, Reg::R3, tag::CLASS as i32, is_class);
    m.mov_imm(Reg::R1, wide as i64);
    m.call_vm_oop(runtime::ldc as *const () as usize);
    m.jump(push_value);
    m.bind(is_class);
    m.load_ptr(Reg::Tos, Reg::Tos, klass_off::MIRROR);
    m.bind(push_value);
    m.push(Reg::Tos);
}

fn element_shift(elem: BasicType) -> u8 {
    match elem.element_size() {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

/// Null and bounds check of `array[index]`; the index goes to `R1` for the stub.
fn index_check<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, array: Reg, index: Reg) {
    let ok = m.create_label();
    m.null_check(array);
    m.load(Reg::R5, Address::new(array, ARRAY_LENGTH_OFFSET), Width::W32, Extend::Zero);
    m.branch(Cond::Below, index, Reg::R5, ok);
    m.mov(Reg::R1, index);
    m.jump_stub(StubId::ThrowArrayIndexOutOfBounds);
    m.bind(ok);
}

fn array_load<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, elem: BasicType) {
    m.pop(Reg::R2);
    index_check(m, Reg::R2, Reg::Tos);
    let addr = Indexed::new(Reg::R2, Reg::Tos, element_shift(elem), ARRAY_BASE_OFFSET);
    match elem {
        BasicType::Boolean | BasicType::Byte => m.load_indexed(Reg::Tos, addr, Width::W8, Extend::Sign),
        BasicType::Char => m.load_indexed(Reg::Tos, addr, Width::W16, Extend::Zero),
        BasicType::Short => m.load_indexed(Reg::Tos, addr, Width::W16, Extend::Sign),
        BasicType::Int => m.load_indexed(Reg::Tos, addr, Width::W32, Extend::Sign),
        BasicType::Float => m.fload_indexed(FTOS, addr, Precision::Single),
        BasicType::Double => m.fload_indexed(FTOS, addr, Precision::Double),
        _ => m.load_indexed(Reg::Tos, addr, Width::W64, Extend::Zero),
    }
}

fn array_store<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, elem: BasicType) {
    m.pop(Reg::R1);
    m.pop(Reg::R2);
    index_check(m, Reg::R2, Reg::R1);
    let addr = Indexed::new(Reg::R2, Reg::R1, element_shift(elem), ARRAY_BASE_OFFSET);
    match elem {
        BasicType::Float => m.fstore_indexed(FTOS, addr, Precision::Single),
        BasicType::Double => m.fstore_indexed(FTOS, addr, Precision::Double),
        _ => {
            let width = match elem.element_size() {
                1 => Width::W8,
                2 => Width::W16,
                4 => Width::W32,
                _ => Width::W64,
            };
            m.store_indexed(Reg::Tos, addr, width);
        }
    }
}

/// `Tos` = value, `R1` = index, `R2` = array, all still on the stack.
fn reload_aastore_operands<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.load_ptr(Reg::Tos, Reg::Sp, 0);
    m.load_ptr(Reg::R1, Reg::Sp, 8);
    m.load_ptr(Reg::R2, Reg::Sp, 16);
}

fn aastore<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let store = m.create_label();
    reload_aastore_operands(m);
    index_check(m, Reg::R2, Reg::R1);
    m.branch_imm(Cond::Eq, Reg::Tos, 0, store);
    m.load_ptr(Reg::R3, Reg::Tos, KLASS_OFFSET);
    m.load_ptr(Reg::R4, Reg::R2, KLASS_OFFSET);
    m.load_ptr(Reg::R4, Reg::R4, klass_off::ELEMENT_KLASS);
    m.branch(Cond::Eq, Reg::R3, Reg::R4, store);
    m.mov(Reg::R1, Reg::Tos);
    m.call_vm(runtime::aastore_check as *const () as usize, true);
    reload_aastore_operands(m);
    m.bind(store);
    m.lea_indexed(Reg::R3, Indexed::new(Reg::R2, Reg::R1, 3, ARRAY_BASE_OFFSET));
    if m.config().gc_barrier == crate::config::GcBarrier::Satb {
        m.satb_pre_barrier(Reg::R3);
        reload_aastore_operands(m);
        m.lea_indexed(Reg::R3, Indexed::new(Reg::R2, Reg::R1, 3, ARRAY_BASE_OFFSET));
    }
    m.store_ptr(Reg::Tos, Reg::R3, 0);
    m.add_imm(Reg::Sp, Reg::Sp, 24);
}

fn convert<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, code: u8) {
    match code {
        bc::I2L | bc::L2I => m.extend(Reg::Tos, Reg::Tos, Width::W32, Extend::Sign),
        bc::I2F => m.int_to_float(IntToFloat::I2F, FTOS, Reg::Tos),
        bc::I2D => m.int_to_float(IntToFloat::I2D, FTOS, Reg::Tos),
        bc::L2F => m.int_to_float(IntToFloat::L2F, FTOS, Reg::Tos),
        bc::L2D => m.int_to_float(IntToFloat::L2D, FTOS, Reg::Tos),
        bc::F2I => m.float_to_int(FloatToInt::F2I, Reg::Tos, FTOS),
        bc::F2L => m.float_to_int(FloatToInt::F2L, Reg::Tos, FTOS),
        bc::D2I => m.float_to_int(FloatToInt::D2I, Reg::Tos, FTOS),
        bc::D2L => m.float_to_int(FloatToInt::D2L, Reg::Tos, FTOS),
        bc::F2D => m.float_to_float(FloatToFloat::F2D, FTOS, FTOS),
        bc::D2F => m.float_to_float(FloatToFloat::D2F, FTOS, FTOS),
        bc::I2B => m.extend(Reg::Tos, Reg::Tos, Width::W8, Extend::Sign),
        bc::I2C => m.extend(Reg::Tos, Reg::Tos, Width::W16, Extend::Zero),
        bc::I2S => m.extend(Reg::Tos, Reg::Tos, Width::W16, Extend::Sign),
        _ => m.trap(TrapCode::ShouldNotReachHere),
    }
}

/// Taken branch: profile, count backward branches, move `bcp` by the
/// offset operand and dispatch.
fn branch_taken<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, wide: bool) {
    m.profile_branch(0);
    let width = if wide { Width::W32 } else { Width::W16 };
    m.load_be(Reg::R3, Address::new(Reg::Bcp, 1), width, Extend::Sign);
    m.backedge_counter();
    m.alu(AluOp::Add, OpSize::Long, Reg::Bcp, Reg::Bcp, Reg::R3);
    m.dispatch_next(TosState::Vtos, 0);
}

/// A conditional branch; `test` jumps to its label when not taken.
fn if_cmp<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, test: impl FnOnce(&mut InterpMasm<'_, M>, Label)) {
    let not_taken = m.create_label();
    test(m, not_taken);
    branch_taken(m, false);
    m.bind(not_taken);
    m.profile_branch(8);
    m.dispatch_next(TosState::Vtos, 3);
}

/// `R1` = address of the 4-byte aligned switch operands.
fn switch_operands<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.load_ptr(Reg::R1, Reg::Method, method_off::CODE_BASE);
    m.alu(AluOp::Sub, OpSize::Long, Reg::R2, Reg::Bcp, Reg::R1);
    m.add_imm(Reg::R2, Reg::R2, 4);
    m.alu_imm(AluOp::And, OpSize::Long, Reg::R2, Reg::R2, -4);
    m.alu(AluOp::Add, OpSize::Long, Reg::R1, Reg::R1, Reg::R2);
}

fn switch_dispatch<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.backedge_counter();
    m.alu(AluOp::Add, OpSize::Long, Reg::Bcp, Reg::Bcp, Reg::R3);
    m.dispatch_next(TosState::Vtos, 0);
}

fn tableswitch<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let default = m.create_label();
    let go = m.create_label();
    switch_operands(m);
    m.load_be(Reg::R2, Address::new(Reg::R1, 4), Width::W32, Extend::Sign);
    m.load_be(Reg::R4, Address::new(Reg::R1, 8), Width::W32, Extend::Sign);
    m.branch(Cond::Lt, Reg::Tos, Reg::R2, default);
    m.branch(Cond::Gt, Reg::Tos, Reg::R4, default);
    m.alu(AluOp::Sub, OpSize::Long, Reg::R2, Reg::Tos, Reg::R2);
    m.lea_indexed(Reg::R4, Indexed::new(Reg::R1, Reg::R2, 2, 12));
    m.load_be(Reg::R3, Address::new(Reg::R4, 0), Width::W32, Extend::Sign);
    m.jump(go);
    m.bind(default);
    m.load_be(Reg::R3, Address::new(Reg::R1, 0), Width::W32, Extend::Sign);
    m.bind(go);
    switch_dispatch(m);
}

fn lookupswitch<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let scan = m.create_label();
    let found = m.create_label();
    let default = m.create_label();
    let go = m.create_label();
    switch_operands(m);
    m.load_be(Reg::R4, Address::new(Reg::R1, 4), Width::W32, Extend::Sign);
    m.lea(Reg::R2, Address::new(Reg::R1, 8));
    m.bind(scan);
    m.branch_imm(Cond::Le, Reg::R4, 0, default);
    m.load_be(Reg::R5, Address::new(Reg::R2, 0), Width::W32, Extend::Sign);
    m.branch(Cond::Eq, Reg::R5, Reg::Tos, found);
    m.add_imm(Reg::R2, Reg::R2, 8);
    m.add_imm(Reg::R4, Reg::R4, -1);
    m.jump(scan);
    m.bind(found);
    m.load_be(Reg::R3, Address::new(Reg::R2, 4), Width::W32, Extend::Sign);
    m.jump(go);
    m.bind(default);
    m.load_be(Reg::R3, Address::new(Reg::R1, 0), Width::W32, Extend::Sign);
    m.bind(go);
    switch_dispatch(m);
}

/// Branch on the field state in `R4` to `two` for two-slot values.
fn branch_two_slots<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, two: Label) {
    m.branch_imm(Cond::Eq, Reg::R4, TosState::Ltos as i32, two);
    m.branch_imm(Cond::Eq, Reg::R4, TosState::Dtos as i32, two);
}

/// After resolution: `R1` = flags, `R3` = field offset, `R4` = state,
/// and for statics `R0` = holder mirror.
fn field_entry<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, code: u8, is_put: bool, is_static: bool) {
    m.resolve_cache_entry(code, is_put);
    m.load(Reg::R1, Address::new(Reg::R2, 4), Width::W32, Extend::Zero);
    m.load_ptr(Reg::R3, Reg::R2, 16);
    if is_static {
        m.load_ptr(Reg::R0, Reg::R2, 8);
    }
    m.alu_imm(AluOp::And, OpSize::Long, Reg::R4, Reg::R1, cache_flags::TOS_MASK as i32);
}

fn volatile_barrier<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, flags: Reg, kind: Membar) {
    let skip = m.create_label();
    m.alu_imm(AluOp::And, OpSize::Long, flags, flags, cache_flags::IS_VOLATILE as i32);
    m.branch_imm(Cond::Eq, flags, 0, skip);
    m.membar(kind);
    m.bind(skip);
}

fn get_field<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, is_static: bool) {
    let code = if is_static { bc::GETSTATIC } else { bc::GETFIELD };
    let two = m.create_label();
    let done = m.create_label();
    field_entry(m, code, false, is_static);
    if !is_static {
        m.pop(Reg::R0);
        m.null_check(Reg::R0);
    }
    m.load_indexed(Reg::Tos, Indexed::new(Reg::R0, Reg::R3, 0, 0), Width::W64, Extend::Zero);
    volatile_barrier(m, Reg::R1, Membar::LoadLoad);
    branch_two_slots(m, two);
    m.push(Reg::Tos);
    m.jump(done);
    m.bind(two);
    m.push_long(Reg::Tos);
    m.bind(done);
}

fn put_field<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, is_static: bool) {
    let code = if is_static { bc::PUTSTATIC } else { bc::PUTFIELD };
    let two = m.create_label();
    let popped = m.create_label();
    let narrowed = m.create_label();
    field_entry(m, code, true, is_static);
    branch_two_slots(m, two);
    m.pop(Reg::Tos);
    m.jump(popped);
    m.bind(two);
    m.pop_long(Reg::Tos);
    m.bind(popped);
    if !is_static {
        m.pop(Reg::R0);
        m.null_check(Reg::R0);
    }

    // fields are 8-byte slots holding the value extended to 64 bits
    let narrowing = [
        (TosState::Btos, Width::W8, Extend::Sign),
        (TosState::Ctos, Width::W16, Extend::Zero),
        (TosState::Stos, Width::W16, Extend::Sign),
        (TosState::Itos, Width::W32, Extend::Sign),
        (TosState::Ftos, Width::W32, Extend::Zero),
    ];
    for (state, width, ext) in narrowing {
        let next = m.create_label();
        m.branch_imm(Cond::Ne, Reg::R4, state as i32, next);
        m.extend(Reg::Tos, Reg::Tos, width, ext);
        m.jump(narrowed);
        m.bind(next);
    }
    let not_bool = m.create_label();
    m.branch_imm(Cond::Ne, Reg::R4, TosState::Ztos as i32, not_bool);
    m.alu_imm(AluOp::And, OpSize::Long, Reg::Tos, Reg::Tos, 1);
    m.jump(narrowed);
    m.bind(not_bool);
    if m.config().gc_barrier == crate::config::GcBarrier::Satb {
        m.branch_imm(Cond::Ne, Reg::R4, TosState::Atos as i32, narrowed);
        m.push(Reg::Tos);
        m.push(Reg::R0);
        m.push(Reg::R3);
        m.lea_indexed(Reg::R2, Indexed::new(Reg::R0, Reg::R3, 0, 0));
        m.satb_pre_barrier(Reg::R2);
        m.pop(Reg::R3);
        m.pop(Reg::R0);
        m.pop(Reg::Tos);
    }
    m.bind(narrowed);
    m.store_indexed(Reg::Tos, Indexed::new(Reg::R0, Reg::R3, 0, 0), Width::W64);
    m.get_cache_entry(Reg::R2, 1);
    m.load(Reg::R1, Address::new(Reg::R2, 4), Width::W32, Extend::Zero);
    volatile_barrier(m, Reg::R1, Membar::StoreLoad);
}

fn invoke<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, code: u8) {
    let length = bc::length(code).unwrap_or(3) as usize;
    m.resolve_cache_entry(code, code == bc::INVOKEVIRTUAL);
    m.load(Reg::R1, Address::new(Reg::R2, 4), Width::W32, Extend::Zero);

    if code != bc::INVOKESTATIC {
        // receiver is the deepest argument
        m.alu_imm(AluOp::Shr, OpSize::Long, Reg::R3, Reg::R1, cache_flags::PARAM_SIZE_SHIFT as i32);
        m.alu_imm(AluOp::And, OpSize::Long, Reg::R3, Reg::R3, cache_flags::PARAM_SIZE_MASK as i32);
        m.load_indexed(Reg::R0, Indexed::new(Reg::Sp, Reg::R3, 3, -8), Width::W64, Extend::Zero);
        m.null_check(Reg::R0);
    }

    match code {
        bc::INVOKESTATIC | bc::INVOKESPECIAL => m.load_ptr(Reg::R4, Reg::R2, 8),
        bc::INVOKEVIRTUAL => {
            let vfinal = m.create_label();
            let selected = m.create_label();
            m.alu_imm(AluOp::And, OpSize::Long, Reg::R5, Reg::R1, cache_flags::IS_VFINAL as i32);
            m.branch_imm(Cond::Ne, Reg::R5, 0, vfinal);
            m.load_ptr(Reg::R5, Reg::R0, KLASS_OFFSET);
            m.load_ptr(Reg::R5, Reg::R5, klass_off::VTABLE_BASE);
            m.load_ptr(Reg::R3, Reg::R2, 16);
            m.load_indexed(Reg::R4, Indexed::new(Reg::R5, Reg::R3, 3, 0), Width::W64, Extend::Zero);
            m.jump(selected);
            m.bind(vfinal);
            m.load_ptr(Reg::R4, Reg::R2, 16);
            m.bind(selected);
        }
        _ => {
            let hit = m.create_label();
            let selected = m.create_label();
            m.load_ptr(Reg::R5, Reg::R0, KLASS_OFFSET);
            m.load_ptr(Reg::R3, Reg::R2, 8);
            m.branch(Cond::Eq, Reg::R5, Reg::R3, hit);
            m.mov(Reg::R1, Reg::R0);
            m.call_vm(runtime::resolve_interface_call as *const () as usize, true);
            m.mov(Reg::R4, RET);
            m.get_cache_entry(Reg::R2, 1);
            m.load(Reg::R1, Address::new(Reg::R2, 4), Width::W32, Extend::Zero);
            m.jump(selected);
            m.bind(hit);
            m.load_ptr(Reg::R4, Reg::R2, 16);
            m.bind(selected);
        }
    }

    // return address = return entry for the result state
    m.alu_imm(AluOp::And, OpSize::Long, Reg::R3, Reg::R1, cache_flags::TOS_MASK as i32);
    let table = m.ctx.return_entry(length);
    m.mov_imm(Reg::R5, table as i64);
    m.load_indexed(Reg::R5, Indexed::new(Reg::R5, Reg::R3, 3, 0), Width::W64, Extend::Zero);

    m.save_bcp();
    m.store_ptr(Reg::Sp, Reg::Fp, frame::LAST_SP);
    m.mov(Reg::SenderSp, Reg::Sp);
    m.mov(Reg::Method, Reg::R4);
    m.push(Reg::R5);
    m.load_ptr(Reg::R5, Reg::Method, method_off::FROM_INTERPRETED_ENTRY);
    m.jump_reg(Reg::R5);
}

fn negative_length_check<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let ok = m.create_label();
    m.branch_imm(Cond::Ge, Reg::Tos, 0, ok);
    m.mov(Reg::R1, Reg::Tos);
    m.jump_stub(StubId::ThrowNegativeArraySize);
    m.bind(ok);
}

/// Fast exact-class check against a resolved constant pool class.
/// Leaves the class index in `R4`; jumps to `hit` on an exact match and
/// falls through otherwise.
fn quick_class_check<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, hit: Label) {
    let slow = m.create_label();
    m.load_be(Reg::R4, Address::new(Reg::Bcp, 1), Width::W16, Extend::Zero);
    m.load_ptr(Reg::R5, Reg::Method, method_off::CONSTANTS);
    m.load_ptr(Reg::R1, Reg::R5, TAGS_BASE_OFFSET);
    m.load_indexed(Reg::R1, Indexed::new(Reg::R1, Reg::R4, 0, 0), Width::W8, Extend::Zero);
    m.branch_imm(Cond::Ne, Reg::R1, tag::CLASS as i32, slow);
    m.load_ptr(Reg::R5, Reg::R5, VALUES_BASE_OFFSET);
    m.load_indexed(Reg::R5, Indexed::new(Reg::R5, Reg::R4, 3, 0), Width::W64, Extend::Zero);
    m.load_ptr(Reg::R3, Reg::Tos, KLASS_OFFSET);
    m.branch(Cond::Eq, Reg::R3, Reg::R5, hit);
    m.bind(slow);
}

fn checkcast<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let done = m.create_label();
    m.branch_imm(Cond::Eq, Reg::Tos, 0, done);
    quick_class_check(m, done);
    m.push(Reg::Tos);
    m.mov(Reg::R1, Reg::Tos);
    m.mov(Reg::R2, Reg::R4);
    m.call_vm(runtime::instance_of as *const () as usize, true);
    m.mov(Reg::R1, RET);
    m.pop(Reg::Tos);
    m.branch_imm(Cond::Ne, Reg::R1, 0, done);
    m.mov(Reg::R1, Reg::Tos);
    m.jump_stub(StubId::ThrowClassCast);
    m.bind(done);
}

fn instanceof<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let done = m.create_label();
    let yes = m.create_label();
    m.branch_imm(Cond::Eq, Reg::Tos, 0, done);
    quick_class_check(m, yes);
    m.mov(Reg::R1, Reg::Tos);
    m.mov(Reg::R2, Reg::R4);
    m.call_vm(runtime::instance_of as *const () as usize, true);
    m.jump(done);
    m.bind(yes);
    m.mov_imm(Reg::Tos, 1);
    m.bind(done);
}

/// `R4` = monitor block top, `R3` = its bottom.
fn monitor_bounds<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    m.load_ptr(Reg::R5, Reg::Fp, frame::MONITOR_BLOCK_TOP);
    m.lea_indexed(Reg::R4, Indexed::new(Reg::Fp, Reg::R5, 3, 0));
    m.lea(Reg::R3, Address::new(Reg::Fp, frame::MONITOR_BLOCK_BOTTOM * 8));
}

fn monitorenter<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let scan = m.create_label();
    let scanned = m.create_label();
    let allocated = m.create_label();
    m.null_check(Reg::Tos);

    // look for a free monitor
    m.mov_imm(Reg::R1, 0);
    monitor_bounds(m);
    m.bind(scan);
    m.branch(Cond::AboveEq, Reg::R4, Reg::R3, scanned);
    let used = m.create_label();
    m.load_ptr(Reg::R5, Reg::R4, frame::MONITOR_OBJ_OFFSET);
    m.branch_imm(Cond::Ne, Reg::R5, 0, used);
    m.mov(Reg::R1, Reg::R4);
    m.bind(used);
    m.add_imm(Reg::R4, Reg::R4, frame::MONITOR_SIZE);
    m.jump(scan);
    m.bind(scanned);
    m.branch_imm(Cond::Ne, Reg::R1, 0, allocated);

    // none free: grow the block by moving the expression stack down
    let copy = m.create_label();
    let copied = m.create_label();
    m.load_ptr(Reg::R5, Reg::Fp, frame::MONITOR_BLOCK_TOP);
    m.lea_indexed(Reg::R3, Indexed::new(Reg::Fp, Reg::R5, 3, 0));
    m.add_imm(Reg::R5, Reg::R5, -(frame::MONITOR_SIZE / 8));
    m.store_ptr(Reg::R5, Reg::Fp, frame::MONITOR_BLOCK_TOP);
    m.mov(Reg::R4, Reg::Sp);
    m.add_imm(Reg::Sp, Reg::Sp, -frame::MONITOR_SIZE);
    m.bind(copy);
    m.branch(Cond::AboveEq, Reg::R4, Reg::R3, copied);
    m.load_ptr(Reg::R5, Reg::R4, 0);
    m.store_ptr(Reg::R5, Reg::R4, -frame::MONITOR_SIZE);
    m.add_imm(Reg::R4, Reg::R4, 8);
    m.jump(copy);
    m.bind(copied);
    m.lea(Reg::R1, Address::new(Reg::R3, -frame::MONITOR_SIZE));

    m.bind(allocated);
    m.mov_imm(Reg::R5, 0);
    m.store_ptr(Reg::R5, Reg::R1, frame::MONITOR_LOCK_OFFSET);
    m.store_ptr(Reg::Tos, Reg::R1, frame::MONITOR_OBJ_OFFSET);
    m.call_vm(runtime::monitorenter as *const () as usize, true);
}

fn monitorexit<M: MacroAssembler>(m: &mut InterpMasm<'_, M>) {
    let scan = m.create_label();
    let found = m.create_label();
    let not_found = m.create_label();
    m.null_check(Reg::Tos);
    monitor_bounds(m);
    m.bind(scan);
    m.branch(Cond::AboveEq, Reg::R4, Reg::R3, not_found);
    m.load_ptr(Reg::R5, Reg::R4, frame::MONITOR_OBJ_OFFSET);
    m.branch(Cond::Eq, Reg::R5, Reg::Tos, found);
    m.add_imm(Reg::R4, Reg::R4, frame::MONITOR_SIZE);
    m.jump(scan);
    m.bind(not_found);
    m.jump_stub(StubId::ThrowIllegalMonitorState);
    m.bind(found);
    m.mov(Reg::R1, Reg::R4);
    m.call_vm(runtime::monitorexit as *const () as usize, true);
}
