//! Interpreter-specific emission helpers layered over [`MacroAssembler`].
//!
//! Register roles inside generated interpreter code:
//!
//! - `Tos`/`F0` cache the top of stack according to the current [`TosState`]
//! - `Method`, `Bcp`, `Locals` (address of local 0), `Cache` mirror the
//!   frame slots and are reloaded from the frame after every VM call
//! - `Thread` is the current `JavaThread`
//! - `R4`/`R5` are scratch for dispatch and the helpers below; `R1..R3`
//!   carry arguments into VM calls and stubs

use std::ops::{Deref, DerefMut};

use crate::codegen::masm::*;
use crate::config::{GcBarrier, InterpreterConfig};
use crate::vm::constants::{BYTECODE_1_OFFSET, BYTECODE_2_OFFSET, CP_CACHE_ENTRY_SIZE};
use crate::vm::method::offsets as method_off;
use crate::vm::thread::offsets as thread_off;
use crate::vm::thread::{ThreadState, earlyret, popframe};

use super::dispatch::STATE_STRIDE;
use super::frame;
use super::runtime;
use super::stubs::StubId;
use super::tos::TosState;

/// Addresses and settings captured into generated code.
#[derive(Debug, Clone)]
pub struct GenContext {
    pub config: InterpreterConfig,
    pub poll_word: usize,
    pub satb_marking: usize,
    pub active_cell: usize,
    pub normal_base: usize,
    pub wide_base: usize,
    pub stub_cells: Vec<usize>,
    /// `[usize; NUMBER_OF_STATES]` arrays, indexed like `INVOKE_LENGTHS`.
    pub return_entries: [usize; 2],
    pub earlyret_entry: usize,
    pub result_handlers: usize,
    /// `[usize; NUMBER_OF_METHOD_KINDS]`, indexed by `MethodKind`.
    pub method_entries: usize,
    pub call_stub_return_cell: usize,
}

impl GenContext {
    pub fn stub_cell(&self, id: StubId) -> usize {
        self.stub_cells[id.index()]
    }

    pub fn return_entry(&self, length: usize) -> usize {
        if length == 5 { self.return_entries[1] } else { self.return_entries[0] }
    }
}

/// What `unlock_and_notify` does with a method monitor that is not held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMode {
    /// Ignore it (pop frame, early return).
    Silent,
    /// Throw `IllegalMonitorStateException` (normal return).
    Throw,
    /// Replace the exception being propagated (remove activation).
    Install,
}

impl UnlockMode {
    fn code(self) -> i64 {
        match self {
            UnlockMode::Silent => 0,
            UnlockMode::Throw => 1,
            UnlockMode::Install => 2,
        }
    }
}

/// Values kept live across `unlock_and_notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preserve {
    State(TosState),
    /// Both result registers, for native results of any type.
    Both,
}

pub struct InterpMasm<'a, M: MacroAssembler> {
    masm: M,
    pub ctx: &'a GenContext,
}

impl<M: MacroAssembler> Deref for InterpMasm<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.masm
    }
}

impl<M: MacroAssembler> DerefMut for InterpMasm<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.masm
    }
}

impl<'a, M: MacroAssembler> InterpMasm<'a, M> {
    pub fn new(base: usize, ctx: &'a GenContext) -> Self {
        Self {
            masm: M::new(base),
            ctx,
        }
    }

    pub fn finish(self) -> Result<Vec<u8>, String> {
        self.masm.finish()
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.ctx.config
    }

    // ----- stubs -----

    /// Jump to a shared stub through its cell. Clobbers `R5`.
    pub fn jump_stub(&mut self, id: StubId) {
        let cell = self.ctx.stub_cell(id);
        self.mov_imm(Reg::R5, cell as i64);
        self.load_ptr(Reg::R5, Reg::R5, 0);
        self.jump_reg(Reg::R5);
    }

    pub fn branch_imm_stub(&mut self, cond: Cond, lhs: Reg, imm: i32, id: StubId) {
        let skip = self.create_label();
        self.branch_imm(cond.negate(), lhs, imm, skip);
        self.jump_stub(id);
        self.bind(skip);
    }

    pub fn null_check(&mut self, reg: Reg) {
        self.branch_imm_stub(Cond::Eq, reg, 0, StubId::ThrowNullPointer);
    }

    // ----- expression stack -----

    pub fn push_tos(&mut self, state: TosState) {
        match state {
            TosState::Vtos => {}
            TosState::Ltos => {
                self.push(Reg::Tos);
                self.push(Reg::Tos);
            }
            TosState::Ftos => {
                self.fmov_to_int(Reg::R5, FTOS, Precision::Single);
                self.push(Reg::R5);
            }
            TosState::Dtos => {
                self.fmov_to_int(Reg::R5, FTOS, Precision::Double);
                self.push(Reg::R5);
                self.push(Reg::R5);
            }
            _ => self.push(Reg::Tos),
        }
    }

    pub fn pop_tos(&mut self, state: TosState) {
        match state {
            TosState::Vtos => {}
            TosState::Ltos => {
                self.pop(Reg::Tos);
                self.add_imm(Reg::Sp, Reg::Sp, 8);
            }
            TosState::Ftos => {
                self.fload(FTOS, Address::new(Reg::Sp, 0), Precision::Single);
                self.add_imm(Reg::Sp, Reg::Sp, 8);
            }
            TosState::Dtos => {
                self.fload(FTOS, Address::new(Reg::Sp, 0), Precision::Double);
                self.add_imm(Reg::Sp, Reg::Sp, 16);
            }
            _ => self.pop(Reg::Tos),
        }
    }

    /// Pop a two-slot value into `dst`.
    pub fn pop_long(&mut self, dst: Reg) {
        self.pop(dst);
        self.add_imm(Reg::Sp, Reg::Sp, 8);
    }

    pub fn push_long(&mut self, src: Reg) {
        self.push(src);
        self.push(src);
    }

    /// Discard the expression stack: `sp = monitor block top`.
    pub fn empty_expression_stack(&mut self) {
        self.load_ptr(Reg::R5, Reg::Fp, frame::MONITOR_BLOCK_TOP);
        self.lea_indexed(Reg::Sp, Indexed::new(Reg::Fp, Reg::R5, 3, 0));
    }

    // ----- locals -----

    pub fn local(&self, index: usize) -> Address {
        Address::new(Reg::Locals, -(index as i32) * 8)
    }

    /// Address of the local whose index is in `index` (clobbered).
    pub fn local_indexed(&mut self, index: Reg, extra: i32) -> Indexed {
        self.neg(OpSize::Long, index, index);
        Indexed::new(Reg::Locals, index, 3, -extra * 8)
    }

    /// Load the unsigned local index operand at `bcp + offset`.
    pub fn load_local_index(&mut self, dst: Reg, offset: i32, wide: bool) {
        if wide {
            self.load_be(dst, Address::new(Reg::Bcp, offset), Width::W16, Extend::Zero);
        } else {
            self.load(dst, Address::new(Reg::Bcp, offset), Width::W8, Extend::Zero);
        }
    }

    // ----- frame state -----

    pub fn save_bcp(&mut self) {
        self.store_ptr(Reg::Bcp, Reg::Fp, frame::BCP);
    }

    pub fn restore_bcp(&mut self) {
        self.load_ptr(Reg::Bcp, Reg::Fp, frame::BCP);
    }

    pub fn restore_locals(&mut self) {
        self.load_ptr(Reg::R5, Reg::Fp, frame::LOCALS);
        self.lea_indexed(Reg::Locals, Indexed::new(Reg::Fp, Reg::R5, 3, 0));
    }

    /// Reload every cached frame register from the frame.
    pub fn restore_interpreter_state(&mut self) {
        self.load_ptr(Reg::Method, Reg::Fp, frame::METHOD);
        self.restore_bcp();
        self.restore_locals();
        self.load_ptr(Reg::Cache, Reg::Fp, frame::CACHE);
    }

    /// Pop the current frame: `sp = sender_sp`, the return address ends up in `Bcp`.
    pub fn leave_frame(&mut self) {
        self.load_ptr(Reg::R5, Reg::Fp, frame::SENDER_SP);
        self.mov(Reg::Sp, Reg::Fp);
        self.pop(Reg::Fp);
        self.pop(Reg::Bcp);
        self.mov(Reg::Sp, Reg::R5);
    }

    // ----- dispatch -----

    /// Check `sp <= monitor block top`. Clobbers `R5`.
    pub fn verify_frame(&mut self) {
        if !self.config().verify_stack {
            return;
        }
        let ok = self.create_label();
        self.load_ptr(Reg::R5, Reg::Fp, frame::MONITOR_BLOCK_TOP);
        self.lea_indexed(Reg::R5, Indexed::new(Reg::Fp, Reg::R5, 3, 0));
        self.branch(Cond::BelowEq, Reg::Sp, Reg::R5, ok);
        self.trap(TrapCode::StackInvariant);
        self.bind(ok);
    }

    /// Advance `bcp` by `step` and dispatch its bytecode in `state`
    /// through the active table. Clobbers `R4` and `R5`.
    pub fn dispatch_next(&mut self, state: TosState, step: i32) {
        self.verify_frame();
        self.load(Reg::R4, Address::new(Reg::Bcp, step), Width::W8, Extend::Zero);
        if step != 0 {
            self.add_imm(Reg::Bcp, Reg::Bcp, step);
        }
        let active = self.ctx.active_cell;
        self.mov_imm(Reg::R5, active as i64);
        self.load_ptr(Reg::R5, Reg::R5, 0);
        self.dispatch_indexed(state, Reg::R5);
    }

    /// Dispatch the opcode in `R4` through the table whose base is in `table`.
    fn dispatch_indexed(&mut self, state: TosState, table: Reg) {
        let disp = state.index() as i32 * STATE_STRIDE;
        self.load_indexed(Reg::R5, Indexed::new(table, Reg::R4, 3, disp), Width::W64, Extend::Zero);
        self.jump_reg(Reg::R5);
    }

    /// Jump to `table[index]` where `table` is an absolute address of an
    /// array of code addresses and `index` a register.
    pub fn jump_through_table(&mut self, table: usize, index: Reg) {
        self.mov_imm(Reg::R5, table as i64);
        self.load_indexed(Reg::R5, Indexed::new(Reg::R5, index, 3, 0), Width::W64, Extend::Zero);
        self.jump_reg(Reg::R5);
    }

    // ----- VM calls -----

    pub fn set_last_java_frame(&mut self) {
        self.store_ptr(Reg::Sp, Reg::Thread, thread_off::ANCHOR_SP);
        self.store_ptr(Reg::Fp, Reg::Thread, thread_off::ANCHOR_FP);
        let pc = self.pc();
        self.mov_imm(Reg::R5, pc as i64);
        self.store_ptr(Reg::R5, Reg::Thread, thread_off::ANCHOR_PC);
    }

    pub fn reset_last_java_frame(&mut self) {
        self.mov_imm(Reg::R5, 0);
        self.store_ptr(Reg::R5, Reg::Thread, thread_off::ANCHOR_SP);
        self.store_ptr(Reg::R5, Reg::Thread, thread_off::ANCHOR_FP);
        self.store_ptr(Reg::R5, Reg::Thread, thread_off::ANCHOR_PC);
    }

    /// Call a runtime entry with the thread in `R0` and arguments in
    /// `R1..R3`. The frame is published as the last Java frame, cached
    /// registers are reloaded afterwards. With `check`, a pending exception
    /// is forwarded and pending pop frame / early return requests are
    /// honored. The result is in `RET`.
    pub fn call_vm(&mut self, entry: usize, check: bool) {
        self.save_bcp();
        self.set_last_java_frame();
        self.mov(Reg::R0, Reg::Thread);
        self.call_runtime(entry);
        self.reset_last_java_frame();
        self.restore_interpreter_state();
        if check {
            self.check_pending_exception();
            if self.config().jvmti_support {
                self.check_jvmti_requests();
            }
        }
    }

    /// `call_vm` returning an oop through the thread's VM result into `Tos`.
    pub fn call_vm_oop(&mut self, entry: usize) {
        self.call_vm(entry, true);
        self.load_ptr(Reg::Tos, Reg::Thread, thread_off::VM_RESULT);
        self.mov_imm(Reg::R5, 0);
        self.store_ptr(Reg::R5, Reg::Thread, thread_off::VM_RESULT);
    }

    /// Call a runtime entry that neither walks the stack nor blocks.
    pub fn call_vm_leaf(&mut self, entry: usize) {
        self.mov(Reg::R0, Reg::Thread);
        self.call_runtime(entry);
    }

    pub fn check_pending_exception(&mut self) {
        self.load_ptr(Reg::R5, Reg::Thread, thread_off::PENDING_EXCEPTION);
        self.branch_imm_stub(Cond::Ne, Reg::R5, 0, StubId::ForwardException);
    }

    fn check_jvmti_requests(&mut self) {
        let no_pop = self.create_label();
        self.load(Reg::R5, Address::new(Reg::Thread, thread_off::POPFRAME_CONDITION), Width::W32, Extend::Zero);
        self.alu_imm(
            AluOp::And,
            OpSize::Long,
            Reg::R5,
            Reg::R5,
            (popframe::PENDING | popframe::PROCESSING) as i32,
        );
        self.branch_imm(Cond::Ne, Reg::R5, popframe::PENDING as i32, no_pop);
        self.jump_stub(StubId::RemoveActivationPreservingArgs);
        self.bind(no_pop);

        let no_earlyret = self.create_label();
        self.load(Reg::R5, Address::new(Reg::Thread, thread_off::EARLYRET_STATE), Width::W32, Extend::Zero);
        self.branch_imm(Cond::Ne, Reg::R5, earlyret::PENDING as i32, no_earlyret);
        self.load(Reg::R4, Address::new(Reg::Thread, thread_off::EARLYRET_TOS), Width::W32, Extend::Zero);
        let earlyret = self.ctx.earlyret_entry;
        self.jump_through_table(earlyret, Reg::R4);
        self.bind(no_earlyret);
    }

    // ----- constant pool cache -----

    /// `dst = &cache[u16 operand at bcp + offset]`. Clobbers `R3`.
    pub fn get_cache_entry(&mut self, dst: Reg, offset: i32) {
        self.load_be(Reg::R3, Address::new(Reg::Bcp, offset), Width::W16, Extend::Zero);
        self.alu_imm(AluOp::Mul, OpSize::Long, Reg::R3, Reg::R3, (CP_CACHE_ENTRY_SIZE / 8) as i32);
        self.lea_indexed(dst, Indexed::new(Reg::Cache, Reg::R3, 3, 0));
    }

    /// Entry for the instruction at `bcp` in `R2`, resolving it through
    /// the VM unless the marker byte already names `bytecode`.
    pub fn resolve_cache_entry(&mut self, bytecode: u8, second: bool) {
        let resolved = self.create_label();
        self.get_cache_entry(Reg::R2, 1);
        let marker = if second { BYTECODE_2_OFFSET } else { BYTECODE_1_OFFSET };
        self.load(Reg::R5, Address::new(Reg::R2, marker), Width::W8, Extend::Zero);
        self.branch_imm(Cond::Eq, Reg::R5, bytecode as i32, resolved);
        self.mov_imm(Reg::R1, bytecode as i64);
        self.call_vm(runtime::resolve_from_cache as *const () as usize, true);
        self.get_cache_entry(Reg::R2, 1);
        self.bind(resolved);
    }

    // ----- counters and profiling -----

    /// `[addr] += COUNT_INCREMENT` on a 32-bit counter; the new value is in `dst`.
    pub fn increment_counter(&mut self, dst: Reg, addr: Address) {
        self.load(dst, addr, Width::W32, Extend::Zero);
        self.add_imm(dst, dst, crate::interpreter::counters::COUNT_INCREMENT as i32);
        self.store(dst, addr, Width::W32);
    }

    /// Bump the taken (`cell = 0`) or not-taken (`cell = 8`) profile cell
    /// of the branch at `bcp`, if the method is being profiled. Clobbers
    /// `R4`, `R5`.
    pub fn profile_branch(&mut self, cell: i32) {
        if !self.config().profile_interpreter {
            return;
        }
        let done = self.create_label();
        self.load_ptr(Reg::R5, Reg::Fp, frame::MDP);
        self.branch_imm(Cond::Eq, Reg::R5, 0, done);
        self.load_ptr(Reg::R4, Reg::Method, method_off::CODE_BASE);
        self.alu(AluOp::Sub, OpSize::Long, Reg::R4, Reg::Bcp, Reg::R4);
        self.alu_imm(AluOp::Shl, OpSize::Long, Reg::R4, Reg::R4, 4);
        self.alu(AluOp::Add, OpSize::Long, Reg::R5, Reg::R5, Reg::R4);
        self.load_ptr(Reg::R4, Reg::R5, cell);
        self.add_imm(Reg::R4, Reg::R4, 1);
        self.store_ptr(Reg::R4, Reg::R5, cell);
        self.bind(done);
    }

    // ----- barriers -----

    /// Log the previous value at `[base + offset]` while SATB marking is
    /// active. `base` and `offset` must survive a leaf call (`Bcp`-relative
    /// reload is the caller's job); everything caller-saved is clobbered.
    pub fn satb_pre_barrier(&mut self, addr: Reg) {
        if self.config().gc_barrier != GcBarrier::Satb {
            return;
        }
        let done = self.create_label();
        let marking = self.ctx.satb_marking;
        self.mov_imm(Reg::R5, marking as i64);
        self.load(Reg::R5, Address::new(Reg::R5, 0), Width::W8, Extend::Zero);
        self.branch_imm(Cond::Eq, Reg::R5, 0, done);
        self.load_ptr(Reg::R1, addr, 0);
        self.branch_imm(Cond::Eq, Reg::R1, 0, done);
        self.call_vm_leaf(runtime::satb_enqueue as *const () as usize);
        self.bind(done);
    }

    // ----- method entry/exit -----

    pub fn notify_method_entry(&mut self) {
        if !self.config().jvmti_support {
            return;
        }
        let done = self.create_label();
        self.load(Reg::R5, Address::new(Reg::Thread, thread_off::INTERP_ONLY_MODE), Width::W8, Extend::Zero);
        self.branch_imm(Cond::Eq, Reg::R5, 0, done);
        self.call_vm(runtime::post_method_entry as *const () as usize, true);
        self.bind(done);
    }

    /// Post the method exit event. The result must already be saved on
    /// the expression stack.
    pub fn notify_method_exit(&mut self) {
        if !self.config().jvmti_support {
            return;
        }
        let done = self.create_label();
        self.load(Reg::R5, Address::new(Reg::Thread, thread_off::INTERP_ONLY_MODE), Width::W8, Extend::Zero);
        self.branch_imm(Cond::Eq, Reg::R5, 0, done);
        self.call_vm(runtime::post_method_exit as *const () as usize, false);
        self.bind(done);
    }

    /// Allocate the method monitor below the fixed frame and lock the
    /// receiver (or the mirror for static methods).
    pub fn lock_method(&mut self, is_static_known: Option<bool>) {
        let monitor_words = frame::MONITOR_SIZE / 8;
        self.mov_imm(Reg::R5, (frame::MONITOR_BLOCK_BOTTOM - monitor_words) as i64);
        self.store_ptr(Reg::R5, Reg::Fp, frame::MONITOR_BLOCK_TOP);
        self.lea(Reg::Sp, Address::new(Reg::Fp, frame::METHOD_MONITOR));
        match is_static_known {
            Some(true) => self.load_ptr(Reg::R1, Reg::Fp, frame::MIRROR),
            Some(false) => self.load_ptr(Reg::R1, Reg::Locals, 0),
            None => {
                let is_static = self.create_label();
                let store = self.create_label();
                self.load(Reg::R5, Address::new(Reg::Method, method_off::ACCESS_FLAGS), Width::W32, Extend::Zero);
                self.alu_imm(
                    AluOp::And,
                    OpSize::Long,
                    Reg::R5,
                    Reg::R5,
                    crate::vm::method::access::STATIC as i32,
                );
                self.branch_imm(Cond::Ne, Reg::R5, 0, is_static);
                self.load_ptr(Reg::R1, Reg::Locals, 0);
                self.jump(store);
                self.bind(is_static);
                self.load_ptr(Reg::R1, Reg::Fp, frame::MIRROR);
                self.bind(store);
            }
        }
        self.store_ptr(Reg::R1, Reg::Fp, frame::METHOD_MONITOR + frame::MONITOR_OBJ_OFFSET);
        self.lea(Reg::R1, Address::new(Reg::Fp, frame::METHOD_MONITOR));
        self.call_vm(runtime::monitorenter as *const () as usize, true);
    }

    fn save_result(&mut self, preserve: Preserve) {
        match preserve {
            Preserve::State(state) => self.push_tos(state),
            Preserve::Both => {
                self.push(Reg::Tos);
                self.fmov_to_int(Reg::R5, FRET, Precision::Double);
                self.push(Reg::R5);
            }
        }
    }

    fn restore_result(&mut self, preserve: Preserve) {
        match preserve {
            Preserve::State(state) => self.pop_tos(state),
            Preserve::Both => {
                self.pop(Reg::R5);
                self.fmov_from_int(FRET, Reg::R5, Precision::Double);
                self.pop(Reg::Tos);
            }
        }
    }

    /// Release the method monitor and any monitors left locked, then post
    /// the method exit event. The result registers survive.
    pub fn unlock_and_notify(&mut self, preserve: Preserve, mode: UnlockMode, notify: bool) {
        self.save_result(preserve);

        let unlocked = self.create_label();
        let scan = self.create_label();
        // the flag is only set while the method monitor is not yet taken
        self.load(Reg::R4, Address::new(Reg::Thread, thread_off::DO_NOT_UNLOCK_IF_SYNCHRONIZED), Width::W8, Extend::Zero);
        self.mov_imm(Reg::R5, 0);
        self.store(Reg::R5, Address::new(Reg::Thread, thread_off::DO_NOT_UNLOCK_IF_SYNCHRONIZED), Width::W8);
        self.branch_imm(Cond::Ne, Reg::R4, 0, scan);
        self.load(Reg::R5, Address::new(Reg::Method, method_off::ACCESS_FLAGS), Width::W32, Extend::Zero);
        self.alu_imm(
            AluOp::And,
            OpSize::Long,
            Reg::R5,
            Reg::R5,
            crate::vm::method::access::SYNCHRONIZED as i32,
        );
        self.branch_imm(Cond::Eq, Reg::R5, 0, scan);

        let monitor_obj = frame::METHOD_MONITOR + frame::MONITOR_OBJ_OFFSET;
        self.load_ptr(Reg::R1, Reg::Fp, monitor_obj);
        let held = self.create_label();
        self.branch_imm(Cond::Ne, Reg::R1, 0, held);
        match mode {
            UnlockMode::Silent => self.jump(scan),
            UnlockMode::Throw => {
                self.call_vm(runtime::throw_illegal_monitor_state as *const () as usize, true);
                self.trap(TrapCode::ShouldNotReachHere);
            }
            UnlockMode::Install => {
                self.call_vm(runtime::new_illegal_monitor_state as *const () as usize, false);
                self.store_ptr(RET, Reg::Sp, 0);
                self.jump(scan);
            }
        }
        self.bind(held);
        self.lea(Reg::R1, Address::new(Reg::Fp, frame::METHOD_MONITOR));
        self.call_vm(runtime::monitorexit as *const () as usize, false);

        // any other monitor still held was not released by the method
        self.bind(scan);
        let loop_top = self.create_label();
        let found = self.create_label();
        self.load_ptr(Reg::R5, Reg::Fp, frame::MONITOR_BLOCK_TOP);
        self.lea_indexed(Reg::R4, Indexed::new(Reg::Fp, Reg::R5, 3, 0));
        self.lea(Reg::R3, Address::new(Reg::Fp, frame::MONITOR_BLOCK_BOTTOM * 8));
        self.bind(loop_top);
        self.branch(Cond::AboveEq, Reg::R4, Reg::R3, unlocked);
        self.load_ptr(Reg::R5, Reg::R4, frame::MONITOR_OBJ_OFFSET);
        self.branch_imm(Cond::Ne, Reg::R5, 0, found);
        self.add_imm(Reg::R4, Reg::R4, frame::MONITOR_SIZE);
        self.jump(loop_top);
        self.bind(found);
        self.mov_imm(Reg::R1, mode.code());
        self.call_vm(runtime::remove_activation_unlock as *const () as usize, false);
        match mode {
            UnlockMode::Install => {
                let keep = self.create_label();
                self.branch_imm(Cond::Eq, RET, 0, keep);
                self.store_ptr(RET, Reg::Sp, 0);
                self.bind(keep);
            }
            UnlockMode::Throw => self.check_pending_exception(),
            UnlockMode::Silent => {}
        }

        self.bind(unlocked);
        if notify {
            self.notify_method_exit();
        }
        self.restore_result(preserve);
    }

    /// Return to the caller through the return address popped by `leave_frame`.
    pub fn return_to_caller(&mut self) {
        self.leave_frame();
        self.jump_reg(Reg::Bcp);
    }

    /// Publish a thread state transition.
    pub fn set_thread_state(&mut self, state: ThreadState) {
        self.mov_imm(Reg::R5, state as i64);
        self.store(Reg::R5, Address::new(Reg::Thread, thread_off::STATE), Width::W32);
    }

    /// Hand the exception in `Tos` to the continuation for the return
    /// address in `R1`, with the frame already removed.
    pub fn unwind_to_caller(&mut self) {
        self.mov(Reg::Method, Reg::Tos);
        self.call_vm_leaf(runtime::exception_handler_for_return_address as *const () as usize);
        self.mov(Reg::R4, RET);
        self.mov(Reg::Tos, Reg::Method);
        self.jump_reg(Reg::R4);
    }

    /// Stack pointer after reserving `words` more, compared with the
    /// thread's overflow limit. Jumps to `overflow` when it would cross it.
    pub fn stack_limit_check(&mut self, words: Reg, overflow: Label) {
        self.alu_imm(AluOp::Shl, OpSize::Long, Reg::R5, words, 3);
        self.alu(AluOp::Sub, OpSize::Long, Reg::R5, Reg::Sp, Reg::R5);
        self.load_ptr(Reg::R4, Reg::Thread, thread_off::STACK_OVERFLOW_LIMIT);
        self.branch(Cond::Below, Reg::R5, Reg::R4, overflow);
    }

    /// Emit the profile and compile-request counters of a method entry.
    pub fn invocation_counter(&mut self) {
        let counters_done = self.create_label();
        let overflow = self.create_label();
        let config = self.ctx.config.clone();
        if config.tiered_compilation {
            let mask = crate::interpreter::counters::notify_mask(config.tier0_invoke_notify_freq_log) as i32;
            let no_mdo = self.create_label();
            let check = self.create_label();
            if config.profile_interpreter {
                self.load_ptr(Reg::R1, Reg::Method, method_off::METHOD_DATA);
                self.branch_imm(Cond::Eq, Reg::R1, 0, no_mdo);
                self.increment_counter(Reg::R2, Address::new(Reg::R1, method_off::MDO_INVOCATION_COUNTER));
                self.jump(check);
            }
            self.bind(no_mdo);
            self.increment_counter(Reg::R2, Address::new(Reg::Method, method_off::INVOCATION_COUNTER));
            self.bind(check);
            self.alu_imm(AluOp::And, OpSize::Long, Reg::R2, Reg::R2, mask);
            self.branch_imm(Cond::Eq, Reg::R2, 0, overflow);
            self.jump(counters_done);
        } else {
            self.increment_counter(Reg::R2, Address::new(Reg::Method, method_off::INVOCATION_COUNTER));
            if config.profile_interpreter {
                let profiled = self.create_label();
                let limit = crate::interpreter::counters::limit(config.profile_limit());
                self.load_ptr(Reg::R1, Reg::Method, method_off::METHOD_DATA);
                self.branch_imm(Cond::Ne, Reg::R1, 0, profiled);
                self.alu_imm(AluOp::And, OpSize::Long, Reg::R3, Reg::R2, crate::interpreter::counters::COUNT_MASK as i32);
                self.branch_imm(Cond::Below, Reg::R3, limit as i32, profiled);
                self.call_vm(runtime::profile_method as *const () as usize, true);
                self.load(Reg::R2, Address::new(Reg::Method, method_off::INVOCATION_COUNTER), Width::W32, Extend::Zero);
                self.bind(profiled);
            }
            let mask = crate::interpreter::counters::COUNT_MASK as i32;
            self.load(Reg::R3, Address::new(Reg::Method, method_off::BACKEDGE_COUNTER), Width::W32, Extend::Zero);
            self.alu_imm(AluOp::And, OpSize::Long, Reg::R3, Reg::R3, mask);
            self.alu_imm(AluOp::And, OpSize::Long, Reg::R2, Reg::R2, mask);
            self.alu(AluOp::Add, OpSize::Long, Reg::R2, Reg::R2, Reg::R3);
            let limit = crate::interpreter::counters::limit(config.compile_threshold);
            self.branch_imm(Cond::AboveEq, Reg::R2, limit as i32, overflow);
            self.jump(counters_done);
        }
        self.bind(overflow);
        self.mov_imm(Reg::R1, 0);
        self.call_vm(runtime::frequency_counter_overflow as *const () as usize, true);
        self.bind(counters_done);
    }

    /// Count a taken backward branch; `R3` holds the branch offset and
    /// must survive. Requests an OSR compile on overflow.
    pub fn backedge_counter(&mut self) {
        let done = self.create_label();
        let overflow = self.create_label();
        let config = self.ctx.config.clone();
        self.branch_imm(Cond::Gt, Reg::R3, 0, done);
        if config.tiered_compilation {
            let mask = crate::interpreter::counters::notify_mask(config.tier0_backedge_notify_freq_log) as i32;
            let no_mdo = self.create_label();
            let check = self.create_label();
            if config.profile_interpreter {
                self.load_ptr(Reg::R1, Reg::Method, method_off::METHOD_DATA);
                self.branch_imm(Cond::Eq, Reg::R1, 0, no_mdo);
                self.increment_counter(Reg::R2, Address::new(Reg::R1, method_off::MDO_BACKEDGE_COUNTER));
                self.jump(check);
            }
            self.bind(no_mdo);
            self.increment_counter(Reg::R2, Address::new(Reg::Method, method_off::BACKEDGE_COUNTER));
            self.bind(check);
            self.alu_imm(AluOp::And, OpSize::Long, Reg::R2, Reg::R2, mask);
            self.branch_imm(Cond::Eq, Reg::R2, 0, overflow);
        } else {
            self.increment_counter(Reg::R2, Address::new(Reg::Method, method_off::BACKEDGE_COUNTER));
            self.alu_imm(AluOp::And, OpSize::Long, Reg::R2, Reg::R2, crate::interpreter::counters::COUNT_MASK as i32);
            let limit = crate::interpreter::counters::limit(config.backedge_threshold);
            self.branch_imm(Cond::AboveEq, Reg::R2, limit as i32, overflow);
        }
        self.jump(done);
        self.bind(overflow);
        self.push(Reg::R3);
        self.mov(Reg::R1, Reg::Bcp);
        self.call_vm(runtime::frequency_counter_overflow as *const () as usize, true);
        self.pop(Reg::R3);
        self.bind(done);
    }
}
