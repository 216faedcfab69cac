//! VM entry points called from generated code.
//!
//! Every function here is reached through `call_vm`, `call_vm_leaf` or
//! `call_runtime_float` with the current thread in the first argument.
//! Entries called through `call_vm` run with the thread marked as in the
//! VM and report failures by installing a pending exception; leaf entries
//! do no such transition and must not block. None of them may panic,
//! since unwinding out of an `extern "C"` function aborts.

use std::sync::atomic::Ordering;

use crate::error::VmError;
use crate::vm::Vm;
use crate::vm::bootstrap::names;
use crate::vm::constants::{Constant, tag};
use crate::vm::deopt;
use crate::vm::jvmti::JvmtiEvent;
use crate::vm::linker;
use crate::vm::method::Method;
use crate::vm::oop::{BasicType, Oop};
use crate::vm::thread::{JavaThread, ThreadInVmFromJava};

use super::counters;
use super::frame::{self, Frame, SlotKind};
use super::method_kind::MethodKind;
use super::signature::{self, ArgLocation, ArgSource};
use super::stubs::StubId;

/// Run `f` for a `call_vm` entry with the thread in the VM state.
fn in_vm<R>(thread: usize, f: impl FnOnce(&JavaThread, &Vm) -> R) -> R {
    // SAFETY: generated code passes its thread register.
    let thread = unsafe { JavaThread::from_raw(thread) };
    let _transition = ThreadInVmFromJava::new(thread);
    f(thread, thread.vm())
}

fn leaf_thread<'a>(thread: usize) -> &'a JavaThread {
    // SAFETY: as for `in_vm`.
    unsafe { JavaThread::from_raw(thread) }
}

/// Turn a VM failure into a pending Java exception.
fn throw_vm_error(vm: &Vm, thread: &JavaThread, error: VmError) {
    vm.throw_error(thread, error);
}

/// The u16 operand at `bci + at` of the method executing in `frame`.
fn operand_u16(method: &Method, bci: usize, at: usize) -> Option<usize> {
    let code = method.code();
    let hi = *code.get(bci + at)?;
    let lo = *code.get(bci + at + 1)?;
    Some(u16::from_be_bytes([hi, lo]) as usize)
}

fn operand_u8(method: &Method, bci: usize, at: usize) -> Option<usize> {
    method.code().get(bci + at).map(|b| *b as usize)
}

/// Top frame and the bci its bcp points at.
fn top_frame(thread: &JavaThread) -> Option<(Frame, usize)> {
    let frame = thread.last_frame()?;
    let bci = frame.bci()?;
    Some((frame, bci))
}

macro_rules! top_or_fail {
    ($thread:expr, $vm:expr, $ret:expr) => {
        match top_frame($thread) {
            Some(found) => found,
            None => {
                throw_vm_error($vm, $thread, VmError::Link("runtime call without a Java frame".into()));
                return $ret;
            }
        }
    };
}

// ----- resolution -----

pub extern "C" fn resolve_from_cache(thread: usize, bytecode: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let (frame, bci) = top_or_fail!(thread, vm, 0);
        let method = frame.method();
        let Some(index) = operand_u16(method, bci, 1) else {
            throw_vm_error(vm, thread, VmError::Link(format!("truncated operand at bci {}", bci)));
            return 0;
        };
        if let Err(e) = linker::resolve_cache_entry(vm, thread, method, index, bytecode as u8) {
            throw_vm_error(vm, thread, e);
        }
        0
    })
}

/// Select the target of an `invokeinterface` for `receiver` and cache it
/// in the entry. Returns the `Method`, or 0 with an exception pending.
pub extern "C" fn resolve_interface_call(thread: usize, receiver: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let (frame, bci) = top_or_fail!(thread, vm, 0);
        let method = frame.method();
        let Some(index) = operand_u16(method, bci, 1) else {
            return 0;
        };
        match linker::resolve_interface_target(vm, method, index, Oop::from_raw(receiver)) {
            Ok(target) => target as *const Method as usize,
            Err(e) => {
                throw_vm_error(vm, thread, e);
                0
            }
        }
    })
}

pub extern "C" fn ldc(thread: usize, wide: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let (frame, bci) = top_or_fail!(thread, vm, 0);
        let method = frame.method();
        let index = if wide != 0 {
            operand_u16(method, bci, 1)
        } else {
            operand_u8(method, bci, 1)
        };
        let Some(index) = index else {
            return 0;
        };
        let cp = method.constants();
        let result = match cp.get(index) {
            Some(Constant::String(s)) => vm.intern(s).inspect(|obj| {
                cp.set_resolved(index, tag::STRING, obj.raw() as u64);
            }),
            Some(Constant::Class(_)) => {
                linker::resolve_class_at(vm, method.holder(), index).map(|k| k.mirror())
            }
            other => Err(VmError::Link(format!("ldc of unsupported constant {:?}", other))),
        };
        match result {
            Ok(obj) => thread.set_vm_result(obj),
            Err(e) => throw_vm_error(vm, thread, e),
        }
        0
    })
}

// ----- allocation -----

pub extern "C" fn new_instance(thread: usize, index: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let (frame, _) = top_or_fail!(thread, vm, 0);
        let holder = frame.method().holder();
        let klass = match linker::resolve_class_at(vm, holder, index) {
            Ok(k) => k,
            Err(e) => {
                throw_vm_error(vm, thread, e);
                return 0;
            }
        };
        if klass.is_interface() || klass.is_abstract() {
            vm.throw(thread, names::INSTANTIATION_ERROR, Some(klass.name().replace('/', ".")));
            return 0;
        }
        if let Err(e) = linker::initialize_class(vm, thread, klass) {
            throw_vm_error(vm, thread, e);
            return 0;
        }
        if thread.has_pending_exception() {
            return 0;
        }
        match vm.allocate_instance(klass) {
            Ok(obj) => thread.set_vm_result(obj),
            Err(e) => throw_vm_error(vm, thread, e),
        }
        0
    })
}

pub extern "C" fn new_type_array(thread: usize, atype: usize, length: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let result = BasicType::from_atype(atype as u8)
            .ok_or_else(|| VmError::Link(format!("bad newarray type {}", atype)))
            .and_then(|ty| vm.type_array_klass(ty))
            .and_then(|k| vm.allocate_array(k, length as u32 as usize));
        match result {
            Ok(obj) => thread.set_vm_result(obj),
            Err(e) => throw_vm_error(vm, thread, e),
        }
        0
    })
}

pub extern "C" fn new_object_array(thread: usize, index: usize, length: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let (frame, _) = top_or_fail!(thread, vm, 0);
        let result = linker::resolve_class_at(vm, frame.method().holder(), index)
            .and_then(|elem| vm.array_klass_of(elem))
            .and_then(|k| vm.allocate_array(k, length as u32 as usize));
        match result {
            Ok(obj) => thread.set_vm_result(obj),
            Err(e) => throw_vm_error(vm, thread, e),
        }
        0
    })
}

/// `dims` counts are on the expression stack at `sp`, the innermost
/// dimension on top.
pub extern "C" fn multianewarray(thread: usize, index: usize, dims: usize, sp: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let (frame, _) = top_or_fail!(thread, vm, 0);
        let lengths: Vec<i32> = (0..dims)
            .map(|i| {
                // SAFETY: the template passes its stack pointer with `dims` words above it.
                unsafe { *((sp + 8 * (dims - 1 - i)) as *const u64) as i32 }
            })
            .collect();
        if let Some(neg) = lengths.iter().find(|l| **l < 0) {
            vm.throw(thread, names::NEGATIVE_ARRAY_SIZE_EXCEPTION, Some(neg.to_string()));
            return 0;
        }
        let result = linker::resolve_class_at(vm, frame.method().holder(), index)
            .and_then(|k| vm.new_multi_array(k, &lengths));
        match result {
            Ok(obj) => thread.set_vm_result(obj),
            Err(e) => throw_vm_error(vm, thread, e),
        }
        0
    })
}

// ----- type checks -----

/// Slow path of `aastore`; the operands are still on the stack.
pub extern "C" fn aastore_check(thread: usize, value: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let Some(frame) = thread.last_frame() else {
            return 0;
        };
        // SAFETY: value, index and array words sit at the anchor sp.
        let array = Oop::from_raw(unsafe { *((frame.sp() + 16) as *const usize) });
        let value = Oop::from_raw(value);
        if array.is_null() || value.is_null() {
            return 0;
        }
        let ok = array
            .klass()
            .element_klass()
            .is_some_and(|elem| value.klass().is_subtype_of(elem));
        if !ok {
            vm.throw(thread, names::ARRAY_STORE_EXCEPTION, Some(value.klass().name().replace('/', ".")));
        }
        0
    })
}

/// 1 if `obj` is an instance of the class at constant pool `index`.
pub extern "C" fn instance_of(thread: usize, obj: usize, index: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let (frame, _) = top_or_fail!(thread, vm, 0);
        let obj = Oop::from_raw(obj);
        match linker::resolve_class_at(vm, frame.method().holder(), index) {
            Ok(k) => (!obj.is_null() && obj.klass().is_subtype_of(k)) as usize,
            Err(e) => {
                throw_vm_error(vm, thread, e);
                0
            }
        }
    })
}

// ----- monitors -----

pub extern "C" fn monitorenter(thread: usize, monitor: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        // SAFETY: `monitor` is a monitor slot of the current frame.
        let obj = Oop::from_raw(unsafe { *((monitor + frame::MONITOR_OBJ_OFFSET as usize) as *const usize) });
        vm.sync().enter(thread, obj);
        0
    })
}

pub extern "C" fn monitorexit(thread: usize, monitor: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let slot = (monitor + frame::MONITOR_OBJ_OFFSET as usize) as *mut usize;
        // SAFETY: as for `monitorenter`.
        let obj = Oop::from_raw(unsafe { *slot });
        if obj.is_null() {
            return 0;
        }
        match vm.sync().exit(thread, obj) {
            // SAFETY: as above.
            Ok(()) => unsafe { *slot = 0 },
            Err(_) => vm.throw(thread, names::ILLEGAL_MONITOR_STATE_EXCEPTION, None),
        }
        0
    })
}

/// Release every monitor still held by the top frame. With `mode` 2 the
/// new `IllegalMonitorStateException` is returned for the caller to
/// propagate; with `mode` 1 it is thrown.
pub extern "C" fn remove_activation_unlock(thread: usize, mode: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let Some(frame) = thread.last_frame() else {
            return 0;
        };
        let mut released = 0;
        for monitor in frame.monitors().collect::<Vec<_>>() {
            let slot = (monitor + frame::MONITOR_OBJ_OFFSET as usize) as *mut usize;
            // SAFETY: monitor slots lie inside the frame's monitor block.
            let obj = Oop::from_raw(unsafe { *slot });
            if obj.is_null() {
                continue;
            }
            let _ = vm.sync().exit(thread, obj);
            // SAFETY: as above.
            unsafe { *slot = 0 };
            released += 1;
        }
        if released == 0 {
            return 0;
        }
        log::debug!("{}: released {} monitors on removal", frame.method().qualified_name(), released);
        match mode {
            2 => vm.new_exception(names::ILLEGAL_MONITOR_STATE_EXCEPTION, None).raw(),
            1 => {
                vm.throw(thread, names::ILLEGAL_MONITOR_STATE_EXCEPTION, None);
                0
            }
            _ => 0,
        }
    })
}

pub extern "C" fn new_illegal_monitor_state(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |_, vm| vm.new_exception(names::ILLEGAL_MONITOR_STATE_EXCEPTION, None).raw())
}

// ----- exceptions -----

pub extern "C" fn throw_null_pointer(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| vm.throw(thread, names::NULL_POINTER_EXCEPTION, None));
    0
}

pub extern "C" fn throw_array_index_out_of_bounds(thread: usize, index: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let message = format!("Index {} out of bounds", index as i32);
        vm.throw(thread, names::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, Some(message));
    });
    0
}

pub extern "C" fn throw_arithmetic(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        vm.throw(thread, names::ARITHMETIC_EXCEPTION, Some("/ by zero".into()))
    });
    0
}

pub extern "C" fn throw_class_cast(thread: usize, obj: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let obj = Oop::from_raw(obj);
        let from = if obj.is_null() { "null".to_string() } else { obj.klass().name().replace('/', ".") };
        let target = top_frame(thread).and_then(|(frame, bci)| {
            let method = frame.method();
            let index = operand_u16(method, bci, 1)?;
            match method.constants().get(index) {
                Some(Constant::Class(name)) => Some(name.replace('/', ".")),
                _ => None,
            }
        });
        let message = match target {
            Some(to) => format!("class {} cannot be cast to class {}", from, to),
            None => format!("class {}", from),
        };
        vm.throw(thread, names::CLASS_CAST_EXCEPTION, Some(message));
    });
    0
}

pub extern "C" fn throw_negative_array_size(thread: usize, length: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        vm.throw(thread, names::NEGATIVE_ARRAY_SIZE_EXCEPTION, Some((length as i32).to_string()))
    });
    0
}

pub extern "C" fn throw_illegal_monitor_state(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| vm.throw(thread, names::ILLEGAL_MONITOR_STATE_EXCEPTION, None));
    0
}

/// Leaf: the error thrown when a method entry finds the stack exhausted.
/// The yellow zone is released so the handler has room to run.
pub extern "C" fn create_stack_overflow_error(thread: usize, _: usize, _: usize, _: usize) -> usize {
    let thread = leaf_thread(thread);
    thread.disable_yellow_zone();
    log::debug!("thread {}: stack overflow", thread.id());
    thread.vm().new_exception(names::STACK_OVERFLOW_ERROR, None).raw()
}

pub extern "C" fn create_abstract_method_error(thread: usize, method: usize, _: usize, _: usize) -> usize {
    let thread = leaf_thread(thread);
    // SAFETY: the abstract entry passes its `Method`.
    let method = unsafe { &*(method as *const Method) };
    thread
        .vm()
        .new_exception(names::ABSTRACT_METHOD_ERROR, Some(method.qualified_name()))
        .raw()
}

/// Find a handler for `exception` in the top frame. On a hit the frame's
/// bcp is moved to the handler and 0 is returned; otherwise the address
/// of the remove-activation stub. The exception ends up in the VM result
/// either way, since resolving a catch type may replace it.
pub extern "C" fn exception_handler_for_exception(thread: usize, exception: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let remove = vm.interpreter().stub(StubId::RemoveActivation);
        let mut exception = Oop::from_raw(exception);
        let pending = thread.clear_pending_exception();
        if exception.is_null() {
            exception = pending;
        }
        if exception.is_null() {
            exception = vm.new_exception(names::NULL_POINTER_EXCEPTION, None);
        }
        let Some((frame, bci)) = top_frame(thread) else {
            thread.set_vm_result(exception);
            return remove;
        };
        let method = frame.method();
        let holder = method.holder();

        let mut failure = None;
        let mut handler = method.find_handler(bci, |catch| {
            match linker::resolve_class_at(vm, holder, catch as usize) {
                Ok(k) => exception.klass().is_subtype_of(k),
                Err(e) => {
                    failure.get_or_insert(e);
                    false
                }
            }
        });
        if handler.is_none() {
            if let Some(e) = failure {
                // a catch type failed to resolve: that error replaces the
                // exception and the search is repeated for it
                exception = vm.exception_for(e);
                handler = method.find_handler(bci, |catch| {
                    let cp = method.constants();
                    cp.tag_at(catch as usize) == tag::CLASS
                        && linker::resolve_class_at(vm, holder, catch as usize)
                            .is_ok_and(|k| exception.klass().is_subtype_of(k))
                });
            }
        }
        thread.set_vm_result(exception);
        match handler {
            Some(handler_bci) => {
                log::trace!(
                    "{} caught {} at bci {} -> {}",
                    method.qualified_name(),
                    exception.klass().name(),
                    bci,
                    handler_bci
                );
                frame.set_bcp(method.code_base() + handler_bci);
                0
            }
            None => {
                log::trace!("{} does not catch {} at bci {}", method.qualified_name(), exception.klass().name(), bci);
                remove
            }
        }
    })
}

/// Leaf: where to continue unwinding after returning to `return_address`.
pub extern "C" fn exception_handler_for_return_address(thread: usize, return_address: usize, _: usize, _: usize) -> usize {
    let interpreter = leaf_thread(thread).vm().interpreter();
    if return_address == interpreter.stub(StubId::CallStubReturn) {
        interpreter.stub(StubId::CallStubCatch)
    } else {
        interpreter.stub(StubId::RethrowException)
    }
}

// ----- counters and profiling -----

/// An invocation or backedge counter crossed its limit. `bcp` is the
/// backward branch for backedge overflows and 0 for invocations.
pub extern "C" fn frequency_counter_overflow(thread: usize, bcp: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let Some(frame) = thread.last_frame() else {
            return 0;
        };
        let method = frame.method();
        let osr_bci = if bcp == 0 { None } else { method.bci_of(bcp) };
        let _ = vm.compiler().request(method, osr_bci);
        if !vm.config().tiered_compilation {
            for counter in [method.invocation_counter(), method.backedge_counter()] {
                let raw = counter.load(Ordering::Relaxed);
                counter.store(counters::reset_with_carry(raw), Ordering::Relaxed);
            }
        }
        0
    })
}

pub extern "C" fn profile_method(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, _| {
        if let Some(frame) = thread.last_frame() {
            let mdo = frame.method().ensure_method_data();
            frame.set_slot(SlotKind::Mdp, mdo.cells_base);
        }
        0
    })
}

// ----- notifications -----

pub extern "C" fn post_method_entry(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        if let Some(frame) = thread.last_frame() {
            vm.jvmti().post(JvmtiEvent::MethodEntry {
                thread: thread.id(),
                method: frame.method().qualified_name(),
            });
        }
        0
    })
}

pub extern "C" fn post_method_exit(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        if let Some(frame) = thread.last_frame() {
            vm.jvmti().post(JvmtiEvent::MethodExit {
                thread: thread.id(),
                method: frame.method().qualified_name(),
            });
        }
        0
    })
}

pub extern "C" fn at_safepoint(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        vm.safepoint().poll(thread);
        0
    })
}

pub extern "C" fn register_finalizer(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        if let Some(frame) = thread.last_frame() {
            vm.register_finalizer(Oop::from_raw(frame.local(0) as usize));
        }
        0
    })
}

// ----- natives -----

/// Link the native method of the top frame and pick its signature handler.
pub extern "C" fn prepare_native_call(thread: usize, _: usize, _: usize, _: usize) -> usize {
    in_vm(thread, |thread, vm| {
        let Some(frame) = thread.last_frame() else {
            return 0;
        };
        let method = frame.method();
        if method.native_function() == 0 {
            match vm.natives().lookup(method) {
                Some(f) => method.set_native_function(f),
                None => {
                    vm.throw(thread, names::UNSATISFIED_LINK_ERROR, Some(method.qualified_name()));
                    return 0;
                }
            }
        }
        if method.signature_handler() == 0 {
            method.set_signature_handler(vm.interpreter().signature_handler_for(method));
        }
        0
    })
}

pub extern "C" fn block_in_native_trans(thread: usize, _: usize, _: usize, _: usize) -> usize {
    let thread = leaf_thread(thread);
    thread.vm().safepoint().block_if_requested(thread);
    0
}

pub extern "C" fn reguard_yellow_pages(thread: usize, _: usize, _: usize, _: usize) -> usize {
    let thread = leaf_thread(thread);
    if thread.reguard_yellow_zone(thread.last_java_sp()) {
        log::debug!("thread {}: yellow zone re-enabled", thread.id());
    }
    0
}

/// Leaf: the argument shuffle for signatures without a fingerprint.
/// Register arguments go to the thread's scratch area for the stub to
/// load; stack arguments are written to `outgoing`.
pub extern "C" fn slow_signature_handler(thread: usize, method: usize, locals: usize, outgoing: usize) -> usize {
    let thread = leaf_thread(thread);
    // SAFETY: the stub passes the native method being called.
    let method = unsafe { &*(method as *const Method) };
    let sig = method.signature();
    let read_local = |slot: usize| -> u64 {
        // SAFETY: locals of the native frame, below `locals`.
        unsafe { *((locals - slot * 8) as *const u64) }
    };
    let local_handle = |slot: usize| -> u64 {
        let addr = locals - slot * 8;
        if read_local(slot) == 0 { 0 } else { addr as u64 }
    };
    for (source, location) in signature::assign(method.is_static(), &sig.params) {
        let value = match source {
            ArgSource::Receiver => locals as u64,
            ArgSource::Mirror => (thread.last_java_fp() as isize + frame::MIRROR as isize) as u64,
            ArgSource::Local { slot, ty } => {
                let slot = slot + if ty.slots() == 2 { 1 } else { 0 };
                if ty.is_reference() { local_handle(slot) } else { read_local(slot) }
            }
        };
        match location {
            ArgLocation::Int(i) => {
                if let Some(cell) = thread.native_scratch.ints.get(i) {
                    cell.store(value, Ordering::Relaxed);
                }
            }
            ArgLocation::Float(i) => {
                if let Some(cell) = thread.native_scratch.floats.get(i) {
                    cell.store(value, Ordering::Relaxed);
                }
            }
            // SAFETY: the native entry reserved the outgoing area for every stack argument.
            ArgLocation::Stack(k) => unsafe { *((outgoing + 8 * k) as *mut u64) = value },
        }
    }
    0
}

// ----- barriers, pop frame, deoptimization -----

pub extern "C" fn satb_enqueue(thread: usize, pre_val: usize, _: usize, _: usize) -> usize {
    let pre_val = Oop::from_raw(pre_val);
    if !pre_val.is_null() {
        leaf_thread(thread).vm().satb().enqueue(pre_val);
    }
    0
}

/// Leaf: copy the arguments of a frame being popped so a call from the VM
/// can be reissued with them.
pub extern "C" fn preserve_popframe_args(thread: usize, locals: usize, size: usize, _: usize) -> usize {
    let args = (0..size)
        // SAFETY: `size` words of parameters lie at and below `locals`.
        .map(|i| unsafe { *((locals - 8 * i) as *const u64) })
        .collect();
    leaf_thread(thread).preserve_popframe_args(args);
    0
}

/// Leaf: lay out the interpreter frames of the thread's pending unpack
/// plan. Returns the new stack pointer.
pub extern "C" fn deopt_unpack_frames(thread: usize, sp: usize, fp: usize, sender_sp: usize) -> usize {
    deopt::unpack_frames(leaf_thread(thread), sp, fp, sender_sp)
}

// ----- math -----

pub extern "C" fn fmod(x: f64, y: f64) -> f64 {
    x % y
}

extern "C" fn math_sin(x: f64, _: f64) -> f64 {
    x.sin()
}

extern "C" fn math_cos(x: f64, _: f64) -> f64 {
    x.cos()
}

extern "C" fn math_tan(x: f64, _: f64) -> f64 {
    x.tan()
}

extern "C" fn math_abs(x: f64, _: f64) -> f64 {
    x.abs()
}

extern "C" fn math_sqrt(x: f64, _: f64) -> f64 {
    x.sqrt()
}

extern "C" fn math_log(x: f64, _: f64) -> f64 {
    x.ln()
}

extern "C" fn math_log10(x: f64, _: f64) -> f64 {
    x.log10()
}

extern "C" fn math_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn math_exp(x: f64, _: f64) -> f64 {
    x.exp()
}

extern "C" fn math_nan(_: f64, _: f64) -> f64 {
    f64::NAN
}

/// Float runtime routine behind a math method entry.
pub fn math_function(kind: MethodKind) -> usize {
    let f: extern "C" fn(f64, f64) -> f64 = match kind {
        MethodKind::JavaLangMathSin => math_sin,
        MethodKind::JavaLangMathCos => math_cos,
        MethodKind::JavaLangMathTan => math_tan,
        MethodKind::JavaLangMathAbs => math_abs,
        MethodKind::JavaLangMathSqrt => math_sqrt,
        MethodKind::JavaLangMathLog => math_log,
        MethodKind::JavaLangMathLog10 => math_log10,
        MethodKind::JavaLangMathPow => math_pow,
        MethodKind::JavaLangMathExp => math_exp,
        _ => math_nan,
    };
    f as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::bytecodes as bc;

    fn call_math(kind: MethodKind, x: f64, y: f64) -> f64 {
        // SAFETY: `math_function` returns `extern "C" fn(f64, f64) -> f64` items.
        let f: extern "C" fn(f64, f64) -> f64 = unsafe { std::mem::transmute(math_function(kind)) };
        f(x, y)
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(call_math(MethodKind::JavaLangMathSqrt, 16.0, 0.0), 4.0);
        assert_eq!(call_math(MethodKind::JavaLangMathPow, 2.0, 10.0), 1024.0);
        assert_eq!(call_math(MethodKind::JavaLangMathAbs, -3.5, 0.0), 3.5);
        assert!(call_math(MethodKind::Native, 1.0, 1.0).is_nan());
    }

    #[test]
    fn test_fmod_follows_java_remainder() {
        assert_eq!(fmod(7.5, 2.0), 1.5);
        assert_eq!(fmod(-7.5, 2.0), -1.5);
        assert!(fmod(1.0, 0.0).is_nan());
    }

    #[test]
    fn test_bytecode_lengths_cover_ldc_operands() {
        assert_eq!(bc::length(bc::LDC), Some(2));
        assert_eq!(bc::length(bc::LDC_W), Some(3));
    }
}
