//! Symbolic resolution of constant pool references and class initialization.

use std::sync::atomic::Ordering;

use crate::error::{VmError, VmResult};
use crate::interpreter::bytecodes as bc;
use crate::interpreter::tos::TosState;

use super::Vm;
use super::bootstrap::names;
use super::constants::{Constant, MemberRef, cache_flags, tag};
use super::javacalls::JavaCalls;
use super::klass::{ClassState, Klass};
use super::method::{Method, Signature, access};
use super::oop::Oop;
use super::thread::JavaThread;

/// Resolve the class constant at `index` of `holder`'s pool, recording the
/// result for the quick type checks.
pub fn resolve_class_at<'a>(vm: &'a Vm, holder: &Klass, index: usize) -> VmResult<&'a Klass> {
    let cp = holder.constants();
    if cp.tag_at(index) == tag::CLASS {
        // SAFETY: resolved class tags hold the address of a loaded class.
        return Ok(unsafe { &*(cp.value_at(index) as *const Klass) });
    }
    let Some(Constant::Class(name)) = cp.get(index) else {
        return Err(VmError::Link(format!("constant {} of {} is not a class", index, holder.name())));
    };
    let klass = vm.resolve_class(name)?;
    cp.set_resolved(index, tag::CLASS, klass as *const Klass as u64);
    Ok(klass)
}

fn member_ref(method: &Method, index: usize) -> VmResult<(&MemberRef, bool)> {
    match method.constants().get(index) {
        Some(Constant::Field(r)) | Some(Constant::Method(r)) => Ok((r, false)),
        Some(Constant::InterfaceMethod(r)) => Ok((r, true)),
        other => Err(VmError::Link(format!(
            "constant {} of {} is not a member reference: {:?}",
            index,
            method.qualified_name(),
            other
        ))),
    }
}

fn bytecode_name(code: u8) -> &'static str {
    if code == 0 { "-" } else { bc::name(code).unwrap_or("?") }
}

fn result_flags(descriptor: &str) -> VmResult<(u32, usize)> {
    let sig = Signature::parse(descriptor).ok_or_else(|| VmError::Link(format!("bad descriptor {}", descriptor)))?;
    Ok((sig.result.tos_state() as u32, sig.param_slots()))
}

/// Fill the cache entry used by the field or invoke instruction
/// `bytecode` at `index` of `method`'s pool.
///
/// Static accesses initialize the holder first. While the holder is still
/// being initialized by this thread the entry is filled but not published,
/// so other threads keep taking the resolution path.
pub fn resolve_cache_entry(
    vm: &Vm,
    thread: &JavaThread,
    method: &Method,
    index: usize,
    bytecode: u8,
) -> VmResult<()> {
    let entry = method
        .cache_entry(index)
        .ok_or_else(|| VmError::Link(format!("no cache entry {} in {}", index, method.qualified_name())))?;
    let (member, is_interface_ref) = member_ref(method, index)?;
    let klass = vm.resolve_class(&member.class)?;

    match bytecode {
        bc::GETSTATIC | bc::PUTSTATIC | bc::GETFIELD | bc::PUTFIELD => {
            let is_static = matches!(bytecode, bc::GETSTATIC | bc::PUTSTATIC);
            let (holder, field) = klass.find_field(&member.name, &member.descriptor).ok_or_else(|| VmError::Throw {
                class: names::NO_SUCH_FIELD_ERROR,
                message: Some(member.to_string()),
            })?;
            if field.is_static() != is_static {
                return Err(VmError::Throw {
                    class: names::INCOMPATIBLE_CLASS_CHANGE_ERROR,
                    message: Some(format!("expected {} field {}", if is_static { "static" } else { "non-static" }, member)),
                });
            }
            let mut flags = field.tos_state() as u32;
            if field.access_flags & access::VOLATILE != 0 {
                flags |= cache_flags::IS_VOLATILE;
            }
            if field.access_flags & access::FINAL != 0 {
                flags |= cache_flags::IS_FINAL;
            }
            let offset = field.offset() as usize;
            let second = matches!(bytecode, bc::PUTSTATIC | bc::PUTFIELD);
            if !is_static {
                entry.set_resolved(bytecode, second, flags, None, Some(offset));
                return Ok(());
            }
            initialize_class(vm, thread, holder)?;
            let mirror = holder.mirror().raw();
            if holder.state() == ClassState::Initialized {
                entry.set_resolved(bytecode, second, flags, Some(mirror), Some(offset));
            } else {
                entry.fill(flags, Some(mirror), Some(offset));
            }
            Ok(())
        }
        bc::INVOKESTATIC | bc::INVOKESPECIAL | bc::INVOKEVIRTUAL | bc::INVOKEINTERFACE => {
            if (bytecode == bc::INVOKEINTERFACE) != is_interface_ref {
                return Err(VmError::Throw {
                    class: names::INCOMPATIBLE_CLASS_CHANGE_ERROR,
                    message: Some(member.to_string()),
                });
            }
            let (tos, params) = result_flags(&member.descriptor)?;
            let receiver = usize::from(bytecode != bc::INVOKESTATIC);
            let flags = tos | (((params + receiver) as u32) << cache_flags::PARAM_SIZE_SHIFT);
            if bytecode == bc::INVOKEINTERFACE {
                if !klass.is_interface() {
                    return Err(VmError::Throw {
                        class: names::INCOMPATIBLE_CLASS_CHANGE_ERROR,
                        message: Some(format!("{} is not an interface", klass.name())),
                    });
                }
                entry.set_resolved(bytecode, false, flags, None, None);
                return Ok(());
            }
            let target = klass.lookup_method(&member.name, &member.descriptor).ok_or_else(|| VmError::Throw {
                class: names::NO_SUCH_METHOD_ERROR,
                message: Some(member.to_string()),
            })?;
            if target.is_static() != (bytecode == bc::INVOKESTATIC) {
                return Err(VmError::Throw {
                    class: names::INCOMPATIBLE_CLASS_CHANGE_ERROR,
                    message: Some(format!("expected {} method {}", if receiver == 0 { "static" } else { "non-static" }, member)),
                });
            }
            let method_addr = target as *const Method as usize;
            match bytecode {
                bc::INVOKESTATIC => {
                    let holder = target.holder();
                    initialize_class(vm, thread, holder)?;
                    if holder.state() == ClassState::Initialized {
                        entry.set_resolved(bytecode, false, flags, Some(method_addr), None);
                    } else {
                        entry.fill(flags, Some(method_addr), None);
                    }
                }
                bc::INVOKESPECIAL => {
                    entry.set_resolved(bytecode, false, flags, Some(method_addr), None);
                }
                _ => match target.vtable_index() {
                    Some(vtable_index) if !target.is_final() && !target.is_private() => {
                        entry.set_resolved(bytecode, true, flags, None, Some(vtable_index));
                    }
                    _ => {
                        entry.set_resolved(bytecode, true, flags | cache_flags::IS_VFINAL, None, Some(method_addr));
                    }
                },
            }
            log::trace!("resolved {} {} -> {}", bytecode_name(bytecode), member, target.qualified_name());
            Ok(())
        }
        other => Err(VmError::Link(format!("{} does not use the constant pool cache", bytecode_name(other)))),
    }
}

/// Select the implementation of the interface method at `index` for the
/// class of `receiver` and cache it in the entry.
pub fn resolve_interface_target<'a>(vm: &'a Vm, method: &Method, index: usize, receiver: Oop) -> VmResult<&'a Method> {
    if receiver.is_null() {
        return Err(VmError::Throw {
            class: names::NULL_POINTER_EXCEPTION,
            message: None,
        });
    }
    let (member, _) = member_ref(method, index)?;
    let iface = vm.resolve_class(&member.class)?;
    let receiver_klass = receiver.klass();
    if !receiver_klass.implements(iface) {
        return Err(VmError::Throw {
            class: names::INCOMPATIBLE_CLASS_CHANGE_ERROR,
            message: Some(format!(
                "class {} does not implement the requested interface {}",
                receiver_klass.name().replace('/', "."),
                iface.name().replace('/', ".")
            )),
        });
    }
    let target = receiver_klass
        .lookup_interface_method(&member.name, &member.descriptor)
        .ok_or_else(|| VmError::Throw {
            class: names::ABSTRACT_METHOD_ERROR,
            message: Some(format!("{}.{}{}", receiver_klass.name(), member.name, member.descriptor)),
        })?;
    if target.is_abstract() {
        return Err(VmError::Throw {
            class: names::ABSTRACT_METHOD_ERROR,
            message: Some(target.qualified_name()),
        });
    }
    // SAFETY: target belongs to a loaded class, which lives as long as the VM.
    let target: &'a Method = unsafe { &*(target as *const Method) };
    if let Some(entry) = method.cache_entry(index) {
        entry.set_interface_target(receiver_klass as *const Klass as usize, target as *const Method as usize);
    }
    Ok(target)
}

/// Run the static initializers of `klass` and its superclasses once.
pub fn initialize_class(vm: &Vm, thread: &JavaThread, klass: &Klass) -> VmResult<()> {
    loop {
        match klass.state() {
            ClassState::Initialized => return Ok(()),
            ClassState::Erroneous => {
                return Err(VmError::Throw {
                    class: names::NO_CLASS_DEF_FOUND_ERROR,
                    message: Some(format!("Could not initialize class {}", klass.name().replace('/', "."))),
                });
            }
            ClassState::BeingInitialized => {
                // recursive request from the initializing thread
                if klass.init_thread.load(Ordering::Acquire) == thread.addr() {
                    return Ok(());
                }
                vm.safepoint().block_if_requested(thread);
                std::thread::yield_now();
            }
            ClassState::Linked => {
                if klass
                    .init_thread
                    .compare_exchange(0, thread.addr(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }
    klass.set_state(ClassState::BeingInitialized);
    log::debug!("initializing {}", klass.name());

    let result = klass
        .super_klass()
        .map_or(Ok(()), |s| initialize_class(vm, thread, s))
        .and_then(|()| match klass.find_method("<clinit>", "()V") {
            Some(clinit) => JavaCalls::call_in_vm(thread, clinit, &[]).map(|_| ()),
            None => Ok(()),
        });

    match result {
        Ok(()) => {
            klass.set_state(ClassState::Initialized);
            klass.init_thread.store(0, Ordering::Release);
            Ok(())
        }
        Err(e) => {
            thread.clear_pending_exception();
            klass.set_state(ClassState::Erroneous);
            klass.init_thread.store(0, Ordering::Release);
            log::debug!("initialization of {} failed: {}", klass.name(), e);
            match e {
                VmError::UncaughtException { class, message } => Err(VmError::Throw {
                    class: names::EXCEPTION_IN_INITIALIZER_ERROR,
                    message: Some(match message {
                        Some(m) => format!("{}: {}", class.replace('/', "."), m),
                        None => class.replace('/', "."),
                    }),
                }),
                other => Err(other),
            }
        }
    }
}

/// Cache state for an invoke, for diagnostics.
pub fn describe_entry(method: &Method, index: usize) -> Option<String> {
    let entry = method.cache_entry(index)?;
    let tos = entry.tos_state().unwrap_or(TosState::Vtos);
    Some(format!(
        "#{} {}/{} params={} tos={} f1={:#x} f2={:#x}",
        entry.cp_index(),
        bytecode_name(entry.bytecode_1()),
        bytecode_name(entry.bytecode_2()),
        entry.parameter_size(),
        tos.name(),
        entry.f1(),
        entry.f2()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpreterConfig;
    use crate::vm::classfile::ClassBuilder;
    use crate::vm::method::access;

    #[test]
    fn test_virtual_and_final_resolution() {
        let vm = Vm::new(InterpreterConfig::default()).unwrap();
        let mut a = ClassBuilder::new("A");
        a.field("x", "I", access::PUBLIC);
        a.method("f", "(I)I", access::PUBLIC, |c| {
            c.local_op(bc::ILOAD, 1).op(bc::IRETURN);
        })
        .unwrap();
        a.method("g", "()V", access::PUBLIC | access::FINAL, |c| {
            c.op(bc::RETURN);
        })
        .unwrap();
        let mut call_f = 0;
        let mut call_g = 0;
        let mut get_x = 0;
        a.method("caller", "()V", access::PUBLIC, |c| {
            call_f = c.constants().method("A", "f", "(I)I") as usize;
            call_g = c.constants().method("A", "g", "()V") as usize;
            get_x = c.constants().field("A", "x", "I") as usize;
            c.op(bc::RETURN);
        })
        .unwrap();
        let a = vm.define_class(a.build()).unwrap();
        let caller = a.find_method("caller", "()V").unwrap();
        let thread = vm.main_thread().unwrap();

        resolve_cache_entry(&vm, &thread, caller, call_f, bc::INVOKEVIRTUAL).unwrap();
        let entry = caller.cache_entry(call_f).unwrap();
        assert!(entry.is_resolved(bc::INVOKEVIRTUAL));
        assert_eq!(entry.parameter_size(), 2);
        assert_eq!(entry.tos_state(), Some(TosState::Itos));
        assert_eq!(entry.flags() & cache_flags::IS_VFINAL, 0);
        assert_eq!(Some(entry.f2()), a.find_method("f", "(I)I").unwrap().vtable_index());

        resolve_cache_entry(&vm, &thread, caller, call_g, bc::INVOKEVIRTUAL).unwrap();
        let entry = caller.cache_entry(call_g).unwrap();
        assert_ne!(entry.flags() & cache_flags::IS_VFINAL, 0);
        assert_eq!(entry.f2(), a.find_method("g", "()V").unwrap() as *const Method as usize);

        resolve_cache_entry(&vm, &thread, caller, get_x, bc::GETFIELD).unwrap();
        let entry = caller.cache_entry(get_x).unwrap();
        assert!(entry.is_resolved(bc::GETFIELD));
        assert!(!entry.is_resolved(bc::PUTFIELD));
        assert_eq!(entry.f2(), crate::vm::oop::field_offset(0) as usize);
    }

    #[test]
    fn test_missing_member_reports_no_such_method() {
        let vm = Vm::new(InterpreterConfig::default()).unwrap();
        let mut b = ClassBuilder::new("B");
        let mut missing = 0;
        b.method("caller", "()V", access::PUBLIC | access::STATIC, |c| {
            missing = c.constants().method("B", "nope", "()V") as usize;
            c.op(bc::RETURN);
        })
        .unwrap();
        let b = vm.define_class(b.build()).unwrap();
        let caller = b.find_method("caller", "()V").unwrap();
        let thread = vm.main_thread().unwrap();
        let err = resolve_cache_entry(&vm, &thread, caller, missing, bc::INVOKESTATIC).unwrap_err();
        assert!(matches!(err, VmError::Throw { class, .. } if class == names::NO_SUCH_METHOD_ERROR));
    }
}
