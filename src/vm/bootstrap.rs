//! The system classes every VM starts with.

use crate::error::VmResult;
use crate::interpreter::bytecodes as bc;

use super::Vm;
use super::classfile::ClassBuilder;
use super::method::access;
use super::natives;
use super::oop::BasicType;

/// Internal names of the classes the runtime refers to.
pub mod names {
    pub const OBJECT: &str = "java/lang/Object";
    pub const CLASS: &str = "java/lang/Class";
    pub const STRING: &str = "java/lang/String";
    pub const SYSTEM: &str = "java/lang/System";
    pub const MATH: &str = "java/lang/Math";
    pub const REFERENCE: &str = "java/lang/ref/Reference";

    pub const THROWABLE: &str = "java/lang/Throwable";
    pub const EXCEPTION: &str = "java/lang/Exception";
    pub const RUNTIME_EXCEPTION: &str = "java/lang/RuntimeException";
    pub const ERROR: &str = "java/lang/Error";
    pub const VIRTUAL_MACHINE_ERROR: &str = "java/lang/VirtualMachineError";
    pub const LINKAGE_ERROR: &str = "java/lang/LinkageError";
    pub const INCOMPATIBLE_CLASS_CHANGE_ERROR: &str = "java/lang/IncompatibleClassChangeError";

    pub const NULL_POINTER_EXCEPTION: &str = "java/lang/NullPointerException";
    pub const ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION: &str = "java/lang/ArrayIndexOutOfBoundsException";
    pub const ARITHMETIC_EXCEPTION: &str = "java/lang/ArithmeticException";
    pub const CLASS_CAST_EXCEPTION: &str = "java/lang/ClassCastException";
    pub const NEGATIVE_ARRAY_SIZE_EXCEPTION: &str = "java/lang/NegativeArraySizeException";
    pub const ILLEGAL_MONITOR_STATE_EXCEPTION: &str = "java/lang/IllegalMonitorStateException";
    pub const ARRAY_STORE_EXCEPTION: &str = "java/lang/ArrayStoreException";

    pub const STACK_OVERFLOW_ERROR: &str = "java/lang/StackOverflowError";
    pub const OUT_OF_MEMORY_ERROR: &str = "java/lang/OutOfMemoryError";
    pub const INTERNAL_ERROR: &str = "java/lang/InternalError";
    pub const NO_CLASS_DEF_FOUND_ERROR: &str = "java/lang/NoClassDefFoundError";
    pub const UNSATISFIED_LINK_ERROR: &str = "java/lang/UnsatisfiedLinkError";
    pub const EXCEPTION_IN_INITIALIZER_ERROR: &str = "java/lang/ExceptionInInitializerError";
    pub const ABSTRACT_METHOD_ERROR: &str = "java/lang/AbstractMethodError";
    pub const NO_SUCH_METHOD_ERROR: &str = "java/lang/NoSuchMethodError";
    pub const NO_SUCH_FIELD_ERROR: &str = "java/lang/NoSuchFieldError";
    pub const INSTANTIATION_ERROR: &str = "java/lang/InstantiationError";
}

/// Throwable classes as (name, superclass), parents first.
const THROWABLES: &[(&str, &str)] = &[
    (names::EXCEPTION, names::THROWABLE),
    (names::RUNTIME_EXCEPTION, names::EXCEPTION),
    (names::ERROR, names::THROWABLE),
    (names::NULL_POINTER_EXCEPTION, names::RUNTIME_EXCEPTION),
    (names::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, names::RUNTIME_EXCEPTION),
    (names::ARITHMETIC_EXCEPTION, names::RUNTIME_EXCEPTION),
    (names::CLASS_CAST_EXCEPTION, names::RUNTIME_EXCEPTION),
    (names::NEGATIVE_ARRAY_SIZE_EXCEPTION, names::RUNTIME_EXCEPTION),
    (names::ILLEGAL_MONITOR_STATE_EXCEPTION, names::RUNTIME_EXCEPTION),
    (names::ARRAY_STORE_EXCEPTION, names::RUNTIME_EXCEPTION),
    (names::VIRTUAL_MACHINE_ERROR, names::ERROR),
    (names::STACK_OVERFLOW_ERROR, names::VIRTUAL_MACHINE_ERROR),
    (names::OUT_OF_MEMORY_ERROR, names::VIRTUAL_MACHINE_ERROR),
    (names::INTERNAL_ERROR, names::VIRTUAL_MACHINE_ERROR),
    (names::LINKAGE_ERROR, names::ERROR),
    (names::NO_CLASS_DEF_FOUND_ERROR, names::LINKAGE_ERROR),
    (names::UNSATISFIED_LINK_ERROR, names::LINKAGE_ERROR),
    (names::EXCEPTION_IN_INITIALIZER_ERROR, names::LINKAGE_ERROR),
    (names::INCOMPATIBLE_CLASS_CHANGE_ERROR, names::LINKAGE_ERROR),
    (names::ABSTRACT_METHOD_ERROR, names::INCOMPATIBLE_CLASS_CHANGE_ERROR),
    (names::NO_SUCH_METHOD_ERROR, names::INCOMPATIBLE_CLASS_CHANGE_ERROR),
    (names::NO_SUCH_FIELD_ERROR, names::INCOMPATIBLE_CLASS_CHANGE_ERROR),
    (names::INSTANTIATION_ERROR, names::INCOMPATIBLE_CLASS_CHANGE_ERROR),
];

/// `Throwable.message` is the first instance field.
pub const THROWABLE_MESSAGE_SLOT: usize = 0;
/// `String.value` is the first instance field.
pub const STRING_VALUE_SLOT: usize = 0;

const STRING_ARG: &str = "(Ljava/lang/String;)V";

fn define_object(vm: &Vm) -> VmResult<()> {
    let mut b = ClassBuilder::new(names::OBJECT);
    b.method("<init>", "()V", access::PUBLIC, |c| {
        c.op(bc::RETURN);
    })?;
    b.method_without_code("hashCode", "()I", access::PUBLIC | access::NATIVE);
    b.method("equals", "(Ljava/lang/Object;)Z", access::PUBLIC, |c| {
        let different = c.new_label();
        c.local_op(bc::ALOAD, 0).local_op(bc::ALOAD, 1).branch(bc::IF_ACMPNE, different);
        c.op(bc::ICONST_1).op(bc::IRETURN);
        c.bind(different).op(bc::ICONST_0).op(bc::IRETURN);
    })?;
    b.method("finalize", "()V", access::PROTECTED, |c| {
        c.op(bc::RETURN);
    })?;
    vm.define_class(b.build())?;
    vm.define_class(ClassBuilder::new(names::CLASS).build())?;
    Ok(())
}

fn define_string(vm: &Vm) -> VmResult<()> {
    let mut b = ClassBuilder::new(names::STRING);
    b.access(access::PUBLIC | access::FINAL);
    b.field("value", "[C", access::PRIVATE | access::FINAL);
    b.method("length", "()I", access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .field_op(bc::GETFIELD, names::STRING, "value", "[C")
            .op(bc::ARRAYLENGTH)
            .op(bc::IRETURN);
    })?;
    b.method("charAt", "(I)C", access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .field_op(bc::GETFIELD, names::STRING, "value", "[C")
            .local_op(bc::ILOAD, 1)
            .op(bc::CALOAD)
            .op(bc::IRETURN);
    })?;
    vm.define_class(b.build())?;
    Ok(())
}

/// A throwable class with the two usual constructors chaining to `parent`.
fn throwable_builder(name: &str, parent: &str) -> VmResult<ClassBuilder> {
    let mut b = ClassBuilder::new(name);
    b.super_class(parent);
    let parent = parent.to_string();
    b.method("<init>", "()V", access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .invoke(bc::INVOKESPECIAL, &parent, "<init>", "()V")
            .op(bc::RETURN);
    })?;
    b.method("<init>", STRING_ARG, access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .local_op(bc::ALOAD, 1)
            .invoke(bc::INVOKESPECIAL, &parent, "<init>", STRING_ARG)
            .op(bc::RETURN);
    })?;
    Ok(b)
}

fn define_throwables(vm: &Vm) -> VmResult<()> {
    let mut b = ClassBuilder::new(names::THROWABLE);
    b.field("message", "Ljava/lang/String;", access::PRIVATE);
    b.method("<init>", "()V", access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .invoke(bc::INVOKESPECIAL, names::OBJECT, "<init>", "()V")
            .op(bc::RETURN);
    })?;
    b.method("<init>", STRING_ARG, access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .invoke(bc::INVOKESPECIAL, names::OBJECT, "<init>", "()V")
            .local_op(bc::ALOAD, 0)
            .local_op(bc::ALOAD, 1)
            .field_op(bc::PUTFIELD, names::THROWABLE, "message", "Ljava/lang/String;")
            .op(bc::RETURN);
    })?;
    b.method("getMessage", "()Ljava/lang/String;", access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .field_op(bc::GETFIELD, names::THROWABLE, "message", "Ljava/lang/String;")
            .op(bc::ARETURN);
    })?;
    vm.define_class(b.build())?;
    for (name, parent) in THROWABLES {
        vm.define_class(throwable_builder(name, parent)?.build())?;
    }
    Ok(())
}

fn define_math(vm: &Vm) -> VmResult<()> {
    let mut b = ClassBuilder::new(names::MATH);
    b.access(access::PUBLIC | access::FINAL);
    let flags = access::PUBLIC | access::STATIC | access::NATIVE;
    for name in ["sin", "cos", "tan", "abs", "sqrt", "log", "log10", "exp"] {
        b.method_without_code(name, "(D)D", flags);
    }
    b.method_without_code("pow", "(DD)D", flags);
    vm.define_class(b.build())?;
    Ok(())
}

fn define_reference(vm: &Vm) -> VmResult<()> {
    let mut b = ClassBuilder::new(names::REFERENCE);
    b.field("referent", "Ljava/lang/Object;", access::PRIVATE);
    b.method("<init>", "(Ljava/lang/Object;)V", access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .invoke(bc::INVOKESPECIAL, names::OBJECT, "<init>", "()V")
            .local_op(bc::ALOAD, 0)
            .local_op(bc::ALOAD, 1)
            .field_op(bc::PUTFIELD, names::REFERENCE, "referent", "Ljava/lang/Object;")
            .op(bc::RETURN);
    })?;
    b.method("get", "()Ljava/lang/Object;", access::PUBLIC, |c| {
        c.local_op(bc::ALOAD, 0)
            .field_op(bc::GETFIELD, names::REFERENCE, "referent", "Ljava/lang/Object;")
            .op(bc::ARETURN);
    })?;
    vm.define_class(b.build())?;
    Ok(())
}

fn define_system(vm: &Vm) -> VmResult<()> {
    let mut b = ClassBuilder::new(names::SYSTEM);
    b.access(access::PUBLIC | access::FINAL);
    let flags = access::PUBLIC | access::STATIC | access::NATIVE;
    b.method_without_code("identityHashCode", "(Ljava/lang/Object;)I", flags);
    b.method_without_code("print", STRING_ARG, flags);
    for desc in [STRING_ARG, "(I)V", "(J)V", "(D)V"] {
        b.method_without_code("println", desc, flags);
    }
    b.method_without_code("callStatic", "(Ljava/lang/String;Ljava/lang/String;I)I", flags);
    vm.define_class(b.build())?;
    Ok(())
}

/// Define the system classes, the primitive array classes and the
/// preallocated `OutOfMemoryError`, and register the built-in natives.
pub(crate) fn initialize(vm: &Vm) -> VmResult<()> {
    define_object(vm)?;
    vm.create_missing_mirrors()?;
    for ty in BasicType::ALL.iter().copied().filter(|t| t.slots() == 1 && !t.is_reference()) {
        vm.create_type_array_klass(ty)?;
    }
    vm.create_type_array_klass(BasicType::Long)?;
    vm.create_type_array_klass(BasicType::Double)?;
    define_string(vm)?;
    define_throwables(vm)?;
    define_math(vm)?;
    define_reference(vm)?;
    define_system(vm)?;
    natives::register_builtins(vm);
    vm.preallocate_out_of_memory_error()?;
    log::debug!("bootstrap: {} classes, {} natives", vm.class_count(), vm.natives().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throwable_parents_are_defined_first() {
        let mut seen = vec![names::THROWABLE];
        for (name, parent) in THROWABLES {
            assert!(seen.contains(parent), "{} before its parent {}", name, parent);
            seen.push(name);
        }
    }
}
