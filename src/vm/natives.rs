//! Native method registry and the built-in natives of the system classes.
//!
//! Natives receive a [`NativeArgs`] block laid out by the signature
//! handler: `ints[0]` is the JNI environment, `ints[1]` the receiver (or
//! the class mirror for statics), then parameters in order. Reference
//! arguments are handles; reference results must be returned as handles.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::codegen::simulator::{NativeArgs, NativeFn};

use super::Vm;
use super::bootstrap::names;
use super::javacalls::{JavaCalls, JavaValue};
use super::method::Method;
use super::oop::Oop;
use super::thread::{JavaThread, JniEnv};

type NativeKey = (String, String, String);

#[derive(Default)]
pub struct NativeRegistry {
    functions: Mutex<HashMap<NativeKey, usize>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `class.name descriptor` to `f`, replacing any earlier binding.
    pub fn register(&self, class: &str, name: &str, descriptor: &str, f: NativeFn) {
        log::trace!("native {}.{}{} registered", class, name, descriptor);
        self.functions
            .lock()
            .insert((class.to_string(), name.to_string(), descriptor.to_string()), f as *const () as usize);
    }

    pub fn lookup(&self, method: &Method) -> Option<usize> {
        let key = (
            method.holder().name().to_string(),
            method.name().to_string(),
            method.descriptor().to_string(),
        );
        self.functions.lock().get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.functions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn env_thread<'a>(args: &NativeArgs) -> &'a JavaThread {
    // SAFETY: the native entry passes the calling thread's environment.
    let env: &'a JniEnv = unsafe { JniEnv::from_raw(args.ints[0] as usize) };
    env.thread()
}

fn arg_oop(args: &NativeArgs, i: usize) -> Oop {
    Oop::from_handle(args.ints[i] as usize)
}

extern "C" fn object_hash_code(args: &NativeArgs) -> u64 {
    let thread = env_thread(args);
    thread.vm().heap().identity_hash(arg_oop(args, 1)) as u32 as u64
}

extern "C" fn system_identity_hash_code(args: &NativeArgs) -> u64 {
    let obj = arg_oop(args, 2);
    if obj.is_null() {
        return 0;
    }
    env_thread(args).vm().heap().identity_hash(obj) as u32 as u64
}

fn print_string(args: &NativeArgs, newline: bool) {
    let vm = env_thread(args).vm();
    let obj = arg_oop(args, 2);
    let text = if obj.is_null() {
        "null".to_string()
    } else {
        vm.string_value(obj).unwrap_or_default()
    };
    vm.write_output(&text, newline);
}

extern "C" fn system_print_string(args: &NativeArgs) -> u64 {
    print_string(args, false);
    0
}

extern "C" fn system_println_string(args: &NativeArgs) -> u64 {
    print_string(args, true);
    0
}

extern "C" fn system_println_int(args: &NativeArgs) -> u64 {
    let value = args.ints[2] as i32;
    env_thread(args).vm().write_output(&value.to_string(), true);
    0
}

extern "C" fn system_println_long(args: &NativeArgs) -> u64 {
    let value = args.ints[2] as i64;
    env_thread(args).vm().write_output(&value.to_string(), true);
    0
}

extern "C" fn system_println_double(args: &NativeArgs) -> u64 {
    let value = f64::from_bits(args.floats[0]);
    env_thread(args).vm().write_output(&format!("{:?}", value), true);
    0
}

/// `System.callStatic(className, methodName, arg)`: call a static `(I)I`
/// method from native code.
extern "C" fn system_call_static(args: &NativeArgs) -> u64 {
    let thread = env_thread(args);
    let vm = thread.vm();
    let (class, name) = match (vm.string_value(arg_oop(args, 2)), vm.string_value(arg_oop(args, 3))) {
        (Some(c), Some(n)) => (c.replace('.', "/"), n),
        _ => {
            vm.throw(thread, names::NULL_POINTER_EXCEPTION, None);
            return 0;
        }
    };
    let arg = args.ints[4] as i32;
    let method = match vm.find_class(&class) {
        Some(k) => k.find_method(&name, "(I)I").filter(|m| m.is_static()),
        None => None,
    };
    let Some(method) = method else {
        vm.throw(thread, names::NO_SUCH_METHOD_ERROR, Some(format!("{}.{}(I)I", class, name)));
        return 0;
    };
    match JavaCalls::call_in_vm(thread, method, &[JavaValue::Int(arg)]) {
        Ok(JavaValue::Int(v)) => v as u32 as u64,
        Ok(_) => 0,
        Err(e) => {
            vm.throw_error(thread, e);
            0
        }
    }
}

macro_rules! math_native {
    ($name:ident, |$x:ident, $y:ident| $body:expr) => {
        extern "C" fn $name(args: &NativeArgs) -> u64 {
            let $x = f64::from_bits(args.floats[0]);
            let $y = f64::from_bits(args.floats[1]);
            let r: f64 = $body;
            r.to_bits()
        }
    };
}

math_native!(math_sin, |x, _y| x.sin());
math_native!(math_cos, |x, _y| x.cos());
math_native!(math_tan, |x, _y| x.tan());
math_native!(math_abs, |x, _y| x.abs());
math_native!(math_sqrt, |x, _y| x.sqrt());
math_native!(math_log, |x, _y| x.ln());
math_native!(math_log10, |x, _y| x.log10());
math_native!(math_exp, |x, _y| x.exp());
math_native!(math_pow, |x, y| x.powf(y));

/// Register the natives of the classes defined at bootstrap.
pub(crate) fn register_builtins(vm: &Vm) {
    let natives = vm.natives();
    natives.register(names::OBJECT, "hashCode", "()I", object_hash_code);
    natives.register(names::SYSTEM, "identityHashCode", "(Ljava/lang/Object;)I", system_identity_hash_code);
    natives.register(names::SYSTEM, "print", "(Ljava/lang/String;)V", system_print_string);
    natives.register(names::SYSTEM, "println", "(Ljava/lang/String;)V", system_println_string);
    natives.register(names::SYSTEM, "println", "(I)V", system_println_int);
    natives.register(names::SYSTEM, "println", "(J)V", system_println_long);
    natives.register(names::SYSTEM, "println", "(D)V", system_println_double);
    natives.register(
        names::SYSTEM,
        "callStatic",
        "(Ljava/lang/String;Ljava/lang/String;I)I",
        system_call_static,
    );
    for (name, f) in [
        ("sin", math_sin as NativeFn),
        ("cos", math_cos),
        ("tan", math_tan),
        ("abs", math_abs),
        ("sqrt", math_sqrt),
        ("log", math_log),
        ("log10", math_log10),
        ("exp", math_exp),
    ] {
        natives.register(names::MATH, name, "(D)D", f);
    }
    natives.register(names::MATH, "pow", "(DD)D", math_pow);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with_floats(x: f64, y: f64) -> NativeArgs {
        let mut floats = [0u64; crate::codegen::masm::NUM_FREGS];
        floats[0] = x.to_bits();
        floats[1] = y.to_bits();
        NativeArgs {
            ints: [0; 6],
            floats,
            stack: std::ptr::null(),
        }
    }

    #[test]
    fn test_math_natives_read_double_registers() {
        let r = math_pow(&args_with_floats(2.0, 8.0));
        assert_eq!(f64::from_bits(r), 256.0);
        let r = math_sqrt(&args_with_floats(2.25, 0.0));
        assert_eq!(f64::from_bits(r), 1.5);
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = NativeRegistry::new();
        assert!(registry.is_empty());
        registry.register("A", "f", "()V", math_sin);
        assert_eq!(registry.len(), 1);
    }
}
