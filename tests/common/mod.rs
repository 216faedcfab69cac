//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use templar::vm::Klass;
use templar::{InterpreterConfig, JavaValue, Program, Vm, VmError};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fresh VM with the default configuration.
pub fn vm() -> Arc<Vm> {
    vm_with(InterpreterConfig::default())
}

pub fn vm_with(config: InterpreterConfig) -> Arc<Vm> {
    init_logger();
    Vm::new(config).expect("vm startup")
}

/// Define the classes of a TOML program.
pub fn load<'v>(vm: &'v Vm, source: &str) -> Vec<&'v Klass> {
    let program = Program::from_toml_str(source).expect("program parses");
    program.define(vm, source).expect("program defines")
}

/// A program with a single class `name` whose methods are given as
/// `(name, descriptor, access, code)`.
pub fn class(name: &str, methods: &[(&str, &str, &str, &str)]) -> String {
    let mut out = format!("[[class]]\nname = \"{}\"\n", name);
    for (method, descriptor, access, code) in methods {
        let flags: Vec<String> = access.split_whitespace().map(|f| format!("\"{}\"", f)).collect();
        out.push_str(&format!(
            "\n[[class.method]]\nname = \"{}\"\ndescriptor = \"{}\"\naccess = [{}]\ncode = \"\"\"\n{}\n\"\"\"\n",
            method,
            descriptor,
            flags.join(", "),
            code
        ));
    }
    out
}

/// Run a static method of a single-method class and return its result.
pub fn run_static(vm: &Vm, class: &str, name: &str, descriptor: &str, args: &[JavaValue]) -> Result<JavaValue, VmError> {
    vm.call_static(class, name, descriptor, args)
}

/// Define `code` as `static T.run()<ret>` on a fresh VM and run it.
pub fn eval(result: &str, code: &str) -> Result<JavaValue, VmError> {
    let vm = vm();
    let descriptor = format!("(){}", result);
    load(&vm, &class("T", &[("run", &descriptor, "static", code)]));
    vm.call_static("T", "run", &descriptor, &[])
}

pub fn eval_int(code: &str) -> i32 {
    match eval("I", code) {
        Ok(JavaValue::Int(v)) => v,
        other => panic!("expected an int result, got {:?}", other),
    }
}

/// Assert that `result` is an uncaught exception of `class`.
pub fn assert_uncaught(result: Result<JavaValue, VmError>, expected: &str) -> Option<String> {
    match result {
        Err(VmError::UncaughtException { class, message }) => {
            assert_eq!(class, expected);
            message
        }
        other => panic!("expected uncaught {}, got {:?}", expected, other),
    }
}
