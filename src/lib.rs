//! Templar - a template interpreter generator
//!
//! At startup the interpreter is generated once: one machine-code template
//! per bytecode and top-of-stack state, method entries, return and deopt
//! entries, exception paths and signature handlers. The portable backend
//! runs the generated code on a built-in simulator; the x86-64 backend
//! generates and lists code only.

pub mod codegen;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod vm;

// Re-export commonly used types
pub use config::{Backend, ConfigError, GcBarrier, InterpreterConfig};
pub use error::{VmError, VmResult};
pub use interpreter::{Interpreter, TosState};
pub use vm::{JavaValue, Program, Vm};
