//! The host VM the interpreter runs against: heap, classes, threads,
//! resolution, monitors, safepoints and the calls between Rust and Java.

pub mod asm;
pub mod barrier;
pub mod bootstrap;
pub mod classfile;
pub mod compile;
pub mod constants;
pub mod deopt;
pub mod heap;
pub mod javacalls;
pub mod jvmti;
pub mod klass;
pub mod linker;
pub mod method;
pub mod natives;
pub mod oop;
pub mod program;
pub mod safepoint;
pub mod sync;
pub mod thread;
mod vm;

pub use classfile::{ClassBuilder, ClassDefinition, CodeBuilder};
pub use deopt::{UnpackPlan, VirtualFrame};
pub use javacalls::{JavaCalls, JavaValue};
pub use klass::Klass;
pub use method::Method;
pub use oop::{BasicType, Oop};
pub use program::Program;
pub use thread::JavaThread;
pub use vm::Vm;
