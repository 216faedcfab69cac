//! Machine-code emission.
//!
//! - [`memory`]: mmap-backed executable regions
//! - [`codebuf`]: a growable buffer with labels for one codelet
//! - [`masm`]: the abstract emission interface the interpreter is written in
//! - [`portable`]: the portable ISA, executed by [`simulator`]
//! - [`x86_64`]: x86-64 lowering (listed and disassembled, not executed)

pub mod codebuf;
pub mod masm;
pub mod memory;
pub mod portable;
pub mod simulator;
#[cfg(feature = "x86_64")]
pub mod x86_64;

pub use codebuf::CodeBuffer;
pub use masm::{Address, FReg, Indexed, Label, MacroAssembler, Reg};
pub use memory::{ExecutableMemory, MemoryError};
pub use portable::PortableAssembler;
pub use simulator::{CodeSpace, Machine, MachineError};
#[cfg(feature = "x86_64")]
pub use x86_64::X86_64Assembler;
