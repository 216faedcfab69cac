//! Errors reported to embedders of the VM.

use crate::codegen::{MachineError, MemoryError};
use crate::config::ConfigError;
use crate::vm::asm::AsmError;

/// Everything that can go wrong outside of Java-level exception handling.
#[derive(Debug)]
pub enum VmError {
    Config(ConfigError),
    Memory(MemoryError),
    /// Code generation failed (region exhausted, encoding out of range)
    Generation(String),
    /// The selected backend cannot execute code
    UnsupportedBackend(&'static str),
    /// Generated code stopped the machine
    Trap { error: MachineError, codelet: String },
    /// A Java exception was not caught by any frame
    UncaughtException { class: String, message: Option<String> },
    /// A Java exception to raise in the current thread; produced by
    /// resolution and allocation inside runtime entries
    Throw { class: &'static str, message: Option<String> },
    ClassNotFound(String),
    MethodNotFound { class: String, name: String, descriptor: String },
    /// Bad program, class definition or bytecode assembly
    Link(String),
    /// Arguments do not match the method descriptor
    BadArguments(String),
    Program(String),
    Asm(AsmError),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Config(e) => write!(f, "{}", e),
            VmError::Memory(e) => write!(f, "{}", e),
            VmError::Generation(msg) => write!(f, "interpreter generation failed: {}", msg),
            VmError::UnsupportedBackend(name) => {
                write!(f, "backend '{}' can generate but not execute code", name)
            }
            VmError::Trap { error, codelet } => write!(f, "{} in {}", error, codelet),
            VmError::UncaughtException { class, message } => match message {
                Some(m) => write!(f, "uncaught exception {}: {}", class.replace('/', "."), m),
                None => write!(f, "uncaught exception {}", class.replace('/', ".")),
            },
            VmError::Throw { class, message } => match message {
                Some(m) => write!(f, "{}: {}", class.replace('/', "."), m),
                None => write!(f, "{}", class.replace('/', ".")),
            },
            VmError::ClassNotFound(name) => write!(f, "class not found: {}", name),
            VmError::MethodNotFound {
                class,
                name,
                descriptor,
            } => write!(f, "method not found: {}.{}{}", class, name, descriptor),
            VmError::Link(msg) => write!(f, "link error: {}", msg),
            VmError::BadArguments(msg) => write!(f, "bad arguments: {}", msg),
            VmError::Program(msg) => write!(f, "program error: {}", msg),
            VmError::Asm(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Config(e) => Some(e),
            VmError::Memory(e) => Some(e),
            VmError::Trap { error, .. } => Some(error),
            VmError::Asm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for VmError {
    fn from(e: ConfigError) -> Self {
        VmError::Config(e)
    }
}

impl From<MemoryError> for VmError {
    fn from(e: MemoryError) -> Self {
        VmError::Memory(e)
    }
}

impl From<AsmError> for VmError {
    fn from(e: AsmError) -> Self {
        VmError::Asm(e)
    }
}

pub type VmResult<T> = Result<T, VmError>;
