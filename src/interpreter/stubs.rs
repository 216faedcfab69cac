//! Addresses of shared codelets and entry tables.
//!
//! Codelets are generated one at a time, so code emitted early cannot
//! embed the address of a codelet generated later. Everything that is
//! jumped to from more than one place is therefore reached through a cell
//! of the [`StubTable`] or a slot of the [`EntryTables`], both of which
//! have stable addresses for the life of the interpreter.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::dispatch::EntryPoint;
use super::method_kind::NUMBER_OF_METHOD_KINDS;
use crate::vm::oop::NUMBER_OF_BASIC_TYPES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubId {
    /// Entry frame used for every call from the VM into Java.
    CallStub,
    /// Return address of the call inside the call stub.
    CallStubReturn,
    /// Stores the exception in Tos as pending and leaves the call stub.
    CallStubCatch,
    /// Throws the exception in Tos at the current bcp.
    ThrowException,
    /// Unwinds the current frame and rethrows in the caller.
    RemoveActivation,
    /// Rethrows the exception in Tos in the caller frame after an unwind.
    RethrowException,
    /// Throws the thread's pending exception.
    ForwardException,
    ThrowNullPointer,
    /// Index in R1.
    ThrowArrayIndexOutOfBounds,
    ThrowArithmetic,
    /// Object in R1.
    ThrowClassCast,
    /// Length in R1.
    ThrowNegativeArraySize,
    ThrowIllegalMonitorState,
    /// Jumped to from method entries before any frame is built.
    ThrowStackOverflow,
    IllegalBytecodeSequence,
    UnimplementedBytecode,
    RemoveActivationPreservingArgs,
    DeoptReexecuteReturn,
    DeoptUnpack,
    SlowSignatureHandler,
}

impl StubId {
    pub const ALL: [StubId; 20] = [
        StubId::CallStub,
        StubId::CallStubReturn,
        StubId::CallStubCatch,
        StubId::ThrowException,
        StubId::RemoveActivation,
        StubId::RethrowException,
        StubId::ForwardException,
        StubId::ThrowNullPointer,
        StubId::ThrowArrayIndexOutOfBounds,
        StubId::ThrowArithmetic,
        StubId::ThrowClassCast,
        StubId::ThrowNegativeArraySize,
        StubId::ThrowIllegalMonitorState,
        StubId::ThrowStackOverflow,
        StubId::IllegalBytecodeSequence,
        StubId::UnimplementedBytecode,
        StubId::RemoveActivationPreservingArgs,
        StubId::DeoptReexecuteReturn,
        StubId::DeoptUnpack,
        StubId::SlowSignatureHandler,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            StubId::CallStub => "call stub",
            StubId::CallStubReturn => "call stub return address",
            StubId::CallStubCatch => "call stub catch",
            StubId::ThrowException => "throw exception",
            StubId::RemoveActivation => "remove activation",
            StubId::RethrowException => "rethrow exception",
            StubId::ForwardException => "forward exception",
            StubId::ThrowNullPointer => "NullPointerException",
            StubId::ThrowArrayIndexOutOfBounds => "ArrayIndexOutOfBoundsException",
            StubId::ThrowArithmetic => "ArithmeticException",
            StubId::ThrowClassCast => "ClassCastException",
            StubId::ThrowNegativeArraySize => "NegativeArraySizeException",
            StubId::ThrowIllegalMonitorState => "IllegalMonitorStateException",
            StubId::ThrowStackOverflow => "StackOverflowError",
            StubId::IllegalBytecodeSequence => "illegal bytecode sequence",
            StubId::UnimplementedBytecode => "unimplemented bytecode",
            StubId::RemoveActivationPreservingArgs => "remove activation preserving args",
            StubId::DeoptReexecuteReturn => "deopt reexecute return",
            StubId::DeoptUnpack => "deopt unpack frames",
            StubId::SlowSignatureHandler => "slow signature handler",
        }
    }
}

const NUMBER_OF_STUBS: usize = StubId::ALL.len();

pub struct StubTable {
    cells: [AtomicUsize; NUMBER_OF_STUBS],
}

impl StubTable {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            cells: std::array::from_fn(|_| AtomicUsize::new(0)),
        })
    }

    pub fn get(&self, id: StubId) -> usize {
        self.cells[id.index()].load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, id: StubId, addr: usize) {
        self.cells[id.index()].store(addr, Ordering::Release);
    }

    /// Address of the cell generated code loads `id` from.
    pub fn cell(&self, id: StubId) -> usize {
        &self.cells[id.index()] as *const AtomicUsize as usize
    }

    pub fn missing(&self) -> Vec<StubId> {
        StubId::ALL.into_iter().filter(|id| self.get(*id) == 0).collect()
    }
}

/// Invoke instruction lengths with a return entry.
pub const INVOKE_LENGTHS: [usize; 2] = [3, 5];
/// Deopt entries exist for steps `0..NUMBER_OF_DEOPT_ENTRIES`.
pub const NUMBER_OF_DEOPT_ENTRIES: usize = 6;

/// Per-state entry points and per-kind method entries.
#[repr(C)]
pub struct EntryTables {
    /// Return entries, one per invoke length in [`INVOKE_LENGTHS`].
    pub(crate) return_entry: [EntryPoint; INVOKE_LENGTHS.len()],
    pub(crate) deopt_entry: [EntryPoint; NUMBER_OF_DEOPT_ENTRIES],
    pub(crate) earlyret_entry: EntryPoint,
    pub(crate) safepoint_entry: EntryPoint,
    /// Native result handlers indexed by `BasicType`.
    pub(crate) result_handlers: [usize; NUMBER_OF_BASIC_TYPES],
    /// Method entries indexed by `MethodKind`; 0 where none was generated.
    pub(crate) method_entries: [usize; NUMBER_OF_METHOD_KINDS],
}

impl EntryTables {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            return_entry: [EntryPoint::new(); INVOKE_LENGTHS.len()],
            deopt_entry: [EntryPoint::new(); NUMBER_OF_DEOPT_ENTRIES],
            earlyret_entry: EntryPoint::new(),
            safepoint_entry: EntryPoint::new(),
            result_handlers: [0; NUMBER_OF_BASIC_TYPES],
            method_entries: [0; NUMBER_OF_METHOD_KINDS],
        })
    }

    pub fn return_entry(&self, length: usize) -> Option<&EntryPoint> {
        let i = INVOKE_LENGTHS.iter().position(|l| *l == length)?;
        Some(&self.return_entry[i])
    }

    pub fn deopt_entry(&self, step: usize) -> Option<&EntryPoint> {
        self.deopt_entry.get(step)
    }

    pub fn earlyret_entry(&self) -> &EntryPoint {
        &self.earlyret_entry
    }

    pub fn safepoint_entry(&self) -> &EntryPoint {
        &self.safepoint_entry
    }

    pub fn result_handler(&self, index: usize) -> usize {
        self.result_handlers.get(index).copied().unwrap_or(0)
    }

    pub fn method_entry(&self, kind_index: usize) -> usize {
        self.method_entries.get(kind_index).copied().unwrap_or(0)
    }

    /// Address of the `[usize; 10]` array behind the return entry for `length`.
    pub(crate) fn return_entry_addr(&self, length: usize) -> usize {
        self.return_entry(length).map_or(0, |ep| ep.as_ptr() as usize)
    }

    pub(crate) fn earlyret_entry_addr(&self) -> usize {
        self.earlyret_entry.as_ptr() as usize
    }

    pub(crate) fn result_handlers_addr(&self) -> usize {
        self.result_handlers.as_ptr() as usize
    }

    pub(crate) fn method_entry_addr(&self, kind_index: usize) -> usize {
        &self.method_entries[kind_index] as *const usize as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_ids_index_their_cells() {
        for (i, id) in StubId::ALL.iter().enumerate() {
            assert_eq!(id.index(), i);
        }
        let stubs = StubTable::new();
        assert_eq!(stubs.missing().len(), NUMBER_OF_STUBS);
        stubs.set(StubId::ThrowArithmetic, 0x4000);
        // SAFETY: the cell is an AtomicUsize inside `stubs`.
        let v = unsafe { *(stubs.cell(StubId::ThrowArithmetic) as *const usize) };
        assert_eq!(v, 0x4000);
    }

    #[test]
    fn test_return_entries_by_invoke_length() {
        let tables = EntryTables::new();
        assert!(tables.return_entry(3).is_some());
        assert!(tables.return_entry(5).is_some());
        assert!(tables.return_entry(4).is_none());
        assert_eq!(tables.return_entry_addr(4), 0);
    }
}
