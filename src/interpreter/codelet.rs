//! The codelet queue: one executable region holding all generated code.
//!
//! Codelets are appended during generation and never freed individually.
//! Once generation is complete the unused tail is returned and the region
//! is sealed read+execute.

use serde::Serialize;

use crate::codegen::memory::{ExecutableMemory, MemoryError};

/// Codelet start alignment.
pub const CODE_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeletKind {
    BytecodeHandler,
    EntryStub,
    ExceptionHandler,
    DeoptStub,
    SafepointStub,
}

impl CodeletKind {
    pub fn name(self) -> &'static str {
        match self {
            CodeletKind::BytecodeHandler => "bytecode-handler",
            CodeletKind::EntryStub => "entry-stub",
            CodeletKind::ExceptionHandler => "exception-handler",
            CodeletKind::DeoptStub => "deopt-stub",
            CodeletKind::SafepointStub => "safepoint-stub",
        }
    }
}

/// One named unit of generated code.
#[derive(Debug, Clone, Serialize)]
pub struct Codelet {
    pub name: String,
    pub kind: CodeletKind,
    pub start: usize,
    pub size: usize,
}

impl Codelet {
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.start && pc < self.end()
    }
}

pub struct CodeletQueue {
    memory: ExecutableMemory,
    /// Bytes handed out so far.
    used: usize,
    /// Sorted by start address.
    codelets: Vec<Codelet>,
    /// Padding byte between codelets (a no-op in the backend's ISA).
    fill: u8,
    sealed: bool,
}

impl CodeletQueue {
    pub fn new(capacity: usize, fill: u8) -> Result<Self, MemoryError> {
        Ok(Self {
            memory: ExecutableMemory::new(capacity)?,
            used: 0,
            codelets: Vec::new(),
            fill,
            sealed: false,
        })
    }

    /// Address the next codelet will start at.
    pub fn next_start(&self) -> usize {
        self.memory.base() + align_up(self.used, CODE_ALIGNMENT)
    }

    pub fn available(&self) -> usize {
        self.memory.size().saturating_sub(align_up(self.used, CODE_ALIGNMENT))
    }

    /// Copy `code` (emitted for `next_start()`) into the region and record it.
    pub fn commit(&mut self, kind: CodeletKind, name: &str, code: &[u8]) -> Result<usize, MemoryError> {
        if self.sealed {
            self.memory.make_writable()?;
        }
        let offset = align_up(self.used, CODE_ALIGNMENT);
        if offset + code.len() > self.memory.size() {
            return Err(MemoryError::Exhausted {
                requested: code.len(),
                available: self.available(),
            });
        }
        if offset > self.used {
            let pad = vec![self.fill; offset - self.used];
            self.memory.write(self.used, &pad)?;
        }
        self.memory.write(offset, code)?;
        self.used = offset + code.len();
        let start = self.memory.base() + offset;
        log::trace!("codelet {} [{}] at {:#x}, {} bytes", name, kind.name(), start, code.len());
        self.codelets.push(Codelet {
            name: name.to_string(),
            kind,
            start,
            size: code.len(),
        });
        if self.sealed {
            self.memory.make_executable()?;
        }
        Ok(start)
    }

    /// The codelet containing `pc`, if any.
    pub fn stub_containing(&self, pc: usize) -> Option<&Codelet> {
        let idx = self.codelets.partition_point(|c| c.start <= pc);
        if idx == 0 {
            return None;
        }
        let codelet = &self.codelets[idx - 1];
        codelet.contains(pc).then_some(codelet)
    }

    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.memory.base() && pc < self.memory.base() + self.used
    }

    /// Return the unused, whole-page tail of the region to the OS.
    pub fn deallocate_unused_tail(&mut self) -> Result<usize, MemoryError> {
        let released = self.memory.release_tail(self.used)?;
        if released > 0 {
            log::debug!("codelet queue: released {} unused bytes", released);
        }
        Ok(released)
    }

    /// Flip the region to read+execute. Later commits re-open it briefly.
    pub fn seal(&mut self) -> Result<(), MemoryError> {
        self.memory.make_executable()?;
        self.sealed = true;
        Ok(())
    }

    pub fn codelets(&self) -> &[Codelet] {
        &self.codelets
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.memory.size()
    }

    pub fn base(&self) -> usize {
        self.memory.base()
    }

    /// Bytes of a codelet, for listings.
    pub fn bytes_of(&self, codelet: &Codelet) -> &[u8] {
        let offset = codelet.start - self.memory.base();
        // SAFETY: recorded codelets lie inside the mapping, which stays readable.
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr().add(offset), codelet.size) }
    }
}

fn align_up(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_aligns_and_records() {
        let mut queue = CodeletQueue::new(4096, 0).unwrap();
        let a = queue.commit(CodeletKind::EntryStub, "a", &[1, 2, 3]).unwrap();
        let b = queue.commit(CodeletKind::BytecodeHandler, "b", &[4; 20]).unwrap();
        assert_eq!(a, queue.base());
        assert_eq!(b, queue.base() + 16);
        assert_eq!(queue.stub_containing(a + 2).unwrap().name, "a");
        // padding between codelets belongs to nobody
        assert!(queue.stub_containing(a + 5).is_none());
        assert_eq!(queue.stub_containing(b + 19).unwrap().name, "b");
        assert!(queue.stub_containing(b + 20).is_none());
        assert_eq!(queue.bytes_of(&queue.codelets()[1]), &[4; 20]);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut queue = CodeletQueue::new(1, 0).unwrap();
        let size = queue.capacity();
        let err = queue
            .commit(CodeletKind::EntryStub, "big", &vec![0; size + 1])
            .unwrap_err();
        assert!(matches!(err, MemoryError::Exhausted { .. }));
    }

    #[test]
    fn test_seal_and_release_tail() {
        let page = ExecutableMemory::page_size();
        let mut queue = CodeletQueue::new(page * 4, 0).unwrap();
        queue.commit(CodeletKind::EntryStub, "x", &[0x36]).unwrap();
        assert_eq!(queue.deallocate_unused_tail().unwrap(), page * 3);
        queue.seal().unwrap();
        // appends after sealing still work
        let y = queue.commit(CodeletKind::EntryStub, "y", &[0x36]).unwrap();
        assert!(queue.contains(y));
    }
}
