//! Executable memory management using mmap.
//!
//! The interpreter's codelet queue and the signature handler library each
//! own one of these regions. A region is written while it is in the
//! writable state, then flipped to read+execute. Regions that grow after
//! startup (signature handlers) flip back to writable for each append; the
//! mapping stays readable throughout so concurrent readers never fault.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
    Exhausted { requested: usize, available: usize },
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
            MemoryError::Exhausted {
                requested,
                available,
            } => write!(
                f,
                "code region exhausted: {} bytes requested, {} available",
                requested, available
            ),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of executable memory allocated via mmap.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with at least `size` bytes.
    /// The memory is initially writable but not executable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let aligned_size = round_to_page(size);
        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Get the page size for the current system.
    pub fn page_size() -> usize {
        #[cfg(unix)]
        {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Start address of the region.
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes (page rounded).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.size
    }

    /// Write bytes to the memory at the given offset.
    /// Returns an error if the memory is executable or if the write would overflow.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }

        if offset + data.len() > self.size {
            return Err(MemoryError::Exhausted {
                requested: data.len(),
                available: self.size.saturating_sub(offset),
            });
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        Ok(())
    }

    /// Make the memory executable (and read-only).
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        self.protect(true)?;
        self.executable = true;
        Ok(())
    }

    /// Flip the region back to read+write so more code can be appended.
    pub fn make_writable(&mut self) -> Result<(), MemoryError> {
        if !self.executable {
            return Ok(());
        }
        self.protect(false)?;
        self.executable = false;
        Ok(())
    }

    #[cfg(unix)]
    fn protect(&self, executable: bool) -> Result<(), MemoryError> {
        let prot = if executable {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let result = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.size, prot) };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&self, _executable: bool) -> Result<(), MemoryError> {
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Return every whole page past `used` bytes to the OS.
    ///
    /// Returns the number of bytes released. The region keeps at least one page.
    pub fn release_tail(&mut self, used: usize) -> Result<usize, MemoryError> {
        let keep = round_to_page(used.max(1));
        if keep >= self.size {
            return Ok(0);
        }
        let released = self.size - keep;
        #[cfg(unix)]
        {
            let tail = unsafe { self.ptr.as_ptr().add(keep) };
            let result = unsafe { libc::munmap(tail as *mut libc::c_void, released) };
            if result != 0 {
                return Err(MemoryError::ProtectionFailed);
            }
            self.size = keep;
        }
        Ok(released)
    }
}

fn round_to_page(size: usize) -> usize {
    let page_size = ExecutableMemory::page_size();
    (size + page_size - 1) & !(page_size - 1)
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// The region is owned exclusively; mutation requires `&mut self`.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_memory() {
        let mem = ExecutableMemory::new(100).unwrap();
        assert_eq!(mem.size(), ExecutableMemory::page_size());
        assert!(!mem.is_executable());
        assert!(mem.contains(mem.base()));
        assert!(!mem.contains(mem.base() + mem.size()));
    }

    #[test]
    fn test_write_past_end_reports_exhaustion() {
        let mut mem = ExecutableMemory::new(16).unwrap();
        let size = mem.size();
        match mem.write(size - 2, &[1, 2, 3, 4]) {
            Err(MemoryError::Exhausted { requested, available }) => {
                assert_eq!(requested, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn test_cannot_write_after_executable() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.write(0, &[0x90]).is_err());
        mem.make_writable().unwrap();
        mem.write(0, &[0x90]).unwrap();
        assert_eq!(unsafe { *mem.as_ptr() }, 0x90);
    }

    #[test]
    fn test_release_tail_keeps_used_pages() {
        let page = ExecutableMemory::page_size();
        let mut mem = ExecutableMemory::new(page * 4).unwrap();
        mem.write(0, &[7; 10]).unwrap();
        let released = mem.release_tail(10).unwrap();
        assert_eq!(released, page * 3);
        assert_eq!(mem.size(), page);
        assert_eq!(unsafe { *mem.as_ptr().add(9) }, 7);
    }
}
