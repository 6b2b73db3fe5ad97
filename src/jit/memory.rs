//! mmap-backed storage for generated code.
//!
//! Pages are mapped read/write for assembly, then flipped to read/execute
//! once the block is final. The two permissions are never held at the
//! same time.

use std::fmt;
use std::ptr::NonNull;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed(usize),
    ProtectionFailed,
    InvalidSize,
    WriteOverflow { capacity: usize, requested: usize },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed(size) => {
                write!(f, "failed to map {} bytes of code memory", size)
            }
            MemoryError::ProtectionFailed => {
                write!(f, "failed to change code memory protection")
            }
            MemoryError::InvalidSize => write!(f, "code memory size must be non-zero"),
            MemoryError::WriteOverflow {
                capacity,
                requested,
            } => write!(
                f,
                "code write of {} bytes exceeds mapped {} bytes",
                requested, capacity
            ),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A mapped region holding one block's generated code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map a writable region large enough for `size` bytes, rounded up to
    /// whole pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mapped = size.div_ceil(page) * page;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(mapped));
        }

        Ok(ExecutableMemory {
            ptr: NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed(mapped))?,
            size: mapped,
            executable: false,
        })
    }

    /// Copy assembled bytes to the start of the region. Only valid while
    /// the region is still writable.
    pub fn write(&mut self, code: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if code.len() > self.size {
            return Err(MemoryError::WriteOverflow {
                capacity: self.size,
                requested: code.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
        }
        Ok(())
    }

    /// Drop write permission and allow execution.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }

    pub fn base(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Entry point at a byte offset into the region.
    ///
    /// # Safety
    ///
    /// The offset must point at the start of a valid instruction sequence
    /// following the generated-code register conventions, and the region
    /// must have been made executable.
    pub unsafe fn entry_at(&self, offset: usize) -> unsafe extern "C" fn() {
        debug_assert!(self.executable);
        debug_assert!(offset < self.size);
        unsafe { std::mem::transmute(self.ptr.as_ptr().add(offset)) }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The region is never written after make_executable, and raw pointer use
// is confined to the entry points.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ExecutableMemory::new(0),
            Err(MemoryError::InvalidSize)
        ));
    }

    #[test]
    fn test_size_rounds_to_page() {
        let memory = ExecutableMemory::new(10).unwrap();
        assert!(memory.size() >= 10);
        assert_eq!(memory.size() % 4096, 0);
    }

    #[test]
    fn test_write_then_protect() {
        let mut memory = ExecutableMemory::new(16).unwrap();
        memory.write(&[0xC3; 16]).unwrap();
        memory.make_executable().unwrap();
        // Writable API is refused once executable.
        assert!(memory.write(&[0x90]).is_err());
        assert_eq!(unsafe { *memory.base() }, 0xC3);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut memory = ExecutableMemory::new(16).unwrap();
        let big = vec![0u8; memory.size() + 1];
        assert!(matches!(
            memory.write(&big),
            Err(MemoryError::WriteOverflow { .. })
        ));
    }
}
