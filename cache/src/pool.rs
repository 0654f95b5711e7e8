use std::io;
use std::ptr;

/// Executable code pool backed by mmap'd memory.
///
/// Mapped read-write-execute for its whole lifetime: the dispatcher
/// patches exit stubs in blocks that are already reachable, so the pool
/// can never drop the write permission.
pub struct ExecPool {
    ptr: *mut u8,
    size: usize,
    offset: usize,
}

// SAFETY: ExecPool owns its mmap'd memory exclusively.
unsafe impl Send for ExecPool {}

impl ExecPool {
    /// Allocate a pool of the given size (rounded up to page size).
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let size = (size + page_size - 1) & !(page_size - 1);

        // SAFETY: mmap with MAP_ANONYMOUS | MAP_PRIVATE, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            offset: 0,
        })
    }

    /// Current bump offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Remaining writable bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    /// Raw pointer to the start of the pool.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Pointer at a given offset.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size);
        unsafe { self.ptr.add(offset) as *const u8 }
    }

    /// Bump-allocate `code` into the pool, returning its start pointer.
    pub fn write(&mut self, code: &[u8]) -> *const u8 {
        assert!(code.len() <= self.remaining(), "code pool overflow");
        let start = self.offset;
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.add(start), code.len());
        }
        self.offset += code.len();
        self.ptr_at(start)
    }

    /// Drop everything and start writing from the base again.
    #[inline]
    pub fn reset(&mut self) {
        self.offset = 0;
    }
}

impl Drop for ExecPool {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
