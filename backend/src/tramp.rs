//! Executable page for backend-private thunks.

use std::io;
use std::ptr;

/// Small RX mapping holding entry/restore thunks.
pub(crate) struct TrampPage {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the page is owned exclusively and immutable after creation.
unsafe impl Send for TrampPage {}

impl TrampPage {
    pub(crate) fn new(code: &[u8]) -> io::Result<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let size = (code.len() + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
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
            return Err(io::Error::last_os_error());
        }
        let ptr = ptr as *mut u8;

        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if libc::mprotect(
                ptr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_EXEC,
            ) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(ptr as *mut libc::c_void, size);
                return Err(err);
            }
        }
        Ok(Self { ptr, size })
    }

    pub(crate) fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset < self.size);
        unsafe { self.ptr.add(offset) as *const u8 }
    }
}

impl Drop for TrampPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}
