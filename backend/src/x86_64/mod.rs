//! x86-64 backend: instruction selection plus the execution trampoline,
//! exit patching, marker recovery, and signal re-entry.

mod encoder;

pub use encoder::{X86_64Emitter, ALLOC_POOL, CALLER_SAVED, CALL_ARG_REGS, CTX_REG, SHIFT_REG};

use std::io;
use std::ptr;

use dbt_ir::IrBuilder;

use crate::code_buf::CodeBuf;
use crate::encode::{emit_call_reg, emit_mov_rr, emit_pop, emit_push, emit_ret, Reg};
use crate::lower::lower;
use crate::tramp::TrampPage;
use crate::{Backend, ExecResult};

/// Entry thunk ABI: (guest context, block start) -> value + patch site.
type EntryFn = unsafe extern "C" fn(*mut u8, *const u8) -> ExecResult;

/// The x86-64 backend. Blocks are entered through a small thunk that
/// pins the guest context in RBP, saves the callee-saved pool register,
/// and calls the block; blocks return with a bare `ret`.
pub struct X86_64Backend {
    em: X86_64Emitter,
    _tramp: TrampPage,
    entry: EntryFn,
    restore: *const u8,
}

// SAFETY: all interior pointers target the exclusively-owned TrampPage.
unsafe impl Send for X86_64Backend {}

impl X86_64Backend {
    pub fn new() -> io::Result<Self> {
        let mut buf = CodeBuf::new();

        // Entry thunk. RBX is the only callee-saved register in the
        // allocation pool.
        emit_push(&mut buf, Reg::Rbp);
        emit_push(&mut buf, Reg::Rbx);
        emit_mov_rr(&mut buf, true, Reg::Rbp, Reg::Rdi);
        emit_call_reg(&mut buf, Reg::Rsi);
        emit_pop(&mut buf, Reg::Rbx);
        emit_pop(&mut buf, Reg::Rbp);
        emit_ret(&mut buf);

        while buf.offset() % 16 != 0 {
            buf.emit_u8(0x90);
        }

        // Restore thunk for the signal path: the rewritten context
        // lands here with the result staged in the argument registers,
        // and this synthesizes a normal block return.
        let restore_off = buf.offset();
        emit_mov_rr(&mut buf, true, Reg::Rax, Reg::Rdi);
        emit_mov_rr(&mut buf, true, Reg::Rdx, Reg::Rsi);
        emit_ret(&mut buf);

        let tramp = TrampPage::new(buf.as_slice())?;
        // SAFETY: the page starts with the entry thunk emitted above.
        let entry: EntryFn = unsafe { core::mem::transmute(tramp.ptr_at(0)) };
        let restore = tramp.ptr_at(restore_off);
        Ok(Self {
            em: X86_64Emitter,
            _tramp: tramp,
            entry,
            restore,
        })
    }
}

impl Backend for X86_64Backend {
    fn jit(&mut self, ir: &IrBuilder, out: &mut CodeBuf) -> usize {
        lower(&mut self.em, ir, out).len
    }

    unsafe fn execute(&self, code: *const u8, ctx: *mut u8) -> ExecResult {
        (self.entry)(ctx, code)
    }

    unsafe fn patch(&self, site: u64, target: u64) {
        let site = site as *mut u8;
        // Fill the target slot first, then retire the `ret` into a nop
        // so control falls through into the indirect jump.
        ptr::write_unaligned(site.add(7) as *mut u64, target);
        ptr::write(site, 0x90);
    }

    fn get_marker(&mut self, ir: &IrBuilder, offset: usize) -> u64 {
        let mut scratch = CodeBuf::new();
        lower(&mut self.em, ir, &mut scratch).marker_at(offset)
    }

    #[allow(unused_variables)]
    unsafe fn request_alternate_exit(&self, uc: *mut libc::c_void, result: ExecResult) {
        #[cfg(target_arch = "x86_64")]
        {
            let uc = uc as *mut libc::ucontext_t;
            let gregs = &mut (*uc).uc_mcontext.gregs;
            gregs[libc::REG_RDI as usize] = result.value as i64;
            gregs[libc::REG_RSI as usize] = result.patch_site as i64;
            gregs[libc::REG_RIP as usize] = self.restore as i64;
        }
        #[cfg(not(target_arch = "x86_64"))]
        unreachable!("x86-64 signal re-entry on a foreign host");
    }
}
