//! IA-32 backend: slot-frame code generation plus the execution
//! trampoline, exit patching, marker recovery, and signal re-entry.

mod encoder;

pub use encoder::{I386Emitter, CTX_REG, FRAME_SIZE};

use std::io;
use std::ptr;

use dbt_ir::IrBuilder;

use crate::code_buf::CodeBuf;
use crate::encode::{
    emit_arith_ri, emit_call_reg, emit_load, emit_mov_rr, emit_pop, emit_push, emit_ret,
    emit_ret_imm16, emit_store, emit_store_imm, ArithOp, Reg,
};
use crate::lower::lower;
use crate::tramp::TrampPage;
use crate::{Backend, ExecResult};

/// Entry thunk ABI: (guest context, block start) -> value + patch site.
/// The 16-byte result goes through cdecl's hidden sret pointer.
type EntryFn = unsafe extern "C" fn(*mut u8, *const u8) -> ExecResult;

/// The IA-32 backend. The entry thunk pins the guest context in EBP,
/// reserves the slot frame, and calls the block; blocks return the exit
/// value in EDX:EAX and the patch site in ECX.
pub struct I386Backend {
    em: I386Emitter,
    _tramp: TrampPage,
    entry: EntryFn,
    restore: *const u8,
}

// SAFETY: all interior pointers target the exclusively-owned TrampPage.
unsafe impl Send for I386Backend {}

impl I386Backend {
    pub fn new() -> io::Result<Self> {
        let mut buf = CodeBuf::new();

        // Entry thunk. After the two saves the hidden return pointer,
        // guest context, and block address sit at [esp+12..esp+24].
        emit_push(&mut buf, Reg::Rbp);
        emit_push(&mut buf, Reg::Rsi);
        emit_load(&mut buf, false, Reg::Rbp, Reg::Rsp, 16); // guest ctx
        emit_load(&mut buf, false, Reg::Rsi, Reg::Rsp, 12); // sret
        emit_load(&mut buf, false, Reg::Rax, Reg::Rsp, 20); // block start
        emit_arith_ri(&mut buf, ArithOp::Sub, false, Reg::Rsp, FRAME_SIZE);
        emit_call_reg(&mut buf, Reg::Rax);
        emit_arith_ri(&mut buf, ArithOp::Add, false, Reg::Rsp, FRAME_SIZE);
        emit_store(&mut buf, false, Reg::Rax, Reg::Rsi, 0);
        emit_store(&mut buf, false, Reg::Rdx, Reg::Rsi, 4);
        emit_store(&mut buf, false, Reg::Rcx, Reg::Rsi, 8);
        emit_store_imm(&mut buf, Reg::Rsi, 12, 0);
        emit_mov_rr(&mut buf, false, Reg::Rax, Reg::Rsi);
        emit_pop(&mut buf, Reg::Rsi);
        emit_pop(&mut buf, Reg::Rbp);
        // cdecl struct return: the callee pops the hidden pointer.
        emit_ret_imm16(&mut buf, 4);

        while buf.offset() % 16 != 0 {
            buf.emit_u8(0x90);
        }

        // Restore thunk for the signal path: the rewritten context lands
        // here with the block's return registers already staged, so a
        // bare ret resurfaces in the entry thunk as a normal block exit.
        let restore_off = buf.offset();
        emit_ret(&mut buf);

        let tramp = TrampPage::new(buf.as_slice())?;
        // SAFETY: the page starts with the entry thunk emitted above.
        let entry: EntryFn = unsafe { core::mem::transmute(tramp.ptr_at(0)) };
        let restore = tramp.ptr_at(restore_off);
        Ok(Self {
            em: I386Emitter,
            _tramp: tramp,
            entry,
            restore,
        })
    }
}

impl Backend for I386Backend {
    fn jit(&mut self, ir: &IrBuilder, out: &mut CodeBuf) -> usize {
        lower(&mut self.em, ir, out).len
    }

    unsafe fn execute(&self, code: *const u8, ctx: *mut u8) -> ExecResult {
        (self.entry)(ctx, code)
    }

    unsafe fn patch(&self, site: u64, target: u64) {
        let p = site as usize as *mut u8;
        // The dormant jump starts one byte past the ret; fill its rel32
        // first, then retire the ret into a nop.
        let rel = target.wrapping_sub(site + 6) as u32;
        ptr::write_unaligned(p.add(2) as *mut u32, rel);
        ptr::write(p, 0x90);
    }

    fn get_marker(&mut self, ir: &IrBuilder, offset: usize) -> u64 {
        let mut scratch = CodeBuf::new();
        lower(&mut self.em, ir, &mut scratch).marker_at(offset)
    }

    #[allow(unused_variables)]
    unsafe fn request_alternate_exit(&self, uc: *mut libc::c_void, result: ExecResult) {
        #[cfg(target_arch = "x86")]
        {
            let uc = uc as *mut libc::ucontext_t;
            let gregs = &mut (*uc).uc_mcontext.gregs;
            gregs[libc::REG_EAX as usize] = result.value as i32;
            gregs[libc::REG_EDX as usize] = (result.value >> 32) as i32;
            gregs[libc::REG_ECX as usize] = result.patch_site as i32;
            gregs[libc::REG_EIP as usize] = self.restore as i32;
        }
        #[cfg(not(target_arch = "x86"))]
        unreachable!("IA-32 signal re-entry on a foreign host");
    }
}
