//! Host backends: register allocation and machine-code emission.
//!
//! One generic lowering pass ([`lower`]) walks the IR and drives a
//! [`HostEmitter`], which encodes the actual host instructions. The
//! x86-64 emitter works on real registers; the i386 emitter works on
//! stack slots and goes through helper calls for 64-bit shifts.

pub mod code_buf;
pub mod encode;
pub mod helpers;
pub mod i386;
pub mod lower;
pub mod regset;
mod tramp;
pub mod x86_64;

pub use code_buf::CodeBuf;
pub use i386::I386Backend;
pub use lower::{lower, BlockInfo, ExitVal, HostEmitter, PReg};
pub use regset::RegSet;
pub use x86_64::X86_64Backend;

use dbt_ir::IrBuilder;

/// What one translated block hands back to the dispatcher.
///
/// Returned in the two ABI return registers (RAX:RDX on x86-64).
/// `patch_site` is the host address of the exit's patchable stub, or 0
/// when the exit value was not a compile-time constant.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub value: u64,
    pub patch_site: u64,
}

/// A host code generator plus its execution and patching machinery.
pub trait Backend {
    /// Lower `ir` into `out`, returning the number of bytes written.
    fn jit(&mut self, ir: &IrBuilder, out: &mut CodeBuf) -> usize;

    /// Run a translated block against the guest context.
    ///
    /// # Safety
    /// `code` must point at a complete block produced by `jit` and placed
    /// in executable memory; `ctx` must be the guest context the block's
    /// context accesses were generated for.
    unsafe fn execute(&self, code: *const u8, ctx: *mut u8) -> ExecResult;

    /// Redirect the patchable stub at `site` to jump straight to `target`.
    ///
    /// # Safety
    /// `site` must be a patch site reported by `execute`, and `target`
    /// a block start in the same (still live) code pool. The dispatcher
    /// only patches forward, so the bytes being rewritten are never
    /// concurrently executed.
    unsafe fn patch(&self, site: u64, target: u64);

    /// Recover the marker value governing code offset `offset` by
    /// re-running the deterministic lowering of `ir`. Pure; idempotent.
    fn get_marker(&mut self, ir: &IrBuilder, offset: usize) -> u64;

    /// Rewrite a saved signal context so that sigreturn abandons the
    /// interrupted block and resurfaces in the dispatcher with `result`,
    /// exactly as if the block had returned it.
    ///
    /// # Safety
    /// `uc` must point at the `ucontext_t` of a signal delivered while
    /// host code generated by this backend was executing at a guest
    /// instruction boundary.
    unsafe fn request_alternate_exit(&self, uc: *mut libc::c_void, result: ExecResult);
}
