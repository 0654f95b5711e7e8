//! Dispatch-loop tests with a scripted two-block guest program.

use dbt_backend::X86_64Backend;
use dbt_cache::TranslationCache;
use dbt_exec::{Dispatcher, GuestDecoder, TRAP_TAG};
use dbt_ir::{BinOp, IrBuilder, Width};

#[repr(C)]
struct GuestCtx {
    regs: [u64; 8],
}

const DONE: u64 = TRAP_TAG | 0x42;

/// Two-block program: 0x1000 increments regs[0] and jumps to 0x2000,
/// which loops back until regs[0] reaches three, then traps out.
struct LoopDecoder {
    translations: usize,
}

impl GuestDecoder for LoopDecoder {
    fn decode(&mut self, ir: &mut IrBuilder, pc: u64, _max_insns: usize) {
        self.translations += 1;
        match pc {
            0x1000 => {
                let r = ir.gen_read_ctx(Width::W64, 0);
                let one = ir.gen_mov_const(Width::W64, 1);
                let sum = ir.gen_binop(BinOp::Add, r, one);
                ir.gen_write_ctx(Width::W64, sum, 0);
                ir.gen_exit_const(0x2000);
            }
            0x2000 => {
                let r = ir.gen_read_ctx(Width::W64, 0);
                let three = ir.gen_mov_const(Width::W64, 3);
                let eq = ir.gen_binop(BinOp::CmpEq, r, three);
                let done = ir.gen_mov_const(Width::W64, DONE);
                let back = ir.gen_mov_const(Width::W64, 0x1000);
                let next = ir.gen_ite(eq, done, back);
                ir.gen_exit(next);
            }
            _ => panic!("unexpected guest pc {pc:#x}"),
        }
    }
}

struct RefuseDecoder;

impl GuestDecoder for RefuseDecoder {
    fn decode(&mut self, _ir: &mut IrBuilder, pc: u64, _max_insns: usize) {
        panic!("decoder reached for trap-tagged pc {pc:#x}");
    }
}

#[test]
fn counts_to_three_through_the_cache() {
    let backend = X86_64Backend::new().unwrap();
    let cache = TranslationCache::new(1 << 20).unwrap();
    let mut disp = Dispatcher::new(backend, cache, LoopDecoder { translations: 0 }, 16);

    let mut ctx = GuestCtx { regs: [0; 8] };
    let ret = unsafe { disp.run(0x1000, &mut ctx as *mut GuestCtx as *mut u8) };

    assert_eq!(ret, DONE);
    assert_eq!(ctx.regs[0], 3);
    // Each block is translated exactly once; later visits hit the cache
    // or the patched chain.
    assert_eq!(disp.decoder().translations, 2);
    assert_eq!(disp.cache().len(), 2);
}

#[test]
fn trap_tagged_entry_short_circuits() {
    let backend = X86_64Backend::new().unwrap();
    let cache = TranslationCache::new(1 << 16).unwrap();
    let mut disp = Dispatcher::new(backend, cache, RefuseDecoder, 16);

    let mut ctx = GuestCtx { regs: [0; 8] };
    let ret = unsafe { disp.run(TRAP_TAG | 7, &mut ctx as *mut GuestCtx as *mut u8) };
    assert_eq!(ret, TRAP_TAG | 7);
}

#[test]
fn disabled_cache_retranslates_every_block() {
    let backend = X86_64Backend::new().unwrap();
    let cache = TranslationCache::disabled().unwrap();
    let mut disp = Dispatcher::new(backend, cache, LoopDecoder { translations: 0 }, 16);

    let mut ctx = GuestCtx { regs: [0; 8] };
    let ret = unsafe { disp.run(0x1000, &mut ctx as *mut GuestCtx as *mut u8) };

    assert_eq!(ret, DONE);
    assert_eq!(ctx.regs[0], 3);
    // Six block executions, six translations: nothing was retained, and
    // every append invalidated any pending patch site.
    assert_eq!(disp.decoder().translations, 6);
    assert!(disp.cache().is_empty());
}
