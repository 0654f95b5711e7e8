use dbt_backend::{Backend, CodeBuf};
use dbt_cache::TranslationCache;
use dbt_ir::IrBuilder;

/// Exit values with this bit set are trap states, not guest addresses;
/// the loop surfaces them to the caller instead of dispatching on them.
pub const TRAP_TAG: u64 = 1 << 63;

/// Produces the IR for one guest block. The decoder is the frontend's
/// side of the boundary; the loop never looks at guest bytes itself.
pub trait GuestDecoder {
    /// Decode up to `max_insns` guest instructions starting at `pc`
    /// into `ir`, ending with an exit.
    fn decode(&mut self, ir: &mut IrBuilder, pc: u64, max_insns: usize);
}

/// Per-guest-thread dispatch loop. Owns its builder, backend and cache
/// outright; nothing here is shared.
pub struct Dispatcher<B, D> {
    backend: B,
    cache: TranslationCache,
    decoder: D,
    builder: IrBuilder,
    buf: CodeBuf,
    max_insns: usize,
}

impl<B: Backend, D: GuestDecoder> Dispatcher<B, D> {
    pub fn new(backend: B, cache: TranslationCache, decoder: D, max_insns: usize) -> Self {
        Self {
            backend,
            cache,
            decoder,
            builder: IrBuilder::new(),
            buf: CodeBuf::new(),
            max_insns,
        }
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Run the guest from `entry` until a block exits with a trap
    /// state, which is returned tag and all.
    ///
    /// # Safety
    /// `ctx` must point at the guest context structure the decoder's
    /// IR reads and writes, and every guest address reachable from it
    /// must be valid host memory for the translated loads and stores.
    pub unsafe fn run(&mut self, entry: u64, ctx: *mut u8) -> u64 {
        let mut pc = entry;
        // Patch site left by the previous block's constant exit, still
        // waiting for its successor's address.
        let mut pending: Option<u64> = None;

        loop {
            if pc & TRAP_TAG != 0 {
                return pc;
            }

            let code = match self.cache.lookup(pc) {
                Some(code) => code,
                None => {
                    self.builder.reset();
                    self.buf.clear();
                    self.decoder.decode(&mut self.builder, pc, self.max_insns);
                    self.backend.jit(&self.builder, &mut self.buf);
                    let (code, cleared) = self.cache.append(pc, self.buf.as_slice());
                    if cleared {
                        // The site belonged to a block that no longer
                        // exists.
                        pending = None;
                    }
                    code
                }
            };

            if let Some(site) = pending.take() {
                // Forward-only chaining: never rewrite code at or behind
                // the successor, so the bytes being patched cannot be
                // the bytes being executed.
                if code as u64 > site {
                    unsafe { self.backend.patch(site, code as u64) };
                }
            }

            let result = unsafe { self.backend.execute(code, ctx) };
            pending = (result.patch_site != 0).then_some(result.patch_site);
            pc = result.value;
        }
    }
}
