//! Translation cache: guest pc to translated-block mapping over a
//! bump-allocated executable pool.
//!
//! Eviction is clear-everything: when a block does not fit, the whole
//! pool is dropped and translation starts over. Simple, and it makes
//! the staleness contract easy to state: after a clear, every pointer
//! and patch site previously handed out is dead.

mod pool;

pub use pool::ExecPool;

use std::collections::HashMap;
use std::io;

use thiserror::Error;

/// Scratch area for the disabled cache, big enough for one block.
const SCRATCH_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("code pool allocation failed: {0}")]
    Pool(#[from] io::Error),
}

struct Entry {
    pc: u64,
    start: usize,
    len: usize,
}

/// Per-guest-thread translation cache. Not shared; the dispatch loop
/// owns it outright.
pub struct TranslationCache {
    pool: ExecPool,
    entries: Vec<Entry>,
    index: HashMap<u64, usize>,
    enabled: bool,
}

impl TranslationCache {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        Ok(Self {
            pool: ExecPool::new(capacity)?,
            entries: Vec::new(),
            index: HashMap::new(),
            enabled: true,
        })
    }

    /// A cache that never retains anything: every lookup misses and
    /// every append overwrites a scratch area. Execution still works,
    /// just without reuse or chaining.
    pub fn disabled() -> Result<Self, CacheError> {
        Ok(Self {
            pool: ExecPool::new(SCRATCH_SIZE)?,
            entries: Vec::new(),
            index: HashMap::new(),
            enabled: false,
        })
    }

    /// Translated block for `pc`, if still cached.
    pub fn lookup(&self, pc: u64) -> Option<*const u8> {
        let &i = self.index.get(&pc)?;
        Some(self.pool.ptr_at(self.entries[i].start))
    }

    /// Install a freshly translated block. Returns its executable
    /// address and whether the whole cache was cleared to make room;
    /// on a clear the caller must drop every stale pointer it holds.
    pub fn append(&mut self, pc: u64, code: &[u8]) -> (*const u8, bool) {
        assert!(
            code.len() <= self.pool.capacity(),
            "translated block larger than the code pool"
        );
        if !self.enabled {
            self.pool.reset();
            return (self.pool.write(code), true);
        }
        let mut cleared = false;
        if code.len() > self.pool.remaining() {
            self.clear();
            cleared = true;
        }
        let start = self.pool.offset();
        let ptr = self.pool.write(code);
        self.index.insert(pc, self.entries.len());
        self.entries.push(Entry {
            pc,
            start,
            len: code.len(),
        });
        (ptr, cleared)
    }

    /// Drop every cached block.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.pool.reset();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reverse lookup for the signal path: which cached block contains
    /// the host address, and where does it start.
    pub fn lookup_pc(&self, host_addr: *const u8) -> Option<(u64, *const u8)> {
        let addr = host_addr as usize;
        let base = self.pool.base_ptr() as usize;
        if addr < base || addr >= base + self.pool.offset() {
            return None;
        }
        let rel = addr - base;
        self.entries
            .iter()
            .rev()
            .find(|e| rel >= e.start && rel < e.start + e.len)
            .map(|e| (e.pc, self.pool.ptr_at(e.start)))
    }
}
