use crate::inst::{Inst, RegIdx};
use crate::types::{BinOp, CastKind, Width};

/// Maximum virtual registers per block.
pub const MAX_REGS: usize = 512;
/// Maximum IR instructions per block.
pub const MAX_INSNS: usize = 512;

/// One virtual register in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtReg {
    pub width: Width,
    /// Instruction index of the last reader, `None` if never read.
    /// Maintained as a running maximum while the block is built.
    pub last_read: Option<u32>,
    /// Known compile-time value, set for `MovConst` results. Lets the
    /// backend turn constant-valued exits into patchable direct branches.
    pub const_val: Option<u64>,
}

/// Arena of virtual registers and instructions for one guest block.
///
/// The builder is reused across blocks: `reset` truncates both arenas in
/// O(1) without releasing capacity. The frontend decoder is trusted, so
/// capacity overflow and width mismatches are fatal.
pub struct IrBuilder {
    regs: Vec<VirtReg>,
    insts: Vec<Inst>,
}

impl IrBuilder {
    pub fn new() -> Self {
        Self {
            regs: Vec::with_capacity(MAX_REGS),
            insts: Vec::with_capacity(MAX_INSNS),
        }
    }

    /// Drop all registers and instructions, keeping allocations.
    pub fn reset(&mut self) {
        self.regs.clear();
        self.insts.clear();
    }

    #[inline]
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    #[inline]
    pub fn num_regs(&self) -> usize {
        self.regs.len()
    }

    #[inline]
    pub fn reg(&self, r: RegIdx) -> &VirtReg {
        &self.regs[r.index()]
    }

    #[inline]
    pub fn width_of(&self, r: RegIdx) -> Width {
        self.regs[r.index()].width
    }

    fn new_reg(&mut self, width: Width) -> RegIdx {
        assert!(self.regs.len() < MAX_REGS, "virtual register arena overflow");
        let idx = RegIdx(self.regs.len() as u32);
        self.regs.push(VirtReg {
            width,
            last_read: None,
            const_val: None,
        });
        idx
    }

    fn push(&mut self, inst: Inst) {
        assert!(self.insts.len() < MAX_INSNS, "instruction arena overflow");
        self.insts.push(inst);
    }

    /// Record a read of `r` by the instruction about to be pushed.
    fn read(&mut self, r: RegIdx) {
        let at = self.insts.len() as u32;
        let lr = &mut self.regs[r.index()].last_read;
        match *lr {
            Some(prev) if prev >= at => {}
            _ => *lr = Some(at),
        }
    }

    // -- Emission --

    pub fn gen_mov_const(&mut self, width: Width, value: u64) -> RegIdx {
        let dst = self.new_reg(width);
        let value = value & width.mask();
        self.regs[dst.index()].const_val = Some(value);
        self.push(Inst::MovConst { dst, value });
        dst
    }

    pub fn gen_load(&mut self, width: Width, addr: RegIdx) -> RegIdx {
        self.read(addr);
        let dst = self.new_reg(width);
        self.push(Inst::Load { width, dst, addr });
        dst
    }

    pub fn gen_store(&mut self, width: Width, src: RegIdx, addr: RegIdx) {
        self.read(src);
        self.read(addr);
        self.push(Inst::Store { width, src, addr });
    }

    pub fn gen_binop(&mut self, op: BinOp, a: RegIdx, b: RegIdx) -> RegIdx {
        let width = self.width_of(a);
        assert_eq!(width, self.width_of(b), "binary operand width mismatch");
        self.read(a);
        self.read(b);
        let dst = self.new_reg(width);
        self.push(Inst::BinOp { op, width, dst, a, b });
        dst
    }

    pub fn gen_ite(&mut self, pred: RegIdx, if_true: RegIdx, if_false: RegIdx) -> RegIdx {
        let width = self.width_of(if_true);
        assert_eq!(width, self.width_of(if_false), "select arm width mismatch");
        self.read(pred);
        self.read(if_true);
        self.read(if_false);
        let dst = self.new_reg(width);
        self.push(Inst::Ite { pred, dst, if_true, if_false });
        dst
    }

    pub fn gen_cast(&mut self, kind: CastKind, src: RegIdx) -> RegIdx {
        assert_eq!(kind.from, self.width_of(src), "cast source width mismatch");
        self.read(src);
        let dst = self.new_reg(kind.to);
        self.push(Inst::Cast { kind, dst, src });
        dst
    }

    /// Unconditional block exit with `value` as the next guest PC.
    pub fn gen_exit(&mut self, value: RegIdx) {
        self.read(value);
        self.push(Inst::Exit { value, pred: None });
    }

    /// Exit with `value` when `pred` is nonzero, else fall through.
    pub fn gen_exit_cond(&mut self, value: RegIdx, pred: RegIdx) {
        self.read(value);
        self.read(pred);
        self.push(Inst::Exit { value, pred: Some(pred) });
    }

    /// Convenience: exit to a constant guest PC.
    pub fn gen_exit_const(&mut self, pc: u64) {
        let value = self.gen_mov_const(Width::W64, pc);
        self.gen_exit(value);
    }

    pub fn gen_call(
        &mut self,
        func: u64,
        args: &[RegIdx],
        ret: Option<Width>,
    ) -> Option<RegIdx> {
        assert!(args.len() <= 4, "helper calls take at most four arguments");
        let mut packed = [None; 4];
        for (slot, &a) in packed.iter_mut().zip(args) {
            self.read(a);
            *slot = Some(a);
        }
        let dst = ret.map(|w| (w, self.new_reg(w)));
        self.push(Inst::Call { func, args: packed, dst });
        dst.map(|(_, r)| r)
    }

    pub fn gen_read_ctx(&mut self, width: Width, offset: i32) -> RegIdx {
        let dst = self.new_reg(width);
        self.push(Inst::ReadCtx { width, dst, offset });
        dst
    }

    pub fn gen_write_ctx(&mut self, width: Width, src: RegIdx, offset: i32) {
        self.read(src);
        self.push(Inst::WriteCtx { width, src, offset });
    }

    pub fn gen_marker(&mut self, value: u64) {
        self.push(Inst::Marker { value });
    }
}

impl Default for IrBuilder {
    fn default() -> Self {
        Self::new()
    }
}
