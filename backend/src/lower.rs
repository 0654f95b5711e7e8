//! Generic lowering: linear-scan register allocation over the IR's
//! last-use liveness, driving a host-specific instruction emitter.
//!
//! The pass is deterministic: the same IR always produces the same
//! allocation and the same bytes, which is what makes marker recovery
//! a pure re-run.

use dbt_ir::{Inst, IrBuilder, RegIdx, Width};

use crate::code_buf::CodeBuf;
use crate::regset::RegSet;

/// A physical register number, or the first slot of a pair on hosts
/// where one value spans two slots.
pub type PReg = u8;

/// Exit value as seen by the emitter.
#[derive(Debug, Clone, Copy)]
pub enum ExitVal {
    Reg(Width, PReg),
    /// Compile-time-constant exit: gets a patchable direct-branch stub.
    Const(u64),
}

/// Everything the lowering pass needs from a host target.
///
/// Emitters are width-generic: the pass hands each operation its guest
/// width and the emitter picks operand sizes and masking.
pub trait HostEmitter {
    /// Bits in one host register or slot.
    const HOST_BITS: u32;

    /// Allocatable register/slot pool.
    fn pool(&self) -> RegSet;

    /// Slots one value of width `w` occupies (pairs on 32-bit hosts).
    fn slots(w: Width) -> u32;

    fn mov_const(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, value: u64);
    fn load(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, addr: PReg);
    fn store(&mut self, buf: &mut CodeBuf, w: Width, src: PReg, addr: PReg);
    fn binop(&mut self, buf: &mut CodeBuf, op: dbt_ir::BinOp, w: Width, dst: PReg, a: PReg, b: PReg);
    fn ite(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, pred: PReg, pred_w: Width, t: PReg, f: PReg);
    fn cast(&mut self, buf: &mut CodeBuf, kind: dbt_ir::CastKind, dst: PReg, src: PReg);
    fn read_ctx(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, offset: i32);
    fn write_ctx(&mut self, buf: &mut CodeBuf, w: Width, src: PReg, offset: i32);
    /// Emit a (possibly conditional) block exit. Returns the code offset
    /// of the patchable stub for constant-valued exits.
    fn exit(
        &mut self,
        buf: &mut CodeBuf,
        value: ExitVal,
        pred: Option<(PReg, Width)>,
    ) -> Option<usize>;
    /// Emit a helper call. `live` is the set of pool registers holding
    /// values that must survive the call (the destination is excluded).
    fn call(
        &mut self,
        buf: &mut CodeBuf,
        func: u64,
        args: &[(Width, PReg)],
        ret: Option<(Width, PReg)>,
        live: RegSet,
    );
}

/// Side products of lowering one block.
pub struct BlockInfo {
    /// Bytes emitted.
    pub len: usize,
    /// (code offset, marker value) pairs in emission order.
    pub markers: Vec<(usize, u64)>,
    /// Code offsets of patchable exit stubs.
    pub patch_stubs: Vec<usize>,
}

impl BlockInfo {
    /// Value of the most recent marker at or before `offset`.
    /// Panics when `offset` precedes the first marker; the signal layer
    /// only asks about code past a guest instruction boundary.
    pub fn marker_at(&self, offset: usize) -> u64 {
        self.markers
            .iter()
            .take_while(|&&(at, _)| at <= offset)
            .last()
            .map(|&(_, v)| v)
            .expect("code offset precedes the first marker")
    }
}

struct AllocState<'a> {
    ir: &'a IrBuilder,
    /// Pool slot memoized per virtual register.
    assigned: Vec<Option<PReg>>,
    free: RegSet,
}

impl<'a> AllocState<'a> {
    fn new(ir: &'a IrBuilder, pool: RegSet) -> Self {
        Self {
            ir,
            assigned: vec![None; ir.num_regs()],
            free: pool,
        }
    }

    /// Allocate the lowest free slot (or even-aligned slot pair) for the
    /// definition of `r`.
    fn def<E: HostEmitter>(&mut self, r: RegIdx) -> PReg {
        let slots = E::slots(self.ir.width_of(r));
        let p = if slots == 1 {
            self.free.first().expect("register pool exhausted")
        } else {
            (0..31)
                .step_by(2)
                .find(|&p| self.free.contains(p) && self.free.contains(p + 1))
                .expect("register pool exhausted")
        };
        for s in 0..slots as u8 {
            self.free = self.free.clear(p + s);
        }
        self.assigned[r.index()] = Some(p);
        p
    }

    /// Physical slot of an operand that must already be defined.
    fn use_of(&self, r: RegIdx) -> PReg {
        self.assigned[r.index()].expect("operand read before definition")
    }

    /// Return `r`'s slot(s) to the pool.
    fn release<E: HostEmitter>(&mut self, r: RegIdx) {
        if let Some(p) = self.assigned[r.index()] {
            for s in 0..E::slots(self.ir.width_of(r)) as u8 {
                self.free = self.free.set(p + s);
            }
        }
    }

    /// Pool slots currently holding live values.
    fn live(&self, pool: RegSet) -> RegSet {
        pool.subtract(self.free)
    }
}

/// Operands read by one instruction, for post-emission liveness release.
fn reads(inst: &Inst) -> [Option<RegIdx>; 4] {
    match *inst {
        Inst::MovConst { .. } | Inst::ReadCtx { .. } | Inst::Marker { .. } => [None; 4],
        Inst::Load { addr, .. } => [Some(addr), None, None, None],
        Inst::Store { src, addr, .. } => [Some(src), Some(addr), None, None],
        Inst::BinOp { a, b, .. } => [Some(a), Some(b), None, None],
        Inst::Ite { pred, if_true, if_false, .. } => {
            [Some(pred), Some(if_true), Some(if_false), None]
        }
        Inst::Cast { src, .. } => [Some(src), None, None, None],
        Inst::Exit { value, pred } => [Some(value), pred, None, None],
        Inst::Call { args, .. } => args,
        Inst::WriteCtx { src, .. } => [Some(src), None, None, None],
    }
}

/// Lower one block: allocate registers and emit host code into `buf`.
pub fn lower<E: HostEmitter>(em: &mut E, ir: &IrBuilder, buf: &mut CodeBuf) -> BlockInfo {
    let pool = em.pool();
    let mut st = AllocState::new(ir, pool);
    let mut info = BlockInfo {
        len: 0,
        markers: Vec::new(),
        patch_stubs: Vec::new(),
    };
    let base = buf.offset();

    for (i, inst) in ir.insts().iter().enumerate() {
        match *inst {
            Inst::MovConst { dst, value } => {
                let w = ir.width_of(dst);
                let d = st.def::<E>(dst);
                em.mov_const(buf, w, d, value);
            }
            Inst::Load { width, dst, addr } => {
                let a = st.use_of(addr);
                let d = st.def::<E>(dst);
                em.load(buf, width, d, a);
            }
            Inst::Store { width, src, addr } => {
                em.store(buf, width, st.use_of(src), st.use_of(addr));
            }
            Inst::BinOp { op, width, dst, a, b } => {
                let pa = st.use_of(a);
                let pb = st.use_of(b);
                let d = st.def::<E>(dst);
                em.binop(buf, op, width, d, pa, pb);
            }
            Inst::Ite { pred, dst, if_true, if_false } => {
                let w = ir.width_of(dst);
                let pw = ir.width_of(pred);
                let pp = st.use_of(pred);
                let pt = st.use_of(if_true);
                let pf = st.use_of(if_false);
                let d = st.def::<E>(dst);
                em.ite(buf, w, d, pp, pw, pt, pf);
            }
            Inst::Cast { kind, dst, src } => {
                let s = st.use_of(src);
                let d = st.def::<E>(dst);
                em.cast(buf, kind, d, s);
            }
            Inst::Exit { value, pred } => {
                let val = match ir.reg(value).const_val {
                    Some(v) => ExitVal::Const(v),
                    None => ExitVal::Reg(ir.width_of(value), st.use_of(value)),
                };
                let pred = pred.map(|p| (st.use_of(p), ir.width_of(p)));
                if let Some(stub) = em.exit(buf, val, pred) {
                    info.patch_stubs.push(stub - base);
                }
            }
            Inst::Call { func, args, dst } => {
                let mut argv: Vec<(Width, PReg)> = Vec::with_capacity(4);
                for a in args.into_iter().flatten() {
                    argv.push((ir.width_of(a), st.use_of(a)));
                }
                let ret = dst.map(|(w, r)| (w, st.def::<E>(r)));
                let live = {
                    let mut l = st.live(pool);
                    if let Some((w, p)) = ret {
                        for s in 0..E::slots(w) as u8 {
                            l = l.clear(p + s);
                        }
                    }
                    l
                };
                em.call(buf, func, &argv, ret, live);
            }
            Inst::ReadCtx { width, dst, offset } => {
                let d = st.def::<E>(dst);
                em.read_ctx(buf, width, d, offset);
            }
            Inst::WriteCtx { width, src, offset } => {
                em.write_ctx(buf, width, st.use_of(src), offset);
            }
            Inst::Marker { value } => {
                info.markers.push((buf.offset() - base, value));
            }
        }

        // Free operands whose last read was this instruction, then free
        // dead definitions so they never occupy the pool.
        for r in reads(inst).into_iter().flatten() {
            if ir.reg(r).last_read == Some(i as u32) {
                st.release::<E>(r);
            }
        }
        if let Some(d) = def_of(inst) {
            if ir.reg(d).last_read.is_none() {
                st.release::<E>(d);
            }
        }
    }

    info.len = buf.offset() - base;
    info
}

fn def_of(inst: &Inst) -> Option<RegIdx> {
    match *inst {
        Inst::MovConst { dst, .. }
        | Inst::Load { dst, .. }
        | Inst::BinOp { dst, .. }
        | Inst::Ite { dst, .. }
        | Inst::Cast { dst, .. }
        | Inst::ReadCtx { dst, .. } => Some(dst),
        Inst::Call { dst, .. } => dst.map(|(_, r)| r),
        _ => None,
    }
}
