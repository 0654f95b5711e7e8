use crate::types::{BinOp, CastKind, Width};

/// Index of a virtual register in the builder's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegIdx(pub u32);

impl RegIdx {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One IR instruction.
///
/// All register-producing instructions define a fresh virtual register;
/// nothing is ever redefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    /// dst = value (value already masked to dst's width).
    MovConst { dst: RegIdx, value: u64 },
    /// dst = *(addr), zero-extended from `width`. The address register
    /// holds a host pointer.
    Load { width: Width, dst: RegIdx, addr: RegIdx },
    /// *(addr) = low `width` bits of src.
    Store { width: Width, src: RegIdx, addr: RegIdx },
    /// dst = a <op> b, all three of width `width`.
    BinOp { op: BinOp, width: Width, dst: RegIdx, a: RegIdx, b: RegIdx },
    /// dst = pred != 0 ? if_true : if_false.
    Ite { pred: RegIdx, dst: RegIdx, if_true: RegIdx, if_false: RegIdx },
    /// dst = convert(src) per `kind`.
    Cast { kind: CastKind, dst: RegIdx, src: RegIdx },
    /// Leave the block with `value` as the next guest PC (or an encoded
    /// trap state). With a predicate: exit only when pred is nonzero,
    /// otherwise fall through.
    Exit { value: RegIdx, pred: Option<RegIdx> },
    /// Call a host helper at absolute address `func` with up to four
    /// integer arguments; the result, if any, lands in a fresh register.
    Call {
        func: u64,
        args: [Option<RegIdx>; 4],
        dst: Option<(Width, RegIdx)>,
    },
    /// dst = `width`-sized field of the guest context at byte `offset`,
    /// zero-extended.
    ReadCtx { width: Width, dst: RegIdx, offset: i32 },
    /// Guest context field at byte `offset` = low `width` bits of src.
    WriteCtx { width: Width, src: RegIdx, offset: i32 },
    /// Instruction-boundary marker. Emits no code; records the current
    /// code offset against `value` for the signal recovery path.
    Marker { value: u64 },
}
