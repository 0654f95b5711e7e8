/// Operand width of a virtual register or a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    /// All-ones pattern of this width, zero-extended to 64 bits.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }
}

/// Two-operand integer operations.
///
/// Arithmetic wraps modulo 2^width. Shift counts are taken modulo the
/// host register width by the hardware; `Asr` by the full guest width
/// still produces the sign fill (the backend widens sub-native operands
/// before shifting). `CmpEq`/`CmpNe` produce the all-ones pattern of the
/// operand width when the condition holds, zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Xor,
    And,
    Or,
    Shl,
    Shr,
    Asr,
    Ror,
    CmpEq,
    CmpNe,
}

impl BinOp {
    #[inline]
    pub const fn is_compare(self) -> bool {
        matches!(self, BinOp::CmpEq | BinOp::CmpNe)
    }

    #[inline]
    pub const fn is_shift(self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr | BinOp::Asr | BinOp::Ror)
    }
}

/// A width conversion between virtual registers.
///
/// Widening conversions zero- or sign-extend depending on `signed`;
/// narrowing conversions truncate and ignore `signed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastKind {
    pub from: Width,
    pub to: Width,
    pub signed: bool,
}

impl CastKind {
    #[inline]
    pub const fn is_widen(self) -> bool {
        self.from.bits() < self.to.bits()
    }

    #[inline]
    pub const fn is_narrow(self) -> bool {
        self.from.bits() > self.to.bits()
    }
}
