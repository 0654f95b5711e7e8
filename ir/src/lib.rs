//! Machine-independent IR for the binary translator.
//!
//! A guest frontend decodes one basic block of guest instructions into a
//! flat array of [`Inst`] over width-typed virtual registers, then hands
//! the array to a host backend for register allocation and code emission.
//! Virtual registers are single-assignment and block-local.

pub mod builder;
pub mod inst;
pub mod types;

pub use builder::{IrBuilder, VirtReg, MAX_INSNS, MAX_REGS};
pub use inst::{Inst, RegIdx};
pub use types::{BinOp, CastKind, Width};
