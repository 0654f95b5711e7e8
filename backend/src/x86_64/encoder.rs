//! IR-to-x86-64 instruction selection.
//!
//! Invariant: every allocated register holds its value zero-extended to
//! 64 bits. Sub-native operations therefore run at 32-bit operand size
//! (which clears the upper half for free) and re-mask where a carry or
//! shift can escape the guest width.

use dbt_ir::{BinOp, CastKind, Width};

use crate::code_buf::CodeBuf;
use crate::encode::{
    emit_arith_ri, emit_arith_rr, emit_call_reg, emit_cmovcc, emit_jcc_short, emit_jmp_rip_ind,
    emit_lea_rip, emit_load, emit_load_ext, emit_mov_ri, emit_mov_rr, emit_pop, emit_push,
    emit_ret, emit_shift_cl, emit_shift_ri, emit_store, emit_store_byte, emit_store_word,
    emit_test_rr, patch_short, ArithOp, Reg, ShiftOp, X86Cond, OPC_MOVZBL, OPC_MOVZWL,
    OPC_SHIFTB_cl, OPC_SHIFT_cl, P_DATA16, P_REXW,
};
use crate::lower::{ExitVal, HostEmitter, PReg};
use crate::regset::RegSet;

/// Guest context pointer, pinned for the whole block.
pub const CTX_REG: Reg = Reg::Rbp;
/// Variable shift counts must live in CL, so RCX stays out of the pool.
pub const SHIFT_REG: Reg = Reg::Rcx;
/// Scratch for indirect helper-call targets.
pub const CALL_TMP: Reg = Reg::R11;
/// System V integer argument registers, in order.
pub const CALL_ARG_REGS: [Reg; 4] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx];

/// Eight allocatable registers. RSP/RBP/RCX/R11 are reserved.
pub const ALLOC_POOL: RegSet = RegSet::EMPTY
    .set(Reg::Rax as u8)
    .set(Reg::Rdx as u8)
    .set(Reg::Rbx as u8)
    .set(Reg::Rsi as u8)
    .set(Reg::Rdi as u8)
    .set(Reg::R8 as u8)
    .set(Reg::R9 as u8)
    .set(Reg::R10 as u8);

/// Pool registers the System V ABI lets a callee clobber.
pub const CALLER_SAVED: RegSet = ALLOC_POOL.clear(Reg::Rbx as u8);

#[inline]
fn reg(p: PReg) -> Reg {
    Reg::from_u8(p)
}

/// Re-establish the zero-extension invariant on `r` for width `w`.
fn mask_low(buf: &mut CodeBuf, w: Width, r: Reg) {
    match w {
        Width::W64 => {}
        // A 32-bit mov clears bits 32..64.
        Width::W32 => emit_mov_rr(buf, false, r, r),
        Width::W16 | Width::W8 => {
            emit_arith_ri(buf, ArithOp::And, false, r, w.mask() as i32)
        }
    }
}

pub struct X86_64Emitter;

impl HostEmitter for X86_64Emitter {
    const HOST_BITS: u32 = 64;

    fn pool(&self) -> RegSet {
        ALLOC_POOL
    }

    fn slots(_w: Width) -> u32 {
        1
    }

    fn mov_const(&mut self, buf: &mut CodeBuf, _w: Width, dst: PReg, value: u64) {
        emit_mov_ri(buf, true, reg(dst), value);
    }

    fn load(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, addr: PReg) {
        let (d, a) = (reg(dst), reg(addr));
        match w {
            Width::W8 => emit_load_ext(buf, OPC_MOVZBL, d, a, 0),
            Width::W16 => emit_load_ext(buf, OPC_MOVZWL, d, a, 0),
            Width::W32 => emit_load(buf, false, d, a, 0),
            Width::W64 => emit_load(buf, true, d, a, 0),
        }
    }

    fn store(&mut self, buf: &mut CodeBuf, w: Width, src: PReg, addr: PReg) {
        let (s, a) = (reg(src), reg(addr));
        match w {
            Width::W8 => emit_store_byte(buf, s, a, 0),
            Width::W16 => emit_store_word(buf, s, a, 0),
            Width::W32 => emit_store(buf, false, s, a, 0),
            Width::W64 => emit_store(buf, true, s, a, 0),
        }
    }

    fn binop(&mut self, buf: &mut CodeBuf, op: BinOp, w: Width, dst: PReg, a: PReg, b: PReg) {
        let (d, a, b) = (reg(dst), reg(a), reg(b));
        let rexw = w == Width::W64;
        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let arith = match op {
                    BinOp::Add => ArithOp::Add,
                    BinOp::Sub => ArithOp::Sub,
                    BinOp::And => ArithOp::And,
                    BinOp::Or => ArithOp::Or,
                    BinOp::Xor => ArithOp::Xor,
                    _ => unreachable!(),
                };
                emit_mov_rr(buf, true, d, a);
                emit_arith_rr(buf, arith, rexw, d, b);
                // add/sub can carry past a sub-32-bit width
                if matches!(op, BinOp::Add | BinOp::Sub)
                    && matches!(w, Width::W8 | Width::W16)
                {
                    emit_arith_ri(buf, ArithOp::And, false, d, w.mask() as i32);
                }
            }
            BinOp::Shl => {
                emit_mov_rr(buf, true, d, a);
                emit_mov_rr(buf, true, SHIFT_REG, b);
                emit_shift_cl(buf, OPC_SHIFT_cl | P_REXW, ShiftOp::Shl, d);
                mask_low(buf, w, d);
            }
            BinOp::Shr => {
                // operand is zero-extended, so the result needs no mask
                emit_mov_rr(buf, true, d, a);
                emit_mov_rr(buf, true, SHIFT_REG, b);
                emit_shift_cl(buf, OPC_SHIFT_cl | P_REXW, ShiftOp::Shr, d);
            }
            BinOp::Asr => {
                // Widen the sign to the full host register first; a
                // shift by the guest width then still fills with sign
                // bits instead of being eaten by the hardware count mask.
                emit_mov_rr(buf, true, d, a);
                if w != Width::W64 {
                    let k = (64 - w.bits()) as u8;
                    emit_shift_ri(buf, ShiftOp::Shl, true, d, k);
                    emit_shift_ri(buf, ShiftOp::Sar, true, d, k);
                }
                emit_mov_rr(buf, true, SHIFT_REG, b);
                emit_shift_cl(buf, OPC_SHIFT_cl | P_REXW, ShiftOp::Sar, d);
                mask_low(buf, w, d);
            }
            BinOp::Ror => {
                // Width-sized rotate; the untouched upper bits stay zero.
                emit_mov_rr(buf, true, d, a);
                emit_mov_rr(buf, true, SHIFT_REG, b);
                let opc = match w {
                    Width::W8 => OPC_SHIFTB_cl,
                    Width::W16 => OPC_SHIFT_cl | P_DATA16,
                    Width::W32 => OPC_SHIFT_cl,
                    Width::W64 => OPC_SHIFT_cl | P_REXW,
                };
                emit_shift_cl(buf, opc, ShiftOp::Ror, d);
            }
            BinOp::CmpEq | BinOp::CmpNe => {
                // Materialize the true pattern, then conditionally
                // overwrite with zero over a short forward hop.
                emit_mov_ri(buf, true, d, w.mask());
                emit_arith_rr(buf, ArithOp::Cmp, rexw, a, b);
                let cond = if op == BinOp::CmpEq { X86Cond::Je } else { X86Cond::Jne };
                let skip = emit_jcc_short(buf, cond);
                emit_mov_ri(buf, true, d, 0);
                patch_short(buf, skip);
            }
        }
    }

    fn ite(
        &mut self,
        buf: &mut CodeBuf,
        _w: Width,
        dst: PReg,
        pred: PReg,
        _pred_w: Width,
        t: PReg,
        f: PReg,
    ) {
        let (d, p) = (reg(dst), reg(pred));
        emit_mov_rr(buf, true, d, reg(t));
        emit_test_rr(buf, true, p, p);
        emit_cmovcc(buf, X86Cond::Je, true, d, reg(f));
    }

    fn cast(&mut self, buf: &mut CodeBuf, kind: CastKind, dst: PReg, src: PReg) {
        let (d, s) = (reg(dst), reg(src));
        emit_mov_rr(buf, true, d, s);
        if kind.is_widen() && kind.signed {
            let k = (64 - kind.from.bits()) as u8;
            emit_shift_ri(buf, ShiftOp::Shl, true, d, k);
            emit_shift_ri(buf, ShiftOp::Sar, true, d, k);
            mask_low(buf, kind.to, d);
        } else if kind.is_narrow() {
            mask_low(buf, kind.to, d);
        }
        // unsigned widen: already zero-extended past `from`
    }

    fn read_ctx(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, offset: i32) {
        let d = reg(dst);
        match w {
            Width::W8 => emit_load_ext(buf, OPC_MOVZBL, d, CTX_REG, offset),
            Width::W16 => emit_load_ext(buf, OPC_MOVZWL, d, CTX_REG, offset),
            Width::W32 => emit_load(buf, false, d, CTX_REG, offset),
            Width::W64 => emit_load(buf, true, d, CTX_REG, offset),
        }
    }

    fn write_ctx(&mut self, buf: &mut CodeBuf, w: Width, src: PReg, offset: i32) {
        let s = reg(src);
        match w {
            Width::W8 => emit_store_byte(buf, s, CTX_REG, offset),
            Width::W16 => emit_store_word(buf, s, CTX_REG, offset),
            Width::W32 => emit_store(buf, false, s, CTX_REG, offset),
            Width::W64 => emit_store(buf, true, s, CTX_REG, offset),
        }
    }

    fn exit(
        &mut self,
        buf: &mut CodeBuf,
        value: ExitVal,
        pred: Option<(PReg, Width)>,
    ) -> Option<usize> {
        let skip = pred.map(|(p, _)| {
            let p = reg(p);
            emit_test_rr(buf, true, p, p);
            emit_jcc_short(buf, X86Cond::Je)
        });
        let stub = match value {
            ExitVal::Reg(_, v) => {
                let v = reg(v);
                if v != Reg::Rax {
                    emit_mov_rr(buf, true, Reg::Rax, v);
                }
                emit_mov_ri(buf, true, Reg::Rdx, 0);
                emit_ret(buf);
                None
            }
            ExitVal::Const(pc) => {
                emit_mov_ri(buf, true, Reg::Rax, pc);
                // RDX = address of the return below, which doubles as
                // the patch site.
                emit_lea_rip(buf, Reg::Rdx, 0);
                let site = buf.offset();
                emit_ret(buf);
                // Dormant until patching turns the ret into a nop, after
                // which control falls into this indirect jump.
                emit_jmp_rip_ind(buf);
                buf.emit_u64(0); // target slot
                Some(site)
            }
        };
        if let Some(at) = skip {
            patch_short(buf, at);
        }
        stub
    }

    fn call(
        &mut self,
        buf: &mut CodeBuf,
        func: u64,
        args: &[(Width, PReg)],
        ret: Option<(Width, PReg)>,
        live: RegSet,
    ) {
        let saved: Vec<Reg> = CALLER_SAVED.intersect(live).iter().map(Reg::from_u8).collect();
        for &s in &saved {
            emit_push(buf, s);
        }
        // keep RSP 16-byte aligned at the call
        let pad = saved.len() % 2 == 1;
        if pad {
            emit_arith_ri(buf, ArithOp::Sub, true, Reg::Rsp, 8);
        }
        // Stage arguments on the stack and pop them into the ABI
        // registers in reverse: collision-free even when an argument
        // currently lives in an argument register.
        for &(_, p) in args {
            emit_push(buf, reg(p));
        }
        for i in (0..args.len()).rev() {
            emit_pop(buf, CALL_ARG_REGS[i]);
        }
        emit_mov_ri(buf, true, CALL_TMP, func);
        emit_call_reg(buf, CALL_TMP);
        if let Some((w, dp)) = ret {
            let dp = reg(dp);
            if dp != Reg::Rax {
                emit_mov_rr(buf, true, dp, Reg::Rax);
            }
            mask_low(buf, w, dp);
        }
        if pad {
            emit_arith_ri(buf, ArithOp::Add, true, Reg::Rsp, 8);
        }
        for &s in saved.iter().rev() {
            emit_pop(buf, s);
        }
    }
}
