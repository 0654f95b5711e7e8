//! IR-to-IA-32 instruction selection.
//!
//! The 32-bit host has too few registers to allocate IR values into, so
//! the "pool" is sixteen dword slots in a stack frame reserved by the
//! entry thunk; a 64-bit value takes an even-aligned slot pair, low
//! dword first. EAX/ECX/EDX are scratch and never live across an IR
//! instruction. Each 32-bit slot holds its value zero-extended, the
//! same invariant the 64-bit emitter keeps per register.
//!
//! 64-bit shift semantics must match the 64-bit emitter (counts taken
//! modulo 64), which plain 32-bit shift instructions cannot express, so
//! Shl/Shr/Asr go through the [`crate::helpers`] functions via cdecl
//! calls emitted inline.

use dbt_ir::{BinOp, CastKind, Width};

use crate::code_buf::CodeBuf;
use crate::encode::{
    emit_arith_ri, emit_arith_rm, emit_arith_rr, emit_call_reg, emit_cdq, emit_cmovcc_rm,
    emit_jcc_short, emit_jmp_rel32_stub, emit_load, emit_load_ext, emit_mov_ri, emit_pop,
    emit_push, emit_push_imm8, emit_push_m, emit_ret, emit_shift_cl, emit_shift_ri, emit_store,
    emit_store_byte, emit_store_imm, emit_store_word, emit_test_rr, patch_short, ArithOp, Reg,
    ShiftOp, X86Cond, OPC_MOVZBL, OPC_MOVZWL, OPC_SHIFTB_cl, OPC_SHIFT_cl, P_DATA16,
};
use crate::helpers;
use crate::lower::{ExitVal, HostEmitter, PReg};
use crate::regset::RegSet;

/// Guest context pointer, pinned by the entry thunk.
pub const CTX_REG: Reg = Reg::Rbp;

/// Slot frame reserved by the entry thunk, in bytes. Sized so that ESP
/// is 16-byte aligned at the thunk's call into the block.
pub const FRAME_SIZE: i32 = 68;

/// The block's return address sits below the slot frame.
const RET_BIAS: i32 = 4;

/// ESP inside a block, modulo 16. Call padding is derived from this.
const ESP_MOD_16: i32 = 12;

#[inline]
fn slot(p: PReg) -> i32 {
    RET_BIAS + 4 * p as i32
}

fn ld(buf: &mut CodeBuf, r: Reg, p: PReg) {
    emit_load(buf, false, r, Reg::Rsp, slot(p));
}

fn st(buf: &mut CodeBuf, r: Reg, p: PReg) {
    emit_store(buf, false, r, Reg::Rsp, slot(p));
}

/// Re-establish zero-extension on a sub-dword value in `r`.
fn mask32(buf: &mut CodeBuf, w: Width, r: Reg) {
    if matches!(w, Width::W8 | Width::W16) {
        emit_arith_ri(buf, ArithOp::And, false, r, w.mask() as i32);
    }
}

/// Sign-extend the low `w` bits of `r` across the full dword.
fn sign_widen32(buf: &mut CodeBuf, w: Width, r: Reg) {
    if matches!(w, Width::W8 | Width::W16) {
        let k = (32 - w.bits()) as u8;
        emit_shift_ri(buf, ShiftOp::Shl, false, r, k);
        emit_shift_ri(buf, ShiftOp::Sar, false, r, k);
    }
}

/// Load a predicate into ECX and set ZF from it.
fn test_pred(buf: &mut CodeBuf, p: PReg, pw: Width) {
    ld(buf, Reg::Rcx, p);
    if pw == Width::W64 {
        emit_arith_rm(buf, ArithOp::Or, false, Reg::Rcx, Reg::Rsp, slot(p + 1));
    } else {
        emit_test_rr(buf, false, Reg::Rcx, Reg::Rcx);
    }
}

/// cdecl call with ESP re-aligned to 16 at the call instruction.
/// `arg_bytes` counts the argument area the caller pushes after the pad.
fn call_pad(arg_bytes: i32) -> i32 {
    (ESP_MOD_16 - arg_bytes).rem_euclid(16)
}

pub struct I386Emitter;

impl I386Emitter {
    /// Emit `helper(v, n)` with v in EDX:EAX and n in ECX; the result
    /// comes back in EDX:EAX. Scratch-only, so nothing needs saving.
    fn call_shift_helper(&mut self, buf: &mut CodeBuf, func: u64) {
        let pad = call_pad(16);
        emit_arith_ri(buf, ArithOp::Sub, false, Reg::Rsp, pad);
        emit_push_imm8(buf, 0); // count high dword
        emit_push(buf, Reg::Rcx);
        emit_push(buf, Reg::Rdx);
        emit_push(buf, Reg::Rax);
        emit_mov_ri(buf, false, Reg::Rax, func);
        emit_call_reg(buf, Reg::Rax);
        emit_arith_ri(buf, ArithOp::Add, false, Reg::Rsp, pad + 16);
    }
}

impl HostEmitter for I386Emitter {
    const HOST_BITS: u32 = 32;

    fn pool(&self) -> RegSet {
        RegSet::first_n(16)
    }

    fn slots(w: Width) -> u32 {
        if w == Width::W64 {
            2
        } else {
            1
        }
    }

    fn mov_const(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, value: u64) {
        emit_store_imm(buf, Reg::Rsp, slot(dst), value as u32);
        if w == Width::W64 {
            emit_store_imm(buf, Reg::Rsp, slot(dst + 1), (value >> 32) as u32);
        }
    }

    fn load(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, addr: PReg) {
        ld(buf, Reg::Rcx, addr);
        match w {
            Width::W8 => emit_load_ext(buf, OPC_MOVZBL, Reg::Rax, Reg::Rcx, 0),
            Width::W16 => emit_load_ext(buf, OPC_MOVZWL, Reg::Rax, Reg::Rcx, 0),
            Width::W32 => emit_load(buf, false, Reg::Rax, Reg::Rcx, 0),
            Width::W64 => {
                emit_load(buf, false, Reg::Rax, Reg::Rcx, 0);
                emit_load(buf, false, Reg::Rdx, Reg::Rcx, 4);
                st(buf, Reg::Rdx, dst + 1);
            }
        }
        st(buf, Reg::Rax, dst);
    }

    fn store(&mut self, buf: &mut CodeBuf, w: Width, src: PReg, addr: PReg) {
        ld(buf, Reg::Rcx, addr);
        ld(buf, Reg::Rax, src);
        match w {
            Width::W8 => emit_store_byte(buf, Reg::Rax, Reg::Rcx, 0),
            Width::W16 => emit_store_word(buf, Reg::Rax, Reg::Rcx, 0),
            Width::W32 => emit_store(buf, false, Reg::Rax, Reg::Rcx, 0),
            Width::W64 => {
                emit_store(buf, false, Reg::Rax, Reg::Rcx, 0);
                ld(buf, Reg::Rdx, src + 1);
                emit_store(buf, false, Reg::Rdx, Reg::Rcx, 4);
            }
        }
    }

    fn binop(&mut self, buf: &mut CodeBuf, op: BinOp, w: Width, dst: PReg, a: PReg, b: PReg) {
        match op {
            BinOp::Add | BinOp::Sub if w == Width::W64 => {
                let (lo, hi) = if op == BinOp::Add {
                    (ArithOp::Add, ArithOp::Adc)
                } else {
                    (ArithOp::Sub, ArithOp::Sbb)
                };
                ld(buf, Reg::Rax, a);
                ld(buf, Reg::Rdx, a + 1);
                emit_arith_rm(buf, lo, false, Reg::Rax, Reg::Rsp, slot(b));
                emit_arith_rm(buf, hi, false, Reg::Rdx, Reg::Rsp, slot(b + 1));
                st(buf, Reg::Rax, dst);
                st(buf, Reg::Rdx, dst + 1);
            }
            BinOp::And | BinOp::Or | BinOp::Xor if w == Width::W64 => {
                let arith = match op {
                    BinOp::And => ArithOp::And,
                    BinOp::Or => ArithOp::Or,
                    BinOp::Xor => ArithOp::Xor,
                    _ => unreachable!(),
                };
                ld(buf, Reg::Rax, a);
                emit_arith_rm(buf, arith, false, Reg::Rax, Reg::Rsp, slot(b));
                st(buf, Reg::Rax, dst);
                ld(buf, Reg::Rax, a + 1);
                emit_arith_rm(buf, arith, false, Reg::Rax, Reg::Rsp, slot(b + 1));
                st(buf, Reg::Rax, dst + 1);
            }
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let arith = match op {
                    BinOp::Add => ArithOp::Add,
                    BinOp::Sub => ArithOp::Sub,
                    BinOp::And => ArithOp::And,
                    BinOp::Or => ArithOp::Or,
                    BinOp::Xor => ArithOp::Xor,
                    _ => unreachable!(),
                };
                ld(buf, Reg::Rax, a);
                emit_arith_rm(buf, arith, false, Reg::Rax, Reg::Rsp, slot(b));
                if matches!(op, BinOp::Add | BinOp::Sub) {
                    mask32(buf, w, Reg::Rax);
                }
                st(buf, Reg::Rax, dst);
            }
            BinOp::Ror if w != Width::W64 => {
                // A width-sized hardware rotate is count-periodic in the
                // width, so the 5-bit hardware count mask is harmless.
                ld(buf, Reg::Rax, a);
                ld(buf, Reg::Rcx, b);
                let opc = match w {
                    Width::W8 => OPC_SHIFTB_cl,
                    Width::W16 => OPC_SHIFT_cl | P_DATA16,
                    _ => OPC_SHIFT_cl,
                };
                emit_shift_cl(buf, opc, ShiftOp::Ror, Reg::Rax);
                st(buf, Reg::Rax, dst);
            }
            BinOp::Shl | BinOp::Shr | BinOp::Asr | BinOp::Ror => {
                // Stage the value in EDX:EAX, sign-widened for Asr, and
                // the count in ECX, then go through the 64-bit helper.
                ld(buf, Reg::Rax, a);
                if w == Width::W64 {
                    ld(buf, Reg::Rdx, a + 1);
                } else if op == BinOp::Asr {
                    sign_widen32(buf, w, Reg::Rax);
                    emit_cdq(buf);
                } else {
                    emit_mov_ri(buf, false, Reg::Rdx, 0);
                }
                ld(buf, Reg::Rcx, b);
                let func = match op {
                    BinOp::Shl => helpers::shl64 as usize as u64,
                    BinOp::Shr => helpers::shr64 as usize as u64,
                    BinOp::Asr => helpers::asr64 as usize as u64,
                    BinOp::Ror => helpers::ror64 as usize as u64,
                    _ => unreachable!(),
                };
                self.call_shift_helper(buf, func);
                if matches!(op, BinOp::Shl | BinOp::Asr) {
                    mask32(buf, w, Reg::Rax);
                }
                st(buf, Reg::Rax, dst);
                if w == Width::W64 {
                    st(buf, Reg::Rdx, dst + 1);
                }
            }
            BinOp::CmpEq | BinOp::CmpNe => {
                if w == Width::W64 {
                    // xor both halves against b and OR them: ZF iff equal.
                    ld(buf, Reg::Rax, a);
                    ld(buf, Reg::Rdx, a + 1);
                    emit_arith_rm(buf, ArithOp::Xor, false, Reg::Rax, Reg::Rsp, slot(b));
                    emit_arith_rm(buf, ArithOp::Xor, false, Reg::Rdx, Reg::Rsp, slot(b + 1));
                    emit_arith_rr(buf, ArithOp::Or, false, Reg::Rax, Reg::Rdx);
                } else {
                    ld(buf, Reg::Rax, a);
                    emit_arith_rm(buf, ArithOp::Cmp, false, Reg::Rax, Reg::Rsp, slot(b));
                }
                // mov imm is flag-transparent; the xor in the skipped arm
                // runs after the flags are consumed.
                emit_mov_ri(buf, false, Reg::Rax, w.mask() & 0xFFFF_FFFF);
                let cond = if op == BinOp::CmpEq { X86Cond::Je } else { X86Cond::Jne };
                let skip = emit_jcc_short(buf, cond);
                emit_mov_ri(buf, false, Reg::Rax, 0);
                patch_short(buf, skip);
                st(buf, Reg::Rax, dst);
                if w == Width::W64 {
                    st(buf, Reg::Rax, dst + 1);
                }
            }
        }
    }

    fn ite(
        &mut self,
        buf: &mut CodeBuf,
        w: Width,
        dst: PReg,
        pred: PReg,
        pred_w: Width,
        t: PReg,
        f: PReg,
    ) {
        test_pred(buf, pred, pred_w);
        // cmov and plain moves leave the flags alone.
        ld(buf, Reg::Rax, t);
        emit_cmovcc_rm(buf, X86Cond::Je, false, Reg::Rax, Reg::Rsp, slot(f));
        st(buf, Reg::Rax, dst);
        if w == Width::W64 {
            ld(buf, Reg::Rax, t + 1);
            emit_cmovcc_rm(buf, X86Cond::Je, false, Reg::Rax, Reg::Rsp, slot(f + 1));
            st(buf, Reg::Rax, dst + 1);
        }
    }

    fn cast(&mut self, buf: &mut CodeBuf, kind: CastKind, dst: PReg, src: PReg) {
        ld(buf, Reg::Rax, src);
        if kind.is_narrow() {
            // The low dword of a pair is already the 64-bit truncation.
            mask32(buf, kind.to, Reg::Rax);
            st(buf, Reg::Rax, dst);
        } else if kind.is_widen() {
            if kind.signed {
                sign_widen32(buf, kind.from, Reg::Rax);
                if kind.to == Width::W64 {
                    emit_cdq(buf);
                    st(buf, Reg::Rax, dst);
                    st(buf, Reg::Rdx, dst + 1);
                } else {
                    mask32(buf, kind.to, Reg::Rax);
                    st(buf, Reg::Rax, dst);
                }
            } else {
                st(buf, Reg::Rax, dst);
                if kind.to == Width::W64 {
                    emit_store_imm(buf, Reg::Rsp, slot(dst + 1), 0);
                }
            }
        } else {
            st(buf, Reg::Rax, dst);
            if kind.to == Width::W64 {
                ld(buf, Reg::Rax, src + 1);
                st(buf, Reg::Rax, dst + 1);
            }
        }
    }

    fn read_ctx(&mut self, buf: &mut CodeBuf, w: Width, dst: PReg, offset: i32) {
        match w {
            Width::W8 => emit_load_ext(buf, OPC_MOVZBL, Reg::Rax, CTX_REG, offset),
            Width::W16 => emit_load_ext(buf, OPC_MOVZWL, Reg::Rax, CTX_REG, offset),
            Width::W32 => emit_load(buf, false, Reg::Rax, CTX_REG, offset),
            Width::W64 => {
                emit_load(buf, false, Reg::Rax, CTX_REG, offset);
                emit_load(buf, false, Reg::Rdx, CTX_REG, offset + 4);
                st(buf, Reg::Rdx, dst + 1);
            }
        }
        st(buf, Reg::Rax, dst);
    }

    fn write_ctx(&mut self, buf: &mut CodeBuf, w: Width, src: PReg, offset: i32) {
        ld(buf, Reg::Rax, src);
        match w {
            Width::W8 => emit_store_byte(buf, Reg::Rax, CTX_REG, offset),
            Width::W16 => emit_store_word(buf, Reg::Rax, CTX_REG, offset),
            Width::W32 => emit_store(buf, false, Reg::Rax, CTX_REG, offset),
            Width::W64 => {
                emit_store(buf, false, Reg::Rax, CTX_REG, offset);
                ld(buf, Reg::Rdx, src + 1);
                emit_store(buf, false, Reg::Rdx, CTX_REG, offset + 4);
            }
        }
    }

    fn exit(
        &mut self,
        buf: &mut CodeBuf,
        value: ExitVal,
        pred: Option<(PReg, Width)>,
    ) -> Option<usize> {
        let skip = pred.map(|(p, pw)| {
            test_pred(buf, p, pw);
            emit_jcc_short(buf, X86Cond::Je)
        });
        let stub = match value {
            ExitVal::Reg(w, v) => {
                ld(buf, Reg::Rax, v);
                if w == Width::W64 {
                    ld(buf, Reg::Rdx, v + 1);
                } else {
                    emit_mov_ri(buf, false, Reg::Rdx, 0);
                }
                emit_mov_ri(buf, false, Reg::Rcx, 0);
                emit_ret(buf);
                None
            }
            ExitVal::Const(pc) => {
                emit_mov_ri(buf, false, Reg::Rax, pc & 0xFFFF_FFFF);
                emit_mov_ri(buf, false, Reg::Rdx, pc >> 32);
                // ECX = address of the ret below: call +0 pushes the
                // address of the pop, and the pop/add pair spans 4 bytes.
                buf.emit_u8(0xE8);
                buf.emit_u32(0);
                emit_pop(buf, Reg::Rcx);
                emit_arith_ri(buf, ArithOp::Add, false, Reg::Rcx, 4);
                let site = buf.offset();
                emit_ret(buf);
                // Dormant rel32 jump; patching fills the displacement and
                // turns the ret into a nop.
                emit_jmp_rel32_stub(buf);
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
        _live: RegSet,
    ) {
        // Everything lives in slots, which survive the call untouched;
        // only ESP alignment and the argument area need managing. Each
        // argument is widened to a dword pair, pushed right to left.
        let arg_bytes = 8 * args.len() as i32;
        let pad = call_pad(arg_bytes);
        if pad != 0 {
            emit_arith_ri(buf, ArithOp::Sub, false, Reg::Rsp, pad);
        }
        let mut adj = pad;
        for &(w, p) in args.iter().rev() {
            if w == Width::W64 {
                emit_push_m(buf, Reg::Rsp, slot(p + 1) + adj);
            } else {
                emit_push_imm8(buf, 0);
            }
            adj += 4;
            emit_push_m(buf, Reg::Rsp, slot(p) + adj);
            adj += 4;
        }
        emit_mov_ri(buf, false, Reg::Rax, func);
        emit_call_reg(buf, Reg::Rax);
        emit_arith_ri(buf, ArithOp::Add, false, Reg::Rsp, pad + arg_bytes);
        if let Some((w, d)) = ret {
            if w == Width::W64 {
                st(buf, Reg::Rax, d);
                st(buf, Reg::Rdx, d + 1);
            } else {
                mask32(buf, w, Reg::Rax);
                st(buf, Reg::Rax, d);
            }
        }
    }
}
