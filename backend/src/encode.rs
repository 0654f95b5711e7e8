//! Byte-level x86 instruction encoding shared by the x86-64 and i386
//! emitters. IA-32 and x86-64 share opcode maps; the REX machinery only
//! fires for 64-bit operands and high registers, so the i386 emitter can
//! use the same entry points with `rexw = false` and registers 0-7.

#![allow(non_upper_case_globals)]

use crate::code_buf::CodeBuf;

// -- Prefix flags --

pub const P_EXT: u32 = 0x100; // 0x0F prefix
pub const P_DATA16: u32 = 0x400; // 0x66 prefix
pub const P_REXW: u32 = 0x1000; // REX.W = 1
pub const P_REXB_R: u32 = 0x2000; // REG field as byte register
pub const P_REXB_RM: u32 = 0x4000; // R/M field as byte register

// -- Opcode constants --

pub const OPC_ARITH_EvIb: u32 = 0x83;
pub const OPC_ARITH_EvIz: u32 = 0x81;
pub const OPC_ARITH_GvEv: u32 = 0x03;

pub const OPC_SHIFT_Ib: u32 = 0xC1;
pub const OPC_SHIFT_cl: u32 = 0xD3;
pub const OPC_SHIFTB_cl: u32 = 0xD2 | P_REXB_RM;

pub const OPC_MOVB_EvGv: u32 = 0x88;
pub const OPC_MOVL_EvGv: u32 = 0x89;
pub const OPC_MOVL_GvEv: u32 = 0x8B;
pub const OPC_MOVL_EvIz: u32 = 0xC7;
pub const OPC_MOVL_Iv: u32 = 0xB8;

pub const OPC_MOVZBL: u32 = 0xB6 | P_EXT;
pub const OPC_MOVZWL: u32 = 0xB7 | P_EXT;
pub const OPC_MOVSBL: u32 = 0xBE | P_EXT;
pub const OPC_MOVSWL: u32 = 0xBF | P_EXT;
pub const OPC_MOVSLQ: u32 = 0x63 | P_REXW;

pub const OPC_JCC_short: u32 = 0x70;
pub const OPC_JMP_long: u32 = 0xE9;
pub const OPC_CMOVCC: u32 = 0x40 | P_EXT;
pub const OPC_TESTL: u32 = 0x85;

pub const OPC_GRP5: u32 = 0xFF;
pub const OPC_LEA: u32 = 0x8D;
pub const OPC_PUSH_r32: u32 = 0x50;
pub const OPC_POP_r32: u32 = 0x58;
pub const OPC_RET: u32 = 0xC3;
pub const OPC_CDQ: u32 = 0x99;

// -- Registers --

/// Host registers by hardware encoding. The first eight double as the
/// IA-32 register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low three bits for ModR/M and SIB fields.
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 7
    }

    pub fn from_u8(v: u8) -> Reg {
        assert!(v < 16, "bad register encoding");
        // SAFETY: repr(u8) covers 0..=15.
        unsafe { core::mem::transmute(v) }
    }
}

// -- Sub-operation enums --

/// Arithmetic sub-opcodes (/r field of 0x81/0x83, shifted into GvEv).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArithOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Shift sub-opcodes (/r field of 0xC1/0xD3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Group 5 extension codes (/r field of 0xFF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ext5Op {
    CallN = 2,
    JmpN = 4,
    PushM = 6,
}

/// x86 condition codes for Jcc/CMOVcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum X86Cond {
    Je = 0x4,
    Jne = 0x5,
}

// -- Core encoding --

#[inline]
pub fn rexw_flag(rexw: bool) -> u32 {
    if rexw {
        P_REXW
    } else {
        0
    }
}

/// Emit prefixes + opcode. `r` is the reg field, `rm` the r/m field,
/// both raw register numbers (0-15). Pass 0 for unused fields.
pub fn emit_opc(buf: &mut CodeBuf, opc: u32, r: u8, rm: u8) {
    let mut rex: u8 = 0;
    if opc & P_REXW != 0 {
        rex |= 0x08; // REX.W
    }
    if r >= 8 {
        rex |= 0x04; // REX.R
    }
    if rm >= 8 {
        rex |= 0x01; // REX.B
    }
    // Byte access to SPL/BPL/SIL/DIL needs a bare REX prefix.
    if opc & P_REXB_R != 0 && r >= 4 && rex == 0 {
        rex = 0x40;
    }
    if opc & P_REXB_RM != 0 && rm >= 4 && rex == 0 {
        rex = 0x40;
    }

    if opc & P_DATA16 != 0 {
        buf.emit_u8(0x66);
    }
    if rex != 0 {
        buf.emit_u8(0x40 | rex);
    }
    if opc & P_EXT != 0 {
        buf.emit_u8(0x0F);
    }
    buf.emit_u8(opc as u8);
}

/// Opcode + ModR/M for a register-register operation.
pub fn emit_modrm(buf: &mut CodeBuf, opc: u32, r: Reg, rm: Reg) {
    emit_opc(buf, opc, r as u8, rm as u8);
    buf.emit_u8(0xC0 | (r.low3() << 3) | rm.low3());
}

/// Opcode + ModR/M with /r extension (group opcodes) on a register.
pub fn emit_modrm_ext(buf: &mut CodeBuf, opc: u32, ext: u8, rm: Reg) {
    emit_opc(buf, opc, ext, rm as u8);
    buf.emit_u8(0xC0 | (ext << 3) | rm.low3());
}

fn emit_mem_modrm(buf: &mut CodeBuf, r3: u8, base: Reg, offset: i32) {
    let b3 = base.low3();
    if offset == 0 && b3 != 5 {
        // [base] — mod=00 (RBP/R13 always need a displacement)
        if b3 == 4 {
            buf.emit_u8((r3 << 3) | 0x04);
            buf.emit_u8(0x24); // SIB: no index, base=RSP
        } else {
            buf.emit_u8((r3 << 3) | b3);
        }
    } else if (-128..=127).contains(&offset) {
        if b3 == 4 {
            buf.emit_u8(0x44 | (r3 << 3));
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8(0x40 | (r3 << 3) | b3);
        }
        buf.emit_u8(offset as u8);
    } else {
        if b3 == 4 {
            buf.emit_u8(0x84 | (r3 << 3));
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8(0x80 | (r3 << 3) | b3);
        }
        buf.emit_u32(offset as u32);
    }
}

/// Opcode + ModR/M + displacement for memory [base + offset].
pub fn emit_modrm_offset(buf: &mut CodeBuf, opc: u32, r: Reg, base: Reg, offset: i32) {
    emit_opc(buf, opc, r as u8, base as u8);
    emit_mem_modrm(buf, r.low3(), base, offset);
}

/// Opcode + ModR/M with /r extension for memory [base + offset].
pub fn emit_modrm_ext_offset(buf: &mut CodeBuf, opc: u32, ext: u8, base: Reg, offset: i32) {
    emit_opc(buf, opc, ext, base as u8);
    emit_mem_modrm(buf, ext, base, offset);
}

// -- Arithmetic --

/// ADD/SUB/AND/OR/XOR/CMP/ADC/SBB dst, src.
pub fn emit_arith_rr(buf: &mut CodeBuf, op: ArithOp, rexw: bool, dst: Reg, src: Reg) {
    let opc = (OPC_ARITH_GvEv + ((op as u32) << 3)) | rexw_flag(rexw);
    emit_modrm(buf, opc, dst, src);
}

/// Arithmetic dst, imm (auto-selects imm8 vs imm32).
pub fn emit_arith_ri(buf: &mut CodeBuf, op: ArithOp, rexw: bool, dst: Reg, imm: i32) {
    let w = rexw_flag(rexw);
    if (-128..=127).contains(&imm) {
        emit_modrm_ext(buf, OPC_ARITH_EvIb | w, op as u8, dst);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext(buf, OPC_ARITH_EvIz | w, op as u8, dst);
        buf.emit_u32(imm as u32);
    }
}

/// Arithmetic dst, [base+offset].
pub fn emit_arith_rm(buf: &mut CodeBuf, op: ArithOp, rexw: bool, dst: Reg, base: Reg, offset: i32) {
    let opc = (OPC_ARITH_GvEv + ((op as u32) << 3)) | rexw_flag(rexw);
    emit_modrm_offset(buf, opc, dst, base, offset);
}

// -- Shifts --

/// Shift dst, imm8.
pub fn emit_shift_ri(buf: &mut CodeBuf, op: ShiftOp, rexw: bool, dst: Reg, imm: u8) {
    emit_modrm_ext(buf, OPC_SHIFT_Ib | rexw_flag(rexw), op as u8, dst);
    buf.emit_u8(imm);
}

/// Shift dst, CL with an explicit opcode (word/dword/qword or byte form).
pub fn emit_shift_cl(buf: &mut CodeBuf, opc: u32, op: ShiftOp, dst: Reg) {
    emit_modrm_ext(buf, opc, op as u8, dst);
}

// -- Data movement --

/// MOV dst, src (32-bit or 64-bit).
pub fn emit_mov_rr(buf: &mut CodeBuf, rexw: bool, dst: Reg, src: Reg) {
    emit_modrm(buf, OPC_MOVL_EvGv | rexw_flag(rexw), src, dst);
}

/// MOV reg, imm; zero becomes XOR reg, reg and small values avoid the
/// 10-byte movabs form.
pub fn emit_mov_ri(buf: &mut CodeBuf, rexw: bool, reg: Reg, val: u64) {
    if val == 0 {
        emit_modrm(buf, 0x31, reg, reg);
    } else if !rexw || val <= u32::MAX as u64 {
        emit_opc(buf, OPC_MOVL_Iv + (reg.low3() as u32), 0, reg as u8);
        buf.emit_u32(val as u32);
    } else if val as i64 >= i32::MIN as i64 && val as i64 <= i32::MAX as i64 {
        emit_modrm_ext(buf, OPC_MOVL_EvIz | P_REXW, 0, reg);
        buf.emit_u32(val as u32);
    } else {
        emit_opc(buf, (OPC_MOVL_Iv + (reg.low3() as u32)) | P_REXW, 0, reg as u8);
        buf.emit_u64(val);
    }
}

// -- Memory --

/// MOV dst, [base+offset] (32-bit or 64-bit).
pub fn emit_load(buf: &mut CodeBuf, rexw: bool, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVL_GvEv | rexw_flag(rexw), dst, base, offset);
}

/// MOV [base+offset], src (32-bit or 64-bit).
pub fn emit_store(buf: &mut CodeBuf, rexw: bool, src: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVL_EvGv | rexw_flag(rexw), src, base, offset);
}

/// MOV byte [base+offset], src.
pub fn emit_store_byte(buf: &mut CodeBuf, src: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVB_EvGv | P_REXB_R, src, base, offset);
}

/// MOV word [base+offset], src.
pub fn emit_store_word(buf: &mut CodeBuf, src: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVL_EvGv | P_DATA16, src, base, offset);
}

/// MOV dword [base+offset], imm32.
pub fn emit_store_imm(buf: &mut CodeBuf, base: Reg, offset: i32, imm: u32) {
    emit_modrm_ext_offset(buf, OPC_MOVL_EvIz, 0, base, offset);
    buf.emit_u32(imm);
}

/// Zero- or sign-extending load: pass one of the OPC_MOVZ*/OPC_MOVS* opcodes.
pub fn emit_load_ext(buf: &mut CodeBuf, opc: u32, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, opc, dst, base, offset);
}

/// LEA dst, [rip + disp32] (x86-64 only).
pub fn emit_lea_rip(buf: &mut CodeBuf, dst: Reg, disp: i32) {
    emit_opc(buf, OPC_LEA | P_REXW, dst as u8, 0);
    buf.emit_u8((dst.low3() << 3) | 0x05);
    buf.emit_u32(disp as u32);
}

// -- Branches and conditionals --

/// Jcc rel8 with the displacement left as zero; returns the offset of
/// the displacement byte for back-patching.
pub fn emit_jcc_short(buf: &mut CodeBuf, cond: X86Cond) -> usize {
    buf.emit_u8((OPC_JCC_short + cond as u32) as u8);
    let at = buf.offset();
    buf.emit_u8(0);
    at
}

/// JMP rel8 with the displacement left as zero; returns the offset of
/// the displacement byte for back-patching.
pub fn emit_jmp_short(buf: &mut CodeBuf) -> usize {
    buf.emit_u8(0xEB);
    let at = buf.offset();
    buf.emit_u8(0);
    at
}

/// Resolve a short branch to jump to the current offset.
pub fn patch_short(buf: &mut CodeBuf, disp_at: usize) {
    let disp = buf.offset() as i64 - (disp_at as i64 + 1);
    assert!((-128..=127).contains(&disp), "short branch out of range");
    buf.patch_u8(disp_at, disp as u8);
}

/// JMP rel32 with a zero displacement, to be rewritten at patch time.
pub fn emit_jmp_rel32_stub(buf: &mut CodeBuf) {
    buf.emit_u8(OPC_JMP_long as u8);
    buf.emit_u32(0);
}

/// TEST r1, r2.
pub fn emit_test_rr(buf: &mut CodeBuf, rexw: bool, r1: Reg, r2: Reg) {
    emit_modrm(buf, OPC_TESTL | rexw_flag(rexw), r1, r2);
}

/// CMOVcc dst, src.
pub fn emit_cmovcc(buf: &mut CodeBuf, cond: X86Cond, rexw: bool, dst: Reg, src: Reg) {
    emit_modrm(buf, (OPC_CMOVCC + cond as u32) | rexw_flag(rexw), dst, src);
}

/// CMOVcc dst, [base+offset].
pub fn emit_cmovcc_rm(buf: &mut CodeBuf, cond: X86Cond, rexw: bool, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, (OPC_CMOVCC + cond as u32) | rexw_flag(rexw), dst, base, offset);
}

// -- Stack and control --

pub fn emit_push(buf: &mut CodeBuf, reg: Reg) {
    emit_opc(buf, OPC_PUSH_r32 + reg.low3() as u32, 0, reg as u8);
}

pub fn emit_pop(buf: &mut CodeBuf, reg: Reg) {
    emit_opc(buf, OPC_POP_r32 + reg.low3() as u32, 0, reg as u8);
}

/// PUSH dword [base+offset].
pub fn emit_push_m(buf: &mut CodeBuf, base: Reg, offset: i32) {
    emit_modrm_ext_offset(buf, OPC_GRP5, Ext5Op::PushM as u8, base, offset);
}

/// PUSH imm8 (sign-extended to operand size).
pub fn emit_push_imm8(buf: &mut CodeBuf, imm: i8) {
    buf.emit_u8(0x6A);
    buf.emit_u8(imm as u8);
}

/// Indirect CALL through a register.
pub fn emit_call_reg(buf: &mut CodeBuf, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::CallN as u8, reg);
}

/// JMP qword [rip + 0]: the six-byte indirect form whose 8-byte target
/// slot immediately follows the instruction.
pub fn emit_jmp_rip_ind(buf: &mut CodeBuf) {
    buf.emit_u8(OPC_GRP5 as u8);
    // mod=00, reg=/4, rm=101 (rip-relative)
    buf.emit_u8(((Ext5Op::JmpN as u8) << 3) | 0x05);
    buf.emit_u32(0);
}

pub fn emit_ret(buf: &mut CodeBuf) {
    buf.emit_u8(OPC_RET as u8);
}

/// RET imm16: pop the return address and `imm` extra bytes of arguments.
pub fn emit_ret_imm16(buf: &mut CodeBuf, imm: u16) {
    buf.emit_u8(0xC2);
    buf.emit_u16(imm);
}

/// CDQ: sign-extend EAX into EDX:EAX.
pub fn emit_cdq(buf: &mut CodeBuf) {
    buf.emit_u8(OPC_CDQ as u8);
}
