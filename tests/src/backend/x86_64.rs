//! Execution tests for the x86-64 backend: build a block of IR, jit it
//! into executable memory, run it against a guest context, and check
//! the architectural result.

use dbt_backend::x86_64::X86_64Emitter;
use dbt_backend::{lower, Backend, CodeBuf, ExecResult, X86_64Backend};
use dbt_cache::ExecPool;
use dbt_ir::{BinOp, CastKind, IrBuilder, Width};

/// Minimal guest CPU state with a small memory window.
#[repr(C)]
struct GuestCtx {
    regs: [u64; 8],
    mem: [u8; 64],
}

impl GuestCtx {
    fn new() -> Self {
        Self {
            regs: [0; 8],
            mem: [0; 64],
        }
    }
}

fn reg_off(i: usize) -> i32 {
    (i * 8) as i32
}

/// Jit one block into fresh executable memory and run it.
fn run(ir: &IrBuilder, ctx: &mut GuestCtx) -> ExecResult {
    let mut backend = X86_64Backend::new().unwrap();
    let mut buf = CodeBuf::new();
    backend.jit(ir, &mut buf);
    let mut pool = ExecPool::new(buf.offset()).unwrap();
    let code = pool.write(buf.as_slice());
    unsafe { backend.execute(code, ctx as *mut GuestCtx as *mut u8) }
}

/// Exit value of `a op b` at width `w`. The result register is not a
/// compile-time constant, so no patch site is reported.
fn binop_value(op: BinOp, w: Width, a: u64, b: u64) -> u64 {
    let mut ir = IrBuilder::new();
    let ra = ir.gen_mov_const(w, a);
    let rb = ir.gen_mov_const(w, b);
    let rc = ir.gen_binop(op, ra, rb);
    ir.gen_exit(rc);
    let mut ctx = GuestCtx::new();
    let res = run(&ir, &mut ctx);
    assert_eq!(res.patch_site, 0);
    res.value
}

fn cast_value(kind: CastKind, v: u64) -> u64 {
    let mut ir = IrBuilder::new();
    let src = ir.gen_mov_const(kind.from, v);
    let dst = ir.gen_cast(kind, src);
    ir.gen_exit(dst);
    let mut ctx = GuestCtx::new();
    run(&ir, &mut ctx).value
}

#[test]
fn add_wraps_per_width() {
    assert_eq!(binop_value(BinOp::Add, Width::W8, 0xF0, 0x20), 0x10);
    assert_eq!(binop_value(BinOp::Add, Width::W16, 0xFFF0, 0x20), 0x10);
    assert_eq!(binop_value(BinOp::Add, Width::W32, 0xFFFF_FFF0, 0x20), 0x10);
    assert_eq!(binop_value(BinOp::Add, Width::W64, u64::MAX, 2), 1);
}

#[test]
fn sub_borrows_per_width() {
    assert_eq!(binop_value(BinOp::Sub, Width::W8, 5, 7), 0xFE);
    assert_eq!(binop_value(BinOp::Sub, Width::W32, 0, 1), 0xFFFF_FFFF);
    assert_eq!(binop_value(BinOp::Sub, Width::W64, 0, 1), u64::MAX);
}

#[test]
fn bitwise_ops() {
    assert_eq!(binop_value(BinOp::And, Width::W32, 0xFF00_FF00, 0x0FF0_0FF0), 0x0F00_0F00);
    assert_eq!(binop_value(BinOp::Or, Width::W16, 0xF000, 0x000F), 0xF00F);
    assert_eq!(binop_value(BinOp::Xor, Width::W64, u64::MAX, 0xFF), u64::MAX - 0xFF);
}

#[test]
fn shifts_and_their_edges() {
    assert_eq!(binop_value(BinOp::Shl, Width::W32, 1, 31), 0x8000_0000);
    // Counts are taken modulo 64, so a 32-bit shift by 32 clears the value.
    assert_eq!(binop_value(BinOp::Shl, Width::W32, 1, 32), 0);
    assert_eq!(binop_value(BinOp::Shl, Width::W64, 1, 64), 1);
    assert_eq!(binop_value(BinOp::Shr, Width::W8, 0x80, 7), 1);
    assert_eq!(binop_value(BinOp::Shr, Width::W64, 1 << 63, 63), 1);
}

#[test]
fn asr_fills_with_guest_sign() {
    assert_eq!(binop_value(BinOp::Asr, Width::W8, 0x80, 7), 0xFF);
    // Shifting a byte by its own width still fills with sign bits.
    assert_eq!(binop_value(BinOp::Asr, Width::W8, 0x80, 8), 0xFF);
    assert_eq!(binop_value(BinOp::Asr, Width::W32, 0x8000_0000, 31), 0xFFFF_FFFF);
    assert_eq!(binop_value(BinOp::Asr, Width::W64, 1 << 63, 63), u64::MAX);
    assert_eq!(binop_value(BinOp::Asr, Width::W16, 0x4000, 3), 0x0800);
}

#[test]
fn rotates_are_width_sized() {
    assert_eq!(binop_value(BinOp::Ror, Width::W8, 0x81, 1), 0xC0);
    assert_eq!(binop_value(BinOp::Ror, Width::W16, 1, 16), 1);
    assert_eq!(binop_value(BinOp::Ror, Width::W32, 1, 1), 0x8000_0000);
    assert_eq!(binop_value(BinOp::Ror, Width::W64, 1, 1), 1 << 63);
    // Counts past the width wrap around: ror by k equals ror by k mod width.
    assert_eq!(binop_value(BinOp::Ror, Width::W8, 0x81, 9), 0xC0);
    assert_eq!(binop_value(BinOp::Ror, Width::W16, 0x8001, 19), 0x3000);
}

#[test]
fn shift_and_rotate_by_zero_is_identity() {
    let vals = [
        (Width::W8, 0x81u64),
        (Width::W16, 0x8001),
        (Width::W32, 0x8000_0001),
        (Width::W64, 0x8000_0000_0000_0001),
    ];
    for (w, v) in vals {
        for op in [BinOp::Shl, BinOp::Shr, BinOp::Asr, BinOp::Ror] {
            assert_eq!(binop_value(op, w, v, 0), v, "{op:?} by zero at {w:?}");
        }
    }
}

#[test]
fn compares_are_complementary_masks() {
    for w in [Width::W8, Width::W32, Width::W64] {
        for (a, b) in [(5u64, 5u64), (5, 6)] {
            let eq = binop_value(BinOp::CmpEq, w, a, b);
            let ne = binop_value(BinOp::CmpNe, w, a, b);
            assert_eq!(eq ^ ne, w.mask());
            assert_eq!(eq, if a == b { w.mask() } else { 0 });
        }
    }
}

#[test]
fn ite_selects_on_truthiness() {
    for (p, want) in [(0u64, 0x2222u64), (1, 0x1111), (0x8000_0000, 0x1111)] {
        let mut ir = IrBuilder::new();
        let pred = ir.gen_mov_const(Width::W32, p);
        let t = ir.gen_mov_const(Width::W64, 0x1111);
        let f = ir.gen_mov_const(Width::W64, 0x2222);
        let sel = ir.gen_ite(pred, t, f);
        ir.gen_exit(sel);
        let mut ctx = GuestCtx::new();
        assert_eq!(run(&ir, &mut ctx).value, want);
    }
}

#[test]
fn cast_fidelity() {
    let sx = |from, to| CastKind { from, to, signed: true };
    let zx = |from, to| CastKind { from, to, signed: false };

    assert_eq!(cast_value(sx(Width::W8, Width::W64), 0x80), 0xFFFF_FFFF_FFFF_FF80);
    assert_eq!(cast_value(sx(Width::W8, Width::W16), 0x80), 0xFF80);
    assert_eq!(cast_value(sx(Width::W32, Width::W64), 0x8000_0000), 0xFFFF_FFFF_8000_0000);
    assert_eq!(cast_value(sx(Width::W8, Width::W64), 0x7F), 0x7F);
    assert_eq!(cast_value(zx(Width::W8, Width::W64), 0x80), 0x80);
    assert_eq!(cast_value(zx(Width::W64, Width::W8), 0x1FF), 0xFF);
    assert_eq!(cast_value(zx(Width::W64, Width::W32), 0x1_2345_6789), 0x2345_6789);
}

#[test]
fn context_roundtrip() {
    let mut ctx = GuestCtx::new();
    ctx.regs[1] = 0x1122_3344_5566_7788;

    let mut ir = IrBuilder::new();
    let full = ir.gen_read_ctx(Width::W64, reg_off(1));
    ir.gen_write_ctx(Width::W64, full, reg_off(2));
    let byte = ir.gen_read_ctx(Width::W8, reg_off(1));
    ir.gen_write_ctx(Width::W8, byte, reg_off(3));
    let half = ir.gen_read_ctx(Width::W32, reg_off(1));
    ir.gen_write_ctx(Width::W32, half, reg_off(4));
    ir.gen_exit(full);

    let res = run(&ir, &mut ctx);
    assert_eq!(res.value, 0x1122_3344_5566_7788);
    assert_eq!(ctx.regs[2], 0x1122_3344_5566_7788);
    assert_eq!(ctx.regs[3], 0x88);
    assert_eq!(ctx.regs[4], 0x5566_7788);
}

#[test]
fn guest_memory_load_store() {
    let mut ctx = GuestCtx::new();
    let addr = ctx.mem.as_ptr() as u64;

    let mut ir = IrBuilder::new();
    let a = ir.gen_mov_const(Width::W64, addr);
    let v = ir.gen_mov_const(Width::W16, 0xBEEF);
    ir.gen_store(Width::W16, v, a);
    let l = ir.gen_load(Width::W16, a);
    ir.gen_exit(l);

    assert_eq!(run(&ir, &mut ctx).value, 0xBEEF);
    assert_eq!(&ctx.mem[..2], &[0xEF, 0xBE]);
}

extern "C" fn sentinel(a: u64, b: u64, c: u64, d: u64) -> u64 {
    a ^ b.rotate_left(8) ^ c.wrapping_mul(3) ^ d
}

extern "C" fn fixed_value() -> u64 {
    0x1234_5678_9ABC_DEF0
}

// Each arity helper returns its own sentinel only when every argument
// arrives in the right slot with the right value.
extern "C" fn expect1(a: u64) -> u64 {
    if a == 0x11 { 0xA1 } else { 0 }
}

extern "C" fn expect2(a: u64, b: u64) -> u64 {
    if (a, b) == (0x11, 0x22) { 0xA2 } else { 0 }
}

extern "C" fn expect3(a: u64, b: u64, c: u64) -> u64 {
    if (a, b, c) == (0x11, 0x22, 0x33) { 0xA3 } else { 0 }
}

#[test]
fn call_marshals_four_args_with_live_values() {
    let (a, b, c, d) = (0x11u64, 0x2200u64, 0x33_0000u64, 0x4400_0000u64);

    let mut ir = IrBuilder::new();
    // A value that must survive the call exercises caller-save traffic.
    let keep = ir.gen_mov_const(Width::W64, 0x5A00);
    let ra = ir.gen_mov_const(Width::W64, a);
    let rb = ir.gen_mov_const(Width::W64, b);
    let rc = ir.gen_mov_const(Width::W64, c);
    let rd = ir.gen_mov_const(Width::W64, d);
    let ret = ir.gen_call(sentinel as usize as u64, &[ra, rb, rc, rd], Some(Width::W64));
    let sum = ir.gen_binop(BinOp::Add, ret.unwrap(), keep);
    ir.gen_exit(sum);

    let mut ctx = GuestCtx::new();
    let want = sentinel(a, b, c, d).wrapping_add(0x5A00);
    assert_eq!(run(&ir, &mut ctx).value, want);
}

#[test]
fn call_marshals_each_arity_in_order() {
    let cases: [(u64, &[u64], u64); 3] = [
        (expect1 as usize as u64, &[0x11], 0xA1),
        (expect2 as usize as u64, &[0x11, 0x22], 0xA2),
        (expect3 as usize as u64, &[0x11, 0x22, 0x33], 0xA3),
    ];
    for (func, args, want) in cases {
        let mut ir = IrBuilder::new();
        let regs: Vec<_> = args
            .iter()
            .map(|&v| ir.gen_mov_const(Width::W64, v))
            .collect();
        let ret = ir.gen_call(func, &regs, Some(Width::W64));
        ir.gen_exit(ret.unwrap());
        let mut ctx = GuestCtx::new();
        assert_eq!(run(&ir, &mut ctx).value, want, "arity {}", args.len());
    }
}

#[test]
fn call_result_is_width_masked() {
    let mut ir = IrBuilder::new();
    let ret = ir.gen_call(fixed_value as usize as u64, &[], Some(Width::W32));
    ir.gen_exit(ret.unwrap());
    let mut ctx = GuestCtx::new();
    assert_eq!(run(&ir, &mut ctx).value, 0x9ABC_DEF0);
}

#[test]
fn conditional_exit_falls_through_when_false() {
    let mut ir = IrBuilder::new();
    let p = ir.gen_mov_const(Width::W32, 0);
    let v = ir.gen_mov_const(Width::W64, 0x1111);
    ir.gen_exit_cond(v, p);
    ir.gen_exit_const(0x2222);

    let mut ctx = GuestCtx::new();
    let res = run(&ir, &mut ctx);
    assert_eq!(res.value, 0x2222);
    assert_ne!(res.patch_site, 0);
}

#[test]
fn conditional_exit_taken_when_true() {
    let mut ir = IrBuilder::new();
    let p = ir.gen_mov_const(Width::W32, 7);
    let v = ir.gen_mov_const(Width::W64, 0x1111);
    ir.gen_exit_cond(v, p);
    ir.gen_exit_const(0x2222);

    let mut ctx = GuestCtx::new();
    assert_eq!(run(&ir, &mut ctx).value, 0x1111);
}

#[test]
fn patch_redirects_a_constant_exit() {
    let mut backend = X86_64Backend::new().unwrap();
    let mut pool = ExecPool::new(4096).unwrap();

    let mut ir = IrBuilder::new();
    ir.gen_exit_const(0x2000);
    let mut buf = CodeBuf::new();
    backend.jit(&ir, &mut buf);
    let first = pool.write(buf.as_slice());

    ir.reset();
    ir.gen_exit_const(0x3000);
    buf.clear();
    backend.jit(&ir, &mut buf);
    let second = pool.write(buf.as_slice());

    let mut ctx = GuestCtx::new();
    let ctx_ptr = &mut ctx as *mut GuestCtx as *mut u8;
    let res = unsafe { backend.execute(first, ctx_ptr) };
    assert_eq!(res.value, 0x2000);
    assert_ne!(res.patch_site, 0);
    assert!((second as u64) > res.patch_site);

    // Chain the first block to the second and run it again: control now
    // falls through the patched stub and returns the second exit.
    unsafe {
        backend.patch(res.patch_site, second as u64);
        let chained = backend.execute(first, ctx_ptr);
        assert_eq!(chained.value, 0x3000);
    }
}

#[test]
fn marker_recovery_is_a_pure_rerun() {
    let mut ir = IrBuilder::new();
    ir.gen_marker(0x1000);
    let a = ir.gen_read_ctx(Width::W64, reg_off(0));
    let b = ir.gen_mov_const(Width::W64, 5);
    let c = ir.gen_binop(BinOp::Add, a, b);
    ir.gen_marker(0x1004);
    ir.gen_write_ctx(Width::W64, c, reg_off(0));
    ir.gen_exit_const(0x1008);

    // The lowering is deterministic, so the offsets from one run govern
    // another run of the same IR.
    let mut em = X86_64Emitter;
    let mut scratch = CodeBuf::new();
    let info = lower(&mut em, &ir, &mut scratch);
    assert_eq!(info.markers.len(), 2);

    let mut backend = X86_64Backend::new().unwrap();
    for &(off, val) in &info.markers {
        assert_eq!(backend.get_marker(&ir, off), val);
        assert_eq!(backend.get_marker(&ir, off), val);
    }
    // Between the two markers the first one governs.
    let (second_off, _) = info.markers[1];
    assert_eq!(backend.get_marker(&ir, second_off - 1), 0x1000);
    assert_eq!(backend.get_marker(&ir, info.len - 1), 0x1004);
}

#[test]
fn alternate_exit_rewrites_the_saved_context() {
    let backend = X86_64Backend::new().unwrap();
    let result = ExecResult {
        value: (1 << 63) | 0x42,
        patch_site: 0,
    };
    let mut uc: libc::ucontext_t = unsafe { std::mem::zeroed() };
    unsafe {
        backend.request_alternate_exit(&mut uc as *mut _ as *mut libc::c_void, result);
    }
    let gregs = &uc.uc_mcontext.gregs;
    assert_eq!(gregs[libc::REG_RDI as usize] as u64, result.value);
    assert_eq!(gregs[libc::REG_RSI as usize], 0);
    // RIP now points at the backend's restore trampoline.
    assert_ne!(gregs[libc::REG_RIP as usize], 0);
}
