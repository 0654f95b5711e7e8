//! Host helper functions reachable from generated code.
//!
//! The i386 emitter routes 64-bit shifts and rotates through these via
//! the normal helper-call path; counts are taken modulo 64 to match the
//! hardware behavior of the 64-bit backend.

pub extern "C" fn shl64(v: u64, n: u64) -> u64 {
    v << (n & 63)
}

pub extern "C" fn shr64(v: u64, n: u64) -> u64 {
    v >> (n & 63)
}

pub extern "C" fn asr64(v: u64, n: u64) -> u64 {
    ((v as i64) >> (n & 63)) as u64
}

pub extern "C" fn ror64(v: u64, n: u64) -> u64 {
    v.rotate_right((n & 63) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifts_mask_their_count() {
        assert_eq!(shl64(1, 65), 2);
        assert_eq!(shr64(4, 66), 1);
    }

    #[test]
    fn asr_fills_with_sign() {
        assert_eq!(asr64(0x8000_0000_0000_0000, 63), u64::MAX);
        assert_eq!(asr64(0x4000_0000_0000_0000, 62), 1);
    }

    #[test]
    fn ror_rotates() {
        assert_eq!(ror64(0x1, 1), 0x8000_0000_0000_0000);
        assert_eq!(ror64(0xABCD, 64), 0xABCD);
    }
}
