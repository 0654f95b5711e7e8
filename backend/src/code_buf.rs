/// Byte buffer the encoders emit host code into.
///
/// Plain heap memory; the translation cache copies finished blocks into
/// its executable pool. Values are emitted little-endian.
pub struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self { bytes: Vec::with_capacity(4096) }
    }

    /// Current write offset (== bytes emitted so far).
    #[inline]
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    /// Drop the contents, keeping capacity.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    // -- Emit methods --

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.bytes.push(val);
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    // -- Back-patching --

    /// Patch a u8 at an already-emitted offset (short branch targets).
    #[inline]
    pub fn patch_u8(&mut self, offset: usize, val: u8) {
        self.bytes[offset] = val;
    }

    /// Patch a u32 at an already-emitted offset.
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }
}

impl Default for CodeBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_little_endian() {
        let mut buf = CodeBuf::new();
        buf.emit_u8(0xAA);
        buf.emit_u32(0x1122_3344);
        assert_eq!(buf.as_slice(), &[0xAA, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(buf.offset(), 5);
    }

    #[test]
    fn patching_rewrites_in_place() {
        let mut buf = CodeBuf::new();
        buf.emit_u8(0x70);
        let at = buf.offset();
        buf.emit_u8(0);
        buf.emit_u8(0xC3);
        buf.patch_u8(at, 0x05);
        assert_eq!(buf.as_slice(), &[0x70, 0x05, 0xC3]);
    }

    #[test]
    fn clear_keeps_nothing() {
        let mut buf = CodeBuf::new();
        buf.emit_u64(1);
        buf.clear();
        assert_eq!(buf.offset(), 0);
        assert!(buf.as_slice().is_empty());
    }
}
