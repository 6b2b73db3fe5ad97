//! Growable machine-code buffer with forward-jump patching.

use tracing::error;

use crate::jit::memory::{ExecutableMemory, MemoryError};

/// Open rel8 displacement, produced by [`CodeBuffer::start_rel8`].
#[must_use]
pub struct Rel8(usize);

/// Open rel32 displacement, produced by [`CodeBuffer::start_rel32`].
#[must_use]
pub struct Rel32(usize);

impl Rel32 {
    /// Buffer offset of the displacement dword, for jumps resolved by the
    /// second pass instead of a bracket.
    pub fn offset(self) -> usize {
        self.0
    }
}

/// Byte buffer that generated code is assembled into.
///
/// Forward jumps are emitted as open brackets: `start_rel8` reserves the
/// displacement byte right after the caller wrote the opcode, `end_rel8`
/// closes it against the current position. A bracket that cannot be
/// encoded is a translator bug, not a recoverable condition.
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        CodeBuffer { code: Vec::new() }
    }

    /// Current length, the offset the next byte lands at.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn patch_u8(&mut self, offset: usize, value: u8) {
        self.code[offset] = value;
    }

    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.code[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    /// Reserve the displacement byte of a short jump whose opcode was just
    /// emitted.
    pub fn start_rel8(&mut self) -> Rel8 {
        let offset = self.code.len();
        self.emit_u8(0);
        Rel8(offset)
    }

    /// Point an open rel8 bracket at the current position.
    pub fn end_rel8(&mut self, bracket: Rel8) {
        let disp = self.code.len() as i64 - (bracket.0 as i64 + 1);
        if disp < i8::MIN as i64 || disp > i8::MAX as i64 {
            error!(disp, at = bracket.0, "short jump displacement out of range");
            panic!("short jump displacement out of range: {}", disp);
        }
        self.code[bracket.0] = disp as i8 as u8;
    }

    /// Reserve the displacement dword of a near jump whose opcode was just
    /// emitted.
    pub fn start_rel32(&mut self) -> Rel32 {
        let offset = self.code.len();
        self.emit_u32(0);
        Rel32(offset)
    }

    /// Point an open rel32 bracket at the current position.
    pub fn end_rel32(&mut self, bracket: Rel32) {
        let disp = self.code.len() as i64 - (bracket.0 as i64 + 4);
        self.patch_u32(bracket.0, disp as i32 as u32);
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Copy the assembled bytes into executable memory.
    pub fn finalize(&self) -> Result<ExecutableMemory, MemoryError> {
        let mut memory = ExecutableMemory::new(self.code.len())?;
        memory.write(&self.code)?;
        memory.make_executable()?;
        Ok(memory)
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_len() {
        let mut buf = CodeBuffer::new();
        assert!(buf.is_empty());
        buf.emit_u8(0x90);
        buf.emit_u16(0x0102);
        buf.emit_u32(0xAABB_CCDD);
        assert_eq!(buf.len(), 7);
        assert_eq!(buf.code(), &[0x90, 0x02, 0x01, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_rel8_bracket_patches_distance() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x74); // je
        let skip = buf.start_rel8();
        buf.emit_bytes(&[0x90, 0x90, 0x90]);
        buf.end_rel8(skip);
        assert_eq!(buf.code(), &[0x74, 0x03, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn test_rel32_bracket_patches_distance() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xE9); // jmp near
        let skip = buf.start_rel32();
        for _ in 0..300 {
            buf.emit_u8(0x90);
        }
        buf.end_rel32(skip);
        assert_eq!(buf.read_u32(1), 300);
    }

    #[test]
    #[should_panic(expected = "short jump displacement out of range")]
    fn test_rel8_bracket_overflow_panics() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xEB);
        let skip = buf.start_rel8();
        for _ in 0..200 {
            buf.emit_u8(0x90);
        }
        buf.end_rel8(skip);
    }

    #[test]
    fn test_patch_u32_round_trip() {
        let mut buf = CodeBuffer::new();
        buf.emit_u32(0);
        buf.patch_u32(0, 0x1234_5678);
        assert_eq!(buf.read_u32(0), 0x1234_5678);
    }
}
