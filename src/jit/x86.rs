//! x86-32 instruction encoder.
//!
//! Thin, stateless layer over [`CodeBuffer`]: every method appends the
//! encoding of exactly one instruction. Absolute-address operands
//! (`m32abs`) use the ModRM mod=00 r/m=101 disp32 form throughout, so the
//! generated code is position-independent only in its jumps, never in its
//! data references.

use crate::cpu::GuestAddr;
use crate::jit::codebuf::{CodeBuffer, Rel8, Rel32};

/// General-purpose registers, in encoding order. `Esp` is never handed
/// out by the register cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Reg {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: usize) -> Reg {
        match index {
            0 => Reg::Eax,
            1 => Reg::Ecx,
            2 => Reg::Edx,
            3 => Reg::Ebx,
            4 => Reg::Esp,
            5 => Reg::Ebp,
            6 => Reg::Esi,
            _ => Reg::Edi,
        }
    }
}

/// Condition codes (the `tttn` field of Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

pub struct X86Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        X86Assembler { buf }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        (mode << 6) | (reg << 3) | rm
    }

    /// mod=00 r/m=101: absolute disp32 operand.
    fn emit_abs(&mut self, reg: u8, addr: GuestAddr) {
        self.buf.emit_u8(Self::modrm(0, reg, 5));
        self.buf.emit_u32(addr.0);
    }

    /// mod=10 [base + disp32] operand.
    fn emit_base_disp(&mut self, reg: u8, base: Reg, disp: u32) {
        self.buf.emit_u8(Self::modrm(2, reg, base.code()));
        self.buf.emit_u32(disp);
    }

    // ==================== Moves ====================

    pub fn mov_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.buf.emit_u8(0xB8 + dst.code()); // MOV r32, imm32
        self.buf.emit_u32(imm);
    }

    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.buf.emit_u8(0x8B); // MOV r32, r/m32
        self.buf.emit_u8(Self::modrm(3, dst.code(), src.code()));
    }

    pub fn mov_reg_m32abs(&mut self, dst: Reg, addr: GuestAddr) {
        self.buf.emit_u8(0x8B);
        self.emit_abs(dst.code(), addr);
    }

    pub fn mov_m32abs_reg(&mut self, addr: GuestAddr, src: Reg) {
        self.buf.emit_u8(0x89); // MOV r/m32, r32
        self.emit_abs(src.code(), addr);
    }

    pub fn mov_m32abs_imm32(&mut self, addr: GuestAddr, imm: u32) {
        self.buf.emit_u8(0xC7); // MOV r/m32, imm32
        self.emit_abs(0, addr);
        self.buf.emit_u32(imm);
    }

    pub fn mov_reg8_m8abs(&mut self, dst: Reg, addr: GuestAddr) {
        self.buf.emit_u8(0x8A); // MOV r8, r/m8
        self.emit_abs(dst.code(), addr);
    }

    pub fn mov_reg16_m16abs(&mut self, dst: Reg, addr: GuestAddr) {
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x8B);
        self.emit_abs(dst.code(), addr);
    }

    /// MOV r32, [base + disp32]
    pub fn mov_reg_base_disp(&mut self, dst: Reg, base: Reg, disp: u32) {
        self.buf.emit_u8(0x8B);
        self.emit_base_disp(dst.code(), base, disp);
    }

    /// MOV [base + disp32], r32
    pub fn mov_base_disp_reg(&mut self, base: Reg, disp: u32, src: Reg) {
        self.buf.emit_u8(0x89);
        self.emit_base_disp(src.code(), base, disp);
    }

    /// MOV [base + disp32], r8
    pub fn mov_base_disp_reg8(&mut self, base: Reg, disp: u32, src: Reg) {
        self.buf.emit_u8(0x88);
        self.emit_base_disp(src.code(), base, disp);
    }

    /// MOV [base + disp32], r16
    pub fn mov_base_disp_reg16(&mut self, base: Reg, disp: u32, src: Reg) {
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x89);
        self.emit_base_disp(src.code(), base, disp);
    }

    /// MOV r32, [index*4 + disp32]
    pub fn mov_reg_index4_disp(&mut self, dst: Reg, index: Reg, disp: u32) {
        self.buf.emit_u8(0x8B);
        self.buf.emit_u8(Self::modrm(0, dst.code(), 4));
        self.buf.emit_u8((2 << 6) | (index.code() << 3) | 5); // SIB scale=4, base=disp32
        self.buf.emit_u32(disp);
    }

    pub fn movsx_reg_m8abs(&mut self, dst: Reg, addr: GuestAddr) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE); // MOVSX r32, r/m8
        self.emit_abs(dst.code(), addr);
    }

    pub fn movsx_reg_m16abs(&mut self, dst: Reg, addr: GuestAddr) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF); // MOVSX r32, r/m16
        self.emit_abs(dst.code(), addr);
    }

    pub fn movsx_reg_m8_base_disp(&mut self, dst: Reg, base: Reg, disp: u32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE);
        self.emit_base_disp(dst.code(), base, disp);
    }

    pub fn movsx_reg_m16_base_disp(&mut self, dst: Reg, base: Reg, disp: u32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF);
        self.emit_base_disp(dst.code(), base, disp);
    }

    pub fn movzx_reg_m8_base_disp(&mut self, dst: Reg, base: Reg, disp: u32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6); // MOVZX r32, r/m8
        self.emit_base_disp(dst.code(), base, disp);
    }

    pub fn movzx_reg_m16_base_disp(&mut self, dst: Reg, base: Reg, disp: u32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB7); // MOVZX r32, r/m16
        self.emit_base_disp(dst.code(), base, disp);
    }

    /// LEA r32, [base + index*2]
    pub fn lea_reg_base_index2(&mut self, dst: Reg, base: Reg, index: Reg) {
        self.buf.emit_u8(0x8D);
        self.buf.emit_u8(Self::modrm(0, dst.code(), 4));
        self.buf.emit_u8((1 << 6) | (index.code() << 3) | base.code());
    }

    // ==================== Arithmetic and logic ====================

    fn alu_reg_reg(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(3, src.code(), dst.code()));
    }

    fn alu_reg_imm32(&mut self, digit: u8, dst: Reg, imm: u32) {
        self.buf.emit_u8(0x81);
        self.buf.emit_u8(Self::modrm(3, digit, dst.code()));
        self.buf.emit_u32(imm);
    }

    pub fn add_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x01, dst, src);
    }

    pub fn adc_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x11, dst, src);
    }

    pub fn sub_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x29, dst, src);
    }

    pub fn sbb_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x19, dst, src);
    }

    pub fn and_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x21, dst, src);
    }

    pub fn or_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x09, dst, src);
    }

    pub fn xor_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x31, dst, src);
    }

    pub fn cmp_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x39, dst, src);
    }

    pub fn test_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x85, dst, src);
    }

    pub fn add_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.alu_reg_imm32(0, dst, imm);
    }

    pub fn adc_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.alu_reg_imm32(2, dst, imm);
    }

    pub fn sub_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.alu_reg_imm32(5, dst, imm);
    }

    pub fn and_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.alu_reg_imm32(4, dst, imm);
    }

    pub fn or_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.alu_reg_imm32(1, dst, imm);
    }

    pub fn xor_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.alu_reg_imm32(6, dst, imm);
    }

    pub fn cmp_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.alu_reg_imm32(7, dst, imm);
    }

    pub fn xor_reg8_imm8(&mut self, dst: Reg, imm: u8) {
        self.buf.emit_u8(0x80);
        self.buf.emit_u8(Self::modrm(3, 6, dst.code()));
        self.buf.emit_u8(imm);
    }

    pub fn test_reg_imm32(&mut self, dst: Reg, imm: u32) {
        self.buf.emit_u8(0xF7); // TEST r/m32, imm32
        self.buf.emit_u8(Self::modrm(3, 0, dst.code()));
        self.buf.emit_u32(imm);
    }

    pub fn test_m32abs_imm32(&mut self, addr: GuestAddr, imm: u32) {
        self.buf.emit_u8(0xF7);
        self.emit_abs(0, addr);
        self.buf.emit_u32(imm);
    }

    pub fn cmp_reg_m32abs(&mut self, dst: Reg, addr: GuestAddr) {
        self.buf.emit_u8(0x3B); // CMP r32, r/m32
        self.emit_abs(dst.code(), addr);
    }

    pub fn cmp_m32abs_imm32(&mut self, addr: GuestAddr, imm: u32) {
        self.buf.emit_u8(0x81);
        self.emit_abs(7, addr);
        self.buf.emit_u32(imm);
    }

    /// CMP byte [base + disp32], imm8
    pub fn cmp_m8_base_disp_imm8(&mut self, base: Reg, disp: u32, imm: u8) {
        self.buf.emit_u8(0x80);
        self.emit_base_disp(7, base, disp);
        self.buf.emit_u8(imm);
    }

    /// MOV byte [base + disp32], imm8
    pub fn mov_m8_base_disp_imm8(&mut self, base: Reg, disp: u32, imm: u8) {
        self.buf.emit_u8(0xC6);
        self.emit_base_disp(0, base, disp);
        self.buf.emit_u8(imm);
    }

    pub fn add_m32abs_reg(&mut self, addr: GuestAddr, src: Reg) {
        self.buf.emit_u8(0x01); // ADD r/m32, r32
        self.emit_abs(src.code(), addr);
    }

    pub fn sub_reg_m32abs(&mut self, dst: Reg, addr: GuestAddr) {
        self.buf.emit_u8(0x2B); // SUB r32, r/m32
        self.emit_abs(dst.code(), addr);
    }

    pub fn add_reg_m32abs(&mut self, dst: Reg, addr: GuestAddr) {
        self.buf.emit_u8(0x03); // ADD r32, r/m32
        self.emit_abs(dst.code(), addr);
    }

    pub fn not_reg(&mut self, dst: Reg) {
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(3, 2, dst.code()));
    }

    pub fn neg_reg(&mut self, dst: Reg) {
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(3, 3, dst.code()));
    }

    // ==================== Shifts ====================

    fn shift_reg_imm8(&mut self, digit: u8, dst: Reg, amount: u8) {
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(3, digit, dst.code()));
        self.buf.emit_u8(amount);
    }

    fn shift_reg_cl(&mut self, digit: u8, dst: Reg) {
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(3, digit, dst.code()));
    }

    pub fn shl_reg_imm8(&mut self, dst: Reg, amount: u8) {
        self.shift_reg_imm8(4, dst, amount);
    }

    pub fn shr_reg_imm8(&mut self, dst: Reg, amount: u8) {
        self.shift_reg_imm8(5, dst, amount);
    }

    pub fn sar_reg_imm8(&mut self, dst: Reg, amount: u8) {
        self.shift_reg_imm8(7, dst, amount);
    }

    pub fn shl_reg_cl(&mut self, dst: Reg) {
        self.shift_reg_cl(4, dst);
    }

    pub fn shr_reg_cl(&mut self, dst: Reg) {
        self.shift_reg_cl(5, dst);
    }

    pub fn sar_reg_cl(&mut self, dst: Reg) {
        self.shift_reg_cl(7, dst);
    }

    /// SHLD r/m32, r32, imm8
    pub fn shld_reg_reg_imm8(&mut self, dst: Reg, src: Reg, amount: u8) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xA4);
        self.buf.emit_u8(Self::modrm(3, src.code(), dst.code()));
        self.buf.emit_u8(amount);
    }

    pub fn shld_reg_reg_cl(&mut self, dst: Reg, src: Reg) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xA5);
        self.buf.emit_u8(Self::modrm(3, src.code(), dst.code()));
    }

    /// SHRD r/m32, r32, imm8
    pub fn shrd_reg_reg_imm8(&mut self, dst: Reg, src: Reg, amount: u8) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAC);
        self.buf.emit_u8(Self::modrm(3, src.code(), dst.code()));
        self.buf.emit_u8(amount);
    }

    pub fn shrd_reg_reg_cl(&mut self, dst: Reg, src: Reg) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAD);
        self.buf.emit_u8(Self::modrm(3, src.code(), dst.code()));
    }

    // ==================== Multiply / divide ====================

    pub fn mul_reg(&mut self, src: Reg) {
        self.buf.emit_u8(0xF7); // MUL r/m32
        self.buf.emit_u8(Self::modrm(3, 4, src.code()));
    }

    pub fn imul_reg(&mut self, src: Reg) {
        self.buf.emit_u8(0xF7); // IMUL r/m32
        self.buf.emit_u8(Self::modrm(3, 5, src.code()));
    }

    pub fn div_reg(&mut self, src: Reg) {
        self.buf.emit_u8(0xF7); // DIV r/m32
        self.buf.emit_u8(Self::modrm(3, 6, src.code()));
    }

    pub fn idiv_reg(&mut self, src: Reg) {
        self.buf.emit_u8(0xF7); // IDIV r/m32
        self.buf.emit_u8(Self::modrm(3, 7, src.code()));
    }

    pub fn mul_m32abs(&mut self, addr: GuestAddr) {
        self.buf.emit_u8(0xF7);
        self.emit_abs(4, addr);
    }

    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    // ==================== Control flow ====================

    /// Jcc rel8, returning the open displacement bracket.
    pub fn jcc_rel8(&mut self, cond: Cond) -> Rel8 {
        self.buf.emit_u8(0x70 + cond as u8);
        self.buf.start_rel8()
    }

    /// Jcc rel32, returning the open displacement bracket.
    pub fn jcc_rel32(&mut self, cond: Cond) -> Rel32 {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.start_rel32()
    }

    pub fn jmp_rel8(&mut self) -> Rel8 {
        self.buf.emit_u8(0xEB);
        self.buf.start_rel8()
    }

    /// JMP rel32 with a zero displacement; the caller patches it (either
    /// as a bracket or through the jump table).
    pub fn jmp_rel32(&mut self) -> Rel32 {
        self.buf.emit_u8(0xE9);
        self.buf.start_rel32()
    }

    pub fn jmp_reg(&mut self, target: Reg) {
        self.buf.emit_u8(0xFF); // JMP r/m32
        self.buf.emit_u8(Self::modrm(3, 4, target.code()));
    }

    pub fn call_reg(&mut self, target: Reg) {
        self.buf.emit_u8(0xFF); // CALL r/m32
        self.buf.emit_u8(Self::modrm(3, 2, target.code()));
    }

    pub fn push_imm32(&mut self, imm: u32) {
        self.buf.emit_u8(0x68);
        self.buf.emit_u32(imm);
    }

    pub fn push_reg(&mut self, reg: Reg) {
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        self.buf.emit_u8(0x58 + reg.code());
    }

    pub fn add_esp_imm8(&mut self, amount: u8) {
        self.buf.emit_u8(0x83);
        self.buf.emit_u8(Self::modrm(3, 0, Reg::Esp.code()));
        self.buf.emit_u8(amount);
    }

    pub fn sub_esp_imm8(&mut self, amount: u8) {
        self.buf.emit_u8(0x83);
        self.buf.emit_u8(Self::modrm(3, 5, Reg::Esp.code()));
        self.buf.emit_u8(amount);
    }

    /// MOV [esp], r32
    pub fn mov_esp_reg(&mut self, src: Reg) {
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0, src.code(), 4));
        self.buf.emit_u8(0x24); // SIB: base=esp
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    // ==================== x87 ====================

    fn x87_at_reg(&mut self, opcode: u8, digit: u8, at: Reg) {
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0, digit, at.code()));
    }

    pub fn fld_m32_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xD9, 0, at); // FLD m32fp
    }

    pub fn fld_m64_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xDD, 0, at); // FLD m64fp
    }

    pub fn fstp_m32_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xD9, 3, at); // FSTP m32fp
    }

    pub fn fstp_m64_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xDD, 3, at); // FSTP m64fp
    }

    pub fn fadd_m32_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xD8, 0, at);
    }

    pub fn fadd_m64_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xDC, 0, at);
    }

    pub fn fmul_m32_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xD8, 1, at);
    }

    pub fn fmul_m64_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xDC, 1, at);
    }

    pub fn fsub_m32_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xD8, 4, at);
    }

    pub fn fsub_m64_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xDC, 4, at);
    }

    pub fn fdiv_m32_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xD8, 6, at);
    }

    pub fn fdiv_m64_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xDC, 6, at);
    }

    pub fn fild_m32_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xDB, 0, at); // FILD m32int
    }

    pub fn fistp_m32_at_reg(&mut self, at: Reg) {
        self.x87_at_reg(0xDB, 3, at); // FISTP m32int
    }

    pub fn fchs(&mut self) {
        self.buf.emit_u8(0xD9);
        self.buf.emit_u8(0xE0);
    }

    pub fn fabs(&mut self) {
        self.buf.emit_u8(0xD9);
        self.buf.emit_u8(0xE1);
    }

    pub fn fsqrt(&mut self) {
        self.buf.emit_u8(0xD9);
        self.buf.emit_u8(0xFA);
    }

    pub fn fldcw_m16abs(&mut self, addr: GuestAddr) {
        self.buf.emit_u8(0xD9); // FLDCW m16
        self.emit_abs(5, addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(f: impl FnOnce(&mut X86Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut a = X86Assembler::new(&mut buf);
        f(&mut a);
        buf.code().to_vec()
    }

    #[test]
    fn test_mov_reg_imm32() {
        assert_eq!(
            asm(|a| a.mov_reg_imm32(Reg::Ebx, 0x1234_5678)),
            vec![0xBB, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_mov_abs_forms() {
        let addr = GuestAddr(0x100);
        assert_eq!(
            asm(|a| a.mov_reg_m32abs(Reg::Ecx, addr)),
            vec![0x8B, 0x0D, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            asm(|a| a.mov_m32abs_reg(addr, Reg::Ecx)),
            vec![0x89, 0x0D, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            asm(|a| a.mov_m32abs_imm32(addr, 1)),
            vec![0xC7, 0x05, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_alu_reg_reg_direction() {
        // add ebx, ecx encodes source in the reg field
        assert_eq!(asm(|a| a.add_reg_reg(Reg::Ebx, Reg::Ecx)), vec![0x01, 0xCB]);
        assert_eq!(asm(|a| a.sbb_reg_reg(Reg::Eax, Reg::Edx)), vec![0x19, 0xD0]);
    }

    #[test]
    fn test_alu_imm_digits() {
        assert_eq!(
            asm(|a| a.cmp_reg_imm32(Reg::Esi, 5)),
            vec![0x81, 0xFE, 0x05, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            asm(|a| a.and_reg_imm32(Reg::Eax, 0xFFF)),
            vec![0x81, 0xE0, 0xFF, 0x0F, 0x00, 0x00]
        );
    }

    #[test]
    fn test_shifts() {
        assert_eq!(asm(|a| a.sar_reg_imm8(Reg::Edx, 31)), vec![0xC1, 0xFA, 0x1F]);
        assert_eq!(asm(|a| a.shr_reg_cl(Reg::Eax)), vec![0xD3, 0xE8]);
        assert_eq!(
            asm(|a| a.shld_reg_reg_imm8(Reg::Edx, Reg::Eax, 4)),
            vec![0x0F, 0xA4, 0xC2, 0x04]
        );
    }

    #[test]
    fn test_jcc_rel8_bracket() {
        let mut buf = CodeBuffer::new();
        let mut a = X86Assembler::new(&mut buf);
        let skip = a.jcc_rel8(Cond::Ne);
        a.int3();
        buf.end_rel8(skip);
        assert_eq!(buf.code(), &[0x75, 0x01, 0xCC]);
    }

    #[test]
    fn test_call_through_reg() {
        assert_eq!(asm(|a| a.call_reg(Reg::Eax)), vec![0xFF, 0xD0]);
        assert_eq!(asm(|a| a.jmp_reg(Reg::Ebx)), vec![0xFF, 0xE3]);
    }

    #[test]
    fn test_sib_index_load() {
        // mov eax, [eax*4 + 0x2000]
        assert_eq!(
            asm(|a| a.mov_reg_index4_disp(Reg::Eax, Reg::Eax, 0x2000)),
            vec![0x8B, 0x04, 0x85, 0x00, 0x20, 0x00, 0x00]
        );
    }

    #[test]
    fn test_x87_forms() {
        assert_eq!(asm(|a| a.fld_m64_at_reg(Reg::Eax)), vec![0xDD, 0x00]);
        assert_eq!(asm(|a| a.fstp_m32_at_reg(Reg::Ebx)), vec![0xD9, 0x1B]);
        assert_eq!(
            asm(|a| a.fldcw_m16abs(GuestAddr(0x40))),
            vec![0xD9, 0x2D, 0x40, 0x00, 0x00, 0x00]
        );
        assert_eq!(asm(|a| a.fsqrt()), vec![0xD9, 0xFA]);
    }

    #[test]
    fn test_wrapper_stub_forms() {
        assert_eq!(asm(|a| a.sub_esp_imm8(4)), vec![0x83, 0xEC, 0x04]);
        assert_eq!(asm(|a| a.mov_esp_reg(Reg::Eax)), vec![0x89, 0x04, 0x24]);
        assert_eq!(asm(|a| a.ret()), vec![0xC3]);
    }
}
