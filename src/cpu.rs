//! Guest CPU state shared between the translator and generated code.
//!
//! The layout is fixed (`#[repr(C)]`) because generated x86 code addresses
//! individual cells with absolute 32-bit displacements. Every cell that
//! generated code touches is identified by a [`GuestAddr`], the byte offset
//! of the cell within [`CpuState`]. Offsets are stable for the lifetime of
//! the process, so they double as the register cache's identity keys.

use std::mem::offset_of;

/// CP0 Count register index.
pub const CP0_COUNT: usize = 9;
/// CP0 Status register index.
pub const CP0_STATUS: usize = 12;
/// Status bit enabling coprocessor 1.
pub const STATUS_CU1: u32 = 0x2000_0000;

/// x87 control words for the four MIPS rounding modes. Generated code
/// loads these through `fldcw` from cells whose addresses live in the
/// host map.
pub const ROUND_MODE: u16 = 0x33F;
pub const TRUNC_MODE: u16 = 0xF3F;
pub const CEIL_MODE: u16 = 0xB3F;
pub const FLOOR_MODE: u16 = 0x73F;

/// Address of a 32-bit cell, as a 32-bit value.
///
/// The accessors below produce cell offsets relative to the start of
/// [`CpuState`]; the host map rebases them onto the state block's actual
/// address before they reach the encoder. Two references to the same
/// guest storage always carry the same value, which is what lets the
/// register cache compare cached locations for equality without raw
/// pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestAddr(pub u32);

impl GuestAddr {
    /// The cell holding the upper 32 bits of the same 64-bit value.
    pub fn hi_word(self) -> GuestAddr {
        GuestAddr(self.0 + 4)
    }
}

/// R4300 core state plus the communication cells the dynarec uses to talk
/// to its out-of-line helpers.
///
/// General-purpose registers are 64-bit, stored little-endian so the low
/// word of `gpr[r]` sits at the `GuestAddr` returned by [`CpuState::gpr`].
#[repr(C)]
pub struct CpuState {
    pub gpr: [u64; 32],
    pub lo: u64,
    pub hi: u64,
    pub cp0: [u32; 32],

    /// Count value at which the next interrupt fires.
    pub next_interrupt: u32,
    /// Guest address from which the cycle counter was last advanced.
    pub last_addr: u32,
    /// Count increment per guest instruction.
    pub count_per_op: u32,
    /// Non-zero while the delay-slot instruction executes.
    pub delay_slot: u32,
    /// Boolean flag written by branch test sequences.
    pub branch_taken: u32,
    /// Guest address of the instruction the generated code is about to
    /// hand to a helper.
    pub pc: u32,
    /// Set around interpreter calls that complete a jump.
    pub dyna_interp: u32,
    /// Target passed to the re-entry helper for out-of-block jumps.
    pub jump_to_address: u32,
    /// Saved `rs` value for JR/JALR (read before the delay slot clobbers it).
    pub local_rs: u32,

    /// Effective address for a pending bus access.
    pub address: u32,
    /// Bit shift for sub-word bus accesses.
    pub shift: u32,
    /// Host address of the destination cell for a bus read.
    pub rdword: u32,
    /// Word value for a pending bus write.
    pub wword: u32,
    /// Byte-lane mask for a pending bus write.
    pub wmask: u32,
    /// Doubleword value for a pending bus write.
    pub wdword: u64,

    pub fcr0: u32,
    pub fcr31: u32,
    /// Current x87 control word, reloaded by CTC1 and after TRUNC.
    pub rounding_mode: u32,

    /// Host addresses of the 32 single-precision register views.
    pub cp1_simple: [u32; 32],
    /// Host addresses of the 32 double-precision register views.
    pub cp1_double: [u32; 32],
    pub fpr: [u64; 32],
}

impl CpuState {
    pub fn new() -> Self {
        let mut state = CpuState {
            gpr: [0; 32],
            lo: 0,
            hi: 0,
            cp0: [0; 32],
            next_interrupt: 0,
            last_addr: 0,
            count_per_op: 2,
            delay_slot: 0,
            branch_taken: 0,
            pc: 0,
            dyna_interp: 0,
            jump_to_address: 0,
            local_rs: 0,
            address: 0,
            shift: 0,
            rdword: 0,
            wword: 0,
            wmask: 0,
            wdword: 0,
            fcr0: 0,
            fcr31: 0,
            rounding_mode: ROUND_MODE as u32,
            cp1_simple: [0; 32],
            cp1_double: [0; 32],
            fpr: [0; 32],
        };
        state.link_fpr_pointers(true);
        state
    }

    /// Point the CP1 register views at the FPR backing store.
    ///
    /// With the Status FR bit clear the R4300 exposes 16 doubles aliased
    /// over even/odd single pairs; with it set all 32 registers are
    /// independent. The stored values are host addresses, meaningful to
    /// generated code on a 32-bit host only.
    pub fn link_fpr_pointers(&mut self, full_mode: bool) {
        for i in 0..32 {
            let double_base = if full_mode { i } else { i & !1 };
            self.cp1_double[i] = &self.fpr[double_base] as *const u64 as usize as u32;
            self.cp1_simple[i] = if full_mode {
                &self.fpr[i] as *const u64 as usize as u32
            } else {
                let lo = &self.fpr[i & !1] as *const u64 as usize as u32;
                lo + ((i as u32 & 1) * 4)
            };
        }
    }

    /// Host address of the state block, as embedded into generated code.
    pub fn base_addr(&self) -> u32 {
        self as *const CpuState as usize as u32
    }

    /// Cell holding the low word of general-purpose register `r`.
    pub fn gpr(r: usize) -> GuestAddr {
        GuestAddr((offset_of!(CpuState, gpr) + r * 8) as u32)
    }

    pub fn lo_reg() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, lo) as u32)
    }

    pub fn hi_reg() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, hi) as u32)
    }

    pub fn cp0_reg(r: usize) -> GuestAddr {
        GuestAddr((offset_of!(CpuState, cp0) + r * 4) as u32)
    }

    pub fn next_interrupt_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, next_interrupt) as u32)
    }

    pub fn last_addr_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, last_addr) as u32)
    }

    pub fn count_per_op_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, count_per_op) as u32)
    }

    pub fn delay_slot_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, delay_slot) as u32)
    }

    pub fn branch_taken_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, branch_taken) as u32)
    }

    pub fn pc_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, pc) as u32)
    }

    pub fn dyna_interp_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, dyna_interp) as u32)
    }

    pub fn jump_to_address_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, jump_to_address) as u32)
    }

    pub fn local_rs_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, local_rs) as u32)
    }

    pub fn address_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, address) as u32)
    }

    pub fn shift_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, shift) as u32)
    }

    pub fn rdword_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, rdword) as u32)
    }

    pub fn wword_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, wword) as u32)
    }

    pub fn wmask_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, wmask) as u32)
    }

    pub fn wdword_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, wdword) as u32)
    }

    pub fn fcr0_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, fcr0) as u32)
    }

    pub fn fcr31_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, fcr31) as u32)
    }

    pub fn rounding_mode_cell() -> GuestAddr {
        GuestAddr(offset_of!(CpuState, rounding_mode) as u32)
    }

    pub fn cp1_simple_ptr(r: usize) -> GuestAddr {
        GuestAddr((offset_of!(CpuState, cp1_simple) + r * 4) as u32)
    }

    pub fn cp1_double_ptr(r: usize) -> GuestAddr {
        GuestAddr((offset_of!(CpuState, cp1_double) + r * 4) as u32)
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_cells_are_eight_bytes_apart() {
        assert_eq!(CpuState::gpr(0).0, 0);
        assert_eq!(CpuState::gpr(1).0, 8);
        assert_eq!(CpuState::gpr(31).0, 248);
        assert_eq!(CpuState::gpr(3).hi_word().0, CpuState::gpr(3).0 + 4);
    }

    #[test]
    fn test_wdword_cell_is_eight_byte_aligned() {
        assert_eq!(CpuState::wdword_cell().0 % 8, 0);
    }

    #[test]
    fn test_gpr_low_word_matches_little_endian_layout() {
        let mut state = CpuState::new();
        state.gpr[5] = 0x1122_3344_5566_7788;
        let base = &state as *const CpuState as *const u8;
        let lo = unsafe {
            std::ptr::read_unaligned(base.add(CpuState::gpr(5).0 as usize) as *const u32)
        };
        assert_eq!(lo, 0x5566_7788);
    }

    #[test]
    fn test_double_views_alias_pairs_in_half_mode() {
        let mut state = CpuState::new();
        state.link_fpr_pointers(false);
        assert_eq!(state.cp1_double[3], state.cp1_double[2]);
        assert_eq!(state.cp1_simple[3], state.cp1_simple[2] + 4);
    }
}
