//! Addresses of everything generated code touches outside its own block.
//!
//! The translator runs on a 32-bit host, so every collaborator (guest
//! state block, RDRAM, lookup tables, out-of-line helpers) is identified
//! by a plain 32-bit address baked into the emitted instructions. Helpers
//! are `extern "C" fn(ctx: u32)`: generated code pushes `ctx` as the one
//! cdecl argument and pops it after the call.

use crate::cpu::{CpuState, GuestAddr};

/// Collaborator address table for one translation session.
#[derive(Debug, Clone)]
pub struct HostMap {
    /// Base of the [`CpuState`] block.
    pub state: u32,
    /// Base of RDRAM (8 MiB, byte-swapped word layout).
    pub rdram: u32,
    /// Byte-per-4KiB-page table; a non-zero byte marks translated code on
    /// that page as stale.
    pub invalid_code: u32,
    /// Table of per-page block pointers, indexed by guest page.
    pub blocks: u32,
    /// Cell holding the current block's code base address.
    pub code_cell: u32,
    /// Per-instruction entry-offset table for the current block (one u32
    /// per guest instruction: wrapper offset when the entry needs
    /// reconciliation, plain code offset otherwise).
    pub entry_table: u32,

    /// Bus access helpers. The pending-access cells in `CpuState` carry
    /// their operands.
    pub read_word: u32,
    pub read_dword: u32,
    pub write_word: u32,
    pub write_dword: u32,
    /// Read handler table: three words per 8 KiB region, handler first.
    pub read32_table: u32,
    /// The RDRAM read handler; matching it selects the inline fast path.
    pub read_rdram: u32,
    pub write32_table: u32,
    pub write_rdram: u32,

    /// Raises the pending interrupt once Count passes the threshold.
    pub gen_interrupt: u32,
    /// Re-enters translation at the guest address in `jump_to_address`.
    pub jump_to_recomp: u32,
    /// Continues execution after an interpreter-completed jump.
    pub dyna_jump: u32,
    /// Interprets the single instruction addressed by the pc cell.
    pub interp_op: u32,
    /// Raises the coprocessor-unusable exception.
    pub check_cop1: u32,
    /// Hands control back when execution falls off the end of a block.
    pub fin_block: u32,

    /// Opaque context argument handed to every helper.
    pub ctx: u32,

    /// x87 control word holding the truncate rounding mode.
    pub trunc_mode: u32,
}

impl HostMap {
    /// Rebase a state-relative cell onto the state block's address.
    pub fn cell(&self, offset: GuestAddr) -> GuestAddr {
        GuestAddr(self.state.wrapping_add(offset.0))
    }

    /// Low word of guest register `r`.
    pub fn gpr(&self, r: usize) -> GuestAddr {
        self.cell(CpuState::gpr(r))
    }

    /// A table with distinct synthetic addresses, for tests that inspect
    /// emitted bytes without executing them.
    pub fn synthetic() -> HostMap {
        HostMap {
            state: 0,
            rdram: 0x0100_0000,
            invalid_code: 0x0200_0000,
            blocks: 0x0210_0000,
            code_cell: 0x0220_0000,
            entry_table: 0x0230_0000,
            read_word: 0x0300_0000,
            read_dword: 0x0300_0010,
            write_word: 0x0300_0020,
            write_dword: 0x0300_0030,
            read32_table: 0x0400_0000,
            read_rdram: 0x0500_0000,
            write32_table: 0x0400_8000,
            write_rdram: 0x0500_0010,
            gen_interrupt: 0x0600_0000,
            jump_to_recomp: 0x0600_0010,
            dyna_jump: 0x0600_0020,
            interp_op: 0x0600_0030,
            check_cop1: 0x0600_0040,
            fin_block: 0x0600_0050,
            ctx: 0x0700_0000,
            trunc_mode: 0x0800_0000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_rebasing() {
        let mut map = HostMap::synthetic();
        map.state = 0x1000;
        assert_eq!(map.gpr(0).0, 0x1000);
        assert_eq!(map.gpr(2).0, 0x1010);
        assert_eq!(
            map.cell(CpuState::pc_cell()).0,
            0x1000 + CpuState::pc_cell().0
        );
    }
}
