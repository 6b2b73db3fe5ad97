//! Basic-block translation driver.
//!
//! A [`BlockCompiler`] walks the instruction words of one block, hands
//! each decoded instruction to its generator through the dispatch table,
//! and stitches the results together: delay slots are folded into their
//! branch, the register cache is flushed at control-flow edges, and the
//! finished buffer gets its reconciliation wrappers and resolved in-block
//! jumps appended in a second pass.

use tracing::{debug, trace};

use crate::config::JitConfig;
use crate::cpu::GuestAddr;
use crate::jit::codebuf::CodeBuffer;
use crate::jit::dispatch::DispatchTable;
use crate::jit::linker::{build_wrappers, entry_offsets, Linker};
use crate::jit::memory::{ExecutableMemory, MemoryError};
use crate::jit::regcache::RegCache;
use crate::jit::runtime::HostMap;
use crate::jit::x86::Reg;
use crate::mips::{decode, BlockWindow, Insn, Opcode};

/// Finished translation of one block.
pub struct CompiledBlock {
    pub start: u32,
    pub end: u32,
    pub code: Vec<u8>,
    pub insns: Vec<Insn>,
    /// Per-instruction entry offsets relative to the code base. Register
    /// jumps that stay inside the block dispatch through this table.
    pub entry_offsets: Vec<u32>,
}

impl CompiledBlock {
    /// Entry offset for the instruction at `addr`, if it was translated.
    pub fn entry_offset(&self, addr: u32) -> Option<u32> {
        if addr < self.start || (addr - self.start) % 4 != 0 {
            return None;
        }
        self.entry_offsets
            .get(((addr - self.start) / 4) as usize)
            .copied()
    }

    /// Copy the generated code into executable memory.
    pub fn finalize(&self) -> Result<ExecutableMemory, MemoryError> {
        let mut memory = ExecutableMemory::new(self.code.len())?;
        memory.write(&self.code)?;
        memory.make_executable()?;
        Ok(memory)
    }
}

pub struct BlockCompiler<'a> {
    pub(crate) cfg: &'a JitConfig,
    pub(crate) map: &'a HostMap,
    pub(crate) dispatch: &'a DispatchTable,
    pub(crate) buf: CodeBuffer,
    pub(crate) regs: RegCache,
    pub(crate) linker: Linker,
    pub(crate) insns: Vec<Insn>,
    pub(crate) idx: usize,
    pub(crate) window: BlockWindow,
    pub(crate) delay_slot_compiled: u32,
    word_count: usize,
}

impl<'a> BlockCompiler<'a> {
    pub fn new(
        cfg: &'a JitConfig,
        map: &'a HostMap,
        dispatch: &'a DispatchTable,
        words: &[u32],
        start: u32,
    ) -> Self {
        let length = words.len();
        let window = BlockWindow {
            start,
            end: start.wrapping_add((length as u32) * 4),
        };
        // Translation may run past the last word (overshoot bound plus the
        // two landing pads); decode the overrun region as zero words.
        let capacity = length.max(Self::overshoot_bound(length)) + 3;
        let insns = (0..capacity)
            .map(|i| {
                let iw = words.get(i).copied().unwrap_or(0);
                let next_iw = words.get(i + 1).copied().unwrap_or(0);
                decode(iw, next_iw, start.wrapping_add((i as u32) * 4), &window, false)
            })
            .collect();

        BlockCompiler {
            cfg,
            map,
            dispatch,
            buf: CodeBuffer::new(),
            regs: RegCache::new(map.gpr(0)),
            linker: Linker::new(),
            insns,
            idx: 0,
            window,
            delay_slot_compiled: 0,
            word_count: length,
        }
    }

    /// How far linear translation may run past the block's nominal length
    /// before it is cut off.
    fn overshoot_bound(length: usize) -> usize {
        (length + (length >> 2)).saturating_sub(2)
    }

    pub fn compile(mut self) -> CompiledBlock {
        let length = self.word_count;
        let bound = Self::overshoot_bound(length);
        let start = self.window.start;
        let unmapped = start >= 0xC000_0000 || self.window.end < 0x8000_0000;

        self.regs.init(0);
        self.linker.clear();

        let mut i = 0usize;
        let mut finished = 0u8;
        while finished != 2 {
            self.idx = i;
            self.insns[i].local_addr = self.buf.len() as u32;
            self.insns[i].need_map = false;
            let op = self.insns[i].opcode;
            trace!(addr = format_args!("{:08x}", self.insns[i].addr), ?op, "translating");

            (self.dispatch.entry(op))(&mut self);

            if self.delay_slot_compiled > 0 {
                self.delay_slot_compiled -= 1;
                self.free_all();
            }

            if i >= bound {
                finished = 2;
            }
            if i + 1 >= length && (start == 0xa400_0000 || unmapped) {
                finished = 2;
            }
            if op == Opcode::Eret || finished == 1 {
                finished = 2;
            }
            if matches!(op, Opcode::J | Opcode::JOut | Opcode::Jr)
                && !(i + 1 >= length && unmapped)
            {
                finished = 1;
            }
            i += 1;
        }

        if i >= length {
            // Landing pads: linear execution off the end of the block
            // hands control back. The second pad catches a branch target
            // one slot further out.
            self.idx = i;
            self.insns[i].local_addr = self.buf.len() as u32;
            self.gen_fin_block();
            i += 1;
            if i <= bound {
                self.idx = i;
                self.insns[i].local_addr = self.buf.len() as u32;
                self.gen_fin_block();
                i += 1;
            }
        } else {
            self.gen_link_subblock();
        }
        self.free_all();

        // Resolve against the padded table first: a fall-through link off
        // the final instruction lands on a padding entry at offset zero.
        build_wrappers(&mut self.buf, &mut self.insns, self.map);
        self.linker.resolve(&mut self.buf, &self.insns, start);
        self.insns.truncate(i);
        let entries = entry_offsets(&self.insns);

        debug!(
            start = format_args!("{:08x}", start),
            insns = i,
            bytes = self.buf.len(),
            "block translated"
        );

        CompiledBlock {
            start,
            end: self.window.end,
            code: self.buf.code().to_vec(),
            insns: self.insns,
            entry_offsets: entries,
        }
    }

    // ==================== Register cache shorthands ====================

    pub(crate) fn alloc(&mut self, addr: GuestAddr) -> Reg {
        self.regs
            .allocate(&mut self.buf, &mut self.insns, self.idx, Some(addr))
    }

    pub(crate) fn alloc_w(&mut self, addr: GuestAddr) -> Reg {
        self.regs.allocate_w(&mut self.buf, &mut self.insns, self.idx, addr)
    }

    pub(crate) fn alloc64_lo(&mut self, addr: GuestAddr) -> Reg {
        self.regs
            .allocate64_lo(&mut self.buf, &mut self.insns, self.idx, addr)
    }

    pub(crate) fn alloc64_hi(&mut self, addr: GuestAddr) -> Reg {
        self.regs
            .allocate64_hi(&mut self.buf, &mut self.insns, self.idx, addr)
    }

    pub(crate) fn alloc64_lo_w(&mut self, addr: GuestAddr) -> Reg {
        self.regs
            .allocate64_lo_w(&mut self.buf, &mut self.insns, self.idx, addr)
    }

    pub(crate) fn alloc64_hi_w(&mut self, addr: GuestAddr) -> Reg {
        self.regs
            .allocate64_hi_w(&mut self.buf, &mut self.insns, self.idx, addr)
    }

    pub(crate) fn alloc_fixed(&mut self, reg: Reg, addr: GuestAddr) {
        self.regs
            .allocate_fixed(&mut self.buf, &mut self.insns, self.idx, reg, addr)
    }

    pub(crate) fn alloc_fixed_w(&mut self, reg: Reg, addr: GuestAddr, load: bool) {
        self.regs
            .allocate_fixed_w(&mut self.buf, &mut self.insns, self.idx, reg, addr, load)
    }

    pub(crate) fn free_reg(&mut self, reg: Reg) {
        self.regs
            .free_register(&mut self.buf, &mut self.insns, self.idx, reg)
    }

    pub(crate) fn free_all(&mut self) {
        self.regs
            .free_all_registers(&mut self.buf, &mut self.insns, self.idx)
    }

    pub(crate) fn is64(&self, addr: GuestAddr) -> Option<bool> {
        self.regs.is64(addr)
    }

    pub(crate) fn lru(&self) -> Reg {
        self.regs.lru_register()
    }

    pub(crate) fn lru_except(&self, excluded: Reg) -> Reg {
        self.regs.lru_register_except(excluded)
    }

    pub(crate) fn set_reg_state(&mut self, reg: Reg, addr: GuestAddr, dirty: bool) {
        self.regs.set_register_state(self.idx, reg, addr, dirty);
    }

    pub(crate) fn set_reg64_state(&mut self, lo: Reg, hi: Reg, addr: GuestAddr, dirty: bool) {
        self.regs.set_64_register_state(self.idx, lo, hi, addr, dirty);
    }

    // ==================== Cell shorthands ====================

    pub(crate) fn gpr_cell(&self, r: usize) -> GuestAddr {
        self.map.gpr(r)
    }

    pub(crate) fn state_cell(&self, offset: GuestAddr) -> GuestAddr {
        self.map.cell(offset)
    }

    /// Restart the current instruction's entry bookkeeping at the present
    /// buffer position. Generators that flush the whole cache up front
    /// call this so direct entries skip the flush prologue and carry no
    /// register expectations.
    pub(crate) fn simplify_access(&mut self) {
        let at = self.buf.len() as u32;
        let insn = &mut self.insns[self.idx];
        insn.local_addr = at;
        insn.needed = [None; 8];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::dispatch::DispatchTable;
    use crate::jit::runtime::HostMap;

    fn compile(words: &[u32], start: u32) -> CompiledBlock {
        let cfg = JitConfig::default();
        let map = HostMap::synthetic();
        let dispatch = DispatchTable::new(&cfg);
        BlockCompiler::new(&cfg, &map, &dispatch, words, start).compile()
    }

    #[test]
    fn test_straight_line_block_gets_landing_pads() {
        // addiu $t0, $zero, 1 / addiu $t1, $zero, 2
        let block = compile(&[0x2408_0001, 0x2409_0002], 0x8000_0000);
        assert!(block.insns.len() > 2);
        assert!(!block.code.is_empty());
        assert!(block.entry_offset(0x8000_0000).is_some());
        assert!(block.entry_offset(0x8000_0004).is_some());
        assert_eq!(block.entry_offset(0x8000_0002), None);
        assert_eq!(block.entry_offset(0x7FFF_FFFC), None);
    }

    #[test]
    fn test_jump_ends_block_early() {
        // j 0x80000000 / nop, then words that are never reached linearly
        let words = vec![0x0800_0000, 0, 0x2408_0001, 0, 0, 0, 0, 0];
        let block = compile(&words, 0x8000_0000);
        assert!(block.insns.len() < words.len());
    }

    #[test]
    fn test_branch_emits_near_jumps() {
        // beq $zero, $zero, +2 / nop / nop / target: addiu
        let words = vec![0x1000_0002, 0, 0, 0x2408_0001, 0, 0, 0, 0];
        let block = compile(&words, 0x8000_0000);
        assert!(block.entry_offset(0x8000_000C).is_some());
        assert!(block.code.contains(&0xE9));
    }

    #[test]
    fn test_local_offsets_are_monotonic() {
        let words = vec![0x2408_0001, 0x2409_0002, 0x240A_0003, 0, 0, 0, 0, 0];
        let block = compile(&words, 0x8000_0000);
        let mut prev = 0;
        for insn in &block.insns {
            assert!(insn.local_addr >= prev);
            prev = insn.local_addr;
        }
    }
}
