//! Host register cache for the translator.
//!
//! Eight x86 registers (minus ESP) cache 32-bit guest cells identified by
//! [`GuestAddr`]. The cache tracks, per host register: the cached cell,
//! the index of the instruction that last touched it, the instruction
//! since which it has been free, a dirty bit, and an optional partner
//! register holding the upper half of a 64-bit value.
//!
//! Every state change retroactively stamps `needed` on the instructions
//! between the previous access and the current one, so that any
//! instruction can later be entered directly through a reconciliation
//! wrapper that reloads exactly the registers live at that point.

use crate::cpu::GuestAddr;
use crate::jit::codebuf::CodeBuffer;
use crate::jit::x86::{Reg, X86Assembler};
use crate::mips::Insn;

const ESP: usize = 4;

pub struct RegCache {
    content: [Option<GuestAddr>; 8],
    last_access: [Option<usize>; 8],
    free_since: [usize; 8],
    dirty: [bool; 8],
    pair: [Option<usize>; 8],
    /// Low word of guest r0; reads of it (or its upper half) synthesize
    /// zero instead of loading.
    r0: GuestAddr,
}

impl RegCache {
    pub fn new(r0: GuestAddr) -> Self {
        RegCache {
            content: [None; 8],
            last_access: [None; 8],
            free_since: [0; 8],
            dirty: [false; 8],
            pair: [None; 8],
            r0,
        }
    }

    /// Reset for a fresh translation starting at instruction `start`.
    pub fn init(&mut self, start: usize) {
        for i in 0..8 {
            self.content[i] = None;
            self.last_access[i] = None;
            self.free_since[i] = start;
            self.dirty[i] = false;
            self.pair[i] = None;
        }
    }

    fn is_zero_cell(&self, addr: GuestAddr) -> bool {
        addr == self.r0 || addr == self.r0.hi_word()
    }

    /// LRU order: never-used registers first, then oldest access; ESP is
    /// never a candidate.
    fn lru_key(&self, i: usize) -> i64 {
        match self.last_access[i] {
            None => -1,
            Some(at) => at as i64,
        }
    }

    pub fn lru_register(&self) -> Reg {
        let mut reg = 0;
        let mut oldest = i64::MAX;
        for i in 0..8 {
            if i != ESP && self.lru_key(i) < oldest {
                oldest = self.lru_key(i);
                reg = i;
            }
        }
        Reg::from_index(reg)
    }

    pub fn lru_register_except(&self, excluded: Reg) -> Reg {
        let mut reg = 0;
        let mut oldest = i64::MAX;
        for i in 0..8 {
            if i != ESP && i != excluded.code() as usize && self.lru_key(i) < oldest {
                oldest = self.lru_key(i);
                reg = i;
            }
        }
        Reg::from_index(reg)
    }

    /// Whether `addr` is cached, and at what width.
    pub fn is64(&self, addr: GuestAddr) -> Option<bool> {
        for i in 0..8 {
            if self.last_access[i].is_some() && self.content[i] == Some(addr) {
                return Some(self.pair[i].is_some());
            }
        }
        None
    }

    /// Stamp `needed[reg] = value` on every instruction after the
    /// register's last access, up to and including `idx`.
    fn stamp(&self, insns: &mut [Insn], idx: usize, reg: usize, value: Option<GuestAddr>) {
        let from = match self.last_access[reg] {
            Some(at) => at + 1,
            None => self.free_since[reg],
        };
        for insn in &mut insns[from..=idx] {
            insn.needed[reg] = value;
        }
    }

    /// Mark a register that was never re-used as free through `idx`.
    fn retire_unused(&mut self, insns: &mut [Insn], idx: usize, reg: usize) {
        while self.free_since[reg] <= idx {
            insns[self.free_since[reg]].needed[reg] = None;
            self.free_since[reg] += 1;
        }
    }

    /// Write a cached value back to guest state and release the register
    /// (and its partner). A clean register is released without emission.
    pub fn free_register(&mut self, buf: &mut CodeBuffer, insns: &mut [Insn], idx: usize, reg: Reg) {
        let reg = reg.code() as usize;

        // Freeing the upper half redirects to the lower, which writes
        // back both.
        if self.last_access[reg].is_some() {
            if let (Some(partner), Some(own), Some(other)) =
                (self.pair[reg], self.content[reg], self.pair[reg].and_then(|p| self.content[p]))
            {
                if other.0 != own.0.wrapping_add(4) {
                    self.free_register(buf, insns, idx, Reg::from_index(partner));
                    return;
                }
            }
        }

        let stamped = if self.last_access[reg].is_some() && self.dirty[reg] {
            self.content[reg]
        } else {
            None
        };
        self.stamp(insns, idx, reg, stamped);
        if self.last_access[reg].is_some() {
            if let Some(partner) = self.pair[reg] {
                let partner_stamp = if self.dirty[partner] {
                    self.content[partner]
                } else {
                    None
                };
                let from = match self.last_access[reg] {
                    Some(at) => at + 1,
                    None => self.free_since[reg],
                };
                for insn in &mut insns[from..=idx] {
                    insn.needed[partner] = partner_stamp;
                }
            }
        }

        if self.last_access[reg].is_none() {
            self.free_since[reg] = idx + 1;
            return;
        }

        if self.dirty[reg] {
            if let Some(addr) = self.content[reg] {
                let mut asm = X86Assembler::new(buf);
                asm.mov_m32abs_reg(addr, Reg::from_index(reg));
                match self.pair[reg] {
                    None => {
                        asm.sar_reg_imm8(Reg::from_index(reg), 31);
                        asm.mov_m32abs_reg(addr.hi_word(), Reg::from_index(reg));
                    }
                    Some(partner) => {
                        if let Some(hi_addr) = self.content[partner] {
                            asm.mov_m32abs_reg(hi_addr, Reg::from_index(partner));
                        }
                    }
                }
            }
        }

        self.last_access[reg] = None;
        self.free_since[reg] = idx + 1;
        if let Some(partner) = self.pair[reg] {
            self.last_access[partner] = None;
            self.free_since[partner] = idx + 1;
        }
    }

    /// Flush and release every register.
    pub fn free_all_registers(&mut self, buf: &mut CodeBuffer, insns: &mut [Insn], idx: usize) {
        for i in 0..8 {
            if self.last_access[i].is_some() {
                self.free_register(buf, insns, idx, Reg::from_index(i));
            } else {
                self.retire_unused(insns, idx, i);
            }
        }
    }

    /// Evict the LRU register (or note the gap in a never-used one) so
    /// that `reg` can be reassigned.
    fn make_room(&mut self, buf: &mut CodeBuffer, insns: &mut [Insn], idx: usize, reg: usize) {
        if self.last_access[reg].is_some() {
            self.free_register(buf, insns, idx, Reg::from_index(reg));
        } else {
            self.retire_unused(insns, idx, reg);
        }
    }

    /// Refresh a cache hit: stamp the gap since last access and bump.
    fn touch(&mut self, insns: &mut [Insn], idx: usize, reg: usize) {
        self.stamp(insns, idx, reg, self.content[reg]);
        self.last_access[reg] = Some(idx);
        if let Some(partner) = self.pair[reg] {
            self.stamp(insns, idx, partner, self.content[partner]);
            self.last_access[partner] = Some(idx);
        }
    }

    /// Cache `addr` for reading and return the register. `None` allocates
    /// an anonymous scratch register.
    pub fn allocate(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        addr: Option<GuestAddr>,
    ) -> Reg {
        if let Some(addr) = addr {
            for i in 0..8 {
                if self.last_access[i].is_some() && self.content[i] == Some(addr) {
                    self.touch(insns, idx, i);
                    return Reg::from_index(i);
                }
            }
        }

        let reg = self.lru_register().code() as usize;
        self.make_room(buf, insns, idx, reg);

        self.last_access[reg] = Some(idx);
        self.content[reg] = addr;
        self.dirty[reg] = false;
        self.pair[reg] = None;

        if let Some(addr) = addr {
            let mut asm = X86Assembler::new(buf);
            if self.is_zero_cell(addr) {
                asm.xor_reg_reg(Reg::from_index(reg), Reg::from_index(reg));
            } else {
                asm.mov_reg_m32abs(Reg::from_index(reg), addr);
            }
        }
        Reg::from_index(reg)
    }

    /// Cache `addr` as a write target; its current value is not loaded.
    pub fn allocate_w(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        addr: GuestAddr,
    ) -> Reg {
        for i in 0..8 {
            if self.last_access[i].is_some() && self.content[i] == Some(addr) {
                // The value is about to be overwritten, so the gap needs
                // no reload.
                self.stamp(insns, idx, i, None);
                self.last_access[i] = Some(idx);
                self.dirty[i] = true;
                if let Some(partner) = self.pair[i] {
                    self.stamp(insns, idx, partner, None);
                    self.free_since[partner] = idx + 1;
                    self.last_access[partner] = None;
                    self.pair[i] = None;
                }
                return Reg::from_index(i);
            }
        }

        let reg = self.lru_register().code() as usize;
        self.make_room(buf, insns, idx, reg);

        self.last_access[reg] = Some(idx);
        self.content[reg] = Some(addr);
        self.dirty[reg] = true;
        self.pair[reg] = None;
        Reg::from_index(reg)
    }

    /// Upgrade or load `addr` as a 64-bit pair; returns the low-half
    /// register.
    pub fn allocate64_lo(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        addr: GuestAddr,
    ) -> Reg {
        self.allocate64(buf, insns, idx, addr, false)
    }

    /// As [`allocate64_lo`](Self::allocate64_lo), returning the high half.
    pub fn allocate64_hi(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        addr: GuestAddr,
    ) -> Reg {
        self.allocate64(buf, insns, idx, addr, true)
    }

    fn allocate64(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        addr: GuestAddr,
        want_hi: bool,
    ) -> Reg {
        for i in 0..8 {
            if self.last_access[i].is_some() && self.content[i] == Some(addr) && self.pair[i].is_none()
            {
                // Cached at 32 bits: widen in place. A dirty low half has
                // no memory image to load the upper word from, so it is
                // sign-extended in registers.
                let was_dirty = self.dirty[i];
                self.allocate(buf, insns, idx, Some(addr));
                let reg2 = self
                    .allocate(
                        buf,
                        insns,
                        idx,
                        if was_dirty { None } else { Some(addr.hi_word()) },
                    )
                    .code() as usize;
                self.pair[i] = Some(reg2);
                self.pair[reg2] = Some(i);

                if was_dirty {
                    self.content[reg2] = Some(addr.hi_word());
                    self.dirty[reg2] = true;
                    let mut asm = X86Assembler::new(buf);
                    asm.mov_reg_reg(Reg::from_index(reg2), Reg::from_index(i));
                    asm.sar_reg_imm8(Reg::from_index(reg2), 31);
                }

                return Reg::from_index(if want_hi { reg2 } else { i });
            }
        }

        let reg1 = self.allocate(buf, insns, idx, Some(addr)).code() as usize;
        let reg2 = self.allocate(buf, insns, idx, Some(addr.hi_word())).code() as usize;
        self.pair[reg1] = Some(reg2);
        self.pair[reg2] = Some(reg1);
        Reg::from_index(if want_hi { reg2 } else { reg1 })
    }

    pub fn allocate64_lo_w(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        addr: GuestAddr,
    ) -> Reg {
        self.allocate64_w(buf, insns, idx, addr, false)
    }

    pub fn allocate64_hi_w(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        addr: GuestAddr,
    ) -> Reg {
        self.allocate64_w(buf, insns, idx, addr, true)
    }

    fn allocate64_w(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        addr: GuestAddr,
        want_hi: bool,
    ) -> Reg {
        for i in 0..8 {
            if self.last_access[i].is_some() && self.content[i] == Some(addr) {
                if self.pair[i].is_none() {
                    self.allocate_w(buf, insns, idx, addr);
                    let reg2 = self.lru_register().code() as usize;
                    self.make_room(buf, insns, idx, reg2);
                    self.pair[i] = Some(reg2);
                    self.pair[reg2] = Some(i);
                    self.last_access[reg2] = Some(idx);
                    self.content[reg2] = Some(addr.hi_word());
                    self.dirty[reg2] = true;
                    let mut asm = X86Assembler::new(buf);
                    asm.mov_reg_reg(Reg::from_index(reg2), Reg::from_index(i));
                    asm.sar_reg_imm8(Reg::from_index(reg2), 31);
                    return Reg::from_index(if want_hi { reg2 } else { i });
                } else {
                    let partner = self.pair[i].unwrap_or(i);
                    self.last_access[i] = Some(idx);
                    self.last_access[partner] = Some(idx);
                    self.dirty[i] = true;
                    self.dirty[partner] = true;
                    return Reg::from_index(if want_hi { partner } else { i });
                }
            }
        }

        let reg1 = self.allocate_w(buf, insns, idx, addr).code() as usize;
        let reg2 = self.lru_register().code() as usize;
        self.make_room(buf, insns, idx, reg2);
        self.pair[reg1] = Some(reg2);
        self.pair[reg2] = Some(reg1);
        self.last_access[reg2] = Some(idx);
        self.content[reg2] = Some(addr.hi_word());
        self.dirty[reg2] = true;
        Reg::from_index(if want_hi { reg2 } else { reg1 })
    }

    /// Put `addr` into a specific register (needed for CL shift counts
    /// and the EAX:EDX multiply convention), relocating any current
    /// occupant.
    pub fn allocate_fixed(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        reg: Reg,
        addr: GuestAddr,
    ) {
        let reg = reg.code() as usize;

        if self.last_access[reg].is_some() && self.content[reg] == Some(addr) {
            self.touch(insns, idx, reg);
            return;
        }

        self.make_room(buf, insns, idx, reg);

        // Cached elsewhere: move it over, carrying the metadata.
        for i in 0..8 {
            if self.last_access[i].is_some() && self.content[i] == Some(addr) {
                self.touch(insns, idx, i);
                let mut asm = X86Assembler::new(buf);
                asm.mov_reg_reg(Reg::from_index(reg), Reg::from_index(i));
                self.last_access[reg] = Some(idx);
                self.pair[reg] = self.pair[i];
                if let Some(partner) = self.pair[reg] {
                    self.pair[partner] = Some(reg);
                }
                self.dirty[reg] = self.dirty[i];
                self.content[reg] = self.content[i];
                self.free_since[i] = idx + 1;
                self.last_access[i] = None;
                return;
            }
        }

        self.last_access[reg] = Some(idx);
        self.content[reg] = Some(addr);
        self.dirty[reg] = false;
        self.pair[reg] = None;

        let mut asm = X86Assembler::new(buf);
        if self.is_zero_cell(addr) {
            asm.xor_reg_reg(Reg::from_index(reg), Reg::from_index(reg));
        } else {
            asm.mov_reg_m32abs(Reg::from_index(reg), addr);
        }
    }

    /// Fixed-register variant of [`allocate_w`](Self::allocate_w). With
    /// `load` set the old value is still brought in, for targets that are
    /// read-modify-write.
    pub fn allocate_fixed_w(
        &mut self,
        buf: &mut CodeBuffer,
        insns: &mut [Insn],
        idx: usize,
        reg: Reg,
        addr: GuestAddr,
        load: bool,
    ) {
        let reg = reg.code() as usize;

        if self.last_access[reg].is_some() && self.content[reg] == Some(addr) {
            self.stamp(insns, idx, reg, self.content[reg]);
            self.last_access[reg] = Some(idx);
            if let Some(partner) = self.pair[reg] {
                self.stamp(insns, idx, partner, self.content[partner]);
                self.last_access[partner] = None;
                self.free_since[partner] = idx + 1;
                self.pair[reg] = None;
            }
            self.dirty[reg] = true;
            return;
        }

        self.make_room(buf, insns, idx, reg);

        for i in 0..8 {
            if self.last_access[i].is_some() && self.content[i] == Some(addr) {
                self.stamp(insns, idx, i, self.content[i]);
                self.last_access[i] = Some(idx);
                if let Some(partner) = self.pair[i] {
                    self.stamp(insns, idx, partner, None);
                    self.free_since[partner] = idx + 1;
                    self.last_access[partner] = None;
                    self.pair[i] = None;
                }

                if load {
                    let mut asm = X86Assembler::new(buf);
                    asm.mov_reg_reg(Reg::from_index(reg), Reg::from_index(i));
                }
                self.last_access[reg] = Some(idx);
                self.dirty[reg] = true;
                self.pair[reg] = None;
                self.content[reg] = self.content[i];
                self.free_since[i] = idx + 1;
                self.last_access[i] = None;
                return;
            }
        }

        self.last_access[reg] = Some(idx);
        self.content[reg] = Some(addr);
        self.dirty[reg] = true;
        self.pair[reg] = None;

        if load {
            let mut asm = X86Assembler::new(buf);
            if self.is_zero_cell(addr) {
                asm.xor_reg_reg(Reg::from_index(reg), Reg::from_index(reg));
            } else {
                asm.mov_reg_m32abs(Reg::from_index(reg), addr);
            }
        }
    }

    /// Record that `reg` now holds `addr` as a 32-bit value (used after
    /// load results land in fixed registers).
    pub fn set_register_state(&mut self, idx: usize, reg: Reg, addr: GuestAddr, dirty: bool) {
        let reg = reg.code() as usize;
        self.last_access[reg] = Some(idx);
        self.content[reg] = Some(addr);
        self.pair[reg] = None;
        self.dirty[reg] = dirty;
    }

    /// Record a 64-bit pair held in `lo`/`hi`.
    pub fn set_64_register_state(
        &mut self,
        idx: usize,
        lo: Reg,
        hi: Reg,
        addr: GuestAddr,
        dirty: bool,
    ) {
        let lo = lo.code() as usize;
        let hi = hi.code() as usize;
        self.last_access[lo] = Some(idx);
        self.last_access[hi] = Some(idx);
        self.content[lo] = Some(addr);
        self.content[hi] = Some(addr.hi_word());
        self.pair[lo] = Some(hi);
        self.pair[hi] = Some(lo);
        self.dirty[lo] = dirty;
        self.dirty[hi] = dirty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuState;
    use crate::mips::{decode, BlockWindow};

    fn nops(n: usize) -> Vec<Insn> {
        let window = BlockWindow {
            start: 0,
            end: (n as u32) * 4,
        };
        (0..n)
            .map(|i| decode(0, 0, (i as u32) * 4, &window, false))
            .collect()
    }

    #[test]
    fn test_lru_skips_esp() {
        let cache = RegCache::new(CpuState::gpr(0));
        assert_ne!(cache.lru_register(), Reg::Esp);
    }

    #[test]
    fn test_allocate_hit_returns_same_register() {
        let mut cache = RegCache::new(CpuState::gpr(0));
        cache.init(0);
        let mut buf = CodeBuffer::new();
        let mut insns = nops(4);
        let a = cache.allocate(&mut buf, &mut insns, 0, Some(CpuState::gpr(7)));
        let before = buf.len();
        let b = cache.allocate(&mut buf, &mut insns, 1, Some(CpuState::gpr(7)));
        assert_eq!(a, b);
        // A hit loads nothing.
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn test_zero_register_synthesized_with_xor() {
        let mut cache = RegCache::new(CpuState::gpr(0));
        cache.init(0);
        let mut buf = CodeBuffer::new();
        let mut insns = nops(1);
        let reg = cache.allocate(&mut buf, &mut insns, 0, Some(CpuState::gpr(0)));
        // xor reg, reg
        assert_eq!(buf.code(), &[0x31, 0xC0 | (reg.code() << 3) | reg.code()]);
    }

    #[test]
    fn test_live_contents_unique_and_pairs_symmetric() {
        let mut cache = RegCache::new(CpuState::gpr(0));
        cache.init(0);
        let mut buf = CodeBuffer::new();
        let mut insns = nops(8);

        let lo1 = cache.allocate64_lo(&mut buf, &mut insns, 0, CpuState::gpr(1));
        cache.allocate(&mut buf, &mut insns, 1, Some(CpuState::gpr(2)));
        cache.allocate64_lo_w(&mut buf, &mut insns, 2, CpuState::gpr(3));
        cache.allocate_fixed(&mut buf, &mut insns, 3, Reg::Edi, CpuState::gpr(4));
        let r2 = cache.allocate(&mut buf, &mut insns, 4, Some(CpuState::gpr(2)));
        cache.free_register(&mut buf, &mut insns, 5, r2);
        // Freeing a pair leaves both pair[] entries behind; only live
        // registers are held to the invariants.
        cache.free_register(&mut buf, &mut insns, 6, lo1);

        for i in 0..8 {
            if cache.last_access[i].is_none() {
                continue;
            }
            for j in (i + 1)..8 {
                if cache.last_access[j].is_some() {
                    assert_ne!(cache.content[i], cache.content[j]);
                }
            }
            if let Some(p) = cache.pair[i] {
                if cache.last_access[p].is_some() {
                    assert_eq!(cache.pair[p], Some(i));
                    let a = cache.content[i].unwrap().0;
                    let b = cache.content[p].unwrap().0;
                    assert_eq!(a.max(b), a.min(b) + 4);
                }
            }
        }
    }

    #[test]
    fn test_dirty_upgrade_sign_extends_without_reload() {
        let mut cache = RegCache::new(CpuState::gpr(0));
        cache.init(0);
        let mut buf = CodeBuffer::new();
        let mut insns = nops(2);

        let lo = cache.allocate_w(&mut buf, &mut insns, 0, CpuState::gpr(6));
        assert_eq!(buf.len(), 0);

        let widened = cache.allocate64_lo(&mut buf, &mut insns, 1, CpuState::gpr(6));
        assert_eq!(lo, widened);
        let hi = Reg::from_index(cache.pair[lo.code() as usize].unwrap());
        // mov hi, lo / sar hi, 31 and nothing else: the stale upper word
        // in memory is never read.
        assert_eq!(
            buf.code(),
            &[
                0x8B,
                0xC0 | (hi.code() << 3) | lo.code(),
                0xC1,
                0xF8 | hi.code(),
                31,
            ]
        );
        assert!(cache.dirty[hi.code() as usize]);
    }

    #[test]
    fn test_is64_reports_width() {
        let mut cache = RegCache::new(CpuState::gpr(0));
        cache.init(0);
        let mut buf = CodeBuffer::new();
        let mut insns = nops(2);
        assert_eq!(cache.is64(CpuState::gpr(3)), None);
        cache.allocate(&mut buf, &mut insns, 0, Some(CpuState::gpr(3)));
        assert_eq!(cache.is64(CpuState::gpr(3)), Some(false));
        cache.allocate64_lo(&mut buf, &mut insns, 1, CpuState::gpr(3));
        assert_eq!(cache.is64(CpuState::gpr(3)), Some(true));
    }
}
