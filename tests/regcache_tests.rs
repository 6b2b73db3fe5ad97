use r4300_dynarec::cpu::GuestAddr;
use r4300_dynarec::jit::codebuf::CodeBuffer;
use r4300_dynarec::jit::regcache::RegCache;
use r4300_dynarec::jit::x86::Reg;
use r4300_dynarec::mips::{decode, BlockWindow, Insn};

const R0: GuestAddr = GuestAddr(0);

fn nop_insns(count: usize) -> Vec<Insn> {
    let window = BlockWindow {
        start: 0x8000_0000,
        end: 0x8000_0000 + (count as u32) * 4,
    };
    (0..count)
        .map(|i| decode(0, 0, 0x8000_0000 + (i as u32) * 4, &window, false))
        .collect()
}

fn contains_addr(buf: &CodeBuffer, addr: GuestAddr) -> bool {
    let needle = addr.0.to_le_bytes();
    buf.code().windows(4).any(|w| w == needle)
}

#[test]
fn test_repeat_allocation_reuses_register() {
    let mut cache = RegCache::new(R0);
    let mut buf = CodeBuffer::new();
    let mut insns = nop_insns(4);
    cache.init(0);

    let cell = GuestAddr(0x40);
    let first = cache.allocate(&mut buf, &mut insns, 0, Some(cell));
    let len_after_load = buf.len();
    let second = cache.allocate(&mut buf, &mut insns, 1, Some(cell));

    assert_eq!(first, second);
    assert_eq!(buf.len(), len_after_load, "cached value reloaded");
}

#[test]
fn test_dirty_register_written_back_on_flush() {
    let mut cache = RegCache::new(R0);
    let mut buf = CodeBuffer::new();
    let mut insns = nop_insns(4);
    cache.init(0);

    let cell = GuestAddr(0x1230);
    cache.allocate_w(&mut buf, &mut insns, 0, cell);
    assert!(!contains_addr(&buf, cell), "write allocation loaded memory");

    cache.free_all_registers(&mut buf, &mut insns, 1);
    assert!(contains_addr(&buf, cell), "dirty value never stored");
}

#[test]
fn test_clean_register_freed_silently() {
    let mut cache = RegCache::new(R0);
    let mut buf = CodeBuffer::new();
    let mut insns = nop_insns(4);
    cache.init(0);

    let cell = GuestAddr(0x40);
    let reg = cache.allocate(&mut buf, &mut insns, 0, Some(cell));
    let len = buf.len();
    cache.free_register(&mut buf, &mut insns, 1, reg);
    assert_eq!(buf.len(), len);
}

#[test]
fn test_zero_register_never_loaded_from_memory() {
    let mut cache = RegCache::new(R0);
    let mut buf = CodeBuffer::new();
    let mut insns = nop_insns(4);
    cache.init(0);

    cache.allocate(&mut buf, &mut insns, 0, Some(R0));
    assert!(!contains_addr(&buf, R0));
}

#[test]
fn test_width_tracking() {
    let mut cache = RegCache::new(R0);
    let mut buf = CodeBuffer::new();
    let mut insns = nop_insns(8);
    cache.init(0);

    let narrow = GuestAddr(0x40);
    let wide = GuestAddr(0x50);
    assert_eq!(cache.is64(narrow), None);

    cache.allocate_w(&mut buf, &mut insns, 0, narrow);
    assert_eq!(cache.is64(narrow), Some(false));

    cache.allocate64_lo_w(&mut buf, &mut insns, 1, wide);
    cache.allocate64_hi_w(&mut buf, &mut insns, 1, wide);
    assert_eq!(cache.is64(wide), Some(true));
}

/// Reference model of the eviction policy: cells kept in access order,
/// seven slots (esp never caches anything).
struct LruOracle {
    order: Vec<GuestAddr>,
}

impl LruOracle {
    /// Record an access and return the cell that must be evicted, if any.
    fn access(&mut self, addr: GuestAddr) -> Option<GuestAddr> {
        if let Some(at) = self.order.iter().position(|&a| a == addr) {
            self.order.remove(at);
            self.order.push(addr);
            return None;
        }
        let evicted = if self.order.len() == 7 {
            Some(self.order.remove(0))
        } else {
            None
        };
        self.order.push(addr);
        evicted
    }
}

#[test]
fn test_eviction_follows_access_order() {
    let mut cache = RegCache::new(R0);
    let mut buf = CodeBuffer::new();
    cache.init(0);

    let seq: [u32; 14] = [1, 2, 3, 4, 5, 6, 7, 2, 8, 3, 9, 5, 10, 1];
    let mut insns = nop_insns(seq.len());
    let mut oracle = LruOracle { order: Vec::new() };
    let mut held: Vec<(GuestAddr, Reg)> = Vec::new();

    for (idx, &n) in seq.iter().enumerate() {
        let cell = GuestAddr(0x100 + n * 8);
        let expect_evicted = oracle.access(cell);
        let reg = cache.allocate(&mut buf, &mut insns, idx, Some(cell));

        if let Some(gone) = expect_evicted {
            assert_eq!(cache.is64(gone), None, "evicted the wrong cell");
            let at = held.iter().position(|&(a, _)| a == gone).unwrap();
            let (_, old_reg) = held.remove(at);
            assert_eq!(reg, old_reg, "allocation bypassed the freed register");
        }
        held.retain(|&(a, _)| a != cell);
        held.push((cell, reg));
        assert_eq!(cache.is64(cell), Some(false));
    }
}

#[test]
fn test_lru_exclusion() {
    let cache = RegCache::new(R0);
    let lru = cache.lru_register();
    assert_ne!(cache.lru_register_except(lru), lru);
}

#[test]
fn test_fixed_allocation_lands_in_requested_register() {
    let mut cache = RegCache::new(R0);
    let mut buf = CodeBuffer::new();
    let mut insns = nop_insns(4);
    cache.init(0);

    let cell = GuestAddr(0x60);
    cache.allocate_fixed(
        &mut buf,
        &mut insns,
        0,
        r4300_dynarec::jit::x86::Reg::Ecx,
        cell,
    );
    // A later plain allocation of the same cell must find it in ecx.
    let reg = cache.allocate(&mut buf, &mut insns, 1, Some(cell));
    assert_eq!(reg, r4300_dynarec::jit::x86::Reg::Ecx);
}
