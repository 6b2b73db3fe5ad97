//! Executes emitted branch code on a miniature x86-32 stepper.
//!
//! The stepper covers exactly the instruction forms the condition tests
//! and branch glue emit, with guest state cells addressed absolutely at
//! the synthetic state base. Execution halts at the first helper call
//! (`push imm32`), which only the landing pads reach when no interrupt
//! is pending.

use std::collections::HashMap;

use r4300_dynarec::config::JitConfig;
use r4300_dynarec::cpu::{CpuState, CP0_COUNT};
use r4300_dynarec::jit::compiler::{BlockCompiler, CompiledBlock};
use r4300_dynarec::jit::dispatch::DispatchTable;
use r4300_dynarec::jit::runtime::HostMap;

struct Machine {
    regs: [u32; 8],
    mem: HashMap<u32, u32>,
    cmp: (u32, u32),
}

impl Machine {
    fn new() -> Self {
        Machine {
            regs: [0; 8],
            mem: HashMap::new(),
            cmp: (0, 0),
        }
    }

    fn read(&self, addr: u32) -> u32 {
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: u32, value: u32) {
        self.mem.insert(addr, value);
    }

    fn cond(&self, cc: u8) -> bool {
        let (l, r) = self.cmp;
        match cc {
            0x2 => l < r,
            0x3 => l >= r,
            0x4 => l == r,
            0x5 => l != r,
            0x6 => l <= r,
            0x7 => l > r,
            0xC => (l as i32) < (r as i32),
            0xD => (l as i32) >= (r as i32),
            0xE => (l as i32) <= (r as i32),
            0xF => (l as i32) > (r as i32),
            _ => panic!("condition {:x} not modeled", cc),
        }
    }

    /// Run from `entry` until a helper call is reached.
    fn run(&mut self, code: &[u8], entry: usize) {
        let mut pc = entry;
        let fetch_u32 = |code: &[u8], at: usize| {
            u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
        };
        for _ in 0..10_000 {
            let op = code[pc];
            match op {
                0x68 => return,
                0xB8..=0xBF => {
                    self.regs[(op - 0xB8) as usize] = fetch_u32(code, pc + 1);
                    pc += 5;
                }
                0x8B | 0x89 | 0x31 | 0x39 | 0x3B | 0x2B | 0x03 | 0x01 => {
                    let modrm = code[pc + 1];
                    let (mode, reg, rm) = (modrm >> 6, ((modrm >> 3) & 7) as usize, (modrm & 7) as usize);
                    if mode == 3 {
                        match op {
                            0x8B => self.regs[reg] = self.regs[rm],
                            0x31 => self.regs[rm] ^= self.regs[reg],
                            0x39 => self.cmp = (self.regs[rm], self.regs[reg]),
                            _ => panic!("register form of {:02x} not modeled", op),
                        }
                        pc += 2;
                    } else {
                        assert_eq!(mode, 0);
                        assert_eq!(rm, 5, "only absolute memory operands are modeled");
                        let addr = fetch_u32(code, pc + 2);
                        match op {
                            0x8B => self.regs[reg] = self.read(addr),
                            0x89 => self.write(addr, self.regs[reg]),
                            0x3B => self.cmp = (self.regs[reg], self.read(addr)),
                            0x2B => {
                                self.regs[reg] = self.regs[reg].wrapping_sub(self.read(addr))
                            }
                            0x03 => {
                                self.regs[reg] = self.regs[reg].wrapping_add(self.read(addr))
                            }
                            0x01 => {
                                let sum = self.read(addr).wrapping_add(self.regs[reg]);
                                self.write(addr, sum);
                            }
                            _ => unreachable!(),
                        }
                        pc += 6;
                    }
                }
                0xC7 => {
                    let addr = fetch_u32(code, pc + 2);
                    let imm = fetch_u32(code, pc + 6);
                    self.write(addr, imm);
                    pc += 10;
                }
                0x81 => {
                    let modrm = code[pc + 1];
                    let (mode, digit, rm) = (modrm >> 6, (modrm >> 3) & 7, (modrm & 7) as usize);
                    if mode == 3 {
                        let imm = fetch_u32(code, pc + 2);
                        match digit {
                            0 => self.regs[rm] = self.regs[rm].wrapping_add(imm),
                            4 => self.regs[rm] &= imm,
                            5 => self.regs[rm] = self.regs[rm].wrapping_sub(imm),
                            7 => self.cmp = (self.regs[rm], imm),
                            _ => panic!("alu digit {} not modeled", digit),
                        }
                        pc += 6;
                    } else {
                        assert_eq!((mode, rm), (0, 5));
                        let addr = fetch_u32(code, pc + 2);
                        let imm = fetch_u32(code, pc + 6);
                        assert_eq!(digit, 7, "only memory cmp is modeled");
                        self.cmp = (self.read(addr), imm);
                        pc += 10;
                    }
                }
                0xC1 => {
                    let modrm = code[pc + 1];
                    let (digit, rm) = ((modrm >> 3) & 7, (modrm & 7) as usize);
                    let amount = code[pc + 2] & 0x1F;
                    match digit {
                        4 => self.regs[rm] <<= amount,
                        5 => self.regs[rm] >>= amount,
                        7 => self.regs[rm] = ((self.regs[rm] as i32) >> amount) as u32,
                        _ => panic!("shift digit {} not modeled", digit),
                    }
                    pc += 3;
                }
                0xF7 => {
                    let modrm = code[pc + 1];
                    assert_eq!((modrm >> 6, (modrm >> 3) & 7), (3, 4), "only mul is modeled");
                    let rm = (modrm & 7) as usize;
                    let product = (self.regs[0] as u64) * (self.regs[rm] as u64);
                    self.regs[0] = product as u32;
                    self.regs[2] = (product >> 32) as u32;
                    pc += 2;
                }
                0x70..=0x7F => {
                    let disp = code[pc + 1] as i8 as isize;
                    pc += 2;
                    if self.cond(op & 0xF) {
                        pc = (pc as isize + disp) as usize;
                    }
                }
                0x0F => {
                    let sub = code[pc + 1];
                    assert!((0x80..=0x8F).contains(&sub));
                    let disp = fetch_u32(code, pc + 2) as i32 as isize;
                    pc += 6;
                    if self.cond(sub & 0xF) {
                        pc = (pc as isize + disp) as usize;
                    }
                }
                0xEB => {
                    let disp = code[pc + 1] as i8 as isize;
                    pc = ((pc + 2) as isize + disp) as usize;
                }
                0xE9 => {
                    let disp = fetch_u32(code, pc + 1) as i32 as isize;
                    pc = ((pc + 5) as isize + disp) as usize;
                }
                other => panic!("opcode {:02x} at {:#x} not modeled", other, pc),
            }
        }
        panic!("stepper did not reach a halt point");
    }
}

fn compile(words: &[u32]) -> CompiledBlock {
    let cfg = JitConfig::default();
    let map = HostMap::synthetic();
    let dispatch = DispatchTable::new(&cfg);
    BlockCompiler::new(&cfg, &map, &dispatch, words, 0x8000_0000).compile()
}

/// Execute a one-branch block with the given guest register values and
/// return (branch_taken, last_addr).
fn run_branch(branch_word: u32, a0: u64, a1: u64) -> (u32, u32) {
    // branch / nop / nop / addiu $t0, $zero, 1 (in-block target) / pads
    let words = vec![branch_word, 0, 0, 0x2408_0001, 0, 0, 0, 0];
    let block = compile(&words);

    let mut machine = Machine::new();
    machine.write(CpuState::gpr(4).0, a0 as u32);
    machine.write(CpuState::gpr(4).hi_word().0, (a0 >> 32) as u32);
    machine.write(CpuState::gpr(5).0, a1 as u32);
    machine.write(CpuState::gpr(5).hi_word().0, (a1 >> 32) as u32);
    machine.write(CpuState::next_interrupt_cell().0, 1000);
    machine.write(CpuState::count_per_op_cell().0, 2);
    machine.write(CpuState::last_addr_cell().0, 0x8000_0000);

    machine.run(&block.code, block.entry_offsets[0] as usize);
    (
        machine.read(CpuState::branch_taken_cell().0),
        machine.read(CpuState::last_addr_cell().0),
    )
}

const TARGET: u32 = 0x8000_000C;
const FALL: u32 = 0x8000_0008;

#[test]
fn test_beq_taken_and_not_taken() {
    // beq $a0, $a1, +2
    let (taken, last) = run_branch(0x1085_0002, 7, 7);
    assert_eq!(taken, 1);
    assert_eq!(last, TARGET);

    let (taken, last) = run_branch(0x1085_0002, 7, 8);
    assert_eq!(taken, 0);
    assert_eq!(last, FALL);
}

#[test]
fn test_beq_compares_full_width() {
    // Equal low words, different upper words.
    let (taken, _) = run_branch(0x1085_0002, 0x1_0000_0007, 0x7);
    assert_eq!(taken, 0);
}

#[test]
fn test_bne_inverts_equality() {
    // bne $a0, $a1, +2
    let (taken, last) = run_branch(0x1485_0002, 1, 2);
    assert_eq!(taken, 1);
    assert_eq!(last, TARGET);

    let (taken, _) = run_branch(0x1485_0002, 2, 2);
    assert_eq!(taken, 0);
}

#[test]
fn test_bltz_tests_sign() {
    // bltz $a0, +2
    let negative = 0xFFFF_FFFF_FFFF_FFF6u64;
    let (taken, _) = run_branch(0x0480_0002, negative, 0);
    assert_eq!(taken, 1);
    let (taken, _) = run_branch(0x0480_0002, 5, 0);
    assert_eq!(taken, 0);
    let (taken, _) = run_branch(0x0480_0002, 0, 0);
    assert_eq!(taken, 0);
}

#[test]
fn test_bgez_includes_zero() {
    // bgez $a0, +2
    let (taken, _) = run_branch(0x0481_0002, 0, 0);
    assert_eq!(taken, 1);
    let (taken, _) = run_branch(0x0481_0002, 0xFFFF_FFFF_FFFF_FFFFu64, 0);
    assert_eq!(taken, 0);
}

#[test]
fn test_blez_boundary() {
    // blez $a0, +2
    let (taken, _) = run_branch(0x1880_0002, 0, 0);
    assert_eq!(taken, 1);
    let (taken, _) = run_branch(0x1880_0002, 0xFFFF_FFFF_8000_0000u64, 0);
    assert_eq!(taken, 1);
    let (taken, _) = run_branch(0x1880_0002, 1, 0);
    assert_eq!(taken, 0);
}

#[test]
fn test_bgtz_boundary() {
    // bgtz $a0, +2
    let (taken, _) = run_branch(0x1C80_0002, 1, 0);
    assert_eq!(taken, 1);
    let (taken, _) = run_branch(0x1C80_0002, 0, 0);
    assert_eq!(taken, 0);
}

#[test]
fn test_count_advanced_past_delay_slot() {
    let words = vec![0x1085_0002, 0, 0, 0x2408_0001, 0, 0, 0, 0];
    let block = compile(&words);

    let mut machine = Machine::new();
    machine.write(CpuState::next_interrupt_cell().0, 1000);
    machine.write(CpuState::count_per_op_cell().0, 2);
    machine.write(CpuState::last_addr_cell().0, 0x8000_0000);

    machine.run(&block.code, block.entry_offsets[0] as usize);
    // Two instructions at two cycles each.
    assert_eq!(machine.read(CpuState::cp0_reg(CP0_COUNT).0), 4);
}
