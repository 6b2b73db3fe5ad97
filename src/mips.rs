//! MIPS R4300i instruction word decoding.
//!
//! Decoding happens per basic-block window: branch and jump instructions
//! are classified against the window bounds into their in-block,
//! out-of-block (`*Out`) and idle-loop (`*Idle`) variants, and any control
//! transfer that sits in a delay slot decodes as `Nop`.

use crate::cpu::GuestAddr;

/// Bounds of the block being translated, guest byte addresses.
#[derive(Debug, Clone, Copy)]
pub struct BlockWindow {
    pub start: u32,
    pub end: u32,
}

impl BlockWindow {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Operation selector for the translator's dispatch table.
///
/// Control transfers carry their classification in the variant itself.
/// `Reserved` stays last so the dispatch table can be sized off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Opcode {
    Nop,

    // Loads and stores.
    Lb,
    Lbu,
    Lh,
    Lhu,
    Lw,
    Lwu,
    Ld,
    Sb,
    Sh,
    Sw,
    Sd,

    // 32-bit ALU.
    Add,
    Addu,
    Addi,
    Addiu,
    Sub,
    Subu,
    And,
    Andi,
    Or,
    Ori,
    Xor,
    Xori,
    Nor,
    Lui,
    Slt,
    Sltu,
    Slti,
    Sltiu,
    Sll,
    Srl,
    Sra,
    Sllv,
    Srlv,
    Srav,

    // 64-bit ALU.
    Dadd,
    Daddu,
    Daddi,
    Daddiu,
    Dsub,
    Dsubu,
    Dsll,
    Dsrl,
    Dsra,
    Dsll32,
    Dsrl32,
    Dsra32,
    Dsllv,
    Dsrlv,
    Dsrav,

    // Multiply/divide and HI/LO.
    Mult,
    Multu,
    Div,
    Divu,
    Dmult,
    Dmultu,
    Ddiv,
    Ddivu,
    Mfhi,
    Mthi,
    Mflo,
    Mtlo,

    // Jumps.
    J,
    JOut,
    JIdle,
    Jal,
    JalOut,
    JalIdle,
    Jr,
    Jalr,

    // Branches: plain, likely, and their window classifications.
    Beq,
    BeqOut,
    BeqIdle,
    Beql,
    BeqlOut,
    BeqlIdle,
    Bne,
    BneOut,
    BneIdle,
    Bnel,
    BnelOut,
    BnelIdle,
    Blez,
    BlezOut,
    BlezIdle,
    Blezl,
    BlezlOut,
    BlezlIdle,
    Bgtz,
    BgtzOut,
    BgtzIdle,
    Bgtzl,
    BgtzlOut,
    BgtzlIdle,
    Bltz,
    BltzOut,
    BltzIdle,
    Bltzl,
    BltzlOut,
    BltzlIdle,
    Bgez,
    BgezOut,
    BgezIdle,
    Bgezl,
    BgezlOut,
    BgezlIdle,

    // Linking REGIMM branches, interpreter-delegated.
    Bltzal,
    Bgezal,
    Bltzall,
    Bgezall,

    // COP1 moves and arithmetic.
    Mfc1,
    Dmfc1,
    Cfc1,
    Mtc1,
    Dmtc1,
    Ctc1,
    AddS,
    SubS,
    MulS,
    DivS,
    SqrtS,
    AbsS,
    MovS,
    NegS,
    TruncWS,
    CvtDS,
    AddD,
    SubD,
    MulD,
    DivD,
    SqrtD,
    AbsD,
    MovD,
    NegD,
    TruncWD,
    CvtSD,
    CvtSW,
    CvtDW,

    // Interpreter-delegated groups.
    Lwl,
    Lwr,
    Ldl,
    Ldr,
    Swl,
    Swr,
    Sdl,
    Sdr,
    Ll,
    Sc,
    Lwc1,
    Ldc1,
    Swc1,
    Sdc1,
    Cp1Branch,
    Cp1Compare,
    Cp1Other,
    Mfc0,
    Mtc0,
    TlbOp,
    Eret,
    Cache,
    Sync,
    Syscall,
    Break,
    Trap,
    Reserved,
}

/// Number of dispatch-table slots.
pub const OPCODE_COUNT: usize = Opcode::Reserved as usize + 1;

impl Opcode {
    /// Operations after which translation cannot continue linearly.
    pub fn ends_block(self) -> bool {
        matches!(self, Opcode::J | Opcode::JOut | Opcode::JIdle | Opcode::Jr | Opcode::Eret)
    }

    /// Any control transfer; these decode as `Nop` inside a delay slot.
    pub fn is_control_transfer(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            J | JOut
                | JIdle
                | Jal
                | JalOut
                | JalIdle
                | Jr
                | Jalr
                | Beq
                | BeqOut
                | BeqIdle
                | Beql
                | BeqlOut
                | BeqlIdle
                | Bne
                | BneOut
                | BneIdle
                | Bnel
                | BnelOut
                | BnelIdle
                | Blez
                | BlezOut
                | BlezIdle
                | Blezl
                | BlezlOut
                | BlezlIdle
                | Bgtz
                | BgtzOut
                | BgtzIdle
                | Bgtzl
                | BgtzlOut
                | BgtzlIdle
                | Bltz
                | BltzOut
                | BltzIdle
                | Bltzl
                | BltzlOut
                | BltzlIdle
                | Bgez
                | BgezOut
                | BgezIdle
                | Bgezl
                | BgezlOut
                | BgezlIdle
                | Bltzal
                | Bgezal
                | Bltzall
                | Bgezall
                | Cp1Branch
                | Eret
        )
    }
}

/// One decoded instruction plus the translation metadata attached to it.
///
/// `needed` is stamped retroactively by the register cache: slot `i` holds
/// the guest cell that host register `i` must contain when control enters
/// the generated code for this instruction. `need_map` marks entries
/// reachable only through their reconciliation wrapper.
#[derive(Debug, Clone)]
pub struct Insn {
    pub addr: u32,
    pub opcode: Opcode,
    pub rs: usize,
    pub rt: usize,
    pub rd: usize,
    pub sa: u32,
    pub imm: i16,
    /// Absolute guest target for branches and jumps.
    pub target: u32,
    /// Offset of this instruction's generated code in the block buffer.
    pub local_addr: u32,
    pub needed: [Option<GuestAddr>; 8],
    pub need_map: bool,
    /// Offset of the reconciliation wrapper, once emitted.
    pub wrapper_offset: u32,
}

impl Insn {
    fn new(addr: u32, opcode: Opcode, iw: u32) -> Self {
        Insn {
            addr,
            opcode,
            rs: ((iw >> 21) & 0x1F) as usize,
            rt: ((iw >> 16) & 0x1F) as usize,
            rd: ((iw >> 11) & 0x1F) as usize,
            sa: (iw >> 6) & 0x1F,
            imm: iw as u16 as i16,
            target: 0,
            local_addr: 0,
            needed: [None; 8],
            need_map: false,
            wrapper_offset: 0,
        }
    }

    /// COP1 source register (fs field).
    pub fn fs(&self) -> usize {
        self.rd
    }

    /// COP1 second source (ft field).
    pub fn ft(&self) -> usize {
        self.rt
    }

    /// COP1 destination (fd field).
    pub fn fd(&self) -> usize {
        self.sa as usize
    }
}

/// Classify a relative branch against the block window.
fn classify_branch(
    insn: &mut Insn,
    plain: Opcode,
    out: Opcode,
    idle: Opcode,
    next_iw: u32,
    window: &BlockWindow,
) {
    insn.target = insn
        .addr
        .wrapping_add(4)
        .wrapping_add(((insn.imm as i32) << 2) as u32);
    insn.opcode = if insn.imm == -1 && next_iw == 0 {
        idle
    } else if window.contains(insn.target) {
        plain
    } else {
        out
    };
}

fn classify_jump(
    insn: &mut Insn,
    iw: u32,
    plain: Opcode,
    out: Opcode,
    idle: Opcode,
    next_iw: u32,
    window: &BlockWindow,
) {
    insn.target = (insn.addr & 0xF000_0000) | ((iw & 0x03FF_FFFF) << 2);
    insn.opcode = if insn.target == insn.addr && next_iw == 0 {
        idle
    } else if window.contains(insn.target) {
        plain
    } else {
        out
    };
}

/// Decode one instruction word at `addr`, classifying control transfers
/// against `window`. `next_iw` is the following word, used only for
/// idle-loop detection.
pub fn decode(iw: u32, next_iw: u32, addr: u32, window: &BlockWindow, in_delay_slot: bool) -> Insn {
    use Opcode::*;

    let mut insn = Insn::new(addr, Reserved, iw);
    let op = iw >> 26;
    match op {
        0 => {
            insn.opcode = match iw & 0x3F {
                0 => {
                    if iw == 0 {
                        Nop
                    } else {
                        Sll
                    }
                }
                2 => Srl,
                3 => Sra,
                4 => Sllv,
                6 => Srlv,
                7 => Srav,
                8 => Jr,
                9 => Jalr,
                12 => Syscall,
                13 => Break,
                15 => Sync,
                16 => Mfhi,
                17 => Mthi,
                18 => Mflo,
                19 => Mtlo,
                20 => Dsllv,
                22 => Dsrlv,
                23 => Dsrav,
                24 => Mult,
                25 => Multu,
                26 => Div,
                27 => Divu,
                28 => Dmult,
                29 => Dmultu,
                30 => Ddiv,
                31 => Ddivu,
                32 => Add,
                33 => Addu,
                34 => Sub,
                35 => Subu,
                36 => And,
                37 => Or,
                38 => Xor,
                39 => Nor,
                42 => Slt,
                43 => Sltu,
                44 => Dadd,
                45 => Daddu,
                46 => Dsub,
                47 => Dsubu,
                48..=54 => Trap,
                56 => Dsll,
                58 => Dsrl,
                59 => Dsra,
                60 => Dsll32,
                62 => Dsrl32,
                63 => Dsra32,
                _ => Reserved,
            };
        }
        1 => match (iw >> 16) & 0x1F {
            0 => classify_branch(&mut insn, Bltz, BltzOut, BltzIdle, next_iw, window),
            1 => classify_branch(&mut insn, Bgez, BgezOut, BgezIdle, next_iw, window),
            2 => classify_branch(&mut insn, Bltzl, BltzlOut, BltzlIdle, next_iw, window),
            3 => classify_branch(&mut insn, Bgezl, BgezlOut, BgezlIdle, next_iw, window),
            8..=14 => insn.opcode = Trap,
            16 => insn.opcode = Bltzal,
            17 => insn.opcode = Bgezal,
            18 => insn.opcode = Bltzall,
            19 => insn.opcode = Bgezall,
            _ => insn.opcode = Reserved,
        },
        2 => classify_jump(&mut insn, iw, J, JOut, JIdle, next_iw, window),
        3 => classify_jump(&mut insn, iw, Jal, JalOut, JalIdle, next_iw, window),
        4 => classify_branch(&mut insn, Beq, BeqOut, BeqIdle, next_iw, window),
        5 => classify_branch(&mut insn, Bne, BneOut, BneIdle, next_iw, window),
        6 => classify_branch(&mut insn, Blez, BlezOut, BlezIdle, next_iw, window),
        7 => classify_branch(&mut insn, Bgtz, BgtzOut, BgtzIdle, next_iw, window),
        8 => insn.opcode = Addi,
        9 => insn.opcode = Addiu,
        10 => insn.opcode = Slti,
        11 => insn.opcode = Sltiu,
        12 => insn.opcode = Andi,
        13 => insn.opcode = Ori,
        14 => insn.opcode = Xori,
        15 => insn.opcode = Lui,
        16 => {
            insn.opcode = match (iw >> 21) & 0x1F {
                0 => Mfc0,
                4 => Mtc0,
                16..=31 => match iw & 0x3F {
                    1 | 2 | 6 | 8 => TlbOp,
                    24 => Eret,
                    _ => Reserved,
                },
                _ => Reserved,
            };
        }
        17 => decode_cop1(&mut insn, iw),
        20 => classify_branch(&mut insn, Beql, BeqlOut, BeqlIdle, next_iw, window),
        21 => classify_branch(&mut insn, Bnel, BnelOut, BnelIdle, next_iw, window),
        22 => classify_branch(&mut insn, Blezl, BlezlOut, BlezlIdle, next_iw, window),
        23 => classify_branch(&mut insn, Bgtzl, BgtzlOut, BgtzlIdle, next_iw, window),
        24 => insn.opcode = Daddi,
        25 => insn.opcode = Daddiu,
        26 => insn.opcode = Ldl,
        27 => insn.opcode = Ldr,
        32 => insn.opcode = Lb,
        33 => insn.opcode = Lh,
        34 => insn.opcode = Lwl,
        35 => insn.opcode = Lw,
        36 => insn.opcode = Lbu,
        37 => insn.opcode = Lhu,
        38 => insn.opcode = Lwr,
        39 => insn.opcode = Lwu,
        40 => insn.opcode = Sb,
        41 => insn.opcode = Sh,
        42 => insn.opcode = Swl,
        43 => insn.opcode = Sw,
        44 => insn.opcode = Sdl,
        45 => insn.opcode = Sdr,
        46 => insn.opcode = Swr,
        47 => insn.opcode = Cache,
        48 => insn.opcode = Ll,
        49 => insn.opcode = Lwc1,
        53 => insn.opcode = Ldc1,
        55 => insn.opcode = Ld,
        56 => insn.opcode = Sc,
        57 => insn.opcode = Swc1,
        61 => insn.opcode = Sdc1,
        63 => insn.opcode = Sd,
        _ => insn.opcode = Reserved,
    }

    if in_delay_slot && insn.opcode.is_control_transfer() {
        insn.opcode = Nop;
    }
    insn
}

fn decode_cop1(insn: &mut Insn, iw: u32) {
    use Opcode::*;

    let fmt = (iw >> 21) & 0x1F;
    let funct = iw & 0x3F;
    insn.opcode = match fmt {
        0 => Mfc1,
        1 => Dmfc1,
        2 => Cfc1,
        4 => Mtc1,
        5 => Dmtc1,
        6 => Ctc1,
        8 => Cp1Branch,
        16 => match funct {
            0 => AddS,
            1 => SubS,
            2 => MulS,
            3 => DivS,
            4 => SqrtS,
            5 => AbsS,
            6 => MovS,
            7 => NegS,
            13 => TruncWS,
            33 => CvtDS,
            48..=63 => Cp1Compare,
            _ => Cp1Other,
        },
        17 => match funct {
            0 => AddD,
            1 => SubD,
            2 => MulD,
            3 => DivD,
            4 => SqrtD,
            5 => AbsD,
            6 => MovD,
            7 => NegD,
            13 => TruncWD,
            32 => CvtSD,
            48..=63 => Cp1Compare,
            _ => Cp1Other,
        },
        20 => match funct {
            32 => CvtSW,
            33 => CvtDW,
            _ => Cp1Other,
        },
        21 => Cp1Other,
        _ => Reserved,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: BlockWindow = BlockWindow {
        start: 0x8000_0000,
        end: 0x8000_1000,
    };

    fn dec(iw: u32, addr: u32) -> Insn {
        decode(iw, 0x2400_0000, addr, &WINDOW, false)
    }

    #[test]
    fn test_decode_addiu_fields() {
        // addiu $t0, $s1, -0x10
        let insn = dec(0x2628_FFF0, 0x8000_0000);
        assert_eq!(insn.opcode, Opcode::Addiu);
        assert_eq!(insn.rs, 17);
        assert_eq!(insn.rt, 8);
        assert_eq!(insn.imm, -0x10);
    }

    #[test]
    fn test_branch_in_window_stays_plain() {
        // beq $a0, $a1, +8
        let insn = dec(0x1085_0008, 0x8000_0100);
        assert_eq!(insn.opcode, Opcode::Beq);
        assert_eq!(insn.target, 0x8000_0128);
    }

    #[test]
    fn test_branch_leaving_window_is_out() {
        let insn = dec(0x1085_0400, 0x8000_0F00);
        assert_eq!(insn.opcode, Opcode::BeqOut);
    }

    #[test]
    fn test_branch_to_self_over_nop_is_idle() {
        // beq $zero, $zero, -1 followed by nop
        let insn = decode(0x1000_FFFF, 0, 0x8000_0200, &WINDOW, false);
        assert_eq!(insn.opcode, Opcode::BeqIdle);
    }

    #[test]
    fn test_jump_target_and_classification() {
        // j 0x8000_0040
        let insn = dec(0x0800_0010, 0x8000_0800);
        assert_eq!(insn.opcode, Opcode::J);
        assert_eq!(insn.target, 0x8000_0040);

        let insn = dec(0x0BF0_0000, 0x8000_0800);
        assert_eq!(insn.opcode, Opcode::JOut);
    }

    #[test]
    fn test_jump_to_self_over_nop_is_idle() {
        // j . at 0x80000200 (index 0x80) with a zero delay slot
        let insn = decode(0x0800_0080, 0, 0x8000_0200, &WINDOW, false);
        assert_eq!(insn.opcode, Opcode::JIdle);
    }

    #[test]
    fn test_branch_in_delay_slot_becomes_nop() {
        let insn = decode(0x1085_0008, 0x2400_0000, 0x8000_0100, &WINDOW, true);
        assert_eq!(insn.opcode, Opcode::Nop);
    }

    #[test]
    fn test_likely_branch_keeps_distinct_opcode() {
        // beql $a0, $a1, +4
        let insn = dec(0x5085_0004, 0x8000_0100);
        assert_eq!(insn.opcode, Opcode::Beql);
    }

    #[test]
    fn test_cop1_space() {
        // add.d $f2, $f4, $f6
        let insn = dec(0x4626_2080, 0x8000_0000);
        assert_eq!(insn.opcode, Opcode::AddD);
        assert_eq!(insn.fs(), 4);
        assert_eq!(insn.ft(), 6);
        assert_eq!(insn.fd(), 2);

        // trunc.w.s $f0, $f12
        let insn = dec(0x4600_600D, 0x8000_0000);
        assert_eq!(insn.opcode, Opcode::TruncWS);

        // c.lt.d
        let insn = dec(0x4622_003C, 0x8000_0000);
        assert_eq!(insn.opcode, Opcode::Cp1Compare);
    }

    #[test]
    fn test_special_and_regimm() {
        // dsll32 $t0, $t1, 4
        let insn = dec(0x0009_413C, 0x8000_0000);
        assert_eq!(insn.opcode, Opcode::Dsll32);

        // bltzal $s0, +4
        let insn = dec(0x0610_0004, 0x8000_0000);
        assert_eq!(insn.opcode, Opcode::Bltzal);

        // eret
        let insn = dec(0x4200_0018, 0x8000_0000);
        assert_eq!(insn.opcode, Opcode::Eret);
        assert!(insn.opcode.ends_block());
    }

    #[test]
    fn test_reserved_is_last_for_table_sizing() {
        assert_eq!(OPCODE_COUNT, Opcode::Reserved as usize + 1);
        assert!((Opcode::Nop as usize) < OPCODE_COUNT);
    }
}
