//! Opcode-indexed table of code generators.

use crate::config::JitConfig;
use crate::jit::compiler::BlockCompiler;
use crate::mips::{Opcode, OPCODE_COUNT};

pub type GenFn = fn(&mut BlockCompiler);

/// Fallback entry: hand the instruction to the interpreter.
fn interp(compiler: &mut BlockCompiler) {
    compiler.gen_interp();
}

/// Maps each opcode to its generator. Opcodes without a native generator,
/// and opcodes the configuration forces to interpretation, fall back to
/// the single-instruction interpreter call.
pub struct DispatchTable {
    entries: [GenFn; OPCODE_COUNT],
}

impl DispatchTable {
    pub fn new(cfg: &JitConfig) -> Self {
        let mut table = DispatchTable {
            entries: [interp as GenFn; OPCODE_COUNT],
        };

        table.set(cfg, Opcode::Nop, |c| c.gen_nop());

        table.set(cfg, Opcode::Lb, |c| c.gen_lb());
        table.set(cfg, Opcode::Lbu, |c| c.gen_lbu());
        table.set(cfg, Opcode::Lh, |c| c.gen_lh());
        table.set(cfg, Opcode::Lhu, |c| c.gen_lhu());
        table.set(cfg, Opcode::Lw, |c| c.gen_lw());
        table.set(cfg, Opcode::Lwu, |c| c.gen_lwu());
        table.set(cfg, Opcode::Ld, |c| c.gen_ld());
        table.set(cfg, Opcode::Sb, |c| c.gen_sb());
        table.set(cfg, Opcode::Sh, |c| c.gen_sh());
        table.set(cfg, Opcode::Sw, |c| c.gen_sw());
        table.set(cfg, Opcode::Sd, |c| c.gen_sd());

        table.set(cfg, Opcode::Add, |c| c.gen_add());
        table.set(cfg, Opcode::Addu, |c| c.gen_addu());
        table.set(cfg, Opcode::Addi, |c| c.gen_addi());
        table.set(cfg, Opcode::Addiu, |c| c.gen_addiu());
        table.set(cfg, Opcode::Sub, |c| c.gen_sub());
        table.set(cfg, Opcode::Subu, |c| c.gen_subu());
        table.set(cfg, Opcode::And, |c| c.gen_and());
        table.set(cfg, Opcode::Andi, |c| c.gen_andi());
        table.set(cfg, Opcode::Or, |c| c.gen_or());
        table.set(cfg, Opcode::Ori, |c| c.gen_ori());
        table.set(cfg, Opcode::Xor, |c| c.gen_xor());
        table.set(cfg, Opcode::Xori, |c| c.gen_xori());
        table.set(cfg, Opcode::Nor, |c| c.gen_nor());
        table.set(cfg, Opcode::Lui, |c| c.gen_lui());
        table.set(cfg, Opcode::Slt, |c| c.gen_slt());
        table.set(cfg, Opcode::Sltu, |c| c.gen_sltu());
        table.set(cfg, Opcode::Slti, |c| c.gen_slti());
        table.set(cfg, Opcode::Sltiu, |c| c.gen_sltiu());
        table.set(cfg, Opcode::Sll, |c| c.gen_sll());
        table.set(cfg, Opcode::Srl, |c| c.gen_srl());
        table.set(cfg, Opcode::Sra, |c| c.gen_sra());
        table.set(cfg, Opcode::Sllv, |c| c.gen_sllv());
        table.set(cfg, Opcode::Srlv, |c| c.gen_srlv());
        table.set(cfg, Opcode::Srav, |c| c.gen_srav());

        table.set(cfg, Opcode::Dadd, |c| c.gen_dadd());
        table.set(cfg, Opcode::Daddu, |c| c.gen_daddu());
        table.set(cfg, Opcode::Daddi, |c| c.gen_daddi());
        table.set(cfg, Opcode::Daddiu, |c| c.gen_daddiu());
        table.set(cfg, Opcode::Dsub, |c| c.gen_dsub());
        table.set(cfg, Opcode::Dsubu, |c| c.gen_dsubu());
        table.set(cfg, Opcode::Dsll, |c| c.gen_dsll());
        table.set(cfg, Opcode::Dsrl, |c| c.gen_dsrl());
        table.set(cfg, Opcode::Dsra, |c| c.gen_dsra());
        table.set(cfg, Opcode::Dsll32, |c| c.gen_dsll32());
        table.set(cfg, Opcode::Dsrl32, |c| c.gen_dsrl32());
        table.set(cfg, Opcode::Dsra32, |c| c.gen_dsra32());
        table.set(cfg, Opcode::Dsllv, |c| c.gen_dsllv());
        table.set(cfg, Opcode::Dsrlv, |c| c.gen_dsrlv());
        table.set(cfg, Opcode::Dsrav, |c| c.gen_dsrav());

        table.set(cfg, Opcode::Mult, |c| c.gen_mult());
        table.set(cfg, Opcode::Multu, |c| c.gen_multu());
        table.set(cfg, Opcode::Div, |c| c.gen_div());
        table.set(cfg, Opcode::Divu, |c| c.gen_divu());
        table.set(cfg, Opcode::Dmultu, |c| c.gen_dmultu());
        table.set(cfg, Opcode::Mfhi, |c| c.gen_mfhi());
        table.set(cfg, Opcode::Mthi, |c| c.gen_mthi());
        table.set(cfg, Opcode::Mflo, |c| c.gen_mflo());
        table.set(cfg, Opcode::Mtlo, |c| c.gen_mtlo());

        table.set(cfg, Opcode::J, |c| c.gen_j());
        table.set(cfg, Opcode::JOut, |c| c.gen_j_out());
        table.set(cfg, Opcode::JIdle, |c| c.gen_j_idle());
        table.set(cfg, Opcode::Jal, |c| c.gen_jal());
        table.set(cfg, Opcode::JalOut, |c| c.gen_jal_out());
        table.set(cfg, Opcode::JalIdle, |c| c.gen_jal_idle());
        table.set(cfg, Opcode::Jr, |c| c.gen_jr());
        table.set(cfg, Opcode::Jalr, |c| c.gen_jalr());

        table.set(cfg, Opcode::Beq, |c| c.gen_beq());
        table.set(cfg, Opcode::BeqOut, |c| c.gen_beq_out());
        table.set(cfg, Opcode::BeqIdle, |c| c.gen_beq_idle());
        table.set(cfg, Opcode::Beql, |c| c.gen_beql());
        table.set(cfg, Opcode::BeqlOut, |c| c.gen_beql_out());
        table.set(cfg, Opcode::BeqlIdle, |c| c.gen_beql_idle());
        table.set(cfg, Opcode::Bne, |c| c.gen_bne());
        table.set(cfg, Opcode::BneOut, |c| c.gen_bne_out());
        table.set(cfg, Opcode::BneIdle, |c| c.gen_bne_idle());
        table.set(cfg, Opcode::Bnel, |c| c.gen_bnel());
        table.set(cfg, Opcode::BnelOut, |c| c.gen_bnel_out());
        table.set(cfg, Opcode::BnelIdle, |c| c.gen_bnel_idle());
        table.set(cfg, Opcode::Blez, |c| c.gen_blez());
        table.set(cfg, Opcode::BlezOut, |c| c.gen_blez_out());
        table.set(cfg, Opcode::BlezIdle, |c| c.gen_blez_idle());
        table.set(cfg, Opcode::Blezl, |c| c.gen_blezl());
        table.set(cfg, Opcode::BlezlOut, |c| c.gen_blezl_out());
        table.set(cfg, Opcode::BlezlIdle, |c| c.gen_blezl_idle());
        table.set(cfg, Opcode::Bgtz, |c| c.gen_bgtz());
        table.set(cfg, Opcode::BgtzOut, |c| c.gen_bgtz_out());
        table.set(cfg, Opcode::BgtzIdle, |c| c.gen_bgtz_idle());
        table.set(cfg, Opcode::Bgtzl, |c| c.gen_bgtzl());
        table.set(cfg, Opcode::BgtzlOut, |c| c.gen_bgtzl_out());
        table.set(cfg, Opcode::BgtzlIdle, |c| c.gen_bgtzl_idle());
        table.set(cfg, Opcode::Bltz, |c| c.gen_bltz());
        table.set(cfg, Opcode::BltzOut, |c| c.gen_bltz_out());
        table.set(cfg, Opcode::BltzIdle, |c| c.gen_bltz_idle());
        table.set(cfg, Opcode::Bltzl, |c| c.gen_bltzl());
        table.set(cfg, Opcode::BltzlOut, |c| c.gen_bltzl_out());
        table.set(cfg, Opcode::BltzlIdle, |c| c.gen_bltzl_idle());
        table.set(cfg, Opcode::Bgez, |c| c.gen_bgez());
        table.set(cfg, Opcode::BgezOut, |c| c.gen_bgez_out());
        table.set(cfg, Opcode::BgezIdle, |c| c.gen_bgez_idle());
        table.set(cfg, Opcode::Bgezl, |c| c.gen_bgezl());
        table.set(cfg, Opcode::BgezlOut, |c| c.gen_bgezl_out());
        table.set(cfg, Opcode::BgezlIdle, |c| c.gen_bgezl_idle());

        table.set(cfg, Opcode::Mfc1, |c| c.gen_mfc1());
        table.set(cfg, Opcode::Dmfc1, |c| c.gen_dmfc1());
        table.set(cfg, Opcode::Cfc1, |c| c.gen_cfc1());
        table.set(cfg, Opcode::Mtc1, |c| c.gen_mtc1());
        table.set(cfg, Opcode::Dmtc1, |c| c.gen_dmtc1());
        table.set(cfg, Opcode::Ctc1, |c| c.gen_ctc1());
        table.set(cfg, Opcode::AddS, |c| c.gen_add_s());
        table.set(cfg, Opcode::SubS, |c| c.gen_sub_s());
        table.set(cfg, Opcode::MulS, |c| c.gen_mul_s());
        table.set(cfg, Opcode::DivS, |c| c.gen_div_s());
        table.set(cfg, Opcode::SqrtS, |c| c.gen_sqrt_s());
        table.set(cfg, Opcode::AbsS, |c| c.gen_abs_s());
        table.set(cfg, Opcode::MovS, |c| c.gen_mov_s());
        table.set(cfg, Opcode::NegS, |c| c.gen_neg_s());
        table.set(cfg, Opcode::TruncWS, |c| c.gen_trunc_w_s());
        table.set(cfg, Opcode::CvtDS, |c| c.gen_cvt_d_s());
        table.set(cfg, Opcode::AddD, |c| c.gen_add_d());
        table.set(cfg, Opcode::SubD, |c| c.gen_sub_d());
        table.set(cfg, Opcode::MulD, |c| c.gen_mul_d());
        table.set(cfg, Opcode::DivD, |c| c.gen_div_d());
        table.set(cfg, Opcode::SqrtD, |c| c.gen_sqrt_d());
        table.set(cfg, Opcode::AbsD, |c| c.gen_abs_d());
        table.set(cfg, Opcode::MovD, |c| c.gen_mov_d());
        table.set(cfg, Opcode::NegD, |c| c.gen_neg_d());
        table.set(cfg, Opcode::TruncWD, |c| c.gen_trunc_w_d());
        table.set(cfg, Opcode::CvtSD, |c| c.gen_cvt_s_d());
        table.set(cfg, Opcode::CvtSW, |c| c.gen_cvt_s_w());
        table.set(cfg, Opcode::CvtDW, |c| c.gen_cvt_d_w());

        table
    }

    fn set(&mut self, cfg: &JitConfig, op: Opcode, generator: GenFn) {
        if cfg.interprets(&format!("{:?}", op)) {
            return;
        }
        self.entries[op as usize] = generator;
    }

    pub fn entry(&self, op: Opcode) -> GenFn {
        self.entries[op as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlisted_opcodes_fall_back() {
        let cfg = JitConfig::default();
        let table = DispatchTable::new(&cfg);
        assert!(std::ptr::fn_addr_eq(
            table.entry(Opcode::Syscall),
            interp as GenFn
        ));
        assert!(std::ptr::fn_addr_eq(
            table.entry(Opcode::Dmult),
            interp as GenFn
        ));
        assert!(!std::ptr::fn_addr_eq(
            table.entry(Opcode::Addu),
            interp as GenFn
        ));
    }

    #[test]
    fn test_interpret_list_overrides_native_entry() {
        let mut cfg = JitConfig::default();
        cfg.interpret = vec!["addu".to_string()];
        let table = DispatchTable::new(&cfg);
        assert!(std::ptr::fn_addr_eq(
            table.entry(Opcode::Addu),
            interp as GenFn
        ));
    }
}
