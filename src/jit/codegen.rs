//! Per-instruction x86 code generators.
//!
//! Every generator runs with `self.idx` pointing at the instruction being
//! translated. Generators either keep guest values in the register cache
//! (ALU, shifts) or flush it and work through fixed registers (memory
//! access, control flow, COP1). Branch generators fold the following
//! delay-slot instruction into their own code region; the block loop then
//! re-emits that instruction standalone as a branch target, and the
//! branch jumps over the duplicate.

use crate::cpu::{
    CpuState, GuestAddr, CEIL_MODE, CP0_COUNT, CP0_STATUS, FLOOR_MODE, ROUND_MODE, STATUS_CU1,
    TRUNC_MODE,
};
use crate::jit::compiler::BlockCompiler;
use crate::jit::x86::{Cond, Reg, X86Assembler};
use crate::mips::Opcode;

/// Call an out-of-line helper with the cdecl context argument.
///
/// `via` must be a register the caller can spare; the helper's address is
/// materialized there because there is no absolute call encoding.
fn call_helper(asm: &mut X86Assembler, via: Reg, helper: u32, ctx: u32) {
    asm.push_imm32(ctx);
    asm.mov_reg_imm32(via, helper);
    asm.call_reg(via);
    asm.add_esp_imm8(4);
}

impl<'a> BlockCompiler<'a> {
    // ==================== Interpreter fallback and glue ====================

    /// Hand the current instruction to the interpreter. `jump` marks
    /// control transfers, which additionally complete the jump through
    /// the dispatcher helper afterwards.
    pub(crate) fn interp_call(&mut self, jump: bool) {
        let addr = self.insns[self.idx].addr;
        let pc = self.state_cell(CpuState::pc_cell());
        let dyna_interp = self.state_cell(CpuState::dyna_interp_cell());
        let (interp_op, dyna_jump, ctx) = (self.map.interp_op, self.map.dyna_jump, self.map.ctx);

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        if jump {
            asm.mov_m32abs_imm32(dyna_interp, 1);
        }
        asm.mov_m32abs_imm32(pc, addr);
        call_helper(&mut asm, Reg::Eax, interp_op, ctx);
        if jump {
            asm.mov_m32abs_imm32(dyna_interp, 0);
            call_helper(&mut asm, Reg::Eax, dyna_jump, ctx);
        }
    }

    /// Dispatch default: interpret, completing the jump for control
    /// transfers.
    pub(crate) fn gen_interp(&mut self) {
        let jump = self.insns[self.idx].opcode.is_control_transfer();
        self.interp_call(jump);
    }

    pub(crate) fn gen_nop(&mut self) {}

    /// Raise the coprocessor-unusable exception when Status.CU1 is clear.
    pub(crate) fn check_cop1_unusable(&mut self) {
        let addr = self.insns[self.idx].addr;
        let status = self.state_cell(CpuState::cp0_reg(CP0_STATUS));
        let pc = self.state_cell(CpuState::pc_cell());
        let (check_cop1, ctx) = (self.map.check_cop1, self.map.ctx);

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.test_m32abs_imm32(status, STATUS_CU1);
        let usable = asm.jcc_rel8(Cond::Ne);
        asm.mov_m32abs_imm32(pc, addr);
        call_helper(&mut asm, Reg::Eax, check_cop1, ctx);
        self.buf.end_rel8(usable);
    }

    /// Advance Count by the instructions executed since `last_addr`.
    pub(crate) fn cp0_update_count(&mut self, addr: u32) {
        let last_addr = self.state_cell(CpuState::last_addr_cell());
        let count = self.state_cell(CpuState::cp0_reg(CP0_COUNT));
        let count_per_op = self.state_cell(CpuState::count_per_op_cell());

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_imm32(Reg::Eax, addr);
        asm.sub_reg_m32abs(Reg::Eax, last_addr);
        asm.shr_reg_imm8(Reg::Eax, 2);
        asm.mov_reg_m32abs(Reg::Edx, count_per_op);
        asm.mul_reg(Reg::Edx);
        asm.add_m32abs_reg(count, Reg::Eax);
    }

    /// Fire the interrupt helper when Count has passed the threshold,
    /// resuming at `resume`.
    pub(crate) fn check_interrupt(&mut self, resume: u32) {
        let next_interrupt = self.state_cell(CpuState::next_interrupt_cell());
        let count = self.state_cell(CpuState::cp0_reg(CP0_COUNT));
        let pc = self.state_cell(CpuState::pc_cell());
        let (gen_interrupt, ctx) = (self.map.gen_interrupt, self.map.ctx);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, next_interrupt);
        asm.cmp_reg_m32abs(Reg::Eax, count);
        let pending_none = asm.jcc_rel8(Cond::A);
        asm.mov_m32abs_imm32(pc, resume);
        call_helper(&mut asm, Reg::Eax, gen_interrupt, ctx);
        self.buf.end_rel8(pending_none);
    }

    /// As [`check_interrupt`](Self::check_interrupt) with the resume
    /// address in EAX instead of an immediate.
    pub(crate) fn check_interrupt_reg(&mut self) {
        let next_interrupt = self.state_cell(CpuState::next_interrupt_cell());
        let count = self.state_cell(CpuState::cp0_reg(CP0_COUNT));
        let pc = self.state_cell(CpuState::pc_cell());
        let (gen_interrupt, ctx) = (self.map.gen_interrupt, self.map.ctx);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Ebx, next_interrupt);
        asm.cmp_reg_m32abs(Reg::Ebx, count);
        let pending_none = asm.jcc_rel8(Cond::A);
        asm.mov_m32abs_reg(pc, Reg::Eax);
        call_helper(&mut asm, Reg::Ebx, gen_interrupt, ctx);
        self.buf.end_rel8(pending_none);
    }

    /// Translate the delay-slot instruction inline, with the delay_slot
    /// flag raised around it and the cycle counter advanced past it.
    /// Advances `idx` onto the slot; callers read branch fields through
    /// `idx - 1` afterwards.
    pub(crate) fn delay_slot(&mut self) {
        let ds = self.state_cell(CpuState::delay_slot_cell());
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(ds, 1);

        self.idx += 1;
        self.insns[self.idx].need_map = false;
        let op = self.insns[self.idx].opcode;
        // A control transfer in a delay slot executes as a no-op.
        let effective = if op.is_control_transfer() { Opcode::Nop } else { op };
        (self.dispatch.entry(effective))(self);

        self.delay_slot_compiled = 2;
        self.free_all();
        let next = self.insns[self.idx].addr.wrapping_add(4);
        self.cp0_update_count(next);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(ds, 0);
    }

    /// Near jump to another instruction of this block, resolved by the
    /// second pass.
    pub(crate) fn in_block_jump(&mut self, target: u32) {
        let mut asm = X86Assembler::new(&mut self.buf);
        let rel = asm.jmp_rel32();
        self.linker.add_jump(rel.offset(), target);
    }

    /// Control transfers straddling the last word of a page (or all of
    /// them, when configured) go through the interpreter.
    fn branch_delegated(&self) -> bool {
        let addr = self.insns[self.idx].addr;
        ((addr & 0xFFF) == 0xFFC && !(0x8000_0000..0xC000_0000).contains(&addr))
            || self.cfg.no_compiled_jump
    }

    /// Landing pad for execution running off the end of the block.
    pub(crate) fn gen_fin_block(&mut self) {
        let addr = self.insns[self.idx].addr;
        let pc = self.state_cell(CpuState::pc_cell());
        let (fin_block, ctx) = (self.map.fin_block, self.map.ctx);

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(pc, addr);
        call_helper(&mut asm, Reg::Eax, fin_block, ctx);
    }

    /// Tail emitted when translation stops inside the block: continue at
    /// the next instruction's entry. Unreachable in practice, since only
    /// non-falling-through instructions stop translation early.
    pub(crate) fn gen_link_subblock(&mut self) {
        self.free_all();
        let next = self.insns[self.idx].addr.wrapping_add(4);
        self.in_block_jump(next);
    }

    // ==================== Branch tails ====================

    /// Dispatch on branch_taken after the delay slot: both edges stay in
    /// the block.
    fn test_branch(&mut self) {
        let target = self.insns[self.idx - 1].target;
        let fall = self.insns[self.idx].addr.wrapping_add(4);
        let bt = self.state_cell(CpuState::branch_taken_cell());
        let last_addr = self.state_cell(CpuState::last_addr_cell());

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_m32abs_imm32(bt, 0);
        let not_taken = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(last_addr, target);
        self.check_interrupt(target);
        self.in_block_jump(target);
        self.buf.end_rel32(not_taken);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(last_addr, fall);
        self.check_interrupt(fall);
        self.in_block_jump(fall);
    }

    /// Taken edge leaves the block through the re-entry helper.
    fn test_branch_out(&mut self) {
        let target = self.insns[self.idx - 1].target;
        let fall = self.insns[self.idx].addr.wrapping_add(4);
        let bt = self.state_cell(CpuState::branch_taken_cell());
        let last_addr = self.state_cell(CpuState::last_addr_cell());
        let jump_to = self.state_cell(CpuState::jump_to_address_cell());
        let pc = self.state_cell(CpuState::pc_cell());
        let (jump_to_recomp, ctx) = (self.map.jump_to_recomp, self.map.ctx);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_m32abs_imm32(bt, 0);
        let not_taken = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(last_addr, target);
        self.check_interrupt(target);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(jump_to, target);
        asm.mov_m32abs_imm32(pc, fall);
        call_helper(&mut asm, Reg::Eax, jump_to_recomp, ctx);
        self.buf.end_rel32(not_taken);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(last_addr, fall);
        self.check_interrupt(fall);
        self.in_block_jump(fall);
    }

    /// Skip Count ahead to just short of the interrupt threshold when an
    /// idle loop's branch is taken.
    fn test_branch_idle(&mut self) {
        let bt = self.state_cell(CpuState::branch_taken_cell());
        let next_interrupt = self.state_cell(CpuState::next_interrupt_cell());
        let count = self.state_cell(CpuState::cp0_reg(CP0_COUNT));

        let reg = self.lru();
        self.free_reg(reg);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_m32abs_imm32(bt, 0);
        let not_taken = asm.jcc_rel32(Cond::E);
        asm.mov_reg_m32abs(reg, next_interrupt);
        asm.sub_reg_m32abs(reg, count);
        asm.cmp_reg_imm32(reg, 5);
        let too_close = asm.jcc_rel8(Cond::Be);
        asm.sub_reg_imm32(reg, 2);
        asm.and_reg_imm32(reg, 0xFFFF_FFFC);
        asm.add_m32abs_reg(count, reg);
        self.buf.end_rel8(too_close);
        self.buf.end_rel32(not_taken);
    }

    /// Likely-branch tail: the delay slot is executed only on the taken
    /// edge, inside the test's bracket.
    fn test_branch_likely(&mut self, out: bool) {
        let bt = self.state_cell(CpuState::branch_taken_cell());
        let last_addr = self.state_cell(CpuState::last_addr_cell());
        let jump_to = self.state_cell(CpuState::jump_to_address_cell());
        let pc = self.state_cell(CpuState::pc_cell());
        let (jump_to_recomp, ctx) = (self.map.jump_to_recomp, self.map.ctx);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_m32abs_imm32(bt, 0);
        let not_taken = asm.jcc_rel32(Cond::E);
        self.delay_slot();

        let target = self.insns[self.idx - 1].target;
        let fall = self.insns[self.idx].addr.wrapping_add(4);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(last_addr, target);
        self.check_interrupt(target);
        if out {
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_m32abs_imm32(jump_to, target);
            asm.mov_m32abs_imm32(pc, fall);
            call_helper(&mut asm, Reg::Eax, jump_to_recomp, ctx);
        } else {
            self.in_block_jump(target);
        }
        self.buf.end_rel32(not_taken);

        self.cp0_update_count(fall);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(last_addr, fall);
        self.check_interrupt(fall);
        self.in_block_jump(fall);
    }

    // ==================== Branch shapes ====================

    fn branch(&mut self, test: fn(&mut Self)) {
        if self.branch_delegated() {
            self.interp_call(true);
            return;
        }
        test(self);
        self.delay_slot();
        self.test_branch();
    }

    fn branch_out(&mut self, test: fn(&mut Self)) {
        if self.branch_delegated() {
            self.interp_call(true);
            return;
        }
        test(self);
        self.delay_slot();
        self.test_branch_out();
    }

    fn branch_idle(&mut self, test: fn(&mut Self)) {
        test(self);
        self.test_branch_idle();
        self.branch(test);
    }

    fn branch_likely(&mut self, test: fn(&mut Self)) {
        if self.branch_delegated() {
            self.interp_call(true);
            return;
        }
        test(self);
        self.free_all();
        self.test_branch_likely(false);
    }

    fn branch_likely_out(&mut self, test: fn(&mut Self)) {
        if self.branch_delegated() {
            self.interp_call(true);
            return;
        }
        test(self);
        self.free_all();
        self.test_branch_likely(true);
    }

    fn branch_likely_idle(&mut self, test: fn(&mut Self)) {
        test(self);
        self.test_branch_idle();
        self.branch_likely(test);
    }

    // ==================== Branch condition tests ====================

    /// Compare rs and rt for equality and store `if_eq`/`if_ne` into
    /// branch_taken, at whatever width the operands are currently cached.
    fn eq_test(&mut self, if_eq: u32, if_ne: u32) {
        let (rs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let bt = self.state_cell(CpuState::branch_taken_cell());

        match (self.is64(rs_cell), self.is64(rt_cell)) {
            (Some(false), Some(false)) => {
                let rs = self.alloc(rs_cell);
                let rt = self.alloc(rt_cell);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_reg_reg(rs, rt);
                let differ = asm.jcc_rel8(Cond::Ne);
                asm.mov_m32abs_imm32(bt, if_eq);
                let done = asm.jmp_rel8();
                self.buf.end_rel8(differ);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, if_ne);
                self.buf.end_rel8(done);
            }
            (None, _) => {
                // rs uncached: compare rt's pair against rs in memory.
                let rt1 = self.alloc64_lo(rt_cell);
                let rt2 = self.alloc64_hi(rt_cell);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_reg_m32abs(rt1, rs_cell);
                let differ_lo = asm.jcc_rel8(Cond::Ne);
                asm.cmp_reg_m32abs(rt2, rs_cell.hi_word());
                let differ_hi = asm.jcc_rel8(Cond::Ne);
                asm.mov_m32abs_imm32(bt, if_eq);
                let done = asm.jmp_rel8();
                self.buf.end_rel8(differ_lo);
                self.buf.end_rel8(differ_hi);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, if_ne);
                self.buf.end_rel8(done);
            }
            (_, None) => {
                let rs1 = self.alloc64_lo(rs_cell);
                let rs2 = self.alloc64_hi(rs_cell);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_reg_m32abs(rs1, rt_cell);
                let differ_lo = asm.jcc_rel8(Cond::Ne);
                asm.cmp_reg_m32abs(rs2, rt_cell.hi_word());
                let differ_hi = asm.jcc_rel8(Cond::Ne);
                asm.mov_m32abs_imm32(bt, if_eq);
                let done = asm.jmp_rel8();
                self.buf.end_rel8(differ_lo);
                self.buf.end_rel8(differ_hi);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, if_ne);
                self.buf.end_rel8(done);
            }
            _ => {
                // At least one side is 64-bit; widen the other to match.
                // The already-wide side is allocated last so widening the
                // narrow one cannot evict half of it.
                let (rs1, rs2, rt1, rt2) = if self.is64(rs_cell) == Some(false) {
                    let rt1 = self.alloc64_lo(rt_cell);
                    let rt2 = self.alloc64_hi(rt_cell);
                    let rs1 = self.alloc64_lo(rs_cell);
                    let rs2 = self.alloc64_hi(rs_cell);
                    (rs1, rs2, rt1, rt2)
                } else {
                    let rs1 = self.alloc64_lo(rs_cell);
                    let rs2 = self.alloc64_hi(rs_cell);
                    let rt1 = self.alloc64_lo(rt_cell);
                    let rt2 = self.alloc64_hi(rt_cell);
                    (rs1, rs2, rt1, rt2)
                };
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_reg_reg(rs1, rt1);
                let differ_lo = asm.jcc_rel8(Cond::Ne);
                asm.cmp_reg_reg(rs2, rt2);
                let differ_hi = asm.jcc_rel8(Cond::Ne);
                asm.mov_m32abs_imm32(bt, if_eq);
                let done = asm.jmp_rel8();
                self.buf.end_rel8(differ_lo);
                self.buf.end_rel8(differ_hi);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, if_ne);
                self.buf.end_rel8(done);
            }
        }
    }

    /// Test the sign of rs; only the upper word matters for cached 64-bit
    /// and uncached operands.
    fn sign_test(&mut self, taken_if_negative: bool) {
        let rs = self.insns[self.idx].rs;
        let rs_cell = self.gpr_cell(rs);
        let bt = self.state_cell(CpuState::branch_taken_cell());

        match self.is64(rs_cell) {
            Some(false) => {
                let rs = self.alloc(rs_cell);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_reg_imm32(rs, 0);
            }
            None => {
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_m32abs_imm32(rs_cell.hi_word(), 0);
            }
            Some(true) => {
                let rs2 = self.alloc64_hi(rs_cell);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_reg_imm32(rs2, 0);
            }
        }

        let cond = if taken_if_negative { Cond::Ge } else { Cond::L };
        let mut asm = X86Assembler::new(&mut self.buf);
        let other = asm.jcc_rel8(cond);
        asm.mov_m32abs_imm32(bt, 1);
        let done = asm.jmp_rel8();
        self.buf.end_rel8(other);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(bt, 0);
        self.buf.end_rel8(done);
    }

    /// Compare rs against zero for the <=0 / >0 pair of conditions.
    fn le_zero_test(&mut self, le_val: u32, gt_val: u32) {
        let rs = self.insns[self.idx].rs;
        let rs_cell = self.gpr_cell(rs);
        let bt = self.state_cell(CpuState::branch_taken_cell());

        match self.is64(rs_cell) {
            Some(false) => {
                let rs = self.alloc(rs_cell);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_reg_imm32(rs, 0);
                let greater = asm.jcc_rel8(Cond::G);
                asm.mov_m32abs_imm32(bt, le_val);
                let done = asm.jmp_rel8();
                self.buf.end_rel8(greater);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, gt_val);
                self.buf.end_rel8(done);
            }
            None => {
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_m32abs_imm32(rs_cell.hi_word(), 0);
                let greater = asm.jcc_rel8(Cond::G);
                let negative = asm.jcc_rel8(Cond::Ne);
                asm.cmp_m32abs_imm32(rs_cell, 0);
                let zero = asm.jcc_rel8(Cond::E);
                self.buf.end_rel8(greater);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, gt_val);
                let done = asm.jmp_rel8();
                self.buf.end_rel8(negative);
                self.buf.end_rel8(zero);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, le_val);
                self.buf.end_rel8(done);
            }
            Some(true) => {
                let rs1 = self.alloc64_lo(rs_cell);
                let rs2 = self.alloc64_hi(rs_cell);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.cmp_reg_imm32(rs2, 0);
                let greater = asm.jcc_rel8(Cond::G);
                let negative = asm.jcc_rel8(Cond::Ne);
                asm.cmp_reg_imm32(rs1, 0);
                let zero = asm.jcc_rel8(Cond::E);
                self.buf.end_rel8(greater);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, gt_val);
                let done = asm.jmp_rel8();
                self.buf.end_rel8(negative);
                self.buf.end_rel8(zero);
                let mut asm = X86Assembler::new(&mut self.buf);
                asm.mov_m32abs_imm32(bt, le_val);
                self.buf.end_rel8(done);
            }
        }
    }

    fn beq_test(&mut self) {
        self.eq_test(1, 0);
    }

    fn bne_test(&mut self) {
        self.eq_test(0, 1);
    }

    fn blez_test(&mut self) {
        self.le_zero_test(1, 0);
    }

    fn bgtz_test(&mut self) {
        self.le_zero_test(0, 1);
    }

    fn bltz_test(&mut self) {
        self.sign_test(true);
    }

    fn bgez_test(&mut self) {
        self.sign_test(false);
    }

    // ==================== Branch generators ====================

    pub(crate) fn gen_beq(&mut self) {
        self.branch(Self::beq_test);
    }

    pub(crate) fn gen_beq_out(&mut self) {
        self.branch_out(Self::beq_test);
    }

    pub(crate) fn gen_beq_idle(&mut self) {
        self.branch_idle(Self::beq_test);
    }

    pub(crate) fn gen_beql(&mut self) {
        self.branch_likely(Self::beq_test);
    }

    pub(crate) fn gen_beql_out(&mut self) {
        self.branch_likely_out(Self::beq_test);
    }

    pub(crate) fn gen_beql_idle(&mut self) {
        self.branch_likely_idle(Self::beq_test);
    }

    pub(crate) fn gen_bne(&mut self) {
        self.branch(Self::bne_test);
    }

    pub(crate) fn gen_bne_out(&mut self) {
        self.branch_out(Self::bne_test);
    }

    pub(crate) fn gen_bne_idle(&mut self) {
        self.branch_idle(Self::bne_test);
    }

    pub(crate) fn gen_bnel(&mut self) {
        self.branch_likely(Self::bne_test);
    }

    pub(crate) fn gen_bnel_out(&mut self) {
        self.branch_likely_out(Self::bne_test);
    }

    pub(crate) fn gen_bnel_idle(&mut self) {
        self.branch_likely_idle(Self::bne_test);
    }

    pub(crate) fn gen_blez(&mut self) {
        self.branch(Self::blez_test);
    }

    pub(crate) fn gen_blez_out(&mut self) {
        self.branch_out(Self::blez_test);
    }

    pub(crate) fn gen_blez_idle(&mut self) {
        self.branch_idle(Self::blez_test);
    }

    pub(crate) fn gen_blezl(&mut self) {
        self.branch_likely(Self::blez_test);
    }

    pub(crate) fn gen_blezl_out(&mut self) {
        self.branch_likely_out(Self::blez_test);
    }

    pub(crate) fn gen_blezl_idle(&mut self) {
        self.branch_likely_idle(Self::blez_test);
    }

    pub(crate) fn gen_bgtz(&mut self) {
        self.branch(Self::bgtz_test);
    }

    pub(crate) fn gen_bgtz_out(&mut self) {
        self.branch_out(Self::bgtz_test);
    }

    pub(crate) fn gen_bgtz_idle(&mut self) {
        self.branch_idle(Self::bgtz_test);
    }

    pub(crate) fn gen_bgtzl(&mut self) {
        self.branch_likely(Self::bgtz_test);
    }

    pub(crate) fn gen_bgtzl_out(&mut self) {
        self.branch_likely_out(Self::bgtz_test);
    }

    pub(crate) fn gen_bgtzl_idle(&mut self) {
        self.branch_likely_idle(Self::bgtz_test);
    }

    pub(crate) fn gen_bltz(&mut self) {
        self.branch(Self::bltz_test);
    }

    pub(crate) fn gen_bltz_out(&mut self) {
        self.branch_out(Self::bltz_test);
    }

    pub(crate) fn gen_bltz_idle(&mut self) {
        self.branch_idle(Self::bltz_test);
    }

    pub(crate) fn gen_bltzl(&mut self) {
        self.branch_likely(Self::bltz_test);
    }

    pub(crate) fn gen_bltzl_out(&mut self) {
        self.branch_likely_out(Self::bltz_test);
    }

    pub(crate) fn gen_bltzl_idle(&mut self) {
        self.branch_likely_idle(Self::bltz_test);
    }

    pub(crate) fn gen_bgez(&mut self) {
        self.branch(Self::bgez_test);
    }

    pub(crate) fn gen_bgez_out(&mut self) {
        self.branch_out(Self::bgez_test);
    }

    pub(crate) fn gen_bgez_idle(&mut self) {
        self.branch_idle(Self::bgez_test);
    }

    pub(crate) fn gen_bgezl(&mut self) {
        self.branch_likely(Self::bgez_test);
    }

    pub(crate) fn gen_bgezl_out(&mut self) {
        self.branch_likely_out(Self::bgez_test);
    }

    pub(crate) fn gen_bgezl_idle(&mut self) {
        self.branch_likely_idle(Self::bgez_test);
    }

    // ==================== Jumps ====================

    /// Store the return address pair for a linking jump. Runs after the
    /// delay slot's flush, so the cache holds nothing stale.
    fn write_link(&mut self, r: usize) {
        let ret = self.insns[self.idx].addr.wrapping_add(4);
        let hi = if ret & 0x8000_0000 != 0 { 0xFFFF_FFFF } else { 0 };
        let cell = self.gpr_cell(r);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(cell, ret);
        asm.mov_m32abs_imm32(cell.hi_word(), hi);
    }

    fn jump_imm(&mut self, link: bool) {
        if self.branch_delegated() {
            self.interp_call(true);
            return;
        }
        self.delay_slot();
        if link {
            self.write_link(31);
        }
        let target = self.insns[self.idx - 1].target;
        let last_addr = self.state_cell(CpuState::last_addr_cell());
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(last_addr, target);
        self.check_interrupt(target);
        self.in_block_jump(target);
    }

    fn jump_imm_out(&mut self, link: bool) {
        if self.branch_delegated() {
            self.interp_call(true);
            return;
        }
        self.delay_slot();
        if link {
            self.write_link(31);
        }
        let target = self.insns[self.idx - 1].target;
        let fall = self.insns[self.idx].addr.wrapping_add(4);
        let last_addr = self.state_cell(CpuState::last_addr_cell());
        let jump_to = self.state_cell(CpuState::jump_to_address_cell());
        let pc = self.state_cell(CpuState::pc_cell());
        let (jump_to_recomp, ctx) = (self.map.jump_to_recomp, self.map.ctx);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(last_addr, target);
        self.check_interrupt(target);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(jump_to, target);
        asm.mov_m32abs_imm32(pc, fall);
        call_helper(&mut asm, Reg::Eax, jump_to_recomp, ctx);
    }

    /// Jump-to-self idle loop: push Count to the interrupt threshold
    /// before looping.
    fn jump_imm_idle(&mut self, link: bool) {
        if self.branch_delegated() {
            self.interp_call(true);
            return;
        }
        let next_interrupt = self.state_cell(CpuState::next_interrupt_cell());
        let count = self.state_cell(CpuState::cp0_reg(CP0_COUNT));
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, next_interrupt);
        asm.sub_reg_m32abs(Reg::Eax, count);
        asm.cmp_reg_imm32(Reg::Eax, 3);
        let too_close = asm.jcc_rel8(Cond::Be);
        asm.and_reg_imm32(Reg::Eax, 0xFFFF_FFFC);
        asm.add_m32abs_reg(count, Reg::Eax);
        self.buf.end_rel8(too_close);
        self.jump_imm(link);
    }

    pub(crate) fn gen_j(&mut self) {
        self.jump_imm(false);
    }

    pub(crate) fn gen_j_out(&mut self) {
        self.jump_imm_out(false);
    }

    pub(crate) fn gen_j_idle(&mut self) {
        self.jump_imm_idle(false);
    }

    pub(crate) fn gen_jal(&mut self) {
        self.jump_imm(true);
    }

    pub(crate) fn gen_jal_out(&mut self) {
        self.jump_imm_out(true);
    }

    pub(crate) fn gen_jal_idle(&mut self) {
        self.jump_imm_idle(true);
    }

    /// Register-indirect jump. The target is saved before the delay slot
    /// can clobber rs; jumps landing in this block's page dispatch through
    /// the entry-offset table, anything else re-enters translation.
    fn jump_reg(&mut self, link: bool) {
        if self.branch_delegated() {
            self.interp_call(true);
            return;
        }
        let (rs, rd) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rd)
        };
        let rs_cell = self.gpr_cell(rs);
        let local_rs = self.state_cell(CpuState::local_rs_cell());
        let last_addr = self.state_cell(CpuState::last_addr_cell());
        let jump_to = self.state_cell(CpuState::jump_to_address_cell());
        let pc = self.state_cell(CpuState::pc_cell());
        let (jump_to_recomp, ctx) = (self.map.jump_to_recomp, self.map.ctx);
        let (entry_table, code_cell) = (self.map.entry_table, self.map.code_cell);
        let page_base = self.window.start & 0xFFFF_F000;
        let block_start = self.window.start;

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, rs_cell);
        asm.mov_m32abs_reg(local_rs, Reg::Eax);

        self.delay_slot();
        if link {
            self.write_link(rd);
        }
        let fall = self.insns[self.idx].addr.wrapping_add(4);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, local_rs);
        asm.mov_m32abs_reg(last_addr, Reg::Eax);
        self.check_interrupt_reg();

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, local_rs);
        asm.mov_reg_reg(Reg::Ebx, Reg::Eax);
        asm.and_reg_imm32(Reg::Eax, 0xFFFF_F000);
        asm.cmp_reg_imm32(Reg::Eax, page_base);
        let in_page = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_reg(jump_to, Reg::Ebx);
        asm.mov_m32abs_imm32(pc, fall);
        call_helper(&mut asm, Reg::Eax, jump_to_recomp, ctx);
        self.buf.end_rel32(in_page);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(Reg::Eax, Reg::Ebx);
        asm.sub_reg_imm32(Reg::Eax, block_start);
        asm.shr_reg_imm8(Reg::Eax, 2);
        asm.mov_reg_index4_disp(Reg::Eax, Reg::Eax, entry_table);
        asm.add_reg_m32abs(Reg::Eax, GuestAddr(code_cell));
        asm.jmp_reg(Reg::Eax);
    }

    pub(crate) fn gen_jr(&mut self) {
        self.jump_reg(false);
    }

    pub(crate) fn gen_jalr(&mut self) {
        self.jump_reg(true);
    }

    // ==================== Loads ====================

    /// Compute the effective address into EBX and test whether it hits
    /// RDRAM directly; the caller's `je` selects the inline fast path.
    /// Without `fast_memory` the handler table is probed so that mapped
    /// regions of the RDRAM range still take the slow path.
    fn mem_address_head(&mut self, write: bool) {
        let (rs, imm) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.imm as i32 as u32)
        };
        let rs_cell = self.gpr_cell(rs);
        let fast_memory = self.cfg.fast_memory;
        let table = if write { self.map.write32_table } else { self.map.read32_table };
        let rdram_handler = if write { self.map.write_rdram } else { self.map.read_rdram };

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, rs_cell);
        asm.add_reg_imm32(Reg::Eax, imm);
        asm.mov_reg_reg(Reg::Ebx, Reg::Eax);
        asm.and_reg_imm32(Reg::Eax, 0xDF80_0000);
        asm.cmp_reg_imm32(Reg::Eax, 0x8000_0000);
        if !fast_memory {
            let not_rdram = asm.jcc_rel8(Cond::Ne);
            asm.shr_reg_imm8(Reg::Eax, 16);
            asm.and_reg_imm32(Reg::Eax, 0x1FFF);
            asm.lea_reg_base_index2(Reg::Eax, Reg::Eax, Reg::Eax);
            asm.mov_reg_index4_disp(Reg::Eax, Reg::Eax, table);
            asm.cmp_reg_imm32(Reg::Eax, rdram_handler);
            self.buf.end_rel8(not_rdram);
        }
    }

    pub(crate) fn gen_lb(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let shift = self.state_cell(CpuState::shift_cell());
        let address = self.state_cell(CpuState::address_cell());
        let rdword = self.state_cell(CpuState::rdword_cell());
        let (read_word, ctx, rdram) = (self.map.read_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        self.mem_address_head(false);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_reg_reg(Reg::Ecx, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ecx, 3);
        asm.xor_reg_imm32(Reg::Ecx, 3);
        asm.shl_reg_imm8(Reg::Ecx, 3);
        asm.mov_m32abs_reg(shift, Reg::Ecx);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_imm32(rdword, rt_cell.0);
        call_helper(&mut asm, Reg::Ebx, read_word, ctx);
        asm.and_reg_reg(Reg::Eax, Reg::Eax);
        let failed = asm.jcc_rel8(Cond::E);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        asm.mov_reg_m32abs(Reg::Ecx, shift);
        asm.shr_reg_cl(Reg::Eax);
        asm.and_reg_imm32(Reg::Eax, 0xFF);
        asm.mov_m32abs_reg(rt_cell, Reg::Eax);
        asm.movsx_reg_m8abs(Reg::Eax, rt_cell);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.xor_reg8_imm8(Reg::Ebx, 3);
        asm.movsx_reg_m8_base_disp(Reg::Eax, Reg::Ebx, rdram);
        self.buf.end_rel8(done);
        self.buf.end_rel8(failed);

        self.set_reg_state(Reg::Eax, rt_cell, true);
    }

    pub(crate) fn gen_lbu(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let shift = self.state_cell(CpuState::shift_cell());
        let address = self.state_cell(CpuState::address_cell());
        let rdword = self.state_cell(CpuState::rdword_cell());
        let (read_word, ctx, rdram) = (self.map.read_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        self.mem_address_head(false);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_reg_reg(Reg::Ecx, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ecx, 3);
        asm.xor_reg_imm32(Reg::Ecx, 3);
        asm.shl_reg_imm8(Reg::Ecx, 3);
        asm.mov_m32abs_reg(shift, Reg::Ecx);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_imm32(rdword, rt_cell.0);
        call_helper(&mut asm, Reg::Ebx, read_word, ctx);
        asm.and_reg_reg(Reg::Eax, Reg::Eax);
        let failed = asm.jcc_rel8(Cond::E);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        asm.mov_reg_m32abs(Reg::Ecx, shift);
        asm.shr_reg_cl(Reg::Eax);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.xor_reg8_imm8(Reg::Ebx, 3);
        asm.mov_reg_base_disp(Reg::Eax, Reg::Ebx, rdram);
        self.buf.end_rel8(done);
        self.buf.end_rel8(failed);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Eax, 0xFF);
        self.set_reg_state(Reg::Eax, rt_cell, true);
    }

    pub(crate) fn gen_lh(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let shift = self.state_cell(CpuState::shift_cell());
        let address = self.state_cell(CpuState::address_cell());
        let rdword = self.state_cell(CpuState::rdword_cell());
        let (read_word, ctx, rdram) = (self.map.read_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        self.mem_address_head(false);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_reg_reg(Reg::Ecx, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ecx, 2);
        asm.xor_reg_imm32(Reg::Ecx, 2);
        asm.shl_reg_imm8(Reg::Ecx, 3);
        asm.mov_m32abs_reg(shift, Reg::Ecx);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_imm32(rdword, rt_cell.0);
        call_helper(&mut asm, Reg::Ebx, read_word, ctx);
        asm.and_reg_reg(Reg::Eax, Reg::Eax);
        let failed = asm.jcc_rel8(Cond::E);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        asm.mov_reg_m32abs(Reg::Ecx, shift);
        asm.shr_reg_cl(Reg::Eax);
        asm.and_reg_imm32(Reg::Eax, 0xFFFF);
        asm.mov_m32abs_reg(rt_cell, Reg::Eax);
        asm.movsx_reg_m16abs(Reg::Eax, rt_cell);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.xor_reg8_imm8(Reg::Ebx, 2);
        asm.movsx_reg_m16_base_disp(Reg::Eax, Reg::Ebx, rdram);
        self.buf.end_rel8(done);
        self.buf.end_rel8(failed);

        self.set_reg_state(Reg::Eax, rt_cell, true);
    }

    pub(crate) fn gen_lhu(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let shift = self.state_cell(CpuState::shift_cell());
        let address = self.state_cell(CpuState::address_cell());
        let rdword = self.state_cell(CpuState::rdword_cell());
        let (read_word, ctx, rdram) = (self.map.read_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        self.mem_address_head(false);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_reg_reg(Reg::Ecx, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ecx, 2);
        asm.xor_reg_imm32(Reg::Ecx, 2);
        asm.shl_reg_imm8(Reg::Ecx, 3);
        asm.mov_m32abs_reg(shift, Reg::Ecx);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_imm32(rdword, rt_cell.0);
        call_helper(&mut asm, Reg::Ebx, read_word, ctx);
        asm.and_reg_reg(Reg::Eax, Reg::Eax);
        let failed = asm.jcc_rel8(Cond::E);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        asm.mov_reg_m32abs(Reg::Ecx, shift);
        asm.shr_reg_cl(Reg::Eax);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.xor_reg8_imm8(Reg::Ebx, 2);
        asm.mov_reg_base_disp(Reg::Eax, Reg::Ebx, rdram);
        self.buf.end_rel8(done);
        self.buf.end_rel8(failed);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Eax, 0xFFFF);
        self.set_reg_state(Reg::Eax, rt_cell, true);
    }

    pub(crate) fn gen_lw(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let address = self.state_cell(CpuState::address_cell());
        let rdword = self.state_cell(CpuState::rdword_cell());
        let (read_word, ctx, rdram) = (self.map.read_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        self.mem_address_head(false);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_imm32(rdword, rt_cell.0);
        call_helper(&mut asm, Reg::Ebx, read_word, ctx);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.mov_reg_base_disp(Reg::Eax, Reg::Ebx, rdram);
        self.buf.end_rel8(done);

        self.set_reg_state(Reg::Eax, rt_cell, true);
    }

    pub(crate) fn gen_lwu(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let address = self.state_cell(CpuState::address_cell());
        let rdword = self.state_cell(CpuState::rdword_cell());
        let (read_word, ctx, rdram) = (self.map.read_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        self.mem_address_head(false);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_imm32(rdword, rt_cell.0);
        call_helper(&mut asm, Reg::Ebx, read_word, ctx);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.mov_reg_base_disp(Reg::Eax, Reg::Ebx, rdram);
        self.buf.end_rel8(done);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.xor_reg_reg(Reg::Ebx, Reg::Ebx);
        self.set_reg64_state(Reg::Eax, Reg::Ebx, rt_cell, true);
    }

    pub(crate) fn gen_ld(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let address = self.state_cell(CpuState::address_cell());
        let rdword = self.state_cell(CpuState::rdword_cell());
        let (read_dword, ctx, rdram) = (self.map.read_dword, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        self.mem_address_head(false);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_imm32(rdword, rt_cell.0);
        call_helper(&mut asm, Reg::Ebx, read_dword, ctx);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        asm.mov_reg_m32abs(Reg::Ecx, rt_cell.hi_word());
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        // Big-endian doubleword over byte-swapped words: low word at +4.
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.mov_reg_base_disp(Reg::Eax, Reg::Ebx, rdram.wrapping_add(4));
        asm.mov_reg_base_disp(Reg::Ecx, Reg::Ebx, rdram);
        self.buf.end_rel8(done);

        self.set_reg64_state(Reg::Eax, Reg::Ecx, rt_cell, true);
    }

    // ==================== Stores ====================

    /// Mark translated code on the written page stale. Runs with the
    /// written guest address in EAX.
    fn store_invalidate(&mut self) {
        let (invalid_code, blocks) = (self.map.invalid_code, self.map.blocks);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(Reg::Ebx, Reg::Eax);
        asm.shr_reg_imm8(Reg::Ebx, 12);
        asm.cmp_m8_base_disp_imm8(Reg::Ebx, invalid_code, 0);
        let already = asm.jcc_rel8(Cond::Ne);
        asm.mov_reg_reg(Reg::Ecx, Reg::Ebx);
        asm.mov_reg_index4_disp(Reg::Ebx, Reg::Ebx, blocks);
        asm.test_reg_reg(Reg::Ebx, Reg::Ebx);
        let no_block = asm.jcc_rel8(Cond::E);
        asm.mov_m8_base_disp_imm8(Reg::Ecx, invalid_code, 1);
        self.buf.end_rel8(no_block);
        self.buf.end_rel8(already);
    }

    pub(crate) fn gen_sb(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let address = self.state_cell(CpuState::address_cell());
        let wword = self.state_cell(CpuState::wword_cell());
        let wmask = self.state_cell(CpuState::wmask_cell());
        let (write_word, ctx, rdram) = (self.map.write_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.xor_reg_reg(Reg::Edx, Reg::Edx);
        asm.mov_reg8_m8abs(Reg::Edx, rt_cell);
        self.mem_address_head(true);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_reg_reg(Reg::Ecx, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ecx, 3);
        asm.xor_reg_imm32(Reg::Ecx, 3);
        asm.shl_reg_imm8(Reg::Ecx, 3);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.shl_reg_cl(Reg::Edx);
        asm.mov_m32abs_reg(wword, Reg::Edx);
        asm.mov_reg_imm32(Reg::Edx, 0xFF);
        asm.shl_reg_cl(Reg::Edx);
        asm.mov_m32abs_reg(wmask, Reg::Edx);
        call_helper(&mut asm, Reg::Ebx, write_word, ctx);
        asm.mov_reg_m32abs(Reg::Eax, address);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(Reg::Eax, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.xor_reg8_imm8(Reg::Ebx, 3);
        asm.mov_base_disp_reg8(Reg::Ebx, rdram, Reg::Edx);
        self.buf.end_rel8(done);

        self.store_invalidate();
    }

    pub(crate) fn gen_sh(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let address = self.state_cell(CpuState::address_cell());
        let wword = self.state_cell(CpuState::wword_cell());
        let wmask = self.state_cell(CpuState::wmask_cell());
        let (write_word, ctx, rdram) = (self.map.write_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.xor_reg_reg(Reg::Edx, Reg::Edx);
        asm.mov_reg16_m16abs(Reg::Edx, rt_cell);
        self.mem_address_head(true);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_reg_reg(Reg::Ecx, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ecx, 2);
        asm.xor_reg_imm32(Reg::Ecx, 2);
        asm.shl_reg_imm8(Reg::Ecx, 3);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.shl_reg_cl(Reg::Edx);
        asm.mov_m32abs_reg(wword, Reg::Edx);
        asm.mov_reg_imm32(Reg::Edx, 0xFFFF);
        asm.shl_reg_cl(Reg::Edx);
        asm.mov_m32abs_reg(wmask, Reg::Edx);
        call_helper(&mut asm, Reg::Ebx, write_word, ctx);
        asm.mov_reg_m32abs(Reg::Eax, address);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(Reg::Eax, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.xor_reg8_imm8(Reg::Ebx, 2);
        asm.mov_base_disp_reg16(Reg::Ebx, rdram, Reg::Edx);
        self.buf.end_rel8(done);

        self.store_invalidate();
    }

    pub(crate) fn gen_sw(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let address = self.state_cell(CpuState::address_cell());
        let wword = self.state_cell(CpuState::wword_cell());
        let wmask = self.state_cell(CpuState::wmask_cell());
        let (write_word, ctx, rdram) = (self.map.write_word, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Ecx, rt_cell);
        self.mem_address_head(true);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_reg(wword, Reg::Ecx);
        asm.mov_m32abs_imm32(wmask, 0xFFFF_FFFF);
        call_helper(&mut asm, Reg::Ebx, write_word, ctx);
        asm.mov_reg_m32abs(Reg::Eax, address);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(Reg::Eax, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.mov_base_disp_reg(Reg::Ebx, rdram, Reg::Ecx);
        self.buf.end_rel8(done);

        self.store_invalidate();
    }

    pub(crate) fn gen_sd(&mut self) {
        let (rt, next) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.addr.wrapping_add(4))
        };
        let rt_cell = self.gpr_cell(rt);
        let pc = self.state_cell(CpuState::pc_cell());
        let address = self.state_cell(CpuState::address_cell());
        let wdword = self.state_cell(CpuState::wdword_cell());
        let (write_dword, ctx, rdram) = (self.map.write_dword, self.map.ctx, self.map.rdram);

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Ecx, rt_cell);
        asm.mov_reg_m32abs(Reg::Edx, rt_cell.hi_word());
        self.mem_address_head(true);

        let mut asm = X86Assembler::new(&mut self.buf);
        let fast = asm.jcc_rel32(Cond::E);
        asm.mov_m32abs_imm32(pc, next);
        asm.mov_m32abs_reg(address, Reg::Ebx);
        asm.mov_m32abs_reg(wdword, Reg::Ecx);
        asm.mov_m32abs_reg(wdword.hi_word(), Reg::Edx);
        call_helper(&mut asm, Reg::Ebx, write_dword, ctx);
        asm.mov_reg_m32abs(Reg::Eax, address);
        let done = asm.jmp_rel8();
        self.buf.end_rel32(fast);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(Reg::Eax, Reg::Ebx);
        asm.and_reg_imm32(Reg::Ebx, 0x7F_FFFF);
        asm.mov_base_disp_reg(Reg::Ebx, rdram.wrapping_add(4), Reg::Ecx);
        asm.mov_base_disp_reg(Reg::Ebx, rdram, Reg::Edx);
        self.buf.end_rel8(done);

        self.store_invalidate();
    }

    // ==================== 32-bit ALU ====================

    fn alu32(&mut self, op: fn(&mut X86Assembler, Reg, Reg)) {
        let (rs, rt, rd) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.rd)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rs = self.alloc(rs_cell);
        let rt = self.alloc(rt_cell);
        let rd = self.alloc_w(rd_cell);
        if rd != rs && rd != rt {
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd, rs);
            op(&mut asm, rd, rt);
        } else {
            let temp = self.lru();
            self.free_reg(temp);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(temp, rs);
            op(&mut asm, temp, rt);
            asm.mov_reg_reg(rd, temp);
        }
    }

    pub(crate) fn gen_add(&mut self) {
        self.alu32(|a, d, s| a.add_reg_reg(d, s));
    }

    pub(crate) fn gen_addu(&mut self) {
        self.alu32(|a, d, s| a.add_reg_reg(d, s));
    }

    pub(crate) fn gen_sub(&mut self) {
        self.alu32(|a, d, s| a.sub_reg_reg(d, s));
    }

    pub(crate) fn gen_subu(&mut self) {
        self.alu32(|a, d, s| a.sub_reg_reg(d, s));
    }

    fn addi_common(&mut self) {
        let (rs, rt, imm) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.imm as i32 as u32)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);

        let rs = self.alloc(rs_cell);
        let rt = self.alloc_w(rt_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rt, rs);
        asm.add_reg_imm32(rt, imm);
    }

    pub(crate) fn gen_addi(&mut self) {
        self.addi_common();
    }

    pub(crate) fn gen_addiu(&mut self) {
        self.addi_common();
    }

    pub(crate) fn gen_andi(&mut self) {
        let (rs, rt, imm) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.imm as u16 as u32)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);

        // AND with a zero-extended immediate clears the upper word, so a
        // 32-bit result is enough.
        let rs = self.alloc(rs_cell);
        let rt = self.alloc_w(rt_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rt, rs);
        asm.and_reg_imm32(rt, imm);
    }

    fn logic_imm64(&mut self, op: fn(&mut X86Assembler, Reg, u32)) {
        let (rs, rt, imm) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.imm as u16 as u32)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);

        let rs1 = self.alloc64_lo(rs_cell);
        let rs2 = self.alloc64_hi(rs_cell);
        let rt1 = self.alloc64_lo_w(rt_cell);
        let rt2 = self.alloc64_hi_w(rt_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rt1, rs1);
        asm.mov_reg_reg(rt2, rs2);
        op(&mut asm, rt1, imm);
    }

    pub(crate) fn gen_ori(&mut self) {
        self.logic_imm64(|a, r, imm| a.or_reg_imm32(r, imm));
    }

    pub(crate) fn gen_xori(&mut self) {
        self.logic_imm64(|a, r, imm| a.xor_reg_imm32(r, imm));
    }

    pub(crate) fn gen_lui(&mut self) {
        let (rt, imm) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.imm as u16 as u32)
        };
        let rt_cell = self.gpr_cell(rt);

        let rt = self.alloc_w(rt_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_imm32(rt, imm << 16);
    }

    fn set_on_less(&mut self, signed: bool) {
        let (rs, rt, rd) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.rd)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rs1 = self.alloc64_lo(rs_cell);
        let rs2 = self.alloc64_hi(rs_cell);
        let rt1 = self.alloc64_lo(rt_cell);
        let rt2 = self.alloc64_hi(rt_cell);
        let rd = self.alloc_w(rd_cell);

        let (less_hi, less_lo) = if signed { (Cond::L, Cond::B) } else { (Cond::B, Cond::B) };
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_reg_reg(rs2, rt2);
        let less_high = asm.jcc_rel8(less_hi);
        let differ = asm.jcc_rel8(Cond::Ne);
        asm.cmp_reg_reg(rs1, rt1);
        let less_low = asm.jcc_rel8(less_lo);
        self.buf.end_rel8(differ);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_imm32(rd, 0);
        let done = asm.jmp_rel8();
        self.buf.end_rel8(less_high);
        self.buf.end_rel8(less_low);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_imm32(rd, 1);
        self.buf.end_rel8(done);
    }

    pub(crate) fn gen_slt(&mut self) {
        self.set_on_less(true);
    }

    pub(crate) fn gen_sltu(&mut self) {
        self.set_on_less(false);
    }

    fn set_on_less_imm(&mut self, signed: bool) {
        let (rs, rt, imm) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.imm as i64)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);

        let rs1 = self.alloc64_lo(rs_cell);
        let rs2 = self.alloc64_hi(rs_cell);
        let rt = self.alloc_w(rt_cell);

        let (less_hi, less_lo) = if signed { (Cond::L, Cond::B) } else { (Cond::B, Cond::B) };
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_reg_imm32(rs2, (imm >> 32) as u32);
        let less_high = asm.jcc_rel8(less_hi);
        let differ = asm.jcc_rel8(Cond::Ne);
        asm.cmp_reg_imm32(rs1, imm as u32);
        let less_low = asm.jcc_rel8(less_lo);
        self.buf.end_rel8(differ);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_imm32(rt, 0);
        let done = asm.jmp_rel8();
        self.buf.end_rel8(less_high);
        self.buf.end_rel8(less_low);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_imm32(rt, 1);
        self.buf.end_rel8(done);
    }

    pub(crate) fn gen_slti(&mut self) {
        self.set_on_less_imm(true);
    }

    pub(crate) fn gen_sltiu(&mut self) {
        self.set_on_less_imm(false);
    }

    fn shift32_imm(&mut self, op: fn(&mut X86Assembler, Reg, u8)) {
        let (rt, rd, sa) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.rd, insn.sa as u8)
        };
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rt = self.alloc(rt_cell);
        let rd = self.alloc_w(rd_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rd, rt);
        op(&mut asm, rd, sa);
    }

    pub(crate) fn gen_sll(&mut self) {
        self.shift32_imm(|a, r, n| a.shl_reg_imm8(r, n));
    }

    pub(crate) fn gen_srl(&mut self) {
        self.shift32_imm(|a, r, n| a.shr_reg_imm8(r, n));
    }

    pub(crate) fn gen_sra(&mut self) {
        self.shift32_imm(|a, r, n| a.sar_reg_imm8(r, n));
    }

    fn shift32_var(&mut self, op: fn(&mut X86Assembler, Reg)) {
        let (rs, rt, rd) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.rd)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        self.alloc_fixed(Reg::Ecx, rs_cell);
        let rt = self.alloc(rt_cell);
        let rd = self.alloc_w(rd_cell);
        if rd != Reg::Ecx {
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd, rt);
            op(&mut asm, rd);
        } else {
            let temp = self.lru();
            self.free_reg(temp);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(temp, rt);
            op(&mut asm, temp);
            asm.mov_reg_reg(rd, temp);
        }
    }

    pub(crate) fn gen_sllv(&mut self) {
        self.shift32_var(|a, r| a.shl_reg_cl(r));
    }

    pub(crate) fn gen_srlv(&mut self) {
        self.shift32_var(|a, r| a.shr_reg_cl(r));
    }

    pub(crate) fn gen_srav(&mut self) {
        self.shift32_var(|a, r| a.sar_reg_cl(r));
    }

    // ==================== 64-bit ALU ====================

    fn alu64(
        &mut self,
        op_lo: fn(&mut X86Assembler, Reg, Reg),
        op_hi: fn(&mut X86Assembler, Reg, Reg),
        complement: bool,
    ) {
        let (rs, rt, rd) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.rd)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rs1 = self.alloc64_lo(rs_cell);
        let rs2 = self.alloc64_hi(rs_cell);
        let rt1 = self.alloc64_lo(rt_cell);
        let rt2 = self.alloc64_hi(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);

        if rt1 != rd1 && rs1 != rd1 {
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd1, rs1);
            asm.mov_reg_reg(rd2, rs2);
            op_lo(&mut asm, rd1, rt1);
            op_hi(&mut asm, rd2, rt2);
            if complement {
                asm.not_reg(rd1);
                asm.not_reg(rd2);
            }
        } else {
            let temp = self.lru();
            self.free_reg(temp);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(temp, rs1);
            op_lo(&mut asm, temp, rt1);
            asm.mov_reg_reg(rd1, temp);
            asm.mov_reg_reg(temp, rs2);
            op_hi(&mut asm, temp, rt2);
            asm.mov_reg_reg(rd2, temp);
            if complement {
                asm.not_reg(rd1);
                asm.not_reg(rd2);
            }
        }
    }

    pub(crate) fn gen_dadd(&mut self) {
        self.alu64(|a, d, s| a.add_reg_reg(d, s), |a, d, s| a.adc_reg_reg(d, s), false);
    }

    pub(crate) fn gen_daddu(&mut self) {
        self.alu64(|a, d, s| a.add_reg_reg(d, s), |a, d, s| a.adc_reg_reg(d, s), false);
    }

    pub(crate) fn gen_dsub(&mut self) {
        self.alu64(|a, d, s| a.sub_reg_reg(d, s), |a, d, s| a.sbb_reg_reg(d, s), false);
    }

    pub(crate) fn gen_dsubu(&mut self) {
        self.alu64(|a, d, s| a.sub_reg_reg(d, s), |a, d, s| a.sbb_reg_reg(d, s), false);
    }

    pub(crate) fn gen_and(&mut self) {
        self.alu64(|a, d, s| a.and_reg_reg(d, s), |a, d, s| a.and_reg_reg(d, s), false);
    }

    pub(crate) fn gen_or(&mut self) {
        self.alu64(|a, d, s| a.or_reg_reg(d, s), |a, d, s| a.or_reg_reg(d, s), false);
    }

    pub(crate) fn gen_xor(&mut self) {
        self.alu64(|a, d, s| a.xor_reg_reg(d, s), |a, d, s| a.xor_reg_reg(d, s), false);
    }

    pub(crate) fn gen_nor(&mut self) {
        self.alu64(|a, d, s| a.or_reg_reg(d, s), |a, d, s| a.or_reg_reg(d, s), true);
    }

    fn daddi_common(&mut self) {
        let (rs, rt, imm) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.imm as i32)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);

        let rs1 = self.alloc64_lo(rs_cell);
        let rs2 = self.alloc64_hi(rs_cell);
        let rt1 = self.alloc64_lo_w(rt_cell);
        let rt2 = self.alloc64_hi_w(rt_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rt1, rs1);
        asm.mov_reg_reg(rt2, rs2);
        asm.add_reg_imm32(rt1, imm as u32);
        asm.adc_reg_imm32(rt2, (imm >> 31) as u32);
    }

    pub(crate) fn gen_daddi(&mut self) {
        self.daddi_common();
    }

    pub(crate) fn gen_daddiu(&mut self) {
        self.daddi_common();
    }

    pub(crate) fn gen_dsll(&mut self) {
        let (rt, rd, sa) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.rd, insn.sa as u8)
        };
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rt1 = self.alloc64_lo(rt_cell);
        let rt2 = self.alloc64_hi(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rd1, rt1);
        asm.mov_reg_reg(rd2, rt2);
        asm.shld_reg_reg_imm8(rd2, rd1, sa);
        asm.shl_reg_imm8(rd1, sa);
        // SHLD only uses the count modulo 32.
        if sa & 0x20 != 0 {
            asm.mov_reg_reg(rd2, rd1);
            asm.xor_reg_reg(rd1, rd1);
        }
    }

    pub(crate) fn gen_dsrl(&mut self) {
        let (rt, rd, sa) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.rd, insn.sa as u8)
        };
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rt1 = self.alloc64_lo(rt_cell);
        let rt2 = self.alloc64_hi(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rd1, rt1);
        asm.mov_reg_reg(rd2, rt2);
        asm.shrd_reg_reg_imm8(rd1, rd2, sa);
        asm.shr_reg_imm8(rd2, sa);
        if sa & 0x20 != 0 {
            asm.mov_reg_reg(rd1, rd2);
            asm.xor_reg_reg(rd2, rd2);
        }
    }

    pub(crate) fn gen_dsra(&mut self) {
        let (rt, rd, sa) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.rd, insn.sa as u8)
        };
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rt1 = self.alloc64_lo(rt_cell);
        let rt2 = self.alloc64_hi(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rd1, rt1);
        asm.mov_reg_reg(rd2, rt2);
        asm.shrd_reg_reg_imm8(rd1, rd2, sa);
        asm.sar_reg_imm8(rd2, sa);
        if sa & 0x20 != 0 {
            asm.mov_reg_reg(rd1, rd2);
            asm.sar_reg_imm8(rd2, 31);
        }
    }

    pub(crate) fn gen_dsll32(&mut self) {
        let (rt, rd, sa) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.rd, insn.sa as u8)
        };
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rt1 = self.alloc64_lo(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rd2, rt1);
        asm.shl_reg_imm8(rd2, sa);
        asm.xor_reg_reg(rd1, rd1);
    }

    pub(crate) fn gen_dsrl32(&mut self) {
        let (rt, rd, sa) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.rd, insn.sa as u8)
        };
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        let rt2 = self.alloc64_hi(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rd1, rt2);
        asm.shr_reg_imm8(rd1, sa);
        asm.xor_reg_reg(rd2, rd2);
    }

    pub(crate) fn gen_dsra32(&mut self) {
        let (rt, rd, sa) = {
            let insn = &self.insns[self.idx];
            (insn.rt, insn.rd, insn.sa as u8)
        };
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        // The result fits 32 bits; write-back sign-extends.
        let rt2 = self.alloc64_hi(rt_cell);
        let rd = self.alloc_w(rd_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rd, rt2);
        asm.sar_reg_imm8(rd, sa);
    }

    pub(crate) fn gen_dsllv(&mut self) {
        let (rs, rt, rd) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.rd)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        self.alloc_fixed(Reg::Ecx, rs_cell);
        let rt1 = self.alloc64_lo(rt_cell);
        let rt2 = self.alloc64_hi(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);

        if rd1 != Reg::Ecx && rd2 != Reg::Ecx {
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd1, rt1);
            asm.mov_reg_reg(rd2, rt2);
            asm.shld_reg_reg_cl(rd2, rd1);
            asm.shl_reg_cl(rd1);
            asm.test_reg_imm32(Reg::Ecx, 0x20);
            let small = asm.jcc_rel8(Cond::E);
            asm.mov_reg_reg(rd2, rd1);
            asm.xor_reg_reg(rd1, rd1);
            self.buf.end_rel8(small);
        } else {
            let temp1 = self.lru();
            let temp2 = self.lru_except(temp1);
            self.free_reg(temp1);
            self.free_reg(temp2);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(temp1, rt1);
            asm.mov_reg_reg(temp2, rt2);
            asm.shld_reg_reg_cl(temp2, temp1);
            asm.shl_reg_cl(temp1);
            asm.test_reg_imm32(Reg::Ecx, 0x20);
            let small = asm.jcc_rel8(Cond::E);
            asm.mov_reg_reg(temp2, temp1);
            asm.xor_reg_reg(temp1, temp1);
            self.buf.end_rel8(small);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd1, temp1);
            asm.mov_reg_reg(rd2, temp2);
        }
    }

    pub(crate) fn gen_dsrlv(&mut self) {
        let (rs, rt, rd) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.rd)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        self.alloc_fixed(Reg::Ecx, rs_cell);
        let rt1 = self.alloc64_lo(rt_cell);
        let rt2 = self.alloc64_hi(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);

        if rd1 != Reg::Ecx && rd2 != Reg::Ecx {
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd1, rt1);
            asm.mov_reg_reg(rd2, rt2);
            asm.shrd_reg_reg_cl(rd1, rd2);
            asm.shr_reg_cl(rd2);
            asm.test_reg_imm32(Reg::Ecx, 0x20);
            let small = asm.jcc_rel8(Cond::E);
            asm.mov_reg_reg(rd1, rd2);
            asm.xor_reg_reg(rd2, rd2);
            self.buf.end_rel8(small);
        } else {
            let temp1 = self.lru();
            let temp2 = self.lru_except(temp1);
            self.free_reg(temp1);
            self.free_reg(temp2);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(temp1, rt1);
            asm.mov_reg_reg(temp2, rt2);
            asm.shrd_reg_reg_cl(temp1, temp2);
            asm.shr_reg_cl(temp2);
            asm.test_reg_imm32(Reg::Ecx, 0x20);
            let small = asm.jcc_rel8(Cond::E);
            asm.mov_reg_reg(temp1, temp2);
            asm.xor_reg_reg(temp2, temp2);
            self.buf.end_rel8(small);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd1, temp1);
            asm.mov_reg_reg(rd2, temp2);
        }
    }

    pub(crate) fn gen_dsrav(&mut self) {
        let (rs, rt, rd) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt, insn.rd)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let rd_cell = self.gpr_cell(rd);

        self.alloc_fixed(Reg::Ecx, rs_cell);
        let rt1 = self.alloc64_lo(rt_cell);
        let rt2 = self.alloc64_hi(rt_cell);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);

        if rd1 != Reg::Ecx && rd2 != Reg::Ecx {
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd1, rt1);
            asm.mov_reg_reg(rd2, rt2);
            asm.shrd_reg_reg_cl(rd1, rd2);
            asm.sar_reg_cl(rd2);
            asm.test_reg_imm32(Reg::Ecx, 0x20);
            let small = asm.jcc_rel8(Cond::E);
            asm.mov_reg_reg(rd1, rd2);
            asm.sar_reg_imm8(rd2, 31);
            self.buf.end_rel8(small);
        } else {
            let temp1 = self.lru();
            let temp2 = self.lru_except(temp1);
            self.free_reg(temp1);
            self.free_reg(temp2);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(temp1, rt1);
            asm.mov_reg_reg(temp2, rt2);
            asm.shrd_reg_reg_cl(temp1, temp2);
            asm.sar_reg_cl(temp2);
            asm.test_reg_imm32(Reg::Ecx, 0x20);
            let small = asm.jcc_rel8(Cond::E);
            asm.mov_reg_reg(temp1, temp2);
            asm.sar_reg_imm8(temp2, 31);
            self.buf.end_rel8(small);
            let mut asm = X86Assembler::new(&mut self.buf);
            asm.mov_reg_reg(rd1, temp1);
            asm.mov_reg_reg(rd2, temp2);
        }
    }

    // ==================== Multiply and divide ====================

    fn mult32(&mut self, signed: bool) {
        let (rs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let lo_cell = self.state_cell(CpuState::lo_reg());
        let hi_cell = self.state_cell(CpuState::hi_reg());

        self.alloc_fixed_w(Reg::Eax, lo_cell, false);
        self.alloc_fixed_w(Reg::Edx, hi_cell, false);
        let rs = self.alloc(rs_cell);
        let rt = self.alloc(rt_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(Reg::Eax, rs);
        if signed {
            asm.imul_reg(rt);
        } else {
            asm.mul_reg(rt);
        }
    }

    pub(crate) fn gen_mult(&mut self) {
        self.mult32(true);
    }

    pub(crate) fn gen_multu(&mut self) {
        self.mult32(false);
    }

    pub(crate) fn gen_div(&mut self) {
        let (rs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let lo_cell = self.state_cell(CpuState::lo_reg());
        let hi_cell = self.state_cell(CpuState::hi_reg());

        self.alloc_fixed_w(Reg::Eax, lo_cell, false);
        self.alloc_fixed_w(Reg::Edx, hi_cell, false);
        let rs = self.alloc(rs_cell);
        let rt = self.alloc(rt_cell);
        // Division by zero leaves LO/HI as they are.
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_reg_imm32(rt, 0);
        let by_zero = asm.jcc_rel8(Cond::E);
        asm.mov_reg_reg(Reg::Eax, rs);
        asm.cdq();
        asm.idiv_reg(rt);
        self.buf.end_rel8(by_zero);
    }

    pub(crate) fn gen_divu(&mut self) {
        let (rs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let lo_cell = self.state_cell(CpuState::lo_reg());
        let hi_cell = self.state_cell(CpuState::hi_reg());

        self.alloc_fixed_w(Reg::Eax, lo_cell, false);
        self.alloc_fixed_w(Reg::Edx, hi_cell, false);
        let rs = self.alloc(rs_cell);
        let rt = self.alloc(rt_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_reg_imm32(rt, 0);
        let by_zero = asm.jcc_rel8(Cond::E);
        asm.mov_reg_reg(Reg::Eax, rs);
        asm.xor_reg_reg(Reg::Edx, Reg::Edx);
        asm.div_reg(rt);
        self.buf.end_rel8(by_zero);
    }

    /// 64x64 unsigned multiply out of four 32x32 partial products.
    pub(crate) fn gen_dmultu(&mut self) {
        let (rs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.rs, insn.rt)
        };
        let rs_cell = self.gpr_cell(rs);
        let rt_cell = self.gpr_cell(rt);
        let lo_cell = self.state_cell(CpuState::lo_reg());
        let hi_cell = self.state_cell(CpuState::hi_reg());

        self.free_all();
        self.simplify_access();
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, rs_cell);
        asm.mul_m32abs(rt_cell);
        asm.mov_m32abs_reg(lo_cell, Reg::Eax);
        asm.mov_reg_reg(Reg::Ebx, Reg::Edx);

        asm.mov_reg_m32abs(Reg::Eax, rs_cell);
        asm.mul_m32abs(rt_cell.hi_word());
        asm.add_reg_reg(Reg::Ebx, Reg::Eax);
        asm.adc_reg_imm32(Reg::Edx, 0);
        asm.mov_reg_reg(Reg::Ecx, Reg::Edx);

        asm.mov_reg_m32abs(Reg::Eax, rs_cell.hi_word());
        asm.mul_m32abs(rt_cell);
        asm.add_reg_reg(Reg::Ebx, Reg::Eax);
        asm.adc_reg_imm32(Reg::Ecx, 0);
        asm.mov_m32abs_reg(lo_cell.hi_word(), Reg::Ebx);
        asm.mov_reg_reg(Reg::Esi, Reg::Edx);

        asm.mov_reg_m32abs(Reg::Eax, rs_cell.hi_word());
        asm.mul_m32abs(rt_cell.hi_word());
        asm.add_reg_reg(Reg::Eax, Reg::Esi);
        asm.adc_reg_imm32(Reg::Edx, 0);
        asm.add_reg_reg(Reg::Eax, Reg::Ecx);
        asm.adc_reg_imm32(Reg::Edx, 0);
        asm.mov_m32abs_reg(hi_cell, Reg::Eax);
        asm.mov_m32abs_reg(hi_cell.hi_word(), Reg::Edx);
    }

    fn move_from_pair(&mut self, src: GuestAddr) {
        let rd = self.insns[self.idx].rd;
        let rd_cell = self.gpr_cell(rd);

        let src1 = self.alloc64_lo(src);
        let src2 = self.alloc64_hi(src);
        let rd1 = self.alloc64_lo_w(rd_cell);
        let rd2 = self.alloc64_hi_w(rd_cell);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(rd1, src1);
        asm.mov_reg_reg(rd2, src2);
    }

    fn move_to_pair(&mut self, dst: GuestAddr) {
        let rs = self.insns[self.idx].rs;
        let rs_cell = self.gpr_cell(rs);

        let rs1 = self.alloc64_lo(rs_cell);
        let rs2 = self.alloc64_hi(rs_cell);
        let dst1 = self.alloc64_lo_w(dst);
        let dst2 = self.alloc64_hi_w(dst);
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_reg(dst1, rs1);
        asm.mov_reg_reg(dst2, rs2);
    }

    pub(crate) fn gen_mfhi(&mut self) {
        let hi = self.state_cell(CpuState::hi_reg());
        self.move_from_pair(hi);
    }

    pub(crate) fn gen_mflo(&mut self) {
        let lo = self.state_cell(CpuState::lo_reg());
        self.move_from_pair(lo);
    }

    pub(crate) fn gen_mthi(&mut self) {
        let hi = self.state_cell(CpuState::hi_reg());
        self.move_to_pair(hi);
    }

    pub(crate) fn gen_mtlo(&mut self) {
        let lo = self.state_cell(CpuState::lo_reg());
        self.move_to_pair(lo);
    }

    // ==================== COP1 ====================

    pub(crate) fn gen_mfc1(&mut self) {
        self.check_cop1_unusable();
        let (fs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.rt)
        };
        let simple = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let rt_cell = self.gpr_cell(rt);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, simple);
        asm.mov_reg_base_disp(Reg::Ebx, Reg::Eax, 0);
        asm.mov_m32abs_reg(rt_cell, Reg::Ebx);
        asm.sar_reg_imm8(Reg::Ebx, 31);
        asm.mov_m32abs_reg(rt_cell.hi_word(), Reg::Ebx);
    }

    pub(crate) fn gen_dmfc1(&mut self) {
        self.check_cop1_unusable();
        let (fs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.rt)
        };
        let double = self.state_cell(CpuState::cp1_double_ptr(fs));
        let rt_cell = self.gpr_cell(rt);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, double);
        asm.mov_reg_base_disp(Reg::Ebx, Reg::Eax, 0);
        asm.mov_reg_base_disp(Reg::Ecx, Reg::Eax, 4);
        asm.mov_m32abs_reg(rt_cell, Reg::Ebx);
        asm.mov_m32abs_reg(rt_cell.hi_word(), Reg::Ecx);
    }

    pub(crate) fn gen_cfc1(&mut self) {
        self.check_cop1_unusable();
        let (fs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.rt)
        };
        let fcr = if fs == 31 {
            self.state_cell(CpuState::fcr31_cell())
        } else {
            self.state_cell(CpuState::fcr0_cell())
        };
        let rt_cell = self.gpr_cell(rt);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fcr);
        asm.mov_m32abs_reg(rt_cell, Reg::Eax);
        asm.sar_reg_imm8(Reg::Eax, 31);
        asm.mov_m32abs_reg(rt_cell.hi_word(), Reg::Eax);
    }

    pub(crate) fn gen_mtc1(&mut self) {
        self.check_cop1_unusable();
        let (fs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.rt)
        };
        let simple = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let rt_cell = self.gpr_cell(rt);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        asm.mov_reg_m32abs(Reg::Ebx, simple);
        asm.mov_base_disp_reg(Reg::Ebx, 0, Reg::Eax);
    }

    pub(crate) fn gen_dmtc1(&mut self) {
        self.check_cop1_unusable();
        let (fs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.rt)
        };
        let double = self.state_cell(CpuState::cp1_double_ptr(fs));
        let rt_cell = self.gpr_cell(rt);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        asm.mov_reg_m32abs(Reg::Ebx, rt_cell.hi_word());
        asm.mov_reg_m32abs(Reg::Edx, double);
        asm.mov_base_disp_reg(Reg::Edx, 0, Reg::Eax);
        asm.mov_base_disp_reg(Reg::Edx, 4, Reg::Ebx);
    }

    pub(crate) fn gen_ctc1(&mut self) {
        self.check_cop1_unusable();
        let (fs, rt) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.rt)
        };
        // Only the control/status register is writable.
        if fs != 31 {
            return;
        }
        let fcr31 = self.state_cell(CpuState::fcr31_cell());
        let rounding = self.state_cell(CpuState::rounding_mode_cell());
        let rt_cell = self.gpr_cell(rt);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, rt_cell);
        asm.mov_m32abs_reg(fcr31, Reg::Eax);
        asm.and_reg_imm32(Reg::Eax, 3);

        asm.cmp_reg_imm32(Reg::Eax, 0);
        let not_nearest = asm.jcc_rel8(Cond::Ne);
        asm.mov_m32abs_imm32(rounding, ROUND_MODE as u32);
        let done_nearest = asm.jmp_rel8();
        self.buf.end_rel8(not_nearest);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_reg_imm32(Reg::Eax, 1);
        let not_trunc = asm.jcc_rel8(Cond::Ne);
        asm.mov_m32abs_imm32(rounding, TRUNC_MODE as u32);
        let done_trunc = asm.jmp_rel8();
        self.buf.end_rel8(not_trunc);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.cmp_reg_imm32(Reg::Eax, 2);
        let not_ceil = asm.jcc_rel8(Cond::Ne);
        asm.mov_m32abs_imm32(rounding, CEIL_MODE as u32);
        let done_ceil = asm.jmp_rel8();
        self.buf.end_rel8(not_ceil);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_m32abs_imm32(rounding, FLOOR_MODE as u32);
        self.buf.end_rel8(done_nearest);
        self.buf.end_rel8(done_trunc);
        self.buf.end_rel8(done_ceil);

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.fldcw_m16abs(rounding);
    }

    fn fp_binary_s(&mut self, op: fn(&mut X86Assembler, Reg)) {
        self.check_cop1_unusable();
        let (fs, ft, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.ft(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let ft_ptr = self.state_cell(CpuState::cp1_simple_ptr(ft));
        let fd_ptr = self.state_cell(CpuState::cp1_simple_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fld_m32_at_reg(Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, ft_ptr);
        op(&mut asm, Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fstp_m32_at_reg(Reg::Eax);
    }

    fn fp_binary_d(&mut self, op: fn(&mut X86Assembler, Reg)) {
        self.check_cop1_unusable();
        let (fs, ft, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.ft(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_double_ptr(fs));
        let ft_ptr = self.state_cell(CpuState::cp1_double_ptr(ft));
        let fd_ptr = self.state_cell(CpuState::cp1_double_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fld_m64_at_reg(Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, ft_ptr);
        op(&mut asm, Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fstp_m64_at_reg(Reg::Eax);
    }

    fn fp_unary_s(&mut self, op: fn(&mut X86Assembler)) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_simple_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fld_m32_at_reg(Reg::Eax);
        op(&mut asm);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fstp_m32_at_reg(Reg::Eax);
    }

    fn fp_unary_d(&mut self, op: fn(&mut X86Assembler)) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_double_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_double_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fld_m64_at_reg(Reg::Eax);
        op(&mut asm);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fstp_m64_at_reg(Reg::Eax);
    }

    pub(crate) fn gen_add_s(&mut self) {
        self.fp_binary_s(|a, r| a.fadd_m32_at_reg(r));
    }

    pub(crate) fn gen_sub_s(&mut self) {
        self.fp_binary_s(|a, r| a.fsub_m32_at_reg(r));
    }

    pub(crate) fn gen_mul_s(&mut self) {
        self.fp_binary_s(|a, r| a.fmul_m32_at_reg(r));
    }

    pub(crate) fn gen_div_s(&mut self) {
        self.fp_binary_s(|a, r| a.fdiv_m32_at_reg(r));
    }

    pub(crate) fn gen_sqrt_s(&mut self) {
        self.fp_unary_s(|a| a.fsqrt());
    }

    pub(crate) fn gen_abs_s(&mut self) {
        self.fp_unary_s(|a| a.fabs());
    }

    pub(crate) fn gen_neg_s(&mut self) {
        self.fp_unary_s(|a| a.fchs());
    }

    pub(crate) fn gen_add_d(&mut self) {
        self.fp_binary_d(|a, r| a.fadd_m64_at_reg(r));
    }

    pub(crate) fn gen_sub_d(&mut self) {
        self.fp_binary_d(|a, r| a.fsub_m64_at_reg(r));
    }

    pub(crate) fn gen_mul_d(&mut self) {
        self.fp_binary_d(|a, r| a.fmul_m64_at_reg(r));
    }

    pub(crate) fn gen_div_d(&mut self) {
        self.fp_binary_d(|a, r| a.fdiv_m64_at_reg(r));
    }

    pub(crate) fn gen_sqrt_d(&mut self) {
        self.fp_unary_d(|a| a.fsqrt());
    }

    pub(crate) fn gen_abs_d(&mut self) {
        self.fp_unary_d(|a| a.fabs());
    }

    pub(crate) fn gen_neg_d(&mut self) {
        self.fp_unary_d(|a| a.fchs());
    }

    pub(crate) fn gen_mov_s(&mut self) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_simple_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.mov_reg_base_disp(Reg::Ebx, Reg::Eax, 0);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.mov_base_disp_reg(Reg::Eax, 0, Reg::Ebx);
    }

    pub(crate) fn gen_mov_d(&mut self) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_double_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_double_ptr(fd));

        // A raw bit copy; the value never touches the x87 stack.
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.mov_reg_base_disp(Reg::Ebx, Reg::Eax, 0);
        asm.mov_reg_base_disp(Reg::Ecx, Reg::Eax, 4);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.mov_base_disp_reg(Reg::Eax, 0, Reg::Ebx);
        asm.mov_base_disp_reg(Reg::Eax, 4, Reg::Ecx);
    }

    pub(crate) fn gen_trunc_w_s(&mut self) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_simple_ptr(fd));
        let trunc_mode = GuestAddr(self.map.trunc_mode);
        let rounding = self.state_cell(CpuState::rounding_mode_cell());

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.fldcw_m16abs(trunc_mode);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fld_m32_at_reg(Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fistp_m32_at_reg(Reg::Eax);
        asm.fldcw_m16abs(rounding);
    }

    pub(crate) fn gen_trunc_w_d(&mut self) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_double_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_simple_ptr(fd));
        let trunc_mode = GuestAddr(self.map.trunc_mode);
        let rounding = self.state_cell(CpuState::rounding_mode_cell());

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.fldcw_m16abs(trunc_mode);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fld_m64_at_reg(Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fistp_m32_at_reg(Reg::Eax);
        asm.fldcw_m16abs(rounding);
    }

    pub(crate) fn gen_cvt_s_d(&mut self) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_double_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_simple_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fld_m64_at_reg(Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fstp_m32_at_reg(Reg::Eax);
    }

    pub(crate) fn gen_cvt_s_w(&mut self) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_simple_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fild_m32_at_reg(Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fstp_m32_at_reg(Reg::Eax);
    }

    pub(crate) fn gen_cvt_d_s(&mut self) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_double_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fld_m32_at_reg(Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fstp_m64_at_reg(Reg::Eax);
    }

    pub(crate) fn gen_cvt_d_w(&mut self) {
        self.check_cop1_unusable();
        let (fs, fd) = {
            let insn = &self.insns[self.idx];
            (insn.fs(), insn.fd())
        };
        let fs_ptr = self.state_cell(CpuState::cp1_simple_ptr(fs));
        let fd_ptr = self.state_cell(CpuState::cp1_double_ptr(fd));

        let mut asm = X86Assembler::new(&mut self.buf);
        asm.mov_reg_m32abs(Reg::Eax, fs_ptr);
        asm.fild_m32_at_reg(Reg::Eax);
        asm.mov_reg_m32abs(Reg::Eax, fd_ptr);
        asm.fstp_m64_at_reg(Reg::Eax);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::JitConfig;
    use crate::jit::compiler::BlockCompiler;
    use crate::jit::dispatch::DispatchTable;
    use crate::jit::runtime::HostMap;

    fn compile_bytes(words: &[u32], start: u32) -> Vec<u8> {
        let cfg = JitConfig::default();
        let map = HostMap::synthetic();
        let dispatch = DispatchTable::new(&cfg);
        BlockCompiler::new(&cfg, &map, &dispatch, words, start)
            .compile()
            .code
    }

    #[test]
    fn test_lui_materializes_shifted_immediate() {
        // lui $t0, 0x1234 plus padding
        let code = compile_bytes(&[0x3C08_1234, 0, 0, 0], 0x8000_0000);
        // mov r32, 0x12340000 somewhere in the block
        let imm = 0x1234_0000u32.to_le_bytes();
        assert!(code.windows(4).any(|w| w == imm));
    }

    #[test]
    fn test_sw_embeds_fast_path_mask() {
        // sw $t0, 0($t1)
        let code = compile_bytes(&[0xAD28_0000, 0, 0, 0], 0x8000_0000);
        // and ebx, 0x7FFFFF for the RDRAM fast path
        let mask = 0x007F_FFFFu32.to_le_bytes();
        assert!(code.windows(4).any(|w| w == mask));
        // full-word write mask on the slow path
        let wmask = 0xFFFF_FFFFu32.to_le_bytes();
        assert!(code.windows(4).any(|w| w == wmask));
    }

    #[test]
    fn test_interpreted_opcode_calls_helper() {
        // syscall has no native generator
        let map = HostMap::synthetic();
        let code = compile_bytes(&[0x0000_000C, 0, 0, 0], 0x8000_0000);
        let helper = map.interp_op.to_le_bytes();
        assert!(code.windows(4).any(|w| w == helper));
    }

    #[test]
    fn test_slow_path_disabled_fast_memory_probes_table() {
        let mut cfg = JitConfig::default();
        cfg.fast_memory = false;
        let map = HostMap::synthetic();
        let dispatch = DispatchTable::new(&cfg);
        // lw $t0, 0($t1)
        let code = BlockCompiler::new(&cfg, &map, &dispatch, &[0x8D28_0000, 0, 0, 0], 0x8000_0000)
            .compile()
            .code;
        let handler = map.read_rdram.to_le_bytes();
        assert!(code.windows(4).any(|w| w == handler));
    }

    #[test]
    fn test_config_can_force_interpretation() {
        let mut cfg = JitConfig::default();
        cfg.interpret = vec!["Lw".to_string()];
        let map = HostMap::synthetic();
        let dispatch = DispatchTable::new(&cfg);
        let code = BlockCompiler::new(&cfg, &map, &dispatch, &[0x8D28_0000, 0, 0, 0], 0x8000_0000)
            .compile()
            .code;
        let helper = map.interp_op.to_le_bytes();
        assert!(code.windows(4).any(|w| w == helper));
    }
}
