//! Second-pass jump resolution and reconciliation wrappers.
//!
//! In-block branches are emitted with a zero rel32 displacement and a
//! jump-table record; once every instruction's code offset is known, the
//! second pass points each displacement at the target instruction's code,
//! or at its wrapper when the target expects registers mapped.

use tracing::trace;

use crate::cpu::GuestAddr;
use crate::jit::codebuf::CodeBuffer;
use crate::jit::runtime::HostMap;
use crate::jit::x86::{Reg, X86Assembler};
use crate::mips::Insn;

/// One unresolved in-block jump: where its displacement dword sits and
/// which guest address it must reach.
#[derive(Debug, Clone, Copy)]
pub struct JumpRecord {
    pub patch_offset: usize,
    pub target: u32,
}

#[derive(Default)]
pub struct Linker {
    jumps: Vec<JumpRecord>,
}

impl Linker {
    pub fn new() -> Self {
        Linker { jumps: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.jumps.clear();
    }

    /// Record a jump whose rel32 displacement at `patch_offset` must be
    /// resolved to guest address `target` in the second pass.
    pub fn add_jump(&mut self, patch_offset: usize, target: u32) {
        self.jumps.push(JumpRecord {
            patch_offset,
            target,
        });
    }

    pub fn jumps(&self) -> &[JumpRecord] {
        &self.jumps
    }

    /// Resolve every recorded jump against the finished instruction
    /// metadata.
    pub fn resolve(&self, buf: &mut CodeBuffer, insns: &[Insn], block_start: u32) {
        for jump in &self.jumps {
            let index = ((jump.target - block_start) / 4) as usize;
            let insn = &insns[index];
            let dest = if insn.need_map {
                insn.wrapper_offset
            } else {
                insn.local_addr
            };
            let disp = dest.wrapping_sub(jump.patch_offset as u32 + 4);
            trace!(
                target_addr = jump.target,
                at = jump.patch_offset,
                dest,
                "resolving in-block jump"
            );
            buf.patch_u32(jump.patch_offset, disp);
        }
    }
}

/// Emit a reconciliation wrapper for `insn` at the current buffer
/// position and return its offset.
///
/// The wrapper pushes the instruction's real entry (code base + local
/// offset) as a return address, reloads every register recorded in
/// `needed`, then returns into the block.
fn build_wrapper(buf: &mut CodeBuffer, insn: &Insn, map: &HostMap) -> u32 {
    let offset = buf.len() as u32;
    let mut asm = X86Assembler::new(buf);
    asm.sub_esp_imm8(4);
    asm.mov_reg_m32abs(Reg::Eax, GuestAddr(map.code_cell));
    asm.add_reg_imm32(Reg::Eax, insn.local_addr);
    asm.mov_esp_reg(Reg::Eax);
    for i in 0..8 {
        if let Some(addr) = insn.needed[i] {
            asm.mov_reg_m32abs(Reg::from_index(i), addr);
        }
    }
    asm.ret();
    offset
}

/// Emit wrappers for every instruction with live register expectations,
/// setting `need_map` and `wrapper_offset`. Runs after translation, in
/// the same buffer, ahead of jump resolution.
pub fn build_wrappers(buf: &mut CodeBuffer, insns: &mut [Insn], map: &HostMap) {
    for insn in insns.iter_mut() {
        insn.need_map = insn.needed.iter().any(|slot| slot.is_some());
        if insn.need_map {
            insn.wrapper_offset = build_wrapper(buf, insn, map);
        }
    }
}

/// Per-instruction entry offsets for register-indirect jumps: the wrapper
/// when reconciliation is needed, the plain code offset otherwise. Both
/// are relative to the block's code base.
pub fn entry_offsets(insns: &[Insn]) -> Vec<u32> {
    insns
        .iter()
        .map(|insn| {
            if insn.need_map {
                insn.wrapper_offset
            } else {
                insn.local_addr
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mips::{decode, BlockWindow};

    #[test]
    fn test_wrapper_reloads_only_needed_registers() {
        let window = BlockWindow {
            start: 0x8000_0000,
            end: 0x8000_1000,
        };
        let mut insn = decode(0, 0, 0x8000_0000, &window, false);
        insn.local_addr = 0x30;
        insn.needed[1] = Some(GuestAddr(0x10));
        insn.needed[6] = Some(GuestAddr(0x20));

        let mut buf = CodeBuffer::new();
        let map = HostMap::synthetic();
        let offset = build_wrapper(&mut buf, &insn, &map);
        assert_eq!(offset, 0);

        // sub esp,4 / mov eax,[code_cell] / add eax,0x30 / mov [esp],eax
        // then two reloads and ret.
        let code = buf.code();
        assert_eq!(&code[0..3], &[0x83, 0xEC, 0x04]);
        assert_eq!(code[3], 0x8B);
        // reload of ecx from 0x10
        let reload_ecx = [0x8B, 0x0D, 0x10, 0x00, 0x00, 0x00];
        let reload_esi = [0x8B, 0x35, 0x20, 0x00, 0x00, 0x00];
        let tail = &code[code.len() - 13..];
        assert_eq!(&tail[0..6], &reload_ecx);
        assert_eq!(&tail[6..12], &reload_esi);
        assert_eq!(tail[12], 0xC3);
    }
}
