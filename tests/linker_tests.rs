use r4300_dynarec::cpu::GuestAddr;
use r4300_dynarec::jit::codebuf::CodeBuffer;
use r4300_dynarec::jit::linker::{build_wrappers, entry_offsets, Linker};
use r4300_dynarec::jit::runtime::HostMap;
use r4300_dynarec::jit::x86::X86Assembler;
use r4300_dynarec::mips::{decode, BlockWindow, Insn};

fn nop_insns(count: usize) -> Vec<Insn> {
    let window = BlockWindow {
        start: 0x8000_0000,
        end: 0x8000_0000 + (count as u32) * 4,
    };
    (0..count)
        .map(|i| decode(0, 0, 0x8000_0000 + (i as u32) * 4, &window, false))
        .collect()
}

#[test]
fn test_forward_jump_resolved_to_target_offset() {
    let mut buf = CodeBuffer::new();
    let mut linker = Linker::new();
    let mut insns = nop_insns(4);

    let mut asm = X86Assembler::new(&mut buf);
    let rel = asm.jmp_rel32();
    linker.add_jump(rel.offset(), 0x8000_0008);
    for _ in 0..20 {
        buf.emit_u8(0x90);
    }
    insns[2].local_addr = buf.len() as u32;

    linker.resolve(&mut buf, &insns, 0x8000_0000);
    let disp = buf.read_u32(1) as i32;
    // The jump opcode sits at 0, its displacement at 1..5.
    assert_eq!(5 + disp, insns[2].local_addr as i32);
}

#[test]
fn test_backward_jump_gets_negative_displacement() {
    let mut buf = CodeBuffer::new();
    let mut linker = Linker::new();
    let mut insns = nop_insns(4);

    insns[0].local_addr = 0;
    for _ in 0..8 {
        buf.emit_u8(0x90);
    }
    let mut asm = X86Assembler::new(&mut buf);
    let rel = asm.jmp_rel32();
    linker.add_jump(rel.offset(), 0x8000_0000);

    linker.resolve(&mut buf, &insns, 0x8000_0000);
    let disp = buf.read_u32(9) as i32;
    assert_eq!(9 + 4 + disp, 0);
}

#[test]
fn test_jump_to_mapped_entry_goes_through_wrapper() {
    let mut buf = CodeBuffer::new();
    let mut linker = Linker::new();
    let mut insns = nop_insns(4);
    let map = HostMap::synthetic();

    let mut asm = X86Assembler::new(&mut buf);
    let rel = asm.jmp_rel32();
    linker.add_jump(rel.offset(), 0x8000_0004);
    insns[1].local_addr = buf.len() as u32;
    insns[1].needed[3] = Some(GuestAddr(0x80));

    build_wrappers(&mut buf, &mut insns, &map);
    assert!(insns[1].need_map);
    assert!(insns[1].wrapper_offset > insns[1].local_addr);

    linker.resolve(&mut buf, &insns, 0x8000_0000);
    let disp = buf.read_u32(1) as i32;
    assert_eq!(5 + disp, insns[1].wrapper_offset as i32);
}

#[test]
fn test_entry_offsets_follow_need_map() {
    let mut buf = CodeBuffer::new();
    let mut insns = nop_insns(3);
    let map = HostMap::synthetic();

    insns[0].local_addr = 0;
    insns[1].local_addr = 0x10;
    insns[1].needed[0] = Some(GuestAddr(0x40));
    insns[2].local_addr = 0x20;

    build_wrappers(&mut buf, &mut insns, &map);
    let entries = entry_offsets(&insns);
    assert_eq!(entries[0], 0);
    assert_eq!(entries[1], insns[1].wrapper_offset);
    assert_eq!(entries[2], 0x20);
}
