/*!
decode.rs - 6502 basic blocks into μop lists.

A block begins at any address control flow reaches and ends at the first
branch, jump, return, or instruction the JIT defers to the interpreter
(BRK, interrupt-unmasking instructions, BCD-capable arithmetic keeps a
dynamic preflight instead). Each decoded instruction expands to the
ordered μop shape the optimizer and backend expect:

    mode-set, address compute, page-crossing check, carry/overflow load,
    the operation, write-invalidation, flag saves, NZ set.
*/

use crate::cpu::defs::{self, CpuVariant, MemKind, OpMode, OpType};
use crate::jit::uop::{OpcodeDetails, Uop, UopCode};
use crate::mem::AddressSpace;

/// Decoder walk limit per block.
pub const MAX_BLOCK_INSTRUCTIONS: usize = 48;

/// Optypes the JIT always hands to the interpreter. Interrupt-unmasking
/// instructions are here for their one-instruction IRQ latency; the rest
/// are rare enough that per-cycle interpretation is the simpler truth.
fn is_deferred(optype: OpType) -> bool {
    matches!(
        optype,
        OpType::Brk
            | OpType::Rti
            | OpType::Cli
            | OpType::Sei
            | OpType::Plp
            | OpType::Kil
            // Undocumented NMOS set.
            | OpType::Sax
            | OpType::Alr
            | OpType::Slo
            | OpType::Shy
            | OpType::Anc
            | OpType::Lax
            | OpType::Dcp
            | OpType::Sre
            | OpType::Rla
            | OpType::Ahx
            | OpType::Xaa
            | OpType::Rra
            | OpType::Axs
            | OpType::Isc
            | OpType::Arr
            | OpType::Tas
            | OpType::Las
            | OpType::Shx
            // 65C12 extensions.
            | OpType::Tsb
            | OpType::Trb
            | OpType::Stz
            | OpType::Phx
            | OpType::Phy
            | OpType::Plx
            | OpType::Ply
    )
}

/// NOPs with a memory operand perform a real (dummy) read, which matters
/// against MMIO; defer those. A few 65C12 shapes of otherwise-compiled
/// operations (INC/DEC on A, BIT immediate) defer as well.
fn is_deferred_shape(optype: OpType, opmode: OpMode) -> bool {
    match optype {
        OpType::Nop => !matches!(opmode, OpMode::Nil | OpMode::Acc | OpMode::Imm),
        OpType::Inc | OpType::Dec => opmode == OpMode::Acc,
        OpType::Bit => opmode == OpMode::Imm,
        _ => false,
    }
}

/// Emit the addressing μops for a memory operand.
fn push_mode(details: &mut OpcodeDetails, opmode: OpMode, operand: u16) {
    let uop = match opmode {
        OpMode::Imm => Uop::with1(UopCode::ModeImm, operand as i32),
        OpMode::Zpg => Uop::with1(UopCode::ModeZpg, operand as i32),
        OpMode::Abs => Uop::with1(UopCode::ModeAbs, operand as i32),
        OpMode::Zpx => Uop::with1(UopCode::ModeZpx, operand as i32),
        OpMode::Zpy => Uop::with1(UopCode::ModeZpy, operand as i32),
        OpMode::Abx => Uop::with1(UopCode::ModeAbx, operand as i32),
        OpMode::Aby => Uop::with1(UopCode::ModeAby, operand as i32),
        OpMode::Idx => Uop::with1(UopCode::ModeIdx, operand as i32),
        OpMode::Idy => Uop::with1(UopCode::ModeIdy, operand as i32),
        OpMode::Ind => Uop::with1(UopCode::ModeInd, operand as i32),
        OpMode::Id => Uop::with1(UopCode::ModeId, operand as i32),
        OpMode::Iax => Uop::with1(UopCode::ModeIax, operand as i32),
        OpMode::Nil | OpMode::Acc | OpMode::Rel => return,
    };
    details.push(uop);
}

/// Page-crossing penalty check for read instructions.
fn push_page_cross(details: &mut OpcodeDetails, optype: OpType, opmode: OpMode) {
    if defs::mem_kind(optype) != MemKind::Read {
        return;
    }
    match opmode {
        OpMode::Abx => details.push(Uop::new(UopCode::PageCrossAbx)),
        OpMode::Aby => details.push(Uop::new(UopCode::PageCrossAby)),
        OpMode::Idy => details.push(Uop::new(UopCode::PageCrossIdy)),
        _ => {}
    }
}

fn branch_uop(optype: OpType) -> UopCode {
    match optype {
        OpType::Beq => UopCode::BranchEq,
        OpType::Bne => UopCode::BranchNe,
        OpType::Bcs => UopCode::BranchCs,
        OpType::Bcc => UopCode::BranchCc,
        OpType::Bmi => UopCode::BranchMi,
        OpType::Bpl => UopCode::BranchPl,
        OpType::Bvs => UopCode::BranchVs,
        OpType::Bvc => UopCode::BranchVc,
        OpType::Bra => UopCode::BranchAlways,
        _ => unreachable!(),
    }
}

/// Expand one decoded instruction into μops. Returns true if the block
/// ends after this instruction.
fn expand(details: &mut OpcodeDetails) -> bool {
    let optype = details.optype;
    let opmode = details.opmode;
    let operand = details.operand;

    if is_deferred(optype) || is_deferred_shape(optype, opmode) {
        details.push(Uop::new(UopCode::Interp));
        return true;
    }

    match optype {
        OpType::Lda | OpType::Ldx | OpType::Ldy => {
            push_mode(details, opmode, operand);
            push_page_cross(details, optype, opmode);
            let (load, nz) = match optype {
                OpType::Lda => (UopCode::Lda, UopCode::FlagsNzA),
                OpType::Ldx => (UopCode::Ldx, UopCode::FlagsNzX),
                _ => (UopCode::Ldy, UopCode::FlagsNzY),
            };
            details.push(Uop::new(load));
            details.push(Uop::new(nz));
        }
        OpType::Sta | OpType::Stx | OpType::Sty => {
            push_mode(details, opmode, operand);
            let store = match optype {
                OpType::Sta => UopCode::Sta,
                OpType::Stx => UopCode::Stx,
                _ => UopCode::Sty,
            };
            details.push(Uop::new(store));
            details.push(Uop::new(UopCode::WriteInv));
        }
        OpType::Ora | OpType::And | OpType::Eor => {
            push_mode(details, opmode, operand);
            push_page_cross(details, optype, opmode);
            let op = match optype {
                OpType::Ora => UopCode::Ora,
                OpType::And => UopCode::And,
                _ => UopCode::Eor,
            };
            details.push(Uop::new(op));
            details.push(Uop::new(UopCode::FlagsNzA));
        }
        OpType::Adc => {
            push_mode(details, opmode, operand);
            push_page_cross(details, optype, opmode);
            details.push(Uop::new(UopCode::CheckBcd));
            details.push(Uop::new(UopCode::LoadCarry));
            details.push(Uop::new(UopCode::Adc));
            details.push(Uop::new(UopCode::SaveCarry));
            details.push(Uop::new(UopCode::SaveOverflow));
            details.push(Uop::new(UopCode::FlagsNzA));
        }
        OpType::Sbc => {
            push_mode(details, opmode, operand);
            push_page_cross(details, optype, opmode);
            details.push(Uop::new(UopCode::CheckBcd));
            details.push(Uop::new(UopCode::LoadCarryInv));
            details.push(Uop::new(UopCode::Sbc));
            details.push(Uop::new(UopCode::SaveCarryInv));
            details.push(Uop::new(UopCode::SaveOverflow));
            details.push(Uop::new(UopCode::FlagsNzA));
        }
        OpType::Cmp | OpType::Cpx | OpType::Cpy => {
            push_mode(details, opmode, operand);
            push_page_cross(details, optype, opmode);
            let op = match optype {
                OpType::Cmp => UopCode::Cmp,
                OpType::Cpx => UopCode::Cpx,
                _ => UopCode::Cpy,
            };
            details.push(Uop::new(op));
            details.push(Uop::new(UopCode::SaveCarryInv));
            details.push(Uop::new(UopCode::FlagsNzValue));
        }
        OpType::Bit => {
            push_mode(details, opmode, operand);
            details.push(Uop::new(UopCode::BitTest));
        }
        OpType::Asl | OpType::Lsr if opmode == OpMode::Acc => {
            let op = if optype == OpType::Asl {
                UopCode::AslAcc
            } else {
                UopCode::LsrAcc
            };
            details.push(Uop::with1(op, 1));
            details.push(Uop::new(UopCode::SaveCarry));
            details.push(Uop::new(UopCode::FlagsNzA));
        }
        OpType::Rol | OpType::Ror if opmode == OpMode::Acc => {
            let op = if optype == OpType::Rol {
                UopCode::RolAcc
            } else {
                UopCode::RorAcc
            };
            details.push(Uop::new(UopCode::LoadCarry));
            details.push(Uop::with1(op, 1));
            details.push(Uop::new(UopCode::SaveCarry));
            details.push(Uop::new(UopCode::FlagsNzA));
        }
        OpType::Asl | OpType::Lsr => {
            push_mode(details, opmode, operand);
            let op = if optype == OpType::Asl {
                UopCode::AslMem
            } else {
                UopCode::LsrMem
            };
            details.push(Uop::new(op));
            details.push(Uop::new(UopCode::SaveCarry));
            details.push(Uop::new(UopCode::WriteInv));
            details.push(Uop::new(UopCode::FlagsNzValue));
        }
        OpType::Rol | OpType::Ror => {
            push_mode(details, opmode, operand);
            let op = if optype == OpType::Rol {
                UopCode::RolMem
            } else {
                UopCode::RorMem
            };
            details.push(Uop::new(UopCode::LoadCarry));
            details.push(Uop::new(op));
            details.push(Uop::new(UopCode::SaveCarry));
            details.push(Uop::new(UopCode::WriteInv));
            details.push(Uop::new(UopCode::FlagsNzValue));
        }
        OpType::Inc | OpType::Dec => {
            push_mode(details, opmode, operand);
            let op = if optype == OpType::Inc {
                UopCode::IncMem
            } else {
                UopCode::DecMem
            };
            details.push(Uop::new(op));
            details.push(Uop::new(UopCode::WriteInv));
            details.push(Uop::new(UopCode::FlagsNzValue));
        }
        OpType::Inx => {
            details.push(Uop::new(UopCode::Inx));
            details.push(Uop::new(UopCode::FlagsNzX));
        }
        OpType::Iny => {
            details.push(Uop::new(UopCode::Iny));
            details.push(Uop::new(UopCode::FlagsNzY));
        }
        OpType::Dex => {
            details.push(Uop::new(UopCode::Dex));
            details.push(Uop::new(UopCode::FlagsNzX));
        }
        OpType::Dey => {
            details.push(Uop::new(UopCode::Dey));
            details.push(Uop::new(UopCode::FlagsNzY));
        }
        OpType::Tax => {
            details.push(Uop::new(UopCode::Tax));
            details.push(Uop::new(UopCode::FlagsNzX));
        }
        OpType::Tay => {
            details.push(Uop::new(UopCode::Tay));
            details.push(Uop::new(UopCode::FlagsNzY));
        }
        OpType::Txa => {
            details.push(Uop::new(UopCode::Txa));
            details.push(Uop::new(UopCode::FlagsNzA));
        }
        OpType::Tya => {
            details.push(Uop::new(UopCode::Tya));
            details.push(Uop::new(UopCode::FlagsNzA));
        }
        OpType::Tsx => {
            details.push(Uop::new(UopCode::Tsx));
            details.push(Uop::new(UopCode::FlagsNzX));
        }
        OpType::Txs => details.push(Uop::new(UopCode::Txs)),
        OpType::Clc => details.push(Uop::new(UopCode::Clc)),
        OpType::Sec => details.push(Uop::new(UopCode::Sec)),
        OpType::Cld => details.push(Uop::new(UopCode::Cld)),
        OpType::Sed => details.push(Uop::new(UopCode::Sed)),
        OpType::Clv => details.push(Uop::new(UopCode::Clv)),
        OpType::Pha => details.push(Uop::new(UopCode::Pha)),
        OpType::Php => details.push(Uop::new(UopCode::Php)),
        OpType::Pla => {
            details.push(Uop::new(UopCode::Pla));
            details.push(Uop::new(UopCode::FlagsNzA));
        }
        OpType::Nop => {}

        OpType::Jmp => {
            match opmode {
                OpMode::Abs => details.push(Uop::with1(UopCode::Jmp, operand as i32)),
                OpMode::Ind | OpMode::Iax => {
                    push_mode(details, opmode, operand);
                    details.push(Uop::new(UopCode::JmpScratch));
                }
                _ => unreachable!(),
            }
            return true;
        }
        OpType::Jsr => {
            let ret = details.addr.wrapping_add(2);
            details.push(Uop {
                code: UopCode::Jsr,
                value1: operand as i32,
                value2: ret as i32,
            });
            return true;
        }
        OpType::Rts => {
            details.push(Uop::new(UopCode::Rts));
            return true;
        }
        OpType::Bpl
        | OpType::Bmi
        | OpType::Bvc
        | OpType::Bvs
        | OpType::Bcc
        | OpType::Bcs
        | OpType::Bne
        | OpType::Beq
        | OpType::Bra => {
            let taken = details
                .addr
                .wrapping_add(2)
                .wrapping_add((operand as u8) as i8 as u16);
            let fall_through = details.addr.wrapping_add(2);
            details.push(Uop {
                code: branch_uop(optype),
                value1: taken as i32,
                value2: fall_through as i32,
            });
            return true;
        }

        _ => unreachable!("deferred optypes are expanded as Interp"),
    }

    false
}

/// Decode a basic block starting at `start`.
pub fn decode_block(mem: &AddressSpace, variant: CpuVariant, start: u16) -> Vec<OpcodeDetails> {
    let mut block = Vec::new();
    let mut pc = start;

    for _ in 0..MAX_BLOCK_INSTRUCTIONS {
        // Never decode out of the MMIO window or off the end of the
        // address space.
        if crate::bus::Bus::needs_callback(pc) || pc.checked_add(3).is_none() {
            break;
        }

        let opcode = mem.read(pc, pc);
        let (optype, opmode, cycles) = defs::decode(variant, opcode);
        let len = defs::mode_len(opmode);

        let mut details = OpcodeDetails::new(pc, opcode, optype, opmode);
        details.len_bytes = len;
        details.max_cycles = cycles;
        details.branches = defs::branch_kind(optype);
        details.operand = match len {
            2 => mem.read(pc.wrapping_add(1), pc) as u16,
            3 => {
                (mem.read(pc.wrapping_add(1), pc) as u16)
                    | ((mem.read(pc.wrapping_add(2), pc) as u16) << 8)
            }
            _ => 0,
        };

        let ends = expand(&mut details);
        details.ends_block = ends;
        pc = pc.wrapping_add(len);
        block.push(details);
        if ends {
            break;
        }
    }

    // The walk limit can cut a block mid-stream; the tail then falls
    // through to the next block.
    if let Some(last) = block.last_mut() {
        last.ends_block = true;
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Model;

    fn mem_with(program: &[u8], at: u16) -> AddressSpace {
        let mut mem = AddressSpace::new(Model::B);
        for (i, &b) in program.iter().enumerate() {
            mem.write(at + i as u16, b, 0);
        }
        mem
    }

    #[test]
    fn block_ends_at_branch() {
        // LDA #$10; BNE +2; (unreached in block) NOP
        let mem = mem_with(&[0xA9, 0x10, 0xD0, 0x02, 0xEA], 0x1900);
        let block = decode_block(&mem, CpuVariant::Nmos, 0x1900);
        assert_eq!(block.len(), 2);
        assert_eq!(block[0].optype, crate::cpu::defs::OpType::Lda);
        assert!(block[1].ends_block);
        // Branch target / fall-through recorded.
        assert_eq!(block[1].uops[0].value1, 0x1906);
        assert_eq!(block[1].uops[0].value2, 0x1904);
    }

    #[test]
    fn adc_expansion_shape() {
        let mem = mem_with(&[0x69, 0x20, 0x4C, 0x00, 0x19], 0x1900);
        let block = decode_block(&mem, CpuVariant::Nmos, 0x1900);
        let codes: Vec<UopCode> = block[0].uops.iter().map(|u| u.code).collect();
        assert_eq!(
            codes,
            vec![
                UopCode::ModeImm,
                UopCode::CheckBcd,
                UopCode::LoadCarry,
                UopCode::Adc,
                UopCode::SaveCarry,
                UopCode::SaveOverflow,
                UopCode::FlagsNzA,
            ]
        );
    }

    #[test]
    fn store_gets_write_invalidation() {
        let mem = mem_with(&[0x8D, 0x00, 0x10, 0x60], 0x1900);
        let block = decode_block(&mem, CpuVariant::Nmos, 0x1900);
        let codes: Vec<UopCode> = block[0].uops.iter().map(|u| u.code).collect();
        assert_eq!(
            codes,
            vec![UopCode::ModeAbs, UopCode::Sta, UopCode::WriteInv]
        );
        // RTS terminates.
        assert_eq!(block.len(), 2);
        assert!(block[1].ends_block);
    }

    #[test]
    fn page_cross_check_only_for_reads() {
        // LDA $1234,X has the check; STA $1234,X does not.
        let mem = mem_with(&[0xBD, 0x34, 0x12, 0x9D, 0x34, 0x12, 0x60], 0x1900);
        let block = decode_block(&mem, CpuVariant::Nmos, 0x1900);
        assert!(block[0].find_uop(UopCode::PageCrossAbx).is_some());
        assert!(block[1].find_uop(UopCode::PageCrossAbx).is_none());
    }

    #[test]
    fn unmasking_instructions_defer_to_interp() {
        let mem = mem_with(&[0x58, 0xEA], 0x1900);
        let block = decode_block(&mem, CpuVariant::Nmos, 0x1900);
        assert_eq!(block.len(), 1);
        assert_eq!(block[0].uops[0].code, UopCode::Interp);
        assert!(block[0].ends_block);
    }

    #[test]
    fn straight_line_block_hits_instruction_limit() {
        let mut program = vec![0xEA; MAX_BLOCK_INSTRUCTIONS + 10];
        program.push(0x60);
        let mem = mem_with(&program, 0x1900);
        let block = decode_block(&mem, CpuVariant::Nmos, 0x1900);
        assert_eq!(block.len(), MAX_BLOCK_INSTRUCTIONS);
        assert!(block.last().unwrap().ends_block);
    }
}
