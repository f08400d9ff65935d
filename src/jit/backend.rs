/*!
backend.rs - Host code generation from μop lists.

The backend runs in two stages, mirroring its place in the pipeline:

1. `rewrite` inspects each instruction with `breakdown_from_6502`, which
   classifies μops into semantic slots (main operation, address mode,
   carry load/save, NZ set, write invalidation, page-cross check), then
   merges adjacent μops into single host operations where the host can
   fold them - a carry load disappears into the carry input of the
   add/subtract/rotate, an immediate `ValueSet` disappears into the
   register load it feeds. Consumed μops are marked `merged` (and
   `eliminated`) so the later optimizer passes and the lowering agree on
   what still exists.

2. `lower` emits the block's host operations into a flat region: per
   instruction a canonical prefix (debug hook, addressing, MMIO test,
   BCD preflight, cycle charge) followed by the surviving μops in order,
   and a tail that transfers control to the next block. The emitted
   `HostOp` set is this backend's instruction set; the runner executes
   it with an indirect dispatch loop.

Bounce points (the MMIO test and the BCD preflight) are ordered before
the cycle charge, so a bounced instruction has changed nothing and the
interpreter can replay it from scratch.
*/

use crate::bus::Bus;
use crate::jit::uop::{OpcodeDetails, UopCode};

/// Branch condition of a lowered conditional exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Always,
}

/// The backend's host instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    /// Per-instruction debug hook.
    Debug(u16),
    /// Defer this instruction (at the given address) to the interpreter.
    InterpBounce(u16),
    /// Bounce when the resolved address is in the MMIO window.
    CheckSpecial(u16),
    /// Bounce when the D flag is set.
    CheckBcd(u16),
    /// Charge the instruction's base cycles.
    ChargeCycles(u8),

    ModeImm(u8),
    ModeZpg(u8),
    ModeAbs(u16),
    ModeZpx(u8),
    ModeZpy(u8),
    ModeAbx(u16),
    ModeAby(u16),
    ModeIdx(u8),
    ModeIdy(u8),
    /// value = pointer; bool = NMOS page-wrap quirk.
    ModeInd(u16, bool),
    ModeId(u8),
    ModeIax(u16),
    PageCrossAbx(u16),
    PageCrossAby(u16),
    PageCrossIdy,

    LoadCarry,
    LoadCarryInv,
    SaveCarry,
    SaveCarryInv,
    SaveOverflow,
    FlagsNzA,
    FlagsNzX,
    FlagsNzY,
    FlagsNzValue,
    ValueSet(u8),

    Lda,
    Ldx,
    Ldy,
    /// Immediate loads with the feeding ValueSet folded in.
    LdaConst(u8),
    LdxConst(u8),
    LdyConst(u8),
    Sta,
    Stx,
    Sty,
    Ora,
    And,
    Eor,
    /// bool = carry load folded into the host operation.
    Adc(bool),
    Add,
    Sbc(bool),
    Sub,
    Cmp,
    Cpx,
    Cpy,
    BitTest,
    AslAcc(u8),
    LsrAcc(u8),
    /// (count, carry load folded).
    RolAcc(u8, bool),
    RorAcc(u8, bool),
    AslMem,
    LsrMem,
    RolMem(bool),
    RorMem(bool),
    IncMem,
    DecMem,
    WriteInv,
    Inx,
    Iny,
    Dex,
    Dey,
    Tax,
    Tay,
    Txa,
    Tya,
    Tsx,
    Txs,
    Pha,
    Php,
    Pla,
    Clc,
    Sec,
    Cld,
    Sed,
    Clv,

    Jmp(u16),
    JmpScratch,
    /// (target, return address pushed minus one semantics applied).
    Jsr(u16, u16),
    Rts,
    /// (condition, taken target, fall-through).
    Branch(Cond, u16, u16),
}

/// Semantic slots of one instruction's μop list.
#[derive(Debug, Default, Clone, Copy)]
pub struct Breakdown {
    pub main_op: Option<usize>,
    pub addr_mode: Option<usize>,
    pub load_carry: Option<usize>,
    pub save_carry: Option<usize>,
    pub nz_flags: Option<usize>,
    pub write_inv: Option<usize>,
    pub page_crossing: Option<usize>,
    pub check_bcd: Option<usize>,
    pub value_set: Option<usize>,
}

/// Classify an instruction's μops into semantic slots.
pub fn breakdown_from_6502(details: &OpcodeDetails) -> Breakdown {
    let mut b = Breakdown::default();
    for (i, uop) in details.uops.iter().enumerate() {
        if details.uop_flags[i].eliminated {
            continue;
        }
        match uop.code {
            UopCode::ModeImm
            | UopCode::ModeZpg
            | UopCode::ModeAbs
            | UopCode::ModeZpx
            | UopCode::ModeZpy
            | UopCode::ModeAbx
            | UopCode::ModeAby
            | UopCode::ModeIdx
            | UopCode::ModeIdy
            | UopCode::ModeInd
            | UopCode::ModeId
            | UopCode::ModeIax => b.addr_mode = Some(i),
            UopCode::PageCrossAbx | UopCode::PageCrossAby | UopCode::PageCrossIdy => {
                b.page_crossing = Some(i)
            }
            UopCode::CheckBcd => b.check_bcd = Some(i),
            UopCode::LoadCarry | UopCode::LoadCarryInv => b.load_carry = Some(i),
            UopCode::SaveCarry | UopCode::SaveCarryInv => b.save_carry = Some(i),
            UopCode::FlagsNzA | UopCode::FlagsNzX | UopCode::FlagsNzY | UopCode::FlagsNzValue => {
                b.nz_flags = Some(i)
            }
            UopCode::WriteInv => b.write_inv = Some(i),
            UopCode::ValueSet => b.value_set = Some(i),
            UopCode::Adc
            | UopCode::Add
            | UopCode::Sbc
            | UopCode::Sub
            | UopCode::RolAcc
            | UopCode::RorAcc
            | UopCode::RolMem
            | UopCode::RorMem
            | UopCode::Lda
            | UopCode::Ldx
            | UopCode::Ldy => b.main_op = Some(i),
            _ => {
                if b.main_op.is_none() {
                    b.main_op = Some(i);
                }
            }
        }
    }
    b
}

/// Mark the μops the host can fold into neighbours.
pub fn rewrite(block: &mut [OpcodeDetails]) {
    for details in block.iter_mut() {
        if details.eliminated {
            continue;
        }
        let breakdown = breakdown_from_6502(details);

        // Fold a carry load into the carry input of the operation that
        // consumes it.
        if let (Some(load), Some(main)) = (breakdown.load_carry, breakdown.main_op) {
            let foldable = matches!(
                details.uops[main].code,
                UopCode::Adc
                    | UopCode::Sbc
                    | UopCode::RolAcc
                    | UopCode::RorAcc
                    | UopCode::RolMem
                    | UopCode::RorMem
            );
            if foldable {
                details.uop_flags[load].eliminated = true;
                details.uop_flags[load].merged = true;
            }
        }

        // Fold an immediate ValueSet into the register load it feeds.
        if let (Some(value_set), Some(main)) = (breakdown.value_set, breakdown.main_op) {
            let foldable = matches!(
                details.uops[main].code,
                UopCode::Lda | UopCode::Ldx | UopCode::Ldy
            ) && value_set < main;
            if foldable {
                details.uop_flags[value_set].eliminated = true;
                details.uop_flags[value_set].merged = true;
            }
        }
    }
}

/// Does this instruction's lowering need the runtime MMIO test?
fn needs_check_special(details: &OpcodeDetails) -> bool {
    for (uop, _) in details.live_uops() {
        match uop.code {
            UopCode::ModeAbs | UopCode::ModeZpg => {
                if Bus::needs_callback(uop.value1 as u16) {
                    return true;
                }
            }
            UopCode::ModeAbx
            | UopCode::ModeAby
            | UopCode::ModeIdx
            | UopCode::ModeIdy
            | UopCode::ModeId
            | UopCode::ModeInd
            | UopCode::ModeIax => return true,
            _ => {}
        }
    }
    false
}

fn lower_uop(
    details: &OpcodeDetails,
    index: usize,
    merged_carry: bool,
    merged_value: Option<u8>,
    out: &mut Vec<HostOp>,
) {
    let uop = &details.uops[index];
    let v1 = uop.value1;
    let op = match uop.code {
        // Addressing and bounce checks are emitted by the canonical
        // prefix, not here.
        UopCode::ModeImm
        | UopCode::ModeZpg
        | UopCode::ModeAbs
        | UopCode::ModeZpx
        | UopCode::ModeZpy
        | UopCode::ModeAbx
        | UopCode::ModeAby
        | UopCode::ModeIdx
        | UopCode::ModeIdy
        | UopCode::ModeInd
        | UopCode::ModeId
        | UopCode::ModeIax
        | UopCode::PageCrossAbx
        | UopCode::PageCrossAby
        | UopCode::PageCrossIdy
        | UopCode::CheckBcd
        | UopCode::Interp => return,

        UopCode::LoadCarry => HostOp::LoadCarry,
        UopCode::LoadCarryInv => HostOp::LoadCarryInv,
        UopCode::SaveCarry => HostOp::SaveCarry,
        UopCode::SaveCarryInv => HostOp::SaveCarryInv,
        UopCode::SaveOverflow => HostOp::SaveOverflow,
        UopCode::FlagsNzA => HostOp::FlagsNzA,
        UopCode::FlagsNzX => HostOp::FlagsNzX,
        UopCode::FlagsNzY => HostOp::FlagsNzY,
        UopCode::FlagsNzValue => HostOp::FlagsNzValue,
        UopCode::ValueSet => HostOp::ValueSet(v1 as u8),

        UopCode::Lda => match merged_value {
            Some(v) => HostOp::LdaConst(v),
            None => HostOp::Lda,
        },
        UopCode::Ldx => match merged_value {
            Some(v) => HostOp::LdxConst(v),
            None => HostOp::Ldx,
        },
        UopCode::Ldy => match merged_value {
            Some(v) => HostOp::LdyConst(v),
            None => HostOp::Ldy,
        },
        UopCode::Sta => HostOp::Sta,
        UopCode::Stx => HostOp::Stx,
        UopCode::Sty => HostOp::Sty,
        UopCode::Ora => HostOp::Ora,
        UopCode::And => HostOp::And,
        UopCode::Eor => HostOp::Eor,
        UopCode::Adc => HostOp::Adc(merged_carry),
        UopCode::Add => HostOp::Add,
        UopCode::Sbc => HostOp::Sbc(merged_carry),
        UopCode::Sub => HostOp::Sub,
        UopCode::Cmp => HostOp::Cmp,
        UopCode::Cpx => HostOp::Cpx,
        UopCode::Cpy => HostOp::Cpy,
        UopCode::BitTest => HostOp::BitTest,
        UopCode::AslAcc => HostOp::AslAcc(v1 as u8),
        UopCode::LsrAcc => HostOp::LsrAcc(v1 as u8),
        UopCode::RolAcc => HostOp::RolAcc(v1 as u8, merged_carry),
        UopCode::RorAcc => HostOp::RorAcc(v1 as u8, merged_carry),
        UopCode::AslMem => HostOp::AslMem,
        UopCode::LsrMem => HostOp::LsrMem,
        UopCode::RolMem => HostOp::RolMem(merged_carry),
        UopCode::RorMem => HostOp::RorMem(merged_carry),
        UopCode::IncMem => HostOp::IncMem,
        UopCode::DecMem => HostOp::DecMem,
        UopCode::WriteInv => HostOp::WriteInv,
        UopCode::Inx => HostOp::Inx,
        UopCode::Iny => HostOp::Iny,
        UopCode::Dex => HostOp::Dex,
        UopCode::Dey => HostOp::Dey,
        UopCode::Tax => HostOp::Tax,
        UopCode::Tay => HostOp::Tay,
        UopCode::Txa => HostOp::Txa,
        UopCode::Tya => HostOp::Tya,
        UopCode::Tsx => HostOp::Tsx,
        UopCode::Txs => HostOp::Txs,
        UopCode::Pha => HostOp::Pha,
        UopCode::Php => HostOp::Php,
        UopCode::Pla => HostOp::Pla,
        UopCode::Clc => HostOp::Clc,
        UopCode::Sec => HostOp::Sec,
        UopCode::Cld => HostOp::Cld,
        UopCode::Sed => HostOp::Sed,
        UopCode::Clv => HostOp::Clv,

        UopCode::Jmp => HostOp::Jmp(v1 as u16),
        UopCode::JmpScratch => HostOp::JmpScratch,
        UopCode::Jsr => HostOp::Jsr(v1 as u16, uop.value2 as u16),
        UopCode::Rts => HostOp::Rts,
        UopCode::BranchEq => HostOp::Branch(Cond::Eq, v1 as u16, uop.value2 as u16),
        UopCode::BranchNe => HostOp::Branch(Cond::Ne, v1 as u16, uop.value2 as u16),
        UopCode::BranchCs => HostOp::Branch(Cond::Cs, v1 as u16, uop.value2 as u16),
        UopCode::BranchCc => HostOp::Branch(Cond::Cc, v1 as u16, uop.value2 as u16),
        UopCode::BranchMi => HostOp::Branch(Cond::Mi, v1 as u16, uop.value2 as u16),
        UopCode::BranchPl => HostOp::Branch(Cond::Pl, v1 as u16, uop.value2 as u16),
        UopCode::BranchVs => HostOp::Branch(Cond::Vs, v1 as u16, uop.value2 as u16),
        UopCode::BranchVc => HostOp::Branch(Cond::Vc, v1 as u16, uop.value2 as u16),
        UopCode::BranchAlways => HostOp::Branch(Cond::Always, v1 as u16, uop.value2 as u16),
    };
    out.push(op);
}

fn lower_mode(uop_code: UopCode, v1: i32, nmos: bool) -> HostOp {
    match uop_code {
        UopCode::ModeImm => HostOp::ModeImm(v1 as u8),
        UopCode::ModeZpg => HostOp::ModeZpg(v1 as u8),
        UopCode::ModeAbs => HostOp::ModeAbs(v1 as u16),
        UopCode::ModeZpx => HostOp::ModeZpx(v1 as u8),
        UopCode::ModeZpy => HostOp::ModeZpy(v1 as u8),
        UopCode::ModeAbx => HostOp::ModeAbx(v1 as u16),
        UopCode::ModeAby => HostOp::ModeAby(v1 as u16),
        UopCode::ModeIdx => HostOp::ModeIdx(v1 as u8),
        UopCode::ModeIdy => HostOp::ModeIdy(v1 as u8),
        UopCode::ModeInd => HostOp::ModeInd(v1 as u16, nmos),
        UopCode::ModeId => HostOp::ModeId(v1 as u8),
        UopCode::ModeIax => HostOp::ModeIax(v1 as u16),
        _ => unreachable!(),
    }
}

fn lower_page_cross(uop_code: UopCode, details: &OpcodeDetails) -> HostOp {
    match uop_code {
        UopCode::PageCrossAbx => HostOp::PageCrossAbx(details.operand),
        UopCode::PageCrossAby => HostOp::PageCrossAby(details.operand),
        UopCode::PageCrossIdy => HostOp::PageCrossIdy,
        _ => unreachable!(),
    }
}

/// Emit the whole block's host operations.
pub fn lower(block: &[OpcodeDetails], nmos: bool, debug: bool) -> Vec<HostOp> {
    let mut out = Vec::new();
    let mut ends_in_control_flow = false;

    for details in block {
        if details.eliminated {
            continue;
        }
        if debug {
            out.push(HostOp::Debug(details.addr));
        }

        // Full-instruction interpreter deferral. An indirect jump whose
        // pointer sits in the MMIO window also defers: the pointer fetch
        // itself is a device access.
        let ind_pointer_in_mmio = details.live_uops().any(|(uop, _)| {
            matches!(uop.code, UopCode::ModeInd | UopCode::ModeIax)
                && (Bus::needs_callback(uop.value1 as u16)
                    || Bus::needs_callback((uop.value1 as u16).wrapping_add(1)))
        });
        if ind_pointer_in_mmio
            || details
                .live_uops()
                .any(|(uop, _)| uop.code == UopCode::Interp)
        {
            out.push(HostOp::InterpBounce(details.addr));
            ends_in_control_flow = true;
            continue;
        }

        // Canonical prefix: addressing, bounce checks, cycle charge.
        for (uop, _) in details.live_uops() {
            if matches!(
                uop.code,
                UopCode::ModeImm
                    | UopCode::ModeZpg
                    | UopCode::ModeAbs
                    | UopCode::ModeZpx
                    | UopCode::ModeZpy
                    | UopCode::ModeAbx
                    | UopCode::ModeAby
                    | UopCode::ModeIdx
                    | UopCode::ModeIdy
                    | UopCode::ModeInd
                    | UopCode::ModeId
                    | UopCode::ModeIax
            ) {
                out.push(lower_mode(uop.code, uop.value1, nmos));
            }
        }
        if needs_check_special(details) {
            out.push(HostOp::CheckSpecial(details.addr));
        }
        if details
            .live_uops()
            .any(|(uop, _)| uop.code == UopCode::CheckBcd)
        {
            out.push(HostOp::CheckBcd(details.addr));
        }
        out.push(HostOp::ChargeCycles(details.cycles()));
        for (uop, _) in details.live_uops() {
            if matches!(
                uop.code,
                UopCode::PageCrossAbx | UopCode::PageCrossAby | UopCode::PageCrossIdy
            ) {
                out.push(lower_page_cross(uop.code, details));
            }
        }

        // The surviving μops in order. A merged carry load marks its
        // consumer; a merged ValueSet feeds its load.
        let merged_carry = details
            .uops
            .iter()
            .zip(details.uop_flags.iter())
            .any(|(uop, flags)| {
                matches!(uop.code, UopCode::LoadCarry | UopCode::LoadCarryInv) && flags.merged
            });
        let merged_value = details
            .uops
            .iter()
            .zip(details.uop_flags.iter())
            .find(|(uop, flags)| uop.code == UopCode::ValueSet && flags.merged)
            .map(|(uop, _)| uop.value1 as u8);

        let mut emitted_control = false;
        for (i, flags) in details.uop_flags.iter().enumerate() {
            if flags.eliminated {
                continue;
            }
            let code = details.uops[i].code;
            if matches!(
                code,
                UopCode::Jmp
                    | UopCode::JmpScratch
                    | UopCode::Jsr
                    | UopCode::Rts
                    | UopCode::BranchEq
                    | UopCode::BranchNe
                    | UopCode::BranchCs
                    | UopCode::BranchCc
                    | UopCode::BranchMi
                    | UopCode::BranchPl
                    | UopCode::BranchVs
                    | UopCode::BranchVc
                    | UopCode::BranchAlways
            ) {
                emitted_control = true;
            }
            lower_uop(details, i, merged_carry, merged_value, &mut out);
        }
        ends_in_control_flow = emitted_control;
    }

    // Fall-through tail: chain to the next address.
    if !ends_in_control_flow {
        let next = block
            .last()
            .map(|d| d.addr.wrapping_add(d.bytes()))
            .unwrap_or(0);
        out.push(HostOp::Jmp(next));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::defs::CpuVariant;
    use crate::jit::decode::decode_block;
    use crate::jit::optimize;
    use crate::mem::AddressSpace;
    use crate::options::Model;

    fn pipeline(program: &[u8]) -> (Vec<OpcodeDetails>, Vec<HostOp>) {
        let mut mem = AddressSpace::new(Model::B);
        for (i, &b) in program.iter().enumerate() {
            mem.write(0x1900 + i as u16, b, 0);
        }
        let mut block = decode_block(&mem, CpuVariant::Nmos, 0x1900);
        optimize::optimize_pre_rewrite(&mut block);
        rewrite(&mut block);
        optimize::optimize_post_rewrite(&mut block);
        let code = lower(&block, true, false);
        (block, code)
    }

    #[test]
    fn breakdown_classifies_slots() {
        let mut mem = AddressSpace::new(Model::B);
        for (i, &b) in [0x7D, 0x00, 0x20, 0x60].iter().enumerate() {
            mem.write(0x1900 + i as u16, b, 0);
        }
        let block = decode_block(&mem, CpuVariant::Nmos, 0x1900);
        let b = breakdown_from_6502(&block[0]);
        assert!(b.addr_mode.is_some());
        assert!(b.page_crossing.is_some());
        assert!(b.check_bcd.is_some());
        assert!(b.load_carry.is_some());
        assert!(b.main_op.is_some());
        assert!(b.save_carry.is_some());
        assert!(b.nz_flags.is_some());
    }

    #[test]
    fn carry_load_merges_into_adc() {
        let (block, code) = pipeline(&[0x69, 0x01, 0x60]);
        let load = block[0].find_uop(UopCode::LoadCarry).unwrap();
        assert!(block[0].uop_flags[load].merged);
        assert!(code.contains(&HostOp::Adc(true)));
        assert!(!code.contains(&HostOp::LoadCarry));
    }

    #[test]
    fn clc_adc_lowers_to_add_without_carry() {
        let (_, code) = pipeline(&[0x18, 0xA9, 0x10, 0x69, 0x20, 0x60]);
        assert!(code.contains(&HostOp::Add));
        assert!(!code.contains(&HostOp::Adc(true)));
        assert!(!code.contains(&HostOp::Adc(false)));
        assert!(!code.contains(&HostOp::LoadCarry));
        // No BCD preflight either: CLC says nothing about D... the D
        // flag is unknown, so the check stays.
        assert!(code.iter().any(|op| matches!(op, HostOp::CheckBcd(_))));
    }

    #[test]
    fn static_ram_address_needs_no_mmio_test() {
        let (_, code) = pipeline(&[0x8D, 0x00, 0x10, 0x60]);
        assert!(!code.iter().any(|op| matches!(op, HostOp::CheckSpecial(_))));
        assert!(code.contains(&HostOp::Sta));
        assert!(code.contains(&HostOp::WriteInv));
    }

    #[test]
    fn dynamic_address_gets_mmio_test_before_cycle_charge() {
        let (_, code) = pipeline(&[0xBD, 0x00, 0x20, 0x60]);
        let check = code
            .iter()
            .position(|op| matches!(op, HostOp::CheckSpecial(_)))
            .unwrap();
        let charge = code
            .iter()
            .position(|op| matches!(op, HostOp::ChargeCycles(_)))
            .unwrap();
        assert!(check < charge);
    }

    #[test]
    fn static_mmio_address_gets_the_test() {
        let (_, code) = pipeline(&[0x8D, 0x4E, 0xFE, 0x60]);
        assert!(code.iter().any(|op| matches!(op, HostOp::CheckSpecial(_))));
    }

    #[test]
    fn block_tail_chains_fall_through() {
        // A block cut by the decoder limit ends in a Jmp to the next pc.
        let mut program = vec![0xEA; crate::jit::decode::MAX_BLOCK_INSTRUCTIONS + 4];
        program.push(0x60);
        let (_, code) = pipeline(&program);
        let expected = 0x1900 + crate::jit::decode::MAX_BLOCK_INSTRUCTIONS as u16;
        assert_eq!(code.last(), Some(&HostOp::Jmp(expected)));
    }

    #[test]
    fn value_set_merges_into_const_load() {
        // LDX #$10; INX; RTS: the INX becomes LdxConst(0x11).
        let (_, code) = pipeline(&[0xA2, 0x10, 0xE8, 0x60]);
        assert!(code.contains(&HostOp::LdxConst(0x11)));
        assert!(!code.contains(&HostOp::ValueSet(0x11)));
    }
}
