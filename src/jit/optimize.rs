/*!
optimize.rs - μop optimization passes, pre- and post-backend.

Pre-rewrite (on the freshly decoded list):
1. merge runs of identical accumulator shifts into one μop with a count;
2. tag every instruction with what is statically known about A/X/Y and
   the carry and decimal flags at that point (forward abstract
   interpretation; branches force carry along their fall-through);
3. μop replacement from the tags: CLC;ADC becomes ADD, SEC;SBC becomes
   SUB, register steps with a known source become immediate loads, and
   decimal preflights are dropped once D is known clear or checked.

Post-rewrite (after the backend has marked its merges):
4. dead NZ-flag-save elimination (PHP, branches, and any point where the
   block can fall back to the interpreter force a commit);
5. carry/overflow save/load pair elimination with the same commit
   barriers;
6. dead immediate register load elimination (the Y chain the replacement
   pass creates).

All passes are idempotent: running any of them twice produces the same
list, which the tests pin down.
*/

use crate::cpu::defs::{BranchKind, OpType};
use crate::jit::uop::{OpcodeDetails, Uop, UopCode, VALUE_UNKNOWN};

/// True when this instruction's lowered form can leave the block early
/// (interpreter fallback): any such point must observe committed flags
/// and registers, so the elimination passes treat it as a barrier.
pub fn can_bounce(details: &OpcodeDetails) -> bool {
    for (uop, flags) in details.uops.iter().zip(details.uop_flags.iter()) {
        if flags.eliminated {
            continue;
        }
        match uop.code {
            UopCode::Interp | UopCode::CheckBcd => return true,
            // Static addresses resolve at compile time; dynamic ones need
            // the runtime MMIO test.
            UopCode::ModeAbs | UopCode::ModeZpg => {
                if crate::bus::Bus::needs_callback(uop.value1 as u16) {
                    return true;
                }
            }
            // Zero-page indexed modes wrap within page zero and can
            // never reach the MMIO window; all other dynamic modes need
            // the runtime test.
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

// -----------------------------------------------------------------
// Pass 1: accumulator shift merging
// -----------------------------------------------------------------

fn acc_shift_uop(details: &OpcodeDetails) -> Option<UopCode> {
    if details.opmode != crate::cpu::defs::OpMode::Acc {
        return None;
    }
    match details.optype {
        OpType::Asl => Some(UopCode::AslAcc),
        OpType::Lsr => Some(UopCode::LsrAcc),
        OpType::Rol => Some(UopCode::RolAcc),
        OpType::Ror => Some(UopCode::RorAcc),
        _ => None,
    }
}

fn merge_opcodes(block: &mut [OpcodeDetails]) {
    let mut prev: Option<(usize, UopCode)> = None;

    for i in 0..block.len() {
        if block[i].eliminated {
            continue;
        }
        let Some(shift) = acc_shift_uop(&block[i]) else {
            prev = None;
            continue;
        };

        if let Some((prev_idx, prev_shift)) = prev {
            if prev_shift == shift {
                let uop_idx = block[prev_idx]
                    .find_uop(shift)
                    .expect("merged shift uop present");
                if block[prev_idx].uops[uop_idx].value1 < 7 {
                    block[prev_idx].uops[uop_idx].value1 += 1;
                    let bytes = block[i].len_bytes;
                    let cycles = block[i].max_cycles;
                    block[i].eliminated = true;
                    block[prev_idx].len_bytes_merged += bytes;
                    block[prev_idx].max_cycles_merged += cycles;
                    continue;
                }
            }
        }
        prev = Some((i, shift));
    }
}

// -----------------------------------------------------------------
// Pass 2: known-value tagging
// -----------------------------------------------------------------

fn calculate_known_values(block: &mut [OpcodeDetails]) {
    let mut reg_a = VALUE_UNKNOWN;
    let mut reg_x = VALUE_UNKNOWN;
    let mut reg_y = VALUE_UNKNOWN;
    let mut flag_carry = VALUE_UNKNOWN;
    let mut flag_decimal = VALUE_UNKNOWN;

    for details in block.iter_mut() {
        details.known_a = reg_a;
        details.known_x = reg_x;
        details.known_y = reg_y;
        details.known_carry = flag_carry;
        details.known_decimal = flag_decimal;

        let operand = details.operand as i32;
        match details.optype {
            // A branch constrains carry along its fall-through successor.
            OpType::Clc | OpType::Bcs => flag_carry = 0,
            OpType::Sec | OpType::Bcc => flag_carry = 1,
            OpType::Cld => flag_decimal = 0,
            OpType::Sed => flag_decimal = 1,
            OpType::Lda if details.opmode == crate::cpu::defs::OpMode::Imm => reg_a = operand,
            OpType::Ldx if details.opmode == crate::cpu::defs::OpMode::Imm => reg_x = operand,
            OpType::Ldy if details.opmode == crate::cpu::defs::OpMode::Imm => reg_y = operand,
            OpType::Lda => reg_a = VALUE_UNKNOWN,
            OpType::Ldx => reg_x = VALUE_UNKNOWN,
            OpType::Ldy => reg_y = VALUE_UNKNOWN,
            OpType::Txa => reg_a = reg_x,
            OpType::Tya => reg_a = reg_y,
            OpType::Tax => reg_x = reg_a,
            OpType::Tay => reg_y = reg_a,
            OpType::Inx => {
                if reg_x != VALUE_UNKNOWN {
                    reg_x = (reg_x + 1) & 0xFF;
                }
            }
            OpType::Dex => {
                if reg_x != VALUE_UNKNOWN {
                    reg_x = (reg_x - 1) & 0xFF;
                }
            }
            OpType::Iny => {
                if reg_y != VALUE_UNKNOWN {
                    reg_y = (reg_y + 1) & 0xFF;
                }
            }
            OpType::Dey => {
                if reg_y != VALUE_UNKNOWN {
                    reg_y = (reg_y - 1) & 0xFF;
                }
            }
            optype => {
                match crate::cpu::defs::reg_target(optype) {
                    Some(crate::cpu::defs::RegTarget::A) => reg_a = VALUE_UNKNOWN,
                    Some(crate::cpu::defs::RegTarget::X) => reg_x = VALUE_UNKNOWN,
                    Some(crate::cpu::defs::RegTarget::Y) => reg_y = VALUE_UNKNOWN,
                    None => {}
                }
                if crate::cpu::defs::changes_carry(optype) {
                    flag_carry = VALUE_UNKNOWN;
                }
                // Only CLD/SED touch D in straight-line code; the
                // unmasking instructions that restore it defer to the
                // interpreter and end the block.
            }
        }
    }
}

// -----------------------------------------------------------------
// Pass 3: μop replacement from the tags
// -----------------------------------------------------------------

/// Replace a register-step μop with an immediate load when the result is
/// statically known.
fn replace_with_load(
    details: &mut OpcodeDetails,
    old: UopCode,
    new_load: UopCode,
    value: i32,
) {
    if let Some(idx) = details.find_uop(old) {
        details.uops[idx] = Uop::with1(UopCode::ValueSet, value & 0xFF);
        details.insert_uop(idx + 1, Uop::new(new_load));
    }
}

fn replace_uops(block: &mut [OpcodeDetails]) {
    let mut had_check_bcd = false;

    for details in block.iter_mut() {
        if details.eliminated {
            continue;
        }

        match details.optype {
            OpType::Adc => {
                if details.known_decimal == 0 || had_check_bcd {
                    if let Some(idx) = details.find_uop(UopCode::CheckBcd) {
                        details.eliminate_uop(idx);
                    }
                }
                if details.known_carry == 0 {
                    if let Some(idx) = details.find_uop(UopCode::Adc) {
                        details.uops[idx].code = UopCode::Add;
                    }
                    if let Some(idx) = details.find_uop(UopCode::LoadCarry) {
                        details.eliminate_uop(idx);
                    }
                }
                had_check_bcd = true;
            }
            OpType::Sbc => {
                if details.known_decimal == 0 || had_check_bcd {
                    if let Some(idx) = details.find_uop(UopCode::CheckBcd) {
                        details.eliminate_uop(idx);
                    }
                }
                if details.known_carry == 1 {
                    if let Some(idx) = details.find_uop(UopCode::Sbc) {
                        details.uops[idx].code = UopCode::Sub;
                    }
                    if let Some(idx) = details.find_uop(UopCode::LoadCarryInv) {
                        details.eliminate_uop(idx);
                    }
                }
                had_check_bcd = true;
            }
            OpType::Inx if details.known_x != VALUE_UNKNOWN => {
                let value = details.known_x + 1;
                replace_with_load(details, UopCode::Inx, UopCode::Ldx, value);
            }
            OpType::Dex if details.known_x != VALUE_UNKNOWN => {
                let value = details.known_x - 1;
                replace_with_load(details, UopCode::Dex, UopCode::Ldx, value);
            }
            OpType::Iny if details.known_y != VALUE_UNKNOWN => {
                let value = details.known_y + 1;
                replace_with_load(details, UopCode::Iny, UopCode::Ldy, value);
            }
            OpType::Dey if details.known_y != VALUE_UNKNOWN => {
                let value = details.known_y - 1;
                replace_with_load(details, UopCode::Dey, UopCode::Ldy, value);
            }
            OpType::Tax if details.known_a != VALUE_UNKNOWN => {
                let value = details.known_a;
                replace_with_load(details, UopCode::Tax, UopCode::Ldx, value);
            }
            OpType::Tay if details.known_a != VALUE_UNKNOWN => {
                let value = details.known_a;
                replace_with_load(details, UopCode::Tay, UopCode::Ldy, value);
            }
            OpType::Txa if details.known_x != VALUE_UNKNOWN => {
                let value = details.known_x;
                replace_with_load(details, UopCode::Txa, UopCode::Lda, value);
            }
            OpType::Tya if details.known_y != VALUE_UNKNOWN => {
                let value = details.known_y;
                replace_with_load(details, UopCode::Tya, UopCode::Lda, value);
            }
            _ => {}
        }
    }
}

/// The three passes run before the backend rewrite.
pub fn optimize_pre_rewrite(block: &mut [OpcodeDetails]) {
    // Pass 1: opcode merging (LSR A runs and friends).
    merge_opcodes(block);

    // Pass 2: tag opcodes with known register and flag values.
    calculate_known_values(block);

    // Pass 3: replacements the known state makes possible. The classic
    // is CLC; ADC: with CF known zero the ADC becomes a plain ADD.
    replace_uops(block);
}

// -----------------------------------------------------------------
// Pass 4: NZ flag save elimination
// -----------------------------------------------------------------

fn eliminate_nz_flag_saving(block: &mut [OpcodeDetails]) {
    let mut pending: Option<(usize, usize)> = None;

    for i in 0..block.len() {
        if block[i].eliminated {
            continue;
        }

        // PHP reads the committed flags; any branch or interpreter
        // fallback point must see them committed too.
        if block[i].optype == OpType::Php
            || block[i].branches != BranchKind::Never
            || can_bounce(&block[i])
        {
            pending = None;
        }

        for j in 0..block[i].uops.len() {
            if block[i].uop_flags[j].eliminated {
                continue;
            }
            let code = block[i].uops[j].code;
            let is_nz = matches!(
                code,
                UopCode::FlagsNzA | UopCode::FlagsNzX | UopCode::FlagsNzY | UopCode::FlagsNzValue
            );
            if !is_nz {
                continue;
            }
            // A newer NZ set makes the pending one dead.
            if let Some((pi, pj)) = pending.take() {
                block[pi].uop_flags[pj].eliminated = true;
            }
            // Value-register flags are not tracked for elimination.
            pending = if code == UopCode::FlagsNzValue {
                None
            } else {
                Some((i, j))
            };
        }
    }
}

// -----------------------------------------------------------------
// Pass 5: carry / overflow save elimination
// -----------------------------------------------------------------

fn eliminate_carry_overflow_saving(block: &mut [OpcodeDetails]) {
    // (instruction, uop, opcode) of the save being tracked.
    let mut save_carry: Option<(usize, usize, UopCode)> = None;
    let mut save_overflow: Option<(usize, usize)> = None;

    for i in 0..block.len() {
        if block[i].eliminated {
            continue;
        }

        if block[i].branches != BranchKind::Never
            || block[i].optype == OpType::Php
            || can_bounce(&block[i])
        {
            save_carry = None;
            save_overflow = None;
        }

        let mut had_save_carry = false;
        let mut had_save_overflow = false;

        for j in 0..block[i].uops.len() {
            let flags = block[i].uop_flags[j];
            match block[i].uops[j].code {
                UopCode::LoadCarry | UopCode::LoadCarryInv => {
                    let load_code = block[i].uops[j].code;
                    // Already replaced by ADD/SUB: nothing to pair.
                    if flags.eliminated && !flags.merged {
                        continue;
                    }
                    if !flags.merged {
                        // A save/load pair of matching polarity keeps
                        // the value staged; both sides drop.
                        let pairable = match save_carry {
                            Some((_, _, UopCode::SaveCarry)) => load_code == UopCode::LoadCarry,
                            Some((_, _, UopCode::SaveCarryInv)) => {
                                load_code == UopCode::LoadCarryInv
                            }
                            _ => false,
                        };
                        if pairable {
                            let (si, sj, _) = save_carry.unwrap();
                            block[si].uop_flags[sj].eliminated = true;
                            block[i].uop_flags[j].eliminated = true;
                        }
                    }
                    save_carry = None;
                }
                code @ (UopCode::SaveCarry | UopCode::SaveCarryInv) => {
                    if flags.eliminated {
                        continue;
                    }
                    had_save_carry = true;
                    if let Some((si, sj, _)) = save_carry {
                        block[si].uop_flags[sj].eliminated = true;
                    }
                    save_carry = Some((i, j, code));
                }
                code @ (UopCode::Clc | UopCode::Sec) => {
                    // These write the committed carry directly; they
                    // supersede a tracked save but pair with nothing.
                    if let Some((si, sj, _)) = save_carry {
                        block[si].uop_flags[sj].eliminated = true;
                    }
                    save_carry = Some((i, j, code));
                }
                UopCode::SaveOverflow => {
                    if flags.eliminated {
                        continue;
                    }
                    had_save_overflow = true;
                    if let Some((si, sj)) = save_overflow {
                        block[si].uop_flags[sj].eliminated = true;
                    }
                    save_overflow = Some((i, j));
                }
                UopCode::FlagsNzA
                | UopCode::FlagsNzX
                | UopCode::FlagsNzY
                | UopCode::FlagsNzValue => {
                    // A host test instruction cannot preserve the host
                    // carry/overflow across it.
                    if !flags.eliminated {
                        save_carry = None;
                        save_overflow = None;
                    }
                    if flags.merged {
                        if !had_save_carry {
                            save_carry = None;
                        }
                        if !had_save_overflow {
                            save_overflow = None;
                        }
                    }
                }
                UopCode::Cld | UopCode::Sed => {
                    save_carry = None;
                    save_overflow = None;
                }
                _ => {}
            }
        }
    }
}

/// Carry/overflow pair elimination only drops a save whose staged value
/// survives to the paired load. `Clc`/`Sec` never pair (they write the
/// committed flag), so a tracked `Clc` just blocks elimination.
// -----------------------------------------------------------------
// Pass 6: dead immediate register loads (Y chain)
// -----------------------------------------------------------------

fn eliminate_axy_loads(block: &mut [OpcodeDetails]) {
    let mut load_y: Option<(usize, usize)> = None;

    for i in 0..block.len() {
        if block[i].eliminated {
            continue;
        }
        if block[i].branches != BranchKind::Never || can_bounce(&block[i]) {
            load_y = None;
        }

        let mut is_imm = false;
        for j in 0..block[i].uops.len() {
            let flags = block[i].uop_flags[j];
            match block[i].uops[j].code {
                UopCode::ValueSet => {
                    // A ValueSet folded into its load by the backend
                    // still marks the load immediate.
                    if !flags.eliminated || flags.merged {
                        is_imm = true;
                    }
                }
                UopCode::Ldy => {
                    if flags.eliminated {
                        continue;
                    }
                    // The previous immediate load was never observed.
                    if let Some((pi, pj)) = load_y.take() {
                        block[pi].uop_flags[pj].eliminated = true;
                    }
                    load_y = if is_imm { Some((i, j)) } else { None };
                }
                // Any Y consumer pins the tracked load.
                UopCode::ModeAby
                | UopCode::ModeZpy
                | UopCode::ModeIdy
                | UopCode::PageCrossAby
                | UopCode::PageCrossIdy
                | UopCode::FlagsNzY
                | UopCode::Cpy
                | UopCode::Dey
                | UopCode::Iny
                | UopCode::Sty
                | UopCode::Tya
                | UopCode::Tay => {
                    if !flags.eliminated || flags.merged {
                        load_y = None;
                    }
                }
                _ => {}
            }
        }
    }
}

/// The three passes run after the backend rewrite.
pub fn optimize_post_rewrite(block: &mut [OpcodeDetails]) {
    // Pass 1: NZ flag saving elimination.
    eliminate_nz_flag_saving(block);

    // Pass 2: carry and overflow flag saving elimination.
    eliminate_carry_overflow_saving(block);

    // Pass 3: redundant register set elimination. Comes alive for code
    // that INYs its way along an unrolled run of (zp),Y loads.
    eliminate_axy_loads(block);
}
