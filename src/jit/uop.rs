/*!
uop.rs - The JIT's micro-op intermediate representation.

One source 6502 instruction becomes an `OpcodeDetails` record holding an
ordered μop list. The μop opcodes form a single closed enumeration,
partitioned into ranges - management, addressing, flag plumbing, ALU,
control flow - known to both the optimizer and the backend.

Elimination and merge state deliberately lives in a side-table
(`UopFlags`, parallel to `uops`) rather than inside the μop itself, so
lowering walks `live_uops()` and cannot execute an eliminated μop by
accident.
*/

use crate::cpu::defs::{BranchKind, OpMode, OpType};

/// Cap on μops per source instruction.
pub const MAX_UOPS_PER_OPCODE: usize = 16;

/// Value used in the known-value tags when nothing is known.
pub const VALUE_UNKNOWN: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UopCode {
    // -- Management --
    /// Bounce this instruction (and the rest of the block) to the
    /// interpreter.
    Interp,
    /// Decimal-mode preflight: bounce when the D flag is set.
    CheckBcd,
    /// Post-store code-cache invalidation check.
    WriteInv,

    // -- Addressing --
    ModeImm,
    ModeZpg,
    ModeAbs,
    ModeZpx,
    ModeZpy,
    ModeAbx,
    ModeAby,
    ModeIdx,
    ModeIdy,
    ModeInd,
    ModeId,
    ModeIax,
    PageCrossAbx,
    PageCrossAby,
    PageCrossIdy,

    // -- Flag plumbing --
    LoadCarry,
    LoadCarryInv,
    SaveCarry,
    SaveCarryInv,
    SaveOverflow,
    FlagsNzA,
    FlagsNzX,
    FlagsNzY,
    FlagsNzValue,
    /// Immediate into the value register (feeds replaced loads).
    ValueSet,

    // -- ALU / data movement --
    Lda,
    Ldx,
    Ldy,
    Sta,
    Stx,
    Sty,
    Ora,
    And,
    Eor,
    Adc,
    /// ADC with carry statically known clear.
    Add,
    Sbc,
    /// SBC with carry statically known set.
    Sub,
    Cmp,
    Cpx,
    Cpy,
    BitTest,
    AslAcc,
    AslMem,
    LsrAcc,
    LsrMem,
    RolAcc,
    RolMem,
    RorAcc,
    RorMem,
    IncMem,
    DecMem,
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

    // -- Control flow --
    Jmp,
    JmpScratch,
    Jsr,
    Rts,
    BranchEq,
    BranchNe,
    BranchCs,
    BranchCc,
    BranchMi,
    BranchPl,
    BranchVs,
    BranchVc,
    BranchAlways,
}

/// One μop: opcode plus up to two immediate values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uop {
    pub code: UopCode,
    pub value1: i32,
    pub value2: i32,
}

impl Uop {
    pub fn new(code: UopCode) -> Uop {
        Uop {
            code,
            value1: 0,
            value2: 0,
        }
    }

    pub fn with1(code: UopCode, value1: i32) -> Uop {
        Uop {
            code,
            value1,
            value2: 0,
        }
    }
}

/// Optimizer/backend state for one μop; parallel to `OpcodeDetails::uops`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UopFlags {
    pub eliminated: bool,
    pub merged: bool,
}

/// One decoded source instruction and its μop expansion.
#[derive(Debug, Clone)]
pub struct OpcodeDetails {
    pub addr: u16,
    pub opcode: u8,
    pub operand: u16,
    pub optype: OpType,
    pub opmode: OpMode,
    pub branches: BranchKind,
    pub len_bytes: u16,
    pub max_cycles: u8,

    pub uops: Vec<Uop>,
    pub uop_flags: Vec<UopFlags>,

    /// Whole-instruction elimination (shift merging).
    pub eliminated: bool,
    /// Bytes/cycles folded in from merged successors.
    pub len_bytes_merged: u16,
    pub max_cycles_merged: u8,

    /// Known-value tags computed by the optimizer; VALUE_UNKNOWN when
    /// nothing is statically known at this instruction.
    pub known_a: i32,
    pub known_x: i32,
    pub known_y: i32,
    pub known_carry: i32,
    pub known_decimal: i32,

    pub ends_block: bool,
}

impl OpcodeDetails {
    pub fn new(addr: u16, opcode: u8, optype: OpType, opmode: OpMode) -> OpcodeDetails {
        OpcodeDetails {
            addr,
            opcode,
            operand: 0,
            optype,
            opmode,
            branches: BranchKind::Never,
            len_bytes: 1,
            max_cycles: 0,
            uops: Vec::new(),
            uop_flags: Vec::new(),
            eliminated: false,
            len_bytes_merged: 0,
            max_cycles_merged: 0,
            known_a: VALUE_UNKNOWN,
            known_x: VALUE_UNKNOWN,
            known_y: VALUE_UNKNOWN,
            known_carry: VALUE_UNKNOWN,
            known_decimal: VALUE_UNKNOWN,
            ends_block: false,
        }
    }

    pub fn push(&mut self, uop: Uop) {
        debug_assert!(self.uops.len() < MAX_UOPS_PER_OPCODE);
        self.uops.push(uop);
        self.uop_flags.push(UopFlags::default());
    }

    /// Index of the first μop with the given opcode, eliminated or not.
    pub fn find_uop(&self, code: UopCode) -> Option<usize> {
        let mut found = None;
        for (i, uop) in self.uops.iter().enumerate() {
            if uop.code == code {
                debug_assert!(found.is_none(), "duplicate {:?} in one opcode", code);
                found = Some(i);
            }
        }
        found
    }

    pub fn eliminate_uop(&mut self, index: usize) {
        self.uop_flags[index].eliminated = true;
    }

    pub fn insert_uop(&mut self, index: usize, uop: Uop) {
        self.uops.insert(index, uop);
        self.uop_flags.insert(index, UopFlags::default());
    }

    /// Live (non-eliminated) μops with their flags, in order.
    pub fn live_uops(&self) -> impl Iterator<Item = (&Uop, UopFlags)> {
        self.uops
            .iter()
            .zip(self.uop_flags.iter())
            .filter(|(_, flags)| !flags.eliminated)
            .map(|(uop, flags)| (uop, *flags))
    }

    /// Total cycle cost including merged-in successors.
    pub fn cycles(&self) -> u8 {
        self.max_cycles + self.max_cycles_merged
    }

    /// Total bytes covered including merged-in successors.
    pub fn bytes(&self) -> u16 {
        self.len_bytes + self.len_bytes_merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_uop_and_eliminate() {
        let mut details = OpcodeDetails::new(0x1900, 0x69, OpType::Adc, OpMode::Imm);
        details.push(Uop::with1(UopCode::ModeImm, 0x20));
        details.push(Uop::new(UopCode::LoadCarry));
        details.push(Uop::new(UopCode::Adc));
        details.push(Uop::new(UopCode::FlagsNzA));

        let idx = details.find_uop(UopCode::LoadCarry).unwrap();
        details.eliminate_uop(idx);
        assert!(details.find_uop(UopCode::LoadCarry).is_some());
        let live: Vec<UopCode> = details.live_uops().map(|(u, _)| u.code).collect();
        assert_eq!(
            live,
            vec![UopCode::ModeImm, UopCode::Adc, UopCode::FlagsNzA]
        );
    }

    #[test]
    fn insert_preserves_side_table_alignment() {
        let mut details = OpcodeDetails::new(0, 0xE8, OpType::Inx, OpMode::Nil);
        details.push(Uop::new(UopCode::Inx));
        details.push(Uop::new(UopCode::FlagsNzX));
        details.insert_uop(1, Uop::with1(UopCode::ValueSet, 7));
        assert_eq!(details.uops.len(), details.uop_flags.len());
        assert_eq!(details.uops[1].code, UopCode::ValueSet);
    }
}
