/*!
defs.rs - 6502 / 65C12 opcode maps and per-optype metadata.

Pure, read-only data shared by all three engines and the JIT pipeline:
for each of the 256 opcodes, its operation, addressing mode and base
cycle count (page-crossing and branch penalties are applied dynamically
by the engines). The NMOS map covers the documented set plus the common
undocumented opcodes; the 65C12 map is derived from it by patching in
the CMOS additions and demoting the NMOS undocumented set to NOPs.
*/

pub const VECTOR_NMI: u16 = 0xFFFA;
pub const VECTOR_RESET: u16 = 0xFFFC;
pub const VECTOR_IRQ: u16 = 0xFFFE;
pub const STACK_ADDR: u16 = 0x0100;

/// Status flag bit masks.
pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_IRQ_DISABLE: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BRK: u8 = 0x10;
pub const FLAG_ALWAYS_SET: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVariant {
    /// NMOS 6502 (model B).
    Nmos,
    /// 65C12 (Master series).
    Cmos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Kil,
    Brk,
    Ora,
    Asl,
    Php,
    Bpl,
    Clc,
    Jsr,
    And,
    Bit,
    Plp,
    Rol,
    Bmi,
    Sec,
    Rti,
    Eor,
    Lsr,
    Pha,
    Jmp,
    Bvc,
    Cli,
    Rts,
    Adc,
    Pla,
    Ror,
    Bvs,
    Sei,
    Sty,
    Sta,
    Stx,
    Dey,
    Txa,
    Bcc,
    Tya,
    Txs,
    Ldy,
    Lda,
    Ldx,
    Tay,
    Tax,
    Bcs,
    Clv,
    Tsx,
    Cpy,
    Cmp,
    Cpx,
    Dec,
    Iny,
    Dex,
    Bne,
    Cld,
    Sbc,
    Inx,
    Nop,
    Inc,
    Beq,
    Sed,
    // Undocumented NMOS.
    Sax,
    Alr,
    Slo,
    Shy,
    Anc,
    Lax,
    Dcp,
    Sre,
    Rla,
    Ahx,
    Xaa,
    Rra,
    Axs,
    Isc,
    Arr,
    Tas,
    Las,
    Shx,
    // 65C12 additions.
    Tsb,
    Trb,
    Stz,
    Bra,
    Phx,
    Phy,
    Plx,
    Ply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpMode {
    Nil,
    Acc,
    Imm,
    Zpg,
    Abs,
    Zpx,
    Zpy,
    Abx,
    Aby,
    Idx,
    Idy,
    Ind,
    Rel,
    /// 65C12 (abs,X) indirect jump.
    Iax,
    /// 65C12 (zp) without index.
    Id,
}

/// Memory traffic class of an optype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    None,
    Read,
    Write,
    ReadWrite,
}

/// Control-flow class of an optype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Straight-line.
    Never,
    /// Unconditional transfer (JMP/JSR/RTS/RTI/BRK/BRA).
    Always,
    /// Conditional branch.
    Maybe,
}

/// Register receiving the result (and NZ flags) of an optype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegTarget {
    A,
    X,
    Y,
}

use OpMode::*;
use OpType::*;

/// The NMOS opcode matrix: (operation, mode, base cycles) per opcode.
#[rustfmt::skip]
pub const NMOS_OPCODES: [(OpType, OpMode, u8); 256] = [
    // 0x00
    (Brk, Nil, 7), (Ora, Idx, 6), (Kil, Nil, 2), (Slo, Idx, 8),
    (Nop, Zpg, 3), (Ora, Zpg, 3), (Asl, Zpg, 5), (Slo, Zpg, 5),
    (Php, Nil, 3), (Ora, Imm, 2), (Asl, Acc, 2), (Anc, Imm, 2),
    (Nop, Abs, 4), (Ora, Abs, 4), (Asl, Abs, 6), (Slo, Abs, 6),
    // 0x10
    (Bpl, Rel, 2), (Ora, Idy, 5), (Kil, Nil, 2), (Slo, Idy, 8),
    (Nop, Zpx, 4), (Ora, Zpx, 4), (Asl, Zpx, 6), (Slo, Zpx, 6),
    (Clc, Nil, 2), (Ora, Aby, 4), (Nop, Nil, 2), (Slo, Aby, 7),
    (Nop, Abx, 4), (Ora, Abx, 4), (Asl, Abx, 7), (Slo, Abx, 7),
    // 0x20
    (Jsr, Abs, 6), (And, Idx, 6), (Kil, Nil, 2), (Rla, Idx, 8),
    (Bit, Zpg, 3), (And, Zpg, 3), (Rol, Zpg, 5), (Rla, Zpg, 5),
    (Plp, Nil, 4), (And, Imm, 2), (Rol, Acc, 2), (Anc, Imm, 2),
    (Bit, Abs, 4), (And, Abs, 4), (Rol, Abs, 6), (Rla, Abs, 6),
    // 0x30
    (Bmi, Rel, 2), (And, Idy, 5), (Kil, Nil, 2), (Rla, Idy, 8),
    (Nop, Zpx, 4), (And, Zpx, 4), (Rol, Zpx, 6), (Rla, Zpx, 6),
    (Sec, Nil, 2), (And, Aby, 4), (Nop, Nil, 2), (Rla, Aby, 7),
    (Nop, Abx, 4), (And, Abx, 4), (Rol, Abx, 7), (Rla, Abx, 7),
    // 0x40
    (Rti, Nil, 6), (Eor, Idx, 6), (Kil, Nil, 2), (Sre, Idx, 8),
    (Nop, Zpg, 3), (Eor, Zpg, 3), (Lsr, Zpg, 5), (Sre, Zpg, 5),
    (Pha, Nil, 3), (Eor, Imm, 2), (Lsr, Acc, 2), (Alr, Imm, 2),
    (Jmp, Abs, 3), (Eor, Abs, 4), (Lsr, Abs, 6), (Sre, Abs, 6),
    // 0x50
    (Bvc, Rel, 2), (Eor, Idy, 5), (Kil, Nil, 2), (Sre, Idy, 8),
    (Nop, Zpx, 4), (Eor, Zpx, 4), (Lsr, Zpx, 6), (Sre, Zpx, 6),
    (Cli, Nil, 2), (Eor, Aby, 4), (Nop, Nil, 2), (Sre, Aby, 7),
    (Nop, Abx, 4), (Eor, Abx, 4), (Lsr, Abx, 7), (Sre, Abx, 7),
    // 0x60
    (Rts, Nil, 6), (Adc, Idx, 6), (Kil, Nil, 2), (Rra, Idx, 8),
    (Nop, Zpg, 3), (Adc, Zpg, 3), (Ror, Zpg, 5), (Rra, Zpg, 5),
    (Pla, Nil, 4), (Adc, Imm, 2), (Ror, Acc, 2), (Arr, Imm, 2),
    (Jmp, Ind, 5), (Adc, Abs, 4), (Ror, Abs, 6), (Rra, Abs, 6),
    // 0x70
    (Bvs, Rel, 2), (Adc, Idy, 5), (Kil, Nil, 2), (Rra, Idy, 8),
    (Nop, Zpx, 4), (Adc, Zpx, 4), (Ror, Zpx, 6), (Rra, Zpx, 6),
    (Sei, Nil, 2), (Adc, Aby, 4), (Nop, Nil, 2), (Rra, Aby, 7),
    (Nop, Abx, 4), (Adc, Abx, 4), (Ror, Abx, 7), (Rra, Abx, 7),
    // 0x80
    (Nop, Imm, 2), (Sta, Idx, 6), (Nop, Imm, 2), (Sax, Idx, 6),
    (Sty, Zpg, 3), (Sta, Zpg, 3), (Stx, Zpg, 3), (Sax, Zpg, 3),
    (Dey, Nil, 2), (Nop, Imm, 2), (Txa, Nil, 2), (Xaa, Imm, 2),
    (Sty, Abs, 4), (Sta, Abs, 4), (Stx, Abs, 4), (Sax, Abs, 4),
    // 0x90
    (Bcc, Rel, 2), (Sta, Idy, 6), (Kil, Nil, 2), (Ahx, Idy, 6),
    (Sty, Zpx, 4), (Sta, Zpx, 4), (Stx, Zpy, 4), (Sax, Zpy, 4),
    (Tya, Nil, 2), (Sta, Aby, 5), (Txs, Nil, 2), (Tas, Aby, 5),
    (Shy, Abx, 5), (Sta, Abx, 5), (Shx, Aby, 5), (Ahx, Aby, 5),
    // 0xA0
    (Ldy, Imm, 2), (Lda, Idx, 6), (Ldx, Imm, 2), (Lax, Idx, 6),
    (Ldy, Zpg, 3), (Lda, Zpg, 3), (Ldx, Zpg, 3), (Lax, Zpg, 3),
    (Tay, Nil, 2), (Lda, Imm, 2), (Tax, Nil, 2), (Lax, Imm, 2),
    (Ldy, Abs, 4), (Lda, Abs, 4), (Ldx, Abs, 4), (Lax, Abs, 4),
    // 0xB0
    (Bcs, Rel, 2), (Lda, Idy, 5), (Kil, Nil, 2), (Lax, Idy, 5),
    (Ldy, Zpx, 4), (Lda, Zpx, 4), (Ldx, Zpy, 4), (Lax, Zpy, 4),
    (Clv, Nil, 2), (Lda, Aby, 4), (Tsx, Nil, 2), (Las, Aby, 4),
    (Ldy, Abx, 4), (Lda, Abx, 4), (Ldx, Aby, 4), (Lax, Aby, 4),
    // 0xC0
    (Cpy, Imm, 2), (Cmp, Idx, 6), (Nop, Imm, 2), (Dcp, Idx, 8),
    (Cpy, Zpg, 3), (Cmp, Zpg, 3), (Dec, Zpg, 5), (Dcp, Zpg, 5),
    (Iny, Nil, 2), (Cmp, Imm, 2), (Dex, Nil, 2), (Axs, Imm, 2),
    (Cpy, Abs, 4), (Cmp, Abs, 4), (Dec, Abs, 6), (Dcp, Abs, 6),
    // 0xD0
    (Bne, Rel, 2), (Cmp, Idy, 5), (Kil, Nil, 2), (Dcp, Idy, 8),
    (Nop, Zpx, 4), (Cmp, Zpx, 4), (Dec, Zpx, 6), (Dcp, Zpx, 6),
    (Cld, Nil, 2), (Cmp, Aby, 4), (Nop, Nil, 2), (Dcp, Aby, 7),
    (Nop, Abx, 4), (Cmp, Abx, 4), (Dec, Abx, 7), (Dcp, Abx, 7),
    // 0xE0
    (Cpx, Imm, 2), (Sbc, Idx, 6), (Nop, Imm, 2), (Isc, Idx, 8),
    (Cpx, Zpg, 3), (Sbc, Zpg, 3), (Inc, Zpg, 5), (Isc, Zpg, 5),
    (Inx, Nil, 2), (Sbc, Imm, 2), (Nop, Nil, 2), (Sbc, Imm, 2),
    (Cpx, Abs, 4), (Sbc, Abs, 4), (Inc, Abs, 6), (Isc, Abs, 6),
    // 0xF0
    (Beq, Rel, 2), (Sbc, Idy, 5), (Kil, Nil, 2), (Isc, Idy, 8),
    (Nop, Zpx, 4), (Sbc, Zpx, 4), (Inc, Zpx, 6), (Isc, Zpx, 6),
    (Sed, Nil, 2), (Sbc, Aby, 4), (Nop, Nil, 2), (Isc, Aby, 7),
    (Nop, Abx, 4), (Sbc, Abx, 4), (Inc, Abx, 7), (Isc, Abx, 7),
];

/// 65C12 patches over the NMOS matrix.
fn cmos_override(op: u8) -> Option<(OpType, OpMode, u8)> {
    let entry = match op {
        0x04 => (Tsb, Zpg, 5),
        0x0C => (Tsb, Abs, 6),
        0x14 => (Trb, Zpg, 5),
        0x1C => (Trb, Abs, 6),
        0x12 => (Ora, Id, 5),
        0x32 => (And, Id, 5),
        0x52 => (Eor, Id, 5),
        0x72 => (Adc, Id, 5),
        0x92 => (Sta, Id, 5),
        0xB2 => (Lda, Id, 5),
        0xD2 => (Cmp, Id, 5),
        0xF2 => (Sbc, Id, 5),
        0x1A => (Inc, Acc, 2),
        0x3A => (Dec, Acc, 2),
        0x34 => (Bit, Zpx, 4),
        0x3C => (Bit, Abx, 4),
        0x89 => (Bit, Imm, 2),
        0x5A => (Phy, Nil, 3),
        0x7A => (Ply, Nil, 4),
        0xDA => (Phx, Nil, 3),
        0xFA => (Plx, Nil, 4),
        0x64 => (Stz, Zpg, 3),
        0x74 => (Stz, Zpx, 4),
        0x9C => (Stz, Abs, 4),
        0x9E => (Stz, Abx, 5),
        0x6C => (Jmp, Ind, 6),
        0x7C => (Jmp, Iax, 6),
        0x80 => (Bra, Rel, 2),
        _ => return None,
    };
    Some(entry)
}

fn is_nmos_undocumented(optype: OpType) -> bool {
    matches!(
        optype,
        Kil | Sax
            | Alr
            | Slo
            | Shy
            | Anc
            | Lax
            | Dcp
            | Sre
            | Rla
            | Ahx
            | Xaa
            | Rra
            | Axs
            | Isc
            | Arr
            | Tas
            | Las
            | Shx
    )
}

/// Decode one opcode for the given CPU variant.
#[inline]
pub fn decode(variant: CpuVariant, op: u8) -> (OpType, OpMode, u8) {
    let entry = NMOS_OPCODES[op as usize];
    match variant {
        CpuVariant::Nmos => entry,
        CpuVariant::Cmos => {
            if let Some(patched) = cmos_override(op) {
                patched
            } else if is_nmos_undocumented(entry.0) {
                // Undefined on the 65C12: behaves as a NOP of the same
                // column-determined length.
                (Nop, entry.1, entry.2)
            } else {
                entry
            }
        }
    }
}

/// Instruction length in bytes for an addressing mode.
#[inline]
pub fn mode_len(mode: OpMode) -> u16 {
    match mode {
        Nil | Acc => 1,
        Imm | Zpg | Zpx | Zpy | Idx | Idy | Rel | Id => 2,
        Abs | Abx | Aby | Ind | Iax => 3,
    }
}

pub fn mem_kind(optype: OpType) -> MemKind {
    match optype {
        Ora | And | Eor | Adc | Sbc | Cmp | Cpx | Cpy | Bit | Lda | Ldx | Ldy | Lax | Las | Alr
        | Anc | Arr | Axs | Xaa | Nop => MemKind::Read,
        Sta | Stx | Sty | Stz | Sax | Shy | Shx | Ahx | Tas => MemKind::Write,
        Asl | Lsr | Rol | Ror | Inc | Dec | Slo | Sre | Rla | Rra | Dcp | Isc | Tsb | Trb => {
            MemKind::ReadWrite
        }
        _ => MemKind::None,
    }
}

pub fn branch_kind(optype: OpType) -> BranchKind {
    match optype {
        Jmp | Jsr | Rts | Rti | Brk | Bra | Kil => BranchKind::Always,
        Bpl | Bmi | Bvc | Bvs | Bcc | Bcs | Bne | Beq => BranchKind::Maybe,
        _ => BranchKind::Never,
    }
}

/// Register written (and NZ-flagged) by the optype, when the target is a
/// register rather than memory.
pub fn reg_target(optype: OpType) -> Option<RegTarget> {
    match optype {
        Ora | And | Eor | Adc | Sbc | Lda | Txa | Tya | Pla | Alr | Anc | Arr | Xaa | Rra | Slo
        | Sre | Rla | Isc => Some(RegTarget::A),
        Ldx | Tax | Tsx | Inx | Dex | Axs | Plx => Some(RegTarget::X),
        Ldy | Tay | Iny | Dey | Ply => Some(RegTarget::Y),
        _ => None,
    }
}

pub fn uses_carry(optype: OpType) -> bool {
    matches!(optype, Adc | Sbc | Rol | Ror | Rla | Rra | Arr | Isc)
}

pub fn changes_carry(optype: OpType) -> bool {
    matches!(
        optype,
        Adc | Sbc
            | Asl
            | Lsr
            | Rol
            | Ror
            | Cmp
            | Cpx
            | Cpy
            | Clc
            | Sec
            | Plp
            | Rti
            | Slo
            | Sre
            | Rla
            | Rra
            | Dcp
            | Isc
            | Alr
            | Anc
            | Arr
            | Axs
            | Las
    )
}

pub fn changes_overflow(optype: OpType) -> bool {
    matches!(optype, Adc | Sbc | Bit | Clv | Plp | Rti | Rra | Arr | Isc)
}

/// Does this optype use BCD arithmetic when the D flag is set?
pub fn uses_bcd(optype: OpType) -> bool {
    matches!(optype, Adc | Sbc | Arr | Rra | Isc)
}

/// Could executing this optype unmask a pending interrupt?
pub fn may_unmask_irq(optype: OpType) -> bool {
    matches!(optype, Cli | Plp | Rti)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_anchors() {
        assert_eq!(decode(CpuVariant::Nmos, 0xA9), (Lda, Imm, 2));
        assert_eq!(decode(CpuVariant::Nmos, 0x8D), (Sta, Abs, 4));
        assert_eq!(decode(CpuVariant::Nmos, 0x00), (Brk, Nil, 7));
        assert_eq!(decode(CpuVariant::Nmos, 0x6C), (Jmp, Ind, 5));
        assert_eq!(decode(CpuVariant::Nmos, 0xEA), (Nop, Nil, 2));
        assert_eq!(decode(CpuVariant::Nmos, 0x1E), (Asl, Abx, 7));
    }

    #[test]
    fn undocumented_anchors() {
        assert_eq!(decode(CpuVariant::Nmos, 0xA7), (Lax, Zpg, 3));
        assert_eq!(decode(CpuVariant::Nmos, 0xC3), (Dcp, Idx, 8));
        assert_eq!(decode(CpuVariant::Nmos, 0xEB), (Sbc, Imm, 2));
        assert_eq!(decode(CpuVariant::Nmos, 0x02), (Kil, Nil, 2));
    }

    #[test]
    fn cmos_patches_and_demotions() {
        assert_eq!(decode(CpuVariant::Cmos, 0x1A), (Inc, Acc, 2));
        assert_eq!(decode(CpuVariant::Cmos, 0x64), (Stz, Zpg, 3));
        assert_eq!(decode(CpuVariant::Cmos, 0x80), (Bra, Rel, 2));
        assert_eq!(decode(CpuVariant::Cmos, 0x6C), (Jmp, Ind, 6));
        // LAX is not a 65C12 instruction: NOP of the same shape.
        assert_eq!(decode(CpuVariant::Cmos, 0xA7), (Nop, Zpg, 3));
        // Documented opcodes carry over unchanged.
        assert_eq!(decode(CpuVariant::Cmos, 0xA9), (Lda, Imm, 2));
    }

    #[test]
    fn every_opcode_has_consistent_length_metadata() {
        for op in 0..=255u8 {
            for variant in [CpuVariant::Nmos, CpuVariant::Cmos] {
                let (optype, mode, cycles) = decode(variant, op);
                assert!(cycles >= 1 && cycles <= 8, "opcode {op:02X}");
                let len = mode_len(mode);
                assert!((1..=3).contains(&len));
                // Branches are all relative-mode, 2 bytes.
                if branch_kind(optype) == BranchKind::Maybe {
                    assert_eq!(mode, Rel);
                }
            }
        }
    }

    #[test]
    fn rmw_set_is_read_write() {
        for op in [0x06u8, 0x2E, 0x5E, 0xE6, 0xDE] {
            let (optype, _, _) = decode(CpuVariant::Nmos, op);
            assert_eq!(mem_kind(optype), MemKind::ReadWrite);
        }
        assert_eq!(mem_kind(Sta), MemKind::Write);
        assert_eq!(mem_kind(Lda), MemKind::Read);
    }
}
