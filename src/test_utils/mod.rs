//! Shared test utilities: machine builders with a known memory layout.
//!
//! Conventions used across the CPU, JIT and peripheral tests:
//! - test programs load at $1900 in main RAM and the reset vector points
//!   there;
//! - the IRQ vector points at $3000 and the NMI vector at $2800, both in
//!   RAM, so tests can poke handlers;
//! - a KIL opcode (0x02) halts the engine, ending a `run`.

#![allow(dead_code)]

use crate::bus::Bus;
use crate::cpu::defs::CpuVariant;
use crate::cpu::interp::Interp;
use crate::cpu::state::Cpu;
use crate::options::Options;

pub const PROGRAM_BASE: u16 = 0x1900;
pub const IRQ_HANDLER: u16 = 0x3000;
pub const NMI_HANDLER: u16 = 0x2800;

/// A 16 KiB OS ROM image holding only the hardware vectors.
pub fn os_image() -> Vec<u8> {
    let mut os = vec![0u8; 0x4000];
    // NMI, RESET, IRQ at FFFA/FFFC/FFFE.
    os[0x3FFA] = (NMI_HANDLER & 0xFF) as u8;
    os[0x3FFB] = (NMI_HANDLER >> 8) as u8;
    os[0x3FFC] = (PROGRAM_BASE & 0xFF) as u8;
    os[0x3FFD] = (PROGRAM_BASE >> 8) as u8;
    os[0x3FFE] = (IRQ_HANDLER & 0xFF) as u8;
    os[0x3FFF] = (IRQ_HANDLER >> 8) as u8;
    os
}

/// A bus with the vector-only OS ROM and `program` loaded at $1900.
///
/// The CRTC gets a standard 64-character line (R0 = 63) so the video
/// timer runs at a realistic cadence instead of the power-on R0 = 0
/// degenerate two-tick period.
pub fn bus_with_program(program: &[u8]) -> Bus {
    let mut bus = Bus::new(&Options::default());
    bus.mem.load_os_rom(&os_image());
    bus.mem.load_ram(PROGRAM_BASE, program);
    let mut countdown = bus.timing.countdown();
    bus.write(0xFE00, 0, 0, &mut countdown);
    bus.write(0xFE01, 63, 0, &mut countdown);
    bus
}

/// Interpreter + CPU + bus, with PC at the program start.
pub fn machine_with_program(program: &[u8]) -> (Interp, Cpu, Bus) {
    let bus = bus_with_program(program);
    let mut cpu = Cpu::new();
    cpu.pc = PROGRAM_BASE;
    (Interp::new(CpuVariant::Nmos), cpu, bus)
}

/// CPU + bus only (for the non-interpreter engines).
pub fn cpu_and_bus(program: &[u8]) -> (Cpu, Bus) {
    let bus = bus_with_program(program);
    let mut cpu = Cpu::new();
    cpu.pc = PROGRAM_BASE;
    (cpu, bus)
}
